//! Host-facing model instances and method dispatch.
//!
//! A [`HostObject`] wraps one [`LlModel`]. Calls arrive by method name with
//! JSON arguments and come back as JSON, except `prompt`, which hands the
//! host a pending [`PromptHandle`] to await.

use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::host::class::{CLASS_NAME, MODEL_CLASS};
use crate::inference::bridge::{PromptHandle, PromptRequest};
use crate::inference::model::LlModel;
use crate::inference::native::{NativeEngine, PromptOptions};

/// Result of a host call.
#[derive(Debug)]
pub enum HostValue {
    /// Plain result, available immediately.
    Value(Value),
    /// A prompt that completes later.
    Pending(PromptHandle),
}

impl HostValue {
    pub fn into_value(self) -> Option<Value> {
        match self {
            HostValue::Value(value) => Some(value),
            HostValue::Pending(_) => None,
        }
    }

    pub fn into_pending(self) -> Option<PromptHandle> {
        match self {
            HostValue::Pending(handle) => Some(handle),
            HostValue::Value(_) => None,
        }
    }
}

impl From<Value> for HostValue {
    fn from(value: Value) -> Self {
        HostValue::Value(value)
    }
}

/// Third constructor argument.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ConstructOptions {
    #[serde(rename = "type")]
    pub model_type: Option<String>,
    pub library_path: Option<PathBuf>,
    pub device: Option<String>,
    pub n_ctx: Option<i32>,
    pub ngl: Option<i32>,
    pub threads: Option<i32>,
    pub max_queued_prompts: Option<usize>,
}

impl ConstructOptions {
    fn apply(self, config: &mut ModelConfig) {
        if let Some(model_type) = self.model_type {
            config.model_type = Some(model_type);
        }
        if let Some(library_path) = self.library_path {
            config.library_path = Some(library_path);
        }
        if let Some(device) = self.device {
            config.device = device;
        }
        if let Some(n_ctx) = self.n_ctx {
            config.n_ctx = n_ctx;
        }
        if let Some(ngl) = self.ngl {
            config.n_gpu_layers = ngl;
        }
        if let Some(threads) = self.threads {
            config.threads = Some(threads);
        }
        if let Some(max) = self.max_queued_prompts {
            config.max_queued_prompts = max;
        }
    }
}

/// One `LLModel` instance as the host sees it.
#[derive(Debug)]
pub struct HostObject {
    model: LlModel,
}

impl HostObject {
    /// `new LLModel(path, buildVariant?, options?)`.
    ///
    /// `defaults` supplies every setting the arguments leave out. Fails
    /// without creating anything when the model cannot be loaded.
    pub fn construct(engine: Arc<dyn NativeEngine>, defaults: &ModelConfig, args: &[Value]) -> Result<Self> {
        let mut config = defaults.clone();
        config.model_path = PathBuf::from(string_arg(CLASS_NAME, args, 0)?);
        if let Some(variant) = optional_arg::<String>(CLASS_NAME, args, 1)? {
            config.build_variant = variant;
        }
        if let Some(options) = optional_arg::<ConstructOptions>(CLASS_NAME, args, 2)? {
            options.apply(&mut config);
        }

        let model = LlModel::load(engine, &config)?;
        Ok(Self { model })
    }

    pub fn model(&self) -> &LlModel {
        &self.model
    }

    /// Dispatch `method` through the class table.
    pub fn call(&self, method: &str, args: &[Value]) -> Result<HostValue> {
        let Some(f) = MODEL_CLASS.method(method) else {
            return Err(Error::UnknownMethod(method.to_string()));
        };
        debug!(method, args = args.len(), "Host call");
        f(self, args)
    }
}

fn string_arg<'a>(method: &str, args: &'a [Value], index: usize) -> Result<&'a str> {
    args.get(index).and_then(Value::as_str).ok_or_else(|| {
        Error::Validation(format!("{method} expects a string as argument {}", index + 1))
    })
}

fn i32_arg(method: &str, args: &[Value], index: usize) -> Result<i32> {
    args.get(index)
        .and_then(Value::as_i64)
        .and_then(|n| i32::try_from(n).ok())
        .ok_or_else(|| Error::Validation(format!("{method} expects an integer as argument {}", index + 1)))
}

/// Missing and `null` arguments are both `None`.
fn optional_arg<T: DeserializeOwned>(method: &str, args: &[Value], index: usize) -> Result<Option<T>> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| Error::Validation(format!("{method} argument {}: {e}", index + 1))),
    }
}

pub(crate) mod methods {
    use super::*;

    pub fn model_type(this: &HostObject, _: &[Value]) -> Result<HostValue> {
        Ok(json!(this.model.model_type()).into())
    }

    pub fn name(this: &HostObject, _: &[Value]) -> Result<HostValue> {
        Ok(json!(this.model.name()).into())
    }

    pub fn library_path(this: &HostObject, _: &[Value]) -> Result<HostValue> {
        Ok(json!(this.model.library_path()).into())
    }

    pub fn is_model_loaded(this: &HostObject, _: &[Value]) -> Result<HostValue> {
        Ok(json!(this.model.is_loaded()).into())
    }

    pub fn state_size(this: &HostObject, _: &[Value]) -> Result<HostValue> {
        Ok(json!(this.model.state_size()?).into())
    }

    pub fn set_thread_count(this: &HostObject, args: &[Value]) -> Result<HostValue> {
        this.model.set_thread_count(i32_arg("setThreadCount", args, 0)?)?;
        Ok(Value::Null.into())
    }

    pub fn thread_count(this: &HostObject, _: &[Value]) -> Result<HostValue> {
        Ok(json!(this.model.thread_count()?).into())
    }

    pub fn embed(this: &HostObject, args: &[Value]) -> Result<HostValue> {
        let embedding = this.model.embed(string_arg("embed", args, 0)?)?;
        Ok(json!(embedding).into())
    }

    pub fn has_gpu_device(this: &HostObject, _: &[Value]) -> Result<HostValue> {
        Ok(json!(this.model.has_gpu_device()?).into())
    }

    pub fn list_gpu(this: &HostObject, _: &[Value]) -> Result<HostValue> {
        Ok(json!(this.model.list_gpus()?).into())
    }

    pub fn gpu_devices(this: &HostObject, _: &[Value]) -> Result<HostValue> {
        let devices = serde_json::to_value(this.model.gpu_devices()?)
            .map_err(|e| Error::Internal(format!("cannot encode devices: {e}")))?;
        Ok(devices.into())
    }

    pub fn init_gpu_by_string(this: &HostObject, args: &[Value]) -> Result<HostValue> {
        this.model
            .init_gpu_by_string(string_arg("initGpuByString", args, 0)?)?;
        Ok(json!(true).into())
    }

    pub fn memory_needed(this: &HostObject, _: &[Value]) -> Result<HostValue> {
        Ok(json!(this.model.required_memory()?).into())
    }

    /// `prompt(text, options?)`; the options object uses `PromptOptions` field names.
    pub fn prompt(this: &HostObject, args: &[Value]) -> Result<HostValue> {
        let text = string_arg("prompt", args, 0)?;
        let options = optional_arg::<PromptOptions>("prompt", args, 1)?.unwrap_or_default();
        let handle = this
            .model
            .prompt(PromptRequest::new(text).with_options(options))?;
        Ok(HostValue::Pending(handle))
    }

    pub fn dispose(this: &HostObject, _: &[Value]) -> Result<HostValue> {
        Ok(json!(this.model.dispose()).into())
    }
}
