//! The `LLModel` class registered with the host.
//!
//! The method table is built once per process on first use and shared by
//! every [`HostObject`](crate::host::object::HostObject).

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::error::Result;
use crate::host::object::{methods, HostObject, HostValue};

/// A host-callable method.
pub type Method = fn(&HostObject, &[Value]) -> Result<HostValue>;

/// Class name seen by the host.
pub const CLASS_NAME: &str = "LLModel";

/// Method table for [`CLASS_NAME`].
pub struct ModelClass {
    methods: BTreeMap<&'static str, Method>,
}

impl ModelClass {
    fn register() -> Self {
        let entries: [(&'static str, Method); 15] = [
            ("type", methods::model_type),
            ("name", methods::name),
            ("getLibraryPath", methods::library_path),
            ("isModelLoaded", methods::is_model_loaded),
            ("stateSize", methods::state_size),
            ("setThreadCount", methods::set_thread_count),
            ("threadCount", methods::thread_count),
            ("embed", methods::embed),
            ("hasGpuDevice", methods::has_gpu_device),
            ("listGpu", methods::list_gpu),
            ("getGpuDevices", methods::gpu_devices),
            ("initGpuByString", methods::init_gpu_by_string),
            ("memoryNeeded", methods::memory_needed),
            ("prompt", methods::prompt),
            ("dispose", methods::dispose),
        ];
        tracing::debug!(class = CLASS_NAME, methods = entries.len(), "Registering host class");
        Self {
            methods: entries.into_iter().collect(),
        }
    }

    pub fn method(&self, name: &str) -> Option<Method> {
        self.methods.get(name).copied()
    }

    /// Method names in sorted order.
    pub fn method_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.methods.keys().copied()
    }
}

/// The process-wide class definition.
pub static MODEL_CLASS: Lazy<ModelClass> = Lazy::new(ModelClass::register);
