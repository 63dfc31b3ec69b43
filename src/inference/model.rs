//! The model object handed to the host.
//!
//! [`LlModel`] pairs a [`HandleOwner`] with metadata cached at load time and
//! a [`PromptBridge`]. Metadata getters never touch the handle; everything
//! else goes through the owner and fails with [`Error::NotLoaded`] once the
//! model has been disposed.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::ModelConfig;
use crate::error::{Error, ErrorRecord, Result};
use crate::gpu::device::GpuDevice;
use crate::inference::bridge::{PromptBridge, PromptHandle, PromptRequest};
use crate::inference::handle::HandleOwner;
use crate::inference::model_loader::ModelMetadata;
use crate::inference::native::NativeEngine;

pub struct LlModel {
    owner: Arc<HandleOwner>,
    bridge: PromptBridge,
    metadata: ModelMetadata,
    n_ctx: i32,
    n_gpu_layers: i32,
}

impl LlModel {
    /// Create and load a model.
    ///
    /// Either returns a loaded model or fails with nothing left behind: a
    /// handle created before a later step fails is destroyed on the way out.
    pub fn load(engine: Arc<dyn NativeEngine>, config: &ModelConfig) -> Result<Self> {
        if config.n_ctx < 1 {
            return Err(Error::Validation(format!(
                "n_ctx must be at least 1, got {}",
                config.n_ctx
            )));
        }
        if let Some(threads) = config.threads {
            validate_thread_count(threads)?;
        }

        if let Some(dir) = &config.library_path {
            engine.set_implementation_search_path(dir);
        }
        let metadata = ModelMetadata::resolve(
            &config.model_path,
            &config.build_variant,
            config.model_type.as_deref(),
            engine.implementation_search_path(),
        );

        let owner = Arc::new(HandleOwner::acquire(
            engine,
            &metadata.model_path,
            &metadata.build_variant,
        )?);

        owner.with_handle(|engine, raw| {
            let device = config.device.trim();
            if !device.is_empty() && !device.eq_ignore_ascii_case("cpu") {
                let required = engine.required_memory(
                    raw,
                    &metadata.model_path,
                    config.n_ctx,
                    config.n_gpu_layers,
                );
                if !engine.init_gpu_by_string(raw, required, device) {
                    warn!(device, required, "No matching GPU device, falling back to CPU");
                }
            }

            if !engine.load_model(raw, &metadata.model_path, config.n_ctx, config.n_gpu_layers) {
                return Err(Error::LoadFailure(ErrorRecord::new(
                    -1,
                    format!("Failed to load model at {}", metadata.model_path.display()),
                )));
            }

            if let Some(threads) = config.threads {
                engine.set_thread_count(raw, threads);
            }
            Ok(())
        })?;

        info!(
            name = metadata.name,
            model_type = metadata.model_type,
            build_variant = metadata.build_variant,
            n_ctx = config.n_ctx,
            "Model loaded"
        );

        Ok(Self {
            bridge: PromptBridge::new(owner.clone(), config.max_queued_prompts),
            owner,
            metadata,
            n_ctx: config.n_ctx,
            n_gpu_layers: config.n_gpu_layers,
        })
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn model_type(&self) -> &str {
        &self.metadata.model_type
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn model_path(&self) -> &Path {
        &self.metadata.model_path
    }

    pub fn build_variant(&self) -> &str {
        &self.metadata.build_variant
    }

    /// Backend library search path recorded at load time.
    pub fn library_path(&self) -> &str {
        &self.metadata.library_path
    }

    /// True while the handle is live and the engine reports the weights loaded.
    pub fn is_loaded(&self) -> bool {
        self.owner
            .with_handle(|engine, raw| Ok(engine.is_model_loaded(raw)))
            .unwrap_or(false)
    }

    /// Size in bytes of the model's serialized state.
    pub fn state_size(&self) -> Result<u64> {
        self.owner
            .with_handle(|engine, raw| Ok(engine.state_size(raw)))
    }

    pub fn set_thread_count(&self, n_threads: i32) -> Result<()> {
        validate_thread_count(n_threads)?;
        self.owner.with_handle(|engine, raw| {
            engine.set_thread_count(raw, n_threads);
            Ok(())
        })
    }

    pub fn thread_count(&self) -> Result<i32> {
        self.owner
            .with_handle(|engine, raw| Ok(engine.thread_count(raw)))
    }

    /// Synchronous embedding of `text`.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.is_empty() {
            return Err(Error::Validation("text to embed cannot be empty".into()));
        }
        self.owner.with_handle(|engine, raw| {
            let embedding = engine.embedding(raw, text).map_err(Error::Native)?;
            if embedding.is_empty() {
                return Err(Error::Native(ErrorRecord::new(
                    -1,
                    "engine returned an empty embedding",
                )));
            }
            Ok(embedding)
        })
    }

    /// Whether the model is running on a GPU. `false` is not an error.
    pub fn has_gpu_device(&self) -> Result<bool> {
        self.owner
            .with_handle(|engine, raw| Ok(engine.has_gpu_device(raw)))
    }

    /// Bytes needed to run the model with the load-time context and offload settings.
    pub fn required_memory(&self) -> Result<usize> {
        self.owner.with_handle(|engine, raw| {
            Ok(engine.required_memory(raw, &self.metadata.model_path, self.n_ctx, self.n_gpu_layers))
        })
    }

    /// Devices with enough memory for this model. Empty without GPU support.
    pub fn gpu_devices(&self) -> Result<Vec<GpuDevice>> {
        self.owner.with_handle(|engine, raw| {
            let required =
                engine.required_memory(raw, &self.metadata.model_path, self.n_ctx, self.n_gpu_layers);
            Ok(engine.available_gpu_devices(raw, required))
        })
    }

    /// Names of [`LlModel::gpu_devices`].
    pub fn list_gpus(&self) -> Result<Vec<String>> {
        self.owner.with_handle(|engine, raw| {
            let required =
                engine.required_memory(raw, &self.metadata.model_path, self.n_ctx, self.n_gpu_layers);
            Ok(engine.list_gpus(raw, required))
        })
    }

    /// Bind the model to the device matching `selector`.
    pub fn init_gpu_by_string(&self, selector: &str) -> Result<()> {
        if selector.trim().is_empty() {
            return Err(Error::Validation("device selector cannot be empty".into()));
        }
        self.owner.with_handle(|engine, raw| {
            let required =
                engine.required_memory(raw, &self.metadata.model_path, self.n_ctx, self.n_gpu_layers);
            if engine.init_gpu_by_string(raw, required, selector) {
                info!(device = selector, required, "GPU device initialized");
                return Ok(());
            }
            let available = engine.available_gpu_devices(raw, required).len();
            Err(Error::GpuUnavailable(format!(
                "no device matches {selector:?} ({available} devices with at least {required} bytes free)"
            )))
        })
    }

    /// Queue a prompt; see [`PromptBridge::submit`].
    pub fn prompt(&self, request: PromptRequest) -> Result<PromptHandle> {
        self.bridge.submit(request)
    }

    /// Prompts running or queued on this model.
    pub fn pending_prompts(&self) -> usize {
        self.bridge.pending()
    }

    /// Tear the native handle down.
    ///
    /// Queued prompts finish with `NotLoaded`; a running prompt is waited
    /// for, so this blocks. Returns `false` if the model was already disposed.
    pub fn dispose(&self) -> bool {
        self.bridge.close();
        self.owner.release()
    }

    /// [`LlModel::dispose`] without blocking the async runtime.
    pub async fn close(&self) -> Result<bool> {
        self.bridge.close();
        let owner = self.owner.clone();
        tokio::task::spawn_blocking(move || owner.release())
            .await
            .map_err(|e| Error::Internal(format!("dispose failed: {e}")))
    }
}

impl std::fmt::Debug for LlModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlModel")
            .field("metadata", &self.metadata)
            .field("owner", &self.owner)
            .finish()
    }
}

fn validate_thread_count(n_threads: i32) -> Result<()> {
    if n_threads < 1 {
        return Err(Error::Validation(format!(
            "thread count must be at least 1, got {n_threads}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::stub_devices_laptop;
    use crate::inference::simulated::{EngineCall, SimulatedEngine};

    fn model_file(name: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, b"GGUF fake weights").unwrap();
        (dir, path)
    }

    fn config_for(path: &Path) -> ModelConfig {
        ModelConfig {
            model_path: path.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_load_caches_metadata() {
        let (_dir, path) = model_file("ggml-mpt-7b-chat.bin");
        let engine = Arc::new(SimulatedEngine::new());
        let model = LlModel::load(engine, &config_for(&path)).unwrap();

        assert!(model.is_loaded());
        assert_eq!(model.model_type(), "mpt");
        assert_eq!(model.name(), "ggml-mpt-7b-chat.bin");
        assert_eq!(model.build_variant(), "auto");
    }

    #[test]
    fn test_thread_count_validation_skips_engine() {
        let (_dir, path) = model_file("orca.gguf");
        let engine = Arc::new(SimulatedEngine::new());
        let model = LlModel::load(engine.clone(), &config_for(&path)).unwrap();

        for n in [0, -1, i32::MIN] {
            assert!(matches!(model.set_thread_count(n), Err(Error::Validation(_))));
        }
        assert!(!engine
            .calls()
            .iter()
            .any(|c| matches!(c, EngineCall::SetThreadCount(..))));

        model.set_thread_count(3).unwrap();
        assert_eq!(model.thread_count().unwrap(), 3);
    }

    #[test]
    fn test_load_applies_configured_threads() {
        let (_dir, path) = model_file("orca.gguf");
        let engine = Arc::new(SimulatedEngine::new());
        let config = ModelConfig {
            threads: Some(7),
            ..config_for(&path)
        };
        let model = LlModel::load(engine, &config).unwrap();
        assert_eq!(model.thread_count().unwrap(), 7);
    }

    #[test]
    fn test_invalid_config_never_creates_handle() {
        let (_dir, path) = model_file("orca.gguf");
        let engine = Arc::new(SimulatedEngine::new());
        let config = ModelConfig {
            threads: Some(0),
            ..config_for(&path)
        };
        assert!(matches!(
            LlModel::load(engine.clone(), &config),
            Err(Error::Validation(_))
        ));
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn test_failed_load_destroys_handle() {
        let (_dir, path) = model_file("orca.gguf");
        let engine = Arc::new(SimulatedEngine::new().with_load_failure());
        let err = LlModel::load(engine.clone(), &config_for(&path)).unwrap_err();

        match err {
            Error::LoadFailure(record) => assert!(record.message.contains("orca.gguf")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(engine.live_models(), 0);
        assert_eq!(engine.destroy_count(), 1);
    }

    #[test]
    fn test_dispose_then_calls_fail() {
        let (_dir, path) = model_file("orca.gguf");
        let engine = Arc::new(SimulatedEngine::new());
        let model = LlModel::load(engine.clone(), &config_for(&path)).unwrap();

        assert!(model.dispose());
        assert!(!model.dispose());
        assert!(!model.is_loaded());
        assert_eq!(model.name(), "orca.gguf");
        assert_eq!(model.state_size(), Err(Error::NotLoaded));
        assert_eq!(model.embed("hi"), Err(Error::NotLoaded));
        assert!(matches!(
            model.prompt(PromptRequest::new("hi")),
            Err(Error::NotLoaded)
        ));
        assert!(!engine.saw_invalid_handle());
    }

    #[test]
    fn test_embed_rejects_empty_text() {
        let (_dir, path) = model_file("all-MiniLM-L6-v2.gguf");
        let engine = Arc::new(SimulatedEngine::new().with_embedding_dim(32));
        let model = LlModel::load(engine, &config_for(&path)).unwrap();

        assert!(matches!(model.embed(""), Err(Error::Validation(_))));
        assert_eq!(model.embed("hello").unwrap().len(), 32);
    }

    #[test]
    fn test_gpu_queries_without_gpu_are_negative() {
        let (_dir, path) = model_file("orca.gguf");
        let engine = Arc::new(SimulatedEngine::new());
        let model = LlModel::load(engine, &config_for(&path)).unwrap();

        assert!(!model.has_gpu_device().unwrap());
        assert!(model.list_gpus().unwrap().is_empty());
        assert!(model.gpu_devices().unwrap().is_empty());
        assert!(matches!(
            model.init_gpu_by_string("gpu"),
            Err(Error::GpuUnavailable(_))
        ));
    }

    #[test]
    fn test_init_gpu_by_vendor() {
        let (_dir, path) = model_file("orca.gguf");
        let engine = Arc::new(SimulatedEngine::new().with_devices(stub_devices_laptop()));
        let model = LlModel::load(engine, &config_for(&path)).unwrap();

        assert_eq!(model.list_gpus().unwrap().len(), 2);
        model.init_gpu_by_string("amd").unwrap();
        assert!(model.has_gpu_device().unwrap());
    }

    #[test]
    fn test_load_with_unmatched_device_falls_back_to_cpu() {
        let (_dir, path) = model_file("orca.gguf");
        let engine = Arc::new(SimulatedEngine::new());
        let config = ModelConfig {
            device: "nvidia".to_string(),
            ..config_for(&path)
        };
        let model = LlModel::load(engine, &config).unwrap();
        assert!(model.is_loaded());
        assert!(!model.has_gpu_device().unwrap());
    }

    #[test]
    fn test_library_path_recorded() {
        let (_dir, path) = model_file("orca.gguf");
        let engine = Arc::new(SimulatedEngine::new());
        let config = ModelConfig {
            library_path: Some("/opt/gpt4all/lib".into()),
            ..config_for(&path)
        };
        let model = LlModel::load(engine, &config).unwrap();
        assert_eq!(model.library_path(), "/opt/gpt4all/lib");
    }
}
