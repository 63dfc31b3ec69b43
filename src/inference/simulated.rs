//! In-process stand-in for the `llmodel` shared library.
//!
//! Follows the native contract closely enough to exercise the bridge:
//! factory failures carry errno-like records, handles are opaque addresses,
//! generation runs on the calling thread and honours the token callback's
//! stop signal. Every call is journaled so tests can check ordering
//! (e.g. that `destroy` never overlaps a running prompt).

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::ErrorRecord;
use crate::gpu::device::{DeviceSelector, GpuDevice};
use crate::inference::native::{NativeEngine, PromptOptions, RawModel};

/// Build variants the factory accepts.
pub const BUILD_VARIANTS: &[&str] = &["auto", "default", "avxonly", "cuda", "kompute", "metal"];

/// Embedding width produced by [`SimulatedEngine`] unless overridden.
pub const DEFAULT_EMBEDDING_DIM: usize = 384;

const ENOENT: i32 = 2;
const EINVAL: i32 = 22;

/// One journaled engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Create(usize),
    Destroy(usize),
    PromptStart(usize),
    PromptEnd(usize),
    SetThreadCount(usize, i32),
    Embedding(usize),
    InitGpu(usize, String),
    /// A call arrived for a handle that is not (or no longer) live.
    InvalidHandle(usize),
}

#[derive(Debug)]
struct SimModel {
    path: PathBuf,
    file_len: u64,
    loaded: bool,
    n_ctx: i32,
    threads: i32,
    gpu: Option<GpuDevice>,
    active_prompts: usize,
}

#[derive(Debug, Default)]
struct SimState {
    models: HashMap<usize, SimModel>,
    calls: Vec<EngineCall>,
    search_path: String,
    max_overlap: usize,
}

/// Deterministic engine for tests, benches and builds without `libllmodel`.
pub struct SimulatedEngine {
    state: Mutex<SimState>,
    next_addr: AtomicUsize,
    reply: Option<Vec<String>>,
    token_delay: Duration,
    finish_delay: Duration,
    failure: Option<(usize, ErrorRecord)>,
    devices: Vec<GpuDevice>,
    embedding_dim: usize,
    refuse_load: bool,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedEngine {
    /// Engine that echoes the prompt's words back and has no GPUs.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            next_addr: AtomicUsize::new(0x1000),
            reply: None,
            token_delay: Duration::ZERO,
            finish_delay: Duration::ZERO,
            failure: None,
            devices: Vec::new(),
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            refuse_load: false,
        }
    }

    /// Always answer with these fragments (capped at `n_predict`).
    pub fn with_reply<S: Into<String>>(mut self, fragments: impl IntoIterator<Item = S>) -> Self {
        self.reply = Some(fragments.into_iter().map(Into::into).collect());
        self
    }

    /// Sleep between fragments, simulating decode latency.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Sleep after the last fragment before returning, like a backend
    /// finishing up its evaluation.
    pub fn with_finish_delay(mut self, delay: Duration) -> Self {
        self.finish_delay = delay;
        self
    }

    /// Fail every prompt with `record` after emitting `after_tokens` fragments.
    pub fn with_prompt_failure(mut self, after_tokens: usize, record: ErrorRecord) -> Self {
        self.failure = Some((after_tokens, record));
        self
    }

    pub fn with_devices(mut self, devices: Vec<GpuDevice>) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_embedding_dim(mut self, dim: usize) -> Self {
        self.embedding_dim = dim;
        self
    }

    /// Create handles normally but fail every `load_model`.
    pub fn with_load_failure(mut self) -> Self {
        self.refuse_load = true;
        self
    }

    /// Snapshot of the call journal.
    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().calls.clone()
    }

    /// Number of handles created and not yet destroyed.
    pub fn live_models(&self) -> usize {
        self.state.lock().models.len()
    }

    /// Number of `destroy` calls seen so far.
    pub fn destroy_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, EngineCall::Destroy(_)))
            .count()
    }

    /// Highest number of prompts ever running at once on a single handle.
    pub fn max_prompt_overlap(&self) -> usize {
        self.state.lock().max_overlap
    }

    /// Whether any call hit a dead handle.
    pub fn saw_invalid_handle(&self) -> bool {
        self.state
            .lock()
            .calls
            .iter()
            .any(|c| matches!(c, EngineCall::InvalidHandle(_)))
    }

    /// Run `f` on the live model behind `model`, journaling misuse.
    fn with_model<T>(&self, model: RawModel, default: T, f: impl FnOnce(&mut SimModel) -> T) -> T {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.models.get_mut(&model.addr()) {
            Some(sim) => f(sim),
            None => {
                error!(handle = model.addr(), "Call on invalid model handle");
                state.calls.push(EngineCall::InvalidHandle(model.addr()));
                default
            }
        }
    }

    fn record(&self, call: EngineCall) {
        self.state.lock().calls.push(call);
    }

    fn fragments_for(&self, prompt: &str, limit: usize) -> Vec<String> {
        match &self.reply {
            Some(reply) => reply.iter().take(limit).cloned().collect(),
            None => prompt
                .split_whitespace()
                .take(limit)
                .map(|word| format!("{word} "))
                .collect(),
        }
    }
}

impl NativeEngine for SimulatedEngine {
    fn create(&self, model_path: &Path, build_variant: &str) -> Result<RawModel, ErrorRecord> {
        if !BUILD_VARIANTS.contains(&build_variant) {
            return Err(ErrorRecord::new(
                EINVAL,
                format!("Could not find any implementations for build variant: {build_variant}"),
            ));
        }

        let file_len = match std::fs::metadata(model_path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                return Err(ErrorRecord::new(
                    e.raw_os_error().unwrap_or(ENOENT),
                    format!("Unable to open model file {}: {e}", model_path.display()),
                ))
            }
        };
        if file_len == 0 {
            return Err(ErrorRecord::new(
                EINVAL,
                "Model format not supported (no matching implementation found)",
            ));
        }

        let addr = self.next_addr.fetch_add(0x10, Ordering::Relaxed);
        let handle = RawModel::from_addr(addr).ok_or_else(|| ErrorRecord::new(EINVAL, "null handle"))?;

        let mut state = self.state.lock();
        state.models.insert(
            addr,
            SimModel {
                path: model_path.to_path_buf(),
                file_len,
                loaded: false,
                n_ctx: 0,
                threads: 4,
                gpu: None,
                active_prompts: 0,
            },
        );
        state.calls.push(EngineCall::Create(addr));
        debug!(handle = addr, variant = build_variant, "Simulated model created");
        Ok(handle)
    }

    fn destroy(&self, model: RawModel) {
        let mut state = self.state.lock();
        match state.models.remove(&model.addr()) {
            Some(sim) => {
                if sim.active_prompts > 0 {
                    error!(handle = model.addr(), "Model destroyed while a prompt is running");
                    state.calls.push(EngineCall::InvalidHandle(model.addr()));
                }
                state.calls.push(EngineCall::Destroy(model.addr()));
            }
            None => {
                error!(handle = model.addr(), "Double destroy of model handle");
                state.calls.push(EngineCall::InvalidHandle(model.addr()));
            }
        }
    }

    fn load_model(&self, model: RawModel, model_path: &Path, n_ctx: i32, _n_gpu_layers: i32) -> bool {
        self.with_model(model, false, |sim| {
            if self.refuse_load || n_ctx <= 0 || sim.path != model_path {
                return false;
            }
            sim.n_ctx = n_ctx;
            sim.loaded = true;
            true
        })
    }

    fn is_model_loaded(&self, model: RawModel) -> bool {
        self.with_model(model, false, |sim| sim.loaded)
    }

    fn state_size(&self, model: RawModel) -> u64 {
        self.with_model(model, 0, |sim| sim.n_ctx.max(0) as u64 * 2048 + 4096)
    }

    fn set_thread_count(&self, model: RawModel, n_threads: i32) {
        self.with_model(model, (), |sim| sim.threads = n_threads);
        self.record(EngineCall::SetThreadCount(model.addr(), n_threads));
    }

    fn thread_count(&self, model: RawModel) -> i32 {
        self.with_model(model, 0, |sim| sim.threads)
    }

    fn embedding(&self, model: RawModel, text: &str) -> Result<Vec<f32>, ErrorRecord> {
        let loaded = self.with_model(model, false, |sim| sim.loaded);
        if !loaded {
            return Err(ErrorRecord::new(EINVAL, "Model is not loaded"));
        }
        if text.is_empty() {
            return Err(ErrorRecord::new(EINVAL, "Cannot embed empty text"));
        }
        self.record(EngineCall::Embedding(model.addr()));

        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let mut seed = hasher.finish();

        let mut values: Vec<f32> = (0..self.embedding_dim)
            .map(|_| {
                // xorshift64
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                (seed % 2000) as f32 / 1000.0 - 1.0
            })
            .collect();

        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            values.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(values)
    }

    fn has_gpu_device(&self, model: RawModel) -> bool {
        self.with_model(model, false, |sim| sim.gpu.is_some())
    }

    fn available_gpu_devices(&self, model: RawModel, memory_required: usize) -> Vec<GpuDevice> {
        if !self.with_model(model, false, |_| true) {
            return Vec::new();
        }
        self.devices
            .iter()
            .filter(|d| d.heap_size >= memory_required)
            .cloned()
            .collect()
    }

    fn init_gpu_by_string(&self, model: RawModel, memory_required: usize, device: &str) -> bool {
        let candidates = self.available_gpu_devices(model, memory_required);
        let Some(picked) = DeviceSelector::parse(device).select(&candidates).cloned() else {
            return false;
        };
        self.record(EngineCall::InitGpu(model.addr(), picked.name.clone()));
        self.with_model(model, false, |sim| {
            sim.gpu = Some(picked);
            true
        })
    }

    fn required_memory(&self, model: RawModel, _model_path: &Path, n_ctx: i32, n_gpu_layers: i32) -> usize {
        self.with_model(model, 0, |sim| {
            let kv = n_ctx.max(0) as usize * 16 * 1024;
            let offload = if n_gpu_layers > 0 { sim.file_len as usize } else { 0 };
            kv + offload
        })
    }

    fn prompt(
        &self,
        model: RawModel,
        prompt: &str,
        options: &PromptOptions,
        on_token: &mut dyn FnMut(&str) -> bool,
    ) -> Result<(), ErrorRecord> {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let overlap = match state.models.get_mut(&model.addr()) {
                Some(sim) if sim.loaded => {
                    sim.active_prompts += 1;
                    sim.active_prompts
                }
                Some(_) => return Err(ErrorRecord::new(EINVAL, "Model is not loaded")),
                None => {
                    state.calls.push(EngineCall::InvalidHandle(model.addr()));
                    return Err(ErrorRecord::new(EINVAL, "Invalid model handle"));
                }
            };
            state.max_overlap = state.max_overlap.max(overlap);
            state.calls.push(EngineCall::PromptStart(model.addr()));
        }

        let fragments = self.fragments_for(prompt, options.n_predict.max(0) as usize);
        let fail_at = self
            .failure
            .as_ref()
            .map(|(after, record)| ((*after).min(fragments.len()), record));

        let mut result = Ok(());
        let mut stopped = false;
        for (i, fragment) in fragments.iter().enumerate() {
            if let Some((at, record)) = fail_at {
                if i == at {
                    result = Err(record.clone());
                    break;
                }
            }
            if !self.token_delay.is_zero() {
                std::thread::sleep(self.token_delay);
            }
            if !on_token(fragment) {
                stopped = true;
                break;
            }
        }
        if let Some((at, record)) = fail_at {
            if result.is_ok() && !stopped && at == fragments.len() {
                result = Err(record.clone());
            }
        }
        if !stopped && !self.finish_delay.is_zero() {
            std::thread::sleep(self.finish_delay);
        }

        let mut state = self.state.lock();
        if let Some(sim) = state.models.get_mut(&model.addr()) {
            sim.active_prompts = sim.active_prompts.saturating_sub(1);
        }
        state.calls.push(EngineCall::PromptEnd(model.addr()));
        result
    }

    fn set_implementation_search_path(&self, path: &Path) {
        self.state.lock().search_path = path.display().to_string();
    }

    fn implementation_search_path(&self) -> String {
        self.state.lock().search_path.clone()
    }
}
