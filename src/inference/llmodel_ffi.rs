//! FFI bindings to `libllmodel`, the gpt4all backend loader.
//!
//! Linking is handled by build.rs when the `native` feature is enabled; set
//! `LLMODEL_LIB_DIR` to the directory holding the shared library.
//!
//! `llmodel_prompt` callbacks carry no user data, so the sink for the prompt
//! running on the current thread is parked in a thread-local slot for the
//! duration of the call.

use std::cell::Cell;
use std::ffi::{c_char, c_void, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::ptr;

use tracing::{debug, warn};

use crate::error::ErrorRecord;
use crate::gpu::device::GpuDevice;
use crate::inference::native::{FragmentDecoder, NativeEngine, PromptOptions, RawModel};

const EINVAL: i32 = 22;

#[repr(C)]
struct LlmodelError {
    message: *const c_char,
    code: i32,
}

#[repr(C)]
struct LlmodelPromptContext {
    logits: *mut f32,
    logits_size: usize,
    tokens: *mut i32,
    tokens_size: usize,
    n_past: i32,
    n_ctx: i32,
    n_predict: i32,
    top_k: i32,
    top_p: f32,
    min_p: f32,
    temp: f32,
    n_batch: i32,
    repeat_penalty: f32,
    repeat_last_n: i32,
    context_erase: f32,
}

#[repr(C)]
struct LlmodelGpuDevice {
    index: i32,
    device_type: i32,
    heap_size: usize,
    name: *const c_char,
    vendor: *const c_char,
}

type PromptCallback = extern "C" fn(token_id: i32) -> bool;
type ResponseCallback = extern "C" fn(token_id: i32, response: *const c_char) -> bool;
type RecalculateCallback = extern "C" fn(is_recalculating: bool) -> bool;

#[link(name = "llmodel")]
extern "C" {
    fn llmodel_model_create2(
        model_path: *const c_char,
        build_variant: *const c_char,
        error: *mut LlmodelError,
    ) -> *mut c_void;
    fn llmodel_model_destroy(model: *mut c_void);
    fn llmodel_required_mem(model: *mut c_void, model_path: *const c_char, n_ctx: i32, ngl: i32) -> usize;
    fn llmodel_loadModel(model: *mut c_void, model_path: *const c_char, n_ctx: i32, ngl: i32) -> bool;
    fn llmodel_isModelLoaded(model: *mut c_void) -> bool;
    fn llmodel_get_state_size(model: *mut c_void) -> u64;
    fn llmodel_prompt(
        model: *mut c_void,
        prompt: *const c_char,
        prompt_callback: PromptCallback,
        response_callback: ResponseCallback,
        recalculate_callback: RecalculateCallback,
        ctx: *mut LlmodelPromptContext,
    );
    fn llmodel_embedding(model: *mut c_void, text: *const c_char, embedding_size: *mut usize) -> *mut f32;
    fn llmodel_free_embedding(ptr: *mut f32);
    fn llmodel_setThreadCount(model: *mut c_void, n_threads: i32);
    fn llmodel_threadCount(model: *mut c_void) -> i32;
    fn llmodel_set_implementation_search_path(path: *const c_char);
    fn llmodel_get_implementation_search_path() -> *const c_char;
    fn llmodel_available_gpu_devices(
        model: *mut c_void,
        memory_required: usize,
        num_devices: *mut i32,
    ) -> *mut LlmodelGpuDevice;
    fn llmodel_gpu_init_gpu_device_by_string(
        model: *mut c_void,
        memory_required: usize,
        device: *const c_char,
    ) -> bool;
    fn llmodel_has_gpu_device(model: *mut c_void) -> bool;
}

/// Prompt sink reachable from the C callbacks.
struct ActivePrompt<'a> {
    on_token: &'a mut dyn FnMut(&str) -> bool,
    decoder: FragmentDecoder,
    error: Option<ErrorRecord>,
    stopped: bool,
}

thread_local! {
    static ACTIVE_PROMPT: Cell<*mut c_void> = const { Cell::new(ptr::null_mut()) };
}

/// Clears the thread-local slot on every exit path, unwinding included.
struct ActiveSlotGuard {
    previous: *mut c_void,
}

impl ActiveSlotGuard {
    fn install(active: &mut ActivePrompt<'_>) -> Self {
        let ptr = active as *mut ActivePrompt<'_> as *mut c_void;
        Self {
            previous: ACTIVE_PROMPT.with(|slot| slot.replace(ptr)),
        }
    }
}

impl Drop for ActiveSlotGuard {
    fn drop(&mut self) {
        ACTIVE_PROMPT.with(|slot| slot.set(self.previous));
    }
}

/// Run `f` on the prompt installed on this thread. `false` when none is.
fn with_active(f: impl FnOnce(&mut ActivePrompt<'_>) -> bool) -> bool {
    let ptr = ACTIVE_PROMPT.with(|slot| slot.get());
    if ptr.is_null() {
        return false;
    }
    // SAFETY: the pointer was installed by `LlmodelLibrary::prompt` on this
    // thread and stays valid until its guard drops, after `llmodel_prompt`
    // has returned.
    let active = unsafe { &mut *(ptr as *mut ActivePrompt<'_>) };
    f(active)
}

extern "C" fn prompt_callback(_token_id: i32) -> bool {
    catch_unwind(|| with_active(|active| !active.stopped)).unwrap_or(false)
}

extern "C" fn response_callback(token_id: i32, response: *const c_char) -> bool {
    catch_unwind(AssertUnwindSafe(|| {
        with_active(|active| {
            let bytes = if response.is_null() {
                &[][..]
            } else {
                // SAFETY: the engine hands us a NUL-terminated string valid for this call.
                unsafe { CStr::from_ptr(response) }.to_bytes()
            };

            if token_id == -1 {
                active.error = Some(ErrorRecord::new(-1, String::from_utf8_lossy(bytes)));
                return false;
            }

            match active.decoder.push(bytes) {
                Some(text) => {
                    let keep_going = (active.on_token)(&text);
                    active.stopped = !keep_going;
                    keep_going
                }
                None => true,
            }
        })
    }))
    .unwrap_or(false)
}

extern "C" fn recalculate_callback(is_recalculating: bool) -> bool {
    if is_recalculating {
        debug!("Engine is recalculating context");
    }
    catch_unwind(|| with_active(|active| !active.stopped)).unwrap_or(false)
}

/// Copy a possibly-null C string owned by the engine.
fn owned_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    // SAFETY: non-null strings from the engine are NUL-terminated.
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

fn c_string(value: &str, what: &str) -> Result<CString, ErrorRecord> {
    CString::new(value).map_err(|_| ErrorRecord::new(EINVAL, format!("{what} contains a NUL byte")))
}

fn c_path(path: &Path) -> Result<CString, ErrorRecord> {
    let text = path
        .to_str()
        .ok_or_else(|| ErrorRecord::new(EINVAL, format!("path is not valid UTF-8: {}", path.display())))?;
    c_string(text, "path")
}

/// The real engine, backed by `libllmodel`.
#[derive(Debug, Default)]
pub struct LlmodelLibrary;

impl LlmodelLibrary {
    /// Bind to the linked library, optionally pointing it at a directory of
    /// backend implementations first.
    pub fn new(search_path: Option<&Path>) -> Self {
        let library = Self;
        if let Some(path) = search_path {
            library.set_implementation_search_path(path);
        }
        library
    }
}

impl NativeEngine for LlmodelLibrary {
    fn create(&self, model_path: &Path, build_variant: &str) -> Result<RawModel, ErrorRecord> {
        let path = c_path(model_path)?;
        let variant = c_string(build_variant, "build variant")?;
        let mut error = LlmodelError {
            message: ptr::null(),
            code: 0,
        };

        // SAFETY: both strings outlive the call and `error` is a valid out-pointer.
        let raw = unsafe { llmodel_model_create2(path.as_ptr(), variant.as_ptr(), &mut error) };
        RawModel::from_ptr(raw).ok_or_else(|| {
            let message = owned_string(error.message);
            let message = if message.is_empty() {
                format!("Could not create model for {}", model_path.display())
            } else {
                message
            };
            ErrorRecord::new(error.code, message)
        })
    }

    fn destroy(&self, model: RawModel) {
        // SAFETY: called once per handle, with no other call in flight.
        unsafe { llmodel_model_destroy(model.as_ptr()) }
    }

    fn load_model(&self, model: RawModel, model_path: &Path, n_ctx: i32, n_gpu_layers: i32) -> bool {
        match c_path(model_path) {
            // SAFETY: `model` is live and `path` outlives the call.
            Ok(path) => unsafe { llmodel_loadModel(model.as_ptr(), path.as_ptr(), n_ctx, n_gpu_layers) },
            Err(e) => {
                warn!("Cannot load model: {e}");
                false
            }
        }
    }

    fn is_model_loaded(&self, model: RawModel) -> bool {
        unsafe { llmodel_isModelLoaded(model.as_ptr()) }
    }

    fn state_size(&self, model: RawModel) -> u64 {
        unsafe { llmodel_get_state_size(model.as_ptr()) }
    }

    fn set_thread_count(&self, model: RawModel, n_threads: i32) {
        unsafe { llmodel_setThreadCount(model.as_ptr(), n_threads) }
    }

    fn thread_count(&self, model: RawModel) -> i32 {
        unsafe { llmodel_threadCount(model.as_ptr()) }
    }

    fn embedding(&self, model: RawModel, text: &str) -> Result<Vec<f32>, ErrorRecord> {
        let text = c_string(text, "text")?;
        let mut size = 0usize;

        // SAFETY: `text` outlives the call; `size` is a valid out-pointer.
        let data = unsafe { llmodel_embedding(model.as_ptr(), text.as_ptr(), &mut size) };
        if data.is_null() {
            return Err(ErrorRecord::new(-1, "Embedding generation failed"));
        }

        // SAFETY: the engine returned `size` floats at `data`; copied before freeing.
        let values = unsafe { std::slice::from_raw_parts(data, size) }.to_vec();
        unsafe { llmodel_free_embedding(data) };
        Ok(values)
    }

    fn has_gpu_device(&self, model: RawModel) -> bool {
        unsafe { llmodel_has_gpu_device(model.as_ptr()) }
    }

    fn available_gpu_devices(&self, model: RawModel, memory_required: usize) -> Vec<GpuDevice> {
        let mut count = 0i32;
        // SAFETY: `count` is a valid out-pointer. The array is owned by the
        // engine and stays valid until the next call on this thread.
        let devices = unsafe { llmodel_available_gpu_devices(model.as_ptr(), memory_required, &mut count) };
        if devices.is_null() || count <= 0 {
            return Vec::new();
        }

        unsafe { std::slice::from_raw_parts(devices, count as usize) }
            .iter()
            .map(|d| GpuDevice {
                index: d.index,
                device_type: d.device_type,
                heap_size: d.heap_size,
                name: owned_string(d.name),
                vendor: owned_string(d.vendor),
            })
            .collect()
    }

    fn init_gpu_by_string(&self, model: RawModel, memory_required: usize, device: &str) -> bool {
        match c_string(device, "device") {
            Ok(device) => unsafe {
                llmodel_gpu_init_gpu_device_by_string(model.as_ptr(), memory_required, device.as_ptr())
            },
            Err(_) => false,
        }
    }

    fn required_memory(&self, model: RawModel, model_path: &Path, n_ctx: i32, n_gpu_layers: i32) -> usize {
        match c_path(model_path) {
            Ok(path) => unsafe { llmodel_required_mem(model.as_ptr(), path.as_ptr(), n_ctx, n_gpu_layers) },
            Err(_) => 0,
        }
    }

    fn prompt(
        &self,
        model: RawModel,
        prompt: &str,
        options: &PromptOptions,
        on_token: &mut dyn FnMut(&str) -> bool,
    ) -> Result<(), ErrorRecord> {
        let prompt = c_string(prompt, "prompt")?;
        let mut ctx = LlmodelPromptContext {
            logits: ptr::null_mut(),
            logits_size: 0,
            tokens: ptr::null_mut(),
            tokens_size: 0,
            n_past: 0,
            n_ctx: 0,
            n_predict: options.n_predict,
            top_k: options.top_k,
            top_p: options.top_p,
            min_p: options.min_p,
            temp: options.temp,
            n_batch: options.n_batch,
            repeat_penalty: options.repeat_penalty,
            repeat_last_n: options.repeat_last_n,
            context_erase: options.context_erase,
        };

        let mut active = ActivePrompt {
            on_token,
            decoder: FragmentDecoder::new(),
            error: None,
            stopped: false,
        };

        {
            let _slot = ActiveSlotGuard::install(&mut active);
            // SAFETY: `prompt` and `ctx` outlive the call; the callbacks only
            // reach `active` through the slot guarded above.
            unsafe {
                llmodel_prompt(
                    model.as_ptr(),
                    prompt.as_ptr(),
                    prompt_callback,
                    response_callback,
                    recalculate_callback,
                    &mut ctx,
                );
            }
        }

        if let Some(error) = active.error.take() {
            return Err(error);
        }
        if !active.stopped {
            if let Some(rest) = active.decoder.flush() {
                (active.on_token)(&rest);
            }
        }
        Ok(())
    }

    fn set_implementation_search_path(&self, path: &Path) {
        match c_path(path) {
            Ok(path) => unsafe { llmodel_set_implementation_search_path(path.as_ptr()) },
            Err(e) => warn!("Ignoring implementation search path: {e}"),
        }
    }

    fn implementation_search_path(&self) -> String {
        owned_string(unsafe { llmodel_get_implementation_search_path() })
    }
}
