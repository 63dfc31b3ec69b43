//! The native engine boundary.
//!
//! [`NativeEngine`] mirrors the `llmodel` C ABI one call per method. Nothing
//! above this trait knows whether it is talking to the real shared library
//! ([`crate::inference::llmodel_ffi::LlmodelLibrary`]) or to the in-process
//! [`crate::inference::simulated::SimulatedEngine`].

use std::ffi::c_void;
use std::path::Path;
use std::ptr::NonNull;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorRecord, Result};
use crate::gpu::device::GpuDevice;

/// Opaque native model handle (`llmodel_model`).
///
/// Address-sized token; never dereferenced on the Rust side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawModel(NonNull<c_void>);

// The engine owns the pointee. The handle is only passed back into engine
// calls, and `HandleOwner` serializes teardown against every user.
unsafe impl Send for RawModel {}
unsafe impl Sync for RawModel {}

impl RawModel {
    /// Wrap a pointer returned by the factory; `None` for null.
    pub fn from_ptr(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// Build a handle from a plain address (used by in-process engines).
    pub fn from_addr(addr: usize) -> Option<Self> {
        Self::from_ptr(addr as *mut c_void)
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.0.as_ptr()
    }

    pub fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }
}

/// Sampling parameters (mirrors `llmodel_prompt_context`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptOptions {
    /// Maximum number of tokens to generate.
    pub n_predict: i32,

    /// Top-k sampling.
    pub top_k: i32,

    /// Nucleus sampling threshold.
    pub top_p: f32,

    /// Min-p sampling threshold.
    pub min_p: f32,

    /// Temperature (0.0 = greedy).
    pub temp: f32,

    /// Prompt processing batch size.
    pub n_batch: i32,

    /// Repetition penalty factor.
    pub repeat_penalty: f32,

    /// Window of recent tokens the repetition penalty looks at.
    pub repeat_last_n: i32,

    /// Fraction of the context to discard when it fills up.
    pub context_erase: f32,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            n_predict: 200,
            top_k: 40,
            top_p: 0.4,
            min_p: 0.0,
            temp: 0.7,
            n_batch: 8,
            repeat_penalty: 1.18,
            repeat_last_n: 64,
            context_erase: 0.5,
        }
    }
}

impl PromptOptions {
    /// Reject parameters the engine would misbehave on.
    pub fn validate(&self) -> Result<()> {
        fn unit(name: &str, value: f32) -> Result<()> {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Validation(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
            Ok(())
        }

        if self.n_predict < 1 {
            return Err(Error::Validation(format!(
                "n_predict must be at least 1, got {}",
                self.n_predict
            )));
        }
        if self.top_k < 1 {
            return Err(Error::Validation(format!(
                "top_k must be at least 1, got {}",
                self.top_k
            )));
        }
        if self.n_batch < 1 {
            return Err(Error::Validation(format!(
                "n_batch must be at least 1, got {}",
                self.n_batch
            )));
        }
        if self.repeat_last_n < 0 {
            return Err(Error::Validation(format!(
                "repeat_last_n must not be negative, got {}",
                self.repeat_last_n
            )));
        }
        if !self.temp.is_finite() || self.temp < 0.0 {
            return Err(Error::Validation(format!(
                "temp must be a non-negative number, got {}",
                self.temp
            )));
        }
        if !self.repeat_penalty.is_finite() || self.repeat_penalty <= 0.0 {
            return Err(Error::Validation(format!(
                "repeat_penalty must be positive, got {}",
                self.repeat_penalty
            )));
        }
        unit("top_p", self.top_p)?;
        unit("min_p", self.min_p)?;
        unit("context_erase", self.context_erase)?;
        Ok(())
    }
}

/// The `llmodel` C ABI as seen by the bridge.
///
/// Implementations must tolerate calls from any thread, but callers uphold
/// the ABI's own rules: `destroy` is invoked exactly once per handle, never
/// concurrently with another call on that handle, and at most one `prompt`
/// runs per handle at a time.
pub trait NativeEngine: Send + Sync + 'static {
    /// `llmodel_model_create2`: instantiate a model implementation for the file.
    fn create(&self, model_path: &Path, build_variant: &str) -> std::result::Result<RawModel, ErrorRecord>;

    /// `llmodel_model_destroy`.
    fn destroy(&self, model: RawModel);

    /// `llmodel_loadModel`: map the weights into memory.
    fn load_model(&self, model: RawModel, model_path: &Path, n_ctx: i32, n_gpu_layers: i32) -> bool;

    /// `llmodel_isModelLoaded`.
    fn is_model_loaded(&self, model: RawModel) -> bool;

    /// `llmodel_get_state_size`.
    fn state_size(&self, model: RawModel) -> u64;

    /// `llmodel_setThreadCount`.
    fn set_thread_count(&self, model: RawModel, n_threads: i32);

    /// `llmodel_threadCount`.
    fn thread_count(&self, model: RawModel) -> i32;

    /// `llmodel_embedding`: fixed-length embedding of `text`.
    fn embedding(&self, model: RawModel, text: &str) -> std::result::Result<Vec<f32>, ErrorRecord>;

    /// `llmodel_has_gpu_device`: whether the model is bound to a GPU.
    fn has_gpu_device(&self, model: RawModel) -> bool;

    /// `llmodel_available_gpu_devices`: devices with enough memory for the model.
    fn available_gpu_devices(&self, model: RawModel, memory_required: usize) -> Vec<GpuDevice>;

    /// Names of [`NativeEngine::available_gpu_devices`].
    fn list_gpus(&self, model: RawModel, memory_required: usize) -> Vec<String> {
        self.available_gpu_devices(model, memory_required)
            .into_iter()
            .map(|device| device.name)
            .collect()
    }

    /// `llmodel_gpu_init_gpu_device_by_string`.
    fn init_gpu_by_string(&self, model: RawModel, memory_required: usize, device: &str) -> bool;

    /// `llmodel_required_mem`: bytes needed to load the model with these settings.
    fn required_memory(&self, model: RawModel, model_path: &Path, n_ctx: i32, n_gpu_layers: i32) -> usize;

    /// `llmodel_prompt`: run generation, calling `on_token` for each fragment
    /// on the calling thread. Returning `false` from `on_token` asks the
    /// engine to stop.
    fn prompt(
        &self,
        model: RawModel,
        prompt: &str,
        options: &PromptOptions,
        on_token: &mut dyn FnMut(&str) -> bool,
    ) -> std::result::Result<(), ErrorRecord>;

    /// `llmodel_set_implementation_search_path`: where backend libraries are looked up.
    fn set_implementation_search_path(&self, path: &Path);

    /// `llmodel_get_implementation_search_path`.
    fn implementation_search_path(&self) -> String;
}

/// Reassembles UTF-8 text from byte fragments.
///
/// Engines emit raw token pieces; a multi-byte character can be split across
/// two of them. Complete characters are released as soon as they are seen,
/// an incomplete tail is held until the next fragment, and invalid bytes are
/// replaced rather than dropped.
#[derive(Debug, Default)]
pub struct FragmentDecoder {
    pending: Vec<u8>,
}

impl FragmentDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment; returns the text that became complete, if any.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        let mut consumed = 0;
        while consumed < self.pending.len() {
            let rest = &self.pending[consumed..];
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    consumed = self.pending.len();
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&rest[..valid_up_to]));
                    match e.error_len() {
                        Some(invalid) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            consumed += valid_up_to + invalid;
                        }
                        // Incomplete trailing sequence: keep it for the next fragment.
                        None => {
                            consumed += valid_up_to;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..consumed);
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// Whatever is still buffered, lossily decoded.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        PromptOptions::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_out_of_range_options() {
        let mut options = PromptOptions::default();
        options.top_p = 1.5;
        assert!(matches!(options.validate(), Err(Error::Validation(_))));

        let mut options = PromptOptions::default();
        options.n_predict = 0;
        assert!(matches!(options.validate(), Err(Error::Validation(_))));

        let mut options = PromptOptions::default();
        options.temp = f32::NAN;
        assert!(matches!(options.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_raw_model_rejects_null() {
        assert!(RawModel::from_ptr(std::ptr::null_mut()).is_none());
        assert_eq!(RawModel::from_addr(0x10).unwrap().addr(), 0x10);
    }

    #[test]
    fn test_partial_options_fill_defaults() {
        let options: PromptOptions = serde_json::from_str(r#"{"temp": 0.0}"#).unwrap();
        assert_eq!(options.temp, 0.0);
        assert_eq!(options.top_k, PromptOptions::default().top_k);
    }

    #[test]
    fn test_decoder_holds_split_character() {
        let mut decoder = FragmentDecoder::new();
        let snowman = "\u{2603}".as_bytes();
        assert_eq!(decoder.push(b"hi "), Some("hi ".to_string()));
        assert_eq!(decoder.push(&snowman[..1]), None);
        assert_eq!(decoder.push(&snowman[1..]), Some("\u{2603}".to_string()));
        assert_eq!(decoder.flush(), None);
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = FragmentDecoder::new();
        assert_eq!(decoder.push(&[0xff, b'a']), Some("\u{fffd}a".to_string()));
        assert_eq!(decoder.push(&[0xe2, 0x98]), None);
        assert_eq!(decoder.flush(), Some("\u{fffd}".to_string()));
    }

    #[test]
    fn test_decoder_keeps_split_character_after_invalid_byte() {
        let mut decoder = FragmentDecoder::new();
        assert_eq!(decoder.push(&[0xff, 0xe2, 0x98]), Some("\u{fffd}".to_string()));
        assert_eq!(decoder.push(&[0x83]), Some("\u{2603}".to_string()));
        assert_eq!(decoder.flush(), None);

        assert_eq!(
            decoder.push(&[b'a', 0xc0, b'b', 0xff, 0xe2]),
            Some("a\u{fffd}b\u{fffd}".to_string())
        );
        assert_eq!(decoder.push(&[0x98, 0x83, b'!']), Some("\u{2603}!".to_string()));
    }
}
