//! Native model access.
//!
//! - [`native`]: The engine trait mirroring the `llmodel` C ABI
//! - [`llmodel_ffi`]: Bindings to the real library (feature `native`)
//! - [`simulated`]: In-process engine for tests and library-less builds
//! - [`handle`]: Single-owner lifecycle of a native handle
//! - [`bridge`]: Async prompt execution with ordered token streaming
//! - [`model`]: The model object exposed to hosts
//! - [`model_loader`]: Metadata resolved at load time

pub mod bridge;
pub mod handle;
#[cfg(feature = "native")]
pub mod llmodel_ffi;
pub mod model;
pub mod model_loader;
pub mod native;
pub mod simulated;

pub use bridge::{Completion, FinishReason, PromptEvent, PromptHandle, PromptRequest, PromptState};
pub use model::LlModel;
pub use native::{NativeEngine, PromptOptions};
