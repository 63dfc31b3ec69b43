//! llmodel-bridge: safe ownership of `llmodel` native model handles.
//!
//! Wraps the `llmodel` C ABI behind a single-owner handle, runs blocking
//! generation on worker threads with tokens streamed back in order, and
//! exposes the result both as a dynamic host object and as an
//! OpenAI-compatible HTTP API.

pub mod config;
pub mod error;
pub mod gpu;
pub mod host;
pub mod inference;
pub mod metrics;
pub mod server;

use std::path::Path;
use std::sync::Arc;

use inference::native::NativeEngine;

/// The engine this build talks to: `libllmodel` with the `native` feature,
/// otherwise the in-process simulated engine.
pub fn default_engine(library_path: Option<&Path>) -> Arc<dyn NativeEngine> {
    #[cfg(feature = "native")]
    {
        Arc::new(inference::llmodel_ffi::LlmodelLibrary::new(library_path))
    }

    #[cfg(not(feature = "native"))]
    {
        tracing::warn!("Built without the `native` feature, using the simulated engine");
        let engine = inference::simulated::SimulatedEngine::new();
        if let Some(path) = library_path {
            engine.set_implementation_search_path(path);
        }
        Arc::new(engine)
    }
}
