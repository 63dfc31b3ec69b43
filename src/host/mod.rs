//! Dynamic host surface.
//!
//! - [`class`]: The `LLModel` method table, registered once per process
//! - [`object`]: Instances, argument decoding and dispatch

pub mod class;
pub mod object;

pub use class::{ModelClass, CLASS_NAME, MODEL_CLASS};
pub use object::{ConstructOptions, HostObject, HostValue};
