//! GPU device descriptions.
//!
//! - [`device`]: device info as reported by the engine, selector matching

pub mod device;
