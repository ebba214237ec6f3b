//! Backend abstraction layer
//!
//! Provides the headless command interface the probe pipeline records into, a wgpu
//! implementation, and a recording dummy implementation for GPU-less tests.

pub mod dummy;
pub mod traits;
pub mod types;
pub mod wgpu_backend;

pub use traits::*;
pub use types::*;
