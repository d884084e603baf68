//! Backend abstraction layer
//!
//! Provides the GL-like traits and types that the dummy and wgpu backends implement.

pub mod dummy;
pub mod traits;
pub mod types;
pub mod wgpu_backend;

pub use traits::*;
pub use types::*;
