//! GPU resources owned by the render core
//!
//! Textures, named render targets, cached framebuffers, geometry, uniform
//! blocks, shader programs and material instances.

mod framebuffer;
mod geometry;
mod material_instance;
mod render_target;
mod shader;
mod texture;
mod uniform_buffer;

pub use framebuffer::*;
pub use geometry::*;
pub use material_instance::*;
pub use render_target::*;
pub use shader::*;
pub use texture::*;
pub use uniform_buffer::*;
