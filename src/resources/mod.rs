//! GPU resources the probe passes are built from
//!
//! Textures with explicit mip chains, HDR panorama images, draw primitives, shader
//! programs with their source library, the capture surface and the mip generator.

mod error;
mod image;
mod mesh;
mod mipmap;
mod render_target;
mod shader;
mod shader_library;
mod texture;

pub use error::*;
pub use self::image::*;
pub use mesh::*;
pub use mipmap::*;
pub use render_target::*;
pub use shader::*;
pub use shader_library::*;
pub use texture::*;
