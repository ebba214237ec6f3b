//! Errors raised by textures, shader programs and render targets

use thiserror::Error;

use crate::backend::{BackendError, TextureFormat};

use super::texture::{CubeFace, TextureKind};

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Texture '{label}' requests {requested} mip levels but at most {max} fit")]
    InvalidMipCount {
        label: String,
        requested: u32,
        max: u32,
    },
    #[error("Texture '{0}' already holds storage; destroy it before allocating again")]
    AlreadyAllocated(String),
    #[error("Texture '{0}' has no GPU storage")]
    NotAllocated(String),
    #[error("Texture '{0}' cannot be sampled")]
    NotSampleable(String),
    #[error("Texture '{label}' is {kind:?}; face {face:?} does not address a layer of it")]
    FaceMismatch {
        label: String,
        kind: TextureKind,
        face: Option<CubeFace>,
    },
    #[error("Texture '{label}' has {levels} mip levels, mip {mip} is out of range")]
    MipOutOfRange { label: String, mip: u32, levels: u32 },
    #[error("Texture '{label}' expected {expected} bytes of texel data, got {actual}")]
    DataSizeMismatch {
        label: String,
        expected: usize,
        actual: usize,
    },
    #[error("Texture '{0}' cannot build mipmaps before every layer of mip 0 is written")]
    BaseLevelIncomplete(String),
    #[error("Cannot copy '{source_label}' mip {source_mip} into '{target_label}' mip {target_mip}: {reason}")]
    CopyMismatch {
        source_label: String,
        source_mip: u32,
        target_label: String,
        target_mip: u32,
        reason: String,
    },
    #[error("No shader source registered for tag '{0}'")]
    UnknownShaderTag(String),
    #[error("Program '{program}' failed to compile: {message}")]
    ShaderCompile { program: String, message: String },
    #[error("Program '{program}' is not a valid stage combination: {reason}")]
    IncompatibleStages { program: String, reason: String },
    #[error("Program '{0}' is already linked")]
    AlreadyLinked(String),
    #[error("Program '{0}' is not linked")]
    NotLinked(String),
    #[error("Program '{0}' is not bound")]
    NotBound(String),
    #[error("Program '{program}' declares no {kind} named '{name}'")]
    UnknownBinding {
        program: String,
        name: String,
        kind: &'static str,
    },
    #[error("Program '{program}' has no resource bound to '{name}'")]
    MissingBinding { program: String, name: String },
    #[error("Storage image '{name}' expects {expected:?}, texture '{label}' is {actual:?}")]
    ImageFormatMismatch {
        name: String,
        label: String,
        expected: TextureFormat,
        actual: TextureFormat,
    },
    #[error("Storage image '{name}' cannot take this binding: {reason}")]
    ImageBindingMismatch { name: String, reason: String },
    #[error("Render target '{0}' has no color attachment")]
    NoColorAttachment(String),
    #[error("Render target '{label}' is incomplete: color {color:?} vs depth {depth:?}")]
    IncompleteTarget {
        label: String,
        color: (u32, u32),
        depth: (u32, u32),
    },
    #[error("Render target '{label}' {attachment} is {actual:?}, program '{program}' expects {expected:?}")]
    TargetFormatMismatch {
        label: String,
        program: String,
        attachment: &'static str,
        expected: Option<TextureFormat>,
        actual: Option<TextureFormat>,
    },
    #[error("Failed to load image {path}: {message}")]
    ImageLoad { path: String, message: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type ResourceResult<T> = Result<T, ResourceError>;
