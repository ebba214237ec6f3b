//! Crate-level error type

use std::path::PathBuf;

use thiserror::Error;

use crate::backend::BackendError;
use crate::probe::BuildStage;
use crate::resources::ResourceError;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("Panorama not found: {}", .0.display())]
    MissingPanorama(PathBuf),
    #[error("Panorama '{name}' is {width}x{height}; an equirectangular panorama is twice as wide as it is high")]
    InvalidPanorama { name: String, width: u32, height: u32 },
    #[error("Invalid probe configuration: {0}")]
    InvalidConfig(String),
    #[error("{stage} failed: {source}")]
    StageFailed {
        stage: BuildStage,
        source: Box<ProbeError>,
    },
}

impl ProbeError {
    /// Innermost error, below any stage wrappers
    pub fn root(&self) -> &ProbeError {
        match self {
            ProbeError::StageFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type ProbeResult<T> = Result<T, ProbeError>;
