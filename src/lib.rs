//! Light Probe - image-based lighting precomputation on wgpu
//!
//! Bakes the inputs of split-sum image-based lighting from an equirectangular HDR
//! panorama:
//! - an environment cubemap with a full mip chain
//! - an irradiance cubemap for diffuse lighting
//! - a prefiltered radiance cubemap, one roughness per mip
//! - a BRDF lookup table shared by every probe
//!
//! # Example
//! ```no_run
//! use light_probe::{LightProbe, ProbeConfig, ProbeShared, SharedConfig, WgpuBackend};
//!
//! let mut backend = WgpuBackend::new_headless().unwrap();
//! let mut shared = ProbeShared::initialize(&mut backend, &SharedConfig::default()).unwrap();
//! let mut probe = LightProbe::from_file(&mut backend, &mut shared, "sky.hdr", ProbeConfig::default()).unwrap();
//! println!("{}", probe.report());
//!
//! probe.destroy(&mut backend);
//! shared.shutdown(&mut backend);
//! ```

pub mod backend;
pub mod error;
pub mod probe;
pub mod resources;

pub use backend::wgpu_backend::WgpuBackend;
pub use backend::{BackendError, BackendResult, GraphicsBackend};
pub use error::{ProbeError, ProbeResult};
pub use probe::{
    BuildReport, BuildStage, ConvolutionPath, LightProbe, ProbeConfig, ProbeOutputs, ProbeShared, SharedConfig,
    ShIrradiance,
};
pub use resources::{CubeFace, HdrImage, ResourceError, ResourceResult, Texture};
