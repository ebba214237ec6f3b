//! Light-probe precomputation
//!
//! A [`LightProbe`] turns an equirectangular HDR panorama into an environment
//! cubemap with a full mip chain, a low-resolution irradiance cubemap and a
//! prefiltered radiance cubemap whose mips map to roughness. [`ProbeShared`] holds
//! what every probe reuses: the linked programs and the BRDF lookup table.

mod builder;
mod config;
pub mod cubemap;
pub mod sh;
pub(crate) mod shared;

pub use builder::{BuildReport, BuildStage, LightProbe, ProbeOutputs};
pub use config::{ConvolutionPath, ProbeConfig, SharedConfig};
pub use sh::ShIrradiance;
pub use shared::{probe_uniform_block, ProbeShared, CUBE_FORMAT, DEPTH_FORMAT, LOCAL_SIZE, LUT_FORMAT};
