//! Probe and shared-state configuration

use std::f32::consts::FRAC_PI_2;

use crate::error::{ProbeError, ProbeResult};
use crate::resources::max_mip_levels;

/// How a convolution stage writes its cubemap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConvolutionPath {
    /// One layered compute dispatch per mip, writing all six faces
    #[default]
    Compute,
    /// Six capture draws per mip through the capture surface
    Raster,
}

/// Sizes and sampling parameters of one light probe
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeConfig {
    /// Prefix for texture and pass labels
    pub name: String,
    /// Environment cubemap face size; the full mip chain is generated
    pub environment_size: u32,
    /// Irradiance cubemap face size (single mip)
    pub irradiance_size: u32,
    /// Prefilter cubemap face size at mip 0
    pub prefilter_size: u32,
    /// Prefilter mip count; mip `M - 1` has roughness 1
    pub prefilter_mip_levels: u32,
    /// Environment mip copied into prefilter mip 0
    pub prefilter_source_mip: u32,
    pub irradiance_path: ConvolutionPath,
    pub prefilter_path: ConvolutionPath,
    /// Hemisphere integration step in radians
    pub irradiance_sample_delta: f32,
    /// GGX importance samples per prefilter texel
    pub prefilter_sample_count: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            name: "probe".to_string(),
            environment_size: 512,
            irradiance_size: 32,
            prefilter_size: 256,
            prefilter_mip_levels: 8,
            prefilter_source_mip: 1,
            irradiance_path: ConvolutionPath::Compute,
            prefilter_path: ConvolutionPath::Compute,
            irradiance_sample_delta: 0.025,
            prefilter_sample_count: 1024,
        }
    }
}

impl ProbeConfig {
    /// Both convolution stages on the same path
    pub fn with_path(mut self, path: ConvolutionPath) -> Self {
        self.irradiance_path = path;
        self.prefilter_path = path;
        self
    }

    /// Mip count of the environment cubemap
    pub fn environment_mip_levels(&self) -> u32 {
        max_mip_levels(self.environment_size, self.environment_size)
    }

    pub fn validate(&self) -> ProbeResult<()> {
        let invalid = |message: String| Err(ProbeError::InvalidConfig(message));

        if self.environment_size == 0 || self.irradiance_size == 0 || self.prefilter_size == 0 {
            return invalid(format!(
                "face sizes must be non-zero (environment {}, irradiance {}, prefilter {})",
                self.environment_size, self.irradiance_size, self.prefilter_size
            ));
        }
        let max_prefilter_mips = max_mip_levels(self.prefilter_size, self.prefilter_size);
        if self.prefilter_mip_levels < 2 || self.prefilter_mip_levels > max_prefilter_mips {
            return invalid(format!(
                "prefilter_mip_levels must be in 2..={max_prefilter_mips} for a {}px prefilter cubemap, got {}",
                self.prefilter_size, self.prefilter_mip_levels
            ));
        }
        if self.prefilter_source_mip >= self.environment_mip_levels() {
            return invalid(format!(
                "prefilter_source_mip {} is outside the {}-level environment chain",
                self.prefilter_source_mip,
                self.environment_mip_levels()
            ));
        }
        let source_size = self.environment_size >> self.prefilter_source_mip;
        if source_size != self.prefilter_size {
            return invalid(format!(
                "prefilter_size {} must equal environment mip {} ({}px) so mip 0 can be copied",
                self.prefilter_size, self.prefilter_source_mip, source_size
            ));
        }
        if !(self.irradiance_sample_delta > 0.0 && self.irradiance_sample_delta < FRAC_PI_2) {
            return invalid(format!(
                "irradiance_sample_delta must be in (0, pi/2), got {}",
                self.irradiance_sample_delta
            ));
        }
        if self.prefilter_sample_count == 0 {
            return invalid("prefilter_sample_count must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Configuration of the state shared by all probes
#[derive(Debug, Clone, PartialEq)]
pub struct SharedConfig {
    /// BRDF LUT width and height
    pub brdf_lut_size: u32,
    /// Importance samples per LUT texel
    pub brdf_sample_count: u32,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            brdf_lut_size: 512,
            brdf_sample_count: 1024,
        }
    }
}

impl SharedConfig {
    pub fn validate(&self) -> ProbeResult<()> {
        if self.brdf_lut_size == 0 || self.brdf_sample_count == 0 {
            return Err(ProbeError::InvalidConfig(format!(
                "BRDF LUT size and sample count must be non-zero, got {} and {}",
                self.brdf_lut_size, self.brdf_sample_count
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ProbeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.environment_mip_levels(), 10);
        assert!(SharedConfig::default().validate().is_ok());
    }

    #[test]
    fn test_source_mip_must_match_prefilter_size() {
        let config = ProbeConfig {
            prefilter_source_mip: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ProbeError::InvalidConfig(_))));

        let config = ProbeConfig {
            prefilter_source_mip: 0,
            prefilter_size: 512,
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let config = ProbeConfig {
            prefilter_source_mip: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_values() {
        let cases = [
            ProbeConfig {
                irradiance_size: 0,
                ..Default::default()
            },
            ProbeConfig {
                prefilter_mip_levels: 1,
                ..Default::default()
            },
            ProbeConfig {
                prefilter_mip_levels: 10,
                ..Default::default()
            },
            ProbeConfig {
                irradiance_sample_delta: 0.0,
                ..Default::default()
            },
            ProbeConfig {
                irradiance_sample_delta: f32::NAN,
                ..Default::default()
            },
            ProbeConfig {
                prefilter_sample_count: 0,
                ..Default::default()
            },
        ];
        for config in cases {
            assert!(config.validate().is_err(), "{config:?}");
        }
    }

    #[test]
    fn test_with_path_sets_both_stages() {
        let config = ProbeConfig::default().with_path(ConvolutionPath::Raster);
        assert_eq!(config.irradiance_path, ConvolutionPath::Raster);
        assert_eq!(config.prefilter_path, ConvolutionPath::Raster);
    }
}
