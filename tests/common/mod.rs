//! Common utilities for GPU integration tests.
//!
//! A [`TestContext`] owns a headless wgpu backend and initialized shared probe state.
//! It returns `None` when the machine has no usable adapter (none at all, or only GL)
//! so tests can skip.

#![allow(dead_code)]

use light_probe::probe::cubemap::face_direction;
use light_probe::{
    ConvolutionPath, CubeFace, HdrImage, LightProbe, ProbeConfig, ProbeShared, SharedConfig, Texture,
    WgpuBackend,
};

pub struct TestContext {
    pub backend: WgpuBackend,
    pub shared: ProbeShared,
}

impl TestContext {
    pub fn new() -> Option<Self> {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut backend = match WgpuBackend::new_headless() {
            Ok(backend) => backend,
            Err(err) => {
                eprintln!("No usable GPU adapter ({err})");
                return None;
            }
        };
        let shared = ProbeShared::initialize(
            &mut backend,
            &SharedConfig {
                brdf_lut_size: 64,
                brdf_sample_count: 256,
            },
        )
        .expect("Failed to initialize shared probe state");
        Some(Self { backend, shared })
    }

    /// Build a probe from `image`, panicking on any failure
    pub fn build(&mut self, image: &HdrImage, config: ProbeConfig) -> LightProbe {
        let mut probe = LightProbe::new(config).expect("invalid probe config");
        probe
            .build_from_image(&mut self.backend, &mut self.shared, image)
            .expect("probe build failed");
        probe
    }

    pub fn read(&mut self, texture: &Texture, face: Option<CubeFace>, mip: u32) -> Vec<[f32; 4]> {
        texture
            .read_texels(&mut self.backend, face, mip)
            .expect("texture readback failed")
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        self.shared.shutdown(&mut self.backend);
    }
}

/// Small probe that still exercises every mip of every stage
pub fn small_config(path: ConvolutionPath) -> ProbeConfig {
    ProbeConfig {
        name: "test probe".to_string(),
        environment_size: 64,
        irradiance_size: 16,
        prefilter_size: 32,
        prefilter_mip_levels: 5,
        prefilter_source_mip: 1,
        irradiance_sample_delta: 0.05,
        prefilter_sample_count: 128,
        ..Default::default()
    }
    .with_path(path)
}

/// Direction through the center of texel `(x, y)` of a `size`-texel face
pub fn texel_direction(face: CubeFace, x: u32, y: u32, size: u32) -> glam::Vec3 {
    let u = (x as f32 + 0.5) / size as f32;
    let v = (y as f32 + 0.5) / size as f32;
    face_direction(face, u, v)
}

pub fn assert_rgb_close(actual: [f32; 4], expected: [f32; 3], tolerance: f32, context: &str) {
    for channel in 0..3 {
        assert!(
            (actual[channel] - expected[channel]).abs() <= tolerance,
            "{context}: got {actual:?}, expected {expected:?} (tolerance {tolerance})"
        );
    }
}
