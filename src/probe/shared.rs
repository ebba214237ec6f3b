//! State shared by every probe: the precomputation programs, the capture cube, the
//! mip generator and the BRDF lookup table.
//!
//! None of it depends on an environment, so one [`ProbeShared`] is initialized at
//! startup, lent to each probe build and shut down explicitly at teardown.

use std::time::Instant;

use crate::backend::*;
use crate::error::ProbeResult;
use crate::resources::{
    DrawPrimitive, Mipmapper, RenderTarget, SamplingParams, ShaderLibrary, ShaderProgram, Texture, TextureSpec,
    UniformBlock, UniformType,
};

use super::builder::{in_stage, BuildReport, BuildStage};
use super::config::SharedConfig;

/// Format of every probe cubemap
pub const CUBE_FORMAT: TextureFormat = TextureFormat::Rgba16Float;
/// Depth format of the capture surface
pub const DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;
/// Format of the BRDF LUT: scale in red, bias in green
pub const LUT_FORMAT: TextureFormat = TextureFormat::Rg16Float;
/// Work group edge of the convolution compute shaders
pub const LOCAL_SIZE: u32 = 16;
/// Formats the shared mipmapper links downsample programs for
pub(crate) const MIPMAP_FORMATS: [TextureFormat; 1] = [CUBE_FORMAT];

/// Mirrors `ProbeUniforms` in `shaders/probe_uniforms.wgsl`
pub fn probe_uniform_block() -> UniformBlock {
    UniformBlock::new(&[
        ("projection", UniformType::Mat4),
        ("view", UniformType::Mat4),
        ("roughness", UniformType::F32),
        ("environment_size", UniformType::F32),
        ("sample_count", UniformType::U32),
        ("sample_delta", UniformType::F32),
        ("face_size", UniformType::U32),
    ])
}

fn capture_program(label: &str, fragment: &str, source: &str, dimension: TextureViewDimension) -> ShaderProgram {
    ShaderProgram::new(label)
        .with_stage(ShaderStage::Vertex, "capture.vertex")
        .with_stage(ShaderStage::Fragment, fragment)
        .with_uniforms(probe_uniform_block())
        .with_texture(source, 1, dimension)
        .with_color_target(CUBE_FORMAT)
        .with_depth(DEPTH_FORMAT)
        .with_vertex_layouts(vec![Vertex::layout()])
}

fn convolution_compute_program(label: &str, compute: &str) -> ShaderProgram {
    ShaderProgram::new(label)
        .with_stage(ShaderStage::Compute, compute)
        .with_uniforms(probe_uniform_block())
        .with_texture("environment_map", 1, TextureViewDimension::Cube)
        .with_image(
            "output_cube",
            3,
            CUBE_FORMAT,
            TextureViewDimension::D2Array,
            StorageTextureAccess::WriteOnly,
        )
}

pub(crate) fn equirect_program() -> ShaderProgram {
    capture_program(
        "equirect to cubemap",
        "equirect_to_cubemap.fragment",
        "equirectangular_map",
        TextureViewDimension::D2,
    )
}

pub(crate) fn irradiance_raster_program() -> ShaderProgram {
    capture_program(
        "irradiance",
        "irradiance.fragment",
        "environment_map",
        TextureViewDimension::Cube,
    )
}

pub(crate) fn irradiance_compute_program() -> ShaderProgram {
    convolution_compute_program("irradiance compute", "irradiance.compute")
}

pub(crate) fn prefilter_raster_program() -> ShaderProgram {
    capture_program(
        "prefilter",
        "prefilter.fragment",
        "environment_map",
        TextureViewDimension::Cube,
    )
}

pub(crate) fn prefilter_compute_program() -> ShaderProgram {
    convolution_compute_program("prefilter compute", "prefilter.compute")
}

pub(crate) fn brdf_program() -> ShaderProgram {
    ShaderProgram::new("brdf lut")
        .with_stage(ShaderStage::Vertex, "fullscreen.vertex")
        .with_stage(ShaderStage::Fragment, "brdf_lut.fragment")
        .with_uniforms(probe_uniform_block())
        .with_color_target(LUT_FORMAT)
}

/// Every program the probe pipeline links, unlinked
pub(crate) fn program_descriptions() -> Vec<ShaderProgram> {
    let mut programs = vec![
        equirect_program(),
        irradiance_raster_program(),
        irradiance_compute_program(),
        prefilter_raster_program(),
        prefilter_compute_program(),
        brdf_program(),
    ];
    programs.extend(Mipmapper::describe(&MIPMAP_FORMATS));
    programs
}

pub struct ProbeShared {
    config: SharedConfig,
    pub(crate) library: ShaderLibrary,
    pub(crate) equirect: ShaderProgram,
    pub(crate) irradiance_raster: ShaderProgram,
    pub(crate) irradiance_compute: ShaderProgram,
    pub(crate) prefilter_raster: ShaderProgram,
    pub(crate) prefilter_compute: ShaderProgram,
    pub(crate) mipmapper: Mipmapper,
    pub(crate) cube: Option<DrawPrimitive>,
    brdf_lut: Option<Texture>,
    report: BuildReport,
}

impl ProbeShared {
    /// Link every precomputation program and render the BRDF LUT.
    /// Anything created before a failure is released again.
    pub fn initialize(backend: &mut dyn GraphicsBackend, config: &SharedConfig) -> ProbeResult<Self> {
        Self::initialize_with_library(backend, config, ShaderLibrary::standard())
    }

    /// Like [`ProbeShared::initialize`], resolving shader tags through `library`
    pub fn initialize_with_library(
        backend: &mut dyn GraphicsBackend,
        config: &SharedConfig,
        library: ShaderLibrary,
    ) -> ProbeResult<Self> {
        config.validate()?;
        let start = Instant::now();

        let mut shared = Self {
            config: config.clone(),
            library,
            equirect: equirect_program(),
            irradiance_raster: irradiance_raster_program(),
            irradiance_compute: irradiance_compute_program(),
            prefilter_raster: prefilter_raster_program(),
            prefilter_compute: prefilter_compute_program(),
            mipmapper: Mipmapper::new(MIPMAP_FORMATS),
            cube: None,
            brdf_lut: None,
            report: BuildReport::default(),
        };
        if let Err(err) = shared.link_all(backend) {
            log::error!("Probe shared state failed to initialize: {err}");
            shared.shutdown(backend);
            return Err(err);
        }

        shared.report.total = start.elapsed();
        log::info!(
            "Probe shared state ready in {:.2?} ({}x{} BRDF LUT)",
            shared.report.total,
            config.brdf_lut_size,
            config.brdf_lut_size
        );
        Ok(shared)
    }

    fn link_all(&mut self, backend: &mut dyn GraphicsBackend) -> ProbeResult<()> {
        for program in [
            &mut self.equirect,
            &mut self.irradiance_raster,
            &mut self.irradiance_compute,
            &mut self.prefilter_raster,
            &mut self.prefilter_compute,
        ] {
            program.link(backend, &self.library)?;
        }
        self.mipmapper.link(backend, &self.library)?;
        self.cube = Some(DrawPrimitive::cube(backend)?);

        let lut_start = Instant::now();
        let lut = self.render_brdf_lut(backend).map_err(in_stage(BuildStage::BrdfLut))?;
        self.brdf_lut = Some(lut);
        backend
            .submit()
            .map_err(|err| in_stage(BuildStage::BrdfLut)(err.into()))?;
        self.report.stages = vec![(BuildStage::BrdfLut, lut_start.elapsed())];
        Ok(())
    }

    fn render_brdf_lut(&self, backend: &mut dyn GraphicsBackend) -> ProbeResult<Texture> {
        let size = self.config.brdf_lut_size;
        let spec = TextureSpec::d2("brdf lut", size, size, LUT_FORMAT).with_sampling(SamplingParams::linear_clamp());
        let mut lut = Texture::create(backend, spec)?;
        let mut program = brdf_program();
        let mut target = RenderTarget::new("brdf lut", None);

        let result = draw_brdf_lut(backend, &self.library, &mut program, &mut target, &mut lut, &self.config);
        program.unbind(backend);
        program.destroy(backend);
        target.destroy(backend);
        match result {
            Ok(()) => Ok(lut),
            Err(err) => {
                lut.destroy(backend);
                Err(err)
            }
        }
    }

    /// Split-sum scale/bias over (NdotV, roughness), clamped at the domain edges
    pub fn brdf_lut(&self) -> Option<&Texture> {
        self.brdf_lut.as_ref()
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// Time spent rendering the BRDF LUT, and initializing overall
    pub fn report(&self) -> &BuildReport {
        &self.report
    }

    pub fn library(&self) -> &ShaderLibrary {
        &self.library
    }

    pub fn is_initialized(&self) -> bool {
        self.cube.is_some() && self.brdf_lut.is_some()
    }

    /// Release every program, the cube mesh and the LUT. Safe to call repeatedly.
    pub fn shutdown(&mut self, backend: &mut dyn GraphicsBackend) {
        for program in [
            &mut self.equirect,
            &mut self.irradiance_raster,
            &mut self.irradiance_compute,
            &mut self.prefilter_raster,
            &mut self.prefilter_compute,
        ] {
            program.destroy(backend);
        }
        self.mipmapper.destroy(backend);
        if let Some(cube) = self.cube.take() {
            cube.destroy(backend);
        }
        if let Some(mut lut) = self.brdf_lut.take() {
            lut.destroy(backend);
        }
        log::debug!("Probe shared state shut down");
    }
}

impl Drop for ProbeShared {
    fn drop(&mut self) {
        if self.cube.is_some() || self.brdf_lut.is_some() {
            log::warn!("Probe shared state dropped without shutdown()");
        }
    }
}

fn draw_brdf_lut(
    backend: &mut dyn GraphicsBackend,
    library: &ShaderLibrary,
    program: &mut ShaderProgram,
    target: &mut RenderTarget,
    lut: &mut Texture,
    config: &SharedConfig,
) -> ProbeResult<()> {
    program.link(backend, library)?;
    program.bind()?;
    program.set_uniform("sample_count", config.brdf_sample_count);
    target.attach_color(backend, lut, None, 0)?;
    program.draw(backend, target, &DrawPrimitive::fullscreen_triangle(), Some([0.0; 4]))?;
    target.detach_color();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{DummyBackend, DummyCommand, FailPoint};
    use crate::error::ProbeError;
    use crate::resources::{ProgramState, ResourceError};

    fn small() -> SharedConfig {
        SharedConfig {
            brdf_lut_size: 32,
            brdf_sample_count: 64,
        }
    }

    #[test]
    fn test_initialize_renders_lut_once() {
        let mut backend = DummyBackend::new();
        let mut shared = ProbeShared::initialize(&mut backend, &small()).unwrap();
        assert!(shared.is_initialized());
        assert_eq!(shared.equirect.state(), ProgramState::Linked);

        let passes: Vec<&Option<String>> = backend
            .commands()
            .iter()
            .filter_map(|c| match c {
                DummyCommand::BeginRenderPass { label, .. } => Some(label),
                _ => None,
            })
            .collect();
        assert_eq!(passes.len(), 1);
        assert!(passes[0].as_deref().is_some_and(|l| l.starts_with("brdf lut")));

        let lut = shared.brdf_lut().unwrap();
        assert_eq!(lut.format(), LUT_FORMAT);
        assert_eq!((lut.width(), lut.height()), (32, 32));
        let sampler = backend.sampler_descriptor(lut.sampler().unwrap()).unwrap();
        assert_eq!(sampler.address_mode_u, AddressMode::ClampToEdge);
        assert_eq!(sampler.address_mode_v, AddressMode::ClampToEdge);
        assert_eq!(sampler.mag_filter, FilterMode::Linear);

        let report = shared.report();
        assert_eq!(report.stages.len(), 1);
        assert!(report.stage(BuildStage::BrdfLut).is_some_and(|d| d <= report.total));
        assert!(report.to_string().contains("BRDF LUT"));

        shared.shutdown(&mut backend);
        shared.shutdown(&mut backend);
        assert_eq!(backend.live_textures(), 0);
        assert_eq!(backend.live_pipelines(), 0);
        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(backend.live_samplers(), 0);
    }

    #[test]
    fn test_failed_initialize_releases_everything() {
        for point in [FailPoint::CreateComputePipeline, FailPoint::CreateTexture, FailPoint::Submit] {
            let mut backend = DummyBackend::new();
            backend.fail_on(point, 0);
            let result = ProbeShared::initialize(&mut backend, &small());
            assert!(result.is_err(), "{point:?}");
            assert_eq!(backend.live_textures(), 0, "{point:?}");
            assert_eq!(backend.live_pipelines(), 0, "{point:?}");
            assert_eq!(backend.live_buffers(), 0, "{point:?}");
        }
    }

    #[test]
    fn test_validated_programs_match_linked_ones() {
        let mut backend = DummyBackend::new();
        let mut shared = ProbeShared::initialize(&mut backend, &small()).unwrap();
        assert_eq!(shared.mipmapper.formats(), &MIPMAP_FORMATS[..]);

        let mipmap_programs = program_descriptions()
            .iter()
            .filter(|program| program.label().starts_with("mipmap"))
            .count();
        assert_eq!(mipmap_programs, shared.mipmapper.formats().len());
        shared.shutdown(&mut backend);
    }

    #[test]
    fn test_lut_failure_names_its_stage() {
        let mut backend = DummyBackend::new();
        backend.fail_on(FailPoint::Submit, 0);
        let err = ProbeShared::initialize(&mut backend, &small()).err().unwrap();
        assert!(matches!(
            err,
            ProbeError::StageFailed {
                stage: BuildStage::BrdfLut,
                ..
            }
        ));
        assert!(matches!(err.root(), ProbeError::Backend(_)));
        assert_eq!(backend.live_textures(), 0);
    }

    #[test]
    fn test_broken_library_fails_fast() {
        let mut backend = DummyBackend::new();
        let library = ShaderLibrary::standard().with_module("prefilter.compute", "fn main( {", &[]);
        let result = ProbeShared::initialize_with_library(&mut backend, &small(), library);
        assert!(matches!(
            result.as_ref().map_err(ProbeError::root),
            Err(ProbeError::Resource(ResourceError::ShaderCompile { .. }))
        ));
        assert_eq!(backend.live_pipelines(), 0);
    }

    #[test]
    fn test_invalid_config_touches_nothing() {
        let mut backend = DummyBackend::new();
        let config = SharedConfig {
            brdf_lut_size: 0,
            ..small()
        };
        assert!(matches!(
            ProbeShared::initialize(&mut backend, &config),
            Err(ProbeError::InvalidConfig(_))
        ));
        assert!(backend.commands().is_empty());
    }
}
