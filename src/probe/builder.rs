//! Probe builder: panorama to environment cubemap, then irradiance and prefiltered
//! radiance, in that order on one command stream.

use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::backend::*;
use crate::error::{ProbeError, ProbeResult};
use crate::resources::{
    CubeFace, DrawPrimitive, HdrImage, RenderTarget, ResourceError, SamplingParams, ShaderProgram, Texture,
    TextureKind, TextureSpec,
};

use super::config::{ConvolutionPath, ProbeConfig};
use super::cubemap::{capture_projection, capture_view, face_size_at_mip, roughness_for_mip};
use super::shared::{ProbeShared, CUBE_FORMAT, DEPTH_FORMAT, LOCAL_SIZE};

/// One step of probe precomputation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildStage {
    EquirectToCubemap,
    Irradiance,
    Prefilter,
    BrdfLut,
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildStage::EquirectToCubemap => "equirectangular to cubemap",
            BuildStage::Irradiance => "irradiance convolution",
            BuildStage::Prefilter => "specular prefilter",
            BuildStage::BrdfLut => "BRDF LUT",
        };
        f.write_str(name)
    }
}

/// One per-probe stage; the BRDF LUT is rendered once by [`ProbeShared`]
type StageFn = fn(&mut LightProbe, &mut dyn GraphicsBackend, &mut ProbeShared, &Texture) -> ProbeResult<()>;

pub(crate) fn in_stage(stage: BuildStage) -> impl FnOnce(ProbeError) -> ProbeError {
    move |source| ProbeError::StageFailed {
        stage,
        source: Box::new(source),
    }
}

/// Wall-clock time of each stage of the last successful build
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildReport {
    pub stages: Vec<(BuildStage, Duration)>,
    pub total: Duration,
}

impl BuildReport {
    pub fn stage(&self, stage: BuildStage) -> Option<Duration> {
        self.stages.iter().find(|(s, _)| *s == stage).map(|(_, d)| *d)
    }
}

impl fmt::Display for BuildReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (stage, duration) in &self.stages {
            writeln!(f, "{stage:>28}: {duration:.2?}")?;
        }
        write!(f, "{:>28}: {:.2?}", "total", self.total)
    }
}

/// Finished probe cubemaps, read-only until the next rebuild
#[derive(Clone, Copy)]
pub struct ProbeOutputs<'a> {
    pub environment: &'a Texture,
    pub irradiance: &'a Texture,
    pub prefilter: &'a Texture,
}

/// Owns one environment's cubemaps and the capture surface used while building them
pub struct LightProbe {
    config: ProbeConfig,
    environment: Texture,
    irradiance: Texture,
    prefilter: Texture,
    capture: RenderTarget,
    report: BuildReport,
    built: bool,
}

impl LightProbe {
    /// Validate `config` and describe the cubemaps. Nothing is allocated until a build.
    pub fn new(config: ProbeConfig) -> ProbeResult<Self> {
        config.validate()?;
        let name = &config.name;

        let environment = Texture::new(TextureSpec::cube(
            format!("{name} environment"),
            config.environment_size,
            CUBE_FORMAT,
            config.environment_mip_levels(),
        ))?;
        let irradiance = Texture::new(TextureSpec::cube(
            format!("{name} irradiance"),
            config.irradiance_size,
            CUBE_FORMAT,
            1,
        ))?;
        let prefilter = Texture::new(
            TextureSpec::cube(
                format!("{name} prefilter"),
                config.prefilter_size,
                CUBE_FORMAT,
                config.prefilter_mip_levels,
            )
            .with_sampling(SamplingParams::trilinear_clamp()),
        )?;

        Ok(Self {
            capture: RenderTarget::new(format!("{name} capture"), Some(DEPTH_FORMAT)),
            config,
            environment,
            irradiance,
            prefilter,
            report: BuildReport::default(),
            built: false,
        })
    }

    /// Load an HDR panorama from disk and build a probe from it.
    /// A missing file is reported before any GPU resource is created.
    pub fn from_file<P: AsRef<Path>>(
        backend: &mut dyn GraphicsBackend,
        shared: &mut ProbeShared,
        path: P,
        config: ProbeConfig,
    ) -> ProbeResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ProbeError::MissingPanorama(path.to_path_buf()));
        }
        let mut probe = Self::new(config)?;
        let image = HdrImage::from_file(path)?;
        probe.build_from_image(backend, shared, &image)?;
        Ok(probe)
    }

    /// Upload `image`, build from it and release the upload again
    pub fn build_from_image(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        shared: &mut ProbeShared,
        image: &HdrImage,
    ) -> ProbeResult<&BuildReport> {
        check_panorama(&image.name, image.width, image.height)?;
        let mut panorama = image.upload(backend)?;
        let result = self.build(backend, shared, &panorama);
        panorama.destroy(backend);
        result
    }

    /// Run every stage against `panorama`, replacing any previous outputs.
    ///
    /// On failure the probe holds no outputs and everything allocated for it is
    /// released; the error names the stage that failed.
    pub fn build(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        shared: &mut ProbeShared,
        panorama: &Texture,
    ) -> ProbeResult<&BuildReport> {
        if panorama.kind() != TextureKind::D2 {
            return Err(ProbeError::InvalidPanorama {
                name: panorama.label().to_string(),
                width: panorama.width(),
                height: panorama.height(),
            });
        }
        check_panorama(panorama.label(), panorama.width(), panorama.height())?;
        if !shared.is_initialized() {
            return Err(ResourceError::NotLinked("probe shared state".to_string()).into());
        }

        self.built = false;
        let result = self.run_stages(backend, shared, panorama);
        self.capture.destroy(backend);
        match result {
            Ok(report) => {
                log::info!("Probe '{}' built in {:.2?}", self.config.name, report.total);
                self.report = report;
                self.built = true;
                Ok(&self.report)
            }
            Err(err) => {
                log::error!("Probe '{}' build failed: {err}", self.config.name);
                self.release_outputs(backend);
                Err(err)
            }
        }
    }

    /// Rebuild from a new panorama, reusing the existing cubemaps
    pub fn update(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        shared: &mut ProbeShared,
        panorama: &Texture,
    ) -> ProbeResult<&BuildReport> {
        log::debug!("Updating probe '{}' from '{}'", self.config.name, panorama.label());
        self.build(backend, shared, panorama)
    }

    fn run_stages(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        shared: &mut ProbeShared,
        panorama: &Texture,
    ) -> ProbeResult<BuildReport> {
        let start = Instant::now();
        let mut report = BuildReport::default();

        for texture in [&mut self.environment, &mut self.irradiance, &mut self.prefilter] {
            if !texture.is_allocated() {
                texture.allocate(backend)?;
            }
        }

        let stages: [(BuildStage, StageFn); 3] = [
            (BuildStage::EquirectToCubemap, Self::render_environment),
            (BuildStage::Irradiance, |probe, backend, shared, _| {
                probe.convolve_irradiance(backend, shared)
            }),
            (BuildStage::Prefilter, |probe, backend, shared, _| {
                probe.prefilter_mips(backend, shared)
            }),
        ];
        for (stage, run) in stages {
            let stage_start = Instant::now();
            log::info!("Probe '{}': {stage}", self.config.name);
            run(self, backend, shared, panorama)
                .and_then(|()| finish_stage(backend))
                .map_err(in_stage(stage))?;
            let elapsed = stage_start.elapsed();
            log::info!("Probe '{}': {stage} done in {elapsed:.2?}", self.config.name);
            report.stages.push((stage, elapsed));
        }

        report.total = start.elapsed();
        Ok(report)
    }

    fn render_environment(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        shared: &mut ProbeShared,
        panorama: &Texture,
    ) -> ProbeResult<()> {
        let cube = shared.cube.as_ref().ok_or_else(not_ready)?;
        let size = self.environment.width();
        self.capture.resize(backend, size, size)?;

        let program = &mut shared.equirect;
        program.bind()?;
        program.set_uniform("projection", capture_projection());
        let result = program
            .bind_texture("equirectangular_map", panorama)
            .map_err(ProbeError::from)
            .and_then(|()| capture_faces(backend, program, &mut self.capture, cube, &mut self.environment, 0));
        program.unbind(backend);
        result?;

        self.environment
            .generate_mipmaps(backend, &mut shared.mipmapper)?;
        self.environment
            .set_sampling(backend, SamplingParams::trilinear_clamp())?;
        Ok(())
    }

    fn convolve_irradiance(&mut self, backend: &mut dyn GraphicsBackend, shared: &mut ProbeShared) -> ProbeResult<()> {
        let size = self.irradiance.width();
        let program = match self.config.irradiance_path {
            ConvolutionPath::Compute => &mut shared.irradiance_compute,
            ConvolutionPath::Raster => &mut shared.irradiance_raster,
        };
        program.bind()?;
        program.set_uniform("environment_size", self.environment.width() as f32);
        program.set_uniform("sample_delta", self.config.irradiance_sample_delta);
        program.set_uniform("face_size", size);

        let result = match self.config.irradiance_path {
            ConvolutionPath::Compute => convolve_compute(backend, program, &self.environment, &mut self.irradiance, 0),
            ConvolutionPath::Raster => match shared.cube.as_ref() {
                Some(cube) => convolve_raster(
                    backend,
                    program,
                    &mut self.capture,
                    cube,
                    &self.environment,
                    &mut self.irradiance,
                    0,
                ),
                None => Err(not_ready()),
            },
        };
        program.unbind(backend);
        result
    }

    fn prefilter_mips(&mut self, backend: &mut dyn GraphicsBackend, shared: &mut ProbeShared) -> ProbeResult<()> {
        let source_mip = self.config.prefilter_source_mip;
        self.prefilter.copy_from(backend, &self.environment, source_mip, 0)?;

        let levels = self.prefilter.mip_levels();
        let program = match self.config.prefilter_path {
            ConvolutionPath::Compute => &mut shared.prefilter_compute,
            ConvolutionPath::Raster => &mut shared.prefilter_raster,
        };
        program.bind()?;
        program.set_uniform("environment_size", self.environment.width() as f32);
        program.set_uniform("sample_count", self.config.prefilter_sample_count);

        let mut result = Ok(());
        for mip in 1..levels {
            let roughness = roughness_for_mip(mip, levels);
            let size = face_size_at_mip(self.prefilter.width(), mip);
            log::info!(
                "Probe '{}': prefilter mip {mip}/{} ({size}px, roughness {roughness:.3})",
                self.config.name,
                levels - 1
            );
            program.set_uniform("roughness", roughness);
            program.set_uniform("face_size", size);

            result = match self.config.prefilter_path {
                ConvolutionPath::Compute => {
                    convolve_compute(backend, program, &self.environment, &mut self.prefilter, mip)
                }
                ConvolutionPath::Raster => match shared.cube.as_ref() {
                    Some(cube) => convolve_raster(
                        backend,
                        program,
                        &mut self.capture,
                        cube,
                        &self.environment,
                        &mut self.prefilter,
                        mip,
                    ),
                    None => Err(not_ready()),
                },
            };
            if result.is_err() {
                break;
            }
        }
        program.unbind(backend);
        result
    }

    fn release_outputs(&mut self, backend: &mut dyn GraphicsBackend) {
        self.environment.destroy(backend);
        self.irradiance.destroy(backend);
        self.prefilter.destroy(backend);
        self.capture.destroy(backend);
        self.built = false;
    }

    /// Release every cubemap. Safe to call repeatedly; the probe can be built again.
    pub fn destroy(&mut self, backend: &mut dyn GraphicsBackend) {
        self.release_outputs(backend);
        self.report = BuildReport::default();
    }

    /// Outputs of the last successful build
    pub fn outputs(&self) -> Option<ProbeOutputs<'_>> {
        self.built.then_some(ProbeOutputs {
            environment: &self.environment,
            irradiance: &self.irradiance,
            prefilter: &self.prefilter,
        })
    }

    pub fn environment(&self) -> &Texture {
        &self.environment
    }

    pub fn irradiance(&self) -> &Texture {
        &self.irradiance
    }

    pub fn prefilter(&self) -> &Texture {
        &self.prefilter
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn report(&self) -> &BuildReport {
        &self.report
    }

    pub fn is_built(&self) -> bool {
        self.built
    }
}

fn not_ready() -> ProbeError {
    ResourceError::NotLinked("probe shared state".to_string()).into()
}

/// An equirectangular panorama spans 360 by 180 degrees
fn check_panorama(name: &str, width: u32, height: u32) -> ProbeResult<()> {
    if width == 0 || width != height * 2 {
        return Err(ProbeError::InvalidPanorama {
            name: name.to_string(),
            width,
            height,
        });
    }
    Ok(())
}

/// Submit the stage and wait, so the next stage samples finished data and timings are real
fn finish_stage(backend: &mut dyn GraphicsBackend) -> ProbeResult<()> {
    backend.submit()?;
    backend.wait_idle();
    Ok(())
}

/// Draw the capture cube into each face of one mip of `texture`
fn capture_faces(
    backend: &mut dyn GraphicsBackend,
    program: &mut ShaderProgram,
    target: &mut RenderTarget,
    cube: &DrawPrimitive,
    texture: &mut Texture,
    mip: u32,
) -> ProbeResult<()> {
    for face in CubeFace::ALL {
        program.set_uniform("view", capture_view(face));
        target.attach_color(backend, texture, Some(face), mip)?;
        program.draw(backend, target, cube, Some([0.0, 0.0, 0.0, 1.0]))?;
    }
    target.detach_color();
    Ok(())
}

fn convolve_raster(
    backend: &mut dyn GraphicsBackend,
    program: &mut ShaderProgram,
    target: &mut RenderTarget,
    cube: &DrawPrimitive,
    environment: &Texture,
    output: &mut Texture,
    mip: u32,
) -> ProbeResult<()> {
    let (width, height) = output.mip_size(mip);
    target.resize(backend, width, height)?;
    program.set_uniform("projection", capture_projection());
    program.bind_texture("environment_map", environment)?;
    capture_faces(backend, program, target, cube, output, mip)
}

/// All six faces of one mip in a single layered dispatch
fn convolve_compute(
    backend: &mut dyn GraphicsBackend,
    program: &mut ShaderProgram,
    environment: &Texture,
    output: &mut Texture,
    mip: u32,
) -> ProbeResult<()> {
    let (width, height) = output.mip_size(mip);
    program.bind_texture("environment_map", environment)?;
    program.bind_image(
        backend,
        "output_cube",
        output,
        mip,
        true,
        None,
        StorageTextureAccess::WriteOnly,
    )?;
    program.dispatch_compute_3d(backend, width, height, 6, LOCAL_SIZE, LOCAL_SIZE, 1)?;
    Ok(())
}
