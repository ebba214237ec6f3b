//! Bake a light probe headlessly and report per-stage timings.
//!
//! ```bash
//! cargo run --release --example bake_probe -- sky.hdr --lut-png brdf.png
//! cargo run --release --example bake_probe -- --raster --prefilter-mips 6
//! ```
//!
//! Without an input file a synthetic sky (bright horizon band, sun spot) is baked.

use std::error::Error;
use std::path::PathBuf;

use clap::Parser;
use glam::Vec2;

use light_probe::probe::cubemap::equirect_to_direction;
use light_probe::{
    ConvolutionPath, CubeFace, GraphicsBackend, HdrImage, LightProbe, ProbeConfig, ProbeShared, SharedConfig,
    ShIrradiance, WgpuBackend,
};

#[derive(Parser, Debug)]
#[command(name = "bake_probe", about = "Bake IBL light-probe cubemaps from an HDR panorama")]
struct Args {
    /// Equirectangular HDR panorama (2:1). A synthetic sky is used when omitted.
    panorama: Option<PathBuf>,

    /// Environment cubemap face size
    #[arg(long, default_value_t = 512)]
    environment_size: u32,

    /// Irradiance cubemap face size
    #[arg(long, default_value_t = 32)]
    irradiance_size: u32,

    /// Number of prefilter mip levels
    #[arg(long, default_value_t = 8)]
    prefilter_mips: u32,

    /// Environment mip copied into prefilter mip 0
    #[arg(long, default_value_t = 1)]
    source_mip: u32,

    /// Convolve with raster draws instead of compute dispatches
    #[arg(long)]
    raster: bool,

    /// BRDF LUT size
    #[arg(long, default_value_t = 512)]
    lut_size: u32,

    /// Write the BRDF LUT as an 8-bit PNG
    #[arg(long)]
    lut_png: Option<PathBuf>,
}

fn synthetic_sky() -> HdrImage {
    let sun = glam::Vec3::new(0.4, 0.6, 0.7).normalize();
    HdrImage::from_fn(1024, 512, "synthetic sky", |u, v| {
        let dir = equirect_to_direction(Vec2::new(u, v));
        let sky = if dir.y > 0.0 {
            [0.3 + 0.5 * (1.0 - dir.y), 0.5 + 0.4 * (1.0 - dir.y), 1.0]
        } else {
            [0.15, 0.12, 0.1]
        };
        if dir.dot(sun) > 0.998 {
            [50.0, 45.0, 40.0]
        } else {
            sky
        }
    })
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let path = if args.raster {
        ConvolutionPath::Raster
    } else {
        ConvolutionPath::Compute
    };
    let config = ProbeConfig {
        name: "bake".to_string(),
        environment_size: args.environment_size,
        irradiance_size: args.irradiance_size,
        prefilter_size: args.environment_size >> args.source_mip,
        prefilter_mip_levels: args.prefilter_mips,
        prefilter_source_mip: args.source_mip,
        ..Default::default()
    }
    .with_path(path);

    let mut backend = WgpuBackend::new_headless()?;
    log::info!("Using adapter '{}'", backend.name());
    let mut shared = ProbeShared::initialize(
        &mut backend,
        &SharedConfig {
            brdf_lut_size: args.lut_size,
            ..Default::default()
        },
    )?;
    println!("Shared state:\n{}", shared.report());

    let result = bake(&mut backend, &mut shared, &args, config);
    shared.shutdown(&mut backend);
    result
}

fn bake(
    backend: &mut WgpuBackend,
    shared: &mut ProbeShared,
    args: &Args,
    config: ProbeConfig,
) -> Result<(), Box<dyn Error>> {
    let image = match &args.panorama {
        Some(path) => {
            if !path.is_file() {
                return Err(light_probe::ProbeError::MissingPanorama(path.clone()).into());
            }
            HdrImage::from_file(path)?
        }
        None => synthetic_sky(),
    };

    let sh = ShIrradiance::from_panorama(&image);
    let mut probe = LightProbe::new(config)?;
    let report = probe.build_from_image(backend, shared, &image)?.clone();
    println!("Baked '{}':\n{report}", image.name);

    let irradiance = probe.irradiance().read_texels(backend, Some(CubeFace::PositiveY), 0)?;
    let center = irradiance[irradiance.len() / 2];
    let up = sh.diffuse(glam::Vec3::Y);
    println!(
        "Diffuse toward +Y: cubemap ({:.3}, {:.3}, {:.3}), SH ({:.3}, {:.3}, {:.3})",
        center[0], center[1], center[2], up.x, up.y, up.z
    );

    if let (Some(path), Some(lut)) = (&args.lut_png, shared.brdf_lut()) {
        let texels = lut.read_texels(backend, None, 0)?;
        let to_byte = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        let pixels: Vec<u8> = texels
            .iter()
            .flat_map(|t| [to_byte(t[0]), to_byte(t[1]), 0])
            .collect();
        image::save_buffer(path, &pixels, lut.width(), lut.height(), image::ColorType::Rgb8)?;
        println!("Wrote BRDF LUT to {}", path.display());
    }

    probe.destroy(backend);
    Ok(())
}
