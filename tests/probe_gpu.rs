//! GPU integration tests for probe baking.
//!
//! Each test bakes small probes on a headless wgpu adapter and checks the read-back
//! texels against closed-form expectations. Tests skip when no adapter is present.
//!
//! ```bash
//! cargo test --test probe_gpu
//! ```

mod common;

use glam::Vec2;
use rstest::rstest;

use common::{assert_rgb_close, small_config, texel_direction, TestContext};
use light_probe::backend::{ShaderStage, StorageTextureAccess, TextureFormat, TextureUsage, TextureViewDimension};
use light_probe::probe::cubemap::{direction_to_equirect, direction_to_face, equirect_to_direction};
use light_probe::resources::{ShaderLibrary, ShaderProgram, TextureSpec};
use light_probe::{ConvolutionPath, CubeFace, HdrImage, ShIrradiance, Texture};

// ============================================================================
// Cube layers
// ============================================================================

/// Every face of a cubemap keeps its own data through upload and readback
#[test]
fn test_cube_faces_round_trip() {
    let Some(mut ctx) = TestContext::new() else {
        eprintln!("GPU not available, skipping");
        return;
    };

    let size = 4u32;
    let mut cube = Texture::create(
        &mut ctx.backend,
        TextureSpec::cube("round trip", size, TextureFormat::Rgba16Float, 1),
    )
    .unwrap();
    let value = |face: CubeFace| 0.25 * (face.index() + 1) as f32;
    for face in CubeFace::ALL {
        let texel: Vec<u8> = [value(face), value(face), value(face), 1.0]
            .iter()
            .flat_map(|v| half::f16::from_f32(*v).to_le_bytes())
            .collect();
        let pixels = texel.repeat((size * size) as usize);
        cube.write_face(&mut ctx.backend, Some(face), 0, &pixels).unwrap();
    }

    for face in CubeFace::ALL {
        let expected = value(face);
        for texel in ctx.read(&cube, Some(face), 0) {
            assert_eq!(texel, [expected, expected, expected, 1.0], "face {face}");
        }
    }
    cube.destroy(&mut ctx.backend);
}

// ============================================================================
// End-to-end bakes
// ============================================================================

/// A constant environment has nothing to convolve: every output texel is the constant.
#[rstest]
#[case::compute(ConvolutionPath::Compute)]
#[case::raster(ConvolutionPath::Raster)]
fn test_constant_panorama_is_preserved(#[case] path: ConvolutionPath) {
    let Some(mut ctx) = TestContext::new() else {
        eprintln!("GPU not available, skipping");
        return;
    };

    let color = [0.75, 0.75, 0.75];
    let panorama = HdrImage::uniform(128, 64, color, "constant");
    let mut probe = ctx.build(&panorama, small_config(path));
    let outputs = probe.outputs().expect("probe has outputs");
    let (environment, irradiance, prefilter) = (outputs.environment, outputs.irradiance, outputs.prefilter);

    for face in CubeFace::ALL {
        for texel in ctx.read(environment, Some(face), 0) {
            assert_rgb_close(texel, color, 1e-2, &format!("environment {face}"));
        }
        for texel in ctx.read(irradiance, Some(face), 0) {
            assert_rgb_close(texel, color, 2e-2, &format!("irradiance {face}"));
        }
        for mip in 0..prefilter.mip_levels() {
            for texel in ctx.read(prefilter, Some(face), mip) {
                assert_rgb_close(texel, color, 2e-2, &format!("prefilter {face} mip {mip}"));
            }
        }
    }

    probe.destroy(&mut ctx.backend);
}

/// Rebuilding from a different panorama must change every derived cubemap
#[test]
fn test_update_propagates_new_environment() {
    let Some(mut ctx) = TestContext::new() else {
        eprintln!("GPU not available, skipping");
        return;
    };

    let mut probe = ctx.build(
        &HdrImage::uniform(128, 64, [1.0; 3], "dim"),
        small_config(ConvolutionPath::Compute),
    );
    let before = ctx.read(probe.irradiance(), Some(CubeFace::PositiveY), 0)[0];
    assert_rgb_close(before, [1.0; 3], 2e-2, "irradiance before update");

    let mut bright = HdrImage::uniform(128, 64, [3.0; 3], "bright")
        .upload(&mut ctx.backend)
        .unwrap();
    probe
        .update(&mut ctx.backend, &mut ctx.shared, &bright)
        .expect("update failed");
    bright.destroy(&mut ctx.backend);

    let irradiance = ctx.read(probe.irradiance(), Some(CubeFace::PositiveY), 0)[0];
    assert_rgb_close(irradiance, [3.0; 3], 5e-2, "irradiance after update");
    for mip in 1..probe.prefilter().mip_levels() {
        let texel = ctx.read(probe.prefilter(), Some(CubeFace::NegativeZ), mip)[0];
        assert_rgb_close(texel, [3.0; 3], 5e-2, &format!("prefilter mip {mip} after update"));
    }

    probe.destroy(&mut ctx.backend);
}

/// Prefilter mip 0 is a verbatim copy of the configured environment mip
#[test]
fn test_prefilter_base_copies_environment_mip() {
    let Some(mut ctx) = TestContext::new() else {
        eprintln!("GPU not available, skipping");
        return;
    };

    let panorama = HdrImage::from_fn(128, 64, "ramp", |u, v| [u * 2.0, v, 1.0 - v]);
    let mut probe = ctx.build(&panorama, small_config(ConvolutionPath::Compute));
    for face in CubeFace::ALL {
        let copied = ctx.read(probe.prefilter(), Some(face), 0);
        let source = ctx.read(probe.environment(), Some(face), 1);
        assert_eq!(copied, source, "face {face}");
    }
    probe.destroy(&mut ctx.backend);
}

// ============================================================================
// Orientation
// ============================================================================

/// A bright spot in the panorama lands on the face and texel its direction addresses
#[test]
fn test_bright_spots_land_on_expected_texels() {
    let Some(mut ctx) = TestContext::new() else {
        eprintln!("GPU not available, skipping");
        return;
    };

    let (width, height) = (256u32, 128u32);
    let targets = [
        glam::Vec3::new(1.0, 0.3, 0.35),
        glam::Vec3::new(-1.0, -0.3, 0.4),
        glam::Vec3::new(0.35, 1.0, -0.4),
        glam::Vec3::new(-0.3, -1.0, 0.35),
        glam::Vec3::new(0.4, 0.3, 1.0),
        glam::Vec3::new(-0.35, 0.3, -1.0),
    ];
    // Snap each spot to a panorama pixel and use that pixel's exact direction
    let spots: Vec<(u32, u32)> = targets
        .iter()
        .map(|dir| {
            let uv = direction_to_equirect(*dir);
            ((uv.x * width as f32) as u32, (uv.y * height as f32) as u32)
        })
        .collect();

    let mut pixels = vec![[0.0, 0.0, 0.0, 1.0]; (width * height) as usize];
    for (sx, sy) in &spots {
        for y in sy - 2..=sy + 2 {
            for x in sx - 2..=sx + 2 {
                pixels[(y * width + x) as usize] = [8.0, 8.0, 8.0, 1.0];
            }
        }
    }
    let panorama = HdrImage::from_pixels(width, height, pixels, "spots");
    let mut probe = ctx.build(&panorama, small_config(ConvolutionPath::Compute));
    let size = probe.environment().width();

    for (target, (sx, sy)) in targets.iter().zip(&spots) {
        let center = Vec2::new((*sx as f32 + 0.5) / width as f32, (*sy as f32 + 0.5) / height as f32);
        let (face, uv) = direction_to_face(equirect_to_direction(center));
        let (expected_face, _) = direction_to_face(*target);
        assert_eq!(face, expected_face, "spot {target} snapped across a face edge");

        let texels = ctx.read(probe.environment(), Some(face), 0);
        let at = |u: f32, v: f32| {
            let x = ((u * size as f32) as u32).min(size - 1);
            let y = ((v * size as f32) as u32).min(size - 1);
            texels[(y * size + x) as usize]
        };

        let hit = at(uv.x, uv.y);
        assert!(hit[0] > 4.0, "{face}: no spot at {uv}, got {hit:?}");
        for (u, v) in [(1.0 - uv.x, uv.y), (uv.x, 1.0 - uv.y), (1.0 - uv.x, 1.0 - uv.y)] {
            let mirrored = at(u, v);
            assert!(mirrored[0] < 0.5, "{face}: spot mirrored to ({u}, {v}): {mirrored:?}");
        }
    }

    probe.destroy(&mut ctx.backend);
}

// ============================================================================
// Irradiance accuracy
// ============================================================================

/// `L = a + b * y` has closed-form irradiance `a + 2/3 * b * n.y`, on the GPU and in SH
#[rstest]
#[case::compute(ConvolutionPath::Compute)]
#[case::raster(ConvolutionPath::Raster)]
fn test_gradient_irradiance_matches_analytic(#[case] path: ConvolutionPath) {
    let Some(mut ctx) = TestContext::new() else {
        eprintln!("GPU not available, skipping");
        return;
    };

    let (a, b) = (1.0, 0.5);
    let panorama = HdrImage::from_fn(256, 128, "gradient", |u, v| {
        let value = a + b * equirect_to_direction(Vec2::new(u, v)).y;
        [value, value, value]
    });
    let sh = ShIrradiance::from_panorama(&panorama);
    let mut probe = ctx.build(&panorama, small_config(path));
    let size = probe.irradiance().width();

    for face in CubeFace::ALL {
        let texels = ctx.read(probe.irradiance(), Some(face), 0);
        for y in (0..size).step_by(3) {
            for x in (0..size).step_by(3) {
                let normal = texel_direction(face, x, y, size);
                let expected = a + 2.0 / 3.0 * b * normal.y;
                let texel = texels[(y * size + x) as usize];
                assert_rgb_close(texel, [expected; 3], 3e-2, &format!("{face} texel ({x}, {y})"));

                let diffuse = sh.diffuse(normal);
                assert!((diffuse.x - expected).abs() < 1e-2, "SH at {normal}: {diffuse}");
            }
        }
    }

    probe.destroy(&mut ctx.backend);
}

// ============================================================================
// BRDF LUT
// ============================================================================

const LUT_PROBE: &str = "
@group(0) @binding(1) var lut: texture_2d<f32>;
@group(0) @binding(2) var lut_sampler: sampler;
@group(0) @binding(3) var samples: texture_storage_2d_array<rgba16float, write>;

@compute @workgroup_size(1, 1, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let t = (f32(id.y) + 0.5) / 4.0;
    var uv = vec2<f32>(1.0, t);
    switch id.x {
        case 1u: { uv = vec2<f32>(1.5, t); }
        case 2u: { uv = vec2<f32>(t, 1.0); }
        case 3u: { uv = vec2<f32>(t, 1.5); }
        default: {}
    }
    textureStore(samples, id.xy, 0u, textureSampleLevel(lut, lut_sampler, uv, 0.0));
}
";

/// Sampling past the LUT edge returns exactly the edge value
#[test]
fn test_brdf_lut_clamps_at_domain_edges() {
    let Some(mut ctx) = TestContext::new() else {
        eprintln!("GPU not available, skipping");
        return;
    };

    let library = ShaderLibrary::standard().with_module("test.lut_probe", LUT_PROBE, &[]);
    let mut program = ShaderProgram::new("lut probe")
        .with_stage(ShaderStage::Compute, "test.lut_probe")
        .with_texture("lut", 1, TextureViewDimension::D2)
        .with_image(
            "samples",
            3,
            TextureFormat::Rgba16Float,
            TextureViewDimension::D2Array,
            StorageTextureAccess::WriteOnly,
        );
    program.link(&mut ctx.backend, &library).unwrap();

    let mut samples = Texture::create(
        &mut ctx.backend,
        TextureSpec::d2("lut samples", 4, 4, TextureFormat::Rgba16Float)
            .with_usage(TextureUsage::STORAGE_BINDING | TextureUsage::COPY_SRC),
    )
    .unwrap();

    let lut = ctx.shared.brdf_lut().expect("shared state has a LUT");
    program.bind().unwrap();
    program.bind_texture("lut", lut).unwrap();
    program
        .bind_image(
            &mut ctx.backend,
            "samples",
            &mut samples,
            0,
            true,
            None,
            StorageTextureAccess::WriteOnly,
        )
        .unwrap();
    program.dispatch_compute_2d(&mut ctx.backend, 4, 4, 1, 1).unwrap();
    program.unbind(&mut ctx.backend);

    let texels = samples.read_texels(&mut ctx.backend, None, 0).unwrap();
    for row in texels.chunks_exact(4) {
        assert_eq!(row[0], row[1], "u = 1.0 vs u = 1.5");
        assert_eq!(row[2], row[3], "v = 1.0 vs v = 1.5");
        assert!(row[0][0] + row[0][1] > 0.0);
    }

    // Smooth surfaces seen head-on reflect almost everything: scale + bias close to 1
    let lut_texels = lut.read_texels(&mut ctx.backend, None, 0).unwrap();
    let edge = lut_texels[(lut.width() - 1) as usize];
    assert!((edge[0] + edge[1] - 1.0).abs() < 0.05, "LUT at NdotV = 1, roughness = 0: {edge:?}");

    samples.destroy(&mut ctx.backend);
    program.destroy(&mut ctx.backend);
}
