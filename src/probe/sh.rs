//! Nine-coefficient spherical harmonics irradiance of a panorama
//!
//! Projects an equirectangular radiance map onto the first three SH bands and
//! evaluates the clamped-cosine convolution in closed form (Ramamoorthi and
//! Hanrahan, "An Efficient Representation for Irradiance Environment Maps").

use std::f32::consts::PI;

use glam::{Mat4, Vec3, Vec4};

use crate::resources::HdrImage;

use super::cubemap::equirect_to_direction;

const C1: f32 = 0.429043;
const C2: f32 = 0.511664;
const C3: f32 = 0.743125;
const C4: f32 = 0.886227;
const C5: f32 = 0.247708;

/// Real SH basis in the order L00, L1-1, L10, L11, L2-2, L2-1, L20, L21, L22
pub fn sh_basis(dir: Vec3) -> [f32; 9] {
    let Vec3 { x, y, z } = dir;
    [
        0.282095,
        0.488603 * y,
        0.488603 * z,
        0.488603 * x,
        1.092548 * x * y,
        1.092548 * y * z,
        0.315392 * (3.0 * z * z - 1.0),
        1.092548 * x * z,
        0.546274 * (x * x - y * y),
    ]
}

/// Projected lighting coefficients, one RGB triple per basis function
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShIrradiance {
    coefficients: [Vec3; 9],
}

impl ShIrradiance {
    pub fn from_coefficients(coefficients: [Vec3; 9]) -> Self {
        Self { coefficients }
    }

    /// Integrate the panorama against the basis, weighting each texel by its solid angle
    pub fn from_panorama(image: &HdrImage) -> Self {
        let mut coefficients = [Vec3::ZERO; 9];
        let texel_area = (2.0 * PI / image.width as f32) * (PI / image.height as f32);

        for y in 0..image.height {
            let v = (y as f32 + 0.5) / image.height as f32;
            let latitude = (0.5 - v) * PI;
            let solid_angle = texel_area * latitude.cos();
            for x in 0..image.width {
                let u = (x as f32 + 0.5) / image.width as f32;
                let dir = equirect_to_direction(glam::Vec2::new(u, v));
                let [r, g, b, _] = image.pixel(x, y);
                let radiance = Vec3::new(r, g, b) * solid_angle;
                for (coefficient, basis) in coefficients.iter_mut().zip(sh_basis(dir)) {
                    *coefficient += radiance * basis;
                }
            }
        }
        log::debug!("Projected '{}' onto SH9, L00 = {}", image.name, coefficients[0]);
        Self { coefficients }
    }

    pub fn coefficients(&self) -> &[Vec3; 9] {
        &self.coefficients
    }

    /// Irradiance arriving at a surface facing `normal`
    pub fn irradiance(&self, normal: Vec3) -> Vec3 {
        let Vec3 { x, y, z } = normal.normalize();
        let [l00, l1m1, l10, l11, l2m2, l2m1, l20, l21, l22] = self.coefficients;

        l22 * (C1 * (x * x - y * y)) + l20 * (C3 * z * z) + l00 * C4 - l20 * C5
            + (l2m2 * (x * y) + l21 * (x * z) + l2m1 * (y * z)) * (2.0 * C1)
            + (l11 * x + l1m1 * y + l10 * z) * (2.0 * C2)
    }

    /// Lambertian outgoing radiance for unit albedo
    pub fn diffuse(&self, normal: Vec3) -> Vec3 {
        self.irradiance(normal) / PI
    }

    /// Per-channel quadratic forms `M` with `E(n) = (n, 1)^T M (n, 1)`
    pub fn matrices(&self) -> [Mat4; 3] {
        let [l00, l1m1, l10, l11, l2m2, l2m1, l20, l21, l22] = self.coefficients;
        let channel = |c: usize| {
            Mat4::from_cols(
                Vec4::new(C1 * l22[c], C1 * l2m2[c], C1 * l21[c], C2 * l11[c]),
                Vec4::new(C1 * l2m2[c], -C1 * l22[c], C1 * l2m1[c], C2 * l1m1[c]),
                Vec4::new(C1 * l21[c], C1 * l2m1[c], C3 * l20[c], C2 * l10[c]),
                Vec4::new(C2 * l11[c], C2 * l1m1[c], C2 * l10[c], C4 * l00[c] - C5 * l20[c]),
            )
        };
        [channel(0), channel(1), channel(2)]
    }
}

/// Evaluate one channel's quadratic form at `normal`
pub fn evaluate_matrix(matrix: &Mat4, normal: Vec3) -> f32 {
    let n = normal.normalize().extend(1.0);
    n.dot(*matrix * n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normals() -> Vec<Vec3> {
        let mut normals = vec![Vec3::X, Vec3::NEG_X, Vec3::Y, Vec3::NEG_Y, Vec3::Z, Vec3::NEG_Z];
        normals.push(Vec3::new(1.0, 1.0, 1.0).normalize());
        normals.push(Vec3::new(-0.3, 0.8, 0.2).normalize());
        normals
    }

    #[test]
    fn test_constant_panorama_gives_constant_irradiance() {
        let color = [0.5, 1.0, 2.0];
        let sh = ShIrradiance::from_panorama(&HdrImage::uniform(128, 64, color, "flat"));
        for normal in normals() {
            let diffuse = sh.diffuse(normal);
            assert!(
                diffuse.abs_diff_eq(Vec3::from(color), 2e-3),
                "{normal}: {diffuse}"
            );
            assert!((sh.irradiance(normal).y - PI).abs() < 5e-3);
        }
    }

    #[test]
    fn test_vertical_gradient_matches_clamped_cosine() {
        let (a, b) = (1.0, 0.5);
        let image = HdrImage::from_fn(256, 128, "gradient", |u, v| {
            let y = equirect_to_direction(glam::Vec2::new(u, v)).y;
            let value = a + b * y;
            [value, value, value]
        });
        let sh = ShIrradiance::from_panorama(&image);
        for normal in normals() {
            let expected = a + 2.0 / 3.0 * b * normal.y;
            let diffuse = sh.diffuse(normal);
            assert!((diffuse.x - expected).abs() < 5e-3, "{normal}: {diffuse} vs {expected}");
        }
    }

    #[test]
    fn test_matrix_form_matches_direct_evaluation() {
        let image = HdrImage::from_fn(64, 32, "ramp", |u, v| [u, v, u * v + 0.1]);
        let sh = ShIrradiance::from_panorama(&image);
        let matrices = sh.matrices();
        for normal in normals() {
            let direct = sh.irradiance(normal);
            for (channel, matrix) in matrices.iter().enumerate() {
                let quadratic = evaluate_matrix(matrix, normal);
                assert!((quadratic - direct[channel]).abs() < 1e-4, "{normal} channel {channel}");
            }
            assert_eq!(matrices[0], matrices[0].transpose());
        }
    }

    #[test]
    fn test_basis_band_zero_is_constant() {
        for normal in normals() {
            assert_eq!(sh_basis(normal)[0], 0.282095);
        }
    }
}
