//! Cube face addressing and capture cameras
//!
//! Faces follow the GPU cube convention: for a texel at `(u, v)` with rows running
//! top-down and `s = 2u - 1`, `t = 2v - 1`, face +X holds direction `(1, -t, -s)`,
//! -X `(-1, -t, s)`, +Y `(s, 1, t)`, -Y `(s, -1, -t)`, +Z `(s, -t, 1)` and -Z
//! `(-s, -t, -1)`. The capture cameras below render exactly that layout, and
//! `shaders/probe_common.wgsl` computes the same directions for compute writes.

use std::f32::consts::{FRAC_PI_2, PI};

use glam::{Mat4, Vec2, Vec3};

use crate::resources::{mip_extent, CubeFace};

pub const CAPTURE_NEAR: f32 = 0.1;
pub const CAPTURE_FAR: f32 = 10.0;

/// 90 degree square projection shared by every face capture.
///
/// Y is flipped so that texel row 0 of the attachment is the top of the face.
pub fn capture_projection() -> Mat4 {
    Mat4::from_scale(Vec3::new(1.0, -1.0, 1.0)) * Mat4::perspective_rh(FRAC_PI_2, 1.0, CAPTURE_NEAR, CAPTURE_FAR)
}

/// Direction a face capture looks along
pub fn face_forward(face: CubeFace) -> Vec3 {
    match face {
        CubeFace::PositiveX => Vec3::X,
        CubeFace::NegativeX => Vec3::NEG_X,
        CubeFace::PositiveY => Vec3::Y,
        CubeFace::NegativeY => Vec3::NEG_Y,
        CubeFace::PositiveZ => Vec3::Z,
        CubeFace::NegativeZ => Vec3::NEG_Z,
    }
}

/// Up vector of a face capture; the poles use a tangential axis
pub fn face_up(face: CubeFace) -> Vec3 {
    match face {
        CubeFace::PositiveY => Vec3::Z,
        CubeFace::NegativeY => Vec3::NEG_Z,
        _ => Vec3::NEG_Y,
    }
}

pub fn capture_view(face: CubeFace) -> Mat4 {
    Mat4::look_at_rh(Vec3::ZERO, face_forward(face), face_up(face))
}

/// View matrices for all faces, in layer order
pub fn capture_views() -> [Mat4; 6] {
    CubeFace::ALL.map(capture_view)
}

/// Unit direction through `(u, v)` on `face`
pub fn face_direction(face: CubeFace, u: f32, v: f32) -> Vec3 {
    let s = u * 2.0 - 1.0;
    let t = v * 2.0 - 1.0;
    let dir = match face {
        CubeFace::PositiveX => Vec3::new(1.0, -t, -s),
        CubeFace::NegativeX => Vec3::new(-1.0, -t, s),
        CubeFace::PositiveY => Vec3::new(s, 1.0, t),
        CubeFace::NegativeY => Vec3::new(s, -1.0, -t),
        CubeFace::PositiveZ => Vec3::new(s, -t, 1.0),
        CubeFace::NegativeZ => Vec3::new(-s, -t, -1.0),
    };
    dir.normalize()
}

/// Face and `(u, v)` a direction lands on. Ties go to X, then Y.
pub fn direction_to_face(dir: Vec3) -> (CubeFace, Vec2) {
    let abs = dir.abs();
    let (face, s, t) = if abs.x >= abs.y && abs.x >= abs.z {
        if dir.x > 0.0 {
            (CubeFace::PositiveX, -dir.z / abs.x, -dir.y / abs.x)
        } else {
            (CubeFace::NegativeX, dir.z / abs.x, -dir.y / abs.x)
        }
    } else if abs.y >= abs.z {
        if dir.y > 0.0 {
            (CubeFace::PositiveY, dir.x / abs.y, dir.z / abs.y)
        } else {
            (CubeFace::NegativeY, dir.x / abs.y, -dir.z / abs.y)
        }
    } else if dir.z > 0.0 {
        (CubeFace::PositiveZ, dir.x / abs.z, -dir.y / abs.z)
    } else {
        (CubeFace::NegativeZ, -dir.x / abs.z, -dir.y / abs.z)
    };
    (face, Vec2::new((s + 1.0) * 0.5, (t + 1.0) * 0.5))
}

/// Panorama coordinates of a direction: longitude on u, latitude on v with v = 0 at +Y
pub fn direction_to_equirect(dir: Vec3) -> Vec2 {
    let d = dir.normalize();
    let longitude = d.z.atan2(d.x);
    let latitude = d.y.clamp(-1.0, 1.0).asin();
    Vec2::new(longitude / (2.0 * PI) + 0.5, 0.5 - latitude / PI)
}

pub fn equirect_to_direction(uv: Vec2) -> Vec3 {
    let longitude = (uv.x - 0.5) * 2.0 * PI;
    let latitude = (0.5 - uv.y) * PI;
    Vec3::new(
        latitude.cos() * longitude.cos(),
        latitude.sin(),
        latitude.cos() * longitude.sin(),
    )
}

/// Roughness a prefilter mip is convolved with: `mip / (levels - 1)`.
/// Mip 0 is a copy of the environment and counts as perfectly smooth.
pub fn roughness_for_mip(mip: u32, levels: u32) -> f32 {
    if mip == 0 || levels < 2 {
        return 0.0;
    }
    mip as f32 / (levels - 1) as f32
}

pub fn face_size_at_mip(base: u32, mip: u32) -> u32 {
    mip_extent(base, mip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    const EPS: f32 = 1e-5;

    #[test]
    fn test_capture_cameras_match_face_addressing() {
        let projection = capture_projection();
        for face in CubeFace::ALL {
            let view_projection = projection * capture_view(face);
            for (u, v) in [(0.5, 0.5), (0.1, 0.2), (0.9, 0.3), (0.25, 0.8)] {
                let dir = face_direction(face, u, v);
                let clip = view_projection * Vec4::new(dir.x, dir.y, dir.z, 1.0);
                let ndc = clip.truncate() / clip.w;
                assert!((ndc.x - (2.0 * u - 1.0)).abs() < EPS, "{face} x at ({u}, {v}): {ndc}");
                assert!((ndc.y - (1.0 - 2.0 * v)).abs() < EPS, "{face} y at ({u}, {v}): {ndc}");
                assert!(ndc.z > 0.0 && ndc.z < 1.0);
            }
        }
    }

    #[test]
    fn test_views_are_orthonormal() {
        for view in capture_views() {
            let rotation = glam::Mat3::from_mat4(view);
            assert!((rotation.determinant() - 1.0).abs() < EPS);
            assert!((rotation * rotation.transpose()).abs_diff_eq(glam::Mat3::IDENTITY, EPS));
        }
    }

    #[test]
    fn test_face_centers_point_along_axes() {
        for face in CubeFace::ALL {
            assert!(face_direction(face, 0.5, 0.5).abs_diff_eq(face_forward(face), EPS));
        }
    }

    #[test]
    fn test_direction_to_face_inverts_face_direction() {
        for face in CubeFace::ALL {
            for (u, v) in [(0.5, 0.5), (0.05, 0.95), (0.7, 0.1), (0.3, 0.6)] {
                let (found, uv) = direction_to_face(face_direction(face, u, v));
                assert_eq!(found, face);
                assert!(uv.abs_diff_eq(Vec2::new(u, v), EPS), "{face}: {uv} vs ({u}, {v})");
            }
        }
    }

    #[test]
    fn test_equirect_round_trip_and_landmarks() {
        assert!(direction_to_equirect(Vec3::X).abs_diff_eq(Vec2::new(0.5, 0.5), EPS));
        assert!(direction_to_equirect(Vec3::Z).abs_diff_eq(Vec2::new(0.75, 0.5), EPS));
        assert!((direction_to_equirect(Vec3::Y).y).abs() < EPS);
        assert!((direction_to_equirect(Vec3::NEG_Y).y - 1.0).abs() < EPS);

        for uv in [Vec2::new(0.1, 0.3), Vec2::new(0.6, 0.7), Vec2::new(0.95, 0.45)] {
            let back = direction_to_equirect(equirect_to_direction(uv));
            assert!(back.abs_diff_eq(uv, EPS), "{uv} -> {back}");
        }
    }

    #[test]
    fn test_roughness_ramp() {
        let levels = 5;
        let ramp: Vec<f32> = (0..levels).map(|m| roughness_for_mip(m, levels)).collect();
        assert_eq!(ramp, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        for levels in 2..=10 {
            assert_eq!(roughness_for_mip(levels - 1, levels), 1.0);
            for mip in 1..levels {
                assert!(roughness_for_mip(mip, levels) >= roughness_for_mip(mip - 1, levels));
            }
        }
    }

    #[test]
    fn test_face_size_at_mip() {
        assert_eq!(face_size_at_mip(256, 0), 256);
        assert_eq!(face_size_at_mip(256, 7), 2);
        assert_eq!(face_size_at_mip(4, 5), 1);
    }
}
