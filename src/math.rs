//! Matrix, quaternion and sequence helpers
//!
//! Projections produce clip depth in `[0, 1]`.

use glam::{EulerRot, Mat3, Mat4, Quat, Vec2, Vec3, Vec4};

pub const WORLD_UP: Vec3 = Vec3::Y;

/// Right-handed orthographic projection.
pub fn ortho(left: f32, right: f32, bottom: f32, top: f32, near: f32, far: f32) -> Mat4 {
    let rl = 1.0 / (right - left);
    let tb = 1.0 / (top - bottom);
    let nf = 1.0 / (near - far);
    Mat4::from_cols(
        Vec4::new(2.0 * rl, 0.0, 0.0, 0.0),
        Vec4::new(0.0, 2.0 * tb, 0.0, 0.0),
        Vec4::new(0.0, 0.0, nf, 0.0),
        Vec4::new(-(right + left) * rl, -(top + bottom) * tb, near * nf, 1.0),
    )
}

/// Closed-form inverse of [`ortho`].
pub fn inverse_ortho(left: f32, right: f32, bottom: f32, top: f32, near: f32, far: f32) -> Mat4 {
    Mat4::from_cols(
        Vec4::new((right - left) * 0.5, 0.0, 0.0, 0.0),
        Vec4::new(0.0, (top - bottom) * 0.5, 0.0, 0.0),
        Vec4::new(0.0, 0.0, near - far, 0.0),
        Vec4::new((right + left) * 0.5, (top + bottom) * 0.5, -near, 1.0),
    )
}

/// Right-handed perspective projection with a vertical field of view in degrees.
pub fn perspective(fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
    Mat4::perspective_rh(fov_y_degrees.to_radians(), aspect.max(f32::EPSILON), near, far)
}

/// Add a sub-pixel offset (in NDC units) to a projection matrix.
pub fn jitter_projection(projection: Mat4, jitter: Vec2) -> Mat4 {
    Mat4::from_translation(jitter.extend(0.0)) * projection
}

/// Rotation matrix from pitch (x), yaw (y) and roll (z) in radians.
pub fn euler_to_matrix(pitch: f32, yaw: f32, roll: f32) -> Mat4 {
    Mat4::from_quat(Quat::from_euler(EulerRot::YXZ, yaw, pitch, roll))
}

/// Quaternion from the rotation part of a matrix, branching on the trace.
pub fn matrix_to_quaternion(matrix: &Mat3) -> Quat {
    let m = matrix.to_cols_array_2d();
    // m[column][row]
    let trace = m[0][0] + m[1][1] + m[2][2];
    let (x, y, z, w);
    if trace > 0.0 {
        let s = 0.5 / (trace + 1.0).sqrt();
        w = 0.25 / s;
        x = (m[1][2] - m[2][1]) * s;
        y = (m[2][0] - m[0][2]) * s;
        z = (m[0][1] - m[1][0]) * s;
    } else if m[0][0] > m[1][1] && m[0][0] > m[2][2] {
        let s = 2.0 * (1.0 + m[0][0] - m[1][1] - m[2][2]).sqrt();
        w = (m[1][2] - m[2][1]) / s;
        x = 0.25 * s;
        y = (m[1][0] + m[0][1]) / s;
        z = (m[2][0] + m[0][2]) / s;
    } else if m[1][1] > m[2][2] {
        let s = 2.0 * (1.0 + m[1][1] - m[0][0] - m[2][2]).sqrt();
        w = (m[2][0] - m[0][2]) / s;
        x = (m[1][0] + m[0][1]) / s;
        y = 0.25 * s;
        z = (m[2][1] + m[1][2]) / s;
    } else {
        let s = 2.0 * (1.0 + m[2][2] - m[0][0] - m[1][1]).sqrt();
        w = (m[0][1] - m[1][0]) / s;
        x = (m[2][0] + m[0][2]) / s;
        y = (m[2][1] + m[1][2]) / s;
        z = 0.25 * s;
    }
    Quat::from_xyzw(x, y, z, w).normalize()
}

/// Rotation matrix of a unit quaternion.
pub fn quaternion_to_matrix(q: Quat) -> Mat3 {
    let (x, y, z, w) = (q.x, q.y, q.z, q.w);
    let (xx, yy, zz) = (x * x, y * y, z * z);
    let (xy, xz, yz) = (x * y, x * z, y * z);
    let (wx, wy, wz) = (w * x, w * y, w * z);
    Mat3::from_cols(
        Vec3::new(1.0 - 2.0 * (yy + zz), 2.0 * (xy + wz), 2.0 * (xz - wy)),
        Vec3::new(2.0 * (xy - wz), 1.0 - 2.0 * (xx + zz), 2.0 * (yz + wx)),
        Vec3::new(2.0 * (xz + wy), 2.0 * (yz - wx), 1.0 - 2.0 * (xx + yy)),
    )
}

/// Van der Corput radical inverse in base 2.
pub fn radical_inverse_base2(mut bits: u32) -> f32 {
    bits = bits.rotate_left(16);
    bits = ((bits & 0x5555_5555) << 1) | ((bits & 0xAAAA_AAAA) >> 1);
    bits = ((bits & 0x3333_3333) << 2) | ((bits & 0xCCCC_CCCC) >> 2);
    bits = ((bits & 0x0F0F_0F0F) << 4) | ((bits & 0xF0F0_F0F0) >> 4);
    bits = ((bits & 0x00FF_00FF) << 8) | ((bits & 0xFF00_FF00) >> 8);
    bits as f32 * 2.328_306_4e-10
}

/// Point `i` of an `n`-point Hammersley set in `[0, 1)^2`.
pub fn hammersley(i: u32, n: u32) -> Vec2 {
    Vec2::new(i as f32 / n.max(1) as f32, radical_inverse_base2(i))
}

pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Linear congruential generator for wave phases and particle spawns
#[derive(Debug, Clone)]
pub struct Lcg {
    seed: u64,
}

impl Lcg {
    pub fn new(seed: u32) -> Self {
        Self { seed: seed as u64 }
    }

    /// Advance and return a value in `[0, 1)` built from the top 24 of 31 bits.
    pub fn next_f64(&mut self) -> f64 {
        self.seed = self.seed.wrapping_mul(1_103_515_245).wrapping_add(12_345) & 0x7fff_ffff;
        (self.seed >> 7) as f64 / (1u64 << 24) as f64
    }

    pub fn next_f32(&mut self) -> f32 {
        self.next_f64() as f32
    }

    /// Uniform value in `[min, max)`.
    pub fn range(&mut self, min: f32, max: f32) -> f32 {
        min + (max - min) * self.next_f32()
    }

    pub fn range_vec3(&mut self, min: Vec3, max: Vec3) -> Vec3 {
        Vec3::new(
            self.range(min.x, max.x),
            self.range(min.y, max.y),
            self.range(min.z, max.z),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ortho_inverse_roundtrip() {
        let (l, r, b, t, n, f) = (-3.0, 5.0, -2.0, 4.0, 0.5, 40.0);
        let projection = ortho(l, r, b, t, n, f);
        let inverse = inverse_ortho(l, r, b, t, n, f);
        for corner in [
            Vec4::new(-1.0, -1.0, 0.0, 1.0),
            Vec4::new(1.0, -1.0, 1.0, 1.0),
            Vec4::new(-1.0, 1.0, 1.0, 1.0),
            Vec4::new(1.0, 1.0, 0.0, 1.0),
        ] {
            let back = projection * (inverse * corner);
            assert!((back - corner).abs().max_element() < 1e-5, "{back:?}");
        }
        assert!(
            (projection.inverse() - inverse)
                .to_cols_array()
                .iter()
                .all(|v| v.abs() < 1e-4)
        );
    }

    #[test]
    fn test_ortho_matches_glam() {
        let ours = ortho(-1.0, 2.0, -3.0, 4.0, 0.1, 100.0);
        let glam = Mat4::orthographic_rh(-1.0, 2.0, -3.0, 4.0, 0.1, 100.0);
        assert!(ours.abs_diff_eq(glam, 1e-6));
    }

    #[test]
    fn test_quaternion_roundtrip() {
        let rotations = [
            Quat::IDENTITY,
            Quat::from_rotation_x(2.5),
            Quat::from_rotation_y(-3.0),
            Quat::from_rotation_z(3.1),
            Quat::from_euler(EulerRot::XYZ, 0.3, -1.2, 2.9),
        ];
        for q in rotations {
            let back = matrix_to_quaternion(&quaternion_to_matrix(q));
            // q and -q are the same rotation
            assert!(back.dot(q).abs() > 1.0 - 1e-5, "{q:?} -> {back:?}");
        }
    }

    #[test]
    fn test_quaternion_to_matrix_matches_glam() {
        let q = Quat::from_euler(EulerRot::YXZ, 0.7, 0.2, -0.4);
        assert!(quaternion_to_matrix(q).abs_diff_eq(Mat3::from_quat(q), 1e-6));
    }

    #[test]
    fn test_radical_inverse() {
        assert_eq!(radical_inverse_base2(0), 0.0);
        assert_eq!(radical_inverse_base2(1), 0.5);
        assert_eq!(radical_inverse_base2(2), 0.25);
        assert_eq!(radical_inverse_base2(3), 0.75);
        assert_eq!(hammersley(4, 16), Vec2::new(0.25, 0.125));
    }
}
