//! Transform component

use glam::{Mat4, Vec3};

use crate::math::euler_to_matrix;

/// Position, Euler rotation (pitch, yaw, roll in radians) and scale.
///
/// The matrix is cached; [`update`](Self::update) rebuilds it when a
/// component changed and keeps the previous frame's matrix for velocity.
#[derive(Debug, Clone, Copy)]
pub struct Transform {
    position: Vec3,
    rotation: Vec3,
    scale: Vec3,
    matrix: Mat4,
    rotation_matrix: Mat4,
    prev_matrix: Mat4,
    dirty: bool,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            scale: Vec3::ONE,
            matrix: Mat4::IDENTITY,
            rotation_matrix: Mat4::IDENTITY,
            prev_matrix: Mat4::IDENTITY,
            dirty: false,
        }
    }
}

impl Transform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_position(position: Vec3) -> Self {
        Self::from_components(position, Vec3::ZERO, Vec3::ONE)
    }

    /// Create transform from position, rotation (pitch, yaw, roll) and scale
    pub fn from_components(position: Vec3, rotation: Vec3, scale: Vec3) -> Self {
        let mut transform = Self {
            position,
            rotation,
            scale,
            ..Default::default()
        };
        transform.rebuild();
        transform.prev_matrix = transform.matrix;
        transform
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn rotation(&self) -> Vec3 {
        self.rotation
    }

    pub fn scale(&self) -> Vec3 {
        self.scale
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
        self.dirty = true;
    }

    pub fn set_rotation(&mut self, rotation: Vec3) {
        self.rotation = rotation;
        self.dirty = true;
    }

    pub fn set_scale(&mut self, scale: Vec3) {
        self.scale = scale;
        self.dirty = true;
    }

    /// Translate by an offset
    pub fn translate(&mut self, offset: Vec3) {
        self.set_position(self.position + offset);
    }

    /// Point local -Z along `direction`, leaving roll at zero.
    pub fn look_toward(&mut self, direction: Vec3) {
        let d = direction.normalize_or_zero();
        if d == Vec3::ZERO {
            return;
        }
        let pitch = d.y.clamp(-1.0, 1.0).asin();
        let yaw = (-d.x).atan2(-d.z);
        self.set_rotation(Vec3::new(pitch, yaw, 0.0));
    }

    /// Rebuild the cached matrix if a component changed. Returns whether it did.
    pub fn update(&mut self) -> bool {
        self.prev_matrix = self.matrix;
        if !self.dirty {
            return false;
        }
        self.rebuild();
        true
    }

    fn rebuild(&mut self) {
        self.rotation_matrix = euler_to_matrix(self.rotation.x, self.rotation.y, self.rotation.z);
        self.matrix = Mat4::from_translation(self.position)
            * self.rotation_matrix
            * Mat4::from_scale(self.scale);
        self.dirty = false;
    }

    /// Model matrix as of the last update
    pub fn matrix(&self) -> Mat4 {
        self.matrix
    }

    /// Model matrix of the frame before the last update
    pub fn prev_matrix(&self) -> Mat4 {
        self.prev_matrix
    }

    pub fn rotation_matrix(&self) -> Mat4 {
        self.rotation_matrix
    }

    /// Get forward direction (local -Z in world space)
    pub fn forward(&self) -> Vec3 {
        self.rotation_matrix.transform_vector3(-Vec3::Z)
    }

    /// Get right direction (local +X in world space)
    pub fn right(&self) -> Vec3 {
        self.rotation_matrix.transform_vector3(Vec3::X)
    }

    /// Get up direction (local +Y in world space)
    pub fn up(&self) -> Vec3 {
        self.rotation_matrix.transform_vector3(Vec3::Y)
    }

    /// Largest scale component, used to scale bounding radii.
    pub fn max_scale(&self) -> f32 {
        self.scale.abs().max_element()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn test_default_looks_down_negative_z() {
        let transform = Transform::new();
        assert!(transform.forward().abs_diff_eq(-Vec3::Z, 1e-6));
        assert!(transform.up().abs_diff_eq(Vec3::Y, 1e-6));
    }

    #[test]
    fn test_yaw_turns_toward_x() {
        let transform = Transform::from_components(Vec3::ZERO, Vec3::new(0.0, -FRAC_PI_2, 0.0), Vec3::ONE);
        assert!(transform.forward().abs_diff_eq(Vec3::X, 1e-5));
    }

    #[test]
    fn test_look_toward() {
        let mut transform = Transform::new();
        let direction = Vec3::new(1.0, 1.0, 1.0).normalize();
        transform.look_toward(direction);
        transform.update();
        assert!(transform.forward().abs_diff_eq(direction, 1e-5));
    }

    #[test]
    fn test_update_keeps_previous_matrix() {
        let mut transform = Transform::from_position(Vec3::X);
        transform.set_position(Vec3::Y);
        assert!(transform.update());
        assert_eq!(transform.prev_matrix().w_axis.truncate(), Vec3::X);
        assert_eq!(transform.matrix().w_axis.truncate(), Vec3::Y);
        assert!(!transform.update());
        assert_eq!(transform.prev_matrix(), transform.matrix());
    }
}
