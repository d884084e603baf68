//! Camera system

use glam::{Mat4, Vec2, Vec3, Vec4};

use super::transform::Transform;
use crate::math::{jitter_projection, perspective};

/// Perspective camera with jittered and previous-frame matrices.
#[derive(Debug, Clone)]
pub struct Camera {
    pub name: String,
    pub transform: Transform,
    /// Vertical field of view in degrees
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
    pub move_speed: f32,
    pub rotation_speed: f32,

    view: Mat4,
    inv_view: Mat4,
    view_origin: Mat4,
    inv_view_origin: Mat4,
    projection: Mat4,
    projection_jitter: Mat4,
    inv_projection: Mat4,
    view_projection: Mat4,
    view_projection_jitter: Mat4,
    view_origin_projection: Mat4,
    prev_view_projection: Mat4,
    prev_view_projection_jitter: Mat4,
    frustum_vectors: [Vec3; 4],
    jitter: Vec2,
    has_history: bool,
}

impl Default for Camera {
    fn default() -> Self {
        Self::new("main_camera")
    }
}

impl Camera {
    pub fn new(name: &str) -> Self {
        let mut camera = Self {
            name: name.to_string(),
            transform: Transform::new(),
            fov: 60.0,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 2000.0,
            move_speed: 1.0,
            rotation_speed: 0.005,
            view: Mat4::IDENTITY,
            inv_view: Mat4::IDENTITY,
            view_origin: Mat4::IDENTITY,
            inv_view_origin: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            projection_jitter: Mat4::IDENTITY,
            inv_projection: Mat4::IDENTITY,
            view_projection: Mat4::IDENTITY,
            view_projection_jitter: Mat4::IDENTITY,
            view_origin_projection: Mat4::IDENTITY,
            prev_view_projection: Mat4::IDENTITY,
            prev_view_projection_jitter: Mat4::IDENTITY,
            frustum_vectors: [Vec3::ZERO; 4],
            jitter: Vec2::ZERO,
            has_history: false,
        };
        camera.update(Vec2::ZERO);
        camera
    }

    pub fn position(&self) -> Vec3 {
        self.transform.position()
    }

    /// Change field of view and aspect; values `<= 0` keep the current one.
    pub fn update_projection(&mut self, fov: f32, aspect: f32) {
        if fov > 0.0 {
            self.fov = fov;
        }
        if aspect > 0.0 {
            self.aspect = aspect;
        }
    }

    /// Rebuild every matrix for this frame. `jitter` is the sub-pixel offset
    /// in NDC units applied to the jittered projection.
    pub fn update(&mut self, jitter: Vec2) {
        self.transform.update();
        let rotation = self.transform.rotation_matrix();
        let position = self.transform.position();

        self.inv_view_origin = rotation;
        self.view_origin = rotation.transpose();
        self.inv_view = Mat4::from_translation(position) * rotation;
        self.view = self.view_origin * Mat4::from_translation(-position);

        self.projection = perspective(self.fov, self.aspect, self.near, self.far);
        self.projection_jitter = jitter_projection(self.projection, jitter);
        self.inv_projection = self.projection_jitter.inverse();
        self.jitter = jitter;

        let view_projection = self.projection * self.view;
        let view_projection_jitter = self.projection_jitter * self.view;
        if self.has_history {
            self.prev_view_projection = self.view_projection;
            self.prev_view_projection_jitter = self.view_projection_jitter;
        } else {
            self.prev_view_projection = view_projection;
            self.prev_view_projection_jitter = view_projection_jitter;
            self.has_history = true;
        }
        self.view_projection = view_projection;
        self.view_projection_jitter = view_projection_jitter;
        self.view_origin_projection = self.projection * self.view_origin;
        self.update_frustum();
    }

    /// Drop the previous-frame matrices so the next update has no motion.
    pub fn reset_history(&mut self) {
        self.has_history = false;
    }

    /// Outward normals of the left, right, top and bottom planes. The planes
    /// pass through the camera position.
    fn update_frustum(&mut self) {
        let m = self.view_origin_projection;
        let (r0, r1, r3) = (m.row(0), m.row(1), m.row(3));
        let planes: [Vec4; 4] = [r3 + r0, r3 - r0, r3 - r1, r3 + r1];
        for (vector, plane) in self.frustum_vectors.iter_mut().zip(planes) {
            *vector = -plane.truncate().normalize_or_zero();
        }
    }

    pub fn frustum_vectors(&self) -> &[Vec3; 4] {
        &self.frustum_vectors
    }

    /// True when a sphere lies fully outside one of the side planes.
    pub fn cull_sphere(&self, center: Vec3, radius: f32) -> bool {
        let to_center = center - self.transform.position();
        self.frustum_vectors
            .iter()
            .any(|vector| radius < vector.dot(to_center))
    }

    pub fn view(&self) -> Mat4 {
        self.view
    }

    pub fn inv_view(&self) -> Mat4 {
        self.inv_view
    }

    /// View rotation without translation
    pub fn view_origin(&self) -> Mat4 {
        self.view_origin
    }

    pub fn inv_view_origin(&self) -> Mat4 {
        self.inv_view_origin
    }

    pub fn projection(&self) -> Mat4 {
        self.projection
    }

    pub fn projection_jitter(&self) -> Mat4 {
        self.projection_jitter
    }

    /// Inverse of the jittered projection
    pub fn inv_projection(&self) -> Mat4 {
        self.inv_projection
    }

    pub fn view_projection(&self) -> Mat4 {
        self.view_projection
    }

    pub fn view_projection_jitter(&self) -> Mat4 {
        self.view_projection_jitter
    }

    pub fn prev_view_projection(&self) -> Mat4 {
        self.prev_view_projection
    }

    pub fn prev_view_projection_jitter(&self) -> Mat4 {
        self.prev_view_projection_jitter
    }

    pub fn jitter(&self) -> Vec2 {
        self.jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera_at(position: Vec3) -> Camera {
        let mut camera = Camera::new("test");
        camera.aspect = 1.0;
        camera.transform.set_position(position);
        // placed fresh, so the first update carries no motion
        camera.reset_history();
        camera.update(Vec2::ZERO);
        camera
    }

    #[test]
    fn test_view_looks_down_negative_z() {
        let camera = camera_at(Vec3::new(0.0, 0.0, 5.0));
        let clip = camera.view_projection() * Vec4::new(0.0, 0.0, 0.0, 1.0);
        let ndc = clip.truncate() / clip.w;
        assert!(ndc.x.abs() < 1e-5 && ndc.y.abs() < 1e-5);
        assert!(ndc.z > 0.0 && ndc.z < 1.0);
    }

    #[test]
    fn test_frustum_culling() {
        let camera = camera_at(Vec3::new(0.0, 0.0, 5.0));
        assert!(!camera.cull_sphere(Vec3::ZERO, 1.0));
        // far off to the side
        assert!(camera.cull_sphere(Vec3::new(100.0, 0.0, 0.0), 1.0));
        assert!(camera.cull_sphere(Vec3::new(0.0, -100.0, 0.0), 1.0));
        // large enough to reach into view
        assert!(!camera.cull_sphere(Vec3::new(8.0, 0.0, 0.0), 10.0));
    }

    #[test]
    fn test_previous_matrices_trail_by_one_update() {
        let mut camera = camera_at(Vec3::ZERO);
        let first = camera.view_projection();
        assert_eq!(camera.prev_view_projection(), first);
        camera.transform.set_position(Vec3::X);
        camera.update(Vec2::ZERO);
        assert_eq!(camera.prev_view_projection(), first);
        assert_ne!(camera.view_projection(), first);

        camera.update(Vec2::ZERO);
        assert_eq!(camera.prev_view_projection(), camera.view_projection());
    }

    #[test]
    fn test_jitter_offsets_ndc() {
        let mut camera = camera_at(Vec3::new(0.0, 0.0, 5.0));
        camera.update(Vec2::new(0.01, -0.02));
        let clip = camera.view_projection_jitter() * Vec4::new(0.0, 0.0, 0.0, 1.0);
        let ndc = clip.truncate() / clip.w;
        assert!((ndc.x - 0.01).abs() < 1e-5);
        assert!((ndc.y + 0.02).abs() < 1e-5);
    }
}
