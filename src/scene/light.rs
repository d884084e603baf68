//! Directional and point lights

use glam::{Mat4, Vec3, Vec4};

use super::transform::Transform;
use crate::math::ortho;
use crate::resources::{LightConstants, PointLightConstants, PointLightData, MAX_POINT_LIGHTS};

pub const SHADOW_SAMPLES: i32 = 16;
pub const SHADOW_EXP: f32 = 1000.0;
pub const SHADOW_BIAS: f32 = 0.005;
/// Half extent of the shadow box around the camera
pub const SHADOW_DISTANCE: f32 = 50.0;

/// The sun. Casts the shadow map and drives the atmosphere.
#[derive(Debug, Clone)]
pub struct MainLight {
    pub name: String,
    pub transform: Transform,
    pub light_color: Vec4,
    pub shadow_samples: i32,
    pub shadow_exp: f32,
    pub shadow_bias: f32,
    shadow_width: f32,
    shadow_height: f32,
    shadow_depth: f32,
    shadow_orthogonal: Mat4,
    shadow_view_projection: Mat4,
    changed: bool,
}

impl Default for MainLight {
    fn default() -> Self {
        Self::new("main_light")
    }
}

impl MainLight {
    pub fn new(name: &str) -> Self {
        let mut light = Self {
            name: name.to_string(),
            transform: Transform::from_components(Vec3::ZERO, Vec3::new(-1.0, 0.0, 0.0), Vec3::ONE),
            light_color: Vec4::ONE,
            shadow_samples: SHADOW_SAMPLES,
            shadow_exp: SHADOW_EXP,
            shadow_bias: SHADOW_BIAS,
            shadow_width: SHADOW_DISTANCE,
            shadow_height: SHADOW_DISTANCE,
            shadow_depth: SHADOW_DISTANCE,
            shadow_orthogonal: Mat4::IDENTITY,
            shadow_view_projection: Mat4::IDENTITY,
            changed: true,
        };
        light.update_shadow_orthogonal();
        light
    }

    /// Aim the light so that `direction` points from the scene toward it.
    pub fn set_light_direction(&mut self, direction: Vec3) {
        self.transform.look_toward(-direction);
        self.changed = true;
    }

    /// Unit vector from the scene toward the light
    pub fn light_direction(&self) -> Vec3 {
        -self.transform.forward()
    }

    pub fn shadow_size(&self) -> Vec3 {
        Vec3::new(self.shadow_width, self.shadow_height, self.shadow_depth)
    }

    pub fn set_shadow_size(&mut self, size: Vec3) {
        self.shadow_width = size.x.max(f32::EPSILON);
        self.shadow_height = size.y.max(f32::EPSILON);
        self.shadow_depth = size.z.max(f32::EPSILON);
        self.update_shadow_orthogonal();
    }

    fn update_shadow_orthogonal(&mut self) {
        self.shadow_orthogonal = ortho(
            -self.shadow_width,
            self.shadow_width,
            -self.shadow_height,
            self.shadow_height,
            -self.shadow_depth,
            self.shadow_depth,
        );
        self.changed = true;
    }

    /// Whether anything affecting static shadows changed since the last reset
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn reset_changed(&mut self) {
        self.changed = false;
    }

    pub fn mark_changed(&mut self) {
        self.changed = true;
    }

    /// Follow the camera: the shadow box is centred on `camera_position`.
    pub fn update(&mut self, camera_position: Vec3) {
        if self.transform.update() {
            self.changed = true;
        }
        let light_view = self.transform.rotation_matrix().transpose();
        self.shadow_view_projection =
            self.shadow_orthogonal * light_view * Mat4::from_translation(-camera_position);
    }

    pub fn shadow_view_projection(&self) -> Mat4 {
        self.shadow_view_projection
    }

    /// True when the box `min..max` projects fully outside the shadow volume.
    pub fn cull_bounds(&self, min: Vec3, max: Vec3) -> bool {
        let a = self.shadow_view_projection.project_point3(min);
        let b = self.shadow_view_projection.project_point3(max);
        let lo = a.min(b);
        let hi = a.max(b);
        hi.cmplt(Vec3::splat(-1.0)).any() || lo.cmpgt(Vec3::ONE).any()
    }

    pub fn constants(&self) -> LightConstants {
        LightConstants {
            shadow_matrix: self.shadow_view_projection,
            light_position: self.transform.position(),
            shadow_exp: self.shadow_exp,
            light_direction: self.light_direction(),
            shadow_bias: self.shadow_bias,
            light_color: self.light_color.truncate(),
            shadow_samples: self.shadow_samples,
        }
    }
}

/// Point light contributing to the flat light array
#[derive(Debug, Clone)]
pub struct PointLight {
    pub name: String,
    pub transform: Transform,
    pub light_color: Vec3,
    pub light_radius: f32,
}

impl PointLight {
    pub fn new(name: &str, position: Vec3) -> Self {
        Self {
            name: name.to_string(),
            transform: Transform::from_position(position),
            light_color: Vec3::ONE,
            light_radius: 10.0,
        }
    }

    pub fn update(&mut self) {
        self.transform.update();
    }

    fn data(&self) -> PointLightData {
        PointLightData {
            color: self.light_color,
            radius: self.light_radius,
            position: self.transform.position(),
            render: 1.0,
        }
    }
}

/// Fill the point-light block; lights past `max_lights` are dropped.
pub fn point_light_constants(lights: &[PointLight], max_lights: usize) -> PointLightConstants {
    let mut constants = PointLightConstants::default();
    let count = max_lights.min(MAX_POINT_LIGHTS);
    if lights.len() > count {
        log::warn!("{} point lights exceed the limit of {}", lights.len(), count);
    }
    for (slot, light) in constants.lights.iter_mut().zip(lights.iter().take(count)) {
        *slot = light.data();
    }
    constants
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_light_direction_points_to_light() {
        let mut light = MainLight::new("sun");
        let direction = Vec3::new(1.0, 1.0, 1.0).normalize();
        light.set_light_direction(direction);
        light.update(Vec3::ZERO);
        assert!(light.light_direction().abs_diff_eq(direction, 1e-5));
        assert!(light.constants().light_direction.abs_diff_eq(direction, 1e-5));
    }

    #[test]
    fn test_shadow_box_follows_camera() {
        let mut light = MainLight::new("sun");
        light.update(Vec3::new(100.0, 0.0, 0.0));
        let center = light.shadow_view_projection().project_point3(Vec3::new(100.0, 0.0, 0.0));
        assert!(center.x.abs() < 1e-4 && center.y.abs() < 1e-4);
        assert!((0.0..=1.0).contains(&center.z));
        assert!(!light.cull_bounds(Vec3::new(99.0, -1.0, -1.0), Vec3::new(101.0, 1.0, 1.0)));
        assert!(light.cull_bounds(Vec3::new(-10.0, -1.0, -1.0), Vec3::new(-8.0, 1.0, 1.0)));
    }

    #[test]
    fn test_point_light_block_is_capped() {
        let lights: Vec<PointLight> = (0..12)
            .map(|i| PointLight::new(&format!("light{i}"), Vec3::splat(i as f32)))
            .collect();
        let constants = point_light_constants(&lights, 4);
        assert_eq!(constants.lights.iter().filter(|l| l.render > 0.0).count(), 4);
        assert_eq!(constants.lights[3].position, Vec3::splat(3.0));
    }
}
