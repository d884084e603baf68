//! Scene state consumed by the renderer
//!
//! The scene holds what the frame loop reads: the camera, the main light and
//! point lights, actors, light probes, the atmosphere, the ocean and the
//! particle effects. Resources are referenced by id only.

pub mod actor;
pub mod atmosphere;
pub mod camera;
pub mod light;
pub mod light_probe;
pub mod transform;

pub use actor::*;
pub use atmosphere::Atmosphere;
pub use camera::*;
pub use light::*;
pub use light_probe::*;
pub use transform::*;

use glam::{Vec2, Vec3};
use slotmap::SlotMap;

use crate::context::RenderContext;
use crate::ocean::Ocean;
use crate::particles::EffectManager;
use crate::resources::{PointLightConstants, MAX_POINT_LIGHTS};

/// Everything the renderer draws in one frame
pub struct Scene {
    pub name: String,
    pub camera: Camera,
    pub main_light: MainLight,
    pub point_lights: Vec<PointLight>,
    pub actors: SlotMap<ActorId, Actor>,
    pub light_probes: Vec<LightProbe>,
    pub atmosphere: Atmosphere,
    pub ocean: Ocean,
    pub effects: EffectManager,
    /// Name of the object selected by the editor
    pub selected: Option<String>,
    max_point_lights: usize,
    time: f32,
}

impl Scene {
    pub fn new(name: &str, gpu_particles: bool) -> Self {
        let mut camera = Camera::new("main_camera");
        camera.transform.set_position(Vec3::new(0.0, 1.0, 5.0));
        camera.update(Vec2::ZERO);
        Self {
            name: name.to_string(),
            camera,
            main_light: MainLight::new("main_light"),
            point_lights: Vec::new(),
            actors: SlotMap::with_key(),
            light_probes: Vec::new(),
            atmosphere: Atmosphere::new("atmosphere"),
            ocean: Ocean::new("ocean"),
            effects: EffectManager::new(gpu_particles),
            selected: None,
            max_point_lights: MAX_POINT_LIGHTS,
            time: 0.0,
        }
    }

    /// Seconds since the scene was created.
    pub fn time(&self) -> f32 {
        self.time
    }

    pub fn set_max_point_lights(&mut self, count: usize) {
        self.max_point_lights = count.min(MAX_POINT_LIGHTS);
    }

    /// Advance every object by `delta`. `jitter` offsets the camera's
    /// jittered projection for this frame.
    pub fn update(&mut self, delta: f32, jitter: Vec2) {
        self.time += delta;
        self.camera.update(jitter);
        self.main_light.update(self.camera.position());
        for light in &mut self.point_lights {
            light.update();
        }
        for actor in self.actors.values_mut() {
            actor.update(delta);
        }
        for probe in &mut self.light_probes {
            if probe.transform.update() {
                probe.invalidate();
            }
        }
        self.ocean.update(delta);
        self.effects.update(delta, &self.camera);
    }

    pub fn add_actor(&mut self, actor: Actor) -> ActorId {
        log::debug!("Adding actor {}", actor.name);
        self.actors.insert(actor)
    }

    pub fn remove_actor(&mut self, id: ActorId) -> Option<Actor> {
        self.actors.remove(id)
    }

    pub fn find_actor(&self, name: &str) -> Option<ActorId> {
        self.actors
            .iter()
            .find(|(_, actor)| actor.name == name)
            .map(|(id, _)| id)
    }

    pub fn add_point_light(&mut self, light: PointLight) {
        self.point_lights.push(light);
    }

    /// Add a probe; it is captured on the next frame.
    pub fn add_light_probe(&mut self, probe: LightProbe) -> usize {
        self.light_probes.push(probe);
        self.light_probes.len() - 1
    }

    pub fn point_light_constants(&self) -> PointLightConstants {
        point_light_constants(&self.point_lights, self.max_point_lights)
    }

    /// Frustum- and shadow-culled draw lists for this frame.
    pub fn gather_render_lists(&self, ctx: &RenderContext) -> RenderLists {
        RenderLists::gather(
            &self.actors,
            &ctx.geometries,
            &ctx.materials,
            &self.camera,
            &self.main_light,
        )
    }

    /// Names of every object in the scene, cameras and lights first.
    pub fn object_names(&self) -> Vec<String> {
        let mut names = vec![self.camera.name.clone(), self.main_light.name.clone()];
        names.extend(self.point_lights.iter().map(|l| l.name.clone()));
        names.extend(self.light_probes.iter().map(|p| p.name.clone()));
        names.extend(self.actors.values().map(|a| a.name.clone()));
        names.push(self.atmosphere.name.clone());
        names.push(self.ocean.name.clone());
        names.extend(self.effects.effects().map(|(_, e)| e.name.clone()));
        names
    }

    /// Release GPU state owned by scene objects.
    pub fn destroy(&mut self, ctx: &mut RenderContext) {
        self.effects.destroy(ctx);
        let gpu = ctx.backend.as_dyn_mut();
        for probe in &mut self.light_probes {
            if let Some(texture) = probe.texture_probe.take() {
                texture.destroy(gpu);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::DEFAULT_MATERIAL_INSTANCE;

    #[test]
    fn test_update_advances_time_and_camera() {
        let mut scene = Scene::new("test", false);
        scene.camera.transform.set_position(Vec3::new(0.0, 0.0, 10.0));
        scene.update(0.5, Vec2::ZERO);
        assert_eq!(scene.time(), 0.5);
        assert_eq!(scene.camera.position(), Vec3::new(0.0, 0.0, 10.0));
        assert!((scene.ocean.time() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_find_and_remove_actor() {
        let ctx = RenderContext::headless(16, 16).unwrap();
        let mut scene = Scene::new("test", false);
        let part = ActorPart {
            geometry: ctx.geometries.id_of("sphere").unwrap(),
            material_instance: ctx.materials.id_of(DEFAULT_MATERIAL_INSTANCE),
        };
        let id = scene.add_actor(Actor::new("sphere", vec![part]));
        assert_eq!(scene.find_actor("sphere"), Some(id));
        assert!(scene.object_names().contains(&"sphere".to_string()));
        assert!(scene.remove_actor(id).is_some());
        assert_eq!(scene.find_actor("sphere"), None);
    }

    #[test]
    fn test_point_lights_are_capped() {
        let mut scene = Scene::new("test", false);
        scene.set_max_point_lights(2);
        for i in 0..4 {
            scene.add_point_light(PointLight::new(&format!("light{i}"), Vec3::splat(i as f32)));
        }
        let constants = scene.point_light_constants();
        assert_eq!(constants.lights[1].render, 1.0);
        assert_eq!(constants.lights[2].render, 0.0);
    }

    #[test]
    fn test_moving_probe_invalidates_capture() {
        let mut scene = Scene::new("test", false);
        let index = scene.add_light_probe(LightProbe::new("probe", Vec3::ZERO));
        scene.update(0.016, Vec2::ZERO);
        scene.light_probes[index].captured = true;
        scene.light_probes[index].transform.set_position(Vec3::Y);
        scene.update(0.016, Vec2::ZERO);
        assert!(!scene.light_probes[index].captured);
    }
}
