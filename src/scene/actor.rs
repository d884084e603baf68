//! Static and skeletal actors and the per-frame render lists

use glam::{Mat4, Vec3};
use slotmap::SlotMap;

use super::camera::Camera;
use super::light::MainLight;
use super::transform::Transform;
use crate::backend::ProgramHandle;
use crate::resources::{
    BoundingBox, GeometryId, GeometryStore, MaterialInstanceId, MaterialStore, MAX_BONES,
};

slotmap::new_key_type! {
    /// Key of an actor in the scene
    pub struct ActorId;
}

/// Which actor list a draw belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderGroup {
    Static,
    Skeletal,
}

/// One geometry of an actor with its material instance
#[derive(Debug, Clone, Copy)]
pub struct ActorPart {
    pub geometry: GeometryId,
    /// `None` draws with the default material instance.
    pub material_instance: Option<MaterialInstanceId>,
}

/// Bone palettes sampled over time, one palette per frame
#[derive(Debug, Clone)]
pub struct AnimationClip {
    pub name: String,
    pub frames: Vec<Vec<Mat4>>,
    pub frame_time: f32,
    pub looping: bool,
}

impl AnimationClip {
    pub fn new(name: &str, frames: Vec<Vec<Mat4>>, frame_time: f32) -> Self {
        Self {
            name: name.to_string(),
            frames,
            frame_time: frame_time.max(f32::EPSILON),
            looping: true,
        }
    }

    pub fn duration(&self) -> f32 {
        self.frames.len() as f32 * self.frame_time
    }

    /// Palette shown at `time` seconds.
    pub fn sample(&self, time: f32) -> Option<&[Mat4]> {
        if self.frames.is_empty() {
            return None;
        }
        let last = self.frames.len() - 1;
        let frame = (time.max(0.0) / self.frame_time) as usize;
        let frame = if self.looping {
            frame % self.frames.len()
        } else {
            frame.min(last)
        };
        self.frames.get(frame).map(Vec::as_slice)
    }
}

/// Scene object made of one or more geometry parts
#[derive(Debug, Clone)]
pub struct Actor {
    pub name: String,
    pub transform: Transform,
    pub parts: Vec<ActorPart>,
    pub visible: bool,
    pub cast_shadow: bool,
    /// Written by the object-id pass for picking
    pub object_id: f32,
    animation: Option<AnimationClip>,
    animation_time: f32,
    bone_matrices: Vec<Mat4>,
    prev_bone_matrices: Vec<Mat4>,
}

impl Actor {
    pub fn new(name: &str, parts: Vec<ActorPart>) -> Self {
        Self {
            name: name.to_string(),
            transform: Transform::new(),
            parts,
            visible: true,
            cast_shadow: true,
            object_id: 0.0,
            animation: None,
            animation_time: 0.0,
            bone_matrices: Vec::new(),
            prev_bone_matrices: Vec::new(),
        }
    }

    pub fn with_position(mut self, position: Vec3) -> Self {
        self.transform.set_position(position);
        self.transform.update();
        self
    }

    pub fn set_animation(&mut self, clip: AnimationClip) {
        self.animation = Some(clip);
        self.animation_time = 0.0;
    }

    /// Replace the bone palette; the previous one is kept for velocity.
    /// Palettes longer than the shader limit are truncated.
    pub fn set_bone_matrices(&mut self, matrices: &[Mat4]) {
        let count = matrices.len().min(MAX_BONES as usize);
        if count < matrices.len() {
            log::warn!("{}: {} bones exceed the limit of {}", self.name, matrices.len(), MAX_BONES);
        }
        self.prev_bone_matrices = std::mem::take(&mut self.bone_matrices);
        self.bone_matrices = matrices[..count].to_vec();
        if self.prev_bone_matrices.len() != self.bone_matrices.len() {
            self.prev_bone_matrices = self.bone_matrices.clone();
        }
    }

    pub fn bone_matrices(&self) -> &[Mat4] {
        &self.bone_matrices
    }

    pub fn prev_bone_matrices(&self) -> &[Mat4] {
        &self.prev_bone_matrices
    }

    /// Advance the transform and the animation clip.
    pub fn update(&mut self, delta: f32) {
        self.transform.update();
        if let Some(clip) = &self.animation {
            self.animation_time += delta;
            if let Some(palette) = clip.sample(self.animation_time).map(<[Mat4]>::to_vec) {
                self.set_bone_matrices(&palette);
            }
        }
    }

    /// World-space bounds of every part.
    pub fn world_bounds(&self, geometries: &GeometryStore) -> Option<BoundingBox> {
        let matrix = self.transform.matrix();
        let mut points = Vec::new();
        for part in &self.parts {
            let Some(geometry) = geometries.get(part.geometry) else {
                continue;
            };
            let (lo, hi) = (geometry.bounds.min, geometry.bounds.max);
            for i in 0..8 {
                let corner = Vec3::new(
                    if i & 1 == 0 { lo.x } else { hi.x },
                    if i & 2 == 0 { lo.y } else { hi.y },
                    if i & 4 == 0 { lo.z } else { hi.z },
                );
                points.push(matrix.transform_point3(corner));
            }
        }
        (!points.is_empty()).then(|| BoundingBox::from_points(&points))
    }
}

/// One draw of the render lists
#[derive(Debug, Clone, Copy)]
pub struct RenderInfo {
    pub actor: ActorId,
    pub geometry: GeometryId,
    pub material_instance: Option<MaterialInstanceId>,
    pub program: Option<ProgramHandle>,
}

impl RenderInfo {
    fn sort_key(&self) -> (Option<ProgramHandle>, Option<MaterialInstanceId>, ActorId) {
        (self.program, self.material_instance, self.actor)
    }
}

/// Draw lists for one frame
#[derive(Debug, Clone, Default)]
pub struct RenderLists {
    pub static_solid: Vec<RenderInfo>,
    pub static_translucent: Vec<RenderInfo>,
    pub skeletal_solid: Vec<RenderInfo>,
    pub skeletal_translucent: Vec<RenderInfo>,
    pub static_shadow: Vec<RenderInfo>,
    pub skeletal_shadow: Vec<RenderInfo>,
}

impl RenderLists {
    pub fn solid(&self, group: RenderGroup) -> &[RenderInfo] {
        match group {
            RenderGroup::Static => &self.static_solid,
            RenderGroup::Skeletal => &self.skeletal_solid,
        }
    }

    pub fn translucent(&self, group: RenderGroup) -> &[RenderInfo] {
        match group {
            RenderGroup::Static => &self.static_translucent,
            RenderGroup::Skeletal => &self.skeletal_translucent,
        }
    }

    pub fn shadow(&self, group: RenderGroup) -> &[RenderInfo] {
        match group {
            RenderGroup::Static => &self.static_shadow,
            RenderGroup::Skeletal => &self.skeletal_shadow,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.static_solid.is_empty()
            && self.static_translucent.is_empty()
            && self.skeletal_solid.is_empty()
            && self.skeletal_translucent.is_empty()
    }

    /// Split visible parts by group and translucency, cull against the
    /// camera frustum and the shadow volume, then sort each list by program,
    /// material instance and actor so consecutive draws share state.
    pub fn gather(
        actors: &SlotMap<ActorId, Actor>,
        geometries: &GeometryStore,
        materials: &MaterialStore,
        camera: &Camera,
        main_light: &MainLight,
    ) -> Self {
        let mut lists = Self::default();
        for (id, actor) in actors {
            if !actor.visible {
                continue;
            }
            let matrix = actor.transform.matrix();
            let scale = actor.transform.max_scale();
            for part in &actor.parts {
                let Some(geometry) = geometries.get(part.geometry) else {
                    log::warn!("{}: missing geometry", actor.name);
                    continue;
                };
                let instance = part.material_instance.and_then(|m| materials.get(m));
                let info = RenderInfo {
                    actor: id,
                    geometry: part.geometry,
                    material_instance: part.material_instance.filter(|_| instance.is_some()),
                    program: instance.map(|i| i.program()),
                };
                let translucent = instance.is_some_and(|i| i.is_translucent());
                let group = if geometry.skeletal {
                    RenderGroup::Skeletal
                } else {
                    RenderGroup::Static
                };

                let center = matrix.transform_point3(geometry.bounds.center);
                let radius = geometry.bounds.radius * scale;
                if !camera.cull_sphere(center, radius) {
                    let list = match (group, translucent) {
                        (RenderGroup::Static, false) => &mut lists.static_solid,
                        (RenderGroup::Static, true) => &mut lists.static_translucent,
                        (RenderGroup::Skeletal, false) => &mut lists.skeletal_solid,
                        (RenderGroup::Skeletal, true) => &mut lists.skeletal_translucent,
                    };
                    list.push(info);
                }

                if actor.cast_shadow && !translucent {
                    let lo = center - Vec3::splat(radius);
                    let hi = center + Vec3::splat(radius);
                    if !main_light.cull_bounds(lo, hi) {
                        match group {
                            RenderGroup::Static => lists.static_shadow.push(info),
                            RenderGroup::Skeletal => lists.skeletal_shadow.push(info),
                        }
                    }
                }
            }
        }
        for list in [
            &mut lists.static_solid,
            &mut lists.static_translucent,
            &mut lists.skeletal_solid,
            &mut lists.skeletal_translucent,
            &mut lists.static_shadow,
            &mut lists.skeletal_shadow,
        ] {
            list.sort_by_key(RenderInfo::sort_key);
        }
        lists
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RenderContext;
    use crate::resources::{GeometryData, DEFAULT_MATERIAL_INSTANCE};
    use glam::Vec2;

    fn scene_parts(ctx: &RenderContext) -> ActorPart {
        ActorPart {
            geometry: ctx.geometries.id_of("sphere").unwrap(),
            material_instance: ctx.materials.id_of(DEFAULT_MATERIAL_INSTANCE),
        }
    }

    fn camera() -> Camera {
        let mut camera = Camera::new("camera");
        camera.transform.set_position(Vec3::new(0.0, 0.0, 5.0));
        camera.update(Vec2::ZERO);
        camera
    }

    #[test]
    fn test_gather_culls_outside_frustum() {
        let ctx = RenderContext::headless(32, 32).unwrap();
        let part = scene_parts(&ctx);
        let mut actors = SlotMap::with_key();
        let visible = actors.insert(Actor::new("visible", vec![part]));
        actors.insert(Actor::new("behind", vec![part]).with_position(Vec3::new(500.0, 0.0, 0.0)));
        let mut light = MainLight::new("sun");
        light.update(Vec3::new(0.0, 0.0, 5.0));

        let lists = RenderLists::gather(&actors, &ctx.geometries, &ctx.materials, &camera(), &light);
        assert_eq!(lists.static_solid.len(), 1);
        assert_eq!(lists.static_solid[0].actor, visible);
        assert!(lists.skeletal_solid.is_empty());
        assert_eq!(lists.static_shadow.len(), 1);
    }

    #[test]
    fn test_gather_sorts_by_program() {
        let mut ctx = RenderContext::headless(32, 32).unwrap();
        let gpu = ctx.backend.as_dyn_mut();
        let prepass = ctx
            .materials
            .create_instance(gpu, &ctx.textures, "prepass_instance", "prepass", &Default::default())
            .unwrap();
        let sphere = ctx.geometries.id_of("sphere").unwrap();
        let mut actors = SlotMap::with_key();
        for i in 0..4 {
            let material_instance = if i % 2 == 0 {
                ctx.materials.id_of(DEFAULT_MATERIAL_INSTANCE)
            } else {
                Some(prepass)
            };
            actors.insert(Actor::new(
                &format!("actor{i}"),
                vec![ActorPart {
                    geometry: sphere,
                    material_instance,
                }],
            ));
        }
        let light = MainLight::new("sun");
        let lists = RenderLists::gather(&actors, &ctx.geometries, &ctx.materials, &camera(), &light);
        let programs: Vec<_> = lists.static_solid.iter().map(|i| i.program).collect();
        assert_eq!(programs.len(), 4);
        assert_eq!(programs[0], programs[1]);
        assert_eq!(programs[2], programs[3]);
        assert_ne!(programs[1], programs[2]);
    }

    #[test]
    fn test_bone_palette_keeps_previous() {
        let mut actor = Actor::new("skinned", Vec::new());
        actor.set_bone_matrices(&[Mat4::IDENTITY; 2]);
        assert_eq!(actor.prev_bone_matrices(), actor.bone_matrices());
        let moved = Mat4::from_translation(Vec3::X);
        actor.set_bone_matrices(&[moved; 2]);
        assert_eq!(actor.prev_bone_matrices(), &[Mat4::IDENTITY; 2]);
        assert_eq!(actor.bone_matrices(), &[moved; 2]);
    }

    #[test]
    fn test_animation_clip_loops() {
        let frames = vec![vec![Mat4::IDENTITY], vec![Mat4::from_translation(Vec3::Y)]];
        let clip = AnimationClip::new("walk", frames, 0.5);
        assert_eq!(clip.duration(), 1.0);
        assert_eq!(clip.sample(0.75).unwrap()[0], Mat4::from_translation(Vec3::Y));
        assert_eq!(clip.sample(1.25).unwrap()[0], Mat4::IDENTITY);
    }

    #[test]
    fn test_world_bounds_follow_transform() {
        let mut ctx = RenderContext::headless(16, 16).unwrap();
        let gpu = ctx.backend.as_dyn_mut();
        let cube = ctx.geometries.create(gpu, &GeometryData::cube()).unwrap();
        let actor = Actor::new(
            "cube",
            vec![ActorPart {
                geometry: cube,
                material_instance: None,
            }],
        )
        .with_position(Vec3::new(10.0, 0.0, 0.0));
        let bounds = actor.world_bounds(&ctx.geometries).unwrap();
        assert!((bounds.center - Vec3::new(10.0, 0.0, 0.0)).length() < 1e-4);
    }
}
