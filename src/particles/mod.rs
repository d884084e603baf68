//! Particle effects
//!
//! An [`EffectInfo`] describes a set of emitters; an [`Effect`] plays one at
//! a transform. Emitters run either on the CPU, writing one instance record
//! per renderable particle, or in the `particle_update` compute program (see
//! [`gpu`]). The [`EffectManager`] updates, culls and draws all effects,
//! grouping draws by blend mode.

mod emitter;
pub mod gpu;

use std::path::Path;

use glam::{Mat4, Vec2, Vec3, Vec4};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};

pub use emitter::*;
use gpu::GpuEmitter;

use crate::backend::*;
use crate::context::RenderContext;
use crate::error::{RenderError, RenderResult};
use crate::math::{euler_to_matrix, Lcg};
use crate::resources::{
    InstanceBuffer, MaterialInstanceId, ParticleCommon, Texture, VertexArrayBuffer, FLAT_WHITE, INSTANCE_LOCATION,
};
use crate::scene::camera::Camera;
use crate::scene::transform::Transform;

/// Seed of the manager's spawn generator
pub const PARTICLE_SEED: u32 = 5489;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlendMode {
    #[default]
    Alpha,
    Additive,
    Multiply,
    Subtract,
}

impl BlendMode {
    pub fn index(&self) -> i32 {
        *self as i32
    }

    pub fn blend_state(&self) -> BlendState {
        match self {
            BlendMode::Alpha => BlendState::ALPHA,
            BlendMode::Additive => BlendState::ADDITIVE,
            BlendMode::Multiply => BlendState {
                equation: BlendEquation::Add,
                src: BlendFactor::Zero,
                dst: BlendFactor::SrcColor,
            },
            BlendMode::Subtract => BlendState {
                equation: BlendEquation::Subtract,
                src: BlendFactor::One,
                dst: BlendFactor::One,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpawnVolume {
    #[default]
    Box,
    Sphere,
    Cone,
    Cylinder,
}

impl SpawnVolume {
    pub fn index(&self) -> i32 {
        *self as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VelocityType {
    #[default]
    Random,
    SpawnDirection,
    Hurricane,
}

impl VelocityType {
    pub fn index(&self) -> i32 {
        *self as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlignMode {
    None,
    #[default]
    Billboard,
    VelocityAlign,
}

impl AlignMode {
    pub fn index(&self) -> i32 {
        *self as i32
    }
}

/// Scalar drawn uniformly from `[min, max)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FloatRange {
    pub min: f32,
    pub max: f32,
}

impl FloatRange {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    pub fn constant(value: f32) -> Self {
        Self::new(value, value)
    }

    pub fn uniform(&self, rng: &mut Lcg) -> f32 {
        rng.range(self.min, self.max)
    }

    pub fn max_value(&self) -> f32 {
        self.min.max(self.max)
    }
}

/// Vector drawn uniformly per component
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec3Range {
    pub min: Vec3,
    pub max: Vec3,
}

impl Vec3Range {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn constant(value: Vec3) -> Self {
        Self::new(value, value)
    }

    pub fn uniform(&self, rng: &mut Lcg) -> Vec3 {
        rng.range_vec3(self.min, self.max)
    }
}

/// Settings of one emitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticleInfo {
    pub name: String,
    pub enable: bool,
    pub enable_gpu_particle: bool,
    pub blend_mode: BlendMode,
    pub spawn_count: u32,
    /// Seconds between batches; zero or less spawns every frame
    pub spawn_term: f32,
    /// Negative for an endless emitter
    pub spawn_end_time: f32,
    pub align_mode: AlignMode,
    pub color: Vec4,
    pub opacity: f32,
    pub fade_in: f32,
    pub fade_out: f32,
    /// Geometry name; empty draws the quad
    pub mesh: String,
    /// Material instance name; empty uses the built-in particle program
    pub material_instance: String,
    pub texture_diffuse: String,
    /// Flipbook columns and rows
    pub cell_count: [u32; 2],
    pub play_speed: f32,
    pub loop_sequence: bool,
    pub delay: FloatRange,
    /// A maximum of zero or less never expires
    pub life_time: FloatRange,
    pub spawn_volume: SpawnVolume,
    /// Box extents, sphere radius in `x`, cone radii in `xy` and height in
    /// `z`, cylinder radius in `x` and height in `z`
    pub spawn_volume_info: Vec3,
    pub spawn_volume_abs: [bool; 3],
    pub spawn_volume_position: Vec3,
    pub spawn_volume_rotation: Vec3,
    pub spawn_volume_scale: Vec3,
    pub transform_position: Vec3Range,
    pub transform_rotation: Vec3Range,
    pub transform_scale: Vec3Range,
    pub velocity_type: VelocityType,
    pub velocity_position: Vec3Range,
    pub velocity_rotation: Vec3Range,
    pub velocity_scale: Vec3Range,
    /// Speed gained per second along the velocity
    pub velocity_acceleration: f32,
    /// Minimum and maximum speed; a maximum of zero or less is unbounded
    pub velocity_limit: Vec2,
    pub force_gravity: f32,
}

impl Default for ParticleInfo {
    fn default() -> Self {
        Self {
            name: "particle".to_string(),
            enable: true,
            enable_gpu_particle: false,
            blend_mode: BlendMode::Alpha,
            spawn_count: 1,
            spawn_term: 0.1,
            spawn_end_time: -1.0,
            align_mode: AlignMode::Billboard,
            color: Vec4::ONE,
            opacity: 1.0,
            fade_in: 0.0,
            fade_out: 0.0,
            mesh: String::new(),
            material_instance: String::new(),
            texture_diffuse: String::new(),
            cell_count: [1, 1],
            play_speed: 0.0,
            loop_sequence: true,
            delay: FloatRange::constant(0.0),
            life_time: FloatRange::constant(1.0),
            spawn_volume: SpawnVolume::Box,
            spawn_volume_info: Vec3::ZERO,
            spawn_volume_abs: [false; 3],
            spawn_volume_position: Vec3::ZERO,
            spawn_volume_rotation: Vec3::ZERO,
            spawn_volume_scale: Vec3::ONE,
            transform_position: Vec3Range::constant(Vec3::ZERO),
            transform_rotation: Vec3Range::constant(Vec3::ZERO),
            transform_scale: Vec3Range::constant(Vec3::ONE),
            velocity_type: VelocityType::Random,
            velocity_position: Vec3Range::constant(Vec3::ZERO),
            velocity_rotation: Vec3Range::constant(Vec3::ZERO),
            velocity_scale: Vec3Range::constant(Vec3::ZERO),
            velocity_acceleration: 0.0,
            velocity_limit: Vec2::ZERO,
            force_gravity: 0.0,
        }
    }
}

impl ParticleInfo {
    /// Capacity needed so a full spawn schedule never runs out of slots.
    pub fn max_particle_count(&self) -> u32 {
        if self.spawn_term <= 0.0 {
            return self.spawn_count;
        }
        let total_time = self.delay.max_value() + self.life_time.max_value();
        let batches = (total_time / self.spawn_term).ceil().max(0.0) as u32;
        self.spawn_count * batches + self.spawn_count
    }

    pub fn is_infinite_emitter(&self) -> bool {
        self.spawn_end_time < 0.0
    }

    pub fn is_infinite_particle(&self) -> bool {
        self.life_time.max_value() <= 0.0
    }

    pub fn total_cells(&self) -> u32 {
        self.cell_count[0].max(1) * self.cell_count[1].max(1)
    }

    /// Top-left uv of flipbook cell `index`, row-major from the top.
    pub fn cell_uv(&self, index: u32) -> Vec2 {
        let columns = self.cell_count[0].max(1);
        let rows = self.cell_count[1].max(1);
        Vec2::new(
            (index % columns) as f32 / columns as f32,
            (index / columns) as f32 / rows as f32,
        )
    }

    pub fn spawn_volume_matrix(&self) -> Mat4 {
        let r = self.spawn_volume_rotation;
        Mat4::from_translation(self.spawn_volume_position)
            * euler_to_matrix(r.x, r.y, r.z)
            * Mat4::from_scale(self.spawn_volume_scale)
    }

    /// Sample the spawn volume in emitter space.
    pub fn spawn_position(&self, rng: &mut Lcg) -> Vec3 {
        let info = self.spawn_volume_info;
        let mut position = match self.spawn_volume {
            SpawnVolume::Box => rng.range_vec3(Vec3::splat(-0.5), Vec3::splat(0.5)) * info,
            SpawnVolume::Sphere => {
                let direction = rng
                    .range_vec3(Vec3::NEG_ONE, Vec3::ONE)
                    .try_normalize()
                    .unwrap_or(Vec3::Y);
                direction * info.x * rng.next_f32().cbrt()
            }
            SpawnVolume::Cone => {
                let h = rng.next_f32();
                let angle = rng.next_f32() * std::f32::consts::TAU;
                let radius = crate::math::lerp(info.x, info.y, h) * rng.next_f32().sqrt();
                Vec3::new(angle.cos() * radius, h * info.z, angle.sin() * radius)
            }
            SpawnVolume::Cylinder => {
                let angle = rng.next_f32() * std::f32::consts::TAU;
                let radius = info.x * rng.next_f32().sqrt();
                Vec3::new(angle.cos() * radius, rng.next_f32() * info.z, angle.sin() * radius)
            }
        };
        for axis in 0..3 {
            if self.spawn_volume_abs[axis] {
                position[axis] = position[axis].abs();
            }
        }
        self.spawn_volume_matrix().transform_point3(position)
    }

    pub fn limit_velocity(&self, velocity: Vec3) -> Vec3 {
        let (min, max) = (self.velocity_limit.x, self.velocity_limit.y);
        if max <= 0.0 && min <= 0.0 {
            return velocity;
        }
        let speed = velocity.length();
        if speed == 0.0 {
            return velocity;
        }
        let clamped = if max > 0.0 { speed.clamp(min.min(max), max) } else { speed.max(min) };
        velocity * (clamped / speed)
    }

    /// Opacity factor from fade-in and fade-out.
    pub fn fade(&self, elapsed_time: f32, life_time: f32) -> f32 {
        let mut factor = 1.0;
        if self.fade_in > 0.0 {
            factor *= (elapsed_time / self.fade_in).clamp(0.0, 1.0);
        }
        let remaining = life_time - elapsed_time;
        if self.fade_out > 0.0 && remaining < self.fade_out {
            factor *= (remaining / self.fade_out).clamp(0.0, 1.0);
        }
        factor
    }

    /// Set one field from its JSON or plain-text form.
    pub fn set_attribute(&mut self, name: &str, value: &str) -> RenderResult<()> {
        set_json_attribute(self, name, value)
    }
}

/// Replace field `name` of a serializable value. Text that is not valid
/// JSON is taken as a string.
fn set_json_attribute<T: Serialize + DeserializeOwned>(target: &mut T, name: &str, value: &str) -> RenderResult<()> {
    let invalid = |message: String| RenderError::InvalidAttribute {
        attribute: name.to_string(),
        message,
    };
    let mut json = serde_json::to_value(&*target)?;
    let slot = json
        .get_mut(name)
        .ok_or_else(|| invalid("unknown attribute".into()))?;
    *slot = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    *target = serde_json::from_value(json).map_err(|e| invalid(e.to_string()))?;
    Ok(())
}

/// A named set of emitters, stored as a JSON resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectInfo {
    pub name: String,
    /// Culling radius before the effect's scale
    pub radius: f32,
    pub particle_infos: Vec<ParticleInfo>,
}

impl Default for EffectInfo {
    fn default() -> Self {
        Self {
            name: "effect".to_string(),
            radius: 1.0,
            particle_infos: vec![ParticleInfo::default()],
        }
    }
}

impl EffectInfo {
    pub fn load(path: impl AsRef<Path>) -> RenderResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> RenderResult<()> {
        std::fs::write(path.as_ref(), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Set an attribute of the effect, or of particle info `index` when given.
    pub fn set_attribute(&mut self, name: &str, value: &str, index: Option<usize>) -> RenderResult<()> {
        match index {
            Some(index) => {
                let info = self.particle_infos.get_mut(index).ok_or_else(|| RenderError::InvalidAttribute {
                    attribute: name.to_string(),
                    message: format!("no particle info {}", index),
                })?;
                info.set_attribute(name, value)
            }
            None => set_json_attribute(self, name, value),
        }
    }

    pub fn add_particle_info(&mut self, info: ParticleInfo) {
        self.particle_infos.push(info);
    }

    pub fn delete_particle_info(&mut self, index: usize) -> Option<ParticleInfo> {
        (index < self.particle_infos.len()).then(|| self.particle_infos.remove(index))
    }
}

new_key_type! {
    pub struct EffectId;
}

/// A playing instance of an [`EffectInfo`]
#[derive(Debug)]
pub struct Effect {
    pub name: String,
    pub info: EffectInfo,
    pub transform: Transform,
    emitters: Vec<Emitter>,
    alive: bool,
}

impl Effect {
    pub fn new(name: &str, info: EffectInfo, transform: Transform) -> Self {
        Self {
            name: name.to_string(),
            info,
            transform,
            emitters: Vec::new(),
            alive: false,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn emitters(&self) -> &[Emitter] {
        &self.emitters
    }

    /// Rebuild the emitters from the info and start them. GPU buffers of the
    /// previous run are returned for release.
    pub fn play(&mut self, rng: &mut Lcg, gpu_particles: bool) -> Vec<GpuEmitter> {
        let released = self.stop();
        self.transform.update();
        let parent = self.transform.matrix();
        self.emitters = self
            .info
            .particle_infos
            .iter()
            .filter(|info| info.enable)
            .map(|info| Emitter::new(info.clone()))
            .collect();
        for emitter in &mut self.emitters {
            emitter.play(parent, rng, gpu_particles);
        }
        self.alive = true;
        released
    }

    pub fn stop(&mut self) -> Vec<GpuEmitter> {
        self.alive = false;
        self.emitters.iter_mut().filter_map(Emitter::stop).collect()
    }

    /// Returns the number of live particles.
    pub fn update(&mut self, dt: f32, rng: &mut Lcg) -> usize {
        if !self.alive {
            return 0;
        }
        self.transform.update();
        let parent = self.transform.matrix();
        let count = self
            .emitters
            .iter_mut()
            .map(|emitter| emitter.update(dt, parent, rng))
            .sum();
        self.alive = self.emitters.iter().any(Emitter::is_alive);
        count
    }

    pub fn cull_radius(&self) -> f32 {
        self.info.radius * self.transform.max_scale()
    }
}

#[derive(Debug, Clone, Copy)]
struct ParticleMaterials {
    cpu: MaterialInstanceId,
    gpu: MaterialInstanceId,
    update: MaterialInstanceId,
}

/// Owns the playing effects and draws them
pub struct EffectManager {
    effects: SlotMap<EffectId, Effect>,
    render_list: Vec<(EffectId, usize, BlendMode)>,
    rng: Lcg,
    gpu_particles: bool,
    materials: Option<ParticleMaterials>,
    instance_buffer: Option<InstanceBuffer>,
    instances: Vec<ParticleInstance>,
    released: Vec<GpuEmitter>,
    alive_particle_count: usize,
    delta_time: f32,
    time: f32,
}

impl EffectManager {
    pub fn new(gpu_particles: bool) -> Self {
        Self {
            effects: SlotMap::with_key(),
            render_list: Vec::new(),
            rng: Lcg::new(PARTICLE_SEED),
            gpu_particles,
            materials: None,
            instance_buffer: None,
            instances: Vec::new(),
            released: Vec::new(),
            alive_particle_count: 0,
            delta_time: 0.0,
            time: 0.0,
        }
    }

    pub fn add_effect(&mut self, effect: Effect) -> EffectId {
        self.effects.insert(effect)
    }

    pub fn get(&self, id: EffectId) -> Option<&Effect> {
        self.effects.get(id)
    }

    pub fn get_mut(&mut self, id: EffectId) -> Option<&mut Effect> {
        self.effects.get_mut(id)
    }

    pub fn find(&self, name: &str) -> Option<EffectId> {
        self.effects.iter().find(|(_, e)| e.name == name).map(|(id, _)| id)
    }

    pub fn effects(&self) -> impl Iterator<Item = (EffectId, &Effect)> {
        self.effects.iter()
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn alive_particle_count(&self) -> usize {
        self.alive_particle_count
    }

    /// Emitters drawn by the next [`render`](Self::render), in draw order.
    pub fn render_list(&self) -> &[(EffectId, usize, BlendMode)] {
        &self.render_list
    }

    pub fn play_effect(&mut self, id: EffectId) {
        if let Some(effect) = self.effects.get_mut(id) {
            log::debug!("Playing effect {}", effect.name);
            let released = effect.play(&mut self.rng, self.gpu_particles);
            self.released.extend(released);
        }
    }

    pub fn destroy_effect(&mut self, id: EffectId) {
        if let Some(mut effect) = self.effects.remove(id) {
            self.released.extend(effect.stop());
        }
    }

    pub fn clear(&mut self) {
        for (_, mut effect) in self.effects.drain() {
            self.released.extend(effect.stop());
        }
        self.render_list.clear();
        self.alive_particle_count = 0;
    }

    /// Replace the info of every effect built from `info` and replay them.
    pub fn notify_effect_info_changed(&mut self, info: &EffectInfo) {
        let ids: Vec<EffectId> = self
            .effects
            .iter()
            .filter(|(_, e)| e.info.name == info.name)
            .map(|(id, _)| id)
            .collect();
        for id in ids {
            if let Some(effect) = self.effects.get_mut(id) {
                effect.info = info.clone();
            }
            self.play_effect(id);
        }
    }

    /// Update every effect, drop finished ones, and rebuild the render list
    /// from the effects inside the camera's side planes.
    pub fn update(&mut self, dt: f32, camera: &Camera) {
        self.delta_time = dt;
        self.time += dt;
        self.alive_particle_count = 0;
        self.render_list.clear();

        let mut finished = Vec::new();
        for (id, effect) in self.effects.iter_mut() {
            if !effect.is_alive() {
                continue;
            }
            self.alive_particle_count += effect.update(dt, &mut self.rng);
            if !effect.is_alive() {
                finished.push(id);
                continue;
            }
            if camera.cull_sphere(effect.transform.position(), effect.cull_radius()) {
                continue;
            }
            for (index, emitter) in effect.emitters().iter().enumerate() {
                if emitter.is_alive() {
                    self.render_list.push((id, index, emitter.info.blend_mode));
                }
            }
        }
        for id in finished {
            self.destroy_effect(id);
        }
        // stable, so effects keep their order within a blend mode
        self.render_list.sort_by_key(|(_, _, blend)| blend.index());
    }

    fn prepare(&mut self, ctx: &mut RenderContext) -> RenderResult<ParticleMaterials> {
        if let Some(materials) = self.materials {
            return Ok(materials);
        }
        let gpu = ctx.backend.as_dyn_mut();
        let mut create = |name: &str, shader: &str| {
            ctx.materials
                .create_instance(gpu, &ctx.textures, name, shader, &Default::default())
        };
        let materials = ParticleMaterials {
            cpu: create("effect.particle", "particle")?,
            gpu: create("effect.particle_gpu", "particle_gpu")?,
            update: create("effect.particle_update", "particle_update")?,
        };
        self.instance_buffer = Some(InstanceBuffer::new(
            gpu,
            "particle_instances",
            INSTANCE_LOCATION,
            &INSTANCE_ATTRIBUTES,
            256,
        )?);
        self.materials = Some(materials);
        Ok(materials)
    }

    /// Draw the render list into the bound framebuffer.
    pub fn render(&mut self, ctx: &mut RenderContext, camera: &Camera) -> RenderResult<()> {
        for released in self.released.drain(..) {
            released.destroy(ctx.backend.as_dyn_mut());
        }
        if self.render_list.is_empty() {
            return Ok(());
        }
        let materials = self.prepare(ctx)?;
        let previous = ctx.gpu().pipeline_state();
        let result = self.render_emitters(ctx, camera, materials);
        ctx.gpu().set_pipeline_state(&previous);
        result
    }

    fn render_emitters(
        &mut self,
        ctx: &mut RenderContext,
        camera: &Camera,
        materials: ParticleMaterials,
    ) -> RenderResult<()> {
        let inv_view_origin = camera.inv_view_origin();
        let mut current_blend = None;

        for (id, index, blend) in self.render_list.clone() {
            let Some(effect) = self.effects.get(id) else {
                continue;
            };
            let parent = effect.transform.matrix();
            let Some(emitter) = effect.emitters().get(index) else {
                continue;
            };
            let info = emitter.info.clone();
            let mesh = particle_mesh(ctx, &info)?;
            let texture = particle_texture(ctx, &info)?;

            let gpu = ctx.backend.as_dyn_mut();
            if current_blend != Some(blend) {
                gpu.set_pipeline_state(&PipelineState {
                    depth_write: false,
                    cull_face: CullFace::None,
                    blend: Some(blend.blend_state()),
                    ..Default::default()
                });
                current_blend = Some(blend);
            }
            ctx.uniform_blocks
                .particle_infos
                .bind_uniform_block(gpu, &gpu::particle_infos(&info))?;

            if emitter.is_gpu() {
                let seed = (self.rng.next_f64() * u32::MAX as f64) as u32;
                ctx.uniform_blocks.particle_common.bind_uniform_block(
                    gpu,
                    &ParticleCommon {
                        particle_matrix: parent,
                        time: emitter.elapsed_time(),
                        delta_time: self.delta_time,
                        spawn_count: emitter.gpu_spawn_count() as i32,
                        seed,
                    },
                )?;
                let Some(emitter) = self.effects.get_mut(id).and_then(|e| e.emitters.get_mut(index)) else {
                    continue;
                };
                if emitter.gpu.is_none() {
                    let name = format!("{}_{}", id_label(id), info.name);
                    emitter.gpu = Some(GpuEmitter::new(gpu, &name, info.max_particle_count())?);
                }
                let Some(records) = emitter.gpu.as_ref() else {
                    continue;
                };
                ctx.materials.use_instance(gpu, materials.update)?;
                records.dispatch(gpu)?;

                let material = ctx.materials.use_instance(gpu, materials.gpu)?;
                material.bind(gpu, "color", info.color)?;
                material.bind(gpu, "texture_diffuse", &texture)?;
                records.bind_for_draw(gpu);
                mesh.draw_elements_instanced(gpu, records.max_count(), None)?;
            } else {
                self.instances.clear();
                let draw_count = emitter.write_instances(inv_view_origin, &mut self.instances);
                if draw_count == 0 {
                    continue;
                }
                let material_id = ctx
                    .materials
                    .id_of(&info.material_instance)
                    .unwrap_or(materials.cpu);
                let Some(instance_buffer) = self.instance_buffer.as_mut() else {
                    continue;
                };
                instance_buffer.bind_instance_buffer(gpu, bytemuck::cast_slice(&self.instances))?;
                let material = ctx.materials.use_instance(gpu, material_id)?;
                material.bind(gpu, "color", info.color)?;
                material.bind(gpu, "texture_diffuse", &texture)?;
                mesh.draw_elements_instanced(gpu, draw_count, Some(instance_buffer))?;
            }
        }
        Ok(())
    }

    pub fn destroy(&mut self, ctx: &mut RenderContext) {
        self.clear();
        let gpu = ctx.backend.as_dyn_mut();
        for released in self.released.drain(..) {
            released.destroy(gpu);
        }
        if let Some(buffer) = self.instance_buffer.take() {
            buffer.destroy(gpu);
        }
        self.materials = None;
    }
}

fn id_label(id: EffectId) -> String {
    format!("{:?}", id).replace(|c: char| !c.is_ascii_alphanumeric(), "")
}

fn particle_mesh(ctx: &RenderContext, info: &ParticleInfo) -> RenderResult<VertexArrayBuffer> {
    let name = if info.mesh.is_empty() { "quad" } else { info.mesh.as_str() };
    ctx.geometries
        .by_name(name)
        .or_else(|| ctx.geometries.by_name("quad"))
        .map(|g| g.vertex_buffer.clone())
        .ok_or_else(|| RenderError::MissingResource(format!("particle mesh {}", name)))
}

fn particle_texture(ctx: &RenderContext, info: &ParticleInfo) -> RenderResult<Texture> {
    ctx.textures
        .by_name(&info.texture_diffuse)
        .or_else(|| ctx.textures.by_name(FLAT_WHITE))
        .cloned()
        .ok_or_else(|| RenderError::MissingResource(FLAT_WHITE.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyCommand;

    fn sparks(blend_mode: BlendMode) -> EffectInfo {
        EffectInfo {
            name: "sparks".into(),
            radius: 2.0,
            particle_infos: vec![ParticleInfo {
                name: "spark".into(),
                blend_mode,
                spawn_count: 10,
                spawn_term: 0.1,
                spawn_end_time: 1.0,
                life_time: FloatRange::constant(1.0),
                ..Default::default()
            }],
        }
    }

    fn camera() -> Camera {
        let mut camera = Camera::new("camera");
        camera.transform.set_position(Vec3::new(0.0, 0.0, 5.0));
        camera.update(Vec2::ZERO);
        camera
    }

    #[test]
    fn test_max_particle_count() {
        let info = ParticleInfo {
            spawn_count: 10,
            spawn_term: 0.5,
            delay: FloatRange::new(0.0, 0.5),
            life_time: FloatRange::new(0.5, 1.0),
            ..Default::default()
        };
        assert_eq!(info.max_particle_count(), 10 * 3 + 10);
        let burst = ParticleInfo {
            spawn_count: 7,
            spawn_term: 0.0,
            ..Default::default()
        };
        assert_eq!(burst.max_particle_count(), 7);
    }

    #[test]
    fn test_blend_mode_mapping() {
        assert_eq!(BlendMode::Alpha.blend_state(), BlendState::ALPHA);
        assert_eq!(BlendMode::Additive.blend_state(), BlendState::ADDITIVE);
        let multiply = BlendMode::Multiply.blend_state();
        assert_eq!((multiply.src, multiply.dst), (BlendFactor::Zero, BlendFactor::SrcColor));
        assert_eq!(BlendMode::Subtract.blend_state().equation, BlendEquation::Subtract);
    }

    #[test]
    fn test_spawn_volumes_stay_inside() {
        let mut rng = Lcg::new(11);
        let sphere = ParticleInfo {
            spawn_volume: SpawnVolume::Sphere,
            spawn_volume_info: Vec3::new(2.0, 0.0, 0.0),
            ..Default::default()
        };
        let cylinder = ParticleInfo {
            spawn_volume: SpawnVolume::Cylinder,
            spawn_volume_info: Vec3::new(1.0, 0.0, 3.0),
            spawn_volume_abs: [false, false, false],
            ..Default::default()
        };
        let box_abs = ParticleInfo {
            spawn_volume: SpawnVolume::Box,
            spawn_volume_info: Vec3::new(2.0, 2.0, 2.0),
            spawn_volume_abs: [true, false, false],
            spawn_volume_position: Vec3::new(0.0, 10.0, 0.0),
            ..Default::default()
        };
        for _ in 0..200 {
            assert!(sphere.spawn_position(&mut rng).length() <= 2.0 + 1e-4);
            let p = cylinder.spawn_position(&mut rng);
            assert!(Vec2::new(p.x, p.z).length() <= 1.0 + 1e-4);
            assert!((0.0..=3.0).contains(&p.y));
            let p = box_abs.spawn_position(&mut rng);
            assert!(p.x >= 0.0 && p.x <= 1.0);
            assert!((p.y - 10.0).abs() <= 1.0);
        }
    }

    #[test]
    fn test_set_attribute_through_json() {
        let mut info = sparks(BlendMode::Alpha);
        info.set_attribute("spawn_count", "25", Some(0)).unwrap();
        info.set_attribute("blend_mode", "ADDITIVE", Some(0)).unwrap();
        info.set_attribute("velocity_position", r#"{"min":[0,1,0],"max":[0,2,0]}"#, Some(0))
            .unwrap();
        info.set_attribute("radius", "4.5", None).unwrap();
        assert_eq!(info.particle_infos[0].spawn_count, 25);
        assert_eq!(info.particle_infos[0].blend_mode, BlendMode::Additive);
        assert_eq!(info.particle_infos[0].velocity_position.max, Vec3::new(0.0, 2.0, 0.0));
        assert_eq!(info.radius, 4.5);
        let unknown = info.set_attribute("no_such_field", "1", Some(0)).unwrap_err();
        assert!(matches!(unknown, RenderError::InvalidAttribute { .. }));
        let bad = info.set_attribute("spawn_count", "many", Some(0)).unwrap_err();
        assert!(matches!(bad, RenderError::InvalidAttribute { .. }));
        assert!(info.set_attribute("spawn_count", "1", Some(4)).is_err());
    }

    #[test]
    fn test_effect_info_file_roundtrip() {
        let dir = std::env::temp_dir().join(format!("render_core_effect_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sparks.effect");
        let info = sparks(BlendMode::Multiply);
        info.save(&path).unwrap();
        assert_eq!(EffectInfo::load(&path).unwrap(), info);
        std::fs::write(&path, r#"{"name":"partial","particle_infos":[{"spawn_count":3}]}"#).unwrap();
        let partial = EffectInfo::load(&path).unwrap();
        assert_eq!(partial.radius, 1.0);
        assert_eq!(partial.particle_infos[0].spawn_count, 3);
        assert_eq!(partial.particle_infos[0].life_time, FloatRange::constant(1.0));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_manager_lifecycle() {
        let camera = camera();
        let mut manager = EffectManager::new(false);
        let id = manager.add_effect(Effect::new("fx", sparks(BlendMode::Alpha), Transform::default()));
        manager.play_effect(id);
        for _ in 0..90 {
            manager.update(1.0 / 60.0, &camera);
        }
        let emitter = &manager.get(id).unwrap().emitters()[0];
        assert_eq!(emitter.spawned_count(), 100);
        let alive = manager.alive_particle_count();
        assert!((30..=70).contains(&alive), "{alive} alive");
        for _ in 0..60 {
            manager.update(1.0 / 60.0, &camera);
        }
        assert!(manager.is_empty());
    }

    #[test]
    fn test_render_list_groups_blend_modes_and_culls() {
        let camera = camera();
        let mut manager = EffectManager::new(false);
        let modes = [BlendMode::Additive, BlendMode::Alpha, BlendMode::Additive, BlendMode::Alpha];
        for (i, mode) in modes.iter().enumerate() {
            let id = manager.add_effect(Effect::new(&format!("fx{}", i), sparks(*mode), Transform::default()));
            manager.play_effect(id);
        }
        let behind = manager.add_effect(Effect::new(
            "behind",
            sparks(BlendMode::Alpha),
            Transform::from_position(Vec3::new(0.0, 0.0, 50.0)),
        ));
        manager.play_effect(behind);
        manager.update(1.0 / 60.0, &camera);
        let blends: Vec<BlendMode> = manager.render_list().iter().map(|(_, _, b)| *b).collect();
        assert_eq!(
            blends,
            vec![BlendMode::Alpha, BlendMode::Alpha, BlendMode::Additive, BlendMode::Additive]
        );
        assert!(manager.render_list().iter().all(|(id, _, _)| *id != behind));
    }

    #[test]
    fn test_cpu_render_draws_instances() {
        let camera = camera();
        let mut ctx = RenderContext::headless(64, 64).unwrap();
        let mut manager = EffectManager::new(false);
        let id = manager.add_effect(Effect::new("fx", sparks(BlendMode::Additive), Transform::default()));
        manager.play_effect(id);
        manager.update(1.0 / 60.0, &camera);
        let previous = PipelineState {
            cull_face: CullFace::Front,
            ..Default::default()
        };
        ctx.gpu().set_pipeline_state(&previous);
        manager.render(&mut ctx, &camera).unwrap();
        assert_eq!(ctx.gpu().pipeline_state(), previous);
        let draw = ctx
            .dummy()
            .unwrap()
            .draws()
            .find(|d| d.program_name == "particle")
            .cloned()
            .unwrap();
        assert_eq!(draw.instance_count, 10);
        assert_eq!(draw.state.blend, Some(BlendState::ADDITIVE));
        assert!(!draw.state.depth_write);
        let stream = draw.instance_stream.unwrap();
        assert_eq!(stream.divisor, 1);
        assert_eq!(stream.layout.attributes.len(), 10);
        assert_eq!(stream.layout.attributes[0].location, INSTANCE_LOCATION);
    }

    #[test]
    fn test_gpu_render_dispatches_before_draw() {
        let camera = camera();
        let mut ctx = RenderContext::headless(64, 64).unwrap();
        let mut manager = EffectManager::new(true);
        let mut info = sparks(BlendMode::Alpha);
        info.particle_infos[0].enable_gpu_particle = true;
        let id = manager.add_effect(Effect::new("fx", info, Transform::default()));
        manager.play_effect(id);
        manager.update(1.0 / 60.0, &camera);
        assert!(manager.get(id).unwrap().emitters()[0].is_gpu());
        manager.render(&mut ctx, &camera).unwrap();
        let commands = ctx.dummy_mut().unwrap().take_commands();
        let dispatch = commands
            .iter()
            .position(|c| matches!(c, DummyCommand::Dispatch { program_name, .. } if program_name == "particle_update"))
            .unwrap();
        assert!(matches!(commands[dispatch + 1], DummyCommand::Barrier));
        let draw = commands[dispatch..]
            .iter()
            .find_map(|c| match c {
                DummyCommand::Draw(record) if record.program_name == "particle_gpu" => Some(record.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(draw.instance_count, 110);
    }
}
