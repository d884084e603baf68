//! Compute-shader particles
//!
//! Each emitter owns a storage buffer of [`GpuParticle`] records and a spawn
//! counter. Per frame the host resets the counter, dispatches
//! `particle_update` over every record, issues a memory barrier and then
//! draws one instance per record; dead records collapse in the vertex stage.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};

use super::ParticleInfo;
use crate::backend::GraphicsBackend;
use crate::error::RenderResult;
use crate::resources::{
    AtomicCounter, ParticleInfos, ShaderStorageBuffer, PARTICLE_BUFFER_BINDING, PARTICLE_COUNTER_BINDING,
};

/// Threads per workgroup of `particle_update`
pub const WORKGROUP_SIZE: u32 = 64;

/// WGSL type of the particle storage binding
pub const PARTICLE_WGSL_TYPE: &str = "array<GpuParticle>";

/// One particle record, laid out like `GpuParticle` in `particle_common.wgsl`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct GpuParticle {
    pub parent_matrix: Mat4,
    pub local_matrix: Mat4,
    pub position: Vec3,
    pub delay: f32,
    pub velocity: Vec3,
    pub life_time: f32,
    pub rotation: Vec3,
    pub elapsed_time: f32,
    pub scale: Vec3,
    pub opacity: f32,
    pub force: Vec3,
    pub sequence_ratio: f32,
    pub sequence_uv: Vec4,
    pub alive: u32,
    pub _pad: [u32; 3],
}

/// Uniform block contents describing `info` to the compute program.
pub fn particle_infos(info: &ParticleInfo) -> ParticleInfos {
    let flag = |on: bool| if on { 1.0 } else { 0.0 };
    ParticleInfos {
        spawn_volume_transform: info.spawn_volume_matrix(),
        spawn_volume_info: info.spawn_volume_info,
        spawn_volume_type: info.spawn_volume.index(),
        spawn_volume_abs: Vec3::new(
            flag(info.spawn_volume_abs[0]),
            flag(info.spawn_volume_abs[1]),
            flag(info.spawn_volume_abs[2]),
        ),
        max_particle_count: info.max_particle_count() as i32,
        delay: Vec2::new(info.delay.min, info.delay.max),
        life_time: Vec2::new(info.life_time.min, info.life_time.max),
        velocity_min: info.velocity_position.min,
        velocity_type: info.velocity_type.index(),
        velocity_max: info.velocity_position.max,
        force_gravity: info.force_gravity,
        scale_min: info.transform_scale.min,
        fade_in: info.fade_in,
        scale_max: info.transform_scale.max,
        fade_out: info.fade_out,
        rotation_min: info.transform_rotation.min,
        opacity: info.opacity,
        rotation_max: info.transform_rotation.max,
        play_speed: info.play_speed,
        cell_count: [info.cell_count[0] as i32, info.cell_count[1] as i32],
        loop_sequence: info.loop_sequence as i32,
        align_mode: info.align_mode.index(),
    }
}

/// Storage buffer and spawn counter of one GPU emitter
#[derive(Debug)]
pub struct GpuEmitter {
    particles: ShaderStorageBuffer,
    counter: AtomicCounter,
    max_count: u32,
}

impl GpuEmitter {
    /// Allocate `max_count` dead records.
    pub fn new(backend: &mut dyn GraphicsBackend, name: &str, max_count: u32) -> RenderResult<Self> {
        let max_count = max_count.max(1);
        let size = (std::mem::size_of::<GpuParticle>() as u64) * max_count as u64;
        let particles = ShaderStorageBuffer::new(
            backend,
            &format!("{}_particles", name),
            PARTICLE_BUFFER_BINDING,
            size,
        )?;
        particles.clear(backend)?;
        let counter = AtomicCounter::new(backend, &format!("{}_counter", name), PARTICLE_COUNTER_BINDING)?;
        log::debug!("Created GPU emitter {} with {} records", name, max_count);
        Ok(Self {
            particles,
            counter,
            max_count,
        })
    }

    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    pub fn dispatch_count(&self) -> u32 {
        self.max_count.div_ceil(WORKGROUP_SIZE)
    }

    /// Spawn and age every record with the currently bound compute program
    /// and particle blocks, then make the writes visible to the draw.
    pub fn dispatch(&self, backend: &mut dyn GraphicsBackend) -> RenderResult<()> {
        self.counter.set(backend, 0)?;
        self.particles.bind_storage_buffer(backend);
        self.counter.bind(backend);
        backend.dispatch_compute(self.dispatch_count(), 1, 1)?;
        backend.memory_barrier();
        Ok(())
    }

    /// Bind the records for the draw program.
    pub fn bind_for_draw(&self, backend: &mut dyn GraphicsBackend) {
        self.particles.bind_storage_buffer(backend);
    }

    /// Read every record back; used by tests and debugging.
    pub fn read_particles(&self, backend: &mut dyn GraphicsBackend) -> RenderResult<Vec<GpuParticle>> {
        let bytes = self.particles.read(backend)?;
        let record = std::mem::size_of::<GpuParticle>();
        Ok(bytes
            .chunks_exact(record)
            .take(self.max_count as usize)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    pub fn destroy(&self, backend: &mut dyn GraphicsBackend) {
        self.particles.destroy(backend);
        self.counter.destroy(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{DummyBackend, DummyCommand};
    use crate::particles::{AlignMode, FloatRange};

    #[test]
    fn test_record_matches_wgsl_layout() {
        assert_eq!(std::mem::size_of::<GpuParticle>(), 240);
        assert_eq!(std::mem::size_of::<GpuParticle>() % 16, 0);
    }

    #[test]
    fn test_new_emitter_records_are_dead() {
        let mut backend = DummyBackend::new(4, 4);
        let emitter = GpuEmitter::new(&mut backend, "sparks", 100).unwrap();
        assert_eq!(emitter.dispatch_count(), 2);
        let records = emitter.read_particles(&mut backend).unwrap();
        assert_eq!(records.len(), 100);
        assert!(records.iter().all(|p| p.alive == 0));
    }

    #[test]
    fn test_dispatch_is_followed_by_barrier() {
        let mut backend = DummyBackend::new(4, 4);
        let emitter = GpuEmitter::new(&mut backend, "sparks", 130).unwrap();
        let program = backend
            .create_program(&crate::backend::ProgramDescriptor::compute(
                "particle_update",
                "@compute @workgroup_size(64) fn cs_main() {}",
                WORKGROUP_SIZE,
            ))
            .unwrap();
        backend.use_program(program);
        backend.take_commands();
        emitter.dispatch(&mut backend).unwrap();
        let commands = backend.take_commands();
        let dispatch = commands
            .iter()
            .position(|c| matches!(c, DummyCommand::Dispatch { groups: [3, 1, 1], .. }))
            .unwrap();
        assert!(matches!(commands.get(dispatch + 1), Some(DummyCommand::Barrier)));
    }

    #[test]
    fn test_infos_carry_emitter_settings() {
        let info = ParticleInfo {
            spawn_count: 4,
            spawn_term: 0.5,
            life_time: FloatRange::new(1.0, 2.0),
            align_mode: AlignMode::VelocityAlign,
            cell_count: [4, 2],
            ..Default::default()
        };
        let infos = particle_infos(&info);
        assert_eq!(infos.max_particle_count, info.max_particle_count() as i32);
        assert_eq!(infos.life_time, Vec2::new(1.0, 2.0));
        assert_eq!(infos.align_mode, 2);
        assert_eq!(infos.cell_count, [4, 2]);
    }
}
