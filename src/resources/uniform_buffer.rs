//! Uniform blocks, shader storage buffers and atomic counters
//!
//! The `#[repr(C)]` block structs mirror the declarations in
//! `shaders/common.wgsl` byte for byte.

use std::marker::PhantomData;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::backend::*;
use crate::error::RenderResult;

pub const SCENE_CONSTANTS_BINDING: u32 = 0;
pub const VIEW_CONSTANTS_BINDING: u32 = 1;
pub const VIEW_PROJECTION_BINDING: u32 = 2;
pub const LIGHT_CONSTANTS_BINDING: u32 = 3;
pub const POINT_LIGHT_CONSTANTS_BINDING: u32 = 4;
pub const PARTICLE_COMMON_BINDING: u32 = 5;
pub const PARTICLE_INFOS_BINDING: u32 = 6;

pub const MAX_POINT_LIGHTS: usize = 10;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct SceneConstants {
    pub time: f32,
    /// Frame index modulo the jitter sequence, 0 when TAA is off
    pub jitter_frame: f32,
    pub render_ssr: i32,
    pub render_ssao: i32,
    pub screen_size: Vec2,
    pub backbuffer_size: Vec2,
    pub mouse_pos: Vec2,
    pub delta_time: f32,
    pub _pad0: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct ViewConstants {
    pub view: Mat4,
    pub inv_view: Mat4,
    /// View matrix without translation
    pub view_origin: Mat4,
    pub inv_view_origin: Mat4,
    /// Jittered projection
    pub projection: Mat4,
    pub inv_projection: Mat4,
    pub camera_position: Vec4,
    pub near_far: Vec2,
    pub jitter_delta: Vec2,
    pub jitter_offset: Vec2,
    pub _pad0: Vec2,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct ViewProjection {
    pub view_projection: Mat4,
    pub prev_view_projection: Mat4,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct LightConstants {
    pub shadow_matrix: Mat4,
    pub light_position: Vec3,
    pub shadow_exp: f32,
    pub light_direction: Vec3,
    pub shadow_bias: f32,
    pub light_color: Vec3,
    pub shadow_samples: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct PointLightData {
    pub color: Vec3,
    pub radius: f32,
    pub position: Vec3,
    /// 1.0 when the light contributes
    pub render: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct PointLightConstants {
    pub lights: [PointLightData; MAX_POINT_LIGHTS],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct ParticleCommon {
    pub particle_matrix: Mat4,
    pub time: f32,
    pub delta_time: f32,
    pub spawn_count: i32,
    pub seed: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct ParticleInfos {
    pub spawn_volume_transform: Mat4,
    pub spawn_volume_info: Vec3,
    pub spawn_volume_type: i32,
    pub spawn_volume_abs: Vec3,
    pub max_particle_count: i32,
    pub delay: Vec2,
    pub life_time: Vec2,
    pub velocity_min: Vec3,
    pub velocity_type: i32,
    pub velocity_max: Vec3,
    pub force_gravity: f32,
    pub scale_min: Vec3,
    pub fade_in: f32,
    pub scale_max: Vec3,
    pub fade_out: f32,
    pub rotation_min: Vec3,
    pub opacity: f32,
    pub rotation_max: Vec3,
    pub play_speed: f32,
    pub cell_count: [i32; 2],
    pub loop_sequence: i32,
    pub align_mode: i32,
}

/// A typed uniform buffer bound at a fixed index
pub struct UniformBlock<T: Pod> {
    name: String,
    binding: u32,
    buffer: BufferHandle,
    _marker: PhantomData<T>,
}

impl<T: Pod> UniformBlock<T> {
    pub fn new(backend: &mut dyn GraphicsBackend, name: &str, binding: u32) -> RenderResult<Self> {
        let buffer = backend.create_buffer(&BufferDescriptor {
            label: name.to_string(),
            kind: BufferKind::Uniform,
            size: std::mem::size_of::<T>() as u64,
        })?;
        log::debug!(
            "Created uniform block {} at binding {} ({} bytes)",
            name,
            binding,
            std::mem::size_of::<T>()
        );
        Ok(Self {
            name: name.to_string(),
            binding,
            buffer,
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn binding(&self) -> u32 {
        self.binding
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    /// Upload `data` and bind the buffer at its index.
    pub fn bind_uniform_block(&self, backend: &mut dyn GraphicsBackend, data: &T) -> RenderResult<()> {
        backend.write_buffer(self.buffer, 0, bytemuck::bytes_of(data))?;
        backend.bind_buffer_base(BufferKind::Uniform, self.binding, self.buffer);
        Ok(())
    }

    pub fn destroy(&self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_buffer(self.buffer);
    }
}

/// The seven fixed blocks every program sees
pub struct UniformBlocks {
    pub scene_constants: UniformBlock<SceneConstants>,
    pub view_constants: UniformBlock<ViewConstants>,
    pub view_projection: UniformBlock<ViewProjection>,
    pub light_constants: UniformBlock<LightConstants>,
    pub point_light_constants: UniformBlock<PointLightConstants>,
    pub particle_common: UniformBlock<ParticleCommon>,
    pub particle_infos: UniformBlock<ParticleInfos>,
}

impl UniformBlocks {
    pub fn new(backend: &mut dyn GraphicsBackend) -> RenderResult<Self> {
        Ok(Self {
            scene_constants: UniformBlock::new(backend, "sceneConstants", SCENE_CONSTANTS_BINDING)?,
            view_constants: UniformBlock::new(backend, "viewConstants", VIEW_CONSTANTS_BINDING)?,
            view_projection: UniformBlock::new(backend, "viewProjection", VIEW_PROJECTION_BINDING)?,
            light_constants: UniformBlock::new(backend, "lightConstants", LIGHT_CONSTANTS_BINDING)?,
            point_light_constants: UniformBlock::new(
                backend,
                "pointLightConstants",
                POINT_LIGHT_CONSTANTS_BINDING,
            )?,
            particle_common: UniformBlock::new(backend, "particleCommon", PARTICLE_COMMON_BINDING)?,
            particle_infos: UniformBlock::new(backend, "particleInfos", PARTICLE_INFOS_BINDING)?,
        })
    }

    pub fn destroy(&self, backend: &mut dyn GraphicsBackend) {
        self.scene_constants.destroy(backend);
        self.view_constants.destroy(backend);
        self.view_projection.destroy(backend);
        self.light_constants.destroy(backend);
        self.point_light_constants.destroy(backend);
        self.particle_common.destroy(backend);
        self.particle_infos.destroy(backend);
    }
}

/// A storage buffer bound at a fixed index
#[derive(Debug)]
pub struct ShaderStorageBuffer {
    name: String,
    binding: u32,
    buffer: BufferHandle,
    size: u64,
}

impl ShaderStorageBuffer {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        name: &str,
        binding: u32,
        size: u64,
    ) -> RenderResult<Self> {
        let buffer = backend.create_buffer(&BufferDescriptor {
            label: name.to_string(),
            kind: BufferKind::Storage,
            size: size.max(16),
        })?;
        Ok(Self {
            name: name.to_string(),
            binding,
            buffer,
            size: size.max(16),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn binding(&self) -> u32 {
        self.binding
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub fn bind_storage_buffer(&self, backend: &mut dyn GraphicsBackend) {
        backend.bind_buffer_base(BufferKind::Storage, self.binding, self.buffer);
    }

    pub fn update(&self, backend: &mut dyn GraphicsBackend, offset: u64, data: &[u8]) -> RenderResult<()> {
        backend.write_buffer(self.buffer, offset, data)?;
        Ok(())
    }

    /// Fill the whole buffer with zeroes.
    pub fn clear(&self, backend: &mut dyn GraphicsBackend) -> RenderResult<()> {
        self.update(backend, 0, &vec![0u8; self.size as usize])
    }

    pub fn read(&self, backend: &mut dyn GraphicsBackend) -> RenderResult<Vec<u8>> {
        Ok(backend.read_buffer(self.buffer)?)
    }

    pub fn destroy(&self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_buffer(self.buffer);
    }
}

/// A single `u32` counter written with atomics by compute programs
#[derive(Debug)]
pub struct AtomicCounter {
    binding: u32,
    buffer: BufferHandle,
}

impl AtomicCounter {
    pub fn new(backend: &mut dyn GraphicsBackend, name: &str, binding: u32) -> RenderResult<Self> {
        let buffer = backend.create_buffer(&BufferDescriptor {
            label: name.to_string(),
            kind: BufferKind::AtomicCounter,
            size: 4,
        })?;
        Ok(Self { binding, buffer })
    }

    pub fn bind(&self, backend: &mut dyn GraphicsBackend) {
        backend.bind_buffer_base(BufferKind::AtomicCounter, self.binding, self.buffer);
    }

    pub fn set(&self, backend: &mut dyn GraphicsBackend, value: u32) -> RenderResult<()> {
        backend.write_buffer(self.buffer, 0, &value.to_le_bytes())?;
        Ok(())
    }

    pub fn get(&self, backend: &mut dyn GraphicsBackend) -> RenderResult<u32> {
        let bytes = backend.read_buffer(self.buffer)?;
        Ok(bytes
            .get(0..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .unwrap_or(0))
    }

    pub fn destroy(&self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use std::mem::size_of;

    #[test]
    fn test_block_sizes_match_wgsl() {
        assert_eq!(size_of::<SceneConstants>(), 48);
        assert_eq!(size_of::<ViewConstants>(), 432);
        assert_eq!(size_of::<ViewProjection>(), 128);
        assert_eq!(size_of::<LightConstants>(), 112);
        assert_eq!(size_of::<PointLightData>(), 32);
        assert_eq!(size_of::<PointLightConstants>(), 320);
        assert_eq!(size_of::<ParticleCommon>(), 80);
        assert_eq!(size_of::<ParticleInfos>(), 224);
    }

    #[test]
    fn test_bind_uniform_block_uploads_bytes() {
        let mut backend = DummyBackend::new(4, 4);
        let block: UniformBlock<SceneConstants> =
            UniformBlock::new(&mut backend, "sceneConstants", 0).unwrap();
        let data = SceneConstants {
            time: 2.5,
            screen_size: Vec2::new(640.0, 480.0),
            ..Default::default()
        };
        block.bind_uniform_block(&mut backend, &data).unwrap();
        let bytes = backend.read_buffer(block.buffer()).unwrap();
        assert_eq!(&bytes[0..4], &2.5f32.to_le_bytes());
        assert_eq!(&bytes[16..20], &640.0f32.to_le_bytes());
    }

    #[test]
    fn test_atomic_counter() {
        let mut backend = DummyBackend::new(4, 4);
        let counter = AtomicCounter::new(&mut backend, "alive", 0).unwrap();
        counter.set(&mut backend, 42).unwrap();
        assert_eq!(counter.get(&mut backend).unwrap(), 42);
    }
}
