//! Emitters and their CPU particles

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Quat, Vec2, Vec3, Vec4};

use super::gpu::GpuEmitter;
use super::{AlignMode, ParticleInfo, VelocityType};
use crate::math::{euler_to_matrix, Lcg};

/// Slack when comparing accumulated frame time against spawn boundaries
const SPAWN_EPSILON: f64 = 1e-4;

/// Per-instance record of the CPU path, uploaded at
/// [`INSTANCE_LOCATION`](crate::resources::INSTANCE_LOCATION).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct ParticleInstance {
    pub parent_matrix: Mat4,
    pub local_matrix: Mat4,
    /// Current cell uv in `xy`, next cell uv in `zw`
    pub uvs: Vec4,
    /// Sequence ratio, final opacity
    pub sequence_opacity: Vec4,
}

/// Attribute names and byte sizes of [`ParticleInstance`]
pub const INSTANCE_ATTRIBUTES: [(&str, u64); 4] = [
    ("parent_matrix", 64),
    ("local_matrix", 64),
    ("uvs", 16),
    ("sequence_opacity", 16),
];

/// Translation, then pitch/yaw/roll, then scale.
pub fn particle_matrix(position: Vec3, rotation: Vec3, scale: Vec3) -> Mat4 {
    Mat4::from_translation(position) * euler_to_matrix(rotation.x, rotation.y, rotation.z) * Mat4::from_scale(scale)
}

/// A live CPU particle. Position, rotation and scale are in the parent
/// space captured at spawn.
#[derive(Debug, Clone)]
pub struct Particle {
    pub delay: f32,
    pub life_time: f32,
    pub elapsed_time: f32,
    pub position: Vec3,
    pub rotation: Vec3,
    pub scale: Vec3,
    pub velocity_position: Vec3,
    pub velocity_rotation: Vec3,
    pub velocity_scale: Vec3,
    /// Gravity in parent space
    pub force: Vec3,
    pub parent_matrix: Mat4,
    pub sequence_index: u32,
    pub next_sequence_index: u32,
    pub sequence_ratio: f32,
    pub opacity: f32,
}

impl Particle {
    pub fn spawn(info: &ParticleInfo, parent_matrix: Mat4, rng: &mut Lcg) -> Self {
        let delay = info.delay.uniform(rng).max(0.0);
        let life_time = info.life_time.uniform(rng);
        let origin = info.spawn_position(rng);
        let position = origin + info.transform_position.uniform(rng);
        let rotation = info.transform_rotation.uniform(rng);
        let scale = info.transform_scale.uniform(rng);

        let speed = info.velocity_position.uniform(rng);
        let velocity_position = match info.velocity_type {
            VelocityType::Random => speed,
            VelocityType::SpawnDirection => origin.try_normalize().unwrap_or(Vec3::Y) * speed.length(),
            VelocityType::Hurricane => {
                let tangent = Vec3::Y.cross(origin).try_normalize().unwrap_or(Vec3::X);
                tangent * Vec2::new(speed.x, speed.z).length() + Vec3::Y * speed.y
            }
        };

        // gravity is applied before the parent matrix
        let force = parent_matrix
            .inverse()
            .transform_vector3(Vec3::new(0.0, -info.force_gravity, 0.0));

        Self {
            delay,
            life_time,
            elapsed_time: 0.0,
            position,
            rotation,
            scale,
            velocity_position,
            velocity_rotation: info.velocity_rotation.uniform(rng),
            velocity_scale: info.velocity_scale.uniform(rng),
            force,
            parent_matrix,
            sequence_index: 0,
            next_sequence_index: 0,
            sequence_ratio: 0.0,
            opacity: if info.fade_in > 0.0 { 0.0 } else { info.opacity },
        }
    }

    /// Alive particles still in their delay are not drawn.
    pub fn is_renderable(&self) -> bool {
        self.delay <= 0.0
    }

    pub fn life_ratio(&self) -> f32 {
        if self.life_time > 0.0 {
            (self.elapsed_time / self.life_time).min(1.0)
        } else {
            0.0
        }
    }

    /// Advance by `dt`. Returns false once the particle outlived its life time.
    pub fn update(&mut self, dt: f32, info: &ParticleInfo) -> bool {
        if self.delay > 0.0 {
            self.delay -= dt;
            if self.delay > 0.0 {
                return true;
            }
            self.elapsed_time += -self.delay;
            self.delay = 0.0;
        } else {
            self.elapsed_time += dt;
        }

        if !info.is_infinite_particle() && self.life_time < self.elapsed_time {
            return false;
        }

        self.update_sequence(info);

        if info.force_gravity != 0.0 {
            self.velocity_position += self.force * dt;
        }
        if info.velocity_acceleration != 0.0 {
            self.velocity_position += self.velocity_position.normalize_or_zero() * info.velocity_acceleration * dt;
        }
        self.velocity_position = info.limit_velocity(self.velocity_position);

        self.position += self.velocity_position * dt;
        self.rotation += self.velocity_rotation * dt;
        self.scale += self.velocity_scale * dt;

        self.opacity = info.opacity * info.fade(self.elapsed_time, self.life_time);
        true
    }

    fn update_sequence(&mut self, info: &ParticleInfo) {
        let total = info.total_cells();
        if total <= 1 || info.play_speed <= 0.0 {
            return;
        }
        let ratio = self.life_ratio() * info.play_speed;
        let ratio = if info.loop_sequence { ratio.fract() } else { ratio.min(1.0) };
        let frame = ratio * (total - 1) as f32;
        let index = (frame.floor() as u32).min(total - 1);
        self.sequence_index = index;
        self.next_sequence_index = (index + 1).min(total - 1);
        self.sequence_ratio = frame - index as f32;
    }

    /// Instance record. Aligned particles carry their world matrix in the
    /// local stream with an identity parent.
    pub fn instance(&self, info: &ParticleInfo, inv_view_origin: Mat4) -> ParticleInstance {
        let (parent_matrix, local_matrix) = match info.align_mode {
            AlignMode::None => (
                self.parent_matrix,
                particle_matrix(self.position, self.rotation, self.scale),
            ),
            AlignMode::Billboard => {
                let center = self.parent_matrix.transform_point3(self.position);
                (
                    Mat4::IDENTITY,
                    Mat4::from_translation(center)
                        * inv_view_origin
                        * particle_matrix(Vec3::ZERO, self.rotation, self.scale),
                )
            }
            AlignMode::VelocityAlign => {
                let center = self.parent_matrix.transform_point3(self.position);
                let direction = self
                    .parent_matrix
                    .transform_vector3(self.velocity_position)
                    .try_normalize()
                    .unwrap_or(Vec3::Y);
                (
                    Mat4::IDENTITY,
                    Mat4::from_translation(center)
                        * Mat4::from_quat(Quat::from_rotation_arc(Vec3::Y, direction))
                        * particle_matrix(Vec3::ZERO, self.rotation, self.scale),
                )
            }
        };
        let uv = info.cell_uv(self.sequence_index);
        let next_uv = info.cell_uv(self.next_sequence_index);
        ParticleInstance {
            parent_matrix,
            local_matrix,
            uvs: Vec4::new(uv.x, uv.y, next_uv.x, next_uv.y),
            sequence_opacity: Vec4::new(self.sequence_ratio, self.opacity, 0.0, 0.0),
        }
    }
}

/// Spawns and ages the particles of one [`ParticleInfo`]
#[derive(Debug)]
pub struct Emitter {
    pub info: ParticleInfo,
    alive: bool,
    use_gpu: bool,
    elapsed_time: f32,
    spawned_batches: u64,
    spawned_total: u64,
    particles: Vec<Particle>,
    pub(crate) gpu: Option<GpuEmitter>,
    gpu_spawn_count: u32,
}

impl Emitter {
    pub fn new(info: ParticleInfo) -> Self {
        Self {
            info,
            alive: false,
            use_gpu: false,
            elapsed_time: 0.0,
            spawned_batches: 0,
            spawned_total: 0,
            particles: Vec::new(),
            gpu: None,
            gpu_spawn_count: 0,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn is_gpu(&self) -> bool {
        self.use_gpu
    }

    pub fn elapsed_time(&self) -> f32 {
        self.elapsed_time
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    /// Particles spawned since the last [`play`](Self::play). Counts GPU
    /// spawn requests on the compute path.
    pub fn spawned_count(&self) -> u64 {
        self.spawned_total
    }

    /// Spawn requests for the next compute dispatch
    pub fn gpu_spawn_count(&self) -> u32 {
        self.gpu_spawn_count
    }

    pub fn alive_count(&self) -> usize {
        if self.use_gpu {
            self.info.max_particle_count() as usize
        } else {
            self.particles.len()
        }
    }

    /// Restart from time zero and spawn the first batch.
    pub fn play(&mut self, parent_matrix: Mat4, rng: &mut Lcg, use_gpu: bool) {
        self.alive = self.info.enable;
        self.use_gpu = use_gpu && self.info.enable_gpu_particle;
        self.elapsed_time = 0.0;
        self.spawned_batches = 0;
        self.spawned_total = 0;
        self.gpu_spawn_count = 0;
        self.particles.clear();
        if self.use_gpu {
            self.particles.shrink_to_fit();
        } else {
            self.particles.reserve(self.info.max_particle_count() as usize);
        }
        if self.alive {
            let count = self.due_spawn_count();
            self.spawn(count, parent_matrix, rng);
        }
    }

    /// Age particles, spawn what the schedule calls for, and finish the
    /// emitter when nothing is left to do. Returns the live count.
    pub fn update(&mut self, dt: f32, parent_matrix: Mat4, rng: &mut Lcg) -> usize {
        if !self.alive {
            return 0;
        }
        self.elapsed_time += dt;

        if !self.use_gpu {
            let mut index = 0;
            while index < self.particles.len() {
                if self.particles[index].update(dt, &self.info) {
                    index += 1;
                } else {
                    self.particles.swap_remove(index);
                }
            }
        }

        let count = self.due_spawn_count();
        self.spawn(count, parent_matrix, rng);

        if self.is_finished() {
            log::debug!("Emitter {} finished after {:.2}s", self.info.name, self.elapsed_time);
            self.alive = false;
        }
        self.alive_count()
    }

    fn spawn(&mut self, count: u32, parent_matrix: Mat4, rng: &mut Lcg) {
        self.spawned_total += count as u64;
        if self.use_gpu {
            self.gpu_spawn_count = count;
            return;
        }
        for _ in 0..count {
            self.particles.push(Particle::spawn(&self.info, parent_matrix, rng));
        }
    }

    /// Number of particles to spawn this frame. With a positive term, batch
    /// `k` is due at `k * spawn_term` and only batches starting before
    /// `spawn_end_time` are emitted; batches that do not fit are dropped.
    fn due_spawn_count(&mut self) -> u32 {
        let info = &self.info;
        if info.spawn_count == 0 {
            return 0;
        }
        let finite = !info.is_infinite_emitter();
        let max_count = info.max_particle_count();
        let available = if self.use_gpu {
            max_count
        } else {
            max_count.saturating_sub(self.particles.len() as u32)
        };

        if info.spawn_term <= 0.0 {
            if finite && self.elapsed_time >= info.spawn_end_time {
                return 0;
            }
            return info.spawn_count.min(available);
        }

        let term = info.spawn_term as f64;
        let mut due = ((self.elapsed_time as f64 + SPAWN_EPSILON) / term).floor() as u64 + 1;
        if finite {
            let last = (info.spawn_end_time as f64 / term - SPAWN_EPSILON).ceil().max(0.0) as u64;
            due = due.min(last);
        }
        let batches = due.saturating_sub(self.spawned_batches);
        if batches == 0 {
            return 0;
        }
        self.spawned_batches = due;
        let batches = batches.min((available / info.spawn_count) as u64);
        batches as u32 * info.spawn_count
    }

    /// A finite emitter is done once past its spawn window with nothing
    /// left alive. GPU lifetimes are not read back, so the compute path
    /// waits out the longest possible particle instead.
    pub fn is_finished(&self) -> bool {
        let info = &self.info;
        if info.is_infinite_emitter() || self.elapsed_time < info.spawn_end_time {
            return false;
        }
        if self.use_gpu {
            self.elapsed_time > info.spawn_end_time + info.delay.max_value() + info.life_time.max_value()
        } else {
            self.particles.is_empty()
        }
    }

    /// Append one instance per renderable particle.
    pub fn write_instances(&self, inv_view_origin: Mat4, out: &mut Vec<ParticleInstance>) -> u32 {
        let before = out.len();
        out.extend(
            self.particles
                .iter()
                .filter(|p| p.is_renderable())
                .map(|p| p.instance(&self.info, inv_view_origin)),
        );
        (out.len() - before) as u32
    }

    /// Stop and hand back GPU buffers for release.
    pub fn stop(&mut self) -> Option<GpuEmitter> {
        self.alive = false;
        self.particles.clear();
        self.gpu.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particles::{FloatRange, Vec3Range};

    fn info() -> ParticleInfo {
        ParticleInfo {
            spawn_count: 10,
            spawn_term: 0.1,
            spawn_end_time: 1.0,
            life_time: FloatRange::constant(1.0),
            enable_gpu_particle: false,
            ..Default::default()
        }
    }

    fn run(emitter: &mut Emitter, frames: u32, dt: f32, rng: &mut Lcg) {
        for _ in 0..frames {
            emitter.update(dt, Mat4::IDENTITY, rng);
        }
    }

    #[test]
    fn test_lifecycle_at_60hz() {
        let mut rng = Lcg::new(7);
        let mut emitter = Emitter::new(info());
        emitter.play(Mat4::IDENTITY, &mut rng, false);
        assert_eq!(emitter.particles().len(), 10);
        run(&mut emitter, 90, 1.0 / 60.0, &mut rng);
        assert_eq!(emitter.spawned_count(), 100);
        let alive = emitter.particles().len();
        assert!((30..=70).contains(&alive), "{alive} alive");
        assert!(emitter.particles().iter().all(|p| p.elapsed_time <= p.life_time));
    }

    #[test]
    fn test_live_count_balance() {
        let mut rng = Lcg::new(3);
        let mut emitter = Emitter::new(info());
        emitter.play(Mat4::IDENTITY, &mut rng, false);
        let dt = 1.0 / 60.0;
        let mut total_expired = 0;
        for _ in 0..120 {
            let particles = emitter.particles();
            assert!(particles.iter().all(|p| p.delay <= 0.0));
            let prev_live = particles.len();
            let expired = particles.iter().filter(|p| p.elapsed_time + dt > p.life_time).count();
            let prev_spawned = emitter.spawned_count();
            let prev_elapsed = emitter.elapsed_time();

            let live = emitter.update(dt, Mat4::IDENTITY, &mut rng);
            let spawned = (emitter.spawned_count() - prev_spawned) as usize;
            assert_eq!(live, prev_live + spawned - expired);
            assert_eq!(live, emitter.particles().len());
            assert!(live <= emitter.info.max_particle_count() as usize);
            assert!(emitter.elapsed_time() >= prev_elapsed);
            total_expired += expired;
        }
        assert_eq!(total_expired as u64, emitter.spawned_count());
    }

    #[test]
    fn test_finite_emitter_finishes() {
        let mut rng = Lcg::new(1);
        let mut emitter = Emitter::new(info());
        emitter.play(Mat4::IDENTITY, &mut rng, false);
        run(&mut emitter, 150, 1.0 / 60.0, &mut rng);
        assert!(!emitter.is_alive());
        assert!(emitter.particles().is_empty());
        assert_eq!(emitter.update(1.0 / 60.0, Mat4::IDENTITY, &mut rng), 0);
    }

    #[test]
    fn test_infinite_emitter_keeps_spawning() {
        let mut rng = Lcg::new(1);
        let mut emitter = Emitter::new(ParticleInfo {
            spawn_end_time: -1.0,
            ..info()
        });
        emitter.play(Mat4::IDENTITY, &mut rng, false);
        run(&mut emitter, 600, 1.0 / 60.0, &mut rng);
        assert!(emitter.is_alive());
        assert!(!emitter.particles().is_empty());
        assert!(emitter.particles().len() as u32 <= emitter.info.max_particle_count());
    }

    #[test]
    fn test_zero_term_spawns_once_up_to_capacity() {
        let mut rng = Lcg::new(1);
        let mut emitter = Emitter::new(ParticleInfo {
            spawn_count: 5,
            spawn_term: 0.0,
            spawn_end_time: 0.5,
            life_time: FloatRange::constant(2.0),
            enable_gpu_particle: false,
            ..Default::default()
        });
        emitter.play(Mat4::IDENTITY, &mut rng, false);
        run(&mut emitter, 10, 1.0 / 60.0, &mut rng);
        assert_eq!(emitter.particles().len(), 5);
        assert_eq!(emitter.spawned_count(), 5);
    }

    #[test]
    fn test_delay_overshoot_moves_into_elapsed() {
        let info = ParticleInfo {
            delay: FloatRange::constant(0.05),
            ..info()
        };
        let mut rng = Lcg::new(1);
        let mut particle = Particle::spawn(&info, Mat4::IDENTITY, &mut rng);
        assert!(!particle.is_renderable());
        assert!(particle.update(0.03, &info));
        assert!(!particle.is_renderable());
        assert_eq!(particle.elapsed_time, 0.0);
        assert!(particle.update(0.03, &info));
        assert!(particle.is_renderable());
        assert!((particle.elapsed_time - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_gravity_and_velocity_limit() {
        let info = ParticleInfo {
            force_gravity: 10.0,
            velocity_limit: Vec2::new(0.0, 2.0),
            life_time: FloatRange::constant(10.0),
            ..info()
        };
        let mut rng = Lcg::new(1);
        let mut particle = Particle::spawn(&info, Mat4::IDENTITY, &mut rng);
        for _ in 0..60 {
            particle.update(1.0 / 60.0, &info);
        }
        assert!(particle.velocity_position.y < 0.0);
        assert!(particle.velocity_position.length() <= 2.0 + 1e-4);
        assert!(particle.position.y < 0.0);
    }

    #[test]
    fn test_flipbook_sequence() {
        let info = ParticleInfo {
            cell_count: [2, 2],
            play_speed: 1.0,
            life_time: FloatRange::constant(1.0),
            ..info()
        };
        let mut rng = Lcg::new(1);
        let mut particle = Particle::spawn(&info, Mat4::IDENTITY, &mut rng);
        particle.update(0.5, &info);
        assert_eq!(particle.sequence_index, 1);
        assert_eq!(particle.next_sequence_index, 2);
        assert!((particle.sequence_ratio - 0.5).abs() < 1e-5);
        let instance = particle.instance(&info, Mat4::IDENTITY);
        assert_eq!(instance.uvs, Vec4::new(0.5, 0.0, 0.0, 0.5));
    }

    #[test]
    fn test_fade_in_and_out() {
        let info = ParticleInfo {
            fade_in: 0.25,
            fade_out: 0.25,
            life_time: FloatRange::constant(1.0),
            ..info()
        };
        let mut rng = Lcg::new(1);
        let mut particle = Particle::spawn(&info, Mat4::IDENTITY, &mut rng);
        particle.update(0.125, &info);
        assert!((particle.opacity - 0.5).abs() < 1e-5);
        particle.update(0.5, &info);
        assert!((particle.opacity - 1.0).abs() < 1e-5);
        particle.update(0.25, &info);
        assert!((particle.opacity - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_billboard_faces_camera() {
        let info = ParticleInfo {
            align_mode: AlignMode::Billboard,
            spawn_volume_info: Vec3::ZERO,
            transform_position: Vec3Range::constant(Vec3::new(1.0, 2.0, 3.0)),
            ..info()
        };
        let mut rng = Lcg::new(1);
        let parent = Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0));
        let particle = Particle::spawn(&info, parent, &mut rng);
        let inv_view_origin = Mat4::from_rotation_y(0.5);
        let instance = particle.instance(&info, inv_view_origin);
        assert_eq!(instance.parent_matrix, Mat4::IDENTITY);
        let center = instance.local_matrix.transform_point3(Vec3::ZERO);
        assert!((center - Vec3::new(11.0, 2.0, 3.0)).length() < 1e-5);
        let axis = instance.local_matrix.transform_vector3(Vec3::Z);
        assert!((axis - inv_view_origin.transform_vector3(Vec3::Z)).length() < 1e-5);
    }

    #[test]
    fn test_instance_record_size() {
        assert_eq!(std::mem::size_of::<ParticleInstance>(), 160);
        let total: u64 = INSTANCE_ATTRIBUTES.iter().map(|(_, size)| size).sum();
        assert_eq!(total, 160);
    }
}
