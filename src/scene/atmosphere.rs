//! Precomputed atmosphere
//!
//! The transmittance and ground irradiance lookup tables are integrated on
//! the CPU once and uploaded as half-float textures. Sky and in-scattering
//! are evaluated per frame by the `atmosphere` program at quarter resolution.

use glam::Vec3;

use crate::backend::*;
use crate::context::RenderContext;
use crate::error::{RenderError, RenderResult};
use crate::resources::{MaterialInstanceId, RenderTargetSlot, Texture};

/// Ground radius in kilometres
pub const BOTTOM_RADIUS: f32 = 6360.0;
pub const TOP_RADIUS: f32 = 6420.0;
pub const RAYLEIGH_SCATTERING: Vec3 = Vec3::new(5.802e-3, 13.558e-3, 33.1e-3);
pub const RAYLEIGH_HEIGHT: f32 = 8.0;
pub const MIE_EXTINCTION: f32 = 4.40e-3;
pub const MIE_HEIGHT: f32 = 1.2;
pub const OZONE_ABSORPTION: Vec3 = Vec3::new(0.650e-3, 1.881e-3, 0.085e-3);
pub const OZONE_CENTER: f32 = 25.0;
pub const OZONE_WIDTH: f32 = 15.0;
pub const SOLAR_IRRADIANCE: Vec3 = Vec3::new(1.474, 1.8504, 1.91198);
pub const SUN_ANGULAR_RADIUS: f32 = 0.004675;

pub const TRANSMITTANCE_WIDTH: u32 = 256;
pub const TRANSMITTANCE_HEIGHT: u32 = 64;
pub const IRRADIANCE_WIDTH: u32 = 64;
pub const IRRADIANCE_HEIGHT: u32 = 16;
const TRANSMITTANCE_SAMPLES: u32 = 250;

pub const TRANSMITTANCE_TEXTURE: &str = "precomputed_atmosphere.transmittance";
pub const IRRADIANCE_TEXTURE: &str = "precomputed_atmosphere.irradiance";

fn distance_to_top(r: f32, mu: f32) -> f32 {
    let discriminant = r * r * (mu * mu - 1.0) + TOP_RADIUS * TOP_RADIUS;
    (-r * mu + discriminant.max(0.0).sqrt()).max(0.0)
}

fn ray_hits_ground(r: f32, mu: f32) -> bool {
    mu < 0.0 && r * r * (mu * mu - 1.0) + BOTTOM_RADIUS * BOTTOM_RADIUS >= 0.0
}

/// Extinction coefficient per kilometre at `altitude` kilometres.
pub fn extinction(altitude: f32) -> Vec3 {
    let rayleigh = RAYLEIGH_SCATTERING * (-altitude / RAYLEIGH_HEIGHT).exp();
    let mie = MIE_EXTINCTION * (-altitude / MIE_HEIGHT).exp();
    let ozone = OZONE_ABSORPTION * (1.0 - (altitude - OZONE_CENTER).abs() / OZONE_WIDTH).max(0.0);
    rayleigh + Vec3::splat(mie) + ozone
}

/// Transmittance from radius `r` to the top of the atmosphere along a ray
/// with zenith cosine `mu`. Rays that hit the ground give zero.
pub fn transmittance_to_top(r: f32, mu: f32) -> Vec3 {
    if ray_hits_ground(r, mu) {
        return Vec3::ZERO;
    }
    let length = distance_to_top(r, mu);
    let step = length / TRANSMITTANCE_SAMPLES as f32;
    let mut optical_depth = Vec3::ZERO;
    for i in 0..TRANSMITTANCE_SAMPLES {
        let d = (i as f32 + 0.5) * step;
        let r_i = (d * d + 2.0 * r * mu * d + r * r).sqrt();
        optical_depth += extinction(r_i - BOTTOM_RADIUS) * step;
    }
    Vec3::new(
        (-optical_depth.x).exp(),
        (-optical_depth.y).exp(),
        (-optical_depth.z).exp(),
    )
}

fn texel_to_unit(x: u32, size: u32) -> f32 {
    x as f32 / (size - 1) as f32
}

/// Inverse of the lookup parameterisation used by `transmittance_uv`.
fn transmittance_r_mu(x: u32, y: u32) -> (f32, f32) {
    let x_mu = texel_to_unit(x, TRANSMITTANCE_WIDTH);
    let x_r = texel_to_unit(y, TRANSMITTANCE_HEIGHT);
    let h = (TOP_RADIUS * TOP_RADIUS - BOTTOM_RADIUS * BOTTOM_RADIUS).sqrt();
    let rho = h * x_r;
    let r = (rho * rho + BOTTOM_RADIUS * BOTTOM_RADIUS).sqrt();
    let d_min = TOP_RADIUS - r;
    let d_max = rho + h;
    let d = d_min + x_mu * (d_max - d_min);
    let mu = if d == 0.0 {
        1.0
    } else {
        ((h * h - rho * rho - d * d) / (2.0 * r * d)).clamp(-1.0, 1.0)
    };
    (r, mu)
}

/// Transmittance table, rows from the ground up.
pub fn compute_transmittance() -> Vec<[f32; 4]> {
    let mut texels = Vec::with_capacity((TRANSMITTANCE_WIDTH * TRANSMITTANCE_HEIGHT) as usize);
    for y in 0..TRANSMITTANCE_HEIGHT {
        for x in 0..TRANSMITTANCE_WIDTH {
            let (r, mu) = transmittance_r_mu(x, y);
            texels.push(transmittance_to_top(r, mu).extend(1.0).to_array());
        }
    }
    texels
}

/// Direct sun irradiance on a horizontal surface, by radius and sun zenith cosine.
pub fn compute_irradiance() -> Vec<[f32; 4]> {
    let mut texels = Vec::with_capacity((IRRADIANCE_WIDTH * IRRADIANCE_HEIGHT) as usize);
    for y in 0..IRRADIANCE_HEIGHT {
        let r = BOTTOM_RADIUS + texel_to_unit(y, IRRADIANCE_HEIGHT) * (TOP_RADIUS - BOTTOM_RADIUS);
        for x in 0..IRRADIANCE_WIDTH {
            let mu_s = texel_to_unit(x, IRRADIANCE_WIDTH) * 2.0 - 1.0;
            let alpha = SUN_ANGULAR_RADIUS;
            let cosine = if mu_s < -alpha {
                0.0
            } else if mu_s > alpha {
                mu_s
            } else {
                (mu_s + alpha) * (mu_s + alpha) / (4.0 * alpha)
            };
            let irradiance = SOLAR_IRRADIANCE * transmittance_to_top(r, mu_s) * cosine;
            texels.push(irradiance.extend(1.0).to_array());
        }
    }
    texels
}

/// Sky state and its lookup textures
#[derive(Debug)]
pub struct Atmosphere {
    pub name: String,
    pub is_render_atmosphere: bool,
    material: Option<MaterialInstanceId>,
    transmittance: Option<Texture>,
    irradiance: Option<Texture>,
}

impl Default for Atmosphere {
    fn default() -> Self {
        Self::new("atmosphere")
    }
}

impl Atmosphere {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_render_atmosphere: true,
            material: None,
            transmittance: None,
            irradiance: None,
        }
    }

    /// Integrate and upload the lookup tables once.
    pub fn prepare(&mut self, ctx: &mut RenderContext) -> RenderResult<()> {
        if self.material.is_none() {
            let gpu = ctx.backend.as_dyn_mut();
            self.material = Some(ctx.materials.create_instance(
                gpu,
                &ctx.textures,
                &self.name,
                "atmosphere",
                &Default::default(),
            )?);
        }
        if self.transmittance.is_some() && self.irradiance.is_some() {
            return Ok(());
        }
        log::info!("Precomputing atmosphere lookup tables");
        let format = TextureFormat::Rgba16Float;
        let desc = |label: &str, width: u32, height: u32| TextureDescriptor {
            label: label.to_string(),
            width,
            height,
            format,
            sampler: SamplerState {
                min_filter: FilterMode::Linear,
                mag_filter: FilterMode::Linear,
                wrap: WrapMode::ClampToEdge,
                ..Default::default()
            },
            ..Default::default()
        };
        let gpu = ctx.backend.as_dyn_mut();
        let mut upload = |desc: TextureDescriptor, texels: Vec<[f32; 4]>| -> RenderResult<Texture> {
            let id = ctx.textures.create(gpu, desc, Some(&format.encode_texels(&texels)))?;
            ctx.textures
                .get(id)
                .cloned()
                .ok_or_else(|| RenderError::MissingResource("atmosphere texture".into()))
        };
        self.transmittance = Some(upload(
            desc(TRANSMITTANCE_TEXTURE, TRANSMITTANCE_WIDTH, TRANSMITTANCE_HEIGHT),
            compute_transmittance(),
        )?);
        self.irradiance = Some(upload(
            desc(IRRADIANCE_TEXTURE, IRRADIANCE_WIDTH, IRRADIANCE_HEIGHT),
            compute_irradiance(),
        )?);
        Ok(())
    }

    /// Transmittance table, or the store's flat white before `prepare`.
    pub fn transmittance<'a>(&'a self, ctx: &'a RenderContext) -> RenderResult<&'a Texture> {
        self.lookup(self.transmittance.as_ref(), ctx)
    }

    pub fn irradiance<'a>(&'a self, ctx: &'a RenderContext) -> RenderResult<&'a Texture> {
        self.lookup(self.irradiance.as_ref(), ctx)
    }

    fn lookup<'a>(&'a self, texture: Option<&'a Texture>, ctx: &'a RenderContext) -> RenderResult<&'a Texture> {
        texture
            .or_else(|| ctx.textures.by_name(crate::resources::FLAT_WHITE))
            .ok_or_else(|| RenderError::MissingResource(format!("{} lookup table", self.name)))
    }

    /// Evaluate sky and in-scattering into ATMOSPHERE / ATMOSPHERE_INSCATTER.
    /// With `ignore_depth` every pixel is treated as sky.
    pub fn render_precomputed_atmosphere(
        &self,
        ctx: &mut RenderContext,
        texture_depth: &Texture,
        sun_direction: Vec3,
        ignore_depth: bool,
    ) -> RenderResult<()> {
        let material = self
            .material
            .ok_or_else(|| RenderError::MissingResource(format!("{} material", self.name)))?;
        let transmittance = self.transmittance(ctx)?.clone();
        let sky = ctx.render_targets.texture(RenderTargetSlot::Atmosphere)?.clone();
        let inscatter = ctx
            .render_targets
            .texture(RenderTargetSlot::AtmosphereInscatter)?
            .clone();
        let quad = ctx
            .geometries
            .by_name("quad")
            .map(|g| g.vertex_buffer.clone())
            .ok_or_else(|| RenderError::MissingResource("quad geometry".into()))?;

        let gpu = ctx.backend.as_dyn_mut();
        ctx.framebuffers.bind_framebuffer(gpu, &[&sky, &inscatter], None)?;
        gpu.set_pipeline_state(&PipelineState {
            depth_test: false,
            depth_write: false,
            cull_face: CullFace::None,
            ..Default::default()
        });
        let instance = ctx.materials.use_instance(gpu, material)?;
        instance.bind(gpu, "sun_direction", sun_direction)?;
        instance.bind(gpu, "ignore_depth", ignore_depth)?;
        instance.bind(gpu, "texture_depth", texture_depth)?;
        instance.bind(gpu, "texture_transmittance", &transmittance)?;
        quad.bind_vertex_buffer(gpu);
        quad.draw_elements(gpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transmittance_decreases_toward_horizon() {
        let zenith = transmittance_to_top(BOTTOM_RADIUS, 1.0);
        let low = transmittance_to_top(BOTTOM_RADIUS, 0.05);
        assert!(zenith.x > low.x && zenith.z > low.z);
        // blue is scattered more than red
        assert!(zenith.z < zenith.x);
        assert!(zenith.max_element() < 1.0 && low.min_element() > 0.0);
    }

    #[test]
    fn test_ground_rays_are_opaque() {
        assert_eq!(transmittance_to_top(BOTTOM_RADIUS + 1.0, -0.5), Vec3::ZERO);
    }

    #[test]
    fn test_lookup_parameterisation_endpoints() {
        let (r, mu) = transmittance_r_mu(0, 0);
        assert!((r - BOTTOM_RADIUS).abs() < 1e-2);
        assert!((mu - 1.0).abs() < 1e-4);
        let (r, _) = transmittance_r_mu(0, TRANSMITTANCE_HEIGHT - 1);
        assert!((r - TOP_RADIUS).abs() < 1e-2);
    }

    #[test]
    fn test_irradiance_is_zero_below_horizon() {
        let table = compute_irradiance();
        assert_eq!(table.len(), (IRRADIANCE_WIDTH * IRRADIANCE_HEIGHT) as usize);
        assert_eq!(table[0][0], 0.0);
        let overhead = table[(IRRADIANCE_WIDTH - 1) as usize];
        assert!(overhead[0] > 0.5);
    }

    #[test]
    fn test_prepare_uploads_tables() {
        let mut ctx = RenderContext::headless(32, 32).unwrap();
        let mut atmosphere = Atmosphere::new("atmosphere");
        atmosphere.prepare(&mut ctx).unwrap();
        let lut = ctx.textures.by_name(TRANSMITTANCE_TEXTURE).unwrap();
        assert_eq!(lut.size(), (TRANSMITTANCE_WIDTH, TRANSMITTANCE_HEIGHT));
        assert_eq!(lut.format(), TextureFormat::Rgba16Float);
        assert_eq!(atmosphere.transmittance(&ctx).unwrap().handle, lut.handle);
        assert!(ctx.textures.by_name(IRRADIANCE_TEXTURE).is_some());
    }
}
