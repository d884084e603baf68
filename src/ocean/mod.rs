//! FFT ocean
//!
//! The spectra, butterfly table and slope-variance volume are built once per
//! wind/omega/amplitude change. Each frame [`Ocean::simulate`] animates the
//! spectra into `FFT_A` and runs the butterfly passes, ping-ponging with
//! `FFT_B`, so the displacement of the current time ends up in `FFT_A`.

pub mod fft;
pub mod spectrum;

pub use fft::{height_sum, CpuFft, FftLayer};
pub use spectrum::{butterfly_lookup, default_butterfly, SpectrumParams, WaveSpectrum};

use glam::Vec4;

use crate::backend::*;
use crate::context::RenderContext;
use crate::error::{RenderError, RenderResult};
use crate::resources::{
    AttachOptions, MaterialInstanceId, RenderTargetSlot, Texture, VertexArrayBuffer, FFT_LAYERS,
};

pub const PASSES: u32 = 8;
pub const FFT_SIZE: u32 = 1 << PASSES;
/// Resolution of the slope-variance volume on every axis
pub const N_SLOPE_VARIANCE: u32 = 10;
pub const GRID_SIZES: [f32; 4] = [5488.0, 392.0, 28.0, 2.0];
pub const CHOPPY_FACTOR: [f32; 4] = [2.3, 2.1, 1.3, 0.9];
pub const WIND: f32 = 5.0;
pub const OMEGA: f32 = 0.84;
pub const AMPLITUDE: f32 = 0.5;
pub const FFT_SEED: u32 = 1234;

/// World extent covered by the ocean grid around the camera
pub const OCEAN_GRID_EXTENT: f32 = 400.0;

pub const SPECTRUM_1_2_TEXTURE: &str = "fft_ocean.spectrum_1_2";
pub const SPECTRUM_3_4_TEXTURE: &str = "fft_ocean.spectrum_3_4";
pub const BUTTERFLY_TEXTURE: &str = "fft_ocean.butterfly";
pub const SLOPE_VARIANCE_TEXTURE: &str = "fft_ocean.slope_variance";

/// `2π·size / grid` for each grid scale.
pub fn inverse_grid_sizes(size: u32, scale: f32) -> Vec4 {
    let n = size as f32;
    let grids = Vec4::from_array(GRID_SIZES) * scale;
    Vec4::splat(std::f32::consts::TAU * n) / grids
}

/// Butterfly row selector of horizontal pass `i`.
pub fn horizontal_pass(i: u32, passes: u32) -> f32 {
    (i as f32 + 0.5) / passes as f32
}

/// Butterfly row selector of vertical pass `i`, where `passes <= i < 2 * passes`.
pub fn vertical_pass(i: u32, passes: u32) -> f32 {
    (i as f32 - passes as f32 + 0.5) / passes as f32
}

/// Ocean attribute with its value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OceanAttribute {
    IsRenderOcean(bool),
    Height(f32),
    Wind(f32),
    Omega(f32),
    Amplitude(f32),
    SimulationWind(f32),
    SimulationAmplitude(f32),
    SimulationScale(f32),
}

impl OceanAttribute {
    pub fn name(&self) -> &'static str {
        match self {
            OceanAttribute::IsRenderOcean(_) => "is_render_ocean",
            OceanAttribute::Height(_) => "height",
            OceanAttribute::Wind(_) => "wind",
            OceanAttribute::Omega(_) => "omega",
            OceanAttribute::Amplitude(_) => "amplitude",
            OceanAttribute::SimulationWind(_) => "simulation_wind",
            OceanAttribute::SimulationAmplitude(_) => "simulation_amplitude",
            OceanAttribute::SimulationScale(_) => "simulation_scale",
        }
    }

    /// Parse a named attribute from its text form.
    pub fn parse(name: &str, value: &str) -> RenderResult<Self> {
        let invalid = |message: String| RenderError::InvalidAttribute {
            attribute: name.to_string(),
            message,
        };
        if name == "is_render_ocean" {
            let flag = match value.trim() {
                "1" | "true" | "True" => true,
                "0" | "false" | "False" => false,
                other => return Err(invalid(format!("'{}' is not a boolean", other))),
            };
            return Ok(OceanAttribute::IsRenderOcean(flag));
        }
        let number: f32 = value
            .trim()
            .parse()
            .map_err(|_| invalid(format!("'{}' is not a number", value)))?;
        Ok(match name {
            "height" => OceanAttribute::Height(number),
            "wind" => OceanAttribute::Wind(number),
            "omega" => OceanAttribute::Omega(number),
            "amplitude" => OceanAttribute::Amplitude(number),
            "simulation_wind" => OceanAttribute::SimulationWind(number),
            "simulation_amplitude" => OceanAttribute::SimulationAmplitude(number),
            "simulation_scale" => OceanAttribute::SimulationScale(number),
            _ => return Err(invalid("unknown ocean attribute".into())),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct OceanMaterials {
    init: MaterialInstanceId,
    fft_x: MaterialInstanceId,
    fft_y: MaterialInstanceId,
    variance: MaterialInstanceId,
    render: MaterialInstanceId,
}

#[derive(Debug, Clone)]
struct OceanTextures {
    spectrum_1_2: Texture,
    spectrum_3_4: Texture,
    butterfly: Texture,
    slope_variance: Texture,
}

/// Ocean surface state and its GPU passes
#[derive(Debug)]
pub struct Ocean {
    pub name: String,
    pub is_render_ocean: bool,
    pub height: f32,
    wind: f32,
    omega: f32,
    amplitude: f32,
    pub simulation_wind: f32,
    pub simulation_amplitude: f32,
    pub simulation_scale: f32,
    acc_time: f32,
    spectrum: Option<WaveSpectrum>,
    materials: Option<OceanMaterials>,
    textures: Option<OceanTextures>,
    dirty: bool,
}

impl Default for Ocean {
    fn default() -> Self {
        Self::new("ocean")
    }
}

impl Ocean {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_render_ocean: true,
            height: 0.0,
            wind: WIND,
            omega: OMEGA,
            amplitude: AMPLITUDE,
            simulation_wind: 1.0,
            simulation_amplitude: 3.0,
            simulation_scale: 1.0,
            acc_time: 0.0,
            spectrum: None,
            materials: None,
            textures: None,
            dirty: true,
        }
    }

    pub fn params(&self) -> SpectrumParams {
        SpectrumParams {
            wind: self.wind,
            omega: self.omega,
            amplitude: self.amplitude,
        }
    }

    /// Current value of every attribute.
    pub fn attributes(&self) -> Vec<OceanAttribute> {
        vec![
            OceanAttribute::IsRenderOcean(self.is_render_ocean),
            OceanAttribute::Height(self.height),
            OceanAttribute::Wind(self.wind),
            OceanAttribute::Omega(self.omega),
            OceanAttribute::Amplitude(self.amplitude),
            OceanAttribute::SimulationWind(self.simulation_wind),
            OceanAttribute::SimulationAmplitude(self.simulation_amplitude),
            OceanAttribute::SimulationScale(self.simulation_scale),
        ]
    }

    /// Apply one attribute. Spectrum parameters mark the precomputed
    /// textures for regeneration on the next [`prepare`](Self::prepare).
    pub fn set_attribute(&mut self, attribute: OceanAttribute) {
        match attribute {
            OceanAttribute::IsRenderOcean(v) => self.is_render_ocean = v,
            OceanAttribute::Height(v) => self.height = v,
            OceanAttribute::Wind(v) => {
                self.wind = v;
                self.dirty = true;
            }
            OceanAttribute::Omega(v) => {
                self.omega = v;
                self.dirty = true;
            }
            OceanAttribute::Amplitude(v) => {
                self.amplitude = v;
                self.dirty = true;
            }
            OceanAttribute::SimulationWind(v) => self.simulation_wind = v,
            OceanAttribute::SimulationAmplitude(v) => self.simulation_amplitude = v,
            OceanAttribute::SimulationScale(v) => self.simulation_scale = v.max(f32::EPSILON),
        }
    }

    /// Whether the precomputed textures are stale.
    pub fn needs_regenerate(&self) -> bool {
        self.dirty
    }

    pub fn update(&mut self, delta: f32) {
        self.acc_time += delta;
    }

    /// Simulation time handed to the init pass
    pub fn time(&self) -> f32 {
        self.acc_time * self.simulation_wind
    }

    pub fn set_time(&mut self, acc_time: f32) {
        self.acc_time = acc_time;
    }

    pub fn simulation_size(&self) -> Vec4 {
        Vec4::from_array(GRID_SIZES) * self.simulation_scale
    }

    pub fn spectrum(&self) -> Option<&WaveSpectrum> {
        self.spectrum.as_ref()
    }

    pub fn slope_variance(&self) -> Option<&Texture> {
        self.textures.as_ref().map(|t| &t.slope_variance)
    }

    /// Create the pass materials and, when stale, the precomputed textures.
    pub fn prepare(&mut self, ctx: &mut RenderContext) -> RenderResult<()> {
        if self.materials.is_none() {
            let gpu = ctx.backend.as_dyn_mut();
            let mut create = |suffix: &str, shader: &str| {
                ctx.materials.create_instance(
                    gpu,
                    &ctx.textures,
                    &format!("{}.{}", self.name, suffix),
                    shader,
                    &Default::default(),
                )
            };
            self.materials = Some(OceanMaterials {
                init: create("fft_init", "fft_init")?,
                fft_x: create("fft_x", "fft_x")?,
                fft_y: create("fft_y", "fft_y")?,
                variance: create("variance", "ocean_variance")?,
                render: create("render", "ocean")?,
            });
        }
        if self.dirty || self.textures.is_none() {
            self.generate_texture(ctx)?;
        }
        Ok(())
    }

    fn materials(&self) -> RenderResult<OceanMaterials> {
        self.materials
            .ok_or_else(|| RenderError::MissingResource(format!("{} materials", self.name)))
    }

    fn textures(&self) -> RenderResult<&OceanTextures> {
        self.textures
            .as_ref()
            .ok_or_else(|| RenderError::MissingResource(format!("{} textures", self.name)))
    }

    /// Upload spectra and the butterfly table, then fill the slope-variance
    /// volume one layer per draw.
    pub fn generate_texture(&mut self, ctx: &mut RenderContext) -> RenderResult<()> {
        log::info!(
            "Generating ocean textures: wind {} omega {} amplitude {}",
            self.wind,
            self.omega,
            self.amplitude
        );
        let spectrum = WaveSpectrum::generate(&self.params());
        let butterfly = default_butterfly();

        let lookup_desc = |label: &str, width: u32, height: u32, wrap: WrapMode| TextureDescriptor {
            label: label.to_string(),
            width,
            height,
            format: TextureFormat::Rgba16Float,
            sampler: SamplerState {
                min_filter: FilterMode::Nearest,
                mag_filter: FilterMode::Nearest,
                wrap,
                ..Default::default()
            },
            ..Default::default()
        };
        let format = TextureFormat::Rgba16Float;
        let gpu = ctx.backend.as_dyn_mut();
        let mut upload = |desc: TextureDescriptor, texels: &[[f32; 4]]| -> RenderResult<Texture> {
            let id = ctx.textures.create(gpu, desc, Some(&format.encode_texels(texels)))?;
            ctx.textures
                .get(id)
                .cloned()
                .ok_or_else(|| RenderError::MissingResource("ocean texture".into()))
        };
        let spectrum_1_2 = upload(
            lookup_desc(SPECTRUM_1_2_TEXTURE, FFT_SIZE, FFT_SIZE, WrapMode::Repeat),
            &spectrum.spectrum_1_2,
        )?;
        let spectrum_3_4 = upload(
            lookup_desc(SPECTRUM_3_4_TEXTURE, FFT_SIZE, FFT_SIZE, WrapMode::Repeat),
            &spectrum.spectrum_3_4,
        )?;
        let butterfly = upload(
            lookup_desc(BUTTERFLY_TEXTURE, FFT_SIZE, PASSES, WrapMode::ClampToEdge),
            &butterfly,
        )?;
        let slope_desc = TextureDescriptor {
            label: SLOPE_VARIANCE_TEXTURE.to_string(),
            target: TextureTarget::D3,
            width: N_SLOPE_VARIANCE,
            height: N_SLOPE_VARIANCE,
            depth: N_SLOPE_VARIANCE,
            format,
            sampler: SamplerState {
                min_filter: FilterMode::Linear,
                mag_filter: FilterMode::Linear,
                wrap: WrapMode::ClampToEdge,
                ..Default::default()
            },
            attachment: true,
            ..Default::default()
        };
        let id = ctx.textures.create(gpu, slope_desc, None)?;
        let slope_variance = ctx
            .textures
            .get(id)
            .cloned()
            .ok_or_else(|| RenderError::MissingResource(SLOPE_VARIANCE_TEXTURE.into()))?;

        self.textures = Some(OceanTextures {
            spectrum_1_2,
            spectrum_3_4,
            butterfly,
            slope_variance,
        });
        self.spectrum = Some(spectrum);
        self.dirty = false;
        self.compute_slope_variance(ctx)
    }

    fn fullscreen_state() -> PipelineState {
        PipelineState {
            depth_test: false,
            depth_write: false,
            cull_face: CullFace::None,
            blend: None,
            ..Default::default()
        }
    }

    fn quad(ctx: &RenderContext) -> RenderResult<VertexArrayBuffer> {
        ctx.geometries
            .by_name("quad")
            .map(|g| g.vertex_buffer.clone())
            .ok_or_else(|| RenderError::MissingResource("quad geometry".into()))
    }

    fn compute_slope_variance(&self, ctx: &mut RenderContext) -> RenderResult<()> {
        let materials = self.materials()?;
        let textures = self.textures()?.clone();
        let delta = self.spectrum.as_ref().map_or(0.0, |s| s.slope_variance_delta);
        let quad = Self::quad(ctx)?;
        let gpu = ctx.backend.as_dyn_mut();
        gpu.set_pipeline_state(&Self::fullscreen_state());
        quad.bind_vertex_buffer(gpu);
        for layer in 0..N_SLOPE_VARIANCE {
            ctx.framebuffers.bind_framebuffer_with(
                gpu,
                &[&textures.slope_variance],
                None,
                AttachOptions::layer(layer),
            )?;
            let material = ctx.materials.use_instance(gpu, materials.variance)?;
            material.bind(gpu, "variance_layer", layer as f32)?;
            material.bind(gpu, "n_slope_variance", N_SLOPE_VARIANCE as f32)?;
            material.bind(gpu, "slope_variance_delta", delta)?;
            material.bind(gpu, "grid_sizes", Vec4::from_array(GRID_SIZES))?;
            material.bind(gpu, "texture_spectrum_1_2", &textures.spectrum_1_2)?;
            material.bind(gpu, "texture_spectrum_3_4", &textures.spectrum_3_4)?;
            quad.draw_elements(gpu)?;
        }
        Ok(())
    }

    /// CPU reference of [`simulate`](Self::simulate) for the current parameters.
    pub fn cpu_reference(&self) -> CpuFft {
        let spectrum = self
            .spectrum
            .clone()
            .unwrap_or_else(|| WaveSpectrum::generate(&self.params()));
        CpuFft::new(
            &spectrum,
            &default_butterfly(),
            inverse_grid_sizes(FFT_SIZE, self.simulation_scale),
        )
    }

    /// Animate the spectra and run the horizontal then vertical butterfly
    /// passes. The result is left in `FFT_A`, mipmapped.
    pub fn simulate(&mut self, ctx: &mut RenderContext) -> RenderResult<()> {
        self.prepare(ctx)?;
        let materials = self.materials()?;
        let textures = self.textures()?.clone();
        let fft_a = ctx.render_targets.texture(RenderTargetSlot::FftA)?.clone();
        let fft_b = ctx.render_targets.texture(RenderTargetSlot::FftB)?.clone();
        let quad = Self::quad(ctx)?;
        let t = self.time();
        let inverse_grid_sizes = inverse_grid_sizes(FFT_SIZE, self.simulation_scale);

        let gpu = ctx.backend.as_dyn_mut();
        gpu.set_pipeline_state(&Self::fullscreen_state());
        quad.bind_vertex_buffer(gpu);

        for layer in 0..FFT_LAYERS {
            ctx.framebuffers
                .bind_framebuffer_with(gpu, &[&fft_a], None, AttachOptions::layer(layer))?;
            gpu.clear(ClearValue::color([0.0; 4]))?;
            let material = ctx.materials.use_instance(gpu, materials.init)?;
            material.bind(gpu, "t", t)?;
            material.bind(gpu, "fft_layer", layer as i32)?;
            material.bind(gpu, "inverse_grid_sizes", inverse_grid_sizes)?;
            material.bind(gpu, "texture_spectrum_1_2", &textures.spectrum_1_2)?;
            material.bind(gpu, "texture_spectrum_3_4", &textures.spectrum_3_4)?;
            quad.draw_elements(gpu)?;
        }

        for i in 0..PASSES * 2 {
            let (id, pass) = if i < PASSES {
                (materials.fft_x, horizontal_pass(i, PASSES))
            } else {
                (materials.fft_y, vertical_pass(i, PASSES))
            };
            let (input, output) = if i % 2 == 0 { (&fft_a, &fft_b) } else { (&fft_b, &fft_a) };
            for layer in 0..FFT_LAYERS {
                ctx.framebuffers
                    .bind_framebuffer_with(gpu, &[output], None, AttachOptions::layer(layer))?;
                let material = ctx.materials.use_instance(gpu, id)?;
                material.bind(gpu, "butterfly_pass", pass)?;
                material.bind(gpu, "fft_layer", layer as i32)?;
                material.bind(gpu, "texture_butterfly", &textures.butterfly)?;
                material.bind(gpu, "texture_input", input)?;
                quad.draw_elements(gpu)?;
            }
        }

        fft_a.generate_mipmap(gpu)
    }

    /// Draw the displaced grid into the bound framebuffer.
    pub fn render_ocean(
        &self,
        ctx: &mut RenderContext,
        texture_probe: &Texture,
        texture_transmittance: &Texture,
    ) -> RenderResult<()> {
        if !self.is_render_ocean {
            return Ok(());
        }
        let materials = self.materials()?;
        let textures = self.textures()?;
        let fft_a = ctx.render_targets.texture(RenderTargetSlot::FftA)?.clone();
        let grid = ctx
            .geometries
            .by_name("grid")
            .map(|g| g.vertex_buffer.clone())
            .ok_or_else(|| RenderError::MissingResource("grid geometry".into()))?;

        let gpu = ctx.backend.as_dyn_mut();
        gpu.set_pipeline_state(&PipelineState {
            cull_face: CullFace::None,
            ..Default::default()
        });
        let material = ctx.materials.use_instance(gpu, materials.render)?;
        material.bind(gpu, "height", self.height)?;
        material.bind(gpu, "grid_size", OCEAN_GRID_EXTENT)?;
        material.bind(gpu, "simulation_amplitude", self.simulation_amplitude)?;
        material.bind(gpu, "simulation_scale", self.simulation_scale)?;
        material.bind(gpu, "grid_sizes", self.simulation_size())?;
        material.bind(gpu, "choppy", Vec4::from_array(CHOPPY_FACTOR))?;
        material.bind(gpu, "texture_fft", &fft_a)?;
        material.bind(gpu, "texture_slope_variance", &textures.slope_variance)?;
        material.bind(gpu, "texture_probe", texture_probe)?;
        material.bind(gpu, "texture_transmittance", texture_transmittance)?;
        grid.bind_vertex_buffer(gpu);
        grid.draw_elements(gpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DrawRecord;
    use crate::AntiAliasing;

    fn ocean_context() -> RenderContext {
        let mut ctx = RenderContext::headless(64, 64).unwrap();
        ctx.recreate_render_targets(64, 64, AntiAliasing::None).unwrap();
        ctx
    }

    fn fft_draws(ctx: &RenderContext) -> Vec<DrawRecord> {
        ctx.dummy()
            .unwrap()
            .draws()
            .filter(|d| d.program_name.starts_with("fft"))
            .cloned()
            .collect()
    }

    #[test]
    fn test_pass_values() {
        assert_eq!(horizontal_pass(0, PASSES), 0.0625);
        assert_eq!(horizontal_pass(7, PASSES), 0.9375);
        assert_eq!(vertical_pass(PASSES, PASSES), 0.0625);
        assert_eq!(vertical_pass(2 * PASSES - 1, PASSES), 0.9375);
    }

    #[test]
    fn test_inverse_grid_sizes() {
        let igs = inverse_grid_sizes(FFT_SIZE, 1.0);
        let expected = std::f32::consts::TAU * FFT_SIZE as f32 / 2.0;
        assert!((igs.w - expected).abs() < 1e-3);
        assert!(igs.x < igs.y && igs.y < igs.z && igs.z < igs.w);
    }

    #[test]
    fn test_spectrum_attributes_mark_dirty() {
        let mut ocean = Ocean::new("ocean");
        ocean.dirty = false;
        ocean.set_attribute(OceanAttribute::Height(3.0));
        ocean.set_attribute(OceanAttribute::SimulationAmplitude(1.0));
        assert!(!ocean.needs_regenerate());
        ocean.set_attribute(OceanAttribute::Wind(7.0));
        assert!(ocean.needs_regenerate());
        assert_eq!(ocean.params().wind, 7.0);
        assert!(ocean.attributes().contains(&OceanAttribute::Height(3.0)));
    }

    #[test]
    fn test_parse_attribute() {
        assert_eq!(
            OceanAttribute::parse("omega", "0.5").unwrap(),
            OceanAttribute::Omega(0.5)
        );
        assert_eq!(
            OceanAttribute::parse("is_render_ocean", "0").unwrap(),
            OceanAttribute::IsRenderOcean(false)
        );
        assert!(OceanAttribute::parse("omega", "calm").is_err());
        assert!(OceanAttribute::parse("depth", "1").is_err());
    }

    #[test]
    fn test_prepare_builds_textures_once() {
        let mut ctx = ocean_context();
        let mut ocean = Ocean::new("ocean");
        ocean.prepare(&mut ctx).unwrap();
        let butterfly = ctx.textures.by_name(BUTTERFLY_TEXTURE).unwrap();
        assert_eq!(butterfly.size(), (FFT_SIZE, PASSES));
        let volume = ctx.textures.by_name(SLOPE_VARIANCE_TEXTURE).unwrap();
        assert_eq!(volume.desc.target, TextureTarget::D3);
        let variance_draws = ctx
            .dummy()
            .unwrap()
            .draws()
            .filter(|d| d.program_name == "ocean_variance")
            .count();
        assert_eq!(variance_draws, N_SLOPE_VARIANCE as usize);

        let handle = butterfly.handle;
        ocean.prepare(&mut ctx).unwrap();
        assert_eq!(ctx.textures.by_name(BUTTERFLY_TEXTURE).unwrap().handle, handle);

        ocean.set_attribute(OceanAttribute::Amplitude(1.0));
        ocean.prepare(&mut ctx).unwrap();
        assert_ne!(ctx.textures.by_name(BUTTERFLY_TEXTURE).unwrap().handle, handle);
    }

    #[test]
    fn test_simulate_ping_pong_ends_in_fft_a() {
        let mut ctx = ocean_context();
        let mut ocean = Ocean::new("ocean");
        ocean.simulate(&mut ctx).unwrap();

        let fft_a = ctx.render_targets.texture(RenderTargetSlot::FftA).unwrap().handle;
        let fft_b = ctx.render_targets.texture(RenderTargetSlot::FftB).unwrap().handle;
        let draws = fft_draws(&ctx);
        let layers = FFT_LAYERS as usize;
        assert_eq!(draws.len(), layers * (1 + 2 * PASSES as usize));

        for draw in &draws[..layers] {
            assert_eq!(draw.program_name, "fft_init");
            assert_eq!(draw.color_attachments[0].0, fft_a);
        }
        for (pass, chunk) in draws[layers..].chunks(layers).enumerate() {
            let expected = if pass % 2 == 0 { fft_b } else { fft_a };
            let program = if pass < PASSES as usize { "fft_x" } else { "fft_y" };
            for draw in chunk {
                assert_eq!(draw.program_name, program);
                assert_eq!(draw.color_attachments[0].0, expected);
            }
        }
        let last = draws.last().unwrap();
        assert_eq!(last.color_attachments[0].0, fft_a);
        assert_eq!(
            last.uniforms.get("butterfly_pass"),
            Some(&UniformData::Float(0.9375))
        );
    }

    #[test]
    fn test_cpu_reference_matches_spectrum() {
        let ocean = Ocean::new("ocean");
        let reference = ocean.cpu_reference();
        assert_eq!(reference.size(), FFT_SIZE);
    }
}
