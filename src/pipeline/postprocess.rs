//! Fullscreen passes
//!
//! Every pass shares the built-in quad and takes explicit input and output
//! textures. The renderer strings them together for the preprocess
//! (linear depth, SSR, SSAO), the deferred shading and the post-process chain
//! (TAA, bloom, tone mapping, motion blur).

use std::collections::HashMap;

use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::backend::*;
use crate::context::RenderContext;
use crate::error::{RenderError, RenderResult};
use crate::math::{hammersley, lerp, Lcg};
use crate::resources::{
    AttachOptions, MaterialInstance, MaterialInstanceId, RenderTargetSlot, Texture, VertexArrayBuffer,
};
use crate::AntiAliasing;

/// Samples in the SSAO hemisphere kernel
pub const SSAO_KERNEL_SIZE: usize = 32;
/// Length of the TAA jitter sequence
pub const JITTER_SAMPLES: u32 = 16;
/// Horizontal + vertical blur rounds per bloom level
const BLOOM_BLUR_LOOPS: u32 = 2;
const SSAO_SEED: u32 = 4321;

/// Programs drawn through [`PostProcess`]
const PROGRAMS: [&str; 18] = [
    "copy_texture",
    "render_texture",
    "linear_depth",
    "generate_min_z",
    "velocity",
    "ssao",
    "gaussian_blur",
    "ssr",
    "ssr_resolve",
    "composite_shadowmap",
    "deferred_shading",
    "atmosphere_composite",
    "taa",
    "bloom_highlight",
    "bloom",
    "tone_map",
    "motion_blur",
    "cube_convolution",
];

/// Depth off, no culling, no blending
pub const FULLSCREEN_STATE: PipelineState = PipelineState {
    depth_test: false,
    depth_write: false,
    depth_func: CompareFunction::Always,
    cull_face: CullFace::None,
    front_face: FrontFace::Ccw,
    blend: None,
    polygon_mode: PolygonMode::Fill,
};

/// Clone of the texture in `slot`.
pub(crate) fn slot(ctx: &RenderContext, slot: RenderTargetSlot) -> RenderResult<Texture> {
    ctx.render_targets.texture(slot).cloned()
}

pub(crate) fn quad(ctx: &RenderContext) -> RenderResult<VertexArrayBuffer> {
    ctx.geometries
        .by_name("quad")
        .map(|g| g.vertex_buffer.clone())
        .ok_or_else(|| RenderError::MissingResource("quad geometry".into()))
}

/// Hemisphere kernel oriented along +Y, denser towards the origin.
pub fn ssao_kernel(rng: &mut Lcg) -> [Vec3; SSAO_KERNEL_SIZE] {
    let mut kernel = [Vec3::ZERO; SSAO_KERNEL_SIZE];
    for (i, sample) in kernel.iter_mut().enumerate() {
        let t = i as f32 / SSAO_KERNEL_SIZE as f32;
        let scale = lerp(0.1, 1.0, t * t);
        let direction = Vec3::new(rng.range(-1.0, 1.0), rng.range(0.5, 1.0), rng.range(-1.0, 1.0));
        *sample = direction.normalize() * scale;
    }
    kernel
}

/// Selector for the `render_texture` program.
pub fn texture_type(texture: &Texture) -> i32 {
    match texture.target() {
        TextureTarget::D2Array => 1,
        TextureTarget::D3 => 2,
        TextureTarget::Cube => 3,
        _ if !texture.format().is_blendable() => 4,
        _ => 0,
    }
}

/// Tunables of the post-process chain
#[derive(Debug, Clone, PartialEq)]
pub struct PostProcessSettings {
    pub anti_aliasing: AntiAliasing,
    pub is_render_bloom: bool,
    pub bloom_intensity: f32,
    pub bloom_threshold_min: f32,
    pub bloom_threshold_max: f32,
    pub bloom_scale: f32,
    pub is_render_motion_blur: bool,
    pub motion_blur_scale: f32,
    pub is_render_ssao: bool,
    pub ssao_blur_radius: f32,
    pub ssao_radius_min_max: Vec2,
    pub is_render_ssr: bool,
    pub is_render_tonemapping: bool,
    pub exposure: f32,
    pub contrast: f32,
    /// Mip level and layer shown by the debug overlay
    pub debug_texture_lod: f32,
    pub debug_texture_layer: f32,
}

impl Default for PostProcessSettings {
    fn default() -> Self {
        Self {
            anti_aliasing: AntiAliasing::Taa,
            is_render_bloom: true,
            bloom_intensity: 0.25,
            bloom_threshold_min: 1.25,
            bloom_threshold_max: 10.0,
            bloom_scale: 1.0,
            is_render_motion_blur: true,
            motion_blur_scale: 1.0,
            is_render_ssao: true,
            ssao_blur_radius: 2.0,
            ssao_radius_min_max: Vec2::new(0.05, 1.5),
            is_render_ssr: true,
            is_render_tonemapping: true,
            exposure: 1.0,
            contrast: 1.1,
            debug_texture_lod: 0.0,
            debug_texture_layer: 0.0,
        }
    }
}

/// Inputs of the deferred shading pass besides the G-buffer slots
pub struct ShadingInputs<'a> {
    pub probe: &'a Texture,
    pub transmittance: &'a Texture,
    pub irradiance: &'a Texture,
}

/// One fullscreen draw
#[derive(Clone, Copy)]
pub struct Pass<'a> {
    program: &'static str,
    colors: &'a [&'a Texture],
    options: AttachOptions,
    clear: Option<ClearValue>,
    blend: Option<BlendState>,
    viewport: Option<(i32, i32, u32, u32)>,
}

impl<'a> Pass<'a> {
    pub fn new(program: &'static str, colors: &'a [&'a Texture]) -> Self {
        Self {
            program,
            colors,
            options: AttachOptions::default(),
            clear: None,
            blend: None,
            viewport: None,
        }
    }

    pub fn clear(mut self, value: ClearValue) -> Self {
        self.clear = Some(value);
        self
    }

    pub fn blend(mut self, blend: BlendState) -> Self {
        self.blend = Some(blend);
        self
    }

    pub fn options(mut self, options: AttachOptions) -> Self {
        self.options = options;
        self
    }

    pub fn viewport(mut self, x: i32, y: i32, width: u32, height: u32) -> Self {
        self.viewport = Some((x, y, width, height));
        self
    }
}

/// Fullscreen pass driver and TAA jitter state
pub struct PostProcess {
    pub settings: PostProcessSettings,
    materials: HashMap<&'static str, MaterialInstanceId>,
    ssao_kernel: [Vec3; SSAO_KERNEL_SIZE],
    jitter_frame: u32,
    jitter: Vec2,
    jitter_prev: Vec2,
    jitter_delta: Vec2,
}

impl Default for PostProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl PostProcess {
    pub fn new() -> Self {
        Self {
            settings: PostProcessSettings::default(),
            materials: HashMap::new(),
            ssao_kernel: ssao_kernel(&mut Lcg::new(SSAO_SEED)),
            jitter_frame: 0,
            jitter: Vec2::ZERO,
            jitter_prev: Vec2::ZERO,
            jitter_delta: Vec2::ZERO,
        }
    }

    /// Create one material instance per fullscreen program.
    pub fn prepare(&mut self, ctx: &mut RenderContext) -> RenderResult<()> {
        let gpu = ctx.backend.as_dyn_mut();
        for program in PROGRAMS {
            if self.materials.contains_key(program) {
                continue;
            }
            let id = ctx.materials.create_instance(
                gpu,
                &ctx.textures,
                &format!("postprocess.{}", program),
                program,
                &Default::default(),
            )?;
            self.materials.insert(program, id);
        }
        log::debug!("Prepared {} post-process programs", self.materials.len());
        Ok(())
    }

    pub fn material(&self, program: &str) -> RenderResult<MaterialInstanceId> {
        self.materials
            .get(program)
            .copied()
            .ok_or_else(|| RenderError::MissingResource(format!("post-process program {}", program)))
    }

    pub fn ssao_kernel(&self) -> &[Vec3; SSAO_KERNEL_SIZE] {
        &self.ssao_kernel
    }

    pub fn anti_aliasing(&self) -> AntiAliasing {
        self.settings.anti_aliasing
    }

    pub fn is_taa(&self) -> bool {
        self.settings.anti_aliasing == AntiAliasing::Taa
    }

    pub fn is_msaa(&self) -> bool {
        self.settings.anti_aliasing == AntiAliasing::Msaa
    }

    /// Switch the anti-aliasing mode. Returns true when render targets must
    /// be recreated for the new mode.
    pub fn set_anti_aliasing(&mut self, anti_aliasing: AntiAliasing) -> bool {
        let previous = self.settings.anti_aliasing;
        self.settings.anti_aliasing = anti_aliasing;
        if anti_aliasing != AntiAliasing::Taa {
            self.reset_jitter();
        }
        previous.changes_targets(anti_aliasing)
    }

    fn reset_jitter(&mut self) {
        self.jitter_frame = 0;
        self.jitter = Vec2::ZERO;
        self.jitter_prev = Vec2::ZERO;
        self.jitter_delta = Vec2::ZERO;
    }

    /// Advance the jitter sequence. `taa_size` is the TAA_RESOLVE size.
    pub fn update(&mut self, taa_size: (u32, u32)) {
        if !self.is_taa() {
            self.reset_jitter();
            return;
        }
        self.jitter_frame = (self.jitter_frame + 1) % JITTER_SAMPLES;
        self.jitter_prev = self.jitter;
        let point = hammersley(self.jitter_frame, JITTER_SAMPLES) * 2.0 - Vec2::ONE;
        let size = Vec2::new(taa_size.0.max(1) as f32, taa_size.1.max(1) as f32);
        self.jitter = point / size;
        self.jitter_delta = (self.jitter - self.jitter_prev) * 0.5;
    }

    pub fn jitter_frame(&self) -> u32 {
        self.jitter_frame
    }

    /// Projection offset in clip units.
    pub fn jitter(&self) -> Vec2 {
        self.jitter
    }

    pub fn jitter_prev(&self) -> Vec2 {
        self.jitter_prev
    }

    pub fn jitter_delta(&self) -> Vec2 {
        self.jitter_delta
    }

    /// Bind the pass targets, activate its program, let `bind` upload the
    /// per-pass uniforms and draw the quad. The pipeline state found on
    /// entry is restored afterwards.
    pub fn draw(
        &self,
        ctx: &mut RenderContext,
        pass: Pass<'_>,
        bind: impl FnOnce(&MaterialInstance, &mut dyn GraphicsBackend) -> RenderResult<()>,
    ) -> RenderResult<()> {
        let material = self.material(pass.program)?;
        let quad = quad(ctx)?;
        let gpu = ctx.backend.as_dyn_mut();
        ctx.framebuffers
            .bind_framebuffer_with(gpu, pass.colors, None, pass.options)?;
        if let Some((x, y, width, height)) = pass.viewport {
            gpu.set_viewport(x, y, width, height);
        }
        if let Some(value) = pass.clear {
            gpu.clear(value)?;
        }
        let previous = gpu.pipeline_state();
        gpu.set_pipeline_state(&PipelineState {
            blend: pass.blend,
            ..FULLSCREEN_STATE
        });
        let result = ctx.materials.use_instance(gpu, material).and_then(|instance| {
            bind(instance, gpu)?;
            quad.bind_vertex_buffer(gpu);
            quad.draw_elements(gpu)
        });
        gpu.set_pipeline_state(&previous);
        result
    }

    /// Framebuffer blit; resolves multisampled sources and rescales.
    pub fn render_copy_rendertarget(&self, ctx: &mut RenderContext, src: &Texture, dst: &Texture) -> RenderResult<()> {
        let gpu = ctx.backend.as_dyn_mut();
        let src = ctx.framebuffers.bind_framebuffer(gpu, &[src], None)?;
        let dst = ctx.framebuffers.bind_framebuffer(gpu, &[dst], None)?;
        ctx.framebuffers.copy_from(gpu, src, dst)
    }

    /// Shader copy with a color scale; used to downsample.
    pub fn render_copy(&self, ctx: &mut RenderContext, src: &Texture, dst: &Texture) -> RenderResult<()> {
        self.draw(ctx, Pass::new("copy_texture", &[dst]), |m, gpu| {
            m.bind(gpu, "texture_source", src)?;
            m.bind(gpu, "color_scale", Vec4::ONE)
        })
    }

    /// Linear view depth into `linear_depth`, then its min-Z mip chain.
    pub fn render_linear_depth(
        &self,
        ctx: &mut RenderContext,
        depth: &Texture,
        linear_depth: &Texture,
    ) -> RenderResult<()> {
        let colors = [linear_depth];
        let pass = Pass::new("linear_depth", &colors).clear(ClearValue::color([1.0; 4]));
        self.draw(ctx, pass, |m, gpu| m.bind(gpu, "texture_depth", depth))?;
        self.generate_min_z(ctx, linear_depth)
    }

    /// Each level keeps the nearest depth of the 2x2 texels below it. Levels
    /// are drawn into a temporary and blitted back so the source is never
    /// attached while it is sampled.
    pub fn generate_min_z(&self, ctx: &mut RenderContext, linear_depth: &Texture) -> RenderResult<()> {
        for level in 1..linear_depth.desc.mip_levels() {
            let (width, height) = linear_depth.desc.level_size(level);
            let temp = ctx.render_targets.get_temporary_desc(
                ctx.backend.as_dyn_mut(),
                TextureDescriptor {
                    label: format!("min_z_{}", level),
                    width,
                    height,
                    format: linear_depth.format(),
                    sampler: linear_depth.desc.sampler,
                    attachment: true,
                    ..Default::default()
                },
            )?;
            self.draw(ctx, Pass::new("generate_min_z", &[&temp]), |m, gpu| {
                m.bind(gpu, "source_lod", level as i32 - 1)?;
                m.bind(gpu, "texture_linear_depth", linear_depth)
            })?;
            let gpu = ctx.backend.as_dyn_mut();
            let src = ctx.framebuffers.bind_framebuffer(gpu, &[&temp], None)?;
            let dst = ctx.framebuffers.bind_framebuffer_with(
                gpu,
                &[linear_depth],
                None,
                AttachOptions::level(level),
            )?;
            ctx.framebuffers.copy_from(gpu, src, dst)?;
        }
        Ok(())
    }

    /// Camera-only velocity reconstructed from depth.
    pub fn render_velocity(&self, ctx: &mut RenderContext, depth: &Texture, velocity: &Texture) -> RenderResult<()> {
        self.draw(ctx, Pass::new("velocity", &[velocity]), |m, gpu| {
            m.bind(gpu, "texture_depth", depth)
        })
    }

    /// Ambient occlusion into `ssao` followed by a separable blur.
    pub fn render_ssao(
        &self,
        ctx: &mut RenderContext,
        normal: &Texture,
        linear_depth: &Texture,
        ssao: &Texture,
    ) -> RenderResult<()> {
        let noise = slot(ctx, RenderTargetSlot::SsaoNoise)?;
        let (width, height) = ssao.size();
        let noise_scale = Vec2::new(
            width as f32 / noise.width() as f32,
            height as f32 / noise.height() as f32,
        );
        let kernel = &self.ssao_kernel[..];
        let radius = self.settings.ssao_radius_min_max;
        let colors = [ssao];
        let pass = Pass::new("ssao", &colors).clear(ClearValue::color([1.0; 4]));
        self.draw(ctx, pass, |m, gpu| {
            m.bind(gpu, "kernel", kernel)?;
            m.bind(gpu, "radius_min_max", radius)?;
            m.bind(gpu, "noise_scale", noise_scale)?;
            m.bind(gpu, "texture_normal", normal)?;
            m.bind(gpu, "texture_linear_depth", linear_depth)?;
            m.bind(gpu, "texture_noise", &noise)
        })?;
        self.render_gaussian_blur(ctx, ssao, "temp_ssao", self.settings.ssao_blur_radius)
    }

    /// Horizontal pass into the temporary `temp_name`, vertical pass back.
    pub fn render_gaussian_blur(
        &self,
        ctx: &mut RenderContext,
        target: &Texture,
        temp_name: &str,
        radius: f32,
    ) -> RenderResult<()> {
        let mut desc = target.desc.clone();
        desc.label = temp_name.to_string();
        desc.attachment = true;
        let temp = ctx
            .render_targets
            .get_temporary_desc(ctx.backend.as_dyn_mut(), desc)?;
        let clear = ClearValue::color([0.0; 4]);
        self.draw(ctx, Pass::new("gaussian_blur", &[&temp]).clear(clear), |m, gpu| {
            m.bind(gpu, "blur_scale", Vec2::new(radius, 0.0))?;
            m.bind(gpu, "texture_source", target)
        })?;
        self.draw(ctx, Pass::new("gaussian_blur", &[target]).clear(clear), |m, gpu| {
            m.bind(gpu, "blur_scale", Vec2::new(0.0, radius))?;
            m.bind(gpu, "texture_source", &temp)
        })
    }

    /// Trace reflections into SCREEN_SPACE_REFLECTION, then resolve them
    /// against last frame's result into SSR_RESOLVED.
    pub fn render_ssr(
        &self,
        ctx: &mut RenderContext,
        source: &Texture,
        normal: &Texture,
        material: &Texture,
        linear_depth: &Texture,
        velocity: &Texture,
    ) -> RenderResult<()> {
        let ssr = slot(ctx, RenderTargetSlot::ScreenSpaceReflection)?;
        self.draw(
            ctx,
            Pass::new("ssr", &[&ssr]).clear(ClearValue::color([0.0; 4])),
            |m, gpu| {
                m.bind(gpu, "texture_source", source)?;
                m.bind(gpu, "texture_normal", normal)?;
                m.bind(gpu, "texture_material", material)?;
                m.bind(gpu, "texture_linear_depth", linear_depth)
            },
        )?;
        ctx.render_targets
            .swap(RenderTargetSlot::SsrResolved, RenderTargetSlot::SsrResolvedPrev);
        let resolved = slot(ctx, RenderTargetSlot::SsrResolved)?;
        let previous = slot(ctx, RenderTargetSlot::SsrResolvedPrev)?;
        self.draw(ctx, Pass::new("ssr_resolve", &[&resolved]), |m, gpu| {
            m.bind(gpu, "texture_input", &ssr)?;
            m.bind(gpu, "texture_resolve_prev", &previous)?;
            m.bind(gpu, "texture_velocity", velocity)
        })
    }

    /// Merge the static and dynamic shadow maps into COMPOSITE_SHADOWMAP.
    pub fn render_composite_shadowmap(&self, ctx: &mut RenderContext) -> RenderResult<()> {
        let composite = slot(ctx, RenderTargetSlot::CompositeShadowmap)?;
        let static_map = slot(ctx, RenderTargetSlot::StaticShadowmap)?;
        let dynamic_map = slot(ctx, RenderTargetSlot::DynamicShadowmap)?;
        let colors = [&composite];
        let pass = Pass::new("composite_shadowmap", &colors).clear(ClearValue::color([1.0; 4]));
        self.draw(ctx, pass, |m, gpu| {
            m.bind(gpu, "texture_static_shadowmap", &static_map)?;
            m.bind(gpu, "texture_dynamic_shadowmap", &dynamic_map)
        })
    }

    /// Light the G-buffer into `target`.
    pub fn render_deferred_shading(
        &self,
        ctx: &mut RenderContext,
        target: &Texture,
        inputs: &ShadingInputs<'_>,
    ) -> RenderResult<()> {
        use RenderTargetSlot::*;
        let diffuse = slot(ctx, Diffuse)?;
        let material = slot(ctx, Material)?;
        let normal = slot(ctx, WorldNormal)?;
        let depth = slot(ctx, Depth)?;
        let shadow = slot(ctx, RenderTargetSlot::SHADOWMAP)?;
        let ssao = slot(ctx, Ssao)?;
        let reflect = slot(ctx, SsrResolved)?;
        self.draw(ctx, Pass::new("deferred_shading", &[target]), |m, gpu| {
            m.bind(gpu, "texture_diffuse", &diffuse)?;
            m.bind(gpu, "texture_material", &material)?;
            m.bind(gpu, "texture_normal", &normal)?;
            m.bind(gpu, "texture_depth", &depth)?;
            m.bind(gpu, "texture_shadow", &shadow)?;
            m.bind(gpu, "texture_ssao", &ssao)?;
            m.bind(gpu, "texture_scene_reflect", &reflect)?;
            m.bind(gpu, "texture_probe", inputs.probe)?;
            m.bind(gpu, "texture_transmittance", inputs.transmittance)?;
            m.bind(gpu, "texture_irradiance", inputs.irradiance)
        })
    }

    /// Blend the sky and in-scattering over `target`.
    pub fn render_atmosphere_composite(
        &self,
        ctx: &mut RenderContext,
        target: &Texture,
        depth: &Texture,
    ) -> RenderResult<()> {
        let sky = slot(ctx, RenderTargetSlot::Atmosphere)?;
        let inscatter = slot(ctx, RenderTargetSlot::AtmosphereInscatter)?;
        let colors = [target];
        let pass = Pass::new("atmosphere_composite", &colors).blend(BlendState::PREMULTIPLIED);
        self.draw(ctx, pass, |m, gpu| {
            m.bind(gpu, "texture_atmosphere", &sky)?;
            m.bind(gpu, "texture_inscatter", &inscatter)?;
            m.bind(gpu, "texture_depth", depth)
        })
    }

    /// Blend `input` with the reprojected history into `output`. History is
    /// fetched along the velocity of the nearest neighbor in `linear_depth`.
    pub fn render_temporal_antialiasing(
        &self,
        ctx: &mut RenderContext,
        input: &Texture,
        history: &Texture,
        velocity: &Texture,
        linear_depth: &Texture,
        output: &Texture,
    ) -> RenderResult<()> {
        self.draw(ctx, Pass::new("taa", &[output]), |m, gpu| {
            m.bind(gpu, "texture_input", input)?;
            m.bind(gpu, "texture_prev", history)?;
            m.bind(gpu, "texture_velocity", velocity)?;
            m.bind(gpu, "texture_linear_depth", linear_depth)
        })
    }

    /// Highlights into BLOOM_0, downsample to BLOOM_4, blur every level and
    /// add the sum back onto `hdr`.
    pub fn render_bloom(&self, ctx: &mut RenderContext, hdr: &Texture) -> RenderResult<()> {
        let bloom: Vec<Texture> = RenderTargetSlot::BLOOM
            .iter()
            .map(|s| slot(ctx, *s))
            .collect::<RenderResult<_>>()?;
        let settings = &self.settings;
        let clear = ClearValue::color([0.0; 4]);
        self.draw(
            ctx,
            Pass::new("bloom_highlight", &[&bloom[0]]).clear(clear),
            |m, gpu| {
                m.bind(gpu, "bloom_threshold_min", settings.bloom_threshold_min)?;
                m.bind(gpu, "bloom_threshold_max", settings.bloom_threshold_max)?;
                m.bind(gpu, "bloom_scale", settings.bloom_scale)?;
                m.bind(gpu, "texture_source", hdr)
            },
        )?;
        for pair in bloom.windows(2) {
            self.render_copy(ctx, &pair[0], &pair[1])?;
        }
        for (i, level) in bloom.iter().enumerate() {
            let temp_name = format!("bloom{}_temp", i);
            for _ in 0..BLOOM_BLUR_LOOPS {
                self.render_gaussian_blur(ctx, level, &temp_name, 1.0)?;
            }
        }
        let colors = [hdr];
        let pass = Pass::new("bloom", &colors).blend(BlendState::ADDITIVE);
        self.draw(ctx, pass, |m, gpu| {
            m.bind(gpu, "bloom_intensity", settings.bloom_intensity)?;
            for (i, level) in bloom.iter().enumerate() {
                m.bind(gpu, &format!("texture_bloom{}", i), level)?;
            }
            Ok(())
        })
    }

    pub fn render_tone_map(&self, ctx: &mut RenderContext, source: &Texture, target: &Texture) -> RenderResult<()> {
        let settings = &self.settings;
        self.draw(ctx, Pass::new("tone_map", &[target]), |m, gpu| {
            m.bind(gpu, "exposure", settings.exposure)?;
            m.bind(gpu, "contrast", settings.contrast)?;
            m.bind(gpu, "is_render_tonemapping", settings.is_render_tonemapping)?;
            m.bind(gpu, "texture_source", source)
        })
    }

    /// Blur `target` along velocity through the temporary "backbuffer_copy".
    pub fn render_motion_blur(
        &self,
        ctx: &mut RenderContext,
        velocity: &Texture,
        target: &Texture,
        delta: f32,
    ) -> RenderResult<()> {
        let mut desc = target.desc.clone();
        desc.label = "backbuffer_copy".to_string();
        desc.attachment = true;
        let copy = ctx
            .render_targets
            .get_temporary_desc(ctx.backend.as_dyn_mut(), desc)?;
        let scale = self.settings.motion_blur_scale * delta;
        self.draw(ctx, Pass::new("motion_blur", &[&copy]), |m, gpu| {
            m.bind(gpu, "motion_blur_scale", scale)?;
            m.bind(gpu, "texture_source", target)?;
            m.bind(gpu, "texture_velocity", velocity)
        })?;
        self.render_copy_rendertarget(ctx, &copy, target)
    }

    /// TAA, bloom, tone mapping and motion blur.
    ///
    /// `hdr` is the single-sample scene color (HDR, or HDR_RESOLVE under
    /// MSAA). The result lands in BACKBUFFER.
    pub fn render_postprocess(&self, ctx: &mut RenderContext, hdr: &Texture, delta: f32) -> RenderResult<()> {
        use RenderTargetSlot::*;
        let hdr_temp = slot(ctx, HdrTemp)?;
        let velocity = slot(ctx, Velocity)?;
        let backbuffer = slot(ctx, Backbuffer)?;
        if self.is_taa() {
            let resolve = slot(ctx, TaaResolve)?;
            let linear_depth = slot(ctx, LinearDepth)?;
            self.render_copy_rendertarget(ctx, hdr, &hdr_temp)?;
            self.render_temporal_antialiasing(ctx, &hdr_temp, &resolve, &velocity, &linear_depth, hdr)?;
            self.render_copy_rendertarget(ctx, hdr, &resolve)?;
        }
        if self.settings.is_render_bloom {
            self.render_bloom(ctx, hdr)?;
        }
        let hdr_prev = slot(ctx, HdrPrev)?;
        self.render_copy_rendertarget(ctx, hdr, &hdr_prev)?;
        hdr.generate_mipmap(ctx.backend.as_dyn_mut())?;
        self.render_tone_map(ctx, hdr, &backbuffer)?;
        if self.settings.is_render_motion_blur {
            self.render_motion_blur(ctx, &velocity, &backbuffer, delta)?;
        }
        Ok(())
    }

    /// Draw `texture` over the lower-left quarter of `target`.
    pub fn render_texture(&self, ctx: &mut RenderContext, texture: &Texture, target: &Texture) -> RenderResult<()> {
        let (width, height) = target.size();
        let kind = texture_type(texture);
        let lod = self.settings.debug_texture_lod;
        let layer = self.settings.debug_texture_layer;
        let colors = [target];
        let pass = Pass::new("render_texture", &colors).viewport(0, 0, (width / 2).max(1), (height / 2).max(1));
        self.draw(ctx, pass, |m, gpu| {
            m.bind(gpu, "texture_type", kind)?;
            m.bind(gpu, "texture_lod", lod)?;
            m.bind(gpu, "texture_layer", layer)?;
            let name = match kind {
                1 => "texture_source_2d_array",
                2 => "texture_source_3d",
                3 => "texture_source_cube",
                4 => "texture_source_2d_float",
                _ => "texture_source_2d",
            };
            m.bind(gpu, name, texture)
        })
    }

    /// Prefilter one face and mip level of `target` from `source`.
    #[allow(clippy::too_many_arguments)]
    pub fn render_cube_convolution(
        &self,
        ctx: &mut RenderContext,
        source: &Texture,
        target: &Texture,
        face: u32,
        level: u32,
        face_matrix: Mat4,
    ) -> RenderResult<()> {
        let mip_count = target.desc.mip_levels() as f32;
        let colors = [target];
        let pass = Pass::new("cube_convolution", &colors)
            .options(AttachOptions::face(face).with_level(level))
            .clear(ClearValue::color([0.0; 4]));
        self.draw(ctx, pass, |m, gpu| {
            m.bind(gpu, "face_matrix", face_matrix)?;
            m.bind(gpu, "lod", level as f32)?;
            m.bind(gpu, "mipmap_count", mip_count)?;
            m.bind(gpu, "texture_environment", source)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyCommand;

    fn context(aa: AntiAliasing) -> (RenderContext, PostProcess) {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut ctx = RenderContext::headless(128, 64).unwrap();
        ctx.recreate_render_targets(128, 64, aa).unwrap();
        let mut postprocess = PostProcess::new();
        postprocess.settings.anti_aliasing = aa;
        postprocess.prepare(&mut ctx).unwrap();
        ctx.dummy_mut().unwrap().take_commands();
        (ctx, postprocess)
    }

    fn program_names(ctx: &RenderContext) -> Vec<String> {
        ctx.dummy().unwrap().draws().map(|d| d.program_name.clone()).collect()
    }

    #[test]
    fn test_ssao_kernel_is_a_scaled_hemisphere() {
        let kernel = ssao_kernel(&mut Lcg::new(7));
        for (i, sample) in kernel.iter().enumerate() {
            let t = i as f32 / SSAO_KERNEL_SIZE as f32;
            assert!(sample.y > 0.0);
            assert!((sample.length() - lerp(0.1, 1.0, t * t)).abs() < 1e-5);
        }
        assert_eq!(kernel, ssao_kernel(&mut Lcg::new(7)));
    }

    #[test]
    fn test_jitter_cycles_through_sixteen_points() {
        let mut postprocess = PostProcess::new();
        let mut seen = Vec::new();
        for _ in 0..JITTER_SAMPLES {
            postprocess.update((128, 64));
            let jitter = postprocess.jitter();
            assert!(jitter.x.abs() <= 1.0 / 128.0 && jitter.y.abs() <= 1.0 / 64.0);
            assert_eq!(
                postprocess.jitter_delta(),
                (jitter - postprocess.jitter_prev()) * 0.5
            );
            seen.push(postprocess.jitter_frame());
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), JITTER_SAMPLES as usize);
    }

    #[test]
    fn test_jitter_is_zero_without_taa() {
        let mut postprocess = PostProcess::new();
        postprocess.update((128, 64));
        assert!(!postprocess.set_anti_aliasing(AntiAliasing::None));
        postprocess.update((128, 64));
        assert_eq!(postprocess.jitter(), Vec2::ZERO);
        assert_eq!(postprocess.jitter_frame(), 0);
        assert!(postprocess.set_anti_aliasing(AntiAliasing::Msaa));
    }

    #[test]
    fn test_bloom_restores_blend_state() {
        let (mut ctx, postprocess) = context(AntiAliasing::None);
        let hdr = slot(&ctx, RenderTargetSlot::Hdr).unwrap();
        postprocess.render_bloom(&mut ctx, &hdr).unwrap();

        let names = program_names(&ctx);
        assert_eq!(names.first().map(String::as_str), Some("bloom_highlight"));
        assert_eq!(names.iter().filter(|n| *n == "copy_texture").count(), 4);
        let blurs = 5 * BLOOM_BLUR_LOOPS as usize * 2;
        assert_eq!(names.iter().filter(|n| *n == "gaussian_blur").count(), blurs);

        let dummy = ctx.dummy().unwrap();
        let composite = dummy.draws().last().unwrap();
        assert_eq!(composite.program_name, "bloom");
        assert_eq!(composite.state.blend, Some(BlendState::ADDITIVE));
        assert_eq!(composite.color_attachments[0].0, hdr.handle);
        assert_eq!(dummy.pipeline_state().blend, None);
    }

    #[test]
    fn test_blended_passes_restore_previous_state() {
        let (mut ctx, postprocess) = context(AntiAliasing::None);
        let previous = PipelineState {
            depth_test: true,
            blend: Some(BlendState::ALPHA),
            ..PipelineState::default()
        };
        ctx.gpu().set_pipeline_state(&previous);
        let hdr = slot(&ctx, RenderTargetSlot::Hdr).unwrap();
        postprocess.render_bloom(&mut ctx, &hdr).unwrap();
        assert_eq!(ctx.gpu().pipeline_state(), previous);

        let depth = slot(&ctx, RenderTargetSlot::Depth).unwrap();
        postprocess.render_atmosphere_composite(&mut ctx, &hdr, &depth).unwrap();
        assert_eq!(ctx.gpu().pipeline_state(), previous);

        let draws: Vec<_> = ctx.dummy().unwrap().draws().cloned().collect();
        let bloom = draws.iter().find(|d| d.program_name == "bloom").unwrap();
        assert_eq!(bloom.state.blend, Some(BlendState::ADDITIVE));
        assert!(!bloom.state.depth_test);
        let composite = draws.iter().find(|d| d.program_name == "atmosphere_composite").unwrap();
        assert_eq!(composite.state.blend, Some(BlendState::PREMULTIPLIED));
    }

    #[test]
    fn test_ssao_blurs_through_temporary() {
        let (mut ctx, postprocess) = context(AntiAliasing::None);
        let normal = slot(&ctx, RenderTargetSlot::WorldNormal).unwrap();
        let linear = slot(&ctx, RenderTargetSlot::LinearDepth).unwrap();
        let ssao = slot(&ctx, RenderTargetSlot::Ssao).unwrap();
        postprocess.render_ssao(&mut ctx, &normal, &linear, &ssao).unwrap();

        assert_eq!(program_names(&ctx), ["ssao", "gaussian_blur", "gaussian_blur"]);
        let temp = ctx.render_targets.temporary("temp_ssao").unwrap();
        assert_eq!(temp.size(), ssao.size());
        let draw = ctx.dummy().unwrap().draws().next().unwrap();
        assert!(matches!(draw.uniforms.get("kernel"), Some(UniformData::Vec3Array(k)) if k.len() == SSAO_KERNEL_SIZE));
    }

    #[test]
    fn test_linear_depth_builds_min_z_chain() {
        let (mut ctx, postprocess) = context(AntiAliasing::None);
        let depth = slot(&ctx, RenderTargetSlot::Depth).unwrap();
        let linear = slot(&ctx, RenderTargetSlot::LinearDepth).unwrap();
        postprocess.render_linear_depth(&mut ctx, &depth, &linear).unwrap();

        let levels = linear.desc.mip_levels() as usize;
        let names = program_names(&ctx);
        assert_eq!(names[0], "linear_depth");
        assert_eq!(names.iter().filter(|n| *n == "generate_min_z").count(), levels - 1);
        let blits = ctx
            .dummy()
            .unwrap()
            .commands()
            .iter()
            .filter(|c| matches!(c, DummyCommand::Blit { .. }))
            .count();
        assert_eq!(blits, levels - 1);
    }

    #[test]
    fn test_taa_chain_writes_resolve_and_backbuffer() {
        let (mut ctx, postprocess) = context(AntiAliasing::Taa);
        let hdr = slot(&ctx, RenderTargetSlot::Hdr).unwrap();
        postprocess.render_postprocess(&mut ctx, &hdr, 1.0 / 60.0).unwrap();

        let names = program_names(&ctx);
        assert_eq!(names[0], "taa");
        let taa = ctx.dummy().unwrap().draws().next().unwrap().clone();
        let linear = slot(&ctx, RenderTargetSlot::LinearDepth).unwrap();
        assert_eq!(taa.textures.get("texture_linear_depth"), Some(&linear.handle));
        assert!(taa.textures.contains_key("texture_velocity"));
        let tone_map = names.iter().position(|n| n == "tone_map").unwrap();
        assert!(names[..tone_map].contains(&"bloom".to_string()));
        assert_eq!(names.last().map(String::as_str), Some("motion_blur"));
        assert!(ctx.render_targets.temporary("backbuffer_copy").is_some());
    }

    #[test]
    fn test_debug_texture_uses_lower_left_quarter() {
        let (mut ctx, postprocess) = context(AntiAliasing::None);
        let backbuffer = slot(&ctx, RenderTargetSlot::Backbuffer).unwrap();
        let velocity = slot(&ctx, RenderTargetSlot::Velocity).unwrap();
        postprocess.render_texture(&mut ctx, &velocity, &backbuffer).unwrap();

        let draw = ctx.dummy().unwrap().draws().next().unwrap().clone();
        assert_eq!(draw.viewport, (0, 0, 64, 32));
        assert_eq!(draw.uniforms.get("texture_type"), Some(&UniformData::Int(4)));
        assert!(draw.textures.contains_key("texture_source_2d_float"));
    }

    #[test]
    fn test_texture_type_by_target() {
        let ctx = RenderContext::headless(4, 4).unwrap();
        let cube = ctx.textures.by_name(crate::resources::DEFAULT_CUBE).unwrap();
        let flat = ctx.textures.by_name(crate::resources::FLAT_WHITE).unwrap();
        assert_eq!(texture_type(cube), 3);
        assert_eq!(texture_type(flat), 0);
    }
}
