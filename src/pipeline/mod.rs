//! Frame orchestration
//!
//! [`Renderer`] drives the fixed pass order of a frame:
//! 1. Publish the per-frame uniform blocks
//! 2. G-buffer (deferred) or normal/depth pre-pass plus camera velocity (forward)
//! 3. Linear depth, SSR and SSAO
//! 4. Static and skeletal shadow maps
//! 5. Deferred shading or forward shading into HDR
//! 6. Atmosphere, ocean, translucent actors and particle effects
//! 7. Post-processing into BACKBUFFER, debug overlays and the window blit

pub mod actors;
pub mod light_probe;
pub mod postprocess;

pub use actors::{render_actors, ActorPass, ForwardTextures, RenderMode};
pub use light_probe::CaptureMode;
pub use postprocess::{PostProcess, PostProcessSettings, ShadingInputs};

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use glam::{Mat4, Vec2};

use crate::backend::*;
use crate::context::RenderContext;
use crate::error::{RenderError, RenderResult};
use crate::resources::{
    skeletal_name, MaterialInstanceId, RenderTargetSlot, Texture, ViewConstants, ViewProjection,
    SceneConstants, DEFAULT_CUBE, DEFAULT_MATERIAL_INSTANCE,
};
use crate::scene::{ActorId, RenderGroup, RenderLists, Scene};
use crate::{AntiAliasing, RendererConfig, RenderingType};
use postprocess::{quad, slot, FULLSCREEN_STATE};

/// Polygon mode of mesh passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewMode {
    #[default]
    Shading,
    Wireframe,
}

impl ViewMode {
    fn polygon_mode(&self) -> PolygonMode {
        match self {
            ViewMode::Shading => PolygonMode::Fill,
            ViewMode::Wireframe => PolygonMode::Line,
        }
    }
}

/// Texture drawn over the lower-left quarter of the backbuffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugView {
    /// Render-target slot or temporary, by name
    RenderTarget(String),
    /// Texture store entry, by name
    Texture(String),
}

impl DebugView {
    fn name(&self) -> &str {
        match self {
            DebugView::RenderTarget(name) | DebugView::Texture(name) => name,
        }
    }
}

/// Switches toggled by commands
#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub rendering_type: RenderingType,
    pub view_mode: ViewMode,
    pub is_render_shadow: bool,
    pub is_render_skeletal: bool,
    pub is_render_effects: bool,
    /// Draw the registered [`Overlay`]
    pub is_render_font: bool,
    pub debug_view: Option<DebugView>,
    /// Material instance drawn fullscreen instead of the scene
    pub shader_debug: Option<MaterialInstanceId>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            rendering_type: RenderingType::Deferred,
            view_mode: ViewMode::Shading,
            is_render_shadow: true,
            is_render_skeletal: true,
            is_render_effects: true,
            is_render_font: true,
            debug_view: None,
            shader_debug: None,
        }
    }
}

/// CPU time of the last frame
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameTimings {
    /// Until the backend flush returned
    pub render_time: Duration,
    pub present_time: Duration,
}

/// Caller-supplied quads drawn over the backbuffer with alpha blending,
/// e.g. rasterized text.
pub trait Overlay {
    /// Draw into the bound framebuffer.
    fn render(&mut self, ctx: &mut RenderContext) -> RenderResult<()>;
}

/// Shared programs of the passes that ignore actor materials
struct SceneMaterials {
    prepass: MaterialInstanceId,
    prepass_skeletal: MaterialInstanceId,
    shadowmap: MaterialInstanceId,
    shadowmap_skeletal: MaterialInstanceId,
    object_id: MaterialInstanceId,
    object_id_skeletal: MaterialInstanceId,
    default: MaterialInstanceId,
    default_skeletal: MaterialInstanceId,
}

impl SceneMaterials {
    fn new(ctx: &mut RenderContext) -> RenderResult<Self> {
        let gpu = ctx.backend.as_dyn_mut();
        let macros = BTreeMap::new();
        let mut create = |shader: &str| {
            ctx.materials
                .create_instance(gpu, &ctx.textures, &format!("scene.{}", shader), shader, &macros)
        };
        let prepass = create("prepass")?;
        let prepass_skeletal = create(&skeletal_name("prepass"))?;
        let shadowmap = create("shadowmap")?;
        let shadowmap_skeletal = create(&skeletal_name("shadowmap"))?;
        let object_id = create("object_id")?;
        let object_id_skeletal = create(&skeletal_name("object_id"))?;
        let default_skeletal = create(&skeletal_name("default"))?;
        let default = ctx
            .materials
            .id_of(DEFAULT_MATERIAL_INSTANCE)
            .ok_or_else(|| RenderError::MissingResource(DEFAULT_MATERIAL_INSTANCE.into()))?;
        Ok(Self {
            prepass,
            prepass_skeletal,
            shadowmap,
            shadowmap_skeletal,
            object_id,
            object_id_skeletal,
            default,
            default_skeletal,
        })
    }

    fn pick(&self, group: RenderGroup, r#static: MaterialInstanceId, skeletal: MaterialInstanceId) -> MaterialInstanceId {
        match group {
            RenderGroup::Static => r#static,
            RenderGroup::Skeletal => skeletal,
        }
    }

    fn default_for(&self, group: RenderGroup) -> MaterialInstanceId {
        self.pick(group, self.default, self.default_skeletal)
    }
}

/// Frame orchestrator
pub struct Renderer {
    pub options: RenderOptions,
    pub postprocess: PostProcess,
    materials: SceneMaterials,
    size: (u32, u32),
    frame_count: u64,
    delta: f32,
    mouse_pos: Vec2,
    timings: FrameTimings,
    capture_mode: Option<CaptureMode>,
    overlay: Option<Box<dyn Overlay>>,
}

impl Renderer {
    /// Create the pass materials and the render targets for the configured
    /// resolution.
    pub fn new(ctx: &mut RenderContext, config: &RendererConfig) -> RenderResult<Self> {
        let mut postprocess = PostProcess::new();
        postprocess.settings.anti_aliasing = config.anti_aliasing;
        postprocess.prepare(ctx)?;
        let materials = SceneMaterials::new(ctx)?;
        ctx.recreate_render_targets(config.width, config.height, config.anti_aliasing)?;
        log::info!(
            "Renderer ready: {}x{} {} {}",
            config.width,
            config.height,
            config.rendering_type.name(),
            config.anti_aliasing.name()
        );
        Ok(Self {
            options: RenderOptions {
                rendering_type: config.rendering_type,
                ..Default::default()
            },
            postprocess,
            materials,
            size: (config.width, config.height),
            frame_count: 0,
            delta: 0.0,
            mouse_pos: Vec2::ZERO,
            timings: FrameTimings::default(),
            capture_mode: None,
            overlay: None,
        })
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn timings(&self) -> FrameTimings {
        self.timings
    }

    /// True while a light probe is being captured.
    pub fn is_capturing(&self) -> bool {
        self.capture_mode.is_some()
    }

    pub fn set_mouse_pos(&mut self, x: f32, y: f32) {
        self.mouse_pos = Vec2::new(x, y);
    }

    /// Resize the window surface and recreate every render target.
    pub fn resize(&mut self, ctx: &mut RenderContext, width: u32, height: u32) -> RenderResult<()> {
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidResolution(width, height));
        }
        ctx.gpu().resize_surface(width, height);
        ctx.recreate_render_targets(width, height, self.postprocess.anti_aliasing())?;
        self.size = (width, height);
        Ok(())
    }

    /// Rebuild the targets at the current size, e.g. after a forced clear.
    pub fn recreate_render_targets(&mut self, ctx: &mut RenderContext) -> RenderResult<()> {
        let (width, height) = self.size;
        ctx.recreate_render_targets(width, height, self.postprocess.anti_aliasing())
    }

    pub fn set_anti_aliasing(&mut self, ctx: &mut RenderContext, anti_aliasing: AntiAliasing) -> RenderResult<()> {
        log::info!("Anti-aliasing: {}", anti_aliasing.name());
        if self.postprocess.set_anti_aliasing(anti_aliasing) {
            self.recreate_render_targets(ctx)?;
        }
        Ok(())
    }

    pub fn set_rendering_type(&mut self, rendering_type: RenderingType) {
        log::info!("Rendering type: {}", rendering_type.name());
        self.options.rendering_type = rendering_type;
    }

    pub fn set_view_mode(&mut self, view_mode: ViewMode) {
        self.options.view_mode = view_mode;
    }

    pub fn set_debug_view(&mut self, view: Option<DebugView>) {
        self.options.debug_view = view;
    }

    pub fn set_shader_debug(&mut self, instance: Option<MaterialInstanceId>) {
        self.options.shader_debug = instance;
    }

    pub fn set_overlay(&mut self, overlay: Option<Box<dyn Overlay>>) {
        self.overlay = overlay;
    }

    /// Advance the jitter sequence, fit the camera to the window and update
    /// the scene.
    pub fn update_scene(&mut self, ctx: &RenderContext, scene: &mut Scene, delta: f32) {
        let taa_size = ctx
            .render_targets
            .get(RenderTargetSlot::TaaResolve)
            .map(Texture::size)
            .unwrap_or(self.size);
        self.postprocess.update(taa_size);
        let (width, height) = self.size;
        scene
            .camera
            .update_projection(-1.0, width as f32 / height.max(1) as f32);
        scene.update(delta, self.postprocess.jitter());
        self.delta = delta;
    }

    /// Capture pending probes, render the scene and the overlays, then
    /// present.
    pub fn render_frame(&mut self, ctx: &mut RenderContext, scene: &mut Scene) -> RenderResult<FrameTimings> {
        let start = Instant::now();
        self.render_light_probes(ctx, scene)?;
        self.render_scene(ctx, scene, self.delta)?;

        let backbuffer = slot(ctx, RenderTargetSlot::Backbuffer)?;
        self.render_debug_view(ctx, &backbuffer)?;
        if self.options.is_render_font {
            if let Some(overlay) = self.overlay.as_mut() {
                let gpu = ctx.backend.as_dyn_mut();
                ctx.framebuffers.bind_framebuffer(gpu, &[&backbuffer], None)?;
                let previous = gpu.pipeline_state();
                gpu.set_pipeline_state(&PipelineState {
                    blend: Some(BlendState::ALPHA),
                    ..FULLSCREEN_STATE
                });
                let result = overlay.render(ctx);
                ctx.gpu().set_pipeline_state(&previous);
                result?;
            }
        }

        let (width, height) = self.size;
        let gpu = ctx.backend.as_dyn_mut();
        let src = ctx.framebuffers.bind_framebuffer(gpu, &[&backbuffer], None)?;
        ctx.framebuffers.blit_to_window(gpu, src, width, height)?;
        gpu.flush()?;
        let render_time = start.elapsed();

        let present_start = Instant::now();
        gpu.present()?;
        self.timings = FrameTimings {
            render_time,
            present_time: present_start.elapsed(),
        };
        self.frame_count += 1;
        Ok(self.timings)
    }

    /// Upload the five per-frame blocks for the current camera.
    pub fn bind_uniform_blocks(&self, ctx: &mut RenderContext, scene: &Scene) -> RenderResult<()> {
        let camera = &scene.camera;
        let taa = self.postprocess.is_taa();
        let (full_w, full_h) = ctx.render_targets.full_size();
        let (width, height) = self.size;
        let scene_constants = SceneConstants {
            time: scene.time(),
            jitter_frame: if taa { self.postprocess.jitter_frame() as f32 } else { 0.0 },
            render_ssr: self.postprocess.settings.is_render_ssr as i32,
            render_ssao: self.postprocess.settings.is_render_ssao as i32,
            screen_size: Vec2::new(full_w as f32, full_h as f32),
            backbuffer_size: Vec2::new(width as f32, height as f32),
            mouse_pos: self.mouse_pos,
            delta_time: self.delta,
            _pad0: 0.0,
        };
        let view_constants = ViewConstants {
            view: camera.view(),
            inv_view: camera.inv_view(),
            view_origin: camera.view_origin(),
            inv_view_origin: camera.inv_view_origin(),
            projection: camera.projection_jitter(),
            inv_projection: camera.inv_projection(),
            camera_position: camera.position().extend(1.0),
            near_far: Vec2::new(camera.near, camera.far),
            jitter_delta: if taa { self.postprocess.jitter_delta() } else { Vec2::ZERO },
            jitter_offset: camera.jitter(),
            _pad0: Vec2::ZERO,
        };
        let view_projection = ViewProjection {
            view_projection: camera.view_projection_jitter(),
            prev_view_projection: camera.prev_view_projection_jitter(),
        };

        let gpu = ctx.backend.as_dyn_mut();
        let blocks = &ctx.uniform_blocks;
        blocks.scene_constants.bind_uniform_block(gpu, &scene_constants)?;
        blocks.view_constants.bind_uniform_block(gpu, &view_constants)?;
        blocks.view_projection.bind_uniform_block(gpu, &view_projection)?;
        blocks
            .light_constants
            .bind_uniform_block(gpu, &scene.main_light.constants())?;
        blocks
            .point_light_constants
            .bind_uniform_block(gpu, &scene.point_light_constants())
    }

    /// Mesh-pass state: LEQUAL depth with writes, back-face culling, the
    /// configured polygon mode.
    fn base_state(&self) -> PipelineState {
        PipelineState {
            polygon_mode: self.options.view_mode.polygon_mode(),
            ..Default::default()
        }
    }

    fn is_msaa_targets(ctx: &RenderContext) -> bool {
        ctx.render_targets.anti_aliasing() == AntiAliasing::Msaa
    }

    /// Single-sample scene color: HDR_RESOLVE under MSAA, else HDR.
    pub fn hdr_output(&self, ctx: &RenderContext) -> RenderResult<Texture> {
        if Self::is_msaa_targets(ctx) {
            slot(ctx, RenderTargetSlot::HdrResolve)
        } else {
            slot(ctx, RenderTargetSlot::Hdr)
        }
    }

    /// Ambient cube for lighting: the first captured probe, else the
    /// atmosphere probe.
    fn probe_texture(&self, ctx: &RenderContext, scene: &Scene) -> RenderResult<Texture> {
        if self.capture_mode.is_none() {
            let captured = scene
                .light_probes
                .iter()
                .find(|p| p.captured)
                .and_then(|p| p.texture_probe.clone());
            if let Some(texture) = captured {
                return Ok(texture);
            }
        }
        ctx.render_targets
            .get(RenderTargetSlot::LightProbeAtmosphere)
            .or_else(|| ctx.textures.by_name(DEFAULT_CUBE))
            .cloned()
            .ok_or_else(|| RenderError::MissingResource(DEFAULT_CUBE.into()))
    }

    fn clear_target(ctx: &mut RenderContext, colors: &[&Texture], depth: Option<&Texture>, value: ClearValue) -> RenderResult<()> {
        let gpu = ctx.backend.as_dyn_mut();
        ctx.framebuffers.bind_framebuffer(gpu, colors, depth)?;
        gpu.clear(value)?;
        Ok(())
    }

    /// Render one view of the scene into HDR and, outside probe capture,
    /// post-process it into BACKBUFFER.
    pub fn render_scene(&mut self, ctx: &mut RenderContext, scene: &mut Scene, delta: f32) -> RenderResult<()> {
        scene.atmosphere.prepare(ctx)?;
        self.bind_uniform_blocks(ctx, scene)?;
        let base = self.base_state();
        ctx.gpu().set_pipeline_state(&base);

        match self.capture_mode {
            Some(CaptureMode::AtmosphereOnly) => return self.render_probe_atmosphere(ctx, scene),
            None => {
                if let Some(instance) = self.options.shader_debug {
                    return self.render_shader_debug(ctx, instance);
                }
            }
            Some(CaptureMode::Scene) => {}
        }

        if scene.ocean.is_render_ocean {
            scene.ocean.simulate(ctx)?;
            ctx.gpu().set_pipeline_state(&base);
        }

        let lists = scene.gather_render_lists(ctx);
        let msaa = Self::is_msaa_targets(ctx);
        let deferred = self.options.rendering_type == RenderingType::Deferred;

        if deferred {
            self.render_gbuffer(ctx, scene, &lists)?;
        } else {
            self.render_prepass(ctx, scene, &lists)?;
        }
        self.render_preprocess(ctx, deferred)?;
        self.render_shadow(ctx, scene, &lists)?;
        self.render_solid(ctx, scene, &lists, deferred && !msaa, msaa)?;

        let hdr = slot(ctx, RenderTargetSlot::Hdr)?;
        let depth = slot(ctx, RenderTargetSlot::Depth)?;
        let scene_depth = if msaa {
            slot(ctx, RenderTargetSlot::DepthMs)?
        } else {
            depth.clone()
        };

        if scene.atmosphere.is_render_atmosphere {
            let sun = scene.main_light.light_direction();
            scene
                .atmosphere
                .render_precomputed_atmosphere(ctx, &depth, sun, false)?;
            self.postprocess.render_atmosphere_composite(ctx, &hdr, &depth)?;
        }

        let probe = self.probe_texture(ctx, scene)?;
        if scene.ocean.is_render_ocean {
            let transmittance = scene.atmosphere.transmittance(ctx)?.clone();
            let gpu = ctx.backend.as_dyn_mut();
            ctx.framebuffers
                .bind_framebuffer(gpu, &[&hdr], Some(&scene_depth))?;
            scene.ocean.render_ocean(ctx, &probe, &transmittance)?;
        }

        self.render_translucent(ctx, scene, &lists, &hdr, &scene_depth, &probe)?;

        if self.options.is_render_effects && !scene.effects.is_empty() {
            let gpu = ctx.backend.as_dyn_mut();
            ctx.framebuffers
                .bind_framebuffer(gpu, &[&hdr], Some(&scene_depth))?;
            scene.effects.render(ctx, &scene.camera)?;
        }

        if msaa {
            let resolve = slot(ctx, RenderTargetSlot::HdrResolve)?;
            self.postprocess.render_copy_rendertarget(ctx, &hdr, &resolve)?;
        }
        ctx.gpu().set_pipeline_state(&base);

        if self.capture_mode.is_some() {
            return Ok(());
        }
        let output = self.hdr_output(ctx)?;
        self.postprocess.render_postprocess(ctx, &output, delta)
    }

    /// Deferred surface attributes of the solid actors.
    fn render_gbuffer(&self, ctx: &mut RenderContext, scene: &Scene, lists: &RenderLists) -> RenderResult<()> {
        use RenderTargetSlot::*;
        let colors = [
            slot(ctx, Diffuse)?,
            slot(ctx, Material)?,
            slot(ctx, WorldNormal)?,
            slot(ctx, Velocity)?,
        ];
        let depth = slot(ctx, Depth)?;
        let gpu = ctx.backend.as_dyn_mut();
        let refs: Vec<&Texture> = colors.iter().collect();
        ctx.framebuffers.bind_framebuffer(gpu, &refs, Some(&depth))?;
        gpu.clear(ClearValue::color_depth([0.0; 4], 1.0))?;
        gpu.set_pipeline_state(&self.base_state());
        for group in self.groups() {
            let pass = ActorPass {
                group,
                mode: RenderMode::GBuffer,
                scene_material: None,
                default_material: self.materials.default_for(group),
                forward: None,
            };
            render_actors(ctx, &scene.actors, &pass, lists.solid(group))?;
        }
        Ok(())
    }

    /// World normal and depth for forward shading, then camera velocity.
    fn render_prepass(&self, ctx: &mut RenderContext, scene: &Scene, lists: &RenderLists) -> RenderResult<()> {
        let normal = slot(ctx, RenderTargetSlot::WorldNormal)?;
        let depth = slot(ctx, RenderTargetSlot::Depth)?;
        let velocity = slot(ctx, RenderTargetSlot::Velocity)?;
        let gpu = ctx.backend.as_dyn_mut();
        ctx.framebuffers.bind_framebuffer(gpu, &[&normal], Some(&depth))?;
        gpu.clear(ClearValue::color_depth([0.0; 4], 1.0))?;
        gpu.set_pipeline_state(&self.base_state());
        for group in self.groups() {
            let materials = &self.materials;
            let pass = ActorPass {
                group,
                mode: RenderMode::PrePass,
                scene_material: Some(materials.pick(group, materials.prepass, materials.prepass_skeletal)),
                default_material: materials.default_for(group),
                forward: None,
            };
            render_actors(ctx, &scene.actors, &pass, lists.solid(group))?;
        }
        self.postprocess.render_velocity(ctx, &depth, &velocity)
    }

    /// Linear depth, SSR and SSAO. Disabled effects leave their targets
    /// neutral.
    fn render_preprocess(&self, ctx: &mut RenderContext, deferred: bool) -> RenderResult<()> {
        use RenderTargetSlot::*;
        let depth = slot(ctx, Depth)?;
        let linear = slot(ctx, LinearDepth)?;
        let normal = slot(ctx, WorldNormal)?;
        self.postprocess.render_linear_depth(ctx, &depth, &linear)?;

        let settings = &self.postprocess.settings;
        if settings.is_render_ssr && deferred && self.capture_mode.is_none() {
            let source = slot(ctx, HdrPrev)?;
            let material = slot(ctx, Material)?;
            let velocity = slot(ctx, Velocity)?;
            self.postprocess
                .render_ssr(ctx, &source, &normal, &material, &linear, &velocity)?;
        } else {
            let resolved = slot(ctx, SsrResolved)?;
            Self::clear_target(ctx, &[&resolved], None, ClearValue::color([0.0; 4]))?;
        }

        let ssao = slot(ctx, Ssao)?;
        if settings.is_render_ssao {
            self.postprocess.render_ssao(ctx, &normal, &linear, &ssao)
        } else {
            Self::clear_target(ctx, &[&ssao], None, ClearValue::color([1.0; 4]))
        }
    }

    /// Static and skeletal depth from the main light, merged into
    /// COMPOSITE_SHADOWMAP. The shadow box follows the camera, so both maps
    /// are redrawn every frame.
    fn render_shadow(&self, ctx: &mut RenderContext, scene: &Scene, lists: &RenderLists) -> RenderResult<()> {
        if !self.options.is_render_shadow {
            let composite = slot(ctx, RenderTargetSlot::CompositeShadowmap)?;
            return Self::clear_target(ctx, &[&composite], None, ClearValue::color([1.0; 4]));
        }
        let state = PipelineState {
            front_face: FrontFace::Cw,
            polygon_mode: PolygonMode::Fill,
            ..Default::default()
        };
        for (group, target) in [
            (RenderGroup::Static, RenderTargetSlot::StaticShadowmap),
            (RenderGroup::Skeletal, RenderTargetSlot::DynamicShadowmap),
        ] {
            let map = slot(ctx, target)?;
            Self::clear_target(ctx, &[], Some(&map), ClearValue::depth(1.0))?;
            if group == RenderGroup::Skeletal && !self.options.is_render_skeletal {
                continue;
            }
            ctx.gpu().set_pipeline_state(&state);
            let materials = &self.materials;
            let pass = ActorPass {
                group,
                mode: RenderMode::Shadow,
                scene_material: Some(materials.pick(group, materials.shadowmap, materials.shadowmap_skeletal)),
                default_material: materials.default_for(group),
                forward: None,
            };
            render_actors(ctx, &scene.actors, &pass, lists.shadow(group))?;
        }
        self.postprocess.render_composite_shadowmap(ctx)?;
        ctx.gpu().set_pipeline_state(&self.base_state());
        Ok(())
    }

    fn forward_inputs(&self, ctx: &RenderContext, scene: &Scene, probe: &Texture) -> RenderResult<[Texture; 6]> {
        Ok([
            probe.clone(),
            slot(ctx, RenderTargetSlot::SHADOWMAP)?,
            slot(ctx, RenderTargetSlot::Ssao)?,
            slot(ctx, RenderTargetSlot::SsrResolved)?,
            scene.atmosphere.transmittance(ctx)?.clone(),
            scene.atmosphere.irradiance(ctx)?.clone(),
        ])
    }

    /// Lit solid actors into HDR. Under MSAA the forward path draws into
    /// HDR with DEPTH_MS regardless of the rendering type.
    fn render_solid(
        &self,
        ctx: &mut RenderContext,
        scene: &Scene,
        lists: &RenderLists,
        deferred: bool,
        msaa: bool,
    ) -> RenderResult<()> {
        let hdr = slot(ctx, RenderTargetSlot::Hdr)?;
        let probe = self.probe_texture(ctx, scene)?;
        if deferred {
            let transmittance = scene.atmosphere.transmittance(ctx)?.clone();
            let irradiance = scene.atmosphere.irradiance(ctx)?.clone();
            let inputs = ShadingInputs {
                probe: &probe,
                transmittance: &transmittance,
                irradiance: &irradiance,
            };
            return self.postprocess.render_deferred_shading(ctx, &hdr, &inputs);
        }

        let depth = if msaa {
            slot(ctx, RenderTargetSlot::DepthMs)?
        } else {
            slot(ctx, RenderTargetSlot::Depth)?
        };
        let gpu = ctx.backend.as_dyn_mut();
        ctx.framebuffers.bind_framebuffer(gpu, &[&hdr], Some(&depth))?;
        // the single-sample pre-pass depth is reused outside MSAA
        gpu.clear(if msaa {
            ClearValue::color_depth([0.0; 4], 1.0)
        } else {
            ClearValue::color([0.0; 4])
        })?;
        gpu.set_pipeline_state(&self.base_state());

        let [probe, shadow, ssao, reflect, transmittance, irradiance] = self.forward_inputs(ctx, scene, &probe)?;
        let forward = ForwardTextures {
            probe: &probe,
            shadow: &shadow,
            ssao: &ssao,
            scene_reflect: &reflect,
            transmittance: &transmittance,
            irradiance: &irradiance,
        };
        for group in self.groups() {
            let pass = ActorPass {
                group,
                mode: RenderMode::Forward,
                scene_material: None,
                default_material: self.materials.default_for(group),
                forward: Some(forward),
            };
            render_actors(ctx, &scene.actors, &pass, lists.solid(group))?;
        }
        Ok(())
    }

    /// Forward-lit translucent actors blended over HDR without depth writes.
    fn render_translucent(
        &self,
        ctx: &mut RenderContext,
        scene: &Scene,
        lists: &RenderLists,
        hdr: &Texture,
        depth: &Texture,
        probe: &Texture,
    ) -> RenderResult<()> {
        if self.groups().all(|g| lists.translucent(g).is_empty()) {
            return Ok(());
        }
        let [probe, shadow, ssao, reflect, transmittance, irradiance] = self.forward_inputs(ctx, scene, probe)?;
        let gpu = ctx.backend.as_dyn_mut();
        ctx.framebuffers.bind_framebuffer(gpu, &[hdr], Some(depth))?;
        let previous = gpu.pipeline_state();
        gpu.set_pipeline_state(&PipelineState {
            depth_write: false,
            blend: Some(BlendState::ALPHA),
            ..self.base_state()
        });
        let forward = ForwardTextures {
            probe: &probe,
            shadow: &shadow,
            ssao: &ssao,
            scene_reflect: &reflect,
            transmittance: &transmittance,
            irradiance: &irradiance,
        };
        let result = self.groups().try_for_each(|group| {
            let pass = ActorPass {
                group,
                mode: RenderMode::Forward,
                scene_material: None,
                default_material: self.materials.default_for(group),
                forward: Some(forward),
            };
            render_actors(ctx, &scene.actors, &pass, lists.translucent(group))
        });
        ctx.gpu().set_pipeline_state(&previous);
        result
    }

    /// Skeletal actors are skipped while skeletal rendering is off.
    fn groups(&self) -> impl Iterator<Item = RenderGroup> {
        let skeletal = self.options.is_render_skeletal;
        [RenderGroup::Static, RenderGroup::Skeletal]
            .into_iter()
            .filter(move |g| *g == RenderGroup::Static || skeletal)
    }

    /// Sky only, as seen from a probe: neutral shadow and G-buffer, then
    /// the atmosphere composited over a cleared HDR.
    fn render_probe_atmosphere(&self, ctx: &mut RenderContext, scene: &Scene) -> RenderResult<()> {
        use RenderTargetSlot::*;
        let composite = slot(ctx, CompositeShadowmap)?;
        let normal = slot(ctx, WorldNormal)?;
        let depth = slot(ctx, Depth)?;
        let linear = slot(ctx, LinearDepth)?;
        let hdr = self.hdr_output(ctx)?;
        Self::clear_target(ctx, &[&composite], None, ClearValue::color([1.0; 4]))?;
        Self::clear_target(ctx, &[&normal], Some(&depth), ClearValue::color_depth([0.0, 1.0, 0.0, 0.0], 1.0))?;
        self.postprocess.render_linear_depth(ctx, &depth, &linear)?;

        Self::clear_target(ctx, &[&hdr], None, ClearValue::color([0.0; 4]))?;
        if scene.atmosphere.is_render_atmosphere {
            let sun = scene.main_light.light_direction();
            scene.atmosphere.render_precomputed_atmosphere(ctx, &depth, sun, true)?;
            self.postprocess.render_atmosphere_composite(ctx, &hdr, &depth)?;
        }
        ctx.gpu().set_pipeline_state(&self.base_state());
        Ok(())
    }

    /// Draw one material instance over the whole BACKBUFFER.
    fn render_shader_debug(&self, ctx: &mut RenderContext, instance: MaterialInstanceId) -> RenderResult<()> {
        let backbuffer = slot(ctx, RenderTargetSlot::Backbuffer)?;
        let quad = quad(ctx)?;
        let gpu = ctx.backend.as_dyn_mut();
        ctx.framebuffers.bind_framebuffer(gpu, &[&backbuffer], None)?;
        gpu.clear(ClearValue::color([0.0, 0.0, 0.0, 1.0]))?;
        gpu.set_pipeline_state(&FULLSCREEN_STATE);
        let material = ctx.materials.use_instance(gpu, instance)?;
        material.bind(gpu, "model", Mat4::IDENTITY)?;
        quad.bind_vertex_buffer(gpu);
        quad.draw_elements(gpu)?;
        gpu.set_pipeline_state(&self.base_state());
        Ok(())
    }

    /// Draw the selected debug texture over `target`. A view whose texture
    /// no longer exists is dropped.
    fn render_debug_view(&mut self, ctx: &mut RenderContext, target: &Texture) -> RenderResult<()> {
        let Some(view) = &self.options.debug_view else {
            return Ok(());
        };
        let texture = match view {
            DebugView::RenderTarget(name) => ctx.render_targets.find(name),
            DebugView::Texture(name) => ctx.textures.by_name(name),
        }
        .cloned();
        match texture {
            Some(texture) if texture.handle != target.handle => {
                self.postprocess.render_texture(ctx, &texture, target)
            }
            Some(_) => Ok(()),
            None => {
                log::warn!("Debug view {} is not available", view.name());
                self.options.debug_view = None;
                Ok(())
            }
        }
    }

    /// Draw actor ids into OBJECT_ID and return the actor under the pixel
    /// `(x, y)`, counted from the top-left.
    pub fn pick_object(&mut self, ctx: &mut RenderContext, scene: &mut Scene, x: u32, y: u32) -> RenderResult<Option<ActorId>> {
        for (index, actor) in scene.actors.values_mut().enumerate() {
            actor.object_id = (index + 1) as f32;
        }
        self.bind_uniform_blocks(ctx, scene)?;
        let lists = scene.gather_render_lists(ctx);
        let object_id = slot(ctx, RenderTargetSlot::ObjectId)?;
        let depth = ctx.render_targets.get_temporary_desc(
            ctx.backend.as_dyn_mut(),
            TextureDescriptor {
                label: "object_id_depth".to_string(),
                width: object_id.width(),
                height: object_id.height(),
                format: TextureFormat::Depth32Float,
                attachment: true,
                ..Default::default()
            },
        )?;
        Self::clear_target(ctx, &[&object_id], Some(&depth), ClearValue::color_depth([0.0; 4], 1.0))?;
        ctx.gpu().set_pipeline_state(&PipelineState::default());
        for group in self.groups() {
            let materials = &self.materials;
            let pass = ActorPass {
                group,
                mode: RenderMode::ObjectId,
                scene_material: Some(materials.pick(group, materials.object_id, materials.object_id_skeletal)),
                default_material: materials.default_for(group),
                forward: None,
            };
            render_actors(ctx, &scene.actors, &pass, lists.solid(group))?;
        }

        if x >= object_id.width() || y >= object_id.height() {
            return Ok(None);
        }
        let texels = object_id.read_texels(ctx.gpu(), 0, 0)?;
        let value = texels
            .get((y * object_id.width() + x) as usize)
            .map(|texel| texel[0])
            .unwrap_or(0.0);
        if value < 0.5 {
            return Ok(None);
        }
        Ok(scene
            .actors
            .iter()
            .find(|(_, actor)| (actor.object_id - value).abs() < 0.5)
            .map(|(id, _)| id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DrawRecord;
    use crate::scene::{Actor, ActorPart, LightProbe};
    use glam::Vec3;

    fn setup(width: u32, height: u32, anti_aliasing: AntiAliasing) -> (RenderContext, Renderer, Scene) {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut ctx = RenderContext::headless(width, height).unwrap();
        let config = RendererConfig {
            width,
            height,
            anti_aliasing,
            ..Default::default()
        };
        let renderer = Renderer::new(&mut ctx, &config).unwrap();
        let mut scene = Scene::new("test", false);
        scene.ocean.is_render_ocean = false;
        let geometry = ctx.geometries.id_of("sphere").unwrap();
        scene.add_actor(Actor::new(
            "sphere",
            vec![ActorPart {
                geometry,
                material_instance: None,
            }],
        ));
        scene.camera.transform.set_position(Vec3::new(0.0, 0.0, 5.0));
        (ctx, renderer, scene)
    }

    fn draws(ctx: &RenderContext) -> Vec<DrawRecord> {
        ctx.dummy().unwrap().draws().cloned().collect()
    }

    fn position(draws: &[DrawRecord], program: &str) -> Option<usize> {
        draws.iter().position(|d| d.program_name == program)
    }

    #[test]
    fn test_deferred_pass_order() {
        let (mut ctx, mut renderer, mut scene) = setup(64, 32, AntiAliasing::None);
        renderer.update_scene(&ctx, &mut scene, 1.0 / 60.0);
        ctx.dummy_mut().unwrap().take_commands();
        renderer.render_scene(&mut ctx, &mut scene, 1.0 / 60.0).unwrap();

        let draws = draws(&ctx);
        let order = [
            "default",
            "linear_depth",
            "ssao",
            "shadowmap",
            "composite_shadowmap",
            "deferred_shading",
            "atmosphere",
            "atmosphere_composite",
            "tone_map",
        ];
        let indices: Vec<usize> = order.iter().map(|p| position(&draws, p).unwrap()).collect();
        assert!(indices.windows(2).all(|w| w[0] < w[1]), "{:?}", indices);
        let gbuffer = &draws[indices[0]];
        assert_eq!(gbuffer.color_attachments.len(), 4);
        assert_eq!(gbuffer.uniforms.get("is_render_gbuffer"), Some(&UniformData::Bool(true)));
        let shadow = &draws[indices[3]];
        assert_eq!(shadow.state.front_face, FrontFace::Cw);
    }

    #[test]
    fn test_forward_uses_prepass_and_velocity() {
        let (mut ctx, mut renderer, mut scene) = setup(64, 32, AntiAliasing::None);
        renderer.set_rendering_type(RenderingType::Forward);
        renderer.update_scene(&ctx, &mut scene, 1.0 / 60.0);
        ctx.dummy_mut().unwrap().take_commands();
        renderer.render_scene(&mut ctx, &mut scene, 1.0 / 60.0).unwrap();

        let draws = draws(&ctx);
        assert!(position(&draws, "deferred_shading").is_none());
        assert!(position(&draws, "ssr").is_none());
        let prepass = position(&draws, "prepass").unwrap();
        let velocity = position(&draws, "velocity").unwrap();
        let forward = draws
            .iter()
            .position(|d| d.uniforms.get("is_render_gbuffer") == Some(&UniformData::Bool(false)))
            .unwrap();
        assert!(prepass < velocity && velocity < forward);
        assert!(draws[forward].textures.contains_key("texture_shadow"));
    }

    #[test]
    fn test_msaa_resolves_before_postprocess() {
        let (mut ctx, mut renderer, mut scene) = setup(64, 32, AntiAliasing::Msaa);
        renderer.update_scene(&ctx, &mut scene, 1.0 / 60.0);
        ctx.dummy_mut().unwrap().take_commands();
        renderer.render_scene(&mut ctx, &mut scene, 1.0 / 60.0).unwrap();

        let hdr = slot(&ctx, RenderTargetSlot::Hdr).unwrap();
        let resolve = slot(&ctx, RenderTargetSlot::HdrResolve).unwrap();
        assert_eq!(hdr.samples(), crate::resources::MSAA_SAMPLES);
        let draws = draws(&ctx);
        let forward = draws
            .iter()
            .find(|d| d.uniforms.get("is_render_gbuffer") == Some(&UniformData::Bool(false)))
            .unwrap();
        assert_eq!(forward.color_attachments[0].0, hdr.handle);
        let tone_map = &draws[position(&draws, "tone_map").unwrap()];
        assert_eq!(tone_map.textures.get("texture_source"), Some(&resolve.handle));
    }

    #[test]
    fn test_shader_debug_skips_scene() {
        let (mut ctx, mut renderer, mut scene) = setup(32, 32, AntiAliasing::None);
        let id = ctx.materials.id_of(DEFAULT_MATERIAL_INSTANCE).unwrap();
        renderer.set_shader_debug(Some(id));
        renderer.update_scene(&ctx, &mut scene, 0.0);
        ctx.dummy_mut().unwrap().take_commands();
        renderer.render_scene(&mut ctx, &mut scene, 0.0).unwrap();
        let draws = draws(&ctx);
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].program_name, "default");
        assert!(!draws[0].state.depth_test);
    }

    #[test]
    fn test_render_frame_counts_and_presents() {
        let (mut ctx, mut renderer, mut scene) = setup(32, 32, AntiAliasing::Taa);
        for _ in 0..2 {
            renderer.update_scene(&ctx, &mut scene, 1.0 / 60.0);
            renderer.render_frame(&mut ctx, &mut scene).unwrap();
        }
        assert_eq!(renderer.frame_count(), 2);
        assert_eq!(renderer.postprocess.jitter_frame(), 2);
        let presents = ctx
            .dummy()
            .unwrap()
            .commands()
            .iter()
            .filter(|c| matches!(c, crate::backend::dummy::DummyCommand::Present))
            .count();
        assert_eq!(presents, 2);
    }

    #[test]
    fn test_missing_debug_view_is_cleared() {
        let (mut ctx, mut renderer, mut scene) = setup(32, 32, AntiAliasing::None);
        renderer.set_debug_view(Some(DebugView::RenderTarget("NOT_A_TARGET".into())));
        renderer.update_scene(&ctx, &mut scene, 0.0);
        renderer.render_frame(&mut ctx, &mut scene).unwrap();
        assert_eq!(renderer.options.debug_view, None);

        renderer.set_debug_view(Some(DebugView::RenderTarget("VELOCITY".into())));
        ctx.dummy_mut().unwrap().take_commands();
        renderer.render_frame(&mut ctx, &mut scene).unwrap();
        assert!(position(&draws(&ctx), "render_texture").is_some());
    }

    #[test]
    fn test_resize_rejects_zero() {
        let (mut ctx, mut renderer, _) = setup(32, 32, AntiAliasing::None);
        let err = renderer.resize(&mut ctx, 0, 16).unwrap_err();
        assert!(matches!(err, RenderError::InvalidResolution(0, 16)));
        renderer.resize(&mut ctx, 48, 16).unwrap();
        assert_eq!(slot(&ctx, RenderTargetSlot::Hdr).unwrap().size(), (48, 16));
    }

    #[test]
    fn test_probe_capture_restores_camera_and_caches_cube() {
        let (mut ctx, mut renderer, mut scene) = setup(32, 32, AntiAliasing::Taa);
        scene.add_light_probe(LightProbe::new("probe", Vec3::new(0.0, 10.0, 0.0)));
        renderer.update_scene(&ctx, &mut scene, 0.0);
        let fov = scene.camera.fov;
        let position = scene.camera.position();
        renderer.render_light_probes(&mut ctx, &mut scene).unwrap();

        assert!(scene.light_probes[0].captured);
        assert_eq!(scene.camera.fov, fov);
        assert_eq!(scene.camera.position(), position);
        assert_eq!(renderer.postprocess.anti_aliasing(), AntiAliasing::Taa);
        assert!(!renderer.is_capturing());
        let cached = ctx.render_targets.temporary(light_probe::TEMP_CUBE).unwrap();
        let prefiltered = scene.light_probes[0].texture_probe.as_ref().unwrap();
        assert_ne!(cached.handle, prefiltered.handle);
        assert_eq!(prefiltered.target(), TextureTarget::Cube);
    }

    #[test]
    fn test_probe_capture_is_deterministic() {
        let (mut ctx, mut renderer, mut scene) = setup(32, 32, AntiAliasing::None);
        scene.actors.clear();
        scene.add_light_probe(LightProbe::new("probe", Vec3::new(0.0, 10.0, 0.0)));
        renderer.update_scene(&ctx, &mut scene, 0.0);

        let mut capture = || {
            scene.light_probes[0].invalidate();
            renderer.render_light_probes(&mut ctx, &mut scene).unwrap();
            let cube = scene.light_probes[0].texture_probe.clone().unwrap();
            (0..6)
                .map(|face| cube.get_image_data(ctx.gpu(), face, 0).unwrap())
                .collect::<Vec<_>>()
        };
        let first = capture();
        let second = capture();
        assert_eq!(first, second);
    }

    #[test]
    fn test_failed_prefilter_releases_capture() {
        let (mut ctx, mut renderer, mut scene) = setup(32, 32, AntiAliasing::None);
        scene.add_light_probe(LightProbe::new("probe", Vec3::new(0.0, 10.0, 0.0)));
        renderer.update_scene(&ctx, &mut scene, 0.0);
        let desc = LightProbe::cube_descriptor("probe");
        let capture = Texture::create(ctx.gpu(), desc.clone(), None).unwrap();
        scene.light_probes[0].texture_probe = Some(capture.clone());
        // a destroyed cube in the cache cannot be attached for convolution
        let stale = Texture::create(ctx.gpu(), desc, None).unwrap();
        stale.destroy(ctx.gpu());
        ctx.render_targets
            .insert_temporary(ctx.backend.as_dyn_mut(), light_probe::TEMP_CUBE, stale);

        assert!(renderer.render_light_probe(&mut ctx, &mut scene, 0).is_err());
        assert!(ctx.dummy().unwrap().texture_descriptor(capture.handle).is_none());
        assert!(scene.light_probes[0].texture_probe.is_none());
        assert!(!scene.light_probes[0].captured);
        assert!(!renderer.is_capturing());
    }

    #[test]
    fn test_pick_object_draws_ids() {
        let (mut ctx, mut renderer, mut scene) = setup(32, 32, AntiAliasing::None);
        renderer.update_scene(&ctx, &mut scene, 0.0);
        ctx.dummy_mut().unwrap().take_commands();
        // the dummy backend does not rasterize, so nothing is under the cursor
        let picked = renderer.pick_object(&mut ctx, &mut scene, 16, 16).unwrap();
        assert_eq!(picked, None);
        let draws = draws(&ctx);
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].uniforms.get("object_id"), Some(&UniformData::Float(1.0)));
        assert!(renderer.pick_object(&mut ctx, &mut scene, 64, 0).unwrap().is_none());
    }
}
