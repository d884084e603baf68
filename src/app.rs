//! Application loop
//!
//! [`App`] owns the context, the renderer and the scene. Each tick drains
//! the UI command queue, updates the scene and renders one frame. The
//! windowed loop runs on winit; the headless loop renders a fixed number of
//! frames. UI commands arrive as JSON lines on stdin and replies leave as
//! JSON lines on stdout, each on its own thread.

use std::io::{BufRead, Write};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use glam::Vec3;
use serde_json::{json, Value};
use winit::{
    dpi::{PhysicalPosition, PhysicalSize},
    event::{Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
    window::{Fullscreen, Window, WindowBuilder},
};

use crate::backend::dummy::DummyBackend;
use crate::command::*;
use crate::error::{log_recoverable, RenderError, RenderResult};
use crate::particles::{Effect, EffectInfo};
use crate::pipeline::{DebugView, ViewMode};
use crate::resources::{MaterialInstance, DEFAULT_MATERIAL_INSTANCE};
use crate::scene::{Actor, ActorPart, PointLight, Scene, Transform};
use crate::{AntiAliasing, RenderContext, Renderer, RendererConfig, RenderingType, WgpuBackend};

/// Frames closer together than this are skipped when vsync is on
pub const MIN_DELTA: f32 = 1.0 / 60.0;
/// Capacity of the command and reply queues
pub const QUEUE_CAPACITY: usize = 256;
/// Distance kept from an object focused by the camera
const FOCUS_DISTANCE: f32 = 5.0;

/// Averages over the last second of frames
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
    pub avg_fps: f32,
    pub avg_ms: f32,
    pub avg_render_ms: f32,
    pub avg_present_ms: f32,
    acc_time: f32,
    acc_render: f32,
    acc_present: f32,
    frames: u32,
}

impl FrameStats {
    fn record(&mut self, delta: f32, render: Duration, present: Duration) {
        self.acc_time += delta;
        self.acc_render += render.as_secs_f32() * 1000.0;
        self.acc_present += present.as_secs_f32() * 1000.0;
        self.frames += 1;
        if self.acc_time > 1.0 {
            let frames = self.frames as f32;
            self.avg_ms = self.acc_time / frames * 1000.0;
            self.avg_fps = 1000.0 / self.avg_ms;
            self.avg_render_ms = self.acc_render / frames;
            self.avg_present_ms = self.acc_present / frames;
            log::debug!(
                "{:.2} fps, {:.2} ms (render {:.2} ms, present {:.2} ms)",
                self.avg_fps,
                self.avg_ms,
                self.avg_render_ms,
                self.avg_present_ms
            );
            *self = FrameStats {
                avg_fps: self.avg_fps,
                avg_ms: self.avg_ms,
                avg_render_ms: self.avg_render_ms,
                avg_present_ms: self.avg_present_ms,
                ..Default::default()
            };
        }
    }
}

/// How the binary runs
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Render offscreen without a window
    pub headless: bool,
    /// Stop after this many frames
    pub frames: Option<u64>,
}

/// The scene loaded at startup: a unit sphere at the origin seen from
/// (0, 0, 5), lit by a main light from (1, 1, 1).
pub fn default_scene(ctx: &RenderContext, config: &RendererConfig) -> RenderResult<Scene> {
    let mut scene = Scene::new("default", config.gpu_particles);
    scene.set_max_point_lights(config.max_point_lights as usize);
    let geometry = ctx
        .geometries
        .id_of("sphere")
        .ok_or_else(|| RenderError::MissingResource("sphere geometry".into()))?;
    scene.add_actor(Actor::new(
        "sphere",
        vec![ActorPart {
            geometry,
            material_instance: ctx.materials.id_of(DEFAULT_MATERIAL_INSTANCE),
        }],
    ));
    scene.camera.transform.set_position(Vec3::new(0.0, 0.0, 5.0));
    scene.camera.transform.set_rotation(Vec3::ZERO);
    scene.main_light.set_light_direction(Vec3::ONE.normalize());
    scene.ocean.is_render_ocean = false;
    Ok(scene)
}

/// Renderer, scene and the UI command plumbing
pub struct App {
    pub ctx: RenderContext,
    pub renderer: Renderer,
    pub scene: Scene,
    config: RendererConfig,
    commands: CommandReceiver,
    replies: CommandSender,
    running: bool,
    play_mode: bool,
    last_frame: Instant,
    stats: FrameStats,
    /// Resolution change waiting for the window to follow
    requested_resolution: Option<(u32, u32, bool)>,
}

impl App {
    pub fn new(
        mut ctx: RenderContext,
        config: RendererConfig,
        commands: CommandReceiver,
        replies: CommandSender,
    ) -> RenderResult<Self> {
        let renderer = Renderer::new(&mut ctx, &config)?;
        let scene = default_scene(&ctx, &config)?;
        Ok(Self {
            ctx,
            renderer,
            scene,
            config,
            commands,
            replies,
            running: true,
            play_mode: false,
            last_frame: Instant::now(),
            stats: FrameStats::default(),
            requested_resolution: None,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_play_mode(&self) -> bool {
        self.play_mode
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    fn reply(&self, record: CommandRecord) {
        if let Err(error) = self.replies.try_send(record) {
            log::debug!("{}", error);
        }
    }

    fn reply_data(&self, command: Command, value: Value) {
        self.reply(CommandRecord::data(command, value));
    }

    /// Ask the UI to close, then stop the loop.
    pub fn close(&mut self) {
        if self.running {
            log::info!("Closing");
            self.reply(CommandRecord::bare(Command::CloseUi));
            self.running = false;
        }
    }

    /// Advance to `now`. Returns whether a frame was rendered.
    pub fn tick(&mut self, now: Instant) -> RenderResult<bool> {
        let delta = now.duration_since(self.last_frame).as_secs_f32();
        if (self.config.vsync && delta < MIN_DELTA) || delta == 0.0 {
            return Ok(false);
        }
        self.last_frame = now;
        self.step(delta)?;
        Ok(true)
    }

    /// Drain commands, update the scene by `delta` seconds and render.
    pub fn step(&mut self, delta: f32) -> RenderResult<()> {
        self.process_commands()?;
        if !self.running {
            return Ok(());
        }
        self.renderer.update_scene(&self.ctx, &mut self.scene, delta);
        let timings = self.renderer.render_frame(&mut self.ctx, &mut self.scene)?;
        self.stats.record(delta, timings.render_time, timings.present_time);
        Ok(())
    }

    /// Apply every queued command. Only fatal errors stop the loop.
    pub fn process_commands(&mut self) -> RenderResult<()> {
        let records: Vec<CommandRecord> = self.commands.drain().collect();
        for record in records {
            let command = record.command;
            log_recoverable(&format!("{:?}", command), self.handle_command(record))?;
        }
        Ok(())
    }

    /// Resize the renderer, rejecting an empty size.
    pub fn resize(&mut self, width: u32, height: u32) -> RenderResult<()> {
        log::info!("Resolution {}x{}", width, height);
        self.renderer.resize(&mut self.ctx, width, height)?;
        self.send_screen_info();
        self.send_render_target_list();
        Ok(())
    }

    /// Lists the UI needs right after it starts.
    pub fn send_initial_state(&self) {
        let anti_aliasing: Vec<&str> = AntiAliasing::ALL.iter().map(|aa| aa.name()).collect();
        self.reply_data(Command::TransAntialiasingList, json!(anti_aliasing));
        let rendering_types: Vec<&str> = RenderingType::ALL.iter().map(|t| t.name()).collect();
        self.reply_data(Command::TransRenderingTypeList, json!(rendering_types));
        self.reply_data(Command::TransGameBackendList, json!(["winit"]));
        self.reply_data(Command::TransGameBackendIndex, json!(0));
        self.send_screen_info();
        self.send_render_target_list();
        self.send_object_list();
        self.send_resource_list();
    }

    fn send_screen_info(&self) {
        let (width, height) = self.renderer.size();
        self.reply(CommandRecord::new(
            Command::TransScreenInfo,
            CommandPayload::Resolution {
                width,
                height,
                fullscreen: self.config.fullscreen,
            },
        ));
    }

    fn send_render_target_list(&self) {
        self.reply(CommandRecord::bare(Command::ClearRendertargetList));
        for (index, name) in self.ctx.render_targets.names().into_iter().enumerate() {
            self.reply_data(Command::TransRendertargetInfo, json!([index, name]));
        }
    }

    fn send_object_list(&self) {
        self.reply(CommandRecord::bare(Command::ClearObjectList));
        for (name, kind) in self.objects() {
            self.reply_data(Command::TransObjectInfo, json!([name, kind.name()]));
        }
    }

    fn send_resource_list(&self) {
        let mut resources: Vec<(String, &str)> = Vec::new();
        resources.extend(self.ctx.textures.names().into_iter().map(|n| (n.to_string(), "Texture")));
        resources.extend(self.ctx.geometries.names().into_iter().map(|n| (n.to_string(), "Mesh")));
        resources.extend(
            self.ctx
                .materials
                .instance_names()
                .into_iter()
                .map(|n| (n.to_string(), "MaterialInstance")),
        );
        self.reply_data(Command::TransResourceList, json!(resources));
    }

    /// Every addressable object with its kind, in list order.
    pub fn objects(&self) -> Vec<(String, ObjectKind)> {
        let scene = &self.scene;
        let mut objects = vec![
            (scene.camera.name.clone(), ObjectKind::Camera),
            (scene.main_light.name.clone(), ObjectKind::MainLight),
        ];
        objects.extend(scene.point_lights.iter().map(|l| (l.name.clone(), ObjectKind::PointLight)));
        objects.extend(scene.light_probes.iter().map(|p| (p.name.clone(), ObjectKind::LightProbe)));
        objects.extend(scene.actors.values().map(|a| (a.name.clone(), ObjectKind::Actor)));
        objects.push((scene.atmosphere.name.clone(), ObjectKind::Atmosphere));
        objects.push((scene.ocean.name.clone(), ObjectKind::Ocean));
        objects.extend(scene.effects.effects().map(|(_, e)| (e.name.clone(), ObjectKind::Effect)));
        objects.push(("RenderOption".to_string(), ObjectKind::RenderOption));
        objects
    }

    fn object_kind(&self, name: &str) -> Option<ObjectKind> {
        self.objects()
            .into_iter()
            .find(|(object, _)| object == name)
            .map(|(_, kind)| kind)
    }

    fn missing_object(name: &str) -> RenderError {
        RenderError::MissingResource(format!("object {}", name))
    }

    fn object_transform_mut(&mut self, name: &str) -> Option<&mut Transform> {
        let scene = &mut self.scene;
        if scene.camera.name == name {
            return Some(&mut scene.camera.transform);
        }
        if scene.main_light.name == name {
            return Some(&mut scene.main_light.transform);
        }
        if let Some(index) = scene.point_lights.iter().position(|l| l.name == name) {
            return Some(&mut scene.point_lights[index].transform);
        }
        if let Some(index) = scene.light_probes.iter().position(|p| p.name == name) {
            return Some(&mut scene.light_probes[index].transform);
        }
        if let Some(id) = scene.find_actor(name) {
            return scene.actors.get_mut(id).map(|a| &mut a.transform);
        }
        let id = scene.effects.find(name)?;
        scene.effects.get_mut(id).map(|e| &mut e.transform)
    }

    /// Current attribute values of one object.
    pub fn object_attributes(&self, name: &str) -> RenderResult<Vec<ObjectAttribute>> {
        use ObjectAttribute::*;
        let kind = self.object_kind(name).ok_or_else(|| Self::missing_object(name))?;
        let scene = &self.scene;
        let placement = |t: &Transform| vec![Position(t.position()), Rotation(t.rotation()), Scale(t.scale())];
        let attributes = match kind {
            ObjectKind::Camera => {
                let camera = &scene.camera;
                let t = &camera.transform;
                vec![Position(t.position()), Rotation(t.rotation()), Fov(camera.fov), Near(camera.near), Far(camera.far)]
            }
            ObjectKind::MainLight => {
                let light = &scene.main_light;
                let t = &light.transform;
                vec![
                    Position(t.position()),
                    Rotation(t.rotation()),
                    LightColor(light.light_color),
                    ShadowExp(light.shadow_exp),
                    ShadowBias(light.shadow_bias),
                    ShadowSamples(light.shadow_samples),
                ]
            }
            ObjectKind::PointLight => scene
                .point_lights
                .iter()
                .find(|l| l.name == name)
                .map(|l| {
                    vec![
                        Position(l.transform.position()),
                        LightColor(l.light_color.extend(1.0)),
                        LightRadius(l.light_radius),
                    ]
                })
                .unwrap_or_default(),
            ObjectKind::Actor => scene
                .find_actor(name)
                .and_then(|id| scene.actors.get(id))
                .map(|a| {
                    let mut list = placement(&a.transform);
                    list.extend([Visible(a.visible), CastShadow(a.cast_shadow)]);
                    list
                })
                .unwrap_or_default(),
            ObjectKind::LightProbe => scene
                .light_probes
                .iter()
                .find(|p| p.name == name)
                .map(|p| placement(&p.transform))
                .unwrap_or_default(),
            ObjectKind::Effect => scene
                .effects
                .find(name)
                .and_then(|id| scene.effects.get(id))
                .map(|e| placement(&e.transform))
                .unwrap_or_default(),
            ObjectKind::Atmosphere => vec![RenderAtmosphere(scene.atmosphere.is_render_atmosphere)],
            ObjectKind::Ocean => scene.ocean.attributes().into_iter().map(Ocean).collect(),
            ObjectKind::RenderOption => self.render_options().into_iter().map(RenderOption).collect(),
        };
        Ok(attributes)
    }

    fn render_options(&self) -> Vec<RenderOptionAttribute> {
        use RenderOptionAttribute::*;
        let options = &self.renderer.options;
        let settings = &self.renderer.postprocess.settings;
        vec![
            RenderShadow(options.is_render_shadow),
            RenderSkeletal(options.is_render_skeletal),
            RenderEffects(options.is_render_effects),
            RenderFont(options.is_render_font),
            RenderBloom(settings.is_render_bloom),
            RenderMotionBlur(settings.is_render_motion_blur),
            RenderSsao(settings.is_render_ssao),
            RenderSsr(settings.is_render_ssr),
            RenderTonemapping(settings.is_render_tonemapping),
            BloomIntensity(settings.bloom_intensity),
            MotionBlurScale(settings.motion_blur_scale),
            Exposure(settings.exposure),
            Contrast(settings.contrast),
            DebugTextureLod(settings.debug_texture_lod),
        ]
    }

    fn apply_render_option(&mut self, attribute: RenderOptionAttribute) {
        use RenderOptionAttribute::*;
        let options = &mut self.renderer.options;
        let settings = &mut self.renderer.postprocess.settings;
        match attribute {
            RenderShadow(v) => options.is_render_shadow = v,
            RenderSkeletal(v) => options.is_render_skeletal = v,
            RenderEffects(v) => options.is_render_effects = v,
            RenderFont(v) => options.is_render_font = v,
            RenderBloom(v) => settings.is_render_bloom = v,
            RenderMotionBlur(v) => settings.is_render_motion_blur = v,
            RenderSsao(v) => settings.is_render_ssao = v,
            RenderSsr(v) => settings.is_render_ssr = v,
            RenderTonemapping(v) => settings.is_render_tonemapping = v,
            BloomIntensity(v) => settings.bloom_intensity = v,
            MotionBlurScale(v) => settings.motion_blur_scale = v,
            Exposure(v) => settings.exposure = v,
            Contrast(v) => settings.contrast = v,
            DebugTextureLod(v) => settings.debug_texture_lod = v,
        }
    }

    /// Apply one typed attribute to the named object.
    pub fn set_object_attribute(&mut self, name: &str, attribute: ObjectAttribute) -> RenderResult<()> {
        use ObjectAttribute::*;
        let kind = self.object_kind(name).ok_or_else(|| Self::missing_object(name))?;
        if !attribute.applies_to(kind) {
            return Err(RenderError::InvalidAttribute {
                attribute: attribute.name().to_string(),
                message: format!("not an attribute of {}", kind.name()),
            });
        }
        if let Position(v) | Rotation(v) | Scale(v) = attribute {
            let transform = self
                .object_transform_mut(name)
                .ok_or_else(|| Self::missing_object(name))?;
            match attribute {
                Position(_) => transform.set_position(v),
                Rotation(_) => transform.set_rotation(v),
                _ => transform.set_scale(v),
            }
            if kind == ObjectKind::MainLight {
                self.scene.main_light.mark_changed();
            }
            return Ok(());
        }
        if let RenderOption(option) = attribute {
            self.apply_render_option(option);
            return Ok(());
        }
        let scene = &mut self.scene;
        match attribute {
            Visible(v) | CastShadow(v) => {
                let actor = scene
                    .find_actor(name)
                    .and_then(|id| scene.actors.get_mut(id))
                    .ok_or_else(|| Self::missing_object(name))?;
                if matches!(attribute, Visible(_)) {
                    actor.visible = v;
                } else {
                    actor.cast_shadow = v;
                }
            }
            Fov(v) => scene.camera.update_projection(v, -1.0),
            Near(v) => scene.camera.near = v,
            Far(v) => scene.camera.far = v,
            LightColor(v) => match kind {
                ObjectKind::MainLight => scene.main_light.light_color = v,
                _ => {
                    if let Some(light) = scene.point_lights.iter_mut().find(|l| l.name == name) {
                        light.light_color = v.truncate();
                    }
                }
            },
            LightRadius(v) => {
                if let Some(light) = scene.point_lights.iter_mut().find(|l| l.name == name) {
                    light.light_radius = v;
                }
            }
            ShadowExp(v) => scene.main_light.shadow_exp = v,
            ShadowBias(v) => scene.main_light.shadow_bias = v,
            ShadowSamples(v) => scene.main_light.shadow_samples = v,
            RenderAtmosphere(v) => scene.atmosphere.is_render_atmosphere = v,
            Ocean(attribute) => scene.ocean.set_attribute(attribute),
            Position(_) | Rotation(_) | Scale(_) | RenderOption(_) => {}
        }
        Ok(())
    }

    fn send_object_attributes(&self, name: &str) -> RenderResult<()> {
        let kind = self.object_kind(name).ok_or_else(|| Self::missing_object(name))?;
        let attributes: serde_json::Map<String, Value> = self
            .object_attributes(name)?
            .iter()
            .map(|a| (a.name().to_string(), a.value()))
            .collect();
        self.reply_data(
            Command::TransObjectAttribute,
            json!({"name": name, "type": kind.name(), "attributes": attributes}),
        );
        Ok(())
    }

    fn send_texture_attributes(&self, name: &str, texture: &crate::resources::Texture) {
        let (width, height) = texture.size();
        self.reply_data(
            Command::TransObjectAttribute,
            json!({
                "name": name,
                "type": "Texture",
                "attributes": {
                    "width": width,
                    "height": height,
                    "format": format!("{:?}", texture.desc.format),
                    "target": format!("{:?}", texture.target()),
                    "samples": texture.samples(),
                }
            }),
        );
    }

    fn send_material_attributes(&self, instance: &MaterialInstance) {
        let mut attributes = serde_json::Map::new();
        attributes.insert("shader".into(), json!(instance.shader_name()));
        for (name, value) in instance.macros() {
            attributes.insert(format!("macro.{}", name), json!(value));
        }
        for info in instance.components() {
            let literal = instance
                .get_uniform_data(&info.name)
                .map(|v| v.to_literal())
                .unwrap_or_default();
            attributes.insert(info.name.clone(), json!(literal));
        }
        self.reply_data(
            Command::TransResourceAttribute,
            json!({"name": instance.name(), "type": "MaterialInstance", "attributes": attributes}),
        );
    }

    fn set_resource_attribute(&mut self, key: &ObjectKey, attribute: ResourceAttribute) -> RenderResult<()> {
        if key.type_name != "MaterialInstance" {
            return Err(RenderError::InvalidAttribute {
                attribute: key.name.clone(),
                message: format!("{} resources have no editable attributes", key.type_name),
            });
        }
        let ctx = &mut self.ctx;
        let id = ctx
            .materials
            .id_of(&key.name)
            .ok_or_else(|| RenderError::MissingResource(format!("material instance {}", key.name)))?;
        match attribute {
            ResourceAttribute::Uniform { name, value } => {
                let instance = ctx
                    .materials
                    .get_mut(id)
                    .ok_or_else(|| RenderError::MissingResource(key.name.clone()))?;
                instance.set_uniform_data_from_string(&name, &value, &ctx.textures)
            }
            ResourceAttribute::Shader(shader) => {
                let macros = ctx
                    .materials
                    .get(id)
                    .map(|i| i.macros().clone())
                    .unwrap_or_default();
                let gpu = ctx.backend.as_dyn_mut();
                ctx.materials.set_material(gpu, &ctx.textures, id, &shader, &macros)
            }
            ResourceAttribute::Macro { name, value } => {
                let Some(instance) = ctx.materials.get(id) else {
                    return Err(RenderError::MissingResource(key.name.clone()));
                };
                let shader = instance.shader_name().to_string();
                let mut macros = instance.macros().clone();
                match value {
                    Some(value) => macros.insert(name, value),
                    None => macros.remove(&name),
                };
                let gpu = ctx.backend.as_dyn_mut();
                ctx.materials.set_material(gpu, &ctx.textures, id, &shader, &macros)
            }
        }
    }

    fn resource_path(&self, key: &ObjectKey) -> std::path::PathBuf {
        let (folder, extension) = match key.type_name.as_str() {
            "MaterialInstance" => ("MaterialInstances", "mat"),
            "Effect" => ("Effects", "effect"),
            _ => ("Textures", "png"),
        };
        self.config
            .project_path
            .join(folder)
            .join(format!("{}.{}", key.name, extension))
    }

    fn load_resource(&mut self, key: &ObjectKey) -> RenderResult<()> {
        let path = self.resource_path(key);
        let ctx = &mut self.ctx;
        match key.type_name.as_str() {
            "MaterialInstance" => {
                let gpu = ctx.backend.as_dyn_mut();
                let instance = MaterialInstance::load(&path, gpu, &mut ctx.materials, &ctx.textures)?;
                ctx.materials.insert(instance);
            }
            "Texture" => {
                ctx.textures.load_file(ctx.backend.as_dyn_mut(), &path)?;
            }
            "Effect" => {
                let info = EffectInfo::load(&path)?;
                let id = self.scene.effects.add_effect(Effect::new(&key.name, info, Transform::new()));
                self.scene.effects.play_effect(id);
                self.send_object_list();
            }
            other => {
                return Err(RenderError::MissingResource(format!("loader for {} resources", other)));
            }
        }
        self.reply_data(Command::TransResourceInfo, json!([key.name, key.type_name]));
        Ok(())
    }

    /// Place a new object a few units in front of the camera.
    fn spawn_position(&self) -> Vec3 {
        let camera = &self.scene.camera;
        camera.position() + camera.transform.forward() * FOCUS_DISTANCE
    }

    fn unique_name(&self, base: &str) -> String {
        let objects = self.objects();
        (0..)
            .map(|i| format!("{}_{}", base, i))
            .find(|name| objects.iter().all(|(object, _)| object != name))
            .unwrap_or_else(|| base.to_string())
    }

    fn focus_object(&mut self, name: &str) -> RenderResult<()> {
        let target = self
            .object_transform_mut(name)
            .map(|t| t.position())
            .ok_or_else(|| Self::missing_object(name))?;
        let camera = &mut self.scene.camera;
        let forward = camera.transform.forward();
        camera.transform.set_position(target - forward * FOCUS_DISTANCE);
        Ok(())
    }

    fn delete_object(&mut self, name: &str) -> RenderResult<()> {
        let scene = &mut self.scene;
        let removed = if let Some(id) = scene.find_actor(name) {
            scene.remove_actor(id).is_some()
        } else if let Some(id) = scene.effects.find(name) {
            scene.effects.destroy_effect(id);
            true
        } else if let Some(index) = scene.point_lights.iter().position(|l| l.name == name) {
            scene.point_lights.remove(index);
            true
        } else if let Some(index) = scene.light_probes.iter().position(|p| p.name == name) {
            let probe = scene.light_probes.remove(index);
            if let Some(texture) = probe.texture_probe {
                texture.destroy(self.ctx.gpu());
            }
            true
        } else {
            false
        };
        if !removed {
            return Err(Self::missing_object(name));
        }
        if self.scene.selected.as_deref() == Some(name) {
            self.scene.selected = None;
        }
        self.reply_data(Command::DeleteObjectInfo, json!(name));
        Ok(())
    }

    /// Execute one command. Errors are classified by the caller.
    pub fn handle_command(&mut self, record: CommandRecord) -> RenderResult<()> {
        use Command::*;
        let CommandRecord { command, payload } = record;
        log::debug!("Command {:?}", command);
        match (command, payload) {
            (UiRun, _) => {
                self.reply(CommandRecord::bare(UiRunOk));
                self.send_initial_state();
            }
            (CloseApp, _) => self.close(),
            (NewScene, _) => {
                self.scene.destroy(&mut self.ctx);
                self.scene = Scene::new("new_scene", self.config.gpu_particles);
                self.scene.set_max_point_lights(self.config.max_point_lights as usize);
                self.send_object_list();
            }
            (Play, _) => {
                self.play_mode = true;
                let ids: Vec<_> = self.scene.effects.effects().map(|(id, _)| id).collect();
                for id in ids {
                    self.scene.effects.play_effect(id);
                }
            }
            (Stop, _) => self.play_mode = false,
            (ViewmodeWireframe, _) => self.renderer.set_view_mode(ViewMode::Wireframe),
            (ViewmodeShading, _) => self.renderer.set_view_mode(ViewMode::Shading),
            (
                ChangeResolution,
                CommandPayload::Resolution {
                    width,
                    height,
                    fullscreen,
                },
            ) => {
                self.resize(width, height)?;
                self.config.fullscreen = fullscreen;
                self.requested_resolution = Some((width, height, fullscreen));
            }

            (LoadResource, CommandPayload::Object(key)) => self.load_resource(&key)?,
            (ActionResource, CommandPayload::Object(key)) => match key.type_name.as_str() {
                "MaterialInstance" => {
                    return self.handle_command(CommandRecord::new(ViewMaterialInstance, CommandPayload::Name(key.name)))
                }
                "Texture" => return self.handle_command(CommandRecord::new(ViewTexture, CommandPayload::Name(key.name))),
                "Mesh" => {
                    let geometry = self
                        .ctx
                        .geometries
                        .id_of(&key.name)
                        .ok_or_else(|| RenderError::MissingResource(format!("mesh {}", key.name)))?;
                    let name = self.unique_name(&key.name);
                    let position = self.spawn_position();
                    let part = ActorPart {
                        geometry,
                        material_instance: None,
                    };
                    self.scene.add_actor(Actor::new(&name, vec![part]).with_position(position));
                    self.reply_data(TransObjectInfo, json!([name, ObjectKind::Actor.name()]));
                }
                other => log::warn!("No action for {} resources", other),
            },
            (DuplicateResource, CommandPayload::Object(key)) => {
                let copy = self
                    .ctx
                    .materials
                    .by_name(&key.name)
                    .map(|i| i.duplicate(&format!("{}_copy", key.name)))
                    .ok_or_else(|| RenderError::MissingResource(format!("material instance {}", key.name)))?;
                let name = copy.name().to_string();
                self.ctx.materials.insert(copy);
                self.reply_data(TransResourceInfo, json!([name, "MaterialInstance"]));
            }
            (SaveResource, CommandPayload::Object(key)) => {
                let path = self.resource_path(&key);
                match key.type_name.as_str() {
                    "MaterialInstance" => self
                        .ctx
                        .materials
                        .by_name(&key.name)
                        .ok_or_else(|| RenderError::MissingResource(key.name.clone()))?
                        .save(&path)?,
                    "Effect" => {
                        let effect = self
                            .scene
                            .effects
                            .find(&key.name)
                            .and_then(|id| self.scene.effects.get(id))
                            .ok_or_else(|| RenderError::MissingResource(key.name.clone()))?;
                        effect.info.save(&path)?;
                    }
                    other => log::warn!("{} resources are read-only", other),
                }
            }
            (DeleteResource, CommandPayload::Object(key)) => {
                let removed = match key.type_name.as_str() {
                    "MaterialInstance" => self.ctx.materials.remove(&key.name),
                    "Texture" => self.ctx.textures.remove(self.ctx.backend.as_dyn_mut(), &key.name),
                    "Mesh" => self.ctx.geometries.remove(self.ctx.backend.as_dyn_mut(), &key.name),
                    _ => false,
                };
                if !removed {
                    return Err(RenderError::MissingResource(format!("{} {}", key.type_name, key.name)));
                }
                self.reply_data(DeleteResourceInfo, json!([key.name, key.type_name]));
            }
            (RequestResourceList, _) => self.send_resource_list(),
            (RequestResourceAttribute, CommandPayload::Object(key)) => match key.type_name.as_str() {
                "MaterialInstance" => {
                    let instance = self
                        .ctx
                        .materials
                        .by_name(&key.name)
                        .ok_or_else(|| RenderError::MissingResource(key.name.clone()))?;
                    self.send_material_attributes(instance);
                }
                "Texture" => {
                    let texture = self
                        .ctx
                        .textures
                        .by_name(&key.name)
                        .ok_or_else(|| RenderError::MissingResource(key.name.clone()))?;
                    self.send_texture_attributes(&key.name, texture);
                }
                other => log::debug!("No attributes for {} resources", other),
            },
            (SetResourceAttribute, CommandPayload::SetAttribute(edit)) => {
                let attribute = ResourceAttribute::parse(&edit.attribute, &edit.value)?;
                self.set_resource_attribute(&edit.target, attribute)?;
            }

            (AddLight, _) => {
                let name = self.unique_name("point_light");
                let position = self.spawn_position();
                self.scene.add_point_light(PointLight::new(&name, position));
                self.reply_data(TransObjectInfo, json!([name, ObjectKind::PointLight.name()]));
            }
            (CreateParticle, _) => {
                let name = self.unique_name("effect");
                let transform = Transform::from_position(self.spawn_position());
                let info = EffectInfo {
                    name: name.clone(),
                    ..Default::default()
                };
                let id = self.scene.effects.add_effect(Effect::new(&name, info, transform));
                self.scene.effects.play_effect(id);
                self.reply_data(TransObjectInfo, json!([name, ObjectKind::Effect.name()]));
            }
            (RequestObjectList, _) => self.send_object_list(),
            (ActionObject, CommandPayload::Name(name)) => {
                if let Some(id) = self.scene.effects.find(&name) {
                    self.scene.effects.play_effect(id);
                } else {
                    self.focus_object(&name)?;
                }
            }
            (DeleteObject, CommandPayload::Name(name)) => self.delete_object(&name)?,
            (RequestObjectAttribute, CommandPayload::Object(key)) => self.send_object_attributes(&key.name)?,
            (SetObjectAttribute, CommandPayload::SetAttribute(edit)) => {
                let name = edit.target.name.as_str();
                let kind = self
                    .object_kind(name)
                    .or_else(|| ObjectKind::from_name(&edit.target.type_name))
                    .ok_or_else(|| Self::missing_object(name))?;
                let is_transform = matches!(edit.attribute.as_str(), "position" | "rotation" | "scale");
                if kind == ObjectKind::Effect && !is_transform {
                    let id = self.scene.effects.find(name).ok_or_else(|| Self::missing_object(name))?;
                    let index = usize::try_from(edit.index).ok().filter(|_| !edit.parent_info.is_null());
                    if let Some(effect) = self.scene.effects.get_mut(id) {
                        effect
                            .info
                            .set_attribute(&edit.attribute, &value_text(&edit.value), index)?;
                    }
                } else {
                    let attribute = ObjectAttribute::parse(kind, &edit.attribute, &edit.value)?;
                    self.set_object_attribute(name, attribute)?;
                }
            }
            (SetObjectSelect, CommandPayload::Name(name)) => {
                self.scene.selected = Some(name.clone());
                self.send_object_attributes(&name)?;
            }
            (SetObjectFocus, CommandPayload::Name(name)) => self.focus_object(&name)?,

            (ClearRendertargetList, _) => self.send_render_target_list(),
            (ViewRendertarget, CommandPayload::RenderTarget { index, name }) => {
                let texture = self.ctx.render_targets.find(&name).cloned();
                match texture {
                    Some(texture) => {
                        log::info!("Viewing render target {} ({})", name, index);
                        self.send_texture_attributes(&name, &texture);
                        self.renderer.set_debug_view(Some(DebugView::RenderTarget(name)));
                    }
                    None => self.renderer.set_debug_view(None),
                }
            }
            (RecreateRenderTargets, _) => {
                self.renderer.recreate_render_targets(&mut self.ctx)?;
                for probe in &mut self.scene.light_probes {
                    probe.invalidate();
                }
                self.send_render_target_list();
            }
            (ViewTexture, CommandPayload::Name(name)) => {
                let texture = self.ctx.textures.by_name(&name).cloned();
                match texture {
                    Some(texture) => {
                        self.send_texture_attributes(&name, &texture);
                        self.renderer.set_debug_view(Some(DebugView::Texture(name)));
                    }
                    None => self.renderer.set_debug_view(None),
                }
            }
            (ViewMaterialInstance, CommandPayload::Name(name)) => {
                let id = self.ctx.materials.id_of(&name);
                self.renderer.set_shader_debug(id);
                if let Some(instance) = id.and_then(|id| self.ctx.materials.get(id)) {
                    self.send_material_attributes(instance);
                }
            }
            (SetAntialiasing, CommandPayload::Index(index)) => {
                let anti_aliasing = AntiAliasing::from_index(index)
                    .ok_or_else(|| RenderError::Command(format!("anti-aliasing index {}", index)))?;
                self.renderer.set_anti_aliasing(&mut self.ctx, anti_aliasing)?;
                self.send_render_target_list();
            }
            (SetRenderingType, CommandPayload::Index(index)) => {
                let rendering_type = RenderingType::from_index(index)
                    .ok_or_else(|| RenderError::Command(format!("rendering type index {}", index)))?;
                self.renderer.set_rendering_type(rendering_type);
            }

            (
                UiRunOk | ShowUi | HideUi | Fail | CloseUi | Reload | RequestPipe | PipeDone | SortUiItems,
                _,
            ) => log::debug!("Ignoring UI notification {:?}", command),
            (
                NewProject | OpenProject | SaveProject | SaveScene | AddCamera | CreateCollision | CreateSpline
                | AddResourceComponent | DeleteResourceComponent | AddObjectComponent | DeleteObjectComponent
                | ChangeGameBackend,
                _,
            ) => log::warn!("{:?} is not supported by this host", command),
            (command, payload) if matches!(payload, CommandPayload::Data(_)) => {
                log::debug!("Ignoring reply {:?} sent to the renderer", command)
            }
            (command, payload) => {
                return Err(RenderError::Command(format!("{:?} with payload {:?}", command, payload)));
            }
        }
        Ok(())
    }

    /// Resolution change requested by a command since the last call.
    pub fn take_requested_resolution(&mut self) -> Option<(u32, u32, bool)> {
        self.requested_resolution.take()
    }

    /// Release GPU resources.
    pub fn destroy(&mut self) {
        self.scene.destroy(&mut self.ctx);
        self.ctx.destroy();
    }
}

/// Read JSON command lines from stdin until EOF or until the queue closes.
pub fn spawn_stdin_reader(sender: CommandSender) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("command-reader".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(error) => {
                        log::warn!("Failed to read command: {}", error);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match CommandRecord::parse(&line) {
                    Ok(record) => {
                        if sender.send(record).is_err() {
                            break;
                        }
                    }
                    Err(error) => log::warn!("Ignoring command '{}': {}", line, error),
                }
            }
            log::debug!("Command reader finished");
        })
}

/// Write replies to stdout, one JSON line each, until the queue closes.
pub fn spawn_reply_writer(receiver: CommandReceiver) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("reply-writer".into())
        .spawn(move || {
            let stdout = std::io::stdout();
            while let Some(record) = receiver.recv() {
                let line = match record.to_line() {
                    Ok(line) => line,
                    Err(error) => {
                        log::warn!("Failed to encode reply {:?}: {}", record.command, error);
                        continue;
                    }
                };
                let mut out = stdout.lock();
                if writeln!(out, "{}", line).and_then(|_| out.flush()).is_err() {
                    break;
                }
            }
        })
}

fn create_window(event_loop: &EventLoop<()>, config: &RendererConfig) -> RenderResult<Arc<Window>> {
    let window = WindowBuilder::new()
        .with_title(&config.title)
        .with_inner_size(PhysicalSize::new(config.width, config.height))
        .build(event_loop)
        .map_err(|e| RenderError::Window(e.to_string()))?;
    if config.fullscreen {
        window.set_fullscreen(Some(Fullscreen::Borderless(None)));
    } else if std::env::var("SDL_VIDEO_CENTERED").is_ok_and(|v| v == "1") {
        if let Some(monitor) = window.current_monitor() {
            let screen = monitor.size();
            let size = window.outer_size();
            let x = (screen.width.saturating_sub(size.width) / 2) as i32;
            let y = (screen.height.saturating_sub(size.height) / 2) as i32;
            window.set_outer_position(PhysicalPosition::new(x, y));
        }
    }
    Ok(Arc::new(window))
}

fn run_headless(mut app: App, frames: Option<u64>) -> RenderResult<()> {
    let frames = frames.unwrap_or(1);
    log::info!("Rendering {} headless frames", frames);
    for _ in 0..frames {
        if !app.is_running() {
            break;
        }
        app.step(MIN_DELTA)?;
    }
    app.destroy();
    Ok(())
}

fn run_windowed(config: RendererConfig, frames: Option<u64>, commands: CommandReceiver, replies: CommandSender) -> RenderResult<()> {
    let event_loop = EventLoop::new().map_err(|e| RenderError::Window(e.to_string()))?;
    let window = create_window(&event_loop, &config)?;
    let backend = WgpuBackend::new(Arc::clone(&window), config.vsync)?;
    let ctx = RenderContext::new(backend)?;
    let mut app = App::new(ctx, config, commands, replies)?;
    let mut failure: Option<RenderError> = None;

    event_loop
        .run(|event, elwt: &EventLoopWindowTarget<()>| {
            elwt.set_control_flow(ControlFlow::Poll);
            let result = match event {
                Event::WindowEvent { event, .. } => match event {
                    WindowEvent::CloseRequested => {
                        app.close();
                        Ok(())
                    }
                    WindowEvent::Resized(size) if size.width > 0 && size.height > 0 => {
                        app.resize(size.width, size.height)
                    }
                    WindowEvent::CursorMoved { position, .. } => {
                        app.renderer.set_mouse_pos(position.x as f32, position.y as f32);
                        Ok(())
                    }
                    _ => Ok(()),
                },
                Event::AboutToWait => {
                    let result = app.tick(Instant::now());
                    if let Some((width, height, fullscreen)) = app.take_requested_resolution() {
                        let _ = window.request_inner_size(PhysicalSize::new(width, height));
                        window.set_fullscreen(fullscreen.then_some(Fullscreen::Borderless(None)));
                    }
                    if frames.is_some_and(|n| app.renderer.frame_count() >= n) {
                        app.close();
                    }
                    window.request_redraw();
                    result.map(|_| ())
                }
                _ => Ok(()),
            };
            if let Err(error) = log_recoverable("frame", result) {
                failure = Some(error);
                app.close();
            }
            if !app.is_running() {
                elwt.exit();
            }
        })
        .map_err(|e| RenderError::Window(e.to_string()))?;

    app.destroy();
    failure.map_or(Ok(()), Err)
}

/// Run until the window closes, `CLOSE_APP` arrives or the frame budget is
/// spent. Fatal errors are logged, `CLOSE_UI` is sent and the error is
/// returned for a non-zero exit.
pub fn run(config: RendererConfig, options: RunOptions) -> RenderResult<()> {
    let (command_sender, command_receiver) = command_queue(QUEUE_CAPACITY);
    let (reply_sender, reply_receiver) = command_queue(QUEUE_CAPACITY);
    spawn_stdin_reader(command_sender)?;
    let writer = spawn_reply_writer(reply_receiver)?;

    let result = if options.headless {
        let ctx = match WgpuBackend::new_headless(config.width, config.height) {
            Ok(backend) => RenderContext::new(backend)?,
            Err(error) => {
                log::warn!("No GPU adapter ({}), rendering with the dummy backend", error);
                RenderContext::new(DummyBackend::new(config.width, config.height))?
            }
        };
        let app = App::new(ctx, config, command_receiver, reply_sender)?;
        run_headless(app, options.frames)
    } else {
        run_windowed(config, options.frames, command_receiver, reply_sender)
    };

    if let Err(error) = &result {
        log::error!("{}", error);
    }
    // the reply sender is gone with the app, so the writer drains and stops
    let _ = writer.join();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        app: App,
        commands: CommandSender,
        replies: CommandReceiver,
    }

    fn harness() -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = RendererConfig {
            width: 64,
            height: 32,
            vsync: true,
            ..Default::default()
        };
        let ctx = RenderContext::headless(config.width, config.height).unwrap();
        let (commands, command_receiver) = command_queue(16);
        let (reply_sender, replies) = command_queue(QUEUE_CAPACITY);
        let app = App::new(ctx, config, command_receiver, reply_sender).unwrap();
        Harness { app, commands, replies }
    }

    fn send(h: &mut Harness, line: &str) {
        h.commands.send(CommandRecord::parse(line).unwrap()).unwrap();
        h.app.process_commands().unwrap();
    }

    fn replies(h: &Harness) -> Vec<CommandRecord> {
        h.replies.drain().collect()
    }

    #[test]
    fn test_ui_run_is_answered() {
        let mut h = harness();
        send(&mut h, r#"{"command":"UI_RUN"}"#);
        let replies = replies(&h);
        assert_eq!(replies[0].command, Command::UiRunOk);
        assert!(replies.iter().any(|r| r.command == Command::TransAntialiasingList));
        assert!(replies.iter().any(|r| r.command == Command::TransRendertargetInfo));
    }

    #[test]
    fn test_close_app_stops_and_closes_ui() {
        let mut h = harness();
        send(&mut h, r#"{"command":"CLOSE_APP"}"#);
        assert!(!h.app.is_running());
        assert_eq!(replies(&h).last().unwrap().command, Command::CloseUi);
        let frames = h.app.renderer.frame_count();
        h.app.step(MIN_DELTA).unwrap();
        assert_eq!(h.app.renderer.frame_count(), frames);
    }

    #[test]
    fn test_vsync_skips_short_frames() {
        let mut h = harness();
        let start = h.app.last_frame;
        assert!(!h.app.tick(start + Duration::from_millis(5)).unwrap());
        assert!(h.app.tick(start + Duration::from_millis(20)).unwrap());
        assert_eq!(h.app.renderer.frame_count(), 1);
    }

    #[test]
    fn test_bad_commands_do_not_stop_the_loop() {
        let mut h = harness();
        send(&mut h, r#"{"command":"SET_ANTIALIASING","value":9}"#);
        send(&mut h, r#"{"command":"DELETE_OBJECT","value":"nothing"}"#);
        send(&mut h, r#"{"command":"SET_OBJECT_ATTRIBUTE","value":["main_camera","Camera","fov","wide",null,0]}"#);
        assert!(h.app.is_running());
        h.app.step(MIN_DELTA).unwrap();
    }

    #[test]
    fn test_resolution_and_anti_aliasing_commands() {
        let mut h = harness();
        send(&mut h, r#"{"command":"CHANGE_RESOLUTION","value":[48,24,false]}"#);
        assert_eq!(h.app.renderer.size(), (48, 24));
        assert_eq!(h.app.take_requested_resolution(), Some((48, 24, false)));
        send(&mut h, r#"{"command":"SET_ANTIALIASING","value":2}"#);
        let hdr = h.app.ctx.render_targets.get(crate::resources::RenderTargetSlot::Hdr).unwrap();
        assert_eq!(hdr.samples(), crate::resources::MSAA_SAMPLES);
        send(&mut h, r#"{"command":"SET_RENDERING_TYPE","value":1}"#);
        assert_eq!(h.app.renderer.options.rendering_type, RenderingType::Forward);
        h.app.step(MIN_DELTA).unwrap();
    }

    #[test]
    fn test_object_attributes_round_trip() {
        let mut h = harness();
        send(&mut h, r#"{"command":"SET_OBJECT_ATTRIBUTE","value":["sphere","StaticActor","position","[1, 2, 3]",null,0]}"#);
        let id = h.app.scene.find_actor("sphere").unwrap();
        assert_eq!(h.app.scene.actors[id].transform.position(), Vec3::new(1.0, 2.0, 3.0));

        send(&mut h, r#"{"command":"SET_OBJECT_ATTRIBUTE","value":["RenderOption","RenderOption","is_render_ssao",false,null,0]}"#);
        assert!(!h.app.renderer.postprocess.settings.is_render_ssao);

        replies(&h);
        send(&mut h, r#"{"command":"REQUEST_OBJECT_ATTRIBUTE","value":["sphere","Actor"]}"#);
        let reply = replies(&h).pop().unwrap();
        assert_eq!(reply.command, Command::TransObjectAttribute);
        let CommandPayload::Data(value) = reply.payload else {
            panic!("expected data");
        };
        assert_eq!(value["attributes"]["position"], json!([1.0, 2.0, 3.0]));
    }

    #[test]
    fn test_add_light_and_delete_object() {
        let mut h = harness();
        send(&mut h, r#"{"command":"ADD_LIGHT"}"#);
        assert_eq!(h.app.scene.point_lights.len(), 1);
        let name = h.app.scene.point_lights[0].name.clone();
        send(&mut h, &format!(r#"{{"command":"DELETE_OBJECT","value":"{}"}}"#, name));
        assert!(h.app.scene.point_lights.is_empty());
        assert!(replies(&h).iter().any(|r| r.command == Command::DeleteObjectInfo));
    }

    #[test]
    fn test_view_commands_select_debug_output() {
        let mut h = harness();
        send(&mut h, r#"{"command":"VIEW_RENDERTARGET","value":[0,"WORLD_NORMAL"]}"#);
        assert_eq!(
            h.app.renderer.options.debug_view,
            Some(DebugView::RenderTarget("WORLD_NORMAL".into()))
        );
        send(&mut h, r#"{"command":"VIEW_RENDERTARGET","value":[0,"MISSING"]}"#);
        assert_eq!(h.app.renderer.options.debug_view, None);
        send(&mut h, r#"{"command":"VIEW_MATERIAL_INSTANCE","value":"default"}"#);
        assert!(h.app.renderer.options.shader_debug.is_some());
        h.app.step(MIN_DELTA).unwrap();
        send(&mut h, r#"{"command":"VIEW_MATERIAL_INSTANCE","value":""}"#);
        assert!(h.app.renderer.options.shader_debug.is_none());
    }

    #[test]
    fn test_material_attribute_edit() {
        let mut h = harness();
        send(
            &mut h,
            r#"{"command":"SET_RESOURCE_ATTRIBUTE","value":["default","MaterialInstance","roughness","0.25",null,0]}"#,
        );
        let instance = h.app.ctx.materials.by_name("default").unwrap();
        assert_eq!(
            instance.get_uniform_data("roughness"),
            Some(&crate::resources::UniformValue::Float(0.25))
        );
    }
}
