//! Mesh draw submission
//!
//! Draws a sorted render list and rebinds program, material instance,
//! per-actor uniforms and vertex array only when they change between
//! consecutive entries.

use std::fmt;

use slotmap::SlotMap;

use crate::context::RenderContext;
use crate::error::{RenderError, RenderResult};
use crate::resources::{GeometryId, MaterialInstance, MaterialInstanceId, Texture};
use crate::scene::{Actor, ActorId, RenderGroup, RenderInfo};

/// What an actor pass writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// World normal and depth with a shared scene material
    PrePass,
    /// Deferred surface attributes with each actor's material
    GBuffer,
    /// Fully lit color with each actor's material
    Forward,
    /// Depth only with a shared scene material
    Shadow,
    ObjectId,
}

impl RenderMode {
    pub fn from_name(name: &str) -> RenderResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "prepass" | "pre_pass" => Ok(Self::PrePass),
            "gbuffer" => Ok(Self::GBuffer),
            "forward" | "shading" => Ok(Self::Forward),
            "shadow" => Ok(Self::Shadow),
            "object_id" => Ok(Self::ObjectId),
            _ => Err(RenderError::UnknownRenderMode(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::PrePass => "prepass",
            Self::GBuffer => "gbuffer",
            Self::Forward => "forward",
            Self::Shadow => "shadow",
            Self::ObjectId => "object_id",
        }
    }

    /// Textures copied from an actor's own instance to the scene material.
    fn forwarded_textures(&self) -> &'static [&'static str] {
        match self {
            Self::PrePass => &["texture_diffuse", "texture_normal"],
            Self::Shadow => &["texture_diffuse"],
            _ => &[],
        }
    }
}

impl fmt::Display for RenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lighting inputs bound to every instance in forward mode
#[derive(Clone, Copy)]
pub struct ForwardTextures<'a> {
    pub probe: &'a Texture,
    pub shadow: &'a Texture,
    pub ssao: &'a Texture,
    pub scene_reflect: &'a Texture,
    pub transmittance: &'a Texture,
    pub irradiance: &'a Texture,
}

impl ForwardTextures<'_> {
    fn bind(&self, gpu: &mut dyn crate::backend::GraphicsBackend, instance: &MaterialInstance) -> RenderResult<()> {
        instance.bind(gpu, "texture_probe", self.probe)?;
        instance.bind(gpu, "texture_shadow", self.shadow)?;
        instance.bind(gpu, "texture_ssao", self.ssao)?;
        instance.bind(gpu, "texture_scene_reflect", self.scene_reflect)?;
        instance.bind(gpu, "texture_transmittance", self.transmittance)?;
        instance.bind(gpu, "texture_irradiance", self.irradiance)
    }
}

/// Settings of one `render_actors` call
#[derive(Clone, Copy)]
pub struct ActorPass<'a> {
    pub group: RenderGroup,
    pub mode: RenderMode,
    /// Shared program for pre-pass, shadow and object-id passes
    pub scene_material: Option<MaterialInstanceId>,
    /// Used for entries without a material instance
    pub default_material: MaterialInstanceId,
    pub forward: Option<ForwardTextures<'a>>,
}

/// Draw `list` into the bound framebuffer with the current pipeline state.
pub fn render_actors(
    ctx: &mut RenderContext,
    actors: &SlotMap<ActorId, Actor>,
    pass: &ActorPass<'_>,
    list: &[RenderInfo],
) -> RenderResult<()> {
    if list.is_empty() {
        return Ok(());
    }
    let gpu = ctx.backend.as_dyn_mut();
    let materials = &ctx.materials;
    let scene_material = pass
        .scene_material
        .map(|id| materials.use_instance(gpu, id))
        .transpose()?;

    let mut last_program = scene_material.map(|m| m.program());
    let mut last_instance: Option<MaterialInstanceId> = None;
    let mut last_actor: Option<ActorId> = None;
    let mut last_geometry: Option<GeometryId> = None;
    let mut current = scene_material;

    for info in list {
        let Some(actor) = actors.get(info.actor) else {
            continue;
        };
        let Some(geometry) = ctx.geometries.get(info.geometry) else {
            log::warn!("{}: geometry was removed", actor.name);
            continue;
        };

        match scene_material {
            Some(scene) => {
                if last_instance != info.material_instance {
                    if let Some(own) = info.material_instance.and_then(|id| materials.get(id)) {
                        for name in pass.mode.forwarded_textures() {
                            if let Some(value) = own.get_uniform_data(name) {
                                scene.bind_uniform_data(gpu, name, value)?;
                            }
                        }
                    }
                    last_instance = info.material_instance;
                }
            }
            None => {
                let id = info.material_instance.unwrap_or(pass.default_material);
                if last_instance != Some(id) {
                    let instance = materials
                        .get(id)
                        .ok_or_else(|| RenderError::MissingResource(format!("material instance for {}", actor.name)))?;
                    if last_program != Some(instance.program()) {
                        gpu.use_program(instance.program());
                        last_program = Some(instance.program());
                        last_actor = None;
                    }
                    instance.bind_material_instance(gpu)?;
                    match pass.mode {
                        RenderMode::GBuffer => instance.bind(gpu, "is_render_gbuffer", true)?,
                        RenderMode::Forward => {
                            instance.bind(gpu, "is_render_gbuffer", false)?;
                            if let Some(forward) = &pass.forward {
                                forward.bind(gpu, instance)?;
                            }
                        }
                        _ => {}
                    }
                    last_instance = Some(id);
                    current = Some(instance);
                }
            }
        }

        let Some(material) = current else {
            continue;
        };
        if last_actor != Some(info.actor) {
            material.bind(gpu, "model", actor.transform.matrix())?;
            if pass.group == RenderGroup::Skeletal && !actor.bone_matrices().is_empty() {
                material.bind(gpu, "bone_matrices", actor.bone_matrices())?;
                material.bind(gpu, "prev_bone_matrices", actor.prev_bone_matrices())?;
            }
            if pass.mode == RenderMode::ObjectId {
                material.bind(gpu, "object_id", actor.object_id)?;
            }
            last_actor = Some(info.actor);
        }
        if last_geometry != Some(info.geometry) {
            geometry.vertex_buffer.bind_vertex_buffer(gpu);
            last_geometry = Some(info.geometry);
        }
        geometry.vertex_buffer.draw_elements(gpu)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::UniformData;
    use crate::error::ErrorKind;
    use crate::resources::{DEFAULT_MATERIAL_INSTANCE, FLAT_BLACK};
    use crate::scene::ActorPart;
    use glam::Vec3;

    struct Fixture {
        ctx: RenderContext,
        actors: SlotMap<ActorId, Actor>,
        default_material: MaterialInstanceId,
    }

    fn fixture() -> Fixture {
        let ctx = RenderContext::headless(32, 32).unwrap();
        let default_material = ctx.materials.id_of(DEFAULT_MATERIAL_INSTANCE).unwrap();
        Fixture {
            ctx,
            actors: SlotMap::with_key(),
            default_material,
        }
    }

    fn add(fixture: &mut Fixture, name: &str, x: f32, material: Option<MaterialInstanceId>) -> RenderInfo {
        let geometry = fixture.ctx.geometries.id_of("sphere").unwrap();
        let part = ActorPart {
            geometry,
            material_instance: material,
        };
        let actor = Actor::new(name, vec![part]).with_position(Vec3::new(x, 0.0, 0.0));
        RenderInfo {
            actor: fixture.actors.insert(actor),
            geometry,
            material_instance: material,
            program: None,
        }
    }

    fn pass(fixture: &Fixture, mode: RenderMode, scene_material: Option<MaterialInstanceId>) -> ActorPass<'static> {
        ActorPass {
            group: RenderGroup::Static,
            mode,
            scene_material,
            default_material: fixture.default_material,
            forward: None,
        }
    }

    #[test]
    fn test_mode_names() {
        for mode in [
            RenderMode::PrePass,
            RenderMode::GBuffer,
            RenderMode::Forward,
            RenderMode::Shadow,
            RenderMode::ObjectId,
        ] {
            assert_eq!(RenderMode::from_name(mode.name()).unwrap(), mode);
        }
        let err = RenderMode::from_name("wireframe").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_empty_list_draws_nothing() {
        let mut f = fixture();
        let pass = pass(&f, RenderMode::GBuffer, None);
        render_actors(&mut f.ctx, &f.actors, &pass, &[]).unwrap();
        assert_eq!(f.ctx.dummy().unwrap().draws().count(), 0);
    }

    #[test]
    fn test_missing_instance_uses_default_material() {
        let mut f = fixture();
        let a = add(&mut f, "a", -1.0, None);
        let b = add(&mut f, "b", 1.0, None);
        let pass = pass(&f, RenderMode::GBuffer, None);
        render_actors(&mut f.ctx, &f.actors, &pass, &[a, b]).unwrap();

        let draws: Vec<_> = f.ctx.dummy().unwrap().draws().cloned().collect();
        assert_eq!(draws.len(), 2);
        assert!(draws.iter().all(|d| d.program_name == "default"));
        assert_eq!(draws[0].uniforms.get("is_render_gbuffer"), Some(&UniformData::Bool(true)));
        assert_ne!(draws[0].uniforms.get("model"), draws[1].uniforms.get("model"));
    }

    #[test]
    fn test_shadow_pass_forwards_diffuse_texture() {
        let mut f = fixture();
        let gpu = f.ctx.backend.as_dyn_mut();
        let masked = f
            .ctx
            .materials
            .create_instance(gpu, &f.ctx.textures, "masked", "default", &Default::default())
            .unwrap();
        let shadow = f
            .ctx
            .materials
            .create_instance(gpu, &f.ctx.textures, "shadow", "shadowmap", &Default::default())
            .unwrap();
        f.ctx
            .materials
            .get_mut(masked)
            .unwrap()
            .set_texture("texture_diffuse", FLAT_BLACK, &f.ctx.textures)
            .unwrap();
        let info = add(&mut f, "a", 0.0, Some(masked));
        let plain = add(&mut f, "b", 1.0, None);

        let pass = pass(&f, RenderMode::Shadow, Some(shadow));
        render_actors(&mut f.ctx, &f.actors, &pass, &[info, plain]).unwrap();

        let black = f.ctx.textures.by_name(FLAT_BLACK).unwrap().handle;
        let draws: Vec<_> = f.ctx.dummy().unwrap().draws().cloned().collect();
        assert!(draws.iter().all(|d| d.program_name == "shadowmap"));
        assert_eq!(draws[0].textures.get("texture_diffuse"), Some(&black));
    }

    #[test]
    fn test_object_id_pass_binds_ids() {
        let mut f = fixture();
        let info = add(&mut f, "picked", 0.0, None);
        f.actors[info.actor].object_id = 7.0;
        let gpu = f.ctx.backend.as_dyn_mut();
        let object_id = f
            .ctx
            .materials
            .create_instance(gpu, &f.ctx.textures, "object_id", "object_id", &Default::default())
            .unwrap();
        let pass = pass(&f, RenderMode::ObjectId, Some(object_id));
        render_actors(&mut f.ctx, &f.actors, &pass, &[info]).unwrap();
        let draw = f.ctx.dummy().unwrap().draws().next().unwrap().clone();
        assert_eq!(draw.uniforms.get("object_id"), Some(&UniformData::Float(7.0)));
    }
}
