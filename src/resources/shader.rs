//! Built-in shader programs
//!
//! Each entry names its WGSL sources under `shaders/` and declares the
//! uniform interface the program exposes. The interface doubles as the
//! material metadata: a [`MaterialInstance`](super::MaterialInstance) stores
//! values only for the names declared here.

use std::collections::{BTreeMap, HashMap};

use crate::backend::*;
use crate::error::{RenderError, RenderResult};
use crate::particles::gpu::{PARTICLE_WGSL_TYPE, WORKGROUP_SIZE};
use crate::pipeline::postprocess::SSAO_KERNEL_SIZE;

/// Bone palette size of skinned programs
pub const MAX_BONES: u32 = 64;

/// Storage binding of the GPU particle records
pub const PARTICLE_BUFFER_BINDING: u32 = 0;
/// Storage binding of the live-particle counter
pub const PARTICLE_COUNTER_BINDING: u32 = 1;

const MESH_VS: &str = include_str!("../../shaders/mesh.wgsl");
const SKINNED_VS: &str = include_str!("../../shaders/mesh_skinned.wgsl");

/// Sources that shade with the sun, probes and the atmosphere LUTs
macro_rules! lit_source {
    ($file:literal) => {
        concat!(
            include_str!("../../shaders/atmosphere_common.wgsl"),
            include_str!("../../shaders/lighting.wgsl"),
            include_str!($file)
        )
    };
}

macro_rules! particle_source {
    ($file:literal) => {
        concat!(
            include_str!("../../shaders/particle_common.wgsl"),
            include_str!($file)
        )
    };
}

/// Stage sources of a program
#[derive(Debug, Clone)]
pub enum ShaderStages {
    Graphics {
        vertex: &'static str,
        fragment: &'static str,
        color_outputs: u32,
    },
    Compute {
        source: &'static str,
        workgroup_size: u32,
    },
}

/// A registered program before compilation
#[derive(Debug, Clone)]
pub struct ShaderTemplate {
    pub name: String,
    pub stages: ShaderStages,
    pub uniforms: Vec<UniformDecl>,
    pub storage: Vec<StorageDecl>,
    /// Defines applied before the instance's own macros
    pub defines: BTreeMap<String, String>,
}

impl ShaderTemplate {
    pub fn graphics(name: &str, vertex: &'static str, fragment: &'static str, color_outputs: u32) -> Self {
        Self {
            name: name.to_string(),
            stages: ShaderStages::Graphics {
                vertex,
                fragment,
                color_outputs,
            },
            uniforms: Vec::new(),
            storage: Vec::new(),
            defines: BTreeMap::new(),
        }
    }

    /// Fullscreen program whose single source holds both entry points.
    pub fn fullscreen(name: &str, source: &'static str, color_outputs: u32) -> Self {
        Self::graphics(name, source, source, color_outputs)
    }

    pub fn compute(name: &str, source: &'static str, workgroup_size: u32) -> Self {
        Self {
            name: name.to_string(),
            stages: ShaderStages::Compute {
                source,
                workgroup_size,
            },
            uniforms: Vec::new(),
            storage: Vec::new(),
            defines: BTreeMap::new(),
        }
    }

    pub fn uniform(mut self, name: &str, kind: UniformKind) -> Self {
        self.uniforms.push(UniformDecl::new(name, kind));
        self
    }

    pub fn uniform_array(mut self, name: &str, kind: UniformKind, count: u32) -> Self {
        self.uniforms.push(UniformDecl::array(name, kind, count));
        self
    }

    pub fn storage(mut self, decl: StorageDecl) -> Self {
        self.storage.push(decl);
        self
    }

    pub fn define(mut self, name: &str, value: &str) -> Self {
        self.defines.insert(name.to_string(), value.to_string());
        self
    }

    /// Program descriptor with `macros` layered over the template defines.
    pub fn descriptor(&self, macros: &BTreeMap<String, String>) -> ProgramDescriptor {
        let mut desc = match &self.stages {
            ShaderStages::Graphics {
                vertex,
                fragment,
                color_outputs,
            } => ProgramDescriptor::graphics(&self.name, vertex, fragment, *color_outputs),
            ShaderStages::Compute {
                source,
                workgroup_size,
            } => ProgramDescriptor::compute(&self.name, source, *workgroup_size),
        };
        desc.uniforms = self.uniforms.clone();
        desc.storage = self.storage.clone();
        let mut defines = self.defines.clone();
        defines.extend(macros.iter().map(|(k, v)| (k.clone(), v.clone())));
        desc.defines = defines.into_iter().collect();
        desc
    }
}

/// Registry of program templates by name
#[derive(Debug, Default)]
pub struct ShaderLibrary {
    templates: HashMap<String, ShaderTemplate>,
}

fn surface_uniforms(template: ShaderTemplate) -> ShaderTemplate {
    template
        .uniform("model", UniformKind::Mat4)
        .uniform("is_render_gbuffer", UniformKind::Bool)
        .uniform("albedo", UniformKind::Vec4)
        .uniform("emissive", UniformKind::Vec3)
        .uniform("roughness", UniformKind::Float)
        .uniform("metallic", UniformKind::Float)
        .uniform("texture_diffuse", UniformKind::Sampler2D)
        .uniform("texture_normal", UniformKind::Sampler2D)
        .uniform("texture_probe", UniformKind::SamplerCube)
        .uniform("texture_shadow", UniformKind::Sampler2DUnfilterable)
        .uniform("texture_ssao", UniformKind::Sampler2D)
        .uniform("texture_scene_reflect", UniformKind::Sampler2D)
        .uniform("texture_transmittance", UniformKind::Sampler2D)
        .uniform("texture_irradiance", UniformKind::Sampler2D)
}

fn skinned(template: ShaderTemplate) -> ShaderTemplate {
    template
        .define("MAX_BONES", &MAX_BONES.to_string())
        .uniform_array("bone_matrices", UniformKind::Mat4, MAX_BONES)
        .uniform_array("prev_bone_matrices", UniformKind::Mat4, MAX_BONES)
}

/// Name of the skinned variant of a mesh program.
pub fn skeletal_name(name: &str) -> String {
    format!("{}_skeletal", name)
}

impl ShaderLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Library holding every program the renderer uses.
    pub fn builtin() -> Self {
        use UniformKind::*;
        let mut library = Self::new();

        let surface = lit_source!("../../shaders/surface.wgsl");
        let prepass = include_str!("../../shaders/prepass.wgsl");
        let shadow = include_str!("../../shaders/shadowmap.wgsl");
        let object_id = include_str!("../../shaders/object_id.wgsl");
        let mesh_programs: [(&str, &'static str, u32, fn(ShaderTemplate) -> ShaderTemplate); 4] = [
            ("default", surface, 4, surface_uniforms),
            ("prepass", prepass, 1, |t| {
                t.uniform("model", Mat4)
                    .uniform("texture_diffuse", Sampler2D)
                    .uniform("texture_normal", Sampler2D)
            }),
            ("shadowmap", shadow, 0, |t| {
                t.uniform("model", Mat4).uniform("texture_diffuse", Sampler2D)
            }),
            ("object_id", object_id, 1, |t| {
                t.uniform("model", Mat4).uniform("object_id", Float)
            }),
        ];
        for (name, fragment, outputs, declare) in mesh_programs {
            let render_shadow = if name == "shadowmap" { "1" } else { "0" };
            library.register(
                declare(ShaderTemplate::graphics(name, MESH_VS, fragment, outputs))
                    .define("RENDER_SHADOW", render_shadow),
            );
            library.register(skinned(
                declare(ShaderTemplate::graphics(
                    &skeletal_name(name),
                    SKINNED_VS,
                    fragment,
                    outputs,
                ))
                .define("RENDER_SHADOW", render_shadow),
            ));
        }

        let fullscreen = |name: &str, source: &'static str, outputs: u32| {
            ShaderTemplate::fullscreen(name, source, outputs)
        };
        library.register(
            fullscreen("copy_texture", include_str!("../../shaders/copy_texture.wgsl"), 1)
                .uniform("texture_source", Sampler2D)
                .uniform("color_scale", Vec4),
        );
        library.register(
            fullscreen("render_texture", include_str!("../../shaders/render_texture.wgsl"), 1)
                .uniform("texture_type", Int)
                .uniform("texture_lod", Float)
                .uniform("texture_layer", Float)
                .uniform("texture_source_2d", Sampler2D)
                .uniform("texture_source_2d_array", Sampler2DArray)
                .uniform("texture_source_3d", Sampler3D)
                .uniform("texture_source_cube", SamplerCube)
                .uniform("texture_source_2d_float", Sampler2DUnfilterable),
        );
        library.register(
            fullscreen("linear_depth", include_str!("../../shaders/linear_depth.wgsl"), 1)
                .uniform("texture_depth", Sampler2DUnfilterable),
        );
        library.register(
            fullscreen("generate_min_z", include_str!("../../shaders/generate_min_z.wgsl"), 1)
                .uniform("source_lod", Int)
                .uniform("texture_linear_depth", Sampler2DUnfilterable),
        );
        library.register(
            fullscreen("velocity", include_str!("../../shaders/velocity.wgsl"), 1)
                .uniform("texture_depth", Sampler2DUnfilterable),
        );
        library.register(
            fullscreen("ssao", include_str!("../../shaders/ssao.wgsl"), 1)
                .define("SSAO_KERNEL_SIZE", &SSAO_KERNEL_SIZE.to_string())
                .uniform_array("kernel", Vec3, SSAO_KERNEL_SIZE as u32)
                .uniform("radius_min_max", Vec2)
                .uniform("noise_scale", Vec2)
                .uniform("texture_normal", Sampler2D)
                .uniform("texture_linear_depth", Sampler2DUnfilterable)
                .uniform("texture_noise", Sampler2D),
        );
        library.register(
            fullscreen("gaussian_blur", include_str!("../../shaders/gaussian_blur.wgsl"), 1)
                .uniform("blur_scale", Vec2)
                .uniform("texture_source", Sampler2D),
        );
        library.register(
            fullscreen("ssr", include_str!("../../shaders/ssr.wgsl"), 1)
                .uniform("texture_source", Sampler2D)
                .uniform("texture_normal", Sampler2D)
                .uniform("texture_material", Sampler2D)
                .uniform("texture_linear_depth", Sampler2DUnfilterable),
        );
        library.register(
            fullscreen("ssr_resolve", include_str!("../../shaders/ssr_resolve.wgsl"), 1)
                .uniform("texture_input", Sampler2D)
                .uniform("texture_resolve_prev", Sampler2D)
                .uniform("texture_velocity", Sampler2DUnfilterable),
        );
        library.register(
            fullscreen(
                "composite_shadowmap",
                include_str!("../../shaders/composite_shadowmap.wgsl"),
                1,
            )
            .uniform("texture_static_shadowmap", Sampler2DUnfilterable)
            .uniform("texture_dynamic_shadowmap", Sampler2DUnfilterable),
        );
        library.register(
            fullscreen("deferred_shading", lit_source!("../../shaders/deferred_shading.wgsl"), 1)
                .uniform("texture_diffuse", Sampler2D)
                .uniform("texture_material", Sampler2D)
                .uniform("texture_normal", Sampler2D)
                .uniform("texture_depth", Sampler2DUnfilterable)
                .uniform("texture_shadow", Sampler2DUnfilterable)
                .uniform("texture_ssao", Sampler2D)
                .uniform("texture_scene_reflect", Sampler2D)
                .uniform("texture_probe", SamplerCube)
                .uniform("texture_transmittance", Sampler2D)
                .uniform("texture_irradiance", Sampler2D),
        );
        library.register(
            fullscreen(
                "atmosphere",
                concat!(
                    include_str!("../../shaders/atmosphere_common.wgsl"),
                    include_str!("../../shaders/atmosphere.wgsl")
                ),
                2,
            )
            .uniform("sun_direction", Vec3)
            .uniform("ignore_depth", Bool)
            .uniform("texture_depth", Sampler2DUnfilterable)
            .uniform("texture_transmittance", Sampler2D),
        );
        library.register(
            fullscreen(
                "atmosphere_composite",
                include_str!("../../shaders/atmosphere_composite.wgsl"),
                1,
            )
            .uniform("texture_atmosphere", Sampler2D)
            .uniform("texture_inscatter", Sampler2D)
            .uniform("texture_depth", Sampler2DUnfilterable),
        );
        library.register(
            fullscreen("taa", include_str!("../../shaders/taa.wgsl"), 1)
                .uniform("texture_input", Sampler2D)
                .uniform("texture_prev", Sampler2D)
                .uniform("texture_velocity", Sampler2DUnfilterable)
                .uniform("texture_linear_depth", Sampler2DUnfilterable),
        );
        library.register(
            fullscreen("bloom_highlight", include_str!("../../shaders/bloom_highlight.wgsl"), 1)
                .uniform("bloom_threshold_min", Float)
                .uniform("bloom_threshold_max", Float)
                .uniform("bloom_scale", Float)
                .uniform("texture_source", Sampler2D),
        );
        library.register(
            fullscreen("bloom", include_str!("../../shaders/bloom.wgsl"), 1)
                .uniform("bloom_intensity", Float)
                .uniform("texture_bloom0", Sampler2D)
                .uniform("texture_bloom1", Sampler2D)
                .uniform("texture_bloom2", Sampler2D)
                .uniform("texture_bloom3", Sampler2D)
                .uniform("texture_bloom4", Sampler2D),
        );
        library.register(
            fullscreen("tone_map", include_str!("../../shaders/tone_map.wgsl"), 1)
                .uniform("exposure", Float)
                .uniform("contrast", Float)
                .uniform("is_render_tonemapping", Bool)
                .uniform("texture_source", Sampler2D),
        );
        library.register(
            fullscreen("motion_blur", include_str!("../../shaders/motion_blur.wgsl"), 1)
                .uniform("motion_blur_scale", Float)
                .uniform("texture_source", Sampler2D)
                .uniform("texture_velocity", Sampler2DUnfilterable),
        );
        library.register(
            fullscreen("cube_convolution", include_str!("../../shaders/cube_convolution.wgsl"), 1)
                .uniform("face_matrix", Mat4)
                .uniform("lod", Float)
                .uniform("mipmap_count", Float)
                .uniform("texture_environment", SamplerCube),
        );

        let fft = include_str!("../../shaders/fft.wgsl");
        library.register(
            fullscreen("fft_init", include_str!("../../shaders/fft_init.wgsl"), 1)
                .uniform("t", Float)
                .uniform("fft_layer", Int)
                .uniform("inverse_grid_sizes", Vec4)
                .uniform("texture_spectrum_1_2", Sampler2DUnfilterable)
                .uniform("texture_spectrum_3_4", Sampler2DUnfilterable),
        );
        for (name, vertical) in [("fft_x", "0"), ("fft_y", "1")] {
            library.register(
                fullscreen(name, fft, 1)
                    .define("FFT_VERTICAL", vertical)
                    .uniform("butterfly_pass", Float)
                    .uniform("fft_layer", Int)
                    .uniform("texture_butterfly", Sampler2DUnfilterable)
                    .uniform("texture_input", Sampler2DArray),
            );
        }
        library.register(
            fullscreen("ocean_variance", include_str!("../../shaders/ocean_variance.wgsl"), 1)
                .uniform("variance_layer", Float)
                .uniform("n_slope_variance", Float)
                .uniform("slope_variance_delta", Float)
                .uniform("grid_sizes", Vec4)
                .uniform("texture_spectrum_1_2", Sampler2DUnfilterable)
                .uniform("texture_spectrum_3_4", Sampler2DUnfilterable),
        );
        library.register(
            ShaderTemplate::fullscreen("ocean", lit_source!("../../shaders/ocean.wgsl"), 1)
                .uniform("height", Float)
                .uniform("grid_size", Float)
                .uniform("simulation_amplitude", Float)
                .uniform("simulation_scale", Float)
                .uniform("grid_sizes", Vec4)
                .uniform("choppy", Vec4)
                .uniform("texture_fft", Sampler2DArray)
                .uniform("texture_slope_variance", Sampler3D)
                .uniform("texture_probe", SamplerCube)
                .uniform("texture_transmittance", Sampler2D),
        );

        library.register(
            ShaderTemplate::fullscreen("particle", particle_source!("../../shaders/particle.wgsl"), 1)
                .uniform("color", Vec4)
                .uniform("texture_diffuse", Sampler2D),
        );
        let particle_struct = PARTICLE_WGSL_TYPE;
        library.register(
            ShaderTemplate::fullscreen(
                "particle_gpu",
                particle_source!("../../shaders/particle_gpu.wgsl"),
                1,
            )
            .uniform("color", Vec4)
            .uniform("texture_diffuse", Sampler2D)
            .storage(StorageDecl {
                name: "particles".into(),
                binding: PARTICLE_BUFFER_BINDING,
                struct_source: particle_struct.into(),
                read_only: true,
            }),
        );
        library.register(
            ShaderTemplate::compute(
                "particle_update",
                particle_source!("../../shaders/particle_update.wgsl"),
                WORKGROUP_SIZE,
            )
            .define("WORKGROUP_SIZE", &format!("{}u", WORKGROUP_SIZE))
            .storage(StorageDecl {
                name: "particles".into(),
                binding: PARTICLE_BUFFER_BINDING,
                struct_source: particle_struct.into(),
                read_only: false,
            })
            .storage(StorageDecl {
                name: "particle_counter".into(),
                binding: PARTICLE_COUNTER_BINDING,
                struct_source: "atomic<u32>".into(),
                read_only: false,
            }),
        );
        library
    }

    /// Add or replace a template.
    pub fn register(&mut self, template: ShaderTemplate) {
        self.templates.insert(template.name.clone(), template);
    }

    pub fn get(&self, name: &str) -> Option<&ShaderTemplate> {
        self.templates.get(name)
    }

    pub fn descriptor(&self, name: &str, macros: &BTreeMap<String, String>) -> RenderResult<ProgramDescriptor> {
        self.templates
            .get(name)
            .map(|template| template.descriptor(macros))
            .ok_or_else(|| RenderError::MissingResource(format!("shader {}", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_library_has_variants() {
        let library = ShaderLibrary::builtin();
        for name in ["default", "default_skeletal", "shadowmap_skeletal", "fft_x", "fft_y", "particle_update"] {
            assert!(library.get(name).is_some(), "{name}");
        }
        let skinned = library.get("default_skeletal").unwrap();
        assert!(skinned.uniforms.iter().any(|u| u.name == "bone_matrices" && u.count == MAX_BONES));
    }

    #[test]
    fn test_macros_override_template_defines() {
        let library = ShaderLibrary::builtin();
        let mut macros = BTreeMap::new();
        macros.insert("FFT_VERTICAL".to_string(), "1".to_string());
        macros.insert("EXTRA".to_string(), "2".to_string());
        let desc = library.descriptor("fft_x", &macros).unwrap();
        assert!(desc.defines.contains(&("FFT_VERTICAL".to_string(), "1".to_string())));
        assert!(desc.defines.contains(&("EXTRA".to_string(), "2".to_string())));
        assert!(matches!(
            library.descriptor("missing", &BTreeMap::new()),
            Err(RenderError::MissingResource(_))
        ));
    }

    #[test]
    fn test_mesh_programs_select_shadow_projection() {
        let library = ShaderLibrary::builtin();
        let none = BTreeMap::new();
        let shadow = library.descriptor("shadowmap_skeletal", &none).unwrap();
        assert!(shadow.defines.contains(&("RENDER_SHADOW".to_string(), "1".to_string())));
        assert!(shadow.defines.contains(&("MAX_BONES".to_string(), MAX_BONES.to_string())));
        let surface = library.descriptor("default", &none).unwrap();
        assert!(surface.defines.contains(&("RENDER_SHADOW".to_string(), "0".to_string())));
    }

    #[test]
    fn test_sampler_names_are_unique() {
        let library = ShaderLibrary::builtin();
        for name in library.names() {
            let template = library.get(name).unwrap();
            let mut seen = std::collections::HashSet::new();
            for uniform in &template.uniforms {
                assert!(seen.insert(&uniform.name), "{name}: {}", uniform.name);
            }
        }
    }
}
