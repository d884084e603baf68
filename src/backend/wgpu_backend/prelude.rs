//! WGSL prelude generation
//!
//! Every program is compiled as `common.wgsl` + defines + a generated
//! material block + generated texture and storage bindings + the program
//! body. The generated parts come from the program's uniform declarations,
//! so the bind group layouts built by the backend agree with the shader by
//! construction:
//!
//! - group 0: uniform blocks 0..=6
//! - group 1: binding 0, `var<uniform> material: Material`
//! - group 2: texture `2i` and sampler `2i + 1` for the i-th sampler uniform
//! - group 3: storage buffers at their declared bindings

use crate::backend::traits::{BackendError, BackendResult};
use crate::backend::types::*;

pub(crate) const COMMON_WGSL: &str = include_str!("../../../shaders/common.wgsl");

/// Number of fixed uniform block bindings in group 0
pub(crate) const UNIFORM_BLOCK_COUNT: u32 = 7;

/// Byte placement of the non-sampler uniforms inside the material block
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MaterialLayout {
    /// (offset, array stride) per declaration; `None` for samplers.
    pub entries: Vec<Option<(u32, u32)>>,
    pub size: u32,
}

fn align_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

impl MaterialLayout {
    pub fn new(program: &str, uniforms: &[UniformDecl]) -> BackendResult<Self> {
        let mut entries = Vec::with_capacity(uniforms.len());
        let mut offset = 0;
        let mut struct_align = 16;
        for decl in uniforms {
            if decl.kind.is_sampler() {
                entries.push(None);
                continue;
            }
            let (size, align) = decl.kind.layout();
            if decl.count > 1 {
                if align < 16 && decl.kind != UniformKind::Mat2 {
                    return Err(BackendError::ProgramLinkFailed {
                        name: program.to_string(),
                        message: format!(
                            "uniform array '{}' of {:?} is not 16-byte aligned",
                            decl.name, decl.kind
                        ),
                    });
                }
                let stride = align_up(size, 16);
                offset = align_up(offset, 16);
                entries.push(Some((offset, stride)));
                offset += stride * decl.count;
            } else {
                offset = align_up(offset, align);
                entries.push(Some((offset, size)));
                offset += size;
            }
            struct_align = struct_align.max(align);
        }
        Ok(Self {
            entries,
            size: align_up(offset.max(16), struct_align),
        })
    }
}

fn wgsl_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Generated declarations placed between the common header and the body.
pub(crate) fn generated_bindings(desc: &ProgramDescriptor) -> BackendResult<String> {
    let mut out = String::new();
    for (name, value) in &desc.defines {
        if !wgsl_identifier(name) {
            return Err(BackendError::ProgramLinkFailed {
                name: desc.name.clone(),
                message: format!("invalid define name '{}'", name),
            });
        }
        out.push_str(&format!("const {} = {};\n", name, value));
    }

    out.push_str("\nstruct Material {\n");
    let mut members = 0;
    for decl in desc.uniforms.iter().filter(|d| !d.kind.is_sampler()) {
        if !wgsl_identifier(&decl.name) {
            return Err(BackendError::ProgramLinkFailed {
                name: desc.name.clone(),
                message: format!("invalid uniform name '{}'", decl.name),
            });
        }
        if decl.count > 1 {
            out.push_str(&format!(
                "    {}: array<{}, {}>,\n",
                decl.name,
                decl.kind.wgsl_type(),
                decl.count
            ));
        } else {
            out.push_str(&format!("    {}: {},\n", decl.name, decl.kind.wgsl_type()));
        }
        members += 1;
    }
    if members == 0 {
        out.push_str("    _unused: vec4<f32>,\n");
    }
    out.push_str("}\n\n@group(1) @binding(0) var<uniform> material: Material;\n\n");

    for (slot, decl) in desc.uniforms.iter().filter(|d| d.kind.is_sampler()).enumerate() {
        let binding = slot as u32 * 2;
        out.push_str(&format!(
            "@group(2) @binding({}) var {}: {};\n",
            binding,
            decl.name,
            decl.kind.wgsl_type()
        ));
        if decl.kind != UniformKind::Sampler2DMultisample {
            out.push_str(&format!(
                "@group(2) @binding({}) var {}_sampler: sampler;\n",
                binding + 1,
                decl.name
            ));
        }
    }

    for storage in &desc.storage {
        let access = if storage.read_only { "read" } else { "read_write" };
        out.push_str(&format!(
            "@group(3) @binding({}) var<storage, {}> {}: {};\n",
            storage.binding, access, storage.name, storage.struct_source
        ));
    }
    Ok(out)
}

/// Full WGSL source of a program.
pub(crate) fn assemble(desc: &ProgramDescriptor) -> BackendResult<String> {
    let mut source = String::from(COMMON_WGSL);
    source.push('\n');
    source.push_str(&generated_bindings(desc)?);
    source.push('\n');
    match &desc.stages {
        ProgramStages::Graphics {
            vertex, fragment, ..
        } => {
            source.push_str(vertex);
            if fragment != vertex {
                source.push('\n');
                source.push_str(fragment);
            }
        }
        ProgramStages::Compute { source: body, .. } => source.push_str(body),
    }
    Ok(source)
}

/// Parse and validate WGSL with naga so link errors carry a readable message.
pub(crate) fn validate(name: &str, source: &str) -> BackendResult<()> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| {
        BackendError::ProgramLinkFailed {
            name: name.to_string(),
            message: e.emit_to_string(source),
        }
    })?;
    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| BackendError::ProgramLinkFailed {
        name: name.to_string(),
        message: e.emit_to_string(source),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_material_layout_alignment() {
        let uniforms = vec![
            UniformDecl::new("roughness", UniformKind::Float),
            UniformDecl::new("emissive", UniformKind::Vec3),
            UniformDecl::new("texture_diffuse", UniformKind::Sampler2D),
            UniformDecl::new("uv_offset", UniformKind::Vec2),
            UniformDecl::new("model", UniformKind::Mat4),
            UniformDecl::array("bones", UniformKind::Mat4, 2),
        ];
        let layout = MaterialLayout::new("test", &uniforms).unwrap();
        assert_eq!(layout.entries[0], Some((0, 4)));
        assert_eq!(layout.entries[1], Some((16, 12)));
        assert_eq!(layout.entries[2], None);
        assert_eq!(layout.entries[3], Some((32, 8)));
        assert_eq!(layout.entries[4], Some((48, 64)));
        assert_eq!(layout.entries[5], Some((112, 64)));
        assert_eq!(layout.size, 240);
    }

    #[test]
    fn test_scalar_arrays_are_rejected() {
        let uniforms = vec![UniformDecl::array("weights", UniformKind::Float, 4)];
        assert!(MaterialLayout::new("test", &uniforms).is_err());
    }

    #[test]
    fn test_generated_bindings() {
        let desc = ProgramDescriptor::graphics("test", "", "", 1)
            .uniform("texture_probe", UniformKind::SamplerCube)
            .uniform("lod", UniformKind::Float)
            .uniform("texture_ms", UniformKind::Sampler2DMultisample)
            .define("SAMPLES", "4");
        let source = generated_bindings(&desc).unwrap();
        assert!(source.contains("const SAMPLES = 4;"));
        assert!(source.contains("    lod: f32,"));
        assert!(source.contains("@group(2) @binding(0) var texture_probe: texture_cube<f32>;"));
        assert!(source.contains("@group(2) @binding(1) var texture_probe_sampler: sampler;"));
        assert!(source.contains("@group(2) @binding(2) var texture_ms: texture_multisampled_2d<f32>;"));
        assert!(!source.contains("texture_ms_sampler"));
    }

    #[test]
    fn test_assembled_program_validates() {
        let body = r#"
@vertex
fn vs_main(input: VertexInput) -> QuadOutput {
    return quad_vertex(input.position);
}

@fragment
fn fs_main(in: QuadOutput) -> @location(0) vec4<f32> {
    return textureSample(texture_diffuse, texture_diffuse_sampler, in.uv) * material.tint;
}
"#;
        let desc = ProgramDescriptor::graphics("tinted", body, body, 1)
            .uniform("tint", UniformKind::Vec4)
            .uniform("texture_diffuse", UniformKind::Sampler2D);
        let source = assemble(&desc).unwrap();
        validate("tinted", &source).unwrap();
    }

    #[test]
    fn test_invalid_program_reports_link_failure() {
        let desc = ProgramDescriptor::compute("broken", "fn cs_main( {", 64);
        let source = assemble(&desc).unwrap();
        assert!(matches!(
            validate("broken", &source),
            Err(BackendError::ProgramLinkFailed { .. })
        ));
    }
}
