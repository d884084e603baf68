//! Conversions from backend types to wgpu types

use crate::backend::types::*;

pub(super) fn texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        TextureFormat::R16Float => wgpu::TextureFormat::R16Float,
        TextureFormat::Rg16Float => wgpu::TextureFormat::Rg16Float,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
        TextureFormat::Rg32Float => wgpu::TextureFormat::Rg32Float,
        TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
        TextureFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
    }
}

pub(super) fn texture_dimension(target: TextureTarget) -> wgpu::TextureDimension {
    match target {
        TextureTarget::D3 => wgpu::TextureDimension::D3,
        _ => wgpu::TextureDimension::D2,
    }
}

pub(super) fn view_dimension(target: TextureTarget) -> wgpu::TextureViewDimension {
    match target {
        TextureTarget::D2 | TextureTarget::D2Multisample => wgpu::TextureViewDimension::D2,
        TextureTarget::D2Array => wgpu::TextureViewDimension::D2Array,
        TextureTarget::D3 => wgpu::TextureViewDimension::D3,
        TextureTarget::Cube => wgpu::TextureViewDimension::Cube,
    }
}

/// Aspect used when sampling or copying a texture of this format
pub(super) fn sample_aspect(format: TextureFormat) -> wgpu::TextureAspect {
    if format.is_depth() {
        wgpu::TextureAspect::DepthOnly
    } else {
        wgpu::TextureAspect::All
    }
}

pub(super) fn filter_mode(mode: FilterMode) -> wgpu::FilterMode {
    if mode.is_linear() {
        wgpu::FilterMode::Linear
    } else {
        wgpu::FilterMode::Nearest
    }
}

/// Mipmap filter implied by a GL min filter
pub(super) fn mipmap_filter(mode: FilterMode) -> wgpu::FilterMode {
    match mode {
        FilterMode::NearestMipmapLinear | FilterMode::LinearMipmapLinear => {
            wgpu::FilterMode::Linear
        }
        _ => wgpu::FilterMode::Nearest,
    }
}

pub(super) fn address_mode(mode: WrapMode) -> wgpu::AddressMode {
    match mode {
        WrapMode::Repeat => wgpu::AddressMode::Repeat,
        WrapMode::MirroredRepeat => wgpu::AddressMode::MirrorRepeat,
        WrapMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
        WrapMode::ClampToBorder => wgpu::AddressMode::ClampToBorder,
    }
}

/// wgpu only knows three border colors; pick the closest one.
pub(super) fn border_color(color: [f32; 4]) -> wgpu::SamplerBorderColor {
    if color[0] >= 0.5 {
        wgpu::SamplerBorderColor::OpaqueWhite
    } else if color[3] >= 0.5 {
        wgpu::SamplerBorderColor::OpaqueBlack
    } else {
        wgpu::SamplerBorderColor::TransparentBlack
    }
}

pub(super) fn compare_function(func: CompareFunction) -> wgpu::CompareFunction {
    match func {
        CompareFunction::Never => wgpu::CompareFunction::Never,
        CompareFunction::Less => wgpu::CompareFunction::Less,
        CompareFunction::Equal => wgpu::CompareFunction::Equal,
        CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
        CompareFunction::Greater => wgpu::CompareFunction::Greater,
        CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
        CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        CompareFunction::Always => wgpu::CompareFunction::Always,
    }
}

pub(super) fn blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
    match factor {
        BlendFactor::Zero => wgpu::BlendFactor::Zero,
        BlendFactor::One => wgpu::BlendFactor::One,
        BlendFactor::SrcColor => wgpu::BlendFactor::Src,
        BlendFactor::OneMinusSrcColor => wgpu::BlendFactor::OneMinusSrc,
        BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
        BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
        BlendFactor::DstColor => wgpu::BlendFactor::Dst,
        BlendFactor::OneMinusDstColor => wgpu::BlendFactor::OneMinusDst,
        BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
        BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
    }
}

pub(super) fn blend_operation(equation: BlendEquation) -> wgpu::BlendOperation {
    match equation {
        BlendEquation::Add => wgpu::BlendOperation::Add,
        BlendEquation::Subtract => wgpu::BlendOperation::Subtract,
        BlendEquation::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
        BlendEquation::Min => wgpu::BlendOperation::Min,
        BlendEquation::Max => wgpu::BlendOperation::Max,
    }
}

/// Same equation for color and alpha, as glBlendFunc does.
pub(super) fn blend_state(blend: &BlendState) -> wgpu::BlendState {
    // min/max ignore factors and wgpu requires them to be One
    let (src, dst) = match blend.equation {
        BlendEquation::Min | BlendEquation::Max => (wgpu::BlendFactor::One, wgpu::BlendFactor::One),
        _ => (blend_factor(blend.src), blend_factor(blend.dst)),
    };
    let component = wgpu::BlendComponent {
        src_factor: src,
        dst_factor: dst,
        operation: blend_operation(blend.equation),
    };
    wgpu::BlendState {
        color: component,
        alpha: component,
    }
}

pub(super) fn cull_mode(face: CullFace) -> Option<wgpu::Face> {
    match face {
        CullFace::None => None,
        CullFace::Front => Some(wgpu::Face::Front),
        CullFace::Back => Some(wgpu::Face::Back),
    }
}

pub(super) fn front_face(face: FrontFace) -> wgpu::FrontFace {
    match face {
        FrontFace::Ccw => wgpu::FrontFace::Ccw,
        FrontFace::Cw => wgpu::FrontFace::Cw,
    }
}

pub(super) fn polygon_mode(mode: PolygonMode, features: wgpu::Features) -> wgpu::PolygonMode {
    match mode {
        PolygonMode::Line if features.contains(wgpu::Features::POLYGON_MODE_LINE) => {
            wgpu::PolygonMode::Line
        }
        PolygonMode::Point if features.contains(wgpu::Features::POLYGON_MODE_POINT) => {
            wgpu::PolygonMode::Point
        }
        _ => wgpu::PolygonMode::Fill,
    }
}

pub(super) fn topology(mode: PrimitiveMode) -> wgpu::PrimitiveTopology {
    match mode {
        PrimitiveMode::Triangles => wgpu::PrimitiveTopology::TriangleList,
        PrimitiveMode::Lines => wgpu::PrimitiveTopology::LineList,
        PrimitiveMode::Points => wgpu::PrimitiveTopology::PointList,
    }
}

pub(super) fn vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
    match format {
        VertexFormat::Float32 => wgpu::VertexFormat::Float32,
        VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
        VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
        VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
    }
}

pub(super) fn vertex_attributes(layout: &VertexLayout) -> Vec<wgpu::VertexAttribute> {
    layout
        .attributes
        .iter()
        .map(|a| wgpu::VertexAttribute {
            format: vertex_format(a.format),
            offset: a.offset,
            shader_location: a.location,
        })
        .collect()
}

pub(super) fn buffer_usage(kind: BufferKind) -> wgpu::BufferUsages {
    let base = wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC;
    base | match kind {
        BufferKind::Uniform => wgpu::BufferUsages::UNIFORM,
        BufferKind::Storage | BufferKind::AtomicCounter => wgpu::BufferUsages::STORAGE,
        BufferKind::Vertex | BufferKind::Instance => wgpu::BufferUsages::VERTEX,
        BufferKind::Index => wgpu::BufferUsages::INDEX,
    }
}

/// Bind group layout entry for a sampled texture of the given uniform kind
pub(super) fn texture_binding(kind: UniformKind) -> wgpu::BindingType {
    let (sample_type, view_dimension, multisampled) = match kind {
        UniformKind::Sampler2DUnfilterable => (
            wgpu::TextureSampleType::Float { filterable: false },
            wgpu::TextureViewDimension::D2,
            false,
        ),
        UniformKind::Sampler2DArray => (
            wgpu::TextureSampleType::Float { filterable: true },
            wgpu::TextureViewDimension::D2Array,
            false,
        ),
        UniformKind::Sampler3D => (
            wgpu::TextureSampleType::Float { filterable: true },
            wgpu::TextureViewDimension::D3,
            false,
        ),
        UniformKind::SamplerCube => (
            wgpu::TextureSampleType::Float { filterable: true },
            wgpu::TextureViewDimension::Cube,
            false,
        ),
        UniformKind::Sampler2DMultisample => (
            wgpu::TextureSampleType::Float { filterable: false },
            wgpu::TextureViewDimension::D2,
            true,
        ),
        _ => (
            wgpu::TextureSampleType::Float { filterable: true },
            wgpu::TextureViewDimension::D2,
            false,
        ),
    };
    wgpu::BindingType::Texture {
        sample_type,
        view_dimension,
        multisampled,
    }
}

pub(super) fn sampler_binding(kind: UniformKind) -> wgpu::BindingType {
    if kind == UniformKind::Sampler2DUnfilterable {
        wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering)
    } else {
        wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering)
    }
}

/// Rows copied to a buffer must be 256-byte aligned
pub(super) fn aligned_bytes_per_row(width: u32, bytes_per_pixel: u32) -> u32 {
    let unpadded = width * bytes_per_pixel;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_bytes_per_row() {
        assert_eq!(aligned_bytes_per_row(1, 4), 256);
        assert_eq!(aligned_bytes_per_row(64, 4), 256);
        assert_eq!(aligned_bytes_per_row(65, 4), 512);
    }

    #[test]
    fn test_mipmap_filter_follows_min_filter() {
        assert_eq!(mipmap_filter(FilterMode::LinearMipmapLinear), wgpu::FilterMode::Linear);
        assert_eq!(mipmap_filter(FilterMode::LinearMipmapNearest), wgpu::FilterMode::Nearest);
        assert_eq!(filter_mode(FilterMode::LinearMipmapNearest), wgpu::FilterMode::Linear);
    }

    #[test]
    fn test_unfilterable_textures_use_non_filtering_samplers() {
        assert_eq!(
            sampler_binding(UniformKind::Sampler2DUnfilterable),
            wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering)
        );
        assert!(matches!(
            texture_binding(UniformKind::Sampler2DMultisample),
            wgpu::BindingType::Texture { multisampled: true, .. }
        ));
    }
}
