//! Common types shared between backends

use half::f16;

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    R16Float,
    Rg16Float,
    Rgba16Float,
    R32Float,
    Rg32Float,
    Rgba32Float,
    Depth32Float,
    Depth24PlusStencil8,
}

impl TextureFormat {
    pub fn is_depth(&self) -> bool {
        matches!(
            self,
            TextureFormat::Depth32Float | TextureFormat::Depth24PlusStencil8
        )
    }

    pub fn has_stencil(&self) -> bool {
        matches!(self, TextureFormat::Depth24PlusStencil8)
    }

    /// sRGB conversion only exists for 8-bit color formats.
    pub fn is_srgb_eligible(&self) -> bool {
        matches!(self, TextureFormat::Rgba8Unorm | TextureFormat::Rgba8UnormSrgb)
    }

    /// Formats that support hardware blending.
    pub fn is_blendable(&self) -> bool {
        matches!(
            self,
            TextureFormat::Rgba8Unorm
                | TextureFormat::Rgba8UnormSrgb
                | TextureFormat::R16Float
                | TextureFormat::Rg16Float
                | TextureFormat::Rgba16Float
        )
    }

    pub fn channels(&self) -> u32 {
        match self {
            TextureFormat::R16Float
            | TextureFormat::R32Float
            | TextureFormat::Depth32Float
            | TextureFormat::Depth24PlusStencil8 => 1,
            TextureFormat::Rg16Float | TextureFormat::Rg32Float => 2,
            _ => 4,
        }
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::R16Float => 2,
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Rg16Float
            | TextureFormat::R32Float
            | TextureFormat::Depth32Float
            | TextureFormat::Depth24PlusStencil8 => 4,
            TextureFormat::Rgba16Float | TextureFormat::Rg32Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }

    /// Encode an RGBA value into one texel of this format.
    pub fn encode_texel(&self, value: [f32; 4], out: &mut [u8]) {
        match self {
            TextureFormat::Rgba8Unorm | TextureFormat::Rgba8UnormSrgb => {
                for (dst, v) in out.iter_mut().zip(value.iter()) {
                    *dst = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
                }
            }
            TextureFormat::R16Float | TextureFormat::Rg16Float | TextureFormat::Rgba16Float => {
                let channels = self.channels() as usize;
                for (c, v) in value.iter().take(channels).enumerate() {
                    let bits = f16::from_f32(*v).to_bits().to_le_bytes();
                    out[c * 2..c * 2 + 2].copy_from_slice(&bits);
                }
            }
            TextureFormat::R32Float
            | TextureFormat::Rg32Float
            | TextureFormat::Rgba32Float
            | TextureFormat::Depth32Float => {
                let channels = self.channels() as usize;
                for (c, v) in value.iter().take(channels).enumerate() {
                    out[c * 4..c * 4 + 4].copy_from_slice(&v.to_le_bytes());
                }
            }
            TextureFormat::Depth24PlusStencil8 => {
                let depth = (value[0].clamp(0.0, 1.0) * 16_777_215.0).round() as u32;
                out[0..4].copy_from_slice(&(depth << 8).to_le_bytes());
            }
        }
    }

    /// Tightly packed pixel data for `texels`.
    pub fn encode_texels(&self, texels: &[[f32; 4]]) -> Vec<u8> {
        let bpp = self.bytes_per_pixel() as usize;
        let mut data = vec![0u8; texels.len() * bpp];
        for (texel, out) in texels.iter().zip(data.chunks_exact_mut(bpp)) {
            self.encode_texel(*texel, out);
        }
        data
    }

    /// Decode one texel of this format into RGBA. Missing channels read as (0, 0, 0, 1).
    pub fn decode_texel(&self, data: &[u8]) -> [f32; 4] {
        let mut value = [0.0, 0.0, 0.0, 1.0];
        match self {
            TextureFormat::Rgba8Unorm | TextureFormat::Rgba8UnormSrgb => {
                for (v, src) in value.iter_mut().zip(data.iter()) {
                    *v = *src as f32 / 255.0;
                }
            }
            TextureFormat::R16Float | TextureFormat::Rg16Float | TextureFormat::Rgba16Float => {
                for (c, v) in value.iter_mut().take(self.channels() as usize).enumerate() {
                    let bits = u16::from_le_bytes([data[c * 2], data[c * 2 + 1]]);
                    *v = f16::from_bits(bits).to_f32();
                }
            }
            TextureFormat::R32Float
            | TextureFormat::Rg32Float
            | TextureFormat::Rgba32Float
            | TextureFormat::Depth32Float => {
                for (c, v) in value.iter_mut().take(self.channels() as usize).enumerate() {
                    let bytes = [data[c * 4], data[c * 4 + 1], data[c * 4 + 2], data[c * 4 + 3]];
                    *v = f32::from_le_bytes(bytes);
                }
            }
            TextureFormat::Depth24PlusStencil8 => {
                let packed = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                value[0] = (packed >> 8) as f32 / 16_777_215.0;
            }
        }
        value
    }
}

/// Dimensionality of a texture object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureTarget {
    D2,
    D2Array,
    D3,
    Cube,
    D2Multisample,
}

impl TextureTarget {
    /// Number of array layers (or depth slices) stored for the given depth.
    pub fn layer_count(&self, depth: u32) -> u32 {
        match self {
            TextureTarget::D2 | TextureTarget::D2Multisample => 1,
            TextureTarget::Cube => 6,
            TextureTarget::D2Array | TextureTarget::D3 => depth.max(1),
        }
    }
}

/// Minification / magnification filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Nearest,
    Linear,
    NearestMipmapNearest,
    LinearMipmapNearest,
    NearestMipmapLinear,
    LinearMipmapLinear,
}

impl FilterMode {
    pub fn is_mipmap(&self) -> bool {
        !matches!(self, FilterMode::Nearest | FilterMode::Linear)
    }

    pub fn is_linear(&self) -> bool {
        matches!(
            self,
            FilterMode::Linear | FilterMode::LinearMipmapNearest | FilterMode::LinearMipmapLinear
        )
    }
}

/// Texture coordinate wrapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrapMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

/// Sampler state carried by every texture
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerState {
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub wrap: WrapMode,
    pub border_color: [f32; 4],
}

impl Default for SamplerState {
    fn default() -> Self {
        Self {
            min_filter: FilterMode::Linear,
            mag_filter: FilterMode::Linear,
            wrap: WrapMode::Repeat,
            border_color: [0.0; 4],
        }
    }
}

/// Texture descriptor
#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub label: String,
    pub target: TextureTarget,
    pub width: u32,
    pub height: u32,
    /// Depth for 3D textures, layer count for arrays.
    pub depth: u32,
    pub format: TextureFormat,
    pub sampler: SamplerState,
    pub samples: u32,
    /// Usable as a framebuffer attachment.
    pub attachment: bool,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: String::new(),
            target: TextureTarget::D2,
            width: 1,
            height: 1,
            depth: 1,
            format: TextureFormat::Rgba8Unorm,
            sampler: SamplerState::default(),
            samples: 1,
            attachment: false,
        }
    }
}

impl TextureDescriptor {
    /// Mipmaps are enabled by the min filter, never for multisample targets.
    pub fn enable_mipmap(&self) -> bool {
        self.sampler.min_filter.is_mipmap() && self.target != TextureTarget::D2Multisample
    }

    pub fn mip_levels(&self) -> u32 {
        if self.enable_mipmap() {
            let largest = match self.target {
                TextureTarget::D3 => self.width.max(self.height).max(self.depth),
                _ => self.width.max(self.height),
            };
            32 - largest.max(1).leading_zeros()
        } else {
            1
        }
    }

    pub fn layers(&self) -> u32 {
        self.target.layer_count(self.depth)
    }

    /// Width and height of the given mip level.
    pub fn level_size(&self, level: u32) -> (u32, u32) {
        ((self.width >> level).max(1), (self.height >> level).max(1))
    }

    /// Layers stored at a mip level; 3D textures halve their depth per level.
    pub fn layers_at(&self, level: u32) -> u32 {
        match self.target {
            TextureTarget::D3 => (self.depth >> level).max(1),
            _ => self.layers(),
        }
    }
}

/// Buffer role, decides the binding point namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Uniform,
    Storage,
    AtomicCounter,
    Vertex,
    Index,
    Instance,
}

/// Buffer descriptor
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: String,
    pub kind: BufferKind,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullFace {
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrontFace {
    Ccw,
    Cw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendEquation {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstColor,
    OneMinusDstColor,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub equation: BlendEquation,
    pub src: BlendFactor,
    pub dst: BlendFactor,
}

impl BlendState {
    pub const ALPHA: Self = Self {
        equation: BlendEquation::Add,
        src: BlendFactor::SrcAlpha,
        dst: BlendFactor::OneMinusSrcAlpha,
    };
    pub const ADDITIVE: Self = Self {
        equation: BlendEquation::Add,
        src: BlendFactor::One,
        dst: BlendFactor::One,
    };
    pub const PREMULTIPLIED: Self = Self {
        equation: BlendEquation::Add,
        src: BlendFactor::One,
        dst: BlendFactor::OneMinusSrcAlpha,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    Fill,
    Line,
    Point,
}

/// Fixed-function state applied to subsequent draws
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_func: CompareFunction,
    pub cull_face: CullFace,
    pub front_face: FrontFace,
    pub blend: Option<BlendState>,
    pub polygon_mode: PolygonMode,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            depth_test: true,
            depth_write: true,
            depth_func: CompareFunction::LessEqual,
            cull_face: CullFace::Back,
            front_face: FrontFace::Ccw,
            blend: None,
            polygon_mode: PolygonMode::Fill,
        }
    }
}

/// Framebuffer attachment point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentPoint {
    Color(u32),
    Depth,
    DepthStencil,
}

/// Which image of a texture an attachment refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachTarget {
    Renderbuffer,
    Level(u32),
    /// Array layer or 3D slice.
    Layer { layer: u32, level: u32 },
    CubeFace { face: u32, level: u32 },
}

impl AttachTarget {
    pub fn level(&self) -> u32 {
        match self {
            AttachTarget::Renderbuffer => 0,
            AttachTarget::Level(level)
            | AttachTarget::Layer { level, .. }
            | AttachTarget::CubeFace { level, .. } => *level,
        }
    }

    /// Layer index into the texture's storage.
    pub fn layer(&self) -> u32 {
        match self {
            AttachTarget::Renderbuffer | AttachTarget::Level(_) => 0,
            AttachTarget::Layer { layer, .. } => *layer,
            AttachTarget::CubeFace { face, .. } => *face,
        }
    }
}

/// GL-style framebuffer commands, replayed on every bind
#[derive(Debug, Clone, PartialEq)]
pub enum FramebufferCommand {
    Bind(FramebufferHandle),
    BindDefault,
    Attach {
        point: AttachmentPoint,
        texture: TextureHandle,
        target: AttachTarget,
    },
    Detach(AttachmentPoint),
    DrawBuffers(u32),
    DrawBufferNone,
    ReadBuffer(Option<u32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramebufferStatus {
    Complete,
    IncompleteAttachment,
    IncompleteMissingAttachment,
    IncompleteDimensions,
    IncompleteMultisample,
    Unsupported,
}

/// One attachment as seen by the completeness check. `texture` is `None`
/// when the handle no longer resolves.
#[derive(Debug, Clone, Copy)]
pub struct AttachmentInfo<'a> {
    pub point: AttachmentPoint,
    pub texture: Option<&'a TextureDescriptor>,
    pub target: AttachTarget,
}

/// GL completeness rules shared by all backends.
pub fn framebuffer_status(attachments: &[AttachmentInfo<'_>]) -> FramebufferStatus {
    if attachments.is_empty() {
        return FramebufferStatus::IncompleteMissingAttachment;
    }
    let mut size = None;
    let mut samples = None;
    for attachment in attachments {
        let Some(desc) = attachment.texture else {
            return FramebufferStatus::IncompleteAttachment;
        };
        let wants_depth = !matches!(attachment.point, AttachmentPoint::Color(_));
        if desc.format.is_depth() != wants_depth {
            return FramebufferStatus::IncompleteAttachment;
        }
        if attachment.point == AttachmentPoint::DepthStencil && !desc.format.has_stencil() {
            return FramebufferStatus::IncompleteAttachment;
        }
        let level = attachment.target.level();
        if level >= desc.mip_levels() || attachment.target.layer() >= desc.layers_at(level) {
            return FramebufferStatus::IncompleteAttachment;
        }
        let level_size = desc.level_size(level);
        if *size.get_or_insert(level_size) != level_size {
            return FramebufferStatus::IncompleteDimensions;
        }
        if *samples.get_or_insert(desc.samples) != desc.samples {
            return FramebufferStatus::IncompleteMultisample;
        }
    }
    FramebufferStatus::Complete
}

/// Values for `clear`; `None` leaves that aspect untouched.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClearValue {
    pub color: Option<[f32; 4]>,
    pub depth: Option<f32>,
}

impl ClearValue {
    pub fn color(color: [f32; 4]) -> Self {
        Self {
            color: Some(color),
            depth: None,
        }
    }

    pub fn color_depth(color: [f32; 4], depth: f32) -> Self {
        Self {
            color: Some(color),
            depth: Some(depth),
        }
    }

    pub fn depth(depth: f32) -> Self {
        Self {
            color: None,
            depth: Some(depth),
        }
    }
}

/// Rectangle for blits; `x1 < x0` mirrors horizontally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlitRect {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl BlitRect {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            x0: 0,
            y0: 0,
            x1: width as i32,
            y1: height as i32,
        }
    }

    pub fn mirrored_x(self) -> Self {
        Self {
            x0: self.x1,
            x1: self.x0,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlitMask {
    pub color: bool,
    pub depth: bool,
}

impl BlitMask {
    pub const COLOR: Self = Self {
        color: true,
        depth: false,
    };
    pub const DEPTH: Self = Self {
        color: false,
        depth: true,
    };
}

/// Kinds of declared shader uniforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformKind {
    Bool,
    Int,
    UInt,
    Float,
    Vec2,
    Vec3,
    Vec4,
    IVec2,
    IVec3,
    IVec4,
    Mat2,
    Mat3,
    Mat4,
    Sampler2D,
    /// 2D texture read without filtering (depth, 32-bit float targets).
    Sampler2DUnfilterable,
    Sampler2DArray,
    Sampler3D,
    SamplerCube,
    Sampler2DMultisample,
}

impl UniformKind {
    pub fn is_sampler(&self) -> bool {
        matches!(
            self,
            UniformKind::Sampler2D
                | UniformKind::Sampler2DUnfilterable
                | UniformKind::Sampler2DArray
                | UniformKind::Sampler3D
                | UniformKind::SamplerCube
                | UniformKind::Sampler2DMultisample
        )
    }

    /// Parse a material-file type name.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "bool" | "Bool" => UniformKind::Bool,
            "int" | "Int" => UniformKind::Int,
            "uint" | "UInt" => UniformKind::UInt,
            "float" | "Float" => UniformKind::Float,
            "vec2" | "Vector2" => UniformKind::Vec2,
            "vec3" | "Vector3" => UniformKind::Vec3,
            "vec4" | "Vector4" => UniformKind::Vec4,
            "ivec2" => UniformKind::IVec2,
            "ivec3" => UniformKind::IVec3,
            "ivec4" => UniformKind::IVec4,
            "mat2" | "Matrix2" => UniformKind::Mat2,
            "mat3" | "Matrix3" => UniformKind::Mat3,
            "mat4" | "Matrix4" => UniformKind::Mat4,
            "sampler2D" | "Texture2D" => UniformKind::Sampler2D,
            "sampler2DArray" | "Texture2DArray" => UniformKind::Sampler2DArray,
            "sampler3D" | "Texture3D" => UniformKind::Sampler3D,
            "samplerCube" | "TextureCube" => UniformKind::SamplerCube,
            "sampler2DMS" | "Texture2DMultiSample" => UniformKind::Sampler2DMultisample,
            _ => return None,
        })
    }

    /// Section name used by material-instance files.
    pub fn section_name(&self) -> &'static str {
        match self {
            UniformKind::Bool => "Bool",
            UniformKind::Int | UniformKind::IVec2 | UniformKind::IVec3 | UniformKind::IVec4 => {
                "Int"
            }
            UniformKind::UInt => "UInt",
            UniformKind::Float => "Float",
            UniformKind::Vec2 => "Vector2",
            UniformKind::Vec3 => "Vector3",
            UniformKind::Vec4 => "Vector4",
            UniformKind::Mat2 => "Matrix2",
            UniformKind::Mat3 => "Matrix3",
            UniformKind::Mat4 => "Matrix4",
            UniformKind::Sampler2D | UniformKind::Sampler2DUnfilterable => "Texture2D",
            UniformKind::Sampler2DArray => "Texture2DArray",
            UniformKind::Sampler3D => "Texture3D",
            UniformKind::SamplerCube => "TextureCube",
            UniformKind::Sampler2DMultisample => "Texture2DMultiSample",
        }
    }

    /// Size and alignment of one element in the WGSL uniform address space.
    pub fn layout(&self) -> (u32, u32) {
        match self {
            UniformKind::Bool | UniformKind::Int | UniformKind::UInt | UniformKind::Float => {
                (4, 4)
            }
            UniformKind::Vec2 | UniformKind::IVec2 => (8, 8),
            UniformKind::Vec3 | UniformKind::IVec3 => (12, 16),
            UniformKind::Vec4 | UniformKind::IVec4 => (16, 16),
            UniformKind::Mat2 => (16, 8),
            UniformKind::Mat3 => (48, 16),
            UniformKind::Mat4 => (64, 16),
            _ => (0, 0),
        }
    }

    /// WGSL type spelling used by the generated material struct.
    pub fn wgsl_type(&self) -> &'static str {
        match self {
            UniformKind::Bool | UniformKind::Int => "i32",
            UniformKind::UInt => "u32",
            UniformKind::Float => "f32",
            UniformKind::Vec2 => "vec2<f32>",
            UniformKind::Vec3 => "vec3<f32>",
            UniformKind::Vec4 => "vec4<f32>",
            UniformKind::IVec2 => "vec2<i32>",
            UniformKind::IVec3 => "vec3<i32>",
            UniformKind::IVec4 => "vec4<i32>",
            UniformKind::Mat2 => "mat2x2<f32>",
            UniformKind::Mat3 => "mat3x3<f32>",
            UniformKind::Mat4 => "mat4x4<f32>",
            UniformKind::Sampler2D => "texture_2d<f32>",
            UniformKind::Sampler2DUnfilterable => "texture_2d<f32>",
            UniformKind::Sampler2DArray => "texture_2d_array<f32>",
            UniformKind::Sampler3D => "texture_3d<f32>",
            UniformKind::SamplerCube => "texture_cube<f32>",
            UniformKind::Sampler2DMultisample => "texture_multisampled_2d<f32>",
        }
    }
}

/// A uniform declared by a program
#[derive(Debug, Clone, PartialEq)]
pub struct UniformDecl {
    pub name: String,
    pub kind: UniformKind,
    pub count: u32,
}

impl UniformDecl {
    pub fn new(name: &str, kind: UniformKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            count: 1,
        }
    }

    pub fn array(name: &str, kind: UniformKind, count: u32) -> Self {
        Self {
            name: name.to_string(),
            kind,
            count,
        }
    }
}

/// Reflected uniform with its location inside the program
#[derive(Debug, Clone, PartialEq)]
pub struct UniformInfo {
    pub name: String,
    pub kind: UniformKind,
    pub count: u32,
    pub location: UniformLocation,
}

/// Index of a uniform inside its program's declaration list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniformLocation(pub u32);

/// Data uploaded to a single uniform
#[derive(Debug, Clone, PartialEq)]
pub enum UniformData {
    Bool(bool),
    Int(i32),
    UInt(u32),
    Float(f32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    IVec2([i32; 2]),
    IVec3([i32; 3]),
    IVec4([i32; 4]),
    Mat2([f32; 4]),
    Mat3([f32; 9]),
    Mat4([f32; 16]),
    Vec3Array(Vec<[f32; 3]>),
    Vec4Array(Vec<[f32; 4]>),
    Mat4Array(Vec<[f32; 16]>),
    /// Texture unit for a sampler uniform.
    TextureUnit(u32),
}

impl UniformData {
    /// Whether this payload can be uploaded to a uniform of `kind`.
    pub fn matches(&self, kind: UniformKind) -> bool {
        match self {
            UniformData::Bool(_) => kind == UniformKind::Bool,
            UniformData::Int(_) => matches!(kind, UniformKind::Int | UniformKind::Bool),
            UniformData::UInt(_) => kind == UniformKind::UInt,
            UniformData::Float(_) => kind == UniformKind::Float,
            UniformData::Vec2(_) => kind == UniformKind::Vec2,
            UniformData::Vec3(_) | UniformData::Vec3Array(_) => kind == UniformKind::Vec3,
            UniformData::Vec4(_) | UniformData::Vec4Array(_) => kind == UniformKind::Vec4,
            UniformData::IVec2(_) => kind == UniformKind::IVec2,
            UniformData::IVec3(_) => kind == UniformKind::IVec3,
            UniformData::IVec4(_) => kind == UniformKind::IVec4,
            UniformData::Mat2(_) => kind == UniformKind::Mat2,
            UniformData::Mat3(_) => kind == UniformKind::Mat3,
            UniformData::Mat4(_) | UniformData::Mat4Array(_) => kind == UniformKind::Mat4,
            UniformData::TextureUnit(_) => kind.is_sampler(),
        }
    }

    /// Write into a uniform buffer image using the WGSL uniform layout.
    /// `stride` is the array element stride for array payloads.
    pub fn write_std(&self, out: &mut [u8], stride: usize) {
        fn put(out: &mut [u8], offset: usize, values: &[f32]) {
            for (i, v) in values.iter().enumerate() {
                let at = offset + i * 4;
                if at + 4 <= out.len() {
                    out[at..at + 4].copy_from_slice(&v.to_le_bytes());
                }
            }
        }
        fn put_i(out: &mut [u8], offset: usize, values: &[i32]) {
            for (i, v) in values.iter().enumerate() {
                let at = offset + i * 4;
                if at + 4 <= out.len() {
                    out[at..at + 4].copy_from_slice(&v.to_le_bytes());
                }
            }
        }
        match self {
            UniformData::Bool(v) => put_i(out, 0, &[*v as i32]),
            UniformData::Int(v) => put_i(out, 0, &[*v]),
            UniformData::UInt(v) => {
                if out.len() >= 4 {
                    out[0..4].copy_from_slice(&v.to_le_bytes());
                }
            }
            UniformData::Float(v) => put(out, 0, &[*v]),
            UniformData::Vec2(v) => put(out, 0, v),
            UniformData::Vec3(v) => put(out, 0, v),
            UniformData::Vec4(v) => put(out, 0, v),
            UniformData::IVec2(v) => put_i(out, 0, v),
            UniformData::IVec3(v) => put_i(out, 0, v),
            UniformData::IVec4(v) => put_i(out, 0, v),
            UniformData::Mat2(v) => put(out, 0, v),
            // mat3x3 columns are padded to vec4
            UniformData::Mat3(v) => {
                for column in 0..3 {
                    put(out, column * 16, &v[column * 3..column * 3 + 3]);
                }
            }
            UniformData::Mat4(v) => put(out, 0, v),
            UniformData::Vec3Array(values) => {
                for (i, v) in values.iter().enumerate() {
                    put(out, i * stride, v);
                }
            }
            UniformData::Vec4Array(values) => {
                for (i, v) in values.iter().enumerate() {
                    put(out, i * stride, v);
                }
            }
            UniformData::Mat4Array(values) => {
                for (i, v) in values.iter().enumerate() {
                    put(out, i * stride, v);
                }
            }
            UniformData::TextureUnit(_) => {}
        }
    }
}

/// Stages of a program
#[derive(Debug, Clone, PartialEq)]
pub enum ProgramStages {
    Graphics {
        vertex: String,
        fragment: String,
        /// Number of fragment outputs written by the shader.
        color_outputs: u32,
    },
    Compute {
        source: String,
        workgroup_size: u32,
    },
}

/// Storage buffer declared by a program
#[derive(Debug, Clone, PartialEq)]
pub struct StorageDecl {
    pub name: String,
    pub binding: u32,
    pub struct_source: String,
    pub read_only: bool,
}

/// Program creation input
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramDescriptor {
    pub name: String,
    pub stages: ProgramStages,
    pub uniforms: Vec<UniformDecl>,
    pub storage: Vec<StorageDecl>,
    pub defines: Vec<(String, String)>,
}

impl ProgramDescriptor {
    pub fn graphics(name: &str, vertex: &str, fragment: &str, color_outputs: u32) -> Self {
        Self {
            name: name.to_string(),
            stages: ProgramStages::Graphics {
                vertex: vertex.to_string(),
                fragment: fragment.to_string(),
                color_outputs,
            },
            uniforms: Vec::new(),
            storage: Vec::new(),
            defines: Vec::new(),
        }
    }

    pub fn compute(name: &str, source: &str, workgroup_size: u32) -> Self {
        Self {
            name: name.to_string(),
            stages: ProgramStages::Compute {
                source: source.to_string(),
                workgroup_size,
            },
            uniforms: Vec::new(),
            storage: Vec::new(),
            defines: Vec::new(),
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
        self.defines.push((name.to_string(), value.to_string()));
        self
    }

    pub fn is_compute(&self) -> bool {
        matches!(self.stages, ProgramStages::Compute { .. })
    }
}

/// Vertex attribute format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
}

impl VertexFormat {
    pub fn size(&self) -> u64 {
        match self {
            VertexFormat::Float32 => 4,
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }

    pub fn from_components(components: usize) -> Option<Self> {
        match components {
            1 => Some(VertexFormat::Float32),
            2 => Some(VertexFormat::Float32x2),
            3 => Some(VertexFormat::Float32x3),
            4 => Some(VertexFormat::Float32x4),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u64,
}

/// A vertex stream: stride plus attributes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    pub stride: u64,
    pub attributes: Vec<VertexAttribute>,
}

/// Per-instance stream; every attribute advances once per instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceStream {
    pub buffer: BufferHandle,
    pub layout: VertexLayout,
    pub divisor: u32,
}

#[derive(Debug, Clone)]
pub struct VertexArrayDescriptor {
    pub label: String,
    pub vertex_buffer: BufferHandle,
    pub layout: VertexLayout,
    pub index_buffer: BufferHandle,
    pub index_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveMode {
    Triangles,
    Lines,
    Points,
}

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a GPU texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to a framebuffer object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferHandle(pub(crate) u64);

/// Handle to a linked program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramHandle(pub(crate) u64);

/// Handle to a vertex array object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexArrayHandle(pub(crate) u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mip_levels() {
        let mut desc = TextureDescriptor {
            width: 256,
            height: 128,
            ..Default::default()
        };
        assert_eq!(desc.mip_levels(), 1);
        desc.sampler.min_filter = FilterMode::LinearMipmapLinear;
        assert_eq!(desc.mip_levels(), 9);
        desc.target = TextureTarget::D2Multisample;
        assert!(!desc.enable_mipmap());
    }

    #[test]
    fn test_half_texel_roundtrip() {
        let mut texel = [0u8; 8];
        TextureFormat::Rgba16Float.encode_texel([0.5, -2.0, 1.0, 0.25], &mut texel);
        assert_eq!(
            TextureFormat::Rgba16Float.decode_texel(&texel),
            [0.5, -2.0, 1.0, 0.25]
        );
    }

    #[test]
    fn test_uniform_matching() {
        assert!(UniformData::Float(1.0).matches(UniformKind::Float));
        assert!(!UniformData::Float(1.0).matches(UniformKind::Vec2));
        assert!(UniformData::TextureUnit(3).matches(UniformKind::SamplerCube));
        assert!(UniformData::Mat4Array(vec![]).matches(UniformKind::Mat4));
    }

    #[test]
    fn test_mat3_padding() {
        let mut out = [0u8; 48];
        UniformData::Mat3([1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]).write_std(&mut out, 0);
        let floats: Vec<f32> = out
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(&floats[0..3], &[1.0, 2.0, 3.0]);
        assert_eq!(floats[3], 0.0);
        assert_eq!(&floats[4..7], &[4.0, 5.0, 6.0]);
    }
}
