//! Texture objects and the named texture store

use std::collections::HashMap;
use std::path::Path;

use image::{DynamicImage, GenericImageView};
use slotmap::{new_key_type, SlotMap};

use crate::backend::*;
use crate::error::{RenderError, RenderResult};

new_key_type! {
    /// Id of a texture owned by a [`TextureStore`]
    pub struct TextureId;
}

pub const FLAT_WHITE: &str = "common.flat_white";
pub const FLAT_BLACK: &str = "common.flat_black";
pub const FLAT_NORMAL: &str = "common.flat_normal";
pub const DEFAULT_2D_ARRAY: &str = "default_2d_array";
pub const DEFAULT_3D: &str = "default_3d";
pub const DEFAULT_CUBE: &str = "default_cube";
pub const DEFAULT_2D_MS: &str = "default_2d_ms";

/// A GPU texture together with the descriptor it was created from
#[derive(Debug, Clone)]
pub struct Texture {
    pub name: String,
    pub handle: TextureHandle,
    pub desc: TextureDescriptor,
}

impl Texture {
    /// Create the texture and upload `data` (every layer of level 0, tightly
    /// packed). Mipmaps are generated after an upload when the min filter asks
    /// for them.
    pub fn create(
        backend: &mut dyn GraphicsBackend,
        desc: TextureDescriptor,
        data: Option<&[u8]>,
    ) -> RenderResult<Self> {
        let handle = backend.create_texture(&desc)?;
        let texture = Self {
            name: desc.label.clone(),
            handle,
            desc,
        };
        if let Some(data) = data {
            let expected = texture.layer_bytes(0) * texture.desc.layers() as usize;
            if data.len() != expected {
                backend.destroy_texture(handle);
                return Err(RenderError::TextureFile {
                    path: texture.name.clone(),
                    message: format!("{} bytes of pixel data, expected {}", data.len(), expected),
                });
            }
            backend.write_texture(handle, 0, 0, data)?;
            if texture.desc.enable_mipmap() {
                backend.generate_mipmaps(handle)?;
            }
        }
        log::debug!(
            "Created texture {} {:?} {}x{}x{} {:?}",
            texture.name,
            texture.desc.target,
            texture.desc.width,
            texture.desc.height,
            texture.desc.depth,
            texture.desc.format
        );
        Ok(texture)
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn format(&self) -> TextureFormat {
        self.desc.format
    }

    pub fn target(&self) -> TextureTarget {
        self.desc.target
    }

    pub fn samples(&self) -> u32 {
        self.desc.samples
    }

    pub fn size(&self) -> (u32, u32) {
        (self.desc.width, self.desc.height)
    }

    /// Bytes of one layer at `level`.
    pub fn layer_bytes(&self, level: u32) -> usize {
        let (w, h) = self.desc.level_size(level);
        w as usize * h as usize * self.desc.format.bytes_per_pixel() as usize
    }

    /// Sampler uniform kind that can read this texture.
    pub fn uniform_kind(&self) -> UniformKind {
        match self.desc.target {
            TextureTarget::D2 => match self.desc.format {
                TextureFormat::Depth32Float
                | TextureFormat::Depth24PlusStencil8
                | TextureFormat::R32Float
                | TextureFormat::Rg32Float
                | TextureFormat::Rgba32Float => UniformKind::Sampler2DUnfilterable,
                _ => UniformKind::Sampler2D,
            },
            TextureTarget::D2Array => UniformKind::Sampler2DArray,
            TextureTarget::D3 => UniformKind::Sampler3D,
            TextureTarget::Cube => UniformKind::SamplerCube,
            TextureTarget::D2Multisample => UniformKind::Sampler2DMultisample,
        }
    }

    pub fn generate_mipmap(&self, backend: &mut dyn GraphicsBackend) -> RenderResult<()> {
        if self.desc.enable_mipmap() {
            backend.generate_mipmaps(self.handle)?;
        }
        Ok(())
    }

    /// Raw bytes of one layer and level.
    pub fn get_image_data(
        &self,
        backend: &mut dyn GraphicsBackend,
        layer: u32,
        level: u32,
    ) -> RenderResult<Vec<u8>> {
        Ok(backend.read_texture(self.handle, layer, level)?)
    }

    /// Decoded texels of one layer and level, row-major from the top-left.
    pub fn read_texels(
        &self,
        backend: &mut dyn GraphicsBackend,
        layer: u32,
        level: u32,
    ) -> RenderResult<Vec<[f32; 4]>> {
        let bytes = self.get_image_data(backend, layer, level)?;
        let bpp = self.desc.format.bytes_per_pixel() as usize;
        Ok(bytes
            .chunks_exact(bpp)
            .map(|texel| self.desc.format.decode_texel(texel))
            .collect())
    }

    pub fn destroy(&self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_texture(self.handle);
    }
}

/// Codes used by the binary texture container
const VIEW_TYPES: [TextureTarget; 5] = [
    TextureTarget::D2,
    TextureTarget::D3,
    TextureTarget::Cube,
    TextureTarget::D2Array,
    TextureTarget::D2Multisample,
];

const FORMATS: [TextureFormat; 10] = [
    TextureFormat::Rgba8Unorm,
    TextureFormat::Rgba8UnormSrgb,
    TextureFormat::R16Float,
    TextureFormat::Rg16Float,
    TextureFormat::Rgba16Float,
    TextureFormat::R32Float,
    TextureFormat::Rg32Float,
    TextureFormat::Rgba32Float,
    TextureFormat::Depth32Float,
    TextureFormat::Depth24PlusStencil8,
];

const FILTERS: [FilterMode; 6] = [
    FilterMode::Nearest,
    FilterMode::Linear,
    FilterMode::NearestMipmapNearest,
    FilterMode::LinearMipmapNearest,
    FilterMode::NearestMipmapLinear,
    FilterMode::LinearMipmapLinear,
];

const WRAPS: [WrapMode; 4] = [
    WrapMode::Repeat,
    WrapMode::MirroredRepeat,
    WrapMode::ClampToEdge,
    WrapMode::ClampToBorder,
];

const HEADER_LEN: usize = 10 * 4;

fn code_of<T: PartialEq>(table: &[T], value: &T) -> i32 {
    table.iter().position(|v| v == value).unwrap_or(0) as i32
}

/// Serialize a texture into the binary container: ten little-endian i32
/// (view type, width, height, depth, format, enable mipmap, min filter,
/// mag filter, wrap, data bytes) followed by the pixel data.
pub fn encode_texture_file(desc: &TextureDescriptor, data: &[u8]) -> Vec<u8> {
    let header = [
        code_of(&VIEW_TYPES, &desc.target),
        desc.width as i32,
        desc.height as i32,
        desc.depth as i32,
        code_of(&FORMATS, &desc.format),
        desc.enable_mipmap() as i32,
        code_of(&FILTERS, &desc.sampler.min_filter),
        code_of(&FILTERS, &desc.sampler.mag_filter),
        code_of(&WRAPS, &desc.sampler.wrap),
        data.len() as i32,
    ];
    let mut out = Vec::with_capacity(HEADER_LEN + data.len());
    for value in header {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out.extend_from_slice(data);
    out
}

/// Parse the binary texture container.
pub fn parse_texture_file(name: &str, bytes: &[u8]) -> RenderResult<(TextureDescriptor, Vec<u8>)> {
    let invalid = |message: String| RenderError::TextureFile {
        path: name.to_string(),
        message,
    };
    if bytes.len() < HEADER_LEN {
        return Err(invalid(format!("{} bytes is shorter than the header", bytes.len())));
    }
    let field = |i: usize| {
        i32::from_le_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]])
    };
    let lookup = |what: &str, index: usize| -> RenderResult<usize> {
        usize::try_from(field(index)).map_err(|_| invalid(format!("negative {}", what)))
    };
    let target = *VIEW_TYPES
        .get(lookup("view type", 0)?)
        .ok_or_else(|| invalid(format!("unknown view type {}", field(0))))?;
    let format = *FORMATS
        .get(lookup("format", 4)?)
        .ok_or_else(|| invalid(format!("unknown format {}", field(4))))?;
    let mut min_filter = *FILTERS
        .get(lookup("min filter", 6)?)
        .ok_or_else(|| invalid(format!("unknown min filter {}", field(6))))?;
    let mag_filter = *FILTERS
        .get(lookup("mag filter", 7)?)
        .ok_or_else(|| invalid(format!("unknown mag filter {}", field(7))))?;
    let wrap = *WRAPS
        .get(lookup("wrap", 8)?)
        .ok_or_else(|| invalid(format!("unknown wrap {}", field(8))))?;
    let enable_mipmap = field(5) != 0;
    if enable_mipmap && !min_filter.is_mipmap() {
        min_filter = FilterMode::LinearMipmapLinear;
    } else if !enable_mipmap && min_filter.is_mipmap() {
        min_filter = FilterMode::Linear;
    }
    let (width, height, depth) = (lookup("width", 1)?, lookup("height", 2)?, lookup("depth", 3)?);
    let data_bytes = lookup("data size", 9)?;
    let data = bytes
        .get(HEADER_LEN..HEADER_LEN + data_bytes)
        .ok_or_else(|| invalid(format!("truncated pixel data, expected {} bytes", data_bytes)))?;
    let desc = TextureDescriptor {
        label: name.to_string(),
        target,
        width: width as u32,
        height: height as u32,
        depth: depth.max(1) as u32,
        format,
        sampler: SamplerState {
            min_filter,
            mag_filter,
            wrap,
            border_color: [0.0; 4],
        },
        samples: 1,
        attachment: false,
    };
    Ok((desc, data.to_vec()))
}

/// Descriptor and RGBA8 pixels for a decoded image file.
pub fn image_texture_data(name: &str, image: &DynamicImage, srgb: bool) -> (TextureDescriptor, Vec<u8>) {
    let (width, height) = image.dimensions();
    let desc = TextureDescriptor {
        label: name.to_string(),
        width,
        height,
        format: if srgb {
            TextureFormat::Rgba8UnormSrgb
        } else {
            TextureFormat::Rgba8Unorm
        },
        sampler: SamplerState {
            min_filter: FilterMode::LinearMipmapLinear,
            ..Default::default()
        },
        ..Default::default()
    };
    (desc, image.to_rgba8().into_raw())
}

/// Arena of named textures
#[derive(Default)]
pub struct TextureStore {
    textures: SlotMap<TextureId, Texture>,
    names: HashMap<String, TextureId>,
}

impl TextureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the fallback textures used for unset sampler uniforms.
    pub fn create_default_textures(&mut self, backend: &mut dyn GraphicsBackend) -> RenderResult<()> {
        let solid = |name: &str, target: TextureTarget, depth: u32| TextureDescriptor {
            label: name.to_string(),
            target,
            width: 2,
            height: 2,
            depth,
            format: TextureFormat::Rgba8Unorm,
            sampler: SamplerState {
                min_filter: FilterMode::Nearest,
                mag_filter: FilterMode::Nearest,
                ..Default::default()
            },
            ..Default::default()
        };
        let filled = |color: [u8; 4], texels: usize| -> Vec<u8> {
            std::iter::repeat(color).take(texels).flatten().collect()
        };
        let defaults = [
            (solid(FLAT_WHITE, TextureTarget::D2, 1), [255, 255, 255, 255], 4),
            (solid(FLAT_BLACK, TextureTarget::D2, 1), [0, 0, 0, 255], 4),
            (solid(FLAT_NORMAL, TextureTarget::D2, 1), [128, 128, 255, 255], 4),
            (solid(DEFAULT_2D_ARRAY, TextureTarget::D2Array, 2), [255, 255, 255, 255], 8),
            (solid(DEFAULT_3D, TextureTarget::D3, 2), [255, 255, 255, 255], 8),
            (solid(DEFAULT_CUBE, TextureTarget::Cube, 1), [255, 255, 255, 255], 24),
        ];
        for (desc, color, texels) in defaults {
            let data = filled(color, texels);
            let texture = Texture::create(backend, desc, Some(&data))?;
            self.insert(backend, texture);
        }
        let multisample = Texture::create(
            backend,
            TextureDescriptor {
                label: DEFAULT_2D_MS.to_string(),
                target: TextureTarget::D2Multisample,
                width: 2,
                height: 2,
                format: TextureFormat::Rgba16Float,
                samples: 4,
                attachment: true,
                ..Default::default()
            },
            None,
        )?;
        self.insert(backend, multisample);
        Ok(())
    }

    /// Store a texture under its name; a texture already holding the name is destroyed.
    pub fn insert(&mut self, backend: &mut dyn GraphicsBackend, texture: Texture) -> TextureId {
        if let Some(old) = self.names.get(&texture.name).copied() {
            if let Some(old) = self.textures.remove(old) {
                log::debug!("Replacing texture {}", old.name);
                old.destroy(backend);
            }
        }
        let name = texture.name.clone();
        let id = self.textures.insert(texture);
        self.names.insert(name, id);
        id
    }

    pub fn create(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        desc: TextureDescriptor,
        data: Option<&[u8]>,
    ) -> RenderResult<TextureId> {
        let texture = Texture::create(backend, desc, data)?;
        Ok(self.insert(backend, texture))
    }

    /// Load a binary texture container (`.texture`) or any image format the
    /// `image` crate decodes. The texture is named after the file stem.
    pub fn load_file(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        path: impl AsRef<Path>,
    ) -> RenderResult<TextureId> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let (desc, data) = if path.extension().is_some_and(|e| e == "texture") {
            let bytes = std::fs::read(path)?;
            parse_texture_file(&name, &bytes)?
        } else {
            let image = image::open(path).map_err(|e| RenderError::TextureFile {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            image_texture_data(&name, &image, true)
        };
        log::info!("Loaded texture {} from {}", name, path.display());
        self.create(backend, desc, Some(&data))
    }

    pub fn get(&self, id: TextureId) -> Option<&Texture> {
        self.textures.get(id)
    }

    pub fn id_of(&self, name: &str) -> Option<TextureId> {
        self.names.get(name).copied()
    }

    pub fn by_name(&self, name: &str) -> Option<&Texture> {
        self.id_of(name).and_then(|id| self.textures.get(id))
    }

    /// Default texture bound to an unset sampler of `kind`.
    pub fn default_for(&self, kind: UniformKind) -> Option<&Texture> {
        let name = match kind {
            UniformKind::Sampler2DArray => DEFAULT_2D_ARRAY,
            UniformKind::Sampler3D => DEFAULT_3D,
            UniformKind::SamplerCube => DEFAULT_CUBE,
            UniformKind::Sampler2DMultisample => DEFAULT_2D_MS,
            _ => FLAT_WHITE,
        };
        self.by_name(name)
    }

    /// Destroy the texture holding `name`.
    pub fn remove(&mut self, backend: &mut dyn GraphicsBackend, name: &str) -> bool {
        match self.names.remove(name).and_then(|id| self.textures.remove(id)) {
            Some(texture) => {
                texture.destroy(backend);
                true
            }
            None => false,
        }
    }

    /// Texture names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.names.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    pub fn clear(&mut self, backend: &mut dyn GraphicsBackend) {
        for (_, texture) in self.textures.drain() {
            texture.destroy(backend);
        }
        self.names.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;

    #[test]
    fn test_defaults_cover_every_sampler_kind() {
        let mut backend = DummyBackend::new(4, 4);
        let mut store = TextureStore::new();
        store.create_default_textures(&mut backend).unwrap();
        for kind in [
            UniformKind::Sampler2D,
            UniformKind::Sampler2DArray,
            UniformKind::Sampler3D,
            UniformKind::SamplerCube,
            UniformKind::Sampler2DMultisample,
        ] {
            let texture = store.default_for(kind).unwrap();
            assert_eq!(texture.uniform_kind(), kind, "{}", texture.name);
        }
        let white = store.by_name(FLAT_WHITE).unwrap();
        assert_eq!(white.read_texels(&mut backend, 0, 0).unwrap()[0], [1.0; 4]);
    }

    #[test]
    fn test_replacing_a_name_destroys_the_old_texture() {
        let mut backend = DummyBackend::new(4, 4);
        let mut store = TextureStore::new();
        let desc = TextureDescriptor {
            label: "albedo".into(),
            ..Default::default()
        };
        let first = store.create(&mut backend, desc.clone(), None).unwrap();
        let second = store.create(&mut backend, desc, None).unwrap();
        assert!(store.get(first).is_none());
        assert_eq!(store.id_of("albedo"), Some(second));
        assert_eq!(backend.live_textures(), 1);
        assert!(store.remove(&mut backend, "albedo"));
        assert_eq!(backend.live_textures(), 0);
        assert!(!store.remove(&mut backend, "albedo"));
    }

    #[test]
    fn test_texture_file_roundtrip() {
        let desc = TextureDescriptor {
            label: "noise".into(),
            width: 2,
            height: 1,
            format: TextureFormat::Rgba16Float,
            sampler: SamplerState {
                min_filter: FilterMode::LinearMipmapLinear,
                wrap: WrapMode::ClampToEdge,
                ..Default::default()
            },
            ..Default::default()
        };
        let data: Vec<u8> = (0..16).collect();
        let bytes = encode_texture_file(&desc, &data);
        assert_eq!(bytes.len(), 40 + 16);
        let (parsed, pixels) = parse_texture_file("noise", &bytes).unwrap();
        assert_eq!(parsed.format, TextureFormat::Rgba16Float);
        assert_eq!(parsed.sampler.wrap, WrapMode::ClampToEdge);
        assert!(parsed.enable_mipmap());
        assert_eq!((parsed.width, parsed.height), (2, 1));
        assert_eq!(pixels, data);
    }

    #[test]
    fn test_truncated_texture_file_is_rejected() {
        let desc = TextureDescriptor::default();
        let mut bytes = encode_texture_file(&desc, &[0; 4]);
        bytes.truncate(42);
        assert!(matches!(
            parse_texture_file("short", &bytes),
            Err(RenderError::TextureFile { .. })
        ));
        assert!(parse_texture_file("tiny", &[0; 8]).is_err());
    }

    #[test]
    fn test_upload_size_is_checked() {
        let mut backend = DummyBackend::new(4, 4);
        let desc = TextureDescriptor {
            label: "bad".into(),
            width: 2,
            height: 2,
            ..Default::default()
        };
        assert!(Texture::create(&mut backend, desc, Some(&[0; 3])).is_err());
        assert_eq!(backend.live_textures(), 0);
    }
}
