//! Named render-target slots and the temporary-target cache

use std::collections::{BTreeMap, HashMap};

use crate::backend::*;
use crate::error::{RenderError, RenderResult};
use crate::ocean::FFT_SIZE;
use crate::resources::texture::Texture;
use crate::AntiAliasing;

pub const MSAA_SAMPLES: u32 = 4;
pub const SHADOW_MAP_SIZE: u32 = 2048;
pub const LIGHT_PROBE_SIZE: u32 = 256;
pub const FFT_LAYERS: u32 = 5;
pub const SSAO_NOISE_SIZE: u32 = 4;

/// Every named render target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RenderTargetSlot {
    Backbuffer,
    Depth,
    DepthMs,
    Hdr,
    HdrTemp,
    HdrPrev,
    HdrResolve,
    TaaResolve,
    Diffuse,
    Material,
    WorldNormal,
    Velocity,
    LinearDepth,
    ScreenSpaceReflection,
    SsrResolved,
    SsrResolvedPrev,
    Ssao,
    SsaoNoise,
    Bloom0,
    Bloom1,
    Bloom2,
    Bloom3,
    Bloom4,
    StaticShadowmap,
    DynamicShadowmap,
    CompositeShadowmap,
    Atmosphere,
    AtmosphereInscatter,
    LightProbeAtmosphere,
    ObjectId,
    FftA,
    FftB,
}

/// How a slot derives its size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotSize {
    Full,
    /// Full size divided by the factor
    Scaled(u32),
    Fixed(u32, u32),
}

#[derive(Debug, Clone, Copy)]
struct SlotSpec {
    format: TextureFormat,
    target: TextureTarget,
    size: SlotSize,
    layers: u32,
    sampler: SamplerState,
    /// Doubled in each axis under SSAA
    ssaa: bool,
    /// Multisampled under MSAA
    msaa: bool,
    /// Only exists under MSAA
    msaa_only: bool,
    /// Survives resize
    immutable: bool,
}

fn sampler(min_filter: FilterMode, mag_filter: FilterMode, wrap: WrapMode) -> SamplerState {
    SamplerState {
        min_filter,
        mag_filter,
        wrap,
        border_color: [0.0; 4],
    }
}

impl RenderTargetSlot {
    pub const ALL: [RenderTargetSlot; 32] = [
        RenderTargetSlot::Backbuffer,
        RenderTargetSlot::Depth,
        RenderTargetSlot::DepthMs,
        RenderTargetSlot::Hdr,
        RenderTargetSlot::HdrTemp,
        RenderTargetSlot::HdrPrev,
        RenderTargetSlot::HdrResolve,
        RenderTargetSlot::TaaResolve,
        RenderTargetSlot::Diffuse,
        RenderTargetSlot::Material,
        RenderTargetSlot::WorldNormal,
        RenderTargetSlot::Velocity,
        RenderTargetSlot::LinearDepth,
        RenderTargetSlot::ScreenSpaceReflection,
        RenderTargetSlot::SsrResolved,
        RenderTargetSlot::SsrResolvedPrev,
        RenderTargetSlot::Ssao,
        RenderTargetSlot::SsaoNoise,
        RenderTargetSlot::Bloom0,
        RenderTargetSlot::Bloom1,
        RenderTargetSlot::Bloom2,
        RenderTargetSlot::Bloom3,
        RenderTargetSlot::Bloom4,
        RenderTargetSlot::StaticShadowmap,
        RenderTargetSlot::DynamicShadowmap,
        RenderTargetSlot::CompositeShadowmap,
        RenderTargetSlot::Atmosphere,
        RenderTargetSlot::AtmosphereInscatter,
        RenderTargetSlot::LightProbeAtmosphere,
        RenderTargetSlot::ObjectId,
        RenderTargetSlot::FftA,
        RenderTargetSlot::FftB,
    ];

    pub const BLOOM: [RenderTargetSlot; 5] = [
        RenderTargetSlot::Bloom0,
        RenderTargetSlot::Bloom1,
        RenderTargetSlot::Bloom2,
        RenderTargetSlot::Bloom3,
        RenderTargetSlot::Bloom4,
    ];

    /// Shadow map sampled by shading passes
    pub const SHADOWMAP: RenderTargetSlot = RenderTargetSlot::CompositeShadowmap;

    pub fn name(&self) -> &'static str {
        match self {
            RenderTargetSlot::Backbuffer => "BACKBUFFER",
            RenderTargetSlot::Depth => "DEPTH",
            RenderTargetSlot::DepthMs => "DEPTH_MS",
            RenderTargetSlot::Hdr => "HDR",
            RenderTargetSlot::HdrTemp => "HDR_TEMP",
            RenderTargetSlot::HdrPrev => "HDR_PREV",
            RenderTargetSlot::HdrResolve => "HDR_RESOLVE",
            RenderTargetSlot::TaaResolve => "TAA_RESOLVE",
            RenderTargetSlot::Diffuse => "DIFFUSE",
            RenderTargetSlot::Material => "MATERIAL",
            RenderTargetSlot::WorldNormal => "WORLD_NORMAL",
            RenderTargetSlot::Velocity => "VELOCITY",
            RenderTargetSlot::LinearDepth => "LINEAR_DEPTH",
            RenderTargetSlot::ScreenSpaceReflection => "SCREEN_SPACE_REFLECTION",
            RenderTargetSlot::SsrResolved => "SSR_RESOLVED",
            RenderTargetSlot::SsrResolvedPrev => "SSR_RESOLVED_PREV",
            RenderTargetSlot::Ssao => "SSAO",
            RenderTargetSlot::SsaoNoise => "SSAO_NOISE",
            RenderTargetSlot::Bloom0 => "BLOOM_0",
            RenderTargetSlot::Bloom1 => "BLOOM_1",
            RenderTargetSlot::Bloom2 => "BLOOM_2",
            RenderTargetSlot::Bloom3 => "BLOOM_3",
            RenderTargetSlot::Bloom4 => "BLOOM_4",
            RenderTargetSlot::StaticShadowmap => "STATIC_SHADOWMAP",
            RenderTargetSlot::DynamicShadowmap => "DYNAMIC_SHADOWMAP",
            RenderTargetSlot::CompositeShadowmap => "COMPOSITE_SHADOWMAP",
            RenderTargetSlot::Atmosphere => "ATMOSPHERE",
            RenderTargetSlot::AtmosphereInscatter => "ATMOSPHERE_INSCATTER",
            RenderTargetSlot::LightProbeAtmosphere => "LIGHT_PROBE_ATMOSPHERE",
            RenderTargetSlot::ObjectId => "OBJECT_ID",
            RenderTargetSlot::FftA => "FFT_A",
            RenderTargetSlot::FftB => "FFT_B",
        }
    }

    /// Parse a slot name; `SHADOWMAP`, `DEPTHSTENCIL` and `SSR` are accepted as aliases.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "SHADOWMAP" => Some(Self::SHADOWMAP),
            "DEPTHSTENCIL" => Some(RenderTargetSlot::Depth),
            "SSR" => Some(RenderTargetSlot::ScreenSpaceReflection),
            _ => Self::ALL.iter().copied().find(|slot| slot.name() == name),
        }
    }

    fn spec(&self) -> SlotSpec {
        use FilterMode::*;
        use RenderTargetSlot::*;
        let clamp_linear = sampler(Linear, Linear, WrapMode::ClampToEdge);
        let clamp_nearest = sampler(Nearest, Nearest, WrapMode::ClampToEdge);
        let base = SlotSpec {
            format: TextureFormat::Rgba16Float,
            target: TextureTarget::D2,
            size: SlotSize::Full,
            layers: 1,
            sampler: clamp_linear,
            ssaa: true,
            msaa: false,
            msaa_only: false,
            immutable: false,
        };
        let shadow = SlotSpec {
            format: TextureFormat::Depth32Float,
            size: SlotSize::Fixed(SHADOW_MAP_SIZE, SHADOW_MAP_SIZE),
            sampler: SamplerState {
                border_color: [1.0; 4],
                ..sampler(Nearest, Nearest, WrapMode::ClampToBorder)
            },
            ssaa: false,
            immutable: true,
            ..base
        };
        match self {
            Backbuffer => SlotSpec {
                format: TextureFormat::Rgba8Unorm,
                ssaa: false,
                ..base
            },
            Depth => SlotSpec {
                format: TextureFormat::Depth32Float,
                sampler: clamp_nearest,
                ..base
            },
            DepthMs => SlotSpec {
                format: TextureFormat::Depth32Float,
                sampler: clamp_nearest,
                msaa: true,
                msaa_only: true,
                ..base
            },
            Hdr => SlotSpec { msaa: true, ..base },
            HdrResolve => SlotSpec {
                msaa_only: true,
                ..base
            },
            HdrTemp | HdrPrev | TaaResolve | ScreenSpaceReflection | SsrResolved
            | SsrResolvedPrev => base,
            Diffuse | Material | WorldNormal => SlotSpec {
                format: TextureFormat::Rgba8Unorm,
                ..base
            },
            Velocity => SlotSpec {
                format: TextureFormat::Rg32Float,
                sampler: clamp_nearest,
                ..base
            },
            LinearDepth => SlotSpec {
                format: TextureFormat::R32Float,
                sampler: sampler(NearestMipmapNearest, Nearest, WrapMode::ClampToEdge),
                ..base
            },
            ObjectId => SlotSpec {
                format: TextureFormat::R32Float,
                sampler: clamp_nearest,
                ..base
            },
            Ssao => SlotSpec {
                format: TextureFormat::R16Float,
                size: SlotSize::Scaled(2),
                ..base
            },
            SsaoNoise => SlotSpec {
                size: SlotSize::Fixed(SSAO_NOISE_SIZE, SSAO_NOISE_SIZE),
                sampler: sampler(Nearest, Nearest, WrapMode::Repeat),
                ssaa: false,
                ..base
            },
            Bloom0 => SlotSpec {
                size: SlotSize::Scaled(2),
                ..base
            },
            Bloom1 => SlotSpec {
                size: SlotSize::Scaled(4),
                ..base
            },
            Bloom2 => SlotSpec {
                size: SlotSize::Scaled(8),
                ..base
            },
            Bloom3 => SlotSpec {
                size: SlotSize::Scaled(16),
                ..base
            },
            Bloom4 => SlotSpec {
                size: SlotSize::Scaled(32),
                ..base
            },
            StaticShadowmap | DynamicShadowmap => shadow,
            CompositeShadowmap => SlotSpec {
                format: TextureFormat::R32Float,
                ..shadow
            },
            Atmosphere | AtmosphereInscatter => SlotSpec {
                size: SlotSize::Scaled(4),
                ..base
            },
            LightProbeAtmosphere => SlotSpec {
                target: TextureTarget::Cube,
                size: SlotSize::Fixed(LIGHT_PROBE_SIZE, LIGHT_PROBE_SIZE),
                sampler: sampler(LinearMipmapLinear, Linear, WrapMode::ClampToEdge),
                ssaa: false,
                immutable: true,
                ..base
            },
            FftA | FftB => SlotSpec {
                target: TextureTarget::D2Array,
                size: SlotSize::Fixed(FFT_SIZE, FFT_SIZE),
                layers: FFT_LAYERS,
                sampler: sampler(LinearMipmapLinear, Linear, WrapMode::Repeat),
                ssaa: false,
                immutable: true,
                ..base
            },
        }
    }

    /// Whether the slot keeps its texture across `resize`.
    pub fn is_immutable(&self) -> bool {
        self.spec().immutable
    }
}

/// Owner of the render-target textures
#[derive(Default)]
pub struct RenderTargetManager {
    width: u32,
    height: u32,
    anti_aliasing: AntiAliasing,
    targets: BTreeMap<RenderTargetSlot, Texture>,
    temporaries: HashMap<String, Texture>,
}

impl RenderTargetManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Window-sized resolution the targets were built for.
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn anti_aliasing(&self) -> AntiAliasing {
        self.anti_aliasing
    }

    /// Resolution of SSAA-eligible targets.
    pub fn full_size(&self) -> (u32, u32) {
        match self.anti_aliasing {
            AntiAliasing::Ssaa => (self.width * 2, self.height * 2),
            _ => (self.width, self.height),
        }
    }

    /// Allocate the full slot set for the given resolution.
    pub fn create_targets(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        width: u32,
        height: u32,
        anti_aliasing: AntiAliasing,
    ) -> RenderResult<()> {
        self.resize(backend, width, height, anti_aliasing)
    }

    /// Destroy temporaries and mutable slots, then recreate every slot.
    /// Immutable slots keep their texture if it already exists.
    pub fn resize(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        width: u32,
        height: u32,
        anti_aliasing: AntiAliasing,
    ) -> RenderResult<()> {
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidResolution(width, height));
        }
        log::info!(
            "Creating render targets {}x{} ({})",
            width,
            height,
            anti_aliasing.name()
        );
        self.clear(backend, false);
        self.width = width;
        self.height = height;
        self.anti_aliasing = anti_aliasing;
        for slot in RenderTargetSlot::ALL {
            if self.targets.contains_key(&slot) {
                continue;
            }
            if let Some(texture) = self.create_slot(backend, slot)? {
                self.targets.insert(slot, texture);
            }
        }
        Ok(())
    }

    fn create_slot(
        &self,
        backend: &mut dyn GraphicsBackend,
        slot: RenderTargetSlot,
    ) -> RenderResult<Option<Texture>> {
        let spec = slot.spec();
        let msaa = self.anti_aliasing == AntiAliasing::Msaa;
        if spec.msaa_only && !msaa {
            return Ok(None);
        }
        let (full_w, full_h) = if spec.ssaa {
            self.full_size()
        } else {
            (self.width, self.height)
        };
        let (width, height) = match spec.size {
            SlotSize::Full => (full_w, full_h),
            SlotSize::Scaled(divisor) => ((full_w / divisor).max(1), (full_h / divisor).max(1)),
            SlotSize::Fixed(w, h) => (w, h),
        };
        let mut desc = TextureDescriptor {
            label: slot.name().to_string(),
            target: spec.target,
            width,
            height,
            depth: spec.layers,
            format: spec.format,
            sampler: spec.sampler,
            samples: 1,
            attachment: slot != RenderTargetSlot::SsaoNoise,
        };
        if spec.msaa && msaa {
            desc.target = TextureTarget::D2Multisample;
            desc.samples = MSAA_SAMPLES;
            desc.sampler.min_filter = FilterMode::Nearest;
            desc.sampler.mag_filter = FilterMode::Nearest;
        }
        let data = (slot == RenderTargetSlot::SsaoNoise).then(ssao_noise);
        Ok(Some(Texture::create(backend, desc, data.as_deref())?))
    }

    /// Destroy temporaries and mutable slots; `force` also destroys immutable ones.
    pub fn clear(&mut self, backend: &mut dyn GraphicsBackend, force: bool) {
        for (_, texture) in self.temporaries.drain() {
            texture.destroy(backend);
        }
        self.targets.retain(|slot, texture| {
            let keep = !force && slot.is_immutable();
            if !keep {
                texture.destroy(backend);
            }
            keep
        });
    }

    pub fn get(&self, slot: RenderTargetSlot) -> Option<&Texture> {
        self.targets.get(&slot)
    }

    /// Like [`get`](Self::get) but a missing slot is an error.
    pub fn texture(&self, slot: RenderTargetSlot) -> RenderResult<&Texture> {
        self.targets
            .get(&slot)
            .ok_or_else(|| RenderError::MissingResource(slot.name().to_string()))
    }

    /// Exchange the textures of two slots.
    pub fn swap(&mut self, a: RenderTargetSlot, b: RenderTargetSlot) {
        if let (Some(ta), Some(tb)) = (self.targets.remove(&a), self.targets.remove(&b)) {
            self.targets.insert(a, tb);
            self.targets.insert(b, ta);
        }
    }

    /// Put `texture` into a slot and hand back the previous texture, which
    /// the caller now owns.
    pub fn replace(&mut self, slot: RenderTargetSlot, texture: Texture) -> Option<Texture> {
        self.targets.insert(slot, texture)
    }

    /// Texture named `name`, shaped like `reference` and scaled by `scale`
    /// (floored, at least 1x1). Cached until the next resize.
    pub fn get_temporary(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        name: &str,
        reference: RenderTargetSlot,
        scale: f32,
    ) -> RenderResult<Option<Texture>> {
        let Some(reference) = self.targets.get(&reference) else {
            log::warn!(
                "Failed to get temporary {}: {} does not exist",
                name,
                reference.name()
            );
            return Ok(None);
        };
        let mut desc = reference.desc.clone();
        desc.label = name.to_string();
        desc.width = ((desc.width as f32 * scale) as u32).max(1);
        desc.height = ((desc.height as f32 * scale) as u32).max(1);
        desc.attachment = true;
        self.get_temporary_desc(backend, desc).map(Some)
    }

    /// Temporary with an explicit descriptor; the label is the cache key.
    pub fn get_temporary_desc(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        desc: TextureDescriptor,
    ) -> RenderResult<Texture> {
        if let Some(cached) = self.temporaries.get(&desc.label) {
            let same = cached.desc.width == desc.width
                && cached.desc.height == desc.height
                && cached.desc.format == desc.format
                && cached.desc.target == desc.target
                && cached.desc.samples == desc.samples;
            if same {
                return Ok(cached.clone());
            }
        }
        if let Some(stale) = self.temporaries.remove(&desc.label) {
            stale.destroy(backend);
        }
        log::debug!(
            "Creating temporary render target {} {}x{}",
            desc.label,
            desc.width,
            desc.height
        );
        let texture = Texture::create(backend, desc, None)?;
        self.temporaries.insert(texture.name.clone(), texture.clone());
        Ok(texture)
    }

    /// Cache an existing texture as a temporary; a previous holder of the name is destroyed.
    pub fn insert_temporary(&mut self, backend: &mut dyn GraphicsBackend, name: &str, texture: Texture) {
        if let Some(old) = self.temporaries.insert(name.to_string(), texture) {
            if self.temporaries[name].handle != old.handle {
                old.destroy(backend);
            }
        }
    }

    /// Remove a temporary from the cache without destroying it.
    pub fn take_temporary(&mut self, name: &str) -> Option<Texture> {
        self.temporaries.remove(name)
    }

    pub fn temporary(&self, name: &str) -> Option<&Texture> {
        self.temporaries.get(name)
    }

    pub fn temporary_count(&self) -> usize {
        self.temporaries.len()
    }

    /// Slot or temporary by name.
    pub fn find(&self, name: &str) -> Option<&Texture> {
        RenderTargetSlot::from_name(name)
            .and_then(|slot| self.targets.get(&slot))
            .or_else(|| self.temporaries.get(name))
    }

    /// Names of live slots followed by sorted temporary names.
    pub fn names(&self) -> Vec<String> {
        let mut temporaries: Vec<String> = self.temporaries.keys().cloned().collect();
        temporaries.sort_unstable();
        self.targets
            .keys()
            .map(|slot| slot.name().to_string())
            .chain(temporaries)
            .collect()
    }

    pub fn slots(&self) -> impl Iterator<Item = (RenderTargetSlot, &Texture)> {
        self.targets.iter().map(|(slot, texture)| (*slot, texture))
    }
}

/// Random rotation vectors in xy for the SSAO kernel.
fn ssao_noise() -> Vec<u8> {
    let format = TextureFormat::Rgba16Float;
    let mut state: u32 = 0x9E37_79B9;
    let mut next = || {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        state as f32 / u32::MAX as f32 * 2.0 - 1.0
    };
    let mut data = vec![0u8; (SSAO_NOISE_SIZE * SSAO_NOISE_SIZE * format.bytes_per_pixel()) as usize];
    for texel in data.chunks_exact_mut(format.bytes_per_pixel() as usize) {
        let (x, y) = (next(), next());
        format.encode_texel([x, y, 0.0, 1.0], texel);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;

    fn manager(aa: AntiAliasing) -> (DummyBackend, RenderTargetManager) {
        let mut backend = DummyBackend::new(64, 32);
        let mut targets = RenderTargetManager::new();
        targets.create_targets(&mut backend, 64, 32, aa).unwrap();
        (backend, targets)
    }

    #[test]
    fn test_slot_names_roundtrip() {
        for slot in RenderTargetSlot::ALL {
            assert_eq!(RenderTargetSlot::from_name(slot.name()), Some(slot));
        }
        assert_eq!(
            RenderTargetSlot::from_name("SHADOWMAP"),
            Some(RenderTargetSlot::CompositeShadowmap)
        );
        assert_eq!(RenderTargetSlot::from_name("NOPE"), None);
    }

    #[test]
    fn test_formats_and_sizes() {
        let (_, targets) = manager(AntiAliasing::Taa);
        let hdr = targets.get(RenderTargetSlot::Hdr).unwrap();
        assert_eq!(hdr.format(), TextureFormat::Rgba16Float);
        assert_eq!(hdr.size(), (64, 32));
        assert_eq!(
            targets.get(RenderTargetSlot::Velocity).unwrap().format(),
            TextureFormat::Rg32Float
        );
        assert_eq!(targets.get(RenderTargetSlot::Ssao).unwrap().size(), (32, 16));
        assert_eq!(targets.get(RenderTargetSlot::Bloom4).unwrap().size(), (2, 1));
        let fft = targets.get(RenderTargetSlot::FftA).unwrap();
        assert_eq!(fft.desc.layers(), FFT_LAYERS);
        assert_eq!(fft.size(), (FFT_SIZE, FFT_SIZE));
        assert!(targets.get(RenderTargetSlot::DepthMs).is_none());
        assert!(targets.get(RenderTargetSlot::LinearDepth).unwrap().desc.mip_levels() > 1);
    }

    #[test]
    fn test_msaa_and_ssaa_rules() {
        let (_, msaa) = manager(AntiAliasing::Msaa);
        let hdr = msaa.get(RenderTargetSlot::Hdr).unwrap();
        assert_eq!(hdr.samples(), MSAA_SAMPLES);
        assert_eq!(hdr.target(), TextureTarget::D2Multisample);
        assert_eq!(msaa.get(RenderTargetSlot::DepthMs).unwrap().samples(), MSAA_SAMPLES);
        assert_eq!(msaa.get(RenderTargetSlot::Depth).unwrap().samples(), 1);
        assert_eq!(msaa.get(RenderTargetSlot::HdrResolve).unwrap().samples(), 1);

        let (_, ssaa) = manager(AntiAliasing::Ssaa);
        assert_eq!(ssaa.get(RenderTargetSlot::Hdr).unwrap().size(), (128, 64));
        assert_eq!(ssaa.get(RenderTargetSlot::Backbuffer).unwrap().size(), (64, 32));
        assert_eq!(
            ssaa.get(RenderTargetSlot::StaticShadowmap).unwrap().size(),
            (SHADOW_MAP_SIZE, SHADOW_MAP_SIZE)
        );
    }

    #[test]
    fn test_temporary_cache_and_clamp() {
        let (mut backend, mut targets) = manager(AntiAliasing::None);
        let a = targets
            .get_temporary(&mut backend, "temp_ssao", RenderTargetSlot::Ssao, 1.0)
            .unwrap()
            .unwrap();
        let b = targets
            .get_temporary(&mut backend, "temp_ssao", RenderTargetSlot::Ssao, 1.0)
            .unwrap()
            .unwrap();
        assert_eq!(a.handle, b.handle);
        assert_eq!(a.format(), TextureFormat::R16Float);

        let tiny = targets
            .get_temporary(&mut backend, "tiny", RenderTargetSlot::Hdr, 1e-6)
            .unwrap()
            .unwrap();
        assert_eq!(tiny.size(), (1, 1));

        let missing = targets
            .get_temporary(&mut backend, "ms", RenderTargetSlot::DepthMs, 1.0)
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_resize_discards_temporaries_and_keeps_immutable() {
        let (mut backend, mut targets) = manager(AntiAliasing::None);
        targets
            .get_temporary(&mut backend, "copy", RenderTargetSlot::Hdr, 0.5)
            .unwrap();
        let fft = targets.get(RenderTargetSlot::FftA).unwrap().handle;
        let hdr = targets.get(RenderTargetSlot::Hdr).unwrap().handle;
        targets.resize(&mut backend, 32, 16, AntiAliasing::None).unwrap();
        assert_eq!(targets.temporary_count(), 0);
        assert_eq!(targets.get(RenderTargetSlot::FftA).unwrap().handle, fft);
        assert_ne!(targets.get(RenderTargetSlot::Hdr).unwrap().handle, hdr);
        assert_eq!(targets.get(RenderTargetSlot::Hdr).unwrap().size(), (32, 16));
        assert!(matches!(
            targets.resize(&mut backend, 0, 16, AntiAliasing::None),
            Err(RenderError::InvalidResolution(0, 16))
        ));
    }

    #[test]
    fn test_force_clear_destroys_everything() {
        let (mut backend, mut targets) = manager(AntiAliasing::None);
        assert!(backend.live_textures() > 0);
        targets.clear(&mut backend, true);
        assert_eq!(backend.live_textures(), 0);
    }
}
