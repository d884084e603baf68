//! Render context
//!
//! Owns the graphics backend and every resource store. One context is
//! created after the backend is ready and passed explicitly to the renderer,
//! scene and effect code; nothing in the crate reaches for a global.

use crate::backend::dummy::DummyBackend;
use crate::backend::wgpu_backend::WgpuBackend;
use crate::backend::GraphicsBackend;
use crate::error::RenderResult;
use crate::resources::*;

/// Backend wrapper so the context can hand out concrete backends to tests
/// and the app while the core only sees [`GraphicsBackend`].
pub enum Backend {
    Dummy(DummyBackend),
    Wgpu(Box<WgpuBackend>),
}

impl Backend {
    pub fn as_dyn(&self) -> &dyn GraphicsBackend {
        match self {
            Backend::Dummy(b) => b,
            Backend::Wgpu(b) => b.as_ref(),
        }
    }

    pub fn as_dyn_mut(&mut self) -> &mut dyn GraphicsBackend {
        match self {
            Backend::Dummy(b) => b,
            Backend::Wgpu(b) => b.as_mut(),
        }
    }

    /// Get the dummy backend (if using it)
    pub fn as_dummy(&self) -> Option<&DummyBackend> {
        match self {
            Backend::Dummy(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_dummy_mut(&mut self) -> Option<&mut DummyBackend> {
        match self {
            Backend::Dummy(b) => Some(b),
            _ => None,
        }
    }

    /// Get the wgpu backend (if using wgpu)
    pub fn as_wgpu(&self) -> Option<&WgpuBackend> {
        match self {
            Backend::Wgpu(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_wgpu_mut(&mut self) -> Option<&mut WgpuBackend> {
        match self {
            Backend::Wgpu(b) => Some(b),
            _ => None,
        }
    }
}

impl From<DummyBackend> for Backend {
    fn from(backend: DummyBackend) -> Self {
        Backend::Dummy(backend)
    }
}

impl From<WgpuBackend> for Backend {
    fn from(backend: WgpuBackend) -> Self {
        Backend::Wgpu(Box::new(backend))
    }
}

/// Backend plus resource stores
pub struct RenderContext {
    pub backend: Backend,
    pub textures: TextureStore,
    pub geometries: GeometryStore,
    pub materials: MaterialStore,
    pub render_targets: RenderTargetManager,
    pub framebuffers: FramebufferManager,
    pub uniform_blocks: UniformBlocks,
}

impl RenderContext {
    /// Create default textures, built-in geometry, the uniform blocks and the
    /// default material instance. Render targets are created by the renderer
    /// once the resolution is known.
    pub fn new(backend: impl Into<Backend>) -> RenderResult<Self> {
        let mut backend = backend.into();
        log::info!("Creating render context on {}", backend.as_dyn().name());
        let gpu = backend.as_dyn_mut();

        let mut textures = TextureStore::new();
        textures.create_default_textures(gpu)?;
        let mut geometries = GeometryStore::new();
        geometries.create_builtin(gpu)?;
        let uniform_blocks = UniformBlocks::new(gpu)?;
        let mut materials = MaterialStore::new(ShaderLibrary::builtin());
        materials.create_instance(
            gpu,
            &textures,
            DEFAULT_MATERIAL_INSTANCE,
            "default",
            &Default::default(),
        )?;

        Ok(Self {
            backend,
            textures,
            geometries,
            materials,
            render_targets: RenderTargetManager::new(),
            framebuffers: FramebufferManager::new(),
            uniform_blocks,
        })
    }

    /// Headless context on the dummy backend.
    pub fn headless(width: u32, height: u32) -> RenderResult<Self> {
        Self::new(DummyBackend::new(width, height))
    }

    pub fn gpu(&mut self) -> &mut dyn GraphicsBackend {
        self.backend.as_dyn_mut()
    }

    pub fn dummy(&self) -> Option<&DummyBackend> {
        self.backend.as_dummy()
    }

    pub fn dummy_mut(&mut self) -> Option<&mut DummyBackend> {
        self.backend.as_dummy_mut()
    }

    /// Recreate render targets for a new resolution or anti-aliasing mode.
    /// Cached framebuffers reference the old textures and are dropped first.
    pub fn recreate_render_targets(
        &mut self,
        width: u32,
        height: u32,
        anti_aliasing: crate::AntiAliasing,
    ) -> RenderResult<()> {
        let gpu = self.backend.as_dyn_mut();
        self.framebuffers.clear_framebuffer(gpu);
        self.render_targets.resize(gpu, width, height, anti_aliasing)
    }

    /// Release every GPU resource. The context is unusable afterwards.
    pub fn destroy(&mut self) {
        let gpu = self.backend.as_dyn_mut();
        self.framebuffers.clear_framebuffer(gpu);
        self.render_targets.clear(gpu, true);
        self.materials.clear(gpu);
        for name in self.geometries.names().into_iter().map(str::to_string).collect::<Vec<_>>() {
            self.geometries.remove(gpu, &name);
        }
        self.textures.clear(gpu);
        self.uniform_blocks.destroy(gpu);
        log::info!("Render context destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::RenderTargetSlot;
    use crate::AntiAliasing;

    #[test]
    fn test_headless_context_has_defaults() {
        let ctx = RenderContext::headless(64, 64).unwrap();
        assert!(ctx.textures.by_name(FLAT_WHITE).is_some());
        assert!(ctx.geometries.by_name("quad").is_some());
        assert!(ctx.geometries.by_name("grid").is_some());
        assert!(ctx.materials.by_name(DEFAULT_MATERIAL_INSTANCE).is_some());
        assert!(ctx.dummy().is_some());
    }

    #[test]
    fn test_recreate_render_targets_drops_framebuffers() {
        let mut ctx = RenderContext::headless(64, 64).unwrap();
        ctx.recreate_render_targets(64, 64, AntiAliasing::None).unwrap();
        let hdr = ctx.render_targets.texture(RenderTargetSlot::Hdr).unwrap().clone();
        let gpu = ctx.backend.as_dyn_mut();
        ctx.framebuffers.bind_framebuffer(gpu, &[&hdr], None).unwrap();
        assert_eq!(ctx.framebuffers.len(), 1);

        ctx.recreate_render_targets(32, 16, AntiAliasing::None).unwrap();
        assert!(ctx.framebuffers.is_empty());
        assert_eq!(ctx.render_targets.texture(RenderTargetSlot::Hdr).unwrap().size(), (32, 16));
    }

    #[test]
    fn test_destroy_releases_textures() {
        let mut ctx = RenderContext::headless(32, 32).unwrap();
        ctx.recreate_render_targets(32, 32, AntiAliasing::Taa).unwrap();
        ctx.destroy();
        assert_eq!(ctx.dummy().unwrap().live_textures(), 0);
    }
}
