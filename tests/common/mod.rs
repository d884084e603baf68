//! Shared setup for the renderer integration tests.
//!
//! A [`TestContext`] bundles a render context, a renderer and the default
//! sphere scene for one backend. The wgpu backend is skipped when the
//! machine has no adapter.

use render_core::app::default_scene;
use render_core::backend::dummy::DummyBackend;
use render_core::resources::{RenderTargetSlot, Texture};
use render_core::scene::Scene;
use render_core::{AntiAliasing, RenderContext, Renderer, RendererConfig, WgpuBackend};

/// Backends the scenarios run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Records commands without rasterizing.
    Dummy,
    /// wgpu offscreen device.
    Wgpu,
}

impl Backend {
    #[allow(dead_code)]
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Dummy => "dummy",
            Backend::Wgpu => "wgpu",
        }
    }
}

pub struct TestContext {
    #[allow(dead_code)]
    pub backend: Backend,
    pub ctx: RenderContext,
    pub renderer: Renderer,
    pub scene: Scene,
}

impl TestContext {
    /// Build the default scene at `width`×`height`.
    ///
    /// Returns `None` if the backend is not available.
    pub fn new(backend: Backend, width: u32, height: u32, anti_aliasing: AntiAliasing) -> Option<Self> {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut ctx = match backend {
            Backend::Dummy => RenderContext::new(DummyBackend::new(width, height)).ok()?,
            Backend::Wgpu => {
                let gpu = WgpuBackend::new_headless(width, height).ok()?;
                RenderContext::new(gpu).ok()?
            }
        };
        let config = RendererConfig {
            width,
            height,
            anti_aliasing,
            vsync: false,
            ..Default::default()
        };
        let renderer = Renderer::new(&mut ctx, &config).ok()?;
        let scene = default_scene(&ctx, &config).ok()?;
        Some(Self {
            backend,
            ctx,
            renderer,
            scene,
        })
    }

    /// Update and render one frame at 60 Hz.
    pub fn frame(&mut self) {
        self.renderer.update_scene(&self.ctx, &mut self.scene, 1.0 / 60.0);
        self.renderer
            .render_frame(&mut self.ctx, &mut self.scene)
            .expect("frame should render");
    }

    pub fn target(&self, slot: RenderTargetSlot) -> Texture {
        self.ctx
            .render_targets
            .texture(slot)
            .expect("render target should exist")
            .clone()
    }

    /// Decoded texel at the center of a render target.
    #[allow(dead_code)]
    pub fn center_texel(&mut self, slot: RenderTargetSlot) -> [f32; 4] {
        let texture = self.target(slot);
        let (width, height) = texture.size();
        let texels = texture
            .read_texels(self.ctx.gpu(), 0, 0)
            .expect("texture readback");
        texels[((height / 2) * width + width / 2) as usize]
    }
}

/// Skip message for an unavailable backend.
pub fn skip(backend: Backend) {
    eprintln!("Backend {:?} not available, skipping", backend);
}

/// Rec. 709 luminance.
#[allow(dead_code)]
pub fn luminance(texel: [f32; 4]) -> f32 {
    0.2126 * texel[0] + 0.7152 * texel[1] + 0.0722 * texel[2]
}
