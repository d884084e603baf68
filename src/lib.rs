//! Render Core - a real-time rasterization renderer
//!
//! The core owns the per-frame pipeline of a scene renderer:
//! - Named render targets with resize and temporary-target caching
//! - Framebuffer objects cached by attachment set
//! - Uniform blocks and material instances
//! - Deferred and forward shading with a shadow pass and a postprocess chain
//! - Light-probe capture, FFT ocean simulation and CPU/GPU particles
//!
//! All GPU access goes through [`backend::GraphicsBackend`], implemented by a
//! headless [`backend::dummy::DummyBackend`] and by [`WgpuBackend`].

pub mod app;
pub mod backend;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod math;
pub mod ocean;
pub mod particles;
pub mod pipeline;
pub mod resources;
pub mod scene;

use std::path::PathBuf;

pub use backend::wgpu_backend::WgpuBackend;
pub use context::RenderContext;
pub use error::{ErrorKind, RenderError, RenderResult};
pub use pipeline::Renderer;

/// Shading path of the solid pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderingType {
    #[default]
    Deferred,
    Forward,
}

impl RenderingType {
    pub const ALL: [RenderingType; 2] = [RenderingType::Deferred, RenderingType::Forward];

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "deferred" => Some(RenderingType::Deferred),
            "forward" => Some(RenderingType::Forward),
            _ => None,
        }
    }

    pub fn from_index(index: i32) -> Option<Self> {
        Self::ALL.get(usize::try_from(index).ok()?).copied()
    }

    pub fn name(&self) -> &'static str {
        match self {
            RenderingType::Deferred => "DEFERRED_RENDERING",
            RenderingType::Forward => "FORWARD_RENDERING",
        }
    }
}

/// Anti-aliasing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AntiAliasing {
    None,
    #[default]
    Taa,
    Msaa,
    Ssaa,
}

impl AntiAliasing {
    pub const ALL: [AntiAliasing; 4] = [
        AntiAliasing::None,
        AntiAliasing::Taa,
        AntiAliasing::Msaa,
        AntiAliasing::Ssaa,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" => Some(AntiAliasing::None),
            "taa" => Some(AntiAliasing::Taa),
            "msaa" => Some(AntiAliasing::Msaa),
            "ssaa" => Some(AntiAliasing::Ssaa),
            _ => None,
        }
    }

    pub fn from_index(index: i32) -> Option<Self> {
        Self::ALL.get(usize::try_from(index).ok()?).copied()
    }

    pub fn name(&self) -> &'static str {
        match self {
            AntiAliasing::None => "NONE_AA",
            AntiAliasing::Taa => "TAA",
            AntiAliasing::Msaa => "MSAA",
            AntiAliasing::Ssaa => "SSAA",
        }
    }

    /// Whether switching between `self` and `other` changes render-target storage.
    pub fn changes_targets(&self, other: AntiAliasing) -> bool {
        let storage = |aa: AntiAliasing| matches!(aa, AntiAliasing::Msaa | AntiAliasing::Ssaa);
        self != &other && (storage(*self) || storage(other))
    }
}

/// Configuration for the renderer and its window
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Window title
    pub title: String,
    /// Project directory holding the resource folders
    pub project_path: PathBuf,
    /// Log level, overridable through `RUST_LOG`
    pub log_level: log::LevelFilter,
    /// Initial window width
    pub width: u32,
    /// Initial window height
    pub height: u32,
    /// Enable vsync; frames faster than 60 Hz are skipped
    pub vsync: bool,
    /// Start fullscreen
    pub fullscreen: bool,
    /// Deferred or forward solid pass
    pub rendering_type: RenderingType,
    /// Anti-aliasing mode
    pub anti_aliasing: AntiAliasing,
    /// Size of the point-light block
    pub max_point_lights: u32,
    /// Allow emitters to use the compute particle path
    pub gpu_particles: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            title: "Render Core".to_string(),
            project_path: PathBuf::from("."),
            log_level: log::LevelFilter::Info,
            width: 1280,
            height: 720,
            vsync: true,
            fullscreen: false,
            rendering_type: RenderingType::Deferred,
            anti_aliasing: AntiAliasing::Taa,
            max_point_lights: 10,
            gpu_particles: true,
        }
    }
}
