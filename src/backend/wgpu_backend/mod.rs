//! wgpu backend implementation
//!
//! The GL-like immediate surface is translated into buffered wgpu passes.
//! Draws accumulate in a pending render pass for as long as the bound
//! attachments stay the same; a clear, a blit, a compute dispatch or an
//! attachment change ends it. Buffer and texture uploads submit recorded
//! work first so they are ordered the way GL orders them.

mod convert;
pub(crate) mod prelude;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use wgpu::util::DeviceExt;

use crate::backend::traits::*;
use crate::backend::types::*;
use prelude::{MaterialLayout, UNIFORM_BLOCK_COUNT};

const BLIT_WGSL: &str = include_str!("../../../shaders/blit.wgsl");

/// Texture id of the default framebuffer's color image
const WINDOW_TEXTURE: u64 = 0;

/// Size of the zero buffer bound to unbound uniform and storage slots
const FALLBACK_BUFFER_SIZE: u64 = 65536;

struct GpuTexture {
    desc: TextureDescriptor,
    texture: wgpu::Texture,
    sample_view: wgpu::TextureView,
    sampler: wgpu::Sampler,
    mip_levels: u32,
}

struct GpuBuffer {
    desc: BufferDescriptor,
    buffer: wgpu::Buffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Attachment {
    texture: TextureHandle,
    target: AttachTarget,
}

#[derive(Debug, Clone, Default)]
struct FramebufferState {
    colors: BTreeMap<u32, Attachment>,
    depth: Option<(AttachmentPoint, Attachment)>,
    draw_buffers: u32,
    read_buffer: Option<u32>,
}

struct GpuProgram {
    desc: ProgramDescriptor,
    uniforms: Vec<UniformInfo>,
    layout: MaterialLayout,
    /// Sampler slot of each declaration, `None` for data uniforms.
    sampler_slots: Vec<Option<usize>>,
    module: wgpu::ShaderModule,
    pipeline_layout: wgpu::PipelineLayout,
    texture_layout: wgpu::BindGroupLayout,
    storage_layout: wgpu::BindGroupLayout,
    compute_pipeline: Option<wgpu::ComputePipeline>,
    material: Vec<u8>,
    units: Vec<u32>,
}

struct GpuVertexArray {
    desc: VertexArrayDescriptor,
    instance: Option<InstanceStream>,
}

/// One image written by a render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TargetImage {
    texture: u64,
    layer: u32,
    level: u32,
}

#[derive(Debug, Clone, PartialEq)]
struct PassTarget {
    colors: Vec<TargetImage>,
    depth: Option<TargetImage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: u64,
    colors: Vec<wgpu::TextureFormat>,
    depth: Option<wgpu::TextureFormat>,
    samples: u32,
    state: PipelineState,
    vertex: VertexLayout,
    instance: Option<VertexLayout>,
    mode: PrimitiveMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BlitKind {
    Color,
    Multisample,
    Depth,
}

/// Buffered draw call
struct DrawCall {
    pipeline: usize,
    bind_groups: [usize; 4],
    vertex_buffer: u64,
    instance_buffer: Option<u64>,
    index_buffer: u64,
    viewport: [f32; 4],
    index_count: u32,
    instance_count: u32,
}

/// Buffered compute dispatch
struct DispatchCall {
    program: u64,
    bind_groups: [usize; 4],
    groups: [u32; 3],
}

/// Pending render pass with buffered draws
struct PendingRenderPass {
    target: PassTarget,
    color_clear: Option<[f32; 4]>,
    depth_clear: Option<f32>,
    draws: Vec<DrawCall>,
}

/// wgpu backend implementation
pub struct WgpuBackend {
    #[allow(dead_code)]
    instance: wgpu::Instance,
    surface: Option<(wgpu::Surface<'static>, wgpu::SurfaceConfiguration)>,
    #[allow(dead_code)]
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    features: wgpu::Features,
    size: (u32, u32),

    // Resource storage
    next_id: u64,
    textures: HashMap<u64, GpuTexture>,
    buffers: HashMap<u64, GpuBuffer>,
    framebuffers: HashMap<u64, FramebufferState>,
    programs: HashMap<u64, GpuProgram>,
    vertex_arrays: HashMap<u64, GpuVertexArray>,
    attachment_views: HashMap<(u64, u32, u32), wgpu::TextureView>,
    sampling_views: HashMap<(u64, u32, u32), wgpu::TextureView>,
    /// 2D stand-ins for 3D slices used as attachments, copied back after the pass.
    slice_targets: HashMap<(u64, u32, u32), wgpu::Texture>,

    // Fixed layouts and fallbacks
    block_layout: wgpu::BindGroupLayout,
    material_layout: wgpu::BindGroupLayout,
    fallback_buffer: wgpu::Buffer,
    fallback_textures: HashMap<TextureTarget, u64>,
    nearest_sampler: wgpu::Sampler,
    blit_layout: wgpu::BindGroupLayout,
    blit_ms_layout: wgpu::BindGroupLayout,
    blit_module: wgpu::ShaderModule,
    blit_pipelines: HashMap<(wgpu::TextureFormat, BlitKind), wgpu::RenderPipeline>,
    render_pipelines: Vec<wgpu::RenderPipeline>,
    pipeline_cache: HashMap<PipelineKey, usize>,

    // GL-style state
    bound_framebuffer: Option<u64>,
    current_program: Option<u64>,
    current_vertex_array: Option<u64>,
    texture_units: HashMap<u32, TextureHandle>,
    buffer_bindings: HashMap<(BufferKind, u32), BufferHandle>,
    viewport: (i32, i32, u32, u32),
    state: PipelineState,

    // Command encoding
    encoder: Option<wgpu::CommandEncoder>,
    pending_render_pass: Option<PendingRenderPass>,
    pending_dispatches: Vec<DispatchCall>,
    frame_bind_groups: Vec<wgpu::BindGroup>,
    frame_buffers: Vec<wgpu::Buffer>,
}

impl WgpuBackend {
    /// Create a backend presenting to a window.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn new(window: Arc<winit::window::Window>, vsync: bool) -> BackendResult<Self> {
        let size = window.inner_size();
        pollster::block_on(Self::new_async(Some(window), vsync, size.width, size.height))
    }

    /// Create a backend without a window; the default framebuffer is an
    /// offscreen texture.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn new_headless(width: u32, height: u32) -> BackendResult<Self> {
        pollster::block_on(Self::new_async(None, false, width, height))
    }

    pub async fn new_async(
        window: Option<Arc<winit::window::Window>>,
        vsync: bool,
        width: u32,
        height: u32,
    ) -> BackendResult<Self> {
        let (instance, surface, adapter, device, queue) = Self::init_native(window).await?;

        // Clamp to device limits while maintaining aspect ratio
        let (width, height) = Self::clamp_size(&device, width, height);

        let surface = match surface {
            Some(surface) => {
                let surface_caps = surface.get_capabilities(&adapter);
                // Tone mapping already writes display-encoded values
                let surface_format = surface_caps
                    .formats
                    .iter()
                    .copied()
                    .find(|f| !f.is_srgb())
                    .or_else(|| surface_caps.formats.first().copied())
                    .ok_or_else(|| {
                        BackendError::SurfaceCreationFailed("surface reports no formats".into())
                    })?;
                let present_mode = if vsync {
                    wgpu::PresentMode::AutoVsync
                } else {
                    wgpu::PresentMode::AutoNoVsync
                };
                let surface_config = wgpu::SurfaceConfiguration {
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                    format: surface_format,
                    width,
                    height,
                    present_mode,
                    alpha_mode: surface_caps.alpha_modes[0],
                    view_formats: vec![],
                    desired_maximum_frame_latency: 2,
                };
                surface.configure(&device, &surface_config);
                Some((surface, surface_config))
            }
            None => None,
        };

        let uniform_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::VERTEX
                | wgpu::ShaderStages::FRAGMENT
                | wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let block_entries: Vec<_> = (0..UNIFORM_BLOCK_COUNT).map(uniform_entry).collect();
        let block_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("uniform blocks"),
            entries: &block_entries,
        });
        let material_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("material"),
            entries: &[uniform_entry(0)],
        });

        let fallback_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("fallback buffer"),
            size: FALLBACK_BUFFER_SIZE,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        let nearest_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("nearest"),
            ..Default::default()
        });

        let blit_texture_entry = |binding: u32, multisampled: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: false },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled,
            },
            count: None,
        };
        let blit_params_entry = wgpu::BindGroupLayoutEntry {
            visibility: wgpu::ShaderStages::FRAGMENT,
            ..uniform_entry(0)
        };
        let blit_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("blit"),
            entries: &[blit_params_entry, blit_texture_entry(1, false)],
        });
        let blit_ms_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("blit multisample"),
            entries: &[blit_params_entry, blit_texture_entry(2, true)],
        });
        let blit_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("blit"),
            source: wgpu::ShaderSource::Wgsl(BLIT_WGSL.into()),
        });

        let features = device.features();
        let mut backend = Self {
            instance,
            surface,
            adapter,
            device,
            queue,
            features,
            size: (width, height),
            next_id: WINDOW_TEXTURE + 1,
            textures: HashMap::new(),
            buffers: HashMap::new(),
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            vertex_arrays: HashMap::new(),
            attachment_views: HashMap::new(),
            sampling_views: HashMap::new(),
            slice_targets: HashMap::new(),
            block_layout,
            material_layout,
            fallback_buffer,
            fallback_textures: HashMap::new(),
            nearest_sampler,
            blit_layout,
            blit_ms_layout,
            blit_module,
            blit_pipelines: HashMap::new(),
            render_pipelines: Vec::new(),
            pipeline_cache: HashMap::new(),
            bound_framebuffer: None,
            current_program: None,
            current_vertex_array: None,
            texture_units: HashMap::new(),
            buffer_bindings: HashMap::new(),
            viewport: (0, 0, width, height),
            state: PipelineState::default(),
            encoder: None,
            pending_render_pass: None,
            pending_dispatches: Vec::new(),
            frame_bind_groups: Vec::new(),
            frame_buffers: Vec::new(),
        };
        backend.create_window_texture(width, height);
        backend.create_fallback_textures()?;
        Ok(backend)
    }

    /// Native initialization
    async fn init_native(
        window: Option<Arc<winit::window::Window>>,
    ) -> BackendResult<(
        wgpu::Instance,
        Option<wgpu::Surface<'static>>,
        wgpu::Adapter,
        wgpu::Device,
        wgpu::Queue,
    )> {
        // On Windows, try Vulkan first to avoid D3D12 debug layer validation errors
        let backends = if std::env::var("WGPU_BACKEND").is_ok() {
            wgpu::util::backend_bits_from_env().unwrap_or(wgpu::Backends::all())
        } else {
            #[cfg(target_os = "windows")]
            {
                wgpu::Backends::VULKAN
            }
            #[cfg(not(target_os = "windows"))]
            {
                wgpu::Backends::all()
            }
        };

        let mut attempt = backends;
        loop {
            let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
                backends: attempt,
                ..Default::default()
            });
            let surface = match &window {
                Some(window) => Some(
                    instance
                        .create_surface(window.clone())
                        .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?,
                ),
                None => None,
            };
            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: surface.as_ref(),
                    force_fallback_adapter: false,
                })
                .await;

            let Some(adapter) = adapter else {
                // If no adapter found with preferred backend, try with all backends
                if attempt != wgpu::Backends::all() {
                    log::warn!("Preferred backend not available, falling back to all backends");
                    attempt = wgpu::Backends::all();
                    continue;
                }
                return Err(BackendError::InitializationFailed(
                    "No suitable adapter found".into(),
                ));
            };

            let adapter_info = adapter.get_info();
            log::info!(
                "Selected GPU: {} ({:?} backend)",
                adapter_info.name,
                adapter_info.backend
            );

            let wanted = wgpu::Features::FLOAT32_FILTERABLE
                | wgpu::Features::POLYGON_MODE_LINE
                | wgpu::Features::POLYGON_MODE_POINT
                | wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER
                | wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES;
            let (device, queue) = adapter
                .request_device(
                    &wgpu::DeviceDescriptor {
                        label: Some("Render Core Device"),
                        required_features: adapter.features() & wanted,
                        required_limits: wgpu::Limits::default(),
                    },
                    None,
                )
                .await
                .map_err(|e| BackendError::DeviceCreationFailed(e.to_string()))?;

            return Ok((instance, surface, adapter, device, queue));
        }
    }

    fn clamp_size(device: &wgpu::Device, width: u32, height: u32) -> (u32, u32) {
        let max_size = device.limits().max_texture_dimension_2d;
        if width > max_size || height > max_size {
            // Calculate scale factor to fit within max_size while maintaining aspect ratio
            let scale = (max_size as f32 / width as f32).min(max_size as f32 / height as f32);
            (
                ((width as f32 * scale) as u32).max(1),
                ((height as f32 * scale) as u32).max(1),
            )
        } else {
            (width.max(1), height.max(1))
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn create_window_texture(&mut self, width: u32, height: u32) {
        let desc = TextureDescriptor {
            label: "window".into(),
            width,
            height,
            format: TextureFormat::Rgba8Unorm,
            sampler: SamplerState {
                min_filter: FilterMode::Nearest,
                mag_filter: FilterMode::Nearest,
                wrap: WrapMode::ClampToEdge,
                ..Default::default()
            },
            attachment: true,
            ..Default::default()
        };
        let texture = self.allocate_texture(&desc);
        self.forget_views(WINDOW_TEXTURE);
        self.textures.insert(WINDOW_TEXTURE, texture);
    }

    fn create_fallback_textures(&mut self) -> BackendResult<()> {
        let white = |target: TextureTarget, depth: u32| TextureDescriptor {
            label: format!("fallback {:?}", target),
            target,
            depth,
            samples: if target == TextureTarget::D2Multisample { 4 } else { 1 },
            ..Default::default()
        };
        for (target, depth) in [
            (TextureTarget::D2, 1),
            (TextureTarget::D2Array, 1),
            (TextureTarget::D3, 1),
            (TextureTarget::Cube, 6),
            (TextureTarget::D2Multisample, 1),
        ] {
            let handle = self.create_texture(&white(target, depth))?;
            if target != TextureTarget::D2Multisample {
                let layers = if target == TextureTarget::Cube { 6 } else { 1 };
                self.write_texture(handle, 0, 0, &vec![255u8; 4 * layers])?;
            }
            self.fallback_textures.insert(target, handle.0);
        }
        Ok(())
    }

    fn texture_usage(desc: &TextureDescriptor) -> wgpu::TextureUsages {
        match desc.target {
            TextureTarget::D2Multisample => {
                wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::RENDER_ATTACHMENT
            }
            TextureTarget::D3 => {
                wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_DST
                    | wgpu::TextureUsages::COPY_SRC
            }
            _ => {
                wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_DST
                    | wgpu::TextureUsages::COPY_SRC
                    | wgpu::TextureUsages::RENDER_ATTACHMENT
            }
        }
    }

    fn allocate_texture(&self, desc: &TextureDescriptor) -> GpuTexture {
        let multisampled = desc.target == TextureTarget::D2Multisample;
        // wgpu cannot render into 3D mips, so 3D textures keep a single level
        let mip_levels = if multisampled || desc.target == TextureTarget::D3 {
            1
        } else {
            desc.mip_levels()
        };
        let format = convert::texture_format(desc.format);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&desc.label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.layers(),
            },
            mip_level_count: mip_levels,
            sample_count: if multisampled { desc.samples.max(1) } else { 1 },
            dimension: convert::texture_dimension(desc.target),
            format,
            usage: Self::texture_usage(desc),
            view_formats: &[],
        });
        let sample_view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some(&desc.label),
            dimension: Some(convert::view_dimension(desc.target)),
            aspect: convert::sample_aspect(desc.format),
            ..Default::default()
        });
        let wrap = match desc.sampler.wrap {
            WrapMode::ClampToBorder
                if !self
                    .features
                    .contains(wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER) =>
            {
                WrapMode::ClampToEdge
            }
            wrap => wrap,
        };
        let address_mode = convert::address_mode(wrap);
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some(&desc.label),
            address_mode_u: address_mode,
            address_mode_v: address_mode,
            address_mode_w: address_mode,
            mag_filter: convert::filter_mode(desc.sampler.mag_filter),
            min_filter: convert::filter_mode(desc.sampler.min_filter),
            mipmap_filter: convert::mipmap_filter(desc.sampler.min_filter),
            lod_min_clamp: 0.0,
            lod_max_clamp: 32.0,
            compare: None,
            anisotropy_clamp: 1,
            border_color: (wrap == WrapMode::ClampToBorder)
                .then(|| convert::border_color(desc.sampler.border_color)),
        });
        GpuTexture {
            desc: desc.clone(),
            texture,
            sample_view,
            sampler,
            mip_levels,
        }
    }

    fn forget_views(&mut self, texture: u64) {
        self.attachment_views.retain(|(id, _, _), _| *id != texture);
        self.sampling_views.retain(|(id, _, _), _| *id != texture);
        self.slice_targets.retain(|(id, _, _), _| *id != texture);
    }

    fn gpu_texture(&self, id: u64) -> BackendResult<&GpuTexture> {
        self.textures
            .get(&id)
            .ok_or_else(|| BackendError::InvalidHandle(format!("texture {}", id)))
    }

    /// Single-layer, single-level 2D view used as an attachment or blit source
    fn ensure_view(&mut self, image: TargetImage, sampling: bool) -> BackendResult<()> {
        let key = (image.texture, image.layer, image.level);
        let cache = if sampling {
            &self.sampling_views
        } else {
            &self.attachment_views
        };
        if cache.contains_key(&key) {
            return Ok(());
        }
        let gpu = self.gpu_texture(image.texture)?;
        let view = if gpu.desc.target == TextureTarget::D3 {
            if sampling {
                return Err(BackendError::InvalidOperation(format!(
                    "{}: 3D slices cannot be blit sources",
                    gpu.desc.label
                )));
            }
            let (width, height) = gpu.desc.level_size(image.level);
            let stand_in = self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some(&gpu.desc.label),
                size: wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: convert::texture_format(gpu.desc.format),
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
                view_formats: &[],
            });
            let view = stand_in.create_view(&wgpu::TextureViewDescriptor::default());
            self.slice_targets.insert(key, stand_in);
            view
        } else {
            gpu.texture.create_view(&wgpu::TextureViewDescriptor {
                label: Some(&gpu.desc.label),
                dimension: Some(wgpu::TextureViewDimension::D2),
                aspect: if sampling {
                    convert::sample_aspect(gpu.desc.format)
                } else {
                    wgpu::TextureAspect::All
                },
                base_mip_level: image.level,
                mip_level_count: Some(1),
                base_array_layer: image.layer,
                array_layer_count: Some(1),
                ..Default::default()
            })
        };
        if sampling {
            self.sampling_views.insert(key, view);
        } else {
            self.attachment_views.insert(key, view);
        }
        Ok(())
    }

    /// Attachments that draws currently write to
    fn current_target(&mut self) -> BackendResult<PassTarget> {
        let target = match self.bound_framebuffer {
            None => PassTarget {
                colors: vec![TargetImage {
                    texture: WINDOW_TEXTURE,
                    layer: 0,
                    level: 0,
                }],
                depth: None,
            },
            Some(id) => {
                let fb = self.framebuffers.get(&id).ok_or_else(|| {
                    BackendError::InvalidHandle(format!("framebuffer {}", id))
                })?;
                let image = |a: &Attachment| TargetImage {
                    texture: a.texture.0,
                    layer: a.target.layer(),
                    level: a.target.level(),
                };
                PassTarget {
                    colors: (0..fb.draw_buffers)
                        .filter_map(|i| fb.colors.get(&i))
                        .map(image)
                        .collect(),
                    depth: fb.depth.as_ref().map(|(_, a)| image(a)),
                }
            }
        };
        for image in target.colors.iter().chain(target.depth.iter()) {
            self.ensure_view(*image, false)?;
        }
        Ok(target)
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        let device = &self.device;
        self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            })
        })
    }

    /// Make `target` the pending render pass, ending any other pass.
    fn begin_pass(&mut self, target: PassTarget) {
        self.end_compute_pass();
        if let Some(pending) = &self.pending_render_pass {
            if pending.target == target {
                return;
            }
        }
        self.end_render_pass();
        self.pending_render_pass = Some(PendingRenderPass {
            target,
            color_clear: None,
            depth_clear: None,
            draws: Vec::new(),
        });
    }

    fn end_render_pass(&mut self) {
        let Some(pending) = self.pending_render_pass.take() else {
            return;
        };
        self.encoder();
        let Some(mut encoder) = self.encoder.take() else {
            return;
        };

        {
            let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = pending
                .target
                .colors
                .iter()
                .map(|image| {
                    let view = self
                        .attachment_views
                        .get(&(image.texture, image.layer, image.level))?;
                    Some(wgpu::RenderPassColorAttachment {
                        view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: match pending.color_clear {
                                Some(c) => wgpu::LoadOp::Clear(wgpu::Color {
                                    r: c[0] as f64,
                                    g: c[1] as f64,
                                    b: c[2] as f64,
                                    a: c[3] as f64,
                                }),
                                None => wgpu::LoadOp::Load,
                            },
                            store: wgpu::StoreOp::Store,
                        },
                    })
                })
                .collect();

            let depth_attachment = pending.target.depth.as_ref().and_then(|image| {
                let view = self
                    .attachment_views
                    .get(&(image.texture, image.layer, image.level))?;
                let has_stencil = self
                    .textures
                    .get(&image.texture)
                    .map(|t| t.desc.format.has_stencil())
                    .unwrap_or(false);
                Some(wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: Some(wgpu::Operations {
                        load: match pending.depth_clear {
                            Some(depth) => wgpu::LoadOp::Clear(depth),
                            None => wgpu::LoadOp::Load,
                        },
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: has_stencil.then_some(wgpu::Operations {
                        load: match pending.depth_clear {
                            Some(_) => wgpu::LoadOp::Clear(0),
                            None => wgpu::LoadOp::Load,
                        },
                        store: wgpu::StoreOp::Store,
                    }),
                })
            });

            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: None,
                color_attachments: &color_attachments,
                depth_stencil_attachment: depth_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            for draw in &pending.draws {
                let Some(pipeline) = self.render_pipelines.get(draw.pipeline) else {
                    continue;
                };
                let (Some(vertex), Some(index)) = (
                    self.buffers.get(&draw.vertex_buffer),
                    self.buffers.get(&draw.index_buffer),
                ) else {
                    continue;
                };
                render_pass.set_pipeline(pipeline);
                for (index, group) in draw.bind_groups.iter().enumerate() {
                    render_pass.set_bind_group(index as u32, &self.frame_bind_groups[*group], &[]);
                }
                render_pass.set_vertex_buffer(0, vertex.buffer.slice(..));
                if let Some(instance) = draw.instance_buffer.and_then(|id| self.buffers.get(&id)) {
                    render_pass.set_vertex_buffer(1, instance.buffer.slice(..));
                }
                render_pass.set_index_buffer(index.buffer.slice(..), wgpu::IndexFormat::Uint32);
                let [x, y, w, h] = draw.viewport;
                render_pass.set_viewport(x, y, w, h, 0.0, 1.0);
                render_pass.draw_indexed(0..draw.index_count, 0, 0..draw.instance_count);
            }
        }

        // 3D slices were rendered into 2D stand-ins
        for image in pending.target.colors.iter() {
            let key = (image.texture, image.layer, image.level);
            let (Some(stand_in), Some(gpu)) =
                (self.slice_targets.get(&key), self.textures.get(&image.texture))
            else {
                continue;
            };
            encoder.copy_texture_to_texture(
                stand_in.as_image_copy(),
                wgpu::ImageCopyTexture {
                    texture: &gpu.texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d {
                        x: 0,
                        y: 0,
                        z: image.layer,
                    },
                    aspect: wgpu::TextureAspect::All,
                },
                stand_in.size(),
            );
        }

        self.encoder = Some(encoder);
    }

    fn end_compute_pass(&mut self) {
        if self.pending_dispatches.is_empty() {
            return;
        }
        let dispatches = std::mem::take(&mut self.pending_dispatches);
        self.encoder();
        let Some(mut encoder) = self.encoder.take() else {
            return;
        };
        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: None,
                timestamp_writes: None,
            });
            for dispatch in &dispatches {
                let Some(pipeline) = self
                    .programs
                    .get(&dispatch.program)
                    .and_then(|p| p.compute_pipeline.as_ref())
                else {
                    continue;
                };
                compute_pass.set_pipeline(pipeline);
                for (index, group) in dispatch.bind_groups.iter().enumerate() {
                    compute_pass.set_bind_group(index as u32, &self.frame_bind_groups[*group], &[]);
                }
                let [x, y, z] = dispatch.groups;
                compute_pass.dispatch_workgroups(x, y, z);
            }
        }
        self.encoder = Some(encoder);
    }

    /// Submit everything recorded so far.
    fn submit(&mut self) {
        self.end_render_pass();
        self.end_compute_pass();
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
        self.frame_bind_groups.clear();
        self.frame_buffers.clear();
    }

    fn has_recorded_work(&self) -> bool {
        self.encoder.is_some()
            || self.pending_render_pass.is_some()
            || !self.pending_dispatches.is_empty()
    }

    fn push_bind_group(&mut self, group: wgpu::BindGroup) -> usize {
        self.frame_bind_groups.push(group);
        self.frame_bind_groups.len() - 1
    }

    fn buffer_or_fallback(&self, kind: BufferKind, index: u32) -> &wgpu::Buffer {
        self.buffer_bindings
            .get(&(kind, index))
            .and_then(|handle| self.buffers.get(&handle.0))
            .map(|b| &b.buffer)
            .unwrap_or(&self.fallback_buffer)
    }

    /// Bind groups 0..=3 for the current program
    fn build_bind_groups(&mut self, program_id: u64) -> BackendResult<[usize; 4]> {
        let program = self
            .programs
            .get(&program_id)
            .ok_or_else(|| BackendError::InvalidHandle(format!("program {}", program_id)))?;

        let block_entries: Vec<wgpu::BindGroupEntry> = (0..UNIFORM_BLOCK_COUNT)
            .map(|index| wgpu::BindGroupEntry {
                binding: index,
                resource: self
                    .buffer_or_fallback(BufferKind::Uniform, index)
                    .as_entire_binding(),
            })
            .collect();
        let blocks = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("uniform blocks"),
            layout: &self.block_layout,
            entries: &block_entries,
        });

        let material_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(&program.desc.name),
                contents: &program.material,
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let material = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&program.desc.name),
            layout: &self.material_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: material_buffer.as_entire_binding(),
            }],
        });

        let mut texture_entries = Vec::new();
        let samplers = program.desc.uniforms.iter().filter(|d| d.kind.is_sampler());
        for (slot, decl) in samplers.enumerate() {
            let wanted = match decl.kind {
                UniformKind::Sampler2DArray => TextureTarget::D2Array,
                UniformKind::Sampler3D => TextureTarget::D3,
                UniformKind::SamplerCube => TextureTarget::Cube,
                UniformKind::Sampler2DMultisample => TextureTarget::D2Multisample,
                _ => TextureTarget::D2,
            };
            let bound = self
                .texture_units
                .get(&program.units[slot])
                .and_then(|handle| self.textures.get(&handle.0))
                .filter(|t| t.desc.target == wanted);
            let texture = match bound {
                Some(texture) => texture,
                None => self
                    .fallback_textures
                    .get(&wanted)
                    .and_then(|id| self.textures.get(id))
                    .ok_or_else(|| {
                        BackendError::InvalidOperation(format!("no fallback for {:?}", wanted))
                    })?,
            };
            let binding = slot as u32 * 2;
            texture_entries.push(wgpu::BindGroupEntry {
                binding,
                resource: wgpu::BindingResource::TextureView(&texture.sample_view),
            });
            if decl.kind != UniformKind::Sampler2DMultisample {
                let sampler = if decl.kind == UniformKind::Sampler2DUnfilterable {
                    &self.nearest_sampler
                } else {
                    &texture.sampler
                };
                texture_entries.push(wgpu::BindGroupEntry {
                    binding: binding + 1,
                    resource: wgpu::BindingResource::Sampler(sampler),
                });
            }
        }
        let textures = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&program.desc.name),
            layout: &program.texture_layout,
            entries: &texture_entries,
        });

        let storage_entries: Vec<wgpu::BindGroupEntry> = program
            .desc
            .storage
            .iter()
            .map(|decl| {
                let buffer = self
                    .buffer_bindings
                    .get(&(BufferKind::Storage, decl.binding))
                    .or_else(|| {
                        self.buffer_bindings
                            .get(&(BufferKind::AtomicCounter, decl.binding))
                    })
                    .and_then(|handle| self.buffers.get(&handle.0))
                    .map(|b| &b.buffer)
                    .unwrap_or(&self.fallback_buffer);
                wgpu::BindGroupEntry {
                    binding: decl.binding,
                    resource: buffer.as_entire_binding(),
                }
            })
            .collect();
        let storage = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&program.desc.name),
            layout: &program.storage_layout,
            entries: &storage_entries,
        });

        self.frame_buffers.push(material_buffer);
        Ok([
            self.push_bind_group(blocks),
            self.push_bind_group(material),
            self.push_bind_group(textures),
            self.push_bind_group(storage),
        ])
    }

    fn render_pipeline(&mut self, key: PipelineKey) -> BackendResult<usize> {
        if let Some(index) = self.pipeline_cache.get(&key) {
            return Ok(*index);
        }
        let program = self
            .programs
            .get(&key.program)
            .ok_or_else(|| BackendError::InvalidHandle(format!("program {}", key.program)))?;
        let ProgramStages::Graphics { color_outputs, .. } = program.desc.stages else {
            return Err(BackendError::InvalidOperation(format!(
                "{}: draw with a compute program",
                program.desc.name
            )));
        };

        let state = key.state;
        let color_targets: Vec<Option<wgpu::ColorTargetState>> = key
            .colors
            .iter()
            .enumerate()
            .map(|(i, format)| {
                let blendable = !matches!(
                    format,
                    wgpu::TextureFormat::R32Float
                        | wgpu::TextureFormat::Rg32Float
                        | wgpu::TextureFormat::Rgba32Float
                );
                Some(wgpu::ColorTargetState {
                    format: *format,
                    blend: state.blend.filter(|_| blendable).map(|b| convert::blend_state(&b)),
                    write_mask: if (i as u32) < color_outputs {
                        wgpu::ColorWrites::ALL
                    } else {
                        wgpu::ColorWrites::empty()
                    },
                })
            })
            .collect();

        let vertex_attrs = convert::vertex_attributes(&key.vertex);
        let instance_attrs = key.instance.as_ref().map(convert::vertex_attributes);
        let mut vertex_buffers = vec![wgpu::VertexBufferLayout {
            array_stride: key.vertex.stride,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &vertex_attrs,
        }];
        if let (Some(layout), Some(attrs)) = (&key.instance, &instance_attrs) {
            vertex_buffers.push(wgpu::VertexBufferLayout {
                array_stride: layout.stride,
                step_mode: wgpu::VertexStepMode::Instance,
                attributes: attrs,
            });
        }

        let depth_stencil = key.depth.map(|format| wgpu::DepthStencilState {
            format,
            depth_write_enabled: state.depth_test && state.depth_write,
            depth_compare: if state.depth_test {
                convert::compare_function(state.depth_func)
            } else {
                wgpu::CompareFunction::Always
            },
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        });

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(&program.desc.name),
                layout: Some(&program.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &program.module,
                    entry_point: "vs_main",
                    buffers: &vertex_buffers,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &program.module,
                    entry_point: "fs_main",
                    targets: &color_targets,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: convert::topology(key.mode),
                    strip_index_format: None,
                    front_face: convert::front_face(state.front_face),
                    cull_mode: convert::cull_mode(state.cull_face),
                    polygon_mode: convert::polygon_mode(state.polygon_mode, self.features),
                    ..Default::default()
                },
                depth_stencil,
                multisample: wgpu::MultisampleState {
                    count: key.samples,
                    ..Default::default()
                },
                multiview: None,
            });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::PipelineCreationFailed(format!(
                "{}: {}",
                program.desc.name, error
            )));
        }
        log::debug!("Created pipeline for {}", program.desc.name);

        self.render_pipelines.push(pipeline);
        let index = self.render_pipelines.len() - 1;
        self.pipeline_cache.insert(key, index);
        Ok(index)
    }

    fn blit_pipeline(&mut self, format: wgpu::TextureFormat, kind: BlitKind) -> &wgpu::RenderPipeline {
        let device = &self.device;
        let (module, blit_layout, blit_ms_layout) =
            (&self.blit_module, &self.blit_layout, &self.blit_ms_layout);
        self.blit_pipelines.entry((format, kind)).or_insert_with(|| {
            let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("blit"),
                bind_group_layouts: &[if kind == BlitKind::Multisample {
                    blit_ms_layout
                } else {
                    blit_layout
                }],
                push_constant_ranges: &[],
            });
            let color_targets = [Some(wgpu::ColorTargetState {
                format,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })];
            let entry_point = match kind {
                BlitKind::Color => "fs_color",
                BlitKind::Multisample => "fs_color_ms",
                BlitKind::Depth => "fs_depth",
            };
            let targets: &[Option<wgpu::ColorTargetState>] = if kind == BlitKind::Depth {
                &[]
            } else {
                &color_targets
            };
            let depth_stencil = (kind == BlitKind::Depth).then(|| wgpu::DepthStencilState {
                format,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Always,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            });
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("blit"),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module,
                    entry_point: "vs_main",
                    buffers: &[],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module,
                    entry_point,
                    targets,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
            })
        })
    }

    /// Copy one image into another through the blit shader.
    fn blit_image(
        &mut self,
        src: TargetImage,
        src_rect: BlitRect,
        dst: TargetImage,
        dst_rect: BlitRect,
        linear: bool,
        depth: bool,
    ) -> BackendResult<()> {
        let src_desc = self.gpu_texture(src.texture)?.desc.clone();
        let dst_desc = self.gpu_texture(dst.texture)?.desc.clone();
        if dst_desc.samples > 1 && dst_desc.target == TextureTarget::D2Multisample {
            return Err(BackendError::InvalidOperation(format!(
                "{}: blit into a multisampled target",
                dst_desc.label
            )));
        }
        let multisampled = src_desc.target == TextureTarget::D2Multisample;
        if depth && multisampled {
            return Err(BackendError::InvalidOperation(format!(
                "{}: multisampled depth blits are not supported",
                src_desc.label
            )));
        }

        // Same-size color copies go through the copy engine
        if !depth
            && !multisampled
            && src_rect == dst_rect
            && src_rect.x0 == 0
            && src_rect.y0 == 0
            && src_desc.format == dst_desc.format
            && src_desc.level_size(src.level) == (src_rect.x1 as u32, src_rect.y1 as u32)
            && dst_desc.level_size(dst.level) == (dst_rect.x1 as u32, dst_rect.y1 as u32)
            && dst_desc.target != TextureTarget::D3
        {
            let (width, height) = src_desc.level_size(src.level);
            self.encoder();
            let Some(mut encoder) = self.encoder.take() else {
                return Ok(());
            };
            let (Some(src_gpu), Some(dst_gpu)) =
                (self.textures.get(&src.texture), self.textures.get(&dst.texture))
            else {
                self.encoder = Some(encoder);
                return Ok(());
            };
            let (src_texture, dst_texture) = (&src_gpu.texture, &dst_gpu.texture);
            encoder.copy_texture_to_texture(
                wgpu::ImageCopyTexture {
                    texture: src_texture,
                    mip_level: src.level,
                    origin: wgpu::Origin3d {
                        x: 0,
                        y: 0,
                        z: src.layer,
                    },
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::ImageCopyTexture {
                    texture: dst_texture,
                    mip_level: dst.level,
                    origin: wgpu::Origin3d {
                        x: 0,
                        y: 0,
                        z: dst.layer,
                    },
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
            );
            self.encoder = Some(encoder);
            return Ok(());
        }

        if multisampled {
            // The multisampled binding needs the full texture view
            self.sampling_views.entry((src.texture, 0, 0)).or_insert_with(|| {
                self.textures[&src.texture]
                    .texture
                    .create_view(&wgpu::TextureViewDescriptor::default())
            });
        } else {
            self.ensure_view(src, true)?;
        }
        self.ensure_view(dst, false)?;

        let params: [f32; 12] = [
            src_rect.x0 as f32,
            src_rect.y0 as f32,
            src_rect.x1 as f32,
            src_rect.y1 as f32,
            dst_rect.x0 as f32,
            dst_rect.y0 as f32,
            dst_rect.x1 as f32,
            dst_rect.y1 as f32,
            f32::from_bits(linear as u32),
            f32::from_bits(src_desc.samples),
            0.0,
            0.0,
        ];
        let params_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("blit params"),
                contents: bytemuck::cast_slice(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let kind = match (depth, multisampled) {
            (true, _) => BlitKind::Depth,
            (false, true) => BlitKind::Multisample,
            (false, false) => BlitKind::Color,
        };
        let format = convert::texture_format(dst_desc.format);
        self.blit_pipeline(format, kind);

        let src_key = if multisampled {
            (src.texture, 0, 0)
        } else {
            (src.texture, src.layer, src.level)
        };
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("blit"),
            layout: if multisampled {
                &self.blit_ms_layout
            } else {
                &self.blit_layout
            },
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: if multisampled { 2 } else { 1 },
                    resource: wgpu::BindingResource::TextureView(&self.sampling_views[&src_key]),
                },
            ],
        });

        let (dst_w, dst_h) = dst_desc.level_size(dst.level);
        let x0 = dst_rect.x0.min(dst_rect.x1).clamp(0, dst_w as i32) as f32;
        let x1 = dst_rect.x0.max(dst_rect.x1).clamp(0, dst_w as i32) as f32;
        let y0 = dst_rect.y0.min(dst_rect.y1).clamp(0, dst_h as i32) as f32;
        let y1 = dst_rect.y0.max(dst_rect.y1).clamp(0, dst_h as i32) as f32;
        if x1 <= x0 || y1 <= y0 {
            return Ok(());
        }

        let dst_key = (dst.texture, dst.layer, dst.level);
        self.encoder();
        let Some(mut encoder) = self.encoder.take() else {
            return Ok(());
        };
        {
            let view = &self.attachment_views[&dst_key];
            let color = [Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })];
            let color_attachments: &[Option<wgpu::RenderPassColorAttachment>] =
                if depth { &[] } else { &color };
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("blit"),
                color_attachments,
                depth_stencil_attachment: depth.then(|| wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.blit_pipelines[&(format, kind)]);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.set_viewport(x0, y0, x1 - x0, y1 - y0, 0.0, 1.0);
            pass.draw(0..3, 0..1);
        }
        self.encoder = Some(encoder);
        self.frame_buffers.push(params_buffer);
        self.frame_bind_groups.push(bind_group);
        Ok(())
    }

    /// Copy the default framebuffer to the swapchain image.
    fn present_window(&mut self) -> BackendResult<()> {
        let Some((surface, config)) = &self.surface else {
            return Ok(());
        };
        let output = match surface.get_current_texture() {
            Ok(output) => output,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                log::warn!("Surface lost, reconfiguring");
                surface.configure(&self.device, config);
                return Ok(());
            }
            Err(wgpu::SurfaceError::Timeout) => return Ok(()),
            Err(wgpu::SurfaceError::OutOfMemory) => return Err(BackendError::OutOfMemory),
        };
        let format = config.format;
        let (width, height) = (config.width, config.height);
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let window = TargetImage {
            texture: WINDOW_TEXTURE,
            layer: 0,
            level: 0,
        };
        self.ensure_view(window, true)?;
        let rect = BlitRect::new(width, height);
        let params: [f32; 12] = [
            rect.x0 as f32,
            rect.y0 as f32,
            rect.x1 as f32,
            rect.y1 as f32,
            rect.x0 as f32,
            rect.y0 as f32,
            rect.x1 as f32,
            rect.y1 as f32,
            f32::from_bits(0),
            f32::from_bits(1),
            0.0,
            0.0,
        ];
        let params_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("present params"),
                contents: bytemuck::cast_slice(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        self.blit_pipeline(format, BlitKind::Color);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("present"),
            layout: &self.blit_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(
                        &self.sampling_views[&(WINDOW_TEXTURE, 0, 0)],
                    ),
                },
            ],
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Present Encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("present"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.blit_pipelines[&(format, BlitKind::Color)]);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();
        Ok(())
    }

    fn map_buffer(&self, buffer: &wgpu::Buffer) -> BackendResult<Vec<u8>> {
        let slice = buffer.slice(..);
        let (sender, receiver) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|e| BackendError::ReadbackFailed(e.to_string()))?
            .map_err(|e| BackendError::ReadbackFailed(e.to_string()))?;
        let data = slice.get_mapped_range().to_vec();
        buffer.unmap();
        Ok(data)
    }

    /// Underlying wgpu device
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn adapter_info(&self) -> wgpu::AdapterInfo {
        self.adapter.get_info()
    }
}

impl GraphicsBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn surface_size(&self) -> (u32, u32) {
        self.size
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.submit();
        let (width, height) = Self::clamp_size(&self.device, width, height);
        if let Some((surface, config)) = &mut self.surface {
            config.width = width;
            config.height = height;
            surface.configure(&self.device, config);
        }
        self.size = (width, height);
        self.create_window_texture(width, height);
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 || desc.depth == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "{}: zero extent {}x{}x{}",
                desc.label, desc.width, desc.height, desc.depth
            )));
        }
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let texture = self.allocate_texture(desc);
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::TextureCreationFailed(format!(
                "{}: {}",
                desc.label, error
            )));
        }
        log::debug!(
            "Created texture {:?} ({}x{}x{}, {:?})",
            desc.label,
            desc.width,
            desc.height,
            desc.depth,
            desc.format
        );
        let id = self.allocate_id();
        self.textures.insert(id, texture);
        Ok(TextureHandle(id))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if texture.0 == WINDOW_TEXTURE {
            return;
        }
        self.forget_views(texture.0);
        self.textures.remove(&texture.0);
        self.texture_units.retain(|_, bound| *bound != texture);
    }

    fn write_texture(
        &mut self,
        texture: TextureHandle,
        layer: u32,
        level: u32,
        data: &[u8],
    ) -> BackendResult<()> {
        if self.has_recorded_work() {
            self.submit();
        }
        let gpu = self.gpu_texture(texture.0)?;
        if level >= gpu.mip_levels || gpu.desc.format.has_stencil() {
            return Err(BackendError::InvalidOperation(format!(
                "{}: cannot upload level {}",
                gpu.desc.label, level
            )));
        }
        let (width, height) = gpu.desc.level_size(level);
        let bpp = gpu.desc.format.bytes_per_pixel();
        let layer_bytes = (width * height * bpp) as usize;
        if layer_bytes == 0 || data.len() % layer_bytes != 0 {
            return Err(BackendError::InvalidOperation(format!(
                "{}: upload of {} bytes is not a whole number of layers",
                gpu.desc.label,
                data.len()
            )));
        }
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &gpu.texture,
                mip_level: level,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: layer,
                },
                aspect: convert::sample_aspect(gpu.desc.format),
            },
            data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(width * bpp),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: (data.len() / layer_bytes) as u32,
            },
        );
        Ok(())
    }

    fn read_texture(
        &mut self,
        texture: TextureHandle,
        layer: u32,
        level: u32,
    ) -> BackendResult<Vec<u8>> {
        self.submit();
        let gpu = self.gpu_texture(texture.0)?;
        if gpu.desc.target == TextureTarget::D2Multisample || gpu.desc.format.has_stencil() {
            return Err(BackendError::ReadbackFailed(format!(
                "{}: format cannot be copied to a buffer",
                gpu.desc.label
            )));
        }
        if level >= gpu.mip_levels {
            return Err(BackendError::ReadbackFailed(format!(
                "{}: level {} out of range",
                gpu.desc.label, level
            )));
        }
        let (width, height) = gpu.desc.level_size(level);
        let bpp = gpu.desc.format.bytes_per_pixel();
        let padded = convert::aligned_bytes_per_row(width, bpp);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: (padded * height) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &gpu.texture,
                mip_level: level,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: layer,
                },
                aspect: convert::sample_aspect(gpu.desc.format),
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));
        let padded_data = self.map_buffer(&staging)?;
        let row = (width * bpp) as usize;
        let mut pixels = Vec::with_capacity(row * height as usize);
        for chunk in padded_data.chunks(padded as usize).take(height as usize) {
            pixels.extend_from_slice(&chunk[..row]);
        }
        Ok(pixels)
    }

    fn generate_mipmaps(&mut self, texture: TextureHandle) -> BackendResult<()> {
        let gpu = self.gpu_texture(texture.0)?;
        if gpu.mip_levels <= 1 || gpu.desc.format.is_depth() {
            return Ok(());
        }
        let (levels, layers) = (gpu.mip_levels, gpu.desc.layers());
        let desc = gpu.desc.clone();
        self.end_render_pass();
        self.end_compute_pass();
        for level in 1..levels {
            let (pw, ph) = desc.level_size(level - 1);
            let (w, h) = desc.level_size(level);
            for layer in 0..layers {
                self.blit_image(
                    TargetImage {
                        texture: texture.0,
                        layer,
                        level: level - 1,
                    },
                    BlitRect::new(pw, ph),
                    TargetImage {
                        texture: texture.0,
                        layer,
                        level,
                    },
                    BlitRect::new(w, h),
                    true,
                    false,
                )?;
            }
        }
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&desc.label),
            size: desc.size.max(16).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT),
            usage: convert::buffer_usage(desc.kind),
            mapped_at_creation: false,
        });
        let id = self.allocate_id();
        self.buffers.insert(
            id,
            GpuBuffer {
                desc: desc.clone(),
                buffer,
            },
        );
        Ok(BufferHandle(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
        self.buffer_bindings.retain(|_, bound| *bound != buffer);
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        if self.has_recorded_work() {
            self.submit();
        }
        let gpu = self
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("buffer {:?}", buffer)))?;
        if offset + data.len() as u64 > gpu.desc.size.max(16) {
            return Err(BackendError::InvalidOperation(format!(
                "{}: write of {} bytes at {} exceeds size {}",
                gpu.desc.label,
                data.len(),
                offset,
                gpu.desc.size
            )));
        }
        // Queue writes must be 4-byte multiples
        if data.len() % 4 == 0 {
            self.queue.write_buffer(&gpu.buffer, offset, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(data.len().next_multiple_of(4), 0);
            self.queue.write_buffer(&gpu.buffer, offset, &padded);
        }
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> BackendResult<Vec<u8>> {
        self.submit();
        let gpu = self
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("buffer {:?}", buffer)))?;
        let size = gpu.buffer.size();
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_buffer_to_buffer(&gpu.buffer, 0, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));
        let mut data = self.map_buffer(&staging)?;
        data.truncate(gpu.desc.size as usize);
        Ok(data)
    }

    fn bind_buffer_base(&mut self, kind: BufferKind, index: u32, buffer: BufferHandle) {
        self.buffer_bindings.insert((kind, index), buffer);
    }

    fn create_framebuffer(&mut self) -> BackendResult<FramebufferHandle> {
        let id = self.allocate_id();
        self.framebuffers.insert(id, FramebufferState::default());
        Ok(FramebufferHandle(id))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(&framebuffer.0);
        if self.bound_framebuffer == Some(framebuffer.0) {
            self.bound_framebuffer = None;
        }
    }

    fn execute_framebuffer_command(&mut self, command: &FramebufferCommand) -> BackendResult<()> {
        match command {
            FramebufferCommand::Bind(handle) => {
                if !self.framebuffers.contains_key(&handle.0) {
                    return Err(BackendError::InvalidHandle(format!(
                        "framebuffer {:?}",
                        handle
                    )));
                }
                self.bound_framebuffer = Some(handle.0);
                return Ok(());
            }
            FramebufferCommand::BindDefault => {
                self.bound_framebuffer = None;
                return Ok(());
            }
            _ => {}
        }
        let fb = self
            .bound_framebuffer
            .and_then(|id| self.framebuffers.get_mut(&id))
            .ok_or_else(|| {
                BackendError::InvalidOperation(
                    "framebuffer command without a bound framebuffer".into(),
                )
            })?;
        match command {
            FramebufferCommand::Attach {
                point,
                texture,
                target,
            } => {
                let attachment = Attachment {
                    texture: *texture,
                    target: *target,
                };
                match point {
                    AttachmentPoint::Color(index) => {
                        fb.colors.insert(*index, attachment);
                    }
                    AttachmentPoint::Depth | AttachmentPoint::DepthStencil => {
                        fb.depth = Some((*point, attachment));
                    }
                }
            }
            FramebufferCommand::Detach(point) => match point {
                AttachmentPoint::Color(index) => {
                    fb.colors.remove(index);
                }
                AttachmentPoint::Depth | AttachmentPoint::DepthStencil => fb.depth = None,
            },
            FramebufferCommand::DrawBuffers(count) => fb.draw_buffers = *count,
            FramebufferCommand::DrawBufferNone => fb.draw_buffers = 0,
            FramebufferCommand::ReadBuffer(index) => fb.read_buffer = *index,
            FramebufferCommand::Bind(_) | FramebufferCommand::BindDefault => {}
        }
        Ok(())
    }

    fn check_framebuffer_status(&self) -> FramebufferStatus {
        let Some(fb) = self.bound_framebuffer.and_then(|id| self.framebuffers.get(&id)) else {
            return FramebufferStatus::Complete;
        };
        let describe = |point: AttachmentPoint, attachment: &Attachment| AttachmentInfo {
            point,
            texture: self.textures.get(&attachment.texture.0).map(|t| &t.desc),
            target: attachment.target,
        };
        let mut attachments: Vec<AttachmentInfo<'_>> = fb
            .colors
            .iter()
            .map(|(index, a)| describe(AttachmentPoint::Color(*index), a))
            .collect();
        if let Some((point, attachment)) = &fb.depth {
            attachments.push(describe(*point, attachment));
        }
        framebuffer_status(&attachments)
    }

    fn blit_framebuffer(
        &mut self,
        src: Option<FramebufferHandle>,
        src_rect: BlitRect,
        dst: Option<FramebufferHandle>,
        dst_rect: BlitRect,
        mask: BlitMask,
        linear: bool,
    ) -> BackendResult<()> {
        let lookup = |handle: Option<FramebufferHandle>| -> BackendResult<Option<FramebufferState>> {
            match handle {
                Some(h) => self
                    .framebuffers
                    .get(&h.0)
                    .cloned()
                    .map(Some)
                    .ok_or_else(|| BackendError::InvalidHandle(format!("framebuffer {:?}", h))),
                None => Ok(None),
            }
        };
        let src_fb = lookup(src)?;
        let dst_fb = lookup(dst)?;
        let image = |a: &Attachment| TargetImage {
            texture: a.texture.0,
            layer: a.target.layer(),
            level: a.target.level(),
        };
        let window = TargetImage {
            texture: WINDOW_TEXTURE,
            layer: 0,
            level: 0,
        };
        self.end_render_pass();
        self.end_compute_pass();

        if mask.color {
            let source = match &src_fb {
                Some(fb) => {
                    let index = fb.read_buffer.unwrap_or(0);
                    let attachment = fb.colors.get(&index).ok_or_else(|| {
                        BackendError::InvalidOperation("blit source has no read buffer".into())
                    })?;
                    image(attachment)
                }
                None => window,
            };
            let targets: Vec<TargetImage> = match &dst_fb {
                Some(fb) => (0..fb.draw_buffers.max(1))
                    .filter_map(|i| fb.colors.get(&i))
                    .map(image)
                    .collect(),
                None => vec![window],
            };
            for target in targets {
                self.blit_image(source, src_rect, target, dst_rect, linear, false)?;
            }
        }
        if mask.depth {
            let source = src_fb.as_ref().and_then(|fb| fb.depth).map(|(_, a)| image(&a));
            let target = dst_fb.as_ref().and_then(|fb| fb.depth).map(|(_, a)| image(&a));
            if let (Some(s), Some(d)) = (source, target) {
                self.blit_image(s, src_rect, d, dst_rect, false, true)?;
            }
        }
        Ok(())
    }

    fn set_viewport(&mut self, x: i32, y: i32, width: u32, height: u32) {
        self.viewport = (x, y, width, height);
    }

    fn clear(&mut self, value: ClearValue) -> BackendResult<()> {
        let target = self.current_target()?;
        let mergeable = matches!(
            &self.pending_render_pass,
            Some(pending) if pending.target == target && pending.draws.is_empty()
        );
        if !mergeable {
            self.end_render_pass();
            self.begin_pass(target);
        }
        if let Some(pending) = &mut self.pending_render_pass {
            if value.color.is_some() {
                pending.color_clear = value.color;
            }
            if value.depth.is_some() {
                pending.depth_clear = value.depth;
            }
        }
        Ok(())
    }

    fn set_pipeline_state(&mut self, state: &PipelineState) {
        self.state = *state;
    }

    fn pipeline_state(&self) -> PipelineState {
        self.state
    }

    fn create_program(&mut self, desc: &ProgramDescriptor) -> BackendResult<ProgramHandle> {
        let layout = MaterialLayout::new(&desc.name, &desc.uniforms)?;
        let source = prelude::assemble(desc)?;
        prelude::validate(&desc.name, &source)?;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&desc.name),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });

        let stages = wgpu::ShaderStages::VERTEX
            | wgpu::ShaderStages::FRAGMENT
            | wgpu::ShaderStages::COMPUTE;
        let mut texture_entries = Vec::new();
        let mut sampler_slots = Vec::with_capacity(desc.uniforms.len());
        let mut slot = 0;
        for decl in &desc.uniforms {
            if !decl.kind.is_sampler() {
                sampler_slots.push(None);
                continue;
            }
            let binding = slot as u32 * 2;
            texture_entries.push(wgpu::BindGroupLayoutEntry {
                binding,
                visibility: stages,
                ty: convert::texture_binding(decl.kind),
                count: None,
            });
            if decl.kind != UniformKind::Sampler2DMultisample {
                texture_entries.push(wgpu::BindGroupLayoutEntry {
                    binding: binding + 1,
                    visibility: stages,
                    ty: convert::sampler_binding(decl.kind),
                    count: None,
                });
            }
            sampler_slots.push(Some(slot));
            slot += 1;
        }
        let texture_layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(&desc.name),
                entries: &texture_entries,
            });

        let storage_entries: Vec<wgpu::BindGroupLayoutEntry> = desc
            .storage
            .iter()
            .map(|decl| wgpu::BindGroupLayoutEntry {
                binding: decl.binding,
                // writable storage is not available to vertex shaders
                visibility: if decl.read_only {
                    stages
                } else {
                    wgpu::ShaderStages::FRAGMENT | wgpu::ShaderStages::COMPUTE
                },
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage {
                        read_only: decl.read_only,
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        let storage_layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(&desc.name),
                entries: &storage_entries,
            });

        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&desc.name),
                bind_group_layouts: &[
                    &self.block_layout,
                    &self.material_layout,
                    &texture_layout,
                    &storage_layout,
                ],
                push_constant_ranges: &[],
            });

        let compute_pipeline = desc.is_compute().then(|| {
            self.device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(&desc.name),
                    layout: Some(&pipeline_layout),
                    module: &module,
                    entry_point: "cs_main",
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                })
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::ProgramLinkFailed {
                name: desc.name.clone(),
                message: error.to_string(),
            });
        }
        log::debug!("Linked program {}", desc.name);

        let uniforms = desc
            .uniforms
            .iter()
            .enumerate()
            .map(|(i, decl)| UniformInfo {
                name: decl.name.clone(),
                kind: decl.kind,
                count: decl.count,
                location: UniformLocation(i as u32),
            })
            .collect();
        let id = self.allocate_id();
        self.programs.insert(
            id,
            GpuProgram {
                desc: desc.clone(),
                uniforms,
                material: vec![0u8; layout.size as usize],
                layout,
                units: vec![0; slot],
                sampler_slots,
                module,
                pipeline_layout,
                texture_layout,
                storage_layout,
                compute_pipeline,
            },
        );
        Ok(ProgramHandle(id))
    }

    fn destroy_program(&mut self, program: ProgramHandle) {
        self.end_render_pass();
        self.end_compute_pass();
        self.programs.remove(&program.0);
        self.pipeline_cache.retain(|key, _| key.program != program.0);
        if self.current_program == Some(program.0) {
            self.current_program = None;
        }
    }

    fn program_uniforms(&self, program: ProgramHandle) -> Vec<UniformInfo> {
        self.programs
            .get(&program.0)
            .map(|p| p.uniforms.clone())
            .unwrap_or_default()
    }

    fn use_program(&mut self, program: ProgramHandle) {
        self.current_program = Some(program.0);
    }

    fn set_uniform(&mut self, location: UniformLocation, data: &UniformData) -> BackendResult<()> {
        let program = self
            .current_program
            .and_then(|id| self.programs.get_mut(&id))
            .ok_or_else(|| BackendError::InvalidOperation("set_uniform without a program".into()))?;
        let index = location.0 as usize;
        let info = program.uniforms.get(index).ok_or_else(|| {
            BackendError::InvalidOperation(format!(
                "{}: uniform location {} out of range",
                program.desc.name, location.0
            ))
        })?;
        if !data.matches(info.kind) {
            return Err(BackendError::UniformTypeMismatch {
                name: info.name.clone(),
                expected: info.kind,
            });
        }
        match (data, program.sampler_slots[index]) {
            (UniformData::TextureUnit(unit), Some(slot)) => program.units[slot] = *unit,
            (_, _) => {
                if let Some((offset, stride)) = program.layout.entries[index] {
                    let offset = offset as usize;
                    data.write_std(&mut program.material[offset..], stride as usize);
                }
            }
        }
        Ok(())
    }

    fn bind_texture(&mut self, unit: u32, texture: TextureHandle) {
        self.texture_units.insert(unit, texture);
    }

    fn create_vertex_array(&mut self, desc: &VertexArrayDescriptor) -> BackendResult<VertexArrayHandle> {
        if !self.buffers.contains_key(&desc.vertex_buffer.0)
            || !self.buffers.contains_key(&desc.index_buffer.0)
        {
            return Err(BackendError::InvalidHandle(format!(
                "{}: vertex or index buffer missing",
                desc.label
            )));
        }
        let id = self.allocate_id();
        self.vertex_arrays.insert(
            id,
            GpuVertexArray {
                desc: desc.clone(),
                instance: None,
            },
        );
        Ok(VertexArrayHandle(id))
    }

    fn destroy_vertex_array(&mut self, vertex_array: VertexArrayHandle) {
        self.vertex_arrays.remove(&vertex_array.0);
        if self.current_vertex_array == Some(vertex_array.0) {
            self.current_vertex_array = None;
        }
    }

    fn set_instance_stream(
        &mut self,
        vertex_array: VertexArrayHandle,
        stream: Option<InstanceStream>,
    ) -> BackendResult<()> {
        let vao = self
            .vertex_arrays
            .get_mut(&vertex_array.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("vertex array {:?}", vertex_array)))?;
        vao.instance = stream;
        Ok(())
    }

    fn bind_vertex_array(&mut self, vertex_array: VertexArrayHandle) {
        self.current_vertex_array = Some(vertex_array.0);
    }

    fn draw_elements(
        &mut self,
        mode: PrimitiveMode,
        index_count: u32,
        instance_count: u32,
    ) -> BackendResult<()> {
        let program = self
            .current_program
            .ok_or_else(|| BackendError::InvalidOperation("draw without a program".into()))?;
        let vao_id = self
            .current_vertex_array
            .ok_or_else(|| BackendError::InvalidOperation("draw without a vertex array".into()))?;
        let vao = self
            .vertex_arrays
            .get(&vao_id)
            .ok_or_else(|| BackendError::InvalidHandle(format!("vertex array {}", vao_id)))?;
        let (vertex_layout, instance) = (vao.desc.layout.clone(), vao.instance.clone());
        let (vertex_buffer, index_buffer) = (vao.desc.vertex_buffer.0, vao.desc.index_buffer.0);
        if index_count > vao.desc.index_count {
            return Err(BackendError::InvalidOperation(format!(
                "{}: {} indices requested, {} available",
                vao.desc.label, index_count, vao.desc.index_count
            )));
        }
        if self.check_framebuffer_status() != FramebufferStatus::Complete {
            return Err(BackendError::InvalidOperation(
                "draw into an incomplete framebuffer".into(),
            ));
        }
        if index_count == 0 || instance_count == 0 {
            return Ok(());
        }

        let target = self.current_target()?;
        let format_of = |image: &TargetImage| -> BackendResult<(wgpu::TextureFormat, u32, (u32, u32))> {
            let gpu = self.gpu_texture(image.texture)?;
            let samples = if gpu.desc.target == TextureTarget::D2Multisample {
                gpu.desc.samples
            } else {
                1
            };
            Ok((
                convert::texture_format(gpu.desc.format),
                samples,
                gpu.desc.level_size(image.level),
            ))
        };
        let mut colors = Vec::with_capacity(target.colors.len());
        let mut samples = 1;
        let mut size = (1, 1);
        for image in &target.colors {
            let (format, s, extent) = format_of(image)?;
            colors.push(format);
            samples = s;
            size = extent;
        }
        let depth = match &target.depth {
            Some(image) => {
                let (format, s, extent) = format_of(image)?;
                samples = s;
                size = extent;
                Some(format)
            }
            None => None,
        };

        let key = PipelineKey {
            program,
            colors,
            depth,
            samples,
            state: self.state,
            vertex: vertex_layout,
            instance: instance.as_ref().map(|s| s.layout.clone()),
            mode,
        };
        let pipeline = self.render_pipeline(key)?;
        let bind_groups = self.build_bind_groups(program)?;

        // GL viewports have a bottom-left origin
        let (x, y, w, h) = self.viewport;
        let (tw, th) = (size.0 as f32, size.1 as f32);
        let x0 = (x as f32).clamp(0.0, tw - 1.0);
        let w = (w as f32).min(tw - x0).max(1.0);
        let top = th - (y as f32 + h as f32);
        let y0 = top.clamp(0.0, th - 1.0);
        let h = (h as f32).min(th - y0).max(1.0);

        self.begin_pass(target);
        if let Some(pending) = &mut self.pending_render_pass {
            pending.draws.push(DrawCall {
                pipeline,
                bind_groups,
                vertex_buffer,
                instance_buffer: instance.map(|s| s.buffer.0),
                index_buffer,
                viewport: [x0, y0, w, h],
                index_count,
                instance_count,
            });
        }
        Ok(())
    }

    fn dispatch_compute(&mut self, x: u32, y: u32, z: u32) -> BackendResult<()> {
        let program = self
            .current_program
            .ok_or_else(|| BackendError::InvalidOperation("dispatch without a program".into()))?;
        let is_compute = self
            .programs
            .get(&program)
            .map(|p| p.compute_pipeline.is_some())
            .unwrap_or(false);
        if !is_compute {
            return Err(BackendError::InvalidOperation(
                "dispatch with a graphics program".into(),
            ));
        }
        self.end_render_pass();
        let bind_groups = self.build_bind_groups(program)?;
        self.pending_dispatches.push(DispatchCall {
            program,
            bind_groups,
            groups: [x, y, z],
        });
        Ok(())
    }

    fn memory_barrier(&mut self) {
        // Pass boundaries are synchronization points in wgpu
        self.end_compute_pass();
    }

    fn flush(&mut self) -> BackendResult<()> {
        self.submit();
        Ok(())
    }

    fn present(&mut self) -> BackendResult<()> {
        self.submit();
        self.present_window()
    }
}
