//! Headless CPU backend for tests and tools.
//!
//! Textures own real pixel storage, so clears, blits, mipmap generation and
//! readback behave like a GPU would. Draws and compute dispatches do not
//! rasterize; they are recorded with the state they were issued under so
//! callers can inspect pass order, bound targets and uploaded uniforms.

use std::collections::{BTreeMap, HashMap};

use crate::backend::traits::*;
use crate::backend::types::*;

/// Pixel storage of one texture: one buffer per mip level holding every layer.
#[derive(Debug, Clone)]
struct TextureImage {
    desc: TextureDescriptor,
    levels: Vec<Vec<u8>>,
}

impl TextureImage {
    fn new(desc: &TextureDescriptor) -> Self {
        let bpp = desc.format.bytes_per_pixel() as usize;
        let levels = (0..desc.mip_levels())
            .map(|level| {
                let (w, h) = desc.level_size(level);
                vec![0u8; w as usize * h as usize * bpp * desc.layers_at(level) as usize]
            })
            .collect();
        Self {
            desc: desc.clone(),
            levels,
        }
    }

    fn layer_bytes(&self, level: u32) -> usize {
        let (w, h) = self.desc.level_size(level);
        w as usize * h as usize * self.desc.format.bytes_per_pixel() as usize
    }

    fn texel_offset(&self, layer: u32, level: u32, x: u32, y: u32) -> usize {
        let (w, _) = self.desc.level_size(level);
        let bpp = self.desc.format.bytes_per_pixel() as usize;
        layer as usize * self.layer_bytes(level) + (y as usize * w as usize + x as usize) * bpp
    }

    fn get(&self, layer: u32, level: u32, x: u32, y: u32) -> [f32; 4] {
        let offset = self.texel_offset(layer, level, x, y);
        let bpp = self.desc.format.bytes_per_pixel() as usize;
        self.desc
            .format
            .decode_texel(&self.levels[level as usize][offset..offset + bpp])
    }

    fn set(&mut self, layer: u32, level: u32, x: u32, y: u32, value: [f32; 4]) {
        let offset = self.texel_offset(layer, level, x, y);
        let bpp = self.desc.format.bytes_per_pixel() as usize;
        let format = self.desc.format;
        format.encode_texel(value, &mut self.levels[level as usize][offset..offset + bpp]);
    }

    fn fill(&mut self, layer: u32, level: u32, value: [f32; 4]) {
        let bpp = self.desc.format.bytes_per_pixel() as usize;
        let mut texel = vec![0u8; bpp];
        self.desc.format.encode_texel(value, &mut texel);
        let start = layer as usize * self.layer_bytes(level);
        let end = start + self.layer_bytes(level);
        for chunk in self.levels[level as usize][start..end].chunks_exact_mut(bpp) {
            chunk.copy_from_slice(&texel);
        }
    }

    fn sample(&self, layer: u32, level: u32, x: f32, y: f32, linear: bool) -> [f32; 4] {
        let (w, h) = self.desc.level_size(level);
        let clamp_x = |v: i64| v.clamp(0, w as i64 - 1) as u32;
        let clamp_y = |v: i64| v.clamp(0, h as i64 - 1) as u32;
        if !linear {
            return self.get(layer, level, clamp_x(x.floor() as i64), clamp_y(y.floor() as i64));
        }
        let fx = x - 0.5;
        let fy = y - 0.5;
        let x0 = fx.floor();
        let y0 = fy.floor();
        let tx = fx - x0;
        let ty = fy - y0;
        let (x0, y0) = (x0 as i64, y0 as i64);
        let a = self.get(layer, level, clamp_x(x0), clamp_y(y0));
        let b = self.get(layer, level, clamp_x(x0 + 1), clamp_y(y0));
        let c = self.get(layer, level, clamp_x(x0), clamp_y(y0 + 1));
        let d = self.get(layer, level, clamp_x(x0 + 1), clamp_y(y0 + 1));
        let mut out = [0.0; 4];
        for i in 0..4 {
            let top = a[i] + (b[i] - a[i]) * tx;
            let bottom = c[i] + (d[i] - c[i]) * tx;
            out[i] = top + (bottom - top) * ty;
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Attachment {
    texture: TextureHandle,
    target: AttachTarget,
}

#[derive(Debug, Clone, Default)]
struct DummyFramebuffer {
    colors: BTreeMap<u32, Attachment>,
    depth: Option<(AttachmentPoint, Attachment)>,
    draw_buffers: u32,
    read_buffer: Option<u32>,
}

#[derive(Debug, Clone)]
struct DummyProgram {
    desc: ProgramDescriptor,
    uniforms: Vec<UniformInfo>,
    values: HashMap<u32, UniformData>,
}

#[derive(Debug, Clone)]
struct DummyVertexArray {
    desc: VertexArrayDescriptor,
    instance: Option<InstanceStream>,
}

/// A draw call as seen by the backend
#[derive(Debug, Clone)]
pub struct DrawRecord {
    pub program: ProgramHandle,
    pub program_name: String,
    pub framebuffer: Option<FramebufferHandle>,
    pub color_attachments: Vec<(TextureHandle, AttachTarget)>,
    pub depth_attachment: Option<TextureHandle>,
    pub viewport: (i32, i32, u32, u32),
    pub state: PipelineState,
    pub mode: PrimitiveMode,
    pub index_count: u32,
    pub instance_count: u32,
    pub vertex_array: Option<VertexArrayHandle>,
    pub instance_stream: Option<InstanceStream>,
    pub uniforms: HashMap<String, UniformData>,
    pub textures: HashMap<String, TextureHandle>,
}

/// Recorded backend activity
#[derive(Debug, Clone)]
pub enum DummyCommand {
    Clear {
        framebuffer: Option<FramebufferHandle>,
        value: ClearValue,
    },
    Blit {
        src: Option<FramebufferHandle>,
        dst: Option<FramebufferHandle>,
        src_rect: BlitRect,
        dst_rect: BlitRect,
    },
    Draw(Box<DrawRecord>),
    Dispatch {
        program: ProgramHandle,
        program_name: String,
        groups: [u32; 3],
        storage: Vec<(u32, BufferHandle)>,
    },
    Barrier,
    GenerateMipmaps(TextureHandle),
    Present,
}

/// Dummy GPU backend.
#[derive(Debug)]
pub struct DummyBackend {
    width: u32,
    height: u32,
    next_id: u64,
    textures: HashMap<u64, TextureImage>,
    buffers: HashMap<u64, (BufferDescriptor, Vec<u8>)>,
    framebuffers: HashMap<u64, DummyFramebuffer>,
    window: TextureImage,
    bound_framebuffer: Option<u64>,
    programs: HashMap<u64, DummyProgram>,
    vertex_arrays: HashMap<u64, DummyVertexArray>,
    current_program: Option<u64>,
    current_vertex_array: Option<u64>,
    texture_units: HashMap<u32, TextureHandle>,
    buffer_bindings: HashMap<(BufferKind, u32), BufferHandle>,
    viewport: (i32, i32, u32, u32),
    state: PipelineState,
    recording: bool,
    commands: Vec<DummyCommand>,
}

impl DummyBackend {
    /// Create a new dummy backend with a window of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            next_id: 1,
            textures: HashMap::new(),
            buffers: HashMap::new(),
            framebuffers: HashMap::new(),
            window: TextureImage::new(&Self::window_desc(width, height)),
            bound_framebuffer: None,
            programs: HashMap::new(),
            vertex_arrays: HashMap::new(),
            current_program: None,
            current_vertex_array: None,
            texture_units: HashMap::new(),
            buffer_bindings: HashMap::new(),
            viewport: (0, 0, width, height),
            state: PipelineState::default(),
            recording: true,
            commands: Vec::new(),
        }
    }

    fn window_desc(width: u32, height: u32) -> TextureDescriptor {
        TextureDescriptor {
            label: "window".into(),
            width: width.max(1),
            height: height.max(1),
            format: TextureFormat::Rgba8Unorm,
            attachment: true,
            ..Default::default()
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Toggle command recording.
    pub fn set_recording(&mut self, recording: bool) {
        self.recording = recording;
    }

    /// Recorded commands since the last take.
    pub fn commands(&self) -> &[DummyCommand] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<DummyCommand> {
        std::mem::take(&mut self.commands)
    }

    /// Recorded draws in submission order.
    pub fn draws(&self) -> impl Iterator<Item = &DrawRecord> {
        self.commands.iter().filter_map(|c| match c {
            DummyCommand::Draw(draw) => Some(draw.as_ref()),
            _ => None,
        })
    }

    pub fn texture_descriptor(&self, texture: TextureHandle) -> Option<&TextureDescriptor> {
        self.textures.get(&texture.0).map(|t| &t.desc)
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn viewport(&self) -> (i32, i32, u32, u32) {
        self.viewport
    }

    /// Pixels of the default framebuffer, RGBA8.
    pub fn window_pixels(&self) -> &[u8] {
        &self.window.levels[0]
    }

    fn record(&mut self, command: DummyCommand) {
        if self.recording {
            self.commands.push(command);
        }
    }

    fn image(&self, texture: TextureHandle) -> BackendResult<&TextureImage> {
        self.textures
            .get(&texture.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("texture {:?}", texture)))
    }

    /// Color attachments receiving draws, in draw-buffer order.
    fn draw_targets(&self, framebuffer: Option<u64>) -> Vec<Attachment> {
        match framebuffer.and_then(|id| self.framebuffers.get(&id)) {
            Some(fb) => (0..fb.draw_buffers)
                .filter_map(|i| fb.colors.get(&i).copied())
                .collect(),
            None => Vec::new(),
        }
    }

    fn status_of(&self, fb: &DummyFramebuffer) -> FramebufferStatus {
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

    fn blit_image(
        &mut self,
        src: (Option<TextureHandle>, AttachTarget),
        src_rect: BlitRect,
        dst: (Option<TextureHandle>, AttachTarget),
        dst_rect: BlitRect,
        linear: bool,
    ) -> BackendResult<()> {
        let source = match src.0 {
            Some(texture) => self.image(texture)?.clone(),
            None => self.window.clone(),
        };
        let (src_layer, src_level) = (src.1.layer(), src.1.level());
        let (dst_layer, dst_level) = (dst.1.layer(), dst.1.level());
        let target = match dst.0 {
            Some(texture) => self
                .textures
                .get_mut(&texture.0)
                .ok_or_else(|| BackendError::InvalidHandle(format!("texture {:?}", texture)))?,
            None => &mut self.window,
        };
        let (dw, dh) = target.desc.level_size(dst_level);
        let (sx0, sx1) = (src_rect.x0 as f32, src_rect.x1 as f32);
        let (sy0, sy1) = (src_rect.y0 as f32, src_rect.y1 as f32);
        let dst_w = (dst_rect.x1 - dst_rect.x0) as f32;
        let dst_h = (dst_rect.y1 - dst_rect.y0) as f32;
        if dst_w == 0.0 || dst_h == 0.0 {
            return Ok(());
        }
        let x_range = dst_rect.x0.min(dst_rect.x1).max(0)..dst_rect.x0.max(dst_rect.x1).min(dw as i32);
        let y_range = dst_rect.y0.min(dst_rect.y1).max(0)..dst_rect.y0.max(dst_rect.y1).min(dh as i32);
        for y in y_range {
            let v = (y as f32 + 0.5 - dst_rect.y0 as f32) / dst_h;
            let sy = sy0 + v * (sy1 - sy0);
            for x in x_range.clone() {
                let u = (x as f32 + 0.5 - dst_rect.x0 as f32) / dst_w;
                let sx = sx0 + u * (sx1 - sx0);
                let value = source.sample(src_layer, src_level, sx, sy, linear);
                target.set(dst_layer, dst_level, x as u32, y as u32, value);
            }
        }
        Ok(())
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new(1280, 720)
    }
}

impl GraphicsBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.window = TextureImage::new(&Self::window_desc(width, height));
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 || desc.depth == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "{}: zero extent {}x{}x{}",
                desc.label, desc.width, desc.height, desc.depth
            )));
        }
        log::trace!(
            "DummyBackend: creating texture {:?} ({}x{}x{})",
            desc.label,
            desc.width,
            desc.height,
            desc.depth
        );
        let id = self.allocate_id();
        self.textures.insert(id, TextureImage::new(desc));
        Ok(TextureHandle(id))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        log::trace!("DummyBackend: destroying texture {:?}", texture);
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
        let image = self
            .textures
            .get_mut(&texture.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("texture {:?}", texture)))?;
        if level >= image.desc.mip_levels() {
            return Err(BackendError::InvalidOperation(format!(
                "{}: level {} out of range",
                image.desc.label, level
            )));
        }
        let layer_bytes = image.layer_bytes(level);
        let start = layer as usize * layer_bytes;
        let end = start + data.len();
        let storage = &mut image.levels[level as usize];
        if end > storage.len() || data.len() % layer_bytes != 0 {
            return Err(BackendError::InvalidOperation(format!(
                "{}: upload of {} bytes does not fit layer {}",
                image.desc.label,
                data.len(),
                layer
            )));
        }
        storage[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_texture(
        &mut self,
        texture: TextureHandle,
        layer: u32,
        level: u32,
    ) -> BackendResult<Vec<u8>> {
        let image = self.image(texture)?;
        if level >= image.desc.mip_levels() || layer >= image.desc.layers_at(level) {
            return Err(BackendError::ReadbackFailed(format!(
                "{}: layer {} level {} out of range",
                image.desc.label, layer, level
            )));
        }
        let size = image.layer_bytes(level);
        let start = layer as usize * size;
        Ok(image.levels[level as usize][start..start + size].to_vec())
    }

    fn generate_mipmaps(&mut self, texture: TextureHandle) -> BackendResult<()> {
        let image = self
            .textures
            .get_mut(&texture.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("texture {:?}", texture)))?;
        for level in 1..image.desc.mip_levels() {
            let (w, h) = image.desc.level_size(level);
            let (pw, ph) = image.desc.level_size(level - 1);
            let layers = image.desc.layers_at(level);
            let prev_layers = image.desc.layers_at(level - 1);
            for layer in 0..layers {
                let source_layers: Vec<u32> = if image.desc.target == TextureTarget::D3 {
                    (layer * 2..(layer * 2 + 2).min(prev_layers)).collect()
                } else {
                    vec![layer]
                };
                for y in 0..h {
                    for x in 0..w {
                        let mut sum = [0.0f32; 4];
                        let mut count = 0.0;
                        for &src_layer in &source_layers {
                            for (ox, oy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                                let sx = (x * 2 + ox).min(pw - 1);
                                let sy = (y * 2 + oy).min(ph - 1);
                                let v = image.get(src_layer, level - 1, sx, sy);
                                for c in 0..4 {
                                    sum[c] += v[c];
                                }
                                count += 1.0;
                            }
                        }
                        image.set(layer, level, x, y, sum.map(|s| s / count));
                    }
                }
            }
        }
        self.record(DummyCommand::GenerateMipmaps(texture));
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        log::trace!(
            "DummyBackend: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        let id = self.allocate_id();
        self.buffers
            .insert(id, (desc.clone(), vec![0u8; desc.size as usize]));
        Ok(BufferHandle(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
        self.buffer_bindings.retain(|_, bound| *bound != buffer);
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let (desc, storage) = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("buffer {:?}", buffer)))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > storage.len() {
            return Err(BackendError::InvalidOperation(format!(
                "{}: write of {} bytes at {} exceeds size {}",
                desc.label,
                data.len(),
                offset,
                storage.len()
            )));
        }
        storage[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> BackendResult<Vec<u8>> {
        self.buffers
            .get(&buffer.0)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| BackendError::InvalidHandle(format!("buffer {:?}", buffer)))
    }

    fn bind_buffer_base(&mut self, kind: BufferKind, index: u32, buffer: BufferHandle) {
        self.buffer_bindings.insert((kind, index), buffer);
    }

    fn create_framebuffer(&mut self) -> BackendResult<FramebufferHandle> {
        let id = self.allocate_id();
        self.framebuffers.insert(id, DummyFramebuffer::default());
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
                    return Err(BackendError::InvalidHandle(format!("framebuffer {:?}", handle)));
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
                BackendError::InvalidOperation("framebuffer command without a bound framebuffer".into())
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
        match self.bound_framebuffer.and_then(|id| self.framebuffers.get(&id)) {
            Some(fb) => self.status_of(fb),
            None => FramebufferStatus::Complete,
        }
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
        let lookup = |handle: Option<FramebufferHandle>| -> BackendResult<Option<DummyFramebuffer>> {
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

        if mask.color {
            let source = match &src_fb {
                Some(fb) => {
                    let index = fb.read_buffer.unwrap_or(0);
                    let attachment = fb.colors.get(&index).ok_or_else(|| {
                        BackendError::InvalidOperation("blit source has no read buffer".into())
                    })?;
                    (Some(attachment.texture), attachment.target)
                }
                None => (None, AttachTarget::Level(0)),
            };
            let targets: Vec<(Option<TextureHandle>, AttachTarget)> = match &dst_fb {
                Some(fb) => (0..fb.draw_buffers.max(1))
                    .filter_map(|i| fb.colors.get(&i))
                    .map(|a| (Some(a.texture), a.target))
                    .collect(),
                None => vec![(None, AttachTarget::Level(0))],
            };
            for target in targets {
                self.blit_image(source, src_rect, target, dst_rect, linear)?;
            }
        }
        if mask.depth {
            let source = src_fb.as_ref().and_then(|fb| fb.depth).map(|(_, a)| a);
            let target = dst_fb.as_ref().and_then(|fb| fb.depth).map(|(_, a)| a);
            if let (Some(s), Some(d)) = (source, target) {
                self.blit_image(
                    (Some(s.texture), s.target),
                    src_rect,
                    (Some(d.texture), d.target),
                    dst_rect,
                    false,
                )?;
            }
        }
        self.record(DummyCommand::Blit {
            src,
            dst,
            src_rect,
            dst_rect,
        });
        Ok(())
    }

    fn set_viewport(&mut self, x: i32, y: i32, width: u32, height: u32) {
        self.viewport = (x, y, width, height);
    }

    fn clear(&mut self, value: ClearValue) -> BackendResult<()> {
        let bound = self.bound_framebuffer;
        match bound {
            Some(id) => {
                let fb = self.framebuffers.get(&id).cloned().unwrap_or_default();
                if let Some(color) = value.color {
                    for attachment in self.draw_targets(bound) {
                        if let Some(image) = self.textures.get_mut(&attachment.texture.0) {
                            image.fill(attachment.target.layer(), attachment.target.level(), color);
                        }
                    }
                }
                if let (Some(depth), Some((_, attachment))) = (value.depth, fb.depth) {
                    if let Some(image) = self.textures.get_mut(&attachment.texture.0) {
                        image.fill(
                            attachment.target.layer(),
                            attachment.target.level(),
                            [depth, 0.0, 0.0, 1.0],
                        );
                    }
                }
            }
            None => {
                if let Some(color) = value.color {
                    self.window.fill(0, 0, color);
                }
            }
        }
        self.record(DummyCommand::Clear {
            framebuffer: bound.map(FramebufferHandle),
            value,
        });
        Ok(())
    }

    fn set_pipeline_state(&mut self, state: &PipelineState) {
        self.state = *state;
    }

    fn pipeline_state(&self) -> PipelineState {
        self.state
    }

    fn create_program(&mut self, desc: &ProgramDescriptor) -> BackendResult<ProgramHandle> {
        let empty = match &desc.stages {
            ProgramStages::Graphics {
                vertex, fragment, ..
            } => vertex.trim().is_empty() || fragment.trim().is_empty(),
            ProgramStages::Compute { source, .. } => source.trim().is_empty(),
        };
        if empty {
            return Err(BackendError::ProgramLinkFailed {
                name: desc.name.clone(),
                message: "missing shader stage".into(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for uniform in &desc.uniforms {
            if !seen.insert(uniform.name.as_str()) {
                return Err(BackendError::ProgramLinkFailed {
                    name: desc.name.clone(),
                    message: format!("uniform '{}' declared twice", uniform.name),
                });
            }
        }
        log::trace!("DummyBackend: linking program {:?}", desc.name);
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
            DummyProgram {
                desc: desc.clone(),
                uniforms,
                values: HashMap::new(),
            },
        );
        Ok(ProgramHandle(id))
    }

    fn destroy_program(&mut self, program: ProgramHandle) {
        self.programs.remove(&program.0);
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
        let info = program.uniforms.get(location.0 as usize).ok_or_else(|| {
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
        program.values.insert(location.0, data.clone());
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
            DummyVertexArray {
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
        let program_id = self
            .current_program
            .ok_or_else(|| BackendError::InvalidOperation("draw without a program".into()))?;
        let program = self
            .programs
            .get(&program_id)
            .ok_or_else(|| BackendError::InvalidHandle(format!("program {}", program_id)))?;
        if program.desc.is_compute() {
            return Err(BackendError::InvalidOperation(format!(
                "{}: draw with a compute program",
                program.desc.name
            )));
        }
        let vao = self
            .current_vertex_array
            .and_then(|id| self.vertex_arrays.get(&id))
            .ok_or_else(|| BackendError::InvalidOperation("draw without a vertex array".into()))?;
        if index_count > vao.desc.index_count {
            return Err(BackendError::InvalidOperation(format!(
                "{}: {} indices requested, {} available",
                vao.desc.label, index_count, vao.desc.index_count
            )));
        }
        if self.check_framebuffer_status() != FramebufferStatus::Complete {
            return Err(BackendError::InvalidOperation(format!(
                "{}: draw into an incomplete framebuffer",
                program.desc.name
            )));
        }
        if !self.recording {
            return Ok(());
        }
        let mut uniforms = HashMap::new();
        let mut textures = HashMap::new();
        for info in &program.uniforms {
            if let Some(value) = program.values.get(&info.location.0) {
                if let UniformData::TextureUnit(unit) = value {
                    if let Some(texture) = self.texture_units.get(unit) {
                        textures.insert(info.name.clone(), *texture);
                    }
                }
                uniforms.insert(info.name.clone(), value.clone());
            }
        }
        let fb = self.bound_framebuffer.and_then(|id| self.framebuffers.get(&id));
        let record = DrawRecord {
            program: ProgramHandle(program_id),
            program_name: program.desc.name.clone(),
            framebuffer: self.bound_framebuffer.map(FramebufferHandle),
            color_attachments: self
                .draw_targets(self.bound_framebuffer)
                .into_iter()
                .map(|a| (a.texture, a.target))
                .collect(),
            depth_attachment: fb.and_then(|fb| fb.depth).map(|(_, a)| a.texture),
            viewport: self.viewport,
            state: self.state,
            mode,
            index_count,
            instance_count,
            vertex_array: self.current_vertex_array.map(VertexArrayHandle),
            instance_stream: vao.instance.clone(),
            uniforms,
            textures,
        };
        log::trace!(
            "DummyBackend: draw {} ({} indices x {})",
            record.program_name,
            index_count,
            instance_count
        );
        self.commands.push(DummyCommand::Draw(Box::new(record)));
        Ok(())
    }

    fn dispatch_compute(&mut self, x: u32, y: u32, z: u32) -> BackendResult<()> {
        let program_id = self
            .current_program
            .ok_or_else(|| BackendError::InvalidOperation("dispatch without a program".into()))?;
        let program = self
            .programs
            .get(&program_id)
            .ok_or_else(|| BackendError::InvalidHandle(format!("program {}", program_id)))?;
        if !program.desc.is_compute() {
            return Err(BackendError::InvalidOperation(format!(
                "{}: dispatch with a graphics program",
                program.desc.name
            )));
        }
        let mut storage: Vec<(u32, BufferHandle)> = self
            .buffer_bindings
            .iter()
            .filter(|((kind, _), _)| *kind == BufferKind::Storage)
            .map(|((_, index), buffer)| (*index, *buffer))
            .collect();
        storage.sort_by_key(|(index, _)| *index);
        let name = program.desc.name.clone();
        self.record(DummyCommand::Dispatch {
            program: ProgramHandle(program_id),
            program_name: name,
            groups: [x, y, z],
            storage,
        });
        Ok(())
    }

    fn memory_barrier(&mut self) {
        self.record(DummyCommand::Barrier);
    }

    fn flush(&mut self) -> BackendResult<()> {
        Ok(())
    }

    fn present(&mut self) -> BackendResult<()> {
        self.record(DummyCommand::Present);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color_texture(backend: &mut DummyBackend, width: u32, height: u32) -> TextureHandle {
        backend
            .create_texture(&TextureDescriptor {
                label: "color".into(),
                width,
                height,
                format: TextureFormat::Rgba8Unorm,
                attachment: true,
                ..Default::default()
            })
            .unwrap()
    }

    fn framebuffer_with(backend: &mut DummyBackend, texture: TextureHandle) -> FramebufferHandle {
        let fb = backend.create_framebuffer().unwrap();
        backend
            .execute_framebuffer_command(&FramebufferCommand::Bind(fb))
            .unwrap();
        backend
            .execute_framebuffer_command(&FramebufferCommand::Attach {
                point: AttachmentPoint::Color(0),
                texture,
                target: AttachTarget::Level(0),
            })
            .unwrap();
        backend
            .execute_framebuffer_command(&FramebufferCommand::DrawBuffers(1))
            .unwrap();
        fb
    }

    #[test]
    fn test_clear_and_readback() {
        let mut backend = DummyBackend::new(4, 4);
        let texture = color_texture(&mut backend, 2, 2);
        framebuffer_with(&mut backend, texture);
        assert_eq!(backend.check_framebuffer_status(), FramebufferStatus::Complete);
        backend.clear(ClearValue::color([1.0, 0.0, 0.0, 1.0])).unwrap();
        let pixels = backend.read_texture(texture, 0, 0).unwrap();
        assert_eq!(&pixels[0..4], &[255, 0, 0, 255]);
        assert_eq!(&pixels[12..16], &[255, 0, 0, 255]);
    }

    #[test]
    fn test_mirror_blit_flips_columns() {
        let mut backend = DummyBackend::new(4, 4);
        let src = color_texture(&mut backend, 2, 1);
        let dst = color_texture(&mut backend, 2, 1);
        backend
            .write_texture(src, 0, 0, &[255, 0, 0, 255, 0, 255, 0, 255])
            .unwrap();
        let src_fb = framebuffer_with(&mut backend, src);
        let dst_fb = framebuffer_with(&mut backend, dst);
        let rect = BlitRect::new(2, 1);
        backend
            .blit_framebuffer(Some(src_fb), rect.mirrored_x(), Some(dst_fb), rect, BlitMask::COLOR, false)
            .unwrap();
        let pixels = backend.read_texture(dst, 0, 0).unwrap();
        assert_eq!(pixels, vec![0, 255, 0, 255, 255, 0, 0, 255]);
    }

    #[test]
    fn test_mismatched_sizes_are_incomplete() {
        let mut backend = DummyBackend::new(4, 4);
        let a = color_texture(&mut backend, 4, 4);
        let b = color_texture(&mut backend, 2, 2);
        framebuffer_with(&mut backend, a);
        backend
            .execute_framebuffer_command(&FramebufferCommand::Attach {
                point: AttachmentPoint::Color(1),
                texture: b,
                target: AttachTarget::Level(0),
            })
            .unwrap();
        assert_eq!(
            backend.check_framebuffer_status(),
            FramebufferStatus::IncompleteDimensions
        );
    }

    #[test]
    fn test_mipmap_box_filter() {
        let mut backend = DummyBackend::new(4, 4);
        let texture = backend
            .create_texture(&TextureDescriptor {
                label: "mips".into(),
                width: 2,
                height: 2,
                format: TextureFormat::R32Float,
                sampler: SamplerState {
                    min_filter: FilterMode::LinearMipmapLinear,
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap();
        let values: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        backend.write_texture(texture, 0, 0, &values).unwrap();
        backend.generate_mipmaps(texture).unwrap();
        let level1 = backend.read_texture(texture, 0, 1).unwrap();
        assert_eq!(f32::from_le_bytes([level1[0], level1[1], level1[2], level1[3]]), 2.5);
    }

    #[test]
    fn test_uniform_type_mismatch() {
        let mut backend = DummyBackend::new(4, 4);
        let program = backend
            .create_program(
                &ProgramDescriptor::graphics("p", "vs", "fs", 1).uniform("scale", UniformKind::Float),
            )
            .unwrap();
        backend.use_program(program);
        assert!(backend.set_uniform(UniformLocation(0), &UniformData::Float(1.0)).is_ok());
        assert!(matches!(
            backend.set_uniform(UniformLocation(0), &UniformData::Vec3([0.0; 3])),
            Err(BackendError::UniformTypeMismatch { .. })
        ));
    }
}
