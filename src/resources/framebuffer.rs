//! Framebuffer objects cached by attachment set
//!
//! Each framebuffer stores the ordered command list that binds its
//! attachments. The list is built once when the key is inserted and replayed
//! on every bind; changing the cube face, layer or level rebuilds it.

use std::collections::HashMap;

use crate::backend::*;
use crate::error::{RenderError, RenderResult};
use crate::resources::texture::Texture;

/// Attachment set identifying a framebuffer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FramebufferKey {
    pub colors: Vec<TextureHandle>,
    pub depth: Option<TextureHandle>,
}

impl FramebufferKey {
    pub fn new(colors: &[&Texture], depth: Option<&Texture>) -> Self {
        Self {
            colors: colors.iter().map(|t| t.handle).collect(),
            depth: depth.map(|t| t.handle),
        }
    }
}

/// Image selection applied to every attachment of a bind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttachOptions {
    pub face: u32,
    pub layer: u32,
    pub level: u32,
}

impl AttachOptions {
    pub fn face(face: u32) -> Self {
        Self {
            face,
            ..Default::default()
        }
    }

    pub fn layer(layer: u32) -> Self {
        Self {
            layer,
            ..Default::default()
        }
    }

    pub fn level(level: u32) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }
}

#[derive(Debug, Clone)]
struct AttachmentDesc {
    texture: TextureHandle,
    target: TextureTarget,
    format: TextureFormat,
    size: (u32, u32),
}

/// A cached framebuffer object
#[derive(Debug, Clone)]
pub struct Framebuffer {
    handle: FramebufferHandle,
    name: String,
    colors: Vec<AttachmentDesc>,
    depth: Option<AttachmentDesc>,
    options: AttachOptions,
    commands: Vec<FramebufferCommand>,
}

/// Plain view of a framebuffer used for blits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundFramebuffer {
    pub handle: FramebufferHandle,
    pub width: u32,
    pub height: u32,
}

impl BoundFramebuffer {
    pub fn rect(&self) -> BlitRect {
        BlitRect::new(self.width, self.height)
    }
}

impl Framebuffer {
    pub fn handle(&self) -> FramebufferHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn commands(&self) -> &[FramebufferCommand] {
        &self.commands
    }

    /// Viewport size: first color attachment, else depth, at the bound level.
    pub fn size(&self) -> (u32, u32) {
        let (w, h) = self
            .colors
            .first()
            .or(self.depth.as_ref())
            .map(|a| a.size)
            .unwrap_or((1, 1));
        let level = self.options.level;
        ((w >> level).max(1), (h >> level).max(1))
    }

    pub fn bound(&self) -> BoundFramebuffer {
        let (width, height) = self.size();
        BoundFramebuffer {
            handle: self.handle,
            width,
            height,
        }
    }

    fn attach_target(attachment: &AttachmentDesc, layer_offset: u32, options: AttachOptions) -> AttachTarget {
        let level = options.level;
        match attachment.target {
            TextureTarget::D2 | TextureTarget::D2Multisample => AttachTarget::Level(level),
            TextureTarget::D2Array => AttachTarget::Layer {
                layer: layer_offset + options.layer,
                level,
            },
            TextureTarget::D3 => AttachTarget::Layer {
                layer: options.layer,
                level,
            },
            TextureTarget::Cube => AttachTarget::CubeFace {
                face: options.face,
                level,
            },
        }
    }

    fn build_commands(&mut self) {
        let mut commands = vec![FramebufferCommand::Bind(self.handle)];
        let mut seen: HashMap<TextureHandle, u32> = HashMap::new();
        for (index, attachment) in self.colors.iter().enumerate() {
            // a texture repeated in the key occupies consecutive layers
            let offset = seen.entry(attachment.texture).or_insert(0);
            let target = Self::attach_target(attachment, *offset, self.options);
            *offset += 1;
            commands.push(FramebufferCommand::Attach {
                point: AttachmentPoint::Color(index as u32),
                texture: attachment.texture,
                target,
            });
        }
        if self.colors.is_empty() {
            commands.push(FramebufferCommand::ReadBuffer(None));
            commands.push(FramebufferCommand::DrawBufferNone);
        } else {
            commands.push(FramebufferCommand::ReadBuffer(Some(0)));
            commands.push(FramebufferCommand::DrawBuffers(self.colors.len() as u32));
        }
        if let Some(depth) = &self.depth {
            let point = if depth.format.has_stencil() {
                AttachmentPoint::DepthStencil
            } else {
                AttachmentPoint::Depth
            };
            commands.push(FramebufferCommand::Attach {
                point,
                texture: depth.texture,
                target: Self::attach_target(depth, 0, self.options),
            });
        }
        self.commands = commands;
    }

    fn run_commands(&self, backend: &mut dyn GraphicsBackend) -> RenderResult<()> {
        for command in &self.commands {
            backend.execute_framebuffer_command(command)?;
        }
        Ok(())
    }
}

/// Cache of framebuffer objects
#[derive(Default)]
pub struct FramebufferManager {
    framebuffers: HashMap<FramebufferKey, Framebuffer>,
}

impl FramebufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.framebuffers.is_empty()
    }

    fn create(
        backend: &mut dyn GraphicsBackend,
        colors: &[&Texture],
        depth: Option<&Texture>,
    ) -> RenderResult<Framebuffer> {
        let describe = |texture: &Texture| AttachmentDesc {
            texture: texture.handle,
            target: texture.desc.target,
            format: texture.desc.format,
            size: texture.size(),
        };
        let name = colors
            .iter()
            .copied()
            .chain(depth)
            .map(|t| t.name.as_str())
            .collect::<Vec<_>>()
            .join("+");
        let mut sizes = colors.iter().copied().chain(depth).map(|t| t.size());
        if let Some(first) = sizes.next() {
            if sizes.any(|size| size != first) {
                return Err(RenderError::RenderTargetSizeMismatch(name));
            }
        } else {
            return Err(RenderError::MissingResource("framebuffer without attachments".into()));
        }
        let handle = backend.create_framebuffer()?;
        log::debug!("Created framebuffer {}", name);
        let mut framebuffer = Framebuffer {
            handle,
            name,
            colors: colors.iter().map(|t| describe(t)).collect(),
            depth: depth.map(describe),
            options: AttachOptions::default(),
            commands: Vec::new(),
        };
        framebuffer.build_commands();
        Ok(framebuffer)
    }

    /// Look up or create the framebuffer for the key and select its images.
    /// Nothing is bound.
    pub fn get_framebuffer(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        colors: &[&Texture],
        depth: Option<&Texture>,
        options: AttachOptions,
    ) -> RenderResult<&Framebuffer> {
        let key = FramebufferKey::new(colors, depth);
        if !self.framebuffers.contains_key(&key) {
            let framebuffer = Self::create(backend, colors, depth)?;
            self.framebuffers.insert(key.clone(), framebuffer);
        }
        let framebuffer = self
            .framebuffers
            .get_mut(&key)
            .ok_or_else(|| RenderError::MissingResource("framebuffer".into()))?;
        if framebuffer.options != options {
            framebuffer.options = options;
            framebuffer.build_commands();
        }
        Ok(framebuffer)
    }

    /// Bind the framebuffer for the key, set the viewport to its size and
    /// verify completeness.
    pub fn bind_framebuffer(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        colors: &[&Texture],
        depth: Option<&Texture>,
    ) -> RenderResult<BoundFramebuffer> {
        self.bind_framebuffer_with(backend, colors, depth, AttachOptions::default())
    }

    pub fn bind_framebuffer_with(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        colors: &[&Texture],
        depth: Option<&Texture>,
        options: AttachOptions,
    ) -> RenderResult<BoundFramebuffer> {
        let framebuffer = self.get_framebuffer(backend, colors, depth, options)?;
        framebuffer.run_commands(backend)?;
        let bound = framebuffer.bound();
        backend.set_viewport(0, 0, bound.width, bound.height);
        match backend.check_framebuffer_status() {
            FramebufferStatus::Complete => Ok(bound),
            status => Err(RenderError::FramebufferIncomplete {
                key: framebuffer.name.clone(),
                status,
            }),
        }
    }

    /// Bind the window framebuffer.
    pub fn bind_default(&self, backend: &mut dyn GraphicsBackend) -> RenderResult<()> {
        backend.execute_framebuffer_command(&FramebufferCommand::BindDefault)?;
        let (width, height) = backend.surface_size();
        backend.set_viewport(0, 0, width, height);
        Ok(())
    }

    /// Filtered blit of `src`'s read buffer into `dst`.
    pub fn copy_from(
        &self,
        backend: &mut dyn GraphicsBackend,
        src: BoundFramebuffer,
        dst: BoundFramebuffer,
    ) -> RenderResult<()> {
        backend.blit_framebuffer(
            Some(src.handle),
            src.rect(),
            Some(dst.handle),
            dst.rect(),
            BlitMask::COLOR,
            true,
        )?;
        Ok(())
    }

    /// Depth-only blit; sizes must match.
    pub fn copy_depth_from(
        &self,
        backend: &mut dyn GraphicsBackend,
        src: BoundFramebuffer,
        dst: BoundFramebuffer,
    ) -> RenderResult<()> {
        backend.blit_framebuffer(
            Some(src.handle),
            src.rect(),
            Some(dst.handle),
            dst.rect(),
            BlitMask::DEPTH,
            false,
        )?;
        Ok(())
    }

    /// Blit with x flipped, matching cube-face handedness.
    pub fn mirror_from(
        &self,
        backend: &mut dyn GraphicsBackend,
        src: BoundFramebuffer,
        dst: BoundFramebuffer,
    ) -> RenderResult<()> {
        backend.blit_framebuffer(
            Some(src.handle),
            src.rect().mirrored_x(),
            Some(dst.handle),
            dst.rect(),
            BlitMask::COLOR,
            true,
        )?;
        Ok(())
    }

    /// Blit into the window framebuffer.
    pub fn blit_to_window(
        &self,
        backend: &mut dyn GraphicsBackend,
        src: BoundFramebuffer,
        width: u32,
        height: u32,
    ) -> RenderResult<()> {
        backend.blit_framebuffer(
            Some(src.handle),
            src.rect(),
            None,
            BlitRect::new(width, height),
            BlitMask::COLOR,
            true,
        )?;
        Ok(())
    }

    /// Rebuild every cached command list.
    pub fn rebuild_command(&mut self) {
        for framebuffer in self.framebuffers.values_mut() {
            framebuffer.build_commands();
        }
    }

    /// Destroy one cached framebuffer.
    pub fn delete_framebuffer(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        colors: &[&Texture],
        depth: Option<&Texture>,
    ) -> bool {
        match self.framebuffers.remove(&FramebufferKey::new(colors, depth)) {
            Some(framebuffer) => {
                backend.destroy_framebuffer(framebuffer.handle);
                true
            }
            None => false,
        }
    }

    /// Destroy every cached framebuffer; called when render targets are recreated.
    pub fn clear_framebuffer(&mut self, backend: &mut dyn GraphicsBackend) {
        for (_, framebuffer) in self.framebuffers.drain() {
            backend.destroy_framebuffer(framebuffer.handle);
        }
        backend
            .execute_framebuffer_command(&FramebufferCommand::BindDefault)
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;

    fn texture(
        backend: &mut DummyBackend,
        name: &str,
        format: TextureFormat,
        target: TextureTarget,
        size: (u32, u32),
        depth: u32,
    ) -> Texture {
        Texture::create(
            backend,
            TextureDescriptor {
                label: name.into(),
                target,
                width: size.0,
                height: size.1,
                depth,
                format,
                attachment: true,
                ..Default::default()
            },
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_same_key_returns_same_framebuffer() {
        let mut backend = DummyBackend::new(8, 8);
        let color = texture(&mut backend, "hdr", TextureFormat::Rgba16Float, TextureTarget::D2, (8, 4), 1);
        let depth = texture(&mut backend, "depth", TextureFormat::Depth32Float, TextureTarget::D2, (8, 4), 1);
        let mut manager = FramebufferManager::new();
        let a = manager.bind_framebuffer(&mut backend, &[&color], Some(&depth)).unwrap();
        let b = manager.bind_framebuffer(&mut backend, &[&color], Some(&depth)).unwrap();
        assert_eq!(a, b);
        assert_eq!(manager.len(), 1);
        assert_eq!(backend.viewport(), (0, 0, 8, 4));
        manager.bind_framebuffer(&mut backend, &[&color], None).unwrap();
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_command_list_order() {
        let mut backend = DummyBackend::new(8, 8);
        let a = texture(&mut backend, "a", TextureFormat::Rgba8Unorm, TextureTarget::D2, (4, 4), 1);
        let b = texture(&mut backend, "b", TextureFormat::Rgba8Unorm, TextureTarget::D2, (4, 4), 1);
        let depth = texture(&mut backend, "ds", TextureFormat::Depth24PlusStencil8, TextureTarget::D2, (4, 4), 1);
        let mut manager = FramebufferManager::new();
        let framebuffer = manager
            .get_framebuffer(&mut backend, &[&a, &b], Some(&depth), AttachOptions::default())
            .unwrap();
        let commands = framebuffer.commands();
        assert!(matches!(commands[0], FramebufferCommand::Bind(_)));
        assert!(matches!(
            commands[1],
            FramebufferCommand::Attach { point: AttachmentPoint::Color(0), .. }
        ));
        assert!(matches!(
            commands[2],
            FramebufferCommand::Attach { point: AttachmentPoint::Color(1), .. }
        ));
        assert_eq!(commands[3], FramebufferCommand::ReadBuffer(Some(0)));
        assert_eq!(commands[4], FramebufferCommand::DrawBuffers(2));
        assert!(matches!(
            commands[5],
            FramebufferCommand::Attach { point: AttachmentPoint::DepthStencil, .. }
        ));
    }

    #[test]
    fn test_depth_only_framebuffer() {
        let mut backend = DummyBackend::new(8, 8);
        let shadow = texture(&mut backend, "shadow", TextureFormat::Depth32Float, TextureTarget::D2, (16, 16), 1);
        let mut manager = FramebufferManager::new();
        let bound = manager.bind_framebuffer(&mut backend, &[], Some(&shadow)).unwrap();
        assert_eq!((bound.width, bound.height), (16, 16));
        let framebuffer = manager
            .get_framebuffer(&mut backend, &[], Some(&shadow), AttachOptions::default())
            .unwrap();
        assert!(framebuffer.commands().contains(&FramebufferCommand::DrawBufferNone));
    }

    #[test]
    fn test_size_mismatch_is_fatal() {
        let mut backend = DummyBackend::new(8, 8);
        let a = texture(&mut backend, "a", TextureFormat::Rgba8Unorm, TextureTarget::D2, (4, 4), 1);
        let b = texture(&mut backend, "b", TextureFormat::Rgba8Unorm, TextureTarget::D2, (2, 2), 1);
        let mut manager = FramebufferManager::new();
        let error = manager.bind_framebuffer(&mut backend, &[&a, &b], None).unwrap_err();
        assert!(error.is_fatal());
        assert!(error.to_string().contains("Render targets must be the same size"));
    }

    #[test]
    fn test_repeated_array_texture_uses_consecutive_layers() {
        let mut backend = DummyBackend::new(8, 8);
        let array = texture(&mut backend, "fft", TextureFormat::Rgba16Float, TextureTarget::D2Array, (4, 4), 3);
        let mut manager = FramebufferManager::new();
        let framebuffer = manager
            .get_framebuffer(&mut backend, &[&array, &array, &array], None, AttachOptions::default())
            .unwrap();
        let layers: Vec<u32> = framebuffer
            .commands()
            .iter()
            .filter_map(|c| match c {
                FramebufferCommand::Attach { target, .. } => Some(target.layer()),
                _ => None,
            })
            .collect();
        assert_eq!(layers, vec![0, 1, 2]);
    }

    #[test]
    fn test_cube_face_and_level_viewport() {
        let mut backend = DummyBackend::new(8, 8);
        let mut cube = TextureDescriptor {
            label: "probe".into(),
            target: TextureTarget::Cube,
            width: 16,
            height: 16,
            format: TextureFormat::Rgba16Float,
            attachment: true,
            ..Default::default()
        };
        cube.sampler.min_filter = FilterMode::LinearMipmapLinear;
        let cube = Texture::create(&mut backend, cube, None).unwrap();
        let mut manager = FramebufferManager::new();
        let bound = manager
            .bind_framebuffer_with(&mut backend, &[&cube], None, AttachOptions::face(3).with_level(2))
            .unwrap();
        assert_eq!((bound.width, bound.height), (4, 4));
        backend.clear(ClearValue::color([1.0, 0.0, 0.0, 1.0])).unwrap();
        let face = cube.read_texels(&mut backend, 3, 2).unwrap();
        assert_eq!(face[0], [1.0, 0.0, 0.0, 1.0]);
        let other = cube.read_texels(&mut backend, 2, 2).unwrap();
        assert_eq!(other[0], [0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_mirror_from_flips_x() {
        let mut backend = DummyBackend::new(8, 8);
        let src = texture(&mut backend, "src", TextureFormat::Rgba8Unorm, TextureTarget::D2, (2, 1), 1);
        let dst = texture(&mut backend, "dst", TextureFormat::Rgba8Unorm, TextureTarget::D2, (2, 1), 1);
        backend
            .write_texture(src.handle, 0, 0, &[255, 0, 0, 255, 0, 0, 255, 255])
            .unwrap();
        let mut manager = FramebufferManager::new();
        let src_fb = manager.bind_framebuffer(&mut backend, &[&src], None).unwrap();
        let dst_fb = manager.bind_framebuffer(&mut backend, &[&dst], None).unwrap();
        manager.mirror_from(&mut backend, src_fb, dst_fb).unwrap();
        let pixels = dst.get_image_data(&mut backend, 0, 0).unwrap();
        assert_eq!(pixels, vec![0, 0, 255, 255, 255, 0, 0, 255]);
    }

    #[test]
    fn test_clear_framebuffer_destroys_objects() {
        let mut backend = DummyBackend::new(8, 8);
        let color = texture(&mut backend, "c", TextureFormat::Rgba8Unorm, TextureTarget::D2, (4, 4), 1);
        let mut manager = FramebufferManager::new();
        manager.bind_framebuffer(&mut backend, &[&color], None).unwrap();
        assert_eq!(backend.live_framebuffers(), 1);
        manager.clear_framebuffer(&mut backend);
        assert!(manager.is_empty());
        assert_eq!(backend.live_framebuffers(), 0);
    }
}
