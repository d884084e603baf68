//! Core backend abstraction traits
//!
//! The renderer talks to the GPU through a small GL-like immediate surface:
//! create resources, bind state, draw. Both the headless dummy backend and
//! the wgpu backend implement it.

use crate::backend::types::*;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("Failed to acquire next image: {0}")]
    AcquireImageFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to link program '{name}': {message}")]
    ProgramLinkFailed { name: String, message: String },
    #[error("Failed to read back resource: {0}")]
    ReadbackFailed(String),
    #[error("Uniform '{name}' expects {expected:?}")]
    UniformTypeMismatch { name: String, expected: UniformKind },
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Surface lost")]
    SurfaceLost,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// GL-like graphics API used by the render core
pub trait GraphicsBackend {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Size of the default (window) framebuffer
    fn surface_size(&self) -> (u32, u32);

    /// Resize the default framebuffer
    fn resize_surface(&mut self, width: u32, height: u32);

    // Textures

    /// Create a texture object with storage for all layers and levels
    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle>;
    /// Destroy a texture
    fn destroy_texture(&mut self, texture: TextureHandle);
    /// Upload one layer of one mip level, tightly packed
    fn write_texture(
        &mut self,
        texture: TextureHandle,
        layer: u32,
        level: u32,
        data: &[u8],
    ) -> BackendResult<()>;
    /// Read back one layer of one mip level, tightly packed
    fn read_texture(&mut self, texture: TextureHandle, layer: u32, level: u32)
        -> BackendResult<Vec<u8>>;
    /// Rebuild the mip chain from level 0
    fn generate_mipmaps(&mut self, texture: TextureHandle) -> BackendResult<()>;

    // Buffers

    /// Create a buffer
    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;
    /// Destroy a buffer
    fn destroy_buffer(&mut self, buffer: BufferHandle);
    /// Update buffer contents at an offset
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8])
        -> BackendResult<()>;
    /// Read the whole buffer back
    fn read_buffer(&mut self, buffer: BufferHandle) -> BackendResult<Vec<u8>>;
    /// Bind a buffer at an indexed binding point of its kind
    fn bind_buffer_base(&mut self, kind: BufferKind, index: u32, buffer: BufferHandle);

    // Framebuffers

    /// Create an empty framebuffer object
    fn create_framebuffer(&mut self) -> BackendResult<FramebufferHandle>;
    /// Destroy a framebuffer object
    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle);
    /// Execute one framebuffer command against the bound framebuffer
    fn execute_framebuffer_command(&mut self, command: &FramebufferCommand)
        -> BackendResult<()>;
    /// Completeness of the bound framebuffer
    fn check_framebuffer_status(&self) -> FramebufferStatus;
    /// Copy pixels between framebuffers; `None` is the default framebuffer
    fn blit_framebuffer(
        &mut self,
        src: Option<FramebufferHandle>,
        src_rect: BlitRect,
        dst: Option<FramebufferHandle>,
        dst_rect: BlitRect,
        mask: BlitMask,
        linear: bool,
    ) -> BackendResult<()>;
    /// Set the draw viewport
    fn set_viewport(&mut self, x: i32, y: i32, width: u32, height: u32);
    /// Clear the bound framebuffer's draw buffers
    fn clear(&mut self, value: ClearValue) -> BackendResult<()>;

    // Pipeline state

    /// Fixed-function state for subsequent draws
    fn set_pipeline_state(&mut self, state: &PipelineState);
    /// State set by the last `set_pipeline_state`
    fn pipeline_state(&self) -> PipelineState;

    // Programs

    /// Compile and link a program
    fn create_program(&mut self, desc: &ProgramDescriptor) -> BackendResult<ProgramHandle>;
    /// Destroy a program
    fn destroy_program(&mut self, program: ProgramHandle);
    /// Uniforms the linked program exposes
    fn program_uniforms(&self, program: ProgramHandle) -> Vec<UniformInfo>;
    /// Make a program current
    fn use_program(&mut self, program: ProgramHandle);
    /// Upload a uniform of the current program
    fn set_uniform(&mut self, location: UniformLocation, data: &UniformData)
        -> BackendResult<()>;
    /// Bind a texture to a texture unit
    fn bind_texture(&mut self, unit: u32, texture: TextureHandle);

    // Geometry

    /// Create a vertex array with its element buffer
    fn create_vertex_array(&mut self, desc: &VertexArrayDescriptor)
        -> BackendResult<VertexArrayHandle>;
    /// Destroy a vertex array
    fn destroy_vertex_array(&mut self, vertex_array: VertexArrayHandle);
    /// Attach or detach the per-instance stream of a vertex array
    fn set_instance_stream(
        &mut self,
        vertex_array: VertexArrayHandle,
        stream: Option<InstanceStream>,
    ) -> BackendResult<()>;
    /// Make a vertex array current
    fn bind_vertex_array(&mut self, vertex_array: VertexArrayHandle);
    /// Indexed draw with the current program and vertex array
    fn draw_elements(
        &mut self,
        mode: PrimitiveMode,
        index_count: u32,
        instance_count: u32,
    ) -> BackendResult<()>;

    // Compute

    /// Dispatch the current compute program
    fn dispatch_compute(&mut self, x: u32, y: u32, z: u32) -> BackendResult<()>;
    /// Make compute writes visible to later reads
    fn memory_barrier(&mut self);

    // Frame

    /// Submit all recorded work
    fn flush(&mut self) -> BackendResult<()>;
    /// Present the default framebuffer
    fn present(&mut self) -> BackendResult<()>;
}
