//! Core device abstraction traits
//!
//! [`Device`] is the opaque capability the host hands to a pipeline. The
//! pipeline only ever creates objects, writes buffers, compiles programs and
//! submits dispatches or draws through it.

use crate::backend::types::*;
use thiserror::Error;

/// Device error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Failed to initialize device: {0}")]
    InitializationFailed(String),
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create sampler: {0}")]
    SamplerCreationFailed(String),
    #[error("Failed to compile {stage:?} program: {message}")]
    ShaderCompilationFailed { stage: ShaderStage, message: String },
    #[error("Dispatch '{label}' failed: {message}")]
    DispatchFailed { label: String, message: String },
    #[error("Draw '{label}' failed: {message}")]
    DrawFailed { label: String, message: String },
    #[error("Write of {len} bytes at offset {offset} overflows a {size} byte buffer")]
    WriteOutOfBounds { size: u64, offset: u64, len: u64 },
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
    #[error("Device lost")]
    DeviceLost,
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Handle to a GPU texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerHandle(pub(crate) u64);

/// Handle to a compiled program (one shader stage)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub(crate) u64);

macro_rules! raw_handle {
    ($($ty:ident),*) => {
        $(
            impl $ty {
                /// Wrap a backend-specific id. Used by devices implemented outside this crate.
                pub fn from_raw(raw: u64) -> Self {
                    Self(raw)
                }

                pub fn raw(self) -> u64 {
                    self.0
                }
            }
        )*
    };
}

raw_handle!(TextureHandle, BufferHandle, SamplerHandle, ProgramHandle);

/// Any object a pass can bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuResource {
    Texture(TextureHandle),
    Buffer(BufferHandle),
    Sampler(SamplerHandle),
}

/// How a pass touches a bound resource this frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingAccess {
    /// Read the version produced earlier in the current frame.
    Read,
    /// Read the version completed by the previous frame.
    Feedback,
    /// Written by the pass.
    Write,
}

impl BindingAccess {
    pub fn is_read(&self) -> bool {
        matches!(self, BindingAccess::Read | BindingAccess::Feedback)
    }

    pub fn is_write(&self) -> bool {
        matches!(self, BindingAccess::Write)
    }
}

/// A resolved binding handed to the device for one dispatch or draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundResource<'a> {
    pub slot: u32,
    pub name: &'a str,
    pub resource: GpuResource,
    pub access: BindingAccess,
}

/// Compute dispatch request
#[derive(Debug, Clone, Copy)]
pub struct ComputeDispatch<'a> {
    pub label: &'a str,
    pub program: ProgramHandle,
    pub bindings: &'a [BoundResource<'a>],
    pub workgroups: [u32; 3],
}

/// Fullscreen-style draw request (no vertex buffers; vertices are generated in the shader)
#[derive(Debug, Clone, Copy)]
pub struct DrawCall<'a> {
    pub label: &'a str,
    pub vertex: ProgramHandle,
    pub fragment: ProgramHandle,
    pub bindings: &'a [BoundResource<'a>],
    pub vertex_count: u32,
}

/// Device capability used by the pipeline
pub trait Device {
    /// Backend name for logging
    fn name(&self) -> &str;

    // Resource creation

    /// Create a texture
    fn create_texture(&mut self, desc: &TextureDescriptor) -> DeviceResult<TextureHandle>;

    /// Create a sampler
    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> DeviceResult<SamplerHandle>;

    /// Create a buffer
    fn create_buffer(&mut self, desc: &BufferDescriptor) -> DeviceResult<BufferHandle>;

    /// Write data to a buffer
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8])
        -> DeviceResult<()>;

    // Programs and submission

    /// Compile one program for one stage
    fn compile_program(&mut self, source: &str, stage: ShaderStage)
        -> DeviceResult<ProgramHandle>;

    /// Dispatch compute work
    fn dispatch(&mut self, dispatch: &ComputeDispatch<'_>) -> DeviceResult<()>;

    /// Draw with a vertex/fragment program pair
    fn draw(&mut self, draw: &DrawCall<'_>) -> DeviceResult<()>;

    // Teardown

    /// Destroy a texture, buffer or sampler
    fn destroy(&mut self, resource: GpuResource);

    /// Destroy a compiled program
    fn destroy_program(&mut self, program: ProgramHandle);

    /// Block until every submitted piece of work has completed
    fn wait_idle(&mut self) -> DeviceResult<()>;
}

impl<D: Device + ?Sized> Device for Box<D> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> DeviceResult<TextureHandle> {
        (**self).create_texture(desc)
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> DeviceResult<SamplerHandle> {
        (**self).create_sampler(desc)
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> DeviceResult<BufferHandle> {
        (**self).create_buffer(desc)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> DeviceResult<()> {
        (**self).write_buffer(buffer, offset, data)
    }

    fn compile_program(&mut self, source: &str, stage: ShaderStage) -> DeviceResult<ProgramHandle> {
        (**self).compile_program(source, stage)
    }

    fn dispatch(&mut self, dispatch: &ComputeDispatch<'_>) -> DeviceResult<()> {
        (**self).dispatch(dispatch)
    }

    fn draw(&mut self, draw: &DrawCall<'_>) -> DeviceResult<()> {
        (**self).draw(draw)
    }

    fn destroy(&mut self, resource: GpuResource) {
        (**self).destroy(resource)
    }

    fn destroy_program(&mut self, program: ProgramHandle) {
        (**self).destroy_program(program)
    }

    fn wait_idle(&mut self) -> DeviceResult<()> {
        (**self).wait_idle()
    }
}
