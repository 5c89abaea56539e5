//! Named GPU resources and the registry that owns them

use crate::backend::traits::*;
use crate::backend::types::*;
use std::collections::HashMap;
use thiserror::Error;

/// Resource registry error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResourceError {
    #[error("Resource '{0}' is already registered")]
    DuplicateName(String),
    #[error("Invalid descriptor for '{name}': {reason}")]
    InvalidDescriptor { name: String, reason: String },
    #[error("Unknown resource '{0}'")]
    UnknownResource(String),
    #[error("Resource '{name}' is already registered with a different descriptor")]
    ResourceConflict { name: String },
    #[error("Resource '{0}' is not persistent")]
    NotPersistent(String),
    #[error("Resource '{name}' is not a {expected:?}")]
    WrongKind { name: String, expected: ResourceKind },
    #[error("Device error on '{name}': {source}")]
    Device {
        name: String,
        #[source]
        source: DeviceError,
    },
}

/// What a resource is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Texture2d,
    Sampler,
    UniformBuffer,
    StorageBuffer,
}

impl ResourceKind {
    /// Whether a pass may declare this kind as an output.
    pub fn is_writable(&self) -> bool {
        matches!(self, ResourceKind::Texture2d | ResourceKind::StorageBuffer)
    }
}

/// Describes texture dimensions that can be relative to the surface size
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TextureSize {
    /// Absolute size in pixels
    Absolute { width: u32, height: u32 },
    /// Relative to the surface size (1.0 = full surface)
    Relative { width_scale: f32, height_scale: f32 },
}

impl Default for TextureSize {
    fn default() -> Self {
        TextureSize::Relative {
            width_scale: 1.0,
            height_scale: 1.0,
        }
    }
}

impl TextureSize {
    /// Resolve against the surface. Relative sizes never round below one pixel.
    pub fn resolve(&self, surface_width: u32, surface_height: u32) -> (u32, u32) {
        match self {
            TextureSize::Absolute { width, height } => (*width, *height),
            TextureSize::Relative {
                width_scale,
                height_scale,
            } => (
                (((surface_width as f32) * width_scale) as u32).max(1),
                (((surface_height as f32) * height_scale) as u32).max(1),
            ),
        }
    }

    fn check(&self) -> Result<(), String> {
        match *self {
            TextureSize::Absolute { width, height } if width == 0 || height == 0 => {
                Err(format!("texture size {width}x{height} has a zero extent"))
            }
            TextureSize::Relative {
                width_scale,
                height_scale,
            } if !(width_scale > 0.0 && height_scale > 0.0) => Err(format!(
                "relative scale {width_scale}x{height_scale} must be positive"
            )),
            _ => Ok(()),
        }
    }
}

/// Size metadata of a resource
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResourceSize {
    Texture(TextureSize),
    Bytes(u64),
}

/// Declaration of a named resource.
///
/// Fields are public so hosts can describe resources directly; the
/// constructors below always produce descriptors that pass validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDescriptor {
    pub name: String,
    pub kind: ResourceKind,
    pub format: Option<TextureFormat>,
    pub size: Option<ResourceSize>,
    pub sampler: Option<SamplerDescriptor>,
    /// Double-buffered and kept across frames, so passes may read last frame's value.
    pub persistent: bool,
}

impl ResourceDescriptor {
    /// Full-surface 2D texture
    pub fn texture(name: &str, format: TextureFormat) -> Self {
        Self {
            name: name.to_string(),
            kind: ResourceKind::Texture2d,
            format: Some(format),
            size: Some(ResourceSize::Texture(TextureSize::default())),
            sampler: None,
            persistent: false,
        }
    }

    pub fn sampler(name: &str, desc: SamplerDescriptor) -> Self {
        Self {
            name: name.to_string(),
            kind: ResourceKind::Sampler,
            format: None,
            size: None,
            sampler: Some(desc),
            persistent: false,
        }
    }

    /// Uniform buffer of `size` bytes
    pub fn uniform(name: &str, size: u64) -> Self {
        Self::buffer(name, ResourceKind::UniformBuffer, size)
    }

    /// Uniform buffer sized for `T`, rounded up to the 16 byte uniform alignment
    pub fn uniform_for<T: bytemuck::Pod>(name: &str) -> Self {
        let size = std::mem::size_of::<T>() as u64;
        Self::uniform(name, size.div_ceil(16).max(1) * 16)
    }

    pub fn storage(name: &str, size: u64) -> Self {
        Self::buffer(name, ResourceKind::StorageBuffer, size)
    }

    fn buffer(name: &str, kind: ResourceKind, size: u64) -> Self {
        Self {
            name: name.to_string(),
            kind,
            format: None,
            size: Some(ResourceSize::Bytes(size)),
            sampler: None,
            persistent: false,
        }
    }

    /// Absolute texture size in pixels
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.size = Some(ResourceSize::Texture(TextureSize::Absolute { width, height }));
        self
    }

    /// Texture size as a fraction of the surface
    pub fn with_scale(mut self, scale: f32) -> Self {
        self.size = Some(ResourceSize::Texture(TextureSize::Relative {
            width_scale: scale,
            height_scale: scale,
        }));
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Check that size and format metadata agree with the kind.
    pub fn validate(&self) -> Result<(), ResourceError> {
        let invalid = |reason: String| ResourceError::InvalidDescriptor {
            name: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name is empty".into()));
        }
        if self.kind != ResourceKind::Sampler && self.sampler.is_some() {
            return Err(invalid(format!("{:?} cannot carry sampler state", self.kind)));
        }
        if self.kind != ResourceKind::Texture2d && self.format.is_some() {
            return Err(invalid(format!("{:?} cannot have a texture format", self.kind)));
        }
        if self.persistent && !self.kind.is_writable() {
            return Err(invalid(format!("{:?} cannot be persistent", self.kind)));
        }

        match (self.kind, self.size) {
            (ResourceKind::Texture2d, Some(ResourceSize::Texture(size))) => {
                if self.format.is_none() {
                    return Err(invalid("texture has no format".into()));
                }
                size.check().map_err(invalid)
            }
            (ResourceKind::Texture2d, _) => Err(invalid("texture needs a texture size".into())),
            (ResourceKind::Sampler, None) => Ok(()),
            (ResourceKind::Sampler, Some(_)) => Err(invalid("sampler cannot have a size".into())),
            (kind, Some(ResourceSize::Bytes(bytes))) => {
                if bytes == 0 {
                    Err(invalid("buffer size is zero".into()))
                } else if kind == ResourceKind::UniformBuffer && bytes % 16 != 0 {
                    Err(invalid(format!(
                        "uniform buffer size {bytes} is not a multiple of 16"
                    )))
                } else if bytes % 4 != 0 {
                    Err(invalid(format!("buffer size {bytes} is not a multiple of 4")))
                } else {
                    Ok(())
                }
            }
            (kind, _) => Err(invalid(format!("{kind:?} needs a byte size"))),
        }
    }
}

/// Typed handle returned by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    pub(crate) index: u32,
    pub(crate) kind: ResourceKind,
}

impl ResourceHandle {
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

struct ResourceEntry {
    descriptor: ResourceDescriptor,
    /// Two slots for persistent resources, one otherwise
    physical: Vec<GpuResource>,
    /// Slot written this frame
    current: usize,
    extent: (u32, u32),
}

impl ResourceEntry {
    fn slot(&self, access: BindingAccess) -> GpuResource {
        let index = match access {
            BindingAccess::Feedback if self.physical.len() == 2 => 1 - self.current,
            _ => self.current,
        };
        self.physical[index]
    }
}

/// Owns every GPU object of a pipeline, keyed by name.
///
/// Only build-time registration and the end-of-frame swap mutate the
/// registry; per-frame code reads it through shared references.
pub struct ResourceRegistry {
    entries: Vec<ResourceEntry>,
    by_name: HashMap<String, u32>,
    surface: (u32, u32),
}

impl ResourceRegistry {
    pub fn new(surface_width: u32, surface_height: u32) -> Self {
        Self {
            entries: Vec::new(),
            by_name: HashMap::new(),
            surface: (surface_width.max(1), surface_height.max(1)),
        }
    }

    pub fn surface_size(&self) -> (u32, u32) {
        self.surface
    }

    /// Register a new resource and create its GPU object(s).
    ///
    /// Fails with [`ResourceError::DuplicateName`] if the name is taken; the
    /// existing entry is left untouched.
    pub fn register(
        &mut self,
        device: &mut dyn Device,
        descriptor: ResourceDescriptor,
    ) -> Result<ResourceHandle, ResourceError> {
        if self.by_name.contains_key(&descriptor.name) {
            return Err(ResourceError::DuplicateName(descriptor.name));
        }
        descriptor.validate()?;

        let extent = match descriptor.size {
            Some(ResourceSize::Texture(size)) => size.resolve(self.surface.0, self.surface.1),
            _ => (0, 0),
        };
        let count = if descriptor.persistent { 2 } else { 1 };
        let mut physical = Vec::with_capacity(count);
        for _ in 0..count {
            match Self::create(device, &descriptor, extent) {
                Ok(resource) => physical.push(resource),
                Err(source) => {
                    for created in physical {
                        device.destroy(created);
                    }
                    return Err(ResourceError::Device {
                        name: descriptor.name,
                        source,
                    });
                }
            }
        }

        log::debug!(
            "Registered {:?} '{}'{}",
            descriptor.kind,
            descriptor.name,
            if descriptor.persistent { " (persistent)" } else { "" }
        );

        let handle = ResourceHandle {
            index: self.entries.len() as u32,
            kind: descriptor.kind,
        };
        self.by_name.insert(descriptor.name.clone(), handle.index);
        self.entries.push(ResourceEntry {
            descriptor,
            physical,
            current: 0,
            extent,
        });
        Ok(handle)
    }

    /// Register unless an identical descriptor already exists under the name.
    pub fn declare(
        &mut self,
        device: &mut dyn Device,
        descriptor: ResourceDescriptor,
    ) -> Result<ResourceHandle, ResourceError> {
        match self.by_name.get(&descriptor.name) {
            Some(&index) => {
                let entry = &self.entries[index as usize];
                if entry.descriptor == descriptor {
                    Ok(ResourceHandle {
                        index,
                        kind: entry.descriptor.kind,
                    })
                } else {
                    Err(ResourceError::ResourceConflict {
                        name: descriptor.name,
                    })
                }
            }
            None => self.register(device, descriptor),
        }
    }

    /// Allocate the double-buffer pair for a feedback resource.
    ///
    /// Idempotent for an identical descriptor, otherwise fails with
    /// [`ResourceError::ResourceConflict`].
    pub fn allocate_persistent(
        &mut self,
        device: &mut dyn Device,
        descriptor: ResourceDescriptor,
    ) -> Result<ResourceHandle, ResourceError> {
        self.declare(device, descriptor.persistent())
    }

    pub fn resolve(&self, name: &str) -> Result<ResourceHandle, ResourceError> {
        self.by_name
            .get(name)
            .map(|&index| ResourceHandle {
                index,
                kind: self.entries[index as usize].descriptor.kind,
            })
            .ok_or_else(|| ResourceError::UnknownResource(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn descriptor(&self, handle: ResourceHandle) -> &ResourceDescriptor {
        &self.entries[handle.index as usize].descriptor
    }

    /// Resolved texture size in pixels; `(0, 0)` for non-textures
    pub fn extent(&self, handle: ResourceHandle) -> (u32, u32) {
        self.entries[handle.index as usize].extent
    }

    /// Physical object to bind for the given access.
    ///
    /// Reads and writes use the current slot; feedback reads of a persistent
    /// resource use the slot completed by the previous frame.
    pub fn physical(&self, handle: ResourceHandle, access: BindingAccess) -> GpuResource {
        self.entries[handle.index as usize].slot(access)
    }

    /// Buffer behind a uniform or storage resource (current slot).
    pub fn buffer(&self, name: &str) -> Result<(BufferHandle, u64), ResourceError> {
        let handle = self.resolve(name)?;
        let entry = &self.entries[handle.index as usize];
        match (entry.slot(BindingAccess::Write), entry.descriptor.size) {
            (GpuResource::Buffer(buffer), Some(ResourceSize::Bytes(size))) => Ok((buffer, size)),
            _ => Err(ResourceError::WrongKind {
                name: name.to_string(),
                expected: ResourceKind::UniformBuffer,
            }),
        }
    }

    /// Every physical buffer behind `name`: both slots of a persistent
    /// resource, otherwise the single buffer.
    pub fn buffer_slots(&self, name: &str) -> Result<Vec<BufferHandle>, ResourceError> {
        let handle = self.resolve(name)?;
        let wrong_kind = || ResourceError::WrongKind {
            name: name.to_string(),
            expected: ResourceKind::UniformBuffer,
        };
        self.entries[handle.index as usize]
            .physical
            .iter()
            .map(|resource| match resource {
                GpuResource::Buffer(buffer) => Ok(*buffer),
                _ => Err(wrong_kind()),
            })
            .collect()
    }

    /// Flip the active slot of a persistent resource.
    pub fn swap(&mut self, name: &str) -> Result<(), ResourceError> {
        let index = *self
            .by_name
            .get(name)
            .ok_or_else(|| ResourceError::UnknownResource(name.to_string()))?;
        let entry = &mut self.entries[index as usize];
        if !entry.descriptor.persistent {
            return Err(ResourceError::NotPersistent(name.to_string()));
        }
        entry.current = 1 - entry.current;
        log::trace!("Swapped '{}' to slot {}", name, entry.current);
        Ok(())
    }

    /// Swap every persistent resource, in registration order. Returns how many were swapped.
    pub fn swap_all_persistent(&mut self) -> usize {
        let mut swapped = 0;
        for entry in self.entries.iter_mut().filter(|e| e.descriptor.persistent) {
            entry.current = 1 - entry.current;
            swapped += 1;
        }
        swapped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Destroy every GPU object. The caller must have waited for the device first.
    pub fn release_all(&mut self, device: &mut dyn Device) {
        for entry in self.entries.drain(..) {
            for resource in entry.physical {
                device.destroy(resource);
            }
        }
        self.by_name.clear();
    }

    fn create(
        device: &mut dyn Device,
        descriptor: &ResourceDescriptor,
        (width, height): (u32, u32),
    ) -> DeviceResult<GpuResource> {
        let label = Some(descriptor.name.clone());
        match descriptor.kind {
            ResourceKind::Texture2d => {
                let format = descriptor.format.unwrap_or(TextureFormat::Rgba8Unorm);
                device
                    .create_texture(&TextureDescriptor {
                        label,
                        width,
                        height,
                        format,
                        usage: TextureUsage::for_format(format),
                    })
                    .map(GpuResource::Texture)
            }
            ResourceKind::Sampler => {
                let desc = SamplerDescriptor {
                    label,
                    ..descriptor.sampler.clone().unwrap_or_default()
                };
                device.create_sampler(&desc).map(GpuResource::Sampler)
            }
            ResourceKind::UniformBuffer | ResourceKind::StorageBuffer => {
                let size = match descriptor.size {
                    Some(ResourceSize::Bytes(bytes)) => bytes,
                    _ => 0,
                };
                let usage = if descriptor.kind == ResourceKind::UniformBuffer {
                    BufferUsage::UNIFORM | BufferUsage::COPY_DST
                } else {
                    BufferUsage::STORAGE | BufferUsage::COPY_DST | BufferUsage::COPY_SRC
                };
                device
                    .create_buffer(&BufferDescriptor { label, size, usage })
                    .map(GpuResource::Buffer)
            }
        }
    }
}
