//! Pass definitions and their lifecycle hooks

use crate::backend::traits::*;
use crate::render_graph::resource::*;
use crate::shader::{assemble, FragmentCatalog, ShaderError};
use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use thiserror::Error;

/// Error returned by a pass hook
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HookError {
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("{0}")]
    Message(String),
}

pub type HookResult = Result<(), HookError>;

/// Pointer and window state sampled by the host for the current frame
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InputState {
    /// Pointer position in pixels
    pub mouse: Vec2,
    pub mouse_down: bool,
    /// Surface size in pixels
    pub resolution: Vec2,
}

/// Per-frame values handed to every `update` hook
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameContext {
    pub frame_index: u64,
    /// Seconds since the first frame
    pub elapsed: f32,
    /// Seconds since the previous frame
    pub delta: f32,
    pub input: InputState,
}

impl FrameContext {
    pub fn new(frame_index: u64, elapsed: f32, delta: f32) -> Self {
        Self {
            frame_index,
            elapsed,
            delta,
            input: InputState::default(),
        }
    }

    pub fn with_input(mut self, input: InputState) -> Self {
        self.input = input;
        self
    }
}

/// Built-in per-frame uniform block, laid out to match `frame_uniforms.wgsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct FrameUniforms {
    pub resolution: Vec2,
    pub mouse: Vec2,
    pub time: f32,
    pub delta: f32,
    pub frame: u32,
    pub mouse_down: u32,
}

impl FrameUniforms {
    pub fn from_context(frame: &FrameContext) -> Self {
        Self {
            resolution: frame.input.resolution,
            mouse: frame.input.mouse,
            time: frame.elapsed,
            delta: frame.delta,
            frame: frame.frame_index as u32,
            mouse_down: frame.input.mouse_down as u32,
        }
    }
}

fn write_bytes(
    registry: &ResourceRegistry,
    device: &mut dyn Device,
    name: &str,
    offset: u64,
    data: &[u8],
) -> HookResult {
    let (buffer, _) = registry.buffer(name)?;
    device.write_buffer(buffer, offset, data)?;
    Ok(())
}

/// Context given to `init`: the only place resources may be created.
pub struct InitContext<'a> {
    pub(crate) pass: &'a str,
    pub(crate) registry: &'a mut ResourceRegistry,
    pub(crate) device: &'a mut dyn Device,
}

impl<'a> InitContext<'a> {
    pub fn pass_name(&self) -> &str {
        self.pass
    }

    pub fn surface_size(&self) -> (u32, u32) {
        self.registry.surface_size()
    }

    /// Strict registration; fails if the name already exists.
    pub fn register(&mut self, descriptor: ResourceDescriptor) -> Result<ResourceHandle, ResourceError> {
        self.registry.register(self.device, descriptor)
    }

    /// Registration that tolerates re-running `init` with the same descriptor.
    pub fn declare(&mut self, descriptor: ResourceDescriptor) -> Result<ResourceHandle, ResourceError> {
        self.registry.declare(self.device, descriptor)
    }

    /// Allocate a double-buffered feedback resource.
    pub fn allocate_persistent(
        &mut self,
        descriptor: ResourceDescriptor,
    ) -> Result<ResourceHandle, ResourceError> {
        self.registry.allocate_persistent(self.device, descriptor)
    }

    pub fn resolve(&self, name: &str) -> Result<ResourceHandle, ResourceError> {
        self.registry.resolve(name)
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &*self.registry
    }

    /// Seed a buffer with initial contents.
    ///
    /// Both slots of a persistent buffer are written, so feedback reads on
    /// the first frame observe the seed.
    pub fn write_uniform<T: Pod>(&mut self, name: &str, value: &T) -> HookResult {
        let data = bytemuck::bytes_of(value);
        for buffer in self.registry.buffer_slots(name)? {
            self.device.write_buffer(buffer, 0, data)?;
        }
        Ok(())
    }
}

/// Context given to `update`. Resources can be written but not created.
pub struct UpdateContext<'a> {
    pub(crate) pass: &'a str,
    pub(crate) frame: &'a FrameContext,
    pub(crate) registry: &'a ResourceRegistry,
    pub(crate) device: &'a mut dyn Device,
}

impl<'a> UpdateContext<'a> {
    pub fn pass_name(&self) -> &str {
        self.pass
    }

    pub fn frame(&self) -> &FrameContext {
        self.frame
    }

    pub fn resolve(&self, name: &str) -> Result<ResourceHandle, ResourceError> {
        self.registry.resolve(name)
    }

    pub fn write_uniform<T: Pod>(&mut self, name: &str, value: &T) -> HookResult {
        write_bytes(self.registry, self.device, name, 0, bytemuck::bytes_of(value))
    }

    pub fn write_bytes(&mut self, name: &str, offset: u64, data: &[u8]) -> HookResult {
        write_bytes(self.registry, self.device, name, offset, data)
    }

    /// Write the built-in [`FrameUniforms`] for this frame into `name`.
    pub fn write_frame_uniforms(&mut self, name: &str) -> HookResult {
        let uniforms = FrameUniforms::from_context(self.frame);
        self.write_uniform(name, &uniforms)
    }
}

/// Lifecycle hooks of a pass.
///
/// `init` runs once at build time (and again on rebuild), `update` once per
/// frame before the pass executes. `update` must not block.
pub trait PassHooks {
    fn init(&mut self, _ctx: &mut InitContext<'_>) -> HookResult {
        Ok(())
    }

    fn update(&mut self, _ctx: &mut UpdateContext<'_>) -> HookResult {
        Ok(())
    }
}

struct InitFn<F>(F);

impl<F> PassHooks for InitFn<F>
where
    F: FnMut(&mut InitContext<'_>) -> HookResult,
{
    fn init(&mut self, ctx: &mut InitContext<'_>) -> HookResult {
        (self.0)(ctx)
    }
}

struct UpdateFn<F>(F);

impl<F> PassHooks for UpdateFn<F>
where
    F: FnMut(&mut UpdateContext<'_>) -> HookResult,
{
    fn update(&mut self, ctx: &mut UpdateContext<'_>) -> HookResult {
        (self.0)(ctx)
    }
}

/// Type of pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    Compute,
    Render,
}

/// Programs a pass runs, as assembled source text
#[derive(Debug, Clone, PartialEq)]
pub enum PassStage {
    Compute {
        program: String,
        workgroup_size: [u32; 2],
    },
    Render {
        vertex: String,
        fragment: String,
        vertex_count: u32,
    },
}

impl PassStage {
    pub fn kind(&self) -> PassKind {
        match self {
            PassStage::Compute { .. } => PassKind::Compute,
            PassStage::Render { .. } => PassKind::Render,
        }
    }
}

/// A named input binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassInput {
    pub name: String,
    /// Read the previous frame's version of a persistent resource
    pub feedback: bool,
}

/// One unit of work: a program, its bindings and its hooks.
///
/// Resources are referenced by name only; the pipeline owns the registry.
pub struct Pass {
    name: String,
    stage: PassStage,
    inputs: Vec<PassInput>,
    outputs: Vec<String>,
    hooks: Vec<Box<dyn PassHooks>>,
}

impl Pass {
    pub fn compute(name: &str, program: impl Into<String>) -> Self {
        Self::new(
            name,
            PassStage::Compute {
                program: program.into(),
                workgroup_size: [8, 8],
            },
        )
    }

    /// Render pass drawing a single fullscreen triangle by default
    pub fn render(name: &str, vertex: impl Into<String>, fragment: impl Into<String>) -> Self {
        Self::new(
            name,
            PassStage::Render {
                vertex: vertex.into(),
                fragment: fragment.into(),
                vertex_count: 3,
            },
        )
    }

    /// Compute pass whose program is assembled from `entry` and its dependencies
    pub fn compute_from<C: FragmentCatalog + ?Sized>(
        name: &str,
        entry: &str,
        catalog: &C,
    ) -> Result<Self, ShaderError> {
        Ok(Self::compute(name, assemble(entry, catalog)?))
    }

    pub fn render_from<C: FragmentCatalog + ?Sized>(
        name: &str,
        vertex_entry: &str,
        fragment_entry: &str,
        catalog: &C,
    ) -> Result<Self, ShaderError> {
        Ok(Self::render(
            name,
            assemble(vertex_entry, catalog)?,
            assemble(fragment_entry, catalog)?,
        ))
    }

    fn new(name: &str, stage: PassStage) -> Self {
        Self {
            name: name.to_string(),
            stage,
            inputs: Vec::new(),
            outputs: Vec::new(),
            hooks: Vec::new(),
        }
    }

    pub fn input(mut self, name: &str) -> Self {
        self.inputs.push(PassInput {
            name: name.to_string(),
            feedback: false,
        });
        self
    }

    /// Read last frame's value of a persistent resource
    pub fn feedback_input(mut self, name: &str) -> Self {
        self.inputs.push(PassInput {
            name: name.to_string(),
            feedback: true,
        });
        self
    }

    pub fn output(mut self, name: &str) -> Self {
        self.outputs.push(name.to_string());
        self
    }

    /// No effect on render passes.
    pub fn with_workgroup_size(mut self, x: u32, y: u32) -> Self {
        if let PassStage::Compute { workgroup_size, .. } = &mut self.stage {
            *workgroup_size = [x.max(1), y.max(1)];
        }
        self
    }

    /// No effect on compute passes.
    pub fn with_vertex_count(mut self, count: u32) -> Self {
        if let PassStage::Render { vertex_count, .. } = &mut self.stage {
            *vertex_count = count;
        }
        self
    }

    pub fn with_hooks(mut self, hooks: impl PassHooks + 'static) -> Self {
        self.hooks.push(Box::new(hooks));
        self
    }

    pub fn on_init<F>(self, f: F) -> Self
    where
        F: FnMut(&mut InitContext<'_>) -> HookResult + 'static,
    {
        self.with_hooks(InitFn(f))
    }

    pub fn on_update<F>(self, f: F) -> Self
    where
        F: FnMut(&mut UpdateContext<'_>) -> HookResult + 'static,
    {
        self.with_hooks(UpdateFn(f))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage(&self) -> &PassStage {
        &self.stage
    }

    pub fn kind(&self) -> PassKind {
        self.stage.kind()
    }

    pub fn inputs(&self) -> &[PassInput] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn writes(&self, resource: &str) -> bool {
        self.outputs.iter().any(|o| o == resource)
    }

    pub(crate) fn run_init(
        &mut self,
        registry: &mut ResourceRegistry,
        device: &mut dyn Device,
    ) -> HookResult {
        let mut ctx = InitContext {
            pass: &self.name,
            registry,
            device,
        };
        for hook in &mut self.hooks {
            hook.init(&mut ctx)?;
        }
        Ok(())
    }

    pub(crate) fn run_update(
        &mut self,
        frame: &FrameContext,
        registry: &ResourceRegistry,
        device: &mut dyn Device,
    ) -> HookResult {
        let mut ctx = UpdateContext {
            pass: &self.name,
            frame,
            registry,
            device,
        };
        for hook in &mut self.hooks {
            hook.update(&mut ctx)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Pass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pass")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}
