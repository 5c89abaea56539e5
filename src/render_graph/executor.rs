//! Per-frame pipeline execution and teardown

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::render_graph::graph::*;
use crate::render_graph::pass::*;
use crate::render_graph::resource::*;
use crate::shader::program_hash;
use std::collections::HashMap;
use thiserror::Error;

/// Per-frame error. Aborts only the frame that raised it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("Update of pass '{pass}' failed: {source}")]
    Update {
        pass: String,
        #[source]
        source: HookError,
    },
    #[error("Compiling pass '{pass}' failed: {source}")]
    Compile {
        pass: String,
        #[source]
        source: DeviceError,
    },
    #[error("Executing pass '{pass}' failed: {source}")]
    Execute {
        pass: String,
        #[source]
        source: DeviceError,
    },
    #[error("Pass '{pass}' could not bind its resources: {source}")]
    Resource {
        pass: String,
        #[source]
        source: ResourceError,
    },
}

impl FrameError {
    /// Name of the pass that failed
    pub fn pass(&self) -> &str {
        match self {
            FrameError::Update { pass, .. }
            | FrameError::Compile { pass, .. }
            | FrameError::Execute { pass, .. }
            | FrameError::Resource { pass, .. } => pass,
        }
    }
}

/// Summary of a completed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub frame_index: u64,
    pub passes_executed: usize,
    pub resources_swapped: usize,
}

/// Compiled programs keyed by stage and source hash.
#[derive(Debug, Default)]
pub struct ProgramCache {
    programs: HashMap<(ShaderStage, u64), ProgramHandle>,
}

impl ProgramCache {
    /// Return the cached program for `source`, compiling it on first use.
    ///
    /// Failures are not cached, so the next call retries.
    pub fn get_or_compile(
        &mut self,
        device: &mut dyn Device,
        stage: ShaderStage,
        source: &str,
    ) -> DeviceResult<ProgramHandle> {
        let key = (stage, program_hash(source));
        if let Some(&program) = self.programs.get(&key) {
            return Ok(program);
        }
        let program = device.compile_program(source, stage)?;
        log::debug!("Compiled {:?} program {:016x}", stage, key.1);
        self.programs.insert(key, program);
        Ok(program)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn release(&mut self, device: &mut dyn Device) {
        for (_, program) in self.programs.drain() {
            device.destroy_program(program);
        }
    }
}

/// Bindings of a pass: inputs in declaration order, then outputs.
fn resolve_bindings<'p>(
    pass: &'p Pass,
    registry: &ResourceRegistry,
) -> Result<Vec<BoundResource<'p>>, ResourceError> {
    let reads = pass.inputs().iter().map(|input| {
        let access = if input.feedback {
            BindingAccess::Feedback
        } else {
            BindingAccess::Read
        };
        (input.name.as_str(), access)
    });
    let writes = pass
        .outputs()
        .iter()
        .map(|output| (output.as_str(), BindingAccess::Write));

    reads
        .chain(writes)
        .enumerate()
        .map(|(slot, (name, access))| {
            let handle = registry.resolve(name)?;
            Ok(BoundResource {
                slot: slot as u32,
                name,
                resource: registry.physical(handle, access),
                access,
            })
        })
        .collect()
}

/// Workgroup count for a compute pass, from its first texture output, else
/// its first storage buffer output (one invocation per 4 bytes), else one group.
pub fn workgroup_count(pass: &Pass, registry: &ResourceRegistry, workgroup_size: [u32; 2]) -> [u32; 3] {
    let [wx, wy] = workgroup_size.map(|s| s.max(1));
    let outputs: Vec<ResourceHandle> = pass
        .outputs()
        .iter()
        .filter_map(|name| registry.resolve(name).ok())
        .collect();

    if let Some(&texture) = outputs.iter().find(|h| h.kind() == ResourceKind::Texture2d) {
        let (width, height) = registry.extent(texture);
        return [width.div_ceil(wx), height.div_ceil(wy), 1];
    }
    let buffer_size = outputs
        .iter()
        .filter(|h| h.kind() == ResourceKind::StorageBuffer)
        .find_map(|&h| match registry.descriptor(h).size {
            Some(ResourceSize::Bytes(bytes)) => Some(bytes),
            _ => None,
        });
    match buffer_size {
        Some(bytes) => [((bytes / 4) as u32).div_ceil(wx).max(1), 1, 1],
        None => [1, 1, 1],
    }
}

fn execute_pass(
    pass: &Pass,
    registry: &ResourceRegistry,
    programs: &mut ProgramCache,
    device: &mut dyn Device,
) -> Result<(), FrameError> {
    let name = pass.name();
    let bindings = resolve_bindings(pass, registry).map_err(|source| FrameError::Resource {
        pass: name.to_string(),
        source,
    })?;
    let compile_error = |source| FrameError::Compile {
        pass: name.to_string(),
        source,
    };
    let execute_error = |source| FrameError::Execute {
        pass: name.to_string(),
        source,
    };

    match pass.stage() {
        PassStage::Compute {
            program,
            workgroup_size,
        } => {
            let program = programs
                .get_or_compile(device, ShaderStage::Compute, program)
                .map_err(compile_error)?;
            let workgroups = workgroup_count(pass, registry, *workgroup_size);
            log::trace!("Dispatching '{}' {:?}", name, workgroups);
            device
                .dispatch(&ComputeDispatch {
                    label: name,
                    program,
                    bindings: &bindings,
                    workgroups,
                })
                .map_err(execute_error)
        }
        PassStage::Render {
            vertex,
            fragment,
            vertex_count,
        } => {
            let vertex = programs
                .get_or_compile(device, ShaderStage::Vertex, vertex)
                .map_err(compile_error)?;
            let fragment = programs
                .get_or_compile(device, ShaderStage::Fragment, fragment)
                .map_err(compile_error)?;
            log::trace!("Drawing '{}' ({} vertices)", name, vertex_count);
            device
                .draw(&DrawCall {
                    label: name,
                    vertex,
                    fragment,
                    bindings: &bindings,
                    vertex_count: *vertex_count,
                })
                .map_err(execute_error)
        }
    }
}

impl<D: Device> Pipeline<D> {
    /// Run one frame: `update` then execute every pass in order, then swap
    /// every persistent resource.
    ///
    /// A failure aborts the rest of the frame and skips the swap, so feedback
    /// resources still hold the last completed frame. The pipeline stays usable.
    pub fn run_frame(&mut self, frame: &FrameContext) -> Result<FrameReport, FrameError> {
        for pass in &mut self.passes {
            pass.run_update(frame, &self.registry, &mut self.device)
                .map_err(|source| FrameError::Update {
                    pass: pass.name().to_string(),
                    source,
                })?;
            execute_pass(pass, &self.registry, &mut self.programs, &mut self.device)?;
        }

        let resources_swapped = self.registry.swap_all_persistent();
        self.frames_completed += 1;
        log::trace!(
            "Frame {} complete, swapped {} resources",
            frame.frame_index,
            resources_swapped
        );

        Ok(FrameReport {
            frame_index: frame.frame_index,
            passes_executed: self.passes.len(),
            resources_swapped,
        })
    }

    /// Re-run every `init` and validate again against the existing registry.
    ///
    /// Hooks that register with [`InitContext::declare`] are unaffected;
    /// strict registrations fail with a duplicate name.
    pub fn rebuild(&mut self) -> Result<(), PipelineError> {
        log::info!("Rebuilding pipeline '{}'", self.config.label);
        self.run_init()?;
        validate(&self.passes, &self.registry)
    }

    /// Release every resource and rebuild at a new surface size.
    ///
    /// If the rebuild fails, frames fail until a later resize succeeds.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), PipelineError> {
        log::info!(
            "Resizing pipeline '{}' to {}x{}",
            self.config.label,
            width,
            height
        );
        self.device.wait_idle()?;
        self.registry.release_all(&mut self.device);
        self.config.surface_width = width;
        self.config.surface_height = height;
        self.registry = ResourceRegistry::new(width, height);
        self.initialize()
    }

    /// Wait for the device, then release every resource and program.
    pub fn teardown(mut self) -> Result<(), DeviceError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), DeviceError> {
        if self.released {
            return Ok(());
        }

        // Nothing is destroyed unless the device confirmed it is idle.
        self.device.wait_idle()?;
        self.released = true;
        self.registry.release_all(&mut self.device);
        self.programs.release(&mut self.device);
        log::info!(
            "Released pipeline '{}' after {} frames",
            self.config.label,
            self.frames_completed
        );
        Ok(())
    }
}

impl<D: Device> Drop for Pipeline<D> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::error!("Failed to release pipeline '{}': {}", self.config.label, e);
        }
    }
}
