//! In-memory device that records every submission.
//!
//! `RecordingDevice` performs no GPU work. It keeps enough state to observe
//! what a pipeline asked for: buffer contents, which submission last wrote
//! each resource, and the bindings seen by every dispatch and draw. Clones
//! share state, so a test can keep a handle while the pipeline owns the device.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::Mutex;

use crate::backend::traits::*;
use crate::backend::types::*;

/// What kind of work a submission was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionKind {
    Dispatch { workgroups: [u32; 3] },
    Draw { vertex_count: u32 },
}

/// A binding as seen by the device at submission time.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedBinding {
    pub slot: u32,
    pub name: String,
    pub resource: GpuResource,
    pub access: BindingAccess,
    /// For reads, the submission that last wrote the resource; for writes, this submission.
    pub stamp: Option<u64>,
    /// Buffer contents at submission time (empty for textures and samplers).
    pub contents: Vec<u8>,
}

impl ObservedBinding {
    /// Decode the observed buffer contents.
    pub fn read_pod<T: Pod>(&self) -> Option<T> {
        let size = std::mem::size_of::<T>();
        if self.contents.len() < size {
            return None;
        }
        Some(bytemuck::pod_read_unaligned(&self.contents[..size]))
    }
}

/// One successful dispatch or draw.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub index: u64,
    pub label: String,
    pub kind: SubmissionKind,
    pub bindings: Vec<ObservedBinding>,
}

impl Submission {
    pub fn binding(&self, name: &str) -> Option<&ObservedBinding> {
        self.bindings.iter().find(|b| b.name == name)
    }

    /// Stamp observed by the read binding of `name`.
    pub fn read_stamp(&self, name: &str) -> Option<u64> {
        self.bindings
            .iter()
            .find(|b| b.name == name && b.access.is_read())
            .and_then(|b| b.stamp)
    }

    pub fn writes(&self, name: &str) -> bool {
        self.bindings
            .iter()
            .any(|b| b.name == name && b.access.is_write())
    }
}

struct RecordedBuffer {
    desc: BufferDescriptor,
    contents: Vec<u8>,
}

#[derive(Default)]
struct RecordingState {
    next_id: u64,
    textures: HashMap<u64, TextureDescriptor>,
    buffers: HashMap<u64, RecordedBuffer>,
    samplers: HashMap<u64, SamplerDescriptor>,
    programs: HashMap<u64, (ShaderStage, String)>,
    stamps: HashMap<u64, u64>,
    submissions: Vec<Submission>,
    destroyed: Vec<GpuResource>,
    destroyed_while_busy: usize,
    in_flight: usize,
    idle_waits: usize,
    compile_count: usize,
    dispatch_count: u64,
    draw_count: u64,
    fail_dispatch_at: HashSet<u64>,
    fail_draw_at: HashSet<u64>,
    fail_compile_containing: Vec<String>,
    fail_next_wait: bool,
}

impl RecordingState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn resource_id(resource: GpuResource) -> u64 {
        match resource {
            GpuResource::Texture(h) => h.0,
            GpuResource::Buffer(h) => h.0,
            GpuResource::Sampler(h) => h.0,
        }
    }

    fn is_live(&self, resource: GpuResource) -> bool {
        match resource {
            GpuResource::Texture(h) => self.textures.contains_key(&h.0),
            GpuResource::Buffer(h) => self.buffers.contains_key(&h.0),
            GpuResource::Sampler(h) => self.samplers.contains_key(&h.0),
        }
    }

    fn check_program(&self, program: ProgramHandle, stage: ShaderStage) -> Result<(), String> {
        match self.programs.get(&program.0) {
            Some((s, _)) if *s == stage => Ok(()),
            Some((s, _)) => Err(format!("program {} is a {s:?} program", program.0)),
            None => Err(format!("program {} does not exist", program.0)),
        }
    }

    fn submit(&mut self, label: &str, kind: SubmissionKind, bindings: &[BoundResource<'_>]) {
        let index = self.submissions.len() as u64;
        let mut observed = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let id = Self::resource_id(binding.resource);
            let contents = match binding.resource {
                GpuResource::Buffer(h) => self
                    .buffers
                    .get(&h.0)
                    .map(|b| b.contents.clone())
                    .unwrap_or_default(),
                _ => Vec::new(),
            };
            let stamp = if binding.access.is_write() {
                Some(index)
            } else {
                self.stamps.get(&id).copied()
            };
            observed.push(ObservedBinding {
                slot: binding.slot,
                name: binding.name.to_string(),
                resource: binding.resource,
                access: binding.access,
                stamp,
                contents,
            });
        }
        for binding in bindings.iter().filter(|b| b.access.is_write()) {
            self.stamps
                .insert(Self::resource_id(binding.resource), index);
        }
        self.submissions.push(Submission {
            index,
            label: label.to_string(),
            kind,
            bindings: observed,
        });
        self.in_flight += 1;
    }
}

/// Device that records instead of rendering
#[derive(Clone, Default)]
pub struct RecordingDevice {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `n`-th dispatch (0-based, counting failed ones) fail.
    pub fn fail_dispatch_at(&self, n: u64) {
        self.state.lock().fail_dispatch_at.insert(n);
    }

    /// Make the `n`-th draw (0-based, counting failed ones) fail.
    pub fn fail_draw_at(&self, n: u64) {
        self.state.lock().fail_draw_at.insert(n);
    }

    /// Reject every program whose source contains `snippet`.
    pub fn fail_compile_containing(&self, snippet: &str) {
        self.state
            .lock()
            .fail_compile_containing
            .push(snippet.to_string());
    }

    /// Make the next idle wait report a lost device. Failed waits are not
    /// counted by [`idle_waits`](Self::idle_waits).
    pub fn fail_next_wait_idle(&self) {
        self.state.lock().fail_next_wait = true;
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_dispatch_at.clear();
        state.fail_draw_at.clear();
        state.fail_compile_containing.clear();
        state.fail_next_wait = false;
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    /// Submissions whose label equals `label`, in submission order.
    pub fn submissions_for(&self, label: &str) -> Vec<Submission> {
        self.state
            .lock()
            .submissions
            .iter()
            .filter(|s| s.label == label)
            .cloned()
            .collect()
    }

    pub fn dispatch_count(&self) -> u64 {
        self.state.lock().dispatch_count
    }

    pub fn draw_count(&self) -> u64 {
        self.state.lock().draw_count
    }

    pub fn compile_count(&self) -> usize {
        self.state.lock().compile_count
    }

    /// Textures, buffers and samplers that have not been destroyed.
    pub fn live_resources(&self) -> usize {
        let state = self.state.lock();
        state.textures.len() + state.buffers.len() + state.samplers.len()
    }

    pub fn live_programs(&self) -> usize {
        self.state.lock().programs.len()
    }

    pub fn destroyed(&self) -> Vec<GpuResource> {
        self.state.lock().destroyed.clone()
    }

    /// Resources destroyed while submissions were still in flight.
    pub fn destroyed_while_busy(&self) -> usize {
        self.state.lock().destroyed_while_busy
    }

    pub fn idle_waits(&self) -> usize {
        self.state.lock().idle_waits
    }

    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.state
            .lock()
            .buffers
            .get(&buffer.0)
            .map(|b| b.contents.clone())
    }
}

impl Device for RecordingDevice {
    fn name(&self) -> &str {
        "Recording"
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> DeviceResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(DeviceError::TextureCreationFailed(format!(
                "{:?} has zero extent",
                desc.label
            )));
        }
        let mut state = self.state.lock();
        let id = state.allocate_id();
        log::trace!(
            "RecordingDevice: creating texture {:?} ({}x{} {:?})",
            desc.label,
            desc.width,
            desc.height,
            desc.format
        );
        state.textures.insert(id, desc.clone());
        Ok(TextureHandle(id))
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> DeviceResult<SamplerHandle> {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        log::trace!("RecordingDevice: creating sampler {:?}", desc.label);
        state.samplers.insert(id, desc.clone());
        Ok(SamplerHandle(id))
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> DeviceResult<BufferHandle> {
        if desc.size == 0 {
            return Err(DeviceError::BufferCreationFailed(format!(
                "{:?} has zero size",
                desc.label
            )));
        }
        let mut state = self.state.lock();
        let id = state.allocate_id();
        log::trace!(
            "RecordingDevice: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        state.buffers.insert(
            id,
            RecordedBuffer {
                desc: desc.clone(),
                contents: vec![0; desc.size as usize],
            },
        );
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let recorded = state
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| DeviceError::InvalidHandle(format!("buffer {}", buffer.0)))?;
        let end = offset + data.len() as u64;
        if end > recorded.desc.size {
            return Err(DeviceError::WriteOutOfBounds {
                size: recorded.desc.size,
                offset,
                len: data.len() as u64,
            });
        }
        recorded.contents[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn compile_program(&mut self, source: &str, stage: ShaderStage) -> DeviceResult<ProgramHandle> {
        let mut state = self.state.lock();
        state.compile_count += 1;
        if let Some(snippet) = state
            .fail_compile_containing
            .iter()
            .find(|s| source.contains(s.as_str()))
        {
            return Err(DeviceError::ShaderCompilationFailed {
                stage,
                message: format!("injected failure on '{snippet}'"),
            });
        }
        if !source.contains(stage.entry_point()) {
            return Err(DeviceError::ShaderCompilationFailed {
                stage,
                message: format!("missing entry point `{}`", stage.entry_point()),
            });
        }
        let id = state.allocate_id();
        state.programs.insert(id, (stage, source.to_string()));
        Ok(ProgramHandle(id))
    }

    fn dispatch(&mut self, dispatch: &ComputeDispatch<'_>) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let n = state.dispatch_count;
        state.dispatch_count += 1;

        let fail = |message: String| DeviceError::DispatchFailed {
            label: dispatch.label.to_string(),
            message,
        };
        if state.fail_dispatch_at.contains(&n) {
            return Err(fail(format!("injected failure on dispatch #{n}")));
        }
        state
            .check_program(dispatch.program, ShaderStage::Compute)
            .map_err(fail)?;
        if let Some(b) = dispatch.bindings.iter().find(|b| !state.is_live(b.resource)) {
            return Err(fail(format!("binding '{}' is not a live resource", b.name)));
        }

        log::trace!(
            "RecordingDevice: dispatch '{}' {:?}",
            dispatch.label,
            dispatch.workgroups
        );
        state.submit(
            dispatch.label,
            SubmissionKind::Dispatch {
                workgroups: dispatch.workgroups,
            },
            dispatch.bindings,
        );
        Ok(())
    }

    fn draw(&mut self, draw: &DrawCall<'_>) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let n = state.draw_count;
        state.draw_count += 1;

        let fail = |message: String| DeviceError::DrawFailed {
            label: draw.label.to_string(),
            message,
        };
        if state.fail_draw_at.contains(&n) {
            return Err(fail(format!("injected failure on draw #{n}")));
        }
        state
            .check_program(draw.vertex, ShaderStage::Vertex)
            .map_err(fail)?;
        state
            .check_program(draw.fragment, ShaderStage::Fragment)
            .map_err(fail)?;
        if let Some(b) = draw.bindings.iter().find(|b| !state.is_live(b.resource)) {
            return Err(fail(format!("binding '{}' is not a live resource", b.name)));
        }

        log::trace!(
            "RecordingDevice: draw '{}' ({} vertices)",
            draw.label,
            draw.vertex_count
        );
        state.submit(
            draw.label,
            SubmissionKind::Draw {
                vertex_count: draw.vertex_count,
            },
            draw.bindings,
        );
        Ok(())
    }

    fn destroy(&mut self, resource: GpuResource) {
        let mut state = self.state.lock();
        if state.in_flight > 0 {
            state.destroyed_while_busy += 1;
        }
        let id = RecordingState::resource_id(resource);
        let removed = match resource {
            GpuResource::Texture(_) => state.textures.remove(&id).is_some(),
            GpuResource::Buffer(_) => state.buffers.remove(&id).is_some(),
            GpuResource::Sampler(_) => state.samplers.remove(&id).is_some(),
        };
        if removed {
            state.stamps.remove(&id);
            state.destroyed.push(resource);
        }
    }

    fn destroy_program(&mut self, program: ProgramHandle) {
        self.state.lock().programs.remove(&program.0);
    }

    fn wait_idle(&mut self) -> DeviceResult<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_wait) {
            return Err(DeviceError::DeviceLost);
        }
        state.in_flight = 0;
        state.idle_waits += 1;
        Ok(())
    }
}
