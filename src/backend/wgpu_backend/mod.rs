//! wgpu backend implementation
//!
//! Headless: the device owns no surface. Every dispatch or draw is encoded
//! into its own command buffer and submitted immediately, so a failed pass
//! never leaves half-recorded work behind for the next one.

use crate::backend::traits::*;
use crate::backend::types::*;
use std::borrow::Cow;
use std::collections::HashMap;

struct WgpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    format: wgpu::TextureFormat,
}

struct WgpuProgram {
    module: wgpu::ShaderModule,
    stage: ShaderStage,
}

/// Key for cached render pipelines: program pair plus color target formats.
type RenderPipelineKey = (u64, u64, Vec<wgpu::TextureFormat>);

/// wgpu device implementation
pub struct WgpuDevice {
    #[allow(dead_code)]
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,

    // Resource storage
    textures: HashMap<u64, WgpuTexture>,
    buffers: HashMap<u64, wgpu::Buffer>,
    samplers: HashMap<u64, wgpu::Sampler>,
    programs: HashMap<u64, WgpuProgram>,
    compute_pipelines: HashMap<u64, wgpu::ComputePipeline>,
    render_pipelines: HashMap<RenderPipelineKey, wgpu::RenderPipeline>,

    next_id: u64,
}

impl WgpuDevice {
    fn convert_texture_format(format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
            TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
            TextureFormat::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
            TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
            TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
            TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
            TextureFormat::Rg32Float => wgpu::TextureFormat::Rg32Float,
        }
    }

    fn convert_texture_usage(usage: TextureUsage) -> wgpu::TextureUsages {
        let mut result = wgpu::TextureUsages::empty();
        if usage.contains(TextureUsage::COPY_SRC) {
            result |= wgpu::TextureUsages::COPY_SRC;
        }
        if usage.contains(TextureUsage::COPY_DST) {
            result |= wgpu::TextureUsages::COPY_DST;
        }
        if usage.contains(TextureUsage::TEXTURE_BINDING) {
            result |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if usage.contains(TextureUsage::STORAGE_BINDING) {
            result |= wgpu::TextureUsages::STORAGE_BINDING;
        }
        if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            result |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        result
    }

    fn convert_buffer_usage(usage: BufferUsage) -> wgpu::BufferUsages {
        let mut result = wgpu::BufferUsages::empty();
        if usage.contains(BufferUsage::COPY_SRC) {
            result |= wgpu::BufferUsages::COPY_SRC;
        }
        if usage.contains(BufferUsage::COPY_DST) {
            result |= wgpu::BufferUsages::COPY_DST;
        }
        if usage.contains(BufferUsage::UNIFORM) {
            result |= wgpu::BufferUsages::UNIFORM;
        }
        if usage.contains(BufferUsage::STORAGE) {
            result |= wgpu::BufferUsages::STORAGE;
        }
        result
    }

    fn convert_filter_mode(mode: FilterMode) -> wgpu::FilterMode {
        match mode {
            FilterMode::Nearest => wgpu::FilterMode::Nearest,
            FilterMode::Linear => wgpu::FilterMode::Linear,
        }
    }

    fn convert_address_mode(mode: AddressMode) -> wgpu::AddressMode {
        match mode {
            AddressMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
            AddressMode::Repeat => wgpu::AddressMode::Repeat,
            AddressMode::MirrorRepeat => wgpu::AddressMode::MirrorRepeat,
        }
    }

    /// Create a headless device, blocking on adapter and device requests.
    pub fn new() -> DeviceResult<Self> {
        pollster::block_on(Self::new_async())
    }

    pub async fn new_async() -> DeviceResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| DeviceError::InitializationFailed("No suitable adapter found".into()))?;

        let adapter_info = adapter.get_info();
        log::info!(
            "Using adapter: {} ({:?} backend)",
            adapter_info.name,
            adapter_info.backend
        );

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Shader Pipeline Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                },
                None,
            )
            .await
            .map_err(|e| DeviceError::InitializationFailed(e.to_string()))?;

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
            textures: HashMap::new(),
            buffers: HashMap::new(),
            samplers: HashMap::new(),
            programs: HashMap::new(),
            compute_pipelines: HashMap::new(),
            render_pipelines: HashMap::new(),
            next_id: 0,
        })
    }

    pub fn adapter_info(&self) -> wgpu::AdapterInfo {
        self.adapter.get_info()
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Raw texture for a handle, e.g. for copying the final pass to a surface.
    pub fn texture(&self, texture: TextureHandle) -> Option<&wgpu::Texture> {
        self.textures.get(&texture.0).map(|t| &t.texture)
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn with_validation<T>(&self, f: impl FnOnce(&wgpu::Device) -> T) -> Result<T, String> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(err.to_string()),
            None => Ok(value),
        }
    }

    fn program(&self, program: ProgramHandle, stage: ShaderStage) -> Result<&WgpuProgram, String> {
        match self.programs.get(&program.0) {
            Some(p) if p.stage == stage => Ok(p),
            Some(p) => Err(format!("program {} is a {:?} program", program.0, p.stage)),
            None => Err(format!("program {} does not exist", program.0)),
        }
    }

    fn binding_resource<'a>(
        &'a self,
        binding: &BoundResource<'_>,
    ) -> Result<wgpu::BindingResource<'a>, String> {
        let missing = || format!("binding '{}' is not a live resource", binding.name);
        Ok(match binding.resource {
            GpuResource::Texture(h) => {
                wgpu::BindingResource::TextureView(&self.textures.get(&h.0).ok_or_else(missing)?.view)
            }
            GpuResource::Buffer(h) => self
                .buffers
                .get(&h.0)
                .ok_or_else(missing)?
                .as_entire_binding(),
            GpuResource::Sampler(h) => {
                wgpu::BindingResource::Sampler(self.samplers.get(&h.0).ok_or_else(missing)?)
            }
        })
    }

    fn bind_group(
        &self,
        label: &str,
        layout: &wgpu::BindGroupLayout,
        bindings: &[&BoundResource<'_>],
    ) -> Result<wgpu::BindGroup, String> {
        let entries = bindings
            .iter()
            .map(|b| {
                Ok(wgpu::BindGroupEntry {
                    binding: b.slot,
                    resource: self.binding_resource(b)?,
                })
            })
            .collect::<Result<Vec<_>, String>>()?;

        // Auto-derived layouts omit bindings the shader never uses.
        self.with_validation(|device| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout,
                entries: &entries,
            })
        })
        .map_err(|e| format!("bindings do not match the program layout: {e}"))
    }

    fn encode_dispatch(&mut self, dispatch: &ComputeDispatch<'_>) -> Result<(), String> {
        if !self.compute_pipelines.contains_key(&dispatch.program.0) {
            let program = self.program(dispatch.program, ShaderStage::Compute)?;
            let pipeline = self.with_validation(|device| {
                device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(dispatch.label),
                    layout: None,
                    module: &program.module,
                    entry_point: ShaderStage::Compute.entry_point(),
                    compilation_options: Default::default(),
                })
            })?;
            self.compute_pipelines.insert(dispatch.program.0, pipeline);
        }
        let pipeline = &self.compute_pipelines[&dispatch.program.0];

        let bindings: Vec<_> = dispatch.bindings.iter().collect();
        let bind_group = if bindings.is_empty() {
            None
        } else {
            let layout = self.with_validation(|_| pipeline.get_bind_group_layout(0))?;
            Some(self.bind_group(dispatch.label, &layout, &bindings)?)
        };

        self.with_validation(|device| {
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(dispatch.label),
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(dispatch.label),
                    timestamp_writes: None,
                });
                pass.set_pipeline(pipeline);
                if let Some(bind_group) = &bind_group {
                    pass.set_bind_group(0, bind_group, &[]);
                }
                let [x, y, z] = dispatch.workgroups;
                pass.dispatch_workgroups(x, y, z);
            }
            self.queue.submit(Some(encoder.finish()));
        })
    }

    fn encode_draw(&mut self, draw: &DrawCall<'_>) -> Result<(), String> {
        // Texture outputs become color attachments, everything else goes in group 0.
        let (targets, resources): (Vec<&BoundResource<'_>>, Vec<&BoundResource<'_>>) =
            draw.bindings.iter().partition(|b| {
                b.access.is_write() && matches!(b.resource, GpuResource::Texture(_))
            });

        let mut formats = Vec::with_capacity(targets.len());
        for target in &targets {
            let GpuResource::Texture(h) = target.resource else {
                continue;
            };
            let texture = self
                .textures
                .get(&h.0)
                .ok_or_else(|| format!("target '{}' is not a live texture", target.name))?;
            formats.push(texture.format);
        }

        let key = (draw.vertex.0, draw.fragment.0, formats.clone());
        if !self.render_pipelines.contains_key(&key) {
            let vertex = self.program(draw.vertex, ShaderStage::Vertex)?;
            let fragment = self.program(draw.fragment, ShaderStage::Fragment)?;
            let color_targets: Vec<Option<wgpu::ColorTargetState>> = formats
                .iter()
                .map(|&format| {
                    Some(wgpu::ColorTargetState {
                        format,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })
                })
                .collect();
            let pipeline = self.with_validation(|device| {
                device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some(draw.label),
                    layout: None,
                    vertex: wgpu::VertexState {
                        module: &vertex.module,
                        entry_point: ShaderStage::Vertex.entry_point(),
                        compilation_options: Default::default(),
                        buffers: &[],
                    },
                    primitive: wgpu::PrimitiveState::default(),
                    depth_stencil: None,
                    multisample: wgpu::MultisampleState::default(),
                    fragment: Some(wgpu::FragmentState {
                        module: &fragment.module,
                        entry_point: ShaderStage::Fragment.entry_point(),
                        compilation_options: Default::default(),
                        targets: &color_targets,
                    }),
                    multiview: None,
                })
            })?;
            self.render_pipelines.insert(key.clone(), pipeline);
        }
        let pipeline = &self.render_pipelines[&key];

        let bind_group = if resources.is_empty() {
            None
        } else {
            let layout = self.with_validation(|_| pipeline.get_bind_group_layout(0))?;
            Some(self.bind_group(draw.label, &layout, &resources)?)
        };

        let views: Vec<&wgpu::TextureView> = targets
            .iter()
            .filter_map(|t| match t.resource {
                GpuResource::Texture(h) => self.textures.get(&h.0).map(|t| &t.view),
                _ => None,
            })
            .collect();
        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = views
            .iter()
            .map(|view| {
                Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect();

        self.with_validation(|device| {
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(draw.label),
            });
            {
                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some(draw.label),
                    color_attachments: &color_attachments,
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                pass.set_pipeline(pipeline);
                if let Some(bind_group) = &bind_group {
                    pass.set_bind_group(0, bind_group, &[]);
                }
                pass.draw(0..draw.vertex_count, 0..1);
            }
            self.queue.submit(Some(encoder.finish()));
        })
    }
}

impl Device for WgpuDevice {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> DeviceResult<TextureHandle> {
        let format = Self::convert_texture_format(desc.format);
        let texture = self
            .with_validation(|device| {
                device.create_texture(&wgpu::TextureDescriptor {
                    label: desc.label.as_deref(),
                    size: wgpu::Extent3d {
                        width: desc.width,
                        height: desc.height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format,
                    usage: Self::convert_texture_usage(desc.usage),
                    view_formats: &[],
                })
            })
            .map_err(DeviceError::TextureCreationFailed)?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let id = self.allocate_id();
        self.textures.insert(
            id,
            WgpuTexture {
                texture,
                view,
                format,
            },
        );
        Ok(TextureHandle(id))
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> DeviceResult<SamplerHandle> {
        let sampler = self
            .with_validation(|device| {
                device.create_sampler(&wgpu::SamplerDescriptor {
                    label: desc.label.as_deref(),
                    address_mode_u: Self::convert_address_mode(desc.address_mode_u),
                    address_mode_v: Self::convert_address_mode(desc.address_mode_v),
                    mag_filter: Self::convert_filter_mode(desc.mag_filter),
                    min_filter: Self::convert_filter_mode(desc.min_filter),
                    ..Default::default()
                })
            })
            .map_err(DeviceError::SamplerCreationFailed)?;

        let id = self.allocate_id();
        self.samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> DeviceResult<BufferHandle> {
        let buffer = self
            .with_validation(|device| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: desc.label.as_deref(),
                    size: desc.size,
                    usage: Self::convert_buffer_usage(desc.usage),
                    mapped_at_creation: false,
                })
            })
            .map_err(DeviceError::BufferCreationFailed)?;

        let id = self.allocate_id();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let target = self
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| DeviceError::InvalidHandle(format!("buffer {}", buffer.0)))?;
        if offset + data.len() as u64 > target.size() {
            return Err(DeviceError::WriteOutOfBounds {
                size: target.size(),
                offset,
                len: data.len() as u64,
            });
        }
        self.queue.write_buffer(target, offset, data);
        Ok(())
    }

    fn compile_program(&mut self, source: &str, stage: ShaderStage) -> DeviceResult<ProgramHandle> {
        let module = self
            .with_validation(|device| {
                device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(stage.entry_point()),
                    source: wgpu::ShaderSource::Wgsl(Cow::Owned(source.to_string())),
                })
            })
            .map_err(|message| DeviceError::ShaderCompilationFailed { stage, message })?;

        let id = self.allocate_id();
        self.programs.insert(id, WgpuProgram { module, stage });
        Ok(ProgramHandle(id))
    }

    fn dispatch(&mut self, dispatch: &ComputeDispatch<'_>) -> DeviceResult<()> {
        self.encode_dispatch(dispatch)
            .map_err(|message| DeviceError::DispatchFailed {
                label: dispatch.label.to_string(),
                message,
            })
    }

    fn draw(&mut self, draw: &DrawCall<'_>) -> DeviceResult<()> {
        self.encode_draw(draw).map_err(|message| DeviceError::DrawFailed {
            label: draw.label.to_string(),
            message,
        })
    }

    fn destroy(&mut self, resource: GpuResource) {
        match resource {
            GpuResource::Texture(h) => {
                if let Some(texture) = self.textures.remove(&h.0) {
                    texture.texture.destroy();
                }
            }
            GpuResource::Buffer(h) => {
                if let Some(buffer) = self.buffers.remove(&h.0) {
                    buffer.destroy();
                }
            }
            GpuResource::Sampler(h) => {
                self.samplers.remove(&h.0);
            }
        }
    }

    fn destroy_program(&mut self, program: ProgramHandle) {
        self.programs.remove(&program.0);
        self.compute_pipelines.remove(&program.0);
        self.render_pipelines
            .retain(|(vertex, fragment, _), _| *vertex != program.0 && *fragment != program.0);
    }

    fn wait_idle(&mut self) -> DeviceResult<()> {
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Option<WgpuDevice> {
        match WgpuDevice::new() {
            Ok(device) => Some(device),
            Err(e) => {
                eprintln!("wgpu adapter not available, skipping: {}", e);
                None
            }
        }
    }

    #[test]
    fn unused_binding_fails_dispatch_instead_of_panicking() {
        let Some(mut device) = device() else {
            return;
        };
        let program = device
            .compile_program("@compute @workgroup_size(1) fn cs_main() {}", ShaderStage::Compute)
            .unwrap();
        let params = device
            .create_buffer(&BufferDescriptor {
                label: Some("params".into()),
                size: 16,
                usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            })
            .unwrap();

        let bindings = [BoundResource {
            slot: 0,
            name: "params",
            resource: GpuResource::Buffer(params),
            access: BindingAccess::Read,
        }];
        let result = device.dispatch(&ComputeDispatch {
            label: "a",
            program,
            bindings: &bindings,
            workgroups: [1, 1, 1],
        });
        assert!(matches!(result, Err(DeviceError::DispatchFailed { .. })));

        // The device stays usable after the failed dispatch.
        let result = device.dispatch(&ComputeDispatch {
            label: "b",
            program,
            bindings: &[],
            workgroups: [1, 1, 1],
        });
        assert!(result.is_ok());
        device.wait_idle().unwrap();
    }
}
