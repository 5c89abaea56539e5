//! Trails: a compute pass decays last frame's trail and splats the pointer
//! into a persistent texture, then a render pass presents it.

use bytemuck::{Pod, Zeroable};

use crate::backend::{SamplerDescriptor, TextureFormat};
use crate::render_graph::*;
use crate::shader::FragmentLibrary;

pub const UPDATE_PASS: &str = "trail_update";
pub const PRESENT_PASS: &str = "trail_present";
pub const FRAME_UNIFORMS: &str = "trail_frame";
pub const PARAMS: &str = "trail_params";
pub const TRAIL: &str = "trail";
pub const SAMPLER: &str = "trail_sampler";
pub const OUTPUT: &str = "trail_color";

/// Matches `TrailParams` in `trail_update.wgsl`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TrailParams {
    pub decay: f32,
    pub radius: f32,
    pub _pad: [f32; 2],
}

/// Owns the trail parameters; allocates the feedback texture in `init`.
#[derive(Debug, Clone)]
pub struct TrailHooks {
    pub decay: f32,
    pub radius: f32,
}

impl Default for TrailHooks {
    fn default() -> Self {
        Self {
            decay: 0.96,
            radius: 24.0,
        }
    }
}

impl TrailHooks {
    fn params(&self) -> TrailParams {
        TrailParams {
            decay: self.decay.clamp(0.0, 1.0),
            radius: self.radius.max(1.0),
            _pad: [0.0; 2],
        }
    }
}

impl PassHooks for TrailHooks {
    fn init(&mut self, ctx: &mut InitContext<'_>) -> HookResult {
        ctx.declare(ResourceDescriptor::uniform_for::<FrameUniforms>(FRAME_UNIFORMS))?;
        ctx.declare(ResourceDescriptor::uniform_for::<TrailParams>(PARAMS))?;
        ctx.allocate_persistent(ResourceDescriptor::texture(TRAIL, TextureFormat::Rgba16Float))?;
        ctx.write_uniform(PARAMS, &self.params())
    }

    fn update(&mut self, ctx: &mut UpdateContext<'_>) -> HookResult {
        ctx.write_frame_uniforms(FRAME_UNIFORMS)?;
        ctx.write_uniform(PARAMS, &self.params())
    }
}

pub fn add_passes(
    builder: PipelineBuilder,
    library: &FragmentLibrary,
    hooks: TrailHooks,
) -> Result<PipelineBuilder, PipelineError> {
    let update = Pass::compute_from(UPDATE_PASS, "trail_update", library)?
        .with_workgroup_size(8, 8)
        .input(FRAME_UNIFORMS)
        .input(PARAMS)
        .feedback_input(TRAIL)
        .output(TRAIL)
        .with_hooks(hooks);

    let present = Pass::render_from(PRESENT_PASS, "fullscreen", "trail_present", library)?
        .input(TRAIL)
        .input(SAMPLER)
        .output(OUTPUT);

    Ok(builder
        .resource(ResourceDescriptor::sampler(SAMPLER, SamplerDescriptor::default()))
        .resource(ResourceDescriptor::texture(OUTPUT, TextureFormat::Rgba8Unorm))
        .pass(update)
        .pass(present))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BindingAccess, RecordingDevice};
    use crate::PipelineConfig;

    #[test]
    fn present_reads_this_frames_trail() {
        let device = RecordingDevice::new();
        let library = crate::effects::library().unwrap();
        let mut pipeline = add_passes(
            PipelineBuilder::new(PipelineConfig::default().with_surface_size(64, 32)),
            &library,
            TrailHooks::default(),
        )
        .unwrap()
        .build(device.clone())
        .unwrap();

        for i in 0..3 {
            let report = pipeline.run_frame(&FrameContext::new(i, i as f32 / 60.0, 1.0 / 60.0)).unwrap();
            assert_eq!(report.resources_swapped, 1);
        }

        let updates = device.submissions_for(UPDATE_PASS);
        let presents = device.submissions_for(PRESENT_PASS);
        for (update, present) in updates.iter().zip(&presents) {
            assert_eq!(
                present.read_stamp(TRAIL),
                Some(update.index),
                "present must see the trail written earlier in the same frame"
            );
        }
        assert_eq!(
            updates[0].kind,
            crate::backend::SubmissionKind::Dispatch { workgroups: [8, 4, 1] }
        );

        let feedback = updates[1]
            .bindings
            .iter()
            .find(|b| b.access == BindingAccess::Feedback)
            .unwrap();
        assert_eq!(feedback.stamp, Some(updates[0].index));
    }
}
