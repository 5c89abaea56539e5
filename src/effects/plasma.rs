//! Plasma: one fullscreen render pass driven by the frame uniforms.

use crate::backend::TextureFormat;
use crate::render_graph::*;
use crate::shader::FragmentLibrary;

pub const PASS_NAME: &str = "plasma";
pub const FRAME_UNIFORMS: &str = "plasma_frame";
pub const OUTPUT: &str = "plasma_color";

/// Declares the frame uniform buffer and refreshes it every frame.
#[derive(Debug, Default)]
pub struct PlasmaHooks;

impl PassHooks for PlasmaHooks {
    fn init(&mut self, ctx: &mut InitContext<'_>) -> HookResult {
        ctx.declare(ResourceDescriptor::uniform_for::<FrameUniforms>(FRAME_UNIFORMS))?;
        Ok(())
    }

    fn update(&mut self, ctx: &mut UpdateContext<'_>) -> HookResult {
        ctx.write_frame_uniforms(FRAME_UNIFORMS)
    }
}

pub fn pass(library: &FragmentLibrary) -> Result<Pass, PipelineError> {
    Ok(Pass::render_from(PASS_NAME, "fullscreen", "plasma", library)?
        .input(FRAME_UNIFORMS)
        .output(OUTPUT)
        .with_hooks(PlasmaHooks))
}

pub fn add_passes(
    builder: PipelineBuilder,
    library: &FragmentLibrary,
) -> Result<PipelineBuilder, PipelineError> {
    Ok(builder
        .resource(ResourceDescriptor::texture(OUTPUT, TextureFormat::Rgba8Unorm))
        .pass(pass(library)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingDevice;
    use crate::PipelineConfig;

    #[test]
    fn plasma_draws_with_fresh_uniforms() {
        let device = RecordingDevice::new();
        let library = crate::effects::library().unwrap();
        let mut pipeline = add_passes(PipelineBuilder::new(PipelineConfig::default()), &library)
            .unwrap()
            .build(device.clone())
            .unwrap();

        pipeline.run_frame(&FrameContext::new(0, 0.0, 0.0)).unwrap();
        pipeline.run_frame(&FrameContext::new(1, 0.5, 0.5)).unwrap();

        let draws = device.submissions_for(PASS_NAME);
        assert_eq!(draws.len(), 2);
        let time = |i: usize| {
            draws[i]
                .binding(FRAME_UNIFORMS)
                .and_then(|b| b.read_pod::<FrameUniforms>())
                .map(|u| u.time)
        };
        assert_eq!(time(0), Some(0.0));
        assert_eq!(time(1), Some(0.5));
        assert!(draws[1].writes(OUTPUT));
    }
}
