//! Shader Pipeline - multi-pass GPU effect composition
//!
//! Effects are built from reusable WGSL fragments and a declarative list of
//! compute and render passes:
//! - **Fragments** are assembled into one program per stage, in dependency
//!   order and without duplicates
//! - **Passes** declare named inputs and outputs plus `init`/`update` hooks
//! - **Pipelines** validate pass ordering at build time and double-buffer
//!   feedback resources across frames
//! - **Frame scheduling** runs the pipeline once per tick and keeps going
//!   after per-frame failures
//!
//! The device is abstracted behind [`backend::Device`]. A headless wgpu
//! implementation is available with the `wgpu-backend` feature, and
//! [`backend::RecordingDevice`] records submissions without a GPU.
//!
//! # Example
//!
//! ```ignore
//! use shader_pipeline::prelude::*;
//!
//! let library = FragmentLibrary::standard();
//! let pipeline = PipelineBuilder::new(PipelineConfig::default())
//!     .resource(ResourceDescriptor::texture("color", TextureFormat::Rgba8Unorm))
//!     .pass(
//!         Pass::render_from("draw", "fullscreen", "my_effect", &library)?
//!             .input("frame")
//!             .output("color")
//!             .on_init(|ctx| {
//!                 ctx.declare(ResourceDescriptor::uniform_for::<FrameUniforms>("frame"))?;
//!                 Ok(())
//!             })
//!             .on_update(|ctx| ctx.write_frame_uniforms("frame")),
//!     )
//!     .build(RecordingDevice::new())?;
//!
//! let mut scheduler = FrameScheduler::fixed_rate(pipeline, SchedulerConfig::default());
//! scheduler.run();
//! ```

pub mod backend;
pub mod effects;
pub mod render_graph;
pub mod scheduler;
pub mod shader;

pub use render_graph::{
    FrameContext, FrameError, FrameReport, Pass, Pipeline, PipelineBuilder, PipelineError,
    ResourceDescriptor, ResourceRegistry,
};
pub use scheduler::{FrameScheduler, SchedulerConfig, SchedulerStats};

#[cfg(feature = "wgpu-backend")]
pub use backend::wgpu_backend::WgpuDevice;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commonly used types
pub mod prelude {
    pub use crate::backend::{Device, RecordingDevice, SamplerDescriptor, TextureFormat};
    pub use crate::render_graph::{
        FrameContext, FrameUniforms, HookError, HookResult, InitContext, InputState, Pass,
        PassHooks, Pipeline, PipelineBuilder, PipelineError, ResourceDescriptor, UpdateContext,
    };
    pub use crate::scheduler::{
        FixedRateSource, FrameScheduler, FrameSource, SchedulerConfig, SteppedSource,
    };
    pub use crate::shader::{assemble, Fragment, FragmentCatalog, FragmentLibrary};
    pub use crate::PipelineConfig;
}

/// Configuration for building a pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Name used in logs
    pub label: String,
    /// Surface width that relative texture sizes resolve against
    pub surface_width: u32,
    /// Surface height that relative texture sizes resolve against
    pub surface_height: u32,
    /// Present at display refresh rate
    pub vsync: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            label: "Shader Pipeline".to_string(),
            surface_width: 1280,
            surface_height: 720,
            vsync: true,
        }
    }
}

impl PipelineConfig {
    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn with_surface_size(mut self, width: u32, height: u32) -> Self {
        self.surface_width = width;
        self.surface_height = height;
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Scheduler settings implied by this configuration: 60 fps with vsync,
    /// unthrottled without.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default().with_target_fps(self.vsync.then_some(60.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vsync_selects_scheduler_rate() {
        let paced = PipelineConfig::default().with_vsync(true).scheduler_config();
        assert_eq!(paced.target_fps, Some(60.0));
        assert_eq!(paced.max_frames, None);

        let free = PipelineConfig::default().with_vsync(false).scheduler_config();
        assert_eq!(free.target_fps, None);
    }
}
