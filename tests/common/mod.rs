//! Shared helpers for the pipeline integration tests.

#![allow(dead_code)]

use bytemuck::{Pod, Zeroable};
use shader_pipeline::prelude::*;

pub const COMPUTE_SOURCE: &str = "@compute @workgroup_size(8, 8)\nfn cs_main() {}\n";
pub const VERTEX_SOURCE: &str = "@vertex\nfn vs_main() {}\n";
pub const FRAGMENT_SOURCE: &str = "@fragment\nfn fs_main() {}\n";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn config() -> PipelineConfig {
    PipelineConfig::default()
        .with_label("test")
        .with_surface_size(64, 64)
}

pub fn compute(name: &str) -> Pass {
    Pass::compute(name, COMPUTE_SOURCE)
}

pub fn render(name: &str) -> Pass {
    Pass::render(name, VERTEX_SOURCE, FRAGMENT_SOURCE)
}

pub fn texture(name: &str) -> ResourceDescriptor {
    ResourceDescriptor::texture(name, TextureFormat::Rgba16Float)
}

/// Uniform block holding the elapsed time
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TimeUniform {
    pub time: f32,
    pub _pad: [f32; 3],
}

/// Frame context for frame `i` at 60 fps
pub fn frame(i: u64) -> FrameContext {
    FrameContext::new(i, i as f32 / 60.0, 1.0 / 60.0)
}
