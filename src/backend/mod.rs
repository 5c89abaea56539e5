//! Backend abstraction layer
//!
//! Provides the [`Device`] trait the pipeline drives, the types shared by all
//! backends, an in-memory [`RecordingDevice`] and (behind the `wgpu-backend`
//! feature) a headless wgpu implementation.

pub mod recording;
pub mod traits;
pub mod types;
#[cfg(feature = "wgpu-backend")]
pub mod wgpu_backend;

pub use recording::{ObservedBinding, RecordingDevice, Submission, SubmissionKind};
pub use traits::*;
pub use types::*;
