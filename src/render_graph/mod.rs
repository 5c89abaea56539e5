//! Render Graph System
//!
//! A pipeline is an ordered list of compute and render passes that share a
//! registry of named resources. Building the pipeline runs every pass `init`
//! and validates the bindings. Each frame runs `update` and executes every
//! pass, then swaps the double-buffered feedback resources.

pub mod executor;
pub mod graph;
pub mod pass;
pub mod resource;

pub use executor::*;
pub use graph::*;
pub use pass::*;
pub use resource::*;
