//! Example render definitions
//!
//! Each effect registers its WGSL fragments on top of the standard library
//! and contributes passes to a [`PipelineBuilder`]:
//! 1. [`plasma`] - single render pass, domain-warped fbm through a palette
//! 2. [`trails`] - compute pass accumulating into a feedback texture, then a present pass

pub mod plasma;
pub mod trails;

pub use plasma::PlasmaHooks;
pub use trails::TrailHooks;

use crate::render_graph::{PipelineBuilder, PipelineError};
use crate::shader::{Fragment, FragmentLibrary, ShaderError};
use crate::PipelineConfig;

const PLASMA_FRAGMENT: &str = include_str!("../../shaders/effects/plasma.wgsl");
const TRAIL_UPDATE_FRAGMENT: &str = include_str!("../../shaders/effects/trail_update.wgsl");
const TRAIL_PRESENT_FRAGMENT: &str = include_str!("../../shaders/effects/trail_present.wgsl");

/// Standard library plus the fragments of every effect
pub fn library() -> Result<FragmentLibrary, ShaderError> {
    FragmentLibrary::standard()
        .with_fragment(Fragment::parse("plasma", PLASMA_FRAGMENT))?
        .with_fragment(Fragment::parse("trail_update", TRAIL_UPDATE_FRAGMENT))?
        .with_fragment(Fragment::parse("trail_present", TRAIL_PRESENT_FRAGMENT))
}

/// Effects selectable by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Plasma,
    Trails,
}

impl Effect {
    pub const ALL: [Effect; 2] = [Effect::Plasma, Effect::Trails];

    pub fn name(&self) -> &'static str {
        match self {
            Effect::Plasma => "plasma",
            Effect::Trails => "trails",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.name() == name)
    }

    /// Builder holding every pass of the effect
    pub fn builder(&self, config: PipelineConfig) -> Result<PipelineBuilder, PipelineError> {
        let library = library()?;
        let builder = PipelineBuilder::new(config);
        match self {
            Effect::Plasma => plasma::add_passes(builder, &library),
            Effect::Trails => trails::add_passes(builder, &library, TrailHooks::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::assemble;

    #[test]
    fn effect_fragments_assemble() {
        let library = library().unwrap();
        for entry in ["plasma", "trail_update", "trail_present"] {
            let program = assemble(entry, &library).unwrap();
            assert!(!program.contains("#include"));
        }
    }

    #[test]
    fn effects_resolve_by_name() {
        assert_eq!(Effect::from_name("trails"), Some(Effect::Trails));
        assert_eq!(Effect::from_name("nope"), None);
    }
}
