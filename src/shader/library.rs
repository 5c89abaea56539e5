//! Built-in shader fragments.
//!
//! The fragments are stored as `.wgsl` files in `shaders/library/` and use
//! `#include` directives to declare their dependencies.
//!
//! | Name | Provides | Depends on |
//! |------|----------|------------|
//! | `math` | `PI`, `TAU`, `saturate`, `remap`, `rotate2d` | |
//! | `hash` | `hash21`, `hash22` | |
//! | `noise` | `value_noise` | `hash` |
//! | `fbm` | `fbm` | `math`, `noise` |
//! | `color` | `palette`, `luminance`, `linear_to_srgb` | `math` |
//! | `fullscreen` | `vs_main` fullscreen triangle, `FullscreenOutput` | |
//! | `frame_uniforms` | `FrameUniforms` struct | |

use std::collections::HashMap;

use super::{Fragment, FragmentCatalog, ShaderError};

const MATH_FRAGMENT: &str = include_str!("../../shaders/library/math.wgsl");
const HASH_FRAGMENT: &str = include_str!("../../shaders/library/hash.wgsl");
const NOISE_FRAGMENT: &str = include_str!("../../shaders/library/noise.wgsl");
const FBM_FRAGMENT: &str = include_str!("../../shaders/library/fbm.wgsl");
const COLOR_FRAGMENT: &str = include_str!("../../shaders/library/color.wgsl");
const FULLSCREEN_FRAGMENT: &str = include_str!("../../shaders/library/fullscreen.wgsl");
const FRAME_UNIFORMS_FRAGMENT: &str = include_str!("../../shaders/library/frame_uniforms.wgsl");

/// Source of every built-in fragment, by name
pub const STANDARD_FRAGMENTS: &[(&str, &str)] = &[
    ("math", MATH_FRAGMENT),
    ("hash", HASH_FRAGMENT),
    ("noise", NOISE_FRAGMENT),
    ("fbm", FBM_FRAGMENT),
    ("color", COLOR_FRAGMENT),
    ("fullscreen", FULLSCREEN_FRAGMENT),
    ("frame_uniforms", FRAME_UNIFORMS_FRAGMENT),
];

/// Collection of fragments that can be assembled into programs.
#[derive(Debug, Clone, Default)]
pub struct FragmentLibrary {
    fragments: HashMap<String, Fragment>,
}

impl FragmentLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Library with every built-in fragment registered.
    pub fn standard() -> Self {
        let fragments = STANDARD_FRAGMENTS
            .iter()
            .map(|(name, source)| (name.to_string(), Fragment::parse(name, source)))
            .collect();
        Self { fragments }
    }

    /// Add a fragment; names are unique.
    pub fn register(&mut self, fragment: Fragment) -> Result<(), ShaderError> {
        if self.fragments.contains_key(fragment.name()) {
            return Err(ShaderError::DuplicateFragment(fragment.name().to_string()));
        }
        self.fragments.insert(fragment.name().to_string(), fragment);
        Ok(())
    }

    pub fn with_fragment(mut self, fragment: Fragment) -> Result<Self, ShaderError> {
        self.register(fragment)?;
        Ok(self)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fragments.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

impl FragmentCatalog for FragmentLibrary {
    fn lookup(&self, name: &str) -> Option<&Fragment> {
        self.fragments.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::assemble;

    #[test]
    fn standard_library_resolves() {
        let library = FragmentLibrary::standard();
        for (name, _) in STANDARD_FRAGMENTS {
            assemble(name, &library).unwrap();
        }
    }

    #[test]
    fn fbm_pulls_dependencies_once() {
        let library = FragmentLibrary::standard();
        let program = assemble("fbm", &library).unwrap();

        assert_eq!(program.matches("fn hash21").count(), 1);
        assert_eq!(program.matches("const PI").count(), 1);
        assert!(!program.contains("#include"));
        assert!(program.find("fn hash21").unwrap() < program.find("fn value_noise").unwrap());
        assert!(program.find("fn value_noise").unwrap() < program.find("fn fbm").unwrap());
    }

    #[test]
    fn duplicate_fragment_rejected() {
        let err = FragmentLibrary::standard()
            .with_fragment(Fragment::new("math", "", Vec::<String>::new()))
            .unwrap_err();
        assert_eq!(err, ShaderError::DuplicateFragment("math".into()));
    }
}
