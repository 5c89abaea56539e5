//! Shader fragment composition.
//!
//! Programs are assembled from named WGSL fragments. Each [`Fragment`]
//! declares the fragments it depends on, and [`assemble`] emits the
//! reachable fragments in dependency order, each exactly once.
//!
//! # Include Syntax
//!
//! [`Fragment::parse`] turns `#include` directives into declared
//! dependencies:
//!
//! ```wgsl
//! #include "noise"
//! #include <color>
//!
//! @fragment
//! fn fs_main(@builtin(position) pos: vec4<f32>) -> @location(0) vec4<f32> {
//!     return vec4<f32>(palette(value_noise(pos.xy * 0.01)), 1.0);
//! }
//! ```
//!
//! # Example
//!
//! ```ignore
//! use shader_pipeline::shader::{assemble, Fragment, FragmentLibrary};
//!
//! let library = FragmentLibrary::standard()
//!     .with_fragment(Fragment::parse("my_effect", MY_EFFECT_WGSL))?;
//! let program = assemble("my_effect", &library)?;
//! ```

pub mod library;

use std::collections::{HashMap, HashSet};
use thiserror::Error;

pub use library::FragmentLibrary;

/// Shader assembly error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShaderError {
    #[error("Cyclic fragment dependency: {}", path.join(" -> "))]
    CyclicDependency { path: Vec<String> },
    #[error("Unresolved fragment '{name}'{}", referenced_by.as_ref().map(|r| format!(" (referenced by '{r}')")).unwrap_or_default())]
    UnresolvedFragment {
        name: String,
        referenced_by: Option<String>,
    },
    #[error("Fragment '{0}' is already defined")]
    DuplicateFragment(String),
}

/// A named, immutable block of shader source plus the fragments it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    name: String,
    text: String,
    dependencies: Vec<String>,
}

impl Fragment {
    pub fn new<I, S>(name: &str, text: &str, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            text: text.to_string(),
            dependencies: dependencies.into_iter().map(Into::into).collect(),
        }
    }

    /// Build a fragment from source, turning `#include` lines into dependencies.
    ///
    /// Directive lines are removed from the text; dependency order follows
    /// the order of the directives and repeated includes are collapsed.
    pub fn parse(name: &str, source: &str) -> Self {
        let mut dependencies: Vec<String> = Vec::new();
        let mut text = String::with_capacity(source.len());

        for line in source.lines() {
            match parse_include_directive(line.trim()) {
                Some(dep) => {
                    if !dependencies.iter().any(|d| d == dep) {
                        dependencies.push(dep.to_string());
                    }
                }
                None => {
                    text.push_str(line);
                    text.push('\n');
                }
            }
        }

        Self {
            name: name.to_string(),
            text,
            dependencies,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }
}

fn parse_include_directive(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("#include")?;
    let rest = rest.trim();
    // Support both #include "name" and #include <name>
    if let Some(inner) = rest.strip_prefix('"') {
        inner.strip_suffix('"')
    } else if let Some(inner) = rest.strip_prefix('<') {
        inner.strip_suffix('>')
    } else {
        None
    }
}

/// Lookup of fragments by name
pub trait FragmentCatalog {
    fn lookup(&self, name: &str) -> Option<&Fragment>;
}

impl FragmentCatalog for HashMap<String, Fragment> {
    fn lookup(&self, name: &str) -> Option<&Fragment> {
        self.get(name)
    }
}

impl FragmentCatalog for [Fragment] {
    fn lookup(&self, name: &str) -> Option<&Fragment> {
        self.iter().find(|f| f.name == name)
    }
}

impl FragmentCatalog for Vec<Fragment> {
    fn lookup(&self, name: &str) -> Option<&Fragment> {
        self.as_slice().lookup(name)
    }
}

struct Assembler<'c, C: ?Sized> {
    catalog: &'c C,
    emitted: HashSet<String>,
    /// Fragments currently being expanded, root first
    stack: Vec<String>,
    output: String,
}

impl<'c, C: FragmentCatalog + ?Sized> Assembler<'c, C> {
    fn new(catalog: &'c C) -> Self {
        Self {
            catalog,
            emitted: HashSet::new(),
            stack: Vec::new(),
            output: String::new(),
        }
    }

    fn visit(&mut self, name: &str, referenced_by: Option<&str>) -> Result<(), ShaderError> {
        if self.emitted.contains(name) {
            return Ok(());
        }
        if let Some(start) = self.stack.iter().position(|n| n == name) {
            let mut path = self.stack[start..].to_vec();
            path.push(name.to_string());
            return Err(ShaderError::CyclicDependency { path });
        }

        let catalog = self.catalog;
        let fragment = catalog
            .lookup(name)
            .ok_or_else(|| ShaderError::UnresolvedFragment {
                name: name.to_string(),
                referenced_by: referenced_by.map(str::to_string),
            })?;

        self.stack.push(name.to_string());
        for dep in &fragment.dependencies {
            self.visit(dep, Some(name))?;
        }
        self.stack.pop();

        if !self.output.is_empty() {
            self.output.push('\n');
        }
        self.output.push_str(fragment.text.trim_end());
        self.output.push('\n');
        self.emitted.insert(name.to_string());
        Ok(())
    }
}

/// Concatenate `entry` and everything it reaches, dependencies first.
///
/// Pure: identical inputs produce byte-identical output.
pub fn assemble<C: FragmentCatalog + ?Sized>(entry: &str, catalog: &C) -> Result<String, ShaderError> {
    assemble_all(&[entry], catalog)
}

/// Assemble several roots into one program sharing one deduplication set.
pub fn assemble_all<C: FragmentCatalog + ?Sized>(
    entries: &[&str],
    catalog: &C,
) -> Result<String, ShaderError> {
    let mut assembler = Assembler::new(catalog);
    for entry in entries {
        assembler.visit(entry, None)?;
    }
    Ok(assembler.output)
}

/// Stable 64-bit FNV-1a hash of program text, used as the compile cache key.
pub fn program_hash(text: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    text.bytes()
        .fold(OFFSET, |hash, byte| (hash ^ byte as u64).wrapping_mul(PRIME))
}
