//! Pipeline definition, build and validation

use crate::backend::traits::*;
use crate::render_graph::executor::ProgramCache;
use crate::render_graph::pass::*;
use crate::render_graph::resource::*;
use crate::shader::ShaderError;
use crate::PipelineConfig;
use std::collections::HashSet;
use thiserror::Error;

/// Build-time pipeline error. Fatal: no frame runs on a pipeline that failed to build.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Shader(#[from] ShaderError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("Pass '{pass}' binds unknown resource '{resource}'")]
    UnknownBinding { pass: String, resource: String },
    #[error("Pass '{pass}' cannot bind '{resource}': {reason}")]
    InvalidBinding {
        pass: String,
        resource: String,
        reason: String,
    },
    #[error("Pass '{consumer}' reads '{resource}' before pass '{producer}' writes it")]
    PassOrdering {
        consumer: String,
        producer: String,
        resource: String,
    },
    #[error("Pass '{pass}' reads its own output '{resource}' without marking it as feedback")]
    SelfDependency { pass: String, resource: String },
    #[error("Pass '{pass}' reads '{resource}' as feedback but the resource is not persistent")]
    FeedbackNotPersistent { pass: String, resource: String },
    #[error("Pass name '{0}' is used more than once")]
    DuplicatePassName(String),
    #[error("Pipeline has no passes")]
    EmptyPipeline,
    #[error("Init of pass '{pass}' failed: {source}")]
    Init {
        pass: String,
        #[source]
        source: HookError,
    },
}

/// Fluent builder for a [`Pipeline`]
pub struct PipelineBuilder {
    config: PipelineConfig,
    resources: Vec<ResourceDescriptor>,
    passes: Vec<Pass>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            resources: Vec::new(),
            passes: Vec::new(),
        }
    }

    /// Declare a shared resource. Registered before any pass `init` runs.
    pub fn resource(mut self, descriptor: ResourceDescriptor) -> Self {
        self.resources.push(descriptor);
        self
    }

    /// Append a pass; passes execute in the order they are added.
    pub fn pass(mut self, pass: Pass) -> Self {
        self.passes.push(pass);
        self
    }

    /// Build the pipeline: register resources, run every `init` in order, validate.
    pub fn build<D: Device>(self, device: D) -> Result<Pipeline<D>, PipelineError> {
        if self.passes.is_empty() {
            return Err(PipelineError::EmptyPipeline);
        }
        let mut names = HashSet::new();
        for pass in &self.passes {
            if !names.insert(pass.name()) {
                return Err(PipelineError::DuplicatePassName(pass.name().to_string()));
            }
        }

        let mut pipeline = Pipeline {
            registry: ResourceRegistry::new(self.config.surface_width, self.config.surface_height),
            config: self.config,
            device,
            resources: self.resources,
            passes: self.passes,
            programs: ProgramCache::default(),
            frames_completed: 0,
            released: false,
        };

        // On failure, dropping the half-built pipeline releases what was created.
        pipeline.initialize()?;

        log::info!(
            "Built pipeline '{}' on {}: {} passes, {} resources",
            pipeline.config.label,
            pipeline.device.name(),
            pipeline.passes.len(),
            pipeline.registry.len()
        );
        Ok(pipeline)
    }
}

/// An ordered sequence of passes plus the registry backing their bindings.
pub struct Pipeline<D: Device> {
    pub(crate) config: PipelineConfig,
    pub(crate) device: D,
    pub(crate) registry: ResourceRegistry,
    /// Builder-declared resources, re-registered on resize
    pub(crate) resources: Vec<ResourceDescriptor>,
    pub(crate) passes: Vec<Pass>,
    pub(crate) programs: ProgramCache,
    pub(crate) frames_completed: u64,
    pub(crate) released: bool,
}

impl<D: Device> Pipeline<D> {
    pub(crate) fn initialize(&mut self) -> Result<(), PipelineError> {
        for descriptor in &self.resources {
            self.registry.register(&mut self.device, descriptor.clone())?;
        }
        self.run_init()?;
        validate(&self.passes, &self.registry)
    }

    pub(crate) fn run_init(&mut self) -> Result<(), PipelineError> {
        for pass in &mut self.passes {
            log::debug!("Initializing pass '{}'", pass.name());
            pass.run_init(&mut self.registry, &mut self.device)
                .map_err(|source| PipelineError::Init {
                    pass: pass.name().to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn passes(&self) -> &[Pass] {
        &self.passes
    }

    pub fn pass(&self, name: &str) -> Option<&Pass> {
        self.passes.iter().find(|p| p.name() == name)
    }

    /// Frames that ran every pass and swapped
    pub fn frames_completed(&self) -> u64 {
        self.frames_completed
    }

    /// Programs compiled so far
    pub fn programs_compiled(&self) -> usize {
        self.programs.len()
    }
}

/// Check every binding of `passes` against `registry`.
///
/// Every name must resolve, and every non-feedback input produced by another
/// pass must be produced by an earlier one. Feedback inputs must name
/// persistent resources.
pub fn validate(passes: &[Pass], registry: &ResourceRegistry) -> Result<(), PipelineError> {
    for (index, pass) in passes.iter().enumerate() {
        let unknown = |resource: &str| PipelineError::UnknownBinding {
            pass: pass.name().to_string(),
            resource: resource.to_string(),
        };

        for input in pass.inputs() {
            let handle = registry.resolve(&input.name).map_err(|_| unknown(&input.name))?;

            if input.feedback {
                if !registry.descriptor(handle).persistent {
                    return Err(PipelineError::FeedbackNotPersistent {
                        pass: pass.name().to_string(),
                        resource: input.name.clone(),
                    });
                }
                continue;
            }

            if pass.writes(&input.name) {
                return Err(PipelineError::SelfDependency {
                    pass: pass.name().to_string(),
                    resource: input.name.clone(),
                });
            }
            if let Some(producer) = passes[index + 1..].iter().find(|p| p.writes(&input.name)) {
                return Err(PipelineError::PassOrdering {
                    consumer: pass.name().to_string(),
                    producer: producer.name().to_string(),
                    resource: input.name.clone(),
                });
            }
        }

        for output in pass.outputs() {
            let handle = registry.resolve(output).map_err(|_| unknown(output))?;
            let descriptor = registry.descriptor(handle);
            let invalid = |reason: String| PipelineError::InvalidBinding {
                pass: pass.name().to_string(),
                resource: output.clone(),
                reason,
            };

            if !descriptor.kind.is_writable() {
                return Err(invalid(format!("{:?} cannot be written", descriptor.kind)));
            }
            if pass.kind() == PassKind::Compute && descriptor.kind == ResourceKind::Texture2d {
                match descriptor.format {
                    Some(format) if format.supports_storage() => {}
                    format => {
                        return Err(invalid(format!(
                            "{format:?} cannot be written as a storage texture"
                        )))
                    }
                }
            }
            if pass.kind() == PassKind::Render
                && descriptor.format.is_some_and(|f| f.is_depth())
            {
                return Err(invalid("depth textures cannot be color targets".into()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{RecordingDevice, TextureFormat};

    fn registry_with(descriptors: &[ResourceDescriptor]) -> ResourceRegistry {
        let mut device = RecordingDevice::new();
        let mut registry = ResourceRegistry::new(64, 64);
        for descriptor in descriptors {
            registry.register(&mut device, descriptor.clone()).unwrap();
        }
        registry
    }

    fn compute(name: &str) -> Pass {
        Pass::compute(name, "fn cs_main() {}")
    }

    #[test]
    fn unknown_binding_names_pass_and_resource() {
        let registry = registry_with(&[]);
        let passes = [compute("blur").input("missing")];
        assert_eq!(
            validate(&passes, &registry),
            Err(PipelineError::UnknownBinding {
                pass: "blur".into(),
                resource: "missing".into(),
            })
        );
    }

    #[test]
    fn self_read_requires_feedback() {
        let registry = registry_with(&[
            ResourceDescriptor::texture("acc", TextureFormat::Rgba16Float).persistent()
        ]);

        let plain = [compute("accumulate").input("acc").output("acc")];
        assert!(matches!(
            validate(&plain, &registry),
            Err(PipelineError::SelfDependency { .. })
        ));

        let feedback = [compute("accumulate").feedback_input("acc").output("acc")];
        assert_eq!(validate(&feedback, &registry), Ok(()));
    }

    #[test]
    fn feedback_needs_persistent_resource() {
        let registry = registry_with(&[ResourceDescriptor::texture(
            "color",
            TextureFormat::Rgba16Float,
        )]);
        let passes = [compute("a").feedback_input("color").output("color")];
        assert!(matches!(
            validate(&passes, &registry),
            Err(PipelineError::FeedbackNotPersistent { .. })
        ));
    }

    #[test]
    fn outputs_must_be_writable() {
        let registry = registry_with(&[
            ResourceDescriptor::uniform("params", 16),
            ResourceDescriptor::texture("srgb", TextureFormat::Rgba8UnormSrgb),
        ]);

        assert!(matches!(
            validate(&[compute("a").output("params")], &registry),
            Err(PipelineError::InvalidBinding { .. })
        ));
        assert!(matches!(
            validate(&[compute("a").output("srgb")], &registry),
            Err(PipelineError::InvalidBinding { .. })
        ));
        let render = Pass::render("present", "fn vs_main() {}", "fn fs_main() {}").output("srgb");
        assert_eq!(validate(&[render], &registry), Ok(()));
    }

    #[test]
    fn empty_and_duplicate_passes_rejected() {
        let empty = PipelineBuilder::new(PipelineConfig::default()).build(RecordingDevice::new());
        assert!(matches!(empty, Err(PipelineError::EmptyPipeline)));

        let duplicate = PipelineBuilder::new(PipelineConfig::default())
            .pass(compute("a"))
            .pass(compute("a"))
            .build(RecordingDevice::new());
        assert!(matches!(
            duplicate,
            Err(PipelineError::DuplicatePassName(name)) if name == "a"
        ));
    }

    #[test]
    fn failed_build_releases_resources() {
        let device = RecordingDevice::new();
        let result = PipelineBuilder::new(PipelineConfig::default())
            .resource(ResourceDescriptor::uniform("params", 16))
            .pass(compute("a").input("missing"))
            .build(device.clone());

        assert!(result.is_err());
        assert_eq!(device.live_resources(), 0);
    }
}
