//! Integration tests for pipeline build, per-frame execution and teardown.
//!
//! All tests run against `RecordingDevice`, which stamps every write with the
//! index of the submission that made it. A read binding observes the stamp of
//! the last write to the physical resource it is bound to, which is what the
//! ordering and feedback checks below rely on.

mod common;

use rstest::rstest;

use common::*;
use shader_pipeline::backend::{BindingAccess, RecordingDevice, Submission};
use shader_pipeline::prelude::*;
use shader_pipeline::render_graph::{FrameError, ResourceError, ResourceRegistry, ResourceSize};
use shader_pipeline::shader::{assemble, ShaderError};

fn stamps_of(submissions: &[Submission]) -> Vec<u64> {
    submissions.iter().map(|s| s.index).collect()
}

// ============================================================================
// Shader Assembly
// ============================================================================

fn chain() -> Vec<Fragment> {
    vec![
        Fragment::new("root", "// root", ["mid"]),
        Fragment::new("mid", "// mid", ["leaf"]),
        Fragment::new("leaf", "// leaf", Vec::<String>::new()),
    ]
}

fn diamond() -> Vec<Fragment> {
    vec![
        Fragment::new("root", "// root", ["left", "right"]),
        Fragment::new("left", "// left", ["base"]),
        Fragment::new("right", "// right", ["base"]),
        Fragment::new("base", "// base", Vec::<String>::new()),
    ]
}

fn wide() -> Vec<Fragment> {
    vec![
        Fragment::new("root", "// root", ["a", "b", "c", "a"]),
        Fragment::new("a", "// a", ["c"]),
        Fragment::new("b", "// b", ["c", "a"]),
        Fragment::new("c", "// c", Vec::<String>::new()),
    ]
}

#[rstest]
#[case::chain(chain())]
#[case::diamond(diamond())]
#[case::wide(wide())]
fn test_assembly_is_deterministic(#[case] catalog: Vec<Fragment>) {
    let first = assemble("root", &catalog).unwrap();
    let second = assemble("root", &catalog).unwrap();
    assert_eq!(first, second);

    for fragment in &catalog {
        assert_eq!(
            first.matches(fragment.text()).count(),
            1,
            "fragment '{}' must appear exactly once",
            fragment.name()
        );
    }
    assert!(first.trim_end().ends_with("// root"));
}

#[test]
fn test_cycle_names_both_fragments() {
    let catalog = vec![
        Fragment::new("A", "// a", ["B"]),
        Fragment::new("B", "// b", ["A"]),
    ];
    match assemble("A", &catalog) {
        Err(ShaderError::CyclicDependency { path }) => {
            assert!(path.contains(&"A".to_string()));
            assert!(path.contains(&"B".to_string()));
        }
        other => panic!("expected a cycle error, got {other:?}"),
    }
}

#[test]
fn test_shader_errors_fail_pass_construction() {
    fn build_pass(library: &FragmentLibrary) -> Result<Pass, PipelineError> {
        Ok(Pass::compute_from("broken", "does_not_exist", library)?)
    }

    let err = build_pass(&FragmentLibrary::standard()).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Shader(ShaderError::UnresolvedFragment { .. })
    ));
}

// ============================================================================
// Resource Registry
// ============================================================================

#[test]
fn test_duplicate_registration_keeps_first() {
    let mut device = RecordingDevice::new();
    let mut registry = ResourceRegistry::new(64, 64);

    let first = registry.register(&mut device, texture("color")).unwrap();
    let second = registry.register(&mut device, ResourceDescriptor::uniform("color", 16));

    assert_eq!(second, Err(ResourceError::DuplicateName("color".into())));
    assert_eq!(registry.resolve("color"), Ok(first));
    assert_eq!(registry.descriptor(first), &texture("color"));
}

#[test]
fn test_resolve_unknown_name() {
    let mut device = RecordingDevice::new();
    let mut registry = ResourceRegistry::new(64, 64);
    registry.register(&mut device, texture("color")).unwrap();

    assert_eq!(
        registry.resolve("missing"),
        Err(ResourceError::UnknownResource("missing".into()))
    );
}

#[test]
fn test_duplicate_registration_across_passes_fails_build() {
    init_logging();
    let result = PipelineBuilder::new(config())
        .pass(compute("a").on_init(|ctx| {
            ctx.register(texture("shared"))?;
            Ok(())
        }))
        .pass(compute("b").on_init(|ctx| {
            ctx.register(texture("shared"))?;
            Ok(())
        }))
        .build(RecordingDevice::new());

    match result {
        Err(PipelineError::Init { pass, source }) => {
            assert_eq!(pass, "b");
            assert_eq!(
                source,
                HookError::Resource(ResourceError::DuplicateName("shared".into()))
            );
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("build should fail"),
    }
}

#[test]
fn test_init_sees_resources_of_earlier_passes() {
    init_logging();
    let producer = || {
        compute("producer").on_init(|ctx| {
            ctx.register(texture("tex"))?;
            Ok(())
        })
    };
    let consumer = || {
        compute("consumer").on_init(|ctx| {
            ctx.resolve("tex")?;
            Ok(())
        })
    };

    let ordered = PipelineBuilder::new(config())
        .pass(producer())
        .pass(consumer())
        .build(RecordingDevice::new());
    assert!(ordered.is_ok());

    let reversed = PipelineBuilder::new(config())
        .pass(consumer())
        .pass(producer())
        .build(RecordingDevice::new());
    match reversed {
        Err(PipelineError::Init { pass, source }) => {
            assert_eq!(pass, "consumer");
            assert_eq!(
                source,
                HookError::Resource(ResourceError::UnknownResource("tex".into()))
            );
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("build should fail"),
    }
}

fn without_format() -> ResourceDescriptor {
    ResourceDescriptor {
        format: None,
        ..texture("t")
    }
}

fn uniform_with_format() -> ResourceDescriptor {
    ResourceDescriptor {
        format: Some(TextureFormat::Rgba8Unorm),
        ..ResourceDescriptor::uniform("u", 16)
    }
}

fn sampler_with_size() -> ResourceDescriptor {
    ResourceDescriptor {
        size: Some(ResourceSize::Bytes(16)),
        ..ResourceDescriptor::sampler("s", SamplerDescriptor::default())
    }
}

#[rstest]
#[case::texture(texture("t"), true)]
#[case::texture_absolute(texture("t").with_size(320, 240), true)]
#[case::texture_persistent(texture("t").persistent(), true)]
#[case::texture_zero_extent(texture("t").with_size(0, 4), false)]
#[case::texture_negative_scale(texture("t").with_scale(-1.0), false)]
#[case::texture_without_format(without_format(), false)]
#[case::sampler(ResourceDescriptor::sampler("s", SamplerDescriptor::nearest()), true)]
#[case::sampler_persistent(ResourceDescriptor::sampler("s", SamplerDescriptor::default()).persistent(), false)]
#[case::sampler_with_size(sampler_with_size(), false)]
#[case::uniform(ResourceDescriptor::uniform("u", 32), true)]
#[case::uniform_for(ResourceDescriptor::uniform_for::<FrameUniforms>("u"), true)]
#[case::uniform_unaligned(ResourceDescriptor::uniform("u", 20), false)]
#[case::uniform_empty(ResourceDescriptor::uniform("u", 0), false)]
#[case::uniform_with_format(uniform_with_format(), false)]
#[case::uniform_persistent(ResourceDescriptor::uniform("u", 16).persistent(), false)]
#[case::storage_persistent(ResourceDescriptor::storage("b", 1024).persistent(), true)]
#[case::storage_unaligned(ResourceDescriptor::storage("b", 6), false)]
#[case::unnamed(ResourceDescriptor::storage("", 16), false)]
fn test_descriptor_validation(#[case] descriptor: ResourceDescriptor, #[case] valid: bool) {
    let mut device = RecordingDevice::new();
    let mut registry = ResourceRegistry::new(64, 64);

    let result = registry.register(&mut device, descriptor);
    if valid {
        assert!(result.is_ok(), "expected valid, got {result:?}");
    } else {
        assert!(
            matches!(result, Err(ResourceError::InvalidDescriptor { .. })),
            "expected InvalidDescriptor, got {result:?}"
        );
        assert_eq!(device.live_resources(), 0);
    }
}

// ============================================================================
// Build Validation
// ============================================================================

#[test]
fn test_consumer_before_producer_fails_build() {
    init_logging();
    let result = PipelineBuilder::new(config())
        .resource(texture("x"))
        .resource(texture("y"))
        .pass(compute("first").output("y"))
        .pass(compute("second").input("x").output("y"))
        .pass(compute("third").output("x"))
        .build(RecordingDevice::new());

    assert!(matches!(
        result,
        Err(PipelineError::PassOrdering { ref consumer, ref producer, ref resource })
            if consumer == "second" && producer == "third" && resource == "x"
    ));

    let swapped = PipelineBuilder::new(config())
        .resource(texture("x"))
        .resource(texture("y"))
        .pass(compute("first").output("y"))
        .pass(compute("third").output("x"))
        .pass(compute("second").input("x").output("y"))
        .build(RecordingDevice::new());
    assert!(swapped.is_ok());
}

#[test]
fn test_feedback_edge_may_point_backwards() {
    let result = PipelineBuilder::new(config())
        .resource(texture("history").persistent())
        .resource(texture("color"))
        .pass(compute("blend").feedback_input("history").output("color"))
        .pass(compute("store").input("color").output("history"))
        .build(RecordingDevice::new());
    assert!(result.is_ok());
}

#[test]
fn test_unknown_binding_fails_build() {
    let result = PipelineBuilder::new(config())
        .pass(render("present").input("nowhere"))
        .build(RecordingDevice::new());
    assert!(matches!(
        result,
        Err(PipelineError::UnknownBinding { ref pass, ref resource })
            if pass == "present" && resource == "nowhere"
    ));
}

// ============================================================================
// Per-frame Execution
// ============================================================================

#[test]
fn test_feedback_reads_previous_frame() {
    init_logging();
    let device = RecordingDevice::new();
    let mut pipeline = PipelineBuilder::new(config())
        .resource(texture("out"))
        .pass(
            compute("write")
                .on_init(|ctx| {
                    ctx.allocate_persistent(texture("acc"))?;
                    Ok(())
                })
                .output("acc"),
        )
        .pass(compute("read").feedback_input("acc").output("out"))
        .build(device.clone())
        .unwrap();

    for i in 0..3 {
        let report = pipeline.run_frame(&frame(i)).unwrap();
        assert_eq!(report.resources_swapped, 1);
    }

    let writes = stamps_of(&device.submissions_for("write"));
    let reads = device.submissions_for("read");
    assert_eq!(reads.len(), 3);

    assert_eq!(reads[0].read_stamp("acc"), None);
    for frame in 1..3 {
        let observed = reads[frame].read_stamp("acc");
        assert_eq!(observed, Some(writes[frame - 1]));
        assert_ne!(observed, Some(writes[frame]));
    }
}

#[test]
fn test_seeded_state_visible_to_first_feedback_read() {
    let device = RecordingDevice::new();
    let mut pipeline = PipelineBuilder::new(config())
        .pass(
            compute("simulate")
                .on_init(|ctx| {
                    ctx.allocate_persistent(ResourceDescriptor::storage("state", 16))?;
                    ctx.write_uniform("state", &[7.0f32; 4])
                })
                .feedback_input("state")
                .output("state"),
        )
        .build(device.clone())
        .unwrap();

    pipeline.run_frame(&frame(0)).unwrap();

    let first = device.submissions_for("simulate").remove(0);
    let previous = first
        .bindings
        .iter()
        .find(|b| b.access == BindingAccess::Feedback)
        .and_then(|b| b.read_pod::<[f32; 4]>());
    assert_eq!(previous, Some([7.0; 4]));
}

#[test]
fn test_failed_frame_is_isolated() {
    init_logging();
    let device = RecordingDevice::new();
    let mut pipeline = PipelineBuilder::new(config())
        .resource(texture("state").persistent())
        .pass(compute("step").feedback_input("state").output("state"))
        .build(device.clone())
        .unwrap();

    // One dispatch per frame, so dispatch #5 belongs to frame 5.
    device.fail_dispatch_at(5);

    let results: Vec<_> = (0..8).map(|i| pipeline.run_frame(&frame(i))).collect();
    for (i, result) in results.iter().enumerate() {
        if i == 5 {
            assert!(matches!(
                result,
                Err(FrameError::Execute { pass, .. }) if pass == "step"
            ));
        } else {
            assert_eq!(result.as_ref().map(|r| r.frame_index), Ok(i as u64));
        }
    }
    assert_eq!(pipeline.frames_completed(), 7);

    // Frame 5 neither wrote nor swapped, so frame 6 still sees frame 4's output.
    let steps = device.submissions_for("step");
    assert_eq!(steps.len(), 7);
    let frame4_write = steps[4].index;
    let frame6 = &steps[5];
    assert_eq!(frame6.read_stamp("state"), Some(frame4_write));
}

#[test]
fn test_update_error_aborts_frame_only() {
    let device = RecordingDevice::new();
    let mut pipeline = PipelineBuilder::new(config())
        .resource(texture("color"))
        .pass(compute("draw").output("color").on_update(|ctx| {
            if ctx.frame().frame_index == 1 {
                return Err(HookError::Message("parameter out of range".into()));
            }
            Ok(())
        }))
        .build(device.clone())
        .unwrap();

    assert!(pipeline.run_frame(&frame(0)).is_ok());
    let err = pipeline.run_frame(&frame(1)).unwrap_err();
    assert_eq!(err.pass(), "draw");
    assert!(matches!(err, FrameError::Update { .. }));
    assert!(pipeline.run_frame(&frame(2)).is_ok());
    assert_eq!(device.dispatch_count(), 2);
}

#[test]
fn test_two_pass_end_to_end() {
    init_logging();
    let device = RecordingDevice::new();
    let pipeline = PipelineBuilder::new(config())
        .resource(texture("T"))
        .resource(ResourceDescriptor::texture("screen", TextureFormat::Rgba8Unorm))
        .pass(compute("A").output("T"))
        .pass(
            render("B")
                .input("T")
                .input("time")
                .output("screen")
                .on_init(|ctx| {
                    ctx.declare(ResourceDescriptor::uniform_for::<TimeUniform>("time"))?;
                    Ok(())
                })
                .on_update(|ctx| {
                    let time = TimeUniform {
                        time: ctx.frame().elapsed,
                        _pad: [0.0; 3],
                    };
                    ctx.write_uniform("time", &time)
                }),
        )
        .build(device.clone())
        .unwrap();

    let mut scheduler = FrameScheduler::new(
        pipeline,
        SteppedSource::new(1.0 / 60.0),
        SchedulerConfig::default().with_max_frames(10),
    );
    let stats = scheduler.run();
    assert_eq!(stats.frames_run, 10);
    assert_eq!(stats.frames_failed, 0);

    let a = device.submissions_for("A");
    let b = device.submissions_for("B");
    assert_eq!((a.len(), b.len()), (10, 10));

    let times: Vec<f32> = b
        .iter()
        .map(|s| s.binding("time").unwrap().read_pod::<TimeUniform>().unwrap().time)
        .collect();
    assert!(
        times.windows(2).all(|w| w[1] > w[0]),
        "time must strictly increase: {times:?}"
    );

    for (a, b) in a.iter().zip(&b) {
        assert!(a.index < b.index);
        assert_eq!(b.read_stamp("T"), Some(a.index));
        let t = b.binding("T").unwrap();
        assert_eq!((t.slot, t.access), (0, BindingAccess::Read));
        assert_eq!(b.binding("screen").unwrap().slot, 2);
    }
}

#[test]
fn test_scheduler_keeps_ticking_after_errors() {
    init_logging();
    let device = RecordingDevice::new();
    device.fail_draw_at(2);
    let pipeline = PipelineBuilder::new(config())
        .resource(ResourceDescriptor::texture("screen", TextureFormat::Rgba8Unorm))
        .pass(render("present").output("screen"))
        .build(device.clone())
        .unwrap();

    let mut scheduler = FrameScheduler::new(
        pipeline,
        SteppedSource::new(0.1).with_limit(5),
        SchedulerConfig::default(),
    );
    let stats = scheduler.run();

    assert_eq!(stats.frames_run, 5);
    assert_eq!(stats.frames_failed, 1);
    assert_eq!(
        stats.last_error.as_ref().map(|e| e.pass().to_string()),
        Some("present".to_string())
    );
    assert_eq!(scheduler.frame_index(), 5);
    assert_eq!(scheduler.pipeline().frames_completed(), 4);
}

// ============================================================================
// Rebuild, Resize and Teardown
// ============================================================================

#[test]
fn test_rebuild_reuses_declared_resources() {
    let device = RecordingDevice::new();
    let mut pipeline = PipelineBuilder::new(config())
        .pass(
            compute("sim")
                .on_init(|ctx| {
                    ctx.allocate_persistent(ResourceDescriptor::storage("particles", 4096))?;
                    ctx.declare(ResourceDescriptor::uniform("params", 16))?;
                    Ok(())
                })
                .feedback_input("particles")
                .input("params")
                .output("particles"),
        )
        .build(device.clone())
        .unwrap();

    let live = device.live_resources();
    pipeline.rebuild().unwrap();
    assert_eq!(device.live_resources(), live);
    assert_eq!(pipeline.registry().len(), 2);
}

#[test]
fn test_rebuild_rejects_strict_reregistration() {
    let mut pipeline = PipelineBuilder::new(config())
        .pass(compute("a").output("color").on_init(|ctx| {
            ctx.register(texture("color"))?;
            Ok(())
        }))
        .build(RecordingDevice::new())
        .unwrap();

    assert!(matches!(
        pipeline.rebuild(),
        Err(PipelineError::Init {
            source: HookError::Resource(ResourceError::DuplicateName(_)),
            ..
        })
    ));
}

#[test]
fn test_resize_recreates_relative_textures() {
    let device = RecordingDevice::new();
    let mut pipeline = PipelineBuilder::new(config())
        .resource(texture("color"))
        .resource(texture("fixed").with_size(16, 16))
        .pass(compute("fill").output("color").output("fixed"))
        .build(device.clone())
        .unwrap();
    pipeline.run_frame(&frame(0)).unwrap();

    pipeline.resize(128, 32).unwrap();
    assert_eq!(device.destroyed_while_busy(), 0);

    let registry = pipeline.registry();
    assert_eq!(registry.extent(registry.resolve("color").unwrap()), (128, 32));
    assert_eq!(registry.extent(registry.resolve("fixed").unwrap()), (16, 16));

    pipeline.run_frame(&frame(1)).unwrap();
    let last = device.submissions_for("fill").pop().unwrap();
    assert_eq!(
        last.kind,
        shader_pipeline::backend::SubmissionKind::Dispatch { workgroups: [16, 4, 1] }
    );
}

#[test]
fn test_teardown_waits_then_releases_everything() {
    init_logging();
    let device = RecordingDevice::new();
    let mut pipeline = PipelineBuilder::new(config())
        .resource(texture("history").persistent())
        .resource(ResourceDescriptor::sampler("linear", SamplerDescriptor::default()))
        .pass(compute("accumulate").feedback_input("history").output("history"))
        .pass(render("present").input("history").input("linear"))
        .build(device.clone())
        .unwrap();

    for i in 0..3 {
        pipeline.run_frame(&frame(i)).unwrap();
    }
    assert_eq!(device.live_resources(), 3);
    assert_eq!(device.live_programs(), 3);

    pipeline.teardown().unwrap();

    assert_eq!(device.live_resources(), 0);
    assert_eq!(device.live_programs(), 0);
    assert_eq!(device.destroyed().len(), 3);
    assert_eq!(device.destroyed_while_busy(), 0);
    assert_eq!(device.idle_waits(), 1);
}
