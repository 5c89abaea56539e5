//! Headless driver that runs one of the bundled effects for a fixed number of frames
//!
//! Run with:
//!   cargo run --example headless
//!   cargo run --example headless -- --effect trails --frames 300
//!   cargo run --example headless -- --backend wgpu --vsync
//!   cargo run --example headless -- --fps 30

use clap::Parser;
use shader_pipeline::backend::{Device, RecordingDevice};
use shader_pipeline::effects::Effect;
use shader_pipeline::scheduler::{FixedRateSource, FrameScheduler};
use shader_pipeline::PipelineConfig;

/// Device selection for the CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliBackend {
    /// Record submissions in memory, no GPU required.
    #[default]
    Recording,
    /// Headless wgpu device on the best available adapter.
    Wgpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliEffect {
    #[default]
    Plasma,
    Trails,
}

impl From<CliEffect> for Effect {
    fn from(cli: CliEffect) -> Self {
        match cli {
            CliEffect::Plasma => Effect::Plasma,
            CliEffect::Trails => Effect::Trails,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "headless", about = "Run a shader pipeline effect without a window", version)]
struct Args {
    /// Effect to run.
    #[arg(long, default_value = "plasma", value_enum)]
    effect: CliEffect,

    /// Device to run on.
    #[arg(long, default_value = "recording", value_enum)]
    backend: CliBackend,

    /// Surface width in pixels.
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Surface height in pixels.
    #[arg(long, default_value = "720")]
    height: u32,

    /// Number of frames to run.
    #[arg(long, default_value = "120")]
    frames: u64,

    /// Pace frames at the display rate.
    #[arg(long)]
    vsync: bool,

    /// Target frame rate, overriding the rate implied by --vsync; 0 runs unthrottled.
    #[arg(long)]
    fps: Option<f32>,
}

fn create_device(backend: CliBackend) -> Result<Box<dyn Device>, Box<dyn std::error::Error>> {
    match backend {
        CliBackend::Recording => Ok(Box::new(RecordingDevice::new())),
        #[cfg(feature = "wgpu-backend")]
        CliBackend::Wgpu => Ok(Box::new(shader_pipeline::WgpuDevice::new()?)),
        #[cfg(not(feature = "wgpu-backend"))]
        CliBackend::Wgpu => Err("built without the wgpu-backend feature".into()),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let effect = Effect::from(args.effect);
    log::info!(
        "shader-pipeline {}: running '{}' for {} frames",
        shader_pipeline::VERSION,
        effect.name(),
        args.frames
    );

    let config = PipelineConfig::default()
        .with_label(effect.name())
        .with_surface_size(args.width, args.height)
        .with_vsync(args.vsync);
    let mut scheduler_config = config.scheduler_config().with_max_frames(args.frames);
    if let Some(fps) = args.fps {
        scheduler_config = scheduler_config.with_target_fps((fps > 0.0).then_some(fps));
    }

    let device = create_device(args.backend)?;
    let pipeline = effect.builder(config)?.build(device)?;

    let source = FixedRateSource::new(scheduler_config.target_fps);
    let mut scheduler = FrameScheduler::new(pipeline, source, scheduler_config);

    let stats = scheduler.run();
    log::info!(
        "Ran {} frames ({} failed), {} programs compiled",
        stats.frames_run,
        stats.frames_failed,
        scheduler.pipeline().programs_compiled()
    );
    if let Some(error) = &stats.last_error {
        log::warn!("Last frame error: {}", error);
    }

    scheduler.into_pipeline().teardown()?;
    Ok(())
}
