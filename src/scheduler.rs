//! Frame scheduling
//!
//! [`FrameScheduler`] runs a [`Pipeline`] once per tick of a [`FrameSource`].
//! Frame errors are logged and counted; they never stop later ticks.

use std::time::{Duration, Instant};

use glam::Vec2;

use crate::backend::Device;
use crate::render_graph::{FrameContext, FrameError, FrameReport, InputState, Pipeline};

/// Timing of one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTiming {
    /// Seconds since the first tick
    pub elapsed: f32,
    /// Seconds since the previous tick
    pub delta: f32,
}

/// Source of frame ticks. `next_frame` is the scheduler's only suspension
/// point; returning `None` ends the run.
pub trait FrameSource {
    fn next_frame(&mut self) -> Option<FrameTiming>;
}

/// Wall-clock ticks, sleeping to hold a target rate.
pub struct FixedRateSource {
    interval: Option<Duration>,
    start: Option<Instant>,
    last: Option<Instant>,
}

impl FixedRateSource {
    /// `None` ticks as fast as the caller asks, as does a rate too small to
    /// express as an interval.
    pub fn new(target_fps: Option<f32>) -> Self {
        Self {
            interval: target_fps
                .filter(|fps| *fps > 0.0)
                .and_then(|fps| Duration::try_from_secs_f32(1.0 / fps).ok()),
            start: None,
            last: None,
        }
    }
}

impl FrameSource for FixedRateSource {
    fn next_frame(&mut self) -> Option<FrameTiming> {
        if let (Some(last), Some(interval)) = (self.last, self.interval) {
            let due = last + interval;
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }

        let now = Instant::now();
        let start = *self.start.get_or_insert(now);
        let delta = self
            .last
            .map(|last| now.duration_since(last).as_secs_f32())
            .unwrap_or(0.0);
        self.last = Some(now);

        Some(FrameTiming {
            elapsed: now.duration_since(start).as_secs_f32(),
            delta,
        })
    }
}

/// Deterministic ticks with a fixed delta, for tests and offline rendering.
pub struct SteppedSource {
    delta: f32,
    frames: u64,
    limit: Option<u64>,
}

impl SteppedSource {
    pub fn new(delta: f32) -> Self {
        Self {
            delta,
            frames: 0,
            limit: None,
        }
    }

    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }
}

impl FrameSource for SteppedSource {
    fn next_frame(&mut self) -> Option<FrameTiming> {
        if self.limit.is_some_and(|limit| self.frames >= limit) {
            return None;
        }
        let timing = FrameTiming {
            elapsed: self.frames as f32 * self.delta,
            delta: if self.frames == 0 { 0.0 } else { self.delta },
        };
        self.frames += 1;
        Some(timing)
    }
}

/// Configuration for the frame scheduler
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Frames per second for [`FixedRateSource`]; `None` is unthrottled
    pub target_fps: Option<f32>,
    /// Stop after this many ticks
    pub max_frames: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            target_fps: Some(60.0),
            max_frames: None,
        }
    }
}

impl SchedulerConfig {
    pub fn with_target_fps(mut self, fps: Option<f32>) -> Self {
        self.target_fps = fps;
        self
    }

    pub fn with_max_frames(mut self, frames: u64) -> Self {
        self.max_frames = Some(frames);
        self
    }
}

/// Counters kept across ticks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStats {
    pub frames_run: u64,
    pub frames_failed: u64,
    pub last_error: Option<FrameError>,
}

/// Drives a pipeline one frame per tick.
pub struct FrameScheduler<D: Device, S: FrameSource = FixedRateSource> {
    pipeline: Pipeline<D>,
    source: S,
    config: SchedulerConfig,
    input: InputState,
    frame_index: u64,
    stats: SchedulerStats,
}

impl<D: Device> FrameScheduler<D, FixedRateSource> {
    /// Scheduler ticking at `config.target_fps` on the wall clock
    pub fn fixed_rate(pipeline: Pipeline<D>, config: SchedulerConfig) -> Self {
        let source = FixedRateSource::new(config.target_fps);
        Self::new(pipeline, source, config)
    }
}

impl<D: Device, S: FrameSource> FrameScheduler<D, S> {
    pub fn new(pipeline: Pipeline<D>, source: S, config: SchedulerConfig) -> Self {
        Self {
            pipeline,
            source,
            config,
            input: InputState::default(),
            frame_index: 0,
            stats: SchedulerStats::default(),
        }
    }

    /// Host-side input, sampled into every following frame
    pub fn input_mut(&mut self) -> &mut InputState {
        &mut self.input
    }

    pub fn pipeline(&self) -> &Pipeline<D> {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut Pipeline<D> {
        &mut self.pipeline
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Index the next tick will use
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Run one frame. Returns `None` once the source or `max_frames` is exhausted.
    ///
    /// The frame index advances whether or not the frame succeeds.
    pub fn tick(&mut self) -> Option<Result<FrameReport, FrameError>> {
        if self
            .config
            .max_frames
            .is_some_and(|max| self.frame_index >= max)
        {
            return None;
        }
        let timing = self.source.next_frame()?;

        let config = self.pipeline.config();
        let mut input = self.input;
        input.resolution = Vec2::new(config.surface_width as f32, config.surface_height as f32);
        let frame = FrameContext {
            frame_index: self.frame_index,
            elapsed: timing.elapsed,
            delta: timing.delta,
            input,
        };

        let result = self.pipeline.run_frame(&frame);
        self.frame_index += 1;
        self.stats.frames_run += 1;
        if let Err(e) = &result {
            log::warn!("Frame {} failed: {}", frame.frame_index, e);
            self.stats.frames_failed += 1;
            self.stats.last_error = Some(e.clone());
        }
        Some(result)
    }

    /// Tick until the source or `max_frames` runs out.
    pub fn run(&mut self) -> SchedulerStats {
        log::info!("Scheduler starting at frame {}", self.frame_index);
        while self.tick().is_some() {}
        log::info!(
            "Scheduler stopped: {} frames run, {} failed",
            self.stats.frames_run,
            self.stats.frames_failed
        );
        self.stats.clone()
    }

    pub fn into_pipeline(self) -> Pipeline<D> {
        self.pipeline
    }
}
