//! Acquisition loop: open, read, transform, classify, fan out, shut down.
//!
//! Startup acquires the source and then every sink in dispatch order.
//! Teardown releases sinks in reverse order and closes the source last.
//! Each release happens exactly once on every exit path.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::classify::{InferenceEngine, InferenceResult};
use crate::error::{
    ClassifyError, PipelineError, ShapeMismatchError, EXIT_CLEAN, EXIT_SOURCE_LOST,
};
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::sink::{FrameSink, SinkOutcome};
use crate::transform::{self, PreprocessingProfile};

const SHUTDOWN_POLL: Duration = Duration::from_millis(25);

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StopReason {
    /// SIGINT/SIGTERM.
    Interrupt = 1,
    /// A sink asked to stop (display quit key or closed window).
    QuitRequested = 2,
}

impl StopReason {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(StopReason::Interrupt),
            2 => Some(StopReason::QuitRequested),
            _ => None,
        }
    }
}

/// Cloneable stop flag. The first recorded reason wins.
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken(Arc<AtomicU8>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, reason: StopReason) {
        let _ = self
            .0
            .compare_exchange(0, reason as u8, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst) != 0
    }

    pub fn reason(&self) -> Option<StopReason> {
        StopReason::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Sleeps for `duration` unless a stop is requested first. Returns
    /// `false` when the sleep was cut short.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SHUTDOWN_POLL.min(deadline - now));
        }
    }

    /// Routes SIGINT/SIGTERM to this token. Can be installed once per process.
    pub fn install_interrupt_handler(&self) -> Result<()> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            log::info!("interrupt received, shutting down");
            token.request(StopReason::Interrupt);
        })
        .context("failed to install interrupt handler")
    }
}

/// How mid-stream read failures are retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive reopen attempts before the source is declared lost. The
    /// count resets after a frame is read successfully.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Stopped(StopReason),
    /// Reads kept failing after `attempts` reopen attempts.
    SourceLost { attempts: u32 },
}

#[derive(Clone, Debug, Default)]
struct Counters {
    frames_read: u64,
    frames_skipped: u64,
    sink_failures: u64,
    reconnects: u64,
}

/// Summary of a finished run.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub frames_read: u64,
    pub frames_skipped: u64,
    pub sink_failures: u64,
    pub reconnects: u64,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.frames_read as f64 / secs
        } else {
            0.0
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunOutcome::Stopped(_) => EXIT_CLEAN,
            RunOutcome::SourceLost { .. } => EXIT_SOURCE_LOST,
        }
    }
}

pub struct LifecycleController<S: FrameSource> {
    source: S,
    sinks: Vec<Box<dyn FrameSink>>,
    engine: Option<InferenceEngine>,
    profile: PreprocessingProfile,
    policy: ReconnectPolicy,
    shutdown: ShutdownToken,
}

impl<S: FrameSource> LifecycleController<S> {
    pub fn new(source: S, shutdown: ShutdownToken) -> Self {
        Self {
            source,
            sinks: Vec::new(),
            engine: None,
            profile: PreprocessingProfile::default(),
            policy: ReconnectPolicy::default(),
            shutdown,
        }
    }

    /// Adds a sink. Sinks are kept in dispatch order regardless of the order
    /// they are added in.
    pub fn with_sink(mut self, sink: Box<dyn FrameSink>) -> Self {
        self.sinks.push(sink);
        self.sinks.sort_by_key(|sink| sink.kind());
        self
    }

    /// Classifies every frame with `engine`, using the engine's profile.
    pub fn with_engine(mut self, engine: InferenceEngine) -> Self {
        self.profile = engine.profile().clone();
        self.engine = Some(engine);
        self
    }

    /// Overrides the preprocessing profile. A profile that disagrees with the
    /// engine surfaces as a shape mismatch on the first frame.
    pub fn with_profile(mut self, profile: PreprocessingProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Runs until interrupted, asked to quit, or the source is lost.
    pub fn run(mut self) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        let url = self.source.url().to_string();

        if let Err(e) = self.source.open() {
            log::error!("LifecycleController: cannot open source {}: {}", url, e);
            self.source.close();
            return Err(e.into());
        }

        for index in 0..self.sinks.len() {
            if let Err(e) = self.sinks[index].acquire() {
                let name = self.sinks[index].name();
                log::error!("LifecycleController: sink {} failed to start: {}", name, e);
                self.release(index);
                return Err(PipelineError::SinkStart { name, source: e });
            }
        }
        log::info!(
            "LifecycleController: streaming from {} to {} sink(s){}",
            url,
            self.sinks.len(),
            if self.engine.is_some() {
                " with classification"
            } else {
                ""
            }
        );

        let mut counters = Counters::default();
        let outcome = self.pump(&mut counters);
        let acquired = self.sinks.len();
        self.release(acquired);

        let outcome = outcome?;
        let report = RunReport {
            outcome,
            frames_read: counters.frames_read,
            frames_skipped: counters.frames_skipped,
            sink_failures: counters.sink_failures,
            reconnects: counters.reconnects,
            elapsed: started.elapsed(),
        };
        log::info!(
            "LifecycleController: {:?} after {} frame(s) in {:.1?} ({:.1} fps), {} skipped, {} sink failure(s), {} reconnect(s)",
            report.outcome,
            report.frames_read,
            report.elapsed,
            report.fps(),
            report.frames_skipped,
            report.sink_failures,
            report.reconnects
        );
        Ok(report)
    }

    fn pump(&mut self, counters: &mut Counters) -> Result<RunOutcome, PipelineError> {
        let mut failed_attempts = 0u32;
        loop {
            if let Some(reason) = self.shutdown.reason() {
                return Ok(RunOutcome::Stopped(reason));
            }

            let frame = match self.source.next_frame() {
                Ok(frame) => {
                    failed_attempts = 0;
                    frame
                }
                Err(e) if e.is_frame_local() => {
                    log::warn!("LifecycleController: skipping unreadable frame: {}", e);
                    counters.frames_skipped += 1;
                    continue;
                }
                Err(e) => {
                    log::warn!("LifecycleController: read from {} failed: {}", self.source.url(), e);
                    if failed_attempts >= self.policy.max_attempts {
                        log::error!(
                            "LifecycleController: source {} lost after {} reconnect attempt(s)",
                            self.source.url(),
                            failed_attempts
                        );
                        return Ok(RunOutcome::SourceLost {
                            attempts: failed_attempts,
                        });
                    }
                    failed_attempts += 1;
                    counters.reconnects += 1;
                    if !self.shutdown.sleep(self.policy.delay) {
                        continue;
                    }
                    log::info!(
                        "LifecycleController: reconnecting to {} (attempt {}/{})",
                        self.source.url(),
                        failed_attempts,
                        self.policy.max_attempts
                    );
                    if let Err(e) = self.source.open() {
                        log::warn!("LifecycleController: reconnect failed: {}", e);
                    }
                    continue;
                }
            };
            counters.frames_read += 1;

            if let Err(e) = frame.validate() {
                log::warn!("LifecycleController: skipping frame {}: {}", frame.sequence(), e);
                counters.frames_skipped += 1;
                continue;
            }

            let result = match self.classify(&frame)? {
                Classified::Ready(result) => result,
                Classified::Skip => {
                    counters.frames_skipped += 1;
                    continue;
                }
            };

            self.dispatch(&frame, result.as_ref(), counters);
        }
    }

    /// Runs transform and classification when an engine is configured. Only
    /// a shape mismatch is fatal.
    fn classify(&mut self, frame: &Frame) -> Result<Classified, ShapeMismatchError> {
        let Some(engine) = self.engine.as_mut() else {
            return Ok(Classified::Ready(None));
        };
        let tensor = match transform::apply(frame, &self.profile) {
            Ok(tensor) => tensor,
            Err(e) => {
                log::warn!("LifecycleController: skipping frame {}: {}", frame.sequence(), e);
                return Ok(Classified::Skip);
            }
        };
        match engine.classify(&tensor) {
            Ok(result) => {
                log::debug!(
                    "frame {}: {} ({:.1?} after capture)",
                    frame.sequence(),
                    result,
                    frame.captured_at().elapsed().unwrap_or_default()
                );
                Ok(Classified::Ready(Some(result)))
            }
            Err(ClassifyError::ShapeMismatch(mismatch)) => {
                log::error!("LifecycleController: {}", mismatch);
                Err(mismatch)
            }
            Err(e) => {
                log::warn!("LifecycleController: frame {} not classified: {}", frame.sequence(), e);
                Ok(Classified::Ready(None))
            }
        }
    }

    fn dispatch(&mut self, frame: &Frame, result: Option<&InferenceResult>, counters: &mut Counters) {
        for sink in self.sinks.iter_mut() {
            match sink.consume(frame, result) {
                Ok(SinkOutcome::Delivered) => {}
                Ok(SinkOutcome::Skipped(reason)) => {
                    log::debug!("{} sink skipped frame {}: {}", sink.name(), frame.sequence(), reason);
                }
                Err(e) => {
                    counters.sink_failures += 1;
                    log::warn!("{} sink failed on frame {}: {}", sink.name(), frame.sequence(), e);
                }
            }
        }
    }

    /// Releases the first `acquired` sinks in reverse order, then closes the
    /// source.
    fn release(&mut self, acquired: usize) {
        for sink in self.sinks[..acquired].iter_mut().rev() {
            sink.release();
        }
        self.source.close();
    }
}

enum Classified {
    Ready(Option<InferenceResult>),
    Skip,
}
