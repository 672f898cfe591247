use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use framepipe::classify::FixedScoresBackend;
use framepipe::error::{EXIT_SHAPE_MISMATCH, EXIT_SOURCE_LOST, EXIT_SOURCE_UNREACHABLE};
use framepipe::{
    ConnectError, ConnectionState, Frame, FrameSink, FrameSource, InferenceEngine,
    InferenceResult, LifecycleController, ModelMetadata, PipelineError, PreprocessingProfile,
    ReadError, ReconnectPolicy, RunOutcome, ShutdownToken, SinkError, SinkKind, SinkOutcome,
    SourceConfig, StopReason, StreamSource,
};

type EventLog = Arc<Mutex<Vec<String>>>;

fn events(log: &EventLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn count(log: &EventLog, event: &str) -> usize {
    log.lock().unwrap().iter().filter(|e| *e == event).count()
}

/// Scripted source: `None` entries are read failures.
struct ScriptedSource {
    script: Vec<Option<Frame>>,
    log: EventLog,
    state: ConnectionState,
}

impl ScriptedSource {
    fn new(mut script: Vec<Option<Frame>>, log: EventLog) -> Self {
        script.reverse();
        Self {
            script,
            log,
            state: ConnectionState::Disconnected,
        }
    }
}

fn good_frame() -> Option<Frame> {
    Some(Frame::rgb(vec![90; 32 * 24 * 3], 32, 24))
}

impl FrameSource for ScriptedSource {
    fn open(&mut self) -> Result<(), ConnectError> {
        self.log.lock().unwrap().push("source.open".into());
        self.state = ConnectionState::Streaming;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame, ReadError> {
        match self.script.pop() {
            Some(Some(frame)) => Ok(frame),
            Some(None) => {
                self.state = ConnectionState::Failed;
                Err(ReadError::Transport("scripted failure".into()))
            }
            None => {
                self.state = ConnectionState::Failed;
                Err(ReadError::EndOfStream)
            }
        }
    }

    fn close(&mut self) {
        self.log.lock().unwrap().push("source.close".into());
        self.state = ConnectionState::Closed;
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn url(&self) -> &str {
        "scripted://test"
    }
}

/// Sink that records every call. It can request a stop after `stop_after`
/// frames, fail every `consume`, or refuse to start.
struct RecordingSink {
    name: &'static str,
    kind: SinkKind,
    log: EventLog,
    seen: usize,
    stop_after: Option<(usize, ShutdownToken, StopReason)>,
    fail_consume: bool,
    fail_acquire: bool,
    results: Arc<Mutex<Vec<Option<InferenceResult>>>>,
}

impl RecordingSink {
    fn new(name: &'static str, kind: SinkKind, log: &EventLog) -> Self {
        Self {
            name,
            kind,
            log: Arc::clone(log),
            seen: 0,
            stop_after: None,
            fail_consume: false,
            fail_acquire: false,
            results: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn stopping_after(mut self, frames: usize, token: &ShutdownToken, reason: StopReason) -> Self {
        self.stop_after = Some((frames, token.clone(), reason));
        self
    }

    fn push(&self, event: &str) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}.{}", self.name, event));
    }
}

impl FrameSink for RecordingSink {
    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> SinkKind {
        self.kind
    }

    fn acquire(&mut self) -> Result<(), SinkError> {
        self.push("acquire");
        if self.fail_acquire {
            return Err(SinkError::Display("no screen".into()));
        }
        Ok(())
    }

    fn consume(
        &mut self,
        _frame: &Frame,
        result: Option<&InferenceResult>,
    ) -> Result<SinkOutcome, SinkError> {
        self.seen += 1;
        self.push("consume");
        self.results.lock().unwrap().push(result.cloned());
        if let Some((frames, token, reason)) = &self.stop_after {
            if self.seen >= *frames {
                token.request(*reason);
            }
        }
        if self.fail_consume {
            return Err(SinkError::Encode("scripted sink failure".into()));
        }
        Ok(SinkOutcome::Delivered)
    }

    fn release(&mut self) {
        self.push("release");
    }
}

fn fast_reconnect(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts,
        delay: Duration::from_millis(5),
    }
}

#[test]
fn interrupt_releases_everything_once_in_reverse_order() -> Result<()> {
    let log: EventLog = Arc::default();
    let token = ShutdownToken::new();
    let source = ScriptedSource::new((0..10).map(|_| good_frame()).collect(), Arc::clone(&log));

    // Added out of order on purpose; dispatch order is by kind.
    let report = LifecycleController::new(source, token.clone())
        .with_sink(Box::new(RecordingSink::new("relay", SinkKind::Relay, &log)))
        .with_sink(Box::new(
            RecordingSink::new("display", SinkKind::Display, &log).stopping_after(
                3,
                &token,
                StopReason::Interrupt,
            ),
        ))
        .with_sink(Box::new(RecordingSink::new("disk", SinkKind::Disk, &log)))
        .run()?;

    assert_eq!(report.outcome, RunOutcome::Stopped(StopReason::Interrupt));
    assert_eq!(report.frames_read, 3);

    let events = events(&log);
    assert_eq!(
        &events[..4],
        &["source.open", "display.acquire", "disk.acquire", "relay.acquire"]
    );
    assert_eq!(
        &events[events.len() - 4..],
        &["relay.release", "disk.release", "display.release", "source.close"]
    );
    assert_eq!(
        &events[4..7],
        &["display.consume", "disk.consume", "relay.consume"]
    );
    for event in ["display.release", "disk.release", "relay.release", "source.close"] {
        assert_eq!(count(&log, event), 1, "{} must happen exactly once", event);
    }
    Ok(())
}

#[test]
fn quit_request_from_a_sink_ends_the_run_cleanly() -> Result<()> {
    let log: EventLog = Arc::default();
    let token = ShutdownToken::new();
    let source = ScriptedSource::new((0..10).map(|_| good_frame()).collect(), Arc::clone(&log));

    let report = LifecycleController::new(source, token.clone())
        .with_sink(Box::new(
            RecordingSink::new("display", SinkKind::Display, &log).stopping_after(
                1,
                &token,
                StopReason::QuitRequested,
            ),
        ))
        .run()?;

    assert_eq!(report.outcome, RunOutcome::Stopped(StopReason::QuitRequested));
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.frames_read, 1);
    Ok(())
}

#[test]
fn unreachable_source_fails_startup_with_connect_error() {
    let source = StreamSource::new(SourceConfig {
        url: "stub://camera?fail_open=1".to_string(),
        ..SourceConfig::default()
    })
    .unwrap();
    let log: EventLog = Arc::default();

    let err = LifecycleController::new(source, ShutdownToken::new())
        .with_sink(Box::new(RecordingSink::new("disk", SinkKind::Disk, &log)))
        .run()
        .unwrap_err();

    assert!(matches!(err, PipelineError::Connect(_)));
    assert_eq!(err.exit_code(), EXIT_SOURCE_UNREACHABLE);
    assert!(err.to_string().contains("stub://camera"));
    // Sinks are never acquired when the source cannot open.
    assert!(events(&log).is_empty());
}

#[test]
fn refused_http_source_is_a_connect_error() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap();
    let source = StreamSource::new(SourceConfig {
        url: format!("http://127.0.0.1:{}/stream", port),
        connect_timeout: Duration::from_millis(500),
        ..SourceConfig::default()
    })
    .unwrap();

    let err = LifecycleController::new(source, ShutdownToken::new())
        .run()
        .unwrap_err();
    assert_eq!(err.exit_code(), EXIT_SOURCE_UNREACHABLE);
}

#[test]
fn exhausted_source_is_reported_as_lost_after_reconnect() -> Result<()> {
    let source = StreamSource::new(SourceConfig {
        url: "stub://camera?frames=3".to_string(),
        width: 32,
        height: 24,
        ..SourceConfig::default()
    })?;
    let log: EventLog = Arc::default();

    let report = LifecycleController::new(source, ShutdownToken::new())
        .with_reconnect_policy(fast_reconnect(1))
        .with_sink(Box::new(RecordingSink::new("disk", SinkKind::Disk, &log)))
        .run()?;

    assert_eq!(report.outcome, RunOutcome::SourceLost { attempts: 1 });
    assert_eq!(report.exit_code(), EXIT_SOURCE_LOST);
    assert_eq!(report.frames_read, 3);
    assert_eq!(report.reconnects, 1);
    assert_eq!(count(&log, "disk.release"), 1);
    Ok(())
}

#[test]
fn reconnect_counter_resets_after_a_good_frame() -> Result<()> {
    let log: EventLog = Arc::default();
    let token = ShutdownToken::new();
    let script = vec![
        good_frame(),
        None,
        good_frame(),
        None,
        good_frame(),
        good_frame(),
    ];
    let source = ScriptedSource::new(script, Arc::clone(&log));

    let report = LifecycleController::new(source, token.clone())
        .with_reconnect_policy(fast_reconnect(1))
        .with_sink(Box::new(
            RecordingSink::new("disk", SinkKind::Disk, &log).stopping_after(
                4,
                &token,
                StopReason::Interrupt,
            ),
        ))
        .run()?;

    assert_eq!(report.outcome, RunOutcome::Stopped(StopReason::Interrupt));
    assert_eq!(report.frames_read, 4);
    assert_eq!(report.reconnects, 2);
    // Initial open plus one reopen per failure.
    assert_eq!(count(&log, "source.open"), 3);
    assert_eq!(count(&log, "source.close"), 1);
    Ok(())
}

#[test]
fn interrupt_during_backoff_stops_without_waiting() -> Result<()> {
    let log: EventLog = Arc::default();
    let token = ShutdownToken::new();
    let source = ScriptedSource::new(vec![good_frame(), None], Arc::clone(&log));

    let remote = token.clone();
    let interrupter = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        remote.request(StopReason::Interrupt);
    });

    let started = std::time::Instant::now();
    let report = LifecycleController::new(source, token)
        .with_reconnect_policy(ReconnectPolicy {
            max_attempts: 3,
            delay: Duration::from_secs(30),
        })
        .run()?;
    interrupter.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.outcome, RunOutcome::Stopped(StopReason::Interrupt));
    assert_eq!(count(&log, "source.close"), 1);
    Ok(())
}

#[test]
fn sink_failures_do_not_stop_the_loop() -> Result<()> {
    let log: EventLog = Arc::default();
    let token = ShutdownToken::new();
    let source = ScriptedSource::new((0..5).map(|_| good_frame()).collect(), Arc::clone(&log));

    let mut failing = RecordingSink::new("relay", SinkKind::Relay, &log);
    failing.fail_consume = true;

    let report = LifecycleController::new(source, token.clone())
        .with_reconnect_policy(fast_reconnect(0))
        .with_sink(Box::new(failing))
        .with_sink(Box::new(RecordingSink::new("disk", SinkKind::Disk, &log)))
        .run()?;

    assert_eq!(report.outcome, RunOutcome::SourceLost { attempts: 0 });
    assert_eq!(report.frames_read, 5);
    assert_eq!(report.sink_failures, 5);
    assert_eq!(count(&log, "disk.consume"), 5);
    assert_eq!(count(&log, "relay.consume"), 5);
    Ok(())
}

#[test]
fn malformed_frames_are_skipped() -> Result<()> {
    let log: EventLog = Arc::default();
    let script = vec![
        good_frame(),
        Some(Frame::rgb(Vec::new(), 0, 0)),
        Some(Frame::rgb(vec![1, 2, 3], 4, 4)),
        good_frame(),
    ];
    let source = ScriptedSource::new(script, Arc::clone(&log));

    let report = LifecycleController::new(source, ShutdownToken::new())
        .with_reconnect_policy(fast_reconnect(0))
        .with_sink(Box::new(RecordingSink::new("disk", SinkKind::Disk, &log)))
        .run()?;

    assert_eq!(report.frames_read, 4);
    assert_eq!(report.frames_skipped, 2);
    assert_eq!(count(&log, "disk.consume"), 2);
    Ok(())
}

#[test]
fn failed_sink_start_releases_what_was_acquired() {
    let log: EventLog = Arc::default();
    let source = ScriptedSource::new(vec![good_frame()], Arc::clone(&log));
    let mut broken = RecordingSink::new("disk", SinkKind::Disk, &log);
    broken.fail_acquire = true;

    let err = LifecycleController::new(source, ShutdownToken::new())
        .with_sink(Box::new(RecordingSink::new("display", SinkKind::Display, &log)))
        .with_sink(Box::new(broken))
        .with_sink(Box::new(RecordingSink::new("relay", SinkKind::Relay, &log)))
        .run()
        .unwrap_err();

    assert!(matches!(err, PipelineError::SinkStart { name: "disk", .. }));
    assert_eq!(
        events(&log),
        vec![
            "source.open",
            "display.acquire",
            "disk.acquire",
            "display.release",
            "source.close"
        ]
    );
}

fn metadata(labels: &[&str], profile: &PreprocessingProfile) -> ModelMetadata {
    ModelMetadata::new(labels.iter().map(|l| l.to_string()).collect(), profile)
}

#[test]
fn classification_results_reach_the_sinks() -> Result<()> {
    let log: EventLog = Arc::default();
    let profile = PreprocessingProfile::default();
    let engine = InferenceEngine::with_backend(
        Box::new(FixedScoresBackend::new(profile.tensor_shape(), vec![0.1, 0.9])),
        metadata(&["mano_alzata", "sfondo"], &profile),
    )?;
    let source = ScriptedSource::new(vec![good_frame(), good_frame()], Arc::clone(&log));
    let sink = RecordingSink::new("disk", SinkKind::Disk, &log);
    let results = Arc::clone(&sink.results);

    LifecycleController::new(source, ShutdownToken::new())
        .with_reconnect_policy(fast_reconnect(0))
        .with_engine(engine)
        .with_sink(Box::new(sink))
        .run()?;

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 2);
    for result in results.iter() {
        let result = result.as_ref().expect("every frame is classified");
        assert_eq!(result.class_index, 1);
        assert_eq!(result.label, "sfondo");
    }
    Ok(())
}

#[test]
fn profile_model_mismatch_stops_the_run() -> Result<()> {
    let log: EventLog = Arc::default();
    let profile = PreprocessingProfile::default();
    let engine = InferenceEngine::with_backend(
        Box::new(FixedScoresBackend::new(profile.tensor_shape(), vec![0.5, 0.5])),
        metadata(&["a", "b"], &profile),
    )?;
    let source = ScriptedSource::new((0..5).map(|_| good_frame()).collect(), Arc::clone(&log));

    let err = LifecycleController::new(source, ShutdownToken::new())
        .with_engine(engine)
        .with_profile(PreprocessingProfile::grayscale(64, 64)?)
        .with_sink(Box::new(RecordingSink::new("disk", SinkKind::Disk, &log)))
        .run()
        .unwrap_err();

    assert!(matches!(err, PipelineError::ShapeMismatch(_)));
    assert_eq!(err.exit_code(), EXIT_SHAPE_MISMATCH);
    assert_eq!(count(&log, "disk.consume"), 0);
    assert_eq!(count(&log, "disk.release"), 1);
    assert_eq!(count(&log, "source.close"), 1);
    Ok(())
}

#[test]
fn engine_loads_from_artifacts_on_disk() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let model_path = dir.path().join("dry_run.scores");
    let metadata_path = dir.path().join("metadata.json");
    std::fs::write(&model_path, "[0.2, 0.7, 0.1]")?;
    metadata(&["a", "b", "c"], &PreprocessingProfile::default()).save(&metadata_path)?;

    let mut engine = InferenceEngine::load(&model_path, &metadata_path)?;
    let frame = Frame::rgb(vec![10; 640 * 480 * 3], 640, 480);
    let tensor = framepipe::transform::apply(&frame, engine.profile())?;
    let result = engine.classify(&tensor)?;
    assert_eq!(result.label, "b");
    assert_eq!(result.to_string(), "b (70.0%)");
    Ok(())
}
