//! Error taxonomy for the frame pipeline.
//!
//! Per-frame errors (`InvalidFrameError`, `SinkError`) never stop the loop.
//! Structural errors (`ConnectError` at startup, `LoadError`,
//! `ShapeMismatchError`) are wrapped in `PipelineError` and end the process
//! with a distinct exit code.

use std::path::PathBuf;

use thiserror::Error;

pub const EXIT_CLEAN: i32 = 0;
pub const EXIT_FATAL: i32 = 1;
pub const EXIT_SOURCE_UNREACHABLE: i32 = 2;
pub const EXIT_ARTIFACT: i32 = 3;
pub const EXIT_SHAPE_MISMATCH: i32 = 4;
pub const EXIT_SOURCE_LOST: i32 = 5;
pub const EXIT_CONFIG: i32 = 6;

/// The stream transport could not be opened.
#[derive(Debug, Clone, Error)]
#[error("cannot open stream {url}: {reason}")]
pub struct ConnectError {
    pub url: String,
    pub reason: String,
}

impl ConnectError {
    pub fn new(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ReadError {
    #[error("stream is not open")]
    NotStreaming,
    #[error("stream ended")]
    EndOfStream,
    #[error("stream stalled for {0:?}")]
    Stalled(std::time::Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

impl ReadError {
    /// Only the current frame is lost; the transport is still usable and
    /// the next read may succeed without reconnecting.
    pub fn is_frame_local(&self) -> bool {
        matches!(self, ReadError::Decode(_))
    }
}

/// Malformed input frame. The controller skips the frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid frame: {reason}")]
pub struct InvalidFrameError {
    pub reason: String,
}

impl InvalidFrameError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("tensor shape {actual:?} does not match model input {expected:?}")]
pub struct ShapeMismatchError {
    pub expected: [usize; 4],
    pub actual: [usize; 4],
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("artifact {} not found", .0.display())]
    Missing(PathBuf),
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },
    #[error("inconsistent artifacts: {0}")]
    Inconsistent(String),
    #[error("model backend error: {0}")]
    Backend(String),
    #[error("{0}")]
    Unsupported(String),
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error(transparent)]
    ShapeMismatch(#[from] ShapeMismatchError),
    #[error("forward pass failed: {0}")]
    Backend(String),
}

/// Failure of a single best-effort delivery. Logged and dropped.
#[derive(Debug, Clone, Error)]
pub enum DeliveryFailure {
    #[error("endpoint answered HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request failed: {0}")]
    Transport(String),
    #[error("jpeg encoding failed: {0}")]
    Encode(String),
    #[error("relay queue full, frame dropped")]
    QueueFull,
    #[error("relay worker is not running")]
    WorkerGone,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Delivery(#[from] DeliveryFailure),
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image encoding failed: {0}")]
    Encode(String),
    #[error("display error: {0}")]
    Display(String),
}

/// Errors that end a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    ShapeMismatch(#[from] ShapeMismatchError),
    #[error("sink {name} failed to start: {source}")]
    SinkStart {
        name: &'static str,
        #[source]
        source: SinkError,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Fatal(String),
}

impl PipelineError {
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Connect(_) => EXIT_SOURCE_UNREACHABLE,
            PipelineError::Load(_) => EXIT_ARTIFACT,
            PipelineError::ShapeMismatch(_) => EXIT_SHAPE_MISMATCH,
            PipelineError::Config(_) => EXIT_CONFIG,
            PipelineError::SinkStart { .. } | PipelineError::Fatal(_) => EXIT_FATAL,
        }
    }
}
