//! framepipe: camera stream to classifier to sinks.
//!
//! # Architecture
//!
//! ```text
//! StreamSource --Frame--> transform::apply --Tensor--> InferenceEngine
//!      |                                                     |
//!      +--------------- Frame + Option<InferenceResult> -----+--> Display
//!                                                               -> DiskWriter
//!                                                               -> NetworkRelay
//! ```
//!
//! [`LifecycleController`] owns the loop. It opens the source, acquires the
//! sinks, and on interrupt, quit or source loss releases everything exactly
//! once in reverse order.
//!
//! The same [`transform::apply`] feeds the live classifier and the offline
//! [`dataset`] preparation, so training and inference see identical input.

pub mod classify;
pub mod config;
pub mod dataset;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod lifecycle;
pub mod sink;
pub mod transform;

pub use classify::{InferenceEngine, InferenceResult, ModelMetadata};
pub use config::PipelineConfig;
pub use error::{
    ClassifyError, ConnectError, DeliveryFailure, InvalidFrameError, LoadError, PipelineError,
    ReadError, ShapeMismatchError, SinkError,
};
pub use frame::Frame;
pub use ingest::{ConnectionState, FrameSource, SourceConfig, StreamSource};
pub use lifecycle::{
    LifecycleController, ReconnectPolicy, RunOutcome, RunReport, ShutdownToken, StopReason,
};
pub use sink::{
    CaptureTrigger, DiskWriter, DiskWriterConfig, Display, DisplayConfig, FrameSink, NetworkRelay,
    RelayConfig, SinkKind, SinkOutcome, TriggerMode,
};
pub use transform::{PreprocessingProfile, Tensor};
