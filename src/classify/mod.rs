//! Fixed-shape image classification.

mod backend;
mod backends;
mod engine;
mod metadata;
mod result;

pub use backend::ClassifierBackend;
pub use backends::{open_model, FixedScoresBackend};
pub use engine::InferenceEngine;
pub use metadata::ModelMetadata;
pub use result::{arg_max, InferenceResult};

#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
