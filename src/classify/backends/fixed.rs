use std::fs;
use std::path::Path;

use anyhow::{anyhow, Result};

use crate::classify::backend::ClassifierBackend;
use crate::error::LoadError;
use crate::transform::Tensor;

/// Backend that returns the same score vector for every input.
///
/// Used by tests and by dry runs of the pipeline without a trained model.
pub struct FixedScoresBackend {
    input_shape: [usize; 4],
    scores: Vec<f32>,
}

impl FixedScoresBackend {
    pub fn new(input_shape: [usize; 4], scores: Vec<f32>) -> Self {
        Self { input_shape, scores }
    }

    /// Reads a JSON array of scores.
    pub fn from_file(path: &Path, input_shape: [usize; 4]) -> Result<Self, LoadError> {
        let raw = fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let scores: Vec<f32> = serde_json::from_str(&raw).map_err(|e| LoadError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if scores.is_empty() {
            return Err(LoadError::Parse {
                path: path.to_path_buf(),
                reason: "score array is empty".to_string(),
            });
        }
        Ok(Self::new(input_shape, scores))
    }
}

impl ClassifierBackend for FixedScoresBackend {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn input_shape(&self) -> [usize; 4] {
        self.input_shape
    }

    fn output_len(&self) -> Option<usize> {
        Some(self.scores.len())
    }

    fn forward(&mut self, input: &Tensor) -> Result<Vec<f32>> {
        if input.data().len() != self.input_shape.iter().product::<usize>() {
            return Err(anyhow!(
                "expected {} input values, received {}",
                self.input_shape.iter().product::<usize>(),
                input.data().len()
            ));
        }
        Ok(self.scores.clone())
    }
}
