use std::path::Path;

use crate::classify::backend::ClassifierBackend;
use crate::classify::backends;
use crate::classify::metadata::ModelMetadata;
use crate::classify::result::{arg_max, InferenceResult};
use crate::error::{ClassifyError, LoadError, ShapeMismatchError};
use crate::transform::{PreprocessingProfile, Tensor};

/// Label reported when the model emits more scores than there are labels.
const UNKNOWN_LABEL: &str = "unknown";

/// A loaded model together with its label list and preprocessing profile.
pub struct InferenceEngine {
    backend: Box<dyn ClassifierBackend>,
    metadata: ModelMetadata,
    profile: PreprocessingProfile,
}

impl std::fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("backend", &self.backend.name())
            .field("input_shape", &self.backend.input_shape())
            .field("labels", &self.metadata.class_names)
            .finish()
    }
}

impl InferenceEngine {
    /// Loads the model at `model_path` and its companion metadata.
    ///
    /// The metadata is read first because the model input fact is derived
    /// from the training profile it records.
    pub fn load(model_path: &Path, metadata_path: &Path) -> Result<Self, LoadError> {
        let metadata = ModelMetadata::load(metadata_path)?;
        let profile = metadata
            .profile()
            .map_err(|e| LoadError::Inconsistent(e.to_string()))?;
        let backend = backends::open_model(model_path, &profile)?;
        let engine = Self::with_backend(backend, metadata)?;
        log::info!(
            "InferenceEngine: loaded {} ({} backend, input {:?}, {} classes)",
            model_path.display(),
            engine.backend_name(),
            engine.backend.input_shape(),
            engine.labels().len()
        );
        Ok(engine)
    }

    /// Wraps an already-constructed backend. Checks that the backend agrees
    /// with the metadata and runs the warm-up pass.
    pub fn with_backend(
        mut backend: Box<dyn ClassifierBackend>,
        metadata: ModelMetadata,
    ) -> Result<Self, LoadError> {
        metadata.validate().map_err(LoadError::Inconsistent)?;
        let profile = metadata
            .profile()
            .map_err(|e| LoadError::Inconsistent(e.to_string()))?;

        let input_shape = backend.input_shape();
        if input_shape != profile.tensor_shape() {
            return Err(LoadError::Inconsistent(format!(
                "model input {:?} does not match metadata profile {:?}",
                input_shape,
                profile.tensor_shape()
            )));
        }
        if let Some(outputs) = backend.output_len() {
            if outputs != metadata.class_names.len() {
                return Err(LoadError::Inconsistent(format!(
                    "model has {} outputs but metadata lists {} class names",
                    outputs,
                    metadata.class_names.len()
                )));
            }
        }

        backend
            .warm_up()
            .map_err(|e| LoadError::Backend(format!("warm-up failed: {:#}", e)))?;

        Ok(Self {
            backend,
            metadata,
            profile,
        })
    }

    /// Profile every tensor passed to [`classify`](Self::classify) must be
    /// produced with.
    pub fn profile(&self) -> &PreprocessingProfile {
        &self.profile
    }

    /// Class names in model output order.
    pub fn labels(&self) -> &[String] {
        &self.metadata.class_names
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Runs a single forward pass.
    pub fn classify(&mut self, tensor: &Tensor) -> Result<InferenceResult, ClassifyError> {
        let expected = self.backend.input_shape();
        if tensor.shape() != expected {
            return Err(ShapeMismatchError {
                expected,
                actual: tensor.shape(),
            }
            .into());
        }

        let scores = self
            .backend
            .forward(tensor)
            .map_err(|e| ClassifyError::Backend(format!("{:#}", e)))?;
        let (class_index, score) = arg_max(&scores)
            .ok_or_else(|| ClassifyError::Backend("model produced no finite scores".into()))?;
        let label = self
            .metadata
            .class_names
            .get(class_index)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_LABEL.to_string());

        Ok(InferenceResult {
            class_index,
            label,
            confidence: score.clamp(0.0, 1.0),
        })
    }
}
