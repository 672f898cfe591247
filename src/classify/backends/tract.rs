use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;
use tract_onnx::tract_hir::infer::GenericFactoid;

use crate::classify::backend::ClassifierBackend;
use crate::classify::backends::check_declared_input;
use crate::error::LoadError;

/// ONNX classifier run through tract.
///
/// The declared input must agree with the `(1, H, W, C)` shape of the
/// training profile; symbolic dimensions are accepted and then pinned to it.
/// No network I/O; the model file is read once at construction.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_shape: [usize; 4],
    output_len: Option<usize>,
}

impl TractBackend {
    pub fn new<P: AsRef<Path>>(model_path: P, input_shape: [usize; 4]) -> Result<Self, LoadError> {
        let model_path = model_path.as_ref();
        let backend = |e: anyhow::Error| LoadError::Backend(format!("{}: {:#}", model_path.display(), e));

        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))
            .map_err(backend)?;

        let declared = model
            .input_fact(0)
            .context("model has no input")
            .map_err(backend)?;
        if !declared.shape.is_open() {
            let dims: Vec<Option<usize>> = declared
                .shape
                .dims()
                .map(|dim| match dim {
                    GenericFactoid::Only(d) => d.to_i64().ok().and_then(|v| usize::try_from(v).ok()),
                    GenericFactoid::Any => None,
                })
                .collect();
            check_declared_input(&dims, input_shape).map_err(|reason| {
                LoadError::Inconsistent(format!("{}: {}", model_path.display(), reason))
            })?;
        }

        let [n, h, w, c] = input_shape;
        let typed = model
            .with_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), tvec!(n, h, w, c)))
            .context("model does not accept an NHWC f32 input of the profile shape")
            .and_then(|model| model.into_optimized().context("failed to optimize ONNX model"))
            .map_err(backend)?;

        let output_len = typed
            .output_fact(0)
            .ok()
            .and_then(|fact| fact.shape.as_concrete().map(|dims| dims.iter().product()));

        let model = typed
            .into_runnable()
            .context("failed to build runnable ONNX model")
            .map_err(backend)?;

        Ok(Self {
            model,
            input_shape,
            output_len,
        })
    }
}

impl ClassifierBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn input_shape(&self) -> [usize; 4] {
        self.input_shape
    }

    fn output_len(&self) -> Option<usize> {
        self.output_len
    }

    fn forward(&mut self, input: &crate::transform::Tensor) -> Result<Vec<f32>> {
        let [n, h, w, c] = self.input_shape;
        let array = tract_ndarray::Array4::from_shape_vec((n, h, w, c), input.data().to_vec())
            .context("input tensor does not match model shape")?;
        let outputs = self
            .model
            .run(tvec!(array.into_tensor().into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let scores = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        Ok(scores.iter().copied().collect())
    }
}
