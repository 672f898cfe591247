use anyhow::Result;

use crate::transform::Tensor;

/// A loaded fixed-shape classification model.
///
/// Implementations run exactly one forward pass per call and return the raw
/// per-class scores. Shape checks, label lookup and arg-max selection live in
/// `InferenceEngine` so every backend behaves the same.
pub trait ClassifierBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Declared model input, `(1, H, W, C)`.
    fn input_shape(&self) -> [usize; 4];

    /// Length of the score vector when the model declares it.
    fn output_len(&self) -> Option<usize>;

    fn forward(&mut self, input: &Tensor) -> Result<Vec<f32>>;

    /// Optional warm-up hook, run once after loading.
    fn warm_up(&mut self) -> Result<()> {
        let zeros = Tensor::zeros(self.input_shape());
        self.forward(&zeros).map(|_| ())
    }
}
