use std::fmt;

/// Outcome of one forward pass.
#[derive(Clone, Debug, PartialEq)]
pub struct InferenceResult {
    pub class_index: usize,
    pub label: String,
    /// Score of the predicted class, clamped to `[0, 1]`.
    pub confidence: f32,
}

impl fmt::Display for InferenceResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:.1}%)", self.label, self.confidence * 100.0)
    }
}

/// Index and value of the highest finite score. Equal maxima resolve to the
/// lowest index.
pub fn arg_max(scores: &[f32]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &score) in scores.iter().enumerate() {
        if !score.is_finite() {
            continue;
        }
        match best {
            Some((_, current)) if score <= current => {}
            _ => best = Some((index, score)),
        }
    }
    best
}
