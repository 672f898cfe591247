pub mod fixed;

#[cfg(feature = "backend-tract")]
pub mod tract;

use std::path::Path;

pub use fixed::FixedScoresBackend;

#[cfg(feature = "backend-tract")]
pub use self::tract::TractBackend;

use crate::classify::backend::ClassifierBackend;
use crate::error::LoadError;
use crate::transform::PreprocessingProfile;

/// Opens the model artifact at `path`, choosing the backend by extension.
///
/// - `.onnx`: `TractBackend` (feature `backend-tract`)
/// - `.scores`: `FixedScoresBackend` reading a JSON score array, for dry runs
pub fn open_model(
    path: &Path,
    profile: &PreprocessingProfile,
) -> Result<Box<dyn ClassifierBackend>, LoadError> {
    if !path.exists() {
        return Err(LoadError::Missing(path.to_path_buf()));
    }
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "onnx" => open_onnx(path, profile),
        "scores" => Ok(Box::new(FixedScoresBackend::from_file(
            path,
            profile.tensor_shape(),
        )?)),
        other => Err(LoadError::Unsupported(format!(
            "unsupported model format '{}' for {}",
            other,
            path.display()
        ))),
    }
}

#[cfg(feature = "backend-tract")]
fn open_onnx(
    path: &Path,
    profile: &PreprocessingProfile,
) -> Result<Box<dyn ClassifierBackend>, LoadError> {
    Ok(Box::new(TractBackend::new(path, profile.tensor_shape())?))
}

#[cfg(not(feature = "backend-tract"))]
fn open_onnx(
    path: &Path,
    _profile: &PreprocessingProfile,
) -> Result<Box<dyn ClassifierBackend>, LoadError> {
    Err(LoadError::Unsupported(format!(
        "{} is an ONNX model but framepipe was built without the backend-tract feature",
        path.display()
    )))
}

/// Compares a model's declared input dimensions with the `(N, H, W, C)`
/// shape the profile produces. `None` marks a symbolic dimension and matches
/// anything.
#[cfg_attr(not(feature = "backend-tract"), allow(dead_code))]
pub(crate) fn check_declared_input(
    declared: &[Option<usize>],
    expected: [usize; 4],
) -> Result<(), String> {
    let shown = || {
        declared
            .iter()
            .map(|d| d.map_or_else(|| "?".to_string(), |d| d.to_string()))
            .collect::<Vec<_>>()
            .join(", ")
    };
    if declared.len() != expected.len() {
        return Err(format!(
            "model declares a rank-{} input ({}), expected (N, H, W, C) = {:?}",
            declared.len(),
            shown(),
            expected
        ));
    }
    let mismatch = declared
        .iter()
        .zip(expected)
        .any(|(declared, expected)| declared.is_some_and(|d| d != expected));
    if mismatch {
        return Err(format!(
            "model declares input ({}) but the preprocessing profile produces {:?}",
            shown(),
            expected
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn unknown_extension_is_unsupported() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.tflite");
        std::fs::write(&path, b"not a model")?;
        let err = open_model(&path, &PreprocessingProfile::default()).err();
        assert!(matches!(err, Some(LoadError::Unsupported(_))));
        Ok(())
    }

    #[test]
    fn scores_file_opens_fixed_backend() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dry_run.scores");
        std::fs::write(&path, "[0.25, 0.75]")?;
        let backend = open_model(&path, &PreprocessingProfile::default())?;
        assert_eq!(backend.name(), "fixed");
        assert_eq!(backend.input_shape(), [1, 96, 96, 1]);
        assert_eq!(backend.output_len(), Some(2));
        Ok(())
    }

    const PROFILE_SHAPE: [usize; 4] = [1, 96, 96, 1];

    #[test]
    fn declared_input_matching_profile_is_accepted() {
        let declared = [Some(1), Some(96), Some(96), Some(1)];
        assert!(check_declared_input(&declared, PROFILE_SHAPE).is_ok());
    }

    #[test]
    fn symbolic_batch_dimension_is_accepted() {
        let declared = [None, Some(96), Some(96), Some(1)];
        assert!(check_declared_input(&declared, PROFILE_SHAPE).is_ok());
    }

    #[test]
    fn declared_input_of_another_size_is_rejected() {
        let declared = [Some(1), Some(64), Some(64), Some(1)];
        let err = check_declared_input(&declared, PROFILE_SHAPE).unwrap_err();
        assert!(err.contains("(1, 64, 64, 1)"), "{}", err);
    }

    #[test]
    fn channels_first_layout_is_rejected() {
        let declared = [Some(1), Some(1), Some(96), Some(96)];
        assert!(check_declared_input(&declared, PROFILE_SHAPE).is_err());
    }

    #[test]
    fn declared_input_of_wrong_rank_is_rejected() {
        let err = check_declared_input(&[None, Some(96), Some(96)], PROFILE_SHAPE).unwrap_err();
        assert!(err.contains("rank-3"), "{}", err);
    }
}
