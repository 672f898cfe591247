//! Companion artifact for a trained model.
//!
//! JSON document written by `prepare_dataset` next to the tensors and read
//! back at pipeline startup:
//!
//! ```json
//! {
//!   "class_names": ["mano_alzata", "sfondo"],
//!   "img_width": 96,
//!   "img_height": 96,
//!   "channels": 1,
//!   "normalization": [0.0, 1.0]
//! }
//! ```
//!
//! `channels` and `normalization` are optional and default to the grayscale
//! `[0, 1]` profile.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::LoadError;
use crate::transform::PreprocessingProfile;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Label per output index.
    pub class_names: Vec<String>,
    pub img_width: u32,
    pub img_height: u32,
    #[serde(default = "default_channels")]
    pub channels: u8,
    #[serde(default = "default_normalization")]
    pub normalization: [f32; 2],
}

fn default_channels() -> u8 {
    1
}

fn default_normalization() -> [f32; 2] {
    [0.0, 1.0]
}

impl ModelMetadata {
    pub fn new(class_names: Vec<String>, profile: &PreprocessingProfile) -> Self {
        let (lo, hi) = profile.range();
        Self {
            class_names,
            img_width: profile.width(),
            img_height: profile.height(),
            channels: profile.channels(),
            normalization: [lo, hi],
        }
    }

    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let raw = fs::read_to_string(path).map_err(|source| {
            if source.kind() == ErrorKind::NotFound {
                LoadError::Missing(path.to_path_buf())
            } else {
                LoadError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        let metadata: Self = serde_json::from_str(&raw).map_err(|e| LoadError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        metadata.validate().map_err(|reason| LoadError::Parse {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(metadata)
    }

    pub fn save(&self, path: &Path) -> Result<(), LoadError> {
        let body = serde_json::to_string_pretty(self).map_err(|e| LoadError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        fs::write(path, body).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.class_names.is_empty() {
            return Err("class_names must not be empty".to_string());
        }
        let mut seen = HashSet::new();
        for name in &self.class_names {
            if name.trim().is_empty() {
                return Err("class_names contains an empty label".to_string());
            }
            if !seen.insert(name.as_str()) {
                return Err(format!("duplicate class name '{}'", name));
            }
        }
        self.profile().map(|_| ()).map_err(|e| e.to_string())
    }

    /// Preprocessing the model was trained with.
    pub fn profile(&self) -> anyhow::Result<PreprocessingProfile> {
        PreprocessingProfile::new(
            self.img_width,
            self.img_height,
            self.channels,
            (self.normalization[0], self.normalization[1]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn optional_fields_default_to_grayscale_unit_range() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("metadata.json");
        fs::write(
            &path,
            r#"{"class_names":["mano_alzata","sfondo"],"img_width":96,"img_height":96}"#,
        )?;

        let metadata = ModelMetadata::load(&path)?;
        assert_eq!(metadata.channels, 1);
        assert_eq!(metadata.normalization, [0.0, 1.0]);
        assert_eq!(metadata.profile()?, PreprocessingProfile::default());
        Ok(())
    }

    #[test]
    fn save_then_load_keeps_labels_in_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("metadata.json");
        let labels = vec!["c".to_string(), "a".to_string(), "b".to_string()];
        ModelMetadata::new(labels.clone(), &PreprocessingProfile::grayscale(48, 32)?)
            .save(&path)?;

        let loaded = ModelMetadata::load(&path)?;
        assert_eq!(loaded.class_names, labels);
        assert_eq!((loaded.img_width, loaded.img_height), (48, 32));
        Ok(())
    }

    #[test]
    fn missing_file_is_reported_as_missing() {
        let err = ModelMetadata::load(Path::new("/nonexistent/metadata.json")).unwrap_err();
        assert!(matches!(err, LoadError::Missing(_)));
    }

    #[test]
    fn invalid_documents_are_parse_errors() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("metadata.json");
        for body in [
            "not json",
            r#"{"class_names":[],"img_width":96,"img_height":96}"#,
            r#"{"class_names":["a","a"],"img_width":96,"img_height":96}"#,
            r#"{"class_names":["a"],"img_width":0,"img_height":96}"#,
            r#"{"class_names":["a"],"img_width":96,"img_height":96,"channels":2}"#,
        ] {
            fs::write(&path, body)?;
            let err = ModelMetadata::load(&path).unwrap_err();
            assert!(matches!(err, LoadError::Parse { .. }), "body {}", body);
        }
        Ok(())
    }
}
