//! Labelled frame capture to disk.
//!
//! Layout: `{root}/{label}/{label}_{seq:04}.{ext}`. The sequence continues
//! after the highest index already present, and files are opened with
//! `create_new` so an existing capture is never replaced.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::{encode_frame, CaptureTrigger, FrameSink, ImageFormat, SinkKind, SinkOutcome};
use crate::classify::InferenceResult;
use crate::error::SinkError;
use crate::frame::Frame;

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(200);
const DEFAULT_LABEL: &str = "unlabeled";

/// When the writer persists frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Every frame, subject to the minimum interval.
    Continuous,
    /// Only frames following a capture request (the display `s` key).
    Key,
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerMode::Continuous => f.write_str("continuous"),
            TriggerMode::Key => f.write_str("key"),
        }
    }
}

impl FromStr for TriggerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continuous" => Ok(TriggerMode::Continuous),
            "key" => Ok(TriggerMode::Key),
            other => Err(format!(
                "unknown trigger mode '{}' (expected continuous or key)",
                other
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DiskWriterConfig {
    pub root: PathBuf,
    pub label: String,
    pub min_interval: Duration,
    pub format: ImageFormat,
    pub jpeg_quality: u8,
    pub trigger: TriggerMode,
}

impl Default for DiskWriterConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("dataset"),
            label: DEFAULT_LABEL.to_string(),
            min_interval: DEFAULT_MIN_INTERVAL,
            format: ImageFormat::Png,
            jpeg_quality: 95,
            trigger: TriggerMode::Continuous,
        }
    }
}

/// Trimmed, lower-cased, whitespace runs replaced by `_`.
pub fn normalize_label(label: &str) -> String {
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}

pub struct DiskWriter {
    config: DiskWriterConfig,
    label: String,
    dir: PathBuf,
    next_sequence: u32,
    last_write: Option<Instant>,
    trigger: Option<CaptureTrigger>,
    written: u64,
}

impl DiskWriter {
    pub fn new(config: DiskWriterConfig) -> Self {
        let mut label = normalize_label(&config.label);
        if label.is_empty() {
            label = DEFAULT_LABEL.to_string();
        }
        let dir = config.root.join(&label);
        Self {
            config,
            label,
            dir,
            next_sequence: 0,
            last_write: None,
            trigger: None,
            written: 0,
        }
    }

    /// Shared trigger consulted in [`TriggerMode::Key`].
    pub fn with_capture_trigger(mut self, trigger: CaptureTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Writes `frame` as if requested at `now`. Requests closer than the
    /// minimum interval to the previous write are skipped.
    pub fn save_at(&mut self, frame: &Frame, now: Instant) -> Result<SinkOutcome, SinkError> {
        if let Some(last) = self.last_write {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.config.min_interval {
                return Ok(SinkOutcome::Skipped(format!(
                    "{:?} since last save, minimum is {:?}",
                    elapsed, self.config.min_interval
                )));
            }
        }

        let bytes = encode_frame(frame, self.config.format, self.config.jpeg_quality)
            .map_err(SinkError::Encode)?;
        let path = self.write_next(&bytes)?;
        self.last_write = Some(now);
        self.written += 1;
        log::info!("DiskWriter: saved {}", path.display());
        Ok(SinkOutcome::Delivered)
    }

    fn file_path(&self, sequence: u32) -> PathBuf {
        self.dir.join(format!(
            "{}_{:04}.{}",
            self.label,
            sequence,
            self.config.format.extension()
        ))
    }

    fn write_next(&mut self, bytes: &[u8]) -> Result<PathBuf, SinkError> {
        loop {
            let path = self.file_path(self.next_sequence);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    self.next_sequence += 1;
                    file.write_all(bytes)
                        .and_then(|_| file.sync_all())
                        .map_err(|source| SinkError::Io {
                            path: path.clone(),
                            source,
                        })?;
                    return Ok(path);
                }
                // Someone else wrote this index since acquire; move past it.
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    self.next_sequence += 1;
                }
                Err(source) => return Err(SinkError::Io { path, source }),
            }
        }
    }
}

/// Highest `{label}_{NNNN}.*` index in `dir`, if any.
fn highest_sequence(dir: &Path, label: &str) -> std::io::Result<Option<u32>> {
    let prefix = format!("{}_", label);
    let mut highest = None;
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(rest) = name.strip_prefix(&prefix) else {
            continue;
        };
        let digits = rest.split('.').next().unwrap_or("");
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if let Ok(sequence) = digits.parse::<u32>() {
            highest = highest.max(Some(sequence));
        }
    }
    Ok(highest)
}

impl FrameSink for DiskWriter {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Disk
    }

    fn acquire(&mut self) -> Result<(), SinkError> {
        fs::create_dir_all(&self.dir).map_err(|source| SinkError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let highest = highest_sequence(&self.dir, &self.label).map_err(|source| SinkError::Io {
            path: self.dir.clone(),
            source,
        })?;
        self.next_sequence = highest.map_or(0, |h| h + 1);
        log::info!(
            "DiskWriter: writing '{}' captures to {} from index {:04} ({} mode)",
            self.label,
            self.dir.display(),
            self.next_sequence,
            self.config.trigger
        );
        Ok(())
    }

    fn consume(
        &mut self,
        frame: &Frame,
        _result: Option<&InferenceResult>,
    ) -> Result<SinkOutcome, SinkError> {
        if self.config.trigger == TriggerMode::Key {
            let requested = self.trigger.as_ref().is_some_and(|t| t.take());
            if !requested {
                return Ok(SinkOutcome::Skipped("no capture requested".to_string()));
            }
        }
        self.save_at(frame, Instant::now())
    }

    fn release(&mut self) {
        log::info!(
            "DiskWriter: {} frame(s) saved to {}",
            self.written,
            self.dir.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn frame() -> Frame {
        Frame::rgb(vec![128; 8 * 8 * 3], 8, 8)
    }

    fn writer(root: &Path, label: &str) -> DiskWriter {
        DiskWriter::new(DiskWriterConfig {
            root: root.to_path_buf(),
            label: label.to_string(),
            ..DiskWriterConfig::default()
        })
    }

    #[test]
    fn labels_are_normalized() {
        assert_eq!(normalize_label("  Mano Alzata "), "mano_alzata");
        assert_eq!(normalize_label("SFONDO"), "sfondo");
        assert_eq!(normalize_label("   "), "");
    }

    #[test]
    fn empty_directory_starts_at_zero() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut writer = writer(dir.path(), "Sfondo");
        writer.acquire()?;
        writer.save_at(&frame(), Instant::now())?;
        assert!(dir.path().join("sfondo/sfondo_0000.png").exists());
        Ok(())
    }

    #[test]
    fn unrelated_files_do_not_move_the_sequence() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let class_dir = dir.path().join("a");
        fs::create_dir_all(&class_dir)?;
        fs::write(class_dir.join("notes.txt"), b"x")?;
        fs::write(class_dir.join("a_final.png"), b"x")?;
        fs::write(class_dir.join("b_0009.png"), b"x")?;
        fs::write(class_dir.join("a_0004.jpg"), b"x")?;

        assert_eq!(highest_sequence(&class_dir, "a")?, Some(4));
        Ok(())
    }

    #[test]
    fn key_mode_only_saves_after_a_request() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let trigger = CaptureTrigger::new();
        let mut writer = DiskWriter::new(DiskWriterConfig {
            root: dir.path().to_path_buf(),
            label: "a".to_string(),
            trigger: TriggerMode::Key,
            min_interval: Duration::ZERO,
            ..DiskWriterConfig::default()
        })
        .with_capture_trigger(trigger.clone());
        writer.acquire()?;

        assert!(matches!(writer.consume(&frame(), None)?, SinkOutcome::Skipped(_)));
        trigger.raise();
        assert_eq!(writer.consume(&frame(), None)?, SinkOutcome::Delivered);
        assert!(matches!(writer.consume(&frame(), None)?, SinkOutcome::Skipped(_)));
        assert_eq!(writer.written(), 1);
        Ok(())
    }

    #[test]
    fn write_errors_are_reported_not_panicked() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let blocker = dir.path().join("blocked");
        fs::write(&blocker, b"file, not a directory")?;
        let mut writer = DiskWriter::new(DiskWriterConfig {
            root: blocker,
            label: "a".to_string(),
            ..DiskWriterConfig::default()
        });
        assert!(matches!(writer.acquire(), Err(SinkError::Io { .. })));
        Ok(())
    }
}
