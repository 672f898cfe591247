use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::SourceConfig;
use crate::lifecycle::ReconnectPolicy;
use crate::sink::{
    normalize_label, DiskWriterConfig, DisplayConfig, ImageFormat, RelayConfig, TriggerMode,
};

const DEFAULT_SOURCE_URL: &str = "rtsp://localhost:8554/webcam_stream";
const DEFAULT_DATASET_ROOT: &str = "dataset";
const DEFAULT_METADATA_FILE: &str = "metadata.json";
const DEFAULT_READ_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 2_000;
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 1;
const DEFAULT_SAVE_INTERVAL_MS: u64 = 200;
const DEFAULT_RELAY_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_RELAY_QUALITY: u8 = 85;
const DEFAULT_DISK_QUALITY: u8 = 95;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PipelineConfigFile {
    dataset_root: Option<PathBuf>,
    source: Option<SourceConfigFile>,
    model: Option<ModelConfigFile>,
    display: Option<DisplayConfigFile>,
    disk: Option<DiskConfigFile>,
    relay: Option<RelayConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SourceConfigFile {
    url: Option<String>,
    read_timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    reconnect_attempts: Option<u32>,
    reconnect_delay_ms: Option<u64>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ModelConfigFile {
    path: Option<PathBuf>,
    metadata: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DisplayConfigFile {
    enabled: Option<bool>,
    width: Option<usize>,
    height: Option<usize>,
    title: Option<String>,
    target_fps: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DiskConfigFile {
    root: Option<PathBuf>,
    label: Option<String>,
    min_interval_ms: Option<u64>,
    format: Option<ImageFormat>,
    jpeg_quality: Option<u8>,
    trigger: Option<TriggerMode>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RelayConfigFile {
    url: Option<String>,
    timeout_ms: Option<u64>,
    jpeg_quality: Option<u8>,
    queue_depth: Option<usize>,
}

/// Model artifact pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSettings {
    pub model_path: PathBuf,
    pub metadata_path: PathBuf,
}

impl ModelSettings {
    /// Uses `metadata.json` next to the model when no metadata path is given.
    pub fn new(model_path: PathBuf, metadata_path: Option<PathBuf>) -> Self {
        let metadata_path =
            metadata_path.unwrap_or_else(|| model_path.with_file_name(DEFAULT_METADATA_FILE));
        Self {
            model_path,
            metadata_path,
        }
    }

    /// The metadata path unless it is just the default next to the model.
    fn explicit_metadata(self) -> Option<PathBuf> {
        (self.metadata_path != self.model_path.with_file_name(DEFAULT_METADATA_FILE))
            .then_some(self.metadata_path)
    }
}

/// Resolved pipeline configuration: file, then environment, then CLI.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub dataset_root: PathBuf,
    pub source: SourceConfig,
    pub reconnect: ReconnectPolicy,
    pub model: Option<ModelSettings>,
    pub display: Option<DisplayConfig>,
    pub disk: Option<DiskWriterConfig>,
    pub relay: Option<RelayConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_file(PipelineConfigFile::default())
    }
}

impl PipelineConfig {
    /// Reads the file named by `FRAMEPIPE_CONFIG` (if any), applies
    /// environment overrides and validates the result.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FRAMEPIPE_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like [`load`](Self::load) with an explicit file instead of
    /// `FRAMEPIPE_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let dataset_root = file
            .dataset_root
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATASET_ROOT));

        let source_file = file.source.unwrap_or_default();
        let source_defaults = SourceConfig::default();
        let source = SourceConfig {
            url: source_file
                .url
                .unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
            read_timeout: Duration::from_millis(
                source_file.read_timeout_ms.unwrap_or(DEFAULT_READ_TIMEOUT_MS),
            ),
            connect_timeout: Duration::from_millis(
                source_file
                    .connect_timeout_ms
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            ),
            width: source_file.width.unwrap_or(source_defaults.width),
            height: source_file.height.unwrap_or(source_defaults.height),
            target_fps: source_file.target_fps.unwrap_or(source_defaults.target_fps),
        };
        let reconnect = ReconnectPolicy {
            max_attempts: source_file
                .reconnect_attempts
                .unwrap_or(DEFAULT_RECONNECT_ATTEMPTS),
            delay: Duration::from_millis(
                source_file
                    .reconnect_delay_ms
                    .unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
            ),
        };

        let model = file
            .model
            .and_then(|model| model.path.map(|path| ModelSettings::new(path, model.metadata)));

        let display = file.display.and_then(|display| {
            if !display.enabled.unwrap_or(true) {
                return None;
            }
            let defaults = DisplayConfig::default();
            Some(DisplayConfig {
                width: display.width.unwrap_or(defaults.width),
                height: display.height.unwrap_or(defaults.height),
                title: display.title.unwrap_or(defaults.title),
                target_fps: display.target_fps.unwrap_or(defaults.target_fps),
            })
        });

        let disk = file.disk.map(|disk| DiskWriterConfig {
            root: disk.root.unwrap_or_else(|| dataset_root.clone()),
            label: disk.label.unwrap_or_default(),
            min_interval: Duration::from_millis(
                disk.min_interval_ms.unwrap_or(DEFAULT_SAVE_INTERVAL_MS),
            ),
            format: disk.format.unwrap_or(ImageFormat::Png),
            jpeg_quality: disk.jpeg_quality.unwrap_or(DEFAULT_DISK_QUALITY),
            trigger: disk.trigger.unwrap_or(TriggerMode::Continuous),
        });

        let relay = file.relay.and_then(|relay| {
            relay.url.map(|url| RelayConfig {
                url,
                timeout: Duration::from_millis(relay.timeout_ms.unwrap_or(DEFAULT_RELAY_TIMEOUT_MS)),
                jpeg_quality: relay.jpeg_quality.unwrap_or(DEFAULT_RELAY_QUALITY),
                queue_depth: relay.queue_depth.unwrap_or(0),
            })
        });

        Self {
            dataset_root,
            source,
            reconnect,
            model,
            display,
            disk,
            relay,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("FRAMEPIPE_SOURCE_URL") {
            if !url.trim().is_empty() {
                self.source.url = url;
            }
        }
        if let Ok(url) = std::env::var("FRAMEPIPE_RELAY_URL") {
            if !url.trim().is_empty() {
                self.set_relay_url(url);
            }
        }
        if let Ok(path) = std::env::var("FRAMEPIPE_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.set_model(PathBuf::from(path), None);
            }
        }
        if let Ok(path) = std::env::var("FRAMEPIPE_METADATA_PATH") {
            if !path.trim().is_empty() {
                match self.model.as_mut() {
                    Some(model) => model.metadata_path = PathBuf::from(path),
                    None => {
                        return Err(anyhow!(
                            "FRAMEPIPE_METADATA_PATH is set but no model path is configured"
                        ))
                    }
                }
            }
        }
        if let Ok(root) = std::env::var("FRAMEPIPE_DATASET_ROOT") {
            if !root.trim().is_empty() {
                self.set_dataset_root(PathBuf::from(root));
            }
        }
        Ok(())
    }

    /// Enables the relay, keeping any configured timeout and quality.
    /// Points at another model. Without `metadata_path`, a metadata path
    /// configured earlier is kept; a default one follows the new model.
    pub fn set_model(&mut self, model_path: PathBuf, metadata_path: Option<PathBuf>) {
        let metadata_path = metadata_path.or_else(|| {
            self.model
                .take()
                .and_then(ModelSettings::explicit_metadata)
        });
        self.model = Some(ModelSettings::new(model_path, metadata_path));
    }

    pub fn set_relay_url(&mut self, url: String) {
        match self.relay.as_mut() {
            Some(relay) => relay.url = url,
            None => self.relay = Some(RelayConfig::new(url)),
        }
    }

    pub fn set_dataset_root(&mut self, root: PathBuf) {
        if let Some(disk) = self.disk.as_mut() {
            if disk.root == self.dataset_root {
                disk.root = root.clone();
            }
        }
        self.dataset_root = root;
    }

    /// Enables labelled capture under the dataset root.
    pub fn enable_capture(&mut self, label: &str, trigger: TriggerMode) {
        let disk = self.disk.get_or_insert_with(|| DiskWriterConfig {
            root: self.dataset_root.clone(),
            ..DiskWriterConfig::default()
        });
        disk.label = label.to_string();
        disk.trigger = trigger;
    }

    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.source.url)
            .with_context(|| format!("invalid source url '{}'", self.source.url))?;
        if !matches!(url.scheme(), "stub" | "http" | "https" | "rtsp" | "rtsps") {
            return Err(anyhow!("unsupported source scheme '{}'", url.scheme()));
        }
        if self.source.read_timeout.is_zero() || self.source.connect_timeout.is_zero() {
            return Err(anyhow!("source timeouts must be greater than zero"));
        }

        if let Some(display) = &self.display {
            if display.width == 0 || display.height == 0 {
                return Err(anyhow!("display size must be non-zero"));
            }
        }

        if let Some(disk) = &self.disk {
            if normalize_label(&disk.label).is_empty() {
                return Err(anyhow!("disk capture needs a non-empty label"));
            }
            if disk.trigger == TriggerMode::Key && self.display.is_none() {
                return Err(anyhow!(
                    "key-triggered capture needs the display (the 's' key lives there)"
                ));
            }
            validate_quality("disk jpeg_quality", disk.jpeg_quality)?;
        }

        if let Some(relay) = &self.relay {
            let parsed = url::Url::parse(&relay.url)
                .with_context(|| format!("invalid relay url '{}'", relay.url))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(anyhow!("relay url must be http(s), got '{}'", relay.url));
            }
            if relay.timeout.is_zero() {
                return Err(anyhow!("relay timeout must be greater than zero"));
            }
            validate_quality("relay jpeg_quality", relay.jpeg_quality)?;
        }
        Ok(())
    }
}

fn validate_quality(name: &str, quality: u8) -> Result<()> {
    if !(1..=100).contains(&quality) {
        return Err(anyhow!("{} must be within 1..=100, got {}", name, quality));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_capture_scripts() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.source.url, "rtsp://localhost:8554/webcam_stream");
        assert_eq!(cfg.reconnect.delay, Duration::from_secs(2));
        assert_eq!(cfg.reconnect.max_attempts, 1);
        assert!(cfg.model.is_none() && cfg.disk.is_none() && cfg.relay.is_none());
        assert_eq!(cfg.dataset_root, PathBuf::from("dataset"));
    }

    #[test]
    fn metadata_defaults_to_sibling_file() {
        let model = ModelSettings::new(PathBuf::from("models/gesture.onnx"), None);
        assert_eq!(model.metadata_path, PathBuf::from("models/metadata.json"));
    }

    #[test]
    fn replacing_the_model_keeps_configured_metadata() {
        let mut cfg = PipelineConfig::default();
        cfg.set_model(
            PathBuf::from("models/v1.onnx"),
            Some(PathBuf::from("meta/gestures.json")),
        );
        cfg.set_model(PathBuf::from("/opt/models/v2.onnx"), None);
        assert_eq!(
            cfg.model,
            Some(ModelSettings {
                model_path: PathBuf::from("/opt/models/v2.onnx"),
                metadata_path: PathBuf::from("meta/gestures.json"),
            })
        );
    }

    #[test]
    fn default_metadata_follows_a_replaced_model() {
        let mut cfg = PipelineConfig::default();
        cfg.set_model(PathBuf::from("models/v1.onnx"), None);
        cfg.set_model(PathBuf::from("/opt/models/v2.onnx"), None);
        let model = cfg.model.unwrap();
        assert_eq!(model.metadata_path, PathBuf::from("/opt/models/metadata.json"));

        let mut cfg = PipelineConfig::default();
        cfg.set_model(PathBuf::from("models/v1.onnx"), None);
        cfg.set_model(PathBuf::from("v2.onnx"), Some(PathBuf::from("v2.json")));
        assert_eq!(cfg.model.unwrap().metadata_path, PathBuf::from("v2.json"));
    }

    #[test]
    fn key_capture_requires_display() {
        let mut cfg = PipelineConfig::default();
        cfg.enable_capture("Mano Alzata", TriggerMode::Key);
        assert!(cfg.validate().is_err());
        cfg.display = Some(DisplayConfig::default());
        cfg.validate().unwrap();
    }

    #[test]
    fn relay_must_be_http() {
        let mut cfg = PipelineConfig::default();
        cfg.set_relay_url("rtsp://esp32/frame".to_string());
        assert!(cfg.validate().is_err());
        cfg.set_relay_url("http://192.168.1.50/frame".to_string());
        cfg.validate().unwrap();
        assert_eq!(cfg.relay.unwrap().timeout, Duration::from_secs(3));
    }

    #[test]
    fn dataset_root_moves_default_disk_root() {
        let mut cfg = PipelineConfig::default();
        cfg.enable_capture("sfondo", TriggerMode::Continuous);
        cfg.set_dataset_root(PathBuf::from("/data/gestures"));
        assert_eq!(cfg.disk.unwrap().root, PathBuf::from("/data/gestures"));
    }
}
