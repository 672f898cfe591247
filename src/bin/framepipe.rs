//! framepipe - live camera pipeline
//!
//! Reads frames from a stream URL, optionally classifies them with a trained
//! model and fans them out to a preview window, a labelled capture directory
//! and an HTTP relay. Ctrl-C (or `q` in the preview) shuts down cleanly.
//!
//! Exit codes: 0 clean, 1 fatal, 2 source unreachable, 3 model artifacts,
//! 4 shape mismatch, 5 source lost, 6 configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use framepipe::sink::ImageFormat;
use framepipe::{
    CaptureTrigger, DiskWriter, Display, DisplayConfig, InferenceEngine, LifecycleController,
    NetworkRelay, PipelineConfig, PipelineError, RunReport, ShutdownToken, StreamSource,
    TriggerMode,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Stream frames from a camera into a classifier, a preview window, disk and an HTTP relay"
)]
struct Args {
    /// JSON or TOML configuration file
    #[arg(long, env = "FRAMEPIPE_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Stream URL (rtsp://, http://, stub://)
    #[arg(long, value_name = "URL")]
    source: Option<String>,

    /// Open the preview window
    #[arg(long)]
    display: bool,

    /// Save frames under the dataset root with this label
    #[arg(long, value_name = "LABEL")]
    label: Option<String>,

    /// Dataset root for captured frames
    #[arg(long, value_name = "DIR")]
    dataset_root: Option<PathBuf>,

    /// When to save frames: continuous, or key (press `s` in the preview).
    /// Defaults to key with --display and continuous without.
    #[arg(long, value_name = "MODE")]
    trigger: Option<TriggerMode>,

    /// Minimum time between two saved frames
    #[arg(long, value_name = "MS")]
    save_interval_ms: Option<u64>,

    /// Image format for saved frames (png or jpeg)
    #[arg(long, value_name = "FORMAT")]
    save_format: Option<ImageFormat>,

    /// POST every frame as JPEG to this URL
    #[arg(long, value_name = "URL")]
    relay_url: Option<String>,

    /// Relay from a worker thread with this queue depth (0 = inline)
    #[arg(long, value_name = "N")]
    relay_queue: Option<usize>,

    /// Trained model (.onnx)
    #[arg(long, value_name = "PATH")]
    model: Option<PathBuf>,

    /// Model metadata JSON (defaults to metadata.json next to the model)
    #[arg(long, value_name = "PATH", requires = "model")]
    metadata: Option<PathBuf>,

    /// Reopen attempts after the stream fails
    #[arg(long, value_name = "N")]
    reconnect_attempts: Option<u32>,

    /// Delay before each reopen attempt
    #[arg(long, value_name = "MS")]
    reconnect_delay_ms: Option<u64>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let code = match run(args) {
        Ok(report) => report.exit_code(),
        Err(e) => {
            log::error!("framepipe: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run(args: Args) -> Result<RunReport, PipelineError> {
    let config = build_config(args).map_err(|e| PipelineError::Config(format!("{:#}", e)))?;

    let shutdown = ShutdownToken::new();
    shutdown
        .install_interrupt_handler()
        .map_err(|e| PipelineError::Fatal(format!("{:#}", e)))?;

    let source = StreamSource::new(config.source.clone())?;
    let mut controller =
        LifecycleController::new(source, shutdown.clone()).with_reconnect_policy(config.reconnect);

    if let Some(model) = &config.model {
        let engine = InferenceEngine::load(&model.model_path, &model.metadata_path)?;
        controller = controller.with_engine(engine);
    }

    let trigger = CaptureTrigger::new();
    if let Some(display) = config.display.clone() {
        controller = controller.with_sink(Box::new(
            Display::new(display, shutdown.clone()).with_capture_trigger(trigger.clone()),
        ));
    }
    if let Some(disk) = config.disk.clone() {
        controller =
            controller.with_sink(Box::new(DiskWriter::new(disk).with_capture_trigger(trigger)));
    }
    if let Some(relay) = config.relay.clone() {
        controller = controller.with_sink(Box::new(NetworkRelay::new(relay)));
    }

    controller.run()
}

fn build_config(args: Args) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load_from(args.config.as_deref())?;

    if let Some(url) = args.source {
        config.source.url = url;
    }
    if args.display && config.display.is_none() {
        config.display = Some(DisplayConfig::default());
    }
    if let Some(root) = args.dataset_root {
        config.set_dataset_root(root);
    }
    if let Some(label) = args.label {
        let trigger = args.trigger.unwrap_or(if config.display.is_some() {
            TriggerMode::Key
        } else {
            TriggerMode::Continuous
        });
        config.enable_capture(&label, trigger);
    }
    if let Some(disk) = config.disk.as_mut() {
        if let Some(ms) = args.save_interval_ms {
            disk.min_interval = Duration::from_millis(ms);
        }
        if let Some(format) = args.save_format {
            disk.format = format;
        }
    }
    if let Some(url) = args.relay_url {
        config.set_relay_url(url);
    }
    if let (Some(relay), Some(depth)) = (config.relay.as_mut(), args.relay_queue) {
        relay.queue_depth = depth;
    }
    if let Some(model) = args.model {
        config.set_model(model, args.metadata);
    }
    if let Some(attempts) = args.reconnect_attempts {
        config.reconnect.max_attempts = attempts;
    }
    if let Some(ms) = args.reconnect_delay_ms {
        config.reconnect.delay = Duration::from_millis(ms);
    }

    config.validate()?;
    Ok(config)
}
