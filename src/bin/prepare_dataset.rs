//! prepare_dataset - turn labelled captures into training tensors
//!
//! Scans `{root}/{class}/` for each class given on the command line, applies
//! the same preprocessing as the live pipeline, splits every class 80/20 and
//! writes NumPy arrays plus `metadata.json` for the training step.

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;

use framepipe::dataset::{self, DatasetOptions};
use framepipe::sink::normalize_label;
use framepipe::PreprocessingProfile;

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Preprocess captured frames into train/validation arrays"
)]
struct Args {
    /// Dataset root containing one folder per class
    #[arg(long, env = "FRAMEPIPE_DATASET_ROOT", default_value = "dataset")]
    root: PathBuf,

    /// Class names in label-index order (comma separated)
    #[arg(long, value_delimiter = ',', required = true)]
    classes: Vec<String>,

    /// Output directory for the arrays and metadata.json
    #[arg(long, default_value = "prepared")]
    output: PathBuf,

    /// Model input width
    #[arg(long, default_value_t = 96)]
    width: u32,

    /// Model input height
    #[arg(long, default_value_t = 96)]
    height: u32,

    /// Model input channels (1 = grayscale, 3 = RGB)
    #[arg(long, default_value_t = 1)]
    channels: u8,

    /// Share of each class held out for validation
    #[arg(long, default_value_t = dataset::DEFAULT_VALIDATION_FRACTION)]
    val_fraction: f64,

    /// Shuffle seed
    #[arg(long, default_value_t = dataset::DEFAULT_SEED)]
    seed: u64,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let ui = ui::Ui::new(ui::UiMode::parse(&args.ui), std::io::stderr().is_terminal());

    let classes: Vec<String> = args
        .classes
        .iter()
        .map(|class| normalize_label(class))
        .filter(|class| !class.is_empty())
        .collect();
    if classes.is_empty() {
        return Err(anyhow!("--classes needs at least one non-empty name"));
    }

    let mut options = DatasetOptions::new(&args.root, classes, &args.output);
    options.profile = PreprocessingProfile::new(args.width, args.height, args.channels, (0.0, 1.0))?;
    options.validation_fraction = args.val_fraction;
    options.seed = args.seed;

    let total = {
        let _step = ui.step("Scan class folders");
        let mut total = 0u64;
        for class in &options.classes {
            let images = dataset::class_images(&options.root, class)?;
            println!("{}: {} image(s)", class, images.len());
            total += images.len() as u64;
        }
        total
    };

    let mut step = ui.counted_step("Preprocess and split", total);
    let summary = dataset::prepare(&options, &mut |_| step.advance())?;
    drop(step);

    for class in &summary.classes {
        println!("{}: {} train, {} validation", class.name, class.train, class.val);
    }
    if !summary.skipped.is_empty() {
        println!("skipped {} unreadable file(s)", summary.skipped.len());
    }
    println!(
        "wrote {} training and {} validation samples to {}",
        summary.train_len,
        summary.val_len,
        options.output_dir.display()
    );
    println!("metadata: {}", summary.metadata_path.display());
    Ok(())
}
