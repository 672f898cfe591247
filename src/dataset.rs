//! Offline dataset preparation.
//!
//! Reads `{root}/{class}/*.{png,jpg,jpeg,bmp}` for an ordered class list,
//! runs every image through [`transform::apply`] (the same function the live
//! pipeline uses), splits each class 80/20 with a seeded RNG and writes:
//!
//! - `train_images.npy`, `val_images.npy`: `f32`, shape `(N, H, W, C)`
//! - `train_labels.npy`, `val_labels.npy`: `i64` class indices, shape `(N,)`
//! - `metadata.json`: class names in index order plus the profile
//!
//! The `.npy` files are NumPy format version 1.0, little endian.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::classify::ModelMetadata;
use crate::frame::Frame;
use crate::transform::{self, PreprocessingProfile};

pub const DEFAULT_VALIDATION_FRACTION: f64 = 0.2;
pub const DEFAULT_SEED: u64 = 42;

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];
const NPY_MAGIC: &[u8] = b"\x93NUMPY";
const NPY_ALIGN: usize = 64;

#[derive(Clone, Debug)]
pub struct DatasetOptions {
    pub root: PathBuf,
    /// Class folder names; the position is the label index.
    pub classes: Vec<String>,
    pub profile: PreprocessingProfile,
    pub validation_fraction: f64,
    pub seed: u64,
    pub output_dir: PathBuf,
}

impl DatasetOptions {
    pub fn new(root: impl Into<PathBuf>, classes: Vec<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            classes,
            profile: PreprocessingProfile::default(),
            validation_fraction: DEFAULT_VALIDATION_FRACTION,
            seed: DEFAULT_SEED,
            output_dir: output_dir.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassCount {
    pub name: String,
    pub train: usize,
    pub val: usize,
}

#[derive(Clone, Debug)]
pub struct DatasetSummary {
    pub classes: Vec<ClassCount>,
    pub skipped: Vec<PathBuf>,
    pub train_len: usize,
    pub val_len: usize,
    pub metadata_path: PathBuf,
}

/// One decoded and preprocessed image.
struct Sample {
    class_index: usize,
    values: Vec<f32>,
}

/// Image files of one class folder, sorted by file name.
pub fn class_images(root: &Path, class: &str) -> Result<Vec<PathBuf>> {
    let dir = root.join(class);
    let entries = fs::read_dir(&dir)
        .with_context(|| format!("class folder {} is not readable", dir.display()))?;
    let mut images = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if is_image && path.is_file() {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Runs the whole preparation. `on_image` is called once per input file,
/// decoded or not.
pub fn prepare(options: &DatasetOptions, on_image: &mut dyn FnMut(&Path)) -> Result<DatasetSummary> {
    if options.classes.is_empty() {
        return Err(anyhow!("at least one class is required"));
    }
    if !(0.0..1.0).contains(&options.validation_fraction) || options.validation_fraction == 0.0 {
        return Err(anyhow!(
            "validation fraction must be in (0, 1), got {}",
            options.validation_fraction
        ));
    }
    let metadata = ModelMetadata::new(options.classes.clone(), &options.profile);
    metadata.validate().map_err(|e| anyhow!(e))?;

    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut train = Vec::new();
    let mut val = Vec::new();
    let mut counts = Vec::with_capacity(options.classes.len());
    let mut skipped = Vec::new();

    for (class_index, class) in options.classes.iter().enumerate() {
        let mut samples = Vec::new();
        for path in class_images(&options.root, class)? {
            on_image(&path);
            match load_sample(&path, class_index, &options.profile) {
                Ok(sample) => samples.push(sample),
                Err(e) => {
                    log::warn!("skipping {}: {:#}", path.display(), e);
                    skipped.push(path);
                }
            }
        }
        if samples.len() < 2 {
            return Err(anyhow!(
                "class '{}' has {} usable image(s); at least 2 are needed for a train/validation split",
                class,
                samples.len()
            ));
        }

        samples.shuffle(&mut rng);
        let val_len = validation_len(samples.len(), options.validation_fraction);
        let train_part = samples.split_off(val_len);
        counts.push(ClassCount {
            name: class.clone(),
            train: train_part.len(),
            val: samples.len(),
        });
        log::info!(
            "class {} '{}': {} train, {} validation",
            class_index,
            class,
            train_part.len(),
            samples.len()
        );
        val.extend(samples);
        train.extend(train_part);
    }

    train.shuffle(&mut rng);
    val.shuffle(&mut rng);

    fs::create_dir_all(&options.output_dir)
        .with_context(|| format!("cannot create {}", options.output_dir.display()))?;
    let shape = options.profile.tensor_shape();
    write_split(&options.output_dir, "train", &train, shape)?;
    write_split(&options.output_dir, "val", &val, shape)?;

    let metadata_path = options.output_dir.join("metadata.json");
    metadata
        .save(&metadata_path)
        .with_context(|| format!("cannot write {}", metadata_path.display()))?;

    Ok(DatasetSummary {
        classes: counts,
        skipped,
        train_len: train.len(),
        val_len: val.len(),
        metadata_path,
    })
}

/// Validation share of a class: `ceil(len * fraction)`, leaving at least one
/// image on each side.
fn validation_len(len: usize, fraction: f64) -> usize {
    let wanted = (len as f64 * fraction).ceil() as usize;
    wanted.clamp(1, len.saturating_sub(1).max(1))
}

fn load_sample(path: &Path, class_index: usize, profile: &PreprocessingProfile) -> Result<Sample> {
    let image = image::open(path).context("decode failed")?.into_rgb8();
    let (width, height) = image.dimensions();
    let frame = Frame::rgb(image.into_raw(), width, height);
    let tensor = transform::apply(&frame, profile)?;
    Ok(Sample {
        class_index,
        values: tensor.into_data(),
    })
}

fn write_split(dir: &Path, name: &str, samples: &[Sample], shape: [usize; 4]) -> Result<()> {
    let images_path = dir.join(format!("{}_images.npy", name));
    let labels_path = dir.join(format!("{}_labels.npy", name));

    let image_shape = [samples.len(), shape[1], shape[2], shape[3]];
    let mut images = npy_writer(&images_path, "<f4", &image_shape)?;
    for sample in samples {
        for value in &sample.values {
            images.write_all(&value.to_le_bytes())?;
        }
    }
    images
        .flush()
        .with_context(|| format!("cannot write {}", images_path.display()))?;

    let mut labels = npy_writer(&labels_path, "<i8", &[samples.len()])?;
    for sample in samples {
        labels.write_all(&(sample.class_index as i64).to_le_bytes())?;
    }
    labels
        .flush()
        .with_context(|| format!("cannot write {}", labels_path.display()))?;
    Ok(())
}

fn npy_writer(path: &Path, descr: &str, shape: &[usize]) -> Result<BufWriter<fs::File>> {
    let file = fs::File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&npy_header(descr, shape))?;
    Ok(writer)
}

/// Version 1.0 header, padded so the data starts on a 64-byte boundary.
fn npy_header(descr: &str, shape: &[usize]) -> Vec<u8> {
    let dims = match shape {
        [single] => format!("({},)", single),
        dims => format!(
            "({})",
            dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
        ),
    };
    let mut dict = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        descr, dims
    );
    // magic(6) + version(2) + header length(2) + dict + '\n'
    let unpadded = NPY_MAGIC.len() + 2 + 2 + dict.len() + 1;
    let padding = (NPY_ALIGN - unpadded % NPY_ALIGN) % NPY_ALIGN;
    dict.push_str(&" ".repeat(padding));
    dict.push('\n');

    let mut header = Vec::with_capacity(unpadded + padding);
    header.extend_from_slice(NPY_MAGIC);
    header.extend_from_slice(&[1, 0]);
    header.extend_from_slice(&(dict.len() as u16).to_le_bytes());
    header.extend_from_slice(dict.as_bytes());
    header
}
