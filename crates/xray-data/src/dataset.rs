//! Image/annotation pairing and the hand X-ray dataset.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use image::{GrayImage, RgbImage};
use rand::rngs::StdRng;
use walkdir::WalkDir;
use xray_core::{ClassMap, DataConfig, Error, Result};

use crate::annotation::AnnotationFile;
use crate::augment::{Augmentation, RawSample};

/// Image extension recognized during discovery
pub const IMAGE_EXTENSION: &str = "png";
/// Annotation extension recognized during discovery
pub const LABEL_EXTENSION: &str = "json";

/// Matching image and annotation, both relative to their roots
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SamplePair {
    pub image: PathBuf,
    pub label: PathBuf,
}

impl SamplePair {
    /// Directory holding the image; one person per directory
    pub fn group(&self) -> String {
        self.image
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Pair every `.png` under `image_root` with the `.json` of the same
/// relative prefix under `label_root`, sorted by path.
pub fn discover_pairs(image_root: &Path, label_root: &Path) -> Result<Vec<SamplePair>> {
    let images: BTreeMap<PathBuf, PathBuf> = list_files(image_root, IMAGE_EXTENSION)?
        .into_iter()
        .map(|p| (p.with_extension(""), p))
        .collect();
    let mut labels: BTreeMap<PathBuf, PathBuf> = list_files(label_root, LABEL_EXTENSION)?
        .into_iter()
        .map(|p| (p.with_extension(""), p))
        .collect();

    let unlabelled: Vec<_> = images.keys().filter(|k| !labels.contains_key(*k)).collect();
    let orphaned: Vec<_> = labels.keys().filter(|k| !images.contains_key(*k)).collect();
    if !unlabelled.is_empty() || !orphaned.is_empty() {
        return Err(Error::Dataset(format!(
            "{} images without annotation (first: {:?}), {} annotations without image (first: {:?})",
            unlabelled.len(),
            unlabelled.first(),
            orphaned.len(),
            orphaned.first(),
        )));
    }

    let pairs: Vec<SamplePair> = images
        .into_iter()
        .filter_map(|(prefix, image)| {
            labels
                .remove(&prefix)
                .map(|label| SamplePair { image, label })
        })
        .collect();

    tracing::info!(
        image_root = %image_root.display(),
        pairs = pairs.len(),
        "Discovered image/annotation pairs"
    );
    Ok(pairs)
}

/// Files with `extension` (case-insensitive) under `root`, relative to it, sorted
fn list_files(root: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(Error::Dataset(format!(
            "dataset root is not a directory: {}",
            root.display()
        )));
    }

    let mut found = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let matches = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(extension));
        if !matches {
            tracing::trace!(path = %entry.path().display(), "Skipping file");
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            found.push(relative.to_path_buf());
        }
    }
    found.sort();

    Ok(found)
}

/// One example as channel-first float planes
#[derive(Debug, Clone)]
pub struct Sample {
    /// `[3, size, size]`, values in `[0, 1]`
    pub image: Vec<f32>,
    /// `[n_classes, size, size]`, values in `{0, 1}`
    pub mask: Vec<f32>,
    pub n_classes: usize,
    pub size: usize,
}

impl Sample {
    pub fn image_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.image, (3, self.size, self.size), device)?)
    }

    pub fn mask_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(
            &self.mask,
            (self.n_classes, self.size, self.size),
            device,
        )?)
    }
}

/// Indexed collection of samples
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    /// Materialize sample `index`; `rng` drives any augmentation
    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Sample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hand X-ray images with rasterized bone masks
#[derive(Debug, Clone)]
pub struct XRayDataset {
    image_root: PathBuf,
    label_root: PathBuf,
    pairs: Vec<SamplePair>,
    classes: ClassMap,
    size: usize,
    augment: Option<Augmentation>,
}

impl XRayDataset {
    pub fn new(
        image_root: impl Into<PathBuf>,
        label_root: impl Into<PathBuf>,
        pairs: Vec<SamplePair>,
        classes: ClassMap,
        size: usize,
        augment: Option<Augmentation>,
    ) -> Result<Self> {
        if size == 0 {
            return Err(Error::Config("image size must be positive".to_string()));
        }
        if classes.is_empty() {
            return Err(Error::Config("at least one class is required".to_string()));
        }

        let dataset = Self {
            image_root: image_root.into(),
            label_root: label_root.into(),
            pairs,
            classes,
            size,
            augment,
        };
        tracing::info!(
            samples = dataset.pairs.len(),
            augmented = dataset.augment.is_some(),
            size,
            "Built X-ray dataset"
        );
        Ok(dataset)
    }

    pub fn from_config(
        config: &DataConfig,
        pairs: Vec<SamplePair>,
        augment: Option<Augmentation>,
    ) -> Result<Self> {
        Self::new(
            &config.image_root,
            &config.label_root,
            pairs,
            config.classes.clone(),
            config.image_size,
            augment,
        )
    }

    pub fn pairs(&self) -> &[SamplePair] {
        &self.pairs
    }

    pub fn classes(&self) -> &ClassMap {
        &self.classes
    }

    /// Decoded image and masks at the configured size, before augmentation
    pub fn load_raw(&self, index: usize) -> Result<RawSample> {
        let pair = self.pairs.get(index).ok_or_else(|| {
            Error::InvalidInput(format!(
                "sample {index} out of range for {} samples",
                self.pairs.len()
            ))
        })?;

        let image = image::open(self.image_root.join(&pair.image))?.to_rgb8();
        let (width, height) = image.dimensions();
        let annotations = AnnotationFile::load(self.label_root.join(&pair.label))?;
        let masks = annotations.rasterize(&self.classes, width, height);

        let side = self.size as u32;
        if (width, height) == (side, side) {
            return Ok(RawSample { image, masks });
        }
        Ok(RawSample {
            image: image::imageops::resize(&image, side, side, FilterType::Triangle),
            masks: masks
                .iter()
                .map(|m| image::imageops::resize(m, side, side, FilterType::Nearest))
                .collect(),
        })
    }
}

impl Dataset for XRayDataset {
    fn len(&self) -> usize {
        self.pairs.len()
    }

    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Sample> {
        let mut raw = self.load_raw(index)?;
        if let Some(augment) = &self.augment {
            augment.apply_geometric(&mut raw, rng);
        }

        let mut image = rgb_planes(&raw.image);
        if let Some(augment) = &self.augment {
            augment.apply_photometric(&mut image, rng);
        }

        Ok(Sample {
            image,
            mask: mask_planes(&raw.masks),
            n_classes: self.classes.len(),
            size: self.size,
        })
    }
}

/// Channel-first planes scaled to `[0, 1]`
fn rgb_planes(image: &RgbImage) -> Vec<f32> {
    let n = (image.width() * image.height()) as usize;
    let mut planes = vec![0f32; 3 * n];
    for (i, pixel) in image.pixels().enumerate() {
        for c in 0..3 {
            planes[c * n + i] = pixel.0[c] as f32 / 255.0;
        }
    }
    planes
}

fn mask_planes(masks: &[GrayImage]) -> Vec<f32> {
    masks
        .iter()
        .flat_map(|m| m.pixels().map(|p| if p.0[0] > 0 { 1.0 } else { 0.0 }))
        .collect()
}

/// Datasets chained end to end
#[derive(Clone)]
pub struct ConcatDataset {
    parts: Vec<Arc<dyn Dataset>>,
    /// Cumulative lengths: part `k` covers `[ends[k-1], ends[k])`
    ends: Vec<usize>,
}

impl ConcatDataset {
    pub fn new(parts: Vec<Arc<dyn Dataset>>) -> Self {
        let ends = parts
            .iter()
            .scan(0, |total, d| {
                *total += d.len();
                Some(*total)
            })
            .collect();
        Self { parts, ends }
    }
}

impl Dataset for ConcatDataset {
    fn len(&self) -> usize {
        self.ends.last().copied().unwrap_or(0)
    }

    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Sample> {
        let part = self.ends.partition_point(|&end| end <= index);
        let Some(dataset) = self.parts.get(part) else {
            return Err(Error::InvalidInput(format!(
                "sample {index} out of range for {} samples",
                self.len()
            )));
        };
        let start = if part == 0 { 0 } else { self.ends[part - 1] };
        dataset.get(index - start, rng)
    }
}
