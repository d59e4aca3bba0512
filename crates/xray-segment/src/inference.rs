//! Inference: checkpoint loading, eval forward and mask extraction.

use std::path::Path;

use candle_core::{Device, Tensor};
use xray_core::{ClassMap, Error, Result};

use crate::layers::resize_bilinear;
use crate::model::{Mode, UNet3PlusConfig, UNet3PlusHrNet};

/// Predictor configuration
#[derive(Debug, Clone)]
pub struct PredictorConfig {
    pub model: UNet3PlusConfig,
    /// Device to run inference on
    pub device: DeviceType,
    /// Probability above which a pixel belongs to a class
    pub threshold: f32,
    /// Side length masks are resampled to before thresholding, e.g. the
    /// source radiograph resolution. `None` keeps the model output size.
    pub mask_size: Option<usize>,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            model: UNet3PlusConfig::default(),
            device: DeviceType::Cpu,
            threshold: 0.5,
            mask_size: None,
        }
    }
}

impl PredictorConfig {
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        if !(self.threshold > 0.0 && self.threshold < 1.0) {
            return Err(Error::Config(format!(
                "mask threshold {} must lie strictly between 0 and 1",
                self.threshold
            )));
        }
        if self.mask_size == Some(0) {
            return Err(Error::Config("mask_size must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum DeviceType {
    Cpu,
    Cuda(usize),
    Metal,
}

impl DeviceType {
    pub fn device(self) -> Result<Device> {
        Ok(match self {
            Self::Cpu => Device::Cpu,
            Self::Cuda(ordinal) => Device::new_cuda(ordinal)?,
            Self::Metal => Device::new_metal(0)?,
        })
    }
}

/// Binary masks for one image, one per class
#[derive(Debug, Clone)]
pub struct ClassMasks {
    pub height: usize,
    pub width: usize,
    /// Row-major `height × width` masks indexed by class
    pub masks: Vec<Vec<bool>>,
}

impl ClassMasks {
    /// Run-length encoding of one class mask (1-indexed starts, row-major)
    pub fn rle(&self, class: usize) -> Option<String> {
        self.masks.get(class).map(|m| rle_encode(m))
    }

    /// `(class name, rle)` pairs in class order, one submission row each
    pub fn rle_rows<'a>(&self, classes: &'a ClassMap) -> Result<Vec<(&'a str, String)>> {
        if classes.len() != self.masks.len() {
            return Err(Error::InvalidInput(format!(
                "{} masks cannot be labelled by {} classes",
                self.masks.len(),
                classes.len()
            )));
        }
        Ok(classes
            .names()
            .iter()
            .zip(&self.masks)
            .map(|(name, mask)| (name.as_str(), rle_encode(mask)))
            .collect())
    }

    /// Pixels set in one class mask
    pub fn area(&self, class: usize) -> usize {
        self.masks
            .get(class)
            .map_or(0, |m| m.iter().filter(|&&on| on).count())
    }
}

/// Segmentation predictor: the finest gated output of an eval-mode model
pub struct Predictor {
    model: UNet3PlusHrNet,
    device: Device,
    config: PredictorConfig,
}

impl Predictor {
    /// Wrap an already built model, e.g. one fresh out of training
    pub fn from_model(model: UNet3PlusHrNet, config: PredictorConfig) -> Result<Self> {
        config.validate()?;
        let device = config.device.device()?;
        Ok(Self {
            model,
            device,
            config,
        })
    }

    /// Model with seeded initial weights and no checkpoint
    pub fn with_seed(config: PredictorConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let device = config.device.device()?;
        let (model, _varmap) =
            UNet3PlusHrNet::initialize(config.model.clone(), seed, None, &device)?;
        Self::from_model(model, config)
    }

    /// Load every model variable from a safetensors checkpoint written by
    /// the trainer. A checkpoint that lacks any variable of the configured
    /// model is rejected.
    pub fn load<P: AsRef<Path>>(path: P, config: PredictorConfig) -> Result<Self> {
        let path = path.as_ref();
        config.validate()?;
        if !path.is_file() {
            return Err(Error::Config(format!(
                "checkpoint {} does not exist",
                path.display()
            )));
        }

        let device = config.device.device()?;
        let (model, mut varmap) =
            UNet3PlusHrNet::initialize(config.model.clone(), 0, None, &device)?;
        varmap.load(path).map_err(|e| {
            Error::Config(format!(
                "checkpoint {} does not fit the model configuration: {e}",
                path.display()
            ))
        })?;

        tracing::info!(
            path = %path.display(),
            device = ?config.device,
            n_classes = config.model.n_classes,
            "Loaded segmentation checkpoint"
        );

        Self::from_model(model, config)
    }

    /// Per-class probabilities `[batch, C, S, S]` for a `[batch, 3, H, W]`
    /// batch, resampled to `mask_size` when set
    pub fn predict_probabilities(&self, images: &Tensor) -> Result<Tensor> {
        let images = images.to_device(&self.device)?;
        let logits = self.model.forward(&images, Mode::Eval)?;
        let probs = candle_nn::ops::sigmoid(&logits)?;
        match self.config.mask_size {
            Some(size) => Ok(resize_bilinear(&probs, (size, size), false)?),
            None => Ok(probs),
        }
    }

    /// Thresholded masks for every image in the batch
    pub fn predict_masks(&self, images: &Tensor) -> Result<Vec<ClassMasks>> {
        let probs = self.predict_probabilities(images)?;
        let (batch, classes, height, width) = probs.dims4()?;

        let binary = probs
            .ge(self.config.threshold as f64)?
            .to_device(&Device::Cpu)?
            .reshape((batch, classes, height * width))?
            .to_vec3::<u8>()?;

        tracing::debug!(batch, classes, height, width, "Extracted class masks");

        Ok(binary
            .into_iter()
            .map(|per_class| ClassMasks {
                height,
                width,
                masks: per_class
                    .into_iter()
                    .map(|m| m.into_iter().map(|v| v != 0).collect())
                    .collect(),
            })
            .collect())
    }

    pub fn model(&self) -> &UNet3PlusHrNet {
        &self.model
    }

    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }
}

/// Run-length encode a row-major mask as `start length start length ...`
/// with 1-indexed starts
pub fn rle_encode(mask: &[bool]) -> String {
    let mut runs = Vec::new();
    let mut start = None;

    for (i, &on) in mask.iter().enumerate() {
        match (on, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                runs.push(format!("{} {}", s + 1, i - s));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push(format!("{} {}", s + 1, mask.len() - s));
    }

    runs.join(" ")
}

/// Decode a run-length string produced by [`rle_encode`]
pub fn rle_decode(rle: &str, len: usize) -> Result<Vec<bool>> {
    let numbers = rle
        .split_whitespace()
        .map(|t| {
            t.parse::<usize>()
                .map_err(|e| Error::InvalidInput(format!("bad RLE token {t:?}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    if numbers.len() % 2 != 0 {
        return Err(Error::InvalidInput("RLE needs start/length pairs".to_string()));
    }

    let mut mask = vec![false; len];
    for pair in numbers.chunks(2) {
        let (start, run) = (pair[0], pair[1]);
        let end = start
            .checked_sub(1)
            .and_then(|s| s.checked_add(run))
            .filter(|&end| end <= len)
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "RLE run {start}+{run} outside mask of {len} pixels"
                ))
            })?;
        mask[start - 1..end].fill(true);
    }
    Ok(mask)
}
