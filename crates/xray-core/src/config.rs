//! Pipeline configuration.
//!
//! Every section carries `#[serde(default)]`, so a configuration file only
//! needs to name the values it overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::classes::ClassMap;
use crate::error::Result;

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Dataset locations and sample geometry
    pub data: DataConfig,

    /// Network construction
    pub model: ModelSettings,

    /// Optimizer settings
    pub train: TrainSettings,

    /// Learning-rate schedule
    pub scheduler: SchedulerSettings,

    /// Augmentation applied to the augmented copy of the training set
    pub augment: AugmentSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Root directory of `.png` images
    pub image_root: PathBuf,

    /// Root directory of `.json` annotations
    pub label_root: PathBuf,

    /// Square side length images and masks are resized to
    pub image_size: usize,

    /// Ordered class names (one mask channel each)
    pub classes: ClassMap,

    /// Number of group folds
    pub n_splits: usize,

    /// Fold used for validation
    pub valid_fold: usize,

    /// Training batch size
    pub batch_size: usize,

    /// Validation batch size
    pub valid_batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// HRNet layout YAML
    pub backbone_config: PathBuf,

    /// Optional safetensors checkpoint for the backbone
    pub pretrained_weights: Option<PathBuf>,

    /// Channels each decoder component is projected to
    pub cat_channels: usize,

    /// Side length of every supervision output (defaults to the image size)
    pub output_size: Option<usize>,

    /// Dropout ahead of the classification gate
    pub gate_dropout: f32,

    /// Seed for parameter initialization
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainSettings {
    /// Initial learning rate (the schedule's floor)
    pub lr: f64,

    pub weight_decay: f64,

    /// Loss term weights
    pub focal_weight: f64,
    pub iou_weight: f64,
    pub ms_ssim_weight: f64,
    pub dice_weight: f64,

    /// Seed for shuffling and augmentation
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Length of the first cycle in steps
    pub t_0: usize,

    /// Cycle growth factor
    pub t_mult: usize,

    /// Peak learning rate of the first cycle
    pub eta_max: f64,

    /// Warm-up steps at the start of every cycle
    pub t_up: usize,

    /// Peak decay applied per completed cycle
    pub gamma: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentSettings {
    pub horizontal_flip_p: f64,

    /// Maximum absolute rotation in degrees
    pub rotate_limit: f32,
    pub rotate_p: f64,

    pub brightness_limit: f32,
    pub contrast_limit: f32,
    pub brightness_contrast_p: f64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            image_root: PathBuf::from("data/train/DCM"),
            label_root: PathBuf::from("data/train/outputs_json"),
            image_size: 512,
            classes: ClassMap::hand_bones(),
            n_splits: 4,
            valid_fold: 1,
            batch_size: 2,
            valid_batch_size: 1,
        }
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            backbone_config: PathBuf::from("configs/hrnet_w64.yaml"),
            pretrained_weights: None,
            cat_channels: 64,
            output_size: None,
            gate_dropout: 0.3,
            seed: 21,
        }
    }
}

impl Default for TrainSettings {
    fn default() -> Self {
        Self {
            lr: 3e-7,
            weight_decay: 5e-5,
            focal_weight: 1.0,
            iou_weight: 1.0,
            ms_ssim_weight: 1.0,
            dice_weight: 0.0,
            seed: 21,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            t_0: 50,
            t_mult: 2,
            eta_max: 3e-4,
            t_up: 8,
            gamma: 0.5,
        }
    }
}

impl Default for AugmentSettings {
    fn default() -> Self {
        Self {
            horizontal_flip_p: 1.0,
            rotate_limit: 14.0,
            rotate_p: 0.5,
            brightness_limit: 0.25,
            contrast_limit: 0.25,
            brightness_contrast_p: 0.8,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from file, with `XRAY__SECTION__KEY` environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("XRAY").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("XRAY").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Output side length of the supervision heads
    pub fn output_size(&self) -> usize {
        self.model.output_size.unwrap_or(self.data.image_size)
    }
}
