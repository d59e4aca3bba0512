//! Batching with parallel sample materialization.

use std::sync::Arc;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use xray_core::{Error, Result};

use crate::dataset::{Dataset, Sample};

/// Loader configuration
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    /// Drop a trailing batch smaller than `batch_size`
    pub drop_last: bool,
    /// Seed for shuffling and per-sample augmentation
    pub seed: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 2,
            shuffle: true,
            drop_last: true,
            seed: 21,
        }
    }
}

/// Stacked batch
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[batch, 3, H, W]`
    pub images: Tensor,
    /// `[batch, n_classes, H, W]`
    pub masks: Tensor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.images.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    config: LoaderConfig,
    device: Device,
}

impl DataLoader {
    pub fn new(dataset: Arc<dyn Dataset>, config: LoaderConfig, device: Device) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".to_string()));
        }
        Ok(Self {
            dataset,
            config,
            device,
        })
    }

    /// Sample indices of every batch for `epoch`
    pub fn plan(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }

        order
            .chunks(self.config.batch_size)
            .filter(|c| !self.config.drop_last || c.len() == self.config.batch_size)
            .map(<[usize]>::to_vec)
            .collect()
    }

    pub fn num_batches(&self) -> usize {
        let n = self.dataset.len();
        let b = self.config.batch_size;
        if self.config.drop_last {
            n / b
        } else {
            n.div_ceil(b)
        }
    }

    /// Load and stack the given samples, materializing them in parallel
    pub fn load_batch(&self, indices: &[usize], epoch: usize) -> Result<Batch> {
        if indices.is_empty() {
            return Err(Error::InvalidInput("cannot load an empty batch".to_string()));
        }

        let samples: Vec<Sample> = indices
            .par_iter()
            .map(|&index| {
                let mut rng = StdRng::seed_from_u64(sample_seed(self.config.seed, epoch, index));
                self.dataset.get(index, &mut rng)
            })
            .collect::<Result<Vec<_>>>()?;

        stack(&samples, &self.device)
    }

    /// Batches of `epoch`, in order
    pub fn iter(&self, epoch: usize) -> impl Iterator<Item = Result<Batch>> + '_ {
        self.plan(epoch)
            .into_iter()
            .map(move |indices| self.load_batch(&indices, epoch))
    }

    pub fn dataset(&self) -> &Arc<dyn Dataset> {
        &self.dataset
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }
}

/// Independent stream per (seed, epoch, sample)
fn sample_seed(seed: u64, epoch: usize, index: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (epoch as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F)
        ^ index as u64
}

fn stack(samples: &[Sample], device: &Device) -> Result<Batch> {
    let first = &samples[0];
    let (size, n_classes) = (first.size, first.n_classes);
    if let Some(bad) = samples
        .iter()
        .find(|s| s.size != size || s.n_classes != n_classes)
    {
        return Err(Error::ShapeMismatch {
            context: "batch stacking".to_string(),
            expected: format!("{n_classes} classes at {size}x{size}"),
            actual: format!("{} classes at {}x{}", bad.n_classes, bad.size, bad.size),
        });
    }

    let b = samples.len();
    let images: Vec<f32> = samples.iter().flat_map(|s| s.image.iter().copied()).collect();
    let masks: Vec<f32> = samples.iter().flat_map(|s| s.mask.iter().copied()).collect();

    Ok(Batch {
        images: Tensor::from_vec(images, (b, 3, size, size), device)?,
        masks: Tensor::from_vec(masks, (b, n_classes, size, size), device)?,
    })
}
