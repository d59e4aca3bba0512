//! Deep-supervision segmentation loss.
//!
//! L = w_focal·L_focal + w_iou·L_iou + w_ms_ssim·L_ms_ssim + w_dice·L_dice
//!
//! Every term takes raw logits and compares their sigmoid against binary
//! masks. The stacked training output carries five supervision levels along
//! the batch axis, so targets are repeated to match (see [`repeat_target`]).

use candle_core::{Result, Tensor};
use xray_core::TrainSettings;

/// Smoothing term of the overlap losses
const SMOOTH: f64 = 1.0;

/// Per-scale exponents of MS-SSIM, finest first
const MS_SSIM_WEIGHTS: [f64; 5] = [0.0448, 0.2856, 0.3001, 0.2363, 0.1333];
const SSIM_WINDOW: usize = 11;
const SSIM_SIGMA: f64 = 1.5;
/// Stabilizers for a unit dynamic range: (0.01)² and (0.03)²
const SSIM_C1: f64 = 1e-4;
const SSIM_C2: f64 = 9e-4;

/// Configuration for the combined loss
#[derive(Debug, Clone)]
pub struct LossConfig {
    pub focal_weight: f64,
    pub iou_weight: f64,
    pub ms_ssim_weight: f64,
    pub dice_weight: f64,
    /// Focal balancing factor
    pub alpha: f64,
    /// Focal focusing exponent
    pub gamma: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            focal_weight: 1.0,
            iou_weight: 1.0,
            ms_ssim_weight: 1.0,
            dice_weight: 0.0,
            alpha: 0.25,
            gamma: 2.0,
        }
    }
}

impl LossConfig {
    pub fn from_settings(settings: &TrainSettings) -> Self {
        Self {
            focal_weight: settings.focal_weight,
            iou_weight: settings.iou_weight,
            ms_ssim_weight: settings.ms_ssim_weight,
            dice_weight: settings.dice_weight,
            ..Default::default()
        }
    }
}

/// Individual loss terms, kept for logging
#[derive(Debug, Clone)]
pub struct LossComponents {
    pub focal: Tensor,
    pub iou: Tensor,
    pub ms_ssim: Tensor,
    pub dice: Tensor,
    pub total: Tensor,
}

/// Host copies of [`LossComponents`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossValues {
    pub total: f32,
    pub focal: f32,
    pub iou: f32,
    pub ms_ssim: f32,
    pub dice: f32,
}

impl LossComponents {
    pub fn values(&self) -> Result<LossValues> {
        Ok(LossValues {
            total: self.total.to_scalar()?,
            focal: self.focal.to_scalar()?,
            iou: self.iou.to_scalar()?,
            ms_ssim: self.ms_ssim.to_scalar()?,
            dice: self.dice.to_scalar()?,
        })
    }
}

/// Weighted focal + IoU + MS-SSIM + Dice loss
#[derive(Debug, Clone)]
pub struct CombinedLoss {
    config: LossConfig,
}

impl CombinedLoss {
    pub fn new(config: LossConfig) -> Self {
        Self { config }
    }

    /// Loss over `[batch, classes, h, w]` logits and same-shape binary targets
    pub fn forward(&self, logits: &Tensor, target: &Tensor) -> Result<LossComponents> {
        if logits.dims() != target.dims() {
            candle_core::bail!(
                "loss shape mismatch: logits {:?}, target {:?}",
                logits.dims(),
                target.dims()
            );
        }
        let target = target.to_dtype(logits.dtype())?;
        let probs = candle_nn::ops::sigmoid(logits)?;

        let focal = self.focal_loss(logits, &target)?;
        let iou = iou_loss(&probs, &target)?;
        let ms_ssim = ms_ssim_loss(&probs, &target)?;
        let dice = dice_loss(&probs, &target)?;

        let total = (&focal * self.config.focal_weight)?;
        let total = (total + (&iou * self.config.iou_weight)?)?;
        let total = (total + (&ms_ssim * self.config.ms_ssim_weight)?)?;
        let total = (total + (&dice * self.config.dice_weight)?)?;

        Ok(LossComponents {
            focal,
            iou,
            ms_ssim,
            dice,
            total,
        })
    }

    /// α (1 − p_t)^γ · BCE, averaged over every element
    pub fn focal_loss(&self, logits: &Tensor, target: &Tensor) -> Result<Tensor> {
        let bce = bce_with_logits(logits, target)?;
        let pt = bce.neg()?.exp()?;
        let modulation = (1.0 - pt)?.powf(self.config.gamma)?;
        ((modulation * &bce)? * self.config.alpha)?.mean_all()
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }
}

/// Element-wise binary cross-entropy on logits
///
/// max(x, 0) − x·t + log(1 + e^(−|x|))
fn bce_with_logits(logits: &Tensor, target: &Tensor) -> Result<Tensor> {
    let softplus = (logits.abs()?.neg()?.exp()? + 1.0)?.log()?;
    ((logits.relu()? - (logits * target)?)? + softplus)
}

/// Per-(example, class) sums over the spatial axes
fn spatial_sum(x: &Tensor) -> Result<Tensor> {
    x.sum((2, 3))
}

/// 1 − mean soft IoU
pub fn iou_loss(probs: &Tensor, target: &Tensor) -> Result<Tensor> {
    let intersection = spatial_sum(&(probs * target)?)?;
    let union = ((spatial_sum(probs)? + spatial_sum(target)?)? - &intersection)?;
    let iou = ((intersection + SMOOTH)? / (union + SMOOTH)?)?;
    1.0 - iou.mean_all()?
}

/// 1 − mean soft Dice
pub fn dice_loss(probs: &Tensor, target: &Tensor) -> Result<Tensor> {
    let intersection = spatial_sum(&(probs * target)?)?;
    let denominator = (spatial_sum(probs)? + spatial_sum(target)?)?;
    let dice = (((intersection * 2.0)? + SMOOTH)? / (denominator + SMOOTH)?)?;
    1.0 - dice.mean_all()?
}

/// 1 − MS-SSIM between `[batch, classes, h, w]` probabilities and targets.
///
/// Every (example, class) plane is compared on its own with an 11-tap
/// Gaussian window (σ = 1.5, shrunk to the plane size when smaller) and no
/// padding. Contrast-structure terms of the first four scales and the full
/// SSIM of the last are mapped to `[0, 1]` with `(x + 1) / 2`, then combined
/// as a weighted geometric product. Scales stop early once a plane is too
/// small to halve.
pub fn ms_ssim_loss(probs: &Tensor, target: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = probs.dims4()?;
    let mut x = probs.reshape((b * c, 1, h, w))?;
    let mut y = target.to_dtype(probs.dtype())?.reshape((b * c, 1, h, w))?;

    let mut factors = Vec::with_capacity(MS_SSIM_WEIGHTS.len());
    for (level, &weight) in MS_SSIM_WEIGHTS.iter().enumerate() {
        let (ssim, cs) = ssim_terms(&x, &y)?;
        let (_, _, h, w) = x.dims4()?;
        let last = level + 1 == MS_SSIM_WEIGHTS.len() || h.min(w) < 2;

        let term = if last { ssim } else { cs };
        let normalized = ((term + 1.0)? / 2.0)?;
        factors.push(normalized.powf(weight)?);
        if last {
            break;
        }

        x = x.avg_pool2d(2)?;
        y = y.avg_pool2d(2)?;
    }

    let mut score = factors[0].clone();
    for factor in &factors[1..] {
        score = (score * factor)?;
    }
    1.0 - score
}

/// Mean SSIM and mean contrast-structure term of `[n, 1, h, w]` planes
fn ssim_terms(x: &Tensor, y: &Tensor) -> Result<(Tensor, Tensor)> {
    let (_, _, h, w) = x.dims4()?;
    let size = SSIM_WINDOW.min(h).min(w);
    let window = gaussian_window(size, x)?;

    let mu_x = gaussian_filter(x, &window)?;
    let mu_y = gaussian_filter(y, &window)?;
    let mu_xx = mu_x.sqr()?;
    let mu_yy = mu_y.sqr()?;
    let mu_xy = (&mu_x * &mu_y)?;

    let sigma_xx = (gaussian_filter(&x.sqr()?, &window)? - &mu_xx)?;
    let sigma_yy = (gaussian_filter(&y.sqr()?, &window)? - &mu_yy)?;
    let sigma_xy = (gaussian_filter(&(x * y)?, &window)? - &mu_xy)?;

    let v1 = ((sigma_xy * 2.0)? + SSIM_C2)?;
    let v2 = ((sigma_xx + sigma_yy)? + SSIM_C2)?;
    let cs_map = (&v1 / &v2)?;

    let luminance = (((mu_xy * 2.0)? + SSIM_C1)? / ((mu_xx + mu_yy)? + SSIM_C1)?)?;
    let ssim_map = (luminance * &cs_map)?;

    Ok((ssim_map.mean_all()?, cs_map.mean_all()?))
}

/// Normalized 1-D Gaussian as a `[1, 1, 1, size]` kernel on `like`'s device
fn gaussian_window(size: usize, like: &Tensor) -> Result<Tensor> {
    let center = (size as f64 - 1.0) / 2.0;
    let taps: Vec<f32> = (0..size)
        .map(|i| (-(i as f64 - center).powi(2) / (2.0 * SSIM_SIGMA * SSIM_SIGMA)).exp() as f32)
        .collect();
    let sum: f32 = taps.iter().sum();
    let taps: Vec<f32> = taps.into_iter().map(|t| t / sum).collect();

    Tensor::from_vec(taps, (1, 1, 1, size), like.device())?.to_dtype(like.dtype())
}

/// Separable valid convolution: rows, then columns
fn gaussian_filter(x: &Tensor, window: &Tensor) -> Result<Tensor> {
    let rows = x.conv2d(window, 0, 1, 1, 1)?;
    let column = window.transpose(2, 3)?.contiguous()?;
    rows.conv2d(&column, 0, 1, 1, 1)
}

/// Repeat a `[batch, ...]` target `times` along the batch axis
pub fn repeat_target(target: &Tensor, times: usize) -> Result<Tensor> {
    let copies = vec![target.clone(); times];
    Tensor::cat(&copies, 0)
}
