//! Optimization and validation steps.

use std::path::Path;

use candle_core::{DType, Tensor, D};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use candle_nn::VarMap;
use xray_core::{Error, PipelineConfig, Result};
use xray_data::Batch;
use xray_segment::{Mode, UNet3PlusHrNet, SUPERVISION_LEVELS};

use crate::loss::{repeat_target, CombinedLoss, LossConfig};
use crate::scheduler::{CosineAnnealingWarmUpRestarts, LrScheduler};

/// Binarization threshold for validation Dice
const DICE_THRESHOLD: f64 = 0.5;
const DICE_EPS: f64 = 1e-4;

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    /// Learning rate before the first schedule step
    pub lr: f64,
    pub weight_decay: f64,
    pub loss: LossConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            lr: 3e-7,
            weight_decay: 5e-5,
            loss: LossConfig::default(),
        }
    }
}

/// Scalar results of one optimization step
#[derive(Debug, Clone, Copy)]
pub struct StepOutput {
    pub loss: f32,
    pub focal: f32,
    pub iou: f32,
    pub ms_ssim: f32,
    pub dice: f32,
    /// Learning rate the step was taken with
    pub lr: f64,
}

/// Results of one validation batch
#[derive(Debug, Clone)]
pub struct ValidationOutput {
    pub loss: f32,
    /// Thresholded Dice per class, averaged over the batch
    pub dice_per_class: Vec<f32>,
}

/// Drives AdamW over a model's variables.
///
/// The optimizer is given every non-buffer variable once. While the backbone
/// is frozen its weights are detached in the forward pass, so they receive no
/// gradient and AdamW leaves them untouched, weight decay included.
pub struct Trainer {
    model: UNet3PlusHrNet,
    varmap: VarMap,
    optimizer: AdamW,
    loss: CombinedLoss,
    scheduler: Box<dyn LrScheduler>,
    steps: usize,
}

impl Trainer {
    pub fn new(
        model: UNet3PlusHrNet,
        varmap: VarMap,
        config: TrainerConfig,
        scheduler: Box<dyn LrScheduler>,
    ) -> Result<Self> {
        let vars = model.parameter_vars(&varmap)?;
        if vars.is_empty() {
            return Err(Error::InvalidInput("model has no trainable variables".to_string()));
        }

        let params = ParamsAdamW {
            lr: config.lr,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let optimizer = AdamW::new(vars, params)?;

        tracing::info!(
            lr = config.lr,
            weight_decay = config.weight_decay,
            trainable = model.trainable_vars(&varmap)?.len(),
            backbone_frozen = model.is_backbone_frozen(),
            "Created trainer"
        );

        Ok(Self {
            model,
            varmap,
            optimizer,
            loss: CombinedLoss::new(config.loss),
            scheduler,
            steps: 0,
        })
    }

    /// AdamW plus cosine warm restarts, both from pipeline settings
    pub fn from_settings(
        model: UNet3PlusHrNet,
        varmap: VarMap,
        settings: &PipelineConfig,
    ) -> Result<Self> {
        let train = &settings.train;
        let scheduler = CosineAnnealingWarmUpRestarts::new(train.lr, &settings.scheduler)?;
        let config = TrainerConfig {
            lr: train.lr,
            weight_decay: train.weight_decay,
            loss: LossConfig::from_settings(train),
        };
        Self::new(model, varmap, config, Box::new(scheduler))
    }

    /// Forward in training mode, loss over all supervision levels, one update
    pub fn step(&mut self, batch: &Batch) -> Result<StepOutput> {
        let logits = self.model.forward(&batch.images, Mode::Train)?;
        let target = repeat_target(&batch.masks, SUPERVISION_LEVELS)?;
        let parts = self.loss.forward(&logits, &target)?;

        self.optimizer.backward_step(&parts.total)?;
        self.steps += 1;

        let values = parts.values()?;
        let lr = self.optimizer.learning_rate();
        tracing::debug!(
            step = self.steps,
            loss = values.total,
            focal = values.focal,
            iou = values.iou,
            ms_ssim = values.ms_ssim,
            dice = values.dice,
            lr,
            "Training step"
        );

        Ok(StepOutput {
            loss: values.total,
            focal: values.focal,
            iou: values.iou,
            ms_ssim: values.ms_ssim,
            dice: values.dice,
            lr,
        })
    }

    /// Advance the schedule and hand its rate to the optimizer
    pub fn advance_schedule(&mut self) -> f64 {
        let lr = self.scheduler.step();
        self.optimizer.set_learning_rate(lr);
        lr
    }

    /// Loss and per-class Dice of the finest output, without updating anything
    pub fn validate(&self, batch: &Batch) -> Result<ValidationOutput> {
        let logits = self.model.forward(&batch.images, Mode::Eval)?.detach();
        let parts = self.loss.forward(&logits, &batch.masks)?;
        let loss = parts.values()?.total;

        let probs = candle_nn::ops::sigmoid(&logits)?;
        let dice_per_class = thresholded_dice(&probs, &batch.masks)?.to_vec1::<f32>()?;

        Ok(ValidationOutput {
            loss,
            dice_per_class,
        })
    }

    pub fn freeze_backbone(&self) {
        self.model.freeze_backbone();
    }

    pub fn unfreeze_backbone(&self) {
        self.model.unfreeze_backbone();
    }

    /// Write every variable, running statistics included, as safetensors
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.varmap.save(path)?;
        tracing::info!(path = %path.display(), steps = self.steps, "Saved checkpoint");
        Ok(())
    }

    /// Overwrite the current variables from a safetensors checkpoint
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.varmap.load(path)?;
        tracing::info!(path = %path.display(), "Loaded checkpoint");
        Ok(())
    }

    pub fn lr(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn model(&self) -> &UNet3PlusHrNet {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

/// `(2·|P∩T| + ε) / (|P| + |T| + ε)` per class, averaged over the batch
fn thresholded_dice(probs: &Tensor, target: &Tensor) -> Result<Tensor> {
    let pred = probs.ge(DICE_THRESHOLD)?.to_dtype(DType::F32)?.flatten_from(2)?;
    let target = target.to_dtype(DType::F32)?.flatten_from(2)?;

    let intersection = (&pred * &target)?.sum(D::Minus1)?;
    let denominator = (pred.sum(D::Minus1)? + target.sum(D::Minus1)?)?;
    let dice = (((intersection * 2.0)? + DICE_EPS)? / (denominator + DICE_EPS)?)?;
    Ok(dice.mean(0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ConstantLr;
    use candle_core::Device;
    use xray_segment::{HrNetConfig, UNet3PlusConfig, BACKBONE_PREFIX};

    const N_CLASSES: usize = 3;

    fn tiny_config() -> UNet3PlusConfig {
        UNet3PlusConfig {
            n_classes: N_CLASSES,
            image_size: 64,
            output_size: 64,
            stem_channels: 8,
            cat_channels: 4,
            gate_dropout: 0.3,
            backbone: HrNetConfig::with_widths(4, [1, 1, 1, 1], [1, 1, 1, 1]),
        }
    }

    fn trainer(seed: u64, lr: f64) -> Result<Trainer> {
        let (model, varmap) = UNet3PlusHrNet::initialize(tiny_config(), seed, None, &Device::Cpu)?;
        let config = TrainerConfig {
            lr,
            ..Default::default()
        };
        Trainer::new(model, varmap, config, Box::new(ConstantLr(lr)))
    }

    fn batch() -> Result<Batch> {
        let device = Device::Cpu;
        let images = Tensor::randn(0f32, 1.0, (2, 3, 64, 64), &device)?;
        let masks = Tensor::rand(0f32, 1.0, (2, N_CLASSES, 64, 64), &device)?
            .ge(0.5)?
            .to_dtype(DType::F32)?;
        Ok(Batch { images, masks })
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn snapshot(varmap: &VarMap, name: &str) -> Vec<f32> {
        let data = varmap.data().lock().unwrap();
        data[name].as_tensor().flatten_all().unwrap().to_vec1().unwrap()
    }

    fn first_backbone_weight(varmap: &VarMap) -> String {
        let data = varmap.data().lock().unwrap();
        let mut names: Vec<&String> = data
            .keys()
            .filter(|k| k.starts_with(BACKBONE_PREFIX) && k.ends_with(".weight"))
            .collect();
        names.sort();
        names[0].clone()
    }

    #[test]
    fn test_step_updates_parameters() -> Result<()> {
        init_tracing();
        let mut t = trainer(21, 1e-3)?;
        let name = "decoder.conv1d_1.conv.weight";
        let before = snapshot(t.varmap(), name);

        let out = t.step(&batch()?)?;
        assert!(out.loss.is_finite());
        assert_eq!(t.steps(), 1);
        assert_ne!(before, snapshot(t.varmap(), name));
        Ok(())
    }

    #[test]
    fn test_frozen_backbone_is_not_updated() -> Result<()> {
        let mut t = trainer(21, 1e-2)?;
        let backbone = first_backbone_weight(t.varmap());
        let stem = "encoder.stem.conv.weight";

        t.freeze_backbone();
        let backbone_before = snapshot(t.varmap(), &backbone);
        let stem_before = snapshot(t.varmap(), stem);
        t.step(&batch()?)?;
        assert_eq!(backbone_before, snapshot(t.varmap(), &backbone));
        assert_ne!(stem_before, snapshot(t.varmap(), stem));

        t.unfreeze_backbone();
        t.step(&batch()?)?;
        assert_ne!(backbone_before, snapshot(t.varmap(), &backbone));
        Ok(())
    }

    #[test]
    fn test_validation_reports_dice_per_class() -> Result<()> {
        let t = trainer(21, 1e-3)?;
        let out = t.validate(&batch()?)?;

        assert!(out.loss.is_finite());
        assert_eq!(out.dice_per_class.len(), N_CLASSES);
        assert!(out.dice_per_class.iter().all(|d| (0.0..=1.0).contains(d)));
        Ok(())
    }

    #[test]
    fn test_thresholded_dice() -> Result<()> {
        let device = Device::Cpu;
        // class 0 exact, class 1 half overlap, class 2 empty on both sides
        let probs = Tensor::new(&[[[[0.9f32, 0.9]], [[0.9, 0.1]], [[0.1, 0.1]]]], &device)?;
        let target = Tensor::new(&[[[[1f32, 1.0]], [[1.0, 1.0]], [[0.0, 0.0]]]], &device)?;

        let dice = thresholded_dice(&probs, &target)?.to_vec1::<f32>()?;
        assert!((dice[0] - 1.0).abs() < 1e-4);
        assert!((dice[1] - 2.0 / 3.0).abs() < 1e-3);
        assert!((dice[2] - 1.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_schedule_drives_optimizer() -> Result<()> {
        let mut settings = PipelineConfig::default();
        settings.train.lr = 0.0;
        settings.scheduler.eta_max = 1e-3;
        settings.scheduler.t_0 = 10;
        settings.scheduler.t_up = 2;

        let (model, varmap) = UNet3PlusHrNet::initialize(tiny_config(), 21, None, &Device::Cpu)?;
        let mut t = Trainer::from_settings(model, varmap, &settings)?;
        assert_eq!(t.lr(), 0.0);

        let lr = t.advance_schedule();
        assert!((lr - 5e-4).abs() < 1e-12);
        assert_eq!(t.lr(), lr);
        Ok(())
    }

    #[test]
    fn test_checkpoint_round_trip() -> Result<()> {
        init_tracing();
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.safetensors");
        let x = batch()?;

        let mut a = trainer(1, 1e-3)?;
        a.step(&x)?;
        a.save(&path)?;
        let expected = a.model().forward(&x.images, Mode::Eval)?;

        let mut b = trainer(2, 1e-3)?;
        b.load(&path)?;
        let actual = b.model().forward(&x.images, Mode::Eval)?;

        let diff = (expected - actual)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }
}
