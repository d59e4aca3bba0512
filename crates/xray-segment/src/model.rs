//! UNet3+ over HRNet: encoder → dense fusion decoder → gated deep supervision.

use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use xray_core::{Error, PipelineConfig, Result};

use crate::decoder::{DecoderConfig, DenseFusionDecoder, FUSED_SOURCES};
use crate::encoder::{load_backbone_weights, EncoderConfig, MultiResolutionEncoder, INPUT_MULTIPLE};
use crate::heads::{gate_predictions, ClassificationGate, SupervisionHeads};
use crate::hrnet::HrNetConfig;
use crate::init::SeededVarMap;
use crate::layers::parameter_count;

/// Variable-name prefix of every backbone parameter
pub const BACKBONE_PREFIX: &str = "encoder.backbone";

/// Number of supervised outputs (d1..d5)
pub const SUPERVISION_LEVELS: usize = 5;

/// Complete model configuration
#[derive(Debug, Clone)]
pub struct UNet3PlusConfig {
    /// Output channels (one per bone class)
    pub n_classes: usize,
    /// Nominal input side length
    pub image_size: usize,
    /// Side length of every output map
    pub output_size: usize,
    /// Width of the full-resolution stem
    pub stem_channels: usize,
    /// Width of each projected decoder component
    pub cat_channels: usize,
    /// Dropout ahead of the classification gate
    pub gate_dropout: f32,
    pub backbone: HrNetConfig,
}

impl Default for UNet3PlusConfig {
    fn default() -> Self {
        Self {
            n_classes: xray_core::HAND_BONE_CLASSES.len(),
            image_size: 512,
            output_size: 512,
            stem_channels: 64,
            cat_channels: 64,
            gate_dropout: 0.3,
            backbone: HrNetConfig::w64(),
        }
    }
}

impl UNet3PlusConfig {
    /// Build from pipeline settings, reading the backbone layout file
    pub fn from_settings(settings: &PipelineConfig) -> Result<Self> {
        let backbone = HrNetConfig::from_yaml_file(&settings.model.backbone_config)?;
        Ok(Self {
            n_classes: settings.data.classes.len(),
            image_size: settings.data.image_size,
            output_size: settings.output_size(),
            stem_channels: 64,
            cat_channels: settings.model.cat_channels,
            gate_dropout: settings.model.gate_dropout,
            backbone,
        })
    }

    pub fn up_channels(&self) -> usize {
        self.cat_channels * FUSED_SOURCES
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_classes == 0 {
            return Err(Error::Config("n_classes must be positive".to_string()));
        }
        if self.image_size == 0 || self.image_size % INPUT_MULTIPLE != 0 {
            return Err(Error::Config(format!(
                "image_size {} must be a positive multiple of {INPUT_MULTIPLE}",
                self.image_size
            )));
        }
        if self.output_size == 0 || self.cat_channels == 0 || self.stem_channels == 0 {
            return Err(Error::Config(
                "output_size, cat_channels and stem_channels must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.gate_dropout) {
            return Err(Error::Config(format!(
                "gate_dropout {} must lie in [0, 1)",
                self.gate_dropout
            )));
        }
        self.backbone.validate()
    }

    fn encoder_config(&self) -> EncoderConfig {
        EncoderConfig {
            stem_channels: self.stem_channels,
            backbone: self.backbone.clone(),
        }
    }
}

/// Forward-pass mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Dropout active, batch statistics, all five outputs stacked
    Train,
    /// Running statistics, finest output only
    Eval,
}

impl Mode {
    pub fn is_train(self) -> bool {
        matches!(self, Mode::Train)
    }
}

/// Gated outputs of every supervision level
#[derive(Debug, Clone)]
pub struct DeepSupervision {
    /// d1..d5, each `[batch, n_classes, output_size, output_size]`
    pub outputs: [Tensor; SUPERVISION_LEVELS],
    /// Per-class presence score, `[batch, n_classes]`
    pub presence: Tensor,
}

impl DeepSupervision {
    /// Outputs concatenated along the batch axis in order d1..d5
    pub fn stacked(&self) -> Result<Tensor> {
        Ok(Tensor::cat(&self.outputs, 0)?)
    }

    pub fn finest(&self) -> &Tensor {
        &self.outputs[0]
    }
}

/// Hand bone segmentation network
#[derive(Debug, Clone)]
pub struct UNet3PlusHrNet {
    encoder: MultiResolutionEncoder,
    decoder: DenseFusionDecoder,
    gate: ClassificationGate,
    heads: SupervisionHeads,
    config: UNet3PlusConfig,
}

impl UNet3PlusHrNet {
    pub fn new(config: UNet3PlusConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let encoder = MultiResolutionEncoder::new(config.encoder_config(), vb.pp("encoder"))?;
        let level_channels = encoder.level_channels();

        let decoder = DenseFusionDecoder::new(
            DecoderConfig {
                level_channels,
                cat_channels: config.cat_channels,
            },
            vb.pp("decoder"),
        )?;

        let hd5_channels = level_channels[4];
        let gate = ClassificationGate::new(
            hd5_channels,
            config.n_classes,
            config.gate_dropout,
            vb.pp("cls"),
        )?;

        let up = config.up_channels();
        let heads = SupervisionHeads::new(
            [up, up, up, up, hd5_channels],
            config.n_classes,
            config.output_size,
            vb.pp("heads"),
        )?;

        Ok(Self {
            encoder,
            decoder,
            gate,
            heads,
            config,
        })
    }

    /// Build with seeded initialization and optional pretrained backbone weights.
    ///
    /// Returns the model and the variable map holding its parameters.
    pub fn initialize(
        config: UNet3PlusConfig,
        seed: u64,
        pretrained: Option<&Path>,
        device: &Device,
    ) -> Result<(Self, VarMap)> {
        let varmap = VarMap::new();
        let vb = SeededVarMap::new(varmap.clone(), seed).into_var_builder(DType::F32, device);
        let model = Self::new(config, vb)?;

        load_backbone_weights(&varmap, BACKBONE_PREFIX, pretrained)?;

        let params = parameter_count(varmap.all_vars().iter().map(Var::as_tensor));
        tracing::info!(
            params,
            seed,
            level_channels = ?model.encoder.level_channels(),
            n_classes = model.config.n_classes,
            "Initialized UNet3+ HRNet model"
        );

        Ok((model, varmap))
    }

    /// All five gated outputs and the presence scores
    pub fn forward_supervision(&self, x: &Tensor, mode: Mode) -> Result<DeepSupervision> {
        let train = mode.is_train();

        let features = self.encoder.forward_t(x, train)?;
        let levels = self.decoder.forward_t(&features, train)?;
        let presence = self.gate.forward_t(&features.hd5, train)?;

        let raw = self.heads.forward([
            &levels.hd1,
            &levels.hd2,
            &levels.hd3,
            &levels.hd4,
            &features.hd5,
        ])?;
        let gated = raw
            .iter()
            .map(|seg| gate_predictions(seg, &presence))
            .collect::<Result<Vec<_>>>()?;

        let outputs: [Tensor; SUPERVISION_LEVELS] = gated
            .try_into()
            .map_err(|_| Error::InvalidInput("expected five supervision outputs".to_string()))?;

        Ok(DeepSupervision { outputs, presence })
    }

    /// Training: `[5 × batch, C, S, S]` stacked d1..d5. Eval: d1 only.
    pub fn forward(&self, x: &Tensor, mode: Mode) -> Result<Tensor> {
        let supervision = self.forward_supervision(x, mode)?;
        match mode {
            Mode::Train => supervision.stacked(),
            Mode::Eval => Ok(supervision.finest().clone()),
        }
    }

    pub fn freeze_backbone(&self) {
        self.encoder.freeze();
    }

    pub fn unfreeze_backbone(&self) {
        self.encoder.unfreeze();
    }

    pub fn is_backbone_frozen(&self) -> bool {
        self.encoder.is_frozen()
    }

    /// Variables the optimizer should update, sorted by name.
    ///
    /// Batch-norm running statistics are never included; backbone
    /// parameters are left out while the backbone is frozen.
    pub fn trainable_vars(&self, varmap: &VarMap) -> Result<Vec<Var>> {
        let backbone = format!("{BACKBONE_PREFIX}.");
        let frozen = self.is_backbone_frozen();
        select_vars(varmap, |name| !(frozen && name.starts_with(&backbone)))
    }

    /// Every optimizable variable regardless of the freeze state, sorted by name
    pub fn parameter_vars(&self, varmap: &VarMap) -> Result<Vec<Var>> {
        select_vars(varmap, |_| true)
    }

    pub fn config(&self) -> &UNet3PlusConfig {
        &self.config
    }
}

/// Batch-norm buffers updated by the forward pass, not by the optimizer
pub fn is_running_statistic(name: &str) -> bool {
    name.ends_with(".running_mean") || name.ends_with(".running_var")
}

fn select_vars(varmap: &VarMap, keep: impl Fn(&str) -> bool) -> Result<Vec<Var>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::InvalidInput("variable map lock poisoned".to_string()))?;

    let mut named: Vec<(&String, &Var)> = data
        .iter()
        .filter(|(name, _)| !is_running_statistic(name) && keep(name))
        .collect();
    named.sort_by(|a, b| a.0.cmp(b.0));

    Ok(named.into_iter().map(|(_, var)| var.clone()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> UNet3PlusConfig {
        UNet3PlusConfig {
            n_classes: 3,
            image_size: 64,
            output_size: 64,
            stem_channels: 8,
            cat_channels: 4,
            gate_dropout: 0.3,
            backbone: HrNetConfig::with_widths(4, [1, 1, 1, 1], [1, 1, 1, 1]),
        }
    }

    #[test]
    fn test_training_and_inference_shapes() -> Result<()> {
        let device = Device::Cpu;
        let (model, _varmap) = UNet3PlusHrNet::initialize(tiny_config(), 21, None, &device)?;

        let x = Tensor::randn(0f32, 1.0, (2, 3, 64, 64), &device)?;
        assert_eq!(model.forward(&x, Mode::Train)?.dims(), &[10, 3, 64, 64]);
        assert_eq!(model.forward(&x, Mode::Eval)?.dims(), &[2, 3, 64, 64]);
        Ok(())
    }

    #[test]
    fn test_output_size_is_independent_of_input_size() -> Result<()> {
        let device = Device::Cpu;
        let config = UNet3PlusConfig {
            output_size: 48,
            ..tiny_config()
        };
        let (model, _varmap) = UNet3PlusHrNet::initialize(config, 21, None, &device)?;

        for side in [32, 96] {
            let x = Tensor::randn(0f32, 1.0, (1, 3, side, side), &device)?;
            let supervision = model.forward_supervision(&x, Mode::Eval)?;
            for out in &supervision.outputs {
                assert_eq!(out.dims(), &[1, 3, 48, 48]);
            }
        }
        Ok(())
    }

    #[test]
    fn test_presence_scores_are_probabilities() -> Result<()> {
        let device = Device::Cpu;
        let (model, _varmap) = UNet3PlusHrNet::initialize(tiny_config(), 21, None, &device)?;

        let x = Tensor::randn(0f32, 1.0, (2, 3, 64, 64), &device)?;
        let presence = model.forward_supervision(&x, Mode::Train)?.presence;
        assert_eq!(presence.dims(), &[2, 3]);

        let values: Vec<f32> = presence.flatten_all()?.to_vec1()?;
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
        Ok(())
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        let device = Device::Cpu;
        let config = UNet3PlusConfig {
            image_size: 100,
            ..tiny_config()
        };
        assert!(matches!(
            UNet3PlusHrNet::initialize(config, 0, None, &device),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_frozen_backbone_receives_no_gradients() -> Result<()> {
        let device = Device::Cpu;
        let (model, varmap) = UNet3PlusHrNet::initialize(tiny_config(), 21, None, &device)?;
        model.freeze_backbone();

        let x = Tensor::randn(0f32, 1.0, (2, 3, 64, 64), &device)?;
        let loss = model.forward(&x, Mode::Train)?.sqr()?.mean_all()?;
        let grads = loss.backward()?;

        let data = varmap.data().lock().unwrap();
        let backbone = format!("{BACKBONE_PREFIX}.");
        let mut decoder_grads = 0;
        for (name, var) in data.iter() {
            if name.starts_with(&backbone) {
                assert!(grads.get(var.as_tensor()).is_none(), "{name} has a gradient");
            } else if name.starts_with("decoder.") && !is_running_statistic(name) {
                if grads.get(var.as_tensor()).is_some() {
                    decoder_grads += 1;
                }
            }
        }
        assert!(decoder_grads > 0);

        // The stem sits outside the backbone and keeps learning
        let stem = &data["encoder.stem.conv.weight"];
        assert!(grads.get(stem.as_tensor()).is_some());
        Ok(())
    }

    #[test]
    fn test_trainable_vars_follow_freeze_state() -> Result<()> {
        let device = Device::Cpu;
        let (model, varmap) = UNet3PlusHrNet::initialize(tiny_config(), 21, None, &device)?;

        let all = model.trainable_vars(&varmap)?.len();
        model.freeze_backbone();
        let frozen = model.trainable_vars(&varmap)?.len();
        model.unfreeze_backbone();

        assert!(frozen < all);
        assert_eq!(model.trainable_vars(&varmap)?.len(), all);
        model.freeze_backbone();
        assert_eq!(model.parameter_vars(&varmap)?.len(), all);
        model.unfreeze_backbone();

        let buffers = varmap
            .data()
            .lock()
            .unwrap()
            .keys()
            .filter(|k| is_running_statistic(k))
            .count();
        assert_eq!(all + buffers, varmap.all_vars().len());
        Ok(())
    }

    #[test]
    fn test_conv_bias_outside_backbone_only() -> Result<()> {
        let device = Device::Cpu;
        let (_, varmap) = UNet3PlusHrNet::initialize(tiny_config(), 2, None, &device)?;
        let data = varmap.data().lock().unwrap();

        for name in [
            "encoder.stem.conv.bias",
            "encoder.reproject.conv.bias",
            "decoder.conv1d_1.conv.bias",
        ] {
            let bias = data.get(name).unwrap_or_else(|| panic!("{name} missing"));
            let values = bias.as_tensor().to_vec1::<f32>()?;
            assert!(values.iter().all(|&v| v == 0.0), "{name} starts at zero");
        }

        assert!(!data.contains_key("encoder.stem_block.conv1.conv.bias"));
        assert!(!data
            .keys()
            .any(|k| k.starts_with(BACKBONE_PREFIX) && k.ends_with(".conv.bias")));
        Ok(())
    }

    #[test]
    fn test_same_seed_same_initial_parameters() -> Result<()> {
        let device = Device::Cpu;
        let snapshot = |seed: u64| -> Result<Vec<(String, Vec<f32>)>> {
            let (_, varmap) = UNet3PlusHrNet::initialize(tiny_config(), seed, None, &device)?;
            let data = varmap.data().lock().unwrap();
            let mut out = Vec::with_capacity(data.len());
            for (name, var) in data.iter() {
                out.push((name.clone(), var.as_tensor().flatten_all()?.to_vec1::<f32>()?));
            }
            out.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(out)
        };

        let a = snapshot(5)?;
        assert_eq!(a, snapshot(5)?);
        assert_ne!(a, snapshot(6)?);
        Ok(())
    }

    #[test]
    #[ignore = "full-size model, slow on CPU"]
    fn test_full_size_hand_bone_shapes() -> Result<()> {
        let device = Device::Cpu;
        let (model, _varmap) =
            UNet3PlusHrNet::initialize(UNet3PlusConfig::default(), 21, None, &device)?;

        let x = Tensor::randn(0f32, 1.0, (2, 3, 512, 512), &device)?;
        assert_eq!(model.forward(&x, Mode::Train)?.dims(), &[10, 29, 512, 512]);
        assert_eq!(model.forward(&x, Mode::Eval)?.dims(), &[2, 29, 512, 512]);
        Ok(())
    }
}
