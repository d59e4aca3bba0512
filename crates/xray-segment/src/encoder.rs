//! Multi-resolution encoder.
//!
//! A full-resolution stem feeds the HRNet backbone; the backbone's parallel
//! streams are merged after every stage into one map at the coarsest
//! resolution of that stage. The result is five feature levels at strides
//! 1, 4, 8, 16 and 32.

use std::collections::HashSet;
use std::path::Path;

use candle_core::{Device, ModuleT, Tensor};
use candle_nn::{VarBuilder, VarMap};
use xray_core::{Error, Result};

use crate::hrnet::{reference_key, HrNetBackbone, HrNetConfig};
use crate::layers::{resize_bilinear, ConvBn, GradGate, LayerCtx};
use crate::residual::ResidualBlock;

/// Spatial stride of each encoder level relative to the input
pub const LEVEL_STRIDES: [usize; 5] = [1, 4, 8, 16, 32];

/// Input side lengths must be a multiple of the coarsest stride
pub const INPUT_MULTIPLE: usize = 32;

/// Encoder configuration
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Width of the full-resolution stem (h1)
    pub stem_channels: usize,
    /// Backbone layout
    pub backbone: HrNetConfig,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            stem_channels: 64,
            backbone: HrNetConfig::w64(),
        }
    }
}

impl EncoderConfig {
    /// Channels of h1, h2, h3, h4 and hd5
    pub fn level_channels(&self) -> [usize; 5] {
        let [h2, h3, h4, hd5] = self.backbone.merged_channels();
        [self.stem_channels, h2, h3, h4, hd5]
    }
}

/// Five encoder levels, finest first
#[derive(Debug, Clone)]
pub struct MultiScaleFeatures {
    pub h1: Tensor,
    pub h2: Tensor,
    pub h3: Tensor,
    pub h4: Tensor,
    pub hd5: Tensor,
}

impl MultiScaleFeatures {
    pub fn levels(&self) -> [&Tensor; 5] {
        [&self.h1, &self.h2, &self.h3, &self.h4, &self.hd5]
    }
}

/// Resize every stream to the coarsest one present and concatenate channels
pub fn merge_multi_scale(streams: &[Tensor]) -> candle_core::Result<Tensor> {
    let Some(coarsest) = streams.last() else {
        candle_core::bail!("cannot merge an empty set of streams");
    };
    let (_, _, h, w) = coarsest.dims4()?;

    let resized = streams
        .iter()
        .map(|s| resize_bilinear(s, (h, w), true))
        .collect::<candle_core::Result<Vec<_>>>()?;
    Tensor::cat(&resized, 1)
}

/// Stem, stem residual block, re-projection and HRNet backbone
#[derive(Debug, Clone)]
pub struct MultiResolutionEncoder {
    stem: ConvBn,
    stem_block: ResidualBlock,
    reproject: ConvBn,
    backbone: HrNetBackbone,
    config: EncoderConfig,
}

impl MultiResolutionEncoder {
    pub fn new(config: EncoderConfig, vb: VarBuilder) -> Result<Self> {
        // The stem never freezes, so it answers to a gate of its own
        let ctx = LayerCtx::encoder(GradGate::new());
        let biased = ctx.clone().with_conv_bias(true);
        let c = config.stem_channels;

        let stem = ConvBn::relu(3, c, 3, 1, &biased, vb.pp("stem"))?;
        let stem_block = ResidualBlock::new(c, c, 1, &ctx, vb.pp("stem_block"))?;
        let reproject = ConvBn::relu(c, 3, 3, 1, &biased, vb.pp("reproject"))?;
        let backbone = HrNetBackbone::new(config.backbone.clone(), vb.pp("backbone"))?;

        Ok(Self {
            stem,
            stem_block,
            reproject,
            backbone,
            config,
        })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<MultiScaleFeatures> {
        validate_input(x)?;

        let h1 = self.stem.forward_t(x, train)?;
        let h1 = self.stem_block.forward_t(&h1, train)?;

        let rgb = self.reproject.forward_t(&h1, train)?;
        let streams = self.backbone.forward_t(&rgb, train)?;
        let [stage2, stage3, stage4] = &streams.stages;

        Ok(MultiScaleFeatures {
            h1,
            h2: streams.single,
            h3: merge_multi_scale(stage2)?,
            h4: merge_multi_scale(stage3)?,
            hd5: merge_multi_scale(stage4)?,
        })
    }

    /// Stop gradients into the backbone; stem and re-projection keep training
    pub fn freeze(&self) {
        self.backbone.freeze();
        tracing::info!("Encoder backbone frozen");
    }

    pub fn unfreeze(&self) {
        self.backbone.unfreeze();
        tracing::info!("Encoder backbone unfrozen");
    }

    pub fn is_frozen(&self) -> bool {
        self.backbone.is_frozen()
    }

    pub fn level_channels(&self) -> [usize; 5] {
        self.config.level_channels()
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }
}

fn validate_input(x: &Tensor) -> Result<()> {
    let dims = x.dims();
    if dims.len() != 4 {
        return Err(Error::ShapeMismatch {
            context: "encoder input".to_string(),
            expected: "[batch, 3, height, width]".to_string(),
            actual: format!("{dims:?}"),
        });
    }
    if dims[1] != 3 {
        return Err(Error::channels("encoder input", 3, dims[1]));
    }
    if dims[2] % INPUT_MULTIPLE != 0 || dims[3] % INPUT_MULTIPLE != 0 {
        return Err(Error::ShapeMismatch {
            context: "encoder input".to_string(),
            expected: format!("height and width divisible by {INPUT_MULTIPLE}"),
            actual: format!("{}x{}", dims[2], dims[3]),
        });
    }
    Ok(())
}

/// Copy matching tensors of a safetensors checkpoint into the variables
/// under `prefix`.
///
/// Each variable is looked up under its own name relative to the backbone
/// (`conv1.conv.weight`) and then under the reference HRNet name
/// (`conv1.weight`, see [`reference_key`]). A missing or unreadable file is
/// not fatal: the backbone keeps its fresh initialization. Returns the number
/// of tensors loaded.
pub fn load_backbone_weights(varmap: &VarMap, prefix: &str, path: Option<&Path>) -> Result<usize> {
    let Some(path) = path else {
        tracing::info!("No pretrained backbone weights configured, training from scratch");
        return Ok(0);
    };
    if !path.exists() {
        tracing::warn!(
            path = %path.display(),
            "Pretrained backbone weights not found, training from scratch"
        );
        return Ok(0);
    }

    let tensors = match candle_core::safetensors::load(path, &Device::Cpu) {
        Ok(tensors) => tensors,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Failed to read pretrained backbone weights, training from scratch"
            );
            return Ok(0);
        }
    };

    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::InvalidInput("variable map lock poisoned".to_string()))?;

    let scope = format!("{prefix}.");
    let mut used = HashSet::new();
    let mut loaded = 0;
    let mut missing = 0;
    let mut mismatched = 0;
    for (name, var) in data.iter() {
        let Some(relative) = name.strip_prefix(&scope) else {
            continue;
        };
        let found = tensors
            .get_key_value(relative)
            .or_else(|| reference_key(relative).and_then(|key| tensors.get_key_value(&key)));
        let Some((key, tensor)) = found else {
            missing += 1;
            continue;
        };
        if var.shape() != tensor.shape() {
            tracing::warn!(
                tensor = %key,
                expected = ?var.shape(),
                actual = ?tensor.shape(),
                "Skipping pretrained tensor with mismatched shape"
            );
            mismatched += 1;
            continue;
        }
        let tensor = tensor.to_device(var.device())?.to_dtype(var.dtype())?;
        var.set(&tensor)?;
        used.insert(key.as_str());
        loaded += 1;
    }
    let unused = tensors.len() - used.len();

    if loaded == 0 {
        tracing::warn!(
            path = %path.display(),
            missing,
            mismatched,
            unused,
            "Pretrained checkpoint matched no backbone variable, training from scratch"
        );
    } else {
        tracing::info!(
            path = %path.display(),
            loaded,
            missing,
            mismatched,
            unused,
            "Loaded pretrained backbone weights"
        );
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use std::collections::HashMap;

    fn tiny_config() -> EncoderConfig {
        EncoderConfig {
            stem_channels: 8,
            backbone: HrNetConfig::with_widths(4, [1, 1, 1, 1], [1, 1, 1, 1]),
        }
    }

    #[test]
    fn test_level_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = tiny_config();
        let encoder = MultiResolutionEncoder::new(config.clone(), vb)?;

        let x = Tensor::randn(0f32, 1.0, (2, 3, 64, 64), &device)?;
        let features = encoder.forward_t(&x, true)?;

        let channels = config.level_channels();
        assert_eq!(channels, [8, 16, 12, 28, 60]);
        for ((level, c), stride) in features.levels().iter().zip(channels).zip(LEVEL_STRIDES) {
            assert_eq!(level.dims(), &[2, c, 64 / stride, 64 / stride]);
        }
        Ok(())
    }

    #[test]
    fn test_default_level_channels() {
        assert_eq!(
            EncoderConfig::default().level_channels(),
            [64, 256, 192, 448, 960]
        );
    }

    #[test]
    fn test_rejects_bad_inputs() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = MultiResolutionEncoder::new(tiny_config(), vb)?;

        let gray = Tensor::zeros((1, 1, 64, 64), DType::F32, &device)?;
        assert!(matches!(
            encoder.forward_t(&gray, false),
            Err(Error::ShapeMismatch { .. })
        ));

        let odd = Tensor::zeros((1, 3, 48, 64), DType::F32, &device)?;
        assert!(matches!(
            encoder.forward_t(&odd, false),
            Err(Error::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_merge_resizes_to_coarsest() -> Result<()> {
        let device = Device::Cpu;
        let a = Tensor::ones((1, 2, 8, 8), DType::F32, &device)?;
        let b = Tensor::ones((1, 3, 4, 4), DType::F32, &device)?;
        let merged = merge_multi_scale(&[a, b])?;
        assert_eq!(merged.dims(), &[1, 5, 4, 4]);
        Ok(())
    }

    #[test]
    fn test_missing_weights_are_not_fatal() -> Result<()> {
        let varmap = VarMap::new();
        let loaded = load_backbone_weights(
            &varmap,
            "backbone",
            Some(Path::new("/nonexistent/hrnet_w64.safetensors")),
        )?;
        assert_eq!(loaded, 0);
        assert_eq!(load_backbone_weights(&varmap, "backbone", None)?, 0);
        Ok(())
    }

    #[test]
    fn test_load_backbone_weights_with_reference_names() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _encoder = MultiResolutionEncoder::new(tiny_config(), vb.pp("encoder"))?;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("hrnet_reference.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert(
            "conv1.weight".to_string(),
            Tensor::full(0.5f32, (64, 3, 3, 3), &device)?,
        );
        tensors.insert("bn1.weight".to_string(), Tensor::full(2f32, 64, &device)?);
        tensors.insert(
            "bn1.num_batches_tracked".to_string(),
            Tensor::zeros(1, DType::F32, &device)?,
        );
        candle_core::safetensors::save(&tensors, &path)?;

        let loaded = load_backbone_weights(&varmap, "encoder.backbone", Some(&path))?;
        assert_eq!(loaded, 2);

        let data = varmap.data().lock().unwrap();
        let conv: Vec<f32> = data["encoder.backbone.conv1.conv.weight"]
            .as_tensor()
            .flatten_all()?
            .to_vec1()?;
        let scale: Vec<f32> = data["encoder.backbone.conv1.bn.weight"].as_tensor().to_vec1()?;
        assert!(conv.iter().all(|&v| v == 0.5));
        assert!(scale.iter().all(|&v| v == 2.0));
        Ok(())
    }

    #[test]
    fn test_checkpoint_without_matches_loads_nothing() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _encoder = MultiResolutionEncoder::new(tiny_config(), vb.pp("encoder"))?;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("classifier.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert("classifier.weight".to_string(), Tensor::ones((10, 4), DType::F32, &device)?);
        candle_core::safetensors::save(&tensors, &path)?;

        assert_eq!(load_backbone_weights(&varmap, "encoder.backbone", Some(&path))?, 0);
        Ok(())
    }

    #[test]
    fn test_load_backbone_weights_from_checkpoint() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _encoder = MultiResolutionEncoder::new(tiny_config(), vb.pp("encoder"))?;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("backbone.safetensors");
        let conv1 = Tensor::ones((64, 3, 3, 3), DType::F32, &device)?;
        let unrelated = Tensor::ones(4, DType::F32, &device)?;
        let mut tensors = HashMap::new();
        tensors.insert("conv1.conv.weight".to_string(), conv1);
        tensors.insert("fc.weight".to_string(), unrelated);
        candle_core::safetensors::save(&tensors, &path)?;

        let loaded = load_backbone_weights(&varmap, "encoder.backbone", Some(&path))?;
        assert_eq!(loaded, 1);

        let data = varmap.data().lock().unwrap();
        let w: Vec<f32> = data["encoder.backbone.conv1.conv.weight"]
            .as_tensor()
            .flatten_all()?
            .to_vec1()?;
        assert!(w.iter().all(|&v| v == 1.0));
        Ok(())
    }
}
