//! Dense fusion decoder.
//!
//! Each of the four stages (hd4 at stride 16 down to hd1 at stride 1) pulls
//! in every level of the ladder: finer encoder levels are max-pooled, the
//! same-resolution encoder level is used as is, hd5 and the decoder levels
//! already computed are upsampled. Every source is projected to
//! `cat_channels`, the five projections are concatenated finest first and a
//! final convolution fuses them.

use candle_core::{ModuleT, Tensor};
use candle_nn::VarBuilder;
use xray_core::{Error, Result};

use crate::encoder::{MultiScaleFeatures, LEVEL_STRIDES};
use crate::layers::{max_pool, resize_bilinear, ConvBn, LayerCtx};

/// Number of concatenated components per stage
pub const FUSED_SOURCES: usize = 5;

const LEVEL_NAMES: [&str; 5] = ["h1", "h2", "h3", "h4", "hd5"];
const DECODED_NAMES: [&str; 5] = ["hd1", "hd2", "hd3", "hd4", "hd5"];

#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Channels of h1, h2, h3, h4 and hd5
    pub level_channels: [usize; 5],
    /// Width of every projected component
    pub cat_channels: usize,
}

impl DecoderConfig {
    /// Width of every decoder level
    pub fn up_channels(&self) -> usize {
        self.cat_channels * FUSED_SOURCES
    }
}

/// How a source level reaches the stage resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resample {
    /// Max pool with kernel = stride = factor
    Pool(usize),
    Same,
    /// Bilinear upsampling by factor, half-pixel centers
    Up(usize),
}

impl Resample {
    /// Resampling from `source` to `target` on the level ladder
    pub fn between(source: usize, target: usize) -> Result<Self> {
        let (from, to) = (LEVEL_STRIDES[source], LEVEL_STRIDES[target]);
        let (large, small) = if from > to { (from, to) } else { (to, from) };
        if large % small != 0 || !(large / small).is_power_of_two() {
            return Err(Error::ShapeMismatch {
                context: format!("{} -> {}", LEVEL_NAMES[source], DECODED_NAMES[target]),
                expected: "power-of-two resampling factor".to_string(),
                actual: format!("stride {from} to stride {to}"),
            });
        }
        Ok(match from.cmp(&to) {
            std::cmp::Ordering::Less => Resample::Pool(to / from),
            std::cmp::Ordering::Equal => Resample::Same,
            std::cmp::Ordering::Greater => Resample::Up(from / to),
        })
    }

    fn tag(self) -> &'static str {
        match self {
            Resample::Pool(_) => "pt",
            Resample::Same => "cat",
            Resample::Up(_) => "ut",
        }
    }

    /// Source spatial size this resampling accepts for a given target size
    fn source_size(self, (h, w): (usize, usize)) -> (usize, usize) {
        match self {
            Resample::Pool(f) => (h * f, w * f),
            Resample::Same => (h, w),
            Resample::Up(f) => (h / f, w / f),
        }
    }

    fn apply(self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Resample::Pool(f) => max_pool(x, f),
            Resample::Same => Ok(x.clone()),
            Resample::Up(f) => {
                let (_, _, h, w) = x.dims4()?;
                resize_bilinear(x, (h * f, w * f), false)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct FusionPath {
    source: usize,
    resample: Resample,
    project: ConvBn,
    name: String,
}

#[derive(Debug, Clone)]
struct FusionStage {
    target: usize,
    paths: Vec<FusionPath>,
    fuse: ConvBn,
}

/// Decoder outputs, finest first
#[derive(Debug, Clone)]
pub struct DecoderLevels {
    pub hd1: Tensor,
    pub hd2: Tensor,
    pub hd3: Tensor,
    pub hd4: Tensor,
}

#[derive(Debug, Clone)]
pub struct DenseFusionDecoder {
    stages: Vec<FusionStage>,
    config: DecoderConfig,
}

impl DenseFusionDecoder {
    pub fn new(config: DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let ctx = LayerCtx::decoder();
        let up = config.up_channels();
        let cat = config.cat_channels;

        let mut stages = Vec::with_capacity(4);
        for target in (0..4).rev() {
            let mut paths = Vec::with_capacity(FUSED_SOURCES);
            for source in 0..FUSED_SOURCES {
                let resample = Resample::between(source, target)?;
                let (src_name, in_channels) = if source <= target || source == 4 {
                    (LEVEL_NAMES[source], config.level_channels[source])
                } else {
                    (DECODED_NAMES[source], up)
                };
                let name = format!("{src_name}_{}_{}", resample.tag(), DECODED_NAMES[target]);
                let project = ConvBn::relu(in_channels, cat, 3, 1, &ctx, vb.pp(&name))?;
                paths.push(FusionPath {
                    source,
                    resample,
                    project,
                    name,
                });
            }
            let fuse = ConvBn::relu(up, up, 3, 1, &ctx, vb.pp(format!("conv{}d_1", target + 1)))?;
            stages.push(FusionStage {
                target,
                paths,
                fuse,
            });
        }

        Ok(Self { stages, config })
    }

    pub fn forward_t(&self, features: &MultiScaleFeatures, train: bool) -> Result<DecoderLevels> {
        let encoded = features.levels();
        let mut decoded: [Option<Tensor>; 4] = [None, None, None, None];

        for stage in &self.stages {
            let (_, _, h, w) = encoded[stage.target].dims4()?;

            let mut parts = Vec::with_capacity(stage.paths.len());
            for path in &stage.paths {
                let input = if path.source <= stage.target || path.source == 4 {
                    encoded[path.source]
                } else {
                    decoded[path.source].as_ref().ok_or_else(|| {
                        Error::InvalidInput(format!("{} used before it was decoded", path.name))
                    })?
                };
                parts.push(self.project(path, input, (h, w), train)?);
            }

            let cat = Tensor::cat(&parts, 1)?;
            decoded[stage.target] = Some(stage.fuse.forward_t(&cat, train)?);
        }

        let [hd1, hd2, hd3, hd4] = decoded;
        let missing = || Error::InvalidInput("decoder stage did not run".to_string());
        Ok(DecoderLevels {
            hd1: hd1.ok_or_else(missing)?,
            hd2: hd2.ok_or_else(missing)?,
            hd3: hd3.ok_or_else(missing)?,
            hd4: hd4.ok_or_else(missing)?,
        })
    }

    fn project(
        &self,
        path: &FusionPath,
        input: &Tensor,
        target: (usize, usize),
        train: bool,
    ) -> Result<Tensor> {
        let (_, c, h, w) = input.dims4()?;
        if c != path.project.in_channels() {
            return Err(Error::channels(&path.name, path.project.in_channels(), c));
        }
        let expected = path.resample.source_size(target);
        if (h, w) != expected {
            return Err(Error::ShapeMismatch {
                context: path.name.clone(),
                expected: format!("{}x{}", expected.0, expected.1),
                actual: format!("{h}x{w}"),
            });
        }

        let x = path.resample.apply(input)?;
        Ok(path.project.forward_t(&x, train)?)
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    const CHANNELS: [usize; 5] = [8, 16, 12, 28, 60];

    fn features(size: usize, channels: [usize; 5], device: &Device) -> Result<MultiScaleFeatures> {
        let level = |i: usize| {
            let s = size / LEVEL_STRIDES[i];
            Tensor::randn(0f32, 1.0, (2, channels[i], s, s), device)
        };
        Ok(MultiScaleFeatures {
            h1: level(0)?,
            h2: level(1)?,
            h3: level(2)?,
            h4: level(3)?,
            hd5: level(4)?,
        })
    }

    fn decoder(varmap: &VarMap, device: &Device) -> Result<DenseFusionDecoder> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        DenseFusionDecoder::new(
            DecoderConfig {
                level_channels: CHANNELS,
                cat_channels: 4,
            },
            vb,
        )
    }

    #[test]
    fn test_resample_between_levels() -> Result<()> {
        assert_eq!(Resample::between(0, 3)?, Resample::Pool(16));
        assert_eq!(Resample::between(1, 2)?, Resample::Pool(2));
        assert_eq!(Resample::between(2, 2)?, Resample::Same);
        assert_eq!(Resample::between(4, 0)?, Resample::Up(32));
        assert_eq!(Resample::between(1, 0)?, Resample::Up(4));
        Ok(())
    }

    #[test]
    fn test_decoder_level_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let decoder = decoder(&varmap, &device)?;

        let levels = decoder.forward_t(&features(64, CHANNELS, &device)?, true)?;
        assert_eq!(levels.hd4.dims(), &[2, 20, 4, 4]);
        assert_eq!(levels.hd3.dims(), &[2, 20, 8, 8]);
        assert_eq!(levels.hd2.dims(), &[2, 20, 16, 16]);
        assert_eq!(levels.hd1.dims(), &[2, 20, 64, 64]);
        Ok(())
    }

    #[test]
    fn test_parameter_names_follow_fusion_lattice() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        decoder(&varmap, &device)?;

        let data = varmap.data().lock().unwrap();
        for name in [
            "h1_pt_hd4.conv.weight",
            "h4_cat_hd4.conv.weight",
            "hd5_ut_hd4.conv.weight",
            "hd4_ut_hd1.conv.weight",
            "conv1d_1.bn.weight",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
        Ok(())
    }

    #[test]
    fn test_channel_mismatch_is_reported() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let decoder = decoder(&varmap, &device)?;

        let mut wrong = CHANNELS;
        wrong[2] += 1;
        let err = decoder
            .forward_t(&features(64, wrong, &device)?, false)
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
        Ok(())
    }

    #[test]
    fn test_spatial_mismatch_is_reported() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let decoder = decoder(&varmap, &device)?;

        let mut f = features(64, CHANNELS, &device)?;
        f.h2 = Tensor::randn(0f32, 1.0, (2, CHANNELS[1], 8, 8), &device)?;
        let err = decoder.forward_t(&f, false).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
        Ok(())
    }
}
