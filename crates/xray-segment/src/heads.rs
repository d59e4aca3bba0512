//! Deep supervision heads and the classification gate.
//!
//! 1. Classification gate: per-class presence score in [0, 1] from hd5
//! 2. Supervision heads: one class map per decoder level, resized to the
//!    output resolution and multiplied by the presence score

use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Dropout, VarBuilder};
use xray_core::{Error, Result};

use crate::init::{conv2d, InitPolicy};
use crate::layers::{global_max_pool, resize_bilinear};

/// Global per-class presence estimate
#[derive(Debug, Clone)]
pub struct ClassificationGate {
    dropout: Dropout,
    conv: Conv2d,
    in_channels: usize,
}

impl ClassificationGate {
    pub fn new(in_channels: usize, n_classes: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        let conv = conv2d(
            in_channels,
            n_classes,
            1,
            Conv2dConfig::default(),
            true,
            InitPolicy::Decoder,
            vb.pp("conv"),
        )?;

        Ok(Self {
            dropout: Dropout::new(dropout),
            conv,
            in_channels,
        })
    }

    /// `[batch, channels, h, w]` → `[batch, n_classes]`, dropout only in training
    pub fn forward_t(&self, hd5: &Tensor, train: bool) -> Result<Tensor> {
        let c = hd5.dim(1)?;
        if c != self.in_channels {
            return Err(Error::channels("classification gate", self.in_channels, c));
        }

        let x = self.dropout.forward(hd5, train)?;
        let x = self.conv.forward(&x)?;
        let x = global_max_pool(&x)?;
        Ok(candle_nn::ops::sigmoid(&x)?)
    }
}

/// One 3×3 class-map convolution per level (d1..d5)
#[derive(Debug, Clone)]
pub struct SupervisionHeads {
    outconvs: Vec<Conv2d>,
    output_size: usize,
}

impl SupervisionHeads {
    /// `level_channels` lists the inputs of d1..d5 in order
    pub fn new(
        level_channels: [usize; 5],
        n_classes: usize,
        output_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let outconvs = level_channels
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                conv2d(
                    c,
                    n_classes,
                    3,
                    config,
                    true,
                    InitPolicy::Decoder,
                    vb.pp(format!("outconv{}", i + 1)),
                )
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            outconvs,
            output_size,
        })
    }

    /// Class logits for each level, all at `output_size × output_size`
    pub fn forward(&self, levels: [&Tensor; 5]) -> Result<Vec<Tensor>> {
        let size = (self.output_size, self.output_size);
        levels
            .iter()
            .zip(&self.outconvs)
            .map(|(x, conv)| {
                let y = conv.forward(x)?;
                Ok(resize_bilinear(&y, size, true)?)
            })
            .collect()
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }
}

/// Scale every class map by its example's presence score
///
/// `seg`: `[batch, classes, h, w]`, `presence`: `[batch, classes]`
pub fn gate_predictions(seg: &Tensor, presence: &Tensor) -> Result<Tensor> {
    let (b, c, _, _) = seg.dims4()?;
    if presence.dims() != [b, c] {
        return Err(Error::ShapeMismatch {
            context: "classification gating".to_string(),
            expected: format!("[{b}, {c}]"),
            actual: format!("{:?}", presence.dims()),
        });
    }
    Ok(seg.broadcast_mul(&presence.unsqueeze(2)?.unsqueeze(3)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_gate_is_a_probability() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let gate = ClassificationGate::new(16, 5, 0.3, vb)?;

        let hd5 = (Tensor::randn(0f32, 1.0, (3, 16, 2, 2), &device)? * 10.0)?;
        let p = gate.forward_t(&hd5, true)?;
        assert_eq!(p.dims(), &[3, 5]);

        let values: Vec<f32> = p.flatten_all()?.to_vec1()?;
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
        Ok(())
    }

    #[test]
    fn test_gate_is_deterministic_in_eval() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let gate = ClassificationGate::new(8, 3, 0.5, vb)?;

        let hd5 = Tensor::randn(0f32, 1.0, (1, 8, 2, 2), &device)?;
        let a: Vec<f32> = gate.forward_t(&hd5, false)?.flatten_all()?.to_vec1()?;
        let b: Vec<f32> = gate.forward_t(&hd5, false)?.flatten_all()?.to_vec1()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_heads_share_output_size() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let heads = SupervisionHeads::new([20, 20, 20, 20, 60], 4, 32, vb)?;

        let level = |c: usize, s: usize| Tensor::randn(0f32, 1.0, (2, c, s, s), &device);
        let (d1, d2, d3, d4, d5) = (
            level(20, 64)?,
            level(20, 16)?,
            level(20, 8)?,
            level(20, 4)?,
            level(60, 2)?,
        );
        let outputs = heads.forward([&d1, &d2, &d3, &d4, &d5])?;
        assert_eq!(outputs.len(), 5);
        for out in outputs {
            assert_eq!(out.dims(), &[2, 4, 32, 32]);
        }
        Ok(())
    }

    #[test]
    fn test_gating_zeroes_absent_classes() -> Result<()> {
        let device = Device::Cpu;
        let seg = Tensor::ones((1, 2, 3, 3), DType::F32, &device)?;
        let presence = Tensor::new(&[[0f32, 0.5]], &device)?;

        let gated = gate_predictions(&seg, &presence)?;
        let sums: Vec<f32> = gated.sum((2, 3))?.flatten_all()?.to_vec1()?;
        assert_eq!(sums, vec![0.0, 4.5]);

        let wrong = Tensor::ones((1, 3), DType::F32, &device)?;
        assert!(gate_predictions(&seg, &wrong).is_err());
        Ok(())
    }
}
