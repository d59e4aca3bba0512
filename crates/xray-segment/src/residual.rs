//! Residual units used by the encoder stem and the HRNet branches.

use candle_core::{ModuleT, Result, Tensor};
use candle_nn::VarBuilder;

use crate::layers::{ConvBn, LayerCtx};

/// Bottleneck residual block with skip connection.
///
/// 1×1 compress to `out / 4` → 3×3 (carries the stride) → 1×1 restore, then
/// the identity (or its 1×1 projection) is added before the final ReLU.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    conv1: ConvBn,
    conv2: ConvBn,
    conv3: ConvBn,
    downsample: Option<ConvBn>,
}

impl ResidualBlock {
    pub const EXPANSION: usize = 4;

    pub fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        ctx: &LayerCtx,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mid_channels = (out_channels / Self::EXPANSION).max(1);

        let conv1 = ConvBn::relu(in_channels, mid_channels, 1, 1, ctx, vb.pp("conv1"))?;
        let conv2 = ConvBn::relu(mid_channels, mid_channels, 3, stride, ctx, vb.pp("conv2"))?;
        let conv3 = ConvBn::plain(mid_channels, out_channels, 1, 1, ctx, vb.pp("conv3"))?;

        // Projection path for the skip connection
        let downsample = if in_channels != out_channels || stride != 1 {
            Some(ConvBn::plain(
                in_channels,
                out_channels,
                1,
                stride,
                ctx,
                vb.pp("downsample"),
            )?)
        } else {
            None
        };

        Ok(Self {
            conv1,
            conv2,
            conv3,
            downsample,
        })
    }

    pub fn has_projection(&self) -> bool {
        self.downsample.is_some()
    }
}

impl ModuleT for ResidualBlock {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let identity = match &self.downsample {
            Some(ds) => ds.forward_t(x, train)?,
            None => x.clone(),
        };

        let out = self.conv1.forward_t(x, train)?;
        let out = self.conv2.forward_t(&out, train)?;
        let out = self.conv3.forward_t(&out, train)?;

        let out = (out + identity)?;
        out.relu()
    }
}

/// Two 3×3 convolutions with skip connection (expansion 1)
#[derive(Debug, Clone)]
pub struct BasicBlock {
    conv1: ConvBn,
    conv2: ConvBn,
    downsample: Option<ConvBn>,
}

impl BasicBlock {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        ctx: &LayerCtx,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv1 = ConvBn::relu(in_channels, out_channels, 3, stride, ctx, vb.pp("conv1"))?;
        let conv2 = ConvBn::plain(out_channels, out_channels, 3, 1, ctx, vb.pp("conv2"))?;
        let downsample = if in_channels != out_channels || stride != 1 {
            Some(ConvBn::plain(
                in_channels,
                out_channels,
                1,
                stride,
                ctx,
                vb.pp("downsample"),
            )?)
        } else {
            None
        };

        Ok(Self {
            conv1,
            conv2,
            downsample,
        })
    }
}

impl ModuleT for BasicBlock {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let identity = match &self.downsample {
            Some(ds) => ds.forward_t(x, train)?,
            None => x.clone(),
        };

        let out = self.conv1.forward_t(x, train)?;
        let out = self.conv2.forward_t(&out, train)?;
        (out + identity)?.relu()
    }
}

/// Block flavour selected by the backbone layout
#[derive(Debug, Clone)]
pub enum Block {
    Basic(BasicBlock),
    Bottleneck(ResidualBlock),
}

impl ModuleT for Block {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Block::Basic(b) => b.forward_t(x, train),
            Block::Bottleneck(b) => b.forward_t(x, train),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::GradGate;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_residual_block_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let ctx = LayerCtx::encoder(GradGate::new());

        let same = ResidualBlock::new(16, 16, 1, &ctx, vb.pp("same"))?;
        assert!(!same.has_projection());

        let strided = ResidualBlock::new(16, 32, 2, &ctx, vb.pp("strided"))?;
        assert!(strided.has_projection());

        let x = Tensor::randn(0f32, 1.0, (2, 16, 8, 8), &device)?;
        assert_eq!(same.forward_t(&x, true)?.dims(), &[2, 16, 8, 8]);
        assert_eq!(strided.forward_t(&x, true)?.dims(), &[2, 32, 4, 4]);
        Ok(())
    }

    #[test]
    fn test_stride_alone_requires_projection() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let ctx = LayerCtx::encoder(GradGate::new());

        let block = ResidualBlock::new(8, 8, 2, &ctx, vb)?;
        assert!(block.has_projection());
        Ok(())
    }

    #[test]
    fn test_output_is_rectified() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let ctx = LayerCtx::encoder(GradGate::new());

        let block = BasicBlock::new(4, 4, 1, &ctx, vb)?;
        let x = Tensor::randn(0f32, 1.0, (1, 4, 6, 6), &device)?;
        let min = block.forward_t(&x, false)?.flatten_all()?.min(0)?.to_scalar::<f32>()?;
        assert!(min >= 0.0);
        Ok(())
    }
}
