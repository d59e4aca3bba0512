//! Building blocks shared by the encoder and the decoder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, VarBuilder};

use crate::init::{batch_norm, conv2d, InitPolicy};

/// Shared switch that stops gradients from reaching a group of layers.
///
/// Every layer built with the same gate is frozen and unfrozen together.
/// While frozen, weights enter the graph detached: gradients still flow to
/// the layer inputs but never to the parameters themselves.
#[derive(Debug, Clone, Default)]
pub struct GradGate(Arc<AtomicBool>);

impl GradGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn freeze(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn unfreeze(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_frozen(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn conv(&self, conv: &Conv2d, x: &Tensor) -> Result<Tensor> {
        if self.is_frozen() {
            let detached = Conv2d::new(
                conv.weight().detach(),
                conv.bias().map(Tensor::detach),
                *conv.config(),
            );
            detached.forward(x)
        } else {
            conv.forward(x)
        }
    }

    fn norm(&self, bn: &BatchNorm, x: &Tensor, train: bool) -> Result<Tensor> {
        match bn.weight_and_bias() {
            Some((weight, bias)) if self.is_frozen() => {
                let num_features = bn.running_mean().dims1()?;
                let detached = BatchNorm::new(
                    num_features,
                    bn.running_mean().clone(),
                    bn.running_var().clone(),
                    weight.detach(),
                    bias.detach(),
                    bn.eps(),
                )?;
                detached.forward_t(x, train)
            }
            _ => bn.forward_t(x, train),
        }
    }
}

/// Construction context: who owns the layer and which gate it answers to
#[derive(Debug, Clone)]
pub struct LayerCtx {
    pub policy: InitPolicy,
    pub gate: GradGate,
    /// Whether convolutions carry a bias of their own ahead of batch norm
    pub conv_bias: bool,
}

impl LayerCtx {
    /// Backbone layers: bias-free convolutions, matching published HRNet
    /// checkpoints
    pub fn encoder(gate: GradGate) -> Self {
        Self {
            policy: InitPolicy::Encoder,
            gate,
            conv_bias: false,
        }
    }

    pub fn decoder() -> Self {
        Self {
            policy: InitPolicy::Decoder,
            gate: GradGate::new(),
            conv_bias: true,
        }
    }

    pub fn with_conv_bias(mut self, conv_bias: bool) -> Self {
        self.conv_bias = conv_bias;
        self
    }
}

/// Convolution → batch norm → optional ReLU.
///
/// Padding is `kernel / 2`, so stride 1 keeps the spatial size.
#[derive(Debug, Clone)]
pub struct ConvBn {
    conv: Conv2d,
    bn: BatchNorm,
    relu: bool,
    in_channels: usize,
    out_channels: usize,
    gate: GradGate,
}

impl ConvBn {
    /// Conv + BN + ReLU
    pub fn relu(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        ctx: &LayerCtx,
        vb: VarBuilder,
    ) -> Result<Self> {
        Self::build(in_channels, out_channels, kernel_size, stride, true, ctx, vb)
    }

    /// Conv + BN, no activation
    pub fn plain(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        ctx: &LayerCtx,
        vb: VarBuilder,
    ) -> Result<Self> {
        Self::build(in_channels, out_channels, kernel_size, stride, false, ctx, vb)
    }

    fn build(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        relu: bool,
        ctx: &LayerCtx,
        vb: VarBuilder,
    ) -> Result<Self> {
        let config = Conv2dConfig {
            padding: kernel_size / 2,
            stride,
            ..Default::default()
        };
        let conv = conv2d(
            in_channels,
            out_channels,
            kernel_size,
            config,
            ctx.conv_bias,
            ctx.policy,
            vb.pp("conv"),
        )?;
        let bn = batch_norm(out_channels, ctx.policy, vb.pp("bn"))?;

        Ok(Self {
            conv,
            bn,
            relu,
            in_channels,
            out_channels,
            gate: ctx.gate.clone(),
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }
}

impl ModuleT for ConvBn {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.gate.conv(&self.conv, x)?;
        let x = self.gate.norm(&self.bn, &x, train)?;
        if self.relu {
            x.relu()
        } else {
            Ok(x)
        }
    }
}

/// Bilinear resize of a `[batch, channels, h, w]` tensor.
///
/// Implemented as two interpolation-matrix products so it is differentiable
/// and exact for both corner conventions.
pub fn resize_bilinear(x: &Tensor, size: (usize, usize), align_corners: bool) -> Result<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    let (out_h, out_w) = size;
    if (h, w) == (out_h, out_w) {
        return Ok(x.clone());
    }

    let device = x.device();
    let dtype = x.dtype();
    let mw = Tensor::from_vec(interpolation_matrix(w, out_w, align_corners), (w, out_w), device)?
        .to_dtype(dtype)?;
    let mh = Tensor::from_vec(interpolation_matrix(h, out_h, align_corners), (h, out_h), device)?
        .to_dtype(dtype)?;

    // Width pass: [b*c*h, w] x [w, out_w]
    let x = x.reshape((b * c * h, w))?.matmul(&mw)?;
    let x = x.reshape((b, c, h, out_w))?.transpose(2, 3)?;

    // Height pass on the transposed map: [b*c*out_w, h] x [h, out_h]
    let x = x.reshape((b * c * out_w, h))?.matmul(&mh)?;
    x.reshape((b, c, out_w, out_h))?.transpose(2, 3)?.contiguous()
}

/// Row-major `[input, output]` weights mapping input samples to output samples
fn interpolation_matrix(input: usize, output: usize, align_corners: bool) -> Vec<f32> {
    let mut m = vec![0f32; input * output];
    let last = input.saturating_sub(1);

    for o in 0..output {
        let src = if align_corners {
            if output > 1 {
                o as f64 * last as f64 / (output - 1) as f64
            } else {
                0.0
            }
        } else {
            ((o as f64 + 0.5) * input as f64 / output as f64 - 0.5).max(0.0)
        };

        let i0 = (src.floor() as usize).min(last);
        let i1 = (i0 + 1).min(last);
        let lambda = (src - i0 as f64) as f32;

        m[i0 * output + o] += 1.0 - lambda;
        m[i1 * output + o] += lambda;
    }

    m
}

/// Max pooling with kernel = stride = `factor`
pub fn max_pool(x: &Tensor, factor: usize) -> Result<Tensor> {
    if factor == 1 {
        return Ok(x.clone());
    }
    x.max_pool2d_with_stride(factor, factor)
}

/// Global max pool: `[batch, channels, h, w]` → `[batch, channels]`
pub fn global_max_pool(x: &Tensor) -> Result<Tensor> {
    x.flatten_from(2)?.max(2)
}

/// Number of scalar parameters held by a set of tensors
pub fn parameter_count<'a>(tensors: impl IntoIterator<Item = &'a Tensor>) -> usize {
    tensors.into_iter().map(Tensor::elem_count).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Var};
    use candle_nn::VarMap;

    #[test]
    fn test_resize_align_corners_keeps_endpoints() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::new(&[[[[0f32, 3.0], [6.0, 9.0]]]], &device)?;
        let y = resize_bilinear(&x, (4, 4), true)?;
        assert_eq!(y.dims(), &[1, 1, 4, 4]);

        let rows = y.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?;
        assert!((rows[0][0] - 0.0).abs() < 1e-5);
        assert!((rows[0][3] - 3.0).abs() < 1e-5);
        assert!((rows[3][0] - 6.0).abs() < 1e-5);
        assert!((rows[3][3] - 9.0).abs() < 1e-5);
        assert!((rows[0][1] - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_resize_half_pixel_matches_reference() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::new(&[[[[0f32, 4.0]]]], &device)?;
        let y = resize_bilinear(&x, (1, 4), false)?;

        // half-pixel centers: sources -0.25 (clamped), 0.25, 0.75, 1.25
        let row = y.flatten_all()?.to_vec1::<f32>()?;
        let expected = [0.0, 1.0, 3.0, 4.0];
        for (a, b) in row.iter().zip(expected) {
            assert!((a - b).abs() < 1e-5, "{row:?}");
        }
        Ok(())
    }

    #[test]
    fn test_resize_down_to_coarsest() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 16, 16), &device)?;
        let y = resize_bilinear(&x, (4, 4), true)?;
        assert_eq!(y.dims(), &[2, 3, 4, 4]);
        Ok(())
    }

    #[test]
    fn test_pooling_shapes() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (1, 2, 16, 16), &device)?;
        assert_eq!(max_pool(&x, 4)?.dims(), &[1, 2, 4, 4]);
        assert_eq!(global_max_pool(&x)?.dims(), &[1, 2]);
        Ok(())
    }

    #[test]
    fn test_frozen_gate_blocks_parameter_gradients() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let gate = GradGate::new();
        let layer = ConvBn::relu(2, 4, 3, 1, &LayerCtx::encoder(gate.clone()), vb)?;

        let input = Var::randn(0f32, 1.0, (2, 2, 8, 8), &device)?;
        let weight = varmap.data().lock().unwrap()["conv.weight"].clone();

        gate.freeze();
        let loss = layer.forward_t(input.as_tensor(), true)?.sum_all()?;
        let grads = loss.backward()?;
        assert!(grads.get(weight.as_tensor()).is_none());
        assert!(grads.get(input.as_tensor()).is_some());

        gate.unfreeze();
        let loss = layer.forward_t(input.as_tensor(), true)?.sum_all()?;
        let grads = loss.backward()?;
        assert!(grads.get(weight.as_tensor()).is_some());
        Ok(())
    }
}
