//! Parameter initialization.
//!
//! Candle's CPU device cannot be seeded, so [`SeededVarMap`] draws every new
//! variable from its own `StdRng` and registers it in a regular [`VarMap`].
//! Construction order is fixed, which makes two builds with the same seed
//! produce identical parameters.
//!
//! The encoder and the decoder initialize differently. The policy is picked by
//! the sub-module that owns the layer ([`InitPolicy`]), never by looking a
//! layer up after the fact.

use candle_core::{DType, Device, Result, Shape, Tensor, Var};
use candle_nn::init::{FanInOut, NonLinearity, NormalOrUniform};
use candle_nn::var_builder::SimpleBackend;
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Init, VarBuilder, VarMap};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Batch-norm epsilon used throughout the network
pub const BN_EPS: f64 = 1e-5;

/// Variable store backend that samples new variables from a seeded RNG
pub struct SeededVarMap {
    varmap: VarMap,
    rng: Mutex<StdRng>,
}

impl SeededVarMap {
    pub fn new(varmap: VarMap, seed: u64) -> Self {
        Self {
            varmap,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Wrap into a `VarBuilder`; created variables land in the wrapped `VarMap`.
    pub fn into_var_builder(self, dtype: DType, device: &Device) -> VarBuilder<'static> {
        VarBuilder::from_backend(Box::new(self), dtype, device.clone())
    }

    fn sample(&self, shape: &Shape, init: Init) -> Result<Vec<f32>> {
        let n = shape.elem_count();
        let mut rng = self.rng.lock();

        let values = match init {
            Init::Const(v) => vec![v as f32; n],
            Init::Randn { mean, stdev } => sample_normal(&mut rng, n, mean, stdev)?,
            Init::Uniform { lo, up } => (0..n)
                .map(|_| rng.random_range(lo..=up) as f32)
                .collect(),
            Init::Kaiming {
                dist,
                fan,
                non_linearity,
            } => {
                let fan = fan_size(&fan, shape) as f64;
                let std = gain(non_linearity) / fan.sqrt();
                match dist {
                    NormalOrUniform::Normal => sample_normal(&mut rng, n, 0.0, std)?,
                    NormalOrUniform::Uniform => {
                        let bound = 3f64.sqrt() * std;
                        (0..n)
                            .map(|_| rng.random_range(-bound..=bound) as f32)
                            .collect()
                    }
                }
            }
        };

        Ok(values)
    }
}

impl SimpleBackend for SeededVarMap {
    fn get(
        &self,
        s: Shape,
        name: &str,
        h: Init,
        dtype: DType,
        dev: &Device,
    ) -> Result<Tensor> {
        let mut data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("variable map lock poisoned".to_string()))?;

        if let Some(var) = data.get(name) {
            if var.shape() != &s {
                candle_core::bail!("shape mismatch on {name}: {s:?} <> {:?}", var.shape());
            }
            return Ok(var.as_tensor().clone());
        }

        let values = self.sample(&s, h)?;
        let tensor = Tensor::from_vec(values, s, dev)?.to_dtype(dtype)?;
        let var = Var::from_tensor(&tensor)?;
        let out = var.as_tensor().clone();
        data.insert(name.to_string(), var);
        Ok(out)
    }

    fn contains_tensor(&self, name: &str) -> bool {
        self.varmap
            .data()
            .lock()
            .map(|data| data.contains_key(name))
            .unwrap_or(false)
    }
}

fn sample_normal(rng: &mut StdRng, n: usize, mean: f64, std: f64) -> Result<Vec<f32>> {
    let normal = Normal::new(mean, std)
        .map_err(|e| candle_core::Error::Msg(format!("invalid normal init: {e}")))?;
    Ok((0..n).map(|_| normal.sample(rng) as f32).collect())
}

fn fan_size(fan: &FanInOut, shape: &Shape) -> usize {
    let dims = shape.dims();
    let receptive_field: usize = dims.iter().skip(2).product();
    let size = match fan {
        FanInOut::FanIn => dims.get(1).map(|d| d * receptive_field),
        FanInOut::FanOut => dims.first().map(|d| d * receptive_field),
    };
    size.unwrap_or(1).max(1)
}

fn gain(non_linearity: NonLinearity) -> f64 {
    match non_linearity {
        NonLinearity::ReLU => 2f64.sqrt(),
        NonLinearity::Tanh => 5.0 / 3.0,
        NonLinearity::Linear | NonLinearity::Sigmoid => 1.0,
        NonLinearity::SELU => 0.75,
        NonLinearity::ExplicitGain(g) => g,
    }
}

/// Which sub-module owns a layer, and therefore how it is initialized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPolicy {
    /// Kaiming normal (fan-out, ReLU gain); BN scale 1, shift 0
    Encoder,
    /// Kaiming normal (fan-in, ReLU gain); BN scale ~ N(1, 0.02), shift 0
    Decoder,
}

impl InitPolicy {
    pub fn conv_weight(self) -> Init {
        let fan = match self {
            InitPolicy::Encoder => FanInOut::FanOut,
            InitPolicy::Decoder => FanInOut::FanIn,
        };
        Init::Kaiming {
            dist: NormalOrUniform::Normal,
            fan,
            non_linearity: NonLinearity::ReLU,
        }
    }

    pub fn norm_weight(self) -> Init {
        match self {
            InitPolicy::Encoder => Init::Const(1.0),
            InitPolicy::Decoder => Init::Randn {
                mean: 1.0,
                stdev: 0.02,
            },
        }
    }
}

/// 2D convolution with a policy-chosen weight init and a zero bias
pub fn conv2d(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    config: Conv2dConfig,
    bias: bool,
    policy: InitPolicy,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let weight = vb.get_with_hints(
        (
            out_channels,
            in_channels / config.groups,
            kernel_size,
            kernel_size,
        ),
        "weight",
        policy.conv_weight(),
    )?;
    let bias = if bias {
        Some(vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?)
    } else {
        None
    };
    Ok(Conv2d::new(weight, bias, config))
}

/// Batch normalization with policy-chosen scale init
pub fn batch_norm(num_features: usize, policy: InitPolicy, vb: VarBuilder) -> Result<BatchNorm> {
    let weight = vb.get_with_hints(num_features, "weight", policy.norm_weight())?;
    let bias = vb.get_with_hints(num_features, "bias", Init::Const(0.0))?;
    let running_mean = vb.get_with_hints(num_features, "running_mean", Init::Const(0.0))?;
    let running_var = vb.get_with_hints(num_features, "running_var", Init::Const(1.0))?;
    BatchNorm::new(num_features, running_mean, running_var, weight, bias, BN_EPS)
}
