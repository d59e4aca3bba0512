//! HRNet backbone: parallel multi-resolution streams with repeated
//! all-to-all fusion.
//!
//! The layout (branches, blocks and widths per stage) is read from the HRNet
//! YAML format, `MODEL.EXTRA.STAGE1..STAGE4`. Stage 1 is a single stream of
//! residual blocks; stages 2-4 run 2, 3 and 4 parallel streams, each new
//! stream spawned by a strided transition from the coarsest existing one.

use std::path::Path;

use candle_core::{ModuleT, Tensor};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use xray_core::{Error, Result};

use crate::layers::{ConvBn, GradGate, LayerCtx};
use crate::residual::{BasicBlock, Block, ResidualBlock};

/// Residual unit used by a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockKind {
    Basic,
    Bottleneck,
}

impl BlockKind {
    pub fn expansion(self) -> usize {
        match self {
            BlockKind::Basic => 1,
            BlockKind::Bottleneck => ResidualBlock::EXPANSION,
        }
    }
}

/// How branch contributions are combined inside a fusion layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FuseMethod {
    #[default]
    Sum,
}

/// One stage of the layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct StageSpec {
    pub num_modules: usize,
    pub num_branches: usize,
    pub block: BlockKind,
    pub num_blocks: Vec<usize>,
    pub num_channels: Vec<usize>,
    #[serde(default)]
    pub fuse_method: FuseMethod,
}

impl StageSpec {
    /// Output width of every branch
    pub fn branch_channels(&self) -> Vec<usize> {
        self.num_channels
            .iter()
            .map(|c| c * self.block.expansion())
            .collect()
    }

    fn validate(&self, name: &str, expected_branches: usize) -> Result<()> {
        if self.num_branches != expected_branches {
            return Err(Error::Config(format!(
                "{name}: expected {expected_branches} branches, found {}",
                self.num_branches
            )));
        }
        if self.num_blocks.len() != self.num_branches
            || self.num_channels.len() != self.num_branches
        {
            return Err(Error::Config(format!(
                "{name}: NUM_BLOCKS and NUM_CHANNELS must list one entry per branch"
            )));
        }
        if self.num_modules == 0 {
            return Err(Error::Config(format!("{name}: NUM_MODULES must be positive")));
        }
        if self.num_blocks.contains(&0) || self.num_channels.contains(&0) {
            return Err(Error::Config(format!(
                "{name}: block counts and channel widths must be positive"
            )));
        }
        Ok(())
    }
}

/// Backbone layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HrNetConfig {
    #[serde(rename = "STAGE1")]
    pub stage1: StageSpec,
    #[serde(rename = "STAGE2")]
    pub stage2: StageSpec,
    #[serde(rename = "STAGE3")]
    pub stage3: StageSpec,
    #[serde(rename = "STAGE4")]
    pub stage4: StageSpec,
}

#[derive(Deserialize)]
struct LayoutFile {
    #[serde(rename = "MODEL")]
    model: ModelSection,
}

#[derive(Deserialize)]
struct ModelSection {
    #[serde(rename = "EXTRA")]
    extra: HrNetConfig,
}

impl HrNetConfig {
    /// HRNet-W64 as used for ImageNet classification
    pub fn w64() -> Self {
        Self::with_widths(64, [4, 4, 4, 4], [1, 1, 4, 3])
    }

    /// Uniform layout: stage widths `w, 2w, 4w, 8w`, Bottleneck stage 1 of
    /// width `w`, Basic blocks afterwards.
    pub fn with_widths(width: usize, blocks: [usize; 4], modules: [usize; 4]) -> Self {
        let stage = |n: usize, block: BlockKind| StageSpec {
            num_modules: modules[n - 1],
            num_branches: n,
            block,
            num_blocks: vec![blocks[n - 1]; n],
            num_channels: (0..n).map(|i| width << i).collect(),
            fuse_method: FuseMethod::Sum,
        };
        Self {
            stage1: stage(1, BlockKind::Bottleneck),
            stage2: stage(2, BlockKind::Basic),
            stage3: stage(3, BlockKind::Basic),
            stage4: stage(4, BlockKind::Basic),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: LayoutFile = serde_yaml::from_str(yaml)?;
        let config = file.model.extra;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "cannot read backbone configuration {}: {e}",
                path.display()
            ))
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        self.stage1.validate("STAGE1", 1)?;
        self.stage2.validate("STAGE2", 2)?;
        self.stage3.validate("STAGE3", 3)?;
        self.stage4.validate("STAGE4", 4)
    }

    /// Channels of the single-stream output and of each merged stage
    pub fn merged_channels(&self) -> [usize; 4] {
        let sum = |s: &StageSpec| s.branch_channels().iter().sum();
        [
            self.stage1.branch_channels()[0],
            sum(&self.stage2),
            sum(&self.stage3),
            sum(&self.stage4),
        ]
    }
}

/// Path from branch `j` into output `i` of a fusion layer
#[derive(Debug, Clone)]
enum FuseLink {
    Identity,
    /// Coarser source: 1×1 projection, then nearest upsampling to the target
    Up(ConvBn),
    /// Finer source: chain of stride-2 3×3 convolutions
    Down(Vec<ConvBn>),
}

/// Parallel branches followed by all-to-all fusion
#[derive(Debug, Clone)]
struct HighResolutionModule {
    branches: Vec<Vec<Block>>,
    fuse_layers: Vec<Vec<FuseLink>>,
}

impl HighResolutionModule {
    fn new(
        spec: &StageSpec,
        in_channels: &[usize],
        ctx: &LayerCtx,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let out_channels = spec.branch_channels();

        let mut branches = Vec::with_capacity(spec.num_branches);
        for b in 0..spec.num_branches {
            let vb_b = vb.pp(format!("branches.{b}"));
            branches.push(make_blocks(
                spec.block,
                in_channels[b],
                spec.num_channels[b],
                spec.num_blocks[b],
                ctx,
                vb_b,
            )?);
        }

        let mut fuse_layers = Vec::new();
        if spec.num_branches > 1 {
            for i in 0..spec.num_branches {
                let mut links = Vec::with_capacity(spec.num_branches);
                for j in 0..spec.num_branches {
                    let vb_ij = vb.pp(format!("fuse_layers.{i}.{j}"));
                    let link = if j > i {
                        FuseLink::Up(ConvBn::plain(
                            out_channels[j],
                            out_channels[i],
                            1,
                            1,
                            ctx,
                            vb_ij,
                        )?)
                    } else if j == i {
                        FuseLink::Identity
                    } else {
                        let steps = i - j;
                        let mut chain = Vec::with_capacity(steps);
                        for k in 0..steps {
                            let vb_k = vb_ij.pp(k.to_string());
                            if k == steps - 1 {
                                chain.push(ConvBn::plain(
                                    out_channels[j],
                                    out_channels[i],
                                    3,
                                    2,
                                    ctx,
                                    vb_k,
                                )?);
                            } else {
                                chain.push(ConvBn::relu(
                                    out_channels[j],
                                    out_channels[j],
                                    3,
                                    2,
                                    ctx,
                                    vb_k,
                                )?);
                            }
                        }
                        FuseLink::Down(chain)
                    };
                    links.push(link);
                }
                fuse_layers.push(links);
            }
        }

        Ok(Self {
            branches,
            fuse_layers,
        })
    }

    fn forward_t(&self, xs: &[Tensor], train: bool) -> candle_core::Result<Vec<Tensor>> {
        let mut refined = Vec::with_capacity(xs.len());
        for (x, blocks) in xs.iter().zip(&self.branches) {
            let mut x = x.clone();
            for block in blocks {
                x = block.forward_t(&x, train)?;
            }
            refined.push(x);
        }

        if self.fuse_layers.is_empty() {
            return Ok(refined);
        }

        let mut fused = Vec::with_capacity(self.fuse_layers.len());
        for (i, links) in self.fuse_layers.iter().enumerate() {
            let (_, _, h, w) = refined[i].dims4()?;
            let mut y: Option<Tensor> = None;
            for (j, link) in links.iter().enumerate() {
                let contribution = match link {
                    FuseLink::Identity => refined[j].clone(),
                    FuseLink::Up(conv) => conv
                        .forward_t(&refined[j], train)?
                        .upsample_nearest2d(h, w)?,
                    FuseLink::Down(chain) => {
                        let mut z = refined[j].clone();
                        for conv in chain {
                            z = conv.forward_t(&z, train)?;
                        }
                        z
                    }
                };
                y = Some(match y {
                    Some(acc) => (acc + contribution)?,
                    None => contribution,
                });
            }
            if let Some(y) = y {
                fused.push(y.relu()?);
            }
        }

        Ok(fused)
    }
}

fn make_blocks(
    kind: BlockKind,
    in_channels: usize,
    planes: usize,
    count: usize,
    ctx: &LayerCtx,
    vb: VarBuilder,
) -> candle_core::Result<Vec<Block>> {
    let out_channels = planes * kind.expansion();
    let mut blocks = Vec::with_capacity(count);
    for i in 0..count {
        let cin = if i == 0 { in_channels } else { out_channels };
        let vb_i = vb.pp(i.to_string());
        blocks.push(match kind {
            BlockKind::Basic => Block::Basic(BasicBlock::new(cin, out_channels, 1, ctx, vb_i)?),
            BlockKind::Bottleneck => {
                Block::Bottleneck(ResidualBlock::new(cin, out_channels, 1, ctx, vb_i)?)
            }
        });
    }
    Ok(blocks)
}

/// Entry into the next stage for one branch
#[derive(Debug, Clone)]
enum Transition {
    Keep,
    Project(ConvBn),
    /// New, coarser branch spawned from the coarsest previous branch
    Spawn(Vec<ConvBn>),
}

fn make_transition(
    previous: &[usize],
    current: &[usize],
    ctx: &LayerCtx,
    vb: VarBuilder,
) -> candle_core::Result<Vec<Transition>> {
    let mut transitions = Vec::with_capacity(current.len());
    let coarsest = previous[previous.len() - 1];

    for (i, &cur) in current.iter().enumerate() {
        let vb_i = vb.pp(i.to_string());
        let t = if i < previous.len() {
            if previous[i] != cur {
                Transition::Project(ConvBn::relu(previous[i], cur, 3, 1, ctx, vb_i)?)
            } else {
                Transition::Keep
            }
        } else {
            let steps = i + 1 - previous.len();
            let mut chain = Vec::with_capacity(steps);
            for k in 0..steps {
                let out = if k == steps - 1 { cur } else { coarsest };
                chain.push(ConvBn::relu(coarsest, out, 3, 2, ctx, vb_i.pp(k.to_string()))?);
            }
            Transition::Spawn(chain)
        };
        transitions.push(t);
    }

    Ok(transitions)
}

fn apply_transition(
    transitions: &[Transition],
    streams: &[Tensor],
    train: bool,
) -> candle_core::Result<Vec<Tensor>> {
    let coarsest = &streams[streams.len() - 1];
    transitions
        .iter()
        .enumerate()
        .map(|(i, t)| match t {
            Transition::Keep => Ok(streams[i].clone()),
            Transition::Project(conv) => conv.forward_t(&streams[i], train),
            Transition::Spawn(chain) => {
                let mut x = coarsest.clone();
                for conv in chain {
                    x = conv.forward_t(&x, train)?;
                }
                Ok(x)
            }
        })
        .collect()
}

/// Streams produced by the backbone, before any merging
#[derive(Debug, Clone)]
pub struct BackboneStreams {
    /// Stage 1 output (one stream, 1/4 resolution)
    pub single: Tensor,
    /// Stage 2-4 outputs, finest stream first
    pub stages: [Vec<Tensor>; 3],
}

/// HRNet classification backbone without its classification head
#[derive(Debug, Clone)]
pub struct HrNetBackbone {
    conv1: ConvBn,
    conv2: ConvBn,
    layer1: Vec<Block>,
    transitions: [Vec<Transition>; 3],
    stages: [Vec<HighResolutionModule>; 3],
    gate: GradGate,
    config: HrNetConfig,
}

impl HrNetBackbone {
    /// Width of the two stride-2 stem convolutions
    pub const STEM_CHANNELS: usize = 64;

    pub fn new(config: HrNetConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let gate = GradGate::new();
        let ctx = LayerCtx::encoder(gate.clone());
        let stem = Self::STEM_CHANNELS;

        let conv1 = ConvBn::relu(3, stem, 3, 2, &ctx, vb.pp("conv1"))?;
        let conv2 = ConvBn::relu(stem, stem, 3, 2, &ctx, vb.pp("conv2"))?;

        let s1 = &config.stage1;
        let layer1 = make_blocks(
            s1.block,
            stem,
            s1.num_channels[0],
            s1.num_blocks[0],
            &ctx,
            vb.pp("layer1"),
        )?;

        let specs = [&config.stage2, &config.stage3, &config.stage4];
        let mut previous = s1.branch_channels();
        let mut transitions = Vec::with_capacity(3);
        let mut stages = Vec::with_capacity(3);

        for (n, spec) in specs.into_iter().enumerate() {
            let current = spec.branch_channels();
            transitions.push(make_transition(
                &previous,
                &current,
                &ctx,
                vb.pp(format!("transition{}", n + 1)),
            )?);

            let vb_stage = vb.pp(format!("stage{}", n + 2));
            let mut modules = Vec::with_capacity(spec.num_modules);
            let mut in_channels = current.clone();
            for m in 0..spec.num_modules {
                modules.push(HighResolutionModule::new(
                    spec,
                    &in_channels,
                    &ctx,
                    vb_stage.pp(m.to_string()),
                )?);
                in_channels = spec.branch_channels();
            }
            stages.push(modules);
            previous = current;
        }

        let transitions: [Vec<Transition>; 3] = transitions
            .try_into()
            .map_err(|_| Error::Config("backbone must have three fused stages".to_string()))?;
        let stages: [Vec<HighResolutionModule>; 3] = stages
            .try_into()
            .map_err(|_| Error::Config("backbone must have three fused stages".to_string()))?;

        Ok(Self {
            conv1,
            conv2,
            layer1,
            transitions,
            stages,
            gate,
            config,
        })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<BackboneStreams> {
        let x = self.conv1.forward_t(x, train)?;
        let mut x = self.conv2.forward_t(&x, train)?;
        for block in &self.layer1 {
            x = block.forward_t(&x, train)?;
        }
        let single = x;

        let mut streams = vec![single.clone()];
        let mut outputs: Vec<Vec<Tensor>> = Vec::with_capacity(3);
        for (transition, modules) in self.transitions.iter().zip(&self.stages) {
            let mut ys = apply_transition(transition, &streams, train)?;
            for module in modules {
                ys = module.forward_t(&ys, train)?;
            }
            outputs.push(ys.clone());
            streams = ys;
        }

        let stages: [Vec<Tensor>; 3] = outputs
            .try_into()
            .map_err(|_| Error::InvalidInput("backbone produced an unexpected stage count".into()))?;

        Ok(BackboneStreams { single, stages })
    }

    /// Stop gradient flow into backbone parameters
    pub fn freeze(&self) {
        self.gate.freeze();
    }

    pub fn unfreeze(&self) {
        self.gate.unfreeze();
    }

    pub fn is_frozen(&self) -> bool {
        self.gate.is_frozen()
    }

    pub fn config(&self) -> &HrNetConfig {
        &self.config
    }
}

/// Name of a backbone variable in the reference HRNet checkpoint layout.
///
/// Reference checkpoints store plain `nn.Sequential` modules: a named conv
/// unit keeps its conv under `convN` and its norm under `bnN`, while
/// unnamed units (transitions, fuse links, downsample paths) index the conv
/// as `.0` and the norm as `.1`. Returns `None` for names outside a conv
/// unit.
///
/// `layer1.0.conv2.bn.weight` → `layer1.0.bn2.weight`,
/// `transition1.1.0.conv.weight` → `transition1.1.0.0.weight`.
pub fn reference_key(name: &str) -> Option<String> {
    let mut parts: Vec<&str> = name.split('.').collect();
    if parts.len() < 3 {
        return None;
    }
    let param = parts.pop()?;
    let layer = parts.pop()?;
    let owner = parts.pop()?;

    let renamed = match (layer, owner.strip_prefix("conv")) {
        ("conv", Some(n)) if n.parse::<usize>().is_ok() => vec![owner.to_string()],
        ("bn", Some(n)) if n.parse::<usize>().is_ok() => vec![format!("bn{n}")],
        ("conv", _) => vec![owner.to_string(), "0".to_string()],
        ("bn", _) => vec![owner.to_string(), "1".to_string()],
        _ => return None,
    };

    let mut key: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
    key.extend(renamed);
    key.push(param.to_string());
    Some(key.join("."))
}
