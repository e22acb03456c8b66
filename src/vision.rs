//! Hierarchical windowed-attention vision encoder (MaxViT-style).
//!
//! A convolutional stem is followed by stages of blocks. Each block is an
//! MBConv inverted bottleneck (with squeeze-excitation), then multi-head
//! self-attention over non-overlapping `w x w` windows ("block" attention),
//! then attention over strided partitions of the same size ("grid"
//! attention) which gives every cell a global receptive field. The first
//! block of each stage downsamples by 2 and doubles the channel width.
//!
//! The final stage is pooled over space, normalized, and projected to the
//! decoder width: one embedding per input frame.

use candle::{IndexOp, Module, ModuleT, Result, Tensor, D};
use candle_nn::{
    batch_norm, conv2d, embedding, layer_norm, linear, linear_no_bias, BatchNorm, Conv2d,
    Conv2dConfig, Embedding, LayerNorm, Linear, VarBuilder,
};

use crate::config::VisionConfig;

// ============================================================================
// Stem
// ============================================================================

struct ConvStem {
    conv1: Conv2d,
    conv2: Conv2d,
}

impl ConvStem {
    fn new(in_channels: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        let cfg1 = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let cfg2 = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            conv1: conv2d(in_channels, dim, 3, cfg1, vb.pp("conv1"))?,
            conv2: conv2d(dim, dim, 3, cfg2, vb.pp("conv2"))?,
        })
    }
}

impl Module for ConvStem {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv2.forward(&self.conv1.forward(xs)?)
    }
}

// ============================================================================
// MBConv
// ============================================================================

struct SqueezeExcitation {
    fc1: Linear,
    fc2: Linear,
}

impl SqueezeExcitation {
    fn new(dim: usize, shrinkage_rate: f64, vb: VarBuilder) -> Result<Self> {
        let hidden = ((dim as f64 * shrinkage_rate) as usize).max(1);
        Ok(Self {
            fc1: linear_no_bias(dim, hidden, vb.pp("fc1"))?,
            fc2: linear_no_bias(hidden, dim, vb.pp("fc2"))?,
        })
    }
}

impl Module for SqueezeExcitation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // Global average pool to (batch, channels), gate, scale back up.
        let gate = xs.mean(D::Minus1)?.mean(D::Minus1)?;
        let gate = self.fc1.forward(&gate)?.silu()?;
        let gate = candle_nn::ops::sigmoid(&self.fc2.forward(&gate)?)?;
        xs.broadcast_mul(&gate.unsqueeze(D::Minus1)?.unsqueeze(D::Minus1)?)
    }
}

/// Inverted-bottleneck convolution: 1x1 expand, 3x3 depthwise (stride 2 when
/// downsampling), squeeze-excitation, 1x1 project. Residual when the input
/// and output shapes line up. The stochastic-depth branch scale is identity
/// here; training-time drop is owned by the external training framework.
struct MbConv {
    expand: Conv2d,
    bn1: BatchNorm,
    depthwise: Conv2d,
    bn2: BatchNorm,
    se: SqueezeExcitation,
    project: Conv2d,
    bn3: BatchNorm,
    residual: bool,
}

impl MbConv {
    fn new(
        dim_in: usize,
        dim_out: usize,
        downsample: bool,
        expansion_rate: usize,
        shrinkage_rate: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let hidden = expansion_rate * dim_out;
        let stride = if downsample { 2 } else { 1 };
        let dw_cfg = Conv2dConfig {
            padding: 1,
            stride,
            groups: hidden,
            ..Default::default()
        };
        Ok(Self {
            expand: conv2d(dim_in, hidden, 1, Default::default(), vb.pp("expand"))?,
            bn1: batch_norm(hidden, 1e-5, vb.pp("bn1"))?,
            depthwise: conv2d(hidden, hidden, 3, dw_cfg, vb.pp("depthwise"))?,
            bn2: batch_norm(hidden, 1e-5, vb.pp("bn2"))?,
            se: SqueezeExcitation::new(hidden, shrinkage_rate, vb.pp("se"))?,
            project: conv2d(hidden, dim_out, 1, Default::default(), vb.pp("project"))?,
            bn3: batch_norm(dim_out, 1e-5, vb.pp("bn3"))?,
            residual: dim_in == dim_out && !downsample,
        })
    }
}

impl Module for MbConv {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = self.bn1.forward_t(&self.expand.forward(xs)?, false)?.gelu()?;
        let h = self
            .bn2
            .forward_t(&self.depthwise.forward(&h)?, false)?
            .gelu()?;
        let h = self.se.forward(&h)?;
        let h = self.bn3.forward_t(&self.project.forward(&h)?, false)?;
        if self.residual {
            h + xs
        } else {
            Ok(h)
        }
    }
}

// ============================================================================
// Windowed attention
// ============================================================================

/// Multi-head self-attention within square windows, with a learned relative
/// position bias over the `(2w - 1)^2` possible offsets.
struct WindowAttention {
    norm: LayerNorm,
    qkv: Linear,
    proj: Linear,
    rel_pos_bias: Embedding,
    rel_pos_indices: Tensor,
    heads: usize,
    head_dim: usize,
    scale: f64,
    span: tracing::Span,
}

impl WindowAttention {
    fn new(dim: usize, dim_head: usize, window_size: usize, vb: VarBuilder) -> Result<Self> {
        let heads = dim / dim_head;
        let w = window_size;
        // Flattened (w^2, w^2) table of relative-offset ids, row-major over
        // query then key cell.
        let mut indices = Vec::with_capacity(w * w * w * w);
        for qy in 0..w {
            for qx in 0..w {
                for ky in 0..w {
                    for kx in 0..w {
                        let dy = qy + w - 1 - ky;
                        let dx = qx + w - 1 - kx;
                        indices.push((dy * (2 * w - 1) + dx) as u32);
                    }
                }
            }
        }
        let rel_pos_indices = Tensor::from_vec(indices, (w * w * w * w,), vb.device())?;
        Ok(Self {
            norm: layer_norm(dim, 1e-5, vb.pp("norm"))?,
            qkv: linear_no_bias(dim, dim * 3, vb.pp("qkv"))?,
            proj: linear_no_bias(dim, dim, vb.pp("proj"))?,
            rel_pos_bias: embedding((2 * w - 1) * (2 * w - 1), heads, vb.pp("rel_pos_bias"))?,
            rel_pos_indices,
            heads,
            head_dim: dim_head,
            scale: (dim_head as f64).powf(-0.5),
            span: tracing::span!(tracing::Level::TRACE, "window-attn"),
        })
    }

    /// `xs` has shape `(num_windows, window_len, dim)`.
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b, n, dim) = xs.dims3()?;
        let xs = self.norm.forward(xs)?;
        let qkv = self
            .qkv
            .forward(&xs)?
            .reshape((b, n, 3, self.heads, self.head_dim))?
            .permute((2, 0, 3, 1, 4))?;
        let q = qkv.i(0)?.contiguous()?;
        let k = qkv.i(1)?.contiguous()?;
        let v = qkv.i(2)?.contiguous()?;

        let attn = (q * self.scale)?.matmul(&k.transpose(2, 3)?)?;
        let bias = self
            .rel_pos_bias
            .forward(&self.rel_pos_indices)?
            .reshape((n, n, self.heads))?
            .permute((2, 0, 1))?
            .unsqueeze(0)?;
        let attn = attn.broadcast_add(&bias)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;

        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, n, dim))?;
        self.proj.forward(&out)
    }
}

struct FeedForward {
    norm: LayerNorm,
    fc1: Linear,
    fc2: Linear,
}

impl FeedForward {
    fn new(dim: usize, mult: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm: layer_norm(dim, 1e-5, vb.pp("norm"))?,
            fc1: linear(dim, dim * mult, vb.pp("fc1"))?,
            fc2: linear(dim * mult, dim, vb.pp("fc2"))?,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.fc2
            .forward(&self.fc1.forward(&self.norm.forward(xs)?)?.gelu()?)
    }
}

// ============================================================================
// Window partitioning
// ============================================================================

/// `(b, c, h, w) -> (b * nh * nw, win * win, c)` over contiguous windows.
fn block_partition(xs: &Tensor, win: usize) -> Result<Tensor> {
    let (b, c, h, w) = xs.dims4()?;
    let (nh, nw) = (h / win, w / win);
    xs.reshape((b, c, nh, win, nw, win))?
        .permute((0, 2, 4, 3, 5, 1))?
        .contiguous()?
        .reshape((b * nh * nw, win * win, c))
}

fn block_merge(xs: &Tensor, win: usize, b: usize, c: usize, h: usize, w: usize) -> Result<Tensor> {
    let (nh, nw) = (h / win, w / win);
    xs.reshape((b, nh, nw, win, win, c))?
        .permute((0, 5, 1, 3, 2, 4))?
        .contiguous()?
        .reshape((b, c, h, w))
}

/// Strided partitioning: the cells of one window are spaced `h / win` apart,
/// so attending within it spans the whole feature map.
fn grid_partition(xs: &Tensor, win: usize) -> Result<Tensor> {
    let (b, c, h, w) = xs.dims4()?;
    let (nh, nw) = (h / win, w / win);
    xs.reshape((b, c, win, nh, win, nw))?
        .permute((0, 3, 5, 2, 4, 1))?
        .contiguous()?
        .reshape((b * nh * nw, win * win, c))
}

fn grid_merge(xs: &Tensor, win: usize, b: usize, c: usize, h: usize, w: usize) -> Result<Tensor> {
    let (nh, nw) = (h / win, w / win);
    xs.reshape((b, nh, nw, win, win, c))?
        .permute((0, 5, 3, 1, 4, 2))?
        .contiguous()?
        .reshape((b, c, h, w))
}

// ============================================================================
// Block and encoder
// ============================================================================

struct MaxVitBlock {
    mbconv: MbConv,
    block_attn: WindowAttention,
    block_ff: FeedForward,
    grid_attn: WindowAttention,
    grid_ff: FeedForward,
    window_size: usize,
}

impl MaxVitBlock {
    fn new(
        cfg: &VisionConfig,
        dim_in: usize,
        dim_out: usize,
        downsample: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let w = cfg.window_size;
        Ok(Self {
            mbconv: MbConv::new(
                dim_in,
                dim_out,
                downsample,
                cfg.expansion_rate,
                cfg.shrinkage_rate,
                vb.pp("mbconv"),
            )?,
            block_attn: WindowAttention::new(dim_out, cfg.dim_head, w, vb.pp("block_attn"))?,
            block_ff: FeedForward::new(dim_out, 4, vb.pp("block_ff"))?,
            grid_attn: WindowAttention::new(dim_out, cfg.dim_head, w, vb.pp("grid_attn"))?,
            grid_ff: FeedForward::new(dim_out, 4, vb.pp("grid_ff"))?,
            window_size: w,
        })
    }
}

impl Module for MaxVitBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.mbconv.forward(xs)?;
        let (b, c, h, w) = xs.dims4()?;
        let win = self.window_size;

        let windows = block_partition(&xs, win)?;
        let windows = (self.block_attn.forward(&windows)? + &windows)?;
        let windows = (self.block_ff.forward(&windows)? + &windows)?;
        let xs = block_merge(&windows, win, b, c, h, w)?;

        let grids = grid_partition(&xs, win)?;
        let grids = (self.grid_attn.forward(&grids)? + &grids)?;
        let grids = (self.grid_ff.forward(&grids)? + &grids)?;
        grid_merge(&grids, win, b, c, h, w)
    }
}

/// The full hierarchical encoder: stem, stages of [`MaxVitBlock`]s, global
/// pooling, and a projection to the decoder width.
pub struct VisionEncoder {
    stem: ConvStem,
    blocks: Vec<MaxVitBlock>,
    norm: LayerNorm,
    proj: Linear,
    span: tracing::Span,
}

impl VisionEncoder {
    /// `out_dim` is the decoder model width; every frame embedding this
    /// encoder emits has that dimensionality.
    pub fn new(cfg: &VisionConfig, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        let stem = ConvStem::new(cfg.in_channels, cfg.stem_dim, vb.pp("stem"))?;
        let mut blocks = Vec::new();
        let mut dim_in = cfg.stem_dim;
        for (stage, &depth) in cfg.depths.iter().enumerate() {
            let dim_out = cfg.stage_dim(stage);
            for block in 0..depth {
                let is_first = block == 0;
                blocks.push(MaxVitBlock::new(
                    cfg,
                    if is_first { dim_in } else { dim_out },
                    dim_out,
                    is_first,
                    vb.pp(format!("stages.{stage}.{block}")),
                )?);
            }
            dim_in = dim_out;
        }
        Ok(Self {
            stem,
            blocks,
            norm: layer_norm(cfg.out_dim(), 1e-5, vb.pp("norm"))?,
            proj: linear(cfg.out_dim(), out_dim, vb.pp("proj"))?,
            span: tracing::span!(tracing::Level::TRACE, "vision-encoder"),
        })
    }

    /// `frames` has shape `(num_frames, channels, height, width)`; the
    /// caller flattens batch and time. Returns `(num_frames, out_dim)`.
    pub fn forward(&self, frames: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let mut xs = self.stem.forward(frames)?;
        for block in &self.blocks {
            xs = block.forward(&xs)?;
        }
        // Global average pool over space.
        let pooled = xs.mean(D::Minus1)?.mean(D::Minus1)?;
        self.proj.forward(&self.norm.forward(&pooled)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn test_partition_roundtrip() -> Result<()> {
        let dev = Device::Cpu;
        let xs = Tensor::arange(0f32, (2 * 3 * 8 * 8) as f32, &dev)?.reshape((2, 3, 8, 8))?;
        for (part, merge) in [
            (
                block_partition as fn(&Tensor, usize) -> Result<Tensor>,
                block_merge as fn(&Tensor, usize, usize, usize, usize, usize) -> Result<Tensor>,
            ),
            (grid_partition, grid_merge),
        ] {
            let windows = part(&xs, 4)?;
            assert_eq!(windows.dims(), [2 * 2 * 2, 16, 3]);
            let back = merge(&windows, 4, 2, 3, 8, 8)?;
            let diff = (back - &xs)?.abs()?.sum_all()?.to_scalar::<f32>()?;
            assert_eq!(diff, 0.0);
        }
        Ok(())
    }

    #[test]
    fn test_encoder_output_shape() -> Result<()> {
        let dev = Device::Cpu;
        let cfg = crate::config::Config::tiny().vision;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let enc = VisionEncoder::new(&cfg, 64, vb)?;
        let frames = Tensor::zeros((3, 3, 64, 64), DType::F32, &dev)?;
        let out = enc.forward(&frames)?;
        assert_eq!(out.dims(), [3, 64]);
        Ok(())
    }
}
