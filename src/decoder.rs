//! Causal transformer decoder over interleaved observation/action tokens.
//!
//! The token sequence lays out each timestep as one conditioned observation
//! token followed by one token per actuator slot, flattened over time:
//!
//! ```text
//! [obs_0, act_(0,0) .. act_(0,A-1), obs_1, act_(1,0) .. ]
//! ```
//!
//! A lower-triangular mask over that layout enforces the factorization the
//! rollout needs: the hidden state at index `t*(A+1) + a` has seen
//! timesteps `<= t` and, within `t`, action slots `< a` only, and is read
//! out as the logits for actuator `a` at timestep `t`.

use candle::{DType, Device, IndexOp, Module, Result, Tensor, D};
use candle_nn::{embedding, layer_norm, linear, linear_no_bias, Embedding, Init, LayerNorm, Linear, VarBuilder};

use crate::config::DecoderConfig;
use crate::error::Error;

// ============================================================================
// Positions and masking
// ============================================================================

/// 1-D sinusoidal position embedding of shape `(seq, dim)`; `dim` is even.
pub fn posemb_sincos_1d(seq: usize, dim: usize, temperature: f64, device: &Device) -> Result<Tensor> {
    let half = dim / 2;
    let omega: Vec<f32> = (0..half)
        .map(|i| {
            let exp = i as f64 / (half.max(2) - 1) as f64;
            (1.0 / temperature.powf(exp)) as f32
        })
        .collect();
    let omega = Tensor::from_vec(omega, (1, half), device)?;
    let n = Tensor::arange(0f32, seq as f32, device)?.reshape((seq, 1))?;
    let angles = n.broadcast_mul(&omega)?;
    Tensor::cat(&[angles.sin()?, angles.cos()?], D::Minus1)
}

/// Additive causal mask `(1, 1, len, len)`: zero where position `i` may
/// attend to `j` (`j <= i`), `-inf` elsewhere.
pub fn causal_mask(len: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; len * len];
    for i in 0..len {
        for j in (i + 1)..len {
            data[i * len + j] = f32::NEG_INFINITY;
        }
    }
    Tensor::from_vec(data, (1, 1, len, len), device)
}

// ============================================================================
// Transformer blocks
// ============================================================================

struct Attention {
    norm: LayerNorm,
    qkv: Linear,
    proj: Linear,
    heads: usize,
    head_dim: usize,
    scale: f64,
    span: tracing::Span,
}

impl Attention {
    fn new(dim: usize, heads: usize, dim_head: usize, vb: VarBuilder) -> Result<Self> {
        let inner = heads * dim_head;
        Ok(Self {
            norm: layer_norm(dim, 1e-5, vb.pp("norm"))?,
            qkv: linear_no_bias(dim, inner * 3, vb.pp("qkv"))?,
            proj: linear_no_bias(inner, dim, vb.pp("proj"))?,
            heads,
            head_dim: dim_head,
            scale: (dim_head as f64).powf(-0.5),
            span: tracing::span!(tracing::Level::TRACE, "decoder-attn"),
        })
    }

    fn forward(&self, xs: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b, n, _) = xs.dims3()?;
        let qkv = self
            .qkv
            .forward(&self.norm.forward(xs)?)?
            .reshape((b, n, 3, self.heads, self.head_dim))?
            .permute((2, 0, 3, 1, 4))?;
        let q = qkv.i(0)?.contiguous()?;
        let k = qkv.i(1)?.contiguous()?;
        let v = qkv.i(2)?.contiguous()?;

        let attn = (q * self.scale)?.matmul(&k.transpose(2, 3)?)?;
        let attn = attn.broadcast_add(mask)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, n, self.heads * self.head_dim))?;
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

struct DecoderBlock {
    attn: Attention,
    ff: FeedForward,
}

impl DecoderBlock {
    fn new(cfg: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attn: Attention::new(cfg.hidden_size, cfg.heads, cfg.dim_head, vb.pp("attn"))?,
            ff: FeedForward::new(cfg.hidden_size, cfg.ff_mult, vb.pp("ff"))?,
        })
    }

    fn forward(&self, xs: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let xs = (self.attn.forward(xs, mask)? + xs)?;
        self.ff.forward(&xs)? + xs
    }
}

/// The decoder trunk: pre-norm transformer blocks under a causal mask,
/// with a final LayerNorm.
pub struct ActionDecoder {
    blocks: Vec<DecoderBlock>,
    norm: LayerNorm,
    span: tracing::Span,
}

impl ActionDecoder {
    pub fn new(cfg: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let mut blocks = Vec::with_capacity(cfg.depth);
        for i in 0..cfg.depth {
            blocks.push(DecoderBlock::new(cfg, vb.pp(format!("blocks.{i}")))?);
        }
        Ok(Self {
            blocks,
            norm: layer_norm(cfg.hidden_size, 1e-5, vb.pp("norm"))?,
            span: tracing::span!(tracing::Level::TRACE, "action-decoder"),
        })
    }

    pub fn forward(&self, tokens: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let mut xs = tokens.clone();
        for block in &self.blocks {
            xs = block.forward(&xs, mask)?;
        }
        self.norm.forward(&xs)
    }
}

// ============================================================================
// Action history embedding
// ============================================================================

/// Embeds discretized action history into decoder tokens.
///
/// One table row per `(actuator, bin)` pair; slots not yet present in the
/// history (everything, at the start of a rollout) use a learned
/// per-actuator start embedding so the sequence always carries one token
/// per `(timestep, actuator)` slot.
pub struct ActionHistoryEmbedding {
    table: Embedding,
    start: Tensor,
    num_actuators: usize,
    num_bins: usize,
}

impl ActionHistoryEmbedding {
    pub fn new(cfg: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let table = embedding(
            cfg.num_actuators * cfg.num_bins,
            cfg.hidden_size,
            vb.pp("table"),
        )?;
        let start = vb.get_with_hints(
            (cfg.num_actuators, cfg.hidden_size),
            "start",
            Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        Ok(Self {
            table,
            start,
            num_actuators: cfg.num_actuators,
            num_bins: cfg.num_bins,
        })
    }

    /// Normalizes an optional history tensor to flat, per-row token lists.
    ///
    /// Accepts `(batch, len)` already flattened in timestep-major /
    /// actuator-minor order, or `(batch, timesteps, actuators)`. Empty
    /// history is represented by `None` or a zero-length dimension.
    fn flatten_history(
        &self,
        history: Option<&Tensor>,
        batch: usize,
        frames: usize,
    ) -> crate::error::Result<Vec<Vec<u32>>> {
        let max_len = frames * self.num_actuators;
        let rows = match history {
            None => vec![Vec::new(); batch],
            Some(h) => {
                let flat = match h.rank() {
                    2 => h.clone(),
                    3 => {
                        let (b, t, a) = h.dims3()?;
                        if a != self.num_actuators {
                            return Err(Error::shape(
                                "action history",
                                format!("{} actuators", self.num_actuators),
                                format!("{a} actuators"),
                            ));
                        }
                        h.reshape((b, t * a))?
                    }
                    r => {
                        return Err(Error::shape(
                            "action history",
                            "rank 2 or 3",
                            format!("rank {r} tensor {:?}", h.dims()),
                        ))
                    }
                };
                let (b, len) = flat.dims2()?;
                if b != batch {
                    return Err(Error::shape(
                        "action history",
                        format!("batch {batch}"),
                        format!("batch {b}"),
                    ));
                }
                if len > max_len {
                    return Err(Error::shape(
                        "action history",
                        format!("at most {max_len} tokens for {frames} frames"),
                        format!("{len} tokens"),
                    ));
                }
                if len == 0 {
                    vec![Vec::new(); batch]
                } else {
                    flat.to_dtype(DType::U32)?.to_vec2::<u32>()?
                }
            }
        };
        for row in &rows {
            if let Some(&bin) = row.iter().find(|&&b| b as usize >= self.num_bins) {
                return Err(Error::shape(
                    "action history",
                    format!("bins < {}", self.num_bins),
                    format!("bin {bin}"),
                ));
            }
        }
        Ok(rows)
    }

    /// Produces one token per `(timestep, actuator)` slot, shape
    /// `(batch, frames * actuators, hidden)`. Filled slots come from the
    /// lookup table, the rest from the start embeddings.
    pub fn forward(
        &self,
        history: Option<&Tensor>,
        batch: usize,
        frames: usize,
    ) -> crate::error::Result<Tensor> {
        let rows = self.flatten_history(history, batch, frames)?;
        let device = self.start.device();
        let max_len = frames * self.num_actuators;

        let mut per_row = Vec::with_capacity(batch);
        for row in &rows {
            let filled = if row.is_empty() {
                None
            } else {
                let ids: Vec<u32> = row
                    .iter()
                    .enumerate()
                    .map(|(slot, &bin)| {
                        let actuator = slot % self.num_actuators;
                        (actuator * self.num_bins) as u32 + bin
                    })
                    .collect();
                let ids = Tensor::from_vec(ids, (row.len(),), device)?;
                Some(self.table.forward(&ids)?)
            };
            let remaining = max_len - row.len();
            let padding = if remaining > 0 {
                let slots: Vec<u32> = (row.len()..max_len)
                    .map(|slot| (slot % self.num_actuators) as u32)
                    .collect();
                let slots = Tensor::from_vec(slots, (remaining,), device)?;
                Some(self.start.index_select(&slots, 0)?)
            } else {
                None
            };
            let tokens = match (filled, padding) {
                (Some(f), Some(p)) => Tensor::cat(&[f, p], 0)?,
                (Some(f), None) => f,
                (None, Some(p)) => p,
                (None, None) => unreachable!("frames and actuators are positive"),
            };
            per_row.push(tokens);
        }
        Ok(Tensor::stack(&per_row, 0)?)
    }
}
