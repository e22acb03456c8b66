//! The full policy: vision encoder, instruction fusion, causal action
//! decoder, and discretization head.
//!
//! One forward call maps a video clip, an instruction, and an optional
//! action history to per-actuator, per-bin logits of shape
//! `(batch, time, actuators, bins)`. Parameters are immutable during the
//! call; `forward` takes `&self` and may run concurrently over different
//! batches. The only stochastic element, conditioning dropout, is driven by
//! the caller through [`CondDrop`].

use candle::{IndexOp, Module, Tensor};
use candle_nn::VarBuilder;

use crate::action::{ActionDiscretizer, ActionHead, RangePolicy};
use crate::conditioning::{CondDrop, Conditioner};
use crate::config::Config;
use crate::decoder::{causal_mask, posemb_sincos_1d, ActionDecoder, ActionHistoryEmbedding};
use crate::error::{Error, Result};
use crate::instruction::{resolve_instruction, EmbeddingTableEncoder, Instruction, InstructionEncoder};
use crate::vision::VisionEncoder;

const POS_EMB_TEMPERATURE: f64 = 10_000.0;

pub struct RoboticTransformer {
    vision: VisionEncoder,
    conditioner: Conditioner,
    text_encoder: EmbeddingTableEncoder,
    history: ActionHistoryEmbedding,
    decoder: ActionDecoder,
    head: ActionHead,
    discretizer: ActionDiscretizer,
    cfg: Config,
    span: tracing::Span,
}

impl RoboticTransformer {
    /// Validates the configuration, then builds every sub-module under the
    /// given variable namespace.
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let d = &cfg.decoder;
        Ok(Self {
            vision: VisionEncoder::new(&cfg.vision, d.hidden_size, vb.pp("vision"))?,
            conditioner: Conditioner::new(
                d.instr_dim,
                d.hidden_size,
                d.cond_drop_prob,
                vb.pp("conditioner"),
            )?,
            text_encoder: EmbeddingTableEncoder::new(
                d.instr_vocab_size,
                d.instr_dim,
                vb.pp("text_encoder"),
            )?,
            history: ActionHistoryEmbedding::new(d, vb.pp("history"))?,
            decoder: ActionDecoder::new(d, vb.pp("decoder"))?,
            head: ActionHead::new(d, vb.pp("head"))?,
            discretizer: ActionDiscretizer::from_config(d, RangePolicy::Clamp)?,
            cfg: cfg.clone(),
            span: tracing::span!(tracing::Level::TRACE, "robotic-transformer"),
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// The clamp-mode quantizer matching this model's bin layout. Callers
    /// wanting strict range checking build their own via
    /// [`ActionDiscretizer::from_config`].
    pub fn discretizer(&self) -> &ActionDiscretizer {
        &self.discretizer
    }

    /// Embeds raw instruction strings with the built-in minimal encoder.
    /// External text encoders produce [`Instruction::Embedded`] instead.
    pub fn embed_texts(&self, texts: &[String]) -> Result<Tensor> {
        self.text_encoder.encode(texts)
    }

    fn validate_video(&self, video: &Tensor) -> Result<(usize, usize)> {
        let v = &self.cfg.vision;
        let (b, c, f, h, w) = video.dims5().map_err(|_| {
            Error::shape(
                "video",
                "(batch, channel, time, height, width)",
                format!("{:?}", video.dims()),
            )
        })?;
        if c != v.in_channels || h != v.image_size || w != v.image_size {
            return Err(Error::shape(
                "video",
                format!("(_, {}, _, {}, {})", v.in_channels, v.image_size, v.image_size),
                format!("({b}, {c}, {f}, {h}, {w})"),
            ));
        }
        if b == 0 || f == 0 {
            return Err(Error::shape("video", "non-empty batch and clip", format!("({b}, {f})")));
        }
        Ok((b, f))
    }

    /// Full forward pass.
    ///
    /// * `video` - `(batch, channel, time, height, width)`
    /// * `instruction` - raw strings or pre-computed embeddings
    /// * `action_history` - optional `(batch, len)` flat or
    ///   `(batch, timesteps, actuators)` tokens for autoregressive
    ///   continuation; unfilled slots use learned start embeddings
    /// * `cond_drop` - conditioning-dropout policy for this call
    ///
    /// Returns logits `(batch, time, actuators, bins)`.
    pub fn forward(
        &self,
        video: &Tensor,
        instruction: &Instruction,
        action_history: Option<&Tensor>,
        cond_drop: CondDrop,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let d = &self.cfg.decoder;
        let (batch, frames) = self.validate_video(video)?;
        let instr = resolve_instruction(instruction, &self.text_encoder, batch, d.instr_dim)?;
        let dropped = self.conditioner.resolve_mask(batch, cond_drop)?;

        // Per-frame embeddings: fold time into batch for the encoder.
        let (_, c, _, h, w) = video.dims5()?;
        let flat = video
            .permute((0, 2, 1, 3, 4))?
            .contiguous()?
            .reshape((batch * frames, c, h, w))?;
        let frame_embeds = self
            .vision
            .forward(&flat)?
            .reshape((batch, frames, d.hidden_size))?;

        // Instruction fusion with the resolved dropout mask.
        let obs_tokens = self.conditioner.forward(&frame_embeds, &instr, &dropped)?;

        // Action slots: table lookups where history exists, start
        // embeddings elsewhere.
        let act_tokens = self
            .history
            .forward(action_history, batch, frames)?
            .reshape((batch, frames, d.num_actuators, d.hidden_size))?;

        // Timestep positions, shared by the observation token and every
        // action slot of that timestep.
        let device = video.device();
        let pos = posemb_sincos_1d(frames, d.hidden_size, POS_EMB_TEMPERATURE, device)?;
        let obs_tokens = obs_tokens.broadcast_add(&pos.unsqueeze(0)?)?;
        let act_tokens = act_tokens.broadcast_add(&pos.unsqueeze(0)?.unsqueeze(2)?)?;

        // Interleave: [obs_t, act_(t,0) .. act_(t,A-1)] per timestep.
        let per_step = d.num_actuators + 1;
        let tokens = Tensor::cat(&[obs_tokens.unsqueeze(2)?, act_tokens], 2)?
            .reshape((batch, frames * per_step, d.hidden_size))?;

        let mask = causal_mask(frames * per_step, device)?;
        let hidden = self.decoder.forward(&tokens, &mask)?;

        // Readout: the hidden state at index t*(A+1)+a predicts actuator a
        // of timestep t, so logits never see their own or later actions.
        let hidden = hidden
            .reshape((batch, frames, per_step, d.hidden_size))?
            .narrow(2, 0, d.num_actuators)?;
        Ok(self.head.forward(&hidden)?)
    }

    /// Classifier-free-guidance forward: one conditioned and one
    /// unconditioned pass, combined as
    /// `uncond + guidance_scale * (cond - uncond)`. A scale of 1 reduces to
    /// a single conditioned pass.
    pub fn forward_with_guidance(
        &self,
        video: &Tensor,
        instruction: &Instruction,
        action_history: Option<&Tensor>,
        guidance_scale: f64,
    ) -> Result<Tensor> {
        let cond = self.forward(video, instruction, action_history, CondDrop::Keep)?;
        if guidance_scale == 1.0 {
            return Ok(cond);
        }
        let uncond = self.forward(video, instruction, action_history, CondDrop::Drop)?;
        let delta = ((cond - &uncond)? * guidance_scale)?;
        Ok((uncond + delta)?)
    }

    /// Logits for one `(timestep, actuator)` slot, shape `(batch, bins)`.
    /// Convenience for rollout drivers.
    pub fn slot_logits(&self, logits: &Tensor, timestep: usize, actuator: usize) -> Result<Tensor> {
        Ok(logits.i((.., timestep, actuator, ..))?)
    }
}
