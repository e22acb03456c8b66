//! Instruction conditioning and classifier-free-guidance dropout.
//!
//! Frame embeddings are modulated by the instruction embedding through a
//! FiLM transform (`x * (1 + scale) + shift`), applied uniformly to all
//! frames of a batch element. During training, each batch element
//! independently keeps its instruction or has it replaced by a learned null
//! embedding; the decision is drawn once per forward call, never per frame,
//! and the randomness source is injected by the caller.

use candle::{DType, Module, Tensor, D};
use candle_nn::{linear, Init, Linear, VarBuilder};
use rand::{rngs::StdRng, Rng};

use crate::error::{Error, Result};

/// Where the per-batch-element conditioning-dropout decision comes from.
///
/// `Keep` and `Drop` force the decision (the two branches of a
/// classifier-free-guidance pair); `Mask` supplies a pre-sampled decision
/// per batch element; `Sample` draws one from the caller's generator using
/// the configured probability.
pub enum CondDrop<'r> {
    Keep,
    Drop,
    Mask(Vec<bool>),
    Sample(&'r mut StdRng),
}

pub struct Conditioner {
    null_embedding: Tensor,
    to_film: Linear,
    cond_drop_prob: f64,
    span: tracing::Span,
}

impl Conditioner {
    pub fn new(
        instr_dim: usize,
        model_dim: usize,
        cond_drop_prob: f64,
        vb: VarBuilder,
    ) -> candle::Result<Self> {
        let null_embedding = vb.get_with_hints(
            (instr_dim,),
            "null_embedding",
            Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        Ok(Self {
            null_embedding,
            to_film: linear(instr_dim, 2 * model_dim, vb.pp("to_film"))?,
            cond_drop_prob,
            span: tracing::span!(tracing::Level::TRACE, "conditioner"),
        })
    }

    /// Resolves the dropout policy to one boolean per batch element
    /// (`true` = instruction dropped). Fixed for the whole forward pass.
    pub fn resolve_mask(&self, batch: usize, cond_drop: CondDrop) -> Result<Vec<bool>> {
        match cond_drop {
            CondDrop::Keep => Ok(vec![false; batch]),
            CondDrop::Drop => Ok(vec![true; batch]),
            CondDrop::Mask(mask) => {
                if mask.len() != batch {
                    return Err(Error::shape(
                        "conditioning mask",
                        format!("{batch} entries"),
                        format!("{} entries", mask.len()),
                    ));
                }
                Ok(mask)
            }
            CondDrop::Sample(rng) => Ok((0..batch)
                .map(|_| rng.gen::<f64>() < self.cond_drop_prob)
                .collect()),
        }
    }

    /// Applies FiLM modulation to `frame_embeds` of shape
    /// `(batch, frames, model_dim)` given `instr_embeds` of shape
    /// `(batch, instr_dim)` and the resolved dropout mask.
    pub fn forward(
        &self,
        frame_embeds: &Tensor,
        instr_embeds: &Tensor,
        dropped: &[bool],
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (batch, _frames, model_dim) = frame_embeds.dims3()?;
        let device = frame_embeds.device();

        // Swap dropped rows for the learned null embedding.
        let keep: Vec<f32> = dropped.iter().map(|&d| if d { 0.0 } else { 1.0 }).collect();
        let keep = Tensor::from_vec(keep, (batch, 1), device)?;
        let drop = keep.affine(-1.0, 1.0)?;
        let instr = instr_embeds
            .broadcast_mul(&keep)?
            .broadcast_add(&self.null_embedding.unsqueeze(0)?.broadcast_mul(&drop)?)?;

        let film = self.to_film.forward(&instr.to_dtype(DType::F32)?)?;
        let scale = film.narrow(D::Minus1, 0, model_dim)?.unsqueeze(1)?;
        let shift = film.narrow(D::Minus1, model_dim, model_dim)?.unsqueeze(1)?;
        Ok(frame_embeds
            .broadcast_mul(&(scale + 1.0)?)?
            .broadcast_add(&shift)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;
    use candle_nn::{VarBuilder, VarMap};
    use rand::SeedableRng;

    fn conditioner(prob: f64, dev: &Device) -> Conditioner {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        Conditioner::new(8, 16, prob, vb).unwrap()
    }

    #[test]
    fn test_mask_resolution_extremes() {
        let dev = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(7);
        let always = conditioner(1.0, &dev);
        assert_eq!(
            always.resolve_mask(3, CondDrop::Sample(&mut rng)).unwrap(),
            vec![true; 3]
        );
        let never = conditioner(0.0, &dev);
        assert_eq!(
            never.resolve_mask(3, CondDrop::Sample(&mut rng)).unwrap(),
            vec![false; 3]
        );
    }

    #[test]
    fn test_mask_seed_reproducible() {
        let dev = Device::Cpu;
        let cond = conditioner(0.5, &dev);
        let mut rng1 = StdRng::seed_from_u64(42);
        let mut rng2 = StdRng::seed_from_u64(42);
        let a = cond.resolve_mask(64, CondDrop::Sample(&mut rng1)).unwrap();
        let b = cond.resolve_mask(64, CondDrop::Sample(&mut rng2)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_mask_length_checked() {
        let dev = Device::Cpu;
        let cond = conditioner(0.5, &dev);
        let err = cond.resolve_mask(3, CondDrop::Mask(vec![true])).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_dropped_rows_use_null_embedding() -> Result<()> {
        let dev = Device::Cpu;
        let cond = conditioner(0.5, &dev);
        let frames = Tensor::ones((2, 3, 16), DType::F32, &dev)?;
        let instr = Tensor::ones((2, 8), DType::F32, &dev)?;
        // Row 1 dropped: its output must match a fully dropped pass.
        let mixed = cond.forward(&frames, &instr, &[false, true])?;
        let all_dropped = cond.forward(&frames, &instr, &[true, true])?;
        let row_mixed = mixed.narrow(0, 1, 1)?;
        let row_dropped = all_dropped.narrow(0, 1, 1)?;
        let diff = (row_mixed - row_dropped)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }
}
