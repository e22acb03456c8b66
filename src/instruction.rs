//! Instruction input boundary.
//!
//! The policy accepts either raw instruction strings or pre-computed
//! embeddings. Text encoding proper is external; [`InstructionEncoder`] is
//! the seam for plugging in a real language model, and
//! [`EmbeddingTableEncoder`] is the built-in minimal fallback (hashed
//! bag-of-tokens over a learned table) so the model runs standalone.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use candle::Tensor;
use candle_nn::{embedding, Embedding, Module, VarBuilder};

use crate::error::{Error, Result};

/// Instruction input, resolved to an embedding before fusion.
#[derive(Debug, Clone)]
pub enum Instruction {
    /// Raw strings, one per batch element. Routed through an encoder.
    Raw(Vec<String>),
    /// Pre-computed embeddings: `(batch, instr_dim)` or
    /// `(batch, slots, instr_dim)`. Multiple slots are mean-pooled.
    Embedded(Tensor),
}

/// External text encoder seam. Implementations map one string per batch
/// element to a `(batch, instr_dim)` embedding tensor.
pub trait InstructionEncoder {
    fn encode(&self, texts: &[String]) -> Result<Tensor>;
}

/// Minimal built-in encoder: whitespace tokens are hashed into a fixed
/// bucket table and their embeddings averaged. Deterministic and cheap; a
/// stand-in for a real language model, not a replacement.
pub struct EmbeddingTableEncoder {
    table: Embedding,
    vocab_size: usize,
    dim: usize,
}

impl EmbeddingTableEncoder {
    pub fn new(vocab_size: usize, dim: usize, vb: VarBuilder) -> candle::Result<Self> {
        Ok(Self {
            table: embedding(vocab_size, dim, vb.pp("table"))?,
            vocab_size,
            dim,
        })
    }

    fn bucket(&self, token: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        (hasher.finish() % self.vocab_size as u64) as u32
    }
}

impl InstructionEncoder for EmbeddingTableEncoder {
    fn encode(&self, texts: &[String]) -> Result<Tensor> {
        if texts.is_empty() {
            return Err(Error::shape("instructions", "at least one string", "0"));
        }
        let device = self.table.embeddings().device();
        let mut rows = Vec::with_capacity(texts.len());
        for text in texts {
            let ids: Vec<u32> = text
                .split_whitespace()
                .map(|tok| self.bucket(&tok.to_lowercase()))
                .collect();
            let row = if ids.is_empty() {
                // A blank instruction maps to the zero vector.
                Tensor::zeros((self.dim,), candle::DType::F32, device)?
            } else {
                let ids = Tensor::from_vec(ids.clone(), (ids.len(),), device)?;
                self.table.forward(&ids)?.mean(0)?
            };
            rows.push(row);
        }
        Ok(Tensor::stack(&rows, 0)?)
    }
}

/// Resolves an [`Instruction`] to a `(batch, instr_dim)` tensor, validating
/// shape against the configured embedding width and batch size.
pub(crate) fn resolve_instruction(
    instruction: &Instruction,
    encoder: &dyn InstructionEncoder,
    batch: usize,
    instr_dim: usize,
) -> Result<Tensor> {
    let embeds = match instruction {
        Instruction::Raw(texts) => encoder.encode(texts)?,
        Instruction::Embedded(t) => match t.rank() {
            2 => t.clone(),
            3 => t.mean(1)?,
            r => {
                return Err(Error::shape(
                    "instruction embeddings",
                    "rank 2 or 3",
                    format!("rank {r} tensor {:?}", t.dims()),
                ))
            }
        },
    };
    let (b, d) = embeds
        .dims2()
        .map_err(|_| Error::shape("instruction embeddings", "rank 2", format!("{:?}", embeds.dims())))?;
    if b != batch || d != instr_dim {
        return Err(Error::shape(
            "instruction embeddings",
            format!("({batch}, {instr_dim})"),
            format!("({b}, {d})"),
        ));
    }
    Ok(embeds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn encoder(dev: &Device) -> EmbeddingTableEncoder {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        EmbeddingTableEncoder::new(64, 16, vb).unwrap()
    }

    #[test]
    fn test_encode_shape_and_determinism() -> Result<()> {
        let dev = Device::Cpu;
        let enc = encoder(&dev);
        let texts = vec!["pick up the red block".to_string(), "open drawer".to_string()];
        let a = enc.encode(&texts)?;
        let b = enc.encode(&texts)?;
        assert_eq!(a.dims(), [2, 16]);
        let diff = (a - b)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn test_resolve_slot_pooling() -> Result<()> {
        let dev = Device::Cpu;
        let enc = encoder(&dev);
        let embeds = Tensor::ones((2, 3, 16), DType::F32, &dev)?;
        let out = resolve_instruction(&Instruction::Embedded(embeds), &enc, 2, 16)?;
        assert_eq!(out.dims(), [2, 16]);
        Ok(())
    }

    #[test]
    fn test_resolve_rejects_wrong_dim() {
        let dev = Device::Cpu;
        let enc = encoder(&dev);
        let embeds = Tensor::ones((2, 8), DType::F32, &dev).unwrap();
        let err = resolve_instruction(&Instruction::Embedded(embeds), &enc, 2, 16).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }
}
