//! Instruction-conditioned robotic transformer policy, built on candle.
//!
//! The model fuses three inputs into a distribution over the next
//! discretized action for every actuator at every timestep:
//!
//! - a video clip, encoded frame by frame with a hierarchical MaxViT-style
//!   encoder (MBConv + block/grid windowed attention),
//! - a natural-language instruction embedding, fused via FiLM modulation
//!   with learned-null conditioning dropout for classifier-free guidance,
//! - the history of previously executed action bins, embedded per
//!   `(timestep, actuator)` slot.
//!
//! A causal transformer attends over the interleaved observation/action
//! token sequence and per-actuator heads emit logits of shape
//! `(batch, time, actuators, bins)`.
//!
//! ```no_run
//! use candle::{DType, Device, Tensor};
//! use candle_nn::{VarBuilder, VarMap};
//! use robotic_transformer::{CondDrop, Config, Instruction, RoboticTransformer};
//!
//! # fn main() -> anyhow::Result<()> {
//! let device = Device::Cpu;
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
//! let model = RoboticTransformer::new(&Config::default(), vb)?;
//!
//! let video = Tensor::zeros((2, 3, 6, 224, 224), DType::F32, &device)?;
//! let instruction = Instruction::Raw(vec![
//!     "bring me that apple sitting on the table".into(),
//!     "please pass the butter".into(),
//! ]);
//! let logits = model.forward(&video, &instruction, None, CondDrop::Keep)?;
//! assert_eq!(logits.dims(), [2, 6, 11, 256]);
//! # Ok(())
//! # }
//! ```
//!
//! Training, optimization, and checkpoint persistence live outside this
//! crate; parameters are addressed through `candle_nn::VarBuilder` paths so
//! an external training framework owns their lifecycle.

pub mod action;
pub mod conditioning;
pub mod config;
pub mod decoder;
pub mod error;
pub mod instruction;
pub mod model;
pub mod rollout;
pub mod vision;

pub use action::{ActionDiscretizer, ActionHead, RangePolicy};
pub use conditioning::{CondDrop, Conditioner};
pub use config::{Config, DecoderConfig, VisionConfig};
pub use error::{Error, Result};
pub use instruction::{EmbeddingTableEncoder, Instruction, InstructionEncoder};
pub use model::RoboticTransformer;
pub use rollout::{BinSelection, Rollout, RolloutState};
pub use vision::VisionEncoder;
