//! Configuration for the robotic transformer policy.
//!
//! Two halves: the hierarchical vision encoder (MaxViT-style stages of
//! MBConv + block/grid windowed attention) and the causal action decoder
//! (transformer over interleaved observation/action tokens, discretized
//! action head).
//!
//! All structural constraints are checked by [`Config::validate`] at
//! construction time. A forward call never fails on a constraint that could
//! have been rejected here, window divisibility in particular.

use serde::Deserialize;

use crate::error::{Error, Result};

// ============================================================================
// Vision Configuration
// ============================================================================

fn default_depths() -> Vec<usize> {
    vec![2, 2, 5, 2]
}
fn default_dim() -> usize {
    96
}
fn default_stem_dim() -> usize {
    64
}
fn default_vision_dim_head() -> usize {
    32
}
fn default_window_size() -> usize {
    7
}
fn default_image_size() -> usize {
    224
}
fn default_in_channels() -> usize {
    3
}
fn default_expansion_rate() -> usize {
    4
}
fn default_shrinkage_rate() -> f64 {
    0.25
}
fn default_stochastic_depth_rate() -> f64 {
    0.0
}

/// Hierarchical vision encoder configuration.
///
/// Stage `i` runs at channel width `dim * 2^i` and spatial resolution
/// `image_size / 2^(i + 2)` (the stem halves once, then every stage halves
/// once more on entry).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VisionConfig {
    /// Number of blocks per stage. One MBConv + block-attention +
    /// grid-attention group counts as one block.
    #[serde(default = "default_depths")]
    pub depths: Vec<usize>,

    /// Channel width of the first stage; doubles per stage.
    #[serde(default = "default_dim")]
    pub dim: usize,

    /// Channel width of the convolutional stem.
    #[serde(default = "default_stem_dim")]
    pub stem_dim: usize,

    /// Per-head dimension in windowed attention.
    #[serde(default = "default_vision_dim_head")]
    pub dim_head: usize,

    /// Side length of the square attention windows, in feature cells.
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Expected input frame height and width, in pixels.
    #[serde(default = "default_image_size")]
    pub image_size: usize,

    /// Number of input image channels.
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,

    /// Channel expansion factor inside the MBConv inverted bottleneck.
    #[serde(default = "default_expansion_rate")]
    pub expansion_rate: usize,

    /// Squeeze-excitation shrinkage ratio inside the MBConv.
    #[serde(default = "default_shrinkage_rate")]
    pub shrinkage_rate: f64,

    /// Stochastic-depth rate on the MBConv residual branch. Kept for parity
    /// with training-framework configs; the forward pass here is inference
    /// shaped and treats the branch as identity-scaled.
    #[serde(default = "default_stochastic_depth_rate")]
    pub stochastic_depth_rate: f64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            depths: default_depths(),
            dim: default_dim(),
            stem_dim: default_stem_dim(),
            dim_head: default_vision_dim_head(),
            window_size: default_window_size(),
            image_size: default_image_size(),
            in_channels: default_in_channels(),
            expansion_rate: default_expansion_rate(),
            shrinkage_rate: default_shrinkage_rate(),
            stochastic_depth_rate: default_stochastic_depth_rate(),
        }
    }
}

impl VisionConfig {
    pub fn num_stages(&self) -> usize {
        self.depths.len()
    }

    /// Channel width of stage `i`.
    pub fn stage_dim(&self, i: usize) -> usize {
        self.dim << i
    }

    /// Channel width after the final stage.
    pub fn out_dim(&self) -> usize {
        self.stage_dim(self.num_stages() - 1)
    }

    /// Feature-map side length at the output of stage `i`.
    pub fn stage_resolution(&self, i: usize) -> usize {
        self.image_size >> (i + 2)
    }

    fn validate(&self) -> Result<()> {
        if self.depths.is_empty() {
            return Err(Error::config("vision depths must not be empty"));
        }
        if self.depths.iter().any(|&d| d == 0) {
            return Err(Error::config("vision stage depths must all be positive"));
        }
        if self.dim == 0 || self.stem_dim == 0 || self.dim_head == 0 {
            return Err(Error::config("vision dims must be positive"));
        }
        if self.dim % self.dim_head != 0 {
            return Err(Error::config(format!(
                "vision dim {} must be divisible by dim_head {}",
                self.dim, self.dim_head
            )));
        }
        if self.window_size == 0 {
            return Err(Error::config("window size must be positive"));
        }
        if self.expansion_rate == 0 {
            return Err(Error::config("mbconv expansion rate must be positive"));
        }
        if !(0.0..=1.0).contains(&self.shrinkage_rate) || self.shrinkage_rate == 0.0 {
            return Err(Error::config(format!(
                "squeeze-excitation shrinkage rate {} must lie in (0, 1]",
                self.shrinkage_rate
            )));
        }
        for i in 0..self.num_stages() {
            let downsample = 1usize << (i + 2);
            if self.image_size % downsample != 0 {
                return Err(Error::config(format!(
                    "image size {} is not divisible by the total downsampling {} of stage {}",
                    self.image_size, downsample, i
                )));
            }
            let res = self.stage_resolution(i);
            if res < self.window_size || res % self.window_size != 0 {
                return Err(Error::config(format!(
                    "window size {} does not evenly divide the {}x{} feature map of stage {}",
                    self.window_size, res, res, i
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Decoder / Action Configuration
// ============================================================================

fn default_decoder_depth() -> usize {
    6
}
fn default_heads() -> usize {
    8
}
fn default_decoder_dim_head() -> usize {
    64
}
fn default_hidden_size() -> usize {
    512
}
fn default_ff_mult() -> usize {
    4
}
fn default_num_actuators() -> usize {
    11
}
fn default_num_bins() -> usize {
    256
}
fn default_action_low() -> f64 {
    -1.0
}
fn default_action_high() -> f64 {
    1.0
}
fn default_instr_dim() -> usize {
    512
}
fn default_instr_vocab_size() -> usize {
    32768
}
fn default_cond_drop_prob() -> f64 {
    0.2
}

/// Causal action decoder and discretization head configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DecoderConfig {
    /// Number of transformer blocks.
    #[serde(default = "default_decoder_depth")]
    pub depth: usize,

    /// Number of attention heads.
    #[serde(default = "default_heads")]
    pub heads: usize,

    /// Per-head dimension.
    #[serde(default = "default_decoder_dim_head")]
    pub dim_head: usize,

    /// Model width of the decoder. Frame embeddings are projected to this
    /// width before entering the token sequence.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    /// Feed-forward expansion factor.
    #[serde(default = "default_ff_mult")]
    pub ff_mult: usize,

    /// Number of independently predicted actuators per timestep.
    #[serde(default = "default_num_actuators")]
    pub num_actuators: usize,

    /// Number of discretization bins per actuator.
    #[serde(default = "default_num_bins")]
    pub num_bins: usize,

    /// Lower end of the representable continuous command range.
    #[serde(default = "default_action_low")]
    pub action_low: f64,

    /// Upper end of the representable continuous command range.
    #[serde(default = "default_action_high")]
    pub action_high: f64,

    /// Dimension of instruction embeddings entering the fusion layer.
    #[serde(default = "default_instr_dim")]
    pub instr_dim: usize,

    /// Bucket count of the built-in hashed instruction embedding table.
    /// Only used when raw strings are fed without an external encoder.
    #[serde(default = "default_instr_vocab_size")]
    pub instr_vocab_size: usize,

    /// Probability of replacing the instruction with the learned null
    /// embedding, per batch element, when dropout is sampled.
    #[serde(default = "default_cond_drop_prob")]
    pub cond_drop_prob: f64,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            depth: default_decoder_depth(),
            heads: default_heads(),
            dim_head: default_decoder_dim_head(),
            hidden_size: default_hidden_size(),
            ff_mult: default_ff_mult(),
            num_actuators: default_num_actuators(),
            num_bins: default_num_bins(),
            action_low: default_action_low(),
            action_high: default_action_high(),
            instr_dim: default_instr_dim(),
            instr_vocab_size: default_instr_vocab_size(),
            cond_drop_prob: default_cond_drop_prob(),
        }
    }
}

impl DecoderConfig {
    fn validate(&self) -> Result<()> {
        if self.depth == 0 || self.heads == 0 || self.dim_head == 0 || self.ff_mult == 0 {
            return Err(Error::config("decoder depth/heads/dim_head must be positive"));
        }
        if self.hidden_size == 0 || self.hidden_size % 2 != 0 {
            return Err(Error::config(format!(
                "decoder hidden size {} must be positive and even (sinusoidal positions)",
                self.hidden_size
            )));
        }
        if self.num_actuators == 0 {
            return Err(Error::config("at least one actuator is required"));
        }
        if self.num_bins < 2 {
            return Err(Error::config("at least two action bins are required"));
        }
        if self.action_high <= self.action_low {
            return Err(Error::config(format!(
                "action range [{}, {}] is empty",
                self.action_low, self.action_high
            )));
        }
        if self.instr_dim == 0 || self.instr_vocab_size == 0 {
            return Err(Error::config("instruction dims must be positive"));
        }
        if !(0.0..=1.0).contains(&self.cond_drop_prob) {
            return Err(Error::config(format!(
                "cond_drop_prob {} must lie in [0, 1]",
                self.cond_drop_prob
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Full Configuration
// ============================================================================

/// Full policy configuration.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
}

impl Config {
    /// Checks every structural constraint. Called by the model constructor
    /// before any weight is created.
    pub fn validate(&self) -> Result<()> {
        self.vision.validate()?;
        self.decoder.validate()
    }

    /// A small configuration for CPU smoke tests and examples:
    /// 64x64 frames, two stages, 4 actuators, 8 bins.
    pub fn tiny() -> Self {
        Self {
            vision: VisionConfig {
                depths: vec![2, 2],
                dim: 32,
                stem_dim: 16,
                dim_head: 16,
                window_size: 4,
                image_size: 64,
                ..Default::default()
            },
            decoder: DecoderConfig {
                depth: 2,
                heads: 4,
                dim_head: 16,
                hidden_size: 64,
                ff_mult: 2,
                num_actuators: 4,
                num_bins: 8,
                instr_dim: 32,
                instr_vocab_size: 128,
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.vision.num_stages(), 4);
        assert_eq!(cfg.vision.out_dim(), 96 * 8);
        // 224 -> 112 (stem) -> 56 -> 28 -> 14 -> 7, all multiples of 7
        assert_eq!(cfg.vision.stage_resolution(0), 56);
        assert_eq!(cfg.vision.stage_resolution(3), 7);
    }

    #[test]
    fn test_tiny_config_valid() {
        Config::tiny().validate().unwrap();
    }

    #[test]
    fn test_window_must_divide_feature_map() {
        let mut cfg = Config::tiny();
        cfg.vision.window_size = 5;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
    }

    #[test]
    fn test_image_size_must_downsample_evenly() {
        let mut cfg = Config::tiny();
        cfg.vision.image_size = 60;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_cond_drop_prob_range() {
        let mut cfg = Config::tiny();
        cfg.decoder.cond_drop_prob = 1.5;
        assert!(cfg.validate().is_err());
        cfg.decoder.cond_drop_prob = 1.0;
        cfg.validate().unwrap();
    }

    #[test]
    fn test_empty_action_range_rejected() {
        let mut cfg = Config::tiny();
        cfg.decoder.action_low = 1.0;
        cfg.decoder.action_high = 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let cfg: Config = serde_json::from_str(
            r#"{"decoder": {"num_actuators": 7, "num_bins": 32}}"#,
        )
        .unwrap();
        assert_eq!(cfg.decoder.num_actuators, 7);
        assert_eq!(cfg.decoder.num_bins, 32);
        assert_eq!(cfg.vision.window_size, 7);
        cfg.validate().unwrap();
    }
}
