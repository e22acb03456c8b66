//! Action discretization: continuous commands to bins and back, plus the
//! per-actuator logit projections.

use candle::{Module, Result as CandleResult, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use crate::config::DecoderConfig;
use crate::error::{Error, Result};

/// What to do with a continuous command outside `[low, high]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangePolicy {
    /// Clamp to the range edge. Convenient for inference.
    #[default]
    Clamp,
    /// Report a [`Error::DiscretizationRange`] instead.
    Strict,
}

/// Uniform quantizer over `[low, high]` with `num_bins` bins.
///
/// `bin_to_value` returns bin midpoints, so a round trip through
/// `value_to_bin` moves a value by at most one bin width.
#[derive(Debug, Clone)]
pub struct ActionDiscretizer {
    low: f64,
    high: f64,
    num_bins: usize,
    policy: RangePolicy,
}

impl ActionDiscretizer {
    pub fn new(low: f64, high: f64, num_bins: usize, policy: RangePolicy) -> Result<Self> {
        if high <= low {
            return Err(Error::config(format!("action range [{low}, {high}] is empty")));
        }
        if num_bins < 2 {
            return Err(Error::config("at least two action bins are required"));
        }
        Ok(Self {
            low,
            high,
            num_bins,
            policy,
        })
    }

    pub fn from_config(cfg: &DecoderConfig, policy: RangePolicy) -> Result<Self> {
        Self::new(cfg.action_low, cfg.action_high, cfg.num_bins, policy)
    }

    pub fn num_bins(&self) -> usize {
        self.num_bins
    }

    pub fn bin_width(&self) -> f64 {
        (self.high - self.low) / self.num_bins as f64
    }

    /// Quantizes a continuous command. Out-of-range inputs clamp or error
    /// according to the configured [`RangePolicy`]; NaN is rejected under
    /// either policy. The result is always in `[0, num_bins)`.
    pub fn value_to_bin(&self, value: f64) -> Result<u32> {
        if value.is_nan() {
            return Err(Error::DiscretizationRange {
                value,
                low: self.low,
                high: self.high,
            });
        }
        let v = if value < self.low || value > self.high {
            match self.policy {
                RangePolicy::Strict => {
                    return Err(Error::DiscretizationRange {
                        value,
                        low: self.low,
                        high: self.high,
                    })
                }
                RangePolicy::Clamp => value.clamp(self.low, self.high),
            }
        } else {
            value
        };
        let bin = ((v - self.low) / self.bin_width()) as usize;
        Ok(bin.min(self.num_bins - 1) as u32)
    }

    /// Midpoint of a bin. The exact inverse used when converting a sampled
    /// bin back into an executable command.
    pub fn bin_to_value(&self, bin: u32) -> Result<f64> {
        if bin as usize >= self.num_bins {
            return Err(Error::shape(
                "bin index",
                format!("< {}", self.num_bins),
                bin.to_string(),
            ));
        }
        Ok(self.low + (bin as f64 + 0.5) * self.bin_width())
    }

    pub fn values_to_bins(&self, values: &[f64]) -> Result<Vec<u32>> {
        values.iter().map(|&v| self.value_to_bin(v)).collect()
    }

    pub fn bins_to_values(&self, bins: &[u32]) -> Result<Vec<f64>> {
        bins.iter().map(|&b| self.bin_to_value(b)).collect()
    }
}

/// One independent logit projection per actuator, decoder width to
/// `num_bins`. Input `(batch, frames, actuators, hidden)`, output
/// `(batch, frames, actuators, num_bins)`.
pub struct ActionHead {
    projs: Vec<Linear>,
}

impl ActionHead {
    pub fn new(cfg: &DecoderConfig, vb: VarBuilder) -> CandleResult<Self> {
        let mut projs = Vec::with_capacity(cfg.num_actuators);
        for a in 0..cfg.num_actuators {
            projs.push(linear(cfg.hidden_size, cfg.num_bins, vb.pp(format!("proj.{a}")))?);
        }
        Ok(Self { projs })
    }
}

impl Module for ActionHead {
    fn forward(&self, xs: &Tensor) -> CandleResult<Tensor> {
        let mut per_actuator = Vec::with_capacity(self.projs.len());
        for (a, proj) in self.projs.iter().enumerate() {
            let slot = xs.narrow(2, a, 1)?.squeeze(2)?;
            per_actuator.push(proj.forward(&slot)?.unsqueeze(2)?);
        }
        Tensor::cat(&per_actuator, 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discretizer(policy: RangePolicy) -> ActionDiscretizer {
        ActionDiscretizer::new(-1.0, 1.0, 8, policy).unwrap()
    }

    #[test]
    fn test_round_trip_within_one_bin() {
        let d = discretizer(RangePolicy::Clamp);
        let width = d.bin_width();
        let mut v = -1.0;
        while v <= 1.0 {
            let back = d.bin_to_value(d.value_to_bin(v).unwrap()).unwrap();
            assert!(
                (back - v).abs() <= width,
                "round trip moved {v} to {back}, more than one bin width {width}"
            );
            v += 0.01;
        }
    }

    #[test]
    fn test_bin_index_bounds() {
        let d = discretizer(RangePolicy::Clamp);
        // The top edge of the range still maps into the last bin.
        assert_eq!(d.value_to_bin(1.0).unwrap(), 7);
        assert_eq!(d.value_to_bin(-1.0).unwrap(), 0);
        assert!(d.bin_to_value(8).is_err());
    }

    #[test]
    fn test_clamp_policy() {
        let d = discretizer(RangePolicy::Clamp);
        assert_eq!(d.value_to_bin(5.0).unwrap(), 7);
        assert_eq!(d.value_to_bin(-5.0).unwrap(), 0);
    }

    #[test]
    fn test_non_finite_values() {
        // NaN compares false against both range edges; it must not slip
        // through to bin 0.
        for policy in [RangePolicy::Clamp, RangePolicy::Strict] {
            let d = discretizer(policy);
            let err = d.value_to_bin(f64::NAN).unwrap_err();
            assert!(matches!(err, Error::DiscretizationRange { .. }));
        }
        // Infinities behave like any other out-of-range value.
        let d = discretizer(RangePolicy::Clamp);
        assert_eq!(d.value_to_bin(f64::INFINITY).unwrap(), 7);
        assert_eq!(d.value_to_bin(f64::NEG_INFINITY).unwrap(), 0);
        let d = discretizer(RangePolicy::Strict);
        assert!(d.value_to_bin(f64::INFINITY).is_err());
    }

    #[test]
    fn test_strict_policy() {
        let d = discretizer(RangePolicy::Strict);
        let err = d.value_to_bin(5.0).unwrap_err();
        assert!(matches!(err, Error::DiscretizationRange { .. }));
        // In-range values behave identically to clamp mode.
        assert_eq!(d.value_to_bin(0.0).unwrap(), 4);
    }

    #[test]
    fn test_head_shape() -> CandleResult<()> {
        use candle::{DType, Device};
        use candle_nn::{VarBuilder, VarMap};
        let dev = Device::Cpu;
        let cfg = crate::config::Config::tiny().decoder;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let head = ActionHead::new(&cfg, vb)?;
        let xs = Tensor::zeros((2, 6, cfg.num_actuators, cfg.hidden_size), DType::F32, &dev)?;
        let out = head.forward(&xs)?;
        assert_eq!(out.dims(), [2, 6, cfg.num_actuators, cfg.num_bins]);
        Ok(())
    }
}
