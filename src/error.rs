//! Error type for the policy crate.
//!
//! Three failure classes exist, mirroring where they are detected:
//! - [`Error::Config`] at construction time (invalid stage/window/bin setup),
//! - [`Error::ShapeMismatch`] at the start of a forward call,
//! - [`Error::DiscretizationRange`] when quantizing a continuous command in
//!   strict mode.
//!
//! Tensor-level failures from candle propagate transparently.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid construction-time configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Input dimensions incompatible with the configured model.
    #[error("shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        got: String,
    },

    /// A continuous command outside the representable action range.
    /// Only produced in strict mode; the default policy is to clamp.
    #[error("value {value} outside the discretization range [{low}, {high}]")]
    DiscretizationRange { value: f64, low: f64, high: f64 },

    #[error(transparent)]
    Candle(#[from] candle::Error),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub(crate) fn shape(
        what: &'static str,
        expected: impl Into<String>,
        got: impl Into<String>,
    ) -> Self {
        Self::ShapeMismatch {
            what,
            expected: expected.into(),
            got: got.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
