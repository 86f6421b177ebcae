// SPDX-License-Identifier: AGPL-3.0-only

//! Typed errors for the conjunction-screening pipeline.
//!
//! Replaces `Result<_, String>` in public APIs with a proper enum so callers
//! can pattern-match on failure modes (index overflow, propagation failure,
//! degenerate bounds) rather than parsing opaque strings.

use std::fmt;

/// Errors arising from superstep propagation and spatial-index construction.
#[derive(Debug)]
pub enum SweepError {
    /// Particle counts, tree sizes, or buffer sizes would exceed the
    /// respective index-type ranges.
    Overflow(&'static str),

    /// At least one propagator lane did not reach the superstep time limit
    /// (step failure, non-finite step time, or callback stop).
    IntegrationFailure,

    /// A chunk's global bounding box is non-finite or has a non-finite
    /// extent, so its coordinates cannot be discretised.
    NonFiniteBounds {
        /// Index of the offending chunk.
        chunk: usize,
    },

    /// Rejected configuration or particle state (wraps a description).
    InvalidConfig(String),
}

impl fmt::Display for SweepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overflow(what) => {
                write!(f, "Overflow detected during {what}")
            }
            Self::IntegrationFailure => {
                write!(f, "Numerical propagation did not reach the superstep time limit")
            }
            Self::NonFiniteBounds { chunk } => {
                write!(f, "Global bounding box for chunk {chunk} is not finite")
            }
            Self::InvalidConfig(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for SweepError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_overflow() {
        let err = SweepError::Overflow("BVH tree construction");
        assert_eq!(
            err.to_string(),
            "Overflow detected during BVH tree construction"
        );
    }

    #[test]
    fn display_integration_failure() {
        let err = SweepError::IntegrationFailure;
        assert!(err.to_string().contains("time limit"));
    }

    #[test]
    fn display_non_finite_bounds() {
        let err = SweepError::NonFiniteBounds { chunk: 3 };
        assert!(err.to_string().contains("chunk 3"));
    }

    #[test]
    fn display_invalid_config() {
        let err = SweepError::InvalidConfig("chunk count must be a power of two".into());
        assert!(err.to_string().contains("power of two"));
    }

    #[test]
    fn error_trait_works() {
        let err = SweepError::IntegrationFailure;
        let dyn_err: &dyn std::error::Error = &err;
        assert!(dyn_err.to_string().contains("propagation"));
    }
}
