// SPDX-License-Identifier: AGPL-3.0-only

//! Superstep configuration.
//!
//! The superstep length, the number of chunks it is divided into, and the
//! propagator batch width. Chunk count must be a power of two: the Morton
//! discretisation and the bit-indexed BVH split rule inherit that structure.

use crate::error::SweepError;
use crate::tolerances::{DEFAULT_BATCH_WIDTH, DEFAULT_CHUNK_COUNT, DEFAULT_SUPERSTEP};

/// Validated configuration for one screening pipeline instance.
#[derive(Clone, Copy, Debug)]
#[must_use]
pub struct SweepConfig {
    /// Superstep length in propagation time units.
    pub superstep: f64,
    /// Number of equal-length chunks per superstep (power of two).
    pub n_chunks: u32,
    /// Propagator batch width (lanes integrated as one group).
    pub batch_width: u32,
}

impl SweepConfig {
    /// Build a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SweepError::InvalidConfig`] if `superstep` is not finite
    /// and positive, `n_chunks` is zero or not a power of two, or
    /// `batch_width` is zero.
    pub fn new(superstep: f64, n_chunks: u32, batch_width: u32) -> Result<Self, SweepError> {
        if !superstep.is_finite() || superstep <= 0.0 {
            return Err(SweepError::InvalidConfig(format!(
                "superstep must be finite and positive, got {superstep}"
            )));
        }
        if n_chunks == 0 || !n_chunks.is_power_of_two() {
            return Err(SweepError::InvalidConfig(format!(
                "chunk count must be a nonzero power of two, got {n_chunks}"
            )));
        }
        if batch_width == 0 {
            return Err(SweepError::InvalidConfig(
                "batch width must be nonzero".into(),
            ));
        }
        Ok(Self {
            superstep,
            n_chunks,
            batch_width,
        })
    }

    /// Default LEO screening setup: 8 chunks of 0.46 time units each.
    pub fn leo_screening() -> Self {
        Self {
            superstep: DEFAULT_SUPERSTEP,
            n_chunks: DEFAULT_CHUNK_COUNT,
            batch_width: DEFAULT_BATCH_WIDTH,
        }
    }

    /// Length of a single chunk.
    #[must_use]
    pub fn chunk_width(&self) -> f64 {
        self.superstep / f64::from(self.n_chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_power_of_two_chunks() {
        for k in [1u32, 2, 4, 8, 64] {
            assert!(SweepConfig::new(1.0, k, 4).is_ok(), "k = {k}");
        }
    }

    #[test]
    fn rejects_non_power_of_two_chunks() {
        for k in [0u32, 3, 6, 12] {
            assert!(SweepConfig::new(1.0, k, 4).is_err(), "k = {k}");
        }
    }

    #[test]
    fn rejects_bad_superstep() {
        assert!(SweepConfig::new(0.0, 8, 4).is_err());
        assert!(SweepConfig::new(-1.0, 8, 4).is_err());
        assert!(SweepConfig::new(f64::NAN, 8, 4).is_err());
        assert!(SweepConfig::new(f64::INFINITY, 8, 4).is_err());
    }

    #[test]
    fn rejects_zero_batch_width() {
        assert!(SweepConfig::new(1.0, 8, 0).is_err());
    }

    #[test]
    fn chunk_width_divides_superstep() {
        let cfg = SweepConfig::leo_screening();
        assert!((cfg.chunk_width() - 0.46).abs() < 1e-12);
        assert!(
            (cfg.chunk_width() * f64::from(cfg.n_chunks) - cfg.superstep).abs() < 1e-12
        );
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = SweepConfig::leo_screening();
        assert!(SweepConfig::new(cfg.superstep, cfg.n_chunks, cfg.batch_width).is_ok());
    }
}
