// SPDX-License-Identifier: AGPL-3.0-only

//! Superstep screening pipeline.
//!
//! Advances every particle over one macroscopic superstep and builds the
//! per-chunk spatial index that the narrow-phase conjunction search
//! consumes. Phases per superstep:
//!
//! ```text
//! batch propagation  — Taylor coefficients + substep times per particle
//!   ├─ per-(chunk, particle) AABBs (interval Horner, outward rounding)
//!   └─ per-chunk global AABB (lock-free CAS min/max)          [aabb]
//! Morton encode centres → indirect sort → gather sorted copies [encode]
//! per-chunk level-synchronous BVH build                        [bvh]
//! full invariant verification (debug builds)                   [verify]
//! ```
//!
//! The sort-index initialisation runs concurrently with the propagation
//! phase. Every array is rebuilt from scratch each superstep; nothing
//! carries over. Phases are totally ordered by fork-join barriers, so the
//! relaxed atomics of the reduction phase are read only after a program-
//! order synchronisation point.

pub mod aabb;
pub mod bvh;
pub mod encode;
pub mod verify;

use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::SweepConfig;
use crate::dfloat::DoubleDouble;
use crate::error::SweepError;
use crate::propagator::{PropagatorFactory, PropagatorPool, N_COORDS};
use aabb::SubstepRecord;
use bvh::{BvhNode, LevelScratch, TreeStats};

/// Driver-owned particle state, one entry per particle: position,
/// velocity, and the radial coordinate r. r is integrated alongside
/// x, y, z and bounded identically; it is not derived from the position.
#[derive(Clone, Debug, Default)]
pub struct ParticleSet {
    /// x positions.
    pub x: Vec<f64>,
    /// y positions.
    pub y: Vec<f64>,
    /// z positions.
    pub z: Vec<f64>,
    /// x velocities.
    pub vx: Vec<f64>,
    /// y velocities.
    pub vy: Vec<f64>,
    /// z velocities.
    pub vz: Vec<f64>,
    /// Radial coordinate.
    pub r: Vec<f64>,
}

impl ParticleSet {
    /// Number of particles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Whether the set holds no particles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    fn validate(&self) -> Result<(), SweepError> {
        let n = self.x.len();
        if n == 0 {
            return Err(SweepError::InvalidConfig(
                "particle set must not be empty".into(),
            ));
        }
        if n > u32::MAX as usize {
            return Err(SweepError::Overflow("particle indexing"));
        }
        let arrays = [
            &self.y, &self.z, &self.vx, &self.vy, &self.vz, &self.r,
        ];
        if arrays.iter().any(|a| a.len() != n) {
            return Err(SweepError::InvalidConfig(
                "particle state arrays have mismatched lengths".into(),
            ));
        }
        let all_finite = self.x.iter().all(|v| v.is_finite())
            && arrays.iter().all(|a| a.iter().all(|v| v.is_finite()));
        if !all_finite {
            return Err(SweepError::InvalidConfig(
                "particle state must be finite".into(),
            ));
        }
        Ok(())
    }
}

/// Per-superstep working storage and produced index artifacts.
///
/// Per-particle AABBs are particle-major (`particle * n_chunks + chunk`) so
/// batch workers write disjoint contiguous slices; everything downstream of
/// the sort is chunk-major (`chunk * n_particles + i`).
#[derive(Debug, Default)]
pub struct SweepData {
    pub(crate) nparts: usize,
    pub(crate) nchunks: usize,
    pub(crate) lbs: Vec<[f32; 4]>,
    pub(crate) ubs: Vec<[f32; 4]>,
    pub(crate) mcodes: Vec<u64>,
    pub(crate) vidx: Vec<u32>,
    pub(crate) srt_mcodes: Vec<u64>,
    pub(crate) srt_lbs: Vec<[f32; 4]>,
    pub(crate) srt_ubs: Vec<[f32; 4]>,
    pub(crate) global_lb: Vec<[f32; 4]>,
    pub(crate) global_ub: Vec<[f32; 4]>,
    pub(crate) trees: Vec<Vec<BvhNode>>,
    pub(crate) scratch: Vec<LevelScratch>,
    pub(crate) records: Vec<SubstepRecord>,
    pub(crate) new_state: Vec<[f64; N_COORDS]>,
}

impl SweepData {
    pub(crate) fn empty() -> Self {
        Self::default()
    }

    /// Size every buffer for `np` particles and `nk` chunks, keeping
    /// capacity across supersteps.
    pub(crate) fn resize(&mut self, np: usize, nk: usize) -> Result<(), SweepError> {
        if np > u32::MAX as usize {
            return Err(SweepError::Overflow("particle indexing"));
        }
        let total = np
            .checked_mul(nk)
            .ok_or(SweepError::Overflow("chunk buffer sizing"))?;

        self.nparts = np;
        self.nchunks = nk;
        self.lbs.resize(total, [0.0; 4]);
        self.ubs.resize(total, [0.0; 4]);
        self.mcodes.resize(total, 0);
        self.vidx.resize(total, 0);
        self.srt_mcodes.resize(total, 0);
        self.srt_lbs.resize(total, [0.0; 4]);
        self.srt_ubs.resize(total, [0.0; 4]);
        self.global_lb.resize(nk, [0.0; 4]);
        self.global_ub.resize(nk, [0.0; 4]);
        self.trees.resize_with(nk, Vec::new);
        self.scratch.resize_with(nk, LevelScratch::default);
        self.records.resize_with(np, SubstepRecord::default);
        self.new_state.resize(np, [0.0; N_COORDS]);
        Ok(())
    }

    /// Number of particles covered by the current data.
    #[must_use]
    pub fn n_particles(&self) -> usize {
        self.nparts
    }

    /// Number of chunks covered by the current data.
    #[must_use]
    pub fn n_chunks(&self) -> usize {
        self.nchunks
    }

    /// Finalized global bounding box of `chunk` as `(lb, ub)`.
    #[must_use]
    pub fn global_bounds(&self, chunk: usize) -> ([f32; 4], [f32; 4]) {
        (self.global_lb[chunk], self.global_ub[chunk])
    }

    /// A particle's AABB in `chunk` (original particle order).
    #[must_use]
    pub fn aabb(&self, chunk: usize, particle: usize) -> ([f32; 4], [f32; 4]) {
        let idx = particle * self.nchunks + chunk;
        (self.lbs[idx], self.ubs[idx])
    }

    /// Sorted per-particle bounds of `chunk` as `(lbs, ubs)` slices.
    #[must_use]
    pub fn sorted_aabbs(&self, chunk: usize) -> (&[[f32; 4]], &[[f32; 4]]) {
        let range = chunk * self.nparts..(chunk + 1) * self.nparts;
        (&self.srt_lbs[range.clone()], &self.srt_ubs[range])
    }

    /// Morton codes of `chunk` in original particle order.
    #[must_use]
    pub fn morton_codes(&self, chunk: usize) -> &[u64] {
        &self.mcodes[chunk * self.nparts..(chunk + 1) * self.nparts]
    }

    /// Sorted Morton codes of `chunk`.
    #[must_use]
    pub fn sorted_codes(&self, chunk: usize) -> &[u64] {
        &self.srt_mcodes[chunk * self.nparts..(chunk + 1) * self.nparts]
    }

    /// Sort permutation of `chunk`: sorted position `i` holds particle
    /// `sort_index(chunk)[i]`.
    #[must_use]
    pub fn sort_index(&self, chunk: usize) -> &[u32] {
        &self.vidx[chunk * self.nparts..(chunk + 1) * self.nparts]
    }

    /// The BVH of `chunk` as a densely packed node array.
    #[must_use]
    pub fn tree(&self, chunk: usize) -> &[BvhNode] {
        &self.trees[chunk]
    }
}

/// Wall-time and tree-shape summary of one superstep.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SweepReport {
    /// Propagation + AABB phase, seconds.
    pub aabb_s: f64,
    /// Morton encode + sort phase, seconds.
    pub sort_s: f64,
    /// BVH construction phase, seconds.
    pub bvh_s: f64,
    /// Whole superstep, seconds.
    pub total_s: f64,
    /// Per-chunk tree shape.
    pub trees: Vec<TreeStats>,
}

/// Conjunction-screening pipeline over a driver-owned particle set.
pub struct Sweep {
    cfg: SweepConfig,
    time: DoubleDouble,
    parts: ParticleSet,
    data: SweepData,
    batch_pool: PropagatorPool,
    scalar_pool: PropagatorPool,
}

impl Sweep {
    /// Build a pipeline instance.
    ///
    /// The factory must produce propagators of any requested batch width;
    /// it is used both for full batches of `cfg.batch_width` lanes and for
    /// the width-1 scalar tail.
    ///
    /// # Errors
    ///
    /// Returns [`SweepError::InvalidConfig`] for an empty particle set,
    /// mismatched array lengths, or non-finite state, and
    /// [`SweepError::Overflow`] when the particle count exceeds the index
    /// range.
    pub fn new(
        cfg: SweepConfig,
        parts: ParticleSet,
        factory: Arc<PropagatorFactory>,
    ) -> Result<Self, SweepError> {
        // Fields are public; re-validate in case the config was built by
        // hand instead of through the checked constructor.
        let cfg = SweepConfig::new(cfg.superstep, cfg.n_chunks, cfg.batch_width)?;
        parts.validate()?;
        let batch_pool = PropagatorPool::new(cfg.batch_width, Arc::clone(&factory));
        let scalar_pool = PropagatorPool::new(1, factory);
        Ok(Self {
            cfg,
            time: DoubleDouble::default(),
            parts,
            data: SweepData::empty(),
            batch_pool,
            scalar_pool,
        })
    }

    /// Set the starting epoch (double-double).
    #[must_use]
    pub fn with_epoch(mut self, time: DoubleDouble) -> Self {
        self.time = time;
        self
    }

    /// Current epoch.
    #[must_use]
    pub fn time(&self) -> DoubleDouble {
        self.time
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &SweepConfig {
        &self.cfg
    }

    /// Current particle state.
    #[must_use]
    pub const fn particles(&self) -> &ParticleSet {
        &self.parts
    }

    /// Index artifacts of the last superstep.
    #[must_use]
    pub const fn data(&self) -> &SweepData {
        &self.data
    }

    /// Run one superstep: propagate every particle for the configured Δt,
    /// build the per-chunk spatial indices, then advance the particle state
    /// and epoch to the end of the superstep.
    ///
    /// # Errors
    ///
    /// [`SweepError::IntegrationFailure`] if any propagator lane does not
    /// reach the time limit, [`SweepError::NonFiniteBounds`] if a chunk's
    /// global box cannot be discretised, [`SweepError::Overflow`] on index
    /// range exhaustion.
    pub fn step(&mut self) -> Result<SweepReport, SweepError> {
        let np = self.parts.len();
        let nk = self.cfg.n_chunks as usize;
        self.data.resize(np, nk)?;

        let t_total = Instant::now();

        // Propagation + AABBs, concurrent with sort-index initialisation.
        let t_aabb = Instant::now();
        {
            let SweepData {
                vidx,
                lbs,
                ubs,
                records,
                new_state,
                global_lb,
                global_ub,
                ..
            } = &mut self.data;
            let state = aabb::ParticleView::new(&self.parts);
            let bufs = aabb::Buffers {
                lbs,
                ubs,
                records,
                new_state,
                global_lb,
                global_ub,
            };
            let ((), res) = rayon::join(
                || {
                    vidx.par_chunks_mut(np).for_each(|chunk| {
                        chunk
                            .par_iter_mut()
                            .enumerate()
                            .for_each(|(i, v)| *v = i as u32);
                    });
                },
                || {
                    aabb::integrate_and_bound(
                        &self.cfg,
                        self.time,
                        &state,
                        &self.batch_pool,
                        &self.scalar_pool,
                        bufs,
                    )
                },
            );
            res?;
        }
        let aabb_s = t_aabb.elapsed().as_secs_f64();

        // Morton encoding and indirect sorting.
        let t_sort = Instant::now();
        encode::morton_encode_sort(&mut self.data);
        let sort_s = t_sort.elapsed().as_secs_f64();

        // BVH construction, parallel across chunks.
        let t_bvh = Instant::now();
        let tree_stats = {
            let SweepData {
                trees,
                scratch,
                srt_mcodes,
                srt_lbs,
                srt_ubs,
                ..
            } = &mut self.data;
            let srt_mcodes = &*srt_mcodes;
            let srt_lbs = &*srt_lbs;
            let srt_ubs = &*srt_ubs;

            trees
                .par_iter_mut()
                .zip(scratch.par_iter_mut())
                .enumerate()
                .map(|(k, (tree, scr))| {
                    bvh::build_tree(
                        &srt_mcodes[k * np..(k + 1) * np],
                        &srt_lbs[k * np..(k + 1) * np],
                        &srt_ubs[k * np..(k + 1) * np],
                        tree,
                        scr,
                    )
                })
                .collect::<Result<Vec<TreeStats>, SweepError>>()?
        };
        let bvh_s = t_bvh.elapsed().as_secs_f64();

        #[cfg(debug_assertions)]
        verify::verify_sweep(&self.data);

        // The propagated end-of-superstep state becomes the next
        // superstep's initial state.
        for (i, s) in self.data.new_state.iter().enumerate() {
            self.parts.x[i] = s[0];
            self.parts.y[i] = s[1];
            self.parts.z[i] = s[2];
            self.parts.vx[i] = s[3];
            self.parts.vy[i] = s[4];
            self.parts.vz[i] = s[5];
            self.parts.r[i] = s[6];
        }
        self.time = self.time + DoubleDouble::new(self.cfg.superstep);

        Ok(SweepReport {
            aabb_s,
            sort_s,
            bvh_s,
            total_s: t_total.elapsed().as_secs_f64(),
            trees: tree_stats,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::drift::DriftPropagator;
    use crate::propagator::BatchPropagator;

    fn drift_factory(order: u32, substep: f64) -> Arc<PropagatorFactory> {
        Arc::new(move |w| {
            Box::new(DriftPropagator::new(w, order, substep)) as Box<dyn BatchPropagator>
        })
    }

    fn single_particle_set() -> ParticleSet {
        ParticleSet {
            x: vec![0.0],
            y: vec![0.0],
            z: vec![0.0],
            vx: vec![1.0],
            vy: vec![0.0],
            vz: vec![0.0],
            r: vec![1.0],
        }
    }

    #[test]
    fn rejects_empty_particle_set() {
        let cfg = SweepConfig::new(1.0, 1, 4).unwrap();
        let res = Sweep::new(cfg, ParticleSet::default(), drift_factory(2, 0.5));
        assert!(res.is_err());
    }

    #[test]
    fn rejects_mismatched_arrays() {
        let cfg = SweepConfig::new(1.0, 1, 4).unwrap();
        let mut parts = single_particle_set();
        parts.vy.push(0.0);
        assert!(Sweep::new(cfg, parts, drift_factory(2, 0.5)).is_err());
    }

    #[test]
    fn rejects_non_finite_state() {
        let cfg = SweepConfig::new(1.0, 1, 4).unwrap();
        let mut parts = single_particle_set();
        parts.z[0] = f64::NAN;
        assert!(Sweep::new(cfg, parts, drift_factory(2, 0.5)).is_err());
    }

    #[test]
    fn step_advances_epoch_and_state() {
        let cfg = SweepConfig::new(1.0, 1, 4).unwrap();
        let mut sweep = Sweep::new(cfg, single_particle_set(), drift_factory(2, 0.25)).unwrap();
        let report = sweep.step().unwrap();
        assert!((sweep.time().to_f64() - 1.0).abs() < 1e-15);
        // x drifted from 0 to 1 at unit velocity.
        assert!((sweep.particles().x[0] - 1.0).abs() < 1e-12);
        assert_eq!(report.trees.len(), 1);
        assert_eq!(report.trees[0].n_nodes, 1);
    }

    #[test]
    fn report_serializes_to_json() {
        let cfg = SweepConfig::new(1.0, 2, 4).unwrap();
        let mut sweep = Sweep::new(cfg, single_particle_set(), drift_factory(2, 0.25)).unwrap();
        let report = sweep.step().unwrap();
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"trees\""));
        assert!(json.contains("n_nodes"));
    }
}
