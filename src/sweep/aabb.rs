// SPDX-License-Identifier: AGPL-3.0-only

//! Trajectory-bound AABB computation and the per-chunk global reduction.
//!
//! Batches of particles are propagated over the superstep while a per-step
//! callback records substep end-times (double-double, relative to the
//! superstep start) and the step's Taylor coefficients for x, y, z, r. For
//! every (chunk, particle) pair the coefficients of the substeps overlapping
//! the chunk are evaluated with interval arithmetic over the intersection
//! interval, and the resulting bounds are narrowed to f32 with outward
//! rounding. Containment therefore holds by construction:
//!
//! - the substep range located for a chunk is a superset of the overlap,
//! - evaluation runs on the substep/chunk intersection intervals,
//! - the double→float narrowing rounds lower bounds down and upper bounds
//!   up by one ULP.
//!
//! Each worker folds its batches' boxes into chunk-global bounds through a
//! lock-free CAS loop over the f32 bit patterns. The comparator is min/max,
//! so equal values do not churn; NaN never enters because non-finite substep
//! times abort propagation.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use rayon::prelude::*;

use super::ParticleSet;
use crate::config::SweepConfig;
use crate::dfloat::DoubleDouble;
use crate::error::SweepError;
use crate::interval::{horner_eval, Ival};
use crate::propagator::{BatchPropagator, LaneOutcome, PropagatorPool, StepControl, StepView, N_COORDS};

/// Substep end-times and Taylor coefficients recorded for one particle
/// during one superstep.
///
/// `tcoords` is strictly increasing and covers `[0, Δt]`; for substep `s`,
/// coefficients of power `o` sit at `s * (order + 1) + o` in each of the
/// four coordinate buffers.
#[derive(Debug, Default)]
pub struct SubstepRecord {
    pub(crate) tcoords: Vec<DoubleDouble>,
    pub(crate) tc_x: Vec<f64>,
    pub(crate) tc_y: Vec<f64>,
    pub(crate) tc_z: Vec<f64>,
    pub(crate) tc_r: Vec<f64>,
}

impl SubstepRecord {
    fn clear(&mut self) {
        self.tcoords.clear();
        self.tc_x.clear();
        self.tc_y.clear();
        self.tc_z.clear();
        self.tc_r.clear();
    }
}

/// Borrowed view of the driver-owned particle state arrays.
pub(crate) struct ParticleView<'a> {
    coords: [&'a [f64]; N_COORDS],
}

impl<'a> ParticleView<'a> {
    pub(crate) fn new(p: &'a ParticleSet) -> Self {
        Self {
            coords: [&p.x, &p.y, &p.z, &p.vx, &p.vy, &p.vz, &p.r],
        }
    }

    fn coord(&self, v: usize) -> &'a [f64] {
        self.coords[v]
    }

    fn len(&self) -> usize {
        self.coords[0].len()
    }
}

/// Mutable output buffers for the propagation phase.
pub(crate) struct Buffers<'a> {
    pub lbs: &'a mut [[f32; 4]],
    pub ubs: &'a mut [[f32; 4]],
    pub records: &'a mut [SubstepRecord],
    pub new_state: &'a mut [[f64; N_COORDS]],
    pub global_lb: &'a mut [[f32; 4]],
    pub global_ub: &'a mut [[f32; 4]],
}

/// Chunk-global bounds updated concurrently through f32 bit patterns.
struct AtomicBounds {
    lb: [AtomicU32; 4],
    ub: [AtomicU32; 4],
}

fn cas_min(slot: &AtomicU32, val: f32) {
    let mut cur = slot.load(Ordering::Relaxed);
    loop {
        let new = val.min(f32::from_bits(cur));
        match slot.compare_exchange_weak(cur, new.to_bits(), Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => break,
            Err(seen) => cur = seen,
        }
    }
}

fn cas_max(slot: &AtomicU32, val: f32) {
    let mut cur = slot.load(Ordering::Relaxed);
    loop {
        let new = val.max(f32::from_bits(cur));
        match slot.compare_exchange_weak(cur, new.to_bits(), Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => break,
            Err(seen) => cur = seen,
        }
    }
}

impl AtomicBounds {
    fn new() -> Self {
        let inf = f32::INFINITY.to_bits();
        let ninf = f32::NEG_INFINITY.to_bits();
        Self {
            lb: std::array::from_fn(|_| AtomicU32::new(inf)),
            ub: std::array::from_fn(|_| AtomicU32::new(ninf)),
        }
    }

    fn load(&self) -> ([f32; 4], [f32; 4]) {
        (
            std::array::from_fn(|c| f32::from_bits(self.lb[c].load(Ordering::Relaxed))),
            std::array::from_fn(|c| f32::from_bits(self.ub[c].load(Ordering::Relaxed))),
        )
    }
}

/// Per-worker chunk-local min/max reduction, committed to the shared
/// atomics once per worker run.
struct LocalBounds {
    lb: Vec<[f32; 4]>,
    ub: Vec<[f32; 4]>,
}

impl LocalBounds {
    fn new(nchunks: usize) -> Self {
        Self {
            lb: vec![[f32::INFINITY; 4]; nchunks],
            ub: vec![[f32::NEG_INFINITY; 4]; nchunks],
        }
    }

    /// Fold one batch's boxes (`lanes` particles, particle-major) in.
    fn accumulate(&mut self, lb_s: &[[f32; 4]], ub_s: &[[f32; 4]], lanes: usize) {
        let nchunks = self.lb.len();
        for j in 0..lanes {
            for k in 0..nchunks {
                let lb = lb_s[j * nchunks + k];
                let ub = ub_s[j * nchunks + k];
                for c in 0..4 {
                    self.lb[k][c] = self.lb[k][c].min(lb[c]);
                    self.ub[k][c] = self.ub[k][c].max(ub[c]);
                }
            }
        }
    }

    /// CAS the local reduction into the shared per-chunk bounds.
    fn commit(self, bounds: &[AtomicBounds]) {
        for (k, b) in bounds.iter().enumerate() {
            for c in 0..4 {
                cas_min(&b.lb[c], self.lb[k][c]);
                cas_max(&b.ub[c], self.ub[k][c]);
            }
        }
    }
}

/// Shared read-only context for the batch workers.
struct BatchCtx<'a> {
    nchunks: usize,
    chunk_width: f64,
    superstep: f64,
    init_time: DoubleDouble,
    state: &'a ParticleView<'a>,
    int_error: &'a AtomicBool,
}

/// Propagate all particles over the superstep and fill the per-(chunk,
/// particle) AABBs plus the finalized per-chunk global bounds.
///
/// Parallel over batches; each batch writes a disjoint slice of every
/// output array, so the only cross-worker writes are the global-bound
/// atomics.
pub(crate) fn integrate_and_bound(
    cfg: &SweepConfig,
    init_time: DoubleDouble,
    state: &ParticleView<'_>,
    batch_pool: &PropagatorPool,
    scalar_pool: &PropagatorPool,
    bufs: Buffers<'_>,
) -> Result<(), SweepError> {
    let nchunks = cfg.n_chunks as usize;
    let bw = cfg.batch_width as usize;
    debug_assert_eq!(bufs.lbs.len(), state.len() * nchunks);

    let int_error = AtomicBool::new(false);
    let bounds: Vec<AtomicBounds> = (0..nchunks).map(|_| AtomicBounds::new()).collect();

    let ctx = BatchCtx {
        nchunks,
        chunk_width: cfg.chunk_width(),
        superstep: cfg.superstep,
        init_time,
        state,
        int_error: &int_error,
    };

    let Buffers {
        lbs,
        ubs,
        records,
        new_state,
        global_lb,
        global_ub,
    } = bufs;

    // Each worker carries a chunk-local reduction over all the batches it
    // processed and commits it to the shared atomics once at the end of its
    // run, which keeps CAS contention away from the hot loop.
    lbs.par_chunks_mut(bw * nchunks)
        .zip(ubs.par_chunks_mut(bw * nchunks))
        .zip(records.par_chunks_mut(bw))
        .zip(new_state.par_chunks_mut(bw))
        .enumerate()
        .fold(
            || LocalBounds::new(nchunks),
            |mut local, (batch_idx, (((lb_s, ub_s), recs), ns))| {
                if ctx.int_error.load(Ordering::Relaxed) {
                    return local;
                }
                let pidx0 = batch_idx * bw;
                let lanes = recs.len();

                let ok = if lanes == bw {
                    let mut prop = batch_pool.acquire();
                    let ok = propagate_batch(&ctx, prop.as_mut(), pidx0, lb_s, ub_s, recs, ns);
                    batch_pool.release(prop);
                    ok
                } else {
                    // Scalar tail: the trailing particles that do not fill
                    // a whole batch go through width-1 instances, one lane
                    // at a time, with identical record and AABB semantics.
                    let mut prop = scalar_pool.acquire();
                    let mut ok = true;
                    for i in 0..lanes {
                        ok = propagate_batch(
                            &ctx,
                            prop.as_mut(),
                            pidx0 + i,
                            &mut lb_s[i * nchunks..(i + 1) * nchunks],
                            &mut ub_s[i * nchunks..(i + 1) * nchunks],
                            &mut recs[i..=i],
                            &mut ns[i..=i],
                        );
                        if !ok {
                            break;
                        }
                    }
                    scalar_pool.release(prop);
                    ok
                };

                if ok {
                    local.accumulate(lb_s, ub_s, lanes);
                } else {
                    ctx.int_error.store(true, Ordering::Relaxed);
                }
                local
            },
        )
        .for_each(|local| local.commit(&bounds));

    if int_error.load(Ordering::Relaxed) {
        return Err(SweepError::IntegrationFailure);
    }

    finalize_bounds(&bounds, global_lb, global_ub)
}

/// Drive one propagator over the superstep for `recs.len()` lanes starting
/// at particle `pidx0`, then accumulate the per-chunk AABBs. Returns false
/// if any lane failed to reach the time limit.
fn propagate_batch(
    ctx: &BatchCtx<'_>,
    prop: &mut dyn BatchPropagator,
    pidx0: usize,
    lbs: &mut [[f32; 4]],
    ubs: &mut [[f32; 4]],
    recs: &mut [SubstepRecord],
    ns: &mut [[f64; N_COORDS]],
) -> bool {
    let w = recs.len();
    debug_assert_eq!(prop.batch_width() as usize, w);
    let order = prop.order() as usize;

    for rec in recs.iter_mut() {
        rec.clear();
    }

    if prop.with_events() {
        prop.reset_cooldowns();
    }
    prop.set_time(ctx.init_time.hi(), ctx.init_time.lo());

    {
        let st = prop.state_mut();
        for v in 0..N_COORDS {
            let src = ctx.state.coord(v);
            st[v * w..(v + 1) * w].copy_from_slice(&src[pidx0..pidx0 + w]);
        }
    }

    let init_time = ctx.init_time;
    let mut cb = |view: &StepView<'_>| -> StepControl {
        let b = view.batch_width as usize;
        let stride = (view.order as usize + 1) * b;
        for j in 0..w {
            if view.last_h[j] == 0.0 {
                // The lane did not advance on this step.
                continue;
            }
            let t = DoubleDouble::from_parts(view.time_hi[j], view.time_lo[j]) - init_time;
            let rec = &mut recs[j];
            rec.tcoords.push(t);
            if !t.is_finite() {
                return StepControl::Stop;
            }
            for o in 0..=view.order as usize {
                rec.tc_x.push(view.tcs[o * b + j]);
                rec.tc_y.push(view.tcs[stride + o * b + j]);
                rec.tc_z.push(view.tcs[2 * stride + o * b + j]);
                rec.tc_r.push(view.tcs[6 * stride + o * b + j]);
            }
        }
        StepControl::Continue
    };
    prop.propagate_for(ctx.superstep, true, &mut cb);

    if prop
        .outcomes()
        .iter()
        .any(|o| *o != LaneOutcome::TimeLimit)
    {
        return false;
    }

    // The propagated end-of-superstep state seeds the next superstep.
    let st = prop.state();
    for j in 0..w {
        for v in 0..N_COORDS {
            ns[j][v] = st[v * w + j];
        }
    }

    let op1 = order + 1;
    for k in 0..ctx.nchunks {
        let c_begin = DoubleDouble::new(ctx.chunk_width * k as f64);
        let c_end = DoubleDouble::new(ctx.chunk_width * (k + 1) as f64);

        for j in 0..w {
            let rec = &recs[j];
            let mut lb = [f32::INFINITY; 4];
            let mut ub = [f32::NEG_INFINITY; 4];

            let tc = &rec.tcoords;
            // First substep ending strictly after the chunk begins, through
            // the first substep ending at or past the chunk end, made
            // half-open. The end is not bumped when already at the sequence
            // end (possible at the last chunk from FP rounding).
            let ss_first = tc.partition_point(|t| *t <= c_begin);
            let mut ss_last = ss_first + tc[ss_first..].partition_point(|t| *t < c_end);
            if ss_last != tc.len() {
                ss_last += 1;
            }

            for ss in ss_first..ss_last {
                let ss_start = if ss == 0 {
                    DoubleDouble::default()
                } else {
                    tc[ss - 1]
                };
                // Evaluation interval: the substep/chunk intersection,
                // referred to the substep start.
                let ev_lb = c_begin.max(ss_start);
                let ev_ub = c_end.min(tc[ss]);
                let h = Ival::new((ev_lb - ss_start).to_f64(), (ev_ub - ss_start).to_f64());

                let base = ss * op1;
                let polys = [&rec.tc_x, &rec.tc_y, &rec.tc_z, &rec.tc_r];
                for (c, tcv) in polys.iter().enumerate() {
                    let iv = horner_eval(&tcv[base..base + op1], h);
                    lb[c] = lb[c].min((iv.lower as f32).next_down());
                    ub[c] = ub[c].max((iv.upper as f32).next_up());
                }
            }

            lbs[j * ctx.nchunks + k] = lb;
            ubs[j * ctx.nchunks + k] = ub;
        }
    }

    true
}

/// Load the atomics into plain floats and enforce what the discretiser
/// needs: finite bounds and `ub` strictly above `lb` with a finite spread.
fn finalize_bounds(
    bounds: &[AtomicBounds],
    global_lb: &mut [[f32; 4]],
    global_ub: &mut [[f32; 4]],
) -> Result<(), SweepError> {
    for (k, b) in bounds.iter().enumerate() {
        let (lb, ub) = b.load();
        for c in 0..4 {
            if !lb[c].is_finite() || !ub[c].is_finite() {
                return Err(SweepError::NonFiniteBounds { chunk: k });
            }
            let mut hi = ub[c];
            while hi <= lb[c] {
                hi = hi.next_up();
            }
            if !(hi - lb[c]).is_finite() {
                return Err(SweepError::NonFiniteBounds { chunk: k });
            }
            global_lb[k][c] = lb[c];
            global_ub[k][c] = hi;
        }
    }
    Ok(())
}
