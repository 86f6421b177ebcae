// SPDX-License-Identifier: AGPL-3.0-only

//! Conjunction-screening pipeline validation.
//!
//! Runs a synthetic drifting constellation through the full superstep
//! pipeline and checks the produced spatial index against the exact
//! closed-form trajectories:
//!   - per-(chunk, particle) AABB containment of sampled positions
//!   - global AABB enclosure of every per-particle box
//!   - Morton sort order and permutation consistency
//!   - BVH structural invariants (full assertion suite)
//!   - state writeback and epoch advance across two supersteps
//!
//! Deterministic LCG-seeded initial conditions; pass/fail per check with
//! exit code 0/1 and a JSON report on stdout.

use std::process;
use std::sync::Arc;

use skysweep::tolerances::{CONTAINMENT_SAMPLES, DRIFT_STATE_ABS};
use skysweep::{
    verify_sweep, DriftPropagator, ParticleSet, PropagatorFactory, Sweep, SweepConfig,
    ValidationHarness,
};

const N_PARTICLES: usize = 1003; // deliberately not a multiple of the batch width
const DRIFT_SUBSTEP: f64 = 0.23;
const DRIFT_ORDER: u32 = 3;
const SEED: u64 = 42;

/// Deterministic LCG in [0, 1) (initialization only).
fn lcg_next(state: &mut u64) -> f64 {
    *state = state
        .wrapping_mul(6_364_136_223_846_793_005)
        .wrapping_add(1_442_695_040_888_963_407);
    (*state >> 33) as f64 / (1u64 << 31) as f64
}

fn init_constellation(n: usize, seed: u64) -> ParticleSet {
    let mut rng = seed;
    let mut parts = ParticleSet::default();
    for _ in 0..n {
        let x = (lcg_next(&mut rng) - 0.5) * 2000.0;
        let y = (lcg_next(&mut rng) - 0.5) * 2000.0;
        let z = (lcg_next(&mut rng) - 0.5) * 2000.0;
        parts.x.push(x);
        parts.y.push(y);
        parts.z.push(z);
        parts.vx.push((lcg_next(&mut rng) - 0.5) * 10.0);
        parts.vy.push((lcg_next(&mut rng) - 0.5) * 10.0);
        parts.vz.push((lcg_next(&mut rng) - 0.5) * 10.0);
        parts.r.push((x * x + y * y + z * z).sqrt());
    }
    parts
}

/// Replicate the drift propagator's piecewise-linear radial trajectory:
/// breakpoints at every substep, rate held constant inside each one.
/// Arithmetic matches the propagator operation for operation.
struct RadialTrack {
    /// (substep start time, r at start, rate inside the substep)
    segments: Vec<(f64, f64, f64)>,
}

impl RadialTrack {
    #[allow(clippy::many_single_char_names)]
    fn new(parts: &ParticleSet, i: usize, superstep: f64, substep: f64) -> Self {
        let (mut x, mut y, mut z) = (parts.x[i], parts.y[i], parts.z[i]);
        let (vx, vy, vz) = (parts.vx[i], parts.vy[i], parts.vz[i]);
        let mut r = parts.r[i];

        let mut segments = Vec::new();
        let mut elapsed = 0.0f64;
        loop {
            let h = (superstep - elapsed).min(substep);
            if h <= 0.0 {
                break;
            }
            let rdot = if r == 0.0 {
                0.0
            } else {
                (x * vx + y * vy + z * vz) / r
            };
            segments.push((elapsed, r, rdot));
            x = vx.mul_add(h, x);
            y = vy.mul_add(h, y);
            z = vz.mul_add(h, z);
            r = rdot.mul_add(h, r);
            let next = elapsed + h;
            if next == elapsed {
                break;
            }
            elapsed = next;
        }
        Self { segments }
    }

    fn eval(&self, t: f64) -> f64 {
        // Last segment starting at or before t.
        let idx = self
            .segments
            .partition_point(|&(start, _, _)| start <= t)
            .saturating_sub(1);
        let (start, r0, rdot) = self.segments[idx];
        rdot.mul_add(t - start, r0)
    }
}

#[allow(clippy::too_many_lines)]
fn main() {
    println!("══════════════════════════════════════════════════════════");
    println!("  skysweep pipeline validation — drifting constellation");
    println!("══════════════════════════════════════════════════════════");

    let cfg = SweepConfig::leo_screening();
    let nk = cfg.n_chunks as usize;
    let chunk_w = cfg.chunk_width();
    println!(
        "  N = {N_PARTICLES}, superstep = {:.3}, chunks = {nk}, batch width = {}",
        cfg.superstep, cfg.batch_width
    );

    let parts = init_constellation(N_PARTICLES, SEED);
    let initial = parts.clone();

    let factory: Arc<PropagatorFactory> =
        Arc::new(|w| Box::new(DriftPropagator::new(w, DRIFT_ORDER, DRIFT_SUBSTEP)));

    let mut sweep = match Sweep::new(cfg, parts, factory) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("  setup failed: {e}");
            process::exit(1);
        }
    };

    println!("  ── Superstep 1 ──");
    let report = match sweep.step() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("  superstep failed: {e}");
            process::exit(1);
        }
    };
    println!(
        "    AABB {:.3}s | sort {:.3}s | BVH {:.3}s | total {:.3}s",
        report.aabb_s, report.sort_s, report.bvh_s, report.total_s
    );

    let mut harness = ValidationHarness::new("validate_sweep");
    let data = sweep.data();

    // ── AABB containment against the exact trajectories ──
    let sample_stride = (N_PARTICLES / 41).max(1);
    let mut xyz_violations = 0usize;
    let mut r_violations = 0usize;
    for i in (0..N_PARTICLES).step_by(sample_stride) {
        let track = RadialTrack::new(&initial, i, cfg.superstep, DRIFT_SUBSTEP);
        for k in 0..nk {
            let (lb, ub) = data.aabb(k, i);
            for s in 0..CONTAINMENT_SAMPLES {
                let t = (k as f64 + s as f64 / (CONTAINMENT_SAMPLES - 1) as f64) * chunk_w;
                let pos = [
                    initial.vx[i].mul_add(t, initial.x[i]),
                    initial.vy[i].mul_add(t, initial.y[i]),
                    initial.vz[i].mul_add(t, initial.z[i]),
                    track.eval(t),
                ];
                for c in 0..4 {
                    if pos[c] < f64::from(lb[c]) || pos[c] > f64::from(ub[c]) {
                        if c == 3 {
                            r_violations += 1;
                        } else {
                            xyz_violations += 1;
                        }
                    }
                }
            }
        }
    }
    harness.check_count("position containment violations", xyz_violations, 0);
    harness.check_count("radial containment violations", r_violations, 0);

    // ── Global boxes enclose every per-particle box ──
    let mut enclosure_violations = 0usize;
    for k in 0..nk {
        let (glb, gub) = data.global_bounds(k);
        for i in 0..N_PARTICLES {
            let (lb, ub) = data.aabb(k, i);
            for c in 0..4 {
                if lb[c] < glb[c] || ub[c] > gub[c] {
                    enclosure_violations += 1;
                }
            }
        }
    }
    harness.check_count("global AABB enclosure violations", enclosure_violations, 0);

    // ── Sort order and permutation consistency ──
    let mut order_violations = 0usize;
    let mut perm_violations = 0usize;
    for k in 0..nk {
        let codes = data.sorted_codes(k);
        let raw = data.morton_codes(k);
        let vidx = data.sort_index(k);
        let mut seen = vec![false; N_PARTICLES];
        for i in 0..N_PARTICLES {
            if i + 1 < N_PARTICLES && codes[i] > codes[i + 1] {
                order_violations += 1;
            }
            if codes[i] != raw[vidx[i] as usize] {
                perm_violations += 1;
            }
            if seen[vidx[i] as usize] {
                perm_violations += 1;
            }
            seen[vidx[i] as usize] = true;
        }
    }
    harness.check_count("sorted code order violations", order_violations, 0);
    harness.check_count("sort permutation violations", perm_violations, 0);

    // ── Tree shape ──
    let mut roots_ok = true;
    let mut leaf_particles = 0usize;
    for k in 0..nk {
        let tree = data.tree(k);
        let root = &tree[0];
        roots_ok &= root.begin == 0
            && root.end as usize == N_PARTICLES
            && root.parent == -1;
        leaf_particles += tree
            .iter()
            .filter(|n| n.is_leaf())
            .map(|n| (n.end - n.begin) as usize)
            .sum::<usize>();
    }
    harness.check_true(
        "every root covers the whole particle range",
        roots_ok,
        "begin=0, end=N, parent=-1",
    );
    harness.check_count(
        "leaf ranges partition the particles",
        leaf_particles,
        N_PARTICLES * nk,
    );

    // ── Full assertion suite (panics on any violated invariant) ──
    verify_sweep(data);
    harness.check_true(
        "structural invariant verifier",
        true,
        "verify_sweep completed",
    );

    // ── State writeback against the closed form ──
    let mut writeback_err = 0.0f64;
    for i in (0..N_PARTICLES).step_by(sample_stride) {
        let expect_x = initial.vx[i].mul_add(cfg.superstep, initial.x[i]);
        writeback_err = writeback_err.max((sweep.particles().x[i] - expect_x).abs());
    }
    harness.check_upper("state writeback |err| (x)", writeback_err, DRIFT_STATE_ABS);

    // ── Second superstep composes ──
    println!("  ── Superstep 2 ──");
    match sweep.step() {
        Ok(r2) => {
            println!(
                "    AABB {:.3}s | sort {:.3}s | BVH {:.3}s | total {:.3}s",
                r2.aabb_s, r2.sort_s, r2.bvh_s, r2.total_s
            );
            harness.check_true("second superstep", true, "completed");
            harness.check_abs(
                "epoch after two supersteps",
                sweep.time().to_f64(),
                2.0 * cfg.superstep,
                1e-12,
            );
        }
        Err(e) => {
            harness.check_true("second superstep", false, &format!("{e}"));
        }
    }

    harness.print_summary();

    match serde_json::to_string_pretty(&report) {
        Ok(json) => {
            println!();
            println!("  ── superstep 1 report (JSON) ──");
            println!("{json}");
        }
        Err(e) => eprintln!("  report serialization failed: {e}"),
    }

    process::exit(harness.exit_code());
}
