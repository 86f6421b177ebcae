// SPDX-License-Identifier: AGPL-3.0-only

//! Morton encoding of AABB centres and indirect sorting.
//!
//! Per chunk: each particle's AABB centre is discretised against the chunk's
//! global bounding box and interleaved into a 64-bit code; the sort index is
//! then ordered by `(code, particle)` and used to gather sorted copies of
//! the bounds and codes. The sorted arrays are the sole input to the BVH
//! build.

use rayon::prelude::*;

use super::SweepData;
use crate::morton::{bin_coord, morton_encode};

/// Encode, sort, and gather every chunk of `data` in parallel.
///
/// Expects the per-particle AABBs, the finalized global bounds, and an
/// identity-initialised sort index; leaves `srt_*` arrays consistent with
/// the permutation.
pub(crate) fn morton_encode_sort(data: &mut SweepData) {
    let np = data.nparts;
    let nchunks = data.nchunks;

    let SweepData {
        lbs,
        ubs,
        mcodes,
        vidx,
        srt_mcodes,
        srt_lbs,
        srt_ubs,
        global_lb,
        global_ub,
        ..
    } = data;
    let lbs = &*lbs;
    let ubs = &*ubs;
    let global_lb = &*global_lb;
    let global_ub = &*global_ub;

    mcodes
        .par_chunks_mut(np)
        .zip(vidx.par_chunks_mut(np))
        .zip(srt_mcodes.par_chunks_mut(np))
        .zip(srt_lbs.par_chunks_mut(np))
        .zip(srt_ubs.par_chunks_mut(np))
        .enumerate()
        .for_each(|(k, ((((mc, vx), smc), slb), sub))| {
            let glb = global_lb[k];
            let gub = global_ub[k];

            // The lb/2 + ub/2 centre form cannot overflow where lb + ub
            // could.
            mc.par_iter_mut().enumerate().for_each(|(i, code)| {
                let lb = lbs[i * nchunks + k];
                let ub = ubs[i * nchunks + k];
                let mut bins = [0u64; 4];
                for c in 0..4 {
                    bins[c] = bin_coord(lb[c] / 2.0 + ub[c] / 2.0, glb[c], gub[c]);
                }
                *code = morton_encode(bins[0], bins[1], bins[2], bins[3]);
            });

            // Indirect sort of the particle indices by code; ties broken by
            // index so the permutation is reproducible across runs and
            // worker counts.
            let mc = &*mc;
            vx.par_sort_unstable_by_key(|&i| (mc[i as usize], i));
            let vx = &*vx;

            // Gather the sorted copies through the permutation.
            smc.par_iter_mut()
                .enumerate()
                .for_each(|(i, out)| *out = mc[vx[i] as usize]);
            slb.par_iter_mut()
                .enumerate()
                .for_each(|(i, out)| *out = lbs[vx[i] as usize * nchunks + k]);
            sub.par_iter_mut()
                .enumerate()
                .for_each(|(i, out)| *out = ubs[vx[i] as usize * nchunks + k]);
        });
}
