// SPDX-License-Identifier: AGPL-3.0-only

//! Exhaustive invariant verification of the per-chunk spatial indices.
//!
//! Checks every structural and geometric invariant of the trees, the leaf
//! partition of the particle set, the bit-split rule, and the consistency
//! of the sorted arrays with the sort permutation. Violations are
//! programmer errors, so this asserts rather than returning errors; it runs
//! on debug builds after every superstep and is available to tests and the
//! validation binary.

use std::collections::HashSet;

use rayon::prelude::*;

use super::SweepData;

/// Index (counted from the MSB) of the first bit where `a` and `b` differ;
/// 64 when the values are equal.
fn first_diff_bit(a: u64, b: u64) -> u32 {
    (a ^ b).leading_zeros()
}

/// Assert every invariant of `data`'s trees, sorted arrays, and sort
/// permutations. Panics on the first violation.
// Exact float equality is intended throughout: sorted copies and pulled-up
// AABBs must be bitwise identical to their sources.
#[allow(clippy::float_cmp)]
pub fn verify_sweep(data: &SweepData) {
    let np = data.nparts;
    let nk = data.nchunks;

    (0..nk).into_par_iter().for_each(|k| {
        let tree = &data.trees[k];
        let codes = &data.srt_mcodes[k * np..(k + 1) * np];
        let slbs = &data.srt_lbs[k * np..(k + 1) * np];
        let subs = &data.srt_ubs[k * np..(k + 1) * np];
        let vidx = &data.vidx[k * np..(k + 1) * np];
        let raw_codes = &data.mcodes[k * np..(k + 1) * np];

        // Sorted order and permutation consistency with the unsorted data.
        for i in 0..np {
            if i + 1 < np {
                assert!(
                    codes[i] <= codes[i + 1],
                    "chunk {k}: sorted codes out of order at {i}"
                );
            }
            let src = vidx[i] as usize;
            assert_eq!(
                codes[i], raw_codes[src],
                "chunk {k}: code permutation mismatch at {i}"
            );
            assert_eq!(
                slbs[i],
                data.lbs[src * nk + k],
                "chunk {k}: lb permutation mismatch at {i}"
            );
            assert_eq!(
                subs[i],
                data.ubs[src * nk + k],
                "chunk {k}: ub permutation mismatch at {i}"
            );
        }

        assert!(!tree.is_empty(), "chunk {k}: empty tree");
        let mut pset: HashSet<u32> = HashSet::with_capacity(np);

        for (i, node) in tree.iter().enumerate() {
            assert!(
                node.end > node.begin,
                "chunk {k} node {i}: empty particle range"
            );

            // Zero or two children.
            if node.left == -1 {
                assert_eq!(node.right, -1, "chunk {k} node {i}: half-leaf");
            } else {
                assert!(node.left > 0, "chunk {k} node {i}: bad left child");
                assert!(node.right > 0, "chunk {k} node {i}: bad right child");
            }

            if node.end - node.begin == 1 {
                assert!(node.is_leaf(), "chunk {k} node {i}: singleton not a leaf");
            }

            if node.is_leaf() {
                // Multi-particle leaves exist only when every particle
                // shares one Morton code; each particle lands in exactly
                // one leaf.
                let mc = codes[node.begin as usize];
                for p in node.begin..node.end {
                    if node.end - node.begin > 1 {
                        assert_eq!(
                            codes[p as usize], mc,
                            "chunk {k} node {i}: mixed codes in multi-particle leaf"
                        );
                    }
                    assert!(
                        pset.insert(p),
                        "chunk {k}: particle {p} covered by two leaves"
                    );
                }
                assert!(node.split_idx <= 64, "chunk {k} node {i}: split_idx");
            } else {
                let ul = node.left as usize;
                let ur = node.right as usize;
                assert!(ul > i && ul < tree.len(), "chunk {k} node {i}: left index");
                assert!(ur > i && ur < tree.len(), "chunk {k} node {i}: right index");

                // Children partition the parent's range.
                assert_eq!(tree[ul].begin, node.begin, "chunk {k} node {i}");
                assert!(tree[ul].end < node.end, "chunk {k} node {i}");
                assert_eq!(tree[ur].begin, tree[ul].end, "chunk {k} node {i}");
                assert_eq!(tree[ur].end, node.end, "chunk {k} node {i}");

                assert!(node.split_idx <= 63, "chunk {k} node {i}: split_idx");

                // The recorded split bit is the first differing bit at the
                // child boundary.
                let split_pos = tree[ul].end as usize - 1;
                assert_eq!(
                    first_diff_bit(codes[split_pos], codes[split_pos + 1]),
                    node.split_idx,
                    "chunk {k} node {i}: split bit rule"
                );
            }

            // Parent links: the root has none, every other node points at
            // an earlier node whose range contains and abuts its own.
            if i == 0 {
                assert_eq!(node.parent, -1, "chunk {k}: root has a parent");
            } else {
                assert!(node.parent >= 0, "chunk {k} node {i}: orphan node");
                let up = node.parent as usize;
                assert!(up < i, "chunk {k} node {i}: parent not earlier");
                assert!(
                    node.begin >= tree[up].begin && node.end <= tree[up].end,
                    "chunk {k} node {i}: range escapes parent"
                );
                assert!(
                    node.begin == tree[up].begin || node.end == tree[up].end,
                    "chunk {k} node {i}: range not flush with parent"
                );
            }

            assert!(node.nn_level > 0, "chunk {k} node {i}: nn_level");

            // The node AABB is the exact min/max over its particles.
            let mut lb = [f32::INFINITY; 4];
            let mut ub = [f32::NEG_INFINITY; 4];
            for p in node.begin as usize..node.end as usize {
                for c in 0..4 {
                    lb[c] = lb[c].min(slbs[p][c]);
                    ub[c] = ub[c].max(subs[p][c]);
                }
            }
            assert_eq!(lb, node.lb, "chunk {k} node {i}: lb mismatch");
            assert_eq!(ub, node.ub, "chunk {k} node {i}: ub mismatch");
        }

        assert_eq!(
            pset.len(),
            np,
            "chunk {k}: leaves do not cover every particle"
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_diff_bit_counts_from_msb() {
        assert_eq!(first_diff_bit(0, 1 << 63), 0);
        assert_eq!(first_diff_bit(0, 1), 63);
        assert_eq!(first_diff_bit(0b1000, 0b1100), 61);
    }

    #[test]
    fn first_diff_bit_equal_values() {
        assert_eq!(first_diff_bit(0xDEAD_BEEF, 0xDEAD_BEEF), 64);
        assert_eq!(first_diff_bit(0, 0), 64);
    }
}
