// SPDX-License-Identifier: AGPL-3.0-only

//! Level-synchronous BVH construction over sorted Morton codes.
//!
//! One tree per chunk, stored as a densely packed node array with index
//! links (no pointers). Nodes of a tree level occupy a contiguous range;
//! each level is processed with a parallel classify (reduce), a parallel
//! prefix sum over child counts (scan), and a parallel finalise (for), so
//! the build needs no pointer chasing and no per-node locking. This is
//! deliberately not a Karras-style fully parallel build: that produces a
//! different tree shape.
//!
//! Split rule: a node holding more than one particle is divided at the
//! first Morton bit index (from the MSB) at which its code range flips from
//! 0 to 1. If the bit does not flip inside the range the index is bumped
//! until a flip is found; when bit 63 is exhausted the node becomes a
//! multi-particle leaf, which implies all its codes are equal.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::SweepError;

const OVERFLOW_WHAT: &str = "BVH tree construction";

/// Block size for the two-pass parallel inclusive scan; below this a serial
/// scan is cheaper than the fork-join overhead.
const SCAN_BLOCK: usize = 1024;

/// One node of a per-chunk BVH.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BvhNode {
    /// First particle (in the chunk's sorted order) covered by this node.
    pub begin: u32,
    /// One past the last particle covered by this node.
    pub end: u32,
    /// Parent index; -1 iff this is the root.
    pub parent: i32,
    /// Left child index; -1 iff leaf.
    pub left: i32,
    /// Right child index; -1 iff leaf.
    pub right: i32,
    /// Node AABB lower bounds (x, y, z, r).
    pub lb: [f32; 4],
    /// Node AABB upper bounds (x, y, z, r).
    pub ub: [f32; 4],
    /// Number of nodes on this node's tree level.
    pub nn_level: u32,
    /// Morton bit index (from the MSB) at which this node was split; up to
    /// 64 for leaves that could not be split.
    pub split_idx: u32,
}

impl BvhNode {
    /// Leaf test: children are always both present or both absent.
    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        self.left == -1
    }
}

impl Default for BvhNode {
    fn default() -> Self {
        Self {
            begin: 0,
            end: 0,
            parent: -1,
            left: -1,
            right: -1,
            lb: [f32::INFINITY; 4],
            ub: [f32::NEG_INFINITY; 4],
            nn_level: 0,
            split_idx: 0,
        }
    }
}

/// Reusable per-chunk scratch for one level of the build: child counts,
/// left-child particle counts, and the prefix sum of the child counts.
#[derive(Debug, Default)]
pub struct LevelScratch {
    nc: Vec<u32>,
    nplc: Vec<u32>,
    ps: Vec<u32>,
}

/// Shape summary of one completed tree.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TreeStats {
    /// Total number of nodes.
    pub n_nodes: usize,
    /// Number of levels.
    pub n_levels: u32,
    /// Number of leaf nodes.
    pub n_leaves: u32,
}

/// Initial setup of the two children appended for an internal node.
#[derive(Clone, Copy)]
struct ChildSeed {
    parent: i32,
    begin: u32,
    mid: u32,
    end: u32,
    split_idx: u32,
}

/// Classify one node of the current level: decide leaf vs internal, bump
/// `split_idx` to the first flipping bit, and for leaves fill the AABB.
/// Returns 1 for a leaf, 0 otherwise.
fn classify_node(
    codes: &[u64],
    lbs: &[[f32; 4]],
    ubs: &[[f32; 4]],
    node: &mut BvhNode,
    nc: &mut u32,
    nplc: &mut u32,
) -> u32 {
    let begin = node.begin as usize;
    let end = node.end as usize;

    let mut split_off = 0usize;
    let mut is_leaf = true;

    if end - begin > 1 && node.split_idx <= 63 {
        // Codes in the range share all bits above split_idx, so at any
        // candidate bit the range is 0s-then-1s and the flip position is a
        // partition point.
        loop {
            let mask = 1u64 << (63 - node.split_idx);
            let off = codes[begin..end].partition_point(|&m| m & mask == 0);
            if off > 0 && off < end - begin {
                split_off = off;
                is_leaf = false;
                break;
            }
            if node.split_idx == 63 {
                // No bit index left: a multi-particle leaf whose codes are
                // all identical.
                break;
            }
            node.split_idx += 1;
        }
    }

    if is_leaf {
        *nc = 0;
        *nplc = 0;
        for p in begin..end {
            for c in 0..4 {
                node.lb[c] = node.lb[c].min(lbs[p][c]);
                node.ub[c] = node.ub[c].max(ubs[p][c]);
            }
        }
        1
    } else {
        *nc = 2;
        *nplc = split_off as u32;
        0
    }
}

/// Parallel inclusive prefix sum: block sums, serial block-offset pass,
/// then a parallel per-block sweep.
fn inclusive_scan(src: &[u32], dst: &mut [u32]) {
    debug_assert_eq!(src.len(), dst.len());

    if src.len() <= SCAN_BLOCK {
        let mut acc = 0u32;
        for (d, s) in dst.iter_mut().zip(src) {
            acc += *s;
            *d = acc;
        }
        return;
    }

    let block_sums: Vec<u32> = src.par_chunks(SCAN_BLOCK).map(|b| b.iter().sum()).collect();
    let mut offsets = vec![0u32; block_sums.len()];
    let mut acc = 0u32;
    for (o, s) in offsets.iter_mut().zip(&block_sums) {
        *o = acc;
        acc += *s;
    }

    dst.par_chunks_mut(SCAN_BLOCK)
        .zip(src.par_chunks(SCAN_BLOCK))
        .zip(offsets.par_iter())
        .for_each(|((d, s), &off)| {
            let mut acc = off;
            for (di, si) in d.iter_mut().zip(s) {
                acc += *si;
                *di = acc;
            }
        });
}

/// Upward pass: each internal node's AABB becomes the componentwise min/max
/// of its children. Walks level ranges from the penultimate level to the
/// root using `nn_level`; leaves already carry their AABBs.
fn pull_up_aabbs(tree: &mut [BvhNode]) {
    let last_level = tree[tree.len() - 1].nn_level as usize;
    let mut n_begin = tree.len() - last_level;
    if n_begin == 0 {
        // The tree is a single leaf root.
        return;
    }

    loop {
        let n_end = n_begin;
        n_begin -= tree[n_begin - 1].nn_level as usize;

        // Children of this level all live at indices >= n_end.
        let (head, tail) = tree.split_at_mut(n_end);
        head[n_begin..].par_iter_mut().for_each(|node| {
            if node.left == -1 {
                return;
            }
            let lc = &tail[node.left as usize - n_end];
            let rc = &tail[node.right as usize - n_end];
            for c in 0..4 {
                node.lb[c] = lc.lb[c].min(rc.lb[c]);
                node.ub[c] = lc.ub[c].max(rc.ub[c]);
            }
        });

        if n_begin == 0 {
            break;
        }
    }
}

/// Build one chunk's BVH from its sorted Morton codes and sorted AABBs.
///
/// `tree` is cleared and refilled; `scratch` is resized per level and
/// reused across calls. All three inputs are indexed by sorted particle
/// position and must have equal lengths, at least 1.
///
/// # Errors
///
/// Returns [`SweepError::Overflow`] if the particle count, a level width,
/// or the tree size would exceed the node index types.
pub fn build_tree(
    codes: &[u64],
    lbs: &[[f32; 4]],
    ubs: &[[f32; 4]],
    tree: &mut Vec<BvhNode>,
    scratch: &mut LevelScratch,
) -> Result<TreeStats, SweepError> {
    let nparts = codes.len();
    debug_assert!(nparts > 0);
    debug_assert_eq!(lbs.len(), nparts);
    debug_assert_eq!(ubs.len(), nparts);
    if nparts > u32::MAX as usize {
        return Err(SweepError::Overflow(OVERFLOW_WHAT));
    }

    tree.clear();
    tree.push(BvhNode {
        begin: 0,
        end: nparts as u32,
        ..BvhNode::default()
    });

    let mut cur_n_nodes: u32 = 1;
    let mut n_levels: u32 = 0;
    let mut n_leaves_total: u32 = 0;

    while cur_n_nodes != 0 {
        let cur_tree_size = tree.len();
        let n_begin = cur_tree_size - cur_n_nodes as usize;

        if cur_n_nodes > u32::MAX / 2 {
            return Err(SweepError::Overflow(OVERFLOW_WHAT));
        }

        let cn = cur_n_nodes as usize;
        scratch.nc.resize(cn, 0);
        scratch.nplc.resize(cn, 0);
        scratch.ps.resize(cn, 0);

        // Step 1: classify the level's nodes; reduce the leaf count.
        let n_leaves: u32 = tree[n_begin..]
            .par_iter_mut()
            .zip(scratch.nc.par_iter_mut())
            .zip(scratch.nplc.par_iter_mut())
            .map(|((node, nc), nplc)| classify_node(codes, lbs, ubs, node, nc, nplc))
            .sum();
        n_leaves_total += n_leaves;

        // Step 2: append default-initialised nodes for the next level; they
        // are fully set up in step 4.
        let nn_next = (cur_n_nodes * 2 - n_leaves * 2) as usize;
        let new_size = cur_tree_size
            .checked_add(nn_next)
            .ok_or(SweepError::Overflow(OVERFLOW_WHAT))?;
        if new_size > i32::MAX as usize {
            // Child links are i32 indices.
            return Err(SweepError::Overflow(OVERFLOW_WHAT));
        }
        tree.resize(new_size, BvhNode::default());

        // Step 3: prefix sum over the child counts.
        inclusive_scan(&scratch.nc, &mut scratch.ps);

        // Step 4: set nn_level and child links on the level, collect the
        // child seeds in level order, then initialise the appended child
        // pairs. Child pair i of the new level belongs to the i-th internal
        // node of this level, which is exactly the prefix-sum order.
        let (head, tail) = tree.split_at_mut(cur_tree_size);
        let seeds: Vec<ChildSeed> = head[n_begin..]
            .par_iter_mut()
            .zip(scratch.nc.par_iter())
            .zip(scratch.nplc.par_iter())
            .zip(scratch.ps.par_iter())
            .enumerate()
            .filter_map(|(li, (((node, &nc), &nplc), &ps))| {
                node.nn_level = cur_n_nodes;
                if nc == 0 {
                    return None;
                }
                let lc_idx = cur_tree_size + ps as usize - 2;
                node.left = lc_idx as i32;
                node.right = (lc_idx + 1) as i32;
                Some(ChildSeed {
                    parent: (n_begin + li) as i32,
                    begin: node.begin,
                    mid: node.begin + nplc,
                    end: node.end,
                    split_idx: node.split_idx + 1,
                })
            })
            .collect();

        tail.par_chunks_mut(2)
            .zip(seeds.par_iter())
            .for_each(|(pair, seed)| {
                pair[0] = BvhNode {
                    begin: seed.begin,
                    end: seed.mid,
                    parent: seed.parent,
                    split_idx: seed.split_idx,
                    ..BvhNode::default()
                };
                pair[1] = BvhNode {
                    begin: seed.mid,
                    end: seed.end,
                    parent: seed.parent,
                    split_idx: seed.split_idx,
                    ..BvhNode::default()
                };
            });

        // Step 5: advance. A zero next-level width means every node of this
        // level was a leaf and the construction phase is done.
        cur_n_nodes = nn_next as u32;
        n_levels += 1;
    }

    // Step 6: upward AABB pass.
    pull_up_aabbs(tree);

    Ok(TreeStats {
        n_nodes: tree.len(),
        n_levels,
        n_leaves: n_leaves_total,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn boxes(n: usize) -> (Vec<[f32; 4]>, Vec<[f32; 4]>) {
        let lbs: Vec<[f32; 4]> = (0..n).map(|i| [i as f32; 4]).collect();
        let ubs: Vec<[f32; 4]> = (0..n).map(|i| [i as f32 + 0.5; 4]).collect();
        (lbs, ubs)
    }

    fn build(codes: &[u64]) -> (Vec<BvhNode>, TreeStats) {
        let (lbs, ubs) = boxes(codes.len());
        let mut tree = Vec::new();
        let mut scratch = LevelScratch::default();
        let stats = build_tree(codes, &lbs, &ubs, &mut tree, &mut scratch).unwrap();
        (tree, stats)
    }

    #[test]
    fn single_particle_is_a_leaf_root() {
        let (tree, stats) = build(&[0x1234]);
        assert_eq!(stats.n_nodes, 1);
        assert_eq!(stats.n_levels, 1);
        assert_eq!(stats.n_leaves, 1);
        let root = &tree[0];
        assert!(root.is_leaf());
        assert_eq!(root.parent, -1);
        assert_eq!((root.begin, root.end), (0, 1));
        assert_eq!(root.nn_level, 1);
        assert_eq!(root.lb, [0.0; 4]);
        assert_eq!(root.ub, [0.5; 4]);
    }

    #[test]
    fn two_extreme_codes_split_at_bit_zero() {
        let (tree, stats) = build(&[0, u64::MAX]);
        assert_eq!(stats.n_nodes, 3);
        let root = &tree[0];
        assert_eq!((root.begin, root.end), (0, 2));
        assert_eq!(root.split_idx, 0);
        assert_eq!((root.left, root.right), (1, 2));
        assert!(tree[1].is_leaf());
        assert!(tree[2].is_leaf());
        assert_eq!((tree[1].begin, tree[1].end), (0, 1));
        assert_eq!((tree[2].begin, tree[2].end), (1, 2));
        assert_eq!(tree[1].parent, 0);
        assert_eq!(tree[2].parent, 0);
    }

    #[test]
    fn equal_codes_collapse_to_one_leaf() {
        let (tree, stats) = build(&[42, 42, 42, 42]);
        assert_eq!(stats.n_nodes, 1);
        let root = &tree[0];
        assert!(root.is_leaf());
        assert_eq!((root.begin, root.end), (0, 4));
        // The split search exhausts bit indices 0..=63 without a flip.
        assert_eq!(root.split_idx, 63);
        assert_eq!(root.lb, [0.0; 4]);
        assert_eq!(root.ub, [3.5; 4]);
    }

    #[test]
    fn lsb_split_gives_split_idx_64_leaves() {
        // Codes differing only at the LSB: the root splits at bit 63 and
        // both children carry split_idx 64.
        let (tree, _) = build(&[0, 0, 1]);
        let root = &tree[0];
        assert_eq!(root.split_idx, 63);
        let left = &tree[root.left as usize];
        let right = &tree[root.right as usize];
        assert_eq!((left.begin, left.end), (0, 2));
        assert!(left.is_leaf());
        assert_eq!(left.split_idx, 64);
        assert_eq!((right.begin, right.end), (2, 3));
        assert!(right.is_leaf());
        assert_eq!(right.split_idx, 64);
    }

    #[test]
    fn internal_aabbs_cover_children() {
        let codes: Vec<u64> = (0..16u64).map(|i| i * 37).collect();
        let (tree, _) = build(&codes);
        for (i, node) in tree.iter().enumerate() {
            if node.is_leaf() {
                continue;
            }
            let lc = &tree[node.left as usize];
            let rc = &tree[node.right as usize];
            for c in 0..4 {
                assert_eq!(node.lb[c], lc.lb[c].min(rc.lb[c]), "node {i} lb {c}");
                assert_eq!(node.ub[c], lc.ub[c].max(rc.ub[c]), "node {i} ub {c}");
            }
        }
    }

    #[test]
    fn ranges_partition_at_every_internal_node() {
        let codes: Vec<u64> = (0..33u64).map(|i| i.wrapping_mul(0x9E37_79B9)).collect();
        let mut sorted = codes.clone();
        sorted.sort_unstable();
        let (tree, stats) = build(&sorted);
        assert!(stats.n_levels > 1);
        for node in &tree {
            if node.is_leaf() {
                continue;
            }
            let lc = &tree[node.left as usize];
            let rc = &tree[node.right as usize];
            assert_eq!(lc.begin, node.begin);
            assert_eq!(lc.end, rc.begin);
            assert_eq!(rc.end, node.end);
            assert!(lc.end < node.end);
        }
    }

    #[test]
    fn scan_matches_serial_reference() {
        let src: Vec<u32> = (0..5000u32).map(|i| i % 7).collect();
        let mut dst = vec![0u32; src.len()];
        inclusive_scan(&src, &mut dst);
        let mut acc = 0u32;
        for (i, s) in src.iter().enumerate() {
            acc += *s;
            assert_eq!(dst[i], acc, "scan mismatch at {i}");
        }
    }

    #[test]
    fn scan_small_input() {
        let src = [2u32, 0, 2, 2];
        let mut dst = [0u32; 4];
        inclusive_scan(&src, &mut dst);
        assert_eq!(dst, [2, 2, 4, 6]);
    }
}
