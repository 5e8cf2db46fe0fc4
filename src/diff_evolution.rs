use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::position::Position;
use crate::proposal::{Proposal, ProposalCtx, Proposed};

/// The usual `2.38 / sqrt(2 d)` differential-evolution scale.
fn de_scale(dim: usize) -> f64 {
    2.38 / (2.0 * dim as f64).sqrt()
}

/// Pick two distinct sibling chains, both different from `own`.
fn pick_siblings(own: usize, n_chains: usize, rng: &mut ChaCha8Rng) -> (usize, usize) {
    debug_assert!(n_chains >= 3);
    let mut first = rng.random_range(0..n_chains);
    while first == own {
        first = rng.random_range(0..n_chains);
    }
    let mut second = rng.random_range(0..n_chains);
    while second == own || second == first {
        second = rng.random_range(0..n_chains);
    }
    (first, second)
}

/// How many leading parameters the difference vector may touch. For
/// trans-dimensional runs only the always-active prefix of `min_dim`
/// parameters is comparable across chains.
fn comparable_dims(ctx: &ProposalCtx<'_>, current: &Position) -> usize {
    if current.is_trans_dimensional() {
        ctx.min_dim
    } else {
        ctx.max_dim
    }
}

/// Differential evolution: steps along the difference between two sibling
/// chains' current positions.
///
/// The one proposal family that crosses chain boundaries. Siblings are read
/// through the snapshot board, so the difference vector is built from two
/// complete, immutable positions regardless of what those chains are doing
/// concurrently. Treated as symmetric.
pub struct DifferentialEvolution {
    _private: (),
}

impl DifferentialEvolution {
    pub fn new() -> Self {
        Self { _private: () }
    }
}

impl Default for DifferentialEvolution {
    fn default() -> Self {
        Self::new()
    }
}

impl Proposal for DifferentialEvolution {
    fn kind(&self) -> &'static str {
        "differential-evolution"
    }

    fn propose(
        &mut self,
        ctx: &ProposalCtx<'_>,
        current: &Position,
        rng: &mut ChaCha8Rng,
    ) -> Proposed {
        let dims = comparable_dims(ctx, current);
        if ctx.n_chains < 3 || dims == 0 {
            return Proposed::stay(current);
        }
        let (a, b) = pick_siblings(ctx.chain, ctx.n_chains, rng);
        let first = ctx.snapshots.read(a);
        let second = ctx.snapshots.read(b);

        let gamma: f64 = rng.sample::<f64, _>(StandardNormal) * de_scale(dims);
        let mut proposed = current.clone();
        proposed.clear_scores();
        for i in 0..dims {
            proposed.set(i, proposed.get(i) + gamma * (first.get(i) - second.get(i)));
        }
        Proposed::symmetric(proposed)
    }
}

#[derive(Debug, Clone)]
pub struct BlockDeSettings {
    /// Parameter index blocks, each updated as a unit.
    pub blocks: Vec<Vec<usize>>,
    /// Relative probability of choosing each block.
    pub block_probs: Vec<f64>,
}

impl BlockDeSettings {
    /// Even split of `0..max_dim` into `n_blocks` contiguous blocks with
    /// uniform probabilities.
    pub fn contiguous(max_dim: usize, n_blocks: usize) -> Self {
        assert!(n_blocks > 0 && n_blocks <= max_dim);
        let per = max_dim.div_ceil(n_blocks);
        let blocks: Vec<Vec<usize>> = (0..max_dim)
            .collect::<Vec<_>>()
            .chunks(per)
            .map(|c| c.to_vec())
            .collect();
        let n = blocks.len();
        Self {
            blocks,
            block_probs: vec![1.0 / n as f64; n],
        }
    }
}

/// Block differential evolution: like [`DifferentialEvolution`] but the
/// difference vector is applied to one randomly chosen parameter block,
/// letting strongly correlated sub-spaces move together. Occasionally takes
/// the unscaled difference to allow direct mode hops.
pub struct BlockDifferentialEvolution {
    settings: BlockDeSettings,
    cumulative: Vec<f64>,
}

/// Fraction of steps using the scaled difference; the remainder use the raw
/// difference vector.
const SCALED_FRACTION: f64 = 0.9;

impl BlockDifferentialEvolution {
    pub fn new(settings: BlockDeSettings) -> Self {
        let total: f64 = settings.block_probs.iter().sum();
        let mut acc = 0f64;
        let cumulative = settings
            .block_probs
            .iter()
            .map(|p| {
                acc += p / total;
                acc
            })
            .collect();
        Self {
            settings,
            cumulative,
        }
    }

    fn pick_block(&self, rng: &mut ChaCha8Rng) -> usize {
        let draw = rng.random::<f64>();
        self.cumulative
            .iter()
            .position(|edge| draw < *edge)
            .unwrap_or(self.settings.blocks.len() - 1)
    }
}

impl Proposal for BlockDifferentialEvolution {
    fn kind(&self) -> &'static str {
        "block-differential-evolution"
    }

    fn propose(
        &mut self,
        ctx: &ProposalCtx<'_>,
        current: &Position,
        rng: &mut ChaCha8Rng,
    ) -> Proposed {
        let dims = comparable_dims(ctx, current);
        if ctx.n_chains < 3 || dims == 0 {
            return Proposed::stay(current);
        }
        let block = self.pick_block(rng);
        let (a, b) = pick_siblings(ctx.chain, ctx.n_chains, rng);
        let first = ctx.snapshots.read(a);
        let second = ctx.snapshots.read(b);

        let gamma: f64 = if rng.random::<f64>() < SCALED_FRACTION {
            rng.sample::<f64, _>(StandardNormal) * de_scale(ctx.max_dim)
        } else {
            1.0
        };
        let mut proposed = current.clone();
        proposed.clear_scores();
        for &i in &self.settings.blocks[block] {
            if i < dims {
                proposed.set(i, proposed.get(i) + gamma * (first.get(i) - second.get(i)));
            }
        }
        Proposed::symmetric(proposed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SnapshotBoard;
    use rand::SeedableRng;

    fn board(positions: &[&[f64]]) -> SnapshotBoard {
        SnapshotBoard::new(
            positions
                .iter()
                .map(|params| {
                    let mut pos = Position::new(params.len());
                    pos.params_mut().copy_from_slice(params);
                    pos.set_scores(0.0, 0.0);
                    pos
                })
                .collect(),
        )
    }

    fn ctx<'a>(snapshots: &'a SnapshotBoard, n_chains: usize) -> ProposalCtx<'a> {
        ProposalCtx {
            chain: 0,
            n_chains,
            beta: 1.0,
            min_dim: 0,
            max_dim: 2,
            bounds: None,
            snapshots,
            adapting: true,
        }
    }

    #[test]
    fn needs_three_chains() {
        let snapshots = board(&[&[0.0, 0.0], &[1.0, 1.0]]);
        let mut de = DifferentialEvolution::new();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let current = Position::new(2);
        let proposed = de.propose(&ctx(&snapshots, 2), &current, &mut rng);
        assert_eq!(proposed.position, current);
    }

    #[test]
    fn moves_along_sibling_difference() {
        // Chains 1 and 2 differ only in parameter 0, so every DE step from
        // chain 0 must leave parameter 1 untouched.
        let snapshots = board(&[&[0.0, 0.0], &[1.0, 5.0], &[3.0, 5.0]]);
        let mut de = DifferentialEvolution::new();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let current = Position::new(2);
        for _ in 0..50 {
            let proposed = de.propose(&ctx(&snapshots, 3), &current, &mut rng);
            assert_eq!(proposed.position.get(1), 0.0);
            assert_eq!(proposed.log_ratio_adjustment, 0.0);
        }
    }

    #[test]
    fn never_reads_its_own_chain() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..1000 {
            let (a, b) = pick_siblings(2, 5, &mut rng);
            assert_ne!(a, 2);
            assert_ne!(b, 2);
            assert_ne!(a, b);
        }
    }

    #[test]
    fn block_variant_touches_only_the_chosen_block() {
        let snapshots = board(&[&[0.0, 0.0], &[1.0, 2.0], &[4.0, 9.0]]);
        let settings = BlockDeSettings {
            blocks: vec![vec![0], vec![1]],
            block_probs: vec![1.0, 0.0],
        };
        let mut de = BlockDifferentialEvolution::new(settings);
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let current = Position::new(2);
        for _ in 0..50 {
            let proposed = de.propose(&ctx(&snapshots, 3), &current, &mut rng);
            assert_eq!(proposed.position.get(1), 0.0);
        }
    }

    #[test]
    fn contiguous_blocks_cover_every_index() {
        let settings = BlockDeSettings::contiguous(5, 2);
        let all: Vec<usize> = settings.blocks.iter().flatten().copied().collect();
        assert_eq!(all, vec![0, 1, 2, 3, 4]);
    }
}
