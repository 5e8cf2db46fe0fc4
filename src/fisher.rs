use std::fmt::{self, Debug};
use std::sync::Arc;

use faer::Mat;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::position::Position;
use crate::proposal::{Proposal, ProposalCtx, Proposed};

/// Caller-supplied Fisher information matrix, evaluated at a position. Must
/// return a symmetric `max_dim x max_dim` matrix.
pub type FisherMatrixFn = Arc<dyn Fn(&Position) -> Mat<f64> + Send + Sync>;

#[derive(Clone)]
pub struct FisherSettings {
    pub matrix: FisherMatrixFn,
    /// Attempts between eigenbasis refreshes (refreshes only happen while
    /// the chain is still adapting).
    pub update_every: u64,
    /// Lower bound on the curvature used for step scaling, keeping near-flat
    /// directions from producing unbounded steps.
    pub eigenvalue_floor: f64,
}

impl FisherSettings {
    pub fn new(matrix: FisherMatrixFn) -> Self {
        Self {
            matrix,
            update_every: 200,
            eigenvalue_floor: 10.0,
        }
    }
}

impl Debug for FisherSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FisherSettings")
            .field("matrix", &"<callback>")
            .field("update_every", &self.update_every)
            .field("eigenvalue_floor", &self.eigenvalue_floor)
            .finish()
    }
}

/// Anisotropic random walk along the eigenbasis of the local Fisher
/// information.
///
/// One eigenvector is picked per step and the position moves along it with a
/// Gaussian step whose width is `1/sqrt(lambda)`, tempered by the chain's
/// beta so hot chains take wider steps. Symmetric.
pub struct FisherProposal {
    settings: FisherSettings,
    max_dim: usize,
    eigenvalues: Vec<f64>,
    /// Eigenvectors, one per column index.
    eigenvectors: Vec<Vec<f64>>,
    attempts_since_update: u64,
    has_basis: bool,
}

/// Softens the beta scaling so near-zero-beta chains keep finite steps.
const BETA_SOFTENING: f64 = 1e-5;

impl FisherProposal {
    pub fn new(max_dim: usize, settings: FisherSettings) -> Self {
        Self {
            settings,
            max_dim,
            eigenvalues: vec![0f64; max_dim],
            eigenvectors: vec![vec![0f64; max_dim]; max_dim],
            attempts_since_update: 0,
            has_basis: false,
        }
    }

    fn refresh_basis(&mut self, current: &Position) {
        let fisher = (self.settings.matrix)(current);
        assert_eq!(
            (fisher.nrows(), fisher.ncols()),
            (self.max_dim, self.max_dim),
            "Fisher callback returned a wrongly shaped matrix"
        );
        let eigs = fisher
            .self_adjoint_eigen(faer::Side::Lower)
            .expect("Fisher matrix eigendecomposition failed");
        let values = eigs.S().column_vector().to_owned();
        self.eigenvalues = values.iter().copied().collect();
        let u = eigs.U();
        for (j, vector) in self.eigenvectors.iter_mut().enumerate() {
            for (slot, val) in vector.iter_mut().zip(u.col(j).iter()) {
                *slot = *val;
            }
        }
        self.attempts_since_update = 0;
        self.has_basis = true;
    }
}

impl Proposal for FisherProposal {
    fn kind(&self) -> &'static str {
        "fisher"
    }

    fn propose(
        &mut self,
        ctx: &ProposalCtx<'_>,
        current: &Position,
        rng: &mut ChaCha8Rng,
    ) -> Proposed {
        if !self.has_basis || (ctx.adapting && self.attempts_since_update >= self.settings.update_every)
        {
            self.refresh_basis(current);
        }
        self.attempts_since_update += 1;

        let direction = rng.random_range(0..self.max_dim);
        let curvature = self.eigenvalues[direction]
            .abs()
            .max(self.settings.eigenvalue_floor)
            * (ctx.beta + BETA_SOFTENING);
        let step: f64 = rng.sample::<f64, _>(StandardNormal) / curvature.sqrt();

        let mut proposed = current.clone();
        proposed.clear_scores();
        let vector = &self.eigenvectors[direction];
        for i in current.active_indices() {
            proposed.set(i, proposed.get(i) + step * vector[i]);
        }
        Proposed::symmetric(proposed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SnapshotBoard;
    use rand::SeedableRng;

    fn diagonal_fisher(scale: f64) -> FisherMatrixFn {
        Arc::new(move |pos: &Position| {
            Mat::from_fn(pos.max_dim(), pos.max_dim(), |i, j| {
                if i == j {
                    scale * (i + 1) as f64
                } else {
                    0.0
                }
            })
        })
    }

    fn ctx(board: &SnapshotBoard, beta: f64) -> ProposalCtx<'_> {
        ProposalCtx {
            chain: 0,
            n_chains: 1,
            beta,
            min_dim: 0,
            max_dim: 2,
            bounds: None,
            snapshots: board,
            adapting: true,
        }
    }

    #[test]
    fn steps_follow_the_eigenbasis() {
        let board = SnapshotBoard::new(vec![Position::new(2)]);
        let settings = FisherSettings::new(diagonal_fisher(100.0));
        let mut proposal = FisherProposal::new(2, settings);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let current = Position::new(2);

        // Diagonal Fisher: every step moves along exactly one axis.
        for _ in 0..40 {
            let proposed = proposal.propose(&ctx(&board, 1.0), &current, &mut rng);
            let moved = proposed
                .position
                .params()
                .iter()
                .filter(|v| v.abs() > 1e-14)
                .count();
            assert_eq!(moved, 1);
            assert_eq!(proposed.log_ratio_adjustment, 0.0);
        }
    }

    #[test]
    fn hotter_chains_take_wider_steps() {
        let board = SnapshotBoard::new(vec![Position::new(2)]);
        let settings = FisherSettings::new(diagonal_fisher(100.0));
        let current = Position::new(2);

        let spread = |beta: f64| {
            let mut proposal = FisherProposal::new(2, settings.clone());
            let mut rng = ChaCha8Rng::seed_from_u64(17);
            let mut total = 0f64;
            for _ in 0..200 {
                let proposed = proposal.propose(&ctx(&board, beta), &current, &mut rng);
                total += proposed
                    .position
                    .params()
                    .iter()
                    .map(|v| v * v)
                    .sum::<f64>();
            }
            total
        };

        assert!(spread(0.05) > spread(1.0));
    }
}
