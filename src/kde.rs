use std::collections::VecDeque;
use std::f64::consts::TAU;

use faer::Mat;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::position::Position;
use crate::proposal::{Proposal, ProposalCtx, Proposed};

#[derive(Debug, Clone, Copy)]
pub struct KdeSettings {
    /// Bound on the sample buffer; oldest entries fall out first.
    pub buffer_size: usize,
    /// Keep every n-th accepted sample.
    pub thin: usize,
    /// Attempts between density refits. Refitting every step would dominate
    /// the step cost.
    pub refit_every: u64,
    /// Buffered samples required before the first fit.
    pub min_samples: usize,
}

impl Default for KdeSettings {
    fn default() -> Self {
        Self {
            buffer_size: 512,
            thin: 5,
            refit_every: 200,
            min_samples: 64,
        }
    }
}

/// A fitted Gaussian kernel mixture: centers plus the shared covariance in
/// eigenbasis form, scaled by the Scott-factor bandwidth.
struct KdeFit {
    centers: Vec<Vec<f64>>,
    /// Unit eigenvectors of the sample covariance, one per column index.
    basis: Vec<Vec<f64>>,
    /// Per-direction kernel variances `h^2 * lambda_j`.
    variances: Vec<f64>,
    /// `-0.5 * (d ln(2 pi) + sum ln(h^2 lambda_j))`
    log_norm: f64,
}

impl KdeFit {
    /// Log density of the mixture at `point`, via logsumexp over centers.
    fn log_density(&self, point: &[f64]) -> f64 {
        let d = self.basis.len();
        let mut delta = vec![0f64; d];
        let mut best = f64::NEG_INFINITY;
        let mut terms = Vec::with_capacity(self.centers.len());
        for center in &self.centers {
            for i in 0..d {
                delta[i] = point[i] - center[i];
            }
            let mut quad = 0f64;
            for (axis, var) in self.basis.iter().zip(&self.variances) {
                let coord: f64 = axis.iter().zip(&delta).map(|(a, b)| a * b).sum();
                quad += coord * coord / var;
            }
            let term = self.log_norm - 0.5 * quad;
            best = best.max(term);
            terms.push(term);
        }
        let sum: f64 = terms.iter().map(|t| (t - best).exp()).sum();
        best + sum.ln() - (self.centers.len() as f64).ln()
    }
}

/// Proposal drawing from a kernel density estimate over the chain's own
/// recent accepted samples.
///
/// Not symmetric: the returned adjustment is
/// `log q(current) - log q(proposed)` under the fitted mixture. The fit is
/// refreshed periodically while the chain adapts and frozen afterwards,
/// leaving a fixed independence-style proposal.
pub struct KdeProposal {
    settings: KdeSettings,
    max_dim: usize,
    buffer: VecDeque<Vec<f64>>,
    accepted_seen: u64,
    attempts_since_fit: u64,
    fit: Option<KdeFit>,
}

impl KdeProposal {
    pub fn new(max_dim: usize, settings: KdeSettings) -> Self {
        Self {
            settings,
            max_dim,
            buffer: VecDeque::with_capacity(settings.buffer_size),
            accepted_seen: 0,
            attempts_since_fit: 0,
            fit: None,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn refit(&mut self) {
        let n = self.buffer.len();
        let d = self.max_dim;
        if n < self.settings.min_samples {
            return;
        }
        let mut mean = vec![0f64; d];
        for sample in &self.buffer {
            for i in 0..d {
                mean[i] += sample[i];
            }
        }
        for m in &mut mean {
            *m /= n as f64;
        }

        let cov = Mat::from_fn(d, d, |i, j| {
            self.buffer
                .iter()
                .map(|s| (s[i] - mean[i]) * (s[j] - mean[j]))
                .sum::<f64>()
                / (n as f64 - 1.0)
        });
        let eigs = cov
            .self_adjoint_eigen(faer::Side::Lower)
            .expect("covariance matrix eigendecomposition failed");
        let values = eigs.S().column_vector().to_owned();
        let eigenvalues: Vec<f64> = values.iter().copied().collect();
        let largest = eigenvalues.iter().fold(0f64, |a, b| a.max(b.abs()));
        if largest <= 0.0 {
            // Degenerate buffer; keep the previous fit if any.
            return;
        }
        let floor = largest * 1e-10;
        let u = eigs.U();
        let mut basis = vec![vec![0f64; d]; d];
        for (j, axis) in basis.iter_mut().enumerate() {
            for (slot, val) in axis.iter_mut().zip(u.col(j).iter()) {
                *slot = *val;
            }
        }

        // Scott's factor.
        let bandwidth = (n as f64).powf(-1.0 / (d as f64 + 4.0));
        let variances: Vec<f64> = eigenvalues
            .iter()
            .map(|l| l.max(floor) * bandwidth * bandwidth)
            .collect();
        let log_norm =
            -0.5 * (d as f64 * TAU.ln() + variances.iter().map(|v| v.ln()).sum::<f64>());

        self.fit = Some(KdeFit {
            centers: self.buffer.iter().cloned().collect(),
            basis,
            variances,
            log_norm,
        });
    }
}

impl Proposal for KdeProposal {
    fn kind(&self) -> &'static str {
        "kde"
    }

    fn propose(
        &mut self,
        ctx: &ProposalCtx<'_>,
        current: &Position,
        rng: &mut ChaCha8Rng,
    ) -> Proposed {
        // Density over a varying active set is not comparable; only full-
        // dimension states participate.
        if current.dim() != self.max_dim {
            return Proposed::stay(current);
        }
        if ctx.adapting
            && (self.fit.is_none() || self.attempts_since_fit >= self.settings.refit_every)
        {
            self.refit();
            self.attempts_since_fit = 0;
        }
        self.attempts_since_fit += 1;
        let Some(fit) = &self.fit else {
            return Proposed::stay(current);
        };

        let center = &fit.centers[rng.random_range(0..fit.centers.len())];
        let mut params = center.clone();
        for (axis, var) in fit.basis.iter().zip(&fit.variances) {
            let step: f64 = rng.sample::<f64, _>(StandardNormal) * var.sqrt();
            for (p, a) in params.iter_mut().zip(axis) {
                *p += step * a;
            }
        }

        let adjustment = fit.log_density(current.params()) - fit.log_density(&params);
        let mut proposed = current.clone();
        proposed.clear_scores();
        proposed.params_mut().copy_from_slice(&params);
        Proposed {
            position: proposed,
            log_ratio_adjustment: adjustment,
        }
    }

    fn record_sample(&mut self, position: &Position) {
        if position.dim() != self.max_dim {
            return;
        }
        self.accepted_seen += 1;
        if self.accepted_seen % self.settings.thin as u64 != 0 {
            return;
        }
        if self.buffer.len() == self.settings.buffer_size {
            self.buffer.pop_front();
        }
        self.buffer.push_back(position.params().to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SnapshotBoard;
    use rand::SeedableRng;

    fn ctx(board: &SnapshotBoard) -> ProposalCtx<'_> {
        ProposalCtx {
            chain: 0,
            n_chains: 1,
            beta: 1.0,
            min_dim: 0,
            max_dim: 2,
            bounds: None,
            snapshots: board,
            adapting: true,
        }
    }

    fn feed(proposal: &mut KdeProposal, rng: &mut ChaCha8Rng, count: usize) {
        for _ in 0..count {
            let mut pos = Position::new(2);
            pos.set(0, rng.sample::<f64, _>(StandardNormal));
            pos.set(1, 2.0 * rng.sample::<f64, _>(StandardNormal));
            pos.set_scores(0.0, 0.0);
            proposal.record_sample(&pos);
        }
    }

    #[test]
    fn stays_put_until_enough_samples() {
        let board = SnapshotBoard::new(vec![Position::new(2)]);
        let mut proposal = KdeProposal::new(2, KdeSettings::default());
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let current = Position::new(2);
        let proposed = proposal.propose(&ctx(&board), &current, &mut rng);
        assert_eq!(proposed.position, current);
        assert_eq!(proposed.log_ratio_adjustment, 0.0);
    }

    #[test]
    fn buffer_respects_its_bound_and_thinning() {
        let settings = KdeSettings {
            buffer_size: 16,
            thin: 2,
            ..KdeSettings::default()
        };
        let mut proposal = KdeProposal::new(2, settings);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        feed(&mut proposal, &mut rng, 10);
        assert_eq!(proposal.buffered(), 5);
        feed(&mut proposal, &mut rng, 100);
        assert_eq!(proposal.buffered(), 16);
    }

    #[test]
    fn correction_term_is_finite_and_sign_consistent() {
        let settings = KdeSettings {
            min_samples: 32,
            ..KdeSettings::default()
        };
        let board = SnapshotBoard::new(vec![Position::new(2)]);
        let mut proposal = KdeProposal::new(2, settings);
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        feed(&mut proposal, &mut rng, 500);

        let current = Position::new(2);
        for _ in 0..50 {
            let proposed = proposal.propose(&ctx(&board), &current, &mut rng);
            assert!(proposed.log_ratio_adjustment.is_finite());
            assert!(!proposed.position.scored());
        }
    }

    #[test]
    fn mixture_density_peaks_near_the_data() {
        let settings = KdeSettings {
            min_samples: 32,
            ..KdeSettings::default()
        };
        let board = SnapshotBoard::new(vec![Position::new(2)]);
        let mut proposal = KdeProposal::new(2, settings);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        feed(&mut proposal, &mut rng, 500);
        let current = Position::new(2);
        let _ = proposal.propose(&ctx(&board), &current, &mut rng);

        let fit = proposal.fit.as_ref().expect("fitted");
        assert!(fit.log_density(&[0.0, 0.0]) > fit.log_density(&[25.0, 25.0]));
    }
}
