use std::fmt::{self, Debug};

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::diff_evolution::{BlockDeSettings, BlockDifferentialEvolution, DifferentialEvolution};
use crate::fisher::{FisherProposal, FisherSettings};
use crate::gaussian::{GaussianProposal, GaussianSettings};
use crate::kde::{KdeProposal, KdeSettings};
use crate::layer_jump::{LayerSettings, RandomLayerJump, SequentialLayerJump};
use crate::position::Position;
use crate::store::SnapshotBoard;

/// What a proposal hands back: a freshly built position and the log
/// Metropolis-Hastings ratio adjustment for non-symmetric moves (zero for
/// symmetric ones).
#[derive(Debug)]
pub struct Proposed {
    pub position: Position,
    pub log_ratio_adjustment: f64,
}

impl Proposed {
    /// A symmetric move.
    pub fn symmetric(position: Position) -> Self {
        Self {
            position,
            log_ratio_adjustment: 0.0,
        }
    }

    /// Re-propose the current state unchanged. Used when a move is not
    /// available (dimension boundary, missing siblings); scores stay cached
    /// so the step costs nothing to evaluate.
    pub fn stay(current: &Position) -> Self {
        Self {
            position: current.clone(),
            log_ratio_adjustment: 0.0,
        }
    }
}

/// Per-step context handed to a proposal.
pub struct ProposalCtx<'a> {
    pub chain: usize,
    pub n_chains: usize,
    pub beta: f64,
    pub min_dim: usize,
    pub max_dim: usize,
    /// Per-parameter `(low, high)` prior bounds, when the run has them.
    pub bounds: Option<&'a [(f64, f64)]>,
    /// Current positions of every chain, published as immutable snapshots.
    pub snapshots: &'a SnapshotBoard,
    /// Whether online adaptation of proposal internals is still allowed.
    pub adapting: bool,
}

/// Uniform contract across all move families.
pub trait Proposal: Send {
    fn kind(&self) -> &'static str;

    /// Build a fresh candidate from `current`.
    fn propose(
        &mut self,
        ctx: &ProposalCtx<'_>,
        current: &Position,
        rng: &mut ChaCha8Rng,
    ) -> Proposed;

    /// Outcome feedback for the last proposed move from this family.
    fn observe(&mut self, _accepted: bool, _adapting: bool) {}

    /// Post-accept feed of the chain's new current position, for proposals
    /// that keep a sample buffer.
    fn record_sample(&mut self, _position: &Position) {}
}

/// One enabled move family plus its relative selection weight.
#[derive(Debug, Clone)]
pub struct ProposalSpec {
    pub kind: ProposalKind,
    pub weight: f64,
}

impl ProposalSpec {
    pub fn new(kind: ProposalKind, weight: f64) -> Self {
        Self { kind, weight }
    }
}

#[derive(Clone)]
pub enum ProposalKind {
    Gaussian(GaussianSettings),
    Fisher(FisherSettings),
    Kde(KdeSettings),
    DifferentialEvolution,
    BlockDifferentialEvolution(BlockDeSettings),
    SequentialLayer(LayerSettings),
    RandomLayer(LayerSettings),
}

impl ProposalKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProposalKind::Gaussian(_) => "gaussian",
            ProposalKind::Fisher(_) => "fisher",
            ProposalKind::Kde(_) => "kde",
            ProposalKind::DifferentialEvolution => "differential-evolution",
            ProposalKind::BlockDifferentialEvolution(_) => "block-differential-evolution",
            ProposalKind::SequentialLayer(_) => "sequential-layer",
            ProposalKind::RandomLayer(_) => "random-layer",
        }
    }

    /// Whether this family changes the active dimension.
    pub fn is_trans_dimensional(&self) -> bool {
        matches!(
            self,
            ProposalKind::SequentialLayer(_) | ProposalKind::RandomLayer(_)
        )
    }

    pub(crate) fn build(&self, max_dim: usize) -> Box<dyn Proposal> {
        match self {
            ProposalKind::Gaussian(settings) => {
                Box::new(GaussianProposal::new(max_dim, *settings))
            }
            ProposalKind::Fisher(settings) => {
                Box::new(FisherProposal::new(max_dim, settings.clone()))
            }
            ProposalKind::Kde(settings) => Box::new(KdeProposal::new(max_dim, *settings)),
            ProposalKind::DifferentialEvolution => Box::new(DifferentialEvolution::new()),
            ProposalKind::BlockDifferentialEvolution(settings) => {
                Box::new(BlockDifferentialEvolution::new(settings.clone()))
            }
            ProposalKind::SequentialLayer(settings) => {
                Box::new(SequentialLayerJump::new(*settings))
            }
            ProposalKind::RandomLayer(settings) => Box::new(RandomLayerJump::new(*settings)),
        }
    }
}

impl Debug for ProposalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A chain's private set of enabled proposals and the selection distribution
/// over them. Selection is independent per step; with adaptive weighting the
/// distribution is periodically retuned from trailing acceptance rates (only
/// while the chain is still in its adaptation window).
pub(crate) struct ProposalSet {
    proposals: Vec<Box<dyn Proposal>>,
    base_weights: Vec<f64>,
    weights: Vec<f64>,
    adaptive: bool,
    window_attempts: Vec<u64>,
    window_accepts: Vec<u64>,
    reweight_every: u64,
    observed: u64,
}

/// Floor keeping an unlucky proposal family from starving out entirely.
const REWEIGHT_FLOOR: f64 = 0.05;

impl ProposalSet {
    pub(crate) fn build(specs: &[ProposalSpec], max_dim: usize, adaptive: bool) -> Self {
        assert!(!specs.is_empty(), "validated at construction");
        let proposals: Vec<_> = specs.iter().map(|s| s.kind.build(max_dim)).collect();
        let total: f64 = specs.iter().map(|s| s.weight).sum();
        let base_weights: Vec<f64> = specs.iter().map(|s| s.weight / total).collect();
        let n = proposals.len();
        Self {
            proposals,
            weights: base_weights.clone(),
            base_weights,
            adaptive,
            window_attempts: vec![0; n],
            window_accepts: vec![0; n],
            reweight_every: 256,
            observed: 0,
        }
    }

    pub(crate) fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Sample a proposal index from the selection distribution.
    pub(crate) fn select(&self, rng: &mut ChaCha8Rng) -> usize {
        let draw = rng.random::<f64>();
        let mut acc = 0f64;
        for (i, w) in self.weights.iter().enumerate() {
            acc += w;
            if draw < acc {
                return i;
            }
        }
        self.weights.len() - 1
    }

    pub(crate) fn propose(
        &mut self,
        index: usize,
        ctx: &ProposalCtx<'_>,
        current: &Position,
        rng: &mut ChaCha8Rng,
    ) -> Proposed {
        self.proposals[index].propose(ctx, current, rng)
    }

    pub(crate) fn observe(&mut self, index: usize, accepted: bool, adapting: bool) {
        self.proposals[index].observe(accepted, adapting);
        if !(self.adaptive && adapting) {
            return;
        }
        self.window_attempts[index] += 1;
        if accepted {
            self.window_accepts[index] += 1;
        }
        self.observed += 1;
        if self.observed >= self.reweight_every {
            self.reweight();
        }
    }

    pub(crate) fn record_sample(&mut self, position: &Position) {
        for proposal in &mut self.proposals {
            proposal.record_sample(position);
        }
    }

    fn reweight(&mut self) {
        let mut total = 0f64;
        for i in 0..self.weights.len() {
            // A family not selected this window keeps its current weight.
            if self.window_attempts[i] > 0 {
                let rate = self.window_accepts[i] as f64 / self.window_attempts[i] as f64;
                self.weights[i] = self.base_weights[i] * (REWEIGHT_FLOOR + rate);
            }
            total += self.weights[i];
        }
        for w in &mut self.weights {
            *w /= total;
        }
        self.window_attempts.fill(0);
        self.window_accepts.fill(0);
        self.observed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn gaussian_spec(weight: f64) -> ProposalSpec {
        ProposalSpec::new(ProposalKind::Gaussian(GaussianSettings::default()), weight)
    }

    #[test]
    fn selection_honors_fixed_weights() {
        let specs = vec![gaussian_spec(3.0), gaussian_spec(1.0)];
        let set = ProposalSet::build(&specs, 2, false);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut counts = [0u32; 2];
        for _ in 0..20_000 {
            counts[set.select(&mut rng)] += 1;
        }
        let frac = counts[0] as f64 / 20_000.0;
        assert!((frac - 0.75).abs() < 0.02, "got {frac}");
    }

    #[test]
    fn adaptive_reweighting_stays_normalized() {
        let specs = vec![gaussian_spec(1.0), gaussian_spec(1.0)];
        let mut set = ProposalSet::build(&specs, 2, true);
        for _ in 0..600 {
            // One family accepts everything, the other nothing.
            set.observe(0, true, true);
            set.observe(1, false, true);
        }
        let total: f64 = set.weights().iter().sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert!(set.weights()[0] > set.weights()[1]);
    }

    #[test]
    fn fixed_weights_ignore_feedback() {
        let specs = vec![gaussian_spec(1.0), gaussian_spec(1.0)];
        let mut set = ProposalSet::build(&specs, 2, false);
        for _ in 0..600 {
            set.observe(0, true, true);
            set.observe(1, false, true);
        }
        assert_eq!(set.weights(), &[0.5, 0.5]);
    }
}
