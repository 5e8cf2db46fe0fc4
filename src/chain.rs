use std::sync::{Arc, RwLock};
use std::time::Instant;

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::model::Model;
use crate::position::Position;
use crate::proposal::{ProposalCtx, ProposalSet};
use crate::store::{ChainHistory, SnapshotBoard, SwapRecord};
use crate::SamplerError;

/// One tempered MCMC trajectory.
///
/// A chain's current position is owned by whichever job (sampling or swap)
/// holds its mutex; the pair coordinator guarantees those never overlap. The
/// chain index doubles as the ladder rung, so adjacency in index is
/// adjacency in temperature.
pub(crate) struct Chain<M: Model> {
    pub id: usize,
    pub beta: f64,
    pub current: Position,
    pub rng: ChaCha8Rng,
    pub proposals: ProposalSet,
    pub adapting: bool,
    pub steps: u64,
    model: Arc<M>,
}

/// Everything a step needs beyond the chain's own state.
pub(crate) struct StepEnv<'a> {
    pub n_chains: usize,
    pub min_dim: usize,
    pub max_dim: usize,
    pub bounds: Option<&'a [(f64, f64)]>,
    pub snapshots: &'a SnapshotBoard,
    pub history: &'a RwLock<ChainHistory>,
}

/// Attempts before giving up on finding a scorable initial position.
const INIT_TRIES: usize = 500;

enum StepOutcome {
    Accepted,
    Rejected,
    DimensionReject,
    ScoringFailure,
}

impl<M: Model> Chain<M> {
    pub(crate) fn new(
        id: usize,
        beta: f64,
        current: Position,
        rng: ChaCha8Rng,
        proposals: ProposalSet,
        model: Arc<M>,
    ) -> Self {
        Self {
            id,
            beta,
            current,
            rng,
            proposals,
            adapting: true,
            steps: 0,
            model,
        }
    }

    /// Score an initial position (re-drawing until the model accepts one),
    /// append it as step zero, and publish the first snapshot.
    pub(crate) fn init(&mut self, env: &StepEnv<'_>) -> Result<(), SamplerError> {
        for _ in 0..INIT_TRIES {
            self.model
                .init_position(&mut self.rng, &mut self.current)
                .map_err(|source| SamplerError::InitFailed {
                    chain: self.id,
                    source,
                })?;
            let log_prior = self.model.log_prior(&self.current);
            if !log_prior.is_finite() {
                continue;
            }
            let log_likelihood = self.model.log_likelihood(&self.current);
            if !log_likelihood.is_finite() {
                continue;
            }
            self.current.set_scores(log_prior, log_likelihood);
            env.history
                .write()
                .expect("poisoned chain history")
                .append(self.current.clone());
            env.snapshots.publish(self.id, Arc::new(self.current.clone()));
            return Ok(());
        }
        Err(SamplerError::BadInitialPosition { chain: self.id })
    }

    /// Run `steps` Metropolis-Hastings iterations.
    pub(crate) fn advance(&mut self, steps: u64, env: &StepEnv<'_>) {
        for _ in 0..steps {
            self.step(env);
        }
    }

    /// One Metropolis-Hastings iteration: select a proposal, build a fresh
    /// candidate, guard its dimension, score it, and accept or reject.
    /// The history lock is only taken for the final bookkeeping so status
    /// readers never wait on a likelihood evaluation.
    fn step(&mut self, env: &StepEnv<'_>) {
        let started = Instant::now();
        let index = self.proposals.select(&mut self.rng);
        let ctx = ProposalCtx {
            chain: self.id,
            n_chains: env.n_chains,
            beta: self.beta,
            min_dim: env.min_dim,
            max_dim: env.max_dim,
            bounds: env.bounds,
            snapshots: env.snapshots,
            adapting: self.adapting,
        };
        let proposed = self.proposals.propose(index, &ctx, &self.current, &mut self.rng);
        let adjustment = proposed.log_ratio_adjustment;
        let mut candidate = proposed.position;

        let outcome = if candidate.dim() < env.min_dim || candidate.dim() > env.max_dim {
            StepOutcome::DimensionReject
        } else {
            self.evaluate(&mut candidate, adjustment)
        };

        let accepted = matches!(outcome, StepOutcome::Accepted);
        if accepted {
            self.current = candidate;
            self.proposals.record_sample(&self.current);
        }
        self.proposals.observe(index, accepted, self.adapting);

        {
            let mut history = env.history.write().expect("poisoned chain history");
            match outcome {
                StepOutcome::DimensionReject => history.record_dimension_reject(),
                StepOutcome::ScoringFailure => history.record_scoring_failure(),
                _ => {}
            }
            history.record_outcome(index, accepted, started.elapsed());
            history.append(self.current.clone());
        }
        env.snapshots.publish(self.id, Arc::new(self.current.clone()));
        self.steps += 1;
    }

    /// Score the candidate (reusing cached scores for degenerate re-proposals
    /// of the current state) and apply the tempered acceptance test.
    fn evaluate(&mut self, candidate: &mut Position, adjustment: f64) -> StepOutcome {
        if !candidate.scored() {
            let log_prior = self.model.log_prior(candidate);
            if log_prior.is_nan() || log_prior == f64::INFINITY {
                return StepOutcome::ScoringFailure;
            }
            if log_prior == f64::NEG_INFINITY {
                return StepOutcome::Rejected;
            }
            let log_likelihood = self.model.log_likelihood(candidate);
            if log_likelihood.is_nan() || log_likelihood == f64::INFINITY {
                return StepOutcome::ScoringFailure;
            }
            candidate.set_scores(log_prior, log_likelihood);
        }

        let log_mh = (candidate.log_likelihood() - self.current.log_likelihood()) * self.beta
            + candidate.log_prior()
            - self.current.log_prior()
            + adjustment;
        if self.rng.random::<f64>().ln() <= log_mh {
            StepOutcome::Accepted
        } else {
            StepOutcome::Rejected
        }
    }
}

/// Attempt a full-state exchange between two temperature-adjacent chains.
///
/// Accept probability `min(1, exp((beta_c - beta_h) * (logL_h - logL_c)))`;
/// on accept the chains exchange current positions (scores travel with
/// them), never their identity or beta.
pub(crate) fn attempt_swap<M: Model>(colder: &mut Chain<M>, hotter: &mut Chain<M>) -> SwapRecord {
    let log_likelihood_colder = colder.current.log_likelihood();
    let log_likelihood_hotter = hotter.current.log_likelihood();
    let beta_colder = colder.beta;
    let beta_hotter = hotter.beta;

    // Equal temperatures would always swap; treat as a no-op.
    let degenerate = (beta_colder - beta_hotter).abs() / (beta_colder.abs() + beta_hotter.abs())
        < 1e-15;

    let log_accept_ratio =
        (beta_colder - beta_hotter) * (log_likelihood_hotter - log_likelihood_colder);
    let draw = colder.rng.random::<f64>();
    let accepted = !degenerate && draw < log_accept_ratio.exp();

    if accepted {
        std::mem::swap(&mut colder.current, &mut hotter.current);
    }

    SwapRecord {
        colder: colder.id,
        hotter: hotter.id,
        beta_colder,
        beta_hotter,
        log_likelihood_colder,
        log_likelihood_hotter,
        log_accept_ratio,
        draw,
        accepted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gaussian::GaussianSettings;
    use crate::model::test_models::NormalModel;
    use crate::proposal::{ProposalKind, ProposalSpec};
    use rand::SeedableRng;

    fn test_chain(id: usize, beta: f64, dim: usize) -> Chain<NormalModel> {
        let model = Arc::new(NormalModel { dim, mu: 0.0 });
        let proposals = ProposalSet::build(
            &[ProposalSpec::new(
                ProposalKind::Gaussian(GaussianSettings::default()),
                1.0,
            )],
            dim,
            false,
        );
        Chain::new(
            id,
            beta,
            Position::new(dim),
            ChaCha8Rng::seed_from_u64(42 + id as u64),
            proposals,
            model,
        )
    }

    fn env<'a>(
        snapshots: &'a SnapshotBoard,
        history: &'a RwLock<ChainHistory>,
        dim: usize,
    ) -> StepEnv<'a> {
        StepEnv {
            n_chains: 1,
            min_dim: 0,
            max_dim: dim,
            bounds: None,
            snapshots,
            history,
        }
    }

    #[test]
    fn stepping_appends_history_and_mixes() {
        let mut chain = test_chain(0, 1.0, 2);
        let snapshots = SnapshotBoard::new(vec![Position::new(2)]);
        let history = RwLock::new(ChainHistory::new(1));
        let env = env(&snapshots, &history, 2);

        chain.init(&env).unwrap();
        chain.advance(500, &env);

        let history = history.read().unwrap();
        assert_eq!(history.len(), 501);
        assert_eq!(chain.steps, 500);
        let accepts = history.accepts()[0];
        assert!(accepts > 50, "chain barely moved: {accepts} accepts");
        // The published snapshot tracks the current position.
        assert_eq!(*snapshots.read(0), chain.current);
    }

    #[test]
    fn swap_record_is_reproducible() {
        let mut colder = test_chain(0, 1.0, 2);
        let mut hotter = test_chain(1, 0.5, 2);
        colder.current.set_scores(0.0, -4.0);
        hotter.current.set_scores(0.0, -1.0);

        let record = attempt_swap(&mut colder, &mut hotter);
        let expected =
            (record.beta_colder - record.beta_hotter)
                * (record.log_likelihood_hotter - record.log_likelihood_colder);
        assert_eq!(record.log_accept_ratio, expected);
        assert_eq!(record.accepted, record.draw < expected.exp());
        // Hotter chain has the better likelihood: ratio > 0, always accepted.
        assert!(record.accepted);
        assert_eq!(colder.current.log_likelihood(), -1.0);
        assert_eq!(hotter.current.log_likelihood(), -4.0);
        // Betas stay with the rung.
        assert_eq!(colder.beta, 1.0);
        assert_eq!(hotter.beta, 0.5);
    }

    #[test]
    fn nan_scores_count_as_scoring_failures() {
        struct BrokenModel;
        impl Model for BrokenModel {
            fn log_prior(&self, _position: &Position) -> f64 {
                0.0
            }
            fn log_likelihood(&self, _position: &Position) -> f64 {
                f64::NAN
            }
            fn max_dim(&self) -> usize {
                1
            }
        }

        let proposals = ProposalSet::build(
            &[ProposalSpec::new(
                ProposalKind::Gaussian(GaussianSettings::default()),
                1.0,
            )],
            1,
            false,
        );
        let mut chain = Chain::new(
            0,
            1.0,
            Position::new(1),
            ChaCha8Rng::seed_from_u64(0),
            proposals,
            Arc::new(BrokenModel),
        );
        // Hand the chain a scored starting point so only proposals fail.
        chain.current.set_scores(0.0, -1.0);
        let snapshots = SnapshotBoard::new(vec![Position::new(1)]);
        let history = RwLock::new(ChainHistory::new(1));
        let env = env(&snapshots, &history, 1);

        chain.advance(20, &env);
        let history = history.read().unwrap();
        assert_eq!(history.scoring_failures(), 20);
        assert_eq!(history.accepts()[0], 0);
        // The chain never crashed and kept appending its current state.
        assert_eq!(history.len(), 20);
    }
}
