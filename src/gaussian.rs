use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::position::Position;
use crate::proposal::{Proposal, ProposalCtx, Proposed};

#[derive(Debug, Clone, Copy)]
pub struct GaussianSettings {
    /// Initial step width for every dimension.
    pub initial_width: f64,
    /// Acceptance rate the width adaptation steers toward.
    pub target_accept: f64,
    /// Log-scale adaptation step per observed outcome.
    pub adapt_rate: f64,
}

impl Default for GaussianSettings {
    fn default() -> Self {
        Self {
            initial_width: 1.0,
            target_accept: 0.234,
            adapt_rate: 0.1,
        }
    }
}

/// Random-walk move on a single randomly chosen live dimension.
///
/// Symmetric, so the ratio adjustment is always zero. Each dimension keeps
/// its own step width; after every outcome the width of the last perturbed
/// dimension moves up on accept and down on reject, with the two factors
/// balanced so the width is stationary at `target_accept`. Widths freeze once
/// the chain leaves its adaptation window.
pub struct GaussianProposal {
    widths: Vec<f64>,
    last_dim: usize,
    grow: f64,
    shrink: f64,
}

const WIDTH_MIN: f64 = 1e-12;
const WIDTH_MAX: f64 = 1e12;

impl GaussianProposal {
    pub fn new(max_dim: usize, settings: GaussianSettings) -> Self {
        Self {
            widths: vec![settings.initial_width; max_dim],
            last_dim: 0,
            grow: (settings.adapt_rate * (1.0 - settings.target_accept)).exp(),
            shrink: (-settings.adapt_rate * settings.target_accept).exp(),
        }
    }

    pub fn widths(&self) -> &[f64] {
        &self.widths
    }
}

impl Proposal for GaussianProposal {
    fn kind(&self) -> &'static str {
        "gaussian"
    }

    fn propose(
        &mut self,
        _ctx: &ProposalCtx<'_>,
        current: &Position,
        rng: &mut ChaCha8Rng,
    ) -> Proposed {
        let dim = current.dim();
        if dim == 0 {
            return Proposed::stay(current);
        }
        // Pick the n-th live dimension, mapped through the activity mask.
        let pick = rng.random_range(0..dim);
        let index = current
            .active_indices()
            .nth(pick)
            .expect("picked index is within the live count");

        let mut proposed = current.clone();
        proposed.clear_scores();
        let step: f64 = rng.sample::<f64, _>(StandardNormal) * self.widths[index];
        proposed.set(index, proposed.get(index) + step);
        self.last_dim = index;
        Proposed::symmetric(proposed)
    }

    fn observe(&mut self, accepted: bool, adapting: bool) {
        if !adapting {
            return;
        }
        let factor = if accepted { self.grow } else { self.shrink };
        let width = &mut self.widths[self.last_dim];
        *width = (*width * factor).clamp(WIDTH_MIN, WIDTH_MAX);
    }
}
