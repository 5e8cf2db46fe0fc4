use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::position::Position;
use crate::proposal::{Proposal, ProposalCtx, Proposed};

/// Shared knobs of the reversible-jump layer proposals.
#[derive(Debug, Clone, Copy)]
pub struct LayerSettings {
    /// Probability of proposing a birth (a death otherwise).
    pub birth_prob: f64,
    /// Parameters per layer; a whole layer switches on or off at once.
    pub layer_width: usize,
}

impl Default for LayerSettings {
    fn default() -> Self {
        Self {
            birth_prob: 0.5,
            layer_width: 1,
        }
    }
}

/// Draw a birth value for parameter `index` and return the log proposal
/// density correction for it.
fn draw_birth_value(
    index: usize,
    bounds: Option<&[(f64, f64)]>,
    rng: &mut ChaCha8Rng,
) -> (f64, f64) {
    match bounds {
        Some(bounds) => {
            let (low, high) = bounds[index];
            let value = rng.random::<f64>() * (high - low) + low;
            (value, (high - low).ln())
        }
        None => (rng.random::<f64>(), 0.0),
    }
}

fn death_correction(index: usize, bounds: Option<&[(f64, f64)]>) -> f64 {
    match bounds {
        Some(bounds) => {
            let (low, high) = bounds[index];
            -(high - low).ln()
        }
        None => 0.0,
    }
}

/// Birth/death of the boundary layer.
///
/// The live set is treated as a prefix of the parameter vector: a birth
/// switches on the next `layer_width` parameters after the current boundary,
/// a death switches off the last live layer. New parameters are drawn
/// uniformly over the configured bounds; the returned adjustment carries the
/// dimension-matching term for the uniform draws plus the
/// `log((1 - alpha)/alpha)` move-probability imbalance. Moves that would
/// leave `[min_dim, max_dim]` degenerate to re-proposing the current state.
pub struct SequentialLayerJump {
    settings: LayerSettings,
}

impl SequentialLayerJump {
    pub fn new(settings: LayerSettings) -> Self {
        Self { settings }
    }
}

impl Proposal for SequentialLayerJump {
    fn kind(&self) -> &'static str {
        "sequential-layer"
    }

    fn propose(
        &mut self,
        ctx: &ProposalCtx<'_>,
        current: &Position,
        rng: &mut ChaCha8Rng,
    ) -> Proposed {
        if !current.is_trans_dimensional() {
            return Proposed::stay(current);
        }
        let width = self.settings.layer_width;
        let alpha = self.settings.birth_prob;
        let dim = current.dim();

        // The boundary sits just past the highest live index, so the
        // sequential moves stay well defined even when another proposal
        // family has punched holes into the live set.
        let boundary = current.active_indices().last().map_or(0, |i| i + 1);

        if rng.random::<f64>() < alpha {
            // Birth at the boundary.
            if dim + width > ctx.max_dim || boundary + width > ctx.max_dim {
                return Proposed::stay(current);
            }
            let mut proposed = current.clone();
            proposed.clear_scores();
            let mut adjustment = ((1.0 - alpha) / alpha).ln();
            for index in boundary..boundary + width {
                let (value, correction) = draw_birth_value(index, ctx.bounds, rng);
                proposed.set_active(index, true);
                proposed.set(index, value);
                adjustment += correction;
            }
            Proposed {
                position: proposed,
                log_ratio_adjustment: adjustment,
            }
        } else {
            // Death of the highest live layer.
            if dim < width || dim - width < ctx.min_dim {
                return Proposed::stay(current);
            }
            let doomed: Vec<usize> = current.active_indices().collect();
            let mut proposed = current.clone();
            proposed.clear_scores();
            let mut adjustment = (alpha / (1.0 - alpha)).ln();
            for &index in &doomed[dim - width..] {
                proposed.set_active(index, false);
                proposed.set(index, 0.0);
                adjustment += death_correction(index, ctx.bounds);
            }
            Proposed {
                position: proposed,
                log_ratio_adjustment: adjustment,
            }
        }
    }
}

/// Birth/death of a randomly chosen layer.
///
/// The parameter vector is partitioned into layers of `layer_width`; a birth
/// activates any fully-inactive layer, a death deactivates any fully-active
/// layer outside the protected `min_dim` prefix. Same corrections and
/// boundary behavior as the sequential variant.
pub struct RandomLayerJump {
    settings: LayerSettings,
}

impl RandomLayerJump {
    pub fn new(settings: LayerSettings) -> Self {
        Self { settings }
    }

    fn layer_is_active(position: &Position, layer: usize, width: usize) -> bool {
        (layer * width..(layer + 1) * width).all(|i| position.is_active(i))
    }

    fn layer_is_inactive(position: &Position, layer: usize, width: usize) -> bool {
        (layer * width..(layer + 1) * width).all(|i| !position.is_active(i))
    }
}

impl Proposal for RandomLayerJump {
    fn kind(&self) -> &'static str {
        "random-layer"
    }

    fn propose(
        &mut self,
        ctx: &ProposalCtx<'_>,
        current: &Position,
        rng: &mut ChaCha8Rng,
    ) -> Proposed {
        if !current.is_trans_dimensional() {
            return Proposed::stay(current);
        }
        let width = self.settings.layer_width;
        let alpha = self.settings.birth_prob;
        let n_layers = ctx.max_dim / width;
        let protected = ctx.min_dim / width;
        let dim = current.dim();

        if rng.random::<f64>() < alpha {
            if dim + width > ctx.max_dim {
                return Proposed::stay(current);
            }
            let candidates: Vec<usize> = (0..n_layers)
                .filter(|l| Self::layer_is_inactive(current, *l, width))
                .collect();
            let Some(&layer) = candidates.get(rng.random_range(0..candidates.len().max(1))) else {
                return Proposed::stay(current);
            };
            let mut proposed = current.clone();
            proposed.clear_scores();
            let mut adjustment = ((1.0 - alpha) / alpha).ln();
            for index in layer * width..(layer + 1) * width {
                let (value, correction) = draw_birth_value(index, ctx.bounds, rng);
                proposed.set_active(index, true);
                proposed.set(index, value);
                adjustment += correction;
            }
            Proposed {
                position: proposed,
                log_ratio_adjustment: adjustment,
            }
        } else {
            if dim < width || dim - width < ctx.min_dim {
                return Proposed::stay(current);
            }
            let candidates: Vec<usize> = (protected..n_layers)
                .filter(|l| Self::layer_is_active(current, *l, width))
                .collect();
            let Some(&layer) = candidates.get(rng.random_range(0..candidates.len().max(1))) else {
                return Proposed::stay(current);
            };
            let mut proposed = current.clone();
            proposed.clear_scores();
            let mut adjustment = (alpha / (1.0 - alpha)).ln();
            for index in layer * width..(layer + 1) * width {
                proposed.set_active(index, false);
                proposed.set(index, 0.0);
                adjustment += death_correction(index, ctx.bounds);
            }
            Proposed {
                position: proposed,
                log_ratio_adjustment: adjustment,
            }
        }
    }
}
