use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::position::Position;

/// Append-only record of everything one chain has visited.
///
/// Owned exclusively by the chain's in-flight job during sampling; status
/// queries and diagnostics take the read side of the surrounding `RwLock`.
/// Entries are addressable by step index, parallel across the three vectors.
#[derive(Debug, Clone)]
pub struct ChainHistory {
    positions: Vec<Position>,
    log_priors: Vec<f64>,
    log_likelihoods: Vec<f64>,
    /// Accept / reject counts per proposal slot, indexed like the chain's
    /// proposal set.
    accepts: Vec<u64>,
    rejects: Vec<u64>,
    /// Running mean wall-clock cost of one proposal + scoring round, per
    /// proposal slot.
    mean_step_secs: Vec<f64>,
    /// Step indices at which a swap replaced the current position.
    swap_points: Vec<usize>,
    swap_accepts: u64,
    swap_rejects: u64,
    scoring_failures: u64,
    dimension_rejects: u64,
}

impl ChainHistory {
    pub(crate) fn new(n_proposals: usize) -> Self {
        Self {
            positions: Vec::new(),
            log_priors: Vec::new(),
            log_likelihoods: Vec::new(),
            accepts: vec![0; n_proposals],
            rejects: vec![0; n_proposals],
            mean_step_secs: vec![0f64; n_proposals],
            swap_points: Vec::new(),
            swap_accepts: 0,
            swap_rejects: 0,
            scoring_failures: 0,
            dimension_rejects: 0,
        }
    }

    pub(crate) fn append(&mut self, position: Position) {
        debug_assert!(position.scored());
        self.log_priors.push(position.log_prior());
        self.log_likelihoods.push(position.log_likelihood());
        self.positions.push(position);
    }

    pub(crate) fn record_outcome(&mut self, proposal: usize, accepted: bool, elapsed: Duration) {
        let attempts = (self.accepts[proposal] + self.rejects[proposal]) as f64;
        let mean = &mut self.mean_step_secs[proposal];
        *mean = (*mean * attempts + elapsed.as_secs_f64()) / (attempts + 1.0);
        if accepted {
            self.accepts[proposal] += 1;
        } else {
            self.rejects[proposal] += 1;
        }
    }

    pub(crate) fn record_swap(&mut self, accepted: bool) {
        if accepted {
            self.swap_accepts += 1;
            self.swap_points.push(self.len().saturating_sub(1));
        } else {
            self.swap_rejects += 1;
        }
    }

    pub(crate) fn record_scoring_failure(&mut self) {
        self.scoring_failures += 1;
    }

    pub(crate) fn record_dimension_reject(&mut self) {
        self.dimension_rejects += 1;
    }

    /// Number of stored steps.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn position(&self, step: usize) -> &Position {
        &self.positions[step]
    }

    pub fn log_priors(&self) -> &[f64] {
        &self.log_priors
    }

    pub fn log_likelihoods(&self) -> &[f64] {
        &self.log_likelihoods
    }

    /// One parameter's trajectory, `NaN` where the parameter was inactive.
    pub fn parameter_series(&self, index: usize) -> Vec<f64> {
        self.positions
            .iter()
            .map(|p| {
                if p.is_active(index) {
                    p.get(index)
                } else {
                    f64::NAN
                }
            })
            .collect()
    }

    pub fn accepts(&self) -> &[u64] {
        &self.accepts
    }

    pub fn rejects(&self) -> &[u64] {
        &self.rejects
    }

    pub fn mean_step_secs(&self) -> &[f64] {
        &self.mean_step_secs
    }

    pub fn swap_points(&self) -> &[usize] {
        &self.swap_points
    }

    pub fn swap_counts(&self) -> (u64, u64) {
        (self.swap_accepts, self.swap_rejects)
    }

    pub fn scoring_failures(&self) -> u64 {
        self.scoring_failures
    }

    pub fn dimension_rejects(&self) -> u64 {
        self.dimension_rejects
    }
}

/// Published current positions, one slot per chain.
///
/// A sampling job replaces its chain's `Arc` after every step, so readers on
/// other chains (the differential-evolution proposals) always see a complete,
/// immutable position and never block the writer for longer than the pointer
/// swap.
pub struct SnapshotBoard {
    slots: Vec<RwLock<Arc<Position>>>,
}

impl SnapshotBoard {
    pub(crate) fn new(initial: Vec<Position>) -> Self {
        Self {
            slots: initial
                .into_iter()
                .map(|p| RwLock::new(Arc::new(p)))
                .collect(),
        }
    }

    pub(crate) fn publish(&self, chain: usize, position: Arc<Position>) {
        *self.slots[chain].write().expect("poisoned snapshot slot") = position;
    }

    pub fn read(&self, chain: usize) -> Arc<Position> {
        Arc::clone(&self.slots[chain].read().expect("poisoned snapshot slot"))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Outcome of one attempted swap between temperature-adjacent chains.
///
/// Transient: consumed into the pair statistics and chain histories. Kept
/// reproducible — `log_accept_ratio` must equal
/// `(beta_colder - beta_hotter) * (log_likelihood_hotter - log_likelihood_colder)`
/// and the outcome must match `draw < exp(log_accept_ratio)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwapRecord {
    pub colder: usize,
    pub hotter: usize,
    pub beta_colder: f64,
    pub beta_hotter: f64,
    pub log_likelihood_colder: f64,
    pub log_likelihood_hotter: f64,
    pub log_accept_ratio: f64,
    pub draw: f64,
    pub accepted: bool,
}

/// Swap acceptance tallies for one temperature-adjacent pair: cumulative for
/// reporting plus a window since the last ladder adaptation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PairStats {
    pub attempts: u64,
    pub accepts: u64,
    pub window_attempts: u64,
    pub window_accepts: u64,
}

impl PairStats {
    pub(crate) fn record(&mut self, accepted: bool) {
        self.attempts += 1;
        self.window_attempts += 1;
        if accepted {
            self.accepts += 1;
            self.window_accepts += 1;
        }
    }

    /// Acceptance rate over the adaptation window, `None` when no swap was
    /// attempted since the last reset.
    pub(crate) fn take_window_rate(&mut self) -> Option<f64> {
        if self.window_attempts == 0 {
            return None;
        }
        let rate = self.window_accepts as f64 / self.window_attempts as f64;
        self.window_attempts = 0;
        self.window_accepts = 0;
        Some(rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn scored(params: &[f64]) -> Position {
        let mut pos = Position::new(params.len());
        pos.params_mut().copy_from_slice(params);
        pos.set_scores(-1.0, -2.0);
        pos
    }

    #[test]
    fn history_keeps_parallel_series() {
        let mut history = ChainHistory::new(2);
        history.append(scored(&[1.0, 2.0]));
        history.append(scored(&[3.0, 4.0]));
        assert_eq!(history.len(), 2);
        assert_eq!(history.log_priors(), &[-1.0, -1.0]);
        assert_eq!(history.parameter_series(1), vec![2.0, 4.0]);
    }

    #[test]
    fn outcome_counters_and_timing_mean() {
        let mut history = ChainHistory::new(1);
        history.record_outcome(0, true, Duration::from_secs_f64(1.0));
        history.record_outcome(0, false, Duration::from_secs_f64(3.0));
        assert_eq!(history.accepts(), &[1]);
        assert_eq!(history.rejects(), &[1]);
        assert!((history.mean_step_secs()[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn snapshot_board_swaps_whole_arcs() {
        let board = SnapshotBoard::new(vec![scored(&[0.0]), scored(&[1.0])]);
        let before = board.read(1);
        board.publish(1, Arc::new(scored(&[9.0])));
        assert_eq!(before.get(0), 1.0);
        assert_eq!(board.read(1).get(0), 9.0);
    }

    #[test]
    fn pair_window_resets_after_read() {
        let mut stats = PairStats::default();
        stats.record(true);
        stats.record(false);
        assert_eq!(stats.take_window_rate(), Some(0.5));
        assert_eq!(stats.take_window_rate(), None);
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.accepts, 1);
    }
}
