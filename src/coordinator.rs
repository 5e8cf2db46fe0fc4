use std::sync::{Condvar, Mutex};

/// Pairing state for swap scheduling.
///
/// All eligibility bookkeeping lives behind one mutex so the
/// match-and-flag-update sequence is a single critical section: find an
/// eligible, un-paired, temperature-adjacent partner; mark both pre-paired;
/// clear both eligibility flags; hand the pair out for dispatch. Nothing
/// outside this module ever sees a half-paired state.
///
/// A chain waiting for a partner holds no lock; it is simply not
/// re-dispatched for sampling until matched or drained at the generation
/// barrier.
pub struct PairCoordinator {
    state: Mutex<PairingState>,
}

struct PairingState {
    eligible: Vec<bool>,
    pre_paired: Vec<bool>,
}

impl PairingState {
    fn check(&self, chain: usize) {
        debug_assert!(
            !(self.eligible[chain] && self.pre_paired[chain]),
            "chain {chain} both eligible and pre-paired"
        );
    }
}

impl PairCoordinator {
    /// Chains are indexed by ladder rung (0 = coldest); rung-adjacency is
    /// index-adjacency.
    pub fn new(n_chains: usize) -> Self {
        Self {
            state: Mutex::new(PairingState {
                eligible: vec![false; n_chains],
                pre_paired: vec![false; n_chains],
            }),
        }
    }

    /// Mark `chain` eligible for swapping and try to match it. On a match
    /// both chains leave the eligible set and become pre-paired, and the
    /// pair is returned for swap dispatch (colder index first); otherwise
    /// the chain stays eligible, waiting for a partner.
    ///
    /// The generation gate is updated inside the same critical section, so
    /// quiescence can never be observed between a chain becoming eligible
    /// and the gate learning about it.
    pub fn offer(&self, chain: usize, gate: &GenerationGate) -> Option<(usize, usize)> {
        let mut state = self.state.lock().expect("poisoned pairing state");
        debug_assert!(!state.pre_paired[chain], "offered while pre-paired");
        state.eligible[chain] = true;

        let partner = [chain.checked_sub(1), chain.checked_add(1)]
            .into_iter()
            .flatten()
            .find(|p| {
                *p < state.eligible.len() && state.eligible[*p] && !state.pre_paired[*p]
            });
        let Some(partner) = partner else {
            gate.parked();
            return None;
        };

        state.eligible[chain] = false;
        state.eligible[partner] = false;
        state.pre_paired[chain] = true;
        state.pre_paired[partner] = true;
        state.check(chain);
        state.check(partner);
        gate.swap_dispatched();
        Some((chain.min(partner), chain.max(partner)))
    }

    /// Clear the pre-paired flags after a swap job finished (successfully or
    /// not). Both chains become dispatchable for sampling again.
    pub fn release(&self, a: usize, b: usize) {
        let mut state = self.state.lock().expect("poisoned pairing state");
        debug_assert!(state.pre_paired[a] && state.pre_paired[b]);
        state.pre_paired[a] = false;
        state.pre_paired[b] = false;
        state.check(a);
        state.check(b);
    }

    /// Withdraw every still-unmatched eligible chain, returning them. Called
    /// at the generation barrier so an unmatched chain makes forward
    /// progress with its un-swapped state.
    pub fn drain(&self) -> Vec<usize> {
        let mut state = self.state.lock().expect("poisoned pairing state");
        let mut drained = Vec::new();
        for chain in 0..state.eligible.len() {
            if state.eligible[chain] {
                state.eligible[chain] = false;
                drained.push(chain);
            }
        }
        drained
    }

    /// True when no chain is eligible or pre-paired.
    pub fn is_quiescent(&self) -> bool {
        let state = self.state.lock().expect("poisoned pairing state");
        state.eligible.iter().all(|e| !e) && state.pre_paired.iter().all(|p| !p)
    }

    #[cfg(test)]
    fn flags(&self, chain: usize) -> (bool, bool) {
        let state = self.state.lock().expect("poisoned pairing state");
        (state.eligible[chain], state.pre_paired[chain])
    }
}

/// The per-generation drain barrier.
///
/// Each chain ends a generation in exactly one way: its sampling job
/// finished without a swap attempt (`done`), it is parked waiting for a swap
/// partner (`parked`), or its swap completed (two chains at once). The
/// orchestrator blocks until `done + parked` covers every chain with no swap
/// in flight, then drains the parked chains.
pub struct GenerationGate {
    state: Mutex<GateState>,
    quiescent: Condvar,
}

#[derive(Debug, Default, Clone, Copy)]
struct GateState {
    expected: usize,
    done: usize,
    parked: usize,
    swaps_in_flight: usize,
}

impl GenerationGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            quiescent: Condvar::new(),
        }
    }

    pub fn begin(&self, expected: usize) {
        let mut state = self.state.lock().expect("poisoned gate");
        *state = GateState {
            expected,
            ..GateState::default()
        };
    }

    /// A chain finished its sampling job and skipped the swap attempt.
    pub fn finished(&self) {
        let mut state = self.state.lock().expect("poisoned gate");
        state.done += 1;
        self.maybe_release(&state);
    }

    /// A chain offered itself for swapping and found no partner. Called by
    /// [`PairCoordinator::offer`] inside the pairing critical section.
    fn parked(&self) {
        let mut state = self.state.lock().expect("poisoned gate");
        state.parked += 1;
        self.maybe_release(&state);
    }

    /// An offer matched a parked partner and a swap job is being
    /// dispatched. Called by [`PairCoordinator::offer`] inside the pairing
    /// critical section.
    fn swap_dispatched(&self) {
        let mut state = self.state.lock().expect("poisoned gate");
        debug_assert!(state.parked > 0, "matched partner was not parked");
        state.parked -= 1;
        state.swaps_in_flight += 1;
    }

    /// A swap job finished; both chains of the pair are done.
    pub fn swap_finished(&self) {
        let mut state = self.state.lock().expect("poisoned gate");
        state.swaps_in_flight -= 1;
        state.done += 2;
        self.maybe_release(&state);
    }

    /// Block until every chain is accounted for and no swap is in flight.
    /// Returns the number of chains that ended the generation parked.
    pub fn wait_quiescent(&self) -> usize {
        let mut state = self.state.lock().expect("poisoned gate");
        while !Self::is_quiescent(&state) {
            state = self.quiescent.wait(state).expect("poisoned gate");
        }
        state.parked
    }

    fn is_quiescent(state: &GateState) -> bool {
        state.done + state.parked >= state.expected && state.swaps_in_flight == 0
    }

    fn maybe_release(&self, state: &GateState) {
        if Self::is_quiescent(state) {
            self.quiescent.notify_all();
        }
    }
}

impl Default for GenerationGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn only_adjacent_chains_match() {
        let coordinator = PairCoordinator::new(4);
        let gate = GenerationGate::new();
        gate.begin(4);
        assert_eq!(coordinator.offer(0, &gate), None);
        assert_eq!(coordinator.offer(2, &gate), None);
        // Chain 2 is adjacent to 3; chain 0 stays parked.
        assert_eq!(coordinator.offer(3, &gate), Some((2, 3)));
        assert_eq!(coordinator.drain(), vec![0]);
        assert!(!coordinator.is_quiescent());
        coordinator.release(2, 3);
        assert!(coordinator.is_quiescent());
    }

    #[test]
    fn matched_chains_cannot_double_dispatch() {
        let coordinator = PairCoordinator::new(3);
        let gate = GenerationGate::new();
        gate.begin(3);
        assert_eq!(coordinator.offer(1, &gate), None);
        assert_eq!(coordinator.offer(0, &gate), Some((0, 1)));
        // Chain 2 is adjacent to the pre-paired chain 1 but must not match it.
        assert_eq!(coordinator.offer(2, &gate), None);
        coordinator.release(0, 1);
        assert_eq!(coordinator.drain(), vec![2]);
    }

    #[test]
    fn release_restores_dispatchability() {
        let coordinator = PairCoordinator::new(2);
        let gate = GenerationGate::new();
        gate.begin(2);
        coordinator.offer(0, &gate);
        assert_eq!(coordinator.offer(1, &gate), Some((0, 1)));
        coordinator.release(0, 1);
        gate.swap_finished();
        // The same pair can match again in a later cycle.
        gate.begin(2);
        coordinator.offer(0, &gate);
        assert_eq!(coordinator.offer(1, &gate), Some((0, 1)));
    }

    #[test]
    fn gate_counts_swaps_as_two_chains() {
        let gate = GenerationGate::new();
        gate.begin(3);
        gate.parked(); // chain 1 offered, no partner yet
        gate.swap_dispatched(); // chain 2 offered and matched it
        gate.finished(); // chain 0 skipped swapping
        gate.swap_finished();
        assert_eq!(gate.wait_quiescent(), 0);
    }

    proptest! {
        /// Whatever interleaving of offers and releases happens, no chain is
        /// ever observed both eligible and pre-paired.
        #[test]
        fn eligibility_and_pairing_are_exclusive(ops in proptest::collection::vec(0usize..6, 1..60)) {
            let coordinator = PairCoordinator::new(6);
            let gate = GenerationGate::new();
            gate.begin(6);
            let mut paired: Vec<(usize, usize)> = Vec::new();
            for chain in ops {
                let busy = paired.iter().any(|(a, b)| *a == chain || *b == chain)
                    || coordinator.flags(chain).0;
                if !busy {
                    if let Some(pair) = coordinator.offer(chain, &gate) {
                        paired.push(pair);
                    }
                }
                for i in 0..6 {
                    let (eligible, pre_paired) = coordinator.flags(i);
                    prop_assert!(!(eligible && pre_paired));
                }
                if paired.len() > 1 {
                    let (a, b) = paired.remove(0);
                    coordinator.release(a, b);
                }
            }
            for (a, b) in paired {
                coordinator.release(a, b);
            }
            coordinator.drain();
            prop_assert!(coordinator.is_quiescent());
        }
    }
}
