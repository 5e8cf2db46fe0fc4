/// The ordered inverse-temperature schedule and its adaptation.
///
/// Betas decrease strictly from exactly 1.0 (the cold, untempered chain)
/// toward the hot end. Only the orchestrator mutates the ladder, and only at
/// generation barriers; workers read the betas copied into their chains.
#[derive(Debug, Clone)]
pub struct TemperatureLadder {
    betas: Vec<f64>,
    target_accept: f64,
    t0: f64,
    nu: f64,
    adaptations: u64,
}

/// The decaying adaptation timescale: `kappa(t) = t0 / (nu * (t + t0))`.
///
/// Early generations move the ladder aggressively; the step size decays
/// hyperbolically so the schedule converges instead of oscillating.
pub fn dynamical_timescale(t0: f64, nu: f64, t: u64) -> f64 {
    t0 / (nu * (t as f64 + t0))
}

impl TemperatureLadder {
    /// Build from an explicit schedule. The caller (settings validation)
    /// guarantees a strictly decreasing schedule starting at 1.0.
    pub fn new(betas: Vec<f64>, target_accept: f64, t0: f64, nu: f64) -> Self {
        debug_assert!(betas.first().map(|b| *b == 1.0).unwrap_or(false));
        debug_assert!(betas.windows(2).all(|w| w[1] < w[0] && w[1] > 0.0));
        Self {
            betas,
            target_accept,
            t0,
            nu,
            adaptations: 0,
        }
    }

    /// Geometric spacing from 1.0 down to `beta_min`, the default schedule
    /// when the caller supplies none.
    pub fn geometric(n_chains: usize, beta_min: f64) -> Vec<f64> {
        assert!(n_chains > 0);
        assert!(beta_min > 0.0 && beta_min < 1.0);
        if n_chains == 1 {
            return vec![1.0];
        }
        let ratio = beta_min.powf(1.0 / (n_chains as f64 - 1.0));
        let mut betas = Vec::with_capacity(n_chains);
        let mut beta = 1.0;
        for _ in 0..n_chains {
            betas.push(beta);
            beta *= ratio;
        }
        betas[0] = 1.0;
        betas
    }

    pub fn len(&self) -> usize {
        self.betas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.betas.is_empty()
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn beta(&self, rung: usize) -> f64 {
        self.betas[rung]
    }

    pub fn adaptations(&self) -> u64 {
        self.adaptations
    }

    /// Retune the spacing from the observed swap acceptance rate of each
    /// adjacent pair (`rates[i]` belongs to the pair of rungs `i` and
    /// `i + 1`; `None` where no swap was attempted since the last round).
    ///
    /// Gaps move in log-temperature space: a pair accepting more often than
    /// the target drifts apart, a pair below target is pulled together, with
    /// the step damped by the decaying timescale. The ladder is rebuilt from
    /// the gaps, so ordering survives any number of rounds and the cold beta
    /// stays exactly 1.0.
    pub fn adapt(&mut self, rates: &[Option<f64>], generation: u64) {
        debug_assert_eq!(rates.len() + 1, self.betas.len());
        if self.betas.len() < 2 {
            return;
        }
        let kappa = dynamical_timescale(self.t0, self.nu, generation);

        let mut log_gaps: Vec<f64> = self
            .betas
            .windows(2)
            .map(|w| (1.0 / w[1] - 1.0 / w[0]).ln())
            .collect();
        for (gap, rate) in log_gaps.iter_mut().zip(rates) {
            if let Some(rate) = rate {
                *gap += kappa * (rate - self.target_accept);
            }
        }

        let mut temperature = 1.0;
        for (rung, gap) in log_gaps.iter().enumerate() {
            temperature += gap.exp();
            self.betas[rung + 1] = 1.0 / temperature;
        }
        self.adaptations += 1;
    }
}
