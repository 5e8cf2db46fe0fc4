use anyhow::Result;
use rand::Rng;

use crate::position::Position;

/// The caller-supplied posterior, split into prior and likelihood terms.
///
/// Both scores are unnormalized log densities over [`Position`]s. The sampler
/// treats non-finite scores as rejections, never as fatal errors: a prior of
/// `-inf` marks a point outside the support, and a `NaN` (or `+inf`) from
/// either term is counted as a scoring failure against the chain.
///
/// Implementations must be cheap to share: one instance is read concurrently
/// by every sampling worker.
pub trait Model: Send + Sync + 'static {
    /// Log prior density of `position`, using only its live parameters.
    fn log_prior(&self, position: &Position) -> f64;

    /// Log likelihood of `position`, using only its live parameters.
    ///
    /// Only called after `log_prior` returned a finite value.
    fn log_likelihood(&self, position: &Position) -> f64;

    /// Draw an initial position for a chain. The default leaves the zero
    /// vector in place. Errors here are structural (a broken data source,
    /// not a bad point) and abort the run before sampling starts.
    fn init_position<R: Rng + ?Sized>(&self, _rng: &mut R, _position: &mut Position) -> Result<()> {
        Ok(())
    }

    /// Width of the parameter vector (the maximum dimension for
    /// trans-dimensional models).
    fn max_dim(&self) -> usize;
}

#[cfg(test)]
pub(crate) mod test_models {
    use super::*;

    /// Independent standard normal likelihood around `mu`, flat prior.
    #[derive(Clone, Debug)]
    pub struct NormalModel {
        pub dim: usize,
        pub mu: f64,
    }

    impl Model for NormalModel {
        fn log_prior(&self, _position: &Position) -> f64 {
            0.0
        }

        fn log_likelihood(&self, position: &Position) -> f64 {
            position
                .active_indices()
                .map(|i| {
                    let val = position.get(i) - self.mu;
                    -0.5 * val * val
                })
                .sum()
        }

        fn init_position<R: Rng + ?Sized>(&self, rng: &mut R, position: &mut Position) -> Result<()> {
            for i in 0..position.max_dim() {
                position.set(i, rng.random::<f64>() - 0.5);
            }
            Ok(())
        }

        fn max_dim(&self) -> usize {
            self.dim
        }
    }
}
