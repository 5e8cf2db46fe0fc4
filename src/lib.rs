//! Parallel-tempered MCMC for Bayesian inference.
//!
//! A fixed set of chains explores the same unnormalized posterior, each
//! tempered by its own inverse temperature, with periodic full-state swaps
//! between temperature-adjacent chains. Sampling jobs and swap jobs run on
//! two cooperating worker pools; a pairing coordinator guarantees a chain is
//! never sampled and swapped at the same time. The temperature ladder
//! retunes itself from observed swap acceptance rates, and both serial and
//! FFT autocorrelation estimators report effective sample sizes.
//!
//! Fixed-dimension and reversible-jump (trans-dimensional) parameter spaces
//! are supported; the posterior is supplied as two opaque scoring functions
//! through the [`Model`] trait.
//!
//! ```
//! use paratemp::{sample, Model, Position, SamplerSettings};
//!
//! struct Ring;
//!
//! impl Model for Ring {
//!     fn log_prior(&self, _position: &Position) -> f64 {
//!         0.0
//!     }
//!     fn log_likelihood(&self, position: &Position) -> f64 {
//!         let r = position.params().iter().map(|x| x * x).sum::<f64>().sqrt();
//!         -0.5 * (r - 2.0).powi(2) / 0.1
//!     }
//!     fn max_dim(&self) -> usize {
//!         2
//!     }
//! }
//!
//! let settings = SamplerSettings {
//!     n_chains: 4,
//!     generations: 20,
//!     steps_per_generation: 25,
//!     sample_threads: 2,
//!     seed: 1,
//!     ..SamplerSettings::default()
//! };
//! let output = sample(Ring, settings).unwrap();
//! assert_eq!(output.cold_chain().len(), 20 * 25 + 1);
//! ```

pub(crate) mod chain;
pub(crate) mod coordinator;
pub(crate) mod pool;

pub mod autocorr;
pub mod diff_evolution;
pub mod fisher;
pub mod gaussian;
pub mod kde;
pub mod ladder;
pub mod layer_jump;
pub mod model;
pub mod position;
pub mod proposal;
pub mod sampler;
pub mod store;

pub use model::Model;
pub use position::Position;
pub use proposal::{Proposal, ProposalCtx, ProposalKind, ProposalSpec, Proposed};
pub use sampler::{
    sample, ChainStatus, ConfigError, PairStatus, ProposalStatus, RunOutput, Sampler,
    SamplerError, SamplerSettings, SamplerStatus,
};
pub use store::{ChainHistory, PairStats, SnapshotBoard, SwapRecord};
