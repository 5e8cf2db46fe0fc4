use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use itertools::Itertools;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::autocorr::history_autocorr_times;
use crate::chain::{attempt_swap, Chain, StepEnv};
use crate::coordinator::{GenerationGate, PairCoordinator};
use crate::gaussian::GaussianSettings;
use crate::kde::KdeSettings;
use crate::ladder::TemperatureLadder;
use crate::model::Model;
use crate::pool::WorkerPool;
use crate::position::Position;
use crate::proposal::{ProposalKind, ProposalSet, ProposalSpec};
use crate::store::{ChainHistory, PairStats, SnapshotBoard};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("at least one chain is required")]
    NoChains,
    #[error("temperature ladder must start at exactly 1.0 and decrease strictly toward 0")]
    BadLadder,
    #[error("ladder has {betas} betas but the sampler has {chains} chains")]
    LadderLengthMismatch { betas: usize, chains: usize },
    #[error("no proposals enabled")]
    NoProposals,
    #[error("proposal weights must be positive and finite")]
    BadProposalWeights,
    #[error("min_dim {min_dim} exceeds the model dimension {max_dim}")]
    BadDimensionRange { min_dim: usize, max_dim: usize },
    #[error("bounds cover {got} parameters but the model has {need}")]
    BadBounds { got: usize, need: usize },
    #[error("reversible-jump proposals require the reversible-jump flag")]
    LayerProposalWithoutRj,
    #[error("differential evolution needs at least 3 chains")]
    TooFewChainsForDe,
    #[error("differential evolution on a reversible-jump run needs min_dim > 0")]
    DeNeedsMinDim,
    #[error("layer width must evenly divide min_dim and max_dim")]
    BadLayerWidth,
    #[error("worker pools need at least one thread each")]
    NoThreads,
    #[error("steps_per_generation must be positive")]
    NoSteps,
    #[error("swap_probability must lie in [0, 1]")]
    BadSwapProbability,
}

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("chain {chain} could not find a scorable initial position")]
    BadInitialPosition { chain: usize },
    #[error("chain {chain} failed to generate an initial position")]
    InitFailed {
        chain: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("chain {chain} failed {faults} job(s) and was declared fatal")]
    ChainFatal { chain: usize, faults: u32 },
    #[error("sampler controller thread panicked")]
    ControllerPanicked,
}

/// Construction surface of the sampler.
#[derive(Debug, Clone)]
pub struct SamplerSettings {
    pub n_chains: usize,
    /// Explicit beta schedule; a geometric ladder down to `beta_min` is
    /// generated when absent.
    pub betas: Option<Vec<f64>>,
    pub beta_min: f64,
    /// Smallest allowed live dimension (reversible-jump runs).
    pub min_dim: usize,
    /// Whether chains carry an activity mask and may change dimension.
    pub reversible_jump: bool,
    /// Per-parameter uniform bounds used by layer births.
    pub bounds: Option<Vec<(f64, f64)>>,
    pub seed: u64,
    pub sample_threads: usize,
    pub swap_threads: usize,
    pub generations: u64,
    pub steps_per_generation: u64,
    /// Probability that a chain offers itself for swapping after each
    /// sampling job.
    pub swap_probability: f64,
    pub target_swap_accept: f64,
    /// Timescale offset of the ladder adaptation decay.
    pub adapt_t0: f64,
    /// Rate divisor of the ladder adaptation decay.
    pub adapt_nu: f64,
    pub adapt_ladder: bool,
    /// Generations during which proposal internals (and the ladder) may
    /// adapt; everything freezes afterwards.
    pub adapt_generations: u64,
    pub proposals: Vec<ProposalSpec>,
    /// Reweight proposal selection from trailing acceptance instead of
    /// keeping the configured weights fixed.
    pub adaptive_proposal_weights: bool,
    /// Worker-job failures tolerated per chain before the run is declared
    /// fatal.
    pub max_chain_faults: u32,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            n_chains: 6,
            betas: None,
            beta_min: 0.01,
            min_dim: 0,
            reversible_jump: false,
            bounds: None,
            seed: 0,
            sample_threads: 4,
            swap_threads: 1,
            generations: 200,
            steps_per_generation: 50,
            swap_probability: 1.0,
            target_swap_accept: 0.234,
            adapt_t0: 1000.0,
            adapt_nu: 10.0,
            adapt_ladder: true,
            adapt_generations: 100,
            proposals: default_proposals(),
            adaptive_proposal_weights: false,
            max_chain_faults: 3,
        }
    }
}

/// The stock fixed-dimension mix: mostly differential evolution and random
/// walks, with an occasional KDE draw.
fn default_proposals() -> Vec<ProposalSpec> {
    vec![
        ProposalSpec::new(ProposalKind::Gaussian(GaussianSettings::default()), 0.4),
        ProposalSpec::new(ProposalKind::DifferentialEvolution, 0.5),
        ProposalSpec::new(ProposalKind::Kde(KdeSettings::default()), 0.1),
    ]
}

impl SamplerSettings {
    fn resolved_betas(&self) -> Vec<f64> {
        match &self.betas {
            Some(betas) => betas.clone(),
            None => TemperatureLadder::geometric(self.n_chains, self.beta_min),
        }
    }

    fn uses_de(&self) -> bool {
        self.proposals.iter().any(|s| {
            matches!(
                s.kind,
                ProposalKind::DifferentialEvolution | ProposalKind::BlockDifferentialEvolution(_)
            )
        })
    }

    fn validate(&self, max_dim: usize) -> Result<(), ConfigError> {
        if self.n_chains == 0 {
            return Err(ConfigError::NoChains);
        }
        if self.sample_threads == 0 || self.swap_threads == 0 {
            return Err(ConfigError::NoThreads);
        }
        if self.steps_per_generation == 0 {
            return Err(ConfigError::NoSteps);
        }
        if !(0.0..=1.0).contains(&self.swap_probability) {
            return Err(ConfigError::BadSwapProbability);
        }

        let betas = self.resolved_betas();
        if betas.len() != self.n_chains {
            return Err(ConfigError::LadderLengthMismatch {
                betas: betas.len(),
                chains: self.n_chains,
            });
        }
        if betas[0] != 1.0
            || !betas.windows(2).all(|w| w[1] < w[0] && w[1] > 0.0)
        {
            return Err(ConfigError::BadLadder);
        }

        if self.proposals.is_empty() {
            return Err(ConfigError::NoProposals);
        }
        if !self
            .proposals
            .iter()
            .all(|s| s.weight.is_finite() && s.weight > 0.0)
        {
            return Err(ConfigError::BadProposalWeights);
        }
        if self.min_dim > max_dim {
            return Err(ConfigError::BadDimensionRange {
                min_dim: self.min_dim,
                max_dim,
            });
        }
        if let Some(bounds) = &self.bounds {
            if bounds.len() != max_dim {
                return Err(ConfigError::BadBounds {
                    got: bounds.len(),
                    need: max_dim,
                });
            }
        }

        for spec in &self.proposals {
            match &spec.kind {
                ProposalKind::SequentialLayer(settings) | ProposalKind::RandomLayer(settings) => {
                    if !self.reversible_jump {
                        return Err(ConfigError::LayerProposalWithoutRj);
                    }
                    let width = settings.layer_width;
                    if width == 0 || max_dim % width != 0 || self.min_dim % width != 0 {
                        return Err(ConfigError::BadLayerWidth);
                    }
                }
                _ => {}
            }
        }
        if self.uses_de() {
            if self.n_chains < 3 {
                return Err(ConfigError::TooFewChainsForDe);
            }
            if self.reversible_jump && self.min_dim == 0 {
                return Err(ConfigError::DeNeedsMinDim);
            }
        }
        Ok(())
    }
}

/// Per-proposal tallies inside a [`ChainStatus`].
#[derive(Debug, Clone)]
pub struct ProposalStatus {
    pub kind: &'static str,
    pub accepts: u64,
    pub rejects: u64,
    pub mean_step_secs: f64,
}

#[derive(Debug, Clone)]
pub struct ChainStatus {
    pub steps: u64,
    pub beta: f64,
    pub current_log_likelihood: f64,
    pub swap_accepts: u64,
    pub swap_rejects: u64,
    pub scoring_failures: u64,
    pub dimension_rejects: u64,
    pub faults: u32,
    pub proposals: Vec<ProposalStatus>,
    /// Current selection probability per proposal slot.
    pub selection_weights: Vec<f64>,
    /// Integrated autocorrelation time per parameter.
    pub autocorr_times: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct PairStatus {
    pub colder: usize,
    pub hotter: usize,
    pub attempts: u64,
    pub accepts: u64,
}

/// Snapshot of the whole run, rebuilt at every generation barrier and read
/// without disturbing the workers.
#[derive(Debug, Clone, Default)]
pub struct SamplerStatus {
    pub generation: u64,
    pub betas: Vec<f64>,
    pub chains: Vec<ChainStatus>,
    pub pairs: Vec<PairStatus>,
    pub mean_log_likelihood: f64,
    pub max_log_likelihood: f64,
}

/// Everything the run produced, addressable by chain index and step index.
pub struct RunOutput {
    pub histories: Vec<ChainHistory>,
    pub betas: Vec<f64>,
    pub status: SamplerStatus,
}

impl RunOutput {
    /// The untempered chain.
    pub fn cold_chain(&self) -> &ChainHistory {
        &self.histories[0]
    }

    pub fn autocorr_times(&self, chain: usize, max_dim: usize) -> Vec<f64> {
        history_autocorr_times(&self.histories[chain], max_dim)
    }
}

struct SampleJob {
    chain: usize,
    steps: u64,
}

struct SwapJob {
    colder: usize,
    hotter: usize,
}

struct Engine<M: Model> {
    settings: SamplerSettings,
    max_dim: usize,
    chains: Vec<Mutex<Chain<M>>>,
    histories: Vec<RwLock<ChainHistory>>,
    snapshots: SnapshotBoard,
    pair_stats: Vec<Mutex<PairStats>>,
    coordinator: PairCoordinator,
    gate: GenerationGate,
    faults: Vec<AtomicU32>,
    stop: AtomicBool,
    status: RwLock<SamplerStatus>,
    proposal_names: Vec<&'static str>,
}

impl<M: Model> Engine<M> {
    fn new(model: M, settings: SamplerSettings, betas: &[f64]) -> Self {
        let model = Arc::new(model);
        let max_dim = model.max_dim();
        let n = settings.n_chains;
        let n_proposals = settings.proposals.len();
        let proposal_names = settings.proposals.iter().map(|s| s.kind.name()).collect();

        let mut chains = Vec::with_capacity(n);
        let mut initial = Vec::with_capacity(n);
        for id in 0..n {
            let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
            rng.set_stream(id as u64);
            let position = if settings.reversible_jump {
                Position::with_active(max_dim, max_dim)
            } else {
                Position::new(max_dim)
            };
            initial.push(position.clone());
            let proposals = ProposalSet::build(
                &settings.proposals,
                max_dim,
                settings.adaptive_proposal_weights,
            );
            chains.push(Mutex::new(Chain::new(
                id,
                betas[id],
                position,
                rng,
                proposals,
                Arc::clone(&model),
            )));
        }

        Self {
            max_dim,
            chains,
            histories: (0..n)
                .map(|_| RwLock::new(ChainHistory::new(n_proposals)))
                .collect(),
            snapshots: SnapshotBoard::new(initial),
            pair_stats: (0..n.saturating_sub(1))
                .map(|_| Mutex::new(PairStats::default()))
                .collect(),
            coordinator: PairCoordinator::new(n),
            gate: GenerationGate::new(),
            faults: (0..n).map(|_| AtomicU32::new(0)).collect(),
            stop: AtomicBool::new(false),
            status: RwLock::new(SamplerStatus::default()),
            settings,
            proposal_names,
        }
    }

    fn step_env(&self, chain: usize) -> StepEnv<'_> {
        StepEnv {
            n_chains: self.settings.n_chains,
            min_dim: self.settings.min_dim,
            max_dim: self.max_dim,
            bounds: self.settings.bounds.as_deref(),
            snapshots: &self.snapshots,
            history: &self.histories[chain],
        }
    }

    fn record_fault(&self, chain: usize) {
        self.faults[chain].fetch_add(1, Ordering::AcqRel);
    }

    fn fatal_chain(&self) -> Option<(usize, u32)> {
        self.faults.iter().enumerate().find_map(|(chain, count)| {
            let count = count.load(Ordering::Acquire);
            (count >= self.settings.max_chain_faults).then_some((chain, count))
        })
    }

    /// Rebuild the status snapshot. Runs at generation barriers, so every
    /// history read lock is uncontended.
    fn refresh_status(&self, generation: u64, betas: &[f64]) {
        let mut chains = Vec::with_capacity(self.chains.len());
        let mut mean = 0f64;
        let mut count = 0usize;
        let mut max = f64::NEG_INFINITY;
        for (id, history) in self.histories.iter().enumerate() {
            let selection_weights = self.chains[id]
                .lock()
                .map(|chain| chain.proposals.weights().to_vec())
                .unwrap_or_default();
            let history = history.read().expect("poisoned chain history");
            let (swap_accepts, swap_rejects) = history.swap_counts();
            for ll in history.log_likelihoods() {
                mean += ll;
                max = max.max(*ll);
                count += 1;
            }
            let proposals = self
                .proposal_names
                .iter()
                .copied()
                .enumerate()
                .map(|(i, kind)| ProposalStatus {
                    kind,
                    accepts: history.accepts()[i],
                    rejects: history.rejects()[i],
                    mean_step_secs: history.mean_step_secs()[i],
                })
                .collect();
            chains.push(ChainStatus {
                steps: history.len().saturating_sub(1) as u64,
                beta: betas[id],
                current_log_likelihood: history
                    .log_likelihoods()
                    .last()
                    .copied()
                    .unwrap_or(f64::NAN),
                swap_accepts,
                swap_rejects,
                scoring_failures: history.scoring_failures(),
                dimension_rejects: history.dimension_rejects(),
                faults: self.faults[id].load(Ordering::Acquire),
                proposals,
                selection_weights,
                autocorr_times: history_autocorr_times(&history, self.max_dim),
            });
        }
        let pairs = self
            .pair_stats
            .iter()
            .enumerate()
            .map(|(i, stats)| {
                let stats = stats.lock().expect("poisoned pair stats");
                PairStatus {
                    colder: i,
                    hotter: i + 1,
                    attempts: stats.attempts,
                    accepts: stats.accepts,
                }
            })
            .collect_vec();

        *self.status.write().expect("poisoned status") = SamplerStatus {
            generation,
            betas: betas.to_vec(),
            chains,
            pairs,
            mean_log_likelihood: if count > 0 { mean / count as f64 } else { f64::NAN },
            max_log_likelihood: max,
        };
    }

    fn into_output(self) -> RunOutput {
        let status = self.status.into_inner().expect("poisoned status");
        RunOutput {
            histories: self
                .histories
                .into_iter()
                .map(|h| h.into_inner().expect("poisoned chain history"))
                .collect(),
            betas: status.betas.clone(),
            status,
        }
    }
}

/// The generation loop, run on the controller thread.
fn run_controller<M: Model>(
    engine: Arc<Engine<M>>,
    mut ladder: TemperatureLadder,
) -> Result<(), SamplerError> {
    let settings = engine.settings.clone();
    let n_chains = settings.n_chains;

    for id in 0..n_chains {
        let mut chain = engine.chains[id].lock().expect("poisoned chain");
        let env = engine.step_env(id);
        chain.init(&env)?;
    }
    engine.refresh_status(0, ladder.betas());

    let swap_engine = Arc::clone(&engine);
    let swap_fault_engine = Arc::clone(&engine);
    let swap_pool = Arc::new(WorkerPool::start(
        settings.swap_threads,
        "paratemp-swap",
        move |_, job: &SwapJob| run_swap_job(&swap_engine, job),
        move |job: &SwapJob| {
            // A failed swap must still hand both chains back.
            swap_fault_engine.record_fault(job.colder);
            swap_fault_engine.record_fault(job.hotter);
            swap_fault_engine.coordinator.release(job.colder, job.hotter);
            swap_fault_engine.gate.swap_finished();
        },
    ));

    let sample_engine = Arc::clone(&engine);
    let sample_fault_engine = Arc::clone(&engine);
    let sample_swap_pool = Arc::clone(&swap_pool);
    let sample_pool = WorkerPool::start(
        settings.sample_threads,
        "paratemp-sample",
        move |_, job: &SampleJob| run_sample_job(&sample_engine, &sample_swap_pool, job),
        move |job: &SampleJob| {
            sample_fault_engine.record_fault(job.chain);
            sample_fault_engine.gate.finished();
        },
    );

    let mut result = Ok(());
    for generation in 0..settings.generations {
        if engine.stop.load(Ordering::Acquire) {
            break;
        }
        let adapting = generation < settings.adapt_generations;
        for (id, chain) in engine.chains.iter().enumerate() {
            // A chain whose job panicked leaves a poisoned mutex behind;
            // it keeps its old beta until the fault threshold retires it.
            if let Ok(mut chain) = chain.lock() {
                chain.beta = ladder.beta(id);
                chain.adapting = adapting;
            }
        }

        engine.gate.begin(n_chains);
        for chain in 0..n_chains {
            sample_pool.submit(SampleJob {
                chain,
                steps: settings.steps_per_generation,
            });
        }
        engine.gate.wait_quiescent();
        engine.coordinator.drain();
        debug_assert!(engine.coordinator.is_quiescent());

        if settings.adapt_ladder && adapting && n_chains > 1 {
            let rates = engine
                .pair_stats
                .iter()
                .map(|stats| {
                    stats
                        .lock()
                        .expect("poisoned pair stats")
                        .take_window_rate()
                })
                .collect_vec();
            ladder.adapt(&rates, generation);
        }
        engine.refresh_status(generation + 1, ladder.betas());

        if let Some((chain, faults)) = engine.fatal_chain() {
            result = Err(SamplerError::ChainFatal { chain, faults });
            break;
        }
    }

    sample_pool.stop();
    swap_pool.stop();
    result
}

fn run_sample_job<M: Model>(
    engine: &Arc<Engine<M>>,
    swap_pool: &Arc<WorkerPool<SwapJob>>,
    job: &SampleJob,
) {
    let offer = {
        let mut chain = engine.chains[job.chain].lock().expect("poisoned chain");
        let env = engine.step_env(job.chain);
        chain.advance(job.steps, &env);
        engine.settings.n_chains > 1
            && !swap_pool.stopping()
            && chain.rng.random::<f64>() < engine.settings.swap_probability
    };

    if !offer {
        engine.gate.finished();
        return;
    }
    if let Some((colder, hotter)) = engine.coordinator.offer(job.chain, &engine.gate) {
        if !swap_pool.submit(SwapJob { colder, hotter }) {
            // Raced a stop request; undo the dispatch bookkeeping.
            engine.coordinator.release(colder, hotter);
            engine.gate.swap_finished();
        }
    }
}

fn run_swap_job<M: Model>(engine: &Arc<Engine<M>>, job: &SwapJob) {
    let record = {
        let mut colder = engine.chains[job.colder].lock().expect("poisoned chain");
        let mut hotter = engine.chains[job.hotter].lock().expect("poisoned chain");
        let record = attempt_swap(&mut colder, &mut hotter);
        if record.accepted {
            engine
                .snapshots
                .publish(job.colder, Arc::new(colder.current.clone()));
            engine
                .snapshots
                .publish(job.hotter, Arc::new(hotter.current.clone()));
        }
        record
    };

    engine.histories[job.colder]
        .write()
        .expect("poisoned chain history")
        .record_swap(record.accepted);
    engine.histories[job.hotter]
        .write()
        .expect("poisoned chain history")
        .record_swap(record.accepted);
    engine.pair_stats[job.colder]
        .lock()
        .expect("poisoned pair stats")
        .record(record.accepted);

    engine.coordinator.release(job.colder, job.hotter);
    engine.gate.swap_finished();
}

/// Handle to a running sampler.
///
/// Construction validates the settings, builds the chains, and starts the
/// controller thread, which drives the generation loop over the two worker
/// pools. The handle only observes: `status` reads the latest barrier
/// snapshot, `stop` requests a cooperative shutdown, `join` waits for the
/// controller and returns everything the run produced.
pub struct Sampler<M: Model> {
    engine: Arc<Engine<M>>,
    controller: JoinHandle<Result<(), SamplerError>>,
}

impl<M: Model> Sampler<M> {
    pub fn new(model: M, settings: SamplerSettings) -> Result<Self, ConfigError> {
        settings.validate(model.max_dim())?;
        let betas = settings.resolved_betas();
        let ladder = TemperatureLadder::new(
            betas.clone(),
            settings.target_swap_accept,
            settings.adapt_t0,
            settings.adapt_nu,
        );
        let engine = Arc::new(Engine::new(model, settings, &betas));

        let controller_engine = Arc::clone(&engine);
        let controller = std::thread::Builder::new()
            .name("paratemp-controller".to_string())
            .spawn(move || run_controller(controller_engine, ladder))
            .expect("failed to spawn controller thread");

        Ok(Self { engine, controller })
    }

    /// The latest generation-barrier snapshot.
    pub fn status(&self) -> SamplerStatus {
        self.engine.status.read().expect("poisoned status").clone()
    }

    /// Request a cooperative stop: the current generation finishes, nothing
    /// new is dispatched.
    pub fn stop(&self) {
        self.engine.stop.store(true, Ordering::Release);
    }

    /// Wait for the run to finish and collect its output. The output is
    /// returned even when the run ended in an error, so partial histories
    /// stay inspectable.
    pub fn join(self) -> (Result<(), SamplerError>, RunOutput) {
        let result = match self.controller.join() {
            Ok(result) => result,
            Err(_) => Err(SamplerError::ControllerPanicked),
        };
        let engine = match Arc::try_unwrap(self.engine) {
            Ok(engine) => engine,
            Err(_) => unreachable!("worker pools join before the controller returns"),
        };
        (result, engine.into_output())
    }
}

/// Run to completion on the calling thread and fail on any sampler error.
pub fn sample<M: Model>(model: M, settings: SamplerSettings) -> Result<RunOutput, SamplerError> {
    let sampler = Sampler::new(model, settings)?;
    let (result, output) = sampler.join();
    result.map(|()| output)
}
