use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::{prelude::*, ThreadPoolBuilder};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    address::AddressIndex,
    chain::run_chain,
    controller::{ExecutionController, InferenceEngine, PriorInflation, TraceMode},
    empirical::Empirical,
    importance::run_importance,
    model::Model,
    proposal::ProposalNetwork,
    storage::{StorageConfig, TraceRecord, TraceStorage},
    trace::{ObservedData, Trace, NO_OBSERVATIONS},
};

/// Settings for sampling from the prior.
#[derive(Debug, Clone, Copy)]
pub struct PriorSettings {
    pub num_traces: u64,
    /// Draw from widened priors where the distribution supports it. The
    /// traces are reweighted to the true prior.
    pub prior_inflation: PriorInflation,
}

impl Default for PriorSettings {
    fn default() -> Self {
        Self {
            num_traces: 1000,
            prior_inflation: PriorInflation::Disabled,
        }
    }
}

/// Settings for sampling from the posterior.
#[derive(Debug, Clone, Copy)]
pub struct PosteriorSettings {
    /// Traces per run. For Metropolis-Hastings this is the chain length.
    pub num_traces: u64,
    pub engine: InferenceEngine,
    /// Number of independent runs in [`Inference::posterior_chains`].
    pub num_chains: usize,
    /// Seed for the per-chain random number generators of
    /// [`Inference::posterior_chains`].
    pub seed: u64,
}

impl Default for PosteriorSettings {
    fn default() -> Self {
        Self {
            num_traces: 1000,
            engine: InferenceEngine::ImportanceSampling,
            num_chains: 4,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Progress {
    pub chain: u64,
    pub finished_traces: u64,
    pub total_traces: u64,
    /// Accepted proposals so far, for Metropolis-Hastings runs.
    pub accepted: Option<u64>,
}

pub struct ProgressCallback {
    pub callback: Box<dyn FnMut(Duration, Progress) + Send>,
    pub rate: Duration,
}

/// Throttles calls to a shared progress callback for one run.
pub(crate) struct Reporter<'a> {
    callback: Option<&'a Mutex<ProgressCallback>>,
    chain: u64,
    total_traces: u64,
    start: Instant,
    last: Option<Instant>,
}

impl<'a> Reporter<'a> {
    pub(crate) fn new(
        callback: Option<&'a Mutex<ProgressCallback>>,
        chain: u64,
        total_traces: u64,
    ) -> Self {
        Reporter {
            callback,
            chain,
            total_traces,
            start: Instant::now(),
            last: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn silent() -> Reporter<'static> {
        Reporter::new(None, 0, 0)
    }

    pub(crate) fn report(&mut self, finished_traces: u64, accepted: Option<u64>) {
        let Some(callback) = self.callback else {
            return;
        };
        let Ok(mut guard) = callback.lock() else {
            return;
        };
        let due = match self.last {
            None => true,
            Some(last) => last.elapsed() >= guard.rate,
        };
        if !due && finished_traces < self.total_traces {
            return;
        }
        let progress = Progress {
            chain: self.chain,
            finished_traces,
            total_traces: self.total_traces,
            accepted,
        };
        (guard.callback)(self.start.elapsed(), progress);
        self.last = Some(Instant::now());
    }
}

/// Inference front end for a model.
///
/// Holds the model together with its optional collaborators: a trained
/// proposal network, an address index and a progress callback.
pub struct Inference<M: Model> {
    model: M,
    network: Option<Arc<dyn ProposalNetwork>>,
    address_index: Option<Arc<dyn AddressIndex>>,
    progress: Option<Mutex<ProgressCallback>>,
}

impl<M: Model> Inference<M> {
    pub fn new(model: M) -> Self {
        Inference {
            model,
            network: None,
            address_index: None,
            progress: None,
        }
    }

    pub fn with_network(mut self, network: Arc<dyn ProposalNetwork>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn with_address_index(mut self, address_index: Arc<dyn AddressIndex>) -> Self {
        self.address_index = Some(address_index);
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(Mutex::new(progress));
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// An execution controller for this model with the configured
    /// collaborators, in prior mode.
    pub fn controller<'s>(&'s self, observed: &'s ObservedData) -> ExecutionController<'s, M> {
        ExecutionController::new(&self.model)
            .observed(observed)
            .network(self.network.as_deref())
            .address_index(self.address_index.as_deref())
    }

    pub fn prior_traces<R: Rng + ?Sized>(
        &self,
        settings: PriorSettings,
        rng: &mut R,
    ) -> Result<Empirical<Trace<M::Output>>> {
        self.prior_map(settings, |trace| trace.clone(), rng)
    }

    pub fn prior_distribution<R: Rng + ?Sized>(
        &self,
        settings: PriorSettings,
        rng: &mut R,
    ) -> Result<Empirical<M::Output>> {
        self.prior_map(settings, |trace| trace.result().clone(), rng)
    }

    /// Sample from the prior and store `map(trace)` for every trace.
    pub fn prior_map<U, R: Rng + ?Sized>(
        &self,
        settings: PriorSettings,
        map: impl FnMut(&Trace<M::Output>) -> U,
        rng: &mut R,
    ) -> Result<Empirical<U>> {
        let controller = self
            .controller(&NO_OBSERVATIONS)
            .prior_inflation(settings.prior_inflation);
        let mut reporter = Reporter::new(self.progress.as_ref(), 0, settings.num_traces);
        let mut prior = run_importance(&controller, settings.num_traces, map, &mut reporter, rng)
            .with_context(|| format!("Prior sampling of {} failed", self.model.name()))?;
        prior.rename(format!("Prior, traces: {}", settings.num_traces));
        info!(model = self.model.name(), name = prior.name(), "finished sampling");
        Ok(prior)
    }

    pub fn posterior_traces<R: Rng + ?Sized>(
        &self,
        settings: PosteriorSettings,
        observed: &ObservedData,
        rng: &mut R,
    ) -> Result<Empirical<Trace<M::Output>>> {
        self.posterior_map(settings, observed, |trace| trace.clone(), rng)
    }

    pub fn posterior_distribution<R: Rng + ?Sized>(
        &self,
        settings: PosteriorSettings,
        observed: &ObservedData,
        rng: &mut R,
    ) -> Result<Empirical<M::Output>> {
        self.posterior_map(settings, observed, |trace| trace.result().clone(), rng)
    }

    /// Sample from the posterior given `observed` and store `map(trace)`
    /// for every trace.
    pub fn posterior_map<U, R: Rng + ?Sized>(
        &self,
        settings: PosteriorSettings,
        observed: &ObservedData,
        map: impl FnMut(&Trace<M::Output>) -> U,
        rng: &mut R,
    ) -> Result<Empirical<U>> {
        self.posterior_map_from(settings, observed, None, map, rng)
    }

    /// Like [`posterior_map`](Self::posterior_map), but Metropolis-Hastings
    /// chains start at `initial` if given. Importance sampling ignores
    /// `initial`.
    pub fn posterior_map_from<U, R: Rng + ?Sized>(
        &self,
        settings: PosteriorSettings,
        observed: &ObservedData,
        initial: Option<Trace<M::Output>>,
        map: impl FnMut(&Trace<M::Output>) -> U,
        rng: &mut R,
    ) -> Result<Empirical<U>> {
        let mut reporter = Reporter::new(self.progress.as_ref(), 0, settings.num_traces);
        self.run_posterior(settings, observed, initial, map, &mut reporter, rng)
            .with_context(|| format!("Posterior sampling of {} failed", self.model.name()))
    }

    fn run_posterior<U, R: Rng + ?Sized>(
        &self,
        settings: PosteriorSettings,
        observed: &ObservedData,
        initial: Option<Trace<M::Output>>,
        map: impl FnMut(&Trace<M::Output>) -> U,
        reporter: &mut Reporter<'_>,
        rng: &mut R,
    ) -> Result<Empirical<U>> {
        let engine = settings.engine;
        let controller = self
            .controller(observed)
            .mode(TraceMode::Posterior)
            .engine(engine);

        if !engine.is_metropolis_hastings() {
            let mut posterior =
                run_importance(&controller, settings.num_traces, map, reporter, rng)?;
            let ess = posterior.effective_sample_size()?;
            posterior.rename(format!(
                "Posterior, {}, traces: {}, ESS: {:.2}",
                engine.short_name(),
                settings.num_traces,
                ess
            ));
            info!(model = self.model.name(), name = posterior.name(), "finished sampling");
            return Ok(posterior);
        }

        let (mut posterior, stats) = run_chain(
            controller,
            settings.num_traces,
            initial,
            map,
            reporter,
            &mut *rng,
        )?;
        posterior.rename(format!(
            "Posterior, {}, traces: {}, accepted: {:.2}%, sample reuse: {:.2}%",
            engine.short_name(),
            settings.num_traces,
            100. * stats.acceptance_rate(),
            100. * stats.reuse_rate()
        ));
        if stats.undefined_transitions > 0 {
            warn!(
                steps = stats.steps,
                undefined_transitions = stats.undefined_transitions,
                "Some proposals never reached their resampled site"
            );
        }
        info!(
            model = self.model.name(),
            name = posterior.name(),
            accepted = stats.accepted,
            samples_reused = stats.samples_reused,
            "finished sampling"
        );
        Ok(posterior)
    }

    /// Run `settings.num_chains` independent runs in parallel and combine
    /// them.
    ///
    /// Every run draws from its own stream of a `ChaCha8Rng` seeded with
    /// `settings.seed`, so the result does not depend on thread scheduling.
    pub fn posterior_chains<U: Send>(
        &self,
        settings: PosteriorSettings,
        observed: &ObservedData,
        map: impl Fn(&Trace<M::Output>) -> U + Sync,
    ) -> Result<Empirical<U>> {
        if settings.num_chains == 0 {
            bail!("At least one chain is needed");
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(settings.num_chains)
            .thread_name(|i| format!("probtrace-chain-{}", i))
            .build()
            .context("Could not start thread pool")?;

        let runs = pool.install(|| {
            (0..settings.num_chains as u64)
                .into_par_iter()
                .map(|chain| {
                    let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
                    rng.set_stream(chain);
                    let mut reporter =
                        Reporter::new(self.progress.as_ref(), chain, settings.num_traces);
                    self.run_posterior(settings, observed, None, &map, &mut reporter, &mut rng)
                        .with_context(|| format!("Chain {} of {} failed", chain, self.model.name()))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let mut posterior = Empirical::combine(runs);
        let ess = posterior.effective_sample_size()?;
        posterior.rename(format!(
            "Posterior, {}, chains: {}, traces: {}, ESS: {:.2}",
            settings.engine.short_name(),
            settings.num_chains,
            posterior.len(),
            ess
        ));
        info!(model = self.model.name(), name = posterior.name(), "finished sampling");
        Ok(posterior)
    }

    /// Generate prior traces straight into storage, for example to train a
    /// proposal network offline.
    pub fn save_traces<C: StorageConfig, R: Rng + ?Sized>(
        &self,
        config: C,
        num_traces: u64,
        prior_inflation: PriorInflation,
        rng: &mut R,
    ) -> Result<<C::Storage as TraceStorage>::Finalized>
    where
        M::Output: Serialize,
    {
        let controller = self
            .controller(&NO_OBSERVATIONS)
            .prior_inflation(prior_inflation);
        let mut storage = config
            .new_storage()
            .context("Could not create trace storage")?;
        let mut reporter = Reporter::new(self.progress.as_ref(), 0, num_traces);
        for (done, trace) in (1..=num_traces).zip(controller.traces(&mut *rng)) {
            let record = TraceRecord::from_trace(&trace?)?;
            storage.record_trace(record)?;
            reporter.report(done, None);
        }
        storage.finalize()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::{
        controller::TraceContext,
        distributions::{Categorical, Normal},
        model::FnModel,
        storage::MemoryConfig,
        value::Value,
    };
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn gaussian() -> FnModel<impl Fn(&mut TraceContext<'_>) -> Result<f64> + Send + Sync, f64> {
        FnModel::new("gaussian", |ctx: &mut TraceContext<'_>| {
            let mu = ctx.sample("mu", Normal::new(1., 5f64.sqrt())?)?.as_f64()?;
            ctx.observe("obs0", Normal::new(mu, 2f64.sqrt())?)?;
            ctx.observe("obs1", Normal::new(mu, 2f64.sqrt())?)?;
            Ok(mu)
        })
    }

    #[test]
    fn prior_names_and_weights() -> Result<()> {
        let inference = Inference::new(gaussian());
        let mut rng = StdRng::seed_from_u64(0);
        let prior = inference.prior_distribution(
            PriorSettings {
                num_traces: 200,
                ..Default::default()
            },
            &mut rng,
        )?;
        assert_eq!(prior.name(), "Prior, traces: 200");
        assert_abs_diff_eq!(prior.effective_sample_size()?, 200., epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn inflated_prior_is_reweighted() -> Result<()> {
        let model = FnModel::new("categorical", |ctx: &mut TraceContext<'_>| {
            Ok(ctx.sample("c", Categorical::new(vec![0.1, 0.9])?)?.as_i64()?)
        });
        let inference = Inference::new(model);
        let mut rng = StdRng::seed_from_u64(1);
        let traces = inference.prior_traces(
            PriorSettings {
                num_traces: 100,
                prior_inflation: PriorInflation::Enabled,
            },
            &mut rng,
        )?;
        // Prior mode weighs every trace equally, the correction lives on
        // the trace itself
        assert_abs_diff_eq!(traces.effective_sample_size()?, 100., epsilon = 1e-9);
        for trace in traces.values() {
            let expected = match trace.result() {
                0 => 0.1f64.ln() - 0.5f64.ln(),
                _ => 0.9f64.ln() - 0.5f64.ln(),
            };
            assert_abs_diff_eq!(trace.log_importance_weight(), expected, epsilon = 1e-12);
        }
        Ok(())
    }

    #[test]
    fn gaussian_posterior_mean() -> Result<()> {
        // Conjugate model with posterior mean 37 / 12 for observations 3 and 4
        let inference = Inference::new(gaussian());
        let observed = ObservedData::new().with("obs0", 3.).with("obs1", 4.);
        let mut rng = StdRng::seed_from_u64(2);
        let posterior = inference.posterior_distribution(
            PosteriorSettings {
                num_traces: 5000,
                ..Default::default()
            },
            &observed,
            &mut rng,
        )?;
        assert!(posterior.name().starts_with("Posterior, IS, traces: 5000, ESS: "));
        assert_abs_diff_eq!(posterior.mean()?, 37. / 12., epsilon = 0.15);
        Ok(())
    }

    #[test]
    fn chains_are_reproducible() -> Result<()> {
        let inference = Inference::new(gaussian());
        let observed = ObservedData::new().with("obs0", 3.).with("obs1", 4.);
        let settings = PosteriorSettings {
            num_traces: 300,
            engine: InferenceEngine::RandomWalkMetropolisHastings,
            num_chains: 3,
            seed: 17,
        };
        let first = inference.posterior_chains(settings, &observed, |t| *t.result())?;
        let second = inference.posterior_chains(settings, &observed, |t| *t.result())?;
        assert_eq!(first.len(), 900);
        assert_eq!(first.values(), second.values());
        assert!(first.name().starts_with("Posterior, RMH, chains: 3, traces: 900"));
        Ok(())
    }

    #[test]
    fn progress_reports_final_trace() -> Result<()> {
        let calls = Arc::new(AtomicU64::new(0));
        let last = Arc::new(AtomicU64::new(0));
        let (calls_inner, last_inner) = (calls.clone(), last.clone());
        let inference = Inference::new(gaussian()).with_progress(ProgressCallback {
            callback: Box::new(move |_, progress| {
                calls_inner.fetch_add(1, Ordering::Relaxed);
                last_inner.store(progress.finished_traces, Ordering::Relaxed);
            }),
            rate: Duration::from_secs(3600),
        });
        let mut rng = StdRng::seed_from_u64(3);
        inference.prior_distribution(
            PriorSettings {
                num_traces: 50,
                ..Default::default()
            },
            &mut rng,
        )?;
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(last.load(Ordering::Relaxed), 50);
        Ok(())
    }

    #[test]
    fn saved_traces_match_model() -> Result<()> {
        let inference = Inference::new(gaussian());
        let mut rng = StdRng::seed_from_u64(4);
        let records = inference.save_traces(MemoryConfig, 5, PriorInflation::Disabled, &mut rng)?;
        assert_eq!(records.len(), 5);
        for record in records {
            assert_eq!(record.variables.len(), 3);
            assert_eq!(record.length_controlled(), 1);
            let mu = record.result_as::<f64>()?;
            assert_eq!(record.get("mu__Normal__1").map(|v| &v.value), Some(&Value::Real(mu)));
        }
        Ok(())
    }
}
