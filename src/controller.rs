//! Execution of a model into a trace.

use std::{collections::HashMap, fmt, sync::Arc};

use anyhow::Result;
use rand::{Rng, RngCore};

use crate::{
    address::{Address, AddressIndex, Site},
    distributions::Distribution,
    error::PplError,
    model::Model,
    proposal::{
        MetropolisHastingsProposer, NetworkProposer, PriorProposer, ProposalNetwork, Proposer,
        SiteRequest,
    },
    trace::{ObservedData, Trace, Variable, NO_OBSERVATIONS},
    value::Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceMode {
    /// Draw every choice from its prior. Observations are recorded but do
    /// not weight the trace.
    #[default]
    Prior,
    /// Condition on observed data using the configured inference engine.
    Posterior,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PriorInflation {
    #[default]
    Disabled,
    /// Draw prior-mode choices from widened priors where the distribution
    /// family supports it.
    Enabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InferenceEngine {
    #[default]
    ImportanceSampling,
    ImportanceSamplingWithNetwork,
    LightweightMetropolisHastings,
    RandomWalkMetropolisHastings,
}

impl InferenceEngine {
    pub fn is_metropolis_hastings(&self) -> bool {
        matches!(
            self,
            InferenceEngine::LightweightMetropolisHastings
                | InferenceEngine::RandomWalkMetropolisHastings
        )
    }

    pub fn short_name(&self) -> &'static str {
        match self {
            InferenceEngine::ImportanceSampling => "IS",
            InferenceEngine::ImportanceSamplingWithNetwork => "IC",
            InferenceEngine::LightweightMetropolisHastings => "LMH",
            InferenceEngine::RandomWalkMetropolisHastings => "RMH",
        }
    }
}

impl fmt::Display for InferenceEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Handle through which a running model makes its random choices.
///
/// One context records exactly one trace. It is created by the
/// [`ExecutionController`] and passed to [`Model::forward`].
pub struct TraceContext<'a> {
    mode: TraceMode,
    observed: &'a ObservedData,
    address_index: Option<&'a dyn AddressIndex>,
    proposer: &'a mut dyn Proposer,
    rng: &'a mut dyn RngCore,
    variables: Vec<Variable>,
    by_address: HashMap<Address, usize>,
    instances: HashMap<String, u64>,
    log_proposal_correction: f64,
}

impl<'a> TraceContext<'a> {
    fn new(
        mode: TraceMode,
        observed: &'a ObservedData,
        address_index: Option<&'a dyn AddressIndex>,
        proposer: &'a mut dyn Proposer,
        rng: &'a mut dyn RngCore,
    ) -> Self {
        TraceContext {
            mode,
            observed,
            address_index,
            proposer,
            rng,
            variables: Vec::new(),
            by_address: HashMap::new(),
            instances: HashMap::new(),
            log_proposal_correction: 0.,
        }
    }

    pub fn mode(&self) -> TraceMode {
        self.mode
    }

    /// Number of variables recorded so far.
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Make a controlled random choice at the automatically addressed site
    /// `name`.
    pub fn sample<D: Distribution + 'static>(&mut self, name: &str, distribution: D) -> Result<Value> {
        self.sample_at(Site::new(name), distribution)
    }

    pub fn sample_at<D: Distribution + 'static>(
        &mut self,
        site: impl Into<Site>,
        distribution: D,
    ) -> Result<Value> {
        self.sample_dyn(site.into(), Arc::new(distribution))
    }

    pub fn sample_dyn(&mut self, site: Site, distribution: Arc<dyn Distribution>) -> Result<Value> {
        let address = self.address_for(&site, distribution.name())?;
        self.make_room(&address, site.is_replaced())?;

        let (value, log_prob, reused) = if site.is_controlled() {
            let request = SiteRequest {
                address: &address,
                prior: &distribution,
                observed: self.observed,
                trace: &self.variables,
            };
            let proposal = self.proposer.propose(request, &mut *self.rng)?;
            self.log_proposal_correction += proposal.log_weight;
            (proposal.value, proposal.log_prob, proposal.reused)
        } else {
            let value = distribution.sample(&mut *self.rng);
            let log_prob = distribution.log_prob(&value);
            (value, log_prob, false)
        };

        self.record(Variable {
            address,
            name: site.name().to_string(),
            distribution,
            value: value.clone(),
            log_prob,
            controlled: site.is_controlled(),
            observed: false,
            reused,
            replaced: site.is_replaced(),
        });
        Ok(value)
    }

    /// Condition on the observed value for `name`.
    ///
    /// If no value was observed under that name, a value is drawn from
    /// `distribution` instead, so the same model can generate data.
    pub fn observe<D: Distribution + 'static>(&mut self, name: &str, distribution: D) -> Result<Value> {
        self.observe_at(Site::new(name), distribution)
    }

    pub fn observe_at<D: Distribution + 'static>(
        &mut self,
        site: impl Into<Site>,
        distribution: D,
    ) -> Result<Value> {
        let site = site.into();
        let distribution: Arc<dyn Distribution> = Arc::new(distribution);
        let address = self.address_for(&site, distribution.name())?;
        self.make_room(&address, site.is_replaced())?;

        let value = match self.observed.get(site.name()) {
            Some(value) => value.clone(),
            None => distribution.sample(&mut *self.rng),
        };
        let log_prob = distribution.log_prob(&value);

        self.record(Variable {
            address,
            name: site.name().to_string(),
            distribution,
            value: value.clone(),
            log_prob,
            controlled: false,
            observed: true,
            reused: false,
            replaced: site.is_replaced(),
        });
        Ok(value)
    }

    fn address_for(&mut self, site: &Site, distribution: &str) -> Result<Address> {
        if site.is_exact() {
            return Ok(Address::new(site.name()));
        }
        let base = match self.address_index {
            Some(index) => index.resolve(site.name(), distribution)?,
            None => format!("{}__{}", site.name(), distribution),
        };
        if site.is_replaced() {
            return Ok(Address::new(format!("{base}__replaced")));
        }
        let instance = self.instances.entry(base.clone()).or_insert(0);
        *instance += 1;
        Ok(Address::new(format!("{base}__{instance}")))
    }

    /// Enforce one variable per address. A replaced site drops its earlier
    /// draw, anything else is a collision.
    fn make_room(&mut self, address: &Address, replace: bool) -> Result<()> {
        let Some(&idx) = self.by_address.get(address) else {
            return Ok(());
        };
        if !replace {
            return Err(PplError::AddressCollision {
                address: address.clone(),
            }
            .into());
        }
        self.variables.remove(idx);
        self.by_address = self
            .variables
            .iter()
            .enumerate()
            .map(|(i, v)| (v.address.clone(), i))
            .collect();
        Ok(())
    }

    fn record(&mut self, variable: Variable) {
        self.by_address
            .insert(variable.address.clone(), self.variables.len());
        self.variables.push(variable);
    }

    fn finish<T>(self, result: T) -> Trace<T> {
        Trace::new(
            self.variables,
            result,
            self.log_proposal_correction,
            self.mode == TraceMode::Posterior,
        )
    }
}

/// A finished execution.
#[derive(Debug, Clone)]
pub struct Execution<T> {
    pub trace: Trace<T>,
    /// Transition log probability of the site resampled by a
    /// Metropolis-Hastings proposal. `None` if the execution did not
    /// resample a site, or never reached it.
    pub transition_log_prob: Option<f64>,
    /// Address chosen for resampling, if any.
    pub target: Option<Address>,
}

/// Runs a model once per call and records the resulting trace.
///
/// The controller holds only read-only configuration and collaborators,
/// so it can be shared between threads as long as every execution gets its
/// own random number generator.
pub struct ExecutionController<'a, M: Model> {
    model: &'a M,
    mode: TraceMode,
    prior_inflation: PriorInflation,
    engine: InferenceEngine,
    observed: &'a ObservedData,
    network: Option<&'a dyn ProposalNetwork>,
    address_index: Option<&'a dyn AddressIndex>,
}

impl<'a, M: Model> ExecutionController<'a, M> {
    pub fn new(model: &'a M) -> Self {
        ExecutionController {
            model,
            mode: TraceMode::Prior,
            prior_inflation: PriorInflation::Disabled,
            engine: InferenceEngine::ImportanceSampling,
            observed: &NO_OBSERVATIONS,
            network: None,
            address_index: None,
        }
    }

    pub fn mode(mut self, mode: TraceMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn prior_inflation(mut self, prior_inflation: PriorInflation) -> Self {
        self.prior_inflation = prior_inflation;
        self
    }

    pub fn engine(mut self, engine: InferenceEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn observed(mut self, observed: &'a ObservedData) -> Self {
        self.observed = observed;
        self
    }

    pub fn network(mut self, network: Option<&'a dyn ProposalNetwork>) -> Self {
        self.network = network;
        self
    }

    pub fn address_index(mut self, address_index: Option<&'a dyn AddressIndex>) -> Self {
        self.address_index = address_index;
        self
    }

    pub fn model(&self) -> &'a M {
        self.model
    }

    pub fn trace_mode(&self) -> TraceMode {
        self.mode
    }

    pub fn inference_engine(&self) -> InferenceEngine {
        self.engine
    }

    /// Fail early if the configured engine needs a collaborator that is
    /// missing.
    pub fn check(&self) -> std::result::Result<(), PplError> {
        if self.mode == TraceMode::Posterior
            && self.engine == InferenceEngine::ImportanceSamplingWithNetwork
            && self.network.is_none()
        {
            return Err(PplError::MissingInferenceNetwork);
        }
        Ok(())
    }

    /// Execute the model once.
    ///
    /// `reference` is the current trace of a Metropolis-Hastings chain; it
    /// is ignored by the other engines and in prior mode.
    pub fn execute<R: Rng>(
        &self,
        reference: Option<&Trace<M::Output>>,
        rng: &mut R,
    ) -> Result<Execution<M::Output>> {
        self.check()?;
        let mut proposer: Box<dyn Proposer + '_> = match (self.mode, self.engine) {
            (TraceMode::Prior, _) => Box::new(PriorProposer::new(self.prior_inflation)),
            (TraceMode::Posterior, InferenceEngine::ImportanceSampling) => {
                Box::new(PriorProposer::new(PriorInflation::Disabled))
            }
            (TraceMode::Posterior, InferenceEngine::ImportanceSamplingWithNetwork) => {
                let network = self.network.ok_or(PplError::MissingInferenceNetwork)?;
                Box::new(NetworkProposer::new(network))
            }
            (TraceMode::Posterior, InferenceEngine::LightweightMetropolisHastings) => {
                Box::new(MetropolisHastingsProposer::new(reference, false, rng))
            }
            (TraceMode::Posterior, InferenceEngine::RandomWalkMetropolisHastings) => {
                Box::new(MetropolisHastingsProposer::new(reference, true, rng))
            }
        };

        let trace = {
            let mut ctx = TraceContext::new(
                self.mode,
                self.observed,
                self.address_index,
                proposer.as_mut(),
                rng,
            );
            let result = self.model.forward(&mut ctx)?;
            ctx.finish(result)
        };

        Ok(Execution {
            trace,
            transition_log_prob: proposer.transition_log_prob(),
            target: proposer.target().cloned(),
        })
    }

    /// Endless iterator of independent traces, each from a fresh execution.
    pub fn traces<R: Rng>(&self, rng: R) -> TraceGenerator<'_, 'a, M, R> {
        TraceGenerator {
            controller: self,
            rng,
        }
    }
}

/// Pull-based source of independent traces. See
/// [`ExecutionController::traces`].
pub struct TraceGenerator<'c, 'a, M: Model, R> {
    controller: &'c ExecutionController<'a, M>,
    rng: R,
}

impl<M: Model, R: Rng> Iterator for TraceGenerator<'_, '_, M, R> {
    type Item = Result<Trace<M::Output>>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(
            self.controller
                .execute(None, &mut self.rng)
                .map(|execution| execution.trace),
        )
    }
}
