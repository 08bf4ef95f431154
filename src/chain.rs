//! Single-site Metropolis-Hastings chains over traces.

use anyhow::{bail, Result};
use rand::Rng;
use tracing::warn;

use crate::{
    controller::{ExecutionController, TraceMode},
    empirical::Empirical,
    model::Model,
    sampler::Reporter,
    trace::Trace,
};

/// Running tallies of a Metropolis-Hastings chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MhStats {
    pub steps: u64,
    pub accepted: u64,
    /// Controlled variables carried over from the current trace.
    pub samples_reused: u64,
    /// Controlled variables in all candidates.
    pub samples_all: u64,
    /// Steps whose candidate never reached the resampled site.
    pub undefined_transitions: u64,
}

impl MhStats {
    pub fn acceptance_rate(&self) -> f64 {
        if self.steps == 0 {
            return 0.;
        }
        self.accepted as f64 / self.steps as f64
    }

    pub fn reuse_rate(&self) -> f64 {
        if self.samples_all == 0 {
            return 0.;
        }
        self.samples_reused as f64 / self.samples_all as f64
    }
}

fn log_length_and_likelihood_ratio<T>(current: &Trace<T>, candidate: &Trace<T>) -> f64 {
    (current.length_controlled() as f64).ln() - (candidate.length_controlled() as f64).ln()
        + candidate.log_prob_observed()
        - current.log_prob_observed()
}

/// Log acceptance ratio of moving from `current` to `candidate`, without
/// the transition term of the resampled site.
///
/// Corrects for the change in the number of controlled choices, the data
/// likelihood, and the prior of reused choices whose distribution changed
/// because an upstream choice did. The second value is the number of
/// reused choices in `candidate`.
pub fn log_acceptance_ratio<T>(current: &Trace<T>, candidate: &Trace<T>) -> (f64, u64) {
    let mut log_alpha = log_length_and_likelihood_ratio(current, candidate);
    let mut reused = 0;
    for var in candidate.variables_controlled().filter(|v| v.reused) {
        if let Some(previous) = current.get(var.address.as_str()) {
            log_alpha += var.log_prob - previous.log_prob;
        }
        reused += 1;
    }
    (log_alpha, reused)
}

/// A single-site Metropolis-Hastings chain.
///
/// Each call to [`draw`](Self::draw) proposes a candidate by re-executing
/// the model with the current trace as reference and accepts or rejects
/// it.
pub struct MhChain<'a, M: Model, R: Rng> {
    controller: ExecutionController<'a, M>,
    current: Trace<M::Output>,
    rng: R,
    stats: MhStats,
}

impl<'a, M: Model, R: Rng> MhChain<'a, M, R> {
    /// Start a chain at `initial`, or at a fresh execution of the model if
    /// no initial trace is given.
    pub fn new(
        controller: ExecutionController<'a, M>,
        initial: Option<Trace<M::Output>>,
        mut rng: R,
    ) -> Result<Self> {
        if controller.trace_mode() != TraceMode::Posterior
            || !controller.inference_engine().is_metropolis_hastings()
        {
            bail!(
                "Metropolis-Hastings chains need a posterior controller with an MH engine, got {:?} with {}",
                controller.trace_mode(),
                controller.inference_engine()
            );
        }
        let current = match initial {
            Some(trace) => trace,
            None => controller.execute(None, &mut rng)?.trace,
        };
        Ok(Self {
            controller,
            current,
            rng,
            stats: MhStats::default(),
        })
    }

    /// Make one step and return the current trace afterwards, together with
    /// whether the candidate was accepted.
    pub fn draw(&mut self) -> Result<(&Trace<M::Output>, bool)> {
        let execution = self.controller.execute(Some(&self.current), &mut self.rng)?;
        let candidate = execution.trace;

        let (mut log_alpha, reused) = log_acceptance_ratio(&self.current, &candidate);
        self.stats.samples_reused += reused;
        self.stats.samples_all += candidate.length_controlled() as u64;

        match execution.transition_log_prob {
            Some(transition) => log_alpha += transition,
            None => {
                self.stats.undefined_transitions += 1;
                warn!(
                    target_address = ?execution.target,
                    "Trace did not hit the resampled site; the model may not be deterministic given its random choices"
                );
            }
        }

        let u: f64 = self.rng.random();
        // NaN compares false, so degenerate ratios reject
        let accepted = u.ln() < log_alpha;
        self.stats.steps += 1;
        if accepted {
            self.stats.accepted += 1;
            self.current = candidate;
        }
        Ok((&self.current, accepted))
    }

    pub fn current(&self) -> &Trace<M::Output> {
        &self.current
    }

    pub fn into_current(self) -> Trace<M::Output> {
        self.current
    }

    pub fn stats(&self) -> MhStats {
        self.stats
    }
}

/// Run `num_traces` steps and collect the current trace after every step,
/// rejected steps included.
pub(crate) fn run_chain<M, R, U>(
    controller: ExecutionController<'_, M>,
    num_traces: u64,
    initial: Option<Trace<M::Output>>,
    mut map: impl FnMut(&Trace<M::Output>) -> U,
    reporter: &mut Reporter<'_>,
    rng: R,
) -> Result<(Empirical<U>, MhStats)>
where
    M: Model,
    R: Rng,
{
    let mut chain = MhChain::new(controller, initial, rng)?;
    let mut posterior = Empirical::new();
    for draw in 0..num_traces {
        let (trace, _) = chain.draw()?;
        posterior.add(map(trace))?;
        reporter.report(draw + 1, Some(chain.stats().accepted));
    }
    posterior.finalize();
    Ok((posterior, chain.stats()))
}
