//! Per-site proposal policies.
//!
//! Every inference engine decides, for each controlled random choice it
//! encounters, where the value comes from. The execution controller picks
//! one [`Proposer`] per execution and asks it at every controlled site.

use std::sync::Arc;

use anyhow::Result;
use rand::{Rng, RngCore};

use crate::{
    address::Address,
    controller::PriorInflation,
    distributions::Distribution,
    trace::{ObservedData, Trace, Variable},
    value::Value,
};

/// Everything a proposer may look at for one controlled site.
pub struct SiteRequest<'a> {
    pub address: &'a Address,
    pub prior: &'a Arc<dyn Distribution>,
    pub observed: &'a ObservedData,
    /// Variables recorded so far in the current execution.
    pub trace: &'a [Variable],
}

/// Outcome of proposing one controlled site.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub value: Value,
    /// Log probability of `value` under the prior of the site.
    pub log_prob: f64,
    /// `log p(value) - log q(value)` if the value was drawn from a proposal
    /// `q` other than the prior, otherwise zero.
    pub log_weight: f64,
    pub reused: bool,
}

impl Proposal {
    fn from_prior(prior: &dyn Distribution, rng: &mut dyn RngCore) -> Self {
        let value = prior.sample(rng);
        let log_prob = prior.log_prob(&value);
        Proposal {
            value,
            log_prob,
            log_weight: 0.,
            reused: false,
        }
    }

    fn from_proposal(
        prior: &dyn Distribution,
        proposal: &dyn Distribution,
        rng: &mut dyn RngCore,
    ) -> Self {
        let value = proposal.sample(rng);
        let log_prob = prior.log_prob(&value);
        let log_weight = log_prob - proposal.log_prob(&value);
        Proposal {
            value,
            log_prob,
            log_weight,
            reused: false,
        }
    }
}

pub trait Proposer {
    fn propose(&mut self, request: SiteRequest<'_>, rng: &mut dyn RngCore) -> Result<Proposal>;

    /// Log probability ratio of the single-site transition, once the
    /// resampled site was visited. `None` for proposers that do not
    /// resample a single site, or if the site was never reached.
    fn transition_log_prob(&self) -> Option<f64> {
        None
    }

    /// The address this proposer resamples, if any.
    fn target(&self) -> Option<&Address> {
        None
    }
}

/// Draw every site from its prior, optionally from an inflated prior.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorProposer {
    inflation: PriorInflation,
}

impl PriorProposer {
    pub fn new(inflation: PriorInflation) -> Self {
        Self { inflation }
    }
}

impl Proposer for PriorProposer {
    fn propose(&mut self, request: SiteRequest<'_>, rng: &mut dyn RngCore) -> Result<Proposal> {
        let prior = request.prior.as_ref();
        let inflated = match self.inflation {
            PriorInflation::Enabled => prior.inflated(),
            PriorInflation::Disabled => None,
        };
        Ok(match inflated {
            Some(inflated) => Proposal::from_proposal(prior, inflated.as_ref(), rng),
            None => Proposal::from_prior(prior, rng),
        })
    }
}

/// A trained amortized-inference network.
///
/// Implementations must not change their parameters while they are used
/// for inference; they are shared between concurrent runs.
pub trait ProposalNetwork: Send + Sync {
    /// Proposal distribution for the site at `address`, given the prior of
    /// the site, the observed data and the choices made so far.
    fn proposal(
        &self,
        address: &Address,
        prior: &Arc<dyn Distribution>,
        observed: &ObservedData,
        trace: &[Variable],
    ) -> Result<Arc<dyn Distribution>>;
}

/// Draw from the proposals of a [`ProposalNetwork`] and keep track of the
/// importance weight correction.
pub struct NetworkProposer<'n> {
    network: &'n dyn ProposalNetwork,
}

impl<'n> NetworkProposer<'n> {
    pub fn new(network: &'n dyn ProposalNetwork) -> Self {
        Self { network }
    }
}

impl Proposer for NetworkProposer<'_> {
    fn propose(&mut self, request: SiteRequest<'_>, rng: &mut dyn RngCore) -> Result<Proposal> {
        let proposal = self.network.proposal(
            request.address,
            request.prior,
            request.observed,
            request.trace,
        )?;
        Ok(Proposal::from_proposal(
            request.prior.as_ref(),
            proposal.as_ref(),
            rng,
        ))
    }
}

/// Single-site Metropolis-Hastings proposals.
///
/// Reuses every controlled value of the reference trace except for one
/// uniformly chosen target address. The target is redrawn from its prior
/// (lightweight MH) or from a random-walk kernel around its previous value
/// (random-walk MH, for families that provide a kernel).
pub struct MetropolisHastingsProposer<'r, T> {
    reference: Option<&'r Trace<T>>,
    target: Option<Address>,
    random_walk: bool,
    transition_log_prob: Option<f64>,
}

impl<'r, T> MetropolisHastingsProposer<'r, T> {
    pub fn new<R: Rng + ?Sized>(
        reference: Option<&'r Trace<T>>,
        random_walk: bool,
        rng: &mut R,
    ) -> Self {
        let target = reference.and_then(|trace| {
            let num_controlled = trace.length_controlled();
            if num_controlled == 0 {
                return None;
            }
            let idx = rng.random_range(0..num_controlled);
            trace
                .variables_controlled()
                .nth(idx)
                .map(|v| v.address.clone())
        });
        Self {
            reference,
            target,
            random_walk,
            transition_log_prob: None,
        }
    }

    fn resample(
        &mut self,
        prior: &dyn Distribution,
        previous: Option<&Variable>,
        rng: &mut dyn RngCore,
    ) -> Proposal {
        self.transition_log_prob = Some(0.);
        if !self.random_walk {
            return Proposal::from_prior(prior, rng);
        }
        let Some(previous) = previous else {
            return Proposal::from_prior(prior, rng);
        };
        let Some(forward) = prior.random_walk_kernel(&previous.value) else {
            return Proposal::from_prior(prior, rng);
        };

        let value = forward.sample(rng);
        let log_prob = prior.log_prob(&value);
        let log_reverse = prior
            .random_walk_kernel(&value)
            .map(|reverse| reverse.log_prob(&previous.value))
            .unwrap_or(f64::NEG_INFINITY);
        let log_forward = forward.log_prob(&value);
        self.transition_log_prob =
            Some(log_prob + log_reverse - previous.log_prob - log_forward);

        Proposal {
            value,
            log_prob,
            log_weight: 0.,
            reused: false,
        }
    }
}

impl<T> Proposer for MetropolisHastingsProposer<'_, T> {
    fn propose(&mut self, request: SiteRequest<'_>, rng: &mut dyn RngCore) -> Result<Proposal> {
        let prior = request.prior.as_ref();
        let Some(reference) = self.reference else {
            return Ok(Proposal::from_prior(prior, rng));
        };
        let previous = reference
            .get(request.address.as_str())
            .filter(|v| v.controlled);

        if self.target.as_ref() == Some(request.address) {
            return Ok(self.resample(prior, previous, rng));
        }

        Ok(match previous {
            Some(previous) => {
                let value = previous.value.clone();
                let log_prob = prior.log_prob(&value);
                Proposal {
                    value,
                    log_prob,
                    log_weight: 0.,
                    reused: true,
                }
            }
            None => Proposal::from_prior(prior, rng),
        })
    }

    fn transition_log_prob(&self) -> Option<f64> {
        self.transition_log_prob
    }

    fn target(&self) -> Option<&Address> {
        self.target.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{Normal, Uniform};
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn controlled(address: &str, distribution: Arc<dyn Distribution>, value: f64) -> Variable {
        let value = Value::Real(value);
        Variable {
            address: Address::new(address),
            name: address.to_string(),
            log_prob: distribution.log_prob(&value),
            distribution,
            value,
            controlled: true,
            observed: false,
            reused: false,
            replaced: false,
        }
    }

    fn request<'a>(
        address: &'a Address,
        prior: &'a Arc<dyn Distribution>,
    ) -> SiteRequest<'a> {
        SiteRequest {
            address,
            prior,
            observed: &crate::trace::NO_OBSERVATIONS,
            trace: &[],
        }
    }

    #[test]
    fn inflated_prior_carries_weight() {
        let mut rng = StdRng::seed_from_u64(1);
        let prior: Arc<dyn Distribution> = Arc::new(Normal::new(0., 1.).unwrap());
        let address = Address::new("x");
        let mut proposer = PriorProposer::new(PriorInflation::Enabled);
        let proposal = proposer.propose(request(&address, &prior), &mut rng).unwrap();
        let wide = Normal::new(0., 3.).unwrap();
        assert_abs_diff_eq!(
            proposal.log_weight,
            prior.log_prob(&proposal.value) - wide.log_prob(&proposal.value),
            epsilon = 1e-12
        );

        let mut proposer = PriorProposer::new(PriorInflation::Disabled);
        let proposal = proposer.propose(request(&address, &prior), &mut rng).unwrap();
        assert_eq!(proposal.log_weight, 0.);
    }

    #[test]
    fn random_walk_transition_accounts_for_asymmetry() {
        let mut rng = StdRng::seed_from_u64(5);
        let prior: Arc<dyn Distribution> = Arc::new(Uniform::new(0., 1.).unwrap());
        let previous = controlled("u", prior.clone(), 0.97);
        let trace = Trace::new(vec![previous.clone()], (), 0., true);
        let mut proposer = MetropolisHastingsProposer::new(Some(&trace), true, &mut rng);
        assert_eq!(proposer.target(), Some(&Address::new("u")));
        assert_eq!(proposer.transition_log_prob(), None);

        let proposal = proposer
            .propose(request(&previous.address, &prior), &mut rng)
            .unwrap();
        assert!(!proposal.reused);

        let forward = prior.random_walk_kernel(&previous.value).unwrap();
        let reverse = prior.random_walk_kernel(&proposal.value).unwrap();
        let expected = reverse.log_prob(&previous.value) - forward.log_prob(&proposal.value);
        assert_abs_diff_eq!(
            proposer.transition_log_prob().unwrap(),
            expected,
            epsilon = 1e-10
        );
    }

    #[test]
    fn lightweight_reuses_non_target_sites() {
        let mut rng = StdRng::seed_from_u64(11);
        let prior: Arc<dyn Distribution> = Arc::new(Normal::new(0., 1.).unwrap());
        let a = controlled("a", prior.clone(), 0.3);
        let b = controlled("b", prior.clone(), -1.2);
        let trace = Trace::new(vec![a.clone(), b.clone()], (), 0., true);
        let mut proposer = MetropolisHastingsProposer::new(Some(&trace), false, &mut rng);
        let target = proposer.target().cloned().unwrap();

        for var in [&a, &b] {
            let proposal = proposer
                .propose(request(&var.address, &prior), &mut rng)
                .unwrap();
            if var.address == target {
                assert!(!proposal.reused);
            } else {
                assert!(proposal.reused);
                assert_eq!(proposal.value, var.value);
                assert_eq!(proposal.log_prob, var.log_prob);
            }
        }
        assert_eq!(proposer.transition_log_prob(), Some(0.));
    }

    #[test]
    fn no_reference_means_prior_draws() {
        let mut rng = StdRng::seed_from_u64(2);
        let prior: Arc<dyn Distribution> = Arc::new(Normal::new(0., 1.).unwrap());
        let address = Address::new("x");
        let mut proposer = MetropolisHastingsProposer::<()>::new(None, false, &mut rng);
        assert!(proposer.target().is_none());
        let proposal = proposer.propose(request(&address, &prior), &mut rng).unwrap();
        assert!(!proposal.reused);
        assert_eq!(proposer.transition_log_prob(), None);
    }
}
