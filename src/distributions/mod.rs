//! Probability distributions that random-choice sites draw from.
//!
//! The [`Distribution`] trait is object safe so traces can hold the
//! distribution of every recorded choice behind an `Arc`.

mod continuous;
mod discrete;

use std::{fmt::Debug, sync::Arc};

use rand::RngCore;

use crate::value::Value;

pub use continuous::{Beta, DiagNormal, Exponential, Gamma, Normal, TruncatedNormal, Uniform};
pub use discrete::{Bernoulli, Categorical, Poisson};

pub trait Distribution: Debug + Send + Sync {
    /// Short family name, part of automatically generated addresses.
    fn name(&self) -> &'static str;

    fn sample(&self, rng: &mut dyn RngCore) -> Value;

    /// Log density (or mass) of `value`, summed over vector dimensions.
    ///
    /// Values outside the support or of the wrong kind have log
    /// probability `-inf`.
    fn log_prob(&self, value: &Value) -> f64;

    fn mean(&self) -> Option<f64> {
        None
    }

    fn stddev(&self) -> Option<f64> {
        None
    }

    /// A wider version of this distribution used for exploratory prior
    /// sampling. `None` if the family does not support inflation.
    fn inflated(&self) -> Option<Arc<dyn Distribution>> {
        None
    }

    /// Local proposal kernel centered at `current` for random-walk
    /// Metropolis-Hastings. `None` means the site is redrawn from the prior.
    fn random_walk_kernel(&self, _current: &Value) -> Option<Arc<dyn Distribution>> {
        None
    }
}

impl<D: Distribution + ?Sized> Distribution for Arc<D> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn sample(&self, rng: &mut dyn RngCore) -> Value {
        (**self).sample(rng)
    }

    fn log_prob(&self, value: &Value) -> f64 {
        (**self).log_prob(value)
    }

    fn mean(&self) -> Option<f64> {
        (**self).mean()
    }

    fn stddev(&self) -> Option<f64> {
        (**self).stddev()
    }

    fn inflated(&self) -> Option<Arc<dyn Distribution>> {
        (**self).inflated()
    }

    fn random_walk_kernel(&self, current: &Value) -> Option<Arc<dyn Distribution>> {
        (**self).random_walk_kernel(current)
    }
}
