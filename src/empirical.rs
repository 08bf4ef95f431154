//! Weighted collections of samples.

use std::fmt;

use rand::{distr::weighted::WeightedIndex, Rng};
use rand_distr::Distribution as _;

use crate::{
    error::{PplError, Result},
    math::logsumexp,
};

/// A weighted, finalizable collection of posterior samples.
///
/// Weights are accumulated in log space. [`finalize`](Self::finalize)
/// normalizes them exactly once and locks the collection. Statistics that
/// depend on normalized weights are only available afterwards.
#[derive(Clone)]
pub struct Empirical<T> {
    values: Vec<T>,
    log_weights: Vec<f64>,
    weights: Vec<f64>,
    effective_sample_size: f64,
    finalized: bool,
    name: String,
}

impl<T> Default for Empirical<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Empirical<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Empirical")
            .field("name", &self.name)
            .field("len", &self.values.len())
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl<T> Empirical<T> {
    pub fn new() -> Self {
        Empirical {
            values: Vec::new(),
            log_weights: Vec::new(),
            weights: Vec::new(),
            effective_sample_size: 0.,
            finalized: false,
            name: "Empirical".to_string(),
        }
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Empirical {
            name: name.into(),
            ..Self::new()
        }
    }

    /// Add a sample with weight one.
    pub fn add(&mut self, value: T) -> Result<()> {
        self.add_log_weighted(value, 0.)
    }

    pub fn add_weighted(&mut self, value: T, weight: f64) -> Result<()> {
        if weight.is_nan() || weight < 0. || weight.is_infinite() {
            return Err(PplError::InvalidWeight(weight));
        }
        self.add_log_weighted(value, weight.ln())
    }

    /// Add a sample with weight `exp(log_weight)`. A log weight of `-inf`
    /// is a sample with zero weight.
    pub fn add_log_weighted(&mut self, value: T, log_weight: f64) -> Result<()> {
        if self.finalized {
            return Err(PplError::IllegalPosteriorMutation);
        }
        if log_weight.is_nan() || log_weight == f64::INFINITY {
            return Err(PplError::InvalidWeight(log_weight));
        }
        self.values.push(value);
        self.log_weights.push(log_weight);
        Ok(())
    }

    /// Normalize the weights to sum to one and lock the collection.
    ///
    /// Calling this again has no effect. If every sample has zero weight
    /// the normalized weights are all zero and the effective sample size
    /// is zero.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        let total = logsumexp(&self.log_weights);
        if total == f64::NEG_INFINITY {
            self.weights = vec![0.; self.log_weights.len()];
            self.effective_sample_size = 0.;
        } else {
            self.weights = self
                .log_weights
                .iter()
                .map(|&lw| (lw - total).exp())
                .collect();
            let sum: f64 = self.weights.iter().sum();
            let sum_sq: f64 = self.weights.iter().map(|w| w * w).sum();
            self.effective_sample_size = sum * sum / sum_sq;
        }
        self.finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn effective_sample_size(&self) -> Result<f64> {
        if !self.finalized {
            return Err(PplError::PosteriorNotFinalized);
        }
        Ok(self.effective_sample_size)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn into_values(self) -> Vec<T> {
        self.values
    }

    /// Unnormalized log weights in insertion order.
    pub fn log_weights(&self) -> &[f64] {
        &self.log_weights
    }

    /// Normalized weights in insertion order.
    pub fn weights(&self) -> Result<&[f64]> {
        if !self.finalized {
            return Err(PplError::PosteriorNotFinalized);
        }
        Ok(&self.weights)
    }

    fn weight(&self, idx: usize) -> f64 {
        if self.finalized {
            self.weights[idx]
        } else {
            self.log_weights[idx].exp()
        }
    }

    /// Sample `idx` with its weight, normalized once finalized.
    pub fn get(&self, idx: usize) -> Option<(&T, f64)> {
        self.values.get(idx).map(|value| (value, self.weight(idx)))
    }

    /// Samples with their weights, normalized once finalized.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (&T, f64)> + '_ {
        self.values
            .iter()
            .enumerate()
            .map(|(i, value)| (value, self.weight(i)))
    }

    /// Concatenate several collections, for example independent chains.
    ///
    /// Unnormalized log weights are kept, so runs of equal length combine
    /// into the same weighting as one long run. The result is finalized.
    pub fn combine(posteriors: impl IntoIterator<Item = Empirical<T>>) -> Empirical<T> {
        let mut combined = Empirical::with_name("Combined");
        for posterior in posteriors {
            combined.values.extend(posterior.values);
            combined.log_weights.extend(posterior.log_weights);
        }
        combined.finalize();
        combined
    }

    /// Apply `f` to every sample, keeping the weights, name and state.
    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> Empirical<U> {
        Empirical {
            values: self.values.iter().map(&mut f).collect(),
            log_weights: self.log_weights.clone(),
            weights: self.weights.clone(),
            effective_sample_size: self.effective_sample_size,
            finalized: self.finalized,
            name: self.name.clone(),
        }
    }

    fn check_usable(&self) -> Result<()> {
        if !self.finalized {
            return Err(PplError::PosteriorNotFinalized);
        }
        if self.effective_sample_size == 0. {
            return Err(PplError::EmptyPosterior);
        }
        Ok(())
    }

    /// Weighted mean of `f` over the samples.
    pub fn expectation(&self, f: impl Fn(&T) -> f64) -> Result<f64> {
        self.check_usable()?;
        Ok(self
            .values
            .iter()
            .zip(&self.weights)
            .map(|(value, w)| w * f(value))
            .sum())
    }

    /// Weighted variance of `f` over the samples.
    pub fn variance_of(&self, f: impl Fn(&T) -> f64) -> Result<f64> {
        let mean = self.expectation(&f)?;
        self.expectation(|value| {
            let diff = f(value) - mean;
            diff * diff
        })
    }

    /// Draw one sample according to the normalized weights.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<&T> {
        self.check_usable()?;
        let index = WeightedIndex::new(&self.weights).map_err(|_| PplError::EmptyPosterior)?;
        Ok(&self.values[index.sample(rng)])
    }
}

impl<T: Clone> Empirical<T> {
    /// Draw `num_samples` samples with replacement into an unweighted,
    /// finalized collection.
    pub fn resample<R: Rng + ?Sized>(&self, num_samples: usize, rng: &mut R) -> Result<Empirical<T>> {
        self.check_usable()?;
        let index = WeightedIndex::new(&self.weights).map_err(|_| PplError::EmptyPosterior)?;
        let mut resampled = Empirical::with_name(format!("{}, resampled", self.name));
        for _ in 0..num_samples {
            resampled.add(self.values[index.sample(rng)].clone())?;
        }
        resampled.finalize();
        Ok(resampled)
    }

    /// Keep every `step`-th sample, starting with the first.
    pub fn thin(&self, step: usize) -> Empirical<T> {
        let step = step.max(1);
        let mut thinned = Empirical::with_name(self.name.clone());
        for (value, &log_weight) in self
            .values
            .iter()
            .zip(&self.log_weights)
            .step_by(step)
        {
            thinned.values.push(value.clone());
            thinned.log_weights.push(log_weight);
        }
        if self.finalized {
            thinned.finalize();
        }
        thinned
    }
}

impl Empirical<f64> {
    pub fn mean(&self) -> Result<f64> {
        self.expectation(|&x| x)
    }

    pub fn variance(&self) -> Result<f64> {
        self.variance_of(|&x| x)
    }

    pub fn stddev(&self) -> Result<f64> {
        Ok(self.variance()?.sqrt())
    }
}
