use std::sync::Arc;

use rand::{distr::weighted::WeightedIndex, Rng, RngCore};
use rand_distr::Distribution as _;

use super::Distribution;
use crate::{
    error::{invalid_param, Result},
    math::ln_factorial,
    value::Value,
};

/// Read a value as a category / count index.
fn index(value: &Value) -> Option<i64> {
    match value {
        Value::Int(k) => Some(*k),
        Value::Bool(b) => Some(*b as i64),
        Value::Real(x) if x.fract() == 0. => Some(*x as i64),
        _ => None,
    }
}

/// Draws `true` with probability `p`.
#[derive(Debug, Clone)]
pub struct Bernoulli {
    p: f64,
}

impl Bernoulli {
    pub fn new(p: f64) -> Result<Self> {
        if !(0. ..=1.).contains(&p) {
            return Err(invalid_param(
                "Bernoulli",
                format!("p must be in [0, 1], got {p}"),
            ));
        }
        Ok(Self { p })
    }
}

impl Distribution for Bernoulli {
    fn name(&self) -> &'static str {
        "Bernoulli"
    }

    fn sample(&self, rng: &mut dyn RngCore) -> Value {
        Value::Bool(rng.random_bool(self.p))
    }

    fn log_prob(&self, value: &Value) -> f64 {
        match index(value) {
            Some(1) => self.p.ln(),
            Some(0) => (1. - self.p).ln(),
            _ => f64::NEG_INFINITY,
        }
    }

    fn mean(&self) -> Option<f64> {
        Some(self.p)
    }

    fn stddev(&self) -> Option<f64> {
        Some((self.p * (1. - self.p)).sqrt())
    }
}

/// Distribution over `0..probs.len()`. Probabilities are normalized on
/// construction.
#[derive(Debug, Clone)]
pub struct Categorical {
    probs: Vec<f64>,
    index: WeightedIndex<f64>,
}

impl Categorical {
    pub fn new(probs: Vec<f64>) -> Result<Self> {
        if probs.is_empty() {
            return Err(invalid_param("Categorical", "needs at least one category"));
        }
        if probs.iter().any(|p| !p.is_finite() || *p < 0.) {
            return Err(invalid_param(
                "Categorical",
                "probabilities must be finite and non-negative",
            ));
        }
        let total: f64 = probs.iter().sum();
        if total <= 0. {
            return Err(invalid_param(
                "Categorical",
                "probabilities must not all be zero",
            ));
        }
        let probs: Vec<f64> = probs.into_iter().map(|p| p / total).collect();
        let index =
            WeightedIndex::new(&probs).map_err(|e| invalid_param("Categorical", e.to_string()))?;
        Ok(Self { probs, index })
    }

    pub fn uniform(num_categories: usize) -> Result<Self> {
        Self::new(vec![1.; num_categories])
    }

    pub fn num_categories(&self) -> usize {
        self.probs.len()
    }

    pub fn probs(&self) -> &[f64] {
        &self.probs
    }
}

impl Distribution for Categorical {
    fn name(&self) -> &'static str {
        "Categorical"
    }

    fn sample(&self, rng: &mut dyn RngCore) -> Value {
        Value::Int(self.index.sample(rng) as i64)
    }

    fn log_prob(&self, value: &Value) -> f64 {
        match index(value) {
            Some(k) if k >= 0 && (k as usize) < self.probs.len() => self.probs[k as usize].ln(),
            _ => f64::NEG_INFINITY,
        }
    }

    fn inflated(&self) -> Option<Arc<dyn Distribution>> {
        Categorical::uniform(self.num_categories())
            .ok()
            .map(|d| Arc::new(d) as Arc<dyn Distribution>)
    }
}

#[derive(Debug, Clone)]
pub struct Poisson {
    rate: f64,
    inner: rand_distr::Poisson<f64>,
}

impl Poisson {
    pub fn new(rate: f64) -> Result<Self> {
        if !(rate.is_finite() && rate > 0.) {
            return Err(invalid_param(
                "Poisson",
                format!("rate must be finite and positive, got {rate}"),
            ));
        }
        let inner =
            rand_distr::Poisson::new(rate).map_err(|e| invalid_param("Poisson", e.to_string()))?;
        Ok(Self { rate, inner })
    }
}

impl Distribution for Poisson {
    fn name(&self) -> &'static str {
        "Poisson"
    }

    fn sample(&self, rng: &mut dyn RngCore) -> Value {
        let k: f64 = self.inner.sample(rng);
        Value::Int(k as i64)
    }

    fn log_prob(&self, value: &Value) -> f64 {
        match index(value) {
            Some(k) if k >= 0 => k as f64 * self.rate.ln() - self.rate - ln_factorial(k as u64),
            _ => f64::NEG_INFINITY,
        }
    }

    fn mean(&self) -> Option<f64> {
        Some(self.rate)
    }

    fn stddev(&self) -> Option<f64> {
        Some(self.rate.sqrt())
    }
}
