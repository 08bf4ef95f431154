use std::sync::Arc;

use rand::{Rng, RngCore};
use rand_distr::Distribution as _;
use statrs::{
    distribution::{ContinuousCDF, Normal as UntruncatedNormal},
    function::gamma::ln_gamma,
};

use super::Distribution;
use crate::{
    error::{invalid_param, Result},
    math::{ln_beta, normal_log_pdf},
    value::Value,
};

const INFLATION_FACTOR: f64 = 3.;
const UNIFORM_KERNEL_WIDTH: f64 = 0.1;

fn check_scale(distribution: &'static str, name: &str, value: f64) -> Result<()> {
    if !(value.is_finite() && value > 0.) {
        return Err(invalid_param(
            distribution,
            format!("{name} must be finite and positive, got {value}"),
        ));
    }
    Ok(())
}

fn check_finite(distribution: &'static str, name: &str, value: f64) -> Result<()> {
    if !value.is_finite() {
        return Err(invalid_param(
            distribution,
            format!("{name} must be finite, got {value}"),
        ));
    }
    Ok(())
}

fn scalar(value: &Value) -> Option<f64> {
    value.as_f64().ok()
}

#[derive(Debug, Clone)]
pub struct Normal {
    mean: f64,
    stddev: f64,
    inner: rand_distr::Normal<f64>,
}

impl Normal {
    pub fn new(mean: f64, stddev: f64) -> Result<Self> {
        check_finite("Normal", "mean", mean)?;
        check_scale("Normal", "stddev", stddev)?;
        let inner =
            rand_distr::Normal::new(mean, stddev).map_err(|e| invalid_param("Normal", e.to_string()))?;
        Ok(Self {
            mean,
            stddev,
            inner,
        })
    }
}

impl Distribution for Normal {
    fn name(&self) -> &'static str {
        "Normal"
    }

    fn sample(&self, rng: &mut dyn RngCore) -> Value {
        Value::Real(self.inner.sample(rng))
    }

    fn log_prob(&self, value: &Value) -> f64 {
        match scalar(value) {
            Some(x) => normal_log_pdf(x, self.mean, self.stddev),
            None => f64::NEG_INFINITY,
        }
    }

    fn mean(&self) -> Option<f64> {
        Some(self.mean)
    }

    fn stddev(&self) -> Option<f64> {
        Some(self.stddev)
    }

    fn inflated(&self) -> Option<Arc<dyn Distribution>> {
        Normal::new(self.mean, self.stddev * INFLATION_FACTOR)
            .ok()
            .map(|d| Arc::new(d) as Arc<dyn Distribution>)
    }

    fn random_walk_kernel(&self, current: &Value) -> Option<Arc<dyn Distribution>> {
        let center = scalar(current)?;
        Normal::new(center, self.stddev)
            .ok()
            .map(|d| Arc::new(d) as Arc<dyn Distribution>)
    }
}

/// Independent normals over a vector value.
#[derive(Debug, Clone)]
pub struct DiagNormal {
    mean: Vec<f64>,
    stddev: Vec<f64>,
}

impl DiagNormal {
    pub fn new(mean: Vec<f64>, stddev: Vec<f64>) -> Result<Self> {
        if mean.is_empty() || mean.len() != stddev.len() {
            return Err(invalid_param(
                "DiagNormal",
                format!(
                    "mean and stddev must be non-empty and of equal length, got {} and {}",
                    mean.len(),
                    stddev.len()
                ),
            ));
        }
        for &m in &mean {
            check_finite("DiagNormal", "mean", m)?;
        }
        for &s in &stddev {
            check_scale("DiagNormal", "stddev", s)?;
        }
        Ok(Self { mean, stddev })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }
}

impl Distribution for DiagNormal {
    fn name(&self) -> &'static str {
        "DiagNormal"
    }

    fn sample(&self, rng: &mut dyn RngCore) -> Value {
        let draws = self
            .mean
            .iter()
            .zip(self.stddev.iter())
            .map(|(&mean, &stddev)| {
                let z: f64 = rng.sample(rand_distr::StandardNormal);
                mean + stddev * z
            })
            .collect();
        Value::Vector(draws)
    }

    fn log_prob(&self, value: &Value) -> f64 {
        let Ok(x) = value.as_slice() else {
            return f64::NEG_INFINITY;
        };
        if x.len() != self.dim() {
            return f64::NEG_INFINITY;
        }
        x.iter()
            .zip(self.mean.iter().zip(self.stddev.iter()))
            .map(|(&x, (&mean, &stddev))| normal_log_pdf(x, mean, stddev))
            .sum()
    }

    fn inflated(&self) -> Option<Arc<dyn Distribution>> {
        let stddev = self.stddev.iter().map(|s| s * INFLATION_FACTOR).collect();
        DiagNormal::new(self.mean.clone(), stddev)
            .ok()
            .map(|d| Arc::new(d) as Arc<dyn Distribution>)
    }

    fn random_walk_kernel(&self, current: &Value) -> Option<Arc<dyn Distribution>> {
        let center = current.as_slice().ok()?;
        DiagNormal::new(center.to_vec(), self.stddev.clone())
            .ok()
            .map(|d| Arc::new(d) as Arc<dyn Distribution>)
    }
}

#[derive(Debug, Clone)]
pub struct Uniform {
    low: f64,
    high: f64,
}

impl Uniform {
    pub fn new(low: f64, high: f64) -> Result<Self> {
        check_finite("Uniform", "low", low)?;
        check_finite("Uniform", "high", high)?;
        if low >= high {
            return Err(invalid_param(
                "Uniform",
                format!("low must be smaller than high, got [{low}, {high}]"),
            ));
        }
        Ok(Self { low, high })
    }
}

impl Distribution for Uniform {
    fn name(&self) -> &'static str {
        "Uniform"
    }

    fn sample(&self, rng: &mut dyn RngCore) -> Value {
        let u: f64 = rng.random();
        Value::Real(self.low + (self.high - self.low) * u)
    }

    fn log_prob(&self, value: &Value) -> f64 {
        match scalar(value) {
            Some(x) if x >= self.low && x <= self.high => -(self.high - self.low).ln(),
            _ => f64::NEG_INFINITY,
        }
    }

    fn mean(&self) -> Option<f64> {
        Some(0.5 * (self.low + self.high))
    }

    fn stddev(&self) -> Option<f64> {
        Some((self.high - self.low) / 12f64.sqrt())
    }

    fn random_walk_kernel(&self, current: &Value) -> Option<Arc<dyn Distribution>> {
        let center = scalar(current)?;
        let stddev = UNIFORM_KERNEL_WIDTH * (self.high - self.low);
        TruncatedNormal::new(center, stddev, self.low, self.high)
            .ok()
            .map(|d| Arc::new(d) as Arc<dyn Distribution>)
    }
}

/// Normal distribution restricted to `[low, high]`.
#[derive(Debug, Clone)]
pub struct TruncatedNormal {
    mean: f64,
    stddev: f64,
    low: f64,
    high: f64,
    untruncated: UntruncatedNormal,
    cdf_low: f64,
    cdf_high: f64,
}

impl TruncatedNormal {
    pub fn new(mean: f64, stddev: f64, low: f64, high: f64) -> Result<Self> {
        check_finite("TruncatedNormal", "mean", mean)?;
        check_scale("TruncatedNormal", "stddev", stddev)?;
        if !(low < high) {
            return Err(invalid_param(
                "TruncatedNormal",
                format!("low must be smaller than high, got [{low}, {high}]"),
            ));
        }
        let untruncated = UntruncatedNormal::new(mean, stddev)
            .map_err(|e| invalid_param("TruncatedNormal", e.to_string()))?;
        let cdf_low = untruncated.cdf(low);
        let cdf_high = untruncated.cdf(high);
        if !(cdf_high > cdf_low) {
            return Err(invalid_param(
                "TruncatedNormal",
                "truncation interval has no probability mass",
            ));
        }
        Ok(Self {
            mean,
            stddev,
            low,
            high,
            untruncated,
            cdf_low,
            cdf_high,
        })
    }

    fn log_normalizer(&self) -> f64 {
        (self.cdf_high - self.cdf_low).ln()
    }
}

impl Distribution for TruncatedNormal {
    fn name(&self) -> &'static str {
        "TruncatedNormal"
    }

    fn sample(&self, rng: &mut dyn RngCore) -> Value {
        // Inverse cdf sampling inside the truncation interval
        let u: f64 = rng.random();
        let p = self.cdf_low + u * (self.cdf_high - self.cdf_low);
        let x = self.untruncated.inverse_cdf(p.clamp(0., 1.));
        Value::Real(x.clamp(self.low, self.high))
    }

    fn log_prob(&self, value: &Value) -> f64 {
        match scalar(value) {
            Some(x) if x >= self.low && x <= self.high => {
                normal_log_pdf(x, self.mean, self.stddev) - self.log_normalizer()
            }
            _ => f64::NEG_INFINITY,
        }
    }

    fn random_walk_kernel(&self, current: &Value) -> Option<Arc<dyn Distribution>> {
        let center = scalar(current)?;
        let stddev = UNIFORM_KERNEL_WIDTH * (self.high - self.low);
        TruncatedNormal::new(center, stddev, self.low, self.high)
            .ok()
            .map(|d| Arc::new(d) as Arc<dyn Distribution>)
    }
}

#[derive(Debug, Clone)]
pub struct Exponential {
    rate: f64,
    inner: rand_distr::Exp<f64>,
}

impl Exponential {
    pub fn new(rate: f64) -> Result<Self> {
        check_scale("Exponential", "rate", rate)?;
        let inner =
            rand_distr::Exp::new(rate).map_err(|e| invalid_param("Exponential", e.to_string()))?;
        Ok(Self { rate, inner })
    }
}

impl Distribution for Exponential {
    fn name(&self) -> &'static str {
        "Exponential"
    }

    fn sample(&self, rng: &mut dyn RngCore) -> Value {
        Value::Real(self.inner.sample(rng))
    }

    fn log_prob(&self, value: &Value) -> f64 {
        match scalar(value) {
            Some(x) if x >= 0. => self.rate.ln() - self.rate * x,
            _ => f64::NEG_INFINITY,
        }
    }

    fn mean(&self) -> Option<f64> {
        Some(1. / self.rate)
    }

    fn stddev(&self) -> Option<f64> {
        Some(1. / self.rate)
    }
}

/// Gamma distribution parameterized by concentration and rate.
#[derive(Debug, Clone)]
pub struct Gamma {
    concentration: f64,
    rate: f64,
    inner: rand_distr::Gamma<f64>,
}

impl Gamma {
    pub fn new(concentration: f64, rate: f64) -> Result<Self> {
        check_scale("Gamma", "concentration", concentration)?;
        check_scale("Gamma", "rate", rate)?;
        let inner = rand_distr::Gamma::new(concentration, 1. / rate)
            .map_err(|e| invalid_param("Gamma", e.to_string()))?;
        Ok(Self {
            concentration,
            rate,
            inner,
        })
    }
}

impl Distribution for Gamma {
    fn name(&self) -> &'static str {
        "Gamma"
    }

    fn sample(&self, rng: &mut dyn RngCore) -> Value {
        Value::Real(self.inner.sample(rng))
    }

    fn log_prob(&self, value: &Value) -> f64 {
        let a = self.concentration;
        let b = self.rate;
        match scalar(value) {
            Some(x) if x > 0. => a * b.ln() - ln_gamma(a) + (a - 1.) * x.ln() - b * x,
            _ => f64::NEG_INFINITY,
        }
    }

    fn mean(&self) -> Option<f64> {
        Some(self.concentration / self.rate)
    }

    fn stddev(&self) -> Option<f64> {
        Some(self.concentration.sqrt() / self.rate)
    }
}

#[derive(Debug, Clone)]
pub struct Beta {
    alpha: f64,
    beta: f64,
    inner: rand_distr::Beta<f64>,
}

impl Beta {
    pub fn new(alpha: f64, beta: f64) -> Result<Self> {
        check_scale("Beta", "alpha", alpha)?;
        check_scale("Beta", "beta", beta)?;
        let inner =
            rand_distr::Beta::new(alpha, beta).map_err(|e| invalid_param("Beta", e.to_string()))?;
        Ok(Self { alpha, beta, inner })
    }
}

impl Distribution for Beta {
    fn name(&self) -> &'static str {
        "Beta"
    }

    fn sample(&self, rng: &mut dyn RngCore) -> Value {
        Value::Real(self.inner.sample(rng))
    }

    fn log_prob(&self, value: &Value) -> f64 {
        match scalar(value) {
            Some(x) if x > 0. && x < 1. => {
                (self.alpha - 1.) * x.ln() + (self.beta - 1.) * (1. - x).ln()
                    - ln_beta(self.alpha, self.beta)
            }
            _ => f64::NEG_INFINITY,
        }
    }

    fn mean(&self) -> Option<f64> {
        Some(self.alpha / (self.alpha + self.beta))
    }

    fn stddev(&self) -> Option<f64> {
        let total = self.alpha + self.beta;
        Some((self.alpha * self.beta / (total * total * (total + 1.))).sqrt())
    }
}
