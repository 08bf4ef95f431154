use std::f64::consts::PI;

use statrs::function::gamma::ln_gamma;

/// Numerically stable `log(sum(exp(x)))`.
///
/// Returns `-inf` for an empty slice or if every entry is `-inf`.
pub(crate) fn logsumexp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|&x| (x - max).exp()).sum();
    max + sum.ln()
}

#[inline]
pub(crate) fn normal_log_pdf(x: f64, mean: f64, stddev: f64) -> f64 {
    let z = (x - mean) / stddev;
    -0.5 * z * z - stddev.ln() - 0.5 * (2. * PI).ln()
}

#[inline]
pub(crate) fn ln_factorial(k: u64) -> f64 {
    ln_gamma(k as f64 + 1.)
}

#[inline]
pub(crate) fn ln_beta(a: f64, b: f64) -> f64 {
    ln_gamma(a) + ln_gamma(b) - ln_gamma(a + b)
}
