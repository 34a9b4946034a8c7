//! Uncertainty propagation.
//!
//! Kernels work on variances. The slice store keeps standard deviations, so values are squared
//! on the way in and square-rooted on the way out. When a dataset carries no uncertainty,
//! counting statistics apply: the variance of a sample is its (non-negative) intensity.

/// Counting-statistics variance of each value, `max(value, 0)`.
pub fn counting_statistics(values: &[f32]) -> Vec<f64> {
    values.iter().map(|value| f64::from(*value).max(0.0)).collect()
}

/// Variances from stored standard deviations.
pub fn variances_from_errors(errors: &[f64]) -> Vec<f64> {
    errors.iter().map(|error| error * error).collect()
}

/// Standard deviations to store for the given variances.
pub fn errors_from_variances(variances: &[f64]) -> Vec<f64> {
    variances.iter().map(|variance| variance.sqrt()).collect()
}

/// Additive rule: the variance of `a ± b` is `var(a) + var(b)`.
#[inline]
pub fn add(variance_a: f64, variance_b: f64) -> f64 {
    variance_a + variance_b
}

/// Multiplicative rule for an exact factor: the variance of `a·k` is `var(a)·k²`.
#[inline]
pub fn scale(variance: f64, factor: f64) -> f64 {
    variance * factor * factor
}

/// Product rule for two uncertain factors: `var(a·b) = b²·var(a) + a²·var(b)`.
#[inline]
pub fn product(a: f64, variance_a: f64, b: f64, variance_b: f64) -> f64 {
    b * b * variance_a + a * a * variance_b
}
