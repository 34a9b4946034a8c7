//! Numerical building blocks for the integrating kernels.

pub mod quadrature;
pub mod regression;
pub mod spline;

use thiserror::Error;

/// Numerical failure. Kernels turn these into NaN results rather than stage failures.
#[derive(Debug, Error, PartialEq)]
pub enum NumericError {
    /// Too few points to build an interpolant or fit
    #[error("{actual} points given, at least {required} needed")]
    TooFewPoints { required: usize, actual: usize },

    /// Abscissae are not strictly increasing
    #[error("abscissae must be strictly increasing (index {index})")]
    NonMonotonic { index: usize },

    /// Abscissae and ordinates have different lengths
    #[error("{x} abscissae given for {y} ordinates")]
    LengthMismatch { x: usize, y: usize },

    /// Quadrature did not converge within the evaluation budget
    #[error("integration exceeded {max} function evaluations")]
    TooManyEvaluations { max: usize },
}

pub use quadrature::{IterativeLegendreGauss, MAX_EVALUATIONS};
pub use regression::{porod_fit, LinearFit};
pub use spline::CubicSpline;

/// Integrate the natural cubic spline through `(x, y)` over `[lower, upper]`.
///
/// # Arguments
///
/// * `x`: Strictly increasing abscissae
/// * `y`: Ordinates
/// * `lower`: Lower integration bound
/// * `upper`: Upper integration bound
pub fn integrate_spline(x: &[f64], y: &[f64], lower: f64, upper: f64) -> Result<f64, NumericError> {
    let spline = CubicSpline::natural(x, y)?;
    IterativeLegendreGauss::default().integrate(|t| spline.value(t), lower, upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrate_linear_data() {
        // y = 2x on [0, 3]
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [0.0, 2.0, 4.0, 6.0];
        let integral = integrate_spline(&x, &y, 0.0, 3.0).unwrap();
        assert!((integral - 9.0).abs() < 1e-9);
    }

    #[test]
    fn integrate_single_point_fails() {
        assert_eq!(
            Err(NumericError::TooFewPoints {
                required: 3,
                actual: 1
            }),
            integrate_spline(&[0.0], &[1.0], 0.0, 0.0)
        );
    }
}
