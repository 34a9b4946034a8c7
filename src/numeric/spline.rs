//! Natural cubic spline interpolation.

use std::cmp::Ordering;

use super::NumericError;

/// Piecewise cubic interpolant with zero second derivative at both ends.
#[derive(Clone, Debug)]
pub struct CubicSpline {
    knots: Vec<f64>,
    // Polynomial coefficients per segment: a + b·t + c·t² + d·t³ with t = x - knot.
    coefficients: Vec<[f64; 4]>,
}

impl CubicSpline {
    /// Returns the natural cubic spline through the points `(x[i], y[i])`.
    ///
    /// Needs at least three points with strictly increasing abscissae.
    pub fn natural(x: &[f64], y: &[f64]) -> Result<Self, NumericError> {
        if x.len() != y.len() {
            return Err(NumericError::LengthMismatch {
                x: x.len(),
                y: y.len(),
            });
        }
        if x.len() < 3 {
            return Err(NumericError::TooFewPoints {
                required: 3,
                actual: x.len(),
            });
        }
        if let Some(index) = x.windows(2).position(|pair| pair[1].partial_cmp(&pair[0]) != Some(Ordering::Greater)) {
            return Err(NumericError::NonMonotonic { index: index + 1 });
        }

        let n = x.len() - 1;
        let h: Vec<f64> = x.windows(2).map(|pair| pair[1] - pair[0]).collect();
        let mut mu = vec![0.0; n];
        let mut z = vec![0.0; n + 1];
        for i in 1..n {
            let g = 2.0 * (x[i + 1] - x[i - 1]) - h[i - 1] * mu[i - 1];
            mu[i] = h[i] / g;
            z[i] = (3.0 * (y[i + 1] * h[i - 1] - y[i] * (x[i + 1] - x[i - 1]) + y[i - 1] * h[i])
                / (h[i - 1] * h[i])
                - h[i - 1] * z[i - 1])
                / g;
        }

        let mut c = vec![0.0; n + 1];
        let mut coefficients = vec![[0.0; 4]; n];
        for j in (0..n).rev() {
            c[j] = z[j] - mu[j] * c[j + 1];
            let b = (y[j + 1] - y[j]) / h[j] - h[j] * (c[j + 1] + 2.0 * c[j]) / 3.0;
            let d = (c[j + 1] - c[j]) / (3.0 * h[j]);
            coefficients[j] = [y[j], b, c[j], d];
        }

        Ok(CubicSpline {
            knots: x.to_vec(),
            coefficients,
        })
    }

    /// Evaluate the spline. Points outside the knots use the end segments.
    pub fn value(&self, x: f64) -> f64 {
        let segment = self
            .knots
            .partition_point(|knot| *knot <= x)
            .saturating_sub(1)
            .min(self.coefficients.len() - 1);
        let t = x - self.knots[segment];
        let [a, b, c, d] = self.coefficients[segment];
        a + t * (b + t * (c + t * d))
    }
}
