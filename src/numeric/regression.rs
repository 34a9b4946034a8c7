//! Ordinary least-squares line fits, including the Porod tail fit.

/// Minimum number of points in a Porod fit window.
pub const MIN_POROD_POINTS: usize = 50;

/// Straight-line fit `y = intercept + slope·x`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinearFit {
    pub points: usize,
    pub slope: f64,
    pub intercept: f64,
    /// Standard error of the slope. NaN with fewer than three points.
    pub slope_std_err: f64,
    /// Standard error of the intercept. NaN with fewer than three points.
    pub intercept_std_err: f64,
}

impl LinearFit {
    /// Least-squares fit through the points `(x[i], y[i])`.
    ///
    /// Returns `None` with fewer than two points or when all abscissae coincide.
    pub fn fit(x: &[f64], y: &[f64]) -> Option<Self> {
        let points = x.len().min(y.len());
        if points < 2 {
            return None;
        }
        let n = points as f64;
        let x_mean = x[..points].iter().sum::<f64>() / n;
        let y_mean = y[..points].iter().sum::<f64>() / n;
        let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
        for (x, y) in x.iter().zip(y) {
            let (dx, dy) = (x - x_mean, y - y_mean);
            sxx += dx * dx;
            sxy += dx * dy;
            syy += dy * dy;
        }
        if sxx == 0.0 {
            return None;
        }
        let slope = sxy / sxx;
        let intercept = y_mean - slope * x_mean;
        let (slope_std_err, intercept_std_err) = if points > 2 {
            let mse = f64::max(syy - sxy * sxy / sxx, 0.0) / (n - 2.0);
            (
                (mse / sxx).sqrt(),
                (mse * (1.0 / n + x_mean * x_mean / sxx)).sqrt(),
            )
        } else {
            (f64::NAN, f64::NAN)
        };
        Some(LinearFit {
            points,
            slope,
            intercept,
            slope_std_err,
            intercept_std_err,
        })
    }
}

/// Fit the Porod plot `q⁴·I(q)` against `q` over its flattest region.
///
/// Every contiguous window of at least [MIN_POROD_POINTS] points is considered and the window
/// with the smallest absolute slope wins. Shorter curves are fitted whole. The intercept of the
/// returned fit is the Porod constant C₄.
pub fn porod_fit(q: &[f64], intensity: &[f64]) -> Option<LinearFit> {
    let points = q.len().min(intensity.len());
    let y: Vec<f64> = q
        .iter()
        .zip(intensity)
        .map(|(q, i)| q.powi(4) * i)
        .collect();
    if points < MIN_POROD_POINTS {
        return if points >= 3 {
            LinearFit::fit(&q[..points], &y)
        } else {
            None
        };
    }

    // Prefix sums of x, y, x², x·y.
    let mut prefix = vec![[0.0_f64; 4]; points + 1];
    for i in 0..points {
        let (x, y) = (q[i], y[i]);
        let [sx, sy, sxx, sxy] = prefix[i];
        prefix[i + 1] = [sx + x, sy + y, sxx + x * x, sxy + x * y];
    }

    let mut best: Option<(f64, usize, usize)> = None;
    for start in 0..=points - MIN_POROD_POINTS {
        for end in start + MIN_POROD_POINTS..=points {
            let n = (end - start) as f64;
            let [sx, sy, sxx, sxy] = std::array::from_fn(|k| prefix[end][k] - prefix[start][k]);
            let slope = (sxy - sx * sy / n) / (sxx - sx * sx / n);
            if !slope.is_finite() {
                continue;
            }
            if best.map_or(true, |(best_slope, _, _)| slope.abs() < best_slope) {
                best = Some((slope.abs(), start, end));
            }
        }
    }
    let (_, start, end) = best?;
    LinearFit::fit(&q[start..end], &y[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_line() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [3.0, 5.0, 7.0, 9.0];
        let fit = LinearFit::fit(&x, &y).unwrap();
        assert!((fit.slope - 2.0).abs() < 1e-12);
        assert!((fit.intercept - 1.0).abs() < 1e-12);
        assert!(fit.slope_std_err.abs() < 1e-12);
        assert!(fit.intercept_std_err.abs() < 1e-12);
    }

    #[test]
    fn noisy_line_standard_errors() {
        let x = [0.0, 1.0, 2.0];
        let y = [0.0, 2.0, 1.0];
        let fit = LinearFit::fit(&x, &y).unwrap();
        assert!((fit.slope - 0.5).abs() < 1e-12);
        assert!((fit.intercept - 0.5).abs() < 1e-12);
        // SSE = 1.5, MSE = 1.5, Sxx = 2
        assert!((fit.slope_std_err - (0.75_f64).sqrt()).abs() < 1e-12);
        assert!((fit.intercept_std_err - (1.5_f64 * (1.0 / 3.0 + 0.5)).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn degenerate_inputs() {
        assert_eq!(None, LinearFit::fit(&[1.0], &[1.0]));
        assert_eq!(None, LinearFit::fit(&[1.0, 1.0], &[1.0, 2.0]));
        let fit = LinearFit::fit(&[1.0, 2.0], &[1.0, 2.0]).unwrap();
        assert!(fit.slope_std_err.is_nan());
    }

    #[test]
    fn porod_ideal_tail() {
        // I(q) = C4 / q^4 gives a flat Porod plot at C4.
        let q: Vec<f64> = (1..=120).map(|i| i as f64 * 0.01).collect();
        let intensity: Vec<f64> = q.iter().map(|q| 7.0 / q.powi(4)).collect();
        let fit = porod_fit(&q, &intensity).unwrap();
        assert!(fit.points >= MIN_POROD_POINTS);
        assert!(fit.slope.abs() < 1e-9);
        assert!((fit.intercept - 7.0).abs() < 1e-9);
    }

    #[test]
    fn porod_prefers_flat_region() {
        // Rising Porod plot for the first 60 points, flat after.
        let q: Vec<f64> = (1..=160).map(|i| i as f64 * 0.01).collect();
        let intensity: Vec<f64> = q
            .iter()
            .enumerate()
            .map(|(i, q)| {
                let porod = if i < 60 { 1.0 + i as f64 } else { 61.0 };
                porod / q.powi(4)
            })
            .collect();
        let fit = porod_fit(&q, &intensity).unwrap();
        assert!(fit.slope.abs() < 1e-6);
        assert!((fit.intercept - 61.0).abs() < 1e-6);
    }

    #[test]
    fn porod_short_curve() {
        let q = [0.1, 0.2, 0.3, 0.4];
        let intensity: Vec<f64> = q.iter().map(|q: &f64| 2.0 / q.powi(4)).collect();
        let fit = porod_fit(&q, &intensity).unwrap();
        assert_eq!(4, fit.points);
        assert!((fit.intercept - 2.0).abs() < 1e-9);
        assert_eq!(None, porod_fit(&q[..2], &intensity[..2]));
    }
}
