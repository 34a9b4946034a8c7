//! Adaptive Gauss-Legendre quadrature.

use super::NumericError;

/// Default cap on the number of integrand evaluations.
pub const MAX_EVALUATIONS: usize = 1_000_000;

/// Gauss-Legendre nodes and weights on `[-1, 1]`, found by Newton iteration on `P_n`.
fn legendre_rule(order: usize) -> Vec<(f64, f64)> {
    let n = order as f64;
    let mut rule = Vec::with_capacity(order);
    for i in 0..order.div_ceil(2) {
        let mut x = (std::f64::consts::PI * (i as f64 + 0.75) / (n + 0.5)).cos();
        let mut derivative = 0.0;
        for _ in 0..100 {
            let (mut p0, mut p1) = (1.0, x);
            for k in 2..=order {
                let k = k as f64;
                let p2 = ((2.0 * k - 1.0) * x * p1 - (k - 1.0) * p0) / k;
                p0 = p1;
                p1 = p2;
            }
            derivative = n * (x * p1 - p0) / (x * x - 1.0);
            let step = p1 / derivative;
            x -= step;
            if step.abs() < 1e-15 {
                break;
            }
        }
        let weight = 2.0 / ((1.0 - x * x) * derivative * derivative);
        rule.push((x, weight));
        if 2 * i + 1 != order {
            rule.push((-x, weight));
        }
    }
    rule
}

/// Iterative Legendre-Gauss integrator.
///
/// Splits the interval into `m` equal sub-intervals with a fixed-order rule on each, growing
/// `m` until two successive estimates agree to the requested accuracy. Gives up once the
/// evaluation budget is spent.
#[derive(Clone, Debug)]
pub struct IterativeLegendreGauss {
    rule: Vec<(f64, f64)>,
    relative_accuracy: f64,
    absolute_accuracy: f64,
    min_iterations: usize,
    max_evaluations: usize,
}

impl Default for IterativeLegendreGauss {
    /// Order 15, relative accuracy 1e-6, absolute accuracy 1e-15, one million evaluations.
    fn default() -> Self {
        Self::new(15, 1e-6, 1e-15, MAX_EVALUATIONS)
    }
}

impl IterativeLegendreGauss {
    /// Returns a new integrator.
    ///
    /// # Arguments
    ///
    /// * `order`: Number of nodes of the rule applied to each sub-interval
    /// * `relative_accuracy`: Convergence threshold relative to the estimate
    /// * `absolute_accuracy`: Convergence threshold in absolute terms
    /// * `max_evaluations`: Evaluation budget
    pub fn new(
        order: usize,
        relative_accuracy: f64,
        absolute_accuracy: f64,
        max_evaluations: usize,
    ) -> Self {
        IterativeLegendreGauss {
            rule: legendre_rule(order.max(1)),
            relative_accuracy,
            absolute_accuracy,
            min_iterations: 3,
            max_evaluations,
        }
    }

    fn stage<F: Fn(f64) -> f64>(&self, f: &F, lower: f64, upper: f64, intervals: usize) -> f64 {
        let step = (upper - lower) / intervals as f64;
        (0..intervals)
            .map(|i| {
                let a = lower + i as f64 * step;
                let half = 0.5 * step;
                let centre = a + half;
                half * self
                    .rule
                    .iter()
                    .map(|(node, weight)| weight * f(centre + half * node))
                    .sum::<f64>()
            })
            .sum()
    }

    /// Integrate `f` over `[lower, upper]`.
    pub fn integrate<F: Fn(f64) -> f64>(
        &self,
        f: F,
        lower: f64,
        upper: f64,
    ) -> Result<f64, NumericError> {
        let order = self.rule.len();
        let mut evaluations = order;
        if evaluations > self.max_evaluations {
            return Err(NumericError::TooManyEvaluations {
                max: self.max_evaluations,
            });
        }
        let mut previous = self.stage(&f, lower, upper, 1);
        let mut intervals = 2;
        let mut iterations = 0;
        loop {
            evaluations += intervals * order;
            if evaluations > self.max_evaluations {
                return Err(NumericError::TooManyEvaluations {
                    max: self.max_evaluations,
                });
            }
            let estimate = self.stage(&f, lower, upper, intervals);
            let delta = (estimate - previous).abs();
            let limit = self
                .absolute_accuracy
                .max(self.relative_accuracy * (previous.abs() + estimate.abs()) * 0.5);
            if iterations + 1 >= self.min_iterations && delta <= limit {
                return Ok(estimate);
            }
            let ratio = f64::min(4.0, (delta / limit).powf(0.5 / order as f64));
            intervals = std::cmp::max((ratio * intervals as f64) as usize, intervals + 1);
            previous = estimate;
            iterations += 1;
        }
    }
}
