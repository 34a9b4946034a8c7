//! Scattering invariants.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::{event, Level};

use crate::error::ReductionError;
use crate::frame::Frame;
use crate::models::AxisParams;
use crate::numeric::{integrate_spline, porod_fit, LinearFit};
use crate::store::{SliceStore, StoreLock};
use crate::transforms::{read_axis, InputGeometry, Kernel, OutputSpec};

/// Sum every image of a frame stack, and its variances.
///
/// # Arguments
///
/// * `data`: Values of `frames` images of `image_size` pixels
/// * `variance`: Variances of the same length
/// * `image_size`: Number of pixels in one image
pub fn process(data: &[f32], variance: &[f64], image_size: usize) -> (Vec<f32>, Vec<f64>) {
    let image_size = image_size.max(1);
    let values = data
        .chunks(image_size)
        .map(|image| image.iter().map(|v| f64::from(*v)).sum::<f64>() as f32)
        .collect();
    let variances = variance
        .chunks(image_size)
        .map(|image| image.iter().sum())
        .collect();
    (values, variances)
}

/// SAXS invariant of one curve.
#[derive(Clone, Copy, Debug)]
pub struct SaxsResult {
    /// `∫I(q)·q²dq` plus the Porod tail
    pub invariant: f64,
    /// Variance of the invariant
    pub variance: f64,
    /// Porod fit of the tail, if there were enough points
    pub porod: Option<LinearFit>,
}

/// Compute the SAXS invariant `∫I(q)·q²dq` of one curve with a Porod tail correction.
///
/// The integrand is interpolated with a natural cubic spline from `q = 0`, assuming zero
/// intensity there when the curve starts later, and integrated with Gauss-Legendre quadrature.
/// If the integral cannot be computed the invariant and its variance are NaN.
///
/// # Arguments
///
/// * `intensity`: Intensity at each q
/// * `variance`: Variance of each intensity
/// * `q`: Strictly increasing scattering vector magnitudes
pub fn saxs_invariant(intensity: &[f64], variance: &[f64], q: &[f64]) -> SaxsResult {
    let porod = porod_fit(q, intensity);

    let mut axis = Vec::with_capacity(q.len() + 1);
    let mut integrand = Vec::with_capacity(q.len() + 1);
    let mut integrand_variance = Vec::with_capacity(q.len() + 1);
    if q.first().map_or(false, |q0| *q0 > 0.0) {
        axis.push(0.0);
        integrand.push(0.0);
        integrand_variance.push(0.0);
    }
    for ((q, i), var) in q.iter().zip(intensity).zip(variance) {
        axis.push(*q);
        integrand.push(i * q * q);
        integrand_variance.push(var * q.powi(4));
    }

    let (Some(lower), Some(upper)) = (axis.first().copied(), axis.last().copied()) else {
        return SaxsResult {
            invariant: f64::NAN,
            variance: f64::NAN,
            porod,
        };
    };
    let mut invariant = match integrate_spline(&axis, &integrand, lower, upper) {
        Ok(integral) => integral,
        Err(error) => {
            event!(Level::WARN, %error, "invariant integration failed");
            return SaxsResult {
                invariant: f64::NAN,
                variance: f64::NAN,
                porod,
            };
        }
    };

    let last = axis.len() - 1;
    let mut error_sum: f64 = integrand_variance
        .iter()
        .enumerate()
        .map(|(i, var)| {
            let width = axis[(i + 1).min(last)] - axis[i.saturating_sub(1)];
            width * width * var
        })
        .sum::<f64>()
        / 4.0;

    if let Some(fit) = &porod {
        invariant += fit.intercept / upper;
        let tail_error = fit.intercept_std_err / upper;
        if tail_error.is_finite() {
            error_sum += tail_error * tail_error;
        }
    }
    SaxsResult {
        invariant,
        variance: error_sum,
        porod,
    }
}

/// Per-frame sum kernel
#[derive(Clone, Copy, Debug, Default)]
pub struct Invariant;

impl Kernel for Invariant {
    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec {
            name: "invariant",
            image_shape: vec![1],
        }]
    }

    fn process(&self, _position: &[usize], frame: Frame) -> Result<Vec<Frame>, ReductionError> {
        let (values, variances) = process(&frame.values, &frame.variances, frame.image_size());
        Ok(vec![Frame::new(values, variances, vec![frame.frames(), 1])?])
    }
}

/// SAXS invariant kernel
#[derive(Debug)]
pub struct SaxsInvariant {
    q: Vec<f64>,
    /// Sum and count of the finite Porod slopes fitted so far
    slopes: Mutex<(f64, usize)>,
}

impl SaxsInvariant {
    /// Read the q axis, which must match the profile length.
    pub fn prepare<S: SliceStore>(
        store: &StoreLock<S>,
        input: &InputGeometry,
        params: &AxisParams,
    ) -> Result<Self, ReductionError> {
        Ok(Self::new(read_axis(store, input, params)?))
    }

    /// Returns a kernel for profiles sampled at `q`.
    pub fn new(q: Vec<f64>) -> Self {
        SaxsInvariant {
            q,
            slopes: Mutex::new((0.0, 0)),
        }
    }
}

impl Kernel for SaxsInvariant {
    fn outputs(&self) -> Vec<OutputSpec> {
        vec![
            OutputSpec {
                name: "invariant",
                image_shape: vec![1],
            },
            OutputSpec {
                name: "porod",
                image_shape: vec![2],
            },
        ]
    }

    fn process(&self, _position: &[usize], frame: Frame) -> Result<Vec<Frame>, ReductionError> {
        let frames = frame.frames();
        let mut invariant = (Vec::with_capacity(frames), Vec::with_capacity(frames));
        let mut porod = (Vec::with_capacity(2 * frames), Vec::with_capacity(2 * frames));
        let mut slopes = (0.0, 0);
        let profile_length = frame.image_size().max(1);
        for (values, variances) in frame
            .values
            .chunks(profile_length)
            .zip(frame.variances.chunks(profile_length))
        {
            let intensity: Vec<f64> = values.iter().map(|v| f64::from(*v)).collect();
            let result = saxs_invariant(&intensity, variances, &self.q);
            invariant.0.push(result.invariant as f32);
            invariant.1.push(result.variance);
            match result.porod {
                Some(fit) => {
                    porod.0.extend([fit.intercept as f32, fit.slope as f32]);
                    porod.1.extend([
                        fit.intercept_std_err * fit.intercept_std_err,
                        fit.slope_std_err * fit.slope_std_err,
                    ]);
                    if fit.slope.is_finite() {
                        slopes.0 += fit.slope;
                        slopes.1 += 1;
                    }
                }
                None => {
                    porod.0.extend([f32::NAN; 2]);
                    porod.1.extend([f64::NAN; 2]);
                }
            }
        }

        let mut accumulated = self.slopes.lock().map_err(|_| {
            ReductionError::LeafPanicked("Porod slope accumulator poisoned".to_string())
        })?;
        accumulated.0 += slopes.0;
        accumulated.1 += slopes.1;
        drop(accumulated);

        Ok(vec![
            Frame::new(invariant.0, invariant.1, vec![frames, 1])?,
            Frame::new(porod.0, porod.1, vec![frames, 2])?,
        ])
    }

    fn metadata(&self) -> BTreeMap<String, f64> {
        let mut metadata = BTreeMap::new();
        if let Ok(slopes) = self.slopes.lock() {
            if slopes.1 > 0 {
                metadata.insert("porod_slope".to_string(), slopes.0 / slopes.1 as f64);
            }
        }
        metadata
    }
}
