//! Degree of orientation from an azimuthal profile.

use tracing::{event, Level};

use crate::error::ReductionError;
use crate::frame::Frame;
use crate::models::AxisParams;
use crate::numeric::{integrate_spline, NumericError};
use crate::store::{SliceStore, StoreLock};
use crate::transforms::{read_axis, InputGeometry, Kernel, OutputSpec};

/// Orientation of one azimuthal profile.
#[derive(Clone, Copy, Debug)]
pub struct Orientation {
    /// Degree of orientation
    pub degree: f64,
    /// Orientation angle in degrees, in `[0, 180)`
    pub angle: f64,
    /// `[degree·cos(angle), degree·sin(angle)]`
    pub vector: [f64; 2],
}

impl Orientation {
    const NAN: Orientation = Orientation {
        degree: f64::NAN,
        angle: f64::NAN,
        vector: [f64::NAN; 2],
    };
}

/// Compute the orientation of an azimuthal profile `I(α)`.
///
/// The profile and its `cos²`, `sin²` and `sin·cos` weighted versions are spline-interpolated
/// and integrated over the sampled range. With the normalised moments `c`, `s` and `sc`, the
/// degree is `sqrt((c - s)² - 4·sc²)` and the angle `atan2(2·sc, c - s) / 2`. Any integration
/// failure gives NaN throughout.
///
/// # Arguments
///
/// * `intensity`: Profile values
/// * `angles`: Strictly increasing azimuthal angles in degrees
pub fn degree_of_orientation(intensity: &[f64], angles: &[f64]) -> Orientation {
    match moments(intensity, angles) {
        Ok([c, s, sc]) => {
            let degree = ((c - s).powi(2) - 4.0 * sc * sc).sqrt();
            let angle = ((2.0 * sc).atan2(c - s) / 2.0).rem_euclid(std::f64::consts::PI);
            Orientation {
                degree,
                angle: angle.to_degrees(),
                vector: [degree * angle.cos(), degree * angle.sin()],
            }
        }
        Err(error) => {
            event!(Level::WARN, %error, "orientation integration failed");
            Orientation::NAN
        }
    }
}

/// Normalised `cos²`, `sin²` and `sin·cos` moments of a profile.
fn moments(intensity: &[f64], angles: &[f64]) -> Result<[f64; 3], NumericError> {
    if intensity.len() != angles.len() {
        return Err(NumericError::LengthMismatch {
            x: angles.len(),
            y: intensity.len(),
        });
    }
    let radians: Vec<f64> = angles.iter().map(|a| a.to_radians()).collect();
    let (Some(lower), Some(upper)) = (radians.first().copied(), radians.last().copied()) else {
        return Err(NumericError::TooFewPoints {
            required: 3,
            actual: 0,
        });
    };
    let weighted = |weight: fn(f64) -> f64| -> Vec<f64> {
        intensity
            .iter()
            .zip(&radians)
            .map(|(i, a)| i * weight(*a))
            .collect()
    };

    let total = integrate_spline(&radians, intensity, lower, upper)?;
    let mut moments = [0.0; 3];
    let weights: [fn(f64) -> f64; 3] = [
        |a| a.cos().powi(2),
        |a| a.sin().powi(2),
        |a| a.sin() * a.cos(),
    ];
    for (moment, weight) in moments.iter_mut().zip(weights) {
        *moment = integrate_spline(&radians, &weighted(weight), lower, upper)? / total;
    }
    Ok(moments)
}

/// Degree of orientation kernel
#[derive(Clone, Debug)]
pub struct DegreeOfOrientation {
    angles: Vec<f64>,
}

impl DegreeOfOrientation {
    /// Read the angle axis, in degrees, which must match the profile length.
    pub fn prepare<S: SliceStore>(
        store: &StoreLock<S>,
        input: &InputGeometry,
        params: &AxisParams,
    ) -> Result<Self, ReductionError> {
        Ok(DegreeOfOrientation {
            angles: read_axis(store, input, params)?,
        })
    }
}

impl Kernel for DegreeOfOrientation {
    fn outputs(&self) -> Vec<OutputSpec> {
        vec![
            OutputSpec {
                name: "degree",
                image_shape: vec![1],
            },
            OutputSpec {
                name: "angle",
                image_shape: vec![1],
            },
            OutputSpec {
                name: "vector",
                image_shape: vec![2],
            },
        ]
    }

    fn process(&self, _position: &[usize], frame: Frame) -> Result<Vec<Frame>, ReductionError> {
        let frames = frame.frames();
        let (mut degree, mut angle, mut vector) = (Vec::new(), Vec::new(), Vec::new());
        for profile in frame.values.chunks(frame.image_size().max(1)) {
            let intensity: Vec<f64> = profile.iter().map(|v| f64::from(*v)).collect();
            let orientation = degree_of_orientation(&intensity, &self.angles);
            degree.push(orientation.degree as f32);
            angle.push(orientation.angle as f32);
            vector.extend(orientation.vector.map(|v| v as f32));
        }
        Ok(vec![
            Frame::new(degree, vec![0.0; frames], vec![frames, 1])?,
            Frame::new(angle, vec![0.0; frames], vec![frames, 1])?,
            Frame::new(vector, vec![0.0; 2 * frames], vec![frames, 2])?,
        ])
    }
}
