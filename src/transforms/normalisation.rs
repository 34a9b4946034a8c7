//! Normalisation by a calibration channel.

use tracing::{event, Level};

use crate::array::{flat_index, split_shape};
use crate::error::ReductionError;
use crate::error_model;
use crate::frame::Frame;
use crate::models::NormalisationParams;
use crate::store::{SliceStore, StoreLock};
use crate::transforms::{InputGeometry, Kernel, OutputSpec};

/// Scale each frame by `scale / reading`, where `reading` is the frame's calibration value.
///
/// A zero reading is replaced by 1 and logged; it never fails the stage.
///
/// # Arguments
///
/// * `data`: Values of shape `shape`
/// * `variance`: Variances of shape `shape`
/// * `calibration`: Calibration rows of shape `calib_shape`
/// * `calib_channel`: Index of the channel within a calibration row
/// * `frames`: Number of frames to normalise
/// * `shape`: Shape of the data, `[frames, image...]`
/// * `calib_shape`: Shape of the calibration, `[frames, channels]`
/// * `scale`: Absolute intensity scale
#[allow(clippy::too_many_arguments)]
pub fn process(
    data: &[f32],
    variance: &[f64],
    calibration: &[f32],
    calib_channel: usize,
    frames: usize,
    shape: &[usize],
    calib_shape: &[usize],
    scale: f64,
) -> Result<(Vec<f32>, Vec<f64>), ReductionError> {
    let channels = calib_shape.last().copied().unwrap_or(1);
    let calib_frames = calibration.len() / channels.max(1);
    let image_size: usize = shape.iter().skip(1).product();
    if calib_channel >= channels
        || calib_frames < frames
        || data.len() < frames * image_size
        || variance.len() != data.len()
    {
        return Err(ReductionError::IncompatibleShapes {
            data: shape.to_vec(),
            reference: calib_shape.to_vec(),
            reason: "calibration does not cover every frame and channel",
        });
    }

    let mut values = data.to_vec();
    let mut variances = variance.to_vec();
    for frame in 0..frames {
        let mut reading = f64::from(calibration[frame * channels + calib_channel]);
        if reading == 0.0 {
            event!(Level::WARN, frame, calib_channel, "zero calibration reading, using 1");
            reading = 1.0;
        }
        let factor = scale / reading;
        let range = frame * image_size..(frame + 1) * image_size;
        for value in &mut values[range.clone()] {
            *value = (f64::from(*value) * factor) as f32;
        }
        for var in &mut variances[range] {
            *var = error_model::scale(*var, factor);
        }
    }
    Ok((values, variances))
}

/// Normalisation kernel
#[derive(Clone, Debug)]
pub struct Normalisation {
    calibration: Vec<f32>,
    calib_grid: Vec<usize>,
    channels: usize,
    channel: usize,
    scale: f64,
    image_shape: Vec<usize>,
}

impl Normalisation {
    /// Read the calibration table, shaped `[grid..., channels]`.
    pub fn prepare<S: SliceStore>(
        store: &StoreLock<S>,
        input: &InputGeometry,
        params: &NormalisationParams,
    ) -> Result<Self, ReductionError> {
        let calibration = store.read_all(params.calibration)?;
        let (calib_grid, channels) = split_shape(&calibration.shape, 1);
        let channels = channels.first().copied().unwrap_or(0);
        if calib_grid.len() != input.grid().len() || params.channel >= channels {
            return Err(ReductionError::IncompatibleShapes {
                data: input.shape.clone(),
                reference: calibration.shape.clone(),
                reason: "calibration must be shaped [grid..., channels] and hold the channel",
            });
        }
        Ok(Normalisation {
            calib_grid: calib_grid.to_vec(),
            calibration: calibration.values,
            channels,
            channel: params.channel,
            scale: params.scale,
            image_shape: input.image().to_vec(),
        })
    }
}

impl Kernel for Normalisation {
    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec {
            name: "normalisation",
            image_shape: self.image_shape.clone(),
        }]
    }

    /// Only grid cells covered by the calibration are normalised.
    fn output_grid(&self, grid_shape: &[usize]) -> Vec<usize> {
        grid_shape
            .iter()
            .zip(&self.calib_grid)
            .map(|(data, calib)| std::cmp::min(*data, *calib))
            .collect()
    }

    fn process(&self, position: &[usize], frame: Frame) -> Result<Vec<Frame>, ReductionError> {
        let row = flat_index(position, &self.calib_grid) * self.channels;
        let (values, variances) = process(
            &frame.values,
            &frame.variances,
            &self.calibration[row..row + self.channels],
            self.channel,
            frame.frames(),
            &frame.shape,
            &[1, self.channels],
            self.scale,
        )?;
        Ok(vec![Frame::new(values, variances, frame.shape)?])
    }

    fn metadata(&self) -> std::collections::BTreeMap<String, f64> {
        [("scale".to_string(), self.scale)].into_iter().collect()
    }
}
