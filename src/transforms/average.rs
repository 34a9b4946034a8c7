//! Averaging.

use ndarray::Axis;

use crate::array::build_array_view;
use crate::error::ReductionError;
use crate::frame::Frame;

/// Mean image over the first axis of `data`.
///
/// # Arguments
///
/// * `data`: Flattened row-major values
/// * `shape`: Shape of `data`; the first axis is averaged
pub fn process(data: &[f32], shape: &[usize]) -> Result<Vec<f32>, ReductionError> {
    let Some((&frames, image)) = shape.split_first() else {
        return Ok(data.to_vec());
    };
    let image_size: usize = image.iter().product();
    let view = build_array_view(shape, data)?.into_shape((frames, image_size))?;
    Ok(view
        .mapv(f64::from)
        .sum_axis(Axis(0))
        .mapv(|sum| (sum / frames as f64) as f32)
        .to_vec())
}

/// Running sum of the frames contributing to one averaged output cell.
#[derive(Clone, Debug)]
pub struct GridAccumulator {
    sum: Vec<f64>,
    variance: Vec<f64>,
    image_shape: Vec<usize>,
    count: usize,
}

impl GridAccumulator {
    /// Returns an empty accumulator for images of the given shape.
    pub fn new(image_shape: &[usize]) -> Self {
        let size = image_shape.iter().product();
        GridAccumulator {
            sum: vec![0.0; size],
            variance: vec![0.0; size],
            image_shape: image_shape.to_vec(),
            count: 0,
        }
    }

    /// Add the images of `frame` for which `include(index)` holds.
    pub fn add<F: Fn(usize) -> bool>(&mut self, frame: &Frame, include: F) -> Result<(), ReductionError> {
        let frames = frame.frames();
        let size = self.sum.len();
        let values = frame.values_view()?.into_shape((frames, size))?;
        let variances = frame.variances_view()?.into_shape((frames, size))?;
        for index in (0..frames).filter(|index| include(*index)) {
            for (sum, value) in self.sum.iter_mut().zip(values.row(index)) {
                *sum += f64::from(*value);
            }
            for (sum, variance) in self.variance.iter_mut().zip(variances.row(index)) {
                *sum += variance;
            }
            self.count += 1;
        }
        Ok(())
    }

    /// Number of frames added so far.
    pub fn count(&self) -> usize {
        self.count
    }

    /// The averaged frame, of shape `[1, image...]`.
    ///
    /// The mean of `n` frames has variance `Σvar / n²`, so its stored uncertainty is
    /// `sqrt(Σvar) / n`. With no contributing frames every value and variance is NaN.
    pub fn finish(self) -> Result<Frame, ReductionError> {
        let n = self.count as f64;
        let values = self.sum.iter().map(|sum| (sum / n) as f32).collect();
        let variances = self.variance.iter().map(|sum| sum / (n * n)).collect();
        let mut shape = vec![1];
        shape.extend(self.image_shape);
        Frame::new(values, variances, shape)
    }
}
