//! Typed frame buffers.

use ndarray::{ArrayViewD, ErrorKind, ShapeError};

use crate::array::build_array_view;
use crate::error::ReductionError;
use crate::error_model;
use crate::store::SliceData;

/// A stack of detector images with their variances.
///
/// `shape` is `[frames, detector...]`: the leading axis counts images and the remaining axes
/// are pixel axes. Values are `f32` and variances `f64`, both flattened row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub values: Vec<f32>,
    pub variances: Vec<f64>,
    pub shape: Vec<usize>,
}

impl Frame {
    /// Returns a new Frame, checking that both buffers match the shape.
    pub fn new(values: Vec<f32>, variances: Vec<f64>, shape: Vec<usize>) -> Result<Self, ReductionError> {
        let size: usize = shape.iter().product();
        if values.len() != size || variances.len() != size {
            return Err(ShapeError::from_kind(ErrorKind::IncompatibleShape).into());
        }
        Ok(Frame {
            values,
            variances,
            shape,
        })
    }

    /// Returns a Frame whose variances follow counting statistics.
    pub fn from_counts(values: Vec<f32>, shape: Vec<usize>) -> Result<Self, ReductionError> {
        let variances = error_model::counting_statistics(&values);
        Self::new(values, variances, shape)
    }

    /// Returns a Frame from data read out of a slice store.
    ///
    /// The grid part of the slice is flattened into the frame axis.
    ///
    /// # Arguments
    ///
    /// * `data`: Values and optional standard deviations read from the store
    /// * `detector_dims`: Number of trailing detector dimensions in `data.shape`
    pub fn from_slice(data: SliceData, detector_dims: usize) -> Result<Self, ReductionError> {
        let split = data.shape.len().saturating_sub(detector_dims);
        let mut shape = vec![data.shape[..split].iter().product()];
        shape.extend_from_slice(&data.shape[split..]);
        match data.errors {
            Some(errors) => {
                let variances = error_model::variances_from_errors(&errors);
                Self::new(data.values, variances, shape)
            }
            None => Self::from_counts(data.values, shape),
        }
    }

    /// Number of images in the frame.
    pub fn frames(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Number of pixels in one image.
    pub fn image_size(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// Shape of one image.
    pub fn image_shape(&self) -> &[usize] {
        self.shape.get(1..).unwrap_or(&[])
    }

    /// View of the values with the frame's shape.
    pub fn values_view(&self) -> Result<ArrayViewD<'_, f32>, ReductionError> {
        build_array_view(&self.shape, &self.values)
    }

    /// View of the variances with the frame's shape.
    pub fn variances_view(&self) -> Result<ArrayViewD<'_, f64>, ReductionError> {
        build_array_view(&self.shape, &self.variances)
    }

    /// Standard deviations to store for this frame.
    pub fn errors(&self) -> Vec<f64> {
        error_model::errors_from_variances(&self.variances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_checks_lengths() {
        assert!(Frame::new(vec![1.0; 6], vec![1.0; 6], vec![2, 3]).is_ok());
        assert!(matches!(
            Frame::new(vec![1.0; 6], vec![1.0; 5], vec![2, 3]),
            Err(ReductionError::ShapeInvalid(_))
        ));
    }

    #[test]
    fn from_slice_squares_errors() {
        let data = SliceData {
            values: vec![4.0, 9.0],
            errors: Some(vec![2.0, 3.0]),
            shape: vec![1, 1, 2],
        };
        let frame = Frame::from_slice(data, 1).unwrap();
        assert_eq!(vec![1, 2], frame.shape);
        assert_eq!(vec![4.0, 9.0], frame.variances);
        assert_eq!(vec![2.0, 3.0], frame.errors());
    }

    #[test]
    fn from_slice_without_errors_uses_counts() {
        let data = SliceData {
            values: vec![4.0, -1.0, 2.0, 3.0],
            errors: None,
            shape: vec![2, 2],
        };
        let frame = Frame::from_slice(data, 1).unwrap();
        assert_eq!(vec![2, 2], frame.shape);
        assert_eq!(vec![4.0, 0.0, 2.0, 3.0], frame.variances);
        assert_eq!(2, frame.frames());
        assert_eq!(2, frame.image_size());
    }

    #[test]
    fn from_slice_batch_flattens_grid() {
        let data = SliceData {
            values: vec![0.0; 3 * 4 * 5],
            errors: None,
            shape: vec![1, 3, 4, 5],
        };
        let frame = Frame::from_slice(data, 2).unwrap();
        assert_eq!(vec![3, 4, 5], frame.shape);
        assert_eq!(&[4, 5], frame.image_shape());
    }
}
