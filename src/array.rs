//! Functions and utilities for working with [ndarray] objects.

use crate::error::ReductionError;
use crate::slice::SliceWindow;

use ndarray::prelude::*;

/// Returns an [ndarray::ArrayView](ndarray::ArrayView) over a flat row-major buffer.
///
/// The array view borrows the data, so no copying takes place.
///
/// # Arguments
///
/// * `shape`: The shape of the array
/// * `data`: A slice of type `&[T]` containing the data to be consumed by the array view.
pub fn build_array_view<'a, T>(
    shape: &[usize],
    data: &'a [T],
) -> Result<ArrayViewD<'a, T>, ReductionError> {
    ArrayView::<T, _>::from_shape(IxDyn(shape), data).map_err(ReductionError::ShapeInvalid)
}

/// Returns an [ndarray] SliceInfo object corresponding to a window.
pub fn build_slice_info(
    window: &SliceWindow,
) -> Result<ndarray::SliceInfo<Vec<ndarray::SliceInfoElem>, IxDyn, IxDyn>, ReductionError> {
    let si: Vec<ndarray::SliceInfoElem> = std::iter::zip(&window.start, &window.block)
        .map(|(start, block)| {
            Ok(ndarray::SliceInfoElem::Slice {
                start: isize::try_from(*start)?,
                end: Some(isize::try_from(start + block)?),
                step: 1,
            })
        })
        .collect::<Result<_, ReductionError>>()?;
    Ok(ndarray::SliceInfo::try_from(si)?)
}

/// Number of elements in one detector image.
///
/// # Arguments
///
/// * `shape`: Shape of the array
/// * `detector_dims`: Number of trailing detector dimensions
pub fn image_size(shape: &[usize], detector_dims: usize) -> usize {
    shape[shape.len().saturating_sub(detector_dims)..]
        .iter()
        .product()
}

/// Splits a shape into its grid and detector parts.
pub fn split_shape(shape: &[usize], detector_dims: usize) -> (&[usize], &[usize]) {
    shape.split_at(shape.len().saturating_sub(detector_dims))
}

/// Row-major flat index of a position within a shape.
pub fn flat_index(position: &[usize], shape: &[usize]) -> usize {
    position
        .iter()
        .zip(shape)
        .fold(0, |index, (pos, length)| index * length + pos)
}
