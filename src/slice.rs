//! Slice addressing: carving one grid cell (or a batch of cells) out of an N-dimensional array.

use serde::{Deserialize, Serialize};

use crate::error::ReductionError;

/// A contiguous sub-window of an N-dimensional array.
///
/// Invariant: `start[d] + block[d] <= shape[d]` for every dimension of the array the window was
/// computed for.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct SliceWindow {
    /// Offset of the window along each dimension
    pub start: Vec<usize>,
    /// Extent of the window along each dimension
    pub block: Vec<usize>,
    /// Grid dimension along which several cells may be read at once
    pub slice_dim: usize,
    /// Requested number of cells along `slice_dim`
    pub slice_size: usize,
}

impl SliceWindow {
    /// Returns a window covering the whole of an array of the given shape.
    pub fn full(shape: &[usize]) -> Self {
        SliceWindow {
            start: vec![0; shape.len()],
            block: shape.to_vec(),
            slice_dim: 0,
            slice_size: shape.first().copied().unwrap_or(1),
        }
    }

    /// Number of dimensions of the window.
    pub fn rank(&self) -> usize {
        self.block.len()
    }

    /// Number of elements covered by the window.
    pub fn size(&self) -> usize {
        self.block.iter().product()
    }

    /// Whether the window lies entirely within `shape`.
    pub fn fits(&self, shape: &[usize]) -> bool {
        self.start.len() == shape.len()
            && self.rank() == shape.len()
            && self
                .start
                .iter()
                .zip(&self.block)
                .zip(shape)
                .all(|((start, block), length)| start + block <= *length)
    }
}

/// Compute the window addressed by a grid position.
///
/// Scan dimensions other than `slice_dim` get a block of 1. Along `slice_dim` the block is
/// `min(slice_size, shape[slice_dim] - position[slice_dim])`, and detector dimensions are read
/// whole. A `slice_size` of 0 is treated as 1.
///
/// # Arguments
///
/// * `shape`: Shape of the whole array
/// * `detector_dims`: Number of trailing detector (pixel) dimensions
/// * `slice_dim`: Grid dimension along which several cells are read at once
/// * `slice_size`: Number of cells to read along `slice_dim`
/// * `position`: Grid position of the first cell
pub fn compute(
    shape: &[usize],
    detector_dims: usize,
    slice_dim: usize,
    slice_size: usize,
    position: &[usize],
) -> Result<SliceWindow, ReductionError> {
    let mismatch = || ReductionError::ShapeMismatch {
        shape: shape.to_vec(),
        position: position.to_vec(),
    };
    let grid_rank = shape.len().checked_sub(detector_dims).ok_or_else(mismatch)?;
    if position.len() != grid_rank || (grid_rank > 0 && slice_dim >= grid_rank) {
        return Err(mismatch());
    }

    let mut start = position.to_vec();
    start.resize(shape.len(), 0);
    if start.iter().zip(shape).any(|(start, length)| start >= length) {
        return Err(mismatch());
    }

    let block = shape
        .iter()
        .enumerate()
        .map(|(dim, length)| {
            if dim >= grid_rank {
                *length
            } else if dim == slice_dim {
                std::cmp::min(slice_size.max(1), length - start[dim])
            } else {
                1
            }
        })
        .collect();

    Ok(SliceWindow {
        start,
        block,
        slice_dim,
        slice_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn single_frame() {
        let window = compute(&[5, 3, 32, 64], 2, 1, 1, &[4, 2]).unwrap();
        assert_eq!(vec![4, 2, 0, 0], window.start);
        assert_eq!(vec![1, 1, 32, 64], window.block);
        assert_eq!(2048, window.size());
    }

    #[test]
    fn batch_clipped_at_edge() {
        let window = compute(&[5, 91, 64], 1, 1, 40, &[0, 80]).unwrap();
        assert_eq!(vec![0, 80, 0], window.start);
        assert_eq!(vec![1, 11, 64], window.block);
    }

    #[test]
    fn batch_on_outer_dim() {
        let window = compute(&[5, 3, 8], 1, 0, 5, &[0, 1]).unwrap();
        assert_eq!(vec![5, 1, 8], window.block);
    }

    #[test]
    fn zero_slice_size_reads_one_cell() {
        let window = compute(&[4, 8], 1, 0, 0, &[2]).unwrap();
        assert_eq!(vec![1, 8], window.block);
    }

    #[test]
    fn no_grid_dims() {
        let window = compute(&[32, 64], 2, 0, 1, &[]).unwrap();
        assert_eq!(vec![0, 0], window.start);
        assert_eq!(vec![32, 64], window.block);
    }

    #[test]
    fn wrong_position_rank() {
        match compute(&[5, 3, 8], 1, 0, 1, &[1]) {
            Err(ReductionError::ShapeMismatch { shape, position }) => {
                assert_eq!(vec![5, 3, 8], shape);
                assert_eq!(vec![1], position);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn position_out_of_bounds() {
        assert!(matches!(
            compute(&[5, 3, 8], 1, 1, 1, &[5, 0]),
            Err(ReductionError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn slice_dim_outside_grid() {
        assert!(matches!(
            compute(&[5, 3, 8], 1, 2, 1, &[0, 0]),
            Err(ReductionError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn too_many_detector_dims() {
        assert!(matches!(
            compute(&[8], 2, 0, 1, &[]),
            Err(ReductionError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn full_window_fits() {
        let window = SliceWindow::full(&[2, 3, 4]);
        assert!(window.fits(&[2, 3, 4]));
        assert!(!window.fits(&[2, 3, 3]));
        assert_eq!(24, window.size());
    }

    fn shape_and_position() -> impl Strategy<Value = (Vec<usize>, Vec<usize>, usize, usize)> {
        (1_usize..4, prop::collection::vec(1_usize..7, 1..4)).prop_flat_map(
            |(detector_dims, grid)| {
                let position = grid
                    .iter()
                    .map(|length| 0..*length)
                    .collect::<Vec<_>>();
                let grid_rank = grid.len();
                let mut shape = grid;
                shape.extend(std::iter::repeat(3).take(detector_dims));
                (
                    Just(shape),
                    position,
                    Just(detector_dims),
                    0..grid_rank,
                )
            },
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn window_is_contained_in_shape(
            (shape, position, detector_dims, slice_dim) in shape_and_position(),
            slice_size in 0_usize..10,
        ) {
            let window = compute(&shape, detector_dims, slice_dim, slice_size, &position).unwrap();
            prop_assert!(window.fits(&shape));
            prop_assert_eq!(&window.start[..position.len()], &position[..]);
        }
    }
}
