//! Background subtraction.

use tracing::{event, Level};

use crate::array::flat_index;
use crate::error::ReductionError;
use crate::error_model;
use crate::frame::Frame;
use crate::models::BackgroundParams;
use crate::store::{SliceStore, StoreLock};
use crate::transforms::{InputGeometry, Kernel, OutputSpec};

/// Collapse a stack of background images into their mean image.
///
/// The multiplicity `k` is the number of images in the stack. Values are divided by `k` and
/// the summed variances by `k²`.
///
/// # Arguments
///
/// * `values`: Background values, a whole number of images
/// * `variances`: Background variances
/// * `image_size`: Number of pixels in one image
pub fn collapse(values: &[f32], variances: &[f64], image_size: usize) -> (Vec<f32>, Vec<f64>) {
    let multiplicity = (values.len() / image_size.max(1)).max(1) as f64;
    let mut sum = vec![0.0_f64; image_size];
    let mut variance = vec![0.0_f64; image_size];
    for (i, (value, var)) in values.iter().zip(variances).enumerate() {
        sum[i % image_size] += f64::from(*value);
        variance[i % image_size] += var;
    }
    (
        sum.iter().map(|s| (s / multiplicity) as f32).collect(),
        variance
            .iter()
            .map(|v| v / (multiplicity * multiplicity))
            .collect(),
    )
}

/// Subtract a background from data, adding the variances.
///
/// A background the size of the data is subtracted element-wise. A background of higher rank
/// than one image whose trailing axes match the image is first collapsed to its mean image.
/// Whatever remains is tiled over the data, which must then be a whole number of backgrounds.
///
/// # Arguments
///
/// * `data`: Data values, of shape `shape`
/// * `variance`: Data variances
/// * `bg`: Background values, of shape `bg_shape`
/// * `bg_variance`: Background variances
/// * `bg_shape`: Shape of the background
/// * `shape`: Shape of the data, `[frames, image...]`
pub fn process(
    data: &[f32],
    variance: &[f64],
    bg: &[f32],
    bg_variance: &[f64],
    bg_shape: &[usize],
    shape: &[usize],
) -> Result<(Vec<f32>, Vec<f64>), ReductionError> {
    let incompatible = |reason| ReductionError::IncompatibleShapes {
        data: shape.to_vec(),
        reference: bg_shape.to_vec(),
        reason,
    };
    let image = shape.get(1..).unwrap_or(&[]);
    let image_size: usize = image.iter().product();

    let collapsed;
    let (bg, bg_variance) = if bg.len() != data.len()
        && bg_shape.len() > image.len()
        && bg_shape.ends_with(image)
        && bg.len() > image_size
    {
        collapsed = collapse(bg, bg_variance, image_size);
        (&collapsed.0[..], &collapsed.1[..])
    } else {
        (bg, bg_variance)
    };

    if bg.is_empty() || data.len() % bg.len() != 0 || bg.len() != bg_variance.len() {
        return Err(incompatible("data size is not a multiple of background size"));
    }
    let values = data
        .iter()
        .enumerate()
        .map(|(i, value)| value - bg[i % bg.len()])
        .collect();
    let variances = variance
        .iter()
        .enumerate()
        .map(|(i, var)| error_model::add(*var, bg_variance[i % bg.len()]))
        .collect();
    Ok((values, variances))
}

/// Background prepared for the grid being processed.
#[derive(Clone, Debug)]
enum Reference {
    /// The same background for every grid position
    Tiled {
        values: Vec<f32>,
        variances: Vec<f64>,
        shape: Vec<usize>,
    },
    /// One background image per grid position. Grid axes of length 1 broadcast.
    PerPosition {
        values: Vec<f32>,
        variances: Vec<f64>,
        grid: Vec<usize>,
        image_shape: Vec<usize>,
    },
}

/// Background subtraction kernel
#[derive(Clone, Debug)]
pub struct BackgroundSubtraction {
    reference: Reference,
    image_shape: Vec<usize>,
}

impl BackgroundSubtraction {
    /// Read, scale and shape the background for the input.
    pub fn prepare<S: SliceStore>(
        store: &StoreLock<S>,
        input: &InputGeometry,
        params: &BackgroundParams,
    ) -> Result<Self, ReductionError> {
        let background = store.read_all(params.background)?;
        let bg_shape = background.shape.clone();
        let frame = Frame::from_slice(background, 0)?;
        let scale = params.scale.unwrap_or(1.0);
        let values: Vec<f32> = frame.values.iter().map(|v| v * scale as f32).collect();
        let variances: Vec<f64> = frame
            .variances
            .iter()
            .map(|v| error_model::scale(*v, scale))
            .collect();
        Self::from_parts(input, values, variances, bg_shape)
    }

    fn from_parts(
        input: &InputGeometry,
        values: Vec<f32>,
        variances: Vec<f64>,
        bg_shape: Vec<usize>,
    ) -> Result<Self, ReductionError> {
        let (grid, image) = (input.grid(), input.image());
        let image_size = input.image_size();
        let incompatible = |reason| ReductionError::IncompatibleShapes {
            data: input.shape.clone(),
            reference: bg_shape.clone(),
            reason,
        };

        let reference = if bg_shape.len() >= image.len() && bg_shape.ends_with(image) {
            let bg_grid = &bg_shape[..bg_shape.len() - image.len()];
            let frames: usize = bg_grid.iter().product();
            if frames == 1 {
                Reference::Tiled {
                    values,
                    variances,
                    shape: image.to_vec(),
                }
            } else if bg_grid.len() == grid.len()
                && bg_grid.iter().zip(grid).all(|(b, g)| b == g || *b == 1)
            {
                Reference::PerPosition {
                    values,
                    variances,
                    grid: bg_grid.to_vec(),
                    image_shape: image.to_vec(),
                }
            } else if input.shape.len().abs_diff(bg_shape.len()) > 1 {
                return Err(incompatible(
                    "background rank differs from data rank by more than one axis",
                ));
            } else {
                event!(
                    Level::WARN,
                    frames,
                    "averaging background frames to fit the data"
                );
                let (values, variances) = collapse(&values, &variances, image_size);
                Reference::Tiled {
                    values,
                    variances,
                    shape: image.to_vec(),
                }
            }
        } else if !values.is_empty() && image_size % values.len() == 0 {
            Reference::Tiled {
                values,
                variances,
                shape: bg_shape.clone(),
            }
        } else {
            return Err(incompatible("data size is not a multiple of background size"));
        };

        Ok(BackgroundSubtraction {
            reference,
            image_shape: image.to_vec(),
        })
    }
}

impl Kernel for BackgroundSubtraction {
    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec {
            name: "background_subtraction",
            image_shape: self.image_shape.clone(),
        }]
    }

    fn process(&self, position: &[usize], frame: Frame) -> Result<Vec<Frame>, ReductionError> {
        let (values, variances) = match &self.reference {
            Reference::Tiled {
                values,
                variances,
                shape,
            } => process(
                &frame.values,
                &frame.variances,
                values,
                variances,
                shape,
                &frame.shape,
            )?,
            Reference::PerPosition {
                values,
                variances,
                grid,
                image_shape,
            } => {
                let bg_position: Vec<usize> = position
                    .iter()
                    .zip(grid)
                    .map(|(pos, length)| if *length > 1 { *pos } else { 0 })
                    .collect();
                let size: usize = image_shape.iter().product();
                let offset = flat_index(&bg_position, grid) * size;
                process(
                    &frame.values,
                    &frame.variances,
                    &values[offset..offset + size],
                    &variances[offset..offset + size],
                    image_shape,
                    &frame.shape,
                )?
            }
        };
        Ok(vec![Frame::new(values, variances, frame.shape)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::store::MemoryStore;
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn zero_background_is_identity() {
        let data = [1.0_f32, 2.0, 3.0, 4.0];
        let variance = [1.0, 2.0, 3.0, 4.0];
        let (values, variances) =
            process(&data, &variance, &[0.0; 2], &[0.0; 2], &[2], &[2, 2]).unwrap();
        assert_eq!(data.to_vec(), values);
        assert_eq!(variance.to_vec(), variances);
    }

    #[test]
    fn same_size_is_element_wise() {
        let (values, variances) =
            process(&[5.0, 6.0], &[1.0, 1.0], &[1.0, 2.0], &[0.5, 0.25], &[1, 2], &[1, 2]).unwrap();
        assert_eq!(vec![4.0, 4.0], values);
        assert_eq!(vec![1.5, 1.25], variances);
    }

    #[test]
    fn collapses_background_stack() {
        // Two background frames of one pixel: 2 and 3.
        let (values, variances) =
            process(&[10.0], &[0.0], &[2.0, 3.0], &[4.0, 8.0], &[2, 1], &[1, 1]).unwrap();
        assert_eq!(vec![7.5], values);
        assert_eq!(vec![(4.0 + 8.0) / 4.0], variances);
    }

    #[test]
    fn collapse_mean() {
        let (values, variances) = collapse(&[2.0, 3.0], &[4.0, 8.0], 1);
        assert_eq!(vec![2.5], values);
        assert_eq!(vec![3.0], variances);
    }

    #[test]
    fn tiles_over_frames() {
        let (values, _) = process(
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            &[0.0; 6],
            &[1.0, 1.0, 2.0],
            &[0.0; 3],
            &[3],
            &[2, 3],
        )
        .unwrap();
        assert_eq!(vec![0.0, 1.0, 1.0, 3.0, 4.0, 4.0], values);
    }

    #[test]
    fn incompatible_sizes() {
        match process(&[1.0; 6], &[0.0; 6], &[1.0; 4], &[0.0; 4], &[4], &[2, 3]) {
            Err(ReductionError::IncompatibleShapes { data, reference, .. }) => {
                assert_eq!(vec![2, 3], data);
                assert_eq!(vec![4], reference);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    fn geometry() -> InputGeometry {
        InputGeometry {
            shape: vec![2, 3, 4],
            detector_dims: 1,
        }
    }

    fn prepare(values: Vec<f32>, shape: &[usize], scale: Option<f64>) -> Result<BackgroundSubtraction, ReductionError> {
        let mut store = MemoryStore::new();
        let array = ArrayD::from_shape_vec(IxDyn(shape), values).unwrap();
        let id = store.insert("bg", array, None).unwrap();
        let params = BackgroundParams {
            background: id,
            scale,
        };
        BackgroundSubtraction::prepare(&StoreLock::new(store), &geometry(), &params)
    }

    #[test]
    fn prepared_single_image_scaled() {
        // Arrange
        let kernel = prepare(vec![1.0, 2.0, 3.0, 4.0], &[4], Some(2.0)).unwrap();
        let frame = Frame::new(vec![10.0; 4], vec![1.0; 4], vec![1, 4]).unwrap();

        // Act
        let output = kernel.process(&[1, 2], frame).unwrap();

        // Assert
        assert_eq!(vec![8.0, 6.0, 4.0, 2.0], output[0].values);
        // Counting variance of the background, times the scale squared.
        assert_eq!(vec![5.0, 9.0, 13.0, 17.0], output[0].variances);
    }

    #[test]
    fn prepared_per_position_broadcasts_unit_axes() {
        // One background per row of the grid, broadcast along the second grid axis.
        let kernel = prepare(
            vec![1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0],
            &[2, 1, 4],
            None,
        )
        .unwrap();
        let frame = Frame::new(vec![5.0; 4], vec![0.0; 4], vec![1, 4]).unwrap();
        let output = kernel.process(&[1, 2], frame).unwrap();
        assert_eq!(vec![3.0; 4], output[0].values);
        assert_eq!(vec![2.0; 4], output[0].variances);
    }

    #[test]
    fn prepared_collapses_other_grid() {
        // Three background frames against a grid of [2, 3].
        let kernel = prepare(
            vec![1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0, 3.0, 3.0, 3.0, 3.0],
            &[3, 4],
            None,
        )
        .unwrap();
        let frame = Frame::new(vec![5.0; 4], vec![0.0; 4], vec![1, 4]).unwrap();
        let output = kernel.process(&[0, 0], frame).unwrap();
        assert_eq!(vec![3.0; 4], output[0].values);
        assert_eq!(vec![6.0 / 9.0; 4], output[0].variances);
    }

    #[test]
    fn prepared_sub_image_tiles() {
        let kernel = prepare(vec![1.0, 2.0], &[2], None).unwrap();
        let frame = Frame::new(vec![5.0; 4], vec![0.0; 4], vec![1, 4]).unwrap();
        let output = kernel.process(&[0, 0], frame).unwrap();
        assert_eq!(vec![4.0, 3.0, 4.0, 3.0], output[0].values);
    }

    #[test]
    fn prepared_rank_gap_too_large() {
        let geometry = InputGeometry {
            shape: vec![2, 3, 5, 4],
            detector_dims: 1,
        };
        let kernel = BackgroundSubtraction::from_parts(&geometry, vec![0.0; 8], vec![0.0; 8], vec![2, 4]);
        assert!(matches!(kernel, Err(ReductionError::IncompatibleShapes { .. })));
    }

    #[test]
    fn prepared_incompatible() {
        assert!(matches!(
            prepare(vec![0.0; 3], &[3], None),
            Err(ReductionError::IncompatibleShapes { .. })
        ));
    }
}
