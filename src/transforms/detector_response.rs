//! Detector response correction.

use crate::error::ReductionError;
use crate::error_model;
use crate::frame::Frame;
use crate::models::DetectorResponseParams;
use crate::store::{SliceStore, StoreLock};
use crate::transforms::{InputGeometry, Kernel, OutputSpec};

/// Multiply every image pixel-wise by a response image.
///
/// Without a response variance the response is treated as exact and variances scale by its
/// square. Otherwise the product rule applies.
///
/// # Arguments
///
/// * `data`: Data values, a whole number of images
/// * `variance`: Data variances
/// * `response`: Response values for one image
/// * `response_variance`: Optional response variances
pub fn process(
    data: &[f32],
    variance: &[f64],
    response: &[f32],
    response_variance: Option<&[f64]>,
) -> Result<(Vec<f32>, Vec<f64>), ReductionError> {
    let lengths_match = response_variance.map_or(true, |v| v.len() == response.len());
    if response.is_empty() || data.len() % response.len() != 0 || !lengths_match {
        return Err(ReductionError::IncompatibleShapes {
            data: vec![data.len()],
            reference: vec![response.len()],
            reason: "response must match the detector image",
        });
    }
    let values = data
        .iter()
        .enumerate()
        .map(|(i, value)| value * response[i % response.len()])
        .collect();
    let variances = variance
        .iter()
        .zip(data)
        .enumerate()
        .map(|(i, (var, value))| {
            let r = f64::from(response[i % response.len()]);
            match response_variance {
                Some(rv) => error_model::product(f64::from(*value), *var, r, rv[i % rv.len()]),
                None => error_model::scale(*var, r),
            }
        })
        .collect();
    Ok((values, variances))
}

/// Detector response kernel
#[derive(Clone, Debug)]
pub struct DetectorResponse {
    response: Vec<f32>,
    response_variance: Option<Vec<f64>>,
    image_shape: Vec<usize>,
}

impl DetectorResponse {
    /// Read the response image, which must have the detector's shape.
    pub fn prepare<S: SliceStore>(
        store: &StoreLock<S>,
        input: &InputGeometry,
        params: &DetectorResponseParams,
    ) -> Result<Self, ReductionError> {
        let response = store.read_all(params.response)?;
        if response.shape != input.image() {
            return Err(ReductionError::IncompatibleShapes {
                data: input.shape.clone(),
                reference: response.shape,
                reason: "response must match the detector image",
            });
        }
        Ok(DetectorResponse {
            response_variance: response
                .errors
                .as_deref()
                .map(error_model::variances_from_errors),
            response: response.values,
            image_shape: input.image().to_vec(),
        })
    }
}

impl Kernel for DetectorResponse {
    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec {
            name: "detector_response",
            image_shape: self.image_shape.clone(),
        }]
    }

    fn process(&self, _position: &[usize], frame: Frame) -> Result<Vec<Frame>, ReductionError> {
        let (values, variances) = process(
            &frame.values,
            &frame.variances,
            &self.response,
            self.response_variance.as_deref(),
        )?;
        Ok(vec![Frame::new(values, variances, frame.shape)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::store::MemoryStore;
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn exact_response() {
        let (values, variances) =
            process(&[1.0, 2.0, 3.0, 4.0], &[1.0, 2.0, 3.0, 4.0], &[2.0, 0.5], None).unwrap();
        assert_eq!(vec![2.0, 1.0, 6.0, 2.0], values);
        assert_eq!(vec![4.0, 0.5, 12.0, 1.0], variances);
    }

    #[test]
    fn uncertain_response() {
        let (values, variances) = process(&[3.0], &[3.0], &[2.0], Some(&[0.25])).unwrap();
        assert_eq!(vec![6.0], values);
        // 2² * 3 + 3² * 0.25
        assert_eq!(vec![14.25], variances);
    }

    #[test]
    fn size_mismatch() {
        assert!(matches!(
            process(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0], &[1.0, 1.0], None),
            Err(ReductionError::IncompatibleShapes { .. })
        ));
    }

    #[test]
    fn prepared_kernel_uses_response_errors() {
        // Arrange
        let mut store = MemoryStore::new();
        let id = store
            .insert(
                "response",
                ArrayD::from_elem(IxDyn(&[2, 2]), 2.0),
                Some(ArrayD::from_elem(IxDyn(&[2, 2]), 0.5)),
            )
            .unwrap();
        let geometry = InputGeometry {
            shape: vec![3, 2, 2],
            detector_dims: 2,
        };
        let kernel = DetectorResponse::prepare(
            &StoreLock::new(store),
            &geometry,
            &DetectorResponseParams { response: id },
        )
        .unwrap();
        let frame = Frame::from_counts(vec![4.0; 4], vec![1, 2, 2]).unwrap();

        // Act
        let output = kernel.process(&[0], frame).unwrap();

        // Assert
        assert_eq!(vec![8.0; 4], output[0].values);
        // 2² * 4 + 4² * 0.5²
        assert_eq!(vec![20.0; 4], output[0].variances);
    }

    #[test]
    fn prepared_kernel_rejects_wrong_shape() {
        let mut store = MemoryStore::new();
        let id = store
            .insert("response", ArrayD::from_elem(IxDyn(&[4]), 1.0), None)
            .unwrap();
        let geometry = InputGeometry {
            shape: vec![3, 2, 2],
            detector_dims: 2,
        };
        assert!(matches!(
            DetectorResponse::prepare(
                &StoreLock::new(store),
                &geometry,
                &DetectorResponseParams { response: id }
            ),
            Err(ReductionError::IncompatibleShapes { .. })
        ));
    }
}
