use crate::models::*;
use crate::store::{DatasetId, MemoryStore};

use ndarray::{ArrayD, IxDyn};

/// Create a StageRequest averaging the first and third grid axes of a 2D detector scan.
pub(crate) fn get_test_stage_request() -> StageRequest {
    StageRequest {
        name: "average".to_string(),
        input: DatasetId(0),
        detector_dims: 2,
        selection: None,
        transform: Transform::Average(AverageParams {
            grid_axes: Some("1,3".to_string()),
        }),
    }
}

/// Create SectorParams for the upper half of a 64x64 detector.
pub(crate) fn get_test_sector_params() -> SectorParams {
    SectorParams {
        roi: SectorRoi::new([32.0, 32.0], [4.0, 24.0], [0.0, std::f64::consts::PI]),
        mask: None,
        radial: true,
        azimuthal: true,
        fast: false,
    }
}

/// Create a store holding one dataset whose values are their flat index.
///
/// With `errors`, the dataset also carries standard deviations of `sqrt(value)`.
pub(crate) fn get_test_store(shape: &[usize], errors: bool) -> (MemoryStore, DatasetId) {
    let size: usize = shape.iter().product();
    let values = ArrayD::from_shape_vec(IxDyn(shape), (0..size).map(|v| v as f32).collect())
        .unwrap();
    let errors = errors.then(|| values.mapv(|v| f64::from(v).sqrt()));
    let mut store = MemoryStore::new();
    let id = store.insert("input", values, errors).unwrap();
    (store, id)
}
