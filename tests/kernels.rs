//! Property tests shared by every kernel.

use ncd_reduction::frame::Frame;
use ncd_reduction::models::SectorRoi;
use ncd_reduction::transforms::average::GridAccumulator;
use ncd_reduction::transforms::sector::{AreaWeights, SectorAxis};
use ncd_reduction::transforms::{background, detector_response, invariant, normalisation};

use proptest::prelude::*;

/// Frames of `[frames, pixels]` with arbitrary values and non-negative variances.
fn frames() -> impl Strategy<Value = (Vec<f32>, Vec<f64>, Vec<usize>)> {
    (1usize..4, 1usize..16).prop_flat_map(|(frames, pixels)| {
        let size = frames * pixels;
        (
            prop::collection::vec(-1e4f32..1e4, size),
            prop::collection::vec(0.0f64..1e4, size),
            Just(vec![frames, pixels]),
        )
    })
}

fn non_negative(variances: &[f64]) -> bool {
    variances.iter().all(|v| *v >= 0.0)
}

proptest! {
    #[test]
    fn background_variance_non_negative(
        (data, variance, shape) in frames(),
        bg_variance in prop::collection::vec(0.0f64..1e4, 16),
    ) {
        let pixels = shape[1];
        let bg = vec![1.0; pixels];
        let (_, variances) = background::process(
            &data, &variance, &bg, &bg_variance[..pixels], &[pixels], &shape,
        ).unwrap();
        prop_assert!(non_negative(&variances));
    }

    #[test]
    fn zero_background_is_identity((data, variance, shape) in frames()) {
        let pixels = shape[1];
        let (values, variances) = background::process(
            &data, &variance, &vec![0.0; pixels], &vec![0.0; pixels], &[pixels], &shape,
        ).unwrap();
        prop_assert_eq!(data, values);
        prop_assert_eq!(variance, variances);
    }

    #[test]
    fn normalisation_variance_non_negative(
        (data, variance, shape) in frames(),
        reading in -10.0f32..10.0,
        scale in -5.0f64..5.0,
    ) {
        let frames = shape[0];
        let calibration = vec![reading; frames];
        let (_, variances) = normalisation::process(
            &data, &variance, &calibration, 0, frames, &shape, &[frames, 1], scale,
        ).unwrap();
        prop_assert!(non_negative(&variances));
    }

    #[test]
    fn detector_response_variance_non_negative(
        (data, variance, shape) in frames(),
        response in -3.0f32..3.0,
        response_variance in 0.0f64..3.0,
    ) {
        let pixels = shape[1];
        let response = vec![response; pixels];
        let response_variance = vec![response_variance; pixels];
        for rv in [None, Some(&response_variance[..])] {
            let (_, variances) =
                detector_response::process(&data, &variance, &response, rv).unwrap();
            prop_assert!(non_negative(&variances));
        }
    }

    #[test]
    fn invariant_variance_non_negative((data, variance, shape) in frames()) {
        let (_, variances) = invariant::process(&data, &variance, shape[1]);
        prop_assert!(non_negative(&variances));
    }

    #[test]
    fn average_variance_non_negative((data, variance, shape) in frames()) {
        let frame = Frame::new(data, variance, shape.clone()).unwrap();
        let mut accumulator = GridAccumulator::new(&shape[1..]);
        accumulator.add(&frame, |_| true).unwrap();
        let mean = accumulator.finish().unwrap();
        prop_assert!(non_negative(&mean.variances));
    }

    #[test]
    fn sector_variance_non_negative(
        values in prop::collection::vec(-1e4f32..1e4, 64),
        variances in prop::collection::vec(0.0f64..1e4, 64),
        fast in any::<bool>(),
    ) {
        let roi = SectorRoi::new([4.0, 4.0], [0.5, 4.0], [0.0, 3.0]);
        let weights = AreaWeights::new(&roi, [8, 8], None, fast).unwrap();
        for axis in [SectorAxis::Radial, SectorAxis::Azimuthal] {
            let (_, profile_variance) = weights.integrate(axis, &values, &variances).unwrap();
            prop_assert!(non_negative(&profile_variance));
        }
    }
}
