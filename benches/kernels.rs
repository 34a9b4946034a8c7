/// Benchmarks for the reduction kernels and the reducer.
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ncd_reduction::config::EngineConfig;
use ncd_reduction::models::{AverageParams, SectorRoi, Symmetry, Transform};
use ncd_reduction::reducer::{ParallelReducer, Stage};
use ncd_reduction::store::{MemoryStore, StoreLock};
use ncd_reduction::transforms::invariant::saxs_invariant;
use ncd_reduction::transforms::sector::{AreaWeights, SectorAxis};
use ncd_reduction::transforms::{background, detector_response};
use ndarray::{ArrayD, IxDyn};

fn criterion_benchmark(c: &mut Criterion) {
    for side in [64, 256, 1024] {
        let size = side * side;
        let data: Vec<f32> = (0..size).map(|i| (i % 256) as f32).collect();
        let variance: Vec<f64> = data.iter().map(|v| f64::from(*v)).collect();
        let reference = vec![1.5_f32; size];
        let reference_variance = vec![0.5_f64; size];

        c.bench_function(&format!("background({side}x{side})"), |b| {
            b.iter(|| {
                background::process(
                    black_box(&data),
                    &variance,
                    &reference,
                    &reference_variance,
                    &[side, side],
                    &[1, side, side],
                )
                .unwrap()
            })
        });
        c.bench_function(&format!("detector_response({side}x{side})"), |b| {
            b.iter(|| {
                detector_response::process(
                    black_box(&data),
                    &variance,
                    &reference,
                    Some(&reference_variance),
                )
                .unwrap()
            })
        });

        let mut roi = SectorRoi::new(
            [side as f64 / 2.0, side as f64 / 2.0],
            [0.0, side as f64 / 2.0],
            [0.0, 0.0],
        );
        roi.symmetry = Symmetry::Full;
        for fast in [true, false] {
            c.bench_function(&format!("area_weights({side}x{side}, fast={fast})"), |b| {
                b.iter(|| AreaWeights::new(black_box(&roi), [side, side], None, fast).unwrap())
            });
            let weights = AreaWeights::new(&roi, [side, side], None, fast).unwrap();
            c.bench_function(&format!("sector({side}x{side}, fast={fast})"), |b| {
                b.iter(|| {
                    weights
                        .integrate(SectorAxis::Radial, black_box(&data), &variance)
                        .unwrap()
                })
            });
        }
    }

    for points in [64, 256, 1024] {
        let q: Vec<f64> = (1..=points).map(|k| k as f64 * 0.01).collect();
        let intensity: Vec<f64> = q.iter().map(|q| 1.0 / (1.0 + q.powi(4))).collect();
        let variance = intensity.clone();
        c.bench_function(&format!("saxs_invariant({points})"), |b| {
            b.iter(|| saxs_invariant(black_box(&intensity), &variance, &q))
        });
    }

    for threads in [1, 4] {
        let config = EngineConfig {
            threads: Some(threads),
            ..Default::default()
        };
        let reducer = ParallelReducer::new(&config).unwrap();
        let shape = [4, 32, 64, 64];
        let values = ArrayD::from_shape_fn(IxDyn(&shape), |index| (index[1] + index[3]) as f32);
        c.bench_function(&format!("average_stage(threads={threads})"), |b| {
            b.iter(|| {
                let mut store = MemoryStore::new();
                let input = store.insert("scan", values.clone(), None).unwrap();
                let store = StoreLock::new(store);
                let stage = Stage::new(
                    "average",
                    input,
                    2,
                    Transform::Average(AverageParams::default()),
                );
                reducer.run(&store, &stage)
            })
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
