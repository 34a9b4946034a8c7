//! This crate provides a grid-parallel slice reduction engine for non-crystalline diffraction
//! (SAXS/WAXS) detector data. A scan is stored as one N-dimensional array whose leading "grid"
//! axes index frames (time, raster position) and whose trailing one or two axes are detector
//! pixels. Each reduction stage carves the array into grid cells, runs a numerical transform on
//! every cell with explicit variance propagation, and writes the results into a new array.
//!
//! The engine is built on top of a number of open source components.
//!
//! * [ndarray] provides the n-dimensional arrays and slicing used by the in-memory store and
//!   the kernels.
//! * [rayon] runs the per-cell leaf tasks on a bounded fork/join thread pool.
//! * [Serde](serde) and [validator] deserialise and check stage requests and configuration.
//! * [tracing] and [prometheus] provide logging and metrics.
//!
//! A stage is described by a [models::StageRequest] or built directly as a [reducer::Stage],
//! and run with [reducer::ParallelReducer::run] against a [store::StoreLock].

pub mod array;
pub mod config;
pub mod error;
pub mod error_model;
pub mod frame;
pub mod grid;
pub mod metrics;
pub mod models;
pub mod numeric;
pub mod reducer;
pub mod slice;
pub mod store;
#[cfg(test)]
pub mod test_utils;
pub mod tracing;
pub mod transforms;
