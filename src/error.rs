//! Error handling.

use ndarray::ShapeError;
use serde::{Deserialize, Serialize};
use std::error::Error;
use strum_macros::Display;
use thiserror::Error;
use tracing::{event, Level};

use crate::store::StoreError;

/// Reduction engine error type
///
/// This type encapsulates the various errors that may occur while preparing or running a stage.
/// Each variant maps onto one [ErrorClass], which decides how the caller should react.
#[derive(Debug, Error)]
pub enum ReductionError {
    /// Grid position does not address the array
    #[error("grid position {position:?} does not address array of shape {shape:?}")]
    ShapeMismatch {
        shape: Vec<usize>,
        position: Vec<usize>,
    },

    /// Reference array cannot be broadcast against the data
    #[error("incompatible shapes: {reason} (data {data:?}, reference {reference:?})")]
    IncompatibleShapes {
        data: Vec<usize>,
        reference: Vec<usize>,
        reason: &'static str,
    },

    /// Sector region of interest is not usable on this detector
    #[error("invalid sector region: {reason}")]
    InvalidRoi { reason: String },

    /// Pixel or grid mask does not match the array it is applied to
    #[error("invalid mask of shape {mask:?} for shape {expected:?}")]
    InvalidMask {
        mask: Vec<usize>,
        expected: Vec<usize>,
    },

    /// Selection string could not be parsed
    #[error("invalid selection item {item:?}")]
    InvalidSelection { item: String },

    /// Error deserialising stage parameters
    #[error("stage parameters are not valid")]
    ParametersJson(#[from] serde_json::Error),

    /// Error validating stage parameters (single error)
    #[error("stage parameters are not valid")]
    ParametersValidationSingle(#[from] validator::ValidationError),

    /// Error validating stage parameters (multiple errors)
    #[error("stage parameters are not valid")]
    ParametersValidation(#[from] validator::ValidationErrors),

    /// Error creating ndarray ArrayView from Shape
    #[error("failed to create array from shape")]
    ShapeInvalid(#[from] ShapeError),

    /// Error reading from or writing to the slice store
    #[error("slice store operation failed")]
    Store(#[from] StoreError),

    /// The store lock was poisoned by a panicking holder
    #[error("slice store lock poisoned")]
    StorePoisoned,

    /// The stage was cancelled
    #[error("stage cancelled")]
    Cancelled,

    /// Error building the worker pool
    #[error("failed to build worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// A leaf task panicked
    #[error("leaf task panicked: {0}")]
    LeafPanicked(String),

    /// Error converting between integer types
    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),

    /// Error registering metrics
    #[error("failed to register metrics")]
    Metrics(#[from] prometheus::Error),
}

/// Classification of a [ReductionError]
#[derive(Clone, Copy, Debug, Deserialize, Display, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Setup mistake upstream. Fatal, not retried.
    Configuration,
    /// Failure reported by the slice store.
    Store,
    /// Cooperative cancellation.
    Cancelled,
    /// Bug or resource failure in the engine itself.
    Internal,
}

impl ReductionError {
    /// Returns the class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            ReductionError::ShapeMismatch { .. }
            | ReductionError::IncompatibleShapes { .. }
            | ReductionError::InvalidRoi { .. }
            | ReductionError::InvalidMask { .. }
            | ReductionError::InvalidSelection { .. }
            | ReductionError::ParametersJson(_)
            | ReductionError::ParametersValidationSingle(_)
            | ReductionError::ParametersValidation(_)
            | ReductionError::ShapeInvalid(_) => ErrorClass::Configuration,

            ReductionError::Store(_) | ReductionError::StorePoisoned => ErrorClass::Store,

            ReductionError::Cancelled => ErrorClass::Cancelled,

            ReductionError::ThreadPool(_)
            | ReductionError::LeafPanicked(_)
            | ReductionError::TryFromInt(_)
            | ReductionError::Metrics(_) => ErrorClass::Internal,
        }
    }
}

/// Serialisable description of a failed stage
#[derive(Debug, Deserialize, Serialize)]
pub struct FailureReport {
    /// Error class
    pub class: ErrorClass,

    /// Main error message
    pub message: String,

    /// Optional list of causes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caused_by: Option<Vec<String>>,
}

impl FailureReport {
    /// Return a new FailureReport
    ///
    /// # Arguments
    ///
    /// * `error`: The error that occurred
    pub fn new(error: &ReductionError) -> Self {
        let message = error.to_string();
        let mut caused_by = None;
        let mut current = error.source();
        while let Some(source) = current {
            let mut causes: Vec<String> = caused_by.unwrap_or_default();
            causes.push(source.to_string());
            caused_by = Some(causes);
            current = source.source();
        }
        // Remove duplicate entries.
        if let Some(caused_by) = caused_by.as_mut() {
            caused_by.dedup()
        }
        FailureReport {
            class: error.class(),
            message,
            caused_by,
        }
    }
}

impl From<&ReductionError> for FailureReport {
    /// Convert from a `ReductionError` into a `FailureReport`, logging engine-side failures.
    fn from(error: &ReductionError) -> Self {
        let report = Self::new(error);

        // Log store and internal errors.
        if matches!(report.class, ErrorClass::Store | ErrorClass::Internal) {
            event!(Level::ERROR, "{}", error.to_string());
            let mut current = error.source();
            while let Some(source) = current {
                event!(Level::ERROR, "Caused by: {}", source.to_string());
                current = source.source();
            }
        }

        report
    }
}
