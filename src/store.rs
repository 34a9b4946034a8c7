//! Slice-addressable storage.
//!
//! The engine never owns whole datasets. It reads and writes windows through a [SliceStore],
//! and every access goes through a [StoreLock], the explicit mutual-exclusion handle handed to
//! the reducer.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::array::{build_array_view, build_slice_info};
use crate::error::ReductionError;
use crate::slice::SliceWindow;

/// Handle of a dataset within a store.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct DatasetId(pub usize);

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Slice store error type
#[derive(Debug, Error)]
pub enum StoreError {
    /// No dataset with this handle
    #[error("unknown dataset {0}")]
    UnknownDataset(DatasetId),

    /// Window does not fit the dataset
    #[error("window {window:?} does not fit dataset {id} of shape {shape:?}")]
    WindowOutOfBounds {
        id: DatasetId,
        window: SliceWindow,
        shape: Vec<usize>,
    },

    /// Buffer length does not match the window
    #[error("buffer of {actual} elements written to window of {expected} elements")]
    LengthMismatch { expected: usize, actual: usize },

    /// Array construction failed
    #[error("invalid dataset shape {0:?}")]
    ShapeInvalid(Vec<usize>),
}

/// Values and optional standard deviations read from one window.
#[derive(Clone, Debug, PartialEq)]
pub struct SliceData {
    pub values: Vec<f32>,
    pub errors: Option<Vec<f64>>,
    /// Shape of the window that was read
    pub shape: Vec<usize>,
}

/// Window-addressable dataset storage.
///
/// Errors are standard deviations. A dataset may have no error channel, in which case readers
/// fall back to counting statistics.
pub trait SliceStore: Send {
    /// Create a NaN-filled dataset with an error channel.
    ///
    /// Cells no leaf writes stay NaN, distinguishing them from computed zeros.
    fn create(&mut self, name: &str, shape: &[usize]) -> Result<DatasetId, StoreError>;

    /// Shape of a dataset.
    fn shape_of(&self, id: DatasetId) -> Result<Vec<usize>, StoreError>;

    /// Whether a dataset carries an error channel.
    fn has_errors(&self, id: DatasetId) -> Result<bool, StoreError>;

    /// Read one window of a dataset.
    fn read(&self, id: DatasetId, window: &SliceWindow) -> Result<SliceData, StoreError>;

    /// Write one window of a dataset.
    fn write(
        &mut self,
        id: DatasetId,
        window: &SliceWindow,
        values: &[f32],
        errors: &[f64],
    ) -> Result<(), StoreError>;
}

/// An in-memory dataset.
#[derive(Clone, Debug)]
struct Dataset {
    name: String,
    values: ArrayD<f32>,
    errors: Option<ArrayD<f64>>,
}

/// [SliceStore] holding every dataset as an [ndarray] array.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    datasets: Vec<Dataset>,
}

impl MemoryStore {
    /// Returns an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dataset built from existing arrays.
    ///
    /// # Arguments
    ///
    /// * `name`: Dataset name
    /// * `values`: Dataset values
    /// * `errors`: Optional standard deviations, which must have the same shape as `values`
    pub fn insert(
        &mut self,
        name: &str,
        values: ArrayD<f32>,
        errors: Option<ArrayD<f64>>,
    ) -> Result<DatasetId, StoreError> {
        if let Some(errors) = &errors {
            if errors.shape() != values.shape() {
                return Err(StoreError::ShapeInvalid(errors.shape().to_vec()));
            }
        }
        self.datasets.push(Dataset {
            name: name.to_string(),
            values,
            errors,
        });
        Ok(DatasetId(self.datasets.len() - 1))
    }

    /// Look up a dataset by name.
    pub fn find(&self, name: &str) -> Option<DatasetId> {
        self.datasets
            .iter()
            .position(|dataset| dataset.name == name)
            .map(DatasetId)
    }

    /// Values of a dataset.
    pub fn values(&self, id: DatasetId) -> Result<&ArrayD<f32>, StoreError> {
        Ok(&self.dataset(id)?.values)
    }

    /// Standard deviations of a dataset, if it has any.
    pub fn errors(&self, id: DatasetId) -> Result<Option<&ArrayD<f64>>, StoreError> {
        Ok(self.dataset(id)?.errors.as_ref())
    }

    fn dataset(&self, id: DatasetId) -> Result<&Dataset, StoreError> {
        self.datasets
            .get(id.0)
            .ok_or(StoreError::UnknownDataset(id))
    }

    fn checked_window(&self, id: DatasetId, window: &SliceWindow) -> Result<&Dataset, StoreError> {
        let dataset = self.dataset(id)?;
        if !window.fits(dataset.values.shape()) {
            return Err(StoreError::WindowOutOfBounds {
                id,
                window: window.clone(),
                shape: dataset.values.shape().to_vec(),
            });
        }
        Ok(dataset)
    }
}

fn slice_info(
    window: &SliceWindow,
) -> Result<ndarray::SliceInfo<Vec<ndarray::SliceInfoElem>, IxDyn, IxDyn>, StoreError> {
    build_slice_info(window).map_err(|_| StoreError::ShapeInvalid(window.block.clone()))
}

impl SliceStore for MemoryStore {
    fn create(&mut self, name: &str, shape: &[usize]) -> Result<DatasetId, StoreError> {
        self.insert(
            name,
            ArrayD::from_elem(IxDyn(shape), f32::NAN),
            Some(ArrayD::from_elem(IxDyn(shape), f64::NAN)),
        )
    }

    fn shape_of(&self, id: DatasetId) -> Result<Vec<usize>, StoreError> {
        Ok(self.dataset(id)?.values.shape().to_vec())
    }

    fn has_errors(&self, id: DatasetId) -> Result<bool, StoreError> {
        Ok(self.dataset(id)?.errors.is_some())
    }

    fn read(&self, id: DatasetId, window: &SliceWindow) -> Result<SliceData, StoreError> {
        let dataset = self.checked_window(id, window)?;
        let info = slice_info(window)?;
        let values = dataset.values.slice(&info).iter().copied().collect();
        let errors = dataset
            .errors
            .as_ref()
            .map(|errors| errors.slice(&info).iter().copied().collect());
        Ok(SliceData {
            values,
            errors,
            shape: window.block.clone(),
        })
    }

    fn write(
        &mut self,
        id: DatasetId,
        window: &SliceWindow,
        values: &[f32],
        errors: &[f64],
    ) -> Result<(), StoreError> {
        self.checked_window(id, window)?;
        for length in [values.len(), errors.len()] {
            if length != window.size() {
                return Err(StoreError::LengthMismatch {
                    expected: window.size(),
                    actual: length,
                });
            }
        }
        let info = slice_info(window)?;
        let invalid = |_| StoreError::ShapeInvalid(window.block.clone());
        let values = build_array_view(&window.block, values).map_err(invalid)?;
        let errors = build_array_view(&window.block, errors).map_err(invalid)?;

        let dataset = self
            .datasets
            .get_mut(id.0)
            .ok_or(StoreError::UnknownDataset(id))?;
        dataset.values.slice_mut(&info).assign(&values);
        let shape = dataset.values.raw_dim();
        dataset
            .errors
            .get_or_insert_with(|| ArrayD::zeros(shape))
            .slice_mut(&info)
            .assign(&errors);
        Ok(())
    }
}

/// Mutual-exclusion handle around a [SliceStore].
///
/// All reads and writes made by a stage go through the same lock.
#[derive(Debug, Default)]
pub struct StoreLock<S> {
    store: Mutex<S>,
}

impl<S: SliceStore> StoreLock<S> {
    /// Returns a lock owning `store`.
    pub fn new(store: S) -> Self {
        StoreLock {
            store: Mutex::new(store),
        }
    }

    /// Acquire the lock.
    pub fn lock(&self) -> Result<MutexGuard<'_, S>, ReductionError> {
        self.store.lock().map_err(|_| ReductionError::StorePoisoned)
    }

    /// Shape of a dataset.
    pub fn shape_of(&self, id: DatasetId) -> Result<Vec<usize>, ReductionError> {
        Ok(self.lock()?.shape_of(id)?)
    }

    /// Whether a dataset carries an error channel.
    pub fn has_errors(&self, id: DatasetId) -> Result<bool, ReductionError> {
        Ok(self.lock()?.has_errors(id)?)
    }

    /// Read one window under the lock.
    pub fn read(&self, id: DatasetId, window: &SliceWindow) -> Result<SliceData, ReductionError> {
        Ok(self.lock()?.read(id, window)?)
    }

    /// Read a whole dataset under the lock.
    pub fn read_all(&self, id: DatasetId) -> Result<SliceData, ReductionError> {
        let store = self.lock()?;
        let window = SliceWindow::full(&store.shape_of(id)?);
        Ok(store.read(id, &window)?)
    }

    /// Write one window under the lock.
    pub fn write(
        &self,
        id: DatasetId,
        window: &SliceWindow,
        values: &[f32],
        errors: &[f64],
    ) -> Result<(), ReductionError> {
        Ok(self.lock()?.write(id, window, values, errors)?)
    }

    /// Create a dataset under the lock.
    pub fn create(&self, name: &str, shape: &[usize]) -> Result<DatasetId, ReductionError> {
        Ok(self.lock()?.create(name, shape)?)
    }

    /// Returns the store, consuming the lock.
    pub fn into_inner(self) -> Result<S, ReductionError> {
        self.store
            .into_inner()
            .map_err(|_| ReductionError::StorePoisoned)
    }
}
