//! The transform library.
//!
//! Every per-frame transform is a [Kernel]: it takes one frame (values, variances and shape)
//! read at a grid position and returns one frame per output dataset. Reference arrays such as
//! backgrounds, calibration tables and area weights are prepared once by [Transform::plan]
//! before any leaf runs, and are only read afterwards.

pub mod average;
pub mod background;
pub mod detector_response;
pub mod invariant;
pub mod normalisation;
pub mod orientation;
pub mod sector;

use std::collections::BTreeMap;

use crate::array::{image_size, split_shape};
use crate::error::ReductionError;
use crate::frame::Frame;
use crate::grid::parse_grid_axes;
use crate::grid::parse_selection;
use crate::models::Transform;
use crate::store::{SliceStore, StoreLock};

/// Shape of the dataset a stage reads.
#[derive(Clone, Debug, PartialEq)]
pub struct InputGeometry {
    pub shape: Vec<usize>,
    pub detector_dims: usize,
}

impl InputGeometry {
    /// Grid part of the shape.
    pub fn grid(&self) -> &[usize] {
        split_shape(&self.shape, self.detector_dims).0
    }

    /// Detector part of the shape.
    pub fn image(&self) -> &[usize] {
        split_shape(&self.shape, self.detector_dims).1
    }

    /// Number of pixels in one image.
    pub fn image_size(&self) -> usize {
        image_size(&self.shape, self.detector_dims)
    }
}

/// One dataset written by a kernel.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputSpec {
    /// Suffix appended to the stage name
    pub name: &'static str,
    /// Shape of one output image
    pub image_shape: Vec<usize>,
}

/// A per-frame transform ready to run.
pub trait Kernel: Send + Sync {
    /// Datasets written per grid position, in the order returned by [Kernel::process].
    fn outputs(&self) -> Vec<OutputSpec>;

    /// Grid shape of the outputs.
    fn output_grid(&self, grid_shape: &[usize]) -> Vec<usize> {
        grid_shape.to_vec()
    }

    /// Transform the frame read at `position`.
    ///
    /// # Arguments
    ///
    /// * `position`: Grid position the frame was read from
    /// * `frame`: Frame of shape `[frames, detector...]`
    fn process(&self, position: &[usize], frame: Frame) -> Result<Vec<Frame>, ReductionError>;

    /// Scalar metadata describing the stage, collected once all leaves have run.
    fn metadata(&self) -> BTreeMap<String, f64> {
        BTreeMap::new()
    }
}

/// How a stage is executed.
pub enum Plan {
    /// One leaf per grid position, each running the kernel.
    Frames(Box<dyn Kernel>),
    /// One leaf per output cell, each averaging its contributing cells.
    Average { axes: Vec<usize> },
    /// One leaf per output cell, each copying the selected input cell.
    Selection { indices: Vec<Vec<usize>> },
}

impl Transform {
    /// Prepare the transform for an input, reading any reference datasets it needs.
    ///
    /// All configuration errors surface here, before any leaf runs.
    pub fn plan<S: SliceStore>(
        &self,
        store: &StoreLock<S>,
        input: &InputGeometry,
    ) -> Result<Plan, ReductionError> {
        let grid_rank = input.grid().len();
        let plan = match self {
            Transform::Average(params) => {
                let axes = match &params.grid_axes {
                    Some(format) => parse_grid_axes(format, grid_rank)?,
                    None => grid_rank.checked_sub(1).into_iter().collect(),
                };
                Plan::Average { axes }
            }
            Transform::Selection(params) => Plan::Selection {
                indices: parse_selection(&params.format, input.grid())?,
            },
            Transform::BackgroundSubtraction(params) => Plan::Frames(Box::new(
                background::BackgroundSubtraction::prepare(store, input, params)?,
            )),
            Transform::Normalisation(params) => Plan::Frames(Box::new(
                normalisation::Normalisation::prepare(store, input, params)?,
            )),
            Transform::DetectorResponse(params) => Plan::Frames(Box::new(
                detector_response::DetectorResponse::prepare(store, input, params)?,
            )),
            Transform::SectorIntegration(params) => Plan::Frames(Box::new(
                sector::SectorIntegration::prepare(store, input, params)?,
            )),
            Transform::Invariant => Plan::Frames(Box::new(invariant::Invariant)),
            Transform::SaxsInvariant(params) => Plan::Frames(Box::new(
                invariant::SaxsInvariant::prepare(store, input, params)?,
            )),
            Transform::DegreeOfOrientation(params) => Plan::Frames(Box::new(
                orientation::DegreeOfOrientation::prepare(store, input, params)?,
            )),
        };
        Ok(plan)
    }
}

/// Read a one-dimensional axis dataset whose length must match the profile length.
pub(crate) fn read_axis<S: SliceStore>(
    store: &StoreLock<S>,
    input: &InputGeometry,
    params: &crate::models::AxisParams,
) -> Result<Vec<f64>, ReductionError> {
    let axis = store.read_all(params.axis)?;
    if input.detector_dims != 1 || axis.values.len() != input.image_size() {
        return Err(ReductionError::IncompatibleShapes {
            data: input.shape.clone(),
            reference: axis.shape,
            reason: "axis length must match the one-dimensional profile length",
        });
    }
    Ok(axis.values.iter().map(|v| f64::from(*v)).collect())
}
