//! Fork/join execution of a stage over the grid.
//!
//! A stage is planned once, creating its output datasets and preparing any reference arrays,
//! then run as one leaf task per output cell on a rayon thread pool. Leaves read their slice
//! under the store lock, transform it, and write the result back under the same lock.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tracing::{event, Level};
use validator::Validate;

use crate::config::EngineConfig;
use crate::error::{ErrorClass, FailureReport, ReductionError};
use crate::frame::Frame;
use crate::grid::{GridCursor, SelectionMask};
use crate::metrics;
use crate::models::{StageRequest, Transform};
use crate::slice;
use crate::store::{DatasetId, SliceStore, StoreLock};
use crate::transforms::average::GridAccumulator;
use crate::transforms::{InputGeometry, Kernel, OutputSpec, Plan};

/// Cooperative cancellation flag shared between a stage and its caller.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Returns a token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Leaves that have not yet written stop before their next store access.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), ReductionError> {
        if self.is_cancelled() {
            Err(ReductionError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// One stage of a reduction pipeline.
#[derive(Clone, Debug)]
pub struct Stage {
    /// Stage name, used as the prefix of its output datasets
    pub name: String,
    /// Dataset to read
    pub input: DatasetId,
    /// Number of trailing detector dimensions of the input
    pub detector_dims: usize,
    /// Grid cells to process. `None` processes every cell.
    pub mask: Option<SelectionMask>,
    /// Transform applied to each cell
    pub transform: Transform,
    cancellation: CancellationToken,
}

impl Stage {
    /// Returns a stage over every grid cell of `input`.
    pub fn new(name: &str, input: DatasetId, detector_dims: usize, transform: Transform) -> Self {
        Stage {
            name: name.to_string(),
            input,
            detector_dims,
            mask: None,
            transform,
            cancellation: CancellationToken::new(),
        }
    }

    /// Restrict the stage to the cells selected by `mask`.
    pub fn with_mask(mut self, mask: SelectionMask) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Build a stage from a request, resolving its selection against the input's grid.
    pub fn from_request<S: SliceStore>(
        store: &StoreLock<S>,
        request: &StageRequest,
    ) -> Result<Self, ReductionError> {
        request.validate()?;
        let stage = Stage::new(
            &request.name,
            request.input,
            request.detector_dims,
            request.transform.clone(),
        );
        match &request.selection {
            Some(selection) => {
                let geometry = geometry(store, &stage)?;
                let mask = SelectionMask::from_selection(selection, geometry.grid())?;
                event!(
                    Level::DEBUG,
                    selected = mask.count(),
                    "resolved selection {:?}",
                    selection
                );
                Ok(stage.with_mask(mask))
            }
            None => Ok(stage),
        }
    }

    /// Token that cancels this stage, and every clone of it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}

/// Dataset written by a stage.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StageOutput {
    pub name: String,
    pub id: DatasetId,
    pub shape: Vec<usize>,
}

/// Summary of a completed stage.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub outputs: Vec<StageOutput>,
    /// Number of leaf tasks run
    pub leaves: usize,
    /// Scalar results for downstream stages, such as a fitted Porod slope
    pub metadata: BTreeMap<String, f64>,
}

/// How a stage ended.
#[derive(Debug)]
pub enum StageOutcome {
    Completed(StageReport),
    Failed(ReductionError),
    /// Cells written by leaves that completed before cancellation keep their values.
    Cancelled { completed_leaves: usize },
}

impl StageOutcome {
    /// The report of a completed stage.
    pub fn report(&self) -> Option<&StageReport> {
        match self {
            StageOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }

    /// Describes why the stage did not complete.
    pub fn failure_report(&self) -> Option<FailureReport> {
        match self {
            StageOutcome::Completed(_) => None,
            StageOutcome::Failed(error) => Some(FailureReport::from(error)),
            StageOutcome::Cancelled { .. } => Some(FailureReport::new(&ReductionError::Cancelled)),
        }
    }
}

/// Runs stages on a bounded worker pool.
pub struct ParallelReducer {
    pool: rayon::ThreadPool,
    metrics: bool,
}

impl ParallelReducer {
    /// Returns a reducer with a worker pool sized by `config`.
    pub fn new(config: &EngineConfig) -> Result<Self, ReductionError> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads())
            .thread_name(|index| format!("ncd-reduction-{index}"))
            .build()?;
        if config.metrics {
            metrics::register_metrics()?;
        }
        Ok(ParallelReducer {
            pool,
            metrics: config.metrics,
        })
    }

    /// Build and run the stage described by `request`.
    pub fn run_request<S: SliceStore>(
        &self,
        store: &StoreLock<S>,
        request: &StageRequest,
    ) -> StageOutcome {
        match Stage::from_request(store, request) {
            Ok(stage) => self.run(store, &stage),
            Err(error) => StageOutcome::Failed(error),
        }
    }

    /// Run a stage to completion, failure or cancellation.
    #[tracing::instrument(level = "DEBUG", skip(self, store, stage), fields(stage = %stage.name))]
    pub fn run<S: SliceStore>(&self, store: &StoreLock<S>, stage: &Stage) -> StageOutcome {
        let started = Instant::now();
        let planned = stage
            .transform
            .validate()
            .map_err(ReductionError::from)
            .and_then(|_| geometry(store, stage))
            .and_then(|geometry| Ok((stage.transform.plan(store, &geometry)?, geometry)));
        let outcome = match planned {
            Ok((plan, geometry)) => self.execute(store, stage, geometry, plan),
            Err(error) => StageOutcome::Failed(error),
        };

        match &outcome {
            StageOutcome::Completed(report) => event!(
                Level::INFO,
                leaves = report.leaves,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "stage completed"
            ),
            StageOutcome::Failed(error) => {
                event!(Level::WARN, class = %error.class(), "stage failed: {}", error)
            }
            StageOutcome::Cancelled { completed_leaves } => {
                event!(Level::WARN, completed_leaves, "stage cancelled")
            }
        }
        if self.metrics {
            metrics::record_stage_duration(&stage.name, started.elapsed());
        }
        outcome
    }

    fn execute<S: SliceStore>(
        &self,
        store: &StoreLock<S>,
        stage: &Stage,
        geometry: InputGeometry,
        plan: Plan,
    ) -> StageOutcome {
        let leaves = match Leaves::new(store, stage, geometry, &plan) {
            Ok(leaves) => leaves,
            Err(error) => return StageOutcome::Failed(error),
        };
        let positions = match leaves.positions(&plan) {
            Ok(positions) => positions,
            Err(error) => return StageOutcome::Failed(error),
        };

        let first_error: Mutex<Option<ReductionError>> = Mutex::new(None);
        let failed = AtomicBool::new(false);
        let completed = AtomicUsize::new(0);
        let leaf = |position: Vec<usize>| {
            if failed.load(Ordering::SeqCst) {
                return;
            }
            let result = catch_unwind(AssertUnwindSafe(|| leaves.run(&plan, &position)))
                .unwrap_or_else(|payload| Err(ReductionError::LeafPanicked(panic_message(payload))));
            let label = match result {
                Ok(()) => {
                    completed.fetch_add(1, Ordering::SeqCst);
                    "completed"
                }
                Err(error) => {
                    let label = match error.class() {
                        ErrorClass::Cancelled => "cancelled",
                        _ => "failed",
                    };
                    failed.store(true, Ordering::SeqCst);
                    first_error
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get_or_insert(error);
                    label
                }
            };
            if self.metrics {
                metrics::record_leaf(&stage.name, label);
            }
        };

        self.pool.install(|| {
            rayon::scope(|scope| {
                let leaf = &leaf;
                let mut positions = positions;
                let first = positions.next();
                for position in positions {
                    scope.spawn(move |_| leaf(position));
                }
                if let Some(position) = first {
                    leaf(position);
                }
            })
        });

        let completed_leaves = completed.load(Ordering::SeqCst);
        match first_error.into_inner().unwrap_or_else(PoisonError::into_inner) {
            None => {
                let metadata = match &plan {
                    Plan::Frames(kernel) => kernel.metadata(),
                    _ => BTreeMap::new(),
                };
                let report = StageReport {
                    stage: stage.name.clone(),
                    outputs: leaves.outputs,
                    leaves: completed_leaves,
                    metadata,
                };
                StageOutcome::Completed(report)
            }
            Some(ReductionError::Cancelled) => StageOutcome::Cancelled { completed_leaves },
            Some(error) => StageOutcome::Failed(error),
        }
    }
}

/// Geometry of a stage's input.
fn geometry<S: SliceStore>(store: &StoreLock<S>, stage: &Stage) -> Result<InputGeometry, ReductionError> {
    let shape = store.shape_of(stage.input)?;
    if shape.len() < stage.detector_dims {
        return Err(ReductionError::ShapeMismatch {
            shape,
            position: Vec::new(),
        });
    }
    Ok(InputGeometry {
        shape,
        detector_dims: stage.detector_dims,
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .unwrap_or_else(|| "unknown panic".to_string()),
    }
}

/// Everything a leaf needs, shared read-only between leaves.
struct Leaves<'a, S> {
    store: &'a StoreLock<S>,
    stage: &'a Stage,
    geometry: InputGeometry,
    output_grid: Vec<usize>,
    outputs: Vec<StageOutput>,
}

impl<'a, S: SliceStore> Leaves<'a, S> {
    /// Check the mask and create the output datasets.
    fn new(
        store: &'a StoreLock<S>,
        stage: &'a Stage,
        geometry: InputGeometry,
        plan: &Plan,
    ) -> Result<Self, ReductionError> {
        let grid = geometry.grid();
        if let Some(mask) = &stage.mask {
            if mask.shape() != grid {
                return Err(ReductionError::InvalidMask {
                    mask: mask.shape().to_vec(),
                    expected: grid.to_vec(),
                });
            }
        }

        let (output_grid, specs) = match plan {
            Plan::Frames(kernel) => (kernel.output_grid(grid), kernel.outputs()),
            Plan::Average { axes } => {
                let mut output_grid = grid.to_vec();
                for axis in axes {
                    output_grid[*axis] = 1;
                }
                let spec = OutputSpec {
                    name: "average",
                    image_shape: geometry.image().to_vec(),
                };
                (output_grid, vec![spec])
            }
            Plan::Selection { indices } => {
                let spec = OutputSpec {
                    name: "selection",
                    image_shape: geometry.image().to_vec(),
                };
                (indices.iter().map(Vec::len).collect(), vec![spec])
            }
        };

        let mut locked = store.lock()?;
        let outputs = specs
            .into_iter()
            .map(|spec| {
                let name = format!("{}/{}", stage.name, spec.name);
                let mut shape = output_grid.clone();
                shape.extend(spec.image_shape);
                let id = locked.create(&name, &shape)?;
                Ok(StageOutput { name, id, shape })
            })
            .collect::<Result<Vec<_>, ReductionError>>()?;
        drop(locked);

        Ok(Leaves {
            store,
            stage,
            geometry,
            output_grid,
            outputs,
        })
    }

    /// Positions of the leaves to run, in row-major order.
    fn positions(
        &self,
        plan: &Plan,
    ) -> Result<Box<dyn Iterator<Item = Vec<usize>> + Send + '_>, ReductionError> {
        match plan {
            // Reductions apply the mask inside the leaf.
            Plan::Average { .. } | Plan::Selection { .. } => {
                Ok(Box::new(GridCursor::new(&self.output_grid, None)?))
            }
            Plan::Frames(_) => {
                let cursor = GridCursor::new(self.geometry.grid(), self.stage.mask.as_ref())?;
                let output_grid = &self.output_grid;
                Ok(Box::new(cursor.filter(move |position| {
                    position
                        .iter()
                        .zip(output_grid)
                        .all(|(index, length)| index < length)
                })))
            }
        }
    }

    fn grid_rank(&self) -> usize {
        self.output_grid.len()
    }

    fn slice_dim(&self) -> usize {
        self.grid_rank().saturating_sub(1)
    }

    fn run(&self, plan: &Plan, position: &[usize]) -> Result<(), ReductionError> {
        self.stage.cancellation.check()?;
        match plan {
            Plan::Frames(kernel) => self.frame_leaf(kernel.as_ref(), position),
            Plan::Average { axes } => self.average_leaf(axes, position),
            Plan::Selection { indices } => self.selection_leaf(indices, position),
        }
    }

    /// Read one input cell.
    fn read(&self, slice_dim: usize, slice_size: usize, position: &[usize]) -> Result<Frame, ReductionError> {
        let window = slice::compute(
            &self.geometry.shape,
            self.geometry.detector_dims,
            slice_dim,
            slice_size,
            position,
        )?;
        self.stage.cancellation.check()?;
        let data = self.store.read(self.stage.input, &window)?;
        Frame::from_slice(data, self.geometry.detector_dims)
    }

    /// Write one frame per output at `position`, under a single lock acquisition.
    fn write(&self, position: &[usize], frames: Vec<Frame>) -> Result<(), ReductionError> {
        let windows = self
            .outputs
            .iter()
            .map(|output| {
                let image_rank = output.shape.len() - self.grid_rank();
                slice::compute(&output.shape, image_rank, self.slice_dim(), 1, position)
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.stage.cancellation.check()?;
        let mut store = self.store.lock()?;
        for ((output, window), frame) in self.outputs.iter().zip(&windows).zip(frames) {
            store.write(output.id, window, &frame.values, &frame.errors())?;
        }
        Ok(())
    }

    fn frame_leaf(&self, kernel: &dyn Kernel, position: &[usize]) -> Result<(), ReductionError> {
        let frame = self.read(self.slice_dim(), 1, position)?;
        self.stage.cancellation.check()?;
        let frames = kernel.process(position, frame)?;
        self.write(position, frames)
    }

    /// Average every selected cell that collapses onto `position`.
    ///
    /// Cells are read in batches along the innermost averaged axis.
    fn average_leaf(&self, axes: &[usize], position: &[usize]) -> Result<(), ReductionError> {
        let grid = self.geometry.grid();
        let inner = axes.iter().max().copied();
        let mut outer_shape = vec![1; grid.len()];
        for axis in axes.iter().filter(|axis| Some(**axis) != inner) {
            outer_shape[*axis] = grid[*axis];
        }
        let (slice_dim, slice_size) = match inner {
            Some(axis) => (axis, grid[axis]),
            None => (self.slice_dim(), 1),
        };

        let mut accumulator = GridAccumulator::new(self.geometry.image());
        for offset in GridCursor::new(&outer_shape, None)? {
            let start: Vec<usize> = position.iter().zip(&offset).map(|(p, o)| p + o).collect();
            let frame = self.read(slice_dim, slice_size, &start)?;
            match &self.stage.mask {
                Some(mask) => accumulator.add(&frame, |index| {
                    let mut cell = start.clone();
                    if let Some(axis) = inner {
                        cell[axis] = index;
                    }
                    mask.is_selected(&cell)
                })?,
                None => accumulator.add(&frame, |_| true)?,
            }
        }
        if accumulator.count() == 0 {
            event!(Level::WARN, ?position, "no selected cells to average");
        }
        self.write(position, vec![accumulator.finish()?])
    }

    /// Copy the input cell selected for `position`.
    fn selection_leaf(&self, indices: &[Vec<usize>], position: &[usize]) -> Result<(), ReductionError> {
        let source: Vec<usize> = position
            .iter()
            .zip(indices)
            .map(|(index, list)| list[*index])
            .collect();
        if let Some(mask) = &self.stage.mask {
            if !mask.is_selected(&source) {
                return Ok(());
            }
        }
        let frame = self.read(self.slice_dim(), 1, &source)?;
        self.write(position, vec![frame])
    }
}
