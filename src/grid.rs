//! Grid enumeration and selection.
//!
//! The grid is made up of every array axis outside the trailing detector axes. Positions are
//! enumerated in row-major order (last grid axis fastest), which is also the order in which
//! background and calibration tables are indexed.

use ndarray::{ArrayD, IxDyn};

use crate::error::ReductionError;

/// Boolean mask over grid positions. `true` includes the cell.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectionMask {
    selected: ArrayD<bool>,
}

impl SelectionMask {
    /// Returns a mask selecting every cell of the grid.
    pub fn all(grid_shape: &[usize]) -> Self {
        SelectionMask {
            selected: ArrayD::from_elem(IxDyn(grid_shape), true),
        }
    }

    /// Returns a mask wrapping an existing boolean array.
    pub fn from_array(selected: ArrayD<bool>) -> Self {
        SelectionMask { selected }
    }

    /// Returns a mask selecting the cells named by a selection string.
    ///
    /// See [parse_selection] for the format.
    pub fn from_selection(format: &str, grid_shape: &[usize]) -> Result<Self, ReductionError> {
        let lists = parse_selection(format, grid_shape)?;
        let mut selected = ArrayD::from_elem(IxDyn(grid_shape), false);
        let list_shape: Vec<usize> = lists.iter().map(Vec::len).collect();
        for index in GridCursor::new(&list_shape, None)? {
            let position: Vec<usize> = index
                .iter()
                .zip(&lists)
                .map(|(i, list)| list[*i])
                .collect();
            selected[IxDyn(&position)] = true;
        }
        Ok(SelectionMask { selected })
    }

    /// Shape of the grid covered by the mask.
    pub fn shape(&self) -> &[usize] {
        self.selected.shape()
    }

    /// Whether the cell at `position` is selected. Positions outside the mask are not.
    pub fn is_selected(&self, position: &[usize]) -> bool {
        self.selected.get(IxDyn(position)).copied().unwrap_or(false)
    }

    /// Number of selected cells.
    pub fn count(&self) -> usize {
        self.selected.iter().filter(|selected| **selected).count()
    }
}

/// Lazy row-major enumeration of grid positions, optionally filtered by a [SelectionMask].
///
/// A cursor is cheap to clone, so every task may take its own copy.
#[derive(Clone, Debug)]
pub struct GridCursor<'m> {
    shape: Vec<usize>,
    next: Option<Vec<usize>>,
    mask: Option<&'m SelectionMask>,
}

impl<'m> GridCursor<'m> {
    /// Returns a cursor positioned before the first cell of the grid.
    ///
    /// # Arguments
    ///
    /// * `grid_shape`: Shape of the grid
    /// * `mask`: Optional mask, which must have exactly the grid's shape
    pub fn new(grid_shape: &[usize], mask: Option<&'m SelectionMask>) -> Result<Self, ReductionError> {
        if let Some(mask) = mask {
            if mask.shape() != grid_shape {
                return Err(ReductionError::InvalidMask {
                    mask: mask.shape().to_vec(),
                    expected: grid_shape.to_vec(),
                });
            }
        }
        // A grid with an empty axis has no cells. A grid of rank zero has exactly one.
        let next = if grid_shape.contains(&0) {
            None
        } else {
            Some(vec![0; grid_shape.len()])
        };
        Ok(GridCursor {
            shape: grid_shape.to_vec(),
            next,
            mask,
        })
    }

    fn advance(&self, current: &[usize]) -> Option<Vec<usize>> {
        let mut next = current.to_vec();
        for dim in (0..next.len()).rev() {
            next[dim] += 1;
            if next[dim] < self.shape[dim] {
                return Some(next);
            }
            next[dim] = 0;
        }
        None
    }
}

impl Iterator for GridCursor<'_> {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let current = self.next.take()?;
            self.next = self.advance(&current);
            match self.mask {
                Some(mask) if !mask.is_selected(&current) => continue,
                _ => return Some(current),
            }
        }
    }
}

/// Parse one comma separated list of indices and inclusive ranges.
///
/// Items are `a`, `a-b`, `-b` or `a-`, with open ends defaulting to `lower` and the last index
/// below `upper`. Returns an empty list when nothing in range was named.
fn parse_ranges(field: &str, lower: usize, upper: usize) -> Result<Vec<usize>, ReductionError> {
    let parse = |text: &str, item: &str| -> Result<Option<usize>, ReductionError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        text.parse::<usize>()
            .map(Some)
            .map_err(|_| ReductionError::InvalidSelection {
                item: item.to_string(),
            })
    };

    let mut indices = Vec::new();
    for item in field.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        let (first, last) = match item.split_once('-') {
            Some((first, last)) => (parse(first, item)?, parse(last, item)?),
            None => {
                let index = parse(item, item)?;
                (index, index)
            }
        };
        if let (Some(first), Some(last)) = (first, last) {
            if first > last {
                return Err(ReductionError::InvalidSelection {
                    item: item.to_string(),
                });
            }
        }
        let start = first.unwrap_or(lower).max(lower);
        let end = last.map_or(upper, |last| last.saturating_add(1).min(upper));
        for index in start..end {
            if !indices.contains(&index) {
                indices.push(index);
            }
        }
    }
    Ok(indices)
}

/// Parse a selection string into one index list per grid axis.
///
/// Axes are separated by `;` and items within an axis by `,`. Each item is an index `a` or an
/// inclusive range `a-b`, `-b` or `a-`; a range with `a > b` is rejected. Indices are clamped to the axis, duplicates are dropped
/// and the order of first appearance is kept. An axis with an empty field, or whose items all
/// fall outside the axis, selects the whole axis.
///
/// # Arguments
///
/// * `format`: Selection string, for example `"0-3,5;;1"`
/// * `grid_shape`: Shape of the grid
pub fn parse_selection(
    format: &str,
    grid_shape: &[usize],
) -> Result<Vec<Vec<usize>>, ReductionError> {
    let fields: Vec<&str> = format.split(';').collect();
    grid_shape
        .iter()
        .enumerate()
        .map(|(dim, length)| {
            let field = fields.get(dim).copied().unwrap_or("");
            let indices = parse_ranges(field, 0, *length)?;
            if indices.is_empty() {
                Ok((0..*length).collect())
            } else {
                Ok(indices)
            }
        })
        .collect()
}

/// Parse a list of 1-based grid axes into 0-based axis indices.
///
/// Uses the item syntax of [parse_selection]. Axes are clamped to `1..=grid_rank`; an empty
/// format, or one naming no valid axis, selects every grid axis.
pub fn parse_grid_axes(format: &str, grid_rank: usize) -> Result<Vec<usize>, ReductionError> {
    let axes = parse_ranges(format, 1, grid_rank + 1)?;
    if axes.is_empty() {
        Ok((0..grid_rank).collect())
    } else {
        Ok(axes.into_iter().map(|axis| axis - 1).collect())
    }
}
