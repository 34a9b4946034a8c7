//! Sector integration.
//!
//! A sector is an annulus, optionally cut to an angular range, on a 2D detector. Integration
//! bins its pixels by radius (radial profile) and by angle (azimuthal profile), normalising
//! every bin by the area of the pixels that fall into it.

use std::collections::BTreeMap;
use std::f64::consts::TAU;

use tracing::{event, Level};

use crate::error::ReductionError;
use crate::frame::Frame;
use crate::models::{SectorParams, SectorRoi, Symmetry};
use crate::store::{SliceStore, StoreLock};
use crate::transforms::{InputGeometry, Kernel, OutputSpec};

/// Subsamples per pixel side in exact mode.
const SUBSAMPLES: usize = 4;

/// Upper bound on the bins of either profile.
const MAX_BINS: usize = 1 << 20;

/// Profile direction
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SectorAxis {
    Radial,
    Azimuthal,
}

/// Pixel contributions to the bins of one profile.
#[derive(Clone, Debug, Default)]
struct Bins {
    /// `(pixel, bin, fraction)` triples, ordered by pixel
    contributions: Vec<(usize, usize, f64)>,
    /// Total contributing area of each bin
    area: Vec<f64>,
}

impl Bins {
    fn new(count: usize) -> Self {
        Bins {
            contributions: Vec::new(),
            area: vec![0.0; count],
        }
    }

    fn add(&mut self, pixel: usize, fractions: &BTreeMap<usize, f64>) {
        for (bin, fraction) in fractions {
            self.contributions.push((pixel, *bin, *fraction));
            self.area[*bin] += fraction;
        }
    }

    fn integrate(&self, values: &[f32], variances: &[f64]) -> (Vec<f32>, Vec<f64>) {
        let mut sum = vec![0.0_f64; self.area.len()];
        let mut variance = vec![0.0_f64; self.area.len()];
        for (pixel, bin, fraction) in &self.contributions {
            sum[*bin] += f64::from(values[*pixel]) * fraction;
            variance[*bin] += variances[*pixel] * fraction * fraction;
        }
        let values = sum
            .iter()
            .zip(&self.area)
            .map(|(s, area)| if *area > 0.0 { (s / area) as f32 } else { 0.0 })
            .collect();
        let variances = variance
            .iter()
            .zip(&self.area)
            .map(|(v, area)| if *area > 0.0 { v / (area * area) } else { 0.0 })
            .collect();
        (values, variances)
    }
}

/// Area normalisation for one sector, mask and mode.
///
/// Built once per stage and only read by the leaves. Weights built for one combination of
/// region, mask and mode must not be used for another; see [AreaWeights::matches].
#[derive(Clone, Debug)]
pub struct AreaWeights {
    roi: SectorRoi,
    mask: Option<Vec<bool>>,
    fast: bool,
    image_shape: [usize; 2],
    radial: Bins,
    azimuthal: Bins,
}

impl AreaWeights {
    /// Compute the weights of every pixel in an image of `image_shape`.
    ///
    /// # Arguments
    ///
    /// * `roi`: Validated sector
    /// * `image_shape`: `[rows, columns]`
    /// * `mask`: Optional per-pixel inclusion flags, row-major
    /// * `fast`: Bin pixel centres only
    pub fn new(
        roi: &SectorRoi,
        image_shape: [usize; 2],
        mask: Option<&[bool]>,
        fast: bool,
    ) -> Result<Self, ReductionError> {
        let [rows, columns] = image_shape;
        if let Some(mask) = mask {
            if mask.len() != rows * columns {
                return Err(ReductionError::InvalidMask {
                    mask: vec![mask.len()],
                    expected: image_shape.to_vec(),
                });
            }
        }

        let geometry = roi.centre.iter().chain(&roi.radii).chain(&roi.angles);
        if geometry.chain(std::iter::once(&roi.dpp)).any(|v| !v.is_finite()) {
            return Err(ReductionError::InvalidRoi {
                reason: "sector geometry must be finite".to_string(),
            });
        }

        let [cx, cy] = roi.centre;
        let [inner, outer] = roi.radii;
        let start = roi.angles[0];
        let span = roi.span();
        let radial_bins = roi.radial_bins();
        let azimuthal_bins = roi.azimuthal_bins();
        if radial_bins == 0 || azimuthal_bins == 0 {
            return Err(ReductionError::InvalidRoi {
                reason: "sector has no radial or azimuthal extent".to_string(),
            });
        }
        if radial_bins > MAX_BINS || azimuthal_bins > MAX_BINS {
            return Err(ReductionError::InvalidRoi {
                reason: format!(
                    "sector needs {} radial and {} azimuthal bins, at most {} allowed",
                    radial_bins, azimuthal_bins, MAX_BINS
                ),
            });
        }
        let azimuthal_scale = outer * roi.dpp;
        let samples = if fast { 1 } else { SUBSAMPLES };
        let fraction = 1.0 / (samples * samples) as f64;

        let mut radial = Bins::new(radial_bins);
        let mut azimuthal = Bins::new(azimuthal_bins);
        let mut radial_fractions = BTreeMap::new();
        let mut azimuthal_fractions = BTreeMap::new();
        for row in 0..rows {
            for column in 0..columns {
                let pixel = row * columns + column;
                if mask.map_or(false, |mask| !mask[pixel]) {
                    continue;
                }
                radial_fractions.clear();
                azimuthal_fractions.clear();
                for i in 0..samples {
                    for j in 0..samples {
                        let dx = column as f64 + (j as f64 + 0.5) / samples as f64 - cx;
                        let dy = row as f64 + (i as f64 + 0.5) / samples as f64 - cy;
                        let radius = dx.hypot(dy);
                        if radius < inner || radius >= outer {
                            continue;
                        }
                        let relative = (dy.atan2(dx) - start).rem_euclid(TAU);
                        if roi.symmetry == Symmetry::None && relative >= span {
                            continue;
                        }
                        let rbin = ((radius - inner).floor() as usize).min(radial_bins - 1);
                        let abin =
                            ((relative * azimuthal_scale).floor() as usize).min(azimuthal_bins - 1);
                        *radial_fractions.entry(rbin).or_insert(0.0) += fraction;
                        *azimuthal_fractions.entry(abin).or_insert(0.0) += fraction;
                    }
                }
                radial.add(pixel, &radial_fractions);
                azimuthal.add(pixel, &azimuthal_fractions);
            }
        }

        Ok(AreaWeights {
            roi: roi.clone(),
            mask: mask.map(<[bool]>::to_vec),
            fast,
            image_shape,
            radial,
            azimuthal,
        })
    }

    /// Whether these weights were built for this region, mask and mode.
    pub fn matches(&self, roi: &SectorRoi, mask: Option<&[bool]>, fast: bool) -> bool {
        self.roi == *roi && self.mask.as_deref() == mask && self.fast == fast
    }

    /// Number of bins in a profile.
    pub fn bins(&self, axis: SectorAxis) -> usize {
        self.profile_bins(axis).area.len()
    }

    /// Total area of each bin of a profile, in pixels.
    pub fn area(&self, axis: SectorAxis) -> &[f64] {
        &self.profile_bins(axis).area
    }

    /// Integrate one image into a profile.
    ///
    /// # Arguments
    ///
    /// * `axis`: Profile to produce
    /// * `values`: Image values, row-major
    /// * `variances`: Image variances
    pub fn integrate(
        &self,
        axis: SectorAxis,
        values: &[f32],
        variances: &[f64],
    ) -> Result<(Vec<f32>, Vec<f64>), ReductionError> {
        let pixels = self.image_shape[0] * self.image_shape[1];
        if values.len() != pixels || variances.len() != pixels {
            return Err(ReductionError::IncompatibleShapes {
                data: vec![values.len()],
                reference: self.image_shape.to_vec(),
                reason: "image does not match the area weights",
            });
        }
        Ok(self.profile_bins(axis).integrate(values, variances))
    }

    fn profile_bins(&self, axis: SectorAxis) -> &Bins {
        match axis {
            SectorAxis::Radial => &self.radial,
            SectorAxis::Azimuthal => &self.azimuthal,
        }
    }
}

/// Integrate every image of a frame stack into the requested profiles.
///
/// Returns the azimuthal then the radial profile, each shaped `[frames, bins]`, skipping
/// profiles not requested.
///
/// # Arguments
///
/// * `data`: Values of shape `[frames, rows, columns]`
/// * `variance`: Variances of the same shape
/// * `frames`: Number of images
/// * `weights`: Area weights for the image shape
/// * `axes`: Profiles to produce
pub fn process(
    data: &[f32],
    variance: &[f64],
    frames: usize,
    weights: &AreaWeights,
    axes: &[SectorAxis],
) -> Result<Vec<(Vec<f32>, Vec<f64>)>, ReductionError> {
    let pixels = weights.image_shape[0] * weights.image_shape[1];
    axes.iter()
        .map(|axis| -> Result<(Vec<f32>, Vec<f64>), ReductionError> {
            let mut values = Vec::with_capacity(frames * weights.bins(*axis));
            let mut variances = Vec::with_capacity(frames * weights.bins(*axis));
            for frame in 0..frames {
                let range = frame * pixels..(frame + 1) * pixels;
                let (v, var) = weights.integrate(
                    *axis,
                    data.get(range.clone()).unwrap_or(&[]),
                    variance.get(range).unwrap_or(&[]),
                )?;
                values.extend(v);
                variances.extend(var);
            }
            Ok((values, variances))
        })
        .collect()
}

/// Sector integration kernel
#[derive(Clone, Debug)]
pub struct SectorIntegration {
    weights: AreaWeights,
    axes: Vec<SectorAxis>,
}

impl SectorIntegration {
    /// Validate the detector and mask and compute the area weights.
    pub fn prepare<S: SliceStore>(
        store: &StoreLock<S>,
        input: &InputGeometry,
        params: &SectorParams,
    ) -> Result<Self, ReductionError> {
        let image_shape = match input.image() {
            [rows, columns] => [*rows, *columns],
            image => {
                return Err(ReductionError::InvalidRoi {
                    reason: format!("sector integration needs a 2D detector, got {image:?}"),
                })
            }
        };
        let mask = match params.mask {
            Some(id) => {
                let mask = store.read_all(id)?;
                if mask.shape != image_shape {
                    return Err(ReductionError::InvalidMask {
                        mask: mask.shape,
                        expected: image_shape.to_vec(),
                    });
                }
                Some(mask.values.iter().map(|v| *v != 0.0).collect::<Vec<_>>())
            }
            None => None,
        };
        let weights = AreaWeights::new(&params.roi, image_shape, mask.as_deref(), params.fast)?;
        if weights.area(SectorAxis::Radial).iter().all(|area| *area == 0.0) {
            event!(Level::WARN, "sector does not cover any unmasked pixel");
        }

        let mut axes = Vec::new();
        if params.azimuthal {
            axes.push(SectorAxis::Azimuthal);
        }
        if params.radial {
            axes.push(SectorAxis::Radial);
        }
        Ok(SectorIntegration { weights, axes })
    }
}

impl Kernel for SectorIntegration {
    fn outputs(&self) -> Vec<OutputSpec> {
        self.axes
            .iter()
            .map(|axis| OutputSpec {
                name: match axis {
                    SectorAxis::Radial => "radial",
                    SectorAxis::Azimuthal => "azimuthal",
                },
                image_shape: vec![self.weights.bins(*axis)],
            })
            .collect()
    }

    fn process(&self, _position: &[usize], frame: Frame) -> Result<Vec<Frame>, ReductionError> {
        let frames = frame.frames();
        process(
            &frame.values,
            &frame.variances,
            frames,
            &self.weights,
            &self.axes,
        )?
        .into_iter()
        .zip(&self.axes)
        .map(|((values, variances), axis)| {
            Frame::new(values, variances, vec![frames, self.weights.bins(*axis)])
        })
        .collect()
    }

    fn metadata(&self) -> BTreeMap<String, f64> {
        [
            ("radial_bins", self.weights.bins(SectorAxis::Radial)),
            ("azimuthal_bins", self.weights.bins(SectorAxis::Azimuthal)),
        ]
        .into_iter()
        .map(|(key, bins)| (key.to_string(), bins as f64))
        .collect()
    }
}
