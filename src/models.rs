//! Stage parameter types and their validation.

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::error::ReductionError;
use crate::store::DatasetId;

/// Parameters of the grid Average stage
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AverageParams {
    /// 1-based grid axes to average over, for example `"1,3"`. Defaults to the last grid axis.
    #[serde(default)]
    pub grid_axes: Option<String>,
}

/// Parameters of the grid Selection stage
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SelectionParams {
    /// Selection string, for example `"0-3,5;;1"`
    #[validate(length(min = 1, message = "selection format must not be empty"))]
    pub format: String,
}

/// Parameters of the BackgroundSubtraction stage
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct BackgroundParams {
    /// Dataset holding the background frames
    pub background: DatasetId,
    /// Factor applied to the background before subtraction
    #[validate(custom = "validate_finite")]
    #[serde(default)]
    pub scale: Option<f64>,
}

/// Parameters of the Normalisation stage
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct NormalisationParams {
    /// Dataset of calibration readings, shaped `[grid..., channels]`
    pub calibration: DatasetId,
    /// Calibration channel to normalise by
    pub channel: usize,
    /// Absolute intensity scale
    #[validate(custom = "validate_scale")]
    #[serde(default = "default_scale")]
    pub scale: f64,
}

fn default_scale() -> f64 {
    1.0
}

/// Parameters of the DetectorResponse stage
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct DetectorResponseParams {
    /// Dataset holding the per-pixel response, shaped like one detector image
    pub response: DatasetId,
}

/// Angular extent of a sector
#[derive(Clone, Copy, Debug, Default, Deserialize, Display, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Symmetry {
    /// The sector spans `angles[0]..angles[1]`
    #[default]
    None,
    /// The sector is a full annulus starting at `angles[0]`
    Full,
}

/// Annular sector on a 2D detector
///
/// Pixel `(row, column)` covers `[column, column + 1) x [row, row + 1)` in detector coordinates.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_roi"))]
pub struct SectorRoi {
    /// Beam centre `[x, y]` in pixels
    pub centre: [f64; 2],
    /// Inner and outer radius in pixels
    pub radii: [f64; 2],
    /// Start and end angle in radians
    pub angles: [f64; 2],
    /// Angular symmetry
    #[serde(default)]
    pub symmetry: Symmetry,
    /// Azimuthal bins per pixel of arc at the outer radius
    #[serde(default = "default_scale")]
    pub dpp: f64,
}

impl SectorRoi {
    /// Returns a sector with no symmetry and one azimuthal bin per pixel.
    pub fn new(centre: [f64; 2], radii: [f64; 2], angles: [f64; 2]) -> Self {
        SectorRoi {
            centre,
            radii,
            angles,
            symmetry: Symmetry::None,
            dpp: 1.0,
        }
    }

    /// Angular span of the sector in radians.
    pub fn span(&self) -> f64 {
        match self.symmetry {
            Symmetry::Full => std::f64::consts::TAU,
            Symmetry::None => self.angles[1] - self.angles[0],
        }
    }

    /// Number of radial bins, `ceil(outer - inner)`.
    pub fn radial_bins(&self) -> usize {
        (self.radii[1] - self.radii[0]).ceil().max(0.0) as usize
    }

    /// Number of azimuthal bins, `ceil(span * outer * dpp)`.
    pub fn azimuthal_bins(&self) -> usize {
        (self.span() * self.radii[1] * self.dpp).ceil().max(0.0) as usize
    }
}

/// Parameters of the SectorIntegration stage
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_sector_params"))]
pub struct SectorParams {
    /// Region to integrate
    #[validate]
    pub roi: SectorRoi,
    /// Optional pixel mask dataset. Non-zero pixels are used.
    #[serde(default)]
    pub mask: Option<DatasetId>,
    /// Produce the radial profile
    #[serde(default = "default_true")]
    pub radial: bool,
    /// Produce the azimuthal profile
    #[serde(default = "default_true")]
    pub azimuthal: bool,
    /// Bin pixel centres only instead of subsampling each pixel
    #[serde(default)]
    pub fast: bool,
}

fn default_true() -> bool {
    true
}

/// Parameters of stages that need an abscissa (q or angle axis)
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AxisParams {
    /// One-dimensional dataset holding the axis values
    pub axis: DatasetId,
}

/// The closed set of transforms a stage can apply
#[derive(Clone, Debug, Deserialize, Display, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Transform {
    /// Average over grid axes
    Average(AverageParams),
    /// Copy a sub-grid
    Selection(SelectionParams),
    /// Subtract a background
    BackgroundSubtraction(BackgroundParams),
    /// Divide by a calibration channel
    Normalisation(NormalisationParams),
    /// Multiply by the detector response
    DetectorResponse(DetectorResponseParams),
    /// Radial and azimuthal profiles over a sector
    SectorIntegration(SectorParams),
    /// Per-frame sum
    Invariant,
    /// Scattering invariant with Porod tail correction
    SaxsInvariant(AxisParams),
    /// Degree and angle of orientation from an azimuthal profile
    DegreeOfOrientation(AxisParams),
}

impl Validate for Transform {
    fn validate(&self) -> Result<(), ValidationErrors> {
        match self {
            Transform::Average(params) => params.validate(),
            Transform::Selection(params) => params.validate(),
            Transform::BackgroundSubtraction(params) => params.validate(),
            Transform::Normalisation(params) => params.validate(),
            Transform::DetectorResponse(params) => params.validate(),
            Transform::SectorIntegration(params) => params.validate(),
            Transform::Invariant => Ok(()),
            Transform::SaxsInvariant(params) | Transform::DegreeOfOrientation(params) => {
                params.validate()
            }
        }
    }
}

/// Request to run one stage
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct StageRequest {
    /// Stage name, used for output dataset names, logs and metrics
    #[validate(length(min = 1, message = "name must not be empty"))]
    pub name: String,
    /// Input dataset
    pub input: DatasetId,
    /// Number of trailing detector dimensions of the input
    #[validate(range(min = 1, max = 2, message = "detector_dims must be 1 or 2"))]
    pub detector_dims: usize,
    /// Optional selection string restricting the grid cells processed
    #[serde(default)]
    pub selection: Option<String>,
    /// Transform to apply
    #[validate]
    pub transform: Transform,
}

impl StageRequest {
    /// Deserialise and validate a stage request from JSON.
    pub fn from_json(json: &str) -> Result<Self, ReductionError> {
        let request: Self = serde_json::from_str(json)?;
        request.validate()?;
        Ok(request)
    }
}

/// Validate that a factor is finite
fn validate_finite(value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        let mut error = ValidationError::new("value must be finite");
        error.add_param("value".into(), &value.to_string());
        return Err(error);
    }
    Ok(())
}

/// Validate an absolute intensity scale
fn validate_scale(scale: f64) -> Result<(), ValidationError> {
    validate_finite(scale)?;
    if scale == 0.0 {
        return Err(ValidationError::new("scale must not be zero"));
    }
    Ok(())
}

/// Validate sector geometry
fn validate_roi(roi: &SectorRoi) -> Result<(), ValidationError> {
    let values = roi.centre.iter().chain(&roi.radii).chain(&roi.angles);
    if values.chain(std::iter::once(&roi.dpp)).any(|v| !v.is_finite()) {
        return Err(ValidationError::new("sector geometry must be finite"));
    }
    let [inner, outer] = roi.radii;
    if inner < 0.0 || outer <= inner {
        let mut error =
            ValidationError::new("sector radii must satisfy 0 <= inner < outer");
        error.add_param("inner".into(), &inner);
        error.add_param("outer".into(), &outer);
        return Err(error);
    }
    if roi.dpp <= 0.0 {
        return Err(ValidationError::new("sector dpp must be greater than 0"));
    }
    if roi.symmetry == Symmetry::None {
        let span = roi.span();
        if span <= 0.0 || span > std::f64::consts::TAU {
            let mut error = ValidationError::new("sector angles must span (0, 2pi]");
            error.add_param("start".into(), &roi.angles[0]);
            error.add_param("end".into(), &roi.angles[1]);
            return Err(error);
        }
    }
    Ok(())
}

/// Validate sector integration parameters
fn validate_sector_params(params: &SectorParams) -> Result<(), ValidationError> {
    if !params.radial && !params.azimuthal {
        return Err(ValidationError::new(
            "at least one of radial and azimuthal must be requested",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;
    use serde_test::{assert_de_tokens, assert_de_tokens_error, Token};

    // The following tests use serde_test to validate the correct function of the deserialiser.
    // The validations are also tested.

    #[test]
    fn test_average_defaults() {
        assert_de_tokens(
            &AverageParams { grid_axes: None },
            &[
                Token::Struct {
                    name: "AverageParams",
                    len: 0,
                },
                Token::StructEnd,
            ],
        );
    }

    #[test]
    fn test_normalisation_default_scale() {
        let params = NormalisationParams {
            calibration: DatasetId(2),
            channel: 1,
            scale: 1.0,
        };
        assert_de_tokens(
            &params,
            &[
                Token::Struct {
                    name: "NormalisationParams",
                    len: 2,
                },
                Token::Str("calibration"),
                Token::NewtypeStruct { name: "DatasetId" },
                Token::U64(2),
                Token::Str("channel"),
                Token::U64(1),
                Token::StructEnd,
            ],
        );
        params.validate().unwrap()
    }

    #[test]
    fn test_missing_channel() {
        assert_de_tokens_error::<NormalisationParams>(
            &[
                Token::Struct {
                    name: "NormalisationParams",
                    len: 1,
                },
                Token::Str("calibration"),
                Token::NewtypeStruct { name: "DatasetId" },
                Token::U64(2),
                Token::StructEnd,
            ],
            "missing field `channel`",
        )
    }

    #[test]
    fn test_unknown_field() {
        assert_de_tokens_error::<AverageParams>(
            &[
                Token::Struct {
                    name: "AverageParams",
                    len: 1,
                },
                Token::Str("axes"),
                Token::StructEnd,
            ],
            "unknown field `axes`, expected `grid_axes`",
        )
    }

    #[test]
    fn test_invalid_symmetry() {
        assert_de_tokens_error::<Symmetry>(
            &[
                Token::Enum { name: "Symmetry" },
                Token::Str("half"),
                Token::Unit,
            ],
            "unknown variant `half`, expected `none` or `full`",
        )
    }

    #[test]
    #[should_panic(expected = "scale must not be zero")]
    fn test_zero_scale() {
        let params = NormalisationParams {
            calibration: DatasetId(0),
            channel: 0,
            scale: 0.0,
        };
        params.validate().unwrap()
    }

    #[test]
    #[should_panic(expected = "value must be finite")]
    fn test_infinite_background_scale() {
        let params = BackgroundParams {
            background: DatasetId(0),
            scale: Some(f64::INFINITY),
        };
        params.validate().unwrap()
    }

    #[test]
    #[should_panic(expected = "sector radii must satisfy 0 <= inner < outer")]
    fn test_roi_radii_reversed() {
        let roi = SectorRoi::new([10.0, 10.0], [20.0, 5.0], [0.0, 1.0]);
        roi.validate().unwrap()
    }

    #[test]
    #[should_panic(expected = "sector angles must span (0, 2pi]")]
    fn test_roi_empty_span() {
        let roi = SectorRoi::new([10.0, 10.0], [0.0, 5.0], [1.0, 1.0]);
        roi.validate().unwrap()
    }

    #[test]
    fn test_roi_full_symmetry_ignores_end_angle() {
        let mut roi = SectorRoi::new([10.0, 10.0], [0.0, 5.0], [1.0, 1.0]);
        roi.symmetry = Symmetry::Full;
        roi.validate().unwrap();
        assert_eq!(5, roi.radial_bins());
        // ceil(2pi * 5)
        assert_eq!(32, roi.azimuthal_bins());
    }

    #[test]
    fn test_roi_bins() {
        let roi = SectorRoi::new([0.0, 0.0], [2.5, 10.0], [0.0, 0.5]);
        assert_eq!(8, roi.radial_bins());
        assert_eq!(5, roi.azimuthal_bins());
    }

    #[test]
    #[should_panic(expected = "at least one of radial and azimuthal must be requested")]
    fn test_sector_nothing_requested() {
        let mut params = test_utils::get_test_sector_params();
        params.radial = false;
        params.azimuthal = false;
        params.validate().unwrap()
    }

    #[test]
    #[should_panic(expected = "sector dpp must be greater than 0")]
    fn test_sector_nested_roi_validated() {
        let mut params = test_utils::get_test_sector_params();
        params.roi.dpp = 0.0;
        params.validate().unwrap()
    }

    #[test]
    #[should_panic(expected = "detector_dims must be 1 or 2")]
    fn test_invalid_detector_dims() {
        let mut request = test_utils::get_test_stage_request();
        request.detector_dims = 3;
        request.validate().unwrap()
    }

    #[test]
    #[should_panic(expected = "name must not be empty")]
    fn test_empty_name() {
        let mut request = test_utils::get_test_stage_request();
        request.name = "".to_string();
        request.validate().unwrap()
    }

    #[test]
    fn test_json_stage_request() {
        let json = r#"{
            "name": "average",
            "input": 0,
            "detector_dims": 2,
            "transform": {"average": {"grid_axes": "1,3"}}
        }"#;
        let request = StageRequest::from_json(json).unwrap();
        assert_eq!(test_utils::get_test_stage_request(), request);
    }

    #[test]
    fn test_json_unit_transform() {
        let json = r#"{"name": "inv", "input": 3, "detector_dims": 1, "transform": "invariant"}"#;
        let request = StageRequest::from_json(json).unwrap();
        assert_eq!(Transform::Invariant, request.transform);
        assert_eq!("invariant", request.transform.to_string());
    }

    #[test]
    fn test_json_sector_defaults() {
        let json = r#"{
            "name": "sector",
            "input": 0,
            "detector_dims": 2,
            "selection": "0-1",
            "transform": {"sector_integration": {
                "roi": {"centre": [16, 16], "radii": [0, 10], "angles": [0, 1]}
            }}
        }"#;
        let request = StageRequest::from_json(json).unwrap();
        assert_eq!(Some("0-1".to_string()), request.selection);
        match request.transform {
            Transform::SectorIntegration(params) => {
                assert!(params.radial && params.azimuthal && !params.fast);
                assert_eq!(None, params.mask);
                assert_eq!(Symmetry::None, params.roi.symmetry);
                assert_eq!(1.0, params.roi.dpp);
            }
            other => panic!("unexpected transform {}", other),
        }
    }

    #[test]
    fn test_json_invalid_nested_params() {
        let json = r#"{
            "name": "norm",
            "input": 0,
            "detector_dims": 2,
            "transform": {"normalisation": {"calibration": 1, "channel": 0, "scale": 0}}
        }"#;
        assert!(matches!(
            StageRequest::from_json(json),
            Err(ReductionError::ParametersValidation(_))
        ));
    }

    #[test]
    fn test_json_unknown_transform() {
        let json = r#"{"name": "x", "input": 0, "detector_dims": 1, "transform": "median"}"#;
        assert!(matches!(
            StageRequest::from_json(json),
            Err(ReductionError::ParametersJson(_))
        ));
    }
}
