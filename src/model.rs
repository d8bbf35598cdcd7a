use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::drivers::{DarkSpectrum, HardwareFault};

pub type StationId = String;

// ---------------------------------------------------------------------------
// Retrieval output
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitQuality {
    /// Root-mean-square of the optical depth residual.
    pub rms_residual: f64,
    pub r_squared: f64,
}

/// Column density retrieved from one non-dark spectrum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnDensityPoint {
    pub angle_deg: f64,
    pub timestamp: DateTime<Utc>,
    /// Slant column density in molecules/cm^2.
    pub column_density: f64,
    /// One-sigma error of the fitted column density.
    pub column_density_err: f64,
    pub fit_quality: FitQuality,
    pub low_confidence: bool,
    /// Peak dark-corrected intensity inside the fit window.
    pub peak_intensity: f64,
}

/// A sweep position whose spectrum could not be retrieved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MissingPoint {
    pub angle_deg: f64,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// ScanProfile
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum IncompleteReason {
    Aborted { fault: HardwareFault },
    TooFewPoints { valid: usize, required: usize },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ProfileStatus {
    Complete,
    Incomplete(IncompleteReason),
}

/// Column densities of one home-to-home sweep.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanProfile {
    pub station: StationId,
    pub sweep_number: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Azimuth of the scan plane (degrees clockwise from north of the 0° horizon).
    pub scan_azimuth_deg: f64,
    pub dark: Option<DarkSpectrum>,
    /// Strictly increasing in angle.
    pub points: Vec<ColumnDensityPoint>,
    pub missing: Vec<MissingPoint>,
    pub expected_points: usize,
    pub status: ProfileStatus,
}

impl ScanProfile {
    pub fn is_complete(&self) -> bool {
        matches!(self.status, ProfileStatus::Complete)
    }
    pub fn midpoint(&self) -> DateTime<Utc> {
        self.started_at + (self.ended_at - self.started_at) / 2
    }
    pub fn duration(&self) -> Duration {
        self.ended_at - self.started_at
    }
    pub fn angles(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|p| p.angle_deg)
    }
    /// Point with the highest column density, ignoring low-confidence points.
    pub fn peak_point(&self) -> Option<&ColumnDensityPoint> {
        self.points
            .iter()
            .filter(|p| !p.low_confidence && p.column_density.is_finite())
            .max_by(|a, b| a.column_density.total_cmp(&b.column_density))
    }
}

// ---------------------------------------------------------------------------
// Fusion inputs and outputs
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindVector {
    pub speed_ms: f64,
    /// Direction the wind blows toward, degrees clockwise from north.
    pub bearing_deg: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum GeometrySource {
    Fixed,
    Triangulated {
        pair: (StationId, StationId),
        derived_at: DateTime<Utc>,
    },
}

/// Where the plume crosses a station's scan plane.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlumeGeometry {
    /// Height of the plume above this station, metres.
    pub height_m: f64,
    /// Horizontal distance from this station to the plume, metres.
    pub distance_m: f64,
    /// Bearing from this station to the plume, degrees from north.
    pub bearing_deg: f64,
    pub source: GeometrySource,
}

impl PlumeGeometry {
    pub fn fixed(height_m: f64, distance_m: f64, bearing_deg: f64) -> Self {
        Self {
            height_m,
            distance_m,
            bearing_deg,
            source: GeometrySource::Fixed,
        }
    }
    /// Slant distance from the station to the plume along the viewing ray.
    pub fn range_m(&self) -> f64 {
        self.height_m.hypot(self.distance_m)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FluxSource {
    Station(StationId),
    Pair(StationId, StationId),
}

impl std::fmt::Display for FluxSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FluxSource::Station(s) => write!(f, "{s}"),
            FluxSource::Pair(a, b) => write!(f, "{a}+{b}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FluxQuality {
    Good,
    LowConfidence,
}

/// Append-only flux record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FluxResult {
    pub timestamp: DateTime<Utc>,
    pub station: StationId,
    pub source: FluxSource,
    pub sweep_number: u64,
    pub flux_kg_s: f64,
    pub flux_err_kg_s: f64,
    pub geometry: PlumeGeometry,
    pub wind: WindVector,
    pub quality: FluxQuality,
    /// Fraction of sweep positions that had to be interpolated.
    pub gap_fraction: f64,
}

impl FluxResult {
    pub fn tonnes_per_day(&self) -> f64 {
        self.flux_kg_s * 1.0e-3 * 86_400.0
    }
}
