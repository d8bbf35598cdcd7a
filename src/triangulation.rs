//! Plume height from two stations' simultaneous scans.
//!
//! Each station's plume-crossing angle is projected onto the vertical plane
//! through the station baseline. The two viewing rays and the line joining the
//! stations form a triangle which is solved with the law of sines; a station
//! altitude difference tilts that line out of the horizontal.
//!
//! A profile only yields an angle after passing the scan quality gate in
//! [`ScanQualityConfig`].

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ColumnDensityPoint, GeometrySource, PlumeGeometry, ScanProfile, StationId};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Fixed location and orientation of a scanning station.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StationSite {
    pub id: StationId,
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub altitude_m: f64,
    /// Bearing of the 0° scan horizon, degrees clockwise from north.
    pub scan_azimuth_deg: f64,
}

/// Great-circle distance (m) and initial bearing (rad, clockwise from north).
pub fn haversine(from: (f64, f64), to: (f64, f64)) -> (f64, f64) {
    let (lat1, lon1) = (from.0.to_radians(), from.1.to_radians());
    let (lat2, lon2) = (to.0.to_radians(), to.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    let bearing = (dlon.sin() * lat2.cos())
        .atan2(lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos());
    (EARTH_RADIUS_M * c, bearing)
}

#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum GeometryFailure {
    #[error("both profiles come from station {0}")]
    SameStation(StationId),
    #[error("stations are only {distance_m:.1} m apart")]
    StationsCoincide { distance_m: f64 },
    #[error("profile from {0} has no usable plume signal")]
    NoPlumeSignal(StationId),
    #[error("profile from {station} has too many rejected points ({bad_fraction:.2})")]
    PoorScan {
        station: StationId,
        bad_fraction: f64,
    },
    #[error("viewing rays are near-parallel (apex {apex_deg:.2}°)")]
    NearParallel { apex_deg: f64 },
    #[error("viewing rays diverge and never cross above the baseline")]
    Diverging,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangulationConfig {
    /// Allowed gap between two sweeps' time windows for them to count as simultaneous.
    pub overlap_tolerance_s: f64,
    /// Smallest acceptable angle between the two viewing rays.
    pub min_apex_angle_deg: f64,
    pub quality: ScanQualityConfig,
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        Self {
            overlap_tolerance_s: 60.0,
            min_apex_angle_deg: 5.0,
            quality: ScanQualityConfig::default(),
        }
    }
}

/// Limits a profile must meet before its plume angle is used.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanQualityConfig {
    /// Accepted column density range, molecules/cm^2.
    pub min_column: f64,
    pub max_column: f64,
    /// Accepted fit-window peak intensity range, counts.
    pub min_intensity: f64,
    pub max_intensity: f64,
    /// Largest share of rejected or missing points in a usable scan.
    pub max_bad_fraction: f64,
    /// Column density above which a point counts as inside the plume.
    pub plume_column: f64,
    pub min_plume_points: usize,
    /// Width in points of the moving average used to find the peak.
    pub smoothing_window: usize,
}

impl Default for ScanQualityConfig {
    fn default() -> Self {
        Self {
            min_column: -1.0e17,
            max_column: 1.0e20,
            min_intensity: 500.0,
            max_intensity: 60_000.0,
            max_bad_fraction: 0.2,
            plume_column: 1.0e17,
            min_plume_points: 10,
            smoothing_window: 5,
        }
    }
}

impl ScanQualityConfig {
    fn accepts(&self, point: &ColumnDensityPoint) -> bool {
        !point.low_confidence
            && (self.min_column..=self.max_column).contains(&point.column_density)
            && (self.min_intensity..=self.max_intensity).contains(&point.peak_intensity)
    }
}

/// Moving average over `window` points; the edges repeat the nearest value.
fn smooth(values: &[f64], window: usize) -> Vec<f64> {
    let half = window / 2;
    if half == 0 || values.is_empty() {
        return values.to_vec();
    }
    let last = values.len() - 1;
    (0..values.len())
        .map(|i| {
            let sum: f64 = (0..=2 * half)
                .map(|k| values[(i + k).saturating_sub(half).min(last)])
                .sum();
            sum / (2 * half + 1) as f64
        })
        .collect()
}

/// Geometry relative to each of the two stations.
#[derive(Clone, Debug, PartialEq)]
pub struct Triangulation {
    pub first: PlumeGeometry,
    pub second: PlumeGeometry,
}

pub struct TriangulationEngine {
    config: TriangulationConfig,
}

impl TriangulationEngine {
    pub fn new(config: TriangulationConfig) -> Self {
        Self { config }
    }

    /// Whether two sweeps ran close enough in time to be fused.
    pub fn windows_overlap(&self, a: &ScanProfile, b: &ScanProfile) -> bool {
        let tol = Duration::milliseconds((self.config.overlap_tolerance_s * 1_000.0) as i64);
        a.started_at - tol <= b.ended_at && b.started_at - tol <= a.ended_at
    }

    /// Scan angle where the profile crosses the plume.
    ///
    /// Points outside the quality limits are dropped; the rest are smoothed
    /// and the angle is the smoothed-column weighted centroid of the
    /// contiguous region above half the smoothed peak.
    pub fn plume_angle(&self, profile: &ScanProfile) -> Result<f64, GeometryFailure> {
        let quality = &self.config.quality;
        let accepted: Vec<&ColumnDensityPoint> =
            profile.points.iter().filter(|p| quality.accepts(p)).collect();
        let total = profile.points.len() + profile.missing.len();
        let rejected = total - accepted.len();
        if rejected as f64 > quality.max_bad_fraction * total as f64 {
            return Err(GeometryFailure::PoorScan {
                station: profile.station.clone(),
                bad_fraction: rejected as f64 / total as f64,
            });
        }
        let in_plume = accepted
            .iter()
            .filter(|p| p.column_density > quality.plume_column)
            .count();
        if in_plume < quality.min_plume_points {
            return Err(GeometryFailure::NoPlumeSignal(profile.station.clone()));
        }

        let columns: Vec<f64> = accepted.iter().map(|p| p.column_density).collect();
        let smoothed = smooth(&columns, quality.smoothing_window);
        let Some((peak_index, &peak)) = smoothed
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
        else {
            return Err(GeometryFailure::NoPlumeSignal(profile.station.clone()));
        };
        if peak <= 0.0 {
            return Err(GeometryFailure::NoPlumeSignal(profile.station.clone()));
        }
        let half = 0.5 * peak;
        let mut lo = peak_index;
        while lo > 0 && smoothed[lo - 1] >= half {
            lo -= 1;
        }
        let mut hi = peak_index;
        while hi + 1 < smoothed.len() && smoothed[hi + 1] >= half {
            hi += 1;
        }
        let (sum_w, sum_wa) = (lo..=hi).fold((0.0, 0.0), |(w, wa), i| {
            (w + smoothed[i], wa + smoothed[i] * accepted[i].angle_deg)
        });
        Ok(sum_wa / sum_w)
    }

    pub fn triangulate(
        &self,
        a: (&StationSite, &ScanProfile),
        b: (&StationSite, &ScanProfile),
    ) -> Result<Triangulation, GeometryFailure> {
        let theta_a = self.plume_angle(a.1)?;
        let theta_b = self.plume_angle(b.1)?;
        let derived_at = a.1.midpoint().max(b.1.midpoint());
        self.solve(a.0, theta_a, b.0, theta_b, derived_at)
    }

    /// Solves the station triangle for two scan angles (degrees). Each
    /// geometry's height is relative to its own station's altitude.
    pub fn solve(
        &self,
        site_a: &StationSite,
        theta_a_deg: f64,
        site_b: &StationSite,
        theta_b_deg: f64,
        derived_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<Triangulation, GeometryFailure> {
        if site_a.id == site_b.id {
            return Err(GeometryFailure::SameStation(site_a.id.clone()));
        }
        let pos_a = (site_a.latitude_deg, site_a.longitude_deg);
        let pos_b = (site_b.latitude_deg, site_b.longitude_deg);
        let (baseline, bearing_ab) = haversine(pos_a, pos_b);
        if baseline < 1.0 {
            return Err(GeometryFailure::StationsCoincide { distance_m: baseline });
        }
        let (_, bearing_ba) = haversine(pos_b, pos_a);

        let alpha = interior_angle(theta_a_deg, site_a.scan_azimuth_deg, bearing_ab);
        let beta = interior_angle(theta_b_deg, site_b.scan_azimuth_deg, bearing_ba);
        let gamma = std::f64::consts::PI - alpha - beta;
        if gamma.abs() < self.config.min_apex_angle_deg.to_radians() {
            return Err(GeometryFailure::NearParallel {
                apex_deg: gamma.to_degrees(),
            });
        }
        if gamma < 0.0 || alpha <= 0.0 || beta <= 0.0 {
            return Err(GeometryFailure::Diverging);
        }

        // Station B sits `rise` metres above A in the vertical plane.
        let rise = site_b.altitude_m - site_a.altitude_m;
        let range_a = (baseline * beta.sin() + rise * beta.cos()) / gamma.sin();
        let range_b = (baseline * alpha.sin() - rise * alpha.cos()) / gamma.sin();
        if range_a <= 0.0 || range_b <= 0.0 {
            return Err(GeometryFailure::Diverging);
        }
        let pair = (site_a.id.clone(), site_b.id.clone());
        let geometry = |range: f64, angle: f64, bearing: f64| {
            let along = range * angle.cos();
            let bearing_deg = if along >= 0.0 {
                bearing.to_degrees()
            } else {
                bearing.to_degrees() + 180.0
            };
            PlumeGeometry {
                height_m: range * angle.sin(),
                distance_m: along.abs(),
                bearing_deg: bearing_deg.rem_euclid(360.0),
                source: GeometrySource::Triangulated {
                    pair: pair.clone(),
                    derived_at,
                },
            }
        };
        Ok(Triangulation {
            first: geometry(range_a, alpha, bearing_ab),
            second: geometry(range_b, beta, bearing_ba),
        })
    }
}

/// Angle at a station between the baseline toward the other station and the
/// viewing ray projected onto the vertical plane through the baseline.
fn interior_angle(theta_deg: f64, scan_azimuth_deg: f64, baseline_bearing: f64) -> f64 {
    let theta = theta_deg.to_radians();
    let along = (scan_azimuth_deg.to_radians() - baseline_bearing).cos();
    theta.sin().atan2(theta.cos() * along)
}
