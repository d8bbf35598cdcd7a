//! SO2 mass flux through a station's scan plane.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{
    FluxQuality, FluxResult, FluxSource, PlumeGeometry, ScanProfile, WindVector,
};

const AVOGADRO: f64 = 6.022e23;
/// kg per mole of SO2.
const SO2_MOLAR_MASS: f64 = 0.064066;
/// Flat-plume widths blow up toward the horizon; lower angles are skipped.
const MIN_FLAT_ELEVATION_SIN: f64 = 0.05;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FluxError {
    #[error("profile {station}/{sweep} is incomplete")]
    IncompleteProfile { station: String, sweep: u64 },
    #[error("profile has {0} usable positions, need at least two")]
    TooFewSamples(usize),
    #[error("profile has no valid column densities")]
    NoValidPoints,
    #[error("plume geometry is not usable (range {range_m} m)")]
    InvalidGeometry { range_m: f64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlumeModel {
    /// All gas at a fixed range from the scanner.
    Arc,
    /// All gas in a horizontal layer at the plume height.
    Flat,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FluxConfig {
    pub plume_model: PlumeModel,
    /// Above this interpolated fraction the result is flagged low-confidence.
    pub max_gap_fraction: f64,
}

impl Default for FluxConfig {
    fn default() -> Self {
        Self {
            plume_model: PlumeModel::Arc,
            max_gap_fraction: 0.2,
        }
    }
}

/// Gap-filled column densities.
#[derive(Clone, Debug, PartialEq)]
pub struct GapFill {
    pub values: Vec<f64>,
    pub filled: usize,
}

/// Fills `None` entries by linear interpolation in angle between the nearest
/// valid neighbours; leading and trailing gaps copy the nearest valid value.
///
/// `samples` must be ordered by angle.
pub fn fill_gaps(samples: &[(f64, Option<f64>)]) -> Option<GapFill> {
    let valid: Vec<(usize, f64, f64)> = samples
        .iter()
        .enumerate()
        .filter_map(|(i, &(angle, value))| Some((i, angle, value.filter(|v| v.is_finite())?)))
        .collect();
    let (&(first, _, first_value), &(last, _, last_value)) = (valid.first()?, valid.last()?);
    let mut values = Vec::with_capacity(samples.len());
    // Index into `valid` of the first valid sample at or after the current one.
    let mut next = 0;
    for (i, &(angle, _)) in samples.iter().enumerate() {
        while next < valid.len() && valid[next].0 < i {
            next += 1;
        }
        let value = if valid.get(next).is_some_and(|v| v.0 == i) {
            valid[next].2
        } else if i < first {
            first_value
        } else if i > last {
            last_value
        } else {
            let (_, a0, v0) = valid[next - 1];
            let (_, a1, v1) = valid[next];
            if a1 == a0 {
                v0
            } else {
                v0 + (v1 - v0) * (angle - a0) / (a1 - a0)
            }
        };
        values.push(value);
    }
    Some(GapFill {
        filled: samples.len() - valid.len(),
        values,
    })
}

/// Profile positions in angle order: retrieved points keep their column
/// density unless low-confidence; missing positions are `None`.
pub fn profile_samples(profile: &ScanProfile) -> Vec<(f64, Option<f64>)> {
    let mut samples: Vec<(f64, Option<f64>)> = profile
        .points
        .iter()
        .map(|p| {
            let value = (!p.low_confidence).then_some(p.column_density);
            (p.angle_deg, value)
        })
        .chain(profile.missing.iter().map(|m| (m.angle_deg, None)))
        .collect();
    samples.sort_by(|a, b| a.0.total_cmp(&b.0));
    samples
}

/// Width of each sample's slice of the scan, midpoint rule.
fn midpoint_widths(positions: &[f64]) -> Vec<f64> {
    let n = positions.len();
    (0..n)
        .map(|i| {
            let lo = if i == 0 {
                positions[0]
            } else {
                0.5 * (positions[i - 1] + positions[i])
            };
            let hi = if i + 1 == n {
                positions[n - 1]
            } else {
                0.5 * (positions[i] + positions[i + 1])
            };
            (hi - lo).abs()
        })
        .collect()
}

pub struct FluxEngine {
    config: FluxConfig,
}

impl FluxEngine {
    pub fn new(config: FluxConfig) -> Self {
        Self { config }
    }

    pub fn compute_flux(
        &self,
        profile: &ScanProfile,
        geometry: &PlumeGeometry,
        wind: WindVector,
        source: FluxSource,
    ) -> Result<FluxResult, FluxError> {
        if !profile.is_complete() {
            return Err(FluxError::IncompleteProfile {
                station: profile.station.clone(),
                sweep: profile.sweep_number,
            });
        }
        let samples = profile_samples(profile);
        if samples.len() < 2 {
            return Err(FluxError::TooFewSamples(samples.len()));
        }
        let fill = fill_gaps(&samples).ok_or(FluxError::NoValidPoints)?;
        let gap_fraction = fill.filled as f64 / samples.len() as f64;

        // molecules/cm^2 * m summed over the plume cross-section.
        let integrated = match self.config.plume_model {
            PlumeModel::Arc => {
                let range = geometry.range_m();
                if !(range.is_finite() && range > 0.0) {
                    return Err(FluxError::InvalidGeometry { range_m: range });
                }
                let phis: Vec<f64> = samples.iter().map(|(a, _)| a.to_radians()).collect();
                midpoint_widths(&phis)
                    .iter()
                    .zip(&fill.values)
                    .map(|(dphi, cd)| cd * dphi * range)
                    .sum::<f64>()
            }
            PlumeModel::Flat => {
                let height = geometry.height_m;
                if !(height.is_finite() && height > 0.0) {
                    return Err(FluxError::InvalidGeometry { range_m: height });
                }
                let (xs, vertical): (Vec<f64>, Vec<f64>) = samples
                    .iter()
                    .zip(&fill.values)
                    .filter(|((a, _), _)| a.to_radians().sin() >= MIN_FLAT_ELEVATION_SIN)
                    .map(|((a, _), cd)| {
                        let theta = a.to_radians();
                        (height * theta.cos() / theta.sin(), cd * theta.sin())
                    })
                    .unzip();
                midpoint_widths(&xs)
                    .iter()
                    .zip(&vertical)
                    .map(|(dx, cd)| cd * dx)
                    .sum::<f64>()
            }
        };

        // Component across the vertical plane from the station to the plume.
        let effective_wind = wind.speed_ms
            * (wind.bearing_deg - geometry.bearing_deg).to_radians().sin().abs();
        let kg_per_m = integrated * 1.0e4 / AVOGADRO * SO2_MOLAR_MASS;
        let flux_kg_s = if kg_per_m == 0.0 { 0.0 } else { kg_per_m * effective_wind };

        let (err_sum, cd_sum, n) = profile
            .points
            .iter()
            .filter(|p| !p.low_confidence)
            .fold((0.0, 0.0, 0usize), |(e, c, n), p| {
                (e + p.column_density_err.abs(), c + p.column_density, n + 1)
            });
        let relative_err = if n > 0 && cd_sum.abs() > 0.0 { err_sum / cd_sum.abs() } else { 0.0 };

        let quality = if gap_fraction > self.config.max_gap_fraction {
            FluxQuality::LowConfidence
        } else {
            FluxQuality::Good
        };
        Ok(FluxResult {
            timestamp: profile.midpoint(),
            station: profile.station.clone(),
            source,
            sweep_number: profile.sweep_number,
            flux_kg_s,
            flux_err_kg_s: flux_kg_s.abs() * relative_err,
            geometry: geometry.clone(),
            wind,
            quality,
            gap_fraction,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColumnDensityPoint, FitQuality, MissingPoint, ProfileStatus};
    use approx::assert_relative_eq;
    use chrono::{Duration, Utc};

    fn profile(values: &[(f64, f64, bool)]) -> ScanProfile {
        let t0 = Utc::now();
        ScanProfile {
            station: "A".into(),
            sweep_number: 1,
            started_at: t0,
            ended_at: t0 + Duration::seconds(60),
            scan_azimuth_deg: 90.0,
            dark: None,
            points: values
                .iter()
                .map(|&(angle_deg, cd, low)| ColumnDensityPoint {
                    angle_deg,
                    timestamp: t0,
                    column_density: cd,
                    column_density_err: 0.1 * cd.abs(),
                    fit_quality: FitQuality {
                        rms_residual: 1e-3,
                        r_squared: 0.99,
                    },
                    low_confidence: low,
                    peak_intensity: 20_000.0,
                })
                .collect(),
            missing: vec![],
            expected_points: values.len(),
            status: ProfileStatus::Complete,
        }
    }

    fn wind(speed_ms: f64, bearing_deg: f64) -> WindVector {
        WindVector {
            speed_ms,
            bearing_deg,
        }
    }

    fn source() -> FluxSource {
        FluxSource::Station("A".into())
    }

    #[test]
    fn fill_gaps_interpolates_linearly() {
        let samples = [(0.0, None), (1.0, Some(2.0)), (2.0, None), (4.0, Some(8.0)), (5.0, None)];
        let fill = fill_gaps(&samples).unwrap();
        assert_eq!(fill.values, vec![2.0, 2.0, 4.0, 8.0, 8.0]);
        assert_eq!(fill.filled, 3);
        assert!(fill_gaps(&[(0.0, None), (1.0, None)]).is_none());
    }

    #[test]
    fn zero_column_gives_zero_flux_for_any_wind() {
        let p = profile(&[(10.0, 0.0, false), (20.0, 0.0, false), (30.0, 0.0, false)]);
        let engine = FluxEngine::new(FluxConfig::default());
        let geometry = PlumeGeometry::fixed(500.0, 500.0, 90.0);
        for w in [wind(0.0, 0.0), wind(12.0, 0.0), wind(3.0, 137.0), wind(f64::NAN, 0.0)] {
            let result = engine.compute_flux(&p, &geometry, w, source()).unwrap();
            assert_eq!(result.flux_kg_s, 0.0);
        }
    }

    #[test]
    fn uniform_arc_matches_closed_form() {
        // 1e17 molecules/cm^2 over 0.5 rad of arc at 1000 m range.
        let angles: Vec<f64> = (0..=10).map(|i| 30.0 + i as f64 * 0.05f64.to_degrees()).collect();
        let values: Vec<(f64, f64, bool)> = angles.iter().map(|&a| (a, 1.0e17, false)).collect();
        let p = profile(&values);
        let engine = FluxEngine::new(FluxConfig::default());
        let geometry = PlumeGeometry::fixed(600.0, 800.0, 90.0);
        let result = engine.compute_flux(&p, &geometry, wind(5.0, 0.0), source()).unwrap();
        let expected = 1.0e17 * 0.5 * 1000.0 * 1.0e4 / AVOGADRO * SO2_MOLAR_MASS * 5.0;
        assert_relative_eq!(result.flux_kg_s, expected, max_relative = 1e-9);
        assert_eq!(result.quality, FluxQuality::Good);
        assert_relative_eq!(result.flux_err_kg_s, 0.1 * expected, max_relative = 1e-9);
    }

    #[test]
    fn wind_along_scan_plane_carries_nothing() {
        let p = profile(&[(10.0, 1.0e17, false), (20.0, 1.0e17, false)]);
        let engine = FluxEngine::new(FluxConfig::default());
        let geometry = PlumeGeometry::fixed(500.0, 500.0, 90.0);
        let result = engine.compute_flux(&p, &geometry, wind(10.0, 90.0), source()).unwrap();
        assert!(result.flux_kg_s.abs() < 1e-9);
    }

    #[test]
    fn gaps_are_interpolated_and_flagged() {
        let mut p = profile(&[
            (10.0, 1.0e17, false),
            (20.0, 9.9e19, true),
            (40.0, 1.0e17, false),
        ]);
        p.missing.push(MissingPoint {
            angle_deg: 30.0,
            timestamp: p.started_at,
            reason: "saturated".into(),
        });
        let engine = FluxEngine::new(FluxConfig::default());
        let geometry = PlumeGeometry::fixed(500.0, 500.0, 90.0);
        let gappy = engine.compute_flux(&p, &geometry, wind(5.0, 180.0), source()).unwrap();
        assert_eq!(gappy.quality, FluxQuality::LowConfidence);
        assert_relative_eq!(gappy.gap_fraction, 0.5);

        let full = profile(&[
            (10.0, 1.0e17, false),
            (20.0, 1.0e17, false),
            (30.0, 1.0e17, false),
            (40.0, 1.0e17, false),
        ]);
        let reference = engine.compute_flux(&full, &geometry, wind(5.0, 180.0), source()).unwrap();
        assert_relative_eq!(gappy.flux_kg_s, reference.flux_kg_s, max_relative = 1e-12);
    }

    #[test]
    fn incomplete_profiles_are_refused() {
        let mut p = profile(&[(10.0, 1.0e17, false), (20.0, 1.0e17, false)]);
        p.status = ProfileStatus::Incomplete(crate::model::IncompleteReason::TooFewPoints {
            valid: 2,
            required: 5,
        });
        let engine = FluxEngine::new(FluxConfig::default());
        let geometry = PlumeGeometry::fixed(500.0, 500.0, 90.0);
        assert!(matches!(
            engine.compute_flux(&p, &geometry, wind(5.0, 0.0), source()),
            Err(FluxError::IncompleteProfile { .. })
        ));
    }

    #[test]
    fn flat_model_uses_horizontal_widths() {
        // Overhead plume layer 1000 m up, uniform vertical column.
        let values: Vec<(f64, f64, bool)> = [45.0f64, 90.0, 135.0]
            .iter()
            .map(|&a| (a, 1.0e17 / a.to_radians().sin(), false))
            .collect();
        let p = profile(&values);
        let engine = FluxEngine::new(FluxConfig {
            plume_model: PlumeModel::Flat,
            ..FluxConfig::default()
        });
        let geometry = PlumeGeometry::fixed(1000.0, 0.0, 90.0);
        let result = engine.compute_flux(&p, &geometry, wind(1.0, 0.0), source()).unwrap();
        // Horizontal extent from x = 1000 to x = -1000.
        let expected = 1.0e17 * 2000.0 * 1.0e4 / AVOGADRO * SO2_MOLAR_MASS;
        assert_relative_eq!(result.flux_kg_s, expected, max_relative = 1e-9);
    }
}
