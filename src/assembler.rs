use log::warn;
use serde::{Deserialize, Serialize};

use crate::drivers::{DarkSpectrum, HardwareFault};
use crate::model::{
    ColumnDensityPoint, IncompleteReason, MissingPoint, ProfileStatus, ScanProfile, StationId,
};
use crate::scan::SweepRecord;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblerConfig {
    /// Fraction of the expected sweep positions that must hold a retrieved point.
    pub min_point_fraction: f64,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            min_point_fraction: 0.8,
        }
    }
}

/// Collects one sweep's retrieval results into a [`ScanProfile`].
pub struct ScanAssembler {
    config: AssemblerConfig,
    station: StationId,
    scan_azimuth_deg: f64,
    sweep_number: u64,
    expected_points: usize,
    points: Vec<ColumnDensityPoint>,
    missing: Vec<MissingPoint>,
    last_angle: Option<f64>,
}

impl ScanAssembler {
    pub fn new(config: AssemblerConfig, station: StationId, scan_azimuth_deg: f64) -> Self {
        Self {
            config,
            station,
            scan_azimuth_deg,
            sweep_number: 0,
            expected_points: 0,
            points: Vec::new(),
            missing: Vec::new(),
            last_angle: None,
        }
    }

    /// Starts collecting a new sweep, discarding anything left from the last one.
    pub fn begin(&mut self, sweep_number: u64, expected_points: usize) {
        self.sweep_number = sweep_number;
        self.expected_points = expected_points;
        self.points.clear();
        self.missing.clear();
        self.last_angle = None;
    }

    /// Adds a retrieved point. Returns `false` when its angle would break the
    /// strictly increasing order; such points are dropped.
    pub fn push_point(&mut self, point: ColumnDensityPoint) -> bool {
        if !self.accept_angle(point.angle_deg) {
            return false;
        }
        self.points.push(point);
        true
    }

    pub fn push_missing(&mut self, missing: MissingPoint) -> bool {
        if !self.accept_angle(missing.angle_deg) {
            return false;
        }
        self.missing.push(missing);
        true
    }

    fn accept_angle(&mut self, angle_deg: f64) -> bool {
        if self.last_angle.is_some_and(|last| angle_deg <= last) || !angle_deg.is_finite() {
            warn!(
                "[{}] sweep {}: dropping out-of-order angle {angle_deg:.2}",
                self.station, self.sweep_number
            );
            return false;
        }
        self.last_angle = Some(angle_deg);
        true
    }

    pub fn finish(&mut self, record: &SweepRecord, dark: Option<DarkSpectrum>) -> ScanProfile {
        let status = self.status(record.fault.as_ref());
        if let ProfileStatus::Incomplete(reason) = &status {
            warn!(
                "[{}] sweep {} incomplete: {reason:?}",
                self.station, self.sweep_number
            );
        }
        ScanProfile {
            station: self.station.clone(),
            sweep_number: self.sweep_number,
            started_at: record.started_at,
            ended_at: record.ended_at,
            scan_azimuth_deg: self.scan_azimuth_deg,
            dark,
            points: std::mem::take(&mut self.points),
            missing: std::mem::take(&mut self.missing),
            expected_points: self.expected_points,
            status,
        }
    }

    fn status(&self, fault: Option<&HardwareFault>) -> ProfileStatus {
        if let Some(fault) = fault {
            return ProfileStatus::Incomplete(IncompleteReason::Aborted {
                fault: fault.clone(),
            });
        }
        let required = (self.config.min_point_fraction * self.expected_points as f64).ceil() as usize;
        if self.points.len() < required.max(1) {
            return ProfileStatus::Incomplete(IncompleteReason::TooFewPoints {
                valid: self.points.len(),
                required: required.max(1),
            });
        }
        ProfileStatus::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FitQuality;
    use chrono::Utc;

    fn point(angle_deg: f64) -> ColumnDensityPoint {
        ColumnDensityPoint {
            angle_deg,
            timestamp: Utc::now(),
            column_density: 1.0e17,
            column_density_err: 1.0e15,
            fit_quality: FitQuality {
                rms_residual: 1e-3,
                r_squared: 0.99,
            },
            low_confidence: false,
            peak_intensity: 20_000.0,
        }
    }

    fn record(expected: usize, fault: Option<HardwareFault>) -> SweepRecord {
        SweepRecord {
            station: "A".into(),
            sweep_number: 3,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            dark: None,
            captures: vec![],
            expected_points: expected,
            fault,
        }
    }

    #[test]
    fn drops_non_increasing_angles() {
        let mut asm = ScanAssembler::new(AssemblerConfig::default(), "A".into(), 90.0);
        asm.begin(3, 4);
        assert!(asm.push_point(point(10.0)));
        assert!(asm.push_point(point(20.0)));
        assert!(!asm.push_point(point(20.0)));
        assert!(!asm.push_point(point(15.0)));
        assert!(asm.push_point(point(30.0)));
        let profile = asm.finish(&record(4, None), None);
        let angles: Vec<f64> = profile.angles().collect();
        assert_eq!(angles, vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn too_few_points_marks_incomplete() {
        let mut asm = ScanAssembler::new(AssemblerConfig::default(), "A".into(), 90.0);
        asm.begin(3, 10);
        for i in 0..7 {
            asm.push_point(point(i as f64));
        }
        let profile = asm.finish(&record(10, None), None);
        assert_eq!(
            profile.status,
            ProfileStatus::Incomplete(IncompleteReason::TooFewPoints {
                valid: 7,
                required: 8
            })
        );
        assert_eq!(profile.points.len(), 7);
    }

    #[test]
    fn aborted_sweep_is_incomplete_even_with_enough_points() {
        let mut asm = ScanAssembler::new(AssemblerConfig::default(), "A".into(), 90.0);
        asm.begin(3, 2);
        asm.push_point(point(1.0));
        asm.push_point(point(2.0));
        let fault = HardwareFault::CaptureTimeout { timeout_ms: 10 };
        let profile = asm.finish(&record(2, Some(fault.clone())), None);
        assert_eq!(
            profile.status,
            ProfileStatus::Incomplete(IncompleteReason::Aborted { fault })
        );
    }
}
