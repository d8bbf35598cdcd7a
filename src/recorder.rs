use std::fs::{self, File, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;

use crate::model::{FluxQuality, FluxResult, GeometrySource, ScanProfile};
use crate::plot::{render_flux_png, render_profile_png, PlotStyle};

#[derive(Serialize)]
struct ProfileRow<'a> {
    angle_deg: f64,
    timestamp: DateTime<Utc>,
    column_density: Option<f64>,
    column_density_err: Option<f64>,
    rms_residual: Option<f64>,
    r_squared: Option<f64>,
    peak_intensity: Option<f64>,
    low_confidence: bool,
    missing_reason: &'a str,
}

#[derive(Serialize)]
struct FluxRow<'a> {
    timestamp: DateTime<Utc>,
    station: &'a str,
    source: String,
    sweep_number: u64,
    flux_kg_s: f64,
    flux_err_kg_s: f64,
    flux_t_day: f64,
    plume_height_m: f64,
    plume_distance_m: f64,
    geometry: &'static str,
    wind_speed_ms: f64,
    wind_bearing_deg: f64,
    gap_fraction: f64,
    low_confidence: bool,
}

impl<'a> From<&'a FluxResult> for FluxRow<'a> {
    fn from(r: &'a FluxResult) -> Self {
        Self {
            timestamp: r.timestamp,
            station: &r.station,
            source: r.source.to_string(),
            sweep_number: r.sweep_number,
            flux_kg_s: r.flux_kg_s,
            flux_err_kg_s: r.flux_err_kg_s,
            flux_t_day: r.tonnes_per_day(),
            plume_height_m: r.geometry.height_m,
            plume_distance_m: r.geometry.distance_m,
            geometry: match r.geometry.source {
                GeometrySource::Fixed => "fixed",
                GeometrySource::Triangulated { .. } => "triangulated",
            },
            wind_speed_ms: r.wind.speed_ms,
            wind_bearing_deg: r.wind.bearing_deg,
            gap_fraction: r.gap_fraction,
            low_confidence: r.quality == FluxQuality::LowConfidence,
        }
    }
}

/// Writes per-sweep results and the running flux log under one directory.
pub struct ResultsRecorder {
    dir: PathBuf,
    plots: bool,
    style: PlotStyle,
}

impl ResultsRecorder {
    pub fn new(dir: impl Into<PathBuf>, plots: bool) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(Self {
            dir,
            plots,
            style: PlotStyle::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File stem of a sweep's outputs, e.g. `20240301_120000_west_Scan003_so2`.
    pub fn profile_stem(profile: &ScanProfile) -> String {
        format!(
            "{}_{}_Scan{:03}_so2",
            profile.started_at.format("%Y%m%d_%H%M%S"),
            profile.station,
            profile.sweep_number
        )
    }

    /// Writes the profile as CSV plus a JSON snapshot (and a PNG when plots
    /// are enabled). Returns the CSV path.
    pub fn record_profile(&self, profile: &ScanProfile) -> anyhow::Result<PathBuf> {
        let stem = Self::profile_stem(profile);
        let csv_path = self.dir.join(format!("{stem}.csv"));
        let mut writer = csv::Writer::from_path(&csv_path)
            .with_context(|| format!("creating {}", csv_path.display()))?;

        let mut rows: Vec<ProfileRow> = profile
            .points
            .iter()
            .map(|p| ProfileRow {
                angle_deg: p.angle_deg,
                timestamp: p.timestamp,
                column_density: Some(p.column_density),
                column_density_err: Some(p.column_density_err),
                rms_residual: Some(p.fit_quality.rms_residual),
                r_squared: Some(p.fit_quality.r_squared),
                peak_intensity: Some(p.peak_intensity),
                low_confidence: p.low_confidence,
                missing_reason: "",
            })
            .chain(profile.missing.iter().map(|m| ProfileRow {
                angle_deg: m.angle_deg,
                timestamp: m.timestamp,
                column_density: None,
                column_density_err: None,
                rms_residual: None,
                r_squared: None,
                peak_intensity: None,
                low_confidence: true,
                missing_reason: &m.reason,
            }))
            .collect();
        rows.sort_by(|a, b| a.angle_deg.total_cmp(&b.angle_deg));
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;

        let json_path = self.dir.join(format!("{stem}.json"));
        let file = File::create(&json_path)
            .with_context(|| format!("creating {}", json_path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), profile)?;

        if self.plots && !profile.points.is_empty() {
            match render_profile_png(profile, &self.style) {
                Ok(png) => fs::write(self.dir.join(format!("{stem}.png")), png)?,
                Err(e) => warn!("profile plot for {stem} skipped: {e}"),
            }
        }
        info!("saved {}", csv_path.display());
        Ok(csv_path)
    }

    /// Appends one row to `flux.csv`, writing the header when the file is new.
    pub fn record_flux(&self, result: &FluxResult) -> anyhow::Result<()> {
        let path = self.dir.join("flux.csv");
        let is_new = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(file);
        writer.serialize(FluxRow::from(result))?;
        writer.flush()?;
        Ok(())
    }

    pub fn record_flux_history(&self, results: &[FluxResult]) -> anyhow::Result<()> {
        if !self.plots || results.is_empty() {
            return Ok(());
        }
        let png = render_flux_png(results, &self.style)?;
        fs::write(self.dir.join("flux.png"), png)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ColumnDensityPoint, FitQuality, FluxSource, MissingPoint, PlumeGeometry, ProfileStatus,
        WindVector,
    };
    use chrono::TimeZone;

    fn profile() -> ScanProfile {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let point = |angle_deg: f64| ColumnDensityPoint {
            angle_deg,
            timestamp: t,
            column_density: 2.0e17,
            column_density_err: 1.0e15,
            fit_quality: FitQuality {
                rms_residual: 1e-3,
                r_squared: 0.99,
            },
            low_confidence: false,
            peak_intensity: 20_000.0,
        };
        ScanProfile {
            station: "west".into(),
            sweep_number: 3,
            started_at: t,
            ended_at: t,
            scan_azimuth_deg: 90.0,
            dark: None,
            points: vec![point(10.0), point(30.0)],
            missing: vec![MissingPoint {
                angle_deg: 20.0,
                timestamp: t,
                reason: "saturated".into(),
            }],
            expected_points: 3,
            status: ProfileStatus::Complete,
        }
    }

    #[test]
    fn profile_files_are_named_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ResultsRecorder::new(dir.path(), false).unwrap();
        let path = recorder.record_profile(&profile()).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "20240301_120000_west_Scan003_so2.csv"
        );
        let mut reader = csv::Reader::from_path(&path).unwrap();
        let angles: Vec<String> = reader
            .records()
            .map(|r| r.unwrap()[0].to_string())
            .collect();
        assert_eq!(angles, vec!["10.0", "20.0", "30.0"]);

        let json = fs::read_to_string(path.with_extension("json")).unwrap();
        let back: ScanProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(back, profile());
    }

    #[test]
    fn flux_log_appends_with_single_header() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ResultsRecorder::new(dir.path(), false).unwrap();
        let result = FluxResult {
            timestamp: Utc::now(),
            station: "west".into(),
            source: FluxSource::Pair("west".into(), "east".into()),
            sweep_number: 1,
            flux_kg_s: 12.5,
            flux_err_kg_s: 1.0,
            geometry: PlumeGeometry::fixed(500.0, 500.0, 90.0),
            wind: WindVector {
                speed_ms: 5.0,
                bearing_deg: 0.0,
            },
            quality: FluxQuality::Good,
            gap_fraction: 0.0,
        };
        recorder.record_flux(&result).unwrap();
        recorder.record_flux(&result).unwrap();
        let text = fs::read_to_string(dir.path().join("flux.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,station,source"));
        assert!(lines[1].contains("west+east"));
    }
}
