use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::assembler::AssemblerConfig;
use crate::drivers::{SimulationConfig, SyntheticPlume};
use crate::exposure::ExposureConfig;
use crate::flux::FluxConfig;
use crate::fusion::{FusionConfig, GeometryPolicy};
use crate::retrieval::RetrievalConfig;
use crate::scan::SweepConfig;
use crate::station::PipelineSettings;
use crate::triangulation::StationSite;
use crate::wind::WindConfig;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("no stations configured")]
    NoStations,
    #[error("station {0} configured twice")]
    DuplicateStation(String),
    #[error("invalid exposure limits: {0}")]
    Exposure(&'static str),
    #[error("invalid sweep: {0}")]
    Sweep(&'static str),
    #[error("fit window must have a lower bound below its upper bound")]
    FitWindow,
    #[error("{name} must lie in [0, 1], got {value}")]
    Fraction { name: &'static str, value: f64 },
    #[error("periodic geometry needs every_n_cycles >= 1")]
    GeometryPeriod,
    #[error("fixed geometry policy needs fixed_geometry")]
    MissingFixedGeometry,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StationConfig {
    pub site: StationSite,
    /// Settings of the simulated head standing in for this station's hardware.
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub stations: Vec<StationConfig>,
    pub sweep: SweepConfig,
    pub exposure: ExposureConfig,
    pub retrieval: RetrievalConfig,
    pub assembler: AssemblerConfig,
    pub fusion: FusionConfig,
    pub flux: FluxConfig,
    pub wind: WindConfig,
    /// Where scan CSVs, snapshots, plots and the flux log are written.
    pub output_dir: String,
    /// Sweeps each station runs before the demo stops.
    pub cycles: u32,
    /// Integration time of the simulated clear-sky reference.
    pub reference_integration_ms: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let station = |id: &str, longitude_deg: f64, center_deg: f64, seed: u64| StationConfig {
            site: StationSite {
                id: id.into(),
                latitude_deg: 16.7171,
                longitude_deg,
                altitude_m: 0.0,
                scan_azimuth_deg: 90.0,
            },
            simulation: SimulationConfig {
                plume: SyntheticPlume {
                    center_deg,
                    width_deg: 15.0,
                    peak_column_density: 5.0e17,
                },
                seed,
                ..SimulationConfig::default()
            },
        };
        Self {
            stations: vec![
                station("west", -62.2176, 45.0, 7),
                station("east", -62.2082, 135.0, 11),
            ],
            sweep: SweepConfig::default(),
            exposure: ExposureConfig::default(),
            retrieval: RetrievalConfig::default(),
            assembler: AssemblerConfig::default(),
            fusion: FusionConfig::default(),
            flux: FluxConfig::default(),
            wind: WindConfig::default(),
            output_dir: "output".into(),
            cycles: 3,
            reference_integration_ms: 100.0,
        }
    }
}

impl NetworkConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stations.is_empty() {
            return Err(ConfigError::NoStations);
        }
        let mut ids = BTreeSet::new();
        for station in &self.stations {
            if !ids.insert(station.site.id.as_str()) {
                return Err(ConfigError::DuplicateStation(station.site.id.clone()));
            }
        }

        let e = &self.exposure;
        if !(e.min_integration_ms > 0.0 && e.min_integration_ms <= e.max_integration_ms) {
            return Err(ConfigError::Exposure("need 0 < min <= max integration time"));
        }
        if e.low_threshold >= e.high_threshold {
            return Err(ConfigError::Exposure("low threshold must be below high threshold"));
        }
        if e.growth_factor <= 1.0 {
            return Err(ConfigError::Exposure("growth factor must exceed 1"));
        }

        if self.sweep.angles_deg.is_empty() {
            return Err(ConfigError::Sweep("no scan angles"));
        }
        if self.sweep.angle_per_step_deg <= 0.0 {
            return Err(ConfigError::Sweep("angle per step must be positive"));
        }
        if self.sweep.coadds == 0 {
            return Err(ConfigError::Sweep("co-adds must be at least 1"));
        }

        let (lo, hi) = self.retrieval.fit_window_nm;
        if lo >= hi {
            return Err(ConfigError::FitWindow);
        }
        for (name, value) in [
            ("assembler.min_point_fraction", self.assembler.min_point_fraction),
            ("flux.max_gap_fraction", self.flux.max_gap_fraction),
            (
                "fusion.triangulation.quality.max_bad_fraction",
                self.fusion.triangulation.quality.max_bad_fraction,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Fraction { name, value });
            }
        }

        match self.fusion.geometry_policy {
            GeometryPolicy::Periodic { every_n_cycles: 0 } => {
                return Err(ConfigError::GeometryPeriod)
            }
            GeometryPolicy::Fixed if self.fusion.fixed_geometry.is_none() => {
                return Err(ConfigError::MissingFixedGeometry)
            }
            _ => {}
        }
        Ok(())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            sweep: self.sweep.clone(),
            exposure: self.exposure.clone(),
            retrieval: self.retrieval.clone(),
            assembler: self.assembler.clone(),
        }
    }

    pub fn sites(&self) -> Vec<StationSite> {
        self.stations.iter().map(|s| s.site.clone()).collect()
    }
}
