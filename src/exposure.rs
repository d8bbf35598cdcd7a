use log::debug;
use serde::{Deserialize, Serialize};

use crate::drivers::RawSpectrum;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureConfig {
    pub start_integration_ms: f64,
    pub min_integration_ms: f64,
    /// Upper bound, normally set by the station's duty-cycle budget.
    pub max_integration_ms: f64,
    /// Peak counts below which the integration time grows.
    pub low_threshold: f64,
    /// Peak counts above which the integration time is halved.
    pub high_threshold: f64,
    pub growth_factor: f64,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            start_integration_ms: 100.0,
            min_integration_ms: 10.0,
            max_integration_ms: 1000.0,
            low_threshold: 20_000.0,
            high_threshold: 55_000.0,
            growth_factor: 1.5,
        }
    }
}

impl ExposureConfig {
    /// Integration time for the next capture given the last capture's peak.
    ///
    /// Pure: the result always lies in `[min_integration_ms, max_integration_ms]`.
    pub fn adjust(&self, current_ms: f64, peak_intensity: f64, saturated: bool) -> f64 {
        let next = if saturated || peak_intensity > self.high_threshold {
            current_ms / 2.0
        } else if peak_intensity < self.low_threshold {
            current_ms * self.growth_factor
        } else {
            current_ms
        };
        if next.is_nan() {
            return self.start_integration_ms.clamp(self.min_integration_ms, self.max_integration_ms);
        }
        next.clamp(self.min_integration_ms, self.max_integration_ms)
    }
}

/// Tracks the integration time used by one station's spectrometer.
#[derive(Clone, Debug)]
pub struct ExposureController {
    config: ExposureConfig,
    current_ms: f64,
}

impl ExposureController {
    pub fn new(config: ExposureConfig) -> Self {
        let current_ms = config
            .start_integration_ms
            .clamp(config.min_integration_ms, config.max_integration_ms);
        Self { config, current_ms }
    }
    pub fn current_ms(&self) -> f64 {
        self.current_ms
    }
    /// Feeds the latest capture back and returns the time for the next one.
    pub fn update(&mut self, spectrum: &RawSpectrum) -> f64 {
        let next = self.config.adjust(
            self.current_ms,
            spectrum.peak_intensity(),
            spectrum.saturated,
        );
        if next != self.current_ms {
            debug!(
                "integration time {:.1} ms -> {:.1} ms (peak {:.0})",
                self.current_ms,
                next,
                spectrum.peak_intensity()
            );
        }
        self.current_ms = next;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn saturation_halves_down_to_minimum() {
        let cfg = ExposureConfig::default();
        assert_eq!(cfg.adjust(100.0, 60_000.0, false), 50.0);
        assert_eq!(cfg.adjust(100.0, 30_000.0, true), 50.0);
        assert_eq!(cfg.adjust(12.0, 65_535.0, true), cfg.min_integration_ms);
    }

    #[test]
    fn dim_spectra_grow_up_to_maximum() {
        let cfg = ExposureConfig::default();
        assert_eq!(cfg.adjust(100.0, 1_000.0, false), 150.0);
        assert_eq!(cfg.adjust(900.0, 1_000.0, false), cfg.max_integration_ms);
    }

    #[test]
    fn in_band_is_unchanged() {
        let cfg = ExposureConfig::default();
        assert_eq!(cfg.adjust(250.0, 40_000.0, false), 250.0);
    }

    #[test]
    fn result_always_within_bounds() {
        let cfg = ExposureConfig::default();
        let peaks = [0.0, 5_000.0, 20_000.0, 37_000.0, 55_000.0, 70_000.0, f64::NAN];
        let mut t = cfg.min_integration_ms;
        while t <= cfg.max_integration_ms {
            for &peak in &peaks {
                for saturated in [false, true] {
                    let next = cfg.adjust(t, peak, saturated);
                    assert!(next >= cfg.min_integration_ms && next <= cfg.max_integration_ms);
                }
            }
            t += 7.5;
        }
    }

    #[test]
    fn controller_tracks_last_capture() {
        let mut ctl = ExposureController::new(ExposureConfig::default());
        let bright = RawSpectrum::new(vec![0.0, 65_535.0], 100.0, Utc::now(), 65_535.0);
        assert_eq!(ctl.update(&bright), 50.0);
        assert_eq!(ctl.current_ms(), 50.0);
    }
}
