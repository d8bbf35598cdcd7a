use std::f64::consts::PI;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::error::HardwareFault;
use super::source::{RawSpectrum, ScannerHead, SpectrumSource, StepDirection, DEFAULT_SATURATION_LEVEL};
use crate::retrieval::ReferenceSpectrum;

/// Gaussian SO2 plume seen across the scan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyntheticPlume {
    pub center_deg: f64,
    pub width_deg: f64,
    /// Slant column at the plume centre, molecules/cm^2.
    pub peak_column_density: f64,
}

impl SyntheticPlume {
    pub fn column_density(&self, angle_deg: f64) -> f64 {
        let z = (angle_deg - self.center_deg) / self.width_deg.max(f64::EPSILON);
        self.peak_column_density * (-0.5 * z * z).exp()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub pixels: usize,
    pub wavelength_range_nm: (f64, f64),
    /// Clear-sky counts per millisecond at the brightest pixel.
    pub counts_per_ms: f64,
    pub dark_offset: f64,
    /// Peak-to-peak uniform noise relative to the signal.
    pub noise_fraction: f64,
    pub plume: SyntheticPlume,
    /// Where the head sits when the simulation starts, in steps past home.
    pub start_offset_steps: u32,
    pub step_duration_ms: f64,
    pub seed: u64,
    /// Never close the home switch.
    pub stall_home: bool,
    /// Stop answering captures after this many.
    pub timeout_after_captures: Option<usize>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            pixels: 1024,
            wavelength_range_nm: (280.0, 420.0),
            counts_per_ms: 400.0,
            dark_offset: 1_500.0,
            noise_fraction: 0.002,
            plume: SyntheticPlume {
                center_deg: 90.0,
                width_deg: 10.0,
                peak_column_density: 5.0e17,
            },
            start_offset_steps: 37,
            step_duration_ms: 2.0,
            seed: 7,
            stall_home: false,
            timeout_after_captures: None,
        }
    }
}

/// Simulated scanner head and spectrometer looking through a synthetic plume.
/// Time is simulated too: the clock advances by each step and integration.
pub struct VirtualScanner {
    config: SimulationConfig,
    home_angle_deg: f64,
    angle_per_step_deg: f64,
    steps_per_turn: i64,
    position: i64,
    clock: DateTime<Utc>,
    captures: usize,
    rng: StdRng,
}

impl VirtualScanner {
    pub fn new(
        config: SimulationConfig,
        home_angle_deg: f64,
        angle_per_step_deg: f64,
        epoch: DateTime<Utc>,
    ) -> Self {
        let steps_per_turn = (360.0 / angle_per_step_deg.abs().max(f64::EPSILON)).round() as i64;
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            position: i64::from(config.start_offset_steps),
            config,
            home_angle_deg,
            angle_per_step_deg,
            steps_per_turn: steps_per_turn.max(1),
            clock: epoch,
            captures: 0,
        }
    }

    pub fn wavelengths(&self) -> Vec<f64> {
        let (lo, hi) = self.config.wavelength_range_nm;
        let n = self.config.pixels.max(2);
        (0..n)
            .map(|i| lo + (hi - lo) * i as f64 / (n - 1) as f64)
            .collect()
    }

    /// Clear-sky reference and cross-section matching this scanner's optics.
    pub fn reference(&self, integration_time_ms: f64) -> ReferenceSpectrum {
        let wavelengths_nm = self.wavelengths();
        let clear_sky = wavelengths_nm
            .iter()
            .map(|&wl| self.sky_rate(wl) * integration_time_ms)
            .collect();
        let cross_section = wavelengths_nm.iter().map(|&wl| so2_cross_section(wl)).collect();
        ReferenceSpectrum {
            wavelengths_nm,
            clear_sky,
            clear_sky_integration_ms: integration_time_ms,
            cross_section,
        }
    }

    /// Head angle, taken within one turn past home.
    pub fn angle_deg(&self) -> f64 {
        self.home_angle_deg + self.position.rem_euclid(self.steps_per_turn) as f64 * self.angle_per_step_deg
    }

    fn at_home(&self) -> bool {
        self.position.rem_euclid(self.steps_per_turn) == 0
    }

    fn sky_rate(&self, wavelength_nm: f64) -> f64 {
        let (lo, hi) = self.config.wavelength_range_nm;
        let x = ((wavelength_nm - lo) / (hi - lo)).clamp(0.0, 1.0);
        self.config.counts_per_ms * (0.2 + 0.8 * x.powf(1.5))
    }

    fn advance(&mut self, ms: f64) {
        self.clock += chrono::Duration::microseconds((ms * 1_000.0) as i64);
    }
}

/// Synthetic SO2 absorption cross-section, cm^2/molecule, with the banded
/// structure of the real one.
pub fn so2_cross_section(wavelength_nm: f64) -> f64 {
    let bands = 1.0 + 0.7 * (2.0 * PI * wavelength_nm / 2.8).sin();
    1.0e-19 * bands * (-(wavelength_nm - 300.0) / 15.0).exp()
}

impl SpectrumSource for VirtualScanner {
    fn capture(
        &mut self,
        integration_time_ms: f64,
        timeout: Duration,
    ) -> Result<RawSpectrum, HardwareFault> {
        let timed_out = self
            .config
            .timeout_after_captures
            .is_some_and(|limit| self.captures >= limit);
        if timed_out || integration_time_ms > timeout.as_secs_f64() * 1_000.0 {
            self.advance(timeout.as_secs_f64() * 1_000.0);
            return Err(HardwareFault::CaptureTimeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        self.captures += 1;

        let dark = self.at_home();
        let column = if dark {
            0.0
        } else {
            self.config.plume.column_density(self.angle_deg())
        };
        let wavelengths = self.wavelengths();
        let mut intensities = Vec::with_capacity(wavelengths.len());
        for wl in wavelengths {
            let signal = if dark {
                0.0
            } else {
                self.sky_rate(wl) * integration_time_ms * (-so2_cross_section(wl) * column).exp()
            };
            let jitter = self.config.noise_fraction * (self.rng.gen::<f64>() - 0.5);
            intensities.push(
                (self.config.dark_offset + signal * (1.0 + jitter)).clamp(0.0, DEFAULT_SATURATION_LEVEL),
            );
        }
        self.advance(integration_time_ms);
        Ok(RawSpectrum::new(
            intensities,
            integration_time_ms,
            self.clock,
            DEFAULT_SATURATION_LEVEL,
        ))
    }
}

impl ScannerHead for VirtualScanner {
    fn step(&mut self, steps: u32, direction: StepDirection) -> Result<(), HardwareFault> {
        match direction {
            StepDirection::Backward => self.position += i64::from(steps),
            StepDirection::Forward => self.position -= i64::from(steps),
        }
        self.advance(self.config.step_duration_ms * f64::from(steps));
        Ok(())
    }

    fn home_switch_triggered(&self) -> bool {
        !self.config.stall_home && self.at_home()
    }
}
