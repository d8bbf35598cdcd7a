#[cfg(test)]
use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::drivers::HardwareFault;

/// Full-scale count of a 16 bit spectrometer ADC.
pub const DEFAULT_SATURATION_LEVEL: f64 = 65535.0;

/// One spectrometer capture, intensity per pixel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawSpectrum {
    pub intensities: Vec<f64>,
    pub integration_time_ms: f64,
    pub captured_at: DateTime<Utc>,
    pub saturated: bool,
}

impl RawSpectrum {
    /// Builds a spectrum, flagging it saturated when any pixel reaches `saturation_level`.
    pub fn new(
        intensities: Vec<f64>,
        integration_time_ms: f64,
        captured_at: DateTime<Utc>,
        saturation_level: f64,
    ) -> Self {
        let saturated = intensities.iter().any(|&v| v >= saturation_level);
        Self {
            intensities,
            integration_time_ms,
            captured_at,
            saturated,
        }
    }
    pub fn len(&self) -> usize {
        self.intensities.len()
    }
    pub fn is_empty(&self) -> bool {
        self.intensities.is_empty()
    }
    pub fn peak_intensity(&self) -> f64 {
        self.intensities
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
            .max(0.0)
    }
}

/// Capture taken at the home position, used to remove the electronic offset
/// from every other capture of the same sweep.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DarkSpectrum(RawSpectrum);

impl DarkSpectrum {
    pub fn new(raw: RawSpectrum) -> Self {
        Self(raw)
    }
    pub fn as_raw(&self) -> &RawSpectrum {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepDirection {
    /// Decreases the scan angle.
    Forward,
    /// Increases the scan angle.
    Backward,
}

/// Something that can take a spectrum on demand.
pub trait SpectrumSource {
    fn capture(
        &mut self,
        integration_time_ms: f64,
        timeout: Duration,
    ) -> Result<RawSpectrum, HardwareFault>;
}

/// Stepper-driven scanner head with a home microswitch.
pub trait ScannerHead {
    fn step(&mut self, steps: u32, direction: StepDirection) -> Result<(), HardwareFault>;
    fn home_switch_triggered(&self) -> bool;
}

/// In-memory scanner useful for tests and deterministic playback. Captures are
/// served from a queue; the home switch is closed while the head sits
/// `steps_to_home` backward steps from where it started (never, when `None`).
#[cfg(test)]
pub struct ManualScanner {
    captures: VecDeque<Result<Vec<f64>, HardwareFault>>,
    steps_to_home: Option<u32>,
    position: i64,
    start: DateTime<Utc>,
    capture_count: i64,
}

#[cfg(test)]
impl ManualScanner {
    pub fn new(
        captures: impl IntoIterator<Item = Result<Vec<f64>, HardwareFault>>,
        steps_to_home: Option<u32>,
    ) -> Self {
        Self {
            captures: captures.into_iter().collect(),
            steps_to_home,
            position: 0,
            start: Utc::now(),
            capture_count: 0,
        }
    }
    /// Signed motor position relative to where the scanner started.
    pub fn position(&self) -> i64 {
        self.position
    }
}

#[cfg(test)]
impl SpectrumSource for ManualScanner {
    fn capture(
        &mut self,
        integration_time_ms: f64,
        timeout: Duration,
    ) -> Result<RawSpectrum, HardwareFault> {
        let next = self.captures.pop_front().unwrap_or(Err(HardwareFault::CaptureTimeout {
            timeout_ms: timeout.as_millis() as u64,
        }))?;
        self.capture_count += 1;
        let captured_at = self.start + chrono::Duration::seconds(self.capture_count);
        Ok(RawSpectrum::new(
            next,
            integration_time_ms,
            captured_at,
            DEFAULT_SATURATION_LEVEL,
        ))
    }
}

#[cfg(test)]
impl ScannerHead for ManualScanner {
    fn step(&mut self, steps: u32, direction: StepDirection) -> Result<(), HardwareFault> {
        match direction {
            StepDirection::Backward => self.position += steps as i64,
            StepDirection::Forward => self.position -= steps as i64,
        }
        Ok(())
    }
    fn home_switch_triggered(&self) -> bool {
        self.steps_to_home
            .is_some_and(|home| self.position == home as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturation_flag_follows_level() {
        let t = Utc::now();
        let ok = RawSpectrum::new(vec![10.0, 20.0], 50.0, t, 100.0);
        let sat = RawSpectrum::new(vec![10.0, 100.0], 50.0, t, 100.0);
        assert!(!ok.saturated);
        assert!(sat.saturated);
        assert_eq!(ok.peak_intensity(), 20.0);
    }

    #[test]
    fn manual_scanner_times_out_when_queue_is_empty() {
        let mut scanner = ManualScanner::new(vec![Ok(vec![1.0])], Some(0));
        assert!(scanner.capture(10.0, Duration::from_millis(5)).is_ok());
        let err = scanner.capture(10.0, Duration::from_millis(5)).unwrap_err();
        assert_eq!(err, HardwareFault::CaptureTimeout { timeout_ms: 5 });
    }
}
