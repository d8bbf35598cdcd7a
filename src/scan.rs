//! Scan acquisition state machine.
//!
//! One sweep runs `Idle -> Homing -> DarkCapture -> Sweeping -> Returning -> Idle`.
//! Any hardware fault moves the machine to `Aborted`; the next sweep resets it
//! to `Idle` before homing again.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::drivers::{
    DarkSpectrum, HardwareFault, RawSpectrum, ScanError, ScannerHead, SpectrumSource,
    StepDirection,
};
use crate::exposure::ExposureController;
use crate::model::StationId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Scan angles in sweep order, degrees from the horizon toward the scan azimuth.
    pub angles_deg: Vec<f64>,
    /// Angle of the head when the home switch is closed.
    pub home_angle_deg: f64,
    pub angle_per_step_deg: f64,
    pub max_steps_home: u32,
    pub capture_timeout_ms: u64,
    /// Spectra averaged into each capture.
    pub coadds: u32,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            angles_deg: SweepConfig::uniform_angles(10.0, 170.0, 3.6),
            home_angle_deg: -90.0,
            angle_per_step_deg: 1.8,
            max_steps_home: 1000,
            capture_timeout_ms: 5_000,
            coadds: 1,
        }
    }
}

impl SweepConfig {
    pub fn uniform_angles(start_deg: f64, stop_deg: f64, step_deg: f64) -> Vec<f64> {
        if step_deg <= 0.0 || stop_deg < start_deg {
            return vec![];
        }
        let n = ((stop_deg - start_deg) / step_deg + 1e-9).floor() as usize;
        (0..=n).map(|i| start_deg + i as f64 * step_deg).collect()
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    /// Motor position (steps from home) of every sweep angle.
    fn step_targets(&self) -> Result<Vec<u32>, ScanError> {
        if self.angle_per_step_deg <= 0.0 {
            return Err(ScanError::InvalidStepAngle);
        }
        if self.angles_deg.is_empty() {
            return Err(ScanError::EmptySweep);
        }
        let mut targets: Vec<u32> = Vec::with_capacity(self.angles_deg.len());
        for &angle in &self.angles_deg {
            let delta = (angle - self.home_angle_deg).rem_euclid(360.0);
            let steps = (delta / self.angle_per_step_deg).round() as u32;
            if targets.last().is_some_and(|&last| steps <= last) || steps == 0 {
                return Err(ScanError::NonMonotonicAngles { angle_deg: angle });
            }
            targets.push(steps);
        }
        Ok(targets)
    }
}

/// Wraps an angle into (-180, 180].
pub fn wrap_angle(angle_deg: f64) -> f64 {
    let wrapped = (angle_deg + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 {
        180.0
    } else {
        wrapped
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ScanState {
    Idle,
    Homing,
    DarkCapture,
    Sweeping { next_index: usize },
    Returning,
    Aborted(HardwareFault),
}

impl ScanState {
    pub fn name(&self) -> &'static str {
        match self {
            ScanState::Idle => "Idle",
            ScanState::Homing => "Homing",
            ScanState::DarkCapture => "DarkCapture",
            ScanState::Sweeping { .. } => "Sweeping",
            ScanState::Returning => "Returning",
            ScanState::Aborted(_) => "Aborted",
        }
    }

    fn can_transition_to(&self, next: &ScanState) -> bool {
        use ScanState::*;
        match (self, next) {
            (Idle, Homing) => true,
            (Homing, DarkCapture) => true,
            (DarkCapture, Sweeping { next_index: 0 }) => true,
            (Sweeping { next_index: a }, Sweeping { next_index: b }) => *b == a + 1,
            (Sweeping { .. }, Returning) => true,
            (Returning, Idle) => true,
            (Aborted(_), Idle) => true,
            (Idle, Aborted(_)) | (Aborted(_), Aborted(_)) => false,
            (_, Aborted(_)) => true,
            _ => false,
        }
    }
}

/// Spectrum captured at one sweep angle.
#[derive(Clone, Debug)]
pub struct SweepCapture {
    pub angle_deg: f64,
    pub spectrum: RawSpectrum,
}

/// Everything one sweep produced, pending retrieval.
#[derive(Clone, Debug)]
pub struct SweepRecord {
    pub station: StationId,
    pub sweep_number: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub dark: Option<DarkSpectrum>,
    pub captures: Vec<SweepCapture>,
    pub expected_points: usize,
    pub fault: Option<HardwareFault>,
}

pub struct ScanStateMachine<H> {
    station: StationId,
    hardware: H,
    config: SweepConfig,
    targets: Vec<u32>,
    state: ScanState,
    position_steps: u32,
    sweep_number: u64,
}

impl<H: ScannerHead + SpectrumSource> ScanStateMachine<H> {
    pub fn new(station: StationId, hardware: H, config: SweepConfig) -> Result<Self, ScanError> {
        let targets = config.step_targets()?;
        Ok(Self {
            station,
            hardware,
            config,
            targets,
            state: ScanState::Idle,
            position_steps: 0,
            sweep_number: 0,
        })
    }

    pub fn state(&self) -> &ScanState {
        &self.state
    }

    #[cfg(test)]
    pub fn sweep_number(&self) -> u64 {
        self.sweep_number
    }

    #[cfg(test)]
    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    /// Current head angle assuming the last homing succeeded.
    pub fn current_angle(&self) -> f64 {
        let steps = f64::from(self.position_steps);
        wrap_angle(self.config.home_angle_deg + steps * self.config.angle_per_step_deg)
    }

    /// Runs one complete sweep. Hardware faults end the sweep early and are
    /// carried in the returned record together with whatever was captured.
    ///
    /// The dark and every sweep capture share one integration time; the
    /// exposure controller sees the sweep's brightest capture once the head
    /// is back home.
    pub fn run_sweep(&mut self, exposure: &mut ExposureController) -> Result<SweepRecord, ScanError> {
        if matches!(self.state, ScanState::Aborted(_)) {
            self.reset()?;
        }
        let mut record = SweepRecord {
            station: self.station.clone(),
            sweep_number: self.sweep_number,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            dark: None,
            captures: Vec::with_capacity(self.targets.len()),
            expected_points: self.targets.len(),
            fault: None,
        };
        info!("[{}] begin sweep {}", self.station, self.sweep_number);

        self.transition(ScanState::Homing)?;
        if let Err(fault) = self.find_home() {
            return self.abort(record, fault);
        }

        self.transition(ScanState::DarkCapture)?;
        match self.capture(exposure.current_ms()) {
            Ok(dark) => {
                record.started_at = dark.captured_at;
                record.dark = Some(DarkSpectrum::new(dark));
            }
            Err(fault) => return self.abort(record, fault),
        }

        self.transition(ScanState::Sweeping { next_index: 0 })?;
        for index in 0..self.targets.len() {
            if index > 0 {
                self.transition(ScanState::Sweeping { next_index: index })?;
            }
            let target = self.targets[index];
            if let Err(fault) = self.move_to(target) {
                return self.abort(record, fault);
            }
            let spectrum = match self.capture(exposure.current_ms()) {
                Ok(s) => s,
                Err(fault) => return self.abort(record, fault),
            };
            record.ended_at = spectrum.captured_at;
            record.captures.push(SweepCapture {
                angle_deg: self.current_angle(),
                spectrum,
            });
        }

        self.transition(ScanState::Returning)?;
        if let Err(fault) = self.return_home() {
            return self.abort(record, fault);
        }
        self.transition(ScanState::Idle)?;
        let brightest = record
            .captures
            .iter()
            .map(|c| &c.spectrum)
            .max_by(|a, b| a.peak_intensity().total_cmp(&b.peak_intensity()));
        if let Some(spectrum) = brightest {
            exposure.update(spectrum);
        }
        info!(
            "[{}] sweep {} complete ({} spectra)",
            self.station,
            self.sweep_number,
            record.captures.len()
        );
        self.sweep_number += 1;
        Ok(record)
    }

    /// Clears an `Aborted` state so the next scheduled sweep can start.
    pub fn reset(&mut self) -> Result<(), ScanError> {
        if let ScanState::Aborted(fault) = &self.state {
            warn!("[{}] resetting after fault: {fault}", self.station);
        }
        self.transition(ScanState::Idle)
    }

    fn transition(&mut self, next: ScanState) -> Result<(), ScanError> {
        if !self.state.can_transition_to(&next) {
            return Err(ScanError::IllegalTransition {
                from: self.state.name(),
                to: next.name(),
            });
        }
        self.state = next;
        Ok(())
    }

    fn abort(&mut self, mut record: SweepRecord, fault: HardwareFault) -> Result<SweepRecord, ScanError> {
        error!(
            "[{}] sweep {} aborted in {}: {fault}",
            self.station,
            self.sweep_number,
            self.state.name()
        );
        self.transition(ScanState::Aborted(fault.clone()))?;
        if let Some(last) = record.captures.last() {
            record.ended_at = last.spectrum.captured_at;
        }
        record.fault = Some(fault);
        self.sweep_number += 1;
        Ok(record)
    }

    /// Steps backward until the home switch closes, within the step budget.
    fn find_home(&mut self) -> Result<(), HardwareFault> {
        let mut steps = 0u32;
        while !self.hardware.home_switch_triggered() {
            if steps >= self.config.max_steps_home {
                return Err(HardwareFault::HomingTimeout { steps });
            }
            self.hardware.step(1, StepDirection::Backward)?;
            steps += 1;
        }
        if steps > 0 {
            info!("[{}] steps to home: {steps}", self.station);
        }
        self.position_steps = 0;
        Ok(())
    }

    /// Steps back to home. `false` when the home switch is open there.
    fn return_home(&mut self) -> Result<bool, HardwareFault> {
        self.move_to(0)?;
        let closed = self.hardware.home_switch_triggered();
        if !closed {
            warn!(
                "[{}] home switch open after returning {} steps",
                self.station,
                self.targets.last().copied().unwrap_or(0)
            );
        }
        Ok(closed)
    }

    fn move_to(&mut self, target: u32) -> Result<(), HardwareFault> {
        if target > self.position_steps {
            self.hardware
                .step(target - self.position_steps, StepDirection::Backward)?;
        } else if target < self.position_steps {
            self.hardware
                .step(self.position_steps - target, StepDirection::Forward)?;
        }
        self.position_steps = target;
        Ok(())
    }

    /// Averages `coadds` consecutive spectra taken at the current position.
    fn capture(&mut self, integration_time_ms: f64) -> Result<RawSpectrum, HardwareFault> {
        let timeout = self.config.capture_timeout();
        let mut spectrum = self.hardware.capture(integration_time_ms, timeout)?;
        if self.config.coadds <= 1 {
            return Ok(spectrum);
        }
        for _ in 1..self.config.coadds {
            let next = self.hardware.capture(integration_time_ms, timeout)?;
            if next.len() != spectrum.len() {
                return Err(HardwareFault::Device(format!(
                    "co-added spectra differ in length ({} vs {})",
                    next.len(),
                    spectrum.len()
                )));
            }
            for (acc, v) in spectrum.intensities.iter_mut().zip(&next.intensities) {
                *acc += v;
            }
            spectrum.saturated |= next.saturated;
            spectrum.captured_at = next.captured_at;
        }
        let n = f64::from(self.config.coadds);
        spectrum.intensities.iter_mut().for_each(|v| *v /= n);
        Ok(spectrum)
    }
}
