use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Faults reported by the scanner head or the spectrometer. Each one ends the
/// current sweep.
#[derive(Clone, Debug, PartialEq, Error, Serialize, Deserialize)]
pub enum HardwareFault {
    #[error("home switch did not trigger within {steps} steps")]
    HomingTimeout { steps: u32 },
    #[error("capture timed out after {timeout_ms} ms")]
    CaptureTimeout { timeout_ms: u64 },
    #[error("device error: {0}")]
    Device(String),
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Hardware(#[from] HardwareFault),
    #[error("illegal scan state transition: {from} -> {to}")]
    IllegalTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error("sweep has no configured angles")]
    EmptySweep,
    #[error("sweep angles must map to strictly increasing motor positions (angle {angle_deg})")]
    NonMonotonicAngles { angle_deg: f64 },
    #[error("angle per step must be greater than zero")]
    InvalidStepAngle,
}
