// src/types.rs
use crate::drivers::HardwareFault;
use crate::model::{ScanProfile, StationId};

// Coordinator -> station worker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StationCommand {
    TriggerSweep,
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StationStatus {
    Idle,
    Sweeping,
    /// Last sweep aborted on a hardware fault.
    Faulted,
}

// Station worker -> coordinator
#[derive(Clone, Debug)]
pub enum StationMessage {
    Log { station: StationId, text: String },
    Status { station: StationId, status: StationStatus },
    Profile(Box<ScanProfile>),
    Fault { station: StationId, fault: HardwareFault },
    /// The worker cannot continue (bad configuration, illegal state).
    Stopped { station: StationId, reason: String },
}
