// src/engine.rs
use std::sync::mpsc::{Receiver, Sender};
use std::thread::{self, JoinHandle};

use log::{error, info};

use crate::drivers::{ScannerHead, SpectrumSource};
use crate::model::{IncompleteReason, ProfileStatus, StationId};
use crate::station::StationPipeline;
use crate::types::{StationCommand, StationMessage, StationStatus};

/// Runs a station on its own worker thread. Each `TriggerSweep` runs exactly
/// one sweep; sweeps never overlap. The worker exits on `Shutdown` or when
/// the command channel closes.
pub fn spawn_station<H>(
    station: StationId,
    mut pipeline: StationPipeline<H>,
    tx: Sender<StationMessage>,
    rx_cmd: Receiver<StationCommand>,
) -> JoinHandle<()>
where
    H: ScannerHead + SpectrumSource + Send + 'static,
{
    thread::spawn(move || {
        tx.send(StationMessage::Log {
            station: station.clone(),
            text: "station worker ready".to_owned(),
        })
        .ok();

        while let Ok(cmd) = rx_cmd.recv() {
            match cmd {
                StationCommand::TriggerSweep => {
                    tx.send(StationMessage::Status {
                        station: station.clone(),
                        status: StationStatus::Sweeping,
                    })
                    .ok();
                    let profile = match pipeline.run_cycle() {
                        Ok(profile) => profile,
                        Err(e) => {
                            error!("[{station}] worker stopping: {e}");
                            tx.send(StationMessage::Stopped {
                                station: station.clone(),
                                reason: e.to_string(),
                            })
                            .ok();
                            return;
                        }
                    };
                    let status = match &profile.status {
                        ProfileStatus::Incomplete(IncompleteReason::Aborted { fault }) => {
                            tx.send(StationMessage::Fault {
                                station: station.clone(),
                                fault: fault.clone(),
                            })
                            .ok();
                            StationStatus::Faulted
                        }
                        _ => StationStatus::Idle,
                    };
                    let peak = profile
                        .peak_point()
                        .map(|p| format!(", peak {:.2e} at {:.1}°", p.column_density, p.angle_deg))
                        .unwrap_or_default();
                    tx.send(StationMessage::Log {
                        station: station.clone(),
                        text: format!(
                            "sweep {} ({} s): {} points, {} missing{peak}",
                            profile.sweep_number,
                            profile.duration().num_seconds(),
                            profile.points.len(),
                            profile.missing.len()
                        ),
                    })
                    .ok();
                    if tx.send(StationMessage::Profile(Box::new(profile))).is_err() {
                        break;
                    }
                    tx.send(StationMessage::Status {
                        station: station.clone(),
                        status,
                    })
                    .ok();
                }
                StationCommand::Shutdown => break,
            }
        }
        info!("[{station}] worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{SimulationConfig, VirtualScanner};
    use crate::station::PipelineSettings;
    use chrono::Utc;
    use std::sync::mpsc;

    #[test]
    fn worker_runs_one_sweep_per_trigger() {
        let settings = PipelineSettings::default();
        let head = VirtualScanner::new(
            SimulationConfig::default(),
            settings.sweep.home_angle_deg,
            settings.sweep.angle_per_step_deg,
            Utc::now(),
        );
        let reference = head.reference(100.0);
        let pipeline = StationPipeline::new("A".into(), 90.0, head, settings, reference).unwrap();
        let (tx, rx) = mpsc::channel();
        let (tx_cmd, rx_cmd) = mpsc::channel();
        let handle = spawn_station("A".into(), pipeline, tx, rx_cmd);

        tx_cmd.send(StationCommand::TriggerSweep).unwrap();
        tx_cmd.send(StationCommand::TriggerSweep).unwrap();
        tx_cmd.send(StationCommand::Shutdown).unwrap();
        handle.join().unwrap();

        let sweeps: Vec<u64> = rx
            .try_iter()
            .filter_map(|m| match m {
                StationMessage::Profile(p) => Some(p.sweep_number),
                _ => None,
            })
            .collect();
        assert_eq!(sweeps, vec![0, 1]);
    }
}
