// src/main.rs
mod assembler;
mod config;
mod drivers;
mod engine;
mod exposure;
mod flux;
mod fusion;
mod model;
mod plot;
mod recorder;
mod retrieval;
mod scan;
mod station;
mod triangulation;
mod types;
mod wind;

use std::path::Path;
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

use anyhow::Context;
use chrono::Utc;
use log::{debug, error, info, warn};

use crate::config::NetworkConfig;
use crate::drivers::VirtualScanner;
use crate::engine::spawn_station;
use crate::fusion::{FusionCenter, FusionEvent};
use crate::model::{ScanProfile, StationId};
use crate::recorder::ResultsRecorder;
use crate::retrieval::ReferenceSpectrum;
use crate::station::StationPipeline;
use crate::types::{StationCommand, StationMessage};
use crate::wind::WindSource;

struct Worker {
    station: StationId,
    commands: Sender<StationCommand>,
    handle: JoinHandle<()>,
    active: bool,
}

/// Records one profile and feeds it to fusion. Recording failures are logged
/// and never hold up fusion.
fn process_profile(
    recorder: &ResultsRecorder,
    fusion: &mut FusionCenter,
    profile: ScanProfile,
) -> Vec<FusionEvent> {
    if let Err(e) = recorder.record_profile(&profile) {
        error!(
            "[{}] could not record sweep {}: {e:#}",
            profile.station, profile.sweep_number
        );
    }
    let events = match fusion.ingest(profile) {
        Ok(events) => events,
        Err(e) => {
            error!("[fusion] {e}");
            return Vec::new();
        }
    };
    for event in &events {
        if let FusionEvent::Flux(result) = event {
            if let Err(e) = recorder.record_flux(result) {
                error!("[{}] could not record flux: {e:#}", result.station);
            }
        }
    }
    events
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => NetworkConfig::load(Path::new(&path))?,
        None => {
            let config = NetworkConfig::default();
            config.validate()?;
            config
        }
    };
    let recorder = ResultsRecorder::new(&config.output_dir, true)?;
    let wind = WindSource::from_config(&config.wind)?;
    let mut fusion = FusionCenter::new(
        config.fusion.clone(),
        config.flux.clone(),
        config.sites(),
        wind,
    )?;

    let epoch = Utc::now();
    let (tx, rx) = mpsc::channel();
    let mut workers = Vec::with_capacity(config.stations.len());
    for station in &config.stations {
        let head = VirtualScanner::new(
            station.simulation.clone(),
            config.sweep.home_angle_deg,
            config.sweep.angle_per_step_deg,
            epoch,
        );
        let reference = match &config.retrieval.reference_path {
            Some(path) => ReferenceSpectrum::from_json_file(Path::new(path))?,
            None => head.reference(config.reference_integration_ms),
        };
        let id = station.site.id.clone();
        let pipeline = StationPipeline::new(
            id.clone(),
            station.site.scan_azimuth_deg,
            head,
            config.pipeline_settings(),
            reference,
        )
        .with_context(|| format!("setting up station {id}"))?;
        let (tx_cmd, rx_cmd) = mpsc::channel();
        workers.push(Worker {
            handle: spawn_station(id.clone(), pipeline, tx.clone(), rx_cmd),
            station: id,
            commands: tx_cmd,
            active: true,
        });
    }
    drop(tx);
    info!(
        "{} stations up, running {} cycles",
        workers.len(),
        config.cycles
    );

    for cycle in 0..config.cycles {
        let mut pending = 0;
        for worker in workers.iter().filter(|w| w.active) {
            if worker.commands.send(StationCommand::TriggerSweep).is_ok() {
                pending += 1;
            }
        }
        debug!("cycle {cycle}: waiting for {pending} profiles");
        while pending > 0 {
            let Ok(message) = rx.recv() else {
                break;
            };
            match message {
                StationMessage::Log { station, text } => info!("[{station}] {text}"),
                StationMessage::Status { station, status } => debug!("[{station}] {status:?}"),
                StationMessage::Fault { station, fault } => warn!("[{station}] sweep aborted: {fault}"),
                StationMessage::Profile(profile) => {
                    pending -= 1;
                    process_profile(&recorder, &mut fusion, *profile);
                }
                StationMessage::Stopped { station, reason } => {
                    error!("[{station}] stopped: {reason}");
                    pending -= 1;
                    if let Some(worker) = workers.iter_mut().find(|w| w.station == station) {
                        worker.active = false;
                    }
                }
            }
        }
    }

    for worker in &workers {
        worker.commands.send(StationCommand::Shutdown).ok();
    }
    for worker in workers {
        if worker.handle.join().is_err() {
            error!("[{}] worker panicked", worker.station);
        }
    }

    if let Err(e) = recorder.record_flux_history(fusion.results()) {
        error!("could not record flux history: {e:#}");
    }
    match fusion.latest_flux() {
        Some(latest) => info!(
            "{} flux results in {}; latest {}: {:.2} kg/s ({:.1} t/day)",
            fusion.results().len(),
            recorder.dir().display(),
            latest.source,
            latest.flux_kg_s,
            latest.tonnes_per_day()
        ),
        None => warn!("no flux computed"),
    }
    Ok(())
}
