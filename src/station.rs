use log::debug;

use crate::assembler::{AssemblerConfig, ScanAssembler};
use crate::drivers::{ScanError, ScannerHead, SpectrumSource};
use crate::exposure::{ExposureConfig, ExposureController};
use crate::model::{MissingPoint, ScanProfile, StationId};
use crate::retrieval::{ReferenceSpectrum, RetrievalConfig, RetrievalEngine};
use crate::scan::{ScanState, ScanStateMachine, SweepConfig};

/// Per-station processing settings shared by every station of a network.
#[derive(Clone, Debug, Default)]
pub struct PipelineSettings {
    pub sweep: SweepConfig,
    pub exposure: ExposureConfig,
    pub retrieval: RetrievalConfig,
    pub assembler: AssemblerConfig,
}

/// One station's chain from scanner hardware to finished [`ScanProfile`]s.
pub struct StationPipeline<H> {
    scanner: ScanStateMachine<H>,
    exposure: ExposureController,
    retrieval: RetrievalEngine,
    reference: ReferenceSpectrum,
    assembler: ScanAssembler,
}

impl<H: ScannerHead + SpectrumSource> StationPipeline<H> {
    pub fn new(
        station: StationId,
        scan_azimuth_deg: f64,
        hardware: H,
        settings: PipelineSettings,
        reference: ReferenceSpectrum,
    ) -> Result<Self, ScanError> {
        Ok(Self {
            assembler: ScanAssembler::new(settings.assembler, station.clone(), scan_azimuth_deg),
            scanner: ScanStateMachine::new(station, hardware, settings.sweep)?,
            exposure: ExposureController::new(settings.exposure),
            retrieval: RetrievalEngine::new(settings.retrieval),
            reference,
        })
    }

    pub fn state(&self) -> &ScanState {
        self.scanner.state()
    }

    /// Runs one sweep and retrieves every capture. Captures that fail
    /// retrieval become missing points of the profile.
    pub fn run_cycle(&mut self) -> Result<ScanProfile, ScanError> {
        let record = self.scanner.run_sweep(&mut self.exposure)?;
        self.assembler.begin(record.sweep_number, record.expected_points);
        if let Some(dark) = &record.dark {
            for capture in &record.captures {
                match self.retrieval.retrieve(capture, dark, &self.reference) {
                    Ok(point) => {
                        self.assembler.push_point(point);
                    }
                    Err(failure) => {
                        debug!(
                            "[{}] {:.1}°: {failure}",
                            record.station, capture.angle_deg
                        );
                        self.assembler.push_missing(MissingPoint {
                            angle_deg: capture.angle_deg,
                            timestamp: capture.spectrum.captured_at,
                            reason: failure.to_string(),
                        });
                    }
                }
            }
        }
        Ok(self.assembler.finish(&record, record.dark.clone()))
    }
}
