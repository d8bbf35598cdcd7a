//! Column density retrieval.
//!
//! The dark-corrected spectrum is turned into an optical depth against a
//! clear-sky reference, then the SO2 cross-section and a low-order wavelength
//! polynomial are fitted to it by linear least squares over the fit window.

use std::path::Path;

use anyhow::Context;
use nalgebra::{DMatrix, DVector};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::drivers::{DarkSpectrum, RawSpectrum, DEFAULT_SATURATION_LEVEL};
use crate::model::{ColumnDensityPoint, FitQuality};
use crate::scan::SweepCapture;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RetrievalFailure {
    #[error("spectrum length mismatch: reference has {expected} pixels, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("fit window contains {pixels} pixels, need at least {required}")]
    WindowTooNarrow { pixels: usize, required: usize },
    #[error("no signal in fit window")]
    NoSignal,
    #[error("{pixels} saturated pixels in fit window")]
    Saturated { pixels: usize },
    #[error("intensity too low (peak {peak:.0} counts)")]
    IntensityTooLow { peak: f64 },
    #[error("non-positive dark-corrected intensity in fit window")]
    NonPositiveSignal,
    #[error("reference spectrum is not positive inside the fit window")]
    InvalidReference,
    #[error("least-squares system is singular")]
    SingularFit,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Lower and upper wavelength of the fit window, nm.
    pub fit_window_nm: (f64, f64),
    /// Highest power of the background polynomial (0 keeps only an offset).
    pub background_order: usize,
    /// Multiplies the fitted scale factor to give molecules/cm^2.
    pub calibration: f64,
    /// Minimum peak dark-corrected counts in the window.
    pub min_intensity: f64,
    pub saturation_level: f64,
    /// Points whose RMS residual exceeds this are flagged low-confidence.
    pub max_rms_residual: f64,
    pub reference_path: Option<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            fit_window_nm: (310.0, 320.0),
            background_order: 2,
            calibration: 1.0,
            min_intensity: 3_000.0,
            saturation_level: DEFAULT_SATURATION_LEVEL,
            max_rms_residual: 0.01,
            reference_path: None,
        }
    }
}

/// Clear-sky spectrum and absorption cross-section on the spectrometer's
/// wavelength grid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceSpectrum {
    pub wavelengths_nm: Vec<f64>,
    /// Dark-corrected clear-sky intensities.
    pub clear_sky: Vec<f64>,
    pub clear_sky_integration_ms: f64,
    /// SO2 absorption cross-section, cm^2/molecule.
    pub cross_section: Vec<f64>,
}

impl ReferenceSpectrum {
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading reference spectrum {}", path.display()))?;
        let reference: Self = serde_json::from_str(&text).context("parsing reference spectrum")?;
        let n = reference.wavelengths_nm.len();
        anyhow::ensure!(
            reference.clear_sky.len() == n && reference.cross_section.len() == n,
            "reference spectrum arrays must all have {n} entries"
        );
        Ok(reference)
    }
    pub fn len(&self) -> usize {
        self.wavelengths_nm.len()
    }
}

pub struct RetrievalEngine {
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(config: RetrievalConfig) -> Self {
        Self { config }
    }

    /// Retrieves the column density of one sweep capture.
    pub fn retrieve(
        &self,
        capture: &SweepCapture,
        dark: &DarkSpectrum,
        reference: &ReferenceSpectrum,
    ) -> Result<ColumnDensityPoint, RetrievalFailure> {
        let raw = &capture.spectrum;
        let fit = self.fit_spectrum(raw, dark, reference)?;
        Ok(ColumnDensityPoint {
            angle_deg: capture.angle_deg,
            timestamp: raw.captured_at,
            column_density: fit.column_density,
            column_density_err: fit.column_density_err,
            fit_quality: fit.quality,
            low_confidence: !(fit.quality.rms_residual <= self.config.max_rms_residual),
            peak_intensity: fit.peak_intensity,
        })
    }

    fn window_indices(&self, reference: &ReferenceSpectrum) -> Vec<usize> {
        let (lo, hi) = self.config.fit_window_nm;
        reference
            .wavelengths_nm
            .iter()
            .enumerate()
            .filter(|(_, &wl)| wl >= lo && wl <= hi)
            .map(|(i, _)| i)
            .collect()
    }

    fn fit_spectrum(
        &self,
        raw: &RawSpectrum,
        dark: &DarkSpectrum,
        reference: &ReferenceSpectrum,
    ) -> Result<SpectrumFit, RetrievalFailure> {
        let n_pixels = reference.len();
        if raw.is_empty() {
            return Err(RetrievalFailure::NoSignal);
        }
        let lengths = [
            raw.len(),
            dark.as_raw().len(),
            reference.clear_sky.len(),
            reference.cross_section.len(),
        ];
        for len in lengths {
            if len != n_pixels {
                return Err(RetrievalFailure::LengthMismatch {
                    expected: n_pixels,
                    actual: len,
                });
            }
        }
        let n_params = self.config.background_order + 2;
        let idx = self.window_indices(reference);
        if idx.len() < n_params + 2 {
            return Err(RetrievalFailure::WindowTooNarrow {
                pixels: idx.len(),
                required: n_params + 2,
            });
        }

        let raw_w: Array1<f64> = idx.iter().map(|&i| raw.intensities[i]).collect();
        let saturated = raw_w
            .iter()
            .filter(|&&v| v >= self.config.saturation_level)
            .count();
        if saturated == raw_w.len() || (raw.saturated && saturated > 0) {
            return Err(RetrievalFailure::Saturated { pixels: saturated });
        }
        let dark_w: Array1<f64> = idx.iter().map(|&i| dark.as_raw().intensities[i]).collect();
        let signal = &raw_w - &dark_w;
        if raw_w.iter().all(|&v| v == 0.0) || signal.iter().all(|&v| v <= 0.0) {
            return Err(RetrievalFailure::NoSignal);
        }
        let peak = signal.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
        if peak < self.config.min_intensity {
            return Err(RetrievalFailure::IntensityTooLow { peak });
        }
        if signal.iter().any(|&v| v <= 0.0) {
            return Err(RetrievalFailure::NonPositiveSignal);
        }
        let clear: Array1<f64> = idx.iter().map(|&i| reference.clear_sky[i]).collect();
        if clear.iter().any(|&v| v <= 0.0) || reference.clear_sky_integration_ms <= 0.0 {
            return Err(RetrievalFailure::InvalidReference);
        }

        // Counts per millisecond so the integration time drops out of the ratio.
        let rate = &signal / raw.integration_time_ms.max(f64::MIN_POSITIVE);
        let clear_rate = &clear / reference.clear_sky_integration_ms;
        let tau: Array1<f64> = (&rate / &clear_rate).mapv(|r| -r.ln());

        let xsec: Array1<f64> = idx.iter().map(|&i| reference.cross_section[i]).collect();
        let xsec_scale = xsec.fold(0.0f64, |acc, &v| acc.max(v.abs()));
        if xsec_scale == 0.0 {
            return Err(RetrievalFailure::SingularFit);
        }
        let wl: Array1<f64> = idx.iter().map(|&i| reference.wavelengths_nm[i]).collect();
        let (lo, hi) = (wl[0], wl[wl.len() - 1]);
        let mid = 0.5 * (lo + hi);
        let half = (0.5 * (hi - lo)).max(f64::EPSILON);

        let rows = idx.len();
        let design = DMatrix::from_fn(rows, n_params, |row, col| {
            if col == 0 {
                xsec[row] / xsec_scale
            } else {
                ((wl[row] - mid) / half).powi(col as i32 - 1)
            }
        });
        let observed = DVector::from_iterator(rows, tau.iter().copied());
        let svd = design.clone().svd(true, true);
        let eps = svd.singular_values.max() * 1e-12;
        if svd.rank(eps) < n_params {
            return Err(RetrievalFailure::SingularFit);
        }
        let coeffs = svd
            .solve(&observed, eps)
            .map_err(|_| RetrievalFailure::SingularFit)?;
        let covariance = (design.transpose() * &design)
            .try_inverse()
            .ok_or(RetrievalFailure::SingularFit)?;
        let residual = &observed - &design * &coeffs;
        let rss = residual.norm_squared();
        let n = idx.len() as f64;
        let dof = (idx.len() - n_params) as f64;
        let tau_mean = observed.mean();
        let tss = observed.iter().map(|t| (t - tau_mean).powi(2)).sum::<f64>();
        let r_squared = if tss > 0.0 { 1.0 - rss / tss } else { 1.0 };
        let variance = rss / dof;

        let scale = self.config.calibration / xsec_scale;
        Ok(SpectrumFit {
            column_density: coeffs[0] * scale,
            column_density_err: (variance * covariance[(0, 0)]).max(0.0).sqrt() * scale.abs(),
            quality: FitQuality {
                rms_residual: (rss / n).sqrt(),
                r_squared,
            },
            peak_intensity: peak,
        })
    }
}

struct SpectrumFit {
    column_density: f64,
    column_density_err: f64,
    quality: FitQuality,
    peak_intensity: f64,
}
