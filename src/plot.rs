use std::io::Cursor;

use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use plotters::prelude::*;
use thiserror::Error;

use crate::model::{FluxResult, ScanProfile};

#[derive(Debug, Error)]
pub enum PlotError {
    #[error("nothing to plot: {0}")]
    Empty(&'static str),
    #[error("plot error: {0}")]
    Draw(String),
}

impl<E: std::error::Error + Send + Sync + 'static> From<plotters::drawing::DrawingAreaErrorKind<E>>
    for PlotError
{
    fn from(value: plotters::drawing::DrawingAreaErrorKind<E>) -> Self {
        PlotError::Draw(format!("{value:?}"))
    }
}

impl From<image::ImageError> for PlotError {
    fn from(value: image::ImageError) -> Self {
        PlotError::Draw(value.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct PlotStyle {
    pub width: u32,
    pub height: u32,
    pub background: RGBColor,
    pub line: RGBColor,
    pub flagged: RGBColor,
}

impl Default for PlotStyle {
    fn default() -> Self {
        Self {
            width: 900,
            height: 400,
            background: RGBColor(10, 10, 10),
            line: CYAN,
            flagged: RED,
        }
    }
}

fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values.fold((0.0f64, 0.0f64), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if (hi - lo).abs() < f64::EPSILON {
        (lo - 1.0, hi + 1.0)
    } else {
        let pad = 0.05 * (hi - lo);
        (lo - pad, hi + pad)
    }
}

/// Column density against scan angle. Low-confidence points and missing
/// positions are marked in the `flagged` colour.
pub fn render_profile_png(
    profile: &ScanProfile,
    style: &PlotStyle,
) -> Result<Vec<u8>, PlotError> {
    if profile.points.is_empty() {
        return Err(PlotError::Empty("profile has no points"));
    }
    let (y_lo, y_hi) = bounds(profile.points.iter().map(|p| p.column_density));
    let all_angles = || {
        profile
            .angles()
            .chain(profile.missing.iter().map(|m| m.angle_deg))
    };
    let x_lo = all_angles().fold(f64::INFINITY, f64::min);
    let x_hi = all_angles().fold(f64::NEG_INFINITY, f64::max);
    let x_hi = if x_hi > x_lo { x_hi } else { x_lo + 1.0 };

    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let mut chart = ChartBuilder::on(&root)
            .margin(10)
            .build_cartesian_2d(x_lo..x_hi, y_lo..y_hi)?;
        chart.draw_series(LineSeries::new(
            [(x_lo, 0.0), (x_hi, 0.0)],
            &WHITE.mix(0.3),
        ))?;
        chart.draw_series(LineSeries::new(
            profile
                .points
                .iter()
                .filter(|p| !p.low_confidence)
                .map(|p| (p.angle_deg, p.column_density)),
            &style.line,
        ))?;
        chart.draw_series(
            profile
                .points
                .iter()
                .filter(|p| p.low_confidence)
                .map(|p| Circle::new((p.angle_deg, p.column_density), 3, style.flagged.filled())),
        )?;
        chart.draw_series(
            profile
                .missing
                .iter()
                .map(|m| Cross::new((m.angle_deg, 0.0), 4, &style.flagged)),
        )?;
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}

/// Flux history in kg/s, one point per result in arrival order.
pub fn render_flux_png(results: &[FluxResult], style: &PlotStyle) -> Result<Vec<u8>, PlotError> {
    if results.is_empty() {
        return Err(PlotError::Empty("no flux results"));
    }
    let (y_lo, y_hi) = bounds(results.iter().map(|r| r.flux_kg_s));
    let x_hi = (results.len().max(2) - 1) as f64;

    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let mut chart = ChartBuilder::on(&root)
            .margin(10)
            .build_cartesian_2d(0f64..x_hi, y_lo..y_hi)?;
        chart.draw_series(LineSeries::new(
            results.iter().enumerate().map(|(i, r)| (i as f64, r.flux_kg_s)),
            &style.line,
        ))?;
        chart.draw_series(results.iter().enumerate().map(|(i, r)| {
            let color = match r.quality {
                crate::model::FluxQuality::Good => style.line,
                crate::model::FluxQuality::LowConfidence => style.flagged,
            };
            Circle::new((i as f64, r.flux_kg_s), 3, color.filled())
        }))?;
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}

fn encode_png(buffer: &[u8], width: u32, height: u32) -> Result<Vec<u8>, PlotError> {
    let image = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, buffer.to_vec())
        .ok_or_else(|| PlotError::Draw("failed to allocate image buffer".into()))?;
    let mut output = Vec::new();
    DynamicImage::ImageRgb8(image).write_to(&mut Cursor::new(&mut output), ImageFormat::Png)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColumnDensityPoint, FitQuality, MissingPoint, ProfileStatus};
    use chrono::Utc;

    fn profile() -> ScanProfile {
        let t = Utc::now();
        let point = |angle_deg: f64, low_confidence: bool| ColumnDensityPoint {
            angle_deg,
            timestamp: t,
            column_density: 1.0e17 * (angle_deg / 90.0),
            column_density_err: 1.0e15,
            fit_quality: FitQuality {
                rms_residual: 1e-3,
                r_squared: 0.99,
            },
            low_confidence,
            peak_intensity: 20_000.0,
        };
        ScanProfile {
            station: "A".into(),
            sweep_number: 0,
            started_at: t,
            ended_at: t,
            scan_azimuth_deg: 90.0,
            dark: None,
            points: vec![point(10.0, false), point(20.0, true), point(40.0, false)],
            missing: vec![MissingPoint {
                angle_deg: 30.0,
                timestamp: t,
                reason: "saturated".into(),
            }],
            expected_points: 4,
            status: ProfileStatus::Complete,
        }
    }

    #[test]
    fn profile_plot_is_png() {
        let png = render_profile_png(&profile(), &PlotStyle::default()).unwrap();
        assert_eq!(&png[1..4], b"PNG");
    }

    #[test]
    fn empty_inputs_are_rejected() {
        let mut empty = profile();
        empty.points.clear();
        assert!(matches!(
            render_profile_png(&empty, &PlotStyle::default()),
            Err(PlotError::Empty(_))
        ));
        assert!(matches!(
            render_flux_png(&[], &PlotStyle::default()),
            Err(PlotError::Empty(_))
        ));
    }
}
