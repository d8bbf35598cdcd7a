//! Central loop state: pairs station profiles, keeps plume geometry current
//! and turns every complete profile into a flux result.

use std::collections::BTreeMap;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flux::{FluxConfig, FluxEngine, FluxError};
use crate::model::{
    FluxResult, FluxSource, GeometrySource, IncompleteReason, PlumeGeometry, ProfileStatus,
    ScanProfile, StationId,
};
use crate::triangulation::{GeometryFailure, StationSite, TriangulationConfig, TriangulationEngine};
use crate::wind::WindSource;

#[derive(Debug, Error, PartialEq)]
pub enum FusionError {
    #[error("profile from unregistered station {0}")]
    UnknownStation(StationId),
    #[error("station {0} registered twice")]
    DuplicateStation(StationId),
}

/// When plume geometry is re-derived from station pairs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GeometryPolicy {
    /// Never triangulate; always use the configured fixed geometry.
    Fixed,
    /// Triangulate every time a new pair of profiles forms.
    EveryCycle,
    /// Triangulate on the first pair and then every n-th pair.
    Periodic { every_n_cycles: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FixedGeometry {
    pub height_m: f64,
    pub distance_m: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub triangulation: TriangulationConfig,
    pub geometry_policy: GeometryPolicy,
    /// Compute flux for profiles that found no partner.
    pub single_station_flux: bool,
    /// Used before the first triangulation and whenever triangulation fails
    /// with no earlier result to fall back on.
    pub fixed_geometry: Option<FixedGeometry>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            triangulation: TriangulationConfig::default(),
            geometry_policy: GeometryPolicy::EveryCycle,
            single_station_flux: false,
            fixed_geometry: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FusionEvent {
    Flux(FluxResult),
    GeometryUpdated {
        pair: (StationId, StationId),
        height_m: f64,
    },
    GeometryFailure {
        pair: (StationId, StationId),
        failure: GeometryFailure,
    },
    ProfileExcluded {
        station: StationId,
        sweep_number: u64,
        reason: IncompleteReason,
    },
    NoPair {
        station: StationId,
    },
    NoGeometry {
        station: StationId,
        sweep_number: u64,
    },
    NoWind {
        station: StationId,
        sweep_number: u64,
    },
    FluxFailed {
        station: StationId,
        sweep_number: u64,
        error: FluxError,
    },
}

struct HeldProfile {
    profile: ScanProfile,
    paired: bool,
    fluxed: bool,
}

pub struct FusionCenter {
    config: FusionConfig,
    sites: BTreeMap<StationId, StationSite>,
    triangulation: TriangulationEngine,
    flux: FluxEngine,
    wind: WindSource,
    latest: BTreeMap<StationId, HeldProfile>,
    geometry: BTreeMap<StationId, PlumeGeometry>,
    pairs_formed: u64,
    results: Vec<FluxResult>,
}

impl FusionCenter {
    pub fn new(
        config: FusionConfig,
        flux: FluxConfig,
        sites: Vec<StationSite>,
        wind: WindSource,
    ) -> Result<Self, FusionError> {
        let mut by_id = BTreeMap::new();
        for site in sites {
            let id = site.id.clone();
            if by_id.insert(id.clone(), site).is_some() {
                return Err(FusionError::DuplicateStation(id));
            }
        }
        Ok(Self {
            triangulation: TriangulationEngine::new(config.triangulation.clone()),
            config,
            sites: by_id,
            flux: FluxEngine::new(flux),
            wind,
            latest: BTreeMap::new(),
            geometry: BTreeMap::new(),
            pairs_formed: 0,
            results: Vec::new(),
        })
    }

    /// Every flux computed so far, oldest first.
    pub fn results(&self) -> &[FluxResult] {
        &self.results
    }

    pub fn latest_flux(&self) -> Option<&FluxResult> {
        self.results.last()
    }

    pub fn geometry(&self, station: &str) -> Option<&PlumeGeometry> {
        self.geometry.get(station)
    }

    pub fn ingest(&mut self, profile: ScanProfile) -> Result<Vec<FusionEvent>, FusionError> {
        if !self.sites.contains_key(&profile.station) {
            return Err(FusionError::UnknownStation(profile.station));
        }
        let mut events = Vec::new();
        if let ProfileStatus::Incomplete(reason) = &profile.status {
            info!(
                "[fusion] excluding {} sweep {}: {reason:?}",
                profile.station, profile.sweep_number
            );
            events.push(FusionEvent::ProfileExcluded {
                station: profile.station.clone(),
                sweep_number: profile.sweep_number,
                reason: reason.clone(),
            });
            return Ok(events);
        }

        let station = profile.station.clone();
        self.latest.insert(
            station.clone(),
            HeldProfile {
                profile,
                paired: false,
                fluxed: false,
            },
        );

        if self.config.geometry_policy == GeometryPolicy::Fixed {
            self.flux_for(&station, FluxSource::Station(station.clone()), &mut events);
            return Ok(events);
        }

        match self.find_partner(&station) {
            Some(partner) => {
                self.pairs_formed += 1;
                for id in [&partner, &station] {
                    if let Some(held) = self.latest.get_mut(id) {
                        held.paired = true;
                    }
                }
                if self.should_triangulate(&partner, &station) {
                    self.update_geometry(&partner, &station, &mut events);
                }
                let source = FluxSource::Pair(partner.clone(), station.clone());
                self.flux_for(&partner, source.clone(), &mut events);
                self.flux_for(&station, source, &mut events);
            }
            None => {
                debug!("[fusion] no partner for {station}");
                events.push(FusionEvent::NoPair {
                    station: station.clone(),
                });
                if self.config.single_station_flux {
                    self.flux_for(&station, FluxSource::Station(station.clone()), &mut events);
                }
            }
        }
        Ok(events)
    }

    /// Unpaired latest profile of another station whose sweep overlaps
    /// `station`'s, closest in time.
    fn find_partner(&self, station: &str) -> Option<StationId> {
        let own = &self.latest.get(station)?.profile;
        self.latest
            .iter()
            .filter(|(id, held)| {
                id.as_str() != station
                    && !held.paired
                    && self.triangulation.windows_overlap(own, &held.profile)
            })
            .min_by_key(|(_, held)| (held.profile.midpoint() - own.midpoint()).abs())
            .map(|(id, _)| id.clone())
    }

    fn should_triangulate(&self, a: &str, b: &str) -> bool {
        match self.config.geometry_policy {
            GeometryPolicy::Fixed => false,
            GeometryPolicy::EveryCycle => true,
            GeometryPolicy::Periodic { every_n_cycles } => {
                let derived = |id: &str| {
                    self.geometry.get(id).is_some_and(|g| {
                        matches!(g.source, GeometrySource::Triangulated { .. })
                    })
                };
                !(derived(a) && derived(b))
                    || (self.pairs_formed - 1) % u64::from(every_n_cycles.max(1)) == 0
            }
        }
    }

    fn update_geometry(&mut self, a: &str, b: &str, events: &mut Vec<FusionEvent>) {
        let pair = (a.to_string(), b.to_string());
        let (Some(site_a), Some(site_b), Some(held_a), Some(held_b)) = (
            self.sites.get(a),
            self.sites.get(b),
            self.latest.get(a),
            self.latest.get(b),
        ) else {
            return;
        };
        match self
            .triangulation
            .triangulate((site_a, &held_a.profile), (site_b, &held_b.profile))
        {
            Ok(solution) => {
                info!(
                    "[fusion] {a}+{b}: plume at {:.0} m, {:.0} m from {a}",
                    solution.first.height_m, solution.first.distance_m
                );
                events.push(FusionEvent::GeometryUpdated {
                    pair,
                    height_m: solution.first.height_m,
                });
                self.geometry.insert(a.to_string(), solution.first);
                self.geometry.insert(b.to_string(), solution.second);
            }
            Err(failure) => {
                warn!("[fusion] {a}+{b}: {failure}; keeping previous geometry");
                events.push(FusionEvent::GeometryFailure { pair, failure });
            }
        }
    }

    fn fallback_geometry(&self, station: &str) -> Option<PlumeGeometry> {
        if let Some(geometry) = self.geometry.get(station) {
            return Some(geometry.clone());
        }
        let fixed = self.config.fixed_geometry?;
        let site = self.sites.get(station)?;
        Some(PlumeGeometry::fixed(
            fixed.height_m,
            fixed.distance_m,
            site.scan_azimuth_deg,
        ))
    }

    fn flux_for(&mut self, station: &str, source: FluxSource, events: &mut Vec<FusionEvent>) {
        let Some(held) = self.latest.get(station) else {
            return;
        };
        if held.fluxed {
            return;
        }
        let profile = &held.profile;
        let sweep_number = profile.sweep_number;
        let geometry = if self.config.geometry_policy == GeometryPolicy::Fixed {
            self.config.fixed_geometry.and_then(|fixed| {
                let site = self.sites.get(station)?;
                Some(PlumeGeometry::fixed(fixed.height_m, fixed.distance_m, site.scan_azimuth_deg))
            })
        } else {
            self.fallback_geometry(station)
        };
        let Some(geometry) = geometry else {
            warn!("[fusion] no plume geometry for {station} sweep {sweep_number}");
            events.push(FusionEvent::NoGeometry {
                station: station.to_string(),
                sweep_number,
            });
            return;
        };
        let Some(wind) = self.wind.lookup(profile.midpoint()) else {
            warn!("[fusion] no wind for {station} sweep {sweep_number}");
            events.push(FusionEvent::NoWind {
                station: station.to_string(),
                sweep_number,
            });
            return;
        };
        match self.flux.compute_flux(profile, &geometry, wind, source) {
            Ok(result) => {
                info!(
                    "[fusion] {} sweep {}: {:.3} kg/s ({:.1} t/day, {:?})",
                    result.source,
                    sweep_number,
                    result.flux_kg_s,
                    result.tonnes_per_day(),
                    result.quality
                );
                if let Some(held) = self.latest.get_mut(station) {
                    held.fluxed = true;
                }
                self.results.push(result.clone());
                events.push(FusionEvent::Flux(result));
            }
            Err(error) => {
                warn!("[fusion] flux failed for {station} sweep {sweep_number}: {error}");
                events.push(FusionEvent::FluxFailed {
                    station: station.to_string(),
                    sweep_number,
                    error,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::HardwareFault;
    use crate::model::{ColumnDensityPoint, FitQuality, WindVector};
    use approx::assert_relative_eq;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    const EARTH_RADIUS_M: f64 = 6_371_000.0;

    fn sites(baseline_m: f64) -> Vec<StationSite> {
        let dlon = (baseline_m / EARTH_RADIUS_M).to_degrees();
        let site = |id: &str, lon: f64| StationSite {
            id: id.into(),
            latitude_deg: 0.0,
            longitude_deg: lon,
            altitude_m: 0.0,
            scan_azimuth_deg: 90.0,
        };
        vec![site("A", 0.0), site("B", dlon)]
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    /// Gaussian plume on a 5..175° grid with 2.5° steps.
    fn profile(
        station: &str,
        sweep: u64,
        peak_angle: f64,
        peak_cd: f64,
        start: DateTime<Utc>,
    ) -> ScanProfile {
        let points: Vec<ColumnDensityPoint> = (0..=68)
            .map(|i| {
                let angle = 5.0 + i as f64 * 2.5;
                let cd = peak_cd * (-0.5 * ((angle - peak_angle) / 8.0).powi(2)).exp();
                ColumnDensityPoint {
                    angle_deg: angle,
                    timestamp: start + Duration::seconds(i),
                    column_density: cd,
                    column_density_err: 0.05 * cd,
                    fit_quality: FitQuality {
                        rms_residual: 1e-3,
                        r_squared: 0.99,
                    },
                    low_confidence: false,
                    peak_intensity: 20_000.0,
                }
            })
            .collect();
        ScanProfile {
            station: station.into(),
            sweep_number: sweep,
            started_at: start,
            ended_at: start + Duration::seconds(70),
            scan_azimuth_deg: 90.0,
            dark: None,
            expected_points: points.len(),
            points,
            missing: vec![],
            status: ProfileStatus::Complete,
        }
    }

    fn perpendicular_wind() -> WindSource {
        WindSource::Fixed(WindVector {
            speed_ms: 5.0,
            bearing_deg: 0.0,
        })
    }

    fn center(config: FusionConfig) -> FusionCenter {
        FusionCenter::new(config, FluxConfig::default(), sites(1_000.0), perpendicular_wind()).unwrap()
    }

    fn fluxes(events: &[FusionEvent]) -> Vec<&FluxResult> {
        events
            .iter()
            .filter_map(|e| match e {
                FusionEvent::Flux(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn two_station_plume_gives_consistent_height_and_flux() {
        let mut fusion = center(FusionConfig::default());
        let first = fusion.ingest(profile("A", 1, 45.0, 5.0e17, t0())).unwrap();
        assert_eq!(first, vec![FusionEvent::NoPair { station: "A".into() }]);

        let events = fusion
            .ingest(profile("B", 1, 135.0, 5.0e17, t0() + Duration::seconds(5)))
            .unwrap();
        let updated = events.iter().find_map(|e| match e {
            FusionEvent::GeometryUpdated { height_m, .. } => Some(*height_m),
            _ => None,
        });
        assert_relative_eq!(updated.unwrap(), 500.0, max_relative = 1e-6);

        let a = fusion.geometry("A").unwrap();
        let b = fusion.geometry("B").unwrap();
        assert_relative_eq!(a.height_m, 500.0, max_relative = 1e-6);
        assert_relative_eq!(b.height_m, a.height_m, max_relative = 1e-9);
        assert_relative_eq!(a.distance_m, 500.0, max_relative = 1e-6);
        assert!(matches!(a.source, GeometrySource::Triangulated { .. }));

        let results = fluxes(&events);
        assert_eq!(results.len(), 2);
        for r in &results {
            assert!(r.flux_kg_s.is_finite() && r.flux_kg_s > 0.0);
            assert_eq!(r.source, FluxSource::Pair("A".into(), "B".into()));
        }
        // Same plume seen from both ends of the baseline.
        assert_relative_eq!(results[0].flux_kg_s, results[1].flux_kg_s, max_relative = 1e-6);
        assert_eq!(fusion.results().len(), 2);
        assert_eq!(fusion.latest_flux().unwrap().station, "B");
    }

    #[test]
    fn zero_profiles_give_zero_flux_with_fixed_geometry() {
        let mut fusion = center(FusionConfig {
            geometry_policy: GeometryPolicy::Fixed,
            fixed_geometry: Some(FixedGeometry {
                height_m: 800.0,
                distance_m: 300.0,
            }),
            ..FusionConfig::default()
        });
        let events = fusion.ingest(profile("A", 1, 45.0, 0.0, t0())).unwrap();
        let results = fluxes(&events);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].flux_kg_s, 0.0);
        assert_eq!(results[0].geometry.source, GeometrySource::Fixed);
    }

    #[test]
    fn failed_triangulation_falls_back_to_fixed_geometry() {
        let mut fusion = center(FusionConfig {
            fixed_geometry: Some(FixedGeometry {
                height_m: 700.0,
                distance_m: 0.0,
            }),
            ..FusionConfig::default()
        });
        fusion.ingest(profile("A", 1, 45.0, 5.0e17, t0())).unwrap();
        // Parallel rays: both stations see the plume at 45°.
        let events = fusion.ingest(profile("B", 1, 45.0, 5.0e17, t0())).unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            FusionEvent::GeometryFailure {
                failure: GeometryFailure::NearParallel { .. },
                ..
            }
        )));
        let results = fluxes(&events);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.geometry.height_m == 700.0));
    }

    #[test]
    fn failed_triangulation_reuses_last_triangulated_geometry() {
        let mut fusion = center(FusionConfig {
            fixed_geometry: Some(FixedGeometry {
                height_m: 700.0,
                distance_m: 0.0,
            }),
            ..FusionConfig::default()
        });
        fusion.ingest(profile("A", 1, 45.0, 5.0e17, t0())).unwrap();
        fusion.ingest(profile("B", 1, 135.0, 5.0e17, t0())).unwrap();
        let derived = fusion.geometry("A").unwrap().clone();
        assert!(matches!(derived.source, GeometrySource::Triangulated { .. }));

        let later = t0() + Duration::minutes(10);
        fusion.ingest(profile("A", 2, 45.0, 5.0e17, later)).unwrap();
        let events = fusion.ingest(profile("B", 2, 45.0, 5.0e17, later)).unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            FusionEvent::GeometryFailure {
                failure: GeometryFailure::NearParallel { .. },
                ..
            }
        )));
        let results = fluxes(&events);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].station, "A");
        assert_eq!(results[0].geometry, derived);
        assert_relative_eq!(results[0].geometry.height_m, 500.0, max_relative = 1e-6);
        assert!(results.iter().all(|r| r.geometry.height_m != 700.0));
        assert_eq!(fusion.geometry("A"), Some(&derived));
    }

    #[test]
    fn failed_triangulation_without_fallback_reports_no_geometry() {
        let mut fusion = center(FusionConfig::default());
        fusion.ingest(profile("A", 1, 45.0, 5.0e17, t0())).unwrap();
        let events = fusion.ingest(profile("B", 1, 135.0, 5.0e17, t0() + Duration::hours(1))).unwrap();
        assert_eq!(events, vec![FusionEvent::NoPair { station: "B".into() }]);

        let events = fusion.ingest(profile("A", 2, 135.0, 5.0e17, t0() + Duration::hours(1))).unwrap();
        assert!(events.iter().any(|e| matches!(e, FusionEvent::GeometryFailure { .. })));
        assert!(events.iter().any(|e| matches!(e, FusionEvent::NoGeometry { .. })));
        assert!(fusion.results().is_empty());
    }

    #[test]
    fn incomplete_profiles_are_excluded() {
        let mut fusion = center(FusionConfig {
            single_station_flux: true,
            fixed_geometry: Some(FixedGeometry {
                height_m: 500.0,
                distance_m: 500.0,
            }),
            ..FusionConfig::default()
        });
        let mut p = profile("A", 4, 45.0, 5.0e17, t0());
        p.status = ProfileStatus::Incomplete(IncompleteReason::Aborted {
            fault: HardwareFault::CaptureTimeout { timeout_ms: 5000 },
        });
        let events = fusion.ingest(p).unwrap();
        assert!(matches!(events.as_slice(), [FusionEvent::ProfileExcluded { sweep_number: 4, .. }]));
        assert!(fusion.results().is_empty());

        // An excluded profile is never paired.
        let events = fusion.ingest(profile("B", 4, 135.0, 5.0e17, t0())).unwrap();
        assert!(events.contains(&FusionEvent::NoPair { station: "B".into() }));
        assert_eq!(fluxes(&events)[0].source, FluxSource::Station("B".into()));
    }

    #[test]
    fn single_station_flux_is_not_recomputed_when_paired() {
        let mut fusion = center(FusionConfig {
            single_station_flux: true,
            fixed_geometry: Some(FixedGeometry {
                height_m: 500.0,
                distance_m: 500.0,
            }),
            ..FusionConfig::default()
        });
        let events = fusion.ingest(profile("A", 1, 45.0, 5.0e17, t0())).unwrap();
        assert_eq!(fluxes(&events).len(), 1);
        let events = fusion.ingest(profile("B", 1, 135.0, 5.0e17, t0())).unwrap();
        let results = fluxes(&events);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].station, "B");
        assert_eq!(fusion.results().len(), 2);
    }

    #[test]
    fn periodic_policy_reuses_geometry_between_updates() {
        let mut fusion = center(FusionConfig {
            geometry_policy: GeometryPolicy::Periodic { every_n_cycles: 3 },
            ..FusionConfig::default()
        });
        let mut updates = 0;
        for cycle in 0..6u64 {
            let start = t0() + Duration::minutes(10 * cycle as i64);
            fusion.ingest(profile("A", cycle, 45.0, 5.0e17, start)).unwrap();
            let events = fusion.ingest(profile("B", cycle, 135.0, 5.0e17, start)).unwrap();
            updates += events
                .iter()
                .filter(|e| matches!(e, FusionEvent::GeometryUpdated { .. }))
                .count();
            assert_eq!(fluxes(&events).len(), 2);
        }
        // Pairs 1 and 4.
        assert_eq!(updates, 2);
    }

    #[test]
    fn unknown_station_is_an_error() {
        let mut fusion = center(FusionConfig::default());
        assert_eq!(
            fusion.ingest(profile("Z", 1, 45.0, 5.0e17, t0())),
            Err(FusionError::UnknownStation("Z".into()))
        );
        let duplicate = FusionCenter::new(
            FusionConfig::default(),
            FluxConfig::default(),
            [sites(10.0), sites(10.0)].concat(),
            perpendicular_wind(),
        );
        assert!(matches!(duplicate, Err(FusionError::DuplicateStation(_))));
    }
}
