use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::model::WindVector;

/// One row of a wind feed.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindSample {
    pub timestamp: DateTime<Utc>,
    pub speed_ms: f64,
    pub bearing_deg: f64,
}

impl WindSample {
    pub fn vector(&self) -> WindVector {
        WindVector {
            speed_ms: self.speed_ms,
            bearing_deg: self.bearing_deg,
        }
    }
}

/// Time-indexed wind observations, sorted by timestamp.
#[derive(Clone, Debug, Default)]
pub struct WindFeed {
    samples: Vec<WindSample>,
}

impl WindFeed {
    pub fn from_samples(mut samples: Vec<WindSample>) -> Self {
        samples.sort_by_key(|s| s.timestamp);
        Self { samples }
    }

    /// Reads a `timestamp,speed_ms,bearing_deg` CSV file with RFC 3339 timestamps.
    pub fn from_csv_path(path: &Path) -> anyhow::Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("opening wind feed {}", path.display()))?;
        let samples = reader
            .deserialize()
            .collect::<Result<Vec<WindSample>, _>>()
            .context("parsing wind feed")?;
        Ok(Self::from_samples(samples))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Sample closest in time to `at`.
    pub fn nearest(&self, at: DateTime<Utc>) -> Option<&WindSample> {
        let idx = self.samples.partition_point(|s| s.timestamp < at);
        let after = self.samples.get(idx);
        let before = idx.checked_sub(1).and_then(|i| self.samples.get(i));
        match (before, after) {
            (Some(b), Some(a)) => {
                if at - b.timestamp <= a.timestamp - at {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (b, a) => b.or(a),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WindConfig {
    Fixed {
        speed_ms: f64,
        bearing_deg: f64,
    },
    Feed {
        path: String,
        /// Feed samples further than this from the scan are ignored.
        max_age_s: f64,
        fallback: Option<WindVector>,
    },
}

impl Default for WindConfig {
    fn default() -> Self {
        WindConfig::Fixed {
            speed_ms: 5.0,
            bearing_deg: 0.0,
        }
    }
}

pub enum WindSource {
    Fixed(WindVector),
    Feed {
        feed: WindFeed,
        max_age: Duration,
        fallback: Option<WindVector>,
    },
}

impl WindSource {
    pub fn from_config(config: &WindConfig) -> anyhow::Result<Self> {
        Ok(match config {
            WindConfig::Fixed {
                speed_ms,
                bearing_deg,
            } => WindSource::Fixed(WindVector {
                speed_ms: *speed_ms,
                bearing_deg: *bearing_deg,
            }),
            WindConfig::Feed {
                path,
                max_age_s,
                fallback,
            } => {
                let feed = WindFeed::from_csv_path(Path::new(path))?;
                info!("wind feed {path}: {} samples", feed.len());
                WindSource::Feed {
                    feed,
                    max_age: Duration::milliseconds((max_age_s * 1_000.0) as i64),
                    fallback: *fallback,
                }
            }
        })
    }

    /// Wind to use for a scan taken at `at`.
    pub fn lookup(&self, at: DateTime<Utc>) -> Option<WindVector> {
        match self {
            WindSource::Fixed(wind) => Some(*wind),
            WindSource::Feed {
                feed,
                max_age,
                fallback,
            } => feed
                .nearest(at)
                .filter(|s| (at - s.timestamp).abs() <= *max_age)
                .map(WindSample::vector)
                .or(*fallback),
        }
    }
}
