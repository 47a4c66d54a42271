//! Grid-indexed statistical baseline -- the feature store.
//!
//! Historical vessel behaviour is summarized per grid cell and feature name.
//! Each [`FeatureData`] payload is self-describing: it declares what its key
//! dimensions mean so the analyzer can validate a store before trusting it.

pub mod repository;
pub mod validate;

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bump when the stored payload shape changes incompatibly.
pub const FORMAT_VERSION: i64 = 1;

/// Frequency of (shipType, shipSize) observations per cell.
pub const FEATURE_SHIP_TYPE_AND_SIZE: &str = "ShipTypeAndSizeFeature";
/// Speed-over-ground accumulators per cell, keyed by ship type.
pub const FEATURE_SPEED_OVER_GROUND: &str = "SpeedOverGroundFeature";

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("feature store {0} does not exist or is unreadable")]
    StoreUnreadable(PathBuf),
    #[error("feature store has no metadata record; not a valid feature store")]
    MissingMetadata,
    #[error("feature '{0}' has no data in any cell")]
    FeatureAbsent(String),
    #[error("store was built at {existing}m grid resolution, requested {requested}m; rebuild required")]
    ResolutionMismatch { existing: f64, requested: f64 },
    #[error("feature store was opened read-only")]
    ReadOnly,
}

/// Store-level metadata written once at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMetaData {
    pub format_version: i64,
    pub grid_resolution: f64,
    pub created_at: DateTime<Utc>,
}

/// Accumulators for one discrete key combination within one cell.
/// Mean and sample variance are derivable without keeping raw values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellStat {
    pub count: u64,
    pub sum: f64,
    pub sum_sq: f64,
}

impl CellStat {
    pub fn add_sample(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    /// Sample variance (n - 1 denominator).
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        let n = self.count as f64;
        ((self.sum_sq - self.sum * self.sum / n) / (n - 1.0)).max(0.0)
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Statistical record for one (cell, feature name) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureData {
    pub feature_name: String,
    /// Declared semantics of each key dimension, e.g. `["shipType", "shipSize"]`.
    pub key_meanings: Vec<String>,
    buckets: HashMap<String, CellStat>,
}

impl FeatureData {
    pub fn new(feature_name: &str, key_meanings: &[&str]) -> Self {
        Self {
            feature_name: feature_name.to_string(),
            key_meanings: key_meanings.iter().map(|k| k.to_string()).collect(),
            buckets: HashMap::new(),
        }
    }

    fn bucket_key(keys: &[u32]) -> String {
        keys.iter()
            .map(|k| k.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Fold one observation into the bucket for `keys`.
    pub fn fold(&mut self, keys: &[u32], value: f64) {
        debug_assert_eq!(keys.len(), self.key_meanings.len());
        self.buckets
            .entry(Self::bucket_key(keys))
            .or_default()
            .add_sample(value);
    }

    pub fn stat(&self, keys: &[u32]) -> Option<&CellStat> {
        self.buckets.get(&Self::bucket_key(keys))
    }

    /// Observations across all buckets of this cell.
    pub fn total_count(&self) -> u64 {
        self.buckets.values().map(|s| s.count).sum()
    }

    /// Merge accumulators from `other` into `self` (incremental store builds).
    pub fn merge(&mut self, other: &FeatureData) {
        for (key, stat) in &other.buckets {
            let own = self.buckets.entry(key.clone()).or_default();
            own.count += stat.count;
            own.sum += stat.sum;
            own.sum_sq += stat.sum_sq;
        }
    }
}

/// Map a ship length to its discrete size bucket (25m bands; unknown -> 0).
pub fn ship_size_bucket(length_meters: Option<f32>) -> u32 {
    match length_meters {
        Some(l) if l > 0.0 => (l / 25.0) as u32,
        _ => 0,
    }
}
