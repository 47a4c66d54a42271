//! Runtime configuration, loaded from a TOML file. Every field has a
//! default so running without a config file works.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub tracker: TrackerConfig,
    pub detection: DetectionConfig,
    /// What to do when feature store format validation finds problems.
    pub validation_policy: ValidationPolicy,
    /// Grid resolution used when building a new feature store. At analysis
    /// time the resolution always comes from the store's metadata instead.
    pub grid_resolution_meters: f64,
    /// Log an ingest progress line every this many reports.
    pub progress_interval: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            detection: DetectionConfig::default(),
            validation_policy: ValidationPolicy::Warn,
            grid_resolution_meters: 200.0,
            progress_interval: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// A track silent this long gets dead-reckoned interpolated samples.
    pub stale_after_secs: u64,
    /// A track silent this long is evicted.
    pub expire_after_secs: u64,
    /// How often the timeout sweep runs.
    pub sweep_interval_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 600,
            expire_after_secs: 1800,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Z-score above which a speed is considered abnormal for its cell.
    pub speed_z_threshold: f64,
    /// Minimum historical samples before a baseline is trusted.
    pub min_samples: u64,
    /// A (shipType, shipSize) bucket below this share of its cell's
    /// observations is considered unusual for the area.
    pub rare_quantile: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            speed_z_threshold: 3.0,
            min_samples: 10,
            rare_quantile: 0.01,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationPolicy {
    /// Log findings and continue with degraded confidence.
    Warn,
    /// Refuse to start if the feature store fails validation.
    Strict,
}

impl AppConfig {
    /// Load configuration from `path`, or defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("cannot read config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("invalid config file {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.tracker.stale_after_secs, 600);
        assert_eq!(cfg.validation_policy, ValidationPolicy::Warn);
    }

    #[test]
    fn test_partial_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aisguard.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "validation_policy = \"strict\"\n\n[detection]\nspeed_z_threshold = 4.5").unwrap();
        drop(f);

        let cfg = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.validation_policy, ValidationPolicy::Strict);
        assert_eq!(cfg.detection.speed_z_threshold, 4.5);
        // untouched sections keep defaults
        assert_eq!(cfg.tracker.expire_after_secs, 1800);
    }
}
