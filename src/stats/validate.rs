//! Feature store format validation.
//!
//! Run once at startup by the consuming application, not by the repository:
//! the store must contain every feature the analyses depend on, and each
//! feature's declared key meanings must match what the analyses expect.
//! Findings are non-fatal under the default `warn` policy; `strict` refuses
//! to start.

use anyhow::Result;
use tracing::{info, warn};

use crate::config::ValidationPolicy;
use crate::stats::repository::FeatureDataRepository;
use crate::stats::{FEATURE_SHIP_TYPE_AND_SIZE, FEATURE_SPEED_OVER_GROUND};

pub struct ExpectedFeature {
    pub name: &'static str,
    pub key_meanings: &'static [&'static str],
}

/// Features the bundled analyses require.
pub const EXPECTED_FEATURES: &[ExpectedFeature] = &[
    ExpectedFeature {
        name: FEATURE_SHIP_TYPE_AND_SIZE,
        key_meanings: &["shipType", "shipSize"],
    },
    ExpectedFeature {
        name: FEATURE_SPEED_OVER_GROUND,
        key_meanings: &["shipType"],
    },
];

/// Check the store against [`EXPECTED_FEATURES`]. Returns one finding per
/// problem; an empty list means the store is valid.
pub fn validate_format(repo: &FeatureDataRepository) -> Result<Vec<String>> {
    let names = repo.feature_names()?;
    let mut findings = Vec::new();

    for expected in EXPECTED_FEATURES {
        if !names.contains(expected.name) {
            findings.push(format!(
                "feature store contains no data for feature \"{}\"",
                expected.name
            ));
            continue;
        }

        // Sample one populated cell and check the declared key semantics.
        match repo.feature_data_for_random_cell(expected.name) {
            Ok(data) => {
                if data.key_meanings != expected.key_meanings {
                    findings.push(format!(
                        "{}: declared key meanings are {:?}, expected {:?}; cannot analyse against this feature",
                        expected.name, data.key_meanings, expected.key_meanings
                    ));
                }
            }
            Err(e) => {
                findings.push(format!(
                    "{}: could not sample a cell for validation: {e}",
                    expected.name
                ));
            }
        }
    }

    Ok(findings)
}

/// Log the findings and apply the configured policy.
pub fn apply_policy(findings: &[String], policy: ValidationPolicy) -> Result<()> {
    if findings.is_empty() {
        info!("Feature store format is valid");
        return Ok(());
    }
    for finding in findings {
        warn!("{}", finding);
    }
    match policy {
        ValidationPolicy::Warn => {
            warn!("Feature store is invalid; analyses will be unreliable");
            Ok(())
        }
        ValidationPolicy::Strict => anyhow::bail!(
            "feature store failed format validation with {} finding(s)",
            findings.len()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::FeatureData;

    fn seeded_repo(
        dir: &tempfile::TempDir,
        type_size_meanings: &[&str],
        with_speed: bool,
    ) -> FeatureDataRepository {
        let path = dir.path().join("stats.db");
        let repo = FeatureDataRepository::open_for_write(&path, 200.0).unwrap();

        let mut data = FeatureData::new(FEATURE_SHIP_TYPE_AND_SIZE, type_size_meanings);
        data.fold(&vec![1; type_size_meanings.len()], 1.0);
        repo.put_feature_data(1, FEATURE_SHIP_TYPE_AND_SIZE, &data).unwrap();

        if with_speed {
            let mut speed = FeatureData::new(FEATURE_SPEED_OVER_GROUND, &["shipType"]);
            speed.fold(&[1], 8.0);
            repo.put_feature_data(1, FEATURE_SPEED_OVER_GROUND, &speed).unwrap();
        }
        repo
    }

    #[test]
    fn test_valid_store_has_no_findings() {
        let dir = tempfile::tempdir().unwrap();
        let repo = seeded_repo(&dir, &["shipType", "shipSize"], true);
        assert!(validate_format(&repo).unwrap().is_empty());
    }

    #[test]
    fn test_missing_feature_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let repo = seeded_repo(&dir, &["shipType", "shipSize"], false);
        let findings = validate_format(&repo).unwrap();
        assert_eq!(findings.len(), 1);
        assert!(findings[0].contains(FEATURE_SPEED_OVER_GROUND));
    }

    #[test]
    fn test_key_meaning_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let repo = seeded_repo(&dir, &["flagState", "shipSize"], true);
        let findings = validate_format(&repo).unwrap();
        assert_eq!(findings.len(), 1);
        assert!(findings[0].contains("flagState"));
    }

    #[test]
    fn test_policy_warn_vs_strict() {
        let findings = vec!["something is off".to_string()];
        assert!(apply_policy(&findings, ValidationPolicy::Warn).is_ok());
        assert!(apply_policy(&findings, ValidationPolicy::Strict).is_err());
        assert!(apply_policy(&[], ValidationPolicy::Strict).is_ok());
    }
}
