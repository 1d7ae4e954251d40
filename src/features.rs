//! Feature schema description, fingerprinting and lookback validation shared
//! by the segment and user aggregators.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

pub const DEFAULT_LOOKBACK_DAYS: [u32; 3] = [7, 14, 30];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    Bool,
    I64,
    F64,
    Date,
}

impl FeatureDType {
    fn tag(self) -> &'static str {
        match self {
            FeatureDType::Bool => "bool",
            FeatureDType::I64 => "i64",
            FeatureDType::F64 => "f64",
            FeatureDType::Date => "date",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

impl FeatureColumn {
    pub(crate) fn new(name: impl Into<String>, dtype: FeatureDType) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }
}

/// Ordered output columns of one feature table, `receipt_key` excluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub name: String,
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub(crate) fn new(name: &str, lookback_days: &[u32], columns: Vec<FeatureColumn>) -> Self {
        let fingerprint = schema_fingerprint(name, FEATURE_SCHEMA_VERSION, lookback_days, &columns);

        info!(
            component = "features",
            event = "features.schema.built",
            schema = name,
            version = FEATURE_SCHEMA_VERSION,
            lookback_days = ?lookback_days,
            column_count = columns.len(),
            fingerprint = fingerprint
        );

        Self {
            name: name.to_string(),
            version: FEATURE_SCHEMA_VERSION,
            fingerprint,
            columns,
        }
    }

    /// CSV header: `receipt_key` followed by the schema columns.
    pub fn header(&self) -> Vec<String> {
        std::iter::once("receipt_key".to_string())
            .chain(self.columns.iter().map(|c| c.name.clone()))
            .collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("invalid feature config: {0}")]
    InvalidConfig(String),
    #[error("duplicate receipt key {0}; keys must be unique before feature aggregation")]
    DuplicateKey(i64),
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

pub(crate) fn validate_lookback_days(lookback_days: &[u32]) -> Result<(), FeatureError> {
    if lookback_days.is_empty() {
        return Err(FeatureError::InvalidConfig(
            "lookback_days must not be empty".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for window in lookback_days {
        if *window == 0 {
            return Err(FeatureError::InvalidConfig(
                "lookback_days entries must be > 0".to_string(),
            ));
        }
        if !seen.insert(*window) {
            return Err(FeatureError::InvalidConfig(
                "lookback_days entries must be unique".to_string(),
            ));
        }
    }

    Ok(())
}

fn schema_fingerprint(
    name: &str,
    version: u32,
    lookback_days: &[u32],
    columns: &[FeatureColumn],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("schema:{name};"));
    hasher.update(format!("version:{version};"));
    hasher.update("lookback_days:");
    for window in lookback_days {
        hasher.update(format!("{window},"));
    }
    hasher.update(";columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(format!(":{};", column.dtype.tag()));
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookback_validation_rejects_zero_duplicates_and_empty() {
        assert!(validate_lookback_days(&[7, 14, 30]).is_ok());
        assert!(matches!(
            validate_lookback_days(&[7, 0]),
            Err(FeatureError::InvalidConfig(_))
        ));
        assert!(matches!(
            validate_lookback_days(&[7, 7]),
            Err(FeatureError::InvalidConfig(_))
        ));
        assert!(matches!(
            validate_lookback_days(&[]),
            Err(FeatureError::InvalidConfig(_))
        ));
    }

    #[test]
    fn fingerprint_depends_on_columns_and_lookbacks() {
        let cols = vec![FeatureColumn::new("rate_invalid_7d", FeatureDType::F64)];
        let a = FeatureSchema::new("segment", &[7], cols.clone());
        let b = FeatureSchema::new("segment", &[7], cols.clone());
        let c = FeatureSchema::new("segment", &[8], cols);
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_ne!(a.fingerprint, c.fingerprint);
        assert_eq!(a.fingerprint.len(), 64);
        assert_eq!(a.header(), vec!["receipt_key", "rate_invalid_7d"]);
    }

    #[test]
    fn incompatible_schema_is_reported() {
        let schema = FeatureSchema::new("user", &[7], Vec::new());
        assert!(assert_schema_compatible(FEATURE_SCHEMA_VERSION, &schema.fingerprint, &schema).is_ok());
        assert!(matches!(
            assert_schema_compatible(FEATURE_SCHEMA_VERSION + 1, &schema.fingerprint, &schema),
            Err(FeatureError::SchemaVersionMismatch { .. })
        ));
        assert!(matches!(
            assert_schema_compatible(FEATURE_SCHEMA_VERSION, "deadbeef", &schema),
            Err(FeatureError::SchemaFingerprintMismatch { .. })
        ));
    }
}
