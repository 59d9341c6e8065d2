//! Pipeline configuration
//!
//! Loaded from a versioned YAML document or built from defaults:
//!
//! ```yaml
//! version: 1
//! batch:
//!   min_size: 5
//!   max_size: 50
//! propagation:
//!   batch_size: 50
//!   marker_ttl_secs: 3600
//! ```
//!
//! Every section is optional and falls back to its defaults. Unknown fields
//! are rejected.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::queue::RetryPolicy;

pub const SUPPORTED_VERSIONS: &[u32] = &[1];

#[derive(Error, Debug)]
pub enum ConfigError {
    /// Range validation error
    #[error("Invalid range for field '{field}': {value} not in {min}..={max}. {hint}")]
    Range {
        field: String,
        value: String,
        min: String,
        max: String,
        hint: String,
    },

    #[error("Missing 'version' field in configuration file. Add 'version: 1' to the top of your YAML file.")]
    MissingVersion,

    #[error("Unsupported configuration version {found}. Supported versions: {}", supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u32, supported: Vec<u32> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Custom(String),
}

impl ConfigError {
    pub fn range_with_hint(
        field: impl Into<String>,
        value: impl ToString,
        min: impl ToString,
        max: impl ToString,
        hint: impl Into<String>,
    ) -> Self {
        Self::Range {
            field: field.into(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
            hint: hint.into(),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Configuration objects that can check their own invariants
pub trait Validatable {
    fn validate(&self) -> ConfigResult<()>;

    fn config_name(&self) -> &'static str {
        "Config"
    }
}

fn check_range<T>(field: &str, value: T, min: T, max: T, hint: &str) -> ConfigResult<()>
where
    T: PartialOrd + ToString + Copy,
{
    if value < min || value > max {
        return Err(ConfigError::range_with_hint(field, value, min, max, hint));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Sections
// ═══════════════════════════════════════════════════════════════════════════

/// Adaptive batch-size controller bounds and thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BatchSettings {
    pub min_size: usize,
    pub max_size: usize,
    pub step: usize,
    pub default_size: usize,
    /// Grow when the average seconds per item falls below this
    pub fast_threshold_secs: f64,
    /// Shrink when the average seconds per item rises above this
    pub slow_threshold_secs: f64,
    /// Number of recent samples averaged
    pub window: usize,
    /// Consecutive backpressure failures before resetting to `min_size`
    pub reset_after_failures: u32,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            min_size: 5,
            max_size: 50,
            step: 5,
            default_size: 10,
            fast_threshold_secs: 2.0,
            slow_threshold_secs: 10.0,
            window: 10,
            reset_after_failures: 3,
        }
    }
}

impl Validatable for BatchSettings {
    fn validate(&self) -> ConfigResult<()> {
        check_range("batch.min_size", self.min_size, 1, 1000, "Use at least one item per batch")?;
        check_range(
            "batch.max_size",
            self.max_size,
            self.min_size,
            1000,
            "max_size must be >= min_size",
        )?;
        check_range("batch.step", self.step, 1, self.max_size, "Step must be positive")?;
        check_range(
            "batch.default_size",
            self.default_size,
            self.min_size,
            self.max_size,
            "Default batch size must lie inside [min_size, max_size]",
        )?;
        check_range(
            "batch.fast_threshold_secs",
            self.fast_threshold_secs,
            0.0,
            self.slow_threshold_secs,
            "Fast threshold must not exceed the slow threshold",
        )?;
        check_range("batch.window", self.window, 1, 100, "Typical window is 10 samples")?;
        check_range(
            "batch.reset_after_failures",
            self.reset_after_failures,
            1,
            100,
            "Reset needs at least one failure",
        )
    }

    fn config_name(&self) -> &'static str {
        "BatchSettings"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PreparationSettings {
    /// Documents with fewer characters after markup stripping are skipped
    pub min_content_length: usize,
    /// Prepared text is truncated to this many characters
    pub max_content_length: usize,
}

impl Default for PreparationSettings {
    fn default() -> Self {
        Self {
            min_content_length: 50,
            max_content_length: 8000,
        }
    }
}

impl Validatable for PreparationSettings {
    fn validate(&self) -> ConfigResult<()> {
        check_range(
            "preparation.max_content_length",
            self.max_content_length,
            1,
            1_000_000,
            "Extraction prompts get expensive beyond a few thousand characters",
        )?;
        check_range(
            "preparation.min_content_length",
            self.min_content_length,
            0,
            self.max_content_length,
            "min_content_length must be <= max_content_length",
        )
    }

    fn config_name(&self) -> &'static str {
        "PreparationSettings"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExtractionSettings {
    pub prompt_override: Option<String>,
    pub model_override: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IndexingSettings {
    /// Size of the top-entity and top-document lists in the snapshot
    pub top_n: usize,
}

impl Default for IndexingSettings {
    fn default() -> Self {
        Self { top_n: 10 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MaterializationSettings {
    /// Mentions below this confidence do not qualify a document
    pub min_confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PropagationSettings {
    pub batch_size: usize,
    pub marker_ttl_secs: u64,
}

impl Default for PropagationSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            marker_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QueueSettings {
    pub group: String,
    pub retry: RetryPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            group: "entitygraph".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PipelineSettings
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSettings {
    pub version: u32,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub preparation: PreparationSettings,
    #[serde(default)]
    pub extraction: ExtractionSettings,
    #[serde(default)]
    pub indexing: IndexingSettings,
    #[serde(default)]
    pub materialization: MaterializationSettings,
    #[serde(default)]
    pub propagation: PropagationSettings,
    #[serde(default)]
    pub queue: QueueSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            version: 1,
            batch: BatchSettings::default(),
            preparation: PreparationSettings::default(),
            extraction: ExtractionSettings::default(),
            indexing: IndexingSettings::default(),
            materialization: MaterializationSettings::default(),
            propagation: PropagationSettings::default(),
            queue: QueueSettings::default(),
        }
    }
}

impl PipelineSettings {
    pub fn from_yaml(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let raw: serde_yaml::Value = serde_yaml::from_str(content)?;
        let version = raw
            .get("version")
            .ok_or(ConfigError::MissingVersion)?
            .as_u64()
            .ok_or_else(|| ConfigError::Custom("'version' must be an integer".to_string()))?;

        let version = u32::try_from(version).unwrap_or(u32::MAX);
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(ConfigError::UnsupportedVersion {
                found: version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }

        let settings: PipelineSettings = serde_yaml::from_value(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

impl Validatable for PipelineSettings {
    fn validate(&self) -> ConfigResult<()> {
        self.batch.validate()?;
        self.preparation.validate()?;
        check_range(
            "indexing.top_n",
            self.indexing.top_n,
            1,
            1000,
            "Snapshot lists are meant to be short",
        )?;
        check_range(
            "materialization.min_confidence",
            self.materialization.min_confidence,
            0.0,
            1.0,
            "Confidence is a probability",
        )?;
        check_range(
            "propagation.batch_size",
            self.propagation.batch_size,
            1,
            1000,
            "Default is 50 documents per round",
        )?;
        check_range(
            "propagation.marker_ttl_secs",
            self.propagation.marker_ttl_secs,
            1,
            7 * 24 * 3600,
            "Markers should outlive one propagation round",
        )?;
        self.queue.retry.validate()?;
        if self.queue.group.trim().is_empty() {
            return Err(ConfigError::Custom("queue.group must not be empty".to_string()));
        }
        Ok(())
    }

    fn config_name(&self) -> &'static str {
        "PipelineSettings"
    }
}

impl Validatable for RetryPolicy {
    fn validate(&self) -> ConfigResult<()> {
        check_range(
            "queue.retry.max_attempts",
            self.max_attempts,
            1,
            50,
            "Default is 5 attempts",
        )?;
        check_range(
            "queue.retry.multiplier",
            self.multiplier,
            1.0,
            10.0,
            "Backoff must not shrink",
        )
    }

    fn config_name(&self) -> &'static str {
        "RetryPolicy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let settings = PipelineSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.batch.min_size, 5);
        assert_eq!(settings.batch.max_size, 50);
        assert_eq!(settings.propagation.batch_size, 50);
        assert_eq!(settings.queue.retry.max_attempts, 5);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let yaml = PipelineSettings::default().to_yaml().unwrap();
        assert!(yaml.contains("version: 1"));
        let parsed = PipelineSettings::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed, PipelineSettings::default());
    }

    #[test]
    fn test_yaml_partial_sections() {
        let yaml = r#"
version: 1
batch:
  default_size: 20
propagation:
  batch_size: 25
"#;
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml.as_bytes()).unwrap();

        let settings = PipelineSettings::from_yaml(temp_file.path()).unwrap();
        assert_eq!(settings.batch.default_size, 20);
        assert_eq!(settings.batch.max_size, 50);
        assert_eq!(settings.propagation.batch_size, 25);
        assert_eq!(settings.propagation.marker_ttl_secs, 3600);
    }

    #[test]
    fn test_yaml_missing_version() {
        let err = PipelineSettings::from_yaml_str("batch:\n  step: 5\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingVersion));
    }

    #[test]
    fn test_yaml_unsupported_version() {
        let err = PipelineSettings::from_yaml_str("version: 7\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion { found: 7, .. }));
    }

    #[test]
    fn test_yaml_unknown_field_rejected() {
        let err = PipelineSettings::from_yaml_str("version: 1\nbatch:\n  turbo: true\n").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn test_range_errors() {
        let mut settings = PipelineSettings::default();
        settings.batch.default_size = 80;
        let err = settings.validate().unwrap_err();
        match err {
            ConfigError::Range { field, .. } => assert_eq!(field, "batch.default_size"),
            other => panic!("unexpected error: {other}"),
        }

        let mut settings = PipelineSettings::default();
        settings.batch.fast_threshold_secs = 20.0;
        assert!(settings.validate().is_err());
    }
}
