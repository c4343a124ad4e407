use crate::error::{Result, VarianceError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_MIN_ABS_DELTA: f64 = 10_000.0;
pub const DEFAULT_MIN_PCT_DELTA: f64 = 0.10;
pub const DEFAULT_CONCENTRATION_SHARE: f64 = 0.60;
pub const DEFAULT_ONE_OFF_SHARE: f64 = 0.50;
pub const DEFAULT_COUNTERPART_TOLERANCE: f64 = 0.10;
pub const DEFAULT_VOLUME_COUNT_CHANGE: f64 = 0.25;
pub const DEFAULT_STABLE_AVERAGE_TOLERANCE: f64 = 0.10;

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "llama3.1:8b";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_SCHEMA_RETRIES: u32 = 2;
pub const DEFAULT_CONNECT_RETRIES: u32 = 2;
pub const DEFAULT_CONNECT_BACKOFF_MS: u64 = 500;

/// Thresholds deciding whether a deviation needs an explanation.
///
/// An account is material when `|delta| >= absolute`, or when its prior total
/// is non-zero, at least `min_base` in magnitude and `|pct| >= percentage`, or
/// (if set) when its share of the run's total absolute delta reaches
/// `min_share_total`. Raising any threshold can only clear flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterialityThresholds {
    pub absolute: f64,
    pub percentage: f64,
    pub min_base: f64,
    pub min_share_total: Option<f64>,
}

impl Default for MaterialityThresholds {
    fn default() -> Self {
        Self {
            absolute: DEFAULT_MIN_ABS_DELTA,
            percentage: DEFAULT_MIN_PCT_DELTA,
            min_base: 0.0,
            min_share_total: None,
        }
    }
}

impl MaterialityThresholds {
    pub fn new(absolute: f64, percentage: f64) -> Self {
        Self {
            absolute,
            percentage,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        non_negative("materiality.absolute", self.absolute)?;
        non_negative("materiality.percentage", self.percentage)?;
        non_negative("materiality.min_base", self.min_base)?;
        if let Some(share) = self.min_share_total {
            unit_share("materiality.min_share_total", share)?;
        }
        Ok(())
    }
}

/// Shares and tolerances used by the evidence rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceThresholds {
    /// Minimum share of the account delta a single counterparty must explain.
    pub concentration_share: f64,
    /// Minimum share of the account delta a single document must explain.
    pub one_off_share: f64,
    /// Relative amount tolerance for a posting to count as a document's counterpart.
    pub counterpart_tolerance: f64,
    /// Minimum relative change in posting count.
    pub volume_count_change: f64,
    /// Maximum relative change in the average posting amount for a volume effect.
    pub stable_average_tolerance: f64,
}

impl Default for EvidenceThresholds {
    fn default() -> Self {
        Self {
            concentration_share: DEFAULT_CONCENTRATION_SHARE,
            one_off_share: DEFAULT_ONE_OFF_SHARE,
            counterpart_tolerance: DEFAULT_COUNTERPART_TOLERANCE,
            volume_count_change: DEFAULT_VOLUME_COUNT_CHANGE,
            stable_average_tolerance: DEFAULT_STABLE_AVERAGE_TOLERANCE,
        }
    }
}

impl EvidenceThresholds {
    pub fn validate(&self) -> Result<()> {
        unit_share("evidence.concentration_share", self.concentration_share)?;
        unit_share("evidence.one_off_share", self.one_off_share)?;
        non_negative("evidence.counterpart_tolerance", self.counterpart_tolerance)?;
        non_negative("evidence.volume_count_change", self.volume_count_change)?;
        non_negative(
            "evidence.stable_average_tolerance",
            self.stable_average_tolerance,
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub request_timeout_secs: u64,
    /// Extra attempts after a parse or validation failure.
    pub schema_retries: u32,
    /// Extra attempts after the endpoint could not be reached.
    pub connect_retries: u32,
    /// Initial backoff between connectivity retries, doubled each time.
    pub connect_backoff_ms: u64,
    /// Accounts narrated concurrently within one run.
    pub max_concurrency: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.3,
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            schema_retries: DEFAULT_SCHEMA_RETRIES,
            connect_retries: DEFAULT_CONNECT_RETRIES,
            connect_backoff_ms: DEFAULT_CONNECT_BACKOFF_MS,
            max_concurrency: 1,
        }
    }
}

impl ModelConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(invalid("model.base_url", "must not be empty"));
        }
        if self.model.trim().is_empty() {
            return Err(invalid("model.model", "must not be empty"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(invalid(
                "model.temperature",
                format!("{} is outside 0.0..=2.0", self.temperature),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(invalid("model.request_timeout_secs", "must be positive"));
        }
        if self.max_concurrency == 0 {
            return Err(invalid("model.max_concurrency", "must be at least 1"));
        }
        Ok(())
    }
}

/// Everything one analysis run needs. Immutable once validated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub materiality: MaterialityThresholds,
    pub evidence: EvidenceThresholds,
    pub model: ModelConfig,
}

impl AnalysisConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: AnalysisConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Applies `OLLAMA_BASE_URL`, `OLLAMA_MODEL` and `OLLAMA_TIMEOUT` from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("OLLAMA_BASE_URL") {
            self.model.base_url = url;
        }
        if let Some(model) = lookup("OLLAMA_MODEL") {
            self.model.model = model;
        }
        if let Some(timeout) = lookup("OLLAMA_TIMEOUT") {
            self.model.request_timeout_secs = timeout.trim().parse().map_err(|_| {
                invalid(
                    "OLLAMA_TIMEOUT",
                    format!("'{}' is not a whole number of seconds", timeout),
                )
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        self.materiality.validate()?;
        self.evidence.validate()?;
        self.model.validate()
    }
}

fn invalid(field: &str, details: impl Into<String>) -> VarianceError {
    VarianceError::InvalidConfig {
        field: field.to_string(),
        details: details.into(),
    }
}

fn non_negative(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(invalid(
            field,
            format!("{} must be a finite, non-negative number", value),
        ));
    }
    Ok(())
}

fn unit_share(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 || value > 1.0 {
        return Err(invalid(field, format!("{} must be in (0, 1]", value)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AnalysisConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model.schema_retries, 2);
        assert_eq!(config.materiality.absolute, 10_000.0);
        assert_eq!(config.model.request_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = AnalysisConfig::from_json_str(
            r#"{ "materiality": { "absolute": 2500.0 }, "model": { "model": "qwen2.5:7b" } }"#,
        )
        .unwrap();
        assert_eq!(config.materiality.absolute, 2500.0);
        assert_eq!(config.materiality.percentage, DEFAULT_MIN_PCT_DELTA);
        assert_eq!(config.model.model, "qwen2.5:7b");
        assert_eq!(config.model.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn test_rejects_share_outside_unit_interval() {
        let result = AnalysisConfig::from_json_str(
            r#"{ "evidence": { "concentration_share": 1.5 } }"#,
        );
        match result {
            Err(VarianceError::InvalidConfig { field, .. }) => {
                assert_eq!(field, "evidence.concentration_share")
            }
            other => panic!("expected InvalidConfig, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_negative_threshold() {
        let mut config = AnalysisConfig::default();
        config.materiality.absolute = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let config = AnalysisConfig::default()
            .with_overrides_from(|key| match key {
                "OLLAMA_BASE_URL" => Some("http://gpu-box:11434".to_string()),
                "OLLAMA_TIMEOUT" => Some("30".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.model.base_url, "http://gpu-box:11434");
        assert_eq!(config.model.request_timeout_secs, 30);
        assert_eq!(config.model.model, DEFAULT_MODEL);

        let bad = AnalysisConfig::default().with_overrides_from(|key| match key {
            "OLLAMA_TIMEOUT" => Some("soon".to_string()),
            _ => None,
        });
        assert!(bad.is_err());
    }
}
