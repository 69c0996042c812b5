//! Engine configuration: YAML with environment variable substitution.
//!
//! The configuration supplies operator aliases, import defaults, and plugin
//! search locations. It is read once at startup and is read-only for the
//! lifetime of a pipeline run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use weir_types::EngineError;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

pub const DEFAULT_BATCH_SIZE: usize = 65_536;
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(1);

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String, EngineError> {
    let mut result = input.to_string();
    let mut missing = Vec::new();

    for cap in ENV_VAR_RE.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(val) => {
                result = result.replace(&cap[0], &val);
            }
            Err(_) => missing.push(var_name.to_string()),
        }
    }

    if !missing.is_empty() {
        return Err(EngineError::invalid_configuration(format!(
            "missing environment variable(s): {}",
            missing.join(", ")
        )));
    }

    Ok(result)
}

/// Import defaults applied to builders unless an operator overrides them.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ImportConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_timeout", deserialize_with = "parse_timeout")]
    pub batch_timeout: Duration,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_batch_timeout() -> Duration {
    DEFAULT_BATCH_TIMEOUT
}

fn parse_timeout<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let text = String::deserialize(deserializer)?;
    let delta = weir_types::value::parse_duration(&text)
        .ok_or_else(|| D::Error::custom(format!("`{text}` is not a duration")))?;
    delta
        .to_std()
        .map_err(|_| D::Error::custom("batch timeout must not be negative"))
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
        }
    }
}

/// The engine configuration object.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct EngineConfig {
    /// User-defined operator aliases: name → pipeline text.
    #[serde(default)]
    pub operators: BTreeMap<String, String>,
    #[serde(default)]
    pub import: ImportConfig,
    /// Additional operator plugin search locations.
    #[serde(default)]
    pub plugin_dirs: Vec<PathBuf>,
}

impl EngineConfig {
    /// Parse a configuration string after env var substitution.
    pub fn from_str(yaml: &str) -> Result<Self, EngineError> {
        let substituted = substitute_env_vars(yaml)?;
        serde_yaml::from_str(&substituted)
            .map_err(|e| EngineError::invalid_configuration(format!("failed to parse config: {e}")))
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::filesystem(path.display().to_string(), e))?;
        Self::from_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_str("{}").unwrap();
        assert!(config.operators.is_empty());
        assert_eq!(config.import.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.import.batch_timeout, DEFAULT_BATCH_TIMEOUT);
    }

    #[test]
    fn test_parse_aliases_and_import() {
        let yaml = r#"
operators:
  suricata: "read json --ndjson --selector event_type:suricata"
import:
  batch-size: 1024
  batch-timeout: 250ms
"#;
        let config = EngineConfig::from_str(yaml).unwrap();
        assert_eq!(
            config.operators["suricata"],
            "read json --ndjson --selector event_type:suricata"
        );
        assert_eq!(config.import.batch_size, 1024);
        assert_eq!(config.import.batch_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("WEIR_TEST_ALIAS", "pass");
        let yaml = "operators:\n  noop: \"${WEIR_TEST_ALIAS}\"\n";
        let config = EngineConfig::from_str(yaml).unwrap();
        assert_eq!(config.operators["noop"], "pass");
        std::env::remove_var("WEIR_TEST_ALIAS");
    }

    #[test]
    fn test_missing_env_vars_all_reported() {
        let result = substitute_env_vars("${WEIR_MISSING_A} ${WEIR_MISSING_B}");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("WEIR_MISSING_A"));
        assert!(err.contains("WEIR_MISSING_B"));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(EngineConfig::from_str("surprise: true").is_err());
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let result = EngineConfig::from_str("import:\n  batch-timeout: -1s\n");
        assert!(result.is_err());
    }
}
