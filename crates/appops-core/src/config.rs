//! Engine configuration
//!
//! Defaults are usable as-is. Overrides come from a TOML file, from
//! `APPOPS_*` environment variables, or from `key=value` strings.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::errors::{AppOpsError, Result};
use crate::mode::Mode;

/// Prefix of environment variables merged by [`EngineConfig::merge_with_env`]
pub const ENV_PREFIX: &str = "APPOPS_";

/// Runtime tuning of the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Delay before a uid leaving the top state is treated as having left
    pub top_state_settle_ms: u64,
    /// Delay before a uid leaving a foreground-service state is treated as having left
    pub fg_service_state_settle_ms: u64,
    /// Delay applied to every other downgrade
    pub bg_state_settle_ms: u64,
    /// Debounce delay of ordinary state writes
    pub write_delay_ms: u64,
    /// Debounce delay after uninstalls and mode changes
    pub fast_write_delay_ms: u64,
    /// Recycled in-flight event objects kept around
    pub event_pool_capacity: usize,
    /// Treat attribution tags not declared by the package as absent
    pub strict_attribution_tags: bool,
    /// Mode returned by checks naming an unresolvable package; the op default when unset
    pub check_invalid_package_mode: Option<Mode>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            top_state_settle_ms: 5_000,
            fg_service_state_settle_ms: 5_000,
            bg_state_settle_ms: 1_000,
            write_delay_ms: 30 * 60 * 1_000,
            fast_write_delay_ms: 10_000,
            event_pool_capacity: 3,
            strict_attribution_tags: true,
            check_invalid_package_mode: None,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from TOML text, filling gaps with defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AppOpsError::config(format!("failed to read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Merge `APPOPS_<FIELD>` environment variables
    pub fn merge_with_env(&mut self) -> Result<()> {
        self.merge_with_vars(std::env::vars())
    }

    /// Merge `APPOPS_<FIELD>` entries from an arbitrary variable list
    pub fn merge_with_vars<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if let Some(field) = key.strip_prefix(ENV_PREFIX) {
                self.set_from_string(&field.to_lowercase(), &value)?;
            }
        }
        self.validate()
    }

    /// Set one field from its string form
    pub fn set_from_string(&mut self, key: &str, value: &str) -> Result<()> {
        fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| AppOpsError::config(format!("{key}: '{value}' is not a number")))
        }

        match key {
            "top_state_settle_ms" => self.top_state_settle_ms = number(key, value)?,
            "fg_service_state_settle_ms" => self.fg_service_state_settle_ms = number(key, value)?,
            "bg_state_settle_ms" => self.bg_state_settle_ms = number(key, value)?,
            "write_delay_ms" => self.write_delay_ms = number(key, value)?,
            "fast_write_delay_ms" => self.fast_write_delay_ms = number(key, value)?,
            "event_pool_capacity" => self.event_pool_capacity = number(key, value)?,
            "strict_attribution_tags" => {
                self.strict_attribution_tags = value
                    .trim()
                    .parse()
                    .map_err(|_| AppOpsError::config(format!("{key}: '{value}' is not a bool")))?;
            }
            "check_invalid_package_mode" => {
                let value = value.trim();
                self.check_invalid_package_mode = if value.is_empty() || value == "op_default" {
                    None
                } else {
                    Some(value.parse()?)
                };
            }
            other => return Err(AppOpsError::config(format!("unknown config key {other}"))),
        }
        Ok(())
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.fast_write_delay_ms > self.write_delay_ms {
            return Err(AppOpsError::config(format!(
                "fast_write_delay_ms ({}) exceeds write_delay_ms ({})",
                self.fast_write_delay_ms, self.write_delay_ms
            )));
        }
        if self.check_invalid_package_mode == Some(Mode::Foreground) {
            return Err(AppOpsError::config(
                "check_invalid_package_mode cannot be foreground",
            ));
        }
        Ok(())
    }

    /// Settle time after leaving the top state
    pub fn top_state_settle(&self) -> Duration {
        Duration::from_millis(self.top_state_settle_ms)
    }

    /// Settle time after leaving a foreground-service state
    pub fn fg_service_state_settle(&self) -> Duration {
        Duration::from_millis(self.fg_service_state_settle_ms)
    }

    /// Settle time after leaving any other state
    pub fn bg_state_settle(&self) -> Duration {
        Duration::from_millis(self.bg_state_settle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            top_state_settle_ms = 250
            check_invalid_package_mode = "ignored"
            "#,
        )
        .unwrap();
        assert_eq!(config.top_state_settle_ms, 250);
        assert_eq!(config.check_invalid_package_mode, Some(Mode::Ignored));
        assert_eq!(config.event_pool_capacity, 3);
    }

    #[test]
    fn test_merge_vars() {
        let mut config = EngineConfig::default();
        config
            .merge_with_vars(vec![
                ("APPOPS_BG_STATE_SETTLE_MS".to_string(), "42".to_string()),
                ("APPOPS_STRICT_ATTRIBUTION_TAGS".to_string(), "false".to_string()),
                ("HOME".to_string(), "/root".to_string()),
            ])
            .unwrap();
        assert_eq!(config.bg_state_settle_ms, 42);
        assert!(!config.strict_attribution_tags);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut config = EngineConfig::default();
        assert!(config.set_from_string("turbo", "1").is_err());
        assert!(config.set_from_string("write_delay_ms", "soon").is_err());
    }

    #[test]
    fn test_validation() {
        let config = EngineConfig {
            fast_write_delay_ms: 10,
            write_delay_ms: 5,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "event_pool_capacity = 8").unwrap();
        let config = EngineConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.event_pool_capacity, 8);
    }
}
