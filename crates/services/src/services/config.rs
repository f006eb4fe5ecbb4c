//! `config.json` under the base directory. Unknown fields round-trip
//! through a flattened catch-all so a save never drops keys written by a
//! newer version; missing fields take defaults so old files keep loading.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

fn default_max_concurrent() -> usize {
    3
}

fn default_agent_command() -> String {
    "sudocode-agent".to_string()
}

fn default_process_timeout_secs() -> u64 {
    30 * 60
}

fn default_grace_period_secs() -> u64 {
    2
}

fn default_stable_write_ms() -> u64 {
    100
}

fn default_max_retries() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Concurrency cap for agent subprocesses.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: usize,
    /// Command line used to launch the default coding agent.
    #[serde(default = "default_agent_command")]
    pub agent_command: String,
    #[serde(default = "default_process_timeout_secs")]
    pub process_timeout_secs: u64,
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// How long a file's size must hold still before the watcher trusts it.
    #[serde(default = "default_stable_write_ms")]
    pub stable_write_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Keys this version does not know about, written back verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults always deserialize")
    }
}

impl Config {
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut rendered = serde_json::to_string_pretty(self)?;
        rendered.push('\n');
        std::fs::write(path, rendered)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_for_missing_fields() {
        let config: Config = serde_json::from_str(r#"{"max_concurrent_executions": 5}"#).unwrap();
        assert_eq!(config.max_concurrent_executions, 5);
        assert_eq!(config.grace_period_secs, 2);
        assert_eq!(config.stable_write_ms, 100);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.max_concurrent_executions = 7;
        config.save(&path).unwrap();

        let loaded = Config::load_or_default(&path).unwrap();
        assert_eq!(loaded.max_concurrent_executions, 7);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.max_concurrent_executions, 3);
    }

    #[test]
    fn unknown_fields_survive_a_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"max_concurrent_executions": 4, "future_feature": {"enabled": true}}"#,
        )
        .unwrap();

        let mut config = Config::load_or_default(&path).unwrap();
        assert_eq!(config.extra["future_feature"]["enabled"], serde_json::json!(true));

        config.max_concurrent_executions = 6;
        config.save(&path).unwrap();

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["max_concurrent_executions"], serde_json::json!(6));
        assert_eq!(raw["future_feature"]["enabled"], serde_json::json!(true));
    }
}
