// ABOUTME: loads the daemon's engine configuration from an optional json file layered over defaults.
// ABOUTME: validates limits and interpreter commands before the engine starts accepting executions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use scriptbox_common::ScriptType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Upper bound in seconds for any requested timeout; 0 disables the cap.
    pub max_execution_time: u64,
    /// Timeout in seconds applied when a request does not name one; 0 means none.
    pub default_timeout: u64,
    /// Per-stream byte bound for accumulated output.
    pub max_output_size: usize,
    pub grace_period_ms: u64,
    pub supported_script_types: Vec<ScriptType>,
    pub interpreters: BTreeMap<ScriptType, Vec<String>>,
    pub max_concurrent_executions: Option<usize>,
    pub scripts_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_execution_time: 3600,
            default_timeout: 3600,
            max_output_size: 1024 * 1024,
            grace_period_ms: 1000,
            supported_script_types: ScriptType::ALL.to_vec(),
            interpreters: default_interpreters(),
            max_concurrent_executions: None,
            scripts_dir: PathBuf::from("scripts"),
        }
    }
}

fn default_interpreters() -> BTreeMap<ScriptType, Vec<String>> {
    let mut map = BTreeMap::new();
    map.insert(ScriptType::Python, vec!["python3".to_string(), "-c".to_string()]);
    map.insert(ScriptType::Nodejs, vec!["node".to_string(), "-e".to_string()]);
    map.insert(ScriptType::Shell, vec!["sh".to_string(), "-c".to_string()]);
    map
}

impl EngineConfig {
    pub async fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match path {
            Some(path) => {
                let text = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("read config at {}", path.display()))?;
                Self::from_json(&text).with_context(|| format!("parse config at {}", path.display()))?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let mut config: EngineConfig = serde_json::from_str(text)?;
        // a partial interpreter table only overrides the types it names
        for (script_type, command) in default_interpreters() {
            config.interpreters.entry(script_type).or_insert(command);
        }
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_output_size == 0 {
            anyhow::bail!("max_output_size must be positive");
        }
        if self.max_concurrent_executions == Some(0) {
            anyhow::bail!("max_concurrent_executions must be positive when set");
        }
        for script_type in &self.supported_script_types {
            match self.interpreters.get(script_type) {
                Some(command) if command.first().is_some_and(|p| !p.trim().is_empty()) => {}
                _ => anyhow::bail!("no interpreter configured for script type {script_type}"),
            }
        }
        Ok(())
    }

    pub fn supports(&self, script_type: ScriptType) -> bool {
        self.supported_script_types.contains(&script_type)
    }

    pub fn interpreter(&self, script_type: ScriptType) -> Option<&[String]> {
        self.interpreters.get(&script_type).map(Vec::as_slice)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Resolves a requested timeout against the default and the cap. `None` means no deadline.
    pub fn effective_timeout(&self, requested: Option<u64>) -> Option<Duration> {
        let secs = requested.unwrap_or(self.default_timeout);
        if secs == 0 {
            return None;
        }
        let secs = if self.max_execution_time > 0 {
            secs.min(self.max_execution_time)
        } else {
            secs
        };
        Some(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let config = EngineConfig::from_json(
            r#"{"max_output_size": 64, "interpreters": {"python": ["python3.12", "-c"]}}"#,
        )
        .unwrap();

        assert_eq!(config.max_output_size, 64);
        assert_eq!(config.max_execution_time, 3600);
        assert_eq!(
            config.interpreter(ScriptType::Python).unwrap(),
            ["python3.12".to_string(), "-c".to_string()]
        );
        assert_eq!(
            config.interpreter(ScriptType::Shell).unwrap(),
            ["sh".to_string(), "-c".to_string()]
        );
        config.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(EngineConfig::from_json(r#"{"theme": "dark"}"#).is_err());
    }

    #[test]
    fn rejects_empty_interpreter_for_enabled_type() {
        let config = EngineConfig::from_json(r#"{"interpreters": {"shell": []}}"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_output_size_is_invalid() {
        let config = EngineConfig {
            max_output_size: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn effective_timeout_applies_default_and_cap() {
        let config = EngineConfig {
            max_execution_time: 10,
            default_timeout: 5,
            ..EngineConfig::default()
        };

        assert_eq!(config.effective_timeout(None), Some(Duration::from_secs(5)));
        assert_eq!(config.effective_timeout(Some(60)), Some(Duration::from_secs(10)));
        assert_eq!(config.effective_timeout(Some(0)), None);

        let uncapped = EngineConfig {
            max_execution_time: 0,
            ..EngineConfig::default()
        };
        assert_eq!(uncapped.effective_timeout(Some(7200)), Some(Duration::from_secs(7200)));
    }

    #[tokio::test]
    async fn load_reads_file_and_reports_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{"grace_period_ms": 250}"#).await.unwrap();

        let config = EngineConfig::load(Some(&path)).await.unwrap();
        assert_eq!(config.grace_period(), Duration::from_millis(250));

        let err = EngineConfig::load(Some(&dir.path().join("missing.json")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("read config"));
    }
}
