// ABOUTME: resolves execute requests into launchable specs, loading stored scripts from the scripts directory.
// ABOUTME: a script's file extension declares its type and an optional sidecar supplies parameter defaults.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use scriptbox_common::{ExecuteRequest, ScriptType};
use serde::{Deserialize, Serialize};

use crate::engine::{EngineError, ExecutionSpec};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterDefinition {
    pub name: String,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_parameter_type")]
    pub parameter_type: String,
}

fn default_parameter_type() -> String {
    "string".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub id: String,
    pub script_type: ScriptType,
    pub content: String,
    pub parameters: Vec<ParameterDefinition>,
}

#[derive(Debug, Clone)]
pub struct ScriptCatalog {
    dir: PathBuf,
}

impl ScriptCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn load(&self, script_id: &str) -> Result<Script, EngineError> {
        if !is_safe_script_id(script_id) {
            return Err(EngineError::InvalidScriptId(script_id.to_string()));
        }

        for script_type in ScriptType::ALL {
            let path = self.dir.join(format!("{script_id}.{}", script_type.extension()));
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    let parameters = self.load_parameters(script_id).await?;
                    return Ok(Script {
                        id: script_id.to_string(),
                        script_type,
                        content,
                        parameters,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(EngineError::Catalog {
                        script_id: script_id.to_string(),
                        source,
                    })
                }
            }
        }

        Err(EngineError::ScriptNotFound(script_id.to_string()))
    }

    async fn load_parameters(&self, script_id: &str) -> Result<Vec<ParameterDefinition>, EngineError> {
        let path = self.dir.join(format!("{script_id}.params.json"));
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(EngineError::Catalog {
                    script_id: script_id.to_string(),
                    source,
                })
            }
        };
        serde_json::from_str(&text).map_err(|err| EngineError::Catalog {
            script_id: script_id.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidData, err),
        })
    }

    /// Inline content runs as given; otherwise the stored script supplies content, type and defaults.
    pub async fn resolve(&self, request: &ExecuteRequest) -> Result<ExecutionSpec, EngineError> {
        if let Some(content) = &request.content {
            let script_type = request.script_type.ok_or(EngineError::MissingScriptType)?;
            return Ok(ExecutionSpec {
                script_id: request.script_id.clone(),
                script_type,
                content: content.clone(),
                parameters: request.parameters.clone(),
                timeout_seconds: request.timeout_sec,
            });
        }

        let script = self.load(&request.script_id).await?;
        Ok(ExecutionSpec {
            script_id: script.id,
            script_type: script.script_type,
            content: script.content,
            parameters: merge_parameters(&script.parameters, &request.parameters),
            timeout_seconds: request.timeout_sec,
        })
    }
}

pub fn merge_parameters(
    definitions: &[ParameterDefinition],
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged: BTreeMap<String, String> = definitions
        .iter()
        .filter_map(|def| def.default_value.clone().map(|value| (def.name.clone(), value)))
        .collect();
    merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

fn is_safe_script_id(script_id: &str) -> bool {
    !script_id.is_empty()
        && !script_id.starts_with('.')
        && !script_id.contains("..")
        && !script_id.contains(['/', '\\', '\0'])
}
