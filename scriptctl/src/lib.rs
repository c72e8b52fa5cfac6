// ABOUTME: provides scriptctl helpers for turning command-line arguments into daemon requests.
// ABOUTME: keeps client behavior deterministic by validating requests locally before sending them.

use std::collections::BTreeMap;
use std::path::Path;

use scriptbox_common::{validate_request, ExecuteRequest, ExecutionRecord, ExecutionStatus, Request, ScriptType};

/// Parses a `KEY=VALUE` parameter; the value may itself contain `=`.
pub fn parse_param(input: &str) -> anyhow::Result<(String, String)> {
    let (key, value) = input
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("parameter '{input}' must look like KEY=VALUE"))?;
    if key.trim().is_empty() {
        return Err(anyhow::anyhow!("parameter '{input}' has an empty name"));
    }
    Ok((key.to_string(), value.to_string()))
}

pub fn infer_script_type(path: &Path) -> anyhow::Result<ScriptType> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| anyhow::anyhow!("cannot infer script type of {}; pass --type", path.display()))?;
    ScriptType::from_extension(ext)
        .ok_or_else(|| anyhow::anyhow!("unknown script extension '.{ext}'; pass --type"))
}

/// Where the script to run comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    Inline { path: String, content: String },
    Stored { script_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub source: ScriptSource,
    pub script_type: Option<ScriptType>,
    pub params: Vec<String>,
    pub timeout_sec: Option<u64>,
    pub follow: bool,
}

pub fn build_execute_request(options: RunOptions) -> anyhow::Result<Request> {
    let mut parameters = BTreeMap::new();
    for raw in &options.params {
        let (key, value) = parse_param(raw)?;
        parameters.insert(key, value);
    }

    let (script_id, script_type, content) = match options.source {
        ScriptSource::Inline { path, content } => {
            let path = Path::new(&path);
            let script_type = match options.script_type {
                Some(t) => t,
                None => infer_script_type(path)?,
            };
            let script_id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("inline")
                .to_string();
            (script_id, Some(script_type), Some(content))
        }
        ScriptSource::Stored { script_id } => (script_id, options.script_type, None),
    };

    let request = Request::Execute(ExecuteRequest {
        script_id,
        script_type,
        content,
        parameters,
        timeout_sec: options.timeout_sec,
        follow: options.follow,
    });
    validate_request(&request).map_err(|e| anyhow::anyhow!(e.message))?;
    Ok(request)
}

/// 0 only for a completed script.
pub fn exit_code_for(record: &ExecutionRecord) -> i32 {
    match record.status {
        ExecutionStatus::Completed => 0,
        _ => 1,
    }
}
