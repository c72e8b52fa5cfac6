// ABOUTME: defines the shared request and response protocol used by scriptctl and scriptboxd.
// ABOUTME: provides parsing and validation helpers so both sides reject malformed requests the same way.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod record;

pub use record::{
    ExecutionId, ExecutionRecord, ExecutionStatus, OutputLine, ScriptType, StreamKind, TransitionError,
};

/// Appended to an accumulated stream once it reaches the configured size bound.
pub const TRUNCATION_MARKER: &str = "\n[truncated]\n";

pub const DEFAULT_LIST_LIMIT: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Execute(ExecuteRequest),
    Stop(ExecutionRef),
    Status(ExecutionRef),
    List(ListRequest),
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExecuteRequest {
    pub script_id: String,
    /// Required when `content` is given inline; otherwise the catalog decides.
    pub script_type: Option<ScriptType>,
    pub content: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Zero disables the deadline; absent falls back to the daemon default.
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub follow: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExecutionRef {
    pub execution_id: ExecutionId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ListRequest {
    #[serde(default = "default_list_limit")]
    pub limit: usize,
}

fn default_list_limit() -> usize {
    DEFAULT_LIST_LIMIT
}

/// One json line written by the daemon in answer to a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Started { execution_id: ExecutionId },
    Output(OutputLine),
    Finished { record: ExecutionRecord },
    Stopped { execution_id: ExecutionId, live: bool },
    Status { record: Option<ExecutionRecord> },
    Executions { records: Vec<ExecutionRecord> },
    Pong,
    Error(RequestError),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ParseFailed,
    ValidationFailed,
    RequestTooLarge,
    SpawnFailed,
    UnsupportedScriptType,
    ScriptNotFound,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RequestError {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

pub fn parse_request(input: &str) -> Result<Request, serde_json::Error> {
    serde_json::from_str(input)
}

pub fn parse_frame(line: &str) -> Result<Frame, serde_json::Error> {
    serde_json::from_str(line)
}

pub fn validate_request(request: &Request) -> Result<(), ValidationError> {
    match request {
        Request::Execute(exec) => validate_execute(exec),
        Request::List(list) if list.limit == 0 => Err(ValidationError {
            message: "list limit must be positive".to_string(),
        }),
        _ => Ok(()),
    }
}

fn validate_execute(exec: &ExecuteRequest) -> Result<(), ValidationError> {
    if exec.script_id.trim().is_empty() {
        return Err(ValidationError {
            message: "script_id must be non-empty".to_string(),
        });
    }

    if exec.content.is_some() && exec.script_type.is_none() {
        return Err(ValidationError {
            message: "script_type is required with inline content".to_string(),
        });
    }

    for name in exec.parameters.keys() {
        if !is_valid_parameter_name(name) {
            return Err(ValidationError {
                message: format!("parameter name '{name}' cannot be used as an environment variable"),
            });
        }
    }

    Ok(())
}

pub fn is_valid_parameter_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('=') && !name.contains('\0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_unknown_fields_in_execute() {
        let input = r#"{
          "type": "execute",
          "script_id": "7",
          "script_type": "shell",
          "content": "echo hi",
          "unexpected": "field"
        }"#;

        assert!(parse_request(input).is_err());
    }

    #[test]
    fn execute_defaults_to_no_parameters_and_no_follow() {
        let input = r#"{"type":"execute","script_id":"7"}"#;
        let request = parse_request(input).unwrap();

        match request {
            Request::Execute(exec) => {
                assert!(exec.parameters.is_empty());
                assert!(!exec.follow);
                assert!(exec.content.is_none());
                assert!(exec.timeout_sec.is_none());
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn list_limit_defaults() {
        let request = parse_request(r#"{"type":"list"}"#).unwrap();
        assert_eq!(request, Request::List(ListRequest { limit: DEFAULT_LIST_LIMIT }));
    }

    #[test]
    fn validation_rejects_inline_content_without_type() {
        let request = parse_request(r#"{"type":"execute","script_id":"7","content":"echo hi"}"#).unwrap();
        let err = validate_request(&request).unwrap_err();
        assert!(err.message.contains("script_type"));
    }

    #[test]
    fn validation_rejects_parameter_names_with_equals() {
        let request = parse_request(
            r#"{"type":"execute","script_id":"7","script_type":"shell","content":"env","parameters":{"A=B":"x"}}"#,
        )
        .unwrap();
        assert!(validate_request(&request).is_err());
    }

    #[test]
    fn output_frame_is_flat_on_the_wire() {
        let frame = Frame::Output(OutputLine {
            stream: StreamKind::Stderr,
            text: "boom\n".to_string(),
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "output");
        assert_eq!(json["stream"], "stderr");
        assert_eq!(json["text"], "boom\n");
    }
}
