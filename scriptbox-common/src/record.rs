// ABOUTME: defines the execution record, its status lifecycle, and the identifiers shared by daemon and client.
// ABOUTME: enforces monotonic status transitions so a finished execution can never be reopened.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Declared language of a script; selects the interpreter the daemon launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    Python,
    Nodejs,
    Shell,
}

impl ScriptType {
    pub const ALL: [ScriptType; 3] = [ScriptType::Python, ScriptType::Nodejs, ScriptType::Shell];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptType::Python => "python",
            ScriptType::Nodejs => "nodejs",
            ScriptType::Shell => "shell",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ScriptType::Python => "py",
            ScriptType::Nodejs => "js",
            ScriptType::Shell => "sh",
        }
    }

    pub fn from_extension(ext: &str) -> Option<ScriptType> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "py" => Some(ScriptType::Python),
            "js" | "mjs" | "cjs" => Some(ScriptType::Nodejs),
            "sh" | "bash" => Some(ScriptType::Shell),
            _ => None,
        }
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ScriptType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "py" => Ok(ScriptType::Python),
            "nodejs" | "node" | "js" => Ok(ScriptType::Nodejs),
            "shell" | "sh" => Ok(ScriptType::Shell),
            other => Err(format!("unknown script type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One line read from a script, newline included when the script emitted one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct OutputLine {
    pub stream: StreamKind,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    fn rank(&self) -> u8 {
        match self {
            ExecutionStatus::Pending => 0,
            ExecutionStatus::Running => 1,
            _ => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal status transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub script_id: String,
    pub script_type: ScriptType,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: String,
    pub output_truncated: bool,
    pub error: String,
    pub error_truncated: bool,
    pub exit_code: Option<i32>,
}

impl ExecutionRecord {
    pub fn pending(script_id: &str, script_type: ScriptType) -> Self {
        Self {
            id: ExecutionId::new(),
            script_id: script_id.to_string(),
            script_type,
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            output: String::new(),
            output_truncated: false,
            error: String::new(),
            error_truncated: false,
            exit_code: None,
        }
    }

    /// Moves to a later non-terminal status. Terminal moves go through `finish`.
    pub fn advance(&mut self, next: ExecutionStatus) -> Result<(), TransitionError> {
        if next.is_terminal() || self.status.is_terminal() || next.rank() <= self.status.rank() {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Applies the terminal transition. `exit_code` is only kept for completed/failed.
    pub fn finish(
        &mut self,
        status: ExecutionStatus,
        exit_code: Option<i32>,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !status.is_terminal() || self.status.is_terminal() {
            return Err(TransitionError {
                from: self.status,
                to: status,
            });
        }
        self.status = status;
        self.finished_at = Some(at);
        self.exit_code = match status {
            ExecutionStatus::Completed | ExecutionStatus::Failed => exit_code,
            _ => None,
        };
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}
