// ABOUTME: orchestrates script executions: persist, spawn, pump output, supervise, and finalize exactly once.
// ABOUTME: spawn failures surface to the caller; everything after launch is recorded on the execution record.

pub mod pump;
pub mod registry;
pub mod runner;
pub mod watchdog;

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scriptbox_common::{ExecutionId, ExecutionRecord, ExecutionStatus, ScriptType};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::store::ExecutionStore;
use pump::{OutputPump, OutputSink};
use registry::{LiveExecution, Registry};
use runner::{Invocation, ScriptProcess, SpawnedScript};
use watchdog::{Verdict, Watchdog};

const STORE_COMMIT_ATTEMPTS: u32 = 3;
const STORE_RETRY_BACKOFF: Duration = Duration::from_millis(100);
/// How long readers may keep going after the exit status is known.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to launch {program} for execution {execution_id}: {source}")]
    Spawn {
        execution_id: ExecutionId,
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("script type {0} is not enabled")]
    UnsupportedScriptType(ScriptType),

    #[error("script_type is required for inline content")]
    MissingScriptType,

    #[error("script {0} not found")]
    ScriptNotFound(String),

    #[error("invalid script id '{0}'")]
    InvalidScriptId(String),

    #[error("failed to read script {script_id}: {source}")]
    Catalog {
        script_id: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Everything needed to launch one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSpec {
    pub script_id: String,
    pub script_type: ScriptType,
    pub content: String,
    /// Exported as environment variables, overriding inherited ones.
    pub parameters: BTreeMap<String, String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    store: Arc<dyn ExecutionStore>,
    registry: Registry,
    permits: Option<Arc<Semaphore>>,
}

impl Engine {
    pub fn new(config: EngineConfig, store: Arc<dyn ExecutionStore>) -> Self {
        let permits = config
            .max_concurrent_executions
            .map(|n| Arc::new(Semaphore::new(n)));
        Self {
            config: Arc::new(config),
            store,
            registry: Registry::new(),
            permits,
        }
    }

    /// Persists a pending record and launches the script. Returns once the process
    /// is running; the outcome is written to the store when it ends.
    pub async fn execute(&self, spec: ExecutionSpec, sink: Option<OutputSink>) -> Result<ExecutionId, EngineError> {
        if !self.config.supports(spec.script_type) {
            return Err(EngineError::UnsupportedScriptType(spec.script_type));
        }
        let invocation = Invocation::for_script(&self.config, spec.script_type, &spec.content)
            .ok_or(EngineError::UnsupportedScriptType(spec.script_type))?;

        let permit = match &self.permits {
            Some(permits) => Some(
                Arc::clone(permits)
                    .acquire_owned()
                    .await
                    .map_err(|err| EngineError::Internal(err.into()))?,
            ),
            None => None,
        };

        let mut record = ExecutionRecord::pending(&spec.script_id, spec.script_type);
        let id = record.id;
        self.commit(&record).await;

        let SpawnedScript {
            mut process,
            stdout,
            stderr,
        } = match runner::spawn(&invocation, &spec.parameters) {
            Ok(spawned) => spawned,
            Err(source) => {
                error!(
                    execution_id = %id,
                    script_id = %spec.script_id,
                    program = %invocation.program,
                    error = %source,
                    "failed to launch script"
                );
                record.error = format!("failed to launch {}: {source}", invocation.program);
                if let Err(err) = record.finish(ExecutionStatus::Failed, None, Utc::now()) {
                    warn!(execution_id = %id, error = %err, "unexpected record state");
                }
                self.commit(&record).await;
                return Err(EngineError::Spawn {
                    execution_id: id,
                    program: invocation.program,
                    source,
                });
            }
        };

        let live = Arc::new(LiveExecution::new(&spec.script_id, process.pid(), record.started_at));
        if let Err(err) = self.registry.register(id, Arc::clone(&live)) {
            error!(execution_id = %id, error = %err, "registry rejected execution; killing process");
            if let Err(kill_err) = process.kill() {
                warn!(execution_id = %id, error = %kill_err, "kill failed");
            }
            let _ = process.wait(Some(self.config.grace_period())).await;
            record.error = err.to_string();
            if let Err(err) = record.finish(ExecutionStatus::Failed, None, Utc::now()) {
                warn!(execution_id = %id, error = %err, "unexpected record state");
            }
            self.commit(&record).await;
            return Err(EngineError::Internal(err));
        }

        if let Err(err) = record.advance(ExecutionStatus::Running) {
            warn!(execution_id = %id, error = %err, "unexpected record state");
        }
        self.commit(&record).await;
        info!(
            execution_id = %id,
            script_id = %spec.script_id,
            script_type = %spec.script_type,
            pid = ?process.pid(),
            live = self.registry.len(),
            "execution started"
        );

        let pump = OutputPump::start(stdout, stderr, self.config.max_output_size, sink);
        let watchdog = Watchdog::new(
            self.config.effective_timeout(spec.timeout_seconds),
            self.config.grace_period(),
        );
        let engine = self.clone();
        tokio::spawn(async move {
            engine.supervise(record, process, pump, watchdog, live).await;
            drop(permit);
        });

        Ok(id)
    }

    /// Requests cancellation. Unknown or finished ids are ignored; returns whether it was live.
    pub fn stop_execution(&self, id: &ExecutionId) -> bool {
        let Some(live) = self.registry.lookup(id) else {
            debug!(execution_id = %id, "stop ignored; execution is not live");
            return false;
        };
        if live.is_cancelled() {
            debug!(execution_id = %id, "stop already requested");
        } else {
            info!(
                execution_id = %id,
                script_id = %live.script_id,
                pid = ?live.pid,
                running_ms = (Utc::now() - live.started_at).num_milliseconds(),
                "stop requested"
            );
        }
        self.registry.stop(id)
    }

    /// Waits until the execution is finalized, then reads its record from the store.
    pub async fn wait_finished(&self, id: &ExecutionId) -> anyhow::Result<Option<ExecutionRecord>> {
        if let Some(live) = self.registry.lookup(id) {
            live.wait_finished().await;
        }
        self.store.get(id).await
    }

    pub async fn status(&self, id: &ExecutionId) -> anyhow::Result<Option<ExecutionRecord>> {
        self.store.get(id).await
    }

    pub async fn list(&self, limit: usize) -> anyhow::Result<Vec<ExecutionRecord>> {
        self.store.list(limit).await
    }

    async fn supervise(
        &self,
        mut record: ExecutionRecord,
        mut process: ScriptProcess,
        pump: OutputPump,
        watchdog: Watchdog,
        live: Arc<LiveExecution>,
    ) {
        let id = record.id;
        let cancel = live.cancel_token();

        let (status, exit_code, note) = match watchdog.supervise(&mut process, &cancel).await {
            Ok(Verdict::Exited(0)) => (ExecutionStatus::Completed, Some(0), None),
            Ok(Verdict::Exited(code)) => (ExecutionStatus::Failed, Some(code), None),
            Ok(Verdict::TimedOut) => {
                let secs = watchdog.timeout().map(|t| t.as_secs()).unwrap_or_default();
                (
                    ExecutionStatus::Timeout,
                    None,
                    Some(format!("execution timed out after {secs}s")),
                )
            }
            Ok(Verdict::Cancelled) => (ExecutionStatus::Cancelled, None, Some("execution cancelled".to_string())),
            Err(err) => {
                error!(execution_id = %id, error = %err, "waiting on script failed; killing");
                if let Err(kill_err) = process.kill() {
                    warn!(execution_id = %id, error = %kill_err, "kill failed");
                }
                (
                    ExecutionStatus::Failed,
                    None,
                    Some(format!("lost track of script process: {err}")),
                )
            }
        };

        let captured = pump.finish(IO_CAPTURE_TIMEOUT).await;
        record.output = captured.output;
        record.output_truncated = captured.output_truncated;
        record.error = captured.error;
        record.error_truncated = captured.error_truncated;
        if let Some(note) = note {
            append_note(&mut record.error, &note);
        }
        if let Err(err) = record.finish(status, exit_code, Utc::now()) {
            warn!(execution_id = %id, error = %err, "unexpected record state");
        }

        self.commit(&record).await;
        self.registry.unregister(&id);
        live.mark_finished();

        info!(
            execution_id = %id,
            script_id = %record.script_id,
            status = %record.status,
            exit_code = ?record.exit_code,
            "execution finished"
        );
    }

    /// Store failures never abort an execution; the commit is retried and then dropped with a log.
    async fn commit(&self, record: &ExecutionRecord) {
        for attempt in 1..=STORE_COMMIT_ATTEMPTS {
            match self.store.commit(record).await {
                Ok(()) => return,
                Err(err) if attempt < STORE_COMMIT_ATTEMPTS => {
                    warn!(
                        execution_id = %record.id,
                        status = %record.status,
                        attempt,
                        error = %err,
                        "store commit failed; retrying"
                    );
                    tokio::time::sleep(STORE_RETRY_BACKOFF * attempt).await;
                }
                Err(err) => {
                    error!(
                        execution_id = %record.id,
                        status = %record.status,
                        error = %err,
                        "store commit failed; giving up on this snapshot"
                    );
                }
            }
        }
    }
}

fn append_note(error: &mut String, note: &str) {
    if !error.is_empty() && !error.ends_with('\n') {
        error.push('\n');
    }
    error.push_str(note);
}
