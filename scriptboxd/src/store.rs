// ABOUTME: persists execution records, either as an append-only json-lines file or in memory.
// ABOUTME: every commit writes a full snapshot so the latest line per id is the record's current state.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use scriptbox_common::{ExecutionId, ExecutionRecord};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard, RwLock};

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn commit(&self, record: &ExecutionRecord) -> anyhow::Result<()>;

    async fn get(&self, id: &ExecutionId) -> anyhow::Result<Option<ExecutionRecord>>;

    /// Most recently started executions first.
    async fn list(&self, limit: usize) -> anyhow::Result<Vec<ExecutionRecord>>;
}

type Index = HashMap<ExecutionId, ExecutionRecord>;

/// Append-only log indexed in memory; the file is read once, on first use.
pub struct JsonlStore {
    path: PathBuf,
    /// `None` until the log has been loaded. Holding the lock also serializes appends.
    index: Mutex<Option<Index>>,
}

impl JsonlStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            index: Mutex::new(None),
        }
    }

    async fn loaded(&self) -> anyhow::Result<MutexGuard<'_, Option<Index>>> {
        let mut index = self.index.lock().await;
        if index.is_none() {
            *index = Some(self.load().await?);
        }
        Ok(index)
    }

    async fn load(&self) -> anyhow::Result<Index> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read execution store at {}", self.path.display()))
            }
        };

        let mut latest = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ExecutionRecord>(line) {
                Ok(record) => {
                    latest.insert(record.id, record);
                }
                Err(err) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        line = lineno + 1,
                        error = %err,
                        "skipping unreadable execution record"
                    );
                }
            }
        }
        tracing::debug!(path = %self.path.display(), records = latest.len(), "execution store loaded");
        Ok(latest)
    }
}

#[async_trait]
impl ExecutionStore for JsonlStore {
    async fn commit(&self, record: &ExecutionRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut index = self.loaded().await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open execution store at {}", self.path.display()))?;

        file.write_all(&line).await?;
        file.flush().await?;

        // only what reached the file is visible to readers
        if let Some(index) = index.as_mut() {
            index.insert(record.id, record.clone());
        }
        Ok(())
    }

    async fn get(&self, id: &ExecutionId) -> anyhow::Result<Option<ExecutionRecord>> {
        let index = self.loaded().await?;
        Ok(index.as_ref().and_then(|records| records.get(id).cloned()))
    }

    async fn list(&self, limit: usize) -> anyhow::Result<Vec<ExecutionRecord>> {
        let index = self.loaded().await?;
        let records = index
            .as_ref()
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default();
        Ok(newest_first(records, limit))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<ExecutionId, ExecutionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn commit(&self, record: &ExecutionRecord) -> anyhow::Result<()> {
        self.records.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: &ExecutionId) -> anyhow::Result<Option<ExecutionRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list(&self, limit: usize) -> anyhow::Result<Vec<ExecutionRecord>> {
        let records = self.records.read().await.values().cloned().collect();
        Ok(newest_first(records, limit))
    }
}

fn newest_first(mut records: Vec<ExecutionRecord>, limit: usize) -> Vec<ExecutionRecord> {
    records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    records.truncate(limit);
    records
}
