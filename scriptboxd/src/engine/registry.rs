// ABOUTME: indexes live executions by id so stop requests can reach the owning supervisor.
// ABOUTME: sharded map, never held across an await; entries are removed exactly once at finalization.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use scriptbox_common::ExecutionId;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Shared view of one running execution.
#[derive(Debug)]
pub struct LiveExecution {
    pub script_id: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    cancel: CancellationToken,
    finished: watch::Sender<bool>,
}

impl LiveExecution {
    pub fn new(script_id: &str, pid: Option<u32>, started_at: DateTime<Utc>) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            script_id: script_id.to_string(),
            pid,
            started_at,
            cancel: CancellationToken::new(),
            finished,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.send_replace(true);
    }

    pub async fn wait_finished(&self) {
        let mut rx = self.finished.subscribe();
        // the sender lives as long as self, so this only ends once the value flips
        let _ = rx.wait_for(|done| *done).await;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    live: Arc<DashMap<ExecutionId, Arc<LiveExecution>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ExecutionId, execution: Arc<LiveExecution>) -> anyhow::Result<()> {
        match self.live.entry(id) {
            Entry::Occupied(_) => anyhow::bail!("execution {id} is already registered"),
            Entry::Vacant(slot) => {
                slot.insert(execution);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, id: &ExecutionId) -> Option<Arc<LiveExecution>> {
        self.live.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn unregister(&self, id: &ExecutionId) -> Option<Arc<LiveExecution>> {
        self.live.remove(id).map(|(_, execution)| execution)
    }

    /// Requests cancellation; the supervisor escalates terminate -> grace -> kill.
    /// Unknown or finished ids are a no-op. Returns whether the id was live.
    pub fn stop(&self, id: &ExecutionId) -> bool {
        match self.lookup(id) {
            Some(execution) => {
                execution.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn live() -> Arc<LiveExecution> {
        Arc::new(LiveExecution::new("7", Some(42), Utc::now()))
    }

    #[test]
    fn second_registration_of_live_id_is_rejected() {
        let registry = Registry::new();
        let id = ExecutionId::new();
        registry.register(id, live()).unwrap();
        assert!(registry.register(id, live()).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stop_is_idempotent_and_ignores_unknown_ids() {
        let registry = Registry::new();
        assert!(!registry.stop(&ExecutionId::new()));

        let id = ExecutionId::new();
        let execution = live();
        registry.register(id, execution.clone()).unwrap();
        assert!(registry.stop(&id));
        assert!(registry.stop(&id));
        assert!(execution.is_cancelled());

        registry.unregister(&id);
        assert!(!registry.stop(&id));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn unregister_returns_entry_once() {
        let registry = Registry::new();
        let id = ExecutionId::new();
        registry.register(id, live()).unwrap();
        assert!(registry.unregister(&id).is_some());
        assert!(registry.unregister(&id).is_none());
        assert!(registry.lookup(&id).is_none());
    }

    #[tokio::test]
    async fn concurrent_registration_from_many_tasks() {
        let registry = Registry::new();
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let id = ExecutionId::new();
                registry.register(id, live()).unwrap();
                assert!(registry.lookup(&id).is_some());
                id
            }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        assert_eq!(registry.len(), 32);

        for id in ids {
            registry.unregister(&id);
        }
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn waiters_wake_on_finish() {
        let execution = live();
        let waiter = {
            let execution = execution.clone();
            tokio::spawn(async move { execution.wait_finished().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        execution.mark_finished();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // late waiters return immediately
        execution.wait_finished().await;
    }
}
