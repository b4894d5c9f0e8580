//! In-process repositories, used by tests and single-node deployments.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;

use super::{
    is_due, is_prunable, ConversationVariableUpdater, WorkflowExecution,
    WorkflowExecutionRepository, WorkflowPauseRepository,
};
use crate::core::pause::{WorkflowPause, WorkflowPauseReason};
use crate::error::RepositoryError;

#[derive(Default)]
pub struct InMemoryExecutionRepository {
    executions: DashMap<String, WorkflowExecution>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }
}

#[async_trait]
impl WorkflowExecutionRepository for InMemoryExecutionRepository {
    async fn save(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        self.executions.insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> Result<Option<WorkflowExecution>, RepositoryError> {
        Ok(self.executions.get(execution_id).map(|e| e.value().clone()))
    }
}

struct StoredPause {
    pause: WorkflowPause,
    reasons: Vec<WorkflowPauseReason>,
}

/// Pause store whose consume is atomic under a single mutex.
#[derive(Default)]
pub struct InMemoryPauseStore {
    pauses: Mutex<HashMap<String, StoredPause>>,
}

impl InMemoryPauseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowPauseRepository for InMemoryPauseStore {
    async fn create_pause(
        &self,
        pause: &WorkflowPause,
        reasons: &[WorkflowPauseReason],
    ) -> Result<(), RepositoryError> {
        let mut pauses = self.pauses.lock();
        if pauses.contains_key(&pause.pause_id) {
            return Err(RepositoryError::InvalidState(format!(
                "pause {} already exists",
                pause.pause_id
            )));
        }
        pauses.insert(
            pause.pause_id.clone(),
            StoredPause {
                pause: pause.clone(),
                reasons: reasons.to_vec(),
            },
        );
        Ok(())
    }

    async fn get_pause(
        &self,
        tenant_id: &str,
        pause_id: &str,
    ) -> Result<Option<WorkflowPause>, RepositoryError> {
        Ok(self
            .pauses
            .lock()
            .get(pause_id)
            .filter(|stored| stored.pause.tenant_id == tenant_id)
            .map(|stored| stored.pause.clone()))
    }

    async fn consume_pause(
        &self,
        tenant_id: &str,
        pause_id: &str,
        now: i64,
    ) -> Result<WorkflowPause, RepositoryError> {
        let mut pauses = self.pauses.lock();
        let stored = pauses
            .get_mut(pause_id)
            .filter(|stored| stored.pause.tenant_id == tenant_id)
            .ok_or_else(|| RepositoryError::NotFound(pause_id.to_string()))?;
        if stored.pause.is_resumed() {
            return Err(RepositoryError::AlreadyConsumed(pause_id.to_string()));
        }
        stored.pause.resumed_at = Some(now);
        Ok(stored.pause.clone())
    }

    async fn pause_reasons(&self, pause_id: &str) -> Result<Vec<WorkflowPauseReason>, RepositoryError> {
        Ok(self
            .pauses
            .lock()
            .get(pause_id)
            .map(|stored| stored.reasons.clone())
            .unwrap_or_default())
    }

    async fn delete_pause(&self, pause_id: &str) -> Result<bool, RepositoryError> {
        Ok(self.pauses.lock().remove(pause_id).is_some())
    }

    async fn due_scheduled_pauses(&self, now: i64) -> Result<Vec<WorkflowPauseReason>, RepositoryError> {
        let pauses = self.pauses.lock();
        let mut due: Vec<WorkflowPauseReason> = pauses
            .values()
            .flat_map(|stored| {
                stored
                    .reasons
                    .iter()
                    .filter(|reason| is_due(&stored.pause, reason, now))
                    .cloned()
            })
            .collect();
        due.sort_by_key(|reason| reason.resume_at);
        Ok(due)
    }

    async fn prune_pauses(
        &self,
        expired_before: i64,
        resumed_before: i64,
        limit: usize,
    ) -> Result<usize, RepositoryError> {
        let mut pauses = self.pauses.lock();
        let doomed: Vec<String> = pauses
            .values()
            .filter(|stored| is_prunable(&stored.pause, expired_before, resumed_before))
            .map(|stored| stored.pause.pause_id.clone())
            .take(limit)
            .collect();
        for pause_id in &doomed {
            pauses.remove(pause_id);
        }
        Ok(doomed.len())
    }
}

/// Buffers conversation variable updates until `flush`.
#[derive(Default)]
pub struct InMemoryConversationVariableUpdater {
    pending: Mutex<Vec<(String, String, Value)>>,
    committed: DashMap<(String, String), Value>,
}

impl InMemoryConversationVariableUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, conversation_id: &str, name: &str) -> Option<Value> {
        self.committed
            .get(&(conversation_id.to_string(), name.to_string()))
            .map(|v| v.value().clone())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[async_trait]
impl ConversationVariableUpdater for InMemoryConversationVariableUpdater {
    async fn update(&self, conversation_id: &str, name: &str, value: &Value) -> Result<(), RepositoryError> {
        self.pending
            .lock()
            .push((conversation_id.to_string(), name.to_string(), value.clone()));
        Ok(())
    }

    async fn flush(&self) -> Result<(), RepositoryError> {
        let pending = std::mem::take(&mut *self.pending.lock());
        for (conversation_id, name, value) in pending {
            self.committed.insert((conversation_id, name), value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::contract;
    use crate::repository::WorkflowExecutionStatus;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_pause_store_contract() {
        contract::exercise(&InMemoryPauseStore::new()).await;
    }

    #[tokio::test]
    async fn test_concurrent_consume_has_one_winner() {
        let store = std::sync::Arc::new(InMemoryPauseStore::new());
        let pause = contract::sample_pause("p1", "t1", 0);
        store.create_pause(&pause, &[]).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.consume_pause("t1", "p1", i).await.is_ok() }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_execution_repository() {
        let repo = InMemoryExecutionRepository::new();
        let mut execution = WorkflowExecution::new("e1", "wf", "t1", HashMap::new(), 0);
        repo.save(&execution).await.unwrap();
        execution.transition(WorkflowExecutionStatus::Running, 1).unwrap();
        repo.save(&execution).await.unwrap();

        assert_eq!(repo.len(), 1);
        let loaded = repo.get("e1").await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowExecutionStatus::Running);
        assert!(repo.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conversation_updates_visible_after_flush() {
        let updater = InMemoryConversationVariableUpdater::new();
        updater.update("c1", "count", &json!(1)).await.unwrap();
        updater.update("c1", "count", &json!(2)).await.unwrap();
        assert_eq!(updater.get("c1", "count"), None);

        updater.flush().await.unwrap();
        assert_eq!(updater.get("c1", "count"), Some(json!(2)));
        assert_eq!(updater.pending_len(), 0);
    }
}
