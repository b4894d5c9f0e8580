//! Persistence contracts the engine depends on, plus in-process and
//! file-backed implementations.
//!
//! Cross-process exclusivity of [`WorkflowPauseRepository::consume_pause`] is
//! the store's job; every implementation here makes it atomic within its own
//! scope.

pub mod execution;
pub mod file;
pub mod memory;

pub use execution::{WorkflowExecution, WorkflowExecutionStatus};
pub use file::FilePauseStore;
pub use memory::{InMemoryConversationVariableUpdater, InMemoryExecutionRepository, InMemoryPauseStore};

use async_trait::async_trait;
use serde_json::Value;

use crate::core::pause::{WorkflowPause, WorkflowPauseReason};
use crate::error::RepositoryError;

#[async_trait]
pub trait WorkflowExecutionRepository: Send + Sync {
    async fn save(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError>;
    async fn get(&self, execution_id: &str) -> Result<Option<WorkflowExecution>, RepositoryError>;
}

#[async_trait]
pub trait WorkflowPauseRepository: Send + Sync {
    /// Persist a pause together with one reason row per paused node.
    async fn create_pause(
        &self,
        pause: &WorkflowPause,
        reasons: &[WorkflowPauseReason],
    ) -> Result<(), RepositoryError>;

    /// Look up a pause owned by `tenant_id`. Another tenant's pause is `None`.
    async fn get_pause(
        &self,
        tenant_id: &str,
        pause_id: &str,
    ) -> Result<Option<WorkflowPause>, RepositoryError>;

    /// Mark the pause resumed at `now` and return it.
    ///
    /// Fails with `NotFound` for unknown ids (or another tenant's) and with
    /// `AlreadyConsumed` on every call after the first.
    async fn consume_pause(
        &self,
        tenant_id: &str,
        pause_id: &str,
        now: i64,
    ) -> Result<WorkflowPause, RepositoryError>;

    async fn pause_reasons(&self, pause_id: &str) -> Result<Vec<WorkflowPauseReason>, RepositoryError>;

    /// Remove a pause and its reason rows. Returns whether it existed.
    async fn delete_pause(&self, pause_id: &str) -> Result<bool, RepositoryError>;

    /// Scheduled-pause rows of unresumed pauses whose `resume_at` is at or
    /// before `now`.
    async fn due_scheduled_pauses(&self, now: i64) -> Result<Vec<WorkflowPauseReason>, RepositoryError>;

    /// Delete unresumed pauses created before `expired_before` and resumed
    /// pauses resumed before `resumed_before`, at most `limit` of them.
    /// Returns how many were deleted.
    async fn prune_pauses(
        &self,
        expired_before: i64,
        resumed_before: i64,
        limit: usize,
    ) -> Result<usize, RepositoryError>;
}

/// Sink for conversation variable changes made by a run.
#[async_trait]
pub trait ConversationVariableUpdater: Send + Sync {
    async fn update(&self, conversation_id: &str, name: &str, value: &Value) -> Result<(), RepositoryError>;
    async fn flush(&self) -> Result<(), RepositoryError>;
}

fn is_prunable(pause: &WorkflowPause, expired_before: i64, resumed_before: i64) -> bool {
    match pause.resumed_at {
        Some(resumed_at) => resumed_at < resumed_before,
        None => pause.created_at < expired_before,
    }
}

fn is_due(pause: &WorkflowPause, reason: &WorkflowPauseReason, now: i64) -> bool {
    !pause.is_resumed()
        && reason.type_ == crate::core::pause::PauseReasonType::ScheduledPause
        && reason.resume_at.is_some_and(|at| at <= now)
}
