//! Pause store keeping one JSON document per pause in a directory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{is_due, is_prunable, WorkflowPauseRepository};
use crate::core::pause::{WorkflowPause, WorkflowPauseReason};
use crate::error::RepositoryError;

const PAUSE_SUFFIX: &str = ".pause.json";
const CONSUMED_SUFFIX: &str = ".consumed";

#[derive(Serialize, Deserialize)]
struct PauseDocument {
    pause: WorkflowPause,
    #[serde(default)]
    reasons: Vec<WorkflowPauseReason>,
}

/// File-backed [`WorkflowPauseRepository`].
///
/// Consumption is serialized by an async mutex within the process and by a
/// `create_new` marker file across processes sharing the directory.
pub struct FilePauseStore {
    dir: PathBuf,
    consume_lock: tokio::sync::Mutex<()>,
}

impl FilePauseStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            consume_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn path_for(&self, pause_id: &str, suffix: &str) -> Result<PathBuf, RepositoryError> {
        if pause_id.is_empty() || pause_id.contains(['/', '\\']) || pause_id.contains("..") {
            return Err(RepositoryError::InvalidState(format!("invalid pause id: {}", pause_id)));
        }
        Ok(self.dir.join(format!("{}{}", pause_id, suffix)))
    }

    async fn read(&self, pause_id: &str) -> Result<Option<PauseDocument>, RepositoryError> {
        let path = self.path_for(pause_id, PAUSE_SUFFIX)?;
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn write(&self, document: &PauseDocument) -> Result<(), RepositoryError> {
        let path = self.path_for(&document.pause.pause_id, PAUSE_SUFFIX)?;
        let bytes = serde_json::to_vec(document)?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<PauseDocument>, RepositoryError> {
        let mut documents = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(pause_id) = name.to_str().and_then(|n| n.strip_suffix(PAUSE_SUFFIX)) else {
                continue;
            };
            match self.read(pause_id).await {
                Ok(Some(document)) => documents.push(document),
                Ok(None) => {}
                Err(e) => tracing::warn!(pause_id, error = %e, "skipping unreadable pause file"),
            }
        }
        Ok(documents)
    }

    async fn remove(&self, pause_id: &str) -> Result<(), RepositoryError> {
        for suffix in [PAUSE_SUFFIX, CONSUMED_SUFFIX] {
            match tokio::fs::remove_file(self.path_for(pause_id, suffix)?).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WorkflowPauseRepository for FilePauseStore {
    async fn create_pause(
        &self,
        pause: &WorkflowPause,
        reasons: &[WorkflowPauseReason],
    ) -> Result<(), RepositoryError> {
        if self.read(&pause.pause_id).await?.is_some() {
            return Err(RepositoryError::InvalidState(format!(
                "pause {} already exists",
                pause.pause_id
            )));
        }
        self.write(&PauseDocument {
            pause: pause.clone(),
            reasons: reasons.to_vec(),
        })
        .await
    }

    async fn get_pause(
        &self,
        tenant_id: &str,
        pause_id: &str,
    ) -> Result<Option<WorkflowPause>, RepositoryError> {
        Ok(self
            .read(pause_id)
            .await?
            .map(|document| document.pause)
            .filter(|pause| pause.tenant_id == tenant_id))
    }

    async fn consume_pause(
        &self,
        tenant_id: &str,
        pause_id: &str,
        now: i64,
    ) -> Result<WorkflowPause, RepositoryError> {
        let _guard = self.consume_lock.lock().await;
        let mut document = self
            .read(pause_id)
            .await?
            .filter(|document| document.pause.tenant_id == tenant_id)
            .ok_or_else(|| RepositoryError::NotFound(pause_id.to_string()))?;
        if document.pause.is_resumed() {
            return Err(RepositoryError::AlreadyConsumed(pause_id.to_string()));
        }

        let marker = self.path_for(pause_id, CONSUMED_SUFFIX)?;
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&marker)
            .await
        {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(RepositoryError::AlreadyConsumed(pause_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        document.pause.resumed_at = Some(now);
        self.write(&document).await?;
        Ok(document.pause)
    }

    async fn pause_reasons(&self, pause_id: &str) -> Result<Vec<WorkflowPauseReason>, RepositoryError> {
        Ok(self
            .read(pause_id)
            .await?
            .map(|document| document.reasons)
            .unwrap_or_default())
    }

    async fn delete_pause(&self, pause_id: &str) -> Result<bool, RepositoryError> {
        let existed = self.read(pause_id).await?.is_some();
        self.remove(pause_id).await?;
        Ok(existed)
    }

    async fn due_scheduled_pauses(&self, now: i64) -> Result<Vec<WorkflowPauseReason>, RepositoryError> {
        let mut due: Vec<WorkflowPauseReason> = self
            .read_all()
            .await?
            .into_iter()
            .flat_map(|document| {
                let PauseDocument { pause, reasons } = document;
                reasons
                    .into_iter()
                    .filter(move |reason| is_due(&pause, reason, now))
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
        let doomed: Vec<String> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|document| is_prunable(&document.pause, expired_before, resumed_before))
            .map(|document| document.pause.pause_id)
            .take(limit)
            .collect();
        for pause_id in &doomed {
            self.remove(pause_id).await?;
        }
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::contract;

    #[tokio::test]
    async fn test_file_pause_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        contract::exercise(&FilePauseStore::new(dir.path()).unwrap()).await;
    }

    #[tokio::test]
    async fn test_consume_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let pause = contract::sample_pause("p1", "t1", 0);
        {
            let store = FilePauseStore::new(dir.path()).unwrap();
            store.create_pause(&pause, &contract::sample_reasons(&pause)).await.unwrap();
            store.consume_pause("t1", "p1", 5).await.unwrap();
        }
        let reopened = FilePauseStore::new(dir.path()).unwrap();
        assert!(matches!(
            reopened.consume_pause("t1", "p1", 6).await,
            Err(RepositoryError::AlreadyConsumed(_))
        ));
        let loaded = reopened.get_pause("t1", "p1").await.unwrap().unwrap();
        assert_eq!(loaded.resumed_at, Some(5));
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePauseStore::new(dir.path()).unwrap();
        assert!(store.get_pause("t1", "../escape").await.is_err());
    }
}
