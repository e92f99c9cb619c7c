//! Learner store: concept mastery records and the interaction log.
//!
//! Mastery records are keyed by (user, concept), updated in place with
//! last-writer-wins semantics and never deleted. Interaction records are
//! append-only.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::StoreError;
use crate::persistence::{atomic_write_json, load_json};
use crate::types::{InteractionRecord, MasteryRecord};

/// Persistence interface for learner records.
#[async_trait]
pub trait LearnerStore: Send + Sync {
    async fn get_mastery(
        &self,
        user_id: &str,
        concept: &str,
    ) -> Result<Option<MasteryRecord>, StoreError>;

    /// Insert or replace the record for `(record.user_id, record.concept)`.
    async fn upsert_mastery(&self, record: MasteryRecord) -> Result<(), StoreError>;

    async fn append_interaction(&self, record: InteractionRecord) -> Result<(), StoreError>;

    /// Most recent interactions for a user, newest first.
    async fn interactions_for(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<InteractionRecord>, StoreError>;

    /// All mastery records for a user, ordered by concept.
    async fn mastery_for_user(&self, user_id: &str) -> Result<Vec<MasteryRecord>, StoreError>;
}

/// Run a store operation under a timeout.
pub async fn with_store_timeout<T>(
    operation: &str,
    timeout: Duration,
    fut: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| StoreError::Timeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })?
}

fn check_score(record: &MasteryRecord) -> Result<(), StoreError> {
    if !(0.0..=1.0).contains(&record.score) {
        return Err(StoreError::ScoreOutOfRange {
            concept: record.concept.clone(),
            score: record.score,
        });
    }
    Ok(())
}

fn newest_first(records: &[InteractionRecord], user_id: &str, limit: usize) -> Vec<InteractionRecord> {
    let mut matching: Vec<InteractionRecord> = records
        .iter()
        .rev()
        .filter(|r| r.user_id == user_id)
        .take(limit)
        .cloned()
        .collect();
    matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    matching
}

/// A process-local store.
#[derive(Default)]
pub struct InMemoryStore {
    mastery: RwLock<HashMap<(String, String), MasteryRecord>>,
    interactions: RwLock<Vec<InteractionRecord>>,
    fail_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (for exercising failure paths).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Persistence {
                message: "store is read-only".to_string(),
            });
        }
        Ok(())
    }

    /// Every interaction, in append order.
    pub async fn all_interactions(&self) -> Vec<InteractionRecord> {
        self.interactions.read().await.clone()
    }
}

#[async_trait]
impl LearnerStore for InMemoryStore {
    async fn get_mastery(
        &self,
        user_id: &str,
        concept: &str,
    ) -> Result<Option<MasteryRecord>, StoreError> {
        Ok(self
            .mastery
            .read()
            .await
            .get(&(user_id.to_string(), concept.to_string()))
            .cloned())
    }

    async fn upsert_mastery(&self, record: MasteryRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        check_score(&record)?;
        self.mastery
            .write()
            .await
            .insert((record.user_id.clone(), record.concept.clone()), record);
        Ok(())
    }

    async fn append_interaction(&self, record: InteractionRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        self.interactions.write().await.push(record);
        Ok(())
    }

    async fn interactions_for(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<InteractionRecord>, StoreError> {
        Ok(newest_first(&self.interactions.read().await, user_id, limit))
    }

    async fn mastery_for_user(&self, user_id: &str) -> Result<Vec<MasteryRecord>, StoreError> {
        let mut records: Vec<MasteryRecord> = self
            .mastery
            .read()
            .await
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.concept.cmp(&b.concept));
        Ok(records)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    mastery: Vec<MasteryRecord>,
    #[serde(default)]
    interactions: Vec<InteractionRecord>,
}

/// A store persisted as a single JSON document.
///
/// The whole document is rewritten atomically after every change; suitable
/// for a single host process, not for multi-process deployments.
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<StoreFile>,
}

impl JsonFileStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let state = load_json::<StoreFile>(&path)
            .map_err(|e| StoreError::Persistence {
                message: format!("Failed to load {}: {e}", path.display()),
            })?
            .unwrap_or_default();
        debug!(
            path = %path.display(),
            mastery = state.mastery.len(),
            interactions = state.interactions.len(),
            "Opened learner store"
        );
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, state: &StoreFile) -> Result<(), StoreError> {
        atomic_write_json(&self.path, state).map_err(|e| StoreError::Persistence {
            message: format!("Failed to write {}: {e}", self.path.display()),
        })
    }
}

#[async_trait]
impl LearnerStore for JsonFileStore {
    async fn get_mastery(
        &self,
        user_id: &str,
        concept: &str,
    ) -> Result<Option<MasteryRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .mastery
            .iter()
            .find(|r| r.user_id == user_id && r.concept == concept)
            .cloned())
    }

    async fn upsert_mastery(&self, record: MasteryRecord) -> Result<(), StoreError> {
        check_score(&record)?;
        let mut state = self.state.lock().await;
        let existing = state
            .mastery
            .iter()
            .position(|r| r.user_id == record.user_id && r.concept == record.concept);
        match existing {
            Some(idx) => state.mastery[idx] = record,
            None => state.mastery.push(record),
        }
        self.persist(&state)
    }

    async fn append_interaction(&self, record: InteractionRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.interactions.push(record);
        self.persist(&state)
    }

    async fn interactions_for(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<InteractionRecord>, StoreError> {
        Ok(newest_first(&self.state.lock().await.interactions, user_id, limit))
    }

    async fn mastery_for_user(&self, user_id: &str) -> Result<Vec<MasteryRecord>, StoreError> {
        let mut records: Vec<MasteryRecord> = self
            .state
            .lock()
            .await
            .mastery
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.concept.cmp(&b.concept));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Intent, OutcomeTag, ScaffoldingLevel};
    use chrono::{Duration as ChronoDuration, Utc};
    use pretty_assertions::assert_eq;

    fn mastery(user: &str, concept: &str, score: f64) -> MasteryRecord {
        MasteryRecord {
            user_id: user.into(),
            concept: concept.into(),
            score,
            decay_factor: 0.9,
            last_assessed: Utc::now(),
        }
    }

    fn interaction(user: &str, minutes_ago: i64) -> InteractionRecord {
        InteractionRecord {
            id: uuid::Uuid::new_v4(),
            user_id: user.into(),
            timestamp: Utc::now() - ChronoDuration::minutes(minutes_ago),
            intent: Some(Intent::Tutor),
            outcome: OutcomeTag::Answered,
            concept_focus: Some("overfitting".into()),
            scaffolding_level: Some(ScaffoldingLevel::Guided),
            approved: true,
            rejection_reason: None,
            quality_score: Some(0.75),
        }
    }

    #[tokio::test]
    async fn test_in_memory_upsert_replaces() {
        let store = InMemoryStore::new();
        store.upsert_mastery(mastery("u1", "svm", 0.2)).await.unwrap();
        store.upsert_mastery(mastery("u1", "svm", 0.4)).await.unwrap();
        let rec = store.get_mastery("u1", "svm").await.unwrap().unwrap();
        assert!((rec.score - 0.4).abs() < 1e-9);
        assert_eq!(store.mastery_for_user("u1").await.unwrap().len(), 1);
        assert!(store.get_mastery("u2", "svm").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_out_of_range_score_rejected() {
        let store = InMemoryStore::new();
        let err = store
            .upsert_mastery(mastery("u1", "svm", 1.2))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ScoreOutOfRange { .. }));
    }

    #[tokio::test]
    async fn test_interactions_newest_first_and_limited() {
        let store = InMemoryStore::new();
        store.append_interaction(interaction("u1", 30)).await.unwrap();
        store.append_interaction(interaction("u2", 20)).await.unwrap();
        store.append_interaction(interaction("u1", 10)).await.unwrap();
        store.append_interaction(interaction("u1", 5)).await.unwrap();

        let recent = store.interactions_for("u1", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].timestamp > recent[1].timestamp);
        assert!(recent.iter().all(|r| r.user_id == "u1"));
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let store = InMemoryStore::new();
        store.set_fail_writes(true);
        assert!(store.append_interaction(interaction("u1", 0)).await.is_err());
        store.set_fail_writes(false);
        assert!(store.append_interaction(interaction("u1", 0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        {
            let store = JsonFileStore::open(&path).unwrap();
            store
                .upsert_mastery(mastery("u1", "backpropagation", 0.55))
                .await
                .unwrap();
            store.append_interaction(interaction("u1", 1)).await.unwrap();
        }
        let reopened = JsonFileStore::open(&path).unwrap();
        let rec = reopened
            .get_mastery("u1", "backpropagation")
            .await
            .unwrap()
            .unwrap();
        assert!((rec.score - 0.55).abs() < 1e-9);
        assert_eq!(reopened.interactions_for("u1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_json_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("nope.json")).unwrap();
        assert!(store.mastery_for_user("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_timeout() {
        let err = with_store_timeout("slow_op", Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, StoreError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::Timeout { .. }));
    }
}
