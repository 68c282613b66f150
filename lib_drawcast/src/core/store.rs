//! In-process [`ResultStore`].

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::core::model::DrawResult;
use crate::core::ports::{ResultStore, SaveOutcome};
use crate::error::PersistenceError;

#[derive(Default)]
struct Inner {
    seen: HashSet<(String, String)>,
    latest: HashMap<String, DrawResult>,
    history: Vec<DrawResult>,
}

/// Keeps every result in memory. Used when no external store is configured
/// and in tests.
#[derive(Default)]
pub struct MemoryResultStore {
    inner: Mutex<Inner>,
}

impl MemoryResultStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every inserted result in insertion order.
    pub fn history(&self) -> Vec<DrawResult> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .history
            .clone()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn save(&self, result: &DrawResult) -> SaveOutcome {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let key = (result.target_id.clone(), result.sequence.clone());
        if !inner.seen.insert(key) {
            return SaveOutcome::Duplicate;
        }
        inner.latest.insert(result.target_id.clone(), result.clone());
        inner.history.push(result.clone());
        SaveOutcome::Inserted
    }

    async fn latest(&self, target_id: &str) -> Result<Option<DrawResult>, PersistenceError> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .latest
            .get(target_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn save_is_idempotent() {
        let store = MemoryResultStore::new();
        let r = DrawResult::new("fast-5", "1", json!([1]));
        assert!(matches!(store.save(&r).await, SaveOutcome::Inserted));
        assert!(matches!(store.save(&r).await, SaveOutcome::Duplicate));
        assert_eq!(store.history().len(), 1);

        let r2 = DrawResult::new("fast-5", "2", json!([2]));
        store.save(&r2).await;
        assert_eq!(store.latest("fast-5").await.unwrap(), Some(r2));
        assert_eq!(store.latest("other").await.unwrap(), None);
    }
}
