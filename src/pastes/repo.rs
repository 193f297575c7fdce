use std::{collections::HashMap, path::PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::{
    auth::tokens::new_record_id,
    journal::{Journal, JournalError},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paste {
    pub id: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Immutable pastes, one journal line each. Readers never wait on fsync.
pub struct PasteStore {
    pastes: RwLock<HashMap<String, Paste>>,
    journal: Mutex<Journal>,
}

impl PasteStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let (journal, records) = Journal::open::<Paste>(path).await?;
        let pastes: HashMap<String, Paste> =
            records.into_iter().map(|p| (p.id.clone(), p)).collect();
        info!(
            path = %journal.path().display(),
            pastes = pastes.len(),
            "pastes loaded"
        );
        Ok(Self {
            pastes: RwLock::new(pastes),
            journal: Mutex::new(journal),
        })
    }

    /// The paste is on disk before it becomes visible or the call returns.
    pub async fn create(&self, content: String) -> Result<Paste, JournalError> {
        // Holding the journal lock makes check-and-insert of the id atomic
        // with respect to other writers.
        let mut journal = self.journal.lock().await;
        let id = loop {
            let id = new_record_id();
            if !self.pastes.read().await.contains_key(&id) {
                break id;
            }
        };
        let paste = Paste {
            id,
            content,
            created_at: OffsetDateTime::now_utc(),
        };
        journal.append(&paste).await?;
        self.pastes
            .write()
            .await
            .insert(paste.id.clone(), paste.clone());
        debug!(id = %paste.id, bytes = paste.content.len(), "paste stored");
        Ok(paste)
    }

    pub async fn get(&self, id: &str) -> Option<Paste> {
        self.pastes.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.pastes.read().await.len()
    }

    /// Makes every later journal write fail.
    #[cfg(test)]
    pub async fn reopen_journal_read_only(&self) {
        self.journal.lock().await.reopen_read_only().await.unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PasteStore::open(dir.path().join("pastes.jsonl")).await.unwrap();

        let paste = store.create("hello\nworld".into()).await.unwrap();
        assert_eq!(paste.id.len(), 16);
        let got = store.get(&paste.id).await.unwrap();
        assert_eq!(got, paste);
        assert!(store.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn pastes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pastes.jsonl");

        let store = PasteStore::open(&path).await.unwrap();
        let a = store.create("a".into()).await.unwrap();
        let b = store.create(String::new()).await.unwrap();
        drop(store);

        let store = PasteStore::open(&path).await.unwrap();
        assert_eq!(store.len().await, 2);
        assert_eq!(store.get(&a.id).await.unwrap(), a);
        assert_eq!(store.get(&b.id).await.unwrap().content, "");
    }

    #[tokio::test]
    async fn torn_tail_is_dropped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pastes.jsonl");

        let store = PasteStore::open(&path).await.unwrap();
        let kept = store.create("kept".into()).await.unwrap();
        drop(store);
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(br#"{"id":"abc","content":"par"#).unwrap();
        drop(f);

        let store = PasteStore::open(&path).await.unwrap();
        assert_eq!(store.len().await, 1);
        assert!(store.get(&kept.id).await.is_some());
        // Appending after the truncation still yields a loadable file.
        store.create("next".into()).await.unwrap();
        drop(store);
        assert_eq!(PasteStore::open(&path).await.unwrap().len().await, 2);
    }

    #[tokio::test]
    async fn corrupt_record_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pastes.jsonl");
        std::fs::write(&path, "not json\n{\"id\":\"a\"}\n").unwrap();

        let err = PasteStore::open(&path).await.err().unwrap();
        assert!(matches!(err, JournalError::Corrupt { line: 1, .. }));
    }

    #[tokio::test]
    async fn failed_write_stores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pastes.jsonl");
        let store = PasteStore::open(&path).await.unwrap();
        let kept = store.create("kept".into()).await.unwrap();
        store.reopen_journal_read_only().await;

        let err = store.create("lost".into()).await.unwrap_err();
        assert!(matches!(err, JournalError::Io { .. }));
        assert_eq!(store.len().await, 1);
        drop(store);

        let store = PasteStore::open(&path).await.unwrap();
        assert_eq!(store.len().await, 1);
        assert!(store.get(&kept.id).await.is_some());
    }

    #[tokio::test]
    async fn concurrent_creates_get_distinct_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(
            PasteStore::open(dir.path().join("pastes.jsonl")).await.unwrap(),
        );
        let mut set = tokio::task::JoinSet::new();
        for i in 0..16 {
            let store = store.clone();
            set.spawn(async move { store.create(format!("paste {i}")).await.unwrap().id });
        }
        let mut ids = std::collections::HashSet::new();
        while let Some(id) = set.join_next().await {
            ids.insert(id.unwrap());
        }
        assert_eq!(ids.len(), 16);
        assert_eq!(store.len().await, 16);
    }
}
