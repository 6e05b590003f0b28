//! Pin Registry - User-authoritative retention overrides
//!
//! A pin (by memory id, or by file path which pins the next memory
//! materialized for that path) makes a memory immune to passive decay
//! and policy-driven eviction until the user explicitly unpins it. The
//! registry is a view over the `pins` table; every mutation goes
//! through the writer like any other.

use std::collections::HashSet;
use std::sync::Arc;

use crate::memory::{Memory, PinEntry};
use crate::store::{PinTarget, Result, Store};

pub struct PinRegistry {
    store: Arc<Store>,
}

impl PinRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// All pins (memory pins and path pins)
    pub fn list(&self) -> Result<Vec<PinEntry>> {
        self.store.pins()
    }

    /// Pinned ACTIVE memories, oldest first
    pub fn pinned_memories(&self) -> Result<Vec<Memory>> {
        self.store.pinned_memories(None)
    }

    /// Path pins only (the classifier's pinned-ancestor rule)
    pub fn pinned_paths(&self) -> Result<Vec<String>> {
        self.store.pinned_paths()
    }

    /// The eviction denylist a hygiene cycle snapshots at its start and
    /// holds for the whole cycle
    pub fn denylist(&self) -> Result<HashSet<i64>> {
        Ok(self.list()?.iter().filter_map(|p| p.memory_id).collect())
    }

    pub async fn pin(&self, target: PinTarget, reason: &str, pinned_by: &str) -> Result<()> {
        self.store.writer().pin(target, reason, pinned_by).await
    }

    pub async fn unpin(&self, target: PinTarget) -> Result<()> {
        self.store.writer().unpin(target).await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fingerprint;
    use crate::ledger::Ledger;
    use crate::memory::{MemoryDraft, Salience};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn open() -> (TempDir, Arc<Store>, PinRegistry) {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(Ledger::open(dir.path().join("ledger.jsonl")).unwrap());
        let store = Arc::new(
            Store::open(&dir.path().join("vidurai.db"), &Config::default(), ledger).unwrap(),
        );
        let registry = PinRegistry::new(Arc::clone(&store));
        (dir, store, registry)
    }

    async fn seed(store: &Arc<Store>, verbatim: &str, file: &str) -> i64 {
        let draft = MemoryDraft {
            event_id: Uuid::new_v4(),
            project_path: "/p".into(),
            verbatim: verbatim.into(),
            gist: verbatim.into(),
            tags: vec![],
            event_type: "file_edit".into(),
            file_path: Some(file.into()),
            line_number: None,
            language: None,
            salience: Salience::Medium,
            fingerprint: fingerprint::fingerprint(verbatim, "file_edit", Some(file), None),
            timestamp: chrono::Utc::now(),
            redactions: 0,
        };
        store.writer().ingest(draft).await.unwrap().memory_id.unwrap()
    }

    #[tokio::test]
    async fn test_memory_pin_round_trip() {
        let (_dir, store, registry) = open();
        let id = seed(&store, "important", "src/a.rs").await;

        registry
            .pin(PinTarget::Memory(id), "matters", "user")
            .await
            .unwrap();
        assert_eq!(registry.list().unwrap().len(), 1);
        assert!(registry.denylist().unwrap().contains(&id));
        assert_eq!(registry.pinned_memories().unwrap()[0].id, id);

        registry.unpin(PinTarget::Memory(id)).await.unwrap();
        assert!(registry.list().unwrap().is_empty());
        let memory = store.get_memory(id).unwrap().unwrap();
        assert!(!memory.pinned);
        assert!(memory.expires_at.is_some());
        store.shutdown();
    }

    #[tokio::test]
    async fn test_path_pin_covers_existing_and_future() {
        let (_dir, store, registry) = open();
        let existing = seed(&store, "already here", "src/auth/mod.rs").await;

        registry
            .pin(PinTarget::Path("src/auth".into()), "auth matters", "user")
            .await
            .unwrap();
        assert!(store.get_memory(existing).unwrap().unwrap().pinned);
        assert_eq!(registry.pinned_paths().unwrap(), vec!["src/auth".to_string()]);

        // Materialized on next relevant event
        let future = seed(&store, "later edit", "src/auth/session.rs").await;
        assert!(store.get_memory(future).unwrap().unwrap().pinned);

        // Unrelated paths stay unpinned
        let outside = seed(&store, "elsewhere", "src/ui/view.rs").await;
        assert!(!store.get_memory(outside).unwrap().unwrap().pinned);
        store.shutdown();
    }
}
