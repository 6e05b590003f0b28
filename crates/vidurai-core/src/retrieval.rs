//! Retriever - Ranked recall over the hot store
//!
//! Scores ACTIVE memories by recency, salience, text match and focus
//! bond, deduplicates by fingerprint, and breaks ties by id so results
//! are stable. Results are cached per query and invalidated by the
//! writer's generation counter.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use crate::memory::Memory;
use crate::store::{Result, Store};

/// Query cache entries
const CACHE_CAPACITY: usize = 64;

/// Recency half-life in days: a week-old untouched memory scores 0.5
const RECENCY_HALF_LIFE_DAYS: f64 = 7.0;

/// Scoring weights (w_recency, w_salience, w_match, w_focus)
pub const WEIGHTS: (f64, f64, f64, f64) = (0.4, 0.4, 0.2, 0.2);

// ============================================================================
// QUERY TYPES
// ============================================================================

/// The editor-reported focus used to bias recall
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FocusState {
    pub file_path: String,
    pub line: Option<u32>,
}

/// One recall request
#[derive(Debug, Clone, Default)]
pub struct RecallQuery {
    pub project_id: Option<i64>,
    pub text: Option<String>,
    pub focus: Option<FocusState>,
    pub limit: usize,
}

/// A scored hit
#[derive(Debug, Clone)]
pub struct RecallHit {
    pub memory: Memory,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    project_id: Option<i64>,
    text: Option<String>,
    focus_file: Option<String>,
    limit: usize,
}

// ============================================================================
// RETRIEVER
// ============================================================================

pub struct Retriever {
    store: Arc<Store>,
    cache: Mutex<LruCache<CacheKey, (u64, Vec<RecallHit>)>>,
}

impl Retriever {
    pub fn new(store: Arc<Store>) -> Self {
        // SAFETY: CACHE_CAPACITY is a non-zero constant
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).expect("cache capacity is non-zero");
        Self {
            store,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Top-K ACTIVE memories for the query
    pub fn recall(&self, query: &RecallQuery) -> Result<Vec<RecallHit>> {
        let limit = query.limit.max(1);
        let key = CacheKey {
            project_id: query.project_id,
            text: query.text.clone(),
            focus_file: query.focus.as_ref().map(|f| f.file_path.clone()),
            limit,
        };

        let generation = self.store.generation();
        if let Ok(mut cache) = self.cache.lock() {
            if let Some((cached_generation, hits)) = cache.get(&key) {
                if *cached_generation == generation {
                    return Ok(hits.clone());
                }
            }
        }

        let hits = self.rank(query, limit)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, (generation, hits.clone()));
        }
        Ok(hits)
    }

    fn rank(&self, query: &RecallQuery, limit: usize) -> Result<Vec<RecallHit>> {
        let now = chrono::Utc::now();
        let fetch = (limit * 4).max(64);

        // Candidate set: FTS hits when a query is given, otherwise the
        // recently touched slice of the store
        let candidates: Vec<(Memory, Option<f64>)> = match &query.text {
            Some(text) if !text.trim().is_empty() => self
                .store
                .search_text(query.project_id, text, fetch)?
                .into_iter()
                .map(|(m, rank)| (m, Some(rank)))
                .collect(),
            _ => self
                .store
                .recent_active(query.project_id, fetch)?
                .into_iter()
                .map(|m| (m, None))
                .collect(),
        };

        // bm25 ranks are lower-is-better; normalize to [0, 1] against
        // the best raw score in this candidate set
        let max_raw = candidates
            .iter()
            .filter_map(|(_, rank)| rank.map(|r| -r))
            .fold(f64::MIN, f64::max);

        let (w_recency, w_salience, w_match, w_focus) = WEIGHTS;
        let mut scored: Vec<RecallHit> = candidates
            .into_iter()
            .map(|(memory, rank)| {
                let age_days =
                    (now - memory.last_accessed).num_seconds().max(0) as f64 / 86_400.0;
                let recency = 0.5_f64.powf(age_days / RECENCY_HALF_LIFE_DAYS);
                let salience = memory.salience.weight() / 5.0;
                let text_match = match rank {
                    Some(r) if max_raw > 0.0 => (-r / max_raw).clamp(0.0, 1.0),
                    Some(_) => 0.0,
                    None => 0.0,
                };
                let focus = focus_bond(&memory, query.focus.as_ref());
                let score = w_recency * recency
                    + w_salience * salience
                    + w_match * text_match
                    + w_focus * focus;
                RecallHit { memory, score }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.memory.id.cmp(&b.memory.id))
        });

        // Dedup by fingerprint, keeping the best-scored hit
        let mut seen = std::collections::HashSet::new();
        scored.retain(|hit| seen.insert(hit.memory.fingerprint.clone()));
        scored.truncate(limit);
        Ok(scored)
    }
}

/// 1.0 for the focused file, 0.5 for a sibling in the same directory
fn focus_bond(memory: &Memory, focus: Option<&FocusState>) -> f64 {
    let Some(focus) = focus else { return 0.0 };
    let Some(path) = &memory.file_path else {
        return 0.0;
    };
    if *path == focus.file_path {
        return 1.0;
    }
    let dir = |p: &str| {
        std::path::Path::new(p)
            .parent()
            .map(|d| d.to_path_buf())
            .unwrap_or_default()
    };
    if dir(path) == dir(&focus.file_path) {
        0.5
    } else {
        0.0
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

    fn open_store() -> (TempDir, Arc<Store>) {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(Ledger::open(dir.path().join("ledger.jsonl")).unwrap());
        let store =
            Store::open(&dir.path().join("vidurai.db"), &Config::default(), ledger).unwrap();
        (dir, Arc::new(store))
    }

    fn draft(verbatim: &str, file: &str, salience: Salience) -> MemoryDraft {
        MemoryDraft {
            event_id: Uuid::new_v4(),
            project_path: "/p".into(),
            verbatim: verbatim.into(),
            gist: verbatim.into(),
            tags: vec![],
            event_type: "diagnostic".into(),
            file_path: Some(file.into()),
            line_number: None,
            language: None,
            salience,
            fingerprint: fingerprint::fingerprint(verbatim, "diagnostic", Some(file), None),
            timestamp: chrono::Utc::now(),
            redactions: 0,
        }
    }

    #[tokio::test]
    async fn test_focus_bias_orders_results() {
        let (_dir, store) = open_store();
        let a = store
            .writer()
            .ingest(draft("null deref in handler", "a.ts", Salience::High))
            .await
            .unwrap()
            .memory_id
            .unwrap();
        store
            .writer()
            .ingest(draft("slow render in view", "b.ts", Salience::High))
            .await
            .unwrap();

        let retriever = Retriever::new(Arc::clone(&store));
        let hits = retriever
            .recall(&RecallQuery {
                focus: Some(FocusState {
                    file_path: "a.ts".into(),
                    line: None,
                }),
                limit: 10,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(hits[0].memory.id, a);
        store.shutdown();
    }

    #[tokio::test]
    async fn test_text_match_ranks_relevant_first() {
        let (_dir, store) = open_store();
        store
            .writer()
            .ingest(draft("connection pool exhausted", "db.rs", Salience::Medium))
            .await
            .unwrap();
        store
            .writer()
            .ingest(draft("typo fixed in readme", "README.md", Salience::Medium))
            .await
            .unwrap();

        let retriever = Retriever::new(Arc::clone(&store));
        let hits = retriever
            .recall(&RecallQuery {
                text: Some("connection pool".into()),
                limit: 10,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(hits.len(), 1);
        assert!(hits[0].memory.verbatim.contains("connection pool"));
        store.shutdown();
    }

    #[tokio::test]
    async fn test_results_dedup_by_fingerprint_and_are_stable() {
        let (_dir, store) = open_store();
        for i in 0..3 {
            store
                .writer()
                .ingest(draft(&format!("distinct event {i}"), "x.rs", Salience::Low))
                .await
                .unwrap();
        }

        let retriever = Retriever::new(Arc::clone(&store));
        let query = RecallQuery {
            limit: 10,
            ..Default::default()
        };
        let first = retriever.recall(&query).unwrap();
        let second = retriever.recall(&query).unwrap();

        assert_eq!(first.len(), 3);
        let ids: Vec<i64> = first.iter().map(|h| h.memory.id).collect();
        let ids2: Vec<i64> = second.iter().map(|h| h.memory.id).collect();
        assert_eq!(ids, ids2);

        let mut fps: Vec<&str> = first.iter().map(|h| h.memory.fingerprint.as_str()).collect();
        fps.dedup();
        assert_eq!(fps.len(), 3);
        store.shutdown();
    }

    #[tokio::test]
    async fn test_cache_invalidates_on_write() {
        let (_dir, store) = open_store();
        store
            .writer()
            .ingest(draft("first", "x.rs", Salience::Low))
            .await
            .unwrap();

        let retriever = Retriever::new(Arc::clone(&store));
        let query = RecallQuery {
            limit: 10,
            ..Default::default()
        };
        assert_eq!(retriever.recall(&query).unwrap().len(), 1);

        store
            .writer()
            .ingest(draft("second", "y.rs", Salience::Low))
            .await
            .unwrap();
        assert_eq!(retriever.recall(&query).unwrap().len(), 2);
        store.shutdown();
    }
}
