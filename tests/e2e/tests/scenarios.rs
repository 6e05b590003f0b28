//! Seed scenarios: the end-to-end behaviors the memory lifecycle is
//! built around - burst aggregation, pin immunity, focused recall,
//! redaction, archive atomicity and the oracle's token budget.

use chrono::{Duration, Utc};
use std::sync::Arc;

use vidurai_core::ledger::LedgerFilter;
use vidurai_core::oracle::{Audience, ContextRequest};
use vidurai_core::retention::{RetentionEngine, RulePolicy};
use vidurai_core::{
    Archiver, Config, FocusState, LedgerEvent, LedgerEventType, MemoryStatus, PinTarget, Salience,
};

use vidurai_e2e_tests::harness::{self, TestEngine};

/// S1 - Error burst aggregation: 50 identical diagnostics collapse to a
/// single row with repeat_count 50, demoted salience, and 49 reversible
/// aggregation entries in the ledger.
#[tokio::test]
async fn error_burst_collapses_to_one_memory() {
    let t = TestEngine::new();
    let mut last_id = None;

    for _ in 0..50 {
        let event = harness::diagnostic("src/auth.ts", "TS2304: Cannot find name 'Claude'", 42);
        let outcome = t.engine.ingest_event(event).await.unwrap();
        last_id = outcome.memory_id;
    }

    let memory = t
        .engine
        .store()
        .get_memory(last_id.unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(memory.repeat_count, 50);
    assert!(memory.salience <= Salience::Low);
    assert_eq!(memory.status, MemoryStatus::Active);
    assert_eq!(t.engine.store().active_count().unwrap(), 1);

    let aggregations = t
        .engine
        .ledger()
        .query(&LedgerFilter {
            event_type: Some(LedgerEventType::Aggregation),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(aggregations.len(), 49);
    assert!(aggregations.iter().all(|e| e.reversible));

    t.shutdown().await;
}

/// S2 - Pin immunity: a pinned MEDIUM memory survives a simulated year
/// of decay and hygiene untouched, with no forgetting ledger entries
/// referencing it.
#[tokio::test]
async fn pinned_memory_survives_a_year_of_hygiene() {
    let t = TestEngine::new();
    let id = t
        .engine
        .ingest_event(harness::file_edit("src/core.rs", Some("refactor notes")))
        .await
        .unwrap()
        .memory_id
        .unwrap();
    t.engine
        .pin(PinTarget::Memory(id), "load-bearing refactor", "user")
        .await
        .unwrap();
    let before = t.engine.store().get_memory(id).unwrap().unwrap();

    let mut retention = RetentionEngine::new(
        Arc::clone(t.engine.store()),
        Arc::clone(t.engine.ledger()),
        Config::default(),
        Box::new(RulePolicy::default()),
    );
    let year_later = Utc::now() + Duration::days(365);
    retention.passive_sweep(year_later).await.unwrap();
    retention.hygiene_tick(year_later).await.unwrap();

    let after = t.engine.store().get_memory(id).unwrap().unwrap();
    assert_eq!(after, before);
    assert_eq!(after.status, MemoryStatus::Active);
    assert!(after.pinned);

    for entry in t.engine.ledger().read_all().unwrap() {
        assert!(
            !entry.memories_removed.contains(&id),
            "ledger {:?} references the pinned memory",
            entry.action
        );
    }

    t.shutdown().await;
}

/// S3 - Focused recall bias: with focus on a.ts, the older memory about
/// a.ts outranks the fresher one about b.ts.
#[tokio::test]
async fn focus_outranks_recency() {
    let t = TestEngine::new();
    let now = Utc::now();
    let a = t
        .engine
        .ingest_event(harness::diagnostic_at(
            "a.ts",
            "unhandled rejection in session refresh",
            10,
            now - Duration::minutes(10),
        ))
        .await
        .unwrap()
        .memory_id
        .unwrap();
    let b = t
        .engine
        .ingest_event(harness::diagnostic_at(
            "b.ts",
            "render loop exceeded frame budget",
            20,
            now - Duration::minutes(1),
        ))
        .await
        .unwrap()
        .memory_id
        .unwrap();

    let response = t
        .engine
        .get_context(ContextRequest {
            audience: Audience::Developer,
            max_tokens: 500,
            focus: Some(FocusState {
                file_path: "a.ts".into(),
                line: None,
            }),
            ..Default::default()
        })
        .unwrap();

    let pos_a = response.included.iter().position(|m| *m == a).unwrap();
    let pos_b = response.included.iter().position(|m| *m == b).unwrap();
    assert!(pos_a < pos_b, "focused memory must precede fresher one");

    t.shutdown().await;
}

/// S4 - Gatekeeper: an ingested secret never reaches the store, and the
/// redaction counter reflects it.
#[tokio::test]
async fn api_key_is_redacted_before_storage() {
    let t = TestEngine::new();
    let outcome = t
        .engine
        .ingest_event(harness::file_edit(
            "src/config.ts",
            Some("const key = \"sk-proj-ABCDEFGHIJKLMNOPQRSTUVWX\""),
        ))
        .await
        .unwrap();

    let memory = t
        .engine
        .store()
        .get_memory(outcome.memory_id.unwrap())
        .unwrap()
        .unwrap();
    assert!(memory.verbatim.contains("<REDACTED_API_KEY>"));
    assert!(!memory.verbatim.contains("sk-proj-"));
    assert_eq!(t.engine.stats().unwrap().redactions_total, 1);

    t.shutdown().await;
}

/// S5 - Archive atomicity under failure: a failed cold verification
/// deletes nothing; the retry archives exactly the same batch.
#[tokio::test]
async fn archive_verify_failure_preserves_hot_rows() {
    let t = TestEngine::new();

    // 100 distinct memories, transitioned to pending_decay
    let mut ids = Vec::new();
    for i in 0..100 {
        let word = alpha_word(i);
        let event = harness::diagnostic(&format!("src/{word}.rs"), &format!("stale {word}"), 1);
        ids.push(t.engine.ingest_event(event).await.unwrap().memory_id.unwrap());
    }
    t.engine
        .store()
        .writer()
        .set_status(
            ids.clone(),
            MemoryStatus::PendingDecay,
            "passive_decay",
            LedgerEvent::new(LedgerEventType::Decay, "passive_decay"),
        )
        .await
        .unwrap();

    let mut archiver = Archiver::new(
        Arc::clone(t.engine.store()),
        Arc::clone(t.engine.ledger()),
        t.data_dir().join("archive"),
    );

    // First attempt: verification fails, nothing is deleted
    archiver.inject_verify_failure();
    let first_tick = Utc::now() + Duration::hours(2);
    let report = archiver.tick(first_tick).await.unwrap();
    assert!(report.verify_failed);
    assert_eq!(report.archived, 0);
    assert_eq!(
        t.engine
            .store()
            .count_with_status(MemoryStatus::PendingDecay)
            .unwrap(),
        100
    );
    let failures = t
        .engine
        .ledger()
        .read_all()
        .unwrap()
        .into_iter()
        .filter(|e| e.action == "archive_verify_failed")
        .count();
    assert_eq!(failures, 1);

    // Second attempt, past the backoff: exactly those 100 rows move cold
    let retry = first_tick + Duration::hours(1);
    let report = archiver.tick(retry).await.unwrap();
    assert_eq!(report.archived, 100);
    for id in &ids {
        assert!(t.engine.store().get_memory(*id).unwrap().is_none());
    }
    assert_eq!(archiver.cold_stats().unwrap().total_rows, 100);

    let successes = t
        .engine
        .ledger()
        .read_all()
        .unwrap()
        .into_iter()
        .filter(|e| e.action == "hot_pruned")
        .count();
    assert_eq!(successes, 1);

    t.shutdown().await;
}

/// S6 - Oracle token budget: with room for five ~300-char pinned items,
/// exactly five are included, pinned-first, with a truncation marker,
/// and the estimate stays inside the budget.
#[tokio::test]
async fn oracle_packs_exactly_what_fits() {
    let t = TestEngine::new();
    for i in 0..20 {
        let preview = "x".repeat(280);
        let id = t
            .engine
            .ingest_event(harness::file_edit(&format!("f{i:02}.rs"), Some(&preview)))
            .await
            .unwrap()
            .memory_id
            .unwrap();
        t.engine
            .pin(PinTarget::Memory(id), "keep", "user")
            .await
            .unwrap();
    }

    let budget = 480;
    let response = t
        .engine
        .get_context(ContextRequest {
            audience: Audience::Ai,
            max_tokens: budget,
            ..Default::default()
        })
        .unwrap();

    assert_eq!(response.included.len(), 5, "five pinned items fit the budget");
    assert!(response.truncated);
    assert!(response.token_estimate <= budget);
    assert!(response.rendered.contains("<truncated"));

    // Pinned-first means the earliest pinned ids, in order
    let pinned = t.engine.pinned_memories().unwrap();
    let expected: Vec<i64> = pinned.iter().take(5).map(|m| m.id).collect();
    assert_eq!(response.included, expected);

    t.shutdown().await;
}

/// Distinct alphabetic token (digits would be masked by the fingerprint
/// normalizer and aggregate)
fn alpha_word(mut n: usize) -> String {
    let mut word = String::new();
    loop {
        word.push((b'a' + (n % 26) as u8) as char);
        n /= 26;
        if n == 0 {
            break;
        }
    }
    word
}
