//! Scheduler - Background tick driver
//!
//! One task drives the hygiene, archive and dream cycles. Ticks run
//! sequentially on this task so they can never overlap each other;
//! missed ticks are skipped, not queued. Staged configuration (from
//! `set_config`) is applied at tick boundaries only.

use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::archive::Archiver;
use crate::config::Config;
use crate::retention::RetentionEngine;
use crate::store::Store;

/// Staged config handle shared with the engine: `set_config` stores the
/// next bundle here, the scheduler applies it at the next tick boundary.
pub type PendingConfig = Arc<Mutex<Option<Config>>>;

pub struct Scheduler {
    /// Shared with the engine (user-initiated unlearn); ticks take the
    /// lock one at a time on this task, so cycles never overlap.
    retention: Arc<tokio::sync::Mutex<RetentionEngine>>,
    archiver: Archiver,
    store: Arc<Store>,
    config: Config,
    pending_config: PendingConfig,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        retention: Arc<tokio::sync::Mutex<RetentionEngine>>,
        archiver: Archiver,
        store: Arc<Store>,
        config: Config,
        pending_config: PendingConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            retention,
            archiver,
            store,
            config,
            pending_config,
            shutdown,
        }
    }

    /// Run until the shutdown signal flips
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::info!(
            hygiene_s = self.config.scheduler.hygiene_interval_s,
            archive_s = self.config.scheduler.archive_interval_s,
            dream_s = self.config.scheduler.dream_interval_s,
            "scheduler started"
        );

        'rebuild: loop {
            let mut hygiene = make_interval(self.config.scheduler.hygiene_interval_s);
            let mut archive = make_interval(self.config.scheduler.archive_interval_s);
            let mut dream = make_interval(self.config.scheduler.dream_interval_s);

            loop {
                tokio::select! {
                    changed = self.shutdown.changed() => {
                        if changed.is_err() || *self.shutdown.borrow() {
                            break 'rebuild;
                        }
                    }
                    _ = hygiene.tick() => {
                        let rebuilt = self.apply_pending_config().await;
                        self.hygiene_tick().await;
                        if rebuilt {
                            continue 'rebuild;
                        }
                    }
                    _ = archive.tick() => {
                        let rebuilt = self.apply_pending_config().await;
                        self.archive_tick().await;
                        if rebuilt {
                            continue 'rebuild;
                        }
                    }
                    _ = dream.tick() => {
                        let rebuilt = self.apply_pending_config().await;
                        self.dream_tick().await;
                        if rebuilt {
                            continue 'rebuild;
                        }
                    }
                }
            }
        }
        tracing::info!("scheduler stopped");
    }

    async fn hygiene_tick(&mut self) {
        let now = Utc::now();
        let result = self.retention.lock().await.hygiene_tick(now).await;
        match result {
            Ok(report) => {
                if report.swept > 0 || report.groups_consolidated > 0 {
                    tracing::info!(
                        action = report.action.map(|a| a.as_str()),
                        swept = report.swept,
                        consolidated = report.groups_consolidated,
                        "hygiene tick"
                    );
                }
                if report.archive_requested {
                    self.archive_tick().await;
                }
            }
            Err(e) => tracing::error!(error = %e, "hygiene tick failed"),
        }
    }

    async fn archive_tick(&mut self) {
        let now = Utc::now();
        match self.archiver.tick(now).await {
            Ok(report) => {
                if report.archived > 0 {
                    tracing::info!(archived = report.archived, "archive tick");
                }
            }
            Err(e) => tracing::error!(error = %e, "archive tick failed"),
        }
    }

    async fn dream_tick(&mut self) {
        if let Err(e) = self.retention.lock().await.dream_tick(Utc::now()).await {
            tracing::error!(error = %e, "dream tick failed");
        }
    }

    /// Apply a staged config bundle. Returns true when tick intervals
    /// changed and the interval timers need rebuilding.
    async fn apply_pending_config(&mut self) -> bool {
        let staged = self
            .pending_config
            .lock()
            .ok()
            .and_then(|mut pending| pending.take());
        let Some(config) = staged else { return false };

        let intervals_changed = config.scheduler != self.config.scheduler;
        if let Err(e) = self.store.writer().update_config(config.clone()).await {
            tracing::error!(error = %e, "failed to hand new config to writer");
        }
        self.retention.lock().await.set_config(config.clone());
        self.config = config;
        tracing::info!("configuration applied at tick boundary");
        intervals_changed
    }
}

fn make_interval(seconds: u64) -> tokio::time::Interval {
    let period = Duration::from_secs(seconds.max(1));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    // A stalled tick (long consolidation) must not cause a burst of
    // catch-up ticks afterwards
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::retention::RulePolicy;
    use tempfile::TempDir;

    fn build(dir: &TempDir, config: Config) -> (Scheduler, watch::Sender<bool>, Arc<Store>) {
        let ledger = Arc::new(Ledger::open(dir.path().join("ledger.jsonl")).unwrap());
        let store = Arc::new(
            Store::open(&dir.path().join("vidurai.db"), &config, Arc::clone(&ledger)).unwrap(),
        );
        let retention = Arc::new(tokio::sync::Mutex::new(RetentionEngine::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            config.clone(),
            Box::new(RulePolicy::default()),
        )));
        let archiver = Archiver::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            dir.path().join("archive"),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Scheduler::new(
            retention,
            archiver,
            Arc::clone(&store),
            config,
            Arc::new(Mutex::new(None)),
            shutdown_rx,
        );
        (scheduler, shutdown_tx, store)
    }

    #[tokio::test]
    async fn test_shutdown_stops_scheduler() {
        let dir = TempDir::new().unwrap();
        let (scheduler, shutdown_tx, store) = build(&dir, Config::default());
        let handle = scheduler.spawn();

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler must stop promptly on shutdown")
            .unwrap();
        store.shutdown();
    }

    #[tokio::test]
    async fn test_hygiene_tick_fires() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.scheduler.hygiene_interval_s = 1;
        let (scheduler, shutdown_tx, store) = build(&dir, config);
        let handle = scheduler.spawn();

        // One interval elapses; the tick must run without panicking
        tokio::time::sleep(Duration::from_millis(1500)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        store.shutdown();
    }
}
