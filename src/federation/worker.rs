//! Background federation sweeps
//!
//! Two periodic loops: outbox retry (plus dedup expiry) and reputation
//! recalculation. Each sweep is single-flight; a tick that fires while the
//! previous run is still going is skipped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;

use super::delivery::{DeliveryEngine, RetrySummary};
use super::reputation;
use crate::data::Database;
use crate::error::AppError;
use crate::metrics::WORKER_SWEEPS_TOTAL;

const RETRY_TASK: &str = "retry";
const REPUTATION_TASK: &str = "reputation";

/// Result of one retry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySweep {
    pub deliveries: RetrySummary,
    pub dedup_purged: u64,
}

/// Held while a sweep runs; releases the flag on drop
struct SweepSlot<'a>(&'a AtomicBool);

impl<'a> SweepSlot<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SweepSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct FederationWorker {
    db: Arc<Database>,
    delivery: DeliveryEngine,
    batch_size: u32,
    retry_running: AtomicBool,
    reputation_running: AtomicBool,
}

impl FederationWorker {
    pub fn new(db: Arc<Database>, delivery: DeliveryEngine, batch_size: u32) -> Self {
        Self {
            db,
            delivery,
            batch_size,
            retry_running: AtomicBool::new(false),
            reputation_running: AtomicBool::new(false),
        }
    }

    /// Retry due outbox entries and drop expired dedup records
    ///
    /// Returns `None` when a previous sweep is still running.
    pub async fn run_retry_sweep(&self) -> Result<Option<RetrySweep>, AppError> {
        let Some(_slot) = SweepSlot::try_acquire(&self.retry_running) else {
            WORKER_SWEEPS_TOTAL
                .with_label_values(&[RETRY_TASK, "skipped"])
                .inc();
            tracing::debug!("Retry sweep still running; tick skipped");
            return Ok(None);
        };

        let result = async {
            let deliveries = self.delivery.retry_outbox_batch(self.batch_size).await?;
            let dedup_purged = self.db.purge_expired_dedup(Utc::now()).await?;
            Ok::<_, AppError>(RetrySweep {
                deliveries,
                dedup_purged,
            })
        }
        .await;

        record_sweep(RETRY_TASK, &result);
        result.map(Some)
    }

    /// Recompute domain reputation scores
    ///
    /// Returns `None` when a previous sweep is still running.
    pub async fn run_reputation_sweep(&self) -> Result<Option<usize>, AppError> {
        let Some(_slot) = SweepSlot::try_acquire(&self.reputation_running) else {
            WORKER_SWEEPS_TOTAL
                .with_label_values(&[REPUTATION_TASK, "skipped"])
                .inc();
            tracing::debug!("Reputation sweep still running; tick skipped");
            return Ok(None);
        };

        let result = reputation::recalculate(&self.db).await;
        record_sweep(REPUTATION_TASK, &result);
        result.map(Some)
    }

    /// Spawn both interval loops
    ///
    /// The first tick of each interval is consumed so sweeps start one
    /// interval after boot.
    pub fn spawn(self: Arc<Self>, retry_interval: Duration, reputation_interval: Duration) {
        let worker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(retry_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                interval.tick().await;
                match worker.run_retry_sweep().await {
                    Ok(Some(sweep)) if sweep.deliveries.processed > 0 || sweep.dedup_purged > 0 => {
                        tracing::info!(
                            processed = sweep.deliveries.processed,
                            failed = sweep.deliveries.failed,
                            dedup_purged = sweep.dedup_purged,
                            "Retry sweep completed"
                        );
                    }
                    Ok(_) => {}
                    Err(error) => tracing::error!(%error, "Retry sweep failed"),
                }
            }
        });

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(reputation_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                interval.tick().await;
                match self.run_reputation_sweep().await {
                    Ok(Some(scored)) => tracing::info!(scored, "Reputation sweep completed"),
                    Ok(None) => {}
                    Err(error) => tracing::error!(%error, "Reputation sweep failed"),
                }
            }
        });

        tracing::info!(
            retry_interval_secs = retry_interval.as_secs(),
            reputation_interval_secs = reputation_interval.as_secs(),
            "Federation worker spawned"
        );
    }
}

fn record_sweep<T>(task: &str, result: &Result<T, AppError>) {
    let outcome = if result.is_ok() { "ok" } else { "error" };
    WORKER_SWEEPS_TOTAL.with_label_values(&[task, outcome]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::identity::InstanceIdentity;
    use crate::federation::policy::DeliveryPolicy;
    use crate::federation::resolver::{ActorResolver, InstanceDirectory};
    use chrono::Duration as ChronoDuration;
    use std::collections::HashMap;
    use tempfile::TempDir;

    async fn create_worker() -> (FederationWorker, Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::connect(&temp_dir.path().join("worker.db"))
                .await
                .unwrap(),
        );
        let base = "http://127.0.0.1:1";
        let directory = Arc::new(InstanceDirectory::new(&HashMap::new(), "splitter-1", base));
        let identity = Arc::new(InstanceIdentity::new(db.clone(), "splitter-1", base, 1024));
        let http_client = reqwest::Client::new();
        let resolver = Arc::new(ActorResolver::new(
            db.clone(),
            http_client.clone(),
            directory,
            Duration::from_secs(3600),
            Duration::from_secs(1),
        ));
        let delivery = DeliveryEngine::new(
            db.clone(),
            identity,
            resolver,
            http_client,
            DeliveryPolicy::default(),
            Duration::from_secs(1),
            2,
        );
        (FederationWorker::new(db.clone(), delivery, 10), db, temp_dir)
    }

    #[tokio::test]
    async fn busy_sweep_is_skipped() {
        let (worker, _db, _temp_dir) = create_worker().await;

        let slot = SweepSlot::try_acquire(&worker.retry_running).unwrap();
        assert!(worker.run_retry_sweep().await.unwrap().is_none());
        drop(slot);

        assert!(worker.run_retry_sweep().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn retry_sweep_purges_expired_dedup() {
        let (worker, db, _temp_dir) = create_worker().await;
        db.claim_activity("https://a.example/old", Utc::now() - ChronoDuration::seconds(5))
            .await
            .unwrap();
        db.claim_activity("https://a.example/new", Utc::now() + ChronoDuration::days(1))
            .await
            .unwrap();

        let sweep = worker.run_retry_sweep().await.unwrap().unwrap();
        assert_eq!(sweep.dedup_purged, 1);
        assert_eq!(sweep.deliveries, RetrySummary::default());
        assert!(db.is_activity_processed("https://a.example/new").await.unwrap());
    }

    #[tokio::test]
    async fn reputation_sweep_scores_blocked_domains() {
        let (worker, db, _temp_dir) = create_worker().await;
        db.block_domain("spam.example", None).await.unwrap();

        assert_eq!(worker.run_reputation_sweep().await.unwrap(), Some(1));

        let slot = SweepSlot::try_acquire(&worker.reputation_running).unwrap();
        assert_eq!(worker.run_reputation_sweep().await.unwrap(), None);
        drop(slot);
    }
}
