use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, gauge, histogram};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use golive_core::dedup::DedupGuard;
use golive_storage::Database;
use golive_util::RetentionConfig;

use crate::fanout::Clock;

const BATCH_LIMIT: i64 = 1000;

/// Background worker for dedup purging, retention deletes and WAL checkpoints.
#[derive(Clone)]
pub struct MaintenanceWorker {
    database: Database,
    dedup: Arc<DedupGuard>,
    claim_retention: ChronoDuration,
    clock: Clock,
    interval: Duration,
}

impl MaintenanceWorker {
    pub fn new(database: Database, dedup: Arc<DedupGuard>, retention: RetentionConfig) -> Self {
        Self {
            database,
            dedup,
            claim_retention: ChronoDuration::from_std(retention.claim_retention)
                .unwrap_or_else(|_| ChronoDuration::days(365)),
            clock: Arc::new(Utc::now),
            interval: retention.maintenance_interval,
        }
    }

    /// Overrides the clock used for determining retention thresholds.
    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the worker loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "storage", error = %err, "maintenance run failed");
            }
        }
    }

    /// Executes one maintenance cycle.
    pub async fn run_once(&self) -> Result<MaintenanceReport, MaintenanceError> {
        let now = (self.clock)();

        let dedup_purged = self.dedup.sweep(now);
        gauge!("dedup_entries").set(self.dedup.len() as f64);
        debug!(stage = "storage", purged = dedup_purged, "dedup guard swept");

        let threshold = now - self.claim_retention;

        let (claims_deleted, claims_busy) = self
            .delete_expired_rows("delivery_claims", threshold, |threshold| async move {
                self.database
                    .claims()
                    .delete_claims_older_than_batch(threshold, BATCH_LIMIT)
                    .await
            })
            .await?;
        info!(
            stage = "storage",
            table = "delivery_claims",
            deleted = claims_deleted,
            busy = claims_busy,
            threshold = %threshold.to_rfc3339(),
            "retention sweep completed"
        );

        let (log_deleted, log_busy) = self
            .delete_expired_rows("delivery_log", threshold, |threshold| async move {
                self.database
                    .claims()
                    .delete_log_older_than_batch(threshold, BATCH_LIMIT)
                    .await
            })
            .await?;
        info!(
            stage = "storage",
            table = "delivery_log",
            deleted = log_deleted,
            busy = log_busy,
            threshold = %threshold.to_rfc3339(),
            "retention sweep completed"
        );

        let checkpoint_busy = self.run_checkpoint().await?;

        Ok(MaintenanceReport {
            dedup_purged,
            claims_deleted,
            log_deleted,
            busy: claims_busy || log_busy || checkpoint_busy,
        })
    }

    async fn delete_expired_rows<Fut>(
        &self,
        table: &'static str,
        threshold: DateTime<Utc>,
        mut delete_fn: impl FnMut(DateTime<Utc>) -> Fut,
    ) -> Result<(u64, bool), MaintenanceError>
    where
        Fut: std::future::Future<Output = Result<u64, SqlxError>>,
    {
        let mut total_deleted = 0u64;
        let mut busy = false;

        loop {
            match delete_fn(threshold).await {
                Ok(0) => break,
                Ok(batch_deleted) => {
                    total_deleted += batch_deleted;
                    counter!("db_ttl_deleted_total", "table" => table).increment(batch_deleted);
                }
                Err(err) => {
                    if is_sqlite_busy(&err) {
                        busy = true;
                        counter!("db_busy_total", "op" => "ttl").increment(1);
                        warn!(stage = "storage", %table, error = %err, "retention delete hit busy timeout");
                        break;
                    }

                    return Err(MaintenanceError::TtlDelete { table, source: err });
                }
            }
        }

        Ok((total_deleted, busy))
    }

    async fn run_checkpoint(&self) -> Result<bool, MaintenanceError> {
        let start = std::time::Instant::now();

        match self.database.wal_checkpoint_truncate().await {
            Ok(stats) => {
                let duration = start.elapsed().as_secs_f64();
                histogram!("db_checkpoint_seconds").record(duration);
                let busy = stats.busy_frames > 0;
                if busy {
                    counter!("db_busy_total", "op" => "checkpoint").increment(1);
                    warn!(
                        stage = "storage",
                        busy_frames = stats.busy_frames,
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed with busy frames"
                    );
                } else {
                    debug!(
                        stage = "storage",
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed"
                    );
                }
                Ok(busy)
            }
            Err(err) if is_sqlite_busy(&err) => {
                counter!("db_busy_total", "op" => "checkpoint").increment(1);
                warn!(stage = "storage", error = %err, "WAL checkpoint hit busy timeout");
                Ok(true)
            }
            Err(err) => Err(MaintenanceError::Checkpoint { source: err }),
        }
    }
}

/// Totals from one maintenance cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaintenanceReport {
    pub dedup_purged: usize,
    pub claims_deleted: u64,
    pub log_deleted: u64,
    pub busy: bool,
}

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("failed to delete expired rows from {table}")]
    TtlDelete {
        table: &'static str,
        #[source]
        source: SqlxError,
    },
    #[error("failed to run WAL checkpoint")]
    Checkpoint {
        #[source]
        source: SqlxError,
    },
}

fn is_sqlite_busy(err: &SqlxError) -> bool {
    match err {
        SqlxError::Database(db_err) => matches!(db_err.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use golive_core::types::{DeliveryClaim, DeliveryRecord};
    use tempfile::TempDir;

    use crate::telemetry;

    async fn setup_db() -> (Database, TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("maint.db").display());
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        (db, dir)
    }

    fn retention() -> RetentionConfig {
        RetentionConfig {
            claim_retention: Duration::from_secs(30 * 24 * 60 * 60),
            dedup_retention: Duration::from_secs(900),
            maintenance_interval: Duration::from_secs(60),
        }
    }

    async fn seed_delivery(db: &Database, event_id: &str, at: DateTime<Utc>) {
        db.claims()
            .try_claim(&DeliveryClaim {
                tenant_id: "t-1".to_string(),
                account_id: "acc-1".to_string(),
                event_id: event_id.to_string(),
                claimed_at: at,
            })
            .await
            .expect("claim");
        db.claims()
            .log_delivery(&DeliveryRecord {
                tenant_id: "t-1".to_string(),
                account_id: "acc-1".to_string(),
                event_id: event_id.to_string(),
                channel_id: "c-1".to_string(),
                message_id: None,
                sent_at: at,
            })
            .await
            .expect("log");
    }

    #[tokio::test]
    async fn run_once_deletes_expired_rows_and_sweeps_dedup() {
        telemetry::init_metrics().expect("metrics");
        let (db, _dir) = setup_db().await;
        let now = Utc::now();

        seed_delivery(&db, "evt-old", now - ChronoDuration::days(31)).await;
        seed_delivery(&db, "evt-new", now - ChronoDuration::days(1)).await;

        let dedup = Arc::new(DedupGuard::new(Duration::from_secs(900)));
        dedup.observe("msg-old", now - ChronoDuration::minutes(20));
        dedup.observe("msg-new", now - ChronoDuration::minutes(1));

        let worker = MaintenanceWorker::new(db.clone(), dedup.clone(), retention())
            .with_clock(Arc::new(move || now));
        let report = worker.run_once().await.expect("run_once");

        assert_eq!(
            report,
            MaintenanceReport {
                dedup_purged: 1,
                claims_deleted: 1,
                log_deleted: 1,
                busy: false,
            }
        );
        assert_eq!(dedup.len(), 1);

        let claims: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM delivery_claims")
            .fetch_one(db.pool())
            .await
            .expect("count claims");
        assert_eq!(claims.0, 1);

        let logged: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM delivery_log")
            .fetch_one(db.pool())
            .await
            .expect("count log");
        assert_eq!(logged.0, 1);
    }

    #[tokio::test]
    async fn expired_claim_no_longer_blocks_a_new_claim() {
        telemetry::init_metrics().expect("metrics");
        let (db, _dir) = setup_db().await;
        let now = Utc::now();
        seed_delivery(&db, "evt-1", now - ChronoDuration::days(40)).await;

        let dedup = Arc::new(DedupGuard::new(Duration::from_secs(900)));
        MaintenanceWorker::new(db.clone(), dedup, retention())
            .with_clock(Arc::new(move || now))
            .run_once()
            .await
            .expect("run_once");

        let outcome = db
            .claims()
            .try_claim(&DeliveryClaim {
                tenant_id: "t-1".to_string(),
                account_id: "acc-1".to_string(),
                event_id: "evt-1".to_string(),
                claimed_at: now,
            })
            .await
            .expect("claim");
        assert!(outcome.is_claimed());
    }
}
