use std::{borrow::Cow, str::FromStr, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Row, SqlitePool,
};
use thiserror::Error;
use uuid::Uuid;

use golive_core::types::{
    AccountProfile, DeliveryClaim, DeliveryRecord, TenantConfig, TrackedAccount,
};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    ///
    /// Pragmas are applied per connection so every pooled connection waits on
    /// locks instead of failing immediately with `SQLITE_BUSY`.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for tracked account records.
    pub fn accounts(&self) -> AccountRepository {
        AccountRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for tenant notification settings.
    pub fn tenants(&self) -> TenantRepository {
        TenantRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for tenant ↔ account tracking links.
    pub fn tracking(&self) -> TrackingRepository {
        TrackingRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the delivery claim ledger and its audit log.
    pub fn claims(&self) -> ClaimRepository {
        ClaimRepository {
            pool: self.pool.clone(),
        }
    }

    /// Runs `PRAGMA wal_checkpoint(TRUNCATE)` and reports the frame counters.
    pub async fn wal_checkpoint_truncate(&self) -> Result<CheckpointStats, sqlx::Error> {
        let row = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE);")
            .fetch_one(&self.pool)
            .await?;

        Ok(CheckpointStats {
            busy_frames: row.try_get::<i64, _>(0)?,
            log_frames: row.try_get::<i64, _>(1)?,
            checkpointed_frames: row.try_get::<i64, _>(2)?,
        })
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Result of a WAL checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    pub busy_frames: i64,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for upstream accounts being watched.
#[derive(Clone)]
pub struct AccountRepository {
    pool: SqlitePool,
}

impl AccountRepository {
    /// Creates the account on first link, or refreshes its metadata when it exists.
    pub async fn upsert(
        &self,
        profile: &AccountProfile,
        now: DateTime<Utc>,
    ) -> Result<TrackedAccount, AccountError> {
        let timestamp = to_rfc3339(now);
        let row = sqlx::query_as::<_, AccountRow>(
            "INSERT INTO tracked_accounts \
             (id, twitch_user_id, login, display_name, avatar_url, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(twitch_user_id) DO UPDATE \
             SET login = excluded.login, \
                 display_name = excluded.display_name, \
                 avatar_url = COALESCE(excluded.avatar_url, tracked_accounts.avatar_url), \
                 updated_at = excluded.updated_at \
             RETURNING id, twitch_user_id, login, display_name, avatar_url",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&profile.twitch_user_id)
        .bind(&profile.login)
        .bind(&profile.display_name)
        .bind(&profile.avatar_url)
        .bind(&timestamp)
        .bind(&timestamp)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into_domain())
    }

    /// Looks an account up by its upstream user id.
    pub async fn find_by_twitch_id(
        &self,
        twitch_user_id: &str,
    ) -> Result<Option<TrackedAccount>, AccountError> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT id, twitch_user_id, login, display_name, avatar_url \
             FROM tracked_accounts WHERE twitch_user_id = ?",
        )
        .bind(twitch_user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(AccountRow::into_domain))
    }

    /// Overwrites the stored metadata with a freshly fetched profile.
    pub async fn update_profile(
        &self,
        account_id: &str,
        profile: &AccountProfile,
        now: DateTime<Utc>,
    ) -> Result<(), AccountError> {
        let result = sqlx::query(
            "UPDATE tracked_accounts \
             SET login = ?, display_name = ?, avatar_url = COALESCE(?, avatar_url), updated_at = ? \
             WHERE id = ?",
        )
        .bind(&profile.login)
        .bind(&profile.display_name)
        .bind(&profile.avatar_url)
        .bind(to_rfc3339(now))
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AccountError::NotFound);
        }
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: String,
    twitch_user_id: String,
    login: String,
    display_name: String,
    avatar_url: Option<String>,
}

impl AccountRow {
    fn into_domain(self) -> TrackedAccount {
        TrackedAccount {
            id: self.id,
            twitch_user_id: self.twitch_user_id,
            login: self.login,
            display_name: self.display_name,
            avatar_url: self.avatar_url,
        }
    }
}

/// Errors that can occur while reading or writing accounts.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("account not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for tenant notification settings.
#[derive(Clone)]
pub struct TenantRepository {
    pool: SqlitePool,
}

impl TenantRepository {
    /// Creates or replaces a tenant's settings.
    pub async fn upsert(&self, tenant: &NewTenant<'_>) -> Result<(), TenantError> {
        let timestamp = to_rfc3339(tenant.now);
        sqlx::query(
            "INSERT INTO tenants \
             (id, channel_id, mention_role_id, template_json, enabled, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE \
             SET channel_id = excluded.channel_id, \
                 mention_role_id = excluded.mention_role_id, \
                 template_json = excluded.template_json, \
                 enabled = excluded.enabled, \
                 updated_at = excluded.updated_at",
        )
        .bind(tenant.tenant_id)
        .bind(tenant.channel_id)
        .bind(tenant.mention_role_id)
        .bind(tenant.template_json.as_ref())
        .bind(i64::from(tenant.enabled))
        .bind(&timestamp)
        .bind(&timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Loads the notification settings for one tenant.
    pub async fn fetch_config(&self, tenant_id: &str) -> Result<TenantConfig, TenantError> {
        let row = sqlx::query(
            "SELECT id, channel_id, mention_role_id, template_json, enabled \
             FROM tenants WHERE id = ?",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(TenantError::NotFound)?;

        Ok(TenantConfig {
            tenant_id: row.get("id"),
            channel_id: row.get("channel_id"),
            mention_role_id: row.get("mention_role_id"),
            template_json: row.get("template_json"),
            enabled: row.get::<i64, _>("enabled") != 0,
        })
    }
}

/// Data required to create or replace a tenant.
pub struct NewTenant<'a> {
    pub tenant_id: &'a str,
    pub channel_id: &'a str,
    pub mention_role_id: Option<&'a str>,
    pub template_json: Cow<'a, str>,
    pub enabled: bool,
    pub now: DateTime<Utc>,
}

/// Errors that can occur while reading tenants.
#[derive(Debug, Error)]
pub enum TenantError {
    #[error("tenant not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the many-to-many tenant ↔ account relation.
#[derive(Clone)]
pub struct TrackingRepository {
    pool: SqlitePool,
}

impl TrackingRepository {
    /// Links an account to a tenant, replacing link attributes when it already exists.
    pub async fn link(&self, link: &NewTrackingLink<'_>) -> Result<(), TrackingError> {
        sqlx::query(
            "INSERT INTO tenant_accounts \
             (tenant_id, account_id, added_by, custom_message, enabled, created_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(tenant_id, account_id) DO UPDATE \
             SET added_by = excluded.added_by, \
                 custom_message = excluded.custom_message, \
                 enabled = excluded.enabled",
        )
        .bind(link.tenant_id)
        .bind(link.account_id)
        .bind(link.added_by)
        .bind(link.custom_message)
        .bind(i64::from(link.enabled))
        .bind(to_rfc3339(link.now))
        .execute(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("787") => {
                TrackingError::MissingParent
            }
            other => TrackingError::Database(other),
        })?;

        Ok(())
    }

    /// Lists tenants tracking the account with the link enabled. The tenant's
    /// own `enabled` flag is not applied here.
    pub async fn list_tenants_tracking(
        &self,
        account_id: &str,
    ) -> Result<Vec<String>, TrackingError> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT tenant_id FROM tenant_accounts \
             WHERE account_id = ? AND enabled = 1 \
             ORDER BY created_at ASC, tenant_id ASC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Returns the per-tenant custom text for the account, when one is set.
    pub async fn fetch_override(
        &self,
        tenant_id: &str,
        account_id: &str,
    ) -> Result<Option<String>, TrackingError> {
        let value = sqlx::query_scalar::<_, Option<String>>(
            "SELECT custom_message FROM tenant_accounts WHERE tenant_id = ? AND account_id = ?",
        )
        .bind(tenant_id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value.flatten().filter(|text| !text.trim().is_empty()))
    }
}

/// Data required to link an account to a tenant.
pub struct NewTrackingLink<'a> {
    pub tenant_id: &'a str,
    pub account_id: &'a str,
    pub added_by: &'a str,
    pub custom_message: Option<&'a str>,
    pub enabled: bool,
    pub now: DateTime<Utc>,
}

/// Errors that can occur while mutating tracking links.
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("tenant or account does not exist")]
    MissingParent,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for delivery claims and the audit log of completed sends.
#[derive(Clone)]
pub struct ClaimRepository {
    pool: SqlitePool,
}

impl ClaimRepository {
    /// Attempts to become the single sender for `(tenant, event)`.
    ///
    /// Relies on the primary key conflict inside one statement; there is no
    /// separate existence check.
    pub async fn try_claim(&self, claim: &DeliveryClaim) -> Result<ClaimOutcome, ClaimError> {
        let result = sqlx::query(
            "INSERT INTO delivery_claims (tenant_id, event_id, account_id, claimed_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(tenant_id, event_id) DO NOTHING",
        )
        .bind(&claim.tenant_id)
        .bind(&claim.event_id)
        .bind(&claim.account_id)
        .bind(to_rfc3339(claim.claimed_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(ClaimOutcome::Claimed)
        } else {
            Ok(ClaimOutcome::AlreadyClaimed)
        }
    }

    /// Appends an audit entry for a completed send.
    pub async fn log_delivery(&self, record: &DeliveryRecord) -> Result<(), ClaimError> {
        sqlx::query(
            "INSERT INTO delivery_log \
             (id, tenant_id, account_id, event_id, channel_id, message_id, sent_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&record.tenant_id)
        .bind(&record.account_id)
        .bind(&record.event_id)
        .bind(&record.channel_id)
        .bind(&record.message_id)
        .bind(to_rfc3339(record.sent_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Deletes up to `limit` claims claimed before `threshold`.
    pub async fn delete_claims_older_than_batch(
        &self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM delivery_claims WHERE rowid IN \
             (SELECT rowid FROM delivery_claims WHERE claimed_at < ? LIMIT ?)",
        )
        .bind(to_rfc3339(threshold))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Deletes up to `limit` audit entries sent before `threshold`.
    pub async fn delete_log_older_than_batch(
        &self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM delivery_log WHERE rowid IN \
             (SELECT rowid FROM delivery_log WHERE sent_at < ? LIMIT ?)",
        )
        .bind(to_rfc3339(threshold))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Result of attempting to claim a `(tenant, event)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyClaimed,
}

impl ClaimOutcome {
    pub fn is_claimed(self) -> bool {
        matches!(self, Self::Claimed)
    }
}

/// Errors produced by the claim ledger.
#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
