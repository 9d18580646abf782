use std::{error::Error as StdError, sync::Arc, time::Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use golive_core::{
    template::{MessageTemplate, RenderContext},
    types::{
        AccountProfile, DeliveryClaim, DeliveryRecord, LiveEvent, LiveStream, RenderedMessage,
        TenantConfig, TrackedAccount,
    },
};

pub type CollaboratorError = Box<dyn StdError + Send + Sync>;
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Upstream platform data that is not carried by the webhook payload.
#[async_trait]
pub trait LiveDataSource: Send + Sync {
    /// `None` when the account is not currently live.
    async fn fetch_live_stream(
        &self,
        twitch_user_id: &str,
    ) -> Result<Option<LiveStream>, CollaboratorError>;

    async fn fetch_profile(
        &self,
        twitch_user_id: &str,
    ) -> Result<Option<AccountProfile>, CollaboratorError>;
}

/// Read side of accounts, tenants and tracking links.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn resolve_account(
        &self,
        twitch_user_id: &str,
    ) -> Result<Option<TrackedAccount>, CollaboratorError>;

    async fn refresh_account(
        &self,
        account_id: &str,
        profile: &AccountProfile,
        now: DateTime<Utc>,
    ) -> Result<(), CollaboratorError>;

    /// Tenants tracking the account with the tracking link enabled.
    async fn list_tracking_tenants(&self, account_id: &str)
        -> Result<Vec<String>, CollaboratorError>;

    async fn tenant_config(&self, tenant_id: &str) -> Result<TenantConfig, CollaboratorError>;

    async fn account_override(
        &self,
        tenant_id: &str,
        account_id: &str,
    ) -> Result<Option<String>, CollaboratorError>;
}

/// Durable `(tenant, event)` uniqueness ledger.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Returns `true` only for the single caller that inserted the claim.
    async fn try_claim(&self, claim: &DeliveryClaim) -> Result<bool, CollaboratorError>;

    async fn log_delivery(&self, record: &DeliveryRecord) -> Result<(), CollaboratorError>;
}

/// Outbound chat platform delivery.
#[async_trait]
pub trait ChatSender: Send + Sync {
    /// Returns the platform message id when one is reported.
    async fn send(
        &self,
        channel_id: &str,
        message: &RenderedMessage,
    ) -> Result<Option<String>, CollaboratorError>;
}

/// Distributes one live event to every tenant tracking the account.
pub struct FanoutCoordinator {
    source: Arc<dyn LiveDataSource>,
    directory: Arc<dyn TenantDirectory>,
    claims: Arc<dyn ClaimStore>,
    sender: Arc<dyn ChatSender>,
    concurrency: usize,
    clock: Clock,
}

impl FanoutCoordinator {
    pub fn new(
        source: Arc<dyn LiveDataSource>,
        directory: Arc<dyn TenantDirectory>,
        claims: Arc<dyn ClaimStore>,
        sender: Arc<dyn ChatSender>,
        concurrency: usize,
    ) -> Self {
        Self {
            source,
            directory,
            claims,
            sender,
            concurrency: concurrency.max(1),
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the fanout for `event`.
    ///
    /// Only the shared lookups (stream, account, tenant list) fail the whole
    /// call; every tenant failure is contained in the returned report.
    pub async fn dispatch(&self, event: &LiveEvent) -> Result<FanoutReport, FanoutError> {
        let start = Instant::now();
        let broadcaster = event.broadcaster_user_id.as_str();
        debug!(
            stage = "fanout",
            event_id = %event.event_id,
            broadcaster_user_id = broadcaster,
            broadcaster_login = %event.broadcaster_login,
            started_at = %event.started_at.to_rfc3339(),
            "dispatching live event"
        );

        let live_stream = self
            .source
            .fetch_live_stream(broadcaster)
            .await
            .map_err(FanoutError::StreamLookup)?
            .ok_or_else(|| FanoutError::StreamOffline {
                broadcaster_user_id: broadcaster.to_string(),
                login: event.broadcaster_login.clone(),
            })?;

        let account = self
            .directory
            .resolve_account(broadcaster)
            .await
            .map_err(FanoutError::AccountLookup)?
            .ok_or_else(|| FanoutError::AccountNotTracked {
                broadcaster_user_id: broadcaster.to_string(),
                login: event.broadcaster_login.clone(),
            })?;
        let account = self.refresh_profile(account).await;

        let tenant_ids = self
            .directory
            .list_tracking_tenants(&account.id)
            .await
            .map_err(FanoutError::TenantLookup)?;

        let account = &account;
        let live_stream = &live_stream;
        let outcomes: Vec<(String, TenantOutcome)> = stream::iter(tenant_ids)
            .map(|tenant_id| async move {
                let outcome = self.deliver(event, account, live_stream, &tenant_id).await;
                counter!("fanout_tenant_outcomes_total", "outcome" => outcome.metric_label())
                    .increment(1);
                (tenant_id, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let report = FanoutReport::from_outcomes(event.event_id.clone(), outcomes);
        histogram!("fanout_duration_seconds").record(start.elapsed().as_secs_f64());
        info!(
            stage = "fanout",
            event_id = %event.event_id,
            account_id = %account.id,
            tenants = report.tenants(),
            sent = report.sent,
            disabled = report.disabled,
            claim_lost = report.claim_lost,
            failed = report.failed,
            "fanout completed"
        );
        Ok(report)
    }

    async fn refresh_profile(&self, account: TrackedAccount) -> TrackedAccount {
        let profile = match self.source.fetch_profile(&account.twitch_user_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => return account,
            Err(err) => {
                warn!(stage = "fanout", account_id = %account.id, error = %err, "profile refresh failed, using stored metadata");
                return account;
            }
        };

        if let Err(err) = self
            .directory
            .refresh_account(&account.id, &profile, (self.clock)())
            .await
        {
            warn!(stage = "storage", account_id = %account.id, error = %err, "failed to persist refreshed profile");
        }
        account.with_profile(&profile)
    }

    async fn deliver(
        &self,
        event: &LiveEvent,
        account: &TrackedAccount,
        stream: &LiveStream,
        tenant_id: &str,
    ) -> TenantOutcome {
        let config = match self.directory.tenant_config(tenant_id).await {
            Ok(config) => config,
            Err(err) => {
                error!(stage = "fanout", tenant_id, event_id = %event.event_id, error = %err, "failed to load tenant config");
                return TenantOutcome::Failed(FailureStage::Config);
            }
        };
        if !config.enabled {
            debug!(stage = "fanout", tenant_id, "tenant disabled, skipping");
            return TenantOutcome::Disabled;
        }

        let claim = DeliveryClaim {
            tenant_id: tenant_id.to_string(),
            account_id: account.id.clone(),
            event_id: event.event_id.clone(),
            claimed_at: (self.clock)(),
        };
        match self.claims.try_claim(&claim).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(stage = "claim", tenant_id, event_id = %event.event_id, "claim held elsewhere, skipping");
                return TenantOutcome::ClaimLost;
            }
            Err(err) => {
                error!(stage = "claim", tenant_id, event_id = %event.event_id, error = %err, "claim attempt failed");
                return TenantOutcome::Failed(FailureStage::Claim);
            }
        }

        let content_override = match self.directory.account_override(tenant_id, &account.id).await {
            Ok(text) => text,
            Err(err) => {
                error!(stage = "fanout", tenant_id, event_id = %event.event_id, error = %err, "failed to load account override");
                return TenantOutcome::Failed(FailureStage::Config);
            }
        };

        let message = match MessageTemplate::from_json(&config.template_json) {
            Ok(template) => {
                let context =
                    RenderContext::new(account, stream, config.mention_role_id.as_deref());
                template.render(&context, content_override.as_deref())
            }
            Err(err) => {
                error!(stage = "render", tenant_id, event_id = %event.event_id, error = %err, "stored template is malformed");
                return TenantOutcome::Failed(FailureStage::Render);
            }
        };

        let message_id = match self.sender.send(&config.channel_id, &message).await {
            Ok(message_id) => message_id,
            Err(err) => {
                error!(stage = "delivery", tenant_id, event_id = %event.event_id, channel_id = %config.channel_id, error = %err, "delivery failed");
                return TenantOutcome::Failed(FailureStage::Delivery);
            }
        };

        let record = DeliveryRecord {
            tenant_id: tenant_id.to_string(),
            account_id: account.id.clone(),
            event_id: event.event_id.clone(),
            channel_id: config.channel_id.clone(),
            message_id,
            sent_at: (self.clock)(),
        };
        if let Err(err) = self.claims.log_delivery(&record).await {
            warn!(stage = "claim", tenant_id, event_id = %event.event_id, error = %err, "audit log write failed");
        }

        info!(stage = "delivery", tenant_id, event_id = %event.event_id, channel_id = %config.channel_id, "notification sent");
        TenantOutcome::Sent
    }
}

/// Result of processing one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantOutcome {
    Sent,
    Disabled,
    ClaimLost,
    Failed(FailureStage),
}

impl TenantOutcome {
    pub fn metric_label(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Disabled => "disabled",
            Self::ClaimLost => "claim_lost",
            Self::Failed(stage) => stage.metric_label(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Config,
    Claim,
    Render,
    Delivery,
}

impl FailureStage {
    fn metric_label(self) -> &'static str {
        match self {
            Self::Config => "config_failed",
            Self::Claim => "claim_failed",
            Self::Render => "render_failed",
            Self::Delivery => "delivery_failed",
        }
    }
}

/// Aggregate of independent per-tenant outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    pub event_id: String,
    pub sent: usize,
    pub disabled: usize,
    pub claim_lost: usize,
    pub failed: usize,
    pub outcomes: Vec<(String, TenantOutcome)>,
}

impl FanoutReport {
    fn from_outcomes(event_id: String, outcomes: Vec<(String, TenantOutcome)>) -> Self {
        let count = |wanted: fn(&TenantOutcome) -> bool| {
            outcomes.iter().filter(|(_, outcome)| wanted(outcome)).count()
        };
        Self {
            sent: count(|outcome| matches!(outcome, TenantOutcome::Sent)),
            disabled: count(|outcome| matches!(outcome, TenantOutcome::Disabled)),
            claim_lost: count(|outcome| matches!(outcome, TenantOutcome::ClaimLost)),
            failed: count(|outcome| matches!(outcome, TenantOutcome::Failed(_))),
            event_id,
            outcomes,
        }
    }

    pub fn tenants(&self) -> usize {
        self.outcomes.len()
    }

    pub fn outcome_for(&self, tenant_id: &str) -> Option<TenantOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == tenant_id)
            .map(|(_, outcome)| *outcome)
    }
}

/// Failures of the shared lookups that precede the per-tenant loop.
#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("failed to fetch live stream attributes: {0}")]
    StreamLookup(#[source] CollaboratorError),
    #[error("no live stream found for {login} ({broadcaster_user_id})")]
    StreamOffline {
        broadcaster_user_id: String,
        login: String,
    },
    #[error("failed to resolve tracked account: {0}")]
    AccountLookup(#[source] CollaboratorError),
    #[error("{login} ({broadcaster_user_id}) is not a tracked account")]
    AccountNotTracked {
        broadcaster_user_id: String,
        login: String,
    },
    #[error("failed to list tracking tenants: {0}")]
    TenantLookup(#[source] CollaboratorError),
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::{
        collections::{HashMap, HashSet},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    pub fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T12:31:00Z")
            .expect("fixed time")
            .with_timezone(&Utc)
    }

    pub fn live_stream() -> LiveStream {
        LiveStream {
            id: "stream-1".to_string(),
            title: "hello world".to_string(),
            category: "Just Chatting".to_string(),
            viewer_count: 42,
            thumbnail_url_template: "https://static/foo-{width}x{height}.jpg".to_string(),
            started_at: DateTime::parse_from_rfc3339("2024-01-01T12:30:00Z")
                .expect("started")
                .with_timezone(&Utc),
        }
    }

    pub fn account() -> TrackedAccount {
        TrackedAccount {
            id: "acc-1".to_string(),
            twitch_user_id: "1001".to_string(),
            login: "foo".to_string(),
            display_name: "Foo".to_string(),
            avatar_url: None,
        }
    }

    pub fn live_event(event_id: &str) -> LiveEvent {
        LiveEvent {
            event_id: event_id.to_string(),
            broadcaster_user_id: "1001".to_string(),
            broadcaster_login: "foo".to_string(),
            started_at: live_stream().started_at,
        }
    }

    pub fn tenant(tenant_id: &str, channel_id: &str, enabled: bool) -> TenantConfig {
        TenantConfig {
            tenant_id: tenant_id.to_string(),
            channel_id: channel_id.to_string(),
            mention_role_id: None,
            template_json: MessageTemplate::default().to_json().expect("template"),
            enabled,
        }
    }

    #[derive(Default)]
    pub struct FakeSource {
        pub stream: Option<LiveStream>,
        pub profile: Option<AccountProfile>,
        pub fail_stream: bool,
        pub stream_calls: AtomicUsize,
    }

    #[async_trait]
    impl LiveDataSource for FakeSource {
        async fn fetch_live_stream(
            &self,
            _twitch_user_id: &str,
        ) -> Result<Option<LiveStream>, CollaboratorError> {
            self.stream_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_stream {
                return Err("helix unavailable".into());
            }
            Ok(self.stream.clone())
        }

        async fn fetch_profile(
            &self,
            _twitch_user_id: &str,
        ) -> Result<Option<AccountProfile>, CollaboratorError> {
            Ok(self.profile.clone())
        }
    }

    #[derive(Default)]
    pub struct FakeDirectory {
        pub account: Option<TrackedAccount>,
        pub tenants: Vec<TenantConfig>,
        pub overrides: HashMap<String, String>,
        pub broken_configs: HashSet<String>,
        pub refreshed: Mutex<Vec<AccountProfile>>,
    }

    #[async_trait]
    impl TenantDirectory for FakeDirectory {
        async fn resolve_account(
            &self,
            _twitch_user_id: &str,
        ) -> Result<Option<TrackedAccount>, CollaboratorError> {
            Ok(self.account.clone())
        }

        async fn refresh_account(
            &self,
            _account_id: &str,
            profile: &AccountProfile,
            _now: DateTime<Utc>,
        ) -> Result<(), CollaboratorError> {
            self.refreshed.lock().expect("lock").push(profile.clone());
            Ok(())
        }

        async fn list_tracking_tenants(
            &self,
            _account_id: &str,
        ) -> Result<Vec<String>, CollaboratorError> {
            Ok(self.tenants.iter().map(|t| t.tenant_id.clone()).collect())
        }

        async fn tenant_config(&self, tenant_id: &str) -> Result<TenantConfig, CollaboratorError> {
            if self.broken_configs.contains(tenant_id) {
                return Err("config unavailable".into());
            }
            self.tenants
                .iter()
                .find(|t| t.tenant_id == tenant_id)
                .cloned()
                .ok_or_else(|| "tenant not found".into())
        }

        async fn account_override(
            &self,
            tenant_id: &str,
            _account_id: &str,
        ) -> Result<Option<String>, CollaboratorError> {
            Ok(self.overrides.get(tenant_id).cloned())
        }
    }

    #[derive(Default)]
    pub struct FakeClaims {
        pub claimed: Mutex<HashSet<(String, String)>>,
        pub attempts: Mutex<Vec<String>>,
        pub log: Mutex<Vec<DeliveryRecord>>,
        pub fail_log: bool,
    }

    #[async_trait]
    impl ClaimStore for FakeClaims {
        async fn try_claim(&self, claim: &DeliveryClaim) -> Result<bool, CollaboratorError> {
            self.attempts
                .lock()
                .expect("lock")
                .push(claim.tenant_id.clone());
            Ok(self
                .claimed
                .lock()
                .expect("lock")
                .insert((claim.tenant_id.clone(), claim.event_id.clone())))
        }

        async fn log_delivery(&self, record: &DeliveryRecord) -> Result<(), CollaboratorError> {
            if self.fail_log {
                return Err("audit table unavailable".into());
            }
            self.log.lock().expect("lock").push(record.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeSender {
        pub sent: Mutex<Vec<(String, RenderedMessage)>>,
        pub failing_channels: HashSet<String>,
    }

    impl FakeSender {
        pub fn sent_channels(&self) -> Vec<String> {
            let mut channels: Vec<String> = self
                .sent
                .lock()
                .expect("lock")
                .iter()
                .map(|(channel, _)| channel.clone())
                .collect();
            channels.sort();
            channels
        }
    }

    #[async_trait]
    impl ChatSender for FakeSender {
        async fn send(
            &self,
            channel_id: &str,
            message: &RenderedMessage,
        ) -> Result<Option<String>, CollaboratorError> {
            if self.failing_channels.contains(channel_id) {
                return Err("connection reset".into());
            }
            self.sent
                .lock()
                .expect("lock")
                .push((channel_id.to_string(), message.clone()));
            Ok(Some(format!("msg-{channel_id}")))
        }
    }

    pub struct Fakes {
        pub source: Arc<FakeSource>,
        pub directory: Arc<FakeDirectory>,
        pub claims: Arc<FakeClaims>,
        pub sender: Arc<FakeSender>,
    }

    impl Fakes {
        pub fn new(tenants: Vec<TenantConfig>) -> Self {
            Self {
                source: Arc::new(FakeSource {
                    stream: Some(live_stream()),
                    ..FakeSource::default()
                }),
                directory: Arc::new(FakeDirectory {
                    account: Some(account()),
                    tenants,
                    ..FakeDirectory::default()
                }),
                claims: Arc::new(FakeClaims::default()),
                sender: Arc::new(FakeSender::default()),
            }
        }

        pub fn fail_channel(&mut self, channel_id: &str) {
            self.sender = Arc::new(FakeSender {
                failing_channels: [channel_id.to_string()].into_iter().collect(),
                ..FakeSender::default()
            });
        }

        pub fn coordinator(&self) -> FanoutCoordinator {
            FanoutCoordinator::new(
                self.source.clone(),
                self.directory.clone(),
                self.claims.clone(),
                self.sender.clone(),
                4,
            )
            .with_clock(Arc::new(fixed_now))
        }
    }
}
