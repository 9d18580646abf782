use std::{
    sync::{Mutex, OnceLock, PoisonError},
    time::Instant,
};

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self as tracing_fmt, time::UtcTime},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

use golive_util::{AppConfig, Environment};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize tracing: {0}")]
    Tracing(#[from] TryInitError),
    #[error("failed to initialize prometheus recorder: {0}")]
    Metrics(#[from] BuildError),
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_INSTALL_GUARD: Mutex<()> = Mutex::new(());
static START_TIME: OnceLock<Instant> = OnceLock::new();

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

/// Every metric the service emits, described once when the recorder is installed.
const METRIC_CATALOGUE: &[(MetricKind, &str, &str)] = &[
    (
        MetricKind::Counter,
        "eventsub_ingress_total",
        "Authenticated EventSub webhook requests, labelled by message type",
    ),
    (
        MetricKind::Counter,
        "eventsub_invalid_signature_total",
        "EventSub webhook requests rejected due to invalid signatures",
    ),
    (
        MetricKind::Counter,
        "eventsub_duplicate_total",
        "Notifications skipped because the message id was already seen",
    ),
    (
        MetricKind::Histogram,
        "webhook_ack_latency_seconds",
        "Seconds taken to answer EventSub webhook requests, labelled by message type",
    ),
    (
        MetricKind::Counter,
        "fanout_tenant_outcomes_total",
        "Per-tenant fanout results, labelled by outcome",
    ),
    (
        MetricKind::Histogram,
        "fanout_duration_seconds",
        "Seconds spent fanning one live event out to its tenants",
    ),
    (
        MetricKind::Counter,
        "discord_rate_limited_total",
        "Rate limited responses received from the chat platform",
    ),
    (
        MetricKind::Gauge,
        "dedup_entries",
        "Message ids currently held by the in-process dedup guard",
    ),
    (
        MetricKind::Counter,
        "db_ttl_deleted_total",
        "Rows deleted by retention sweeps, labelled by table",
    ),
    (
        MetricKind::Histogram,
        "db_checkpoint_seconds",
        "Duration of WAL checkpoint operations in seconds",
    ),
    (
        MetricKind::Counter,
        "db_busy_total",
        "SQLite busy conditions hit by maintenance, labelled by operation",
    ),
];

fn build_git_sha() -> &'static str {
    option_env!("GIT_SHA").unwrap_or("unknown")
}

/// Filter used when `RUST_LOG` is unset. sqlx statement logging is noisy at info.
fn default_filter(environment: Environment) -> &'static str {
    match environment {
        Environment::Development => "debug,sqlx=warn,hyper=info,httpmock=info",
        Environment::Test | Environment::Production => "info,sqlx=warn",
    }
}

pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryError> {
    if TRACING_INIT.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(config.environment)));
    let registry = tracing_subscriber::registry().with(env_filter);
    let base = tracing_fmt::layer()
        .with_target(false)
        .with_level(true)
        .with_timer(UtcTime::rfc_3339());

    if config.environment == Environment::Production {
        registry.with(base.json()).try_init()?;
    } else {
        registry
            .with(base.event_format(tracing_fmt::format().pretty()))
            .try_init()?;
    }

    TRACING_INIT.set(()).ok();
    tracing::info!(
        stage = "telemetry",
        env = %config.environment.as_str(),
        version = BUILD_VERSION,
        git_sha = build_git_sha(),
        "tracing initialized"
    );
    Ok(())
}

/// Installs the Prometheus recorder once per process and returns its handle.
pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let _guard = METRICS_INSTALL_GUARD
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    METRICS_HANDLE.set(handle.clone()).ok();

    for (kind, name, description) in METRIC_CATALOGUE {
        match kind {
            MetricKind::Counter => describe_counter!(*name, *description),
            MetricKind::Gauge => describe_gauge!(*name, *description),
            MetricKind::Histogram => describe_histogram!(*name, *description),
        }
    }
    START_TIME.get_or_init(Instant::now);

    Ok(handle)
}

/// Renders the recorder output followed by build and uptime gauges.
pub fn render_metrics(handle: &PrometheusHandle) -> String {
    let mut body = handle.render();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }

    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs_f64())
        .unwrap_or_default();
    body.push_str(&format!(
        "# TYPE app_build_info gauge\n\
         app_build_info{{version=\"{BUILD_VERSION}\",git=\"{}\"}} 1\n\
         # TYPE app_uptime_seconds gauge\n\
         app_uptime_seconds {uptime}\n",
        build_git_sha()
    ));

    body
}
