mod adapters;
mod fanout;
mod maintenance;
mod problem;
mod router;
mod telemetry;
mod twitch_source;
mod webhook;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use reqwest::Client;
use tracing::info;

use golive_discord::DiscordClient;
use golive_storage::Database;
use golive_twitch::{HelixClient, TwitchOAuthClient};
use golive_util::{load_env_file, AppConfig};

use crate::{
    fanout::FanoutCoordinator, maintenance::MaintenanceWorker, twitch_source::HelixLiveSource,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!(stage = "storage", url = %config.database_url, "database ready");

    let http = Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(concat!("golive/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let source = HelixLiveSource::new(
        HelixClient::new(
            config.twitch.client_id.clone(),
            config.twitch.api_base.clone(),
            http.clone(),
        ),
        TwitchOAuthClient::new(
            config.twitch.client_id.clone(),
            config.twitch.client_secret.clone(),
            config.twitch.oauth_base.clone(),
            http.clone(),
        ),
    );
    let sender = DiscordClient::new(
        config.discord.bot_token.clone(),
        config.discord.api_base.clone(),
        http,
        config.discord.rate_limit_budget,
    );

    let fanout = FanoutCoordinator::new(
        Arc::new(source),
        Arc::new(database.clone()),
        Arc::new(database.clone()),
        Arc::new(sender),
        config.fanout_concurrency,
    );

    let state = router::AppState::new(
        metrics,
        Arc::from(config.twitch.webhook_secret.as_bytes()),
        config.retention.dedup_retention,
        Arc::new(fanout),
    );

    let maintenance = MaintenanceWorker::new(
        database.clone(),
        state.dedup().clone(),
        config.retention,
    )
    .spawn();

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), concurrency = config.fanout_concurrency, "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    maintenance.abort();
    info!(stage = "app", "server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(stage = "app", error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!(stage = "app", "shutdown signal received");
}
