use std::time::Duration;

use reqwest::{
    header::{HeaderValue, RETRY_AFTER},
    Client, StatusCode,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;
use url::Url;

use golive_core::types::RenderedMessage;

const MAX_RETRY_AFTER_SECS: f64 = 3600.0;

/// Bot-token client for posting channel messages.
#[derive(Clone)]
pub struct DiscordClient {
    http: Client,
    base_url: Url,
    bot_token: String,
    rate_limit_budget: Duration,
}

impl DiscordClient {
    /// `rate_limit_budget` caps the total time one send may spend waiting on 429 responses.
    pub fn new(
        bot_token: impl Into<String>,
        base_url: Url,
        http: Client,
        rate_limit_budget: Duration,
    ) -> Self {
        Self {
            http,
            base_url,
            bot_token: bot_token.into(),
            rate_limit_budget,
        }
    }

    /// Posts `message` to `channel_id`, returning the created message id when
    /// the response carries one.
    ///
    /// Rate limited responses are retried after the advertised delay until the
    /// wait budget is spent. Every other non-success status is terminal.
    pub async fn send_message(
        &self,
        channel_id: &str,
        message: &RenderedMessage,
    ) -> Result<Option<String>, DiscordError> {
        if channel_id.is_empty()
            || !channel_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DiscordError::InvalidChannel(channel_id.to_string()));
        }
        let url = self
            .base_url
            .join(&format!("channels/{channel_id}/messages"))?;

        let mut waited = Duration::ZERO;
        loop {
            let response = self
                .http
                .post(url.clone())
                .header("Authorization", format!("Bot {}", self.bot_token))
                .json(message)
                .send()
                .await?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                metrics::counter!("discord_rate_limited_total").increment(1);
                let header = response.headers().get(RETRY_AFTER).cloned();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| String::from("<unavailable>"));
                let Some(wait) = retry_after(header.as_ref(), &body) else {
                    return Err(DiscordError::Status { status, body });
                };
                if waited + wait > self.rate_limit_budget {
                    return Err(DiscordError::RateLimitBudgetExceeded { waited });
                }
                warn!(
                    stage = "delivery",
                    channel_id,
                    retry_after_ms = wait.as_millis() as u64,
                    "rate limited, waiting before retry"
                );
                tokio::time::sleep(wait).await;
                waited += wait;
                continue;
            }

            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| String::from("<unavailable>"));
                return Err(DiscordError::Status { status, body });
            }

            let body = response.text().await?;
            return Ok(serde_json::from_str::<CreatedMessage>(&body)
                .ok()
                .map(|created| created.id));
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedMessage {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    retry_after: f64,
}

/// Reads the advertised delay, preferring the JSON body over the header.
///
/// `None` when the response carries no usable numeric hint.
fn retry_after(header: Option<&HeaderValue>, body: &str) -> Option<Duration> {
    let from_body = serde_json::from_str::<RateLimitBody>(body)
        .ok()
        .map(|parsed| parsed.retry_after);
    let from_header = header
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok());

    from_body
        .or(from_header)
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
        .map(|seconds| Duration::from_secs_f64(seconds.min(MAX_RETRY_AFTER_SECS)))
}

/// Errors produced while posting messages.
#[derive(Debug, Error)]
pub enum DiscordError {
    #[error("invalid channel id: {0:?}")]
    InvalidChannel(String),
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("rate limit wait budget exhausted after {waited:?}")]
    RateLimitBudgetExceeded { waited: Duration },
}
