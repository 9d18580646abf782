use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap},
    response::Response,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use metrics::{counter, gauge, histogram};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};

use golive_core::envelope::{Envelope, MessageType};

use crate::problem::Rejection;
use crate::router::AppState;

const HEADER_MESSAGE_ID: &str = "twitch-eventsub-message-id";
const HEADER_TIMESTAMP: &str = "twitch-eventsub-message-timestamp";
const HEADER_SIGNATURE: &str = "twitch-eventsub-message-signature";
const HEADER_MESSAGE_TYPE: &str = "twitch-eventsub-message-type";

const MAX_TIMESTAMP_SKEW_SECS: i64 = 600;

pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Rejection> {
    let start = Instant::now();
    let result = process(&state, &headers, &body).await;
    let label = headers
        .get(HEADER_MESSAGE_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| MessageType::try_from(value).ok())
        .map(MessageType::metric_label)
        .unwrap_or("unknown");
    histogram!("webhook_ack_latency_seconds", "type" => label)
        .record(start.elapsed().as_secs_f64());
    result
}

async fn process(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, Rejection> {
    let message_type_raw = headers
        .get(HEADER_MESSAGE_TYPE)
        .and_then(|value| value.to_str().ok())
        .ok_or(Rejection::MissingMessageType)?;
    let message_type = MessageType::try_from(message_type_raw)
        .map_err(|err| Rejection::InvalidMessageType(err.to_string()))?;

    let message_id = required_auth_header(headers, HEADER_MESSAGE_ID)?;
    let timestamp_raw = required_auth_header(headers, HEADER_TIMESTAMP)?;
    let signature = required_auth_header(headers, HEADER_SIGNATURE)?;

    let now = state.now();
    let timestamp = parse_timestamp(timestamp_raw).map_err(|detail| {
        warn!(stage = "ingress", security = true, message_id, timestamp = timestamp_raw, "unparseable message timestamp");
        Rejection::InvalidTimestamp(detail)
    })?;
    let skew = now.signed_duration_since(timestamp).num_seconds().abs();
    if skew > MAX_TIMESTAMP_SKEW_SECS {
        warn!(
            stage = "ingress",
            security = true,
            message_id,
            timestamp = timestamp_raw,
            now = %now.to_rfc3339(),
            skew_seconds = skew,
            "timestamp outside ±10 minute window"
        );
        return Err(Rejection::TimestampOutOfRange);
    }

    if !verify_signature(state.webhook_secret(), message_id, timestamp_raw, body, signature) {
        counter!("eventsub_invalid_signature_total").increment(1);
        warn!(stage = "ingress", security = true, message_id, "webhook signature mismatch");
        return Err(Rejection::InvalidSignature);
    }

    counter!("eventsub_ingress_total", "type" => message_type.metric_label()).increment(1);

    let envelope = Envelope::parse(message_type, body)?;

    match envelope {
        Envelope::Verification {
            challenge,
            subscription,
        } => {
            info!(stage = "ingress", message_id, subscription_id = %subscription.id, subscription_type = %subscription.kind, "subscription verification answered");
            Ok(text_response(challenge))
        }
        Envelope::Revocation { subscription } => {
            warn!(
                stage = "ingress",
                message_id,
                subscription_id = %subscription.id,
                subscription_type = %subscription.kind,
                status = subscription.status.as_deref().unwrap_or("unknown"),
                "subscription revoked"
            );
            Ok(empty_response())
        }
        Envelope::Notification { .. } => {
            let Some(event) = envelope.stream_online()? else {
                info!(stage = "ingress", message_id, subscription_type = %envelope.subscription().kind, "ignoring unsupported notification type");
                return Ok(empty_response());
            };

            let already_seen = state.dedup().observe(message_id, now);
            gauge!("dedup_entries").set(state.dedup().len() as f64);
            if already_seen {
                counter!("eventsub_duplicate_total").increment(1);
                info!(stage = "ingress", message_id, "duplicate delivery skipped");
                return Ok(empty_response());
            }

            let live_event = event.into_live_event();
            match state.fanout().dispatch(&live_event).await {
                Ok(report) => {
                    info!(stage = "ingress", message_id, event_id = %live_event.event_id, sent = report.sent, failed = report.failed, "notification processed");
                }
                Err(err) => {
                    error!(stage = "fanout", message_id, event_id = %live_event.event_id, broadcaster_user_id = %live_event.broadcaster_user_id, error = %err, "fanout aborted");
                }
            }
            Ok(empty_response())
        }
    }
}

/// Checks `sha256=<hex hmac>` over message id, timestamp and raw body.
///
/// Both strings are hashed before the constant-time compare so that the
/// comparison always runs over equal-length inputs.
pub(crate) fn verify_signature(
    secret: &[u8],
    message_id: &str,
    timestamp: &str,
    body: &[u8],
    provided: &str,
) -> bool {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
        return false;
    };
    mac.update(message_id.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(body);
    let expected = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

    let expected_digest = Sha256::digest(expected.as_bytes());
    let provided_digest = Sha256::digest(provided.as_bytes());
    expected_digest
        .as_slice()
        .ct_eq(provided_digest.as_slice())
        .into()
}

fn required_auth_header<'a>(
    headers: &'a HeaderMap,
    name: &'static str,
) -> Result<&'a str, Rejection> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            warn!(stage = "ingress", security = true, header = name, "missing authentication header");
            Rejection::MissingAuthHeader(name)
        })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| format!("invalid RFC3339 timestamp: {err}"))
}

fn text_response(body: String) -> Response {
    let mut response = Response::new(Body::from(body));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain"),
    );
    response
}

fn empty_response() -> Response {
    Response::new(Body::empty())
}
