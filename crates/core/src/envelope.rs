use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::types::LiveEvent;

pub const STREAM_ONLINE: &str = "stream.online";

/// Value of the `Twitch-Eventsub-Message-Type` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Verification,
    Notification,
    Revocation,
}

impl TryFrom<&str> for MessageType {
    type Error = EnvelopeError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "webhook_callback_verification" => Ok(Self::Verification),
            "notification" => Ok(Self::Notification),
            "revocation" => Ok(Self::Revocation),
            other => Err(EnvelopeError::UnsupportedMessageType(other.to_string())),
        }
    }
}

impl MessageType {
    pub fn metric_label(self) -> &'static str {
        match self {
            Self::Verification => "verification",
            Self::Notification => "notification",
            Self::Revocation => "revocation",
        }
    }
}

/// Parsed EventSub request body.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Verification {
        challenge: String,
        subscription: Subscription,
    },
    Notification {
        subscription: Subscription,
        event: Value,
    },
    Revocation {
        subscription: Subscription,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Subscription {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub condition: Condition,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Condition {
    #[serde(default)]
    pub broadcaster_user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerificationBody {
    challenge: String,
    subscription: Subscription,
}

#[derive(Debug, Deserialize)]
struct NotificationBody {
    subscription: Subscription,
    event: Value,
}

#[derive(Debug, Deserialize)]
struct RevocationBody {
    subscription: Subscription,
}

/// `stream.online` event payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamOnlineEvent {
    pub id: String,
    pub broadcaster_user_id: String,
    pub broadcaster_user_login: String,
    pub broadcaster_user_name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub started_at: DateTime<Utc>,
}

impl StreamOnlineEvent {
    pub fn into_live_event(self) -> LiveEvent {
        LiveEvent {
            event_id: self.id,
            broadcaster_user_id: self.broadcaster_user_id,
            broadcaster_login: self.broadcaster_user_login,
            started_at: self.started_at,
        }
    }
}

impl Envelope {
    /// Parses the raw body for the declared message type.
    pub fn parse(message_type: MessageType, body: &[u8]) -> Result<Self, EnvelopeError> {
        match message_type {
            MessageType::Verification => {
                let parsed: VerificationBody = serde_json::from_slice(body)?;
                require_non_empty("challenge", &parsed.challenge)?;
                Ok(Self::Verification {
                    challenge: parsed.challenge,
                    subscription: parsed.subscription,
                })
            }
            MessageType::Notification => {
                let parsed: NotificationBody = serde_json::from_slice(body)?;
                Ok(Self::Notification {
                    subscription: parsed.subscription,
                    event: parsed.event,
                })
            }
            MessageType::Revocation => {
                let parsed: RevocationBody = serde_json::from_slice(body)?;
                Ok(Self::Revocation {
                    subscription: parsed.subscription,
                })
            }
        }
    }

    pub fn subscription(&self) -> &Subscription {
        match self {
            Self::Verification { subscription, .. }
            | Self::Notification { subscription, .. }
            | Self::Revocation { subscription } => subscription,
        }
    }

    /// Extracts the `stream.online` event, or `None` for other subscription types.
    pub fn stream_online(&self) -> Result<Option<StreamOnlineEvent>, EnvelopeError> {
        let Self::Notification {
            subscription,
            event,
        } = self
        else {
            return Ok(None);
        };
        if subscription.kind != STREAM_ONLINE {
            return Ok(None);
        }

        let parsed = StreamOnlineEvent::deserialize(event)?;
        require_non_empty("event.id", &parsed.id)?;
        require_non_empty("event.broadcaster_user_id", &parsed.broadcaster_user_id)?;
        Ok(Some(parsed))
    }
}

fn require_non_empty(field: &'static str, value: &str) -> Result<(), EnvelopeError> {
    if value.trim().is_empty() {
        return Err(EnvelopeError::MissingField(field));
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("unsupported message type: {0}")]
    UnsupportedMessageType(String),
    #[error("failed to parse payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}
