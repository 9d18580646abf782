use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upstream identity whose "went live" events are relayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedAccount {
    pub id: String,
    pub twitch_user_id: String,
    pub login: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl TrackedAccount {
    /// Returns a copy carrying the freshly fetched profile metadata.
    pub fn with_profile(&self, profile: &AccountProfile) -> Self {
        Self {
            id: self.id.clone(),
            twitch_user_id: self.twitch_user_id.clone(),
            login: profile.login.clone(),
            display_name: profile.display_name.clone(),
            avatar_url: profile
                .avatar_url
                .clone()
                .or_else(|| self.avatar_url.clone()),
        }
    }
}

/// Current public profile of an upstream account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountProfile {
    pub twitch_user_id: String,
    pub login: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// Authoritative live-stream attributes fetched separately from the webhook payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveStream {
    pub id: String,
    pub title: String,
    pub category: String,
    pub viewer_count: u64,
    /// Thumbnail URL still containing the `{width}`/`{height}` placeholders.
    pub thumbnail_url_template: String,
    pub started_at: DateTime<Utc>,
}

/// One upstream "went live" notification. Together with a tenant it forms the
/// unit of idempotency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveEvent {
    pub event_id: String,
    pub broadcaster_user_id: String,
    pub broadcaster_login: String,
    pub started_at: DateTime<Utc>,
}

/// Per-tenant notification settings as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantConfig {
    pub tenant_id: String,
    pub channel_id: String,
    pub mention_role_id: Option<String>,
    /// Raw template document; parsed at render time so malformed documents fail closed.
    pub template_json: String,
    pub enabled: bool,
}

/// Durable "tenant T owns delivery of event E" record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryClaim {
    pub tenant_id: String,
    pub account_id: String,
    pub event_id: String,
    pub claimed_at: DateTime<Utc>,
}

/// Audit entry written after a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub tenant_id: String,
    pub account_id: String,
    pub event_id: String,
    pub channel_id: String,
    pub message_id: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// Chat platform message in its wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<EmbedAuthor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<EmbedMedia>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<EmbedMedia>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    /// ISO 8601 timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedAuthor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedMedia {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedFooter {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}
