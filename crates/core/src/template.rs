use std::borrow::Cow;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{
    Embed, EmbedAuthor, EmbedField, EmbedFooter, EmbedMedia, LiveStream, RenderedMessage,
    TrackedAccount,
};

/// Size substituted into the upstream thumbnail URL template.
pub const THUMBNAIL_WIDTH: u32 = 1280;
pub const THUMBNAIL_HEIGHT: u32 = 720;

/// Twitch brand purple, used by the default template.
const DEFAULT_EMBED_COLOR: u32 = 0x9146FF;

/// Tenant-owned message document with placeholder tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTemplate {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed: Option<EmbedTemplate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<AuthorTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<FooterTemplate>,
    /// When set, the rendered embed is stamped with the stream start time.
    #[serde(default)]
    pub timestamp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorTemplate {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldTemplate {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FooterTemplate {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

impl Default for MessageTemplate {
    fn default() -> Self {
        Self {
            content: "{mention_role} **{streamer_display_name}** is now live!".to_string(),
            embed: Some(EmbedTemplate {
                title: Some("{stream_title}".to_string()),
                url: Some("{stream_url}".to_string()),
                color: Some(DEFAULT_EMBED_COLOR),
                author: Some(AuthorTemplate {
                    name: "{streamer_display_name}".to_string(),
                    url: Some("{stream_url}".to_string()),
                    icon_url: Some("{streamer_avatar_url}".to_string()),
                }),
                thumbnail_url: Some("{streamer_avatar_url}".to_string()),
                image_url: Some("{stream_thumbnail_url}".to_string()),
                fields: vec![
                    FieldTemplate {
                        name: "Game".to_string(),
                        value: "{game_name}".to_string(),
                        inline: true,
                    },
                    FieldTemplate {
                        name: "Viewers".to_string(),
                        value: "{viewer_count}".to_string(),
                        inline: true,
                    },
                ],
                footer: Some(FooterTemplate {
                    text: "Twitch".to_string(),
                    icon_url: None,
                }),
                timestamp: true,
                ..EmbedTemplate::default()
            }),
        }
    }
}

impl MessageTemplate {
    /// Parses a stored template document.
    pub fn from_json(raw: &str) -> Result<Self, TemplateError> {
        serde_json::from_str(raw).map_err(TemplateError::Malformed)
    }

    /// Serializes the template into its stored document form.
    pub fn to_json(&self) -> Result<String, TemplateError> {
        serde_json::to_string(self).map_err(TemplateError::Malformed)
    }

    /// Renders the template into the chat platform wire format.
    ///
    /// `content_override` replaces only the text content; the embed always
    /// comes from the template.
    pub fn render(
        &self,
        context: &RenderContext<'_>,
        content_override: Option<&str>,
    ) -> RenderedMessage {
        let content_source = content_override
            .filter(|text| !text.trim().is_empty())
            .unwrap_or(&self.content);

        RenderedMessage {
            content: render_content(context, content_source),
            embeds: self
                .embed
                .as_ref()
                .map(|embed| vec![embed.render(context)])
                .unwrap_or_default(),
        }
    }
}

impl EmbedTemplate {
    fn render(&self, context: &RenderContext<'_>) -> Embed {
        Embed {
            title: context.substitute_opt(self.title.as_deref()),
            description: context.substitute_opt(self.description.as_deref()),
            url: context.substitute_opt(self.url.as_deref()),
            color: self.color,
            author: self.author.as_ref().and_then(|author| {
                let name = context.substitute(&author.name);
                (!name.is_empty()).then(|| EmbedAuthor {
                    name,
                    url: context.substitute_opt(author.url.as_deref()),
                    icon_url: context.substitute_opt(author.icon_url.as_deref()),
                })
            }),
            thumbnail: context
                .substitute_opt(self.thumbnail_url.as_deref())
                .map(|url| EmbedMedia { url }),
            image: context
                .substitute_opt(self.image_url.as_deref())
                .map(|url| EmbedMedia { url }),
            fields: self
                .fields
                .iter()
                .map(|field| EmbedField {
                    name: context.substitute(&field.name),
                    value: context.substitute(&field.value),
                    inline: field.inline,
                })
                .collect(),
            footer: self.footer.as_ref().and_then(|footer| {
                let text = context.substitute(&footer.text);
                (!text.is_empty()).then(|| EmbedFooter {
                    text,
                    icon_url: context.substitute_opt(footer.icon_url.as_deref()),
                })
            }),
            timestamp: self
                .timestamp
                .then(|| format_timestamp(context.stream.started_at)),
        }
    }
}

/// Parses a stored template and renders it in one step.
pub fn render_stored(
    raw_template: &str,
    context: &RenderContext<'_>,
    content_override: Option<&str>,
) -> Result<RenderedMessage, TemplateError> {
    let template = MessageTemplate::from_json(raw_template)?;
    Ok(template.render(context, content_override))
}

/// Data made available to placeholder tokens.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub account: &'a TrackedAccount,
    pub stream: &'a LiveStream,
    pub mention_role_id: Option<&'a str>,
}

impl<'a> RenderContext<'a> {
    pub fn new(
        account: &'a TrackedAccount,
        stream: &'a LiveStream,
        mention_role_id: Option<&'a str>,
    ) -> Self {
        Self {
            account,
            stream,
            mention_role_id,
        }
    }

    fn mention(&self) -> Option<&'a str> {
        self.mention_role_id.filter(|id| !id.is_empty())
    }

    fn token_value(&self, name: &str) -> Option<Cow<'a, str>> {
        let value = match name {
            "streamer_login" => Cow::Borrowed(self.account.login.as_str()),
            "streamer_display_name" => Cow::Borrowed(self.account.display_name.as_str()),
            "streamer_avatar_url" => Cow::Borrowed(self.account.avatar_url.as_deref().unwrap_or("")),
            "stream_url" => Cow::Owned(format!("https://twitch.tv/{}", self.account.login)),
            "stream_title" => Cow::Borrowed(self.stream.title.as_str()),
            "game_name" => Cow::Borrowed(self.stream.category.as_str()),
            "viewer_count" => Cow::Owned(self.stream.viewer_count.to_string()),
            "stream_thumbnail_url" => Cow::Owned(
                self.stream
                    .thumbnail_url_template
                    .replace("{width}", &THUMBNAIL_WIDTH.to_string())
                    .replace("{height}", &THUMBNAIL_HEIGHT.to_string()),
            ),
            "stream_started_at" => Cow::Owned(format_timestamp(self.stream.started_at)),
            "mention_role" => match self.mention() {
                Some(role_id) => Cow::Owned(format!("<@&{role_id}>")),
                None => Cow::Borrowed(""),
            },
            _ => return None,
        };
        Some(value)
    }

    /// Single left-to-right pass: substituted values are never rescanned, and
    /// unknown tokens are copied verbatim.
    pub fn substitute(&self, input: &str) -> String {
        let mut output = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(open) = rest.find('{') {
            output.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find(['{', '}']) {
                Some(close) if after.as_bytes()[close] == b'}' => {
                    let name = &after[..close];
                    match self.token_value(name) {
                        Some(value) => output.push_str(&value),
                        None => {
                            output.push('{');
                            output.push_str(name);
                            output.push('}');
                        }
                    }
                    rest = &after[close + 1..];
                }
                Some(next_open) => {
                    output.push('{');
                    output.push_str(&after[..next_open]);
                    rest = &after[next_open..];
                }
                None => {
                    output.push('{');
                    output.push_str(after);
                    rest = "";
                }
            }
        }

        output.push_str(rest);
        output
    }

    fn substitute_opt(&self, input: Option<&str>) -> Option<String> {
        input
            .map(|value| self.substitute(value))
            .filter(|value| !value.is_empty())
    }
}

/// Substitutes `source`, dropping only the separator left behind when a
/// leading `{mention_role}` expands to nothing.
fn render_content(context: &RenderContext<'_>, source: &str) -> String {
    let rendered = context.substitute(source);
    if source.starts_with("{mention_role}") && context.mention().is_none() {
        rendered.trim_start().to_string()
    } else {
        rendered
    }
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("malformed message template: {0}")]
    Malformed(#[source] serde_json::Error),
}
