use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use golive_core::types::{AccountProfile, LiveStream};
use golive_twitch::{HelixClient, HelixStream, HelixUser, TwitchOAuthClient};

use crate::fanout::{Clock, CollaboratorError, LiveDataSource};

const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Helix-backed source of live stream and profile data using an app access token.
pub struct HelixLiveSource {
    helix: HelixClient,
    oauth: TwitchOAuthClient,
    token: Mutex<Option<CachedToken>>,
    clock: Clock,
}

impl HelixLiveSource {
    pub fn new(helix: HelixClient, oauth: TwitchOAuthClient) -> Self {
        Self {
            helix,
            oauth,
            token: Mutex::new(None),
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    fn with_cached_token(self, access_token: &str, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: Mutex::new(Some(CachedToken {
                access_token: access_token.to_string(),
                expires_at,
            })),
            ..self
        }
    }

    async fn access_token(&self) -> Result<String, CollaboratorError> {
        let mut guard = self.token.lock().await;
        let now = (self.clock)();
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at - ChronoDuration::seconds(EXPIRY_MARGIN_SECS) > now {
                return Ok(cached.access_token.clone());
            }
        }

        let issued = self.oauth.app_access_token().await?;
        info!(stage = "fanout", expires_in = issued.expires_in, "obtained app access token");
        let cached = CachedToken {
            expires_at: issued.expires_at(now),
            access_token: issued.access_token,
        };
        let token = cached.access_token.clone();
        *guard = Some(cached);
        Ok(token)
    }

    /// Drops the cached token if it is still the one that was rejected.
    async fn invalidate(&self, rejected: &str) {
        let mut guard = self.token.lock().await;
        if guard
            .as_ref()
            .is_some_and(|cached| cached.access_token == rejected)
        {
            *guard = None;
        }
    }

    async fn get_stream(&self, user_id: &str) -> Result<Option<HelixStream>, CollaboratorError> {
        let token = self.access_token().await?;
        match self.helix.get_stream(&token, user_id).await {
            Err(err) if err.is_unauthorized() => {
                warn!(stage = "fanout", "app access token rejected, refreshing");
                self.invalidate(&token).await;
                let token = self.access_token().await?;
                Ok(self.helix.get_stream(&token, user_id).await?)
            }
            other => Ok(other?),
        }
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<HelixUser>, CollaboratorError> {
        let token = self.access_token().await?;
        match self.helix.get_user(&token, user_id).await {
            Err(err) if err.is_unauthorized() => {
                warn!(stage = "fanout", "app access token rejected, refreshing");
                self.invalidate(&token).await;
                let token = self.access_token().await?;
                Ok(self.helix.get_user(&token, user_id).await?)
            }
            other => Ok(other?),
        }
    }
}

#[async_trait]
impl LiveDataSource for HelixLiveSource {
    async fn fetch_live_stream(
        &self,
        twitch_user_id: &str,
    ) -> Result<Option<LiveStream>, CollaboratorError> {
        Ok(self.get_stream(twitch_user_id).await?.map(|stream| LiveStream {
            id: stream.id,
            title: stream.title,
            category: stream.game_name,
            viewer_count: stream.viewer_count,
            thumbnail_url_template: stream.thumbnail_url,
            started_at: stream.started_at,
        }))
    }

    async fn fetch_profile(
        &self,
        twitch_user_id: &str,
    ) -> Result<Option<AccountProfile>, CollaboratorError> {
        Ok(self.get_user(twitch_user_id).await?.map(|user| AccountProfile {
            twitch_user_id: user.id,
            login: user.login,
            display_name: user.display_name,
            avatar_url: user.profile_image_url.filter(|url| !url.is_empty()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use reqwest::Client;
    use serde_json::json;
    use url::Url;

    fn source(server: &MockServer) -> HelixLiveSource {
        let http = Client::builder().build().expect("client");
        HelixLiveSource::new(
            HelixClient::new(
                "client-id",
                Url::parse(&server.url("/helix/")).expect("url"),
                http.clone(),
            ),
            TwitchOAuthClient::new(
                "client-id",
                "client-secret",
                Url::parse(&server.url("/oauth2/")).expect("url"),
                http,
            ),
        )
    }

    fn stream_body() -> serde_json::Value {
        json!({
            "data": [{
                "id": "stream-1",
                "user_id": "1001",
                "user_login": "foo",
                "user_name": "Foo",
                "game_name": "Just Chatting",
                "type": "live",
                "title": "hello world",
                "viewer_count": 7,
                "started_at": "2024-01-01T12:30:00Z",
                "thumbnail_url": "https://static/foo-{width}x{height}.jpg"
            }]
        })
    }

    #[tokio::test]
    async fn token_is_fetched_once_and_reused() {
        let server = MockServer::start_async().await;
        let token_mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/oauth2/token")
                    .body_contains("grant_type=client_credentials");
                then.status(200).json_body(json!({
                    "access_token": "app-token",
                    "expires_in": 3600,
                    "token_type": "bearer"
                }));
            })
            .await;
        let streams_mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/helix/streams")
                    .header("Authorization", "Bearer app-token");
                then.status(200).json_body(stream_body());
            })
            .await;

        let source = source(&server);
        for _ in 0..2 {
            let stream = source
                .fetch_live_stream("1001")
                .await
                .expect("fetch")
                .expect("live");
            assert_eq!(stream.category, "Just Chatting");
            assert_eq!(stream.viewer_count, 7);
        }

        assert_eq!(token_mock.hits_async().await, 1);
        assert_eq!(streams_mock.hits_async().await, 2);
    }

    #[tokio::test]
    async fn rejected_token_is_refreshed_once() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/oauth2/token");
                then.status(200).json_body(json!({
                    "access_token": "fresh",
                    "expires_in": 3600,
                    "token_type": "bearer"
                }));
            })
            .await;
        let stale_mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/helix/users")
                    .header("Authorization", "Bearer stale");
                then.status(401).body("invalid token");
            })
            .await;
        let fresh_mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/helix/users")
                    .header("Authorization", "Bearer fresh");
                then.status(200).json_body(json!({
                    "data": [{
                        "id": "1001",
                        "login": "foo",
                        "display_name": "Foo",
                        "profile_image_url": ""
                    }]
                }));
            })
            .await;

        let source =
            source(&server).with_cached_token("stale", Utc::now() + ChronoDuration::hours(1));
        let profile = source
            .fetch_profile("1001")
            .await
            .expect("fetch")
            .expect("exists");

        assert_eq!(profile.display_name, "Foo");
        assert_eq!(profile.avatar_url, None);
        assert_eq!(stale_mock.hits_async().await, 1);
        assert_eq!(fresh_mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn offline_broadcaster_is_none() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/helix/streams");
                then.status(200).json_body(json!({ "data": [] }));
            })
            .await;

        let source =
            source(&server).with_cached_token("token", Utc::now() + ChronoDuration::hours(1));
        assert!(source.fetch_live_stream("1001").await.expect("fetch").is_none());
    }
}
