use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use url::Url;

/// Client for the Twitch identity endpoints.
#[derive(Clone)]
pub struct TwitchOAuthClient {
    http: Client,
    base_url: Url,
    client_id: String,
    client_secret: String,
}

impl TwitchOAuthClient {
    /// Creates a new client with the provided HTTP instance and configuration.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        base_url: Url,
        http: Client,
    ) -> Self {
        Self {
            http,
            base_url,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Requests an app access token using the client credentials grant.
    pub async fn app_access_token(&self) -> Result<AppAccessToken, OAuthError> {
        let url = self.base_url.join("token")?;
        let response = self
            .http
            .post(url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        parse_json(response).await
    }
}

/// Token returned by the client credentials grant.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AppAccessToken {
    pub access_token: String,
    pub expires_in: u64,
    pub token_type: String,
}

impl AppAccessToken {
    /// Computes the expiration timestamp relative to the provided instant.
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let seconds = i64::try_from(self.expires_in).unwrap_or(i64::MAX);
        now.checked_add_signed(Duration::seconds(seconds.min(i64::MAX / 1_000)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Errors that can occur during OAuth interactions.
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn parse_json<T>(response: Response) -> Result<T, OAuthError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(OAuthError::Status { status, body });
    }

    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(base_url: &Url) -> TwitchOAuthClient {
        TwitchOAuthClient::new(
            "client",
            "secret",
            base_url.clone(),
            Client::builder().build().expect("client"),
        )
    }

    #[tokio::test]
    async fn app_access_token_uses_client_credentials() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/oauth2/")).expect("url");
        let client = client(&base);

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/oauth2/token")
                    .body_contains("grant_type=client_credentials")
                    .body_contains("client_id=client")
                    .body_contains("client_secret=secret");
                then.status(200).json_body(json!({
                    "access_token": "app-token",
                    "expires_in": 5000000,
                    "token_type": "bearer"
                }));
            })
            .await;

        let token = client.app_access_token().await.expect("token");
        mock.assert_async().await;
        assert_eq!(token.access_token, "app-token");

        let now = Utc::now();
        assert_eq!(token.expires_at(now), now + Duration::seconds(5_000_000));
    }

    #[tokio::test]
    async fn non_success_status_returns_error() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/oauth2/")).expect("url");
        let client = client(&base);

        server
            .mock_async(|when, then| {
                when.method(POST).path("/oauth2/token");
                then.status(400).body("bad request");
            })
            .await;

        let err = client.app_access_token().await.expect_err("should error");
        match err {
            OAuthError::Status { status, body } => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(body, "bad request");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
