use chrono::{DateTime, Utc};
use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use url::Url;

/// Client for the Twitch Helix endpoints needed to describe a live broadcast.
#[derive(Clone)]
pub struct HelixClient {
    http: Client,
    base_url: Url,
    client_id: String,
}

impl HelixClient {
    /// Creates a new Helix client with the provided configuration.
    pub fn new(client_id: impl Into<String>, base_url: Url, http: Client) -> Self {
        Self {
            http,
            base_url,
            client_id: client_id.into(),
        }
    }

    /// Fetches the current stream for `user_id`; `None` when the user is offline.
    pub async fn get_stream(
        &self,
        access_token: &str,
        user_id: &str,
    ) -> Result<Option<HelixStream>, HelixError> {
        let mut url = self.base_url.join("streams")?;
        url.query_pairs_mut().append_pair("user_id", user_id);

        let response = self
            .authorized_request(Method::GET, url, access_token)
            .send()
            .await?;

        parse_json::<DataResponse<HelixStream>>(response)
            .await
            .map(|page| page.data.into_iter().next())
    }

    /// Fetches the public profile of `user_id`.
    pub async fn get_user(
        &self,
        access_token: &str,
        user_id: &str,
    ) -> Result<Option<HelixUser>, HelixError> {
        let mut url = self.base_url.join("users")?;
        url.query_pairs_mut().append_pair("id", user_id);

        let response = self
            .authorized_request(Method::GET, url, access_token)
            .send()
            .await?;

        parse_json::<DataResponse<HelixUser>>(response)
            .await
            .map(|page| page.data.into_iter().next())
    }

    fn authorized_request(
        &self,
        method: Method,
        url: Url,
        access_token: &str,
    ) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Client-Id", &self.client_id)
            .header("Authorization", format!("Bearer {access_token}"))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DataResponse<T> {
    data: Vec<T>,
}

/// Entry returned by `GET /streams`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HelixStream {
    pub id: String,
    pub user_id: String,
    pub user_login: String,
    pub user_name: String,
    #[serde(default)]
    pub game_name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub viewer_count: u64,
    pub started_at: DateTime<Utc>,
    /// Still contains the `{width}` and `{height}` placeholders.
    #[serde(default)]
    pub thumbnail_url: String,
}

/// Entry returned by `GET /users`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HelixUser {
    pub id: String,
    pub login: String,
    pub display_name: String,
    #[serde(default)]
    pub profile_image_url: Option<String>,
}

/// Errors produced by the Helix client.
#[derive(Debug, Error)]
pub enum HelixError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl HelixError {
    /// Whether the call failed because the bearer token was rejected.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Status { status, .. } if *status == StatusCode::UNAUTHORIZED)
    }
}

async fn parse_json<T>(response: Response) -> Result<T, HelixError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(HelixError::Status { status, body });
    }

    Ok(response.json().await?)
}
