use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use golive_core::envelope::EnvelopeError;

/// Reasons the webhook refuses a request, rendered as RFC 7807 problem documents.
#[derive(Debug)]
pub enum Rejection {
    /// The message-type header is absent, so the request is not routable.
    MissingMessageType,
    InvalidMessageType(String),
    /// An authentication header is absent or empty.
    MissingAuthHeader(&'static str),
    InvalidTimestamp(String),
    TimestampOutOfRange,
    InvalidSignature,
    Malformed(EnvelopeError),
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingMessageType | Self::InvalidMessageType(_) | Self::Malformed(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::MissingAuthHeader(_)
            | Self::InvalidTimestamp(_)
            | Self::TimestampOutOfRange
            | Self::InvalidSignature => StatusCode::UNAUTHORIZED,
        }
    }

    pub fn problem_type(&self) -> &'static str {
        match self {
            Self::MissingMessageType | Self::MissingAuthHeader(_) => "missing_header",
            Self::InvalidMessageType(_) => "invalid_message_type",
            Self::InvalidTimestamp(_) => "invalid_timestamp",
            Self::TimestampOutOfRange => "timestamp_out_of_range",
            Self::InvalidSignature => "invalid_signature",
            Self::Malformed(EnvelopeError::Json(_)) => "invalid_json",
            Self::Malformed(_) => "invalid_payload",
        }
    }

    fn detail(&self) -> String {
        match self {
            Self::MissingMessageType => "missing header Twitch-Eventsub-Message-Type".to_string(),
            Self::InvalidMessageType(detail) | Self::InvalidTimestamp(detail) => detail.clone(),
            Self::MissingAuthHeader(name) => format!("missing header {name}"),
            Self::TimestampOutOfRange => {
                "timestamp outside the allowed ±10 minute window".to_string()
            }
            Self::InvalidSignature => "signature does not match payload".to_string(),
            Self::Malformed(err) => err.to_string(),
        }
    }
}

impl From<EnvelopeError> for Rejection {
    fn from(value: EnvelopeError) -> Self {
        Self::Malformed(value)
    }
}

#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    detail: String,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ProblemDetails {
            problem_type: self.problem_type(),
            title: status.canonical_reason().unwrap_or("error"),
            detail: self.detail(),
        };
        let mut response = (status, Json(body)).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn authentication_failures_are_unauthorized() {
        for rejection in [
            Rejection::MissingAuthHeader("Twitch-Eventsub-Message-Signature"),
            Rejection::InvalidTimestamp("bad".to_string()),
            Rejection::TimestampOutOfRange,
            Rejection::InvalidSignature,
        ] {
            assert_eq!(rejection.status(), StatusCode::UNAUTHORIZED, "{rejection:?}");
        }
    }

    #[test]
    fn envelope_errors_map_to_payload_problems() {
        let json_err = serde_json::from_str::<serde_json::Value>("{")
            .map(|_| ())
            .expect_err("invalid json");
        let json = Rejection::from(EnvelopeError::Json(json_err));
        assert_eq!(json.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json.problem_type(), "invalid_json");

        let missing = Rejection::from(EnvelopeError::MissingField("event.id"));
        assert_eq!(missing.problem_type(), "invalid_payload");
    }

    #[tokio::test]
    async fn renders_problem_document() {
        let response = Rejection::InvalidSignature.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).expect("content type"),
            "application/problem+json"
        );

        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body["type"], "invalid_signature");
        assert_eq!(body["title"], "Unauthorized");
    }
}
