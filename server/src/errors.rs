use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

/// Errors raised by the OAuth session manager, the token store and the
/// resource proxy.
///
/// Upstream failures keep the provider's raw JSON body so the HTTP layer
/// can hand it back to the dashboard untouched.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("missing required configuration: {0}")]
    Configuration(&'static str),

    #[error("token endpoint rejected the request ({status})")]
    UpstreamAuth { status: StatusCode, body: Value },

    #[error("upstream API returned an error ({status})")]
    UpstreamApi { status: StatusCode, body: Value },

    #[error("authorization callback state did not match")]
    StateMismatch,

    #[error("authorization callback is missing the code parameter")]
    MissingCode,

    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("token store error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("failed to encode query string: {0}")]
    Encoding(#[from] serde_urlencoded::ser::Error),
}

impl OAuthError {
    /// Builds an [`OAuthError::UpstreamAuth`], keeping the provider status
    /// when it is an error status and falling back to 502 when the provider
    /// answered 2xx with an unusable body.
    pub fn upstream_auth(status: StatusCode, body: Value) -> Self {
        Self::UpstreamAuth {
            status: error_status(status),
            body,
        }
    }

    pub fn upstream_api(status: StatusCode, body: Value) -> Self {
        Self::UpstreamApi {
            status: error_status(status),
            body,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Self::UpstreamApi { status, .. } | Self::UpstreamAuth { status, .. }
                if *status == StatusCode::UNAUTHORIZED
        )
    }
}

fn error_status(status: StatusCode) -> StatusCode {
    if status.is_client_error() || status.is_server_error() {
        status
    } else {
        StatusCode::BAD_GATEWAY
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        tracing::error!(error = ?self, "Request Error");

        match self {
            Self::UpstreamAuth { status, body } | Self::UpstreamApi { status, body } => {
                (status, Json(body)).into_response()
            }
            Self::Configuration(field) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "configuration_error",
                    "message": format!("{field} is not configured"),
                })),
            )
                .into_response(),
            Self::StateMismatch => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "invalid_state",
                    "message": "OAuth state did not match the pending authorization",
                })),
            )
                .into_response(),
            Self::MissingCode => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "invalid_request",
                    "message": "Missing authorization code",
                })),
            )
                .into_response(),
            Self::Transport(err) => (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "error": "transport_error",
                    "message": err.to_string(),
                })),
            )
                .into_response(),
            Self::Storage(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "storage_error",
                    "message": err.to_string(),
                })),
            )
                .into_response(),
            Self::Encoding(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "encoding_error",
                    "message": err.to_string(),
                })),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_auth_keeps_error_status() {
        let err = OAuthError::upstream_auth(StatusCode::BAD_REQUEST, json!({"error": "invalid_grant"}));
        match err {
            OAuthError::UpstreamAuth { status, .. } => assert_eq!(status, StatusCode::BAD_REQUEST),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn upstream_auth_with_success_status_becomes_bad_gateway() {
        let err = OAuthError::upstream_auth(StatusCode::OK, json!({"token_type": "Bearer"}));
        match err {
            OAuthError::UpstreamAuth { status, .. } => assert_eq!(status, StatusCode::BAD_GATEWAY),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unauthorized_api_error_is_detected() {
        let err = OAuthError::upstream_api(StatusCode::UNAUTHORIZED, json!({"code": 401}));
        assert!(err.is_unauthorized());
        assert!(!OAuthError::MissingCode.is_unauthorized());
    }

    #[test]
    fn upstream_error_response_carries_provider_body() {
        let body = json!({"error": "invalid_grant", "error_description": "code expired"});
        let response = OAuthError::upstream_auth(StatusCode::BAD_REQUEST, body).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
