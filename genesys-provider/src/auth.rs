//! OAuth client-credentials authorization

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde::Deserialize;
use thiserror::Error;

/// Marker the login service puts in the message of a throttled token request
pub const RATE_LIMIT_MARKER: &str = "Auth Error: 400 - invalid_request (rate limit exceeded;";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// The login service throttled the token request; retrying may succeed
    #[error("{0}")]
    RateLimited(String),

    #[error("failed to authorize client credentials: {message}")]
    Rejected { status: u16, message: String },

    #[error("failed to reach login service: {0}")]
    Transport(String),

    #[error("client credentials were not authorized within {0:?}")]
    Timeout(Duration),
}

impl AuthError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::RateLimited(_))
    }

    /// Classify a non-success token response.
    pub fn from_response(status: u16, error: &str, description: &str) -> Self {
        let message = format!("Auth Error: {} - {} ({})", status, error, description);
        if status == StatusCode::TOO_MANY_REQUESTS.as_u16() || message.contains(RATE_LIMIT_MARKER)
        {
            AuthError::RateLimited(message)
        } else {
            AuthError::Rejected { status, message }
        }
    }
}

/// Bearer token issued by the login service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_in: Option<Duration>,
}

/// Exchanges client credentials for an access token.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize_client_credentials(
        &self,
        login_path: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<AccessToken, AuthError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default, alias = "error_description")]
    description: String,
}

/// `POST <login>/oauth/token` with HTTP basic client authentication
#[derive(Debug, Clone)]
pub struct HttpAuthorizer {
    http: Client,
}

impl HttpAuthorizer {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Authorizer for HttpAuthorizer {
    async fn authorize_client_credentials(
        &self,
        login_path: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<AccessToken, AuthError> {
        let url = format!("{}/oauth/token", login_path.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .basic_auth(client_id, Some(client_secret))
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body("grant_type=client_credentials")
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        if !status.is_success() {
            let detail: TokenErrorResponse = serde_json::from_slice(&body).unwrap_or_default();
            let description = if detail.description.is_empty() {
                String::from_utf8_lossy(&body).into_owned()
            } else {
                detail.description
            };
            return Err(AuthError::from_response(
                status.as_u16(),
                &detail.error,
                &description,
            ));
        }

        let token: TokenResponse = serde_json::from_slice(&body).map_err(|e| {
            AuthError::Rejected {
                status: status.as_u16(),
                message: format!("malformed token response: {}", e),
            }
        })?;
        Ok(AccessToken {
            token: token.access_token,
            expires_in: token.expires_in.map(Duration::from_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_is_retryable() {
        let err = AuthError::from_response(400, "invalid_request", "rate limit exceeded; retry later");
        assert!(err.is_retryable());
        assert!(err.to_string().starts_with(RATE_LIMIT_MARKER));

        assert!(AuthError::from_response(429, "too_many_requests", "slow down").is_retryable());
    }

    #[test]
    fn other_failures_are_not_retryable() {
        let err = AuthError::from_response(401, "invalid_client", "bad secret");
        assert_eq!(
            err,
            AuthError::Rejected {
                status: 401,
                message: "Auth Error: 401 - invalid_client (bad secret)".to_string(),
            }
        );
        assert!(!err.is_retryable());
        assert!(!AuthError::Transport("connection refused".into()).is_retryable());
        assert!(!AuthError::Timeout(Duration::from_secs(60)).is_retryable());
    }

    #[tokio::test]
    async fn unreachable_login_service_is_a_transport_error() {
        let authorizer = HttpAuthorizer::new(Client::new());
        let err = authorizer
            .authorize_client_credentials("http://127.0.0.1:1", "id", "secret")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Transport(_)));
    }
}
