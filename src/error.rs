use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Why a connection attempt was refused before the upgrade.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing authentication token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token payload missing subject")]
    MissingSubject,

    #[error("could not fetch signing keys: {0}")]
    KeyFetch(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        AuthError::InvalidToken(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    /// Malformed or oversized frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(#[from] axum::Error),

    #[error("write deadline exceeded")]
    WriteTimeout,

    #[error("read deadline exceeded")]
    ReadTimeout,

    /// Another task found the peer unreachable and ended the session.
    #[error("evicted after failed write")]
    Evicted,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RelayError {
    /// Errors that mean the peer is gone rather than misbehaving.
    pub fn is_peer_death(&self) -> bool {
        matches!(
            self,
            RelayError::Transport(_)
                | RelayError::WriteTimeout
                | RelayError::ReadTimeout
                | RelayError::Evicted
        )
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, message, code) = match self {
            RelayError::Unauthorized(err) => {
                let message = match err {
                    AuthError::MissingToken => "Missing authentication token",
                    AuthError::MissingSubject => "Invalid token claims",
                    AuthError::InvalidToken(_) | AuthError::KeyFetch(_) => "Invalid token",
                };
                (StatusCode::UNAUTHORIZED, message.to_string(), "UNAUTHORIZED")
            }
            RelayError::Protocol(msg) => (StatusCode::BAD_REQUEST, msg, "BAD_REQUEST"),
            other => (
                StatusCode::INTERNAL_SERVER_ERROR,
                other.to_string(),
                "INTERNAL_ERROR",
            ),
        };

        let body = Json(json!({
            "error": code,
            "message": message
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_errors_render_unauthorized() {
        for err in [
            AuthError::MissingToken,
            AuthError::MissingSubject,
            AuthError::InvalidToken("expired".into()),
            AuthError::KeyFetch("dns".into()),
        ] {
            let response = RelayError::from(err).into_response();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[test]
    fn test_peer_death_classification() {
        assert!(RelayError::WriteTimeout.is_peer_death());
        assert!(RelayError::ReadTimeout.is_peer_death());
        assert!(RelayError::Evicted.is_peer_death());
        assert!(!RelayError::Protocol("too big".into()).is_peer_death());
    }
}
