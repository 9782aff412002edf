//! Router error responses
//!
//! Every user-visible failure carries a stable short code so clients can
//! branch on it; the human-readable message is secondary. Capacity
//! errors carry a `Retry-After` hint.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("authentication required")]
    NotAuthenticated { return_to: String },

    #[error("single sign-on is not configured")]
    SsoNotConfigured,

    #[error("agent circuit is open")]
    CircuitOpen,

    #[error("agent is not ready")]
    AgentNotReady,

    #[error("agent is not enabled in this workspace")]
    AgentNotEnabled,

    #[error("too many terminals are open")]
    GlobalCapacity,

    #[error("too many terminals in this session")]
    SessionCapacity,

    #[error("reconnected too quickly")]
    ReconnectDebounce,

    #[error("upstream request failed")]
    Upstream { status: Option<u16> },

    #[error("{0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error("terminal is gone")]
    TabGone,

    #[error("internal error: {0}")]
    Internal(String),
}

impl RouterError {
    /// Machine-readable short code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotAuthenticated { .. } => "not_authenticated",
            Self::SsoNotConfigured => "sso_not_configured",
            Self::CircuitOpen => "circuit_open",
            Self::AgentNotReady => "agent_not_ready",
            Self::AgentNotEnabled => "agent_not_enabled",
            Self::GlobalCapacity => "capacity_exceeded",
            Self::SessionCapacity => "capacity_exceeded",
            Self::ReconnectDebounce => "reconnect_debounce",
            Self::Upstream { .. } => "upstream_error",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound => "not_found",
            Self::TabGone => "tab_gone",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotAuthenticated { .. } => StatusCode::UNAUTHORIZED,
            Self::SsoNotConfigured => StatusCode::NOT_FOUND,
            Self::CircuitOpen | Self::AgentNotReady | Self::GlobalCapacity => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::AgentNotEnabled => StatusCode::NOT_FOUND,
            Self::SessionCapacity | Self::ReconnectDebounce => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound | Self::TabGone => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// `Retry-After` seconds, where the failure is transient.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::AgentNotReady | Self::CircuitOpen => Some(5),
            Self::GlobalCapacity => Some(30),
            Self::SessionCapacity => Some(5),
            Self::ReconnectDebounce => Some(1),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
}

#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: ErrorBody<'a>,
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        let body = axum::Json(ErrorResponse {
            error: ErrorBody {
                code: self.code(),
                message: self.to_string(),
            },
        });

        let mut response = (self.status(), body).into_response();
        if let Some(seconds) = self.retry_after() {
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_codes_and_retry_after() {
        assert_eq!(RouterError::GlobalCapacity.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(RouterError::GlobalCapacity.retry_after(), Some(30));
        assert_eq!(RouterError::SessionCapacity.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(RouterError::SessionCapacity.retry_after(), Some(5));
        assert_eq!(RouterError::ReconnectDebounce.retry_after(), Some(1));
        assert_eq!(RouterError::AgentNotReady.retry_after(), Some(5));
    }

    #[test]
    fn test_stable_codes() {
        assert_eq!(RouterError::SsoNotConfigured.code(), "sso_not_configured");
        assert_eq!(RouterError::AgentNotEnabled.code(), "agent_not_enabled");
        assert_eq!(
            RouterError::Upstream { status: Some(502) }.code(),
            "upstream_error"
        );
    }
}
