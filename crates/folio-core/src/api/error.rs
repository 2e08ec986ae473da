use thiserror::Error;

use crate::auth::TerminationReason;

/// Why a token refresh failed.
///
/// Every request waiting on the same refresh receives a clone of this value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Refresh rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Refresh request could not complete: {0}")]
    Transport(String),

    #[error("Invalid refresh response: {0}")]
    InvalidResponse(String),
}

impl RefreshError {
    pub fn termination_reason(&self) -> TerminationReason {
        match self {
            RefreshError::NoRefreshToken => TerminationReason::NoRefreshToken,
            _ => TerminationReason::RefreshFailed,
        }
    }
}

/// Errors surfaced by `Gateway::dispatch`.
///
/// The first three variants end the session. Non-401 HTTP statuses are not
/// errors at this layer; the response is handed back untouched.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("No refresh token available - please log in again")]
    NoRefreshTokenAvailable,

    #[error("Token refresh failed: {0}")]
    RefreshRequestFailed(RefreshError),

    #[error("Authentication rejected after token refresh")]
    AuthenticationRejected,

    #[error("Network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// True when the session was torn down and the user must log in again
    pub fn is_session_terminated(&self) -> bool {
        matches!(
            self,
            GatewayError::NoRefreshTokenAvailable
                | GatewayError::RefreshRequestFailed(_)
                | GatewayError::AuthenticationRejected
        )
    }
}

impl From<RefreshError> for GatewayError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::NoRefreshToken => GatewayError::NoRefreshTokenAvailable,
            other => GatewayError::RefreshRequestFailed(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - invalid credentials")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    pub(crate) fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// True when the underlying gateway ended the session
    pub fn is_session_terminated(&self) -> bool {
        matches!(self, ApiError::Gateway(e) if e.is_session_terminated())
    }
}
