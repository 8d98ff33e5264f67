// ABOUTME: Error taxonomy for outbound VK API calls.
// ABOUTME: Every task resolution carries one of these instead of a panic or exception.

use crate::auth::IdentityKind;
use thiserror::Error;

/// VK error code: user authorization failed (token revoked or expired)
pub const AUTHORIZATION_FAILED: i64 = 5;
/// VK error code: internal server error
pub const INTERNAL_ERROR: i64 = 10;
/// VK error code: captcha must be solved before the call is accepted
pub const CAPTCHA_IS_NEEDED: i64 = 14;
/// VK error code: access denied
pub const ACCESS_DENIED: i64 = 15;

/// Failure outcome of a single logical API call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// Caller stopped waiting; the underlying task may still resolve later
    #[error("Timed out waiting for API response")]
    Timeout,

    /// No authenticated client of the required kind is configured
    #[error("No {kind} client available to execute {method}")]
    NoClient { kind: IdentityKind, method: String },

    /// The method needs a user token but was routed to a group client
    #[error("{method} cannot be called with a {kind} token")]
    WrongIdentity { kind: IdentityKind, method: String },

    /// The client exhausted its re-authentication budget
    #[error("Client disabled after too many failed recoveries")]
    ClientDisabled,

    /// Network-level failure that survived the batch retry
    #[error("Transport error: {0}")]
    Transport(String),

    /// Response body was not a valid sequence of JSON documents
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// VK reported an error code the recovery protocol does not handle
    #[error("VK error {code}: {message}")]
    Remote { code: i64, message: String },

    /// Captcha was required and no solution was produced
    #[error("Captcha required but no solution available")]
    CaptchaUnsolved,

    /// The executor went away before resolving the task
    #[error("Request dropped before completion")]
    Dropped,

    /// Initial login could not produce a usable token
    #[error("Login failed: {0}")]
    Login(String),
}

impl ApiError {
    /// Network-level failures worth one retry of the same batch
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transport(_) | ApiError::Decode(_))
    }
}

/// Result of a single logical API call; `Ok(None)` is an explicit null response.
pub type CallOutcome = Result<Option<serde_json::Value>, ApiError>;

/// Failure from the HTTP layer underneath the executor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("unexpected HTTP status {0}")]
    Status(u16),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if let Some(status) = e.status() {
            TransportError::Status(status.as_u16())
        } else {
            TransportError::Connection(e.to_string())
        }
    }
}

impl From<TransportError> for ApiError {
    fn from(e: TransportError) -> Self {
        ApiError::Transport(e.to_string())
    }
}
