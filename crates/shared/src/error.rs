//! Shared error types for the REST collaborator.

use serde::Deserialize;

/// Error body returned by the chat backend for failed `/api/*` calls.
///
/// The backend wraps failures the same way it wraps successes, so clients can
/// surface `message` instead of failing to decode a success response type.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
}

/// Attempt to parse a backend error body into a user-facing message.
/// Prefers `message`, falls back to `error`.
pub fn try_error_message(body: &str) -> Option<String> {
    let parsed = serde_json::from_str::<ErrorBody>(body).ok()?;
    if let Some(message) = parsed.message {
        if !message.trim().is_empty() {
            return Some(message);
        }
    }
    parsed.error.filter(|e| !e.trim().is_empty())
}

/// API error type for client-side use
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Deserialization error: {0}")]
    Deserialize(String),
}

impl ApiError {
    /// Short message suitable for showing next to a retry affordance.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Http { status, body } => {
                try_error_message(body).unwrap_or_else(|| format!("request failed ({status})"))
            }
            other => other.to_string(),
        }
    }
}
