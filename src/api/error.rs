//! Errors of the counterparty REST and websocket clients.

use std::sync::{MutexGuard, PoisonError};

/// Represents errors talking to the counterparty.
#[derive(Debug)]
pub enum ApiError {
    /// HTTP transport error.
    Http(reqwest::Error),
    /// Websocket transport error.
    Websocket(Box<tungstenite::Error>),
    /// Socket level IO error.
    IO(std::io::Error),
    /// Malformed JSON.
    Json(serde_json::Error),
    /// The counterparty answered with an explicit `{"error": ...}`.
    Counterparty(String),
    /// Partial signatures were disabled in the config.
    PartialSignaturesDisabled,
    /// No subscription acknowledgement within the timeout.
    SubscribeTimeout,
    /// The websocket is not connected.
    NotConnected,
    /// The websocket was closed and can not be used anymore.
    Closed,
    /// Malformed counterparty URL.
    InvalidUrl(String),
    /// A lock was poisoned by a panicking thread.
    MutexPoison,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Counterparty(message) => write!(f, "counterparty error: {message}"),
            _ => write!(f, "{self:?}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    /// Whether the counterparty itself rejected the request.
    pub fn is_counterparty(&self) -> bool {
        matches!(self, Self::Counterparty(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value)
    }
}

impl From<tungstenite::Error> for ApiError {
    fn from(value: tungstenite::Error) -> Self {
        Self::Websocket(Box::new(value))
    }
}

impl From<std::io::Error> for ApiError {
    fn from(value: std::io::Error) -> Self {
        Self::IO(value)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl<'a, T> From<PoisonError<MutexGuard<'a, T>>> for ApiError {
    fn from(_: PoisonError<MutexGuard<'a, T>>) -> Self {
        Self::MutexPoison
    }
}
