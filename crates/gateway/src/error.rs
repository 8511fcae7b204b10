//! Gateway error types.

use crate::types::Source;
use crate::upstream::UpstreamError;
use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream WebSocket plumbing error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] common::Error),

    /// Symbol not offered by any ready source.
    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    /// Well-formed message with invalid content.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Upstream request queue is full.
    #[error("Request queue for {venue} is full")]
    QueueFull { venue: Source },

    /// No session configured for this source.
    #[error("Source {0} is not configured")]
    SourceUnavailable(Source),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Channel send error.
    #[error("Channel send error")]
    ChannelSend,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
