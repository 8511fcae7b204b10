//! Client protocol message types.
//!
//! Newline-delimited JSON objects, dispatched on their `type` field. Input is
//! validated here; nothing loosely typed reaches the gateway core.

use crate::basket::BasketState;
use crate::connection::ConnectionState;
use crate::profile::MarketProfileLevel;
use crate::types::{Source, TickEvent};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Longest ADR lookback a client may request.
pub const MAX_LOOKBACK_DAYS: u32 = 365;

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Message sent from client to server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Fetch a symbol's data package and start live updates.
    GetSymbolDataPackage {
        symbol: String,
        #[serde(rename = "adrLookbackDays")]
        adr_lookback_days: u32,
        #[serde(default)]
        source: Source,
    },
    /// Legacy multi-symbol subscribe with a fixed lookback.
    Subscribe { symbols: Vec<String> },
    /// Release interest in symbols.
    Unsubscribe { symbols: Vec<String> },
    /// Assemble a basket from several primary-venue legs.
    SubscribeBasket { basket: String, legs: Vec<String> },
    UnsubscribeBasket { basket: String },
    /// Keepalive.
    Ping,
}

/// Parse one frame into messages, one per non-empty line.
/// A line that fails to parse yields an error string instead.
pub fn parse_client_messages(frame: &str) -> Vec<Result<ClientMessage, String>> {
    frame
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str(line).map_err(|e| format!("Invalid message: {}", e)))
        .collect()
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Message sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Unified upstream status.
    #[serde(rename = "status")]
    Status(StatusMessage),
    /// Response to a data package request.
    #[serde(rename = "symbolDataPackage")]
    SymbolDataPackage(SymbolDataPackage),
    /// Live top-of-book.
    #[serde(rename = "tick")]
    Tick(TickData),
    /// Market profile levels changed by a live bar.
    #[serde(rename = "profileUpdate")]
    ProfileUpdate {
        symbol: String,
        /// Levels not listed were cleared.
        reset: bool,
        levels: Vec<MarketProfileLevel>,
    },
    /// Basket lifecycle transition.
    #[serde(rename = "basketState")]
    BasketState(BasketStateData),
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        symbol: Option<String>,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            symbol: None,
        }
    }

    pub fn symbol_error(symbol: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            symbol: Some(symbol.into()),
        }
    }
}

/// Connection status as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnifiedStatus {
    Connected,
    Connecting,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub status: UnifiedStatus,
    pub available_symbols: Vec<String>,
    pub sources: BTreeMap<Source, ConnectionState>,
}

/// Symbol metadata, ADR projection and initial market profile.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolDataPackage {
    pub symbol: String,
    pub source: Source,
    pub digits: u32,
    pub adr: f64,
    pub adr_lookback_days: u32,
    pub todays_open: f64,
    pub todays_high: f64,
    pub todays_low: f64,
    pub projected_adr_high: f64,
    pub projected_adr_low: f64,
    pub initial_price: f64,
    #[serde(with = "rust_decimal::serde::float")]
    pub bucket_size: rust_decimal::Decimal,
    pub initial_market_profile: Vec<MarketProfileLevel>,
    /// True when the venue restricts this instrument and only a shell is available.
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickData {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub timestamp: i64,
}

impl From<&TickEvent> for TickData {
    fn from(tick: &TickEvent) -> Self {
        Self {
            symbol: tick.symbol.clone(),
            bid: tick.bid,
            ask: tick.ask,
            timestamp: tick.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BasketStateData {
    pub basket: String,
    pub state: BasketState,
    /// Latest mid price per leg received so far.
    pub legs: BTreeMap<String, f64>,
    pub missing: Vec<String>,
}
