//! Market-data value types shared by every gateway component.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Upstream venue a subscription is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Source {
    PrimaryVenue,
    SecondaryVenue,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::PrimaryVenue, Source::SecondaryVenue];

    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::PrimaryVenue => "primaryVenue",
            Source::SecondaryVenue => "secondaryVenue",
        }
    }
}

impl Default for Source {
    fn default() -> Self {
        Source::PrimaryVenue
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a live subscription: one symbol on one venue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub symbol: String,
    pub source: Source,
}

impl SubscriptionKey {
    pub fn new(symbol: impl Into<String>, source: Source) -> Self {
        Self {
            symbol: symbol.into(),
            source,
        }
    }

    pub fn primary(symbol: impl Into<String>) -> Self {
        Self::new(symbol, Source::PrimaryVenue)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.source)
    }
}

/// Normalize a client-supplied symbol: trimmed, upper-case, no separators.
pub fn normalize_symbol(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !matches!(c, '/' | '-' | '_' | ' '))
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Top-of-book update produced by an upstream session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickEvent {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    #[serde(default)]
    pub source: Source,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl TickEvent {
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.symbol.clone(), self.source)
    }

    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// One-minute OHLC bar. `sequence` increases monotonically within one
/// upstream connection and restarts when the connection does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct M1Bar {
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
    pub timestamp: i64,
    #[serde(default)]
    pub sequence: u64,
}

/// Daily OHLC bar used for the average daily range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyBar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub timestamp: i64,
}
