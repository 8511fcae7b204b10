//! Upstream session boundary and the per-source request dispatcher.
//!
//! The gateway never talks to a venue directly. It consumes an
//! [`UpstreamSession`] (methods) plus a stream of [`UpstreamEvent`]s (lifecycle
//! and market data), and every outbound call goes through a dispatcher task
//! that executes [`UpstreamRequest`]s strictly in the order they were issued.

use crate::types::{DailyBar, M1Bar, Source, SubscriptionKey, TickEvent};
use async_trait::async_trait;
use metrics::counter;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Errors reported by an upstream session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    /// Venue throttled the request.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Instrument is legitimately unavailable to this account.
    #[error("instrument restricted: {0}")]
    Restricted(String),

    /// Venue does not know the symbol.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    /// No live connection to issue the request on.
    #[error("upstream disconnected")]
    Disconnected,

    /// Request did not complete in time.
    #[error("upstream request timed out")]
    Timeout,

    /// Venue rejected the request for another reason.
    #[error("upstream rejected request: {0}")]
    Rejected(String),

    /// Transport or decoding failure.
    #[error("upstream transport error: {0}")]
    Transport(String),
}

/// How the request coordinator reacts to an [`UpstreamError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with exponential backoff.
    Transient,
    /// Resolve as degraded data; not an error for the client.
    Restricted,
    /// Re-issue once the connection is back, without consuming an attempt.
    Connection,
    /// Surface to the client, never retry.
    Fatal,
}

impl UpstreamError {
    pub fn class(&self) -> ErrorClass {
        match self {
            UpstreamError::RateLimited(_) | UpstreamError::Timeout => ErrorClass::Transient,
            UpstreamError::Restricted(_) => ErrorClass::Restricted,
            UpstreamError::Disconnected => ErrorClass::Connection,
            UpstreamError::UnknownSymbol(_)
            | UpstreamError::Rejected(_)
            | UpstreamError::Transport(_) => ErrorClass::Fatal,
        }
    }
}

/// Raw data package returned by the venue for one symbol.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamPackage {
    pub symbol: String,
    pub digits: u32,
    #[serde(default)]
    pub daily_bars: Vec<DailyBar>,
    pub todays_open: f64,
    pub todays_high: f64,
    pub todays_low: f64,
    pub initial_price: f64,
    #[serde(default)]
    pub m1_bars: Vec<M1Bar>,
}

/// Events emitted by an upstream session.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// Authenticated and ready for requests.
    Connected { available_symbols: Vec<String> },
    Disconnected,
    Error(String),
    Tick(TickEvent),
    M1Bar(M1Bar),
}

/// A streaming market-data session with one venue.
#[async_trait]
pub trait UpstreamSession: Send + Sync + 'static {
    /// Venue this session serves.
    fn source(&self) -> Source;

    /// Start streaming ticks for `symbol`.
    async fn subscribe_to_ticks(&self, symbol: &str) -> Result<(), UpstreamError>;

    /// Stop streaming ticks for `symbol`. Fire-and-forget.
    fn unsubscribe_from_ticks(&self, symbol: &str);

    /// Fetch the symbol's metadata, daily bars and recent minute bars.
    async fn get_symbol_data_package(
        &self,
        symbol: &str,
        lookback_days: u32,
    ) -> Result<UpstreamPackage, UpstreamError>;

    /// Drop and re-establish the streaming connection.
    async fn reconnect(&self) -> Result<(), UpstreamError>;
}

/// Identity of a data-package fetch. Concurrent fetches with equal keys are coalesced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FetchKey {
    pub symbol: String,
    pub source: Source,
    pub lookback_days: u32,
}

impl FetchKey {
    pub fn new(symbol: impl Into<String>, source: Source, lookback_days: u32) -> Self {
        Self {
            symbol: symbol.into(),
            source,
            lookback_days,
        }
    }

    pub fn subscription_key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.symbol.clone(), self.source)
    }
}

/// Outbound request to an upstream session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamRequest {
    Subscribe(SubscriptionKey),
    Unsubscribe(SubscriptionKey),
    Fetch(FetchKey),
    Reconnect,
}

impl UpstreamRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamRequest::Subscribe(_) => "subscribe",
            UpstreamRequest::Unsubscribe(_) => "unsubscribe",
            UpstreamRequest::Fetch(_) => "fetch",
            UpstreamRequest::Reconnect => "reconnect",
        }
    }
}

/// Result of an executed request, posted back to the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamCompletion {
    Subscribed {
        key: SubscriptionKey,
        result: Result<(), UpstreamError>,
    },
    Fetched {
        key: FetchKey,
        result: Result<UpstreamPackage, UpstreamError>,
    },
    ReconnectFailed {
        source: Source,
        error: UpstreamError,
    },
}

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound on a single subscribe or fetch call.
    pub request_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Spawn the task that executes requests for one session in FIFO order.
///
/// Each request runs to completion (or times out) before the next one starts,
/// so the venue sees calls in exactly the order the gateway issued them.
pub fn spawn_dispatcher<E>(
    session: Arc<dyn UpstreamSession>,
    config: DispatcherConfig,
    mut requests: mpsc::UnboundedReceiver<UpstreamRequest>,
    completions: mpsc::Sender<E>,
) -> JoinHandle<()>
where
    E: From<UpstreamCompletion> + Send + 'static,
{
    let source = session.source();
    tokio::spawn(async move {
        info!("Upstream dispatcher for {} started", source);

        while let Some(request) = requests.recv().await {
            counter!("gateway_upstream_requests_total", "source" => source.as_str(), "kind" => request.kind()).increment(1);
            debug!("Dispatching {:?} to {}", request, source);

            let completion = match request {
                UpstreamRequest::Subscribe(key) => {
                    let result = with_timeout(
                        config.request_timeout,
                        session.subscribe_to_ticks(&key.symbol),
                    )
                    .await;
                    Some(UpstreamCompletion::Subscribed { key, result })
                }
                UpstreamRequest::Unsubscribe(key) => {
                    session.unsubscribe_from_ticks(&key.symbol);
                    None
                }
                UpstreamRequest::Fetch(key) => {
                    let result = with_timeout(
                        config.request_timeout,
                        session.get_symbol_data_package(&key.symbol, key.lookback_days),
                    )
                    .await;
                    Some(UpstreamCompletion::Fetched { key, result })
                }
                UpstreamRequest::Reconnect => match session.reconnect().await {
                    Ok(()) => None,
                    Err(error) => Some(UpstreamCompletion::ReconnectFailed { source, error }),
                },
            };

            if let Some(completion) = completion {
                if completions.send(E::from(completion)).await.is_err() {
                    warn!("Gateway inbox closed, stopping {} dispatcher", source);
                    break;
                }
            }
        }

        info!("Upstream dispatcher for {} stopped", source);
    })
}

async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, UpstreamError>
where
    F: std::future::Future<Output = Result<T, UpstreamError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(UpstreamError::Timeout),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{package, MockSession};
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(UpstreamError::RateLimited("x".into()).class(), ErrorClass::Transient);
        assert_eq!(UpstreamError::Timeout.class(), ErrorClass::Transient);
        assert_eq!(UpstreamError::Restricted("x".into()).class(), ErrorClass::Restricted);
        assert_eq!(UpstreamError::Disconnected.class(), ErrorClass::Connection);
        assert_eq!(UpstreamError::UnknownSymbol("x".into()).class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_package_deserializes_camel_case() {
        let json = r#"{
            "symbol": "EURUSD", "digits": 5,
            "dailyBars": [{"open":1.1,"high":1.11,"low":1.09,"close":1.105,"timestamp":0}],
            "todaysOpen": 1.1, "todaysHigh": 1.102, "todaysLow": 1.098, "initialPrice": 1.1
        }"#;
        let pkg: UpstreamPackage = serde_json::from_str(json).unwrap();
        assert_eq!(pkg.daily_bars.len(), 1);
        assert!(pkg.m1_bars.is_empty());
    }

    #[tokio::test]
    async fn test_dispatcher_preserves_issue_order() {
        let session = Arc::new(MockSession::default());
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (done_tx, mut done_rx) = mpsc::channel::<UpstreamCompletion>(16);
        let handle = spawn_dispatcher(session.clone(), DispatcherConfig::default(), req_rx, done_tx);

        req_tx
            .send(UpstreamRequest::Fetch(FetchKey::new("EURUSD", Source::PrimaryVenue, 14)))
            .unwrap();
        req_tx
            .send(UpstreamRequest::Subscribe(SubscriptionKey::primary("GBPUSD")))
            .unwrap();
        req_tx
            .send(UpstreamRequest::Unsubscribe(SubscriptionKey::primary("USDJPY")))
            .unwrap();
        req_tx.send(UpstreamRequest::Reconnect).unwrap();
        drop(req_tx);

        let first = done_rx.recv().await.unwrap();
        assert_eq!(
            first,
            UpstreamCompletion::Fetched {
                key: FetchKey::new("EURUSD", Source::PrimaryVenue, 14),
                result: Ok(package("EURUSD")),
            }
        );
        let second = done_rx.recv().await.unwrap();
        assert!(matches!(second, UpstreamCompletion::Subscribed { result: Ok(()), .. }));
        let third = done_rx.recv().await.unwrap();
        assert!(matches!(third, UpstreamCompletion::ReconnectFailed { .. }));

        handle.await.unwrap();
        assert_eq!(
            session.calls(),
            vec!["fetch:EURUSD", "subscribe:GBPUSD", "unsubscribe:USDJPY", "reconnect"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_times_out_slow_fetch() {
        let session = Arc::new(MockSession {
            fetch_delay: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (done_tx, mut done_rx) = mpsc::channel::<UpstreamCompletion>(4);
        let config = DispatcherConfig {
            request_timeout: Duration::from_secs(5),
        };
        spawn_dispatcher(session, config, req_rx, done_tx);

        req_tx
            .send(UpstreamRequest::Fetch(FetchKey::new("EURUSD", Source::PrimaryVenue, 14)))
            .unwrap();

        match done_rx.recv().await.unwrap() {
            UpstreamCompletion::Fetched { result, .. } => {
                assert_eq!(result, Err(UpstreamError::Timeout))
            }
            other => panic!("unexpected completion {other:?}"),
        }
    }
}
