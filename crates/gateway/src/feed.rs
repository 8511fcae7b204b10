//! JSON feed bridge: the shipped [`UpstreamSession`].
//!
//! Streaming runs over [`common::WsManager`]. The bridge expects an `auth`
//! frame on connect and answers with `connected` once the session is usable,
//! then streams `tick` and `m1Bar` frames for subscribed symbols. Data
//! packages come from the bridge's REST side:
//! `GET {rest_url}/symbols/{symbol}/package?lookbackDays=N`.

use crate::config::FeedConfig;
use crate::error::Result;
use crate::types::{normalize_symbol, M1Bar, Source, TickEvent};
use crate::upstream::{UpstreamError, UpstreamEvent, UpstreamPackage, UpstreamSession};
use async_trait::async_trait;
use common::{ControlCommand, WsHandler, WsManager, WsManagerConfig};
use metrics::counter;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Upper bound on one REST package call.
const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

/// Buffered subscribe/unsubscribe frames awaiting the socket.
const COMMAND_BUFFER: usize = 256;

/// Frames sent by the bridge.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum FeedFrame {
    #[serde(rename_all = "camelCase")]
    Connected {
        #[serde(default)]
        available_symbols: Vec<String>,
    },
    Tick {
        symbol: String,
        bid: f64,
        ask: f64,
        timestamp: i64,
    },
    M1Bar(M1Bar),
    Error {
        message: String,
    },
    #[serde(other)]
    Other,
}

/// Translates bridge frames into [`UpstreamEvent`]s.
pub struct FeedHandler {
    source: Source,
    url: String,
    auth_token: Option<String>,
    events: mpsc::Sender<UpstreamEvent>,
}

impl FeedHandler {
    pub fn new(
        source: Source,
        url: String,
        auth_token: Option<String>,
        events: mpsc::Sender<UpstreamEvent>,
    ) -> Self {
        Self {
            source,
            url,
            auth_token,
            events,
        }
    }

    fn frame_to_event(&self, frame: FeedFrame) -> Option<UpstreamEvent> {
        match frame {
            FeedFrame::Connected { available_symbols } => Some(UpstreamEvent::Connected {
                available_symbols: available_symbols.iter().map(|s| normalize_symbol(s)).collect(),
            }),
            FeedFrame::Tick {
                symbol,
                bid,
                ask,
                timestamp,
            } => Some(UpstreamEvent::Tick(TickEvent {
                symbol: normalize_symbol(&symbol),
                bid,
                ask,
                source: self.source,
                timestamp,
            })),
            FeedFrame::M1Bar(mut bar) => {
                bar.symbol = normalize_symbol(&bar.symbol);
                Some(UpstreamEvent::M1Bar(bar))
            }
            FeedFrame::Error { message } => Some(UpstreamEvent::Error(message)),
            FeedFrame::Other => None,
        }
    }

    async fn emit(&self, event: UpstreamEvent) -> common::error::Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| common::Error::ChannelClosed)
    }
}

#[async_trait]
impl WsHandler for FeedHandler {
    fn url(&self) -> &str {
        &self.url
    }

    fn on_connect_message(&self) -> Option<String> {
        self.auth_token
            .as_ref()
            .map(|token| json!({ "type": "auth", "token": token }).to_string())
    }

    async fn on_message(&self, msg: &str) -> common::error::Result<()> {
        let frame: FeedFrame = match serde_json::from_str(msg) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("[{}] Unparseable feed frame: {}", self.source, e);
                counter!("gateway_feed_parse_errors_total", "source" => self.source.as_str())
                    .increment(1);
                return Ok(());
            }
        };

        match self.frame_to_event(frame) {
            Some(event) => self.emit(event).await,
            None => Ok(()),
        }
    }

    async fn on_disconnect(&self) {
        warn!("[{}] Feed connection lost", self.source);
        if self.emit(UpstreamEvent::Disconnected).await.is_err() {
            debug!("[{}] Gateway gone, dropping disconnect", self.source);
        }
    }

    async fn on_connect_error(&self, err: &common::Error) {
        if self.emit(UpstreamEvent::Error(err.to_string())).await.is_err() {
            debug!("[{}] Gateway gone, dropping connect error", self.source);
        }
    }

    fn command_message(&self, cmd: &ControlCommand) -> Option<String> {
        match cmd {
            ControlCommand::Subscribe(symbols) => {
                Some(json!({ "type": "subscribe", "symbols": symbols }).to_string())
            }
            ControlCommand::Unsubscribe(symbols) => {
                Some(json!({ "type": "unsubscribe", "symbols": symbols }).to_string())
            }
            ControlCommand::Reconnect | ControlCommand::Shutdown => None,
        }
    }
}

/// A live session with one feed bridge.
pub struct FeedSession {
    source: Source,
    rest_url: String,
    auth_token: Option<String>,
    http: reqwest::Client,
    commands: mpsc::Sender<ControlCommand>,
    connected: Arc<AtomicBool>,
}

impl FeedSession {
    /// Start the streaming connection. Events are delivered on `events`; the
    /// returned handle finishes after [`FeedSession::shutdown`].
    pub fn spawn(
        config: &FeedConfig,
        events: mpsc::Sender<UpstreamEvent>,
    ) -> Result<(Arc<Self>, JoinHandle<()>)> {
        let source = config.source;
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);

        let handler = Arc::new(FeedHandler::new(
            source,
            config.ws_url.clone(),
            config.auth_token.clone(),
            events,
        ));
        let ws_config = WsManagerConfig {
            source_label: source.as_str().to_string(),
            ..Default::default()
        };
        let manager = WsManager::new(handler, ws_config, command_rx, format!("feed-{}", source));
        let connected = manager.connection_status();

        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;

        let handle = tokio::spawn(async move {
            if let Err(e) = manager.run().await {
                error!("Feed {} stopped with error: {:?}", source, e);
            }
        });
        info!("Feed {} started against {}", source, config.ws_url);

        let session = Arc::new(Self {
            source,
            rest_url: config.rest_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
            http,
            commands,
            connected,
        });
        Ok((session, handle))
    }

    /// Close the socket and stop the connection task.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(ControlCommand::Shutdown).await;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[async_trait]
impl UpstreamSession for FeedSession {
    fn source(&self) -> Source {
        self.source
    }

    async fn subscribe_to_ticks(&self, symbol: &str) -> std::result::Result<(), UpstreamError> {
        if !self.is_connected() {
            return Err(UpstreamError::Disconnected);
        }
        self.commands
            .send(ControlCommand::Subscribe(vec![symbol.to_string()]))
            .await
            .map_err(|_| UpstreamError::Disconnected)
    }

    fn unsubscribe_from_ticks(&self, symbol: &str) {
        if let Err(e) = self
            .commands
            .try_send(ControlCommand::Unsubscribe(vec![symbol.to_string()]))
        {
            debug!("[{}] Unsubscribe for {} not sent: {}", self.source, symbol, e);
        }
    }

    async fn get_symbol_data_package(
        &self,
        symbol: &str,
        lookback_days: u32,
    ) -> std::result::Result<UpstreamPackage, UpstreamError> {
        let url = format!("{}/symbols/{}/package", self.rest_url, symbol);
        let mut request = self
            .http
            .get(&url)
            .query(&[("lookbackDays", lookback_days)]);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        debug!("Fetching package from: {}", url);
        let response = request.send().await.map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, symbol, body));
        }

        response
            .json::<UpstreamPackage>()
            .await
            .map_err(|e| UpstreamError::Transport(format!("invalid package for {}: {}", symbol, e)))
    }

    async fn reconnect(&self) -> std::result::Result<(), UpstreamError> {
        self.commands
            .send(ControlCommand::Reconnect)
            .await
            .map_err(|_| UpstreamError::Transport("feed task stopped".to_string()))
    }
}

impl FeedSession {
    fn transport_error(&self, e: reqwest::Error) -> UpstreamError {
        if e.is_timeout() {
            UpstreamError::Timeout
        } else if !self.is_connected() {
            UpstreamError::Disconnected
        } else {
            UpstreamError::Transport(e.to_string())
        }
    }
}

/// Map a non-success package response onto the upstream error taxonomy.
fn classify_status(status: StatusCode, symbol: &str, body: String) -> UpstreamError {
    let detail = if body.is_empty() {
        format!("{} ({})", symbol, status)
    } else {
        format!("{} ({}): {}", symbol, status, body)
    };
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            UpstreamError::RateLimited(detail)
        }
        StatusCode::FORBIDDEN | StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS => {
            UpstreamError::Restricted(detail)
        }
        StatusCode::NOT_FOUND => UpstreamError::UnknownSymbol(symbol.to_string()),
        StatusCode::GATEWAY_TIMEOUT => UpstreamError::Timeout,
        _ => UpstreamError::Rejected(detail),
    }
}
