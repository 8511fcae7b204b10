//! WebSocket connection manager with ping/pong, externally-driven reconnection
//! and dynamic subscription support.

use crate::error::{Error, Result};
use crate::messages::ControlCommand;
use crate::ws_handler::WsHandler;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::{
    client_async_tls_with_config,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
    Connector,
};
use tracing::{debug, error, info, warn};
use url::Url;

/// Configuration for the WebSocket manager.
#[derive(Debug, Clone)]
pub struct WsManagerConfig {
    /// Interval between ping frames.
    pub ping_interval: Duration,
    /// Timeout for each TCP connect attempt.
    pub tcp_connect_timeout: Duration,
    /// Label for metrics (e.g., "primaryVenue").
    pub source_label: String,
}

impl Default for WsManagerConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            tcp_connect_timeout: Duration::from_secs(5),
            source_label: "unknown".to_string(),
        }
    }
}

/// How a connected session ended without an error.
enum Exit {
    Shutdown,
    Reconnect,
}

/// WebSocket connection manager.
///
/// Unlike a self-healing client, a dropped connection is reported to the
/// handler and the manager then parks until it receives
/// [`ControlCommand::Reconnect`] or [`ControlCommand::Shutdown`]. The owner of
/// the command channel decides when to dial again.
pub struct WsManager<H: WsHandler> {
    handler: Arc<H>,
    config: WsManagerConfig,
    command_rx: mpsc::Receiver<ControlCommand>,
    connected: Arc<AtomicBool>,
    worker_id: String,
}

impl<H: WsHandler> WsManager<H> {
    /// Create a new WebSocket manager.
    pub fn new(
        handler: Arc<H>,
        config: WsManagerConfig,
        command_rx: mpsc::Receiver<ControlCommand>,
        worker_id: String,
    ) -> Self {
        Self {
            handler,
            config,
            command_rx,
            connected: Arc::new(AtomicBool::new(false)),
            worker_id,
        }
    }

    /// Shared flag that is true while the socket is open.
    pub fn connection_status(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    /// Run the manager until shutdown. The first connection attempt starts immediately.
    pub async fn run(mut self) -> Result<()> {
        loop {
            match self.connect_and_run_loop().await {
                Ok(Exit::Shutdown) => {
                    info!("[{}] WebSocket closed gracefully", self.worker_id);
                    break;
                }
                Ok(Exit::Reconnect) => {
                    // The owner asked for this; it already knows the link is down.
                    info!("[{}] Reconnect requested, dialing again", self.worker_id);
                    self.mark_disconnected();
                }
                Err(e) => {
                    counter!("upstream_errors_total", "source" => self.config.source_label.clone(), "error_type" => "disconnect").increment(1);
                    if self.connected.load(Ordering::Acquire) {
                        warn!("[{}] WebSocket disconnected: {:?}", self.worker_id, e);
                        self.mark_disconnected();
                        self.handler.on_disconnect().await;
                    } else {
                        warn!("[{}] WebSocket connect failed: {:?}", self.worker_id, e);
                        self.handler.on_connect_error(&e).await;
                    }

                    if !self.wait_for_reconnect().await {
                        break;
                    }
                }
            }
        }

        self.mark_disconnected();
        Ok(())
    }

    fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            gauge!("upstream_active_connections", "source" => self.config.source_label.clone())
                .decrement(1.0);
        }
    }

    /// Park until told to reconnect. Returns false on shutdown.
    async fn wait_for_reconnect(&mut self) -> bool {
        loop {
            match self.command_rx.recv().await {
                Some(ControlCommand::Reconnect) => return true,
                Some(ControlCommand::Shutdown) | None => {
                    info!("[{}] Shutdown while disconnected", self.worker_id);
                    return false;
                }
                Some(cmd) => {
                    // Subscriptions are re-established by the owner after reconnect.
                    debug!("[{}] Dropping {:?} while disconnected", self.worker_id, cmd);
                }
            }
        }
    }

    async fn connect_and_run_loop(&mut self) -> Result<Exit> {
        let url_str = self.handler.url().to_string();
        info!("[{}] Connecting to WebSocket: {}", self.worker_id, url_str);

        let url = Url::parse(&url_str)?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::ConnectFailed("No host in URL".to_string()))?;
        let port = url.port_or_known_default().unwrap_or(443);
        let addr_str = format!("{}:{}", host, port);

        let addrs: Vec<SocketAddr> = addr_str
            .to_socket_addrs()
            .map_err(|e| Error::ConnectFailed(format!("DNS resolution failed: {}", e)))?
            .collect();
        let sorted_addrs = ipv4_first(addrs);

        debug!(
            "[{}] Resolved addresses (IPv4 first): {:?}",
            self.worker_id, sorted_addrs
        );

        let mut tcp_stream = None;
        for addr in &sorted_addrs {
            match tokio::time::timeout(self.config.tcp_connect_timeout, TcpStream::connect(addr))
                .await
            {
                Ok(Ok(stream)) => {
                    debug!("[{}] TCP connected to {}", self.worker_id, addr);
                    tcp_stream = Some(stream);
                    break;
                }
                Ok(Err(e)) => {
                    debug!("[{}] TCP connect to {} failed: {}", self.worker_id, addr, e);
                }
                Err(_) => {
                    debug!("[{}] TCP connect to {} timed out", self.worker_id, addr);
                }
            }
        }

        let tcp_stream = tcp_stream
            .ok_or_else(|| Error::ConnectFailed("All connection attempts failed".to_string()))?;

        let (ws_stream, response) =
            client_async_tls_with_config(url_str.as_str(), tcp_stream, None, Some(tls_connector()?))
                .await?;

        debug!(
            "[{}] WebSocket handshake complete, status: {:?}",
            self.worker_id,
            response.status()
        );
        let (mut write, mut read) = ws_stream.split();

        self.connected.store(true, Ordering::Release);
        gauge!("upstream_active_connections", "source" => self.config.source_label.clone())
            .increment(1.0);
        info!("[{}] WebSocket connected", self.worker_id);

        if let Some(init_msg) = self.handler.on_connect_message() {
            debug!("[{}] Sending connect frame", self.worker_id);
            write.send(Message::Text(init_msg)).await?;
        }

        self.handler.on_connected().await;

        let mut ping_interval = interval(self.config.ping_interval);
        ping_interval.reset();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            counter!("upstream_messages_received_total", "source" => self.config.source_label.clone()).increment(1);
                            if let Err(e) = self.handler.on_message(&text).await {
                                error!("[{}] Error handling message: {:?}", self.worker_id, e);
                                counter!("upstream_errors_total", "source" => self.config.source_label.clone(), "error_type" => "handler").increment(1);
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            if let Err(e) = self.handler.on_binary_message(&data).await {
                                error!("[{}] Error handling binary message: {:?}", self.worker_id, e);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            debug!("[{}] Received pong", self.worker_id);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("[{}] Received close frame: {:?}", self.worker_id, frame);
                            return Err(Error::ConnectionClosed);
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            error!("[{}] WebSocket error: {:?}", self.worker_id, e);
                            return Err(Error::WebSocket(e));
                        }
                        None => {
                            info!("[{}] WebSocket stream ended", self.worker_id);
                            return Err(Error::ConnectionClosed);
                        }
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ControlCommand::Shutdown) | None => {
                            info!("[{}] Shutting down connection", self.worker_id);
                            let close_frame = CloseFrame {
                                code: CloseCode::Normal,
                                reason: "Shutdown".into(),
                            };
                            let _ = write.send(Message::Close(Some(close_frame))).await;
                            return Ok(Exit::Shutdown);
                        }
                        Some(ControlCommand::Reconnect) => {
                            let close_frame = CloseFrame {
                                code: CloseCode::Normal,
                                reason: "Reconnect".into(),
                            };
                            let _ = write.send(Message::Close(Some(close_frame))).await;
                            return Ok(Exit::Reconnect);
                        }
                        Some(cmd) => {
                            if let Some(msg) = self.handler.command_message(&cmd) {
                                debug!("[{}] Sending subscription update: {}", self.worker_id, msg);
                                write.send(Message::Text(msg)).await?;
                            }
                        }
                    }
                }

                _ = ping_interval.tick() => {
                    write.send(Message::Ping(Vec::new())).await?;
                }
            }
        }
    }
}

/// Build a rustls connector backed by the platform's native roots.
/// Plain `ws://` URLs ignore it.
fn tls_connector() -> Result<Connector> {
    let mut root_store = rustls::RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        let _ = root_store.add(cert);
    }

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Generic(format!("TLS config error: {}", e)))?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    Ok(Connector::Rustls(Arc::new(config)))
}

/// Order resolved addresses IPv4 first to avoid slow IPv6 fallbacks.
fn ipv4_first(addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
    let (mut v4, v6): (Vec<SocketAddr>, Vec<SocketAddr>) =
        addrs.into_iter().partition(|a| a.is_ipv4());
    v4.extend(v6);
    v4
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::net::TcpListener;

    struct Recorder {
        url: String,
        events: mpsc::UnboundedSender<&'static str>,
    }

    #[async_trait]
    impl WsHandler for Recorder {
        fn url(&self) -> &str {
            &self.url
        }

        fn on_connect_message(&self) -> Option<String> {
            None
        }

        async fn on_message(&self, _msg: &str) -> Result<()> {
            Ok(())
        }

        async fn on_connected(&self) {
            let _ = self.events.send("connected");
        }

        async fn on_disconnect(&self) {
            let _ = self.events.send("disconnected");
        }

        fn command_message(&self, _cmd: &ControlCommand) -> Option<String> {
            None
        }
    }

    /// Accepts any number of WebSocket clients and reads until they leave.
    async fn local_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                        while let Some(Ok(_)) = ws.next().await {}
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_requested_reconnect_is_not_reported_as_disconnect() {
        let addr = local_server().await;
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let handler = Arc::new(Recorder {
            url: format!("ws://{}", addr),
            events: events_tx,
        });
        let (command_tx, command_rx) = mpsc::channel(4);
        let manager = WsManager::new(handler, WsManagerConfig::default(), command_rx, "test".into());
        let task = tokio::spawn(manager.run());

        assert_eq!(events.recv().await, Some("connected"));
        command_tx.send(ControlCommand::Reconnect).await.unwrap();
        assert_eq!(events.recv().await, Some("connected"));

        command_tx.send(ControlCommand::Shutdown).await.unwrap();
        task.await.unwrap().unwrap();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_ipv4_first_keeps_relative_order() {
        let addrs: Vec<SocketAddr> = vec![
            "[::1]:443".parse().unwrap(),
            "10.0.0.1:443".parse().unwrap(),
            "[::2]:443".parse().unwrap(),
            "10.0.0.2:443".parse().unwrap(),
        ];
        let sorted = ipv4_first(addrs);
        assert_eq!(sorted[0], "10.0.0.1:443".parse::<SocketAddr>().unwrap());
        assert_eq!(sorted[1], "10.0.0.2:443".parse::<SocketAddr>().unwrap());
        assert_eq!(sorted[2], "[::1]:443".parse::<SocketAddr>().unwrap());
        assert_eq!(sorted[3], "[::2]:443".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_default_config() {
        let config = WsManagerConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.source_label, "unknown");
    }
}
