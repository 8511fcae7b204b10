//! Upstream connection state and the request queue that survives reconnects.
//!
//! ## State machine
//!
//! ```text
//!            connected                 close
//! CONNECTING ─────────► READY ─────────────────► DISCONNECTING
//!     ▲   │                 │ error                    │
//!     │   │ connect timeout ▼                          │ backoff elapsed
//!     │   └──────────────► ERROR ──────────────────────┤
//!     └────────────────────────────────────────────────┘
//! ```
//!
//! Requests issued while the state is not `READY` are queued and flushed in
//! FIFO order when the session reports `connected`. The queue is never cleared
//! on close or error.

use crate::backoff::Backoff;
use crate::types::{Source, SubscriptionKey};
use crate::upstream::UpstreamRequest;
use metrics::{counter, gauge};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Upstream connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnecting,
    Connecting,
    Ready,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnecting => "DISCONNECTING",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Ready => "READY",
            ConnectionState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Connection tuning.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long a connect attempt may take before it counts as failed.
    pub connect_timeout: Duration,
    /// Delay between reconnect attempts.
    pub reconnect: Backoff,
    /// Maximum requests held while not ready.
    pub max_queued: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            reconnect: Backoff::new(Duration::from_secs(1), Duration::from_secs(30)),
            max_queued: 1024,
        }
    }
}

/// FIFO buffer for requests issued while the upstream is not ready.
#[derive(Debug)]
pub struct RequestQueue {
    items: VecDeque<UpstreamRequest>,
    capacity: usize,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
        }
    }

    /// Append a request. Returns its 1-based position, or the request back when full.
    pub fn push(&mut self, request: UpstreamRequest) -> Result<usize, UpstreamRequest> {
        if self.items.len() >= self.capacity {
            return Err(request);
        }
        self.items.push_back(request);
        Ok(self.items.len())
    }

    /// Remove every queued request in arrival order.
    pub fn drain(&mut self) -> Vec<UpstreamRequest> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// What happened to a request handed to [`ConnectionManager::enqueue_or_send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Connection is ready; send it now.
    Send(UpstreamRequest),
    /// Held until the connection is ready.
    Queued { position: usize },
    /// Queue is full; the caller must report the failure.
    Rejected(UpstreamRequest),
}

/// Owns one upstream connection's state, its request queue and its timers.
#[derive(Debug)]
pub struct ConnectionManager {
    source: Source,
    state: ConnectionState,
    config: ConnectionConfig,
    queue: RequestQueue,
    available_symbols: Vec<String>,
    reconnect_attempt: u32,
    reconnect_at: Option<Instant>,
    connect_deadline: Option<Instant>,
}

impl ConnectionManager {
    /// Create a manager for a session that has just started its first connect attempt.
    pub fn new(source: Source, config: ConnectionConfig, now: Instant) -> Self {
        info!("Upstream {} state -> {}", source, ConnectionState::Connecting);
        Self {
            source,
            state: ConnectionState::Connecting,
            queue: RequestQueue::new(config.max_queued),
            connect_deadline: Some(now + config.connect_timeout),
            config,
            available_symbols: Vec::new(),
            reconnect_attempt: 0,
            reconnect_at: None,
        }
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Symbols the venue advertised on its last `connected` event.
    pub fn available_symbols(&self) -> &[String] {
        &self.available_symbols
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Send immediately when ready, otherwise queue.
    pub fn enqueue_or_send(&mut self, request: UpstreamRequest) -> Dispatch {
        if self.is_ready() {
            return Dispatch::Send(request);
        }

        match self.queue.push(request) {
            Ok(position) => {
                debug!(
                    "Upstream {} is {}, queued request at position {}",
                    self.source, self.state, position
                );
                self.update_queue_gauge();
                Dispatch::Queued { position }
            }
            Err(request) => {
                warn!(
                    "Upstream {} request queue full ({}), rejecting {}",
                    self.source,
                    self.queue.len(),
                    request.kind()
                );
                counter!("gateway_queue_rejections_total", "source" => self.source.as_str())
                    .increment(1);
                Dispatch::Rejected(request)
            }
        }
    }

    /// Handle the session's `connected` event.
    ///
    /// Returns the requests to send, in order: every queued request first, then
    /// a subscribe for each key in `active` on this source that the flush did
    /// not already cover. The state is `READY` only once the plan is built.
    pub fn on_upstream_open<I>(&mut self, available_symbols: Vec<String>, active: I) -> Vec<UpstreamRequest>
    where
        I: IntoIterator<Item = SubscriptionKey>,
    {
        let mut plan = self.queue.drain();
        let flushed = plan.len();

        let already: HashSet<SubscriptionKey> = plan
            .iter()
            .filter_map(|r| match r {
                UpstreamRequest::Subscribe(key) => Some(key.clone()),
                _ => None,
            })
            .collect();

        let mut resubscribe: Vec<SubscriptionKey> = active
            .into_iter()
            .filter(|key| key.source == self.source && !already.contains(key))
            .collect();
        resubscribe.sort();
        let resubscribed = resubscribe.len();
        plan.extend(resubscribe.into_iter().map(UpstreamRequest::Subscribe));

        self.available_symbols = available_symbols;
        self.reconnect_attempt = 0;
        self.reconnect_at = None;
        self.connect_deadline = None;
        self.transition(ConnectionState::Ready);
        self.update_queue_gauge();

        info!(
            "Upstream {} ready: flushed {} queued requests, resubscribing {} keys, {} symbols available",
            self.source,
            flushed,
            resubscribed,
            self.available_symbols.len()
        );
        plan
    }

    /// Handle the session's `disconnected` event.
    pub fn on_upstream_close(&mut self, now: Instant) {
        self.lose_connection(ConnectionState::Disconnecting, now);
    }

    /// Handle the session's `error` event or a failed reconnect call.
    pub fn on_upstream_error(&mut self, error: &str, now: Instant) {
        warn!("Upstream {} error: {}", self.source, error);
        self.lose_connection(ConnectionState::Error, now);
    }

    fn lose_connection(&mut self, to: ConnectionState, now: Instant) {
        self.available_symbols.clear();
        self.connect_deadline = None;
        self.transition(to);
        if self.reconnect_at.is_none() {
            let delay = self.config.reconnect.delay(self.reconnect_attempt);
            self.reconnect_at = Some(now + delay);
            info!(
                "Upstream {} reconnect #{} scheduled in {:?}",
                self.source,
                self.reconnect_attempt + 1,
                delay
            );
        }
    }

    /// Fire expired timers. Returns true when a reconnect should be issued now.
    pub fn fire_due(&mut self, now: Instant) -> bool {
        if let Some(deadline) = self.connect_deadline {
            if now >= deadline && self.state == ConnectionState::Connecting {
                warn!(
                    "Upstream {} did not connect within {:?}",
                    self.source, self.config.connect_timeout
                );
                counter!("gateway_connect_timeouts_total", "source" => self.source.as_str())
                    .increment(1);
                self.lose_connection(ConnectionState::Error, now);
            }
        }

        match self.reconnect_at {
            Some(at) if now >= at => {
                self.reconnect_at = None;
                self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
                self.connect_deadline = Some(now + self.config.connect_timeout);
                self.transition(ConnectionState::Connecting);
                true
            }
            _ => false,
        }
    }

    /// Earliest pending timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.reconnect_at, self.connect_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn transition(&mut self, to: ConnectionState) {
        if self.state == to {
            return;
        }
        info!("Upstream {} state {} -> {}", self.source, self.state, to);
        counter!("gateway_upstream_transitions_total", "source" => self.source.as_str()).increment(1);
        self.state = to;
    }

    fn update_queue_gauge(&self) {
        gauge!("gateway_queued_requests", "source" => self.source.as_str())
            .set(self.queue.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::FetchKey;

    fn manager(now: Instant) -> ConnectionManager {
        ConnectionManager::new(Source::PrimaryVenue, ConnectionConfig::default(), now)
    }

    fn fetch(symbol: &str) -> UpstreamRequest {
        UpstreamRequest::Fetch(FetchKey::new(symbol, Source::PrimaryVenue, 14))
    }

    #[test]
    fn test_requests_queue_until_ready() {
        let now = Instant::now();
        let mut cm = manager(now);
        assert_eq!(cm.state(), ConnectionState::Connecting);
        assert_eq!(cm.enqueue_or_send(fetch("EURUSD")), Dispatch::Queued { position: 1 });
        assert_eq!(cm.enqueue_or_send(fetch("GBPUSD")), Dispatch::Queued { position: 2 });

        let plan = cm.on_upstream_open(vec!["EURUSD".into()], Vec::new());
        assert_eq!(plan, vec![fetch("EURUSD"), fetch("GBPUSD")]);
        assert!(cm.is_ready());
        assert_eq!(cm.enqueue_or_send(fetch("USDJPY")), Dispatch::Send(fetch("USDJPY")));
    }

    #[test]
    fn test_queue_survives_drop_and_flushes_in_order() {
        let now = Instant::now();
        let mut cm = manager(now);
        cm.on_upstream_open(Vec::new(), Vec::new());
        cm.on_upstream_close(now);
        assert_eq!(cm.state(), ConnectionState::Disconnecting);

        for symbol in ["A", "B", "C"] {
            assert!(matches!(cm.enqueue_or_send(fetch(symbol)), Dispatch::Queued { .. }));
        }
        cm.on_upstream_error("socket reset", now);
        assert_eq!(cm.queued_len(), 3);

        let plan = cm.on_upstream_open(Vec::new(), Vec::new());
        assert_eq!(plan, vec![fetch("A"), fetch("B"), fetch("C")]);
    }

    #[test]
    fn test_resubscribe_all_skips_keys_already_flushed() {
        let now = Instant::now();
        let mut cm = manager(now);
        cm.enqueue_or_send(UpstreamRequest::Subscribe(SubscriptionKey::primary("EURUSD")));

        let active = vec![
            SubscriptionKey::primary("EURUSD"),
            SubscriptionKey::primary("AUDUSD"),
            SubscriptionKey::new("EURUSD", Source::SecondaryVenue),
        ];
        let plan = cm.on_upstream_open(Vec::new(), active);
        assert_eq!(
            plan,
            vec![
                UpstreamRequest::Subscribe(SubscriptionKey::primary("EURUSD")),
                UpstreamRequest::Subscribe(SubscriptionKey::primary("AUDUSD")),
            ]
        );
    }

    #[test]
    fn test_full_queue_rejects() {
        let now = Instant::now();
        let config = ConnectionConfig {
            max_queued: 1,
            ..Default::default()
        };
        let mut cm = ConnectionManager::new(Source::PrimaryVenue, config, now);
        assert!(matches!(cm.enqueue_or_send(fetch("A")), Dispatch::Queued { .. }));
        assert_eq!(cm.enqueue_or_send(fetch("B")), Dispatch::Rejected(fetch("B")));
    }

    #[test]
    fn test_connect_timeout_is_independent_of_data() {
        let now = Instant::now();
        let mut cm = manager(now);
        let timeout = ConnectionConfig::default().connect_timeout;

        assert!(!cm.fire_due(now + timeout - Duration::from_millis(1)));
        assert_eq!(cm.state(), ConnectionState::Connecting);

        assert!(!cm.fire_due(now + timeout));
        assert_eq!(cm.state(), ConnectionState::Error);
        assert_eq!(cm.next_deadline(), Some(now + timeout + Duration::from_secs(1)));
    }

    #[test]
    fn test_reconnect_backoff_grows_and_resets() {
        let start = Instant::now();
        let mut cm = manager(start);
        cm.on_upstream_open(Vec::new(), Vec::new());

        let mut now = start;
        let mut delays = Vec::new();
        cm.on_upstream_close(now);
        for _ in 0..3 {
            let at = cm.next_deadline().unwrap();
            delays.push(at - now);
            now = at;
            assert!(cm.fire_due(now));
            assert_eq!(cm.state(), ConnectionState::Connecting);
            cm.on_upstream_error("refused", now);
        }
        assert_eq!(
            delays,
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
        );

        cm.on_upstream_open(Vec::new(), Vec::new());
        assert_eq!(cm.next_deadline(), None);
        cm.on_upstream_close(now);
        assert_eq!(cm.next_deadline(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_repeated_loss_does_not_rearm_reconnect() {
        let now = Instant::now();
        let mut cm = manager(now);
        cm.on_upstream_open(Vec::new(), Vec::new());
        cm.on_upstream_close(now);
        let first = cm.next_deadline();
        cm.on_upstream_error("late error", now + Duration::from_millis(500));
        assert_eq!(cm.next_deadline(), first);
        assert_eq!(cm.state(), ConnectionState::Error);
    }
}
