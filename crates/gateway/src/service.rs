//! The gateway actor.
//!
//! One task owns every piece of mutable state: clients, the subscription
//! registry, pending fetches, baskets, profiles and one [`ConnectionManager`]
//! per upstream source. Everything else talks to it through a
//! [`GatewayHandle`]. Each event is handled to completion before the next one
//! is read, and all registry and coordinator updates happen before the
//! resulting upstream requests leave the actor, so two clients asking for the
//! same new symbol in the same instant still cause a single upstream call.
//!
//! ## Timers
//!
//! Basket timeouts, fetch retries, reconnect backoff and the connect timeout
//! are deadlines held by their owners. The run loop sleeps until the earliest
//! one and calls [`Gateway::fire_timers`].

use crate::backoff::RetryPolicy;
use crate::basket::BasketTimeouts;
use crate::client::{ClientDirectory, ClientId, ClientState};
use crate::config::{GatewayConfig, DEFAULT_LEGACY_LOOKBACK_DAYS, DEFAULT_PROFILE_BUCKET_POINTS};
use crate::connection::{ConnectionConfig, ConnectionManager, Dispatch};
use crate::coordinator::{FetchOutcome, FetchStart, RequestCoordinator};
use crate::error::{GatewayError, Result};
use crate::message_coordinator::{BasketUpdate, MessageCoordinator, BASKET_SOURCE};
use crate::profile::{MarketProfileService, MAX_PRICE_DIGITS};
use crate::protocol::{ClientMessage, ServerMessage, SymbolDataPackage, UnifiedStatus, MAX_LOOKBACK_DAYS};
use crate::router::DataRouter;
use crate::status::{SourceStatus, StatusBroadcaster};
use crate::subscription::SubscriptionRegistry;
use crate::types::{normalize_symbol, DailyBar, Source, SubscriptionKey};
use crate::upstream::{
    spawn_dispatcher, DispatcherConfig, FetchKey, UpstreamCompletion, UpstreamError, UpstreamEvent,
    UpstreamPackage, UpstreamRequest, UpstreamSession,
};
use axum::extract::ws::Message;
use metrics::{counter, gauge};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Capacity of the actor's inbox.
pub const INBOX_CAPACITY: usize = 8192;

/// Everything the gateway actor reacts to.
#[derive(Debug)]
pub enum GatewayEvent {
    ClientConnected {
        client_id: ClientId,
        tx: mpsc::Sender<Message>,
    },
    ClientMessage {
        client_id: ClientId,
        message: ClientMessage,
    },
    ClientDisconnected {
        client_id: ClientId,
    },
    Upstream {
        source: Source,
        event: UpstreamEvent,
    },
    Completion(UpstreamCompletion),
    Stats(oneshot::Sender<GatewayStats>),
    Shutdown,
}

impl From<UpstreamCompletion> for GatewayEvent {
    fn from(completion: UpstreamCompletion) -> Self {
        GatewayEvent::Completion(completion)
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub upstream: Option<UnifiedStatus>,
    pub clients: usize,
    pub subscriptions: usize,
    pub pending_fetches: usize,
    pub baskets: usize,
    pub ticks_routed: u64,
    pub messages_dropped: u64,
}

/// Cloneable entry point into the gateway actor.
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    tx: mpsc::Sender<GatewayEvent>,
}

impl GatewayHandle {
    pub async fn connect_client(&self, client_id: ClientId, tx: mpsc::Sender<Message>) -> Result<()> {
        self.send(GatewayEvent::ClientConnected { client_id, tx }).await
    }

    pub async fn client_message(&self, client_id: ClientId, message: ClientMessage) -> Result<()> {
        self.send(GatewayEvent::ClientMessage { client_id, message }).await
    }

    pub async fn disconnect_client(&self, client_id: ClientId) -> Result<()> {
        self.send(GatewayEvent::ClientDisconnected { client_id }).await
    }

    pub async fn stats(&self) -> Result<GatewayStats> {
        let (reply, rx) = oneshot::channel();
        self.send(GatewayEvent::Stats(reply)).await?;
        rx.await
            .map_err(|_| GatewayError::Internal("gateway stopped before replying".to_string()))
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(GatewayEvent::Shutdown).await
    }

    async fn send(&self, event: GatewayEvent) -> Result<()> {
        self.tx.send(event).await.map_err(|_| GatewayError::ChannelSend)
    }
}

/// Gateway tuning.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub connection: ConnectionConfig,
    pub retry: RetryPolicy,
    pub baskets: BasketTimeouts,
    pub dispatcher: DispatcherConfig,
    pub legacy_lookback_days: u32,
    pub profile_bucket_points: u32,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            retry: RetryPolicy::default(),
            baskets: BasketTimeouts::default(),
            dispatcher: DispatcherConfig::default(),
            legacy_lookback_days: DEFAULT_LEGACY_LOOKBACK_DAYS,
            profile_bucket_points: DEFAULT_PROFILE_BUCKET_POINTS,
        }
    }
}

impl From<&GatewayConfig> for GatewaySettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            connection: config.connection.clone(),
            retry: config.retry,
            baskets: config.baskets,
            dispatcher: DispatcherConfig::default(),
            legacy_lookback_days: config.legacy_lookback_days,
            profile_bucket_points: config.profile_bucket_points,
        }
    }
}

/// One attached upstream source.
struct UpstreamLink {
    connection: ConnectionManager,
    requests: mpsc::UnboundedSender<UpstreamRequest>,
    tasks: Vec<JoinHandle<()>>,
}

impl UpstreamLink {
    fn send(&self, request: UpstreamRequest) {
        let source = self.connection.source();
        if self.requests.send(request).is_err() {
            warn!("Dispatcher for {} is gone, request dropped", source);
        }
    }
}

pub struct Gateway {
    settings: GatewaySettings,
    clients: ClientDirectory,
    registry: SubscriptionRegistry,
    requests: RequestCoordinator,
    baskets: MessageCoordinator,
    profiles: MarketProfileService,
    router: DataRouter,
    status: StatusBroadcaster,
    upstreams: BTreeMap<Source, UpstreamLink>,
    inbox_tx: mpsc::Sender<GatewayEvent>,
    inbox_rx: Option<mpsc::Receiver<GatewayEvent>>,
}

impl Gateway {
    pub fn new(settings: GatewaySettings) -> (Self, GatewayHandle) {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let handle = GatewayHandle {
            tx: inbox_tx.clone(),
        };
        let gateway = Self {
            requests: RequestCoordinator::new(settings.retry),
            baskets: MessageCoordinator::new(settings.baskets),
            settings,
            clients: ClientDirectory::new(),
            registry: SubscriptionRegistry::new(),
            profiles: MarketProfileService::new(),
            router: DataRouter::new(),
            status: StatusBroadcaster::new(),
            upstreams: BTreeMap::new(),
            inbox_tx,
            inbox_rx: Some(inbox_rx),
        };
        (gateway, handle)
    }

    /// Attach a live session: spawns its dispatcher and forwards its events
    /// into the inbox. Must be called inside a tokio runtime.
    pub fn attach(&mut self, session: Arc<dyn UpstreamSession>, mut events: mpsc::Receiver<UpstreamEvent>) {
        let source = session.source();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let dispatcher = spawn_dispatcher(
            session,
            self.settings.dispatcher.clone(),
            requests_rx,
            self.inbox_tx.clone(),
        );

        let inbox = self.inbox_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if inbox.send(GatewayEvent::Upstream { source, event }).await.is_err() {
                    break;
                }
            }
            debug!("Event forwarder for {} stopped", source);
        });

        self.attach_requests(source, requests_tx, Instant::now());
        if let Some(link) = self.upstreams.get_mut(&source) {
            link.tasks.push(dispatcher);
            link.tasks.push(forwarder);
        }
    }

    /// Register `source` with requests delivered to `requests`. The source
    /// starts out connecting.
    pub fn attach_requests(
        &mut self,
        source: Source,
        requests: mpsc::UnboundedSender<UpstreamRequest>,
        now: Instant,
    ) {
        let connection = ConnectionManager::new(source, self.settings.connection.clone(), now);
        self.upstreams.insert(
            source,
            UpstreamLink {
                connection,
                requests,
                tasks: Vec::new(),
            },
        );
        info!("Upstream {} attached", source);
    }

    /// Process events until shutdown.
    pub async fn run(mut self) {
        let Some(mut inbox) = self.inbox_rx.take() else {
            warn!("Gateway inbox already taken");
            return;
        };
        info!("Gateway running with {} upstream sources", self.upstreams.len());
        self.update_status();

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                event = inbox.recv() => match event {
                    Some(GatewayEvent::Shutdown) | None => {
                        info!("Gateway received shutdown");
                        break;
                    }
                    Some(event) => self.handle_event(event, Instant::now()),
                },
                _ = sleep_until_deadline(deadline) => self.fire_timers(Instant::now()),
            }
        }

        for link in self.upstreams.values_mut() {
            for task in link.tasks.drain(..) {
                task.abort();
            }
        }
        info!("Gateway stopped");
    }

    /// Handle one event as of `now`.
    pub fn handle_event(&mut self, event: GatewayEvent, now: Instant) {
        match event {
            GatewayEvent::ClientConnected { client_id, tx } => self.on_client_connected(client_id, tx),
            GatewayEvent::ClientMessage { client_id, message } => {
                self.on_client_message(client_id, message, now)
            }
            GatewayEvent::ClientDisconnected { client_id } => self.on_client_disconnected(client_id),
            GatewayEvent::Upstream { source, event } => self.on_upstream_event(source, event, now),
            GatewayEvent::Completion(completion) => self.on_completion(completion, now),
            GatewayEvent::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            GatewayEvent::Shutdown => {}
        }
    }

    /// Fire every timer due at `now`.
    pub fn fire_timers(&mut self, now: Instant) {
        for link in self.upstreams.values_mut() {
            if link.connection.fire_due(now) {
                link.send(UpstreamRequest::Reconnect);
            }
        }

        for key in self.requests.due_retries(now) {
            debug!("Retrying fetch {:?}", key);
            self.dispatch(key.source, UpstreamRequest::Fetch(key));
        }

        let updates = self.baskets.fire_due(now);
        self.send_basket_updates(updates);

        self.update_status();
    }

    /// Earliest pending timer across all components.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.upstreams
            .values()
            .filter_map(|link| link.connection.next_deadline())
            .chain(self.requests.next_deadline())
            .chain(self.baskets.next_deadline())
            .min()
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            upstream: self.status.current().map(|s| s.status),
            clients: self.clients.len(),
            subscriptions: self.registry.len(),
            pending_fetches: self.requests.pending_count(),
            baskets: self.baskets.len(),
            ticks_routed: self.router.ticks_routed(),
            messages_dropped: self.router.messages_dropped(),
        }
    }

    // ------------------------------------------------------------------
    // Clients
    // ------------------------------------------------------------------

    fn on_client_connected(&mut self, client_id: ClientId, tx: mpsc::Sender<Message>) {
        self.clients.register(ClientState::new(client_id, tx));
        counter!("gateway_connections_total").increment(1);
        gauge!("gateway_active_connections").set(self.clients.len() as f64);

        if !self.status.send_current(&client_id, &self.clients) {
            self.update_status();
        }
    }

    fn on_client_disconnected(&mut self, client_id: ClientId) {
        for key in self.registry.remove_client(client_id) {
            self.profiles.remove(&key);
            let source = key.source;
            self.dispatch(source, UpstreamRequest::Unsubscribe(key));
        }
        self.requests.remove_client(client_id);
        self.baskets.remove_client(client_id);

        if self.clients.unregister(&client_id).is_some() {
            gauge!("gateway_active_connections").set(self.clients.len() as f64);
        }
    }

    fn on_client_message(&mut self, client_id: ClientId, message: ClientMessage, now: Instant) {
        if !self.clients.contains(&client_id) {
            debug!("Message from unknown client {}", client_id);
            return;
        }

        match message {
            ClientMessage::GetSymbolDataPackage {
                symbol,
                adr_lookback_days,
                source,
            } => self.request_package(client_id, &symbol, source, adr_lookback_days),
            ClientMessage::Subscribe { symbols } => {
                let lookback = self.settings.legacy_lookback_days;
                for symbol in symbols {
                    self.request_package(client_id, &symbol, Source::PrimaryVenue, lookback);
                }
            }
            ClientMessage::Unsubscribe { symbols } => {
                for symbol in symbols {
                    self.unsubscribe(client_id, &normalize_symbol(&symbol));
                }
            }
            ClientMessage::SubscribeBasket { basket, legs } => {
                self.subscribe_basket(client_id, &basket, legs, now)
            }
            ClientMessage::UnsubscribeBasket { basket } => {
                match self.baskets.remove(client_id, &basket) {
                    Some(legs) => {
                        for leg in legs {
                            self.release_leg(client_id, &leg);
                        }
                    }
                    None => {
                        self.clients
                            .send(&client_id, &ServerMessage::error(format!("Unknown basket: {}", basket)));
                    }
                }
            }
            ClientMessage::Ping => {
                self.clients.send(&client_id, &ServerMessage::Pong);
            }
        }
    }

    fn request_package(&mut self, client_id: ClientId, raw_symbol: &str, source: Source, lookback_days: u32) {
        let symbol = normalize_symbol(raw_symbol);
        if let Err(e) = self.validate_symbol(&symbol, source, lookback_days) {
            self.clients
                .send(&client_id, &ServerMessage::symbol_error(symbol, e.to_string()));
            return;
        }

        match self.requests.fetch(FetchKey::new(symbol, source, lookback_days), client_id) {
            FetchStart::Issue(key) => self.dispatch(source, UpstreamRequest::Fetch(key)),
            FetchStart::Joined => {}
        }
    }

    fn validate_symbol(&self, symbol: &str, source: Source, lookback_days: u32) -> Result<()> {
        if symbol.is_empty() {
            return Err(GatewayError::InvalidRequest("symbol must not be empty".to_string()));
        }
        if !(1..=MAX_LOOKBACK_DAYS).contains(&lookback_days) {
            return Err(GatewayError::InvalidRequest(format!(
                "adrLookbackDays must be between 1 and {}",
                MAX_LOOKBACK_DAYS
            )));
        }
        let link = self
            .upstreams
            .get(&source)
            .ok_or(GatewayError::SourceUnavailable(source))?;
        let available = link.connection.available_symbols();
        if !available.is_empty() && !available.iter().any(|s| s == symbol) {
            return Err(GatewayError::UnknownSymbol(symbol.to_string()));
        }
        Ok(())
    }

    /// Drop `client_id`'s direct interest in `symbol` on every source.
    fn unsubscribe(&mut self, client_id: ClientId, symbol: &str) {
        for source in Source::ALL {
            let key = SubscriptionKey::new(symbol, source);
            self.requests.release(client_id, &key);

            let held = self
                .clients
                .get_mut(&client_id)
                .is_some_and(|client| client.direct_keys.remove(&key));
            if !held {
                continue;
            }
            if source == BASKET_SOURCE && self.baskets.client_uses_leg(client_id, symbol) {
                continue;
            }
            self.release_interest(client_id, &key);
        }
    }

    fn subscribe_basket(&mut self, client_id: ClientId, basket: &str, raw_legs: Vec<String>, now: Instant) {
        let mut legs: Vec<String> = raw_legs.iter().map(|l| normalize_symbol(l)).collect();
        legs.sort();
        legs.dedup();

        if basket.trim().is_empty() || legs.is_empty() || legs.iter().any(String::is_empty) {
            self.clients.send(
                &client_id,
                &ServerMessage::error("subscribe_basket needs a name and at least one leg"),
            );
            return;
        }
        for leg in &legs {
            if let Err(e) = self.validate_symbol(leg, BASKET_SOURCE, 1) {
                self.clients.send(
                    &client_id,
                    &ServerMessage::error(format!("Basket {} rejected: {}", basket, e)),
                );
                return;
            }
        }

        let ready = self
            .upstreams
            .get(&BASKET_SOURCE)
            .is_some_and(|link| link.connection.is_ready());
        let (replaced, updates) = self.baskets.subscribe(client_id, basket, legs.clone(), now, ready);

        for leg in &legs {
            self.add_interest(client_id, SubscriptionKey::new(leg.clone(), BASKET_SOURCE));
        }
        for old in replaced.iter().filter(|old| !legs.contains(old)) {
            self.release_leg(client_id, old);
        }
        self.send_basket_updates(updates);
    }

    /// Release a basket leg unless the client still holds it some other way.
    fn release_leg(&mut self, client_id: ClientId, symbol: &str) {
        let key = SubscriptionKey::new(symbol, BASKET_SOURCE);
        let direct = self
            .clients
            .get(&client_id)
            .is_some_and(|client| client.direct_keys.contains(&key));
        if direct || self.baskets.client_uses_leg(client_id, symbol) {
            return;
        }
        self.release_interest(client_id, &key);
    }

    fn add_interest(&mut self, client_id: ClientId, key: SubscriptionKey) {
        if self.registry.add_interest(client_id, &key) {
            let source = key.source;
            self.dispatch(source, UpstreamRequest::Subscribe(key));
        }
    }

    fn release_interest(&mut self, client_id: ClientId, key: &SubscriptionKey) {
        if self.registry.remove_interest(client_id, key) {
            self.profiles.remove(key);
            self.dispatch(key.source, UpstreamRequest::Unsubscribe(key.clone()));
        }
    }

    fn send_basket_updates(&self, updates: Vec<BasketUpdate>) {
        for update in updates {
            self.clients
                .send(&update.client, &ServerMessage::BasketState(update.data));
        }
    }

    // ------------------------------------------------------------------
    // Upstream
    // ------------------------------------------------------------------

    /// Send now if the source is ready, otherwise queue behind the reconnect.
    fn dispatch(&mut self, source: Source, request: UpstreamRequest) {
        let Some(link) = self.upstreams.get_mut(&source) else {
            warn!("No upstream for {}, dropping {}", source, request.kind());
            return;
        };
        match link.connection.enqueue_or_send(request) {
            Dispatch::Send(request) => link.send(request),
            Dispatch::Queued { .. } => {}
            Dispatch::Rejected(request) => self.on_rejected(source, request),
        }
    }

    fn on_rejected(&mut self, source: Source, request: UpstreamRequest) {
        let message = GatewayError::QueueFull { venue: source }.to_string();
        match request {
            UpstreamRequest::Fetch(key) => {
                for client in self.requests.abandon(&key) {
                    self.clients
                        .send(&client, &ServerMessage::symbol_error(key.symbol.clone(), message.clone()));
                }
            }
            UpstreamRequest::Subscribe(key) => self.drop_key(&key, &message),
            UpstreamRequest::Unsubscribe(key) => {
                warn!("Unsubscribe for {} dropped: {}", key, message);
            }
            UpstreamRequest::Reconnect => {}
        }
    }

    /// Forget `key` entirely and tell every holder why.
    fn drop_key(&mut self, key: &SubscriptionKey, reason: &str) {
        self.profiles.remove(key);
        for client in self.registry.remove_key(key) {
            if let Some(state) = self.clients.get_mut(&client) {
                state.direct_keys.remove(key);
            }
            self.clients
                .send(&client, &ServerMessage::symbol_error(key.symbol.clone(), reason));
        }
    }

    fn on_upstream_event(&mut self, source: Source, event: UpstreamEvent, now: Instant) {
        match event {
            UpstreamEvent::Connected { available_symbols } => {
                for key in self.profiles.keys_for_source(source) {
                    self.profiles.reset_sequence(&key);
                }
                let active = self.registry.keys_for_source(source);
                let Some(link) = self.upstreams.get_mut(&source) else {
                    warn!("Connected event for unattached source {}", source);
                    return;
                };
                for request in link.connection.on_upstream_open(available_symbols, active) {
                    link.send(request);
                }
                let updates = self.baskets.on_source_ready(source, now);
                self.send_basket_updates(updates);
                self.update_status();
            }
            UpstreamEvent::Disconnected => {
                if let Some(link) = self.upstreams.get_mut(&source) {
                    link.connection.on_upstream_close(now);
                }
                self.update_status();
            }
            UpstreamEvent::Error(error) => {
                if let Some(link) = self.upstreams.get_mut(&source) {
                    link.connection.on_upstream_error(&error, now);
                }
                self.update_status();
            }
            UpstreamEvent::Tick(mut tick) => {
                tick.source = source;
                self.router.route_tick(&tick, &self.registry, &self.clients);
                let updates = self.baskets.on_tick(&tick);
                self.send_basket_updates(updates);
            }
            UpstreamEvent::M1Bar(bar) => {
                self.router
                    .route_bar(source, &bar, &mut self.profiles, &self.registry, &self.clients);
            }
        }
    }

    fn on_completion(&mut self, completion: UpstreamCompletion, now: Instant) {
        match completion {
            UpstreamCompletion::Fetched { key, result } => self.on_fetched(key, result, now),
            UpstreamCompletion::Subscribed { key, result } => match result {
                Ok(()) => debug!("Subscribed to {}", key),
                // Resubscribed from the registry once the connection is back.
                Err(UpstreamError::Disconnected) => {}
                Err(e) => {
                    warn!("Subscribe to {} failed: {}", key, e);
                    self.drop_key(&key, &format!("Subscription failed: {}", e));
                }
            },
            UpstreamCompletion::ReconnectFailed { source, error } => {
                if let Some(link) = self.upstreams.get_mut(&source) {
                    link.connection.on_upstream_error(&error.to_string(), now);
                }
                self.update_status();
            }
        }
    }

    fn on_fetched(&mut self, key: FetchKey, result: std::result::Result<UpstreamPackage, UpstreamError>, now: Instant) {
        let result = result.and_then(|package| {
            if package.digits > MAX_PRICE_DIGITS {
                warn!("Package for {} has {} price digits", key.symbol, package.digits);
                return Err(UpstreamError::Transport(format!(
                    "invalid package: {} price digits",
                    package.digits
                )));
            }
            Ok(package)
        });
        match self.requests.complete(&key, result, now) {
            FetchOutcome::Ready { waiters, package } => self.deliver_package(&key, waiters, package),
            FetchOutcome::Degraded { waiters } => {
                let msg = ServerMessage::SymbolDataPackage(degraded_package(&key));
                for client in &waiters {
                    self.clients.send(client, &msg);
                }
            }
            FetchOutcome::RetryScheduled { .. } | FetchOutcome::Orphaned => {}
            FetchOutcome::Requeue(key) => {
                let source = key.source;
                self.dispatch(source, UpstreamRequest::Fetch(key));
            }
            FetchOutcome::Failed { waiters, error } => {
                let message = match &error {
                    UpstreamError::UnknownSymbol(_) => format!("Unknown symbol: {}", key.symbol),
                    other => format!("Failed to fetch {}: {}", key.symbol, other),
                };
                for client in &waiters {
                    self.clients
                        .send(client, &ServerMessage::symbol_error(key.symbol.clone(), message.clone()));
                }
            }
        }
    }

    /// Answer every waiter with the same package, then register them for live data.
    fn deliver_package(&mut self, key: &FetchKey, waiters: Vec<ClientId>, package: UpstreamPackage) {
        let subscription = key.subscription_key();
        let Some(bucket_size) =
            MarketProfileService::bucket_size(self.settings.profile_bucket_points, package.digits)
        else {
            let message = format!("Failed to fetch {}: invalid price digits", key.symbol);
            for client in &waiters {
                self.clients
                    .send(client, &ServerMessage::symbol_error(key.symbol.clone(), message.clone()));
            }
            return;
        };
        let levels = self
            .profiles
            .seed(&subscription, package.digits, bucket_size, &package.m1_bars);
        let response = build_package(key, &package, bucket_size, levels);

        let json = match serde_json::to_string(&ServerMessage::SymbolDataPackage(response)) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize package for {}: {}", key.symbol, e);
                return;
            }
        };

        let live: Vec<ClientId> = waiters
            .into_iter()
            .filter(|client| self.clients.contains(client))
            .collect();
        self.clients.send_raw_to(&live, &json);

        for client in live {
            if let Some(state) = self.clients.get_mut(&client) {
                state.direct_keys.insert(subscription.clone());
            }
            self.add_interest(client, subscription.clone());
        }

        // Nobody left to stream to: the seeded profile would never be read.
        if self.registry.refcount(&subscription) == 0 {
            self.profiles.remove(&subscription);
        }
    }

    fn update_status(&mut self) {
        let sources = self.upstreams.iter().map(|(source, link)| SourceStatus {
            source: *source,
            state: link.connection.state(),
            available_symbols: link.connection.available_symbols(),
        });
        self.status.update(sources, &self.clients);
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Mean daily range over the most recent `lookback_days` bars.
pub fn average_daily_range(bars: &[DailyBar], lookback_days: u32) -> f64 {
    let mut recent: Vec<&DailyBar> = bars.iter().collect();
    recent.sort_by_key(|bar| bar.timestamp);
    let skip = recent.len().saturating_sub(lookback_days as usize);
    let window = &recent[skip..];
    if window.is_empty() {
        return 0.0;
    }
    window.iter().map(|bar| bar.high - bar.low).sum::<f64>() / window.len() as f64
}

fn build_package(
    key: &FetchKey,
    package: &UpstreamPackage,
    bucket_size: rust_decimal::Decimal,
    levels: Vec<crate::profile::MarketProfileLevel>,
) -> SymbolDataPackage {
    let adr = average_daily_range(&package.daily_bars, key.lookback_days);
    SymbolDataPackage {
        symbol: key.symbol.clone(),
        source: key.source,
        digits: package.digits,
        adr,
        adr_lookback_days: key.lookback_days,
        todays_open: package.todays_open,
        todays_high: package.todays_high,
        todays_low: package.todays_low,
        projected_adr_high: package.todays_open + adr / 2.0,
        projected_adr_low: package.todays_open - adr / 2.0,
        initial_price: package.initial_price,
        bucket_size,
        initial_market_profile: levels,
        degraded: false,
    }
}

fn degraded_package(key: &FetchKey) -> SymbolDataPackage {
    SymbolDataPackage {
        symbol: key.symbol.clone(),
        source: key.source,
        digits: 0,
        adr: 0.0,
        adr_lookback_days: key.lookback_days,
        todays_open: 0.0,
        todays_high: 0.0,
        todays_low: 0.0,
        projected_adr_high: 0.0,
        projected_adr_low: 0.0,
        initial_price: 0.0,
        bucket_size: rust_decimal::Decimal::ZERO,
        initial_market_profile: Vec::new(),
        degraded: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basket::BasketState;
    use crate::protocol::parse_client_messages;
    use crate::types::{M1Bar, TickEvent};
    use crate::upstream::testing::package;
    use std::collections::HashMap;
    use std::time::Duration;
    use uuid::Uuid;

    const SYMBOLS: [&str; 5] = ["EURUSD", "GBPUSD", "USDJPY", "AUDUSD", "XAUUSD"];

    struct Harness {
        gateway: Gateway,
        upstream: mpsc::UnboundedReceiver<UpstreamRequest>,
        clients: HashMap<ClientId, mpsc::Receiver<Message>>,
        now: Instant,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_settings(GatewaySettings::default())
        }

        fn with_settings(settings: GatewaySettings) -> Self {
            let (mut gateway, _handle) = Gateway::new(settings);
            let (tx, upstream) = mpsc::unbounded_channel();
            let now = Instant::now();
            gateway.attach_requests(Source::PrimaryVenue, tx, now);
            Self {
                gateway,
                upstream,
                clients: HashMap::new(),
                now,
            }
        }

        /// Harness with the primary source already connected.
        fn ready() -> Self {
            let mut h = Self::new();
            h.upstream_event(UpstreamEvent::Connected {
                available_symbols: SYMBOLS.iter().map(|s| s.to_string()).collect(),
            });
            h
        }

        fn event(&mut self, event: GatewayEvent) {
            self.gateway.handle_event(event, self.now);
        }

        fn upstream_event(&mut self, event: UpstreamEvent) {
            self.event(GatewayEvent::Upstream {
                source: Source::PrimaryVenue,
                event,
            });
        }

        fn complete(&mut self, completion: UpstreamCompletion) {
            self.event(GatewayEvent::Completion(completion));
        }

        fn fetched(&mut self, symbol: &str, result: std::result::Result<UpstreamPackage, UpstreamError>) {
            self.complete(UpstreamCompletion::Fetched {
                key: fetch_key(symbol),
                result,
            });
        }

        fn advance(&mut self, by: Duration) {
            self.now += by;
            self.gateway.fire_timers(self.now);
        }

        fn connect(&mut self) -> ClientId {
            let (tx, rx) = mpsc::channel(64);
            let id = Uuid::new_v4();
            self.event(GatewayEvent::ClientConnected { client_id: id, tx });
            self.clients.insert(id, rx);
            id
        }

        fn disconnect(&mut self, id: ClientId) {
            self.event(GatewayEvent::ClientDisconnected { client_id: id });
        }

        fn send(&mut self, id: ClientId, frame: &str) {
            for message in parse_client_messages(frame) {
                self.event(GatewayEvent::ClientMessage {
                    client_id: id,
                    message: message.unwrap(),
                });
            }
        }

        fn request(&mut self, id: ClientId, symbol: &str) {
            self.send(
                id,
                &format!(r#"{{"type":"get_symbol_data_package","symbol":"{symbol}","adrLookbackDays":14}}"#),
            );
        }

        fn upstream_requests(&mut self) -> Vec<UpstreamRequest> {
            let mut out = Vec::new();
            while let Ok(request) = self.upstream.try_recv() {
                out.push(request);
            }
            out
        }

        /// Messages received by `id` since the last call, status frames skipped.
        fn received(&mut self, id: ClientId) -> Vec<serde_json::Value> {
            let rx = self.clients.get_mut(&id).unwrap();
            let mut out = Vec::new();
            while let Ok(msg) = rx.try_recv() {
                if let Message::Text(text) = msg {
                    let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                    if value["type"] != "status" {
                        out.push(value);
                    }
                }
            }
            out
        }

        fn types(&mut self, id: ClientId) -> Vec<String> {
            self.received(id)
                .iter()
                .map(|v| v["type"].as_str().unwrap_or_default().to_string())
                .collect()
        }
    }

    fn fetch_key(symbol: &str) -> FetchKey {
        FetchKey::new(symbol, Source::PrimaryVenue, 14)
    }

    fn fetch(symbol: &str) -> UpstreamRequest {
        UpstreamRequest::Fetch(fetch_key(symbol))
    }

    fn subscribe(symbol: &str) -> UpstreamRequest {
        UpstreamRequest::Subscribe(SubscriptionKey::primary(symbol))
    }

    fn unsubscribe(symbol: &str) -> UpstreamRequest {
        UpstreamRequest::Unsubscribe(SubscriptionKey::primary(symbol))
    }

    fn tick(symbol: &str, bid: f64) -> UpstreamEvent {
        UpstreamEvent::Tick(TickEvent {
            symbol: symbol.into(),
            bid,
            ask: bid + 0.0002,
            source: Source::PrimaryVenue,
            timestamp: 1,
        })
    }

    fn rate_limited() -> std::result::Result<UpstreamPackage, UpstreamError> {
        Err(UpstreamError::RateLimited("429".into()))
    }

    #[test]
    fn test_two_clients_same_symbol_one_fetch_one_subscribe() {
        let mut h = Harness::ready();
        let a = h.connect();
        let b = h.connect();

        h.request(a, "EURUSD");
        h.request(b, "eur/usd");
        assert_eq!(h.upstream_requests(), vec![fetch("EURUSD")]);

        h.fetched("EURUSD", Ok(package("EURUSD")));
        assert_eq!(h.upstream_requests(), vec![subscribe("EURUSD")]);
        assert_eq!(h.types(a), vec!["symbolDataPackage"]);
        assert_eq!(h.types(b), vec!["symbolDataPackage"]);

        h.upstream_event(tick("EURUSD", 1.1));
        assert_eq!(h.types(a), vec!["tick"]);
        assert_eq!(h.types(b), vec!["tick"]);
    }

    #[test]
    fn test_k_waiters_share_one_package() {
        let mut h = Harness::ready();
        let clients: Vec<ClientId> = (0..5).map(|_| h.connect()).collect();
        for c in &clients {
            h.request(*c, "GBPUSD");
        }
        assert_eq!(h.upstream_requests(), vec![fetch("GBPUSD")]);

        h.fetched("GBPUSD", Ok(package("GBPUSD")));
        let mut payloads = Vec::new();
        for c in &clients {
            let msgs = h.received(*c);
            assert_eq!(msgs.len(), 1);
            payloads.push(msgs[0].clone());
        }
        assert!(payloads.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(h.gateway.registry.refcount(&SubscriptionKey::primary("GBPUSD")), 5);
    }

    #[test]
    fn test_rate_limit_retries_transparently() {
        let mut h = Harness::ready();
        let a = h.connect();
        h.request(a, "EURUSD");
        h.upstream_requests();

        h.fetched("EURUSD", rate_limited());
        assert!(h.received(a).is_empty());
        assert!(h.upstream_requests().is_empty());

        h.advance(Duration::from_millis(499));
        assert!(h.upstream_requests().is_empty());
        h.advance(Duration::from_millis(1));
        assert_eq!(h.upstream_requests(), vec![fetch("EURUSD")]);

        h.fetched("EURUSD", Ok(package("EURUSD")));
        assert_eq!(h.types(a), vec!["symbolDataPackage"]);
    }

    #[test]
    fn test_exhausted_retries_one_error_per_waiter() {
        let mut h = Harness::ready();
        let a = h.connect();
        let b = h.connect();
        h.request(a, "EURUSD");
        h.request(b, "EURUSD");
        h.upstream_requests();

        for delay_ms in [500, 1000, 2000] {
            h.fetched("EURUSD", rate_limited());
            h.advance(Duration::from_millis(delay_ms));
            assert_eq!(h.upstream_requests(), vec![fetch("EURUSD")]);
        }
        h.fetched("EURUSD", rate_limited());

        for client in [a, b] {
            let msgs = h.received(client);
            assert_eq!(msgs.len(), 1);
            assert_eq!(msgs[0]["type"], "error");
            assert_eq!(msgs[0]["symbol"], "EURUSD");
        }
        assert!(h.upstream_requests().is_empty());
        assert_eq!(h.gateway.requests.pending_count(), 0);
    }

    #[test]
    fn test_disconnect_before_fetch_resolves() {
        let mut h = Harness::ready();
        let a = h.connect();
        let b = h.connect();
        h.request(a, "EURUSD");
        h.request(b, "EURUSD");
        h.upstream_requests();

        h.disconnect(a);
        h.fetched("EURUSD", Ok(package("EURUSD")));

        assert_eq!(h.types(b), vec!["symbolDataPackage"]);
        assert!(h.received(a).is_empty());
        let key = SubscriptionKey::primary("EURUSD");
        assert!(!h.gateway.registry.is_interested(a, &key));
        assert!(h.gateway.registry.is_interested(b, &key));
    }

    #[test]
    fn test_sole_waiter_leaving_means_no_subscribe() {
        let mut h = Harness::ready();
        let a = h.connect();
        h.request(a, "EURUSD");
        h.upstream_requests();
        h.disconnect(a);

        h.fetched("EURUSD", Ok(package("EURUSD")));
        assert!(h.upstream_requests().is_empty());
        assert!(h.gateway.registry.is_empty());
        assert!(!h.gateway.profiles.contains(&SubscriptionKey::primary("EURUSD")));
    }

    #[test]
    fn test_queued_requests_flush_in_order_before_resubscribe() {
        let mut h = Harness::ready();
        let a = h.connect();
        h.request(a, "EURUSD");
        h.fetched("EURUSD", Ok(package("EURUSD")));
        h.upstream_requests();

        h.upstream_event(UpstreamEvent::Disconnected);
        h.request(a, "GBPUSD");
        h.request(a, "USDJPY");
        h.request(a, "AUDUSD");
        assert!(h.upstream_requests().is_empty());
        assert_eq!(h.gateway.stats().pending_fetches, 3);

        h.advance(Duration::from_secs(1));
        assert_eq!(h.upstream_requests(), vec![UpstreamRequest::Reconnect]);

        h.upstream_event(UpstreamEvent::Connected {
            available_symbols: SYMBOLS.iter().map(|s| s.to_string()).collect(),
        });
        assert_eq!(
            h.upstream_requests(),
            vec![fetch("GBPUSD"), fetch("USDJPY"), fetch("AUDUSD"), subscribe("EURUSD")]
        );

        h.request(a, "XAUUSD");
        assert_eq!(h.upstream_requests(), vec![fetch("XAUUSD")]);
    }

    #[test]
    fn test_full_queue_rejects_with_symbol_errors() {
        let mut settings = GatewaySettings::default();
        settings.connection.max_queued = 1;
        let mut h = Harness::with_settings(settings);
        let a = h.connect();
        let b = h.connect();
        let c = h.connect();

        h.request(a, "EURUSD");
        h.request(b, "GBPUSD");
        assert!(h.received(a).is_empty());
        let msgs = h.received(b);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["type"], "error");
        assert_eq!(msgs[0]["symbol"], "GBPUSD");
        assert_eq!(msgs[0]["message"], "Request queue for primaryVenue is full");
        assert_eq!(h.gateway.stats().pending_fetches, 1);

        // A rejected subscribe forgets the key it would have opened.
        h.send(c, r#"{"type":"subscribe_basket","basket":"yen","legs":["USDJPY"]}"#);
        let errors: Vec<_> = h
            .received(c)
            .into_iter()
            .filter(|m| m["type"] == "error")
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["symbol"], "USDJPY");
        assert_eq!(h.gateway.registry.refcount(&SubscriptionKey::primary("USDJPY")), 0);
        assert!(!h.gateway.registry.is_interested(c, &SubscriptionKey::primary("USDJPY")));
    }

    #[test]
    fn test_fetch_lost_to_disconnect_is_replayed() {
        let mut h = Harness::ready();
        let a = h.connect();
        h.request(a, "EURUSD");
        assert_eq!(h.upstream_requests(), vec![fetch("EURUSD")]);

        h.upstream_event(UpstreamEvent::Disconnected);
        h.fetched("EURUSD", Err(UpstreamError::Disconnected));
        assert!(h.upstream_requests().is_empty());
        assert!(h.received(a).is_empty());
        assert_eq!(h.gateway.stats().pending_fetches, 1);

        h.advance(Duration::from_secs(1));
        assert_eq!(h.upstream_requests(), vec![UpstreamRequest::Reconnect]);
        h.upstream_event(UpstreamEvent::Connected {
            available_symbols: SYMBOLS.iter().map(|s| s.to_string()).collect(),
        });
        assert_eq!(h.upstream_requests(), vec![fetch("EURUSD")]);

        h.fetched("EURUSD", Ok(package("EURUSD")));
        assert_eq!(h.types(a), vec!["symbolDataPackage"]);
        assert_eq!(h.upstream_requests(), vec![subscribe("EURUSD")]);
    }

    #[test]
    fn test_invalid_package_digits_fail_each_waiter() {
        let mut h = Harness::ready();
        let a = h.connect();
        let b = h.connect();
        h.request(a, "EURUSD");
        h.request(b, "EURUSD");
        h.upstream_requests();

        let mut bad = package("EURUSD");
        bad.digits = 30;
        h.fetched("EURUSD", Ok(bad));
        for client in [a, b] {
            let msgs = h.received(client);
            assert_eq!(msgs.len(), 1);
            assert_eq!(msgs[0]["type"], "error");
            assert_eq!(msgs[0]["symbol"], "EURUSD");
        }
        assert!(h.upstream_requests().is_empty());
        assert_eq!(h.gateway.stats().pending_fetches, 0);

        // The gateway keeps serving.
        h.request(a, "GBPUSD");
        assert_eq!(h.upstream_requests(), vec![fetch("GBPUSD")]);
    }

    #[test]
    fn test_status_broadcast_on_connection_changes() {
        let mut h = Harness::new();
        let a = h.connect();
        let statuses = |h: &mut Harness| -> Vec<String> {
            let rx = h.clients.get_mut(&a).unwrap();
            let mut out = Vec::new();
            while let Ok(Message::Text(text)) = rx.try_recv() {
                let v: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                out.push(v["status"].as_str().unwrap_or_default().to_string());
            }
            out
        };
        assert_eq!(statuses(&mut h), vec!["connecting"]);

        h.upstream_event(UpstreamEvent::Connected {
            available_symbols: vec!["EURUSD".into()],
        });
        h.upstream_event(UpstreamEvent::Error("socket reset".into()));
        assert_eq!(statuses(&mut h), vec!["connected", "error"]);

        // A late joiner gets the current status immediately.
        let b = h.connect();
        let first = h.clients.get_mut(&b).unwrap().try_recv().unwrap();
        match first {
            Message::Text(text) => assert!(text.as_str().contains("\"error\"")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_connect_timeout_schedules_reconnect() {
        let mut h = Harness::new();
        h.advance(Duration::from_secs(15));
        assert_eq!(h.gateway.upstreams[&Source::PrimaryVenue].connection.state(), crate::connection::ConnectionState::Error);
        h.advance(Duration::from_secs(1));
        assert_eq!(h.upstream_requests(), vec![UpstreamRequest::Reconnect]);
    }

    #[test]
    fn test_unsubscribe_last_client_releases_upstream() {
        let mut h = Harness::ready();
        let a = h.connect();
        let b = h.connect();
        h.request(a, "EURUSD");
        h.request(b, "EURUSD");
        h.fetched("EURUSD", Ok(package("EURUSD")));
        h.upstream_requests();

        h.send(a, r#"{"type":"unsubscribe","symbols":["EURUSD"]}"#);
        assert!(h.upstream_requests().is_empty());
        h.disconnect(b);
        assert_eq!(h.upstream_requests(), vec![unsubscribe("EURUSD")]);
        assert!(h.gateway.registry.is_empty());
    }

    #[test]
    fn test_legacy_subscribe_uses_fixed_lookback() {
        let mut h = Harness::ready();
        let a = h.connect();
        h.send(a, r#"{"type":"subscribe","symbols":["EURUSD","GBPUSD"]}"#);
        assert_eq!(h.upstream_requests(), vec![fetch("EURUSD"), fetch("GBPUSD")]);
    }

    #[test]
    fn test_restricted_instrument_is_degraded_not_error() {
        let mut h = Harness::ready();
        let a = h.connect();
        h.request(a, "XAUUSD");
        h.upstream_requests();
        h.fetched("XAUUSD", Err(UpstreamError::Restricted("not permitted".into())));

        let msgs = h.received(a);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["type"], "symbolDataPackage");
        assert_eq!(msgs[0]["degraded"], true);
        assert!(h.upstream_requests().is_empty());
    }

    #[test]
    fn test_invalid_requests_get_scoped_errors() {
        let mut h = Harness::ready();
        let a = h.connect();
        h.request(a, "NOTREAL");
        h.send(a, r#"{"type":"get_symbol_data_package","symbol":"EURUSD","adrLookbackDays":0}"#);
        h.send(
            a,
            r#"{"type":"get_symbol_data_package","symbol":"EURUSD","adrLookbackDays":14,"source":"secondaryVenue"}"#,
        );
        let msgs = h.received(a);
        assert_eq!(msgs.len(), 3);
        assert!(msgs.iter().all(|m| m["type"] == "error"));
        assert_eq!(msgs[0]["symbol"], "NOTREAL");
        assert!(h.upstream_requests().is_empty());

        h.fetched("EURUSD", Err(UpstreamError::UnknownSymbol("EURUSD".into())));
        assert!(h.received(a).is_empty());
    }

    #[test]
    fn test_subscribe_failure_drops_key() {
        let mut h = Harness::ready();
        let a = h.connect();
        h.request(a, "EURUSD");
        h.fetched("EURUSD", Ok(package("EURUSD")));
        h.received(a);

        h.complete(UpstreamCompletion::Subscribed {
            key: SubscriptionKey::primary("EURUSD"),
            result: Err(UpstreamError::Rejected("entitlement".into())),
        });
        assert_eq!(h.types(a), vec!["error"]);
        assert!(h.gateway.registry.is_empty());
    }

    #[test]
    fn test_bars_update_profile_for_interested_clients() {
        let mut h = Harness::ready();
        let a = h.connect();
        h.request(a, "EURUSD");
        h.fetched("EURUSD", Ok(package("EURUSD")));
        h.received(a);

        h.upstream_event(UpstreamEvent::M1Bar(M1Bar {
            symbol: "EURUSD".into(),
            open: 1.1,
            high: 1.1001,
            low: 1.1,
            close: 1.1001,
            volume: 4.0,
            timestamp: 60,
            sequence: 1,
        }));
        let msgs = h.received(a);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["type"], "profileUpdate");
        assert_eq!(msgs[0]["levels"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_basket_errors_at_init_timeout_when_upstream_down() {
        let mut h = Harness::new();
        let a = h.connect();
        h.send(a, r#"{"type":"subscribe_basket","basket":"usd","legs":["EURUSD","GBPUSD"]}"#);
        assert_eq!(h.received(a)[0]["state"], "INIT");

        h.advance(Duration::from_millis(4999));
        assert!(h.received(a).is_empty());
        h.advance(Duration::from_millis(1));
        let msgs = h.received(a);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["state"], "ERROR");
    }

    #[test]
    fn test_basket_partial_at_collection_timeout() {
        let mut h = Harness::ready();
        let a = h.connect();
        h.send(a, r#"{"type":"subscribe_basket","basket":"usd","legs":["EURUSD","GBPUSD"]}"#);
        let states: Vec<_> = h.received(a).iter().map(|m| m["state"].clone()).collect();
        assert_eq!(states, vec!["INIT", "COLLECTING"]);
        assert_eq!(h.upstream_requests(), vec![subscribe("EURUSD"), subscribe("GBPUSD")]);

        h.upstream_event(tick("EURUSD", 1.1));
        assert_eq!(h.types(a), vec!["tick"]);

        h.advance(Duration::from_secs(10));
        let msgs = h.received(a);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["state"], "PARTIAL");
        assert_eq!(msgs[0]["missing"][0], "GBPUSD");
        assert!(msgs[0]["legs"]["EURUSD"].as_f64().is_some());
    }

    #[test]
    fn test_basket_ready_and_leg_release() {
        let mut h = Harness::ready();
        let a = h.connect();
        h.request(a, "EURUSD");
        h.fetched("EURUSD", Ok(package("EURUSD")));
        h.upstream_requests();

        h.send(a, r#"{"type":"subscribe_basket","basket":"usd","legs":["EURUSD","GBPUSD"]}"#);
        assert_eq!(h.upstream_requests(), vec![subscribe("GBPUSD")]);
        h.received(a);

        h.upstream_event(tick("EURUSD", 1.1));
        h.upstream_event(tick("GBPUSD", 1.3));
        let ready: Vec<_> = h
            .received(a)
            .into_iter()
            .filter(|m| m["type"] == "basketState")
            .collect();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0]["state"], "READY");
        assert_eq!(
            h.gateway.baskets.state(a, "usd"),
            Some(BasketState::Ready)
        );

        // EURUSD is still held directly, so only GBPUSD is released.
        h.send(a, r#"{"type":"unsubscribe_basket","basket":"usd"}"#);
        assert_eq!(h.upstream_requests(), vec![unsubscribe("GBPUSD")]);
        assert!(h.gateway.registry.is_interested(a, &SubscriptionKey::primary("EURUSD")));
    }

    #[test]
    fn test_ping_and_stats() {
        let mut h = Harness::ready();
        let a = h.connect();
        h.send(a, r#"{"type":"ping"}"#);
        assert_eq!(h.types(a), vec!["pong"]);

        let (reply, mut rx) = oneshot::channel();
        h.event(GatewayEvent::Stats(reply));
        let stats = rx.try_recv().unwrap();
        assert_eq!(stats.clients, 1);
        assert_eq!(stats.upstream, Some(UnifiedStatus::Connected));
    }

    #[test]
    fn test_average_daily_range_uses_latest_bars() {
        let bar = |ts: i64, range: f64| DailyBar {
            open: 1.0,
            high: 1.0 + range,
            low: 1.0,
            close: 1.0,
            timestamp: ts,
        };
        let bars = vec![bar(3, 0.03), bar(1, 0.10), bar(2, 0.01)];
        assert!((average_daily_range(&bars, 2) - 0.02).abs() < 1e-12);
        assert!((average_daily_range(&bars, 30) - (0.14 / 3.0)).abs() < 1e-12);
        assert_eq!(average_daily_range(&[], 14), 0.0);
    }
}
