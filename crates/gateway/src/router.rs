//! Market-data fan-out: upstream ticks and bars → subscribed clients.
//!
//! Messages are serialized once per event and pushed into each interested
//! client's bounded channel. A full channel skips that client for that
//! message; routing never waits on a slow reader.

use crate::client::ClientDirectory;
use crate::profile::MarketProfileService;
use crate::protocol::{ServerMessage, TickData};
use crate::subscription::SubscriptionRegistry;
use crate::types::{M1Bar, Source, SubscriptionKey, TickEvent};
use metrics::counter;
use tracing::{debug, warn};

/// Delivery counts for one routed event.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
}

/// Routes upstream market data to clients and the profile service.
#[derive(Debug, Default)]
pub struct DataRouter {
    ticks_routed: u64,
    messages_dropped: u64,
}

impl DataRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a tick to every client interested in its (symbol, source).
    pub fn route_tick(
        &mut self,
        tick: &TickEvent,
        registry: &SubscriptionRegistry,
        clients: &ClientDirectory,
    ) -> Delivery {
        let key = tick.key();
        let Some(record) = registry.get(&key) else {
            debug!("No clients subscribed to {}", key);
            return Delivery::default();
        };

        let json = match serde_json::to_string(&ServerMessage::Tick(TickData::from(tick))) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize tick for {}: {}", key, e);
                return Delivery::default();
            }
        };

        let delivered = clients.send_raw_to(record.clients(), &json);
        let delivery = Delivery {
            delivered,
            dropped: record.refcount() - delivered,
        };

        self.ticks_routed += 1;
        counter!("gateway_ticks_routed_total").increment(1);
        self.record_drops(&key, delivery.dropped, "tick");
        delivery
    }

    /// Apply a live bar to the symbol's profile and push the changed levels to
    /// interested clients. Bars for symbols without a profile are ignored.
    pub fn route_bar(
        &mut self,
        source: Source,
        bar: &M1Bar,
        profiles: &mut MarketProfileService,
        registry: &SubscriptionRegistry,
        clients: &ClientDirectory,
    ) -> Delivery {
        let key = SubscriptionKey::new(bar.symbol.clone(), source);
        let Some(delta) = profiles.on_bar(&key, bar) else {
            return Delivery::default();
        };
        if delta.levels.is_empty() && !delta.reset {
            return Delivery::default();
        }
        let Some(record) = registry.get(&key) else {
            return Delivery::default();
        };

        let msg = ServerMessage::ProfileUpdate {
            symbol: key.symbol.clone(),
            reset: delta.reset,
            levels: delta.levels,
        };
        let json = match serde_json::to_string(&msg) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize profile update for {}: {}", key, e);
                return Delivery::default();
            }
        };

        let delivered = clients.send_raw_to(record.clients(), &json);
        let delivery = Delivery {
            delivered,
            dropped: record.refcount() - delivered,
        };
        counter!("gateway_profile_updates_total").increment(1);
        self.record_drops(&key, delivery.dropped, "profile");
        delivery
    }

    pub fn ticks_routed(&self) -> u64 {
        self.ticks_routed
    }

    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped
    }

    fn record_drops(&mut self, key: &SubscriptionKey, dropped: usize, kind: &'static str) {
        if dropped == 0 {
            return;
        }
        self.messages_dropped += dropped as u64;
        counter!("gateway_ticks_dropped_total", "kind" => kind).increment(dropped as u64);
        debug!("{} {} skipped for {} slow clients", key, kind, dropped);
    }
}
