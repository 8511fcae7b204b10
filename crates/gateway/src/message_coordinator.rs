//! Basket assembly across clients.
//!
//! Holds one [`FxBasketStateMachine`] per (client, basket name), feeds them
//! primary-venue ticks for their legs and drives their timers. Every call
//! returns the transitions that must be reported to the owning clients.

use crate::basket::{BasketState, BasketTimeouts, FxBasketStateMachine};
use crate::client::ClientId;
use crate::protocol::BasketStateData;
use crate::types::{Source, TickEvent};
use metrics::gauge;
use std::collections::{HashMap, HashSet};
use tokio::time::Instant;
use tracing::{debug, info};

/// Venue basket legs are taken from.
pub const BASKET_SOURCE: Source = Source::PrimaryVenue;

type BasketId = (ClientId, String);

/// A basket transition addressed to its owner.
#[derive(Debug, Clone, PartialEq)]
pub struct BasketUpdate {
    pub client: ClientId,
    pub data: BasketStateData,
}

#[derive(Debug, Default)]
pub struct MessageCoordinator {
    baskets: HashMap<BasketId, FxBasketStateMachine>,
    by_leg: HashMap<String, HashSet<BasketId>>,
    timeouts: BasketTimeouts,
}

impl MessageCoordinator {
    pub fn new(timeouts: BasketTimeouts) -> Self {
        Self {
            baskets: HashMap::new(),
            by_leg: HashMap::new(),
            timeouts,
        }
    }

    /// Create `client`'s basket. Its init timer starts now. When `source_ready`
    /// the leg subscriptions are live and it moves straight to COLLECTING.
    ///
    /// Returns the legs of a basket with the same name that was replaced, plus
    /// the updates to report. Subscribing again with the same legs restarts
    /// the existing basket in place.
    pub fn subscribe(
        &mut self,
        client: ClientId,
        basket: &str,
        mut legs: Vec<String>,
        now: Instant,
        source_ready: bool,
    ) -> (Vec<String>, Vec<BasketUpdate>) {
        legs.sort();
        legs.dedup();
        let id: BasketId = (client, basket.to_string());

        if let Some(machine) = self.baskets.get_mut(&id) {
            if machine.legs() == legs.as_slice() {
                machine.reset();
                machine.rearm(now);
                let mut updates = vec![BasketUpdate {
                    client,
                    data: snapshot(machine),
                }];
                if source_ready && machine.on_subscribed(now).is_some() {
                    updates.push(BasketUpdate {
                        client,
                        data: snapshot(machine),
                    });
                }
                info!("Client {} basket {} restarted ({:?})", client, basket, machine.state());
                return (legs, updates);
            }
        }

        let replaced = self.remove(client, basket).unwrap_or_default();
        let mut machine = FxBasketStateMachine::new(basket, legs, self.timeouts, now);
        for leg in machine.legs() {
            self.by_leg.entry(leg.clone()).or_default().insert(id.clone());
        }

        let mut updates = vec![BasketUpdate {
            client,
            data: snapshot(&machine),
        }];
        if source_ready && machine.on_subscribed(now).is_some() {
            updates.push(BasketUpdate {
                client,
                data: snapshot(&machine),
            });
        }

        info!(
            "Client {} basket {} created with {} legs ({:?})",
            client,
            basket,
            machine.legs().len(),
            machine.state()
        );
        self.baskets.insert(id, machine);
        self.update_gauge();
        (replaced, updates)
    }

    /// Feed a tick to every basket holding its symbol as a leg.
    pub fn on_tick(&mut self, tick: &TickEvent) -> Vec<BasketUpdate> {
        if tick.source != BASKET_SOURCE {
            return Vec::new();
        }
        let Some(ids) = self.by_leg.get(&tick.symbol) else {
            return Vec::new();
        };

        let mid = tick.mid();
        let mut updates = Vec::new();
        for id in ids {
            if let Some(machine) = self.baskets.get_mut(id) {
                if machine.on_leg(&tick.symbol, mid).is_some() {
                    updates.push(BasketUpdate {
                        client: id.0,
                        data: snapshot(machine),
                    });
                }
            }
        }
        updates
    }

    /// The basket source became ready: INIT baskets start collecting.
    pub fn on_source_ready(&mut self, source: Source, now: Instant) -> Vec<BasketUpdate> {
        if source != BASKET_SOURCE {
            return Vec::new();
        }
        let mut updates = Vec::new();
        for ((client, _), machine) in self.baskets.iter_mut() {
            if machine.on_subscribed(now).is_some() {
                updates.push(BasketUpdate {
                    client: *client,
                    data: snapshot(machine),
                });
            }
        }
        if !updates.is_empty() {
            debug!("{} baskets released into collection", updates.len());
        }
        updates
    }

    /// Fire expired init and collection timers.
    pub fn fire_due(&mut self, now: Instant) -> Vec<BasketUpdate> {
        let mut updates = Vec::new();
        for ((client, _), machine) in self.baskets.iter_mut() {
            if machine.fire_due(now).is_some() {
                updates.push(BasketUpdate {
                    client: *client,
                    data: snapshot(machine),
                });
            }
        }
        updates
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.baskets
            .values()
            .filter_map(FxBasketStateMachine::next_deadline)
            .min()
    }

    /// Drop one basket. Returns its legs, or None if it did not exist.
    pub fn remove(&mut self, client: ClientId, basket: &str) -> Option<Vec<String>> {
        let id: BasketId = (client, basket.to_string());
        let machine = self.baskets.remove(&id)?;
        for leg in machine.legs() {
            if let Some(ids) = self.by_leg.get_mut(leg) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_leg.remove(leg);
                }
            }
        }
        self.update_gauge();
        debug!("Client {} basket {} removed", client, basket);
        Some(machine.legs().to_vec())
    }

    /// Drop every basket owned by `client`. Returns the union of their legs.
    pub fn remove_client(&mut self, client: ClientId) -> Vec<String> {
        let names: Vec<String> = self
            .baskets
            .keys()
            .filter(|(owner, _)| *owner == client)
            .map(|(_, name)| name.clone())
            .collect();

        let mut legs: Vec<String> = names
            .iter()
            .filter_map(|name| self.remove(client, name))
            .flatten()
            .collect();
        legs.sort();
        legs.dedup();
        legs
    }

    /// Whether any of `client`'s baskets has `symbol` as a leg.
    pub fn client_uses_leg(&self, client: ClientId, symbol: &str) -> bool {
        self.by_leg
            .get(symbol)
            .is_some_and(|ids| ids.iter().any(|(owner, _)| *owner == client))
    }

    pub fn state(&self, client: ClientId, basket: &str) -> Option<BasketState> {
        self.baskets
            .get(&(client, basket.to_string()))
            .map(FxBasketStateMachine::state)
    }

    pub fn len(&self) -> usize {
        self.baskets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baskets.is_empty()
    }

    fn update_gauge(&self) {
        gauge!("gateway_active_baskets").set(self.baskets.len() as f64);
    }
}

fn snapshot(machine: &FxBasketStateMachine) -> BasketStateData {
    BasketStateData {
        basket: machine.name().to_string(),
        state: machine.state(),
        legs: machine.received().clone(),
        missing: machine.missing(),
    }
}
