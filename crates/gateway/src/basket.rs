//! Per-basket lifecycle.
//!
//! ```text
//! INIT --subscribed--> COLLECTING --all legs--> READY
//! INIT --init timeout--> ERROR
//! COLLECTING --collection timeout--> PARTIAL (some legs) | ERROR (none)
//! ```
//!
//! Deadlines are plain instants owned by the machine; the caller polls
//! [`FxBasketStateMachine::fire_due`] from its timer loop. The init deadline is
//! armed at construction, so a basket whose subscription never happens still
//! terminates.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_COLLECTION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BasketState {
    Init,
    Collecting,
    Ready,
    Partial,
    Error,
}

impl BasketState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BasketState::Ready | BasketState::Partial | BasketState::Error)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BasketTimeouts {
    pub init: Duration,
    pub collection: Duration,
}

impl Default for BasketTimeouts {
    fn default() -> Self {
        Self {
            init: DEFAULT_INIT_TIMEOUT,
            collection: DEFAULT_COLLECTION_TIMEOUT,
        }
    }
}

#[derive(Debug)]
pub struct FxBasketStateMachine {
    name: String,
    legs: Vec<String>,
    received: BTreeMap<String, f64>,
    state: BasketState,
    timeouts: BasketTimeouts,
    init_deadline: Option<Instant>,
    collection_deadline: Option<Instant>,
}

impl FxBasketStateMachine {
    /// New basket in INIT with its init timer running from `now`.
    /// Duplicate legs are collapsed.
    pub fn new(
        name: impl Into<String>,
        legs: impl IntoIterator<Item = String>,
        timeouts: BasketTimeouts,
        now: Instant,
    ) -> Self {
        let mut legs: Vec<String> = legs.into_iter().collect();
        legs.sort();
        legs.dedup();
        Self {
            name: name.into(),
            legs,
            received: BTreeMap::new(),
            state: BasketState::Init,
            timeouts,
            init_deadline: Some(now + timeouts.init),
            collection_deadline: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BasketState {
        self.state
    }

    pub fn legs(&self) -> &[String] {
        &self.legs
    }

    /// Latest mid per leg.
    pub fn received(&self) -> &BTreeMap<String, f64> {
        &self.received
    }

    /// Legs with no data yet.
    pub fn missing(&self) -> Vec<String> {
        self.legs
            .iter()
            .filter(|leg| !self.received.contains_key(*leg))
            .cloned()
            .collect()
    }

    pub fn has_leg(&self, symbol: &str) -> bool {
        self.legs.binary_search_by(|l| l.as_str().cmp(symbol)).is_ok()
    }

    /// Leg subscriptions were issued. INIT moves to COLLECTING and the collection
    /// timer starts. Returns the new state if it changed.
    pub fn on_subscribed(&mut self, now: Instant) -> Option<BasketState> {
        if self.state != BasketState::Init {
            return None;
        }
        self.init_deadline = None;
        self.collection_deadline = Some(now + self.timeouts.collection);
        self.transition(BasketState::Collecting);
        if self.is_complete() {
            self.transition(BasketState::Ready);
        }
        Some(self.state)
    }

    /// Record a leg price. Legs arriving during INIT are kept but only count
    /// toward completion once collecting.
    pub fn on_leg(&mut self, symbol: &str, mid: f64) -> Option<BasketState> {
        if self.state.is_terminal() || !self.has_leg(symbol) {
            return None;
        }
        self.received.insert(symbol.to_string(), mid);
        if self.state == BasketState::Collecting && self.is_complete() {
            self.transition(BasketState::Ready);
            return Some(self.state);
        }
        None
    }

    /// Apply whichever timer has expired at `now`.
    pub fn fire_due(&mut self, now: Instant) -> Option<BasketState> {
        match self.state {
            BasketState::Init if self.init_deadline.is_some_and(|d| d <= now) => {
                info!("Basket {} init timeout", self.name);
                self.transition(BasketState::Error);
                Some(self.state)
            }
            BasketState::Collecting if self.collection_deadline.is_some_and(|d| d <= now) => {
                let next = if self.received.is_empty() {
                    BasketState::Error
                } else {
                    BasketState::Partial
                };
                info!(
                    "Basket {} collection timeout with {}/{} legs",
                    self.name,
                    self.received.len(),
                    self.legs.len()
                );
                self.transition(next);
                Some(self.state)
            }
            _ => None,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            BasketState::Init => self.init_deadline,
            BasketState::Collecting => self.collection_deadline,
            _ => None,
        }
    }

    /// Back to INIT with no legs and no timers. A later [`Self::rearm`] or
    /// [`Self::on_subscribed`] starts it again.
    pub fn reset(&mut self) {
        self.received.clear();
        self.clear_timers();
        self.state = BasketState::Init;
        debug!("Basket {} reset", self.name);
    }

    /// Restart the init timer from `now`.
    pub fn rearm(&mut self, now: Instant) {
        if self.state == BasketState::Init {
            self.init_deadline = Some(now + self.timeouts.init);
        }
    }

    fn is_complete(&self) -> bool {
        !self.legs.is_empty() && self.legs.iter().all(|leg| self.received.contains_key(leg))
    }

    fn transition(&mut self, next: BasketState) {
        debug!("Basket {}: {:?} -> {:?}", self.name, self.state, next);
        self.state = next;
        if next.is_terminal() {
            self.clear_timers();
        }
    }

    fn clear_timers(&mut self) {
        self.init_deadline = None;
        self.collection_deadline = None;
    }
}
