//! Refcounted subscription registry.
//!
//! Maps each [`SubscriptionKey`] to the set of clients interested in it. The
//! boolean results of [`SubscriptionRegistry::add_interest`] and
//! [`SubscriptionRegistry::remove_interest`] tell the caller when the upstream
//! subscription must be opened or closed. The registry is mutated before any
//! upstream call is made, so two clients racing on a new key always produce a
//! single upstream subscribe.

use crate::client::ClientId;
use crate::types::{Source, SubscriptionKey};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Interest in one key. `refcount == clients.len()` at all times.
#[derive(Debug, Default)]
pub struct SubscriptionRecord {
    refcount: usize,
    clients: HashSet<ClientId>,
}

impl SubscriptionRecord {
    pub fn refcount(&self) -> usize {
        self.refcount
    }

    pub fn clients(&self) -> impl Iterator<Item = &ClientId> {
        self.clients.iter()
    }

    fn insert(&mut self, client: ClientId) -> bool {
        let added = self.clients.insert(client);
        if added {
            self.refcount += 1;
        }
        debug_assert_eq!(self.refcount, self.clients.len());
        added
    }

    fn remove(&mut self, client: &ClientId) -> bool {
        let removed = self.clients.remove(client);
        if removed {
            self.refcount -= 1;
        }
        debug_assert_eq!(self.refcount, self.clients.len());
        removed
    }
}

/// Owns every [`SubscriptionRecord`] plus a per-client index of the keys it holds.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    records: HashMap<SubscriptionKey, SubscriptionRecord>,
    by_client: HashMap<ClientId, HashSet<SubscriptionKey>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `client`'s interest in `key`.
    ///
    /// Returns true when this created the record, i.e. the caller must issue
    /// an upstream subscribe. Adding an interest the client already holds is a
    /// no-op and returns false.
    pub fn add_interest(&mut self, client: ClientId, key: &SubscriptionKey) -> bool {
        let created = !self.records.contains_key(key);
        let record = self.records.entry(key.clone()).or_default();
        if record.insert(client) {
            self.by_client.entry(client).or_default().insert(key.clone());
            debug!("Client {} interested in {} (refcount {})", client, key, record.refcount);
        }
        created
    }

    /// Drop `client`'s interest in `key`.
    ///
    /// Returns true when the record was deleted, i.e. the caller must issue an
    /// upstream unsubscribe.
    pub fn remove_interest(&mut self, client: ClientId, key: &SubscriptionKey) -> bool {
        let Some(record) = self.records.get_mut(key) else {
            return false;
        };
        if !record.remove(&client) {
            return false;
        }

        if let Some(keys) = self.by_client.get_mut(&client) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_client.remove(&client);
            }
        }

        if record.refcount == 0 {
            self.records.remove(key);
            debug!("Last interest in {} released", key);
            true
        } else {
            false
        }
    }

    /// Remove `client` from every key it touched. Returns the keys whose
    /// refcount dropped to zero, sorted.
    pub fn remove_client(&mut self, client: ClientId) -> Vec<SubscriptionKey> {
        let Some(keys) = self.by_client.remove(&client) else {
            return Vec::new();
        };

        let mut released = Vec::new();
        for key in keys {
            if let Some(record) = self.records.get_mut(&key) {
                record.remove(&client);
                if record.refcount == 0 {
                    self.records.remove(&key);
                    released.push(key);
                }
            }
        }
        released.sort();
        released
    }

    /// Delete `key` outright (e.g. the venue refused it). Returns the clients that held it.
    pub fn remove_key(&mut self, key: &SubscriptionKey) -> Vec<ClientId> {
        let Some(record) = self.records.remove(key) else {
            return Vec::new();
        };
        for client in &record.clients {
            if let Some(keys) = self.by_client.get_mut(client) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_client.remove(client);
                }
            }
        }
        record.clients.into_iter().collect()
    }

    pub fn get(&self, key: &SubscriptionKey) -> Option<&SubscriptionRecord> {
        self.records.get(key)
    }

    pub fn is_interested(&self, client: ClientId, key: &SubscriptionKey) -> bool {
        self.records
            .get(key)
            .is_some_and(|r| r.clients.contains(&client))
    }

    pub fn refcount(&self, key: &SubscriptionKey) -> usize {
        self.records.get(key).map_or(0, |r| r.refcount)
    }

    /// Every key with live interest on `source`.
    pub fn keys_for_source(&self, source: Source) -> Vec<SubscriptionKey> {
        self.records
            .keys()
            .filter(|k| k.source == source)
            .cloned()
            .collect()
    }

    /// Number of keys with live interest.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
