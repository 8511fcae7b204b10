//! Fetch coalescing and retry.
//!
//! One `PendingRequest` per [`FetchKey`]: the first client asking for a key
//! causes a single upstream fetch, later clients join its waiter list, and
//! every waiter receives the same outcome. Transient failures are retried with
//! backoff behind the clients' backs; they only hear about it once retries are
//! exhausted.
//!
//! The coordinator does no I/O. It tells the caller what to issue and whom to
//! answer, and keeps retry deadlines for the gateway's timer loop.

use crate::backoff::RetryPolicy;
use crate::client::ClientId;
use crate::types::SubscriptionKey;
use crate::upstream::{ErrorClass, FetchKey, UpstreamError, UpstreamPackage};
use metrics::counter;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// An in-flight fetch and the clients awaiting it.
#[derive(Debug)]
struct PendingRequest {
    waiters: Vec<ClientId>,
    attempt: u32,
    retry_at: Option<Instant>,
}

/// Result of [`RequestCoordinator::fetch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStart {
    /// No fetch in flight for this key; the caller must issue one.
    Issue(FetchKey),
    /// Joined an existing fetch.
    Joined,
}

/// Result of [`RequestCoordinator::complete`].
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Ready {
        waiters: Vec<ClientId>,
        package: UpstreamPackage,
    },
    /// The venue restricts this instrument; answer with degraded data.
    Degraded { waiters: Vec<ClientId> },
    /// A retry is armed; nothing to tell clients yet.
    RetryScheduled { delay: Duration },
    /// Connection was lost; re-issue the fetch when the upstream is back.
    Requeue(FetchKey),
    Failed {
        waiters: Vec<ClientId>,
        error: UpstreamError,
    },
    /// Nobody is waiting on this key any more.
    Orphaned,
}

#[derive(Debug, Default)]
pub struct RequestCoordinator {
    pending: HashMap<FetchKey, PendingRequest>,
    retry: RetryPolicy,
}

impl RequestCoordinator {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            pending: HashMap::new(),
            retry,
        }
    }

    /// Add `client` as a waiter for `key`.
    pub fn fetch(&mut self, key: FetchKey, client: ClientId) -> FetchStart {
        if let Some(pending) = self.pending.get_mut(&key) {
            if !pending.waiters.contains(&client) {
                pending.waiters.push(client);
            }
            counter!("gateway_fetches_coalesced_total").increment(1);
            debug!("Client {} joined fetch {:?} ({} waiters)", client, key, pending.waiters.len());
            return FetchStart::Joined;
        }

        self.pending.insert(
            key.clone(),
            PendingRequest {
                waiters: vec![client],
                attempt: 0,
                retry_at: None,
            },
        );
        counter!("gateway_fetches_issued_total").increment(1);
        FetchStart::Issue(key)
    }

    /// Resolve a fetch completion into what the caller must do next.
    pub fn complete(
        &mut self,
        key: &FetchKey,
        result: Result<UpstreamPackage, UpstreamError>,
        now: Instant,
    ) -> FetchOutcome {
        let Some(pending) = self.pending.get_mut(key) else {
            debug!("Completion for {:?} with no pending request", key);
            return FetchOutcome::Orphaned;
        };

        if pending.waiters.is_empty() {
            self.pending.remove(key);
            debug!("Fetch {:?} resolved after every waiter left", key);
            return FetchOutcome::Orphaned;
        }

        let error = match result {
            Ok(package) => {
                let waiters = self.take(key);
                return FetchOutcome::Ready { waiters, package };
            }
            Err(error) => error,
        };

        match error.class() {
            ErrorClass::Transient => match self.retry.next_delay(pending.attempt) {
                Some(delay) => {
                    pending.attempt += 1;
                    pending.retry_at = Some(now + delay);
                    counter!("gateway_fetch_retries_total").increment(1);
                    info!(
                        "Fetch {:?} failed ({}), retry {}/{} in {:?}",
                        key, error, pending.attempt, self.retry.max_retries, delay
                    );
                    FetchOutcome::RetryScheduled { delay }
                }
                None => {
                    warn!("Fetch {:?} failed after {} retries: {}", key, pending.attempt, error);
                    let waiters = self.take(key);
                    FetchOutcome::Failed { waiters, error }
                }
            },
            ErrorClass::Restricted => {
                info!("Fetch {:?} restricted: {}", key, error);
                let waiters = self.take(key);
                FetchOutcome::Degraded { waiters }
            }
            ErrorClass::Connection => {
                debug!("Fetch {:?} lost its connection, requeueing", key);
                FetchOutcome::Requeue(key.clone())
            }
            ErrorClass::Fatal => {
                warn!("Fetch {:?} failed: {}", key, error);
                let waiters = self.take(key);
                FetchOutcome::Failed { waiters, error }
            }
        }
    }

    /// Keys whose retry deadline has passed, sorted. Their deadlines are cleared.
    pub fn due_retries(&mut self, now: Instant) -> Vec<FetchKey> {
        let mut due: Vec<FetchKey> = self
            .pending
            .iter_mut()
            .filter_map(|(key, pending)| match pending.retry_at {
                Some(at) if at <= now => {
                    pending.retry_at = None;
                    Some(key.clone())
                }
                _ => None,
            })
            .collect();
        due.sort();
        due
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().filter_map(|p| p.retry_at).min()
    }

    /// Drop `client` from every waiter list. In-flight fetches keep running.
    pub fn remove_client(&mut self, client: ClientId) {
        for pending in self.pending.values_mut() {
            pending.waiters.retain(|w| *w != client);
        }
        // A fetch waiting only on a retry timer has nothing left to do.
        self.pending
            .retain(|_, p| !(p.waiters.is_empty() && p.retry_at.is_some()));
    }

    /// Drop `client` from every fetch of `symbol` on `key`'s source.
    pub fn release(&mut self, client: ClientId, key: &SubscriptionKey) {
        for (fetch_key, pending) in self.pending.iter_mut() {
            if fetch_key.symbol == key.symbol && fetch_key.source == key.source {
                pending.waiters.retain(|w| *w != client);
            }
        }
        self.pending
            .retain(|_, p| !(p.waiters.is_empty() && p.retry_at.is_some()));
    }

    /// Give up on `key` (e.g. the upstream queue refused it). Returns its waiters.
    pub fn abandon(&mut self, key: &FetchKey) -> Vec<ClientId> {
        self.take(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn take(&mut self, key: &FetchKey) -> Vec<ClientId> {
        self.pending
            .remove(key)
            .map(|p| p.waiters)
            .unwrap_or_default()
    }
}
