//! Connected client state and the directory of open transports.
//!
//! Every send is best-effort: a client whose bounded channel is full is
//! skipped for that message rather than blocking the gateway.

use crate::protocol::ServerMessage;
use crate::types::SubscriptionKey;
use axum::extract::ws::Message;
use chrono::Utc;
use metrics::counter;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique client identifier.
pub type ClientId = Uuid;

/// Default buffer size for client message channels.
/// Sized for ~1 second of high-frequency updates at 1000 msgs/sec.
pub const CLIENT_CHANNEL_BUFFER_SIZE: usize = 1000;

/// State for a single connected client.
#[derive(Debug)]
pub struct ClientState {
    /// Unique client identifier.
    pub id: ClientId,
    /// Channel to the client's WebSocket writer.
    pub tx: mpsc::Sender<Message>,
    /// Milliseconds since epoch when the client connected.
    pub connected_at: i64,
    /// Keys the client asked for by symbol (as opposed to through a basket).
    pub direct_keys: HashSet<SubscriptionKey>,
}

impl ClientState {
    pub fn new(id: ClientId, tx: mpsc::Sender<Message>) -> Self {
        Self {
            id,
            tx,
            connected_at: Utc::now().timestamp_millis(),
            direct_keys: HashSet::new(),
        }
    }

    /// Serialize and send a message. Returns false if it was not delivered.
    pub fn send(&self, msg: &ServerMessage) -> bool {
        match serde_json::to_string(msg) {
            Ok(json) => self.send_raw(&json),
            Err(e) => {
                warn!("Failed to serialize message for {}: {}", self.id, e);
                false
            }
        }
    }

    /// Send pre-serialized JSON. Returns false if the buffer is full or closed.
    pub fn send_raw(&self, json: &str) -> bool {
        self.tx.try_send(Message::Text(json.to_owned().into())).is_ok()
    }
}

/// All connected clients, owned by the gateway actor.
#[derive(Debug, Default)]
pub struct ClientDirectory {
    clients: HashMap<ClientId, ClientState>,
}

impl ClientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, client: ClientState) -> ClientId {
        let id = client.id;
        self.clients.insert(id, client);
        info!("Client {} registered", id);
        id
    }

    pub fn unregister(&mut self, client_id: &ClientId) -> Option<ClientState> {
        let removed = self.clients.remove(client_id);
        if removed.is_some() {
            info!("Client {} unregistered", client_id);
        }
        removed
    }

    pub fn get(&self, client_id: &ClientId) -> Option<&ClientState> {
        self.clients.get(client_id)
    }

    pub fn get_mut(&mut self, client_id: &ClientId) -> Option<&mut ClientState> {
        self.clients.get_mut(client_id)
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.clients.contains_key(client_id)
    }

    /// Send to one client. Unknown clients are ignored.
    pub fn send(&self, client_id: &ClientId, msg: &ServerMessage) -> bool {
        match self.clients.get(client_id) {
            Some(client) => {
                let sent = client.send(msg);
                if !sent {
                    debug!("Client {} not writable, message skipped", client_id);
                    counter!("gateway_messages_dropped_total").increment(1);
                }
                sent
            }
            None => false,
        }
    }

    /// Send pre-serialized JSON to each listed client. Returns how many accepted it.
    pub fn send_raw_to<'a, I>(&self, ids: I, json: &str) -> usize
    where
        I: IntoIterator<Item = &'a ClientId>,
    {
        ids.into_iter()
            .filter_map(|id| self.clients.get(id))
            .filter(|client| client.send_raw(json))
            .count()
    }

    /// Send one message to every client, serializing once.
    pub fn broadcast(&self, msg: &ServerMessage) -> usize {
        let json = match serde_json::to_string(msg) {
            Ok(j) => j,
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return 0;
            }
        };
        self.send_raw_to(self.clients.keys(), &json)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
