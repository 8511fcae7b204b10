//! Unified upstream status for clients.

use crate::client::{ClientDirectory, ClientId};
use crate::connection::ConnectionState;
use crate::protocol::{ServerMessage, StatusMessage, UnifiedStatus};
use crate::types::Source;
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// Per-source view fed to [`StatusBroadcaster`].
#[derive(Debug, Clone)]
pub struct SourceStatus<'a> {
    pub source: Source,
    pub state: ConnectionState,
    pub available_symbols: &'a [String],
}

/// Computes the unified status and fans it out when it changes.
#[derive(Debug, Default)]
pub struct StatusBroadcaster {
    current: Option<StatusMessage>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold per-source states into one client-facing status.
    ///
    /// `error` wins, then `connected` when every source is ready, then
    /// `connecting`, else `disconnected`. Symbols come from ready sources only.
    pub fn compute<'a, I>(sources: I) -> StatusMessage
    where
        I: IntoIterator<Item = SourceStatus<'a>>,
    {
        let mut states = BTreeMap::new();
        let mut symbols = BTreeSet::new();
        for s in sources {
            if s.state == ConnectionState::Ready {
                symbols.extend(s.available_symbols.iter().cloned());
            }
            states.insert(s.source, s.state);
        }

        let status = if states.values().any(|s| *s == ConnectionState::Error) {
            UnifiedStatus::Error
        } else if !states.is_empty() && states.values().all(|s| *s == ConnectionState::Ready) {
            UnifiedStatus::Connected
        } else if states.values().any(|s| *s == ConnectionState::Connecting) {
            UnifiedStatus::Connecting
        } else {
            UnifiedStatus::Disconnected
        };

        StatusMessage {
            status,
            available_symbols: symbols.into_iter().collect(),
            sources: states,
        }
    }

    /// Recompute and broadcast to every client if anything changed.
    /// Returns true when a broadcast went out.
    pub fn update<'a, I>(&mut self, sources: I, clients: &ClientDirectory) -> bool
    where
        I: IntoIterator<Item = SourceStatus<'a>>,
    {
        let next = Self::compute(sources);
        if self.current.as_ref() == Some(&next) {
            return false;
        }

        info!(
            "Status {:?} ({} symbols) -> {} clients",
            next.status,
            next.available_symbols.len(),
            clients.len()
        );
        clients.broadcast(&ServerMessage::Status(next.clone()));
        self.current = Some(next);
        true
    }

    /// Send the last computed status to one client (late joiner).
    pub fn send_current(&self, client: &ClientId, clients: &ClientDirectory) -> bool {
        match &self.current {
            Some(status) => clients.send(client, &ServerMessage::Status(status.clone())),
            None => false,
        }
    }

    pub fn current(&self) -> Option<&StatusMessage> {
        self.current.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientState;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn status(states: Vec<(Source, ConnectionState, Vec<String>)>) -> StatusMessage {
        StatusBroadcaster::compute(states.iter().map(|(source, state, symbols)| SourceStatus {
            source: *source,
            state: *state,
            available_symbols: symbols,
        }))
    }

    #[test]
    fn test_unified_status_precedence() {
        let syms = vec!["GBPUSD".to_string(), "EURUSD".to_string()];
        let other = vec!["EURUSD".to_string(), "XAUUSD".to_string()];
        use ConnectionState::*;

        let s = status(vec![
            (Source::PrimaryVenue, Ready, syms.clone()),
            (Source::SecondaryVenue, Ready, other),
        ]);
        assert_eq!(s.status, UnifiedStatus::Connected);
        assert_eq!(s.available_symbols, vec!["EURUSD", "GBPUSD", "XAUUSD"]);

        let s = status(vec![
            (Source::PrimaryVenue, Ready, syms),
            (Source::SecondaryVenue, Connecting, vec![]),
        ]);
        assert_eq!(s.status, UnifiedStatus::Connecting);
        assert_eq!(s.available_symbols, vec!["EURUSD", "GBPUSD"]);

        let s = status(vec![
            (Source::PrimaryVenue, Error, vec![]),
            (Source::SecondaryVenue, Connecting, vec![]),
        ]);
        assert_eq!(s.status, UnifiedStatus::Error);

        let s = status(vec![(Source::PrimaryVenue, Disconnecting, vec![])]);
        assert_eq!(s.status, UnifiedStatus::Disconnected);
        assert!(s.available_symbols.is_empty());
    }

    #[test]
    fn test_broadcast_only_on_change_and_late_joiner() {
        let mut clients = ClientDirectory::new();
        let (tx, mut rx) = mpsc::channel(8);
        clients.register(ClientState::new(Uuid::new_v4(), tx));

        let mut broadcaster = StatusBroadcaster::new();
        let ready = [SourceStatus {
            source: Source::PrimaryVenue,
            state: ConnectionState::Ready,
            available_symbols: &[],
        }];
        assert!(broadcaster.update(ready.clone(), &clients));
        assert!(!broadcaster.update(ready, &clients));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        let (tx, mut late_rx) = mpsc::channel(8);
        let late = clients.register(ClientState::new(Uuid::new_v4(), tx));
        assert!(broadcaster.send_current(&late, &clients));
        assert!(late_rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
