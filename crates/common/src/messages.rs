//! Control messages for a running upstream connection.

/// Commands sent to a [`WsManager`](crate::WsManager) mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Start streaming these symbols.
    Subscribe(Vec<String>),
    /// Stop streaming these symbols.
    Unsubscribe(Vec<String>),
    /// Drop the current connection (if any) and dial again.
    Reconnect,
    /// Graceful shutdown
    Shutdown,
}
