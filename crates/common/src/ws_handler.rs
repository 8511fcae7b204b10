//! WebSocket handler trait for upstream adapters.

use crate::error::{Error, Result};
use crate::messages::ControlCommand;
use async_trait::async_trait;

/// Trait that upstream adapters implement to handle WebSocket events.
/// The WsManager calls these methods when events occur.
#[async_trait]
pub trait WsHandler: Send + Sync + 'static {
    /// Returns the WebSocket URL to connect to.
    fn url(&self) -> &str;

    /// Returns the message to send immediately after connection (e.g. an auth frame).
    /// Return None if no initial message is needed.
    fn on_connect_message(&self) -> Option<String>;

    /// Called when a text message is received from the WebSocket.
    async fn on_message(&self, msg: &str) -> Result<()>;

    /// Called when a binary message is received from the WebSocket.
    /// Default implementation ignores binary messages.
    async fn on_binary_message(&self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Called once the socket is open and the connect message has been sent.
    async fn on_connected(&self) {}

    /// Called when an established connection is lost.
    async fn on_disconnect(&self) {}

    /// Called when a connection attempt fails before the socket opens.
    async fn on_connect_error(&self, _err: &Error) {}

    /// Translate a subscribe/unsubscribe command into the frame to send.
    /// Returning None sends nothing.
    fn command_message(&self, cmd: &ControlCommand) -> Option<String>;
}
