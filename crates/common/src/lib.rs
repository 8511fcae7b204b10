//! Upstream WebSocket plumbing for the market-data gateway.
//!
//! A [`WsManager`] owns one streaming connection and delegates every frame to a
//! [`WsHandler`]. Reconnection is driven from outside through
//! [`ControlCommand::Reconnect`] so the caller can apply its own backoff.

pub mod error;
pub mod messages;
pub mod ws_handler;
pub mod ws_manager;

pub use error::Error;
pub use messages::ControlCommand;
pub use ws_handler::WsHandler;
pub use ws_manager::{WsManager, WsManagerConfig};
