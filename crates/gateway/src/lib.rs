//! Gateway service for real-time market data to WebSocket clients.
//!
//! This service:
//! - Accepts WebSocket connections from trading clients
//! - Deduplicates their symbol interest into one upstream subscription per
//!   (symbol, source), reference counted
//! - Coalesces concurrent data-package requests and retries transient failures
//! - Queues upstream requests while a feed is reconnecting and replays them in order
//! - Assembles multi-leg FX baskets and maintains live market profiles
//!
//! ## Architecture
//!
//! ```text
//! feed bridge (ws + rest)          feed bridge
//!         ↓ FeedSession                ↓
//! UpstreamEvent ──────→ Gateway actor ←── GatewayHandle ←── ws_server
//!                          │  ↑
//!           UpstreamRequest│  │UpstreamCompletion
//!                          ↓  │
//!                   per-source dispatcher (FIFO)
//! ```
//!
//! All mutable state lives in the [`Gateway`] task; nothing is shared behind
//! locks. Timers are deadlines owned by the components that need them.

pub mod backoff;
pub mod basket;
pub mod client;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod feed;
pub mod message_coordinator;
pub mod profile;
pub mod protocol;
pub mod router;
pub mod service;
pub mod status;
pub mod subscription;
pub mod types;
pub mod upstream;
pub mod ws_server;

pub use basket::{BasketState, FxBasketStateMachine};
pub use client::{ClientDirectory, ClientId, ClientState};
pub use config::{FeedConfig, GatewayConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use coordinator::RequestCoordinator;
pub use error::{GatewayError, Result};
pub use feed::FeedSession;
pub use message_coordinator::MessageCoordinator;
pub use profile::{MarketProfileLevel, MarketProfileService};
pub use protocol::{ClientMessage, ServerMessage, SymbolDataPackage};
pub use router::DataRouter;
pub use service::{Gateway, GatewayEvent, GatewayHandle, GatewaySettings, GatewayStats};
pub use subscription::SubscriptionRegistry;
pub use types::{Source, SubscriptionKey, TickEvent};
pub use upstream::{UpstreamError, UpstreamEvent, UpstreamSession};
pub use ws_server::{create_router, AppState};
