//! # Core Relay Module
//!
//! The bookkeeping half of the relay: who is connected, who wants which product, and how
//! the upstream connector backs off when the exchange goes away.
//!
//! ## Core Components:
//!
//! - **`model`**: events, statuses and the JSON frames exchanged with clients.
//! - **`registry`**: reference-counted client/product edges with one slot per supported
//!   product. Asks the upstream for more data on every 0 -> 1 subscriber transition.
//! - **`sessions`**: per-client bounded queues, request validation and fan-out.
//! - **`backoff`**: the bounded exponential reconnect schedule.
//! - **`relay`** (feature `ingestors`): the context object that owns the connector and the
//!   session manager and serializes every mutation through one dispatch loop.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod backoff;
pub mod model;
pub mod registry;
#[cfg(feature = "ingestors")]
pub mod relay;
pub mod sessions;

// --- Public API Re-exports ---
pub use backoff::{backoff_delay, ReconnectPolicy, ReconnectState};
pub use model::{
    ChannelState, ChannelStatus, ClientEvent, ClientId, ClientRequest, ConnectionState,
    ErrorKind, FeedEvent, PriceTick, ProductId, ProductRequest, ServiceError, ServiceStatus,
    TradeEvent, TradeSide,
};
pub use registry::{SubscriptionRegistry, UpstreamSubscriber};
#[cfg(feature = "ingestors")]
pub use relay::{Relay, RelayConfig, RelayHandle};
pub use sessions::{ClientSessionManager, SessionSender};
