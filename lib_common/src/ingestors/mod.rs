//! # Data Ingestors Module
//!
//! Clients for upstream market-data sources. Each submodule owns the protocol details of
//! one source and hands normalized [`FeedEvent`](crate::core::model::FeedEvent)s to the
//! relay.
//!
//! ## Contained Modules:
//! - **`coinbase_wss`**: the resilient connector for the Coinbase Exchange WebSocket feed
//!   (reconnect backoff, heartbeat, level-based resubscription).
//! - **`coinbase_frames`**: decoding and validation of `ticker`, `match` and `error`
//!   frames, and the outbound subscribe frame.
//! - **`transport`**: the connection seam the connector talks through, with its
//!   `tokio-tungstenite` implementation.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Frame decoding for the Coinbase feed.
pub mod coinbase_frames;
/// The upstream connector task and its handle.
pub mod coinbase_wss;
/// Transport traits and the WebSocket implementation.
pub mod transport;

// --- Public API Re-exports ---
pub use coinbase_wss::{CoinbaseConfig, FeedConnector};
pub use transport::{FeedConnection, FeedTransport, WsTransport};
