//! # lib_common
//!
//! Shared library behind the Coinbase market-data relay. It keeps exactly one logical
//! connection to the exchange feed and fans its price ticks and trade prints out to many
//! downstream clients, each interested in its own, changing set of products.
//!
//! Modules are gated by cargo features so that code which only needs the bookkeeping side
//! (`core`) does not pull in the WebSocket stack (`ingestors`).

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "core")]
pub mod errors;
#[cfg(feature = "ingestors")]
pub mod ingestors;

#[cfg(feature = "core")]
pub use errors::{RelayError, Result};
