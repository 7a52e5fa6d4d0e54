//! # Subscription Registry
//!
//! Owns the bidirectional relation between clients and products. The product set is fixed
//! at startup, so every product gets a slot in a small arena holding the ids of the clients
//! that want it; a product's subscriber count is the size of that set and can never drift
//! from the edge set.
//!
//! When a product gains its first subscriber the registry asks the upstream side for the
//! full set of products that currently have subscribers. Losing the last subscriber is a
//! local bookkeeping change only: upstream interest is never withdrawn.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;

use crate::core::model::{ChannelState, ChannelStatus, ClientId, ProductId};
use crate::errors::{RelayError, Result};

/// The side of the relay that talks to the exchange. Implemented by the feed connector;
/// tests substitute a recorder.
pub trait UpstreamSubscriber: Send + Sync {
    /// `products` restates the complete desired interest set, not a delta.
    fn request_subscribe(&self, products: BTreeSet<ProductId>);
}

struct ProductSlot {
    product_id: ProductId,
    display_name: String,
    clients: BTreeSet<ClientId>,
}

pub struct SubscriptionRegistry {
    slots: Vec<ProductSlot>,
    /// client -> indices into `slots`
    client_products: HashMap<ClientId, BTreeSet<usize>>,
    upstream: Arc<dyn UpstreamSubscriber>,
}

impl SubscriptionRegistry {
    /// Builds one slot per supported product, in the given order. Duplicates are dropped.
    pub fn new(products: &[ProductId], upstream: Arc<dyn UpstreamSubscriber>) -> Self {
        let mut slots: Vec<ProductSlot> = Vec::with_capacity(products.len());
        for product_id in products {
            if slots.iter().any(|s| &s.product_id == product_id) {
                continue;
            }
            slots.push(ProductSlot {
                product_id: product_id.clone(),
                display_name: format!("{} WebSocket", product_id),
                clients: BTreeSet::new(),
            });
        }
        Self {
            slots,
            client_products: HashMap::new(),
            upstream,
        }
    }

    fn slot_index(&self, product_id: &str) -> Result<usize> {
        self.slots
            .iter()
            .position(|s| s.product_id == product_id)
            .ok_or_else(|| RelayError::UnsupportedProduct(product_id.to_string()))
    }

    pub fn is_supported(&self, product_id: &str) -> bool {
        self.slots.iter().any(|s| s.product_id == product_id)
    }

    /// Registers a client with no interests. Idempotent.
    pub fn register_client(&mut self, client_id: ClientId) {
        self.client_products.entry(client_id).or_default();
    }

    /// Adds the `(client, product)` edge if absent.
    ///
    /// Returns `true` when this was the product's first subscriber, in which case the
    /// upstream has already been asked for the updated interest set.
    pub fn subscribe(&mut self, client_id: ClientId, product_id: &str) -> Result<bool> {
        let index = self.slot_index(product_id)?;
        let slot = &mut self.slots[index];

        if !slot.clients.insert(client_id) {
            return Ok(false);
        }
        self.client_products.entry(client_id).or_default().insert(index);

        let first = slot.clients.len() == 1;
        if first {
            log::info!("First subscriber for {}, updating upstream interest", product_id);
            self.upstream.request_subscribe(self.active_products());
        }
        Ok(first)
    }

    /// Removes the `(client, product)` edge if present. Returns whether an edge was removed.
    pub fn unsubscribe(&mut self, client_id: ClientId, product_id: &str) -> Result<bool> {
        let index = self.slot_index(product_id)?;
        let removed = self.slots[index].clients.remove(&client_id);
        if removed {
            if let Some(products) = self.client_products.get_mut(&client_id) {
                products.remove(&index);
            }
            if self.slots[index].clients.is_empty() {
                log::debug!("No subscribers left for {}", product_id);
            }
        }
        Ok(removed)
    }

    /// Drops every edge owned by the client along with the client itself.
    /// Returns the number of edges removed; zero for unknown clients.
    pub fn remove_client(&mut self, client_id: ClientId) -> usize {
        let Some(indices) = self.client_products.remove(&client_id) else {
            return 0;
        };
        for &index in &indices {
            self.slots[index].clients.remove(&client_id);
        }
        indices.len()
    }

    pub fn interested_clients(&self, product_id: &str) -> impl Iterator<Item = ClientId> + '_ {
        self.slots
            .iter()
            .find(|s| s.product_id == product_id)
            .into_iter()
            .flat_map(|s| s.clients.iter().copied())
    }

    pub fn subscriber_count(&self, product_id: &str) -> usize {
        self.slots
            .iter()
            .find(|s| s.product_id == product_id)
            .map_or(0, |s| s.clients.len())
    }

    /// Products with at least one subscriber.
    pub fn active_products(&self) -> BTreeSet<ProductId> {
        self.slots
            .iter()
            .filter(|s| !s.clients.is_empty())
            .map(|s| s.product_id.clone())
            .collect()
    }

    pub fn products(&self) -> impl Iterator<Item = &str> + '_ {
        self.slots.iter().map(|s| s.product_id.as_str())
    }

    /// One entry per supported product, in configuration order.
    pub fn snapshot(&self) -> Vec<ChannelStatus> {
        let now = Utc::now();
        self.slots
            .iter()
            .map(|slot| {
                let count = slot.clients.len();
                ChannelStatus {
                    product_id: slot.product_id.clone(),
                    display_name: slot.display_name.clone(),
                    state: if count > 0 {
                        ChannelState::Subscribed
                    } else {
                        ChannelState::Available
                    },
                    subscriber_count: count,
                    last_update: now,
                }
            })
            .collect()
    }
}
