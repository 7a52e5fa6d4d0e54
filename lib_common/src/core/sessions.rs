//! # Client Session Manager
//!
//! Tracks every connected downstream client and routes events to it. Each session owns a
//! bounded channel; delivery uses `try_send`, so a slow client only loses its own frames
//! and never stalls the fan-out to everybody else. Events are wrapped in an `Arc` once and
//! the same allocation is handed to every recipient.
//!
//! All subscription changes are delegated to the [`SubscriptionRegistry`]. After every
//! change the updated channel snapshot is pushed to all sessions before the next command is
//! processed, so a client never sees a count older than its own change.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::core::model::{ClientEvent, ClientId, ClientRequest, FeedEvent};
use crate::core::registry::SubscriptionRegistry;
use crate::errors::RelayError;

/// Sending half of a session's outbound queue.
pub type SessionSender = mpsc::Sender<Arc<ClientEvent>>;

struct SessionHandle {
    sender: SessionSender,
    /// Frames dropped because the client's queue was full.
    dropped: u64,
}

pub struct ClientSessionManager {
    sessions: HashMap<ClientId, SessionHandle>,
    registry: SubscriptionRegistry,
}

impl ClientSessionManager {
    pub fn new(registry: SubscriptionRegistry) -> Self {
        Self {
            sessions: HashMap::new(),
            registry,
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Registers a new session with no interests and sends it the current snapshot.
    pub fn on_connect(&mut self, client_id: ClientId, sender: SessionSender) {
        self.registry.register_client(client_id);
        self.sessions.insert(client_id, SessionHandle { sender, dropped: 0 });
        log::info!("Client {} connected ({} sessions)", client_id, self.sessions.len());

        let snapshot = Arc::new(ClientEvent::ChannelUpdate(self.registry.snapshot()));
        self.deliver(client_id, snapshot);
    }

    /// Handles a raw text frame from a client.
    pub fn on_text(&mut self, client_id: ClientId, text: &str) {
        match serde_json::from_str::<ClientRequest>(text) {
            Ok(request) => self.on_message(client_id, request),
            Err(e) => {
                log::debug!("Client {} sent an undecodable frame: {}", client_id, e);
                self.send_error(client_id, "Malformed request");
            }
        }
    }

    /// Validates and applies a subscribe / unsubscribe request.
    ///
    /// Invalid requests produce a session-scoped `error` and leave all state untouched.
    pub fn on_message(&mut self, client_id: ClientId, request: ClientRequest) {
        if !self.sessions.contains_key(&client_id) {
            log::debug!("Ignoring request from unknown client {}", client_id);
            return;
        }

        let (subscribe, product_id) = match request {
            ClientRequest::Subscribe(req) => (true, req.product_id),
            ClientRequest::Unsubscribe(req) => (false, req.product_id),
        };

        let product_id = match product_id.as_deref().map(str::trim) {
            Some(id) if is_product_identifier(id) => id.to_string(),
            _ => {
                self.send_error(client_id, &RelayError::InvalidProduct.to_string());
                return;
            }
        };

        let result = if subscribe {
            self.registry.subscribe(client_id, &product_id)
        } else {
            self.registry.unsubscribe(client_id, &product_id)
        };

        match result {
            Ok(_) => {
                log::debug!(
                    "Client {} {} {}",
                    client_id,
                    if subscribe { "subscribed to" } else { "unsubscribed from" },
                    product_id
                );
                self.broadcast_channel_status();
            }
            Err(e) => self.send_error(client_id, &e.to_string()),
        }
    }

    /// Ends a session. Safe for clients that never subscribed or are already gone.
    pub fn on_disconnect(&mut self, client_id: ClientId) {
        let known = self.sessions.remove(&client_id);
        let edges = self.registry.remove_client(client_id);
        if let Some(handle) = known {
            log::info!(
                "Client {} disconnected, dropped {} subscriptions ({} frames lost to backpressure)",
                client_id,
                edges,
                handle.dropped
            );
            self.broadcast_channel_status();
        }
    }

    /// Routes one connector event.
    ///
    /// Market data goes only to the clients interested in its product; status and error
    /// events go to everybody, followed by a fresh channel snapshot.
    pub fn on_feed_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::PriceUpdate(tick) => {
                let product_id = tick.product_id.clone();
                self.fan_out(&product_id, Arc::new(ClientEvent::PriceUpdate(tick)));
            }
            FeedEvent::Trade(trade) => {
                let product_id = trade.product_id.clone();
                self.fan_out(&product_id, Arc::new(ClientEvent::Trade(trade)));
            }
            FeedEvent::Status(status) => {
                self.broadcast(Arc::new(ClientEvent::ServiceStatus(status)));
                self.broadcast_channel_status();
            }
            FeedEvent::Error(error) => {
                self.broadcast(Arc::new(ClientEvent::ServiceError(error)));
                self.broadcast_channel_status();
            }
        }
    }

    pub fn broadcast_channel_status(&mut self) {
        let snapshot = Arc::new(ClientEvent::ChannelUpdate(self.registry.snapshot()));
        self.broadcast(snapshot);
    }

    pub fn broadcast(&mut self, event: Arc<ClientEvent>) {
        let ids: Vec<ClientId> = self.sessions.keys().copied().collect();
        for client_id in ids {
            self.deliver(client_id, Arc::clone(&event));
        }
    }

    /// Drops every session. Closing the senders ends each client's writer.
    pub fn close(&mut self) {
        let ids: Vec<ClientId> = self.sessions.keys().copied().collect();
        for client_id in ids {
            self.registry.remove_client(client_id);
        }
        self.sessions.clear();
    }

    fn fan_out(&mut self, product_id: &str, event: Arc<ClientEvent>) {
        let recipients: Vec<ClientId> = self.registry.interested_clients(product_id).collect();
        for client_id in recipients {
            self.deliver(client_id, Arc::clone(&event));
        }
    }

    fn send_error(&mut self, client_id: ClientId, message: &str) {
        let event = Arc::new(ClientEvent::Error {
            message: message.to_string(),
        });
        self.deliver(client_id, event);
    }

    fn deliver(&mut self, client_id: ClientId, event: Arc<ClientEvent>) {
        let Some(handle) = self.sessions.get_mut(&client_id) else {
            return;
        };
        match handle.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                handle.dropped += 1;
                if handle.dropped.is_power_of_two() {
                    log::warn!(
                        "Client {} is not keeping up, {} frames dropped so far",
                        client_id,
                        handle.dropped
                    );
                }
            }
            Err(TrySendError::Closed(_)) => {
                // Writer already gone; the disconnect will follow.
                log::debug!("Client {} receiver closed", client_id);
            }
        }
    }
}

/// Non-empty, no whitespace, ASCII alphanumerics and dashes only.
fn is_product_identifier(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}
