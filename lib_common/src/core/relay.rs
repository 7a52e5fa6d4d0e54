//! # Relay Context
//!
//! The object constructed once at startup that owns the feed connector, the subscription
//! registry and the client sessions. [`Relay::run`] is the single dispatch loop: session
//! commands and connector events are applied one at a time, so the registry and the
//! session table need no locking and a mutation is fully applied (snapshot broadcast
//! included) before the next one starts.
//!
//! [`RelayHandle`] is the cloneable front door used by the socket handlers and by the
//! process lifecycle owner for `close()`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::model::{ClientEvent, ClientId, FeedEvent};
use crate::core::registry::SubscriptionRegistry;
use crate::core::sessions::{ClientSessionManager, SessionSender};
use crate::ingestors::coinbase_wss::{CoinbaseConfig, FeedConnector};
use crate::ingestors::transport::FeedTransport;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub feed: CoinbaseConfig,
    /// Capacity of each client's outbound queue. Frames beyond it are dropped for that
    /// client only.
    pub client_buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            feed: CoinbaseConfig::default(),
            client_buffer_size: 256,
        }
    }
}

enum SessionCommand {
    Connect {
        client_id: ClientId,
        sender: SessionSender,
    },
    Text {
        client_id: ClientId,
        text: String,
    },
    Disconnect {
        client_id: ClientId,
    },
}

/// Cloneable handle into a running [`Relay`].
#[derive(Clone)]
pub struct RelayHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    next_client_id: Arc<AtomicU64>,
    client_buffer_size: usize,
    shutdown: CancellationToken,
}

impl RelayHandle {
    /// Opens a session. The receiver yields the frames to write to the client, starting
    /// with the current channel snapshot, and ends when the relay drops the session.
    pub fn connect(&self) -> (ClientId, mpsc::Receiver<Arc<ClientEvent>>) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.client_buffer_size);
        self.send(SessionCommand::Connect { client_id, sender });
        (client_id, receiver)
    }

    /// Forwards a raw text frame received from the client.
    pub fn send_text(&self, client_id: ClientId, text: impl Into<String>) {
        self.send(SessionCommand::Text {
            client_id,
            text: text.into(),
        });
    }

    pub fn disconnect(&self, client_id: ClientId) {
        self.send(SessionCommand::Disconnect { client_id });
    }

    /// Stops the connector and releases every session. Idempotent.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            log::info!("Relay shutdown requested");
        }
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn send(&self, command: SessionCommand) {
        if self.commands.send(command).is_err() {
            log::debug!("Relay is no longer running, session command dropped");
        }
    }
}

pub struct Relay {
    connector: FeedConnector,
    feed: mpsc::UnboundedReceiver<FeedEvent>,
    sessions: ClientSessionManager,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    shutdown: CancellationToken,
}

impl Relay {
    /// Spawns the connector task (idle until [`run`](Self::run)) and wires the registry to it.
    /// Must be called inside a tokio runtime.
    pub fn new(config: RelayConfig, transport: Arc<dyn FeedTransport>) -> (Self, RelayHandle) {
        let (connector, feed) = FeedConnector::spawn(config.feed.clone(), transport);
        let registry = SubscriptionRegistry::new(&config.feed.products, Arc::new(connector.clone()));
        let (command_tx, commands) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let relay = Self {
            connector,
            feed,
            sessions: ClientSessionManager::new(registry),
            commands,
            shutdown: shutdown.clone(),
        };
        let handle = RelayHandle {
            commands: command_tx,
            next_client_id: Arc::new(AtomicU64::new(1)),
            client_buffer_size: config.client_buffer_size.max(1),
            shutdown,
        };
        (relay, handle)
    }

    pub fn connector(&self) -> &FeedConnector {
        &self.connector
    }

    /// Starts the connector and dispatches until [`RelayHandle::close`] is called.
    pub async fn run(mut self) {
        log::info!(
            "Relay started for products {:?}",
            self.connector.supported_products()
        );
        self.connector.start();
        let mut feed_open = true;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(command) = self.commands.recv() => self.on_command(command),
                event = self.feed.recv(), if feed_open => match event {
                    Some(event) => self.sessions.on_feed_event(event),
                    None => {
                        // The connector only exits in a terminal state; sessions stay up.
                        log::warn!("Feed connector has exited, serving sessions without upstream data");
                        feed_open = false;
                    }
                },
            }
        }

        self.connector.stop();
        let sessions = self.sessions.session_count();
        self.sessions.close();
        log::info!("Relay closed, released {} sessions", sessions);
    }

    fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect { client_id, sender } => {
                self.sessions.on_connect(client_id, sender)
            }
            SessionCommand::Text { client_id, text } => self.sessions.on_text(client_id, &text),
            SessionCommand::Disconnect { client_id } => self.sessions.on_disconnect(client_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backoff::ReconnectPolicy;
    use crate::core::model::{ChannelState, ConnectionState, ErrorKind};
    use crate::ingestors::transport::mock::{MockTransport, Outcome};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;

    fn config(max_attempts: u32) -> RelayConfig {
        RelayConfig {
            feed: CoinbaseConfig {
                reconnect: ReconnectPolicy {
                    max_attempts,
                    ..ReconnectPolicy::default()
                },
                ..CoinbaseConfig::default()
            },
            client_buffer_size: 64,
        }
    }

    fn subscribe(product: &str) -> String {
        json!({"event": "subscribe", "data": {"productId": product}}).to_string()
    }

    async fn next_event(
        rx: &mut Receiver<Arc<ClientEvent>>,
        pred: impl Fn(&ClientEvent) -> bool,
    ) -> Arc<ClientEvent> {
        loop {
            let event = rx.recv().await.expect("session ended");
            if pred(event.as_ref()) {
                return event;
            }
        }
    }

    fn subscribed(event: &ClientEvent, product: &str, count: usize) -> bool {
        match event {
            ClientEvent::ChannelUpdate(snapshot) => snapshot.iter().any(|s| {
                s.product_id == product
                    && s.state == ChannelState::Subscribed
                    && s.subscriber_count == count
            }),
            _ => false,
        }
    }

    fn status_is(event: &ClientEvent, state: ConnectionState) -> bool {
        matches!(event, ClientEvent::ServiceStatus(s) if s.status == state)
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_while_disconnected_is_sent_once_on_connect() {
        let (transport, mut peers) = MockTransport::new([Outcome::Refuse, Outcome::Accept]);
        let (relay, handle) = Relay::new(config(5), transport);
        let (client, mut rx) = handle.connect();
        tokio::spawn(relay.run());

        // First attempt refused: the relay now waits out the backoff.
        next_event(&mut rx, |e| status_is(e, ConnectionState::Disconnected)).await;
        handle.send_text(client, subscribe("ETH-USD"));
        next_event(&mut rx, |e| subscribed(e, "ETH-USD", 1)).await;

        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.next_sent().await["product_ids"], json!(["ETH-USD"]));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(peer.sent.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_market_data_reaches_interested_clients_only() {
        let (transport, mut peers) = MockTransport::new([Outcome::Accept]);
        let (relay, handle) = Relay::new(config(5), transport);
        tokio::spawn(relay.run());
        let peer = peers.recv().await.unwrap();

        let (btc_client, mut btc_rx) = handle.connect();
        let (eth_client, mut eth_rx) = handle.connect();
        assert_ne!(btc_client, eth_client);
        handle.send_text(btc_client, subscribe("BTC-USD"));
        handle.send_text(eth_client, subscribe("ETH-USD"));
        next_event(&mut eth_rx, |e| subscribed(e, "ETH-USD", 1)).await;

        peer.push(json!({
            "type": "ticker",
            "product_id": "BTC-USD",
            "best_bid": "50000",
            "best_ask": "50100",
            "time": "2025-10-06T10:00:00Z"
        }));

        let event = next_event(&mut btc_rx, |e| matches!(e, ClientEvent::PriceUpdate(_))).await;
        assert!(matches!(event.as_ref(), ClientEvent::PriceUpdate(t) if t.ask == 50100.0));
        while let Ok(event) = eth_rx.try_recv() {
            assert!(!matches!(event.as_ref(), ClientEvent::PriceUpdate(_)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_reports_status_and_fresh_snapshot() {
        let (transport, mut peers) = MockTransport::new([Outcome::Accept, Outcome::Accept]);
        let (relay, handle) = Relay::new(config(5), transport);
        let mut state = relay.connector().watch_state();
        tokio::spawn(relay.run());

        let mut first = peers.recv().await.unwrap();
        state.wait_for(|s| *s == ConnectionState::Connected).await.unwrap();
        let (client, mut rx) = handle.connect();
        handle.send_text(client, subscribe("BTC-USD"));
        next_event(&mut rx, |e| subscribed(e, "BTC-USD", 1)).await;

        first.hang_up();
        next_event(&mut rx, |e| status_is(e, ConnectionState::Disconnected)).await;
        next_event(&mut rx, |e| status_is(e, ConnectionState::Connected)).await;
        let snapshot = rx.recv().await.unwrap();
        assert!(subscribed(&snapshot, "BTC-USD", 1));

        let mut second = peers.recv().await.unwrap();
        assert_eq!(second.next_sent().await["product_ids"], json!(["BTC-USD"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reconnects_keep_sessions_running() {
        let (transport, _peers) = MockTransport::new([]);
        let (relay, handle) = Relay::new(config(1), transport.clone());
        tokio::spawn(relay.run());

        let (client, mut rx) = handle.connect();
        next_event(&mut rx, |e| {
            matches!(e, ClientEvent::ServiceError(err) if err.kind == ErrorKind::MaxReconnectError)
        })
        .await;
        next_event(&mut rx, |e| status_is(e, ConnectionState::Failed)).await;

        handle.send_text(client, subscribe("LTC-USD"));
        next_event(&mut rx, |e| subscribed(e, "LTC-USD", 1)).await;
        assert_eq!(transport.attempts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_errors_stay_with_the_session() {
        let (transport, _peers) = MockTransport::new([Outcome::Accept]);
        let (relay, handle) = Relay::new(config(5), transport);
        tokio::spawn(relay.run());

        let (bad, mut bad_rx) = handle.connect();
        let (good, mut good_rx) = handle.connect();
        handle.send_text(bad, r#"{"event":"subscribe","data":{}}"#);
        let event = next_event(&mut bad_rx, |e| matches!(e, ClientEvent::Error { .. })).await;
        assert!(matches!(event.as_ref(), ClientEvent::Error { message } if message == "Invalid product ID"));

        handle.send_text(good, subscribe("XRP-USD"));
        next_event(&mut good_rx, |e| subscribed(e, "XRP-USD", 1)).await;
        while let Ok(event) = good_rx.try_recv() {
            assert!(!matches!(event.as_ref(), ClientEvent::Error { .. }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_connector_and_sessions() {
        let (transport, mut peers) = MockTransport::new([Outcome::Accept]);
        let (relay, handle) = Relay::new(config(5), transport);
        let mut state = relay.connector().watch_state();
        let running = tokio::spawn(relay.run());

        let peer = peers.recv().await.unwrap();
        let (client, mut rx) = handle.connect();
        handle.send_text(client, subscribe("BTC-USD"));
        next_event(&mut rx, |e| subscribed(e, "BTC-USD", 1)).await;

        handle.close();
        handle.close();
        running.await.unwrap();
        assert!(handle.is_closed());

        state.wait_for(|s| *s == ConnectionState::Closed).await.unwrap();
        assert!(peer.closed.load(Ordering::SeqCst));

        // The session's queue is drained and then ends.
        while rx.recv().await.is_some() {}
        handle.send_text(client, subscribe("ETH-USD"));
    }
}
