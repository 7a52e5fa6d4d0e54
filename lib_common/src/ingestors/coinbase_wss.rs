//! # Coinbase WSS Connector
//!
//! Owns the single upstream connection to the Coinbase Exchange feed.
//!
//! The connector runs as one tokio task driven by a command channel. Connection state,
//! the remembered subscription set, the heartbeat and the reconnect timer all live inside
//! that task, so none of it is shared. The task:
//!
//! - connects, and after every successful open re-sends the full remembered product set;
//! - pings on a fixed interval while connected (the interval only exists while connected);
//! - on loss, waits `min(initial * 2^attempt, max)` and tries again, giving up for good
//!   once the attempt budget is spent (`failed`);
//! - exits on `stop()` (`closed`), cancelling whatever it was waiting on.
//!
//! Everything it observes is reported in order on one [`FeedEvent`] stream.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::core::backoff::{ReconnectPolicy, ReconnectState};
use crate::core::model::{
    ConnectionState, ErrorKind, FeedEvent, ProductId, ServiceError, ServiceStatus,
};
use crate::core::registry::UpstreamSubscriber;
use crate::ingestors::coinbase_frames::{decode_frame, subscribe_frame, Frame, FrameError};
use crate::ingestors::transport::{FeedConnection, FeedTransport};

/// Configuration for the Coinbase WebSocket feed.
#[derive(Debug, Clone)]
pub struct CoinbaseConfig {
    pub url: String,
    /// Supported products, in display order.
    pub products: Vec<ProductId>,
    pub channels: Vec<String>,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for CoinbaseConfig {
    fn default() -> Self {
        Self {
            url: "wss://ws-feed.exchange.coinbase.com".to_string(),
            products: ["BTC-USD", "ETH-USD", "XRP-USD", "LTC-USD"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
            channels: vec!["ticker".to_string(), "matches".to_string()],
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug)]
enum Command {
    Start,
    Subscribe(BTreeSet<ProductId>),
    Stop,
}

/// Handle to the connector task. Cheap to clone; every method is non-blocking.
#[derive(Clone)]
pub struct FeedConnector {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    supported: Arc<[ProductId]>,
}

impl FeedConnector {
    /// Spawns the connector task on the current runtime. Nothing happens on the wire until
    /// [`start`](Self::start) is called.
    pub fn spawn(
        config: CoinbaseConfig,
        transport: Arc<dyn FeedTransport>,
    ) -> (Self, mpsc::UnboundedReceiver<FeedEvent>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let supported: Arc<[ProductId]> = config.products.clone().into();

        let task = ConnectorTask {
            config,
            transport,
            commands: command_rx,
            events,
            state: state_tx,
            desired: BTreeSet::new(),
            reconnect: ReconnectState::default(),
        };
        tokio::spawn(task.run());

        (
            Self {
                commands,
                state,
                supported,
            },
            event_rx,
        )
    }

    /// Begins connecting. Idempotent.
    pub fn start(&self) {
        self.send(Command::Start);
    }

    /// Adds `products` to the remembered upstream interest. Sent immediately when
    /// connected and the set grew, otherwise on the next successful open.
    pub fn request_subscribe(&self, products: BTreeSet<ProductId>) {
        self.send(Command::Subscribe(products));
    }

    /// Terminal. Closes the connection and cancels any pending timer.
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn supported_products(&self) -> &[ProductId] {
        &self.supported
    }

    fn send(&self, command: Command) {
        if let Err(e) = self.commands.send(command) {
            log::debug!(
                "Feed connector is {:?}, ignoring {:?}",
                self.state(),
                e.0
            );
        }
    }
}

impl UpstreamSubscriber for FeedConnector {
    fn request_subscribe(&self, products: BTreeSet<ProductId>) {
        FeedConnector::request_subscribe(self, products);
    }
}

/// How a wait inside the task ended.
enum Control {
    Proceed,
    Stop,
    Failed,
}

struct ConnectorTask {
    config: CoinbaseConfig,
    transport: Arc<dyn FeedTransport>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<FeedEvent>,
    state: watch::Sender<ConnectionState>,
    /// Union of every accepted subscribe request. Only ever grows.
    desired: BTreeSet<ProductId>,
    reconnect: ReconnectState,
}

impl ConnectorTask {
    async fn run(mut self) {
        if self.wait_for_start().await {
            loop {
                self.set_state(ConnectionState::Connecting);
                let conn = match self.connect().await {
                    None => break,
                    Some(Ok(conn)) => conn,
                    Some(Err(e)) => {
                        log::warn!("Upstream connect failed: {}", e);
                        self.emit_error(
                            ErrorKind::ConnectionError,
                            "Failed to connect to upstream feed",
                            e.to_string(),
                        );
                        self.set_state(ConnectionState::Disconnected);
                        match self.backoff().await {
                            Control::Proceed => continue,
                            Control::Stop => break,
                            Control::Failed => return,
                        }
                    }
                };

                self.reconnect.reset();
                self.set_state(ConnectionState::Connected);
                if let Control::Stop = self.session(conn).await {
                    break;
                }

                self.set_state(ConnectionState::Disconnected);
                match self.backoff().await {
                    Control::Proceed => {}
                    Control::Stop => break,
                    Control::Failed => return,
                }
            }
        }
        self.set_state(ConnectionState::Closed);
        log::info!("Feed connector stopped");
    }

    /// Returns `false` when stopped before ever starting.
    async fn wait_for_start(&mut self) -> bool {
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Start => return true,
                Command::Subscribe(products) => {
                    self.remember(products);
                }
                Command::Stop => return false,
            }
        }
        false
    }

    /// One connect attempt. `None` when stopped while the attempt was pending; the attempt
    /// is dropped.
    async fn connect(
        &mut self,
    ) -> Option<crate::errors::Result<Box<dyn FeedConnection>>> {
        let transport = Arc::clone(&self.transport);
        let url = self.config.url.clone();
        let attempt = transport.connect(&url);
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => return Some(result),
                command = self.commands.recv() => match command {
                    Some(Command::Subscribe(products)) => {
                        self.remember(products);
                    }
                    Some(Command::Start) => {}
                    Some(Command::Stop) | None => return None,
                },
            }
        }
    }

    /// Waits out the next reconnect delay, or declares the feed failed.
    async fn backoff(&mut self) -> Control {
        let policy = self.config.reconnect;
        let Some(delay) = self.reconnect.next_delay(&policy) else {
            log::error!(
                "Giving up on upstream feed after {} reconnect attempts",
                policy.max_attempts
            );
            self.emit_error(
                ErrorKind::MaxReconnectError,
                "Maximum reconnection attempts reached",
                format!("Failed to reconnect after {} attempts", policy.max_attempts),
            );
            self.set_state(ConnectionState::Failed);
            return Control::Failed;
        };

        log::info!(
            "Reconnecting in {}ms (attempt {}/{})",
            delay.as_millis(),
            self.reconnect.attempt_count(),
            policy.max_attempts
        );
        let timer = tokio::time::sleep(delay);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = &mut timer => return Control::Proceed,
                command = self.commands.recv() => match command {
                    Some(Command::Subscribe(products)) => {
                        self.remember(products);
                    }
                    Some(Command::Start) => {}
                    Some(Command::Stop) | None => return Control::Stop,
                },
            }
        }
    }

    /// Services an open connection until it is lost (`Proceed`) or stopped (`Stop`).
    async fn session(&mut self, mut conn: Box<dyn FeedConnection>) -> Control {
        if !self.desired.is_empty() && !self.send_subscribe(conn.as_mut()).await {
            conn.close().await;
            return Control::Proceed;
        }

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = conn.next_frame() => match frame {
                    Some(Ok(text)) => self.handle_frame(&text),
                    Some(Err(e)) => {
                        log::warn!("Upstream read error: {}", e);
                        self.emit_error(
                            ErrorKind::ConnectionError,
                            "Upstream connection error",
                            e.to_string(),
                        );
                        conn.close().await;
                        return Control::Proceed;
                    }
                    None => {
                        log::warn!("Upstream feed closed the connection");
                        return Control::Proceed;
                    }
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = conn.ping().await {
                        log::warn!("Heartbeat failed, dropping connection: {}", e);
                        conn.close().await;
                        return Control::Proceed;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(Command::Subscribe(products)) => {
                        if self.remember(products) && !self.send_subscribe(conn.as_mut()).await {
                            conn.close().await;
                            return Control::Proceed;
                        }
                    }
                    Some(Command::Start) => {}
                    Some(Command::Stop) | None => {
                        conn.close().await;
                        return Control::Stop;
                    }
                },
            }
        }
    }

    /// Merges the supported part of `products` into the remembered set.
    /// Returns whether the set grew.
    fn remember(&mut self, products: BTreeSet<ProductId>) -> bool {
        let (supported, rejected): (Vec<ProductId>, Vec<ProductId>) = products
            .into_iter()
            .partition(|p| self.config.products.contains(p));

        if supported.is_empty() {
            self.emit_error(
                ErrorKind::SubscriptionError,
                "No supported products in subscribe request",
                json!({ "requested": rejected }),
            );
            return false;
        }
        if !rejected.is_empty() {
            log::warn!("Ignoring unsupported products: {:?}", rejected);
        }

        let before = self.desired.len();
        self.desired.extend(supported);
        self.desired.len() > before
    }

    async fn send_subscribe(&mut self, conn: &mut dyn FeedConnection) -> bool {
        let frame = match subscribe_frame(&self.desired, &self.config.channels) {
            Ok(frame) => frame,
            Err(e) => {
                self.emit_error(
                    ErrorKind::SubscriptionError,
                    "Failed to encode subscribe request",
                    e.to_string(),
                );
                return true;
            }
        };
        match conn.send_text(frame).await {
            Ok(()) => {
                log::info!("Subscribed upstream to {:?}", self.desired);
                true
            }
            Err(e) => {
                log::warn!("Subscribe send failed: {}", e);
                self.emit_error(
                    ErrorKind::SubscriptionError,
                    "Failed to send subscribe request",
                    e.to_string(),
                );
                false
            }
        }
    }

    fn handle_frame(&mut self, text: &str) {
        match decode_frame(text) {
            Ok(Frame::Price(tick)) => self.emit(FeedEvent::PriceUpdate(tick)),
            Ok(Frame::Trade(trade)) => self.emit(FeedEvent::Trade(trade)),
            Ok(Frame::UpstreamError(raw)) => {
                log::warn!("Upstream reported an error: {}", raw);
                let message = raw
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("Upstream error")
                    .to_string();
                self.emit_error(ErrorKind::UpstreamError, message, raw);
            }
            Ok(Frame::Ignored) => {}
            Err(FrameError::Parse(e)) => {
                log::warn!("Unparseable upstream frame: {}", e);
                self.emit_error(
                    ErrorKind::ParseError,
                    "Failed to parse upstream message",
                    e.to_string(),
                );
            }
            Err(FrameError::Validation(e)) => {
                log::warn!("Dropping invalid upstream frame: {}", e);
                self.emit_error(
                    ErrorKind::ValidationError,
                    "Invalid upstream message",
                    e.to_string(),
                );
            }
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous == next {
            return;
        }
        log::info!("Upstream feed {:?} -> {:?}", previous, next);
        self.emit(FeedEvent::Status(ServiceStatus::now(next)));
    }

    fn emit_error(&mut self, kind: ErrorKind, message: impl Into<String>, details: impl Into<Value>) {
        self.emit(FeedEvent::Error(ServiceError::new(kind, message, details)));
    }

    fn emit(&mut self, event: FeedEvent) {
        if self.events.send(event).is_err() {
            log::trace!("No listener for feed events");
        }
    }
}
