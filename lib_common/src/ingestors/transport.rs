//! # Upstream Transport
//!
//! The seam between the connector's state machine and the wire. The connector only ever
//! sees a [`FeedConnection`]: text in, text out, pings and a close. [`WsTransport`] backs it
//! with `tokio-tungstenite`.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};

use crate::errors::{RelayError, Result};

/// Opens connections to the upstream feed.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn FeedConnection>>;
}

/// One open upstream connection.
#[async_trait]
pub trait FeedConnection: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Liveness probe. An error means the connection is gone.
    async fn ping(&mut self) -> Result<()>;

    /// Next data frame. `None` once the remote side has closed the connection.
    /// Must be cancel safe: the connector polls it inside `select!`.
    async fn next_frame(&mut self) -> Option<Result<String>>;

    async fn close(&mut self);
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsTransport {
    pub connect_timeout: Duration,
}

impl Default for WsTransport {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn FeedConnection>> {
        log::info!("Connecting to upstream feed: {}", url);
        let (stream, response) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                RelayError::Transport(format!(
                    "connect timed out after {}s",
                    self.connect_timeout.as_secs()
                ))
            })??;
        log::debug!("Upstream handshake completed ({})", response.status());
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FeedConnection for WsConnection {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        self.stream.send(Message::Ping(Vec::new().into())).await?;
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<Result<String>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(e.into())),
            };
            match message {
                Message::Text(text) => return Some(Ok(text.as_str().to_owned())),
                // Invalid UTF-8 is left for the frame decoder to reject; the connection stays up.
                Message::Binary(bytes) => {
                    return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Message::Close(frame) => {
                    log::info!("Upstream sent close frame: {:?}", frame);
                    return None;
                }
                // tungstenite answers pings itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            log::debug!("Upstream close handshake failed: {}", e);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    #[tokio::test]
    async fn test_ws_connection_maps_frame_kinds() {
        let (listener, url) = loopback().await;
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Ping(vec![1, 2, 3].into())).await.unwrap();
            ws.send(Message::Text("hello".into())).await.unwrap();
            ws.send(Message::Binary(vec![0xff, 0xfe, 0xfd].into())).await.unwrap();
            ws.send(Message::Binary(br#"{"type":"heartbeat"}"#.to_vec().into()))
                .await
                .unwrap();

            // Collect what the client sends, skipping the pong for our ping.
            let mut received = Vec::new();
            while received.len() < 2 {
                match ws.next().await.unwrap().unwrap() {
                    Message::Pong(_) => {}
                    other => received.push(other),
                }
            }
            ws.close(None).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
            received
        });

        let mut conn = WsTransport::default().connect(&url).await.unwrap();
        assert_eq!(conn.next_frame().await.unwrap().unwrap(), "hello");

        let garbage = conn.next_frame().await.unwrap().unwrap();
        assert_eq!(garbage, "\u{fffd}\u{fffd}\u{fffd}");
        assert!(matches!(
            crate::ingestors::coinbase_frames::decode_frame(&garbage),
            Err(crate::ingestors::coinbase_frames::FrameError::Parse(_))
        ));
        assert_eq!(
            conn.next_frame().await.unwrap().unwrap(),
            r#"{"type":"heartbeat"}"#
        );

        conn.send_text("subscribe".to_string()).await.unwrap();
        conn.ping().await.unwrap();
        assert!(conn.next_frame().await.is_none());

        let received = server.await.unwrap();
        assert!(matches!(&received[0], Message::Text(t) if t.as_str() == "subscribe"));
        assert!(matches!(&received[1], Message::Ping(_)));
    }

    #[tokio::test]
    async fn test_ws_connect_times_out_without_handshake() {
        // Accepted at the TCP level by the backlog, never answered.
        let (_listener, url) = loopback().await;
        let transport = WsTransport {
            connect_timeout: Duration::from_millis(200),
        };
        match transport.connect(&url).await {
            Err(RelayError::Transport(message)) => assert!(message.contains("timed out")),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("handshake should not complete"),
        }
    }

    #[tokio::test]
    async fn test_ws_connect_refused() {
        let (listener, url) = loopback().await;
        drop(listener);
        assert!(WsTransport::default().connect(&url).await.is_err());
    }
}
