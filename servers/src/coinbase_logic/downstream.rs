use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use lib_common::core::relay::RelayHandle;

pub fn router(relay: RelayHandle) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(relay)
}

/// Serves `/ws` and `/health` until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, relay: RelayHandle, shutdown: CancellationToken) -> Result<()> {
    log::info!("Downstream server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(relay))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            log::info!("Downstream server shutting down.");
        })
        .await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(relay): State<RelayHandle>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, relay))
}

/// Process liveness only; upstream feed health is reported to clients over `/ws`.
async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn handle_socket(socket: WebSocket, relay: RelayHandle) {
    let (client_id, mut outbound) = relay.connect();
    let (mut sink, mut stream) = socket.split();

    let writer = async {
        while let Some(event) = outbound.recv().await {
            let text = match serde_json::to_string(event.as_ref()) {
                Ok(text) => text,
                Err(e) => {
                    log::error!("Failed to encode frame for client {}: {}", client_id, e);
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    };

    let reader = async {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => relay.send_text(client_id, text.as_str()),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    log::debug!("Client {} socket error: {}", client_id, e);
                    break;
                }
            }
        }
    };

    // Either side ending ends the session; the relay ending the outbound queue closes the socket.
    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }

    relay.disconnect(client_id);
}
