//! Peertun signaling rendezvous.
//!
//! Relays session-setup messages (offer/answer/candidate) between peers
//! that cannot yet reach each other directly. Peers register an identity
//! as their first message; every later message carrying a `target` field
//! is forwarded verbatim to that peer. Nothing is persisted.

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use peertun_shared::protocol::SignalMessage;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

#[derive(Clone, Default)]
struct AppState {
    peers: Arc<RwLock<HashMap<String, mpsc::Sender<String>>>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "peertun_signal=info".to_string()),
        )
        .init();

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "9000".to_string())
        .parse()
        .unwrap_or(9000);

    let state = AppState::default();

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "OK" }))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Peertun signaling rendezvous on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Handshake: the first message must be a register.
    let peer_id = match receiver.next().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<SignalMessage>(&text) {
            Ok(SignalMessage::Register { id }) if !id.is_empty() => id,
            _ => {
                warn!("client did not register correctly, closing");
                return;
            }
        },
        _ => return,
    };

    let (tx, mut rx) = mpsc::channel::<String>(100);
    {
        let mut peers = state.peers.write().await;
        if peers.contains_key(&peer_id) {
            warn!("duplicate registration for {}, replacing", peer_id);
        }
        peers.insert(peer_id.clone(), tx);
    }
    info!("peer registered: {}", peer_id);

    // Forward queued messages from other peers to this socket.
    let forward = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Route incoming messages by their target field. The original text is
    // forwarded untouched so optional fields survive the hop.
    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let decoded: SignalMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                debug!("undecodable message from {}: {}", peer_id, e);
                continue;
            }
        };
        match decoded.target() {
            Some(target) => {
                let peers = state.peers.read().await;
                match peers.get(target) {
                    Some(tx) => {
                        if tx.send(text).await.is_err() {
                            warn!("target peer {} is gone", target);
                        }
                    }
                    None => warn!("target peer {} not found", target),
                }
            }
            None => warn!("message without target from {}", peer_id),
        }
    }

    forward.abort();
    state.peers.write().await.remove(&peer_id);
    info!("peer disconnected: {}", peer_id);
}
