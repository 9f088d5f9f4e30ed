//! Client for the signaling rendezvous.
//!
//! One persistent WebSocket carrying the JSON control messages of
//! [`SignalMessage`]. The client holds no session state; connection
//! failures surface as [`TunnelError::Signaling`] and are not retried
//! here; retry policy belongs to the caller.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use peertun_shared::protocol::SignalMessage;
use peertun_shared::{Result, TunnelError};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct SignalingClient {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

impl SignalingClient {
    /// Open the control connection. Does not register.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| TunnelError::Signaling(format!("connect to {url}: {e}")))?;
        debug!("signaling connection open: {}", url);
        let (write, read) = ws.split();
        Ok(Self { write, read })
    }

    /// Announce our identity. Must be the first message sent.
    pub async fn register(&mut self, id: &str) -> Result<()> {
        self.send(&SignalMessage::Register { id: id.to_string() }).await
    }

    pub async fn send_offer(&mut self, target: &str, sender: &str, sdp: &str) -> Result<()> {
        self.send(&SignalMessage::Offer {
            target: target.to_string(),
            sender: sender.to_string(),
            sdp: sdp.to_string(),
        })
        .await
    }

    pub async fn send(&mut self, msg: &SignalMessage) -> Result<()> {
        let text = serde_json::to_string(msg)
            .map_err(|e| TunnelError::Signaling(format!("encode: {e}")))?;
        self.write
            .send(Message::Text(text))
            .await
            .map_err(|e| TunnelError::Signaling(format!("send: {e}")))
    }

    /// Next decoded control message, in arrival order. `Ok(None)` means
    /// the rendezvous closed the connection. Undecodable text frames are
    /// skipped, not fatal.
    pub async fn next(&mut self) -> Result<Option<SignalMessage>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                    Ok(msg) => return Ok(Some(msg)),
                    Err(e) => debug!("skipping undecodable signaling message: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(TunnelError::Signaling(format!("receive: {e}")));
                }
            }
        }
    }
}
