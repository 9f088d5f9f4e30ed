//! Tunnel channels: ordered, reliable binary pipes to the remote peer.
//!
//! A [`TunnelChannel`] bridges an `RTCDataChannel` onto mpsc halves so the
//! rest of the engine never touches WebRTC callbacks directly; tests use
//! [`TunnelChannel::pair`] instead of a live transport. Channel acquisition
//! for an exchange goes through [`ChannelProvider`], which implements both
//! topologies behind one interface: a fresh channel per request, or a
//! single shared channel with strictly serialized exchanges.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use peertun_shared::{Result, TunnelError};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

use crate::config::ChannelMode;

/// Inbound items: `Some(bytes)` is one delivery, `None` is remote close.
type Frame = Option<Bytes>;

/// Write half of a channel; clonable so a body-upload task can run
/// concurrently with the response read loop.
#[derive(Clone)]
pub struct ChannelSender {
    label: String,
    tx: mpsc::Sender<Frame>,
}

impl ChannelSender {
    pub async fn send(&self, chunk: Bytes) -> Result<()> {
        self.tx
            .send(Some(chunk))
            .await
            .map_err(|_| TunnelError::Channel(format!("channel {} closed", self.label)))
    }

    /// Signal close to the peer. Best effort; the channel may already be gone.
    pub async fn close(&self) {
        let _ = self.tx.send(None).await;
    }
}

/// One bidirectional byte conduit. Bytes arrive exactly once, in send
/// order, with no message boundaries beyond the transport's deliveries.
/// Exclusively owned by at most one exchange at a time.
pub struct TunnelChannel {
    label: String,
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
    closed: bool,
}

impl TunnelChannel {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn sender(&self) -> ChannelSender {
        ChannelSender { label: self.label.clone(), tx: self.tx.clone() }
    }

    pub async fn send(&self, chunk: Bytes) -> Result<()> {
        self.sender().send(chunk).await
    }

    /// Next delivery from the peer, `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        if self.closed {
            return None;
        }
        match self.rx.recv().await {
            Some(Some(chunk)) => Some(chunk),
            _ => {
                self.closed = true;
                None
            }
        }
    }

    /// An in-memory cross-wired pair, used by tests and loopback.
    pub fn pair(label: &str) -> (TunnelChannel, TunnelChannel) {
        let (a_tx, b_rx) = mpsc::channel(64);
        let (b_tx, a_rx) = mpsc::channel(64);
        let a = TunnelChannel { label: label.to_string(), tx: a_tx, rx: a_rx, closed: false };
        let b = TunnelChannel { label: label.to_string(), tx: b_tx, rx: b_rx, closed: false };
        (a, b)
    }

    /// Wrap a data channel. Handlers are attached immediately so early
    /// deliveries are not lost; a bridge task drains the write queue and
    /// closes the data channel when the last sender is dropped.
    pub fn from_webrtc(dc: Arc<RTCDataChannel>) -> Self {
        let label = dc.label().to_string();
        let (in_tx, in_rx) = mpsc::channel::<Frame>(64);
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(64);

        let tx = in_tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(Some(msg.data)).await;
            })
        }));

        let tx = in_tx.clone();
        dc.on_close(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(None).await;
            })
        }));

        let chan_label = label.clone();
        dc.on_error(Box::new(move |e| {
            let tx = in_tx.clone();
            let chan_label = chan_label.clone();
            Box::pin(async move {
                warn!("data channel {} error: {}", chan_label, e);
                let _ = tx.send(None).await;
            })
        }));

        let bridge_dc = dc.clone();
        let bridge_label = label.clone();
        tokio::spawn(async move {
            while let Some(Some(chunk)) = out_rx.recv().await {
                if let Err(e) = bridge_dc.send(&chunk).await {
                    warn!("data channel {} send failed: {}", bridge_label, e);
                    break;
                }
            }
            let _ = bridge_dc.close().await;
            debug!("data channel {} bridge finished", bridge_label);
        });

        Self { label, tx: out_tx, rx: in_rx, closed: false }
    }
}

/// A channel checked out for exactly one exchange.
///
/// In shared mode the lease also holds the topology's mutex guard, so the
/// next exchange cannot start until this one is dropped. The channel goes
/// back to the shared slot only once the exchange marks it
/// [`ChannelLease::complete`]; a lease dropped before that (cancellation)
/// or explicitly [`ChannelLease::discard`]ed closes the channel instead,
/// so the next exchange never inherits bytes from this one.
pub struct ChannelLease {
    sender: ChannelSender,
    channel: Option<TunnelChannel>,
    slot: Option<OwnedMutexGuard<Option<TunnelChannel>>>,
    reusable: bool,
}

impl ChannelLease {
    fn owned(channel: TunnelChannel) -> Self {
        Self { sender: channel.sender(), channel: Some(channel), slot: None, reusable: false }
    }

    fn shared(channel: TunnelChannel, slot: OwnedMutexGuard<Option<TunnelChannel>>) -> Self {
        Self { sender: channel.sender(), channel: Some(channel), slot: Some(slot), reusable: false }
    }

    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        match self.channel.as_mut() {
            Some(channel) => channel.recv().await,
            None => None,
        }
    }

    /// The exchange finished with the channel in a clean state; in shared
    /// mode it survives the drop and serves the next exchange.
    pub fn complete(&mut self) {
        self.reusable = true;
    }

    /// The channel must not be reused: close it and leave the shared slot
    /// empty so the next exchange opens a fresh one.
    pub async fn discard(&mut self) {
        if self.channel.take().is_some() {
            self.sender.close().await;
        }
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        if self.reusable {
            if let (Some(slot), Some(channel)) = (self.slot.as_mut(), self.channel.take()) {
                **slot = Some(channel);
            }
        }
        // Anything still held here closes: the last senders drop and the
        // bridge task shuts the data channel down.
    }
}

/// Strategy-selectable channel acquisition for the dispatcher.
pub struct ChannelProvider {
    mode: ChannelMode,
    shared_slot: Arc<Mutex<Option<TunnelChannel>>>,
}

impl ChannelProvider {
    pub fn new(mode: ChannelMode) -> Self {
        Self { mode, shared_slot: Arc::new(Mutex::new(None)) }
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    /// Check out a channel for one exchange. `open` creates a fresh
    /// channel with the given label when one is needed.
    pub async fn acquire<F, Fut>(&self, open: F) -> Result<ChannelLease>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<TunnelChannel>>,
    {
        match self.mode {
            ChannelMode::PerRequest => {
                let channel = open(gen_label()).await?;
                Ok(ChannelLease::owned(channel))
            }
            ChannelMode::Shared => {
                // Tokio's mutex queues waiters in acquisition order, so
                // exchange N+1 cannot send until exchange N's lease drops.
                let mut slot = self.shared_slot.clone().lock_owned().await;
                let channel = match slot.take() {
                    Some(existing) => existing,
                    None => open("shared".to_string()).await?,
                };
                Ok(ChannelLease::shared(channel, slot))
            }
        }
    }
}

fn gen_label() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("req-{:x}{:04x}", ts, rand::random::<u16>())
}
