//! Peer session negotiation.
//!
//! One [`PeerSession`] per gateway instance, shared by every in-flight
//! request. Negotiation is vanilla (non-trickle): candidate gathering
//! runs to completion before the offer leaves for the rendezvous, and the
//! session is ready only once the primary data channel opens. A failed
//! session is terminal; the dispatcher replaces it on the next request.

use std::fmt;
use std::sync::Arc;

use peertun_shared::protocol::SignalMessage;
use peertun_shared::{Result, TunnelError};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::channel::TunnelChannel;
use crate::config::{gen_peer_id, Config};
use crate::signaling::SignalingClient;

/// Label of the data channel created before the offer. It doubles as the
/// transport-connected signal and is handed to the first exchange.
const PRIMARY_CHANNEL: &str = "peertun";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating,
    GatheringCandidates,
    Connected,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Negotiating => "negotiating",
            SessionState::GatheringCandidates => "gathering-candidates",
            SessionState::Connected => "connected",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

pub struct PeerSession {
    id: String,
    pc: Arc<RTCPeerConnection>,
    state: watch::Sender<SessionState>,
    primary: Mutex<Option<TunnelChannel>>,
    open_timeout: std::time::Duration,
}

impl PeerSession {
    /// Create the session and start its single negotiation attempt toward
    /// `target`. Progress is observed through [`PeerSession::ready`];
    /// concurrent callers share this one attempt.
    pub async fn connect(cfg: &Config, target: &str) -> Result<Arc<Self>> {
        let id = cfg.peer_id.clone().unwrap_or_else(|| gen_peer_id("gateway"));
        let pc = new_peer_connection(&cfg.stun_servers).await?;
        let (state, _) = watch::channel(SessionState::Negotiating);

        let session = Arc::new(Self {
            id,
            pc: pc.clone(),
            state,
            primary: Mutex::new(None),
            open_timeout: cfg.negotiation_timeout(),
        });

        // The transport callback can only fail the session. Readiness is
        // decided by the negotiation sequence below, strictly after
        // candidate gathering completes.
        let weak = Arc::downgrade(&session);
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let weak = weak.clone();
            Box::pin(async move {
                debug!("transport state: {}", s);
                if let (Some(session), Some(SessionState::Failed)) =
                    (weak.upgrade(), state_on_transport_change(s))
                {
                    session.fail("transport reported failure");
                }
            })
        }));

        // Primary channel: created before the offer so the SDP carries a
        // data-channel m-line; its open event is the ready signal.
        let dc = pc
            .create_data_channel(PRIMARY_CHANNEL, None)
            .await
            .map_err(|e| TunnelError::Negotiation(format!("create data channel: {e}")))?;
        let opened = on_open_signal(&dc);
        *session.primary.lock().await = Some(TunnelChannel::from_webrtc(dc));

        let task = {
            let session = session.clone();
            let url = cfg.signaling.clone();
            let target = target.to_string();
            let limit = cfg.negotiation_timeout();
            async move {
                match timeout(limit, session.negotiate(&url, &target, opened)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => session.fail(&e.to_string()),
                    Err(_) => session.fail("negotiation timed out"),
                }
            }
        };
        tokio::spawn(task);

        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state(), SessionState::Failed)
    }

    /// Wait until the session is usable. Fails when negotiation failed.
    pub async fn ready(&self) -> Result<()> {
        await_ready(self.state.subscribe()).await
    }

    /// Open a channel for one exchange. The first call hands out the
    /// primary channel; later calls create fresh labeled channels over
    /// the established association.
    pub async fn open_channel(&self, label: String) -> Result<TunnelChannel> {
        if let Some(primary) = self.primary.lock().await.take() {
            return Ok(primary);
        }

        let dc = self
            .pc
            .create_data_channel(&label, None)
            .await
            .map_err(|e| TunnelError::Channel(format!("open {label}: {e}")))?;
        let opened = on_open_signal(&dc);
        let channel = TunnelChannel::from_webrtc(dc);

        timeout(self.open_timeout, opened)
            .await
            .map_err(|_| TunnelError::Timeout("channel open"))?
            .map_err(|_| TunnelError::Channel(format!("channel {label} closed before open")))?;
        Ok(channel)
    }

    pub fn fail(&self, why: &str) {
        warn!("session {} failed: {}", self.id, why);
        self.state.send_replace(SessionState::Failed);
    }

    fn set_state(&self, next: SessionState) {
        self.state.send_modify(|state| {
            // Failed is terminal.
            if *state != SessionState::Failed {
                debug!("session state: {} -> {}", state, next);
                *state = next;
            }
        });
    }

    async fn negotiate(
        self: &Arc<Self>,
        url: &str,
        target: &str,
        opened: oneshot::Receiver<()>,
    ) -> Result<()> {
        let mut signaling = SignalingClient::connect(url).await?;
        signaling.register(&self.id).await?;

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TunnelError::Negotiation(format!("create offer: {e}")))?;
        // Vanilla ICE: wait for the full candidate set, then send one
        // offer carrying all of it.
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| TunnelError::Negotiation(format!("set local description: {e}")))?;
        self.set_state(SessionState::GatheringCandidates);
        let _ = gathered.recv().await;

        let local = self.pc.local_description().await.ok_or_else(|| {
            TunnelError::Negotiation("no local description after gathering".into())
        })?;
        signaling.send_offer(target, &self.id, &local.sdp).await?;
        info!("offer sent to {} as {}", target, self.id);

        // Exactly one answer is applied per session.
        loop {
            match signaling.next().await? {
                Some(SignalMessage::Answer { sdp, .. }) => {
                    let desc = RTCSessionDescription::answer(sdp)
                        .map_err(|e| TunnelError::Negotiation(format!("malformed answer: {e}")))?;
                    self.pc
                        .set_remote_description(desc)
                        .await
                        .map_err(|e| TunnelError::Negotiation(format!("apply answer: {e}")))?;
                    break;
                }
                Some(SignalMessage::Candidate { candidate, .. }) => {
                    add_candidate(&self.pc, &candidate).await;
                }
                Some(other) => debug!("ignoring signaling message: {:?}", other),
                None => {
                    return Err(TunnelError::Signaling("rendezvous closed before answer".into()))
                }
            }
        }

        // Keep draining the control connection: late candidates are
        // applied, duplicate answers ignored, errors fail the session.
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match signaling.next().await {
                    Ok(Some(SignalMessage::Candidate { candidate, .. })) => {
                        if let Some(session) = weak.upgrade() {
                            add_candidate(&session.pc, &candidate).await;
                        } else {
                            break;
                        }
                    }
                    Ok(Some(SignalMessage::Answer { .. })) => {
                        debug!("ignoring duplicate answer");
                    }
                    Ok(Some(other)) => debug!("ignoring signaling message: {:?}", other),
                    Ok(None) => {
                        debug!("signaling connection closed");
                        break;
                    }
                    Err(e) => {
                        if let Some(session) = weak.upgrade() {
                            session.fail(&e.to_string());
                        }
                        break;
                    }
                }
            }
        });

        // Ready once the primary channel opens, unless the transport
        // fails first.
        let mut state = self.state.subscribe();
        tokio::select! {
            r = opened => {
                r.map_err(|_| TunnelError::Negotiation("data channel closed during negotiation".into()))?;
            }
            _ = watch_failed(&mut state) => {
                return Err(TunnelError::Negotiation("transport failed during negotiation".into()));
            }
        }

        self.set_state(SessionState::Connected);
        info!("session {} connected to {}", self.id, target);
        Ok(())
    }
}

/// Resolves only when the state reaches Failed.
async fn watch_failed(rx: &mut watch::Receiver<SessionState>) {
    loop {
        if *rx.borrow_and_update() == SessionState::Failed {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Wait for Connected, erroring on Failed.
pub async fn await_ready(mut rx: watch::Receiver<SessionState>) -> Result<()> {
    loop {
        match *rx.borrow_and_update() {
            SessionState::Connected => return Ok(()),
            SessionState::Failed => {
                return Err(TunnelError::Negotiation("session failed".into()))
            }
            _ => {}
        }
        if rx.changed().await.is_err() {
            return Err(TunnelError::Negotiation("session dropped".into()));
        }
    }
}

/// State-machine effect of a transport state change. Never yields
/// Connected: a connected transport before gathering completes must not
/// make the session ready.
fn state_on_transport_change(s: RTCPeerConnectionState) -> Option<SessionState> {
    match s {
        RTCPeerConnectionState::Failed
        | RTCPeerConnectionState::Disconnected
        | RTCPeerConnectionState::Closed => Some(SessionState::Failed),
        _ => None,
    }
}

/// Oneshot that fires when the data channel opens.
fn on_open_signal(dc: &Arc<RTCDataChannel>) -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    let slot = std::sync::Mutex::new(Some(tx));
    dc.on_open(Box::new(move || {
        let tx = slot.lock().ok().and_then(|mut guard| guard.take());
        Box::pin(async move {
            if let Some(tx) = tx {
                let _ = tx.send(());
            }
        })
    }));
    rx
}

/// Data-only peer connection with default codecs and interceptors.
pub(crate) async fn new_peer_connection(stun_servers: &[String]) -> Result<Arc<RTCPeerConnection>> {
    let build = async {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: stun_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };
        api.new_peer_connection(config).await
    };
    build
        .await
        .map(Arc::new)
        .map_err(|e| TunnelError::Negotiation(format!("peer connection setup: {e}")))
}

/// Apply a received remote candidate (non-vanilla peers may trickle).
pub(crate) async fn add_candidate(pc: &Arc<RTCPeerConnection>, value: &serde_json::Value) {
    match candidate_string(value) {
        Some(candidate) => {
            let init = RTCIceCandidateInit { candidate, ..Default::default() };
            if let Err(e) = pc.add_ice_candidate(init).await {
                warn!("add candidate: {}", e);
            }
        }
        None => debug!("unusable candidate payload: {}", value),
    }
}

/// Candidate payloads arrive either as a bare string or as a browser-style
/// object with a `candidate` field.
fn candidate_string(value: &serde_json::Value) -> Option<String> {
    value
        .as_str()
        .or_else(|| value.get("candidate").and_then(|c| c.as_str()))
        .map(str::to_string)
}
