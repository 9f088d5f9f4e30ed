//! Answering peer: serves local TCP backends over the tunnel.
//!
//! Registers under its own id, answers one offer per session and serves
//! every data channel the remote opens. Frames on a channel are decoded
//! one exchange at a time, so a channel the gateway keeps alive between
//! requests keeps working; the channel is closed as soon as a backend
//! response has no Content-Length to delimit it.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use peertun_shared::frame::{content_length, Decoded, RequestDecoder, ResponseDecoder, ResponseHead, TaggedRequest};
use peertun_shared::protocol::SignalMessage;
use peertun_shared::{Result, TunnelError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::channel::TunnelChannel;
use crate::config::{gen_peer_id, Config};
use crate::session::{add_candidate, new_peer_connection};
use crate::signaling::SignalingClient;

/// Routing tag to local backend address map, built from config.
#[derive(Clone, Default)]
pub struct ServiceMap {
    addrs: HashMap<String, String>,
}

impl ServiceMap {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let host = cfg
            .host
            .as_ref()
            .ok_or_else(|| TunnelError::Protocol("host settings missing".into()))?;
        let mut addrs = HashMap::new();
        for service in &host.services {
            addrs.insert(service.name.clone(), service.addr());
        }
        Ok(Self { addrs })
    }

    /// Unknown tags fall back to `default` when one is configured.
    pub fn resolve(&self, tag: &str) -> Option<&str> {
        self.addrs
            .get(tag)
            .or_else(|| self.addrs.get("default"))
            .map(String::as_str)
    }
}

pub async fn run(cfg: Arc<Config>) -> Result<()> {
    let services = ServiceMap::from_config(&cfg)?;
    let id = cfg.peer_id.clone().unwrap_or_else(|| gen_peer_id("host"));

    let mut signaling = SignalingClient::connect(&cfg.signaling).await?;
    signaling.register(&id).await?;
    info!("host {} registered, serving {} services", id, services.addrs.len());

    // One answered session at a time; a new offer replaces it.
    let mut current: Option<Arc<RTCPeerConnection>> = None;

    loop {
        let msg = match signaling.next().await? {
            Some(msg) => msg,
            None => break,
        };
        match msg {
            SignalMessage::Offer { sender, sdp, .. } => {
                info!("offer from {}", sender);
                if let Some(old) = current.take() {
                    let _ = old.close().await;
                }
                match answer_offer(&cfg, &services, &mut signaling, &id, &sender, sdp).await {
                    Ok(pc) => current = Some(pc),
                    Err(e) => warn!("answering {} failed: {}", sender, e),
                }
            }
            SignalMessage::Candidate { candidate, .. } => match current.as_ref() {
                Some(pc) => add_candidate(pc, &candidate).await,
                None => debug!("candidate before any offer, dropped"),
            },
            other => debug!("unexpected signal {:?}, dropped", other),
        }
    }
    Err(TunnelError::Signaling("rendezvous connection closed".into()))
}

/// Answer a single offer: accept data channels, then send the answer
/// only after local candidate gathering finished (vanilla ICE).
async fn answer_offer(
    cfg: &Config,
    services: &ServiceMap,
    signaling: &mut SignalingClient,
    id: &str,
    sender: &str,
    sdp: String,
) -> Result<Arc<RTCPeerConnection>> {
    let pc = new_peer_connection(&cfg.stun_servers).await?;

    let services = services.clone();
    let version = cfg.http_version.clone();
    pc.on_data_channel(Box::new(move |dc| {
        let services = services.clone();
        let version = version.clone();
        Box::pin(async move {
            debug!("data channel {} opened by peer", dc.label());
            let channel = TunnelChannel::from_webrtc(dc);
            tokio::spawn(async move {
                if let Err(e) = serve_channel(channel, services, version).await {
                    warn!("channel ended: {}", e);
                }
            });
        })
    }));

    let offer = RTCSessionDescription::offer(sdp)
        .map_err(|e| TunnelError::Negotiation(format!("bad offer: {e}")))?;
    pc.set_remote_description(offer)
        .await
        .map_err(|e| TunnelError::Negotiation(format!("set remote description: {e}")))?;

    let answer = pc
        .create_answer(None)
        .await
        .map_err(|e| TunnelError::Negotiation(format!("create answer: {e}")))?;
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(answer)
        .await
        .map_err(|e| TunnelError::Negotiation(format!("set local description: {e}")))?;
    let _ = gathered.recv().await;

    let local = pc
        .local_description()
        .await
        .ok_or_else(|| TunnelError::Negotiation("no local description after gathering".into()))?;
    signaling
        .send(&SignalMessage::Answer {
            target: Some(sender.to_string()),
            sender: Some(id.to_string()),
            sdp: local.sdp,
        })
        .await?;
    Ok(pc)
}

/// Serve exchanges on one channel until it closes or a response has to
/// be delimited by closing it.
async fn serve_channel(mut channel: TunnelChannel, services: ServiceMap, version: String) -> Result<()> {
    // bytes received past the previous exchange, already part of the next
    let mut carry = Bytes::new();
    loop {
        let (tagged, rest) = match read_request(&mut channel, carry).await? {
            Some(parts) => parts,
            None => return Ok(()),
        };
        carry = match serve_exchange(&mut channel, &services, &version, tagged, rest).await? {
            Some(rest) => rest,
            None => return Ok(()),
        };
    }
}

/// Decode one request frame prefix. `Ok(None)` means the channel closed
/// cleanly before a new request started.
async fn read_request(
    channel: &mut TunnelChannel,
    carry: Bytes,
) -> Result<Option<(TaggedRequest, Bytes)>> {
    let mut decoder = RequestDecoder::new();
    if !carry.is_empty() {
        if let Decoded::Head { head, body } = decoder.push(&carry)? {
            return Ok(Some((head, body)));
        }
    }
    loop {
        let Some(chunk) = channel.recv().await else {
            if decoder.is_empty() {
                return Ok(None);
            }
            return Err(TunnelError::Protocol("channel closed mid-request".into()));
        };
        if let Decoded::Head { head, body } = decoder.push(&chunk)? {
            return Ok(Some((head, body)));
        }
    }
}

/// Run one exchange against the backend. Returns leftover bytes that
/// belong to the next request, or `None` when the channel was spent
/// (closed to delimit the response, or errored).
async fn serve_exchange(
    channel: &mut TunnelChannel,
    services: &ServiceMap,
    version: &str,
    tagged: TaggedRequest,
    first_body: Bytes,
) -> Result<Option<Bytes>> {
    let TaggedRequest { tag, head } = tagged;
    debug!("{} {} for service {}", head.method, head.target, tag);

    let Some(addr) = services.resolve(&tag) else {
        warn!("no service for tag {}", tag);
        send_error_head(channel, &format!("unknown service {tag}")).await;
        return Ok(None);
    };
    let backend = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("connect {} failed: {}", addr, e);
            send_error_head(channel, &format!("backend unreachable: {e}")).await;
            return Ok(None);
        }
    };
    let (mut backend_read, mut backend_write) = backend.into_split();

    backend_write.write_all(&head.encode(version)).await?;

    // Forward the request body, bounded by its Content-Length. Bytes
    // past the bound already belong to the next frame.
    let mut carry = Bytes::new();
    let mut body_left = content_length(&head.headers).unwrap_or(0);
    let mut pending = first_body;
    loop {
        if !pending.is_empty() {
            let take = (pending.len() as u64).min(body_left) as usize;
            if take > 0 {
                backend_write.write_all(&pending.slice(..take)).await?;
                body_left -= take as u64;
            }
            if take < pending.len() {
                carry = pending.slice(take..);
            }
        }
        if body_left == 0 {
            break;
        }
        pending = match channel.recv().await {
            Some(chunk) => chunk,
            None => return Err(TunnelError::Protocol("channel closed mid-request".into())),
        };
    }

    // Relay the backend response verbatim, watching the byte stream for
    // the header boundary and Content-Length so we know whether the
    // channel survives this exchange.
    let mut decoder = ResponseDecoder::new();
    let mut phase = ResponsePhase::Head;
    let mut buf = BytesMut::with_capacity(16 * 1024);
    loop {
        buf.clear();
        let n = backend_read.read_buf(&mut buf).await?;
        if n == 0 {
            // EOF delimits the body; the channel goes with it
            channel.sender().close().await;
            return Ok(None);
        }
        let chunk = buf.split().freeze();
        channel.send(chunk.clone()).await?;
        phase = phase.advance(&mut decoder, &chunk);
        if matches!(phase, ResponsePhase::Complete) {
            // response fully delimited; channel stays open for the next
            // request frame
            return Ok(Some(carry));
        }
    }
}

enum ResponsePhase {
    Head,
    Counted(u64),
    ToEof,
    Complete,
}

impl ResponsePhase {
    fn advance(self, decoder: &mut ResponseDecoder, chunk: &[u8]) -> Self {
        match self {
            ResponsePhase::Head => match decoder.push(chunk) {
                Decoded::Head { head, body } => match content_length(&head.headers) {
                    Some(total) if (body.len() as u64) >= total => ResponsePhase::Complete,
                    Some(total) => ResponsePhase::Counted(total - body.len() as u64),
                    None => ResponsePhase::ToEof,
                },
                _ => ResponsePhase::Head,
            },
            ResponsePhase::Counted(left) => {
                if (chunk.len() as u64) >= left {
                    ResponsePhase::Complete
                } else {
                    ResponsePhase::Counted(left - chunk.len() as u64)
                }
            }
            phase => phase,
        }
    }
}

async fn send_error_head(channel: &TunnelChannel, detail: &str) {
    let body = format!("<h1>Bad Gateway</h1><p>{}</p>", detail);
    let head = ResponseHead {
        status: 502,
        reason: "Bad Gateway".to_string(),
        headers: vec![
            ("Content-Type".to_string(), "text/html".to_string()),
            ("Content-Length".to_string(), body.len().to_string()),
        ],
    };
    let mut frame = BytesMut::from(&head.encode()[..]);
    frame.extend_from_slice(body.as_bytes());
    if let Err(e) = channel.send(frame.freeze()).await {
        debug!("error head not delivered: {}", e);
    }
    channel.sender().close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostConfig, ServiceConfig};

    fn map(services: &[(&str, u16)]) -> ServiceMap {
        let cfg = Config {
            host: Some(HostConfig {
                services: services
                    .iter()
                    .map(|(name, port)| ServiceConfig {
                        name: name.to_string(),
                        local_port: *port,
                        local_host: "127.0.0.1".to_string(),
                    })
                    .collect(),
            }),
            ..Config::default()
        };
        ServiceMap::from_config(&cfg).unwrap()
    }

    #[test]
    fn resolves_tags_with_default_fallback() {
        let with_default = map(&[("files", 3000), ("default", 8080)]);
        assert_eq!(with_default.resolve("files"), Some("127.0.0.1:3000"));
        assert_eq!(with_default.resolve("unknown"), Some("127.0.0.1:8080"));

        let bare = map(&[("files", 3000)]);
        assert_eq!(bare.resolve("unknown"), None);
    }

    #[test]
    fn response_phase_tracks_content_length() {
        let mut decoder = ResponseDecoder::new();
        let phase = ResponsePhase::Head
            .advance(&mut decoder, b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nab");
        assert!(matches!(phase, ResponsePhase::Counted(2)));
        let phase = phase.advance(&mut decoder, b"cd");
        assert!(matches!(phase, ResponsePhase::Complete));
    }

    #[test]
    fn response_phase_without_length_runs_to_eof() {
        let mut decoder = ResponseDecoder::new();
        let phase = ResponsePhase::Head.advance(&mut decoder, b"HTTP/1.1 200 OK\r\n\r\nbody");
        assert!(matches!(phase, ResponsePhase::ToEof));
    }

    #[tokio::test]
    async fn serve_exchange_pipes_to_backend_and_back() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let backend = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"GET /x HTTP/1.1\r\n"));
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
        });

        let (mut local, mut remote) = TunnelChannel::pair("t");
        let services = map(&[("default", port)]);
        let serve = tokio::spawn(async move {
            let tagged = TaggedRequest {
                tag: "default".to_string(),
                head: peertun_shared::frame::RequestHead {
                    method: "GET".to_string(),
                    target: "/x".to_string(),
                    headers: vec![],
                },
            };
            serve_exchange(&mut local, &services, "HTTP/1.1", tagged, Bytes::new())
                .await
                .unwrap()
        });

        let mut got = Vec::new();
        while got.len() < 45 {
            match remote.recv().await {
                Some(chunk) => got.extend_from_slice(&chunk),
                None => break,
            }
        }
        assert_eq!(&got[..], b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
        // Content-Length delimited the response; channel survived
        assert_eq!(serve.await.unwrap(), Some(Bytes::new()));
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_service_gets_synthesized_502() {
        let (mut local, mut remote) = TunnelChannel::pair("t");
        let services = map(&[("files", 3000)]);
        let tagged = TaggedRequest {
            tag: "nope".to_string(),
            head: peertun_shared::frame::RequestHead {
                method: "GET".to_string(),
                target: "/".to_string(),
                headers: vec![],
            },
        };
        let out = serve_exchange(&mut local, &services, "HTTP/1.1", tagged, Bytes::new())
            .await
            .unwrap();
        assert!(out.is_none());
        let frame = remote.recv().await.unwrap();
        assert!(frame.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));
    }
}
