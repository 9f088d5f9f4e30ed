//! Relaying intercepted requests over the tunnel.
//!
//! [`TunnelDispatcher::relay`] is the engine façade: resolve the routing
//! tag, ensure a connected session (one shared negotiation at a time),
//! check out a channel, write the request frame while reading the
//! response, and hand back the response head as soon as it decodes with
//! the body still streaming. Every failure is synthesized into a
//! well-formed 502/503 response; `relay` never leaves the caller hanging.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use peertun_shared::frame::{
    content_length, encode_request_head, Decoded, RequestHead, ResponseDecoder, ResponseHead,
};
use peertun_shared::protocol::MAX_TAG_LEN;
use peertun_shared::{Result, TunnelError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::channel::{ChannelLease, ChannelProvider};
use crate::config::Config;
use crate::session::{PeerSession, SessionState};

pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Structural descriptor of an intercepted request.
pub struct ProxyRequest {
    pub method: String,
    /// Hostname the request was addressed to; its first label selects the
    /// remote service.
    pub host: String,
    /// Path plus query string.
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<BodyStream>,
}

/// Structural descriptor of the relayed response. The body may still be
/// in flight when the caller receives this.
pub struct ProxyResponse {
    pub head: ResponseHead,
    pub body: BodyStream,
}

pub enum RelayOutcome {
    Response(ProxyResponse),
    /// Navigation requests are never taken over; the caller serves them.
    PassThrough,
}

pub struct TunnelDispatcher {
    cfg: Arc<Config>,
    target_peer: String,
    session: Mutex<Option<Arc<PeerSession>>>,
    provider: ChannelProvider,
}

impl TunnelDispatcher {
    pub fn new(cfg: Arc<Config>, target_peer: String) -> Self {
        let provider = ChannelProvider::new(cfg.channel_mode);
        Self { cfg, target_peer, session: Mutex::new(None), provider }
    }

    /// Relay one intercepted request. Always resolves: tunnel failures
    /// come back as synthesized error responses, not as panics or hangs.
    pub async fn relay(&self, req: ProxyRequest) -> RelayOutcome {
        if is_navigation(&req.headers) {
            return RelayOutcome::PassThrough;
        }
        let method = req.method.clone();
        let target = req.target.clone();
        match self.relay_inner(req).await {
            Ok(resp) => RelayOutcome::Response(resp),
            Err(e) => {
                warn!("relay {} {} failed: {}", method, target, e);
                RelayOutcome::Response(synthesize_error(&e))
            }
        }
    }

    async fn relay_inner(&self, req: ProxyRequest) -> Result<ProxyResponse> {
        let tag = service_tag(&req.host);
        debug!("relaying {} {} to service {}", req.method, req.target, tag);

        let session = self.ensure_session().await?;
        let lease = self.provider.acquire(|label| session.open_channel(label)).await?;

        let head =
            RequestHead { method: req.method, target: req.target, headers: req.headers };
        run_exchange(
            lease,
            &tag,
            &self.cfg.http_version,
            &head,
            req.body,
            self.cfg.exchange_timeout(),
        )
        .await
    }

    /// Current session state, Idle while no session has been created.
    pub async fn session_state(&self) -> SessionState {
        match self.session.lock().await.as_ref() {
            Some(session) => session.state(),
            None => SessionState::Idle,
        }
    }

    /// Session accessor: reuses the live session, or creates one lazily.
    /// The slot lock makes the replacement unique; every concurrent
    /// caller then awaits the same negotiation outcome.
    async fn ensure_session(&self) -> Result<Arc<PeerSession>> {
        let session = {
            let mut slot = self.session.lock().await;
            match slot.as_ref() {
                Some(s) if !s.is_failed() => s.clone(),
                _ => {
                    let s = PeerSession::connect(&self.cfg, &self.target_peer).await?;
                    *slot = Some(s.clone());
                    s
                }
            }
        };
        session.ready().await?;
        Ok(session)
    }
}

/// Drive one request/response exchange over a leased channel.
pub(crate) async fn run_exchange(
    mut lease: ChannelLease,
    tag: &str,
    version: &str,
    head: &RequestHead,
    body: Option<BodyStream>,
    idle_timeout: Option<Duration>,
) -> Result<ProxyResponse> {
    let frame = encode_request_head(tag, head, version)?;
    lease.sender().send(frame).await?;

    // Upload runs concurrently with the response read; chunks are raw,
    // the channel's ordering does the rest. The guard aborts the task
    // wherever the exchange ends, including a dropped body stream.
    let upload: Option<UploadTask> = body.map(|mut body| {
        let sender = lease.sender();
        UploadTask(tokio::spawn(async move {
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(chunk) => {
                        if sender.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("request body error: {}", e);
                        break;
                    }
                }
            }
        }))
    });

    // Accumulate deliveries until the header boundary.
    let mut decoder = ResponseDecoder::new();
    let (head, first_body) = loop {
        let chunk = match recv_with_timeout(&mut lease, idle_timeout).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                lease.discard().await;
                return Err(TunnelError::ClosedBeforeHeaders);
            }
            Err(e) => {
                lease.discard().await;
                return Err(e);
            }
        };
        if let Decoded::Head { head, body } = decoder.push(&chunk) {
            break (head, body);
        }
    };

    // Body: stream until Content-Length is satisfied or the channel
    // closes (close means end-of-body). The lease and the upload guard
    // ride inside the stream, so in shared mode the next exchange waits
    // until this body is fully consumed, and cancellation (dropping the
    // stream) aborts the upload and closes the channel.
    let mut remaining = content_length(&head.headers);
    let body: BodyStream = Box::pin(stream! {
        let mut lease = lease;
        let _upload = upload;
        let mut done = remaining == Some(0);
        let mut pending = if first_body.is_empty() { None } else { Some(first_body) };

        if done {
            if pending.is_some() {
                warn!("late bytes after response completed");
                lease.discard().await;
                pending = None;
            } else {
                lease.complete();
            }
        }

        while !done {
            let chunk = match pending.take() {
                Some(chunk) => Some(chunk),
                None => match recv_with_timeout(&mut lease, idle_timeout).await {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        lease.discard().await;
                        yield Err(e);
                        break;
                    }
                },
            };
            let Some(chunk) = chunk else {
                // Clean end-of-body; the channel is spent.
                lease.discard().await;
                break;
            };
            match remaining.as_mut() {
                Some(left) => {
                    let len = chunk.len() as u64;
                    if len < *left {
                        *left -= len;
                        yield Ok(chunk);
                    } else {
                        if len > *left {
                            warn!("{} late bytes after response completed", len - *left);
                            lease.discard().await;
                        } else {
                            lease.complete();
                        }
                        let take = *left as usize;
                        *left = 0;
                        done = true;
                        if take > 0 {
                            yield Ok(chunk.slice(..take));
                        }
                    }
                }
                None => yield Ok(chunk),
            }
        }
        // Lease drops here; shared mode keeps the channel for the next
        // exchange only when the body completed via Content-Length, and
        // closes it otherwise.
    });

    Ok(ProxyResponse { head, body })
}

/// Aborts the request-body upload when the exchange goes away.
struct UploadTask(JoinHandle<()>);

impl Drop for UploadTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn recv_with_timeout(
    lease: &mut ChannelLease,
    limit: Option<Duration>,
) -> Result<Option<Bytes>> {
    match limit {
        Some(limit) => timeout(limit, lease.recv())
            .await
            .map_err(|_| TunnelError::Timeout("exchange")),
        None => Ok(lease.recv().await),
    }
}

/// Routing tag for a request host: the first hostname label, `default`
/// when the host is empty or unusable. Routing never fails an exchange.
pub fn service_tag(host: &str) -> String {
    let hostname = host.split(':').next().unwrap_or(host);
    let label = hostname.split('.').next().unwrap_or("");
    if label.is_empty() || label.len() > MAX_TAG_LEN {
        return "default".to_string();
    }
    label.to_string()
}

/// Navigations carry `Sec-Fetch-Mode: navigate` and are passed through.
pub fn is_navigation(headers: &[(String, String)]) -> bool {
    headers.iter().any(|(name, value)| {
        name.eq_ignore_ascii_case("sec-fetch-mode") && value.trim().eq_ignore_ascii_case("navigate")
    })
}

/// Well-formed error response for a failed exchange: 503 while the
/// session never came up, 502 for per-exchange failures.
pub fn synthesize_error(e: &TunnelError) -> ProxyResponse {
    let status = e.http_status();
    let (reason, title) = if status == 503 {
        ("Service Unavailable", "Gateway Not Connected")
    } else {
        ("Bad Gateway", "Peer Tunnel Error")
    };
    let body = format!("<h1>{}</h1><p>{}</p>", title, e);
    let head = ResponseHead {
        status,
        reason: reason.to_string(),
        headers: vec![
            ("Content-Type".to_string(), "text/html".to_string()),
            ("Content-Length".to_string(), body.len().to_string()),
        ],
    };
    let chunk = Bytes::from(body);
    let body: BodyStream =
        Box::pin(futures_util::stream::once(async move { Ok::<_, TunnelError>(chunk) }));
    ProxyResponse { head, body }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelProvider, TunnelChannel};
    use crate::config::ChannelMode;
    use peertun_shared::frame::{RequestDecoder, TaggedRequest};

    async fn collect(mut body: BodyStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    fn plain_get(target: &str) -> RequestHead {
        RequestHead { method: "GET".into(), target: target.into(), headers: vec![] }
    }

    #[tokio::test]
    async fn golden_exchange() {
        let provider = ChannelProvider::new(ChannelMode::PerRequest);
        let (local, mut remote) = TunnelChannel::pair("t");
        let lease = provider.acquire(|_| async move { Ok(local) }).await.unwrap();

        let server = tokio::spawn(async move {
            let frame = remote.recv().await.unwrap();
            let mut expected = vec![7u8];
            expected.extend_from_slice(b"default");
            expected.extend_from_slice(b"GET /api/comments HTTP/1.1\r\n\r\n");
            assert_eq!(&frame[..], &expected[..]);

            remote
                .send(Bytes::from_static(
                    b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n[]",
                ))
                .await
                .unwrap();
            // closing the channel ends the body
        });

        let resp = run_exchange(lease, "default", "HTTP/1.1", &plain_get("/api/comments"), None, None)
            .await
            .unwrap();
        assert_eq!(resp.head.status, 200);
        assert_eq!(
            resp.head.headers,
            vec![("Content-Type".to_string(), "application/json".to_string())]
        );
        assert_eq!(collect(resp.body).await, b"[]");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn close_without_bytes_is_protocol_error() {
        let provider = ChannelProvider::new(ChannelMode::PerRequest);
        let (local, mut remote) = TunnelChannel::pair("t");
        let lease = provider.acquire(|_| async move { Ok(local) }).await.unwrap();

        // Take the request frame, then go away without a single byte.
        let server = tokio::spawn(async move {
            let _ = remote.recv().await.unwrap();
        });

        let err = match run_exchange(lease, "default", "HTTP/1.1", &plain_get("/"), None, None)
            .await
        {
            Ok(_) => panic!("exchange resolved without any response bytes"),
            Err(e) => e,
        };
        assert!(matches!(err, TunnelError::ClosedBeforeHeaders));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_exchanges_do_not_cross_talk() {
        let provider = Arc::new(ChannelProvider::new(ChannelMode::PerRequest));

        let mut tasks = Vec::new();
        for i in 0..4u32 {
            let provider = provider.clone();
            tasks.push(tokio::spawn(async move {
                let (local, mut remote) = TunnelChannel::pair("t");
                let lease = provider.acquire(|_| async move { Ok(local) }).await.unwrap();

                let server = tokio::spawn(async move {
                    let frame = remote.recv().await.unwrap();
                    let mut decoder = RequestDecoder::new();
                    let tagged = match decoder.push(&frame).unwrap() {
                        Decoded::Head { head, .. } => head,
                        other => panic!("unexpected: {:?}", other),
                    };
                    let TaggedRequest { head, .. } = tagged;
                    // interleave deliveries across exchanges
                    remote.send(Bytes::from_static(b"HTTP/1.1 200 OK\r\n")).await.unwrap();
                    tokio::task::yield_now().await;
                    remote
                        .send(Bytes::from(format!("\r\nresponse for {}", head.target)))
                        .await
                        .unwrap();
                });

                let resp = run_exchange(
                    lease,
                    "default",
                    "HTTP/1.1",
                    &plain_get(&format!("/req/{i}")),
                    None,
                    None,
                )
                .await
                .unwrap();
                let body = collect(resp.body).await;
                assert_eq!(body, format!("response for /req/{i}").as_bytes());
                server.await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn shared_channel_completes_via_content_length_and_is_reused() {
        let provider = Arc::new(ChannelProvider::new(ChannelMode::Shared));
        let (local, mut remote) = TunnelChannel::pair("shared");

        // One server handling two sequential exchanges on the same channel.
        let server = tokio::spawn(async move {
            for reply in ["first", "second"] {
                let mut decoder = RequestDecoder::new();
                loop {
                    let frame = remote.recv().await.unwrap();
                    if matches!(decoder.push(&frame).unwrap(), Decoded::Head { .. }) {
                        break;
                    }
                }
                remote
                    .send(Bytes::from(format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                        reply.len(),
                        reply
                    )))
                    .await
                    .unwrap();
            }
        });

        let stash = Arc::new(tokio::sync::Mutex::new(Some(local)));
        let opened = Arc::new(std::sync::atomic::AtomicU32::new(0));
        for expected in ["first", "second"] {
            let stash = stash.clone();
            let opened = opened.clone();
            let lease = provider
                .acquire(move |_| async move {
                    opened.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(stash.lock().await.take().expect("channel opened twice"))
                })
                .await
                .unwrap();
            let resp = run_exchange(lease, "default", "HTTP/1.1", &plain_get("/"), None, None)
                .await
                .unwrap();
            assert_eq!(collect(resp.body).await, expected.as_bytes());
        }
        // the slot was reused after Content-Length completion
        assert_eq!(opened.load(std::sync::atomic::Ordering::SeqCst), 1);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_body_does_not_leak_into_next_shared_exchange() {
        let provider = Arc::new(ChannelProvider::new(ChannelMode::Shared));
        let (local, mut remote) = TunnelChannel::pair("shared");

        // First exchange delivers a 10-byte body the caller never reads.
        let server = tokio::spawn(async move {
            let _ = remote.recv().await.unwrap();
            remote
                .send(Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n"))
                .await
                .unwrap();
            remote.send(Bytes::from_static(b"0123456789")).await.unwrap();
            // the cancelled exchange must close the channel down
            while remote.recv().await.is_some() {}
        });

        let lease = provider.acquire(|_| async move { Ok(local) }).await.unwrap();
        let resp = run_exchange(lease, "default", "HTTP/1.1", &plain_get("/one"), None, None)
            .await
            .unwrap();
        assert_eq!(resp.head.status, 200);
        drop(resp.body);
        timeout(Duration::from_secs(1), server).await.unwrap().unwrap();

        // The next exchange gets a fresh channel and an undisturbed head,
        // not the abandoned body bytes.
        let (local, mut remote) = TunnelChannel::pair("shared");
        let server = tokio::spawn(async move {
            let _ = remote.recv().await.unwrap();
            remote
                .send(Bytes::from_static(b"HTTP/1.1 404 Not Found\r\nContent-Length: 2\r\n\r\nno"))
                .await
                .unwrap();
        });
        let lease = provider.acquire(|_| async move { Ok(local) }).await.unwrap();
        let resp = run_exchange(lease, "default", "HTTP/1.1", &plain_get("/two"), None, None)
            .await
            .unwrap();
        assert_eq!(resp.head.status, 404);
        assert_eq!(collect(resp.body).await, b"no");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn dropping_response_body_stops_request_upload() {
        let provider = ChannelProvider::new(ChannelMode::PerRequest);
        let (local, mut remote) = TunnelChannel::pair("t");
        let lease = provider.acquire(|_| async move { Ok(local) }).await.unwrap();

        // A request body that never ends on its own.
        let body: BodyStream = Box::pin(stream! {
            loop {
                yield Ok(Bytes::from_static(b"x"));
                tokio::task::yield_now().await;
            }
        });

        let server = tokio::spawn(async move {
            let _ = remote.recv().await.unwrap();
            remote
                .send(Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n"))
                .await
                .unwrap();
            // drain until the upload stops and the channel closes
            while remote.recv().await.is_some() {}
        });

        let head =
            RequestHead { method: "POST".into(), target: "/up".into(), headers: vec![] };
        let resp = run_exchange(lease, "default", "HTTP/1.1", &head, Some(body), None)
            .await
            .unwrap();
        assert_eq!(resp.head.status, 200);
        drop(resp.body);

        timeout(Duration::from_secs(1), server).await.unwrap().unwrap();
    }

    #[test]
    fn service_tag_resolution() {
        assert_eq!(service_tag("files.peer.example"), "files");
        assert_eq!(service_tag("localhost:8080"), "localhost");
        assert_eq!(service_tag(""), "default");
        assert_eq!(service_tag("."), "default");
    }

    #[test]
    fn navigation_detection() {
        let headers = vec![("Sec-Fetch-Mode".to_string(), "navigate".to_string())];
        assert!(is_navigation(&headers));
        let headers = vec![("sec-fetch-mode".to_string(), "cors".to_string())];
        assert!(!is_navigation(&headers));
        assert!(!is_navigation(&[]));
    }

    #[tokio::test]
    async fn errors_become_well_formed_responses() {
        let resp = synthesize_error(&TunnelError::Negotiation("no answer".into()));
        assert_eq!(resp.head.status, 503);
        let body = collect(resp.body).await;
        assert!(String::from_utf8_lossy(&body).contains("Gateway Not Connected"));

        let resp = synthesize_error(&TunnelError::ClosedBeforeHeaders);
        assert_eq!(resp.head.status, 502);
    }
}
