//! Local HTTP front door.
//!
//! A plain TCP listener that speaks just enough HTTP/1.1 to hand each
//! request to the [`TunnelDispatcher`] and write the relayed response
//! back. One request per connection; the response always carries
//! `Connection: close`.

use std::sync::Arc;

use async_stream::stream;
use bytes::BytesMut;
use futures_util::StreamExt;
use peertun_shared::frame::{content_length, find_boundary, parse_request_head, ResponseHead};
use peertun_shared::{Result, TunnelError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dispatch::{BodyStream, ProxyRequest, RelayOutcome, TunnelDispatcher};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const BOUNDARY_LEN: usize = 4;

pub async fn run(cfg: Arc<Config>) -> Result<()> {
    let gateway = cfg
        .gateway
        .clone()
        .ok_or_else(|| TunnelError::Protocol("gateway settings missing".into()))?;
    let dispatcher = Arc::new(TunnelDispatcher::new(cfg.clone(), gateway.target_peer.clone()));

    let listener = TcpListener::bind(("127.0.0.1", gateway.listen_port)).await?;
    info!(
        "gateway listening on http://127.0.0.1:{} (peer {})",
        gateway.listen_port, gateway.target_peer
    );

    loop {
        let (stream, addr) = listener.accept().await?;
        debug!("connection from {}", addr);
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, dispatcher).await {
                debug!("connection from {} ended: {}", addr, e);
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, dispatcher: Arc<TunnelDispatcher>) -> Result<()> {
    let (mut read, mut write) = stream.into_split();

    let mut buf = BytesMut::with_capacity(8 * 1024);
    let head_end = loop {
        if let Some(end) = find_boundary(&buf) {
            break end;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(TunnelError::Protocol("request head too large".into()));
        }
        if read.read_buf(&mut buf).await? == 0 {
            if buf.is_empty() {
                // client connected and went away
                return Ok(());
            }
            return Err(TunnelError::Protocol("truncated request head".into()));
        }
    };

    let head = parse_request_head(&buf[..head_end])?;
    let leftover = buf.split_off(head_end + BOUNDARY_LEN).freeze();

    let host = head
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("host"))
        .map(|(_, value)| value.clone())
        .unwrap_or_default();

    let body = match content_length(&head.headers) {
        Some(0) | None => None,
        Some(total) => Some(request_body(read, leftover, total)),
    };

    let req = ProxyRequest {
        method: head.method,
        host,
        target: head.target,
        headers: head.headers,
        body,
    };

    let resp = match dispatcher.relay(req).await {
        RelayOutcome::Response(resp) => resp,
        RelayOutcome::PassThrough => shell_response(dispatcher.session_state().await),
    };

    let mut head = resp.head;
    head.headers.push(("Connection".to_string(), "close".to_string()));
    write.write_all(&head.encode()).await?;

    let mut body = resp.body;
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(chunk) => write.write_all(&chunk).await?,
            Err(e) => {
                // head already sent; all we can do is cut the connection
                warn!("response body error: {}", e);
                break;
            }
        }
    }
    write.shutdown().await?;
    Ok(())
}

/// Stream exactly `total` request body bytes: what arrived with the
/// head first, then the socket.
fn request_body(mut read: OwnedReadHalf, leftover: bytes::Bytes, total: u64) -> BodyStream {
    Box::pin(stream! {
        let mut remaining = total;

        if !leftover.is_empty() {
            let take = leftover.len().min(remaining as usize);
            remaining -= take as u64;
            yield Ok(leftover.slice(..take));
        }

        let mut buf = BytesMut::with_capacity(16 * 1024);
        while remaining > 0 {
            match read.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let take = buf.len().min(remaining as usize);
                    remaining -= take as u64;
                    yield Ok(buf.split_to(take).freeze());
                }
                Err(e) => {
                    yield Err(TunnelError::Io(e));
                    break;
                }
            }
        }
    })
}

/// Built-in page for navigations, which are never relayed.
fn shell_response(state: crate::session::SessionState) -> crate::dispatch::ProxyResponse {
    let body = format!(
        "<!doctype html>\n<html>\n<head><title>peertun</title></head>\n<body>\n\
         <h1>peertun gateway</h1>\n\
         <p>session: {}</p>\n\
         <p>This page is served locally. Requests from it are relayed to\n\
         the connected peer; address a service as\n\
         http://&lt;service&gt;.localhost or rely on the default service.</p>\n\
         </body>\n</html>\n",
        state
    );
    let head = ResponseHead {
        status: 200,
        reason: "OK".to_string(),
        headers: vec![
            ("Content-Type".to_string(), "text/html".to_string()),
            ("Content-Length".to_string(), body.len().to_string()),
        ],
    };
    let chunk = bytes::Bytes::from(body);
    let body: BodyStream =
        Box::pin(futures_util::stream::once(async move { Ok::<_, TunnelError>(chunk) }));
    crate::dispatch::ProxyResponse { head, body }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn request_body_combines_leftover_and_socket_bytes() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"world").await.unwrap();
            stream.shutdown().await.unwrap();
        });
        let (stream, _) = listener.accept().await.unwrap();
        let (read, _write) = stream.into_split();

        let mut body = request_body(read, bytes::Bytes::from_static(b"hello "), 11);
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(out, b"hello world");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn request_body_honors_content_length() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"abcdefgh").await.unwrap();
            stream.shutdown().await.unwrap();
        });
        let (stream, _) = listener.accept().await.unwrap();
        let (read, _write) = stream.into_split();

        let mut body = request_body(read, bytes::Bytes::new(), 4);
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(out, b"abcd");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn shell_page_is_well_formed() {
        let mut resp = shell_response(crate::session::SessionState::Idle);
        assert_eq!(resp.head.status, 200);

        let mut body = Vec::new();
        while let Some(chunk) = resp.body.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert!(String::from_utf8_lossy(&body).contains("session: idle"));
        assert!(resp
            .head
            .headers
            .iter()
            .any(|(n, v)| n == "Content-Length" && v == &body.len().to_string()));
    }
}
