use std::net::SocketAddr;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::cache::{CacheError, CancelSignal, Entry, EntryStatus};
use crate::origin::ProxyRequest;
use crate::settings::NonGetMode;
use crate::util::write_all_with_timeout;

use super::codec::{self, RequestHead};
use super::AppContext;

/// Serves HTTP/1.1 requests on one client connection until the client
/// closes, asks for close, or idles out.
pub(super) async fn handle_http(
    stream: TcpStream,
    peer: SocketAddr,
    app: AppContext,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let head = codec::read_request_head(
            &mut reader,
            app.settings.idle_timeout(),
            app.settings.read_timeout(),
        )
        .await
        .with_context(|| format!("reading request from {peer}"))?;
        let Some(head) = head else {
            return Ok(());
        };
        let close = head.close;

        let body = codec::read_request_body(
            &mut reader,
            &head,
            app.settings.read_timeout(),
            app.settings.max_body_size,
        )
        .await
        .with_context(|| format!("reading request body from {peer}"))?;

        let RequestHead {
            method,
            target,
            headers,
            ..
        } = head;
        let request = ProxyRequest {
            method,
            request_uri: target,
            headers,
            body,
        };

        let Some(reply) = dispatch(&app, &request).await? else {
            // Reader gave up; nothing sane to write back.
            return Ok(());
        };
        debug!(
            peer = %peer,
            method = %request.method,
            uri = %request.request_uri,
            status = reply.status.as_u16(),
            "request served"
        );

        let head_bytes = codec::encode_response_head(reply.status, &reply.headers, reply.body.len());
        write_all_with_timeout(
            &mut write_half,
            &head_bytes,
            app.settings.write_timeout(),
            "writing response head to client",
        )
        .await?;
        if !reply.body.is_empty() {
            write_all_with_timeout(
                &mut write_half,
                &reply.body,
                app.settings.write_timeout(),
                "writing response body to client",
            )
            .await?;
        }

        if close {
            let _ = write_half.shutdown().await;
            return Ok(());
        }
    }
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Reply {
    fn status_only(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

async fn dispatch(app: &AppContext, request: &ProxyRequest) -> Result<Option<Reply>> {
    if request.method != Method::GET {
        return match app.settings.non_get_mode {
            NonGetMode::Pass => forward(app, request).await.map(Some),
            NonGetMode::Block => Ok(Some(Reply::status_only(StatusCode::FORBIDDEN))),
            NonGetMode::Cache => cached(app, request).await,
            NonGetMode::Queue => queued(app, request).await.map(Some),
        };
    }

    if refresh_gate_matches(app, &request.headers) {
        let (entry, origin_status) = app.cache.refresh(request).await;
        return Ok(Some(entry_reply(&entry, origin_status)));
    }
    cached(app, request).await
}

async fn cached(app: &AppContext, request: &ProxyRequest) -> Result<Option<Reply>> {
    match app.cache.get(request, CancelSignal::never()).await {
        Ok((entry, origin_status)) => Ok(Some(entry_reply(&entry, origin_status))),
        Err(CacheError::ReaderCancelled) => Ok(None),
    }
}

fn entry_reply(entry: &Entry, origin_status: Option<StatusCode>) -> Reply {
    let (headers, body) = entry.snapshot();
    if entry.status() == EntryStatus::Invalid && body.is_empty() {
        return Reply::status_only(StatusCode::NOT_FOUND);
    }
    Reply {
        status: origin_status.unwrap_or(StatusCode::OK),
        headers,
        body,
    }
}

/// Pass-through forwarding, fully buffered like everything else.
async fn forward(app: &AppContext, request: &ProxyRequest) -> Result<Reply> {
    match app.origin.fetch(request).await {
        Ok(response) => Ok(Reply {
            status: response.status,
            headers: response.headers,
            body: response.body,
        }),
        Err(err) => {
            warn!(
                method = %request.method,
                uri = %request.request_uri,
                error = %err,
                "target not reachable"
            );
            Ok(Reply::status_only(StatusCode::BAD_GATEWAY))
        }
    }
}

async fn queued(app: &AppContext, request: &ProxyRequest) -> Result<Reply> {
    let Some(queue) = &app.queue else {
        return forward(app, request).await;
    };
    if !queue.admit().await? {
        debug!(uri = %request.request_uri, "queue full, rejecting request");
        return Ok(Reply::status_only(StatusCode::SERVICE_UNAVAILABLE));
    }
    forward(app, request).await
}

fn refresh_gate_matches(app: &AppContext, headers: &HeaderMap) -> bool {
    let Some((header, password)) = app.settings.refresh_gate() else {
        return false;
    };
    headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == password)
        .unwrap_or(false)
}
