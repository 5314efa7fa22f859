use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, header::HeaderName};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::util::maybe_timeout;

pub(crate) const MAX_HEADER_BYTES: usize = 32 * 1024;
const MAX_CHUNK_LINE_LENGTH: usize = 8192;

/// Returns true for headers that carry per-connection metadata and must not
/// be forwarded or stored.
pub(crate) fn is_hop_header(lower_name: &str) -> bool {
    lower_name.starts_with("proxy-")
        || matches!(
            lower_name,
            "connection" | "keep-alive" | "te" | "trailer" | "transfer-encoding" | "upgrade"
        )
}

#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub target: String,
    pub headers: HeaderMap,
    pub content_length: Option<usize>,
    pub chunked: bool,
    pub close: bool,
}

pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: Option<usize>,
    pub chunked: bool,
}

/// Reads one HTTP/1.1 request head. Returns `None` when the connection is
/// closed (or idles out) before the first byte of a request line.
pub(crate) async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    idle_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let first = match idle_timeout {
        Some(duration) => match tokio::time::timeout(duration, reader.fill_buf()).await {
            Ok(Ok(buf)) => buf,
            Ok(Err(err)) => return Err(err).context("waiting for request"),
            Err(_) => return Ok(None),
        },
        None => reader.fill_buf().await.context("waiting for request")?,
    };
    if first.is_empty() {
        return Ok(None);
    }

    let read = read_line(reader, &mut line, read_timeout, MAX_HEADER_BYTES).await?;
    if read == 0 {
        return Ok(None);
    }
    let request_line = line.trim_end_matches(['\r', '\n']);
    if request_line.is_empty() {
        bail!("empty request line");
    }

    let mut parts = request_line.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?
        .to_string();
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?;
    if parts.next().is_some() {
        bail!("malformed request line: unexpected data");
    }
    match version {
        "HTTP/1.1" => {}
        "HTTP/1.0" => bail!("HTTP/1.0 requests are not supported"),
        other => bail!("invalid HTTP version '{other}'"),
    }
    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}'"))?;

    let mut headers = HeaderMap::new();
    let mut content_length = None;
    let mut chunked = false;
    let mut close = false;
    let mut header_bytes = read;
    loop {
        let read = read_line(reader, &mut line, read_timeout, MAX_HEADER_BYTES).await?;
        if read == 0 {
            bail!("connection closed inside request headers");
        }
        header_bytes += read;
        ensure!(
            header_bytes <= MAX_HEADER_BYTES,
            "request headers exceed {MAX_HEADER_BYTES} bytes"
        );
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = parse_header_line(trimmed)?;
        match name.as_str() {
            "content-length" => {
                ensure!(!chunked, "both Content-Length and Transfer-Encoding present");
                ensure!(
                    content_length.is_none(),
                    "multiple Content-Length headers are not supported"
                );
                let length: usize = value
                    .parse()
                    .with_context(|| format!("invalid Content-Length value '{value}'"))?;
                content_length = Some(length);
            }
            "transfer-encoding" => {
                ensure!(
                    content_length.is_none(),
                    "both Content-Length and Transfer-Encoding present"
                );
                ensure!(
                    value.eq_ignore_ascii_case("chunked"),
                    "unsupported Transfer-Encoding '{value}'"
                );
                chunked = true;
            }
            "connection" => {
                if connection_wants_close(value) {
                    close = true;
                }
            }
            _ => append_header(&mut headers, &name, value),
        }
        line.clear();
    }

    Ok(Some(RequestHead {
        method,
        target,
        headers,
        content_length,
        chunked,
        close,
    }))
}

/// Reads one HTTP/1.1 response head from an upstream connection.
pub(crate) async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    read_timeout: Option<Duration>,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let read = read_line(reader, &mut line, read_timeout, MAX_HEADER_BYTES).await?;
    ensure!(read > 0, "connection closed before status line");
    let status_line = line.trim_end_matches(['\r', '\n']);

    let mut parts = status_line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed status line: missing version"))?;
    ensure!(
        version == "HTTP/1.1" || version == "HTTP/1.0",
        "invalid HTTP version '{version}' in status line"
    );
    let code = parts
        .next()
        .ok_or_else(|| anyhow!("malformed status line: missing status code"))?;
    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| anyhow!("invalid status code '{code}'"))?;

    let mut headers = HeaderMap::new();
    let mut content_length = None;
    let mut chunked = false;
    let mut header_bytes = read;
    loop {
        let read = read_line(reader, &mut line, read_timeout, MAX_HEADER_BYTES).await?;
        ensure!(read > 0, "connection closed inside response headers");
        header_bytes += read;
        ensure!(
            header_bytes <= MAX_HEADER_BYTES,
            "response headers exceed {MAX_HEADER_BYTES} bytes"
        );
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = parse_header_line(trimmed)?;
        match name.as_str() {
            "content-length" => {
                let length: usize = value
                    .parse()
                    .with_context(|| format!("invalid Content-Length value '{value}'"))?;
                content_length = Some(length);
            }
            "transfer-encoding" => {
                if value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
                {
                    chunked = true;
                }
            }
            _ => append_header(&mut headers, &name, value),
        }
        line.clear();
    }

    Ok(ResponseHead {
        status,
        headers,
        content_length,
        chunked,
    })
}

/// Reads a request body according to the head's framing, bounded by
/// `max_body_size`. GET and other body-less requests yield an empty buffer.
pub(crate) async fn read_request_body<S>(
    reader: &mut BufReader<S>,
    head: &RequestHead,
    read_timeout: Option<Duration>,
    max_body_size: usize,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    if head.chunked {
        return read_chunked_body(reader, read_timeout, max_body_size).await;
    }
    match head.content_length {
        Some(length) => read_fixed_body(reader, length, read_timeout, max_body_size).await,
        None => Ok(Bytes::new()),
    }
}

/// Reads a response body according to the head's framing. Responses without
/// explicit framing are read until the upstream closes the connection.
pub(crate) async fn read_response_body<S>(
    reader: &mut BufReader<S>,
    head: &ResponseHead,
    read_timeout: Option<Duration>,
    max_body_size: usize,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    if head.chunked {
        return read_chunked_body(reader, read_timeout, max_body_size).await;
    }
    match head.content_length {
        Some(length) => read_fixed_body(reader, length, read_timeout, max_body_size).await,
        None => read_body_to_close(reader, read_timeout, max_body_size).await,
    }
}

async fn read_fixed_body<S>(
    reader: &mut BufReader<S>,
    length: usize,
    read_timeout: Option<Duration>,
    max_body_size: usize,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    ensure!(
        length <= max_body_size,
        "body of {length} bytes exceeds limit of {max_body_size}"
    );
    let mut body = vec![0u8; length];
    maybe_timeout(
        read_timeout,
        reader.read_exact(&mut body),
        "reading fixed-length body",
    )
    .await?;
    Ok(Bytes::from(body))
}

async fn read_chunked_body<S>(
    reader: &mut BufReader<S>,
    read_timeout: Option<Duration>,
    max_body_size: usize,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    let mut line = String::new();
    loop {
        let read = read_line(reader, &mut line, read_timeout, MAX_CHUNK_LINE_LENGTH).await?;
        ensure!(read > 0, "connection closed while reading chunk size");
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let size_str = trimmed
            .split_once(';')
            .map(|(size, _)| size)
            .unwrap_or(trimmed);
        let chunk_size = usize::from_str_radix(size_str, 16)
            .with_context(|| format!("invalid chunk size '{size_str}'"))?;
        if chunk_size == 0 {
            // Consume trailers up to the blank line.
            loop {
                let read =
                    read_line(reader, &mut line, read_timeout, MAX_CHUNK_LINE_LENGTH).await?;
                ensure!(read > 0, "connection closed while reading chunk trailers");
                if line.trim_end_matches(['\r', '\n']).is_empty() {
                    break;
                }
                line.clear();
            }
            break;
        }
        ensure!(
            body.len() + chunk_size <= max_body_size,
            "chunked body exceeds limit of {max_body_size} bytes"
        );
        let start = body.len();
        body.resize(start + chunk_size, 0);
        maybe_timeout(
            read_timeout,
            reader.read_exact(&mut body[start..]),
            "reading chunk data",
        )
        .await?;
        let mut crlf = [0u8; 2];
        maybe_timeout(
            read_timeout,
            reader.read_exact(&mut crlf),
            "reading chunk terminator",
        )
        .await?;
        ensure!(&crlf == b"\r\n", "invalid chunk terminator");
        line.clear();
    }
    Ok(Bytes::from(body))
}

async fn read_body_to_close<S>(
    reader: &mut BufReader<S>,
    read_timeout: Option<Duration>,
    max_body_size: usize,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = maybe_timeout(
            read_timeout,
            reader.read(&mut buffer),
            "reading body until close",
        )
        .await?;
        if read == 0 {
            break;
        }
        ensure!(
            body.len() + read <= max_body_size,
            "body exceeds limit of {max_body_size} bytes"
        );
        body.extend_from_slice(&buffer[..read]);
    }
    Ok(Bytes::from(body))
}

/// Serializes a response head for a fully buffered body. Hop-by-hop headers
/// and stale framing headers from the stored map are dropped; the body length
/// is always restated.
pub(crate) fn encode_response_head(
    status: StatusCode,
    headers: &HeaderMap,
    content_length: usize,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(b"HTTP/1.1 ");
    buffer.extend_from_slice(status.as_str().as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
    buffer.extend_from_slice(b"\r\n");

    for (name, value) in headers.iter() {
        let lower = name.as_str();
        if is_hop_header(lower) || lower == "content-length" {
            continue;
        }
        buffer.extend_from_slice(name.as_str().as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    buffer.extend_from_slice(b"Content-Length: ");
    buffer.extend_from_slice(content_length.to_string().as_bytes());
    buffer.extend_from_slice(b"\r\n\r\n");
    buffer
}

fn parse_header_line(line: &str) -> Result<(String, &str)> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| anyhow!("header missing ':' separator"))?;
    let name = name.trim();
    ensure!(!name.is_empty(), "header name must not be empty");
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| anyhow!("invalid header name '{name}'"))?;
    Ok((name.to_ascii_lowercase(), value.trim()))
}

fn append_header(headers: &mut HeaderMap, lower_name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(lower_name.as_bytes()),
        http::HeaderValue::from_str(value),
    ) {
        headers.append(name, value);
    }
}

fn connection_wants_close(value: &str) -> bool {
    value
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

async fn read_line<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    read_timeout: Option<Duration>,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    buf.clear();
    let mut collected = Vec::new();
    loop {
        let available = maybe_timeout(read_timeout, reader.fill_buf(), "reading line").await?;
        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            bail!("connection closed mid-line");
        }
        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());
        ensure!(
            collected.len() + consume <= max_len,
            "line exceeds configured limit of {max_len} bytes"
        );
        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);
        if newline_pos.is_some() {
            break;
        }
    }
    let string =
        String::from_utf8(collected).map_err(|_| anyhow!("line contained invalid bytes"))?;
    let len = string.len();
    *buf = string;
    Ok(len)
}
