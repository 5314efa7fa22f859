use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::net::TcpStream;

use crate::proxy::codec;
use crate::settings::Settings;
use crate::util::{maybe_timeout, write_all_with_timeout};

use super::{OriginClient, OriginResponse, ProxyRequest};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Parsed form of `target_addr`: scheme-validated host, port, and an optional
/// path prefix prepended to every forwarded URI.
#[derive(Debug, Clone)]
pub struct TargetAddr {
    host: String,
    port: u16,
    prefix: String,
    authority: String,
}

impl TargetAddr {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        ensure!(!trimmed.is_empty(), "target address must not be empty");
        let rest = match trimmed.strip_prefix("http://") {
            Some(rest) => rest,
            None => {
                if trimmed.starts_with("https://") {
                    bail!("https targets are not supported");
                }
                trimmed
            }
        };
        let (authority, prefix) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].trim_end_matches('/')),
            None => (rest, ""),
        };
        ensure!(!authority.is_empty(), "target address is missing a host");
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .with_context(|| format!("invalid target port '{port}'"))?;
                (host.to_string(), port)
            }
            None => (authority.to_string(), 80),
        };
        Ok(Self {
            host,
            port,
            prefix: prefix.to_string(),
            authority: authority.to_string(),
        })
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }
}

/// HTTP/1.1 origin client over plain TCP, one connection per fetch. The
/// outbound request drops credentials (`Authorization`, `Cookie`) and
/// hop-by-hop headers; the response body is always consumed in full.
pub struct HttpOriginClient {
    target: Option<TargetAddr>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    max_body_size: usize,
}

impl HttpOriginClient {
    pub fn new(
        target: Option<TargetAddr>,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
        max_body_size: usize,
    ) -> Self {
        Self {
            target,
            read_timeout,
            write_timeout,
            max_body_size,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let target = if settings.target_addr.is_empty() {
            None
        } else {
            Some(TargetAddr::parse(&settings.target_addr)?)
        };
        Ok(Self::new(
            target,
            settings.read_timeout(),
            settings.write_timeout(),
            settings.max_body_size,
        ))
    }

    fn encode_request(&self, target: &TargetAddr, request: &ProxyRequest) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(256);
        buffer.extend_from_slice(request.method.as_str().as_bytes());
        buffer.push(b' ');
        buffer.extend_from_slice(target.prefix.as_bytes());
        buffer.extend_from_slice(request.request_uri.as_bytes());
        buffer.extend_from_slice(b" HTTP/1.1\r\nHost: ");
        buffer.extend_from_slice(target.authority.as_bytes());
        buffer.extend_from_slice(b"\r\n");

        for (name, value) in request.headers.iter() {
            let lower = name.as_str();
            if codec::is_hop_header(lower)
                || matches!(lower, "authorization" | "cookie" | "host" | "content-length")
            {
                continue;
            }
            buffer.extend_from_slice(name.as_str().as_bytes());
            buffer.extend_from_slice(b": ");
            buffer.extend_from_slice(value.as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }

        if !request.body.is_empty() {
            buffer.extend_from_slice(b"Content-Length: ");
            buffer.extend_from_slice(request.body.len().to_string().as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }
        buffer.extend_from_slice(b"Connection: close\r\n\r\n");
        buffer
    }
}

#[async_trait]
impl OriginClient for HttpOriginClient {
    async fn fetch(&self, request: &ProxyRequest) -> Result<OriginResponse> {
        let target = self
            .target
            .as_ref()
            .context("no target_addr configured")?;

        let stream = maybe_timeout(
            Some(CONNECT_TIMEOUT),
            TcpStream::connect((target.host.as_str(), target.port)),
            format!("connecting to origin {}", target.authority),
        )
        .await?;
        let (read_half, mut write_half) = stream.into_split();

        let head = self.encode_request(target, request);
        write_all_with_timeout(
            &mut write_half,
            &head,
            self.write_timeout,
            "writing request head to origin",
        )
        .await?;
        if !request.body.is_empty() {
            write_all_with_timeout(
                &mut write_half,
                &request.body,
                self.write_timeout,
                "writing request body to origin",
            )
            .await?;
        }

        let mut reader = BufReader::new(read_half);
        let head = codec::read_response_head(&mut reader, self.read_timeout).await?;
        let body =
            codec::read_response_body(&mut reader, &head, self.read_timeout, self.max_body_size)
                .await?;
        Ok(OriginResponse {
            status: head.status,
            headers: head.headers,
            body,
        })
    }
}
