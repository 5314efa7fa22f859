mod client;

pub use client::{HttpOriginClient, TargetAddr};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, header};

/// An inbound request reduced to the parts the cache and the origin client
/// care about. The URI is kept verbatim as received so key derivation stays
/// byte-stable.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub request_uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyRequest {
    pub fn get(request_uri: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            request_uri: request_uri.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
    }
}

/// A fully buffered upstream response.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// One upstream round-trip. Implementations must consume the response body
/// in full; transport failures surface as errors and are never cached.
#[async_trait]
pub trait OriginClient: Send + Sync {
    async fn fetch(&self, request: &ProxyRequest) -> Result<OriginResponse>;
}
