use http::Method;

use super::CacheConfig;
use crate::origin::ProxyRequest;

/// Folds the request identity into the pool key:
/// `optional("M_") + optional(method + "_") + request_uri`. The mobile prefix
/// applies when `cache_mobile` is on and the User-Agent contains `Mobi`; the
/// method prefix applies when non-GET requests are cached. Nothing else
/// (other headers, cookies, query order) may influence the key.
pub(super) fn derive(config: &CacheConfig, request: &ProxyRequest) -> String {
    derive_parts(
        config,
        &request.method,
        &request.request_uri,
        request.user_agent(),
    )
}

fn derive_parts(
    config: &CacheConfig,
    method: &Method,
    request_uri: &str,
    user_agent: Option<&str>,
) -> String {
    let mobile = config.cache_mobile
        && user_agent
            .map(|agent| agent.contains("Mobi"))
            .unwrap_or(false);

    let mut key = String::with_capacity(request_uri.len() + 8);
    if mobile {
        key.push_str("M_");
    }
    if config.method_keyed {
        key.push_str(method.as_str());
        key.push('_');
    }
    key.push_str(request_uri);
    key
}
