//! API-key verification and carrier extraction (§4.I "API-key verifier"),
//! grounded on the original project's `service/emby/auth.go`.

use std::collections::HashSet;
use std::sync::Arc;

use reqwest::header::HeaderMap;
use tokio::sync::RwLock;
use tracing::instrument;

use crate::emby::client::EmbyClient;
use crate::errors::AppResult;

/// Where an API key was carried on the inbound request; echoed back so
/// outbound rewrites (e.g. `DirectStreamUrl`) use the same carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiKeyCarrier {
    Query,
    Header,
}

#[derive(Debug, Clone)]
pub struct ApiKeyLookup {
    pub api_key: String,
    pub carrier: ApiKeyCarrier,
    pub query_name: &'static str,
}

/// Reads the client's API key in priority order: `api_key` query,
/// `X-Emby-Token` query, `X-Emby-Token` header, `Authorization` header,
/// `X-Emby-Authorization` header.
pub fn extract_api_key(query: &[(String, String)], headers: &HeaderMap) -> Option<ApiKeyLookup> {
    if let Some((_, v)) = query.iter().find(|(k, _)| k == "api_key") {
        return Some(ApiKeyLookup {
            api_key: v.clone(),
            carrier: ApiKeyCarrier::Query,
            query_name: "api_key",
        });
    }
    if let Some((_, v)) = query.iter().find(|(k, _)| k.eq_ignore_ascii_case("X-Emby-Token")) {
        return Some(ApiKeyLookup {
            api_key: v.clone(),
            carrier: ApiKeyCarrier::Query,
            query_name: "X-Emby-Token",
        });
    }
    for header_name in ["x-emby-token", "authorization", "x-emby-authorization"] {
        if let Some(v) = headers.get(header_name).and_then(|v| v.to_str().ok()) {
            return Some(ApiKeyLookup {
                api_key: v.to_string(),
                carrier: ApiKeyCarrier::Header,
                query_name: "api_key",
            });
        }
    }
    None
}

pub(crate) const INVALID_TOKEN_BODY: &str = "Access token is invalid or expired.";

/// Insert-only trusted-key cache; a real Emby deployment has few distinct
/// valid keys so this never needs eviction.
#[derive(Clone, Default)]
pub struct TrustedKeys {
    inner: Arc<RwLock<HashSet<String>>>,
}

impl TrustedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Ok(true)` if the key is (now) trusted, `Ok(false)` if
    /// upstream rejected it as invalid/expired.
    #[instrument(skip(self, client))]
    pub async fn verify(&self, client: &EmbyClient, lookup: &ApiKeyLookup) -> AppResult<bool> {
        if self.inner.read().await.contains(&lookup.api_key) {
            return Ok(true);
        }

        let uri = match lookup.carrier {
            ApiKeyCarrier::Query => format!("/emby/Auth/Keys?{}={}", lookup.query_name, lookup.api_key),
            ApiKeyCarrier::Header => "/emby/Auth/Keys".to_string(),
        };
        let mut header = HeaderMap::new();
        if lookup.carrier == ApiKeyCarrier::Header {
            header.insert(
                reqwest::header::HeaderName::from_static("x-emby-token"),
                reqwest::header::HeaderValue::from_str(&lookup.api_key).unwrap_or(reqwest::header::HeaderValue::from_static("")),
            );
        }

        let response = client.fetch(&uri, reqwest::Method::GET, header, None).await?;
        if response.status == reqwest::StatusCode::UNAUTHORIZED
            && response.body.as_str() == Some(INVALID_TOKEN_BODY)
        {
            return Ok(false);
        }

        self.inner.write().await.insert(lookup.api_key.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(
                reqwest::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                reqwest::header::HeaderValue::from_str(v).unwrap(),
            );
        }
        h
    }

    #[test]
    fn prefers_api_key_query_over_everything_else() {
        let query = vec![("api_key".to_string(), "Q".to_string())];
        let found = extract_api_key(&query, &headers(&[("authorization", "H")])).unwrap();
        assert_eq!(found.api_key, "Q");
        assert_eq!(found.carrier, ApiKeyCarrier::Query);
    }

    #[test]
    fn falls_back_to_headers_in_priority_order() {
        let found = extract_api_key(&[], &headers(&[("authorization", "A"), ("x-emby-authorization", "B")])).unwrap();
        assert_eq!(found.api_key, "A");
        assert_eq!(found.carrier, ApiKeyCarrier::Header);
    }

    #[test]
    fn returns_none_when_no_key_present() {
        assert!(extract_api_key(&[], &headers(&[])).is_none());
    }
}
