//! Emby upstream client (§4.C), grounded on the original project's
//! `util/https` fetch helpers combined with `service/emby`'s header and
//! api-key handling.

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use tracing::instrument;

use crate::config::EmbyConfig;
use crate::errors::AppResult;
use crate::http_client::BoundedClient;

pub const QUERY_API_KEY_NAME: &str = "api_key";
pub const QUERY_TOKEN_NAME: &str = "X-Emby-Token";

#[derive(Clone)]
pub struct EmbyClient {
    client: BoundedClient,
    config: EmbyConfig,
}

/// A parsed upstream response: status, decoded JSON body (or `Value::Null`
/// when the body is empty/not JSON), and the raw response headers.
pub struct EmbyResponse {
    pub status: StatusCode,
    pub body: serde_json::Value,
    pub headers: HeaderMap,
}

impl EmbyClient {
    pub fn new(client: BoundedClient, config: EmbyConfig) -> Self {
        Self { client, config }
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// Exposes the underlying bounded HTTP client for callers that need a
    /// raw byte-for-byte proxy rather than JSON decoding (e.g. images,
    /// static assets, the generic catch-all passthrough).
    pub fn raw_client(&self) -> &BoundedClient {
        &self.client
    }

    #[instrument(skip(self, header, body), fields(uri))]
    pub async fn fetch(
        &self,
        uri: &str,
        method: Method,
        mut header: HeaderMap,
        body: Option<bytes::Bytes>,
    ) -> AppResult<EmbyResponse> {
        if !header.contains_key(reqwest::header::CONTENT_TYPE) {
            header.insert(
                reqwest::header::CONTENT_TYPE,
                HeaderValue::from_static("application/json;charset=utf-8"),
            );
        }

        let url = format!("{}{uri}", self.config.host);
        let outcome = self.client.execute(method, &url, header, body, false).await?;
        let status = outcome.response.status();
        let headers = outcome.response.headers().clone();
        let bytes = outcome.response.bytes().await?;
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        Ok(EmbyResponse { status, body, headers })
    }

    /// Appends the configured `api-key` to `uri` unless it already carries
    /// one via the `api_key` or `X-Emby-Token` query keys.
    pub fn add_default_api_key(&self, uri: &str) -> String {
        if uri.contains(QUERY_API_KEY_NAME) || uri.contains(QUERY_TOKEN_NAME) {
            return uri.to_string();
        }
        crate::util::url::append_args(uri, &[(QUERY_API_KEY_NAME, &self.config.api_key)])
    }
}

/// Propagates upstream response headers onto an outgoing response: deletes
/// any pre-existing value for each upstream key, then sets the upstream
/// value. `Content-Length` is dropped whenever `body_rewritten` is set,
/// since the caller is about to replace the body.
pub fn clone_response_headers(target: &mut HeaderMap, upstream: &HeaderMap, body_rewritten: bool) {
    for key in upstream.keys() {
        target.remove(key);
    }
    for (key, value) in upstream.iter() {
        target.insert(key.clone(), value.clone());
    }
    if body_rewritten {
        target.remove(reqwest::header::CONTENT_LENGTH);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EmbyConfig {
        EmbyConfig {
            host: "http://emby.local:8096".to_string(),
            mount_path: String::new(),
            api_key: "K".to_string(),
            episodes_unplay_prior: false,
            resort_random_items: false,
            proxy_error_strategy: crate::config::ProxyErrorStrategy::Origin,
            images_quality: 90,
            download_strategy: crate::config::DownloadStrategy::Direct,
            local_media_root: None,
            strm: crate::config::StrmConfig::default(),
            send_stopped_mirror: false,
            device_profile: serde_json::Value::Null,
        }
    }

    #[test]
    fn api_key_is_appended_when_absent() {
        let client = EmbyClient::new(BoundedClient::new().unwrap(), config());
        let out = client.add_default_api_key("/emby/Users/1/Items");
        assert!(out.contains("api_key=K"));
    }

    #[test]
    fn api_key_is_left_untouched_when_already_present() {
        let client = EmbyClient::new(BoundedClient::new().unwrap(), config());
        let out = client.add_default_api_key("/emby/Users/1/Items?api_key=existing");
        assert_eq!(out, "/emby/Users/1/Items?api_key=existing");
    }

    #[test]
    fn clone_response_headers_overwrites_and_drops_content_length_on_rewrite() {
        let mut target = HeaderMap::new();
        target.insert(reqwest::header::CONTENT_LENGTH, HeaderValue::from_static("5"));
        let mut upstream = HeaderMap::new();
        upstream.insert(reqwest::header::CONTENT_LENGTH, HeaderValue::from_static("999"));
        upstream.insert(reqwest::header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
        clone_response_headers(&mut target, &upstream, true);
        assert!(target.get(reqwest::header::CONTENT_LENGTH).is_none());
        assert_eq!(target.get(reqwest::header::CONTENT_TYPE).unwrap(), "video/mp4");
    }
}
