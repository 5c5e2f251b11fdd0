//! HTTP client with bounded manual redirect following (§4.A).
//!
//! `reqwest`'s own redirect policy is disabled so this module can apply the
//! exact resolution rules the rest of the system depends on: absolute
//! `Location`s are used as-is, root-relative ones are joined with the
//! current scheme+host, and anything else is joined with the directory of
//! the current request path. Grounded on the original project's
//! `util/https` package, whose `execute()` does the same thing recursively.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use tracing::{instrument, warn};

use crate::errors::{AppError, AppResult};

pub const MAX_REDIRECT_DEPTH: u32 = 10;

const REDIRECT_CODES: [StatusCode; 4] = [
    StatusCode::MOVED_PERMANENTLY,
    StatusCode::FOUND,
    StatusCode::TEMPORARY_REDIRECT,
    StatusCode::PERMANENT_REDIRECT,
];

fn is_redirect(status: StatusCode) -> bool {
    REDIRECT_CODES.contains(&status)
}

/// The outcome of [`BoundedClient::execute`]: the final URL reached (after
/// following any redirects) and the response received at that URL.
pub struct ExecuteOutcome {
    pub final_url: String,
    pub response: reqwest::Response,
}

#[derive(Clone)]
pub struct BoundedClient {
    inner: reqwest::Client,
}

impl BoundedClient {
    /// Builds the single process-wide client: TLS verification disabled,
    /// 60s connect timeout, 5min response-header timeout, transport-level
    /// redirects disabled so [`Self::execute`] can apply the manual
    /// resolution rules above.
    pub fn new() -> AppResult<Self> {
        let inner = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { inner })
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.inner
    }

    /// Issues a request, following redirects manually up to
    /// [`MAX_REDIRECT_DEPTH`] when `auto_redirect` is set; otherwise returns
    /// the first response verbatim (even if it is a redirect).
    #[instrument(skip(self, headers, body), fields(method = %method, url = %crate::util::url::obfuscate_credentials(url)))]
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        headers: reqwest::header::HeaderMap,
        body: Option<bytes::Bytes>,
        auto_redirect: bool,
    ) -> AppResult<ExecuteOutcome> {
        self.execute_inner(method, url.to_string(), headers, body, auto_redirect, 0)
            .await
    }

    fn execute_inner(
        &self,
        method: Method,
        url: String,
        headers: reqwest::header::HeaderMap,
        body: Option<bytes::Bytes>,
        auto_redirect: bool,
        depth: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = AppResult<ExecuteOutcome>> + Send + '_>>
    {
        Box::pin(async move {
            if depth >= MAX_REDIRECT_DEPTH {
                return Err(AppError::TooManyRedirects(url));
            }

            let mut req = self.inner.request(method.clone(), &url);
            req = req.headers(headers.clone());
            if let Some(b) = body.clone() {
                req = req.body(b);
            }
            let resp = req.send().await?;

            if !auto_redirect || !is_redirect(resp.status()) {
                return Ok(ExecuteOutcome {
                    final_url: url,
                    response: resp,
                });
            }

            let Some(location) = resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
            else {
                return Ok(ExecuteOutcome {
                    final_url: url,
                    response: resp,
                });
            };

            let next_url = resolve_redirect_location(&url, &location)?;
            warn!(from = %url, to = %next_url, "following redirect");
            self.execute_inner(method, next_url, headers, body, auto_redirect, depth + 1)
                .await
        })
    }
}

/// Resolves a `Location` header against the request URL that produced it,
/// matching the three cases `execute()` in the original project handles:
/// absolute, root-relative, and directory-relative.
pub fn resolve_redirect_location(current_url: &str, location: &str) -> AppResult<String> {
    if location.starts_with("http") {
        return Ok(location.to_string());
    }

    let current = url::Url::parse(current_url).map_err(|e| AppError::decode(e.to_string()))?;
    let authority = match current.port() {
        Some(p) => format!("{}:{p}", current.host_str().unwrap_or_default()),
        None => current.host_str().unwrap_or_default().to_string(),
    };

    if let Some(rest) = location.strip_prefix('/') {
        return Ok(format!("{}://{}/{}", current.scheme(), authority, rest));
    }

    let dir = current
        .path()
        .rsplit_once('/')
        .map(|(dir, _)| dir)
        .unwrap_or("");
    Ok(format!(
        "{}://{}{}/{}",
        current.scheme(),
        authority,
        dir,
        location
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_location_used_as_is() {
        let next = resolve_redirect_location("https://h/a/b", "https://other/x").unwrap();
        assert_eq!(next, "https://other/x");
    }

    #[test]
    fn root_relative_location_joins_scheme_and_host() {
        let next = resolve_redirect_location("https://h:8443/a/b", "/c/d").unwrap();
        assert_eq!(next, "https://h:8443/c/d");
    }

    #[test]
    fn relative_location_joins_current_directory() {
        let next = resolve_redirect_location("https://h/a/b/file.m3u8", "seg1.ts").unwrap();
        assert_eq!(next, "https://h/a/b/seg1.ts");
    }
}
