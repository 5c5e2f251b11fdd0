//! Cache-key computation (§4.F "Key"), grounded on the original project's
//! `web/cache/cache.go` `calcCacheKey`.

use md5::{Digest, Md5};
use reqwest::header::HeaderMap;

/// Headers never contributing to a cache key: connection/transport noise,
/// client-address hops, and session identifiers that vary per playback
/// session without changing the response.
pub const CACHE_KEY_IGNORE_HEADERS: &[&str] = &[
    "range",
    "host",
    "user-agent",
    "referer",
    "referrer",
    "origin",
    "connection",
    "accept",
    "accept-encoding",
    "accept-language",
    "cache-control",
    "upgrade-insecure-requests",
    "starttimeticks",
    "x-playback-session-id",
    "playsessionid",
    "x-streammusic-audioid",
    "x-streammusic-savepath",
    "x-forwarded-for",
    "x-real-ip",
    "forwarded",
    "client-ip",
    "true-client-ip",
    "cf-connecting-ip",
    "x-cluster-client-ip",
    "fastly-client-ip",
    "x-client-ip",
    "x-proxyuser-ip",
    "via",
    "forwarded-for",
    "x-from-cdn",
];

/// Query parameters that track playback bookkeeping rather than selecting a
/// distinct response; excluded from the cache-key fingerprint for the same
/// reason as their header counterparts above.
pub const CACHE_KEY_IGNORE_QUERY: &[&str] = &[
    "starttimeticks",
    "x-playback-session-id",
    "playsessionid",
];

fn canonical_pairs(pairs: &[(String, String)], ignore: &[&str]) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = pairs
        .iter()
        .filter(|(k, _)| !ignore.iter().any(|i| i.eq_ignore_ascii_case(k)))
        .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
        .collect();
    out.sort();
    out
}

fn canonical_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    let pairs: Vec<(String, String)> = headers
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
        .collect();
    canonical_pairs(&pairs, CACHE_KEY_IGNORE_HEADERS)
}

fn canonical_query(query: &[(String, String)]) -> Vec<(String, String)> {
    canonical_pairs(query, CACHE_KEY_IGNORE_QUERY)
}

/// `MD5(method + pathWithoutQuery + sort(canonicalQuery + bodyBytes + canonicalHeaders))`.
///
/// The sort is a single lexicographic sort of the assembled string's bytes,
/// not a per-field sort: query and header pairs are each canonicalized and
/// joined, then the whole assembled string is sorted byte-wise alongside the
/// body before hashing.
pub fn calc_cache_key(
    method: &str,
    path_without_query: &str,
    query: &[(String, String)],
    body: &[u8],
    headers: &HeaderMap,
) -> String {
    let query_part: String = canonical_query(query)
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    let header_part: String = canonical_headers(headers)
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let mut assembled: Vec<u8> = Vec::new();
    assembled.extend_from_slice(query_part.as_bytes());
    assembled.extend_from_slice(body);
    assembled.extend_from_slice(header_part.as_bytes());
    assembled.sort_unstable();

    let mut hasher = Md5::new();
    hasher.update(method.as_bytes());
    hasher.update(path_without_query.as_bytes());
    hasher.update(&assembled);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
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

    fn query(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn identical_requests_hash_identically() {
        let a = calc_cache_key("GET", "/emby/Items", &query(&[("a", "1")]), b"", &headers(&[]));
        let b = calc_cache_key("GET", "/emby/Items", &query(&[("a", "1")]), b"", &headers(&[]));
        assert_eq!(a, b);
    }

    #[test]
    fn blocklisted_headers_do_not_affect_the_key() {
        let a = calc_cache_key("GET", "/p", &query(&[]), b"", &headers(&[("user-agent", "VLC")]));
        let b = calc_cache_key("GET", "/p", &query(&[]), b"", &headers(&[("user-agent", "Kodi")]));
        assert_eq!(a, b);
    }

    #[test]
    fn blocklisted_query_params_do_not_affect_the_key() {
        let a = calc_cache_key("GET", "/p", &query(&[("StartTimeTicks", "1")]), b"", &headers(&[]));
        let b = calc_cache_key("GET", "/p", &query(&[("StartTimeTicks", "999")]), b"", &headers(&[]));
        assert_eq!(a, b);
    }

    #[test]
    fn non_blocklisted_differences_change_the_key() {
        let a = calc_cache_key("GET", "/p", &query(&[("ItemId", "1")]), b"", &headers(&[]));
        let b = calc_cache_key("GET", "/p", &query(&[("ItemId", "2")]), b"", &headers(&[]));
        assert_ne!(a, b);
    }

    #[test]
    fn method_and_path_are_part_of_the_key() {
        let a = calc_cache_key("GET", "/a", &query(&[]), b"", &headers(&[]));
        let b = calc_cache_key("POST", "/a", &query(&[]), b"", &headers(&[]));
        let c = calc_cache_key("GET", "/b", &query(&[]), b"", &headers(&[]));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
