//! Stream/download redirect resolution (§4.J), grounded on the original
//! project's `service/emby/redirect.go`.

use crate::util::url::is_remote;

/// A resolved redirect target for a stream/download request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectTarget {
    /// 307 to the local HLS master endpoint; the request carried a drive
    /// path already (a previously-synthesized variant MSID).
    LocalMaster(String),
    /// 307 straight to the resolved drive URL; cache ~10 minutes.
    DriveUrl(String),
    /// The upstream-reported path is a remote (strm) URL; redirect after
    /// applying the configured path-map, never cached.
    Strm(String),
    /// The upstream-reported path falls under the configured local-media
    /// root; proxy to upstream instead of resolving via the drive.
    ProxyOrigin,
}

/// Applies the first matching `"/from:/to"` entry in `path_map` to a strm
/// URL/path, first match wins, unmodified if nothing matches.
pub fn apply_strm_path_map(path: &str, path_map: &[String]) -> String {
    for entry in path_map {
        if let Some((from, to)) = entry.split_once(':') {
            if let Some(rest) = path.strip_prefix(from) {
                return format!("{to}{rest}");
            }
        }
    }
    path.to_string()
}

/// Whether `path` sits under the configured local-media root and should
/// therefore be proxied to upstream rather than resolved via the drive.
pub fn is_local_root(path: &str, local_media_root: Option<&str>) -> bool {
    match local_media_root {
        Some(root) if !root.is_empty() => path.starts_with(root),
        _ => false,
    }
}

/// Resolves the redirect target for an upstream-reported media source
/// path, given the caller's drive-path MSID field (if any).
pub fn resolve_redirect_target(
    msid_drive_path: Option<&str>,
    local_master_url: impl Fn(&str) -> String,
    upstream_path: &str,
    local_media_root: Option<&str>,
    strm_path_map: &[String],
    resolved_drive_url: Option<&str>,
) -> RedirectTarget {
    if let Some(drive_path) = msid_drive_path {
        return RedirectTarget::LocalMaster(local_master_url(drive_path));
    }
    if is_remote(upstream_path) {
        return RedirectTarget::Strm(apply_strm_path_map(upstream_path, strm_path_map));
    }
    if is_local_root(upstream_path, local_media_root) {
        return RedirectTarget::ProxyOrigin;
    }
    RedirectTarget::DriveUrl(resolved_drive_url.unwrap_or_default().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msid_drive_path_redirects_to_local_master() {
        let target = resolve_redirect_target(Some("/root/a"), |p| format!("/videos/7/master.m3u8?drive_path={p}"), "", None, &[], None);
        assert_eq!(target, RedirectTarget::LocalMaster("/videos/7/master.m3u8?drive_path=/root/a".to_string()));
    }

    #[test]
    fn remote_path_is_treated_as_strm() {
        let map = vec!["https://old.example.com:https://new.example.com".to_string()];
        let target = resolve_redirect_target(None, |_| String::new(), "https://old.example.com/a.mp4", None, &map, None);
        assert_eq!(target, RedirectTarget::Strm("https://new.example.com/a.mp4".to_string()));
    }

    #[test]
    fn local_root_path_proxies_to_origin() {
        let target = resolve_redirect_target(None, |_| String::new(), "/local-media/a.mkv", Some("/local-media"), &[], None);
        assert_eq!(target, RedirectTarget::ProxyOrigin);
    }

    #[test]
    fn otherwise_resolves_via_the_drive() {
        let target = resolve_redirect_target(None, |_| String::new(), "/mnt/x/a.mkv", None, &[], Some("https://cdn/a.mkv"));
        assert_eq!(target, RedirectTarget::DriveUrl("https://cdn/a.mkv".to_string()));
    }

    #[test]
    fn strm_path_map_passes_through_when_nothing_matches() {
        assert_eq!(apply_strm_path_map("https://unmapped/a.mp4", &["https://a:https://b".to_string()]), "https://unmapped/a.mp4");
    }
}
