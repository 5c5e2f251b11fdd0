//! ItemInfo resolution (§4.H step 1 / §3 "ItemInfo"), grounded on the
//! original project's `service/emby/item.go`.

use std::sync::OnceLock;

use regex::Regex;
use reqwest::header::HeaderMap;

use crate::emby::auth::{extract_api_key, ApiKeyCarrier};
use crate::emby::msid::{self, MsInfo};
use crate::errors::{AppError, AppResult};

fn item_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:/emby)?/.*/(\d+)(?:/|\?|$)").expect("valid regex"))
}

/// Extracts the trailing numeric item id from a request path.
pub fn extract_item_id(uri: &str) -> Option<String> {
    item_id_regex()
        .captures(uri)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[derive(Debug, Clone)]
pub struct ItemInfo {
    pub item_id: String,
    pub api_key: String,
    pub api_key_carrier: ApiKeyCarrier,
    pub api_key_name: &'static str,
    pub ms_info: MsInfo,
    pub playback_info_uri: String,
}

/// Resolves an [`ItemInfo`] for a request. `raw_msid` is the caller-supplied
/// `MediaSourceId`, already extracted from the query or (for POST bodies)
/// read-clone-restored by the caller.
pub fn resolve_item_info(
    mount_path: &str,
    uri: &str,
    query: &[(String, String)],
    headers: &HeaderMap,
    raw_msid: Option<&str>,
) -> AppResult<ItemInfo> {
    let item_id = extract_item_id(uri).ok_or_else(|| AppError::decode(format!("无法从 {uri} 解析 itemId")))?;
    let lookup = extract_api_key(query, headers).ok_or_else(|| AppError::decode("缺少 API 密钥"))?;
    let ms_info = match raw_msid {
        Some(raw) => msid::decode(raw)?,
        None => MsInfo::default(),
    };

    let mut playback_info_uri = format!(
        "{mount_path}/Items/{item_id}/PlaybackInfo?reqformat=json&IsPlayback=false&AutoOpenLiveStream=false"
    );
    if !ms_info.empty {
        playback_info_uri.push_str(&format!("&MediaSourceId={}", ms_info.origin_id));
    }

    Ok(ItemInfo {
        item_id,
        api_key: lookup.api_key,
        api_key_carrier: lookup.carrier,
        api_key_name: lookup.query_name,
        ms_info,
        playback_info_uri,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_trailing_numeric_id() {
        assert_eq!(extract_item_id("/emby/Users/1/Items/42/PlaybackInfo"), Some("42".to_string()));
        assert_eq!(extract_item_id("/emby/Videos/7/stream?Static=true"), Some("7".to_string()));
    }

    #[test]
    fn resolves_item_info_with_query_api_key_and_no_msid() {
        let query = vec![("api_key".to_string(), "K".to_string())];
        let info = resolve_item_info("/emby", "/emby/Items/42/PlaybackInfo", &query, &HeaderMap::new(), None).unwrap();
        assert_eq!(info.item_id, "42");
        assert_eq!(info.api_key, "K");
        assert!(info.ms_info.empty);
        assert!(!info.playback_info_uri.contains("MediaSourceId"));
    }

    #[test]
    fn preserves_origin_id_on_the_upstream_uri_when_msid_present() {
        let query = vec![("api_key".to_string(), "K".to_string())];
        let info = resolve_item_info("/emby", "/emby/Items/42/PlaybackInfo", &query, &HeaderMap::new(), Some("ORIG")).unwrap();
        assert!(info.playback_info_uri.contains("MediaSourceId=ORIG"));
    }

    #[test]
    fn missing_api_key_is_a_decode_error() {
        assert!(resolve_item_info("/emby", "/emby/Items/42/PlaybackInfo", &[], &HeaderMap::new(), None).is_err());
    }
}
