//! Ordered regex route engine (§4.I, §6 "Route patterns"), grounded on the
//! original project's `web/route.go`.

use std::sync::OnceLock;

use regex::Regex;

/// A named route rule, kept in declaration order. `pattern` is matched
/// against the raw request target (path + query string, as received on
/// the wire) so rules that disambiguate by query flag (e.g. random items)
/// can match without a second parsing pass; first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Socket,
    PlaybackInfo,
    PlayingStopped,
    PlayingProgress,
    ItemsDetail,
    EpisodeItems,
    ItemsRandom,
    ItemsWithLimit,
    PlayedItems,
    ShowEpisodes,
    VideoSubtitles,
    ResourceStream,
    ResourceMaster,
    ResourceMain,
    ProxyPlaylist,
    ProxyTs,
    ProxySubtitle,
    ItemDownload,
    SyncJobItemDownload,
    Images,
    IndexHtml,
    StaticAsset,
    CatchAll,
}

struct Rule {
    kind: RouteKind,
    regex: Regex,
}

/// Patterns tried in exactly this order (§6 "Route patterns (first match
/// wins)"); the catch-all is last and always matches.
fn rules() -> &'static Vec<Rule> {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        let pairs: &[(RouteKind, &str)] = &[
            (RouteKind::Socket, r"^/embywebsocket"),
            (RouteKind::PlaybackInfo, r"(?:/emby)?/Items/\d+/PlaybackInfo"),
            (RouteKind::PlayingStopped, r"(?:/emby)?/Sessions/Playing/Stopped$"),
            (RouteKind::PlayingProgress, r"(?:/emby)?/Sessions/Playing/Progress$"),
            (RouteKind::EpisodeItems, r"(?:/emby)?/Shows/\d+/Episodes$"),
            (RouteKind::ItemsRandom, r"(?i)(?:/emby)?/Users/[^/]+/Items\?.*(?:SortBy=Random|Random=true)"),
            (RouteKind::ItemsWithLimit, r"(?:/emby)?/Users/[^/]+/Items/with_limit$"),
            (RouteKind::ItemsDetail, r"(?:/emby)?/Users/[^/]+/Items/\d+$"),
            (RouteKind::PlayedItems, r"(?:/emby)?/Users/[^/]+/PlayedItems"),
            (RouteKind::ShowEpisodes, r"(?:/emby)?/Shows/\d+/Episodes"),
            (RouteKind::VideoSubtitles, r"(?:/emby)?/Videos/\d+/Subtitles"),
            (RouteKind::ResourceStream, r"(?:/emby)?/(?:Videos|Audio)/\d+/(?:stream|universal|\w+\.stream)"),
            (RouteKind::ResourceMaster, r"^/videos/\d+/master\.m3u8$"),
            (RouteKind::ResourceMain, r"^/videos/proxy_playlist$"),
            (RouteKind::ProxyPlaylist, r"^/videos/proxy_playlist$"),
            (RouteKind::ProxyTs, r"^/videos/proxy_ts$"),
            (RouteKind::ProxySubtitle, r"^/videos/proxy_subtitle$"),
            (RouteKind::ItemDownload, r"(?:/emby)?/Items/\d+/Download"),
            (RouteKind::SyncJobItemDownload, r"(?:/emby)?/Sync/JobItems/[^/]+/File"),
            (RouteKind::Images, r"(?:/emby)?/Items/\d+/Images"),
            (RouteKind::IndexHtml, r"^/web/index\.html$"),
            (RouteKind::StaticAsset, r"\.(?:js|css)$"),
        ];
        pairs
            .iter()
            .map(|(kind, pattern)| Rule {
                kind: *kind,
                regex: Regex::new(pattern).expect("static route pattern compiles"),
            })
            .collect()
    })
}

/// Returns the first matching rule's kind, or [`RouteKind::CatchAll`] if
/// none match.
pub fn match_route(path: &str) -> RouteKind {
    for rule in rules() {
        if rule.regex.is_match(path) {
            return rule.kind;
        }
    }
    RouteKind::CatchAll
}

/// Extracts the captured numeric item id from a path matching a rule that
/// carries one, avoiding re-running the item-id regex downstream.
pub fn captured_item_id(path: &str) -> Option<String> {
    static ID_RE: OnceLock<Regex> = OnceLock::new();
    ID_RE
        .get_or_init(|| Regex::new(r"/(\d+)(?:/|$)").expect("valid regex"))
        .captures(path)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_playback_info_before_items_detail() {
        assert_eq!(match_route("/emby/Items/42/PlaybackInfo"), RouteKind::PlaybackInfo);
    }

    #[test]
    fn matches_stream_routes() {
        assert_eq!(match_route("/emby/Videos/7/stream"), RouteKind::ResourceStream);
        assert_eq!(match_route("/emby/Videos/7/universal"), RouteKind::ResourceStream);
    }

    #[test]
    fn matches_proxy_playlist_and_ts() {
        assert_eq!(match_route("/videos/proxy_playlist"), RouteKind::ProxyPlaylist);
        assert_eq!(match_route("/videos/proxy_ts"), RouteKind::ProxyTs);
    }

    #[test]
    fn matches_random_items_by_request_target_query_flag() {
        assert_eq!(match_route("/emby/Users/1/Items?SortBy=Random&Limit=500"), RouteKind::ItemsRandom);
        assert_eq!(match_route("/emby/Users/1/Items?Limit=20"), RouteKind::CatchAll);
    }

    #[test]
    fn unrecognized_paths_fall_back_to_catch_all() {
        assert_eq!(match_route("/something/else"), RouteKind::CatchAll);
    }

    #[test]
    fn captures_item_id_from_a_matched_path() {
        assert_eq!(captured_item_id("/emby/Items/42/PlaybackInfo"), Some("42".to_string()));
    }
}
