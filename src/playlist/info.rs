//! M3U8 parsing and rendering (§4.G "Fetching"), grounded on the original
//! project's `service/m3u8/parse.go`.

/// Tags that belong in the rewritten playlist's head section, before any
/// segment lines.
const HEAD_TAGS: &[&str] = &[
    "#EXTM3U",
    "#EXT-X-VERSION",
    "#EXT-X-MEDIA-SEQUENCE",
    "#EXT-X-TARGETDURATION",
    "#EXT-X-MEDIA",
    "#EXT-X-INDEPENDENT-SEGMENTS",
    "#EXT-X-STREAM-INF",
];

/// Tags that belong in the tail section, after every segment.
const TAIL_TAGS: &[&str] = &["#EXT-X-ENDLIST"];

/// Content-Types accepted as a valid HLS playlist response.
pub const VALID_PLAYLIST_CONTENT_TYPES: &[&str] = &[
    "application/vnd.apple.mpegurl",
    "application/x-mpegurl",
    "audio/x-mpegurl",
    "application/octet-stream",
];

#[derive(Debug, Clone)]
pub struct Segment {
    /// `#`-prefixed lines (e.g. `#EXTINF:...`) immediately preceding this
    /// segment's URI line.
    pub comments: Vec<String>,
    /// The segment URI, resolved against `remoteBase` if relative.
    pub absolute_url: String,
}

impl Segment {
    pub fn basename(&self) -> String {
        basename_without_query(&self.absolute_url)
    }
}

/// A parsed HLS media playlist: head tags, ordered segments, tail tags.
#[derive(Debug, Clone, Default)]
pub struct ParsedPlaylist {
    pub head: Vec<String>,
    pub segments: Vec<Segment>,
    pub tail: Vec<String>,
}

pub fn basename_without_query(url: &str) -> String {
    let without_query = url.split('?').next().unwrap_or(url);
    without_query
        .rsplit('/')
        .next()
        .unwrap_or(without_query)
        .to_string()
}

fn tag_name(line: &str) -> &str {
    line.split_once(':').map(|(tag, _)| tag).unwrap_or(line)
}

/// Parses raw playlist text into head/segment/tail sections. `remote_base`
/// is the URL up to (and including) the last `/` of the resource's path,
/// query stripped, used to resolve relative segment URIs to absolute ones.
pub fn parse_playlist(body: &str, remote_base: &str) -> ParsedPlaylist {
    let mut parsed = ParsedPlaylist::default();
    let mut pending_comments = Vec::new();

    for raw_line in body.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('#') {
            let tag = tag_name(line);
            if HEAD_TAGS.contains(&tag) {
                parsed.head.push(line.to_string());
            } else if TAIL_TAGS.contains(&tag) {
                parsed.tail.push(line.to_string());
            } else {
                pending_comments.push(line.to_string());
            }
            continue;
        }

        let absolute_url = if line.starts_with("http") {
            line.to_string()
        } else {
            format!("{remote_base}{line}")
        };
        parsed.segments.push(Segment {
            comments: std::mem::take(&mut pending_comments),
            absolute_url,
        });
    }

    parsed
}

/// Renders the playlist with segment URIs replaced by local proxy links
/// (`{local_base}?ts_name={basename}`), used by `/videos/proxy_playlist`.
pub fn render_proxy_playlist(playlist: &ParsedPlaylist, local_base: &str) -> String {
    let mut out = String::new();
    for line in &playlist.head {
        out.push_str(line);
        out.push('\n');
    }
    for segment in &playlist.segments {
        for comment in &segment.comments {
            out.push_str(comment);
            out.push('\n');
        }
        out.push_str(&format!("{local_base}?ts_name={}\n", segment.basename()));
    }
    for line in &playlist.tail {
        out.push_str(line);
        out.push('\n');
    }
    out
}

pub fn remote_base_of(resource_url: &str) -> String {
    let without_query = resource_url.split('?').next().unwrap_or(resource_url);
    match without_query.rfind('/') {
        Some(idx) => without_query[..=idx].to_string(),
        None => without_query.to_string(),
    }
}

pub fn is_valid_playlist_content_type(content_type: &str) -> bool {
    let base = content_type.split(';').next().unwrap_or(content_type).trim();
    VALID_PLAYLIST_CONTENT_TYPES.iter().any(|ct| ct.eq_ignore_ascii_case(base))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:6.0,\nseg0.ts\n#EXTINF:6.0,\nseg1.ts\n#EXT-X-ENDLIST\n";

    #[test]
    fn parses_head_segments_and_tail() {
        let parsed = parse_playlist(SAMPLE, "https://cdn.example.com/path/");
        assert_eq!(parsed.head.len(), 4);
        assert_eq!(parsed.segments.len(), 2);
        assert_eq!(parsed.tail, vec!["#EXT-X-ENDLIST"]);
        assert_eq!(parsed.segments[0].absolute_url, "https://cdn.example.com/path/seg0.ts");
        assert_eq!(parsed.segments[0].comments, vec!["#EXTINF:6.0,"]);
    }

    #[test]
    fn absolute_segment_uris_are_kept_as_is() {
        let body = "#EXTM3U\nhttps://other.example.com/seg.ts\n";
        let parsed = parse_playlist(body, "https://cdn.example.com/path/");
        assert_eq!(parsed.segments[0].absolute_url, "https://other.example.com/seg.ts");
    }

    #[test]
    fn renders_local_proxy_links_for_each_segment() {
        let parsed = parse_playlist(SAMPLE, "https://cdn.example.com/path/");
        let rendered = render_proxy_playlist(&parsed, "/videos/proxy_ts");
        assert!(rendered.contains("/videos/proxy_ts?ts_name=seg0.ts"));
        assert!(rendered.contains("/videos/proxy_ts?ts_name=seg1.ts"));
        assert!(rendered.trim_end().ends_with("#EXT-X-ENDLIST"));
    }

    #[test]
    fn remote_base_strips_filename_and_query() {
        assert_eq!(
            remote_base_of("https://cdn.example.com/a/b/master.m3u8?token=x"),
            "https://cdn.example.com/a/b/"
        );
    }

    #[test]
    fn content_type_validation_ignores_charset_suffix() {
        assert!(is_valid_playlist_content_type("application/vnd.apple.mpegurl; charset=utf-8"));
        assert!(!is_valid_playlist_content_type("text/html"));
    }
}
