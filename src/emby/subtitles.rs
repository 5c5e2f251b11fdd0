//! Subtitle redirect/proxy decision (§4.J bullet on `/emby/Videos/{id}/Subtitles`),
//! grounded on the original project's `service/emby/subtitle.go`.

use std::time::Duration;

/// Cache TTL applied when a subtitle request is proxied unchanged to
/// upstream (not a transcoded-subtitle redirect).
pub const PASSTHROUGH_SUBTITLE_CACHE_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

/// The query parameters that, when all present, mark a subtitle request as
/// referring to a drive-side transcoded subtitle track rather than an
/// upstream-embedded one.
const TRANSCODED_SUBTITLE_PARAMS: &[&str] = &["drive_path", "template_id", "sub_name"];

/// Whether `query` carries every parameter required to redirect to the
/// local `/videos/proxy_subtitle` endpoint, given the name under which the
/// API key is expected (`api_key` or `X-Emby-Token`).
pub fn is_transcoded_subtitle_request(query: &[(String, String)], api_key_name: &str) -> bool {
    let has = |name: &str| query.iter().any(|(k, _)| k.eq_ignore_ascii_case(name));
    TRANSCODED_SUBTITLE_PARAMS.iter().all(|p| has(p)) && has(api_key_name)
}

/// Builds the local proxy-subtitle redirect target, preserving the raw
/// query string verbatim.
pub fn proxy_subtitle_redirect(raw_query: &str) -> String {
    format!("/videos/proxy_subtitle?{raw_query}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn all_params_present_is_recognized_as_transcoded() {
        let q = query(&[
            ("drive_path", "abc"),
            ("template_id", "HD"),
            ("sub_name", "eng.srt"),
            ("api_key", "K"),
        ]);
        assert!(is_transcoded_subtitle_request(&q, "api_key"));
    }

    #[test]
    fn missing_a_param_falls_back_to_passthrough() {
        let q = query(&[("drive_path", "abc"), ("template_id", "HD")]);
        assert!(!is_transcoded_subtitle_request(&q, "api_key"));
    }

    #[test]
    fn redirect_preserves_raw_query_verbatim() {
        assert_eq!(proxy_subtitle_redirect("a=1&b=2"), "/videos/proxy_subtitle?a=1&b=2");
    }
}
