//! Default values for optional configuration fields, referenced via
//! `#[serde(default = "...")]` on the structs in [`super`].

pub fn http_port() -> u16 {
    8095
}

pub fn https_port() -> u16 {
    8096
}

pub fn proxy_protocol() -> bool {
    false
}

pub fn cache_enable() -> bool {
    true
}

pub fn cache_expired() -> String {
    "1d".to_string()
}

pub fn episodes_unplay_prior() -> bool {
    false
}

pub fn resort_random_items() -> bool {
    false
}

pub fn proxy_error_strategy() -> super::ProxyErrorStrategy {
    super::ProxyErrorStrategy::Origin
}

pub fn images_quality() -> u8 {
    90
}

pub fn download_strategy() -> super::DownloadStrategy {
    super::DownloadStrategy::Direct
}

pub fn video_preview_containers() -> Vec<String> {
    vec!["mkv".to_string(), "ts".to_string(), "m2ts".to_string()]
}

pub fn single_port() -> bool {
    false
}

pub fn log_level() -> String {
    "info".to_string()
}

pub fn send_stopped_mirror() -> bool {
    false
}

pub fn device_profile() -> serde_json::Value {
    serde_json::json!({
        "MaxStreamingBitrate": 400000000,
        "MaxStaticBitrate": 400000000,
        "MusicStreamingTranscodingBitrate": 384000,
        "DirectPlayProfiles": [
            { "Container": "", "Type": "Video" },
            { "Container": "", "Type": "Audio" }
        ],
        "TranscodingProfiles": [],
        "ResponseProfiles": [],
        "SubtitleProfiles": []
    })
}
