//! Playback-info rewriter (§4.H), grounded on the original project's
//! `service/emby/playback_info.go`.

use reqwest::header::HeaderMap;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{instrument, warn};

use crate::config::{EmbyConfig, VideoPreviewConfig};
use crate::drive::{DriveClient, FetchInfo};
use crate::emby::auth::ApiKeyCarrier;
use crate::emby::item::ItemInfo;
use crate::emby::msid;
use crate::errors::{AppError, AppResult};
use crate::path::{emby_to_drive, PrefixMap};
use crate::util::json::JsonExt;
use crate::util::url::encode_path;

/// Transcode templates offered, strongest first; `video-preview.ignore-template-ids`
/// removes entries from this set per deployment.
pub const TEMPLATE_IDS: &[&str] = &["LD", "SD", "HD", "FHD", "QHD"];

fn enabled_templates(config: &VideoPreviewConfig) -> Vec<&'static str> {
    TEMPLATE_IDS.iter().copied().filter(|t| config.template_allowed(t)).collect()
}

/// Builds the local "DirectStreamUrl" for an original (non-transcoded) source.
pub fn direct_stream_url(item_id: &str, media_source_id: &str, api_key_name: &str, api_key: &str) -> String {
    format!("/videos/{item_id}/stream?MediaSourceId={media_source_id}&{api_key_name}={api_key}&Static=true")
}

/// Builds the local transcoding URL embedded on a synthesized variant.
pub fn transcoding_url(item_id: &str, template_id: &str, api_key_name: &str, api_key: &str, drive_path: &str) -> String {
    format!(
        "/videos/{item_id}/master.m3u8?template_id={template_id}&{api_key_name}={api_key}&drive_path={}",
        encode_path(drive_path)
    )
}

/// Picks the `DisplayTitle` of the first `MediaStream` of `Type == "Video"`.
fn video_display_title(source: &Value) -> String {
    source
        .attr("MediaStreams")
        .as_array()
        .and_then(|streams| streams.iter().find(|s| s.attr("Type").as_str_opt() == Some("Video")))
        .and_then(|s| s.attr("DisplayTitle").as_str_opt())
        .unwrap_or_default()
        .to_string()
}

/// Rewrites a single upstream `MediaSource` into its direct-play form
/// (§4.H step 5): restores the request MSID if present, flips the
/// direct-play/transcode capability flags, drops transcode fields, sets
/// `DirectStreamUrl`, and prefixes the display name.
pub fn rewrite_direct_play_source(
    mut source: Value,
    item_id: &str,
    requested_msid: Option<&str>,
    api_key_name: &str,
    api_key: &str,
) -> Value {
    let display = video_display_title(&source);
    let media_source_id = requested_msid
        .map(str::to_string)
        .or_else(|| source.attr("Id").as_str_opt().map(str::to_string))
        .unwrap_or_default();

    if let Some(requested) = requested_msid {
        source.put("Id", json!(requested));
    }
    source.put("SupportsDirectPlay", json!(true));
    source.put("SupportsDirectStream", json!(true));
    source.put("SupportsTranscoding", json!(false));
    source.del_key("TranscodingUrl");
    source.del_key("TranscodingSubProtocol");
    source.del_key("TranscodingContainer");
    source.put("DirectStreamUrl", json!(direct_stream_url(item_id, &media_source_id, api_key_name, api_key)));
    source.put("Name", json!(format!("(原画) {display}")));
    source
}

/// Clones `source` into a transcode-variant `MediaSource` for `template_id`
/// (§4.H step 6).
pub fn build_variant_source(
    source: &Value,
    item_id: &str,
    origin_id: &str,
    template_id: &str,
    width: u32,
    height: u32,
    api_key_name: &str,
    api_key: &str,
    drive_path: &str,
) -> Value {
    let display = video_display_title(source);
    let variant_id = msid::encode(origin_id, template_id, Some(&format!("{width}x{height}")), Some(drive_path));

    let mut variant = source.clone();
    variant.put("Id", json!(variant_id));
    variant.put("Name", json!(format!("({template_id}_{width}x{height}) {display}")));
    variant.put("SupportsDirectPlay", json!(false));
    variant.put("SupportsDirectStream", json!(false));
    variant.put("SupportsTranscoding", json!(true));
    variant.put("TranscodingContainer", json!("ts"));
    variant.put("TranscodingSubProtocol", json!("hls"));
    variant.put(
        "TranscodingUrl",
        json!(transcoding_url(item_id, template_id, api_key_name, api_key, drive_path)),
    );
    variant
}

/// Synthesizes a subtitle `MediaStream` entry for a drive-reported subtitle
/// track, routed through the local subtitle proxy.
pub fn build_subtitle_stream(language: &str, delivery_url: &str, index: i64) -> Value {
    json!({
        "Type": "Subtitle",
        "Index": index,
        "Language": language,
        "DisplayTitle": language,
        "IsExternal": true,
        "IsTextSubtitleStream": true,
        "SupportsExternalStream": true,
        "DeliveryMethod": "External",
        "DeliveryUrl": delivery_url,
    })
}

/// Whether a PlaybackInfo response describes a single infinite (live TV)
/// stream that should be transparently proxied rather than rewritten
/// (§4.H step 2).
pub fn is_remote_infinite_stream(playback_info: &Value) -> bool {
    match playback_info.attr("MediaSources").as_array() {
        Some(sources) if sources.len() == 1 => sources[0].attr("IsInfiniteStream").as_bool_opt().unwrap_or(false),
        _ => false,
    }
}

/// Resolves a drive path for `container` from the upstream-reported `Path`,
/// returning `None` when no mapping or fallback candidate succeeds.
pub(crate) async fn resolve_drive_path(
    upstream_path: &str,
    mount_path: &str,
    prefix_map: &PrefixMap,
    drive: &DriveClient,
    header: &HeaderMap,
) -> Option<String> {
    let primary = emby_to_drive(upstream_path, mount_path, prefix_map);
    if primary.success {
        return Some(primary.path);
    }
    let candidates = primary.range(drive, header.clone()).await.ok()?;
    for candidate in candidates {
        if drive.fetch_fs_get(&candidate, header.clone()).await.is_ok() {
            return Some(candidate);
        }
    }
    None
}

/// Adds transcode variants and subtitle streams to `source` in place when
/// video-preview is enabled, the request carried no MediaSourceId, and the
/// container is whitelisted (§4.H step 6). Variants are fetched
/// concurrently, one producer task per candidate template.
#[instrument(skip(source, drive, video_preview, header))]
pub async fn augment_with_variants(
    source: &mut Value,
    item_id: &str,
    api_key_name: &str,
    api_key: &str,
    container: &str,
    upstream_path: &str,
    mount_path: &str,
    prefix_map: &PrefixMap,
    video_preview: &VideoPreviewConfig,
    drive: &DriveClient,
    header: HeaderMap,
) -> AppResult<Vec<Value>> {
    if !video_preview.enable || !video_preview.container_enabled(container) {
        return Ok(Vec::new());
    }

    let Some(drive_path) = resolve_drive_path(upstream_path, mount_path, prefix_map, drive, &header).await else {
        return Ok(Vec::new());
    };

    let origin_id = source.attr("Id").as_str_opt().unwrap_or_default().to_string();
    let mut joinset: JoinSet<(String, AppResult<crate::drive::Resource>)> = JoinSet::new();
    for template in enabled_templates(video_preview) {
        let drive = drive.clone();
        let path = drive_path.clone();
        let header = header.clone();
        let template = template.to_string();
        joinset.spawn(async move {
            let outcome = drive
                .fetch_resource(FetchInfo {
                    path,
                    use_transcode: true,
                    format: template.clone(),
                    try_raw_if_transcode_fail: false,
                    forwarded_headers: header,
                })
                .await;
            (template, outcome)
        });
    }

    let mut variants = Vec::new();
    let mut subtitle_index = source.attr("MediaStreams").as_array().map(|a| a.len() as i64).unwrap_or(0);
    let mut subtitle_streams = Vec::new();
    while let Some(joined) = joinset.join_next().await {
        let (template, outcome) = match joined {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "variant fetch task panicked");
                continue;
            }
        };
        match outcome {
            Ok(resource) => {
                variants.push(build_variant_source(
                    source,
                    item_id,
                    &origin_id,
                    &template,
                    resource.width,
                    resource.height,
                    api_key_name,
                    api_key,
                    &drive_path,
                ));
                for subtitle in &resource.subtitles {
                    subtitle_streams.push(build_subtitle_stream(
                        &subtitle.language,
                        &format!("/videos/proxy_subtitle?sub_name={}", crate::playlist::info::basename_without_query(&subtitle.url)),
                        subtitle_index,
                    ));
                    subtitle_index += 1;
                }
            }
            Err(err) => warn!(template = %template, error = %err, "transcode variant fetch failed"),
        }
    }

    if !subtitle_streams.is_empty() {
        let streams = source.attr("MediaStreams").as_array().cloned().unwrap_or_default();
        let mut merged = streams;
        merged.extend(subtitle_streams);
        source.put("MediaStreams", Value::Array(merged));
    }

    Ok(variants)
}

/// The full PlaybackInfo rewrite (§4.H steps 4-7), given an already-fetched
/// upstream response body. Cache-space short-circuit (step 3) and the
/// remote-infinite-stream short-circuit (step 2) are handled by the caller
/// before reaching this function; this covers "otherwise fetch upstream".
#[allow(clippy::too_many_arguments)]
pub async fn rewrite_playback_info(
    mut upstream_body: Value,
    item: &ItemInfo,
    emby: &EmbyConfig,
    video_preview: &VideoPreviewConfig,
    prefix_map: &PrefixMap,
    drive: &DriveClient,
    header: HeaderMap,
) -> AppResult<Value> {
    let api_key_name = match item.api_key_carrier {
        ApiKeyCarrier::Query => item.api_key_name,
        ApiKeyCarrier::Header => "api_key",
    };
    let requested_msid = if item.ms_info.empty { None } else { Some(item.ms_info.raw_id.as_str()) };

    let sources = upstream_body
        .attr("MediaSources")
        .as_array()
        .cloned()
        .ok_or_else(|| AppError::decode("PlaybackInfo 响应缺少 MediaSources"))?;

    let mut rewritten = Vec::with_capacity(sources.len());
    for mut source in sources {
        let container = source.attr("Container").as_str_opt().unwrap_or_default().to_string();
        let upstream_path = source.attr("Path").as_str_opt().unwrap_or_default().to_string();

        let mut variants = Vec::new();
        if requested_msid.is_none() {
            variants = augment_with_variants(
                &mut source,
                &item.item_id,
                api_key_name,
                &item.api_key,
                &container,
                &upstream_path,
                &emby.mount_path,
                prefix_map,
                video_preview,
                drive,
                header.clone(),
            )
            .await?;
        }

        let direct = rewrite_direct_play_source(source, &item.item_id, requested_msid, api_key_name, &item.api_key);
        rewritten.push(direct);
        rewritten.extend(variants);
    }

    upstream_body.put("MediaSources", Value::Array(rewritten));
    Ok(upstream_body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rewrites_direct_play_source_per_scenario_3() {
        let source = json!({
            "Id": "S",
            "Path": "/mnt/x/f.mkv",
            "Container": "mkv",
            "MediaStreams": [{"Type": "Video", "DisplayTitle": "1080p HEVC"}],
        });
        let rewritten = rewrite_direct_play_source(source, "7", None, "api_key", "K");
        assert_eq!(rewritten["DirectStreamUrl"], "/videos/7/stream?MediaSourceId=S&api_key=K&Static=true");
        assert_eq!(rewritten["Name"], "(原画) 1080p HEVC");
        assert_eq!(rewritten["SupportsTranscoding"], false);
        assert!(rewritten.get("TranscodingUrl").is_none());
    }

    #[test]
    fn restores_requested_msid_when_present() {
        let source = json!({"Id": "upstream-id", "MediaStreams": []});
        let rewritten = rewrite_direct_play_source(source, "7", Some("client-id"), "api_key", "K");
        assert_eq!(rewritten["Id"], "client-id");
    }

    #[test]
    fn variant_source_carries_encoded_msid_and_transcode_flags() {
        let source = json!({"MediaStreams": [{"Type": "Video", "DisplayTitle": "1080p"}]});
        let variant = build_variant_source(&source, "7", "ORIG", "FHD", 1920, 1080, "api_key", "K", "/root/a");
        assert_eq!(variant["Name"], "(FHD_1920x1080) 1080p");
        assert_eq!(variant["SupportsTranscoding"], true);
        assert_eq!(variant["TranscodingContainer"], "ts");
        let decoded = msid::decode(variant["Id"].as_str().unwrap()).unwrap();
        assert_eq!(decoded.template_id.as_deref(), Some("FHD"));
        assert_eq!(decoded.drive_path.as_deref(), Some("/root/a"));
    }

    #[test]
    fn single_infinite_source_is_detected() {
        let body = json!({"MediaSources": [{"IsInfiniteStream": true}]});
        assert!(is_remote_infinite_stream(&body));
        let body = json!({"MediaSources": [{"IsInfiniteStream": false}]});
        assert!(!is_remote_infinite_stream(&body));
        let body = json!({"MediaSources": [{}, {}]});
        assert!(!is_remote_infinite_stream(&body));
    }
}
