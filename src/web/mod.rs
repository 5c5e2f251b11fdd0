//! HTTP surface (§4.H-§4.M, §6): a single ordered-regex dispatch fallback
//! wired to the pure logic in `emby::*`, wrapped in the middleware chain
//! from §4.I (referer policy, API-key verification, request cacher).
//! Grounded on the original project's `web/router.go` and `web/server.go`,
//! and on the teacher's `web::WebServer`/`create_router` shape.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::Uri;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use hyper_util::rt::TokioIo;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::cache::{self, RespCache};
use crate::config::ProxyErrorStrategy;
use crate::drive::FetchInfo;
use crate::emby::{auth, download, episode, item, items, playbackinfo, playing, redirect, subtitles};
use crate::emby::EmbyServices;
use crate::errors::{AppError, AppResult};
use crate::http_client::BoundedClient;
use crate::listener;
use crate::route::{self, RouteKind};
use crate::util::json::JsonExt;
use crate::util::url as url_util;

/// Binds the dispatch fallback, the cacher/referer middleware, and CORS
/// into a single [`Router`], then drives the PROXY-protocol-aware accept
/// loop (§4.L) against it.
pub struct WebServer {
    app: Router,
    addr: SocketAddr,
    proxy_protocol: bool,
}

impl WebServer {
    pub fn new(services: EmbyServices, addr: SocketAddr) -> Self {
        let proxy_protocol = services.config.server.proxy_protocol;
        let app = Router::new()
            .fallback(dispatch)
            .layer(axum::middleware::from_fn_with_state(services.clone(), cacher_middleware))
            .layer(axum::middleware::from_fn(referer_policy_middleware))
            .layer(CorsLayer::permissive())
            .with_state(services);
        Self { app, addr, proxy_protocol }
    }

    pub fn host(&self) -> std::net::IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn serve(self) -> AppResult<()> {
        listener::serve(self.app, self.addr, self.proxy_protocol).await
    }
}

const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn header_name(s: &str) -> HeaderName {
    HeaderName::from_bytes(s.as_bytes()).expect("constant header name is valid")
}

fn bytes_response(status: StatusCode, headers: HeaderMap, body: Vec<u8>) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn json_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(reqwest::header::CONTENT_TYPE, HeaderValue::from_static("application/json;charset=utf-8"));
    headers
}

fn respond_json(status: StatusCode, value: &Value) -> AppResult<Response> {
    let body = serde_json::to_vec(value)?;
    Ok(bytes_response(status, json_headers(), body))
}

fn redirect_response(location: &str) -> Response {
    match Response::builder()
        .status(StatusCode::TEMPORARY_REDIRECT)
        .header(reqwest::header::LOCATION, location)
        .body(Body::empty())
    {
        Ok(resp) => resp,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn insert_expiry_hint(headers: &mut HeaderMap, ttl: Duration) {
    let value = cache::duration_to_expiry_header(now_millis(), ttl);
    headers.insert(
        header_name(cache::HEADER_KEY_EXPIRED),
        HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("-1")),
    );
}

fn insert_space_hints(headers: &mut HeaderMap, space: &str, space_key: &str, ttl: Duration) {
    insert_expiry_hint(headers, ttl);
    headers.insert(header_name(cache::HEADER_KEY_SPACE), HeaderValue::from_str(space).unwrap_or(HeaderValue::from_static("")));
    headers.insert(
        header_name(cache::HEADER_KEY_SPACE_KEY),
        HeaderValue::from_str(space_key).unwrap_or(HeaderValue::from_static("")),
    );
}

fn request_target(uri: &Uri) -> String {
    match uri.query() {
        Some(q) if !q.is_empty() => format!("{}?{q}", uri.path()),
        _ => uri.path().to_string(),
    }
}

fn query_pairs(uri: &Uri) -> Vec<(String, String)> {
    url::form_urlencoded::parse(uri.query().unwrap_or_default().as_bytes())
        .into_owned()
        .collect()
}

fn serialize_query(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn body_media_source_id(body: &Bytes) -> Option<String> {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.attr("MediaSourceId").as_str_opt().map(str::to_string))
}

/// Strips `Host` (the outgoing request targets a different authority) before
/// issuing a raw, unparsed byte-for-byte request to `base_host`.
async fn raw_passthrough(
    client: &BoundedClient,
    base_host: &str,
    uri: &Uri,
    method: Method,
    mut headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    headers.remove(reqwest::header::HOST);
    let url = format!("{base_host}{}", request_target(uri));
    let body_opt = if body.is_empty() { None } else { Some(body) };
    let outcome = client.execute(method, &url, headers, body_opt, true).await?;
    let status = StatusCode::from_u16(outcome.response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let resp_headers = outcome.response.headers().clone();
    let bytes = outcome.response.bytes().await?;
    Ok(bytes_response(status, resp_headers, bytes.to_vec()))
}

async fn generic_cached_passthrough(
    services: &EmbyServices,
    method: Method,
    uri: &Uri,
    headers: HeaderMap,
    body: Bytes,
    ttl: Option<Duration>,
) -> AppResult<Response> {
    let mut resp = raw_passthrough(services.emby.raw_client(), services.emby.host(), uri, method, headers, body).await?;
    if let Some(ttl) = ttl {
        insert_expiry_hint(resp.headers_mut(), ttl);
    }
    Ok(resp)
}

async fn fetch_upstream_playback_info(services: &EmbyServices, item: &item::ItemInfo) -> AppResult<Value> {
    let body = serde_json::to_vec(&services.config.emby.device_profile)?;
    let resp = services
        .emby
        .fetch(&item.playback_info_uri, Method::POST, HeaderMap::new(), Some(bytes::Bytes::from(body)))
        .await?;
    if resp.status != StatusCode::OK {
        return Err(AppError::upstream_status(resp.status.as_u16(), resp.body.to_string()));
    }
    Ok(resp.body)
}

/// §4.H "PlaybackInfo rewrite": resolves item info, consults the
/// `PlaybackInfo/{itemId}{apiKey}` cache space (step 3) before ever calling
/// upstream, otherwise fetches upstream, short-circuits a single infinite
/// (live) source unchanged (step 2), and otherwise rewrites and publishes.
async fn playbackinfo_handler(services: &EmbyServices, uri: &Uri, headers: &HeaderMap, body: &Bytes) -> AppResult<Response> {
    let query = query_pairs(uri);
    let raw_msid = query
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("MediaSourceId"))
        .map(|(_, v)| v.clone())
        .or_else(|| body_media_source_id(body));
    let item = item::resolve_item_info(&services.config.emby.mount_path, uri.path(), &query, headers, raw_msid.as_deref())?;

    let space_key = format!("{}{}", item.item_id, item.api_key);
    if let Some(entry) = services.cache.get_by_space("PlaybackInfo", &space_key).await {
        if item.ms_info.empty {
            let snapshot = entry.read().await;
            return Ok(bytes_response(
                StatusCode::from_u16(snapshot.code).unwrap_or(StatusCode::OK),
                snapshot.headers.clone(),
                snapshot.body.clone(),
            ));
        }

        let mut snapshot = entry.write().await;
        let mut cached_body: Value =
            serde_json::from_slice(&snapshot.body).map_err(|e| AppError::decode(format!("缓存的 PlaybackInfo 无法解析: {e}")))?;
        let sources = cached_body.attr("MediaSources").as_array().cloned().unwrap_or_default();
        let Some(position) = sources.iter().position(|s| s.attr("Id").as_str_opt() == Some(item.ms_info.raw_id.as_str())) else {
            return Err(AppError::CacheMissRetry);
        };

        let mut reordered = sources;
        let selected = reordered.remove(position);
        let target_item_id = selected.attr("ItemId").as_str_opt().map(str::to_string);
        reordered.insert(0, selected);

        let default_audio = query.iter().find(|(k, _)| k.eq_ignore_ascii_case("DefaultAudioStreamIndex")).map(|(_, v)| v.clone());
        let default_subtitle = query.iter().find(|(k, _)| k.eq_ignore_ascii_case("DefaultSubtitleStreamIndex")).map(|(_, v)| v.clone());
        for source in reordered.iter_mut() {
            if source.attr("ItemId").as_str_opt().map(str::to_string) != target_item_id {
                continue;
            }
            if let Some(v) = default_audio.as_ref().and_then(|v| v.parse::<i64>().ok()) {
                source.put("DefaultAudioStreamIndex", json!(v));
            }
            if let Some(v) = default_subtitle.as_ref().and_then(|v| v.parse::<i64>().ok()) {
                source.put("DefaultSubtitleStreamIndex", json!(v));
            }
        }

        cached_body.put("MediaSources", Value::Array(reordered.clone()));
        let updated_bytes = serde_json::to_vec(&cached_body)?;
        let updated_headers = snapshot.headers.clone();
        snapshot.apply_update(snapshot.code, updated_bytes, updated_headers);
        let status = StatusCode::from_u16(snapshot.code).unwrap_or(StatusCode::OK);
        drop(snapshot);

        let mut single = cached_body;
        single.put("MediaSources", Value::Array(vec![reordered[0].clone()]));
        return respond_json(status, &single);
    }

    let upstream_body = fetch_upstream_playback_info(services, &item).await?;

    if playbackinfo::is_remote_infinite_stream(&upstream_body) {
        return respond_json(StatusCode::OK, &upstream_body);
    }

    let rewritten = playbackinfo::rewrite_playback_info(
        upstream_body,
        &item,
        &services.config.emby,
        &services.config.video_preview,
        &services.prefix_map,
        &services.drive,
        headers.clone(),
    )
    .await?;

    let body_bytes = serde_json::to_vec(&rewritten)?;
    let mut resp_headers = json_headers();
    insert_space_hints(&mut resp_headers, "PlaybackInfo", &space_key, Duration::from_secs(12 * 3600));
    Ok(bytes_response(StatusCode::OK, resp_headers, body_bytes))
}

async fn playing_stopped_handler(services: &EmbyServices, uri: &Uri, headers: HeaderMap, body: Bytes) -> AppResult<Response> {
    let resp = raw_passthrough(services.emby.raw_client(), services.emby.host(), uri, Method::POST, headers, body.clone()).await?;
    if let Ok(parsed) = serde_json::from_slice::<Value>(&body) {
        if let (Some(item_id), Some(position_ticks)) = (
            parsed.attr("ItemId").as_str_opt().map(str::to_string),
            parsed.attr("PositionTicks").as_i64_opt(),
        ) {
            services
                .playing
                .on_stopped(services.emby.clone(), item_id, position_ticks, services.config.emby.send_stopped_mirror)
                .await;
        }
    }
    Ok(resp)
}

async fn playing_progress_handler(services: &EmbyServices, uri: &Uri, headers: HeaderMap, body: Bytes) -> AppResult<Response> {
    if let Ok(parsed) = serde_json::from_slice::<Value>(&body) {
        if let Some(position_ticks) = parsed.attr("PositionTicks").as_i64_opt() {
            if playing::is_progress_noise(position_ticks) {
                return Ok(StatusCode::NO_CONTENT.into_response());
            }
        }
    }
    raw_passthrough(services.emby.raw_client(), services.emby.host(), uri, Method::POST, headers, body).await
}

async fn fetch_upstream_json(services: &EmbyServices, method: Method, uri: &Uri) -> AppResult<(StatusCode, Value)> {
    let resp = services.emby.fetch(&request_target(uri), method, HeaderMap::new(), None).await?;
    let status = StatusCode::from_u16(resp.status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok((status, resp.body))
}

/// §4.K: an item-detail response is overlaid with the cached PlaybackInfo
/// MediaSources for the same item when video-preview variants exist, so a
/// client browsing the library sees transcode variants without opening
/// playback first.
async fn items_detail_handler(services: &EmbyServices, uri: &Uri, headers: &HeaderMap) -> AppResult<Response> {
    let query = query_pairs(uri);
    let (status, mut value) = fetch_upstream_json(services, Method::GET, uri).await?;
    if services.config.video_preview.enable {
        if let (Some(item_id), Some(lookup)) = (route::captured_item_id(uri.path()), auth::extract_api_key(&query, headers)) {
            let space_key = format!("{item_id}{}", lookup.api_key);
            if let Some(entry) = services.cache.get_by_space("PlaybackInfo", &space_key).await {
                let snapshot = entry.read().await;
                if let Ok(cached) = serde_json::from_slice::<Value>(&snapshot.body) {
                    if let Some(sources) = cached.attr("MediaSources").as_array() {
                        value.put("MediaSources", Value::Array(sources.clone()));
                    }
                }
            }
        }
    }
    respond_json(status, &value)
}

async fn episode_items_handler(services: &EmbyServices, uri: &Uri) -> AppResult<Response> {
    let (status, mut body) = fetch_upstream_json(services, Method::GET, uri).await?;
    if services.config.emby.episodes_unplay_prior {
        if let Some(items) = body.attr("Items").as_array().cloned() {
            let reordered = episode::reorder_unplayed_first(&items, |it| it.attr("UserData").attr("Played").as_bool_opt().unwrap_or(false));
            body.put("Items", Value::Array(reordered));
        }
    }
    respond_json(status, &body)
}

/// §4.K "Random items": below the threshold, proxied unchanged; at or above
/// it, served from the `UserItems/{fingerprint}` cache space (reshuffled on
/// every hit) or redirected once to `with_limit` to populate it.
async fn items_random_handler(services: &EmbyServices, uri: &Uri, method: Method, headers: HeaderMap, body: Bytes) -> AppResult<Response> {
    let query = query_pairs(uri);
    let limit = query
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("Limit"))
        .and_then(|(_, v)| v.parse::<i64>().ok())
        .unwrap_or(0);
    if !services.config.emby.resort_random_items || limit < items::RANDOM_ITEMS_LIMIT_THRESHOLD {
        return generic_cached_passthrough(services, method, uri, headers, body, None).await;
    }

    let fingerprint = items::random_items_fingerprint(&query);
    if let Some(entry) = services.cache.get_by_space("UserItems", &fingerprint).await {
        let snapshot = entry.read().await;
        if !snapshot.is_expired(now_millis()) {
            if let Ok(cached) = serde_json::from_slice::<Value>(&snapshot.body) {
                return respond_json(StatusCode::OK, &items::shuffle_cached_items(&cached));
            }
        }
    }

    let mut redirect_query = query.clone();
    redirect_query.retain(|(k, _)| !k.eq_ignore_ascii_case("Limit"));
    redirect_query.push(("Limit".to_string(), items::WITH_LIMIT_UPSTREAM_LIMIT.to_string()));
    let location = format!("{}/with_limit?{}", uri.path(), serialize_query(&redirect_query));
    Ok(redirect_response(&location))
}

async fn items_with_limit_handler(services: &EmbyServices, uri: &Uri) -> AppResult<Response> {
    let query = query_pairs(uri);
    let upstream_path = uri.path().trim_end_matches("/with_limit");
    let target = format!("{upstream_path}?{}", serialize_query(&query));
    let resp = services.emby.fetch(&target, Method::GET, HeaderMap::new(), None).await?;
    let status = StatusCode::from_u16(resp.status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);

    let fingerprint = items::random_items_fingerprint(&query);
    let body_bytes = serde_json::to_vec(&resp.body)?;
    let mut headers = json_headers();
    insert_space_hints(&mut headers, "UserItems", &fingerprint, Duration::from_secs(3 * 3600));
    Ok(bytes_response(status, headers, body_bytes))
}

fn api_key_name_for(query: &[(String, String)], headers: &HeaderMap) -> &'static str {
    auth::extract_api_key(query, headers).map(|l| l.query_name).unwrap_or("api_key")
}

async fn subtitles_handler(services: &EmbyServices, uri: &Uri, headers: &HeaderMap, body: Bytes, method: Method) -> AppResult<Response> {
    let query = query_pairs(uri);
    let api_key_name = api_key_name_for(&query, headers);
    if subtitles::is_transcoded_subtitle_request(&query, api_key_name) {
        let location = subtitles::proxy_subtitle_redirect(uri.query().unwrap_or_default());
        return Ok(redirect_response(&location));
    }
    generic_cached_passthrough(services, method, uri, headers.clone(), body, Some(subtitles::PASSTHROUGH_SUBTITLE_CACHE_TTL)).await
}

/// §4.J stream/universal/download redirect resolution: a previously
/// synthesized variant MSID redirects straight back to the local HLS
/// master; otherwise the upstream `MediaSource.Path` is classified as strm,
/// local-root, or drive-resolvable.
async fn stream_redirect_handler(services: &EmbyServices, uri: &Uri, headers: &HeaderMap) -> AppResult<Response> {
    let query = query_pairs(uri);
    let raw_msid = query.iter().find(|(k, _)| k.eq_ignore_ascii_case("MediaSourceId")).map(|(_, v)| v.clone());
    let item = item::resolve_item_info(&services.config.emby.mount_path, uri.path(), &query, headers, raw_msid.as_deref())?;
    let api_key_name = match item.api_key_carrier {
        auth::ApiKeyCarrier::Query => item.api_key_name,
        auth::ApiKeyCarrier::Header => "api_key",
    };

    if let Some(drive_path) = item.ms_info.drive_path.clone() {
        let template_id = item.ms_info.template_id.clone().unwrap_or_default();
        let location = format!(
            "/videos/{}/master.m3u8?template_id={template_id}&{api_key_name}={}&drive_path={}",
            item.item_id,
            item.api_key,
            url_util::encode_path(&drive_path)
        );
        return Ok(redirect_response(&location));
    }

    let upstream_body = fetch_upstream_playback_info(services, &item).await?;
    let sources = upstream_body.attr("MediaSources").as_array().cloned().unwrap_or_default();
    let source = if item.ms_info.empty {
        sources.first()
    } else {
        sources.iter().find(|s| s.attr("Id").as_str_opt() == Some(item.ms_info.origin_id.as_str()))
    }
    .ok_or_else(|| AppError::drive_resource_missing("未找到匹配的 MediaSource"))?;

    let upstream_path = source.attr("Path").as_str_opt().unwrap_or_default().to_string();

    let target = redirect::resolve_redirect_target(
        None,
        |_| String::new(),
        &upstream_path,
        services.config.emby.local_media_root.as_deref(),
        &services.config.emby.strm.path_map,
        None,
    );

    match target {
        redirect::RedirectTarget::Strm(mapped) => Ok(redirect_response(&mapped)),
        redirect::RedirectTarget::ProxyOrigin => {
            raw_passthrough(services.emby.raw_client(), services.emby.host(), uri, Method::GET, headers.clone(), Bytes::new()).await
        }
        redirect::RedirectTarget::LocalMaster(_) => unreachable!("msid_drive_path branch already handled above"),
        redirect::RedirectTarget::DriveUrl(_) => {
            let clean_header = crate::drive::DriveClient::clean_header(headers);
            let resolved_path = playbackinfo::resolve_drive_path(
                &upstream_path,
                &services.config.emby.mount_path,
                &services.prefix_map,
                &services.drive,
                &clean_header,
            )
            .await
            .ok_or_else(|| AppError::drive_resource_missing(upstream_path.clone()))?;

            let resource = services
                .drive
                .fetch_resource(FetchInfo {
                    path: resolved_path,
                    use_transcode: false,
                    format: String::new(),
                    try_raw_if_transcode_fail: false,
                    forwarded_headers: clean_header,
                })
                .await?;

            let mut headers = HeaderMap::new();
            insert_expiry_hint(&mut headers, Duration::from_secs(10 * 60));
            let mut resp = redirect_response(&resource.url);
            resp.headers_mut().extend(headers);
            Ok(resp)
        }
    }
}

async fn master_redirect_handler(uri: &Uri) -> AppResult<Response> {
    let query = query_pairs(uri);
    let has = |name: &str| query.iter().any(|(k, _)| k.eq_ignore_ascii_case(name));
    if !has("template_id") || !has("drive_path") {
        return Err(AppError::decode("master.m3u8 请求缺少 template_id 或 drive_path"));
    }
    Ok(redirect_response(&format!("/videos/proxy_playlist?{}", serialize_query(&query))))
}

async fn proxy_playlist_handler(services: &EmbyServices, uri: &Uri, headers: &HeaderMap) -> AppResult<Response> {
    let query = query_pairs(uri);
    let get = |name: &str| query.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.clone());
    let template_id = get("template_id").ok_or_else(|| AppError::decode("缺少 template_id"))?;
    let drive_path_b64 = get("drive_path").ok_or_else(|| AppError::decode("缺少 drive_path"))?;
    let drive_path = url_util::decode_path(&drive_path_b64);
    let local_base = format!("/videos/proxy_ts?template_id={template_id}&drive_path={drive_path_b64}");

    let body = services.playlists.get_playlist(&drive_path, &template_id, &local_base, headers.clone()).await?;

    let mut headers = HeaderMap::new();
    headers.insert(reqwest::header::CONTENT_TYPE, HeaderValue::from_static("application/vnd.apple.mpegurl"));
    Ok(bytes_response(StatusCode::OK, headers, body.into_bytes()))
}

async fn proxy_ts_handler(services: &EmbyServices, uri: &Uri) -> AppResult<Response> {
    let query = query_pairs(uri);
    let get = |name: &str| query.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.clone());
    let template_id = get("template_id").ok_or_else(|| AppError::decode("缺少 template_id"))?;
    let drive_path_b64 = get("drive_path").ok_or_else(|| AppError::decode("缺少 drive_path"))?;
    let ts_name = get("ts_name").ok_or_else(|| AppError::decode("缺少 ts_name"))?;
    let drive_path = url_util::decode_path(&drive_path_b64);
    let link = services.playlists.get_ts_link(&drive_path, &template_id, &ts_name).await?;
    Ok(redirect_response(&link))
}

async fn proxy_subtitle_handler(services: &EmbyServices, uri: &Uri, headers: &HeaderMap) -> AppResult<Response> {
    let query = query_pairs(uri);
    let get = |name: &str| query.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.clone());
    let template_id = get("template_id").ok_or_else(|| AppError::decode("缺少 template_id"))?;
    let drive_path_b64 = get("drive_path").ok_or_else(|| AppError::decode("缺少 drive_path"))?;
    let sub_name = get("sub_name").ok_or_else(|| AppError::decode("缺少 sub_name"))?;
    let drive_path = url_util::decode_path(&drive_path_b64);
    let link = services.playlists.get_subtitle_link(&drive_path, &template_id, &sub_name).await?;

    let outcome = services.drive.raw_client().execute(Method::GET, &link, headers.clone(), None, true).await?;
    let status = StatusCode::from_u16(outcome.response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let resp_headers = outcome.response.headers().clone();
    let bytes = outcome.response.bytes().await?;
    Ok(bytes_response(status, resp_headers, bytes.to_vec()))
}

async fn download_handler(services: &EmbyServices, uri: &Uri, headers: &HeaderMap, method: Method, body: Bytes) -> AppResult<Response> {
    match download::resolve_download_decision(services.config.emby.download_strategy) {
        download::DownloadDecision::Forbidden => Ok(StatusCode::FORBIDDEN.into_response()),
        download::DownloadDecision::ProxyOrigin => {
            raw_passthrough(services.emby.raw_client(), services.emby.host(), uri, method, headers.clone(), body).await
        }
        download::DownloadDecision::ResolveDirect => stream_redirect_handler(services, uri, headers).await,
    }
}

/// §4.K "Sync download": resolves a `SyncJobItemId` to its `(itemId,
/// MediaSourceId)` pair by walking every sync target's ready-items list,
/// then redirects to the ordinary local stream endpoint for that pair.
async fn sync_download_handler(services: &EmbyServices, uri: &Uri) -> AppResult<Response> {
    let job_item_id = uri
        .path()
        .rsplit('/')
        .nth(1)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::decode("无法从请求路径解析 SyncJobItemId"))?
        .to_string();

    let (_, targets) = fetch_upstream_json(services, Method::GET, &"/emby/Sync/Targets".parse::<Uri>().expect("valid uri")).await?;
    let target_ids: Vec<String> = targets
        .as_array()
        .cloned()
        .unwrap_or_default()
        .iter()
        .filter_map(|t| t.attr("Id").as_str_opt().map(str::to_string))
        .collect();

    for target_id in target_ids {
        let ready_uri = format!("/emby/Sync/Items/Ready?TargetId={target_id}").parse::<Uri>().map_err(|e| AppError::decode(e.to_string()))?;
        let (_, ready) = fetch_upstream_json(services, Method::GET, &ready_uri).await?;
        let Some(items) = ready.as_array() else { continue };
        if let Some(matched) = items.iter().find(|i| i.attr("SyncJobItemId").as_str_opt() == Some(job_item_id.as_str())) {
            let item_id = matched.attr("ItemId").as_str_opt().unwrap_or_default();
            let media_source_id = matched.attr("ItemFileId").as_str_opt().unwrap_or_default();
            let location = format!("/videos/{item_id}/stream?MediaSourceId={media_source_id}");
            return Ok(redirect_response(&location));
        }
    }

    Err(AppError::drive_resource_missing(format!("未找到 SyncJobItem {job_item_id}")))
}

async fn read_until_headers_end(stream: &mut tokio::net::TcpStream) -> std::io::Result<()> {
    use tokio::io::AsyncReadExt;
    let mut buf = [0u8; 1];
    let mut seen = Vec::new();
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        seen.push(buf[0]);
        if seen.ends_with(b"\r\n\r\n") || seen.len() > 8192 {
            break;
        }
    }
    Ok(())
}

/// §4.J "Websocket endpoint": dials the upstream Emby socket ourselves,
/// replays the inbound handshake headers, discards the upstream's own
/// handshake response line-by-line, then tunnels bytes (`emby::socket`)
/// once both sides are upgraded.
async fn socket_handler(services: EmbyServices, mut req: Request) -> Response {
    let target = request_target(req.uri());
    let forward_headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter(|(k, _)| !matches!(k.as_str(), "host" | "content-length"))
        .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
        .collect();
    let upstream_host = services.emby.host().to_string();

    let upgrade_fut = hyper::upgrade::on(&mut req);

    let response = match Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(reqwest::header::CONNECTION, "upgrade")
        .header(reqwest::header::UPGRADE, "websocket")
        .body(Body::empty())
    {
        Ok(resp) => resp,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    tokio::spawn(async move {
        let client_upgraded = match upgrade_fut.await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                tracing::warn!(error = %err, "client websocket upgrade failed");
                return;
            }
        };
        let client_io = TokioIo::new(client_upgraded);

        let authority = upstream_host.trim_start_matches("https://").trim_start_matches("http://");
        let mut upstream_stream = match tokio::net::TcpStream::connect(authority).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(error = %err, %authority, "failed to dial upstream for websocket tunnel");
                return;
            }
        };

        let mut handshake = format!("GET {target} HTTP/1.1\r\nHost: {authority}\r\n");
        for (name, value) in &forward_headers {
            handshake.push_str(&format!("{name}: {value}\r\n"));
        }
        handshake.push_str("\r\n");

        if tokio::io::AsyncWriteExt::write_all(&mut upstream_stream, handshake.as_bytes()).await.is_err() {
            return;
        }
        if let Err(err) = read_until_headers_end(&mut upstream_stream).await {
            tracing::warn!(error = %err, "upstream websocket handshake failed");
            return;
        }

        if let Err(err) = crate::emby::socket::tunnel(client_io, upstream_stream).await {
            tracing::warn!(error = %err, "websocket tunnel ended with error");
        }
    });

    response
}

fn route_requires_auth(kind: RouteKind) -> bool {
    matches!(
        kind,
        RouteKind::PlaybackInfo
            | RouteKind::ResourceStream
            | RouteKind::ResourceMaster
            | RouteKind::ResourceMain
            | RouteKind::ProxyPlaylist
            | RouteKind::ProxyTs
            | RouteKind::ProxySubtitle
            | RouteKind::ItemDownload
            | RouteKind::SyncJobItemDownload
            | RouteKind::VideoSubtitles
            | RouteKind::EpisodeItems
            | RouteKind::ShowEpisodes
            | RouteKind::ItemsDetail
            | RouteKind::ItemsRandom
            | RouteKind::ItemsWithLimit
    )
}

async fn route_response(
    services: &EmbyServices,
    kind: RouteKind,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    match kind {
        RouteKind::Socket => unreachable!("socket requests never reach route_response"),
        RouteKind::PlaybackInfo => playbackinfo_handler(services, &uri, &headers, &body).await,
        RouteKind::PlayingStopped => playing_stopped_handler(services, &uri, headers, body).await,
        RouteKind::PlayingProgress => playing_progress_handler(services, &uri, headers, body).await,
        RouteKind::ItemsDetail => items_detail_handler(services, &uri, &headers).await,
        RouteKind::EpisodeItems | RouteKind::ShowEpisodes => episode_items_handler(services, &uri).await,
        RouteKind::ItemsRandom => items_random_handler(services, &uri, method, headers, body).await,
        RouteKind::ItemsWithLimit => items_with_limit_handler(services, &uri).await,
        RouteKind::PlayedItems => generic_cached_passthrough(services, method, &uri, headers, body, Some(Duration::from_secs(60))).await,
        RouteKind::VideoSubtitles => subtitles_handler(services, &uri, &headers, body, method).await,
        RouteKind::ResourceStream => stream_redirect_handler(services, &uri, &headers).await,
        RouteKind::ResourceMaster => master_redirect_handler(&uri).await,
        RouteKind::ResourceMain | RouteKind::ProxyPlaylist => proxy_playlist_handler(services, &uri, &headers).await,
        RouteKind::ProxyTs => proxy_ts_handler(services, &uri).await,
        RouteKind::ProxySubtitle => proxy_subtitle_handler(services, &uri, &headers).await,
        RouteKind::ItemDownload => download_handler(services, &uri, &headers, method, body).await,
        RouteKind::SyncJobItemDownload => sync_download_handler(services, &uri).await,
        RouteKind::Images => generic_cached_passthrough(services, method, &uri, headers, body, Some(Duration::from_secs(24 * 3600))).await,
        RouteKind::IndexHtml | RouteKind::StaticAsset => {
            generic_cached_passthrough(services, method, &uri, headers, body, Some(Duration::from_secs(24 * 3600))).await
        }
        RouteKind::CatchAll => generic_cached_passthrough(services, method, &uri, headers, body, None).await,
    }
}

/// Applies `emby.proxy-error-strategy` (§4.I) when a handler fails: `Origin`
/// falls back to an unrewritten upstream passthrough, `Reject` answers with
/// the mapped error status.
async fn handle_with_error_strategy(services: &EmbyServices, kind: RouteKind, method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    match route_response(services, kind, method.clone(), uri.clone(), headers.clone(), body.clone()).await {
        Ok(resp) => resp,
        Err(err) => {
            tracing::warn!(error = %err, route = ?kind, "handler failed");
            match services.config.emby.proxy_error_strategy {
                ProxyErrorStrategy::Origin => {
                    match raw_passthrough(services.emby.raw_client(), services.emby.host(), &uri, method, headers, body).await {
                        Ok(resp) => resp,
                        Err(_) => err.into_response(),
                    }
                }
                ProxyErrorStrategy::Reject => err.into_response(),
            }
        }
    }
}

async fn dispatch(State(services): State<EmbyServices>, req: Request) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let kind = route::match_route(&request_target(&uri));

    if kind == RouteKind::Socket {
        return socket_handler(services, req).await;
    }

    let headers = req.headers().clone();
    let body = match axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(err) => return AppError::decode(err.to_string()).into_response(),
    };

    if route_requires_auth(kind) {
        let query = query_pairs(&uri);
        match auth::extract_api_key(&query, &headers) {
            None => return StatusCode::UNAUTHORIZED.into_response(),
            Some(lookup) => match services.trusted_keys.verify(&services.emby, &lookup).await {
                Ok(true) => {}
                Ok(false) => return (StatusCode::UNAUTHORIZED, auth::INVALID_TOKEN_BODY).into_response(),
                Err(err) => return err.into_response(),
            },
        }
    }

    handle_with_error_strategy(&services, kind, method, uri, headers, body).await
}

/// §4.I "referer policy": stamps `Referrer-Policy: no-referrer` on every
/// response, including ones a downstream handler already built.
async fn referer_policy_middleware(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    resp.headers_mut().insert(HeaderName::from_static("referrer-policy"), HeaderValue::from_static("no-referrer"));
    resp
}

/// §4.F "request cacher": a read-through cache keyed by the full request
/// fingerprint (method/path/query/body/headers), wrapping every route
/// except the websocket tunnel. Handlers opt in by setting the `Expired`
/// (and optionally `Space`/`Space-Key`) hint headers on their response;
/// this middleware persists the entry and strips the hints before the
/// response reaches the client. This is independent of the cache-space
/// short-circuits specific handlers (PlaybackInfo, random items) consult
/// directly -- those serve a semantic lookup this layer cannot express,
/// while this layer serves byte-identical repeat requests.
async fn cacher_middleware(State(services): State<EmbyServices>, req: Request, next: Next) -> Response {
    let uri = req.uri().clone();
    let target = request_target(&uri);
    if route::match_route(&target) == RouteKind::Socket {
        return next.run(req).await;
    }

    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(err) => return AppError::decode(err.to_string()).into_response(),
    };
    let query = query_pairs(&uri);
    let cache_key = cache::calc_cache_key(parts.method.as_str(), uri.path(), &query, &body_bytes, &parts.headers);

    if let Some(entry) = services.cache.get(&cache_key).await {
        let snapshot = entry.read().await;
        if !snapshot.is_expired(now_millis()) {
            return bytes_response(
                StatusCode::from_u16(snapshot.code).unwrap_or(StatusCode::OK),
                snapshot.headers.clone(),
                snapshot.body.clone(),
            );
        }
    }

    let req = Request::from_parts(parts, Body::from(body_bytes));
    let response = next.run(req).await;
    let (mut resp_parts, resp_body) = response.into_parts();

    let Some(expired_value) = resp_parts.headers.get(header_name(cache::HEADER_KEY_EXPIRED)).cloned() else {
        return Response::from_parts(resp_parts, resp_body);
    };
    let resp_bytes = match axum::body::to_bytes(resp_body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let expiry_millis = expired_value.to_str().ok().and_then(|s| s.parse::<i64>().ok()).unwrap_or(-1);
    let space = resp_parts
        .headers
        .get(header_name(cache::HEADER_KEY_SPACE))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let space_key = resp_parts
        .headers
        .get(header_name(cache::HEADER_KEY_SPACE_KEY))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    resp_parts.headers.remove(header_name(cache::HEADER_KEY_EXPIRED));
    resp_parts.headers.remove(header_name(cache::HEADER_KEY_SPACE));
    resp_parts.headers.remove(header_name(cache::HEADER_KEY_SPACE_KEY));

    services
        .cache
        .put(RespCache {
            code: resp_parts.status.as_u16(),
            body: resp_bytes.to_vec(),
            headers: resp_parts.headers.clone(),
            expiry_millis,
            cache_key,
            space,
            space_key,
        })
        .await;

    Response::from_parts(resp_parts, Body::from(resp_bytes))
}

#[cfg(test)]
mod tests {
    use axum::body::Body as ReqBody;
    use axum::http::{Method as ReqMethod, Request as HttpRequest};
    use serde_json::json;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::config::*;
    use crate::emby::EmbyServices;

    use super::*;

    fn test_config(emby_host: String, drive_host: String) -> Config {
        Config {
            emby: EmbyConfig {
                host: emby_host,
                mount_path: "/emby".to_string(),
                api_key: "server-key".to_string(),
                episodes_unplay_prior: false,
                resort_random_items: false,
                proxy_error_strategy: ProxyErrorStrategy::Reject,
                images_quality: 90,
                download_strategy: DownloadStrategy::Direct,
                local_media_root: None,
                strm: StrmConfig::default(),
                send_stopped_mirror: false,
                device_profile: json!({}),
            },
            drive: DriveConfig {
                token: "drive-token".to_string(),
                host: drive_host,
            },
            video_preview: VideoPreviewConfig::default(),
            path: PathConfig::default(),
            cache: CacheConfig::default(),
            ssl: SslConfig::default(),
            log: LogConfig::default(),
            server: ServerConfig::default(),
        }
    }

    fn test_router(services: EmbyServices) -> Router {
        Router::new()
            .fallback(dispatch)
            .layer(axum::middleware::from_fn_with_state(services.clone(), cacher_middleware))
            .layer(axum::middleware::from_fn(referer_policy_middleware))
            .with_state(services)
    }

    async fn get(app: &Router, uri: &str) -> Response {
        app.clone()
            .oneshot(HttpRequest::builder().method(ReqMethod::GET).uri(uri).body(ReqBody::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn unauthorized_playback_info_request_is_rejected() {
        let upstream = MockServer::start().await;
        let services = EmbyServices::new(test_config(upstream.uri(), upstream.uri())).unwrap();
        let app = test_router(services);

        let resp = get(&app, "/emby/Items/42/PlaybackInfo").await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn playback_info_rewrite_is_coalesced_by_the_request_cache() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/emby/Items/42/PlaybackInfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "MediaSources": [
                    { "Id": "src1", "Path": "/media/movies/foo.mkv", "Container": "mkv" }
                ]
            })))
            .expect(1)
            .mount(&upstream)
            .await;

        let services = EmbyServices::new(test_config(upstream.uri(), upstream.uri())).unwrap();
        let app = test_router(services);

        let first = get(&app, "/emby/Items/42/PlaybackInfo?api_key=server-key").await;
        assert_eq!(first.status(), StatusCode::OK);
        let second = get(&app, "/emby/Items/42/PlaybackInfo?api_key=server-key").await;
        assert_eq!(second.status(), StatusCode::OK);

        // The mock's `.expect(1)` is checked when `upstream` drops at the end
        // of this test; a third identical request would panic there if the
        // generic request cache failed to coalesce it.
    }

    #[tokio::test]
    async fn referer_policy_header_is_present_on_every_response() {
        let upstream = MockServer::start().await;
        let services = EmbyServices::new(test_config(upstream.uri(), upstream.uri())).unwrap();
        let app = test_router(services);

        let resp = get(&app, "/emby/Items/42/PlaybackInfo").await;
        assert_eq!(resp.headers().get("referrer-policy").unwrap(), "no-referrer");
    }
}
