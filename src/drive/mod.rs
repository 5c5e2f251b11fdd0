//! Drive API client (§4.B): typed wrappers around the cloud-drive indexing
//! service's `list`/`get`/`other` endpoints, grounded on the original
//! project's `service/openlist/api.go`.

use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::config::DriveConfig;
use crate::errors::{AppError, AppResult};
use crate::http_client::BoundedClient;

/// Headers forwarded verbatim from the client's original request to the
/// drive API. Deliberately small: the drive only needs enough to pick the
/// right CDN edge.
const FORWARDED_HEADERS: &[&str] = &["user-agent"];

#[derive(Debug, Clone, Serialize)]
struct FsRequestBody<'a> {
    refresh: bool,
    password: &'a str,
    path: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct FsOtherRequestBody<'a> {
    method: &'a str,
    password: &'a str,
    path: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoteCommonResult {
    code: i32,
    message: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FsListEntry {
    pub name: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FsList {
    #[serde(default)]
    pub content: Vec<FsListEntry>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FsGet {
    pub raw_url: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LiveTranscodingTask {
    pub template_id: String,
    #[serde(default)]
    pub template_width: u32,
    #[serde(default)]
    pub template_height: u32,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LiveTranscodingSubtitleTask {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct VideoPreviewPlayInfo {
    #[serde(default)]
    pub live_transcoding_task_list: Vec<LiveTranscodingTask>,
    #[serde(default)]
    pub live_transcoding_subtitle_task_list: Vec<LiveTranscodingSubtitleTask>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FsOther {
    #[serde(default)]
    pub video_preview_play_info: VideoPreviewPlayInfo,
}

/// Result of resolving a playable resource from the drive: a direct URL,
/// plus any subtitle tracks discovered alongside a transcode variant.
#[derive(Debug, Clone)]
pub struct Resource {
    pub url: String,
    pub subtitles: Vec<LiveTranscodingSubtitleTask>,
    /// Matched transcode template's reported dimensions; `0x0` in raw mode
    /// or when the fallback path was taken.
    pub width: u32,
    pub height: u32,
}

/// Parameters for [`DriveClient::fetch_resource`].
#[derive(Debug, Clone)]
pub struct FetchInfo {
    pub path: String,
    pub use_transcode: bool,
    pub format: String,
    pub try_raw_if_transcode_fail: bool,
    pub forwarded_headers: HeaderMap,
}

#[derive(Clone)]
pub struct DriveClient {
    client: BoundedClient,
    config: DriveConfig,
}

impl DriveClient {
    pub fn new(client: BoundedClient, config: DriveConfig) -> Self {
        Self { client, config }
    }

    /// Exposes the underlying bounded HTTP client for callers that need to
    /// fetch a resolved resource URL directly (e.g. the playlist manager
    /// downloading a `.m3u8` once `fetch_resource` has resolved it).
    pub fn raw_client(&self) -> &BoundedClient {
        &self.client
    }

    #[instrument(skip(self, header), fields(path))]
    pub async fn fetch_fs_list(&self, path: &str, header: HeaderMap) -> AppResult<FsList> {
        self.fetch(
            "/api/fs/list",
            header,
            &FsRequestBody {
                refresh: true,
                password: "",
                path,
            },
        )
        .await
    }

    #[instrument(skip(self, header), fields(path))]
    pub async fn fetch_fs_get(&self, path: &str, header: HeaderMap) -> AppResult<FsGet> {
        self.fetch(
            "/api/fs/get",
            header,
            &FsRequestBody {
                refresh: true,
                password: "",
                path,
            },
        )
        .await
    }

    #[instrument(skip(self, header), fields(path))]
    pub async fn fetch_fs_other(&self, path: &str, header: HeaderMap) -> AppResult<FsOther> {
        self.fetch(
            "/api/fs/other",
            header,
            &FsOtherRequestBody {
                method: "video_preview",
                password: "",
                path,
            },
        )
        .await
    }

    async fn fetch<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        uri: &str,
        mut header: HeaderMap,
        body: &B,
    ) -> AppResult<T> {
        header.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json;charset=utf-8"),
        );
        header.insert(
            reqwest::header::AUTHORIZATION,
            HeaderValue::from_str(&self.config.token).map_err(|e| AppError::decode(e.to_string()))?,
        );

        let url = format!("{}{uri}", self.config.host);
        let resp = self
            .client
            .inner()
            .post(&url)
            .headers(header)
            .json(body)
            .send()
            .await?;
        let bytes = resp.bytes().await?;
        let parsed: RemoteCommonResult = serde_json::from_slice(&bytes)?;
        if parsed.code != 200 {
            return Err(AppError::upstream_status(parsed.code as u16, parsed.message));
        }
        Ok(serde_json::from_value(parsed.data)?)
    }

    /// Retains only the small whitelist of caller headers the drive API is
    /// allowed to see (currently `User-Agent`).
    pub fn clean_header(header: &HeaderMap) -> HeaderMap {
        let mut out = HeaderMap::new();
        for name in FORWARDED_HEADERS {
            if let Some(v) = header.get(*name) {
                out.insert(
                    reqwest::header::HeaderName::from_static(name),
                    v.clone(),
                );
            }
        }
        out
    }

    /// Resolves a playable resource for `fi.path`, optionally following the
    /// raw-fallback path on transcode failure (§4.B).
    #[instrument(skip(self, fi), fields(path = %fi.path, use_transcode = fi.use_transcode, format = %fi.format))]
    pub async fn fetch_resource(&self, fi: FetchInfo) -> AppResult<Resource> {
        if fi.path.trim().is_empty() {
            return Err(AppError::decode("参数 path 不能为空"));
        }
        let header = Self::clean_header(&fi.forwarded_headers);

        if !fi.use_transcode {
            let res = self.fetch_fs_get(&fi.path, header).await?;
            return Ok(Resource {
                url: res.raw_url,
                subtitles: Vec::new(),
                width: 0,
                height: 0,
            });
        }

        match self.fetch_fs_other(&fi.path, header).await {
            Ok(res) => {
                let task_list = &res.video_preview_play_info.live_transcoding_task_list;
                if task_list.is_empty() {
                    return self.retry_raw_if_allowed(fi).await;
                }
                let Some(task) = task_list.iter().find(|t| t.template_id == fi.format) else {
                    warn!(format = %fi.format, "no matching transcode template");
                    return self.retry_raw_if_allowed(fi).await;
                };
                if task.url.is_empty() {
                    return self.retry_raw_if_allowed(fi).await;
                }
                Ok(Resource {
                    url: task.url.clone(),
                    subtitles: res.video_preview_play_info.live_transcoding_subtitle_task_list.clone(),
                    width: task.template_width,
                    height: task.template_height,
                })
            }
            Err(_) => self.retry_raw_if_allowed(fi).await,
        }
    }

    async fn retry_raw_if_allowed(&self, mut fi: FetchInfo) -> AppResult<Resource> {
        if !fi.try_raw_if_transcode_fail {
            return Err(AppError::drive_resource_missing(format!(
                "请求转码资源失败: path={}, format={}",
                fi.path, fi.format
            )));
        }
        fi.use_transcode = false;
        Box::pin(self.fetch_resource(fi)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_header_whitelists_user_agent_only() {
        let mut header = HeaderMap::new();
        header.insert("user-agent", HeaderValue::from_static("VLC"));
        header.insert("cookie", HeaderValue::from_static("secret"));
        let cleaned = DriveClient::clean_header(&header);
        assert_eq!(cleaned.get("user-agent").unwrap(), "VLC");
        assert!(cleaned.get("cookie").is_none());
    }
}
