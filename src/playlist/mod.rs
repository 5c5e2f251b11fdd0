//! HLS playlist working set (§4.G), grounded on the original project's
//! `service/m3u8/m3u8.go` maintainer loop.

pub mod info;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::HeaderMap;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, instrument};

use crate::drive::{DriveClient, FetchInfo};
use crate::errors::{AppError, AppResult};
use crate::playlist::info::{parse_playlist, remote_base_of, render_proxy_playlist, ParsedPlaylist};

pub const MAX_PLAYLISTS: usize = 10;
const STALE_AFTER: Duration = Duration::from_secs(10 * 60);
const EXPIRE_AFTER: Duration = Duration::from_secs(30 * 60);
const MAINTENANCE_TICK: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistState {
    /// Just refreshed; served as-is.
    Fresh,
    /// Past `STALE_AFTER` since the last refresh; served, but a refresh is
    /// attempted on next access.
    Stale,
    /// Not accessed in a while; still resident but a candidate for LRU
    /// eviction under capacity pressure.
    Idle,
    /// Past `EXPIRE_AFTER`; evicted on the next maintenance tick.
    Expired,
}

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct PlaylistKey {
    pub drive_path: String,
    pub template_id: String,
}

struct PlaylistEntry {
    key: PlaylistKey,
    parsed: ParsedPlaylist,
    remote_base: String,
    subtitles: Vec<(String, String)>,
    last_refresh: Instant,
    last_access: Instant,
}

impl PlaylistEntry {
    fn state(&self) -> PlaylistState {
        let since_refresh = self.last_refresh.elapsed();
        let since_access = self.last_access.elapsed();
        if since_refresh >= EXPIRE_AFTER {
            PlaylistState::Expired
        } else if since_refresh >= STALE_AFTER {
            PlaylistState::Stale
        } else if since_access >= STALE_AFTER {
            PlaylistState::Idle
        } else {
            PlaylistState::Fresh
        }
    }
}

/// The playlist working set: at most [`MAX_PLAYLISTS`] entries, each
/// refreshed under its own lock so unrelated entries never block each
/// other. Callers only ever see rendered text or resolved links, never a
/// raw entry.
#[derive(Clone)]
pub struct PlaylistManager {
    entries: Arc<RwLock<HashMap<PlaylistKey, Arc<Mutex<PlaylistEntry>>>>>,
    drive: DriveClient,
}

impl PlaylistManager {
    pub fn new(drive: DriveClient) -> Self {
        let manager = Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            drive,
        };
        manager.clone().spawn_maintainer();
        manager
    }

    fn spawn_maintainer(self) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_TICK);
            loop {
                ticker.tick().await;
                self.evict_expired().await;
            }
        });
    }

    async fn evict_expired(&self) {
        let mut entries = self.entries.write().await;
        let mut expired = Vec::new();
        for (key, entry) in entries.iter() {
            if entry.lock().await.state() == PlaylistState::Expired {
                expired.push(key.clone());
            }
        }
        for key in &expired {
            entries.remove(key);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "evicted expired playlist entries");
        }
    }

    async fn entry_for(&self, key: &PlaylistKey, header: &HeaderMap) -> AppResult<Arc<Mutex<PlaylistEntry>>> {
        if let Some(existing) = self.entries.read().await.get(key).cloned() {
            return Ok(existing);
        }

        let entry = self.fetch_and_parse(key, header).await?;
        let slot = Arc::new(Mutex::new(entry));

        let mut entries = self.entries.write().await;
        if !entries.contains_key(key) && entries.len() >= MAX_PLAYLISTS {
            if let Some(lru_key) = self.least_recently_accessed(&entries).await {
                entries.remove(&lru_key);
            }
        }
        let inserted = entries.entry(key.clone()).or_insert_with(|| slot.clone());
        Ok(inserted.clone())
    }

    async fn least_recently_accessed(&self, entries: &HashMap<PlaylistKey, Arc<Mutex<PlaylistEntry>>>) -> Option<PlaylistKey> {
        let mut oldest: Option<(PlaylistKey, Instant)> = None;
        for (key, entry) in entries.iter() {
            let last_access = entry.lock().await.last_access;
            if oldest.as_ref().map(|(_, t)| last_access < *t).unwrap_or(true) {
                oldest = Some((key.clone(), last_access));
            }
        }
        oldest.map(|(key, _)| key)
    }

    async fn fetch_and_parse(&self, key: &PlaylistKey, header: &HeaderMap) -> AppResult<PlaylistEntry> {
        let resource = self
            .drive
            .fetch_resource(FetchInfo {
                path: key.drive_path.clone(),
                use_transcode: true,
                format: key.template_id.clone(),
                try_raw_if_transcode_fail: false,
                forwarded_headers: header.clone(),
            })
            .await?;

        let remote_base = remote_base_of(&resource.url);
        let body = self
            .drive
            .raw_client()
            .inner()
            .get(&resource.url)
            .send()
            .await?
            .text()
            .await?;
        let parsed = parse_playlist(&body, &remote_base);
        let subtitles = resource
            .subtitles
            .iter()
            .map(|s| (info::basename_without_query(&s.url), s.url.clone()))
            .collect();

        Ok(PlaylistEntry {
            key: key.clone(),
            parsed,
            remote_base,
            subtitles,
            last_refresh: Instant::now(),
            last_access: Instant::now(),
        })
    }

    /// Returns the rewritten playlist body, refreshing first if the entry is
    /// missing or `Stale`/`Expired`.
    #[instrument(skip(self, header))]
    pub async fn get_playlist(&self, drive_path: &str, template_id: &str, local_base: &str, header: HeaderMap) -> AppResult<String> {
        let key = PlaylistKey {
            drive_path: drive_path.to_string(),
            template_id: template_id.to_string(),
        };
        let slot = self.entry_for(&key, &header).await?;
        let mut entry = slot.lock().await;
        if matches!(entry.state(), PlaylistState::Stale | PlaylistState::Expired) {
            *entry = self.fetch_and_parse(&key, &header).await?;
        }
        entry.last_access = Instant::now();
        Ok(render_proxy_playlist(&entry.parsed, local_base))
    }

    /// Resolves a segment basename to its absolute upstream URL.
    pub async fn get_ts_link(&self, drive_path: &str, template_id: &str, ts_name: &str) -> AppResult<String> {
        let key = PlaylistKey {
            drive_path: drive_path.to_string(),
            template_id: template_id.to_string(),
        };
        let slot = self
            .entries
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| AppError::playlist_miss(format!("{drive_path}#{template_id}")))?;
        let mut entry = slot.lock().await;
        entry.last_access = Instant::now();
        entry
            .parsed
            .segments
            .iter()
            .find(|s| s.basename() == ts_name)
            .map(|s| s.absolute_url.clone())
            .ok_or_else(|| AppError::playlist_miss(format!("ts {ts_name} not found")))
    }

    /// Resolves a subtitle filename to its absolute upstream URL.
    pub async fn get_subtitle_link(&self, drive_path: &str, template_id: &str, sub_name: &str) -> AppResult<String> {
        let key = PlaylistKey {
            drive_path: drive_path.to_string(),
            template_id: template_id.to_string(),
        };
        let slot = self
            .entries
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| AppError::playlist_miss(format!("{drive_path}#{template_id}")))?;
        let entry = slot.lock().await;
        entry
            .subtitles
            .iter()
            .find(|(basename, _)| basename == sub_name)
            .map(|(_, url)| url.clone())
            .ok_or_else(|| AppError::playlist_miss(format!("subtitle {sub_name} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_follow_elapsed_time_thresholds() {
        let fresh = PlaylistEntry {
            key: PlaylistKey { drive_path: "/a".into(), template_id: "HD".into() },
            parsed: ParsedPlaylist::default(),
            remote_base: String::new(),
            subtitles: Vec::new(),
            last_refresh: Instant::now(),
            last_access: Instant::now(),
        };
        assert_eq!(fresh.state(), PlaylistState::Fresh);
    }
}
