//! Auxiliary progress sender (§4.M), grounded on the original project's
//! `service/emby/playing.go`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use crate::emby::client::EmbyClient;
use crate::util::random_hex;

/// `5 * 60 * 10^7` ticks (5 minutes, Emby's 100ns tick unit).
pub const STOPPED_THRESHOLD_TICKS: i64 = 5 * 60 * 10_000_000;
/// `10^7` ticks (1 second); `Progress` calls at or below this are treated
/// as scrub-preview heartbeats and intercepted.
pub const PROGRESS_NOISE_THRESHOLD_TICKS: i64 = 10_000_000;

const DEDUP_DELAY: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct ProgressBody<'a> {
    #[serde(rename = "ItemId")]
    item_id: &'a str,
    #[serde(rename = "PlaySessionId")]
    play_session_id: String,
    #[serde(rename = "PositionTicks")]
    position_ticks: i64,
}

/// Returns `true` when an inbound `Progress` call is noise that should be
/// intercepted with 204 rather than proxied.
pub fn is_progress_noise(position_ticks: i64) -> bool {
    position_ticks <= PROGRESS_NOISE_THRESHOLD_TICKS
}

/// Tracks the most recent `Stopped` token per item so a superseded delayed
/// send can detect it was overtaken and exit without firing.
#[derive(Clone, Default)]
pub struct PlayingTracker {
    generations: Arc<Mutex<HashMap<String, u64>>>,
}

impl PlayingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a deduplicated secondary `Progress` (and, if configured, a
    /// mirrored `Stopped`) for `item_id`, when `position_ticks` clears the
    /// 5-minute threshold. Non-blocking: spawns its own task.
    #[instrument(skip(self, client))]
    pub async fn on_stopped(&self, client: EmbyClient, item_id: String, position_ticks: i64, send_stopped_mirror: bool) {
        if position_ticks < STOPPED_THRESHOLD_TICKS {
            return;
        }

        let generation = {
            let mut generations = self.generations.lock().await;
            let next = generations.get(&item_id).copied().unwrap_or(0) + 1;
            generations.insert(item_id.clone(), next);
            next
        };

        let tracker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DEDUP_DELAY).await;

            let still_current = {
                let generations = tracker.generations.lock().await;
                generations.get(&item_id).copied() == Some(generation)
            };
            if !still_current {
                return;
            }

            let body = ProgressBody {
                item_id: &item_id,
                play_session_id: random_hex(32),
                position_ticks,
            };
            if let Ok(encoded) = serde_json::to_vec(&body) {
                if let Err(err) = client
                    .fetch(
                        "/emby/Sessions/Playing/Progress",
                        reqwest::Method::POST,
                        Default::default(),
                        Some(bytes::Bytes::from(encoded.clone())),
                    )
                    .await
                {
                    warn!(item_id = %item_id, error = %err, "auxiliary progress send failed");
                }
                if send_stopped_mirror {
                    if let Err(err) = client
                        .fetch(
                            "/emby/Sessions/Playing/Stopped",
                            reqwest::Method::POST,
                            Default::default(),
                            Some(bytes::Bytes::from(encoded)),
                        )
                        .await
                    {
                        warn!(item_id = %item_id, error = %err, "auxiliary stopped-mirror send failed");
                    }
                }
            }

            tracker.generations.lock().await.remove(&item_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_noise_threshold_matches_one_second_of_ticks() {
        assert!(is_progress_noise(10_000_000));
        assert!(is_progress_noise(0));
        assert!(!is_progress_noise(10_000_001));
    }

    #[test]
    fn stopped_threshold_is_five_minutes_of_ticks() {
        assert_eq!(STOPPED_THRESHOLD_TICKS, 3_000_000_000);
    }

    #[tokio::test]
    async fn below_threshold_stopped_does_not_record_a_generation() {
        let tracker = PlayingTracker::new();
        let client = EmbyClient::new(
            crate::http_client::BoundedClient::new().unwrap(),
            crate::config::EmbyConfig {
                host: "http://emby.local".to_string(),
                mount_path: String::new(),
                api_key: "K".to_string(),
                episodes_unplay_prior: false,
                resort_random_items: false,
                proxy_error_strategy: crate::config::ProxyErrorStrategy::Origin,
                images_quality: 90,
                download_strategy: crate::config::DownloadStrategy::Direct,
                local_media_root: None,
                strm: crate::config::StrmConfig::default(),
                send_stopped_mirror: false,
                device_profile: serde_json::Value::Null,
            },
        );
        tracker.on_stopped(client, "item1".to_string(), 1000, false).await;
        assert!(tracker.generations.lock().await.get("item1").is_none());
    }
}
