//! Emby-facing services: upstream client, MSID codec, playback-info
//! rewriter, and the handlers built on top of them (§4.C, §4.H-§4.M).

pub mod auth;
pub mod client;
pub mod download;
pub mod episode;
pub mod item;
pub mod items;
pub mod msid;
pub mod playbackinfo;
pub mod playing;
pub mod redirect;
pub mod socket;
pub mod subtitles;

use crate::cache::CacheStore;
use crate::config::Config;
use crate::drive::DriveClient;
use crate::emby::auth::TrustedKeys;
use crate::emby::client::EmbyClient;
use crate::emby::playing::PlayingTracker;
use crate::http_client::BoundedClient;
use crate::path::PrefixMap;
use crate::playlist::PlaylistManager;

/// The shared service bundle handlers are built against; one instance per
/// process, cloned cheaply into `axum::Router` state.
#[derive(Clone)]
pub struct EmbyServices {
    pub config: std::sync::Arc<Config>,
    pub emby: EmbyClient,
    pub drive: DriveClient,
    pub cache: CacheStore,
    pub playlists: PlaylistManager,
    pub trusted_keys: TrustedKeys,
    pub playing: PlayingTracker,
    pub prefix_map: PrefixMap,
}

impl EmbyServices {
    pub fn new(config: Config) -> crate::errors::AppResult<Self> {
        let client = BoundedClient::new()?;
        let emby = EmbyClient::new(client.clone(), config.emby.clone());
        let drive = DriveClient::new(client, config.drive.clone());
        let prefix_map = PrefixMap::from_config(&config.path);
        let playlists = PlaylistManager::new(drive.clone());
        let cache = CacheStore::new(config.cache.enable);

        Ok(Self {
            config: std::sync::Arc::new(config),
            emby,
            drive,
            cache,
            playlists,
            trusted_keys: TrustedKeys::new(),
            playing: PlayingTracker::new(),
            prefix_map,
        })
    }
}
