//! Layered configuration for emby-proxy.
//!
//! Loaded from a TOML file and overlaid with environment variables (prefix
//! `EMBY_PROXY_`, nested keys separated by `__`) via [`figment`], matching
//! the layering approach used throughout the project. See
//! `SPEC_FULL.md` §6 for the recognized schema and §9 for the validation
//! rules each section enforces.

mod defaults;

use std::path::PathBuf;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub emby: EmbyConfig,
    pub drive: DriveConfig,
    #[serde(default)]
    pub video_preview: VideoPreviewConfig,
    #[serde(default)]
    pub path: PathConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub ssl: SslConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbyConfig {
    pub host: String,
    #[serde(rename = "mount-path")]
    pub mount_path: String,
    #[serde(rename = "api-key")]
    pub api_key: String,
    #[serde(rename = "episodes-unplay-prior", default = "defaults::episodes_unplay_prior")]
    pub episodes_unplay_prior: bool,
    #[serde(rename = "resort-random-items", default = "defaults::resort_random_items")]
    pub resort_random_items: bool,
    #[serde(rename = "proxy-error-strategy", default = "defaults::proxy_error_strategy")]
    pub proxy_error_strategy: ProxyErrorStrategy,
    #[serde(rename = "images-quality", default = "defaults::images_quality")]
    pub images_quality: u8,
    #[serde(rename = "download-strategy", default = "defaults::download_strategy")]
    pub download_strategy: DownloadStrategy,
    #[serde(rename = "local-media-root", default)]
    pub local_media_root: Option<String>,
    #[serde(default)]
    pub strm: StrmConfig,
    #[serde(rename = "send-stopped-mirror", default = "defaults::send_stopped_mirror")]
    pub send_stopped_mirror: bool,
    #[serde(rename = "device-profile", default = "defaults::device_profile")]
    pub device_profile: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StrmConfig {
    #[serde(rename = "path-map", default)]
    pub path_map: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyErrorStrategy {
    Origin,
    Reject,
}

impl std::str::FromStr for ProxyErrorStrategy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "origin" => Ok(Self::Origin),
            "reject" => Ok(Self::Reject),
            other => Err(AppError::configuration(format!(
                "emby.proxy-error-strategy 配置错误: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStrategy {
    Origin,
    Direct,
    #[serde(rename = "403")]
    Forbidden,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriveConfig {
    pub token: String,
    pub host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoPreviewConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "defaults::video_preview_containers")]
    pub containers: Vec<String>,
    #[serde(rename = "ignore-template-ids", default)]
    pub ignore_template_ids: Vec<String>,
}

impl Default for VideoPreviewConfig {
    fn default() -> Self {
        Self {
            enable: false,
            containers: defaults::video_preview_containers(),
            ignore_template_ids: Vec::new(),
        }
    }
}

impl VideoPreviewConfig {
    pub fn container_enabled(&self, container: &str) -> bool {
        self.containers.iter().any(|c| c.eq_ignore_ascii_case(container))
    }

    pub fn template_allowed(&self, template_id: &str) -> bool {
        !self
            .ignore_template_ids
            .iter()
            .any(|t| t.eq_ignore_ascii_case(template_id))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathConfig {
    #[serde(rename = "emby2drive", default)]
    pub emby2drive: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "defaults::cache_enable")]
    pub enable: bool,
    #[serde(default = "defaults::cache_expired")]
    pub expired: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable: defaults::cache_enable(),
            expired: defaults::cache_expired(),
        }
    }
}

impl CacheConfig {
    /// Parses the `"<N><s|m|h|d>"` expiry string into a [`std::time::Duration`].
    pub fn expired_duration(&self) -> AppResult<std::time::Duration> {
        parse_duration_suffix(&self.expired)
            .ok_or_else(|| AppError::configuration(format!("cache.expired 配置错误: {}", self.expired)))
    }
}

fn parse_duration_suffix(s: &str) -> Option<std::time::Duration> {
    if s.is_empty() {
        return Some(std::time::Duration::from_secs(24 * 3600));
    }
    let (num, unit) = s.split_at(s.len() - 1);
    let base: u64 = num.parse().ok()?;
    if base < 1 {
        return None;
    }
    let secs = match unit {
        "s" => base,
        "m" => base * 60,
        "h" => base * 3600,
        "d" => base * 86400,
        _ => return None,
    };
    Some(std::time::Duration::from_secs(secs))
}

#[derive(Debug, Clone, Deserialize)]
pub struct SslConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(rename = "single-port", default = "defaults::single_port")]
    pub single_port: bool,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub crt: String,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            enable: false,
            single_port: defaults::single_port(),
            key: String::new(),
            crt: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(rename = "disable-color", default)]
    pub disable_color: bool,
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            disable_color: false,
            level: defaults::log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(rename = "http_port", default = "defaults::http_port")]
    pub http_port: u16,
    #[serde(rename = "https_port", default = "defaults::https_port")]
    pub https_port: u16,
    #[serde(rename = "proxy_protocol", default = "defaults::proxy_protocol")]
    pub proxy_protocol: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: defaults::http_port(),
            https_port: defaults::https_port(),
            proxy_protocol: defaults::proxy_protocol(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, overlaid with `EMBY_PROXY_`-prefixed
    /// environment variables, then validates it.
    pub fn load_from_file(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let config: Config = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("EMBY_PROXY_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.emby.host.trim().is_empty() {
            return Err(AppError::configuration("emby.host 配置不能为空"));
        }
        if self.emby.mount_path.trim().is_empty() {
            return Err(AppError::configuration("emby.mount-path 配置不能为空"));
        }
        if self.emby.api_key.trim().is_empty() {
            return Err(AppError::configuration("emby.api-key 配置不能为空"));
        }
        if self.drive.host.trim().is_empty() {
            return Err(AppError::configuration("drive.host 配置不能为空"));
        }
        if self.drive.token.trim().is_empty() {
            return Err(AppError::configuration("drive.token 配置不能为空"));
        }
        self.cache.expired_duration()?;
        for mapping in &self.path.emby2drive {
            if mapping.splitn(2, ':').count() != 2 {
                return Err(AppError::configuration(format!(
                    "path.emby2drive 配置错误, {mapping} 无法根据 ':' 进行分割"
                )));
            }
        }
        if self.ssl.enable {
            if self.ssl.crt.trim().is_empty() || self.ssl.key.trim().is_empty() {
                return Err(AppError::configuration("ssl.crt / ssl.key 配置不能为空"));
            }
            if !PathBuf::from(&self.ssl.crt).exists() || !PathBuf::from(&self.ssl.key).exists() {
                return Err(AppError::configuration("检测不到证书或密钥文件"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duration_suffixes() {
        assert_eq!(parse_duration_suffix("1d"), Some(std::time::Duration::from_secs(86400)));
        assert_eq!(parse_duration_suffix("30m"), Some(std::time::Duration::from_secs(1800)));
        assert_eq!(parse_duration_suffix("10s"), Some(std::time::Duration::from_secs(10)));
        assert_eq!(parse_duration_suffix(""), Some(std::time::Duration::from_secs(86400)));
        assert_eq!(parse_duration_suffix("0d"), None);
        assert_eq!(parse_duration_suffix("3x"), None);
    }

    #[test]
    fn proxy_error_strategy_parses() {
        assert_eq!("origin".parse::<ProxyErrorStrategy>().unwrap(), ProxyErrorStrategy::Origin);
        assert_eq!("reject".parse::<ProxyErrorStrategy>().unwrap(), ProxyErrorStrategy::Reject);
        assert!("bogus".parse::<ProxyErrorStrategy>().is_err());
    }
}
