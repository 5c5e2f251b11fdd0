//! Path resolver (§4.D): Emby mount path → drive absolute path, with
//! fallback enumeration across drive roots. Grounded on the original
//! project's `service/path/path.go`.

use reqwest::header::HeaderMap;
use tracing::instrument;
use urlencoding::decode as url_decode;

use crate::config::PathConfig;
use crate::drive::DriveClient;
use crate::errors::AppResult;

/// A compiled `"/from:/to"` prefix mapping (§6 config schema).
#[derive(Debug, Clone)]
pub struct PrefixMap {
    pairs: Vec<(String, String)>,
}

impl PrefixMap {
    pub fn from_config(config: &PathConfig) -> Self {
        let pairs = config
            .emby2drive
            .iter()
            .filter_map(|entry| entry.split_once(':'))
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect();
        Self { pairs }
    }

    /// First-match longest-prefix in declared order.
    fn map(&self, emby_path: &str) -> Option<String> {
        self.pairs
            .iter()
            .find(|(from, _)| emby_path.starts_with(from.as_str()))
            .map(|(from, to)| emby_path.replacen(from, to, 1))
    }
}

/// The outcome of resolving a path: either a usable primary path, plus a
/// lazily-computed list of fallback candidates drawn from enumerating drive
/// roots (§4.D, open question (c): no deduplication across overlapping
/// roots; callers try candidates in order and stop at the first success).
pub struct PathResolution {
    pub success: bool,
    pub path: String,
    suffix_from_second_slash: String,
}

impl PathResolution {
    /// Enumerates `"/"+rootName+suffix"` candidates from the drive's root
    /// listing.
    pub async fn range(&self, drive: &DriveClient, header: HeaderMap) -> AppResult<Vec<String>> {
        let roots = drive.fetch_fs_list("/", header).await?;
        Ok(roots
            .content
            .into_iter()
            .filter(|e| e.is_dir)
            .map(|e| format!("/{}{}", e.name, self.suffix_from_second_slash))
            .collect())
    }
}

/// Finds the position just after the second `/` in `path`, returning the
/// remaining suffix (including its leading `/`), or the whole path if there
/// is no second `/`.
fn split_from_second_slash(path: &str) -> String {
    let mut seen = 0;
    for (i, c) in path.char_indices() {
        if c == '/' {
            seen += 1;
            if seen == 2 {
                return path[i..].to_string();
            }
        }
    }
    path.to_string()
}

/// Translates an Emby-reported file path into a drive path (§4.D pipeline):
/// normalize slashes, strip the mount prefix, URL-decode, then apply the
/// configured prefix map.
#[instrument(skip(prefix_map))]
pub fn emby_to_drive(emby_path: &str, mount_path: &str, prefix_map: &PrefixMap) -> PathResolution {
    let normalized = emby_path.replace('\\', "/");
    let stripped = normalized
        .strip_prefix(mount_path)
        .unwrap_or(&normalized)
        .to_string();
    let decoded = url_decode(&stripped)
        .map(|c| c.into_owned())
        .unwrap_or(stripped);

    match prefix_map.map(&decoded) {
        Some(mapped) => PathResolution {
            success: true,
            suffix_from_second_slash: split_from_second_slash(&mapped),
            path: mapped,
        },
        None => PathResolution {
            success: false,
            suffix_from_second_slash: split_from_second_slash(&decoded),
            path: decoded,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> PrefixMap {
        PrefixMap {
            pairs: pairs.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect(),
        }
    }

    #[test]
    fn maps_first_matching_prefix() {
        let m = map(&[("/mnt/emby", "/Drive1")]);
        let res = emby_to_drive("/mnt/emby/Movies/A.mkv", "", &m);
        assert!(res.success);
        assert_eq!(res.path, "/Drive1/Movies/A.mkv");
    }

    #[test]
    fn strips_mount_path_and_decodes() {
        let m = map(&[]);
        let res = emby_to_drive("/data/Movies/A%20B.mkv", "/data", &m);
        assert!(!res.success);
        assert_eq!(res.path, "/Movies/A B.mkv");
    }

    #[test]
    fn split_from_second_slash_finds_suffix() {
        assert_eq!(split_from_second_slash("/Drive1/Movies/A.mkv"), "/Movies/A.mkv");
        assert_eq!(split_from_second_slash("/onlyoneslash"), "/onlyoneslash");
    }

    #[test]
    fn translation_is_idempotent_once_mapped() {
        let m = map(&[("/mnt/emby", "/Drive1")]);
        let once = emby_to_drive("/mnt/emby/Movies/A.mkv", "", &m);
        let twice = emby_to_drive(&once.path, "", &m);
        // Second application does not match the (now-absent) emby prefix,
        // so the path passes through unchanged -- equal to applying once.
        assert_eq!(once.path, twice.path);
    }
}
