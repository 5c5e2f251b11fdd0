//! MediaSourceId codec (§3 "MediaSourceId (MSID)"), grounded on the
//! original project's `service/emby/msid.go`.

use crate::errors::{AppError, AppResult};
use crate::util::url::{decode_path, encode_path};

/// Literal multi-character delimiter separating MSID segments.
pub const SEP: &str = "[[_]]";

/// An MSID's decoded fields. `source_name_prefix` is only meaningful when
/// both `template_id` and `format` are present.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MsInfo {
    pub empty: bool,
    pub transcode: bool,
    pub origin_id: String,
    pub raw_id: String,
    pub template_id: Option<String>,
    pub format: Option<String>,
    pub drive_path: Option<String>,
}

impl MsInfo {
    pub fn source_name_prefix(&self) -> Option<String> {
        match (&self.template_id, &self.format) {
            (Some(t), Some(f)) => Some(format!("{t}_{f}")),
            _ => None,
        }
    }
}

/// Encodes a transcode-variant MSID: `origin[[_]]template[[_]]format[[_]]base64(drivePath)`,
/// or `origin[[_]]template` when no drive path is carried.
pub fn encode(origin_id: &str, template_id: &str, format: Option<&str>, drive_path: Option<&str>) -> String {
    match (format, drive_path) {
        (Some(format), Some(path)) => format!("{origin_id}{SEP}{template_id}{SEP}{format}{SEP}{}", encode_path(path)),
        _ => format!("{origin_id}{SEP}{template_id}"),
    }
}

/// Decodes an MSID. An id with no delimiter and length ≤ 32 is the original
/// form (unchanged upstream id). Any other segment count than 1, 2, or 4 is
/// a decode error.
pub fn decode(msid: &str) -> AppResult<MsInfo> {
    if msid.is_empty() {
        return Ok(MsInfo {
            empty: true,
            ..Default::default()
        });
    }

    if !msid.contains(SEP) {
        return Ok(MsInfo {
            origin_id: msid.to_string(),
            raw_id: msid.to_string(),
            ..Default::default()
        });
    }

    let parts: Vec<&str> = msid.split(SEP).collect();
    match parts.len() {
        2 => Ok(MsInfo {
            transcode: true,
            origin_id: parts[0].to_string(),
            raw_id: msid.to_string(),
            template_id: Some(parts[1].to_string()),
            ..Default::default()
        }),
        4 => Ok(MsInfo {
            transcode: true,
            origin_id: parts[0].to_string(),
            raw_id: msid.to_string(),
            template_id: Some(parts[1].to_string()),
            format: Some(parts[2].to_string()),
            drive_path: Some(decode_path(parts[3])),
            ..Default::default()
        }),
        n => Err(AppError::decode(format!("invalid MediaSourceId segment count: {n}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn original_form_round_trips_unchanged() {
        let decoded = decode("ABCDEF123456").unwrap();
        assert_eq!(decoded.origin_id, "ABCDEF123456");
        assert!(!decoded.transcode);
    }

    #[test]
    fn encode_decode_round_trips_with_drive_path() {
        let encoded = encode("ORIG", "FHD", Some("1920x1080"), Some("/root/a"));
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.origin_id, "ORIG");
        assert_eq!(decoded.template_id.as_deref(), Some("FHD"));
        assert_eq!(decoded.format.as_deref(), Some("1920x1080"));
        assert_eq!(decoded.drive_path.as_deref(), Some("/root/a"));
    }

    #[test]
    fn decode_sample_from_scenario_2() {
        let decoded = decode("ORIG[[_]]FHD[[_]]1920x1080[[_]]L3Jvb3QvYQ==").unwrap();
        assert_eq!(decoded.origin_id, "ORIG");
        assert_eq!(decoded.template_id.as_deref(), Some("FHD"));
        assert_eq!(decoded.format.as_deref(), Some("1920x1080"));
        assert_eq!(decoded.drive_path.as_deref(), Some("/root/a"));
    }

    #[test]
    fn two_segment_variant_has_no_format_or_path() {
        let decoded = decode("ORIG[[_]]FHD").unwrap();
        assert_eq!(decoded.template_id.as_deref(), Some("FHD"));
        assert!(decoded.format.is_none());
        assert!(decoded.drive_path.is_none());
    }

    #[test]
    fn unsupported_segment_counts_are_decode_errors() {
        assert!(decode("A[[_]]B[[_]]C").is_err());
    }

    #[test]
    fn empty_id_decodes_to_empty_ms_info() {
        assert!(decode("").unwrap().empty);
    }

    #[test]
    fn source_name_prefix_requires_both_template_and_format() {
        let variant = decode("ORIG[[_]]FHD[[_]]1920x1080[[_]]L3Jvb3QvYQ==").unwrap();
        assert_eq!(variant.source_name_prefix().as_deref(), Some("FHD_1920x1080"));
        let partial = decode("ORIG[[_]]FHD").unwrap();
        assert!(partial.source_name_prefix().is_none());
    }
}
