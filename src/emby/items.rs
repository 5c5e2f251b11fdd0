//! Random-items re-shuffle and cache fingerprint (§4.K "Random items"),
//! grounded on the original project's `service/emby/item_random.go`.

use rand::seq::SliceRandom;
use serde_json::Value;

use crate::util::json::JsonExt;

/// The query fields concatenated (in this order) to form the `UserItems`
/// cache-space fingerprint (§6).
const FINGERPRINT_FIELDS: &[&str] = &[
    "IncludeItemTypes",
    "Recursive",
    "Fields",
    "EnableImageTypes",
    "ImageTypeLimit",
    "IsFavorite",
    "IsFolder",
    "ProjectToMedia",
    "ParentId",
];

pub const RANDOM_ITEMS_LIMIT_THRESHOLD: i64 = 300;
pub const WITH_LIMIT_UPSTREAM_LIMIT: i64 = 500;

/// Builds the `UserItems/{fingerprint}` cache-space key from request query
/// values; missing fields contribute an empty segment.
pub fn random_items_fingerprint(query: &[(String, String)]) -> String {
    FINGERPRINT_FIELDS
        .iter()
        .map(|field| {
            query
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(field))
                .map(|(_, v)| v.as_str())
                .unwrap_or_default()
        })
        .collect::<Vec<_>>()
        .join("|")
}

/// Fisher-Yates shuffles a clone of the cached `Items` array, leaving the
/// cached value untouched. Returns the same JSON document with `Items`
/// replaced by the shuffled clone.
pub fn shuffle_cached_items(cached: &Value) -> Value {
    let mut out = cached.clone();
    if let Some(items) = out.attr("Items").as_array() {
        let mut shuffled = items.clone();
        shuffled.shuffle(&mut rand::rng());
        out.put("Items", Value::Array(shuffled));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_concatenates_fields_in_declared_order() {
        let query = vec![
            ("ParentId".to_string(), "P1".to_string()),
            ("IncludeItemTypes".to_string(), "Movie".to_string()),
        ];
        let fp = random_items_fingerprint(&query);
        assert_eq!(fp, "Movie||||||||P1");
    }

    #[test]
    fn shuffle_preserves_item_count_and_total_record_count() {
        let cached = json!({
            "Items": [1, 2, 3, 4, 5],
            "TotalRecordCount": 5,
        });
        let shuffled = shuffle_cached_items(&cached);
        assert_eq!(shuffled["TotalRecordCount"], 5);
        let items = shuffled["Items"].as_array().unwrap();
        assert_eq!(items.len(), 5);
        let mut sorted: Vec<i64> = items.iter().map(|v| v.as_i64().unwrap()).collect();
        sorted.sort();
        assert_eq!(sorted, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn shuffle_does_not_mutate_the_cached_source_value() {
        let cached = json!({"Items": [1, 2, 3]});
        let _ = shuffle_cached_items(&cached);
        assert_eq!(cached["Items"].as_array().unwrap().len(), 3);
    }
}
