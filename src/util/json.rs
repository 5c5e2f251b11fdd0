//! JSON dynamic tree (§4.E), realized as an extension trait over
//! `serde_json::Value` rather than a bespoke tagged union, since the rest of
//! the proxy already standardizes on `serde_json` for wire payloads, cache
//! bodies, and config.

use std::ops::ControlFlow;

use serde_json::Value;

pub trait JsonExt {
    /// Null-safe object field access; missing keys or non-object values
    /// yield `&Value::Null`.
    fn attr(&self, key: &str) -> &Value;

    /// Null-safe array index access; out-of-range indices or non-array
    /// values yield `&Value::Null`.
    fn idx(&self, i: usize) -> &Value;

    fn as_str_opt(&self) -> Option<&str>;
    fn as_i64_opt(&self) -> Option<i64>;
    fn as_bool_opt(&self) -> Option<bool>;

    /// Sets `key` on an object in place; a no-op on any other variant.
    fn put(&mut self, key: impl Into<String>, value: Value);

    /// Appends to an array in place; a no-op on any other variant.
    fn append(&mut self, value: Value);

    /// Removes `key` from an object in place; a no-op on any other variant.
    fn del_key(&mut self, key: &str);

    /// Iterates an object's entries, stopping early when `f` returns
    /// `ControlFlow::Break`.
    fn range_obj(&self, f: impl FnMut(&str, &Value) -> ControlFlow<()>);

    /// Iterates an array's elements, stopping early when `f` returns
    /// `ControlFlow::Break`.
    fn range_arr(&self, f: impl FnMut(usize, &Value) -> ControlFlow<()>);
}

impl JsonExt for Value {
    fn attr(&self, key: &str) -> &Value {
        self.get(key).unwrap_or(&Value::Null)
    }

    fn idx(&self, i: usize) -> &Value {
        self.get(i).unwrap_or(&Value::Null)
    }

    fn as_str_opt(&self) -> Option<&str> {
        self.as_str()
    }

    fn as_i64_opt(&self) -> Option<i64> {
        self.as_i64()
    }

    fn as_bool_opt(&self) -> Option<bool> {
        self.as_bool()
    }

    fn put(&mut self, key: impl Into<String>, value: Value) {
        if let Value::Object(map) = self {
            map.insert(key.into(), value);
        }
    }

    fn append(&mut self, value: Value) {
        if let Value::Array(arr) = self {
            arr.push(value);
        }
    }

    fn del_key(&mut self, key: &str) {
        if let Value::Object(map) = self {
            map.remove(key);
        }
    }

    fn range_obj(&self, mut f: impl FnMut(&str, &Value) -> ControlFlow<()>) {
        if let Value::Object(map) = self {
            for (k, v) in map {
                if f(k, v).is_break() {
                    break;
                }
            }
        }
    }

    fn range_arr(&self, mut f: impl FnMut(usize, &Value) -> ControlFlow<()>) {
        if let Value::Array(arr) = self {
            for (i, v) in arr.iter().enumerate() {
                if f(i, v).is_break() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn attr_is_null_safe() {
        let v = json!({"a": {"b": 1}});
        assert_eq!(v.attr("a").attr("b"), &json!(1));
        assert_eq!(v.attr("missing").attr("deeper"), &Value::Null);
    }

    #[test]
    fn idx_is_null_safe() {
        let v = json!([1, 2, 3]);
        assert_eq!(v.idx(1), &json!(2));
        assert_eq!(v.idx(99), &Value::Null);
    }

    #[test]
    fn put_and_del_key_are_no_ops_on_wrong_variant() {
        let mut arr = json!([1, 2]);
        arr.put("k", json!(1));
        assert_eq!(arr, json!([1, 2]));

        let mut obj = json!({"a": 1});
        obj.put("b", json!(2));
        assert_eq!(obj, json!({"a": 1, "b": 2}));
        obj.del_key("a");
        assert_eq!(obj, json!({"b": 2}));
    }

    #[test]
    fn range_arr_supports_early_exit() {
        let v = json!([1, 2, 3, 4]);
        let mut seen = Vec::new();
        v.range_arr(|i, val| {
            seen.push((i, val.as_i64().unwrap()));
            if i == 1 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(seen, vec![(0, 1), (1, 2)]);
    }
}
