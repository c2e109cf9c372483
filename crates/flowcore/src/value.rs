/// Dynamic value type for node inputs/outputs
///
/// Flow documents, batch rows and tool results are all plain JSON, so the
/// engine works on `serde_json::Value` directly.
pub type Value = serde_json::Value;

/// A single row of flow inputs.
pub type InputRow = std::collections::HashMap<String, Value>;

/// Helpers shared by the executor and the evaluation builder.
pub trait ValueExt {
    /// Look up a dotted property path (`a.b.0.c`) inside an object/array.
    fn property(&self, path: &str) -> Option<&Value>;

    /// True for `null`, or for an object/array whose every member is `null`.
    fn is_all_null(&self) -> bool;

    /// Short type name used in error messages.
    fn type_name(&self) -> &'static str;
}

impl ValueExt for Value {
    fn property(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return Some(self);
        }
        path.split('.').try_fold(self, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    fn is_all_null(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Object(map) => map.values().all(Value::is_null),
            _ => false,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(n) if n.is_i64() || n.is_u64() => "int",
            Value::Number(_) => "double",
            Value::String(_) => "string",
            Value::Array(_) => "list",
            Value::Object(_) => "object",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn property_walks_objects_and_arrays() {
        let v = json!({"a": {"b": [10, {"c": "x"}]}});
        assert_eq!(v.property("a.b.0"), Some(&json!(10)));
        assert_eq!(v.property("a.b.1.c"), Some(&json!("x")));
        assert_eq!(v.property(""), Some(&v));
        assert_eq!(v.property("a.missing"), None);
    }

    #[test]
    fn all_null_detection() {
        assert!(json!(null).is_all_null());
        assert!(json!({"a": null, "b": null}).is_all_null());
        assert!(!json!({"a": null, "b": 1}).is_all_null());
        assert!(!json!("text").is_all_null());
    }
}
