//! Recursive secret redaction for nested JSON structures.

use serde_json::Value;

/// Keys whose values are masked, matched case-insensitively.
const REDACT_KEYS: [&str; 5] = ["password", "token", "api_key", "secret", "authorization"];

/// Replacement written in place of a sensitive value.
pub const REDACTED_MASK: &str = "***REDACTED***";

fn is_sensitive(key: &str) -> bool {
    REDACT_KEYS.iter().any(|k| key.eq_ignore_ascii_case(k))
}

/// Returns a structurally identical copy of `value` with every value under a
/// sensitive key replaced by [`REDACTED_MASK`]. Objects and arrays are
/// recursed at arbitrary depth; scalars pass through untouched. The input is
/// never mutated.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if is_sensitive(k) {
                    out.insert(k.clone(), Value::String(REDACTED_MASK.to_string()));
                } else {
                    out.insert(k.clone(), redact(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_masks_sensitive_keys_case_insensitive() {
        let input = json!({
            "user": "alice",
            "PASSWORD": "hunter2",
            "Api_Key": "sk-123",
            "authorization": "Bearer abc"
        });
        let out = redact(&input);
        assert_eq!(out["user"], "alice");
        assert_eq!(out["PASSWORD"], REDACTED_MASK);
        assert_eq!(out["Api_Key"], REDACTED_MASK);
        assert_eq!(out["authorization"], REDACTED_MASK);
    }

    #[test]
    fn test_recurses_through_deep_nesting_and_arrays() {
        let input = json!({
            "level1": {
                "level2": [
                    { "level3": { "secret": "deep", "note": "keep" } },
                    { "token": "t" }
                ]
            }
        });
        let out = redact(&input);
        assert_eq!(out["level1"]["level2"][0]["level3"]["secret"], REDACTED_MASK);
        assert_eq!(out["level1"]["level2"][0]["level3"]["note"], "keep");
        assert_eq!(out["level1"]["level2"][1]["token"], REDACTED_MASK);
    }

    #[test]
    fn test_scalars_and_non_sensitive_values_unchanged() {
        let input = json!({ "count": 3, "ratio": 0.5, "ok": true, "none": null });
        assert_eq!(redact(&input), input);
        assert_eq!(redact(&json!("bare string")), json!("bare string"));
    }

    #[test]
    fn test_original_structure_untouched() {
        let input = json!({ "password": "x", "keep": { "secret": "y" } });
        let _ = redact(&input);
        assert_eq!(input["password"], "x");
        assert_eq!(input["keep"]["secret"], "y");
    }
}
