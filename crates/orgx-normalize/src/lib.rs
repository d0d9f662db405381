//! Tolerant extraction of typed fields from loosely-typed cloud-plane
//! records. Every function here is pure: no I/O, no panics, defaults
//! on any unparseable or absent input.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Looks up `key` at the top level of `record`, then inside a nested
/// `metadata` object if the top-level lookup misses. Nested metadata may
/// "shadow or supplement" top-level fields, so metadata is checked second,
/// not first: an explicit top-level value always wins.
fn lookup<'v>(record: &'v Value, key: &str) -> Option<&'v Value> {
    let obj = record.as_object()?;
    if let Some(v) = obj.get(key) {
        if !v.is_null() {
            return Some(v);
        }
    }
    obj.get("metadata")
        .and_then(|m| m.as_object())
        .and_then(|m| m.get(key))
        .filter(|v| !v.is_null())
}

fn lookup_any<'v>(record: &'v Value, keys: &[&str]) -> Option<&'v Value> {
    keys.iter().find_map(|k| lookup(record, k))
}

/// Returns the first non-empty trimmed string found under any of `keys`,
/// checked in order. Callers should pass both snake_case and camelCase
/// aliases.
pub fn pick_string(record: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(v) = lookup(record, key) {
            let s = match v {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => continue,
            };
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Returns the first finite number found under any of `keys`. A string
/// containing a parseable number is accepted.
pub fn pick_number(record: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(v) = lookup(record, key) {
            let n = match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            if let Some(n) = n {
                if n.is_finite() {
                    return Some(n);
                }
            }
        }
    }
    None
}

/// Accepts an array of strings, or a comma-separated string, under any of
/// `keys`. Empties are trimmed and dropped; result is not deduped (callers
/// that need dedup, e.g. dependencies, do it themselves).
pub fn pick_string_array(record: &Value, keys: &[&str]) -> Vec<String> {
    for key in keys {
        if let Some(v) = lookup(record, key) {
            match v {
                Value::Array(items) => {
                    let out: Vec<String> = items
                        .iter()
                        .filter_map(|item| match item {
                            Value::String(s) => Some(s.trim().to_string()),
                            Value::Number(n) => Some(n.to_string()),
                            _ => None,
                        })
                        .filter(|s| !s.is_empty())
                        .collect();
                    if !out.is_empty() {
                        return out;
                    }
                }
                Value::String(s) => {
                    let out: Vec<String> = s
                        .split(',')
                        .map(|part| part.trim().to_string())
                        .filter(|part| !part.is_empty())
                        .collect();
                    if !out.is_empty() {
                        return out;
                    }
                }
                _ => {}
            }
        }
    }
    Vec::new()
}

/// Parses a string to an epoch and re-emits canonical ISO-8601
/// (`%Y-%m-%dT%H:%M:%S%.3fZ`). Returns `None` if unparseable.
pub fn to_iso_string(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc).to_rfc3339_opts(chrono::SecondsFormat::Millis, true));
    }
    if let Ok(ts) = s.parse::<i64>() {
        // Bare epoch seconds or milliseconds; treat >= 10^12 as millis.
        let dt = if ts.abs() >= 1_000_000_000_000 {
            DateTime::from_timestamp_millis(ts)
        } else {
            DateTime::from_timestamp(ts, 0)
        };
        return dt.map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true));
    }
    None
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPriority {
    pub priority_num: u32,
    pub priority_label: String,
}

fn bucket_label(priority_num: u32) -> &'static str {
    if priority_num <= 12 {
        "urgent"
    } else if priority_num <= 30 {
        "high"
    } else if priority_num <= 60 {
        "medium"
    } else {
        "low"
    }
}

const PRIORITY_NUM_KEYS: &[&str] = &["priority_num", "priorityNum"];
const PRIORITY_LABEL_KEYS: &[&str] = &["priority", "priority_label", "priorityLabel"];

/// Derives `{priorityNum, priorityLabel}` per the fixed rules: an explicit
/// numeric priority wins (clamped to `[1,100]`, bucketed to a label); else
/// an explicit label is mapped through a fixed table; else the default
/// `60 / "medium"`.
///
/// Idempotent: feeding the output back through a record containing only
/// `priority_num` reproduces the same pair (invariant I2).
pub fn normalize_priority(record: &Value) -> NormalizedPriority {
    if let Some(n) = pick_number(record, PRIORITY_NUM_KEYS) {
        let clamped = n.round().clamp(1.0, 100.0) as u32;
        return NormalizedPriority {
            priority_num: clamped,
            priority_label: bucket_label(clamped).to_string(),
        };
    }
    if let Some(label) = pick_string(record, PRIORITY_LABEL_KEYS) {
        let lowered = label.to_ascii_lowercase();
        let num = match lowered.as_str() {
            "urgent" | "critical" | "p0" => Some(10),
            "high" | "p1" => Some(25),
            "medium" | "p2" => Some(50),
            "low" | "p3" => Some(75),
            _ => None,
        };
        if let Some(num) = num {
            return NormalizedPriority {
                priority_num: num,
                priority_label: bucket_label(num).to_string(),
            };
        }
    }
    NormalizedPriority {
        priority_num: 60,
        priority_label: bucket_label(60).to_string(),
    }
}

const DEPENDENCY_ALIAS_KEYS: &[&str] = &[
    "dependency_ids",
    "dependencyIds",
    "depends_on",
    "dependsOn",
    "blocked_by",
    "blockedBy",
];

/// Union of top-level and nested-metadata dependency arrays across all
/// alias keys, deduped while preserving first-seen order. Self-references
/// and membership in `valid_ids` (when given) are the caller's
/// responsibility (the graph builder knows the node's own id and the set
/// of ids present in the graph; this function does not).
pub fn normalize_dependencies(record: &Value) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for key in DEPENDENCY_ALIAS_KEYS {
        for id in pick_string_array(record, &[key]) {
            if seen.insert(id.clone()) {
                out.push(id);
            }
        }
    }
    out
}

static DURATION_HOURS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(h|hr|hrs|hour|hours)\b").expect("valid regex")
});

/// Extracts an explicit duration-in-hours mention from free text (used as
/// the third fallback tier for `expectedDurationHours`, behind an explicit
/// field and metadata).
pub fn extract_duration_hours_from_text(text: &str) -> Option<f64> {
    DURATION_HOURS_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pick_string_prefers_top_level_over_metadata() {
        let record = json!({"title": "From top", "metadata": {"title": "From metadata"}});
        assert_eq!(pick_string(&record, &["title"]).as_deref(), Some("From top"));
    }

    #[test]
    fn pick_string_falls_back_to_metadata() {
        let record = json!({"metadata": {"title": "From metadata"}});
        assert_eq!(
            pick_string(&record, &["title"]).as_deref(),
            Some("From metadata")
        );
    }

    #[test]
    fn pick_string_tries_aliases_in_order() {
        let record = json!({"camelTitle": "camel"});
        assert_eq!(
            pick_string(&record, &["snake_title", "camelTitle"]).as_deref(),
            Some("camel")
        );
    }

    #[test]
    fn pick_number_accepts_numeric_strings() {
        let record = json!({"priority_num": "42"});
        assert_eq!(pick_number(&record, &["priority_num"]), Some(42.0));
    }

    #[test]
    fn pick_string_array_accepts_comma_separated_string() {
        let record = json!({"tags": "a, b ,,c"});
        assert_eq!(
            pick_string_array(&record, &["tags"]),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn to_iso_string_round_trips_rfc3339() {
        let iso = to_iso_string("2025-01-01T00:00:00Z").unwrap();
        assert_eq!(iso, "2025-01-01T00:00:00.000Z");
    }

    #[test]
    fn to_iso_string_returns_none_on_garbage() {
        assert_eq!(to_iso_string("not a date"), None);
    }

    #[test]
    fn normalize_priority_is_idempotent() {
        let first = normalize_priority(&json!({"priority_num": 27}));
        let fed_back = json!({"priority_num": first.priority_num});
        let second = normalize_priority(&fed_back);
        assert_eq!(first, second);
    }

    #[test]
    fn normalize_priority_clamps_numeric_range() {
        let high = normalize_priority(&json!({"priority_num": 500}));
        assert_eq!(high.priority_num, 100);
        assert_eq!(high.priority_label, "low");
    }

    #[test]
    fn normalize_priority_maps_label_table() {
        let urgent = normalize_priority(&json!({"priority": "urgent"}));
        assert_eq!(urgent.priority_num, 10);
        assert_eq!(urgent.priority_label, "urgent");
    }

    #[test]
    fn normalize_priority_default_is_medium_sixty() {
        let default = normalize_priority(&json!({}));
        assert_eq!(default.priority_num, 60);
        assert_eq!(default.priority_label, "medium");
    }

    #[test]
    fn normalize_dependencies_unions_aliases_and_dedupes() {
        let record = json!({
            "dependency_ids": ["a", "b"],
            "dependsOn": ["b", "c"],
        });
        assert_eq!(
            normalize_dependencies(&record),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn extract_duration_hours_parses_free_text() {
        assert_eq!(
            extract_duration_hours_from_text("roughly 3.5 hours of work"),
            Some(3.5)
        );
        assert_eq!(extract_duration_hours_from_text("no mention here"), None);
    }
}
