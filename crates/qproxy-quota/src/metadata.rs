//! Quota snapshot mirrored into auth metadata for legacy readers.
//!
//! Shape under [`METADATA_KEY`]:
//! `{provider, updated_at, models: {key -> {percent, reset_time?}}}` with
//! RFC 3339 UTC timestamps and normalized model keys.

use std::collections::HashMap;

use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use qproxy_common::{parse_rfc3339, read_f64, value_string};

use crate::normalize::normalize_model_key;
use crate::types::{ModelQuota, clamp_percent, normalize_quota_map};

pub const METADATA_KEY: &str = "cliproxy_quota";

const PROVIDER_KEY: &str = "provider";
const UPDATED_AT_KEY: &str = "updated_at";
const MODELS_KEY: &str = "models";
const PERCENT_KEY: &str = "percent";
const RESET_KEY: &str = "reset_time";

const QUOTA_EQUAL_EPSILON: f64 = 1e-4;

/// Stored quota percentage for a model, normalized key first, then `*`.
pub fn get_percent(metadata: &Map<String, Value>, model: &str) -> Option<f64> {
    get_model_quota(metadata, model).map(|entry| clamp_percent(entry.percent))
}

/// Stored quota entry for a model, normalized key first, then `*`.
pub fn get_model_quota(metadata: &Map<String, Value>, model: &str) -> Option<ModelQuota> {
    let snapshot = metadata.get(METADATA_KEY)?.as_object()?;
    let models = snapshot.get(MODELS_KEY)?.as_object()?;
    let mut lookup = normalize_model_key(model);
    if lookup.is_empty() {
        lookup = "*".to_string();
    }
    models
        .get(&lookup)
        .and_then(read_model_quota)
        .or_else(|| models.get("*").and_then(read_model_quota))
}

/// Writes the snapshot into the metadata map. Returns `false` when the new
/// normalized map equals the existing one (percent within 1e-4, reset time
/// exact) under the same provider.
pub fn update_metadata(
    metadata: &mut Map<String, Value>,
    provider: &str,
    models: &HashMap<String, ModelQuota>,
    updated_at: Option<OffsetDateTime>,
) -> bool {
    let normalized = normalize_quota_map(models);
    if normalized.is_empty() {
        return false;
    }

    let mut existing_provider = String::new();
    let mut existing_models: HashMap<String, ModelQuota> = HashMap::new();
    if let Some(snapshot) = metadata.get(METADATA_KEY).and_then(Value::as_object) {
        if let Some(raw) = snapshot.get(PROVIDER_KEY)
            && let Some(value) = value_string(raw)
        {
            existing_provider = value;
        }
        existing_models = parse_snapshot_models(snapshot.get(MODELS_KEY));
    }

    let mut normalized_provider = provider.trim().to_ascii_lowercase();
    if normalized_provider.is_empty() {
        normalized_provider = existing_provider.trim().to_ascii_lowercase();
    }
    if normalized_provider == existing_provider.trim().to_ascii_lowercase()
        && quota_map_equal(&existing_models, &normalized)
    {
        return false;
    }

    let mut serialized = Map::with_capacity(normalized.len());
    for (key, entry) in &normalized {
        let mut item = Map::new();
        item.insert(PERCENT_KEY.to_string(), json!(clamp_percent(entry.percent)));
        if let Some(reset) = entry.reset_time
            && let Ok(formatted) = reset.to_offset(time::UtcOffset::UTC).format(&Rfc3339)
        {
            item.insert(RESET_KEY.to_string(), Value::String(formatted));
        }
        serialized.insert(key.clone(), Value::Object(item));
    }

    let mut snapshot = Map::new();
    snapshot.insert(
        PROVIDER_KEY.to_string(),
        Value::String(provider.trim().to_string()),
    );
    snapshot.insert(MODELS_KEY.to_string(), Value::Object(serialized));
    if let Some(updated_at) = updated_at
        && let Ok(formatted) = updated_at.to_offset(time::UtcOffset::UTC).format(&Rfc3339)
    {
        snapshot.insert(UPDATED_AT_KEY.to_string(), Value::String(formatted));
    }
    metadata.insert(METADATA_KEY.to_string(), Value::Object(snapshot));
    true
}

fn parse_snapshot_models(raw: Option<&Value>) -> HashMap<String, ModelQuota> {
    let Some(models) = raw.and_then(Value::as_object) else {
        return HashMap::new();
    };
    let mut out = HashMap::with_capacity(models.len());
    for (key, value) in models {
        let Some(entry) = read_model_quota(value) else {
            continue;
        };
        let model_key = normalize_model_key(key);
        if model_key.is_empty() {
            continue;
        }
        out.insert(model_key, entry);
    }
    out
}

fn read_model_quota(value: &Value) -> Option<ModelQuota> {
    if let Some(item) = value.as_object() {
        let percent = read_f64(item.get(PERCENT_KEY)?)?;
        return Some(ModelQuota {
            percent: clamp_percent(percent),
            updated_at: None,
            reset_time: item.get(RESET_KEY).and_then(parse_rfc3339),
        });
    }
    // Bare numbers are accepted for backwards compatibility.
    read_f64(value).map(|percent| ModelQuota {
        percent: clamp_percent(percent),
        ..Default::default()
    })
}

fn quota_map_equal(a: &HashMap<String, ModelQuota>, b: &HashMap<String, ModelQuota>) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|(key, left)| {
        b.get(key).is_some_and(|right| {
            (left.percent - right.percent).abs() <= QUOTA_EQUAL_EPSILON
                && left.reset_time == right.reset_time
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn quota(percent: f64) -> ModelQuota {
        ModelQuota {
            percent,
            ..Default::default()
        }
    }

    #[test]
    fn update_then_get_round_trips() {
        let mut metadata = Map::new();
        let now = OffsetDateTime::now_utc();
        let mut models = HashMap::new();
        models.insert(
            "Claude-Sonnet-4-5".to_string(),
            ModelQuota {
                percent: 62.5,
                reset_time: Some(now + Duration::hours(4)),
                ..Default::default()
            },
        );

        assert!(update_metadata(&mut metadata, "antigravity", &models, Some(now)));
        let entry = get_model_quota(&metadata, "claude-sonnet-4-5-thinking").unwrap();
        assert_eq!(entry.percent, 62.5);
        assert!(entry.reset_time.is_some());
        assert_eq!(get_percent(&metadata, "missing"), None);
    }

    #[test]
    fn wildcard_fallback() {
        let mut metadata = Map::new();
        let mut models = HashMap::new();
        models.insert("*".to_string(), quota(40.0));
        update_metadata(&mut metadata, "codex", &models, None);
        assert_eq!(get_percent(&metadata, "gpt-5.1-codex"), Some(40.0));
    }

    #[test]
    fn unchanged_snapshot_is_not_rewritten() {
        let mut metadata = Map::new();
        let now = OffsetDateTime::now_utc();
        let mut models = HashMap::new();
        models.insert("gemini-3-flash".to_string(), quota(55.0));

        assert!(update_metadata(&mut metadata, "antigravity", &models, Some(now)));
        assert!(!update_metadata(&mut metadata, "antigravity", &models, Some(now)));

        // A percent shift within the epsilon still counts as unchanged.
        models.insert("gemini-3-flash".to_string(), quota(55.00001));
        assert!(!update_metadata(&mut metadata, "antigravity", &models, Some(now)));

        models.insert("gemini-3-flash".to_string(), quota(54.0));
        assert!(update_metadata(&mut metadata, "antigravity", &models, Some(now)));
    }

    #[test]
    fn bare_number_entries_are_readable() {
        let mut metadata = Map::new();
        metadata.insert(
            METADATA_KEY.to_string(),
            json!({"provider": "codex", "models": {"*": 82.0}}),
        );
        assert_eq!(get_percent(&metadata, ""), Some(82.0));
    }
}
