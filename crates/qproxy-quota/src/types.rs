use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::normalize::normalize_model_key;

/// Latest known quota snapshot for a single model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelQuota {
    #[serde(rename = "Percent")]
    pub percent: f64,
    #[serde(
        rename = "UpdatedAt",
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(
        rename = "ResetTime",
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub reset_time: Option<OffsetDateTime>,
}

/// Per-auth slice of the durable quota file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreEntry {
    pub provider: String,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub models: HashMap<String, ModelQuota>,
}

pub fn clamp_percent(value: f64) -> f64 {
    if value < 0.0 {
        return 0.0;
    }
    if value > 100.0 {
        return 100.0;
    }
    value
}

/// Re-keys a quota map by normalized model key, clamping percentages and
/// keeping the highest percent when two raw keys collide.
pub(crate) fn normalize_quota_map(
    models: &HashMap<String, ModelQuota>,
) -> HashMap<String, ModelQuota> {
    let mut out: HashMap<String, ModelQuota> = HashMap::with_capacity(models.len());
    for (raw_key, entry) in models {
        let key = normalize_model_key(raw_key);
        if key.is_empty() {
            continue;
        }
        let mut entry = entry.clone();
        entry.percent = clamp_percent(entry.percent);
        if let Some(existing) = out.get(&key)
            && entry.percent <= existing.percent
        {
            continue;
        }
        out.insert(key, entry);
    }
    out
}
