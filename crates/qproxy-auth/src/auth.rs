use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use qproxy_common::{read_i64, value_string};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    #[default]
    Active,
    Disabled,
}

/// Quota verdict attached to a [`ModelState`]. `exceeded` implies a reason
/// and a recovery deadline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaState {
    pub exceeded: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub next_recover_at: Option<OffsetDateTime>,
}

/// Per-(auth, model) availability record, created lazily on first signal
/// and cleared on evidence of recovery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelState {
    pub status: ModelStatus,
    pub unavailable: bool,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub next_retry_after: Option<OffsetDateTime>,
    pub quota: QuotaState,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<OffsetDateTime>,
}

/// An upstream OAuth account credential.
///
/// `metadata` is loosely typed on purpose: the on-disk auth files carry
/// provider-specific keys (tokens, `project_id`, `account_id`, the
/// `cliproxy_quota` mirror, ...) and unknown keys must survive a
/// read-modify-write cycle, which the flattened `extra` map guarantees for
/// top-level fields too.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Auth {
    pub id: String,
    pub provider: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub label: String,
    pub disabled: bool,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub model_states: HashMap<String, ModelState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_retry: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Auth {
    /// Priority tier parsed from `attributes["priority"]`, default 0.
    pub fn priority(&self) -> i64 {
        self.attribute("priority")
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(0)
    }

    /// Trimmed, non-empty attribute value.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        let raw = self.attributes.get(key)?.trim();
        if raw.is_empty() { None } else { Some(raw) }
    }

    /// Trimmed, non-empty string metadata value.
    pub fn metadata_str(&self, key: &str) -> Option<String> {
        self.metadata.get(key).and_then(value_string)
    }

    pub fn metadata_i64(&self, key: &str) -> Option<i64> {
        self.metadata.get(key).and_then(read_i64)
    }

    /// Auths created for a single runtime session are skipped by the
    /// quota poller.
    pub fn runtime_only(&self) -> bool {
        self.attribute("runtime_only")
            .is_some_and(|raw| raw.eq_ignore_ascii_case("true"))
    }

    /// Per-auth retry override; falls back to the `request_retry`
    /// attribute for auth files that predate the typed field.
    pub fn request_retry_override(&self) -> Option<i64> {
        self.request_retry
            .or_else(|| self.attribute("request_retry").and_then(|raw| raw.parse().ok()))
    }

    /// User agent resolved from attributes, then metadata.
    pub fn user_agent(&self) -> Option<String> {
        if let Some(ua) = self.attribute("user_agent") {
            return Some(ua.to_string());
        }
        self.metadata_str("user_agent")
    }

    /// Custom base URL resolved from attributes, then metadata, with any
    /// trailing slash trimmed.
    pub fn base_url(&self) -> Option<String> {
        let raw = self
            .attribute("base_url")
            .map(str::to_string)
            .or_else(|| self.metadata_str("base_url"))?;
        let trimmed = raw.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    pub fn model_state(&self, model: &str) -> Option<&ModelState> {
        self.model_states.get(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_keys_survive_round_trip() {
        let raw = json!({
            "id": "auth-1",
            "provider": "antigravity",
            "metadata": {"access_token": "tok", "custom": {"nested": 1}},
            "vendor_extension": {"keep": true}
        });
        let auth: Auth = serde_json::from_value(raw).unwrap();
        assert_eq!(auth.metadata_str("access_token").as_deref(), Some("tok"));

        let out = serde_json::to_value(&auth).unwrap();
        assert_eq!(out["vendor_extension"]["keep"], json!(true));
        assert_eq!(out["metadata"]["custom"]["nested"], json!(1));
    }

    #[test]
    fn priority_defaults_to_zero() {
        let auth = Auth::default();
        assert_eq!(auth.priority(), 0);

        let mut auth = Auth::default();
        auth.attributes.insert("priority".to_string(), "10".to_string());
        assert_eq!(auth.priority(), 10);
        auth.attributes.insert("priority".to_string(), "junk".to_string());
        assert_eq!(auth.priority(), 0);
    }

    #[test]
    fn base_url_prefers_attributes_and_trims() {
        let mut auth = Auth::default();
        auth.metadata
            .insert("base_url".to_string(), json!("https://meta.example/"));
        assert_eq!(auth.base_url().as_deref(), Some("https://meta.example"));

        auth.attributes
            .insert("base_url".to_string(), "https://attr.example/".to_string());
        assert_eq!(auth.base_url().as_deref(), Some("https://attr.example"));
    }
}
