use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Selector picked by `routing.strategy`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    #[default]
    RoundRobin,
    FillFirst,
    QuotaWeighted,
}

/// One `{name, alias}` pair from `oauth-model-alias` / `oauth-model-mappings`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasEntry {
    pub name: String,
    pub alias: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub strategy: RoutingStrategy,
}

/// Runtime configuration consumed by the routing core.
///
/// Field names follow the on-disk config keys; the loader that merges
/// files/env into this struct lives outside this workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub routing: RoutingConfig,
    /// Per-channel alias entries consulted before the built-in defaults.
    #[serde(rename = "oauth-model-alias")]
    pub oauth_model_alias: HashMap<String, Vec<AliasEntry>>,
    /// Client-facing model id -> channel model id, applied at ingress.
    #[serde(rename = "oauth-model-mappings")]
    pub oauth_model_mappings: HashMap<String, Vec<AliasEntry>>,
    /// Default retry count for executors; per-auth overrides win.
    #[serde(rename = "request-retry")]
    pub request_retry: i64,
    /// Whether translated bodies are included in the debug log.
    #[serde(rename = "request-log")]
    pub request_log: bool,
    /// Optional outbound proxy for upstream egress.
    pub proxy: Option<String>,
    /// Overrides `${cache_dir}/cliproxy/quota.json`.
    #[serde(rename = "quota-store-path")]
    pub quota_store_path: Option<PathBuf>,
}

impl Config {
    pub fn alias_entries(&self, channel: &str) -> &[AliasEntry] {
        self.oauth_model_alias
            .get(channel)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Ingress mapping lookup: returns the channel model id for a
    /// client-facing model id, if one is configured.
    pub fn mapped_model(&self, channel: &str, model: &str) -> Option<&str> {
        let entries = self.oauth_model_mappings.get(channel)?;
        entries
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(model.trim()))
            .map(|entry| entry.alias.as_str())
    }
}
