//! Requested-model to upstream-model resolution.
//!
//! Order: per-auth rewrite rules, configured `oauth-model-alias` entries,
//! built-in channel defaults, then registry-based matching (exact, date
//! suffix, thinking variant, latest dated). An empty result means "pass
//! the requested name through unchanged".

use std::collections::HashMap;
use std::sync::OnceLock;

use qproxy_auth::Auth;
use qproxy_common::Config;
use qproxy_quota::strip_date_suffix;

use crate::registry::ModelRegistry;

pub fn resolve_upstream_model(
    auth: &Auth,
    requested_model: &str,
    cfg: &Config,
    registry: &ModelRegistry,
) -> Option<String> {
    let rewritten = rewrite_model_for_auth(requested_model, auth);
    let requested = rewritten.trim();
    if requested.is_empty() {
        return None;
    }
    let channel = auth.provider.trim().to_ascii_lowercase();
    if channel.is_empty() {
        return None;
    }

    if let Some(upstream) = resolve_configured_alias(cfg, &channel, requested) {
        return Some(upstream);
    }
    if let Some(upstream) = resolve_default_alias(&channel, requested) {
        return Some(upstream);
    }
    let models: Vec<String> = registry
        .get_models_for_client(&auth.id)
        .iter()
        .map(|info| {
            let id = info.id.trim();
            if id.is_empty() { info.name.trim() } else { id }.to_string()
        })
        .filter(|id| !id.is_empty())
        .collect();
    resolve_model_from_candidates(requested, &models)
}

/// Per-auth rewrite rules from `attributes["model_rewrite"]`, formatted
/// `from=to[;from=to...]`.
fn rewrite_model_for_auth(model: &str, auth: &Auth) -> String {
    let model = model.trim();
    let Some(rules) = auth.attribute("model_rewrite") else {
        return model.to_string();
    };
    for rule in rules.split(';') {
        let Some((from, to)) = rule.split_once('=') else {
            continue;
        };
        if from.trim().eq_ignore_ascii_case(model) && !to.trim().is_empty() {
            return to.trim().to_string();
        }
    }
    model.to_string()
}

fn resolve_configured_alias(cfg: &Config, channel: &str, requested: &str) -> Option<String> {
    cfg.alias_entries(channel)
        .iter()
        .find(|entry| entry.name.trim().eq_ignore_ascii_case(requested))
        .map(|entry| entry.alias.trim())
        .filter(|alias| !alias.is_empty())
        .map(str::to_string)
}

fn resolve_default_alias(channel: &str, requested: &str) -> Option<String> {
    if channel != "antigravity" {
        return None;
    }
    let key = requested.to_ascii_lowercase();
    default_alias_map()
        .get(key.as_str())
        .filter(|upstream| !upstream.eq_ignore_ascii_case(requested))
        .map(|upstream| upstream.to_string())
}

fn default_alias_map() -> &'static HashMap<&'static str, &'static str> {
    static MAP: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();
    MAP.get_or_init(|| {
        HashMap::from([
            ("gemini-2.5-computer-use-preview-10-2025", "rev19-uic3-1p"),
            ("gemini-3-pro-image-preview", "gemini-3-pro-image"),
            ("gemini-3-pro-preview", "gemini-3-pro-high"),
            ("gemini-3-flash-preview", "gemini-3-flash"),
            ("gemini-claude-sonnet-4-5", "claude-sonnet-4-5"),
            ("gemini-claude-sonnet-4-5-thinking", "claude-sonnet-4-5-thinking"),
            ("gemini-claude-opus-4-5-thinking", "claude-opus-4-5-thinking"),
        ])
    })
}

/// Strips an explicit numeric thinking-budget marker
/// (`model-thinking-8192`, `model(8192)`), leaving real `-thinking` model
/// ids untouched.
pub(crate) fn base_model_name(model: &str) -> &str {
    let model = model.trim();
    if let Some(open) = model.rfind('(')
        && model.ends_with(')')
        && model[open + 1..model.len() - 1]
            .bytes()
            .all(|b| b.is_ascii_digit())
        && open > 0
    {
        return model[..open].trim_end_matches('-').trim();
    }
    if let Some((base, last)) = model.rsplit_once('-')
        && !last.is_empty()
        && last.bytes().all(|b| b.is_ascii_digit())
        && base.to_ascii_lowercase().ends_with("-thinking")
    {
        return base;
    }
    model
}

fn resolve_model_from_candidates(requested: &str, models: &[String]) -> Option<String> {
    if requested.is_empty() || models.is_empty() {
        return None;
    }
    let normalized = base_model_name(requested);

    if let Some(matched) = match_exact(models, normalized) {
        return Some(matched);
    }
    if normalized != requested
        && let Some(matched) = match_exact(models, requested)
    {
        return Some(matched);
    }

    let base = strip_date_suffix(normalized);
    if base != normalized
        && let Some(matched) = match_exact(models, base)
    {
        return Some(matched);
    }
    if let Some(matched) = match_latest_dated(models, base) {
        return Some(matched);
    }

    let alternate = match base.strip_suffix("-thinking") {
        Some(trimmed) if !trimmed.is_empty() => trimmed.to_string(),
        _ => format!("{base}-thinking"),
    };
    if let Some(matched) = match_exact(models, &alternate) {
        return Some(matched);
    }
    match_latest_dated(models, &alternate)
}

fn match_exact(models: &[String], needle: &str) -> Option<String> {
    let needle = needle.trim();
    if needle.is_empty() {
        return None;
    }
    models
        .iter()
        .find(|model| model.trim().eq_ignore_ascii_case(needle))
        .cloned()
}

/// Lexicographically latest `<base>-<8 digit date>` candidate.
fn match_latest_dated(models: &[String], base: &str) -> Option<String> {
    let base = base.trim().to_ascii_lowercase();
    if base.is_empty() {
        return None;
    }
    let prefix = format!("{base}-");
    models
        .iter()
        .filter_map(|model| {
            let lower = model.trim().to_ascii_lowercase();
            let suffix = lower.strip_prefix(&prefix)?;
            if suffix.len() == 8 && suffix.bytes().all(|b| b.is_ascii_digit()) {
                Some((suffix.to_string(), model.clone()))
            } else {
                None
            }
        })
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, model)| model)
}
