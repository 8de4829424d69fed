//! Antigravity shared-quota groups.
//!
//! Models in the same group draw from a common upstream pool: once one
//! member is observed exhausted, every sibling is treated as exhausted
//! until the group's reset time. A model outside every group is its own
//! group.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::normalize::strip_date_suffix;

static QUOTA_GROUPS: &[(&str, &[&str])] = &[
    (
        "claude-gpt",
        &[
            "claude-sonnet-4-5-thinking",
            "claude-opus-4-5-thinking",
            "gpt-oss-120b-medium",
        ],
    ),
    ("gemini-3-pro", &["gemini-3-pro-high", "gemini-3-pro-low"]),
    (
        "gemini-2-5-flash",
        &["gemini-2.5-flash", "gemini-2.5-flash-thinking"],
    ),
    ("gemini-2-5-flash-lite", &["gemini-2.5-flash-lite"]),
    ("gemini-2-5-cu", &["rev19-uic3-1p"]),
    ("gemini-3-flash", &["gemini-3-flash"]),
    ("gemini-image", &["gemini-3-pro-image"]),
];

fn model_to_group() -> &'static HashMap<&'static str, &'static str> {
    static MAP: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();
    MAP.get_or_init(|| {
        let mut map = HashMap::new();
        for (group, members) in QUOTA_GROUPS.iter().copied() {
            for member in members.iter().copied() {
                map.insert(member, group);
            }
        }
        map
    })
}

fn lookup_group(model: &str) -> Option<&'static str> {
    let map = model_to_group();
    if let Some(group) = map.get(model) {
        return Some(group);
    }
    let base = strip_date_suffix(model);
    if base != model {
        if let Some(group) = map.get(base) {
            return Some(group);
        }
        // Dated variants also match members by base with `-thinking` trimmed.
        for (group, members) in QUOTA_GROUPS.iter().copied() {
            for member in members.iter().copied() {
                let member_base = member.strip_suffix("-thinking").unwrap_or(member);
                if base == member_base {
                    return Some(group);
                }
            }
        }
    }
    None
}

/// Stable group id for the model; the model itself when it has no group.
pub fn group_id(model: &str) -> String {
    if model.is_empty() {
        return String::new();
    }
    match lookup_group(model) {
        Some(group) => group.to_string(),
        None => model.to_string(),
    }
}

/// All models sharing quota with the given model (the model alone when it
/// has no group).
pub fn group_models(model: &str) -> Vec<String> {
    if model.is_empty() {
        return Vec::new();
    }
    match lookup_group(model) {
        Some(group) => members_of(group),
        None => vec![model.to_string()],
    }
}

/// Members for a group id produced by [`group_id`]. A groupless id expands
/// to itself.
pub fn models_in_group_id(group: &str) -> Vec<String> {
    if group.is_empty() {
        return Vec::new();
    }
    let members = members_of(group);
    if members.is_empty() {
        vec![group.to_string()]
    } else {
        members
    }
}

fn members_of(group: &str) -> Vec<String> {
    QUOTA_GROUPS
        .iter()
        .copied()
        .find(|(id, _)| *id == group)
        .map(|(_, members)| members.iter().map(|member| member.to_string()).collect())
        .unwrap_or_default()
}
