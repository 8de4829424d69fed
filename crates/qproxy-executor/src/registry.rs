//! Model registry contract consumed by the alias resolver and the
//! models-list path.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use serde::{Deserialize, Serialize};

/// Thinking-budget support advertised for a model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingSupport {
    pub min: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub owned_by: String,
    pub created: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingSupport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<i64>,
}

/// Models visible to each auth, refreshed from the upstream models list.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    clients: RwLock<HashMap<String, Vec<Arc<ModelInfo>>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_models_for_client(&self, auth_id: &str, models: Vec<ModelInfo>) {
        let models = models.into_iter().map(Arc::new).collect();
        self.clients
            .write()
            .expect("registry lock poisoned")
            .insert(auth_id.to_string(), models);
    }

    pub fn get_models_for_client(&self, auth_id: &str) -> Vec<Arc<ModelInfo>> {
        self.clients
            .read()
            .expect("registry lock poisoned")
            .get(auth_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn remove_client(&self, auth_id: &str) {
        self.clients
            .write()
            .expect("registry lock poisoned")
            .remove(auth_id);
    }
}

pub(crate) struct AntigravityModelConfig {
    pub thinking: Option<ThinkingSupport>,
    pub max_completion_tokens: Option<i64>,
}

/// Static per-model capabilities for the Antigravity channel; the upstream
/// models list does not carry thinking budgets.
pub(crate) fn antigravity_model_config()
-> &'static HashMap<&'static str, AntigravityModelConfig> {
    static CONFIG: OnceLock<HashMap<&'static str, AntigravityModelConfig>> = OnceLock::new();
    CONFIG.get_or_init(|| {
        let mut map = HashMap::new();
        map.insert(
            "claude-sonnet-4-5-thinking",
            AntigravityModelConfig {
                thinking: Some(ThinkingSupport {
                    min: 1024,
                    max: Some(64000),
                }),
                max_completion_tokens: Some(64000),
            },
        );
        map.insert(
            "claude-opus-4-5-thinking",
            AntigravityModelConfig {
                thinking: Some(ThinkingSupport {
                    min: 1024,
                    max: Some(64000),
                }),
                max_completion_tokens: Some(64000),
            },
        );
        map.insert(
            "claude-sonnet-4-5",
            AntigravityModelConfig {
                thinking: None,
                max_completion_tokens: Some(64000),
            },
        );
        map.insert(
            "gemini-3-pro-high",
            AntigravityModelConfig {
                thinking: Some(ThinkingSupport {
                    min: 128,
                    max: Some(32768),
                }),
                max_completion_tokens: Some(65536),
            },
        );
        map.insert(
            "gemini-3-flash",
            AntigravityModelConfig {
                thinking: Some(ThinkingSupport {
                    min: 0,
                    max: Some(24576),
                }),
                max_completion_tokens: Some(65536),
            },
        );
        map.insert(
            "gemini-2.5-flash",
            AntigravityModelConfig {
                thinking: None,
                max_completion_tokens: Some(65536),
            },
        );
        map.insert(
            "gpt-oss-120b-medium",
            AntigravityModelConfig {
                thinking: None,
                max_completion_tokens: Some(32768),
            },
        );
        map
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_round_trip() {
        let registry = ModelRegistry::new();
        registry.set_models_for_client(
            "auth-1",
            vec![ModelInfo {
                id: "gemini-3-flash".to_string(),
                name: "gemini-3-flash".to_string(),
                ..Default::default()
            }],
        );
        assert_eq!(registry.get_models_for_client("auth-1").len(), 1);
        assert!(registry.get_models_for_client("auth-2").is_empty());
        registry.remove_client("auth-1");
        assert!(registry.get_models_for_client("auth-1").is_empty());
    }
}
