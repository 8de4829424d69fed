//! Background quota poller.
//!
//! Every few minutes the poller harvests a remaining-quota snapshot from
//! each eligible upstream account and persists it twice: into the auth's
//! metadata mirror (through a manager update) and into the durable quota
//! store. Fetch failures are logged and skipped; the loop itself never
//! fails.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use qproxy_auth::{Auth, Manager};
use qproxy_common::{Config, parse_rfc3339, read_bool, read_f64, value_string};
use qproxy_quota::{ModelQuota, Store, clamp_percent, metadata, normalize_model_key};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3 * 60);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_CONCURRENT_REQUESTS: usize = 5;

const ANTIGRAVITY_POLL_USER_AGENT: &str = "antigravity/1.11.5 windows/amd64";
const CODEX_USER_AGENT: &str = "codex_cli_rs/0.76.0 (Debian 13.0.0; x86_64) WindowsTerminal";

const ANTIGRAVITY_QUOTA_URLS: &[&str] = &[
    "https://daily-cloudcode-pa.googleapis.com/v1internal:fetchAvailableModels",
    "https://daily-cloudcode-pa.sandbox.googleapis.com/v1internal:fetchAvailableModels",
    "https://cloudcode-pa.googleapis.com/v1internal:fetchAvailableModels",
];
const GEMINI_CLI_QUOTA_URL: &str =
    "https://cloudcode-pa.googleapis.com/v1internal:retrieveUserQuota";
const CODEX_USAGE_URL: &str = "https://chatgpt.com/backend-api/wham/usage";

/// Periodically refreshes quota snapshots for every eligible auth.
pub struct Poller {
    manager: Arc<Manager>,
    store: Arc<Store>,
    interval: Duration,
    request_timeout: Duration,
    max_concurrency: usize,
    alias_map: RwLock<HashMap<String, String>>,
}

impl Poller {
    pub fn new(manager: Arc<Manager>, store: Arc<Store>) -> Self {
        Self {
            manager,
            store,
            interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_concurrency: MAX_CONCURRENT_REQUESTS,
            alias_map: RwLock::new(default_alias_map()),
        }
    }

    /// Updates the alias map used for Antigravity model matching.
    pub fn set_config(&self, cfg: &Config) {
        *self.alias_map.write().expect("poller lock poisoned") = alias_map_from_config(cfg);
    }

    /// Launches the polling loop. The loop exits when `cancel` fires;
    /// in-flight fetches finish or hit their request timeout.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        info!(event = "quota_poller_started", interval_secs = self.interval.as_secs());
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            self.poll(&cancel).await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    async fn poll(self: &Arc<Self>, cancel: &CancellationToken) {
        let auths = self.manager.list();
        if auths.is_empty() {
            return;
        }
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();
        for auth in auths {
            if auth.id.trim().is_empty() || auth.disabled || auth.runtime_only() {
                continue;
            }
            let provider = auth.provider.trim().to_ascii_lowercase();
            if !matches!(provider.as_str(), "antigravity" | "codex" | "gemini-cli") {
                continue;
            }
            let permit = tokio::select! {
                _ = cancel.cancelled() => return,
                permit = semaphore.clone().acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                return;
            };
            let poller = Arc::clone(self);
            let fetch_cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                tokio::select! {
                    _ = fetch_cancel.cancelled() => {}
                    _ = async {
                        match auth.provider.trim().to_ascii_lowercase().as_str() {
                            "antigravity" => poller.poll_antigravity(&auth).await,
                            "codex" => poller.poll_codex(&auth).await,
                            "gemini-cli" => poller.poll_gemini_cli(&auth).await,
                            _ => {}
                        }
                    } => {}
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    async fn poll_antigravity(&self, auth: &Auth) {
        let user_agent = auth
            .user_agent()
            .unwrap_or_else(|| ANTIGRAVITY_POLL_USER_AGENT.to_string());
        let urls = match auth.base_url() {
            Some(base) => vec![format!("{base}/v1internal:fetchAvailableModels")],
            None => ANTIGRAVITY_QUOTA_URLS
                .iter()
                .map(|url| url.to_string())
                .collect(),
        };

        let alias_map = self
            .alias_map
            .read()
            .expect("poller lock poisoned")
            .clone();

        for url in urls {
            let response = self
                .do_request(auth, Method::Post, &url, Some(b"{}".as_slice()), &user_agent, &[])
                .await;
            let (status, payload) = match response {
                Ok(result) => result,
                Err(err) => {
                    warn!(event = "quota_poll", provider = "antigravity", auth_id = %auth.id, error = %err);
                    continue;
                }
            };
            if !(200..300).contains(&status) {
                warn!(
                    event = "quota_poll",
                    provider = "antigravity",
                    auth_id = %auth.id,
                    status = status,
                    body = %summarize_payload(&payload),
                );
                continue;
            }
            let models = extract_antigravity_quota(&payload, &alias_map);
            if models.is_empty() {
                return;
            }
            self.persist_quota(auth, "antigravity", &models).await;
            return;
        }
    }

    async fn poll_codex(&self, auth: &Auth) {
        let Some(account_id) = resolve_codex_account_id(&auth.metadata) else {
            warn!(event = "quota_poll", provider = "codex", auth_id = %auth.id, error = "missing account id");
            return;
        };

        let response = self
            .do_request(
                auth,
                Method::Get,
                CODEX_USAGE_URL,
                None,
                CODEX_USER_AGENT,
                &[("Chatgpt-Account-Id", account_id.as_str())],
            )
            .await;
        let (status, payload) = match response {
            Ok(result) => result,
            Err(err) => {
                warn!(event = "quota_poll", provider = "codex", auth_id = %auth.id, error = %err);
                return;
            }
        };
        if !(200..300).contains(&status) {
            warn!(
                event = "quota_poll",
                provider = "codex",
                auth_id = %auth.id,
                status = status,
                body = %summarize_payload(&payload),
            );
            return;
        }
        let models = extract_codex_quota(&payload);
        if models.is_empty() {
            return;
        }
        self.persist_quota(auth, "codex", &models).await;
    }

    async fn poll_gemini_cli(&self, auth: &Auth) {
        let Some(project_id) = auth.metadata_str("project_id") else {
            warn!(event = "quota_poll", provider = "gemini-cli", auth_id = %auth.id, error = "missing project id");
            return;
        };

        let body = serde_json::to_vec(&serde_json::json!({"project": project_id}))
            .unwrap_or_else(|_| b"{}".to_vec());
        let user_agent = auth
            .user_agent()
            .unwrap_or_else(|| ANTIGRAVITY_POLL_USER_AGENT.to_string());
        let response = self
            .do_request(
                auth,
                Method::Post,
                GEMINI_CLI_QUOTA_URL,
                Some(&body),
                &user_agent,
                &[],
            )
            .await;
        let (status, payload) = match response {
            Ok(result) => result,
            Err(err) => {
                warn!(event = "quota_poll", provider = "gemini-cli", auth_id = %auth.id, error = %err);
                return;
            }
        };
        if !(200..300).contains(&status) {
            warn!(
                event = "quota_poll",
                provider = "gemini-cli",
                auth_id = %auth.id,
                status = status,
                body = %summarize_payload(&payload),
            );
            return;
        }
        let models = extract_gemini_quota(&payload);
        if models.is_empty() {
            return;
        }
        self.persist_quota(auth, "gemini-cli", &models).await;
    }

    async fn do_request(
        &self,
        auth: &Auth,
        method: Method,
        url: &str,
        body: Option<&[u8]>,
        user_agent: &str,
        extra_headers: &[(&str, &str)],
    ) -> Result<(u16, Vec<u8>), String> {
        let Some(access_token) = auth.metadata_str("access_token") else {
            return Err("missing access token".to_string());
        };
        let client = self
            .manager
            .http_client()
            .map_err(|err| err.to_string())?;

        let mut request = match method {
            Method::Get => client.get(url),
            Method::Post => client.post(url),
        };
        request = request
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {access_token}"))
            .header("User-Agent", user_agent);
        for (key, value) in extra_headers {
            request = request.header(*key, *value);
        }
        if let Some(body) = body {
            request = request.body(body.to_vec());
        }

        let send = async {
            let response = request.send().await.map_err(|err| err.to_string())?;
            let status = response.status().as_u16();
            let payload = response.bytes().await.map_err(|err| err.to_string())?;
            Ok::<_, String>((status, payload.to_vec()))
        };
        match tokio::time::timeout(self.request_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err("request timed out".to_string()),
        }
    }

    /// Writes one snapshot to both sinks: the auth metadata mirror (via a
    /// clone-then-update through the manager) and the durable store. An
    /// unchanged snapshot issues no update and no flush.
    async fn persist_quota(&self, auth: &Auth, provider: &str, models: &HashMap<String, ModelQuota>) {
        if models.is_empty() {
            return;
        }
        let now = time::OffsetDateTime::now_utc();

        let mut updated = auth.clone();
        if metadata::update_metadata(&mut updated.metadata, provider, models, Some(now))
            && let Err(err) = self.manager.update(updated)
        {
            warn!(event = "quota_persist", auth_id = %auth.id, error = %err);
        }

        if self.store.set(&auth.id, provider, models, now) {
            if let Err(err) = self.store.flush() {
                // In-memory state stays authoritative; log and continue.
                warn!(event = "quota_persist", auth_id = %auth.id, error = %err);
            } else {
                debug!(
                    event = "quota_persist",
                    auth_id = %auth.id,
                    provider = %provider,
                    models = models.len(),
                );
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Method {
    Get,
    Post,
}

fn default_alias_map() -> HashMap<String, String> {
    [
        ("rev19-uic3-1p", "gemini-2.5-computer-use-preview-10-2025"),
        ("gemini-3-pro-image", "gemini-3-pro-image-preview"),
        ("gemini-3-pro-high", "gemini-3-pro-preview"),
        ("gemini-3-flash", "gemini-3-flash-preview"),
        ("claude-sonnet-4-5", "gemini-claude-sonnet-4-5"),
        ("claude-sonnet-4-5-thinking", "gemini-claude-sonnet-4-5-thinking"),
        ("claude-opus-4-5-thinking", "gemini-claude-opus-4-5-thinking"),
    ]
    .into_iter()
    .map(|(name, alias)| (name.to_ascii_lowercase(), alias.to_string()))
    .collect()
}

fn alias_map_from_config(cfg: &Config) -> HashMap<String, String> {
    let entries = cfg.alias_entries("antigravity");
    if entries.is_empty() {
        return default_alias_map();
    }
    let mut out = HashMap::with_capacity(entries.len());
    for entry in entries {
        let name = entry.name.trim();
        let alias = entry.alias.trim();
        if name.is_empty() || alias.is_empty() {
            continue;
        }
        out.entry(name.to_ascii_lowercase())
            .or_insert_with(|| alias.to_string());
    }
    if out.is_empty() {
        return default_alias_map();
    }
    out
}

/// Walks `models.*` and emits a quota entry per record that carries a
/// `modelProvider` and a `quotaInfo.remainingFraction`, under both the
/// record's model name and its configured alias.
pub(crate) fn extract_antigravity_quota(
    payload: &[u8],
    alias_map: &HashMap<String, String>,
) -> HashMap<String, ModelQuota> {
    let mut result = HashMap::new();
    let Ok(root) = serde_json::from_slice::<Value>(payload) else {
        return result;
    };
    let Some(models) = root.get("models").and_then(Value::as_object) else {
        return result;
    };
    for (key, record) in models {
        let Some(record) = record.as_object() else {
            continue;
        };
        if !record.contains_key("modelProvider") {
            continue;
        }
        let Some(info) = record.get("quotaInfo").and_then(Value::as_object) else {
            continue;
        };
        let Some(remaining) = info.get("remainingFraction").and_then(read_f64) else {
            continue;
        };
        let entry = ModelQuota {
            percent: clamp_percent(remaining * 100.0),
            reset_time: info.get("resetTime").and_then(parse_rfc3339),
            updated_at: None,
        };
        let name = record
            .get("model")
            .and_then(value_string)
            .unwrap_or_else(|| key.trim().to_string());
        if name.is_empty() {
            continue;
        }
        add_model_quota(&mut result, &name, &entry);
        if let Some(alias) = alias_map.get(&name.to_ascii_lowercase())
            && !alias.trim().is_empty()
        {
            add_model_quota(&mut result, alias.trim(), &entry);
        }
    }
    result
}

/// Walks `buckets[*]` and emits one quota entry per `modelId`.
pub(crate) fn extract_gemini_quota(payload: &[u8]) -> HashMap<String, ModelQuota> {
    let mut result = HashMap::new();
    let Ok(root) = serde_json::from_slice::<Value>(payload) else {
        return result;
    };
    let Some(buckets) = root.get("buckets").and_then(Value::as_array) else {
        return result;
    };
    for bucket in buckets {
        let Some(name) = bucket.get("modelId").and_then(value_string) else {
            continue;
        };
        let Some(remaining) = bucket.get("remainingFraction").and_then(read_f64) else {
            continue;
        };
        let entry = ModelQuota {
            percent: clamp_percent(remaining * 100.0),
            reset_time: bucket.get("resetTime").and_then(parse_rfc3339),
            updated_at: None,
        };
        add_model_quota(&mut result, &name, &entry);
    }
    result
}

/// Codex usage is account-wide: the minimum across both windows of both
/// limits is emitted under the wildcard key `*`.
pub(crate) fn extract_codex_quota(payload: &[u8]) -> HashMap<String, ModelQuota> {
    let Ok(root) = serde_json::from_slice::<Value>(payload) else {
        return HashMap::new();
    };
    let mut candidates = Vec::new();
    for limit_key in ["rate_limit", "code_review_rate_limit"] {
        if let Some(percent) = codex_limit_percent(root.get(limit_key)) {
            candidates.push(percent);
        }
    }
    let Some(best) = candidates.into_iter().reduce(f64::min) else {
        return HashMap::new();
    };
    HashMap::from([(
        "*".to_string(),
        ModelQuota {
            percent: best,
            ..Default::default()
        },
    )])
}

fn codex_limit_percent(limit: Option<&Value>) -> Option<f64> {
    let limit = limit?.as_object()?;
    let allowed = limit.get("allowed").map(read_bool).unwrap_or(false);
    let limit_reached = limit.get("limit_reached").map(read_bool).unwrap_or(false);
    let mut candidates = Vec::new();
    for window_key in ["primary_window", "secondary_window"] {
        if let Some(percent) =
            codex_window_percent(limit.get(window_key), allowed, limit_reached)
        {
            candidates.push(percent);
        }
    }
    candidates.into_iter().reduce(f64::min)
}

fn codex_window_percent(window: Option<&Value>, allowed: bool, limit_reached: bool) -> Option<f64> {
    let window = window?.as_object()?;
    if limit_reached || !allowed {
        return Some(0.0);
    }
    let used = window.get("used_percent").and_then(read_f64)?;
    Some(clamp_percent(100.0 - used))
}

fn add_model_quota(dst: &mut HashMap<String, ModelQuota>, model: &str, entry: &ModelQuota) {
    let key = normalize_model_key(model);
    if key.is_empty() {
        return;
    }
    if let Some(existing) = dst.get(&key)
        && entry.percent <= existing.percent
    {
        return;
    }
    dst.insert(key, entry.clone());
}

/// Resolves the ChatGPT account id: explicit metadata keys first, then the
/// `chatgpt_account_id` claim of the (unverified) id_token payload.
pub(crate) fn resolve_codex_account_id(metadata: &Map<String, Value>) -> Option<String> {
    for key in ["account_id", "accountId"] {
        if let Some(account_id) = metadata.get(key).and_then(value_string) {
            return Some(account_id);
        }
    }

    let nested_meta = metadata.get("metadata").and_then(Value::as_object);
    let nested_attrs = metadata.get("attributes").and_then(Value::as_object);
    let candidates = [
        metadata.get("id_token"),
        nested_meta.and_then(|m| m.get("id_token")),
        nested_attrs.and_then(|m| m.get("id_token")),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(extract_codex_account_id)
}

fn extract_codex_account_id(value: &Value) -> Option<String> {
    let payload = parse_id_token_payload(value)?;
    for key in ["chatgpt_account_id", "chatgptAccountId"] {
        if let Some(account_id) = payload.get(key).and_then(value_string) {
            return Some(account_id);
        }
    }
    None
}

fn parse_id_token_payload(value: &Value) -> Option<Map<String, Value>> {
    if let Some(object) = value.as_object() {
        return Some(object.clone());
    }
    let raw = value_string(value)?;
    if let Ok(Value::Object(parsed)) = serde_json::from_str::<Value>(&raw) {
        return Some(parsed);
    }
    // JWT: the payload is the second dot-separated segment, base64url.
    let segment = raw.split('.').nth(1)?;
    let decoded = decode_base64_url(segment)?;
    match serde_json::from_slice::<Value>(&decoded) {
        Ok(Value::Object(parsed)) => Some(parsed),
        _ => None,
    }
}

fn decode_base64_url(value: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(decoded) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(value) {
        return Some(decoded);
    }
    let padded_len = value.len().div_ceil(4) * 4;
    let mut padded = value.to_string();
    padded.push_str(&"=".repeat(padded_len - value.len()));
    base64::engine::general_purpose::URL_SAFE.decode(padded).ok()
}

/// First 512 bytes of the trimmed payload, for log lines.
pub(crate) fn summarize_payload(payload: &[u8]) -> String {
    const MAX: usize = 512;
    let trimmed = String::from_utf8_lossy(payload);
    let trimmed = trimmed.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.len() > MAX {
        let mut end = MAX;
        while end > 0 && !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...(truncated)", &trimmed[..end])
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn antigravity_quota_applies_aliases_and_dedups() {
        let payload = serde_json::to_vec(&json!({
            "models": {
                "claude-sonnet-4-5-thinking": {
                    "model": "claude-sonnet-4-5-thinking",
                    "modelProvider": "anthropic",
                    "quotaInfo": {"remainingFraction": 0.42, "resetTime": "2026-08-02T18:00:00Z"}
                },
                "no-provider": {
                    "quotaInfo": {"remainingFraction": 0.9}
                },
                "gemini-3-flash": {
                    "model": "gemini-3-flash",
                    "modelProvider": "google",
                    "quotaInfo": {"remainingFraction": 1.0}
                }
            }
        }))
        .unwrap();

        let models = extract_antigravity_quota(&payload, &default_alias_map());
        // The thinking suffix collapses into the base key.
        let claude = models.get("claude-sonnet-4-5").unwrap();
        assert_eq!(claude.percent, 42.0);
        assert!(claude.reset_time.is_some());
        // The configured alias is emitted too.
        assert!(models.contains_key("gemini-claude-sonnet-4-5"));
        assert_eq!(models.get("gemini-3-flash").unwrap().percent, 100.0);
        assert!(models.contains_key("gemini-3-flash-preview"));
        // Records without modelProvider are skipped.
        assert!(!models.contains_key("no-provider"));
    }

    #[test]
    fn gemini_quota_reads_buckets() {
        let payload = serde_json::to_vec(&json!({
            "buckets": [
                {"modelId": "gemini-3-pro", "remainingFraction": 0.25, "resetTime": "2026-08-02T18:00:00Z"},
                {"modelId": "", "remainingFraction": 0.5},
                {"remainingFraction": 0.5}
            ]
        }))
        .unwrap();
        let models = extract_gemini_quota(&payload);
        assert_eq!(models.len(), 1);
        assert_eq!(models.get("gemini-3-pro").unwrap().percent, 25.0);
    }

    #[test]
    fn codex_quota_takes_minimum_window() {
        let payload = serde_json::to_vec(&json!({
            "rate_limit": {
                "allowed": true,
                "limit_reached": false,
                "primary_window": {"used_percent": 30.0},
                "secondary_window": {"used_percent": 55.0}
            },
            "code_review_rate_limit": {
                "allowed": true,
                "limit_reached": false,
                "primary_window": {"used_percent": 10.0}
            }
        }))
        .unwrap();
        let models = extract_codex_quota(&payload);
        assert_eq!(models.get("*").unwrap().percent, 45.0);
    }

    #[test]
    fn codex_quota_limit_reached_is_zero() {
        let payload = serde_json::to_vec(&json!({
            "rate_limit": {
                "allowed": true,
                "limit_reached": true,
                "primary_window": {"used_percent": 5.0}
            }
        }))
        .unwrap();
        let models = extract_codex_quota(&payload);
        assert_eq!(models.get("*").unwrap().percent, 0.0);
    }

    #[test]
    fn codex_quota_empty_on_malformed_body() {
        assert!(extract_codex_quota(b"not json").is_empty());
        assert!(extract_codex_quota(b"{}").is_empty());
    }

    #[test]
    fn codex_account_id_from_jwt_claim() {
        use base64::Engine;
        let claims = json!({"chatgpt_account_id": "acct-1234"});
        let payload_segment = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&claims).unwrap());
        let token = format!("eyJhbGciOiJSUzI1NiJ9.{payload_segment}.sig");

        let mut metadata = Map::new();
        metadata.insert("id_token".to_string(), json!(token));
        assert_eq!(
            resolve_codex_account_id(&metadata).as_deref(),
            Some("acct-1234")
        );
    }

    #[test]
    fn codex_account_id_prefers_explicit_metadata() {
        let mut metadata = Map::new();
        metadata.insert("account_id".to_string(), json!("acct-direct"));
        metadata.insert("id_token".to_string(), json!("junk"));
        assert_eq!(
            resolve_codex_account_id(&metadata).as_deref(),
            Some("acct-direct")
        );
    }

    #[test]
    fn summarize_payload_truncates() {
        let long = vec![b'a'; 600];
        let summary = summarize_payload(&long);
        assert!(summary.ends_with("...(truncated)"));
        assert!(summary.len() <= 512 + "...(truncated)".len());
        assert_eq!(summarize_payload(b"  \n "), "");
    }
}
