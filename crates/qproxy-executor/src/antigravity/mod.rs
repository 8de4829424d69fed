//! Antigravity executor: token lifecycle, multi-base-URL fallback,
//! no-capacity retry, request/response shaping, web-search substitution,
//! and thinking-signature recovery.

mod payload;
mod project;
mod recovery;
mod stream;
mod websearch;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use qproxy_auth::Auth;
use qproxy_common::Config;

use crate::alias::base_model_name;
use crate::error::{ExecutorError, ExecutorResult, parse_retry_delay};
use crate::json::delete_path;
use crate::registry::{ModelInfo, antigravity_model_config};
use crate::tracker::QuotaTracker;
use crate::translator::DialectTranslator;
use crate::usage::{UsageCollector, UsageReporter, parse_antigravity_usage};

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const CLIENT_ID: &str = "1071006060591-tmhssin2h21lcre235vtolojh4g403ep.apps.googleusercontent.com";
const CLIENT_SECRET: &str = "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";
const AUTH_TYPE: &str = "antigravity";

/// Refresh ahead of expiry by this much.
const REFRESH_SKEW: Duration = Duration::seconds(3000);

/// Ids the upstream lists but clients must not see.
const MODEL_DENYLIST: &[&str] = &[
    "chat_20706",
    "chat_23310",
    "gemini-2.5-flash-thinking",
    "gemini-3-pro-low",
    "gemini-2.5-pro",
];

/// One inbound model call, already resolved to an upstream model.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub model: String,
    /// Client-dialect payload.
    pub payload: Bytes,
    /// Pristine client payload, kept for the recovery transform.
    pub original: Option<Bytes>,
    /// Optional `$alt` response encoding.
    pub alt: Option<String>,
}

impl ExecuteRequest {
    fn client_payload(&self) -> &[u8] {
        self.original.as_deref().unwrap_or(&self.payload)
    }
}

pub struct ExecuteOutcome {
    pub payload: Bytes,
    /// Present when the call refreshed tokens or model states; the caller
    /// persists it through the manager.
    pub updated_auth: Option<Auth>,
}

pub struct StreamOutcome {
    pub chunks: mpsc::Receiver<ExecutorResult<Bytes>>,
    pub updated_auth: Option<Auth>,
}

pub struct AntigravityExecutor {
    cfg: Arc<Config>,
    client: Arc<wreq::Client>,
    translator: Arc<dyn DialectTranslator>,
    collector: Arc<dyn UsageCollector>,
    tracker: Arc<QuotaTracker>,
}

#[derive(Serialize)]
struct RefreshForm<'a> {
    client_id: &'static str,
    client_secret: &'static str,
    grant_type: &'static str,
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl AntigravityExecutor {
    pub fn new(
        cfg: Arc<Config>,
        client: Arc<wreq::Client>,
        translator: Arc<dyn DialectTranslator>,
        collector: Arc<dyn UsageCollector>,
        tracker: Arc<QuotaTracker>,
    ) -> Self {
        Self {
            cfg,
            client,
            translator,
            collector,
            tracker,
        }
    }

    /// Non-stream execution. Claude-family and `gemini-3-pro-high` calls
    /// run the streaming endpoint underneath and fold the result.
    pub async fn execute(
        &self,
        auth: &Auth,
        request: &ExecuteRequest,
        cancel: &CancellationToken,
    ) -> ExecutorResult<ExecuteOutcome> {
        let base_model = base_model_name(&request.model).to_string();
        if payload::uses_antigravity_schema(&base_model) {
            return self.execute_folded(auth, &base_model, request, cancel).await;
        }

        let (token, refreshed) = self.ensure_access_token(auth).await?;
        let auth_view = refreshed.clone().unwrap_or_else(|| auth.clone());
        let reporter = self.reporter(&base_model, auth);

        let result = self
            .json_roundtrip(&auth_view, &token, &base_model, request, false, cancel)
            .await;
        let body = match result {
            Ok(body) => body,
            Err(err) => {
                reporter.publish_failure();
                return Err(err);
            }
        };

        if let Ok(parsed) = serde_json::from_slice::<Value>(&body)
            && let Some(detail) = parse_antigravity_usage(&parsed)
        {
            reporter.publish(detail);
        }
        let translated = self.translator.translate_response(&request.model, &body);
        reporter.ensure_published();
        Ok(ExecuteOutcome {
            payload: Bytes::from(translated),
            updated_auth: refreshed,
        })
    }

    /// Streaming execution. Chunks arrive already translated to the client
    /// dialect; the receiver yields an error item if the upstream stream
    /// breaks mid-flight.
    pub async fn execute_stream(
        &self,
        auth: &Auth,
        request: &ExecuteRequest,
        cancel: &CancellationToken,
    ) -> ExecutorResult<StreamOutcome> {
        let base_model = base_model_name(&request.model).to_string();
        let (token, refreshed) = self.ensure_access_token(auth).await?;
        let auth_view = refreshed.clone().unwrap_or_else(|| auth.clone());

        if payload::is_claude_family(&base_model)
            && websearch::has_web_search_tool(request.client_payload())
        {
            debug!(event = "web_search_substitution", model = %request.model, is_stream = true);
            return self
                .web_search_stream(&auth_view, &token, request, refreshed, cancel)
                .await;
        }

        let reporter = Arc::new(self.reporter(&base_model, auth));
        let response = match self
            .send_recoverable(&auth_view, &token, &base_model, request, true, cancel)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                reporter.publish_failure();
                return Err(err);
            }
        };

        let (tx, rx) = mpsc::channel(32);
        let translator = self.translator.clone();
        let model = request.model.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            pump_stream(response, translator, model, reporter, tx, cancel).await;
        });
        Ok(StreamOutcome {
            chunks: rx,
            updated_auth: refreshed,
        })
    }

    /// Counts tokens upstream. The translated payload is sent with the
    /// envelope-only fields removed.
    pub async fn count_tokens(
        &self,
        auth: &Auth,
        request: &ExecuteRequest,
        cancel: &CancellationToken,
    ) -> ExecutorResult<ExecuteOutcome> {
        let base_model = base_model_name(&request.model).to_string();
        let (token, refreshed) = self.ensure_access_token(auth).await?;
        let auth_view = refreshed.clone().unwrap_or_else(|| auth.clone());

        let translated = self
            .translator
            .translate_request(&base_model, &request.payload, false);
        let mut parsed: Value = serde_json::from_slice(&translated)
            .map_err(|err| ExecutorError::InvalidRequest(format!("payload is not JSON: {err}")))?;
        delete_path(&mut parsed, &["project"]);
        delete_path(&mut parsed, &["model"]);
        delete_path(&mut parsed, &["request", "safetySettings"]);
        let body =
            serde_json::to_vec(&parsed).map_err(|err| ExecutorError::InvalidRequest(err.to_string()))?;

        let base_urls = payload::base_url_fallback(&auth_view);
        let mut last_error: Option<ExecutorError> = None;
        for (index, base) in base_urls.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ExecutorError::Cancelled);
            }
            let mut url = format!("{base}{}", payload::COUNT_TOKENS_PATH);
            if let Some(alt) = request.alt.as_deref() {
                url = format!("{url}?$alt={}", urlencoding::encode(alt));
            }
            let response = self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {token}"))
                .header("User-Agent", payload::resolve_user_agent(&auth_view))
                .header("Accept", "application/json")
                .body(body.clone())
                .send()
                .await;
            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    if cancel.is_cancelled() {
                        return Err(ExecutorError::Cancelled);
                    }
                    let transport = ExecutorError::Transport(err.to_string());
                    if index + 1 < base_urls.len() {
                        last_error = Some(transport);
                        continue;
                    }
                    return Err(transport);
                }
            };
            let status = response.status().as_u16();
            let bytes = response
                .bytes()
                .await
                .map_err(|err| ExecutorError::Transport(err.to_string()))?;
            if (200..300).contains(&status) {
                let parsed: Value = serde_json::from_slice(&bytes)
                    .map_err(|err| ExecutorError::Transport(err.to_string()))?;
                let total = parsed
                    .get("totalTokens")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                let translated =
                    self.translator
                        .translate_token_count(&request.model, total, &bytes);
                return Ok(ExecuteOutcome {
                    payload: Bytes::from(translated),
                    updated_auth: refreshed,
                });
            }
            if status == 429 && index + 1 < base_urls.len() {
                last_error = Some(ExecutorError::from_status(status, bytes.to_vec()));
                continue;
            }
            return Err(ExecutorError::from_status(status, bytes.to_vec()));
        }
        Err(last_error.unwrap_or_else(|| ExecutorError::Transport("no base url available".to_string())))
    }

    /// Fetches the available-models list, feeding the quota tracker with
    /// the same response body.
    pub async fn fetch_models(
        &self,
        auth: &Auth,
        cancel: &CancellationToken,
    ) -> ExecutorResult<(Vec<ModelInfo>, Option<Auth>)> {
        let (token, refreshed) = self.ensure_access_token(auth).await?;
        let mut auth_view = refreshed.clone().unwrap_or_else(|| auth.clone());

        let base_urls = payload::base_url_fallback(&auth_view);
        let mut last_error: Option<ExecutorError> = None;
        for (index, base) in base_urls.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ExecutorError::Cancelled);
            }
            let url = format!("{base}{}", payload::MODELS_PATH);
            let response = self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {token}"))
                .header("User-Agent", payload::resolve_user_agent(&auth_view))
                .body(b"{}".to_vec())
                .send()
                .await;
            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    if cancel.is_cancelled() {
                        return Err(ExecutorError::Cancelled);
                    }
                    let transport = ExecutorError::Transport(err.to_string());
                    if index + 1 < base_urls.len() {
                        last_error = Some(transport);
                        continue;
                    }
                    return Err(transport);
                }
            };
            let status = response.status().as_u16();
            let bytes = response
                .bytes()
                .await
                .map_err(|err| ExecutorError::Transport(err.to_string()))?;
            if !(200..300).contains(&status) {
                if status == 429 && index + 1 < base_urls.len() {
                    last_error = Some(ExecutorError::from_status(status, bytes.to_vec()));
                    continue;
                }
                return Err(ExecutorError::from_status(status, bytes.to_vec()));
            }

            let states_changed = self.tracker.update_quota_state(&mut auth_view, &bytes);
            let models = build_model_infos(&bytes);
            let updated = if refreshed.is_some() || states_changed {
                Some(auth_view)
            } else {
                None
            };
            return Ok((models, updated));
        }
        Err(last_error.unwrap_or_else(|| ExecutorError::Transport("no base url available".to_string())))
    }

    /// Forces a token refresh, returning the auth clone carrying the new
    /// tokens.
    pub async fn refresh(&self, auth: &Auth) -> ExecutorResult<Auth> {
        self.refresh_token(auth.clone()).await
    }

    fn reporter(&self, model: &str, auth: &Auth) -> UsageReporter {
        UsageReporter::new(self.collector.clone(), AUTH_TYPE, model, &auth.id)
    }

    /// Claude-family non-stream: streams upstream, folds, translates.
    async fn execute_folded(
        &self,
        auth: &Auth,
        base_model: &str,
        request: &ExecuteRequest,
        cancel: &CancellationToken,
    ) -> ExecutorResult<ExecuteOutcome> {
        let (token, refreshed) = self.ensure_access_token(auth).await?;
        let auth_view = refreshed.clone().unwrap_or_else(|| auth.clone());

        if payload::is_claude_family(base_model)
            && websearch::has_web_search_tool(request.client_payload())
        {
            debug!(event = "web_search_substitution", model = %request.model, is_stream = false);
            return self
                .web_search_response(&auth_view, &token, request, refreshed, cancel)
                .await;
        }

        let reporter = self.reporter(base_model, auth);
        let response = match self
            .send_recoverable(&auth_view, &token, base_model, request, true, cancel)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                reporter.publish_failure();
                return Err(err);
            }
        };

        let raw = match response.bytes().await {
            Ok(raw) => raw,
            Err(err) => {
                reporter.publish_failure();
                return Err(ExecutorError::Transport(err.to_string()));
            }
        };

        // Re-emit the filtered lines so usage is billed exactly like the
        // live streaming path, then fold into one body.
        let mut filtered = Vec::with_capacity(raw.len());
        for line in raw.split(|byte| *byte == b'\n') {
            let Some(mut value) = stream::json_payload(line) else {
                continue;
            };
            stream::filter_stream_usage_metadata(&mut value);
            if let Some(detail) = parse_antigravity_usage(&value) {
                reporter.publish(detail);
            }
            if let Ok(serialized) = serde_json::to_vec(&value) {
                filtered.extend_from_slice(&serialized);
                filtered.push(b'\n');
            }
        }
        let folded = stream::convert_stream_to_nonstream(&filtered);
        if let Ok(parsed) = serde_json::from_slice::<Value>(&folded)
            && let Some(detail) = parse_antigravity_usage(&parsed)
        {
            reporter.publish(detail);
        }
        let translated = self.translator.translate_response(&request.model, &folded);
        reporter.ensure_published();
        Ok(ExecuteOutcome {
            payload: Bytes::from(translated),
            updated_auth: refreshed,
        })
    }

    /// Sends the request, applying the one-shot signature-recovery retry
    /// when a Claude call fails on an invalid thinking signature.
    async fn send_recoverable(
        &self,
        auth: &Auth,
        token: &str,
        base_model: &str,
        request: &ExecuteRequest,
        stream_shape: bool,
        cancel: &CancellationToken,
    ) -> ExecutorResult<wreq::Response> {
        let first = self
            .roundtrip(auth, token, base_model, &request.payload, request.alt.as_deref(), stream_shape, false, cancel)
            .await;
        let err = match first {
            Ok(response) => return Ok(response),
            Err(err) => err,
        };
        let ExecutorError::UpstreamStatus { status, body } = &err else {
            return Err(err);
        };
        if !recovery::should_retry_with_recovery(*status, body.as_bytes(), base_model, false) {
            return Err(err);
        }
        let client_payload = request.client_payload();
        let recovered = recovery::convert_thinking_to_text(client_payload);
        if !recovery::payload_changed(client_payload, &recovered) {
            return Err(err);
        }
        debug!(event = "signature_recovery_retry", model = %base_model);
        match self
            .roundtrip(auth, token, base_model, &recovered, request.alt.as_deref(), stream_shape, true, cancel)
            .await
        {
            Ok(response) => Ok(response),
            // A second failure surfaces the original upstream error.
            Err(ExecutorError::UpstreamStatus { .. }) => Err(err),
            Err(other) => Err(other),
        }
    }

    /// Translate + shape + send with URL fallback and the retry policy.
    #[allow(clippy::too_many_arguments)]
    async fn roundtrip(
        &self,
        auth: &Auth,
        token: &str,
        base_model: &str,
        client_payload: &[u8],
        alt: Option<&str>,
        stream_shape: bool,
        recovery_attempt: bool,
        cancel: &CancellationToken,
    ) -> ExecutorResult<wreq::Response> {
        let translated = self
            .translator
            .translate_request(base_model, client_payload, stream_shape);
        let project_id = auth.metadata_str("project_id");
        let shaped =
            payload::shape_payload(&translated, base_model, project_id.as_deref(), recovery_attempt)?;
        self.send_with_retry(auth, token, base_model, &shaped, stream_shape, alt, cancel)
            .await
    }

    /// Non-stream JSON call (non-Claude models).
    async fn json_roundtrip(
        &self,
        auth: &Auth,
        token: &str,
        base_model: &str,
        request: &ExecuteRequest,
        stream_shape: bool,
        cancel: &CancellationToken,
    ) -> ExecutorResult<Vec<u8>> {
        let response = self
            .send_recoverable(auth, token, base_model, request, stream_shape, cancel)
            .await?;
        response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|err| ExecutorError::Transport(err.to_string()))
    }

    async fn send_with_retry(
        &self,
        auth: &Auth,
        token: &str,
        model: &str,
        body: &[u8],
        stream: bool,
        alt: Option<&str>,
        cancel: &CancellationToken,
    ) -> ExecutorResult<wreq::Response> {
        let base_urls = payload::base_url_fallback(auth);
        if base_urls.is_empty() {
            return Err(ExecutorError::Transport("no base url available".to_string()));
        }
        let attempts = retry_attempts(auth, &self.cfg);

        'attempts: for attempt in 0..attempts {
            let mut last_error: Option<ExecutorError> = None;
            for (index, base) in base_urls.iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(ExecutorError::Cancelled);
                }
                let url = build_request_url(base, stream, alt);
                self.log_upstream_request(auth, &url, model, stream, body);

                let send = self
                    .client
                    .post(&url)
                    .header("Content-Type", "application/json")
                    .header("Authorization", format!("Bearer {token}"))
                    .header("User-Agent", payload::resolve_user_agent(auth))
                    .header(
                        "Accept",
                        if stream { "text/event-stream" } else { "application/json" },
                    )
                    .body(body.to_vec())
                    .send();
                let response = tokio::select! {
                    _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
                    response = send => response,
                };
                let response = match response {
                    Ok(response) => response,
                    Err(err) => {
                        if cancel.is_cancelled() {
                            return Err(ExecutorError::Cancelled);
                        }
                        let transport = ExecutorError::Transport(err.to_string());
                        if index + 1 < base_urls.len() {
                            debug!(event = "upstream_fallback", from = %base, error = %transport);
                            last_error = Some(transport);
                            continue;
                        }
                        return Err(transport);
                    }
                };

                let status = response.status().as_u16();
                if (200..300).contains(&status) {
                    return Ok(response);
                }
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|err| ExecutorError::Transport(err.to_string()))?
                    .to_vec();
                debug!(
                    event = "upstream_error",
                    status = status,
                    body = %crate::poller::summarize_payload(&bytes),
                );
                if status == 429 && index + 1 < base_urls.len() {
                    last_error = Some(ExecutorError::from_status(status, bytes));
                    continue;
                }
                if is_no_capacity(status, &bytes) {
                    if index + 1 < base_urls.len() {
                        last_error = Some(ExecutorError::NoCapacity {
                            body: String::from_utf8_lossy(&bytes).into_owned(),
                        });
                        continue;
                    }
                    if attempt + 1 < attempts {
                        let delay = no_capacity_delay(attempt);
                        debug!(
                            event = "no_capacity_retry",
                            model = %model,
                            attempt = attempt + 1,
                            attempts = attempts,
                            delay_ms = delay.as_millis() as u64,
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue 'attempts;
                    }
                    return Err(ExecutorError::NoCapacity {
                        body: String::from_utf8_lossy(&bytes).into_owned(),
                    });
                }
                return Err(ExecutorError::from_status(status, bytes));
            }
            if let Some(err) = last_error {
                return Err(err);
            }
        }
        Err(ExecutorError::Transport("no base url available".to_string()))
    }

    fn log_upstream_request(&self, auth: &Auth, url: &str, model: &str, stream: bool, body: &[u8]) {
        if self.cfg.request_log {
            debug!(
                event = "upstream_request",
                auth_id = %auth.id,
                url = %url,
                model = %model,
                is_stream = stream,
                body = %String::from_utf8_lossy(body),
            );
        } else {
            debug!(
                event = "upstream_request",
                auth_id = %auth.id,
                url = %url,
                model = %model,
                is_stream = stream,
            );
        }
    }

    async fn ensure_access_token(&self, auth: &Auth) -> ExecutorResult<(String, Option<Auth>)> {
        let access_token = auth.metadata_str("access_token").unwrap_or_default();
        let now = OffsetDateTime::now_utc();
        if !access_token.is_empty()
            && token_expiry(auth).is_some_and(|expiry| expiry > now + REFRESH_SKEW)
        {
            return Ok((access_token, None));
        }
        let updated = self.refresh_token(auth.clone()).await?;
        let token = updated.metadata_str("access_token").unwrap_or_default();
        if token.is_empty() {
            return Err(ExecutorError::Unauthorized("missing access token".to_string()));
        }
        Ok((token, Some(updated)))
    }

    async fn refresh_token(&self, mut auth: Auth) -> ExecutorResult<Auth> {
        let Some(refresh_token) = auth.metadata_str("refresh_token") else {
            return Err(ExecutorError::Unauthorized("missing refresh token".to_string()));
        };

        let form = RefreshForm {
            client_id: CLIENT_ID,
            client_secret: CLIENT_SECRET,
            grant_type: "refresh_token",
            refresh_token: &refresh_token,
        };
        let response = self
            .client
            .post(TOKEN_URL)
            .header("User-Agent", payload::DEFAULT_USER_AGENT)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .form(&form)
            .send()
            .await
            .map_err(|err| ExecutorError::Transport(err.to_string()))?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ExecutorError::Transport(err.to_string()))?;
        if !(200..300).contains(&status) {
            let body = String::from_utf8_lossy(&bytes).into_owned();
            return Err(match status {
                429 => ExecutorError::RateLimited {
                    retry_after: parse_retry_delay(&bytes),
                    body,
                },
                _ => ExecutorError::Unauthorized(format!("token refresh failed ({status}): {body}")),
            });
        }
        let tokens: TokenResponse = serde_json::from_slice(&bytes)
            .map_err(|err| ExecutorError::Unauthorized(format!("token response: {err}")))?;

        let now = OffsetDateTime::now_utc();
        auth.metadata
            .insert("access_token".to_string(), Value::String(tokens.access_token.clone()));
        if let Some(new_refresh) = tokens.refresh_token.filter(|t| !t.is_empty()) {
            auth.metadata
                .insert("refresh_token".to_string(), Value::String(new_refresh));
        }
        let expires_in = tokens.expires_in.unwrap_or(0);
        auth.metadata
            .insert("expires_in".to_string(), Value::from(expires_in));
        auth.metadata.insert(
            "timestamp".to_string(),
            Value::from((now.unix_timestamp_nanos() / 1_000_000) as i64),
        );
        if let Ok(expired) = (now + Duration::seconds(expires_in)).format(&Rfc3339) {
            auth.metadata
                .insert("expired".to_string(), Value::String(expired));
        }
        auth.metadata
            .insert("type".to_string(), Value::String(AUTH_TYPE.to_string()));

        if let Err(err) = self
            .ensure_project_id(&mut auth, &tokens.access_token)
            .await
        {
            warn!(event = "project_id_resolve", auth_id = %auth.id, error = %err);
        }
        Ok(auth)
    }

    async fn ensure_project_id(&self, auth: &mut Auth, access_token: &str) -> ExecutorResult<()> {
        if auth.metadata_str("project_id").is_some() {
            return Ok(());
        }
        let base = payload::base_url_fallback(auth)
            .into_iter()
            .next()
            .unwrap_or_else(|| payload::BASE_URL_DAILY.to_string());
        let user_agent = payload::resolve_user_agent(auth);
        let project_id =
            project::detect_project_id(&self.client, access_token, &base, &user_agent).await?;
        if let Some(project_id) = project_id.filter(|id| !id.trim().is_empty()) {
            auth.metadata.insert(
                "project_id".to_string(),
                Value::String(project_id.trim().to_string()),
            );
        }
        Ok(())
    }

    /// One `googleSearch` call on the web-search model, walking the same
    /// base-URL fallback but treating every failure as "try the next".
    async fn gemini_web_search(
        &self,
        auth: &Auth,
        token: &str,
        query: &str,
        cancel: &CancellationToken,
    ) -> ExecutorResult<Vec<u8>> {
        if query.is_empty() {
            return Err(ExecutorError::InvalidRequest(
                "no user query found for web search".to_string(),
            ));
        }
        let mut search = websearch::build_search_request(query);
        payload::apply_internal_envelope(
            &mut search,
            websearch::WEB_SEARCH_MODEL,
            auth.metadata_str("project_id").as_deref(),
        );
        let body = serde_json::to_vec(&search)
            .map_err(|err| ExecutorError::InvalidRequest(err.to_string()))?;

        for base in payload::base_url_fallback(auth) {
            if cancel.is_cancelled() {
                return Err(ExecutorError::Cancelled);
            }
            let url = format!("{base}{}", payload::GENERATE_PATH);
            let response = self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {token}"))
                .header("User-Agent", payload::resolve_user_agent(auth))
                .header("Accept", "application/json")
                .body(body.clone())
                .send()
                .await;
            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    debug!(event = "web_search", error = %err);
                    continue;
                }
            };
            let status = response.status().as_u16();
            let Ok(bytes) = response.bytes().await else {
                continue;
            };
            if !(200..300).contains(&status) {
                debug!(event = "web_search", status = status);
                continue;
            }
            return Ok(bytes.to_vec());
        }
        Err(ExecutorError::Transport("web search failed".to_string()))
    }

    async fn web_search_response(
        &self,
        auth: &Auth,
        token: &str,
        request: &ExecuteRequest,
        refreshed: Option<Auth>,
        cancel: &CancellationToken,
    ) -> ExecutorResult<ExecuteOutcome> {
        let reporter = self.reporter(&request.model, auth);
        let Some(query) = websearch::extract_user_query(request.client_payload()) else {
            reporter.publish_failure();
            return Err(ExecutorError::InvalidRequest(
                "no user query found for web search".to_string(),
            ));
        };
        let gemini_resp = match self.gemini_web_search(auth, token, &query, cancel).await {
            Ok(gemini_resp) => gemini_resp,
            Err(err) => {
                reporter.publish_failure();
                return Err(err);
            }
        };
        if let Ok(parsed) = serde_json::from_slice::<Value>(&gemini_resp)
            && let Some(detail) = parse_antigravity_usage(&parsed)
        {
            reporter.publish(detail);
        }
        let claude = websearch::gemini_to_claude_response(&request.model, &gemini_resp);
        reporter.ensure_published();
        Ok(ExecuteOutcome {
            payload: Bytes::from(claude),
            updated_auth: refreshed,
        })
    }

    async fn web_search_stream(
        &self,
        auth: &Auth,
        token: &str,
        request: &ExecuteRequest,
        refreshed: Option<Auth>,
        cancel: &CancellationToken,
    ) -> ExecutorResult<StreamOutcome> {
        let reporter = self.reporter(&request.model, auth);
        let Some(query) = websearch::extract_user_query(request.client_payload()) else {
            reporter.publish_failure();
            return Err(ExecutorError::InvalidRequest(
                "no user query found for web search".to_string(),
            ));
        };
        let gemini_resp = match self.gemini_web_search(auth, token, &query, cancel).await {
            Ok(gemini_resp) => gemini_resp,
            Err(err) => {
                reporter.publish_failure();
                return Err(err);
            }
        };
        if let Ok(parsed) = serde_json::from_slice::<Value>(&gemini_resp)
            && let Some(detail) = parse_antigravity_usage(&parsed)
        {
            reporter.publish(detail);
        }

        let (tx, rx) = mpsc::channel(32);
        let events = websearch::gemini_to_claude_sse(&request.model, &gemini_resp);
        tokio::spawn(async move {
            for event in events {
                if tx.send(Ok(Bytes::from(event))).await.is_err() {
                    return;
                }
            }
            reporter.ensure_published();
        });
        Ok(StreamOutcome {
            chunks: rx,
            updated_auth: refreshed,
        })
    }
}

async fn pump_stream(
    response: wreq::Response,
    translator: Arc<dyn DialectTranslator>,
    model: String,
    reporter: Arc<UsageReporter>,
    tx: mpsc::Sender<ExecutorResult<Bytes>>,
    cancel: CancellationToken,
) {
    let mut scanner = stream::LineScanner::default();
    let mut body = response.bytes_stream();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return,
            chunk = body.next() => chunk,
        };
        match chunk {
            None => break,
            Some(Err(err)) => {
                reporter.publish_failure();
                let _ = tx
                    .send(Err(ExecutorError::Transport(err.to_string())))
                    .await;
                return;
            }
            Some(Ok(bytes)) => {
                scanner.push(&bytes);
                while let Some(line) = scanner.next_line() {
                    if !emit_line(&line, &translator, &model, &reporter, &tx).await {
                        return;
                    }
                }
            }
        }
    }
    if let Some(tail) = scanner.finish()
        && !emit_line(&tail, &translator, &model, &reporter, &tx).await
    {
        return;
    }
    for chunk in translator.translate_done(&model) {
        if tx.send(Ok(Bytes::from(chunk))).await.is_err() {
            return;
        }
    }
    reporter.ensure_published();
}

async fn emit_line(
    line: &[u8],
    translator: &Arc<dyn DialectTranslator>,
    model: &str,
    reporter: &Arc<UsageReporter>,
    tx: &mpsc::Sender<ExecutorResult<Bytes>>,
) -> bool {
    let Some(mut value) = stream::json_payload(line) else {
        return true;
    };
    stream::filter_stream_usage_metadata(&mut value);
    if let Some(detail) = parse_antigravity_usage(&value) {
        reporter.publish(detail);
    }
    let Ok(serialized) = serde_json::to_vec(&value) else {
        return true;
    };
    for chunk in translator.translate_chunk(model, &serialized) {
        if tx.send(Ok(Bytes::from(chunk))).await.is_err() {
            return false;
        }
    }
    true
}

fn build_request_url(base: &str, stream: bool, alt: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    let path = if stream {
        payload::STREAM_PATH
    } else {
        payload::GENERATE_PATH
    };
    match alt {
        Some(alt) if !alt.is_empty() => {
            format!("{base}{path}?$alt={}", urlencoding::encode(alt))
        }
        _ if stream => format!("{base}{path}?alt=sse"),
        _ => format!("{base}{path}"),
    }
}

fn token_expiry(auth: &Auth) -> Option<OffsetDateTime> {
    if let Some(raw) = auth.metadata_str("expired")
        && let Ok(parsed) = OffsetDateTime::parse(&raw, &Rfc3339)
    {
        return Some(parsed);
    }
    let expires_in = auth.metadata_i64("expires_in")?;
    let timestamp_ms = auth.metadata_i64("timestamp")?;
    let issued = OffsetDateTime::from_unix_timestamp_nanos(timestamp_ms as i128 * 1_000_000).ok()?;
    Some(issued + Duration::seconds(expires_in))
}

fn retry_attempts(auth: &Auth, cfg: &Config) -> i64 {
    let mut retry = cfg.request_retry;
    if let Some(override_retry) = auth.request_retry_override() {
        retry = override_retry;
    }
    if retry < 0 {
        retry = 0;
    }
    (retry + 1).max(1)
}

fn is_no_capacity(status: u16, body: &[u8]) -> bool {
    if status != 503 || body.is_empty() {
        return false;
    }
    String::from_utf8_lossy(body)
        .to_lowercase()
        .contains("no capacity available")
}

fn no_capacity_delay(attempt: i64) -> StdDuration {
    let attempt = attempt.max(0) as u64;
    StdDuration::from_millis(((attempt + 1) * 250).min(2000))
}

fn build_model_infos(body: &[u8]) -> Vec<ModelInfo> {
    let Ok(root) = serde_json::from_slice::<Value>(body) else {
        return Vec::new();
    };
    let Some(models) = root.get("models").and_then(Value::as_object) else {
        return Vec::new();
    };
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let config = antigravity_model_config();
    let mut out = Vec::with_capacity(models.len());
    for (raw_id, record) in models {
        let id = raw_id.trim();
        if id.is_empty() || MODEL_DENYLIST.contains(&id) {
            continue;
        }
        let display_name = record
            .get("displayName")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .unwrap_or(id);
        let mut info = ModelInfo {
            id: id.to_string(),
            name: id.to_string(),
            display_name: display_name.to_string(),
            owned_by: AUTH_TYPE.to_string(),
            created: now,
            thinking: None,
            max_completion_tokens: None,
        };
        if let Some(model_cfg) = config.get(id) {
            info.thinking = model_cfg.thinking;
            info.max_completion_tokens = model_cfg.max_completion_tokens;
        }
        out.push(info);
    }
    out.sort_by(|a, b| a.id.cmp(&b.id));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_attempts_prefers_auth_override() {
        let cfg = Config {
            request_retry: 2,
            ..Default::default()
        };
        let mut auth = Auth::default();
        assert_eq!(retry_attempts(&auth, &cfg), 3);
        auth.request_retry = Some(0);
        assert_eq!(retry_attempts(&auth, &cfg), 1);
        auth.request_retry = Some(-4);
        assert_eq!(retry_attempts(&auth, &cfg), 1);
    }

    #[test]
    fn no_capacity_detection_requires_503_and_marker() {
        assert!(is_no_capacity(503, b"upstream has no capacity available now"));
        assert!(!is_no_capacity(503, b"something else"));
        assert!(!is_no_capacity(429, b"no capacity available"));
        assert!(!is_no_capacity(503, b""));
    }

    #[test]
    fn no_capacity_delay_is_capped() {
        assert_eq!(no_capacity_delay(0), StdDuration::from_millis(250));
        assert_eq!(no_capacity_delay(3), StdDuration::from_millis(1000));
        assert_eq!(no_capacity_delay(50), StdDuration::from_secs(2));
    }

    #[test]
    fn request_url_honors_alt_and_stream() {
        assert_eq!(
            build_request_url("https://h", true, None),
            "https://h/v1internal:streamGenerateContent?alt=sse"
        );
        assert_eq!(
            build_request_url("https://h/", false, None),
            "https://h/v1internal:generateContent"
        );
        assert_eq!(
            build_request_url("https://h", false, Some("json")),
            "https://h/v1internal:generateContent?$alt=json"
        );
    }

    #[test]
    fn token_expiry_reads_both_shapes() {
        let mut auth = Auth::default();
        assert_eq!(token_expiry(&auth), None);

        auth.metadata.insert(
            "expired".to_string(),
            Value::String("2026-01-01T00:00:00Z".to_string()),
        );
        assert_eq!(token_expiry(&auth).unwrap().year(), 2026);

        let mut auth = Auth::default();
        auth.metadata.insert("expires_in".to_string(), Value::from(3600));
        auth.metadata
            .insert("timestamp".to_string(), Value::from(1_750_000_000_000i64));
        let expiry = token_expiry(&auth).unwrap();
        assert_eq!(
            expiry.unix_timestamp(),
            1_750_000_000 + 3600
        );
    }

    #[test]
    fn model_list_applies_denylist_and_config() {
        let body = serde_json::to_vec(&serde_json::json!({
            "models": {
                "claude-sonnet-4-5-thinking": {"displayName": "Claude Sonnet 4.5 (Thinking)"},
                "gemini-3-pro-low": {"displayName": "hidden"},
                "chat_20706": {},
                "gemini-3-flash": {}
            }
        }))
        .unwrap();
        let models = build_model_infos(&body);
        let ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["claude-sonnet-4-5-thinking", "gemini-3-flash"]);
        assert_eq!(models[0].display_name, "Claude Sonnet 4.5 (Thinking)");
        assert!(models[0].thinking.is_some());
        assert_eq!(models[1].display_name, "gemini-3-flash");
    }
}
