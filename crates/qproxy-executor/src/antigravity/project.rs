//! Project-id resolution against the code-assist endpoints.
//!
//! Accounts onboarded by the desktop client already carry a
//! `cloudaicompanionProject`; fresh accounts need an explicit onboard
//! round-trip with the default tier.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use crate::error::{ExecutorError, ExecutorResult};

const ONBOARD_POLL_ATTEMPTS: usize = 5;
const ONBOARD_POLL_DELAY: Duration = Duration::from_secs(2);

pub(crate) async fn detect_project_id(
    client: &Arc<wreq::Client>,
    access_token: &str,
    base_url: &str,
    user_agent: &str,
) -> ExecutorResult<Option<String>> {
    if let Some(project_id) = try_load_code_assist(client, access_token, base_url, user_agent).await?
    {
        return Ok(Some(project_id));
    }
    try_onboard_user(client, access_token, base_url, user_agent).await
}

async fn post_internal(
    client: &Arc<wreq::Client>,
    access_token: &str,
    url: String,
    user_agent: &str,
    body: &Value,
) -> ExecutorResult<(u16, Vec<u8>)> {
    let body = serde_json::to_vec(body).map_err(|err| ExecutorError::Transport(err.to_string()))?;
    let response = client
        .post(url)
        .header("Authorization", format!("Bearer {access_token}"))
        .header("User-Agent", user_agent)
        .header("Content-Type", "application/json")
        .header("Accept-Encoding", "gzip")
        .body(body)
        .send()
        .await
        .map_err(|err| ExecutorError::Transport(err.to_string()))?;
    let status = response.status().as_u16();
    let payload = response
        .bytes()
        .await
        .map_err(|err| ExecutorError::Transport(err.to_string()))?;
    Ok((status, payload.to_vec()))
}

fn onboard_metadata() -> Value {
    json!({
        "metadata": {
            "ideType": "ANTIGRAVITY",
            "platform": "PLATFORM_UNSPECIFIED",
            "pluginType": "GEMINI"
        }
    })
}

async fn try_load_code_assist(
    client: &Arc<wreq::Client>,
    access_token: &str,
    base_url: &str,
    user_agent: &str,
) -> ExecutorResult<Option<String>> {
    let url = format!("{}/v1internal:loadCodeAssist", base_url.trim_end_matches('/'));
    let (status, payload) =
        post_internal(client, access_token, url, user_agent, &onboard_metadata()).await?;
    if !(200..300).contains(&status) {
        return Err(ExecutorError::from_status(status, payload));
    }
    let root: Value = serde_json::from_slice(&payload)
        .map_err(|err| ExecutorError::Transport(err.to_string()))?;
    if root.get("currentTier").is_none_or(Value::is_null) {
        return Ok(None);
    }
    Ok(root
        .get("cloudaicompanionProject")
        .and_then(Value::as_str)
        .map(str::to_string))
}

async fn try_onboard_user(
    client: &Arc<wreq::Client>,
    access_token: &str,
    base_url: &str,
    user_agent: &str,
) -> ExecutorResult<Option<String>> {
    let tier_id = get_onboard_tier(client, access_token, base_url, user_agent).await;
    let url = format!("{}/v1internal:onboardUser", base_url.trim_end_matches('/'));
    let mut body = onboard_metadata();
    body["tierId"] = json!(tier_id);

    for _ in 0..ONBOARD_POLL_ATTEMPTS {
        let (status, payload) =
            post_internal(client, access_token, url.clone(), user_agent, &body).await?;
        if !(200..300).contains(&status) {
            return Err(ExecutorError::from_status(status, payload));
        }
        let root: Value = serde_json::from_slice(&payload)
            .map_err(|err| ExecutorError::Transport(err.to_string()))?;
        if root.get("done").and_then(Value::as_bool) == Some(true) {
            let project = root
                .get("response")
                .and_then(|response| response.get("cloudaicompanionProject"));
            let project_id = project
                .and_then(|value| value.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| project.and_then(Value::as_str).map(str::to_string));
            return Ok(project_id);
        }
        tokio::time::sleep(ONBOARD_POLL_DELAY).await;
    }
    Ok(None)
}

async fn get_onboard_tier(
    client: &Arc<wreq::Client>,
    access_token: &str,
    base_url: &str,
    user_agent: &str,
) -> String {
    let url = format!("{}/v1internal:loadCodeAssist", base_url.trim_end_matches('/'));
    let Ok((status, payload)) =
        post_internal(client, access_token, url, user_agent, &onboard_metadata()).await
    else {
        return "LEGACY".to_string();
    };
    if !(200..300).contains(&status) {
        return "LEGACY".to_string();
    }
    let Ok(root) = serde_json::from_slice::<Value>(&payload) else {
        return "LEGACY".to_string();
    };
    let tiers = root
        .get("allowedTiers")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for tier in tiers {
        if tier.get("isDefault").and_then(Value::as_bool) == Some(true)
            && let Some(id) = tier.get("id").and_then(Value::as_str)
        {
            return id.to_string();
        }
    }
    "LEGACY".to_string()
}
