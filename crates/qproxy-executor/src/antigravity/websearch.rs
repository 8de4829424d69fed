//! Web-search substitution for Claude-family requests.
//!
//! Claude on Antigravity has no native web_search tool. When the client
//! request carries one, the executor never calls Claude: it runs a single
//! `googleSearch` generate-content call on `gemini-2.5-flash` and
//! synthesizes a Claude-shape response (or SSE stream) from the grounding
//! metadata.

use serde_json::{Map, Value, json};
use time::OffsetDateTime;

use crate::json::get_path;

pub(crate) const WEB_SEARCH_MODEL: &str = "gemini-2.5-flash";

/// Whether the client payload carries a tool whose type begins with
/// `web_search`.
pub(crate) fn has_web_search_tool(payload: &[u8]) -> bool {
    let Ok(root) = serde_json::from_slice::<Value>(payload) else {
        return false;
    };
    let Some(tools) = root.get("tools").and_then(Value::as_array) else {
        return false;
    };
    tools.iter().any(|tool| {
        tool.get("type")
            .and_then(Value::as_str)
            .is_some_and(|tool_type| tool_type.starts_with("web_search"))
    })
}

/// Last user message text from a Claude-format payload; the search query.
pub(crate) fn extract_user_query(payload: &[u8]) -> Option<String> {
    let root: Value = serde_json::from_slice(payload).ok()?;
    let messages = root.get("messages")?.as_array()?;
    for message in messages.iter().rev() {
        if message.get("role").and_then(Value::as_str) != Some("user") {
            continue;
        }
        let content = message.get("content")?;
        if let Some(text) = content.as_str() {
            return Some(text.to_string());
        }
        if let Some(items) = content.as_array() {
            for item in items {
                if item.get("type").and_then(Value::as_str) == Some("text")
                    && let Some(text) = item.get("text").and_then(Value::as_str)
                {
                    return Some(text.to_string());
                }
            }
        }
    }
    None
}

/// Bare search request: one user turn plus the googleSearch tool. The
/// caller runs it through the normal envelope stamping.
pub(crate) fn build_search_request(query: &str) -> Value {
    json!({
        "model": WEB_SEARCH_MODEL,
        "request": {
            "contents": [{"role": "user", "parts": [{"text": query}]}],
            "tools": [{"googleSearch": {}}]
        }
    })
}

/// Removes every `google.com` URL from the text.
pub(crate) fn strip_google_urls(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while !rest.is_empty() {
        if let Some(len) = match_google_url(rest) {
            rest = &rest[len..];
            continue;
        }
        let mut chars = rest.chars();
        if let Some(ch) = chars.next() {
            out.push(ch);
        }
        rest = chars.as_str();
    }
    out.trim().to_string()
}

fn match_google_url(text: &str) -> Option<usize> {
    let scheme_len = if text.starts_with("https://") {
        8
    } else if text.starts_with("http://") {
        7
    } else {
        return None;
    };
    let after_scheme = &text[scheme_len..];
    let host_len = after_scheme
        .bytes()
        .take_while(|byte| byte.is_ascii_alphanumeric() || *byte == b'.' || *byte == b'-')
        .count();
    if !after_scheme[..host_len].contains("google.com") {
        return None;
    }
    let url_len = after_scheme
        .chars()
        .take_while(|ch| !ch.is_whitespace())
        .map(char::len_utf8)
        .sum::<usize>();
    Some(scheme_len + url_len)
}

struct SearchView {
    text: String,
    search_query: String,
    results: Vec<Value>,
    input_tokens: i64,
    output_tokens: i64,
}

fn search_view(gemini_resp: &[u8]) -> SearchView {
    let root: Value = serde_json::from_slice(gemini_resp).unwrap_or_default();

    let parts = get_path(&root, &["response", "candidates"])
        .or_else(|| root.get("candidates"))
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| get_path(candidate, &["content", "parts"]))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut text = String::new();
    for part in &parts {
        if let Some(chunk) = part.get("text").and_then(Value::as_str) {
            text.push_str(chunk);
        }
    }
    let text = strip_google_urls(&text);

    let grounding = get_path(&root, &["response", "candidates"])
        .or_else(|| root.get("candidates"))
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("groundingMetadata"))
        .cloned()
        .unwrap_or_default();

    let search_query = grounding
        .get("webSearchQueries")
        .and_then(Value::as_array)
        .and_then(|queries| queries.first())
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut results = Vec::new();
    if let Some(chunks) = grounding.get("groundingChunks").and_then(Value::as_array) {
        for chunk in chunks {
            let Some(web) = chunk.get("web") else {
                continue;
            };
            let mut result = Map::new();
            result.insert("type".to_string(), json!("web_search_result"));
            result.insert("page_age".to_string(), Value::Null);
            if let Some(title) = web.get("title").and_then(Value::as_str) {
                result.insert("title".to_string(), json!(title));
            }
            if let Some(uri) = web.get("uri").and_then(Value::as_str)
                && !uri.contains("vertexaisearch.cloud.google.com")
            {
                result.insert("url".to_string(), json!(uri));
            }
            if let Some(domain) = web.get("domain").and_then(Value::as_str) {
                result.insert("encrypted_content".to_string(), json!(domain));
            }
            results.push(Value::Object(result));
        }
    }

    let usage_path =
        |key: &str| -> i64 {
            get_path(&root, &["response", "usageMetadata", key])
                .or_else(|| get_path(&root, &["usageMetadata", key]))
                .and_then(Value::as_i64)
                .unwrap_or(0)
        };

    SearchView {
        text,
        search_query,
        results,
        input_tokens: usage_path("promptTokenCount"),
        output_tokens: usage_path("candidatesTokenCount"),
    }
}

fn message_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("msg_{}", &id[..24])
}

fn tool_use_id() -> String {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    format!("srvtoolu_{nanos}")
}

/// Synthesizes a Claude non-stream message from the Gemini search
/// response: a `server_tool_use` block, a `web_search_tool_result` block,
/// then the (URL-stripped) answer text.
pub(crate) fn gemini_to_claude_response(model: &str, gemini_resp: &[u8]) -> Vec<u8> {
    let view = search_view(gemini_resp);
    let tool_use = tool_use_id();

    let mut content = vec![json!({
        "type": "server_tool_use",
        "id": tool_use,
        "name": "web_search",
        "input": {"query": view.search_query}
    })];
    if !view.results.is_empty() {
        content.push(json!({
            "type": "web_search_tool_result",
            "tool_use_id": tool_use,
            "content": view.results
        }));
    }
    if !view.text.is_empty() {
        content.push(json!({"type": "text", "text": view.text}));
    }

    let response = json!({
        "id": message_id(),
        "type": "message",
        "role": "assistant",
        "content": content,
        "model": model,
        "stop_reason": "end_turn",
        "stop_sequence": null,
        "usage": {
            "input_tokens": view.input_tokens,
            "output_tokens": view.output_tokens,
            "server_tool_use": {"web_search_requests": 1}
        }
    });
    serde_json::to_vec(&response).unwrap_or_default()
}

/// Same synthesis as a Claude SSE event sequence.
pub(crate) fn gemini_to_claude_sse(model: &str, gemini_resp: &[u8]) -> Vec<String> {
    let view = search_view(gemini_resp);
    let tool_use = tool_use_id();
    let mut events = Vec::new();
    let mut push = |event: &str, data: Value| {
        events.push(format!("event: {event}\ndata: {data}\n\n"));
    };

    push(
        "message_start",
        json!({"type": "message_start", "message": {
            "id": message_id(), "type": "message", "role": "assistant", "content": [],
            "model": model, "stop_reason": null, "stop_sequence": null,
            "usage": {"input_tokens": view.input_tokens, "output_tokens": 0}
        }}),
    );

    let mut index = 0;
    push(
        "content_block_start",
        json!({"type": "content_block_start", "index": index, "content_block": {
            "type": "server_tool_use", "id": tool_use, "name": "web_search", "input": {}
        }}),
    );
    if !view.search_query.is_empty() {
        let partial = json!({"query": view.search_query}).to_string();
        push(
            "content_block_delta",
            json!({"type": "content_block_delta", "index": index, "delta": {
                "type": "input_json_delta", "partial_json": partial
            }}),
        );
    }
    push(
        "content_block_stop",
        json!({"type": "content_block_stop", "index": index}),
    );
    index += 1;

    if !view.results.is_empty() {
        push(
            "content_block_start",
            json!({"type": "content_block_start", "index": index, "content_block": {
                "type": "web_search_tool_result", "tool_use_id": tool_use, "content": view.results
            }}),
        );
        push(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": index}),
        );
        index += 1;
    }

    if !view.text.is_empty() {
        push(
            "content_block_start",
            json!({"type": "content_block_start", "index": index, "content_block": {
                "type": "text", "text": ""
            }}),
        );
        // Chunk on char boundaries so multi-byte text never splits.
        let chars: Vec<char> = view.text.chars().collect();
        for chunk in chars.chunks(50) {
            let text: String = chunk.iter().collect();
            push(
                "content_block_delta",
                json!({"type": "content_block_delta", "index": index, "delta": {
                    "type": "text_delta", "text": text
                }}),
            );
        }
        push(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": index}),
        );
    }

    push(
        "message_delta",
        json!({"type": "message_delta", "delta": {"stop_reason": "end_turn", "stop_sequence": null},
            "usage": {"input_tokens": view.input_tokens, "output_tokens": view.output_tokens,
                "server_tool_use": {"web_search_requests": 1}}}),
    );
    push("message_stop", json!({"type": "message_stop"}));
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gemini_response() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "response": {
                "candidates": [{
                    "content": {"role": "model", "parts": [
                        {"text": "Rust 1.89 is out. See https://www.google.com/search?q=rust for more. Details follow."}
                    ]},
                    "groundingMetadata": {
                        "webSearchQueries": ["rust 1.89 release"],
                        "groundingChunks": [
                            {"web": {"title": "Rust Blog", "uri": "https://blog.rust-lang.org/x", "domain": "blog.rust-lang.org"}},
                            {"web": {"title": "Redirect", "uri": "https://vertexaisearch.cloud.google.com/redirect", "domain": "example.com"}},
                            {"notweb": {}}
                        ]
                    }
                }],
                "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 34}
            }
        }))
        .unwrap()
    }

    #[test]
    fn detects_web_search_tool_types() {
        let payload = serde_json::to_vec(&json!({
            "tools": [{"type": "web_search_20250305", "name": "web_search"}]
        }))
        .unwrap();
        assert!(has_web_search_tool(&payload));

        let other = serde_json::to_vec(&json!({"tools": [{"type": "custom"}]})).unwrap();
        assert!(!has_web_search_tool(&other));
        assert!(!has_web_search_tool(b"{}"));
    }

    #[test]
    fn extracts_last_user_query_from_both_shapes() {
        let payload = serde_json::to_vec(&json!({
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "reply"},
                {"role": "user", "content": [{"type": "text", "text": "latest question"}]}
            ]
        }))
        .unwrap();
        assert_eq!(extract_user_query(&payload).as_deref(), Some("latest question"));
    }

    #[test]
    fn google_urls_are_stripped_from_text() {
        let text = "See https://www.google.com/search?q=x and http://maps.google.com/a, keep https://example.com/page.";
        let stripped = strip_google_urls(text);
        assert!(!stripped.contains("google.com"));
        assert!(stripped.contains("https://example.com/page"));
    }

    #[test]
    fn claude_response_carries_tool_use_results_and_text() {
        let response = gemini_to_claude_response("claude-sonnet-4-5", &gemini_response());
        let root: Value = serde_json::from_slice(&response).unwrap();

        let content = root["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], json!("server_tool_use"));
        assert_eq!(content[0]["input"]["query"], json!("rust 1.89 release"));

        assert_eq!(content[1]["type"], json!("web_search_tool_result"));
        let results = content[1]["content"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["url"], json!("https://blog.rust-lang.org/x"));
        assert_eq!(results[0]["encrypted_content"], json!("blog.rust-lang.org"));
        // The vertexaisearch redirect keeps its domain but loses the URL.
        assert!(results[1].get("url").is_none());

        assert_eq!(content[2]["type"], json!("text"));
        assert!(!content[2]["text"].as_str().unwrap().contains("google.com"));

        assert_eq!(root["usage"]["input_tokens"], json!(12));
        assert_eq!(root["usage"]["output_tokens"], json!(34));
        assert_eq!(root["usage"]["server_tool_use"]["web_search_requests"], json!(1));
    }

    #[test]
    fn sse_stream_is_well_formed() {
        let events = gemini_to_claude_sse("claude-sonnet-4-5", &gemini_response());
        assert!(events[0].starts_with("event: message_start\n"));
        assert!(events.last().unwrap().contains("message_stop"));
        let stops = events.iter().filter(|e| e.contains("content_block_stop")).count();
        let starts = events.iter().filter(|e| e.contains("content_block_start")).count();
        assert_eq!(starts, stops);
        assert!(events.iter().any(|e| e.contains("web_search_tool_result")));
        assert!(events.iter().any(|e| e.contains("input_json_delta")));
    }
}
