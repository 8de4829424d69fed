//! Streaming response plumbing: NDJSON line scanning, usage-metadata
//! filtering, and folding a stream back into a single response body.

use bytes::{Bytes, BytesMut};
use serde_json::{Map, Value, json};

use crate::json::get_path;

/// Splits an upstream byte stream into lines. The upstream emits one JSON
/// document (optionally `data: `-prefixed SSE) per line.
#[derive(Debug, Default)]
pub(crate) struct LineScanner {
    buffer: BytesMut,
}

impl LineScanner {
    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub(crate) fn next_line(&mut self) -> Option<Bytes> {
        let index = self.buffer.iter().position(|byte| *byte == b'\n')?;
        let mut line = self.buffer.split_to(index + 1);
        line.truncate(index);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Some(line.freeze())
    }

    /// Remaining bytes once the stream has ended.
    pub(crate) fn finish(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.buffer.split().freeze())
    }
}

/// Extracts the JSON document from a raw stream line, stripping an SSE
/// `data:` prefix. Blank and non-JSON lines yield `None`.
pub(crate) fn json_payload(line: &[u8]) -> Option<Value> {
    let text = std::str::from_utf8(line).ok()?.trim();
    let text = text.strip_prefix("data:").map(str::trim).unwrap_or(text);
    if text.is_empty() || !(text.starts_with('{') || text.starts_with('[')) {
        return None;
    }
    serde_json::from_str(text).ok()
}

/// Renames `usageMetadata` to `cpaUsageMetadata` on non-terminal chunks so
/// only the terminal chunk carries client-visible usage.
pub(crate) fn filter_stream_usage_metadata(chunk: &mut Value) {
    let finish_reason = get_path(chunk, &["response", "candidates"])
        .or_else(|| chunk.get("candidates"))
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("finishReason"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !finish_reason.is_empty() {
        return;
    }
    rename_usage(chunk);
    if let Some(response) = chunk.get_mut("response") {
        rename_usage(response);
    }
}

fn rename_usage(value: &mut Value) {
    if let Some(object) = value.as_object_mut()
        && let Some(usage) = object.remove("usageMetadata")
    {
        object.insert("cpaUsageMetadata".to_string(), usage);
    }
}

/// Folds a streamed NDJSON body into one non-stream response.
///
/// Adjacent text parts and adjacent thought parts coalesce (a thought
/// keeps its last signature); function calls and inline data flush the
/// pending run; the last seen finishReason/modelVersion/responseId/usage
/// and traceId win.
pub(crate) fn convert_stream_to_nonstream(stream: &[u8]) -> Vec<u8> {
    let mut template: Option<Value> = None;
    let mut trace_id = String::new();
    let mut role = String::new();
    let mut finish_reason = String::new();
    let mut model_version = String::new();
    let mut response_id = String::new();
    let mut usage: Option<Value> = None;
    let mut parts: Vec<Value> = Vec::new();
    let mut pending = Pending::default();

    for line in stream.split(|byte| *byte == b'\n') {
        let Some(root) = json_payload(line) else {
            continue;
        };
        let response = if root.get("response").is_some() {
            root.get("response").cloned().unwrap_or_default()
        } else if root.get("candidates").is_some() {
            root.clone()
        } else {
            continue;
        };
        template = Some(response.clone());

        if let Some(trace) = root.get("traceId").and_then(Value::as_str)
            && !trace.is_empty()
        {
            trace_id = trace.to_string();
        }
        if let Some(value) = get_path(&response, &["candidates"])
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
        {
            if let Some(found) = get_path(value, &["content", "role"]).and_then(Value::as_str) {
                role = found.to_string();
            }
            if let Some(found) = value.get("finishReason").and_then(Value::as_str)
                && !found.is_empty()
            {
                finish_reason = found.to_string();
            }
        }
        if let Some(found) = response.get("modelVersion").and_then(Value::as_str)
            && !found.is_empty()
        {
            model_version = found.to_string();
        }
        if let Some(found) = response.get("responseId").and_then(Value::as_str)
            && !found.is_empty()
        {
            response_id = found.to_string();
        }
        if let Some(found) = response.get("usageMetadata").or_else(|| root.get("usageMetadata")) {
            usage = Some(found.clone());
        }

        let Some(chunk_parts) = get_path(&response, &["candidates"])
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
            .and_then(|candidate| get_path(candidate, &["content", "parts"]))
            .and_then(Value::as_array)
        else {
            continue;
        };
        for part in chunk_parts {
            let has_function_call = part.get("functionCall").is_some();
            let has_inline_data =
                part.get("inlineData").is_some() || part.get("inline_data").is_some();
            let signature = part
                .get("thoughtSignature")
                .or_else(|| part.get("thought_signature"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let text = part.get("text").and_then(Value::as_str).unwrap_or_default();
            let thought = part.get("thought").and_then(Value::as_bool).unwrap_or(false);

            if has_function_call || has_inline_data {
                pending.flush(&mut parts);
                parts.push(normalize_part(part));
                continue;
            }
            if thought || part.get("text").is_some() {
                let kind = if thought { Kind::Thought } else { Kind::Text };
                if pending.kind.is_some_and(|current| current != kind) {
                    pending.flush(&mut parts);
                }
                pending.kind = Some(kind);
                pending.text.push_str(text);
                if kind == Kind::Thought && !signature.is_empty() {
                    pending.signature = signature.to_string();
                }
                continue;
            }
            pending.flush(&mut parts);
            parts.push(normalize_part(part));
        }
    }
    pending.flush(&mut parts);

    let mut response = template
        .unwrap_or_else(|| json!({"candidates": [{"content": {"role": "model", "parts": []}}]}));
    set_candidate(&mut response, "parts", Value::Array(parts));
    if !role.is_empty() {
        set_candidate(&mut response, "role", json!(role));
    }
    if !finish_reason.is_empty()
        && let Some(object) = first_candidate_mut(&mut response).and_then(Value::as_object_mut)
    {
        object.insert("finishReason".to_string(), json!(finish_reason));
    }
    if let Some(object) = response.as_object_mut() {
        if !model_version.is_empty() {
            object.insert("modelVersion".to_string(), json!(model_version));
        }
        if !response_id.is_empty() {
            object.insert("responseId".to_string(), json!(response_id));
        }
        match &usage {
            Some(usage) => {
                object.insert("usageMetadata".to_string(), usage.clone());
            }
            None => {
                object.entry("usageMetadata".to_string()).or_insert(json!({
                    "promptTokenCount": 0,
                    "candidatesTokenCount": 0,
                    "totalTokenCount": 0
                }));
            }
        }
    }

    let mut output = Map::new();
    output.insert("response".to_string(), response);
    output.insert("traceId".to_string(), json!(trace_id));
    serde_json::to_vec(&Value::Object(output)).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Text,
    Thought,
}

#[derive(Debug, Default)]
struct Pending {
    kind: Option<Kind>,
    text: String,
    signature: String,
}

impl Pending {
    fn flush(&mut self, parts: &mut Vec<Value>) {
        let Some(kind) = self.kind else {
            return;
        };
        match kind {
            Kind::Text => {
                if !self.text.trim().is_empty() {
                    parts.push(json!({"text": self.text}));
                }
            }
            Kind::Thought => {
                if !self.text.trim().is_empty() || !self.signature.is_empty() {
                    let mut part = Map::new();
                    part.insert("thought".to_string(), json!(true));
                    part.insert("text".to_string(), json!(self.text));
                    if !self.signature.is_empty() {
                        part.insert("thoughtSignature".to_string(), json!(self.signature));
                    }
                    parts.push(Value::Object(part));
                }
            }
        }
        self.kind = None;
        self.text.clear();
        self.signature.clear();
    }
}

/// Camel-cases the snake_case spellings some chunks carry.
fn normalize_part(part: &Value) -> Value {
    let mut out = part.as_object().cloned().unwrap_or_default();
    if let Some(signature) = out.remove("thought_signature") {
        out.entry("thoughtSignature".to_string()).or_insert(signature);
    }
    if let Some(inline) = out.remove("inline_data") {
        out.entry("inlineData".to_string()).or_insert(inline);
    }
    Value::Object(out)
}

fn first_candidate_mut(response: &mut Value) -> Option<&mut Value> {
    response
        .get_mut("candidates")
        .and_then(Value::as_array_mut)
        .and_then(|candidates| candidates.first_mut())
}

fn set_candidate(response: &mut Value, content_key: &str, value: Value) {
    if response.get("candidates").is_none() {
        *response = json!({"candidates": [{"content": {"role": "model", "parts": []}}]});
    }
    let Some(candidate) = first_candidate_mut(response) else {
        return;
    };
    if candidate.get("content").is_none()
        && let Some(object) = candidate.as_object_mut()
    {
        object.insert("content".to_string(), json!({}));
    }
    if let Some(content) = candidate.get_mut("content").and_then(Value::as_object_mut) {
        content.insert(content_key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanner_splits_lines_across_chunks() {
        let mut scanner = LineScanner::default();
        scanner.push(b"{\"a\":1}\n{\"b\"");
        assert_eq!(scanner.next_line().as_deref(), Some(b"{\"a\":1}".as_slice()));
        assert_eq!(scanner.next_line(), None);
        scanner.push(b":2}\r\n");
        assert_eq!(scanner.next_line().as_deref(), Some(b"{\"b\":2}".as_slice()));
        assert_eq!(scanner.finish(), None);
    }

    #[test]
    fn scanner_yields_trailing_partial_on_finish() {
        let mut scanner = LineScanner::default();
        scanner.push(b"{\"tail\":true}");
        assert_eq!(scanner.next_line(), None);
        assert_eq!(scanner.finish().as_deref(), Some(b"{\"tail\":true}".as_slice()));
    }

    #[test]
    fn json_payload_strips_sse_prefix() {
        assert_eq!(json_payload(b"data: {\"x\":1}"), Some(json!({"x": 1})));
        assert_eq!(json_payload(b"{\"x\":1}"), Some(json!({"x": 1})));
        assert_eq!(json_payload(b"data: [DONE]"), None);
        assert_eq!(json_payload(b"   "), None);
    }

    #[test]
    fn usage_is_renamed_on_non_terminal_chunks_only() {
        let mut chunk = json!({
            "response": {
                "candidates": [{"content": {"parts": [{"text": "hi"}]}}],
                "usageMetadata": {"promptTokenCount": 4}
            }
        });
        filter_stream_usage_metadata(&mut chunk);
        assert!(chunk["response"].get("usageMetadata").is_none());
        assert_eq!(chunk["response"]["cpaUsageMetadata"]["promptTokenCount"], json!(4));

        let mut terminal = json!({
            "response": {
                "candidates": [{"finishReason": "STOP", "content": {"parts": []}}],
                "usageMetadata": {"promptTokenCount": 4}
            }
        });
        filter_stream_usage_metadata(&mut terminal);
        assert!(terminal["response"].get("usageMetadata").is_some());
    }

    #[test]
    fn stream_folds_text_and_thoughts() {
        let stream = [
            json!({"response": {"candidates": [{"content": {"role": "model", "parts": [
                {"thought": true, "text": "let me ", "thoughtSignature": "s1"}
            ]}}]}, "traceId": "t-1"}),
            json!({"response": {"candidates": [{"content": {"parts": [
                {"thought": true, "text": "think", "thoughtSignature": "s2"}
            ]}}]}}),
            json!({"response": {"candidates": [{"content": {"parts": [
                {"text": "Hello"}
            ]}}]}}),
            json!({"response": {
                "candidates": [{"content": {"parts": [{"text": " world"}]}, "finishReason": "STOP"}],
                "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 5, "totalTokenCount": 8},
                "modelVersion": "claude-sonnet-4-5",
                "responseId": "r-9"
            }}),
        ]
        .iter()
        .map(|line| line.to_string())
        .collect::<Vec<_>>()
        .join("\n");

        let folded: Value =
            serde_json::from_slice(&convert_stream_to_nonstream(stream.as_bytes())).unwrap();
        let parts = folded["response"]["candidates"][0]["content"]["parts"]
            .as_array()
            .unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["thought"], json!(true));
        assert_eq!(parts[0]["text"], json!("let me think"));
        assert_eq!(parts[0]["thoughtSignature"], json!("s2"));
        assert_eq!(parts[1]["text"], json!("Hello world"));
        assert_eq!(folded["response"]["candidates"][0]["finishReason"], json!("STOP"));
        assert_eq!(folded["response"]["usageMetadata"]["totalTokenCount"], json!(8));
        assert_eq!(folded["response"]["modelVersion"], json!("claude-sonnet-4-5"));
        assert_eq!(folded["response"]["responseId"], json!("r-9"));
        assert_eq!(folded["traceId"], json!("t-1"));
    }

    #[test]
    fn function_call_flushes_pending_text() {
        let stream = [
            json!({"response": {"candidates": [{"content": {"parts": [{"text": "before"}]}}]}}),
            json!({"response": {"candidates": [{"content": {"parts": [
                {"functionCall": {"name": "lookup"}, "thought_signature": "sig"}
            ]}}]}}),
        ]
        .iter()
        .map(|line| line.to_string())
        .collect::<Vec<_>>()
        .join("\n");

        let folded: Value =
            serde_json::from_slice(&convert_stream_to_nonstream(stream.as_bytes())).unwrap();
        let parts = folded["response"]["candidates"][0]["content"]["parts"]
            .as_array()
            .unwrap();
        assert_eq!(parts[0]["text"], json!("before"));
        assert_eq!(parts[1]["functionCall"]["name"], json!("lookup"));
        assert_eq!(parts[1]["thoughtSignature"], json!("sig"));
    }

    #[test]
    fn empty_stream_yields_zeroed_usage() {
        let folded: Value = serde_json::from_slice(&convert_stream_to_nonstream(b"")).unwrap();
        assert_eq!(folded["response"]["usageMetadata"]["totalTokenCount"], json!(0));
        assert_eq!(
            folded["response"]["candidates"][0]["content"]["parts"],
            json!([])
        );
    }
}
