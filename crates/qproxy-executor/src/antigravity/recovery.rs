//! Thinking-signature recovery.
//!
//! The upstream strictly validates signatures on thinking blocks; a
//! signature from another session fails the whole request with a 4xx.
//! Recovery rewrites the client payload once: thinking blocks become
//! plain text, except the first thinking block of the final assistant
//! message, which keeps its type (Extended Thinking requires the final
//! assistant message to start with one) and only loses the signature.
//! The request is then re-issued with a recovery flag that prevents a
//! second rewrite.

use serde_json::{Value, json};
use tracing::debug;

const SIGNATURE_ERROR_PATTERNS: &[&str] = &["invalid `signature` in `thinking` block"];

/// Whether a 4xx response body reports a thinking-signature validation
/// failure.
pub(crate) fn is_signature_validation_error(status: u16, body: &[u8]) -> bool {
    if !(400..500).contains(&status) {
        return false;
    }
    let body_text = String::from_utf8_lossy(body).to_lowercase();
    if SIGNATURE_ERROR_PATTERNS
        .iter()
        .any(|pattern| body_text.contains(pattern))
    {
        return true;
    }
    // Error payloads sometimes nest the message; probe the usual fields.
    let Ok(root) = serde_json::from_slice::<Value>(body) else {
        return false;
    };
    let mut combined = String::new();
    for path in [
        &["error", "message"][..],
        &["error", "code"][..],
        &["message"][..],
    ] {
        if let Some(raw) = crate::json::get_path(&root, path) {
            match raw {
                Value::String(text) => combined.push_str(text),
                other => combined.push_str(&other.to_string()),
            }
        }
    }
    let combined = combined.to_lowercase();
    SIGNATURE_ERROR_PATTERNS
        .iter()
        .any(|pattern| combined.contains(pattern))
}

pub(crate) fn should_retry_with_recovery(
    status: u16,
    body: &[u8],
    model: &str,
    already_retried: bool,
) -> bool {
    if already_retried {
        return false;
    }
    if !model.to_ascii_lowercase().contains("claude") {
        return false;
    }
    is_signature_validation_error(status, body)
}

/// Applies the recovery transform to a Claude-format payload. Returns the
/// rewritten bytes, identical to the input when nothing changed.
pub(crate) fn convert_thinking_to_text(payload: &[u8]) -> Vec<u8> {
    let Ok(mut root) = serde_json::from_slice::<Value>(payload) else {
        return payload.to_vec();
    };
    let Some(messages) = root.get_mut("messages").and_then(Value::as_array_mut) else {
        return payload.to_vec();
    };

    let last_assistant = messages
        .iter()
        .rposition(|message| message.get("role").and_then(Value::as_str) == Some("assistant"));

    let mut modified = false;
    for (message_index, message) in messages.iter_mut().enumerate() {
        let Some(content) = message.get_mut("content").and_then(Value::as_array_mut) else {
            continue;
        };
        for (block_index, block) in content.iter_mut().enumerate() {
            if block.get("type").and_then(Value::as_str) != Some("thinking") {
                continue;
            }
            let Some(object) = block.as_object_mut() else {
                continue;
            };

            let final_assistant_first_thinking =
                Some(message_index) == last_assistant && block_index == 0;
            if final_assistant_first_thinking {
                modified |= object.remove("signature").is_some();
                debug!(
                    event = "signature_recovery",
                    message = message_index,
                    action = "kept_thinking_dropped_signature",
                );
                continue;
            }

            let text = object
                .get("thinking")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            object.insert("type".to_string(), json!("text"));
            object.remove("thinking");
            object.remove("signature");
            object.insert("text".to_string(), json!(text));
            modified = true;
            debug!(
                event = "signature_recovery",
                message = message_index,
                action = "converted_to_text",
            );
        }
    }

    if !modified {
        return payload.to_vec();
    }
    serde_json::to_vec(&root).unwrap_or_else(|_| payload.to_vec())
}

pub(crate) fn payload_changed(original: &[u8], recovered: &[u8]) -> bool {
    original != recovered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "model": "claude-sonnet-4-5-thinking",
            "messages": [
                {"role": "user", "content": [{"type": "text", "text": "question"}]},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "old reasoning", "signature": "stale-1"},
                    {"type": "text", "text": "earlier answer"}
                ]},
                {"role": "user", "content": [{"type": "text", "text": "follow-up"}]},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "fresh reasoning", "signature": "stale-2"},
                    {"type": "thinking", "thinking": "second thought", "signature": "stale-3"}
                ]}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn detects_signature_error_in_plain_and_nested_bodies() {
        assert!(is_signature_validation_error(
            400,
            br#"{"message": "Invalid `signature` in `thinking` block"}"#
        ));
        assert!(is_signature_validation_error(
            422,
            br#"{"error": {"message": "invalid `signature` in `thinking` block"}}"#
        ));
        assert!(!is_signature_validation_error(400, b"some other error"));
        assert!(!is_signature_validation_error(
            500,
            br#"{"message": "Invalid `signature` in `thinking` block"}"#
        ));
    }

    #[test]
    fn recovery_preserves_final_assistant_first_thinking() {
        let recovered = convert_thinking_to_text(&payload());
        let root: Value = serde_json::from_slice(&recovered).unwrap();
        let messages = root["messages"].as_array().unwrap();

        // Earlier assistant thinking became plain text.
        let earlier = &messages[1]["content"][0];
        assert_eq!(earlier["type"], json!("text"));
        assert_eq!(earlier["text"], json!("old reasoning"));
        assert!(earlier.get("thinking").is_none());
        assert!(earlier.get("signature").is_none());

        // The final assistant's first thinking block keeps its type but
        // loses the signature.
        let first = &messages[3]["content"][0];
        assert_eq!(first["type"], json!("thinking"));
        assert_eq!(first["thinking"], json!("fresh reasoning"));
        assert!(first.get("signature").is_none());

        // Its second thinking block is converted like the rest.
        let second = &messages[3]["content"][1];
        assert_eq!(second["type"], json!("text"));
        assert_eq!(second["text"], json!("second thought"));
    }

    #[test]
    fn unchanged_payload_reports_no_change() {
        let original = serde_json::to_vec(&json!({
            "messages": [{"role": "user", "content": [{"type": "text", "text": "hi"}]}]
        }))
        .unwrap();
        let recovered = convert_thinking_to_text(&original);
        assert!(!payload_changed(&original, &recovered));
    }

    #[test]
    fn retry_gate_requires_claude_and_first_attempt() {
        let body = br#"{"message": "Invalid `signature` in `thinking` block"}"#;
        assert!(should_retry_with_recovery(400, body, "claude-opus-4-5-thinking", false));
        assert!(!should_retry_with_recovery(400, body, "claude-opus-4-5-thinking", true));
        assert!(!should_retry_with_recovery(400, body, "gemini-3-pro-high", false));
    }
}
