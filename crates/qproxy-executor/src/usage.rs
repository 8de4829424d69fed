//! Usage accounting hooks.
//!
//! The executor publishes every usage snapshot it sees and guarantees
//! exactly one terminal signal per call: `ensure_published` on success,
//! `publish_failure` on error.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

use qproxy_common::read_i64;

use crate::json::get_path;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageDetail {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
    pub reasoning_tokens: i64,
    pub total_tokens: i64,
}

/// External usage sink.
pub trait UsageCollector: Send + Sync {
    fn publish(&self, provider: &str, model: &str, auth_id: &str, detail: &UsageDetail);
    fn publish_failure(&self, provider: &str, model: &str, auth_id: &str);
}

/// Per-call reporter enforcing the exactly-one-terminal contract.
pub struct UsageReporter {
    collector: Arc<dyn UsageCollector>,
    provider: String,
    model: String,
    auth_id: String,
    published: AtomicBool,
    terminal: AtomicBool,
}

impl UsageReporter {
    pub fn new(
        collector: Arc<dyn UsageCollector>,
        provider: impl Into<String>,
        model: impl Into<String>,
        auth_id: impl Into<String>,
    ) -> Self {
        Self {
            collector,
            provider: provider.into(),
            model: model.into(),
            auth_id: auth_id.into(),
            published: AtomicBool::new(false),
            terminal: AtomicBool::new(false),
        }
    }

    /// Publishes one observed usage snapshot.
    pub fn publish(&self, detail: UsageDetail) {
        self.collector
            .publish(&self.provider, &self.model, &self.auth_id, &detail);
        self.published.store(true, Ordering::Release);
    }

    /// Terminal success signal. Emits an empty snapshot when the call
    /// produced no usage metadata at all, so every call is accounted.
    pub fn ensure_published(&self) {
        if self.terminal.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.published.load(Ordering::Acquire) {
            self.collector
                .publish(&self.provider, &self.model, &self.auth_id, &UsageDetail::default());
        }
    }

    /// Terminal failure signal.
    pub fn publish_failure(&self) {
        if self.terminal.swap(true, Ordering::AcqRel) {
            return;
        }
        self.collector
            .publish_failure(&self.provider, &self.model, &self.auth_id);
    }
}

/// usageMetadata locations probed in priority order. Non-terminal stream
/// chunks have the field renamed to `cpaUsageMetadata`, so both spellings
/// must bill.
const USAGE_PATHS: &[&[&str]] = &[
    &["response", "usageMetadata"],
    &["usageMetadata"],
    &["usage_metadata"],
    &["response", "cpaUsageMetadata"],
    &["cpaUsageMetadata"],
];

/// Extracts usage from a parsed Antigravity response or stream chunk.
pub fn parse_antigravity_usage(payload: &Value) -> Option<UsageDetail> {
    for path in USAGE_PATHS {
        if let Some(node) = get_path(payload, path) {
            return Some(parse_gemini_family_usage(node));
        }
    }
    None
}

fn parse_gemini_family_usage(node: &Value) -> UsageDetail {
    let read = |key: &str| node.get(key).and_then(read_i64).unwrap_or(0);
    let input_tokens = read("promptTokenCount");
    let output_tokens = read("candidatesTokenCount");
    let reasoning_tokens = read("thoughtsTokenCount");
    let cached_tokens = read("cachedContentTokenCount");
    let mut total_tokens = read("totalTokenCount");
    if total_tokens == 0 {
        total_tokens = input_tokens + output_tokens + reasoning_tokens;
    }
    UsageDetail {
        input_tokens,
        output_tokens,
        cached_tokens,
        reasoning_tokens,
        total_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingCollector {
        published: StdMutex<Vec<UsageDetail>>,
        failures: StdMutex<usize>,
    }

    impl UsageCollector for RecordingCollector {
        fn publish(&self, _provider: &str, _model: &str, _auth_id: &str, detail: &UsageDetail) {
            self.published.lock().unwrap().push(detail.clone());
        }

        fn publish_failure(&self, _provider: &str, _model: &str, _auth_id: &str) {
            *self.failures.lock().unwrap() += 1;
        }
    }

    #[test]
    fn ensure_published_backfills_empty_usage() {
        let collector = Arc::new(RecordingCollector::default());
        let reporter = UsageReporter::new(collector.clone(), "antigravity", "m", "a");
        reporter.ensure_published();
        reporter.ensure_published();
        assert_eq!(collector.published.lock().unwrap().len(), 1);
        assert_eq!(*collector.failures.lock().unwrap(), 0);
    }

    #[test]
    fn terminal_fires_once_even_when_both_paths_run() {
        let collector = Arc::new(RecordingCollector::default());
        let reporter = UsageReporter::new(collector.clone(), "antigravity", "m", "a");
        reporter.publish(UsageDetail {
            input_tokens: 5,
            ..Default::default()
        });
        reporter.publish_failure();
        reporter.ensure_published();
        assert_eq!(collector.published.lock().unwrap().len(), 1);
        assert_eq!(*collector.failures.lock().unwrap(), 1);
    }

    #[test]
    fn usage_is_found_under_renamed_key() {
        let payload = json!({
            "response": {"cpaUsageMetadata": {
                "promptTokenCount": 11,
                "candidatesTokenCount": 7,
                "thoughtsTokenCount": 3
            }}
        });
        let detail = parse_antigravity_usage(&payload).unwrap();
        assert_eq!(detail.input_tokens, 11);
        assert_eq!(detail.output_tokens, 7);
        assert_eq!(detail.reasoning_tokens, 3);
        assert_eq!(detail.total_tokens, 21);
    }

    #[test]
    fn wrapped_path_wins_over_bare_path() {
        let payload = json!({
            "response": {"usageMetadata": {"promptTokenCount": 1, "totalTokenCount": 1}},
            "usageMetadata": {"promptTokenCount": 99, "totalTokenCount": 99}
        });
        assert_eq!(parse_antigravity_usage(&payload).unwrap().input_tokens, 1);
    }
}
