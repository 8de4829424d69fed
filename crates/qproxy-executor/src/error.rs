use std::time::Duration;

use serde_json::Value;

use qproxy_common::value_string;

pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Terminal outcomes of one executor call.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Missing refresh token, missing access token after refresh, or a
    /// 401/403 from upstream. Never retried inside the executor.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Upstream 429 with an optional retry hint parsed from the body.
    /// The ingress layer decides the client-facing behavior.
    #[error("rate limited by upstream")]
    RateLimited {
        body: String,
        retry_after: Option<Duration>,
    },
    /// 503 with "no capacity available" after all attempts were used.
    #[error("upstream has no capacity available")]
    NoCapacity { body: String },
    /// Any other non-2xx upstream status, surfaced as-is.
    #[error("upstream status {status}")]
    UpstreamStatus { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ExecutorError {
    /// HTTP status the ingress layer should reflect.
    pub fn status(&self) -> u16 {
        match self {
            ExecutorError::Unauthorized(_) => 401,
            ExecutorError::RateLimited { .. } => 429,
            ExecutorError::NoCapacity { .. } => 503,
            ExecutorError::UpstreamStatus { status, .. } => *status,
            ExecutorError::Transport(_) => 502,
            ExecutorError::Cancelled => 499,
            ExecutorError::InvalidRequest(_) => 400,
        }
    }

    /// Maps a non-2xx upstream status to the matching error kind.
    pub(crate) fn from_status(status: u16, body: Vec<u8>) -> Self {
        let body = String::from_utf8_lossy(&body).into_owned();
        match status {
            401 | 403 => ExecutorError::Unauthorized(body),
            429 => ExecutorError::RateLimited {
                retry_after: parse_retry_delay(body.as_bytes()),
                body,
            },
            _ => ExecutorError::UpstreamStatus { status, body },
        }
    }
}

/// Extracts the Google RPC `RetryInfo` hint (`error.details[*].retryDelay`,
/// e.g. `"3.5s"`) from a 429 body.
pub(crate) fn parse_retry_delay(body: &[u8]) -> Option<Duration> {
    let root: Value = serde_json::from_slice(body).ok()?;
    let details = root
        .get("error")
        .and_then(|error| error.get("details"))
        .or_else(|| root.get("details"))?
        .as_array()?;
    for detail in details {
        if let Some(raw) = detail.get("retryDelay").and_then(value_string)
            && let Some(delay) = parse_duration_secs(&raw)
        {
            return Some(delay);
        }
    }
    None
}

fn parse_duration_secs(raw: &str) -> Option<Duration> {
    let raw = raw.trim().strip_suffix('s')?;
    let seconds = raw.trim().parse::<f64>().ok()?;
    if seconds < 0.0 || !seconds.is_finite() {
        return None;
    }
    Some(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_parses_rpc_retry_info() {
        let body = br#"{"error":{"code":429,"details":[
            {"@type":"type.googleapis.com/google.rpc.ErrorInfo"},
            {"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"3.5s"}
        ]}}"#;
        assert_eq!(parse_retry_delay(body), Some(Duration::from_millis(3500)));
    }

    #[test]
    fn retry_delay_absent_or_malformed_is_none() {
        assert_eq!(parse_retry_delay(b"{}"), None);
        assert_eq!(parse_retry_delay(b"not json"), None);
        assert_eq!(
            parse_retry_delay(br#"{"error":{"details":[{"retryDelay":"soon"}]}}"#),
            None
        );
    }

    #[test]
    fn from_status_classifies() {
        assert!(matches!(
            ExecutorError::from_status(401, b"denied".to_vec()),
            ExecutorError::Unauthorized(_)
        ));
        assert!(matches!(
            ExecutorError::from_status(429, b"{}".to_vec()),
            ExecutorError::RateLimited { .. }
        ));
        assert!(matches!(
            ExecutorError::from_status(500, Vec::new()),
            ExecutorError::UpstreamStatus { status: 500, .. }
        ));
    }
}
