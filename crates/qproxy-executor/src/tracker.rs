//! Proactive quota tracking for Antigravity.
//!
//! The models-list response piggybacks a per-model quota view. On every
//! successful fetch the tracker converts it into model states on the auth:
//! an exhausted model blacklists its whole shared-quota group until the
//! latest observed reset time, and a one-shot refresh is scheduled past
//! that reset so recovery is observed without waiting for live traffic.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use serde_json::Value;
use time::{Duration, OffsetDateTime};
use time::format_description::well_known::Rfc3339;
use tokio::task::JoinHandle;
use tracing::debug;

use qproxy_auth::{Auth, ModelState, ModelStatus, QuotaState};
use qproxy_common::{parse_rfc3339, read_f64};
use qproxy_quota::groups;

/// Extra wait past `resetTime` before the refresh fires.
const QUOTA_RECOVERY_BUFFER: Duration = Duration::minutes(5);
/// Fallback blackout when the response carries no usable reset time.
const DEFAULT_EXHAUSTED_WINDOW: Duration = Duration::minutes(5);

const EXHAUSTED_EPSILON: f64 = 1e-6;

/// Callback invoked when a scheduled refresh fires; its job is to re-fetch
/// the models list for the auth and re-run the tracker.
pub type RefreshFn =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// One pending refresh timer per auth; scheduling again replaces the
/// previous timer.
#[derive(Default)]
pub struct RecoveryScheduler {
    inner: Mutex<SchedulerInner>,
}

#[derive(Default)]
struct SchedulerInner {
    timers: HashMap<String, JoinHandle<()>>,
    refresh: Option<RefreshFn>,
}

impl RecoveryScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers the refresh callback. Called once by the service layer at
    /// startup; tests inject their own.
    pub fn set_refresh_fn(&self, refresh: RefreshFn) {
        self.inner.lock().expect("scheduler lock poisoned").refresh = Some(refresh);
    }

    /// Schedules a refresh for the auth at `reset_time` plus the recovery
    /// buffer, replacing any pending timer for the same auth.
    pub fn schedule(self: &Arc<Self>, auth_id: &str, reset_time: OffsetDateTime) {
        if auth_id.is_empty() {
            return;
        }
        self.schedule_at(auth_id, reset_time + QUOTA_RECOVERY_BUFFER);
    }

    fn schedule_at(self: &Arc<Self>, auth_id: &str, refresh_at: OffsetDateTime) {
        let delay = refresh_at - OffsetDateTime::now_utc();
        let delay = if delay.is_positive() {
            StdDuration::try_from(delay).unwrap_or(StdDuration::from_secs(1))
        } else {
            // Already past the refresh time; fire shortly in the background.
            StdDuration::from_secs(1)
        };

        let scheduler = Arc::clone(self);
        let id = auth_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let refresh = {
                let mut inner = scheduler.inner.lock().expect("scheduler lock poisoned");
                inner.timers.remove(&id);
                inner.refresh.clone()
            };
            if let Some(refresh) = refresh {
                debug!(event = "quota_refresh_fire", auth_id = %id);
                refresh(id).await;
            }
        });

        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        if let Some(existing) = inner.timers.insert(auth_id.to_string(), handle) {
            existing.abort();
        }
        debug!(
            event = "quota_refresh_scheduled",
            auth_id = %auth_id,
            refresh_at = %refresh_at.format(&Rfc3339).unwrap_or_default(),
        );
    }

    /// Cancels any pending refresh for the auth.
    pub fn cancel(&self, auth_id: &str) {
        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        if let Some(handle) = inner.timers.remove(auth_id) {
            handle.abort();
        }
    }
}

pub struct QuotaTracker {
    scheduler: Arc<RecoveryScheduler>,
}

struct QuotaSignal {
    remaining_fraction: f64,
    reset_time: Option<OffsetDateTime>,
}

impl QuotaTracker {
    pub fn new(scheduler: Arc<RecoveryScheduler>) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Arc<RecoveryScheduler> {
        &self.scheduler
    }

    /// Applies the quota view of a models-list response to the auth's
    /// model states. Returns `true` when any state changed.
    ///
    /// The map is rebuilt entry by entry and assigned once, so a reader
    /// holding the previous auth snapshot sees either the old map or the
    /// new one in full.
    pub fn update_quota_state(&self, auth: &mut Auth, body: &[u8]) -> bool {
        if body.is_empty() {
            return false;
        }
        let signals = parse_quota_signals(body);
        if signals.is_empty() {
            return false;
        }

        let now = OffsetDateTime::now_utc();

        // First pass: exhausted models expand to their groups; the latest
        // observed reset per group wins.
        let mut exhausted_groups: HashMap<String, OffsetDateTime> = HashMap::new();
        for (model, signal) in &signals {
            if signal.remaining_fraction > EXHAUSTED_EPSILON {
                continue;
            }
            let group = groups::group_id(model);
            let reset_time = match signal.reset_time {
                Some(reset) if reset > now => reset,
                _ => now + DEFAULT_EXHAUSTED_WINDOW,
            };
            let slot = exhausted_groups.entry(group).or_insert(reset_time);
            if reset_time > *slot {
                *slot = reset_time;
            }
        }

        let mut new_states: HashMap<String, ModelState> = auth
            .model_states
            .iter()
            .map(|(model, state)| (model.clone(), state.clone()))
            .collect();
        let mut modified = false;

        // Second pass: mark every member of an exhausted group unavailable,
        // monotonically (a later reset never shrinks an existing window).
        let mut latest_reset: Option<OffsetDateTime> = None;
        for (group, reset_time) in &exhausted_groups {
            if latest_reset.is_none_or(|latest| *reset_time > latest) {
                latest_reset = Some(*reset_time);
            }
            for model in groups::models_in_group_id(group) {
                let state = new_states.entry(model.clone()).or_insert_with(|| ModelState {
                    status: ModelStatus::Active,
                    ..Default::default()
                });
                let extend = !state.unavailable
                    || state
                        .next_retry_after
                        .is_none_or(|retry| *reset_time > retry);
                if extend {
                    state.unavailable = true;
                    state.next_retry_after = Some(*reset_time);
                    state.quota = QuotaState {
                        exceeded: true,
                        reason: "quota_exhausted".to_string(),
                        next_recover_at: Some(*reset_time),
                    };
                    state.updated_at = Some(now);
                    modified = true;
                    debug!(
                        event = "quota_model_blocked",
                        auth_id = %auth.id,
                        model = %model,
                        reset_at = %reset_time.format(&Rfc3339).unwrap_or_default(),
                    );
                }
            }
        }

        // Third pass: clear states for models with remaining quota whose
        // group is not exhausted. Runs even when nothing is exhausted so
        // recovery is observed.
        for (model, signal) in &signals {
            if signal.remaining_fraction <= EXHAUSTED_EPSILON {
                continue;
            }
            if exhausted_groups.contains_key(&groups::group_id(model)) {
                continue;
            }
            if let Some(state) = new_states.get_mut(model)
                && state.quota.exceeded
            {
                state.unavailable = false;
                state.next_retry_after = None;
                state.quota = QuotaState::default();
                state.updated_at = Some(now);
                modified = true;
                debug!(event = "quota_model_cleared", auth_id = %auth.id, model = %model);
            }
        }

        auth.model_states = new_states;

        if let Some(latest) = latest_reset
            && !auth.id.is_empty()
        {
            self.scheduler.schedule(&auth.id, latest);
        }

        modified
    }
}

/// `models.*.quotaInfo` -> per-model remaining fraction and reset time.
/// Malformed bodies yield an empty map, never an error.
fn parse_quota_signals(body: &[u8]) -> HashMap<String, QuotaSignal> {
    let mut out = HashMap::new();
    let Ok(root) = serde_json::from_slice::<Value>(body) else {
        return out;
    };
    let Some(models) = root.get("models").and_then(Value::as_object) else {
        return out;
    };
    for (model, record) in models {
        if model.is_empty() {
            continue;
        }
        let Some(info) = record
            .get("quotaInfo")
            .or_else(|| record.get("quota_info"))
            .and_then(Value::as_object)
        else {
            continue;
        };
        let remaining_fraction = ["remainingFraction", "remaining_fraction", "remaining"]
            .iter()
            .find_map(|key| info.get(*key).and_then(read_f64))
            .unwrap_or(1.0);
        let reset_time = ["resetTime", "reset_time"]
            .iter()
            .find_map(|key| info.get(*key).and_then(parse_rfc3339));
        out.insert(
            model.clone(),
            QuotaSignal {
                remaining_fraction,
                reset_time,
            },
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn auth() -> Auth {
        Auth {
            id: "auth-1".to_string(),
            provider: "antigravity".to_string(),
            ..Default::default()
        }
    }

    fn body_with(model: &str, remaining: f64, reset: Option<&str>) -> Vec<u8> {
        let mut info = serde_json::json!({"remainingFraction": remaining});
        if let Some(reset) = reset {
            info["resetTime"] = serde_json::json!(reset);
        }
        serde_json::to_vec(&serde_json::json!({
            "models": {model: {"modelProvider": "anthropic", "quotaInfo": info}}
        }))
        .unwrap()
    }

    fn rfc3339(at: OffsetDateTime) -> String {
        at.format(&Rfc3339).unwrap()
    }

    #[tokio::test]
    async fn exhausted_model_blocks_whole_group() {
        let tracker = QuotaTracker::new(RecoveryScheduler::new());
        let mut auth = auth();
        let reset = OffsetDateTime::now_utc() + Duration::hours(1);
        let body = body_with("claude-sonnet-4-5-thinking", 0.0, Some(&rfc3339(reset)));

        assert!(tracker.update_quota_state(&mut auth, &body));

        for model in [
            "claude-sonnet-4-5-thinking",
            "claude-opus-4-5-thinking",
            "gpt-oss-120b-medium",
        ] {
            let state = auth.model_states.get(model).expect(model);
            assert!(state.unavailable, "{model}");
            assert!(state.quota.exceeded, "{model}");
            assert!(state.next_retry_after.unwrap() >= reset - Duration::seconds(1));
            assert_eq!(state.quota.reason, "quota_exhausted");
        }
        tracker.scheduler().cancel("auth-1");
    }

    #[tokio::test]
    async fn past_reset_time_defaults_to_short_window() {
        let tracker = QuotaTracker::new(RecoveryScheduler::new());
        let mut auth = auth();
        let stale = OffsetDateTime::now_utc() - Duration::hours(2);
        let body = body_with("gemini-3-flash", 0.0, Some(&rfc3339(stale)));

        assert!(tracker.update_quota_state(&mut auth, &body));
        let state = &auth.model_states["gemini-3-flash"];
        let retry = state.next_retry_after.unwrap();
        assert!(retry > OffsetDateTime::now_utc());
        assert!(retry <= OffsetDateTime::now_utc() + Duration::minutes(6));
        tracker.scheduler().cancel("auth-1");
    }

    #[tokio::test]
    async fn recovery_clears_exceeded_state() {
        let tracker = QuotaTracker::new(RecoveryScheduler::new());
        let mut auth = auth();
        let reset = OffsetDateTime::now_utc() + Duration::minutes(30);
        let body = body_with("gemini-3-flash", 0.0, Some(&rfc3339(reset)));
        assert!(tracker.update_quota_state(&mut auth, &body));
        assert!(auth.model_states["gemini-3-flash"].quota.exceeded);

        let recovered = body_with("gemini-3-flash", 0.8, None);
        assert!(tracker.update_quota_state(&mut auth, &recovered));
        let state = &auth.model_states["gemini-3-flash"];
        assert!(!state.unavailable);
        assert!(!state.quota.exceeded);
        assert_eq!(state.next_retry_after, None);
        tracker.scheduler().cancel("auth-1");
    }

    #[tokio::test]
    async fn blackout_window_is_monotonic() {
        let tracker = QuotaTracker::new(RecoveryScheduler::new());
        let mut auth = auth();
        let later = OffsetDateTime::now_utc() + Duration::hours(3);
        let sooner = OffsetDateTime::now_utc() + Duration::hours(1);

        let body = body_with("gemini-3-flash", 0.0, Some(&rfc3339(later)));
        tracker.update_quota_state(&mut auth, &body);
        let first_retry = auth.model_states["gemini-3-flash"].next_retry_after.unwrap();

        let body = body_with("gemini-3-flash", 0.0, Some(&rfc3339(sooner)));
        tracker.update_quota_state(&mut auth, &body);
        let second_retry = auth.model_states["gemini-3-flash"].next_retry_after.unwrap();
        assert_eq!(first_retry, second_retry);
        tracker.scheduler().cancel("auth-1");
    }

    #[tokio::test]
    async fn malformed_body_is_a_noop() {
        let tracker = QuotaTracker::new(RecoveryScheduler::new());
        let mut auth = auth();
        assert!(!tracker.update_quota_state(&mut auth, b"{broken"));
        assert!(!tracker.update_quota_state(&mut auth, b"{}"));
        assert!(auth.model_states.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_fires_refresh_once_per_auth() {
        let scheduler = RecoveryScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        scheduler.set_refresh_fn(Arc::new(move |_auth_id| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }));

        // Reschedule replaces the first timer, so only one firing happens.
        scheduler.schedule("auth-1", OffsetDateTime::now_utc() - QUOTA_RECOVERY_BUFFER);
        scheduler.schedule("auth-1", OffsetDateTime::now_utc() - QUOTA_RECOVERY_BUFFER);
        tokio::time::sleep(StdDuration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_pending_refresh() {
        let scheduler = RecoveryScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        scheduler.set_refresh_fn(Arc::new(move |_auth_id| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }));

        scheduler.schedule("auth-1", OffsetDateTime::now_utc() - QUOTA_RECOVERY_BUFFER);
        scheduler.cancel("auth-1");
        tokio::time::sleep(StdDuration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
