use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;

use crate::auth::{Auth, ModelStatus};
use crate::error::SelectError;

/// Picks one auth from a candidate set. Implementations are constructed by
/// the service builder and injected; each instance owns its own cursor
/// state under a mutex, so concurrent `pick` calls are FIFO per selector.
pub trait Selector: Send + Sync {
    fn name(&self) -> &'static str;

    fn pick(
        &self,
        provider: &str,
        model: &str,
        auths: &[Arc<Auth>],
    ) -> Result<Arc<Auth>, SelectError>;
}

/// Shared availability filter.
///
/// Keeps entries whose provider matches, that are not disabled, and whose
/// model state (if any) is neither in a retry cooldown nor quota-exceeded
/// with a future recovery time. The survivors of the highest priority tier
/// are returned sorted by id; lower tiers are reachable only when every
/// higher tier was filtered out entirely.
pub fn available_auths(
    auths: &[Arc<Auth>],
    provider: &str,
    model: &str,
    now: OffsetDateTime,
) -> Vec<Arc<Auth>> {
    let mut out: Vec<Arc<Auth>> = auths
        .iter()
        .filter(|auth| is_available(auth, provider, model, now))
        .cloned()
        .collect();
    let Some(top) = out.iter().map(|auth| auth.priority()).max() else {
        return out;
    };
    out.retain(|auth| auth.priority() == top);
    out.sort_by(|a, b| a.id.cmp(&b.id));
    out
}

fn is_available(auth: &Auth, provider: &str, model: &str, now: OffsetDateTime) -> bool {
    if auth.disabled {
        return false;
    }
    if !auth.provider.eq_ignore_ascii_case(provider.trim()) {
        return false;
    }
    let Some(state) = auth.model_state(model) else {
        return true;
    };
    if state.status == ModelStatus::Disabled {
        return false;
    }
    if state.unavailable && state.next_retry_after.is_some_and(|retry| retry > now) {
        return false;
    }
    if state.quota.exceeded
        && state
            .quota
            .next_recover_at
            .is_some_and(|recover| recover > now)
    {
        return false;
    }
    true
}

/// Concentrates load on the first available account (id order) until it
/// blocks, then spills to the next.
#[derive(Debug, Default)]
pub struct FillFirstSelector;

impl Selector for FillFirstSelector {
    fn name(&self) -> &'static str {
        "fill-first"
    }

    fn pick(
        &self,
        provider: &str,
        model: &str,
        auths: &[Arc<Auth>],
    ) -> Result<Arc<Auth>, SelectError> {
        let now = OffsetDateTime::now_utc();
        available_auths(auths, provider, model, now)
            .into_iter()
            .next()
            .ok_or(SelectError::AuthNotFound)
    }
}

/// Even rotation over the top priority tier. The cursor is keyed by
/// provider plus the tier's member ids, so a membership change restarts
/// the rotation rather than skewing it.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    cursors: Mutex<HashMap<String, usize>>,
}

impl Selector for RoundRobinSelector {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn pick(
        &self,
        provider: &str,
        model: &str,
        auths: &[Arc<Auth>],
    ) -> Result<Arc<Auth>, SelectError> {
        let now = OffsetDateTime::now_utc();
        let available = available_auths(auths, provider, model, now);
        if available.is_empty() {
            return Err(SelectError::AuthNotFound);
        }
        let key = cursor_key(provider, &available);
        let mut cursors = self.cursors.lock().expect("selector lock poisoned");
        let cursor = cursors.entry(key).or_insert(0);
        let index = *cursor % available.len();
        *cursor = cursor.wrapping_add(1);
        Ok(available[index].clone())
    }
}

fn cursor_key(provider: &str, tier: &[Arc<Auth>]) -> String {
    let mut key = String::with_capacity(provider.len() + tier.len() * 8);
    key.push_str(provider);
    for auth in tier {
        key.push(':');
        key.push_str(&auth.id);
    }
    key
}
