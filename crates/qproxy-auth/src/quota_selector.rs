use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;

use qproxy_quota::{ModelQuota, Store, groups, metadata, normalize_model_key, strip_date_suffix};

use crate::auth::Auth;
use crate::error::SelectError;
use crate::selector::{RoundRobinSelector, Selector, available_auths};

const QUOTA_RESET_BOOST: f64 = 0.25;
const QUOTA_RESET_TAU_SECS: f64 = 48.0 * 3600.0;

/// Chooses auths by remaining quota percentage using smooth weighted
/// round-robin within the highest priority tier.
///
/// Unknown quota is a missing signal, not a zero: unknown candidates get
/// weight 0 and are only consulted (via plain round-robin) when no
/// known-positive candidate is schedulable. A *known* zero excludes the
/// candidate outright.
pub struct QuotaWeightedSelector {
    cursors: Mutex<HashMap<String, HashMap<String, i64>>>,
    fallback: RoundRobinSelector,
    store: Option<Arc<Store>>,
}

impl Default for QuotaWeightedSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaWeightedSelector {
    /// Selector reading quota from auth metadata only.
    pub fn new() -> Self {
        Self {
            cursors: Mutex::new(HashMap::new()),
            fallback: RoundRobinSelector::default(),
            store: None,
        }
    }

    /// Selector preferring the durable store, with the metadata mirror as
    /// fallback.
    pub fn with_store(store: Arc<Store>) -> Self {
        Self {
            store: Some(store),
            ..Self::new()
        }
    }

    fn weight_for(&self, auth: &Auth, model: &str, now: OffsetDateTime) -> (i64, bool) {
        let mut lookup = model.trim();
        if lookup.is_empty() {
            lookup = "*";
        }
        match self.lookup_quota(auth, lookup) {
            Some(entry) => (quota_to_weight(&entry, now), true),
            None => (0, false),
        }
    }

    fn lookup_quota(&self, auth: &Auth, model: &str) -> Option<ModelQuota> {
        if let Some(entry) = self.lookup_model_quota(auth, model) {
            return Some(entry);
        }

        let base = strip_date_suffix(model);
        if base != model {
            if let Some(entry) = self.lookup_model_quota(auth, base) {
                return Some(entry);
            }
            if !base.contains("thinking")
                && let Some(entry) = self.lookup_model_quota(auth, &format!("{base}-thinking"))
            {
                return Some(entry);
            }
        }

        if auth.provider.eq_ignore_ascii_case("antigravity") && model != "*" {
            let members = groups::group_models(model);
            if let Some(entry) = self.lookup_group_quota(auth, &members) {
                return Some(entry);
            }
        }

        None
    }

    fn lookup_model_quota(&self, auth: &Auth, model: &str) -> Option<ModelQuota> {
        if let Some(store) = &self.store
            && let Some(entry) = store.get_model_quota(&auth.id, model)
        {
            return Some(entry);
        }
        metadata::get_model_quota(&auth.metadata, model)
    }

    /// Minimum quota across the group's members; percent ties break toward
    /// the earlier reset time.
    fn lookup_group_quota(&self, auth: &Auth, models: &[String]) -> Option<ModelQuota> {
        let mut min: Option<ModelQuota> = None;
        for model in models {
            if model.is_empty() {
                continue;
            }
            let mut entry = self.lookup_model_quota(auth, model);
            if entry.is_none()
                && let Some(base) = model.strip_suffix("-thinking")
                && !base.is_empty()
            {
                entry = self.lookup_model_quota(auth, base);
            }
            let Some(entry) = entry else {
                continue;
            };
            min = Some(match min {
                None => entry,
                Some(current) if entry.percent < current.percent => entry,
                Some(current)
                    if entry.percent == current.percent
                        && entry.reset_time.is_some()
                        && (current.reset_time.is_none()
                            || entry.reset_time < current.reset_time) =>
                {
                    entry
                }
                Some(current) => current,
            });
        }
        min
    }
}

impl Selector for QuotaWeightedSelector {
    fn name(&self) -> &'static str {
        "quota-weighted"
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

        let mut candidates: Vec<Arc<Auth>> = Vec::with_capacity(available.len());
        let mut weights: Vec<i64> = Vec::with_capacity(available.len());
        let mut total_weight: i64 = 0;
        let mut unknown_count = 0usize;
        for candidate in available {
            let (weight, known) = self.weight_for(&candidate, model, now);
            if known && weight <= 0 {
                continue;
            }
            if !known {
                unknown_count += 1;
            }
            candidates.push(candidate);
            weights.push(weight);
            total_weight += weight;
        }
        if candidates.is_empty() {
            return Err(SelectError::AuthNotFound);
        }
        if total_weight <= 0 {
            if unknown_count > 0 {
                return self.fallback.pick(provider, model, &candidates);
            }
            return Err(SelectError::AuthNotFound);
        }

        let key = format!("{provider}:{}", normalize_model_key(model));
        let mut cursors = self.cursors.lock().expect("selector lock poisoned");
        let state = cursors.entry(key).or_default();

        let mut best_index = 0usize;
        let mut best_score: Option<i64> = None;
        for (index, candidate) in candidates.iter().enumerate() {
            let current = state.entry(candidate.id.clone()).or_insert(0);
            *current += weights[index];
            if best_score.is_none_or(|score| *current > score) {
                best_score = Some(*current);
                best_index = index;
            }
        }
        if let Some(current) = state.get_mut(&candidates[best_index].id) {
            *current -= total_weight;
        }
        if state.len() > candidates.len() {
            state.retain(|id, _| candidates.iter().any(|candidate| candidate.id == *id));
        }

        Ok(candidates[best_index].clone())
    }
}

fn quota_to_weight(entry: &ModelQuota, now: OffsetDateTime) -> i64 {
    let mut percent = entry.percent;
    if percent <= 0.0 {
        return 0;
    }
    if percent > 100.0 {
        percent = 100.0;
    }
    let base = percent.powi(3);
    let mut factor = 1.0;
    if let Some(reset) = entry.reset_time {
        let remaining = (reset - now).as_seconds_f64().max(0.0);
        factor += QUOTA_RESET_BOOST * (-remaining / QUOTA_RESET_TAU_SECS).exp();
    }
    let weight = (base * factor).round() as i64;
    weight.max(0)
}
