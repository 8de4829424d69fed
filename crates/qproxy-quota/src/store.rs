use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;

use crate::normalize::normalize_model_key;
use crate::types::{ModelQuota, StoreEntry, clamp_percent, normalize_quota_map};

const QUOTA_FILE_NAME: &str = "quota.json";
const SCHEMA_VERSION: u32 = 1;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("quota store: io error: {0}")]
    Io(#[from] io::Error),
    #[error("quota store: serialize failed: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreData {
    schema_version: u32,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    written_at: Option<OffsetDateTime>,
    #[serde(default)]
    auth_quotas: HashMap<String, StoreEntry>,
}

impl Default for StoreData {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            written_at: None,
            auth_quotas: HashMap::new(),
        }
    }
}

/// Durable quota snapshots, one file for the whole auth pool.
///
/// Mutations are serialized under the write lock; reads return deep copies
/// so callers never observe in-progress updates. [`Store::flush`] writes a
/// sibling tmp file and renames it over the target, so a partial file never
/// appears at the target path.
#[derive(Debug)]
pub struct Store {
    inner: RwLock<Inner>,
}

#[derive(Debug)]
struct Inner {
    file_path: PathBuf,
    data: StoreData,
    dirty: bool,
}

impl Store {
    /// Opens the store at `dir/quota.json`, creating the directory if
    /// needed. A missing or corrupt file starts the store empty.
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        Ok(Self::with_path(dir.join(QUOTA_FILE_NAME)))
    }

    /// Default location: `${cache_dir}/cliproxy/quota.json`.
    pub fn open_default() -> StoreResult<Self> {
        let base = dirs::cache_dir().unwrap_or_else(std::env::temp_dir);
        Self::open(base.join("cliproxy"))
    }

    /// Opens the store at an explicit file path.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let file_path = path.into();
        let data = load(&file_path);
        Self {
            inner: RwLock::new(Inner {
                file_path,
                data,
                dirty: false,
            }),
        }
    }

    /// Stored percent for the normalized key, falling back to `*`.
    pub fn get_percent(&self, auth_id: &str, model: &str) -> Option<f64> {
        self.get_model_quota(auth_id, model)
            .map(|entry| clamp_percent(entry.percent))
    }

    /// Stored quota entry for the normalized key, falling back to `*`.
    pub fn get_model_quota(&self, auth_id: &str, model: &str) -> Option<ModelQuota> {
        let inner = self.inner.read().expect("quota store lock poisoned");
        let entry = inner.data.auth_quotas.get(auth_id)?;
        let mut lookup = normalize_model_key(model);
        if lookup.is_empty() {
            lookup = "*".to_string();
        }
        entry
            .models
            .get(&lookup)
            .or_else(|| entry.models.get("*"))
            .cloned()
    }

    /// Deep copy of one auth's entry.
    pub fn get_entry(&self, auth_id: &str) -> Option<StoreEntry> {
        let inner = self.inner.read().expect("quota store lock poisoned");
        inner.data.auth_quotas.get(auth_id).cloned()
    }

    /// Replaces an auth's snapshot. Returns `false` (and stays clean) when
    /// the provider and the normalized model map are unchanged.
    pub fn set(
        &self,
        auth_id: &str,
        provider: &str,
        models: &HashMap<String, ModelQuota>,
        updated_at: OffsetDateTime,
    ) -> bool {
        if auth_id.is_empty() || models.is_empty() {
            return false;
        }
        let normalized = normalize_quota_map(models);
        if normalized.is_empty() {
            return false;
        }

        let mut inner = self.inner.write().expect("quota store lock poisoned");
        if let Some(existing) = inner.data.auth_quotas.get(auth_id)
            && existing.provider == provider
            && quota_map_equal(&existing.models, &normalized)
        {
            return false;
        }
        inner.data.auth_quotas.insert(
            auth_id.to_string(),
            StoreEntry {
                provider: provider.to_string(),
                updated_at: Some(updated_at.to_offset(time::UtcOffset::UTC)),
                models: normalized,
            },
        );
        inner.dirty = true;
        true
    }

    pub fn delete(&self, auth_id: &str) {
        if auth_id.is_empty() {
            return;
        }
        let mut inner = self.inner.write().expect("quota store lock poisoned");
        if inner.data.auth_quotas.remove(auth_id).is_some() {
            inner.dirty = true;
        }
    }

    /// Persists the envelope if dirty. Atomic: serialize to `<path>.tmp`,
    /// then rename over the target.
    pub fn flush(&self) -> StoreResult<()> {
        let mut inner = self.inner.write().expect("quota store lock poisoned");
        if !inner.dirty {
            return Ok(());
        }
        inner.data.written_at = Some(OffsetDateTime::now_utc());
        inner.data.schema_version = SCHEMA_VERSION;

        let raw = serde_json::to_vec_pretty(&inner.data)?;
        if let Some(parent) = inner.file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = inner.file_path.with_extension("json.tmp");
        fs::write(&tmp_path, &raw)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        }
        if let Err(err) = fs::rename(&tmp_path, &inner.file_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        inner.dirty = false;
        Ok(())
    }
}

fn load(path: &Path) -> StoreData {
    let raw = match fs::read(path) {
        Ok(raw) if !raw.is_empty() => raw,
        Ok(_) => return StoreData::default(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return StoreData::default(),
        Err(err) => {
            warn!(event = "quota_store_load", path = %path.display(), error = %err);
            return StoreData::default();
        }
    };
    match serde_json::from_slice::<StoreData>(&raw) {
        Ok(data) => data,
        Err(err) => {
            warn!(event = "quota_store_load", path = %path.display(), error = %err);
            StoreData::default()
        }
    }
}

fn quota_map_equal(a: &HashMap<String, ModelQuota>, b: &HashMap<String, ModelQuota>) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|(key, left)| {
        b.get(key)
            .is_some_and(|right| left.percent == right.percent && left.reset_time == right.reset_time)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota(percent: f64) -> ModelQuota {
        ModelQuota {
            percent,
            ..Default::default()
        }
    }

    #[test]
    fn set_and_get_with_wildcard_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let mut models = HashMap::new();
        models.insert(
            "claude-sonnet-4-5".to_string(),
            ModelQuota {
                percent: 75.5,
                reset_time: Some(OffsetDateTime::now_utc()),
                ..Default::default()
            },
        );
        models.insert("*".to_string(), quota(50.0));

        assert!(store.set("auth-123", "antigravity", &models, OffsetDateTime::now_utc()));
        assert_eq!(store.get_percent("auth-123", "claude-sonnet-4-5"), Some(75.5));
        assert_eq!(store.get_percent("auth-123", "unknown-model"), Some(50.0));
        assert_eq!(store.get_percent("auth-999", "any"), None);
    }

    #[test]
    fn set_unchanged_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let mut models = HashMap::new();
        models.insert("gpt-4".to_string(), quota(60.0));

        assert!(store.set("auth-1", "openai", &models, OffsetDateTime::now_utc()));
        assert!(!store.set("auth-1", "openai", &models, OffsetDateTime::now_utc()));
    }

    #[test]
    fn flush_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let mut models = HashMap::new();
        models.insert("claude-opus-4".to_string(), quota(80.0));
        store.set("auth-abc", "antigravity", &models, OffsetDateTime::now_utc());
        store.flush().unwrap();

        let file_path = dir.path().join(QUOTA_FILE_NAME);
        assert!(file_path.exists());
        assert!(!dir.path().join("quota.json.tmp").exists());

        let reloaded = Store::open(dir.path()).unwrap();
        assert_eq!(reloaded.get_percent("auth-abc", "claude-opus-4"), Some(80.0));
        let entry = reloaded.get_entry("auth-abc").unwrap();
        assert_eq!(entry.provider, "antigravity");
    }

    #[test]
    fn flush_without_changes_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.flush().unwrap();
        assert!(!dir.path().join(QUOTA_FILE_NAME).exists());
    }

    #[test]
    fn delete_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let mut models = HashMap::new();
        models.insert("*".to_string(), quota(100.0));
        store.set("auth-del", "test", &models, OffsetDateTime::now_utc());
        store.delete("auth-del");
        assert_eq!(store.get_percent("auth-del", "*"), None);
    }

    #[test]
    fn get_entry_is_a_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let mut models = HashMap::new();
        models.insert("model-a".to_string(), quota(30.0));
        models.insert("model-b".to_string(), quota(70.0));
        store.set("auth-entry", "provider-x", &models, OffsetDateTime::now_utc());

        let mut entry = store.get_entry("auth-entry").unwrap();
        assert_eq!(entry.models.len(), 2);
        entry.models.clear();
        assert_eq!(store.get_entry("auth-entry").unwrap().models.len(), 2);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(QUOTA_FILE_NAME);
        fs::write(&path, b"{not json").unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.get_percent("any", "any"), None);
    }
}
