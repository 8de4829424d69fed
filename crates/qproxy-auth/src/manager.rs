use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::auth::Auth;
use crate::client::shared_client;

pub type AuthMap = HashMap<String, Arc<Auth>>;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("auth not found: {0}")]
    NotFound(String),
    #[error("http client: {0}")]
    Client(String),
}

/// Owner of the mutable auth set.
///
/// The set lives behind an `ArcSwap` snapshot: readers load the current
/// map without locking, and every mutation installs a new map with the
/// touched record replaced by a fresh `Arc<Auth>`. A reader holding an old
/// snapshot keeps seeing the old record in its entirety.
pub struct Manager {
    auths: ArcSwap<AuthMap>,
    proxy: Option<String>,
}

impl Manager {
    pub fn new(proxy: Option<String>) -> Self {
        Self {
            auths: ArcSwap::from_pointee(AuthMap::new()),
            proxy,
        }
    }

    /// Replaces the whole set, typically at startup from the auth files.
    pub fn load(&self, auths: Vec<Auth>) {
        let mut map = AuthMap::with_capacity(auths.len());
        for auth in auths {
            if auth.id.trim().is_empty() {
                continue;
            }
            map.insert(auth.id.clone(), Arc::new(auth));
        }
        self.auths.store(Arc::new(map));
    }

    /// Snapshot of all auths, sorted by id for deterministic iteration.
    pub fn list(&self) -> Vec<Arc<Auth>> {
        let snapshot = self.auths.load();
        let mut out: Vec<Arc<Auth>> = snapshot.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn get(&self, id: &str) -> Option<Arc<Auth>> {
        self.auths.load().get(id).cloned()
    }

    /// Replaces an existing record with a clone carrying the new state.
    /// The stored auth is swapped wholesale, never mutated in place.
    pub fn update(&self, auth: Auth) -> Result<Arc<Auth>, ManagerError> {
        let id = auth.id.clone();
        if !self.auths.load().contains_key(&id) {
            return Err(ManagerError::NotFound(id));
        }
        let stored = Arc::new(auth);
        let inserted = stored.clone();
        self.auths.rcu(|current| {
            let mut map = AuthMap::clone(current);
            map.insert(id.clone(), stored.clone());
            map
        });
        Ok(inserted)
    }

    /// Inserts or replaces a record.
    pub fn upsert(&self, auth: Auth) -> Arc<Auth> {
        let id = auth.id.clone();
        let stored = Arc::new(auth);
        let inserted = stored.clone();
        self.auths.rcu(|current| {
            let mut map = AuthMap::clone(current);
            map.insert(id.clone(), stored.clone());
            map
        });
        inserted
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut removed = false;
        self.auths.rcu(|current| {
            let mut map = AuthMap::clone(current);
            removed = map.remove(id).is_some();
            map
        });
        removed
    }

    /// Shared HTTP client honoring the manager's configured proxy.
    pub fn http_client(&self) -> Result<Arc<wreq::Client>, ManagerError> {
        shared_client(self.proxy.as_deref()).map_err(ManagerError::Client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(id: &str) -> Auth {
        Auth {
            id: id.to_string(),
            provider: "antigravity".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn update_replaces_whole_record() {
        let manager = Manager::new(None);
        manager.load(vec![auth("a")]);

        let before = manager.get("a").unwrap();
        let mut updated = (*before).clone();
        updated.label = "renamed".to_string();
        manager.update(updated).unwrap();

        // The old snapshot clone is untouched; the stored record is new.
        assert_eq!(before.label, "");
        assert_eq!(manager.get("a").unwrap().label, "renamed");
    }

    #[test]
    fn update_unknown_id_fails() {
        let manager = Manager::new(None);
        assert!(matches!(
            manager.update(auth("ghost")),
            Err(ManagerError::NotFound(_))
        ));
    }

    #[test]
    fn list_is_sorted_by_id() {
        let manager = Manager::new(None);
        manager.load(vec![auth("b"), auth("a"), auth("c")]);
        let list = manager.list();
        let ids: Vec<&str> = list.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }
}
