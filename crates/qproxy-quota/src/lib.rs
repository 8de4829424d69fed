//! Quota model, durable quota store, and shared-quota group registry.
//!
//! Snapshots are keyed by `(auth_id, normalized model key)`. The store owns
//! the quota file; the poller and the proactive tracker mutate it only
//! through this crate's API. A parallel mirror of the same snapshot lives
//! in each auth's metadata under [`metadata::METADATA_KEY`] for legacy
//! readers.

pub mod groups;
pub mod metadata;
mod normalize;
mod store;
mod types;

pub use normalize::{normalize_model_key, strip_date_suffix};
pub use store::{Store, StoreError, StoreResult};
pub use types::{ModelQuota, StoreEntry, clamp_percent};
