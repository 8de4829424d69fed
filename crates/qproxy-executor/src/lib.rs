//! Runtime side of the routing core: the Antigravity executor, the quota
//! poller, the proactive quota tracker, and the contracts they consume
//! (model registry, usage collection, dialect translation, alias
//! resolution).

pub mod alias;
pub mod antigravity;
mod error;
mod json;
pub mod poller;
pub mod registry;
pub mod tracker;
pub mod translator;
pub mod usage;

pub use antigravity::{AntigravityExecutor, ExecuteOutcome, ExecuteRequest, StreamOutcome};
pub use error::{ExecutorError, ExecutorResult};
pub use poller::Poller;
pub use registry::{ModelInfo, ModelRegistry, ThinkingSupport};
pub use tracker::{QuotaTracker, RecoveryScheduler, RefreshFn};
pub use translator::{DialectTranslator, IdentityTranslator};
pub use usage::{UsageCollector, UsageDetail, UsageReporter};
