//! The Rust SDK for Flagent, evaluating feature flags locally against a cached snapshot.
//!
//! # Overview
//!
//! The SDK revolves around an [`OfflineManager`] that keeps a [`Snapshot`] of all flag
//! definitions and evaluates flags for `entities` without a network round trip. Each entity has
//! an id that seeds deterministic bucketing and an [`EntityContext`] consulted by segment
//! constraints. Evaluation results in an [`EvaluationResult`] carrying the assigned variant and
//! the [`EvaluationReason`] for it.
//!
//! Snapshots are fetched from a [`SnapshotSource`] ([`HttpSnapshotSource`] talks to the Flagent
//! server), persisted through a [`SnapshotStorage`] so that restarts can skip the network, and
//! refreshed in the background on a timer and on real-time change notifications delivered by
//! [`SseClient`].
//!
//! ```no_run
//! # async fn run() -> flagent::Result<()> {
//! use flagent::{AttributeValue, HttpSourceConfig, OfflineConfig};
//!
//! let source = HttpSourceConfig::new("https://flags.example.com/api/v1")
//!     .api_key("api-key")
//!     .to_source()?;
//! let manager = OfflineConfig::new().to_manager(source);
//! manager.bootstrap(false).await?;
//!
//! let context = [("tier".to_owned(), AttributeValue::from("premium"))].into();
//! if manager.is_enabled("new-checkout", "user-1", context)? {
//!     // ...
//! }
//! # Ok(())
//! # }
//! ```
//!
//! For evaluating against a snapshot you manage yourself, use [`evaluate`] and
//! [`evaluate_batch`] directly.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Only [`OfflineManager::bootstrap`] can hard-fail. Once bootstrapped, evaluations only fail if
//! the cache was cleared, and background failures (refreshes, persistence writes, stream errors)
//! are logged and retried later. Missing or disabled flags are not errors: they are reported
//! through [`EvaluationReason`].
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages under the `flagent` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into SDK operations.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod attributes;
mod cache;
mod config;
mod error;
mod eval;
mod fetcher;
mod manager;
mod rules;
mod sharder;
mod snapshot;
mod snapshot_store;
mod source;
mod sse;
mod storage;
mod wire;

pub use attributes::{AttributeValue, EntityContext};
pub use cache::{cache_key, EvaluationCache, InMemoryCache};
pub use config::OfflineConfig;
pub use error::{Error, Result};
pub use eval::{
    evaluate, evaluate_batch, EvaluationReason, EvaluationRequest, EvaluationResult, FlagSelector,
};
pub use manager::{LifecycleState, OfflineManager};
pub use snapshot::{
    Attachment, Constraint, ConstraintOperator, Distribution, Flag, Segment, Snapshot, Variant,
};
pub use source::{HttpSnapshotSource, HttpSourceConfig, SnapshotSource};
pub use sse::{ConnectionStatus, FlagUpdateEvent, SseClient, SseConfig, SseReceivers};
pub use storage::{FileSnapshotStorage, InMemorySnapshotStorage, SnapshotStorage};
pub use wire::{
    TryParse, WireConstraint, WireDistribution, WireFlag, WireSegment, WireSnapshot, WireVariant,
};
