//! Persistence seams consumed by the scheduler and the executor.
//!
//! Two keyed record stores back the orchestration decisions:
//!
//! - [`TriggerStore`]: the trigger bookmarks, addressable by
//!   `TriggerContext::uid()`, with point lookup and upsert
//! - [`ExecutionRepository`]: execution lookup by id, used by the scheduler's
//!   execution-not-running guard
//!
//! Implementations must be thread-safe; the in-memory ones here serve
//! embedded runs and tests, database-backed ones live behind the same
//! traits.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

mod memory;

pub use memory::{MemoryExecutionRepository, MemoryTriggerStore};

use crate::core::{Execution, Trigger, TriggerContext};

/// Storage layer error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The record store rejected the operation.
    #[error("storage error: {0}")]
    Backend(String),

    /// The operation is not supported by this backend.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Store of trigger bookmarks.
///
/// A deleted uid is tombstoned: later saves for it are ignored, so a tick
/// that was mid-evaluation when the owning flow was removed cannot
/// resurrect the bookmark.
#[async_trait]
pub trait TriggerStore: Send + Sync {
    /// Last saved bookmark for this (flow, trigger) pair.
    async fn find_last(&self, context: &TriggerContext) -> Result<Option<Trigger>>;

    /// All bookmarks, used to initialize the schedulable set.
    async fn find_all(&self) -> Result<Vec<Trigger>>;

    /// Create or replace a bookmark.
    async fn save(&self, trigger: Trigger) -> Result<()>;

    /// Drop a bookmark and tombstone its uid.
    async fn delete(&self, context: &TriggerContext) -> Result<()>;
}

/// Execution lookup used to decide whether a trigger's previous firing is
/// still in flight. Fed by an indexer subscribed to the execution queue, so
/// reads may lag writes; callers treat "not found" as eventual-consistency
/// lag, not as an error.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Execution>>;

    async fn save(&self, execution: Execution) -> Result<()>;
}
