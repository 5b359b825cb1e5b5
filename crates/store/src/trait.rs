//! The command-store boundary.
//!
//! A store keeps the durable command rows and exposes the conditional
//! mutations the orchestrator is built on. The only isolation a backend must
//! provide is that each conditional update intending to mutate a single row
//! succeeds or fails atomically; bulk reads need not be serializable.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use anvil_core::{Command, CommandId};

/// Store error.
///
/// Errors carry no retry policy: a failed store call surfaces to the caller
/// and the polling loop tries again on its next tick.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("command already exists: {0}")]
    AlreadyExists(CommandId),
    #[error("command not found: {0}")]
    NotFound(CommandId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result of the two-stage fail transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailTransition {
    /// The lease was released and a retry remains; the row is pending again.
    Retrying,
    /// Retries are exhausted; the row is terminally failed and the
    /// on-failure successors were inserted.
    Failed,
    /// The guarded update matched no row: the lease had already been lost
    /// and another worker owns the outcome now.
    Superseded,
}

/// Row counts for one target, for operational visibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub canceled: u64,
    pub failed: u64,
}

/// Durable persistence of command rows.
///
/// ## Leasing
///
/// [`acquire`](CommandStore::acquire) and [`extend`](CommandStore::extend)
/// implement distributed mutual exclusion over single rows: a lease is
/// `is_running = true` with a future `run_expires_at`, and every mutation
/// re-checks freshness in its predicate so a lost race shows up as a
/// zero-row update rather than a double execution.
///
/// ## Terminal transitions
///
/// [`complete`](CommandStore::complete), [`cancel`](CommandStore::cancel) and
/// [`fail`](CommandStore::fail) each commit the row's terminal state together
/// with the insertion of its chained successor rows, or commit nothing.
/// Calls against rows that already lost their lease are no-ops by predicate.
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Insert one fresh pending row.
    async fn insert(&self, command: &Command) -> Result<(), StoreError>;

    /// Point lookup by id.
    async fn get(&self, id: CommandId) -> Result<Option<Command>, StoreError>;

    /// Atomically lease one eligible row for `target`.
    ///
    /// Eligible means: matching target, `scheduled_at` due, non-terminal,
    /// and the lease free (`is_running = false` or expired). Returns `None`
    /// when nothing is eligible or the race for the picked row was lost;
    /// the caller polls again later rather than retrying inline.
    ///
    /// Tie-break when several rows are eligible: FIFO by `scheduled_at`,
    /// then id. No cross-command fairness is promised.
    async fn acquire(&self, target: &str, lease: Duration)
        -> Result<Option<Command>, StoreError>;

    /// Extend a held lease to `now + lease`.
    ///
    /// Returns `false` when the lease was already lost (expired or
    /// re-leased elsewhere); the heartbeat stops on `false`.
    async fn extend(&self, id: CommandId, lease: Duration) -> Result<bool, StoreError>;

    /// Terminal success. Guarded by `is_running AND NOT is_completed`;
    /// inserts `successors` iff the guard matched. Returns whether the row
    /// transitioned.
    async fn complete(
        &self,
        id: CommandId,
        output: Option<String>,
        successors: &[Command],
    ) -> Result<bool, StoreError>;

    /// Terminal cancellation. Guarded by `is_running AND NOT is_canceled`;
    /// inserts `successors` iff the guard matched.
    async fn cancel(&self, id: CommandId, successors: &[Command]) -> Result<bool, StoreError>;

    /// The two-stage fail path, in one transaction: release the lease and
    /// decrement `retries_left`; then, iff the decrement reached `-1`, mark
    /// the row failed and insert `successors`.
    async fn fail(
        &self,
        id: CommandId,
        successors: &[Command],
    ) -> Result<FailTransition, StoreError>;

    /// Delete terminal rows whose terminal timestamp is older than the
    /// cutoff. Returns the number of rows removed.
    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Row counts for one target.
    async fn stats(&self, target: &str) -> Result<QueueStats, StoreError>;
}
