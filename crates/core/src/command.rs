//! The durable command row and its lifecycle transitions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::CommandId;

/// One durable unit of work.
///
/// A `Command` is a single row in the commands table. All cross-worker
/// coordination happens through conditional updates on these rows; nothing
/// else is shared between workers.
///
/// ## Lifecycle
///
/// ```text
/// enqueued -> leased -> completed
///                    -> canceled
///                    -> released (retry remaining)
///                    -> failed   (retries exhausted)
/// ```
///
/// A leased row carries `is_running = true` with a future `run_expires_at`.
/// When the lease expires without a terminal write (worker crash, stuck
/// handler), any eligible worker may re-lease the row; this is the primary
/// crash-recovery mechanism and the source of at-least-once semantics.
///
/// ## Terminal flags
///
/// Exactly zero or one of `is_completed`, `is_canceled`, `is_failed` is ever
/// true. A terminal row is never leased or mutated again, except by purge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    /// Routes to a registered handler.
    pub name: String,
    /// Worker identity allowed to execute this row.
    pub target: String,
    /// Opaque input blob; the orchestrator never inspects it.
    pub input: Option<String>,
    /// Opaque output blob, set on successful completion.
    pub output: Option<String>,
    /// Earliest instant the row is eligible for leasing.
    pub scheduled_at: DateTime<Utc>,
    /// Maximum single-attempt run time.
    pub timeout: Duration,
    /// Remaining retries; decremented on each non-success. `-1` means
    /// exhausted.
    pub retries_left: i32,
    pub is_running: bool,
    pub running_at: Option<DateTime<Utc>>,
    pub run_expires_at: Option<DateTime<Utc>>,
    pub is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_canceled: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub is_failed: bool,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Command {
    /// True iff any terminal flag is set.
    pub fn is_terminal(&self) -> bool {
        self.is_completed || self.is_canceled || self.is_failed
    }

    /// True iff no worker currently holds a fresh lease on this row.
    pub fn lease_is_free(&self, now: DateTime<Utc>) -> bool {
        !self.is_running || self.run_expires_at.map_or(true, |at| at < now)
    }

    /// True iff a worker with `instance_key` may lease this row at `now`.
    pub fn is_eligible(&self, instance_key: &str, now: DateTime<Utc>) -> bool {
        self.target == instance_key
            && self.scheduled_at <= now
            && !self.is_terminal()
            && self.lease_is_free(now)
    }

    /// Take the lease: mark running with an expiry of `now + lease`.
    pub fn mark_leased(&mut self, now: DateTime<Utc>, lease: Duration) {
        self.is_running = true;
        self.running_at = Some(now);
        self.run_expires_at = Some(now + chrono::Duration::from_std(lease).unwrap_or_default());
    }

    /// Extend the current lease to `now + lease`.
    pub fn extend_lease(&mut self, now: DateTime<Utc>, lease: Duration) {
        self.run_expires_at = Some(now + chrono::Duration::from_std(lease).unwrap_or_default());
    }

    /// Terminal success: clears the lease, records the output.
    pub fn mark_completed(&mut self, now: DateTime<Utc>, output: Option<String>) {
        self.is_running = false;
        self.run_expires_at = None;
        self.is_completed = true;
        self.completed_at = Some(now);
        self.output = output;
    }

    /// Terminal cancellation: clears the lease.
    pub fn mark_canceled(&mut self, now: DateTime<Utc>) {
        self.is_running = false;
        self.run_expires_at = None;
        self.is_canceled = true;
        self.canceled_at = Some(now);
    }

    /// First stage of the fail path: release the lease and burn one retry.
    ///
    /// The row becomes pending again and may be re-leased immediately. The
    /// caller decides terminality afterwards via [`Command::mark_failed`]
    /// when `retries_left` has reached `-1`.
    pub fn release_for_retry(&mut self) {
        self.is_running = false;
        self.run_expires_at = None;
        self.retries_left -= 1;
    }

    /// Second stage of the fail path: mark terminally failed.
    pub fn mark_failed(&mut self, now: DateTime<Utc>) {
        self.is_failed = true;
        self.failed_at = Some(now);
    }

    /// Check the row invariants. Used by tests after every committed
    /// transition; a violation here means a store implementation bug.
    pub fn validate(&self) -> DomainResult<()> {
        let terminal_flags =
            self.is_completed as u8 + self.is_canceled as u8 + self.is_failed as u8;
        if terminal_flags > 1 {
            return Err(DomainError::validation(format!(
                "command {} has {} terminal flags set",
                self.id, terminal_flags
            )));
        }
        if self.is_terminal() && (self.is_running || self.run_expires_at.is_some()) {
            return Err(DomainError::validation(format!(
                "terminal command {} still carries a lease",
                self.id
            )));
        }
        if self.is_running {
            match (self.running_at, self.run_expires_at) {
                (Some(started), Some(expires)) if expires > started => {}
                _ => {
                    return Err(DomainError::validation(format!(
                        "running command {} has an inconsistent lease window",
                        self.id
                    )));
                }
            }
        }
        if self.retries_left < -1 {
            return Err(DomainError::validation(format!(
                "command {} has retries_left {}",
                self.id, self.retries_left
            )));
        }
        if self.retries_left == -1 && !self.is_failed {
            return Err(DomainError::validation(format!(
                "command {} exhausted retries without a failed flag",
                self.id
            )));
        }
        Ok(())
    }
}
