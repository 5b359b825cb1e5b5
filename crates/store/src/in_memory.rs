//! In-memory command store for tests and demos.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use anvil_core::{Clock, Command, CommandId};

use super::r#trait::{CommandStore, FailTransition, QueueStats, StoreError};

/// In-memory implementation of [`CommandStore`].
///
/// Honors exactly the same lease and terminal predicates as the Postgres
/// store, evaluated against the injected clock, so lease semantics can be
/// tested deterministically by advancing a [`anvil_core::ManualClock`].
pub struct InMemoryCommandStore {
    clock: Arc<dyn Clock>,
    rows: RwLock<HashMap<CommandId, Command>>,
}

impl std::fmt::Debug for InMemoryCommandStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCommandStore")
            .field("rows", &self.rows.read().map(|r| r.len()).unwrap_or(0))
            .finish()
    }
}

impl InMemoryCommandStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            rows: RwLock::new(HashMap::new()),
        }
    }

    pub fn arc(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self::new(clock))
    }

    /// Snapshot of every row, for test assertions.
    pub fn snapshot(&self) -> Vec<Command> {
        let mut rows: Vec<_> = self
            .rows
            .read()
            .expect("store lock poisoned")
            .values()
            .cloned()
            .collect();
        rows.sort_by_key(|c| (c.scheduled_at, c.id));
        rows
    }

    fn insert_successors(rows: &mut HashMap<CommandId, Command>, successors: &[Command]) {
        for successor in successors {
            rows.insert(successor.id, successor.clone());
        }
    }
}

#[async_trait::async_trait]
impl CommandStore for InMemoryCommandStore {
    async fn insert(&self, command: &Command) -> Result<(), StoreError> {
        let mut rows = self.rows.write().expect("store lock poisoned");
        if rows.contains_key(&command.id) {
            return Err(StoreError::AlreadyExists(command.id));
        }
        rows.insert(command.id, command.clone());
        Ok(())
    }

    async fn get(&self, id: CommandId) -> Result<Option<Command>, StoreError> {
        Ok(self
            .rows
            .read()
            .expect("store lock poisoned")
            .get(&id)
            .cloned())
    }

    async fn acquire(
        &self,
        target: &str,
        lease: Duration,
    ) -> Result<Option<Command>, StoreError> {
        let now = self.clock.now();
        let mut rows = self.rows.write().expect("store lock poisoned");

        // FIFO by scheduled_at, then id, matching the Postgres ordering.
        let candidate = rows
            .values()
            .filter(|c| c.is_eligible(target, now))
            .min_by_key(|c| (c.scheduled_at, c.id))
            .map(|c| c.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let row = rows.get_mut(&id).expect("candidate row vanished");
        row.mark_leased(now, lease);
        Ok(Some(row.clone()))
    }

    async fn extend(&self, id: CommandId, lease: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut rows = self.rows.write().expect("store lock poisoned");

        match rows.get_mut(&id) {
            Some(row) if row.is_running && row.run_expires_at.map_or(false, |at| at > now) => {
                row.extend_lease(now, lease);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        id: CommandId,
        output: Option<String>,
        successors: &[Command],
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut rows = self.rows.write().expect("store lock poisoned");

        let transitioned = match rows.get_mut(&id) {
            Some(row) if row.is_running && !row.is_completed => {
                row.mark_completed(now, output);
                true
            }
            _ => false,
        };

        if transitioned {
            Self::insert_successors(&mut rows, successors);
        }
        Ok(transitioned)
    }

    async fn cancel(&self, id: CommandId, successors: &[Command]) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut rows = self.rows.write().expect("store lock poisoned");

        let transitioned = match rows.get_mut(&id) {
            Some(row) if row.is_running && !row.is_canceled => {
                row.mark_canceled(now);
                true
            }
            _ => false,
        };

        if transitioned {
            Self::insert_successors(&mut rows, successors);
        }
        Ok(transitioned)
    }

    async fn fail(
        &self,
        id: CommandId,
        successors: &[Command],
    ) -> Result<FailTransition, StoreError> {
        let now = self.clock.now();
        let mut rows = self.rows.write().expect("store lock poisoned");

        // Stage 1: release and decrement, guarded by lease ownership.
        let released = match rows.get_mut(&id) {
            Some(row) if row.is_running && !row.is_completed => {
                row.release_for_retry();
                true
            }
            _ => false,
        };
        if !released {
            return Ok(FailTransition::Superseded);
        }

        // Stage 2: terminal iff retries are exhausted.
        let failed = match rows.get_mut(&id) {
            Some(row) if !row.is_failed && row.retries_left == -1 => {
                row.mark_failed(now);
                true
            }
            _ => false,
        };

        if failed {
            Self::insert_successors(&mut rows, successors);
            Ok(FailTransition::Failed)
        } else {
            Ok(FailTransition::Retrying)
        }
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut rows = self.rows.write().expect("store lock poisoned");
        let before = rows.len();
        rows.retain(|_, c| {
            let terminal_at = if c.is_completed {
                c.completed_at
            } else if c.is_canceled {
                c.canceled_at
            } else if c.is_failed {
                c.failed_at
            } else {
                None
            };
            terminal_at.map_or(true, |at| at >= older_than)
        });
        Ok((before - rows.len()) as u64)
    }

    async fn stats(&self, target: &str) -> Result<QueueStats, StoreError> {
        let rows = self.rows.read().expect("store lock poisoned");
        let mut stats = QueueStats::default();

        for row in rows.values().filter(|c| c.target == target) {
            if row.is_completed {
                stats.completed += 1;
            } else if row.is_canceled {
                stats.canceled += 1;
            } else if row.is_failed {
                stats.failed += 1;
            } else if row.is_running {
                stats.running += 1;
            } else {
                stats.pending += 1;
            }
        }
        Ok(stats)
    }
}
