//! Enqueue API: write a command row and wake the local worker.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use anvil_core::{Clock, Command, CommandDefinition, CommandId, DomainError, NewCommand, WorkerConfig};
use anvil_store::{CommandStore, QueueStats, StoreError};

/// Enqueue error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnqueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Client handle for enqueuing commands.
///
/// Cheap to clone. Defaults for target, timeout and retries come from the
/// worker configuration; a successful insert fires the local new-work signal
/// so an idle worker loop in this process wakes immediately. Other worker
/// processes see the row on their next poll.
#[derive(Clone)]
pub struct CommandQueue {
    store: Arc<dyn CommandStore>,
    config: Arc<WorkerConfig>,
    clock: Arc<dyn Clock>,
    notify: Arc<Notify>,
}

impl CommandQueue {
    pub(crate) fn new(
        store: Arc<dyn CommandStore>,
        config: Arc<WorkerConfig>,
        clock: Arc<dyn Clock>,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
            notify,
        }
    }

    /// Insert one fresh command row, scheduled at `now + delay`.
    pub async fn enqueue(&self, request: NewCommand) -> Result<CommandId, EnqueueError> {
        let command = request.materialize(&self.config, self.clock.now());
        self.store.insert(&command).await?;
        debug!(command_id = %command.id, name = %command.name, "command enqueued");
        self.notify.notify_one();
        Ok(command.id)
    }

    /// Enqueue a typed command under its canonical name.
    pub async fn enqueue_command<C: CommandDefinition>(
        &self,
        command: &C,
    ) -> Result<CommandId, EnqueueError> {
        self.enqueue(NewCommand::of(command)?).await
    }

    /// Point lookup, e.g. to poll a command's terminal state.
    pub async fn get(&self, id: CommandId) -> Result<Option<Command>, EnqueueError> {
        Ok(self.store.get(id).await?)
    }

    /// Row counts for this worker's target.
    pub async fn stats(&self) -> Result<QueueStats, EnqueueError> {
        Ok(self.store.stats(&self.config.instance_key).await?)
    }
}
