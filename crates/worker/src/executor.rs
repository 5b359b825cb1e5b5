//! Per-command execution: one leased row driven to a terminal transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use anvil_core::{AttemptOutcome, Clock, Command, NewCommand, WorkerConfig};
use anvil_store::{CommandStore, FailTransition};

use crate::registry::HandlerRegistry;

/// Runs one attempt for one leased command.
///
/// The executor owns the attempt lifecycle: a cancellation token scoped to
/// this attempt (seeded from the worker's shutdown token), a timeout timer
/// that cancels it, a heartbeat that extends the lease at half the lease
/// duration, and finally the terminal write. The terminal write is performed
/// after the attempt token has served its purpose, so cancellation never
/// suppresses it; crash-safety beyond that relies on lease expiry.
pub(crate) struct Executor {
    store: Arc<dyn CommandStore>,
    registry: Arc<HandlerRegistry>,
    config: Arc<WorkerConfig>,
    clock: Arc<dyn Clock>,
}

impl Executor {
    pub(crate) fn new(
        store: Arc<dyn CommandStore>,
        registry: Arc<HandlerRegistry>,
        config: Arc<WorkerConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            clock,
        }
    }

    /// Execute the command and persist its outcome. Returns the classified
    /// outcome for worker statistics.
    pub(crate) async fn run(&self, command: Command, shutdown: &CancellationToken) -> AttemptOutcome {
        let lease = self.config.lock_timeout_buffer;
        let attempt = shutdown.child_token();
        let timer_fired = Arc::new(AtomicBool::new(false));

        // Timeout timer, scoped to this attempt only; it does not survive
        // into retries. Recording the flag before cancelling makes the
        // TimedOut-vs-Cancelled classification deterministic when shutdown
        // races the timer.
        let timer = {
            let attempt = attempt.clone();
            let timer_fired = timer_fired.clone();
            let timeout = command.timeout;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        timer_fired.store(true, Ordering::SeqCst);
                        attempt.cancel();
                    }
                    _ = attempt.cancelled() => {}
                }
            })
        };

        // Heartbeat: extend the lease at lease/2 until the attempt ends or
        // ownership is lost. A transient store error is not fatal; the next
        // beat tries again.
        let heartbeat = {
            let store = self.store.clone();
            let attempt = attempt.clone();
            let id = command.id;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(lease / 2) => match store.extend(id, lease).await {
                            Ok(true) => {}
                            Ok(false) => {
                                debug!(command_id = %id, "lease lost, stopping heartbeat");
                                break;
                            }
                            Err(e) => {
                                warn!(command_id = %id, error = %e, "heartbeat extend failed");
                            }
                        },
                        _ = attempt.cancelled() => break,
                    }
                }
            })
        };

        let outcome = match self.registry.get(&command.name) {
            None => {
                warn!(command_id = %command.id, name = %command.name, "no handler registered");
                AttemptOutcome::NotFound
            }
            Some(registration) => {
                let fut = registration.invoke(command.input.clone(), attempt.clone());
                tokio::select! {
                    outcome = fut => AttemptOutcome::from(outcome),
                    _ = attempt.cancelled() => AttemptOutcome::Cancelled,
                }
            }
        };

        // A handler that observed cancellation reports Cancelled; if our
        // timer is what fired, the attempt actually timed out.
        let outcome = match outcome {
            AttemptOutcome::Cancelled if timer_fired.load(Ordering::SeqCst) => {
                AttemptOutcome::TimedOut
            }
            other => other,
        };

        // Stop the heartbeat and the timer before touching the row again.
        attempt.cancel();
        let _ = heartbeat.await;
        let _ = timer.await;

        self.write_terminal(&command, &outcome).await;
        outcome
    }

    /// Persist the terminal transition and its chained successors.
    ///
    /// Guarded updates can legitimately match zero rows when the lease was
    /// lost mid-run: the work has been superseded by whoever re-leased the
    /// row, and the result here is discarded.
    async fn write_terminal(&self, command: &Command, outcome: &AttemptOutcome) {
        let chain = self
            .registry
            .get(&command.name)
            .map(|registration| registration.chain());
        let now = self.clock.now();

        let materialize = |rule: &[NewCommand]| -> Vec<Command> {
            rule.iter()
                .map(|successor| successor.materialize(&self.config, now))
                .collect()
        };

        match outcome {
            AttemptOutcome::Success { output } => {
                let successors = chain.map(|c| materialize(c.success_rule())).unwrap_or_default();
                match self
                    .store
                    .complete(command.id, output.clone(), &successors)
                    .await
                {
                    Ok(true) => debug!(command_id = %command.id, "command completed"),
                    Ok(false) => {
                        debug!(command_id = %command.id, "completion superseded, row not owned")
                    }
                    Err(e) => {
                        warn!(command_id = %command.id, error = %e, "terminal complete failed")
                    }
                }
            }
            AttemptOutcome::Cancelled => {
                let successors = chain
                    .map(|c| materialize(c.cancellation_rule()))
                    .unwrap_or_default();
                match self.store.cancel(command.id, &successors).await {
                    Ok(true) => debug!(command_id = %command.id, "command canceled"),
                    Ok(false) => {
                        debug!(command_id = %command.id, "cancellation superseded, row not owned")
                    }
                    Err(e) => {
                        warn!(command_id = %command.id, error = %e, "terminal cancel failed")
                    }
                }
            }
            AttemptOutcome::Failed | AttemptOutcome::NotFound | AttemptOutcome::TimedOut => {
                let successors = chain.map(|c| materialize(c.failure_rule())).unwrap_or_default();
                match self.store.fail(command.id, &successors).await {
                    Ok(FailTransition::Retrying) => {
                        debug!(
                            command_id = %command.id,
                            outcome = outcome.label(),
                            "attempt failed, retry pending"
                        )
                    }
                    Ok(FailTransition::Failed) => {
                        debug!(command_id = %command.id, outcome = outcome.label(), "command failed")
                    }
                    Ok(FailTransition::Superseded) => {
                        debug!(command_id = %command.id, "failure superseded, row not owned")
                    }
                    Err(e) => warn!(command_id = %command.id, error = %e, "terminal fail failed"),
                }
            }
        }
    }
}
