//! The polling worker loop.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use anvil_core::{AttemptOutcome, Clock, WorkerConfig};
use anvil_store::CommandStore;

use crate::executor::Executor;
use crate::registry::HandlerRegistry;

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub executed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub canceled: u64,
    pub not_found: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &AttemptOutcome) {
        self.executed += 1;
        match outcome {
            AttemptOutcome::Success { .. } => self.succeeded += 1,
            AttemptOutcome::Cancelled => self.canceled += 1,
            AttemptOutcome::Failed => self.failed += 1,
            AttemptOutcome::NotFound => self.not_found += 1,
            AttemptOutcome::TimedOut => self.timed_out += 1,
        }
    }
}

/// Bounded-concurrency polling loop for one worker identity.
///
/// The loop drains the store (one acquire per spawned executor) until either
/// nothing is eligible or `max_in_flight` executors are running, reaps
/// finished executors, then sleeps up to `poll_interval` on a signal that
/// fires on shutdown, on a local enqueue, or when an executor finishes and
/// frees capacity.
pub(crate) struct Worker {
    store: Arc<dyn CommandStore>,
    registry: Arc<HandlerRegistry>,
    config: Arc<WorkerConfig>,
    clock: Arc<dyn Clock>,
    notify: Arc<Notify>,
    shutdown: CancellationToken,
    stats: Arc<Mutex<WorkerStats>>,
}

impl Worker {
    pub(crate) fn new(
        store: Arc<dyn CommandStore>,
        registry: Arc<HandlerRegistry>,
        config: Arc<WorkerConfig>,
        clock: Arc<dyn Clock>,
        notify: Arc<Notify>,
        shutdown: CancellationToken,
        stats: Arc<Mutex<WorkerStats>>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            clock,
            notify,
            shutdown,
            stats,
        }
    }

    pub(crate) async fn run(self) {
        info!(instance_key = %self.config.instance_key, "worker started");

        let executor = Arc::new(Executor::new(
            self.store.clone(),
            self.registry.clone(),
            self.config.clone(),
            self.clock.clone(),
        ));
        let mut in_flight: JoinSet<AttemptOutcome> = JoinSet::new();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            // Polling: drain eligible rows up to the concurrency cap.
            while in_flight.len() < self.config.max_in_flight {
                if self.shutdown.is_cancelled() {
                    break;
                }
                match self
                    .store
                    .acquire(&self.config.instance_key, self.config.lock_timeout_buffer)
                    .await
                {
                    Ok(Some(command)) => {
                        debug!(
                            command_id = %command.id,
                            name = %command.name,
                            "leased command"
                        );
                        let executor = executor.clone();
                        let shutdown = self.shutdown.clone();
                        in_flight
                            .spawn(async move { executor.run(command, &shutdown).await });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // Transient store failure: give up this cycle and
                        // retry after the idle sleep.
                        warn!(error = %e, "failed to poll for commands");
                        break;
                    }
                }
            }

            // Reaping: collect whatever has finished without blocking.
            while let Some(joined) = in_flight.try_join_next() {
                self.reap(joined);
            }

            // Idle: until shutdown, a local enqueue, a finished executor
            // freeing capacity, or the poll interval elapsing.
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.notify.notified() => {}
                // Disabled for this cycle when nothing is in flight: an
                // empty JoinSet yields None and the pattern does not match.
                Some(joined) = in_flight.join_next() => {
                    self.reap(joined);
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        // Shutdown: executors observe the shutdown token through their
        // attempt tokens and still write their terminal transitions; wait
        // for those writes before returning.
        info!(
            instance_key = %self.config.instance_key,
            in_flight = in_flight.len(),
            "worker draining"
        );
        while let Some(joined) = in_flight.join_next().await {
            self.reap(joined);
        }
        info!(instance_key = %self.config.instance_key, "worker stopped");
    }

    fn reap(&self, joined: Result<AttemptOutcome, tokio::task::JoinError>) {
        match joined {
            Ok(outcome) => {
                self.stats
                    .lock()
                    .expect("stats lock poisoned")
                    .record(&outcome);
            }
            Err(e) => {
                // A panicking handler kills only its own attempt; the lease
                // expires and the row is retried by re-lease.
                warn!(error = %e, "executor task aborted");
            }
        }
    }
}
