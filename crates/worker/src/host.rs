//! Host: supervised start/stop of one worker loop.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use anvil_core::{Clock, SystemClock, WorkerConfig};
use anvil_store::CommandStore;

use crate::enqueue::CommandQueue;
use crate::registry::HandlerRegistry;
use crate::worker::{Worker, WorkerStats};

struct Running {
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

/// Owns one worker loop as a supervised background task.
///
/// `start` and `stop` are idempotent, and a stopped host can be started
/// again. `stop` cancels the shutdown token and waits for in-flight
/// executors to attempt their terminal writes before returning.
pub struct Host {
    store: Arc<dyn CommandStore>,
    registry: Arc<HandlerRegistry>,
    config: Arc<WorkerConfig>,
    clock: Arc<dyn Clock>,
    notify: Arc<Notify>,
    stats: Arc<Mutex<WorkerStats>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl Host {
    /// Create a host over the given store, registry and configuration,
    /// using the system clock.
    pub fn new(
        store: Arc<dyn CommandStore>,
        registry: HandlerRegistry,
        config: WorkerConfig,
    ) -> Self {
        Self::with_clock(store, registry, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn CommandStore>,
        registry: HandlerRegistry,
        config: WorkerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            config: Arc::new(config),
            clock,
            notify: Arc::new(Notify::new()),
            stats: Arc::new(Mutex::new(WorkerStats::default())),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Client handle for enqueuing into this host's store, wired to the
    /// local new-work signal.
    pub fn queue(&self) -> CommandQueue {
        CommandQueue::new(
            self.store.clone(),
            self.config.clone(),
            self.clock.clone(),
            self.notify.clone(),
        )
    }

    /// Start the worker loop. A no-op when already running.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }

        let shutdown = CancellationToken::new();
        let worker = Worker::new(
            self.store.clone(),
            self.registry.clone(),
            self.config.clone(),
            self.clock.clone(),
            self.notify.clone(),
            shutdown.clone(),
            self.stats.clone(),
        );
        let handle = tokio::spawn(worker.run());
        *running = Some(Running { handle, shutdown });
    }

    /// Stop the worker loop and wait for in-flight work to settle. A no-op
    /// when not running.
    pub async fn stop(&self) {
        let taken = self.running.lock().await.take();
        let Some(running) = taken else {
            return;
        };

        running.shutdown.cancel();
        if let Err(e) = running.handle.await {
            warn!(error = %e, "worker loop terminated abnormally");
        }
    }

    /// Snapshot of the worker's runtime counters.
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().expect("stats lock poisoned").clone()
    }
}
