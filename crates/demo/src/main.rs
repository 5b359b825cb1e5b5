//! Minimal end-to-end demo: two chained commands through one worker.
//!
//! Runs against Postgres when `DATABASE_URL` is set, otherwise against the
//! in-memory store.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use anvil_core::{
    CommandChain, CommandDefinition, NewCommand, Outcome, SystemClock, WorkerConfig,
};
use anvil_store::{CommandStore, InMemoryCommandStore, PostgresCommandStore};
use anvil_worker::{HandlerRegistry, Host};

#[derive(Debug, Serialize, Deserialize)]
struct ProcessOrderCommand {
    order_id: u64,
}
impl CommandDefinition for ProcessOrderCommand {}

#[tokio::main]
async fn main() {
    anvil_observability::init();

    let config = WorkerConfig::default().with_poll_interval(Duration::from_millis(250));
    let clock = Arc::new(SystemClock);

    let store: Arc<dyn CommandStore> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let pool = sqlx::PgPool::connect(&url)
                .await
                .expect("failed to connect to DATABASE_URL");
            let store = PostgresCommandStore::new(pool, clock.clone(), &config.table_prefix);
            store
                .ensure_schema()
                .await
                .expect("failed to create commands table");
            Arc::new(store)
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; using the in-memory store");
            InMemoryCommandStore::arc(clock.clone())
        }
    };

    let mut registry = HandlerRegistry::new();
    registry.register_chained::<ProcessOrderCommand, _, _>(
        CommandChain::new().on_success(NewCommand::named("send_email").input("order shipped")),
        |cmd, _token| async move {
            tracing::info!(order_id = cmd.order_id, "processing order");
            Outcome::success_with(format!("order {} processed", cmd.order_id))
        },
    );
    registry.register_raw("send_email", |input, _token| async move {
        tracing::info!(body = input.as_deref().unwrap_or(""), "sending email");
        Outcome::success()
    });

    let host = Host::with_clock(store, registry, config, clock);
    host.start().await;

    let queue = host.queue();
    let id = queue
        .enqueue_command(&ProcessOrderCommand { order_id: 42 })
        .await
        .expect("enqueue failed");
    tracing::info!(command_id = %id, "enqueued order");

    // Wait for the parent and its chained successor to settle.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let row = queue.get(id).await.expect("lookup failed");
    tracing::info!(?row, "final command state");
    tracing::info!(stats = ?host.stats(), "worker stats");

    host.stop().await;
}
