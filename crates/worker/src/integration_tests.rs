//! End-to-end scenarios over the in-memory store.
//!
//! These tests run a real host (worker loop, executors, heartbeats) with
//! short real durations. Polls are deliberately generous to keep them
//! robust on slow machines.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use anvil_core::{
    Command, CommandChain, CommandDefinition, CommandId, NewCommand, Outcome, SystemClock,
    WorkerConfig,
};
use anvil_store::{CommandStore, InMemoryCommandStore};

use crate::host::Host;
use crate::registry::HandlerRegistry;

fn fast_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_lock_timeout_buffer(Duration::from_millis(500))
}

fn store() -> Arc<InMemoryCommandStore> {
    InMemoryCommandStore::arc(Arc::new(SystemClock))
}

async fn wait_for(
    store: &InMemoryCommandStore,
    id: CommandId,
    what: &str,
    pred: impl Fn(&Command) -> bool,
) -> Command {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(row) = store.get(id).await.unwrap() {
            if pred(&row) {
                return row;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn happy_path_completes_with_output() {
    let store = store();
    let mut registry = HandlerRegistry::new();
    registry.register_raw("send_email", |input, _token| async move {
        assert_eq!(input.as_deref(), Some("e1"));
        Outcome::success_with("ok")
    });

    let host = Host::new(store.clone(), registry, fast_config());
    host.start().await;

    let id = host
        .queue()
        .enqueue(
            NewCommand::named("send_email")
                .input("e1")
                .timeout(Duration::from_secs(5))
                .retries(3),
        )
        .await
        .unwrap();

    let row = wait_for(&store, id, "completion", |c| c.is_completed).await;
    assert_eq!(row.output.as_deref(), Some("ok"));
    assert_eq!(row.retries_left, 3);
    assert!(!row.is_running && row.run_expires_at.is_none());

    host.stop().await;
    assert_eq!(host.stats().succeeded, 1);
}

#[tokio::test]
async fn failing_handler_retries_then_fails_terminally() {
    let store = store();
    let attempts = Arc::new(AtomicU32::new(0));
    let mut registry = HandlerRegistry::new();
    {
        let attempts = attempts.clone();
        registry.register_raw("api_call", move |_input, _token| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Outcome::Failed }
        });
    }

    let host = Host::new(store.clone(), registry, fast_config());
    host.start().await;

    let id = host
        .queue()
        .enqueue(NewCommand::named("api_call").retries(2))
        .await
        .unwrap();

    let row = wait_for(&store, id, "terminal failure", |c| c.is_failed).await;
    assert_eq!(row.retries_left, -1);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    host.stop().await;
}

#[tokio::test]
async fn failing_handler_can_recover_on_a_later_attempt() {
    let store = store();
    let attempts = Arc::new(AtomicU32::new(0));
    let mut registry = HandlerRegistry::new();
    {
        let attempts = attempts.clone();
        registry.register_raw("api_call", move |_input, _token| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Outcome::Failed
                } else {
                    Outcome::success()
                }
            }
        });
    }

    let host = Host::new(store.clone(), registry, fast_config());
    host.start().await;

    let id = host
        .queue()
        .enqueue(NewCommand::named("api_call").retries(2))
        .await
        .unwrap();

    let row = wait_for(&store, id, "completion", |c| c.is_completed).await;
    assert_eq!(row.retries_left, 0);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    host.stop().await;
}

#[tokio::test]
async fn delayed_command_is_not_executed_early() {
    let store = store();
    let started_at = std::time::Instant::now();
    let ran_after = Arc::new(Mutex::new(None::<Duration>));
    let mut registry = HandlerRegistry::new();
    {
        let ran_after = ran_after.clone();
        registry.register_raw("later", move |_input, _token| {
            ran_after
                .lock()
                .unwrap()
                .replace(started_at.elapsed());
            async { Outcome::success() }
        });
    }

    let host = Host::new(store.clone(), registry, fast_config());
    host.start().await;

    let id = host
        .queue()
        .enqueue(NewCommand::named("later").delay(Duration::from_millis(300)))
        .await
        .unwrap();

    // Well before the delay elapses, the row must still be untouched.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let row = store.get(id).await.unwrap().unwrap();
    assert!(!row.is_running && !row.is_terminal());

    wait_for(&store, id, "delayed completion", |c| c.is_completed).await;
    assert!(ran_after.lock().unwrap().unwrap() >= Duration::from_millis(300));

    host.stop().await;
}

#[tokio::test]
async fn success_chain_spawns_and_executes_successor() {
    let store = store();
    let mut registry = HandlerRegistry::new();
    registry.register_raw_chained(
        "process_order",
        CommandChain::new().on_success(NewCommand::named("send_email")),
        |_input, _token| async { Outcome::success() },
    );
    registry.register_raw("send_email", |_input, _token| async {
        Outcome::success_with("sent")
    });

    let host = Host::new(store.clone(), registry, fast_config());
    host.start().await;

    let id = host
        .queue()
        .enqueue(NewCommand::named("process_order"))
        .await
        .unwrap();
    wait_for(&store, id, "parent completion", |c| c.is_completed).await;

    // The successor row exists in the same snapshot as the completed parent
    // and is then executed to completion on its own.
    let successor_id = store
        .snapshot()
        .into_iter()
        .find(|c| c.name == "send_email")
        .expect("successor row missing")
        .id;
    let successor = wait_for(&store, successor_id, "successor completion", |c| {
        c.is_completed
    })
    .await;
    assert_eq!(successor.output.as_deref(), Some("sent"));

    host.stop().await;
    assert_eq!(host.stats().succeeded, 2);
}

#[tokio::test]
async fn runaway_handler_times_out_and_exhausts_retries() {
    let store = store();
    let attempts = Arc::new(AtomicU32::new(0));
    let mut registry = HandlerRegistry::new();
    {
        let attempts = attempts.clone();
        registry.register_raw("stuck", move |_input, _token| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Outcome::success()
            }
        });
    }

    let host = Host::new(store.clone(), registry, fast_config());
    host.start().await;

    let id = host
        .queue()
        .enqueue(
            NewCommand::named("stuck")
                .timeout(Duration::from_millis(50))
                .retries(1),
        )
        .await
        .unwrap();

    let row = wait_for(&store, id, "timeout failure", |c| c.is_failed).await;
    assert_eq!(row.retries_left, -1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    host.stop().await;
    assert_eq!(host.stats().timed_out, 2);
}

#[tokio::test]
async fn targeted_row_is_only_executed_by_its_worker() {
    let store = store();

    let ran_on = Arc::new(Mutex::new(Vec::<String>::new()));
    let make_registry = |label: &'static str, ran_on: Arc<Mutex<Vec<String>>>| {
        let mut registry = HandlerRegistry::new();
        registry.register_raw("pinned", move |_input, _token| {
            ran_on.lock().unwrap().push(label.to_string());
            async { Outcome::success() }
        });
        registry
    };

    let host_a = Host::new(
        store.clone(),
        make_registry("worker-a", ran_on.clone()),
        fast_config().with_instance_key("worker-a"),
    );
    let host_b = Host::new(
        store.clone(),
        make_registry("worker-b", ran_on.clone()),
        fast_config().with_instance_key("worker-b"),
    );
    host_a.start().await;
    host_b.start().await;

    let id = host_a
        .queue()
        .enqueue(NewCommand::named("pinned").target("worker-a"))
        .await
        .unwrap();

    wait_for(&store, id, "routed completion", |c| c.is_completed).await;
    // Give worker B a few extra poll cycles to prove it stays away.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(ran_on.lock().unwrap().as_slice(), ["worker-a"]);
    assert_eq!(host_b.stats().executed, 0);

    host_a.stop().await;
    host_b.stop().await;
}

#[tokio::test]
async fn expired_lease_is_recovered_by_a_restarted_worker() {
    let store = store();
    let config = fast_config().with_lock_timeout_buffer(Duration::from_millis(200));

    // A doomed worker leases the row and dies before any terminal write.
    let command = NewCommand::named("resilient").materialize(&config, chrono::Utc::now());
    store.insert(&command).await.unwrap();
    let ghost = store
        .acquire("default", Duration::from_millis(200))
        .await
        .unwrap()
        .unwrap();
    assert!(ghost.is_running);

    let mut registry = HandlerRegistry::new();
    registry.register_raw("resilient", |_input, _token| async { Outcome::success() });
    let host = Host::new(store.clone(), registry, config);
    host.start().await;

    // Nothing can happen until the orphaned lease expires.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!store.get(command.id).await.unwrap().unwrap().is_terminal());

    let row = wait_for(&store, command.id, "recovered completion", |c| {
        c.is_completed
    })
    .await;
    assert!(row.run_expires_at.is_none());

    host.stop().await;
}

#[tokio::test]
async fn enqueue_wakes_an_idle_worker_before_the_poll_interval() {
    let store = store();
    let mut registry = HandlerRegistry::new();
    registry.register_raw("ping", |_input, _token| async { Outcome::success() });

    // Poll interval far beyond the test budget: only the new-work signal
    // can make this pass.
    let host = Host::new(
        store.clone(),
        registry,
        WorkerConfig::default().with_poll_interval(Duration::from_secs(60)),
    );
    host.start().await;
    // Let the loop reach its idle sleep.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let id = host
        .queue()
        .enqueue(NewCommand::named("ping"))
        .await
        .unwrap();
    wait_for(&store, id, "signal-driven completion", |c| c.is_completed).await;

    host.stop().await;
}

#[tokio::test]
async fn shutdown_cancels_in_flight_command_and_writes_cancellation() {
    let store = store();
    let mut registry = HandlerRegistry::new();
    registry.register_raw("long_haul", |_input, token| async move {
        token.cancelled().await;
        Outcome::Cancelled
    });

    let host = Host::new(store.clone(), registry, fast_config());
    host.start().await;

    let id = host
        .queue()
        .enqueue(NewCommand::named("long_haul"))
        .await
        .unwrap();
    wait_for(&store, id, "lease", |c| c.is_running).await;

    host.stop().await;

    let row = store.get(id).await.unwrap().unwrap();
    assert!(row.is_canceled);
    assert!(row.run_expires_at.is_none());
    assert_eq!(host.stats().canceled, 1);
}

#[tokio::test]
async fn host_start_and_stop_are_idempotent_and_restartable() {
    let store = store();
    let mut registry = HandlerRegistry::new();
    registry.register_raw("ping", |_input, _token| async { Outcome::success() });

    let host = Host::new(store.clone(), registry, fast_config());
    host.start().await;
    host.start().await;

    let id = host.queue().enqueue(NewCommand::named("ping")).await.unwrap();
    wait_for(&store, id, "first run", |c| c.is_completed).await;

    host.stop().await;
    host.stop().await;

    host.start().await;
    let id = host.queue().enqueue(NewCommand::named("ping")).await.unwrap();
    wait_for(&store, id, "run after restart", |c| c.is_completed).await;
    host.stop().await;
}

#[tokio::test]
async fn typed_commands_round_trip_through_the_queue() {
    #[derive(Serialize, Deserialize)]
    struct SendEmailCommand {
        to: String,
    }
    impl CommandDefinition for SendEmailCommand {}

    let store = store();
    let mut registry = HandlerRegistry::new();
    registry.register::<SendEmailCommand, _, _>(|cmd, _token| async move {
        Outcome::success_with(format!("sent to {}", cmd.to))
    });

    let host = Host::new(store.clone(), registry, fast_config());
    host.start().await;

    let id = host
        .queue()
        .enqueue_command(&SendEmailCommand {
            to: "ops@example.com".to_string(),
        })
        .await
        .unwrap();

    let row = wait_for(&store, id, "typed completion", |c| c.is_completed).await;
    assert_eq!(row.name, "send_email");
    assert_eq!(row.output.as_deref(), Some("sent to ops@example.com"));

    host.stop().await;
}

#[tokio::test]
async fn invariants_hold_across_a_mixed_workload() {
    let store = store();
    let mut registry = HandlerRegistry::new();
    registry.register_raw("ok", |_input, _token| async { Outcome::success() });
    registry.register_raw("bad", |_input, _token| async { Outcome::Failed });
    registry.register_raw_chained(
        "chained",
        CommandChain::new()
            .on_success(NewCommand::named("ok"))
            .on_failure(NewCommand::named("bad").retries(0)),
        |_input, _token| async { Outcome::success() },
    );

    let host = Host::new(store.clone(), registry, fast_config());
    host.start().await;
    let queue = host.queue();

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(queue.enqueue(NewCommand::named("ok")).await.unwrap());
        ids.push(queue.enqueue(NewCommand::named("bad").retries(1)).await.unwrap());
        ids.push(queue.enqueue(NewCommand::named("chained")).await.unwrap());
    }

    for id in &ids {
        wait_for(&store, *id, "terminal state", |c| c.is_terminal()).await;
    }
    // Let chained successors finish too.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if store.snapshot().iter().all(|c| c.is_terminal()) {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for successors to settle");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    host.stop().await;

    for row in store.snapshot() {
        row.validate().unwrap();
        assert!(!row.is_running);
        assert!(row.run_expires_at.is_none());
    }

    let stats = store.stats("default").await.unwrap();
    assert_eq!(stats.completed, 10 + 5); // 5 ok + 5 chained + 5 successors
    assert_eq!(stats.failed, 5);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.running, 0);
}
