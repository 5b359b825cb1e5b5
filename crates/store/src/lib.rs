//! `anvil-store` - durable persistence for command rows.
//!
//! The commands table is the only shared state in the system. Every
//! coordination primitive (leasing, heartbeat extension, terminal
//! transitions, successor chaining) is a conditional single-row update
//! defined by the [`CommandStore`] trait. Two implementations are provided:
//! Postgres for production and an in-memory twin for tests and demos.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryCommandStore;
pub use postgres::PostgresCommandStore;
pub use r#trait::{CommandStore, FailTransition, QueueStats, StoreError};
