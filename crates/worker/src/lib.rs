//! `anvil-worker` - the worker runtime of the command orchestrator.
//!
//! ## Components
//!
//! - [`HandlerRegistry`]: name -> handler closure, plus successor rules
//! - `Executor` (internal): drives one leased command to a terminal state
//! - `Worker` (internal): the bounded-concurrency polling loop
//! - [`CommandQueue`]: the enqueue API
//! - [`Host`]: supervised start/stop of one worker loop
//!
//! ## Delivery semantics
//!
//! Execution is crash-safe and at-least-once: a worker that dies mid-run
//! leaves a leased row whose lease expires, after which any eligible worker
//! re-leases and re-runs it. Handlers must tolerate re-execution.

mod executor;
mod worker;

pub mod enqueue;
pub mod host;
pub mod registry;

pub use enqueue::{CommandQueue, EnqueueError};
pub use host::Host;
pub use registry::{Handler, HandlerFuture, HandlerRegistry, Registration};
pub use worker::WorkerStats;

#[cfg(test)]
mod integration_tests;
