//! `anvil-core` - domain model for the command orchestrator.
//!
//! This crate defines **data and rules**, not I/O: the durable [`Command`]
//! row and its lifecycle transitions, the outcome taxonomy, the command-name
//! convention, the injected clock, and the successor-chain model. Persistence
//! lives in `anvil-store`; execution lives in `anvil-worker`.

pub mod chain;
pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod id;
pub mod name;
pub mod outcome;

pub use chain::{CommandChain, NewCommand};
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::Command;
pub use config::WorkerConfig;
pub use error::{DomainError, DomainResult};
pub use id::CommandId;
pub use name::CommandDefinition;
pub use outcome::{AttemptOutcome, Outcome};
