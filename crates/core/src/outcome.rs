//! Outcome taxonomy for a single command attempt.

/// Outcome reported by a user handler.
///
/// Handlers only ever produce these three tags; `NotFound` and `TimedOut`
/// are produced by the executor itself (see [`AttemptOutcome`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The handler finished its work. `output` is persisted on the row.
    Success { output: Option<String> },
    /// The handler observed cancellation and stopped early.
    Cancelled,
    /// The handler could not do its work; the attempt counts against retries.
    Failed,
}

impl Outcome {
    pub fn success() -> Self {
        Self::Success { output: None }
    }

    pub fn success_with(output: impl Into<String>) -> Self {
        Self::Success {
            output: Some(output.into()),
        }
    }
}

/// Classified outcome of one attempt, as recorded by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success { output: Option<String> },
    Cancelled,
    Failed,
    /// No handler is registered for the command name.
    NotFound,
    /// The per-attempt timeout fired before the handler finished.
    TimedOut,
}

impl AttemptOutcome {
    /// Label used in logs and worker statistics.
    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Success { .. } => "success",
            AttemptOutcome::Cancelled => "cancelled",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::NotFound => "not_found",
            AttemptOutcome::TimedOut => "timed_out",
        }
    }

    /// Whether this outcome routes through the fail path (retry accounting).
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            AttemptOutcome::Failed | AttemptOutcome::NotFound | AttemptOutcome::TimedOut
        )
    }
}

impl From<Outcome> for AttemptOutcome {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success { output } => AttemptOutcome::Success { output },
            Outcome::Cancelled => AttemptOutcome::Cancelled,
            Outcome::Failed => AttemptOutcome::Failed,
        }
    }
}
