//! Enqueue requests and conditional successor chains.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::config::WorkerConfig;
use crate::error::{DomainError, DomainResult};
use crate::id::CommandId;
use crate::name::CommandDefinition;

/// A request to create one command row.
///
/// Unset fields fall back to the worker configuration when the row is
/// materialized: `target` to `instance_key`, `timeout` to `default_timeout`,
/// `retries` to `default_retries`. `delay` shifts `scheduled_at` into the
/// future; zero means eligible immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCommand {
    pub name: String,
    pub input: Option<String>,
    pub target: Option<String>,
    pub timeout: Option<Duration>,
    pub retries: Option<i32>,
    pub delay: Duration,
    /// Client-chosen id; a fresh one is generated when absent.
    pub id: Option<CommandId>,
}

impl NewCommand {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input: None,
            target: None,
            timeout: None,
            retries: None,
            delay: Duration::ZERO,
            id: None,
        }
    }

    /// Build a request from a typed command, serializing it as the input.
    pub fn of<C: CommandDefinition>(command: &C) -> DomainResult<Self> {
        let input = serde_json::to_string(command)
            .map_err(|e| DomainError::validation(format!("serialize {}: {}", C::command_name(), e)))?;
        Ok(Self::named(C::command_name()).input(input))
    }

    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: i32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn id(mut self, id: CommandId) -> Self {
        self.id = Some(id);
        self
    }

    /// Resolve defaults and produce the durable row, scheduled at
    /// `now + delay`.
    pub fn materialize(&self, config: &WorkerConfig, now: DateTime<Utc>) -> Command {
        Command {
            id: self.id.unwrap_or_default(),
            name: self.name.clone(),
            target: self
                .target
                .clone()
                .unwrap_or_else(|| config.instance_key.clone()),
            input: self.input.clone(),
            output: None,
            scheduled_at: now + chrono::Duration::from_std(self.delay).unwrap_or_default(),
            timeout: self.timeout.unwrap_or(config.default_timeout),
            retries_left: self.retries.unwrap_or(config.default_retries),
            is_running: false,
            running_at: None,
            run_expires_at: None,
            is_completed: false,
            completed_at: None,
            is_canceled: false,
            canceled_at: None,
            is_failed: false,
            failed_at: None,
        }
    }
}

/// Declarative successor rules for a command.
///
/// Three collections of [`NewCommand`], one per terminal path. The rules are
/// data attached to a command's registration; the executor materializes them
/// into fresh rows inside the parent's terminal transaction. When no explicit
/// on-cancellation rule is set, cancellation follows the on-failure rule.
#[derive(Debug, Clone, Default)]
pub struct CommandChain {
    on_success: Vec<NewCommand>,
    on_failure: Vec<NewCommand>,
    on_cancellation: Option<Vec<NewCommand>>,
}

impl CommandChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(mut self, successor: NewCommand) -> Self {
        self.on_success.push(successor);
        self
    }

    pub fn on_failure(mut self, successor: NewCommand) -> Self {
        self.on_failure.push(successor);
        self
    }

    /// Set an explicit cancellation rule, overriding the default of
    /// "same as on-failure".
    pub fn on_cancellation(mut self, successor: NewCommand) -> Self {
        self.on_cancellation
            .get_or_insert_with(Vec::new)
            .push(successor);
        self
    }

    pub fn success_rule(&self) -> &[NewCommand] {
        &self.on_success
    }

    pub fn failure_rule(&self) -> &[NewCommand] {
        &self.on_failure
    }

    pub fn cancellation_rule(&self) -> &[NewCommand] {
        match &self.on_cancellation {
            Some(rule) => rule,
            None => &self.on_failure,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.on_success.is_empty()
            && self.on_failure.is_empty()
            && self.on_cancellation.as_ref().map_or(true, Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn materialize_applies_config_defaults() {
        let cfg = WorkerConfig::default().with_instance_key("worker-a");
        let now = Utc::now();

        let cmd = NewCommand::named("send_email")
            .input("e1")
            .materialize(&cfg, now);

        assert_eq!(cmd.name, "send_email");
        assert_eq!(cmd.target, "worker-a");
        assert_eq!(cmd.timeout, cfg.default_timeout);
        assert_eq!(cmd.retries_left, cfg.default_retries);
        assert_eq!(cmd.scheduled_at, now);
        assert!(!cmd.is_running && !cmd.is_terminal());
    }

    #[test]
    fn materialize_honors_explicit_fields() {
        let cfg = WorkerConfig::default();
        let now = Utc::now();
        let id = CommandId::new();

        let cmd = NewCommand::named("api_call")
            .target("worker-b")
            .timeout(Duration::from_secs(5))
            .retries(2)
            .delay(Duration::from_secs(2))
            .id(id)
            .materialize(&cfg, now);

        assert_eq!(cmd.id, id);
        assert_eq!(cmd.target, "worker-b");
        assert_eq!(cmd.timeout, Duration::from_secs(5));
        assert_eq!(cmd.retries_left, 2);
        assert_eq!(cmd.scheduled_at, now + chrono::Duration::seconds(2));
    }

    #[test]
    fn cancellation_rule_defaults_to_failure_rule() {
        let chain = CommandChain::new()
            .on_success(NewCommand::named("notify_ok"))
            .on_failure(NewCommand::named("notify_ops"));

        assert_eq!(chain.cancellation_rule(), chain.failure_rule());
        assert_eq!(chain.cancellation_rule()[0].name, "notify_ops");
    }

    #[test]
    fn explicit_cancellation_rule_overrides_default() {
        let chain = CommandChain::new()
            .on_failure(NewCommand::named("notify_ops"))
            .on_cancellation(NewCommand::named("release_hold"));

        assert_eq!(chain.cancellation_rule().len(), 1);
        assert_eq!(chain.cancellation_rule()[0].name, "release_hold");
    }

    #[test]
    fn typed_request_carries_serialized_input() {
        use serde::{Deserialize, Serialize};

        #[derive(Serialize, Deserialize)]
        struct SendEmailCommand {
            to: String,
        }
        impl CommandDefinition for SendEmailCommand {}

        let request = NewCommand::of(&SendEmailCommand {
            to: "ops@example.com".to_string(),
        })
        .unwrap();

        assert_eq!(request.name, "send_email");
        assert!(request.input.as_deref().unwrap().contains("ops@example.com"));
    }
}
