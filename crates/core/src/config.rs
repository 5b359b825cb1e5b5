//! Worker configuration.

use std::time::Duration;

/// Configuration for one worker process.
///
/// Constructed by the embedding application; every field has a sensible
/// default so `WorkerConfig::default()` is a working configuration for a
/// single-worker deployment.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// This worker's identity; only rows with a matching `target` are leased.
    pub instance_key: String,
    /// Idle sleep between polling cycles.
    pub poll_interval: Duration,
    /// Lease duration. Must comfortably exceed one heartbeat plus a store
    /// round-trip, or expired leases will cause spurious parallel attempts.
    pub lock_timeout_buffer: Duration,
    /// Maximum concurrently executing commands inside this worker.
    pub max_in_flight: usize,
    /// Per-attempt timeout applied when an enqueue does not specify one.
    pub default_timeout: Duration,
    /// `retries_left` applied when an enqueue does not specify one.
    pub default_retries: i32,
    /// Prefix for the commands table name.
    pub table_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            instance_key: "default".to_string(),
            poll_interval: Duration::from_secs(5),
            lock_timeout_buffer: Duration::from_secs(10),
            max_in_flight: 100,
            default_timeout: Duration::from_secs(60),
            default_retries: 3,
            table_prefix: "ORCH_".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_instance_key(mut self, key: impl Into<String>) -> Self {
        self.instance_key = key.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lock_timeout_buffer(mut self, lease: Duration) -> Self {
        self.lock_timeout_buffer = lease;
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_default_retries(mut self, retries: i32) -> Self {
        self.default_retries = retries;
        self
    }

    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    /// Table name for the command rows.
    pub fn commands_table(&self) -> String {
        format!("{}commands", self.table_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.instance_key, "default");
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.lock_timeout_buffer, Duration::from_secs(10));
        assert_eq!(cfg.max_in_flight, 100);
        assert_eq!(cfg.default_timeout, Duration::from_secs(60));
        assert_eq!(cfg.default_retries, 3);
        assert_eq!(cfg.commands_table(), "ORCH_commands");
    }

    #[test]
    fn builder_overrides() {
        let cfg = WorkerConfig::default()
            .with_instance_key("worker-a")
            .with_table_prefix("app_");
        assert_eq!(cfg.instance_key, "worker-a");
        assert_eq!(cfg.commands_table(), "app_commands");
    }
}
