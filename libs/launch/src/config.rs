//! Configuration for the launch controller fleet.

use anyhow::Result;

/// Fleet configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Mailbox capacity for each controller.
    pub mailbox_capacity: usize,

    /// Seconds to wait for controllers to drain on shutdown before
    /// aborting them.
    pub shutdown_grace_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mailbox_capacity: 64,
            shutdown_grace_secs: 5,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let mailbox_capacity = std::env::var("KEEL_MAILBOX_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.mailbox_capacity);

        let shutdown_grace_secs = std::env::var("KEEL_SHUTDOWN_GRACE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.shutdown_grace_secs);

        let log_level =
            std::env::var("KEEL_LOG_LEVEL").unwrap_or_else(|_| defaults.log_level.clone());

        Ok(Self {
            mailbox_capacity,
            shutdown_grace_secs,
            log_level,
        })
    }
}
