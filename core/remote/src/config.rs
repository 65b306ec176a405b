//! Remote store configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Database name, percent-encoded into every request path.
    pub name: String,
    /// Prefix prepended to every document id (e.g. `"$public/"`).
    #[serde(default)]
    pub prefix: String,
    /// When set, replaces `/<encoded name>` as the root of every path.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Heartbeat requested from the long-poll change feed.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Time after which a silent long-poll request is restarted.
    #[serde(default = "default_watchdog_ms")]
    pub watchdog_ms: u64,
    /// Delay before a failed pull is retried.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_heartbeat_ms() -> u64 {
    10_000
}

fn default_watchdog_ms() -> u64 {
    25_000
}

fn default_retry_delay_ms() -> u64 {
    3_000
}

impl RemoteConfig {
    /// Create a configuration for the named database.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: String::new(),
            base_url: None,
            heartbeat_ms: default_heartbeat_ms(),
            watchdog_ms: default_watchdog_ms(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }

    /// Set the document id prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Set the long-poll heartbeat.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat_ms = heartbeat.as_millis() as u64;
        self
    }

    /// Set the long-poll watchdog timeout.
    pub fn with_watchdog(mut self, watchdog: Duration) -> Self {
        self.watchdog_ms = watchdog.as_millis() as u64;
        self
    }

    /// Set the pull retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Long-poll heartbeat.
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    /// Long-poll watchdog timeout.
    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }

    /// Pull retry delay.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self::new("")
    }
}
