use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarrierConfig {
    #[serde(default)]
    pub ddl: DdlConfig,
}

/// Concurrent DDL configuration section in harrier.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdlConfig {
    /// How long a lock acquisition may block before failing with a lock
    /// conflict, in milliseconds (0 = wait indefinitely).
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Wakeup interval for cancellation checks during unbounded waits,
    /// in milliseconds. Waits respond to cancellation within roughly this
    /// latency even if no lock or transaction event fires.
    #[serde(default = "default_wait_poll_ms")]
    pub wait_poll_ms: u64,

    /// Maximum number of completed DDL operations retained for status
    /// queries.
    #[serde(default = "default_progress_history")]
    pub progress_history: usize,
}

fn default_lock_timeout_ms() -> u64 {
    0
}

fn default_wait_poll_ms() -> u64 {
    10
}

fn default_progress_history() -> usize {
    100
}

impl Default for DdlConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            wait_poll_ms: default_wait_poll_ms(),
            progress_history: default_progress_history(),
        }
    }
}

impl DdlConfig {
    pub fn wait_poll(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.wait_poll_ms.max(1))
    }

    pub fn lock_timeout(&self) -> Option<std::time::Duration> {
        (self.lock_timeout_ms > 0).then(|| std::time::Duration::from_millis(self.lock_timeout_ms))
    }
}
