//! Runner configuration.

use readmodel_types::BatchSize;
use std::time::Duration;

/// Configuration shared by every runner a host spawns.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum number of events fetched per iteration.
    pub page_size: BatchSize,
    /// Delay after an empty page or a failed iteration.
    pub poll_interval: Duration,
    /// How long `ProjectionHost::shutdown` waits for in-flight iterations.
    pub shutdown_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            page_size: BatchSize::new(1000),
            poll_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl RunnerConfig {
    /// Set the maximum events per page.
    pub fn with_page_size(mut self, page_size: BatchSize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the delay after an empty page or a failure.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set how long shutdown waits for in-flight iterations.
    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }
}
