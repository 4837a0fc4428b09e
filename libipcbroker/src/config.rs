//! Timing configuration shared by broker and clients
use std::time::Duration;

/// Intervals used by [crate::Broker] and [crate::Client] work loops
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// How long a work cycle waits for connections to become readable
    pub poll_interval: Duration,
    /// Reply timeout for calls that are not long running, as a multiple of `poll_interval`
    pub reply_timeout_factor: u32,
    /// Delay between work cycles
    pub idle_delay: Duration,
    /// How long `stop` waits for a work loop to exit before aborting it
    pub stop_timeout: Duration,
}

impl Config {
    /// Timeout for replies to calls that are not long running
    pub fn reply_timeout(&self) -> Duration {
        self.poll_interval * self.reply_timeout_factor
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_reply_timeout_factor(mut self, factor: u32) -> Self {
        self.reply_timeout_factor = factor;
        self
    }

    pub fn with_idle_delay(mut self, idle_delay: Duration) -> Self {
        self.idle_delay = idle_delay;
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            reply_timeout_factor: 10,
            idle_delay: Duration::from_millis(10),
            stop_timeout: Duration::from_secs(5),
        }
    }
}
