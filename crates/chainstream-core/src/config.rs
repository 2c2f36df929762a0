//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// Tuning parameters for the streaming engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Blocks probed for match density before each trace query.
    /// Also the default trace window when density is low.
    pub probe_window_blocks: u64,
    /// Target number of matches per trace query; the window shrinks above it.
    pub match_target: u64,
    /// Maximum number of fork records fetched per scan cycle.
    pub fork_page_size: u64,
    /// Session tick period (milliseconds).
    pub tick_interval_ms: u64,
    /// Fork scan period (milliseconds).
    pub fork_scan_interval_ms: u64,
    /// Delay between reporting invalid arguments and closing the connection (milliseconds).
    pub invalid_args_grace_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            probe_window_blocks: 100,
            match_target: 100,
            fork_page_size: 100,
            tick_interval_ms: 1000,
            fork_scan_interval_ms: 500,
            invalid_args_grace_ms: 1000,
        }
    }
}

impl StreamConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn fork_scan_interval(&self) -> Duration {
        Duration::from_millis(self.fork_scan_interval_ms)
    }

    pub fn invalid_args_grace(&self) -> Duration {
        Duration::from_millis(self.invalid_args_grace_ms)
    }

    /// Reject values that would stall the engine (zero windows or periods).
    pub fn validate(&self) -> Result<(), StreamError> {
        let fields = [
            ("probe_window_blocks", self.probe_window_blocks),
            ("match_target", self.match_target),
            ("fork_page_size", self.fork_page_size),
            ("tick_interval_ms", self.tick_interval_ms),
            ("fork_scan_interval_ms", self.fork_scan_interval_ms),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(StreamError::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }
}
