use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// Main client configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub timeouts: TimeoutConfig,
    pub scan: ScanConfig,
    pub mode: IoMode,
    pub logging: LoggingConfig,
}

/// How the connection is driven
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoMode {
    /// Callers block on condition variables while the I/O thread completes work
    #[default]
    Blocking,
    /// An external event loop drives completions; blocking batching is unavailable
    EventLoop,
}

/// Longest accepted timeout, keeps deadline arithmetic in range
const MAX_TIMEOUT_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// Timeouts, in whole milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Default wait for op, multi_op and pipeline_end
    pub operation_ms: u64,
    /// Overall deadline of a streaming iterator
    pub stream_ms: u64,
    /// Per-get wait inside a streaming iterator
    pub poll_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub batch_item_limit: u32,
    pub batch_byte_limit: u32,
    /// Buffered rows at or below which the next CONTINUE is issued
    pub low_watermark: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            operation_ms: 2_500,
            stream_ms: 75_000,
            poll_ms: 250,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_item_limit: 50,
            batch_byte_limit: 15_000,
            low_watermark: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ClientConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.timeouts;
        if t.operation_ms == 0 || t.stream_ms == 0 || t.poll_ms == 0 {
            return Err(BridgeError::Config(
                "timeouts must be at least 1 ms".to_string(),
            ));
        }
        if t.operation_ms.max(t.stream_ms) > MAX_TIMEOUT_MS {
            return Err(BridgeError::Config(format!(
                "timeouts must not exceed {} ms",
                MAX_TIMEOUT_MS
            )));
        }
        if t.poll_ms > t.stream_ms {
            return Err(BridgeError::Config(format!(
                "poll_ms ({}) exceeds stream_ms ({})",
                t.poll_ms, t.stream_ms
            )));
        }
        if self.scan.batch_item_limit == 0 || self.scan.batch_byte_limit == 0 {
            return Err(BridgeError::Config(
                "scan batch limits must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.operation_ms)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.stream_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.timeouts.poll_ms)
    }

    /// Builders store millisecond granularity; a non-zero duration below
    /// one millisecond rounds up to 1 ms.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.operation_ms = whole_millis(timeout);
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.stream_ms = whole_millis(timeout);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.timeouts.poll_ms = whole_millis(interval);
        self
    }

    pub fn with_mode(mut self, mode: IoMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_scan_limits(mut self, item_limit: u32, byte_limit: u32) -> Self {
        self.scan.batch_item_limit = item_limit;
        self.scan.batch_byte_limit = byte_limit;
        self
    }
}

fn whole_millis(duration: Duration) -> u64 {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    if millis == 0 && !duration.is_zero() {
        1
    } else {
        millis
    }
}
