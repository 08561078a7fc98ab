/// Utility functions and helpers for the monitor
///
/// This module contains formatting helpers, wall clock access and the
/// per-bus command metrics.

use std::time::Duration;

/// Command metrics for one bus interface
#[derive(Debug, Clone, Default)]
pub struct CommandMetrics {
    pub total_commands: u64,
    pub successful_commands: u64,
    pub failed_commands: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub avg_duration: Duration,
}

impl CommandMetrics {
    /// Create new empty metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful command
    pub fn record_success(&mut self, duration: Duration) {
        self.total_commands += 1;
        self.successful_commands += 1;
        self.total_duration += duration;

        self.min_duration = Some(self.min_duration.map_or(duration, |min| min.min(duration)));
        self.max_duration = Some(self.max_duration.map_or(duration, |max| max.max(duration)));
        self.update_average();
    }

    /// Record a failed command
    pub fn record_failure(&mut self, duration: Duration) {
        self.total_commands += 1;
        self.failed_commands += 1;
        self.total_duration += duration;
        self.update_average();
    }

    fn update_average(&mut self) {
        if self.total_commands > 0 {
            self.avg_duration = self.total_duration / self.total_commands as u32;
        }
    }

    /// Get success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.total_commands == 0 {
            return 0.0;
        }
        (self.successful_commands as f64 / self.total_commands as f64) * 100.0
    }
}

/// Wall clock helpers
pub mod time {
    /// Seconds since the Unix epoch
    pub fn now_secs() -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format byte array as hex string
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes.iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format register values as contiguous lowercase hex
    pub fn registers_to_hex(registers: &[u16]) -> String {
        registers.iter()
            .map(|r| format!("{:04x}", r))
            .collect::<String>()
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }

    /// Format command metrics as a table
    pub fn format_metrics(metrics: &CommandMetrics) -> String {
        format!(
            "Command Metrics:\n\
             ├─ Total Commands: {}\n\
             ├─ Successful: {} ({:.1}%)\n\
             ├─ Failed: {}\n\
             ├─ Average Duration: {}\n\
             ├─ Min Duration: {}\n\
             └─ Max Duration: {}",
            metrics.total_commands,
            metrics.successful_commands,
            metrics.success_rate(),
            metrics.failed_commands,
            format_duration(metrics.avg_duration),
            metrics.min_duration.map_or("N/A".to_string(), format_duration),
            metrics.max_duration.map_or("N/A".to_string(), format_duration),
        )
    }
}

/// Logging utilities
pub mod logging {
    /// Initialize simple logger for testing
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }
}
