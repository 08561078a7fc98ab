use std::sync::Arc;

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Type alias for log callback functions
///
/// The callback receives a log level and message string
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger that uses callbacks for flexible logging
///
/// Every component of the monitor (bus, device, orchestrator, socket
/// service) receives a clone of the same logger, so an embedding
/// application decides where diagnostics end up.
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
}

impl CallbackLogger {
    /// Create a new callback logger
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
        }
    }

    /// Create a logger with default console output
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error => eprintln!("[{}] ERROR: {}", timestamp, message),
                LogLevel::Warn => eprintln!("[{}] WARN: {}", timestamp, message),
                LogLevel::Info => println!("[{}] INFO: {}", timestamp, message),
                LogLevel::Debug => println!("[{}] DEBUG: {}", timestamp, message),
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Create a logger that forwards into the `log` facade
    ///
    /// Used by the daemon, where `env_logger` does the filtering.
    pub fn forward(min_level: LogLevel) -> Self {
        let callback: LogCallback = Box::new(|level, message| match level {
            LogLevel::Error => log::error!(target: "rackmon", "{}", message),
            LogLevel::Warn => log::warn!(target: "rackmon", "{}", message),
            LogLevel::Info => log::info!(target: "rackmon", "{}", message),
            LogLevel::Debug => log::debug!(target: "rackmon", "{}", message),
        });
        Self::new(Some(callback), min_level)
    }

    /// Create a logger that outputs nothing (disabled)
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    /// Log a message at the specified level
    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    /// Log an error message
    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    /// Log a warning message
    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    /// Log an info message
    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    /// Log a debug message
    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    /// Check if a message at the given level should be logged
    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level as u8 <= self.min_level as u8
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Logger that records every line it is given
    pub(crate) fn capture(level: LogLevel) -> (CallbackLogger, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let callback: LogCallback = Box::new(move |level, message| {
            sink.lock().unwrap().push(format!("{}: {}", level.as_str(), message));
        });
        (CallbackLogger::new(Some(callback), level), lines)
    }

    #[test]
    fn test_level_filtering() {
        let (logger, lines) = capture(LogLevel::Warn);
        logger.error("bad");
        logger.warn("meh");
        logger.info("fine");
        logger.debug("noise");
        assert_eq!(*lines.lock().unwrap(), vec!["ERROR: bad", "WARN: meh"]);
    }

    #[test]
    fn test_clones_share_callback() {
        let (logger, lines) = capture(LogLevel::Debug);
        let clone = logger.clone();
        logger.info("one");
        clone.debug("two");
        assert_eq!(lines.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_disabled_logger() {
        let logger = CallbackLogger::disabled();
        logger.error("dropped");
        assert!(!logger.should_log(LogLevel::Error));
    }
}
