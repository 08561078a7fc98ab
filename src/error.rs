//! # Rackmon Error Handling
//!
//! This module provides the error taxonomy shared by every layer of the
//! rackmon stack: the message codec, the typed command set, the bus
//! interface, per-device health tracking and the orchestrator.
//!
//! ## Error Categories
//!
//! ### Codec Errors
//! - **Overflow / Underflow**: a push or pop would violate the fixed
//!   capacity of a Modbus-RTU frame buffer
//! - **CRC Errors**: the trailing CRC16 of a received frame does not match
//!
//! ### Response Errors
//! - **Bad Response**: a decoded field (function code, byte count, echoed
//!   address/offset/count) differs from what the request implies
//!
//! ### Transport Errors
//! - **Timeout Errors**: the device did not answer within the deadline
//! - **I/O Errors**: serial device failures
//!
//! ### Lookup Errors
//! - **Unknown Device**: address not in the active pool, or not covered by
//!   any loaded register map
//!
//! ### System Errors
//! - **Configuration Errors**: malformed interface or register map files
//! - **Invalid Argument / Internal**: caller misuse and unexpected states
//!
//! ## Status Codes
//!
//! The socket boundary is the only place errors are turned into status
//! strings, using [`RackmonError::status`]:
//!
//! ```rust
//! use rackmon::RackmonError;
//!
//! let err = RackmonError::timeout("read response", 300);
//! assert_eq!(err.status(), "TIMEOUT_ERROR");
//!
//! let err = RackmonError::crc_mismatch(0x1234, 0x5678);
//! assert_eq!(err.status(), "CRC_ERROR");
//! ```

use thiserror::Error;

/// Result type alias for rackmon operations
pub type RackmonResult<T> = Result<T, RackmonError>;

/// Rackmon error types
///
/// Each variant carries enough context to diagnose the failing exchange.
/// `ModbusDevice` tallies these by kind (timeout, CRC, everything else)
/// before handing them back to the caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RackmonError {
    /// I/O related errors (serial device, socket)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// No response within the deadline
    ///
    /// Raised by the device layer when an exact-length read does not
    /// complete in time.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// CRC validation failure
    ///
    /// `expected` is the CRC computed over the received bytes, `actual`
    /// the CRC carried in the frame trailer.
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// A decoded response field differs from the expected value
    ///
    /// # Examples
    /// - Function code 0x83 where 0x03 was requested
    /// - Byte count 6 for a two register read
    /// - Echoed register offset differs from the request
    #[error("Bad response: {field} expected={expected:#x}, actual={actual:#x}")]
    BadResponse {
        field: &'static str,
        expected: u32,
        actual: u32,
    },

    /// Push past the frame capacity
    #[error("Buffer overflow: {requested} bytes requested, capacity {capacity}")]
    Overflow { requested: usize, capacity: usize },

    /// Pop of more bytes than the frame holds
    #[error("Buffer underflow: {requested} bytes requested, {available} available")]
    Underflow { requested: usize, available: usize },

    /// Address not active, or not covered by any register map
    #[error("Unknown device at address {addr:#04x}")]
    UnknownDevice { addr: u8 },

    /// Configuration errors
    ///
    /// Malformed interface configuration or register map file. These are
    /// the only errors expected to abort startup.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Caller supplied an argument the operation cannot honour
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RackmonError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a CRC mismatch error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create a field-named bad response error
    pub fn bad_response(field: &'static str, expected: u32, actual: u32) -> Self {
        Self::BadResponse {
            field,
            expected,
            actual,
        }
    }

    /// Create a buffer overflow error
    pub fn overflow(requested: usize, capacity: usize) -> Self {
        Self::Overflow {
            requested,
            capacity,
        }
    }

    /// Create a buffer underflow error
    pub fn underflow(requested: usize, available: usize) -> Self {
        Self::Underflow {
            requested,
            available,
        }
    }

    /// Create an unknown device error
    pub fn unknown_device(addr: u8) -> Self {
        Self::UnknownDevice { addr }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an invalid argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is a response timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if the error is a CRC mismatch
    pub fn is_crc(&self) -> bool {
        matches!(self, Self::CrcMismatch { .. })
    }

    /// Map the error onto the status string reported over the socket
    pub fn status(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "TIMEOUT_ERROR",
            Self::CrcMismatch { .. } => "CRC_ERROR",
            Self::Underflow { .. } => "UNDERFLOW_ERROR",
            Self::Overflow { .. } => "OVERFLOW_ERROR",
            Self::UnknownDevice { .. }
            | Self::BadResponse { .. }
            | Self::InvalidArgument { .. }
            | Self::Configuration { .. } => "USER_ERROR",
            Self::Io { .. } | Self::Internal { .. } => "RUNTIME_ERROR",
        }
    }

    /// Numeric code used by the legacy binary socket protocol
    pub fn legacy_code(&self) -> u16 {
        match self {
            Self::Timeout { .. } => 6,
            Self::CrcMismatch { .. } => 5,
            Self::Underflow { .. } | Self::Overflow { .. } => 4,
            Self::UnknownDevice { .. } | Self::InvalidArgument { .. } => 3,
            Self::BadResponse { .. } => 2,
            _ => 1,
        }
    }
}

/// Convert from std::io::Error
///
/// A `TimedOut` kind keeps its meaning so device layers built on blocking
/// reads still surface as [`RackmonError::Timeout`].
impl From<std::io::Error> for RackmonError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            Self::timeout(err.to_string(), 0)
        } else {
            Self::io(err.to_string())
        }
    }
}

/// Convert from tokio timeout errors
impl From<tokio::time::error::Elapsed> for RackmonError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

/// Convert from serde JSON errors
impl From<serde_json::Error> for RackmonError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = RackmonError::timeout("read_registers", 300);
        assert!(err.is_timeout());
        assert!(!err.is_crc());

        let err = RackmonError::crc_mismatch(1, 2);
        assert!(err.is_crc());
        assert!(!err.is_timeout());

        let err = RackmonError::overflow(254, 253);
        assert!(!err.is_timeout() && !err.is_crc());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(RackmonError::underflow(1, 0).status(), "UNDERFLOW_ERROR");
        assert_eq!(RackmonError::overflow(254, 253).status(), "OVERFLOW_ERROR");
        assert_eq!(RackmonError::unknown_device(100).status(), "USER_ERROR");
        assert_eq!(RackmonError::bad_response("function", 3, 4).status(), "USER_ERROR");
        assert_eq!(RackmonError::io("gone").status(), "RUNTIME_ERROR");
    }

    #[test]
    fn test_error_display() {
        let err = RackmonError::crc_mismatch(0x1234, 0x5678);
        let msg = format!("{}", err);
        assert!(msg.contains("CRC validation failed"));
        assert!(msg.contains("1234"));
        assert!(msg.contains("5678"));

        let err = RackmonError::bad_response("byte count", 4, 6);
        assert_eq!(format!("{}", err), "Bad response: byte count expected=0x4, actual=0x6");
    }

    #[test]
    fn test_io_timeout_conversion() {
        let err: RackmonError = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert!(err.is_timeout());

        let err: RackmonError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        assert_eq!(err.status(), "RUNTIME_ERROR");
    }
}
