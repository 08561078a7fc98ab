//! # Rackmon - Modbus-RTU Rack Power Monitor
//!
//! Discovers PSUs and BBUs on one or more RS-485 buses, tracks the health of
//! every device it finds and keeps a short history of the registers each
//! device's register map names. Clients read that telemetry, or issue raw
//! Modbus commands, over a UNIX domain socket.
//!
//! ## Features
//!
//! - **🔧 Modbus-RTU codec**: bounded frame buffer with CRC16 framing
//! - **📦 Typed command set**: read holding registers, write single and
//!   multiple registers, read file record, raw passthrough
//! - **🔒 Serialized buses**: one exchange at a time per bus, with optional
//!   inter-command gap
//! - **🩺 Health tracking**: per-device failure tallies, automatic demotion
//!   to a dormant pool and periodic recovery
//! - **📚 Register maps**: JSON files keyed by address range
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use rackmon::{CallbackLogger, Rackmon, RackmonConfig, RackmonResult};
//!
//! #[tokio::main]
//! async fn main() -> RackmonResult<()> {
//!     let config = RackmonConfig::load(Path::new("/etc/rackmon.conf"))?;
//!     let rackmon = Arc::new(
//!         Rackmon::load(config, Path::new("/etc/rackmon.d"), CallbackLogger::console()).await?,
//!     );
//!     rackmon.start().await?;
//!
//!     for device in rackmon.get_monitor_data().await {
//!         println!("0x{:02X} {}", device.status.addr, device.device_type);
//!     }
//!
//!     rackmon.stop().await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ Socket Service  │  JSON + legacy binary protocols
//! └─────────────────┘
//!          │
//! ┌─────────────────┐    ┌─────────────────┐
//! │    Rackmon      │───►│  Register Maps  │
//! │ (scan/monitor)  │    │   (database)    │
//! └─────────────────┘    └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  ModbusDevice   │  health, history
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  Modbus (bus)   │  serialized exchanges
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  UART (RS-485)  │
//! └─────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Bounded Modbus-RTU message buffer and CRC
pub mod msg;

/// Typed request/response commands
pub mod protocol;

/// Serial device layer
pub mod uart;

/// Per-bus command serializer
pub mod modbus;

/// Register samples and history
pub mod register;

/// Register map files and the address-keyed database
pub mod register_map;

/// Per-device health and history tracking
pub mod modbus_device;

/// Scan/monitor orchestrator
pub mod rackmon;

/// UNIX socket front end
pub mod service;

/// Utility functions and command metrics
pub mod utils;

/// Logging system for the library
pub mod logging;

// Re-export main types for convenience
pub use error::{RackmonError, RackmonResult};
pub use logging::{CallbackLogger, LogCallback, LogLevel};
pub use modbus::{InterfaceConfig, Modbus, ModbusBus};
pub use modbus_device::{
    ModbusDevice, ModbusDeviceFmtData, ModbusDeviceMode, ModbusDeviceRawData, ModbusDeviceStatus,
    ModbusDeviceValueData, MAX_CONSECUTIVE_FAILURES,
};
pub use msg::{Msg, MAX_MODBUS_FRAME_SIZE};
pub use protocol::{
    FileRecord, ModbusFunction, RawRequest, RawResponse, ReadFileRecordReq, ReadFileRecordResp,
    ReadHoldingRegistersReq, ReadHoldingRegistersResp, Request, Response, WriteMultipleRegistersReq,
    WriteMultipleRegistersResp, WriteSingleRegisterReq, WriteSingleRegisterResp,
};
pub use rackmon::{Rackmon, RackmonConfig, RackmonTiming};
pub use register::{RegisterValue, Value};
pub use register_map::{AddrRange, RegisterMap, RegisterMapDatabase};
pub use service::{RackmonService, RequestHandler, ServiceConfig};
pub use uart::{DeviceType, SerialUart, UartDevice};
pub use utils::CommandMetrics;

/// Line speed used when neither the command nor the map names one
pub const DEFAULT_BAUDRATE: u32 = 19200;

/// Default response timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 300;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Rackmon v{} - Modbus-RTU rack power monitor", VERSION)
}
