//! # Serial device layer
//!
//! The [`UartDevice`] trait is the seam between the Modbus bus interface and
//! the physical RS-485 port. [`SerialUart`] implements it on top of
//! `tokio-serial`; tests substitute scripted devices.
//!
//! ## Device kinds
//!
//! - **Default**: a plain UART whose transceiver switches direction itself
//! - **AspeedRs485**: the BMC UART, where RTS drives the RS-485 transmit
//!   enable and must be raised for the duration of a write

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{ClearBuffer, SerialPort, SerialStream};
use tracing::debug;

use crate::error::{RackmonError, RackmonResult};

/// Kind of serial hardware behind an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    #[default]
    Default,
    AspeedRs485,
}

/// Byte-level serial device
///
/// Reads are exact-length: `read` returns only once `buf` is full, or fails
/// with [`RackmonError::Timeout`] when the deadline passes first.
#[async_trait]
pub trait UartDevice: Send {
    /// Open the underlying device
    async fn open(&mut self) -> RackmonResult<()>;

    /// Close the underlying device
    async fn close(&mut self) -> RackmonResult<()>;

    /// Whether the device is open
    fn is_open(&self) -> bool;

    /// Change the line speed
    async fn set_baudrate(&mut self, baudrate: u32) -> RackmonResult<()>;

    /// Write a whole frame
    async fn write(&mut self, data: &[u8]) -> RackmonResult<()>;

    /// Fill `buf` completely within `deadline`
    async fn read(&mut self, buf: &mut [u8], deadline: Duration) -> RackmonResult<()>;
}

/// Serial port backed device
pub struct SerialUart {
    /// Serial port connection
    port: Option<SerialStream>,
    /// Device path
    path: String,
    /// Current line speed
    baudrate: u32,
    /// Hardware kind
    kind: DeviceType,
}

impl SerialUart {
    /// Create a closed device; call [`UartDevice::open`] before use
    pub fn new(path: &str, baudrate: u32, kind: DeviceType) -> Self {
        Self {
            port: None,
            path: path.to_string(),
            baudrate,
            kind,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn port_mut(&mut self) -> RackmonResult<&mut SerialStream> {
        let path = &self.path;
        self.port
            .as_mut()
            .ok_or_else(|| RackmonError::io(format!("Serial port {} not open", path)))
    }

    fn serial_error(&self, action: &str, err: tokio_serial::Error) -> RackmonError {
        RackmonError::io(format!("Failed to {} on {}: {}", action, self.path, err))
    }
}

#[async_trait]
impl UartDevice for SerialUart {
    async fn open(&mut self) -> RackmonResult<()> {
        // Modbus RTU framing: 8 data bits, even parity, one stop bit
        let builder = tokio_serial::new(&self.path, self.baudrate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::Even);

        let mut port = SerialStream::open(&builder).map_err(|e| self.serial_error("open serial port", e))?;

        if self.kind == DeviceType::AspeedRs485 {
            // Receive mode while idle
            port.write_request_to_send(false)
                .map_err(|e| self.serial_error("set RTS", e))?;
        }

        debug!("Opened {} at {} baud ({:?})", self.path, self.baudrate, self.kind);
        self.port = Some(port);
        Ok(())
    }

    async fn close(&mut self) -> RackmonResult<()> {
        // SerialStream closes when dropped
        self.port.take();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    async fn set_baudrate(&mut self, baudrate: u32) -> RackmonResult<()> {
        if baudrate == self.baudrate && self.port.is_some() {
            return Ok(());
        }
        let result = self.port_mut()?.set_baud_rate(baudrate);
        result.map_err(|e| self.serial_error("set baudrate", e))?;
        self.baudrate = baudrate;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> RackmonResult<()> {
        let rs485 = self.kind == DeviceType::AspeedRs485;
        let port = self.port_mut()?;

        // Drop stale bytes so the next read sees only the reply
        port.clear(ClearBuffer::Input)
            .map_err(|e| RackmonError::io(format!("Failed to clear input buffer: {}", e)))?;

        if rs485 {
            port.write_request_to_send(true)
                .map_err(|e| RackmonError::io(format!("Failed to raise RTS: {}", e)))?;
        }

        let write_result = async {
            port.write_all(data).await?;
            port.flush().await
        }
        .await;

        if rs485 {
            port.write_request_to_send(false)
                .map_err(|e| RackmonError::io(format!("Failed to drop RTS: {}", e)))?;
        }

        write_result.map_err(|e| RackmonError::io(format!("Failed to send RTU frame: {}", e)))
    }

    async fn read(&mut self, buf: &mut [u8], deadline: Duration) -> RackmonResult<()> {
        let port = self.port_mut()?;
        match timeout(deadline, port.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(RackmonError::io(format!("Serial read error: {}", e))),
            Err(_) => Err(RackmonError::timeout("read response", deadline.as_millis() as u64)),
        }
    }
}
