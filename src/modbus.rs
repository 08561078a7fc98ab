//! # Modbus bus interface
//!
//! One [`Modbus`] exists per physical RS-485 bus. It owns the serial device,
//! serializes every command issued on it and performs the
//! encode → write → exact-length read → decode sequence.
//!
//! ## Command sequence
//!
//! 1. Encode the request (CRC appended)
//! 2. Pre-size the response to the exact frame length it expects
//! 3. Under the bus lock: honour the inter-command gap, set the baud rate,
//!    write, read, then release
//! 4. Validate and decode the response, optionally holding the bus quiet
//!    for a settle time
//!
//! Errors from the device layer propagate unmodified.
//!
//! ## Configuration
//!
//! ```rust
//! use rackmon::modbus::InterfaceConfig;
//!
//! let config: InterfaceConfig = serde_json::from_str(
//!     r#"{"device_path": "/dev/ttyUSB0", "baudrate": 19200}"#,
//! ).unwrap();
//! assert_eq!(config.default_timeout_ms, 300);
//! assert!(config.ignored_addrs.is_empty());
//! ```

use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{RackmonError, RackmonResult};
use crate::logging::CallbackLogger;
use crate::protocol::{Request, Response};
use crate::uart::{DeviceType, SerialUart, UartDevice};
use crate::utils::format::{bytes_to_hex, format_duration, format_metrics};
use crate::utils::CommandMetrics;

/// Capability to encode requests and decode responses
///
/// Only the bus module can construct one, so the CRC handling of a frame
/// stays in one place.
#[derive(Debug, Clone, Copy)]
pub struct BusToken(());

fn default_baudrate() -> u32 {
    crate::DEFAULT_BAUDRATE
}

fn default_timeout_ms() -> u64 {
    crate::DEFAULT_TIMEOUT_MS
}

/// Per-bus configuration entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Serial device path
    pub device_path: String,
    /// Line speed used when a command does not name one
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Serial hardware kind
    #[serde(default)]
    pub device_type: DeviceType,
    /// Response timeout used when a command does not name one
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Minimum gap between consecutive commands
    #[serde(default)]
    pub min_delay_ms: u64,
    /// Addresses never probed on this bus
    #[serde(default)]
    pub ignored_addrs: Vec<u8>,
    /// Hex dump every frame at debug level
    #[serde(default)]
    pub packet_logging: bool,
}

impl InterfaceConfig {
    pub fn new(device_path: &str) -> Self {
        Self {
            device_path: device_path.to_string(),
            baudrate: default_baudrate(),
            device_type: DeviceType::Default,
            default_timeout_ms: default_timeout_ms(),
            min_delay_ms: 0,
            ignored_addrs: Vec::new(),
            packet_logging: false,
        }
    }
}

/// A serialized command channel to the devices on one bus
///
/// Implemented by [`Modbus`]; device and orchestrator tests substitute
/// scripted buses.
#[async_trait]
pub trait ModbusBus: Send + Sync {
    /// Bus name for diagnostics (the device path)
    fn name(&self) -> &str;

    /// Baud rate used when a command passes zero
    fn default_baudrate(&self) -> u32;

    /// Whether `addr` is excluded from discovery on this bus
    fn is_ignored(&self, _addr: u8) -> bool {
        false
    }

    /// Execute one request/response exchange
    ///
    /// A zero `baudrate` or `timeout` selects the bus default. A non-zero
    /// `settle_time` keeps the bus quiet after a successful exchange.
    async fn command(
        &self,
        req: &mut dyn Request,
        resp: &mut dyn Response,
        baudrate: u32,
        timeout: Duration,
        settle_time: Duration,
    ) -> RackmonResult<()>;

    /// Release the underlying device
    async fn close(&self) -> RackmonResult<()> {
        Ok(())
    }
}

struct BusState {
    device: Box<dyn UartDevice>,
    last_command: Option<Instant>,
}

/// Bus interface over a serial device
pub struct Modbus {
    config: InterfaceConfig,
    state: Mutex<BusState>,
    metrics: StdMutex<CommandMetrics>,
    logger: CallbackLogger,
}

impl Modbus {
    /// Open the configured serial device and build the bus
    pub async fn initialize(config: InterfaceConfig, logger: CallbackLogger) -> RackmonResult<Self> {
        let mut device = SerialUart::new(&config.device_path, config.baudrate, config.device_type);
        device.open().await?;
        logger.info(&format!(
            "🔌 Opened {} ({:?}, {} baud)",
            config.device_path, config.device_type, config.baudrate
        ));
        Ok(Self::with_device(config, Box::new(device), logger))
    }

    /// Build the bus over an already opened device
    pub fn with_device(config: InterfaceConfig, device: Box<dyn UartDevice>, logger: CallbackLogger) -> Self {
        Self {
            config,
            state: Mutex::new(BusState {
                device,
                last_command: None,
            }),
            metrics: StdMutex::new(CommandMetrics::new()),
            logger,
        }
    }

    pub fn config(&self) -> &InterfaceConfig {
        &self.config
    }

    /// Snapshot of the command metrics
    pub fn metrics(&self) -> CommandMetrics {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn log_packet(&self, direction: &str, data: &[u8]) {
        if self.config.packet_logging {
            debug!("[MODBUS-RTU] {} {} {}", self.config.device_path, direction, bytes_to_hex(data));
        }
    }

    async fn exchange(
        &self,
        state: &mut BusState,
        req: &dyn Request,
        resp: &mut dyn Response,
        baudrate: u32,
        timeout: Duration,
    ) -> RackmonResult<()> {
        let token = BusToken(());
        state.device.set_baudrate(baudrate).await?;

        let frame = req.msg().as_bytes();
        self.log_packet("TX", frame);
        state.device.write(frame).await?;

        state.device.read(resp.frame_mut(token).buffer_mut(), timeout).await?;
        self.log_packet("RX", resp.frame_mut(token).as_bytes());

        resp.decode(token)
    }
}

#[async_trait]
impl ModbusBus for Modbus {
    fn name(&self) -> &str {
        &self.config.device_path
    }

    fn default_baudrate(&self) -> u32 {
        self.config.baudrate
    }

    fn is_ignored(&self, addr: u8) -> bool {
        self.config.ignored_addrs.contains(&addr)
    }

    async fn close(&self) -> RackmonResult<()> {
        let mut state = self.state.lock().await;
        state.device.close().await?;
        self.logger.info(&format!(
            "🔌 Closed {}\n{}",
            self.config.device_path,
            format_metrics(&self.metrics())
        ));
        Ok(())
    }

    async fn command(
        &self,
        req: &mut dyn Request,
        resp: &mut dyn Response,
        baudrate: u32,
        timeout: Duration,
        settle_time: Duration,
    ) -> RackmonResult<()> {
        let baudrate = if baudrate == 0 { self.config.baudrate } else { baudrate };
        let timeout = if timeout.is_zero() {
            Duration::from_millis(self.config.default_timeout_ms)
        } else {
            timeout
        };

        let token = BusToken(());
        req.encode(token)?;
        let expected_len = resp.expected_len();
        resp.frame_mut(token).set_expected_len(expected_len)?;

        let mut state = self.state.lock().await;
        if let Some(last) = state.last_command {
            let gap = Duration::from_millis(self.config.min_delay_ms);
            let elapsed = last.elapsed();
            if elapsed < gap {
                tokio::time::sleep(gap - elapsed).await;
            }
        }

        let started = Instant::now();
        let result = self.exchange(&mut state, &*req, resp, baudrate, timeout).await;
        state.last_command = Some(Instant::now());

        let duration = started.elapsed();
        {
            let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
            match result {
                Ok(()) => metrics.record_success(duration),
                Err(_) => metrics.record_failure(duration),
            }
        }

        match result {
            Ok(()) => {
                if !settle_time.is_zero() {
                    tokio::time::sleep(settle_time).await;
                }
                Ok(())
            }
            Err(err) => {
                self.logger.debug(&format!(
                    "Command to 0x{:02X} on {} failed after {}: {}",
                    req.addr(),
                    self.config.device_path,
                    format_duration(duration),
                    err
                ));
                Err(err)
            }
        }
    }
}

/// Scripted buses and codec helpers for unit tests
#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::msg::{crc16, Msg, CRC_SIZE};

    pub(crate) fn token() -> BusToken {
        BusToken(())
    }

    pub(crate) fn encode(req: &mut dyn Request) {
        req.encode(token()).unwrap();
    }

    /// Hex of the encoded request body, after checking its CRC
    pub(crate) fn encoded_hex(req: &mut dyn Request) -> String {
        encode(req);
        let bytes = req.msg().as_bytes();
        let (body, crc) = bytes.split_at(bytes.len() - CRC_SIZE);
        assert_eq!(crc, crc16(body).to_le_bytes());
        hex::encode_upper(body)
    }

    /// Wire bytes for `hex` with the CRC appended
    pub(crate) fn with_crc(hex: &str) -> Vec<u8> {
        let mut bytes = hex::decode(hex).unwrap();
        let crc = crc16(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Decode `hex` (CRC appended here) as if it came off the wire
    pub(crate) fn decode_from_hex(resp: &mut dyn Response, hex: &str) -> RackmonResult<()> {
        *resp.frame_mut(token()) = Msg::from_bytes(&with_crc(hex))?;
        resp.decode(token())
    }

    type Handler = Box<dyn Fn(&[u8]) -> RackmonResult<Vec<u8>> + Send + Sync>;

    /// Bus answering through a closure over request bodies (no CRC)
    pub(crate) struct MockBus {
        name: String,
        handler: Handler,
        ignored: Vec<u8>,
        requests: StdMutex<Vec<(String, u32)>>,
    }

    impl MockBus {
        pub(crate) fn new<F>(handler: F) -> Self
        where
            F: Fn(&[u8]) -> RackmonResult<Vec<u8>> + Send + Sync + 'static,
        {
            Self {
                name: "mock".to_string(),
                handler: Box::new(handler),
                ignored: Vec::new(),
                requests: StdMutex::new(Vec::new()),
            }
        }

        /// Expect exactly these exchanges, in order; hex without CRC
        pub(crate) fn scripted(exchanges: Vec<(&str, RackmonResult<&str>)>) -> Self {
            let queue: VecDeque<(String, RackmonResult<Vec<u8>>)> = exchanges
                .into_iter()
                .map(|(req, resp)| (req.to_uppercase(), resp.map(|hex| hex::decode(hex).unwrap())))
                .collect();
            let queue = StdMutex::new(queue);
            Self::new(move |body| {
                let (expected, reply) = queue
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| panic!("unexpected request {}", hex::encode_upper(body)));
                assert_eq!(hex::encode_upper(body), expected);
                reply
            })
        }

        pub(crate) fn named(mut self, name: &str) -> Self {
            self.name = name.to_string();
            self
        }

        pub(crate) fn with_ignored(mut self, addrs: &[u8]) -> Self {
            self.ignored = addrs.to_vec();
            self
        }

        /// Request bodies seen so far, with the baud rate used
        pub(crate) fn requests(&self) -> Vec<(String, u32)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModbusBus for MockBus {
        fn name(&self) -> &str {
            &self.name
        }

        fn default_baudrate(&self) -> u32 {
            crate::DEFAULT_BAUDRATE
        }

        fn is_ignored(&self, addr: u8) -> bool {
            self.ignored.contains(&addr)
        }

        async fn command(
            &self,
            req: &mut dyn Request,
            resp: &mut dyn Response,
            baudrate: u32,
            timeout: Duration,
            _settle_time: Duration,
        ) -> RackmonResult<()> {
            req.encode(token())?;
            let bytes = req.msg().as_bytes();
            let body = &bytes[..bytes.len() - CRC_SIZE];
            self.requests.lock().unwrap().push((hex::encode_upper(body), baudrate));

            let mut reply = (self.handler)(body)?;
            let crc = crc16(&reply);
            reply.extend_from_slice(&crc.to_le_bytes());
            let expected = resp.expected_len();
            if reply.len() < expected {
                // A short reply never completes the exact-length read
                return Err(RackmonError::timeout("read response", timeout.as_millis() as u64));
            }
            *resp.frame_mut(token()) = Msg::from_bytes(&reply[..expected])?;
            resp.decode(token())
        }
    }
}
