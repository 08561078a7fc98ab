//! # Modbus device
//!
//! A [`ModbusDevice`] is one discovered slave on a bus. It issues the typed
//! commands, tallies every failure by kind, and keeps a history ring for
//! each register its map describes.
//!
//! ## Health
//!
//! Each failed command bumps `num_consecutive_failures`; a success resets
//! it. At [`MAX_CONSECUTIVE_FAILURES`] the device reports itself unstable
//! and the orchestrator moves it to the dormant pool.
//!
//! ## Snapshots
//!
//! Status, typed values, raw words and preformatted lines are returned as
//! owned, serializable copies so callers never hold device locks.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use tokio::sync::Mutex;

use crate::error::RackmonResult;
use crate::logging::CallbackLogger;
use crate::modbus::ModbusBus;
use crate::protocol::{
    FileRecord, ReadFileRecordReq, ReadFileRecordResp, ReadHoldingRegistersReq, ReadHoldingRegistersResp, Request,
    Response, WriteMultipleRegistersReq, WriteMultipleRegistersResp, WriteSingleRegisterReq, WriteSingleRegisterResp,
};
use crate::register::{RegisterHistory, RegisterValue, Value};
use crate::register_map::{baudrate_code, RegisterMap, SpecialHandler};
use crate::utils::format::registers_to_hex;
use crate::utils::time::now_secs;

/// Consecutive failures after which a device is considered unstable
pub const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Health mode derived from the failure count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModbusDeviceMode {
    Active,
    Dormant,
}

/// Counters of one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusDeviceStatus {
    pub addr: u8,
    pub baudrate: u32,
    pub crc_failures: u32,
    pub timeouts: u32,
    pub misc_failures: u32,
    pub num_consecutive_failures: u32,
    /// Time of the last successful command, seconds since the epoch
    pub last_active: i64,
}

impl ModbusDeviceStatus {
    pub fn mode(&self) -> ModbusDeviceMode {
        if self.num_consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            ModbusDeviceMode::Dormant
        } else {
            ModbusDeviceMode::Active
        }
    }
}

impl Serialize for ModbusDeviceStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("ModbusDeviceStatus", 8)?;
        s.serialize_field("addr", &self.addr)?;
        s.serialize_field("crc_fails", &self.crc_failures)?;
        s.serialize_field("timeouts", &self.timeouts)?;
        s.serialize_field("misc_fails", &self.misc_failures)?;
        s.serialize_field("mode", &self.mode())?;
        s.serialize_field("baudrate", &self.baudrate)?;
        s.serialize_field("last_active", &self.last_active)?;
        s.serialize_field("num_consecutive_failures", &self.num_consecutive_failures)?;
        s.end()
    }
}

/// One typed reading
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueReading {
    pub time: i64,
    #[serde(flatten)]
    pub value: Value,
}

/// Typed history of one register range
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisterValueData {
    pub begin: u16,
    pub name: String,
    pub readings: Vec<ValueReading>,
}

/// Typed snapshot of a device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModbusDeviceValueData {
    #[serde(flatten)]
    pub status: ModbusDeviceStatus,
    #[serde(rename = "type")]
    pub device_type: String,
    pub now: i64,
    pub ranges: Vec<RegisterValueData>,
}

/// One raw reading, words as contiguous hex
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawReading {
    pub time: i64,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterRawData {
    pub begin: u16,
    pub name: String,
    pub readings: Vec<RawReading>,
}

/// Raw snapshot of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModbusDeviceRawData {
    #[serde(flatten)]
    pub status: ModbusDeviceStatus,
    #[serde(rename = "type")]
    pub device_type: String,
    pub now: i64,
    pub ranges: Vec<RegisterRawData>,
}

/// Preformatted snapshot of a device, one line per register range
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModbusDeviceFmtData {
    #[serde(flatten)]
    pub status: ModbusDeviceStatus,
    #[serde(rename = "type")]
    pub device_type: String,
    pub now: i64,
    pub ranges: Vec<String>,
}

struct MonitorState {
    histories: Vec<RegisterHistory>,
    /// Last successful run of each special handler
    handler_runs: Vec<Option<i64>>,
}

/// A slave device on one bus
pub struct ModbusDevice {
    interface: Arc<dyn ModbusBus>,
    addr: u8,
    register_map: Arc<RegisterMap>,
    status: StdMutex<ModbusDeviceStatus>,
    monitor_state: Mutex<MonitorState>,
    logger: CallbackLogger,
}

impl ModbusDevice {
    pub fn new(interface: Arc<dyn ModbusBus>, addr: u8, register_map: Arc<RegisterMap>, logger: CallbackLogger) -> Self {
        let status = ModbusDeviceStatus {
            addr,
            baudrate: register_map.default_baudrate,
            crc_failures: 0,
            timeouts: 0,
            misc_failures: 0,
            num_consecutive_failures: 0,
            last_active: now_secs(),
        };
        let monitor_state = MonitorState {
            histories: register_map.registers.iter().cloned().map(RegisterHistory::new).collect(),
            handler_runs: vec![None; register_map.special_handlers.len()],
        };
        Self {
            interface,
            addr,
            register_map,
            status: StdMutex::new(status),
            monitor_state: Mutex::new(monitor_state),
            logger,
        }
    }

    pub fn addr(&self) -> u8 {
        self.addr
    }

    pub fn register_map(&self) -> &Arc<RegisterMap> {
        &self.register_map
    }

    /// Name of the bus this device sits on
    pub fn interface_name(&self) -> &str {
        self.interface.name()
    }

    fn lock_status(&self) -> MutexGuard<'_, ModbusDeviceStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue a command at the device's baud rate and tally the outcome
    pub async fn command(
        &self,
        req: &mut dyn Request,
        resp: &mut dyn Response,
        timeout: Duration,
        settle_time: Duration,
    ) -> RackmonResult<()> {
        let baudrate = self.lock_status().baudrate;
        let result = self.interface.command(req, resp, baudrate, timeout, settle_time).await;

        let mut status = self.lock_status();
        match &result {
            Ok(()) => {
                status.num_consecutive_failures = 0;
                status.last_active = now_secs();
            }
            Err(err) => {
                if err.is_timeout() {
                    status.timeouts += 1;
                } else if err.is_crc() {
                    status.crc_failures += 1;
                } else {
                    status.misc_failures += 1;
                }
                status.num_consecutive_failures += 1;
            }
        }
        result
    }

    pub async fn read_holding_registers(&self, offset: u16, count: u16) -> RackmonResult<Vec<u16>> {
        let mut req = ReadHoldingRegistersReq::new(self.addr, offset, count);
        let mut resp = ReadHoldingRegistersResp::new(self.addr, count);
        self.command(&mut req, &mut resp, Duration::ZERO, Duration::ZERO).await?;
        Ok(resp.into_registers())
    }

    pub async fn write_single_register(&self, offset: u16, value: u16) -> RackmonResult<()> {
        let mut req = WriteSingleRegisterReq::new(self.addr, offset, value);
        let mut resp = WriteSingleRegisterResp::new(self.addr, offset, value);
        self.command(&mut req, &mut resp, Duration::ZERO, Duration::ZERO).await
    }

    pub async fn write_multiple_registers(&self, offset: u16, values: &[u16]) -> RackmonResult<()> {
        let mut req = WriteMultipleRegistersReq::with_registers(self.addr, offset, values);
        let mut resp = WriteMultipleRegistersResp::new(self.addr, offset, req.register_count());
        self.command(&mut req, &mut resp, Duration::ZERO, Duration::ZERO).await
    }

    /// Read the given records; each record's `data` length selects how much
    pub async fn read_file_record(&self, records: Vec<FileRecord>) -> RackmonResult<Vec<FileRecord>> {
        let mut req = ReadFileRecordReq::new(self.addr, &records);
        let mut resp = ReadFileRecordResp::new(self.addr, records);
        self.command(&mut req, &mut resp, Duration::ZERO, Duration::ZERO).await?;
        Ok(resp.into_records())
    }

    async fn run_special_handlers(&self, state: &mut MonitorState, now: i64) {
        for (idx, handler) in self.register_map.special_handlers.iter().enumerate() {
            let due = match state.handler_runs[idx] {
                None => true,
                Some(last) => handler.period >= 0 && now - last >= handler.period,
            };
            if !due {
                continue;
            }
            match self.run_special_handler(handler).await {
                Ok(()) => state.handler_runs[idx] = Some(now),
                Err(err) => self.logger.warn(&format!(
                    "Special handler for 0x{:02X} register 0x{:04X} failed: {}",
                    self.addr, handler.reg, err
                )),
            }
        }
    }

    async fn run_special_handler(&self, handler: &SpecialHandler) -> RackmonResult<()> {
        let payload = handler.payload().await?;
        self.write_multiple_registers(handler.reg, &payload).await
    }

    /// Poll every register once and record the readings
    ///
    /// A failed read is logged and skipped; the rest are still polled.
    pub async fn monitor(&self) {
        let mut state = self.monitor_state.lock().await;
        self.run_special_handlers(&mut state, now_secs()).await;

        for history in state.histories.iter_mut() {
            let (begin, length) = {
                let descriptor = history.descriptor();
                (descriptor.begin, descriptor.length)
            };
            match self.read_holding_registers(begin, length).await {
                Ok(regs) => {
                    history.record(RegisterValue::new(now_secs(), regs));
                }
                Err(err) => self.logger.debug(&format!(
                    "Monitoring 0x{:02X} register 0x{:04X} ({}) failed: {}",
                    self.addr,
                    begin,
                    history.descriptor().name,
                    err
                )),
            }
        }
    }

    /// Move the device to its map's preferred baud rate
    ///
    /// With a baud rate register, the rate code is written there at the
    /// current speed first. The new speed is kept only if the probe register
    /// then answers at it; otherwise the device falls back to the default.
    pub async fn raise_baudrate(&self) -> RackmonResult<()> {
        let preferred = self.register_map.preferred_baudrate;
        if self.lock_status().baudrate == preferred {
            return Ok(());
        }
        if let Some(reg) = self.register_map.baudrate_register {
            if let Err(err) = self.write_single_register(reg, baudrate_code(preferred)?).await {
                self.logger.warn(&format!(
                    "Could not set 0x{:02X} to {} baud: {}",
                    self.addr, preferred, err
                ));
                return Err(err);
            }
        }

        self.lock_status().baudrate = preferred;
        let probe_register = self.register_map.probe_register;
        if let Err(err) = self.read_holding_registers(probe_register, 1).await {
            self.lock_status().baudrate = self.register_map.default_baudrate;
            self.logger.warn(&format!(
                "0x{:02X} silent at {} baud, back to {}: {}",
                self.addr, preferred, self.register_map.default_baudrate, err
            ));
            return Err(err);
        }
        self.logger.info(&format!("⚡ 0x{:02X} now at {} baud", self.addr, preferred));
        Ok(())
    }

    pub fn is_unstable(&self) -> bool {
        self.lock_status().num_consecutive_failures >= MAX_CONSECUTIVE_FAILURES
    }

    pub fn clear_unstable(&self) {
        self.lock_status().num_consecutive_failures = 0;
    }

    /// Time of the last successful command
    pub fn last_active(&self) -> i64 {
        self.lock_status().last_active
    }

    pub fn get_status(&self) -> ModbusDeviceStatus {
        self.lock_status().clone()
    }

    pub async fn get_value_data(&self) -> ModbusDeviceValueData {
        let state = self.monitor_state.lock().await;
        let ranges = state
            .histories
            .iter()
            .map(|history| RegisterValueData {
                begin: history.descriptor().begin,
                name: history.descriptor().name.clone(),
                readings: history
                    .samples()
                    .map(|sample| ValueReading {
                        time: sample.timestamp,
                        value: sample.interpret(history.descriptor()),
                    })
                    .collect(),
            })
            .collect();
        ModbusDeviceValueData {
            status: self.get_status(),
            device_type: self.register_map.name.clone(),
            now: now_secs(),
            ranges,
        }
    }

    pub async fn get_raw_data(&self) -> ModbusDeviceRawData {
        let state = self.monitor_state.lock().await;
        let ranges = state
            .histories
            .iter()
            .map(|history| RegisterRawData {
                begin: history.descriptor().begin,
                name: history.descriptor().name.clone(),
                readings: history
                    .samples()
                    .map(|sample| RawReading {
                        time: sample.timestamp,
                        data: registers_to_hex(&sample.regs),
                    })
                    .collect(),
            })
            .collect();
        ModbusDeviceRawData {
            status: self.get_status(),
            device_type: self.register_map.name.clone(),
            now: now_secs(),
            ranges,
        }
    }

    pub async fn get_fmt_data(&self) -> ModbusDeviceFmtData {
        let state = self.monitor_state.lock().await;
        ModbusDeviceFmtData {
            status: self.get_status(),
            device_type: self.register_map.name.clone(),
            now: now_secs(),
            ranges: state.histories.iter().map(RegisterHistory::format_line).collect(),
        }
    }
}
