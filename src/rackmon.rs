//! # Rackmon orchestrator
//!
//! Owns the bus interfaces, the register map database and two disjoint
//! device pools:
//!
//! - **active**: polled on every monitor pass
//! - **dormant**: demoted after too many consecutive failures, probed by the
//!   recovery scan once quiet for the configured inactivity window
//!
//! Two background tasks drive everything:
//!
//! - **scan**: a forced full rescan when requested, otherwise dormant
//!   recovery followed by one incremental probe of the next unknown address
//! - **monitor**: polls every active device, then demotes unstable ones
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use rackmon::{CallbackLogger, Rackmon, RackmonConfig};
//!
//! # async fn example() -> rackmon::RackmonResult<()> {
//! let config = RackmonConfig::load(Path::new("/etc/rackmon.conf"))?;
//! let rackmon = Arc::new(Rackmon::load(config, Path::new("/etc/rackmon.d"), CallbackLogger::console()).await?);
//! rackmon.start().await?;
//! // ...
//! rackmon.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::error::{RackmonError, RackmonResult};
use crate::logging::CallbackLogger;
use crate::modbus::{InterfaceConfig, Modbus, ModbusBus};
use crate::modbus_device::{
    ModbusDevice, ModbusDeviceFmtData, ModbusDeviceRawData, ModbusDeviceStatus, ModbusDeviceValueData,
};
use crate::protocol::{ReadHoldingRegistersReq, ReadHoldingRegistersResp, Request, Response};
use crate::register_map::RegisterMapDatabase;
use crate::utils::time::now_secs;

fn default_scan_interval_ms() -> u64 {
    120_000
}

fn default_monitor_interval_ms() -> u64 {
    3_000
}

fn default_dormant_min_inactive_time_s() -> i64 {
    300
}

fn default_probe_timeout_ms() -> u64 {
    50
}

/// Loop cadences and probe deadlines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RackmonTiming {
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    #[serde(default = "default_dormant_min_inactive_time_s")]
    pub dormant_min_inactive_time_s: i64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for RackmonTiming {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
            dormant_min_inactive_time_s: default_dormant_min_inactive_time_s(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

/// Interface configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RackmonConfig {
    pub interfaces: Vec<InterfaceConfig>,
    #[serde(default)]
    pub timing: RackmonTiming,
}

impl RackmonConfig {
    pub fn from_json(text: &str) -> RackmonResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> RackmonResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            RackmonError::configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }
}

/// The two device pools; an address is in at most one of them
#[derive(Default)]
struct DevicePools {
    active: BTreeMap<u8, Arc<ModbusDevice>>,
    dormant: BTreeMap<u8, Arc<ModbusDevice>>,
}

impl DevicePools {
    fn is_known(&self, addr: u8) -> bool {
        self.active.contains_key(&addr) || self.dormant.contains_key(&addr)
    }

    fn insert_active(&mut self, device: Arc<ModbusDevice>) -> bool {
        if self.is_known(device.addr()) {
            return false;
        }
        self.active.insert(device.addr(), device);
        true
    }

    fn mark_active(&mut self, addr: u8) -> bool {
        match self.dormant.remove(&addr) {
            Some(device) => {
                self.active.insert(addr, device);
                true
            }
            None => false,
        }
    }

    fn mark_dormant(&mut self, addr: u8) -> bool {
        match self.active.remove(&addr) {
            Some(device) => {
                self.dormant.insert(addr, device);
                true
            }
            None => false,
        }
    }

    fn all(&self) -> impl Iterator<Item = &Arc<ModbusDevice>> {
        self.active.values().chain(self.dormant.values())
    }
}

/// Rack monitor
pub struct Rackmon {
    interfaces: Vec<Arc<dyn ModbusBus>>,
    database: RegisterMapDatabase,
    /// Every address covered by a register map
    scan_universe: Vec<u8>,
    devices: RwLock<DevicePools>,
    scan_cursor: StdMutex<usize>,
    force_scan: AtomicBool,
    stop_requested: AtomicBool,
    running: AtomicBool,
    wakeup: Notify,
    workers: Mutex<Vec<JoinHandle<()>>>,
    last_scan: AtomicI64,
    last_monitor: AtomicI64,
    timing: RackmonTiming,
    logger: CallbackLogger,
}

impl Rackmon {
    /// Open every configured bus and load the register maps in `regmap_dir`
    pub async fn load(config: RackmonConfig, regmap_dir: &Path, logger: CallbackLogger) -> RackmonResult<Self> {
        let mut database = RegisterMapDatabase::new();
        database.load(regmap_dir)?;
        logger.info(&format!("📚 Loaded {} register maps from {}", database.len(), regmap_dir.display()));

        let mut interfaces: Vec<Arc<dyn ModbusBus>> = Vec::with_capacity(config.interfaces.len());
        for interface in config.interfaces {
            interfaces.push(Arc::new(Modbus::initialize(interface, logger.clone()).await?));
        }

        Ok(Self::with_interfaces(interfaces, database, config.timing, logger))
    }

    /// Build over already constructed buses
    pub fn with_interfaces(
        interfaces: Vec<Arc<dyn ModbusBus>>,
        database: RegisterMapDatabase,
        timing: RackmonTiming,
        logger: CallbackLogger,
    ) -> Self {
        let scan_universe = (0..=u8::MAX).filter(|addr| database.at(*addr).is_ok()).collect();
        Self {
            interfaces,
            database,
            scan_universe,
            devices: RwLock::new(DevicePools::default()),
            scan_cursor: StdMutex::new(0),
            // the first scan pass covers everything
            force_scan: AtomicBool::new(true),
            stop_requested: AtomicBool::new(false),
            running: AtomicBool::new(false),
            wakeup: Notify::new(),
            workers: Mutex::new(Vec::new()),
            last_scan: AtomicI64::new(0),
            last_monitor: AtomicI64::new(0),
            timing,
            logger,
        }
    }

    pub fn timing(&self) -> &RackmonTiming {
        &self.timing
    }

    pub fn database(&self) -> &RegisterMapDatabase {
        &self.database
    }

    fn stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Probe `addr` on every bus in order; the first to answer gets it
    ///
    /// Returns whether a device answered.
    pub async fn probe(&self, addr: u8) -> RackmonResult<bool> {
        let register_map = self.database.at(addr)?;
        let timeout = Duration::from_millis(self.timing.probe_timeout_ms);

        for interface in &self.interfaces {
            if interface.is_ignored(addr) {
                continue;
            }
            let mut req = ReadHoldingRegistersReq::new(addr, register_map.probe_register, 1);
            let mut resp = ReadHoldingRegistersResp::new(addr, 1);
            let result = interface
                .command(&mut req, &mut resp, register_map.default_baudrate, timeout, Duration::ZERO)
                .await;
            if result.is_ok() {
                let device = Arc::new(ModbusDevice::new(
                    interface.clone(),
                    addr,
                    register_map.clone(),
                    self.logger.clone(),
                ));
                let inserted = self.devices.write().await.insert_active(device.clone());
                if inserted {
                    self.logger.info(&format!(
                        "🔍 Found {} at 0x{:02X} on {}",
                        register_map.name,
                        addr,
                        interface.name()
                    ));
                    // a device that cannot switch stays at the default rate
                    let _ = device.raise_baudrate().await;
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn is_known(&self, addr: u8) -> bool {
        self.devices.read().await.is_known(addr)
    }

    /// Probe every address not yet known
    pub async fn scan_all(&self) {
        self.logger.info("🔎 Scanning all addresses");
        for &addr in &self.scan_universe {
            if self.stopping() {
                break;
            }
            if self.is_known(addr).await {
                continue;
            }
            // every scanned address has a map
            let _ = self.probe(addr).await;
        }
        self.last_scan.store(now_secs(), Ordering::SeqCst);
    }

    /// Probe the next unknown address after the scan cursor
    pub async fn scan_next(&self) {
        let count = self.scan_universe.len();
        for _ in 0..count {
            let addr = {
                let mut cursor = self.scan_cursor.lock().unwrap_or_else(PoisonError::into_inner);
                let addr = self.scan_universe[*cursor % count];
                *cursor = (*cursor + 1) % count;
                addr
            };
            if self.is_known(addr).await {
                continue;
            }
            let _ = self.probe(addr).await;
            break;
        }
        self.last_scan.store(now_secs(), Ordering::SeqCst);
    }

    /// Probe dormant devices that have been quiet long enough
    ///
    /// Returns the addresses moved back to the active pool.
    pub async fn recover_dormant(&self) -> Vec<u8> {
        let now = now_secs();
        let candidates: Vec<Arc<ModbusDevice>> = self
            .devices
            .read()
            .await
            .dormant
            .values()
            .filter(|device| now - device.last_active() >= self.timing.dormant_min_inactive_time_s)
            .cloned()
            .collect();

        let timeout = Duration::from_millis(self.timing.probe_timeout_ms);
        let mut recovered = Vec::new();
        for device in candidates {
            let addr = device.addr();
            let mut req = ReadHoldingRegistersReq::new(addr, device.register_map().probe_register, 1);
            let mut resp = ReadHoldingRegistersResp::new(addr, 1);
            if device.command(&mut req, &mut resp, timeout, Duration::ZERO).await.is_ok() {
                recovered.push(addr);
            }
        }

        if !recovered.is_empty() {
            let mut pools = self.devices.write().await;
            for addr in &recovered {
                if pools.mark_active(*addr) {
                    self.logger.info(&format!("✅ Device 0x{:02X} recovered", addr));
                }
            }
        }
        recovered
    }

    /// One scan loop iteration
    pub async fn scan(&self) {
        if self.force_scan.swap(false, Ordering::SeqCst) {
            self.scan_all().await;
        } else {
            self.recover_dormant().await;
            self.scan_next().await;
        }
    }

    /// Poll every active device once, then demote the unstable ones
    pub async fn monitor(&self) {
        let devices: Vec<Arc<ModbusDevice>> = self.devices.read().await.active.values().cloned().collect();
        join_all(devices.iter().map(|device| device.monitor())).await;

        let unstable: Vec<u8> = devices
            .iter()
            .filter(|device| device.is_unstable())
            .map(|device| device.addr())
            .collect();
        if !unstable.is_empty() {
            let mut pools = self.devices.write().await;
            for addr in unstable {
                if pools.mark_dormant(addr) {
                    self.logger.warn(&format!("⚠️ Device 0x{:02X} is unstable, marking dormant", addr));
                }
            }
        }
        self.last_monitor.store(now_secs(), Ordering::SeqCst);
    }

    /// Sleep for `interval` unless stop is requested first
    async fn wait_or_stop(&self, interval: Duration) {
        let notified = self.wakeup.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.stopping() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = notified => {}
        }
    }

    async fn scan_loop(self: Arc<Self>) {
        let interval = Duration::from_millis(self.timing.scan_interval_ms);
        while !self.stopping() {
            self.scan().await;
            self.wait_or_stop(interval).await;
        }
    }

    async fn monitor_loop(self: Arc<Self>) {
        let interval = Duration::from_millis(self.timing.monitor_interval_ms);
        while !self.stopping() {
            self.monitor().await;
            self.wait_or_stop(interval).await;
        }
    }

    /// Spawn the scan and monitor loops
    pub async fn start(self: &Arc<Self>) -> RackmonResult<()> {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return Err(RackmonError::invalid_argument("Rackmon is already running"));
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        workers.push(tokio::spawn(self.clone().scan_loop()));
        workers.push(tokio::spawn(self.clone().monitor_loop()));
        self.running.store(true, Ordering::SeqCst);
        self.logger.info(&format!("🚀 Rackmon started on {} interfaces", self.interfaces.len()));
        Ok(())
    }

    /// Signal both loops to exit and wait for them
    pub async fn stop(&self) -> RackmonResult<()> {
        let mut workers = self.workers.lock().await;
        if workers.is_empty() {
            return Err(RackmonError::invalid_argument("Rackmon is not running"));
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        self.wakeup.notify_waiters();

        let mut result = Ok(());
        for handle in workers.drain(..) {
            if let Err(e) = handle.await {
                result = Err(RackmonError::internal(format!("Worker task failed: {}", e)));
            }
        }
        self.running.store(false, Ordering::SeqCst);
        self.logger.info("🛑 Rackmon stopped");
        result
    }

    /// Close every bus; call after `stop()`
    pub async fn close(&self) -> RackmonResult<()> {
        for interface in &self.interfaces {
            interface.close().await?;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Request a full rescan on the next scan iteration
    pub fn force_scan(&self) {
        self.force_scan.store(true, Ordering::SeqCst);
        self.wakeup.notify_waiters();
    }

    /// Forward a command to the active device owning `req`'s address
    pub async fn raw_cmd(&self, req: &mut dyn Request, resp: &mut dyn Response, timeout: Duration) -> RackmonResult<()> {
        let addr = req.addr();
        let device = self
            .devices
            .read()
            .await
            .active
            .get(&addr)
            .cloned()
            .ok_or_else(|| RackmonError::unknown_device(addr))?;
        device.command(req, resp, timeout, Duration::ZERO).await
    }

    pub async fn active_addrs(&self) -> Vec<u8> {
        self.devices.read().await.active.keys().copied().collect()
    }

    pub async fn dormant_addrs(&self) -> Vec<u8> {
        self.devices.read().await.dormant.keys().copied().collect()
    }

    /// Seconds since the epoch of the last scan iteration, zero before any
    pub fn last_scan(&self) -> i64 {
        self.last_scan.load(Ordering::SeqCst)
    }

    pub fn last_monitor(&self) -> i64 {
        self.last_monitor.load(Ordering::SeqCst)
    }

    pub async fn get_monitor_status(&self) -> Vec<ModbusDeviceStatus> {
        self.devices.read().await.all().map(|device| device.get_status()).collect()
    }

    pub async fn get_monitor_data(&self) -> Vec<ModbusDeviceValueData> {
        let pools = self.devices.read().await;
        join_all(pools.all().map(|device| device.get_value_data())).await
    }

    pub async fn get_monitor_data_raw(&self) -> Vec<ModbusDeviceRawData> {
        let pools = self.devices.read().await;
        join_all(pools.all().map(|device| device.get_raw_data())).await
    }

    pub async fn get_monitor_data_formatted(&self) -> Vec<ModbusDeviceFmtData> {
        let pools = self.devices.read().await;
        join_all(pools.all().map(|device| device.get_fmt_data())).await
    }
}
