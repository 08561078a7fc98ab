//! # Register maps
//!
//! A register map describes one device family: the slave address range it
//! applies to, the register probed to detect presence, the baud rates, the
//! registers to monitor, and optional special handlers (periodic writes).
//!
//! Maps are loaded from a directory of JSON files into a
//! [`RegisterMapDatabase`], which resolves a slave address to the map whose
//! range contains it.
//!
//! ```json
//! {
//!   "name": "orv3_psu",
//!   "address_range": [110, 140],
//!   "probe_register": 104,
//!   "default_baudrate": 19200,
//!   "preferred_baudrate": 19200,
//!   "registers": [
//!     { "begin": 0, "length": 8, "format": "string", "name": "MFG_MODEL" }
//!   ]
//! }
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tokio::process::Command;

use crate::error::{RackmonError, RackmonResult};
use crate::msg::{CRC_SIZE, MAX_MODBUS_FRAME_SIZE};

/// Inclusive slave address range, written `[min, max]` in JSON
///
/// Ranges order by upper bound so the database can find the candidate for
/// an address with a single ordered search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "[u8; 2]", into = "[u8; 2]")]
pub struct AddrRange {
    pub min: u8,
    pub max: u8,
}

impl AddrRange {
    pub fn new(min: u8, max: u8) -> RackmonResult<Self> {
        if min > max {
            return Err(RackmonError::configuration(format!(
                "Invalid address range [{}, {}]",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, addr: u8) -> bool {
        self.min <= addr && addr <= self.max
    }

    pub fn overlaps(&self, other: &AddrRange) -> bool {
        self.min <= other.max && other.min <= self.max
    }

    /// All addresses in the range
    pub fn addrs(&self) -> impl Iterator<Item = u8> {
        self.min..=self.max
    }
}

impl TryFrom<[u8; 2]> for AddrRange {
    type Error = RackmonError;

    fn try_from(value: [u8; 2]) -> RackmonResult<Self> {
        AddrRange::new(value[0], value[1])
    }
}

impl From<AddrRange> for [u8; 2] {
    fn from(range: AddrRange) -> Self {
        [range.min, range.max]
    }
}

impl Ord for AddrRange {
    fn cmp(&self, other: &Self) -> Ordering {
        self.max.cmp(&other.max).then(self.min.cmp(&other.min))
    }
}

impl PartialOrd for AddrRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// How the raw words of a register are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterFormat {
    #[default]
    #[serde(alias = "raw")]
    Hex,
    #[serde(alias = "string")]
    Ascii,
    #[serde(alias = "integer")]
    Decimal,
    #[serde(alias = "float")]
    FixedPoint,
    #[serde(alias = "flags")]
    Table,
}

/// Widest range a single read holding registers response can carry
pub const MAX_READ_REGISTERS: u16 = ((MAX_MODBUS_FRAME_SIZE - 3 - CRC_SIZE) / 2) as u16;

fn default_keep() -> usize {
    1
}

/// One monitored register range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDescriptor {
    /// First register
    pub begin: u16,
    /// Number of 16-bit registers
    pub length: u16,
    pub name: String,
    /// History depth
    #[serde(default = "default_keep")]
    pub keep: usize,
    /// Record a sample only when it differs from the latest one
    #[serde(default)]
    pub changes_only: bool,
    #[serde(default)]
    pub format: RegisterFormat,
    /// Fractional bits for fixed point values
    #[serde(default)]
    pub precision: u8,
    /// Two's complement for decimal and fixed point values
    #[serde(default)]
    pub sign: bool,
    /// Bit names for table values, as `[bit, name]` pairs
    #[serde(default, alias = "table")]
    pub flags: Vec<(u8, String)>,
}

impl RegisterDescriptor {
    fn validate(&self) -> RackmonResult<()> {
        if self.length == 0 {
            return Err(RackmonError::configuration(format!("Register {} has zero length", self.name)));
        }
        if self.length > MAX_READ_REGISTERS {
            return Err(RackmonError::configuration(format!(
                "Register {} does not fit one read ({} registers, at most {})",
                self.name, self.length, MAX_READ_REGISTERS
            )));
        }
        if self.keep == 0 {
            return Err(RackmonError::configuration(format!("Register {} keeps no history", self.name)));
        }
        if matches!(self.format, RegisterFormat::Decimal | RegisterFormat::FixedPoint | RegisterFormat::Table)
            && self.length > 4
        {
            return Err(RackmonError::configuration(format!(
                "Register {} is too wide for a numeric format ({} registers)",
                self.name, self.length
            )));
        }
        Ok(())
    }
}

/// How a special handler builds the value it writes
///
/// The value is either given inline or produced by a shell command whose
/// trimmed standard output is interpreted the same way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "interpret", rename_all = "snake_case")]
pub enum WriteValue {
    /// ASCII text, zero padded to the register length
    String {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shell: Option<String>,
    },
    /// Unsigned integer, big-endian across the register length
    Integer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shell: Option<String>,
    },
}

fn default_period() -> i64 {
    -1
}

/// A write issued to the device from the monitor loop
///
/// A negative `period` fires once; otherwise the write repeats every
/// `period` seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialHandler {
    pub reg: u16,
    pub len: u16,
    #[serde(default = "default_period")]
    pub period: i64,
    pub info: WriteValue,
}

impl SpecialHandler {
    /// Register words to write, running the shell command if there is one
    pub async fn payload(&self) -> RackmonResult<Vec<u16>> {
        match &self.info {
            WriteValue::String { shell: Some(cmd), .. } => {
                let output = run_shell(cmd).await?;
                self.encode_string(&output)
            }
            WriteValue::Integer { shell: Some(cmd), .. } => {
                let output = run_shell(cmd).await?;
                let value = output.parse::<u64>().map_err(|_| {
                    RackmonError::invalid_argument(format!("'{}' printed '{}', not an integer", cmd, output))
                })?;
                self.encode_integer(value)
            }
            _ => self.static_payload(),
        }
    }

    /// Payload of an inline value, checked at load time
    fn static_payload(&self) -> RackmonResult<Vec<u16>> {
        match &self.info {
            WriteValue::String { value: Some(value), shell: None } => self.encode_string(value),
            WriteValue::Integer { value: Some(value), shell: None } => self.encode_integer(*value),
            _ => Err(RackmonError::configuration(format!(
                "Special handler for register {} needs exactly one of value or shell",
                self.reg
            ))),
        }
    }

    fn validate(&self) -> RackmonResult<()> {
        match &self.info {
            WriteValue::String { value: None, shell: Some(_) } | WriteValue::Integer { value: None, shell: Some(_) } => {
                Ok(())
            }
            _ => self.static_payload().map(|_| ()),
        }
    }

    fn encode_string(&self, value: &str) -> RackmonResult<Vec<u16>> {
        let len = self.len as usize;
        let bytes = value.as_bytes();
        if bytes.len() > 2 * len {
            return Err(RackmonError::invalid_argument(format!(
                "String '{}' does not fit {} registers",
                value, len
            )));
        }
        let mut padded = bytes.to_vec();
        padded.resize(2 * len, 0);
        Ok(padded.chunks(2).map(|pair| u16::from_be_bytes([pair[0], pair[1]])).collect())
    }

    fn encode_integer(&self, value: u64) -> RackmonResult<Vec<u16>> {
        let len = self.len as usize;
        if len > 4 || (len < 4 && value >> (16 * len) != 0) {
            return Err(RackmonError::invalid_argument(format!(
                "Integer {} does not fit {} registers",
                value, len
            )));
        }
        Ok((0..len).rev().map(|i| (value >> (16 * i)) as u16).collect())
    }
}

async fn run_shell(cmd: &str) -> RackmonResult<String> {
    let output = Command::new("sh").arg("-c").arg(cmd).output().await?;
    if !output.status.success() {
        return Err(RackmonError::internal(format!("'{}' exited with {}", cmd, output.status)));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Register map for one device family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterMap {
    pub name: String,
    pub address_range: AddrRange,
    pub probe_register: u16,
    pub default_baudrate: u32,
    /// Rate a discovered device is moved to
    pub preferred_baudrate: u32,
    /// Register that takes the baud rate code
    #[serde(default)]
    pub baudrate_register: Option<u16>,
    #[serde(default)]
    pub registers: Vec<RegisterDescriptor>,
    #[serde(default)]
    pub special_handlers: Vec<SpecialHandler>,
}

impl RegisterMap {
    /// Parse and validate a map from JSON text
    pub fn from_json(text: &str) -> RackmonResult<Self> {
        let map: RegisterMap = serde_json::from_str(text)?;
        map.validate()?;
        Ok(map)
    }

    fn validate(&self) -> RackmonResult<()> {
        for register in &self.registers {
            register.validate()?;
        }
        for handler in &self.special_handlers {
            handler.validate()?;
        }
        if self.baudrate_register.is_some() {
            baudrate_code(self.preferred_baudrate)?;
        }
        Ok(())
    }
}

/// Code a device takes in its baud rate register
pub fn baudrate_code(baudrate: u32) -> RackmonResult<u16> {
    match baudrate {
        19200 => Ok(1),
        38400 => Ok(2),
        57600 => Ok(3),
        115200 => Ok(4),
        other => Err(RackmonError::configuration(format!("Unsupported baud rate {}", other))),
    }
}

/// All loaded register maps, keyed by address range
#[derive(Debug, Default)]
pub struct RegisterMapDatabase {
    maps: BTreeMap<AddrRange, Arc<RegisterMap>>,
}

impl RegisterMapDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one map; its range must not overlap a loaded one
    pub fn add(&mut self, map: RegisterMap) -> RackmonResult<()> {
        if let Some(existing) = self.maps.values().find(|m| m.address_range.overlaps(&map.address_range)) {
            return Err(RackmonError::configuration(format!(
                "Register map {} overlaps {} at {:?}",
                map.name, existing.name, existing.address_range
            )));
        }
        self.maps.insert(map.address_range, Arc::new(map));
        Ok(())
    }

    /// Load every `*.json` file in `dir`, in file name order
    pub fn load(&mut self, dir: &Path) -> RackmonResult<()> {
        let entries = fs::read_dir(dir).map_err(|e| {
            RackmonError::configuration(format!("Cannot read register map directory {}: {}", dir.display(), e))
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let text = fs::read_to_string(&path)?;
            let map = RegisterMap::from_json(&text).map_err(|e| {
                RackmonError::configuration(format!("{}: {}", path.display(), e))
            })?;
            self.add(map)?;
        }
        Ok(())
    }

    /// The map whose range contains `addr`
    pub fn at(&self, addr: u8) -> RackmonResult<Arc<RegisterMap>> {
        let probe = AddrRange { min: 0, max: addr };
        self.maps
            .range(probe..)
            .next()
            .filter(|(range, _)| range.contains(addr))
            .map(|(_, map)| map.clone())
            .ok_or_else(|| RackmonError::unknown_device(addr))
    }

    /// Every address covered by some map, ascending
    pub fn addresses(&self) -> Vec<u8> {
        self.maps.keys().flat_map(|range| range.addrs()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RegisterMap>> {
        self.maps.values()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}
