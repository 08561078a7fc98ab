//! Register samples, their typed interpretation, and per-register history.

use std::fmt;

use serde::Serialize;

use crate::register_map::{RegisterDescriptor, RegisterFormat};
use crate::utils::format::registers_to_hex;

/// One raw reading of a register range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterValue {
    /// Seconds since the Unix epoch
    pub timestamp: i64,
    pub regs: Vec<u16>,
}

impl RegisterValue {
    pub fn new(timestamp: i64, regs: Vec<u16>) -> Self {
        Self { timestamp, regs }
    }

    /// Interpret the raw words as `descriptor` describes
    pub fn interpret(&self, descriptor: &RegisterDescriptor) -> Value {
        match descriptor.format {
            RegisterFormat::Hex => Value::Hex(registers_to_hex(&self.regs)),
            RegisterFormat::Ascii => Value::String(self.ascii()),
            RegisterFormat::Decimal => Value::Integer(self.integer(descriptor.sign)),
            RegisterFormat::FixedPoint => {
                let scale = (1u64 << descriptor.precision.min(63)) as f64;
                Value::Float(self.integer(descriptor.sign) as f64 / scale)
            }
            RegisterFormat::Table => {
                let raw = self.integer(false) as u64;
                Value::Flags(
                    descriptor
                        .flags
                        .iter()
                        .map(|(bit, name)| FlagValue {
                            bit: *bit,
                            name: name.clone(),
                            set: *bit < 64 && (raw >> bit) & 1 == 1,
                        })
                        .collect(),
                )
            }
        }
    }

    fn ascii(&self) -> String {
        let bytes: Vec<u8> = self.regs.iter().flat_map(|r| r.to_be_bytes()).collect();
        String::from_utf8_lossy(&bytes)
            .trim_end_matches('\0')
            .trim()
            .to_string()
    }

    /// Big-endian integer across the words, sign extended when `signed`
    fn integer(&self, signed: bool) -> i64 {
        let words = &self.regs[..self.regs.len().min(4)];
        let raw = words.iter().fold(0u64, |acc, r| (acc << 16) | *r as u64);
        let bits = 16 * words.len() as u32;
        if signed && bits > 0 && bits < 64 {
            let shift = 64 - bits;
            ((raw << shift) as i64) >> shift
        } else {
            raw as i64
        }
    }
}

/// A named bit of a table register
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlagValue {
    pub bit: u8,
    pub name: String,
    pub set: bool,
}

/// Typed register value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Hex(String),
    String(String),
    Integer(i64),
    Float(f64),
    Flags(Vec<FlagValue>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Hex(s) | Value::String(s) => write!(f, "{}", s),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Flags(flags) => {
                let set: Vec<&str> = flags.iter().filter(|flag| flag.set).map(|flag| flag.name.as_str()).collect();
                if set.is_empty() {
                    write!(f, "-")
                } else {
                    write!(f, "{}", set.join("|"))
                }
            }
        }
    }
}

/// Decimal places that resolve one step of `precision` fractional bits
fn fixed_point_decimals(precision: u8) -> usize {
    (f64::from(precision) * std::f64::consts::LOG10_2).ceil() as usize
}

/// Fixed-capacity ring buffer
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<T>,
    capacity: usize,
    next: usize,
}

impl<T> RingBuffer<T> {
    /// Capacity is at least one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            next: 0,
        }
    }

    /// Store `item`, overwriting the oldest one once full
    pub fn push(&mut self, item: T) {
        if self.slots.len() < self.capacity {
            self.slots.push(item);
        } else {
            self.slots[self.next] = item;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    /// Most recently pushed item
    pub fn latest(&self) -> Option<&T> {
        if self.slots.is_empty() {
            return None;
        }
        let idx = (self.next + self.capacity - 1) % self.capacity;
        self.slots.get(idx)
    }

    /// Items from oldest to newest
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        let split = if self.slots.len() < self.capacity { 0 } else { self.next };
        let (newer, older) = self.slots.split_at(split);
        older.iter().chain(newer.iter())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Recent samples of one register range
#[derive(Debug, Clone)]
pub struct RegisterHistory {
    descriptor: RegisterDescriptor,
    samples: RingBuffer<RegisterValue>,
}

impl RegisterHistory {
    pub fn new(descriptor: RegisterDescriptor) -> Self {
        let samples = RingBuffer::new(descriptor.keep);
        Self { descriptor, samples }
    }

    pub fn descriptor(&self) -> &RegisterDescriptor {
        &self.descriptor
    }

    /// Record a sample; returns whether it was stored
    ///
    /// With `changes_only`, a sample equal to the latest one is dropped.
    pub fn record(&mut self, value: RegisterValue) -> bool {
        if self.descriptor.changes_only {
            if let Some(latest) = self.samples.latest() {
                if latest.regs == value.regs {
                    return false;
                }
            }
        }
        self.samples.push(value);
        true
    }

    /// Samples from oldest to newest
    pub fn samples(&self) -> impl DoubleEndedIterator<Item = &RegisterValue> {
        self.samples.iter()
    }

    pub fn latest(&self) -> Option<&RegisterValue> {
        self.samples.latest()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// `"  <0xBEGIN> NAME : newest older ..."`
    pub fn format_line(&self) -> String {
        let values: Vec<String> = self
            .samples()
            .rev()
            .map(|sample| match sample.interpret(&self.descriptor) {
                Value::Float(v) => format!("{:.*}", fixed_point_decimals(self.descriptor.precision), v),
                other => other.to_string(),
            })
            .collect();
        format!(
            "  <0x{:04X}> {:<32} : {}",
            self.descriptor.begin,
            self.descriptor.name,
            values.join(" ")
        )
    }
}
