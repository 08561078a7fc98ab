/// Modbus-RTU frame buffer
///
/// `Msg` is a fixed-capacity byte buffer holding one RTU frame
/// (address + function + payload + CRC16). Values are appended at the tail
/// in big-endian order and popped back off the tail, so decoders read a
/// frame last field first.
///
/// Only the bus interface appends or checks the trailing CRC; see
/// [`crate::modbus::BusToken`].

use std::fmt;
use crc::{Crc, CRC_16_MODBUS};

use crate::error::{RackmonError, RackmonResult};

/// Maximum Modbus RTU frame size handled by the codec
pub const MAX_MODBUS_FRAME_SIZE: usize = 253;

/// Size of the CRC trailer
pub const CRC_SIZE: usize = 2;

/// CRC calculator for RTU (polynomial 0xA001 reflected, seed 0xFFFF)
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Compute the Modbus CRC16 over `data`
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// A fixed-width value that can be pushed to or popped from a [`Msg`]
pub trait MsgField: Sized + Copy {
    /// Encoded width in bytes
    const SIZE: usize;

    /// Write big-endian into `out` (exactly `SIZE` bytes)
    fn write_be(self, out: &mut [u8]);

    /// Read big-endian from `input` (exactly `SIZE` bytes)
    fn read_be(input: &[u8]) -> Self;
}

impl MsgField for u8 {
    const SIZE: usize = 1;

    fn write_be(self, out: &mut [u8]) {
        out[0] = self;
    }

    fn read_be(input: &[u8]) -> Self {
        input[0]
    }
}

impl MsgField for u16 {
    const SIZE: usize = 2;

    fn write_be(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_be_bytes());
    }

    fn read_be(input: &[u8]) -> Self {
        u16::from_be_bytes([input[0], input[1]])
    }
}

/// Modbus RTU message buffer
#[derive(Clone)]
pub struct Msg {
    raw: [u8; MAX_MODBUS_FRAME_SIZE],
    len: usize,
}

impl Msg {
    /// Create an empty message
    pub fn new() -> Self {
        Self {
            raw: [0u8; MAX_MODBUS_FRAME_SIZE],
            len: 0,
        }
    }

    /// Create a message holding a copy of `bytes`
    pub fn from_bytes(bytes: &[u8]) -> RackmonResult<Self> {
        let mut msg = Self::new();
        msg.push_slice(bytes)?;
        Ok(msg)
    }

    /// Create a message from a hex string such as `"320300640002"`
    pub fn from_hex(hex_str: &str) -> RackmonResult<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| RackmonError::invalid_argument(format!("Invalid hex message: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Logical length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the message holds no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slave address (first byte); zero for an empty message
    pub fn addr(&self) -> u8 {
        if self.len == 0 {
            0
        } else {
            self.raw[0]
        }
    }

    /// The logical bytes of the frame
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw[..self.len]
    }

    /// Uppercase hex rendering of the logical bytes
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.as_bytes())
    }

    /// Drop all bytes
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Pre-size the buffer for an exact-length read
    pub fn set_expected_len(&mut self, len: usize) -> RackmonResult<()> {
        if len > MAX_MODBUS_FRAME_SIZE {
            return Err(RackmonError::overflow(len, MAX_MODBUS_FRAME_SIZE));
        }
        self.len = len;
        Ok(())
    }

    /// Mutable view of the pre-sized logical bytes, filled by the device read
    pub(crate) fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.raw[..self.len]
    }

    /// Append a value at the tail (big-endian)
    ///
    /// On overflow the buffer is left unchanged.
    pub fn push<T: MsgField>(&mut self, value: T) -> RackmonResult<()> {
        if self.len + T::SIZE > MAX_MODBUS_FRAME_SIZE {
            return Err(RackmonError::overflow(self.len + T::SIZE, MAX_MODBUS_FRAME_SIZE));
        }
        value.write_be(&mut self.raw[self.len..self.len + T::SIZE]);
        self.len += T::SIZE;
        Ok(())
    }

    /// Append raw bytes at the tail
    pub fn push_slice(&mut self, bytes: &[u8]) -> RackmonResult<()> {
        if self.len + bytes.len() > MAX_MODBUS_FRAME_SIZE {
            return Err(RackmonError::overflow(self.len + bytes.len(), MAX_MODBUS_FRAME_SIZE));
        }
        self.raw[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    /// Remove a value from the tail
    pub fn pop<T: MsgField>(&mut self) -> RackmonResult<T> {
        if T::SIZE > self.len {
            return Err(RackmonError::underflow(T::SIZE, self.len));
        }
        self.len -= T::SIZE;
        Ok(T::read_be(&self.raw[self.len..self.len + T::SIZE]))
    }

    /// Append the CRC16 of the current bytes (low byte first on the wire)
    pub(crate) fn finalize(&mut self) -> RackmonResult<()> {
        let crc = crc16(self.as_bytes());
        self.push_slice(&crc.to_le_bytes())
    }

    /// Check and consume the trailing CRC16
    pub(crate) fn validate(&mut self) -> RackmonResult<()> {
        if self.len < CRC_SIZE {
            return Err(RackmonError::underflow(CRC_SIZE, self.len));
        }
        let data_len = self.len - CRC_SIZE;
        let expected = crc16(&self.raw[..data_len]);
        let actual = u16::from_le_bytes([self.raw[data_len], self.raw[data_len + 1]]);
        if expected != actual {
            return Err(RackmonError::crc_mismatch(expected, actual));
        }
        self.len = data_len;
        Ok(())
    }
}

impl Default for Msg {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Msg {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Msg {}

impl fmt::Debug for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Msg({})", self.to_hex())
    }
}
