/// Modbus command set
///
/// Typed request/response pairs built on [`Msg`]. A request serializes
/// address, function code and payload, then appends the CRC. A response is
/// pre-sized to the exact frame length it expects, and once the bus has
/// filled and CRC-checked it, fields are popped off the tail and every one
/// of them is cross-checked against the request.
///
/// Both halves are only ever encoded or decoded by the bus interface,
/// which is the sole holder of a [`BusToken`].

use std::fmt;

use crate::error::{RackmonError, RackmonResult};
use crate::modbus::BusToken;
use crate::msg::{Msg, MsgField, CRC_SIZE};

/// Modbus slave address (the first byte of every frame)
pub type SlaveAddr = u8;

/// Record reference type mandated for file record sub-requests
const FILE_RECORD_REFERENCE_TYPE: u8 = 6;

/// Modbus function codes used by rack power devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
    /// Read File Record (0x14)
    ReadFileRecord = 0x14,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> RackmonResult<Self> {
        match value {
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            0x14 => Ok(ModbusFunction::ReadFileRecord),
            _ => Err(RackmonError::invalid_argument(format!("Unsupported function code: 0x{:02X}", value))),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
            ModbusFunction::ReadFileRecord => "Read File Record",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// An encodable request frame
pub trait Request: Send + Sync {
    /// Slave address the request is destined to
    fn addr(&self) -> SlaveAddr;

    /// The wire frame; holds the encoded bytes once the bus has encoded it
    fn msg(&self) -> &Msg;

    /// Serialize the request into its frame and append the CRC
    fn encode(&mut self, token: BusToken) -> RackmonResult<()>;
}

/// A decodable response frame
pub trait Response: Send + Sync {
    /// Exact number of bytes to read off the wire, CRC included
    fn expected_len(&self) -> usize;

    /// The frame buffer the bus reads into
    fn frame_mut(&mut self, token: BusToken) -> &mut Msg;

    /// Validate the CRC and extract, cross-checking every field
    fn decode(&mut self, token: BusToken) -> RackmonResult<()>;
}

fn check_field(field: &'static str, expected: u32, actual: u32) -> RackmonResult<()> {
    if expected != actual {
        return Err(RackmonError::bad_response(field, expected, actual));
    }
    Ok(())
}

/// Check the `addr + function` head left once the payload is popped
fn check_head(msg: &mut Msg, addr: SlaveAddr, function: ModbusFunction) -> RackmonResult<()> {
    let actual_function: u8 = msg.pop()?;
    let actual_addr: u8 = msg.pop()?;
    check_field("function", function.to_u8() as u32, actual_function as u32)?;
    check_field("address", addr as u32, actual_addr as u32)
}

/// Read Holding Registers request (0x03)
#[derive(Debug, Clone)]
pub struct ReadHoldingRegistersReq {
    addr: SlaveAddr,
    offset: u16,
    count: u16,
    msg: Msg,
}

impl ReadHoldingRegistersReq {
    pub fn new(addr: SlaveAddr, offset: u16, count: u16) -> Self {
        Self {
            addr,
            offset,
            count,
            msg: Msg::new(),
        }
    }
}

impl Request for ReadHoldingRegistersReq {
    fn addr(&self) -> SlaveAddr {
        self.addr
    }

    fn msg(&self) -> &Msg {
        &self.msg
    }

    fn encode(&mut self, _token: BusToken) -> RackmonResult<()> {
        self.msg.clear();
        self.msg.push(self.addr)?;
        self.msg.push(ModbusFunction::ReadHoldingRegisters.to_u8())?;
        self.msg.push(self.offset)?;
        self.msg.push(self.count)?;
        self.msg.finalize()
    }
}

/// Read Holding Registers response
#[derive(Debug, Clone)]
pub struct ReadHoldingRegistersResp {
    addr: SlaveAddr,
    regs: Vec<u16>,
    msg: Msg,
}

impl ReadHoldingRegistersResp {
    /// Expect `count` registers from `addr`
    pub fn new(addr: SlaveAddr, count: u16) -> Self {
        Self {
            addr,
            regs: vec![0; count as usize],
            msg: Msg::new(),
        }
    }

    /// Decoded register values
    pub fn registers(&self) -> &[u16] {
        &self.regs
    }

    pub fn into_registers(self) -> Vec<u16> {
        self.regs
    }
}

impl Response for ReadHoldingRegistersResp {
    fn expected_len(&self) -> usize {
        // addr + function + byte count + regs + crc
        3 + 2 * self.regs.len() + CRC_SIZE
    }

    fn frame_mut(&mut self, _token: BusToken) -> &mut Msg {
        &mut self.msg
    }

    fn decode(&mut self, _token: BusToken) -> RackmonResult<()> {
        self.msg.validate()?;
        for reg in self.regs.iter_mut().rev() {
            *reg = self.msg.pop()?;
        }
        let byte_count: u8 = self.msg.pop()?;
        let function: u8 = self.msg.pop()?;
        let addr: u8 = self.msg.pop()?;
        check_field("function", ModbusFunction::ReadHoldingRegisters.to_u8() as u32, function as u32)?;
        check_field("byte count", 2 * self.regs.len() as u32, byte_count as u32)?;
        check_field("address", self.addr as u32, addr as u32)
    }
}

/// Write Single Register request (0x06)
#[derive(Debug, Clone)]
pub struct WriteSingleRegisterReq {
    addr: SlaveAddr,
    offset: u16,
    value: u16,
    msg: Msg,
}

impl WriteSingleRegisterReq {
    pub fn new(addr: SlaveAddr, offset: u16, value: u16) -> Self {
        Self {
            addr,
            offset,
            value,
            msg: Msg::new(),
        }
    }
}

impl Request for WriteSingleRegisterReq {
    fn addr(&self) -> SlaveAddr {
        self.addr
    }

    fn msg(&self) -> &Msg {
        &self.msg
    }

    fn encode(&mut self, _token: BusToken) -> RackmonResult<()> {
        self.msg.clear();
        self.msg.push(self.addr)?;
        self.msg.push(ModbusFunction::WriteSingleRegister.to_u8())?;
        self.msg.push(self.offset)?;
        self.msg.push(self.value)?;
        self.msg.finalize()
    }
}

/// Write Single Register response, an echo of the request
#[derive(Debug, Clone)]
pub struct WriteSingleRegisterResp {
    addr: SlaveAddr,
    offset: u16,
    value: Option<u16>,
    msg: Msg,
}

impl WriteSingleRegisterResp {
    /// Expect the echo of `value` written at `offset`
    pub fn new(addr: SlaveAddr, offset: u16, value: u16) -> Self {
        Self {
            addr,
            offset,
            value: Some(value),
            msg: Msg::new(),
        }
    }

    /// Accept whatever value the device echoes back
    pub fn any_value(addr: SlaveAddr, offset: u16) -> Self {
        Self {
            addr,
            offset,
            value: None,
            msg: Msg::new(),
        }
    }

    /// Value echoed by the device (valid after decode)
    pub fn value(&self) -> Option<u16> {
        self.value
    }
}

impl Response for WriteSingleRegisterResp {
    fn expected_len(&self) -> usize {
        6 + CRC_SIZE
    }

    fn frame_mut(&mut self, _token: BusToken) -> &mut Msg {
        &mut self.msg
    }

    fn decode(&mut self, _token: BusToken) -> RackmonResult<()> {
        self.msg.validate()?;
        let value: u16 = self.msg.pop()?;
        let offset: u16 = self.msg.pop()?;
        check_head(&mut self.msg, self.addr, ModbusFunction::WriteSingleRegister)?;
        check_field("register offset", self.offset as u32, offset as u32)?;
        if let Some(expected) = self.value {
            check_field("register value", expected as u32, value as u32)?;
        }
        self.value = Some(value);
        Ok(())
    }
}

/// Write Multiple Registers request (0x10)
///
/// The payload is built by appending values; an odd byte payload is padded
/// with one zero byte and the register count follows from the final length.
///
/// ```rust
/// use rackmon::protocol::WriteMultipleRegistersReq;
///
/// let mut req = WriteMultipleRegistersReq::new(0x32, 0x64);
/// req.append(0x1122u16).append(0x33u8);
/// assert_eq!(req.register_count(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct WriteMultipleRegistersReq {
    addr: SlaveAddr,
    offset: u16,
    payload: Vec<u8>,
    msg: Msg,
}

impl WriteMultipleRegistersReq {
    pub fn new(addr: SlaveAddr, offset: u16) -> Self {
        Self {
            addr,
            offset,
            payload: Vec::new(),
            msg: Msg::new(),
        }
    }

    /// Build a request writing `values` starting at `offset`
    pub fn with_registers(addr: SlaveAddr, offset: u16, values: &[u16]) -> Self {
        let mut req = Self::new(addr, offset);
        for value in values {
            req.append(*value);
        }
        req
    }

    /// Append a value to the payload (big-endian)
    pub fn append<T: MsgField>(&mut self, value: T) -> &mut Self {
        let start = self.payload.len();
        self.payload.resize(start + T::SIZE, 0);
        value.write_be(&mut self.payload[start..]);
        self
    }

    /// Registers covered once the payload is padded to whole registers
    pub fn register_count(&self) -> u16 {
        ((self.payload.len() + 1) / 2) as u16
    }
}

impl Request for WriteMultipleRegistersReq {
    fn addr(&self) -> SlaveAddr {
        self.addr
    }

    fn msg(&self) -> &Msg {
        &self.msg
    }

    fn encode(&mut self, _token: BusToken) -> RackmonResult<()> {
        if self.payload.len() % 2 != 0 {
            self.payload.push(0);
        }
        let byte_count = u8::try_from(self.payload.len())
            .map_err(|_| RackmonError::overflow(self.payload.len(), u8::MAX as usize))?;
        self.msg.clear();
        self.msg.push(self.addr)?;
        self.msg.push(ModbusFunction::WriteMultipleRegisters.to_u8())?;
        self.msg.push(self.offset)?;
        self.msg.push(self.register_count())?;
        self.msg.push(byte_count)?;
        self.msg.push_slice(&self.payload)?;
        self.msg.finalize()
    }
}

/// Write Multiple Registers response
#[derive(Debug, Clone)]
pub struct WriteMultipleRegistersResp {
    addr: SlaveAddr,
    offset: u16,
    count: u16,
    msg: Msg,
}

impl WriteMultipleRegistersResp {
    pub fn new(addr: SlaveAddr, offset: u16, count: u16) -> Self {
        Self {
            addr,
            offset,
            count,
            msg: Msg::new(),
        }
    }
}

impl Response for WriteMultipleRegistersResp {
    fn expected_len(&self) -> usize {
        6 + CRC_SIZE
    }

    fn frame_mut(&mut self, _token: BusToken) -> &mut Msg {
        &mut self.msg
    }

    fn decode(&mut self, _token: BusToken) -> RackmonResult<()> {
        self.msg.validate()?;
        let count: u16 = self.msg.pop()?;
        let offset: u16 = self.msg.pop()?;
        check_head(&mut self.msg, self.addr, ModbusFunction::WriteMultipleRegisters)?;
        check_field("register offset", self.offset as u32, offset as u32)?;
        check_field("register count", self.count as u32, count as u32)
    }
}

/// One file record to read; `data` is sized to the record length up front
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileRecord {
    pub file_num: u16,
    pub record_num: u16,
    pub data: Vec<u16>,
}

impl FileRecord {
    pub fn new(file_num: u16, record_num: u16, len: usize) -> Self {
        Self {
            file_num,
            record_num,
            data: vec![0; len],
        }
    }
}

/// Read File Record request (0x14)
#[derive(Debug, Clone)]
pub struct ReadFileRecordReq {
    addr: SlaveAddr,
    records: Vec<(u16, u16, u16)>,
    msg: Msg,
}

impl ReadFileRecordReq {
    pub fn new(addr: SlaveAddr, records: &[FileRecord]) -> Self {
        Self {
            addr,
            records: records
                .iter()
                .map(|r| (r.file_num, r.record_num, r.data.len() as u16))
                .collect(),
            msg: Msg::new(),
        }
    }
}

impl Request for ReadFileRecordReq {
    fn addr(&self) -> SlaveAddr {
        self.addr
    }

    fn msg(&self) -> &Msg {
        &self.msg
    }

    fn encode(&mut self, _token: BusToken) -> RackmonResult<()> {
        let byte_count = u8::try_from(7 * self.records.len())
            .map_err(|_| RackmonError::overflow(7 * self.records.len(), u8::MAX as usize))?;
        self.msg.clear();
        self.msg.push(self.addr)?;
        self.msg.push(ModbusFunction::ReadFileRecord.to_u8())?;
        self.msg.push(byte_count)?;
        for &(file_num, record_num, len) in &self.records {
            self.msg.push(FILE_RECORD_REFERENCE_TYPE)?;
            self.msg.push(file_num)?;
            self.msg.push(record_num)?;
            self.msg.push(len)?;
        }
        self.msg.finalize()
    }
}

/// Read File Record response
#[derive(Debug, Clone)]
pub struct ReadFileRecordResp {
    addr: SlaveAddr,
    records: Vec<FileRecord>,
    msg: Msg,
}

impl ReadFileRecordResp {
    /// Expect data for `records`, whose `data` lengths describe each record
    pub fn new(addr: SlaveAddr, records: Vec<FileRecord>) -> Self {
        Self {
            addr,
            records,
            msg: Msg::new(),
        }
    }

    pub fn records(&self) -> &[FileRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<FileRecord> {
        self.records
    }

    fn data_len(&self) -> usize {
        self.records.iter().map(|r| 2 + 2 * r.data.len()).sum()
    }
}

impl Response for ReadFileRecordResp {
    fn expected_len(&self) -> usize {
        3 + self.data_len() + CRC_SIZE
    }

    fn frame_mut(&mut self, _token: BusToken) -> &mut Msg {
        &mut self.msg
    }

    fn decode(&mut self, _token: BusToken) -> RackmonResult<()> {
        self.msg.validate()?;
        let expected_data_len = self.data_len();
        for record in self.records.iter_mut().rev() {
            for word in record.data.iter_mut().rev() {
                *word = self.msg.pop()?;
            }
            let reference: u8 = self.msg.pop()?;
            let sub_len: u8 = self.msg.pop()?;
            check_field("reference type", FILE_RECORD_REFERENCE_TYPE as u32, reference as u32)?;
            check_field("record length", 1 + 2 * record.data.len() as u32, sub_len as u32)?;
        }
        let data_len: u8 = self.msg.pop()?;
        check_head(&mut self.msg, self.addr, ModbusFunction::ReadFileRecord)?;
        check_field("data length", expected_data_len as u32, data_len as u32)
    }
}

/// Pass-through request: caller-provided frame without CRC
#[derive(Debug, Clone)]
pub struct RawRequest {
    payload: Vec<u8>,
    msg: Msg,
}

impl RawRequest {
    pub fn new(payload: Vec<u8>) -> RackmonResult<Self> {
        if payload.is_empty() {
            return Err(RackmonError::invalid_argument("Raw command is empty"));
        }
        Ok(Self {
            payload,
            msg: Msg::new(),
        })
    }
}

impl Request for RawRequest {
    fn addr(&self) -> SlaveAddr {
        self.payload[0]
    }

    fn msg(&self) -> &Msg {
        &self.msg
    }

    fn encode(&mut self, _token: BusToken) -> RackmonResult<()> {
        self.msg.clear();
        self.msg.push_slice(&self.payload)?;
        self.msg.finalize()
    }
}

/// Pass-through response of a known length (CRC included)
#[derive(Debug, Clone)]
pub struct RawResponse {
    expected_len: usize,
    msg: Msg,
}

impl RawResponse {
    pub fn new(expected_len: usize) -> RackmonResult<Self> {
        if expected_len <= CRC_SIZE {
            return Err(RackmonError::invalid_argument(format!(
                "Expected response length {} leaves no room for a frame",
                expected_len
            )));
        }
        Ok(Self {
            expected_len,
            msg: Msg::new(),
        })
    }

    /// Response bytes with the CRC stripped (valid after decode)
    pub fn data(&self) -> &[u8] {
        self.msg.as_bytes()
    }
}

impl Response for RawResponse {
    fn expected_len(&self) -> usize {
        self.expected_len
    }

    fn frame_mut(&mut self, _token: BusToken) -> &mut Msg {
        &mut self.msg
    }

    fn decode(&mut self, _token: BusToken) -> RackmonResult<()> {
        self.msg.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::test_support::{encode, decode_from_hex, encoded_hex};

    #[test]
    fn test_function_conversion() {
        assert_eq!(ModbusFunction::from_u8(0x03).unwrap(), ModbusFunction::ReadHoldingRegisters);
        assert_eq!(ModbusFunction::ReadFileRecord.to_u8(), 0x14);
        assert!(ModbusFunction::from_u8(0x01).is_err());
    }

    #[test]
    fn test_read_holding_registers() {
        let mut req = ReadHoldingRegistersReq::new(0x32, 0x64, 2);
        encode(&mut req);
        assert_eq!(req.msg().as_bytes()[..6], [0x32, 0x03, 0x00, 0x64, 0x00, 0x02]);
        assert_eq!(req.msg().len(), 8);

        let mut resp = ReadHoldingRegistersResp::new(0x32, 2);
        assert_eq!(resp.expected_len(), 9);
        decode_from_hex(&mut resp, "32030411223344").unwrap();
        assert_eq!(resp.registers(), &[0x1122, 0x3344]);
    }

    #[test]
    fn test_read_holding_registers_bad_fields() {
        let mut resp = ReadHoldingRegistersResp::new(0x32, 2);
        let err = decode_from_hex(&mut resp, "32040411223344").unwrap_err();
        assert_eq!(err, RackmonError::bad_response("function", 3, 4));

        let mut resp = ReadHoldingRegistersResp::new(0x32, 2);
        let err = decode_from_hex(&mut resp, "32030611223344").unwrap_err();
        assert_eq!(err, RackmonError::bad_response("byte count", 4, 6));

        let mut resp = ReadHoldingRegistersResp::new(0x32, 2);
        let err = decode_from_hex(&mut resp, "33030411223344").unwrap_err();
        assert_eq!(err, RackmonError::bad_response("address", 0x32, 0x33));
    }

    #[test]
    fn test_write_single_register() {
        let mut req = WriteSingleRegisterReq::new(0x32, 0x64, 0x1122);
        assert_eq!(encoded_hex(&mut req), "320600641122");

        let mut resp = WriteSingleRegisterResp::new(0x32, 0x64, 0x1122);
        decode_from_hex(&mut resp, "320600641122").unwrap();

        let mut resp = WriteSingleRegisterResp::new(0x32, 0x64, 0x1122);
        let err = decode_from_hex(&mut resp, "320600651122").unwrap_err();
        assert_eq!(err, RackmonError::bad_response("register offset", 0x64, 0x65));

        let mut resp = WriteSingleRegisterResp::any_value(0x32, 0x64);
        decode_from_hex(&mut resp, "32060064BEEF").unwrap();
        assert_eq!(resp.value(), Some(0xBEEF));
    }

    #[test]
    fn test_write_multiple_registers() {
        let mut req = WriteMultipleRegistersReq::with_registers(0x32, 0x64, &[0x1122, 0x3344]);
        assert_eq!(encoded_hex(&mut req), "3210006400020411223344");

        let mut resp = WriteMultipleRegistersResp::new(0x32, 0x64, 2);
        decode_from_hex(&mut resp, "321000640002").unwrap();

        let mut resp = WriteMultipleRegistersResp::new(0x32, 0x64, 2);
        let err = decode_from_hex(&mut resp, "321000640003").unwrap_err();
        assert_eq!(err, RackmonError::bad_response("register count", 2, 3));
    }

    #[test]
    fn test_write_multiple_registers_odd_payload_is_padded() {
        let mut req = WriteMultipleRegistersReq::new(0x32, 0x0A);
        req.append(0x30u8).append(0x31u8).append(0x32u8);
        assert_eq!(encoded_hex(&mut req), "3210000A00020430313200");
    }

    #[test]
    fn test_read_file_record() {
        // Modbus Application Protocol V1.1b example, with an address prefix
        let records = vec![FileRecord::new(4, 1, 2), FileRecord::new(3, 9, 2)];
        let mut req = ReadFileRecordReq::new(0x32, &records);
        assert_eq!(encoded_hex(&mut req), "32140E0600040001000206000300090002");

        let mut resp = ReadFileRecordResp::new(0x32, records);
        decode_from_hex(&mut resp, "32140C05060DFE0020050633CD0040").unwrap();
        assert_eq!(resp.records()[0].data, vec![0x0DFE, 0x0020]);
        assert_eq!(resp.records()[1].data, vec![0x33CD, 0x0040]);
    }

    #[test]
    fn test_raw_roundtrip() {
        let mut req = RawRequest::new(vec![0xA1, 0x03, 0x00, 0x68, 0x00, 0x01]).unwrap();
        assert_eq!(req.addr(), 0xA1);
        assert_eq!(encoded_hex(&mut req), "A10300680001");

        let mut resp = RawResponse::new(7).unwrap();
        decode_from_hex(&mut resp, "A1030212AB").unwrap();
        assert_eq!(resp.data(), &[0xA1, 0x03, 0x02, 0x12, 0xAB]);

        assert!(RawRequest::new(Vec::new()).is_err());
        assert!(RawResponse::new(2).is_err());
    }

    #[test]
    fn test_decode_rejects_corrupt_crc() {
        let mut resp = ReadHoldingRegistersResp::new(0x32, 2);
        let frame = resp.frame_mut(crate::modbus::test_support::token());
        *frame = Msg::from_hex("3203041122334400FF").unwrap();
        let err = resp.decode(crate::modbus::test_support::token()).unwrap_err();
        assert!(err.is_crc());
    }
}
