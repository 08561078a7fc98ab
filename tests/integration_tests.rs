//! Integration Tests for Rackmon
//!
//! These tests drive the real bus, device and orchestrator layers over a
//! simulated RS-485 line.

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rackmon::msg::crc16;
use rackmon::{
    CallbackLogger, InterfaceConfig, Modbus, ModbusBus, ModbusDeviceMode, Msg, RackmonError, RackmonResult,
    RackmonTiming, RawRequest, RawResponse, RegisterMapDatabase, UartDevice, Value, MAX_MODBUS_FRAME_SIZE,
};

/// Simulated bus: only the listed addresses answer register reads
struct RackUart {
    present: Vec<u8>,
    pending: Vec<u8>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RackUart {
    fn new(present: &[u8]) -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                present: present.to_vec(),
                pending: Vec::new(),
                written: written.clone(),
            },
            written,
        )
    }

    /// Holding register `n` reads back as `n`
    fn reply_to(&self, frame: &[u8]) -> Vec<u8> {
        let addr = frame[0];
        if !self.present.contains(&addr) || frame[1] != 0x03 {
            return Vec::new();
        }
        let offset = u16::from_be_bytes([frame[2], frame[3]]);
        let count = u16::from_be_bytes([frame[4], frame[5]]);
        let mut reply = vec![addr, 0x03, (2 * count) as u8];
        for i in 0..count {
            reply.extend_from_slice(&(offset + i).to_be_bytes());
        }
        let crc = crc16(&reply);
        reply.extend_from_slice(&crc.to_le_bytes());
        reply
    }
}

#[async_trait]
impl UartDevice for RackUart {
    async fn open(&mut self) -> RackmonResult<()> {
        Ok(())
    }

    async fn close(&mut self) -> RackmonResult<()> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        true
    }

    async fn set_baudrate(&mut self, _baudrate: u32) -> RackmonResult<()> {
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> RackmonResult<()> {
        self.written.lock().unwrap().push(data.to_vec());
        self.pending = self.reply_to(data);
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], deadline: Duration) -> RackmonResult<()> {
        if self.pending.len() < buf.len() {
            return Err(RackmonError::timeout("read response", deadline.as_millis() as u64));
        }
        buf.copy_from_slice(&self.pending[..buf.len()]);
        Ok(())
    }
}

const BBU_MAP: &str = r#"{
    "name": "orv2_bbu",
    "address_range": [160, 170],
    "probe_register": 104,
    "default_baudrate": 19200,
    "preferred_baudrate": 19200,
    "registers": [
        { "begin": 0, "length": 2, "name": "SERIAL", "keep": 2 },
        { "begin": 16, "length": 1, "name": "VOLTAGE", "format": "decimal" }
    ]
}"#;

fn rack(present: &[u8]) -> (rackmon::Rackmon, Arc<Mutex<Vec<Vec<u8>>>>) {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("orv2_bbu.json"), BBU_MAP).unwrap();
    let mut database = RegisterMapDatabase::new();
    database.load(dir.path()).unwrap();

    let (uart, written) = RackUart::new(present);
    let bus = Modbus::with_device(InterfaceConfig::new("/dev/ttyMOCK"), Box::new(uart), CallbackLogger::disabled());
    let timing = RackmonTiming {
        probe_timeout_ms: 5,
        ..RackmonTiming::default()
    };
    let interfaces: Vec<Arc<dyn ModbusBus>> = vec![Arc::new(bus)];
    (
        rackmon::Rackmon::with_interfaces(interfaces, database, timing, CallbackLogger::disabled()),
        written,
    )
}

#[test]
fn test_crc_known_vector() {
    // 01 03 00 00 00 0A C5 CD
    assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]).to_le_bytes(), [0xC5, 0xCD]);
}

#[test]
fn test_msg_field_codec() {
    let mut msg = Msg::from_hex("a10300680001").unwrap();
    assert_eq!(msg.addr(), 0xA1);
    assert_eq!(msg.pop::<u16>().unwrap(), 0x0001);
    assert_eq!(msg.pop::<u16>().unwrap(), 0x0068);
    assert_eq!(msg.len(), 2);

    let mut msg = Msg::new();
    msg.push(0x32u8).unwrap();
    msg.push(0x1234u16).unwrap();
    assert_eq!(msg.to_hex(), "321234");
    assert!(Msg::from_bytes(&[0u8; MAX_MODBUS_FRAME_SIZE + 1]).is_err());
}

#[tokio::test]
async fn test_probe_frame_on_the_wire() {
    let (rackmon, written) = rack(&[161]);
    assert!(rackmon.probe(161).await.unwrap());

    let frames = written.lock().unwrap().clone();
    let mut expected = vec![0xA1, 0x03, 0x00, 0x68, 0x00, 0x01];
    let crc = crc16(&expected);
    expected.extend_from_slice(&crc.to_le_bytes());
    assert_eq!(frames, vec![expected]);
}

#[tokio::test]
async fn test_discovery_and_raw_commands() {
    let (rackmon, written) = rack(&[161]);
    rackmon.scan().await;

    assert_eq!(rackmon.active_addrs().await, vec![161]);
    assert!(rackmon.dormant_addrs().await.is_empty());
    // every mapped address was probed once
    assert_eq!(written.lock().unwrap().len(), 11);

    let mut req = RawRequest::new(vec![100, 0x03, 0x00, 0x00, 0x00, 0x01]).unwrap();
    let mut resp = RawResponse::new(7).unwrap();
    let err = rackmon.raw_cmd(&mut req, &mut resp, Duration::ZERO).await.unwrap_err();
    assert_eq!(err, RackmonError::unknown_device(100));

    let mut req = RawRequest::new(vec![161, 0x03, 0x00, 0x68, 0x00, 0x01]).unwrap();
    let mut resp = RawResponse::new(7).unwrap();
    rackmon.raw_cmd(&mut req, &mut resp, Duration::ZERO).await.unwrap();
    assert_eq!(resp.data(), &[161, 0x03, 0x02, 0x00, 0x68]);
}

#[tokio::test]
async fn test_monitor_history() {
    let (rackmon, _) = rack(&[161, 165]);
    rackmon.scan_all().await;
    assert_eq!(rackmon.active_addrs().await, vec![161, 165]);

    rackmon.monitor().await;
    rackmon.monitor().await;
    rackmon.monitor().await;

    let data = rackmon.get_monitor_data().await;
    assert_eq!(data.len(), 2);
    let serial = &data[0].ranges[0];
    assert_eq!(serial.name, "SERIAL");
    assert_eq!(serial.readings.len(), 2);
    assert_eq!(serial.readings[0].value, Value::Hex("00000001".into()));
    assert_eq!(data[0].ranges[1].readings[0].value, Value::Integer(16));

    let status = rackmon.get_monitor_status().await;
    assert!(status.iter().all(|s| s.mode() == ModbusDeviceMode::Active));
    assert!(status.iter().all(|s| s.num_consecutive_failures == 0));

    let json = serde_json::to_value(&data[1]).unwrap();
    assert_eq!(json["addr"], 165);
    assert_eq!(json["type"], "orv2_bbu");
    assert_eq!(json["ranges"][1]["readings"][0]["type"], "integer");
}

#[tokio::test]
async fn test_start_and_stop_over_the_bus() {
    let (rackmon, _) = rack(&[161]);
    let rackmon = Arc::new(rackmon);
    rackmon.start().await.unwrap();

    for _ in 0..200 {
        if !rackmon.active_addrs().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(rackmon.active_addrs().await, vec![161]);

    rackmon.stop().await.unwrap();
    assert!(!rackmon.is_running());
}
