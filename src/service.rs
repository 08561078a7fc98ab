/// Rackmon socket service
///
/// Serves the orchestrator over UNIX domain sockets with two wire protocols:
///
/// - **JSON**: each message is a sequence of `u16` little-endian length
///   prefixed chunks ended by a zero-length chunk; requests are tagged by
///   `"type"` and every response carries a `"status"`
/// - **Legacy**: one `u16` block length, then a packed 10-byte header
///   `{type, length, expected_resp_length, custom_timeout_ms}` followed by
///   the raw Modbus request
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{RackmonError, RackmonResult};
use crate::logging::CallbackLogger;
use crate::protocol::{RawRequest, RawResponse};
use crate::rackmon::Rackmon;

/// Largest JSON message accepted
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Largest legacy command block accepted
pub const MAX_LEGACY_BLOCK_SIZE: usize = 1024;

/// Packed legacy header size
const LEGACY_HEADER_SIZE: usize = 10;

/// Time a client gets to deliver its request
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Read one chunked message; `None` on a clean end of stream
pub async fn read_chunked<R: AsyncRead + Unpin>(reader: &mut R) -> RackmonResult<Option<Vec<u8>>> {
    let mut message = BytesMut::new();
    let mut first = true;
    loop {
        let mut header = [0u8; 2];
        if first {
            let n = reader.read(&mut header).await?;
            if n == 0 {
                return Ok(None);
            }
            if n == 1 {
                reader.read_exact(&mut header[1..]).await?;
            }
            first = false;
        } else {
            reader.read_exact(&mut header).await?;
        }

        let len = u16::from_le_bytes(header) as usize;
        if len == 0 {
            return Ok(Some(message.to_vec()));
        }
        if message.len() + len > MAX_MESSAGE_SIZE {
            return Err(RackmonError::overflow(message.len() + len, MAX_MESSAGE_SIZE));
        }
        let start = message.len();
        message.resize(start + len, 0);
        reader.read_exact(&mut message[start..]).await?;
    }
}

/// Frame `data` as chunks followed by the terminator
pub fn encode_chunked(data: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(data.len() + 2 * (data.len() / u16::MAX as usize) + 4);
    for chunk in data.chunks(u16::MAX as usize) {
        out.put_u16_le(chunk.len() as u16);
        out.put_slice(chunk);
    }
    out.put_u16_le(0);
    out
}

pub async fn write_chunked<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> RackmonResult<()> {
    writer.write_all(&encode_chunked(data)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed legacy command block
async fn read_legacy_block<R: AsyncRead + Unpin>(reader: &mut R) -> RackmonResult<Vec<u8>> {
    let len = reader.read_u16_le().await? as usize;
    if len > MAX_LEGACY_BLOCK_SIZE {
        return Err(RackmonError::overflow(len, MAX_LEGACY_BLOCK_SIZE));
    }
    let mut block = vec![0u8; len];
    reader.read_exact(&mut block).await?;
    Ok(block)
}

/// JSON protocol request
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceRequest {
    /// Raw Modbus passthrough; `cmd` excludes the CRC, `response_length`
    /// includes it
    Raw {
        cmd: Vec<u8>,
        response_length: usize,
        #[serde(default)]
        timeout: u64,
    },
    Status,
    Data,
    FormattedData,
    RawData,
    Pause,
    Resume,
    Rescan,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ServiceResponse {
    pub fn success(data: Option<serde_json::Value>) -> Self {
        Self { status: "SUCCESS", data }
    }

    pub fn failure(err: &RackmonError) -> Self {
        Self {
            status: err.status(),
            data: None,
        }
    }
}

/// Legacy protocol command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyCommand {
    RawModbus {
        expected_len: u16,
        timeout_ms: u32,
        data: Vec<u8>,
    },
    DumpData,
    Pause,
    Resume,
    DumpStatus,
    ForceScan,
}

impl LegacyCommand {
    /// Parse a command block (header plus payload)
    pub fn parse(block: &[u8]) -> RackmonResult<Self> {
        let mut cursor = Cursor::new(block);
        let kind = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)
            .map_err(|_| RackmonError::underflow(2, block.len()))?;
        match kind {
            1 => {
                if block.len() < LEGACY_HEADER_SIZE {
                    return Err(RackmonError::underflow(LEGACY_HEADER_SIZE, block.len()));
                }
                let length = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)? as usize;
                let expected_len = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)?;
                let timeout_ms = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)?;
                let payload = &block[LEGACY_HEADER_SIZE..];
                if payload.len() < length {
                    return Err(RackmonError::underflow(length, payload.len()));
                }
                Ok(Self::RawModbus {
                    expected_len,
                    timeout_ms,
                    data: payload[..length].to_vec(),
                })
            }
            3 => Ok(Self::DumpData),
            4 => Ok(Self::Pause),
            5 => Ok(Self::Resume),
            6 => Ok(Self::DumpStatus),
            7 => Ok(Self::ForceScan),
            other => Err(RackmonError::invalid_argument(format!("Unsupported legacy command type {}", other))),
        }
    }
}

/// Which protocol a listener speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketProtocol {
    Json,
    Legacy,
}

/// Executes socket requests against a shared [`Rackmon`]
#[derive(Clone)]
pub struct RequestHandler {
    rackmon: Arc<Rackmon>,
}

impl RequestHandler {
    pub fn new(rackmon: Arc<Rackmon>) -> Self {
        Self { rackmon }
    }

    async fn pause(&self) -> RackmonResult<bool> {
        if self.rackmon.is_running() {
            self.rackmon.stop().await?;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    async fn resume(&self) -> RackmonResult<bool> {
        if self.rackmon.is_running() {
            Ok(true)
        } else {
            self.rackmon.start().await?;
            Ok(false)
        }
    }

    async fn raw(&self, cmd: Vec<u8>, response_length: usize, timeout_ms: u64) -> RackmonResult<Vec<u8>> {
        let mut req = RawRequest::new(cmd)?;
        let mut resp = RawResponse::new(response_length)?;
        self.rackmon
            .raw_cmd(&mut req, &mut resp, Duration::from_millis(timeout_ms))
            .await?;
        Ok(resp.data().to_vec())
    }

    async fn dispatch(&self, request: ServiceRequest) -> RackmonResult<Option<serde_json::Value>> {
        let data = match request {
            ServiceRequest::Raw {
                cmd,
                response_length,
                timeout,
            } => serde_json::to_value(self.raw(cmd, response_length, timeout).await?)?,
            ServiceRequest::Status => serde_json::to_value(self.rackmon.get_monitor_status().await)?,
            ServiceRequest::Data => serde_json::to_value(self.rackmon.get_monitor_data().await)?,
            ServiceRequest::FormattedData => serde_json::to_value(self.rackmon.get_monitor_data_formatted().await)?,
            ServiceRequest::RawData => serde_json::to_value(self.rackmon.get_monitor_data_raw().await)?,
            ServiceRequest::Pause => {
                self.pause().await?;
                return Ok(None);
            }
            ServiceRequest::Resume => {
                self.resume().await?;
                return Ok(None);
            }
            ServiceRequest::Rescan => {
                self.rackmon.force_scan();
                return Ok(None);
            }
        };
        Ok(Some(data))
    }

    /// Run one JSON request
    pub async fn execute(&self, request: ServiceRequest) -> ServiceResponse {
        match self.dispatch(request).await {
            Ok(data) => ServiceResponse::success(data),
            Err(e) => ServiceResponse::failure(&e),
        }
    }

    /// Parse and run one JSON message
    pub async fn execute_message(&self, message: &[u8]) -> ServiceResponse {
        match serde_json::from_slice::<ServiceRequest>(message) {
            Ok(request) => self.execute(request).await,
            Err(e) => ServiceResponse::failure(&RackmonError::invalid_argument(format!("Invalid request: {}", e))),
        }
    }

    /// Serve JSON requests until the peer closes the stream
    pub async fn handle_json<S: AsyncRead + AsyncWrite + Unpin>(&self, stream: &mut S) -> RackmonResult<()> {
        loop {
            let message = match timeout(CLIENT_READ_TIMEOUT, read_chunked(stream)).await? {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(()),
                Err(e) => {
                    // framing errors still get an answer before the close
                    let reply = serde_json::to_vec(&ServiceResponse::failure(&e))?;
                    write_chunked(stream, &reply).await?;
                    return Err(e);
                }
            };
            let response = self.execute_message(&message).await;
            debug!("JSON request answered with {}", response.status);
            write_chunked(stream, &serde_json::to_vec(&response)?).await?;
        }
    }

    /// Run one legacy command and build its reply
    pub async fn execute_legacy(&self, command: LegacyCommand) -> RackmonResult<Vec<u8>> {
        let mut out = BytesMut::new();
        match command {
            LegacyCommand::RawModbus {
                expected_len,
                timeout_ms,
                data,
            } => match self.raw(data, expected_len as usize, timeout_ms as u64).await {
                Ok(resp) => {
                    out.put_u16_le(resp.len() as u16);
                    out.put_slice(&resp);
                }
                Err(e) => {
                    out.put_u16_le(0);
                    out.put_u16_le(e.legacy_code());
                }
            },
            LegacyCommand::DumpData => out.put_slice(&serde_json::to_vec(&self.rackmon.get_monitor_data().await)?),
            LegacyCommand::DumpStatus => out.put_slice(&serde_json::to_vec(&self.rackmon.get_monitor_status().await)?),
            LegacyCommand::Pause => out.put_u8(self.pause().await? as u8),
            LegacyCommand::Resume => out.put_u8(self.resume().await? as u8),
            LegacyCommand::ForceScan => {
                self.rackmon.force_scan();
                out.put_slice(b"Triggering PSU scan...\n");
            }
        }
        Ok(out.to_vec())
    }

    /// Serve one legacy command block
    pub async fn handle_legacy<S: AsyncRead + AsyncWrite + Unpin>(&self, stream: &mut S) -> RackmonResult<()> {
        let block = timeout(CLIENT_READ_TIMEOUT, read_legacy_block(stream)).await??;

        let command = LegacyCommand::parse(&block)?;
        debug!("Legacy command {:?}", command);
        let reply = self.execute_legacy(command).await?;
        stream.write_all(&reply).await?;
        stream.flush().await?;
        Ok(())
    }
}

/// Socket paths the service listens on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub socket_path: PathBuf,
    pub legacy_socket_path: Option<PathBuf>,
}

/// UNIX socket server in front of a [`Rackmon`]
pub struct RackmonService {
    handler: RequestHandler,
    logger: CallbackLogger,
    shutdown_tx: Option<broadcast::Sender<()>>,
    listeners: Vec<JoinHandle<()>>,
}

impl RackmonService {
    pub fn new(rackmon: Arc<Rackmon>, logger: CallbackLogger) -> Self {
        Self {
            handler: RequestHandler::new(rackmon),
            logger,
            shutdown_tx: None,
            listeners: Vec::new(),
        }
    }

    pub fn handler(&self) -> &RequestHandler {
        &self.handler
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    async fn bind(path: &Path) -> RackmonResult<UnixListener> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        UnixListener::bind(path).map_err(|e| RackmonError::io(format!("Cannot bind {}: {}", path.display(), e)))
    }

    /// Bind the sockets and start accepting clients
    pub async fn start(&mut self, config: &ServiceConfig) -> RackmonResult<()> {
        if self.is_running() {
            return Err(RackmonError::invalid_argument("Service is already running"));
        }
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut endpoints = vec![(config.socket_path.clone(), SocketProtocol::Json)];
        if let Some(legacy) = &config.legacy_socket_path {
            endpoints.push((legacy.clone(), SocketProtocol::Legacy));
        }
        for (path, protocol) in endpoints {
            let listener = Self::bind(&path).await?;
            self.logger
                .info(&format!("🔌 Listening on {} ({:?})", path.display(), protocol));
            self.listeners.push(tokio::spawn(Self::accept_loop(
                listener,
                protocol,
                self.handler.clone(),
                shutdown_tx.subscribe(),
            )));
        }

        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    async fn accept_loop(
        listener: UnixListener,
        protocol: SocketProtocol,
        handler: RequestHandler,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Shutdown signal received for {:?} listener", protocol);
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let handler = handler.clone();
                            tokio::spawn(Self::handle_client(stream, protocol, handler));
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_client(mut stream: UnixStream, protocol: SocketProtocol, handler: RequestHandler) {
        debug!("📡 New {:?} client connected", protocol);
        let result = match protocol {
            SocketProtocol::Json => handler.handle_json(&mut stream).await,
            SocketProtocol::Legacy => handler.handle_legacy(&mut stream).await,
        };
        if let Err(e) = result {
            warn!("{:?} client error: {}", protocol, e);
        }
        let _ = stream.shutdown().await;
        debug!("🔌 {:?} client disconnected", protocol);
    }

    /// Stop accepting clients and wait for the listeners to exit
    pub async fn stop(&mut self) -> RackmonResult<()> {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return Ok(());
        };
        let _ = shutdown_tx.send(());
        for listener in self.listeners.drain(..) {
            listener
                .await
                .map_err(|e| RackmonError::internal(format!("Listener task failed: {}", e)))?;
        }
        info!("🛑 Socket service stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use tokio_test::io::Builder;

    use super::*;
    use crate::modbus::ModbusBus;
    use crate::rackmon::tests::{database, responder};
    use crate::rackmon::RackmonTiming;

    fn chunked(data: &[u8]) -> Vec<u8> {
        encode_chunked(data).to_vec()
    }

    async fn handler_with_bbu() -> RequestHandler {
        let bus: Arc<dyn ModbusBus> = Arc::new(responder(161, Arc::new(AtomicBool::new(true))));
        let timing = RackmonTiming {
            probe_timeout_ms: 5,
            ..RackmonTiming::default()
        };
        let rackmon = Rackmon::with_interfaces(vec![bus], database(), timing, CallbackLogger::disabled());
        rackmon.scan_all().await;
        RequestHandler::new(Arc::new(rackmon))
    }

    fn legacy_raw(data: &[u8], expected_len: u16) -> Vec<u8> {
        let mut block = BytesMut::new();
        block.put_u16_le((LEGACY_HEADER_SIZE + data.len()) as u16);
        block.put_u16_le(1);
        block.put_u16_le(data.len() as u16);
        block.put_u16_le(expected_len);
        block.put_u32_le(0);
        block.put_slice(data);
        block.to_vec()
    }

    #[tokio::test]
    async fn test_read_chunked() {
        let mut stream = Builder::new()
            .read(&[3, 0])
            .read(b"abc")
            .read(&[2, 0, b'd', b'e'])
            .read(&[0, 0])
            .build();
        assert_eq!(read_chunked(&mut stream).await.unwrap(), Some(b"abcde".to_vec()));
        assert_eq!(read_chunked(&mut stream).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_chunked_rejects_oversized() {
        // the first chunk fits, the second pushes past the limit
        let mut stream = Builder::new()
            .read(&[0xFF, 0xFF])
            .read(&vec![0u8; 0xFFFF])
            .read(&[0x02, 0x00])
            .build();
        let err = read_chunked(&mut stream).await.unwrap_err();
        assert!(matches!(err, RackmonError::Overflow { .. }));
    }

    #[test]
    fn test_encode_chunked() {
        assert_eq!(chunked(b"abc"), vec![3, 0, b'a', b'b', b'c', 0, 0]);
        assert_eq!(chunked(b""), vec![0, 0]);
    }

    #[test]
    fn test_parse_requests() {
        let req: ServiceRequest =
            serde_json::from_str(r#"{"type": "raw", "cmd": [161, 3, 0, 0, 0, 1], "response_length": 7}"#).unwrap();
        assert_eq!(
            req,
            ServiceRequest::Raw {
                cmd: vec![161, 3, 0, 0, 0, 1],
                response_length: 7,
                timeout: 0
            }
        );
        let req: ServiceRequest = serde_json::from_str(r#"{"type": "formatted_data"}"#).unwrap();
        assert_eq!(req, ServiceRequest::FormattedData);
        assert!(serde_json::from_str::<ServiceRequest>(r#"{"type": "reboot"}"#).is_err());
    }

    #[test]
    fn test_parse_legacy() {
        let block = &legacy_raw(&[161, 3, 0, 0, 0, 1], 7)[2..];
        assert_eq!(
            LegacyCommand::parse(block).unwrap(),
            LegacyCommand::RawModbus {
                expected_len: 7,
                timeout_ms: 0,
                data: vec![161, 3, 0, 0, 0, 1]
            }
        );
        assert_eq!(LegacyCommand::parse(&[7, 0]).unwrap(), LegacyCommand::ForceScan);
        assert!(LegacyCommand::parse(&[1, 0, 6, 0]).is_err());
        assert!(LegacyCommand::parse(&[2, 0]).is_err());
        assert!(LegacyCommand::parse(&[]).is_err());
    }

    #[tokio::test]
    async fn test_json_raw_command() {
        let handler = handler_with_bbu().await;

        let response = handler
            .execute(ServiceRequest::Raw {
                cmd: vec![161, 3, 0, 0, 0, 1],
                response_length: 7,
                timeout: 0,
            })
            .await;
        assert_eq!(response, ServiceResponse::success(Some(serde_json::json!([161, 3, 2, 0, 0]))));

        let response = handler
            .execute(ServiceRequest::Raw {
                cmd: vec![100, 3, 0, 0, 0, 1],
                response_length: 7,
                timeout: 0,
            })
            .await;
        assert_eq!(response.status, "USER_ERROR");
        assert!(response.data.is_none());
    }

    #[tokio::test]
    async fn test_json_stream() {
        let handler = handler_with_bbu().await;
        let request = br#"{"type": "rescan"}"#;
        let mut stream = Builder::new()
            .read(&chunked(request))
            .write(&chunked(br#"{"status":"SUCCESS"}"#))
            .read(&chunked(b"not json"))
            .write(&chunked(br#"{"status":"USER_ERROR"}"#))
            .build();
        handler.handle_json(&mut stream).await.unwrap();
    }

    #[tokio::test]
    async fn test_json_status() {
        let handler = handler_with_bbu().await;
        let response = handler.execute(ServiceRequest::Status).await;
        let data = response.data.unwrap();
        assert_eq!(data[0]["addr"], 161);
        assert_eq!(data[0]["mode"], "active");
    }

    #[tokio::test]
    async fn test_legacy_raw() {
        let handler = handler_with_bbu().await;
        let mut stream = Builder::new()
            .read(&legacy_raw(&[161, 3, 0, 0, 0, 1], 7))
            .write(&[5, 0, 161, 3, 2, 0, 0])
            .build();
        handler.handle_legacy(&mut stream).await.unwrap();

        let mut stream = Builder::new()
            .read(&legacy_raw(&[100, 3, 0, 0, 0, 1], 7))
            .write(&[0, 0, 3, 0])
            .build();
        handler.handle_legacy(&mut stream).await.unwrap();
    }

    #[tokio::test]
    async fn test_legacy_pause_resume() {
        let handler = handler_with_bbu().await;
        // not running yet, so it reports already paused
        assert_eq!(handler.execute_legacy(LegacyCommand::Pause).await.unwrap(), vec![1]);
        assert_eq!(handler.execute_legacy(LegacyCommand::Resume).await.unwrap(), vec![0]);
        assert!(handler.rackmon.is_running());
        assert_eq!(handler.execute_legacy(LegacyCommand::Resume).await.unwrap(), vec![1]);
        assert_eq!(handler.execute_legacy(LegacyCommand::Pause).await.unwrap(), vec![0]);
        assert!(!handler.rackmon.is_running());
    }

    #[tokio::test]
    async fn test_service_over_socket() {
        crate::utils::logging::init_test_logger();
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig {
            socket_path: dir.path().join("rackmond.sock"),
            legacy_socket_path: Some(dir.path().join("rackmond_legacy.sock")),
        };
        let mut service = RackmonService::new(handler_with_bbu().await.rackmon, CallbackLogger::disabled());
        service.start(&config).await.unwrap();
        assert!(service.start(&config).await.is_err());

        let mut client = UnixStream::connect(&config.socket_path).await.unwrap();
        write_chunked(&mut client, br#"{"type": "data"}"#).await.unwrap();
        let reply = read_chunked(&mut client).await.unwrap().unwrap();
        let reply: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(reply["status"], "SUCCESS");
        assert_eq!(reply["data"][0]["type"], "orv2_bbu");
        drop(client);

        let mut legacy = UnixStream::connect(config.legacy_socket_path.as_ref().unwrap()).await.unwrap();
        legacy.write_all(&[2, 0, 7, 0]).await.unwrap();
        let mut reply = Vec::new();
        legacy.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"Triggering PSU scan...\n");

        service.stop().await.unwrap();
        assert!(!service.is_running());
    }
}
