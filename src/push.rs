//! Chunked file uploads from a client connection into a device push.
//!
//! Each client connection owns one [`FilePushHandler`]. The client drives
//! it with NEW, START, APPEND (repeated), then FINISH or CANCEL, and waits
//! for a NO_ERROR acknowledgment after every APPEND before sending the
//! next chunk.

use std::collections::HashSet;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

use crate::channel::{Channel, CLOSE_FAILED, CLOSE_OK};
use crate::config::BridgeConfig;
use crate::protocol::AdbError;
use crate::transport::{PushTransfer, Transport};

// Response status codes
pub const NEW_PUSH_ID: i8 = 1;
pub const NO_ERROR: i8 = 0;
pub const ERROR_INVALID_NAME: i8 = -1;
pub const ERROR_INVALID_STATE: i8 = -8;
pub const ERROR_UNKNOWN_ID: i8 = -9;
pub const ERROR_NO_FREE_ID: i8 = -10;
pub const ERROR_INCORRECT_SIZE: i8 = -11;
pub const ERROR_OTHER: i8 = -12;

const PUSH_FILE_MODE: u32 = 0o644;

/// Request state codes on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PushState {
    Initial = 0,
    New = 1,
    Start = 2,
    Append = 3,
    Finish = 4,
    Cancel = 5,
}

impl PushState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PushState::New),
            2 => Some(PushState::Start),
            3 => Some(PushState::Append),
            4 => Some(PushState::Finish),
            5 => Some(PushState::Cancel),
            _ => None,
        }
    }
}

/// Session ids travel as 16 bits on the wire
pub fn wire_id(id: u32) -> u16 {
    id as u16
}

/// 3-byte response: big-endian id, then status
pub fn response(id: u16, status: i8) -> Bytes {
    let mut bytes = BytesMut::with_capacity(3);
    bytes.put_u16(id);
    bytes.put_i8(status);
    bytes.freeze()
}

/// Parsed client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushRequest {
    New,
    Start { id: u16, file_name: String, file_size: u32 },
    /// `None` when the frame carried no usable chunk
    Append { id: u16, chunk: Option<Bytes> },
    Finish { id: u16 },
    Cancel { id: u16 },
}

impl PushRequest {
    /// Layout: `state:u8 [id:u16] [START: size:u32 name_len:u16 name] [APPEND: len:u32 chunk]`
    pub fn parse(frame: &[u8]) -> Result<Self, AdbError> {
        let mut buf = frame;
        if !buf.has_remaining() {
            return Err(violation(ERROR_OTHER, "empty push request"));
        }
        let code = buf.get_u8();
        let state = PushState::from_u8(code)
            .ok_or_else(|| violation(ERROR_INVALID_STATE, &format!("unknown push state {}", code)))?;
        if state == PushState::New {
            return Ok(PushRequest::New);
        }

        if buf.remaining() < 2 {
            return Err(violation(ERROR_OTHER, "push request without id"));
        }
        let id = buf.get_u16();

        Ok(match state {
            PushState::Start => {
                if buf.remaining() < 6 {
                    return Err(violation(ERROR_OTHER, "START request without size or name length"));
                }
                let file_size = buf.get_u32();
                let name_len = buf.get_u16() as usize;
                if name_len > buf.remaining() {
                    return Err(violation(
                        ERROR_INVALID_NAME,
                        &format!("name length {} exceeds the {} bytes left", name_len, buf.remaining()),
                    ));
                }
                let file_name = std::str::from_utf8(&buf[..name_len])
                    .map_err(|_| violation(ERROR_INVALID_NAME, "file name is not valid UTF-8"))?
                    .to_string();
                PushRequest::Start {
                    id,
                    file_name,
                    file_size,
                }
            }
            PushState::Append => {
                let chunk = if buf.remaining() >= 4 {
                    let len = buf.get_u32() as usize;
                    (len > 0 && len <= buf.remaining()).then(|| Bytes::copy_from_slice(&buf[..len]))
                } else {
                    None
                };
                PushRequest::Append { id, chunk }
            }
            PushState::Finish => PushRequest::Finish { id },
            PushState::Cancel => PushRequest::Cancel { id },
            PushState::New | PushState::Initial => PushRequest::New,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut bytes = BytesMut::new();
        match self {
            PushRequest::New => bytes.put_u8(PushState::New as u8),
            PushRequest::Start { id, file_name, file_size } => {
                bytes.put_u8(PushState::Start as u8);
                bytes.put_u16(*id);
                bytes.put_u32(*file_size);
                bytes.put_u16(file_name.len() as u16);
                bytes.put_slice(file_name.as_bytes());
            }
            PushRequest::Append { id, chunk } => {
                bytes.put_u8(PushState::Append as u8);
                bytes.put_u16(*id);
                let chunk = chunk.as_deref().unwrap_or_default();
                bytes.put_u32(chunk.len() as u32);
                bytes.put_slice(chunk);
            }
            PushRequest::Finish { id } => {
                bytes.put_u8(PushState::Finish as u8);
                bytes.put_u16(*id);
            }
            PushRequest::Cancel { id } => {
                bytes.put_u8(PushState::Cancel as u8);
                bytes.put_u16(*id);
            }
        }
        bytes.freeze()
    }

    fn id(&self) -> Option<u16> {
        match self {
            PushRequest::New => None,
            PushRequest::Start { id, .. }
            | PushRequest::Append { id, .. }
            | PushRequest::Finish { id }
            | PushRequest::Cancel { id } => Some(*id),
        }
    }
}

fn violation(status: i8, message: &str) -> AdbError {
    AdbError::StateViolation {
        status,
        message: message.to_string(),
    }
}

/// Ids in `[1, u32::MAX]` whose low 16 bits are not all zero
const MAX_OPEN_SESSIONS: usize = u32::MAX as usize - 0xffff;

struct RegistryState {
    next_id: u32,
    open: HashSet<u32>,
}

/// Allocates push session ids in `[1, u32::MAX]`, wrapping to 1 and
/// skipping ids that are still open.
pub struct PushRegistry {
    state: Mutex<RegistryState>,
}

impl Default for PushRegistry {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl PushRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(next_id: u32) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                next_id: next_id.max(1),
                open: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn allocate(&self) -> Result<u32, AdbError> {
        let mut state = self.lock();
        if state.open.len() >= MAX_OPEN_SESSIONS {
            return Err(violation(ERROR_NO_FREE_ID, "no free push id"));
        }
        loop {
            let id = state.next_id;
            state.next_id = if id == u32::MAX { 1 } else { id + 1 };
            // Wire id 0 is reserved for replies sent before a session exists
            if wire_id(id) != 0 && state.open.insert(id) {
                return Ok(id);
            }
        }
    }

    pub fn release(&self, id: u32) {
        self.lock().open.remove(&id);
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().open.len()
    }
}

/// Reader half handed to the device push. Calls `on_demand` each time it
/// runs dry and has to wait for the client's next chunk.
pub struct ByteSource {
    chunks: mpsc::UnboundedReceiver<Bytes>,
    current: Bytes,
    on_demand: Box<dyn Fn() + Send>,
    demanded: bool,
    terminated: Arc<AtomicBool>,
}

/// Writer half kept by the push handler
pub struct ByteSink {
    chunks: Option<mpsc::UnboundedSender<Bytes>>,
    terminated: Arc<AtomicBool>,
}

pub fn byte_channel<F>(on_demand: F) -> (ByteSink, ByteSource)
where
    F: Fn() + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let terminated = Arc::new(AtomicBool::new(false));
    (
        ByteSink {
            chunks: Some(tx),
            terminated: Arc::clone(&terminated),
        },
        ByteSource {
            chunks: rx,
            current: Bytes::new(),
            on_demand: Box::new(on_demand),
            demanded: false,
            terminated,
        },
    )
}

impl ByteSink {
    pub fn push(&self, chunk: Bytes) -> Result<(), AdbError> {
        self.chunks
            .as_ref()
            .ok_or_else(|| AdbError::Transfer("input already ended".to_string()))?
            .send(chunk)
            .map_err(|_| AdbError::Transfer("device transfer is no longer reading".to_string()))
    }

    /// Signal end of input; the reader sees EOF after draining.
    pub fn end(&mut self) {
        self.chunks = None;
    }

    /// Abort; the reader fails instead of seeing EOF.
    pub fn terminate(&mut self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.chunks = None;
    }
}

impl AsyncRead for ByteSource {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.terminated.load(Ordering::SeqCst) {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "push input terminated",
                )));
            }
            if !this.current.is_empty() {
                let n = buf.remaining().min(this.current.len());
                buf.put_slice(&this.current.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match this.chunks.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    this.current = chunk;
                    this.demanded = false;
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => {
                    if !this.demanded {
                        this.demanded = true;
                        (this.on_demand)();
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

/// Metadata of the upload a connection is working on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushSession {
    pub id: u32,
    pub file_name: String,
    pub file_size: u32,
    pub state: PushState,
}

fn validate_file_name(name: &str) -> Result<(), AdbError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(violation(ERROR_INVALID_NAME, &format!("invalid file name {:?}", name)));
    }
    Ok(())
}

/// Push protocol state machine for one client connection
pub struct FilePushHandler {
    registry: Arc<PushRegistry>,
    transport: Arc<dyn Transport>,
    serial: String,
    config: Arc<BridgeConfig>,
    channel: Arc<dyn Channel>,
    session: Option<PushSession>,
    received: u64,
    sink: Option<ByteSink>,
    transfer: Option<PushTransfer>,
    released: bool,
}

impl FilePushHandler {
    pub fn new(
        registry: Arc<PushRegistry>,
        transport: Arc<dyn Transport>,
        serial: &str,
        config: Arc<BridgeConfig>,
        channel: Arc<dyn Channel>,
    ) -> Self {
        Self {
            registry,
            transport,
            serial: serial.to_string(),
            config,
            channel,
            session: None,
            received: 0,
            sink: None,
            transfer: None,
            released: false,
        }
    }

    pub fn session(&self) -> Option<&PushSession> {
        self.session.as_ref()
    }

    pub fn state(&self) -> PushState {
        self.session
            .as_ref()
            .map(|session| session.state)
            .unwrap_or(PushState::Initial)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    fn current_wire_id(&self) -> u16 {
        self.session.as_ref().map(|s| wire_id(s.id)).unwrap_or(0)
    }

    /// Decode and handle one client frame.
    pub async fn handle_frame(&mut self, frame: &[u8]) -> Result<(), AdbError> {
        match PushRequest::parse(frame) {
            Ok(request) => self.handle_request(request).await,
            Err(e) => self.fail(e),
        }
    }

    pub async fn handle_request(&mut self, request: PushRequest) -> Result<(), AdbError> {
        if self.released {
            return Err(violation(ERROR_INVALID_STATE, "push connection already released"));
        }

        let session_id = self.session.as_ref().map(|session| session.id);
        if let (Some(id), Some(session_id)) = (request.id(), session_id) {
            if id != wire_id(session_id) {
                let error = violation(
                    ERROR_UNKNOWN_ID,
                    &format!("unknown push id {} (session {})", id, session_id),
                );
                return self.fail(error);
            }
        }

        match (self.state(), request) {
            (_, PushRequest::Append { chunk: None, .. }) => {
                self.fail(violation(ERROR_INCORRECT_SIZE, "empty chunk"))
            }
            (PushState::Initial, PushRequest::New) => self.on_new(),
            (PushState::New, PushRequest::Start { file_name, file_size, .. }) => {
                self.on_start(file_name, file_size)
            }
            (PushState::Start, PushRequest::Append { chunk: Some(chunk), .. }) => {
                self.on_first_chunk(chunk).await
            }
            (PushState::Append, PushRequest::Append { chunk: Some(chunk), .. }) => {
                self.on_chunk(chunk)
            }
            (PushState::Append, PushRequest::Finish { .. }) => self.on_finish(),
            (PushState::New | PushState::Start | PushState::Append, PushRequest::Cancel { .. }) => {
                self.on_cancel()
            }
            (state, request) => self.fail(violation(
                ERROR_INVALID_STATE,
                &format!("{:?} is not allowed in state {:?}", request, state),
            )),
        }
    }

    fn on_new(&mut self) -> Result<(), AdbError> {
        let id = match self.registry.allocate() {
            Ok(id) => id,
            Err(e) => return self.fail(e),
        };
        log::debug!("[{}] Push session {} opened", self.serial, id);
        self.session = Some(PushSession {
            id,
            file_name: String::new(),
            file_size: 0,
            state: PushState::New,
        });
        self.reply(NEW_PUSH_ID);
        Ok(())
    }

    fn on_start(&mut self, file_name: String, file_size: u32) -> Result<(), AdbError> {
        if let Err(e) = validate_file_name(&file_name) {
            return self.fail(e);
        }
        if file_size == 0 {
            return self.fail(violation(ERROR_INCORRECT_SIZE, "file size must be non-zero"));
        }
        if let Some(session) = self.session.as_mut() {
            session.file_name = file_name;
            session.file_size = file_size;
            session.state = PushState::Start;
        }
        self.reply(NO_ERROR);
        Ok(())
    }

    async fn on_first_chunk(&mut self, chunk: Bytes) -> Result<(), AdbError> {
        let Some(session) = self.session.clone() else {
            return self.fail(violation(ERROR_INVALID_STATE, "no session"));
        };

        let channel = Arc::clone(&self.channel);
        let id = wire_id(session.id);
        let (sink, source) = byte_channel(move || channel.send(response(id, NO_ERROR)));

        let remote_path = self.config.push_path(&session.file_name);
        log::info!(
            "[{}] Push session {}: {} ({} bytes) -> {}",
            self.serial,
            session.id,
            session.file_name,
            session.file_size,
            remote_path
        );
        self.sink = Some(sink);
        let pushed = self
            .transport
            .push(&self.serial, Box::new(source), &remote_path, PUSH_FILE_MODE)
            .await;
        let transfer = match pushed {
            Ok(transfer) => transfer,
            Err(e) => return self.fail(violation(ERROR_OTHER, &e.to_string())),
        };
        self.transfer = Some(transfer);
        if let Some(session) = self.session.as_mut() {
            session.state = PushState::Append;
        }
        self.on_chunk(chunk)
    }

    fn on_chunk(&mut self, chunk: Bytes) -> Result<(), AdbError> {
        let declared = self.session.as_ref().map(|s| s.file_size as u64).unwrap_or(0);
        self.received += chunk.len() as u64;
        if self.received > declared {
            return self.fail(violation(
                ERROR_INCORRECT_SIZE,
                &format!("received {} bytes, declared {}", self.received, declared),
            ));
        }
        let pushed = match self.sink.as_ref() {
            Some(sink) => sink.push(chunk),
            None => Err(AdbError::Transfer("no active transfer".to_string())),
        };
        if let Err(e) = pushed {
            return self.fail(violation(ERROR_OTHER, &e.to_string()));
        }
        Ok(())
    }

    fn on_finish(&mut self) -> Result<(), AdbError> {
        let declared = self.session.as_ref().map(|s| s.file_size as u64).unwrap_or(0);
        if self.received != declared {
            return self.fail(violation(
                ERROR_INCORRECT_SIZE,
                &format!("received {} bytes, declared {}", self.received, declared),
            ));
        }
        if let Some(mut sink) = self.sink.take() {
            sink.end();
        }
        if let Some(transfer) = self.transfer.take() {
            let id = self.session.as_ref().map(|s| s.id).unwrap_or(0);
            transfer.detach(format!("[{}] Push session {}", self.serial, id));
        }
        if let Some(session) = self.session.as_mut() {
            session.state = PushState::Finish;
        }
        self.reply(NO_ERROR);
        self.release(CLOSE_OK, None);
        Ok(())
    }

    fn on_cancel(&mut self) -> Result<(), AdbError> {
        self.abort_transfer();
        if let Some(session) = self.session.as_mut() {
            log::info!("[{}] Push session {} cancelled", self.serial, session.id);
            session.state = PushState::Cancel;
        }
        self.reply(NO_ERROR);
        self.release(CLOSE_OK, None);
        Ok(())
    }

    /// The client went away: drop everything without replying.
    pub fn on_close(&mut self) {
        if self.released {
            return;
        }
        self.abort_transfer();
        self.released = true;
        if let Some(session) = self.session.as_ref() {
            log::debug!("[{}] Push session {} dropped with its connection", self.serial, session.id);
            self.registry.release(session.id);
        }
    }

    fn abort_transfer(&mut self) {
        if let Some(transfer) = self.transfer.take() {
            transfer.cancel();
        }
        if let Some(mut sink) = self.sink.take() {
            sink.terminate();
        }
    }

    fn reply(&self, status: i8) {
        self.channel.send(response(self.current_wire_id(), status));
    }

    fn release(&mut self, code: u16, reason: Option<&str>) {
        self.released = true;
        if let Some(session) = self.session.as_ref() {
            self.registry.release(session.id);
        }
        self.channel.close(code, reason);
    }

    /// Reply with the violation's status, tear the session down and close.
    fn fail(&mut self, error: AdbError) -> Result<(), AdbError> {
        let status = match &error {
            AdbError::StateViolation { status, .. } => *status,
            _ => ERROR_OTHER,
        };
        log::warn!("[{}] Push failed: {}", self.serial, error);
        self.abort_transfer();
        self.reply(status);
        self.release(CLOSE_FAILED, Some(&error.to_string()));
        Err(error)
    }
}

impl Drop for FilePushHandler {
    fn drop(&mut self) {
        self.on_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_response_layout() {
        assert_eq!(&response(0x0102, NEW_PUSH_ID)[..], &[0x01, 0x02, 0x01]);
        assert_eq!(&response(7, ERROR_UNKNOWN_ID)[..], &[0x00, 0x07, 0xf7]);
    }

    #[test]
    fn test_parse_requests() {
        assert_eq!(PushRequest::parse(&[1]).unwrap(), PushRequest::New);

        let start = PushRequest::Start {
            id: 3,
            file_name: "app.apk".to_string(),
            file_size: 1024,
        };
        assert_eq!(PushRequest::parse(&start.to_bytes()).unwrap(), start);

        // Declared length longer than the frame
        let truncated = [3u8, 0, 3, 0, 0, 0, 9, 1, 2];
        assert_eq!(
            PushRequest::parse(&truncated).unwrap(),
            PushRequest::Append { id: 3, chunk: None }
        );

        assert!(matches!(
            PushRequest::parse(&[9, 0, 1]),
            Err(AdbError::StateViolation { status: ERROR_INVALID_STATE, .. })
        ));
        assert!(PushRequest::parse(&[4, 0]).is_err());
    }

    #[test]
    fn test_parse_rejects_short_start() {
        // Name length says 10, only "ab" follows
        let truncated_name = [2u8, 0, 1, 0, 0, 0, 5, 0, 10, b'a', b'b'];
        assert!(matches!(
            PushRequest::parse(&truncated_name),
            Err(AdbError::StateViolation { status: ERROR_INVALID_NAME, .. })
        ));

        // No size
        assert!(matches!(
            PushRequest::parse(&[2, 0, 1]),
            Err(AdbError::StateViolation { status: ERROR_OTHER, .. })
        ));

        // Size but no name length
        assert!(matches!(
            PushRequest::parse(&[2, 0, 1, 0, 0, 0, 5]),
            Err(AdbError::StateViolation { status: ERROR_OTHER, .. })
        ));

        let not_utf8 = [2u8, 0, 1, 0, 0, 0, 5, 0, 2, 0xff, 0xfe];
        assert!(matches!(
            PushRequest::parse(&not_utf8),
            Err(AdbError::StateViolation { status: ERROR_INVALID_NAME, .. })
        ));
    }

    #[test]
    fn test_registry_skips_zero_wire_ids() {
        let registry = PushRegistry::starting_at(0xffff);
        assert_eq!(registry.allocate().unwrap(), 0xffff);
        let next = registry.allocate().unwrap();
        assert_eq!(next, 0x1_0001);
        assert_eq!(wire_id(next), 1);
    }

    #[test]
    fn test_registry_wraps_and_skips_open_ids() {
        let registry = PushRegistry::starting_at(u32::MAX - 1);
        assert_eq!(registry.allocate().unwrap(), u32::MAX - 1);
        assert_eq!(registry.allocate().unwrap(), u32::MAX);
        assert_eq!(registry.allocate().unwrap(), 1);

        // 2 is still open when the counter comes around again
        let registry = PushRegistry::starting_at(2);
        assert_eq!(registry.allocate().unwrap(), 2);
        registry.release(2);
        assert_eq!(registry.allocate().unwrap(), 3);
        assert_eq!(registry.open_sessions(), 1);
    }

    #[test]
    fn test_validate_file_name() {
        assert!(validate_file_name("notes.txt").is_ok());
        for name in ["", ".", "..", "a/b", "../etc"] {
            assert!(validate_file_name(name).is_err(), "{:?}", name);
        }
    }

    #[tokio::test]
    async fn test_byte_source_demands_once_per_chunk() {
        let demands = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&demands);
        let (mut sink, mut source) = byte_channel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sink.push(Bytes::from_static(b"hello")).unwrap();
        let reader = tokio::spawn(async move {
            let mut data = Vec::new();
            source.read_to_end(&mut data).await.map(|_| data)
        });

        while demands.load(Ordering::SeqCst) < 1 {
            tokio::task::yield_now().await;
        }
        sink.push(Bytes::from_static(b" world")).unwrap();
        while demands.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        sink.end();

        assert_eq!(reader.await.unwrap().unwrap(), b"hello world");
        assert_eq!(demands.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_byte_source_terminate_fails_reader() {
        let (mut sink, mut source) = byte_channel(|| {});
        sink.push(Bytes::from_static(b"partial")).unwrap();
        sink.terminate();

        let mut data = Vec::new();
        let err = source.read_to_end(&mut data).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }
}
