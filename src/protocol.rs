use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default port of the local ADB server
pub const ADB_SERVER_PORT: u16 = 5037;

/// Largest payload the ADB server accepts in a single host request
pub const MAX_HOST_PAYLOAD: usize = 0xffff;

/// Status words used by the ADB server smart-socket protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    /// Request accepted
    Okay,
    /// Request rejected, followed by a hex-length message
    Fail,
}

impl HostStatus {
    pub fn from_bytes(bytes: &[u8; 4]) -> Option<Self> {
        match bytes {
            b"OKAY" => Some(HostStatus::Okay),
            b"FAIL" => Some(HostStatus::Fail),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> &'static [u8; 4] {
        match self {
            HostStatus::Okay => b"OKAY",
            HostStatus::Fail => b"FAIL",
        }
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostStatus::Okay => write!(f, "OKAY"),
            HostStatus::Fail => write!(f, "FAIL"),
        }
    }
}

/// Connectivity of a device as reported by the device tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

impl ConnectionState {
    /// Only the literal tracker state "device" means the device is usable.
    pub fn from_tracker(state: &str) -> Self {
        if state == "device" {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }
}

/// Encode a host request: 4 uppercase hex digits of length, then the payload.
pub fn encode_message(payload: &str) -> Result<Vec<u8>, AdbError> {
    if payload.len() > MAX_HOST_PAYLOAD {
        return Err(AdbError::InvalidMessage(format!(
            "Host request too long: {} bytes",
            payload.len()
        )));
    }
    let mut bytes = format!("{:04X}", payload.len()).into_bytes();
    bytes.extend_from_slice(payload.as_bytes());
    Ok(bytes)
}

/// Read a 4-digit hex length prefix
pub async fn read_hex_length<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize, AdbError> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes).await?;
    let text = std::str::from_utf8(&bytes)
        .map_err(|_| AdbError::ProtocolFraming(format!("Invalid length prefix: {:02x?}", bytes)))?;
    usize::from_str_radix(text, 16)
        .map_err(|_| AdbError::ProtocolFraming(format!("Invalid length prefix: {}", text)))
}

/// Read a hex-length prefixed string
pub async fn read_hex_string<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, AdbError> {
    let length = read_hex_length(reader).await?;
    let mut data = vec![0u8; length];
    reader.read_exact(&mut data).await?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

/// Send a host request and wait for its OKAY.
pub async fn send_host_request<S>(stream: &mut S, payload: &str) -> Result<(), AdbError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&encode_message(payload)?).await?;
    read_status(stream).await
}

/// Read a status word; a FAIL carries the server's message.
pub async fn read_status<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(), AdbError> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes).await?;

    match HostStatus::from_bytes(&bytes) {
        Some(HostStatus::Okay) => Ok(()),
        Some(HostStatus::Fail) => {
            let message = read_hex_string(reader).await?;
            Err(AdbError::Connectivity(format!("adb error: {}", message)))
        }
        None => Err(AdbError::ProtocolFraming(format!(
            "Unexpected host status: {}",
            String::from_utf8_lossy(&bytes)
        ))),
    }
}

/// ADB errors
#[derive(Error, Debug)]
pub enum AdbError {
    /// The device or the ADB server cannot be reached
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Unexpected reply on a sync or host connection
    #[error("Protocol framing error: {0}")]
    ProtocolFraming(String),

    #[error("Incompatible server version: {0}")]
    VersionIncompatible(String),

    /// A file push request arrived out of sequence
    #[error("State violation ({status}): {message}")]
    StateViolation { status: i8, message: String },

    /// The companion server could not be started or located
    #[error("Companion server error: {0}")]
    Server(String),

    #[error("Retries exhausted: {0}")]
    RetryExhausted(String),

    /// Push or pull failed on the device side
    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not connected")]
    NotConnected,
}

impl From<serde_json::Error> for AdbError {
    fn from(value: serde_json::Error) -> Self {
        AdbError::Config(value.to_string())
    }
}
