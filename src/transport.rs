use std::collections::HashMap;
use std::future::Future;
use std::process::Stdio;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::config::BridgeConfig;
use super::parsers::parse_properties;
use super::protocol::{read_hex_string, send_host_request, AdbError};
use super::sync;
use super::tracker::{parse_device_list, TrackedDevice};

/// Raw duplex stream positioned right after `sync:` was accepted
pub trait SyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SyncStream for T {}

/// Bytes to be written to the device by a push
pub type PushSource = Box<dyn AsyncRead + Send + Unpin>;

/// Handle to a push running in the background
pub struct PushTransfer {
    task: JoinHandle<Result<u64, AdbError>>,
}

impl PushTransfer {
    pub fn spawn<F>(transfer: F) -> Self
    where
        F: Future<Output = Result<u64, AdbError>> + Send + 'static,
    {
        Self {
            task: tokio::spawn(transfer),
        }
    }

    /// Abort the transfer immediately
    pub fn cancel(self) {
        self.task.abort();
    }

    /// Let the transfer run to completion in the background and log how it
    /// ended under `label`.
    pub fn detach(self, label: String) {
        tokio::spawn(async move {
            match self.wait().await {
                Ok(bytes) => log::info!("{} wrote {} bytes", label, bytes),
                Err(e) => log::warn!("{} failed: {}", label, e),
            }
        });
    }

    /// Wait for the transfer and return the number of bytes written
    pub async fn wait(self) -> Result<u64, AdbError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(AdbError::Transfer("Transfer cancelled".to_string())),
            Err(e) => Err(AdbError::Transfer(format!("Transfer task failed: {}", e))),
        }
    }
}

/// Everything the core needs from an ADB transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run a shell command over the transport and collect its output
    async fn shell(&self, serial: &str, command: &str) -> Result<String, AdbError>;

    /// Open a sync sub-protocol connection
    async fn open_sync(&self, serial: &str) -> Result<Box<dyn SyncStream>, AdbError>;

    /// Run a shell command in a dedicated `adb` process; resolves with its
    /// exit code once that process exits.
    async fn spawn_shell(&self, serial: &str, command: &str) -> Result<i32, AdbError>;

    /// Get device properties
    async fn get_properties(&self, serial: &str) -> Result<HashMap<String, String>, AdbError> {
        let output = self.shell(serial, "getprop").await?;
        Ok(parse_properties(&output))
    }

    /// Start writing `source` to `remote_path`
    async fn push(
        &self,
        serial: &str,
        mut source: PushSource,
        remote_path: &str,
        mode: u32,
    ) -> Result<PushTransfer, AdbError> {
        let mut stream = self.open_sync(serial).await?;
        let remote_path = remote_path.to_string();
        let mtime = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        Ok(PushTransfer::spawn(async move {
            let result = sync::send(&mut stream, &mut source, &remote_path, mode, mtime).await;
            sync::end_connection(&mut stream).await;
            result
        }))
    }
}

/// Transport talking to the local ADB server
#[derive(Debug, Clone)]
pub struct AdbHostTransport {
    host: String,
    port: u16,
    adb_path: String,
}

impl AdbHostTransport {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            host: config.adb_host.clone(),
            port: config.adb_port,
            adb_path: config.adb_path.clone(),
        }
    }

    async fn connect(&self) -> Result<TcpStream, AdbError> {
        TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                AdbError::Connectivity(format!(
                    "Failed to reach adb server at {}:{}: {}",
                    self.host, self.port, e
                ))
            })
    }

    /// Connect and bind the socket to one device
    async fn device_stream(&self, serial: &str) -> Result<TcpStream, AdbError> {
        let mut stream = self.connect().await?;
        send_host_request(&mut stream, &format!("host:transport:{}", serial)).await?;
        Ok(stream)
    }

    /// Follow `host:track-devices`, sending every snapshot until the server
    /// closes the connection or the receiver goes away.
    pub async fn track_devices(
        &self,
        snapshots: mpsc::UnboundedSender<Vec<TrackedDevice>>,
    ) -> Result<(), AdbError> {
        let mut stream = self.connect().await?;
        send_host_request(&mut stream, "host:track-devices").await?;

        loop {
            let payload = read_hex_string(&mut stream).await?;
            if snapshots.send(parse_device_list(&payload)).is_err() {
                log::debug!("Device tracker receiver dropped");
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl Transport for AdbHostTransport {
    async fn shell(&self, serial: &str, command: &str) -> Result<String, AdbError> {
        let mut stream = self.device_stream(serial).await?;
        send_host_request(&mut stream, &format!("shell:{}", command)).await?;

        let mut output = Vec::new();
        stream.read_to_end(&mut output).await?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    async fn open_sync(&self, serial: &str) -> Result<Box<dyn SyncStream>, AdbError> {
        let mut stream = self.device_stream(serial).await?;
        send_host_request(&mut stream, "sync:").await?;
        Ok(Box::new(stream))
    }

    async fn spawn_shell(&self, serial: &str, command: &str) -> Result<i32, AdbError> {
        log::debug!("[{}] Spawning: {} -s {} shell {}", serial, self.adb_path, serial, command);
        let status = tokio::process::Command::new(&self.adb_path)
            .env("ANDROID_ADB_SERVER_PORT", self.port.to_string())
            .args(["-s", serial, "shell", command])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        Ok(status.code().unwrap_or(-1))
    }
}
