//! Companion server lifecycle: push, launch, locate and version-reconcile
//! the on-device server process.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::parsers::parse_cmdline_version;
use crate::protocol::AdbError;
use crate::version::ServerVersion;

// Shared with the companion itself; changing any of these breaks discovery
// of an instance that is already running.
pub const TEMP_PATH: &str = "/data/local/tmp/";
pub const FILE_NAME: &str = "scrcpy-server.jar";
pub const PID_FILE_PATH: &str = "/data/local/tmp/ws_scrcpy.pid";
pub const SERVER_PROCESS_NAME: &str = "app_process";
pub const SERVER_PACKAGE: &str = "com.genymobile.scrcpy.Server";
pub const SERVER_VERSION: &str = "1.19-ws6";

const SERVER_TYPE: &str = "web";
const LOG_LEVEL: &str = "ERROR";
const SERVER_PORT: u16 = 8886;
const LISTEN_ON_ALL_INTERFACES: bool = true;

const PID_ATTEMPTS: u32 = 5;
const PID_BASE_DELAY: Duration = Duration::from_millis(500);
const PID_STEP_DELAY: Duration = Duration::from_millis(100);

/// Device-side path of the pushed artifact
pub fn server_path() -> String {
    format!("{}{}", TEMP_PATH, FILE_NAME)
}

/// Shell command that runs the companion in the foreground of its `adb` process
pub fn run_command() -> String {
    format!(
        "CLASSPATH={} nohup {} / {} {} {} {} {} {} 2>&1 > /dev/null",
        server_path(),
        SERVER_PROCESS_NAME,
        SERVER_PACKAGE,
        SERVER_VERSION,
        SERVER_TYPE,
        LOG_LEVEL,
        SERVER_PORT,
        LISTEN_ON_ALL_INTERFACES,
    )
}

/// Delay before PID discovery attempt `attempt` (counted from 0)
pub fn pid_attempt_delay(attempt: u32) -> Duration {
    PID_BASE_DELAY + PID_STEP_DELAY * attempt
}

/// Device capabilities the lifecycle needs
#[async_trait]
pub trait ServerHost: Send + Sync {
    fn udid(&self) -> &str;

    fn is_connected(&self) -> bool;

    async fn shell(&self, command: &str) -> Result<String, AdbError>;

    async fn get_pid_of(&self, name: &str) -> Result<Vec<u32>, AdbError>;

    async fn push_file(&self, local: &Path, remote: &str) -> Result<(), AdbError>;

    /// Launch in a dedicated process; resolves with its exit code
    async fn spawn_shell(&self, command: &str) -> Result<i32, AdbError>;

    async fn kill_process(&self, pid: u32) -> Result<(), AdbError> {
        self.shell(&format!("kill {}", pid)).await.map(|_| ())
    }
}

pub struct CompanionServer {
    artifact: PathBuf,
}

impl CompanionServer {
    pub fn new(artifact: PathBuf) -> Self {
        Self { artifact }
    }

    /// Start the companion unless a matching one is already running.
    pub async fn run(&self, host: &dyn ServerHost) -> Result<Vec<u32>, AdbError> {
        if !host.is_connected() {
            return Err(AdbError::NotConnected);
        }
        let pids = self.get_server_pid(host).await?;
        if !pids.is_empty() {
            log::debug!("[{}] Companion already running: {:?}", host.udid(), pids);
            return Ok(pids);
        }

        host.push_file(&self.artifact, &server_path()).await?;

        let command = run_command();
        log::info!("[{}] Starting companion {}", host.udid(), SERVER_VERSION);

        tokio::select! {
            exit = host.spawn_shell(&command) => {
                let reason = match exit {
                    Ok(code) => format!("server exited with code {} before reporting a PID", code),
                    Err(e) => format!("failed to launch server: {}", e),
                };
                log::error!("[{}] {}", host.udid(), reason);
                Err(AdbError::Server(reason))
            }
            pids = self.wait_for_pid(host) => pids,
        }
    }

    /// Poll the PID file and the process list until the companion shows up.
    pub async fn wait_for_pid(&self, host: &dyn ServerHost) -> Result<Vec<u32>, AdbError> {
        for attempt in 0..PID_ATTEMPTS {
            tokio::time::sleep(pid_attempt_delay(attempt)).await;
            if !host.is_connected() {
                return Err(AdbError::NotConnected);
            }

            let file_pid = self.read_pid_file(host).await;
            let live = match self.get_server_pid(host).await {
                Ok(live) => live,
                Err(e) => {
                    log::debug!("[{}] PID lookup attempt {} failed: {}", host.udid(), attempt, e);
                    continue;
                }
            };

            if let Some(pid) = file_pid {
                if live.contains(&pid) {
                    return Ok(vec![pid]);
                }
                log::debug!("[{}] Stale PID file entry {}", host.udid(), pid);
            }
            if !live.is_empty() {
                return Ok(live);
            }
        }

        Err(AdbError::RetryExhausted("server failed to start".to_string()))
    }

    async fn read_pid_file(&self, host: &dyn ServerHost) -> Option<u32> {
        let output = host.shell(&format!("cat {}", PID_FILE_PATH)).await.ok()?;
        output.trim().parse().ok()
    }

    /// PIDs of running companions with exactly our version. Compatible older
    /// versions are terminated; anything else is left alone.
    pub async fn get_server_pid(&self, host: &dyn ServerHost) -> Result<Vec<u32>, AdbError> {
        if !host.is_connected() {
            return Err(AdbError::NotConnected);
        }
        let desired = ServerVersion::parse(SERVER_VERSION)?;
        let candidates = host.get_pid_of(SERVER_PROCESS_NAME).await?;

        let mut matching = Vec::new();
        for pid in candidates {
            let cmdline = match host.shell(&format!("cat /proc/{}/cmdline", pid)).await {
                Ok(cmdline) => cmdline,
                Err(e) => {
                    log::debug!("[{}] Cannot read cmdline of {}: {}", host.udid(), pid, e);
                    continue;
                }
            };
            let Some(version) = parse_cmdline_version(&cmdline, SERVER_PROCESS_NAME, SERVER_PACKAGE)
            else {
                continue;
            };

            if version == SERVER_VERSION {
                matching.push(pid);
                continue;
            }
            match reconcile(&desired, &version) {
                Reconcile::Displace => {
                    log::warn!(
                        "[{}] Found old server version running (PID: {}, Version: {}), killing it",
                        host.udid(),
                        pid,
                        version
                    );
                    if let Err(e) = host.kill_process(pid).await {
                        log::warn!("[{}] Failed to kill {}: {}", host.udid(), pid, e);
                    }
                }
                Reconcile::LeaveAlone(e) => {
                    log::info!("[{}] Ignoring server PID {}: {}", host.udid(), pid, e);
                }
            }
        }
        Ok(matching)
    }
}

enum Reconcile {
    Displace,
    LeaveAlone(AdbError),
}

/// What to do with a running companion whose version is not ours
fn reconcile(desired: &ServerVersion, running: &str) -> Reconcile {
    match ServerVersion::parse(running) {
        Ok(running) if running.is_compatible_with(desired) && desired.gt(&running) => {
            Reconcile::Displace
        }
        Ok(running) => Reconcile::LeaveAlone(AdbError::VersionIncompatible(running.to_string())),
        Err(e) => Reconcile::LeaveAlone(e),
    }
}
