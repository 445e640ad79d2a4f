//! Per-device orchestration.
//!
//! A [`Device`] follows the tracker state of one udid, keeps its
//! [`DeviceDescriptor`] up to date by polling properties, network interfaces
//! and the companion server, and reports changes as throttled
//! [`DeviceEvent::Updated`] events.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::config::BridgeConfig;
use crate::parsers::parse_interfaces;
use crate::pid::PidDetector;
use crate::protocol::{AdbError, ConnectionState};
use crate::server::{CompanionServer, ServerHost};
use crate::transport::Transport;

/// Delay before the first retry of a failed info pass
pub const INFO_RETRY_INITIAL: Duration = Duration::from_millis(1500);

/// Info passes run per connection before polling gives up
pub const MAX_INFO_ATTEMPTS: u32 = 7;

/// Minimum spacing of update events
pub const UPDATE_THROTTLE: Duration = Duration::from_millis(300);

const INTERFACES_COMMAND: &str = "ip -4 -f inet -o a | grep 'scope global'";

/// Delay before the retry that follows the `failures`-th consecutive failure
pub fn retry_delay(failures: u32) -> Duration {
    INFO_RETRY_INITIAL * 2u32.pow(failures.saturating_sub(1))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInterface {
    pub name: String,
    pub ipv4: String,
}

/// Everything the presentation layer knows about one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub udid: String,
    pub state: String,
    /// Companion server PID, -1 when none is associated
    pub pid: i32,
    pub interfaces: Vec<NetInterface>,
    pub properties: BTreeMap<String, String>,
    #[serde(rename = "last.update.timestamp")]
    pub last_update: u64,
}

impl DeviceDescriptor {
    fn new(udid: &str, state: &str) -> Self {
        Self {
            udid: udid.to_string(),
            state: state.to_string(),
            pid: -1,
            interfaces: Vec::new(),
            properties: BTreeMap::new(),
            last_update: now_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Updated(DeviceDescriptor),
    Removed(String),
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct DeviceState {
    descriptor: DeviceDescriptor,
    connection: ConnectionState,
    /// Bumped on every tracker state change; results of older passes are dropped
    generation: u64,
    /// Full getprop output, fetched once per connection
    properties: Option<HashMap<String, String>>,
    spawn_server: bool,
    pass_pending: bool,
    /// The running reconciliation pass, aborted when the state changes
    pass: Option<AbortHandle>,
    failed_passes: u32,
    last_emit: Option<Instant>,
    emit_scheduled: bool,
    removed: bool,
}

impl DeviceState {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.connection == ConnectionState::Connected
    }

    fn abort_pass(&mut self) {
        if let Some(pass) = self.pass.take() {
            pass.abort();
        }
        self.pass_pending = false;
    }
}

pub struct Device {
    udid: String,
    transport: Arc<dyn Transport>,
    pid_detector: Arc<PidDetector>,
    server: CompanionServer,
    watched_properties: Vec<String>,
    state: Mutex<DeviceState>,
    events: mpsc::UnboundedSender<DeviceEvent>,
}

impl Device {
    pub fn new(
        udid: &str,
        transport: Arc<dyn Transport>,
        pid_detector: Arc<PidDetector>,
        config: &BridgeConfig,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            udid: udid.to_string(),
            transport,
            pid_detector,
            server: CompanionServer::new(config.server_jar.clone()),
            watched_properties: config.properties.clone(),
            state: Mutex::new(DeviceState {
                descriptor: DeviceDescriptor::new(udid, ""),
                connection: ConnectionState::Disconnected,
                generation: 0,
                properties: None,
                spawn_server: config.spawn_server,
                pass_pending: false,
                pass: None,
                failed_passes: 0,
                last_emit: None,
                emit_scheduled: false,
                removed: false,
            }),
            events,
        })
    }

    pub fn udid(&self) -> &str {
        &self.udid
    }

    fn host(&self) -> &dyn ServerHost {
        self
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        self.lock().descriptor.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connection == ConnectionState::Connected
    }

    /// Apply a tracker state string. Must be called inside a Tokio runtime.
    pub fn set_state(self: &Arc<Self>, state: &str) {
        {
            let mut guard = self.lock();
            if guard.removed || guard.descriptor.state == state {
                return;
            }
            log::info!("[{}] State: {:?} -> {:?}", self.udid, guard.descriptor.state, state);

            guard.descriptor.state = state.to_string();
            let connection = ConnectionState::from_tracker(state);
            guard.connection = connection;
            guard.generation += 1;
            guard.abort_pass();
            guard.failed_passes = 0;
            match connection {
                ConnectionState::Connected => guard.properties = None,
                ConnectionState::Disconnected => guard.descriptor.pid = -1,
            }
            self.emit_update(&mut guard);
        }
        self.fetch_device_info();
    }

    /// Stop all activity; called when the tracker no longer lists the device.
    pub fn destroy(&self) {
        let mut guard = self.lock();
        guard.removed = true;
        guard.connection = ConnectionState::Disconnected;
        guard.generation += 1;
        guard.abort_pass();
    }

    /// Start a reconciliation pass unless one is already pending.
    pub fn fetch_device_info(self: &Arc<Self>) {
        let mut guard = self.lock();
        if guard.connection != ConnectionState::Connected || guard.pass_pending {
            return;
        }
        guard.pass_pending = true;
        let task = tokio::spawn(Arc::clone(self).run_info_passes(guard.generation));
        guard.pass = Some(task.abort_handle());
    }

    async fn run_info_passes(self: Arc<Self>, generation: u64) {
        loop {
            let (properties, interfaces, server) = tokio::join!(
                self.update_properties(generation),
                self.update_interfaces(generation),
                self.update_server(generation),
            );

            let mut succeeded = true;
            for (step, result) in [
                ("properties", properties),
                ("interfaces", interfaces),
                ("server", server),
            ] {
                if let Err(e) = result {
                    log::debug!("[{}] Failed to update {}: {}", self.udid, step, e);
                    succeeded = false;
                }
            }

            let delay = {
                let mut guard = self.lock();
                if !guard.is_current(generation) {
                    return;
                }
                if succeeded {
                    guard.failed_passes = 0;
                    guard.pass_pending = false;
                    return;
                }
                guard.failed_passes += 1;
                if guard.failed_passes >= MAX_INFO_ATTEMPTS {
                    let e = AdbError::RetryExhausted(format!(
                        "info updates failed {} times",
                        guard.failed_passes
                    ));
                    log::warn!("[{}] {}", self.udid, e);
                    guard.pass_pending = false;
                    return;
                }
                retry_delay(guard.failed_passes)
            };

            log::debug!("[{}] Retrying info update in {:?}", self.udid, delay);
            tokio::time::sleep(delay).await;
            if !self.lock().is_current(generation) {
                return;
            }
        }
    }

    async fn update_properties(self: &Arc<Self>, generation: u64) -> Result<(), AdbError> {
        let cached = self.lock().properties.clone();
        let properties = match cached {
            Some(properties) => properties,
            None => self.transport.get_properties(&self.udid).await?,
        };

        let mut guard = self.lock();
        if !guard.is_current(generation) {
            return Err(AdbError::NotConnected);
        }
        let mut changed = false;
        for key in &self.watched_properties {
            let value = properties.get(key).cloned().unwrap_or_default();
            if guard.descriptor.properties.get(key) != Some(&value) {
                guard.descriptor.properties.insert(key.clone(), value);
                changed = true;
            }
        }
        guard.properties = Some(properties);
        if changed {
            self.emit_update(&mut guard);
        }
        Ok(())
    }

    async fn update_interfaces(self: &Arc<Self>, generation: u64) -> Result<(), AdbError> {
        let output = self.transport.shell(&self.udid, INTERFACES_COMMAND).await?;
        let interfaces = parse_interfaces(&output);

        let mut guard = self.lock();
        if !guard.is_current(generation) {
            return Err(AdbError::NotConnected);
        }
        let current = &guard.descriptor.interfaces;
        let changed = current.len() != interfaces.len()
            || current
                .iter()
                .zip(&interfaces)
                .any(|(old, new)| old.name != new.name || old.ipv4 != new.ipv4);
        if changed {
            guard.descriptor.interfaces = interfaces;
            self.emit_update(&mut guard);
        }
        Ok(())
    }

    async fn update_server(self: &Arc<Self>, generation: u64) -> Result<(), AdbError> {
        let spawn_server = self.lock().spawn_server;
        let pids = if spawn_server {
            self.server.run(self.host()).await?
        } else {
            self.server.get_server_pid(self.host()).await?
        };

        let mut guard = self.lock();
        if !guard.is_current(generation) {
            return Err(AdbError::NotConnected);
        }
        let pid = pids.first().map(|&pid| pid as i32).unwrap_or(-1);
        self.store_pid(&mut guard, pid);
        if pid == -1 {
            return Err(AdbError::Server("companion server is not running".to_string()));
        }
        Ok(())
    }

    fn store_pid(self: &Arc<Self>, guard: &mut DeviceState, pid: i32) {
        if guard.descriptor.pid != pid {
            guard.descriptor.pid = pid;
            self.emit_update(guard);
        }
    }

    /// PIDs of processes named `name`, using the device's cached strategy
    pub async fn get_pid_of(&self, name: &str) -> Result<Vec<u32>, AdbError> {
        self.pid_detector
            .get_pid_of(self.transport.as_ref(), &self.udid, name)
            .await
    }

    /// Stop the companion and stop respawning it.
    pub async fn kill_server(self: &Arc<Self>, pid: i32) -> Result<(), AdbError> {
        self.lock().spawn_server = false;

        let running = self.server.get_server_pid(self.host()).await?;
        let Some(&actual) = running.first() else {
            log::info!("[{}] No companion server running", self.udid);
            let mut guard = self.lock();
            self.store_pid(&mut guard, -1);
            return Ok(());
        };
        if actual as i32 != pid {
            log::error!(
                "[{}] Requested to kill server with PID {}. Real server PID is {}.",
                self.udid,
                pid,
                actual
            );
        }
        self.kill_process(actual).await?;

        let remaining = self.server.get_server_pid(self.host()).await?;
        let mut guard = self.lock();
        let pid = remaining.first().map(|&pid| pid as i32).unwrap_or(-1);
        self.store_pid(&mut guard, pid);
        Ok(())
    }

    /// Start the companion (or adopt a running one) and keep it running.
    pub async fn start_server(self: &Arc<Self>) -> Result<i32, AdbError> {
        self.lock().spawn_server = true;

        let result = self.server.run(self.host()).await;
        let mut guard = self.lock();
        let pid = match &result {
            Ok(pids) => pids.first().map(|&pid| pid as i32).unwrap_or(-1),
            Err(_) => -1,
        };
        self.store_pid(&mut guard, pid);
        result.map(|_| pid)
    }

    /// Leading and trailing edge coalescing. A change outside the window of
    /// the previous event goes out at once. Changes inside it are folded into
    /// one event sent when the window closes, carrying the descriptor as it is
    /// then. A burst therefore costs at most two events, and the last one is
    /// always current.
    fn emit_update(self: &Arc<Self>, guard: &mut DeviceState) {
        guard.descriptor.last_update = now_millis();
        if guard.emit_scheduled || guard.removed {
            return;
        }

        let now = Instant::now();
        let window_end = match guard.last_emit.map(|at| at + UPDATE_THROTTLE) {
            Some(end) if end > now => end,
            _ => {
                guard.last_emit = Some(now);
                let _ = self.events.send(DeviceEvent::Updated(guard.descriptor.clone()));
                return;
            }
        };
        guard.emit_scheduled = true;

        let device = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(window_end).await;
            let descriptor = {
                let mut guard = device.lock();
                guard.emit_scheduled = false;
                if guard.removed {
                    return;
                }
                guard.last_emit = Some(Instant::now());
                guard.descriptor.clone()
            };
            let _ = device.events.send(DeviceEvent::Updated(descriptor));
        });
    }
}

#[async_trait]
impl ServerHost for Device {
    fn udid(&self) -> &str {
        &self.udid
    }

    fn is_connected(&self) -> bool {
        Device::is_connected(self)
    }

    async fn shell(&self, command: &str) -> Result<String, AdbError> {
        self.transport.shell(&self.udid, command).await
    }

    async fn get_pid_of(&self, name: &str) -> Result<Vec<u32>, AdbError> {
        Device::get_pid_of(self, name).await
    }

    async fn push_file(&self, local: &Path, remote: &str) -> Result<(), AdbError> {
        let file = tokio::fs::File::open(local).await.map_err(|e| {
            AdbError::Transfer(format!("Cannot open {}: {}", local.display(), e))
        })?;
        let sent = self
            .transport
            .push(&self.udid, Box::new(file), remote, 0o644)
            .await?
            .wait()
            .await?;
        log::debug!("[{}] Pushed {} ({} bytes) to {}", self.udid, local.display(), sent, remote);
        Ok(())
    }

    async fn spawn_shell(&self, command: &str) -> Result<i32, AdbError> {
        self.transport.spawn_shell(&self.udid, command).await
    }
}
