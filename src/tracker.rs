//! Follows the ADB server's device list and keeps one [`Device`] per udid.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::config::BridgeConfig;
use crate::device::{Device, DeviceDescriptor, DeviceEvent};
use crate::pid::PidDetector;
use crate::transport::Transport;

/// One line of a `host:track-devices` snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedDevice {
    pub serial: String,
    pub state: String,
}

/// Parse a tracker payload: one `serial<TAB>state` per line.
pub fn parse_device_list(payload: &str) -> Vec<TrackedDevice> {
    payload
        .lines()
        .filter_map(|line| {
            let (serial, state) = line.split_once('\t')?;
            let serial = serial.trim();
            if serial.is_empty() {
                return None;
            }
            Some(TrackedDevice {
                serial: serial.to_string(),
                state: state.trim().to_string(),
            })
        })
        .collect()
}

pub struct DeviceManager {
    transport: Arc<dyn Transport>,
    config: Arc<BridgeConfig>,
    pid_detector: Arc<PidDetector>,
    devices: Mutex<HashMap<String, Arc<Device>>>,
    events: mpsc::UnboundedSender<DeviceEvent>,
}

impl DeviceManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: Arc<BridgeConfig>,
    ) -> (Self, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            transport,
            config,
            pid_detector: Arc::new(PidDetector::new()),
            devices: Mutex::new(HashMap::new()),
            events,
        };
        (manager, rx)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Device>>> {
        match self.devices.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn pid_detector(&self) -> &Arc<PidDetector> {
        &self.pid_detector
    }

    pub fn get(&self, udid: &str) -> Option<Arc<Device>> {
        self.lock().get(udid).cloned()
    }

    /// Current descriptors, ordered by udid
    pub fn descriptors(&self) -> Vec<DeviceDescriptor> {
        let mut descriptors: Vec<_> = self.lock().values().map(|d| d.descriptor()).collect();
        descriptors.sort_by(|a, b| a.udid.cmp(&b.udid));
        descriptors
    }

    pub fn device_appeared(&self, udid: &str, state: &str) -> Arc<Device> {
        let device = {
            let mut devices = self.lock();
            if let Some(device) = devices.get(udid) {
                Arc::clone(device)
            } else {
                log::info!("[{}] Device appeared", udid);
                let device = Device::new(
                    udid,
                    Arc::clone(&self.transport),
                    Arc::clone(&self.pid_detector),
                    &self.config,
                    self.events.clone(),
                );
                devices.insert(udid.to_string(), Arc::clone(&device));
                device
            }
        };
        device.set_state(state);
        device
    }

    pub fn device_changed(&self, udid: &str, state: &str) {
        match self.get(udid) {
            Some(device) => device.set_state(state),
            None => {
                self.device_appeared(udid, state);
            }
        }
    }

    pub fn device_removed(&self, udid: &str) {
        let Some(device) = self.lock().remove(udid) else {
            return;
        };
        log::info!("[{}] Device removed", udid);
        device.destroy();
        self.pid_detector.forget(udid);
        let _ = self.events.send(DeviceEvent::Removed(udid.to_string()));
    }

    /// Reconcile the device map with a full tracker snapshot.
    pub fn apply_snapshot(&self, snapshot: &[TrackedDevice]) {
        let listed: HashSet<&str> = snapshot.iter().map(|d| d.serial.as_str()).collect();
        let gone: Vec<String> = self
            .lock()
            .keys()
            .filter(|udid| !listed.contains(udid.as_str()))
            .cloned()
            .collect();
        for udid in gone {
            self.device_removed(&udid);
        }
        for tracked in snapshot {
            self.device_changed(&tracked.serial, &tracked.state);
        }
    }

    /// Apply snapshots until the sender goes away.
    pub async fn track(&self, mut snapshots: mpsc::UnboundedReceiver<Vec<TrackedDevice>>) {
        while let Some(snapshot) = snapshots.recv().await {
            log::debug!("Tracker snapshot with {} device(s)", snapshot.len());
            self.apply_snapshot(&snapshot);
        }
        log::info!("Device tracker stopped");
    }
}
