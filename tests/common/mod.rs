// Scripted transport shared by the integration tests
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

use webadb_bridge::transport::{PushSource, PushTransfer, SyncStream, Transport};
use webadb_bridge::AdbError;

pub const INTERFACES_COMMAND: &str = "ip -4 -f inet -o a | grep 'scope global'";

pub const SERVER_CMDLINE: &str =
    "app_process\0/\0com.genymobile.scrcpy.Server\01.19-ws6\0web\0ERROR\08886\0true\0";

#[derive(Default)]
pub struct FakeTransport {
    responses: Mutex<HashMap<String, String>>,
    effects: Mutex<HashMap<String, (String, String)>>,
    calls: Mutex<Vec<(Instant, String)>>,
    sync_replies: Mutex<VecDeque<Vec<u8>>>,
    pushes: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    spawn_exit: Mutex<Option<i32>>,
    live_launches: Arc<AtomicUsize>,
}

/// Counts a spawned shell as running until its future is dropped
struct LiveLaunch(Arc<AtomicUsize>);

impl Drop for LiveLaunch {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Device with a working `pidof`, a running companion and one interface
    pub fn healthy() -> Arc<Self> {
        let transport = Self::new();
        transport.respond("pidof 'init'", "1\n");
        transport.respond("pidof 'app_process'", "4242\n");
        transport.respond("cat /proc/4242/cmdline", SERVER_CMDLINE);
        transport.respond(
            "getprop",
            "[ro.product.model]: [Pixel 7]\n[ro.build.version.sdk]: [34]\n",
        );
        transport.respond(
            INTERFACES_COMMAND,
            "30: wlan0    inet 192.168.1.31/24 brd 192.168.1.255 scope global wlan0\n",
        );
        transport
    }

    pub fn respond(&self, command: &str, output: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(command.to_string(), output.to_string());
    }

    /// Once `trigger` runs, `command` answers with `output`
    pub fn after(&self, trigger: &str, command: &str, output: &str) {
        self.effects.lock().unwrap().insert(
            trigger.to_string(),
            (command.to_string(), output.to_string()),
        );
    }

    pub fn queue_sync_reply(&self, reply: Vec<u8>) {
        self.sync_replies.lock().unwrap().push_back(reply);
    }

    pub fn exit_spawned_shells_with(&self, code: i32) {
        *self.spawn_exit.lock().unwrap() = Some(code);
    }

    pub fn calls(&self) -> Vec<(Instant, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, call)| call == command)
            .count()
    }

    /// Spawned shells still awaited by someone
    pub fn live_launches(&self) -> usize {
        self.live_launches.load(Ordering::SeqCst)
    }

    pub fn pushes(&self) -> Vec<(String, Vec<u8>)> {
        self.pushes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn shell(&self, _serial: &str, command: &str) -> Result<String, AdbError> {
        self.calls
            .lock()
            .unwrap()
            .push((Instant::now(), command.to_string()));
        let output = self.responses.lock().unwrap().get(command).cloned();
        let effect = self.effects.lock().unwrap().remove(command);
        if let Some((next, next_output)) = effect {
            self.respond(&next, &next_output);
        }
        output
            .ok_or_else(|| AdbError::Connectivity(format!("no response for {}", command)))
    }

    async fn open_sync(&self, _serial: &str) -> Result<Box<dyn SyncStream>, AdbError> {
        let reply = self
            .sync_replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AdbError::Connectivity("device offline".to_string()))?;

        let (client, mut device) = tokio::io::duplex(256 * 1024);
        tokio::spawn(async move {
            let _ = device.write_all(&reply).await;
            let mut sink = Vec::new();
            let _ = device.read_to_end(&mut sink).await;
        });
        Ok(Box::new(client))
    }

    async fn spawn_shell(&self, _serial: &str, command: &str) -> Result<i32, AdbError> {
        self.calls
            .lock()
            .unwrap()
            .push((Instant::now(), command.to_string()));
        self.live_launches.fetch_add(1, Ordering::SeqCst);
        let _live = LiveLaunch(Arc::clone(&self.live_launches));
        let exit = *self.spawn_exit.lock().unwrap();
        match exit {
            Some(code) => Ok(code),
            None => std::future::pending().await,
        }
    }

    async fn push(
        &self,
        _serial: &str,
        mut source: PushSource,
        remote_path: &str,
        _mode: u32,
    ) -> Result<PushTransfer, AdbError> {
        let pushes = Arc::clone(&self.pushes);
        let remote_path = remote_path.to_string();
        Ok(PushTransfer::spawn(async move {
            let mut data = Vec::new();
            source.read_to_end(&mut data).await?;
            let written = data.len() as u64;
            pushes.lock().unwrap().push((remote_path, data));
            Ok(written)
        }))
    }
}

/// Little-endian sync frame: opcode then u32
pub fn sync_header(opcode: &[u8; 4], value: u32) -> Vec<u8> {
    let mut bytes = opcode.to_vec();
    bytes.extend_from_slice(&value.to_le_bytes());
    bytes
}

/// DENT reply: opcode, mode, size, mtime, name length, name
pub fn dent(name: &str, mode: u32, size: u32) -> Vec<u8> {
    let mut bytes = sync_header(b"DENT", mode);
    bytes.extend_from_slice(&size.to_le_bytes());
    bytes.extend_from_slice(&1_700_000_000u32.to_le_bytes());
    bytes.extend_from_slice(&(name.len() as u32).to_le_bytes());
    bytes.extend_from_slice(name.as_bytes());
    bytes
}
