use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::protocol::{AdbError, ADB_SERVER_PORT};

/// Properties Device keeps in its descriptor by default
pub const DEFAULT_PROPERTIES: &[&str] = &[
    "ro.build.version.release",
    "ro.build.version.sdk",
    "ro.product.cpu.abi",
    "ro.product.manufacturer",
    "ro.product.model",
    "wifi.interface",
];

/// Bridge settings. Every field has a default, so a config file only needs
/// the keys it overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub adb_host: String,
    pub adb_port: u16,
    /// `adb` binary used for commands that need their own process
    pub adb_path: String,
    /// Local copy of the companion server artifact
    pub server_jar: PathBuf,
    /// Device directory that file pushes land in
    pub push_dir: String,
    /// Properties mirrored into each device descriptor
    pub properties: Vec<String>,
    /// Start the companion server on connect, instead of only looking for it
    pub spawn_server: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            adb_host: "127.0.0.1".to_string(),
            adb_port: ADB_SERVER_PORT,
            adb_path: "adb".to_string(),
            server_jar: PathBuf::from("vendor/scrcpy-server.jar"),
            push_dir: "/data/local/tmp".to_string(),
            properties: DEFAULT_PROPERTIES.iter().map(|p| p.to_string()).collect(),
            spawn_server: true,
        }
    }
}

impl BridgeConfig {
    /// Load a JSON config file
    pub fn load(path: &Path) -> Result<Self, AdbError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AdbError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with `ADB_SERVER_HOST`, `ADB_SERVER_PORT` and `ADB_PATH` applied
    pub fn from_env() -> Result<Self, AdbError> {
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    fn with_env<F>(mut self, lookup: F) -> Result<Self, AdbError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("ADB_SERVER_HOST") {
            self.adb_host = host;
        }
        if let Some(port) = lookup("ADB_SERVER_PORT") {
            self.adb_port = port
                .parse()
                .map_err(|_| AdbError::Config(format!("Invalid ADB_SERVER_PORT: {}", port)))?;
        }
        if let Some(path) = lookup("ADB_PATH") {
            self.adb_path = path;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), AdbError> {
        if self.adb_port == 0 {
            return Err(AdbError::Config("adb_port must be non-zero".to_string()));
        }
        if !self.push_dir.starts_with('/') {
            return Err(AdbError::Config(format!(
                "push_dir must be an absolute device path: {}",
                self.push_dir
            )));
        }
        Ok(())
    }

    /// Device path a pushed file named `file_name` is written to
    pub fn push_path(&self, file_name: &str) -> String {
        format!("{}/{}", self.push_dir.trim_end_matches('/'), file_name)
    }
}
