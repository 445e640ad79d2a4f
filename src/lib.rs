//! WebADB bridge - device lifecycle and file transfer backend for browser-driven
//! Android tooling, talking to devices through the local ADB server.
//!
//! The crate keeps one [`Device`] per attached udid, polls its properties,
//! network interfaces and companion server, and publishes throttled
//! [`DeviceEvent`]s. Directory listings and file pulls are streamed
//! frame-by-frame into multiplexed [`Channel`]s, and uploads arrive through
//! the chunked [`FilePushHandler`] protocol.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use webadb_bridge::{AdbHostTransport, BridgeConfig, DeviceManager};
//!
//! # async fn run() -> Result<(), webadb_bridge::AdbError> {
//! let config = Arc::new(BridgeConfig::from_env()?);
//! let transport = Arc::new(AdbHostTransport::new(&config));
//!
//! let (manager, mut events) = DeviceManager::new(transport.clone(), config);
//! let (snapshots_tx, snapshots) = tokio::sync::mpsc::unbounded_channel();
//!
//! tokio::spawn(async move { transport.track_devices(snapshots_tx).await });
//! tokio::spawn(async move {
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//! });
//! manager.track(snapshots).await;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod channel;
pub mod client;
pub mod config;
pub mod device;
pub mod parsers;
pub mod pid;
pub mod protocol;
pub mod push;
pub mod server;
pub mod sync;
pub mod tracker;
pub mod transport;
pub mod version;

// Re-export main types
pub use channel::{Channel, ChannelEvent, QueueChannel};
pub use client::ExtendedClient;
pub use config::BridgeConfig;
pub use device::{Device, DeviceDescriptor, DeviceEvent, NetInterface};
pub use pid::{PidDetector, PidStrategy};
pub use protocol::{AdbError, ConnectionState};
pub use push::{FilePushHandler, PushRegistry};
pub use server::{CompanionServer, ServerHost};
pub use tracker::{DeviceManager, TrackedDevice};
pub use transport::{AdbHostTransport, PushTransfer, Transport};
pub use version::ServerVersion;
