use std::sync::Arc;

use crate::channel::{Channel, ChannelEvent, QueueChannel, CLOSE_FAILED};
use crate::protocol::AdbError;
use crate::sync::{self, DirEntry};
use crate::transport::Transport;

/// Quote an argument for the device shell
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// Pipe operations layered over a [`Transport`]: sync output is streamed
/// into a multiplexed channel instead of being buffered here.
#[derive(Clone)]
pub struct ExtendedClient {
    transport: Arc<dyn Transport>,
}

impl ExtendedClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Forward every DENT frame of `path` to `sink`, then close it.
    pub async fn pipe_read_dir(
        &self,
        serial: &str,
        path: &str,
        sink: &dyn Channel,
    ) -> Result<(), AdbError> {
        let mut stream = match self.transport.open_sync(serial).await {
            Ok(stream) => stream,
            Err(e) => {
                sink.close(CLOSE_FAILED, Some(&e.to_string()));
                return Err(e);
            }
        };
        sync::pipe_read_dir(&mut stream, path, sink).await
    }

    /// Forward every DATA frame of the file at `path` to `sink`, then close it.
    pub async fn pipe_pull(&self, serial: &str, path: &str, sink: &dyn Channel) -> Result<(), AdbError> {
        let mut stream = match self.transport.open_sync(serial).await {
            Ok(stream) => stream,
            Err(e) => {
                sink.close(CLOSE_FAILED, Some(&e.to_string()));
                return Err(e);
            }
        };
        sync::pipe_pull(&mut stream, path, sink).await
    }

    /// List directory contents, without `.` and `..`
    pub async fn list_dir(&self, serial: &str, path: &str) -> Result<Vec<DirEntry>, AdbError> {
        let (sink, mut frames) = QueueChannel::new();
        self.pipe_read_dir(serial, path, &sink).await?;

        let mut entries = Vec::new();
        while let Ok(event) = frames.try_recv() {
            if let ChannelEvent::Data(frame) = event {
                let entry = DirEntry::from_frame(&frame)?;
                if entry.name != "." && entry.name != ".." {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }
}
