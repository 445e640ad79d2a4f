//! Multiplexed channel seam.
//!
//! A channel is one logical duplex stream carried over a shared client
//! connection. The core only ever sends bytes and closes it; close code 0
//! means success, anything else is a failure.

use bytes::Bytes;
use std::sync::Mutex;
use tokio::sync::mpsc;

pub const CLOSE_OK: u16 = 0;
pub const CLOSE_FAILED: u16 = 1;

/// Outbound side of a multiplexed channel
pub trait Channel: Send + Sync {
    fn send(&self, data: Bytes);

    fn close(&self, code: u16, reason: Option<&str>);
}

/// What a [`QueueChannel`] hands to whoever drains it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Data(Bytes),
    Closed { code: u16, reason: Option<String> },
}

/// Channel backed by an unbounded queue; the connection layer drains the
/// receiver and writes frames to the real socket.
pub struct QueueChannel {
    tx: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
}

impl QueueChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().map(|tx| tx.is_none()).unwrap_or(true)
    }
}

impl Channel for QueueChannel {
    fn send(&self, data: Bytes) {
        if let Ok(tx) = self.tx.lock() {
            match tx.as_ref() {
                Some(tx) => {
                    let _ = tx.send(ChannelEvent::Data(data));
                }
                None => log::debug!("Dropping {} bytes sent on a closed channel", data.len()),
            }
        }
    }

    fn close(&self, code: u16, reason: Option<&str>) {
        if let Ok(mut tx) = self.tx.lock() {
            // Only the first close is delivered
            if let Some(tx) = tx.take() {
                let _ = tx.send(ChannelEvent::Closed {
                    code,
                    reason: reason.map(str::to_string),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_is_delivered_once() {
        let (channel, mut rx) = QueueChannel::new();
        channel.send(Bytes::from_static(b"abc"));
        channel.close(CLOSE_FAILED, Some("boom"));
        channel.close(CLOSE_OK, None);
        channel.send(Bytes::from_static(b"late"));

        assert_eq!(rx.try_recv().unwrap(), ChannelEvent::Data(Bytes::from_static(b"abc")));
        assert_eq!(
            rx.try_recv().unwrap(),
            ChannelEvent::Closed {
                code: CLOSE_FAILED,
                reason: Some("boom".to_string())
            }
        );
        assert!(rx.try_recv().is_err());
        assert!(channel.is_closed());
    }
}
