// Integration tests for the chunked file push protocol

mod common;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;

use common::FakeTransport;
use webadb_bridge::channel::{CLOSE_FAILED, CLOSE_OK};
use webadb_bridge::push::*;
use webadb_bridge::{AdbError, BridgeConfig, ChannelEvent, QueueChannel};

struct Harness {
    transport: Arc<FakeTransport>,
    registry: Arc<PushRegistry>,
    handler: FilePushHandler,
    rx: UnboundedReceiver<ChannelEvent>,
}

fn harness_with(registry: Arc<PushRegistry>) -> Harness {
    let transport = FakeTransport::new();
    let (channel, rx) = QueueChannel::new();
    let handler = FilePushHandler::new(
        Arc::clone(&registry),
        transport.clone(),
        "emulator-5554",
        Arc::new(BridgeConfig::default()),
        Arc::new(channel),
    );
    Harness {
        transport,
        registry,
        handler,
        rx,
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(PushRegistry::new()))
}

async fn next_response(rx: &mut UnboundedReceiver<ChannelEvent>) -> (u16, i8) {
    match rx.recv().await {
        Some(ChannelEvent::Data(frame)) => {
            assert_eq!(frame.len(), 3);
            (u16::from_be_bytes([frame[0], frame[1]]), frame[2] as i8)
        }
        other => panic!("expected a response, got {:?}", other),
    }
}

async fn next_close(rx: &mut UnboundedReceiver<ChannelEvent>) -> u16 {
    match rx.recv().await {
        Some(ChannelEvent::Closed { code, .. }) => code,
        other => panic!("expected close, got {:?}", other),
    }
}

/// NEW then START; returns the wire id
async fn open(h: &mut Harness, name: &str, size: u32) -> u16 {
    h.handler.handle_request(PushRequest::New).await.unwrap();
    let (id, status) = next_response(&mut h.rx).await;
    assert_eq!(status, NEW_PUSH_ID);

    h.handler
        .handle_request(PushRequest::Start {
            id,
            file_name: name.to_string(),
            file_size: size,
        })
        .await
        .unwrap();
    assert_eq!(next_response(&mut h.rx).await, (id, NO_ERROR));
    id
}

fn append(id: u16, chunk: &'static [u8]) -> PushRequest {
    PushRequest::Append {
        id,
        chunk: Some(Bytes::from_static(chunk)),
    }
}

#[tokio::test]
async fn test_push_valid_sequence() {
    let mut h = harness();
    let id = open(&mut h, "notes.txt", 11).await;
    assert_eq!(h.handler.state(), PushState::Start);

    h.handler.handle_request(append(id, b"hello")).await.unwrap();
    assert_eq!(next_response(&mut h.rx).await, (id, NO_ERROR));
    assert_eq!(h.handler.state(), PushState::Append);

    h.handler.handle_request(append(id, b" world")).await.unwrap();
    assert_eq!(next_response(&mut h.rx).await, (id, NO_ERROR));

    h.handler
        .handle_request(PushRequest::Finish { id })
        .await
        .unwrap();
    assert_eq!(next_response(&mut h.rx).await, (id, NO_ERROR));
    assert_eq!(next_close(&mut h.rx).await, CLOSE_OK);
    assert_eq!(h.handler.state(), PushState::Finish);
    assert_eq!(h.registry.open_sessions(), 0);

    for _ in 0..100 {
        if !h.transport.pushes().is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    let pushes = h.transport.pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].0, "/data/local/tmp/notes.txt");
    assert_eq!(pushes[0].1, b"hello world");
}

#[tokio::test]
async fn test_push_frames_from_wire() {
    let mut h = harness();
    h.handler.handle_frame(&[PushState::New as u8]).await.unwrap();
    let (id, status) = next_response(&mut h.rx).await;
    assert_eq!((id, status), (1, NEW_PUSH_ID));

    let start = PushRequest::Start {
        id,
        file_name: "a.bin".to_string(),
        file_size: 3,
    };
    h.handler.handle_frame(&start.to_bytes()).await.unwrap();
    assert_eq!(next_response(&mut h.rx).await, (id, NO_ERROR));
}

#[tokio::test]
async fn test_push_id_mismatch() {
    let mut h = harness();
    let id = open(&mut h, "notes.txt", 4).await;

    let result = h.handler.handle_request(append(id + 1, b"data")).await;
    assert!(matches!(
        result,
        Err(AdbError::StateViolation { status: ERROR_UNKNOWN_ID, .. })
    ));
    assert_eq!(next_response(&mut h.rx).await, (id, ERROR_UNKNOWN_ID));
    assert_eq!(next_close(&mut h.rx).await, CLOSE_FAILED);

    // The session itself is untouched
    assert_eq!(h.handler.state(), PushState::Start);
    assert_eq!(h.registry.open_sessions(), 0);
}

#[tokio::test]
async fn test_push_out_of_order_request() {
    let mut h = harness();
    let result = h.handler.handle_request(PushRequest::Finish { id: 0 }).await;
    assert!(matches!(
        result,
        Err(AdbError::StateViolation { status: ERROR_INVALID_STATE, .. })
    ));
    assert_eq!(next_response(&mut h.rx).await, (0, ERROR_INVALID_STATE));
    assert_eq!(next_close(&mut h.rx).await, CLOSE_FAILED);

    // Nothing is accepted after the connection was failed
    assert!(h.handler.handle_request(PushRequest::New).await.is_err());
    assert!(h.rx.recv().await.is_none());
}

#[tokio::test]
async fn test_push_finish_before_any_chunk() {
    let mut h = harness();
    let id = open(&mut h, "notes.txt", 4).await;
    let result = h.handler.handle_request(PushRequest::Finish { id }).await;
    assert!(matches!(
        result,
        Err(AdbError::StateViolation { status: ERROR_INVALID_STATE, .. })
    ));
    assert_eq!(next_response(&mut h.rx).await, (id, ERROR_INVALID_STATE));
}

#[tokio::test]
async fn test_push_rejects_bad_names_and_sizes() {
    for name in ["", "..", "dir/file"] {
        let mut h = harness();
        h.handler.handle_request(PushRequest::New).await.unwrap();
        let (id, _) = next_response(&mut h.rx).await;
        let result = h
            .handler
            .handle_request(PushRequest::Start {
                id,
                file_name: name.to_string(),
                file_size: 10,
            })
            .await;
        assert!(result.is_err(), "{:?} accepted", name);
        assert_eq!(next_response(&mut h.rx).await, (id, ERROR_INVALID_NAME));
    }

    let mut h = harness();
    h.handler.handle_request(PushRequest::New).await.unwrap();
    let (id, _) = next_response(&mut h.rx).await;
    let _ = h
        .handler
        .handle_request(PushRequest::Start {
            id,
            file_name: "empty.txt".to_string(),
            file_size: 0,
        })
        .await;
    assert_eq!(next_response(&mut h.rx).await, (id, ERROR_INCORRECT_SIZE));
}

#[tokio::test]
async fn test_push_empty_chunk() {
    let mut h = harness();
    let id = open(&mut h, "notes.txt", 4).await;
    let result = h
        .handler
        .handle_request(PushRequest::Append { id, chunk: None })
        .await;
    assert!(result.is_err());
    assert_eq!(next_response(&mut h.rx).await, (id, ERROR_INCORRECT_SIZE));
    assert_eq!(next_close(&mut h.rx).await, CLOSE_FAILED);
}

#[tokio::test]
async fn test_push_chunks_exceeding_declared_size() {
    let mut h = harness();
    let id = open(&mut h, "notes.txt", 4).await;
    h.handler.handle_request(append(id, b"abc")).await.unwrap();
    assert_eq!(next_response(&mut h.rx).await, (id, NO_ERROR));

    assert!(h.handler.handle_request(append(id, b"de")).await.is_err());
    assert_eq!(next_response(&mut h.rx).await, (id, ERROR_INCORRECT_SIZE));
    assert_eq!(next_close(&mut h.rx).await, CLOSE_FAILED);
}

#[tokio::test]
async fn test_push_cancel_aborts_transfer() {
    let mut h = harness();
    let id = open(&mut h, "big.bin", 100).await;
    h.handler.handle_request(append(id, b"part")).await.unwrap();
    assert_eq!(next_response(&mut h.rx).await, (id, NO_ERROR));

    h.handler
        .handle_request(PushRequest::Cancel { id })
        .await
        .unwrap();
    assert_eq!(next_response(&mut h.rx).await, (id, NO_ERROR));
    assert_eq!(next_close(&mut h.rx).await, CLOSE_OK);
    assert_eq!(h.handler.state(), PushState::Cancel);

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(h.transport.pushes().is_empty());
    assert_eq!(h.registry.open_sessions(), 0);
}

#[tokio::test]
async fn test_push_connection_closed_mid_transfer() {
    let mut h = harness();
    let id = open(&mut h, "big.bin", 100).await;
    h.handler.handle_request(append(id, b"part")).await.unwrap();
    assert_eq!(next_response(&mut h.rx).await, (id, NO_ERROR));
    assert_eq!(h.registry.open_sessions(), 1);

    h.handler.on_close();
    assert!(h.handler.is_released());
    assert_eq!(h.registry.open_sessions(), 0);

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(h.transport.pushes().is_empty());
}

#[tokio::test]
async fn test_push_ids_wrap_around() {
    let registry = Arc::new(PushRegistry::starting_at(u32::MAX));

    let mut first = harness_with(Arc::clone(&registry));
    first.handler.handle_request(PushRequest::New).await.unwrap();
    assert_eq!(next_response(&mut first.rx).await, (0xffff, NEW_PUSH_ID));
    assert_eq!(first.handler.session().map(|s| s.id), Some(u32::MAX));

    let mut second = harness_with(Arc::clone(&registry));
    second.handler.handle_request(PushRequest::New).await.unwrap();
    assert_eq!(next_response(&mut second.rx).await, (1, NEW_PUSH_ID));
    assert_eq!(registry.open_sessions(), 2);
}

#[tokio::test]
async fn test_push_truncated_start_frame() {
    let mut h = harness();
    h.handler.handle_frame(&[PushState::New as u8]).await.unwrap();
    let (id, _) = next_response(&mut h.rx).await;

    // Name length 10 with only two name bytes present
    let mut frame = vec![PushState::Start as u8];
    frame.extend_from_slice(&id.to_be_bytes());
    frame.extend_from_slice(&5u32.to_be_bytes());
    frame.extend_from_slice(&10u16.to_be_bytes());
    frame.extend_from_slice(b"ab");

    assert!(h.handler.handle_frame(&frame).await.is_err());
    assert_eq!(next_response(&mut h.rx).await, (id, ERROR_INVALID_NAME));
    assert_eq!(next_close(&mut h.rx).await, CLOSE_FAILED);
    assert!(h.transport.pushes().is_empty());
}
