//! End-to-end tests of the page server coordinator over in-memory channels.

#![allow(clippy::unwrap_used)]

use bytes::Bytes;
use pageserver::{Collaborators, Config, MemoryStore, PageServer, SinkRegistry};
use ps_core::{LogPosition, PageServerError};
use ps_network::{ConnectionBuffer, Frame, PageToTranRequest, TranToPageRequest, encode_frame};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const MAX_PAYLOAD: usize = 1024 * 1024;
const WAIT: Duration = Duration::from_secs(5);

struct TestClient {
    stream: DuplexStream,
    buffer: ConnectionBuffer,
}

impl TestClient {
    fn pair() -> (Self, DuplexStream) {
        let (client, server) = tokio::io::duplex(256 * 1024);
        (
            Self {
                stream: client,
                buffer: ConnectionBuffer::new(MAX_PAYLOAD),
            },
            server,
        )
    }

    async fn request(&mut self, kind: TranToPageRequest, rid: u64, payload: Bytes) {
        let frame = Frame::new_request(kind, rid, payload);
        self.stream.write_all(&encode_frame(&frame)).await.unwrap();
    }

    async fn send_raw(&mut self, frame: Frame) {
        self.stream.write_all(&encode_frame(&frame)).await.unwrap();
    }

    /// Next frame from the page server, `None` once the server closed.
    async fn recv(&mut self) -> Option<Frame> {
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            if let Some(frame) = self.buffer.next_frame().unwrap() {
                return Some(frame);
            }

            let n = tokio::time::timeout(WAIT, self.stream.read(&mut chunk))
                .await
                .expect("timed out waiting for a frame")
                .unwrap_or(0);
            if n == 0 {
                return None;
            }
            self.buffer.extend(&chunk[..n]);
        }
    }

    async fn expect_closed(&mut self) {
        while let Some(frame) = self.recv().await {
            assert!(
                frame.kind() != PageToTranRequest::SendToPtsLogPriorList as u8,
                "unexpected push on a closing channel"
            );
        }
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.storage.perm_volume_count = 3;
    config.storage.page_size = 512;
    config.replication.parallel_count = 2;
    config.responder.drain_timeout_secs = 5;
    config
}

fn setup() -> (Arc<PageServer>, Arc<MemoryStore>) {
    let config = test_config();
    let store = Arc::new(MemoryStore::new(&config.storage, Arc::new(SinkRegistry::new())));
    let server = PageServer::new(&config, Collaborators::memory(Arc::clone(&store)));
    (server, store)
}

async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn data_page_request(volume: i32, page: i32) -> Bytes {
    let mut buf = Vec::new();
    buf.extend_from_slice(&volume.to_le_bytes());
    buf.extend_from_slice(&page.to_le_bytes());
    Bytes::from(buf)
}

async fn start_log_prior_dispatch(client: &mut TestClient, rid: u64) -> LogPosition {
    client
        .request(TranToPageRequest::SendLogBootInfoFetch, rid, Bytes::new())
        .await;
    let response = client.recv().await.unwrap();
    assert!(response.is_response());
    assert!(!response.is_error());
    assert_eq!(response.rid(), rid);
    LogPosition::from_le_slice(&response.payload).unwrap()
}

async fn expect_push(client: &mut TestClient, payload: &'static [u8]) {
    let frame = client.recv().await.unwrap();
    assert_eq!(frame.kind(), PageToTranRequest::SendToPtsLogPriorList as u8);
    assert!(!frame.is_response());
    assert_eq!(frame.payload, Bytes::from_static(payload));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_boot_info_is_answered_synchronously() {
    let (server, _store) = setup();
    let (mut client, stream) = TestClient::pair();
    server.set_active_connection(stream, "ats").await;

    client.request(TranToPageRequest::GetBootInfo, 7, Bytes::new()).await;
    let response = client.recv().await.unwrap();

    assert!(response.is_response());
    assert_eq!(response.rid(), 7);
    assert_eq!(response.payload.as_ref(), &3i32.to_le_bytes());

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_responses_keep_correlation_ids() {
    let (server, _store) = setup();
    let (mut client, stream) = TestClient::pair();
    server.set_passive_connection(stream, "pts").await;

    for rid in 100..110u64 {
        client
            .request(
                TranToPageRequest::SendDataPageFetch,
                rid,
                data_page_request(1, rid as i32),
            )
            .await;
    }

    let mut seen = Vec::new();
    for _ in 0..10 {
        let frame = client.recv().await.unwrap();
        assert!(frame.is_response());
        assert!(!frame.is_error());
        assert_eq!(frame.payload.len(), 512);
        // Page header echoes the page id requested under this rid
        assert_eq!(&frame.payload[4..8], &(frame.rid() as i32).to_le_bytes());
        seen.push(frame.rid());
    }
    seen.sort_unstable();
    assert_eq!(seen, (100..110).collect::<Vec<_>>());

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_upstream_error_keeps_connection_usable() {
    let (server, _store) = setup();
    let (mut client, stream) = TestClient::pair();
    server.set_passive_connection(stream, "pts").await;

    client
        .request(
            TranToPageRequest::SendLogPageFetch,
            21,
            Bytes::copy_from_slice(&9u64.to_le_bytes()),
        )
        .await;
    let error = client.recv().await.unwrap();
    assert!(error.is_error());
    assert_eq!(error.rid(), 21);

    client.request(TranToPageRequest::GetBootInfo, 22, Bytes::new()).await;
    let response = client.recv().await.unwrap();
    assert!(!response.is_error());
    assert_eq!(response.rid(), 22);
    assert_eq!(server.passive_connection_count().await, 1);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_passive_log_prior_dispatch_lifecycle() {
    let (server, store) = setup();
    let sinks = store.sinks();

    let (mut active, active_stream) = TestClient::pair();
    let (mut passive, passive_stream) = TestClient::pair();
    server.set_active_connection(active_stream, "ats").await;
    server.set_passive_connection(passive_stream, "pts").await;

    let position = start_log_prior_dispatch(&mut passive, 1).await;
    assert_eq!(position, LogPosition::START);
    assert_eq!(sinks.sink_count(), 1);

    active
        .request(TranToPageRequest::SendLogPriorList, 0, Bytes::from_static(b"A"))
        .await;
    active
        .request(TranToPageRequest::SendLogPriorList, 0, Bytes::from_static(b"B"))
        .await;
    expect_push(&mut passive, b"A").await;
    expect_push(&mut passive, b"B").await;

    passive
        .request(TranToPageRequest::SendStopLogPriorDispatch, 2, Bytes::new())
        .await;
    let stopped = passive.recv().await.unwrap();
    assert!(stopped.is_response());
    assert_eq!(stopped.rid(), 2);
    assert!(stopped.payload.is_empty());
    assert_eq!(sinks.sink_count(), 0);

    active
        .request(TranToPageRequest::SendLogPriorList, 0, Bytes::from_static(b"C"))
        .await;
    let store_ref = Arc::clone(&store);
    eventually("third chunk stored", || {
        let store = Arc::clone(&store_ref);
        async move { store.next_position() == LogPosition::new(3) }
    })
    .await;

    // Nothing was pushed for C; the next frame is the boot info answer
    passive.request(TranToPageRequest::GetBootInfo, 3, Bytes::new()).await;
    let next = passive.recv().await.unwrap();
    assert!(next.is_response());
    assert_eq!(next.rid(), 3);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_active_drop_keeps_passive_sinks() {
    let (server, store) = setup();
    let sinks = store.sinks();

    let (mut first, first_stream) = TestClient::pair();
    let (mut second, second_stream) = TestClient::pair();
    server.set_passive_connection(first_stream, "pts-1").await;
    server.set_passive_connection(second_stream, "pts-2").await;
    start_log_prior_dispatch(&mut first, 1).await;
    start_log_prior_dispatch(&mut second, 1).await;
    assert_eq!(sinks.sink_count(), 2);

    let (mut active, active_stream) = TestClient::pair();
    server.set_active_connection(active_stream, "ats").await;
    active
        .request(TranToPageRequest::SendLogPriorList, 0, Bytes::from_static(b"X"))
        .await;
    expect_push(&mut first, b"X").await;
    expect_push(&mut second, b"X").await;

    drop(active);
    let server_ref = Arc::clone(&server);
    eventually("active connection removed", || {
        let server = Arc::clone(&server_ref);
        async move { !server.is_active_tran_server_connected().await }
    })
    .await;

    assert_eq!(server.passive_connection_count().await, 2);
    assert_eq!(sinks.sink_count(), 2);

    let (mut replacement, replacement_stream) = TestClient::pair();
    server.set_active_connection(replacement_stream, "ats").await;
    replacement
        .request(TranToPageRequest::SendLogPriorList, 0, Bytes::from_static(b"Y"))
        .await;
    expect_push(&mut first, b"Y").await;
    expect_push(&mut second, b"Y").await;

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_request_closes_connection() {
    let (server, _store) = setup();
    let (mut client, stream) = TestClient::pair();
    server.set_passive_connection(stream, "pts").await;

    client.send_raw(Frame::new(0x42, 0, 5, Bytes::new())).await;
    client.expect_closed().await;

    let server_ref = Arc::clone(&server);
    eventually("passive connection removed", || {
        let server = Arc::clone(&server_ref);
        async move { server.passive_connection_count().await == 0 }
    })
    .await;

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_role_mismatch_closes_connection() {
    let (server, store) = setup();
    let (mut passive, passive_stream) = TestClient::pair();
    let (mut active, active_stream) = TestClient::pair();
    server.set_passive_connection(passive_stream, "pts").await;
    server.set_active_connection(active_stream, "ats").await;

    // Only the active transaction server produces log prior lists
    passive
        .request(TranToPageRequest::SendLogPriorList, 0, Bytes::from_static(b"bogus"))
        .await;
    passive.expect_closed().await;
    assert_eq!(store.next_position(), LogPosition::START);

    // Only passive transaction servers subscribe to them
    active
        .request(TranToPageRequest::SendLogBootInfoFetch, 1, Bytes::new())
        .await;
    active.expect_closed().await;

    let server_ref = Arc::clone(&server);
    eventually("both connections removed", || {
        let server = Arc::clone(&server_ref);
        async move {
            server.passive_connection_count().await == 0
                && !server.is_active_tran_server_connected().await
        }
    })
    .await;
    assert_eq!(store.sinks().sink_count(), 0);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_boot_info_fetch_tears_down() {
    let (server, store) = setup();
    let (mut client, stream) = TestClient::pair();
    server.set_passive_connection(stream, "pts").await;

    start_log_prior_dispatch(&mut client, 1).await;
    client
        .request(TranToPageRequest::SendLogBootInfoFetch, 2, Bytes::new())
        .await;
    client.expect_closed().await;

    let server_ref = Arc::clone(&server);
    eventually("passive connection removed", || {
        let server = Arc::clone(&server_ref);
        async move { server.passive_connection_count().await == 0 }
    })
    .await;
    assert_eq!(store.sinks().sink_count(), 0);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_without_dispatch_tears_down_only_that_connection() {
    let (server, _store) = setup();
    let (mut bad, bad_stream) = TestClient::pair();
    let (mut good, good_stream) = TestClient::pair();
    server.set_passive_connection(bad_stream, "pts-bad").await;
    server.set_passive_connection(good_stream, "pts-good").await;

    bad.request(TranToPageRequest::SendStopLogPriorDispatch, 1, Bytes::new())
        .await;
    bad.expect_closed().await;

    let server_ref = Arc::clone(&server);
    eventually("bad connection removed", || {
        let server = Arc::clone(&server_ref);
        async move { server.passive_connection_count().await == 1 }
    })
    .await;

    good.request(TranToPageRequest::GetBootInfo, 2, Bytes::new()).await;
    assert_eq!(good.recv().await.unwrap().rid(), 2);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_graceful_disconnect() {
    let (server, _store) = setup();
    let (mut client, stream) = TestClient::pair();
    let id = server.set_passive_connection(stream, "pts").await;
    let handler = server.connection(id).await.unwrap();

    client
        .request(TranToPageRequest::SendDisconnectMsg, 0, Bytes::new())
        .await;
    client.expect_closed().await;

    let server_ref = Arc::clone(&server);
    eventually("passive connection removed", || {
        let server = Arc::clone(&server_ref);
        async move { server.passive_connection_count().await == 0 }
    })
    .await;
    assert!(handler.is_disconnecting());
    assert!(server.connection(id).await.is_none());

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_with_active_sink_tears_down() {
    let (server, store) = setup();
    let (mut client, stream) = TestClient::pair();
    server.set_passive_connection(stream, "pts").await;

    start_log_prior_dispatch(&mut client, 1).await;
    client
        .request(TranToPageRequest::SendDisconnectMsg, 0, Bytes::new())
        .await;
    client.expect_closed().await;

    let server_ref = Arc::clone(&server);
    eventually("passive connection removed", || {
        let server = Arc::clone(&server_ref);
        async move { server.passive_connection_count().await == 0 }
    })
    .await;
    assert_eq!(store.sinks().sink_count(), 0);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abnormal_disconnect_is_idempotent() {
    let (server, store) = setup();
    let (mut client, stream) = TestClient::pair();
    let id = server.set_passive_connection(stream, "pts").await;
    start_log_prior_dispatch(&mut client, 1).await;

    let handler = server.connection(id).await.unwrap();
    assert!(handler.has_sink());

    let error = PageServerError::ChannelClosed("reset by peer".into());
    let mut abort = false;
    handler.abnormal_tran_server_disconnect(&error, &mut abort);
    assert!(abort);
    assert!(!handler.has_sink());
    assert_eq!(store.sinks().sink_count(), 0);

    let mut abort_again = false;
    handler.abnormal_tran_server_disconnect(&error, &mut abort_again);
    assert!(abort_again);

    let server_ref = Arc::clone(&server);
    eventually("passive connection removed", || {
        let server = Arc::clone(&server_ref);
        async move { server.passive_connection_count().await == 0 }
    })
    .await;
    client.expect_closed().await;

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_active_replacement_closes_previous() {
    let (server, _store) = setup();
    let (mut old, old_stream) = TestClient::pair();
    let (mut new, new_stream) = TestClient::pair();

    let old_id = server.set_active_connection(old_stream, "ats-old").await;
    let new_id = server.set_active_connection(new_stream, "ats-new").await;
    assert_ne!(old_id, new_id);

    // Previous active channel is detached at once and closes in the background
    assert!(server.connection(old_id).await.is_none());
    old.expect_closed().await;
    assert!(server.is_active_tran_server_connected().await);

    server
        .push_request_to_active_tran_server(
            PageToTranRequest::SendSavedLsa,
            Bytes::copy_from_slice(&42u64.to_le_bytes()),
        )
        .await
        .unwrap();
    let push = new.recv().await.unwrap();
    assert_eq!(push.kind(), PageToTranRequest::SendSavedLsa as u8);
    assert!(!push.is_response());
    assert_eq!(push.payload.as_ref(), &42u64.to_le_bytes());

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replacing_stalled_active_does_not_block() {
    let (server, _store) = setup();

    // Peer that never reads; its writer fills the pipe and stalls
    let (_stalled, stalled_stream) = tokio::io::duplex(1024);
    let old_id = server.set_active_connection(stalled_stream, "ats-stalled").await;
    for _ in 0..64 {
        server
            .push_request_to_active_tran_server(
                PageToTranRequest::SendSavedLsa,
                Bytes::from(vec![0u8; 1024]),
            )
            .await
            .unwrap();
    }

    let (mut new, new_stream) = TestClient::pair();
    let new_id = tokio::time::timeout(
        Duration::from_secs(3),
        server.set_active_connection(new_stream, "ats-new"),
    )
    .await
    .expect("replacing the active connection waited on the previous peer");
    assert_ne!(old_id, new_id);
    assert!(server.connection(old_id).await.is_none());

    // Other transitions proceed while the stalled channel is still closing
    let (_passive, passive_stream) = TestClient::pair();
    tokio::time::timeout(
        Duration::from_secs(1),
        server.set_passive_connection(passive_stream, "pts"),
    )
    .await
    .unwrap();

    server
        .push_request_to_active_tran_server(PageToTranRequest::SendSavedLsa, Bytes::new())
        .await
        .unwrap();
    let push = new.recv().await.unwrap();
    assert_eq!(push.kind(), PageToTranRequest::SendSavedLsa as u8);

    tokio::time::timeout(Duration::from_secs(5), server.shutdown())
        .await
        .expect("shutdown waited on a peer that stopped reading");
    assert_eq!(server.passive_connection_count().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_passive_disconnect_during_registration_is_removed() {
    let (server, _store) = setup();
    let mut clients = Vec::new();
    let mut ids = Vec::new();

    // The disconnect is already on the wire when the handler starts reading
    for i in 0..100 {
        let (mut client, stream) = TestClient::pair();
        client
            .request(TranToPageRequest::SendDisconnectMsg, 0, Bytes::new())
            .await;
        ids.push(server.set_passive_connection(stream, &format!("pts-{}", i)).await);
        clients.push(client);
    }

    let server_ref = Arc::clone(&server);
    eventually("early disconnects removed", || {
        let server = Arc::clone(&server_ref);
        async move { server.passive_connection_count().await == 0 }
    })
    .await;
    for id in ids {
        assert!(server.connection(id).await.is_none());
    }
    for client in &mut clients {
        client.expect_closed().await;
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_push_without_active_connection() {
    let (server, _store) = setup();
    let result = server
        .push_request_to_active_tran_server(PageToTranRequest::SendSavedLsa, Bytes::new())
        .await;
    assert!(matches!(result, Err(PageServerError::ChannelClosed(_))));
    server.shutdown().await;
}

#[tokio::test]
async fn test_channel_ids_name_the_role() {
    let (server, _store) = setup();
    let (_active, active_stream) = TestClient::pair();
    let (_passive, passive_stream) = TestClient::pair();

    let active_id = server.set_active_connection(active_stream, "10.0.0.1:7000").await;
    let passive_id = server.set_passive_connection(passive_stream, "10.0.0.2:7000").await;

    let active = server.connection(active_id).await.unwrap();
    let passive = server.connection(passive_id).await.unwrap();
    assert!(active.channel_id().starts_with("ATS_PS_comm:10.0.0.1:7000#"));
    assert!(passive.channel_id().starts_with("PTS_PS_comm:10.0.0.2:7000#"));

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replicator_lifecycle() {
    let (server, store) = setup();
    assert!(!server.is_replicator_running().await);

    server.start_replicator(LogPosition::START).await;
    assert!(server.is_replicator_running().await);
    assert!(!server.ensure_replicator_started().await);

    let (mut active, active_stream) = TestClient::pair();
    server.set_active_connection(active_stream, "ats").await;
    for chunk in [b"r1", b"r2", b"r3"] {
        active
            .request(TranToPageRequest::SendLogPriorList, 0, Bytes::from_static(chunk))
            .await;
    }
    let store_ref = Arc::clone(&store);
    eventually("chunks stored", || {
        let store = Arc::clone(&store_ref);
        async move { store.next_position() == LogPosition::new(3) }
    })
    .await;

    server.stop_replicator().await;
    assert!(!server.is_replicator_running().await);
    assert_eq!(store.applied_count(), 3);

    server.shutdown().await;
}

#[tokio::test]
#[should_panic(expected = "replicator is already running")]
async fn test_double_start_replicator_panics() {
    let (server, _store) = setup();
    server.start_replicator(LogPosition::START).await;
    server.start_replicator(LogPosition::START).await;
}

#[tokio::test]
#[should_panic(expected = "replicator is not running")]
async fn test_stop_without_start_panics() {
    let (server, _store) = setup();
    server.stop_replicator().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_everything() {
    let (server, store) = setup();
    let (mut active, active_stream) = TestClient::pair();
    let (mut passive, passive_stream) = TestClient::pair();
    server.set_active_connection(active_stream, "ats").await;
    server.set_passive_connection(passive_stream, "pts").await;
    server.ensure_replicator_started().await;
    start_log_prior_dispatch(&mut passive, 1).await;

    server.shutdown().await;

    assert!(!server.is_active_tran_server_connected().await);
    assert_eq!(server.passive_connection_count().await, 0);
    assert!(!server.is_replicator_running().await);
    assert_eq!(store.sinks().sink_count(), 0);
    assert_eq!(server.responder_in_flight(), 0);

    active.expect_closed().await;
    passive.expect_closed().await;
}
