//! End-to-end behavior of the connection manager against a scripted server

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use bytes::Bytes;
use common::{
    advertisement, connected, connected_with, empty_message_update, id_update, mock_transport,
    options, record, send_result, wait_for_state,
};
use rand::RngCore;
use relay_protocol::config::ConnectionConfig;
use relay_protocol::core::packer::Packer;
use relay_protocol::error::{
    AttachmentRequestErrorCode, ConnectionErrorCode, MessageError, MessageErrorCode,
};
use relay_protocol::protocol::message::ConversationTarget;
use relay_protocol::protocol::nht::{
    NHT_ATTACHMENT_REQ, NHT_CONVERSATION_UPDATE, NHT_ID_RETRIEVAL,
    NHT_SEND_FILE_EXISTING, NHT_SEND_TEXT_EXISTING,
};
use relay_protocol::protocol::transfer::{content_hash, FileUpload};
use relay_protocol::service::correlation::{DownloadEvent, UploadEvent};
use relay_protocol::service::events::ConnectionEvent;
use relay_protocol::service::manager::{ConnectionManager, ConnectionState};
use relay_protocol::utils::compression::deflate;
use relay_protocol::utils::time::unix_millis;
use std::time::Duration;
use tokio::time::Instant;

fn chat() -> ConversationTarget {
    ConversationTarget::linked("iMessage;-;+15550100")
}

/// Send a text in the background and wait until it reaches the server
async fn pending_message(
    manager: &ConnectionManager,
    server: &mut common::MockServer,
    text: &str,
) -> (i16, tokio::task::JoinHandle<Result<(), MessageError>>) {
    let sender = manager.clone();
    let text = text.to_string();
    let task = tokio::spawn(async move { sender.send_message(chat(), text).await });
    let mut packet = server.expect_packet(NHT_SEND_TEXT_EXISTING).await;
    (packet.unpack_short().unwrap(), task)
}

fn download_chunk(
    request_id: i16,
    index: i32,
    header: Option<(&str, &str, i64)>,
    is_last: bool,
    data: &[u8],
) -> Bytes {
    let mut packer = Packer::new();
    packer.pack_int(NHT_ATTACHMENT_REQ);
    packer.pack_short(request_id);
    packer.pack_int(index);
    if let Some((name, mime_type, length)) = header {
        packer.pack_nullable_string(Some(name));
        packer.pack_nullable_string(Some(mime_type));
        packer.pack_long(length);
    }
    packer.pack_bool(is_last);
    packer.pack_payload(data);
    packer.take()
}

#[tokio::test]
async fn test_connects_and_reports_server_info() {
    let (manager, _server) = connected(6).await;

    assert!(manager.is_connected());
    assert_eq!(manager.active_version().await, Some((5, 6)));

    let info = manager.server_info().await.unwrap();
    assert_eq!(info.device_name, "Office Mac");
    assert_eq!(info.software_version, "1.9.0");
    assert!(info.supports_face_time);
    assert!(manager.events().face_time_supported.get());
}

#[tokio::test]
async fn test_send_message_resolves_on_result() {
    let (manager, mut server) = connected(6).await;

    let (request_id, task) = pending_message(&manager, &mut server, "Hello").await;
    assert_eq!(manager.pending_requests().await, 1);

    server.deliver(send_result(request_id, 0));
    assert_eq!(task.await.unwrap(), Ok(()));
    assert_eq!(manager.pending_requests().await, 0);

    let (request_id, task) = pending_message(&manager, &mut server, "Again").await;
    server.deliver(send_result(request_id, 3));
    assert_eq!(
        task.await.unwrap().unwrap_err().code,
        MessageErrorCode::ServerUnauthorized
    );
}

#[tokio::test]
async fn test_requests_rejected_while_disconnected() {
    let (transport, _server) = mock_transport();
    let manager = ConnectionManager::spawn(transport, options());

    let error = manager.send_message(chat(), "Hello").await.unwrap_err();
    assert_eq!(error.code, MessageErrorCode::LocalNetwork);
    assert!(manager.fetch_conversations().await.is_err());
    assert_eq!(
        manager.fetch_attachment("attachment").result.await,
        Err(AttachmentRequestErrorCode::Timeout)
    );
    assert!(!manager.install_remote_update(1).await);
    assert_eq!(manager.pending_requests().await, 0);
}

/// Drop a connection with three requests in flight and follow the passive reconnect
async fn drop_rejects_pending_and_reconnects(reason: ConnectionErrorCode) {
    let (manager, mut server) = connected(6).await;
    let (_subscription, mut events) = record(&manager.events().connection);

    let mut tasks = Vec::new();
    for text in ["one", "two", "three"] {
        tasks.push(pending_message(&manager, &mut server, text).await.1);
    }
    assert_eq!(manager.pending_requests().await, 3);

    let dropped_at = Instant::now();
    server.close(reason);
    for task in tasks {
        let error = task.await.unwrap().unwrap_err();
        assert_eq!(error.code, MessageErrorCode::LocalNetwork);
    }
    assert_eq!(events.recv().await, Some(ConnectionEvent::Close(reason)));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.pending_requests().await, 0);

    server.wait_started().await;
    assert!(dropped_at.elapsed() >= Duration::from_secs(8));
    assert_eq!(server.starts(), 2);
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    // A passive attempt stays silent until the server authenticates us
    server.handshake(6).await;
    wait_for_state(&manager, ConnectionState::Connected).await;
    assert_eq!(events.recv().await, Some(ConnectionEvent::Open));
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_connection_drop_rejects_pending_and_reconnects_passively() {
    drop_rejects_pending_and_reconnects(ConnectionErrorCode::Connection).await;
}

#[tokio::test(start_paused = true)]
async fn test_internet_drop_rejects_pending_and_reconnects_passively() {
    drop_rejects_pending_and_reconnects(ConnectionErrorCode::Internet).await;
}

#[tokio::test(start_paused = true)]
async fn test_fatal_close_during_passive_reconnect_is_reported() {
    let (manager, server) = connected(6).await;
    let (_subscription, mut events) = record(&manager.events().connection);

    server.close(ConnectionErrorCode::Connection);
    assert_eq!(
        events.recv().await,
        Some(ConnectionEvent::Close(ConnectionErrorCode::Connection))
    );

    server.wait_started().await;
    server.open();
    server.deliver(advertisement(6, 1, false));
    assert_eq!(
        events.recv().await,
        Some(ConnectionEvent::Close(ConnectionErrorCode::ClientOutdated))
    );

    // Fatal reasons are not retried
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(server.starts(), 2);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(events.try_recv().is_err());

    // A later explicit connect is visible again
    manager.connect();
    assert_eq!(events.recv().await, Some(ConnectionEvent::Connecting));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_requests_missed_messages() {
    let (manager, mut server) = connected(6).await;
    let (_subscription, mut updates) = record(&manager.events().message_updates);

    server.deliver(id_update(42));
    server.deliver(empty_message_update());
    updates.recv().await.unwrap();
    let before_drop = unix_millis();

    server.close(ConnectionErrorCode::Connection);
    server.wait_started().await;
    server.handshake(6).await;

    let mut request = server.expect_packet(NHT_ID_RETRIEVAL).await;
    assert_eq!(request.unpack_long().unwrap(), 42);
    let lower = request.unpack_long().unwrap();
    let upper = request.unpack_long().unwrap();
    assert!(lower <= before_drop);
    assert!(upper >= lower);
    assert!(manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_settles_request_once() {
    let (manager, mut server) = connected(6).await;

    let (request_id, task) = pending_message(&manager, &mut server, "Hello").await;
    tokio::time::sleep(Duration::from_secs(11)).await;

    let error = task.await.unwrap().unwrap_err();
    assert_eq!(error.code, MessageErrorCode::LocalNetwork);
    assert_eq!(manager.pending_requests().await, 0);

    // A late reply for the expired request is ignored
    server.deliver(send_result(request_id, 0));
    assert_eq!(manager.pending_requests().await, 0);
    assert!(manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_version_mismatch_is_fatal() {
    let (transport, server) = mock_transport();
    let manager = ConnectionManager::spawn(transport, options());
    let (_subscription, mut events) = record(&manager.events().connection);

    manager.connect();
    server.wait_started().await;
    server.open();
    server.deliver(advertisement(6, 1, false));

    assert_eq!(events.recv().await, Some(ConnectionEvent::Connecting));
    assert_eq!(
        events.recv().await,
        Some(ConnectionEvent::Close(ConnectionErrorCode::ClientOutdated))
    );

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(server.starts(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_deadline_closes_with_internet() {
    let (transport, server) = mock_transport();
    let manager = ConnectionManager::spawn(transport, options());
    let (_subscription, mut events) = record(&manager.events().connection);

    manager.connect();
    server.wait_started().await;
    server.open();

    assert_eq!(events.recv().await, Some(ConnectionEvent::Connecting));
    let opened_at = Instant::now();
    assert_eq!(
        events.recv().await,
        Some(ConnectionEvent::Close(ConnectionErrorCode::Internet))
    );
    assert!(opened_at.elapsed() >= Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_reconnect() {
    let (manager, server) = connected(6).await;
    let (_subscription, mut events) = record(&manager.events().connection);

    manager.set_auto_reconnect(false);
    manager.disconnect();
    assert_eq!(
        events.recv().await,
        Some(ConnectionEvent::Close(ConnectionErrorCode::Internet))
    );

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(server.starts(), 1);
}

#[tokio::test]
async fn test_network_offline_and_online() {
    let (manager, server) = connected(6).await;

    manager.network_offline();
    wait_for_state(&manager, ConnectionState::Disconnected).await;
    assert!(!server.is_running());

    manager.network_online();
    wait_for_state(&manager, ConnectionState::Connecting).await;
    assert_eq!(server.starts(), 2);
}

#[tokio::test]
async fn test_upload_is_chunked_in_order() {
    let (manager, mut server) = connected(6).await;

    let mut data = vec![0u8; 5 * 1024 * 1024];
    rand::rng().fill_bytes(&mut data);
    let hash = content_hash(&data);

    let mut transfer = manager.send_file(chat(), FileUpload::new("video.mov", data.clone()));

    let mut request_id = None;
    let mut flags = Vec::new();
    for expected_index in 0..3 {
        let mut packet = server.expect_packet(NHT_SEND_FILE_EXISTING).await;
        let id = packet.unpack_short().unwrap();
        assert_eq!(*request_id.get_or_insert(id), id);
        assert_eq!(packet.unpack_int().unwrap(), expected_index);
        flags.push(packet.unpack_bool().unwrap());
        assert!(!packet.unpack_payload().unwrap().is_empty());
        if expected_index == 0 {
            assert_eq!(packet.unpack_string().unwrap(), "video.mov");
            assert_eq!(packet.unpack_string().unwrap(), "iMessage;-;+15550100");
        }
    }
    assert_eq!(flags, vec![false, false, true]);

    let mut progress = Vec::new();
    for _ in 0..4 {
        progress.push(transfer.progress.recv().await.unwrap());
    }
    assert_eq!(
        progress,
        vec![
            UploadEvent::Progress(2 * 1024 * 1024),
            UploadEvent::Progress(4 * 1024 * 1024),
            UploadEvent::Progress(5 * 1024 * 1024),
            UploadEvent::Complete { hash },
        ]
    );

    server.deliver(send_result(request_id.unwrap(), 0));
    assert_eq!(transfer.result.await, Ok(()));
}

#[tokio::test]
async fn test_download_is_reassembled() {
    let (manager, mut server) = connected(6).await;

    let original: Vec<u8> = (0..300_000u32).flat_map(|i| (i % 251).to_le_bytes()).collect();
    let compressed = deflate(&original).unwrap();
    let third = compressed.len() / 3;
    let pieces = [
        &compressed[..third],
        &compressed[third..2 * third],
        &compressed[2 * third..],
    ];

    let mut transfer = manager.fetch_attachment("attachment-guid");
    let mut request = server.expect_packet(NHT_ATTACHMENT_REQ).await;
    let request_id = request.unpack_short().unwrap();
    assert!(request.unpack_int().unwrap() > 0);
    assert_eq!(request.unpack_string().unwrap(), "attachment-guid");

    let header = ("photo.png", "image/png", original.len() as i64);
    server.deliver(download_chunk(request_id, 0, Some(header), false, pieces[0]));
    server.deliver(download_chunk(request_id, 1, None, false, pieces[1]));
    server.deliver(download_chunk(request_id, 2, None, true, pieces[2]));

    let result = transfer.result.await.unwrap();
    assert_eq!(result.file_name.as_deref(), Some("photo.png"));
    assert_eq!(result.mime_type.as_deref(), Some("image/png"));
    assert_eq!(result.data, original);

    assert_eq!(
        transfer.progress.recv().await,
        Some(DownloadEvent::Size(original.len() as u64))
    );
    let mut offsets = Vec::new();
    while let Some(DownloadEvent::Downloaded(offset)) = transfer.progress.recv().await {
        offsets.push(offset);
    }
    assert_eq!(offsets.len(), 3);
    assert_eq!(offsets.last().copied(), Some(compressed.len() as u64));
    assert!(offsets.windows(2).all(|pair| pair[0] < pair[1]));
}

#[tokio::test]
async fn test_out_of_order_download_chunk_fails() {
    let (manager, mut server) = connected(6).await;

    let transfer = manager.fetch_attachment("attachment-guid");
    let request_id = server
        .expect_packet(NHT_ATTACHMENT_REQ)
        .await
        .unpack_short()
        .unwrap();

    server.deliver(download_chunk(request_id, 1, None, true, b"late"));
    assert_eq!(
        transfer.result.await,
        Err(AttachmentRequestErrorCode::BadResponse)
    );
    assert_eq!(manager.pending_requests().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_download_times_out_between_chunks() {
    let (manager, mut server) = connected(6).await;

    let compressed = deflate(&[7u8; 4096]).unwrap();
    let (first, rest) = compressed.split_at(compressed.len() / 2);

    let transfer = manager.fetch_attachment("attachment-guid");
    let request_id = server
        .expect_packet(NHT_ATTACHMENT_REQ)
        .await
        .unpack_short()
        .unwrap();

    // Each chunk restarts the inactivity timer
    tokio::time::sleep(Duration::from_secs(6)).await;
    let header = ("note.txt", "text/plain", 4096);
    server.deliver(download_chunk(request_id, 0, Some(header), false, first));
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(manager.pending_requests().await, 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transfer.result.await, Err(AttachmentRequestErrorCode::Timeout));
    assert_eq!(manager.pending_requests().await, 0);

    // The rest of the stream arriving late is ignored
    server.deliver(download_chunk(request_id, 1, None, true, rest));
    assert_eq!(manager.pending_requests().await, 0);
    assert!(manager.is_connected());
}

#[tokio::test]
async fn test_download_without_inflation_returns_stream() {
    let config = ConnectionConfig {
        inflate_downloads: false,
        ..ConnectionConfig::default()
    };
    let (manager, mut server) = connected_with(options().with_config(config), 6).await;

    let transfer = manager.fetch_attachment("attachment-guid");
    let request_id = server
        .expect_packet(NHT_ATTACHMENT_REQ)
        .await
        .unpack_short()
        .unwrap();

    let header = ("archive.bin", "application/octet-stream", 9);
    server.deliver(download_chunk(request_id, 0, Some(header), false, b"raw"));
    server.deliver(download_chunk(request_id, 1, None, true, b"bytes"));

    let result = transfer.result.await.unwrap();
    assert_eq!(result.file_name.as_deref(), Some("archive.bin"));
    assert_eq!(result.data, b"rawbytes");
}

#[tokio::test]
async fn test_conversation_info_callers_share_reply() {
    let (manager, mut server) = connected(6).await;

    let guids = vec!["chat-a".to_string(), "chat-b".to_string()];
    let first = tokio::spawn({
        let manager = manager.clone();
        let guids = guids.clone();
        async move { manager.fetch_conversation_info(guids).await }
    });
    server.expect_packet(NHT_CONVERSATION_UPDATE).await;
    let second = tokio::spawn({
        let manager = manager.clone();
        let guids = guids.clone();
        async move { manager.fetch_conversation_info(guids).await }
    });
    server.expect_packet(NHT_CONVERSATION_UPDATE).await;
    assert_eq!(manager.pending_requests().await, 2);

    let mut packer = Packer::new();
    packer.pack_int(NHT_CONVERSATION_UPDATE);
    packer.pack_array_header(2);
    for guid in &guids {
        packer.pack_string(guid);
        packer.pack_bool(false);
    }
    server.deliver(packer.take());

    for task in [first, second] {
        let conversations = task.await.unwrap().unwrap();
        let received: Vec<_> = conversations.iter().map(|c| c.guid.clone()).collect();
        assert_eq!(received, guids);
    }
}

#[tokio::test]
async fn test_shortened_timeouts_from_config() {
    let config = ConnectionConfig {
        request_timeout: Duration::from_millis(200),
        ..ConnectionConfig::default()
    };
    let (manager, mut server) = connected_with(options().with_config(config), 4).await;
    assert_eq!(manager.active_version().await, Some((5, 4)));

    let (_, task) = pending_message(&manager, &mut server, "Hello").await;
    let error = task.await.unwrap().unwrap_err();
    assert_eq!(error.code, MessageErrorCode::LocalNetwork);
    assert!(manager.is_connected());
}
