//! Packets keep their order through the encryption queues

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use bytes::Bytes;
use relay_protocol::service::credentials::{MemoryStore, StoreKey};
use relay_protocol::transport::bridge::{BridgeCommand, BridgeHost, BridgeSignal, BridgeTransport};
use relay_protocol::transport::{Transport, TransportEvent};
use relay_protocol::utils::crypto::{PasswordCipher, SharedCipher};
use relay_protocol::ConnectionErrorCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;

const PASSWORD: &str = "correct horse";

fn bridge() -> (BridgeTransport, BridgeHost) {
    let store = MemoryStore::new().with(StoreKey::ServerAddress, "10.0.0.2:1400");
    BridgeTransport::new(Arc::new(store), SharedCipher::with_password(PASSWORD), 1359)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_outgoing_encryption_preserves_order() {
    let (mut transport, mut host) = bridge();
    let (events, _receiver) = mpsc::unbounded_channel();
    transport.start(events);
    assert_eq!(
        host.next_command().await,
        Some(BridgeCommand::Connect {
            host: "10.0.0.2".to_string(),
            port: 1400
        })
    );
    transport.encryption().store(true, Ordering::SeqCst);

    let count = 24u32;
    for i in 0..count {
        let payload = vec![i as u8; 1 + (i as usize * 997) % 4096];
        // Alternate plain and encrypted packets; both share one queue
        assert!(transport.send(Bytes::from(payload), i % 3 != 0));
    }

    let cipher = PasswordCipher::new(PASSWORD);
    for i in 0..count {
        let Some(BridgeCommand::Send(frame)) = host.next_command().await else {
            panic!("expected a frame");
        };
        assert_eq!(frame.encrypted, i % 3 != 0);
        let payload = if frame.encrypted {
            cipher.decrypt(&frame.payload).unwrap()
        } else {
            frame.payload.to_vec()
        };
        assert_eq!(payload.len(), 1 + (i as usize * 997) % 4096);
        assert!(payload.iter().all(|byte| *byte == i as u8));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_incoming_decryption_preserves_order_and_close() {
    let (mut transport, mut host) = bridge();
    let handle = host.handle();
    let (events, mut receiver) = mpsc::unbounded_channel();
    transport.start(events);
    host.next_command().await.unwrap();
    handle.signal(BridgeSignal::Connected);
    assert_eq!(receiver.recv().await, Some(TransportEvent::Open));
    transport.encryption().store(true, Ordering::SeqCst);

    let cipher = PasswordCipher::new(PASSWORD);
    let count = 16u8;
    for i in 0..count {
        let data = cipher.encrypt(&[i; 32]).unwrap();
        handle.signal(BridgeSignal::Message {
            data: Bytes::from(data),
            encrypted: true,
        });
    }
    // The close must not overtake the packets still being decrypted
    handle.signal(BridgeSignal::Disconnected);

    for i in 0..count {
        assert_eq!(
            receiver.recv().await,
            Some(TransportEvent::Message {
                data: Bytes::from(vec![i; 32]),
                secure: true
            })
        );
    }
    assert_eq!(
        receiver.recv().await,
        Some(TransportEvent::Close(ConnectionErrorCode::Connection))
    );
}

#[tokio::test]
async fn test_plain_packet_is_insecure_once_encryption_is_required() {
    let (mut transport, mut host) = bridge();
    let handle = host.handle();
    let (events, mut receiver) = mpsc::unbounded_channel();
    transport.start(events);
    host.next_command().await.unwrap();
    handle.signal(BridgeSignal::Connected);
    receiver.recv().await.unwrap();

    transport.encryption().store(true, Ordering::SeqCst);
    handle.signal(BridgeSignal::Message {
        data: Bytes::from_static(b"plain"),
        encrypted: false,
    });
    assert_eq!(
        receiver.recv().await,
        Some(TransportEvent::Message {
            data: Bytes::from_static(b"plain"),
            secure: false
        })
    );
}
