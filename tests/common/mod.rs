//! Shared fixtures for the integration tests: an in-memory transport and a
//! scripted server on the other end of it.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use bytes::Bytes;
use relay_protocol::core::packer::Packer;
use relay_protocol::core::unpacker::Unpacker;
use relay_protocol::error::ConnectionErrorCode;
use relay_protocol::protocol::handshake::ClientIdentity;
use relay_protocol::protocol::nht::{
    NHT_AUTHENTICATION, NHT_ID_UPDATE, NHT_INFORMATION, NHT_MESSAGE_UPDATE, NHT_SEND_RESULT,
};
use relay_protocol::service::credentials::MemoryStore;
use relay_protocol::service::events::{Observers, Subscription};
use relay_protocol::service::manager::{ConnectionManager, ConnectionState, ManagerOptions};
use relay_protocol::transport::{
    EncryptionFlag, EventSender, Transport, TransportEvent, TransportKind,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

struct Shared {
    events: Mutex<Option<EventSender>>,
    starts: AtomicUsize,
    started: Notify,
    sent: mpsc::UnboundedSender<(Bytes, bool)>,
}

/// Transport whose other end is a [`MockServer`]
pub struct MockTransport {
    shared: Arc<Shared>,
    flag: EncryptionFlag,
}

/// The server side of a [`MockTransport`]
pub struct MockServer {
    shared: Arc<Shared>,
    sent: mpsc::UnboundedReceiver<(Bytes, bool)>,
}

pub fn mock_transport() -> (MockTransport, MockServer) {
    let (sent, receiver) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        events: Mutex::new(None),
        starts: AtomicUsize::new(0),
        started: Notify::new(),
        sent,
    });
    (
        MockTransport {
            shared: shared.clone(),
            flag: EncryptionFlag::default(),
        },
        MockServer {
            shared,
            sent: receiver,
        },
    )
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Bridge
    }

    fn start(&mut self, events: EventSender) {
        self.flag.store(false, Ordering::SeqCst);
        *self.shared.events.lock().unwrap() = Some(events);
        self.shared.starts.fetch_add(1, Ordering::SeqCst);
        self.shared.started.notify_one();
    }

    fn stop(&mut self) {
        if let Some(events) = self.shared.events.lock().unwrap().take() {
            let _ = events.send(TransportEvent::Close(ConnectionErrorCode::Connection));
        }
    }

    fn send(&mut self, data: Bytes, encrypt: bool) -> bool {
        if self.shared.events.lock().unwrap().is_none() {
            return false;
        }
        self.shared.sent.send((data, encrypt)).is_ok()
    }

    fn encryption(&self) -> EncryptionFlag {
        self.flag.clone()
    }
}

impl MockServer {
    /// Wait for the next transport start
    pub async fn wait_started(&self) {
        self.shared.started.notified().await;
    }

    pub fn starts(&self) -> usize {
        self.shared.starts.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.shared.events.lock().unwrap().is_some()
    }

    fn emit(&self, event: TransportEvent) {
        let events = self.shared.events.lock().unwrap();
        let events = events.as_ref().expect("transport is not started");
        events.send(event).expect("manager dropped its event channel");
    }

    pub fn open(&self) {
        self.emit(TransportEvent::Open);
    }

    pub fn deliver(&self, data: Bytes) {
        self.emit(TransportEvent::Message { data, secure: true });
    }

    /// Drop the connection from the server side
    pub fn close(&self, reason: ConnectionErrorCode) {
        let events = self.shared.events.lock().unwrap().take();
        events
            .expect("transport is not started")
            .send(TransportEvent::Close(reason))
            .expect("manager dropped its event channel");
    }

    /// The next packet the client sent, split into its type and body
    pub async fn next_packet(&mut self) -> (i32, Unpacker) {
        let (data, _encrypt) = self.sent.recv().await.expect("transport dropped");
        let mut unpacker = Unpacker::new(data);
        let message_type = unpacker.unpack_int().unwrap();
        (message_type, unpacker)
    }

    /// The next packet of `message_type`, skipping anything else
    pub async fn expect_packet(&mut self, message_type: i32) -> Unpacker {
        loop {
            let (received, unpacker) = self.next_packet().await;
            if received == message_type {
                return unpacker;
            }
        }
    }

    pub fn try_next_packet(&mut self) -> Option<i32> {
        let (data, _) = self.sent.try_recv().ok()?;
        Unpacker::new(data).unpack_int().ok()
    }

    /// Open the transport and authenticate the client
    pub async fn handshake(&mut self, sub_version: i32) {
        self.open();
        self.deliver(advertisement(5, sub_version, false));
        let mut request = self.expect_packet(NHT_AUTHENTICATION).await;
        assert_eq!(request.unpack_string().unwrap(), "installation-1");
        self.deliver(auth_ok(sub_version >= 6));
    }
}

pub fn options() -> ManagerOptions {
    ManagerOptions::new(
        ClientIdentity::new("installation-1"),
        Arc::new(MemoryStore::new()),
    )
}

/// Forward every event emitted on `observers` to a channel
pub fn record<T>(observers: &Observers<T>) -> (Subscription, mpsc::UnboundedReceiver<T>)
where
    T: Clone + Send + 'static,
{
    let (sender, receiver) = mpsc::unbounded_channel();
    let subscription = observers.subscribe(move |value: &T| {
        let _ = sender.send(value.clone());
    });
    (subscription, receiver)
}

pub async fn wait_for_state(manager: &ConnectionManager, state: ConnectionState) {
    let mut receiver = manager.watch_state();
    receiver
        .wait_for(|current| *current == state)
        .await
        .expect("manager stopped");
}

/// A manager that has finished the handshake at `sub_version`
pub async fn connected(sub_version: i32) -> (ConnectionManager, MockServer) {
    connected_with(options(), sub_version).await
}

pub async fn connected_with(
    options: ManagerOptions,
    sub_version: i32,
) -> (ConnectionManager, MockServer) {
    let (transport, mut server) = mock_transport();
    let manager = ConnectionManager::spawn(transport, options);
    manager.connect();
    server.wait_started().await;
    server.handshake(sub_version).await;
    wait_for_state(&manager, ConnectionState::Connected).await;
    (manager, server)
}

// Server packets

pub fn advertisement(major: i32, sub_version: i32, requires_auth: bool) -> Bytes {
    let mut packer = Packer::new();
    packer.pack_int(NHT_INFORMATION);
    packer.pack_int(major);
    packer.pack_int(sub_version);
    packer.pack_bool(requires_auth);
    packer.take()
}

pub fn auth_ok(extended: bool) -> Bytes {
    let mut packer = Packer::new();
    packer.pack_int(NHT_AUTHENTICATION);
    packer.pack_int(0);
    for value in ["server-1", "Office Mac", "14.4", "1.9.0"] {
        packer.pack_string(value);
    }
    if extended {
        packer.pack_string("user");
        packer.pack_bool(true);
    }
    packer.take()
}

pub fn id_update(id: i64) -> Bytes {
    let mut packer = Packer::new();
    packer.pack_int(NHT_ID_UPDATE);
    packer.pack_long(id);
    packer.take()
}

pub fn empty_message_update() -> Bytes {
    let mut packer = Packer::new();
    packer.pack_int(NHT_MESSAGE_UPDATE);
    packer.pack_array_header(0);
    packer.take()
}

pub fn send_result(request_id: i16, code: i32) -> Bytes {
    let mut packer = Packer::new();
    packer.pack_int(NHT_SEND_RESULT);
    packer.pack_short(request_id);
    packer.pack_int(code);
    packer.pack_nullable_string(None);
    packer.take()
}
