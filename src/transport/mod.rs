//! # Transport Layer
//!
//! Byte-stream channels between the client and the server.
//!
//! The protocol layer only sees the [`Transport`] trait: it starts and stops the
//! channel, queues outgoing packets and receives [`TransportEvent`]s. Each
//! implementation owns its own envelope framing and its encryption queues.
//!
//! ## Implementations
//! - **Relay**: websocket to the relay service, authenticated with a bearer token
//! - **Direct**: TCP socket to the server, with a fallback address
//! - **Bridge**: a socket owned by the host application, driven over channels
//!
//! ## Ordering
//! Outgoing encryption and incoming decryption each run through a strict FIFO
//! [`TaskQueue`](crate::utils::task_queue::TaskQueue), so packets are written and
//! delivered in the order they were submitted.

pub mod bridge;
pub mod direct;
pub mod relay;

use crate::error::ConnectionErrorCode;
use bytes::Bytes;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Set by the protocol layer once it knows whether the server requires encryption
pub type EncryptionFlag = Arc<AtomicBool>;

/// Channel a transport reports its events on
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Relay,
    Direct,
    Bridge,
}

/// Something that happened on the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The channel is ready for the protocol handshake
    Open,
    /// A whole message; `secure` is true when it arrived over the authenticated channel
    Message { data: Bytes, secure: bool },
    /// The channel closed; no further events follow until the next start
    Close(ConnectionErrorCode),
}

/// A byte-stream channel to the server
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Open the channel, reporting events on `events`
    ///
    /// A fresh sender is supplied on every start; events for an older start must
    /// not be sent on the new one.
    fn start(&mut self, events: EventSender);

    /// Close the channel; a `Close` event follows
    fn stop(&mut self);

    /// Queue a packet, encrypting it if `encrypt` is set and the server requires encryption
    ///
    /// Returns `false` if the channel is not started.
    fn send(&mut self, data: Bytes, encrypt: bool) -> bool;

    /// The flag the protocol layer sets when the server requires encryption
    fn encryption(&self) -> EncryptionFlag;

    /// Register (`add = true`) or remove a push notification token
    ///
    /// Only meaningful for transports that talk to a push-capable relay.
    fn send_push_token(&mut self, _token: &str, _add: bool) -> bool {
        false
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    fn start(&mut self, events: EventSender) {
        (**self).start(events)
    }

    fn stop(&mut self) {
        (**self).stop()
    }

    fn send(&mut self, data: Bytes, encrypt: bool) -> bool {
        (**self).send(data, encrypt)
    }

    fn encryption(&self) -> EncryptionFlag {
        (**self).encryption()
    }

    fn send_push_token(&mut self, token: &str, add: bool) -> bool {
        (**self).send_push_token(token, add)
    }
}
