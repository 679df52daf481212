//! # Bridge Transport
//!
//! A transport whose socket is owned by the host application.
//!
//! The transport tells the host what to do through [`BridgeCommand`]s and the
//! host reports back with [`BridgeSignal`]s on a [`BridgeHandle`]. Addresses,
//! fallback and encryption behave like the
//! [direct transport](crate::transport::direct); only the socket lives elsewhere.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use relay_protocol::transport::bridge::{BridgeCommand, BridgeSignal, BridgeTransport};
//! # use relay_protocol::service::credentials::MemoryStore;
//! # use relay_protocol::utils::crypto::SharedCipher;
//! # async fn run() {
//! let (transport, mut host) = BridgeTransport::new(Arc::new(MemoryStore::new()), SharedCipher::new(), 1359);
//! let handle = host.handle();
//! while let Some(command) = host.next_command().await {
//!     match command {
//!         BridgeCommand::Connect { .. } => handle.signal(BridgeSignal::Connected),
//!         BridgeCommand::Send(_frame) => { /* write to the socket */ }
//!         BridgeCommand::Disconnect => handle.signal(BridgeSignal::Disconnected),
//!     }
//! }
//! # }
//! ```

use crate::core::codec::Frame;
use crate::error::{constants, ConnectionErrorCode};
use crate::service::credentials::SecureStore;
use crate::transport::direct::{
    close_after, queue_incoming, queue_outgoing, resolve_addresses, AddressOverride, ServerAddress,
};
use crate::transport::{EncryptionFlag, EventSender, Transport, TransportEvent, TransportKind};
use crate::utils::crypto::SharedCipher;
use crate::utils::task_queue::TaskQueue;
use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Instruction for the host application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeCommand {
    Connect { host: String, port: u16 },
    /// Write one frame to the socket
    Send(Frame),
    Disconnect,
}

/// Report from the host application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeSignal {
    Connected,
    /// The socket closed or could not be opened
    Disconnected,
    Message { data: Bytes, encrypted: bool },
}

struct BridgeSession {
    events: EventSender,
    encrypt_queue: TaskQueue,
    decrypt_queue: TaskQueue,
    fallback: Option<ServerAddress>,
    opened: bool,
    stopping: bool,
}

type SharedSession = Arc<Mutex<Option<BridgeSession>>>;

/// Transport driven by the host application
pub struct BridgeTransport {
    store: Arc<dyn SecureStore>,
    cipher: SharedCipher,
    address_override: Option<AddressOverride>,
    default_port: u16,
    encryption: EncryptionFlag,
    commands: mpsc::UnboundedSender<BridgeCommand>,
    session: SharedSession,
}

/// The host application's side of a bridge
pub struct BridgeHost {
    commands: mpsc::UnboundedReceiver<BridgeCommand>,
    handle: BridgeHandle,
}

/// Cloneable handle the host reports socket activity on
#[derive(Clone)]
pub struct BridgeHandle {
    session: SharedSession,
    commands: mpsc::UnboundedSender<BridgeCommand>,
    cipher: SharedCipher,
    encryption: EncryptionFlag,
}

impl BridgeTransport {
    pub fn new(
        store: Arc<dyn SecureStore>,
        cipher: SharedCipher,
        default_port: u16,
    ) -> (Self, BridgeHost) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let session = SharedSession::default();
        let encryption = EncryptionFlag::default();

        let host = BridgeHost {
            commands: receiver,
            handle: BridgeHandle {
                session: session.clone(),
                commands: commands.clone(),
                cipher: cipher.clone(),
                encryption: encryption.clone(),
            },
        };
        let transport = Self {
            store,
            cipher,
            address_override: None,
            default_port,
            encryption,
            commands,
            session,
        };
        (transport, host)
    }

    pub fn with_address_override(mut self, address_override: AddressOverride) -> Self {
        self.address_override = Some(address_override);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<BridgeSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for BridgeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Bridge
    }

    fn start(&mut self, events: EventSender) {
        self.stop();
        self.encryption.store(false, Ordering::SeqCst);

        let Some(plan) = resolve_addresses(
            self.store.as_ref(),
            self.address_override.as_ref(),
            self.default_port,
        ) else {
            warn!("{}", constants::ERR_NO_SERVER_ADDRESS);
            let _ = events.send(TransportEvent::Close(ConnectionErrorCode::Connection));
            return;
        };

        *self.lock() = Some(BridgeSession {
            events,
            encrypt_queue: TaskQueue::new("bridge-encrypt"),
            decrypt_queue: TaskQueue::new("bridge-decrypt"),
            fallback: plan.fallback,
            opened: false,
            stopping: false,
        });

        info!(address = %plan.primary, "Asking host to connect");
        let _ = self.commands.send(BridgeCommand::Connect {
            host: plan.primary.host,
            port: plan.primary.port,
        });
    }

    fn stop(&mut self) {
        let mut session = self.lock();
        if let Some(session) = session.as_mut() {
            if !session.stopping {
                session.stopping = true;
                let _ = self.commands.send(BridgeCommand::Disconnect);
            }
        }
    }

    fn send(&mut self, data: Bytes, encrypt: bool) -> bool {
        let session = self.lock();
        let Some(session) = session.as_ref() else {
            return false;
        };
        let commands = self.commands.clone();
        queue_outgoing(
            &session.encrypt_queue,
            self.encryption.clone(),
            self.cipher.get(),
            data,
            encrypt,
            move |frame| {
                let _ = commands.send(BridgeCommand::Send(frame));
            },
        )
    }

    fn encryption(&self) -> EncryptionFlag {
        self.encryption.clone()
    }
}

impl BridgeHost {
    /// The next instruction for the host; `None` once the transport is dropped
    pub async fn next_command(&mut self) -> Option<BridgeCommand> {
        self.commands.recv().await
    }

    pub fn handle(&self) -> BridgeHandle {
        self.handle.clone()
    }
}

impl BridgeHandle {
    /// Report socket activity
    ///
    /// Must be called inside a tokio runtime.
    pub fn signal(&self, signal: BridgeSignal) {
        let mut guard = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(session) = guard.as_mut() else {
            debug!(?signal, "Ignoring bridge signal without a session");
            return;
        };

        match signal {
            BridgeSignal::Connected => {
                session.opened = true;
                let _ = session.events.send(TransportEvent::Open);
            }
            BridgeSignal::Message { data, encrypted } => {
                queue_incoming(
                    &session.decrypt_queue,
                    &self.encryption,
                    &self.cipher,
                    Frame::new(data, encrypted),
                    &session.events,
                );
            }
            BridgeSignal::Disconnected => {
                if !session.opened && !session.stopping {
                    if let Some(fallback) = session.fallback.take() {
                        info!(%fallback, "Primary address unreachable, trying fallback");
                        let _ = self.commands.send(BridgeCommand::Connect {
                            host: fallback.host,
                            port: fallback.port,
                        });
                        return;
                    }
                }

                let Some(session) = guard.take() else {
                    return;
                };
                drop(guard);
                close_when_drained(session);
            }
        }
    }
}

/// Report the close once the incoming queue has drained
fn close_when_drained(session: BridgeSession) {
    tokio::spawn(async move {
        close_after(
            &session.decrypt_queue,
            &session.events,
            ConnectionErrorCode::Connection,
        )
        .await;
    });
}
