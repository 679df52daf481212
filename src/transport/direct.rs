//! # Direct Transport
//!
//! TCP connection straight to the server, framed with
//! [`FrameCodec`](crate::core::codec::FrameCodec).
//!
//! The server address comes from an explicit override or from the secure store.
//! If the primary address cannot be reached, the fallback address is tried once
//! before the connection is reported closed.

use crate::core::codec::{Frame, FrameCodec};
use crate::error::{constants, ConnectionErrorCode, ProtocolError, Result};
use crate::service::credentials::{SecureStore, StoreKey};
use crate::transport::{EncryptionFlag, EventSender, Transport, TransportEvent, TransportKind};
use crate::utils::crypto::{PasswordCipher, SharedCipher};
use crate::utils::task_queue::TaskQueue;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

/// A `host:port` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`
    pub fn parse(value: &str, default_port: u16) -> Result<Self> {
        let value = value.trim();
        let invalid = || ProtocolError::InvalidAddress(value.to_string());
        if value.is_empty() {
            return Err(invalid());
        }

        let parse_port = |port: &str| port.parse::<u16>().map_err(|_| invalid());

        if let Some(rest) = value.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match after.strip_prefix(':') {
                Some(port) => parse_port(port)?,
                None if after.is_empty() => default_port,
                None => return Err(invalid()),
            };
            return Ok(Self {
                host: host.to_string(),
                port,
            });
        }

        match value.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                if host.is_empty() {
                    return Err(invalid());
                }
                Ok(Self {
                    host: host.to_string(),
                    port: parse_port(port)?,
                })
            }
            _ => Ok(Self {
                host: value.to_string(),
                port: default_port,
            }),
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Where a direct or bridged connection should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPlan {
    pub primary: ServerAddress,
    pub fallback: Option<ServerAddress>,
}

/// Addresses set explicitly instead of read from the store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressOverride {
    pub primary: String,
    pub fallback: Option<String>,
}

/// Resolve the connection addresses; `None` when no usable primary address exists
pub(crate) fn resolve_addresses(
    store: &dyn SecureStore,
    address_override: Option<&AddressOverride>,
    default_port: u16,
) -> Option<AddressPlan> {
    let (primary, fallback) = match address_override {
        Some(o) => (Some(o.primary.clone()), o.fallback.clone()),
        None => (
            store.get(StoreKey::ServerAddress),
            store.get(StoreKey::ServerAddressFallback),
        ),
    };

    let primary = match ServerAddress::parse(&primary?, default_port) {
        Ok(address) => address,
        Err(e) => {
            warn!(error = %e, "Unusable server address");
            return None;
        }
    };
    let fallback = fallback
        .filter(|value| !value.trim().is_empty())
        .and_then(|value| match ServerAddress::parse(&value, default_port) {
            Ok(address) => Some(address),
            Err(e) => {
                warn!(error = %e, "Ignoring unusable fallback address");
                None
            }
        });

    Some(AddressPlan { primary, fallback })
}

/// Encrypt a packet if the server requires it and hand the frame to `deliver`
///
/// Runs on the transport's outgoing queue so frames leave in submission order.
pub(crate) fn queue_outgoing<F>(
    queue: &TaskQueue,
    flag: EncryptionFlag,
    cipher: Option<Arc<PasswordCipher>>,
    data: Bytes,
    encrypt: bool,
    deliver: F,
) -> bool
where
    F: FnOnce(Frame) + Send + 'static,
{
    queue.enqueue(async move {
        let encrypted = encrypt && flag.load(Ordering::SeqCst);
        let payload = match (encrypted, cipher) {
            (false, _) => data,
            (true, Some(cipher)) => match cipher.encrypt_async(data).await {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "Dropping packet that failed to encrypt");
                    return;
                }
            },
            (true, None) => {
                warn!("{}", constants::ERR_PASSWORD_UNAVAILABLE);
                return;
            }
        };
        deliver(Frame::new(payload, encrypted));
    })
}

/// Decrypt an incoming frame on the incoming queue and report it
pub(crate) fn queue_incoming(
    queue: &TaskQueue,
    flag: &EncryptionFlag,
    cipher: &SharedCipher,
    frame: Frame,
    events: &EventSender,
) {
    let events = events.clone();
    if !frame.encrypted {
        let secure = !flag.load(Ordering::SeqCst);
        queue.enqueue(async move {
            let _ = events.send(TransportEvent::Message {
                data: frame.payload,
                secure,
            });
        });
        return;
    }

    let Some(cipher) = cipher.get() else {
        warn!("Received encrypted data without a password");
        return;
    };
    queue.enqueue(async move {
        match cipher.decrypt_async(frame.payload).await {
            Ok(data) => {
                let _ = events.send(TransportEvent::Message { data, secure: true });
            }
            Err(e) => warn!(error = %e, "Dropping packet that failed to decrypt"),
        }
    });
}

/// Report the close after everything still on the incoming queue
pub(crate) async fn close_after(
    queue: &TaskQueue,
    events: &EventSender,
    reason: ConnectionErrorCode,
) {
    let (done, finished) = oneshot::channel();
    let events = events.clone();
    queue.enqueue(async move {
        let _ = events.send(TransportEvent::Close(reason));
        let _ = done.send(());
    });
    let _ = finished.await;
}

enum Outgoing {
    Frame(Frame),
    Close,
}

enum AttemptEnd {
    Unreachable,
    Stopped,
    Dropped,
}

struct DirectSession {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    encrypt_queue: TaskQueue,
    task: JoinHandle<()>,
}

/// Transport over a TCP socket to the server
pub struct DirectTransport {
    store: Arc<dyn SecureStore>,
    cipher: SharedCipher,
    address_override: Option<AddressOverride>,
    default_port: u16,
    max_frame_size: usize,
    connect_timeout: Duration,
    encryption: EncryptionFlag,
    session: Option<DirectSession>,
}

impl DirectTransport {
    pub fn new(
        store: Arc<dyn SecureStore>,
        cipher: SharedCipher,
        default_port: u16,
        max_frame_size: usize,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cipher,
            address_override: None,
            default_port,
            max_frame_size,
            connect_timeout,
            encryption: EncryptionFlag::default(),
            session: None,
        }
    }

    /// Connect to these addresses instead of the stored ones
    pub fn with_address_override(mut self, address_override: AddressOverride) -> Self {
        self.address_override = Some(address_override);
        self
    }
}

impl Transport for DirectTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
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

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let connection = DirectConnection {
            plan,
            codec: FrameCodec::new(self.max_frame_size),
            connect_timeout: self.connect_timeout,
            cipher: self.cipher.clone(),
            encryption: self.encryption.clone(),
            events,
        };
        let task = tokio::spawn(connection.run(outgoing_rx));

        self.session = Some(DirectSession {
            outgoing,
            encrypt_queue: TaskQueue::new("direct-encrypt"),
            task,
        });
    }

    fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("Closing direct connection");
            let _ = session.outgoing.send(Outgoing::Close);
        }
    }

    fn send(&mut self, data: Bytes, encrypt: bool) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        let outgoing = session.outgoing.clone();
        queue_outgoing(
            &session.encrypt_queue,
            self.encryption.clone(),
            self.cipher.get(),
            data,
            encrypt,
            move |frame| {
                let _ = outgoing.send(Outgoing::Frame(frame));
            },
        )
    }

    fn encryption(&self) -> EncryptionFlag {
        self.encryption.clone()
    }
}

impl Drop for DirectTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.task.abort();
        }
    }
}

struct DirectConnection {
    plan: AddressPlan,
    codec: FrameCodec,
    connect_timeout: Duration,
    cipher: SharedCipher,
    encryption: EncryptionFlag,
    events: EventSender,
}

impl DirectConnection {
    #[instrument(skip_all, name = "direct", fields(address = %self.plan.primary))]
    async fn run(self, mut outgoing: mpsc::UnboundedReceiver<Outgoing>) {
        let decrypt_queue = TaskQueue::new("direct-decrypt");

        let mut end = self
            .attempt(&self.plan.primary, &mut outgoing, &decrypt_queue)
            .await;
        if let (AttemptEnd::Unreachable, Some(fallback)) = (&end, &self.plan.fallback) {
            info!(%fallback, "Primary address unreachable, trying fallback");
            end = self.attempt(fallback, &mut outgoing, &decrypt_queue).await;
        }

        if matches!(end, AttemptEnd::Stopped) {
            debug!("Direct connection stopped");
        }
        close_after(&decrypt_queue, &self.events, ConnectionErrorCode::Connection).await;
    }

    async fn attempt(
        &self,
        address: &ServerAddress,
        outgoing: &mut mpsc::UnboundedReceiver<Outgoing>,
        decrypt_queue: &TaskQueue,
    ) -> AttemptEnd {
        let connect = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((address.host.as_str(), address.port)),
        );
        tokio::pin!(connect);

        let stream = loop {
            tokio::select! {
                result = &mut connect => match result {
                    Ok(Ok(stream)) => break stream,
                    Ok(Err(e)) => {
                        warn!(%address, error = %e, "Failed to connect");
                        return AttemptEnd::Unreachable;
                    }
                    Err(_) => {
                        warn!(%address, "Timed out connecting");
                        return AttemptEnd::Unreachable;
                    }
                },
                command = outgoing.recv() => match command {
                    Some(Outgoing::Frame(_)) => debug!("Dropping packet queued before connect"),
                    Some(Outgoing::Close) | None => return AttemptEnd::Stopped,
                },
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to disable Nagle");
        }
        info!(%address, "Connected");
        let _ = self.events.send(TransportEvent::Open);

        let mut framed = Framed::new(stream, self.codec);
        loop {
            tokio::select! {
                command = outgoing.recv() => match command {
                    Some(Outgoing::Frame(frame)) => {
                        if let Err(e) = framed.send(frame).await {
                            warn!(error = %e, "Write failed");
                            return AttemptEnd::Dropped;
                        }
                    }
                    Some(Outgoing::Close) | None => return AttemptEnd::Stopped,
                },
                frame = framed.next() => match frame {
                    Some(Ok(frame)) => {
                        queue_incoming(decrypt_queue, &self.encryption, &self.cipher, frame, &self.events);
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Read failed");
                        return AttemptEnd::Dropped;
                    }
                    None => {
                        debug!("Server closed the connection");
                        return AttemptEnd::Dropped;
                    }
                },
            }
        }
    }
}
