//! # Relay Transport
//!
//! Websocket connection to the relay service, which forwards traffic to the
//! user's server.
//!
//! The client authenticates with an identity token passed in the URL query. The
//! relay confirms the connection with a `ConnectionOk` message; only then is the
//! channel reported open. Every payload is wrapped in the relay envelope, see
//! [`envelope`](crate::core::envelope).

use crate::config::RELAY_COMMUNICATIONS_VERSION;
use crate::core::envelope::{self, EncryptionMarker, RelayMessage};
use crate::error::{constants, ConnectionErrorCode, ProtocolError, Result};
use crate::service::credentials::CredentialProvider;
use crate::transport::{EncryptionFlag, EventSender, Transport, TransportEvent, TransportKind};
use crate::utils::crypto::SharedCipher;
use crate::utils::task_queue::TaskQueue;
use crate::utils::timeout::{with_timeout_error, REQUEST_TIMEOUT};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Close codes sent by the relay
pub mod close_code {
    pub const NORMAL_CLOSURE: u16 = 1000;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL_CLOSURE: u16 = 1006;
    pub const POLICY_VIOLATION: u16 = 1008;

    /// No protocol version matching the one requested
    pub const INCOMPATIBLE_PROTOCOL: u16 = 4000;
    /// No active group with a matching ID
    pub const NO_GROUP: u16 = 4001;
    /// The group is at capacity
    pub const NO_CAPACITY: u16 = 4002;
    pub const ACCOUNT_VALIDATION: u16 = 4003;
    /// The server's installation ID is out of date
    pub const SERVER_TOKEN_REFRESH: u16 = 4004;
    pub const NO_ACTIVATION: u16 = 4005;
    /// Logged in from another location
    pub const OTHER_LOCATION: u16 = 4006;
}

/// Map a websocket close code to a close reason
pub fn map_close_code(code: u16) -> ConnectionErrorCode {
    match code {
        close_code::NORMAL_CLOSURE | close_code::ABNORMAL_CLOSURE => ConnectionErrorCode::Internet,
        close_code::PROTOCOL_ERROR | close_code::POLICY_VIOLATION => {
            ConnectionErrorCode::BadRequest
        }
        close_code::INCOMPATIBLE_PROTOCOL => ConnectionErrorCode::ClientOutdated,
        close_code::NO_GROUP => ConnectionErrorCode::ConnectNoGroup,
        close_code::NO_CAPACITY => ConnectionErrorCode::ConnectNoCapacity,
        close_code::ACCOUNT_VALIDATION => ConnectionErrorCode::ConnectAccountValidation,
        close_code::NO_ACTIVATION => ConnectionErrorCode::ConnectNoActivation,
        close_code::OTHER_LOCATION => ConnectionErrorCode::ConnectOtherLocation,
        _ => ConnectionErrorCode::ExternalError,
    }
}

/// Build the connection URL for a relay endpoint
pub fn relay_url(base: &str, installation_id: &str, id_token: &str) -> Result<Url> {
    let mut url = Url::parse(base).map_err(|e| ProtocolError::InvalidAddress(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("communications", &RELAY_COMMUNICATIONS_VERSION.to_string())
        .append_pair("is_server", "false")
        .append_pair("installation_id", installation_id)
        .append_pair("id_token", id_token);
    Ok(url)
}

enum Outgoing {
    Frame(Bytes),
    Close,
}

struct RelaySession {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    encrypt_queue: TaskQueue,
    task: JoinHandle<()>,
}

/// Transport over the relay websocket
pub struct RelayTransport {
    base_url: String,
    installation_id: String,
    handshake_timeout: Duration,
    credentials: Arc<dyn CredentialProvider>,
    cipher: SharedCipher,
    encryption: EncryptionFlag,
    session: Option<RelaySession>,
}

impl RelayTransport {
    pub fn new(
        base_url: impl Into<String>,
        installation_id: impl Into<String>,
        handshake_timeout: Duration,
        credentials: Arc<dyn CredentialProvider>,
        cipher: SharedCipher,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            installation_id: installation_id.into(),
            handshake_timeout,
            credentials,
            cipher,
            encryption: EncryptionFlag::default(),
            session: None,
        }
    }
}

impl Transport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn start(&mut self, events: EventSender) {
        self.stop();
        self.encryption.store(false, Ordering::SeqCst);

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let connection = RelayConnection {
            base_url: self.base_url.clone(),
            installation_id: self.installation_id.clone(),
            handshake_timeout: self.handshake_timeout,
            credentials: self.credentials.clone(),
            cipher: self.cipher.clone(),
            events,
        };
        let task = tokio::spawn(connection.run(outgoing_rx));

        self.session = Some(RelaySession {
            outgoing,
            encrypt_queue: TaskQueue::new("relay-encrypt"),
            task,
        });
    }

    fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("Closing relay connection");
            let _ = session.outgoing.send(Outgoing::Close);
        }
    }

    fn send(&mut self, data: Bytes, encrypt: bool) -> bool {
        let Some(session) = &self.session else {
            return false;
        };

        let flag = self.encryption.clone();
        let cipher = self.cipher.get();
        let outgoing = session.outgoing.clone();
        session.encrypt_queue.enqueue(async move {
            let server_requests_encryption = flag.load(Ordering::SeqCst);
            let encrypted = encrypt && server_requests_encryption;

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

            let marker = EncryptionMarker::outgoing(encrypted, server_requests_encryption);
            let _ = outgoing.send(Outgoing::Frame(envelope::encode_proxy(&payload, marker)));
        })
    }

    fn encryption(&self) -> EncryptionFlag {
        self.encryption.clone()
    }

    fn send_push_token(&mut self, token: &str, add: bool) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        session
            .outgoing
            .send(Outgoing::Frame(envelope::encode_push_token(token, add)))
            .is_ok()
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.task.abort();
        }
    }
}

/// State owned by one connection attempt
struct RelayConnection {
    base_url: String,
    installation_id: String,
    handshake_timeout: Duration,
    credentials: Arc<dyn CredentialProvider>,
    cipher: SharedCipher,
    events: EventSender,
}

impl RelayConnection {
    #[instrument(skip_all, name = "relay")]
    async fn run(self, outgoing: mpsc::UnboundedReceiver<Outgoing>) {
        let decrypt_queue = TaskQueue::new("relay-decrypt");
        let reason = self.connect_and_serve(outgoing, &decrypt_queue).await;
        info!(?reason, "Relay connection closed");

        // Deliver the close after every message still being decrypted
        let (done, finished) = oneshot::channel();
        let events = self.events.clone();
        decrypt_queue.enqueue(async move {
            let _ = events.send(TransportEvent::Close(reason));
            let _ = done.send(());
        });
        let _ = finished.await;
    }

    async fn connect_and_serve(
        &self,
        mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
        decrypt_queue: &TaskQueue,
    ) -> ConnectionErrorCode {
        let token = match with_timeout_error(self.credentials.id_token(), REQUEST_TIMEOUT).await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Failed to obtain identity token");
                return ConnectionErrorCode::InternalError;
            }
        };
        let url = match relay_url(&self.base_url, &self.installation_id, &token) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "Invalid relay URL");
                return ConnectionErrorCode::InternalError;
            }
        };

        // Fails harmlessly if a provider is already installed
        let _ = rustls::crypto::ring::default_provider().install_default();
        let socket = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((socket, _)) => socket,
            Err(e) => {
                warn!(error = %e, "Failed to connect to relay");
                return ConnectionErrorCode::Internet;
            }
        };
        debug!("Relay socket open, awaiting confirmation");

        let (mut sink, mut stream) = socket.split();
        let handshake = tokio::time::sleep(self.handshake_timeout);
        tokio::pin!(handshake);
        let mut confirmed = false;

        loop {
            tokio::select! {
                _ = &mut handshake, if !confirmed => {
                    warn!("Relay did not confirm the connection in time");
                    let _ = sink.close().await;
                    return map_close_code(close_code::NORMAL_CLOSURE);
                }
                command = outgoing.recv() => match command {
                    Some(Outgoing::Frame(data)) => {
                        if let Err(e) = sink.send(Message::Binary(data.to_vec())).await {
                            warn!(error = %e, "Relay write failed");
                            return map_close_code(close_code::ABNORMAL_CLOSURE);
                        }
                    }
                    Some(Outgoing::Close) | None => {
                        let _ = sink.close().await;
                        return map_close_code(close_code::NORMAL_CLOSURE);
                    }
                },
                message = stream.next() => match message {
                    Some(Ok(Message::Binary(data))) => {
                        if self.handle_message(Bytes::from(data), decrypt_queue) {
                            confirmed = true;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map_or(close_code::NO_STATUS, |frame| u16::from(frame.code));
                        return map_close_code(code);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Relay read failed");
                        return map_close_code(close_code::ABNORMAL_CLOSURE);
                    }
                    None => return map_close_code(close_code::ABNORMAL_CLOSURE),
                },
            }
        }
    }

    /// Handle one relay message; returns true when the relay confirmed the connection
    fn handle_message(&self, data: Bytes, decrypt_queue: &TaskQueue) -> bool {
        let message = match envelope::decode(data) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed relay message");
                return false;
            }
        };

        match message {
            RelayMessage::ConnectionOk => {
                info!("Relay connection confirmed");
                let _ = self.events.send(TransportEvent::Open);
                true
            }
            RelayMessage::Proxy { marker, data } => {
                let secure = marker.is_secure();
                match self.cipher.get() {
                    Some(cipher) => {
                        let events = self.events.clone();
                        decrypt_queue.enqueue(async move {
                            let data = if marker.is_encrypted() {
                                match cipher.decrypt_async(data).await {
                                    Ok(data) => data,
                                    Err(e) => {
                                        warn!(error = %e, "Dropping packet that failed to decrypt");
                                        return;
                                    }
                                }
                            } else {
                                data
                            };
                            let _ = events.send(TransportEvent::Message { data, secure });
                        });
                    }
                    None if marker.is_encrypted() => {
                        warn!("Received encrypted data without a password");
                    }
                    None => {
                        let _ = self.events.send(TransportEvent::Message { data, secure });
                    }
                }
                false
            }
            RelayMessage::Unknown(tag) => {
                debug!(tag, "Ignoring relay message");
                false
            }
        }
    }
}
