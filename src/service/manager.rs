//! # Connection Manager
//!
//! Owns the connection to the server and pairs requests with their replies.
//!
//! All state lives on a single actor task. The public [`ConnectionManager`]
//! is a cheap, cloneable handle that sends commands to the actor; results come
//! back over oneshot channels and everything else is reported through the
//! [`EventHub`].
//!
//! ## State Machine
//! ```text
//! disconnected -> connecting -> connected -> disconnected(reason)
//! ```
//! A passive reconnect runs the same sequence without telling listeners until
//! the server authenticates us, or until [`ConnectionManager::connect`] promotes
//! it. After a close for a recoverable reason the actor schedules exactly one
//! passive reconnect after the reconnect interval; each failed attempt schedules
//! the next one.
//!
//! ## Example
//! ```rust,no_run
//! use relay_protocol::protocol::handshake::ClientIdentity;
//! use relay_protocol::protocol::message::ConversationTarget;
//! use relay_protocol::service::credentials::{MemoryStore, StoreKey};
//! use relay_protocol::service::manager::{ConnectionManager, ManagerOptions};
//! use relay_protocol::transport::direct::DirectTransport;
//! use relay_protocol::utils::crypto::SharedCipher;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> relay_protocol::error::Result<()> {
//! let store = Arc::new(MemoryStore::new().with(StoreKey::ServerAddress, "192.168.1.10"));
//! let cipher = SharedCipher::new();
//! let transport = DirectTransport::new(store.clone(), cipher.clone(), 1359, 64 * 1024 * 1024, Duration::from_secs(10));
//!
//! let options = ManagerOptions::new(ClientIdentity::generate()?, store).with_cipher(cipher);
//! let manager = ConnectionManager::spawn(transport, options);
//! let _subscription = manager.events().message_updates.subscribe(|items| {
//!     println!("{} new items", items.len());
//! });
//!
//! manager.connect();
//! manager
//!     .send_message(ConversationTarget::linked("iMessage;-;+15550100"), "Hello")
//!     .await
//!     .ok();
//! # Ok(())
//! # }
//! ```

use crate::config::{ConnectionConfig, COMMUNICATIONS_VERSION};
use crate::error::{
    constants, AttachmentRequestErrorCode, ConnectionErrorCode, CreateChatError,
    FaceTimeInitiateCode, FaceTimeInitiateError, FaceTimeLinkErrorCode, MessageError,
    MessageErrorCode, ProtocolError, RemoteUpdateErrorCode, Result,
};
use crate::protocol::dispatcher::ProtocolDispatcher;
use crate::protocol::handler::{HandlerContext, ProtocolEvent, ProtocolHandler};
use crate::protocol::handshake::ClientIdentity;
use crate::protocol::message::{
    ConversationItem, ConversationTarget, FileDownloadResult, LinkedConversation,
    OutgoingCallResult, RequestedConversation, ServerInfo,
};
use crate::protocol::transfer::{
    prepare_upload, BasicAccumulator, DownloadChunk, FileUpload, InflatorAccumulator,
    PreparedUpload, TransferAccumulator,
};
use crate::service::correlation::{
    Correlations, DownloadEvent, PendingDownload, PendingMessage, Reply, TimerKey, UploadEvent,
    Waiter,
};
use crate::service::credentials::{SecureStore, StoreKey};
use crate::service::events::{CallEvent, ConnectionEvent, EventHub, RemoteUpdateEvent};
use crate::transport::{Transport, TransportEvent};
use crate::utils::buffer_pool::PackerPool;
use crate::utils::crypto::SharedCipher;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, instrument, warn};

/// Connection state as seen by listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Everything the manager needs besides the transport
pub struct ManagerOptions {
    pub identity: ClientIdentity,
    pub store: Arc<dyn SecureStore>,
    /// Must be the same slot the transport encrypts with
    pub cipher: SharedCipher,
    pub config: ConnectionConfig,
}

impl ManagerOptions {
    pub fn new(identity: ClientIdentity, store: Arc<dyn SecureStore>) -> Self {
        Self {
            identity,
            store,
            cipher: SharedCipher::new(),
            config: ConnectionConfig::default(),
        }
    }

    pub fn with_cipher(mut self, cipher: SharedCipher) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }
}

impl fmt::Debug for ManagerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerOptions")
            .field("identity", &self.identity)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// The eventual result of a request
///
/// Resolves to the request's network-style error if the manager stops before
/// answering.
pub struct Completion<T> {
    receiver: oneshot::Receiver<T>,
    stopped: fn() -> T,
}

impl<T> Future for Completion<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        Pin::new(&mut this.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| (this.stopped)()))
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

/// A transfer with a progress stream and a final result
#[derive(Debug)]
pub struct Transfer<P, T> {
    pub progress: mpsc::UnboundedReceiver<P>,
    pub result: Completion<T>,
}

pub type UploadTransfer = Transfer<UploadEvent, std::result::Result<(), MessageError>>;
pub type DownloadTransfer =
    Transfer<DownloadEvent, std::result::Result<FileDownloadResult, AttachmentRequestErrorCode>>;

enum Command {
    Connect,
    Disconnect,
    SetAutoReconnect(bool),
    NetworkOnline,
    NetworkOffline,
    ServerInfo(Reply<Option<ServerInfo>>),
    ActiveVersion(Reply<Option<(i32, i32)>>),
    PendingRequests(Reply<usize>),
    SendMessage {
        target: ConversationTarget,
        text: String,
        reply: Reply<std::result::Result<(), MessageError>>,
    },
    SendFile {
        target: ConversationTarget,
        upload: FileUpload,
        reply: Reply<std::result::Result<(), MessageError>>,
        progress: mpsc::UnboundedSender<UploadEvent>,
    },
    FetchConversations(Reply<std::result::Result<Vec<LinkedConversation>, MessageError>>),
    FetchConversationInfo {
        chat_guids: Vec<String>,
        reply: Reply<std::result::Result<Vec<RequestedConversation>, MessageError>>,
    },
    FetchThread {
        chat_guid: String,
        first_message_id: Option<i64>,
        reply: Reply<std::result::Result<Vec<ConversationItem>, MessageError>>,
    },
    FetchAttachment {
        attachment_guid: String,
        reply: Reply<std::result::Result<FileDownloadResult, AttachmentRequestErrorCode>>,
        progress: mpsc::UnboundedSender<DownloadEvent>,
    },
    CreateChat {
        members: Vec<String>,
        service: String,
        reply: Reply<std::result::Result<String, CreateChatError>>,
    },
    RequestMissedMessages,
    InstallRemoteUpdate {
        update_id: i32,
        reply: Reply<bool>,
    },
    RequestFaceTimeLink(Reply<std::result::Result<String, FaceTimeLinkErrorCode>>),
    InitiateFaceTimeCall {
        addresses: Vec<String>,
        reply: Reply<std::result::Result<(), FaceTimeInitiateError>>,
    },
    HandleIncomingFaceTimeCall {
        caller: String,
        accept: bool,
        reply: Reply<bool>,
    },
    DropFaceTimeCall(Reply<bool>),
    PushToken {
        token: String,
        add: bool,
        reply: Reply<bool>,
    },
    Shutdown,
}

/// Work the actor hands to itself
enum Internal {
    UploadPrepared {
        session: u64,
        request_id: i16,
        target: ConversationTarget,
        result: Result<PreparedUpload>,
    },
}

/// Handle to the connection manager task
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: EventHub,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Start the manager task; must be called inside a tokio runtime
    ///
    /// The manager stays disconnected until [`ConnectionManager::connect`].
    pub fn spawn<T>(transport: T, options: ManagerOptions) -> Self
    where
        T: Transport + 'static,
    {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let events = EventHub::new();

        let context = HandlerContext {
            cipher: options.cipher,
            identity: options.identity,
            pool: PackerPool::default(),
            chunk_size: options.config.chunk_size,
        };
        let actor = ManagerActor {
            transport: Box::new(transport),
            events: events.clone(),
            state_tx,
            store: options.store,
            context,
            auto_reconnect: options.config.auto_reconnect,
            config: options.config,
            dispatcher: None,
            transport_events: None,
            internal_tx,
            internal_rx,
            correlations: Correlations::new(),
            state: ConnectionState::Disconnected,
            session: 0,
            passive: false,
            reconnect_at: None,
            pending_close: None,
            has_connected_before: false,
            last_message_id: None,
            last_update_time: None,
            server_info: None,
        };
        tokio::spawn(actor.run(command_rx));

        Self {
            commands,
            state,
            events,
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("{}", constants::ERR_MANAGER_STOPPED);
        }
    }

    fn request<T>(&self, stopped: fn() -> T, command: impl FnOnce(Reply<T>) -> Command) -> Completion<T> {
        let (reply, receiver) = oneshot::channel();
        self.send(command(reply));
        Completion { receiver, stopped }
    }

    /// Connect, or promote a passive reconnect that is already running
    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    /// Close the connection with [`ConnectionErrorCode::Internet`]
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Enable or disable passive reconnects; disabling cancels a scheduled one
    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.send(Command::SetAutoReconnect(enabled));
    }

    /// The platform reports that the network came back
    pub fn network_online(&self) {
        self.send(Command::NetworkOnline);
    }

    /// The platform reports that the network went away
    pub fn network_offline(&self) {
        self.send(Command::NetworkOffline);
    }

    /// What the server reported when it last authenticated us
    pub async fn server_info(&self) -> Option<ServerInfo> {
        self.request(|| None, Command::ServerInfo).await
    }

    /// Negotiated `(communications version, sub-version)`
    pub async fn active_version(&self) -> Option<(i32, i32)> {
        self.request(|| None, Command::ActiveVersion).await
    }

    /// Number of callers waiting for a reply
    pub async fn pending_requests(&self) -> usize {
        self.request(|| 0, Command::PendingRequests).await
    }

    /// Stop the manager task, closing the transport
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    pub async fn send_message(
        &self,
        target: ConversationTarget,
        text: impl Into<String>,
    ) -> std::result::Result<(), MessageError> {
        let text = text.into();
        self.request(
            || Err(MessageError::network()),
            |reply| Command::SendMessage {
                target,
                text,
                reply,
            },
        )
        .await
    }

    /// Upload a file; the reply timeout starts once the last chunk is sent
    pub fn send_file(&self, target: ConversationTarget, upload: FileUpload) -> UploadTransfer {
        let (progress_tx, progress) = mpsc::unbounded_channel();
        let result = self.request(
            || Err(MessageError::network()),
            |reply| Command::SendFile {
                target,
                upload,
                reply,
                progress: progress_tx,
            },
        );
        Transfer { progress, result }
    }

    pub async fn fetch_conversations(
        &self,
    ) -> std::result::Result<Vec<LinkedConversation>, MessageError> {
        self.request(|| Err(MessageError::network()), Command::FetchConversations)
            .await
    }

    /// Callers asking for the same set of conversations share one answer
    pub async fn fetch_conversation_info(
        &self,
        chat_guids: Vec<String>,
    ) -> std::result::Result<Vec<RequestedConversation>, MessageError> {
        self.request(
            || Err(MessageError::network()),
            |reply| Command::FetchConversationInfo { chat_guids, reply },
        )
        .await
    }

    /// Items of a conversation, oldest first; `first_message_id` pages backwards
    pub async fn fetch_thread(
        &self,
        chat_guid: impl Into<String>,
        first_message_id: Option<i64>,
    ) -> std::result::Result<Vec<ConversationItem>, MessageError> {
        let chat_guid = chat_guid.into();
        self.request(
            || Err(MessageError::network()),
            |reply| Command::FetchThread {
                chat_guid,
                first_message_id,
                reply,
            },
        )
        .await
    }

    /// Download an attachment; the timeout restarts with every chunk
    pub fn fetch_attachment(&self, attachment_guid: impl Into<String>) -> DownloadTransfer {
        let attachment_guid = attachment_guid.into();
        let (progress_tx, progress) = mpsc::unbounded_channel();
        let result = self.request(
            || Err(AttachmentRequestErrorCode::Timeout),
            |reply| Command::FetchAttachment {
                attachment_guid,
                reply,
                progress: progress_tx,
            },
        );
        Transfer { progress, result }
    }

    /// Create a chat and return its GUID
    pub async fn create_chat(
        &self,
        members: Vec<String>,
        service: impl Into<String>,
    ) -> std::result::Result<String, CreateChatError> {
        let service = service.into();
        self.request(
            || Err(CreateChatError::network()),
            |reply| Command::CreateChat {
                members,
                service,
                reply,
            },
        )
        .await
    }

    /// Ask the server for everything since the last known message
    pub fn request_missed_messages(&self) {
        self.send(Command::RequestMissedMessages);
    }

    /// Returns whether the request was sent; the outcome arrives as a [`RemoteUpdateEvent`]
    pub async fn install_remote_update(&self, update_id: i32) -> bool {
        self.request(|| false, |reply| Command::InstallRemoteUpdate { update_id, reply })
            .await
    }

    /// Callers that ask while a request is running share its answer
    pub async fn request_face_time_link(
        &self,
    ) -> std::result::Result<String, FaceTimeLinkErrorCode> {
        self.request(
            || Err(FaceTimeLinkErrorCode::Network),
            Command::RequestFaceTimeLink,
        )
        .await
    }

    /// Start an outgoing call; the answer arrives as a [`CallEvent`]
    pub async fn initiate_face_time_call(
        &self,
        addresses: Vec<String>,
    ) -> std::result::Result<(), FaceTimeInitiateError> {
        self.request(
            || Err(FaceTimeInitiateError::network()),
            |reply| Command::InitiateFaceTimeCall { addresses, reply },
        )
        .await
    }

    pub async fn handle_incoming_face_time_call(
        &self,
        caller: impl Into<String>,
        accept: bool,
    ) -> bool {
        let caller = caller.into();
        self.request(
            || false,
            |reply| Command::HandleIncomingFaceTimeCall {
                caller,
                accept,
                reply,
            },
        )
        .await
    }

    pub async fn drop_face_time_call(&self) -> bool {
        self.request(|| false, Command::DropFaceTimeCall).await
    }

    /// Register a push token with the relay; other transports return `false`
    pub async fn add_push_token(&self, token: impl Into<String>) -> bool {
        let token = token.into();
        self.request(|| false, |reply| Command::PushToken {
            token,
            add: true,
            reply,
        })
        .await
    }

    pub async fn remove_push_token(&self, token: impl Into<String>) -> bool {
        let token = token.into();
        self.request(|| false, |reply| Command::PushToken {
            token,
            add: false,
            reply,
        })
        .await
    }
}

struct ManagerActor {
    transport: Box<dyn Transport>,
    events: EventHub,
    state_tx: watch::Sender<ConnectionState>,
    store: Arc<dyn SecureStore>,
    context: HandlerContext,
    config: ConnectionConfig,
    auto_reconnect: bool,
    /// Present while a transport start is live
    dispatcher: Option<ProtocolDispatcher>,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    correlations: Correlations,
    state: ConnectionState,
    /// Incremented on every transport start
    session: u64,
    passive: bool,
    reconnect_at: Option<Instant>,
    /// Reason to report instead of the transport's when we closed it ourselves
    pending_close: Option<ConnectionErrorCode>,
    has_connected_before: bool,
    last_message_id: Option<i64>,
    last_update_time: Option<SystemTime>,
    server_info: Option<ServerInfo>,
}

async fn recv_opt<T>(receiver: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ManagerActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        debug!("Connection manager started");
        loop {
            let handshake_deadline = self
                .dispatcher
                .as_ref()
                .and_then(ProtocolDispatcher::handshake_deadline);
            let reconnect_at = self.reconnect_at;

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                event = recv_opt(&mut self.transport_events) => self.handle_transport_event(event).await,
                key = self.correlations.timers.expired() => self.on_timer(key),
                _ = sleep_opt(handshake_deadline) => self.on_handshake_timeout(),
                _ = sleep_opt(reconnect_at) => self.connect_passive(),
            }
        }

        self.transport.stop();
        self.correlations.reject_all();
        debug!("Connection manager stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect(),
            Command::SetAutoReconnect(enabled) => {
                self.auto_reconnect = enabled;
                if !enabled {
                    self.reconnect_at = None;
                }
            }
            Command::NetworkOnline => {
                if self.state == ConnectionState::Disconnected && !self.passive {
                    self.connect();
                }
            }
            Command::NetworkOffline => {
                if self.state != ConnectionState::Disconnected {
                    self.disconnect();
                }
            }
            Command::ServerInfo(reply) => {
                let _ = reply.send(self.server_info.clone());
            }
            Command::ActiveVersion(reply) => {
                let version = self
                    .dispatcher
                    .as_ref()
                    .and_then(ProtocolDispatcher::active_version)
                    .map(|sub_version| (COMMUNICATIONS_VERSION, sub_version));
                let _ = reply.send(version);
            }
            Command::PendingRequests(reply) => {
                let _ = reply.send(self.correlations.len());
            }
            Command::SendMessage {
                target,
                text,
                reply,
            } => self.send_message(target, text, reply),
            Command::SendFile {
                target,
                upload,
                reply,
                progress,
            } => self.send_file(target, upload, reply, progress),
            Command::FetchConversations(reply) => self.fetch_conversations(reply),
            Command::FetchConversationInfo { chat_guids, reply } => {
                self.fetch_conversation_info(chat_guids, reply)
            }
            Command::FetchThread {
                chat_guid,
                first_message_id,
                reply,
            } => self.fetch_thread(chat_guid, first_message_id, reply),
            Command::FetchAttachment {
                attachment_guid,
                reply,
                progress,
            } => self.fetch_attachment(attachment_guid, reply, progress),
            Command::CreateChat {
                members,
                service,
                reply,
            } => self.create_chat(members, service, reply),
            Command::RequestMissedMessages => self.request_missed_messages(),
            Command::InstallRemoteUpdate { update_id, reply } => {
                let sent = self.with_handler(|handler, link| {
                    handler.request_install_remote_update(link, update_id)
                });
                let _ = reply.send(sent.unwrap_or(false));
            }
            Command::RequestFaceTimeLink(reply) => self.request_face_time_link(reply),
            Command::InitiateFaceTimeCall { addresses, reply } => {
                self.initiate_face_time_call(addresses, reply)
            }
            Command::HandleIncomingFaceTimeCall {
                caller,
                accept,
                reply,
            } => {
                let sent = self.with_handler(|handler, link| {
                    handler.handle_incoming_face_time_call(link, &caller, accept)
                });
                let _ = reply.send(sent.unwrap_or(false));
            }
            Command::DropFaceTimeCall(reply) => {
                let sent = self.with_handler(|handler, link| handler.drop_face_time_call(link));
                let _ = reply.send(sent.unwrap_or(false));
            }
            Command::PushToken { token, add, reply } => {
                let sent = self.transport_events.is_some()
                    && self.transport.send_push_token(&token, add);
                let _ = reply.send(sent);
            }
            Command::Shutdown => {}
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::UploadPrepared {
                session,
                request_id,
                target,
                result,
            } => {
                if session != self.session {
                    return;
                }
                self.on_upload_prepared(request_id, target, result);
            }
        }
    }

    // Lifecycle

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn load_password(&self) {
        if !self.context.cipher.is_set() {
            let password = self.store.get(StoreKey::ServerPassword);
            self.context.cipher.set_password(password.as_deref());
        }
    }

    fn start_transport(&mut self) {
        let (events, receiver) = mpsc::unbounded_channel();
        self.session += 1;
        self.pending_close = None;
        self.dispatcher = Some(ProtocolDispatcher::new(
            self.context.clone(),
            self.config.handshake_timeout,
        ));
        self.transport_events = Some(receiver);
        self.transport.start(events);
    }

    #[instrument(skip(self), fields(state = ?self.state, passive = self.passive))]
    fn connect(&mut self) {
        self.load_password();

        if self.passive {
            info!("Promoting passive reconnect");
            self.passive = false;
            self.set_state(ConnectionState::Connecting);
            self.events.connection.emit(&ConnectionEvent::Connecting);
            return;
        }

        if self.state != ConnectionState::Disconnected {
            debug!("Already connecting");
            return;
        }

        self.reconnect_at = None;
        self.set_state(ConnectionState::Connecting);
        self.events.connection.emit(&ConnectionEvent::Connecting);
        self.start_transport();
    }

    fn connect_passive(&mut self) {
        self.reconnect_at = None;
        if !self.auto_reconnect || self.state != ConnectionState::Disconnected {
            return;
        }

        debug!("Starting passive reconnect");
        self.passive = true;
        self.start_transport();
    }

    fn disconnect(&mut self) {
        if self.transport_events.is_none() {
            self.reconnect_at = None;
            return;
        }
        self.close_with(ConnectionErrorCode::Internet);
    }

    /// Stop the transport, reporting `reason` when its close arrives
    fn close_with(&mut self, reason: ConnectionErrorCode) {
        if self.pending_close.is_none() {
            self.pending_close = Some(reason);
        }
        if let Some(dispatcher) = self.dispatcher.as_mut() {
            dispatcher.stop_handshake_timer();
        }
        self.transport.stop();
    }

    fn on_handshake_timeout(&mut self) {
        warn!("Server did not authenticate in time");
        self.close_with(ConnectionErrorCode::Internet);
    }

    async fn handle_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Open) => {
                debug!("Transport open, waiting for the server");
                if let Some(dispatcher) = self.dispatcher.as_mut() {
                    dispatcher.on_open();
                }
            }
            Some(TransportEvent::Message { data, secure }) => {
                if self.state == ConnectionState::Connected {
                    self.last_update_time = Some(SystemTime::now());
                }
                let Some(dispatcher) = self.dispatcher.as_mut() else {
                    return;
                };
                if let Some(event) = dispatcher
                    .process_data(self.transport.as_mut(), data, secure)
                    .await
                {
                    self.handle_protocol_event(event);
                }
            }
            Some(TransportEvent::Close(reason)) => {
                let reason = self.pending_close.take().unwrap_or(reason);
                self.on_closed(reason);
            }
            None => {
                warn!("Transport dropped its event channel without closing");
                let reason = self
                    .pending_close
                    .take()
                    .unwrap_or(ConnectionErrorCode::Connection);
                self.on_closed(reason);
            }
        }
    }

    #[instrument(skip(self), fields(state = ?self.state, passive = self.passive))]
    fn on_closed(&mut self, reason: ConnectionErrorCode) {
        self.transport_events = None;
        if let Some(mut dispatcher) = self.dispatcher.take() {
            dispatcher.on_close();
        }
        self.correlations.reject_all();
        self.server_info = None;

        // A fatal close ends a passive reconnect for good, so it is reported
        let visible = self.state != ConnectionState::Disconnected
            || (self.passive && !reason.is_recoverable());
        self.passive = false;
        self.set_state(ConnectionState::Disconnected);

        if visible {
            info!(%reason, "Connection closed");
            self.events.connection.emit(&ConnectionEvent::Close(reason));
            self.events.incoming_caller.emit(None);
            self.events.outgoing_callee.emit(None);
            self.events.remote_update.emit(&RemoteUpdateEvent::Listing(None));
        } else {
            debug!(%reason, "Passive reconnect failed");
        }

        if reason.is_recoverable() && self.auto_reconnect {
            self.reconnect_at = Some(Instant::now() + self.config.reconnect_interval);
        }
    }

    fn on_authenticated(&mut self, info: ServerInfo) {
        let version_warning = self
            .dispatcher
            .as_ref()
            .is_some_and(ProtocolDispatcher::is_version_warning);
        info!(
            device = %info.device_name,
            software_version = %info.software_version,
            version_warning,
            "Connected"
        );

        self.passive = false;
        self.set_state(ConnectionState::Connected);
        self.events.face_time_supported.emit(info.supports_face_time);
        self.server_info = Some(info);
        self.events.connection.emit(&ConnectionEvent::Open);

        if self.has_connected_before {
            self.request_missed_messages();
        }
        self.has_connected_before = true;
    }

    /// Run `action` with the active handler while connected
    fn with_handler<R>(
        &mut self,
        action: impl FnOnce(&ProtocolHandler, &mut dyn Transport) -> R,
    ) -> Option<R> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        let handler = self.dispatcher.as_ref()?.handler()?;
        Some(action(handler, self.transport.as_mut()))
    }

    fn request_missed_messages(&mut self) {
        let now = SystemTime::now();
        let sent = match (self.last_message_id, self.last_update_time) {
            (Some(id), Some(since)) => {
                debug!(id, "Requesting messages since the last known ID");
                self.with_handler(|handler, link| handler.request_retrieval_id(link, id, since, now))
            }
            (None, Some(since)) => {
                debug!("Requesting messages since the last update time");
                self.with_handler(|handler, link| handler.request_retrieval_time(link, since, now))
            }
            _ => {
                warn!("No last update time is known, skipping missed message retrieval");
                return;
            }
        };
        if sent != Some(true) {
            debug!("Missed message request was not sent");
        }
    }

    // Incoming

    fn handle_protocol_event(&mut self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Disconnect(reason) | ProtocolEvent::AuthenticationFailed(reason) => {
                self.close_with(reason)
            }
            ProtocolEvent::Authenticated(info) => self.on_authenticated(info),
            ProtocolEvent::MessageUpdate(items) => self.events.message_updates.emit(&items),
            ProtocolEvent::ModifierUpdate(modifiers) => {
                self.events.modifier_updates.emit(&modifiers)
            }
            ProtocolEvent::ConversationUpdate(conversations) => {
                self.on_conversation_update(conversations)
            }
            ProtocolEvent::FileChunk(chunk) => self.on_download_chunk(chunk),
            ProtocolEvent::FileRequestFailed { request_id, error } => {
                self.fail_download(request_id, error)
            }
            ProtocolEvent::IdUpdate(id) => self.last_message_id = Some(id),
            ProtocolEvent::Conversations(conversations) => {
                let waiters: Vec<_> = self.correlations.conversations.drain(..).collect();
                self.resolve_waiters(waiters, Ok(conversations));
            }
            ProtocolEvent::Thread {
                chat_guid,
                first_message_id,
                items,
            } => {
                if let Some(waiters) = self
                    .correlations
                    .threads
                    .remove(&(chat_guid, first_message_id))
                {
                    self.resolve_waiters(waiters, Ok(items));
                }
            }
            ProtocolEvent::SendResult { request_id, error } => {
                self.correlations.timers.cancel(&TimerKey::Message(request_id));
                if let Some(pending) = self.correlations.messages.remove(&request_id) {
                    let _ = pending.reply.send(error.map_or(Ok(()), Err));
                }
            }
            ProtocolEvent::CreateChatResult {
                request_id,
                error,
                details,
            } => {
                self.correlations
                    .timers
                    .cancel(&TimerKey::CreateChat(request_id));
                if let Some(reply) = self.correlations.chats.remove(&request_id) {
                    let result = match (error, details) {
                        (None, Some(chat_guid)) => Ok(chat_guid),
                        (None, None) => Err(CreateChatError::network()),
                        (Some(code), details) => Err(CreateChatError::new(code, details)),
                    };
                    let _ = reply.send(result);
                }
            }
            ProtocolEvent::SoftwareUpdateListing(listing) => self
                .events
                .remote_update
                .emit(&RemoteUpdateEvent::Listing(listing)),
            ProtocolEvent::SoftwareUpdateInstall(installing) => {
                let event = if installing {
                    RemoteUpdateEvent::Initiated
                } else {
                    RemoteUpdateEvent::Error {
                        code: RemoteUpdateErrorCode::Mismatch,
                        details: None,
                    }
                };
                self.events.remote_update.emit(&event);
            }
            ProtocolEvent::SoftwareUpdateError { code, details } => {
                self.events.remote_update.emit(&RemoteUpdateEvent::Error {
                    code,
                    details: Some(details),
                })
            }
            ProtocolEvent::FaceTimeLink(link) => {
                self.correlations.timers.cancel(&TimerKey::FaceTimeLink);
                let result = link.ok_or(FaceTimeLinkErrorCode::External);
                for reply in self.correlations.face_time_link.drain(..) {
                    let _ = reply.send(result.clone());
                }
            }
            ProtocolEvent::FaceTimeInitiated { code, details } => {
                self.on_face_time_initiated(code, details)
            }
            ProtocolEvent::FaceTimeOutgoing(result) => {
                let event = match result {
                    OutgoingCallResult::Accepted { link } => CallEvent::OutgoingAccepted { link },
                    OutgoingCallResult::Rejected => CallEvent::OutgoingRejected,
                    OutgoingCallResult::Error { details } => CallEvent::OutgoingError { details },
                };
                self.events.call_events.emit(&event);
                self.events.outgoing_callee.emit(None);
            }
            ProtocolEvent::IncomingCaller(caller) => self.events.incoming_caller.emit(caller),
            ProtocolEvent::IncomingHandled(result) => {
                let event = match result {
                    Ok(link) => CallEvent::IncomingHandled { link },
                    Err(details) => CallEvent::IncomingHandleError { details },
                };
                self.events.call_events.emit(&event);
            }
        }
    }

    fn resolve_waiters<T: Clone>(&mut self, waiters: Vec<Waiter<T>>, result: T) {
        for waiter in waiters {
            self.correlations.timers.cancel(&TimerKey::Waiter(waiter.id));
            let _ = waiter.reply.send(result.clone());
        }
    }

    fn on_conversation_update(&mut self, conversations: Vec<RequestedConversation>) {
        let key = conversations
            .iter()
            .map(|conversation| conversation.guid.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        if let Some(waiters) = self.correlations.conversation_info.remove(&key) {
            self.resolve_waiters(waiters, Ok(conversations.clone()));
        }
        self.events.conversation_updates.emit(&conversations);
    }

    fn on_face_time_initiated(&mut self, code: FaceTimeInitiateCode, details: Option<String>) {
        if self.correlations.face_time_initiate.is_empty() {
            return;
        }
        self.correlations.timers.cancel(&TimerKey::FaceTimeInitiate);

        let result = if code == FaceTimeInitiateCode::Ok {
            Ok(())
        } else {
            self.events.outgoing_callee.emit(None);
            Err(FaceTimeInitiateError {
                code,
                detail: details,
            })
        };
        for reply in self.correlations.face_time_initiate.drain(..) {
            let _ = reply.send(result.clone());
        }
    }

    fn on_timer(&mut self, key: TimerKey) {
        if key == TimerKey::FaceTimeInitiate && !self.correlations.face_time_initiate.is_empty() {
            self.events.outgoing_callee.emit(None);
        }
        self.correlations.expire(key);
    }

    // Requests

    fn send_message(
        &mut self,
        target: ConversationTarget,
        text: String,
        reply: Reply<std::result::Result<(), MessageError>>,
    ) {
        let Some(request_id) = self.allocate_request_id() else {
            let _ = reply.send(Err(MessageError::network()));
            return;
        };
        let sent = self.with_handler(|handler, link| {
            handler.send_message(link, request_id, &target, &text)
        });
        if sent != Some(true) {
            let _ = reply.send(Err(MessageError::network()));
            return;
        }

        self.correlations.messages.insert(
            request_id,
            PendingMessage {
                reply,
                progress: None,
            },
        );
        self.correlations
            .timers
            .arm(TimerKey::Message(request_id), self.config.request_timeout);
    }

    /// A request ID while connected
    fn allocate_request_id(&mut self) -> Option<i16> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        let request_id = self.correlations.allocate_id();
        if request_id.is_none() {
            warn!("Every request ID is in use");
        }
        request_id
    }

    fn send_file(
        &mut self,
        target: ConversationTarget,
        upload: FileUpload,
        reply: Reply<std::result::Result<(), MessageError>>,
        progress: mpsc::UnboundedSender<UploadEvent>,
    ) {
        let Some(request_id) = self.allocate_request_id() else {
            let _ = reply.send(Err(MessageError::network()));
            return;
        };
        self.correlations.messages.insert(
            request_id,
            PendingMessage {
                reply,
                progress: Some(progress),
            },
        );

        debug!(request_id, file = %upload.name, size = upload.data.len(), "Preparing upload");
        let session = self.session;
        let chunk_size = self.config.chunk_size;
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || prepare_upload(&upload, chunk_size))
                .await
                .unwrap_or_else(|e| Err(ProtocolError::Custom(e.to_string())));
            let _ = internal.send(Internal::UploadPrepared {
                session,
                request_id,
                target,
                result,
            });
        });
    }

    fn on_upload_prepared(
        &mut self,
        request_id: i16,
        target: ConversationTarget,
        result: Result<PreparedUpload>,
    ) {
        let Some(progress) = self
            .correlations
            .messages
            .get(&request_id)
            .map(|pending| pending.progress.clone())
        else {
            return;
        };

        let prepared = match result {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(request_id, error = %e, "Failed to prepare upload");
                self.fail_message(request_id, MessageError::new(MessageErrorCode::LocalIO));
                return;
            }
        };

        let sent = self.with_handler(|handler, link| {
            for chunk in prepared.chunks() {
                if !handler.send_file_chunk(link, request_id, &target, &prepared.file_name, &chunk)
                {
                    return false;
                }
                if let Some(progress) = &progress {
                    let _ = progress.send(UploadEvent::Progress(chunk.progress));
                }
            }
            true
        });
        if sent != Some(true) {
            self.fail_message(request_id, MessageError::network());
            return;
        }

        debug!(request_id, hash = %prepared.hash, "Upload sent");
        if let Some(progress) = &progress {
            let _ = progress.send(UploadEvent::Complete {
                hash: prepared.hash,
            });
        }
        self.correlations
            .timers
            .arm(TimerKey::Message(request_id), self.config.request_timeout);
    }

    fn fail_message(&mut self, request_id: i16, error: MessageError) {
        self.correlations.timers.cancel(&TimerKey::Message(request_id));
        if let Some(pending) = self.correlations.messages.remove(&request_id) {
            let _ = pending.reply.send(Err(error));
        }
    }

    fn fetch_conversations(
        &mut self,
        reply: Reply<std::result::Result<Vec<LinkedConversation>, MessageError>>,
    ) {
        let sent = self.with_handler(|handler, link| handler.request_lite_conversations(link));
        if sent != Some(true) {
            let _ = reply.send(Err(MessageError::network()));
            return;
        }

        let id = self.correlations.next_waiter_id();
        self.correlations.conversations.push(Waiter { id, reply });
        self.correlations
            .timers
            .arm(TimerKey::Waiter(id), self.config.request_timeout);
    }

    fn fetch_conversation_info(
        &mut self,
        chat_guids: Vec<String>,
        reply: Reply<std::result::Result<Vec<RequestedConversation>, MessageError>>,
    ) {
        let sent = self
            .with_handler(|handler, link| handler.request_conversation_info(link, &chat_guids));
        if sent != Some(true) {
            let _ = reply.send(Err(MessageError::network()));
            return;
        }

        let id = self.correlations.next_waiter_id();
        self.correlations
            .conversation_info
            .entry(chat_guids.join(" "))
            .or_default()
            .push(Waiter { id, reply });
        self.correlations
            .timers
            .arm(TimerKey::Waiter(id), self.config.request_timeout);
    }

    fn fetch_thread(
        &mut self,
        chat_guid: String,
        first_message_id: Option<i64>,
        reply: Reply<std::result::Result<Vec<ConversationItem>, MessageError>>,
    ) {
        let sent = self.with_handler(|handler, link| {
            handler.request_lite_thread(link, &chat_guid, first_message_id)
        });
        if sent != Some(true) {
            let _ = reply.send(Err(MessageError::network()));
            return;
        }

        let id = self.correlations.next_waiter_id();
        self.correlations
            .threads
            .entry((chat_guid, first_message_id))
            .or_default()
            .push(Waiter { id, reply });
        self.correlations
            .timers
            .arm(TimerKey::Waiter(id), self.config.request_timeout);
    }

    fn fetch_attachment(
        &mut self,
        attachment_guid: String,
        reply: Reply<std::result::Result<FileDownloadResult, AttachmentRequestErrorCode>>,
        progress: mpsc::UnboundedSender<DownloadEvent>,
    ) {
        let Some(request_id) = self.allocate_request_id() else {
            let _ = reply.send(Err(AttachmentRequestErrorCode::Timeout));
            return;
        };
        let sent = self.with_handler(|handler, link| {
            handler.request_attachment_download(link, request_id, &attachment_guid)
        });
        if sent != Some(true) {
            let _ = reply.send(Err(AttachmentRequestErrorCode::Timeout));
            return;
        }

        self.correlations.downloads.insert(
            request_id,
            PendingDownload {
                reply,
                progress,
                header: None,
                accumulator: None,
                next_index: 0,
            },
        );
        self.correlations
            .timers
            .arm(TimerKey::Download(request_id), self.config.download_timeout);
    }

    fn on_download_chunk(&mut self, chunk: DownloadChunk) {
        let request_id = chunk.request_id;
        let Some(pending) = self.correlations.downloads.get_mut(&request_id) else {
            debug!(request_id, "Ignoring chunk for an unknown download");
            return;
        };

        if chunk.index != pending.next_index {
            warn!(
                request_id,
                expected = pending.next_index,
                received = chunk.index,
                "Download chunk out of order"
            );
            self.fail_download(request_id, AttachmentRequestErrorCode::BadResponse);
            return;
        }

        if let Some(header) = chunk.header {
            let _ = pending
                .progress
                .send(DownloadEvent::Size(header.file_length.max(0) as u64));
            pending.header = Some(header);
            let accumulator: Box<dyn TransferAccumulator> = if self.config.inflate_downloads {
                Box::new(InflatorAccumulator::new())
            } else {
                Box::new(BasicAccumulator::default())
            };
            pending.accumulator = Some(accumulator);
        }

        let offset = match pending.accumulator.as_mut() {
            Some(accumulator) => match accumulator.push(&chunk.data) {
                Ok(()) => accumulator.offset(),
                Err(e) => {
                    warn!(request_id, error = %e, "Failed to decompress download");
                    self.fail_download(request_id, AttachmentRequestErrorCode::BadResponse);
                    return;
                }
            },
            None => {
                self.fail_download(request_id, AttachmentRequestErrorCode::BadResponse);
                return;
            }
        };
        let _ = pending.progress.send(DownloadEvent::Downloaded(offset));
        pending.next_index += 1;

        if !chunk.is_last {
            self.correlations
                .timers
                .arm(TimerKey::Download(request_id), self.config.download_timeout);
            return;
        }

        self.correlations
            .timers
            .cancel(&TimerKey::Download(request_id));
        let Some(pending) = self.correlations.downloads.remove(&request_id) else {
            return;
        };
        let header = pending.header;
        let result = match pending.accumulator.map(|accumulator| accumulator.finish()) {
            Some(Ok(data)) => Ok(FileDownloadResult {
                file_name: header.as_ref().and_then(|h| h.file_name.clone()),
                mime_type: header.as_ref().and_then(|h| h.mime_type.clone()),
                data,
            }),
            Some(Err(e)) => {
                warn!(request_id, error = %e, "Failed to finish download");
                Err(AttachmentRequestErrorCode::BadResponse)
            }
            None => Err(AttachmentRequestErrorCode::BadResponse),
        };
        let _ = pending.reply.send(result);
    }

    fn fail_download(&mut self, request_id: i16, error: AttachmentRequestErrorCode) {
        self.correlations
            .timers
            .cancel(&TimerKey::Download(request_id));
        if let Some(pending) = self.correlations.downloads.remove(&request_id) {
            let _ = pending.reply.send(Err(error));
        }
    }

    fn create_chat(
        &mut self,
        members: Vec<String>,
        service: String,
        reply: Reply<std::result::Result<String, CreateChatError>>,
    ) {
        let Some(request_id) = self.allocate_request_id() else {
            let _ = reply.send(Err(CreateChatError::network()));
            return;
        };
        let sent = self.with_handler(|handler, link| {
            handler.request_chat_creation(link, request_id, &members, &service)
        });
        if sent != Some(true) {
            let _ = reply.send(Err(CreateChatError::network()));
            return;
        }

        self.correlations.chats.insert(request_id, reply);
        self.correlations
            .timers
            .arm(TimerKey::CreateChat(request_id), self.config.request_timeout);
    }

    fn request_face_time_link(
        &mut self,
        reply: Reply<std::result::Result<String, FaceTimeLinkErrorCode>>,
    ) {
        if !self.correlations.face_time_link.is_empty() {
            self.correlations.face_time_link.push(reply);
            return;
        }

        let sent = self.with_handler(|handler, link| handler.request_face_time_link(link));
        if sent != Some(true) {
            let _ = reply.send(Err(FaceTimeLinkErrorCode::Network));
            return;
        }

        self.correlations.face_time_link.push(reply);
        self.correlations
            .timers
            .arm(TimerKey::FaceTimeLink, self.config.request_timeout);
    }

    fn initiate_face_time_call(
        &mut self,
        addresses: Vec<String>,
        reply: Reply<std::result::Result<(), FaceTimeInitiateError>>,
    ) {
        if !self.correlations.face_time_initiate.is_empty() {
            self.correlations.face_time_initiate.push(reply);
            return;
        }

        let sent =
            self.with_handler(|handler, link| handler.initiate_face_time_call(link, &addresses));
        if sent != Some(true) {
            let _ = reply.send(Err(FaceTimeInitiateError::network()));
            return;
        }

        self.correlations.face_time_initiate.push(reply);
        self.correlations
            .timers
            .arm(TimerKey::FaceTimeInitiate, self.config.request_timeout);
        self.events.outgoing_callee.emit(Some(addresses));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::service::credentials::MemoryStore;
    use crate::transport::test_support::RecordingLink;

    fn options() -> ManagerOptions {
        ManagerOptions::new(ClientIdentity::new("test"), Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_requests_rejected_while_disconnected() {
        let manager = ConnectionManager::spawn(RecordingLink::default(), options());

        assert_eq!(
            manager
                .send_message(ConversationTarget::linked("chat"), "hi")
                .await,
            Err(MessageError::network())
        );
        assert_eq!(
            manager.create_chat(vec!["a".to_string()], "iMessage").await,
            Err(CreateChatError::network())
        );
        assert_eq!(
            manager.fetch_attachment("guid").result.await,
            Err(AttachmentRequestErrorCode::Timeout)
        );
        assert_eq!(
            manager.request_face_time_link().await,
            Err(FaceTimeLinkErrorCode::Network)
        );
        assert!(!manager.drop_face_time_call().await);
        assert_eq!(manager.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_connect_loads_password_from_store() {
        let store = Arc::new(MemoryStore::new().with(StoreKey::ServerPassword, "secret"));
        let cipher = SharedCipher::new();
        let manager = ConnectionManager::spawn(
            RecordingLink::default(),
            ManagerOptions::new(ClientIdentity::new("test"), store).with_cipher(cipher.clone()),
        );

        let mut state = manager.watch_state();
        manager.connect();
        state
            .wait_for(|state| *state == ConnectionState::Connecting)
            .await
            .unwrap();
        assert!(cipher.is_available());
    }

    #[tokio::test]
    async fn test_stopped_manager_resolves_with_fallback() {
        let manager = ConnectionManager::spawn(RecordingLink::default(), options());
        manager.shutdown();
        tokio::task::yield_now().await;

        assert_eq!(
            manager.fetch_conversations().await,
            Err(MessageError::network())
        );
        assert_eq!(manager.server_info().await, None);
    }
}
