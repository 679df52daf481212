//! # Protocol Handlers
//!
//! Sub-version specific packet handling for the comm5 protocol family.
//!
//! A [`ProtocolHandler`] turns incoming packets into [`ProtocolEvent`]s for the
//! connection manager and builds outgoing request packets. Requests whose layout
//! is shared by every sub-version are packed here; the sub-version modules own
//! their incoming packet handling and anything whose layout differs.

use crate::core::unpacker::Unpacker;
use crate::error::{
    AttachmentRequestErrorCode, ConnectionErrorCode, CreateChatErrorCode, FaceTimeInitiateCode,
    MessageError, RemoteUpdateErrorCode, Result,
};
use crate::protocol::handshake::{self, ClientIdentity};
use crate::protocol::message::{
    ConversationItem, ConversationTarget, LinkedConversation, MessageModifier,
    OutgoingCallResult, RequestedConversation, ServerInfo, ServerUpdateData,
};
use crate::protocol::nht::*;
use crate::protocol::transfer::{DownloadChunk, UploadChunk};
use crate::protocol::v4::V4Handler;
use crate::protocol::v6::V6Handler;
use crate::protocol::wire;
use crate::transport::Transport;
use crate::utils::buffer_pool::PackerPool;
use crate::utils::crypto::SharedCipher;
use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use tracing::{debug, instrument};

/// Shared state every handler is created with
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub cipher: SharedCipher,
    pub identity: ClientIdentity,
    pub pool: PackerPool,
    /// Chunk size requested for attachment downloads
    pub chunk_size: usize,
}

/// Something the server told the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// The server closed the protocol session
    Disconnect(ConnectionErrorCode),
    Authenticated(ServerInfo),
    AuthenticationFailed(ConnectionErrorCode),
    /// New or retrieved conversation items, oldest first
    MessageUpdate(Vec<ConversationItem>),
    ConversationUpdate(Vec<RequestedConversation>),
    ModifierUpdate(Vec<MessageModifier>),
    FileChunk(DownloadChunk),
    FileRequestFailed {
        request_id: i16,
        error: AttachmentRequestErrorCode,
    },
    /// The server's most recent message ID
    IdUpdate(i64),
    Conversations(Vec<LinkedConversation>),
    Thread {
        chat_guid: String,
        first_message_id: Option<i64>,
        items: Vec<ConversationItem>,
    },
    SendResult {
        request_id: i16,
        error: Option<MessageError>,
    },
    CreateChatResult {
        request_id: i16,
        error: Option<CreateChatErrorCode>,
        details: Option<String>,
    },
    SoftwareUpdateListing(Option<ServerUpdateData>),
    SoftwareUpdateInstall(bool),
    SoftwareUpdateError {
        code: RemoteUpdateErrorCode,
        details: String,
    },
    FaceTimeLink(Option<String>),
    FaceTimeInitiated {
        code: FaceTimeInitiateCode,
        details: Option<String>,
    },
    FaceTimeOutgoing(OutgoingCallResult),
    IncomingCaller(Option<String>),
    /// Result of accepting an incoming call; the link on success
    IncomingHandled(std::result::Result<String, Option<String>>),
}

/// The handler for the negotiated protocol sub-version
#[derive(Debug)]
pub enum ProtocolHandler {
    V4(V4Handler),
    V6(V6Handler),
}

impl ProtocolHandler {
    /// Pick a handler for a sub-version, if this client supports it
    pub fn for_version(sub_version: i32, context: HandlerContext) -> Option<Self> {
        match sub_version {
            4 => Some(Self::V4(V4Handler::new(context))),
            6 => Some(Self::V6(V6Handler::new(context))),
            _ => None,
        }
    }

    pub fn sub_version(&self) -> i32 {
        match self {
            Self::V4(_) => 4,
            Self::V6(_) => 6,
        }
    }

    fn context(&self) -> &HandlerContext {
        match self {
            Self::V4(handler) => handler.context(),
            Self::V6(handler) => handler.context(),
        }
    }

    /// Handle one incoming packet
    pub fn process_data(
        &mut self,
        link: &mut dyn Transport,
        data: Bytes,
        secure: bool,
    ) -> Result<Option<ProtocolEvent>> {
        match self {
            Self::V4(handler) => handler.process_data(link, data, secure),
            Self::V6(handler) => handler.process_data(link, data, secure),
        }
    }

    /// Answer the server's authentication advertisement
    #[instrument(skip_all, fields(sub_version = self.sub_version()))]
    pub async fn send_authentication_request(
        &self,
        unpacker: &mut Unpacker,
        link: &mut dyn Transport,
    ) -> Result<()> {
        let context = self.context();
        let request =
            handshake::build_auth_request(unpacker, &context.identity, &context.cipher).await?;
        link.encryption()
            .store(request.requires_encryption, Ordering::SeqCst);
        link.send(request.packet, request.encrypt);
        Ok(())
    }

    pub fn send_ping(&self, link: &mut dyn Transport) -> bool {
        wire::send_packet(link, &self.context().pool, false, |p| wire::pack_bare(p, NHT_PING))
    }

    pub fn send_message(
        &self,
        link: &mut dyn Transport,
        request_id: i16,
        target: &ConversationTarget,
        text: &str,
    ) -> bool {
        wire::send_packet(link, &self.context().pool, true, |p| {
            wire::pack_send_text(p, request_id, target, text)
        })
    }

    pub fn send_file_chunk(
        &self,
        link: &mut dyn Transport,
        request_id: i16,
        target: &ConversationTarget,
        file_name: &str,
        chunk: &UploadChunk,
    ) -> bool {
        match self {
            Self::V4(handler) => handler.send_file_chunk(link, request_id, target, file_name, chunk),
            Self::V6(handler) => wire::send_packet(link, &handler.context().pool, true, |p| {
                wire::pack_file_chunk(p, request_id, target, file_name, chunk)
            }),
        }
    }

    pub fn request_attachment_download(
        &self,
        link: &mut dyn Transport,
        request_id: i16,
        attachment_guid: &str,
    ) -> bool {
        let context = self.context();
        wire::send_packet(link, &context.pool, true, |p| {
            wire::pack_attachment_request(p, request_id, context.chunk_size, attachment_guid)
        })
    }

    pub fn request_lite_conversations(&self, link: &mut dyn Transport) -> bool {
        wire::send_packet(link, &self.context().pool, true, |p| {
            wire::pack_bare(p, NHT_LITE_CONVERSATION_RETRIEVAL)
        })
    }

    pub fn request_conversation_info(&self, link: &mut dyn Transport, chat_guids: &[String]) -> bool {
        wire::send_packet(link, &self.context().pool, true, |p| {
            wire::pack_conversation_info_request(p, chat_guids)
        })
    }

    pub fn request_lite_thread(
        &self,
        link: &mut dyn Transport,
        chat_guid: &str,
        first_message_id: Option<i64>,
    ) -> bool {
        wire::send_packet(link, &self.context().pool, true, |p| {
            wire::pack_thread_request(p, chat_guid, first_message_id)
        })
    }

    pub fn request_chat_creation(
        &self,
        link: &mut dyn Transport,
        request_id: i16,
        members: &[String],
        service: &str,
    ) -> bool {
        wire::send_packet(link, &self.context().pool, true, |p| {
            wire::pack_create_chat(p, request_id, members, service)
        })
    }

    pub fn request_retrieval_time(
        &self,
        link: &mut dyn Transport,
        lower: SystemTime,
        upper: SystemTime,
    ) -> bool {
        wire::send_packet(link, &self.context().pool, true, |p| {
            wire::pack_time_retrieval(p, lower, upper)
        })
    }

    pub fn request_retrieval_id(
        &self,
        link: &mut dyn Transport,
        id_lower: i64,
        lower: SystemTime,
        upper: SystemTime,
    ) -> bool {
        wire::send_packet(link, &self.context().pool, true, |p| {
            wire::pack_id_retrieval(p, id_lower, lower, upper)
        })
    }

    pub fn request_install_remote_update(&self, link: &mut dyn Transport, update_id: i32) -> bool {
        match self {
            Self::V4(_) => false,
            Self::V6(handler) => handler.request_install_remote_update(link, update_id),
        }
    }

    pub fn request_face_time_link(&self, link: &mut dyn Transport) -> bool {
        match self {
            Self::V4(_) => false,
            Self::V6(handler) => handler.request_face_time_link(link),
        }
    }

    pub fn initiate_face_time_call(&self, link: &mut dyn Transport, addresses: &[String]) -> bool {
        match self {
            Self::V4(_) => false,
            Self::V6(handler) => handler.initiate_face_time_call(link, addresses),
        }
    }

    pub fn handle_incoming_face_time_call(
        &self,
        link: &mut dyn Transport,
        caller: &str,
        accept: bool,
    ) -> bool {
        match self {
            Self::V4(_) => false,
            Self::V6(handler) => handler.handle_incoming_face_time_call(link, caller, accept),
        }
    }

    pub fn drop_face_time_call(&self, link: &mut dyn Transport) -> bool {
        match self {
            Self::V4(_) => false,
            Self::V6(handler) => handler.drop_face_time_call(link),
        }
    }
}

// Packet readers shared by the sub-version handlers

pub(crate) fn send_pong(link: &mut dyn Transport, pool: &PackerPool) {
    debug!("Answering ping");
    wire::send_packet(link, pool, false, |p| wire::pack_bare(p, NHT_PONG));
}

pub(crate) fn authentication_result(
    unpacker: &mut Unpacker,
    extended: bool,
) -> Result<ProtocolEvent> {
    Ok(match handshake::parse_auth_reply(unpacker, extended)? {
        Ok(info) => ProtocolEvent::Authenticated(info),
        Err(reason) => ProtocolEvent::AuthenticationFailed(reason),
    })
}

/// Items arrive newest first
fn unpack_items<F>(unpacker: &mut Unpacker, read_item: F) -> Result<Vec<ConversationItem>>
where
    F: FnMut(&mut Unpacker) -> Result<Option<ConversationItem>>,
{
    let mut items = wire::unpack_array(unpacker, read_item)?;
    items.reverse();
    Ok(items)
}

pub(crate) fn message_update<F>(unpacker: &mut Unpacker, read_item: F) -> Result<ProtocolEvent>
where
    F: FnMut(&mut Unpacker) -> Result<Option<ConversationItem>>,
{
    Ok(ProtocolEvent::MessageUpdate(unpack_items(unpacker, read_item)?))
}

pub(crate) fn thread<F>(unpacker: &mut Unpacker, read_item: F) -> Result<ProtocolEvent>
where
    F: FnMut(&mut Unpacker) -> Result<Option<ConversationItem>>,
{
    let (chat_guid, first_message_id) = wire::unpack_thread_header(unpacker)?;
    Ok(ProtocolEvent::Thread {
        chat_guid,
        first_message_id,
        items: unpack_items(unpacker, read_item)?,
    })
}

pub(crate) fn conversation_update(unpacker: &mut Unpacker) -> Result<ProtocolEvent> {
    Ok(ProtocolEvent::ConversationUpdate(wire::unpack_array(
        unpacker,
        |u| wire::unpack_requested_conversation(u).map(Some),
    )?))
}

pub(crate) fn conversations(unpacker: &mut Unpacker) -> Result<ProtocolEvent> {
    Ok(ProtocolEvent::Conversations(wire::unpack_array(
        unpacker,
        |u| wire::unpack_preview_conversation(u).map(Some),
    )?))
}

pub(crate) fn file_request_failed(unpacker: &mut Unpacker) -> Result<ProtocolEvent> {
    Ok(ProtocolEvent::FileRequestFailed {
        request_id: unpacker.unpack_short()?,
        error: wire::map_attachment_error(unpacker.unpack_int()?),
    })
}

pub(crate) fn send_result(unpacker: &mut Unpacker) -> Result<ProtocolEvent> {
    let (request_id, error) = wire::unpack_send_result(unpacker)?;
    Ok(ProtocolEvent::SendResult { request_id, error })
}

pub(crate) fn create_chat_result(unpacker: &mut Unpacker) -> Result<ProtocolEvent> {
    Ok(ProtocolEvent::CreateChatResult {
        request_id: unpacker.unpack_short()?,
        error: wire::map_create_chat_result(unpacker.unpack_int()?),
        details: unpacker.unpack_nullable_string()?,
    })
}
