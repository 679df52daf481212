//! # Wire Helpers
//!
//! Pure pack/unpack functions shared by the sub-version handlers.
//!
//! Nothing here keeps state. Each handler composes these helpers into its own
//! packet handling, so a field added by one sub-version never leaks into another.

use crate::core::packer::Packer;
use crate::core::unpacker::Unpacker;
use crate::error::{
    AttachmentRequestErrorCode, ConnectionErrorCode, CreateChatErrorCode, FaceTimeInitiateCode,
    MessageError, MessageErrorCode, RemoteUpdateErrorCode, Result,
};
use crate::protocol::message::{
    AttachmentItem, ChatRenameAction, ConversationPreview, ConversationTarget, DownloadHeader,
    ItemHeader, LinkedConversation, MessageItem, MessageModifier, MessageStatusCode,
    ParticipantAction, ParticipantActionType, RequestedConversation, ServerUpdateData,
    StatusUpdate, StickerItem, TapbackItem, TapbackType, DEFAULT_MIME_TYPE,
};
use crate::protocol::nht::*;
use crate::protocol::transfer::{DownloadChunk, UploadChunk};
use crate::transport::Transport;
use crate::utils::buffer_pool::PackerPool;
use crate::utils::compression::{self, MAX_INFLATE_SIZE};
use crate::utils::time::{from_unix_millis, to_unix_millis};
use std::time::SystemTime;
use tracing::warn;

/// Build a packet with a pooled packer and queue it on the transport
pub fn send_packet<F>(link: &mut dyn Transport, pool: &PackerPool, encrypt: bool, build: F) -> bool
where
    F: FnOnce(&mut Packer),
{
    let mut packer = pool.acquire();
    build(&mut packer);
    link.send(packer.to_bytes(), encrypt)
}

/// Read an array, dropping elements the reader chose to skip
pub fn unpack_array<T, F>(unpacker: &mut Unpacker, mut read: F) -> Result<Vec<T>>
where
    F: FnMut(&mut Unpacker) -> Result<Option<T>>,
{
    let count = unpacker.unpack_array_header()?;
    let mut items = Vec::with_capacity(count.min(unpacker.remaining()));
    for _ in 0..count {
        if let Some(item) = read(unpacker)? {
            items.push(item);
        }
    }
    Ok(items)
}

pub fn unpack_date(unpacker: &mut Unpacker) -> Result<SystemTime> {
    Ok(from_unix_millis(unpacker.unpack_long()?))
}

// Result code mapping

pub fn map_message_status(code: i32) -> MessageStatusCode {
    match code {
        receipt::SENT => MessageStatusCode::Sent,
        receipt::DELIVERED => MessageStatusCode::Delivered,
        receipt::READ => MessageStatusCode::Read,
        _ => MessageStatusCode::Idle,
    }
}

pub fn map_db_error(code: i32) -> Option<MessageErrorCode> {
    match code {
        db_state::OK => None,
        db_state::NETWORK => Some(MessageErrorCode::AppleNetwork),
        db_state::UNREGISTERED => Some(MessageErrorCode::AppleUnregistered),
        _ => Some(MessageErrorCode::ServerUnknown),
    }
}

pub fn map_participant_action(code: i32) -> ParticipantActionType {
    match code {
        group_action::JOIN => ParticipantActionType::Join,
        group_action::LEAVE => ParticipantActionType::Leave,
        _ => ParticipantActionType::Unknown,
    }
}

pub fn map_tapback_type(code: i32) -> Option<TapbackType> {
    match code {
        0 => Some(TapbackType::Love),
        1 => Some(TapbackType::Like),
        2 => Some(TapbackType::Dislike),
        3 => Some(TapbackType::Laugh),
        4 => Some(TapbackType::Emphasis),
        5 => Some(TapbackType::Question),
        _ => None,
    }
}

pub fn map_auth_result(code: i32) -> Option<ConnectionErrorCode> {
    match code {
        auth_result::OK => None,
        auth_result::UNAUTHORIZED => Some(ConnectionErrorCode::Unauthorized),
        auth_result::BAD_REQUEST => Some(ConnectionErrorCode::BadRequest),
        _ => Some(ConnectionErrorCode::Connection),
    }
}

pub fn map_attachment_error(code: i32) -> AttachmentRequestErrorCode {
    match code {
        attachment_error::NOT_FOUND => AttachmentRequestErrorCode::ServerNotFound,
        attachment_error::NOT_SAVED => AttachmentRequestErrorCode::ServerNotSaved,
        attachment_error::UNREADABLE => AttachmentRequestErrorCode::ServerUnreadable,
        attachment_error::IO_ERROR => AttachmentRequestErrorCode::ServerIO,
        _ => AttachmentRequestErrorCode::ServerUnknown,
    }
}

pub fn map_send_result(code: i32) -> Option<MessageErrorCode> {
    match code {
        send_result::OK => None,
        send_result::SCRIPT_ERROR | send_result::INTERNAL_ERROR => {
            Some(MessageErrorCode::ServerExternal)
        }
        send_result::BAD_REQUEST => Some(MessageErrorCode::ServerBadRequest),
        send_result::UNAUTHORIZED => Some(MessageErrorCode::ServerUnauthorized),
        send_result::NO_CONVERSATION => Some(MessageErrorCode::AppleNoConversation),
        send_result::REQUEST_TIMEOUT => Some(MessageErrorCode::ServerTimeout),
        _ => Some(MessageErrorCode::ServerUnknown),
    }
}

pub fn map_create_chat_result(code: i32) -> Option<CreateChatErrorCode> {
    match code {
        create_chat_result::OK => None,
        create_chat_result::SCRIPT_ERROR => Some(CreateChatErrorCode::ScriptError),
        create_chat_result::BAD_REQUEST => Some(CreateChatErrorCode::BadRequest),
        create_chat_result::UNAUTHORIZED => Some(CreateChatErrorCode::Unauthorized),
        create_chat_result::NOT_SUPPORTED => Some(CreateChatErrorCode::NotSupported),
        _ => Some(CreateChatErrorCode::UnknownExternal),
    }
}

pub fn map_update_error(code: i32) -> RemoteUpdateErrorCode {
    match code {
        update_error::DOWNLOAD => RemoteUpdateErrorCode::Download,
        update_error::BAD_PACKAGE => RemoteUpdateErrorCode::BadPackage,
        update_error::INTERNAL => RemoteUpdateErrorCode::Internal,
        update_error::READ_ONLY_VOLUME => RemoteUpdateErrorCode::ReadOnlyVolume,
        _ => RemoteUpdateErrorCode::Unknown,
    }
}

pub fn map_call_initiate(code: i32) -> FaceTimeInitiateCode {
    match code {
        call_initiate::OK => FaceTimeInitiateCode::Ok,
        call_initiate::BAD_MEMBERS => FaceTimeInitiateCode::BadMembers,
        _ => FaceTimeInitiateCode::External,
    }
}

// Entities

/// Read the type code and shared fields of a conversation item
pub fn unpack_item_header(unpacker: &mut Unpacker) -> Result<(i32, ItemHeader)> {
    let item_type = unpacker.unpack_int()?;
    let header = ItemHeader {
        server_id: unpacker.unpack_long()?,
        guid: unpacker.unpack_string()?,
        chat_guid: unpacker.unpack_string()?,
        date: unpack_date(unpacker)?,
    };
    Ok((item_type, header))
}

/// Read the message fields common to every sub-version
///
/// `read_modifier` is the sub-version's own modifier reader; only stickers and
/// tapbacks are kept from the two embedded modifier arrays.
pub fn unpack_message_base<F>(
    unpacker: &mut Unpacker,
    header: ItemHeader,
    mut read_modifier: F,
) -> Result<MessageItem>
where
    F: FnMut(&mut Unpacker) -> Result<Option<MessageModifier>>,
{
    let text = unpacker.unpack_nullable_string()?;
    let subject = unpacker.unpack_nullable_string()?;
    let sender = unpacker.unpack_nullable_string()?;
    let attachments = unpack_array(unpacker, |u| unpack_attachment(u).map(Some))?;
    let stickers = unpack_array(unpacker, |u| {
        Ok(match read_modifier(u)? {
            Some(MessageModifier::Sticker(sticker)) => Some(sticker),
            _ => None,
        })
    })?;
    let tapbacks = unpack_array(unpacker, |u| {
        Ok(match read_modifier(u)? {
            Some(MessageModifier::Tapback(tapback)) => Some(tapback),
            _ => None,
        })
    })?;
    let send_style = unpacker.unpack_nullable_string()?;
    let status = map_message_status(unpacker.unpack_int()?);
    let error = map_db_error(unpacker.unpack_int()?).map(MessageError::new);
    let status_date = unpack_date(unpacker)?;

    Ok(MessageItem {
        header,
        text,
        subject,
        sender,
        attachments,
        stickers,
        tapbacks,
        send_style,
        status,
        error,
        status_date,
        edit_history: Vec::new(),
        is_unsent: false,
    })
}

pub fn unpack_participant_action(
    unpacker: &mut Unpacker,
    header: ItemHeader,
) -> Result<ParticipantAction> {
    let user = unpacker.unpack_nullable_string()?;
    let target = unpacker.unpack_nullable_string()?;
    let action_type = map_participant_action(unpacker.unpack_int()?);
    Ok(ParticipantAction {
        header,
        action_type,
        user,
        target,
    })
}

pub fn unpack_chat_rename(unpacker: &mut Unpacker, header: ItemHeader) -> Result<ChatRenameAction> {
    Ok(ChatRenameAction {
        header,
        user: unpacker.unpack_nullable_string()?,
        chat_name: unpacker.unpack_nullable_string()?,
    })
}

pub fn unpack_attachment(unpacker: &mut Unpacker) -> Result<AttachmentItem> {
    Ok(AttachmentItem {
        guid: unpacker.unpack_string()?,
        name: unpacker.unpack_string()?,
        mime_type: unpacker
            .unpack_nullable_string()?
            .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
        size: unpacker.unpack_long()?,
        checksum: unpacker.unpack_nullable_payload()?.map(hex::encode),
        sort: unpacker.unpack_long()?,
    })
}

pub fn unpack_status_update(unpacker: &mut Unpacker, message_guid: String) -> Result<StatusUpdate> {
    Ok(StatusUpdate {
        message_guid,
        status: map_message_status(unpacker.unpack_int()?),
        date: unpack_date(unpacker)?,
    })
}

pub fn unpack_sticker(unpacker: &mut Unpacker, message_guid: String) -> Result<StickerItem> {
    let message_index = unpacker.unpack_int()?;
    let _file_guid = unpacker.unpack_string()?;
    let sender = unpacker.unpack_nullable_string()?;
    let date = unpack_date(unpacker)?;
    let data = compression::inflate(&unpacker.unpack_payload()?, MAX_INFLATE_SIZE)?;
    let data_type = unpacker.unpack_string()?;

    Ok(StickerItem {
        message_guid,
        message_index,
        sender,
        date,
        data_type,
        data,
    })
}

/// Read a tapback; unknown tapback types are skipped
pub fn unpack_tapback(unpacker: &mut Unpacker, message_guid: String) -> Result<Option<TapbackItem>> {
    let message_index = unpacker.unpack_int()?;
    let sender = unpacker.unpack_nullable_string()?;
    let is_addition = unpacker.unpack_bool()?;
    let code = unpacker.unpack_int()?;

    let Some(tapback_type) = map_tapback_type(code) else {
        warn!(code, "Unknown tapback type");
        return Ok(None);
    };

    Ok(Some(TapbackItem {
        message_guid,
        message_index,
        sender,
        is_addition,
        tapback_type,
    }))
}

fn unpack_members(unpacker: &mut Unpacker) -> Result<Vec<String>> {
    unpacker.unpack_string_array()
}

pub fn unpack_preview_conversation(unpacker: &mut Unpacker) -> Result<LinkedConversation> {
    let guid = unpacker.unpack_string()?;
    let service = unpacker.unpack_string()?;
    let name = unpacker.unpack_nullable_string()?;
    let members = unpack_members(unpacker)?;
    let preview = ConversationPreview {
        date: unpack_date(unpacker)?,
        sender: unpacker.unpack_nullable_string()?,
        text: unpacker.unpack_nullable_string()?,
        send_style: unpacker.unpack_nullable_string()?,
        attachments: unpacker.unpack_string_array()?,
    };

    Ok(LinkedConversation {
        guid,
        service,
        name,
        members,
        preview: Some(preview),
    })
}

pub fn unpack_requested_conversation(unpacker: &mut Unpacker) -> Result<RequestedConversation> {
    let guid = unpacker.unpack_string()?;
    if !unpacker.unpack_bool()? {
        return Ok(RequestedConversation {
            guid,
            conversation: None,
        });
    }

    let service = unpacker.unpack_string()?;
    let name = unpacker.unpack_nullable_string()?;
    let members = unpack_members(unpacker)?;
    Ok(RequestedConversation {
        conversation: Some(LinkedConversation {
            guid: guid.clone(),
            service,
            name,
            members,
            preview: None,
        }),
        guid,
    })
}

/// Read the chat GUID, first message ID and items of a thread response
pub fn unpack_thread_header(unpacker: &mut Unpacker) -> Result<(String, Option<i64>)> {
    let chat_guid = unpacker.unpack_string()?;
    let first_message_id = if unpacker.unpack_bool()? {
        Some(unpacker.unpack_long()?)
    } else {
        None
    };
    Ok((chat_guid, first_message_id))
}

pub fn unpack_download_chunk(unpacker: &mut Unpacker) -> Result<DownloadChunk> {
    let request_id = unpacker.unpack_short()?;
    let index = unpacker.unpack_int()?;
    let header = if index == 0 {
        Some(DownloadHeader {
            file_name: unpacker.unpack_nullable_string()?,
            mime_type: unpacker.unpack_nullable_string()?,
            file_length: unpacker.unpack_long()?,
        })
    } else {
        None
    };
    let is_last = unpacker.unpack_bool()?;
    let data = unpacker.unpack_payload()?;

    Ok(DownloadChunk {
        request_id,
        index,
        header,
        is_last,
        data,
    })
}

pub fn unpack_send_result(unpacker: &mut Unpacker) -> Result<(i16, Option<MessageError>)> {
    let request_id = unpacker.unpack_short()?;
    let code = map_send_result(unpacker.unpack_int()?);
    let details = unpacker.unpack_nullable_string()?;
    Ok((
        request_id,
        code.map(|code| MessageError::with_detail(code, details)),
    ))
}

pub fn unpack_update_listing(unpacker: &mut Unpacker) -> Result<Option<ServerUpdateData>> {
    if !unpacker.unpack_bool()? {
        return Ok(None);
    }

    let id = unpacker.unpack_int()?;
    let count = unpacker.unpack_array_header()?;
    let mut protocol_requirement = Vec::with_capacity(count.min(unpacker.remaining() / 4));
    for _ in 0..count {
        protocol_requirement.push(unpacker.unpack_int()?);
    }

    Ok(Some(ServerUpdateData {
        id,
        protocol_requirement,
        version: unpacker.unpack_string()?,
        notes: unpacker.unpack_string()?,
        remote_installable: unpacker.unpack_bool()?,
    }))
}

// Requests

pub fn pack_target(packer: &mut Packer, target: &ConversationTarget) {
    match target {
        ConversationTarget::Linked { guid } => packer.pack_string(guid),
        ConversationTarget::Unlinked { members, service } => {
            packer.pack_string_array(members);
            packer.pack_string(service);
        }
    }
}

pub fn pack_send_text(packer: &mut Packer, request_id: i16, target: &ConversationTarget, text: &str) {
    packer.pack_int(if target.is_linked() {
        NHT_SEND_TEXT_EXISTING
    } else {
        NHT_SEND_TEXT_NEW
    });
    packer.pack_short(request_id);
    pack_target(packer, target);
    packer.pack_string(text);
}

/// One upload packet; the first chunk also carries the file name and target
///
/// Sub-version 4 places the target before the chunk data and is packed by its handler.
pub fn pack_file_chunk(
    packer: &mut Packer,
    request_id: i16,
    target: &ConversationTarget,
    file_name: &str,
    chunk: &UploadChunk,
) {
    packer.pack_int(if target.is_linked() {
        NHT_SEND_FILE_EXISTING
    } else {
        NHT_SEND_FILE_NEW
    });
    packer.pack_short(request_id);
    packer.pack_int(chunk.index);
    packer.pack_bool(chunk.is_last);
    packer.pack_payload(&chunk.data);
    if chunk.index == 0 {
        packer.pack_string(file_name);
        pack_target(packer, target);
    }
}

pub fn pack_attachment_request(packer: &mut Packer, request_id: i16, chunk_size: usize, guid: &str) {
    packer.pack_int(NHT_ATTACHMENT_REQ);
    packer.pack_short(request_id);
    packer.pack_int(chunk_size as i32);
    packer.pack_string(guid);
}

pub fn pack_conversation_info_request<S: AsRef<str>>(packer: &mut Packer, chat_guids: &[S]) {
    packer.pack_int(NHT_CONVERSATION_UPDATE);
    packer.pack_string_array(chat_guids);
}

pub fn pack_thread_request(packer: &mut Packer, chat_guid: &str, first_message_id: Option<i64>) {
    packer.pack_int(NHT_LITE_THREAD_RETRIEVAL);
    packer.pack_string(chat_guid);
    match first_message_id {
        Some(id) => {
            packer.pack_bool(true);
            packer.pack_long(id);
        }
        None => packer.pack_bool(false),
    }
}

pub fn pack_create_chat(packer: &mut Packer, request_id: i16, members: &[String], service: &str) {
    packer.pack_int(NHT_CREATE_CHAT);
    packer.pack_short(request_id);
    packer.pack_string_array(members);
    packer.pack_string(service);
}

pub fn pack_time_retrieval(packer: &mut Packer, lower: SystemTime, upper: SystemTime) {
    packer.pack_int(NHT_TIME_RETRIEVAL);
    packer.pack_long(to_unix_millis(lower));
    packer.pack_long(to_unix_millis(upper));
}

pub fn pack_id_retrieval(packer: &mut Packer, id_lower: i64, lower: SystemTime, upper: SystemTime) {
    packer.pack_int(NHT_ID_RETRIEVAL);
    packer.pack_long(id_lower);
    packer.pack_long(to_unix_millis(lower));
    packer.pack_long(to_unix_millis(upper));
}

/// A packet consisting of its type code alone
pub fn pack_bare(packer: &mut Packer, code: i32) {
    packer.pack_int(code);
}
