//! Protocol sub-version 4.
//!
//! The baseline handler: messaging, attachments and conversation retrieval.
//! Remote updates and calling are not part of this sub-version.

use crate::core::unpacker::Unpacker;
use crate::error::{ConnectionErrorCode, Result};
use crate::protocol::handler::{self, HandlerContext, ProtocolEvent};
use crate::protocol::message::{ConversationItem, ConversationTarget, MessageModifier};
use crate::protocol::nht::{self, *};
use crate::protocol::transfer::UploadChunk;
use crate::protocol::wire;
use crate::transport::Transport;
use bytes::Bytes;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct V4Handler {
    context: HandlerContext,
}

impl V4Handler {
    pub fn new(context: HandlerContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &HandlerContext {
        &self.context
    }

    pub fn process_data(
        &mut self,
        link: &mut dyn Transport,
        data: Bytes,
        secure: bool,
    ) -> Result<Option<ProtocolEvent>> {
        let mut unpacker = Unpacker::new(data);
        let message_type = unpacker.unpack_int()?;

        if secure {
            self.process_secure(link, message_type, &mut unpacker)
        } else {
            self.process_insecure(link, message_type, &mut unpacker)
        }
    }

    fn process_insecure(
        &self,
        link: &mut dyn Transport,
        message_type: i32,
        unpacker: &mut Unpacker,
    ) -> Result<Option<ProtocolEvent>> {
        match message_type {
            NHT_CLOSE => Ok(Some(ProtocolEvent::Disconnect(
                ConnectionErrorCode::Connection,
            ))),
            NHT_PING => {
                handler::send_pong(link, &self.context.pool);
                Ok(None)
            }
            NHT_AUTHENTICATION => handler::authentication_result(unpacker, false).map(Some),
            _ => {
                debug!(message_type, "Ignoring packet");
                Ok(None)
            }
        }
    }

    fn process_secure(
        &self,
        link: &mut dyn Transport,
        message_type: i32,
        unpacker: &mut Unpacker,
    ) -> Result<Option<ProtocolEvent>> {
        let event = match message_type {
            NHT_MESSAGE_UPDATE | NHT_TIME_RETRIEVAL => handler::message_update(unpacker, read_item)?,
            NHT_CONVERSATION_UPDATE => handler::conversation_update(unpacker)?,
            NHT_MODIFIER_UPDATE => {
                ProtocolEvent::ModifierUpdate(wire::unpack_array(unpacker, read_modifier)?)
            }
            NHT_ATTACHMENT_REQ => ProtocolEvent::FileChunk(wire::unpack_download_chunk(unpacker)?),
            NHT_ATTACHMENT_REQ_CONFIRM => return Ok(None),
            NHT_ATTACHMENT_REQ_FAIL => handler::file_request_failed(unpacker)?,
            NHT_ID_UPDATE => ProtocolEvent::IdUpdate(unpacker.unpack_long()?),
            NHT_LITE_CONVERSATION_RETRIEVAL => handler::conversations(unpacker)?,
            NHT_LITE_THREAD_RETRIEVAL => handler::thread(unpacker, read_item)?,
            NHT_SEND_RESULT => handler::send_result(unpacker)?,
            NHT_CREATE_CHAT => handler::create_chat_result(unpacker)?,
            _ => return self.process_insecure(link, message_type, unpacker),
        };
        Ok(Some(event))
    }

    /// File chunks carry the conversation before the data in this sub-version
    pub fn send_file_chunk(
        &self,
        link: &mut dyn Transport,
        request_id: i16,
        target: &ConversationTarget,
        file_name: &str,
        chunk: &UploadChunk,
    ) -> bool {
        wire::send_packet(link, &self.context.pool, true, |p| {
            p.pack_int(if target.is_linked() {
                NHT_SEND_FILE_EXISTING
            } else {
                NHT_SEND_FILE_NEW
            });
            p.pack_short(request_id);
            p.pack_int(chunk.index);
            p.pack_bool(chunk.is_last);
            match target {
                ConversationTarget::Linked { guid } => p.pack_string(guid),
                ConversationTarget::Unlinked { members, .. } => p.pack_string_array(members),
            }
            p.pack_payload(&chunk.data);
            if chunk.index == 0 {
                p.pack_string(file_name);
                if let ConversationTarget::Unlinked { service, .. } = target {
                    p.pack_string(service);
                }
            }
        })
    }
}

fn read_item(unpacker: &mut Unpacker) -> Result<Option<ConversationItem>> {
    let (item_type, header) = wire::unpack_item_header(unpacker)?;
    let item = match item_type {
        nht::item_type::MESSAGE => {
            ConversationItem::Message(wire::unpack_message_base(unpacker, header, read_modifier)?)
        }
        nht::item_type::PARTICIPANT_ACTION => {
            ConversationItem::ParticipantAction(wire::unpack_participant_action(unpacker, header)?)
        }
        nht::item_type::CHAT_RENAME => {
            ConversationItem::ChatRename(wire::unpack_chat_rename(unpacker, header)?)
        }
        other => {
            warn!(item_type = other, "Skipping unknown conversation item");
            return Ok(None);
        }
    };
    Ok(Some(item))
}

fn read_modifier(unpacker: &mut Unpacker) -> Result<Option<MessageModifier>> {
    let modifier_type = unpacker.unpack_int()?;
    let message_guid = unpacker.unpack_string()?;
    Ok(match modifier_type {
        nht::modifier_type::ACTIVITY => Some(MessageModifier::StatusUpdate(
            wire::unpack_status_update(unpacker, message_guid)?,
        )),
        nht::modifier_type::STICKER => Some(MessageModifier::Sticker(wire::unpack_sticker(
            unpacker,
            message_guid,
        )?)),
        nht::modifier_type::TAPBACK => {
            wire::unpack_tapback(unpacker, message_guid)?.map(MessageModifier::Tapback)
        }
        other => {
            warn!(modifier_type = other, "Skipping unknown modifier");
            None
        }
    })
}
