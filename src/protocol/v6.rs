//! Protocol sub-version 6.
//!
//! Adds message edits, remote server updates and call coordination on top of
//! the sub-version 4 feature set. Authentication replies carry the server's user
//! name and whether it can place calls.

use crate::core::unpacker::Unpacker;
use crate::error::{ConnectionErrorCode, Result};
use crate::protocol::handler::{self, HandlerContext, ProtocolEvent};
use crate::protocol::message::{ConversationItem, EditUpdate, MessageModifier, OutgoingCallResult};
use crate::protocol::nht::{self, *};
use crate::protocol::wire;
use crate::transport::Transport;
use bytes::Bytes;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct V6Handler {
    context: HandlerContext,
}

impl V6Handler {
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
            NHT_AUTHENTICATION => handler::authentication_result(unpacker, true).map(Some),
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
            NHT_SOFTWARE_UPDATE_LISTING => {
                ProtocolEvent::SoftwareUpdateListing(wire::unpack_update_listing(unpacker)?)
            }
            NHT_SOFTWARE_UPDATE_INSTALL => ProtocolEvent::SoftwareUpdateInstall(unpacker.unpack_bool()?),
            NHT_SOFTWARE_UPDATE_ERROR => ProtocolEvent::SoftwareUpdateError {
                code: wire::map_update_error(unpacker.unpack_int()?),
                details: unpacker.unpack_string()?,
            },
            NHT_FACETIME_CREATE_LINK => {
                let call_link = if unpacker.unpack_bool()? {
                    Some(unpacker.unpack_string()?)
                } else {
                    None
                };
                ProtocolEvent::FaceTimeLink(call_link)
            }
            NHT_FACETIME_OUTGOING_INITIATE => ProtocolEvent::FaceTimeInitiated {
                code: wire::map_call_initiate(unpacker.unpack_int()?),
                details: unpacker.unpack_nullable_string()?,
            },
            NHT_FACETIME_OUTGOING_HANDLED => match unpacker.unpack_int()? {
                nht::call_handled::ACCEPTED => ProtocolEvent::FaceTimeOutgoing(
                    OutgoingCallResult::Accepted {
                        link: unpacker.unpack_string()?,
                    },
                ),
                nht::call_handled::REJECTED => {
                    ProtocolEvent::FaceTimeOutgoing(OutgoingCallResult::Rejected)
                }
                nht::call_handled::ERROR => ProtocolEvent::FaceTimeOutgoing(OutgoingCallResult::Error {
                    details: unpacker.unpack_nullable_string()?,
                }),
                other => {
                    warn!(code = other, "Unknown outgoing call result");
                    return Ok(None);
                }
            },
            NHT_FACETIME_INCOMING_CALLER_UPDATE => {
                ProtocolEvent::IncomingCaller(unpacker.unpack_nullable_string()?)
            }
            NHT_FACETIME_INCOMING_HANDLE => {
                let result = if unpacker.unpack_bool()? {
                    Ok(unpacker.unpack_string()?)
                } else {
                    Err(unpacker.unpack_nullable_string()?)
                };
                ProtocolEvent::IncomingHandled(result)
            }
            _ => return self.process_insecure(link, message_type, unpacker),
        };
        Ok(Some(event))
    }

    pub fn request_install_remote_update(&self, link: &mut dyn Transport, update_id: i32) -> bool {
        wire::send_packet(link, &self.context.pool, true, |p| {
            p.pack_int(NHT_SOFTWARE_UPDATE_INSTALL);
            p.pack_int(update_id);
        })
    }

    pub fn request_face_time_link(&self, link: &mut dyn Transport) -> bool {
        wire::send_packet(link, &self.context.pool, true, |p| {
            wire::pack_bare(p, NHT_FACETIME_CREATE_LINK)
        })
    }

    pub fn initiate_face_time_call(&self, link: &mut dyn Transport, addresses: &[String]) -> bool {
        wire::send_packet(link, &self.context.pool, true, |p| {
            p.pack_int(NHT_FACETIME_OUTGOING_INITIATE);
            p.pack_string_array(addresses);
        })
    }

    pub fn handle_incoming_face_time_call(
        &self,
        link: &mut dyn Transport,
        caller: &str,
        accept: bool,
    ) -> bool {
        wire::send_packet(link, &self.context.pool, true, |p| {
            p.pack_int(NHT_FACETIME_INCOMING_HANDLE);
            p.pack_string(caller);
            p.pack_bool(accept);
        })
    }

    pub fn drop_face_time_call(&self, link: &mut dyn Transport) -> bool {
        wire::send_packet(link, &self.context.pool, true, |p| {
            wire::pack_bare(p, NHT_FACETIME_DISCONNECT)
        })
    }
}

fn read_item(unpacker: &mut Unpacker) -> Result<Option<ConversationItem>> {
    let (item_type, header) = wire::unpack_item_header(unpacker)?;
    let item = match item_type {
        nht::item_type::MESSAGE => {
            let mut message = wire::unpack_message_base(unpacker, header, read_modifier)?;
            message.edit_history = unpacker.unpack_string_array()?;
            message.is_unsent = unpacker.unpack_bool()?;
            ConversationItem::Message(message)
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
        nht::modifier_type::EDIT => Some(MessageModifier::Edit(EditUpdate {
            message_guid,
            edit_history: unpacker.unpack_string_array()?,
            is_unsent: unpacker.unpack_bool()?,
        })),
        other => {
            warn!(modifier_type = other, "Skipping unknown modifier");
            None
        }
    })
}
