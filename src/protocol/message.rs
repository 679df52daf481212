//! # Conversation Entities
//!
//! In-memory representation of the data carried by the comm5 protocol.
//!
//! Every type here is plain data: handlers build them from received packets and
//! the connection manager hands them to observers and waiting callers.

use crate::error::MessageError;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// MIME type assumed when the server does not report one
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MessageStatusCode {
    #[default]
    Idle,
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TapbackType {
    Love,
    Like,
    Dislike,
    Laugh,
    Emphasis,
    Question,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ParticipantActionType {
    #[default]
    Unknown,
    Join,
    Leave,
}

/// A file attached to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentItem {
    pub guid: String,
    pub name: String,
    pub mime_type: String,
    pub size: i64,
    /// Hex-encoded checksum of the file, if the server computed one
    pub checksum: Option<String>,
    pub sort: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub message_guid: String,
    pub status: MessageStatusCode,
    pub date: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickerItem {
    pub message_guid: String,
    pub message_index: i32,
    pub sender: Option<String>,
    pub date: SystemTime,
    pub data_type: String,
    /// Decompressed image data
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapbackItem {
    pub message_guid: String,
    pub message_index: i32,
    pub sender: Option<String>,
    pub is_addition: bool,
    pub tapback_type: TapbackType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditUpdate {
    pub message_guid: String,
    pub edit_history: Vec<String>,
    pub is_unsent: bool,
}

/// A change applied to an existing message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageModifier {
    StatusUpdate(StatusUpdate),
    Sticker(StickerItem),
    Tapback(TapbackItem),
    Edit(EditUpdate),
}

impl MessageModifier {
    pub fn message_guid(&self) -> &str {
        match self {
            Self::StatusUpdate(m) => &m.message_guid,
            Self::Sticker(m) => &m.message_guid,
            Self::Tapback(m) => &m.message_guid,
            Self::Edit(m) => &m.message_guid,
        }
    }
}

/// Fields shared by every conversation item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemHeader {
    pub server_id: i64,
    pub guid: String,
    pub chat_guid: String,
    pub date: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageItem {
    pub header: ItemHeader,
    pub text: Option<String>,
    pub subject: Option<String>,
    /// `None` for outgoing messages
    pub sender: Option<String>,
    pub attachments: Vec<AttachmentItem>,
    pub stickers: Vec<StickerItem>,
    pub tapbacks: Vec<TapbackItem>,
    pub send_style: Option<String>,
    pub status: MessageStatusCode,
    pub error: Option<MessageError>,
    pub status_date: SystemTime,
    pub edit_history: Vec<String>,
    pub is_unsent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantAction {
    pub header: ItemHeader,
    pub action_type: ParticipantActionType,
    pub user: Option<String>,
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRenameAction {
    pub header: ItemHeader,
    pub user: Option<String>,
    pub chat_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationItem {
    Message(MessageItem),
    ParticipantAction(ParticipantAction),
    ChatRename(ChatRenameAction),
}

impl ConversationItem {
    pub fn header(&self) -> &ItemHeader {
        match self {
            Self::Message(item) => &item.header,
            Self::ParticipantAction(item) => &item.header,
            Self::ChatRename(item) => &item.header,
        }
    }

    pub fn server_id(&self) -> i64 {
        self.header().server_id
    }

    pub fn guid(&self) -> &str {
        &self.header().guid
    }

    pub fn chat_guid(&self) -> &str {
        &self.header().chat_guid
    }
}

/// Summary of the newest message in a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationPreview {
    pub date: SystemTime,
    pub sender: Option<String>,
    pub text: Option<String>,
    pub send_style: Option<String>,
    pub attachments: Vec<String>,
}

/// A conversation that exists on the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedConversation {
    pub guid: String,
    pub service: String,
    pub name: Option<String>,
    pub members: Vec<String>,
    /// Absent when the conversation was fetched by GUID
    pub preview: Option<ConversationPreview>,
}

/// The answer for one GUID of a conversation info request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedConversation {
    pub guid: String,
    /// `None` if the server does not know the conversation
    pub conversation: Option<LinkedConversation>,
}

/// Where an outgoing message goes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationTarget {
    /// An existing conversation
    Linked { guid: String },
    /// A conversation the server creates on first send
    Unlinked { members: Vec<String>, service: String },
}

impl ConversationTarget {
    pub fn linked(guid: impl Into<String>) -> Self {
        Self::Linked { guid: guid.into() }
    }

    pub fn is_linked(&self) -> bool {
        matches!(self, Self::Linked { .. })
    }
}

/// Information the server reports after authentication
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    pub installation_id: String,
    pub device_name: String,
    pub system_version: String,
    pub software_version: String,
    pub supports_face_time: bool,
}

/// A server software update available for remote installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerUpdateData {
    pub id: i32,
    pub protocol_requirement: Vec<i32>,
    pub version: String,
    pub notes: String,
    pub remote_installable: bool,
}

/// Metadata sent with the first chunk of a download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadHeader {
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub file_length: i64,
}

/// A completed attachment download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDownloadResult {
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub data: Vec<u8>,
}

/// How the remote party answered an outgoing call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutgoingCallResult {
    Accepted { link: String },
    Rejected,
    Error { details: Option<String> },
}
