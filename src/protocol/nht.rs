//! Packet type codes ("net header types") and result codes of the comm5 protocol family.

/// Server version advertisement
pub const NHT_INFORMATION: i32 = 100;

pub const NHT_CLOSE: i32 = 0;
pub const NHT_PING: i32 = 1;
pub const NHT_PONG: i32 = 2;

pub const NHT_AUTHENTICATION: i32 = 101;

pub const NHT_MESSAGE_UPDATE: i32 = 200;
pub const NHT_TIME_RETRIEVAL: i32 = 201;
pub const NHT_ID_RETRIEVAL: i32 = 202;
pub const NHT_MASS_RETRIEVAL: i32 = 203;
pub const NHT_MASS_RETRIEVAL_FILE: i32 = 204;
pub const NHT_MASS_RETRIEVAL_FINISH: i32 = 205;
pub const NHT_CONVERSATION_UPDATE: i32 = 206;
pub const NHT_MODIFIER_UPDATE: i32 = 207;
pub const NHT_ATTACHMENT_REQ: i32 = 208;
pub const NHT_ATTACHMENT_REQ_CONFIRM: i32 = 209;
pub const NHT_ATTACHMENT_REQ_FAIL: i32 = 210;
pub const NHT_ID_UPDATE: i32 = 211;

pub const NHT_LITE_CONVERSATION_RETRIEVAL: i32 = 300;
pub const NHT_LITE_THREAD_RETRIEVAL: i32 = 301;

pub const NHT_SEND_RESULT: i32 = 400;
pub const NHT_SEND_TEXT_EXISTING: i32 = 401;
pub const NHT_SEND_TEXT_NEW: i32 = 402;
pub const NHT_SEND_FILE_EXISTING: i32 = 403;
pub const NHT_SEND_FILE_NEW: i32 = 404;
pub const NHT_CREATE_CHAT: i32 = 405;

pub const NHT_SOFTWARE_UPDATE_LISTING: i32 = 500;
pub const NHT_SOFTWARE_UPDATE_INSTALL: i32 = 501;
pub const NHT_SOFTWARE_UPDATE_ERROR: i32 = 502;

pub const NHT_FACETIME_CREATE_LINK: i32 = 600;
pub const NHT_FACETIME_OUTGOING_INITIATE: i32 = 601;
pub const NHT_FACETIME_OUTGOING_HANDLED: i32 = 602;
pub const NHT_FACETIME_INCOMING_CALLER_UPDATE: i32 = 603;
pub const NHT_FACETIME_INCOMING_HANDLE: i32 = 604;
pub const NHT_FACETIME_DISCONNECT: i32 = 605;

/// Message receipt state
pub mod receipt {
    pub const IDLE: i32 = 0;
    pub const SENT: i32 = 1;
    pub const DELIVERED: i32 = 2;
    pub const READ: i32 = 3;
}

/// Database error state attached to a message
pub mod db_state {
    pub const OK: i32 = 0;
    pub const UNKNOWN: i32 = 1;
    pub const NETWORK: i32 = 2;
    pub const UNREGISTERED: i32 = 3;
}

pub mod auth_result {
    pub const OK: i32 = 0;
    pub const UNAUTHORIZED: i32 = 1;
    pub const BAD_REQUEST: i32 = 2;
}

pub mod attachment_error {
    pub const NOT_FOUND: i32 = 1;
    pub const NOT_SAVED: i32 = 2;
    pub const UNREADABLE: i32 = 3;
    pub const IO_ERROR: i32 = 4;
}

pub mod send_result {
    pub const OK: i32 = 0;
    pub const SCRIPT_ERROR: i32 = 1;
    pub const BAD_REQUEST: i32 = 2;
    pub const UNAUTHORIZED: i32 = 3;
    pub const NO_CONVERSATION: i32 = 4;
    pub const REQUEST_TIMEOUT: i32 = 5;
    pub const INTERNAL_ERROR: i32 = 6;
}

pub mod create_chat_result {
    pub const OK: i32 = 0;
    pub const SCRIPT_ERROR: i32 = 1;
    pub const BAD_REQUEST: i32 = 2;
    pub const UNAUTHORIZED: i32 = 3;
    pub const NOT_SUPPORTED: i32 = 4;
}

pub mod update_error {
    pub const DOWNLOAD: i32 = 0;
    pub const BAD_PACKAGE: i32 = 1;
    pub const INTERNAL: i32 = 2;
    pub const READ_ONLY_VOLUME: i32 = 3;
}

pub mod call_initiate {
    pub const OK: i32 = 0;
    pub const BAD_MEMBERS: i32 = 1;
    pub const SCRIPT_ERROR: i32 = 2;
}

pub mod call_handled {
    pub const ACCEPTED: i32 = 0;
    pub const REJECTED: i32 = 1;
    pub const ERROR: i32 = 2;
}

pub mod item_type {
    pub const MESSAGE: i32 = 0;
    pub const PARTICIPANT_ACTION: i32 = 1;
    pub const CHAT_RENAME: i32 = 2;
}

pub mod modifier_type {
    pub const ACTIVITY: i32 = 0;
    pub const STICKER: i32 = 1;
    pub const TAPBACK: i32 = 2;
    pub const EDIT: i32 = 3;
}

pub mod group_action {
    pub const UNKNOWN: i32 = 0;
    pub const JOIN: i32 = 1;
    pub const LEAVE: i32 = 2;
}
