//! # Error Types
//!
//! Error handling for the relay client stack.
//!
//! This module defines the crate-wide [`ProtocolError`] used by the codec, the
//! encryption layer, compression and the transports, together with the typed
//! reasons that end a connection and the per-request error codes that reject a
//! single correlated request.
//!
//! ## Error Categories
//! - **Transport**: connection lost, internet unavailable, bad framing. Retried
//!   through the passive reconnect path.
//! - **Protocol**: version mismatch, bad password. Fatal for the connection.
//! - **Relay**: account and group errors reported by the relay service.
//! - **Application**: a rejected send, an unsupported chat creation, a missing
//!   attachment. Reported per request, the connection stays open.
//! - **Local**: timeouts and local I/O failures, reported like application errors.
//!
//! ## Example Usage
//! ```rust
//! use relay_protocol::error::{ConnectionErrorCode, ErrorCategory};
//!
//! let reason = ConnectionErrorCode::Internet;
//! assert!(reason.is_recoverable());
//! assert_eq!(reason.category(), ErrorCategory::Transport);
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    pub const ERR_PASSWORD_UNAVAILABLE: &str =
        "The server requests encryption, but no password is set";
    pub const ERR_NO_SERVER_ADDRESS: &str = "No server address is configured";
    pub const ERR_MANAGER_STOPPED: &str = "Connection manager task has stopped";
}

// ProtocolError is the primary error type for codec, crypto and transport operations
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Io(#[from] io::Error),

    #[error("Buffer underflow: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Invalid length: {0}")]
    InvalidLength(i32),

    #[error("Invalid UTF-8 string: {0}")]
    InvalidString(String),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("The server requests encryption, but no password is set")]
    PasswordUnavailable,

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

fn detail_suffix(detail: &Option<String>) -> String {
    detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default()
}

/// Where a close reason sits in the error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Transport,
    Protocol,
    Relay,
    Local,
}

/// Reason a connection was closed
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionErrorCode {
    #[error("Connection to the server failed")]
    Connection,
    #[error("No internet connection")]
    Internet,
    #[error("Internal error")]
    InternalError,
    #[error("External error")]
    ExternalError,
    #[error("Bad request")]
    BadRequest,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("The client is out of date")]
    ClientOutdated,
    #[error("The server is out of date")]
    ServerOutdated,
    #[error("The server is not connected to the relay")]
    ConnectNoGroup,
    #[error("The relay group is at capacity")]
    ConnectNoCapacity,
    #[error("The account could not be validated")]
    ConnectAccountValidation,
    #[error("The account has no active subscription")]
    ConnectNoSubscription,
    #[error("The account is not activated")]
    ConnectNoActivation,
    #[error("Signed in from another location")]
    ConnectOtherLocation,
}

impl ConnectionErrorCode {
    /// Whether a close with this reason schedules a passive reconnect
    pub fn is_recoverable(self) -> bool {
        matches!(self, Self::Connection | Self::Internet)
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            Self::Connection | Self::Internet | Self::BadRequest | Self::ExternalError => {
                ErrorCategory::Transport
            }
            Self::Unauthorized | Self::ClientOutdated | Self::ServerOutdated => {
                ErrorCategory::Protocol
            }
            Self::ConnectNoGroup
            | Self::ConnectNoCapacity
            | Self::ConnectAccountValidation
            | Self::ConnectNoSubscription
            | Self::ConnectNoActivation
            | Self::ConnectOtherLocation => ErrorCategory::Relay,
            Self::InternalError => ErrorCategory::Local,
        }
    }
}

/// Reason a message send (or a data request) failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageErrorCode {
    LocalInvalidContent,
    LocalTooLarge,
    LocalIO,
    LocalNetwork,
    LocalInternalError,
    ServerUnknown,
    ServerExternal,
    ServerBadRequest,
    ServerUnauthorized,
    ServerTimeout,
    AppleNoConversation,
    AppleNetwork,
    AppleUnregistered,
}

/// A message error with optional server-provided details
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("Message error {code:?}{}", detail_suffix(.detail))]
pub struct MessageError {
    pub code: MessageErrorCode,
    pub detail: Option<String>,
}

impl MessageError {
    pub fn new(code: MessageErrorCode) -> Self {
        Self { code, detail: None }
    }

    pub fn with_detail(code: MessageErrorCode, detail: Option<String>) -> Self {
        Self { code, detail }
    }

    /// The generic error used when the connection is unavailable or a request times out
    pub fn network() -> Self {
        Self::new(MessageErrorCode::LocalNetwork)
    }
}

impl From<MessageErrorCode> for MessageError {
    fn from(code: MessageErrorCode) -> Self {
        Self::new(code)
    }
}

/// Reason an attachment download failed
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttachmentRequestErrorCode {
    #[error("Attachment request timed out")]
    Timeout,
    #[error("Bad response")]
    BadResponse,
    #[error("Unknown server error")]
    ServerUnknown,
    #[error("Attachment not found")]
    ServerNotFound,
    #[error("Attachment not saved on the server")]
    ServerNotSaved,
    #[error("Attachment unreadable on the server")]
    ServerUnreadable,
    #[error("Server I/O error")]
    ServerIO,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CreateChatErrorCode {
    Network,
    ScriptError,
    BadRequest,
    Unauthorized,
    NotSupported,
    UnknownExternal,
}

/// A chat creation failure with optional server-provided details
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("Chat creation error {code:?}{}", detail_suffix(.detail))]
pub struct CreateChatError {
    pub code: CreateChatErrorCode,
    pub detail: Option<String>,
}

impl CreateChatError {
    pub fn new(code: CreateChatErrorCode, detail: Option<String>) -> Self {
        Self { code, detail }
    }

    pub fn network() -> Self {
        Self::new(CreateChatErrorCode::Network, None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteUpdateErrorCode {
    Unknown,
    /// The server refused to install the requested update
    Mismatch,
    Download,
    BadPackage,
    Internal,
    ReadOnlyVolume,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaceTimeLinkErrorCode {
    #[error("Network error")]
    Network,
    #[error("The server could not create a link")]
    External,
}

/// Result of initiating an outgoing call, as reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaceTimeInitiateCode {
    Ok,
    Network,
    BadMembers,
    External,
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("Call initiation error {code:?}{}", detail_suffix(.detail))]
pub struct FaceTimeInitiateError {
    pub code: FaceTimeInitiateCode,
    pub detail: Option<String>,
}

impl FaceTimeInitiateError {
    pub fn network() -> Self {
        Self {
            code: FaceTimeInitiateCode::Network,
            detail: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_reasons() {
        assert!(ConnectionErrorCode::Connection.is_recoverable());
        assert!(ConnectionErrorCode::Internet.is_recoverable());
        assert!(!ConnectionErrorCode::Unauthorized.is_recoverable());
        assert!(!ConnectionErrorCode::ServerOutdated.is_recoverable());
        assert!(!ConnectionErrorCode::ConnectOtherLocation.is_recoverable());
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            ConnectionErrorCode::ClientOutdated.category(),
            ErrorCategory::Protocol
        );
        assert_eq!(
            ConnectionErrorCode::ConnectNoGroup.category(),
            ErrorCategory::Relay
        );
        assert_eq!(
            ConnectionErrorCode::BadRequest.category(),
            ErrorCategory::Transport
        );
    }

    #[test]
    fn test_message_error_display() {
        let error = MessageError::with_detail(
            MessageErrorCode::ServerExternal,
            Some("script failed".to_string()),
        );
        assert_eq!(error.to_string(), "Message error ServerExternal: script failed");
        assert_eq!(
            MessageError::network().to_string(),
            "Message error LocalNetwork"
        );
    }
}
