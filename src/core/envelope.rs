//! # Relay Envelope
//!
//! Framing used on the relay websocket. Every message starts with a 4-byte type
//! tag; proxied data adds a 1-byte encryption marker after the tag.
//!
//! ```text
//! [Tag(i32)] [Marker(i8)] [Data(N)]      proxied data
//! [Tag(i32)] [Token(UTF-8)]              push token registration
//! [Tag(i32)]                             connection confirmed
//! ```
//!
//! | Marker | Meaning |
//! |---|---|
//! | `-100` | data is encrypted |
//! | `-101` | data is not encrypted, the server supports encryption |
//! | `-102` | data is not encrypted, the server has encryption disabled |

use crate::core::unpacker::Unpacker;
use crate::error::Result;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

/// The relay accepted the connection
pub const NHT_CONNECTION_OK: i32 = 0;
/// Data proxied to or from the server
pub const NHT_CLIENT_PROXY: i32 = 100;
/// Register a push token
pub const NHT_CLIENT_ADD_PUSH_TOKEN: i32 = 110;
/// Unregister a push token
pub const NHT_CLIENT_REMOVE_PUSH_TOKEN: i32 = 111;

pub const MARKER_ENCRYPTED: i8 = -100;
pub const MARKER_UNENCRYPTED: i8 = -101;
pub const MARKER_ENCRYPTION_DISABLED: i8 = -102;

/// How a proxied payload was marked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMarker {
    Encrypted,
    Unencrypted,
    EncryptionDisabled,
    /// No recognised marker; the byte belongs to the payload
    Legacy,
}

impl EncryptionMarker {
    /// Marker for an outgoing payload
    pub fn outgoing(encrypted: bool, server_requests_encryption: bool) -> Self {
        if encrypted {
            Self::Encrypted
        } else if server_requests_encryption {
            Self::Unencrypted
        } else {
            Self::EncryptionDisabled
        }
    }

    /// Whether the payload came over the authenticated channel
    pub fn is_secure(self) -> bool {
        matches!(self, Self::Encrypted | Self::EncryptionDisabled)
    }

    pub fn is_encrypted(self) -> bool {
        self == Self::Encrypted
    }

    fn to_byte(self) -> Option<i8> {
        match self {
            Self::Encrypted => Some(MARKER_ENCRYPTED),
            Self::Unencrypted => Some(MARKER_UNENCRYPTED),
            Self::EncryptionDisabled => Some(MARKER_ENCRYPTION_DISABLED),
            Self::Legacy => None,
        }
    }
}

/// A message received from the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    ConnectionOk,
    Proxy {
        marker: EncryptionMarker,
        data: Bytes,
    },
    /// A tag this client does not handle
    Unknown(i32),
}

/// Wrap data for the server
pub fn encode_proxy(data: &[u8], marker: EncryptionMarker) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + data.len());
    buf.put_i32(NHT_CLIENT_PROXY);
    if let Some(byte) = marker.to_byte() {
        buf.put_i8(byte);
    }
    buf.put_slice(data);
    buf.freeze()
}

/// Build a push token registration (`add = true`) or removal message
pub fn encode_push_token(token: &str, add: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + token.len());
    buf.put_i32(if add {
        NHT_CLIENT_ADD_PUSH_TOKEN
    } else {
        NHT_CLIENT_REMOVE_PUSH_TOKEN
    });
    buf.put_slice(token.as_bytes());
    buf.freeze()
}

/// Parse a message received from the relay
pub fn decode(data: Bytes) -> Result<RelayMessage> {
    let mut unpacker = Unpacker::new(data);
    match unpacker.unpack_int()? {
        NHT_CONNECTION_OK => Ok(RelayMessage::ConnectionOk),
        NHT_CLIENT_PROXY => {
            let marker = match unpacker.unpack_byte()? {
                MARKER_ENCRYPTED => EncryptionMarker::Encrypted,
                MARKER_UNENCRYPTED => EncryptionMarker::Unencrypted,
                MARKER_ENCRYPTION_DISABLED => EncryptionMarker::EncryptionDisabled,
                other => {
                    warn!(marker = other, "Unknown encryption marker, treating as legacy payload");
                    unpacker.unread(1);
                    EncryptionMarker::Legacy
                }
            };
            Ok(RelayMessage::Proxy {
                marker,
                data: unpacker.into_remaining(),
            })
        }
        other => Ok(RelayMessage::Unknown(other)),
    }
}
