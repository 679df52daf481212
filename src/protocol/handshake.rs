//! # Authentication Handshake
//!
//! Client side of the comm5 authentication exchange.
//!
//! After the version advertisement the server tells the client whether it requires
//! a password. When it does, the client proves it knows the password by returning
//! the server's transmission check inside an encrypted block:
//!
//! ```text
//! Server -> Client: [101?] [Bool requiresAuth] [Payload transmissionCheck]?
//! Client -> Server: [Int 101] [Payload encrypt(check, installationID, clientName, platformID)]
//! Server -> Client: [Int 101] [Int result] [String installationID] [String deviceName] ...
//! ```
//!
//! Without a password requirement the identity strings are sent in the clear,
//! and the transport falls back to plain payloads.

use crate::core::packer::Packer;
use crate::core::unpacker::Unpacker;
use crate::error::{ConnectionErrorCode, ProtocolError, Result};
use crate::protocol::message::ServerInfo;
use crate::protocol::nht::NHT_AUTHENTICATION;
use crate::protocol::wire;
use crate::utils::crypto::SharedCipher;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

/// Platform identifier reported to the server
pub const PLATFORM_ID: &str = "native";

const INSTALLATION_ID_LEN: usize = 16;

/// How this client describes itself to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    /// Stable per-install identifier
    pub installation_id: String,
    /// Human-readable client description
    pub client_name: String,
    pub platform_id: String,
}

impl ClientIdentity {
    pub fn new(installation_id: impl Into<String>) -> Self {
        Self {
            installation_id: installation_id.into(),
            client_name: default_client_name(),
            platform_id: PLATFORM_ID.to_string(),
        }
    }

    /// A new identity with a random installation ID
    pub fn generate() -> Result<Self> {
        let mut id = [0u8; INSTALLATION_ID_LEN];
        getrandom::fill(&mut id)
            .map_err(|e| ProtocolError::Custom(format!("Failed to generate installation ID: {e}")))?;
        Ok(Self::new(hex::encode(id)))
    }
}

/// "relay-protocol 0.1.0 (linux)"
pub fn default_client_name() -> String {
    format!(
        "relay-protocol {} ({})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS
    )
}

/// The client's answer to the server's authentication advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub packet: Bytes,
    /// Whether the transport should encrypt the packet itself
    pub encrypt: bool,
    /// Whether the server requires encrypted traffic from now on
    pub requires_encryption: bool,
}

/// Map a handshake failure to the reason the connection closes with
pub fn close_reason(error: &ProtocolError) -> ConnectionErrorCode {
    match error {
        ProtocolError::PasswordUnavailable => ConnectionErrorCode::Unauthorized,
        ProtocolError::EncryptionFailure => ConnectionErrorCode::InternalError,
        _ => ConnectionErrorCode::BadRequest,
    }
}

/// Read the authentication requirement and build the reply
///
/// Fails with [`ProtocolError::PasswordUnavailable`] when the server requires a
/// password and none is configured.
#[instrument(skip_all, fields(installation_id = %identity.installation_id))]
pub async fn build_auth_request(
    unpacker: &mut Unpacker,
    identity: &ClientIdentity,
    cipher: &SharedCipher,
) -> Result<AuthRequest> {
    let requires_auth = unpacker.unpack_bool()?;

    if !requires_auth {
        debug!("Server does not require authentication");
        let mut packer = Packer::new();
        packer.pack_int(NHT_AUTHENTICATION);
        pack_identity(&mut packer, identity);
        return Ok(AuthRequest {
            packet: packer.take(),
            encrypt: true,
            requires_encryption: false,
        });
    }

    let Some(password) = cipher.get() else {
        warn!("Server requires authentication, but no password is set");
        return Err(ProtocolError::PasswordUnavailable);
    };

    let transmission_check = unpacker.unpack_payload()?;
    let mut secure = Packer::with_capacity(1024);
    secure.pack_payload(&transmission_check);
    pack_identity(&mut secure, identity);
    let encrypted = password.encrypt_async(secure.take()).await?;

    let mut packer = Packer::new();
    packer.pack_int(NHT_AUTHENTICATION);
    packer.pack_payload(&encrypted);
    debug!(check_len = transmission_check.len(), "Built authentication proof");

    Ok(AuthRequest {
        packet: packer.take(),
        encrypt: false,
        requires_encryption: true,
    })
}

fn pack_identity(packer: &mut Packer, identity: &ClientIdentity) {
    packer.pack_string(&identity.installation_id);
    packer.pack_string(&identity.client_name);
    packer.pack_string(&identity.platform_id);
}

/// Read the server's authentication verdict
///
/// `extended` reads the user name and call support flag that later sub-versions
/// append to the server details.
pub fn parse_auth_reply(
    unpacker: &mut Unpacker,
    extended: bool,
) -> Result<std::result::Result<ServerInfo, ConnectionErrorCode>> {
    let code = unpacker.unpack_int()?;
    if let Some(reason) = wire::map_auth_result(code) {
        warn!(code, ?reason, "Authentication rejected");
        return Ok(Err(reason));
    }

    let installation_id = unpacker.unpack_string()?;
    let device_name = unpacker.unpack_string()?;
    let system_version = unpacker.unpack_string()?;
    let software_version = unpacker.unpack_string()?;
    let supports_face_time = if extended {
        let _user_name = unpacker.unpack_string()?;
        unpacker.unpack_bool()?
    } else {
        false
    };

    Ok(Ok(ServerInfo {
        installation_id,
        device_name,
        system_version,
        software_version,
        supports_face_time,
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::utils::crypto::PasswordCipher;

    fn identity() -> ClientIdentity {
        ClientIdentity::new("install-1")
    }

    #[test]
    fn test_generated_identity() {
        let identity = ClientIdentity::generate().unwrap();
        assert_eq!(identity.installation_id.len(), INSTALLATION_ID_LEN * 2);
        assert_eq!(identity.platform_id, PLATFORM_ID);
        assert!(identity.client_name.starts_with("relay-protocol "));
    }

    #[tokio::test]
    async fn test_plain_request_when_auth_not_required() {
        let mut packer = Packer::new();
        packer.pack_bool(false);
        let mut unpacker = Unpacker::new(packer.take());

        let request = build_auth_request(&mut unpacker, &identity(), &SharedCipher::new())
            .await
            .unwrap();
        assert!(request.encrypt);
        assert!(!request.requires_encryption);

        let mut reply = Unpacker::new(request.packet);
        assert_eq!(reply.unpack_int().unwrap(), NHT_AUTHENTICATION);
        assert_eq!(reply.unpack_string().unwrap(), "install-1");
    }

    #[tokio::test]
    async fn test_missing_password_is_unauthorized() {
        let mut packer = Packer::new();
        packer.pack_bool(true);
        packer.pack_payload(b"check");
        let mut unpacker = Unpacker::new(packer.take());

        let error = build_auth_request(&mut unpacker, &identity(), &SharedCipher::new())
            .await
            .unwrap_err();
        assert!(matches!(error, ProtocolError::PasswordUnavailable));
        assert_eq!(close_reason(&error), ConnectionErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn test_proof_carries_transmission_check() {
        let mut packer = Packer::new();
        packer.pack_bool(true);
        packer.pack_payload(b"check");
        let mut unpacker = Unpacker::new(packer.take());

        let cipher = SharedCipher::with_password("hunter2");
        let request = build_auth_request(&mut unpacker, &identity(), &cipher)
            .await
            .unwrap();
        assert!(!request.encrypt);
        assert!(request.requires_encryption);

        let mut reply = Unpacker::new(request.packet);
        assert_eq!(reply.unpack_int().unwrap(), NHT_AUTHENTICATION);
        let proof = reply.unpack_payload().unwrap();
        let decrypted = PasswordCipher::new("hunter2").decrypt(&proof).unwrap();
        let mut secure = Unpacker::new(decrypted);
        assert_eq!(&secure.unpack_payload().unwrap()[..], b"check");
        assert_eq!(secure.unpack_string().unwrap(), "install-1");
    }

    #[test]
    fn test_extended_reply() {
        let mut packer = Packer::new();
        packer.pack_int(0);
        for value in ["server-1", "Mac", "14.0", "5.0", "user"] {
            packer.pack_string(value);
        }
        packer.pack_bool(true);

        let info = parse_auth_reply(&mut Unpacker::new(packer.take()), true)
            .unwrap()
            .unwrap();
        assert_eq!(info.installation_id, "server-1");
        assert!(info.supports_face_time);
    }

    #[test]
    fn test_rejected_reply() {
        let mut packer = Packer::new();
        packer.pack_int(1);
        let result = parse_auth_reply(&mut Unpacker::new(packer.take()), false).unwrap();
        assert_eq!(result, Err(ConnectionErrorCode::Unauthorized));
    }
}
