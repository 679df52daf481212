//! # Password Cipher
//!
//! Symmetric encryption keyed by the user's server password.
//!
//! Every message gets a fresh random salt and IV. The AES-128-GCM key is derived
//! from the password and the salt with PBKDF2-HMAC-SHA256.
//!
//! ## Wire Format
//! ```text
//! [Salt(8)] [IV(12)] [Ciphertext + Tag(N)]
//! ```
//!
//! ## Security
//! - Salts and IVs come from the OS RNG (getrandom) and are never reused
//! - Password bytes and derived keys are zeroed on drop
//! - Key derivation runs on the blocking pool in the async variants

use crate::error::{ProtocolError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use bytes::Bytes;
use ring::pbkdf2;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;
use zeroize::Zeroizing;

/// Salt length in bytes
pub const SALT_LEN: usize = 8;

/// AES-GCM IV length in bytes
pub const IV_LEN: usize = 12;

/// Derived key length in bytes (AES-128)
const KEY_LEN: usize = 16;

/// 10 000 PBKDF2 rounds
const KEY_ITERATIONS: NonZeroU32 = NonZeroU32::MIN.saturating_add(9_999);

/// Encrypts and decrypts payloads with a key derived from a password
pub struct PasswordCipher {
    password: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for PasswordCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordCipher")
            .field("password", &"<redacted>")
            .finish()
    }
}

impl PasswordCipher {
    pub fn new(password: &str) -> Self {
        Self {
            password: Zeroizing::new(password.as_bytes().to_vec()),
        }
    }

    fn derive_key(&self, salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            KEY_ITERATIONS,
            salt,
            &self.password,
            key.as_mut(),
        );
        key
    }

    /// Encrypt a payload, producing `salt || iv || ciphertext`
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        getrandom::fill(&mut salt).map_err(|_| ProtocolError::EncryptionFailure)?;
        getrandom::fill(&mut iv).map_err(|_| ProtocolError::EncryptionFailure)?;

        let key = self.derive_key(&salt);
        let cipher =
            Aes128Gcm::new_from_slice(key.as_ref()).map_err(|_| ProtocolError::EncryptionFailure)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| ProtocolError::EncryptionFailure)?;

        let mut output = Vec::with_capacity(SALT_LEN + IV_LEN + ciphertext.len());
        output.extend_from_slice(&salt);
        output.extend_from_slice(&iv);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    /// Decrypt a payload produced by [`PasswordCipher::encrypt`]
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < SALT_LEN + IV_LEN {
            return Err(ProtocolError::DecryptionFailure);
        }

        let (salt, rest) = data.split_at(SALT_LEN);
        let (iv, ciphertext) = rest.split_at(IV_LEN);

        let key = self.derive_key(salt);
        let cipher =
            Aes128Gcm::new_from_slice(key.as_ref()).map_err(|_| ProtocolError::DecryptionFailure)?;
        cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| ProtocolError::DecryptionFailure)
    }

    /// Encrypt on the blocking pool
    pub async fn encrypt_async(self: Arc<Self>, data: Bytes) -> Result<Bytes> {
        tokio::task::spawn_blocking(move || self.encrypt(&data))
            .await
            .map_err(|e| ProtocolError::Custom(format!("Encryption task failed: {e}")))?
            .map(Bytes::from)
    }

    /// Decrypt on the blocking pool
    pub async fn decrypt_async(self: Arc<Self>, data: Bytes) -> Result<Bytes> {
        tokio::task::spawn_blocking(move || self.decrypt(&data))
            .await
            .map_err(|e| ProtocolError::Custom(format!("Decryption task failed: {e}")))?
            .map(Bytes::from)
    }
}

#[derive(Debug, Default)]
struct CipherSlot {
    initialized: bool,
    cipher: Option<Arc<PasswordCipher>>,
}

/// The password slot shared by the connection manager, the protocol handlers and the transports
///
/// Tracks whether a password was ever loaded (even an absent one) separately from
/// whether a usable cipher exists.
#[derive(Debug, Clone, Default)]
pub struct SharedCipher {
    slot: Arc<RwLock<CipherSlot>>,
}

impl SharedCipher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A slot already loaded with a password
    pub fn with_password(password: &str) -> Self {
        let shared = Self::new();
        shared.set_password(Some(password));
        shared
    }

    /// Load a password, or record that none is configured
    pub fn set_password(&self, password: Option<&str>) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        slot.initialized = true;
        slot.cipher = password.map(|p| Arc::new(PasswordCipher::new(p)));
        debug!(available = slot.cipher.is_some(), "Crypto password updated");
    }

    /// Whether [`SharedCipher::set_password`] has been called at least once
    pub fn is_set(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .initialized
    }

    /// Whether a password is available for encryption
    pub fn is_available(&self) -> bool {
        self.get().is_some()
    }

    pub fn get(&self) -> Option<Arc<PasswordCipher>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .cipher
            .clone()
    }
}
