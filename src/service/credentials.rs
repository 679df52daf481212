//! # Credentials
//!
//! Access to the secrets and addresses the connection needs.
//!
//! The host application owns persistent storage and the identity provider; the
//! client reaches them through [`SecureStore`] and [`CredentialProvider`].
//! In-memory implementations are provided for tests and simple embeddings.

use crate::error::{ProtocolError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use zeroize::Zeroizing;

/// Keys of the values kept in the secure store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKey {
    /// Password used to encrypt traffic and authenticate with the server
    ServerPassword,
    /// Primary `host[:port]` of a directly reachable server
    ServerAddress,
    /// Address tried when the primary address fails
    ServerAddressFallback,
}

/// Persistent storage for secrets
pub trait SecureStore: Send + Sync {
    fn get(&self, key: StoreKey) -> Option<String>;

    fn set(&self, key: StoreKey, value: Option<&str>);
}

/// Supplies the identity token the relay authenticates clients with
pub trait CredentialProvider: Send + Sync {
    fn id_token(&self) -> BoxFuture<'static, Result<String>>;
}

/// A [`SecureStore`] kept in memory; values are zeroed when replaced or dropped
#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<StoreKey, Zeroizing<String>>>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<StoreKey> = self
            .values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        f.debug_struct("MemoryStore").field("keys", &keys).finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(self, key: StoreKey, value: &str) -> Self {
        self.set(key, Some(value));
        self
    }
}

impl SecureStore for MemoryStore {
    fn get(&self, key: StoreKey) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .map(|value| value.as_str().to_owned())
    }

    fn set(&self, key: StoreKey, value: Option<&str>) {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        match value {
            Some(value) => {
                values.insert(key, Zeroizing::new(value.to_owned()));
            }
            None => {
                values.remove(&key);
            }
        }
    }
}

/// A provider that always returns the same token, or always fails
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: Option<Zeroizing<String>>,
}

impl fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(Zeroizing::new(token.into())),
        }
    }

    /// A provider whose token requests always fail
    pub fn unavailable() -> Self {
        Self { token: None }
    }
}

impl CredentialProvider for StaticTokenProvider {
    fn id_token(&self) -> BoxFuture<'static, Result<String>> {
        let token = self.token.as_ref().map(|token| token.as_str().to_owned());
        async move {
            token.ok_or_else(|| ProtocolError::Custom("No identity token available".to_string()))
        }
        .boxed()
    }
}
