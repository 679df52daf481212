//! # Relay Protocol
//!
//! Client stack for talking to a personal messaging server, either through a
//! relay service or over a direct socket.
//!
//! ## Layers
//! - **Core**: big-endian binary codec, direct-socket framing and the relay envelope
//! - **Transport**: relay websocket, direct TCP and host-bridged sockets behind one trait
//! - **Protocol**: version negotiation, authentication and the per-sub-version packet handlers
//! - **Service**: the connection manager, request correlation and event observers
//!
//! ## Quick Start
//! ```rust,no_run
//! use relay_protocol::config::ClientConfig;
//! use relay_protocol::protocol::handshake::ClientIdentity;
//! use relay_protocol::service::credentials::{MemoryStore, StaticTokenProvider};
//! use relay_protocol::service::manager::{ConnectionManager, ManagerOptions};
//! use relay_protocol::transport::relay::RelayTransport;
//! use relay_protocol::utils::crypto::SharedCipher;
//! use std::sync::Arc;
//!
//! # async fn run() -> relay_protocol::error::Result<()> {
//! let config = ClientConfig::from_env()?;
//! relay_protocol::init_logging(&config.logging)?;
//!
//! let identity = ClientIdentity::generate()?;
//! let cipher = SharedCipher::new();
//! let transport = RelayTransport::new(
//!     config.transport.relay_url.clone(),
//!     identity.installation_id.clone(),
//!     config.transport.relay_handshake_timeout,
//!     Arc::new(StaticTokenProvider::new("id-token")),
//!     cipher.clone(),
//! );
//!
//! let options = ManagerOptions::new(identity, Arc::new(MemoryStore::new()))
//!     .with_cipher(cipher)
//!     .with_config(config.connection);
//! let manager = ConnectionManager::spawn(transport, options);
//! manager.connect();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::ClientConfig;
pub use error::{ConnectionErrorCode, ProtocolError, Result};
pub use service::manager::{ConnectionManager, ConnectionState, ManagerOptions};
pub use transport::{Transport, TransportEvent};
pub use utils::logging::init_logging;
