//! # Protocol Layer
//!
//! The comm5 application protocol spoken over every transport.
//!
//! ## Components
//! - **nht**: packet type and result codes
//! - **message**: domain types decoded from the wire
//! - **wire**: shared pack/unpack helpers
//! - **handshake**: client identity and authentication exchange
//! - **handler**: per-sub-version packet handling (`v4`, `v6`)
//! - **dispatcher**: version negotiation and packet routing
//! - **transfer**: chunked upload planning and download reassembly

pub mod dispatcher;
pub mod handler;
pub mod handshake;
pub mod message;
pub mod nht;
pub mod transfer;
pub mod v4;
pub mod v6;
pub mod wire;
