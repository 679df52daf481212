//! # Core Protocol Components
//!
//! Binary codec, socket framing and the relay envelope.
//!
//! ## Components
//! - **Packer / Unpacker**: big-endian writer and reader with no type tags
//! - **Codec**: tokio codec for direct socket frames
//! - **Envelope**: relay type tags and encryption markers
//!
//! ## Wire Format (direct sockets)
//! ```text
//! [Length(4)] [Encrypted(1)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Maximum frame size: 64MB (prevents memory exhaustion)
//! - Length validation before allocation
//! - Reads past the end of a packet fail instead of panicking

pub mod codec;
pub mod envelope;
pub mod packer;
pub mod unpacker;
