//! # Utility Modules
//!
//! Supporting utilities for cryptography, compression, buffering, logging, and timing.
//!
//! ## Components
//! - **Buffer Pool**: scoped packer checkout with reset on drop
//! - **Compression**: zlib with size limits and a streaming inflater
//! - **Crypto**: PBKDF2 + AES-128-GCM password cipher
//! - **Logging**: Structured logging configuration
//! - **Task Queue**: strict FIFO execution of async work
//! - **Time**: Wall-clock millisecond helpers
//! - **Timeout**: Timeout constants and async wrappers
//!
//! ## Security
//! - Cryptographically secure RNG (getrandom)
//! - Decompression bomb protection
//! - Memory zeroing for password material (zeroize crate)

pub mod buffer_pool;
pub mod compression;
pub mod crypto;
pub mod logging;
pub mod task_queue;
pub mod time;
pub mod timeout;
