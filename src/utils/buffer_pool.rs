//! # Packer Pool
//!
//! Reuse of outgoing packet buffers.
//!
//! A [`PooledPacker`] is checked out, written to, flushed and then reset when it
//! is dropped, so every exit path (including an early `?` return) hands a clean
//! buffer back to the pool. Buffers that grew past the retention limit are
//! released instead of kept.
//!
//! ## Usage
//! ```rust
//! use relay_protocol::utils::buffer_pool::PackerPool;
//!
//! let pool = PackerPool::new(1);
//! let bytes = {
//!     let mut packer = pool.acquire();
//!     packer.pack_int(1);
//!     packer.to_bytes()
//! }; // packer reset and returned to the pool here
//! assert_eq!(&bytes[..], &[0, 0, 0, 1]);
//! ```

use crate::config::PACKER_CAPACITY;
use crate::core::packer::Packer;
use std::sync::{Arc, Mutex, PoisonError};

/// Buffers larger than this are dropped instead of returned
const MAX_RETAINED_CAPACITY: usize = 4 * PACKER_CAPACITY;

/// A packer that resets and returns itself to the pool when dropped
pub struct PooledPacker {
    packer: Packer,
    pool: Arc<Mutex<Vec<Packer>>>,
}

impl Drop for PooledPacker {
    fn drop(&mut self) {
        let mut packer = std::mem::take(&mut self.packer);
        if packer.capacity() <= MAX_RETAINED_CAPACITY {
            packer.reset();
            self.pool
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(packer);
        }
    }
}

impl std::ops::Deref for PooledPacker {
    type Target = Packer;

    fn deref(&self) -> &Packer {
        &self.packer
    }
}

impl std::ops::DerefMut for PooledPacker {
    fn deref_mut(&mut self) -> &mut Packer {
        &mut self.packer
    }
}

/// Thread-safe pool of packers
#[derive(Clone)]
pub struct PackerPool {
    pool: Arc<Mutex<Vec<Packer>>>,
    capacity: usize,
}

impl PackerPool {
    /// Create a pool holding `size` packers of the default capacity
    pub fn new(size: usize) -> Self {
        Self::with_capacity(size, PACKER_CAPACITY)
    }

    /// Create a pool whose packers start with `capacity` bytes
    pub fn with_capacity(size: usize, capacity: usize) -> Self {
        let packers = (0..size).map(|_| Packer::with_capacity(capacity)).collect();
        Self {
            pool: Arc::new(Mutex::new(packers)),
            capacity,
        }
    }

    /// Check out a packer, allocating a new one if the pool is empty
    pub fn acquire(&self) -> PooledPacker {
        let packer = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| Packer::with_capacity(self.capacity));

        PooledPacker {
            packer,
            pool: self.pool.clone(),
        }
    }

    /// Number of packers currently available
    pub fn available(&self) -> usize {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl std::fmt::Debug for PackerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackerPool")
            .field("available", &self.available())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Default for PackerPool {
    fn default() -> Self {
        Self::new(1)
    }
}
