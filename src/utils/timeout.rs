//! Timeout constants and async timeout wrappers.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// Time a correlated request may wait for its response
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed delay before a passive reconnect
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(8);

/// Time allowed for the protocol handshake after the transport opens
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time the relay has to confirm a freshly opened websocket
pub const RELAY_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(8);

/// Run a fallible future with a deadline, mapping expiry to [`ProtocolError::Timeout`]
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| ProtocolError::Timeout)?
}
