//! # Protocol Dispatcher
//!
//! Version negotiation and routing of incoming packets.
//!
//! Until a handler is selected, the only packet the dispatcher understands is
//! the server's version advertisement. A matching advertisement selects the
//! sub-version handler and answers with the authentication request; every packet
//! after that is routed straight to the handler.
//!
//! The dispatcher also owns the handshake deadline. It is armed when the
//! transport opens, re-armed by the advertisement and cleared once the server
//! answers the authentication request.

use crate::config::COMMUNICATIONS_VERSION;
use crate::core::unpacker::Unpacker;
use crate::error::ConnectionErrorCode;
use crate::protocol::handler::{HandlerContext, ProtocolEvent, ProtocolHandler};
use crate::protocol::handshake;
use crate::protocol::nht::NHT_INFORMATION;
use crate::transport::Transport;
use bytes::Bytes;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lowest sub-version that does not trigger an outdated-server warning
pub const TARGET_SUB_VERSION: i32 = 5;

pub struct ProtocolDispatcher {
    context: HandlerContext,
    handler: Option<ProtocolHandler>,
    handshake_timeout: Duration,
    handshake_deadline: Option<Instant>,
}

impl ProtocolDispatcher {
    pub fn new(context: HandlerContext, handshake_timeout: Duration) -> Self {
        Self {
            context,
            handler: None,
            handshake_timeout,
            handshake_deadline: None,
        }
    }

    /// The transport opened; the server has until the deadline to authenticate us
    pub fn on_open(&mut self) {
        self.start_handshake_timer();
    }

    /// The transport closed; forget the negotiated handler
    pub fn on_close(&mut self) {
        self.stop_handshake_timer();
        self.handler = None;
    }

    pub fn handshake_deadline(&self) -> Option<Instant> {
        self.handshake_deadline
    }

    pub fn start_handshake_timer(&mut self) {
        self.handshake_deadline = Some(Instant::now() + self.handshake_timeout);
    }

    pub fn stop_handshake_timer(&mut self) {
        self.handshake_deadline = None;
    }

    pub fn handler(&self) -> Option<&ProtocolHandler> {
        self.handler.as_ref()
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Negotiated sub-version
    pub fn active_version(&self) -> Option<i32> {
        self.handler.as_ref().map(ProtocolHandler::sub_version)
    }

    /// Human-readable protocol version, e.g. "5.6", or "5.X" before negotiation
    pub fn communications_version(&self) -> String {
        match self.active_version() {
            Some(sub_version) => format!("{COMMUNICATIONS_VERSION}.{sub_version}"),
            None => format!("{COMMUNICATIONS_VERSION}.X"),
        }
    }

    /// Whether the server speaks an older sub-version than this client targets
    pub fn is_version_warning(&self) -> bool {
        self.active_version()
            .is_some_and(|sub_version| sub_version < TARGET_SUB_VERSION)
    }

    /// Route one incoming packet
    ///
    /// Malformed packets are logged and dropped.
    pub async fn process_data(
        &mut self,
        link: &mut dyn Transport,
        data: Bytes,
        secure: bool,
    ) -> Option<ProtocolEvent> {
        if let Some(handler) = self.handler.as_mut() {
            let event = match handler.process_data(link, data, secure) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "Dropping malformed packet");
                    return None;
                }
            };
            if matches!(
                event,
                Some(ProtocolEvent::Authenticated(_) | ProtocolEvent::AuthenticationFailed(_))
            ) {
                self.stop_handshake_timer();
            }
            return event;
        }

        let mut unpacker = Unpacker::new(data);
        match unpacker.unpack_int() {
            Ok(NHT_INFORMATION) => self.process_server_information(link, &mut unpacker).await,
            Ok(message_type) => {
                debug!(message_type, "Ignoring packet before version negotiation");
                None
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed packet");
                None
            }
        }
    }

    async fn process_server_information(
        &mut self,
        link: &mut dyn Transport,
        unpacker: &mut Unpacker,
    ) -> Option<ProtocolEvent> {
        self.start_handshake_timer();

        let versions = unpacker
            .unpack_int()
            .and_then(|major| Ok((major, unpacker.unpack_int()?)));
        let (major, sub_version) = match versions {
            Ok(versions) => versions,
            Err(e) => {
                warn!(error = %e, "Malformed version advertisement");
                return Some(ProtocolEvent::Disconnect(ConnectionErrorCode::BadRequest));
            }
        };

        if major != COMMUNICATIONS_VERSION {
            warn!(major, expected = COMMUNICATIONS_VERSION, "Protocol version mismatch");
            let reason = if major < COMMUNICATIONS_VERSION {
                ConnectionErrorCode::ServerOutdated
            } else {
                ConnectionErrorCode::ClientOutdated
            };
            return Some(ProtocolEvent::Disconnect(reason));
        }

        let Some(handler) = ProtocolHandler::for_version(sub_version, self.context.clone()) else {
            warn!(sub_version, "No handler for protocol sub-version");
            return Some(ProtocolEvent::Disconnect(ConnectionErrorCode::ClientOutdated));
        };

        info!(major, sub_version, "Negotiated protocol version");
        if let Err(e) = handler.send_authentication_request(unpacker, link).await {
            warn!(error = %e, "Failed to send authentication request");
            return Some(ProtocolEvent::Disconnect(handshake::close_reason(&e)));
        }

        self.handler = Some(handler);
        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::core::packer::Packer;
    use crate::protocol::handshake::ClientIdentity;
    use crate::protocol::nht::NHT_AUTHENTICATION;
    use crate::transport::test_support::RecordingLink;
    use crate::utils::buffer_pool::PackerPool;
    use crate::utils::crypto::SharedCipher;
    use std::sync::atomic::Ordering;

    fn dispatcher() -> ProtocolDispatcher {
        ProtocolDispatcher::new(
            HandlerContext {
                cipher: SharedCipher::new(),
                identity: ClientIdentity::new("test"),
                pool: PackerPool::new(1),
                chunk_size: 1024,
            },
            Duration::from_secs(10),
        )
    }

    fn advertisement(major: i32, sub_version: i32, requires_auth: bool) -> Bytes {
        let mut packer = Packer::new();
        packer.pack_int(NHT_INFORMATION);
        packer.pack_int(major);
        packer.pack_int(sub_version);
        packer.pack_bool(requires_auth);
        packer.take()
    }

    #[tokio::test]
    async fn test_supported_sub_versions() {
        for sub_version in [4, 6] {
            let mut dispatcher = dispatcher();
            let mut link = RecordingLink::default();
            dispatcher.on_open();

            let event = dispatcher
                .process_data(&mut link, advertisement(5, sub_version, false), false)
                .await;
            assert!(event.is_none());
            assert_eq!(dispatcher.active_version(), Some(sub_version));
            assert_eq!(dispatcher.communications_version(), format!("5.{sub_version}"));
            assert_eq!(dispatcher.is_version_warning(), sub_version == 4);
            assert!(dispatcher.handshake_deadline().is_some());

            assert_eq!(link.sent.len(), 1);
            assert!(link.sent[0].1);
            assert!(!link.flag.load(Ordering::SeqCst));
        }
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let cases = [
            (4, 6, ConnectionErrorCode::ServerOutdated),
            (6, 6, ConnectionErrorCode::ClientOutdated),
            (5, 5, ConnectionErrorCode::ClientOutdated),
            (5, 7, ConnectionErrorCode::ClientOutdated),
        ];
        for (major, sub_version, reason) in cases {
            let mut dispatcher = dispatcher();
            let mut link = RecordingLink::default();
            let event = dispatcher
                .process_data(&mut link, advertisement(major, sub_version, false), false)
                .await;
            assert_eq!(event, Some(ProtocolEvent::Disconnect(reason)));
            assert!(!dispatcher.has_handler());
            assert!(link.sent.is_empty());
        }
    }

    #[tokio::test]
    async fn test_missing_password_is_unauthorized() {
        let mut dispatcher = dispatcher();
        let mut link = RecordingLink::default();
        let event = dispatcher
            .process_data(&mut link, advertisement(5, 6, true), false)
            .await;
        assert_eq!(
            event,
            Some(ProtocolEvent::Disconnect(ConnectionErrorCode::Unauthorized))
        );
    }

    #[tokio::test]
    async fn test_auth_reply_clears_deadline() {
        let mut dispatcher = dispatcher();
        let mut link = RecordingLink::default();
        dispatcher.on_open();
        dispatcher
            .process_data(&mut link, advertisement(5, 4, false), false)
            .await;

        let mut packer = Packer::new();
        packer.pack_int(NHT_AUTHENTICATION);
        packer.pack_int(0);
        for value in ["server", "Mac", "14.0", "4.0"] {
            packer.pack_string(value);
        }
        let event = dispatcher.process_data(&mut link, packer.take(), false).await;
        let Some(ProtocolEvent::Authenticated(info)) = event else {
            panic!("expected authentication");
        };
        assert_eq!(info.device_name, "Mac");
        assert!(!info.supports_face_time);
        assert!(dispatcher.handshake_deadline().is_none());

        dispatcher.on_close();
        assert!(!dispatcher.has_handler());
        assert_eq!(dispatcher.communications_version(), "5.X");
    }
}
