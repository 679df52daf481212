//! # Request Correlation
//!
//! Request-ID allocation and the tables that pair outgoing requests with the
//! server's replies.
//!
//! Requests that carry a request ID (message sends, uploads, downloads and chat
//! creation) share one 16-bit ID space. Requests answered by content rather than
//! by ID (conversation lists, conversation info and threads) are kept as lists
//! of waiters, each with its own timer. Every entry is settled exactly once:
//! a reply, a timeout and a disconnect all remove the entry before completing it,
//! and whichever comes second finds nothing to do.

use crate::error::{
    AttachmentRequestErrorCode, CreateChatError, FaceTimeInitiateError, FaceTimeLinkErrorCode,
    MessageError,
};
use crate::protocol::message::{
    ConversationItem, DownloadHeader, FileDownloadResult, LinkedConversation,
    RequestedConversation,
};
use crate::protocol::transfer::TransferAccumulator;
use futures::StreamExt;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::debug;

/// Completes a request exactly once
pub type Reply<T> = oneshot::Sender<T>;

/// Upload progress reported while a file is sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    /// Bytes of the file sent so far
    Progress(u64),
    /// Every chunk was handed to the transport; the server's answer is pending
    Complete { hash: String },
}

/// Download progress reported while an attachment arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadEvent {
    /// Total length announced with the first chunk
    Size(u64),
    /// Bytes received so far
    Downloaded(u64),
}

/// Allocates request IDs from a wrapping 16-bit counter
///
/// IDs still held by a pending request are skipped, so two live requests never
/// share an ID.
#[derive(Debug, Default, Clone)]
pub struct RequestIdAllocator {
    next: i16,
}

impl RequestIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next free ID, or `None` when every ID is in use
    pub fn allocate<F>(&mut self, in_use: F) -> Option<i16>
    where
        F: Fn(i16) -> bool,
    {
        for _ in 0..=u16::MAX {
            let id = self.next;
            self.next = self.next.wrapping_add(1);
            if !in_use(id) {
                return Some(id);
            }
        }
        None
    }
}

/// A message or file send waiting for its send result
pub(crate) struct PendingMessage {
    pub reply: Reply<Result<(), MessageError>>,
    /// Present for uploads
    pub progress: Option<mpsc::UnboundedSender<UploadEvent>>,
}

/// An attachment download in progress
pub(crate) struct PendingDownload {
    pub reply: Reply<Result<FileDownloadResult, AttachmentRequestErrorCode>>,
    pub progress: mpsc::UnboundedSender<DownloadEvent>,
    pub header: Option<DownloadHeader>,
    pub accumulator: Option<Box<dyn TransferAccumulator>>,
    pub next_index: i32,
}

/// One caller waiting for a content-keyed response
pub(crate) struct Waiter<T> {
    pub id: u64,
    pub reply: Reply<T>,
}

pub(crate) type ConversationsReply = Result<Vec<LinkedConversation>, MessageError>;
pub(crate) type ConversationInfoReply = Result<Vec<RequestedConversation>, MessageError>;
pub(crate) type ThreadReply = Result<Vec<ConversationItem>, MessageError>;
pub(crate) type ThreadKey = (String, Option<i64>);

/// What a correlation timer guards
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum TimerKey {
    Message(i16),
    Download(i16),
    CreateChat(i16),
    /// A conversation list, conversation info or thread waiter
    Waiter(u64),
    FaceTimeLink,
    FaceTimeInitiate,
}

/// Deadlines for pending requests
#[derive(Default)]
pub(crate) struct Timers {
    queue: DelayQueue<TimerKey>,
    keys: HashMap<TimerKey, delay_queue::Key>,
}

impl Timers {
    /// Start the timer for `key`, or restart it if it is already running
    pub fn arm(&mut self, key: TimerKey, timeout: Duration) {
        match self.keys.get(&key) {
            Some(existing) => self.queue.reset(existing, timeout),
            None => {
                let handle = self.queue.insert(key.clone(), timeout);
                self.keys.insert(key, handle);
            }
        }
    }

    pub fn cancel(&mut self, key: &TimerKey) {
        if let Some(handle) = self.keys.remove(key) {
            self.queue.remove(&handle);
        }
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.keys.clear();
    }

    /// Wait for the next timer to fire; never completes while no timer is running
    pub async fn expired(&mut self) -> TimerKey {
        loop {
            if self.queue.is_empty() {
                std::future::pending::<()>().await;
            }
            if let Some(expired) = self.queue.next().await {
                let key = expired.into_inner();
                self.keys.remove(&key);
                return key;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

/// Every request waiting for the server
#[derive(Default)]
pub(crate) struct Correlations {
    ids: RequestIdAllocator,
    next_waiter: u64,
    pub timers: Timers,
    pub messages: HashMap<i16, PendingMessage>,
    pub downloads: HashMap<i16, PendingDownload>,
    pub chats: HashMap<i16, Reply<Result<String, CreateChatError>>>,
    pub conversations: Vec<Waiter<ConversationsReply>>,
    pub conversation_info: HashMap<String, Vec<Waiter<ConversationInfoReply>>>,
    pub threads: HashMap<ThreadKey, Vec<Waiter<ThreadReply>>>,
    pub face_time_link: Vec<Reply<Result<String, FaceTimeLinkErrorCode>>>,
    pub face_time_initiate: Vec<Reply<Result<(), FaceTimeInitiateError>>>,
}

impl fmt::Debug for Correlations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlations")
            .field("pending", &self.len())
            .field("timers", &self.timers.len())
            .finish()
    }
}

impl Correlations {
    pub fn new() -> Self {
        Self::default()
    }

    /// A request ID not held by any pending request
    pub fn allocate_id(&mut self) -> Option<i16> {
        let (messages, downloads, chats) = (&self.messages, &self.downloads, &self.chats);
        self.ids.allocate(|id| {
            messages.contains_key(&id) || downloads.contains_key(&id) || chats.contains_key(&id)
        })
    }

    pub fn next_waiter_id(&mut self) -> u64 {
        let id = self.next_waiter;
        self.next_waiter += 1;
        id
    }

    /// Number of callers waiting for a reply
    pub fn len(&self) -> usize {
        self.messages.len()
            + self.downloads.len()
            + self.chats.len()
            + self.conversations.len()
            + self.conversation_info.values().map(Vec::len).sum::<usize>()
            + self.threads.values().map(Vec::len).sum::<usize>()
            + self.face_time_link.len()
            + self.face_time_initiate.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Settle the request a fired timer guarded
    pub fn expire(&mut self, key: TimerKey) {
        debug!(?key, "Request timed out");
        match key {
            TimerKey::Message(id) => {
                if let Some(pending) = self.messages.remove(&id) {
                    let _ = pending.reply.send(Err(MessageError::network()));
                }
            }
            TimerKey::Download(id) => {
                if let Some(pending) = self.downloads.remove(&id) {
                    let _ = pending.reply.send(Err(AttachmentRequestErrorCode::Timeout));
                }
            }
            TimerKey::CreateChat(id) => {
                if let Some(reply) = self.chats.remove(&id) {
                    let _ = reply.send(Err(CreateChatError::network()));
                }
            }
            TimerKey::Waiter(id) => self.expire_waiter(id),
            TimerKey::FaceTimeLink => {
                for reply in self.face_time_link.drain(..) {
                    let _ = reply.send(Err(FaceTimeLinkErrorCode::Network));
                }
            }
            TimerKey::FaceTimeInitiate => {
                for reply in self.face_time_initiate.drain(..) {
                    let _ = reply.send(Err(FaceTimeInitiateError::network()));
                }
            }
        }
    }

    fn expire_waiter(&mut self, id: u64) {
        if let Some(waiter) = take_waiter(&mut self.conversations, id) {
            let _ = waiter.reply.send(Err(MessageError::network()));
            return;
        }
        if let Some(waiter) = take_keyed_waiter(&mut self.conversation_info, id) {
            let _ = waiter.reply.send(Err(MessageError::network()));
            return;
        }
        if let Some(waiter) = take_keyed_waiter(&mut self.threads, id) {
            let _ = waiter.reply.send(Err(MessageError::network()));
        }
    }

    /// Reject everything with the error for a lost connection
    pub fn reject_all(&mut self) {
        self.timers.clear();

        for (_, pending) in self.messages.drain() {
            let _ = pending.reply.send(Err(MessageError::network()));
        }
        for (_, pending) in self.downloads.drain() {
            let _ = pending.reply.send(Err(AttachmentRequestErrorCode::Timeout));
        }
        for (_, reply) in self.chats.drain() {
            let _ = reply.send(Err(CreateChatError::network()));
        }
        for waiter in self.conversations.drain(..) {
            let _ = waiter.reply.send(Err(MessageError::network()));
        }
        for waiter in self.conversation_info.drain().flat_map(|(_, list)| list) {
            let _ = waiter.reply.send(Err(MessageError::network()));
        }
        for waiter in self.threads.drain().flat_map(|(_, list)| list) {
            let _ = waiter.reply.send(Err(MessageError::network()));
        }
        for reply in self.face_time_link.drain(..) {
            let _ = reply.send(Err(FaceTimeLinkErrorCode::Network));
        }
        for reply in self.face_time_initiate.drain(..) {
            let _ = reply.send(Err(FaceTimeInitiateError::network()));
        }
    }
}

fn take_waiter<T>(waiters: &mut Vec<Waiter<T>>, id: u64) -> Option<Waiter<T>> {
    let position = waiters.iter().position(|waiter| waiter.id == id)?;
    Some(waiters.remove(position))
}

fn take_keyed_waiter<K, T>(table: &mut HashMap<K, Vec<Waiter<T>>>, id: u64) -> Option<Waiter<T>>
where
    K: Clone + Eq + std::hash::Hash,
{
    let key = table
        .iter()
        .find(|(_, waiters)| waiters.iter().any(|waiter| waiter.id == id))
        .map(|(key, _)| key.clone())?;
    let waiters = table.get_mut(&key)?;
    let waiter = take_waiter(waiters, id);
    if waiters.is_empty() {
        table.remove(&key);
    }
    waiter
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::error::MessageErrorCode;
    use std::collections::HashSet;

    fn pending_message() -> (PendingMessage, oneshot::Receiver<Result<(), MessageError>>) {
        let (reply, receiver) = oneshot::channel();
        (
            PendingMessage {
                reply,
                progress: None,
            },
            receiver,
        )
    }

    #[test]
    fn test_allocator_wraps() {
        let mut ids = RequestIdAllocator { next: i16::MAX };
        assert_eq!(ids.allocate(|_| false), Some(i16::MAX));
        assert_eq!(ids.allocate(|_| false), Some(i16::MIN));
    }

    #[test]
    fn test_allocator_skips_live_ids() {
        let mut ids = RequestIdAllocator::new();
        let live: HashSet<i16> = [0, 1, 3].into_iter().collect();
        assert_eq!(ids.allocate(|id| live.contains(&id)), Some(2));
        assert_eq!(ids.allocate(|id| live.contains(&id)), Some(4));
    }

    #[test]
    fn test_allocator_exhausted() {
        let mut ids = RequestIdAllocator::new();
        assert_eq!(ids.allocate(|_| true), None);
    }

    #[test]
    fn test_ids_unique_while_pending() {
        let mut correlations = Correlations::new();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = correlations.allocate_id().unwrap();
            assert!(seen.insert(id));
            correlations.messages.insert(id, pending_message().0);
        }
        assert_eq!(correlations.len(), 1000);
    }

    #[tokio::test]
    async fn test_reject_all_empties_tables() {
        let mut correlations = Correlations::new();
        let (message, message_rx) = pending_message();
        correlations.messages.insert(7, message);

        let (reply, chat_rx) = oneshot::channel();
        correlations.chats.insert(8, reply);

        let (reply, thread_rx) = oneshot::channel();
        let id = correlations.next_waiter_id();
        correlations
            .threads
            .entry(("chat".to_string(), None))
            .or_default()
            .push(Waiter { id, reply });
        correlations.timers.arm(TimerKey::Waiter(id), Duration::from_secs(10));

        correlations.reject_all();

        assert!(correlations.is_empty());
        assert_eq!(correlations.timers.len(), 0);
        assert_eq!(
            message_rx.await.unwrap().unwrap_err().code,
            MessageErrorCode::LocalNetwork
        );
        assert_eq!(chat_rx.await.unwrap().unwrap_err(), CreateChatError::network());
        assert!(thread_rx.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_settles_once() {
        let mut correlations = Correlations::new();
        let (message, mut message_rx) = pending_message();
        correlations.messages.insert(1, message);
        correlations
            .timers
            .arm(TimerKey::Message(1), Duration::from_secs(10));

        let key = correlations.timers.expired().await;
        assert_eq!(key, TimerKey::Message(1));
        correlations.expire(key.clone());
        assert!(message_rx.try_recv().unwrap().is_err());

        // A second expiry or a late reply finds nothing
        correlations.expire(key);
        assert!(correlations.messages.remove(&1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_restarts_timer() {
        let mut timers = Timers::default();
        timers.arm(TimerKey::Download(3), Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(8)).await;
        timers.arm(TimerKey::Download(3), Duration::from_secs(10));

        let started = tokio::time::Instant::now();
        assert_eq!(timers.expired().await, TimerKey::Download(3));
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[test]
    fn test_expire_keyed_waiter_removes_empty_entry() {
        let mut correlations = Correlations::new();
        let (reply, _receiver) = oneshot::channel();
        let id = correlations.next_waiter_id();
        correlations
            .conversation_info
            .entry("a b".to_string())
            .or_default()
            .push(Waiter { id, reply });

        correlations.expire(TimerKey::Waiter(id));
        assert!(correlations.conversation_info.is_empty());
    }
}
