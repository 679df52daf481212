//! # Events
//!
//! Observer registries for everything the connection manager reports.
//!
//! Listeners are plain callbacks. Registering one returns a [`Subscription`];
//! the listener stays registered exactly as long as the subscription is alive,
//! so dropping it (or calling [`Subscription::cancel`]) unsubscribes
//! deterministically. [`CachedObservers`] additionally remember the last value
//! and replay it to every new listener.
//!
//! Callbacks run on the manager task and must not block.

use crate::error::{ConnectionErrorCode, RemoteUpdateErrorCode};
use crate::protocol::message::{
    ConversationItem, MessageModifier, RequestedConversation, ServerUpdateData,
};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
}

/// A set of listeners for values of type `T`
pub struct Observers<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Observers<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }
}

impl<T: 'static> fmt::Debug for Observers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("listeners", &self.len())
            .finish()
    }
}

impl<T: 'static> Observers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry<T>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a listener until the returned subscription is dropped
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.push((id, Arc::new(listener)));
            id
        };

        let registry = Arc::downgrade(&self.registry);
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .listeners
                    .retain(|(existing, _)| *existing != id);
            }
        })
    }

    /// Call every listener with `value`
    ///
    /// Listeners may subscribe or unsubscribe from inside the callback; the
    /// change takes effect from the next emit.
    pub fn emit(&self, value: &T) {
        let listeners: Vec<Listener<T>> = self
            .lock()
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(value);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Observers that remember the last emitted value
pub struct CachedObservers<T> {
    observers: Observers<T>,
    value: Arc<Mutex<T>>,
}

impl<T> Clone for CachedObservers<T> {
    fn clone(&self) -> Self {
        Self {
            observers: self.observers.clone(),
            value: self.value.clone(),
        }
    }
}

impl<T: Default> Default for CachedObservers<T> {
    fn default() -> Self {
        Self {
            observers: Observers::default(),
            value: Arc::new(Mutex::new(T::default())),
        }
    }
}

impl<T: fmt::Debug + 'static> fmt::Debug for CachedObservers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("CachedObservers")
            .field("value", &*value)
            .field("listeners", &self.observers.len())
            .finish()
    }
}

impl<T: Clone + Send + 'static> CachedObservers<T> {
    pub fn new(initial: T) -> Self {
        Self {
            observers: Observers::default(),
            value: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn get(&self) -> T {
        self.value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Register a listener; it is called with the current value immediately
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        listener(&self.get());
        self.observers.subscribe(listener)
    }

    /// Store `value` and notify every listener
    pub fn emit(&self, value: T) {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = value.clone();
        self.observers.emit(&value);
    }
}

/// Keeps a listener registered; dropping it unsubscribes
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Unsubscribe now
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Connection lifecycle as seen by listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting,
    Open,
    Close(ConnectionErrorCode),
}

/// Server software update events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteUpdateEvent {
    /// The update the server offers, or `None` when there is none
    Listing(Option<ServerUpdateData>),
    /// The server accepted an install request
    Initiated,
    Error {
        code: RemoteUpdateErrorCode,
        details: Option<String>,
    },
}

/// Call events that arrive outside a correlated request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    OutgoingAccepted { link: String },
    OutgoingRejected,
    OutgoingError { details: Option<String> },
    IncomingHandled { link: String },
    IncomingHandleError { details: Option<String> },
}

/// Every observer registry the connection manager emits on
#[derive(Debug, Clone, Default)]
pub struct EventHub {
    pub connection: Observers<ConnectionEvent>,
    pub message_updates: Observers<Vec<ConversationItem>>,
    pub modifier_updates: Observers<Vec<MessageModifier>>,
    pub conversation_updates: Observers<Vec<RequestedConversation>>,
    pub remote_update: Observers<RemoteUpdateEvent>,
    pub call_events: Observers<CallEvent>,
    pub face_time_supported: CachedObservers<bool>,
    /// Address of the party currently calling in
    pub incoming_caller: CachedObservers<Option<String>>,
    /// Addresses of an outgoing call waiting for an answer
    pub outgoing_callee: CachedObservers<Option<Vec<String>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }
}
