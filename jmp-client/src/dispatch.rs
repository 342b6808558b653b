use jmp_proto::JmpMessage;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::error;

/// Emitted when the connection is established or lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub connected: bool,
}

/// Emitted when a login attempt is resolved one way or the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEvent {
    pub authorized: bool,
    /// The challenge nonce, present when authorization was refused
    pub nonce: Option<String>,
}

/// Identity handle returned by `add_*`; used to remove a listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registry<E> {
    listeners: Mutex<Vec<(ListenerId, Arc<dyn Fn(&E) + Send + Sync>)>>,
}

impl<E> Registry<E> {
    fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, id: ListenerId, listener: Arc<dyn Fn(&E) + Send + Sync>) {
        self.listeners
            .lock()
            .expect("listener registry poisoned")
            .push((id, listener));
    }

    fn remove(&self, id: ListenerId) {
        self.listeners
            .lock()
            .expect("listener registry poisoned")
            .retain(|(existing, _)| *existing != id);
    }

    /// Invokes every listener in registration order. A panic inside one
    /// listener is contained so the remaining listeners still run.
    fn notify(&self, event: &E, channel: &str) {
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .expect("listener registry poisoned")
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!("{} listener panicked; remaining listeners still run", channel);
            }
        }
    }
}

/// Listener registries for the three event channels of a connection.
pub struct Dispatcher {
    next_id: AtomicU64,
    connection: Registry<ConnectionEvent>,
    auth: Registry<AuthEvent>,
    message: Registry<JmpMessage>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            connection: Registry::new(),
            auth: Registry::new(),
            message: Registry::new(),
        }
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn add_connection_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.connection.add(id, Arc::new(listener));
        id
    }

    pub fn remove_connection_listener(&self, id: ListenerId) {
        self.connection.remove(id);
    }

    pub fn add_auth_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&AuthEvent) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.auth.add(id, Arc::new(listener));
        id
    }

    pub fn remove_auth_listener(&self, id: ListenerId) {
        self.auth.remove(id);
    }

    pub fn add_message_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&JmpMessage) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.message.add(id, Arc::new(listener));
        id
    }

    pub fn remove_message_listener(&self, id: ListenerId) {
        self.message.remove(id);
    }

    pub(crate) fn notify_connection(&self, event: &ConnectionEvent) {
        self.connection.notify(event, "connection");
    }

    pub(crate) fn notify_auth(&self, event: &AuthEvent) {
        self.auth.notify(event, "auth");
    }

    pub(crate) fn notify_message(&self, message: &JmpMessage) {
        self.message.notify(message, "message");
    }
}
