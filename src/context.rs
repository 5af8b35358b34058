//! Per-connection session context.
//!
//! Every SSH connection owns one [`SessionContext`]: the authenticated
//! identity plus a typed slot bag for state that engines attach along the
//! way (the web tunnel's socket path, its serve task, ...). Slots are keyed
//! by opaque marker types so unrelated modules cannot collide.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, OnceLock};

use russh::keys::PublicKey;
use tokio::sync::watch;

/// Context scoped to one SSH connection.
///
/// Identity fields are written once during auth and read-only afterwards.
/// The slot bag is mutated by the session's own tasks; readers in accept
/// loops may hold stale-but-valid references, the context never invalidates
/// a slot on their behalf.
pub struct SessionContext {
    remote_addr: SocketAddr,
    user: OnceLock<String>,
    public_key: OnceLock<PublicKey>,
    slots: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    shutdown: watch::Sender<bool>,
}

impl SessionContext {
    pub fn new(remote_addr: SocketAddr) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            remote_addr,
            user: OnceLock::new(),
            public_key: OnceLock::new(),
            slots: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Record the authenticated user name. Later writes are ignored.
    pub fn set_user(&self, user: &str) {
        let _ = self.user.set(user.to_string());
    }

    pub fn user(&self) -> Option<&str> {
        self.user.get().map(String::as_str)
    }

    /// Record the accepted public key. Later writes are ignored.
    pub fn set_public_key(&self, key: PublicKey) {
        let _ = self.public_key.set(key);
    }

    pub fn public_key(&self) -> Option<&PublicKey> {
        self.public_key.get()
    }

    /// Store a slot value, replacing any previous value of the same type.
    pub fn set<T: Send + Sync + 'static>(&self, value: T) {
        let mut slots = self.slots.lock().expect("context slots poisoned");
        slots.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Clone the slot value of type `T`, if present.
    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        let slots = self.slots.lock().expect("context slots poisoned");
        slots
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Remove and return the slot value of type `T`.
    pub fn take<T: Send + Sync + 'static>(&self) -> Option<T> {
        let mut slots = self.slots.lock().expect("context slots poisoned");
        slots
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }

    /// Mark the session as ended, waking every [`Self::done`] future.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Future that resolves when the session ends.
    pub fn done(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown.subscribe();
        async move {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}
