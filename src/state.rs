//! Per-connection state and the registry that owns it between invocations.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hyper::http::Extensions;

use crate::controller::Controller;
use crate::http::Reply;

/// Identifies one request/response exchange on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Mutable context bridging the invocations of one logical request.
///
/// Controllers that need more than the stock fields keep their own data in
/// [`extensions`](Self::extensions).
#[derive(Debug, Default)]
pub struct ConnectionState {
    /// Request body received so far.
    pub request_data: Vec<u8>,
    /// Set once the cached response has been accepted by the transport.
    pub response_sent: bool,
    /// The built response, re-served on every later invocation.
    pub response: Option<Reply>,
    /// Invocations spent waiting for a request body.
    pub wait_iterations: u32,
    pub extensions: Extensions,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }
}

pub(crate) struct Slot {
    pub(crate) owner: Arc<dyn Controller>,
    pub(crate) state: ConnectionState,
}

/// Maps live connections to the state their controller created.
///
/// A state is taken out while its controller runs and put back afterwards,
/// so the lock is never held across user code. Invocations for one
/// connection never overlap, which makes the take/put pair race free.
pub struct StateRegistry {
    next: AtomicU64,
    slots: Mutex<HashMap<ConnectionId, Slot>>,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            slots: Mutex::new(HashMap::with_capacity(64)),
        }
    }

    /// Allocates an identifier for a new exchange.
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of states currently alive.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn take(&self, id: ConnectionId) -> Option<Slot> {
        self.lock().remove(&id)
    }

    pub(crate) fn put(&self, id: ConnectionId, slot: Slot) {
        if self.lock().insert(id, slot).is_some() {
            log::warn!("connection {} already had a state, replaced it", id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Slot>> {
        // a panicking controller never runs under this lock
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for StateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateRegistry")
            .field("live", &self.len())
            .finish()
    }
}
