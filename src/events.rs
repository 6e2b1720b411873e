//! Named-event publish/subscribe used by the client to report outcomes.
//!
//! Handlers run synchronously inside [`EventBus::emit`], in registration
//! order. A handler that panics is isolated: the panic is caught and logged,
//! and the remaining handlers still run. The handler list is snapshotted
//! before dispatch, so handlers may register or remove handlers themselves.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

use crate::error::FaceError;
use crate::types::{BatchCompareReport, CompareOutcome, InitResult};

/// The fixed set of events a [`FaceCompareClient`](crate::FaceCompareClient) emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEvent {
    InitSuccess,
    InitError,
    CompareSuccess,
    CompareError,
    BatchComplete,
    /// Generic failure, emitted after the operation-specific error event.
    Error,
    Cleared,
    ConfigUpdated,
    Destroyed,
}

impl ClientEvent {
    pub const ALL: [ClientEvent; 9] = [
        ClientEvent::InitSuccess,
        ClientEvent::InitError,
        ClientEvent::CompareSuccess,
        ClientEvent::CompareError,
        ClientEvent::BatchComplete,
        ClientEvent::Error,
        ClientEvent::Cleared,
        ClientEvent::ConfigUpdated,
        ClientEvent::Destroyed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ClientEvent::InitSuccess => "initSuccess",
            ClientEvent::InitError => "initError",
            ClientEvent::CompareSuccess => "compareSuccess",
            ClientEvent::CompareError => "compareError",
            ClientEvent::BatchComplete => "batchComplete",
            ClientEvent::Error => "error",
            ClientEvent::Cleared => "cleared",
            ClientEvent::ConfigUpdated => "configUpdated",
            ClientEvent::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientEvent {
    type Err = FaceError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        ClientEvent::ALL
            .into_iter()
            .find(|event| event.as_str() == name)
            .ok_or_else(|| FaceError::Validation(format!("unknown event `{name}`")))
    }
}

/// Data delivered with an event.
#[derive(Debug, Clone)]
pub enum EventPayload {
    None,
    Init(InitResult),
    Compare(CompareOutcome),
    Batch(BatchCompareReport),
    Failure {
        operation: &'static str,
        error: FaceError,
    },
}

/// Returned by [`EventBus::on`]; pass it to [`EventBus::off`] to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&EventPayload) + Send + Sync>;

/// Event registry owned by one client.
pub struct EventBus {
    handlers: Mutex<HashMap<ClientEvent, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
    logging: AtomicBool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            logging: AtomicBool::new(true),
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<ClientEvent, usize> = self
            .lock()
            .iter()
            .map(|(event, list)| (*event, list.len()))
            .collect();
        f.debug_struct("EventBus").field("handlers", &counts).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClientEvent, Vec<(HandlerId, Handler)>>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set_logging(&self, enabled: bool) {
        self.logging.store(enabled, Ordering::Relaxed);
    }

    /// Register `handler` for `event`.
    pub fn on<F>(&self, event: ClientEvent, handler: F) -> HandlerId
    where
        F: Fn(&EventPayload) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()
            .entry(event)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove one handler, or every handler for `event` when `handler` is `None`.
    /// Returns how many handlers were removed.
    pub fn off(&self, event: ClientEvent, handler: Option<HandlerId>) -> usize {
        let mut handlers = self.lock();
        match handler {
            None => handlers.remove(&event).map_or(0, |list| list.len()),
            Some(id) => {
                let Some(list) = handlers.get_mut(&event) else {
                    return 0;
                };
                let before = list.len();
                list.retain(|(registered, _)| *registered != id);
                let removed = before - list.len();
                if list.is_empty() {
                    handlers.remove(&event);
                }
                removed
            }
        }
    }

    /// Invoke every handler currently registered for `event`.
    pub fn emit(&self, event: ClientEvent, payload: &EventPayload) {
        let snapshot: Vec<(HandlerId, Handler)> = self
            .lock()
            .get(&event)
            .map(|list| list.to_vec())
            .unwrap_or_default();

        for (id, handler) in snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                if self.logging.load(Ordering::Relaxed) {
                    warn!(
                        event = %event,
                        handler_id = id.0,
                        reason = panic_message(panic.as_ref()),
                        "event_handler_panicked"
                    );
                }
            }
        }
    }

    pub fn handler_count(&self, event: ClientEvent) -> usize {
        self.lock().get(&event).map_or(0, Vec::len)
    }

    /// Drop every registration.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}
