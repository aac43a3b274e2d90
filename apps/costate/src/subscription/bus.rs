use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::error;

use crate::model::SyncState;

pub type StateCallback = Arc<dyn Fn(&SyncState) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    callbacks: Vec<(u64, StateCallback)>,
}

/// Fan-out of state snapshots to registered callbacks.
#[derive(Default, Clone)]
pub struct SubscriptionBus {
    registry: Arc<Mutex<Registry>>,
}

impl SubscriptionBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: StateCallback) -> StateSubscription {
        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.callbacks.push((id, callback));
        StateSubscription {
            id,
            registry: Arc::downgrade(&self.registry),
            active: AtomicBool::new(true),
        }
    }

    /// Calls every callback with `state`. Callbacks run without the registry
    /// lock held; a panicking callback is logged and the rest still run.
    /// Returns the number of callbacks that panicked.
    pub fn notify(&self, state: &SyncState) -> usize {
        let callbacks: Vec<(u64, StateCallback)> = self.registry.lock().callbacks.clone();
        let mut panicked = 0;
        for (id, callback) in callbacks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(state))) {
                panicked += 1;
                error!(
                    target = "costate::subscription",
                    subscriber = id,
                    panic = panic_message(payload.as_ref()),
                    "state subscriber panicked"
                );
            }
        }
        panicked
    }

    /// Drops every callback; returns how many were registered.
    pub fn clear(&self) -> usize {
        let mut registry = self.registry.lock();
        let count = registry.callbacks.len();
        registry.callbacks.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.registry.lock().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by [`SubscriptionBus::subscribe`]. Dropping it leaves the
/// callback registered; call [`StateSubscription::unsubscribe`] to remove it.
pub struct StateSubscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
    active: AtomicBool,
}

impl StateSubscription {
    /// Idempotent; a no-op once the bus itself is gone.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().callbacks.retain(|(id, _)| *id != self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for StateSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSubscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
