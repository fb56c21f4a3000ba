//! EventChannel: synchronous typed pub/sub for one broadcast session.
//!
//! Handlers are keyed by event type and invoked in subscription order on the
//! publishing task. The handler list is snapshotted before delivery, so a
//! handler may publish, subscribe or unsubscribe without deadlocking. A handler
//! that panics is logged and skipped; the rest still run.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Handler<T> = Box<dyn Fn(&T) + Send + Sync>;

struct Slot {
    id: u64,
    handler: Arc<dyn Any + Send + Sync>,
}

/// Token returned by [`EventChannel::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: u64,
    event_type: TypeId,
}

/// Unsubscribes its handler when dropped.
pub struct SubscriptionGuard<'a> {
    channel: &'a EventChannel,
    subscription: Subscription,
}

impl Drop for SubscriptionGuard<'_> {
    fn drop(&mut self) {
        self.channel.unsubscribe(&self.subscription);
    }
}

#[derive(Default)]
pub struct EventChannel {
    slots: Mutex<HashMap<TypeId, Vec<Slot>>>,
    next_id: AtomicU64,
}

impl EventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for events of type `T`.
    pub fn subscribe<T, F>(&self, handler: F) -> Subscription
    where
        T: 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let event_type = TypeId::of::<T>();
        let boxed: Handler<T> = Box::new(handler);
        self.slots
            .lock()
            .unwrap()
            .entry(event_type)
            .or_default()
            .push(Slot {
                id,
                handler: Arc::new(boxed),
            });
        Subscription { id, event_type }
    }

    /// Like [`subscribe`](Self::subscribe), but the handler lives only as long
    /// as the returned guard.
    pub fn subscribe_scoped<T, F>(&self, handler: F) -> SubscriptionGuard<'_>
    where
        T: 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let subscription = self.subscribe(handler);
        SubscriptionGuard {
            channel: self,
            subscription,
        }
    }

    /// Remove a handler. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut slots = self.slots.lock().unwrap();
        let Some(list) = slots.get_mut(&subscription.event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|slot| slot.id != subscription.id);
        before != list.len()
    }

    /// Deliver `event` to every current subscriber of `T`.
    pub fn publish<T: 'static>(&self, event: T) {
        let handlers: Vec<Arc<dyn Any + Send + Sync>> = {
            let slots = self.slots.lock().unwrap();
            match slots.get(&TypeId::of::<T>()) {
                Some(list) => list.iter().map(|slot| slot.handler.clone()).collect(),
                None => return,
            }
        };

        tracing::trace!(
            event = type_name::<T>(),
            subscribers = handlers.len(),
            "publishing"
        );

        for handler in handlers {
            let Some(handler) = handler.downcast_ref::<Handler<T>>() else {
                continue;
            };
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::warn!(
                    event = type_name::<T>(),
                    "EventChannel: subscriber panicked, continuing delivery"
                );
            }
        }
    }

    /// Number of live handlers for `T`.
    pub fn subscriber_count<T: 'static>(&self) -> usize {
        self.slots
            .lock()
            .unwrap()
            .get(&TypeId::of::<T>())
            .map_or(0, Vec::len)
    }

    /// Drop every handler of every type.
    pub fn clear(&self) {
        self.slots.lock().unwrap().clear();
    }
}
