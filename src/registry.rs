//! Transport-independent event subscriptions.
//!
//! [`EventRegistry`] holds the logical table of event name → listeners. The
//! connection manager attaches the table to each transport it creates (tagged
//! with that transport's generation) and detaches it when the transport goes
//! away, so subscribers registered at any time, connected or not, keep
//! receiving events across reconnects.
//!
//! Listeners are invoked outside the registry lock, in the order the
//! transport surfaced the events.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

/// A subscriber callback.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

struct Entry {
    id: u64,
    listener: Listener,
}

#[derive(Default)]
struct Table {
    listeners: HashMap<String, Vec<Entry>>,
    next_id: u64,
    /// Generation of the transport the table is attached to, if any.
    attached: Option<u64>,
}

impl Table {
    fn remove_id(&mut self, event: &str, id: u64) -> bool {
        let Some(entries) = self.listeners.get_mut(event) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.listeners.remove(event);
        }
        removed
    }

    fn total(&self) -> usize {
        self.listeners.values().map(Vec::len).sum()
    }
}

/// Shared, cloneable subscription table.
#[derive(Clone, Default)]
pub struct EventRegistry {
    table: Arc<Mutex<Table>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `event`.
    ///
    /// The callback stays registered until the returned [`Subscription`] is
    /// unsubscribed, [`off`](Self::off) is called with the same listener, or
    /// [`remove_all`](Self::remove_all) clears it. Dropping the handle does
    /// not unsubscribe.
    pub fn on<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on_listener(event, Arc::new(callback))
    }

    /// Register an already shared listener.
    ///
    /// Registering the same `Arc` twice for one event is a no-op; the
    /// returned handle refers to the existing registration.
    pub fn on_listener(&self, event: &str, listener: Listener) -> Subscription {
        let mut table = self.table.lock();
        let existing = table
            .listeners
            .get(event)
            .and_then(|entries| entries.iter().find(|e| Arc::ptr_eq(&e.listener, &listener)))
            .map(|e| e.id);

        let id = match existing {
            Some(id) => id,
            None => {
                table.next_id += 1;
                let id = table.next_id;
                table
                    .listeners
                    .entry(event.to_string())
                    .or_default()
                    .push(Entry { id, listener });
                if let Some(generation) = table.attached {
                    debug!(event, generation, "listener attached to live transport");
                }
                id
            }
        };

        Subscription {
            event: event.to_string(),
            id,
            table: Arc::downgrade(&self.table),
        }
    }

    /// Register a callback that receives the payload decoded as `T`.
    ///
    /// Payloads that do not decode are logged and skipped.
    pub fn on_typed<T, F>(&self, event: &str, callback: F) -> Subscription
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let name = event.to_string();
        self.on(event, move |value| match T::deserialize(value) {
            Ok(payload) => callback(payload),
            Err(e) => warn!(event = %name, error = %e, "dropping undecodable payload"),
        })
    }

    /// Remove `listener` from `event`. Returns `true` if it was registered.
    pub fn off(&self, event: &str, listener: &Listener) -> bool {
        let mut table = self.table.lock();
        let id = table
            .listeners
            .get(event)
            .and_then(|entries| entries.iter().find(|e| Arc::ptr_eq(&e.listener, listener)))
            .map(|e| e.id);
        match id {
            Some(id) => table.remove_id(event, id),
            None => false,
        }
    }

    /// Remove every listener for `event`, or every listener at all when `None`.
    pub fn remove_all(&self, event: Option<&str>) {
        let mut table = self.table.lock();
        match event {
            Some(event) => {
                table.listeners.remove(event);
            }
            None => table.listeners.clear(),
        }
    }

    /// Number of listeners registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.table.lock().listeners.get(event).map_or(0, Vec::len)
    }

    /// Returns `true` while the table is attached to a live transport.
    pub fn is_attached(&self) -> bool {
        self.table.lock().attached.is_some()
    }

    /// Attach the full table to the transport with `generation`.
    /// Returns the number of listeners now live.
    pub(crate) fn attach(&self, generation: u64) -> usize {
        let mut table = self.table.lock();
        table.attached = Some(generation);
        let total = table.total();
        debug!(generation, listeners = total, "registry attached to transport");
        total
    }

    /// Detach from the transport with `generation`. Detaching a generation
    /// that is no longer attached does nothing.
    pub(crate) fn detach(&self, generation: u64) {
        let mut table = self.table.lock();
        if table.attached == Some(generation) {
            table.attached = None;
            debug!(generation, "registry detached from transport");
        }
    }

    /// Deliver `payload` to every listener of `event`, provided the table is
    /// attached to `generation`. Returns the number of listeners invoked.
    pub(crate) fn dispatch(&self, generation: u64, event: &str, payload: &Value) -> usize {
        let listeners: Vec<Listener> = {
            let table = self.table.lock();
            if table.attached != Some(generation) {
                debug!(event, generation, "dropping event from detached transport");
                return 0;
            }
            table
                .listeners
                .get(event)
                .map(|entries| entries.iter().map(|e| Arc::clone(&e.listener)).collect())
                .unwrap_or_default()
        };

        for listener in &listeners {
            listener(payload);
        }
        listeners.len()
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.lock();
        f.debug_struct("EventRegistry")
            .field("events", &table.listeners.len())
            .field("listeners", &table.total())
            .field("attached", &table.attached)
            .finish()
    }
}

/// Handle to one registration. Call [`unsubscribe`](Subscription::unsubscribe)
/// to remove it from the registry and from the live transport.
#[derive(Debug)]
pub struct Subscription {
    event: String,
    id: u64,
    table: Weak<Mutex<Table>>,
}

impl Subscription {
    /// The event this subscription listens to.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Remove the registration. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.table.upgrade() {
            Some(table) => table.lock().remove_id(&self.event, self.id),
            None => false,
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Listener) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let listener: Listener = Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, listener)
    }

    #[test]
    fn listeners_registered_while_detached_fire_after_attach() {
        let registry = EventRegistry::new();
        let (count, listener) = counter();
        registry.on_listener("new_message", listener);

        assert_eq!(registry.dispatch(1, "new_message", &Value::Null), 0);
        assert_eq!(registry.attach(1), 1);
        assert_eq!(registry.dispatch(1, "new_message", &Value::Null), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registrations_survive_transport_swap() {
        let registry = EventRegistry::new();
        let (count, listener) = counter();
        registry.on_listener("typing", listener);

        registry.attach(1);
        registry.dispatch(1, "typing", &Value::Null);
        registry.detach(1);
        registry.attach(2);

        // Late events from the old transport are ignored.
        assert_eq!(registry.dispatch(1, "typing", &Value::Null), 0);
        assert_eq!(registry.dispatch(2, "typing", &Value::Null), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stale_detach_keeps_current_attachment() {
        let registry = EventRegistry::new();
        registry.attach(3);
        registry.detach(2);
        assert!(registry.is_attached());
    }

    #[test]
    fn same_listener_is_stored_once() {
        let registry = EventRegistry::new();
        let (count, listener) = counter();
        registry.on_listener("typing", Arc::clone(&listener));
        registry.on_listener("typing", Arc::clone(&listener));
        assert_eq!(registry.listener_count("typing"), 1);

        registry.attach(1);
        registry.dispatch(1, "typing", &Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn independent_listeners_each_fire_once() {
        let registry = EventRegistry::new();
        let (a, la) = counter();
        let (b, lb) = counter();
        registry.on_listener("new_message", la);
        registry.on_listener("new_message", lb);
        registry.attach(1);

        assert_eq!(registry.dispatch(1, "new_message", &Value::Null), 2);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_and_off() {
        let registry = EventRegistry::new();
        let (_, la) = counter();
        let (_, lb) = counter();
        let sub = registry.on_listener("typing", la);
        registry.on_listener("typing", Arc::clone(&lb));

        assert_eq!(sub.event(), "typing");
        assert!(sub.unsubscribe());
        assert_eq!(registry.listener_count("typing"), 1);
        assert!(registry.off("typing", &lb));
        assert!(!registry.off("typing", &lb));
        assert_eq!(registry.listener_count("typing"), 0);
    }

    #[test]
    fn remove_all_for_one_event_or_everything() {
        let registry = EventRegistry::new();
        registry.on("typing", |_| {});
        registry.on("new_message", |_| {});
        registry.on("new_message", |_| {});

        registry.remove_all(Some("new_message"));
        assert_eq!(registry.listener_count("new_message"), 0);
        assert_eq!(registry.listener_count("typing"), 1);

        registry.remove_all(None);
        assert_eq!(registry.listener_count("typing"), 0);
    }

    #[test]
    fn unsubscribe_after_registry_dropped_is_false() {
        let registry = EventRegistry::new();
        let sub = registry.on("typing", |_| {});
        drop(registry);
        assert!(!sub.unsubscribe());
    }

    #[test]
    fn typed_listener_skips_bad_payloads() {
        #[derive(serde::Deserialize)]
        struct Status {
            status: String,
        }

        let registry = EventRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry.on_typed::<Status, _>("user_status", move |s| sink.lock().push(s.status));
        registry.attach(1);

        registry.dispatch(1, "user_status", &serde_json::json!({ "status": "away" }));
        registry.dispatch(1, "user_status", &serde_json::json!({ "nope": 1 }));

        assert_eq!(*seen.lock(), vec!["away".to_string()]);
    }
}
