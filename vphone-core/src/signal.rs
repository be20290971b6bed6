//! Typed multicast notifications with RAII subscriptions.
//!
//! ```text
//!  Signal<A> ──connect(f)──► Connection ──drop──► slot removed
//!      │
//!      └──emit(&a)──► snapshot of live slots ──► f(&a) ...
//! ```
//!
//! Emission iterates a snapshot taken under the slot lock, so handlers may
//! connect or disconnect (themselves or others) while a signal is being
//! emitted. A slot disconnected mid-emission is skipped for the rest of it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Callback<A> = Box<dyn Fn(&A) + Send + Sync + 'static>;

struct SlotEntry<A> {
    id: u64,
    live: AtomicBool,
    callback: Callback<A>,
}

struct SlotList<A> {
    next_id: u64,
    slots: Vec<Arc<SlotEntry<A>>>,
}

// ── Signal ───────────────────────────────────────────────────────

/// An ordered collection of subscriber callbacks taking `&A`.
pub struct Signal<A> {
    slots: Arc<Mutex<SlotList<A>>>,
}

impl<A: 'static> Signal<A> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(SlotList {
                next_id: 0,
                slots: Vec::new(),
            })),
        }
    }

    /// Subscribe `f`. The subscription lives as long as the returned
    /// [`Connection`].
    #[must_use = "dropping the Connection disconnects the handler"]
    pub fn connect<F>(&self, f: F) -> Connection
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let entry = {
            let mut list = self.slots.lock();
            list.next_id += 1;
            let entry = Arc::new(SlotEntry {
                id: list.next_id,
                live: AtomicBool::new(true),
                callback: Box::new(f),
            });
            list.slots.push(Arc::clone(&entry));
            entry
        };

        let weak: Weak<Mutex<SlotList<A>>> = Arc::downgrade(&self.slots);
        Connection {
            disconnect: Some(Box::new(move || {
                entry.live.store(false, Ordering::Release);
                if let Some(slots) = weak.upgrade() {
                    slots.lock().slots.retain(|s| s.id != entry.id);
                }
            })),
        }
    }

    /// Invoke every live subscriber in connection order.
    pub fn emit(&self, args: &A) {
        let snapshot: Vec<Arc<SlotEntry<A>>> = self.slots.lock().slots.clone();
        for slot in snapshot {
            if slot.live.load(Ordering::Acquire) {
                (slot.callback)(args);
            }
        }
    }

    /// Number of connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.slots.lock().slots.len()
    }
}

impl<A: 'static> Default for Signal<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for Signal<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("subscribers", &self.slots.lock().slots.len())
            .finish()
    }
}

// ── Connection ───────────────────────────────────────────────────

/// Owns one subscription. Dropping it disconnects the handler.
///
/// Holds only a weak reference to the signal; a connection may outlive it.
pub struct Connection {
    disconnect: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Connection {
    /// Remove the handler now. Idempotent.
    pub fn disconnect(&mut self) {
        if let Some(disconnect) = self.disconnect.take() {
            disconnect();
        }
    }

    /// Whether this connection still owns a subscription.
    pub fn is_connected(&self) -> bool {
        self.disconnect.is_some()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ── ConnectionSet ────────────────────────────────────────────────

/// The subscriptions of one component, all released together.
#[derive(Debug, Default)]
pub struct ConnectionSet {
    connections: Mutex<Vec<Connection>>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, connection: Connection) {
        self.connections.lock().push(connection);
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    /// Disconnect everything held so far.
    pub fn clear(&self) {
        let drained: Vec<Connection> = std::mem::take(&mut *self.connections.lock());
        drop(drained);
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emit_reaches_subscribers_in_order() {
        let signal: Signal<u32> = Signal::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = Arc::clone(&seen);
        let _c1 = signal.connect(move |v| s1.lock().push(("first", *v)));
        let s2 = Arc::clone(&seen);
        let _c2 = signal.connect(move |v| s2.lock().push(("second", *v)));

        signal.emit(&7);
        assert_eq!(*seen.lock(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn dropping_connection_unsubscribes() {
        let signal: Signal<()> = Signal::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let conn = signal.connect(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        signal.emit(&());
        drop(conn);
        signal.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn handler_may_disconnect_another_during_emit() {
        let signal: Signal<()> = Signal::new();
        let victim_hits = Arc::new(AtomicUsize::new(0));
        let victim: Arc<Mutex<Option<Connection>>> = Arc::new(Mutex::new(None));

        let v = Arc::clone(&victim);
        let _killer = signal.connect(move |_| {
            if let Some(mut c) = v.lock().take() {
                c.disconnect();
            }
        });
        let hits = Arc::clone(&victim_hits);
        *victim.lock() = Some(signal.connect(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        }));

        signal.emit(&());
        signal.emit(&());
        assert_eq!(victim_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_may_disconnect_itself() {
        let signal: Arc<Signal<()>> = Arc::new(Signal::new());
        let slot: Arc<Mutex<Option<Connection>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(AtomicUsize::new(0));

        let s = Arc::clone(&slot);
        let h = Arc::clone(&hits);
        *slot.lock() = Some(signal.connect(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            s.lock().take();
        }));

        signal.emit(&());
        signal.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn connect_during_emit_waits_for_next_emit() {
        let signal: Arc<Signal<()>> = Arc::new(Signal::new());
        let late = Arc::new(AtomicUsize::new(0));
        let held = Arc::new(ConnectionSet::new());

        let sig = Arc::clone(&signal);
        let l = Arc::clone(&late);
        let set = Arc::clone(&held);
        let _c = signal.connect(move |_| {
            let l = Arc::clone(&l);
            set.push(sig.connect(move |_| {
                l.fetch_add(1, Ordering::SeqCst);
            }));
        });

        signal.emit(&());
        assert_eq!(late.load(Ordering::SeqCst), 0);
        signal.emit(&());
        assert_eq!(late.load(Ordering::SeqCst), 1);
        held.clear();
    }

    #[test]
    fn connection_outlives_signal() {
        let signal: Signal<()> = Signal::new();
        let mut conn = signal.connect(|_| {});
        drop(signal);
        conn.disconnect();
        assert!(!conn.is_connected());
    }

    #[test]
    fn connection_set_clears_all() {
        let signal: Signal<()> = Signal::new();
        let set = ConnectionSet::new();
        set.push(signal.connect(|_| {}));
        set.push(signal.connect(|_| {}));
        assert_eq!(signal.subscriber_count(), 2);
        set.clear();
        assert_eq!(signal.subscriber_count(), 0);
        assert_eq!(set.len(), 0);
    }
}
