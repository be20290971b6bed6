//! One-shot and repeating timers bound to an [`EventQueue`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::event_queue::EventQueue;
use crate::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    OneShot,
    Repeating,
}

/// State shared between a [`Timer`] handle and its queue's timer list.
pub(crate) struct TimerShared {
    /// Id of the current arming, 0 when disarmed.
    pub(crate) id: AtomicU64,
    timeout: Mutex<Duration>,
    mode: TimerMode,
    signal: Signal<()>,
}

impl TimerShared {
    pub(crate) fn is_repeating(&self) -> bool {
        self.mode == TimerMode::Repeating
    }

    pub(crate) fn timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    /// Emit for arming `id` unless the timer was stopped or re-armed since
    /// it expired. A one-shot timer is disarmed before its slots run.
    pub(crate) fn fire(&self, id: u64) {
        let current = if self.is_repeating() {
            self.id.load(Ordering::SeqCst) == id
        } else {
            self.id
                .compare_exchange(id, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        };
        if current {
            self.signal.emit(&());
        }
    }
}

/// A schedulable unit that emits [`Timer::timeout_signal`] on the owning
/// queue's thread.
///
/// Dropping the timer disarms it.
pub struct Timer {
    shared: Arc<TimerShared>,
    queue: EventQueue,
}

impl Timer {
    pub fn new(queue: &EventQueue, timeout: Duration, mode: TimerMode) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                id: AtomicU64::new(0),
                timeout: Mutex::new(timeout),
                mode,
                signal: Signal::new(),
            }),
            queue: queue.clone(),
        }
    }

    /// Arm the timer. An armed timer is re-armed from now.
    pub fn start(&self) {
        let timeout = self.shared.timeout();
        self.queue.start_timer(&self.shared, timeout);
    }

    /// Disarm the timer. It will not fire until started again.
    pub fn stop(&self) {
        self.queue.stop_timer(&self.shared);
    }

    pub fn restart(&self) {
        self.stop();
        self.start();
    }

    pub fn is_active(&self) -> bool {
        self.shared.id.load(Ordering::SeqCst) != 0
    }

    /// Id of the current arming, 0 when disarmed.
    pub fn id(&self) -> u64 {
        self.shared.id.load(Ordering::SeqCst)
    }

    pub fn mode(&self) -> TimerMode {
        self.shared.mode
    }

    /// Change the timeout used by the next `start`.
    pub fn timeout_set(&self, timeout: Duration) {
        *self.shared.timeout.lock() = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout()
    }

    pub fn timeout_signal(&self) -> &Signal<()> {
        &self.shared.signal
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("queue", &self.queue.name())
            .field("mode", &self.shared.mode)
            .field("timeout", &self.shared.timeout())
            .field("id", &self.id())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    fn running_queue(name: &str) -> EventQueue {
        let queue = EventQueue::new(name);
        assert!(queue.start_event_loop());
        queue
    }

    #[test]
    fn one_shot_fires_once_after_timeout() {
        let queue = running_queue("oneshot");
        let timer = Timer::new(&queue, Duration::from_millis(40), TimerMode::OneShot);
        let (tx, rx) = mpsc::channel();
        let q = queue.clone();
        let _c = timer.timeout_signal().connect(move |_| {
            let _ = tx.send((Instant::now(), q.current_thread_is_mine()));
        });

        let started = Instant::now();
        timer.start();
        assert!(timer.is_active());

        let (fired_at, on_loop) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fired_at.duration_since(started) >= Duration::from_millis(40));
        assert!(on_loop);
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
        assert!(!timer.is_active());
        queue.stop_event_loop();
    }

    #[test]
    fn stopped_timer_never_fires() {
        let queue = running_queue("stopped");
        let timer = Timer::new(&queue, Duration::from_millis(30), TimerMode::OneShot);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _c = timer.timeout_signal().connect(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        timer.start();
        timer.stop();
        thread::sleep(Duration::from_millis(120));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(queue.timer_count(), 0);
        queue.stop_event_loop();
    }

    #[test]
    fn cancel_by_id_prevents_fire() {
        let queue = running_queue("cancel");
        let timer = Timer::new(&queue, Duration::from_millis(30), TimerMode::OneShot);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _c = timer.timeout_signal().connect(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        timer.start();
        let id = timer.id();
        assert_ne!(id, 0);
        assert!(queue.cancel_timer(id));
        assert!(!queue.cancel_timer(id));
        assert!(!timer.is_active());
        thread::sleep(Duration::from_millis(120));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        queue.stop_event_loop();
    }

    #[test]
    fn restart_issues_fresh_id_and_fires_once() {
        let queue = running_queue("rearm");
        let timer = Timer::new(&queue, Duration::from_millis(30), TimerMode::OneShot);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _c = timer.timeout_signal().connect(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        timer.start();
        let first = timer.id();
        timer.restart();
        assert_ne!(timer.id(), first);
        assert_eq!(queue.timer_count(), 1);

        thread::sleep(Duration::from_millis(150));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        queue.stop_event_loop();
    }

    #[test]
    fn repeating_timer_keeps_firing_until_stopped() {
        let queue = running_queue("repeat");
        let timer = Timer::new(&queue, Duration::from_millis(10), TimerMode::Repeating);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _c = timer.timeout_signal().connect(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        timer.start();
        let deadline = Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(hits.load(Ordering::SeqCst) >= 3);
        assert!(timer.is_active());

        timer.stop();
        assert!(queue.flush(Duration::from_secs(5)));
        let settled = hits.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(hits.load(Ordering::SeqCst), settled);
        queue.stop_event_loop();
    }

    #[test]
    fn dropping_timer_disarms_it() {
        let queue = EventQueue::new("drop");
        let timer = Timer::new(&queue, Duration::from_secs(60), TimerMode::OneShot);
        timer.start();
        assert_eq!(queue.timer_count(), 1);
        drop(timer);
        assert_eq!(queue.timer_count(), 0);
    }

    #[test]
    fn timer_armed_while_stopped_fires_after_start() {
        let queue = EventQueue::new("late");
        let timer = Timer::new(&queue, Duration::from_millis(10), TimerMode::OneShot);
        let (tx, rx) = mpsc::channel();
        let _c = timer.timeout_signal().connect(move |_| {
            let _ = tx.send(());
        });
        timer.start();
        queue.start_event_loop();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        queue.stop_event_loop();
    }
}
