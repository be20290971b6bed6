//! Per-component cooperative scheduler.
//!
//! Every component that mutates shared state owns one `EventQueue`. The
//! queue runs a dedicated thread that drives a current-thread tokio
//! runtime; all callbacks for the component execute on that thread, one
//! at a time, while holding the component's recursive lock.
//!
//! ```text
//!   any thread ──post_event──► [FIFO channel] ─┐
//!   socket fd  ──readable─────────────────────┼─► loop thread: 1 event,
//!   Timer      ──deadline─────────────────────┘   ready fds, 1 timer
//! ```
//!
//! A panic escaping a callback ends the loop and is reported to the
//! injected [`RestartHandler`]; it is never recovered in-process.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, mpsc as std_mpsc};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::select_all;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, warn};

use crate::platform::{RestartHandler, RestartReason};
use crate::timer::TimerShared;

/// A unit of work posted onto a queue.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

type FdHandler = Arc<Mutex<Box<dyn FnMut() + Send + 'static>>>;

type WritableHandler = Box<dyn FnOnce() + Send + 'static>;

/// Every descriptor is registered for both directions; write readiness is
/// only awaited while a writable handler is pending.
const FD_INTEREST: Interest = Interest::READABLE.add(Interest::WRITABLE);

/// Queue depth above which backlog diagnostics start.
pub const DEFAULT_BACKPRESSURE_THRESHOLD: usize = 256;
/// How long the backlog must persist before it is reported.
pub const DEFAULT_BACKPRESSURE_GRACE: Duration = Duration::from_secs(2);

// ── Descriptor bookkeeping ───────────────────────────────────────

/// Shared owner of a watched descriptor. The descriptor stays open until
/// the reactor registration holding it has been dropped.
struct WatchedFd(Arc<dyn AsRawFd + Send + Sync>);

impl AsRawFd for WatchedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

struct FdEntry {
    generation: u64,
    source: Arc<dyn AsRawFd + Send + Sync>,
    handler: FdHandler,
    /// One-shot handler for the next write readiness.
    on_writable: Option<WritableHandler>,
    /// Registration built eagerly by `file_descriptor_attach` while the
    /// loop was running; adopted by the loop at its next safe point.
    registration: Option<AsyncFd<WatchedFd>>,
}

#[derive(Default)]
struct FdTable {
    next_generation: u64,
    handlers: HashMap<RawFd, FdEntry>,
}

// ── Timer bookkeeping ────────────────────────────────────────────

#[derive(Default)]
struct TimerList {
    by_deadline: BTreeMap<(Instant, u64), Arc<TimerShared>>,
    deadlines: HashMap<u64, Instant>,
}

impl TimerList {
    fn insert(&mut self, deadline: Instant, id: u64, timer: Arc<TimerShared>) {
        self.by_deadline.insert((deadline, id), timer);
        self.deadlines.insert(id, deadline);
    }

    fn remove(&mut self, id: u64) -> Option<Arc<TimerShared>> {
        let deadline = self.deadlines.remove(&id)?;
        self.by_deadline.remove(&(deadline, id))
    }
}

struct Backpressure {
    threshold: usize,
    grace: Duration,
    over_since: Option<Instant>,
    reported: bool,
}

// ── Shared state ─────────────────────────────────────────────────

struct Shared {
    name: String,
    tx: mpsc::UnboundedSender<Job>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    wake: Notify,
    shutdown: AtomicBool,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    loop_thread: Mutex<Option<ThreadId>>,
    runtime: Mutex<Option<Handle>>,
    exec_lock: ReentrantMutex<()>,
    fds: Mutex<FdTable>,
    timers: Mutex<TimerList>,
    next_timer_id: AtomicU64,
    depth: AtomicUsize,
    high_water: AtomicUsize,
    backpressure: Mutex<Backpressure>,
    backpressure_reports: AtomicUsize,
    restart: Mutex<Option<Arc<dyn RestartHandler>>>,
}

impl Shared {
    fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers.lock().by_deadline.keys().next().map(|(at, _)| *at)
    }

    /// Pop the earliest expired timer with the arming id it fired for,
    /// rescheduling repeating ones.
    fn take_expired_timer(&self) -> Option<(Arc<TimerShared>, u64)> {
        let now = Instant::now();
        let mut timers = self.timers.lock();
        let (at, id) = match timers.by_deadline.keys().next() {
            Some(&(at, id)) if at <= now => (at, id),
            _ => return None,
        };
        let timer = timers.by_deadline.remove(&(at, id))?;
        timers.deadlines.remove(&id);

        if timer.id.load(Ordering::SeqCst) != id {
            return None;
        }
        if timer.is_repeating() {
            timers.insert(now + timer.timeout(), id, Arc::clone(&timer));
        }
        Some((timer, id))
    }

    fn note_depth(&self, depth: usize) {
        let mut bp = self.backpressure.lock();
        if depth > bp.threshold {
            let now = Instant::now();
            match bp.over_since {
                None => bp.over_since = Some(now),
                Some(since) if !bp.reported && now.duration_since(since) >= bp.grace => {
                    bp.reported = true;
                    self.backpressure_reports.fetch_add(1, Ordering::SeqCst);
                    error!(
                        queue = %self.name,
                        depth,
                        threshold = bp.threshold,
                        "event queue backlog above threshold for {:?}",
                        bp.grace
                    );
                }
                _ => {}
            }
        } else if bp.over_since.is_some() {
            bp.over_since = None;
            bp.reported = false;
        }
    }
}

// ── EventQueue ───────────────────────────────────────────────────

/// Cheap, cloneable handle to a component's event queue.
#[derive(Clone)]
pub struct EventQueue {
    shared: Arc<Shared>,
}

impl EventQueue {
    /// Create a stopped queue. `name` becomes the worker thread name.
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                tx,
                rx: Mutex::new(Some(rx)),
                wake: Notify::new(),
                shutdown: AtomicBool::new(false),
                running: AtomicBool::new(false),
                thread: Mutex::new(None),
                loop_thread: Mutex::new(None),
                runtime: Mutex::new(None),
                exec_lock: ReentrantMutex::new(()),
                fds: Mutex::new(FdTable::default()),
                timers: Mutex::new(TimerList::default()),
                next_timer_id: AtomicU64::new(1),
                depth: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
                backpressure: Mutex::new(Backpressure {
                    threshold: DEFAULT_BACKPRESSURE_THRESHOLD,
                    grace: DEFAULT_BACKPRESSURE_GRACE,
                    over_since: None,
                    reported: false,
                }),
                backpressure_reports: AtomicUsize::new(0),
                restart: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Route fatal loop failures to `handler`.
    pub fn set_restart_handler(&self, handler: Arc<dyn RestartHandler>) {
        *self.shared.restart.lock() = Some(handler);
    }

    /// Configure backlog diagnostics.
    pub fn set_backpressure(&self, threshold: usize, grace: Duration) {
        let mut bp = self.shared.backpressure.lock();
        bp.threshold = threshold;
        bp.grace = grace;
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Spawn the worker thread. Returns `false` if it is already running.
    pub fn start_event_loop(&self) -> bool {
        let mut slot = self.shared.thread.lock();
        if self.shared.running.load(Ordering::SeqCst) {
            return false;
        }
        if let Some(previous) = slot.take() {
            let _ = previous.join();
        }
        let Some(rx) = self.shared.rx.lock().take() else {
            error!(queue = %self.shared.name, "event channel missing; cannot start");
            return false;
        };

        self.shared.shutdown.store(false, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let spawned = thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || run_loop(shared, rx, ready_tx));

        match spawned {
            Ok(handle) => {
                *slot = Some(handle);
                let _ = ready_rx.recv();
                true
            }
            Err(e) => {
                error!(queue = %self.shared.name, "failed to spawn event loop: {e}");
                self.shared.running.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Ask the loop to exit and wait for it, unless called from the loop
    /// thread itself (the thread then exits after the current callback).
    pub fn stop_event_loop(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
        if self.on_loop_thread() {
            return;
        }
        let handle = self.shared.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(queue = %self.shared.name, "event loop thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// `true` on the loop thread, and whenever the loop is not running.
    pub fn current_thread_is_mine(&self) -> bool {
        match *self.shared.loop_thread.lock() {
            Some(id) => id == thread::current().id(),
            None => true,
        }
    }

    fn on_loop_thread(&self) -> bool {
        *self.shared.loop_thread.lock() == Some(thread::current().id())
    }

    /// The component-level recursive lock held around every callback.
    pub fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.shared.exec_lock.lock()
    }

    // ── Posting ──────────────────────────────────────────────────

    /// Enqueue `f` for execution on the loop thread. Safe from any thread.
    pub fn post_event<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let depth = self.shared.depth.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.high_water.fetch_max(depth, Ordering::SeqCst);
        self.shared.note_depth(depth);
        if self.shared.tx.send(Box::new(f)).is_err() {
            self.shared.depth.fetch_sub(1, Ordering::SeqCst);
            warn!(queue = %self.shared.name, "event channel closed; event dropped");
        }
    }

    /// Block until every event posted before this call has run.
    ///
    /// Returns `false` on timeout, when the loop is stopped, or when
    /// called from the loop thread.
    pub fn flush(&self, timeout: Duration) -> bool {
        if !self.is_running() || self.on_loop_thread() {
            return false;
        }
        let (tx, rx) = std_mpsc::channel();
        self.post_event(move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(timeout).is_ok()
    }

    /// Events waiting to run.
    pub fn depth(&self) -> usize {
        self.shared.depth.load(Ordering::SeqCst)
    }

    pub fn high_water_mark(&self) -> usize {
        self.shared.high_water.load(Ordering::SeqCst)
    }

    /// Number of backlog episodes reported so far.
    pub fn backpressure_reports(&self) -> usize {
        self.shared.backpressure_reports.load(Ordering::SeqCst)
    }

    // ── Descriptors ──────────────────────────────────────────────

    /// Run `handler` on the loop thread whenever `source` is readable.
    ///
    /// The handler must drain the descriptor until `WouldBlock`. The queue
    /// keeps `source` alive until its registration is released, so the
    /// descriptor is never closed underneath the reactor.
    pub fn file_descriptor_attach<S, H>(&self, source: Arc<S>, handler: H) -> bool
    where
        S: AsRawFd + Send + Sync + 'static,
        H: FnMut() + Send + 'static,
    {
        let fd = source.as_raw_fd();
        if fd < 0 {
            return false;
        }
        let source: Arc<dyn AsRawFd + Send + Sync> = source;

        let mut fds = self.shared.fds.lock();
        if fds.handlers.contains_key(&fd) {
            warn!(queue = %self.shared.name, fd, "descriptor already attached");
            return false;
        }

        let runtime = self.shared.runtime.lock().clone();
        let registration = match runtime {
            Some(handle) => {
                let _enter = handle.enter();
                match AsyncFd::with_interest(WatchedFd(Arc::clone(&source)), FD_INTEREST) {
                    Ok(registration) => Some(registration),
                    Err(e) => {
                        warn!(queue = %self.shared.name, fd, "descriptor attach failed: {e}");
                        return false;
                    }
                }
            }
            None => None,
        };

        fds.next_generation += 1;
        let generation = fds.next_generation;
        fds.handlers.insert(
            fd,
            FdEntry {
                generation,
                source,
                handler: Arc::new(Mutex::new(Box::new(handler))),
                on_writable: None,
                registration,
            },
        );
        drop(fds);
        self.shared.wake.notify_one();
        true
    }

    /// Run `handler` once on the loop thread when the attached `fd` can
    /// take more bytes. Replaces a handler that has not run yet. `false`
    /// when `fd` is not attached.
    pub fn file_descriptor_await_writable<H>(&self, fd: RawFd, handler: H) -> bool
    where
        H: FnOnce() + Send + 'static,
    {
        {
            let mut fds = self.shared.fds.lock();
            let Some(entry) = fds.handlers.get_mut(&fd) else {
                return false;
            };
            entry.on_writable = Some(Box::new(handler));
        }
        self.shared.wake.notify_one();
        true
    }

    /// Stop dispatching for `fd`. The reactor registration is released at
    /// the loop's next safe point.
    pub fn file_descriptor_detach(&self, fd: RawFd) -> bool {
        let removed = self.shared.fds.lock().handlers.remove(&fd).is_some();
        if removed {
            self.shared.wake.notify_one();
        }
        removed
    }

    // ── Timers ───────────────────────────────────────────────────

    /// Arm `timer` to fire after `timeout`, replacing any earlier arming.
    /// Returns the new, non-zero timer id.
    pub(crate) fn start_timer(&self, timer: &Arc<TimerShared>, timeout: Duration) -> u64 {
        let id = self.next_timer_id();
        let deadline = Instant::now() + timeout;
        {
            let mut timers = self.shared.timers.lock();
            let previous = timer.id.swap(id, Ordering::SeqCst);
            if previous != 0 {
                timers.remove(previous);
            }
            timers.insert(deadline, id, Arc::clone(timer));
        }
        self.shared.wake.notify_one();
        id
    }

    /// Disarm `timer` if it is armed.
    pub(crate) fn stop_timer(&self, timer: &Arc<TimerShared>) {
        let mut timers = self.shared.timers.lock();
        let id = timer.id.swap(0, Ordering::SeqCst);
        if id != 0 {
            timers.remove(id);
        }
    }

    /// Cancel a pending timer by id. Returns `false` if it already fired
    /// or was never armed.
    pub fn cancel_timer(&self, id: u64) -> bool {
        let mut timers = self.shared.timers.lock();
        match timers.remove(id) {
            Some(timer) => {
                let _ = timer
                    .id
                    .compare_exchange(id, 0, Ordering::SeqCst, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Number of armed timers.
    pub fn timer_count(&self) -> usize {
        self.shared.timers.lock().deadlines.len()
    }

    fn next_timer_id(&self) -> u64 {
        loop {
            let id = self.shared.next_timer_id.fetch_add(1, Ordering::SeqCst);
            if id != 0 {
                return id;
            }
        }
    }
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("name", &self.shared.name)
            .field("running", &self.is_running())
            .field("depth", &self.depth())
            .finish()
    }
}

// ── Loop thread ──────────────────────────────────────────────────

fn run_loop(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<Job>,
    ready: std_mpsc::Sender<()>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(queue = %shared.name, "failed to build runtime: {e}");
            *shared.rx.lock() = Some(rx);
            shared.running.store(false, Ordering::SeqCst);
            let _ = ready.send(());
            return;
        }
    };

    *shared.loop_thread.lock() = Some(thread::current().id());
    *shared.runtime.lock() = Some(runtime.handle().clone());
    let _ = ready.send(());
    debug!(queue = %shared.name, "event loop started");

    let mut event_loop = EventLoop {
        shared: Arc::clone(&shared),
        watched: HashMap::new(),
    };
    let outcome = runtime.block_on(event_loop.run(&mut rx));
    drop(event_loop);

    *shared.runtime.lock() = None;
    for entry in shared.fds.lock().handlers.values_mut() {
        entry.registration = None;
    }
    drop(runtime);

    *shared.rx.lock() = Some(rx);
    *shared.loop_thread.lock() = None;
    shared.running.store(false, Ordering::SeqCst);

    match outcome {
        Ok(()) => debug!(queue = %shared.name, "event loop stopped"),
        Err(message) => {
            error!(queue = %shared.name, "callback panicked: {message}; loop halted");
            let handler = shared.restart.lock().clone();
            if let Some(handler) = handler {
                handler.restart_request(RestartReason::EventLoopPanic {
                    queue: shared.name.clone(),
                });
            }
        }
    }
}

struct EventLoop {
    shared: Arc<Shared>,
    watched: HashMap<RawFd, (u64, AsyncFd<WatchedFd>)>,
}

impl EventLoop {
    async fn run(&mut self, rx: &mut mpsc::UnboundedReceiver<Job>) -> Result<(), String> {
        loop {
            if self.shared.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.reconcile_descriptors();

            let deadline = self.shared.next_timer_deadline();
            let writers = self.pending_writers();
            let job = {
                let readable = any_readable(&self.watched);
                let writable = any_writable(&self.watched, &writers);
                let sleep = async move {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at.into()).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    biased;
                    job = rx.recv() => match job {
                        Some(job) => Some(job),
                        None => return Ok(()),
                    },
                    _ = self.shared.wake.notified() => None,
                    _ = readable => None,
                    _ = writable => None,
                    _ = sleep => None,
                }
            };

            if let Some(job) = job {
                let depth = self.shared.depth.fetch_sub(1, Ordering::SeqCst) - 1;
                self.shared.note_depth(depth);
                self.dispatch(job)?;
            }
            self.service_descriptors()?;
            if let Some((timer, id)) = self.shared.take_expired_timer() {
                self.dispatch(move || timer.fire(id))?;
            }
        }
    }

    fn dispatch<F: FnOnce()>(&self, f: F) -> Result<(), String> {
        let _guard = self.shared.exec_lock.lock();
        panic::catch_unwind(AssertUnwindSafe(f)).map_err(panic_message)
    }

    /// Safe point: drop registrations of detached descriptors and adopt
    /// (or build) registrations for newly attached ones.
    fn reconcile_descriptors(&mut self) {
        let mut fds = self.shared.fds.lock();
        self.watched.retain(|fd, (generation, _)| {
            fds.handlers
                .get(fd)
                .is_some_and(|entry| entry.generation == *generation)
        });

        let mut failed = Vec::new();
        for (fd, entry) in fds.handlers.iter_mut() {
            if self.watched.contains_key(fd) {
                continue;
            }
            let registration = match entry.registration.take() {
                Some(registration) => Ok(registration),
                None => AsyncFd::with_interest(WatchedFd(Arc::clone(&entry.source)), FD_INTEREST),
            };
            match registration {
                Ok(registration) => {
                    self.watched.insert(*fd, (entry.generation, registration));
                }
                Err(e) => {
                    warn!(queue = %self.shared.name, fd = *fd, "cannot watch descriptor: {e}");
                    failed.push(*fd);
                }
            }
        }
        for fd in failed {
            fds.handlers.remove(&fd);
        }
    }

    fn service_descriptors(&self) -> Result<(), String> {
        for (fd, (generation, registration)) in self.watched.iter() {
            let Some(Ok(mut guard)) = registration.readable().now_or_never() else {
                continue;
            };
            let handler = self
                .shared
                .fds
                .lock()
                .handlers
                .get(fd)
                .filter(|entry| entry.generation == *generation)
                .map(|entry| Arc::clone(&entry.handler));
            if let Some(handler) = handler {
                self.dispatch(|| {
                    let mut h = handler.lock();
                    let f: &mut (dyn FnMut() + Send) = &mut **h;
                    f();
                })?;
            }
            guard.clear_ready();
        }
        self.service_writers()
    }

    /// Watched descriptors with a writable handler waiting.
    fn pending_writers(&self) -> Vec<RawFd> {
        let fds = self.shared.fds.lock();
        self.watched
            .iter()
            .filter(|(fd, (generation, _))| {
                fds.handlers.get(fd).is_some_and(|entry| {
                    entry.generation == *generation && entry.on_writable.is_some()
                })
            })
            .map(|(fd, _)| *fd)
            .collect()
    }

    fn service_writers(&self) -> Result<(), String> {
        for fd in self.pending_writers() {
            let Some((generation, registration)) = self.watched.get(&fd) else {
                continue;
            };
            let Some(Ok(mut guard)) = registration.writable().now_or_never() else {
                continue;
            };
            let handler = self
                .shared
                .fds
                .lock()
                .handlers
                .get_mut(&fd)
                .filter(|entry| entry.generation == *generation)
                .and_then(|entry| entry.on_writable.take());
            let Some(handler) = handler else {
                continue;
            };
            self.dispatch(handler)?;

            // A handler that re-arms has hit `WouldBlock`.
            let rearmed = self
                .shared
                .fds
                .lock()
                .handlers
                .get(&fd)
                .is_some_and(|entry| entry.on_writable.is_some());
            if rearmed {
                guard.clear_ready();
            }
        }
        Ok(())
    }
}

async fn any_readable(watched: &HashMap<RawFd, (u64, AsyncFd<WatchedFd>)>) {
    if watched.is_empty() {
        return std::future::pending::<()>().await;
    }
    let waits = watched.values().map(|(_, registration)| {
        Box::pin(async move {
            let _ = registration.readable().await;
        })
    });
    select_all(waits).await;
}

async fn any_writable(watched: &HashMap<RawFd, (u64, AsyncFd<WatchedFd>)>, writers: &[RawFd]) {
    let waits: Vec<_> = writers
        .iter()
        .filter_map(|fd| watched.get(fd))
        .map(|(_, registration)| {
            Box::pin(async move {
                let _ = registration.writable().await;
            })
        })
        .collect();
    if waits.is_empty() {
        return std::future::pending::<()>().await;
    }
    select_all(waits).await;
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ── Tests ────────────────────────────────────────────────────────
