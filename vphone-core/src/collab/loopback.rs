//! A simulated far end implementing [`SipStack`].
//!
//! Runs on its own [`EventQueue`]; delays (ringing, answering) are driven
//! by one-shot [`Timer`]s. Besides answering the manager's requests it can
//! inject remote-side activity: ring-ins, remote hangups, remote hold and
//! key-frame requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::sip::{SignalingEvent, SignalingSink, SipStack};
use crate::call::{
    BridgeStatus, DialRequest, DisconnectReason, MediaCapabilities, RejectReason, RemoteInfo,
};
use crate::event_queue::EventQueue;
use crate::signal::Connection;
use crate::timer::{Timer, TimerMode};

/// Behaviour of the simulated far end.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Time between `Proceeding` and the far end answering.
    pub answer_delay: Duration,
    /// Media features reported when a call is established.
    pub capabilities: MediaCapabilities,
    /// Whether outgoing calls are negotiated transferable.
    pub transferable: bool,
    /// Dial strings answered with `Busy`.
    pub busy_numbers: Vec<String>,
    /// Transfer targets that fail.
    pub failing_transfer_targets: Vec<String>,
    /// Echo text and DTMF back to the sender.
    pub echo: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            answer_delay: Duration::from_millis(200),
            capabilities: MediaCapabilities {
                text: true,
                dtmf: true,
                vco: false,
            },
            transferable: true,
            busy_numbers: Vec::new(),
            failing_transfer_targets: Vec::new(),
            echo: true,
        }
    }
}

#[derive(Default)]
struct Session {
    local_hold: bool,
    remote_hold: bool,
    answer_timer: Option<(Timer, Connection)>,
}

struct Inner {
    me: Weak<Inner>,
    queue: EventQueue,
    config: LoopbackConfig,
    sink: Mutex<Option<SignalingSink>>,
    sessions: Mutex<HashMap<u32, Session>>,
    invites: Mutex<HashMap<u64, RemoteInfo>>,
    next_session: AtomicU64,
}

/// In-process signaling stack with a scripted far end.
pub struct LoopbackSipStack {
    inner: Arc<Inner>,
}

impl LoopbackSipStack {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            inner: Arc::new_cyclic(|me| Inner {
                me: me.clone(),
                queue: EventQueue::new("sip-loopback"),
                config,
                sink: Mutex::new(None),
                sessions: Mutex::new(HashMap::new()),
                invites: Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    pub fn start(&self) -> bool {
        self.inner.queue.start_event_loop()
    }

    pub fn stop(&self) {
        self.inner.queue.stop_event_loop();
    }

    pub fn queue(&self) -> &EventQueue {
        &self.inner.queue
    }

    /// Number of dialogs the far end currently tracks.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    // ── Remote-side simulation ───────────────────────────────────

    /// Present an inbound invite from `remote`. Returns its session id.
    pub fn ring_in(&self, remote: RemoteInfo) -> u64 {
        let session = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        info!(session, from = %remote.phone_number, "simulating incoming invite");
        self.inner.invites.lock().insert(session, remote.clone());
        let transferable = self.inner.config.transferable;
        self.inner.post(move |inner| {
            inner.deliver(SignalingEvent::IncomingInvite {
                session,
                remote,
                transferable,
            });
        });
        session
    }

    /// The far end hangs up.
    pub fn remote_hang_up(&self, call: u32) {
        self.inner.post(move |inner| {
            if inner.sessions.lock().remove(&call).is_none() {
                return;
            }
            inner.deliver(SignalingEvent::RemoteHangup { call });
            inner.deliver(SignalingEvent::Disconnected {
                call,
                reason: DisconnectReason::RemoteHangup,
            });
        });
    }

    /// The far end puts the call on hold, or takes it off hold.
    pub fn remote_hold(&self, call: u32, hold: bool) {
        self.inner.post(move |inner| {
            let status = inner.sessions.lock().get_mut(&call).map(|session| {
                session.remote_hold = hold;
                (session.local_hold, session.remote_hold)
            });
            if let Some((local, remote)) = status {
                inner.deliver(SignalingEvent::HoldChanged {
                    call,
                    local,
                    remote,
                });
            }
        });
    }

    pub fn remote_text(&self, call: u32, text: impl Into<String>) {
        let text = text.into();
        self.inner.post(move |inner| {
            inner.deliver(SignalingEvent::TextReceived { call, text });
        });
    }

    pub fn request_key_frame(&self, call: u32) {
        self.inner.post(move |inner| {
            inner.deliver(SignalingEvent::KeyFrameRequested { call });
        });
    }

    /// Report an unrecoverable fault, for one call or for the stack.
    pub fn fault(&self, call: Option<u32>, description: impl Into<String>) {
        let description = description.into();
        self.inner.post(move |inner| {
            inner.deliver(SignalingEvent::Fault { call, description });
        });
    }
}

impl Drop for LoopbackSipStack {
    fn drop(&mut self) {
        self.inner.queue.stop_event_loop();
    }
}

impl Inner {
    fn post<F>(&self, f: F)
    where
        F: FnOnce(&Inner) + Send + 'static,
    {
        let me = self.me.clone();
        self.queue.post_event(move || {
            if let Some(inner) = me.upgrade() {
                f(&inner);
            }
        });
    }

    fn deliver(&self, event: SignalingEvent) {
        debug!(?event, "loopback -> manager");
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => {
                if !sink.deliver(event) {
                    warn!("signaling sink is gone");
                }
            }
            None => warn!("no signaling sink attached; event dropped"),
        }
    }

    /// Answer `call` after the configured delay.
    fn schedule_answer(&self, call: u32) {
        let timer = Timer::new(&self.queue, self.config.answer_delay, TimerMode::OneShot);
        let me = self.me.clone();
        let connection = timer.timeout_signal().connect(move |_| {
            if let Some(inner) = me.upgrade() {
                inner.far_end_answers(call);
            }
        });
        timer.start();
        if let Some(session) = self.sessions.lock().get_mut(&call) {
            session.answer_timer = Some((timer, connection));
        }
    }

    fn far_end_answers(&self, call: u32) {
        let pending = self
            .sessions
            .lock()
            .get_mut(&call)
            .and_then(|s| s.answer_timer.take());
        if pending.is_none() {
            return;
        }
        drop(pending);
        self.establish(call);
    }

    fn establish(&self, call: u32) {
        self.deliver(SignalingEvent::Answered { call });
        self.deliver(SignalingEvent::PortNegotiation {
            call,
            success: true,
        });
        self.deliver(SignalingEvent::Established {
            call,
            capabilities: self.config.capabilities,
            transferable: self.config.transferable,
        });
    }

    fn hold_update(&self, call: u32, local: bool) {
        let status = self.sessions.lock().get_mut(&call).map(|session| {
            session.local_hold = local;
            (session.local_hold, session.remote_hold)
        });
        match status {
            Some((local, remote)) => {
                self.deliver(SignalingEvent::HoldChanged {
                    call,
                    local,
                    remote,
                });
            }
            None => self.deliver(SignalingEvent::HoldFailed { call }),
        }
    }
}

impl SipStack for LoopbackSipStack {
    fn attach(&self, sink: SignalingSink) {
        *self.inner.sink.lock() = Some(sink);
    }

    fn dial(&self, call: u32, request: &DialRequest) {
        let target = request.dial_string.clone();
        self.inner.post(move |inner| {
            inner.sessions.lock().insert(call, Session::default());
            if inner.config.busy_numbers.iter().any(|n| *n == target) {
                inner.sessions.lock().remove(&call);
                inner.deliver(SignalingEvent::Disconnected {
                    call,
                    reason: DisconnectReason::Busy,
                });
                return;
            }
            inner.deliver(SignalingEvent::Proceeding { call });
            inner.schedule_answer(call);
        });
    }

    fn invite_bind(&self, session: u64, call: u32) {
        self.inner.post(move |inner| {
            if inner.invites.lock().remove(&session).is_some() {
                inner.sessions.lock().insert(call, Session::default());
            } else {
                warn!(session, "bind for unknown invite");
            }
        });
    }

    fn invite_refuse(&self, session: u64, reason: RejectReason) {
        self.inner.post(move |inner| {
            inner.invites.lock().remove(&session);
            info!(session, ?reason, "invite refused");
        });
    }

    fn answer(&self, call: u32) {
        self.inner.post(move |inner| {
            if inner.sessions.lock().contains_key(&call) {
                inner.establish(call);
            }
        });
    }

    fn reject(&self, call: u32, reason: RejectReason) {
        self.inner.post(move |inner| {
            inner.sessions.lock().remove(&call);
            debug!(call, ?reason, "rejecting");
            inner.deliver(SignalingEvent::Disconnected {
                call,
                reason: DisconnectReason::Rejected,
            });
        });
    }

    fn hold(&self, call: u32) {
        self.inner.post(move |inner| inner.hold_update(call, true));
    }

    fn resume(&self, call: u32) {
        self.inner.post(move |inner| inner.hold_update(call, false));
    }

    fn transfer(&self, call: u32, target: &str) {
        let target = target.to_string();
        self.inner.post(move |inner| {
            inner.deliver(SignalingEvent::TransferAccepted { call });
            if inner
                .config
                .failing_transfer_targets
                .iter()
                .any(|t| *t == target)
            {
                inner.deliver(SignalingEvent::TransferFailed { call });
                return;
            }
            inner.sessions.lock().remove(&call);
            inner.deliver(SignalingEvent::TransferCompleted {
                call,
                new_remote: None,
            });
            inner.deliver(SignalingEvent::Disconnected {
                call,
                reason: DisconnectReason::Transferred,
            });
        });
    }

    fn hang_up(&self, call: u32) {
        self.inner.post(move |inner| {
            inner.sessions.lock().remove(&call);
            inner.deliver(SignalingEvent::Disconnected {
                call,
                reason: DisconnectReason::LocalHangup,
            });
        });
    }

    fn bridge_dial(&self, call: u32, uri: &str) {
        debug!(call, uri, "bridge dial");
        self.inner.post(move |inner| {
            inner.deliver(SignalingEvent::BridgeStateChanged {
                call,
                status: BridgeStatus::Connected,
            });
        });
    }

    fn bridge_disconnect(&self, call: u32) {
        self.inner.post(move |inner| {
            inner.deliver(SignalingEvent::BridgeStateChanged {
                call,
                status: BridgeStatus::Disconnected,
            });
        });
    }

    fn text_send(&self, call: u32, text: &str) {
        if !self.inner.config.echo {
            return;
        }
        let text = text.to_string();
        self.inner.post(move |inner| {
            inner.deliver(SignalingEvent::TextReceived { call, text });
        });
    }

    fn dtmf_send(&self, call: u32, digit: char) {
        if !self.inner.config.echo {
            return;
        }
        self.inner.post(move |inner| {
            inner.deliver(SignalingEvent::DtmfReceived { call, digit });
        });
    }
}
