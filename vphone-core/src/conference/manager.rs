//! The conference manager: single authority over the live call set.
//!
//! ```text
//!  VRCL / UI ──call_dial / Call ops──┐
//!                                    ▼
//!  SipStack ──SignalingSink──► [cm EventQueue] ──► Call state machine
//!                                    │
//!                                    └──► signals: state changes, events,
//!                                         removals, text, dtmf, bridge
//! ```
//!
//! All mutation happens on the manager's queue. Synchronous entry points
//! (`call_dial`, the policy setters, queries) take the queue's recursive
//! lock or the storage lock directly and never wait on the loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::storage::CallStorage;
use crate::call::{
    BridgeStatus, Call, CallController, CallEvent, CallHandle, CallRequest, CallState,
    CallStateChange, CallStateMask, DialRequest, Direction, DisconnectReason, RejectReason,
    RemoteInfo, SubState, TransferStatus, classify,
};
use crate::collab::{
    MessageViewer, SignalingEvent, SignalingHandler, SignalingSink, SipStack, VideoInput,
};
use crate::context::Context;
use crate::error::VpError;
use crate::event_queue::EventQueue;
use crate::platform::{RestartHandler, RestartReason};
use crate::signal::{Connection, Signal};
use crate::timer::{Timer, TimerMode};

const SHUTDOWN_FLUSH: Duration = Duration::from_secs(2);

/// How long a call may sit in `Disconnecting` before the manager ends it
/// without the signaling stack.
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ── Configuration ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConferenceConfig {
    pub max_calls: usize,
    pub auto_reject: bool,
    pub allow_incoming_calls: bool,
    pub local_name: String,
    pub local_number: String,
    pub disconnect_timeout: Duration,
}

impl Default for ConferenceConfig {
    fn default() -> Self {
        Self {
            max_calls: 1,
            auto_reject: false,
            allow_incoming_calls: true,
            local_name: String::new(),
            local_number: String::new(),
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocalIdentity {
    pub name: String,
    pub number: String,
}

#[derive(Debug, Clone, Copy)]
struct Policy {
    max_calls: usize,
    auto_reject: bool,
    allow_incoming: bool,
}

// ── Statistics ───────────────────────────────────────────────────

/// Snapshot of the manager's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConferenceStats {
    /// Calls that reached `Connected` before ending.
    pub calls_completed: u64,
    /// Calls that ended without ever connecting.
    pub calls_failed: u64,
    pub incoming_refused: u64,
    pub port_negotiation_ok: u64,
    pub port_negotiation_failed: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    calls_completed: AtomicU64,
    calls_failed: AtomicU64,
    incoming_refused: AtomicU64,
    port_negotiation_ok: AtomicU64,
    port_negotiation_failed: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> ConferenceStats {
        ConferenceStats {
            calls_completed: self.calls_completed.load(Ordering::Relaxed),
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
            incoming_refused: self.incoming_refused.load(Ordering::Relaxed),
            port_negotiation_ok: self.port_negotiation_ok.load(Ordering::Relaxed),
            port_negotiation_failed: self.port_negotiation_failed.load(Ordering::Relaxed),
        }
    }
}

// ── Signals ──────────────────────────────────────────────────────

/// A classified call event.
#[derive(Debug, Clone)]
pub struct CallNotice {
    pub call: CallHandle,
    pub event: CallEvent,
}

#[derive(Debug, Clone)]
pub struct TextNotice {
    pub call: CallHandle,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct DtmfNotice {
    pub call: CallHandle,
    pub digit: char,
}

#[derive(Debug, Clone)]
pub struct BridgeNotice {
    pub call: CallHandle,
    pub status: BridgeStatus,
}

/// Everything the manager announces. Emitted on the manager's thread.
#[derive(Debug, Default)]
pub struct ConferenceSignals {
    pub call_state_changed: Signal<CallStateChange>,
    pub call_event: Signal<CallNotice>,
    pub call_removed: Signal<CallHandle>,
    pub text_received: Signal<TextNotice>,
    pub dtmf_received: Signal<DtmfNotice>,
    pub bridge_changed: Signal<BridgeNotice>,
}

// ── Core ─────────────────────────────────────────────────────────

struct ManagerCore {
    me: Weak<ManagerCore>,
    queue: EventQueue,
    storage: CallStorage,
    next_index: AtomicU32,
    policy: Mutex<Policy>,
    identity: LocalIdentity,
    sip: Arc<dyn SipStack>,
    video: Option<Arc<dyn VideoInput>>,
    viewer: Option<Arc<dyn MessageViewer>>,
    restart: Arc<dyn RestartHandler>,
    recording: AtomicBool,
    stats: StatCounters,
    signals: ConferenceSignals,
    disconnect_timeout: Duration,
    /// Per-call deadline for leaving `Disconnecting`.
    disconnect_guards: Mutex<HashMap<u32, (Timer, Connection)>>,
}

impl ManagerCore {
    fn post<F>(&self, f: F)
    where
        F: FnOnce(&ManagerCore) + Send + 'static,
    {
        let me = self.me.clone();
        self.queue.post_event(move || {
            if let Some(core) = me.upgrade() {
                f(&core);
            }
        });
    }

    fn next_index(&self) -> u32 {
        loop {
            let index = self.next_index.fetch_add(1, Ordering::SeqCst);
            if index != 0 {
                return index;
            }
        }
    }

    fn new_call(&self, direction: Direction, dial: Option<DialRequest>) -> CallHandle {
        let controller: Weak<dyn CallController> = self.me.clone();
        Arc::new(Call::new(self.next_index(), direction, dial, controller))
    }

    // ── Transitions and fan-out ──────────────────────────────────

    fn apply(&self, call: &CallHandle, state: CallState, substate: SubState) -> bool {
        match call.state_apply(state, substate) {
            Some(change) => {
                self.publish(&change);
                true
            }
            None => false,
        }
    }

    fn publish(&self, change: &CallStateChange) {
        info!(
            call = change.call.index(),
            "{}/{} -> {}/{}",
            change.prev_state,
            change.prev_substate,
            change.new_state,
            change.new_substate
        );
        self.signals.call_state_changed.emit(change);
        if let Some(event) = classify(
            change.prev_state,
            change.new_state,
            change.new_substate,
            change.call.direction(),
        ) {
            self.signals.call_event.emit(&CallNotice {
                call: Arc::clone(&change.call),
                event,
            });
        }
        if change.new_state == CallState::Disconnecting
            && change.prev_state != CallState::Disconnecting
        {
            self.arm_disconnect_guard(&change.call);
        }
        self.update_recording();
    }

    fn arm_disconnect_guard(&self, call: &CallHandle) {
        let index = call.index();
        let timer = Timer::new(&self.queue, self.disconnect_timeout, TimerMode::OneShot);
        let me = self.me.clone();
        let connection = timer.timeout_signal().connect(move |_| {
            if let Some(core) = me.upgrade() {
                core.disconnect_overdue(index);
            }
        });
        timer.start();
        self.disconnect_guards
            .lock()
            .insert(index, (timer, connection));
    }

    fn disconnect_overdue(&self, index: u32) {
        let guard = self.disconnect_guards.lock().remove(&index);
        if guard.is_none() {
            return;
        }
        let Some(call) = self.storage.get_by_index(index) else {
            return;
        };
        if call.is_terminal() {
            return;
        }
        warn!(
            call = index,
            timeout = ?self.disconnect_timeout,
            "signaling never confirmed the disconnect; ending call"
        );
        let reason = call
            .disconnect_reason()
            .unwrap_or(DisconnectReason::LocalHangup);
        self.finish(&call, reason);
        drop(guard);
    }

    /// Drive `call` to terminal `Disconnected` and retire it.
    fn finish(&self, call: &CallHandle, reason: DisconnectReason) {
        call.disconnect_reason_set(reason);
        let state = call.state();
        if !matches!(state, CallState::Disconnecting | CallState::Disconnected) {
            self.apply(call, CallState::Disconnecting, reason.substate());
        }
        self.apply(call, CallState::Disconnected, SubState::empty());
        self.retire(call);
    }

    fn retire(&self, call: &CallHandle) {
        let guard = self.disconnect_guards.lock().remove(&call.index());
        drop(guard);
        match self.storage.remove(call) {
            Ok(()) => {
                let counter = if call.connected_at().is_some() {
                    &self.stats.calls_completed
                } else {
                    &self.stats.calls_failed
                };
                counter.fetch_add(1, Ordering::Relaxed);
                debug!(call = call.index(), "call retired");
                self.signals.call_removed.emit(call);
                self.update_recording();
            }
            Err(e) => debug!(call = call.index(), "retire skipped: {e}"),
        }
    }

    /// Record while at least one call has media up.
    fn update_recording(&self) {
        let Some(video) = &self.video else {
            return;
        };
        let established = self.storage.count(CallStateMask::ESTABLISHED) > 0;
        let recording = self.recording.load(Ordering::SeqCst);
        if established && !recording {
            match video.record_start() {
                Ok(()) => self.recording.store(true, Ordering::SeqCst),
                Err(e) => warn!("video record start failed: {e}"),
            }
        } else if !established && recording {
            if let Err(e) = video.record_stop() {
                warn!("video record stop failed: {e}");
            }
            self.recording.store(false, Ordering::SeqCst);
        }
    }

    // ── Requests from calls ──────────────────────────────────────

    fn perform(&self, index: u32, request: CallRequest) {
        let Some(call) = self.storage.get_by_index(index) else {
            debug!(call = index, ?request, "request for unknown call dropped");
            return;
        };
        if call.is_terminal() {
            return;
        }
        let (state, substate) = call.state_get();
        let awaiting_user = call.direction() == Direction::Incoming && state == CallState::Connecting;

        match request {
            CallRequest::Answer => {
                if awaiting_user {
                    self.apply(&call, CallState::Connecting, SubState::ESTABLISHING);
                    self.sip.answer(index);
                }
            }
            CallRequest::Reject(reason) => {
                if awaiting_user {
                    call.disconnect_reason_set(DisconnectReason::Rejected);
                    self.apply(&call, CallState::Disconnecting, SubState::REJECTED);
                    self.sip.reject(index, reason);
                }
            }
            CallRequest::Hold => {
                if matches!(state, CallState::Connected | CallState::HoldRemote) {
                    let substate = substate - SubState::TRANSFER_FAILED;
                    self.apply(&call, state, substate | SubState::NEGOTIATING_HOLD);
                    self.sip.hold(index);
                }
            }
            CallRequest::Resume => {
                if matches!(state, CallState::HoldLocal | CallState::HoldBoth) {
                    let substate = substate - SubState::TRANSFER_FAILED;
                    self.apply(&call, state, substate | SubState::NEGOTIATING_RESUME);
                    self.sip.resume(index);
                }
            }
            CallRequest::Transfer(target) => {
                if state.is_established() {
                    call.transfer_status_set(TransferStatus::Pending);
                    self.apply(&call, CallState::InitTransfer, SubState::empty());
                    self.sip.transfer(index, &target);
                }
            }
            CallRequest::HangUp => {
                if state != CallState::Disconnecting {
                    call.disconnect_reason_set(DisconnectReason::LocalHangup);
                    self.apply(&call, CallState::Disconnecting, SubState::LOCAL_HANGUP);
                    self.sip.hang_up(index);
                }
            }
            CallRequest::BridgeDial(uri) => {
                if state == CallState::Connected && !call.bridge_status().is_active() {
                    self.bridge_update(&call, BridgeStatus::Dialing);
                    self.sip.bridge_dial(index, &uri);
                }
            }
            CallRequest::BridgeDisconnect => {
                if call.bridge_status().is_active() {
                    self.sip.bridge_disconnect(index);
                }
            }
            CallRequest::TextSend(text) => self.sip.text_send(index, &text),
            CallRequest::DtmfSend(digit) => self.sip.dtmf_send(index, digit),
        }
    }

    fn bridge_update(&self, call: &CallHandle, status: BridgeStatus) {
        call.bridge_status_set(status);
        self.signals.bridge_changed.emit(&BridgeNotice {
            call: Arc::clone(call),
            status,
        });
    }

    // ── Signaling events ─────────────────────────────────────────

    fn live_call(&self, index: u32) -> Option<CallHandle> {
        let call = self.storage.get_by_index(index);
        if call.is_none() {
            debug!(call = index, "signaling event for unknown call");
        }
        call
    }

    fn on_signaling(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::IncomingInvite {
                session,
                remote,
                transferable,
            } => self.on_invite(session, remote, transferable),

            SignalingEvent::Proceeding { call } => {
                let Some(call) = self.live_call(call) else { return };
                if call.state() == CallState::Connecting {
                    self.apply(&call, CallState::Connecting, SubState::WAITING_FOR_REMOTE);
                }
            }
            SignalingEvent::Answered { call } => {
                let Some(call) = self.live_call(call) else { return };
                if call.state() == CallState::Connecting {
                    self.apply(&call, CallState::Connecting, SubState::ESTABLISHING);
                }
            }
            SignalingEvent::Established {
                call,
                capabilities,
                transferable,
            } => {
                let Some(call) = self.live_call(call) else { return };
                call.capabilities_set(capabilities);
                call.transferable_set(transferable);
                if call.state() == CallState::Connecting {
                    self.apply(&call, CallState::Connected, SubState::CONFERENCING);
                }
            }
            SignalingEvent::HoldChanged {
                call,
                local,
                remote,
            } => {
                let Some(call) = self.live_call(call) else { return };
                if !call.state().is_established() {
                    return;
                }
                let (state, substate) = match (local, remote) {
                    (false, false) => (CallState::Connected, SubState::CONFERENCING),
                    (true, false) => (CallState::HoldLocal, SubState::empty()),
                    (false, true) => (CallState::HoldRemote, SubState::empty()),
                    (true, true) => (CallState::HoldBoth, SubState::empty()),
                };
                self.apply(&call, state, substate);
            }
            SignalingEvent::HoldFailed { call } => {
                let Some(call) = self.live_call(call) else { return };
                let (state, substate) = call.state_get();
                if state.is_established() {
                    warn!(call = call.index(), "hold negotiation failed");
                    let cleared = substate
                        - (SubState::NEGOTIATING_HOLD
                            | SubState::NEGOTIATING_RESUME
                            | SubState::TRANSFER_FAILED);
                    self.apply(&call, state, cleared);
                }
            }
            SignalingEvent::TransferAccepted { call } => {
                let Some(call) = self.live_call(call) else { return };
                if call.state() == CallState::InitTransfer {
                    self.apply(&call, CallState::Transferring, SubState::empty());
                }
            }
            SignalingEvent::TransferFailed { call } => {
                let Some(call) = self.live_call(call) else { return };
                if call.state().is_transferring() {
                    call.transfer_status_set(TransferStatus::Failed);
                    let back = call.pre_transfer_state();
                    let substate = if back == CallState::Connected {
                        SubState::CONFERENCING | SubState::TRANSFER_FAILED
                    } else {
                        SubState::TRANSFER_FAILED
                    };
                    self.apply(&call, back, substate);
                }
            }
            SignalingEvent::TransferCompleted { call, new_remote } => {
                let Some(call) = self.live_call(call) else { return };
                if !call.state().is_transferring() {
                    return;
                }
                call.transfer_status_set(TransferStatus::Completed);
                match new_remote {
                    Some(remote) => {
                        call.remote_set(remote);
                        self.apply(&call, CallState::Connected, SubState::CONFERENCING);
                    }
                    None => {
                        call.disconnect_reason_set(DisconnectReason::Transferred);
                        self.apply(&call, CallState::Disconnecting, SubState::REMOTE_HANGUP);
                    }
                }
            }
            SignalingEvent::RemoteHangup { call } => {
                let Some(call) = self.live_call(call) else { return };
                call.disconnect_reason_set(DisconnectReason::RemoteHangup);
                self.apply(&call, CallState::Disconnecting, SubState::REMOTE_HANGUP);
            }
            SignalingEvent::Disconnected { call, reason } => {
                let Some(call) = self.live_call(call) else { return };
                self.finish(&call, reason);
            }
            SignalingEvent::Fault {
                call: Some(index),
                description,
            } => {
                let Some(call) = self.live_call(index) else { return };
                error!(call = index, "signaling fault: {description}");
                call.disconnect_reason_set(DisconnectReason::Error);
                self.apply(&call, CallState::CriticalError, SubState::ERROR);
                self.retire(&call);
            }
            SignalingEvent::Fault {
                call: None,
                description,
            } => {
                error!("signaling stack fault: {description}");
                self.restart
                    .restart_request(RestartReason::SignalingFault(description));
            }
            SignalingEvent::TextReceived { call, text } => {
                let Some(call) = self.live_call(call) else { return };
                self.signals
                    .text_received
                    .emit(&TextNotice { call, text });
            }
            SignalingEvent::DtmfReceived { call, digit } => {
                let Some(call) = self.live_call(call) else { return };
                self.signals
                    .dtmf_received
                    .emit(&DtmfNotice { call, digit });
            }
            SignalingEvent::BridgeStateChanged { call, status } => {
                let Some(call) = self.live_call(call) else { return };
                self.bridge_update(&call, status);
            }
            SignalingEvent::RemoteInfoUpdated { call, remote } => {
                let Some(call) = self.live_call(call) else { return };
                call.remote_set(remote);
            }
            SignalingEvent::KeyFrameRequested { call } => {
                debug!(call, "key frame requested by far end");
                if let Some(video) = &self.video {
                    video.key_frame_request();
                }
            }
            SignalingEvent::PortNegotiation { call, success } => {
                let counter = if success {
                    &self.stats.port_negotiation_ok
                } else {
                    warn!(call, "port negotiation failed");
                    &self.stats.port_negotiation_failed
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn on_invite(&self, session: u64, remote: RemoteInfo, transferable: bool) {
        let policy = *self.policy.lock();
        let refusal = if !policy.allow_incoming {
            Some(RejectReason::ServiceUnavailable)
        } else if policy.auto_reject || self.storage.live_count() >= policy.max_calls {
            Some(RejectReason::Busy)
        } else {
            None
        };
        if let Some(reason) = refusal {
            info!(session, ?reason, from = %remote.phone_number, "incoming invite refused");
            self.stats.incoming_refused.fetch_add(1, Ordering::Relaxed);
            self.sip.invite_refuse(session, reason);
            return;
        }

        let call = self.new_call(Direction::Incoming, None);
        call.remote_set(remote);
        call.transferable_set(transferable);
        self.storage.add(Arc::clone(&call));
        self.sip.invite_bind(session, call.index());
        if let Some(viewer) = &self.viewer {
            viewer.pause();
        }
        self.apply(&call, CallState::Connecting, SubState::WAITING_FOR_USER);
    }
}

impl CallController for ManagerCore {
    fn call_request(&self, index: u32, request: CallRequest) {
        self.post(move |core| core.perform(index, request));
    }
}

impl SignalingHandler for ManagerCore {
    fn signaling_event(&self, event: SignalingEvent) {
        self.post(move |core| core.on_signaling(event));
    }
}

// ── ConferenceManager ────────────────────────────────────────────

/// Owns the live calls and arbitrates call policy.
pub struct ConferenceManager {
    core: Arc<ManagerCore>,
}

impl ConferenceManager {
    /// Build a stopped manager and attach it to the context's SIP stack.
    pub fn new(context: &Context, config: ConferenceConfig) -> Self {
        let core = Arc::new_cyclic(|me| ManagerCore {
            me: me.clone(),
            queue: EventQueue::new("conference"),
            storage: CallStorage::new(),
            next_index: AtomicU32::new(1),
            policy: Mutex::new(Policy {
                max_calls: config.max_calls,
                auto_reject: config.auto_reject,
                allow_incoming: config.allow_incoming_calls,
            }),
            identity: LocalIdentity {
                name: config.local_name,
                number: config.local_number,
            },
            sip: Arc::clone(&context.sip),
            video: context.video.clone(),
            viewer: context.viewer.clone(),
            restart: context.restart_handler(),
            recording: AtomicBool::new(false),
            stats: StatCounters::default(),
            signals: ConferenceSignals::default(),
            disconnect_timeout: config.disconnect_timeout,
            disconnect_guards: Mutex::new(HashMap::new()),
        });
        core.queue.set_restart_handler(context.restart_handler());
        let manager = Self { core };
        context.sip.attach(manager.signaling_sink());
        manager
    }

    pub fn start(&self) -> Result<(), VpError> {
        if !self.core.queue.start_event_loop() {
            return Err(VpError::AlreadyRunning);
        }
        info!("conference manager started");
        Ok(())
    }

    /// Hang up every live call, let the queue drain, then stop it.
    pub fn shutdown(&self) {
        for call in self.core.storage.all() {
            if let Err(e) = call.hang_up() {
                warn!(call = call.index(), "hang up during shutdown: {e}");
            }
        }
        if self.core.queue.is_running() && !self.core.queue.flush(SHUTDOWN_FLUSH) {
            warn!("conference queue did not drain before shutdown");
        }
        self.core.queue.stop_event_loop();
        info!("conference manager stopped");
    }

    pub fn queue(&self) -> &EventQueue {
        &self.core.queue
    }

    pub fn signals(&self) -> &ConferenceSignals {
        &self.core.signals
    }

    /// Handle for the SIP stack to deliver events through.
    pub fn signaling_sink(&self) -> SignalingSink {
        let handler: Weak<dyn SignalingHandler> = self.core.me.clone();
        SignalingSink::new(handler)
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.core.identity
    }

    pub fn stats(&self) -> ConferenceStats {
        self.core.stats.snapshot()
    }

    // ── Dialing ──────────────────────────────────────────────────

    /// Place a call. The returned call is already `Connecting/CALLING`;
    /// signaling progress arrives asynchronously.
    pub fn call_dial(&self, request: DialRequest) -> Result<CallHandle, VpError> {
        let (call, change) = {
            let _guard = self.core.queue.lock();
            let max = self.core.policy.lock().max_calls;
            if self.core.storage.live_count() >= max {
                return Err(VpError::TooManyCalls { max });
            }
            request.validate()?;

            let call = self.core.new_call(Direction::Outgoing, Some(request.clone()));
            self.core.storage.add(Arc::clone(&call));
            let change = call.state_apply(CallState::Connecting, SubState::CALLING);
            (call, change)
        };

        info!(call = call.index(), to = %request.dial_string, "dialing");
        let index = call.index();
        self.core.post(move |core| {
            if let Some(change) = change {
                core.publish(&change);
            }
            core.sip.dial(index, &request);
        });
        Ok(call)
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn call_object_get(&self, mask: CallStateMask) -> Option<CallHandle> {
        self.core.storage.get(mask)
    }

    pub fn call_objects_count_get(&self, mask: CallStateMask) -> usize {
        self.core.storage.count(mask)
    }

    pub fn call_get(&self, index: u32) -> Option<CallHandle> {
        self.core.storage.get_by_index(index)
    }

    pub fn head_call(&self) -> Option<CallHandle> {
        self.core.storage.head()
    }

    pub fn calls(&self) -> Vec<CallHandle> {
        self.core.storage.all()
    }

    /// Remove a terminal call. `InvalidState` for a live call.
    pub fn call_object_remove(&self, call: &CallHandle) -> Result<(), VpError> {
        let _guard = self.core.queue.lock();
        self.core.storage.remove(call)?;
        self.core.signals.call_removed.emit(call);
        Ok(())
    }

    // ── Policy ───────────────────────────────────────────────────

    pub fn auto_reject_set(&self, enabled: bool) {
        self.core.policy.lock().auto_reject = enabled;
    }

    pub fn auto_reject_get(&self) -> bool {
        self.core.policy.lock().auto_reject
    }

    pub fn max_calls_set(&self, max: usize) -> Result<(), VpError> {
        if max == 0 {
            return Err(VpError::InvalidParameter("max calls must be at least 1"));
        }
        self.core.policy.lock().max_calls = max;
        Ok(())
    }

    pub fn max_calls_get(&self) -> usize {
        self.core.policy.lock().max_calls
    }

    pub fn allow_incoming_calls_set(&self, allow: bool) {
        self.core.policy.lock().allow_incoming = allow;
    }

    pub fn allow_incoming_calls_get(&self) -> bool {
        self.core.policy.lock().allow_incoming
    }
}

impl Drop for ConferenceManager {
    fn drop(&mut self) {
        self.core.queue.stop_event_loop();
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{
        LoopbackConfig, LoopbackSipStack, MemoryPropertyStore, SimulatedVideoInput,
        SimulatedViewer, ViewerState,
    };
    use crate::platform::LoggingPlatform;
    use crate::signal::ConnectionSet;
    use std::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    /// Records requests; the test drives signaling by hand.
    #[derive(Default)]
    struct ScriptedSip {
        log: Mutex<Vec<String>>,
    }

    impl ScriptedSip {
        fn log(&self) -> Vec<String> {
            self.log.lock().clone()
        }
        fn push(&self, entry: String) {
            self.log.lock().push(entry);
        }
    }

    impl SipStack for ScriptedSip {
        fn attach(&self, _sink: SignalingSink) {}
        fn dial(&self, call: u32, request: &DialRequest) {
            self.push(format!("dial {call} {}", request.dial_string));
        }
        fn invite_bind(&self, session: u64, call: u32) {
            self.push(format!("bind {session} {call}"));
        }
        fn invite_refuse(&self, session: u64, reason: RejectReason) {
            self.push(format!("refuse {session} {reason:?}"));
        }
        fn answer(&self, call: u32) {
            self.push(format!("answer {call}"));
        }
        fn reject(&self, call: u32, reason: RejectReason) {
            self.push(format!("reject {call} {reason:?}"));
        }
        fn hold(&self, call: u32) {
            self.push(format!("hold {call}"));
        }
        fn resume(&self, call: u32) {
            self.push(format!("resume {call}"));
        }
        fn transfer(&self, call: u32, target: &str) {
            self.push(format!("transfer {call} {target}"));
        }
        fn hang_up(&self, call: u32) {
            self.push(format!("hangup {call}"));
        }
        fn bridge_dial(&self, call: u32, uri: &str) {
            self.push(format!("bridge {call} {uri}"));
        }
        fn bridge_disconnect(&self, call: u32) {
            self.push(format!("unbridge {call}"));
        }
        fn text_send(&self, call: u32, text: &str) {
            self.push(format!("text {call} {text}"));
        }
        fn dtmf_send(&self, call: u32, digit: char) {
            self.push(format!("dtmf {call} {digit}"));
        }
    }

    struct Rig {
        subscriptions: ConnectionSet,
        manager: ConferenceManager,
        sip: Arc<ScriptedSip>,
        platform: Arc<LoggingPlatform>,
        video: Arc<SimulatedVideoInput>,
        viewer: Arc<SimulatedViewer>,
    }

    impl Rig {
        fn new(config: ConferenceConfig) -> Self {
            let sip = Arc::new(ScriptedSip::default());
            let platform = LoggingPlatform::new();
            let video = Arc::new(SimulatedVideoInput::new());
            video.initialize().unwrap();
            let viewer = Arc::new(SimulatedViewer::new());
            let context = Context::new(
                platform.clone(),
                sip.clone(),
                Arc::new(MemoryPropertyStore::new()),
            )
            .with_video(video.clone())
            .with_viewer(viewer.clone());
            let manager = ConferenceManager::new(&context, config);
            manager.start().unwrap();
            Self {
                subscriptions: ConnectionSet::new(),
                manager,
                sip,
                platform,
                video,
                viewer,
            }
        }

        fn deliver(&self, event: SignalingEvent) {
            assert!(self.manager.signaling_sink().deliver(event));
        }

        fn settle(&self) {
            assert!(self.manager.queue().flush(WAIT));
        }

        fn events(&self) -> mpsc::Receiver<CallEvent> {
            let (tx, rx) = mpsc::channel();
            let tx = Mutex::new(tx);
            self.subscriptions
                .push(self.manager.signals().call_event.connect(move |n| {
                    let _ = tx.lock().send(n.event);
                }));
            rx
        }

        fn connect_outgoing(&self) -> CallHandle {
            let call = self.manager.call_dial(DialRequest::new("1234567890")).unwrap();
            self.deliver(SignalingEvent::Established {
                call: call.index(),
                capabilities: Default::default(),
                transferable: false,
            });
            self.settle();
            call
        }
    }

    #[test]
    fn dial_is_capped_by_max_calls() {
        let rig = Rig::new(ConferenceConfig::default());
        let call = rig.manager.call_dial(DialRequest::new("1234567890")).unwrap();
        rig.settle();
        assert_eq!(call.state_get(), (CallState::Connecting, SubState::CALLING));

        let second = rig.manager.call_dial(DialRequest::new("5550000"));
        assert!(matches!(second, Err(VpError::TooManyCalls { max: 1 })));
        assert_eq!(rig.manager.calls().len(), 1);
        assert_eq!(rig.sip.log(), vec!["dial 1 1234567890".to_string()]);
    }

    #[test]
    fn malformed_address_creates_nothing() {
        let rig = Rig::new(ConferenceConfig::default());
        assert!(matches!(
            rig.manager.call_dial(DialRequest::new("")),
            Err(VpError::InvalidParameter(_))
        ));
        assert!(rig.manager.calls().is_empty());
    }

    #[test]
    fn outgoing_lifecycle_emits_named_events() {
        let rig = Rig::new(ConferenceConfig::default());
        let events = rig.events();
        let call = rig.manager.call_dial(DialRequest::new("1234567890")).unwrap();
        let index = call.index();
        rig.deliver(SignalingEvent::Proceeding { call: index });
        rig.deliver(SignalingEvent::Answered { call: index });
        rig.deliver(SignalingEvent::Established {
            call: index,
            capabilities: Default::default(),
            transferable: true,
        });
        rig.settle();
        assert_eq!(call.state(), CallState::Connected);
        assert!(rig.video.is_recording());

        call.hang_up().unwrap();
        rig.settle();
        assert_eq!(call.state(), CallState::Disconnecting);
        rig.deliver(SignalingEvent::Disconnected {
            call: index,
            reason: DisconnectReason::LocalHangup,
        });
        rig.settle();

        let seen: Vec<CallEvent> = events.try_iter().collect();
        assert_eq!(
            seen,
            vec![
                CallEvent::Dialing,
                CallEvent::Ringing,
                CallEvent::Connecting,
                CallEvent::Connected,
                CallEvent::Disconnecting,
                CallEvent::Disconnected,
            ]
        );
        assert!(call.is_terminal());
        assert_eq!(call.disconnect_reason(), Some(DisconnectReason::LocalHangup));
        assert!(rig.manager.calls().is_empty());
        assert!(!rig.video.is_recording());
        assert_eq!(rig.manager.stats().calls_completed, 1);
    }

    #[test]
    fn no_state_change_after_terminal_disconnect() {
        let rig = Rig::new(ConferenceConfig::default());
        let call = rig.connect_outgoing();
        let index = call.index();

        let changes = Arc::new(Mutex::new(Vec::new()));
        let c = Arc::clone(&changes);
        let _conn = rig
            .manager
            .signals()
            .call_state_changed
            .connect(move |ch| c.lock().push((ch.call.index(), ch.new_state)));

        rig.deliver(SignalingEvent::Disconnected {
            call: index,
            reason: DisconnectReason::RemoteHangup,
        });
        rig.settle();
        let settled = changes.lock().len();
        assert_eq!(
            changes.lock().last().copied(),
            Some((index, CallState::Disconnected))
        );

        rig.deliver(SignalingEvent::Established {
            call: index,
            capabilities: Default::default(),
            transferable: false,
        });
        rig.deliver(SignalingEvent::RemoteHangup { call: index });
        call.hang_up().unwrap();
        rig.settle();
        assert_eq!(changes.lock().len(), settled);
    }

    #[test]
    fn incoming_refused_when_disallowed() {
        let rig = Rig::new(ConferenceConfig {
            allow_incoming_calls: false,
            ..ConferenceConfig::default()
        });
        rig.deliver(SignalingEvent::IncomingInvite {
            session: 42,
            remote: RemoteInfo::default(),
            transferable: false,
        });
        rig.settle();
        assert_eq!(rig.sip.log(), vec!["refuse 42 ServiceUnavailable".to_string()]);
        assert!(rig.manager.calls().is_empty());
    }

    #[test]
    fn incoming_refused_busy_on_auto_reject_or_limit() {
        let rig = Rig::new(ConferenceConfig::default());
        rig.manager.auto_reject_set(true);
        rig.deliver(SignalingEvent::IncomingInvite {
            session: 1,
            remote: RemoteInfo::default(),
            transferable: false,
        });
        rig.settle();

        rig.manager.auto_reject_set(false);
        let _call = rig.manager.call_dial(DialRequest::new("1234567890")).unwrap();
        rig.deliver(SignalingEvent::IncomingInvite {
            session: 2,
            remote: RemoteInfo::default(),
            transferable: false,
        });
        rig.settle();

        let log = rig.sip.log();
        assert!(log.contains(&"refuse 1 Busy".to_string()));
        assert!(log.contains(&"refuse 2 Busy".to_string()));
        assert_eq!(rig.manager.calls().len(), 1);
        assert_eq!(rig.manager.stats().incoming_refused, 2);
    }

    #[test]
    fn incoming_call_answered() {
        let rig = Rig::new(ConferenceConfig::default());
        rig.viewer.play();
        let events = rig.events();
        rig.deliver(SignalingEvent::IncomingInvite {
            session: 7,
            remote: RemoteInfo {
                display_name: "Ada".into(),
                phone_number: "5550101".into(),
                ..RemoteInfo::default()
            },
            transferable: false,
        });
        rig.settle();

        let call = rig.manager.head_call().expect("call created");
        assert_eq!(call.direction(), Direction::Incoming);
        assert_eq!(call.remote().display_name, "Ada");
        assert_eq!(rig.viewer.state(), ViewerState::Paused);

        call.answer().unwrap();
        rig.settle();
        rig.deliver(SignalingEvent::Established {
            call: call.index(),
            capabilities: Default::default(),
            transferable: false,
        });
        rig.settle();

        assert_eq!(call.state(), CallState::Connected);
        let seen: Vec<CallEvent> = events.try_iter().collect();
        assert_eq!(
            seen,
            vec![
                CallEvent::Incoming,
                CallEvent::Connecting,
                CallEvent::Connected
            ]
        );
        let log = rig.sip.log();
        assert_eq!(log[0], format!("bind 7 {}", call.index()));
        assert_eq!(log[1], format!("answer {}", call.index()));
    }

    #[test]
    fn failed_transfer_returns_to_previous_state() {
        let rig = Rig::new(ConferenceConfig::default());
        let call = rig.connect_outgoing();
        call.transferable_set(true);
        let events = rig.events();

        call.transfer("5559999").unwrap();
        rig.settle();
        assert_eq!(call.state(), CallState::InitTransfer);
        rig.deliver(SignalingEvent::TransferAccepted { call: call.index() });
        rig.deliver(SignalingEvent::TransferFailed { call: call.index() });
        rig.settle();

        assert_eq!(
            call.state_get(),
            (
                CallState::Connected,
                SubState::CONFERENCING | SubState::TRANSFER_FAILED
            )
        );
        assert_eq!(call.transfer_status(), TransferStatus::Failed);
        assert!(events.try_iter().any(|e| e == CallEvent::TransferFailed));
    }

    #[test]
    fn hold_after_failed_transfer_reports_no_second_failure() {
        let rig = Rig::new(ConferenceConfig::default());
        let call = rig.connect_outgoing();
        call.transferable_set(true);
        call.transfer("5559999").unwrap();
        rig.settle();
        rig.deliver(SignalingEvent::TransferAccepted { call: call.index() });
        rig.deliver(SignalingEvent::TransferFailed { call: call.index() });
        rig.settle();

        let events = rig.events();
        call.hold().unwrap();
        rig.settle();
        assert_eq!(
            call.state_get(),
            (
                CallState::Connected,
                SubState::CONFERENCING | SubState::NEGOTIATING_HOLD
            )
        );
        rig.deliver(SignalingEvent::HoldChanged {
            call: call.index(),
            local: true,
            remote: false,
        });
        rig.settle();

        let seen: Vec<CallEvent> = events.try_iter().collect();
        assert_eq!(seen, vec![CallEvent::HeldLocal]);
    }

    #[test]
    fn silent_stack_still_ends_hung_up_call() {
        let rig = Rig::new(ConferenceConfig {
            disconnect_timeout: Duration::from_millis(50),
            ..ConferenceConfig::default()
        });
        let call = rig.connect_outgoing();
        let events = rig.events();

        call.hang_up().unwrap();
        rig.settle();
        assert_eq!(call.state(), CallState::Disconnecting);

        let deadline = std::time::Instant::now() + WAIT;
        while !call.is_terminal() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        rig.settle();
        assert_eq!(call.state(), CallState::Disconnected);
        assert_eq!(call.disconnect_reason(), Some(DisconnectReason::LocalHangup));
        assert!(rig.manager.calls().is_empty());
        let seen: Vec<CallEvent> = events.try_iter().collect();
        assert_eq!(seen, vec![CallEvent::Disconnecting, CallEvent::Disconnected]);

        assert!(rig.manager.call_dial(DialRequest::new("5550000")).is_ok());
    }

    #[test]
    fn confirmed_disconnect_disarms_the_guard() {
        let rig = Rig::new(ConferenceConfig {
            disconnect_timeout: Duration::from_millis(30),
            ..ConferenceConfig::default()
        });
        let call = rig.connect_outgoing();
        call.hang_up().unwrap();
        rig.settle();
        rig.deliver(SignalingEvent::Disconnected {
            call: call.index(),
            reason: DisconnectReason::RemoteHangup,
        });
        rig.settle();
        assert_eq!(rig.manager.queue().timer_count(), 0);
        assert_eq!(call.disconnect_reason(), Some(DisconnectReason::LocalHangup));
    }

    #[test]
    fn hold_round_trip() {
        let rig = Rig::new(ConferenceConfig::default());
        let call = rig.connect_outgoing();
        let index = call.index();

        call.hold().unwrap();
        rig.settle();
        assert!(call.substate().contains(SubState::NEGOTIATING_HOLD));
        rig.deliver(SignalingEvent::HoldChanged {
            call: index,
            local: true,
            remote: false,
        });
        rig.settle();
        assert_eq!(call.state(), CallState::HoldLocal);

        call.resume().unwrap();
        rig.deliver(SignalingEvent::HoldChanged {
            call: index,
            local: false,
            remote: false,
        });
        rig.settle();
        assert_eq!(call.state_get(), (CallState::Connected, SubState::CONFERENCING));
    }

    #[test]
    fn stack_fault_requests_restart() {
        let rig = Rig::new(ConferenceConfig::default());
        rig.deliver(SignalingEvent::Fault {
            call: None,
            description: "transport lost".into(),
        });
        rig.settle();
        assert_eq!(
            rig.platform.restart_requests(),
            vec![RestartReason::SignalingFault("transport lost".into())]
        );
    }

    #[test]
    fn call_fault_is_critical_and_retired() {
        let rig = Rig::new(ConferenceConfig::default());
        let call = rig.connect_outgoing();
        rig.deliver(SignalingEvent::Fault {
            call: Some(call.index()),
            description: "bad sdp".into(),
        });
        rig.settle();
        assert_eq!(call.state(), CallState::CriticalError);
        assert!(rig.manager.calls().is_empty());
    }

    #[test]
    fn remove_live_call_is_refused() {
        let rig = Rig::new(ConferenceConfig::default());
        let call = rig.manager.call_dial(DialRequest::new("1234567890")).unwrap();
        rig.settle();
        assert!(matches!(
            rig.manager.call_object_remove(&call),
            Err(VpError::InvalidState { .. })
        ));
        assert_eq!(rig.manager.call_objects_count_get(CallStateMask::LIVE), 1);
    }

    #[test]
    fn key_frame_requests_reach_video() {
        let rig = Rig::new(ConferenceConfig::default());
        rig.deliver(SignalingEvent::KeyFrameRequested { call: 1 });
        rig.settle();
        assert_eq!(rig.video.key_frames_requested(), 1);
    }

    #[test]
    fn end_to_end_with_loopback() {
        let loopback = Arc::new(LoopbackSipStack::new(LoopbackConfig {
            answer_delay: Duration::from_millis(10),
            ..LoopbackConfig::default()
        }));
        loopback.start();
        let context = Context::new(
            LoggingPlatform::new(),
            loopback.clone(),
            Arc::new(MemoryPropertyStore::new()),
        );
        let manager = ConferenceManager::new(&context, ConferenceConfig::default());
        manager.start().unwrap();

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let _c = manager.signals().call_event.connect(move |n| {
            let _ = tx.lock().send(n.event);
        });

        let call = manager.call_dial(DialRequest::new("1234567890")).unwrap();
        loop {
            match rx.recv_timeout(WAIT).unwrap() {
                CallEvent::Connected => break,
                _ => continue,
            }
        }
        assert_eq!(manager.stats().port_negotiation_ok, 1);

        call.hang_up().unwrap();
        loop {
            if rx.recv_timeout(WAIT).unwrap() == CallEvent::Disconnected {
                break;
            }
        }
        manager.shutdown();
        loopback.stop();
    }
}
