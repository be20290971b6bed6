//! Per-call state machine entity.
//!
//! A [`Call`] is owned by the conference manager. Its public operations
//! validate against the current state and then hand a [`CallRequest`] to
//! the manager, which performs it on its own queue. Completion is observed
//! through state-change notifications, never through the return value.

pub mod classify;
pub mod state;

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::VpError;

pub use classify::{CallEvent, classify};
pub use state::{
    BridgeStatus, CallState, CallStateMask, Direction, DisconnectReason, RejectReason, SubState,
    TransferStatus,
};

/// Shared handle to a live call.
pub type CallHandle = Arc<Call>;

const MAX_DIAL_STRING_LEN: usize = 256;
const MAX_PHONE_DIGITS: usize = 32;
const MAX_TEXT_LEN: usize = 1024;

// ── Dial request ─────────────────────────────────────────────────

/// How the dial string is to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DialMethod {
    /// Free-form address (URI, IP or number).
    #[default]
    DialString,
    DirectPhoneNumber,
    RelayPhoneNumber,
    RelayWithVco,
}

impl DialMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            DialMethod::DialString => "DialString",
            DialMethod::DirectPhoneNumber => "Direct",
            DialMethod::RelayPhoneNumber => "Relay",
            DialMethod::RelayWithVco => "RelayVco",
        }
    }

    fn is_phone_number(self) -> bool {
        !matches!(self, DialMethod::DialString)
    }
}

impl std::str::FromStr for DialMethod {
    type Err = VpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "dialstring" => Ok(DialMethod::DialString),
            "direct" => Ok(DialMethod::DirectPhoneNumber),
            "relay" => Ok(DialMethod::RelayPhoneNumber),
            "relayvco" => Ok(DialMethod::RelayWithVco),
            other => Err(VpError::UnknownVariant {
                type_name: "DialMethod",
                value: other.to_string(),
            }),
        }
    }
}

/// Everything the caller supplies when placing a call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DialRequest {
    pub method: DialMethod,
    pub dial_string: String,
    /// What the user originally typed, before normalization.
    pub original_string: Option<String>,
    pub from_name_override: Option<String>,
    pub call_list_name: Option<String>,
}

impl DialRequest {
    pub fn new(dial_string: impl Into<String>) -> Self {
        Self {
            dial_string: dial_string.into(),
            ..Self::default()
        }
    }

    pub fn with_method(mut self, method: DialMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_original(mut self, original: impl Into<String>) -> Self {
        self.original_string = Some(original.into());
        self
    }

    pub fn with_from_name(mut self, name: impl Into<String>) -> Self {
        self.from_name_override = Some(name.into());
        self
    }

    pub fn with_call_list_name(mut self, name: impl Into<String>) -> Self {
        self.call_list_name = Some(name.into());
        self
    }

    /// Reject empty or malformed addresses.
    pub fn validate(&self) -> Result<(), VpError> {
        let address = self.dial_string.trim();
        if address.is_empty() {
            return Err(VpError::InvalidParameter("empty dial string"));
        }
        if address.len() > MAX_DIAL_STRING_LEN {
            return Err(VpError::InvalidParameter("dial string too long"));
        }
        if address.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(VpError::InvalidParameter("dial string contains whitespace"));
        }

        if self.method.is_phone_number() {
            let digits = address.strip_prefix('+').unwrap_or(address);
            let mut count = 0;
            for c in digits.chars() {
                match c {
                    '0'..='9' => count += 1,
                    '-' | '(' | ')' | '.' => {}
                    _ => return Err(VpError::InvalidParameter("phone number contains non-digits")),
                }
            }
            if count == 0 || count > MAX_PHONE_DIGITS {
                return Err(VpError::InvalidParameter("phone number length"));
            }
        }
        Ok(())
    }
}

// ── Call metadata ────────────────────────────────────────────────

/// What is known about the far end.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteInfo {
    pub display_name: String,
    pub phone_number: String,
    pub product: String,
    pub dial_string: String,
}

/// Media features negotiated for the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaCapabilities {
    pub text: bool,
    pub dtmf: bool,
    pub vco: bool,
}

/// A state transition, as delivered to `call_state_changed` subscribers.
#[derive(Clone)]
pub struct CallStateChange {
    pub call: CallHandle,
    pub prev_state: CallState,
    pub prev_substate: SubState,
    pub new_state: CallState,
    pub new_substate: SubState,
}

impl fmt::Debug for CallStateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallStateChange")
            .field("call", &self.call.index())
            .field("prev", &format_args!("{}/{}", self.prev_state, self.prev_substate))
            .field("new", &format_args!("{}/{}", self.new_state, self.new_substate))
            .finish()
    }
}

// ── Requests to the owning manager ───────────────────────────────

/// An operation validated by a [`Call`] and executed by its manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallRequest {
    Answer,
    Reject(RejectReason),
    Hold,
    Resume,
    Transfer(String),
    HangUp,
    BridgeDial(String),
    BridgeDisconnect,
    TextSend(String),
    DtmfSend(char),
}

/// Executes call requests on the owning component's queue.
pub trait CallController: Send + Sync {
    fn call_request(&self, index: u32, request: CallRequest);
}

// ── Call ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct CallData {
    state: CallState,
    substate: SubState,
    pre_transfer: Option<CallState>,
    remote: RemoteInfo,
    capabilities: MediaCapabilities,
    transferable: bool,
    bridge: BridgeStatus,
    transfer: TransferStatus,
    connected_at: Option<Instant>,
    disconnected_at: Option<Instant>,
    disconnect_reason: Option<DisconnectReason>,
    hangup_requested: bool,
}

/// One call and its state machine.
pub struct Call {
    index: u32,
    direction: Direction,
    dial: Option<DialRequest>,
    created_at: Instant,
    data: Mutex<CallData>,
    controller: Weak<dyn CallController>,
}

impl Call {
    pub(crate) fn new(
        index: u32,
        direction: Direction,
        dial: Option<DialRequest>,
        controller: Weak<dyn CallController>,
    ) -> Self {
        let remote = RemoteInfo {
            dial_string: dial
                .as_ref()
                .map(|d| d.dial_string.clone())
                .unwrap_or_default(),
            ..RemoteInfo::default()
        };
        Self {
            index,
            direction,
            dial,
            created_at: Instant::now(),
            data: Mutex::new(CallData {
                state: CallState::Idle,
                substate: SubState::empty(),
                pre_transfer: None,
                remote,
                capabilities: MediaCapabilities::default(),
                transferable: false,
                bridge: BridgeStatus::None,
                transfer: TransferStatus::None,
                connected_at: None,
                disconnected_at: None,
                disconnect_reason: None,
                hangup_requested: false,
            }),
            controller,
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn dial_request(&self) -> Option<&DialRequest> {
        self.dial.as_ref()
    }

    pub fn state(&self) -> CallState {
        self.data.lock().state
    }

    pub fn substate(&self) -> SubState {
        self.data.lock().substate
    }

    /// State and substate read atomically.
    pub fn state_get(&self) -> (CallState, SubState) {
        let data = self.data.lock();
        (data.state, data.substate)
    }

    /// `Disconnected` with an empty substate, or `CriticalError`.
    pub fn is_terminal(&self) -> bool {
        let data = self.data.lock();
        Self::terminal(data.state, data.substate)
    }

    fn terminal(state: CallState, substate: SubState) -> bool {
        (state == CallState::Disconnected && substate.is_empty())
            || state == CallState::CriticalError
    }

    pub fn remote(&self) -> RemoteInfo {
        self.data.lock().remote.clone()
    }

    pub fn capabilities(&self) -> MediaCapabilities {
        self.data.lock().capabilities
    }

    pub fn is_transferable(&self) -> bool {
        self.data.lock().transferable
    }

    pub fn bridge_status(&self) -> BridgeStatus {
        self.data.lock().bridge
    }

    pub fn transfer_status(&self) -> TransferStatus {
        self.data.lock().transfer
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.data.lock().disconnect_reason
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn connected_at(&self) -> Option<Instant> {
        self.data.lock().connected_at
    }

    pub fn disconnected_at(&self) -> Option<Instant> {
        self.data.lock().disconnected_at
    }

    /// Time spent connected so far, or in total once disconnected.
    pub fn duration(&self) -> Duration {
        let data = self.data.lock();
        match (data.connected_at, data.disconnected_at) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    // ── Operations ───────────────────────────────────────────────

    /// Accept an incoming call. A no-op unless it is still ringing here.
    pub fn answer(&self) -> Result<(), VpError> {
        if !self.awaiting_user() {
            debug!(call = self.index, "answer ignored in current state");
            return Ok(());
        }
        self.submit(CallRequest::Answer)
    }

    /// Decline an incoming call. A no-op unless it is still ringing here.
    pub fn reject(&self, reason: RejectReason) -> Result<(), VpError> {
        if !self.awaiting_user() {
            debug!(call = self.index, "reject ignored in current state");
            return Ok(());
        }
        self.submit(CallRequest::Reject(reason))
    }

    fn awaiting_user(&self) -> bool {
        self.direction == Direction::Incoming && self.state() == CallState::Connecting
    }

    pub fn hold(&self) -> Result<(), VpError> {
        let state = self.state();
        if !matches!(state, CallState::Connected | CallState::HoldRemote) {
            return Err(VpError::invalid_state("hold", state));
        }
        self.submit(CallRequest::Hold)
    }

    pub fn resume(&self) -> Result<(), VpError> {
        let state = self.state();
        if !matches!(state, CallState::HoldLocal | CallState::HoldBoth) {
            return Err(VpError::invalid_state("resume", state));
        }
        self.submit(CallRequest::Resume)
    }

    /// Blind transfer to `dial_string`.
    pub fn transfer(&self, dial_string: &str) -> Result<(), VpError> {
        let (state, transferable) = {
            let data = self.data.lock();
            (data.state, data.transferable)
        };
        if !transferable && self.direction != Direction::Incoming {
            return Err(VpError::NotTransferable);
        }
        let target = dial_string.trim();
        if target.is_empty() {
            return Err(VpError::InvalidParameter("empty transfer target"));
        }
        if !state.is_established() {
            return Err(VpError::invalid_state("transfer", state));
        }
        self.submit(CallRequest::Transfer(target.to_string()))
    }

    /// End the call. Repeated calls, and calls after teardown, are no-ops.
    pub fn hang_up(&self) -> Result<(), VpError> {
        {
            let mut data = self.data.lock();
            if data.hangup_requested
                || Self::terminal(data.state, data.substate)
                || data.state == CallState::Disconnecting
            {
                return Ok(());
            }
            data.hangup_requested = true;
        }
        let submitted = self.submit(CallRequest::HangUp);
        if submitted.is_err() {
            self.data.lock().hangup_requested = false;
        }
        submitted
    }

    /// Merge an audio-only party into the call.
    pub fn bridge_dial(&self, uri: &str) -> Result<(), VpError> {
        let (state, bridge) = {
            let data = self.data.lock();
            (data.state, data.bridge)
        };
        if uri.trim().is_empty() {
            return Err(VpError::InvalidParameter("empty bridge uri"));
        }
        if state != CallState::Connected {
            return Err(VpError::invalid_state("bridge dial", state));
        }
        if bridge.is_active() {
            return Err(VpError::invalid_state("bridge dial", bridge.as_str()));
        }
        self.submit(CallRequest::BridgeDial(uri.trim().to_string()))
    }

    pub fn bridge_disconnect(&self) -> Result<(), VpError> {
        let bridge = self.bridge_status();
        if !bridge.is_active() {
            return Err(VpError::invalid_state("bridge disconnect", bridge.as_str()));
        }
        self.submit(CallRequest::BridgeDisconnect)
    }

    /// Send real-time text. Requires negotiated text support.
    pub fn text_send(&self, text: &str) -> Result<(), VpError> {
        let (state, caps) = {
            let data = self.data.lock();
            (data.state, data.capabilities)
        };
        if !caps.text {
            return Err(VpError::NotSupported("text"));
        }
        if text.is_empty() || text.len() > MAX_TEXT_LEN {
            return Err(VpError::InvalidParameter("text length"));
        }
        if state != CallState::Connected {
            return Err(VpError::invalid_state("text send", state));
        }
        self.submit(CallRequest::TextSend(text.to_string()))
    }

    /// Send one DTMF digit (`0-9`, `*`, `#`, `A-D`).
    pub fn dtmf_send(&self, digit: char) -> Result<(), VpError> {
        let (state, caps) = {
            let data = self.data.lock();
            (data.state, data.capabilities)
        };
        if !caps.dtmf {
            return Err(VpError::NotSupported("dtmf"));
        }
        if !is_dtmf_digit(digit) {
            return Err(VpError::InvalidParameter("dtmf digit"));
        }
        if state != CallState::Connected {
            return Err(VpError::invalid_state("dtmf send", state));
        }
        self.submit(CallRequest::DtmfSend(digit.to_ascii_uppercase()))
    }

    fn submit(&self, request: CallRequest) -> Result<(), VpError> {
        let controller = self.controller.upgrade().ok_or(VpError::ChannelClosed)?;
        controller.call_request(self.index, request);
        Ok(())
    }

    // ── Manager-side mutation ────────────────────────────────────

    /// Apply a transition. Returns `None` when the table forbids it or the
    /// call is already terminal; no notification may follow in that case.
    pub(crate) fn state_apply(
        self: &Arc<Self>,
        state: CallState,
        substate: SubState,
    ) -> Option<CallStateChange> {
        let mut data = self.data.lock();
        let (prev_state, prev_substate) = (data.state, data.substate);
        if Self::terminal(prev_state, prev_substate) || !prev_state.allows(state) {
            debug!(
                call = self.index,
                "transition {prev_state}/{prev_substate} -> {state}/{substate} refused"
            );
            return None;
        }
        if prev_state == state && prev_substate == substate {
            return None;
        }

        if state.is_transferring() && !prev_state.is_transferring() {
            data.pre_transfer = Some(prev_state);
        }
        if state == CallState::Connected && data.connected_at.is_none() {
            data.connected_at = Some(Instant::now());
        }
        if Self::terminal(state, substate) {
            data.disconnected_at = Some(Instant::now());
        }
        data.state = state;
        data.substate = substate;
        drop(data);

        Some(CallStateChange {
            call: Arc::clone(self),
            prev_state,
            prev_substate,
            new_state: state,
            new_substate: substate,
        })
    }

    /// The state a failed transfer returns to.
    pub(crate) fn pre_transfer_state(&self) -> CallState {
        self.data.lock().pre_transfer.unwrap_or(CallState::Connected)
    }

    pub(crate) fn remote_set(&self, remote: RemoteInfo) {
        self.data.lock().remote = remote;
    }

    pub(crate) fn capabilities_set(&self, caps: MediaCapabilities) {
        self.data.lock().capabilities = caps;
    }

    pub(crate) fn transferable_set(&self, transferable: bool) {
        self.data.lock().transferable = transferable;
    }

    pub(crate) fn bridge_status_set(&self, status: BridgeStatus) {
        self.data.lock().bridge = status;
    }

    pub(crate) fn transfer_status_set(&self, status: TransferStatus) {
        self.data.lock().transfer = status;
    }

    /// First reason wins.
    pub(crate) fn disconnect_reason_set(&self, reason: DisconnectReason) {
        self.data.lock().disconnect_reason.get_or_insert(reason);
    }

    pub(crate) fn hangup_requested(&self) -> bool {
        self.data.lock().hangup_requested
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.lock();
        f.debug_struct("Call")
            .field("index", &self.index)
            .field("direction", &self.direction)
            .field("state", &data.state)
            .field("substate", &data.substate)
            .finish()
    }
}

pub fn is_dtmf_digit(c: char) -> bool {
    matches!(c.to_ascii_uppercase(), '0'..='9' | '*' | '#' | 'A'..='D')
}

// ── Tests ────────────────────────────────────────────────────────
