//! Signaling facade consumed by the conference manager.
//!
//! The manager drives the stack through [`SipStack`]; the stack reports
//! back through the [`SignalingSink`] it was attached to. Every request is
//! fire-and-forget: outcomes arrive later as [`SignalingEvent`]s.

use std::fmt;
use std::sync::Weak;

use crate::call::{
    BridgeStatus, DialRequest, DisconnectReason, MediaCapabilities, RejectReason, RemoteInfo,
};

/// Events reported by the signaling layer. Calls are identified by the
/// manager-assigned call index; unbound invites by a stack session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    /// A new inbound invite awaiting `invite_bind` or `invite_refuse`.
    IncomingInvite {
        session: u64,
        remote: RemoteInfo,
        transferable: bool,
    },
    /// The far end is alerting.
    Proceeding { call: u32 },
    /// The invite was accepted; media negotiation under way.
    Answered { call: u32 },
    /// Media negotiated; the session is up.
    Established {
        call: u32,
        capabilities: MediaCapabilities,
        transferable: bool,
    },
    /// New hold status after a local or remote hold/resume.
    HoldChanged { call: u32, local: bool, remote: bool },
    HoldFailed { call: u32 },
    TransferAccepted { call: u32 },
    TransferFailed { call: u32 },
    /// The transfer finished. `Some` when this leg now talks to the new
    /// party, `None` when this leg is released.
    TransferCompleted {
        call: u32,
        new_remote: Option<RemoteInfo>,
    },
    RemoteHangup { call: u32 },
    /// The dialog is gone.
    Disconnected { call: u32, reason: DisconnectReason },
    /// An unrecoverable fault; `None` means the whole stack.
    Fault {
        call: Option<u32>,
        description: String,
    },
    TextReceived { call: u32, text: String },
    DtmfReceived { call: u32, digit: char },
    BridgeStateChanged { call: u32, status: BridgeStatus },
    RemoteInfoUpdated { call: u32, remote: RemoteInfo },
    KeyFrameRequested { call: u32 },
    PortNegotiation { call: u32, success: bool },
}

/// Receiver side of signaling events.
pub trait SignalingHandler: Send + Sync {
    fn signaling_event(&self, event: SignalingEvent);
}

/// Thread-safe handle through which a stack delivers events.
///
/// Holds only a weak reference, so a stack never keeps its manager alive.
#[derive(Clone)]
pub struct SignalingSink {
    target: Weak<dyn SignalingHandler>,
}

impl SignalingSink {
    pub fn new(target: Weak<dyn SignalingHandler>) -> Self {
        Self { target }
    }

    /// Deliver `event`. Returns `false` once the receiver is gone.
    pub fn deliver(&self, event: SignalingEvent) -> bool {
        match self.target.upgrade() {
            Some(target) => {
                target.signaling_event(event);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for SignalingSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalingSink")
            .field("alive", &(self.target.strong_count() > 0))
            .finish()
    }
}

/// Operations the manager asks of the signaling stack.
///
/// Implementations must eventually report `Disconnected` for every call
/// they were asked to hang up or reject.
pub trait SipStack: Send + Sync {
    /// Route future events to `sink`.
    fn attach(&self, sink: SignalingSink);

    fn dial(&self, call: u32, request: &DialRequest);
    /// Associate an accepted invite with the call created for it.
    fn invite_bind(&self, session: u64, call: u32);
    /// Refuse an invite before any call exists.
    fn invite_refuse(&self, session: u64, reason: RejectReason);
    fn answer(&self, call: u32);
    fn reject(&self, call: u32, reason: RejectReason);
    fn hold(&self, call: u32);
    fn resume(&self, call: u32);
    fn transfer(&self, call: u32, target: &str);
    fn hang_up(&self, call: u32);
    fn bridge_dial(&self, call: u32, uri: &str);
    fn bridge_disconnect(&self, call: u32);
    fn text_send(&self, call: u32, text: &str);
    fn dtmf_send(&self, call: u32, digit: char);
}
