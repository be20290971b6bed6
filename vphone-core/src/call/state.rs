//! Call state space: primary state, substate refinement and the
//! transition table.
//!
//! ```text
//!  Idle ──► Connecting ──► Connected ◄──► HoldLocal / HoldRemote / HoldBoth
//!               │              │                    │
//!               │              └──► InitTransfer ──► Transferring ──┐
//!               │                        │ (failure: back to pre-transfer state)
//!               ▼                        ▼                         ▼
//!          Disconnecting ────────► Disconnected (empty substate = terminal)
//!
//!  any ──► CriticalError (terminal)
//! ```

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;

use crate::error::VpError;

// ── CallState ────────────────────────────────────────────────────

/// Primary state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallState {
    #[default]
    Idle,
    Connecting,
    Connected,
    HoldLocal,
    HoldRemote,
    HoldBoth,
    InitTransfer,
    Transferring,
    Disconnecting,
    Disconnected,
    CriticalError,
    Unknown,
}

impl CallState {
    pub const ALL: [CallState; 12] = [
        CallState::Idle,
        CallState::Connecting,
        CallState::Connected,
        CallState::HoldLocal,
        CallState::HoldRemote,
        CallState::HoldBoth,
        CallState::InitTransfer,
        CallState::Transferring,
        CallState::Disconnecting,
        CallState::Disconnected,
        CallState::CriticalError,
        CallState::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CallState::Idle => "Idle",
            CallState::Connecting => "Connecting",
            CallState::Connected => "Connected",
            CallState::HoldLocal => "HoldLocal",
            CallState::HoldRemote => "HoldRemote",
            CallState::HoldBoth => "HoldBoth",
            CallState::InitTransfer => "InitTransfer",
            CallState::Transferring => "Transferring",
            CallState::Disconnecting => "Disconnecting",
            CallState::Disconnected => "Disconnected",
            CallState::CriticalError => "CriticalError",
            CallState::Unknown => "Unknown",
        }
    }

    pub fn is_held(self) -> bool {
        matches!(
            self,
            CallState::HoldLocal | CallState::HoldRemote | CallState::HoldBoth
        )
    }

    /// Connected or on hold: media session established.
    pub fn is_established(self) -> bool {
        self == CallState::Connected || self.is_held()
    }

    pub fn is_transferring(self) -> bool {
        matches!(self, CallState::InitTransfer | CallState::Transferring)
    }

    /// Whether the table allows moving from `self` to `next`.
    ///
    /// Repeating the current state (with a new substate) is always allowed
    /// for non-terminal states; the terminal check lives on the call,
    /// since `Disconnected` is only terminal with an empty substate.
    pub fn allows(self, next: CallState) -> bool {
        use CallState::*;
        if next == Idle || next == Unknown {
            return false;
        }
        if self == CriticalError {
            return false;
        }
        if self == next || next == CriticalError {
            return true;
        }
        match self {
            Idle => matches!(next, Connecting | Disconnecting | Disconnected),
            Connecting => matches!(next, Connected | Disconnecting | Disconnected),
            Connected | HoldLocal | HoldRemote | HoldBoth => matches!(
                next,
                Connected
                    | HoldLocal
                    | HoldRemote
                    | HoldBoth
                    | InitTransfer
                    | Disconnecting
                    | Disconnected
            ),
            InitTransfer => matches!(
                next,
                Transferring
                    | Connected
                    | HoldLocal
                    | HoldRemote
                    | HoldBoth
                    | Disconnecting
                    | Disconnected
            ),
            Transferring => matches!(
                next,
                Connected | HoldLocal | HoldRemote | HoldBoth | Disconnecting | Disconnected
            ),
            Disconnecting => next == Disconnected,
            Disconnected => false,
            Unknown => true,
            CriticalError => false,
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallState {
    type Err = VpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CallState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| VpError::UnknownVariant {
                type_name: "CallState",
                value: s.to_string(),
            })
    }
}

// ── CallStateMask ────────────────────────────────────────────────

bitflags! {
    /// A set of [`CallState`]s used for storage queries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CallStateMask: u16 {
        const IDLE           = 1 << 0;
        const CONNECTING     = 1 << 1;
        const CONNECTED      = 1 << 2;
        const HOLD_LOCAL     = 1 << 3;
        const HOLD_REMOTE    = 1 << 4;
        const HOLD_BOTH      = 1 << 5;
        const INIT_TRANSFER  = 1 << 6;
        const TRANSFERRING   = 1 << 7;
        const DISCONNECTING  = 1 << 8;
        const DISCONNECTED   = 1 << 9;
        const CRITICAL_ERROR = 1 << 10;
        const UNKNOWN        = 1 << 11;

        const HOLD = Self::HOLD_LOCAL.bits() | Self::HOLD_REMOTE.bits() | Self::HOLD_BOTH.bits();
        const ESTABLISHED = Self::CONNECTED.bits() | Self::HOLD.bits();
        const TRANSFER = Self::INIT_TRANSFER.bits() | Self::TRANSFERRING.bits();
        /// Everything that still occupies a call slot.
        const LIVE = Self::IDLE.bits()
            | Self::CONNECTING.bits()
            | Self::ESTABLISHED.bits()
            | Self::TRANSFER.bits()
            | Self::DISCONNECTING.bits()
            | Self::UNKNOWN.bits();
    }
}

impl CallStateMask {
    pub fn matches(self, state: CallState) -> bool {
        self.contains(CallStateMask::from(state))
    }
}

impl From<CallState> for CallStateMask {
    fn from(state: CallState) -> Self {
        match state {
            CallState::Idle => CallStateMask::IDLE,
            CallState::Connecting => CallStateMask::CONNECTING,
            CallState::Connected => CallStateMask::CONNECTED,
            CallState::HoldLocal => CallStateMask::HOLD_LOCAL,
            CallState::HoldRemote => CallStateMask::HOLD_REMOTE,
            CallState::HoldBoth => CallStateMask::HOLD_BOTH,
            CallState::InitTransfer => CallStateMask::INIT_TRANSFER,
            CallState::Transferring => CallStateMask::TRANSFERRING,
            CallState::Disconnecting => CallStateMask::DISCONNECTING,
            CallState::Disconnected => CallStateMask::DISCONNECTED,
            CallState::CriticalError => CallStateMask::CRITICAL_ERROR,
            CallState::Unknown => CallStateMask::UNKNOWN,
        }
    }
}

// ── SubState ─────────────────────────────────────────────────────

bitflags! {
    /// Refinement of the primary state. Only meaningful relative to it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SubState: u16 {
        const CALLING            = 1 << 0;
        const RESOLVING_NAME     = 1 << 1;
        const WAITING_FOR_USER   = 1 << 2;
        const WAITING_FOR_REMOTE = 1 << 3;
        const ESTABLISHING       = 1 << 4;
        const CONFERENCING       = 1 << 5;
        const NEGOTIATING_HOLD   = 1 << 6;
        const NEGOTIATING_RESUME = 1 << 7;
        const LOCAL_HANGUP       = 1 << 8;
        const REMOTE_HANGUP      = 1 << 9;
        const REJECTED           = 1 << 10;
        const ERROR              = 1 << 11;
        const TRANSFER_FAILED    = 1 << 12;
    }
}

impl fmt::Display for SubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        bitflags::parser::to_writer(self, f)
    }
}

// ── Direction ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    Incoming,
    Outgoing,
    #[default]
    Unknown,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Incoming => "Incoming",
            Direction::Outgoing => "Outgoing",
            Direction::Unknown => "Unknown",
        })
    }
}

// ── DisconnectReason ─────────────────────────────────────────────

/// Why a call ended. `code()` is the result code carried by
/// `CallTerminated` notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    LocalHangup,
    RemoteHangup,
    Rejected,
    Busy,
    Unreachable,
    NotAnswered,
    Transferred,
    Error,
}

impl DisconnectReason {
    pub fn code(self) -> u32 {
        match self {
            DisconnectReason::LocalHangup => 0,
            DisconnectReason::RemoteHangup => 1,
            DisconnectReason::Rejected => 2,
            DisconnectReason::Busy => 3,
            DisconnectReason::Unreachable => 4,
            DisconnectReason::NotAnswered => 5,
            DisconnectReason::Transferred => 6,
            DisconnectReason::Error => 99,
        }
    }

    /// The substate recorded while disconnecting for this reason.
    pub fn substate(self) -> SubState {
        match self {
            DisconnectReason::LocalHangup => SubState::LOCAL_HANGUP,
            DisconnectReason::RemoteHangup | DisconnectReason::Transferred => {
                SubState::REMOTE_HANGUP
            }
            DisconnectReason::Rejected | DisconnectReason::Busy => SubState::REJECTED,
            DisconnectReason::Unreachable
            | DisconnectReason::NotAnswered
            | DisconnectReason::Error => SubState::ERROR,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::LocalHangup => "local hangup",
            DisconnectReason::RemoteHangup => "remote hangup",
            DisconnectReason::Rejected => "rejected",
            DisconnectReason::Busy => "busy",
            DisconnectReason::Unreachable => "unreachable",
            DisconnectReason::NotAnswered => "not answered",
            DisconnectReason::Transferred => "transferred",
            DisconnectReason::Error => "error",
        };
        f.write_str(text)
    }
}

/// Response used when refusing or rejecting an invite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    Busy,
    Declined,
    ServiceUnavailable,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::Busy => "Busy",
            RejectReason::Declined => "Declined",
            RejectReason::ServiceUnavailable => "ServiceUnavailable",
        }
    }
}

impl FromStr for RejectReason {
    type Err = VpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "declined" | "decline" => Ok(RejectReason::Declined),
            "busy" => Ok(RejectReason::Busy),
            "unavailable" | "serviceunavailable" => Ok(RejectReason::ServiceUnavailable),
            other => Err(VpError::UnknownVariant {
                type_name: "RejectReason",
                value: other.to_string(),
            }),
        }
    }
}

// ── Side statuses ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BridgeStatus {
    #[default]
    None,
    Dialing,
    Connected,
    Failed,
    Disconnected,
}

impl BridgeStatus {
    pub fn is_active(self) -> bool {
        matches!(self, BridgeStatus::Dialing | BridgeStatus::Connected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BridgeStatus::None => "None",
            BridgeStatus::Dialing => "Dialing",
            BridgeStatus::Connected => "Connected",
            BridgeStatus::Failed => "Failed",
            BridgeStatus::Disconnected => "Disconnected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferStatus {
    #[default]
    None,
    Pending,
    Failed,
    Completed,
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_back_to_idle() {
        for state in CallState::ALL {
            assert!(!state.allows(CallState::Idle), "{state} -> Idle");
        }
    }

    #[test]
    fn critical_error_is_terminal() {
        for state in CallState::ALL {
            assert!(!CallState::CriticalError.allows(state));
        }
    }

    #[test]
    fn hold_transitions() {
        assert!(CallState::Connected.allows(CallState::HoldLocal));
        assert!(CallState::HoldLocal.allows(CallState::HoldBoth));
        assert!(CallState::HoldBoth.allows(CallState::HoldRemote));
        assert!(CallState::HoldRemote.allows(CallState::Connected));
        assert!(!CallState::Connecting.allows(CallState::HoldLocal));
    }

    #[test]
    fn transfer_paths() {
        assert!(CallState::Connected.allows(CallState::InitTransfer));
        assert!(CallState::InitTransfer.allows(CallState::Transferring));
        assert!(CallState::Transferring.allows(CallState::Connected));
        assert!(CallState::Transferring.allows(CallState::HoldLocal));
        assert!(CallState::Transferring.allows(CallState::Disconnected));
        assert!(!CallState::Connecting.allows(CallState::InitTransfer));
    }

    #[test]
    fn disconnecting_only_moves_forward() {
        assert!(CallState::Disconnecting.allows(CallState::Disconnected));
        assert!(!CallState::Disconnecting.allows(CallState::Connected));
        assert!(CallState::Disconnected.allows(CallState::Disconnected));
        assert!(!CallState::Disconnected.allows(CallState::Connecting));
    }

    #[test]
    fn mask_groups() {
        assert!(CallStateMask::HOLD.matches(CallState::HoldBoth));
        assert!(CallStateMask::ESTABLISHED.matches(CallState::Connected));
        assert!(!CallStateMask::LIVE.matches(CallState::Disconnected));
        assert!(!CallStateMask::LIVE.matches(CallState::CriticalError));
        assert!(CallStateMask::all().matches(CallState::Unknown));
    }

    #[test]
    fn state_parses_case_insensitively() {
        assert_eq!("holdlocal".parse::<CallState>().unwrap(), CallState::HoldLocal);
        assert!("Ringing".parse::<CallState>().is_err());
    }

    #[test]
    fn substate_display() {
        assert_eq!(SubState::empty().to_string(), "NONE");
        let s = (SubState::LOCAL_HANGUP | SubState::ERROR).to_string();
        assert!(s.contains("LOCAL_HANGUP"));
        assert!(s.contains("ERROR"));
    }

    #[test]
    fn reject_reason_parse() {
        assert_eq!("".parse::<RejectReason>().unwrap(), RejectReason::Declined);
        assert_eq!("Busy".parse::<RejectReason>().unwrap(), RejectReason::Busy);
        assert!("later".parse::<RejectReason>().is_err());
    }

    #[test]
    fn disconnect_codes_are_distinct() {
        let reasons = [
            DisconnectReason::LocalHangup,
            DisconnectReason::RemoteHangup,
            DisconnectReason::Rejected,
            DisconnectReason::Busy,
            DisconnectReason::Unreachable,
            DisconnectReason::NotAnswered,
            DisconnectReason::Transferred,
            DisconnectReason::Error,
        ];
        let mut codes: Vec<u32> = reasons.iter().map(|r| r.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), reasons.len());
    }
}
