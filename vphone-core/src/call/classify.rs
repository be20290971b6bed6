//! Coarse call notifications derived from raw transitions.
//!
//! A pure table: the same transition always yields the same event, and
//! nothing here holds state of its own.

use std::fmt;

use super::state::{CallState, Direction, SubState};

/// Named call events consumed by UI, VRCL and statistics subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallEvent {
    Incoming,
    Dialing,
    Ringing,
    Connecting,
    Connected,
    HeldLocal,
    HeldRemote,
    Resumed,
    Disconnecting,
    Disconnected,
    TransferFailed,
    CriticalError,
}

impl fmt::Display for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Classify one transition. `None` when the transition has no named event
/// (e.g. substate-only negotiation steps).
pub fn classify(
    prev_state: CallState,
    new_state: CallState,
    new_substate: SubState,
    direction: Direction,
) -> Option<CallEvent> {
    if prev_state.is_transferring() && new_substate.contains(SubState::TRANSFER_FAILED) {
        return Some(CallEvent::TransferFailed);
    }

    match new_state {
        CallState::Connecting => {
            if new_substate.contains(SubState::WAITING_FOR_USER) && direction == Direction::Incoming
            {
                Some(CallEvent::Incoming)
            } else if new_substate.contains(SubState::ESTABLISHING) {
                Some(CallEvent::Connecting)
            } else if new_substate.contains(SubState::WAITING_FOR_REMOTE)
                && direction == Direction::Outgoing
            {
                Some(CallEvent::Ringing)
            } else if new_substate.contains(SubState::CALLING) && direction == Direction::Outgoing
            {
                Some(CallEvent::Dialing)
            } else {
                None
            }
        }
        CallState::Connected if new_substate.contains(SubState::CONFERENCING) => {
            if prev_state.is_held() {
                Some(CallEvent::Resumed)
            } else if prev_state == CallState::Connected {
                None
            } else {
                Some(CallEvent::Connected)
            }
        }
        CallState::HoldLocal => match prev_state {
            CallState::HoldBoth => Some(CallEvent::Resumed),
            CallState::HoldLocal => None,
            _ => Some(CallEvent::HeldLocal),
        },
        CallState::HoldRemote => match prev_state {
            CallState::HoldBoth => Some(CallEvent::Resumed),
            CallState::HoldRemote => None,
            _ => Some(CallEvent::HeldRemote),
        },
        CallState::HoldBoth => match prev_state {
            CallState::HoldLocal => Some(CallEvent::HeldRemote),
            CallState::HoldBoth => None,
            _ => Some(CallEvent::HeldLocal),
        },
        CallState::Disconnecting if prev_state != CallState::Disconnecting => {
            Some(CallEvent::Disconnecting)
        }
        CallState::Disconnected if new_substate.is_empty() => Some(CallEvent::Disconnected),
        CallState::CriticalError => Some(CallEvent::CriticalError),
        _ => None,
    }
}
