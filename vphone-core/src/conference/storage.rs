//! Insertion-ordered set of live calls.

use parking_lot::Mutex;

use crate::call::{CallHandle, CallStateMask};
use crate::error::VpError;

#[derive(Debug, Default)]
struct Slots {
    calls: Vec<CallHandle>,
    head: Option<u32>,
}

/// Lock-protected call registry. Lookups return the oldest match.
#[derive(Debug, Default)]
pub struct CallStorage {
    slots: Mutex<Slots>,
}

impl CallStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `call`. The first call stored becomes the head.
    pub fn add(&self, call: CallHandle) {
        let mut slots = self.slots.lock();
        if slots.head.is_none() {
            slots.head = Some(call.index());
        }
        slots.calls.push(call);
    }

    /// Oldest call whose state is in `mask`.
    pub fn get(&self, mask: CallStateMask) -> Option<CallHandle> {
        self.slots
            .lock()
            .calls
            .iter()
            .find(|c| mask.matches(c.state()))
            .cloned()
    }

    pub fn count(&self, mask: CallStateMask) -> usize {
        self.slots
            .lock()
            .calls
            .iter()
            .filter(|c| mask.matches(c.state()))
            .count()
    }

    pub fn get_by_index(&self, index: u32) -> Option<CallHandle> {
        self.slots
            .lock()
            .calls
            .iter()
            .find(|c| c.index() == index)
            .cloned()
    }

    /// The primary call for single-call semantics.
    pub fn head(&self) -> Option<CallHandle> {
        let slots = self.slots.lock();
        let head = slots.head?;
        slots.calls.iter().find(|c| c.index() == head).cloned()
    }

    /// Remove a terminal call. Live calls are left untouched.
    pub fn remove(&self, call: &CallHandle) -> Result<(), VpError> {
        if !call.is_terminal() {
            return Err(VpError::invalid_state("remove", call.state()));
        }
        let mut slots = self.slots.lock();
        let position = slots
            .calls
            .iter()
            .position(|c| c.index() == call.index())
            .ok_or(VpError::NoCall)?;
        slots.calls.remove(position);
        if slots.head == Some(call.index()) {
            slots.head = slots.calls.first().map(|c| c.index());
        }
        Ok(())
    }

    /// Calls still occupying a slot.
    pub fn live_count(&self) -> usize {
        self.count(CallStateMask::LIVE)
    }

    pub fn all(&self) -> Vec<CallHandle> {
        self.slots.lock().calls.clone()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{Call, CallController, CallState, Direction, SubState};
    use std::sync::{Arc, Weak};

    struct Nobody;
    impl CallController for Nobody {
        fn call_request(&self, _: u32, _: crate::call::CallRequest) {}
    }

    fn call(index: u32) -> CallHandle {
        let weak: Weak<dyn CallController> = Weak::<Nobody>::new();
        let call = Arc::new(Call::new(index, Direction::Outgoing, None, weak));
        call.state_apply(CallState::Connecting, SubState::CALLING)
            .unwrap();
        call
    }

    fn finish(call: &CallHandle) {
        call.state_apply(CallState::Disconnecting, SubState::LOCAL_HANGUP)
            .unwrap();
        call.state_apply(CallState::Disconnected, SubState::empty())
            .unwrap();
    }

    #[test]
    fn oldest_match_wins() {
        let storage = CallStorage::new();
        let (a, b) = (call(1), call(2));
        storage.add(a.clone());
        storage.add(b.clone());
        b.state_apply(CallState::Connected, SubState::CONFERENCING)
            .unwrap();

        assert_eq!(storage.get(CallStateMask::LIVE).unwrap().index(), 1);
        assert_eq!(storage.get(CallStateMask::CONNECTED).unwrap().index(), 2);
        assert_eq!(storage.count(CallStateMask::CONNECTING), 1);
        assert!(storage.get(CallStateMask::HOLD).is_none());
    }

    #[test]
    fn remove_requires_terminal_state() {
        let storage = CallStorage::new();
        let a = call(1);
        storage.add(a.clone());
        assert!(matches!(
            storage.remove(&a),
            Err(VpError::InvalidState { .. })
        ));
        assert_eq!(storage.len(), 1);

        finish(&a);
        storage.remove(&a).unwrap();
        assert!(storage.is_empty());
        assert!(matches!(storage.remove(&a), Err(VpError::NoCall)));
    }

    #[test]
    fn head_moves_to_next_oldest() {
        let storage = CallStorage::new();
        let (a, b, c) = (call(1), call(2), call(3));
        storage.add(a.clone());
        storage.add(b.clone());
        storage.add(c.clone());
        assert_eq!(storage.head().unwrap().index(), 1);

        finish(&a);
        storage.remove(&a).unwrap();
        assert_eq!(storage.head().unwrap().index(), 2);
        assert_eq!(storage.get_by_index(3).unwrap().index(), 3);
        assert_eq!(storage.live_count(), 2);
    }
}
