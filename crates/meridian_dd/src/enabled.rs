//! Process-wide data-distribution toggle.
//!
//! The snapshot protocol disables DD for the duration of a snapshot and
//! must restore it on every exit path; operators can also disable DD
//! outright. Transitions are compare-and-set on the (state, owner) pair so
//! concurrent snapshots cannot trample each other.

use std::sync::Mutex;

use crate::Uid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Enabled,
    DisabledByOperator,
    DisabledBySnapshot(Uid),
}

#[derive(Debug)]
pub struct DdEnabledState {
    state: Mutex<State>,
}

impl Default for DdEnabledState {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::Enabled),
        }
    }
}

impl DdEnabledState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        *self.state.lock().unwrap() == State::Enabled
    }

    /// Disable DD for snapshot `owner`. Fails when DD is already disabled
    /// for any reason.
    pub fn disable_for_snapshot(&self, owner: Uid) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state != State::Enabled {
            return false;
        }
        *state = State::DisabledBySnapshot(owner);
        true
    }

    /// Re-enable DD after a snapshot. Fails unless DD is currently
    /// disabled by the same snapshot `owner`.
    pub fn enable_after_snapshot(&self, owner: Uid) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state != State::DisabledBySnapshot(owner) {
            return false;
        }
        *state = State::Enabled;
        true
    }

    /// Operator-level toggle. Disabling fails when a snapshot currently
    /// owns the disabled state; enabling fails when a snapshot does.
    pub fn set_operator_enabled(&self, enable: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        match (enable, *state) {
            (false, State::Enabled) => {
                *state = State::DisabledByOperator;
                true
            }
            (true, State::DisabledByOperator) => {
                *state = State::Enabled;
                true
            }
            _ => false,
        }
    }
}
