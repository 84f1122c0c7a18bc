//! Gate latches for the shot lifecycle.
//!
//! A gate is a latch bound to one sequence; every set and clear is
//! published as a `SequencerGate` event by the owner.

use std::collections::BTreeMap;

use crate::event::{ALL_GATES, GateName};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Unset,
    Set,
    Cleared,
}

#[derive(Debug, Clone)]
pub struct GateSet {
    states: BTreeMap<GateName, GateState>,
}

impl GateSet {
    pub fn new() -> Self {
        Self {
            states: ALL_GATES
                .iter()
                .map(|g| (*g, GateState::Unset))
                .collect(),
        }
    }

    pub fn is_set(&self, gate: GateName) -> bool {
        self.states.get(&gate) == Some(&GateState::Set)
    }

    /// Latch the gate. Returns false when it was already set, so the
    /// caller publishes each transition exactly once.
    pub fn set(&mut self, gate: GateName) -> bool {
        match self.states.insert(gate, GateState::Set) {
            Some(GateState::Set) => false,
            _ => true,
        }
    }

    pub fn clear(&mut self, gate: GateName) -> bool {
        match self.states.insert(gate, GateState::Cleared) {
            Some(GateState::Cleared) => false,
            _ => true,
        }
    }
}

impl Default for GateSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_latches_once() {
        let mut gates = GateSet::new();
        assert!(!gates.is_set(GateName::FlowBegin));
        assert!(gates.set(GateName::FlowBegin));
        assert!(!gates.set(GateName::FlowBegin));
        assert!(gates.is_set(GateName::FlowBegin));
    }

    #[test]
    fn clear_after_set_transitions() {
        let mut gates = GateSet::new();
        gates.set(GateName::FlowEnd);
        assert!(gates.clear(GateName::FlowEnd));
        assert!(!gates.is_set(GateName::FlowEnd));
        assert!(!gates.clear(GateName::FlowEnd));
    }
}
