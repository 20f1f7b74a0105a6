//! Hardware-triggered dispatching
//!
//! A one-way latch on one bit of the digital input word. Until the bit is
//! first seen asserted, full batches are rewound without being emitted.

use std::fmt;

/// Gate state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Waiting for the trigger bit
    Armed,
    /// Emitting batches
    Open,
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateState::Armed => write!(f, "Armed"),
            GateState::Open => write!(f, "Open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TriggerGate {
    state: GateState,
    channel: u32,
}

impl TriggerGate {
    /// Armed on `channel` when `enabled`, otherwise permanently open
    pub fn new(enabled: bool, channel: u32) -> Self {
        Self {
            state: if enabled {
                GateState::Armed
            } else {
                GateState::Open
            },
            channel,
        }
    }

    /// Gate that never withholds anything
    pub fn open() -> Self {
        Self::new(false, 0)
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.state == GateState::Open
    }

    /// Digital input bit the gate listens on
    pub fn channel(&self) -> u32 {
        self.channel
    }

    /// Inspect a digital input word
    ///
    /// Returns `true` only on the cycle that opens the gate.
    pub fn observe(&mut self, dio: u32) -> bool {
        if self.state == GateState::Open {
            return false;
        }
        let asserted = self.channel < 32 && (dio >> self.channel) & 1 == 1;
        if asserted {
            self.state = GateState::Open;
        }
        asserted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_gate_is_open() {
        let mut gate = TriggerGate::new(false, 3);
        assert!(gate.is_open());
        assert!(!gate.observe(0));
        assert!(gate.is_open());
    }

    #[test]
    fn opens_on_trigger_bit() {
        let mut gate = TriggerGate::new(true, 3);
        assert_eq!(gate.state(), GateState::Armed);

        assert!(!gate.observe(0b0111));
        assert_eq!(gate.state(), GateState::Armed);

        assert!(gate.observe(0b1000));
        assert_eq!(gate.state(), GateState::Open);
    }

    #[test]
    fn stays_open_after_trigger_drops() {
        let mut gate = TriggerGate::new(true, 0);
        gate.observe(1);
        assert!(!gate.observe(0));
        assert!(gate.is_open());
    }

    #[test]
    fn highest_bit_is_usable() {
        let mut gate = TriggerGate::new(true, 31);
        assert!(gate.observe(0x8000_0000));
    }

    #[test]
    fn display() {
        assert_eq!(GateState::Armed.to_string(), "Armed");
        assert_eq!(TriggerGate::open().state().to_string(), "Open");
    }
}
