//! Sandbox lifecycle: `Attached ⇄ Frozen → Destroyed`.
//!
//! Driven by the host document's pagehide/pageshow/unload notifications.
//! `Destroyed` is terminal; re-attaching always allocates a new
//! [`Generation`].

use std::fmt;

use crate::error::ChannelUnavailableError;

/// Monotonically increasing id of one sandbox instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(u64);

impl Generation {
    pub const FIRST: Generation = Generation(1);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Script evaluated (or pending its load timing); channels and timers live.
    Attached,
    /// Document is in the back/forward cache; sends fail, timers suspended.
    Frozen,
    /// Document is gone; everything torn down.
    Destroyed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attached => "attached",
            Self::Frozen => "frozen",
            Self::Destroyed => "destroyed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of feeding a trigger into the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Frozen,
    Resumed,
    Destroyed,
    /// The trigger does not apply in the current state.
    Ignored,
}

#[derive(Debug)]
pub struct LifecycleController {
    generation: Generation,
    state: LifecycleState,
}

impl LifecycleController {
    /// A freshly attached generation.
    pub fn attach(generation: Generation) -> Self {
        tracing::debug!(target: "worker", %generation, "sandbox attached");
        Self {
            generation,
            state: LifecycleState::Attached,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn hide(&mut self) -> Transition {
        match self.state {
            LifecycleState::Attached => self.enter(LifecycleState::Frozen, Transition::Frozen),
            _ => Transition::Ignored,
        }
    }

    /// Only a frozen sandbox can come back.
    pub fn show(&mut self) -> Transition {
        match self.state {
            LifecycleState::Frozen => self.enter(LifecycleState::Attached, Transition::Resumed),
            _ => Transition::Ignored,
        }
    }

    pub fn unload(&mut self) -> Transition {
        match self.state {
            LifecycleState::Destroyed => Transition::Ignored,
            _ => self.enter(LifecycleState::Destroyed, Transition::Destroyed),
        }
    }

    pub fn ensure_sendable(&self) -> Result<(), ChannelUnavailableError> {
        match self.state {
            LifecycleState::Attached => Ok(()),
            LifecycleState::Frozen => Err(ChannelUnavailableError::hidden()),
            LifecycleState::Destroyed => Err(ChannelUnavailableError::gone()),
        }
    }

    fn enter(&mut self, next: LifecycleState, transition: Transition) -> Transition {
        tracing::debug!(
            target: "worker",
            generation = %self.generation,
            from = %self.state,
            to = %next,
            "lifecycle transition"
        );
        self.state = next;
        transition
    }
}
