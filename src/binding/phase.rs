//! Two-phase release state machine
//!
//! A binding is freed only once both the managed side has released it and
//! the native side has reported shutdown, whichever arrives second. The whole
//! rule is the `Phase::on` transition table; `AtomicPhase` applies it with
//! compare-and-swap so native threads can signal without the managed lock.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Allocated, native constructor not finished
    Constructing = 0,
    Active = 1,
    /// Managed side released; waiting for native shutdown
    AwaitingShutdown = 2,
    /// Native side shut down first; waiting for managed release
    AwaitingRelease = 3,
    Terminated = 4,
    /// Native construction failed; no shutdown will ever arrive
    Failed = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Constructed,
    ConstructionFailed,
    Release,
    Shutdown,
}

/// A signal that is illegal in the current phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("signal {signal:?} is illegal in phase {phase:?}")]
pub struct ProtocolViolation {
    pub phase: Phase,
    pub signal: Signal,
}

impl Phase {
    /// Transition table
    pub fn on(self, signal: Signal) -> Result<Phase, ProtocolViolation> {
        use Phase::*;
        use Signal::*;

        match (self, signal) {
            (Constructing, Constructed) => Ok(Active),
            (Constructing, ConstructionFailed) => Ok(Failed),
            (Active, Release) => Ok(AwaitingShutdown),
            (Active, Shutdown) => Ok(AwaitingRelease),
            (AwaitingShutdown, Shutdown) => Ok(Terminated),
            (AwaitingRelease, Release) => Ok(Terminated),
            (phase, signal) => Err(ProtocolViolation { phase, signal }),
        }
    }

    /// Absorbing phases; reaching one frees the binding
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Terminated | Phase::Failed)
    }

    #[inline]
    pub fn release_called(self) -> bool {
        matches!(self, Phase::AwaitingShutdown | Phase::Terminated)
    }

    #[inline]
    pub fn shutdown_called(self) -> bool {
        matches!(self, Phase::AwaitingRelease | Phase::Terminated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Constructing => "constructing",
            Phase::Active => "active",
            Phase::AwaitingShutdown => "awaiting_shutdown",
            Phase::AwaitingRelease => "awaiting_release",
            Phase::Terminated => "terminated",
            Phase::Failed => "failed",
        }
    }

    fn from_u8(raw: u8) -> Phase {
        match raw {
            0 => Phase::Constructing,
            1 => Phase::Active,
            2 => Phase::AwaitingShutdown,
            3 => Phase::AwaitingRelease,
            4 => Phase::Terminated,
            5 => Phase::Failed,
            _ => unreachable!("invalid phase tag {raw}"),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free phase cell shared by the managed and native sides
#[derive(Debug)]
pub struct AtomicPhase(AtomicU8);

impl AtomicPhase {
    pub const fn new() -> Self {
        Self(AtomicU8::new(Phase::Constructing as u8))
    }

    #[inline]
    pub fn load(&self) -> Phase {
        Phase::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Apply `signal`, returning `(from, to)`.
    ///
    /// Exactly one caller observes `to.is_terminal()` for a given cell.
    pub fn apply(&self, signal: Signal) -> Result<(Phase, Phase), ProtocolViolation> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let from = Phase::from_u8(current);
            let to = from.on(signal)?;
            match self.0.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok((from, to)),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for AtomicPhase {
    fn default() -> Self {
        Self::new()
    }
}
