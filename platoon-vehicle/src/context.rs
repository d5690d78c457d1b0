//! State shared by every activity of a running vehicle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use platoon_protocol::VehicleId;

use crate::config::MotionParams;
use crate::motion::MotionState;

/// Which neighbour a link leads to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The predecessor, one ID lower
    Front,
    /// The successor, one ID higher
    Back,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Front => Direction::Back,
            Direction::Back => Direction::Front,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Front => write!(f, "front"),
            Direction::Back => write!(f, "back"),
        }
    }
}

/// Why a vehicle stopped running
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TerminationReason {
    UserQuit,
    PeerQuit(Direction),
    LinkLost(Direction),
    BrokerLost,
    Crash { headway: f64 },
}

impl TerminationReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            TerminationReason::UserQuit | TerminationReason::PeerQuit(_) => 0,
            TerminationReason::Crash { .. } => 3,
            TerminationReason::LinkLost(_) | TerminationReason::BrokerLost => 4,
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::UserQuit => write!(f, "quit"),
            TerminationReason::PeerQuit(side) => write!(f, "quit received from {}", side),
            TerminationReason::LinkLost(side) => write!(f, "{} link lost", side),
            TerminationReason::BrokerLost => write!(f, "broker connection lost"),
            TerminationReason::Crash { headway } => write!(f, "CAR CRASH (headway {:.2})", headway),
        }
    }
}

/// Write-once termination flag. The first trigger wins.
#[derive(Debug, Default)]
pub struct TerminationFlag {
    set: AtomicBool,
    reason: OnceLock<TerminationReason>,
}

impl TerminationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call set the flag.
    pub fn trigger(&self, reason: TerminationReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.set.store(true, Ordering::SeqCst);
        first
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<TerminationReason> {
        self.reason.get().copied()
    }
}

/// Everything the loops of one vehicle share, behind an `Arc`
#[derive(Debug)]
pub struct SharedState {
    pub id: VehicleId,
    pub params: MotionParams,
    motion: Mutex<MotionState>,
    pub termination: TerminationFlag,
}

impl SharedState {
    pub fn new(id: VehicleId, params: MotionParams, start_position: f64) -> Self {
        SharedState {
            id,
            params,
            motion: Mutex::new(MotionState::new(start_position)),
            termination: TerminationFlag::new(),
        }
    }

    /// Lock the motion state. A poisoned lock still holds valid scalars.
    pub fn motion(&self) -> MutexGuard<'_, MotionState> {
        self.motion.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of the motion state
    pub fn snapshot(&self) -> MotionState {
        *self.motion()
    }

    pub fn is_terminated(&self) -> bool {
        self.termination.is_set()
    }

    pub fn terminate(&self, reason: TerminationReason) -> bool {
        self.termination.trigger(reason)
    }
}
