//! Race synchronization core
//!
//! Turns peer-link events, camera events and operator actions into one
//! consistent cross-device lifecycle (connect, arm, start, run, stop,
//! finalize). The transition function in [`machine`] is effect-free: it
//! returns the next state plus a list of [`Effect`]s that the engine executes.

mod countdown;
mod machine;
mod protocol;
mod roles;
mod session;
mod timer;

pub use countdown::{LeadTimeCountdown, LeadTimeElapsed};
pub use machine::{CameraState, Effect, RaceEvent, RaceMachine, RaceSettings, Report};
pub use protocol::{DecodeError, ProtocolMessage};
pub use timer::RaceTimer;

use serde::{Deserialize, Serialize};
use std::fmt;

/// The part a device plays in a race. Chosen once, before the link opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Unassigned,
    /// Owns the audible cue, the countdown and the race clock
    StartLine,
    /// Owns the camera and decides when capture ends
    FinishLine,
}

impl Role {
    pub fn is_assigned(self) -> bool {
        self != Role::Unassigned
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Unassigned => write!(f, "unassigned"),
            Role::StartLine => write!(f, "START LINE"),
            Role::FinishLine => write!(f, "FINISH LINE"),
        }
    }
}

/// State of the peer link, driven only by transport events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
    Errored,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        self == ConnectionState::Open
    }
}

/// Lifecycle phase of the race on this device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RacePhase {
    #[default]
    Unconnected,
    Connected,
    Armed,
    Running,
    Stopped,
}

impl fmt::Display for RacePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RacePhase::Unconnected => "unconnected",
            RacePhase::Connected => "connected",
            RacePhase::Armed => "armed",
            RacePhase::Running => "running",
            RacePhase::Stopped => "stopped",
        };
        f.write_str(label)
    }
}
