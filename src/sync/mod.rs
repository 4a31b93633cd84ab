//! Race engine - drives the state machine from transport, capture, timer and
//! operator events

mod engine;

pub use engine::{create_engine_channels, EngineIo, EngineSettings, RaceEngine};

use std::path::PathBuf;

use crate::race::{ConnectionState, RacePhase, Role};

/// Commands that can be sent to the race engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    /// Fix this device's role for the session
    SelectRole(Role),
    /// Dial the other device by its peer id
    Connect(String),
    /// StartLine: play the cue and start after the lead time
    CommitStart,
    /// StartLine: cancel a pending countdown
    AbortStart,
    /// Stop the race (and the recording on the FinishLine)
    Stop,
    /// FinishLine: try the camera again after a failure
    RetryCamera,
    /// Play the start cue without arming
    TestCue,
    /// Write the finished recording to a directory (configured one if `None`)
    SaveRecording(Option<PathBuf>),
    /// Shutdown the engine
    Shutdown,
}

/// Status updates from the race engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineStatus {
    RoleSelected(Role),
    /// Id the other device should connect to
    PeerId(String),
    Connection(ConnectionState),
    Phase(RacePhase),
    /// Race clock sample (StartLine)
    Elapsed { elapsed_ms: u64 },
    CameraReady(bool),
    Recording(bool),
    ArtifactReady {
        uri: String,
        media_type: String,
        size: String,
        chunks: usize,
    },
    ArtifactSaved(PathBuf),
    Notice(String),
    /// An error occurred
    Error(String),
}
