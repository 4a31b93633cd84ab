//! Per-attempt race state

use tokio::time::Instant;

/// Progress of the FinishLine recorder within one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingProgress {
    /// No recording requested (StartLine, or FinishLine before `Start`)
    #[default]
    Idle,
    /// `Start` arrived while the camera was still being acquired
    AwaitingCamera,
    /// `StartRecording` issued to the capture worker
    Requested,
    /// The recorder delivered its final chunk (or failed)
    Drained,
}

/// One timed attempt. Created when an attempt begins, replaced when the next
/// one begins.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RaceSession {
    /// Attempt counter, used to discard stale countdown completions
    pub attempt: u64,
    /// Operator committed to starting (StartLine)
    pub armed: bool,
    pub started: bool,
    pub start_instant: Option<Instant>,
    /// Last sampled race clock value (StartLine only)
    pub elapsed_ms: u64,
    /// Only ever moves from false to true
    pub stopped: bool,
    pub recording: RecordingProgress,
    /// Media type reported by the recorder once it started
    pub media_type: Option<String>,
    pub chunk_count: usize,
    /// Set when the finalizer has been invoked for this attempt
    pub finalized: bool,
}

impl RaceSession {
    /// A StartLine attempt the operator has just committed to
    pub fn armed(attempt: u64) -> Self {
        Self {
            attempt,
            armed: true,
            ..Default::default()
        }
    }

    /// A FinishLine attempt opened by an inbound `Start`
    pub fn started_remotely(attempt: u64, at: Instant) -> Self {
        Self {
            attempt,
            started: true,
            start_instant: Some(at),
            ..Default::default()
        }
    }

    pub fn begin(&mut self, at: Instant) {
        self.started = true;
        self.start_instant = Some(at);
    }

    /// Mark the attempt stopped. Returns false when it already was.
    pub fn stop(&mut self) -> bool {
        if self.stopped {
            return false;
        }
        self.stopped = true;
        true
    }

    pub fn is_running(&self) -> bool {
        self.started && !self.stopped
    }

    /// Whether the recorder output is complete and ready to be finalized
    pub fn ready_to_finalize(&self) -> bool {
        self.stopped && !self.finalized && self.recording_settled()
    }

    fn recording_settled(&self) -> bool {
        matches!(
            self.recording,
            RecordingProgress::Drained | RecordingProgress::Idle | RecordingProgress::AwaitingCamera
        )
    }
}
