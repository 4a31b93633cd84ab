//! Per-role handler tables
//!
//! Every inbound message and operator action is routed through the table of
//! the local role, so StartLine and FinishLine behavior can be read and tested
//! independently. Defaults ignore the event; anomalies are logged, never
//! escalated.

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info};

use super::machine::{CameraState, Effect, Report, Step};
use super::protocol::ProtocolMessage;
use super::session::{RaceSession, RecordingProgress};
use super::{RacePhase, Role};

/// Capture worker notifications, as seen by the role tables
pub(super) enum CaptureUpdate {
    Acquired,
    AcquireFailed(String),
    RecordingStarted(String),
    Chunk { data: Bytes, is_final: bool },
    RecordingFailed(String),
}

pub(super) trait RoleProtocol: Sync {
    fn name(&self) -> &'static str;

    /// The link reached `Open` for the first time in this phase
    fn on_connected(&self, _step: &mut Step<'_>) {}

    fn on_message(&self, _step: &mut Step<'_>, message: ProtocolMessage, _at: Instant) {
        debug!("{}: ignoring {:?}", self.name(), message);
    }

    fn on_commit(&self, _step: &mut Step<'_>) {
        debug!("{}: commit is not available", self.name());
    }

    fn on_abort(&self, _step: &mut Step<'_>) {}

    fn on_lead_time_elapsed(&self, _step: &mut Step<'_>, attempt: u64, _at: Instant) {
        debug!("{}: ignoring lead time for attempt {}", self.name(), attempt);
    }

    fn on_stop(&self, _step: &mut Step<'_>, _at: Instant) {}

    /// The link dropped while `Connected`; the phase is already `Unconnected`
    fn on_link_lost(&self, _step: &mut Step<'_>) {}

    fn on_retry_camera(&self, _step: &mut Step<'_>) {
        debug!("{}: no camera to retry", self.name());
    }

    fn on_capture(&self, _step: &mut Step<'_>, _update: CaptureUpdate) {
        debug!("{}: ignoring capture event", self.name());
    }
}

pub(super) fn protocol_for(role: Role) -> &'static dyn RoleProtocol {
    match role {
        Role::Unassigned => &UnassignedProtocol,
        Role::StartLine => &StartLineProtocol,
        Role::FinishLine => &FinishLineProtocol,
    }
}

struct UnassignedProtocol;

impl RoleProtocol for UnassignedProtocol {
    fn name(&self) -> &'static str {
        "unassigned"
    }
}

/// Authoritative for the start instant: cue, countdown and race clock
struct StartLineProtocol;

impl StartLineProtocol {
    fn finish(step: &mut Step<'_>, local: bool, at: Instant) {
        let Some(session) = step.state.session.as_mut() else {
            return;
        };
        if !session.stop() {
            return;
        }
        step.state.phase = RacePhase::Stopped;
        step.emit(Effect::StopTimer { at });
        if local {
            step.emit(Effect::Send(ProtocolMessage::Stop));
        }
    }
}

impl RoleProtocol for StartLineProtocol {
    fn name(&self) -> &'static str {
        "start line"
    }

    fn on_message(&self, step: &mut Step<'_>, message: ProtocolMessage, at: Instant) {
        match (message, step.state.phase) {
            (ProtocolMessage::Stop, RacePhase::Running) => {
                info!("Stop received from finish line");
                Self::finish(step, false, at);
            }
            (message, phase) => debug!("start line: ignoring {:?} while {}", message, phase),
        }
    }

    fn on_commit(&self, step: &mut Step<'_>) {
        let phase = step.state.phase;
        if !step.state.connection.is_open() || !matches!(phase, RacePhase::Connected | RacePhase::Stopped) {
            debug!("start line: commit ignored while {} ({:?})", phase, step.state.connection);
            return;
        }

        step.state.attempts += 1;
        let attempt = step.state.attempts;
        step.state.session = Some(RaceSession::armed(attempt));
        step.state.phase = RacePhase::Armed;
        info!("Attempt {} armed", attempt);

        step.emit(Effect::ResetTimer);
        step.emit(Effect::Send(ProtocolMessage::Ready));
        step.emit(Effect::PlayCue);
        let delay = step.settings.lead_time;
        step.emit(Effect::ScheduleLeadTime { attempt, delay });
    }

    fn on_abort(&self, step: &mut Step<'_>) {
        if step.state.phase != RacePhase::Armed {
            return;
        }
        info!("Countdown aborted by operator");
        step.emit(Effect::CancelLeadTime);
        step.state.session = None;
        step.state.phase = RacePhase::Connected;
    }

    fn on_lead_time_elapsed(&self, step: &mut Step<'_>, attempt: u64, at: Instant) {
        if step.state.phase != RacePhase::Armed {
            debug!("start line: lead time for attempt {} arrived while {}", attempt, step.state.phase);
            return;
        }
        let Some(session) = step.state.session.as_mut() else {
            return;
        };
        if session.attempt != attempt {
            debug!("start line: stale lead time (attempt {}, current {})", attempt, session.attempt);
            return;
        }

        session.begin(at);
        step.state.phase = RacePhase::Running;
        info!("Race started (attempt {})", attempt);
        step.emit(Effect::StartTimer { zero: at });
        step.emit(Effect::Send(ProtocolMessage::Start));
    }

    fn on_stop(&self, step: &mut Step<'_>, at: Instant) {
        match step.state.phase {
            RacePhase::Running => Self::finish(step, true, at),
            RacePhase::Armed => self.on_abort(step),
            _ => {}
        }
    }
}

/// Authoritative for the stop: owns the camera and the recording
struct FinishLineProtocol;

impl FinishLineProtocol {
    fn acquire(step: &mut Step<'_>) {
        step.state.camera = CameraState::Acquiring;
        step.emit(Effect::AcquireCamera);
    }

    fn begin(step: &mut Step<'_>, at: Instant) {
        if step.state.camera == CameraState::Failed {
            step.emit(Effect::Report(Report::CameraUnavailable(
                "camera not available; start ignored".to_string(),
            )));
            return;
        }

        step.state.attempts += 1;
        let mut session = RaceSession::started_remotely(step.state.attempts, at);

        match step.state.camera {
            CameraState::Ready => {
                session.recording = RecordingProgress::Requested;
                step.emit(Effect::StartRecording);
            }
            CameraState::Acquiring => session.recording = RecordingProgress::AwaitingCamera,
            CameraState::Released => {
                session.recording = RecordingProgress::AwaitingCamera;
                Self::acquire(step);
            }
            CameraState::Failed => {}
        }

        info!("Start received, capturing (attempt {})", session.attempt);
        step.state.session = Some(session);
        step.state.phase = RacePhase::Running;
    }

    fn finish(step: &mut Step<'_>, local: bool) {
        let Some(session) = step.state.session.as_mut() else {
            return;
        };
        if !session.stop() {
            return;
        }
        let recording = session.recording;
        step.state.phase = RacePhase::Stopped;

        if recording == RecordingProgress::Requested {
            step.emit(Effect::StopRecording);
        }
        if local {
            step.emit(Effect::Send(ProtocolMessage::Stop));
        }
        Self::finalize_if_drained(step);
    }

    fn finalize_if_drained(step: &mut Step<'_>) {
        let Some(session) = step.state.session.as_mut() else {
            return;
        };
        if !session.ready_to_finalize() {
            return;
        }
        session.finalized = true;
        let media_type = session.media_type.clone();
        step.emit(Effect::Finalize { media_type });
    }

    fn recording_session<'s>(step: &'s mut Step<'_>) -> Option<&'s mut RaceSession> {
        step.state
            .session
            .as_mut()
            .filter(|s| s.recording == RecordingProgress::Requested && !s.finalized)
    }
}

impl RoleProtocol for FinishLineProtocol {
    fn name(&self) -> &'static str {
        "finish line"
    }

    fn on_connected(&self, step: &mut Step<'_>) {
        if step.state.camera == CameraState::Released {
            Self::acquire(step);
        }
    }

    fn on_message(&self, step: &mut Step<'_>, message: ProtocolMessage, at: Instant) {
        match (message, step.state.phase) {
            (ProtocolMessage::Start, RacePhase::Connected) => Self::begin(step, at),
            (ProtocolMessage::Stop, RacePhase::Running) => {
                info!("Stop received from start line");
                Self::finish(step, false);
            }
            (ProtocolMessage::Ready, RacePhase::Stopped) => {
                // The start line armed a new attempt; forget the previous one.
                // Output still owed by its recorder must not land in the next.
                let undrained = step
                    .state
                    .session
                    .take()
                    .map(|s| s.recording == RecordingProgress::Requested)
                    .unwrap_or(false);
                step.state.draining_previous = undrained;
                step.state.phase = if step.state.connection.is_open() {
                    RacePhase::Connected
                } else {
                    RacePhase::Unconnected
                };
                step.emit(Effect::DiscardRecording);
                step.emit(Effect::Report(Report::PeerArmed));
            }
            (ProtocolMessage::Ready, RacePhase::Connected) => {
                step.emit(Effect::Report(Report::PeerArmed));
            }
            (message, phase) => debug!("finish line: ignoring {:?} while {}", message, phase),
        }
    }

    fn on_stop(&self, step: &mut Step<'_>, _at: Instant) {
        if step.state.phase == RacePhase::Running {
            Self::finish(step, true);
        }
    }

    fn on_link_lost(&self, step: &mut Step<'_>) {
        if matches!(step.state.camera, CameraState::Ready | CameraState::Acquiring) {
            info!("Peer gone before the race; releasing camera");
            step.state.camera = CameraState::Released;
            step.state.draining_previous = false;
            step.emit(Effect::ReleaseCamera);
        }
    }

    fn on_retry_camera(&self, step: &mut Step<'_>) {
        if step.state.camera == CameraState::Failed {
            info!("Retrying camera acquisition");
            Self::acquire(step);
        }
    }

    fn on_capture(&self, step: &mut Step<'_>, update: CaptureUpdate) {
        if step.state.camera == CameraState::Released
            && matches!(update, CaptureUpdate::Acquired | CaptureUpdate::AcquireFailed(_))
        {
            debug!("finish line: camera was released, ignoring acquisition result");
            return;
        }

        match update {
            CaptureUpdate::Acquired => {
                step.state.camera = CameraState::Ready;
                let pending = step
                    .state
                    .session
                    .as_mut()
                    .filter(|s| s.is_running() && s.recording == RecordingProgress::AwaitingCamera);
                if let Some(session) = pending {
                    session.recording = RecordingProgress::Requested;
                    step.emit(Effect::StartRecording);
                }
            }
            CaptureUpdate::AcquireFailed(reason) => {
                step.state.camera = CameraState::Failed;
                step.emit(Effect::Report(Report::CameraUnavailable(reason)));

                let pending = step
                    .state
                    .session
                    .as_ref()
                    .map(|s| s.is_running() && s.recording == RecordingProgress::AwaitingCamera)
                    .unwrap_or(false);
                if pending {
                    step.state.session = None;
                    step.state.phase = if step.state.connection.is_open() {
                        RacePhase::Connected
                    } else {
                        RacePhase::Unconnected
                    };
                }
            }
            CaptureUpdate::RecordingStarted(media_type) => {
                if let Some(session) = Self::recording_session(step) {
                    info!("Recording as {}", media_type);
                    session.media_type = Some(media_type);
                }
            }
            CaptureUpdate::Chunk { is_final, .. } if step.state.draining_previous => {
                if is_final {
                    debug!("finish line: previous recording drained");
                    step.state.draining_previous = false;
                }
            }
            CaptureUpdate::Chunk { data, is_final } => {
                let Some(session) = Self::recording_session(step) else {
                    debug!("finish line: dropping chunk outside an active recording");
                    return;
                };
                if is_final {
                    session.recording = RecordingProgress::Drained;
                }
                if !data.is_empty() {
                    session.chunk_count += 1;
                    step.emit(Effect::StoreChunk(data));
                }
                if is_final {
                    Self::finalize_if_drained(step);
                }
            }
            CaptureUpdate::RecordingFailed(reason) => {
                step.emit(Effect::Report(Report::RecordingError(reason)));
                if step.state.draining_previous {
                    // The previous recorder will not deliver its final chunk
                    step.state.draining_previous = false;
                    return;
                }
                if let Some(session) = Self::recording_session(step) {
                    session.recording = RecordingProgress::Drained;
                }
                Self::finalize_if_drained(step);
            }
        }
    }
}
