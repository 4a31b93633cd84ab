//! Race synchronization state machine
//!
//! `transition(settings, state, event) -> (state, effects)` is the whole
//! protocol. Role-independent bookkeeping (role assignment, link state) lives
//! here; everything that differs between StartLine and FinishLine is routed
//! through the per-role tables in `roles.rs`.

use bytes::Bytes;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::protocol::ProtocolMessage;
use super::roles::{protocol_for, CaptureUpdate, RoleProtocol};
use super::session::RaceSession;
use super::{ConnectionState, RacePhase, Role};

/// Calibration shared by every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaceSettings {
    /// Delay between operator commit and the start instant; must match the
    /// length of the audio cue
    pub lead_time: Duration,
}

impl Default for RaceSettings {
    fn default() -> Self {
        Self {
            lead_time: Duration::from_millis(12_700),
        }
    }
}

/// Camera availability on the FinishLine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CameraState {
    #[default]
    Released,
    Acquiring,
    Ready,
    /// Acquisition failed; retried only on operator request
    Failed,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RaceState {
    pub role: Role,
    pub connection: ConnectionState,
    pub phase: RacePhase,
    pub camera: CameraState,
    pub session: Option<RaceSession>,
    /// Number of attempts begun on this device
    pub attempts: u64,
    /// FinishLine: a discarded attempt's recorder has not delivered its final
    /// chunk yet; its output is dropped until it does
    pub draining_previous: bool,
}

/// Everything the state machine reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum RaceEvent {
    RoleSelected(Role),
    TransportConnecting,
    TransportOpened,
    TransportClosed,
    TransportErrored(String),
    MessageArrived { message: ProtocolMessage, at: Instant },
    CaptureAcquired,
    CaptureFailed(String),
    RecordingStarted { media_type: String },
    CaptureChunk { data: Bytes, is_final: bool },
    RecordingFailed(String),
    LeadTimeElapsed { attempt: u64, at: Instant },
    TimerTick { elapsed_ms: u64 },
    TimerStopped { elapsed_ms: u64 },
    OperatorCommit,
    OperatorAbort,
    /// `at` is when the operator asked, not when the engine got to it
    OperatorStop { at: Instant },
    OperatorRetryCamera,
}

/// Side effects requested by a transition, executed in order by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    PlayCue,
    ScheduleLeadTime { attempt: u64, delay: Duration },
    CancelLeadTime,
    StartTimer { zero: Instant },
    StopTimer { at: Instant },
    ResetTimer,
    Send(ProtocolMessage),
    AcquireCamera,
    ReleaseCamera,
    StartRecording,
    StopRecording,
    StoreChunk(Bytes),
    Finalize { media_type: Option<String> },
    DiscardRecording,
    Report(Report),
}

/// Operator-facing conditions raised by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    /// The StartLine armed a new attempt
    PeerArmed,
    CameraUnavailable(String),
    RecordingError(String),
    LinkError(String),
    StartAborted(String),
}

/// Mutable view handed to the role tables for one transition
pub(super) struct Step<'a> {
    pub settings: &'a RaceSettings,
    pub state: &'a mut RaceState,
    pub effects: Vec<Effect>,
}

impl Step<'_> {
    pub fn emit(&mut self, effect: Effect) {
        self.effects.push(effect);
    }
}

/// Apply one event to `state`.
pub fn transition(settings: &RaceSettings, mut state: RaceState, event: RaceEvent) -> (RaceState, Vec<Effect>) {
    let protocol = protocol_for(state.role);
    let mut step = Step {
        settings,
        state: &mut state,
        effects: Vec::new(),
    };

    match event {
        RaceEvent::RoleSelected(role) => select_role(&mut step, role),
        RaceEvent::TransportConnecting => {
            if !step.state.connection.is_open() {
                step.state.connection = ConnectionState::Connecting;
            }
        }
        RaceEvent::TransportOpened => {
            step.state.connection = ConnectionState::Open;
            if !step.state.role.is_assigned() {
                warn!("Link opened before a role was chosen");
            } else if step.state.phase == RacePhase::Unconnected {
                step.state.phase = RacePhase::Connected;
                protocol.on_connected(&mut step);
            }
        }
        RaceEvent::TransportClosed => link_lost(&mut step, protocol, ConnectionState::Closed),
        RaceEvent::TransportErrored(reason) => {
            step.emit(Effect::Report(Report::LinkError(reason)));
            link_lost(&mut step, protocol, ConnectionState::Errored);
        }
        RaceEvent::MessageArrived { message, at } => {
            if !step.state.role.is_assigned() {
                debug!("Ignoring {:?}: no role selected", message);
            } else {
                protocol.on_message(&mut step, message, at);
            }
        }
        RaceEvent::CaptureAcquired => protocol.on_capture(&mut step, CaptureUpdate::Acquired),
        RaceEvent::CaptureFailed(reason) => {
            protocol.on_capture(&mut step, CaptureUpdate::AcquireFailed(reason))
        }
        RaceEvent::RecordingStarted { media_type } => {
            protocol.on_capture(&mut step, CaptureUpdate::RecordingStarted(media_type))
        }
        RaceEvent::CaptureChunk { data, is_final } => {
            protocol.on_capture(&mut step, CaptureUpdate::Chunk { data, is_final })
        }
        RaceEvent::RecordingFailed(reason) => {
            protocol.on_capture(&mut step, CaptureUpdate::RecordingFailed(reason))
        }
        RaceEvent::LeadTimeElapsed { attempt, at } => protocol.on_lead_time_elapsed(&mut step, attempt, at),
        RaceEvent::TimerTick { elapsed_ms } | RaceEvent::TimerStopped { elapsed_ms } => {
            record_elapsed(&mut step, elapsed_ms)
        }
        RaceEvent::OperatorCommit => protocol.on_commit(&mut step),
        RaceEvent::OperatorAbort => protocol.on_abort(&mut step),
        RaceEvent::OperatorStop { at } => protocol.on_stop(&mut step, at),
        RaceEvent::OperatorRetryCamera => protocol.on_retry_camera(&mut step),
    }

    let effects = step.effects;
    (state, effects)
}

fn select_role(step: &mut Step<'_>, role: Role) {
    if step.state.role.is_assigned() {
        warn!(
            "Role already set to {}; ignoring request for {}",
            step.state.role, role
        );
        return;
    }
    if !role.is_assigned() {
        return;
    }
    info!("Role selected: {}", role);
    step.state.role = role;
}

fn link_lost(step: &mut Step<'_>, protocol: &dyn RoleProtocol, connection: ConnectionState) {
    step.state.connection = connection;
    match step.state.phase {
        RacePhase::Connected => {
            step.state.phase = RacePhase::Unconnected;
            protocol.on_link_lost(step);
        }
        RacePhase::Armed => {
            // The start message could never be delivered
            step.emit(Effect::CancelLeadTime);
            step.state.session = None;
            step.state.phase = RacePhase::Unconnected;
            step.emit(Effect::Report(Report::StartAborted(
                "peer link lost during countdown".to_string(),
            )));
        }
        // Local timing and capture continue without the link
        RacePhase::Running | RacePhase::Stopped | RacePhase::Unconnected => {}
    }
}

fn record_elapsed(step: &mut Step<'_>, elapsed_ms: u64) {
    if step.state.role != Role::StartLine {
        return;
    }
    if let Some(session) = step.state.session.as_mut() {
        if session.started {
            session.elapsed_ms = elapsed_ms;
        }
    }
}

/// Owns the current state and applies events one at a time
#[derive(Debug, Default)]
pub struct RaceMachine {
    settings: RaceSettings,
    state: RaceState,
}

impl RaceMachine {
    pub fn new(settings: RaceSettings) -> Self {
        Self {
            settings,
            state: RaceState::default(),
        }
    }

    pub fn state(&self) -> &RaceState {
        &self.state
    }

    pub fn handle(&mut self, event: RaceEvent) -> Vec<Effect> {
        let current = std::mem::take(&mut self.state);
        let (next, effects) = transition(&self.settings, current, event);
        self.state = next;
        effects
    }
}
