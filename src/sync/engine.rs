//! Race engine
//!
//! Owns every resource the state machine talks about: the peer link, the
//! capture worker, the race clock, the lead-time countdown and the recording
//! finalizer. Each event from those sources is fed through the machine and
//! the resulting effects are executed here, in order, before the next event
//! is taken.
//!
//! Teardown releases the peer link first, then the clock and countdown, then
//! the camera.

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureConstraints, CaptureEvent, CaptureHandle};
use crate::cue::{AudioCue, CueError};
use crate::race::{
    CameraState, ConnectionState, Effect, LeadTimeCountdown, LeadTimeElapsed, RaceEvent, RaceMachine, RacePhase,
    RaceSettings, RaceTimer, Report, Role,
};
use crate::recording::RecordingFinalizer;
use crate::transport::{PeerId, Transport, TransportError, TransportEvent};

use super::{EngineCommand, EngineStatus};

/// Engine parameters taken from the configuration
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub race: RaceSettings,
    /// Race clock sampling cadence
    pub tick_interval: Duration,
    pub constraints: CaptureConstraints,
    /// Default target for `SaveRecording`
    pub output_dir: PathBuf,
}

/// Adapters the engine drives, with the channels they report on
pub struct EngineIo {
    pub transport: Box<dyn Transport>,
    pub transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    pub capture: CaptureHandle,
    pub capture_events: mpsc::UnboundedReceiver<CaptureEvent>,
    pub cue: Box<dyn AudioCue>,
    pub cue_failures: mpsc::UnboundedReceiver<CueError>,
}

/// Snapshot used to announce state changes after each event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Observed {
    role: Role,
    connection: ConnectionState,
    phase: RacePhase,
    camera: CameraState,
}

pub struct RaceEngine {
    settings: EngineSettings,
    machine: RaceMachine,
    transport: Box<dyn Transport>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    capture: CaptureHandle,
    capture_rx: mpsc::UnboundedReceiver<CaptureEvent>,
    cue: Box<dyn AudioCue>,
    cue_rx: mpsc::UnboundedReceiver<CueError>,
    timer: RaceTimer,
    countdown: LeadTimeCountdown,
    lead_rx: mpsc::UnboundedReceiver<LeadTimeElapsed>,
    finalizer: RecordingFinalizer,
    cmd_rx: mpsc::Receiver<EngineCommand>,
    status_tx: broadcast::Sender<EngineStatus>,
}

impl RaceEngine {
    pub fn new(
        settings: EngineSettings,
        io: EngineIo,
        cmd_rx: mpsc::Receiver<EngineCommand>,
        status_tx: broadcast::Sender<EngineStatus>,
    ) -> Self {
        let (lead_tx, lead_rx) = mpsc::unbounded_channel();
        Self {
            machine: RaceMachine::new(settings.race),
            settings,
            transport: io.transport,
            transport_rx: io.transport_events,
            capture: io.capture,
            capture_rx: io.capture_events,
            cue: io.cue,
            cue_rx: io.cue_failures,
            timer: RaceTimer::new(),
            countdown: LeadTimeCountdown::new(lead_tx),
            lead_rx,
            finalizer: RecordingFinalizer::new(),
            cmd_rx,
            status_tx,
        }
    }

    /// Run until `Shutdown` (or until every command sender is gone).
    pub async fn run(&mut self) -> Result<()> {
        info!("Race engine starting (lead time {:?})", self.settings.race.lead_time);

        if let Err(e) = self.transport.open().await {
            error!("Failed to open transport: {}", e);
            self.status(EngineStatus::Error(format!("Could not open peer link: {}", e)));
        }

        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.publish(&self.observe(), true);

        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => {
                    let at = Instant::now();
                    let Some(command) = command else {
                        info!("Command channel closed");
                        break;
                    };
                    if matches!(command, EngineCommand::Shutdown) {
                        info!("Shutdown command received");
                        break;
                    }
                    self.on_command(command, at).await;
                }

                Some(event) = self.transport_rx.recv() => self.on_transport(event).await,

                Some(event) = self.capture_rx.recv() => self.on_capture(event).await,

                Some(LeadTimeElapsed { attempt, at }) = self.lead_rx.recv() => {
                    self.apply(RaceEvent::LeadTimeElapsed { attempt, at }).await;
                }

                Some(failure) = self.cue_rx.recv() => {
                    warn!("{}", failure);
                    self.status(EngineStatus::Error(failure.to_string()));
                }

                _ = ticker.tick(), if self.timer.is_running() => {
                    let elapsed_ms = self.timer.elapsed_ms(Instant::now());
                    self.machine.handle(RaceEvent::TimerTick { elapsed_ms });
                    self.status(EngineStatus::Elapsed { elapsed_ms });
                }
            }
        }

        self.teardown().await;
        info!("Race engine stopped");
        Ok(())
    }

    async fn teardown(&mut self) {
        self.transport.close().await;

        self.countdown.cancel();
        if self.timer.is_running() {
            let elapsed = self.timer.stop(Instant::now());
            info!("Race clock stopped at {:?} during shutdown", elapsed);
        }

        self.capture.shutdown().await;
    }

    async fn on_command(&mut self, command: EngineCommand, at: Instant) {
        debug!("Command: {:?}", command);
        let state = self.machine.state();
        match command {
            EngineCommand::SelectRole(role) => {
                if state.role.is_assigned() && state.role != role {
                    self.status(EngineStatus::Notice(format!("Role is already {}", state.role)));
                    return;
                }
                self.apply(RaceEvent::RoleSelected(role)).await;
            }
            EngineCommand::Connect(peer) => {
                if !state.role.is_assigned() {
                    self.status(EngineStatus::Error("Choose START LINE or FINISH LINE first".to_string()));
                    return;
                }
                // Only queues the dial; the outcome arrives as a transport event
                let peer = PeerId::new(peer.trim());
                if let Err(e) = self.transport.connect(&peer).await {
                    warn!("Failed to connect to {}: {}", peer, e);
                    self.status(EngineStatus::Error(format!("Could not connect to {}: {}", peer, e)));
                }
            }
            EngineCommand::CommitStart => {
                if state.role != Role::StartLine {
                    self.status(EngineStatus::Notice("Only the start line can start the race".to_string()));
                    return;
                }
                if !state.connection.is_open() {
                    self.status(EngineStatus::Error(TransportError::NotConnected.to_string()));
                    return;
                }
                self.apply(RaceEvent::OperatorCommit).await;
            }
            EngineCommand::AbortStart => self.apply(RaceEvent::OperatorAbort).await,
            EngineCommand::Stop => self.apply(RaceEvent::OperatorStop { at }).await,
            EngineCommand::RetryCamera => self.apply(RaceEvent::OperatorRetryCamera).await,
            EngineCommand::TestCue => self.play_cue(),
            EngineCommand::SaveRecording(dir) => self.save_recording(dir).await,
            EngineCommand::Shutdown => {}
        }
    }

    async fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened(id) => self.status(EngineStatus::PeerId(id.to_string())),
            TransportEvent::Connecting => self.apply(RaceEvent::TransportConnecting).await,
            TransportEvent::ConnectionEstablished(peer) => {
                self.status(EngineStatus::Notice(format!("Connected to {}", peer)));
                self.apply(RaceEvent::TransportOpened).await;
            }
            TransportEvent::ConnectionClosed => {
                self.status(EngineStatus::Notice("Connection closed".to_string()));
                self.apply(RaceEvent::TransportClosed).await;
            }
            TransportEvent::ConnectionErrored(reason) => self.apply(RaceEvent::TransportErrored(reason)).await,
            TransportEvent::Message(message) => {
                let at = Instant::now();
                self.apply(RaceEvent::MessageArrived { message, at }).await;
            }
        }
    }

    async fn on_capture(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Acquired => self.apply(RaceEvent::CaptureAcquired).await,
            CaptureEvent::AcquireFailed(e) => self.apply(RaceEvent::CaptureFailed(e.to_string())).await,
            CaptureEvent::RecordingStarted { media_type } => {
                self.status(EngineStatus::Recording(true));
                self.apply(RaceEvent::RecordingStarted { media_type }).await;
            }
            CaptureEvent::Chunk(chunk) => {
                if chunk.is_final {
                    self.status(EngineStatus::Recording(false));
                }
                self.apply(RaceEvent::CaptureChunk {
                    data: chunk.data,
                    is_final: chunk.is_final,
                })
                .await;
            }
            CaptureEvent::RecordingFailed(e) => {
                self.status(EngineStatus::Recording(false));
                self.apply(RaceEvent::RecordingFailed(e.to_string())).await;
            }
            CaptureEvent::Released => debug!("Camera released"),
        }
    }

    /// Feed one event through the machine and carry out what it asks for
    async fn apply(&mut self, event: RaceEvent) {
        let before = self.observe();
        let effects = self.machine.handle(event);
        for effect in effects {
            self.execute(effect).await;
        }
        self.publish(&before, false);
    }

    async fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::PlayCue => self.play_cue(),
            Effect::ScheduleLeadTime { attempt, delay } => self.countdown.schedule(attempt, delay),
            Effect::CancelLeadTime => {
                if self.countdown.cancel() {
                    info!("Countdown cancelled");
                }
            }
            Effect::StartTimer { zero } => {
                self.timer.start(zero);
                let elapsed_ms = self.timer.elapsed_ms(Instant::now());
                self.status(EngineStatus::Elapsed { elapsed_ms });
            }
            Effect::StopTimer { at } => {
                let elapsed = self.timer.stop(at);
                let elapsed_ms = elapsed.as_millis() as u64;
                info!("Race time {} ms", elapsed_ms);
                self.machine.handle(RaceEvent::TimerStopped { elapsed_ms });
                self.status(EngineStatus::Elapsed { elapsed_ms });
            }
            Effect::ResetTimer => {
                self.timer.reset();
                self.status(EngineStatus::Elapsed { elapsed_ms: 0 });
            }
            Effect::Send(message) => {
                if let Err(e) = self.transport.send(message).await {
                    warn!("Failed to send {:?}: {}", message, e);
                    self.status(EngineStatus::Error(e.to_string()));
                }
            }
            Effect::AcquireCamera => self.capture.acquire(self.settings.constraints.clone()),
            Effect::ReleaseCamera => self.capture.release(),
            Effect::StartRecording => {
                self.finalizer.reset();
                self.capture.start_recording();
            }
            Effect::StopRecording => self.capture.stop_recording(),
            Effect::StoreChunk(data) => self.finalizer.append(data),
            Effect::Finalize { media_type } => match self.finalizer.finalize(media_type.as_deref()) {
                Ok(artifact) => self.status(EngineStatus::ArtifactReady {
                    uri: artifact.uri(),
                    media_type: artifact.media_type.clone(),
                    size: artifact.human_size(),
                    chunks: artifact.chunk_count,
                }),
                Err(e) => {
                    warn!("Recording not finalized: {}", e);
                    self.status(EngineStatus::Error(e.to_string()));
                }
            },
            Effect::DiscardRecording => self.finalizer.reset(),
            Effect::Report(report) => self.report(report),
        }
    }

    fn play_cue(&mut self) {
        if let Err(e) = self.cue.play() {
            warn!("{}", e);
            self.status(EngineStatus::Error(e.to_string()));
        }
    }

    async fn save_recording(&mut self, dir: Option<PathBuf>) {
        let Some(artifact) = self.finalizer.artifact().cloned() else {
            self.status(EngineStatus::Error("No recording to save".to_string()));
            return;
        };
        let dir = dir.unwrap_or_else(|| self.settings.output_dir.clone());
        match artifact.save_to(&dir).await {
            Ok(path) => self.status(EngineStatus::ArtifactSaved(path)),
            Err(e) => {
                error!("{:#}", e);
                self.status(EngineStatus::Error(format!("{:#}", e)));
            }
        }
    }

    fn report(&self, report: Report) {
        let status = match report {
            Report::PeerArmed => EngineStatus::Notice("Start line armed, standing by".to_string()),
            Report::CameraUnavailable(reason) => EngineStatus::Error(format!("Camera unavailable: {}", reason)),
            Report::RecordingError(reason) => EngineStatus::Error(format!("Recording error: {}", reason)),
            Report::LinkError(reason) => EngineStatus::Error(format!("Connection error: {}", reason)),
            Report::StartAborted(reason) => EngineStatus::Notice(format!("Start aborted: {}", reason)),
        };
        self.status(status);
    }

    fn observe(&self) -> Observed {
        let state = self.machine.state();
        Observed {
            role: state.role,
            connection: state.connection,
            phase: state.phase,
            camera: state.camera,
        }
    }

    /// Announce whatever changed since `before` (everything when `all`)
    fn publish(&self, before: &Observed, all: bool) {
        let now = self.observe();
        if (all || now.role != before.role) && now.role.is_assigned() {
            self.status(EngineStatus::RoleSelected(now.role));
        }
        if all || now.connection != before.connection {
            self.status(EngineStatus::Connection(now.connection));
        }
        if all || now.phase != before.phase {
            info!("Phase: {} -> {}", before.phase, now.phase);
            self.status(EngineStatus::Phase(now.phase));
        }
        if now.camera != before.camera {
            self.status(EngineStatus::CameraReady(now.camera == CameraState::Ready));
        }
    }

    fn status(&self, status: EngineStatus) {
        let _ = self.status_tx.send(status);
    }
}

/// Create the channels used to drive the engine and observe it
pub fn create_engine_channels() -> (
    mpsc::Sender<EngineCommand>,
    mpsc::Receiver<EngineCommand>,
    broadcast::Sender<EngineStatus>,
    broadcast::Receiver<EngineStatus>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    // Clock samples arrive every tick; leave room for slow observers
    let (status_tx, status_rx) = broadcast::channel(256);
    (cmd_tx, cmd_rx, status_tx, status_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::ScriptedCamera;
    use crate::capture::{spawn_capture_worker, RecorderSettings, DEFAULT_PREFERRED_MEDIA_TYPES};
    use crate::cue::SilentCue;
    use crate::race::ProtocolMessage;
    use crate::transport::memory::MemoryTransport;
    use bytes::Bytes;
    use std::sync::atomic::Ordering;
    use tokio::sync::broadcast::error::RecvError;
    use tokio::task::JoinHandle;

    const LEAD_TIME: Duration = Duration::from_millis(12_700);

    struct Harness {
        cmd: mpsc::Sender<EngineCommand>,
        status: broadcast::Receiver<EngineStatus>,
        join: JoinHandle<Result<()>>,
    }

    fn spawn_engine(
        transport: MemoryTransport,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        camera: ScriptedCamera,
    ) -> Harness {
        let (capture_tx, capture_events) = mpsc::unbounded_channel();
        let recorder = RecorderSettings {
            preferred_media_types: DEFAULT_PREFERRED_MEDIA_TYPES.iter().map(|s| s.to_string()).collect(),
            chunk_interval: Duration::from_millis(1000),
        };
        let (capture, _worker) = spawn_capture_worker(camera, recorder, capture_tx);
        let (_cue_tx, cue_failures) = mpsc::unbounded_channel();

        let settings = EngineSettings {
            race: RaceSettings { lead_time: LEAD_TIME },
            tick_interval: Duration::from_millis(10),
            constraints: CaptureConstraints {
                video_device: "/dev/video0".to_string(),
                audio: true,
                audio_device: None,
            },
            output_dir: std::env::temp_dir(),
        };
        let io = EngineIo {
            transport: Box::new(transport),
            transport_events,
            capture,
            capture_events,
            cue: Box::new(SilentCue),
            cue_failures,
        };

        let (cmd, cmd_rx, status_tx, status) = create_engine_channels();
        let mut engine = RaceEngine::new(settings, io, cmd_rx, status_tx);
        let join = tokio::spawn(async move { engine.run().await });
        Harness { cmd, status, join }
    }

    /// Statuses up to and including the first one matching `wanted`
    async fn wait_for(
        rx: &mut broadcast::Receiver<EngineStatus>,
        wanted: impl Fn(&EngineStatus) -> bool,
    ) -> Vec<EngineStatus> {
        let mut seen = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(60), rx.recv()).await {
                Ok(Ok(status)) => {
                    let done = wanted(&status);
                    seen.push(status);
                    if done {
                        return seen;
                    }
                }
                Ok(Err(RecvError::Lagged(_))) => continue,
                Ok(Err(RecvError::Closed)) => panic!("engine status channel closed"),
                Err(_) => panic!("timed out; saw {:?}", seen),
            }
        }
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> ProtocolMessage {
        loop {
            match rx.recv().await {
                Some(TransportEvent::Message(message)) => return message,
                Some(_) => continue,
                None => panic!("peer channel closed"),
            }
        }
    }

    fn drain_messages(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<ProtocolMessage> {
        let mut messages = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TransportEvent::Message(message) = event {
                messages.push(message);
            }
        }
        messages
    }

    /// Engine in `role` linked to a bare transport the test drives directly
    async fn engine_with_peer(
        role: Role,
        camera: ScriptedCamera,
    ) -> (Harness, MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        engine_with_dial_delay(role, camera, Duration::ZERO).await
    }

    /// Like `engine_with_peer`, but dials made by the engine take `dial_delay`
    async fn engine_with_dial_delay(
        role: Role,
        camera: ScriptedCamera,
        dial_delay: Duration,
    ) -> (Harness, MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        let (engine_side, mut peer) = MemoryTransport::pair(engine_tx, peer_tx);
        let engine_side = engine_side.with_dial_delay(dial_delay);

        let mut harness = spawn_engine(engine_side, engine_rx, camera);
        harness.cmd.send(EngineCommand::SelectRole(role)).await.unwrap();
        wait_for(&mut harness.status, |s| *s == EngineStatus::RoleSelected(role)).await;

        peer.connect(&PeerId::new("memory-a")).await.unwrap();
        wait_for(&mut harness.status, |s| *s == EngineStatus::Phase(RacePhase::Connected)).await;
        drain_messages(&mut peer_rx);
        (harness, peer, peer_rx)
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn last_elapsed(statuses: &[EngineStatus]) -> Option<u64> {
        statuses.iter().rev().find_map(|s| match s {
            EngineStatus::Elapsed { elapsed_ms } => Some(*elapsed_ms),
            _ => None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fires_once_after_lead_time() {
        let (mut start, _peer, mut peer_rx) = engine_with_peer(Role::StartLine, ScriptedCamera::new(&[], Vec::new())).await;

        let committed_at = Instant::now();
        start.cmd.send(EngineCommand::CommitStart).await.unwrap();
        assert_eq!(next_message(&mut peer_rx).await, ProtocolMessage::Ready);

        wait_for(&mut start.status, |s| *s == EngineStatus::Phase(RacePhase::Running)).await;
        let started_after = Instant::now() - committed_at;
        assert!(started_after >= LEAD_TIME, "started after {:?}", started_after);
        assert!(started_after <= LEAD_TIME + Duration::from_millis(10));
        assert_eq!(next_message(&mut peer_rx).await, ProtocolMessage::Start);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        start.cmd.send(EngineCommand::Stop).await.unwrap();
        let seen = wait_for(&mut start.status, |s| *s == EngineStatus::Phase(RacePhase::Stopped)).await;

        // Zero instant is commit + lead time, so the clock reads the sleep
        let final_ms = last_elapsed(&seen).unwrap();
        assert!((1000..=1010).contains(&final_ms), "final time {} ms", final_ms);

        assert_eq!(next_message(&mut peer_rx).await, ProtocolMessage::Stop);
        assert!(drain_messages(&mut peer_rx).is_empty());

        start.cmd.send(EngineCommand::Shutdown).await.unwrap();
        start.join.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_cancels_countdown() {
        let (mut start, _peer, mut peer_rx) = engine_with_peer(Role::StartLine, ScriptedCamera::new(&[], Vec::new())).await;

        start.cmd.send(EngineCommand::CommitStart).await.unwrap();
        wait_for(&mut start.status, |s| *s == EngineStatus::Phase(RacePhase::Armed)).await;
        start.cmd.send(EngineCommand::AbortStart).await.unwrap();
        wait_for(&mut start.status, |s| *s == EngineStatus::Phase(RacePhase::Connected)).await;

        tokio::time::sleep(LEAD_TIME * 2).await;
        let sent = drain_messages(&mut peer_rx);
        assert_eq!(sent, vec![ProtocolMessage::Ready]);

        start.cmd.send(EngineCommand::Shutdown).await.unwrap();
        start.join.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_line_records_three_chunks() {
        let camera = ScriptedCamera::new(
            &["video/webm"],
            vec![
                Bytes::from_static(b"one"),
                Bytes::from_static(b"two"),
                Bytes::from_static(b"three"),
            ],
        );
        let (mut finish, mut peer, _peer_rx) = engine_with_peer(Role::FinishLine, camera).await;
        wait_for(&mut finish.status, |s| *s == EngineStatus::CameraReady(true)).await;

        peer.send(ProtocolMessage::Start).await.unwrap();
        wait_for(&mut finish.status, |s| *s == EngineStatus::Phase(RacePhase::Running)).await;
        wait_for(&mut finish.status, |s| *s == EngineStatus::Recording(true)).await;

        peer.send(ProtocolMessage::Stop).await.unwrap();
        let seen = wait_for(&mut finish.status, |s| matches!(s, EngineStatus::ArtifactReady { .. })).await;
        assert!(seen.contains(&EngineStatus::Phase(RacePhase::Stopped)));

        match seen.last() {
            Some(EngineStatus::ArtifactReady { media_type, chunks, uri, .. }) => {
                assert_eq!(*chunks, 3);
                assert_eq!(media_type, "video/webm");
                assert!(uri.starts_with("blob:race-timer/"));
            }
            other => panic!("unexpected {:?}", other),
        }

        // A repeated Start after stopping changes nothing
        peer.send(ProtocolMessage::Start).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let dir = tempfile::tempdir().unwrap();
        finish
            .cmd
            .send(EngineCommand::SaveRecording(Some(dir.path().to_path_buf())))
            .await
            .unwrap();
        let seen = wait_for(&mut finish.status, |s| matches!(s, EngineStatus::ArtifactSaved(_))).await;
        assert!(!seen.iter().any(|s| matches!(s, EngineStatus::Phase(_))));
        if let Some(EngineStatus::ArtifactSaved(path)) = seen.last() {
            assert_eq!(std::fs::read(path).unwrap(), b"onetwothree");
        }

        finish.cmd.send(EngineCommand::Shutdown).await.unwrap();
        finish.join.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_failure_blocks_start() {
        let (mut finish, mut peer, _peer_rx) = engine_with_peer(Role::FinishLine, ScriptedCamera::unavailable()).await;
        let seen = wait_for(&mut finish.status, |s| matches!(s, EngineStatus::Error(_))).await;
        match seen.last() {
            Some(EngineStatus::Error(message)) => assert!(message.starts_with("Camera unavailable")),
            other => panic!("unexpected {:?}", other),
        }

        peer.send(ProtocolMessage::Start).await.unwrap();
        let seen = wait_for(&mut finish.status, |s| matches!(s, EngineStatus::Error(_))).await;
        assert!(!seen.contains(&EngineStatus::Phase(RacePhase::Running)));

        finish.cmd.send(EngineCommand::Shutdown).await.unwrap();
        finish.join.await.unwrap().unwrap();
        while let Ok(status) = finish.status.try_recv() {
            assert_ne!(status, EngineStatus::Phase(RacePhase::Running));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_mid_race_keeps_clock_running() {
        let (mut start, peer, _peer_rx) = engine_with_peer(Role::StartLine, ScriptedCamera::new(&[], Vec::new())).await;

        start.cmd.send(EngineCommand::CommitStart).await.unwrap();
        wait_for(&mut start.status, |s| *s == EngineStatus::Phase(RacePhase::Running)).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        peer.sever();
        let seen = wait_for(&mut start.status, |s| *s == EngineStatus::Connection(ConnectionState::Closed)).await;
        assert!(!seen.iter().any(|s| matches!(s, EngineStatus::Phase(_))));

        tokio::time::sleep(Duration::from_millis(500)).await;
        let seen = wait_for(&mut start.status, |s| matches!(s, EngineStatus::Elapsed { .. })).await;
        assert!(last_elapsed(&seen).unwrap() >= 500);

        start.cmd.send(EngineCommand::Stop).await.unwrap();
        let seen = wait_for(&mut start.status, |s| *s == EngineStatus::Phase(RacePhase::Stopped)).await;
        assert!(seen.contains(&EngineStatus::Error("Not connected. Reconnect required.".to_string())));
        assert!(last_elapsed(&seen).unwrap() >= 1000);

        start.cmd.send(EngineCommand::Shutdown).await.unwrap();
        start.join.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_behind_slow_dial_keeps_its_time() {
        let (mut start, peer, _peer_rx) = engine_with_dial_delay(
            Role::StartLine,
            ScriptedCamera::new(&[], Vec::new()),
            Duration::from_secs(5),
        )
        .await;

        start.cmd.send(EngineCommand::CommitStart).await.unwrap();
        wait_for(&mut start.status, |s| *s == EngineStatus::Phase(RacePhase::Running)).await;
        tokio::time::sleep(Duration::from_millis(1000)).await;

        // Reconnect attempt queued right before the operator stops
        peer.sever();
        start.cmd.send(EngineCommand::Connect("unreachable".to_string())).await.unwrap();
        start.cmd.send(EngineCommand::Stop).await.unwrap();

        let seen = wait_for(&mut start.status, |s| *s == EngineStatus::Phase(RacePhase::Stopped)).await;
        let final_ms = last_elapsed(&seen).unwrap();
        assert!((1000..=1010).contains(&final_ms), "final time {} ms", final_ms);

        let seen = wait_for(&mut start.status, |s| {
            matches!(s, EngineStatus::Error(message) if message.starts_with("Connection error"))
        })
        .await;
        assert!(!seen.iter().any(|s| matches!(s, EngineStatus::Phase(RacePhase::Running))));

        start.cmd.send(EngineCommand::Shutdown).await.unwrap();
        start.join.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_armed_never_starts() {
        let (mut start, _peer, mut peer_rx) = engine_with_peer(Role::StartLine, ScriptedCamera::new(&[], Vec::new())).await;

        start.cmd.send(EngineCommand::CommitStart).await.unwrap();
        wait_for(&mut start.status, |s| *s == EngineStatus::Phase(RacePhase::Armed)).await;
        start.cmd.send(EngineCommand::Shutdown).await.unwrap();
        start.join.await.unwrap().unwrap();

        tokio::time::sleep(LEAD_TIME * 2).await;
        let events = drain_events(&mut peer_rx);
        assert!(events.contains(&TransportEvent::ConnectionClosed));
        let sent: Vec<_> = events
            .into_iter()
            .filter_map(|event| match event {
                TransportEvent::Message(message) => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(sent, vec![ProtocolMessage::Ready]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_mid_recording_releases_camera() {
        let camera = ScriptedCamera::new(&["video/webm"], vec![Bytes::from_static(b"frame")]);
        let released = camera.released_flag();
        let (mut finish, mut peer, mut peer_rx) = engine_with_peer(Role::FinishLine, camera).await;
        wait_for(&mut finish.status, |s| *s == EngineStatus::CameraReady(true)).await;

        peer.send(ProtocolMessage::Start).await.unwrap();
        wait_for(&mut finish.status, |s| *s == EngineStatus::Recording(true)).await;
        assert!(!released.load(Ordering::SeqCst));

        finish.cmd.send(EngineCommand::Shutdown).await.unwrap();
        finish.join.await.unwrap().unwrap();

        assert!(released.load(Ordering::SeqCst));
        assert!(drain_events(&mut peer_rx).contains(&TransportEvent::ConnectionClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_engines_race_end_to_end() {
        let (start_tx, start_rx) = mpsc::unbounded_channel();
        let (finish_tx, finish_rx) = mpsc::unbounded_channel();
        let (start_link, finish_link) = MemoryTransport::pair(start_tx, finish_tx);

        let mut start = spawn_engine(start_link, start_rx, ScriptedCamera::new(&[], Vec::new()));
        let camera = ScriptedCamera::new(&["video/mp4"], vec![Bytes::from_static(b"frame")]);
        let mut finish = spawn_engine(finish_link, finish_rx, camera);

        start.cmd.send(EngineCommand::SelectRole(Role::StartLine)).await.unwrap();
        finish.cmd.send(EngineCommand::SelectRole(Role::FinishLine)).await.unwrap();
        wait_for(&mut start.status, |s| *s == EngineStatus::RoleSelected(Role::StartLine)).await;
        wait_for(&mut finish.status, |s| *s == EngineStatus::RoleSelected(Role::FinishLine)).await;

        finish.cmd.send(EngineCommand::Connect("memory-a".to_string())).await.unwrap();
        wait_for(&mut start.status, |s| *s == EngineStatus::Phase(RacePhase::Connected)).await;
        wait_for(&mut finish.status, |s| *s == EngineStatus::CameraReady(true)).await;

        start.cmd.send(EngineCommand::CommitStart).await.unwrap();
        wait_for(&mut finish.status, |s| *s == EngineStatus::Phase(RacePhase::Running)).await;
        tokio::time::sleep(Duration::from_millis(2000)).await;

        // Stop at the finish line ends the clock at the start line too
        finish.cmd.send(EngineCommand::Stop).await.unwrap();
        let seen = wait_for(&mut start.status, |s| *s == EngineStatus::Phase(RacePhase::Stopped)).await;
        assert!(last_elapsed(&seen).unwrap() >= 2000);

        let seen = wait_for(&mut finish.status, |s| matches!(s, EngineStatus::ArtifactReady { .. })).await;
        assert!(matches!(
            seen.last(),
            Some(EngineStatus::ArtifactReady { chunks: 1, .. })
        ));

        for harness in [start, finish] {
            harness.cmd.send(EngineCommand::Shutdown).await.unwrap();
            harness.join.await.unwrap().unwrap();
        }
    }
}
