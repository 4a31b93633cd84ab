//! Capture worker
//!
//! Owns the backend and the acquired stream for the lifetime of a session.
//! The engine talks to it through a [`CaptureHandle`] and hears back through
//! [`CaptureEvent`]s, so slow camera work is never awaited inline.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    negotiate_media_type, CaptureBackend, CaptureChunk, CaptureConstraints, CaptureError,
    CaptureEvent, MediaStream,
};

/// Recorder parameters fixed for the worker's lifetime
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub preferred_media_types: Vec<String>,
    pub chunk_interval: Duration,
}

#[derive(Debug)]
enum CaptureCommand {
    Acquire(CaptureConstraints),
    StartRecording,
    StopRecording,
    Release,
    Shutdown(oneshot::Sender<()>),
}

/// Cheap handle to the capture worker
#[derive(Debug, Clone)]
pub struct CaptureHandle {
    tx: mpsc::UnboundedSender<CaptureCommand>,
}

impl CaptureHandle {
    pub fn acquire(&self, constraints: CaptureConstraints) {
        self.send(CaptureCommand::Acquire(constraints));
    }

    pub fn start_recording(&self) {
        self.send(CaptureCommand::StartRecording);
    }

    pub fn stop_recording(&self) {
        self.send(CaptureCommand::StopRecording);
    }

    pub fn release(&self) {
        self.send(CaptureCommand::Release);
    }

    /// Stop any recording, release the camera and end the worker. Resolves
    /// once the camera is released.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(CaptureCommand::Shutdown(ack_tx));
        let _ = ack_rx.await;
    }

    fn send(&self, command: CaptureCommand) {
        if let Err(e) = self.tx.send(command) {
            warn!("Capture worker is gone, dropping {:?}", e.0);
        }
    }
}

struct CaptureWorker<B> {
    backend: B,
    settings: RecorderSettings,
    events: mpsc::UnboundedSender<CaptureEvent>,
    stream: Option<MediaStream>,
    recording: bool,
    /// Stop sent, final chunk not yet seen
    draining: bool,
    /// Start asked for while the previous recording was draining
    start_queued: bool,
    chunk_tx: mpsc::Sender<CaptureChunk>,
}

/// Spawn the worker for `backend`.
pub fn spawn_capture_worker<B: CaptureBackend>(
    backend: B,
    settings: RecorderSettings,
    events: mpsc::UnboundedSender<CaptureEvent>,
) -> (CaptureHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (chunk_tx, chunk_rx) = mpsc::channel(64);

    let worker = CaptureWorker {
        backend,
        settings,
        events,
        stream: None,
        recording: false,
        draining: false,
        start_queued: false,
        chunk_tx,
    };
    let handle = tokio::spawn(worker.run(rx, chunk_rx));

    (CaptureHandle { tx }, handle)
}

impl<B: CaptureBackend> CaptureWorker<B> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<CaptureCommand>,
        mut chunks: mpsc::Receiver<CaptureChunk>,
    ) {
        info!("Capture worker started ({})", self.backend.name());

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.teardown().await;
                        break;
                    };
                    if let CaptureCommand::Shutdown(ack) = command {
                        self.teardown().await;
                        let _ = ack.send(());
                        break;
                    }
                    self.apply(command).await;
                }

                Some(chunk) = chunks.recv() => {
                    let is_final = chunk.is_final;
                    if is_final {
                        debug!("Recorder drained");
                        self.recording = false;
                        self.draining = false;
                    }
                    self.emit(CaptureEvent::Chunk(chunk));
                    if is_final && std::mem::take(&mut self.start_queued) {
                        self.start().await;
                    }
                }
            }
        }

        info!("Capture worker stopped");
    }

    async fn apply(&mut self, command: CaptureCommand) {
        match command {
            CaptureCommand::Acquire(constraints) => {
                if self.stream.is_some() {
                    debug!("Camera already acquired");
                    self.emit(CaptureEvent::Acquired);
                    return;
                }
                match self.backend.acquire(&constraints).await {
                    Ok(stream) => {
                        info!("Camera acquired: {}", stream.video_device);
                        self.stream = Some(stream);
                        self.emit(CaptureEvent::Acquired);
                    }
                    Err(e) => {
                        error!("Camera acquisition failed: {}", e);
                        self.emit(CaptureEvent::AcquireFailed(e));
                    }
                }
            }
            CaptureCommand::StartRecording => {
                if self.draining {
                    // One recorder at a time: begin once the previous one drained
                    debug!("Previous recording still draining; start queued");
                    self.start_queued = true;
                    return;
                }
                if self.recording {
                    self.emit(CaptureEvent::RecordingFailed(CaptureError::AlreadyRecording));
                    return;
                }
                self.start().await;
            }
            CaptureCommand::StopRecording => {
                if !self.recording || self.draining {
                    debug!("Stop requested with no recording running");
                    return;
                }
                match self.backend.stop_recording().await {
                    Ok(()) => self.draining = true,
                    Err(e) => {
                        error!("Failed to stop recording: {}", e);
                        self.recording = false;
                        self.emit(CaptureEvent::RecordingFailed(e));
                    }
                }
            }
            CaptureCommand::Release => self.release().await,
            CaptureCommand::Shutdown(_) => {}
        }
    }

    async fn start(&mut self) {
        let Some(stream) = self.stream.as_ref() else {
            self.emit(CaptureEvent::RecordingFailed(CaptureError::NotAcquired));
            return;
        };

        let backend = &mut self.backend;
        let negotiated = negotiate_media_type(&self.settings.preferred_media_types, |t| {
            backend.supports(t)
        })
        .map(str::to_owned);
        if negotiated.is_none() {
            warn!("No preferred encoding supported; using the recorder default");
        }

        let started = backend
            .start_recording(
                stream,
                negotiated.as_deref(),
                self.settings.chunk_interval,
                self.chunk_tx.clone(),
            )
            .await;
        match started {
            Ok(media_type) => {
                self.recording = true;
                self.emit(CaptureEvent::RecordingStarted { media_type });
            }
            Err(e) => {
                error!("Failed to start recording: {}", e);
                self.emit(CaptureEvent::RecordingFailed(e));
            }
        }
    }

    async fn release(&mut self) {
        self.start_queued = false;
        if let Some(stream) = self.stream.take() {
            info!("Releasing camera {}", stream.video_device);
            self.backend.release(stream).await;
            self.recording = false;
            self.draining = false;
            self.emit(CaptureEvent::Released);
        }
    }

    async fn teardown(&mut self) {
        if self.recording && !self.draining {
            if let Err(e) = self.backend.stop_recording().await {
                warn!("Failed to stop recording during teardown: {}", e);
            }
        }
        self.release().await;
    }

    fn emit(&self, event: CaptureEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::ScriptedCamera;
    use bytes::Bytes;

    fn settings() -> RecorderSettings {
        RecorderSettings {
            preferred_media_types: vec!["video/webm;codecs=vp9,opus".to_string(), "video/mp4".to_string()],
            chunk_interval: Duration::from_millis(1000),
        }
    }

    fn constraints() -> CaptureConstraints {
        CaptureConstraints {
            video_device: "/dev/video0".to_string(),
            audio: true,
            audio_device: None,
        }
    }

    #[tokio::test]
    async fn test_records_negotiated_type_and_drains() {
        let camera = ScriptedCamera::new(&["video/mp4"], vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (handle, _join) = spawn_capture_worker(camera, settings(), events_tx);

        handle.acquire(constraints());
        assert!(matches!(events.recv().await, Some(CaptureEvent::Acquired)));

        handle.start_recording();
        match events.recv().await {
            Some(CaptureEvent::RecordingStarted { media_type }) => assert_eq!(media_type, "video/mp4"),
            other => panic!("unexpected event {:?}", other),
        }

        handle.stop_recording();
        let mut chunks = Vec::new();
        while let Some(event) = events.recv().await {
            if let CaptureEvent::Chunk(chunk) = event {
                let last = chunk.is_final;
                chunks.push(chunk);
                if last {
                    break;
                }
            }
        }
        assert_eq!(chunks.len(), 3);
        assert!(chunks[2].is_final);
        assert!(chunks[2].data.is_empty());
    }

    #[tokio::test]
    async fn test_falls_back_to_backend_default() {
        let camera = ScriptedCamera::new(&[], Vec::new());
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (handle, _join) = spawn_capture_worker(camera, settings(), events_tx);

        handle.acquire(constraints());
        events.recv().await;
        handle.start_recording();
        match events.recv().await {
            Some(CaptureEvent::RecordingStarted { media_type }) => {
                assert_eq!(media_type, ScriptedCamera::DEFAULT_MEDIA_TYPE)
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_acquire_failure_is_reported() {
        let camera = ScriptedCamera::unavailable();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (handle, _join) = spawn_capture_worker(camera, settings(), events_tx);

        handle.acquire(constraints());
        assert!(matches!(
            events.recv().await,
            Some(CaptureEvent::AcquireFailed(CaptureError::NoDevice(_)))
        ));

        handle.start_recording();
        assert!(matches!(
            events.recv().await,
            Some(CaptureEvent::RecordingFailed(CaptureError::NotAcquired))
        ));
    }

    #[tokio::test]
    async fn test_start_during_drain_waits_for_final_chunk() {
        let camera = ScriptedCamera::new(&["video/webm"], vec![Bytes::from_static(b"a")]);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (handle, _join) = spawn_capture_worker(camera, settings(), events_tx);

        handle.acquire(constraints());
        events.recv().await;
        handle.start_recording();

        // Stop and the next start arrive back to back
        handle.stop_recording();
        handle.start_recording();

        let mut seen = Vec::new();
        while seen.len() < 5 {
            match events.recv().await {
                Some(CaptureEvent::RecordingStarted { .. }) => seen.push("started"),
                Some(CaptureEvent::Chunk(chunk)) if chunk.is_final => seen.push("final"),
                Some(CaptureEvent::Chunk(_)) => seen.push("chunk"),
                Some(CaptureEvent::RecordingFailed(e)) => panic!("recording failed: {}", e),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(seen, vec!["started", "chunk", "final", "started", "chunk"]);
    }

    #[tokio::test]
    async fn test_release_then_reacquire() {
        let camera = ScriptedCamera::new(&[], Vec::new());
        let released = camera.released_flag();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (handle, _join) = spawn_capture_worker(camera, settings(), events_tx);

        handle.acquire(constraints());
        assert!(matches!(events.recv().await, Some(CaptureEvent::Acquired)));
        handle.release();
        assert!(matches!(events.recv().await, Some(CaptureEvent::Released)));
        assert!(released.load(std::sync::atomic::Ordering::SeqCst));

        handle.start_recording();
        assert!(matches!(
            events.recv().await,
            Some(CaptureEvent::RecordingFailed(CaptureError::NotAcquired))
        ));
        handle.acquire(constraints());
        assert!(matches!(events.recv().await, Some(CaptureEvent::Acquired)));
        assert!(!released.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_releases_camera() {
        let camera = ScriptedCamera::new(&["video/webm;codecs=vp9,opus"], Vec::new());
        let released = camera.released_flag();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (handle, join) = spawn_capture_worker(camera, settings(), events_tx);

        handle.acquire(constraints());
        events.recv().await;
        handle.start_recording();
        events.recv().await;

        handle.shutdown().await;
        join.await.unwrap();
        assert!(released.load(std::sync::atomic::Ordering::SeqCst));
    }
}
