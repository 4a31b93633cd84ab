//! In-memory camera for tests

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{CaptureBackend, CaptureChunk, CaptureConstraints, CaptureError, MediaStream};

/// Replays a fixed list of chunks when recording starts and a final empty
/// chunk when it stops.
pub struct ScriptedCamera {
    supported: Vec<String>,
    script: Vec<Bytes>,
    available: bool,
    sink: Option<mpsc::Sender<CaptureChunk>>,
    released: Arc<AtomicBool>,
}

impl ScriptedCamera {
    pub const DEFAULT_MEDIA_TYPE: &'static str = "video/x-matroska";

    pub fn new(supported: &[&str], script: Vec<Bytes>) -> Self {
        Self {
            supported: supported.iter().map(|s| s.to_string()).collect(),
            script,
            available: true,
            sink: None,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A camera whose acquisition always fails
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(&[], Vec::new())
        }
    }

    pub fn released_flag(&self) -> Arc<AtomicBool> {
        self.released.clone()
    }
}

#[async_trait]
impl CaptureBackend for ScriptedCamera {
    fn name(&self) -> &str {
        "scripted"
    }

    fn supports(&self, media_type: &str) -> bool {
        self.supported.iter().any(|t| t == media_type)
    }

    async fn acquire(&mut self, constraints: &CaptureConstraints) -> Result<MediaStream, CaptureError> {
        if !self.available {
            return Err(CaptureError::NoDevice(constraints.video_device.clone()));
        }
        self.released.store(false, Ordering::SeqCst);
        Ok(MediaStream {
            video_device: constraints.video_device.clone(),
            audio: constraints.audio,
            audio_device: constraints.audio_device.clone(),
        })
    }

    async fn start_recording(
        &mut self,
        _stream: &MediaStream,
        media_type: Option<&str>,
        _chunk_interval: Duration,
        chunks: mpsc::Sender<CaptureChunk>,
    ) -> Result<String, CaptureError> {
        for data in &self.script {
            let chunk = CaptureChunk {
                data: data.clone(),
                is_final: false,
            };
            chunks
                .send(chunk)
                .await
                .map_err(|_| CaptureError::Recorder("chunk channel closed".to_string()))?;
        }
        self.sink = Some(chunks);
        Ok(media_type.unwrap_or(Self::DEFAULT_MEDIA_TYPE).to_string())
    }

    async fn stop_recording(&mut self) -> Result<(), CaptureError> {
        let Some(sink) = self.sink.take() else {
            return Err(CaptureError::Recorder("not recording".to_string()));
        };
        let last = CaptureChunk {
            data: Bytes::new(),
            is_final: true,
        };
        sink.send(last)
            .await
            .map_err(|_| CaptureError::Recorder("chunk channel closed".to_string()))
    }

    async fn release(&mut self, _stream: MediaStream) {
        self.sink = None;
        self.released.store(true, Ordering::SeqCst);
    }
}
