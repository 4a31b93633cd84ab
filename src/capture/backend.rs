//! Capture backend trait

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{CaptureChunk, CaptureConstraints, CaptureError, MediaStream};

/// A camera plus a recorder that yields its output as chunks
#[async_trait]
pub trait CaptureBackend: Send + 'static {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Whether the recorder can produce `media_type`. Only meaningful after a
    /// successful `acquire`.
    fn supports(&self, media_type: &str) -> bool;

    /// Validate and reserve the camera.
    async fn acquire(&mut self, constraints: &CaptureConstraints) -> Result<MediaStream, CaptureError>;

    /// Start recording `stream`. Chunks are delivered on `chunks` roughly every
    /// `chunk_interval` until the recording ends; the last one is marked final.
    /// `media_type` is `None` when no preferred encoding is supported.
    ///
    /// Returns the media type actually produced.
    async fn start_recording(
        &mut self,
        stream: &MediaStream,
        media_type: Option<&str>,
        chunk_interval: Duration,
        chunks: mpsc::Sender<CaptureChunk>,
    ) -> Result<String, CaptureError>;

    /// Ask the recorder to finish. The final chunk follows asynchronously.
    async fn stop_recording(&mut self) -> Result<(), CaptureError>;

    /// Give the camera back. Any recording still running is killed.
    async fn release(&mut self, stream: MediaStream);
}
