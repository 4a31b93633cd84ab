//! Finish-line camera capture
//!
//! The camera is reached through a [`CaptureBackend`] (ffmpeg in production)
//! driven by a worker task, so acquisition and recording never block the race
//! engine. Completion of every request comes back as a [`CaptureEvent`].

mod backend;
mod ffmpeg;
mod worker;

#[cfg(test)]
pub mod testing;

pub use backend::CaptureBackend;
pub use ffmpeg::{default_input_format, FfmpegCamera, FfmpegSettings};
pub use worker::{spawn_capture_worker, CaptureHandle, RecorderSettings};

use bytes::Bytes;
use thiserror::Error;

/// Priority-ordered encodings tried when a recording starts
pub const DEFAULT_PREFERRED_MEDIA_TYPES: &[&str] =
    &["video/webm;codecs=vp9,opus", "video/webm", "video/mp4"];

/// What the operator asked the camera for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    /// Video device (a path such as `/dev/video0`, or a platform index)
    pub video_device: String,
    /// Record sound along with the video
    pub audio: bool,
    /// Separate audio device; `None` when audio comes with the video input
    pub audio_device: Option<String>,
}

/// A camera that has been validated and is held for this session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub video_device: String,
    pub audio: bool,
    pub audio_device: Option<String>,
}

/// One slice of recorder output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureChunk {
    pub data: Bytes,
    /// Last chunk of the recording; the stream is drained after it
    pub is_final: bool,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no capture device at {0}")]
    NoDevice(String),

    #[error("permission denied opening {0}")]
    PermissionDenied(String),

    #[error("camera has not been acquired")]
    NotAcquired,

    #[error("cannot record {0}")]
    Unsupported(String),

    #[error("a recording is already in progress")]
    AlreadyRecording,

    #[error("recorder failed: {0}")]
    Recorder(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Notifications from the capture worker
#[derive(Debug)]
pub enum CaptureEvent {
    Acquired,
    AcquireFailed(CaptureError),
    RecordingStarted { media_type: String },
    Chunk(CaptureChunk),
    RecordingFailed(CaptureError),
    Released,
}

/// Pick the first preferred encoding the backend supports. `None` means the
/// backend falls back to its own default container.
pub fn negotiate_media_type<'a, S, F>(preferred: &'a [S], supports: F) -> Option<&'a str>
where
    S: AsRef<str>,
    F: Fn(&str) -> bool,
{
    for media_type in preferred {
        let media_type: &'a str = media_type.as_ref();
        if supports(media_type) {
            return Some(media_type);
        }
    }
    None
}
