//! ffmpeg-backed camera
//!
//! The camera is read by an ffmpeg child process that encodes to a streamable
//! container on stdout. Output is sliced into chunks on a fixed interval; when
//! ffmpeg exits the remainder goes out as the final chunk.

use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{CaptureBackend, CaptureChunk, CaptureConstraints, CaptureError, MediaStream};

/// Produced when no preferred encoding is available
const FALLBACK_MEDIA_TYPE: &str = "video/x-matroska";

const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct FfmpegSettings {
    pub ffmpeg_path: String,
    /// Demuxer for the video device (`v4l2`, `avfoundation`, `dshow`)
    pub input_format: String,
    /// Demuxer for a separate audio device
    pub audio_input_format: String,
}

impl Default for FfmpegSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            input_format: default_input_format().to_string(),
            audio_input_format: "pulse".to_string(),
        }
    }
}

pub fn default_input_format() -> &'static str {
    if cfg!(target_os = "macos") {
        "avfoundation"
    } else if cfg!(target_os = "windows") {
        "dshow"
    } else {
        "v4l2"
    }
}

struct EncodingProfile {
    media_type: &'static str,
    video_codec: &'static str,
    audio_codec: &'static str,
    container: &'static str,
    extra: &'static [&'static str],
}

const PROFILES: &[EncodingProfile] = &[
    EncodingProfile {
        media_type: "video/webm;codecs=vp9,opus",
        video_codec: "libvpx-vp9",
        audio_codec: "libopus",
        container: "webm",
        extra: &["-deadline", "realtime", "-cpu-used", "8"],
    },
    EncodingProfile {
        media_type: "video/webm",
        video_codec: "libvpx",
        audio_codec: "libopus",
        container: "webm",
        extra: &["-deadline", "realtime"],
    },
    EncodingProfile {
        media_type: "video/mp4",
        video_codec: "libx264",
        audio_codec: "aac",
        container: "mp4",
        extra: &["-preset", "veryfast", "-movflags", "frag_keyframe+empty_moov"],
    },
];

static FALLBACK_PROFILE: EncodingProfile = EncodingProfile {
    media_type: FALLBACK_MEDIA_TYPE,
    video_codec: "mpeg4",
    audio_codec: "aac",
    container: "matroska",
    extra: &[],
};

fn profile_for(media_type: &str) -> Option<&'static EncodingProfile> {
    PROFILES.iter().find(|p| p.media_type == media_type)
}

/// Encoder names from `ffmpeg -encoders` output
fn parse_encoders(listing: &str) -> HashSet<String> {
    listing
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_owned)
        .collect()
}

fn recording_args(settings: &FfmpegSettings, stream: &MediaStream, profile: &EncodingProfile) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];

    args.extend(["-f".to_string(), settings.input_format.clone()]);
    args.extend(["-i".to_string(), stream.video_device.clone()]);

    if stream.audio {
        if let Some(audio_device) = &stream.audio_device {
            args.extend(["-f".to_string(), settings.audio_input_format.clone()]);
            args.extend(["-i".to_string(), audio_device.clone()]);
        }
    }

    args.extend(["-c:v".to_string(), profile.video_codec.to_string()]);
    args.extend(profile.extra.iter().map(|s| s.to_string()));

    if stream.audio {
        args.extend(["-c:a".to_string(), profile.audio_codec.to_string()]);
    } else {
        args.push("-an".to_string());
    }

    args.extend(["-f".to_string(), profile.container.to_string(), "pipe:1".to_string()]);
    args
}

struct ActiveRecording {
    child: Child,
    reader: JoinHandle<()>,
}

pub struct FfmpegCamera {
    settings: FfmpegSettings,
    encoders: HashSet<String>,
    recording: Option<ActiveRecording>,
}

impl FfmpegCamera {
    pub fn new(settings: FfmpegSettings) -> Self {
        Self {
            settings,
            encoders: HashSet::new(),
            recording: None,
        }
    }

    async fn check_device(device: &str) -> Result<(), CaptureError> {
        if !device.starts_with("/dev/") {
            return Ok(());
        }
        match tokio::fs::OpenOptions::new().read(true).open(Path::new(device)).await {
            Ok(_) => Ok(()),
            Err(e) => match e.kind() {
                std::io::ErrorKind::NotFound => Err(CaptureError::NoDevice(device.to_string())),
                std::io::ErrorKind::PermissionDenied => Err(CaptureError::PermissionDenied(device.to_string())),
                _ => Err(CaptureError::Io(e)),
            },
        }
    }

    async fn list_encoders(&self) -> Result<HashSet<String>, CaptureError> {
        let output = Command::new(&self.settings.ffmpeg_path)
            .args(["-hide_banner", "-encoders"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| CaptureError::Recorder(format!("failed to run {}: {}", self.settings.ffmpeg_path, e)))?;

        if !output.status.success() {
            return Err(CaptureError::Recorder(format!(
                "{} -encoders exited with {}",
                self.settings.ffmpeg_path, output.status
            )));
        }
        Ok(parse_encoders(&String::from_utf8_lossy(&output.stdout)))
    }

    fn profile_available(&self, profile: &EncodingProfile) -> bool {
        self.encoders.contains(profile.video_codec) && self.encoders.contains(profile.audio_codec)
    }

    async fn kill(recording: &mut ActiveRecording) {
        if let Err(e) = recording.child.kill().await {
            debug!("ffmpeg already gone: {}", e);
        }
    }
}

#[async_trait]
impl CaptureBackend for FfmpegCamera {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn supports(&self, media_type: &str) -> bool {
        profile_for(media_type)
            .map(|p| self.profile_available(p))
            .unwrap_or(false)
    }

    async fn acquire(&mut self, constraints: &CaptureConstraints) -> Result<MediaStream, CaptureError> {
        Self::check_device(&constraints.video_device).await?;
        if let (true, Some(audio_device)) = (constraints.audio, constraints.audio_device.as_deref()) {
            Self::check_device(audio_device).await?;
        }

        self.encoders = self.list_encoders().await?;
        debug!("ffmpeg offers {} encoders", self.encoders.len());

        Ok(MediaStream {
            video_device: constraints.video_device.clone(),
            audio: constraints.audio,
            audio_device: constraints.audio_device.clone(),
        })
    }

    async fn start_recording(
        &mut self,
        stream: &MediaStream,
        media_type: Option<&str>,
        chunk_interval: Duration,
        chunks: mpsc::Sender<CaptureChunk>,
    ) -> Result<String, CaptureError> {
        if self.recording.is_some() {
            return Err(CaptureError::AlreadyRecording);
        }

        let profile = match media_type {
            Some(media_type) => match profile_for(media_type) {
                Some(profile) if self.profile_available(profile) => profile,
                _ => return Err(CaptureError::Unsupported(media_type.to_string())),
            },
            None => &FALLBACK_PROFILE,
        };
        let args = recording_args(&self.settings, stream, profile);
        info!("Starting ffmpeg recording as {}", profile.media_type);
        debug!("ffmpeg args: {:?}", args);

        let mut child = Command::new(&self.settings.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CaptureError::Recorder(format!("failed to spawn {}: {}", self.settings.ffmpeg_path, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Recorder("ffmpeg stdout unavailable".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        warn!("ffmpeg: {}", line);
                    }
                }
            });
        }

        let reader = tokio::spawn(pump_chunks(stdout, chunks, chunk_interval));
        self.recording = Some(ActiveRecording { child, reader });

        Ok(profile.media_type.to_string())
    }

    async fn stop_recording(&mut self) -> Result<(), CaptureError> {
        let Some(mut recording) = self.recording.take() else {
            return Ok(());
        };

        // ffmpeg finishes the container cleanly on `q`
        if let Some(mut stdin) = recording.child.stdin.take() {
            if let Err(e) = stdin.write_all(b"q").await {
                warn!("Failed to ask ffmpeg to stop: {}", e);
            }
        }

        match tokio::time::timeout(STOP_GRACE, recording.child.wait()).await {
            Ok(Ok(status)) => info!("ffmpeg exited with {}", status),
            Ok(Err(e)) => warn!("Failed to wait for ffmpeg: {}", e),
            Err(_) => {
                warn!("ffmpeg did not stop within {:?}, killing it", STOP_GRACE);
                Self::kill(&mut recording).await;
            }
        }

        // Reader sends the final chunk on EOF
        drop(recording.reader);
        Ok(())
    }

    async fn release(&mut self, stream: MediaStream) {
        if let Some(mut recording) = self.recording.take() {
            warn!("Releasing {} while recording; killing ffmpeg", stream.video_device);
            Self::kill(&mut recording).await;
        }
        self.encoders.clear();
    }
}

async fn pump_chunks(mut stdout: ChildStdout, chunks: mpsc::Sender<CaptureChunk>, interval: Duration) {
    let mut buf = BytesMut::with_capacity(64 * 1024);
    let mut flush = tokio::time::interval(interval);
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    flush.tick().await;

    let mut total = 0u64;
    loop {
        buf.reserve(16 * 1024);
        tokio::select! {
            read = stdout.read_buf(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => total += n as u64,
                Err(e) => {
                    error!("Error reading ffmpeg output: {}", e);
                    break;
                }
            },
            _ = flush.tick() => {
                if buf.is_empty() {
                    continue;
                }
                let chunk = CaptureChunk { data: buf.split().freeze(), is_final: false };
                if chunks.send(chunk).await.is_err() {
                    info!("Chunk receiver dropped, stopping capture reader");
                    return;
                }
            }
        }
    }

    let last = CaptureChunk {
        data: buf.split().freeze(),
        is_final: true,
    };
    if chunks.send(last).await.is_err() {
        debug!("Chunk receiver dropped before the final chunk");
    }
    info!("Recording output finished: {} bytes", total);
}
