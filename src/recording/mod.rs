//! Finished recordings
//!
//! Chunks from the finish-line camera are collected by a
//! [`RecordingFinalizer`] and turned into a single artifact once the
//! recorder has drained.

mod finalizer;

pub use finalizer::RecordingFinalizer;

/// Used when the recorder never reported what it produced
pub const FALLBACK_MEDIA_TYPE: &str = "video/webm";

/// File extension for a container media type
pub fn extension_for(media_type: &str) -> &'static str {
    let essence = media_type.split(';').next().unwrap_or("").trim();
    match essence {
        "video/webm" | "audio/webm" => "webm",
        "video/mp4" => "mp4",
        "video/x-matroska" => "mkv",
        "video/ogg" => "ogv",
        _ => "bin",
    }
}
