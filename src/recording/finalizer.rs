//! Chunk collection and artifact assembly

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::{extension_for, FALLBACK_MEDIA_TYPE};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FinalizeError {
    #[error("no video data was captured")]
    EmptyCapture,
}

/// A finished recording held in memory
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub id: Uuid,
    pub media_type: String,
    pub data: Bytes,
    pub chunk_count: usize,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Reference handed to the operator
    pub fn uri(&self) -> String {
        format!("blob:race-timer/{}", self.id)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Size in megabytes, e.g. "1.23 MB"
    pub fn human_size(&self) -> String {
        format!("{:.2} MB", self.size() as f64 / 1024.0 / 1024.0)
    }

    /// Download name: `race-recording-<timestamp>.<ext>`
    pub fn file_name(&self) -> String {
        // RFC 3339 with ':' swapped out so the name is valid everywhere
        let stamp = self.created_at.format("%Y-%m-%dT%H-%M-%S%.3fZ");
        format!("race-recording-{}.{}", stamp, extension_for(&self.media_type))
    }

    /// Write the recording into `dir`, creating it if needed.
    pub async fn save_to(&self, dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {:?}", dir))?;

        let path = dir.join(self.file_name());
        tokio::fs::write(&path, &self.data)
            .await
            .with_context(|| format!("Failed to write {:?}", path))?;

        info!("Saved recording to {:?} ({})", path, self.human_size());
        Ok(path)
    }
}

/// Collects the chunks of one recording
#[derive(Debug, Default)]
pub struct RecordingFinalizer {
    chunks: Vec<Bytes>,
    artifact: Option<Artifact>,
}

impl RecordingFinalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, chunk: Bytes) {
        if self.artifact.is_some() {
            debug!("Recording already finalized, dropping {} byte chunk", chunk.len());
            return;
        }
        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }
    }

    /// Assemble the artifact. A second call returns the first artifact.
    pub fn finalize(&mut self, media_type: Option<&str>) -> Result<Artifact, FinalizeError> {
        if let Some(artifact) = &self.artifact {
            return Ok(artifact.clone());
        }
        if self.chunks.is_empty() {
            return Err(FinalizeError::EmptyCapture);
        }

        let total = self.chunks.iter().map(Bytes::len).sum();
        let mut data = BytesMut::with_capacity(total);
        for chunk in &self.chunks {
            data.extend_from_slice(chunk);
        }

        let artifact = Artifact {
            id: Uuid::new_v4(),
            media_type: media_type.unwrap_or(FALLBACK_MEDIA_TYPE).to_string(),
            data: data.freeze(),
            chunk_count: self.chunks.len(),
            created_at: Utc::now(),
        };
        info!(
            "Recording finalized: {} chunks, {} ({})",
            artifact.chunk_count,
            artifact.human_size(),
            artifact.media_type
        );
        self.chunks.clear();
        self.artifact = Some(artifact.clone());
        Ok(artifact)
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        self.artifact.as_ref()
    }

    /// Forget collected chunks and any artifact, ready for the next attempt.
    pub fn reset(&mut self) {
        self.chunks.clear();
        self.artifact = None;
    }
}
