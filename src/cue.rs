//! Start cue playback
//!
//! The cue is the recorded "on your marks" sequence; its length is the race
//! lead time. Playback runs in the background and never holds up the
//! countdown.

use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CueError {
    #[error("Audio playback failed: {0}")]
    Playback(String),
}

pub trait AudioCue: Send {
    /// Start playing. Failures arrive later on the channel the cue was built
    /// with; only a failure to launch is returned here.
    fn play(&self) -> Result<(), CueError>;
}

/// Plays the cue file through an external player (`paplay`, `afplay`, ...)
pub struct CommandCue {
    program: String,
    args: Vec<String>,
    file: PathBuf,
    failures: mpsc::UnboundedSender<CueError>,
}

impl CommandCue {
    /// `argv` is the player and its options; the file is appended last.
    /// Returns `None` for an empty `argv`.
    pub fn new(argv: &[String], file: PathBuf, failures: mpsc::UnboundedSender<CueError>) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        if program.trim().is_empty() {
            return None;
        }
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            file,
            failures,
        })
    }
}

impl AudioCue for CommandCue {
    fn play(&self) -> Result<(), CueError> {
        debug!("Playing cue {:?} with {}", self.file, self.program);
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&self.file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CueError::Playback(format!("{}: {}", self.program, e)))?;

        let failures = self.failures.clone();
        let program = self.program.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => debug!("Cue finished"),
                Ok(status) => {
                    warn!("Cue player exited with {}", status);
                    let _ = failures.send(CueError::Playback(format!("{} exited with {}", program, status)));
                }
                Err(e) => {
                    let _ = failures.send(CueError::Playback(e.to_string()));
                }
            }
        });
        Ok(())
    }
}

/// Used when no player is configured
pub struct SilentCue;

impl AudioCue for SilentCue {
    fn play(&self) -> Result<(), CueError> {
        info!("Start cue (silent: no player configured)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_command_means_no_cue() {
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(CommandCue::new(&[], PathBuf::from("cue.mp3"), tx.clone()).is_none());
        assert!(CommandCue::new(&argv(&[" "]), PathBuf::from("cue.mp3"), tx).is_none());
    }

    #[test]
    fn test_command_is_split_into_program_and_args() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cue = CommandCue::new(&argv(&["ffplay", "-nodisp", "-autoexit"]), PathBuf::from("cue.mp3"), tx).unwrap();
        assert_eq!(cue.program, "ffplay");
        assert_eq!(cue.args, vec!["-nodisp".to_string(), "-autoexit".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_player_fails_to_launch() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cue = CommandCue::new(&argv(&["race-timer-no-such-player"]), PathBuf::from("cue.mp3"), tx).unwrap();
        let err = cue.play().unwrap_err();
        assert!(err.to_string().starts_with("Audio playback failed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_player_is_reported_later() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cue = CommandCue::new(&argv(&["false"]), PathBuf::from("cue.mp3"), tx).unwrap();
        cue.play().unwrap();
        assert!(matches!(rx.recv().await, Some(CueError::Playback(_))));
    }
}
