//! Terminal operator console
//!
//! Reads operator commands from stdin and prints engine status as it changes.
//! The race clock is printed at most once per refresh while running, and
//! exactly once when it stops.

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::race::{ConnectionState, RacePhase, Role};
use crate::sync::{EngineCommand, EngineStatus};

const REFRESH: Duration = Duration::from_secs(1);

const HELP: &str = "\
Commands:
  start | finish     choose this device's role
  connect <id>       connect to the other device
  go                 play the cue and start after the lead time (start line)
  abort              cancel the countdown (start line)
  stop               stop the race
  retry-camera       try the camera again (finish line)
  test-cue           play the start cue
  save [dir]         save the last recording
  status             show the current state
  quit               exit";

/// A parsed operator line
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleInput {
    Engine(EngineCommand),
    Status,
    Help,
    Quit,
}

/// Parse one line of operator input. `Ok(None)` for a blank line.
pub fn parse_command(line: &str) -> Result<Option<ConsoleInput>, String> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let input = match word.to_ascii_lowercase().as_str() {
        "" => return Ok(None),
        "start" => ConsoleInput::Engine(EngineCommand::SelectRole(Role::StartLine)),
        "finish" => ConsoleInput::Engine(EngineCommand::SelectRole(Role::FinishLine)),
        "connect" => {
            if rest.is_empty() {
                return Err("usage: connect <peer id>".to_string());
            }
            ConsoleInput::Engine(EngineCommand::Connect(rest.to_string()))
        }
        "go" => ConsoleInput::Engine(EngineCommand::CommitStart),
        "abort" => ConsoleInput::Engine(EngineCommand::AbortStart),
        "stop" => ConsoleInput::Engine(EngineCommand::Stop),
        "retry-camera" => ConsoleInput::Engine(EngineCommand::RetryCamera),
        "test-cue" => ConsoleInput::Engine(EngineCommand::TestCue),
        "save" => {
            let dir = (!rest.is_empty()).then(|| PathBuf::from(rest));
            ConsoleInput::Engine(EngineCommand::SaveRecording(dir))
        }
        "status" => ConsoleInput::Status,
        "help" | "?" => ConsoleInput::Help,
        "quit" | "exit" => ConsoleInput::Quit,
        other => return Err(format!("unknown command '{}' (try 'help')", other)),
    };
    Ok(Some(input))
}

/// `MM:SS.mmm`
pub fn format_time(elapsed_ms: u64) -> String {
    let minutes = elapsed_ms / 60_000;
    let seconds = (elapsed_ms / 1000) % 60;
    let millis = elapsed_ms % 1000;
    format!("{:02}:{:02}.{:03}", minutes, seconds, millis)
}

/// What the operator currently sees
#[derive(Debug, Clone, Default)]
pub struct ConsoleView {
    role: Role,
    peer_id: Option<String>,
    connection: ConnectionState,
    phase: RacePhase,
    elapsed_ms: u64,
    camera_ready: bool,
    recording: bool,
    artifact: Option<String>,
}

impl ConsoleView {
    /// Fold `status` into the view. Returns a line to print, if any.
    pub fn update_status(&mut self, status: &EngineStatus) -> Option<String> {
        match status {
            EngineStatus::RoleSelected(role) => {
                self.role = *role;
                Some(format!("Role: {}", role))
            }
            EngineStatus::PeerId(id) => {
                self.peer_id = Some(id.clone());
                Some(format!("Your ID: {}", id))
            }
            EngineStatus::Connection(connection) => {
                self.connection = *connection;
                let text = match connection {
                    ConnectionState::Idle => return None,
                    ConnectionState::Connecting => "Connecting...",
                    ConnectionState::Open => "Connected",
                    ConnectionState::Closed => "Disconnected",
                    ConnectionState::Errored => "Connection failed",
                };
                Some(text.to_string())
            }
            EngineStatus::Phase(phase) => {
                self.phase = *phase;
                match phase {
                    RacePhase::Armed => Some("Get ready...".to_string()),
                    RacePhase::Running if self.role == Role::FinishLine => Some("Race started, recording".to_string()),
                    RacePhase::Running => Some("GO".to_string()),
                    RacePhase::Stopped if self.role == Role::StartLine => {
                        Some(format!("Stopped at {}", format_time(self.elapsed_ms)))
                    }
                    RacePhase::Stopped => Some("Stopped".to_string()),
                    RacePhase::Connected | RacePhase::Unconnected => None,
                }
            }
            EngineStatus::Elapsed { elapsed_ms } => {
                self.elapsed_ms = *elapsed_ms;
                None
            }
            EngineStatus::CameraReady(ready) => {
                self.camera_ready = *ready;
                ready.then(|| "Camera ready".to_string())
            }
            EngineStatus::Recording(recording) => {
                self.recording = *recording;
                None
            }
            EngineStatus::ArtifactReady { uri, media_type, size, chunks } => {
                self.artifact = Some(uri.clone());
                Some(format!(
                    "Recording ready: {} ({}, {}, {} chunks); 'save' to keep it",
                    uri, size, media_type, chunks
                ))
            }
            EngineStatus::ArtifactSaved(path) => Some(format!("Saved {}", path.display())),
            EngineStatus::Notice(text) => Some(text.clone()),
            EngineStatus::Error(text) => Some(format!("Error: {}", text)),
        }
    }

    /// Clock line printed on refresh while the race runs
    pub fn clock_line(&self) -> Option<String> {
        (self.phase == RacePhase::Running && self.role == Role::StartLine).then(|| format_time(self.elapsed_ms))
    }

    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("Role:       {}", if self.role.is_assigned() { self.role.to_string() } else { "not chosen".to_string() }),
            format!("Your ID:    {}", self.peer_id.as_deref().unwrap_or("-")),
            format!("Link:       {:?}", self.connection),
            format!("Phase:      {}", self.phase),
        ];
        match self.role {
            Role::StartLine => lines.push(format!("Time:       {}", format_time(self.elapsed_ms))),
            Role::FinishLine => {
                lines.push(format!("Camera:     {}", if self.camera_ready { "ready" } else { "not ready" }));
                lines.push(format!("Recording:  {}", if self.recording { "yes" } else { "no" }));
            }
            Role::Unassigned => {}
        }
        if let Some(uri) = &self.artifact {
            lines.push(format!("Last video: {}", uri));
        }
        lines.join("\n")
    }
}

pub struct ConsoleApp {
    cmd_tx: mpsc::Sender<EngineCommand>,
    status_rx: broadcast::Receiver<EngineStatus>,
    view: ConsoleView,
}

impl ConsoleApp {
    pub fn new(cmd_tx: mpsc::Sender<EngineCommand>, status_rx: broadcast::Receiver<EngineStatus>) -> Self {
        Self {
            cmd_tx,
            status_rx,
            view: ConsoleView::default(),
        }
    }

    /// Run until the operator quits, stdin closes or the engine goes away
    pub async fn run(mut self) -> Result<()> {
        info!("Starting operator console");
        println!("race-timer: type 'help' for commands");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut refresh = tokio::time::interval(REFRESH);

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        info!("stdin closed");
                        let _ = self.cmd_tx.send(EngineCommand::Shutdown).await;
                        break;
                    };
                    match parse_command(&line) {
                        Ok(None) => {}
                        Ok(Some(ConsoleInput::Engine(command))) => {
                            if self.cmd_tx.send(command).await.is_err() {
                                break;
                            }
                        }
                        Ok(Some(ConsoleInput::Status)) => println!("{}", self.view.summary()),
                        Ok(Some(ConsoleInput::Help)) => println!("{}", HELP),
                        Ok(Some(ConsoleInput::Quit)) => {
                            let _ = self.cmd_tx.send(EngineCommand::Shutdown).await;
                            break;
                        }
                        Err(message) => println!("{}", message),
                    }
                }

                status = self.status_rx.recv() => match status {
                    Ok(status) => {
                        if let Some(line) = self.view.update_status(&status) {
                            println!("{}", line);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Missed {} status updates", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Status channel closed, exiting console");
                        break;
                    }
                },

                _ = refresh.tick() => {
                    if let Some(line) = self.view.clock_line() {
                        println!("{}", line);
                    }
                }
            }
        }

        Ok(())
    }
}
