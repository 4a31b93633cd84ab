//! race-timer
//!
//! Two devices, one race: the START LINE plays the start cue and runs the
//! clock, the FINISH LINE records the finish with its camera. The devices stay
//! in step over a direct peer link.

mod capture;
mod config;
mod cue;
mod logging;
mod race;
mod recording;
mod sync;
mod transport;
mod ui;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use capture::{spawn_capture_worker, FfmpegCamera};
use config::Config;
use cue::{AudioCue, CommandCue, SilentCue};
use race::Role;
use sync::{create_engine_channels, EngineCommand, EngineIo, EngineSettings, EngineStatus, RaceEngine};
use transport::TcpTransport;
use ui::ConsoleApp;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    Start,
    Finish,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Start => Role::StartLine,
            RoleArg::Finish => Role::FinishLine,
        }
    }
}

/// Start-line timer and finish-line camera, kept in sync over a peer link
#[derive(Debug, Parser)]
#[command(name = "race-timer", version, about)]
struct Args {
    /// Config file (defaults to the per-user config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Take this role immediately
    #[arg(short, long, value_enum)]
    role: Option<RoleArg>,

    /// Connect to this peer id once started
    #[arg(short, long)]
    peer: Option<String>,

    /// Also log to stderr
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = logging::init_logging(args.verbose)?;
    info!("race-timer starting...");
    if let Ok(dir) = logging::get_log_dir() {
        info!("Logging to {:?}", dir);
    }

    let config = Config::load(args.config.as_deref())?;
    info!("Configuration loaded from {:?}", config.config_path()?);

    // Create tokio runtime for async operations
    let runtime = tokio::runtime::Runtime::new()?;

    let (cmd_tx, cmd_rx, status_tx, status_rx) = create_engine_channels();

    // Set up Ctrl+C handler that sends shutdown command
    let ctrl_c_tx = cmd_tx.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        let _ = ctrl_c_tx.blocking_send(EngineCommand::Shutdown);
    })?;

    let result = runtime.block_on(run(config, args, cmd_tx, cmd_rx, status_tx, status_rx));
    if let Err(e) = &result {
        error!("{:#}", e);
    }

    // stdin may still be blocked in a read; don't wait for it
    runtime.shutdown_timeout(Duration::from_millis(200));

    info!("Shutdown complete");
    result
}

async fn run(
    config: Config,
    args: Args,
    cmd_tx: mpsc::Sender<EngineCommand>,
    cmd_rx: mpsc::Receiver<EngineCommand>,
    status_tx: broadcast::Sender<EngineStatus>,
    status_rx: broadcast::Receiver<EngineStatus>,
) -> Result<()> {
    let (transport_tx, transport_events) = mpsc::unbounded_channel();
    let transport = TcpTransport::new(config.transport_settings()?, transport_tx);

    let (capture_tx, capture_events) = mpsc::unbounded_channel();
    let camera = FfmpegCamera::new(config.ffmpeg_settings());
    let (capture, capture_worker) = spawn_capture_worker(camera, config.recorder_settings(), capture_tx);

    let (cue_tx, cue_failures) = mpsc::unbounded_channel();
    let cue: Box<dyn AudioCue> = match config
        .cue
        .file
        .clone()
        .and_then(|file| CommandCue::new(&config.cue.command, file, cue_tx))
    {
        Some(cue) => Box::new(cue),
        None => {
            warn!("No start cue configured; the countdown will be silent");
            Box::new(SilentCue)
        }
    };

    let settings = EngineSettings {
        race: config.race_settings(),
        tick_interval: config.tick_interval(),
        constraints: config.capture_constraints(),
        output_dir: config.output_directory(),
    };
    let io = EngineIo {
        transport: Box::new(transport),
        transport_events,
        capture,
        capture_events,
        cue,
        cue_failures,
    };

    let mut engine = RaceEngine::new(settings, io, cmd_rx, status_tx);
    let mut engine_task = tokio::spawn(async move { engine.run().await });

    if let Some(role) = args.role {
        cmd_tx.send(EngineCommand::SelectRole(role.into())).await?;
    }
    if let Some(peer) = args.peer {
        cmd_tx.send(EngineCommand::Connect(peer)).await?;
    }

    let console = ConsoleApp::new(cmd_tx.clone(), status_rx);
    let outcome = tokio::select! {
        finished = &mut engine_task => finished,
        console_result = console.run() => {
            if let Err(e) = console_result {
                warn!("Console stopped: {}", e);
            }
            let _ = cmd_tx.send(EngineCommand::Shutdown).await;
            engine_task.await
        }
    };

    if let Err(e) = capture_worker.await {
        warn!("Capture worker ended abnormally: {}", e);
    }

    match outcome {
        Ok(result) => result,
        Err(e) => Err(anyhow::anyhow!("Race engine task failed: {}", e)),
    }
}
