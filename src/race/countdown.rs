//! Cancellable lead-time countdown
//!
//! The only intentional suspension point of the race: the gap between the
//! operator committing and the start instant. Completion re-enters the engine
//! as a message carrying the attempt number and the instant the lead time
//! elapsed, so a late completion from an aborted attempt can be discarded.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Sent when a scheduled lead time runs out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeadTimeElapsed {
    pub attempt: u64,
    pub at: Instant,
}

pub struct LeadTimeCountdown {
    tx: mpsc::UnboundedSender<LeadTimeElapsed>,
    pending: Option<(CancellationToken, JoinHandle<()>)>,
}

impl LeadTimeCountdown {
    pub fn new(tx: mpsc::UnboundedSender<LeadTimeElapsed>) -> Self {
        Self { tx, pending: None }
    }

    /// Schedule the start of `attempt` after `delay`, replacing anything pending.
    pub fn schedule(&mut self, attempt: u64, delay: Duration) {
        self.cancel();

        let token = CancellationToken::new();
        let child = token.clone();
        let tx = self.tx.clone();
        let deadline = Instant::now() + delay;

        debug!("Lead time scheduled for attempt {} ({:?})", attempt, delay);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = child.cancelled() => {
                    debug!("Lead time for attempt {} cancelled", attempt);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = tx.send(LeadTimeElapsed { attempt, at: deadline });
                }
            }
        });

        self.pending = Some((token, handle));
    }

    /// Cancel the pending countdown, if any. Returns true if one was pending.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some((token, handle)) => {
                let was_live = !handle.is_finished();
                token.cancel();
                was_live
            }
            None => false,
        }
    }
}

impl Drop for LeadTimeCountdown {
    fn drop(&mut self) {
        self.cancel();
    }
}
