//! In-process loopback link for engine tests

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{PeerId, Transport, TransportError, TransportEvent};
use crate::race::ProtocolMessage;

/// One end of a loopback pair
#[derive(Clone)]
pub struct MemoryTransport {
    id: PeerId,
    peer_id: PeerId,
    events: mpsc::UnboundedSender<TransportEvent>,
    peer_events: mpsc::UnboundedSender<TransportEvent>,
    linked: Arc<AtomicBool>,
    dial_delay: Duration,
}

impl MemoryTransport {
    pub fn pair(
        a_events: mpsc::UnboundedSender<TransportEvent>,
        b_events: mpsc::UnboundedSender<TransportEvent>,
    ) -> (Self, Self) {
        let linked = Arc::new(AtomicBool::new(false));
        let a_id = PeerId::new("memory-a");
        let b_id = PeerId::new("memory-b");
        let a = Self {
            id: a_id.clone(),
            peer_id: b_id.clone(),
            events: a_events.clone(),
            peer_events: b_events.clone(),
            linked: linked.clone(),
            dial_delay: Duration::ZERO,
        };
        let b = Self {
            id: b_id,
            peer_id: a_id,
            events: b_events,
            peer_events: a_events,
            linked,
            dial_delay: Duration::ZERO,
        };
        (a, b)
    }

    /// Make dials from this end take `delay` to resolve, like a slow network
    pub fn with_dial_delay(mut self, delay: Duration) -> Self {
        self.dial_delay = delay;
        self
    }

    /// Drop the link from outside, as a network failure would
    pub fn sever(&self) {
        if self.linked.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::ConnectionClosed);
            let _ = self.peer_events.send(TransportEvent::ConnectionClosed);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&mut self) -> Result<PeerId, TransportError> {
        let _ = self.events.send(TransportEvent::Opened(self.id.clone()));
        Ok(self.id.clone())
    }

    async fn connect(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        let _ = self.events.send(TransportEvent::Connecting);
        let this = self.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.dial_delay).await;
            if peer != this.peer_id {
                let _ = this
                    .events
                    .send(TransportEvent::ConnectionErrored(format!("unknown peer {}", peer)));
                return;
            }
            this.linked.store(true, Ordering::SeqCst);
            let _ = this.events.send(TransportEvent::ConnectionEstablished(this.peer_id.clone()));
            let _ = this.peer_events.send(TransportEvent::ConnectionEstablished(this.id.clone()));
        });
        Ok(())
    }

    async fn send(&mut self, message: ProtocolMessage) -> Result<(), TransportError> {
        if !self.linked.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let _ = self.peer_events.send(TransportEvent::Message(message));
        Ok(())
    }

    async fn close(&mut self) {
        self.sever();
    }
}
