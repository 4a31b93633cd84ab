//! Line-delimited JSON over TCP
//!
//! One actor task owns the listener and the current connection. Whichever
//! connection arrived last (accepted or dialed) wins; the previous one is
//! dropped.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

use super::{PeerId, Transport, TransportError, TransportEvent};
use crate::race::ProtocolMessage;

/// Protocol messages are tiny; anything longer is garbage
const MAX_LINE_LENGTH: usize = 1024;

#[derive(Debug, Clone)]
pub struct TcpTransportSettings {
    pub listen_addr: SocketAddr,
    /// Host put in the advertised peer id; detected when `None`
    pub advertise_host: Option<String>,
    pub connect_timeout: Duration,
}

enum LinkCommand {
    Adopt(TcpStream, PeerId),
    Send(ProtocolMessage),
    Close,
}

struct Link {
    peer: PeerId,
    reader: FramedRead<OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<OwnedWriteHalf, LinesCodec>,
}

pub struct TcpTransport {
    settings: TcpTransportSettings,
    events: mpsc::UnboundedSender<TransportEvent>,
    actor: Option<(mpsc::UnboundedSender<LinkCommand>, JoinHandle<()>)>,
    /// Set by the actor while it holds a connection
    linked: Arc<AtomicBool>,
}

impl TcpTransport {
    pub fn new(settings: TcpTransportSettings, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            settings,
            events,
            actor: None,
            linked: Arc::new(AtomicBool::new(false)),
        }
    }

    fn commands(&self) -> Result<&mpsc::UnboundedSender<LinkCommand>, TransportError> {
        self.actor.as_ref().map(|(tx, _)| tx).ok_or(TransportError::NotOpen)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self) -> Result<PeerId, TransportError> {
        if self.actor.is_some() {
            self.close().await;
        }

        let listener = TcpListener::bind(self.settings.listen_addr).await?;
        let port = listener.local_addr()?.port();
        let host = match &self.settings.advertise_host {
            Some(host) => host.clone(),
            None => detect_local_host().await,
        };
        let id = PeerId::new(format!("{}:{}", host, port));
        info!("Listening for peer on {} (peer id {})", self.settings.listen_addr, id);

        let (tx, rx) = mpsc::unbounded_channel();
        let actor = LinkActor {
            events: self.events.clone(),
            link: None,
            linked: self.linked.clone(),
        };
        let handle = tokio::spawn(actor.run(listener, rx));
        self.actor = Some((tx, handle));

        let _ = self.events.send(TransportEvent::Opened(id.clone()));
        Ok(id)
    }

    async fn connect(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        let commands = self.commands()?.clone();
        let _ = self.events.send(TransportEvent::Connecting);
        info!("Connecting to {}", peer);

        tokio::spawn(dial(
            peer.clone(),
            self.settings.connect_timeout,
            commands,
            self.events.clone(),
        ));
        Ok(())
    }

    async fn send(&mut self, message: ProtocolMessage) -> Result<(), TransportError> {
        let commands = self.commands().map_err(|_| TransportError::NotConnected)?;
        if !self.linked.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        commands
            .send(LinkCommand::Send(message))
            .map_err(|_| TransportError::NotConnected)
    }

    async fn close(&mut self) {
        if let Some((tx, handle)) = self.actor.take() {
            let _ = tx.send(LinkCommand::Close);
            if let Err(e) = handle.await {
                warn!("Transport task ended abnormally: {}", e);
            }
        }
        self.linked.store(false, Ordering::SeqCst);
    }
}

/// Dial `peer` off the caller's task and hand the stream to the link actor
async fn dial(
    peer: PeerId,
    timeout: Duration,
    commands: mpsc::UnboundedSender<LinkCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let reason = match tokio::time::timeout(timeout, TcpStream::connect(peer.as_str())).await {
        Ok(Ok(stream)) => {
            if commands.send(LinkCommand::Adopt(stream, peer.clone())).is_err() {
                debug!("Transport closed while dialing {}", peer);
            }
            return;
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => TransportError::Timeout(peer.clone()).to_string(),
    };
    warn!("Failed to connect to {}: {}", peer, reason);
    let _ = events.send(TransportEvent::ConnectionErrored(reason));
}

struct LinkActor {
    events: mpsc::UnboundedSender<TransportEvent>,
    link: Option<Link>,
    linked: Arc<AtomicBool>,
}

impl LinkActor {
    async fn run(mut self, listener: TcpListener, mut commands: mpsc::UnboundedReceiver<LinkCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(LinkCommand::Adopt(stream, peer)) => self.adopt(stream, peer),
                    Some(LinkCommand::Send(message)) => self.write(message).await,
                    Some(LinkCommand::Close) | None => break,
                },

                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.adopt(stream, PeerId::new(addr.to_string())),
                    Err(e) => warn!("Failed to accept peer connection: {}", e),
                },

                frame = next_frame(&mut self.link), if self.link.is_some() => match frame {
                    Some(Ok(line)) => self.deliver(&line),
                    Some(Err(e)) => {
                        error!("Peer link failed: {}", e);
                        self.drop_link();
                        self.emit(TransportEvent::ConnectionErrored(e.to_string()));
                    }
                    None => {
                        info!("Peer closed the connection");
                        self.drop_link();
                        self.emit(TransportEvent::ConnectionClosed);
                    }
                },
            }
        }

        if self.drop_link() {
            self.emit(TransportEvent::ConnectionClosed);
        }
        debug!("Transport task stopped");
    }

    fn adopt(&mut self, stream: TcpStream, peer: PeerId) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        if let Some(previous) = self.link.take() {
            info!("Replacing connection to {} with {}", previous.peer, peer);
        } else {
            info!("Connected to {}", peer);
        }

        let (read_half, write_half) = stream.into_split();
        self.link = Some(Link {
            peer: peer.clone(),
            reader: FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            writer: FramedWrite::new(write_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
        });
        self.linked.store(true, Ordering::SeqCst);
        self.emit(TransportEvent::ConnectionEstablished(peer));
    }

    async fn write(&mut self, message: ProtocolMessage) {
        let Some(link) = self.link.as_mut() else {
            warn!("Dropping {:?}: connection went away", message);
            return;
        };
        debug!("-> {:?}", message);
        if let Err(e) = link.writer.send(message.encode()).await {
            error!("Failed to send to {}: {}", link.peer, e);
            self.drop_link();
            self.emit(TransportEvent::ConnectionErrored(e.to_string()));
        }
    }

    /// Forget the current connection. Returns whether there was one.
    fn drop_link(&mut self) -> bool {
        self.linked.store(false, Ordering::SeqCst);
        self.link.take().is_some()
    }

    fn deliver(&self, line: &str) {
        match ProtocolMessage::decode(line) {
            Ok(Some(message)) => {
                debug!("<- {:?}", message);
                self.emit(TransportEvent::Message(message));
            }
            Ok(None) => debug!("Ignoring unknown message: {}", line),
            Err(e) => warn!("Dropping malformed message {:?}: {}", line, e),
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

async fn next_frame(link: &mut Option<Link>) -> Option<Result<String, LinesCodecError>> {
    match link {
        Some(link) => link.reader.next().await,
        None => std::future::pending().await,
    }
}

/// Address of the interface used for outbound traffic. No packet is sent.
async fn detect_local_host() -> String {
    let outbound = async {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect("192.0.2.1:9").await?;
        socket.local_addr()
    };
    match outbound.await {
        Ok(addr) if !addr.ip().is_unspecified() => addr.ip().to_string(),
        Ok(_) => "127.0.0.1".to_string(),
        Err(e) => {
            warn!("Could not detect local address, advertising loopback: {}", e);
            "127.0.0.1".to_string()
        }
    }
}
