//! The sender-side handle to a peer connection.
//!
//! The rest of the crate only ever needs a cheap, cloneable, `Send + Sync` way to push a message
//! or a file onto a connection's outbound queue, never the connection itself. One task owns the
//! actual socket write half and drains the queue; everything else talks to a `PeerHandle`.

use std::hash::{Hash, Hasher};

use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::codec::{encode_message, ControlMessage};
use crate::transport::{write_frame, FrameType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We accepted this connection.
    Ingress,
    /// We dialed this connection.
    Egress,
}

enum OutboundFrame {
    Message(ControlMessage),
    File(Vec<u8>),
}

#[derive(Clone)]
pub struct PeerHandle(std::sync::Arc<PeerHandleInner>);

struct PeerHandleInner {
    id: Uuid,
    addr: std::net::SocketAddr,
    direction: Direction,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
}

impl PeerHandle {
    pub fn id(&self) -> Uuid {
        self.0.id
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.0.addr
    }

    pub fn direction(&self) -> Direction {
        self.0.direction
    }

    /// Enqueues a control message for delivery; never blocks, drops silently if the connection's
    /// writer task has already exited (the read loop will notice and clean up the peer).
    pub fn send(&self, msg: ControlMessage) {
        if self.0.outbound.send(OutboundFrame::Message(msg)).is_err() {
            warn!(peer = %self.0.addr, "dropped outbound message, writer already closed");
        }
    }

    pub fn send_file(&self, bytes: Vec<u8>) {
        if self.0.outbound.send(OutboundFrame::File(bytes)).is_err() {
            warn!(peer = %self.0.addr, "dropped outbound file, writer already closed");
        }
    }
}

impl PartialEq for PeerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}
impl Eq for PeerHandle {}

impl Hash for PeerHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.0.id)
            .field("addr", &self.0.addr)
            .field("direction", &self.0.direction)
            .finish()
    }
}

/// Spawns the writer task for a freshly accepted or dialed connection and returns the handle the
/// rest of the crate uses to talk to it.
pub fn spawn_peer<W>(addr: std::net::SocketAddr, direction: Direction, write_half: W) -> PeerHandle
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = PeerHandle(std::sync::Arc::new(PeerHandleInner {
        id: Uuid::new_v4(),
        addr,
        direction,
        outbound: tx,
    }));
    tokio::spawn(run_writer(addr, write_half, rx));
    handle
}

async fn run_writer<W: AsyncWrite + Unpin>(
    addr: std::net::SocketAddr,
    mut write_half: W,
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
) {
    while let Some(frame) = rx.recv().await {
        let result = match frame {
            OutboundFrame::Message(msg) => match encode_message(&msg) {
                Ok(bytes) => write_frame(&mut write_half, FrameType::Object, &bytes).await,
                Err(e) => {
                    error!(peer = %addr, error = %e, "failed to encode outgoing control message");
                    continue;
                }
            },
            OutboundFrame::File(bytes) => write_frame(&mut write_half, FrameType::File, &bytes).await,
        };
        if let Err(e) = result {
            warn!(peer = %addr, error = %e, "write failed, closing connection");
            break;
        }
    }
}
