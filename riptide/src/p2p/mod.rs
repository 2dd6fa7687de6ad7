use std::net::SocketAddr;
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tracing::Instrument;
use crate::ID;

pub mod extension;
mod handshake;
mod message;
mod session;

pub use message::{Message, MessageCodec};
pub use session::{PeerSession, SessionParams};

pub type Result<T> = std::result::Result<T, PeerError>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;
pub type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;
pub type PeerEventTx = mpsc::UnboundedSender<PeerEvent>;
pub type PeerEventRx = mpsc::UnboundedReceiver<PeerEvent>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("no handshake received")]
    NoHandshake,

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("bencode error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("connection timeout")]
    Timeout,

    #[error("channel closed")]
    Channel,

}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        PeerError::Channel
    }
}

// Commands from the controller to a peer session.
#[derive(Debug)]
pub enum PeerCommand {

    // Write a message to the socket.
    Send(Message),

    Shutdown,

}

// Events from peer sessions to the controller. All torrent state mutation
// happens on the controller side of this channel.
#[derive(Debug)]
pub enum PeerEvent {

    // Handshake completed.
    Connected {
        addr: SocketAddr,
        id: ID,
        extension_protocol: bool,
        fast: bool,
    },

    Msg { id: ID, msg: Message },

    // Session ended. id is None if the handshake never completed.
    Disconnected { addr: SocketAddr, id: Option<ID> },

}

pub struct PeerHandle {

    pub peer_tx: PeerTx,

    pub handle: JoinHandle<()>,

}

impl PeerHandle {

    // Spawns a session task. For inbound connections the already-accepted
    // socket is passed along with the acceptor's handshake permit, which is
    // released once the handshake resolves.
    pub fn spawn(
        params: SessionParams,
        event_tx: PeerEventTx,
        socket: Option<TcpStream>,
        permit: Option<tokio::sync::OwnedSemaphorePermit>,
    ) -> PeerHandle {

        let addr = params.addr;
        let (mut session, peer_tx) = PeerSession::new(params, event_tx.clone());
        let handle = tokio::spawn(async move {
            if let Err(e) = session.run(socket, permit).await {
                tracing::debug!("session ended: {}", e);
            }
            let _ = event_tx.send(PeerEvent::Disconnected { addr, id: session.peer_id() });
        }.instrument(tracing::info_span!("peer", addr = %addr)));

        PeerHandle { peer_tx, handle }
    }
}
