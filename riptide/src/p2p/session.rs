use std::{net::SocketAddr, time::Duration};
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc, time};
use tokio_util::codec::Framed;
use crate::ID;
use super::{
    extension::{ExtendedHandshake, EXTENDED_HANDSHAKE_ID},
    handshake::{Handshake, HandshakeCodec},
    message::{Message, MessageCodec},
    PeerCommand, PeerError, PeerEvent, PeerEventTx, PeerRx, PeerTx, Result,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

pub struct SessionParams {

    pub addr: SocketAddr,

    pub info_hash: ID,

    pub client_id: ID,

    // Advertised in our extended handshake when the info is already known.
    pub metadata_size: Option<u32>,

    pub idle_timeout: Duration,

}

// One task per peer connection. The session owns the socket; it forwards
// decoded messages to the controller and writes whatever the controller
// sends back. It never touches torrent state.
pub struct PeerSession {

    params: SessionParams,

    event_tx: PeerEventTx,

    peer_rx: PeerRx,

    // Set once the handshake completes.
    peer_id: Option<ID>,

}

impl PeerSession {

    pub fn new(params: SessionParams, event_tx: PeerEventTx) -> (PeerSession, PeerTx) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        (
            PeerSession {
                params,
                event_tx,
                peer_rx,
                peer_id: None,
            },
            peer_tx,
        )
    }

    pub fn peer_id(&self) -> Option<ID> {
        self.peer_id
    }

    pub async fn run(
        &mut self,
        inbound_stream: Option<TcpStream>,
        permit: Option<tokio::sync::OwnedSemaphorePermit>,
    ) -> Result<()> {

        let inbound = inbound_stream.is_some();
        let stream = match inbound_stream {
            Some(stream) => stream,
            None => {
                time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.params.addr))
                    .await
                    .map_err(|_| PeerError::Timeout)??
            },
        };

        let mut socket = Framed::new(stream, HandshakeCodec);
        let theirs = self.exchange_handshake(&mut socket, inbound).await?;
        // Handshake resolved, free the acceptor slot.
        drop(permit);

        self.peer_id = Some(theirs.peer_id);
        let extension_protocol = theirs.supports_extension_protocol();
        self.event_tx.send(PeerEvent::Connected {
            addr: self.params.addr,
            id: theirs.peer_id,
            extension_protocol,
            fast: theirs.supports_fast(),
        })?;

        // Swap codecs in place; bytes the peer sent on the heels of its
        // handshake are already buffered and must not be dropped.
        let socket = socket.map_codec(|_| MessageCodec);
        self.exchange_messages(socket, extension_protocol).await
    }

    async fn exchange_handshake(
        &mut self,
        socket: &mut Framed<TcpStream, HandshakeCodec>,
        inbound: bool,
    ) -> Result<Handshake> {

        let ours = Handshake::new(self.params.info_hash, self.params.client_id);
        if !inbound {
            socket.send(ours).await?;
        }

        let theirs = match socket.next().await {
            Some(theirs) => theirs?,
            None => return Err(PeerError::NoHandshake),
        };
        if theirs.info_hash != self.params.info_hash {
            return Err(PeerError::IncorrectInfoHash);
        }

        if inbound {
            let ours = Handshake::new(self.params.info_hash, self.params.client_id);
            socket.send(ours).await?;
        }

        tracing::debug!("handshake complete, peer id {:?}", String::from_utf8_lossy(&theirs.peer_id));
        Ok(theirs)
    }

    async fn exchange_messages(
        &mut self,
        socket: Framed<TcpStream, MessageCodec>,
        extension_protocol: bool,
    ) -> Result<()> {

        let id = self.peer_id.ok_or(PeerError::NoHandshake)?;
        let (mut sink, mut stream) = socket.split();

        if extension_protocol {
            let payload = ExtendedHandshake::ours(self.params.metadata_size).to_bytes()?;
            sink.send(Message::Extended { id: EXTENDED_HANDSHAKE_ID, payload }).await?;
        }

        let mut last_received = time::Instant::now();
        let mut ticker = time::interval(KEEPALIVE_INTERVAL);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;

        loop { tokio::select! {

            msg = stream.next() => {
                let msg = match msg {
                    Some(msg) => msg?,
                    // Peer closed the connection.
                    None => return Ok(()),
                };
                last_received = time::Instant::now();
                tracing::trace!("read: {}", msg);
                if !matches!(msg, Message::KeepAlive) {
                    self.event_tx.send(PeerEvent::Msg { id, msg })?;
                }
            }

            cmd = self.peer_rx.recv() => {
                match cmd {
                    Some(PeerCommand::Send(msg)) => {
                        tracing::trace!("send: {}", msg);
                        sink.send(msg).await?;
                    },
                    Some(PeerCommand::Shutdown) | None => {
                        tracing::debug!("session shutdown");
                        return Ok(());
                    },
                }
            }

            _ = ticker.tick() => {
                if last_received.elapsed() >= self.params.idle_timeout {
                    tracing::debug!("disconnecting idle peer");
                    return Err(PeerError::Timeout);
                }
                sink.send(Message::KeepAlive).await?;
            }

        }}
    }
}
