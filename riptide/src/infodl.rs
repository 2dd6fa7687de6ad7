use std::time::Duration;
use sha1::Digest;
use tokio::{sync::mpsc, task::JoinHandle, time};
use crate::{
    p2p::{
        extension::{MetadataMessage, METADATA_PIECE_SIZE},
        Message, PeerCommand, PeerTx,
    },
    ID,
};

pub type MetadataTx = mpsc::UnboundedSender<MetadataEvent>;
pub type MetadataRx = mpsc::UnboundedReceiver<MetadataEvent>;
pub type InfoDlTx = mpsc::UnboundedSender<InfoDlEvent>;
pub type InfoDlRx = mpsc::UnboundedReceiver<InfoDlEvent>;

// ut_metadata traffic for this peer, routed by the controller.
#[derive(Debug)]
pub enum MetadataEvent {

    Data { piece: u32, data: Vec<u8> },

    Reject { piece: u32 },

}

#[derive(Debug)]
pub enum InfoDlEvent {

    Snubbed { peer: ID },

    // Assembled and hash-checked info dictionary bytes.
    Done { peer: ID, info: Vec<u8> },

    Failed { peer: ID, reason: InfoDlError },

}

#[derive(Debug, thiserror::Error)]
pub enum InfoDlError {

    // The assembled dictionary does not hash to the torrent's info-hash.
    #[error("info-hash mismatch on downloaded metadata")]
    HashMismatch,

    #[error("peer rejected metadata request")]
    Rejected,

    #[error("peer sent an invalid metadata piece")]
    BadPiece,

}

// Controller-held handle; dropping it tears the task down.
pub struct InfoDownload {

    pub data_tx: MetadataTx,

    pub handle: JoinHandle<()>,

}

impl InfoDownload {

    pub fn spawn(
        peer: ID,
        info_hash: ID,
        metadata_size: u32,
        // The peer's id for ut_metadata from its extended handshake.
        ut_metadata_id: u8,
        snub_timeout: Duration,
        peer_tx: PeerTx,
        result_tx: InfoDlTx,
    ) -> InfoDownload {

        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let mut downloader = InfoDownloader {
            peer,
            info_hash,
            metadata_size: metadata_size as usize,
            ut_metadata_id,
            snub_timeout,
            peer_tx,
            result_tx,
            data_rx,
        };
        let handle = tokio::spawn(async move { downloader.run().await });

        InfoDownload { data_tx, handle }
    }
}

struct InfoDownloader {

    peer: ID,

    info_hash: ID,

    metadata_size: usize,

    ut_metadata_id: u8,

    snub_timeout: Duration,

    peer_tx: PeerTx,

    result_tx: InfoDlTx,

    data_rx: MetadataRx,

}

impl InfoDownloader {

    fn piece_len(&self, piece: u32) -> usize {
        METADATA_PIECE_SIZE.min(self.metadata_size - piece as usize * METADATA_PIECE_SIZE)
    }

    async fn run(&mut self) {

        let num_pieces =
            (self.metadata_size + METADATA_PIECE_SIZE - 1) / METADATA_PIECE_SIZE;
        let mut buf = vec![0u8; self.metadata_size];
        let mut received = vec![false; num_pieces];

        // Request consecutive pieces up front; metadata is at most a few
        // dozen pieces.
        for piece in 0..num_pieces as u32 {
            let payload = match MetadataMessage::request(piece).to_bytes() {
                Ok(payload) => payload,
                Err(_) => return,
            };
            let sent = self.peer_tx.send(PeerCommand::Send(Message::Extended {
                id: self.ut_metadata_id,
                payload,
            }));
            if sent.is_err() {
                return;
            }
        }

        let mut deadline = time::Instant::now() + self.snub_timeout;
        let mut snub_sent = false;

        loop { tokio::select! {

            event = self.data_rx.recv() => {
                match event {
                    Some(MetadataEvent::Data { piece, data }) => {
                        if piece as usize >= num_pieces || data.len() != self.piece_len(piece) {
                            self.fail(InfoDlError::BadPiece);
                            return;
                        }
                        deadline = time::Instant::now() + self.snub_timeout;
                        snub_sent = false;

                        let start = piece as usize * METADATA_PIECE_SIZE;
                        buf[start..start + data.len()].copy_from_slice(&data);
                        received[piece as usize] = true;

                        if received.iter().all(|&r| r) {
                            self.finish(buf);
                            return;
                        }
                    },
                    Some(MetadataEvent::Reject { piece }) => {
                        tracing::debug!("metadata piece {} rejected", piece);
                        self.fail(InfoDlError::Rejected);
                        return;
                    },
                    // Controller dropped the handle.
                    None => return,
                }
            }

            _ = time::sleep_until(deadline) => {
                if !snub_sent {
                    snub_sent = true;
                    let _ = self.result_tx.send(InfoDlEvent::Snubbed { peer: self.peer });
                }
                deadline = time::Instant::now() + self.snub_timeout;
            }

        }}
    }

    fn finish(&mut self, buf: Vec<u8>) {
        let mut hasher = sha1::Sha1::new();
        hasher.update(&buf);
        let hash: ID = hasher.finalize().into();
        if hash == self.info_hash {
            let _ = self.result_tx.send(InfoDlEvent::Done { peer: self.peer, info: buf });
        } else {
            self.fail(InfoDlError::HashMismatch);
        }
    }

    fn fail(&mut self, reason: InfoDlError) {
        let _ = self.result_tx.send(InfoDlEvent::Failed { peer: self.peer, reason });
    }
}
