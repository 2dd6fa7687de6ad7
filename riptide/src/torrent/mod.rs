use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{sync::{mpsc, oneshot}, task::JoinHandle};
use tracing::Instrument;
use url::Url;
use crate::{
    announcer::DhtAnnounce,
    config::Config,
    metainfo::{Info, MetaInfo, MetaInfoError},
    pool::{BufferPool, SharedBufferPool},
    storage::StorageError,
    Bitfield, ID,
};

mod controller;
#[cfg(test)]
mod tests;

use controller::Controller;

pub type Result<T> = std::result::Result<T, TorrentError>;
pub type CommandTx = mpsc::UnboundedSender<Command>;
pub type CommandRx = mpsc::UnboundedReceiver<Command>;
pub type ErrorRx = mpsc::UnboundedReceiver<TorrentError>;

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metainfo error: {0}")]
    MetaInfo(#[from] MetaInfoError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("downloaded metadata does not match the info-hash")]
    InfoHashMismatch,

    #[error("torrent is not running")]
    NotRunning,

    #[error("channel error: {0}")]
    Channel(String),

}

impl<T> From<mpsc::error::SendError<T>> for TorrentError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        TorrentError::Channel(e.to_string())
    }
}

// The lifecycle of one torrent. Transitions are monotonic within a start
// cycle; stop returns the machine to Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {

    Stopped,

    Stopping,

    // Fetching the info dictionary from peers.
    AcquiringInfo,

    Allocating,

    Verifying,

    Downloading,

    Seeding,

}

// External control surface of the controller task.
#[derive(Debug)]
pub enum Command {

    Start,

    Stop,

    // Current listen port, None while stopped.
    Port { tx: oneshot::Sender<Option<u16>> },

    Phase { tx: oneshot::Sender<Phase> },

    // Manually supplied peer addresses.
    AddPeers(Vec<SocketAddr>),

    // Addresses surfaced by the embedder's DHT node.
    DhtPeers(Vec<SocketAddr>),

}

pub struct TorrentParams {

    pub info_hash: ID,

    // Known up front when constructed from a .torrent; absent for
    // magnet-style startup, acquired from peers via the metadata extension.
    pub info: Option<Info>,

    // Resume state from a previous run.
    pub bitfield: Option<Bitfield>,

    pub trackers: Vec<Url>,

    pub webseeds: Vec<Url>,

    pub data_dir: PathBuf,

    pub config: Config,

    pub dht: Option<Arc<dyn DhtAnnounce>>,

    // Process-wide piece buffer pool shared between torrents. One is
    // created when absent.
    pub pool: Option<SharedBufferPool>,

}

// Handle to a running controller task. Dropping it stops the torrent.
pub struct Torrent {

    info_hash: ID,

    cmd_tx: CommandTx,

    handle: JoinHandle<()>,

}

impl Torrent {

    // Spawns the controller in the Stopped state. Fatal faults arrive on
    // the returned error channel, at most one per start cycle.
    pub fn new(params: TorrentParams) -> (Torrent, ErrorRx) {

        let info_hash = params.info_hash;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::unbounded_channel();

        let pool = params.pool
            .clone()
            .unwrap_or_else(|| BufferPool::new(32));
        let mut controller = Controller::new(params, pool, cmd_rx, err_tx);
        let handle = tokio::spawn(async move {
            controller.run().await;
        }.instrument(tracing::info_span!("torrent", info_hash = %hex::encode(info_hash))));

        (
            Torrent {
                info_hash,
                cmd_tx,
                handle,
            },
            err_rx,
        )
    }

    pub fn from_metainfo(
        metainfo: MetaInfo,
        data_dir: PathBuf,
        config: Config,
    ) -> (Torrent, ErrorRx) {
        Torrent::new(TorrentParams {
            info_hash: metainfo.info_hash(),
            trackers: metainfo.tracker_urls(),
            webseeds: metainfo.webseeds.clone(),
            info: Some(metainfo.info),
            bitfield: None,
            data_dir,
            config,
            dht: None,
            pool: None,
        })
    }

    pub fn info_hash(&self) -> ID {
        self.info_hash
    }

    pub fn start(&self) {
        let _ = self.cmd_tx.send(Command::Start);
    }

    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop);
    }

    pub fn add_peers(&self, addrs: Vec<SocketAddr>) {
        let _ = self.cmd_tx.send(Command::AddPeers(addrs));
    }

    pub fn dht_peers(&self, addrs: Vec<SocketAddr>) {
        let _ = self.cmd_tx.send(Command::DhtPeers(addrs));
    }

    // Listen port of the current run.
    pub async fn port(&self) -> Result<Option<u16>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Port { tx })?;
        rx.await.map_err(|_| TorrentError::NotRunning)
    }

    pub async fn phase(&self) -> Result<Phase> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Phase { tx })?;
        rx.await.map_err(|_| TorrentError::NotRunning)
    }

    // Waits for the controller task itself; used on process shutdown.
    pub async fn join(self) {
        drop(self.cmd_tx);
        let _ = self.handle.await;
    }
}
