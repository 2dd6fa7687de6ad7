use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Instant,
};
use rand::{rngs::StdRng, SeedableRng};
use sha1::Digest;
use tokio::{sync::{mpsc, watch}, time};
use url::Url;
use crate::{
    acceptor::{Acceptor, ConnRx, ConnTx},
    announcer::{
        spawn_stopped_announcer, AnnounceStats, AnnouncerEvent, AnnouncerRx, AnnouncerTx,
        DhtAnnounce, DhtAnnouncer, PeriodicalAnnouncer, StatsTx, StopRx, StopTx,
    },
    block::BlockInfo,
    config::Config,
    infodl::{InfoDlError, InfoDlEvent, InfoDlRx, InfoDlTx, InfoDownload, MetadataEvent},
    metainfo::Info,
    p2p::{
        extension::{
            ExtendedHandshake, MetadataMessage, EXTENDED_HANDSHAKE_ID, METADATA_DATA,
            METADATA_PIECE_SIZE, METADATA_REJECT, METADATA_REQUEST, UT_METADATA_LOCAL_ID,
        },
        Message, PeerCommand, PeerEvent, PeerEventRx, PeerEventTx, PeerHandle, PeerTx,
        SessionParams,
    },
    picker::PiecePicker,
    piecedl::{BlockEvent, FailReason, PieceDlEvent, PieceDlRx, PieceDlTx, PieceDownload},
    pool::SharedBufferPool,
    ram::{GrantRx, GrantTx, RamBroker},
    storage::{
        allocator::{self, AllocatorEvent, AllocatorRx, AllocatorTx},
        verifier::{self, VerifierEvent, VerifierRx, VerifierTx},
        Storage, StorageError,
    },
    tracker,
    webseed::{WebseedDownload, WebseedEvent, WebseedRx, WebseedTx},
    Bitfield, ID,
};
use super::{Command, CommandRx, Phase, TorrentError, TorrentParams};

// Sanity cap on metadata_size advertised by peers.
const MAX_METADATA_SIZE: u32 = 16 * 1024 * 1024;

type WriteTx = mpsc::UnboundedSender<WriteResult>;
type WriteRx = mpsc::UnboundedReceiver<WriteResult>;

// Outcome of a blocking verify-and-write task.
#[derive(Debug)]
struct WriteResult {

    // The downloading peer, None for webseed pieces.
    peer: Option<ID>,

    piece: u32,

    hash_ok: bool,

    io: Result<(), StorageError>,

}

// Why a run cycle ended.
enum CycleEnd {

    // Stop command.
    Stop,

    Fatal(TorrentError),

    // Command channel closed, the Torrent handle is gone.
    Closed,

}

struct Peer {

    addr: SocketAddr,

    tx: PeerTx,

    peer_choking: bool,

    peer_interested: bool,

    am_choking: bool,

    am_interested: bool,

    downloading: bool,

    snubbed: bool,

    extension_protocol: bool,

    fast: bool,

    // (their message id, metadata_size) from the extended handshake.
    ut_metadata: Option<(u8, u32)>,

    // State received before the info arrived, replayed into the picker
    // once it exists.
    stashed_bitfield: Option<Bitfield>,

    stashed_have_all: bool,

    stashed_allowed_fast: Vec<u32>,

    // Waiting on a RAM grant before a piece download can start.
    ram_waiting: bool,

}

struct WebseedSource {

    url: Url,

    download: Option<WebseedDownload>,

    disabled_until: Option<Instant>,

    last_error: Option<String>,

}

#[derive(Debug, Clone, Copy)]
struct PieceRec {
    hash: ID,
    len: u32,
    done: bool,
    writing: bool,
}

// Everything created on start and torn down on stop. Each worker kind gets
// its own event channel; the controller keeps a sender clone so receivers
// stay open for the whole cycle.
struct Run {

    port: Option<u16>,

    announcing: bool,

    stop_txs: Vec<StopTx>,

    peer_event_tx: PeerEventTx,
    peer_event_rx: PeerEventRx,

    conn_tx: ConnTx,
    conn_rx: ConnRx,

    announcer_tx: AnnouncerTx,
    announcer_rx: AnnouncerRx,

    alloc_tx: AllocatorTx,
    alloc_rx: AllocatorRx,

    verifier_tx: VerifierTx,
    verifier_rx: VerifierRx,

    piecedl_tx: PieceDlTx,
    piecedl_rx: PieceDlRx,

    infodl_tx: InfoDlTx,
    infodl_rx: InfoDlRx,

    webseed_tx: WebseedTx,
    webseed_rx: WebseedRx,

    ram_tx: GrantTx,
    ram_rx: GrantRx,

    write_tx: WriteTx,
    write_rx: WriteRx,

    stats_tx: StatsTx,

    peers: HashMap<ID, Peer>,

    // Sessions still handshaking, keyed by address.
    connecting: HashMap<SocketAddr, PeerHandle>,

    known_addrs: HashSet<SocketAddr>,

    addr_queue: VecDeque<SocketAddr>,

    info_dls: HashMap<ID, InfoDownload>,

    info_dls_snubbed: HashSet<ID>,

    piece_dls: HashMap<ID, PieceDownload>,

    webseeds: Vec<WebseedSource>,

    picker: Option<PiecePicker>,

    storage: Option<Arc<Storage>>,

    pieces: Option<Vec<PieceRec>>,

    hashes: Option<Arc<Vec<ID>>>,

    ram: RamBroker,

}

impl Run {

    fn new(config: &Config, webseed_urls: &[Url]) -> Run {
        let (peer_event_tx, peer_event_rx) = mpsc::unbounded_channel();
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (announcer_tx, announcer_rx) = mpsc::unbounded_channel();
        let (alloc_tx, alloc_rx) = mpsc::unbounded_channel();
        let (verifier_tx, verifier_rx) = mpsc::unbounded_channel();
        let (piecedl_tx, piecedl_rx) = mpsc::unbounded_channel();
        let (infodl_tx, infodl_rx) = mpsc::unbounded_channel();
        let (webseed_tx, webseed_rx) = mpsc::unbounded_channel();
        let (ram_tx, ram_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (stats_tx, _) = watch::channel(AnnounceStats::default());

        Run {
            port: None,
            announcing: false,
            stop_txs: Vec::new(),
            peer_event_tx,
            peer_event_rx,
            conn_tx,
            conn_rx,
            announcer_tx,
            announcer_rx,
            alloc_tx,
            alloc_rx,
            verifier_tx,
            verifier_rx,
            piecedl_tx,
            piecedl_rx,
            infodl_tx,
            infodl_rx,
            webseed_tx,
            webseed_rx,
            ram_tx,
            ram_rx,
            write_tx,
            write_rx,
            stats_tx,
            peers: HashMap::new(),
            connecting: HashMap::new(),
            known_addrs: HashSet::new(),
            addr_queue: VecDeque::new(),
            info_dls: HashMap::new(),
            info_dls_snubbed: HashSet::new(),
            piece_dls: HashMap::new(),
            webseeds: webseed_urls
                .iter()
                .map(|url| WebseedSource {
                    url: url.clone(),
                    download: None,
                    disabled_until: None,
                    last_error: None,
                })
                .collect(),
            picker: None,
            storage: None,
            pieces: None,
            hashes: None,
            ram: RamBroker::new(config.ram_budget),
        }
    }

    fn stop_channel(&mut self) -> StopRx {
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        self.stop_txs.push(stop_tx);
        stop_rx
    }
}

// Single owner of all torrent state. Every mutation happens inside this
// task; workers only talk to it through the channels in Run.
pub(super) struct Controller {

    info_hash: ID,

    client_id: ID,

    config: Config,

    data_dir: PathBuf,

    tracker_urls: Vec<Url>,

    webseed_urls: Vec<Url>,

    dht: Option<Arc<dyn DhtAnnounce>>,

    pool: SharedBufferPool,

    cmd_rx: CommandRx,

    err_tx: mpsc::UnboundedSender<TorrentError>,

    // Survives stop cycles.
    info: Option<Info>,

    bitfield: Option<Bitfield>,

    phase: Phase,

    last_error: Option<String>,

    uploaded: u64,

    downloaded: u64,

    // Set by a handler that hit an unrecoverable fault; the cycle loop
    // picks it up after the handler returns.
    fatal: Option<TorrentError>,

}

impl Controller {

    pub(super) fn new(
        params: TorrentParams,
        pool: SharedBufferPool,
        cmd_rx: CommandRx,
        err_tx: mpsc::UnboundedSender<TorrentError>,
    ) -> Controller {
        let client_id = params.config.generate_client_id();
        Controller {
            info_hash: params.info_hash,
            client_id,
            data_dir: params.data_dir,
            tracker_urls: params.trackers,
            webseed_urls: params.webseeds,
            dht: params.dht,
            pool,
            cmd_rx,
            err_tx,
            info: params.info,
            bitfield: params.bitfield,
            config: params.config,
            phase: Phase::Stopped,
            last_error: None,
            uploaded: 0,
            downloaded: 0,
            fatal: None,
        }
    }

    pub(super) async fn run(&mut self) {

        loop {
            // Stopped: nothing but the command channel to watch.
            let cmd = match self.cmd_rx.recv().await {
                Some(cmd) => cmd,
                None => return,
            };
            match cmd {

                Command::Start => {
                    let mut run = match self.start().await {
                        Ok(run) => run,
                        Err(e) => {
                            self.report_fatal(e);
                            self.phase = Phase::Stopped;
                            continue;
                        },
                    };
                    let end = self.run_cycle(&mut run).await;
                    let closed = matches!(end, CycleEnd::Closed);
                    self.stop_cycle(run, end);
                    if closed {
                        return;
                    }
                },

                Command::Stop => {},

                Command::Port { tx } => { let _ = tx.send(None); },

                Command::Phase { tx } => { let _ = tx.send(self.phase); },

                Command::AddPeers(_) | Command::DhtPeers(_) => {},
            }
        }
    }

    // Entry sets keyed on how much of the torrent we already hold.
    async fn start(&mut self) -> Result<Run, TorrentError> {

        tracing::info!("starting torrent");
        let mut run = Run::new(&self.config, &self.webseed_urls);

        if self.info.is_none() {
            // Fetch the info dictionary from the swarm first.
            self.phase = Phase::AcquiringInfo;
            self.start_network(&mut run).await?;
        } else if self.bitfield.is_none() {
            // Data of unknown state on disk: allocate, verify, then join
            // the swarm.
            self.enter_allocating(&mut run)?;
        } else {
            // Everything known; go straight to transfers.
            self.setup_storage(&mut run)?;
            let bitfield = self.bitfield.clone().unwrap();
            self.finish_verification(&mut run, bitfield).await?;
        }

        Ok(run)
    }

    async fn run_cycle(&mut self, run: &mut Run) -> CycleEnd {

        let mut ticker = time::interval(time::Duration::from_secs(1));
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Start) => tracing::debug!("already started"),
                        Some(Command::Stop) => return CycleEnd::Stop,
                        Some(Command::Port { tx }) => { let _ = tx.send(run.port); },
                        Some(Command::Phase { tx }) => { let _ = tx.send(self.phase); },
                        Some(Command::AddPeers(addrs)) | Some(Command::DhtPeers(addrs)) => {
                            self.add_addresses(run, addrs);
                        },
                        None => return CycleEnd::Closed,
                    }
                }

                Some(event) = run.peer_event_rx.recv() => {
                    self.handle_peer_event(run, event);
                }

                Some((stream, addr, permit)) = run.conn_rx.recv() => {
                    self.handle_incoming_connection(run, stream, addr, permit);
                }

                Some(event) = run.announcer_rx.recv() => {
                    let AnnouncerEvent::Peers(addrs) = event;
                    self.add_addresses(run, addrs);
                }

                Some(event) = run.alloc_rx.recv() => {
                    self.handle_allocator_event(run, event).await;
                }

                Some(event) = run.verifier_rx.recv() => {
                    self.handle_verifier_event(run, event).await;
                }

                Some(event) = run.piecedl_rx.recv() => {
                    self.handle_piecedl_event(run, event);
                }

                Some(event) = run.infodl_rx.recv() => {
                    self.handle_infodl_event(run, event);
                }

                Some(event) = run.webseed_rx.recv() => {
                    self.handle_webseed_event(run, event);
                }

                Some(key) = run.ram_rx.recv() => {
                    self.handle_ram_grant(run, key);
                }

                Some(result) = run.write_rx.recv() => {
                    self.handle_write_result(run, result);
                }

                _ = ticker.tick() => {
                    self.tick(run);
                }

            }

            if let Some(e) = self.fatal.take() {
                return CycleEnd::Fatal(e);
            }
        }
    }

    fn stop_cycle(&mut self, mut run: Run, end: CycleEnd) {

        tracing::info!("stopping torrent");
        self.phase = Phase::Stopping;

        if let CycleEnd::Fatal(e) = end {
            self.report_fatal(e);
        }

        // Trackers hear "stopped" from a detached announcer so slow ones
        // cannot hold up teardown.
        if run.announcing {
            spawn_stopped_announcer(
                self.tracker_urls.clone(),
                self.info_hash,
                self.client_id,
                run.port.unwrap_or(0),
                self.announce_stats(),
                self.config.tracker_stopped_timeout,
            );
        }

        for peer in run.peers.values() {
            let _ = peer.tx.send(PeerCommand::Shutdown);
        }
        for handle in run.connecting.values() {
            let _ = handle.peer_tx.send(PeerCommand::Shutdown);
        }

        // Closing the stop channels ends the acceptor and announcers;
        // dropping the downloader handles closes their event channels.
        run.stop_txs.clear();
        run.piece_dls.clear();
        run.info_dls.clear();
        for source in run.webseeds.iter_mut() {
            source.download = None;
        }

        // Drain whatever the workers managed to send before the teardown.
        while run.peer_event_rx.try_recv().is_ok() {}
        while run.conn_rx.try_recv().is_ok() {}
        while run.announcer_rx.try_recv().is_ok() {}
        while run.alloc_rx.try_recv().is_ok() {}
        while run.verifier_rx.try_recv().is_ok() {}
        while run.piecedl_rx.try_recv().is_ok() {}
        while run.infodl_rx.try_recv().is_ok() {}
        while run.webseed_rx.try_recv().is_ok() {}
        while run.ram_rx.try_recv().is_ok() {}
        while run.write_rx.try_recv().is_ok() {}

        drop(run);
        self.phase = Phase::Stopped;
        tracing::info!("torrent stopped");
    }

    fn report_fatal(&mut self, e: TorrentError) {
        tracing::error!("fatal: {}", e);
        self.last_error = Some(e.to_string());
        let _ = self.err_tx.send(e);
    }

    // ---- phase transitions ----------------------------------------------

    async fn start_network(&mut self, run: &mut Run) -> Result<(), TorrentError> {

        let acceptor = Acceptor::bind(self.config.port, self.config.max_accept).await?;
        let port = acceptor.local_port()?;
        run.port = Some(port);
        acceptor.spawn(run.conn_tx.clone(), run.stop_channel());
        tracing::info!("listening on port {}", port);

        let _ = run.stats_tx.send(self.announce_stats());
        for url in self.tracker_urls.clone() {
            let tracker = match tracker::create(&url).await {
                Ok(tracker) => tracker,
                Err(e) => {
                    tracing::warn!("skipping tracker {}: {}", url, e);
                    continue;
                },
            };
            PeriodicalAnnouncer::spawn(
                tracker,
                self.info_hash,
                self.client_id,
                port,
                self.config.tracker_num_want,
                self.config.tracker_min_announce_interval,
                self.config.tracker_backoff_max,
                run.stats_tx.subscribe(),
                run.announcer_tx.clone(),
                run.stop_channel(),
            );
        }

        if let Some(dht) = &self.dht {
            DhtAnnouncer::spawn(
                Arc::clone(dht),
                self.info_hash,
                port,
                self.config.dht_announce_interval,
                self.config.dht_min_announce_interval,
                run.stop_channel(),
            );
        }

        run.announcing = true;
        Ok(())
    }

    fn setup_storage(&mut self, run: &mut Run) -> Result<(), TorrentError> {
        let info = self.info.as_ref().expect("storage setup without info");
        let storage = Arc::new(Storage::new(
            info,
            &self.data_dir,
            self.config.piece_read_cache_size,
        )?);
        let hashes = Arc::new(info.piece_hashes());
        let pieces = hashes
            .iter()
            .enumerate()
            .map(|(idx, hash)| PieceRec {
                hash: *hash,
                len: info.piece_len(idx as u32) as u32,
                done: false,
                writing: false,
            })
            .collect();
        run.storage = Some(storage);
        run.hashes = Some(hashes);
        run.pieces = Some(pieces);
        Ok(())
    }

    fn enter_allocating(&mut self, run: &mut Run) -> Result<(), TorrentError> {
        self.setup_storage(run)?;
        self.phase = Phase::Allocating;
        let storage = Arc::clone(run.storage.as_ref().unwrap());
        allocator::spawn(storage, run.alloc_tx.clone());
        Ok(())
    }

    async fn handle_allocator_event(&mut self, run: &mut Run, event: AllocatorEvent) {
        match event {
            AllocatorEvent::Progress { bytes } => {
                tracing::debug!("allocated {} bytes", bytes);
            },
            AllocatorEvent::Done(Ok(())) => {
                let num_pieces = run.storage.as_ref().unwrap().num_pieces();
                if num_pieces == 0 {
                    // Nothing to verify; an empty torrent is complete.
                    let empty = Bitfield::new();
                    if let Err(e) = self.finish_verification(run, empty).await {
                        self.fatal = Some(e);
                    }
                } else {
                    self.phase = Phase::Verifying;
                    verifier::spawn(
                        Arc::clone(run.storage.as_ref().unwrap()),
                        Arc::clone(run.hashes.as_ref().unwrap()),
                        run.verifier_tx.clone(),
                    );
                }
            },
            AllocatorEvent::Done(Err(e)) => {
                self.fatal = Some(e.into());
            },
        }
    }

    async fn handle_verifier_event(&mut self, run: &mut Run, event: VerifierEvent) {
        match event {
            VerifierEvent::Progress { checked } => {
                tracing::debug!("verified {} pieces", checked);
            },
            VerifierEvent::Done(Ok(bitfield)) => {
                if let Err(e) = self.finish_verification(run, bitfield).await {
                    self.fatal = Some(e);
                }
            },
            VerifierEvent::Done(Err(e)) => {
                self.fatal = Some(e.into());
            },
        }
    }

    // Verification (or resume data) produced the bitfield: mark done
    // pieces, build the picker, join the swarm, start transfers.
    async fn finish_verification(
        &mut self,
        run: &mut Run,
        bitfield: Bitfield,
    ) -> Result<(), TorrentError> {

        if let Some(pieces) = run.pieces.as_mut() {
            for idx in bitfield.iter_ones() {
                if let Some(piece) = pieces.get_mut(idx) {
                    piece.done = true;
                }
            }
        }
        self.bitfield = Some(bitfield.clone());

        let mut picker = PiecePicker::new(bitfield, StdRng::from_entropy());

        // Replay peer state that arrived before the picker existed.
        let num_pieces = picker.num_pieces() as usize;
        for (id, peer) in run.peers.iter_mut() {
            if peer.stashed_have_all {
                picker.handle_have_all(*id);
            }
            if let Some(mut bits) = peer.stashed_bitfield.take() {
                bits.resize(num_pieces, false);
                picker.handle_bitfield(*id, &bits);
            }
            for idx in peer.stashed_allowed_fast.drain(..) {
                picker.handle_allowed_fast(*id, idx);
            }
            peer.stashed_have_all = false;
        }

        self.phase = if picker.is_complete() { Phase::Seeding } else { Phase::Downloading };
        run.picker = Some(picker);
        tracing::info!(
            "verification complete, {} phase",
            if self.phase == Phase::Seeding { "seeding" } else { "downloading" },
        );

        if !run.announcing {
            self.start_network(run).await?;
        }
        let _ = run.stats_tx.send(self.announce_stats());

        let ids: Vec<ID> = run.peers.keys().copied().collect();
        for id in ids {
            self.update_interest(run, &id);
        }
        self.start_downloaders(run);
        Ok(())
    }

    fn enter_seeding(&mut self, run: &mut Run) {
        self.phase = Phase::Seeding;
        tracing::info!("download complete, seeding");
        let _ = run.stats_tx.send(self.announce_stats());
        for source in run.webseeds.iter_mut() {
            source.download = None;
        }
    }

    // ---- peers ----------------------------------------------------------

    fn add_addresses(&mut self, run: &mut Run, addrs: Vec<SocketAddr>) {
        for addr in addrs {
            if run.known_addrs.insert(addr) {
                run.addr_queue.push_back(addr);
            }
        }
        self.dial_peers(run);
    }

    fn dial_peers(&mut self, run: &mut Run) {
        if !run.announcing {
            return;
        }
        while run.peers.len() + run.connecting.len() < self.config.max_peers {
            let addr = match run.addr_queue.pop_front() {
                Some(addr) => addr,
                None => return,
            };
            if run.connecting.contains_key(&addr) {
                continue;
            }
            let handle = PeerHandle::spawn(
                self.session_params(addr),
                run.peer_event_tx.clone(),
                None,
                None,
            );
            run.connecting.insert(addr, handle);
        }
    }

    fn handle_incoming_connection(
        &mut self,
        run: &mut Run,
        stream: tokio::net::TcpStream,
        addr: SocketAddr,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        if run.peers.len() + run.connecting.len() >= self.config.max_peers {
            tracing::debug!("at peer limit, dropping inbound connection from {}", addr);
            return;
        }
        let handle = PeerHandle::spawn(
            self.session_params(addr),
            run.peer_event_tx.clone(),
            Some(stream),
            Some(permit),
        );
        run.connecting.insert(addr, handle);
    }

    fn session_params(&self, addr: SocketAddr) -> SessionParams {
        SessionParams {
            addr,
            info_hash: self.info_hash,
            client_id: self.client_id,
            metadata_size: self.info.as_ref().map(|i| i.as_bytes().len() as u32),
            idle_timeout: self.config.peer_idle_timeout,
        }
    }

    fn handle_peer_event(&mut self, run: &mut Run, event: PeerEvent) {
        match event {

            PeerEvent::Connected { addr, id, extension_protocol, fast } => {
                self.handle_peer_connected(run, addr, id, extension_protocol, fast);
            },

            PeerEvent::Msg { id, msg } => {
                if run.peers.contains_key(&id) {
                    self.handle_peer_msg(run, id, msg);
                }
            },

            PeerEvent::Disconnected { addr, id } => {
                run.connecting.remove(&addr);
                if let Some(id) = id {
                    if run.peers.get(&id).map_or(false, |p| p.addr == addr) {
                        self.cleanup_peer(run, &id);
                        tracing::debug!("peer {} disconnected", hex::encode(id));
                    }
                }
            },
        }
    }

    fn handle_peer_connected(
        &mut self,
        run: &mut Run,
        addr: SocketAddr,
        id: ID,
        extension_protocol: bool,
        fast: bool,
    ) {
        let handle = match run.connecting.remove(&addr) {
            Some(handle) => handle,
            None => return,
        };

        // De-duplicate by peer id, first connection wins. Our own id means
        // we dialed ourselves.
        if id == self.client_id || run.peers.contains_key(&id) {
            let _ = handle.peer_tx.send(PeerCommand::Shutdown);
            return;
        }

        // Introduce ourselves with what we have.
        let bitfield = self.bitfield.as_ref();
        if fast && bitfield.map_or(false, |b| b.all() && !b.is_empty()) {
            let _ = handle.peer_tx.send(PeerCommand::Send(Message::HaveAll));
        } else if fast && bitfield.map_or(true, |b| b.not_any()) {
            let _ = handle.peer_tx.send(PeerCommand::Send(Message::HaveNone));
        } else if let Some(bitfield) = bitfield {
            if bitfield.any() {
                let _ = handle.peer_tx.send(PeerCommand::Send(Message::Bitfield(bitfield.clone())));
            }
        }

        run.peers.insert(id, Peer {
            addr,
            tx: handle.peer_tx,
            peer_choking: true,
            peer_interested: false,
            am_choking: true,
            am_interested: false,
            downloading: false,
            snubbed: false,
            extension_protocol,
            fast,
            ut_metadata: None,
            stashed_bitfield: None,
            stashed_have_all: false,
            stashed_allowed_fast: Vec::new(),
            ram_waiting: false,
        });
        tracing::debug!("peer {} connected from {}", hex::encode(id), addr);
    }

    fn cleanup_peer(&mut self, run: &mut Run, id: &ID) {
        let peer = match run.peers.remove(id) {
            Some(peer) => peer,
            None => return,
        };
        if let Some(picker) = run.picker.as_mut() {
            picker.handle_peer_disconnect(id);
        }
        run.ram.cancel(id);
        if run.piece_dls.remove(id).is_some() {
            debug_assert!(peer.downloading);
            run.ram.release(self.piece_reserve());
        }
        run.info_dls.remove(id);
        run.info_dls_snubbed.remove(id);
        self.start_downloaders(run);
    }

    fn disconnect_peer(&mut self, run: &mut Run, id: &ID) {
        if let Some(peer) = run.peers.get(id) {
            let _ = peer.tx.send(PeerCommand::Shutdown);
        }
        self.cleanup_peer(run, id);
    }

    // ---- message routing ------------------------------------------------

    fn handle_peer_msg(&mut self, run: &mut Run, id: ID, msg: Message) {
        match msg {

            Message::Bitfield(bits) => {
                match run.picker.as_mut() {
                    Some(picker) => {
                        let mut bits = bits;
                        bits.resize(picker.num_pieces() as usize, false);
                        picker.handle_bitfield(id, &bits);
                        self.update_interest(run, &id);
                        self.start_downloaders(run);
                    },
                    None => {
                        if let Some(peer) = run.peers.get_mut(&id) {
                            peer.stashed_bitfield = Some(bits);
                        }
                    },
                }
            },

            Message::Have { idx } => {
                match run.picker.as_mut() {
                    Some(picker) => {
                        if idx >= picker.num_pieces() {
                            tracing::warn!("have with invalid index {}", idx);
                            self.disconnect_peer(run, &id);
                            return;
                        }
                        picker.handle_have(id, idx);
                        self.update_interest(run, &id);
                        self.start_downloaders(run);
                    },
                    None => {
                        if let Some(peer) = run.peers.get_mut(&id) {
                            let bits = peer.stashed_bitfield.get_or_insert_with(Bitfield::new);
                            if bits.len() <= idx as usize {
                                bits.resize(idx as usize + 1, false);
                            }
                            bits.set(idx as usize, true);
                        }
                    },
                }
            },

            Message::HaveAll => {
                match run.picker.as_mut() {
                    Some(picker) => {
                        picker.handle_have_all(id);
                        self.update_interest(run, &id);
                        self.start_downloaders(run);
                    },
                    None => {
                        if let Some(peer) = run.peers.get_mut(&id) {
                            peer.stashed_have_all = true;
                        }
                    },
                }
            },

            Message::HaveNone => {},

            Message::AllowedFast { idx } => {
                match run.picker.as_mut() {
                    Some(picker) => {
                        picker.handle_allowed_fast(id, idx);
                        self.start_downloaders(run);
                    },
                    None => {
                        if let Some(peer) = run.peers.get_mut(&id) {
                            peer.stashed_allowed_fast.push(idx);
                        }
                    },
                }
            },

            Message::SuggestPiece { .. } => {},

            Message::Unchoke => {
                if let Some(peer) = run.peers.get_mut(&id) {
                    peer.peer_choking = false;
                }
                self.start_piece_downloader_for(run, &id);
            },

            Message::Choke => {
                if let Some(peer) = run.peers.get_mut(&id) {
                    peer.peer_choking = true;
                }
                if let Some(dl) = run.piece_dls.get(&id) {
                    let _ = dl.block_tx.send(BlockEvent::Choked);
                }
            },

            Message::Interested => {
                // Reciprocal unchoke; upload slots are not rationed here.
                if let Some(peer) = run.peers.get_mut(&id) {
                    peer.peer_interested = true;
                    if peer.am_choking {
                        peer.am_choking = false;
                        let _ = peer.tx.send(PeerCommand::Send(Message::Unchoke));
                    }
                }
            },

            Message::NotInterested => {
                if let Some(peer) = run.peers.get_mut(&id) {
                    peer.peer_interested = false;
                    if !peer.am_choking {
                        peer.am_choking = true;
                        let _ = peer.tx.send(PeerCommand::Send(Message::Choke));
                    }
                }
            },

            Message::Block(block) => {
                self.downloaded += block.data.len() as u64;
                let piece = block.piece_idx;

                // Endgame: everyone else racing for this piece can drop
                // the matching request.
                let offset = block.offset;
                for (other, dl) in run.piece_dls.iter() {
                    if *other != id && dl.piece == piece {
                        let _ = dl.block_tx.send(BlockEvent::Ceded { offset });
                    }
                }

                if let Some(dl) = run.piece_dls.get(&id) {
                    if dl.piece == piece {
                        let _ = dl.block_tx.send(BlockEvent::Block {
                            offset: block.offset,
                            data: block.data,
                        });
                    }
                }
            },

            Message::Request(request) => {
                self.handle_block_request(run, &id, request);
            },

            Message::RejectRequest(request) => {
                if let Some(dl) = run.piece_dls.get(&id) {
                    if dl.piece == request.piece_idx {
                        let _ = dl.block_tx.send(BlockEvent::Rejected { offset: request.offset });
                    }
                }
            },

            Message::Cancel(_) => {
                // Reads are already in flight by the time a cancel lands;
                // the extra block is harmless.
            },

            Message::Extended { id: ext_id, payload } => {
                self.handle_extended_msg(run, id, ext_id, payload);
            },

            Message::KeepAlive | Message::Port { .. } => {},
        }
    }

    fn handle_block_request(&mut self, run: &mut Run, id: &ID, request: BlockInfo) {
        let peer = match run.peers.get(id) {
            Some(peer) => peer,
            None => return,
        };
        let reject = |peer: &Peer| {
            if peer.fast {
                let _ = peer.tx.send(PeerCommand::Send(Message::RejectRequest(request)));
            }
        };

        if peer.am_choking {
            reject(peer);
            return;
        }
        let done = run.pieces
            .as_ref()
            .and_then(|pieces| pieces.get(request.piece_idx as usize))
            .map_or(false, |p| p.done);
        if !done || request.len as usize > 2 * crate::BLOCK_SIZE {
            reject(peer);
            return;
        }

        let storage = match run.storage.as_ref() {
            Some(storage) => Arc::clone(storage),
            None => return,
        };
        self.uploaded += request.len as u64;
        let _ = run.stats_tx.send(self.announce_stats());

        // Read off the controller task; the block goes straight back to
        // the session.
        let peer_tx = peer.tx.clone();
        tokio::task::spawn_blocking(move || {
            match storage.read_block(&request) {
                Ok(data) => {
                    let _ = peer_tx.send(PeerCommand::Send(Message::Block(crate::block::BlockData {
                        piece_idx: request.piece_idx,
                        offset: request.offset,
                        data,
                    })));
                },
                Err(e) => {
                    tracing::warn!("block read failed: {}", e);
                },
            }
        });
    }

    fn handle_extended_msg(&mut self, run: &mut Run, id: ID, ext_id: u8, payload: Vec<u8>) {

        if ext_id == EXTENDED_HANDSHAKE_ID {
            let handshake = match ExtendedHandshake::from_bytes(&payload) {
                Ok(handshake) => handshake,
                Err(e) => {
                    tracing::warn!("bad extended handshake: {}", e);
                    self.disconnect_peer(run, &id);
                    return;
                },
            };
            if let Some(peer) = run.peers.get_mut(&id) {
                if let (Some(msg_id), Some(size)) = (handshake.ut_metadata(), handshake.metadata_size) {
                    if size > 0 && size <= MAX_METADATA_SIZE {
                        peer.ut_metadata = Some((msg_id, size));
                    }
                } else if let Some(msg_id) = handshake.ut_metadata() {
                    // Peers that know our metadata size may omit theirs.
                    if let Some(info) = &self.info {
                        peer.ut_metadata = Some((msg_id, info.as_bytes().len() as u32));
                    }
                }
            }
            self.start_info_downloaders(run);
            return;
        }

        if ext_id != UT_METADATA_LOCAL_ID {
            return;
        }
        let (header, data) = match MetadataMessage::decode(&payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!("bad ut_metadata message: {}", e);
                self.disconnect_peer(run, &id);
                return;
            },
        };

        match header.msg_type {

            METADATA_REQUEST => self.serve_metadata(run, &id, header.piece),

            METADATA_DATA => {
                if let Some(dl) = run.info_dls.get(&id) {
                    let _ = dl.data_tx.send(MetadataEvent::Data {
                        piece: header.piece,
                        data: data.to_vec(),
                    });
                }
            },

            METADATA_REJECT => {
                if let Some(dl) = run.info_dls.get(&id) {
                    let _ = dl.data_tx.send(MetadataEvent::Reject { piece: header.piece });
                }
            },

            other => tracing::debug!("unknown ut_metadata type {}", other),
        }
    }

    fn serve_metadata(&mut self, run: &mut Run, id: &ID, piece: u32) {
        let peer = match run.peers.get(id) {
            Some(peer) => peer,
            None => return,
        };
        // Responses go out under the id the peer advertised.
        let their_id = match peer.ut_metadata {
            Some((their_id, _)) => their_id,
            None => return,
        };

        let payload = match &self.info {
            Some(info) => {
                let raw = info.as_bytes();
                let start = piece as usize * METADATA_PIECE_SIZE;
                if start < raw.len() {
                    let end = (start + METADATA_PIECE_SIZE).min(raw.len());
                    MetadataMessage::encode_data(piece, raw.len() as u32, &raw[start..end])
                } else {
                    MetadataMessage::reject(piece).to_bytes()
                }
            },
            None => MetadataMessage::reject(piece).to_bytes(),
        };
        if let Ok(payload) = payload {
            let _ = peer.tx.send(PeerCommand::Send(Message::Extended { id: their_id, payload }));
        }
    }

    // Interested exactly when the peer holds a piece we miss.
    fn update_interest(&mut self, run: &mut Run, id: &ID) {
        let interested = run.picker
            .as_ref()
            .map_or(false, |picker| picker.interested_in(id));
        if let Some(peer) = run.peers.get_mut(id) {
            if interested && !peer.am_interested {
                peer.am_interested = true;
                let _ = peer.tx.send(PeerCommand::Send(Message::Interested));
            } else if !interested && peer.am_interested {
                peer.am_interested = false;
                let _ = peer.tx.send(PeerCommand::Send(Message::NotInterested));
            }
        }
    }

    // ---- info download --------------------------------------------------

    fn start_info_downloaders(&mut self, run: &mut Run) {
        if self.phase != Phase::AcquiringInfo {
            return;
        }
        let candidates: Vec<(ID, u8, u32)> = run.peers
            .iter()
            .filter(|(id, peer)| {
                peer.extension_protocol
                    && peer.ut_metadata.is_some()
                    && !run.info_dls.contains_key(*id)
            })
            .map(|(id, peer)| {
                let (msg_id, size) = peer.ut_metadata.unwrap();
                (*id, msg_id, size)
            })
            .collect();

        for (id, msg_id, size) in candidates {
            let active = run.info_dls.len() - run.info_dls_snubbed.len();
            if active >= self.config.parallel_metadata_downloads {
                return;
            }
            let peer_tx = run.peers[&id].tx.clone();
            tracing::debug!("starting info download from {}", hex::encode(id));
            let dl = InfoDownload::spawn(
                id,
                self.info_hash,
                size,
                msg_id,
                self.config.snub_timeout,
                peer_tx,
                run.infodl_tx.clone(),
            );
            run.info_dls.insert(id, dl);
        }
    }

    fn handle_infodl_event(&mut self, run: &mut Run, event: InfoDlEvent) {
        match event {

            InfoDlEvent::Snubbed { peer } => {
                if run.info_dls.contains_key(&peer) {
                    run.info_dls_snubbed.insert(peer);
                    // A replacement may start; the snubbed one races on.
                    self.start_info_downloaders(run);
                }
            },

            InfoDlEvent::Done { peer, info } => {
                // First completion wins.
                if self.info.is_some() {
                    return;
                }
                tracing::info!("info acquired from {}", hex::encode(peer));
                run.info_dls.clear();
                run.info_dls_snubbed.clear();

                match Info::from_bytes(&info) {
                    Ok(info) => {
                        debug_assert_eq!(info.info_hash(), self.info_hash);
                        self.info = Some(info);
                        if let Err(e) = self.enter_allocating(run) {
                            self.fatal = Some(e);
                        }
                    },
                    // The blob hashed correctly but doesn't parse; the
                    // torrent itself is unusable.
                    Err(e) => {
                        self.fatal = Some(e.into());
                    },
                }
            },

            InfoDlEvent::Failed { peer, reason } => {
                run.info_dls.remove(&peer);
                run.info_dls_snubbed.remove(&peer);
                match reason {
                    InfoDlError::HashMismatch => {
                        self.fatal = Some(TorrentError::InfoHashMismatch);
                    },
                    InfoDlError::BadPiece => {
                        self.disconnect_peer(run, &peer);
                        self.start_info_downloaders(run);
                    },
                    InfoDlError::Rejected => {
                        self.start_info_downloaders(run);
                    },
                }
            },
        }
    }

    // ---- piece download -------------------------------------------------

    fn piece_reserve(&self) -> usize {
        self.info
            .as_ref()
            .map(|info| info.piece_length as usize)
            .unwrap_or(0)
    }

    // Fan-out: whenever a peer unchokes, a piece completes or the picker
    // changes, look for idle peers and webseed sources to put to work.
    fn start_downloaders(&mut self, run: &mut Run) {
        if self.phase != Phase::Downloading {
            return;
        }
        let ids: Vec<ID> = run.peers.keys().copied().collect();
        for id in ids {
            self.start_piece_downloader_for(run, &id);
        }
        self.start_webseed_downloaders(run);
    }

    fn start_piece_downloader_for(&mut self, run: &mut Run, id: &ID) {
        if self.phase != Phase::Downloading || run.picker.is_none() {
            return;
        }
        if run.piece_dls.len() >= self.config.simultaneous_piece_downloads {
            return;
        }
        let peer = match run.peers.get(id) {
            Some(peer) => peer,
            None => return,
        };
        if peer.downloading || peer.ram_waiting {
            return;
        }
        // A choking peer is only useful for allowed-fast pieces.
        if peer.peer_choking && !peer.fast {
            return;
        }
        if !run.picker.as_ref().unwrap().interested_in(id) {
            return;
        }

        // Admission first: the piece buffer counts against the RAM budget
        // before any request goes out.
        if !run.ram.request(*id, self.piece_reserve(), run.ram_tx.clone()) {
            if let Some(peer) = run.peers.get_mut(id) {
                peer.ram_waiting = true;
            }
            return;
        }
        self.start_piece_downloader_with_reservation(run, id);
    }

    // The RAM reservation is already held.
    fn start_piece_downloader_with_reservation(&mut self, run: &mut Run, id: &ID) {
        let picker = run.picker.as_mut().unwrap();
        let pick = match picker.pick_for(*id) {
            Some(pick) => pick,
            None => {
                run.ram.release(self.piece_reserve());
                return;
            },
        };
        let peer = run.peers.get_mut(id).unwrap();
        if peer.peer_choking && !pick.allowed_fast {
            run.picker.as_mut().unwrap().release(id, pick.piece);
            run.ram.release(self.piece_reserve());
            return;
        }

        peer.downloading = true;
        let piece_len = run.storage.as_ref().unwrap().piece_len(pick.piece);
        tracing::debug!(
            "starting piece {} download from {}{}",
            pick.piece,
            hex::encode(id),
            if pick.endgame { " (endgame)" } else { "" },
        );
        let dl = PieceDownload::spawn(
            *id,
            pick.piece,
            piece_len,
            self.config.request_queue_len,
            self.config.snub_timeout,
            Arc::clone(&self.pool),
            peer.tx.clone(),
            run.piecedl_tx.clone(),
        );
        run.piece_dls.insert(*id, dl);
    }

    fn handle_ram_grant(&mut self, run: &mut Run, key: ID) {
        match run.peers.get_mut(&key) {
            Some(peer) => {
                peer.ram_waiting = false;
                if peer.downloading || self.phase != Phase::Downloading {
                    run.ram.release(self.piece_reserve());
                    return;
                }
                self.start_piece_downloader_with_reservation(run, &key);
            },
            // Peer left while queued; the broker reserved on grant.
            None => run.ram.release(self.piece_reserve()),
        }
    }

    fn handle_piecedl_event(&mut self, run: &mut Run, event: PieceDlEvent) {
        match event {

            PieceDlEvent::Snubbed { peer, piece } => {
                if let Some(p) = run.peers.get_mut(&peer) {
                    p.snubbed = true;
                }
                if let Some(picker) = run.picker.as_mut() {
                    picker.handle_snubbed(&peer, piece);
                }
                // Someone else may pick the piece up now.
                self.start_downloaders(run);
            },

            PieceDlEvent::Done { peer, piece, data } => {
                if run.piece_dls.remove(&peer).is_none() {
                    self.pool.put(data);
                    return;
                }
                if let Some(p) = run.peers.get_mut(&peer) {
                    p.downloading = false;
                    p.snubbed = false;
                }
                self.schedule_write(run, Some(peer), piece, data, true);
            },

            PieceDlEvent::Failed { peer, piece, reason } => {
                if run.piece_dls.remove(&peer).is_some() {
                    run.ram.release(self.piece_reserve());
                }
                if let Some(p) = run.peers.get_mut(&peer) {
                    p.downloading = false;
                }
                if let Some(picker) = run.picker.as_mut() {
                    picker.release(&peer, piece);
                }
                match reason {
                    // Unsolicited or malformed blocks are protocol
                    // violations.
                    FailReason::BadBlock => self.disconnect_peer(run, &peer),
                    FailReason::Choked | FailReason::Rejected | FailReason::Ceded => {},
                }
                self.start_downloaders(run);
            },
        }
    }

    // Hash-check (unless the source already verified it) and write a piece
    // on the blocking pool. The outcome comes back on the write channel.
    fn schedule_write(
        &mut self,
        run: &mut Run,
        peer: Option<ID>,
        piece: u32,
        data: Vec<u8>,
        verify: bool,
    ) {
        let rec = match run.pieces.as_mut().and_then(|p| p.get_mut(piece as usize)) {
            Some(rec) => rec,
            None => {
                self.pool.put(data);
                return;
            },
        };
        if rec.done || rec.writing {
            // Duplicate completion, possible in endgame.
            self.pool.put(data);
            if peer.is_some() {
                run.ram.release(self.piece_reserve());
            }
            return;
        }
        rec.writing = true;

        let hash = rec.hash;
        let storage = Arc::clone(run.storage.as_ref().unwrap());
        let write_tx = run.write_tx.clone();
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || {
            let hash_ok = !verify || {
                let mut hasher = sha1::Sha1::new();
                hasher.update(&data);
                let actual: ID = hasher.finalize().into();
                actual == hash
            };
            let io = if hash_ok { storage.write_piece(piece, &data) } else { Ok(()) };
            pool.put(data);
            let _ = write_tx.send(WriteResult { peer, piece, hash_ok, io });
        });
    }

    fn handle_write_result(&mut self, run: &mut Run, result: WriteResult) {

        if let Some(rec) = run.pieces.as_mut().and_then(|p| p.get_mut(result.piece as usize)) {
            rec.writing = false;
        }
        if result.peer.is_some() {
            run.ram.release(self.piece_reserve());
        }

        if let Err(e) = result.io {
            self.fatal = Some(e.into());
            return;
        }

        if !result.hash_ok {
            tracing::warn!("piece {} failed hash verification", result.piece);
            if let (Some(peer), Some(picker)) = (result.peer.as_ref(), run.picker.as_mut()) {
                picker.release(peer, result.piece);
                // A peer that fed us a corrupt piece is not worth keeping.
                let peer = *peer;
                self.disconnect_peer(run, &peer);
            }
            self.start_downloaders(run);
            return;
        }

        // The piece is verified and durable.
        if let Some(rec) = run.pieces.as_mut().and_then(|p| p.get_mut(result.piece as usize)) {
            rec.done = true;
        }
        if let Some(bitfield) = self.bitfield.as_mut() {
            bitfield.set(result.piece as usize, true);
        }
        let complete = match run.picker.as_mut() {
            Some(picker) => {
                picker.mark_piece_done(result.piece);
                picker.is_complete()
            },
            None => false,
        };
        tracing::info!(
            "piece {} done, {} missing",
            result.piece,
            run.picker.as_ref().map_or(0, |p| p.num_missing()),
        );

        // Anyone still racing for this piece in endgame is wasting both
        // sides' bandwidth.
        let racers: Vec<ID> = run.piece_dls
            .iter()
            .filter(|(_, dl)| dl.piece == result.piece)
            .map(|(id, _)| *id)
            .collect();
        for id in racers {
            run.piece_dls.remove(&id);
            run.ram.release(self.piece_reserve());
            if let Some(peer) = run.peers.get_mut(&id) {
                peer.downloading = false;
            }
        }

        for peer in run.peers.values() {
            let _ = peer.tx.send(PeerCommand::Send(Message::Have { idx: result.piece }));
        }
        let ids: Vec<ID> = run.peers.keys().copied().collect();
        for id in ids {
            self.update_interest(run, &id);
        }
        let _ = run.stats_tx.send(self.announce_stats());

        if complete {
            self.enter_seeding(run);
        } else {
            self.start_downloaders(run);
        }
    }

    // ---- webseeds -------------------------------------------------------

    fn start_webseed_downloaders(&mut self, run: &mut Run) {
        if self.phase != Phase::Downloading {
            return;
        }
        let info = match &self.info {
            Some(info) => info,
            None => return,
        };

        for idx in 0..run.webseeds.len() {
            let source = &run.webseeds[idx];
            if source.download.is_some() {
                continue;
            }
            if source.disabled_until.map_or(false, |until| until > Instant::now()) {
                continue;
            }
            let range = match run.picker.as_mut().unwrap().pick_webseed(idx) {
                Some(range) => range,
                None => continue,
            };

            // A url ending in / names a directory laid out like the
            // torrent; otherwise it is the content itself.
            let source = &mut run.webseeds[idx];
            let url = if source.url.path().ends_with('/') {
                match source.url.join(&info.name) {
                    Ok(url) => url,
                    Err(_) => source.url.clone(),
                }
            } else {
                source.url.clone()
            };

            tracing::debug!("webseed {} takes pieces {}..{}", url, range.start, range.end);
            source.download = Some(WebseedDownload::spawn(
                idx,
                url,
                range,
                run.picker.as_ref().unwrap().webseed_ranges(),
                Arc::clone(run.hashes.as_ref().unwrap()),
                info.piece_length as usize,
                info.total_len(),
                self.config.webseed_response_body_read_timeout,
                Arc::clone(&self.pool),
                run.webseed_tx.clone(),
            ));
        }
    }

    fn handle_webseed_event(&mut self, run: &mut Run, event: WebseedEvent) {
        match event {

            WebseedEvent::Piece { source: _, piece, data } => {
                // Already verified against the piece hash by the
                // downloader.
                self.schedule_write(run, None, piece, data, false);
            },

            WebseedEvent::RangeDone { source } => {
                if let Some(picker) = run.picker.as_mut() {
                    picker.webseed_done(source);
                }
                if let Some(src) = run.webseeds.get_mut(source) {
                    src.download = None;
                }
                self.start_webseed_downloaders(run);
            },

            WebseedEvent::Failed { source, error } => {
                tracing::warn!("webseed source {} failed: {}", source, error);
                if let Some(picker) = run.picker.as_mut() {
                    picker.webseed_done(source);
                }
                // Webseed faults are per-source transients; the source
                // sits out the retry interval and the swarm picks up the
                // slack.
                if let Some(src) = run.webseeds.get_mut(source) {
                    src.download = None;
                    src.last_error = Some(error.to_string());
                    src.disabled_until = Some(Instant::now() + self.config.webseed_retry_interval);
                }
                self.start_downloaders(run);
            },
        }
    }

    // ---- stats & ticking ------------------------------------------------

    fn bytes_left(&self) -> u64 {
        let info = match &self.info {
            Some(info) => info,
            None => return 0,
        };
        match &self.bitfield {
            Some(bitfield) => {
                let done: u64 = bitfield
                    .iter_ones()
                    .map(|idx| info.piece_len(idx as u32) as u64)
                    .sum();
                info.total_len() - done
            },
            None => info.total_len(),
        }
    }

    fn announce_stats(&self) -> AnnounceStats {
        let left = self.bytes_left();
        AnnounceStats {
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            left,
            completed: self.info.is_some() && left == 0,
        }
    }

    fn tick(&mut self, run: &mut Run) {

        // Re-enable webseed sources whose penalty expired.
        let mut reenabled = false;
        for source in run.webseeds.iter_mut() {
            if let Some(until) = source.disabled_until {
                if until <= Instant::now() {
                    source.disabled_until = None;
                    reenabled = true;
                }
            }
        }
        if reenabled {
            self.start_webseed_downloaders(run);
        }

        self.dial_peers(run);
        // Downloaders can stall behind transient conditions; the tick is a
        // catch-all re-evaluation.
        self.start_downloaders(run);
        if self.phase == Phase::AcquiringInfo {
            self.start_info_downloaders(run);
        }

        #[cfg(debug_assertions)]
        self.assert_invariants(run);
    }

    #[cfg(debug_assertions)]
    fn assert_invariants(&self, run: &Run) {
        for (id, peer) in run.peers.iter() {
            debug_assert_eq!(
                peer.downloading,
                run.piece_dls.contains_key(id),
                "downloading flag out of sync",
            );
            debug_assert!(
                !(run.piece_dls.contains_key(id) && run.info_dls.contains_key(id)),
                "peer in both downloader sets",
            );
        }
        let unsnubbed = run.info_dls.len() - run.info_dls_snubbed.len();
        debug_assert!(unsnubbed <= self.config.parallel_metadata_downloads);
        for source in run.webseeds.iter() {
            debug_assert!(source.download.is_none() || source.disabled_until.is_none());
        }
    }
}
