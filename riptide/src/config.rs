use std::time::Duration;

// Client id prefix, Azureus style.
const CLIENT_ID_PREFIX: &[u8; 8] = b"-RT0010-";

#[derive(Debug, Clone)]
pub struct Config {

    // Port to listen on for incoming peers. 0 picks an ephemeral port.
    pub port: u16,

    // Maximum number of peer connections held at once.
    pub max_peers: usize,

    // Maximum concurrent inbound handshakes. Connections past this are dropped.
    pub max_accept: usize,

    // Unsnubbed metadata downloads running at once.
    pub parallel_metadata_downloads: usize,

    // Concurrent piece downloads across all peers.
    pub simultaneous_piece_downloads: usize,

    // Total bytes of in-flight piece buffers.
    pub ram_budget: usize,

    // Outstanding block requests pipelined per piece download.
    pub request_queue_len: usize,

    // A downloader that receives nothing for this long is snubbed.
    pub snub_timeout: Duration,

    // Peers idle longer than this are disconnected.
    pub peer_idle_timeout: Duration,

    // Lower bound on the announce interval, whatever the tracker says.
    pub tracker_min_announce_interval: Duration,

    // Ceiling for exponential backoff after tracker failures.
    pub tracker_backoff_max: Duration,

    // Deadline for each tracker in the detached stopped-event announce.
    pub tracker_stopped_timeout: Duration,

    // numwant sent with announces.
    pub tracker_num_want: usize,

    pub dht_announce_interval: Duration,

    pub dht_min_announce_interval: Duration,

    // Reading the response body of a webseed must progress within this.
    pub webseed_response_body_read_timeout: Duration,

    // A disabled webseed source is retried after this long.
    pub webseed_retry_interval: Duration,

    // Pieces kept in the read cache for serving requests.
    pub piece_read_cache_size: usize,

    pub client_id_prefix: [u8; 8],

}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 0,
            max_peers: 50,
            max_accept: 32,
            parallel_metadata_downloads: 2,
            simultaneous_piece_downloads: 8,
            ram_budget: 64 * 1024 * 1024,
            request_queue_len: 10,
            snub_timeout: Duration::from_secs(30),
            peer_idle_timeout: Duration::from_secs(120),
            tracker_min_announce_interval: Duration::from_secs(60),
            tracker_backoff_max: Duration::from_secs(30 * 60),
            tracker_stopped_timeout: Duration::from_secs(5),
            tracker_num_want: 50,
            dht_announce_interval: Duration::from_secs(30 * 60),
            dht_min_announce_interval: Duration::from_secs(60),
            webseed_response_body_read_timeout: Duration::from_secs(30),
            webseed_retry_interval: Duration::from_secs(60),
            piece_read_cache_size: 256,
            client_id_prefix: *CLIENT_ID_PREFIX,
        }
    }
}

impl Config {

    // Random client id with the configured prefix, generated once per torrent.
    pub fn generate_client_id(&self) -> crate::ID {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(&self.client_id_prefix);
        for b in id[8..].iter_mut() {
            *b = rand::Rng::gen_range(&mut rand::thread_rng(), b'0'..=b'9');
        }
        id
    }
}
