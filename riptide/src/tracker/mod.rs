use std::{net::SocketAddr, time::Duration};
use url::Url;
use crate::ID;

mod http;
mod udp;
pub use http::HttpTracker;
pub use udp::UdpTracker;

pub type Result<T> = std::result::Result<T, TrackerError>;

// Fallback when the tracker response carries no interval.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("error deserializing response: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("timeout")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("invalid url")]
    InvalidUrl,

    #[error("unsupported tracker scheme: {0}")]
    UnsupportedScheme(String),

    #[error("response error: {0}")]
    Response(String),

}

#[derive(Debug, Copy, Clone)]
pub struct AnnounceParams {

    pub info_hash: ID,

    pub client_id: ID,

    pub port: u16,

    pub uploaded: u64,

    pub downloaded: u64,

    // Bytes still needed for a complete download.
    pub left: u64,

    pub event: Option<Event>,

    pub num_want: usize,

}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {

    Started,

    Completed,

    Stopped,

}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Started => write!(f, "started"),
            Event::Completed => write!(f, "completed"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Default)]
pub struct AnnounceResponse {

    pub interval: Option<Duration>,

    pub min_interval: Option<Duration>,

    pub peers: Vec<SocketAddr>,

}

#[async_trait::async_trait]
pub trait Tracker: Send {

    async fn announce(&mut self, params: AnnounceParams) -> Result<AnnounceResponse>;

    fn url(&self) -> &Url;

}

// HTTP or UDP tracker, by scheme.
pub async fn create(url: &Url) -> Result<Box<dyn Tracker>> {
    match url.scheme() {
        "http" | "https" => Ok(Box::new(HttpTracker::new(url.clone()))),
        "udp" => Ok(Box::new(UdpTracker::new(url.clone()).await?)),
        scheme => Err(TrackerError::UnsupportedScheme(scheme.to_string())),
    }
}
