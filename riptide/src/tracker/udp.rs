use std::{
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs},
    time::Duration,
};
use bytes::{Buf, BufMut, BytesMut};
use tokio::{net::UdpSocket, time};
use url::Url;
use super::{AnnounceParams, AnnounceResponse, Event, Result, Tracker, TrackerError};

// BEP 15.

const PROTOCOL_ID: i64 = 0x41727101980;
const ACTION_CONNECT: i32 = 0;
const ACTION_ANNOUNCE: i32 = 1;
const ACTION_ERROR: i32 = 3;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct UdpTracker {

    socket: UdpSocket,

    url: Url,

    conn_id: Option<i64>,

    conn_id_expiry: Option<time::Instant>,

}

impl UdpTracker {

    pub async fn new(url: Url) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self {
            socket,
            url,
            conn_id: None,
            conn_id_expiry: None,
        })
    }

    async fn connect(&mut self) -> Result<i64> {

        // Connection ids stay valid for a minute.
        if let (Some(id), Some(expiry)) = (self.conn_id, self.conn_id_expiry) {
            if time::Instant::now() < expiry {
                return Ok(id);
            }
        }

        let host = self.url.host_str().ok_or(TrackerError::InvalidUrl)?;
        let port = self.url.port().ok_or(TrackerError::InvalidUrl)?;
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or(TrackerError::InvalidUrl)?;
        self.socket.connect(addr).await?;

        let trans_id: i32 = rand::random();
        let mut buf = BytesMut::with_capacity(16);
        buf.put_i64(PROTOCOL_ID);
        buf.put_i32(ACTION_CONNECT);
        buf.put_i32(trans_id);
        self.socket.send(&buf).await?;

        let mut resp_buf = [0u8; 16];
        let n = time::timeout(REQUEST_TIMEOUT, self.socket.recv(&mut resp_buf)).await??;
        if n < 16 {
            return Err(TrackerError::Response("short connect response".to_string()));
        }
        let mut resp = &resp_buf[..];
        if resp.get_i32() != ACTION_CONNECT {
            return Err(TrackerError::Response("expected connect action".to_string()));
        }
        if resp.get_i32() != trans_id {
            return Err(TrackerError::Response("invalid transaction id".to_string()));
        }

        let conn_id = resp.get_i64();
        self.conn_id = Some(conn_id);
        self.conn_id_expiry = Some(time::Instant::now() + Duration::from_secs(60));
        tracing::trace!("connected to tracker");
        Ok(conn_id)
    }
}

#[async_trait::async_trait]
impl Tracker for UdpTracker {

    async fn announce(&mut self, params: AnnounceParams) -> Result<AnnounceResponse> {

        let conn_id = self.connect().await?;
        let trans_id: i32 = rand::random();

        let mut buf = BytesMut::with_capacity(98);
        buf.put_i64(conn_id);
        buf.put_i32(ACTION_ANNOUNCE);
        buf.put_i32(trans_id);
        buf.put(&params.info_hash[..]);
        buf.put(&params.client_id[..]);
        buf.put_u64(params.downloaded);
        buf.put_u64(params.left);
        buf.put_u64(params.uploaded);
        buf.put_i32(match params.event {
            Some(Event::Completed) => 1,
            Some(Event::Started) => 2,
            Some(Event::Stopped) => 3,
            None => 0,
        });
        buf.put_i32(0); // IP address, default.
        buf.put_i32(rand::random()); // Key.
        buf.put_i32(params.num_want as i32);
        buf.put_u16(params.port);

        self.socket.send(&buf).await?;

        let mut resp_buf = [0u8; 1500];
        let n = time::timeout(REQUEST_TIMEOUT, self.socket.recv(&mut resp_buf)).await??;
        if n < 8 {
            return Err(TrackerError::Response("short announce response".to_string()));
        }
        let mut resp = &resp_buf[..n];
        let action = resp.get_i32();
        if resp.get_i32() != trans_id {
            return Err(TrackerError::Response("invalid transaction id".to_string()));
        }
        if action == ACTION_ERROR {
            let msg = String::from_utf8_lossy(resp).to_string();
            return Err(TrackerError::Response(msg));
        }
        if action != ACTION_ANNOUNCE || n < 20 {
            return Err(TrackerError::Response("expected announce action".to_string()));
        }

        let interval = resp.get_i32();
        let _leechers = resp.get_i32();
        let _seeders = resp.get_i32();

        let mut peers = Vec::with_capacity((n - 20) / 6);
        while resp.remaining() >= 6 {
            let ip = resp.get_u32();
            let port = resp.get_u16();
            peers.push(SocketAddr::new(Ipv4Addr::from(ip).into(), port));
        }

        tracing::debug!("tracker provided {} peers", peers.len());
        Ok(AnnounceResponse {
            interval: Some(Duration::from_secs(interval.max(0) as u64)),
            min_interval: None,
            peers,
        })
    }

    fn url(&self) -> &Url {
        &self.url
    }
}
