use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};
use bytes::Buf;
use serde::de;
use serde_derive::Deserialize;
use url::Url;
use super::{AnnounceParams, AnnounceResponse, Result, Tracker, TrackerError};

pub struct HttpTracker {

    client: reqwest::Client,

    url: Url,

    // Opaque id some trackers hand back, echoed on later announces.
    tracker_id: Option<String>,

}

impl HttpTracker {
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            tracker_id: None,
        }
    }
}

#[async_trait::async_trait]
impl Tracker for HttpTracker {

    async fn announce(&mut self, params: AnnounceParams) -> Result<AnnounceResponse> {

        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&numwant={}&compact=1",
            self.url.as_str(),
            urlencoding::encode_binary(&params.info_hash),
            urlencoding::encode_binary(&params.client_id),
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
            params.num_want,
        );
        if let Some(event) = params.event {
            url.push_str(&format!("&event={}", event));
        }
        if let Some(tracker_id) = &self.tracker_id {
            url.push_str(&format!("&trackerid={}", tracker_id));
        }
        tracing::debug!("announce url: {}", url);

        let raw = self.client
            .get(url)
            .send()
            .await?
            .bytes()
            .await?;

        let resp: HttpResponse = serde_bencode::from_bytes(&raw)?;
        tracing::debug!("announce response: {:?}", resp);

        if let Some(failure) = resp.failure_reason {
            return Err(TrackerError::Response(failure));
        }
        if let Some(warning) = resp.warning_message {
            tracing::warn!("tracker warning: {}", warning);
        }
        if let Some(tracker_id) = resp.tracker_id {
            self.tracker_id = Some(tracker_id);
        }

        Ok(AnnounceResponse {
            interval: resp.interval.map(Duration::from_secs),
            min_interval: resp.min_interval.map(Duration::from_secs),
            peers: resp.peers,
        })
    }

    fn url(&self) -> &Url {
        &self.url
    }
}

#[derive(Deserialize, Debug, Default)]
struct HttpResponse {

    // If present no other key matters.
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,

    #[serde(rename = "warning message")]
    warning_message: Option<String>,

    interval: Option<u64>,

    #[serde(rename = "min interval")]
    min_interval: Option<u64>,

    #[serde(rename = "tracker id")]
    tracker_id: Option<String>,

    complete: Option<u64>,

    incomplete: Option<u64>,

    #[serde(default)]
    #[serde(deserialize_with = "peer_deserialize")]
    peers: Vec<SocketAddr>,

}

// Trackers answer with either the compact 6-bytes-per-peer string or the
// dictionary model, regardless of what was asked for.
fn peer_deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeerVisitor;

    impl<'de> de::Visitor<'de> for PeerVisitor {

        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string of bytes or a list of dictionaries")
        }

        // Compact model: 4 bytes IPv4 then 2 bytes port, network order.
        fn visit_bytes<E>(self, mut v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                return Err(E::custom("peer string not a multiple of 6"));
            }

            let mut peers = Vec::with_capacity(v.len() / 6);
            while v.remaining() >= 6 {
                peers.push(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(v.get_u32())),
                    v.get_u16(),
                ));
            }
            Ok(peers)
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct PeerItem {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(peer) = seq.next_element::<PeerItem>()? {
                if let Ok(ip) = peer.ip.parse::<IpAddr>() {
                    peers.push(SocketAddr::new(ip, peer.port));
                }
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeerVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compact_response() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"d8:completei9e10:incompletei1e8:intervali1800e12:min intervali60e5:peers12:");
        raw.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0xe1, 192, 168, 1, 9, 0x00, 0x50]);
        raw.push(b'e');

        let resp: HttpResponse = serde_bencode::from_bytes(&raw).unwrap();
        assert_eq!(resp.interval, Some(1800));
        assert_eq!(resp.min_interval, Some(60));
        assert_eq!(resp.complete, Some(9));
        assert_eq!(resp.peers, vec![
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 6881),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9)), 80),
        ]);
    }

    #[test]
    fn test_parse_failure_response() {
        let raw = b"d14:failure reason15:unknown torrente";
        let resp: HttpResponse = serde_bencode::from_bytes(raw).unwrap();
        assert_eq!(resp.failure_reason.as_deref(), Some("unknown torrent"));
    }

    #[test]
    fn test_parse_dictionary_model() {
        let raw = b"d8:intervali900e5:peersld2:ip8:10.0.0.24:porti51413eeee";
        let resp: HttpResponse = serde_bencode::from_bytes(raw).unwrap();
        assert_eq!(resp.peers, vec![
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 51413),
        ]);
    }
}
