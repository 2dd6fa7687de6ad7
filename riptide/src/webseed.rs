use std::{ops::Range, sync::Arc, time::Duration};
use sha1::Digest;
use tokio::{sync::mpsc, task::JoinHandle, time};
use tracing::Instrument;
use url::Url;
use crate::{picker::SharedWebseedRanges, pool::SharedBufferPool, ID};

pub type WebseedTx = mpsc::UnboundedSender<WebseedEvent>;
pub type WebseedRx = mpsc::UnboundedReceiver<WebseedEvent>;

#[derive(Debug)]
pub enum WebseedEvent {

    // A hash-checked piece cut out of the response body.
    Piece { source: usize, piece: u32, data: Vec<u8> },

    // The assigned range (possibly shrunk by a steal) is finished.
    RangeDone { source: usize },

    // The source misbehaved; the controller disables it for a while.
    Failed { source: usize, error: WebseedError },

}

#[derive(Debug, thiserror::Error)]
pub enum WebseedError {

    #[error("request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status: {0}")]
    Status(u16),

    #[error("response body read timed out")]
    BodyTimeout,

    #[error("response body ended short of the requested range")]
    ShortBody,

    #[error("piece {0} failed hash verification")]
    HashMismatch(u32),

}

// BEP 19 range download over a run of pieces. The downloader owns the HTTP
// stream and cuts pieces at piece boundaries, verifying each against its
// hash before handing it to the controller. The shared range cursor is
// advanced under its lock because this happens outside the controller loop.
pub struct WebseedDownload {

    pub handle: JoinHandle<()>,

}

impl WebseedDownload {

    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        source: usize,
        url: Url,
        range: Range<u32>,
        ranges: SharedWebseedRanges,
        hashes: Arc<Vec<ID>>,
        piece_len: usize,
        total_len: u64,
        body_timeout: Duration,
        pool: SharedBufferPool,
        event_tx: WebseedTx,
    ) -> WebseedDownload {

        let span = tracing::info_span!("webseed", url = %url);
        let handle = tokio::spawn(async move {
            let downloader = WebseedDownloader {
                source,
                url,
                range,
                ranges,
                hashes,
                piece_len,
                total_len,
                body_timeout,
                pool,
                event_tx: event_tx.clone(),
            };
            if let Err(error) = downloader.run().await {
                let _ = event_tx.send(WebseedEvent::Failed { source, error });
            }
        }.instrument(span));

        WebseedDownload { handle }
    }
}

struct WebseedDownloader {

    source: usize,

    url: Url,

    range: Range<u32>,

    ranges: SharedWebseedRanges,

    hashes: Arc<Vec<ID>>,

    piece_len: usize,

    total_len: u64,

    body_timeout: Duration,

    pool: SharedBufferPool,

    event_tx: WebseedTx,

}

impl WebseedDownloader {

    fn piece_len(&self, idx: u32) -> usize {
        (self.total_len - idx as u64 * self.piece_len as u64).min(self.piece_len as u64) as usize
    }

    async fn run(&self) -> Result<(), WebseedError> {

        // Byte span of the piece run across the (flattened) file layout.
        let begin = self.range.start as u64 * self.piece_len as u64;
        let end = (self.range.end as u64 * self.piece_len as u64).min(self.total_len);

        let client = reqwest::Client::new();
        let mut resp = client
            .get(self.url.clone())
            .header(reqwest::header::RANGE, format!("bytes={}-{}", begin, end - 1))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(WebseedError::Status(status.as_u16()));
        }
        tracing::debug!("streaming pieces {}..{}", self.range.start, self.range.end);

        let mut piece = self.range.start;
        let mut buf = self.pool.get(self.piece_len(piece));
        let mut filled = 0;

        loop {
            let chunk = time::timeout(self.body_timeout, resp.chunk())
                .await
                .map_err(|_| WebseedError::BodyTimeout)??;
            let mut chunk = match chunk {
                Some(chunk) => chunk,
                // Body ended mid-piece.
                None => return Err(WebseedError::ShortBody),
            };

            while !chunk.is_empty() {
                let want = buf.len() - filled;
                let take = want.min(chunk.len());
                buf[filled..filled + take].copy_from_slice(&chunk[..take]);
                filled += take;
                chunk = chunk.slice(take..);

                if filled < buf.len() {
                    continue;
                }

                // Piece boundary: verify and hand off.
                let mut hasher = sha1::Sha1::new();
                hasher.update(&buf);
                let hash: ID = hasher.finalize().into();
                if hash != self.hashes[piece as usize] {
                    return Err(WebseedError::HashMismatch(piece));
                }
                let data = std::mem::replace(&mut buf, Vec::new());
                if self.event_tx.send(WebseedEvent::Piece {
                    source: self.source,
                    piece,
                    data,
                }).is_err() {
                    return Ok(());
                }

                // The range may have been shortened by another source
                // stealing the tail.
                let next = self.ranges
                    .lock()
                    .expect("webseed range lock poisoned")
                    .advance(self.source);
                match next {
                    Some(next) => {
                        piece = next;
                        buf = self.pool.get(self.piece_len(piece));
                        filled = 0;
                    },
                    None => {
                        let _ = self.event_tx.send(WebseedEvent::RangeDone { source: self.source });
                        return Ok(());
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use crate::{picker::PiecePicker, pool::BufferPool, Bitfield};
    use super::*;

    const PIECE: usize = 0x4000;

    // Minimal one-shot HTTP server handing back the requested body.
    async fn serve_once(body: Vec<u8>, status: &'static str) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut req = vec![0u8; 4096];
            let _ = stream.read(&mut req).await.unwrap();
            let header = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                body.len(),
            );
            stream.write_all(header.as_bytes()).await.unwrap();
            stream.write_all(&body).await.unwrap();
        });
        Url::parse(&format!("http://127.0.0.1:{}/data.bin", port)).unwrap()
    }

    fn hashes_for(body: &[u8]) -> Arc<Vec<ID>> {
        Arc::new(body.chunks(PIECE).map(|c| {
            let mut hasher = sha1::Sha1::new();
            hasher.update(c);
            hasher.finalize().into()
        }).collect())
    }

    #[tokio::test]
    async fn test_streams_verified_pieces() {
        // Two full pieces and a short last one.
        let body: Vec<u8> = (0..PIECE * 2 + 600).map(|i| (i % 249) as u8).collect();
        let total_len = body.len() as u64;
        let hashes = hashes_for(&body);
        let url = serve_once(body, "206 Partial Content").await;

        let mut picker = PiecePicker::new(
            Bitfield::repeat(false, 3),
            rand::rngs::StdRng::seed_from_u64(0),
        );
        let range = picker.pick_webseed(0).unwrap();
        assert_eq!(range, 0..3);

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        WebseedDownload::spawn(
            0, url, range, picker.webseed_ranges(), hashes,
            PIECE, total_len, Duration::from_secs(5), BufferPool::new(4), event_tx,
        );

        for expected in 0..3u32 {
            match event_rx.recv().await.unwrap() {
                WebseedEvent::Piece { piece, data, .. } => {
                    assert_eq!(piece, expected);
                    let want = if expected == 2 { 600 } else { PIECE };
                    assert_eq!(data.len(), want);
                },
                other => panic!("expected piece, got {:?}", other),
            }
        }
        assert!(matches!(event_rx.recv().await.unwrap(), WebseedEvent::RangeDone { .. }));
    }

    #[tokio::test]
    async fn test_http_error_disables_source() {
        let url = serve_once(b"not found".to_vec(), "404 Not Found").await;

        let mut picker = PiecePicker::new(
            Bitfield::repeat(false, 2),
            rand::rngs::StdRng::seed_from_u64(0),
        );
        let range = picker.pick_webseed(0).unwrap();

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        WebseedDownload::spawn(
            0, url, range, picker.webseed_ranges(), Arc::new(vec![[0; 20]; 2]),
            PIECE, PIECE as u64 * 2, Duration::from_secs(5), BufferPool::new(4), event_tx,
        );

        match event_rx.recv().await.unwrap() {
            WebseedEvent::Failed { error, .. } => {
                assert!(matches!(error, WebseedError::Status(404)));
            },
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
