use std::time::Duration;
use tokio::{sync::mpsc, task::JoinHandle, time};
use crate::{
    block::{block_len, num_blocks, BlockInfo},
    p2p::{Message, PeerCommand, PeerTx},
    pool::SharedBufferPool,
    ID, BLOCK_SIZE,
};

pub type BlockTx = mpsc::UnboundedSender<BlockEvent>;
pub type BlockRx = mpsc::UnboundedReceiver<BlockEvent>;
pub type PieceDlTx = mpsc::UnboundedSender<PieceDlEvent>;
pub type PieceDlRx = mpsc::UnboundedReceiver<PieceDlEvent>;

// Routed into the downloader by the controller, which owns the peer map.
#[derive(Debug)]
pub enum BlockEvent {

    Block { offset: u32, data: Vec<u8> },

    // Fast extension: the peer refuses to serve this block.
    Rejected { offset: u32 },

    // Another endgame downloader already received this block; cancel the
    // outstanding request and stop asking for it.
    Ceded { offset: u32 },

    Choked,

}

#[derive(Debug)]
pub enum PieceDlEvent {

    // Nothing has arrived within the snub timeout. The download keeps
    // going; the controller may hand the piece to someone else too.
    Snubbed { peer: ID, piece: u32 },

    // All blocks received; the buffer still needs hash verification.
    Done { peer: ID, piece: u32, data: Vec<u8> },

    Failed { peer: ID, piece: u32, reason: FailReason },

}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {

    Choked,

    // Peer sent a block that doesn't match any request.
    BadBlock,

    Rejected,

    // Every remaining block was taken over by other endgame downloaders.
    Ceded,

}

// Controller-held handle. Dropping it closes the block channel, which ends
// the task.
pub struct PieceDownload {

    pub piece: u32,

    pub block_tx: BlockTx,

    pub handle: JoinHandle<()>,

}

impl PieceDownload {

    pub fn spawn(
        peer: ID,
        piece: u32,
        piece_len: usize,
        queue_len: usize,
        snub_timeout: Duration,
        pool: SharedBufferPool,
        peer_tx: PeerTx,
        result_tx: PieceDlTx,
    ) -> PieceDownload {

        let (block_tx, block_rx) = mpsc::unbounded_channel();
        let mut downloader = PieceDownloader {
            peer,
            piece,
            piece_len,
            queue_len,
            snub_timeout,
            pool,
            peer_tx,
            result_tx,
            block_rx,
            received: vec![false; num_blocks(piece_len)],
            ceded: vec![false; num_blocks(piece_len)],
            outstanding: Vec::new(),
            next_block: 0,
        };
        let handle = tokio::spawn(async move { downloader.run().await });

        PieceDownload { piece, block_tx, handle }
    }
}

struct PieceDownloader {

    peer: ID,

    piece: u32,

    piece_len: usize,

    queue_len: usize,

    snub_timeout: Duration,

    pool: SharedBufferPool,

    peer_tx: PeerTx,

    result_tx: PieceDlTx,

    block_rx: BlockRx,

    received: Vec<bool>,

    ceded: Vec<bool>,

    // Block indices with a request on the wire.
    outstanding: Vec<usize>,

    next_block: usize,

}

impl PieceDownloader {

    async fn run(&mut self) {

        let mut buf = self.pool.get(self.piece_len);
        if self.fill_pipeline().is_err() {
            self.pool.put(buf);
            return;
        }

        let mut deadline = time::Instant::now() + self.snub_timeout;
        let mut snub_sent = false;

        loop { tokio::select! {

            event = self.block_rx.recv() => {
                let event = match event {
                    Some(event) => event,
                    // Controller dropped the handle.
                    None => {
                        self.pool.put(buf);
                        return;
                    },
                };

                match event {

                    BlockEvent::Block { offset, data } => {
                        match self.accept_block(&mut buf, offset, data) {
                            Ok(true) => {
                                let data = std::mem::take(&mut buf);
                                let _ = self.result_tx.send(PieceDlEvent::Done {
                                    peer: self.peer,
                                    piece: self.piece,
                                    data,
                                });
                                return;
                            },
                            Ok(false) => {
                                deadline = time::Instant::now() + self.snub_timeout;
                                snub_sent = false;
                                if self.fill_pipeline().is_err() {
                                    self.pool.put(buf);
                                    return;
                                }
                            },
                            Err(reason) => {
                                self.fail(buf, reason);
                                return;
                            },
                        }
                    },

                    BlockEvent::Rejected { .. } => {
                        self.fail(buf, FailReason::Rejected);
                        return;
                    },

                    BlockEvent::Ceded { offset } => {
                        let idx = offset as usize / BLOCK_SIZE;
                        if idx < self.ceded.len() && !self.received[idx] && !self.ceded[idx] {
                            self.ceded[idx] = true;
                            if self.outstanding.iter().any(|&o| o == idx) {
                                self.outstanding.retain(|&o| o != idx);
                                let _ = self.peer_tx.send(PeerCommand::Send(Message::Cancel(
                                    self.block_info(idx),
                                )));
                            }
                        }
                        // If everything left was ceded away this download
                        // can never assemble a full piece.
                        if self.received.iter().zip(&self.ceded).all(|(r, c)| *r || *c) {
                            self.fail(buf, FailReason::Ceded);
                            return;
                        }
                        if self.fill_pipeline().is_err() {
                            self.pool.put(buf);
                            return;
                        }
                    },

                    BlockEvent::Choked => {
                        self.fail(buf, FailReason::Choked);
                        return;
                    },
                }
            }

            _ = time::sleep_until(deadline) => {
                if !snub_sent {
                    snub_sent = true;
                    let _ = self.result_tx.send(PieceDlEvent::Snubbed {
                        peer: self.peer,
                        piece: self.piece,
                    });
                }
                deadline = time::Instant::now() + self.snub_timeout;
            }

        }}
    }

    fn block_info(&self, idx: usize) -> BlockInfo {
        BlockInfo {
            piece_idx: self.piece,
            offset: (idx * BLOCK_SIZE) as u32,
            len: block_len(self.piece_len, idx) as u32,
        }
    }

    // Keeps up to queue_len requests on the wire.
    fn fill_pipeline(&mut self) -> Result<(), ()> {
        while self.outstanding.len() < self.queue_len && self.next_block < self.received.len() {
            let idx = self.next_block;
            self.next_block += 1;
            if self.received[idx] || self.ceded[idx] {
                continue;
            }
            self.outstanding.push(idx);
            self.peer_tx
                .send(PeerCommand::Send(Message::Request(self.block_info(idx))))
                .map_err(|_| ())?;
        }
        Ok(())
    }

    // Ok(true) once the piece is fully assembled.
    fn accept_block(&mut self, buf: &mut [u8], offset: u32, data: Vec<u8>) -> Result<bool, FailReason> {

        if offset as usize % BLOCK_SIZE != 0 {
            return Err(FailReason::BadBlock);
        }
        let idx = offset as usize / BLOCK_SIZE;
        if idx >= self.received.len() || data.len() != block_len(self.piece_len, idx) {
            return Err(FailReason::BadBlock);
        }
        self.outstanding.retain(|&o| o != idx);
        if self.received[idx] {
            // Duplicate, possible in endgame.
            return Ok(self.received.iter().all(|&r| r));
        }

        buf[offset as usize..offset as usize + data.len()].copy_from_slice(&data);
        self.received[idx] = true;
        Ok(self.received.iter().all(|&r| r))
    }

    fn fail(&mut self, buf: Vec<u8>, reason: FailReason) {
        self.pool.put(buf);
        // Give the peer a chance to stop sending what we no longer want.
        for &idx in &self.outstanding {
            let _ = self.peer_tx.send(PeerCommand::Send(Message::Cancel(self.block_info(idx))));
        }
        let _ = self.result_tx.send(PieceDlEvent::Failed {
            peer: self.peer,
            piece: self.piece,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use crate::pool::BufferPool;
    use super::*;

    const PIECE_LEN: usize = BLOCK_SIZE * 2 + 100;

    fn spawn_downloader() -> (PieceDownload, mpsc::UnboundedReceiver<PeerCommand>, PieceDlRx) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let dl = PieceDownload::spawn(
            [1; 20],
            0,
            PIECE_LEN,
            2,
            Duration::from_secs(30),
            BufferPool::new(4),
            peer_tx,
            result_tx,
        );
        (dl, peer_rx, result_rx)
    }

    async fn expect_request(peer_rx: &mut mpsc::UnboundedReceiver<PeerCommand>) -> BlockInfo {
        let cmd = tokio::time::timeout(Duration::from_secs(5), peer_rx.recv())
            .await
            .expect("timed out waiting for request");
        match cmd {
            Some(PeerCommand::Send(Message::Request(info))) => info,
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pipelines_and_assembles() {
        let (dl, mut peer_rx, mut result_rx) = spawn_downloader();

        // Queue length 2: exactly two requests in flight.
        let first = expect_request(&mut peer_rx).await;
        let second = expect_request(&mut peer_rx).await;
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, BLOCK_SIZE as u32);
        assert!(peer_rx.try_recv().is_err());

        dl.block_tx.send(BlockEvent::Block { offset: 0, data: vec![1; BLOCK_SIZE] }).unwrap();
        // Third (short, final) block requested once a slot frees up.
        let third = expect_request(&mut peer_rx).await;
        assert_eq!(third.offset, 2 * BLOCK_SIZE as u32);
        assert_eq!(third.len, 100);

        dl.block_tx.send(BlockEvent::Block { offset: BLOCK_SIZE as u32, data: vec![2; BLOCK_SIZE] }).unwrap();
        dl.block_tx.send(BlockEvent::Block { offset: 2 * BLOCK_SIZE as u32, data: vec![3; 100] }).unwrap();

        match result_rx.recv().await.unwrap() {
            PieceDlEvent::Done { piece, data, .. } => {
                assert_eq!(piece, 0);
                assert_eq!(data.len(), PIECE_LEN);
                assert_eq!(data[0], 1);
                assert_eq!(data[BLOCK_SIZE], 2);
                assert_eq!(data[2 * BLOCK_SIZE], 3);
            },
            other => panic!("expected done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_choke_fails_download() {
        let (dl, _peer_rx, mut result_rx) = spawn_downloader();
        dl.block_tx.send(BlockEvent::Choked).unwrap();
        match result_rx.recv().await.unwrap() {
            PieceDlEvent::Failed { reason, .. } => assert_eq!(reason, FailReason::Choked),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_block_fails_download() {
        let (dl, _peer_rx, mut result_rx) = spawn_downloader();
        dl.block_tx.send(BlockEvent::Block { offset: 12, data: vec![0; 5] }).unwrap();
        match result_rx.recv().await.unwrap() {
            PieceDlEvent::Failed { reason, .. } => assert_eq!(reason, FailReason::BadBlock),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ceded_blocks_cancel_and_fail() {
        let (dl, mut peer_rx, mut result_rx) = spawn_downloader();
        expect_request(&mut peer_rx).await;
        expect_request(&mut peer_rx).await;

        for idx in 0..3u32 {
            dl.block_tx.send(BlockEvent::Ceded { offset: idx * BLOCK_SIZE as u32 }).unwrap();
        }
        match result_rx.recv().await.unwrap() {
            PieceDlEvent::Failed { reason, .. } => assert_eq!(reason, FailReason::Ceded),
            other => panic!("expected failure, got {:?}", other),
        }
        // Outstanding requests were cancelled on the wire.
        let cancels = std::iter::from_fn(|| peer_rx.try_recv().ok())
            .filter(|cmd| matches!(cmd, PeerCommand::Send(Message::Cancel(_))))
            .count();
        assert_eq!(cancels, 2);
    }

    #[tokio::test]
    async fn test_snub_notification() {
        let (peer_tx, _peer_rx) = mpsc::unbounded_channel();
        let (result_tx, mut result_rx) = mpsc::unbounded_channel();
        let _dl = PieceDownload::spawn(
            [1; 20],
            3,
            PIECE_LEN,
            2,
            Duration::from_millis(20),
            BufferPool::new(4),
            peer_tx,
            result_tx,
        );
        match result_rx.recv().await.unwrap() {
            PieceDlEvent::Snubbed { piece, .. } => assert_eq!(piece, 3),
            other => panic!("expected snub, got {:?}", other),
        }
    }
}
