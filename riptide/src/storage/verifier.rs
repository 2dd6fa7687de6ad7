use std::sync::Arc;
use sha1::Digest;
use tokio::{sync::mpsc, task};
use crate::{Bitfield, ID};
use super::{Storage, StorageError};

pub type VerifierTx = mpsc::UnboundedSender<VerifierEvent>;
pub type VerifierRx = mpsc::UnboundedReceiver<VerifierEvent>;

#[derive(Debug)]
pub enum VerifierEvent {

    Progress { checked: u32 },

    Done(Result<Bitfield, StorageError>),

}

// Hashes every piece already on disk and reports which ones are good. A
// mismatch just leaves the bit unset; an I/O fault ends the scan with an
// error, which the controller treats as fatal.
pub fn spawn(
    storage: Arc<Storage>,
    hashes: Arc<Vec<ID>>,
    event_tx: VerifierTx,
) -> task::JoinHandle<()> {
    tracing::debug!("starting verifier");
    task::spawn_blocking(move || {
        let result = run(&storage, &hashes, &event_tx);
        if let Err(e) = &result {
            tracing::error!("verification failed: {}", e);
        }
        let _ = event_tx.send(VerifierEvent::Done(result));
    })
}

fn run(
    storage: &Storage,
    hashes: &[ID],
    event_tx: &VerifierTx,
) -> Result<Bitfield, StorageError> {

    let num_pieces = storage.num_pieces();
    debug_assert_eq!(hashes.len(), num_pieces as usize);
    let mut bitfield = Bitfield::repeat(false, num_pieces as usize);

    for idx in 0..num_pieces {
        let piece = storage.read_piece_uncached(idx)?;
        let mut hasher = sha1::Sha1::new();
        hasher.update(&piece);
        let hash: ID = hasher.finalize().into();
        if hash == hashes[idx as usize] {
            bitfield.set(idx as usize, true);
        }
        let _ = event_tx.send(VerifierEvent::Progress { checked: idx + 1 });
    }

    tracing::info!("verified {}/{} pieces present", bitfield.count_ones(), num_pieces);
    Ok(bitfield)
}

#[cfg(test)]
mod tests {
    use crate::storage::tests::multi_file_info;
    use super::*;

    #[tokio::test]
    async fn test_verify_detects_written_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let info = multi_file_info();
        let storage = Arc::new(Storage::new(&info, dir.path(), 8).unwrap());
        storage.allocate(|_| {}).unwrap();

        // Write piece 1 and fix up its hash so it verifies.
        let piece: Vec<u8> = (0..storage.piece_len(1)).map(|i| (i % 13) as u8).collect();
        storage.write_piece(1, &piece).unwrap();
        let mut hasher = sha1::Sha1::new();
        hasher.update(&piece);
        let good: ID = hasher.finalize().into();
        let hashes = Arc::new(vec![[0u8; 20], good]);

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        spawn(storage, hashes, event_tx);

        let mut last_progress = 0;
        let bitfield = loop {
            match event_rx.recv().await.unwrap() {
                VerifierEvent::Progress { checked } => last_progress = checked,
                VerifierEvent::Done(result) => break result.unwrap(),
            }
        };
        assert!(!bitfield[0]);
        assert!(bitfield[1]);
        assert_eq!(last_progress, 2);
    }
}
