use std::sync::Arc;
use tokio::{sync::mpsc, task};
use super::{Storage, StorageError};

pub type AllocatorTx = mpsc::UnboundedSender<AllocatorEvent>;
pub type AllocatorRx = mpsc::UnboundedReceiver<AllocatorEvent>;

#[derive(Debug)]
pub enum AllocatorEvent {

    // Running total of bytes allocated so far.
    Progress { bytes: u64 },

    Done(Result<(), StorageError>),

}

// Creates or extends the torrent's backing files to the exact lengths the
// info declares. Runs on the blocking pool; the controller hears back on the
// event channel. Idempotent across restarts.
pub fn spawn(storage: Arc<Storage>, event_tx: AllocatorTx) -> task::JoinHandle<()> {
    tracing::debug!("starting allocator");
    task::spawn_blocking(move || {
        let result = storage.allocate(|bytes| {
            let _ = event_tx.send(AllocatorEvent::Progress { bytes });
        });
        if let Err(e) = &result {
            tracing::error!("allocation failed: {}", e);
        }
        let _ = event_tx.send(AllocatorEvent::Done(result));
    })
}

#[cfg(test)]
mod tests {
    use crate::storage::tests::multi_file_info;
    use super::*;

    async fn run_allocator(storage: Arc<Storage>) -> (u64, Result<(), StorageError>) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        spawn(storage, event_tx);
        let mut last_progress = 0;
        loop {
            match event_rx.recv().await.unwrap() {
                AllocatorEvent::Progress { bytes } => last_progress = bytes,
                AllocatorEvent::Done(result) => return (last_progress, result),
            }
        }
    }

    #[tokio::test]
    async fn test_allocates_exact_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let info = multi_file_info();
        let storage = Arc::new(Storage::new(&info, dir.path(), 8).unwrap());

        let (progress, result) = run_allocator(storage).await;
        result.unwrap();

        assert_eq!(std::fs::metadata(dir.path().join("a.bin")).unwrap().len(), 10_000);
        assert_eq!(std::fs::metadata(dir.path().join("b.bin")).unwrap().len(), 50_000);
        assert_eq!(std::fs::metadata(dir.path().join("c.bin")).unwrap().len(), 5_536);
        assert_eq!(progress, 65_536);
    }

    #[tokio::test]
    async fn test_allocation_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let info = multi_file_info();
        let storage = Arc::new(Storage::new(&info, dir.path(), 8).unwrap());

        for _ in 0..2 {
            let (_, result) = run_allocator(Arc::clone(&storage)).await;
            result.unwrap();
        }
        assert_eq!(std::fs::metadata(dir.path().join("b.bin")).unwrap().len(), 50_000);
    }
}
