use std::{
    io::{Read, Seek, SeekFrom, Write},
    num::NonZeroUsize,
    ops::Range,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};
use crate::{block::BlockInfo, metainfo::Info};

pub mod allocator;
pub mod verifier;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("io error: expected {expected} bytes, got {actual}")]
    Size {
        expected: usize,
        actual: usize,
    },

    // Usually a poisoned file lock.
    #[error("sync error: {0}")]
    Sync(String),

}

impl<T> From<std::sync::PoisonError<T>> for StorageError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        StorageError::Sync(e.to_string())
    }
}

#[derive(Debug)]
struct StorageFile {

    path: PathBuf,

    len: u64,

    // Offset in bytes from the start of the torrent.
    offset: u64,

    handle: RwLock<std::fs::File>,

}

impl StorageFile {
    fn byte_range(&self) -> Range<u64> {
        self.offset..(self.offset + self.len)
    }
}

// Backing files of a torrent, addressed by piece. Reads and writes are
// serialized per file by the per-file lock; the struct itself is shared
// between the controller's blocking writers, the verifier and the allocator.
#[derive(Debug)]
pub struct Storage {

    piece_len: usize,

    last_piece_len: usize,

    num_pieces: u32,

    total_len: u64,

    files: Vec<StorageFile>,

    // Peers tend to read several blocks of the same piece back to back, so
    // whole pieces are cached on read.
    read_cache: Mutex<lru::LruCache<u32, Arc<Vec<u8>>>>,

}

impl Storage {

    // Opens (creating if missing) every file of the torrent under dir.
    // Lengths are not adjusted here; that is the allocator's job.
    pub fn new(info: &Info, dir: &Path, cache_size: usize) -> Result<Storage> {

        let mut files = Vec::new();
        for span in info.file_spans() {
            let path = dir.join(&span.path);
            if let Some(parent) = path.parent() {
                if !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let handle = std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)?;
            files.push(StorageFile {
                path,
                len: span.length,
                offset: span.offset,
                handle: RwLock::new(handle),
            });
        }

        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap();
        Ok(Storage {
            piece_len: info.piece_length as usize,
            last_piece_len: info.last_piece_len(),
            num_pieces: info.num_pieces(),
            total_len: info.total_len(),
            files,
            read_cache: Mutex::new(lru::LruCache::new(cache_size)),
        })
    }

    pub fn num_pieces(&self) -> u32 { self.num_pieces }

    pub fn total_len(&self) -> u64 { self.total_len }

    pub fn piece_len(&self, idx: u32) -> usize {
        debug_assert!(idx < self.num_pieces);
        if idx == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub fn piece_offset(&self, idx: u32) -> u64 {
        idx as u64 * self.piece_len as u64
    }

    // Creates or resizes every backing file to its exact declared length.
    // Returns the running total through the callback so callers can report
    // progress. Safe to run repeatedly.
    pub fn allocate(&self, mut progress: impl FnMut(u64)) -> Result<()> {
        let mut allocated = 0;
        for file in &self.files {
            let handle = file.handle.write()?;
            if handle.metadata()?.len() != file.len {
                handle.set_len(file.len)?;
            }
            allocated += file.len;
            progress(allocated);
        }
        Ok(())
    }

    pub fn write_piece(&self, idx: u32, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), self.piece_len(idx));

        let offset = self.piece_offset(idx);
        for file_idx in self.file_intersections(idx) {
            let file = &self.files[file_idx];
            // Intersection of the piece's span with this file's span.
            let start = offset.max(file.offset);
            let end = (offset + data.len() as u64).min(file.offset + file.len);
            let chunk = &data[(start - offset) as usize..(end - offset) as usize];

            let mut handle = file.handle.write()?;
            handle.seek(SeekFrom::Start(start - file.offset))?;
            handle.write_all(chunk)?;
        }

        self.read_cache.lock()?.pop(&idx);
        Ok(())
    }

    // Reads a whole piece, bypassing the cache. Used by the verifier's
    // sequential scan, which would otherwise evict everything.
    pub fn read_piece_uncached(&self, idx: u32) -> Result<Vec<u8>> {

        let len = self.piece_len(idx);
        let offset = self.piece_offset(idx);
        let mut buf = vec![0; len];

        for file_idx in self.file_intersections(idx) {
            let file = &self.files[file_idx];
            let start = offset.max(file.offset);
            let end = (offset + len as u64).min(file.offset + file.len);
            let chunk = &mut buf[(start - offset) as usize..(end - offset) as usize];

            let mut handle = file.handle.write()?;
            handle.seek(SeekFrom::Start(start - file.offset))?;
            handle.read_exact(chunk)?;
        }

        Ok(buf)
    }

    pub fn read_piece(&self, idx: u32) -> Result<Arc<Vec<u8>>> {
        if let Some(piece) = self.read_cache.lock()?.get(&idx) {
            return Ok(Arc::clone(piece));
        }
        let piece = Arc::new(self.read_piece_uncached(idx)?);
        self.read_cache.lock()?.put(idx, Arc::clone(&piece));
        Ok(piece)
    }

    pub fn read_block(&self, block: &BlockInfo) -> Result<Vec<u8>> {
        let piece = self.read_piece(block.piece_idx)?;
        let start = block.offset as usize;
        let end = start + block.len as usize;
        if end > piece.len() {
            return Err(StorageError::Size { expected: end, actual: piece.len() });
        }
        Ok(piece[start..end].to_vec())
    }

    // Indices of the files a piece's byte span touches.
    fn file_intersections(&self, idx: u32) -> Range<usize> {
        if self.files.len() == 1 {
            return 0..1;
        }

        let offset = self.piece_offset(idx);
        let end = offset + self.piece_len(idx) as u64 - 1;

        let start_file = self.files
            .iter()
            .position(|f| f.byte_range().contains(&offset))
            .expect("piece byte offset exceeds file length");

        let end_file = self.files[start_file..]
            .iter()
            .position(|f| f.byte_range().contains(&end))
            .map(|i| start_file + i)
            .expect("piece last byte exceeds torrent length");

        start_file..(end_file + 1)
    }
}

#[cfg(test)]
mod tests {
    use sha1::Digest;
    use crate::metainfo::Info;
    use super::*;

    // Multi-file info: files of 10000, 50000 and 5536 bytes in 32 KiB
    // pieces, so both pieces straddle a file boundary.
    pub(super) fn multi_file_info() -> Info {
        let mut pieces = Vec::new();
        pieces.extend_from_slice(&[0xaa; 20]);
        pieces.extend_from_slice(&[0xbb; 20]);
        let mut raw = Vec::new();
        raw.extend_from_slice(b"d5:filesl");
        raw.extend_from_slice(b"d6:lengthi10000e4:pathl5:a.bineed");
        raw.extend_from_slice(b"6:lengthi50000e4:pathl5:b.bineed");
        raw.extend_from_slice(b"6:lengthi5536e4:pathl5:c.binee");
        raw.extend_from_slice(b"e4:name4:test12:piece lengthi32768e6:pieces40:");
        raw.extend_from_slice(&pieces);
        raw.push(b'e');
        Info::from_bytes(&raw).unwrap()
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let info = multi_file_info();
        let storage = Storage::new(&info, dir.path(), 8).unwrap();
        storage.allocate(|_| {}).unwrap();

        let piece: Vec<u8> = (0..storage.piece_len(1)).map(|i| (i % 251) as u8).collect();
        let mut hasher = sha1::Sha1::new();
        hasher.update(&piece);
        let expected: [u8; 20] = hasher.finalize().into();

        storage.write_piece(1, &piece).unwrap();

        // Re-reading and re-hashing yields the same digest.
        let read = storage.read_piece_uncached(1).unwrap();
        let mut hasher = sha1::Sha1::new();
        hasher.update(&read);
        let actual: [u8; 20] = hasher.finalize().into();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_write_spans_files() {
        let dir = tempfile::tempdir().unwrap();
        let info = multi_file_info();
        let storage = Storage::new(&info, dir.path(), 8).unwrap();
        storage.allocate(|_| {}).unwrap();

        // Piece 0 covers all of a.bin and the head of b.bin.
        storage.write_piece(0, &vec![7u8; storage.piece_len(0)]).unwrap();
        let a = std::fs::read(dir.path().join("a.bin")).unwrap();
        assert_eq!(a.len(), 10_000);
        assert!(a.iter().all(|&b| b == 7));
        let b = std::fs::read(dir.path().join("b.bin")).unwrap();
        assert_eq!(b.len(), 50_000);
        assert!(b[..32_768 - 10_000].iter().all(|&v| v == 7));
        assert!(b[32_768 - 10_000..].iter().all(|&v| v == 0));
    }

    #[test]
    fn test_read_block() {
        let dir = tempfile::tempdir().unwrap();
        let info = multi_file_info();
        let storage = Storage::new(&info, dir.path(), 8).unwrap();
        storage.allocate(|_| {}).unwrap();

        let piece: Vec<u8> = (0..storage.piece_len(0)).map(|i| (i / 100) as u8).collect();
        storage.write_piece(0, &piece).unwrap();

        let block = storage.read_block(&crate::block::BlockInfo {
            piece_idx: 0,
            offset: 0x4000,
            len: 0x4000,
        }).unwrap();
        assert_eq!(&block[..], &piece[0x4000..0x8000]);
    }
}
