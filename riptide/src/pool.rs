use std::sync::{Arc, Mutex};

pub type SharedBufferPool = Arc<BufferPool>;

// Recycles piece buffers between downloaders and the write path, so a busy
// torrent is not allocating piece-sized vectors on every completion. The
// pool is injected by whoever owns the process, not a global.
#[derive(Debug)]
pub struct BufferPool {

    max_pooled: usize,

    bufs: Mutex<Vec<Vec<u8>>>,

}

impl BufferPool {

    pub fn new(max_pooled: usize) -> SharedBufferPool {
        Arc::new(BufferPool {
            max_pooled,
            bufs: Mutex::new(Vec::new()),
        })
    }

    // A zeroed buffer of the requested length, reusing a retired one when
    // possible.
    pub fn get(&self, len: usize) -> Vec<u8> {
        let recycled = self.bufs.lock().expect("buffer pool lock poisoned").pop();
        match recycled {
            Some(mut buf) => {
                buf.clear();
                buf.resize(len, 0);
                buf
            },
            None => vec![0; len],
        }
    }

    pub fn put(&self, buf: Vec<u8>) {
        let mut bufs = self.bufs.lock().expect("buffer pool lock poisoned");
        if bufs.len() < self.max_pooled {
            bufs.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse() {
        let pool = BufferPool::new(4);
        let buf = pool.get(100);
        let ptr = buf.as_ptr();
        pool.put(buf);
        // Shrinking reuses the allocation; contents come back zeroed.
        let buf = pool.get(50);
        assert_eq!(buf.as_ptr(), ptr);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_bounded() {
        let pool = BufferPool::new(1);
        pool.put(vec![0; 10]);
        pool.put(vec![0; 10]);
        assert_eq!(pool.bufs.lock().unwrap().len(), 1);
    }
}
