//! Reusable byte buffers for per-message I/O

use std::sync::Mutex;

/// Smallest buffer the pool will hand out.
pub const MIN_BUFFER_SIZE: usize = 8 * 1024;

/// Buffers kept around after release; extra releases just drop the buffer.
const MAX_POOLED: usize = 32;

/// Thread-safe pool of fixed-size byte buffers.
///
/// A buffer is exclusively owned between [`acquire`](BufferPool::acquire) and
/// [`release`](BufferPool::release) and must not be retained after the owning
/// request completes. Released buffers come back with undefined contents.
pub struct BufferPool {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Create a pool of buffers sized `max(8192, configured)`.
    pub fn new(configured: usize) -> Self {
        Self {
            size: configured.max(MIN_BUFFER_SIZE),
            free: Mutex::new(Vec::new()),
        }
    }

    /// Capacity of every buffer handed out by this pool.
    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// Pop a pooled buffer, or allocate a fresh one on miss. Never blocks.
    pub fn acquire(&self) -> Vec<u8> {
        if let Ok(mut free) = self.free.lock() {
            if let Some(buf) = free.pop() {
                return buf;
            }
        }
        Vec::with_capacity(self.size)
    }

    /// Return a buffer for reuse.
    pub fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        if let Ok(mut free) = self.free.lock() {
            if free.len() < MAX_POOLED {
                free.push(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floors_buffer_size() {
        assert_eq!(BufferPool::new(0).buffer_size(), MIN_BUFFER_SIZE);
        assert_eq!(BufferPool::new(1024).buffer_size(), MIN_BUFFER_SIZE);
        assert_eq!(BufferPool::new(64 * 1024).buffer_size(), 64 * 1024);
    }

    #[test]
    fn reuses_released_buffers() {
        let pool = BufferPool::new(0);

        let mut buf = pool.acquire();
        buf.extend_from_slice(b"scratch");
        let ptr = buf.as_ptr();
        pool.release(buf);

        let buf = pool.acquire();
        assert_eq!(buf.as_ptr(), ptr);
        assert!(buf.is_empty());
        pool.release(buf);
    }

    #[test]
    fn allocates_on_miss() {
        let pool = BufferPool::new(0);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(a.capacity(), MIN_BUFFER_SIZE);
        assert_eq!(b.capacity(), MIN_BUFFER_SIZE);
        pool.release(a);
        pool.release(b);

        assert_eq!(pool.free.lock().unwrap().len(), 2);
    }
}
