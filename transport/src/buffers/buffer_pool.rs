use bytes::BytesMut;
use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

/// A pool of fixed-size packet buffers. Buffers are handed out as [PooledBuf] which returns
///  itself to the pool when dropped, so every packet buffer has exactly one owner at a time.
///
/// The pool counts the buffers that are currently handed out against a ceiling that is derived
///  from the memory budget. [BufferPool::try_get_from_pool] honors that ceiling,
///  [BufferPool::get_from_pool] does not (it is for control packets that must go out regardless).
pub struct BufferPool {
    name: &'static str,
    buf_size: usize,
    max_buffers: usize,
    in_use: AtomicUsize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl Debug for BufferPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "BufferPool{{{}: {}/{} x {}}}", self.name, self.in_use(), self.max_buffers, self.buf_size)
    }
}

impl BufferPool {
    pub fn new(name: &'static str, buf_size: usize, max_buffers: usize, max_pool_size: usize) -> Arc<Self> {
        Arc::new(BufferPool {
            name,
            buf_size,
            max_buffers: max_buffers.max(1),
            in_use: AtomicUsize::new(0),
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        })
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn max_buffers(&self) -> usize {
        self.max_buffers
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn utilization_percent(&self) -> u32 {
        let percent = self.in_use() * 100 / self.max_buffers;
        percent.min(u32::MAX as usize) as u32
    }

    pub fn try_get_from_pool(self: &Arc<Self>) -> Option<PooledBuf> {
        if self.in_use() >= self.max_buffers {
            debug!("{} pool exhausted: {} buffers in use", self.name, self.in_use());
            return None;
        }
        Some(self.get_from_pool())
    }

    pub fn get_from_pool(self: &Arc<Self>) -> PooledBuf {
        self.in_use.fetch_add(1, Ordering::Relaxed);

        let recycled = self.lock_buffers().pop();
        let buf = match recycled {
            Some(buf) => {
                trace!("returning buffer from pool");
                buf
            }
            None => {
                debug!("no buffer in {} pool: creating new buffer", self.name);
                BytesMut::with_capacity(self.buf_size)
            }
        };

        PooledBuf {
            buf,
            pool: self.clone(),
        }
    }

    /// convenience for copying a received packet into a pooled buffer
    pub fn copy_from_slice(self: &Arc<Self>, data: &[u8]) -> PooledBuf {
        let mut result = self.get_from_pool();
        result.extend_from_slice(data);
        result
    }

    fn return_to_pool(&self, mut buffer: BytesMut) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);

        if buffer.capacity() != self.buf_size {
            trace!("returned buffer has capacity {} instead of {} - discarding", buffer.capacity(), self.buf_size);
            return;
        }

        buffer.clear();

        let mut buffers = self.lock_buffers();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("{} pool is full: discarding returned buffer", self.name);
        }
    }

    fn lock_buffers(&self) -> MutexGuard<'_, Vec<BytesMut>> {
        self.buffers.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// An owned packet buffer that goes back to its pool on drop
pub struct PooledBuf {
    buf: BytesMut,
    pool: Arc<BufferPool>,
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.return_to_pool(buf);
    }
}

impl Debug for PooledBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PooledBuf{:?}", self.buf.as_ref())
    }
}

impl Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        self.buf.as_ref()
    }
}

impl PartialEq<[u8]> for PooledBuf {
    fn eq(&self, other: &[u8]) -> bool {
        self.buf.as_ref() == other
    }
}
