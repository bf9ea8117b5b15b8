//! Read buffer pool.
//!
//! Every socket read borrows a buffer from the pool for the duration of that
//! read and returns it once the bytes have been framed. No buffer is ever
//! shared between two in-flight reads, so connections cannot observe each
//! other's data.

/// Fixed-size buffers handed out per read operation.
///
/// Buffers are pre-allocated and reused to avoid allocation overhead
/// on the hot path. The pool grows on demand and never shrinks.
pub struct BufferPool {
    /// Actual buffer storage.
    buffers: Vec<Box<[u8]>>,
    /// Stack of available buffer indices (LIFO for cache locality).
    free_list: Vec<usize>,
    /// Size of each buffer.
    buffer_size: usize,
}

impl BufferPool {
    /// Create a new buffer pool.
    ///
    /// # Arguments
    /// * `count` - Number of buffers to pre-allocate
    /// * `size` - Size of each buffer in bytes
    pub fn new(count: usize, size: usize) -> Self {
        let mut pool = Self {
            buffers: Vec::with_capacity(count),
            free_list: Vec::with_capacity(count),
            buffer_size: size,
        };
        for _ in 0..count {
            let idx = pool.grow();
            pool.free_list.push(idx);
        }
        pool
    }

    fn grow(&mut self) -> usize {
        self.buffers.push(vec![0u8; self.buffer_size].into_boxed_slice());
        self.buffers.len() - 1
    }

    /// Take a buffer out of the pool, allocating one if all are in use.
    pub fn alloc(&mut self) -> ReadBuf {
        let idx = match self.free_list.pop() {
            Some(idx) => idx,
            None => self.grow(),
        };
        ReadBuf {
            idx,
            data: std::mem::take(&mut self.buffers[idx]),
        }
    }

    /// Return a buffer to the pool.
    pub fn free(&mut self, buf: ReadBuf) {
        debug_assert!(buf.idx < self.buffers.len(), "buffer index out of bounds");
        self.buffers[buf.idx] = buf.data;
        self.free_list.push(buf.idx);
    }

    /// Get the size of each buffer.
    #[cfg(test)]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Get the total number of buffers.
    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    /// Get the number of available buffers.
    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.free_list.len()
    }
}

/// A buffer checked out of a [`BufferPool`].
#[derive(Debug)]
pub struct ReadBuf {
    idx: usize,
    data: Box<[u8]>,
}

impl std::ops::Deref for ReadBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl std::ops::DerefMut for ReadBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}
