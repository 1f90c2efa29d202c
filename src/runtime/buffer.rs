//! Owned operation buffers and a shared pool to recycle them.
//!
//! An [`IoBuffer`] is moved into the operation that reads into it and comes
//! back inside that operation's completion. While an operation is in flight
//! nothing else can reach the buffer, because nothing else owns it.

use parking_lot::Mutex;

/// Fixed-capacity buffer exclusively owned by one in-flight operation.
#[derive(Debug)]
pub struct IoBuffer {
    buf: Box<[u8]>,
    filled: usize,
}

impl IoBuffer {
    /// Allocate a zeroed buffer of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            filled: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Whole buffer, for an operation to write into.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Bytes written by the last completed operation.
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.filled]
    }

    /// Record how many bytes the operation produced.
    ///
    /// # Panics
    /// Panics if `n` exceeds the capacity (debug builds only).
    pub fn set_filled(&mut self, n: usize) {
        debug_assert!(n <= self.buf.len(), "filled length exceeds capacity");
        self.filled = n.min(self.buf.len());
    }

    /// Forget previous contents before re-posting the buffer.
    pub fn clear(&mut self) {
        self.filled = 0;
    }
}

/// Pool of equally sized buffers shared between threads.
///
/// Buffers are pre-allocated and handed out by value. Returning a buffer
/// makes it available to the next caller; the pool never holds more than
/// its capacity.
pub struct BufferPool {
    /// Stack of available buffers (LIFO for cache locality).
    free: Mutex<Vec<IoBuffer>>,
    buffer_size: usize,
    capacity: usize,
}

impl BufferPool {
    /// Create a pool holding `count` buffers of `size` bytes.
    pub fn new(count: usize, size: usize) -> Self {
        let free = (0..count).map(|_| IoBuffer::with_capacity(size)).collect();
        Self {
            free: Mutex::new(free),
            buffer_size: size,
            capacity: count,
        }
    }

    /// Take a buffer, allocating a fresh one if the pool is drained.
    pub fn acquire(&self) -> IoBuffer {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| IoBuffer::with_capacity(self.buffer_size))
    }

    /// Return a buffer. Buffers of a different size or beyond capacity are dropped.
    pub fn release(&self, mut buffer: IoBuffer) {
        if buffer.capacity() != self.buffer_size {
            return;
        }
        buffer.clear();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(buffer);
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffers currently sitting in the pool.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}
