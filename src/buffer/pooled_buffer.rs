use crate::{AppError, AppResult};

use super::{ObjectPool, PoolPolicy};

/// A fixed-capacity byte buffer with explicit read/write cursors.
///
/// The buffer backs both the receive and the send staging paths. Writers
/// reserve space with [`open`](PooledBuffer::open), fill the returned slice
/// and make the bytes visible with [`commit`](PooledBuffer::commit). Readers
/// consume from the unread region with [`take`](PooledBuffer::take). The
/// cursors always satisfy `read_pos <= write_pos <= capacity`.
#[derive(Debug)]
pub struct PooledBuffer {
    data: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    reserved: usize,
}

impl PooledBuffer {
    pub fn with_capacity(capacity: usize) -> PooledBuffer {
        PooledBuffer {
            data: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
            reserved: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of committed bytes not yet consumed.
    pub fn unread_len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Free space left behind the write cursor.
    pub fn free_len(&self) -> usize {
        self.data.len() - self.write_pos
    }

    pub fn is_empty(&self) -> bool {
        self.unread_len() == 0
    }

    /// The committed, not yet consumed region.
    pub fn unread_bytes(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Reserves `n` bytes at the write cursor and returns the writable slice.
    ///
    /// Fails if fewer than `n` bytes remain behind the write cursor. The
    /// reservation is consumed by the following [`commit`](PooledBuffer::commit).
    pub fn open(&mut self, n: usize) -> AppResult<&mut [u8]> {
        if n > self.free_len() {
            return Err(AppError::IllegalStateError(format!(
                "buffer open of {} bytes exceeds free space {}",
                n,
                self.free_len()
            )));
        }
        self.reserved = n;
        let start = self.write_pos;
        Ok(&mut self.data[start..start + n])
    }

    /// Advances the write cursor by `n`, which must not exceed the amount
    /// reserved by the preceding [`open`](PooledBuffer::open).
    pub fn commit(&mut self, n: usize) -> AppResult<()> {
        if n > self.reserved {
            return Err(AppError::IllegalStateError(format!(
                "buffer commit of {} bytes exceeds reservation {}",
                n, self.reserved
            )));
        }
        self.write_pos += n;
        self.reserved = 0;
        Ok(())
    }

    /// Consumes `n` bytes from the unread region, advancing the read cursor.
    pub fn take(&mut self, n: usize) -> AppResult<&[u8]> {
        if n > self.unread_len() {
            return Err(AppError::IllegalStateError(format!(
                "buffer take of {} bytes exceeds unread {}",
                n,
                self.unread_len()
            )));
        }
        let start = self.read_pos;
        self.read_pos += n;
        Ok(&self.data[start..start + n])
    }

    /// Moves the unread tail to offset 0 and resets the cursors to
    /// `(0, unread)`. This is a copy within the buffer, not an allocation,
    /// and is called once per receive-loop iteration to reclaim the front.
    pub fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        let unread = self.unread_len();
        if unread > 0 {
            self.data.copy_within(self.read_pos..self.write_pos, 0);
        }
        self.read_pos = 0;
        self.write_pos = unread;
    }

    /// Clears both cursors and any pending reservation. Invoked by the pool
    /// reset policy before the buffer is handed out again.
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.reserved = 0;
    }
}

/// Creation/reset policy for receive buffers drawn from an [`ObjectPool`].
#[derive(Debug, Clone)]
pub struct BufferPoolPolicy {
    capacity: usize,
}

impl BufferPoolPolicy {
    pub fn new(capacity: usize) -> BufferPoolPolicy {
        BufferPoolPolicy { capacity }
    }
}

impl PoolPolicy<PooledBuffer> for BufferPoolPolicy {
    fn create(&self) -> PooledBuffer {
        PooledBuffer::with_capacity(self.capacity)
    }

    fn reset(&self, buffer: &mut PooledBuffer) {
        buffer.reset();
    }
}

pub type BufferPool = ObjectPool<PooledBuffer>;
