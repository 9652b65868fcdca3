//! A fixed-capacity byte ring shared between a producer and a consumer. It is
//!  the reassembly surface on the receive side of a connection and the staging
//!  surface on the send side, but it has no notion of either - it just moves
//!  bytes with bounded memory and well-defined partial-progress semantics.

use crate::error::{Result, TransportError};
use std::cmp::min;
use std::sync::Mutex;

pub struct RingBuffer {
    capacity: usize,
    inner: Mutex<RingInner>,
}

struct RingInner {
    storage: Vec<u8>,
    /// write position
    head: usize,
    /// read position
    tail: usize,
    size: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Result<RingBuffer> {
        if capacity == 0 {
            return Err(TransportError::InvalidCapacity);
        }

        Ok(RingBuffer {
            capacity,
            inner: Mutex::new(RingInner {
                storage: vec![0; capacity],
                head: 0,
                tail: 0,
                size: 0,
            }),
        })
    }

    /// Copy up to `min(data.len(), free)` bytes into the buffer, returning the
    ///  number of bytes actually copied. Writing an empty slice is a no-op.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let mut inner = self.inner.lock().unwrap();
        let free = self.capacity - inner.size;
        if free == 0 {
            return Err(TransportError::BufferFull);
        }

        let n = min(free, data.len());
        inner.copy_in(&data[..n]);
        Ok(n)
    }

    /// Copy all of `data` into the buffer, or none of it: if the free space is
    ///  insufficient this fails without any observable partial write.
    pub fn write_all(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.lock().unwrap();
        if data.len() > self.capacity - inner.size {
            return Err(TransportError::BufferFull);
        }

        inner.copy_in(data);
        Ok(())
    }

    /// Copy up to `min(out.len(), available)` bytes into `out`, advancing the
    ///  read position. Reading into an empty slice is a no-op.
    pub fn read(&self, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.size == 0 {
            return Err(TransportError::BufferEmpty);
        }

        let n = min(inner.size, out.len());
        inner.copy_out(&mut out[..n]);
        inner.advance_tail(n);
        Ok(n)
    }

    /// Drain the buffer completely. Returns an empty vec when there is nothing
    ///  buffered.
    pub fn read_all(&self) -> Vec<u8> {
        let mut inner = self.inner.lock().unwrap();
        let mut out = vec![0; inner.size];
        inner.copy_out(&mut out);
        let n = out.len();
        inner.advance_tail(n);
        out
    }

    /// Like [`RingBuffer::read`], but does not advance the read position.
    pub fn peek(&self, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        let inner = self.inner.lock().unwrap();
        if inner.size == 0 {
            return Err(TransportError::BufferEmpty);
        }

        let n = min(inner.size, out.len());
        inner.copy_out(&mut out[..n]);
        Ok(n)
    }

    /// Advance the read position by `n` bytes without copying them out.
    pub fn skip(&self, n: usize) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if n > inner.size {
            return Err(TransportError::BufferEmpty);
        }

        inner.advance_tail(n);
        Ok(())
    }

    /// The number of bytes available for reading.
    pub fn available(&self) -> usize {
        self.inner.lock().unwrap().size
    }

    /// The number of bytes that can be written before the buffer is full.
    pub fn free_space(&self) -> usize {
        self.capacity - self.inner.lock().unwrap().size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().size == 0
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().unwrap().size == self.capacity
    }

    /// Return to the empty state. The storage is not zeroed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.head = 0;
        inner.tail = 0;
        inner.size = 0;
    }
}

impl RingInner {
    /// Copy `data` in at the head. The caller has checked that it fits; the
    ///  range may straddle the end of the storage.
    fn copy_in(&mut self, data: &[u8]) {
        let capacity = self.storage.len();
        let first = min(data.len(), capacity - self.head);
        self.storage[self.head..self.head + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            self.storage[..data.len() - first].copy_from_slice(&data[first..]);
        }

        self.head = (self.head + data.len()) % capacity;
        self.size += data.len();
    }

    /// Copy `out.len()` bytes starting at the tail, without advancing it. The
    ///  caller has checked that at least that many bytes are buffered.
    fn copy_out(&self, out: &mut [u8]) {
        let capacity = self.storage.len();
        let first = min(out.len(), capacity - self.tail);
        out[..first].copy_from_slice(&self.storage[self.tail..self.tail + first]);
        if first < out.len() {
            let rest = out.len() - first;
            out[first..].copy_from_slice(&self.storage[..rest]);
        }
    }

    fn advance_tail(&mut self, n: usize) {
        self.tail = (self.tail + n) % self.storage.len();
        self.size -= n;
    }
}
