//! Fixed-capacity circular byte queue.
//!
//! Full and empty are told apart with a pair of single-bit mirror flags instead of a spare
//! slot or a separate counter:
//! - every time a cursor wraps past the end of the store, its own mirror bit toggles;
//! - when `read_index == write_index`, equal mirrors mean **empty**, different mirrors mean **full**.
//!
//! All operations are total. Short transfers are reported through the returned count.
//! The buffer itself is not interrupt-safe; owners that share it with an interrupt handler
//! wrap it in an interrupt-safe lock.
use alloc::{boxed::Box, vec};
use core::{cmp::min, fmt::Debug};

pub struct RingBuffer {
    buffer: Box<[u8]>,
    read_index: usize,
    write_index: usize,
    read_mirror: bool,
    write_mirror: bool,
}

impl RingBuffer {
    /// Allocate a buffer able to hold `capacity` bytes.
    pub fn new(capacity: usize) -> RingBuffer {
        RingBuffer {
            buffer: vec![0u8; capacity].into_boxed_slice(),
            read_index: 0,
            write_index: 0,
            read_mirror: false,
            write_mirror: false,
        }
    }

    /// Reallocate the store with a new capacity. The current content is discarded.
    pub fn init(&mut self, capacity: usize) {
        *self = RingBuffer::new(capacity);
    }

    /// Release the store. A freed buffer has capacity 0 and accepts nothing.
    pub fn free(&mut self) {
        self.init(0);
    }

    /// Drop the content while keeping the store.
    pub fn reset(&mut self) {
        self.read_index = 0;
        self.write_index = 0;
        self.read_mirror = false;
        self.write_mirror = false;
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Number of bytes ready to be read.
    pub fn data_size(&self) -> usize {
        if self.read_index == self.write_index {
            if self.read_mirror == self.write_mirror {
                0
            } else {
                self.capacity()
            }
        } else if self.write_index > self.read_index {
            self.write_index - self.read_index
        } else {
            self.capacity() - self.read_index + self.write_index
        }
    }

    /// Number of bytes that can be written without overwriting.
    pub fn space_size(&self) -> usize {
        self.capacity() - self.data_size()
    }

    pub fn is_empty(&self) -> bool {
        self.data_size() == 0
    }

    pub fn is_full(&self) -> bool {
        self.space_size() == 0
    }

    /// Move up to `dst.len()` of the oldest bytes into `dst`. Return the count moved.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let size = min(dst.len(), self.data_size());
        if size == 0 {
            return 0;
        }
        let first = min(size, self.capacity() - self.read_index);
        dst[..first].copy_from_slice(&self.buffer[self.read_index..self.read_index + first]);
        dst[first..size].copy_from_slice(&self.buffer[..size - first]);
        self.advance_read(size);
        size
    }

    /// Append as much of `src` as fits. Never overwrites unread data.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let size = min(src.len(), self.space_size());
        if size == 0 {
            return 0;
        }
        self.copy_in(&src[..size]);
        self.advance_write(size);
        size
    }

    /// Append `src`, discarding the oldest data when there is not enough space.
    ///
    /// At most `capacity` bytes are admitted: only the most recent ones are kept when `src`
    /// is longer than the whole store.
    pub fn write_force(&mut self, src: &[u8]) -> usize {
        let capacity = self.capacity();
        if capacity == 0 || src.is_empty() {
            return 0;
        }
        let src = if src.len() > capacity {
            &src[src.len() - capacity..]
        } else {
            src
        };
        let size = src.len();
        let space = self.space_size();
        self.copy_in(src);
        self.advance_write(size);
        if size > space {
            // The oldest `size - space` bytes were overwritten; skip them.
            self.advance_read(size - space);
        }
        size
    }

    /// Append one byte. Return `false` when the buffer is full.
    pub fn push(&mut self, byte: u8) -> bool {
        self.write(&[byte]) == 1
    }

    /// Append one byte, dropping the oldest one when full.
    pub fn push_force(&mut self, byte: u8) -> bool {
        self.write_force(&[byte]) == 1
    }

    /// Take the oldest byte.
    pub fn pop(&mut self) -> Option<u8> {
        let mut byte = [0u8];
        match self.read(&mut byte) {
            1 => Some(byte[0]),
            _ => None,
        }
    }

    fn copy_in(&mut self, src: &[u8]) {
        let size = src.len();
        let first = min(size, self.capacity() - self.write_index);
        self.buffer[self.write_index..self.write_index + first].copy_from_slice(&src[..first]);
        self.buffer[..size - first].copy_from_slice(&src[first..]);
    }

    fn advance_read(&mut self, count: usize) {
        self.read_index += count;
        if self.read_index >= self.capacity() {
            self.read_index -= self.capacity();
            self.read_mirror = !self.read_mirror;
        }
    }

    fn advance_write(&mut self, count: usize) {
        self.write_index += count;
        if self.write_index >= self.capacity() {
            self.write_index -= self.capacity();
            self.write_mirror = !self.write_mirror;
        }
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        RingBuffer::new(0)
    }
}

impl Debug for RingBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("data_size", &self.data_size())
            .field("read_index", &self.read_index)
            .field("write_index", &self.write_index)
            .finish()
    }
}
