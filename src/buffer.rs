//! Growable receive buffer used by the [`Reassembler`](crate::reassembler::Reassembler).

use crate::Result;
use crate::error::Error;

/// An owned byte region with a logical write position.
///
/// Capacity only ever doubles. Growing allocates a new region, copies the bytes written so far
/// and replaces the old one, so the write position is preserved across a resize.
#[derive(Debug)]
pub struct ReceiveBuffer {
    bytes: Box<[u8]>,
    len: usize,
}

impl ReceiveBuffer {
    /// Allocate a buffer of `capacity` bytes. A zero capacity is a configuration error because
    /// the buffer could never make progress.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::configuration(
                "receive buffer capacity must be greater than zero",
            ));
        }

        Ok(Self {
            bytes: vec![0_u8; capacity].into_boxed_slice(),
            len: 0,
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Number of bytes written for the in-progress message.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len == self.bytes.len()
    }

    /// Bytes written so far.
    #[must_use]
    pub fn filled(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Free space after the write position.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[self.len..]
    }

    /// Move the write position forward by `n` bytes, clamped to the capacity.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(
            n <= self.bytes.len() - self.len,
            "advanced past the end of the receive buffer"
        );
        self.len = self.len.saturating_add(n).min(self.bytes.len());
    }

    /// Reset the write position, keeping the current capacity.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Replace the region with one of twice the capacity.
    pub fn grow(&mut self) -> Result<()> {
        let capacity = self
            .capacity()
            .checked_mul(2)
            .ok_or_else(|| Error::buffer_overflow(self.capacity()))?;

        let mut next = vec![0_u8; capacity].into_boxed_slice();
        next[..self.len].copy_from_slice(self.filled());
        self.bytes = next;

        Ok(())
    }
}
