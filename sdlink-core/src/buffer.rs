//! Receive buffer: grown on demand, reset between messages. Owned by the connection, so the
//! allocation is released when the connection is dropped.

use crate::error::{Result, SyncError};

/// Initial capacity of a fresh receive buffer.
pub const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
pub struct RecvBuffer {
    data: Vec<u8>,
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Ensure capacity for at least `n` bytes. Existing contents are discarded.
    pub fn ensure_capacity(&mut self, n: usize) -> Result<()> {
        self.data.clear();
        if n > self.data.capacity() {
            self.data
                .try_reserve_exact(n)
                .map_err(|_| SyncError::OutOfMemory)?;
        }
        Ok(())
    }

    /// Set the logical length to `n` zeroed bytes and return them for filling.
    pub fn fill_slot(&mut self, n: usize) -> Result<&mut [u8]> {
        self.ensure_capacity(n)?;
        self.data.resize(n, 0);
        Ok(&mut self.data[..])
    }

    /// Forget contents, keep the allocation.
    pub fn reset(&mut self) {
        self.data.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_keeps_allocation() {
        let mut buf = RecvBuffer::with_capacity(16);
        buf.fill_slot(10).unwrap().copy_from_slice(b"0123456789");
        assert_eq!(buf.as_slice(), b"0123456789");
        let cap = buf.capacity();
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), cap);
    }

    #[test]
    fn grows_on_demand() {
        let mut buf = RecvBuffer::with_capacity(4);
        let slot = buf.fill_slot(1000).unwrap();
        assert_eq!(slot.len(), 1000);
        assert!(buf.capacity() >= 1000);
    }
}
