// src/net/buffer.rs - Fixed-capacity byte buffer shared by both transports
use crate::net::TransportError;

/// A byte region with a logical fill length. Bytes past `len()` are garbage.
#[derive(Clone)]
pub struct ConnBuffer {
    data: Box<[u8]>,
    used: usize,
}

impl ConnBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn is_full(&self) -> bool {
        self.used == self.data.len()
    }

    pub fn spare(&self) -> usize {
        self.data.len() - self.used
    }

    /// The meaningful bytes.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// The unused tail, for a read to land in. Follow with [`ConnBuffer::advance`].
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.used..]
    }

    /// Account for `n` bytes written into [`ConnBuffer::spare_mut`].
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.spare(), "advance past capacity");
        self.used = (self.used + n).min(self.data.len());
    }

    /// Append all of `bytes` or nothing.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if bytes.len() > self.spare() {
            return Err(TransportError::Overflow {
                capacity: self.capacity(),
                requested: self.used + bytes.len(),
            });
        }
        self.data[self.used..self.used + bytes.len()].copy_from_slice(bytes);
        self.used += bytes.len();
        Ok(())
    }

    /// Drop the first `n` bytes, shifting the remainder to the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.used);
        self.data.copy_within(n..self.used, 0);
        self.used -= n;
    }

    /// Copy up to `dst.len()` leading bytes without consuming them.
    pub fn peek_into(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.used);
        dst[..n].copy_from_slice(&self.data[..n]);
        n
    }

    pub fn clear(&mut self) {
        self.used = 0;
    }
}

impl std::fmt::Debug for ConnBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnBuffer")
            .field("capacity", &self.capacity())
            .field("used", &self.used)
            .finish()
    }
}
