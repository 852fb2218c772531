//! Fixed-capacity callchain storage

use std::fmt;

/// One captured callchain
///
/// Addresses are appended in walk order by the frame walkers. The backing
/// storage is allocated once with the generation that owns it and never grows:
/// pushing past capacity drops the address.
pub struct CallchainEntry {
    len: usize,
    ips: Box<[u64]>,
}

impl CallchainEntry {
    pub(crate) fn from_storage(ips: Box<[u64]>) -> Self {
        Self { len: 0, ips }
    }

    /// Append an address
    ///
    /// Returns `false` (and stores nothing) once the entry is full.
    #[inline]
    pub fn push(&mut self, ip: u64) -> bool {
        match self.ips.get_mut(self.len) {
            Some(slot) => {
                *slot = ip;
                self.len += 1;
                true
            }
            None => false,
        }
    }

    /// Append as many of `ips` as fit; returns how many were stored
    pub fn extend_from_slice(&mut self, ips: &[u64]) -> usize {
        let room = self.remaining().min(ips.len());
        self.ips[self.len..self.len + room].copy_from_slice(&ips[..room]);
        self.len += room;
        room
    }

    /// Captured addresses, markers included
    #[must_use]
    pub fn ips(&self) -> &[u64] {
        &self.ips[..self.len]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ips.len()
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.len
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Start a new capture with `reserved` leading zero slots
    ///
    /// Reserved slots are filled in later by whoever requested them; walkers
    /// append after them. Returns how many slots were actually reserved.
    pub(crate) fn reset(&mut self, reserved: usize) -> usize {
        let reserved = reserved.min(self.capacity());
        self.ips[..reserved].fill(0);
        self.len = reserved;
        reserved
    }

    /// Mutable view of the captured addresses
    ///
    /// Used to fill in slots reserved at the start of the capture.
    pub fn ips_mut(&mut self) -> &mut [u64] {
        &mut self.ips[..self.len]
    }
}

impl fmt::Debug for CallchainEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallchainEntry")
            .field("capacity", &self.capacity())
            .field("ips", &format_args!("{:x?}", self.ips()))
            .finish()
    }
}
