//! Adapter exposing any byte-programmable NOR flash as a [`BlockFlash`].

use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};

use crate::BlockFlash;

/// Wraps an [`embedded_storage`] NOR device, mapping erase blocks onto the
/// trait's `ERASE_SIZE` units.
///
/// Only byte-programmable parts fit here: the storage engine writes single
/// header bytes at arbitrary offsets, so `WRITE_SIZE` and `READ_SIZE` must
/// both be 1.
pub struct NorAdapter<F> {
    inner: F,
}

impl<F: NorFlash> NorAdapter<F> {
    pub fn new(inner: F) -> Self {
        debug_assert!(F::READ_SIZE == 1 && F::WRITE_SIZE == 1);
        Self { inner }
    }

    pub fn into_inner(self) -> F {
        self.inner
    }

    fn base(&self, block: u32, offset: u32) -> u32 {
        block * F::ERASE_SIZE as u32 + offset
    }
}

impl<F: NorFlash> BlockFlash for NorAdapter<F> {
    type Error = F::Error;

    fn block_size(&self) -> u32 {
        F::ERASE_SIZE as u32
    }

    fn block_count(&self) -> u32 {
        (self.inner.capacity() / F::ERASE_SIZE) as u32
    }

    fn read(&mut self, block: u32, offset: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        let base = self.base(block, offset);
        self.inner.read(base, buf)
    }

    fn write(&mut self, block: u32, offset: u32, data: &[u8]) -> Result<(), Self::Error> {
        let base = self.base(block, offset);
        self.inner.write(base, data)
    }

    fn erase(&mut self, block: u32) -> Result<(), Self::Error> {
        let from = self.base(block, 0);
        self.inner.erase(from, from + F::ERASE_SIZE as u32)
    }
}
