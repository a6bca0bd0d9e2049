#![cfg_attr(not(feature = "std"), no_std)]

//! Block-addressed flash abstraction shared by the storage engine and the
//! boot swap machine.
//!
//! Devices are modelled as an array of uniformly sized erase blocks. Every
//! operation is blocking and atomic per call; power loss is only ever assumed
//! to strike between two calls, never inside one. Range preconditions are the
//! caller's responsibility.

pub mod nor;
#[cfg(feature = "std")]
pub mod sim;

/// Value every byte of an erased block reads back as.
pub const ERASED_BYTE: u8 = 0xFF;

/// Chunk size used by the default [`BlockFlash::move_range`] implementation.
const MOVE_CHUNK: usize = 128;

/// A flash device addressed by erase block.
pub trait BlockFlash {
    type Error: core::fmt::Debug;

    /// Size of one erase block in bytes.
    fn block_size(&self) -> u32;

    /// Number of erase blocks on the device.
    fn block_count(&self) -> u32;

    /// Reads `buf.len()` bytes starting at `offset` within `block`.
    fn read(&mut self, block: u32, offset: u32, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Programs `data` starting at `offset` within `block`.
    ///
    /// The target range must have been erased since it was last programmed.
    fn write(&mut self, block: u32, offset: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Erases `block`, returning every byte in it to [`ERASED_BYTE`].
    fn erase(&mut self, block: u32) -> Result<(), Self::Error>;

    /// Copies `len` bytes between two blocks without an intermediate caller
    /// buffer. Source and destination blocks must differ.
    ///
    /// Drivers that can do flash-to-flash transfers should override this;
    /// the default bounces through a small stack buffer.
    fn move_range(
        &mut self,
        dst_block: u32,
        dst_offset: u32,
        src_block: u32,
        src_offset: u32,
        len: u32,
    ) -> Result<(), Self::Error> {
        let mut chunk = [0u8; MOVE_CHUNK];
        let mut moved = 0u32;
        while moved < len {
            let n = core::cmp::min(MOVE_CHUNK as u32, len - moved) as usize;
            let part = &mut chunk[..n];
            self.read(src_block, src_offset + moved, part)?;
            self.write(dst_block, dst_offset + moved, part)?;
            moved += n as u32;
        }
        Ok(())
    }
}
