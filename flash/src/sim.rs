//! In-memory flash with power-loss injection.
//!
//! `SimFlash` backs the crash-consistency tests: give it an operation budget
//! with [`SimFlash::set_budget`], run a mutating sequence until it dies with
//! [`SimError::PowerCut`], then remount and inspect what survived. Budgets
//! count mutating operations only (write, erase, move); each operation is
//! applied fully or not at all, matching the per-call atomicity the engines
//! are allowed to assume.

use thiserror::Error;

use crate::{BlockFlash, ERASED_BYTE};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SimError {
    #[error("simulated power cut")]
    PowerCut,
    #[error("access outside the simulated device: block {block}, offset {offset}, len {len}")]
    OutOfRange { block: u32, offset: u32, len: usize },
}

/// RAM-backed block flash. Cloning snapshots the full device state,
/// including the operation counter.
#[derive(Clone)]
pub struct SimFlash {
    block_size: u32,
    blocks: Vec<Vec<u8>>,
    ops: u64,
    budget: Option<u64>,
}

impl SimFlash {
    /// Creates a fully erased device.
    pub fn new(block_size: u32, block_count: u32) -> Self {
        Self {
            block_size,
            blocks: vec![vec![ERASED_BYTE; block_size as usize]; block_count as usize],
            ops: 0,
            budget: None,
        }
    }

    /// Restores a device from a raw image. The image length must be a
    /// non-zero multiple of `block_size`.
    pub fn from_image(block_size: u32, image: &[u8]) -> Option<Self> {
        if block_size == 0 || image.is_empty() || image.len() % block_size as usize != 0 {
            return None;
        }
        let blocks = image
            .chunks_exact(block_size as usize)
            .map(|chunk| chunk.to_vec())
            .collect();
        Some(Self {
            block_size,
            blocks,
            ops: 0,
            budget: None,
        })
    }

    /// Serializes the device contents back into a flat image.
    pub fn image(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.blocks.len() * self.block_size as usize);
        for block in &self.blocks {
            out.extend_from_slice(block);
        }
        out
    }

    /// Number of mutating operations applied so far.
    pub fn ops(&self) -> u64 {
        self.ops
    }

    /// Cuts power after `ops` further mutating operations: the next mutation
    /// beyond the budget fails with [`SimError::PowerCut`] and is not applied.
    pub fn set_budget(&mut self, ops: u64) {
        self.budget = Some(ops);
    }

    /// Removes any power-cut budget, e.g. after a simulated reboot.
    pub fn clear_budget(&mut self) {
        self.budget = None;
    }

    fn consume(&mut self) -> Result<(), SimError> {
        match self.budget {
            Some(0) => Err(SimError::PowerCut),
            Some(ref mut left) => {
                *left -= 1;
                self.ops += 1;
                Ok(())
            }
            None => {
                self.ops += 1;
                Ok(())
            }
        }
    }

    fn check(&self, block: u32, offset: u32, len: usize) -> Result<(), SimError> {
        let oob = block as usize >= self.blocks.len()
            || offset as usize + len > self.block_size as usize;
        if oob {
            return Err(SimError::OutOfRange { block, offset, len });
        }
        Ok(())
    }
}

impl BlockFlash for SimFlash {
    type Error = SimError;

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.blocks.len() as u32
    }

    fn read(&mut self, block: u32, offset: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.check(block, offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.blocks[block as usize][start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, block: u32, offset: u32, data: &[u8]) -> Result<(), Self::Error> {
        self.check(block, offset, data.len())?;
        self.consume()?;
        let start = offset as usize;
        self.blocks[block as usize][start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn erase(&mut self, block: u32) -> Result<(), Self::Error> {
        self.check(block, 0, 0)?;
        self.consume()?;
        self.blocks[block as usize].fill(ERASED_BYTE);
        Ok(())
    }

    fn move_range(
        &mut self,
        dst_block: u32,
        dst_offset: u32,
        src_block: u32,
        src_offset: u32,
        len: u32,
    ) -> Result<(), Self::Error> {
        self.check(src_block, src_offset, len as usize)?;
        self.check(dst_block, dst_offset, len as usize)?;
        self.consume()?;
        let src = src_offset as usize;
        let chunk = self.blocks[src_block as usize][src..src + len as usize].to_vec();
        let dst = dst_offset as usize;
        self.blocks[dst_block as usize][dst..dst + len as usize].copy_from_slice(&chunk);
        Ok(())
    }
}
