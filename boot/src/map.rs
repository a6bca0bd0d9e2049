//! Slot map: where the two image slots and the scratch area live on the
//! device.
//!
//! A slot is a run of whole erase blocks. The swap engine walks both
//! slots in groups of scratch-sized blocks, so the map is only usable
//! when the slots mirror each other block for block and the whole
//! layout fits the device. [`SlotMap::is_valid`] is checked once at
//! bootloader construction; everything downstream relies on it.

use redoubt_flash::BlockFlash;

use crate::trailer::Trailer;

/// Upper bound on blocks per slot, sized so the swap-status array and
/// the rest of the trailer always fit inside one erase block.
pub const MAX_SLOT_BLOCKS: u32 = 120;

/// The two image slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Slot the device boots from.
    Primary,
    /// Staging slot holding an incoming image.
    Secondary,
}

impl Slot {
    pub fn other(self) -> Self {
        match self {
            Slot::Primary => Slot::Secondary,
            Slot::Secondary => Slot::Primary,
        }
    }
}

/// A run of whole erase blocks on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// First physical block of the run.
    pub first_block: u32,
    /// Number of blocks in the run.
    pub block_count: u32,
}

impl Region {
    pub const fn new(first_block: u32, block_count: u32) -> Self {
        Self {
            first_block,
            block_count,
        }
    }

    /// Region length in bytes.
    pub fn len(&self, block_size: u32) -> u32 {
        self.block_count * block_size
    }

    pub fn is_empty(&self) -> bool {
        self.block_count == 0
    }

    fn end_block(&self) -> u32 {
        self.first_block + self.block_count
    }

    fn overlaps(&self, other: &Region) -> bool {
        self.first_block < other.end_block() && other.first_block < self.end_block()
    }

    /// Reads `buf.len()` bytes starting at `offset` into the region,
    /// crossing block boundaries as needed.
    pub fn read<F>(&self, flash: &mut F, offset: u32, buf: &mut [u8]) -> Result<(), F::Error>
    where
        F: BlockFlash,
    {
        let block_size = flash.block_size();
        let mut off = offset;
        let mut done = 0usize;
        while done < buf.len() {
            let block = self.first_block + off / block_size;
            let in_block = off % block_size;
            let n = core::cmp::min((block_size - in_block) as usize, buf.len() - done);
            flash.read(block, in_block, &mut buf[done..done + n])?;
            off += n as u32;
            done += n;
        }
        Ok(())
    }

    /// Programs `data` starting at `offset` into the region, crossing
    /// block boundaries as needed. The range must be erased.
    pub fn write<F>(&self, flash: &mut F, offset: u32, data: &[u8]) -> Result<(), F::Error>
    where
        F: BlockFlash,
    {
        let block_size = flash.block_size();
        let mut off = offset;
        let mut done = 0usize;
        while done < data.len() {
            let block = self.first_block + off / block_size;
            let in_block = off % block_size;
            let n = core::cmp::min((block_size - in_block) as usize, data.len() - done);
            flash.write(block, in_block, &data[done..done + n])?;
            off += n as u32;
            done += n;
        }
        Ok(())
    }

    /// Erases `count` blocks starting at block index `first` within the
    /// region.
    pub fn erase_blocks<F>(&self, flash: &mut F, first: u32, count: u32) -> Result<(), F::Error>
    where
        F: BlockFlash,
    {
        for block in first..first + count {
            flash.erase(self.first_block + block)?;
        }
        Ok(())
    }

    /// Copies `len` bytes from `src_off` in this region to `dst_off` in
    /// `dst`. The regions must not share blocks; the destination range
    /// must be erased.
    pub fn copy_to<F>(
        &self,
        flash: &mut F,
        src_off: u32,
        dst: Region,
        dst_off: u32,
        len: u32,
    ) -> Result<(), F::Error>
    where
        F: BlockFlash,
    {
        let block_size = flash.block_size();
        let mut moved = 0u32;
        while moved < len {
            let src = src_off + moved;
            let dst_pos = dst_off + moved;
            let src_block = self.first_block + src / block_size;
            let dst_block = dst.first_block + dst_pos / block_size;
            let src_in = src % block_size;
            let dst_in = dst_pos % block_size;
            // Stop each transfer at the nearer block boundary.
            let n = (len - moved)
                .min(block_size - src_in)
                .min(block_size - dst_in);
            flash.move_range(dst_block, dst_in, src_block, src_in, n)?;
            moved += n;
        }
        Ok(())
    }
}

/// Placement of both slots and the scratch area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMap {
    pub primary: Region,
    pub secondary: Region,
    pub scratch: Region,
}

impl SlotMap {
    pub const fn new(primary: Region, secondary: Region, scratch: Region) -> Self {
        Self {
            primary,
            secondary,
            scratch,
        }
    }

    pub fn slot(&self, slot: Slot) -> Region {
        match slot {
            Slot::Primary => self.primary,
            Slot::Secondary => self.secondary,
        }
    }

    /// Whether the layout supports a swap on a device with the given
    /// geometry: slots mirror each other, every region is in range and
    /// disjoint, and the trailer fits inside the last block of a slot.
    pub fn is_valid(&self, block_size: u32, block_count: u32) -> bool {
        let regions = [self.primary, self.secondary, self.scratch];
        for region in &regions {
            if region.is_empty() || region.end_block() > block_count {
                return false;
            }
        }
        if self.primary.overlaps(&self.secondary)
            || self.primary.overlaps(&self.scratch)
            || self.secondary.overlaps(&self.scratch)
        {
            return false;
        }
        if self.primary.block_count != self.secondary.block_count {
            return false;
        }
        if self.primary.block_count > MAX_SLOT_BLOCKS {
            return false;
        }
        // The whole trailer lives in the last block of each slot.
        Trailer::for_slot(self.primary, block_size).total_len() <= block_size
    }
}

// ---- tests ----

#[cfg(test)]
mod tests {
    use super::*;
    use redoubt_flash::sim::SimFlash;

    /// 5 blocks of 256 bytes, region covering blocks 1..=3.
    fn fixture() -> (SimFlash, Region) {
        (SimFlash::new(256, 5), Region::new(1, 3))
    }

    #[test]
    fn read_write_cross_block_boundaries() {
        let (mut flash, region) = fixture();
        let data: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();

        region.write(&mut flash, 200, &data).unwrap();

        let mut back = vec![0u8; 300];
        region.read(&mut flash, 200, &mut back).unwrap();
        assert_eq!(back, data);

        // Byte 200 lands 200 bytes into physical block 1.
        let mut first = [0u8; 1];
        flash.read(1, 200, &mut first).unwrap();
        assert_eq!(first[0], data[0]);
        // Region offset 256 starts physical block 2.
        let mut split = [0u8; 1];
        flash.read(2, 0, &mut split).unwrap();
        assert_eq!(split[0], data[56]);
    }

    #[test]
    fn copy_to_handles_misaligned_ranges() {
        let (mut flash, src) = fixture();
        let dst = Region::new(4, 1);
        let data: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        src.write(&mut flash, 100, &data).unwrap();

        src.copy_to(&mut flash, 100, dst, 30, 200).unwrap();

        let mut back = vec![0u8; 200];
        dst.read(&mut flash, 30, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn erase_blocks_clears_only_the_requested_run() {
        let (mut flash, region) = fixture();
        region.write(&mut flash, 0, &[0xAA; 256 * 3]).unwrap();

        region.erase_blocks(&mut flash, 1, 1).unwrap();

        let mut buf = [0u8; 256];
        region.read(&mut flash, 0, &mut buf).unwrap();
        assert_eq!(buf, [0xAA; 256]);
        region.read(&mut flash, 256, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 256]);
        region.read(&mut flash, 512, &mut buf).unwrap();
        assert_eq!(buf, [0xAA; 256]);
    }

    #[test]
    fn map_validation_rejects_broken_layouts() {
        let good = SlotMap::new(Region::new(0, 4), Region::new(4, 4), Region::new(8, 1));
        assert!(good.is_valid(512, 9));

        // Region past the end of the device.
        assert!(!good.is_valid(512, 8));
        // Slots of different sizes.
        let uneven = SlotMap::new(Region::new(0, 4), Region::new(4, 3), Region::new(8, 1));
        assert!(!uneven.is_valid(512, 9));
        // Overlapping slot and scratch.
        let overlap = SlotMap::new(Region::new(0, 4), Region::new(4, 4), Region::new(7, 1));
        assert!(!overlap.is_valid(512, 9));
        // Empty scratch.
        let empty = SlotMap::new(Region::new(0, 4), Region::new(4, 4), Region::new(8, 0));
        assert!(!empty.is_valid(512, 9));
    }

    #[test]
    fn map_validation_bounds_the_status_area() {
        let wide = SlotMap::new(
            Region::new(0, MAX_SLOT_BLOCKS + 1),
            Region::new(MAX_SLOT_BLOCKS + 1, MAX_SLOT_BLOCKS + 1),
            Region::new(2 * (MAX_SLOT_BLOCKS + 1), 1),
        );
        assert!(!wide.is_valid(4096, 3 * (MAX_SLOT_BLOCKS + 1)));

        // A tiny block cannot hold the trailer of a 4-block slot.
        let tiny = SlotMap::new(Region::new(0, 4), Region::new(4, 4), Region::new(8, 1));
        assert!(!tiny.is_valid(32, 9));
    }

    #[test]
    fn slot_other_flips() {
        assert_eq!(Slot::Primary.other(), Slot::Secondary);
        assert_eq!(Slot::Secondary.other(), Slot::Primary);
    }
}
