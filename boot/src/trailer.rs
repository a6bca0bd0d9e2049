//! Slot trailer: swap bookkeeping persisted at the tail of a region.
//!
//! Laid out backwards from the region end: 16-byte magic, `image_ok`
//! flag, `copy_done` flag, `swap_size`, then the swap-status array with
//! three bytes per sector-swap cycle, one byte programmed per completed
//! sub-step. Image slots size the array for every block they hold; the
//! scratch area keeps a single-cycle array that is folded back into the
//! primary trailer when its cycle finishes. All writes are single-byte
//! or single-word programs of erased cells, so a trailer is always
//! readable no matter where power was lost.

use log::debug;
use redoubt_flash::{BlockFlash, ERASED_BYTE};

use crate::error::BootError;
use crate::map::{Region, Slot, SlotMap};

/// Magic sealing a trailer whose owning operation wrote it completely.
pub const TRAILER_MAGIC: [u8; 16] = [
    0x3d, 0xb8, 0xf3, 0x96, 0x63, 0xd2, 0x5c, 0x95, 0x44, 0x1e, 0x71, 0xa6, 0x8f, 0x37, 0xc0, 0x52,
];

/// Programmed value of a set trailer flag.
pub const FLAG_SET: u8 = 0x01;

/// Sub-steps per sector-swap cycle, and so status bytes per cycle.
pub const STEPS_PER_CYCLE: u32 = 3;

/// State of a one-byte trailer flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagState {
    Set,
    Unset,
    Bad,
}

impl FlagState {
    pub fn classify(byte: u8) -> Self {
        match byte {
            FLAG_SET => FlagState::Set,
            ERASED_BYTE => FlagState::Unset,
            _ => FlagState::Bad,
        }
    }
}

/// State of a trailer magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MagicState {
    Good,
    Unset,
    Bad,
}

impl MagicState {
    pub fn classify(bytes: &[u8; 16]) -> Self {
        if *bytes == TRAILER_MAGIC {
            MagicState::Good
        } else if bytes.iter().all(|&b| b == ERASED_BYTE) {
            MagicState::Unset
        } else {
            MagicState::Bad
        }
    }
}

/// Decoded flag bytes of one trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapState {
    pub magic: MagicState,
    pub image_ok: FlagState,
    pub copy_done: FlagState,
}

/// Offsets of one region's trailer fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    region: Region,
    len: u32,
    entries: u32,
}

impl Trailer {
    /// Trailer of an image slot: one status cycle per block.
    pub fn for_slot(region: Region, block_size: u32) -> Self {
        Self {
            region,
            len: region.len(block_size),
            entries: STEPS_PER_CYCLE * region.block_count,
        }
    }

    /// Trailer of the scratch area: a single status cycle.
    pub fn for_scratch(region: Region, block_size: u32) -> Self {
        Self {
            region,
            len: region.len(block_size),
            entries: STEPS_PER_CYCLE,
        }
    }

    pub fn entries(&self) -> u32 {
        self.entries
    }

    /// Bytes the trailer occupies at the region tail.
    pub fn total_len(&self) -> u32 {
        16 + 1 + 1 + 4 + self.entries
    }

    pub fn magic_off(&self) -> u32 {
        self.len - 16
    }

    pub fn image_ok_off(&self) -> u32 {
        self.magic_off() - 1
    }

    pub fn copy_done_off(&self) -> u32 {
        self.image_ok_off() - 1
    }

    pub fn swap_size_off(&self) -> u32 {
        self.copy_done_off() - 4
    }

    pub fn status_off(&self) -> u32 {
        self.swap_size_off() - self.entries
    }

    // ---- reads ----

    /// Decodes the magic and both flags in one pass.
    pub fn read_state<F>(&self, flash: &mut F) -> Result<SwapState, F::Error>
    where
        F: BlockFlash,
    {
        let mut tail = [0u8; 18];
        self.region.read(flash, self.copy_done_off(), &mut tail)?;
        let mut magic = [0u8; 16];
        magic.copy_from_slice(&tail[2..18]);
        Ok(SwapState {
            magic: MagicState::classify(&magic),
            image_ok: FlagState::classify(tail[1]),
            copy_done: FlagState::classify(tail[0]),
        })
    }

    pub fn read_swap_size<F>(&self, flash: &mut F) -> Result<u32, F::Error>
    where
        F: BlockFlash,
    {
        let mut raw = [0u8; 4];
        self.region.read(flash, self.swap_size_off(), &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Reads the whole status array; `out` must hold `entries` bytes.
    pub fn read_status_bytes<F>(&self, flash: &mut F, out: &mut [u8]) -> Result<(), F::Error>
    where
        F: BlockFlash,
    {
        self.region.read(flash, self.status_off(), out)
    }

    // ---- writes ----

    pub fn write_magic<F>(&self, flash: &mut F) -> Result<(), F::Error>
    where
        F: BlockFlash,
    {
        self.region.write(flash, self.magic_off(), &TRAILER_MAGIC)
    }

    pub fn write_image_ok<F>(&self, flash: &mut F) -> Result<(), F::Error>
    where
        F: BlockFlash,
    {
        self.region.write(flash, self.image_ok_off(), &[FLAG_SET])
    }

    pub fn write_copy_done<F>(&self, flash: &mut F) -> Result<(), F::Error>
    where
        F: BlockFlash,
    {
        self.region.write(flash, self.copy_done_off(), &[FLAG_SET])
    }

    pub fn write_swap_size<F>(&self, flash: &mut F, size: u32) -> Result<(), F::Error>
    where
        F: BlockFlash,
    {
        self.region
            .write(flash, self.swap_size_off(), &size.to_le_bytes())
    }

    /// Programs the status byte recording one completed sub-step.
    ///
    /// The value encodes the sub-step within its cycle; readers only
    /// care that the byte is no longer erased.
    pub fn write_status_byte<F>(&self, flash: &mut F, index: u32) -> Result<(), F::Error>
    where
        F: BlockFlash,
    {
        let value = 1 + (index % STEPS_PER_CYCLE) as u8;
        self.region
            .write(flash, self.status_off() + index, &[value])
    }
}

// ---- swap requests ----

/// Queues the secondary image for a swap on the next boot.
///
/// Writes the trailer magic into the secondary slot, and `image_ok` as
/// well when the request is permanent. A leftover bad trailer is
/// cleared by erasing the slot's last block first; if the staged image
/// reaches into that block it will fail validation afterwards, which is
/// the safe outcome for a half-installed image.
pub fn mark_pending<F>(flash: &mut F, map: &SlotMap, permanent: bool) -> Result<(), BootError<F::Error>>
where
    F: BlockFlash,
{
    let region = map.slot(Slot::Secondary);
    let trailer = Trailer::for_slot(region, flash.block_size());
    let mut state = trailer.read_state(flash).map_err(BootError::Flash)?;
    match state.magic {
        MagicState::Good => {}
        MagicState::Unset => {
            trailer.write_magic(flash).map_err(BootError::Flash)?;
        }
        MagicState::Bad => {
            region
                .erase_blocks(flash, region.block_count - 1, 1)
                .map_err(BootError::Flash)?;
            trailer.write_magic(flash).map_err(BootError::Flash)?;
            // The erase cleared both flags along with the stale magic.
            state.image_ok = FlagState::Unset;
        }
    }
    if permanent && state.image_ok != FlagState::Set {
        trailer.write_image_ok(flash).map_err(BootError::Flash)?;
    }
    debug!(
        "secondary slot marked pending ({})",
        if permanent { "permanent" } else { "test" }
    );
    Ok(())
}

/// Confirms the image in the primary slot so the next boot keeps it.
pub fn mark_confirmed<F>(flash: &mut F, map: &SlotMap) -> Result<(), BootError<F::Error>>
where
    F: BlockFlash,
{
    let trailer = Trailer::for_slot(map.slot(Slot::Primary), flash.block_size());
    let state = trailer.read_state(flash).map_err(BootError::Flash)?;
    match state.magic {
        MagicState::Good => {}
        MagicState::Unset => {
            trailer.write_magic(flash).map_err(BootError::Flash)?;
        }
        MagicState::Bad => return Err(BootError::StatusCorrupt),
    }
    match state.image_ok {
        FlagState::Unset => {
            trailer.write_image_ok(flash).map_err(BootError::Flash)?;
            debug!("primary image confirmed");
        }
        FlagState::Set => {}
        FlagState::Bad => return Err(BootError::StatusCorrupt),
    }
    Ok(())
}

// ---- tests ----
