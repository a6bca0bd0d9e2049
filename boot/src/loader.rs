//! Boot path: decide which image runs, swapping slots when asked.
//!
//! A swap moves both images through the scratch area one block group at
//! a time, recording each completed sub-step as a one-byte program into
//! the status array. Losing power mid-swap leaves enough state behind
//! that the next boot replays the interrupted cycle from its last
//! recorded sub-step and finishes the swap before anything runs.

use alloc::vec;
use core::fmt;

use log::{debug, error, info, warn};
use redoubt_flash::BlockFlash;

use crate::error::BootError;
use crate::image::{ImageHeader, ImageVerifier};
use crate::map::{Region, Slot, SlotMap};
use crate::status::{
    previous_swap, requested_swap, scan_status_bytes, status_source, BootStatus, StatusSource,
    SwapType,
};
use crate::trailer::{mark_confirmed, FlagState, Trailer, STEPS_PER_CYCLE};

// ---- rollback counter ----

/// Monotonic rollback-protection counter.
///
/// `update` records that an image with the given counter value was
/// accepted. Implementations must never lower the stored value.
pub trait SecurityCounter {
    type Error: fmt::Debug;

    fn update(&mut self, value: u32) -> Result<(), Self::Error>;
}

/// Counter held in memory, for hosts and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RamCounter {
    value: u32,
}

impl RamCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> u32 {
        self.value
    }
}

impl SecurityCounter for RamCounter {
    type Error = core::convert::Infallible;

    fn update(&mut self, value: u32) -> Result<(), Self::Error> {
        self.value = self.value.max(value);
        Ok(())
    }
}

// ---- boot entry ----

/// What to run once [`Bootloader::boot_go`] settles the slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootResponse {
    /// Byte offset of the bootable image on the device.
    pub image_offset: u32,
    /// Header of the image at that offset.
    pub header: ImageHeader,
}

/// Swap state machine over one flash device and a slot map.
pub struct Bootloader<F, V, C> {
    flash: F,
    map: SlotMap,
    verifier: V,
    counter: C,
    block_size: u32,
}

impl<F, V, C> Bootloader<F, V, C>
where
    F: BlockFlash,
    V: ImageVerifier,
    C: SecurityCounter,
{
    /// Builds a bootloader after checking the slots can be swapped.
    pub fn new(flash: F, map: SlotMap, verifier: V, counter: C) -> Result<Self, BootError<F::Error>> {
        let block_size = flash.block_size();
        if !map.is_valid(block_size, flash.block_count()) {
            return Err(BootError::IncompatibleSlots);
        }
        Ok(Self {
            flash,
            map,
            verifier,
            counter,
            block_size,
        })
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn into_flash(self) -> F {
        self.flash
    }

    pub fn map(&self) -> &SlotMap {
        &self.map
    }

    pub fn counter(&self) -> &C {
        &self.counter
    }

    /// Runs the full boot decision and returns the image to hand off to.
    ///
    /// Finishes any interrupted swap first, then performs whatever swap
    /// the trailers request, and only reports an image that validated
    /// in the primary slot. `BadImage` means nothing bootable survived;
    /// `Fatal` means a finalization write failed and the device should
    /// halt rather than guess.
    pub fn boot_go(&mut self) -> Result<BootResponse, BootError<F::Error>> {
        let mut bs = self.read_status()?;
        let swap_type = if bs.in_progress() {
            info!(
                "finishing interrupted swap from cycle {} step {}",
                bs.idx, bs.state
            );
            self.copy_image(&mut bs)?;
            let finished = previous_swap(self.requested_swap_type()?);
            info!("interrupted swap finished, treated as {finished:?}");
            finished
        } else {
            let requested = self.validated_swap_type()?;
            if matches!(
                requested,
                SwapType::Test | SwapType::Perm | SwapType::Revert
            ) {
                info!("{requested:?} swap requested");
                self.copy_image(&mut bs)?;
            }
            requested
        };

        if matches!(swap_type, SwapType::Revert | SwapType::Fail) {
            // The primary image is the one we fall back to; pin it so
            // the next boot does not try to undo the fallback.
            if let Err(err) = mark_confirmed(&mut self.flash, &self.map) {
                error!("cannot pin the primary image after {swap_type:?}: {err}");
                return Err(BootError::Fatal);
            }
        }

        if matches!(
            swap_type,
            SwapType::Test | SwapType::Perm | SwapType::Revert
        ) {
            if swap_type == SwapType::Perm {
                let header = self.read_header(Slot::Primary)?;
                self.update_counter(&header)?;
            }
            let trailer = self.slot_trailer(Slot::Primary);
            if let Err(err) = trailer.write_copy_done(&mut self.flash) {
                error!("cannot record swap completion: {err:?}");
                return Err(BootError::Fatal);
            }
        }

        if !self.validate_slot(Slot::Primary)? {
            error!("no bootable image in the primary slot");
            return Err(BootError::BadImage);
        }
        let header = self.read_header(Slot::Primary)?;
        if swap_type == SwapType::None {
            self.update_counter(&header)?;
        }
        info!("booting image {} from the primary slot", header.version);
        Ok(BootResponse {
            image_offset: self.map.primary.first_block * self.block_size,
            header,
        })
    }

    // ---- trailer plumbing ----

    fn slot_trailer(&self, slot: Slot) -> Trailer {
        Trailer::for_slot(self.map.slot(slot), self.block_size)
    }

    fn scratch_trailer(&self) -> Trailer {
        Trailer::for_scratch(self.map.scratch, self.block_size)
    }

    fn read_header(&mut self, slot: Slot) -> Result<ImageHeader, BootError<F::Error>> {
        let mut raw = [0u8; ImageHeader::LEN as usize];
        self.map
            .slot(slot)
            .read(&mut self.flash, 0, &mut raw)
            .map_err(BootError::Flash)?;
        Ok(ImageHeader::decode(&raw))
    }

    /// Resolves where an interrupted swap, if any, left off.
    fn read_status(&mut self) -> Result<BootStatus, BootError<F::Error>> {
        let primary_trailer = self.slot_trailer(Slot::Primary);
        let scratch_trailer = self.scratch_trailer();
        let primary = primary_trailer
            .read_state(&mut self.flash)
            .map_err(BootError::Flash)?;
        let scratch = scratch_trailer
            .read_state(&mut self.flash)
            .map_err(BootError::Flash)?;
        let trailer = match status_source(&primary, &scratch) {
            StatusSource::None => return Ok(BootStatus::fresh()),
            StatusSource::Primary => primary_trailer,
            StatusSource::Scratch => {
                debug!("swap status lives in the scratch trailer");
                scratch_trailer
            }
        };
        let mut bytes = vec![0u8; trailer.entries() as usize];
        trailer
            .read_status_bytes(&mut self.flash, &mut bytes)
            .map_err(BootError::Flash)?;
        let (steps, clean) = scan_status_bytes(&bytes);
        if !clean {
            warn!("status array has a hole, resuming from step {steps}");
        }
        let mut bs = BootStatus::from_steps(steps);
        if bs.in_progress() {
            let size = trailer
                .read_swap_size(&mut self.flash)
                .map_err(BootError::Flash)?;
            if size == 0 || size == u32::MAX {
                error!("in-flight trailer carries no swap size");
                return Err(BootError::StatusCorrupt);
            }
            bs.swap_size = size;
        }
        Ok(bs)
    }

    fn requested_swap_type(&mut self) -> Result<SwapType, BootError<F::Error>> {
        let primary = self
            .slot_trailer(Slot::Primary)
            .read_state(&mut self.flash)
            .map_err(BootError::Flash)?;
        let secondary = self
            .slot_trailer(Slot::Secondary)
            .read_state(&mut self.flash)
            .map_err(BootError::Flash)?;
        Ok(requested_swap(&primary, &secondary))
    }

    /// Requested swap, downgraded to `Fail` when the secondary image
    /// does not hold up. Unreadable secondary flash also degrades; the
    /// primary image must stay bootable no matter what the other slot
    /// does.
    fn validated_swap_type(&mut self) -> Result<SwapType, BootError<F::Error>> {
        let requested = self.requested_swap_type()?;
        if requested == SwapType::None {
            debug!("no swap requested");
            return Ok(SwapType::None);
        }
        let ok = match self.validate_slot(Slot::Secondary) {
            Ok(ok) => ok,
            Err(BootError::Flash(err)) => {
                warn!("secondary slot unreadable: {err:?}");
                false
            }
            Err(err) => return Err(err),
        };
        if !ok {
            warn!("{requested:?} swap refused, the secondary image does not validate");
            return Ok(SwapType::Fail);
        }
        Ok(requested)
    }

    // ---- validation ----

    /// Checks the image in `slot` end to end.
    ///
    /// A corrupt secondary image is erased so it can never be requested
    /// again; the primary slot is left alone since it may still be the
    /// best image available.
    fn validate_slot(&mut self, slot: Slot) -> Result<bool, BootError<F::Error>> {
        let header = self.read_header(slot)?;
        if header.is_erased() || !header.bootable() {
            debug!("{slot:?} slot holds no bootable image");
            return Ok(false);
        }
        let region = self.map.slot(slot);
        let capacity = region.len(self.block_size) - self.slot_trailer(slot).total_len();
        let shape_ok = header.magic_ok() && header.extent() <= capacity;
        let valid = shape_ok && self.payload_matches(&header, region)?;
        if !valid {
            error!("image in the {slot:?} slot failed validation");
            if slot == Slot::Secondary {
                region
                    .erase_blocks(&mut self.flash, 0, region.block_count)
                    .map_err(BootError::Flash)?;
            }
            return Ok(false);
        }
        Ok(true)
    }

    /// Streams the payload through the verifier one block at a time.
    fn payload_matches(
        &mut self,
        header: &ImageHeader,
        region: Region,
    ) -> Result<bool, BootError<F::Error>> {
        self.verifier.reset();
        let mut buf = vec![0u8; self.block_size as usize];
        let mut offset = header.header_len;
        let mut left = header.img_len;
        while left > 0 {
            let n = left.min(self.block_size) as usize;
            region
                .read(&mut self.flash, offset, &mut buf[..n])
                .map_err(BootError::Flash)?;
            self.verifier.absorb(&buf[..n]);
            offset += n as u32;
            left -= n as u32;
        }
        Ok(self.verifier.matches(header))
    }

    // ---- swap engine ----

    /// Swaps the slots, or finishes an interrupted swap.
    ///
    /// Block groups are sized to the scratch area and processed from
    /// the tail of the used range towards the slot start, so the group
    /// carrying the trailer is rewritten first and every later cycle
    /// appends to an already reinitialized status array.
    fn copy_image(&mut self, bs: &mut BootStatus) -> Result<(), BootError<F::Error>> {
        let capacity = self.map.primary.len(self.block_size)
            - self.slot_trailer(Slot::Primary).total_len();
        if bs.in_progress() {
            if bs.swap_size > capacity {
                error!("recorded swap size {} exceeds the slot", bs.swap_size);
                return Err(BootError::StatusCorrupt);
            }
            info!(
                "resuming swap of {} bytes at cycle {} step {}",
                bs.swap_size, bs.idx, bs.state
            );
        } else {
            let mut swap_size = 0u32;
            for slot in [Slot::Primary, Slot::Secondary] {
                let header = self.read_header(slot)?;
                if header.magic_ok() {
                    swap_size = swap_size.max(header.extent());
                }
            }
            if swap_size == 0 || swap_size > capacity {
                error!("swap size {swap_size} does not fit the slots");
                return Err(BootError::BadImage);
            }
            bs.swap_size = swap_size;
            info!("swapping {swap_size} bytes between the slots");
        }

        let used = bs.swap_size.div_ceil(self.block_size);
        let scratch_blocks = self.map.scratch.block_count;
        let mut last = used - 1;
        let mut swap_idx = 0u32;
        loop {
            let count = scratch_blocks.min(last + 1);
            let first = last + 1 - count;
            if swap_idx >= bs.idx {
                self.swap_cycle(first, count, bs)?;
            }
            if first == 0 {
                break;
            }
            last = first - 1;
            swap_idx += 1;
        }
        Ok(())
    }

    /// One sector-swap cycle over the group `[first, first + count)`,
    /// entered at whatever sub-step `bs` records.
    ///
    /// Sub-steps: 0 parks the secondary group in scratch, 1 moves the
    /// primary group into the secondary slot, 2 lands the parked group
    /// in the primary slot. The first cycle also rebuilds the status
    /// bookkeeping; when its group covers the trailer block the fresh
    /// trailer is staged in scratch and folded back during sub-step 2.
    fn swap_cycle(
        &mut self,
        first: u32,
        count: u32,
        bs: &mut BootStatus,
    ) -> Result<(), BootError<F::Error>> {
        let primary = self.map.primary;
        let secondary = self.map.secondary;
        let scratch = self.map.scratch;
        let slot_trailer = self.slot_trailer(Slot::Primary);
        let slot_len = primary.len(self.block_size);

        let group_off = first * self.block_size;
        let sz = count * self.block_size;
        let covers_trailer = group_off + sz > slot_len - self.block_size;
        let copy_len = if covers_trailer {
            sz - slot_trailer.total_len()
        } else {
            sz
        };
        bs.use_scratch = bs.idx == 0 && copy_len != sz;
        debug!(
            "cycle {}: blocks {first}..{} carry {copy_len} image bytes",
            bs.idx,
            first + count
        );

        if bs.state == 0 {
            scratch
                .erase_blocks(&mut self.flash, 0, scratch.block_count)
                .map_err(BootError::Flash)?;
            secondary
                .copy_to(&mut self.flash, group_off, scratch, 0, copy_len)
                .map_err(BootError::Flash)?;
            if bs.idx == 0 {
                if bs.use_scratch {
                    let target = self.scratch_trailer();
                    self.status_init(target, bs)?;
                } else {
                    primary
                        .erase_blocks(&mut self.flash, primary.block_count - 1, 1)
                        .map_err(BootError::Flash)?;
                    self.status_init(slot_trailer, bs)?;
                }
            }
            bs.state = 1;
            self.write_status(bs)?;
        }
        if bs.state == 1 {
            secondary
                .erase_blocks(&mut self.flash, first, count)
                .map_err(BootError::Flash)?;
            primary
                .copy_to(&mut self.flash, group_off, secondary, group_off, copy_len)
                .map_err(BootError::Flash)?;
            if bs.idx == 0 && !bs.use_scratch {
                secondary
                    .erase_blocks(&mut self.flash, secondary.block_count - 1, 1)
                    .map_err(BootError::Flash)?;
            }
            bs.state = 2;
            self.write_status(bs)?;
        }
        primary
            .erase_blocks(&mut self.flash, first, count)
            .map_err(BootError::Flash)?;
        scratch
            .copy_to(&mut self.flash, 0, primary, group_off, copy_len)
            .map_err(BootError::Flash)?;
        if bs.use_scratch {
            let scratch_trailer = self.scratch_trailer();
            scratch
                .copy_to(
                    &mut self.flash,
                    scratch_trailer.status_off(),
                    primary,
                    slot_trailer.status_off(),
                    STEPS_PER_CYCLE,
                )
                .map_err(BootError::Flash)?;
            let carried = scratch_trailer
                .read_state(&mut self.flash)
                .map_err(BootError::Flash)?;
            if carried.image_ok == FlagState::Set {
                slot_trailer
                    .write_image_ok(&mut self.flash)
                    .map_err(BootError::Flash)?;
            }
            slot_trailer
                .write_swap_size(&mut self.flash, bs.swap_size)
                .map_err(BootError::Flash)?;
            slot_trailer
                .write_magic(&mut self.flash)
                .map_err(BootError::Flash)?;
        }
        bs.idx += 1;
        bs.state = 0;
        bs.use_scratch = false;
        self.write_status(bs)
    }

    /// Seeds a fresh trailer before its first status byte: carries the
    /// pending request's image_ok forward, then writes swap size and
    /// magic so an interrupted resume can trust what it scans.
    fn status_init(&mut self, target: Trailer, bs: &BootStatus) -> Result<(), BootError<F::Error>> {
        let secondary = self
            .slot_trailer(Slot::Secondary)
            .read_state(&mut self.flash)
            .map_err(BootError::Flash)?;
        if secondary.image_ok == FlagState::Set {
            target
                .write_image_ok(&mut self.flash)
                .map_err(BootError::Flash)?;
        }
        target
            .write_swap_size(&mut self.flash, bs.swap_size)
            .map_err(BootError::Flash)?;
        target.write_magic(&mut self.flash).map_err(BootError::Flash)?;
        Ok(())
    }

    /// Programs the status byte for the sub-step that just completed.
    fn write_status(&mut self, bs: &BootStatus) -> Result<(), BootError<F::Error>> {
        let trailer = if bs.use_scratch {
            self.scratch_trailer()
        } else {
            self.slot_trailer(Slot::Primary)
        };
        trailer
            .write_status_byte(&mut self.flash, bs.completed_steps() - 1)
            .map_err(BootError::Flash)
    }

    // ---- counter ----

    fn update_counter(&mut self, header: &ImageHeader) -> Result<(), BootError<F::Error>> {
        self.counter.update(header.security_counter).map_err(|err| {
            error!(
                "security counter refused value {}: {err:?}",
                header.security_counter
            );
            BootError::Fatal
        })
    }
}

// ---- tests ----

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{build_image, Crc32Verifier, ImageVersion};
    use redoubt_flash::sim::SimFlash;

    fn version(build: u32) -> ImageVersion {
        ImageVersion {
            major: 1,
            minor: 0,
            revision: 0,
            build,
        }
    }

    /// Three regions on a 9-block device: two 4-block slots, 1 scratch.
    fn tiny_map() -> SlotMap {
        SlotMap::new(Region::new(0, 4), Region::new(4, 4), Region::new(8, 1))
    }

    fn boot(flash: SimFlash) -> Bootloader<SimFlash, Crc32Verifier, RamCounter> {
        Bootloader::new(flash, tiny_map(), Crc32Verifier::default(), RamCounter::new()).unwrap()
    }

    #[test]
    fn ram_counter_never_goes_down() {
        let mut counter = RamCounter::new();
        counter.update(7).unwrap();
        counter.update(3).unwrap();
        assert_eq!(counter.value(), 7);
        counter.update(9).unwrap();
        assert_eq!(counter.value(), 9);
    }

    #[test]
    fn boot_reports_the_primary_image() {
        let mut flash = SimFlash::new(512, 9);
        let image = build_image(version(7), 3, b"primary payload");
        Region::new(0, 4).write(&mut flash, 0, &image).unwrap();

        let mut boot = boot(flash);
        let response = boot.boot_go().unwrap();
        assert_eq!(response.image_offset, 0);
        assert_eq!(response.header.version.build, 7);
        // A plain boot feeds the counter from the running image.
        assert_eq!(boot.counter().value(), 3);
    }

    #[test]
    fn empty_device_has_no_bootable_image() {
        let mut boot = boot(SimFlash::new(512, 9));
        assert_eq!(boot.boot_go(), Err(BootError::BadImage));
    }

    #[test]
    fn overlapping_slots_are_rejected_up_front() {
        let map = SlotMap::new(Region::new(0, 4), Region::new(3, 4), Region::new(8, 1));
        let result = Bootloader::new(
            SimFlash::new(512, 9),
            map,
            Crc32Verifier::default(),
            RamCounter::new(),
        );
        assert!(matches!(result, Err(BootError::IncompatibleSlots)));
    }
}
