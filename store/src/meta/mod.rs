//! Two-block metadata journal.
//!
//! The metadata image describing every object lives twice in flash, in
//! physical blocks 0 and 1. At any time one copy is active and the
//! other is scratch. A mutation stages the next image in the scratch
//! block, stages object data in the scratch data block, and then
//! commits by writing the scratch header. The last bytes of that header
//! write are the commit point: the swap count byte in plaintext stores,
//! the envelope in encrypted ones. Until they land, recovery keeps
//! selecting the previous image.

pub mod layout;

use alloc::vec;
use alloc::vec::Vec;

use log::{debug, info, warn};
use redoubt_flash::BlockFlash;

use crate::config::{
    other_metablock, StoreGeometry, BLOCK_META_LEN, FS_VERSION, LOGICAL_BLOCK0, METADATA_BLOCK0,
    METADATA_BLOCK1, OBJECT_META_PLAIN_LEN,
};
use crate::crypto::{build_nonce, Envelope, EnvelopeCipher, METADATA_DOMAIN};
use crate::error::StoreError;
use layout::{latest_metablock, next_swap_count, BlockMeta, MetaHeader, ObjectMeta};

const HEADER_MAX_LEN: usize = Envelope::LEN + 6;
const OBJECT_META_MAX_LEN: usize = OBJECT_META_PLAIN_LEN as usize + Envelope::LEN;

/// Journalled metadata over a block flash.
///
/// All table reads come from the active metadata block; all staged
/// writes go to the scratch block. [`MetaStore::finalize_commit`] flips
/// the roles.
pub struct MetaStore<F>
where
    F: BlockFlash,
{
    flash: F,
    geo: StoreGeometry,
    cipher: Option<EnvelopeCipher>,
    header: MetaHeader,
    active: u32,
    counter: u64,
    ready: bool,
}

impl<F> MetaStore<F>
where
    F: BlockFlash,
{
    /// Binds a flash region to a geometry.
    ///
    /// The store starts unmounted; call [`MetaStore::prepare`] to
    /// recover an existing image or [`MetaStore::wipe_all`] to build a
    /// fresh one. Encrypted geometries require a cipher, plaintext ones
    /// reject it.
    pub fn new(
        flash: F,
        geo: StoreGeometry,
        cipher: Option<EnvelopeCipher>,
    ) -> Result<Self, StoreError<F::Error>> {
        if !geo.is_valid() || geo.encrypted != cipher.is_some() {
            return Err(StoreError::InvalidParam);
        }
        if flash.block_size() != geo.block_size || flash.block_count() < geo.block_count {
            return Err(StoreError::InvalidParam);
        }
        Ok(Self {
            flash,
            geo,
            cipher,
            header: MetaHeader::default(),
            active: METADATA_BLOCK0,
            counter: 0,
            ready: false,
        })
    }

    pub fn geometry(&self) -> StoreGeometry {
        self.geo
    }

    pub fn header(&self) -> &MetaHeader {
        &self.header
    }

    pub fn active_metablock(&self) -> u32 {
        self.active
    }

    pub fn commit_counter(&self) -> u64 {
        self.counter
    }

    pub fn is_ready(&self) -> bool {
        self.ready
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

    pub(crate) fn ensure_ready(&self) -> Result<(), StoreError<F::Error>> {
        if self.ready {
            Ok(())
        } else {
            Err(StoreError::NotReady)
        }
    }

    /// Marks the store unusable until the next successful `prepare`.
    pub(crate) fn suspend(&mut self) {
        self.ready = false;
    }

    /// Mounts the store by recovering the newest authentic metadata
    /// image and erasing the scratch blocks left over from whatever
    /// happened before.
    pub fn prepare(&mut self) -> Result<(), StoreError<F::Error>> {
        self.ready = false;
        let (active, header) = self.select_active()?;
        self.active = active;
        self.header = header;
        if self.geo.encrypted {
            // A counter value consumed by a failed commit stays burned
            // for the rest of this session.
            self.counter = self.counter.max(header.envelope.counter());
        }
        self.erase_scratch_blocks()?;
        self.ready = true;
        info!(
            "mounted metadata block {active}, swap count {}",
            header.swap_count
        );
        Ok(())
    }

    fn select_active(&mut self) -> Result<(u32, MetaHeader), StoreError<F::Error>> {
        let header0 = self.read_header_from(METADATA_BLOCK0)?;
        let header1 = self.read_header_from(METADATA_BLOCK1)?;

        let mut candidates = [METADATA_BLOCK0; 2];
        let count = match (header0.is_valid(), header1.is_valid()) {
            (false, false) => 0,
            (true, false) => 1,
            (false, true) => {
                candidates[0] = METADATA_BLOCK1;
                1
            }
            (true, true) => {
                let latest = latest_metablock(header0.swap_count, header1.swap_count);
                candidates = [latest, other_metablock(latest)];
                2
            }
        };

        for &phys in &candidates[..count] {
            if self.geo.encrypted {
                match self.authenticate_metablock(phys) {
                    Ok(()) => {}
                    Err(StoreError::Authentication) => {
                        warn!("metadata block {phys} failed authentication");
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }
            let header = if phys == METADATA_BLOCK0 {
                header0
            } else {
                header1
            };
            return Ok((phys, header));
        }
        Err(StoreError::Corrupt)
    }

    fn authenticate_metablock(&mut self, phys: u32) -> Result<(), StoreError<F::Error>> {
        let header = self.read_header_from(phys)?;
        let auth_off = self.geo.auth_off();
        let auth_len = (self.geo.metadata_size() - auth_off) as usize;
        let region = self.read_exact(phys, auth_off, auth_len)?;
        match self.cipher.as_ref() {
            Some(cipher) => cipher
                .verify_mac(&header.envelope.iv, &region, &header.envelope.tag)
                .map_err(|_| StoreError::Authentication),
            None => Ok(()),
        }
    }

    /// Erases both metadata blocks and commits a pristine image.
    ///
    /// The active block is erased last so that an interruption before
    /// the new image lands cannot resurrect the old one.
    pub fn wipe_all(&mut self) -> Result<(), StoreError<F::Error>> {
        self.ready = false;

        let erase_first = match self.select_active() {
            Ok((active, _)) => other_metablock(active),
            Err(StoreError::Corrupt) => METADATA_BLOCK0,
            Err(err) => return Err(err),
        };
        self.erase(erase_first)?;
        self.erase(other_metablock(erase_first))?;

        self.header = MetaHeader {
            envelope: Envelope::default(),
            scratch_dblock: self.geo.initial_scratch_dblock(),
            fs_version: FS_VERSION,
            swap_count: 0,
        };
        self.active = METADATA_BLOCK0;
        if self.geo.encrypted {
            self.counter = self
                .counter
                .checked_add(1)
                .ok_or(StoreError::NonceExhausted)?;
        }

        // Logical block 0 shares its physical block with the metadata.
        let mut block_meta = BlockMeta {
            phys_id: METADATA_BLOCK0,
            data_start: self.geo.metadata_size(),
            free_size: self.geo.block0_capacity(),
        };
        self.write_scratch_block_meta(LOGICAL_BLOCK0, &block_meta)?;

        block_meta.data_start = 0;
        block_meta.free_size = self.geo.block_size;
        for k in 0..self.geo.dedicated_dblocks() {
            let phys = self.geo.first_dedicated_phys() + k;
            self.erase(phys)?;
            block_meta.phys_id = phys;
            self.write_scratch_block_meta(k + 1, &block_meta)?;
        }

        for index in 0..self.geo.object_slots {
            self.write_scratch_object_meta(index, &ObjectMeta::default())?;
        }

        self.finalize_commit()?;
        self.ready = true;
        info!("store wiped, fresh image committed");
        Ok(())
    }

    // ---- active image reads ----

    pub(crate) fn read_block_meta(&mut self, lblock: u32) -> Result<BlockMeta, StoreError<F::Error>> {
        if lblock >= self.geo.logical_dblocks() {
            return Err(StoreError::InvalidParam);
        }
        let off = self.geo.block_meta_off(lblock);
        let raw = self.read_exact(self.active, off, BLOCK_META_LEN as usize)?;
        Ok(BlockMeta::decode(&raw))
    }

    pub(crate) fn read_object_meta(&mut self, index: u16) -> Result<ObjectMeta, StoreError<F::Error>> {
        if index >= self.geo.object_slots {
            return Err(StoreError::InvalidParam);
        }
        let off = self.geo.object_meta_off(index);
        let len = self.geo.object_meta_len() as usize;
        let raw = self.read_exact(self.active, off, len)?;
        Ok(ObjectMeta::decode(&self.geo, &raw))
    }

    /// Reads `len` payload bytes of an object starting `offset` bytes
    /// into it.
    pub(crate) fn read_object_data(
        &mut self,
        meta: &ObjectMeta,
        offset: u32,
        len: usize,
    ) -> Result<Vec<u8>, StoreError<F::Error>> {
        let block_meta = self.read_block_meta(meta.lblock)?;
        self.read_exact(block_meta.phys_id, meta.data_index + offset, len)
    }

    // ---- scratch staging ----

    pub(crate) fn scratch_metablock(&self) -> u32 {
        other_metablock(self.active)
    }

    /// Physical block that stages data for `lblock`.
    ///
    /// Logical block 0 data rides along with the metadata image, so its
    /// scratch is the scratch metadata block.
    pub(crate) fn data_scratch(&self, lblock: u32) -> u32 {
        if lblock == LOGICAL_BLOCK0 {
            self.scratch_metablock()
        } else {
            self.header.scratch_dblock
        }
    }

    /// Records `phys` as the next data scratch block.
    ///
    /// No-op for logical block 0: its backing block is always the
    /// metadata pair.
    pub(crate) fn set_data_scratch(&mut self, phys: u32, lblock: u32) {
        if lblock != LOGICAL_BLOCK0 {
            self.header.scratch_dblock = phys;
        }
    }

    pub(crate) fn write_scratch_block_meta(
        &mut self,
        lblock: u32,
        meta: &BlockMeta,
    ) -> Result<(), StoreError<F::Error>> {
        let scratch = self.scratch_metablock();
        let mut fixed = *meta;
        if lblock == LOGICAL_BLOCK0 {
            // After the commit swap, block 0 data lives in what is
            // currently the scratch metadata block.
            fixed.phys_id = scratch;
        }
        let mut raw = [0u8; BLOCK_META_LEN as usize];
        fixed.encode_into(&mut raw);
        let off = self.geo.block_meta_off(lblock);
        self.write(scratch, off, &raw)
    }

    pub(crate) fn write_scratch_object_meta(
        &mut self,
        index: u16,
        meta: &ObjectMeta,
    ) -> Result<(), StoreError<F::Error>> {
        if index >= self.geo.object_slots {
            return Err(StoreError::InvalidParam);
        }
        let scratch = self.scratch_metablock();
        let len = self.geo.object_meta_len() as usize;
        let mut raw = [0u8; OBJECT_META_MAX_LEN];
        meta.encode_into(&self.geo, &mut raw[..len]);
        let off = self.geo.object_meta_off(index);
        self.write(scratch, off, &raw[..len])
    }

    /// Copies every object table entry except `skip` from the active
    /// image to the scratch image.
    pub(crate) fn copy_remaining_object_meta(
        &mut self,
        skip: u16,
    ) -> Result<(), StoreError<F::Error>> {
        let scratch = self.scratch_metablock();
        let active = self.active;
        let table = self.geo.object_table_off();
        let skip_off = self.geo.object_meta_off(skip);
        let skip_end = skip_off + self.geo.object_meta_len();
        let table_end = self.geo.metadata_size();

        if skip_off > table {
            self.move_range(scratch, table, active, table, skip_off - table)?;
        }
        if table_end > skip_end {
            self.move_range(scratch, skip_end, active, skip_end, table_end - skip_end)?;
        }
        Ok(())
    }

    /// Copies every block table entry except `skip` from the active
    /// image to the scratch image, re-pointing logical block 0 at its
    /// new home.
    pub(crate) fn copy_remaining_block_meta(
        &mut self,
        skip: u32,
    ) -> Result<(), StoreError<F::Error>> {
        for lblock in 0..self.geo.logical_dblocks() {
            if lblock == skip {
                continue;
            }
            let meta = self.read_block_meta(lblock)?;
            self.write_scratch_block_meta(lblock, &meta)?;
        }
        Ok(())
    }

    /// Carries the logical block 0 data region into the scratch
    /// metadata block.
    ///
    /// Needed whenever a commit does not itself restage block 0 data:
    /// the metadata swap moves block 0 to a new physical block, and the
    /// payloads have to come along.
    pub(crate) fn migrate_block0_data(&mut self) -> Result<(), StoreError<F::Error>> {
        let block_meta = self.read_block_meta(LOGICAL_BLOCK0)?;
        let data_size = self.geo.block_size - block_meta.data_start - block_meta.free_size;
        if data_size == 0 {
            return Ok(());
        }
        let scratch = self.scratch_metablock();
        let active = self.active;
        self.move_range(
            scratch,
            block_meta.data_start,
            active,
            block_meta.data_start,
            data_size,
        )
    }

    /// Stages one data block in its scratch block with `data` replacing
    /// the bytes at absolute offset `offset`.
    ///
    /// The regions before and after the replacement are carried over
    /// from the live physical block.
    pub(crate) fn dblock_update_scratch(
        &mut self,
        lblock: u32,
        block_meta: &BlockMeta,
        offset: u32,
        data: &[u8],
    ) -> Result<(), StoreError<F::Error>> {
        let scratch = self.data_scratch(lblock);
        let phys = block_meta.phys_id;
        let end = offset + data.len() as u32;
        let used_end = self.geo.block_size - block_meta.free_size;

        self.write(scratch, offset, data)?;
        if offset > block_meta.data_start {
            self.move_range(
                scratch,
                block_meta.data_start,
                phys,
                block_meta.data_start,
                offset - block_meta.data_start,
            )?;
        }
        if used_end > end {
            self.move_range(scratch, end, phys, end, used_end - end)?;
        }
        Ok(())
    }

    /// Rebuilds `lblock` in its scratch block with `freed` bytes
    /// reclaimed and the surviving tail objects moved down to close the
    /// gap.
    ///
    /// The physical blocks swap roles even when nothing moves, so the
    /// deleted bytes disappear with the old block's erase.
    pub(crate) fn compact_dblock(
        &mut self,
        lblock: u32,
        freed: u32,
        src_offset: u32,
        dst_offset: u32,
        bytes: u32,
    ) -> Result<(), StoreError<F::Error>> {
        let mut block_meta = self.read_block_meta(lblock)?;
        let scratch = self.data_scratch(lblock);
        let phys = block_meta.phys_id;

        block_meta.free_size += freed;
        if bytes > 0 {
            self.move_range(scratch, dst_offset, phys, src_offset, bytes)?;
        }
        if dst_offset > block_meta.data_start {
            self.move_range(
                scratch,
                block_meta.data_start,
                phys,
                block_meta.data_start,
                dst_offset - block_meta.data_start,
            )?;
        }

        block_meta.phys_id = scratch;
        self.set_data_scratch(phys, lblock);
        self.write_scratch_block_meta(lblock, &block_meta)?;
        self.copy_remaining_block_meta(lblock)
    }

    // ---- commit ----

    /// Opens a mutation and reserves its commit counter value.
    ///
    /// Object envelopes sealed during the mutation use this value; the
    /// header envelope written by [`MetaStore::finalize_commit`] uses
    /// it too, in its own domain.
    pub(crate) fn begin_commit(&mut self) -> Result<u64, StoreError<F::Error>> {
        self.ensure_ready()?;
        if self.geo.encrypted {
            self.counter = self
                .counter
                .checked_add(1)
                .ok_or(StoreError::NonceExhausted)?;
        }
        Ok(self.counter)
    }

    /// Commits the staged image and erases the blocks released by the
    /// swap.
    pub(crate) fn finalize_commit(&mut self) -> Result<(), StoreError<F::Error>> {
        let scratch = self.scratch_metablock();
        self.header.swap_count = next_swap_count(self.header.swap_count);

        let header_len = self.geo.header_len() as usize;
        let mut raw = [0u8; HEADER_MAX_LEN];

        if self.geo.encrypted {
            let iv = build_nonce(METADATA_DOMAIN, self.counter);
            self.header.envelope.iv = iv;
            self.header.encode_into(&self.geo, &mut raw[..header_len]);

            // Stage the readable header fields, then seal everything
            // from there to the end of the tables as it now stands in
            // the scratch block.
            let auth_off = self.geo.auth_off();
            self.write(scratch, auth_off, &raw[auth_off as usize..header_len])?;
            let auth_len = (self.geo.metadata_size() - auth_off) as usize;
            let region = self.read_exact(scratch, auth_off, auth_len)?;
            self.header.envelope.tag = self.metadata_tag(&iv, &region)?;

            // The envelope write is the commit point.
            let mut env_raw = [0u8; Envelope::LEN];
            self.header.envelope.encode_into(&mut env_raw);
            self.write(scratch, 0, &env_raw)?;
        } else {
            self.header.encode_into(&self.geo, &mut raw[..header_len]);
            let swap_off = self.geo.swap_count_off() as usize;

            // The swap count byte decides which image is newer, so it
            // goes down last.
            self.write(scratch, 0, &raw[..swap_off])?;
            self.write(scratch, swap_off as u32, &raw[swap_off..swap_off + 1])?;
        }

        self.active = scratch;
        self.erase_scratch_blocks()?;
        debug!("committed metadata image, swap count {}", self.header.swap_count);
        Ok(())
    }

    fn metadata_tag(
        &self,
        iv: &[u8; 12],
        region: &[u8],
    ) -> Result<[u8; 16], StoreError<F::Error>> {
        let cipher = self.cipher.as_ref().ok_or(StoreError::NotReady)?;
        cipher
            .mac(iv, region)
            .map_err(|_| StoreError::Authentication)
    }

    /// Seals an object payload in place for this commit.
    pub(crate) fn seal_object(
        &self,
        iv: &[u8; 12],
        aad: &[u8],
        buf: &mut [u8],
    ) -> Result<[u8; 16], StoreError<F::Error>> {
        let cipher = self.cipher.as_ref().ok_or(StoreError::NotReady)?;
        cipher
            .seal_detached(iv, aad, buf)
            .map_err(|_| StoreError::Authentication)
    }

    /// Opens an object payload in place.
    pub(crate) fn open_object(
        &self,
        envelope: &Envelope,
        aad: &[u8],
        buf: &mut [u8],
    ) -> Result<(), StoreError<F::Error>> {
        let cipher = self.cipher.as_ref().ok_or(StoreError::NotReady)?;
        cipher
            .open_detached(&envelope.iv, aad, buf, &envelope.tag)
            .map_err(|_| StoreError::Authentication)
    }

    fn erase_scratch_blocks(&mut self) -> Result<(), StoreError<F::Error>> {
        let meta_scratch = self.scratch_metablock();
        self.erase(meta_scratch)?;
        let data_scratch = self.header.scratch_dblock;
        if data_scratch != meta_scratch {
            self.erase(data_scratch)?;
        }
        Ok(())
    }

    // ---- flash access ----

    fn read_header_from(&mut self, phys: u32) -> Result<MetaHeader, StoreError<F::Error>> {
        let len = self.geo.header_len() as usize;
        let raw = self.read_exact(phys, 0, len)?;
        Ok(MetaHeader::decode(&self.geo, &raw))
    }

    fn read_exact(
        &mut self,
        block: u32,
        offset: u32,
        len: usize,
    ) -> Result<Vec<u8>, StoreError<F::Error>> {
        let mut buf = vec![0u8; len];
        self.flash
            .read(block, offset, &mut buf)
            .map_err(StoreError::Flash)?;
        Ok(buf)
    }

    fn write(&mut self, block: u32, offset: u32, data: &[u8]) -> Result<(), StoreError<F::Error>> {
        self.flash
            .write(block, offset, data)
            .map_err(StoreError::Flash)
    }

    fn erase(&mut self, block: u32) -> Result<(), StoreError<F::Error>> {
        self.flash.erase(block).map_err(StoreError::Flash)
    }

    fn move_range(
        &mut self,
        dst_block: u32,
        dst_offset: u32,
        src_block: u32,
        src_offset: u32,
        len: u32,
    ) -> Result<(), StoreError<F::Error>> {
        self.flash
            .move_range(dst_block, dst_offset, src_block, src_offset, len)
            .map_err(StoreError::Flash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redoubt_flash::sim::SimFlash;

    fn plain_geo() -> StoreGeometry {
        StoreGeometry {
            block_size: 512,
            block_count: 5,
            object_slots: 4,
            encrypted: false,
        }
    }

    fn sealed_geo() -> StoreGeometry {
        StoreGeometry {
            block_size: 512,
            block_count: 5,
            object_slots: 4,
            encrypted: true,
        }
    }

    fn plain_store() -> MetaStore<SimFlash> {
        let geo = plain_geo();
        MetaStore::new(SimFlash::new(geo.block_size, geo.block_count), geo, None).unwrap()
    }

    fn sealed_store() -> MetaStore<SimFlash> {
        let geo = sealed_geo();
        let cipher = EnvelopeCipher::chacha20_poly1305([7; 32]);
        MetaStore::new(
            SimFlash::new(geo.block_size, geo.block_count),
            geo,
            Some(cipher),
        )
        .unwrap()
    }

    /// Stages a commit that changes nothing, the smallest full pass
    /// through the journal.
    fn noop_commit(store: &mut MetaStore<SimFlash>) {
        store.begin_commit().unwrap();
        let meta = store.read_object_meta(0).unwrap();
        store.write_scratch_object_meta(0, &meta).unwrap();
        store.copy_remaining_object_meta(0).unwrap();
        store.copy_remaining_block_meta(u32::MAX).unwrap();
        store.migrate_block0_data().unwrap();
        store.finalize_commit().unwrap();
    }

    #[test]
    fn prepare_on_erased_flash_reports_corrupt() {
        let mut store = plain_store();
        assert_eq!(store.prepare(), Err(StoreError::Corrupt));
        assert!(!store.is_ready());
    }

    #[test]
    fn geometry_and_cipher_must_agree() {
        let geo = sealed_geo();
        let flash = SimFlash::new(geo.block_size, geo.block_count);
        assert!(MetaStore::new(flash, geo, None).is_err());

        let geo = plain_geo();
        let flash = SimFlash::new(geo.block_size, geo.block_count);
        let cipher = EnvelopeCipher::aes256_gcm([1; 32]);
        assert!(MetaStore::new(flash, geo, Some(cipher)).is_err());
    }

    #[test]
    fn wipe_builds_a_mountable_image() {
        let mut store = plain_store();
        store.wipe_all().unwrap();
        assert!(store.is_ready());
        assert_eq!(store.active_metablock(), METADATA_BLOCK1);
        assert_eq!(store.header().swap_count, 1);

        let block0 = store.read_block_meta(LOGICAL_BLOCK0).unwrap();
        assert_eq!(block0.phys_id, METADATA_BLOCK1);
        assert_eq!(block0.data_start, plain_geo().metadata_size());
        assert_eq!(block0.free_size, plain_geo().block0_capacity());

        let block1 = store.read_block_meta(1).unwrap();
        assert_eq!(block1.phys_id, 3);
        assert_eq!(block1.free_size, 512);

        for index in 0..plain_geo().object_slots {
            assert!(store.read_object_meta(index).unwrap().is_free());
        }

        // A fresh mount of the same image lands on the same block.
        store.prepare().unwrap();
        assert_eq!(store.active_metablock(), METADATA_BLOCK1);
    }

    #[test]
    fn commits_alternate_between_the_metadata_blocks() {
        let mut store = plain_store();
        store.wipe_all().unwrap();
        assert_eq!(store.active_metablock(), METADATA_BLOCK1);

        noop_commit(&mut store);
        assert_eq!(store.active_metablock(), METADATA_BLOCK0);
        assert_eq!(store.header().swap_count, 2);

        noop_commit(&mut store);
        assert_eq!(store.active_metablock(), METADATA_BLOCK1);
        assert_eq!(store.header().swap_count, 3);
    }

    #[test]
    fn swap_count_wraps_past_the_erased_value() {
        let mut store = plain_store();
        store.wipe_all().unwrap();
        store.header.swap_count = 0xFE;

        noop_commit(&mut store);
        assert_eq!(store.header().swap_count, 0);

        store.prepare().unwrap();
        assert_eq!(store.header().swap_count, 0);
    }

    /// Rewrites `block` with its content from `snapshot`, undoing the
    /// erase that followed a commit.
    fn restore_block(store: &mut MetaStore<SimFlash>, snapshot: &SimFlash, block: u32) {
        let geo = store.geometry();
        let image = snapshot.image();
        let start = (block * geo.block_size) as usize;
        let bytes = &image[start..start + geo.block_size as usize];
        store.flash_mut().write(block, 0, bytes).unwrap();
    }

    #[test]
    fn sealed_store_recovers_its_commit_counter() {
        let mut store = sealed_store();
        store.wipe_all().unwrap();
        assert_eq!(store.commit_counter(), 1);
        noop_commit(&mut store);
        assert_eq!(store.commit_counter(), 2);

        let geo = store.geometry();
        let image = store.flash().clone();
        let mut remounted =
            MetaStore::new(image, geo, Some(EnvelopeCipher::chacha20_poly1305([7; 32]))).unwrap();
        remounted.prepare().unwrap();
        assert_eq!(remounted.commit_counter(), 2);
    }

    #[test]
    fn tampered_active_block_falls_back_to_the_previous_image() {
        let mut store = sealed_store();
        store.wipe_all().unwrap();
        let before = store.flash().clone();
        noop_commit(&mut store);
        assert_eq!(store.active_metablock(), METADATA_BLOCK0);

        // Put the pre-commit image back, as if power had been lost
        // right before the commit erased it, then flip a byte inside
        // the authenticated table region of the newer block.
        restore_block(&mut store, &before, METADATA_BLOCK1);
        let off = store.geometry().object_table_off();
        store.flash_mut().write(METADATA_BLOCK0, off, &[0xA5]).unwrap();

        store.prepare().unwrap();
        assert_eq!(store.active_metablock(), METADATA_BLOCK1);
    }

    #[test]
    fn tampering_both_blocks_is_unrecoverable() {
        let mut store = sealed_store();
        store.wipe_all().unwrap();
        let before = store.flash().clone();
        noop_commit(&mut store);
        restore_block(&mut store, &before, METADATA_BLOCK1);

        let off = store.geometry().object_table_off();
        store.flash_mut().write(METADATA_BLOCK0, off, &[0xA5]).unwrap();
        store.flash_mut().write(METADATA_BLOCK1, off, &[0xA5]).unwrap();

        assert_eq!(store.prepare(), Err(StoreError::Corrupt));
    }

    #[test]
    fn mutations_require_a_mounted_store() {
        let mut store = plain_store();
        assert_eq!(store.begin_commit().unwrap_err(), StoreError::NotReady);

        store.wipe_all().unwrap();
        store.suspend();
        assert_eq!(store.begin_commit().unwrap_err(), StoreError::NotReady);
    }
}
