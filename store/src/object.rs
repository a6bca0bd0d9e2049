//! Uuid-addressed objects over the metadata journal.
//!
//! Space is reserved once at creation and objects never move between
//! blocks afterwards, except to close the gap left by a deleted
//! neighbour. In encrypted stores each payload is sealed whole under
//! its own envelope, with the owner uuid as associated data so a
//! ciphertext cannot be replayed into another slot.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use redoubt_flash::BlockFlash;

use crate::config::{StoreGeometry, FREE_UUID, LOGICAL_BLOCK0};
use crate::crypto::{build_nonce, Envelope, EnvelopeCipher, OBJECT_DOMAIN};
use crate::error::StoreError;
use crate::meta::layout::{BlockMeta, ObjectMeta};
use crate::meta::MetaStore;

/// Opaque reference to a stored object.
///
/// Valid from [`ObjectStore::create`] or [`ObjectStore::get_handle`]
/// until the object is deleted. A handle held across a delete is
/// detected and refused rather than reading whatever now occupies the
/// slot.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Handle(u32);

impl Handle {
    pub(crate) fn compose(uuid: u16, index: u16) -> Self {
        Self(u32::from(uuid) << 16 | u32::from(index))
    }

    pub(crate) fn uuid(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub(crate) fn index(self) -> u16 {
        self.0 as u16
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&self.uuid()).finish()
    }
}

/// Size attributes of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Bytes written so far.
    pub cur_size: u32,
    /// Bytes reserved at creation.
    pub max_size: u32,
}

/// Power-failure-safe object store.
pub struct ObjectStore<F>
where
    F: BlockFlash,
{
    meta: MetaStore<F>,
}

impl<F> ObjectStore<F>
where
    F: BlockFlash,
{
    pub fn new(
        flash: F,
        geo: StoreGeometry,
        cipher: Option<EnvelopeCipher>,
    ) -> Result<Self, StoreError<F::Error>> {
        Ok(Self {
            meta: MetaStore::new(flash, geo, cipher)?,
        })
    }

    /// Mounts the store from whatever the flash holds.
    pub fn prepare(&mut self) -> Result<(), StoreError<F::Error>> {
        self.meta.prepare()
    }

    /// Destroys all objects and commits an empty image.
    pub fn wipe_all(&mut self) -> Result<(), StoreError<F::Error>> {
        self.meta.wipe_all()
    }

    pub fn is_ready(&self) -> bool {
        self.meta.is_ready()
    }

    pub fn geometry(&self) -> StoreGeometry {
        self.meta.geometry()
    }

    pub fn metadata(&self) -> &MetaStore<F> {
        &self.meta
    }

    pub fn flash(&self) -> &F {
        self.meta.flash()
    }

    pub fn flash_mut(&mut self) -> &mut F {
        self.meta.flash_mut()
    }

    pub fn into_flash(self) -> F {
        self.meta.into_flash()
    }

    /// Creates an object with `max_size` bytes reserved for it.
    ///
    /// Fails with [`StoreError::StorageFull`] when no block has room or
    /// the object table is full, and with [`StoreError::InvalidParam`]
    /// when the uuid is zero or already present.
    pub fn create(&mut self, uuid: u16, max_size: u32) -> Result<Handle, StoreError<F::Error>> {
        self.meta.ensure_ready()?;
        if uuid == FREE_UUID || max_size == 0 {
            return Err(StoreError::InvalidParam);
        }

        let slots = self.geometry().object_slots;
        let mut free_index = None;
        for index in 0..slots {
            let meta = self.meta.read_object_meta(index)?;
            if meta.uuid == uuid {
                return Err(StoreError::InvalidParam);
            }
            if meta.is_free() && free_index.is_none() {
                free_index = Some(index);
            }
        }
        let index = free_index.ok_or(StoreError::StorageFull)?;
        let (object_meta, block_meta) = self.reserve(uuid, max_size)?;

        self.meta.begin_commit()?;
        let staged = self.stage_create(index, &object_meta, &block_meta);
        self.guard_commit(staged)?;
        Ok(Handle::compose(uuid, index))
    }

    /// Finds the handle for an existing object.
    pub fn get_handle(&mut self, uuid: u16) -> Result<Handle, StoreError<F::Error>> {
        self.meta.ensure_ready()?;
        if uuid == FREE_UUID {
            return Err(StoreError::InvalidParam);
        }
        for index in 0..self.geometry().object_slots {
            let meta = self.meta.read_object_meta(index)?;
            if meta.uuid == uuid {
                return Ok(Handle::compose(uuid, index));
            }
        }
        Err(StoreError::NotFound)
    }

    /// Reads `buf.len()` bytes starting `offset` bytes into the object.
    ///
    /// The whole requested range must lie inside the bytes written so
    /// far.
    pub fn read(
        &mut self,
        handle: Handle,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), StoreError<F::Error>> {
        self.meta.ensure_ready()?;
        let meta = self.object_meta_for(handle)?;

        let len = buf.len() as u32;
        if len == 0 {
            return Err(StoreError::InvalidParam);
        }
        let end = offset.checked_add(len).ok_or(StoreError::InvalidParam)?;
        if end > meta.cur_size {
            return Err(StoreError::InvalidParam);
        }

        if self.geometry().encrypted {
            let mut payload = self
                .meta
                .read_object_data(&meta, 0, meta.cur_size as usize)?;
            let aad = handle.uuid().to_le_bytes();
            self.meta.open_object(&meta.envelope, &aad, &mut payload)?;
            buf.copy_from_slice(&payload[offset as usize..end as usize]);
        } else {
            let data = self.meta.read_object_data(&meta, offset, buf.len())?;
            buf.copy_from_slice(&data);
        }
        Ok(())
    }

    /// Writes `data` at `offset`, growing the object's written size to
    /// at least `offset + data.len()`. Bytes outside the written range
    /// keep their previous content; the object never shrinks.
    pub fn write(
        &mut self,
        handle: Handle,
        offset: u32,
        data: &[u8],
    ) -> Result<(), StoreError<F::Error>> {
        self.meta.ensure_ready()?;
        let mut meta = self.object_meta_for(handle)?;

        let len = data.len() as u32;
        if len == 0 {
            return Err(StoreError::InvalidParam);
        }
        let end = offset.checked_add(len).ok_or(StoreError::InvalidParam)?;
        if end > meta.max_size {
            return Err(StoreError::InvalidParam);
        }
        let block_meta = self.meta.read_block_meta(meta.lblock)?;
        let new_size = meta.cur_size.max(end);

        // Assemble the staged bytes before opening the commit, so an
        // unreadable or inauthentic payload aborts with the store
        // intact.
        let (stage_offset, staged) = if self.geometry().encrypted {
            let mut payload = vec![0u8; new_size as usize];
            if meta.cur_size > 0 {
                let mut existing = self
                    .meta
                    .read_object_data(&meta, 0, meta.cur_size as usize)?;
                let aad = handle.uuid().to_le_bytes();
                self.meta.open_object(&meta.envelope, &aad, &mut existing)?;
                payload[..meta.cur_size as usize].copy_from_slice(&existing);
            }
            payload[offset as usize..end as usize].copy_from_slice(data);
            (meta.data_index, payload)
        } else {
            (meta.data_index + offset, data.to_vec())
        };

        let counter = self.meta.begin_commit()?;
        let staged = self.stage_write(handle, meta, block_meta, stage_offset, staged, counter, new_size);
        self.guard_commit(staged)
    }

    /// Deletes the object and compacts its block so the freed bytes are
    /// reusable immediately.
    pub fn delete(&mut self, handle: Handle) -> Result<(), StoreError<F::Error>> {
        self.meta.ensure_ready()?;
        let del = self.object_meta_for(handle)?;

        self.meta.begin_commit()?;
        let staged = self.stage_delete(handle.index(), del);
        self.guard_commit(staged)
    }

    /// Reports how much of the object is written and reserved.
    pub fn attributes(&mut self, handle: Handle) -> Result<ObjectInfo, StoreError<F::Error>> {
        self.meta.ensure_ready()?;
        let meta = self.object_meta_for(handle)?;
        Ok(ObjectInfo {
            cur_size: meta.cur_size,
            max_size: meta.max_size,
        })
    }

    /// Lists the occupied slots as `(uuid, info)` pairs.
    pub fn entries(&mut self) -> Result<Vec<(u16, ObjectInfo)>, StoreError<F::Error>> {
        self.meta.ensure_ready()?;
        let mut out = Vec::new();
        for index in 0..self.geometry().object_slots {
            let meta = self.meta.read_object_meta(index)?;
            if !meta.is_free() {
                out.push((
                    meta.uuid,
                    ObjectInfo {
                        cur_size: meta.cur_size,
                        max_size: meta.max_size,
                    },
                ));
            }
        }
        Ok(out)
    }

    /// Fresh metadata for the slot a handle points at, refusing handles
    /// whose slot was freed or recycled.
    fn object_meta_for(&mut self, handle: Handle) -> Result<ObjectMeta, StoreError<F::Error>> {
        let meta = self.meta.read_object_meta(handle.index())?;
        if meta.is_free() {
            return Err(StoreError::NotFound);
        }
        if meta.uuid != handle.uuid() {
            return Err(StoreError::StaleHandle);
        }
        Ok(meta)
    }

    /// First-fit reservation across the logical data blocks.
    fn reserve(
        &mut self,
        uuid: u16,
        size: u32,
    ) -> Result<(ObjectMeta, BlockMeta), StoreError<F::Error>> {
        for lblock in 0..self.geometry().logical_dblocks() {
            let mut block_meta = self.meta.read_block_meta(lblock)?;
            if block_meta.free_size >= size {
                let data_index = self.geometry().block_size - block_meta.free_size;
                block_meta.free_size -= size;
                let object_meta = ObjectMeta {
                    uuid,
                    lblock,
                    data_index,
                    cur_size: 0,
                    max_size: size,
                    envelope: Envelope::default(),
                };
                return Ok((object_meta, block_meta));
            }
        }
        Err(StoreError::StorageFull)
    }

    fn stage_create(
        &mut self,
        index: u16,
        object_meta: &ObjectMeta,
        block_meta: &BlockMeta,
    ) -> Result<(), StoreError<F::Error>> {
        self.meta.write_scratch_object_meta(index, object_meta)?;
        self.meta.write_scratch_block_meta(object_meta.lblock, block_meta)?;
        self.meta.copy_remaining_object_meta(index)?;
        self.meta.copy_remaining_block_meta(object_meta.lblock)?;
        self.meta.migrate_block0_data()?;
        self.meta.finalize_commit()
    }

    #[allow(clippy::too_many_arguments)]
    fn stage_write(
        &mut self,
        handle: Handle,
        mut meta: ObjectMeta,
        mut block_meta: BlockMeta,
        stage_offset: u32,
        mut staged: Vec<u8>,
        counter: u64,
        new_size: u32,
    ) -> Result<(), StoreError<F::Error>> {
        if self.geometry().encrypted {
            let iv = build_nonce(OBJECT_DOMAIN, counter);
            let aad = handle.uuid().to_le_bytes();
            let tag = self.meta.seal_object(&iv, &aad, &mut staged)?;
            meta.envelope = Envelope { iv, tag };
        }
        meta.cur_size = new_size;

        self.meta
            .dblock_update_scratch(meta.lblock, &block_meta, stage_offset, &staged)?;

        // The staged data block takes over from the live one.
        let old_phys = block_meta.phys_id;
        block_meta.phys_id = self.meta.data_scratch(meta.lblock);
        self.meta.set_data_scratch(old_phys, meta.lblock);

        self.meta.write_scratch_block_meta(meta.lblock, &block_meta)?;
        self.meta.write_scratch_object_meta(handle.index(), &meta)?;
        self.meta.copy_remaining_block_meta(meta.lblock)?;
        self.meta.copy_remaining_object_meta(handle.index())?;
        if meta.lblock != LOGICAL_BLOCK0 {
            self.meta.migrate_block0_data()?;
        }
        self.meta.finalize_commit()
    }

    fn stage_delete(&mut self, del_index: u16, del: ObjectMeta) -> Result<(), StoreError<F::Error>> {
        self.meta
            .write_scratch_object_meta(del_index, &ObjectMeta::default())?;

        // Slide every later object in the same block down over the gap.
        let mut src_offset = self.geometry().block_size;
        let mut bytes_to_move = 0u32;
        for index in 0..self.geometry().object_slots {
            if index == del_index {
                continue;
            }
            let mut meta = self.meta.read_object_meta(index)?;
            if !meta.is_free() && meta.lblock == del.lblock && meta.data_index > del.data_index {
                src_offset = src_offset.min(meta.data_index);
                meta.data_index -= del.max_size;
                bytes_to_move += meta.max_size;
            }
            self.meta.write_scratch_object_meta(index, &meta)?;
        }

        self.meta.compact_dblock(
            del.lblock,
            del.max_size,
            src_offset,
            del.data_index,
            bytes_to_move,
        )?;
        if del.lblock != LOGICAL_BLOCK0 {
            self.meta.migrate_block0_data()?;
        }
        self.meta.finalize_commit()
    }

    /// Converts failures inside the commit sequence into a fault that
    /// suspends the store until it is prepared again.
    fn guard_commit<T>(
        &mut self,
        result: Result<T, StoreError<F::Error>>,
    ) -> Result<T, StoreError<F::Error>> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                self.meta.suspend();
                Err(match err {
                    StoreError::Flash(inner) => StoreError::CommitFault(inner),
                    other => other,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redoubt_flash::sim::{SimError, SimFlash};

    fn geo(encrypted: bool) -> StoreGeometry {
        StoreGeometry {
            block_size: 512,
            block_count: 5,
            object_slots: 4,
            encrypted,
        }
    }

    fn store(encrypted: bool) -> ObjectStore<SimFlash> {
        let geo = geo(encrypted);
        let cipher = encrypted.then(|| EnvelopeCipher::chacha20_poly1305([9; 32]));
        let flash = SimFlash::new(geo.block_size, geo.block_count);
        let mut store = ObjectStore::new(flash, geo, cipher).unwrap();
        store.wipe_all().unwrap();
        store
    }

    #[test]
    fn create_write_read_round_trip() {
        for encrypted in [false, true] {
            let mut store = store(encrypted);
            let handle = store.create(5, 64).unwrap();

            store.write(handle, 0, b"DATA").unwrap();
            let mut buf = [0u8; 4];
            store.read(handle, 0, &mut buf).unwrap();
            assert_eq!(&buf, b"DATA");

            let info = store.attributes(handle).unwrap();
            assert_eq!(info.cur_size, 4);
            assert_eq!(info.max_size, 64);
        }
    }

    #[test]
    fn partial_overwrite_keeps_the_tail() {
        for encrypted in [false, true] {
            let mut store = store(encrypted);
            let handle = store.create(5, 16).unwrap();
            store.write(handle, 0, b"DATA").unwrap();

            // Shorter write at the front must not shrink the object.
            store.write(handle, 0, b"z").unwrap();
            assert_eq!(store.attributes(handle).unwrap().cur_size, 4);

            let mut buf = [0u8; 4];
            store.read(handle, 0, &mut buf).unwrap();
            assert_eq!(&buf, b"zATA");
        }
    }

    #[test]
    fn appends_extend_the_written_size() {
        let mut store = store(true);
        let handle = store.create(5, 16).unwrap();
        store.write(handle, 0, b"DATA").unwrap();
        store.write(handle, 4, b"56").unwrap();

        let mut buf = [0u8; 6];
        store.read(handle, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"DATA56");
    }

    #[test]
    fn reads_outside_the_written_range_fail() {
        let mut store = store(false);
        let handle = store.create(5, 16).unwrap();
        store.write(handle, 0, b"DATA").unwrap();

        let mut buf = [0u8; 2];
        assert_eq!(store.read(handle, 3, &mut buf), Err(StoreError::InvalidParam));
        assert_eq!(store.read(handle, 0, &mut []), Err(StoreError::InvalidParam));

        let mut tail = [0u8; 2];
        store.read(handle, 2, &mut tail).unwrap();
        assert_eq!(&tail, b"TA");
    }

    #[test]
    fn writes_are_bounded_by_the_reservation() {
        let mut store = store(false);
        let handle = store.create(5, 8).unwrap();
        assert_eq!(
            store.write(handle, 6, b"abc"),
            Err(StoreError::InvalidParam)
        );
        assert_eq!(store.write(handle, 0, &[]), Err(StoreError::InvalidParam));
        store.write(handle, 0, b"abcdefgh").unwrap();
    }

    #[test]
    fn uuids_are_unique_and_nonzero() {
        let mut store = store(false);
        store.create(5, 8).unwrap();
        assert_eq!(store.create(5, 8), Err(StoreError::InvalidParam));
        assert_eq!(store.create(0, 8), Err(StoreError::InvalidParam));
    }

    #[test]
    fn table_and_space_exhaustion_report_storage_full() {
        let mut store = store(false);
        for uuid in 1..=4 {
            store.create(uuid, 8).unwrap();
        }
        assert_eq!(store.create(9, 8), Err(StoreError::StorageFull));

        let mut store = self::store(false);
        assert_eq!(store.create(1, 4096), Err(StoreError::StorageFull));
    }

    #[test]
    fn deleted_then_recycled_slots_reject_old_handles() {
        let mut store = store(false);
        let first = store.create(7, 16).unwrap();
        store.create(8, 16).unwrap();

        store.delete(first).unwrap();
        assert_eq!(store.attributes(first), Err(StoreError::NotFound));

        // New asset lands in the freed slot; the old handle must not
        // reach it.
        store.create(9, 16).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(store.read(first, 0, &mut buf), Err(StoreError::StaleHandle));
        assert_eq!(store.delete(first), Err(StoreError::StaleHandle));
    }

    #[test]
    fn delete_compacts_the_shared_block() {
        for encrypted in [false, true] {
            let mut store = store(encrypted);
            let big = store.create(11, 48).unwrap();
            let small = store.create(12, 28).unwrap();
            store.write(big, 0, &[0xB5; 48]).unwrap();
            store.write(small, 0, &[0x5B; 28]).unwrap();

            store.delete(big).unwrap();

            let mut buf = [0u8; 28];
            store.read(small, 0, &mut buf).unwrap();
            assert_eq!(buf, [0x5B; 28]);

            // The freed bytes are usable right away.
            let again = store.create(11, 48).unwrap();
            store.write(again, 0, &[0xA1; 48]).unwrap();
            store.read(small, 0, &mut buf).unwrap();
            assert_eq!(buf, [0x5B; 28]);
        }
    }

    #[test]
    fn get_handle_finds_existing_objects_after_remount() {
        for encrypted in [false, true] {
            let geometry = geo(encrypted);
            let mut store = store(encrypted);
            let handle = store.create(5, 32).unwrap();
            store.write(handle, 0, b"persist me").unwrap();

            let cipher = encrypted.then(|| EnvelopeCipher::chacha20_poly1305([9; 32]));
            let mut remounted =
                ObjectStore::new(store.into_flash(), geometry, cipher).unwrap();
            remounted.prepare().unwrap();

            let handle = remounted.get_handle(5).unwrap();
            let mut buf = [0u8; 10];
            remounted.read(handle, 0, &mut buf).unwrap();
            assert_eq!(&buf, b"persist me");
            assert_eq!(remounted.get_handle(6), Err(StoreError::NotFound));
        }
    }

    #[test]
    fn sealed_payloads_never_hit_flash_in_the_clear() {
        let secret = b"rather secret payload";

        let mut sealed = store(true);
        let handle = sealed.create(5, 64).unwrap();
        sealed.write(handle, 0, secret).unwrap();
        let image = sealed.flash().image();
        assert!(!image.windows(secret.len()).any(|w| w == secret));

        let mut plain = store(false);
        let handle = plain.create(5, 64).unwrap();
        plain.write(handle, 0, secret).unwrap();
        let image = plain.flash().image();
        assert!(image.windows(secret.len()).any(|w| w == secret));
    }

    #[test]
    fn commit_fault_suspends_the_store_until_prepared() {
        let mut store = store(true);
        let handle = store.create(5, 16).unwrap();
        store.write(handle, 0, b"ok").unwrap();

        store.flash_mut().set_budget(0);
        assert_eq!(
            store.write(handle, 0, b"no"),
            Err(StoreError::CommitFault(SimError::PowerCut))
        );
        assert!(!store.is_ready());

        let mut buf = [0u8; 2];
        assert_eq!(store.read(handle, 0, &mut buf), Err(StoreError::NotReady));

        store.flash_mut().clear_budget();
        store.prepare().unwrap();
        store.read(handle, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[test]
    fn entries_lists_live_objects() {
        let mut store = store(false);
        store.create(3, 8).unwrap();
        let gone = store.create(4, 8).unwrap();
        store.delete(gone).unwrap();
        store.create(6, 24).unwrap();

        let entries = store.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, 3);
        assert_eq!(entries[1].0, 6);
        assert_eq!(entries[1].1.max_size, 24);
    }
}
