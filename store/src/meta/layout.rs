//! On-flash encoding of the metadata image.
//!
//! All integers are little-endian. The header leads the image, followed
//! by one block table entry per logical data block and one object table
//! entry per slot. In encrypted stores the header starts with its
//! envelope and every object entry ends with the envelope sealing that
//! object's payload.

use crate::config::{
    StoreGeometry, BLOCK_META_LEN, FREE_UUID, FS_VERSION, INVALID_SWAP_COUNT, METADATA_BLOCK0,
    METADATA_BLOCK1, OBJECT_META_PLAIN_LEN,
};
use crate::crypto::Envelope;

/// Advances a swap count, skipping the erased-flash value.
pub fn next_swap_count(count: u8) -> u8 {
    let next = count.wrapping_add(1);
    if next == INVALID_SWAP_COUNT {
        0
    } else {
        next
    }
}

/// Picks the more recently committed of two valid metadata blocks.
///
/// Swap counts wrap through zero, so "larger" is not enough on its own:
/// a zero right after a non-one value is the younger of the pair.
pub fn latest_metablock(count0: u8, count1: u8) -> u32 {
    if count1 == 0 && count0 != 1 {
        METADATA_BLOCK1
    } else if count0 == 0 && count1 != 1 {
        METADATA_BLOCK0
    } else if count1 > count0 {
        METADATA_BLOCK1
    } else {
        METADATA_BLOCK0
    }
}

/// Metadata block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetaHeader {
    /// Envelope authenticating the metadata image. Unused in plaintext
    /// stores.
    pub envelope: Envelope,
    /// Physical id of the current data scratch block.
    pub scratch_dblock: u32,
    pub fs_version: u8,
    pub swap_count: u8,
}

impl MetaHeader {
    /// Whether the header belongs to a fully committed image.
    ///
    /// An erased swap count means the commit never finished; the other
    /// metadata block holds the authoritative image.
    pub fn is_valid(&self) -> bool {
        self.fs_version == FS_VERSION && self.swap_count != INVALID_SWAP_COUNT
    }

    pub fn encode_into(&self, geo: &StoreGeometry, out: &mut [u8]) {
        if geo.encrypted {
            self.envelope.encode_into(out);
        }
        let base = geo.scratch_dblock_off() as usize;
        out[base..base + 4].copy_from_slice(&self.scratch_dblock.to_le_bytes());
        out[geo.fs_version_off() as usize] = self.fs_version;
        out[geo.swap_count_off() as usize] = self.swap_count;
    }

    pub fn decode(geo: &StoreGeometry, bytes: &[u8]) -> Self {
        let mut header = MetaHeader::default();
        if geo.encrypted {
            header.envelope = Envelope::decode(bytes);
        }
        let base = geo.scratch_dblock_off() as usize;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[base..base + 4]);
        header.scratch_dblock = u32::from_le_bytes(raw);
        header.fs_version = bytes[geo.fs_version_off() as usize];
        header.swap_count = bytes[geo.swap_count_off() as usize];
        header
    }
}

/// Block table entry: where one logical data block lives and how full
/// it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockMeta {
    /// Physical block currently backing this logical block.
    pub phys_id: u32,
    /// First byte of object data inside the block.
    pub data_start: u32,
    /// Unused bytes at the tail of the block.
    pub free_size: u32,
}

impl BlockMeta {
    pub fn encode_into(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.phys_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.data_start.to_le_bytes());
        out[8..12].copy_from_slice(&self.free_size.to_le_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let word = |range: core::ops::Range<usize>| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[range]);
            u32::from_le_bytes(raw)
        };
        Self {
            phys_id: word(0..4),
            data_start: word(4..8),
            free_size: word(8..12),
        }
    }
}

/// Object table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectMeta {
    /// Owner asset id, [`FREE_UUID`] when the slot is free.
    pub uuid: u16,
    /// Logical data block holding the payload.
    pub lblock: u32,
    /// Absolute payload offset inside the block.
    pub data_index: u32,
    /// Bytes written so far.
    pub cur_size: u32,
    /// Bytes reserved at creation.
    pub max_size: u32,
    /// Envelope sealing the payload. Unused in plaintext stores.
    pub envelope: Envelope,
}

impl ObjectMeta {
    pub fn is_free(&self) -> bool {
        self.uuid == FREE_UUID
    }

    pub fn encode_into(&self, geo: &StoreGeometry, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.uuid.to_le_bytes());
        out[2..6].copy_from_slice(&self.lblock.to_le_bytes());
        out[6..10].copy_from_slice(&self.data_index.to_le_bytes());
        out[10..14].copy_from_slice(&self.cur_size.to_le_bytes());
        out[14..18].copy_from_slice(&self.max_size.to_le_bytes());
        if geo.encrypted {
            self.envelope
                .encode_into(&mut out[OBJECT_META_PLAIN_LEN as usize..]);
        }
    }

    pub fn decode(geo: &StoreGeometry, bytes: &[u8]) -> Self {
        let word = |range: core::ops::Range<usize>| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[range]);
            u32::from_le_bytes(raw)
        };
        let mut uuid = [0u8; 2];
        uuid.copy_from_slice(&bytes[0..2]);
        let mut meta = Self {
            uuid: u16::from_le_bytes(uuid),
            lblock: word(2..6),
            data_index: word(6..10),
            cur_size: word(10..14),
            max_size: word(14..18),
            envelope: Envelope::default(),
        };
        if geo.encrypted {
            meta.envelope = Envelope::decode(&bytes[OBJECT_META_PLAIN_LEN as usize..]);
        }
        meta
    }
}
