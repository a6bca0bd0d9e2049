//! Store geometry and the flash layout derived from it.
//!
//! Two physical blocks hold interleaved copies of the metadata image;
//! the remaining blocks carry object data. The metadata image is laid
//! out as header, block table, object table, and everything after it in
//! the same physical block is object data belonging to logical block 0.

use crate::crypto::Envelope;

/// Physical id of the first metadata block.
pub const METADATA_BLOCK0: u32 = 0;
/// Physical id of the second metadata block.
pub const METADATA_BLOCK1: u32 = 1;
/// Logical id of the data region that shares a block with the metadata.
pub const LOGICAL_BLOCK0: u32 = 0;

/// On-flash filesystem version byte.
pub const FS_VERSION: u8 = 0x01;
/// Swap count value that marks a header as never committed.
pub const INVALID_SWAP_COUNT: u8 = redoubt_flash::ERASED_BYTE;
/// Object table entry value marking a free slot.
pub const FREE_UUID: u16 = 0;

/// Encoded size of one block table entry.
pub const BLOCK_META_LEN: u32 = 12;
/// Encoded size of one object table entry before the optional envelope.
pub const OBJECT_META_PLAIN_LEN: u32 = 18;

/// The other metadata block of a pair.
pub fn other_metablock(phys: u32) -> u32 {
    phys ^ 1
}

/// Shape of the managed flash region.
///
/// All layout offsets are derived from this; the same geometry must be
/// used for every mount of a given image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreGeometry {
    /// Size of one erase block in bytes.
    pub block_size: u32,
    /// Number of erase blocks managed by the store.
    pub block_count: u32,
    /// Capacity of the object table.
    pub object_slots: u16,
    /// Whether payloads and metadata carry AEAD envelopes.
    pub encrypted: bool,
}

impl Default for StoreGeometry {
    fn default() -> Self {
        Self {
            block_size: 4096,
            block_count: 5,
            object_slots: 10,
            encrypted: true,
        }
    }
}

impl StoreGeometry {
    /// Data blocks that hold nothing but object data.
    ///
    /// A two-block store has none: object data lives in the metadata
    /// blocks and the inactive metadata block doubles as scratch.
    pub fn dedicated_dblocks(&self) -> u32 {
        if self.block_count == 2 {
            0
        } else {
            self.block_count - 3
        }
    }

    /// Number of addressable logical data blocks.
    pub fn logical_dblocks(&self) -> u32 {
        self.dedicated_dblocks() + 1
    }

    /// Physical id of the data scratch block in a pristine image.
    pub fn initial_scratch_dblock(&self) -> u32 {
        if self.block_count == 2 {
            METADATA_BLOCK1
        } else {
            2
        }
    }

    /// Physical id of the first dedicated data block in a pristine
    /// image.
    pub fn first_dedicated_phys(&self) -> u32 {
        3
    }

    /// Bytes reserved for an envelope, zero when running in plaintext.
    pub fn envelope_len(&self) -> u32 {
        if self.encrypted {
            Envelope::LEN as u32
        } else {
            0
        }
    }

    /// Offset of the scratch data block id in the header.
    pub fn scratch_dblock_off(&self) -> u32 {
        self.envelope_len()
    }

    /// Offset of the filesystem version byte in the header.
    pub fn fs_version_off(&self) -> u32 {
        self.envelope_len() + 4
    }

    /// Offset of the swap count byte in the header.
    pub fn swap_count_off(&self) -> u32 {
        self.envelope_len() + 5
    }

    /// Total header size.
    pub fn header_len(&self) -> u32 {
        self.envelope_len() + 6
    }

    /// Start of the authenticated metadata region.
    ///
    /// The header envelope itself is excluded: its IV and tag cannot
    /// cover their own bytes.
    pub fn auth_off(&self) -> u32 {
        self.envelope_len()
    }

    /// Offset of the block table.
    pub fn block_table_off(&self) -> u32 {
        self.header_len()
    }

    /// Offset of the block table entry for `lblock`.
    pub fn block_meta_off(&self, lblock: u32) -> u32 {
        self.block_table_off() + lblock * BLOCK_META_LEN
    }

    /// Encoded size of one object table entry.
    pub fn object_meta_len(&self) -> u32 {
        OBJECT_META_PLAIN_LEN + self.envelope_len()
    }

    /// Offset of the object table.
    pub fn object_table_off(&self) -> u32 {
        self.block_table_off() + self.logical_dblocks() * BLOCK_META_LEN
    }

    /// Offset of the object table entry for slot `index`.
    pub fn object_meta_off(&self, index: u16) -> u32 {
        self.object_table_off() + u32::from(index) * self.object_meta_len()
    }

    /// Total size of the metadata image, and the point at which logical
    /// block 0 data begins.
    pub fn metadata_size(&self) -> u32 {
        self.object_table_off() + u32::from(self.object_slots) * self.object_meta_len()
    }

    /// Bytes available for object data in logical block 0.
    pub fn block0_capacity(&self) -> u32 {
        self.block_size - self.metadata_size()
    }

    /// Whether the geometry describes a usable layout.
    pub fn is_valid(&self) -> bool {
        self.block_count >= 2 && self.object_slots >= 1 && self.metadata_size() < self.block_size
    }
}
