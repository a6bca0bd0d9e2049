//! Image header layout and payload verification.
//!
//! An image occupies a slot from byte 0: fixed 32-byte header, then the
//! payload. All integers are little-endian. The header never moves, so
//! a slot's bootability is decided by reading one block.

use alloc::vec::Vec;

/// Magic leading every image header.
pub const IMAGE_MAGIC: u32 = 0x5244_4254;

/// Header flag marking an image that must never be booted or swapped
/// in.
pub const FLAG_NON_BOOTABLE: u32 = 0x0000_0002;

const ERASED_MAGIC: u32 = u32::from_le_bytes([redoubt_flash::ERASED_BYTE; 4]);

/// Image version, ordered by field significance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ImageVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    pub build: u32,
}

impl core::fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}.{}.{}+{}",
            self.major, self.minor, self.revision, self.build
        )
    }
}

/// Fixed header at the start of every image slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageHeader {
    pub magic: u32,
    /// Bytes from the slot start to the payload.
    pub header_len: u32,
    /// Payload length in bytes.
    pub img_len: u32,
    /// CRC32 of the payload.
    pub payload_crc: u32,
    pub flags: u32,
    pub version: ImageVersion,
    /// Anti-rollback counter the image was signed with.
    pub security_counter: u32,
}

impl ImageHeader {
    pub const LEN: u32 = 32;

    /// Whether the header area has never been programmed.
    pub fn is_erased(&self) -> bool {
        self.magic == ERASED_MAGIC
    }

    pub fn magic_ok(&self) -> bool {
        self.magic == IMAGE_MAGIC
    }

    pub fn bootable(&self) -> bool {
        self.flags & FLAG_NON_BOOTABLE == 0
    }

    /// Bytes of the slot covered by header plus payload.
    ///
    /// Saturates so a corrupt header cannot wrap past a size check.
    pub fn extent(&self) -> u32 {
        self.header_len.saturating_add(self.img_len)
    }

    pub fn encode_into(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.header_len.to_le_bytes());
        out[8..12].copy_from_slice(&self.img_len.to_le_bytes());
        out[12..16].copy_from_slice(&self.payload_crc.to_le_bytes());
        out[16..20].copy_from_slice(&self.flags.to_le_bytes());
        out[20] = self.version.major;
        out[21] = self.version.minor;
        out[22..24].copy_from_slice(&self.version.revision.to_le_bytes());
        out[24..28].copy_from_slice(&self.version.build.to_le_bytes());
        out[28..32].copy_from_slice(&self.security_counter.to_le_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let word = |range: core::ops::Range<usize>| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[range]);
            u32::from_le_bytes(raw)
        };
        let mut revision = [0u8; 2];
        revision.copy_from_slice(&bytes[22..24]);
        Self {
            magic: word(0..4),
            header_len: word(4..8),
            img_len: word(8..12),
            payload_crc: word(12..16),
            flags: word(16..20),
            version: ImageVersion {
                major: bytes[20],
                minor: bytes[21],
                revision: u16::from_le_bytes(revision),
                build: word(24..28),
            },
            security_counter: word(28..32),
        }
    }
}

/// Streaming payload check, fed the payload in storage order.
///
/// The swap engine validates whole slots without buffering them, so the
/// verifier absorbs block-sized chunks and settles against the header
/// at the end.
pub trait ImageVerifier {
    /// Discards any absorbed data.
    fn reset(&mut self);
    /// Feeds the next run of payload bytes.
    fn absorb(&mut self, chunk: &[u8]);
    /// Consumes the absorbed stream and checks it against `header`.
    fn matches(&mut self, header: &ImageHeader) -> bool;
}

/// Verifier for the `payload_crc` header field.
#[derive(Default)]
pub struct Crc32Verifier {
    hasher: crc32fast::Hasher,
}

impl Crc32Verifier {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ImageVerifier for Crc32Verifier {
    fn reset(&mut self) {
        self.hasher = crc32fast::Hasher::new();
    }

    fn absorb(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    fn matches(&mut self, header: &ImageHeader) -> bool {
        core::mem::take(&mut self.hasher).finalize() == header.payload_crc
    }
}

/// Assembles a flashable image: header with the payload CRC filled in,
/// then the payload.
pub fn build_image(version: ImageVersion, security_counter: u32, payload: &[u8]) -> Vec<u8> {
    let header = ImageHeader {
        magic: IMAGE_MAGIC,
        header_len: ImageHeader::LEN,
        img_len: payload.len() as u32,
        payload_crc: crc32fast::hash(payload),
        flags: 0,
        version,
        security_counter,
    };
    let mut image = alloc::vec![0u8; ImageHeader::LEN as usize + payload.len()];
    header.encode_into(&mut image);
    image[ImageHeader::LEN as usize..].copy_from_slice(payload);
    image
}

// ---- tests ----
