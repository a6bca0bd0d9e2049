#![cfg_attr(not(feature = "std"), no_std)]

//! Fail-safe image swap bootloader over block flash.
//!
//! Two image slots and a small scratch area share one flash device. A
//! firmware update is staged into the secondary slot and queued through
//! a trailer write; on the next boot the two slots are swapped block
//! group by block group, each completed sub-step committed as a single
//! byte program. Power can be cut at any point and the following boot
//! finishes the swap from its last recorded sub-step.
//!
//! Swapped-in images run once and revert unless confirmed, so a bad
//! update can never brick the device, and a monotonic security counter
//! keeps rolled-back images from being reintroduced.

extern crate alloc;

pub mod error;
pub mod image;
pub mod loader;
pub mod map;
pub mod status;
pub mod trailer;

pub use error::BootError;
pub use image::{build_image, Crc32Verifier, ImageHeader, ImageVerifier, ImageVersion};
pub use loader::{BootResponse, Bootloader, RamCounter, SecurityCounter};
pub use map::{Region, Slot, SlotMap};
pub use status::{requested_swap, scan_status_bytes, status_source, BootStatus, StatusSource, SwapType};
pub use trailer::{mark_confirmed, mark_pending, FlagState, MagicState, SwapState, Trailer};
