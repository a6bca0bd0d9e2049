//! Error type shared by the swap engine and the boot entry point.

use core::fmt;

/// Errors surfaced by the bootloader.
///
/// `E` is the error type of the underlying flash driver. Flash failures
/// anywhere in the swap path are reported as [`BootError::Flash`];
/// there is no deferred or soft-fail mode, a failed status write aborts
/// the boot attempt so the next power cycle resumes from the persisted
/// state instead of running on top of a silently diverged one.
#[derive(Debug, PartialEq, Eq)]
pub enum BootError<E>
where
    E: fmt::Debug,
{
    /// The flash driver failed.
    Flash(E),
    /// An image header or payload failed validation.
    BadImage,
    /// The slot map cannot support a swap (mismatched geometry,
    /// overlapping regions, or too many sectors for the status area).
    IncompatibleSlots,
    /// The persisted swap status is inconsistent and cannot be resumed.
    StatusCorrupt,
    /// The primary slot cannot be made bootable; the caller must halt.
    Fatal,
}

impl<E> fmt::Display for BootError<E>
where
    E: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::Flash(err) => write!(f, "flash error: {err:?}"),
            BootError::BadImage => write!(f, "image failed validation"),
            BootError::IncompatibleSlots => write!(f, "slot layout cannot be swapped"),
            BootError::StatusCorrupt => write!(f, "swap status unreadable"),
            BootError::Fatal => write!(f, "no bootable image in the primary slot"),
        }
    }
}

#[cfg(feature = "std")]
impl<E> std::error::Error for BootError<E> where E: fmt::Debug {}
