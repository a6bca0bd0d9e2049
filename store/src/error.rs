//! Error type shared by the metadata journal, object store and service
//! layers.

use core::fmt;

/// Errors surfaced by store operations.
///
/// `E` is the error type of the underlying flash driver. Flash failures
/// on the read path are reported as [`StoreError::Flash`] and leave the
/// store usable; failures while a mutation is being staged or committed
/// are reported as [`StoreError::CommitFault`] and require a fresh
/// [`prepare`](crate::object::ObjectStore::prepare) before the store
/// accepts further calls.
#[derive(Debug, PartialEq, Eq)]
pub enum StoreError<E>
where
    E: fmt::Debug,
{
    /// No asset with the requested identifier, or the caller is not
    /// allowed to know whether one exists.
    NotFound,
    /// An argument is out of range for the target object.
    InvalidParam,
    /// The handle refers to a slot that no longer holds its asset.
    StaleHandle,
    /// No data block has room for the object, or the object table is
    /// full.
    StorageFull,
    /// The store has not been prepared, or a previous commit fault
    /// left it suspended.
    NotReady,
    /// Neither metadata block holds a valid, authentic image.
    Corrupt,
    /// An object payload failed authentication.
    Authentication,
    /// The commit counter is exhausted; no further mutations are
    /// possible with this key.
    NonceExhausted,
    /// The flash driver failed outside the commit path.
    Flash(E),
    /// The flash driver failed while staging or committing a mutation.
    CommitFault(E),
}

impl<E> fmt::Display for StoreError<E>
where
    E: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "asset not found"),
            StoreError::InvalidParam => write!(f, "invalid parameter"),
            StoreError::StaleHandle => write!(f, "stale asset handle"),
            StoreError::StorageFull => write!(f, "storage full"),
            StoreError::NotReady => write!(f, "store not prepared"),
            StoreError::Corrupt => write!(f, "no valid metadata block"),
            StoreError::Authentication => write!(f, "object authentication failed"),
            StoreError::NonceExhausted => write!(f, "commit counter exhausted"),
            StoreError::Flash(err) => write!(f, "flash error: {err:?}"),
            StoreError::CommitFault(err) => write!(f, "flash error during commit: {err:?}"),
        }
    }
}

#[cfg(feature = "std")]
impl<E> std::error::Error for StoreError<E> where E: fmt::Debug {}
