#![cfg_attr(not(feature = "std"), no_std)]

//! Power-failure-safe object store over block flash.
//!
//! Objects live in erase blocks managed through a two-block metadata
//! journal: every mutation is staged in scratch blocks and becomes
//! visible only when the scratch metadata block header is committed.
//! A power cut at any point leaves either the previous state or the
//! new one, never a blend of the two.
//!
//! The [`service`] layer adds per-caller access control on top of the
//! raw object store, with a policy table describing which application
//! may reference, read or write each asset.

extern crate alloc;

pub mod catalog;
pub mod config;
pub mod crypto;
pub mod error;
pub mod meta;
pub mod object;
pub mod policy;
pub mod service;

pub use config::StoreGeometry;
pub use crypto::{EnvelopeAlgorithm, EnvelopeCipher};
pub use error::StoreError;
pub use object::{Handle, ObjectInfo, ObjectStore};
pub use policy::{AppId, AssetPolicy, Caller, Grant, Perms, PolicyTable};
pub use service::AssetService;
