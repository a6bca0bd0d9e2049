//! Provisioning artifacts: CBOR snapshots of a store's assets.
//!
//! An artifact carries the payload bytes of every exported asset so a
//! provisioning run can be replayed onto a fresh image file.

use serde::{Deserialize, Serialize};

/// Artifact layout revision, bumped on incompatible changes.
pub const FORMAT_VERSION: u16 = 1;

/// One exported asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub uuid: u16,
    pub data: Vec<u8>,
}

/// A snapshot of every asset read out of a store image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub format_version: u16,
    /// Tool version that wrote the artifact, for forensics only.
    pub tool_version: String,
    pub assets: Vec<AssetRecord>,
}

impl Artifact {
    pub fn new(assets: Vec<AssetRecord>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            assets,
        }
    }

    /// Serializes the artifact to CBOR bytes.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        serde_cbor::to_vec(self).map_err(|err| anyhow::anyhow!("cannot encode the artifact: {err}"))
    }

    /// Decodes an artifact and checks its format revision.
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let artifact: Artifact = serde_cbor::from_slice(bytes)
            .map_err(|err| anyhow::anyhow!("not a provisioning artifact: {err}"))?;
        if artifact.format_version != FORMAT_VERSION {
            anyhow::bail!(
                "artifact format {found} is not supported (expected {expected})",
                found = artifact.format_version,
                expected = FORMAT_VERSION,
            );
        }
        Ok(artifact)
    }
}

// ---- tests ----
