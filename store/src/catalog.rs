//! Built-in asset catalog.
//!
//! A ready-made policy table for the common provisioning set: symmetric
//! keys, RSA key blobs, X.509 certificates and digest values. Firmware
//! with its own asset set supplies its own [`PolicyTable`] instead.

use crate::policy::{AppId, AssetPolicy, Grant, Perms, PolicyTable};

pub const APP_A: AppId = AppId(9);
pub const APP_B: AppId = AppId(10);
pub const APP_C: AppId = AppId(11);
pub const APP_D: AppId = AppId(12);

pub const AES_KEY_128: u16 = 3;
pub const AES_KEY_192: u16 = 4;
pub const AES_KEY_256: u16 = 5;
pub const RSA_KEY_1024: u16 = 6;
pub const RSA_KEY_2048: u16 = 7;
pub const RSA_KEY_4096: u16 = 8;
pub const X509_CERT_SMALL: u16 = 9;
pub const X509_CERT_LARGE: u16 = 10;
pub const SHA224_HASH: u16 = 11;
pub const SHA384_HASH: u16 = 12;

/// Largest reserved size in the catalog.
pub const MAX_ASSET_SIZE: u32 = 2048;

const FULL: Perms = Perms::ALL;
const READ_ONLY: Perms = Perms::REFERENCE.union(Perms::READ);

/// Policy table for the built-in asset set.
///
/// The large certificate is shared: one owner, one reader, one
/// application that may only hold a reference to it.
pub const CATALOG: PolicyTable<'static> = PolicyTable {
    assets: &[
        AssetPolicy {
            uuid: AES_KEY_128,
            max_size: 16,
            grants: &[Grant {
                app: APP_A,
                perms: FULL,
            }],
        },
        AssetPolicy {
            uuid: AES_KEY_192,
            max_size: 24,
            grants: &[Grant {
                app: APP_A,
                perms: FULL,
            }],
        },
        AssetPolicy {
            uuid: AES_KEY_256,
            max_size: 32,
            grants: &[Grant {
                app: APP_A,
                perms: FULL,
            }],
        },
        AssetPolicy {
            uuid: RSA_KEY_1024,
            max_size: 128,
            grants: &[Grant {
                app: APP_B,
                perms: FULL,
            }],
        },
        AssetPolicy {
            uuid: RSA_KEY_2048,
            max_size: 256,
            grants: &[Grant {
                app: APP_B,
                perms: FULL,
            }],
        },
        AssetPolicy {
            uuid: RSA_KEY_4096,
            max_size: 512,
            grants: &[Grant {
                app: APP_B,
                perms: FULL,
            }],
        },
        AssetPolicy {
            uuid: X509_CERT_SMALL,
            max_size: 512,
            grants: &[Grant {
                app: APP_C,
                perms: FULL,
            }],
        },
        AssetPolicy {
            uuid: X509_CERT_LARGE,
            max_size: 2048,
            grants: &[
                Grant {
                    app: APP_A,
                    perms: FULL,
                },
                Grant {
                    app: APP_B,
                    perms: READ_ONLY,
                },
                Grant {
                    app: APP_C,
                    perms: Perms::REFERENCE,
                },
            ],
        },
        AssetPolicy {
            uuid: SHA224_HASH,
            max_size: 28,
            grants: &[Grant {
                app: APP_D,
                perms: FULL,
            }],
        },
        AssetPolicy {
            uuid: SHA384_HASH,
            max_size: 48,
            grants: &[Grant {
                app: APP_D,
                perms: FULL,
            }],
        },
    ],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_uuid_is_unique_and_nonzero() {
        let assets = CATALOG.assets;
        for (i, asset) in assets.iter().enumerate() {
            assert_ne!(asset.uuid, 0);
            assert!(asset.max_size > 0);
            for other in &assets[i + 1..] {
                assert_ne!(asset.uuid, other.uuid);
            }
        }
    }

    #[test]
    fn max_asset_size_matches_the_largest_entry() {
        let largest = CATALOG
            .assets
            .iter()
            .map(|asset| asset.max_size)
            .max()
            .unwrap();
        assert_eq!(largest, MAX_ASSET_SIZE);
    }

    #[test]
    fn shared_certificate_has_tiered_grants() {
        let cert = CATALOG.lookup(X509_CERT_LARGE).unwrap();
        assert_eq!(cert.grants.len(), 3);
        assert!(cert.grants[1].perms.allows(Perms::READ));
        assert!(!cert.grants[2].perms.allows(Perms::READ | Perms::WRITE));
    }
}
