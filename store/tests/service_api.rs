//! End-to-end scenarios against the policy-checked service with the
//! built-in catalog.

use redoubt_flash::sim::SimFlash;
use redoubt_store::catalog::{
    APP_A, APP_B, APP_D, CATALOG, AES_KEY_128, AES_KEY_192, RSA_KEY_1024, SHA224_HASH,
    SHA384_HASH, X509_CERT_LARGE,
};
use redoubt_store::{AssetService, Caller, EnvelopeCipher, StoreError, StoreGeometry};

const KEY: [u8; 32] = [0x2F; 32];

fn geometry(encrypted: bool) -> StoreGeometry {
    StoreGeometry {
        encrypted,
        ..StoreGeometry::default()
    }
}

fn fresh_service(encrypted: bool) -> AssetService<'static, SimFlash> {
    let geo = geometry(encrypted);
    let cipher = encrypted.then(|| EnvelopeCipher::chacha20_poly1305(KEY));
    let flash = SimFlash::new(geo.block_size, geo.block_count);
    let mut service = AssetService::new(flash, geo, cipher, CATALOG).unwrap();
    service.wipe_all().unwrap();
    service
}

fn remount(service: AssetService<'static, SimFlash>, encrypted: bool) -> AssetService<'static, SimFlash> {
    let geo = geometry(encrypted);
    let cipher = encrypted.then(|| EnvelopeCipher::chacha20_poly1305(KEY));
    let flash = service.into_store().into_flash();
    let mut service = AssetService::new(flash, geo, cipher, CATALOG).unwrap();
    service.prepare().unwrap();
    service
}

#[test]
fn provisioned_assets_survive_a_remount() {
    let mut service = fresh_service(true);
    let owner_a = Caller::non_secure(APP_A);
    let owner_d = Caller::non_secure(APP_D);

    let key = service.create(&owner_a, AES_KEY_128).unwrap();
    service.write(&owner_a, key, 0, &[0xA5; 16]).unwrap();
    let digest = service.create(&owner_d, SHA384_HASH).unwrap();
    service.write(&owner_d, digest, 0, &[0x84; 48]).unwrap();

    let mut service = remount(service, true);

    let key = service.get_handle(&owner_a, AES_KEY_128).unwrap();
    let mut buf = [0u8; 16];
    service.read(&owner_a, key, 0, &mut buf).unwrap();
    assert_eq!(buf, [0xA5; 16]);

    let digest = service.get_handle(&owner_d, SHA384_HASH).unwrap();
    let mut buf = [0u8; 48];
    service.read(&owner_d, digest, 0, &mut buf).unwrap();
    assert_eq!(buf, [0x84; 48]);
}

#[test]
fn the_default_geometry_holds_the_whole_catalog() {
    // Every asset created at its full reservation and filled to the
    // brim, then deleted again.
    for encrypted in [false, true] {
        let mut service = fresh_service(encrypted);
        let secure = Caller::secure();

        let uuids: Vec<u16> = CATALOG.assets.iter().map(|asset| asset.uuid).collect();
        for (asset, uuid) in CATALOG.assets.iter().zip(&uuids) {
            let handle = service.create(&secure, *uuid).unwrap();
            let fill = vec![*uuid as u8; asset.max_size as usize];
            service.write(&secure, handle, 0, &fill).unwrap();
        }

        for (asset, uuid) in CATALOG.assets.iter().zip(&uuids) {
            let handle = service.get_handle(&secure, *uuid).unwrap();
            let mut buf = vec![0u8; asset.max_size as usize];
            service.read(&secure, handle, 0, &mut buf).unwrap();
            assert_eq!(buf, vec![*uuid as u8; asset.max_size as usize]);
            service.delete(&secure, handle).unwrap();
        }

        assert!(service.store_mut().entries().unwrap().is_empty());
    }
}

#[test]
fn deleting_one_digest_leaves_its_neighbour_readable() {
    let mut service = fresh_service(true);
    let owner = Caller::non_secure(APP_D);

    let big = service.create(&owner, SHA384_HASH).unwrap();
    service.write(&owner, big, 0, &[0x84; 48]).unwrap();
    let small = service.create(&owner, SHA224_HASH).unwrap();
    service.write(&owner, small, 0, &[0x24; 28]).unwrap();

    service.delete(&owner, big).unwrap();

    let mut service = remount(service, true);
    let small = service.get_handle(&owner, SHA224_HASH).unwrap();
    let mut buf = [0u8; 28];
    service.read(&owner, small, 0, &mut buf).unwrap();
    assert_eq!(buf, [0x24; 28]);

    // The digest can be provisioned again in the reclaimed space.
    let big = service.create(&owner, SHA384_HASH).unwrap();
    service.write(&owner, big, 0, &[0x48; 48]).unwrap();
    service.read(&owner, small, 0, &mut buf).unwrap();
    assert_eq!(buf, [0x24; 28]);
}

#[test]
fn offset_windows_read_what_offset_writes_wrote() {
    let mut service = fresh_service(false);
    let owner = Caller::non_secure(APP_A);
    let handle = service.create(&owner, X509_CERT_LARGE).unwrap();

    service.write(&owner, handle, 0, b"DATA").unwrap();
    service.write(&owner, handle, 4, b"5678").unwrap();

    let mut tail = [0u8; 6];
    service.read(&owner, handle, 2, &mut tail).unwrap();
    assert_eq!(&tail, b"TA5678");

    let mut middle = [0u8; 2];
    service.read(&owner, handle, 3, &mut middle).unwrap();
    assert_eq!(&middle, b"A5");
}

#[test]
fn out_of_range_requests_are_parameter_errors() {
    let mut service = fresh_service(false);
    let owner = Caller::non_secure(APP_A);
    let handle = service.create(&owner, AES_KEY_128).unwrap();
    service.write(&owner, handle, 0, &[1; 8]).unwrap();
    let neighbour = service.create(&owner, AES_KEY_192).unwrap();
    service.write(&owner, neighbour, 0, &[2; 24]).unwrap();

    // Read beyond what has been written.
    let mut buf = [0u8; 4];
    assert_eq!(
        service.read(&owner, handle, 6, &mut buf),
        Err(StoreError::InvalidParam)
    );
    // Write beyond the reservation (16 bytes for this key).
    assert_eq!(
        service.write(&owner, handle, 10, &[1; 8]),
        Err(StoreError::InvalidParam)
    );
    assert_eq!(
        service.write(&owner, handle, 16, &[1]),
        Err(StoreError::InvalidParam)
    );
    // Empty transfers are refused outright.
    assert_eq!(
        service.read(&owner, handle, 0, &mut []),
        Err(StoreError::InvalidParam)
    );
    assert_eq!(
        service.write(&owner, handle, 0, &[]),
        Err(StoreError::InvalidParam)
    );

    // None of the refused requests touched either payload.
    let mut first = [0u8; 8];
    service.read(&owner, handle, 0, &mut first).unwrap();
    assert_eq!(first, [1; 8]);
    let mut second = [0u8; 24];
    service.read(&owner, neighbour, 0, &mut second).unwrap();
    assert_eq!(second, [2; 24]);
}

#[test]
fn recreating_an_existing_asset_is_refused() {
    let mut service = fresh_service(false);
    let owner = Caller::non_secure(APP_B);
    let first = service.create(&owner, RSA_KEY_1024).unwrap();
    assert_eq!(
        service.create(&owner, RSA_KEY_1024),
        Err(StoreError::InvalidParam)
    );
    service.delete(&owner, first).unwrap();
    service.create(&owner, RSA_KEY_1024).unwrap();
}

#[test]
fn the_shared_certificate_walks_its_whole_lifecycle() {
    let mut service = fresh_service(true);
    let owner = Caller::non_secure(APP_A);
    let reader = Caller::non_secure(APP_B);

    let cert = service.create(&owner, X509_CERT_LARGE).unwrap();
    service.write(&owner, cert, 0, b"DATA").unwrap();
    let mut buf = [0u8; 4];
    service.read(&owner, cert, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"DATA");

    // The read-only grant sees the same bytes but may not change them.
    let shared = service.get_handle(&reader, X509_CERT_LARGE).unwrap();
    let mut buf = [0u8; 4];
    service.read(&reader, shared, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"DATA");
    assert_eq!(
        service.write(&reader, shared, 0, b"MINE"),
        Err(StoreError::NotFound)
    );

    // Writing past the asset's reservation is refused.
    assert_eq!(
        service.write(&owner, cert, 2048, &[1]),
        Err(StoreError::InvalidParam)
    );

    service.delete(&owner, cert).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(
        service.read(&owner, cert, 0, &mut buf),
        Err(StoreError::NotFound)
    );
}
