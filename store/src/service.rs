//! Policy-checked front door to the object store.
//!
//! Callers never pick object sizes: creation reserves whatever the
//! policy entry says. Any refusal, whatever its cause, surfaces as
//! [`StoreError::NotFound`] so probing callers cannot map out assets
//! they have no rights to.

use log::debug;
use redoubt_flash::BlockFlash;

use crate::config::StoreGeometry;
use crate::crypto::EnvelopeCipher;
use crate::error::StoreError;
use crate::object::{Handle, ObjectInfo, ObjectStore};
use crate::policy::{Caller, Perms, PolicyTable};

/// Access-controlled asset storage.
pub struct AssetService<'a, F>
where
    F: BlockFlash,
{
    store: ObjectStore<F>,
    policy: PolicyTable<'a>,
}

impl<'a, F> AssetService<'a, F>
where
    F: BlockFlash,
{
    pub fn new(
        flash: F,
        geo: StoreGeometry,
        cipher: Option<EnvelopeCipher>,
        policy: PolicyTable<'a>,
    ) -> Result<Self, StoreError<F::Error>> {
        Ok(Self {
            store: ObjectStore::new(flash, geo, cipher)?,
            policy,
        })
    }

    pub fn prepare(&mut self) -> Result<(), StoreError<F::Error>> {
        self.store.prepare()
    }

    pub fn wipe_all(&mut self) -> Result<(), StoreError<F::Error>> {
        self.store.wipe_all()
    }

    pub fn is_ready(&self) -> bool {
        self.store.is_ready()
    }

    pub fn policy(&self) -> &PolicyTable<'a> {
        &self.policy
    }

    /// The raw store underneath, for provisioning tools that operate
    /// outside the caller policy.
    pub fn store(&self) -> &ObjectStore<F> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ObjectStore<F> {
        &mut self.store
    }

    pub fn into_store(self) -> ObjectStore<F> {
        self.store
    }

    /// Creates the asset with its policy-defined reservation.
    pub fn create(&mut self, caller: &Caller, uuid: u16) -> Result<Handle, StoreError<F::Error>> {
        let max_size = self.authorize(caller, uuid, Perms::WRITE)?;
        let handle = self.store.create(uuid, max_size)?;
        debug!("asset {uuid} created, {max_size} bytes reserved");
        Ok(handle)
    }

    pub fn get_handle(&mut self, caller: &Caller, uuid: u16) -> Result<Handle, StoreError<F::Error>> {
        self.authorize(caller, uuid, Perms::ALL)?;
        self.store.get_handle(uuid)
    }

    pub fn read(
        &mut self,
        caller: &Caller,
        handle: Handle,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), StoreError<F::Error>> {
        self.authorize(caller, handle.uuid(), Perms::READ)?;
        self.store.read(handle, offset, buf)
    }

    pub fn write(
        &mut self,
        caller: &Caller,
        handle: Handle,
        offset: u32,
        data: &[u8],
    ) -> Result<(), StoreError<F::Error>> {
        self.authorize(caller, handle.uuid(), Perms::WRITE)?;
        self.store.write(handle, offset, data)
    }

    pub fn delete(&mut self, caller: &Caller, handle: Handle) -> Result<(), StoreError<F::Error>> {
        self.authorize(caller, handle.uuid(), Perms::WRITE)?;
        self.store.delete(handle)?;
        debug!("asset {} deleted", handle.uuid());
        Ok(())
    }

    pub fn attributes(
        &mut self,
        caller: &Caller,
        handle: Handle,
    ) -> Result<ObjectInfo, StoreError<F::Error>> {
        self.authorize(caller, handle.uuid(), Perms::ALL)?;
        self.store.attributes(handle)
    }

    fn authorize(
        &self,
        caller: &Caller,
        uuid: u16,
        request: Perms,
    ) -> Result<u32, StoreError<F::Error>> {
        match self.policy.authorize(caller, uuid, request) {
            Some(asset) => Ok(asset.max_size),
            None => {
                debug!("app {:?} refused {request:?} on asset {uuid}", caller.app);
                Err(StoreError::NotFound)
            }
        }
    }
}
