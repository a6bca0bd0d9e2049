//! Caller access control.
//!
//! Every asset has a policy entry naming its reserved size and the
//! applications allowed to touch it. Secure-side callers acting on
//! their own behalf bypass the per-application grants; a secure caller
//! proxying for a non-secure client may only pass reads through, and
//! those are checked against the reference grant. All refusals look
//! identical to the caller: an asset it may not touch does not exist.

/// Access rights bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Perms(u8);

impl Perms {
    pub const NONE: Perms = Perms(0);
    /// May learn that the asset exists and resolve its handle.
    pub const REFERENCE: Perms = Perms(1 << 0);
    pub const READ: Perms = Perms(1 << 1);
    pub const WRITE: Perms = Perms(1 << 2);
    pub const ALL: Perms = Perms(0b111);

    pub const fn union(self, other: Perms) -> Perms {
        Perms(self.0 | other.0)
    }

    /// Whether any of the `wanted` rights is present.
    pub fn allows(self, wanted: Perms) -> bool {
        self.0 & wanted.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl core::ops::BitOr for Perms {
    type Output = Perms;

    fn bitor(self, rhs: Perms) -> Perms {
        self.union(rhs)
    }
}

/// Application identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppId(pub u32);

impl AppId {
    /// Identity of secure-side code acting on its own behalf.
    pub const SECURE: AppId = AppId(u32::MAX);
}

/// Who is asking, and from which side of the security boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub app: AppId,
    pub secure: bool,
}

impl Caller {
    /// Non-secure caller with its own application id.
    pub const fn non_secure(app: AppId) -> Self {
        Self { app, secure: false }
    }

    /// Secure caller acting on its own behalf.
    pub const fn secure() -> Self {
        Self {
            app: AppId::SECURE,
            secure: true,
        }
    }

    /// Secure caller forwarding a request for a non-secure client.
    pub const fn proxy(app: AppId) -> Self {
        Self { app, secure: true }
    }
}

/// One application's rights on one asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub app: AppId,
    pub perms: Perms,
}

/// Policy entry for one asset.
#[derive(Debug, Clone, Copy)]
pub struct AssetPolicy<'a> {
    pub uuid: u16,
    /// Bytes reserved when the asset is created.
    pub max_size: u32,
    pub grants: &'a [Grant],
}

/// The complete asset policy database.
#[derive(Debug, Clone, Copy)]
pub struct PolicyTable<'a> {
    pub assets: &'a [AssetPolicy<'a>],
}

enum Access {
    Bypass,
    Limited(Perms),
}

/// Folds the secure/non-secure delegation rules into a request.
///
/// `None` means the request is refused outright, before any table
/// lookup.
fn sanitize(caller: &Caller, request: Perms) -> Option<Access> {
    if caller.secure {
        if caller.app == AppId::SECURE {
            Some(Access::Bypass)
        } else if request.allows(Perms::READ) {
            // A delegated read is served as read-by-reference.
            Some(Access::Limited(Perms::REFERENCE))
        } else {
            // Writes and deletes cannot be delegated.
            None
        }
    } else if caller.app == AppId::SECURE {
        // Non-secure caller claiming the secure identity.
        None
    } else {
        Some(Access::Limited(request))
    }
}

impl<'a> PolicyTable<'a> {
    pub fn lookup(&self, uuid: u16) -> Option<&AssetPolicy<'a>> {
        self.assets.iter().find(|asset| asset.uuid == uuid)
    }

    /// Resolves whether `caller` may perform `request` on `uuid`.
    ///
    /// Returns the asset's policy entry on success and `None` on any
    /// refusal, whether the asset is unknown, ungranted or the request
    /// inadmissible.
    pub fn authorize(
        &self,
        caller: &Caller,
        uuid: u16,
        request: Perms,
    ) -> Option<&AssetPolicy<'a>> {
        let access = sanitize(caller, request)?;
        let asset = self.lookup(uuid)?;
        match access {
            Access::Bypass => Some(asset),
            Access::Limited(needed) => {
                let grant = asset.grants.iter().find(|grant| grant.app == caller.app)?;
                grant.perms.allows(needed).then_some(asset)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: AppId = AppId(9);
    const READER: AppId = AppId(10);
    const OUTSIDER: AppId = AppId(11);

    const TABLE: PolicyTable<'static> = PolicyTable {
        assets: &[AssetPolicy {
            uuid: 5,
            max_size: 32,
            grants: &[
                Grant {
                    app: OWNER,
                    perms: Perms::ALL,
                },
                Grant {
                    app: READER,
                    perms: Perms::REFERENCE.union(Perms::READ),
                },
            ],
        }],
    };

    #[test]
    fn grants_gate_non_secure_callers() {
        let owner = Caller::non_secure(OWNER);
        assert!(TABLE.authorize(&owner, 5, Perms::WRITE).is_some());

        let reader = Caller::non_secure(READER);
        assert!(TABLE.authorize(&reader, 5, Perms::READ).is_some());
        assert!(TABLE.authorize(&reader, 5, Perms::WRITE).is_none());

        let outsider = Caller::non_secure(OUTSIDER);
        assert!(TABLE.authorize(&outsider, 5, Perms::READ).is_none());
    }

    #[test]
    fn unknown_assets_are_refused() {
        let owner = Caller::non_secure(OWNER);
        assert!(TABLE.authorize(&owner, 6, Perms::READ).is_none());
        assert!(TABLE.authorize(&Caller::secure(), 6, Perms::READ).is_none());
    }

    #[test]
    fn secure_callers_bypass_grants_on_their_own_behalf() {
        let secure = Caller::secure();
        assert!(TABLE.authorize(&secure, 5, Perms::WRITE).is_some());
        assert!(TABLE.authorize(&secure, 5, Perms::ALL).is_some());
    }

    #[test]
    fn delegated_reads_are_served_by_reference() {
        // Reads forwarded by secure code check the client's reference
        // grant; anything else cannot be forwarded at all.
        let proxy = Caller::proxy(READER);
        assert!(TABLE.authorize(&proxy, 5, Perms::READ).is_some());
        assert!(TABLE.authorize(&proxy, 5, Perms::WRITE).is_none());

        let stranger = Caller::proxy(OUTSIDER);
        assert!(TABLE.authorize(&stranger, 5, Perms::READ).is_none());
    }

    #[test]
    fn spoofed_secure_identity_is_refused() {
        let spoof = Caller::non_secure(AppId::SECURE);
        assert!(TABLE.authorize(&spoof, 5, Perms::READ).is_none());
    }

    #[test]
    fn perm_bit_arithmetic() {
        assert!(Perms::ALL.allows(Perms::WRITE));
        assert!(!(Perms::REFERENCE | Perms::READ).allows(Perms::WRITE));
        assert!(Perms::NONE.is_empty());
        assert!(!Perms::REFERENCE.is_empty());
    }
}
