//! The sharing engine: creation, owner listing and deletion, and the
//! consume-on-read retrieval of shared secrets.
//!
//! The engine holds no locks. Every guarantee about view limits rests on
//! `SecretStore::decrement_views_by_id` being a single atomic, conditional
//! store operation.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, SharingError, StoreError};
use crate::policy::{ActorContext, OrgPermission, PermissionService};
use crate::store::{
    self, CreatedSecret, NewSharedSecret, SecretFilter, SecretStore, SharedSecret, SortSpec,
};

/// Upper bound on the ciphertext accepted for a single secret.
pub const MAX_ENCRYPTED_VALUE_LEN: usize = 1_048_576;

/// Client-encrypted secret plus its access limits.
#[derive(Debug, Clone)]
pub struct SharePayload {
    pub encrypted_value: String,
    pub iv: String,
    pub auth_tag: String,
    pub lookup_hash: String,
    pub expires_at: Option<i64>,
    pub expires_after_views: Option<u32>,
}

impl SharePayload {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("encrypted_value", &self.encrypted_value),
            ("iv", &self.iv),
            ("auth_tag", &self.auth_tag),
            ("lookup_hash", &self.lookup_hash),
        ] {
            if value.is_empty() {
                return Err(SharingError::InvalidInput(format!("{name} must not be empty")));
            }
        }
        if self.encrypted_value.len() > MAX_ENCRYPTED_VALUE_LEN {
            return Err(SharingError::InvalidInput(
                "encrypted_value exceeds 1 MiB limit".into(),
            ));
        }
        Ok(())
    }

    fn into_record(self, owner_user_id: Option<String>, organization_id: Option<String>) -> NewSharedSecret {
        NewSharedSecret {
            owner_user_id,
            organization_id,
            encrypted_value: self.encrypted_value,
            iv: self.iv,
            auth_tag: self.auth_tag,
            lookup_hash: self.lookup_hash,
            expires_at: self.expires_at,
            expires_after_views: self.expires_after_views,
        }
    }
}

pub struct SharingEngine<S, P> {
    store: Arc<S>,
    permissions: Arc<P>,
}

impl<S, P> Clone for SharingEngine<S, P> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            permissions: Arc::clone(&self.permissions),
        }
    }
}

impl<S: SecretStore, P: PermissionService> SharingEngine<S, P> {
    pub fn new(store: Arc<S>, permissions: Arc<P>) -> Self {
        Self { store, permissions }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn require_org_permission(&self, ctx: &ActorContext) -> Result<OrgPermission> {
        self.permissions
            .get_org_permission(
                ctx.actor,
                &ctx.actor_id,
                &ctx.org_id,
                ctx.actor_auth_method.as_deref(),
                ctx.actor_org_id.as_deref(),
            )?
            .ok_or_else(|| SharingError::Unauthorized("user not in org".into()))
    }

    /// Store a secret owned by the calling actor within its organization.
    pub fn create_shared_secret(
        &self,
        ctx: &ActorContext,
        payload: SharePayload,
    ) -> Result<CreatedSecret> {
        let permission = self.require_org_permission(ctx)?;
        payload.validate()?;

        let record = payload.into_record(Some(permission.actor_id), Some(permission.org_id));
        let created = self.store.create(record)?;
        Ok(CreatedSecret {
            id: created.id.clone(),
        })
    }

    /// Store a secret with no owner. No authorization is performed.
    pub fn create_public_shared_secret(&self, payload: SharePayload) -> Result<CreatedSecret> {
        payload.validate()?;

        let created = self.store.create(payload.into_record(None, None))?;
        Ok(CreatedSecret {
            id: created.id.clone(),
        })
    }

    /// Every secret the actor owns in the organization, soonest expiry first.
    /// Expired records are still listed; this is the owner's management view.
    pub fn get_shared_secrets(&self, ctx: &ActorContext) -> Result<Vec<SharedSecret>> {
        self.require_org_permission(ctx)?;
        let filter = SecretFilter::owned_by(&ctx.actor_id, &ctx.org_id);
        Ok(self.store.find(&filter, SortSpec::expires_at_asc())?)
    }

    /// Read a secret by id and lookup hash, consuming one view.
    ///
    /// The reader that takes the last view still receives the secret; the next
    /// reader deletes the record and gets `NotFound`. Every failure reason is
    /// reported as `NotFound`.
    pub fn get_active_shared_secret_by_id_and_hashed_hex(
        &self,
        id: &str,
        hashed_hex: &str,
    ) -> Result<SharedSecret> {
        let secret = self.store.find_one(id, hashed_hex)?;

        if secret.is_expired(store::now()) {
            debug!(id = %id, "shared secret past deadline");
            return Err(SharingError::NotFound);
        }

        if let Some(views) = secret.expires_after_views {
            if views == 0 {
                self.discard(id)?;
                return Err(SharingError::NotFound);
            }
            // Another reader may have taken the last view since `find_one`.
            if self.store.decrement_views_by_id(id, 1)?.is_none() {
                self.discard(id)?;
                return Err(SharingError::NotFound);
            }
        }

        Ok(secret)
    }

    /// Delete a secret the actor owns within the organization.
    pub fn delete_shared_secret_by_id(
        &self,
        ctx: &ActorContext,
        id: &str,
    ) -> Result<SharedSecret> {
        self.require_org_permission(ctx)?;

        let filter = SecretFilter {
            id: Some(id.to_owned()),
            ..SecretFilter::owned_by(&ctx.actor_id, &ctx.org_id)
        };
        if self.store.find(&filter, SortSpec::default())?.is_empty() {
            return Err(SharingError::NotFound);
        }
        Ok(self.store.delete_by_id(id)?)
    }

    /// Delete an exhausted record. Losing the race to a concurrent deleter is fine.
    fn discard(&self, id: &str) -> Result<()> {
        match self.store.delete_by_id(id) {
            Ok(_) => {
                debug!(id = %id, "deleted exhausted shared secret");
                Ok(())
            }
            Err(StoreError::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::PolicyError;
    use crate::policy::{ActorType, MembershipGate};
    use crate::store::{now, Store};
    use tempfile::tempdir;

    type Engine = SharingEngine<Store, MembershipGate>;

    fn make_engine() -> (Engine, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        let gate = MembershipGate::new()
            .with_member("acme", "alice")
            .with_member("acme", "bob")
            .with_member("globex", "alice");
        (SharingEngine::new(Arc::new(store), Arc::new(gate)), dir)
    }

    fn ctx(actor_id: &str, org_id: &str) -> ActorContext {
        ActorContext {
            actor: ActorType::User,
            actor_id: actor_id.into(),
            org_id: org_id.into(),
            actor_auth_method: Some("email".into()),
            actor_org_id: Some(org_id.into()),
        }
    }

    fn payload(views: Option<u32>, expires_at: Option<i64>) -> SharePayload {
        SharePayload {
            encrypted_value: "U2FsdGVkX1+abc".into(),
            iv: "000102030405".into(),
            auth_tag: "a1b2c3".into(),
            lookup_hash: "5f4dcc3b5aa765d61d8327deb882cf99".into(),
            expires_at,
            expires_after_views: views,
        }
    }

    const HASH: &str = "5f4dcc3b5aa765d61d8327deb882cf99";

    #[test]
    fn views_run_out_after_exactly_n_reads() {
        let (e, _dir) = make_engine();
        let created = e.create_public_shared_secret(payload(Some(2), None)).unwrap();

        let first = e
            .get_active_shared_secret_by_id_and_hashed_hex(&created.id, HASH)
            .unwrap();
        let second = e
            .get_active_shared_secret_by_id_and_hashed_hex(&created.id, HASH)
            .unwrap();
        assert_eq!(first.encrypted_value, second.encrypted_value);
        assert_eq!(first.iv, second.iv);
        assert_eq!(first.auth_tag, second.auth_tag);

        assert!(matches!(
            e.get_active_shared_secret_by_id_and_hashed_hex(&created.id, HASH),
            Err(SharingError::NotFound)
        ));
        assert!(matches!(
            e.store().find_one(&created.id, HASH),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn concurrent_readers_get_exactly_n_views() {
        let (e, _dir) = make_engine();
        let created = e.create_public_shared_secret(payload(Some(3), None)).unwrap();

        let served = AtomicUsize::new(0);
        let refused = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..12 {
                scope.spawn(|| {
                    match e.get_active_shared_secret_by_id_and_hashed_hex(&created.id, HASH) {
                        Ok(_) => served.fetch_add(1, Ordering::SeqCst),
                        Err(SharingError::NotFound) => refused.fetch_add(1, Ordering::SeqCst),
                        Err(other) => panic!("unexpected error: {other}"),
                    };
                });
            }
        });

        assert_eq!(served.load(Ordering::SeqCst), 3);
        assert_eq!(refused.load(Ordering::SeqCst), 9);
        assert!(matches!(
            e.get_active_shared_secret_by_id_and_hashed_hex(&created.id, HASH),
            Err(SharingError::NotFound)
        ));
        assert!(matches!(
            e.store().find_one(&created.id, HASH),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn zero_views_is_never_readable_and_gets_deleted() {
        let (e, _dir) = make_engine();
        let created = e.create_public_shared_secret(payload(Some(0), None)).unwrap();
        assert!(e.store().find_one(&created.id, HASH).is_ok());

        assert!(matches!(
            e.get_active_shared_secret_by_id_and_hashed_hex(&created.id, HASH),
            Err(SharingError::NotFound)
        ));
        assert!(matches!(
            e.store().find_one(&created.id, HASH),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn past_deadline_is_not_found_without_deleting() {
        let (e, _dir) = make_engine();
        let past = now() - 60;
        let created = e
            .create_public_shared_secret(payload(Some(5), Some(past)))
            .unwrap();

        assert!(matches!(
            e.get_active_shared_secret_by_id_and_hashed_hex(&created.id, HASH),
            Err(SharingError::NotFound)
        ));
        let row = e.store().find_one(&created.id, HASH).unwrap();
        assert_eq!(row.expires_after_views, Some(5));
    }

    #[test]
    fn future_deadline_and_unlimited_views_stay_readable() {
        let (e, _dir) = make_engine();
        let created = e
            .create_public_shared_secret(payload(None, Some(now() + 3600)))
            .unwrap();
        for _ in 0..5 {
            let s = e
                .get_active_shared_secret_by_id_and_hashed_hex(&created.id, HASH)
                .unwrap();
            assert_eq!(s.expires_after_views, None);
        }
    }

    #[test]
    fn wrong_hash_looks_like_missing_id() {
        let (e, _dir) = make_engine();
        let created = e.create_public_shared_secret(payload(Some(1), None)).unwrap();

        let wrong_hash = e.get_active_shared_secret_by_id_and_hashed_hex(&created.id, "nope");
        let wrong_id = e.get_active_shared_secret_by_id_and_hashed_hex("ffff", HASH);
        assert_eq!(
            wrong_hash.unwrap_err().to_string(),
            wrong_id.unwrap_err().to_string()
        );

        // The failed attempt consumed nothing.
        assert!(e
            .get_active_shared_secret_by_id_and_hashed_hex(&created.id, HASH)
            .is_ok());
    }

    #[test]
    fn create_requires_membership() {
        let (e, _dir) = make_engine();
        let err = e
            .create_shared_secret(&ctx("mallory", "acme"), payload(None, None))
            .unwrap_err();
        assert!(matches!(err, SharingError::Unauthorized(_)));

        let mut scoped_elsewhere = ctx("alice", "acme");
        scoped_elsewhere.actor_org_id = Some("globex".into());
        assert!(matches!(
            e.create_shared_secret(&scoped_elsewhere, payload(None, None)),
            Err(SharingError::Unauthorized(_))
        ));

        assert!(e
            .store()
            .find(&SecretFilter::default(), SortSpec::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn create_binds_owner_and_org() {
        let (e, _dir) = make_engine();
        let created = e
            .create_shared_secret(&ctx("alice", "acme"), payload(Some(1), None))
            .unwrap();
        let row = e.store().find_one(&created.id, HASH).unwrap();
        assert_eq!(row.owner_user_id.as_deref(), Some("alice"));
        assert_eq!(row.organization_id.as_deref(), Some("acme"));
    }

    #[test]
    fn public_secret_has_no_owner() {
        let (e, _dir) = make_engine();
        let created = e.create_public_shared_secret(payload(None, None)).unwrap();
        let s = e
            .get_active_shared_secret_by_id_and_hashed_hex(&created.id, HASH)
            .unwrap();
        assert_eq!(s.owner_user_id, None);
        assert_eq!(s.organization_id, None);
    }

    #[test]
    fn invalid_payload_stores_nothing() {
        let (e, _dir) = make_engine();
        let mut empty_iv = payload(None, None);
        empty_iv.iv.clear();
        assert!(matches!(
            e.create_public_shared_secret(empty_iv),
            Err(SharingError::InvalidInput(_))
        ));

        let mut huge = payload(None, None);
        huge.encrypted_value = "x".repeat(MAX_ENCRYPTED_VALUE_LEN + 1);
        assert!(matches!(
            e.create_shared_secret(&ctx("alice", "acme"), huge),
            Err(SharingError::InvalidInput(_))
        ));

        assert!(e
            .store()
            .find(&SecretFilter::default(), SortSpec::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn list_returns_only_own_records_in_org_by_expiry() {
        let (e, _dir) = make_engine();
        let now = now();
        let alice = ctx("alice", "acme");

        let never = e.create_shared_secret(&alice, payload(None, None)).unwrap();
        let late = e
            .create_shared_secret(&alice, payload(None, Some(now + 7200)))
            .unwrap();
        let soon = e
            .create_shared_secret(&alice, payload(None, Some(now + 60)))
            .unwrap();
        e.create_shared_secret(&ctx("bob", "acme"), payload(None, Some(now + 10)))
            .unwrap();
        e.create_shared_secret(&ctx("alice", "globex"), payload(None, Some(now + 10)))
            .unwrap();
        e.create_public_shared_secret(payload(None, Some(now + 10)))
            .unwrap();

        let ids: Vec<_> = e
            .get_shared_secrets(&alice)
            .unwrap()
            .iter()
            .map(|s| s.id.clone())
            .collect();
        assert_eq!(ids, vec![soon.id, late.id, never.id]);
    }

    #[test]
    fn list_requires_membership() {
        let (e, _dir) = make_engine();
        assert!(matches!(
            e.get_shared_secrets(&ctx("mallory", "acme")),
            Err(SharingError::Unauthorized(_))
        ));
    }

    #[test]
    fn delete_is_owner_only() {
        let (e, _dir) = make_engine();
        let alice = ctx("alice", "acme");
        let created = e.create_shared_secret(&alice, payload(Some(4), None)).unwrap();

        assert!(matches!(
            e.delete_shared_secret_by_id(&ctx("bob", "acme"), &created.id),
            Err(SharingError::NotFound)
        ));
        assert!(matches!(
            e.delete_shared_secret_by_id(&ctx("alice", "globex"), &created.id),
            Err(SharingError::NotFound)
        ));
        assert!(matches!(
            e.delete_shared_secret_by_id(&ctx("mallory", "acme"), &created.id),
            Err(SharingError::Unauthorized(_))
        ));

        let deleted = e.delete_shared_secret_by_id(&alice, &created.id).unwrap();
        assert_eq!(deleted.id, created.id);
        assert_eq!(deleted.expires_after_views, Some(4));
        assert!(matches!(
            e.delete_shared_secret_by_id(&alice, &created.id),
            Err(SharingError::NotFound)
        ));
    }

    struct BrokenStore;

    impl SecretStore for BrokenStore {
        fn create(&self, _: NewSharedSecret) -> std::result::Result<SharedSecret, StoreError> {
            Err(StoreError::Corrupt("disk on fire"))
        }
        fn find(
            &self,
            _: &SecretFilter,
            _: SortSpec,
        ) -> std::result::Result<Vec<SharedSecret>, StoreError> {
            Err(StoreError::Corrupt("disk on fire"))
        }
        fn find_one(&self, _: &str, _: &str) -> std::result::Result<SharedSecret, StoreError> {
            Err(StoreError::Corrupt("disk on fire"))
        }
        fn delete_by_id(&self, _: &str) -> std::result::Result<SharedSecret, StoreError> {
            Err(StoreError::Corrupt("disk on fire"))
        }
        fn decrement_views_by_id(
            &self,
            _: &str,
            _: u32,
        ) -> std::result::Result<Option<u32>, StoreError> {
            Err(StoreError::Corrupt("disk on fire"))
        }
    }

    struct BrokenGate;

    impl PermissionService for BrokenGate {
        fn get_org_permission(
            &self,
            _: ActorType,
            _: &str,
            _: &str,
            _: Option<&str>,
            _: Option<&str>,
        ) -> std::result::Result<Option<OrgPermission>, PolicyError> {
            Err(PolicyError::Io(std::io::Error::other("membership source down")))
        }
    }

    #[test]
    fn store_failures_propagate_unmasked() {
        let e = SharingEngine::new(Arc::new(BrokenStore), Arc::new(MembershipGate::new()));
        assert!(matches!(
            e.create_public_shared_secret(payload(None, None)),
            Err(SharingError::Store(StoreError::Corrupt(_)))
        ));
        assert!(matches!(
            e.get_active_shared_secret_by_id_and_hashed_hex("id", HASH),
            Err(SharingError::Store(_))
        ));
    }

    #[test]
    fn gate_failures_propagate() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        let e = SharingEngine::new(Arc::new(store), Arc::new(BrokenGate));
        assert!(matches!(
            e.get_shared_secrets(&ctx("alice", "acme")),
            Err(SharingError::Policy(_))
        ));
    }
}
