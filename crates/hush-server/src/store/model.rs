use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

/// Stored in redb as bincode-encoded bytes.
/// `encrypted_value`, `iv` and `auth_tag` come from the client's own
/// encryption step and are stored and returned verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SharedSecret {
    /// 32 hex chars, assigned by the store.
    pub id: String,
    /// Absent for anonymously shared secrets.
    pub owner_user_id: Option<String>,
    pub organization_id: Option<String>,
    pub encrypted_value: String,
    pub iv: String,
    pub auth_tag: String,
    /// Second credential required next to `id` to read the secret.
    pub lookup_hash: String,
    /// Unix timestamp (seconds) after which the secret is dead.
    pub expires_at: Option<i64>,
    /// Views left. `None` means unlimited.
    pub expires_after_views: Option<u32>,
    /// Unix timestamp (seconds).
    pub created_at: i64,
}

impl SharedSecret {
    /// True once `expires_at` lies strictly before `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(exp) if exp < now)
    }

    /// True when a view limit exists and no views remain.
    pub fn is_exhausted(&self) -> bool {
        self.expires_after_views == Some(0)
    }
}

/// Input to `SecretStore::create`. The store fills in `id` and `created_at`.
#[derive(Debug, Clone, Default)]
pub struct NewSharedSecret {
    pub owner_user_id: Option<String>,
    pub organization_id: Option<String>,
    pub encrypted_value: String,
    pub iv: String,
    pub auth_tag: String,
    pub lookup_hash: String,
    pub expires_at: Option<i64>,
    pub expires_after_views: Option<u32>,
}

/// Equality filter for `SecretStore::find`. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct SecretFilter {
    pub id: Option<String>,
    pub owner_user_id: Option<String>,
    pub organization_id: Option<String>,
}

impl SecretFilter {
    pub fn owned_by(owner_user_id: &str, organization_id: &str) -> Self {
        Self {
            id: None,
            owner_user_id: Some(owner_user_id.to_owned()),
            organization_id: Some(organization_id.to_owned()),
        }
    }

    pub fn matches(&self, record: &SharedSecret) -> bool {
        fn eq(want: &Option<String>, have: Option<&str>) -> bool {
            match want {
                Some(w) => have == Some(w.as_str()),
                None => true,
            }
        }
        eq(&self.id, Some(record.id.as_str()))
            && eq(&self.owner_user_id, record.owner_user_id.as_deref())
            && eq(&self.organization_id, record.organization_id.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    ExpiresAt,
    CreatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SortSpec {
    pub key: SortKey,
    pub order: SortOrder,
}

impl SortSpec {
    pub fn expires_at_asc() -> Self {
        Self {
            key: SortKey::ExpiresAt,
            order: SortOrder::Asc,
        }
    }

    /// Orders two records by this spec. A missing `expires_at` counts as
    /// infinitely far away. Ties fall back to `created_at`, then `id`.
    pub fn compare(&self, a: &SharedSecret, b: &SharedSecret) -> Ordering {
        let primary = match self.key {
            SortKey::ExpiresAt => {
                let ea = a.expires_at.unwrap_or(i64::MAX);
                let eb = b.expires_at.unwrap_or(i64::MAX);
                ea.cmp(&eb)
            }
            SortKey::CreatedAt => a.created_at.cmp(&b.created_at),
        };
        let ordered = primary
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id));
        match self.order {
            SortOrder::Asc => ordered,
            SortOrder::Desc => ordered.reverse(),
        }
    }
}

/// Returned to creators; never echoes payload or credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedSecret {
    pub id: String,
}
