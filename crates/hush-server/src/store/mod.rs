pub mod db;
pub mod model;

pub use db::{Store, DEFAULT_SWEEP_INTERVAL};
pub use model::{
    CreatedSecret, NewSharedSecret, SecretFilter, SharedSecret, SortKey, SortOrder, SortSpec,
};

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::StoreError;

/// Current unix time in seconds, the unit of `expires_at` and `created_at`.
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Durable keyed storage for shared secrets.
///
/// `decrement_views_by_id` is the only mutation of an existing record and
/// must be atomic against every other caller targeting the same id.
pub trait SecretStore: Send + Sync {
    /// Persist a new record with a freshly generated id.
    fn create(&self, record: NewSharedSecret) -> Result<SharedSecret, StoreError>;

    /// All records matching `filter`, ordered by `sort`.
    fn find(&self, filter: &SecretFilter, sort: SortSpec) -> Result<Vec<SharedSecret>, StoreError>;

    /// The record with exactly this `id` and `lookup_hash`, or `StoreError::NotFound`.
    fn find_one(&self, id: &str, lookup_hash: &str) -> Result<SharedSecret, StoreError>;

    /// Remove a record and return its last stored state.
    fn delete_by_id(&self, id: &str) -> Result<SharedSecret, StoreError>;

    /// Subtract `amount` from the view counter if at least `amount` views remain.
    /// Returns the remaining count when applied, `None` when the record is gone,
    /// has no view limit, or has too few views left. Nothing is written in the
    /// `None` case.
    fn decrement_views_by_id(&self, id: &str, amount: u32) -> Result<Option<u32>, StoreError>;
}
