use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use constant_time_eq::constant_time_eq;
use redb::{Database, ReadableTable, TableDefinition};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use super::model::{NewSharedSecret, SecretFilter, SharedSecret, SortSpec};
use super::{now, SecretStore};
use crate::error::StoreError;

const SHARED_SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("shared_secrets");

/// Sweep period used when none (or zero) is configured.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Leading byte of every encoded record: `[RECORD_V1_MARKER] + bincode(record)`.
const RECORD_V1_MARKER: u8 = 0x01;

/// Thread-safe handle to the redb store.
///
/// redb admits one write transaction at a time, so every read-modify-write
/// done inside a single `begin_write` is atomic with respect to other callers.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = Database::create(path)?;

        // Ensure the table exists so read transactions never miss it.
        let write_txn = db.begin_write()?;
        write_txn.open_table(SHARED_SECRETS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Remove every record that is past its deadline or out of views.
    /// Returns the ids of removed records.
    pub fn prune_expired(&self, now: i64) -> Result<Vec<String>, StoreError> {
        // Collect dead ids in a read pass first.
        let dead_ids: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SHARED_SECRETS)?;
            let mut ids = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                let record = decode(v.value())?;
                if record.is_expired(now) || record.is_exhausted() {
                    ids.push(k.value().to_owned());
                }
            }
            ids
        };

        if dead_ids.is_empty() {
            return Ok(vec![]);
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SHARED_SECRETS)?;
            for id in &dead_ids {
                table.remove(id.as_str())?;
            }
        }
        write_txn.commit()?;

        info!(removed = dead_ids.len(), "pruned expired shared secrets");
        Ok(dead_ids)
    }

    /// Spawn a background Tokio task that calls `prune_expired()` every `interval`.
    /// A zero interval falls back to `DEFAULT_SWEEP_INTERVAL`.
    pub fn spawn_sweep(self, interval: Duration) -> JoinHandle<()> {
        let interval = if interval.is_zero() {
            warn!(
                fallback_secs = DEFAULT_SWEEP_INTERVAL.as_secs(),
                "sweep interval must be non-zero; using default"
            );
            DEFAULT_SWEEP_INTERVAL
        } else {
            interval
        };
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                if let Err(e) = self.prune_expired(now()) {
                    warn!(error = %e, "background sweep error");
                }
            }
        })
    }
}

impl SecretStore for Store {
    fn create(&self, new: NewSharedSecret) -> Result<SharedSecret, StoreError> {
        let record = SharedSecret {
            id: generate_id(),
            owner_user_id: new.owner_user_id,
            organization_id: new.organization_id,
            encrypted_value: new.encrypted_value,
            iv: new.iv,
            auth_tag: new.auth_tag,
            lookup_hash: new.lookup_hash,
            expires_at: new.expires_at,
            expires_after_views: new.expires_after_views,
            created_at: now(),
        };

        let bytes = encode(&record)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SHARED_SECRETS)?;
            table.insert(record.id.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;

        debug!(id = %record.id, "stored shared secret");
        Ok(record)
    }

    fn find(&self, filter: &SecretFilter, sort: SortSpec) -> Result<Vec<SharedSecret>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SHARED_SECRETS)?;

        let mut records = Vec::new();
        for item in table.iter()? {
            let (_k, v) = item?;
            let record = decode(v.value())?;
            if filter.matches(&record) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| sort.compare(a, b));
        Ok(records)
    }

    fn find_one(&self, id: &str, lookup_hash: &str) -> Result<SharedSecret, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SHARED_SECRETS)?;

        let raw_bytes: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());
        let record = match raw_bytes {
            Some(bytes) => decode(&bytes)?,
            None => return Err(StoreError::NotFound),
        };

        if !constant_time_eq(record.lookup_hash.as_bytes(), lookup_hash.as_bytes()) {
            return Err(StoreError::NotFound);
        }
        Ok(record)
    }

    fn delete_by_id(&self, id: &str) -> Result<SharedSecret, StoreError> {
        let write_txn = self.db.begin_write()?;
        let removed: Option<Vec<u8>> = {
            let mut table = write_txn.open_table(SHARED_SECRETS)?;
            // Copy the guard value out so the borrow on `table` ends here.
            let removed = table.remove(id)?.map(|guard| guard.value().to_vec());
            removed
        };
        write_txn.commit()?;

        match removed {
            Some(bytes) => {
                debug!(id = %id, "deleted shared secret");
                decode(&bytes)
            }
            None => Err(StoreError::NotFound),
        }
    }

    fn decrement_views_by_id(&self, id: &str, amount: u32) -> Result<Option<u32>, StoreError> {
        // Read and write happen inside one write transaction. An early return
        // drops `write_txn` uncommitted, which aborts it.
        let write_txn = self.db.begin_write()?;
        let remaining = {
            let mut table = write_txn.open_table(SHARED_SECRETS)?;

            let raw_bytes: Option<Vec<u8>> =
                table.get(id)?.map(|guard| guard.value().to_vec());

            match raw_bytes {
                None => None,
                Some(bytes) => {
                    let mut record = decode(&bytes)?;
                    match record.expires_after_views {
                        Some(views) if views >= amount => {
                            let left = views - amount;
                            record.expires_after_views = Some(left);
                            let updated = encode(&record)?;
                            table.insert(id, updated.as_slice())?;
                            Some(left)
                        }
                        _ => None,
                    }
                }
            }
        };
        write_txn.commit()?;

        if let Some(left) = remaining {
            debug!(id = %id, remaining = left, "decremented views");
        }
        Ok(remaining)
    }
}

/// 16 random bytes, hex encoded.
fn generate_id() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

fn encode(record: &SharedSecret) -> Result<Vec<u8>, StoreError> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_V1_MARKER);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode(bytes: &[u8]) -> Result<SharedSecret, StoreError> {
    match bytes.split_first() {
        Some((&RECORD_V1_MARKER, payload)) => {
            let (record, _) =
                bincode::serde::decode_from_slice(payload, bincode::config::standard())?;
            Ok(record)
        }
        Some(_) => Err(StoreError::Corrupt("unknown record marker")),
        None => Err(StoreError::Corrupt("empty record")),
    }
}
