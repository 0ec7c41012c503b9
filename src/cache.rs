use crate::error::Result;
use crate::job::Job;
use crate::store::{JobStore, StoreKey};

/// Outcome of a dedup lookup.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    /// A successful earlier run of the same content
    Hit(Job),
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }
}

/// Look `job` up by content hash. Sets the hash on the job.
///
/// Only records that completed successfully count. Any task with
/// `force_recompute` makes this a miss.
pub async fn lookup(job: &mut Job, store: &dyn JobStore) -> Result<CacheLookup> {
    let hash = job.ensure_hash()?;
    if job.force_recompute() {
        tracing::debug!(job = %job.name, hash = %hash, "Recompute forced, skipping cache");
        return Ok(CacheLookup::Miss);
    }
    match store.get(&StoreKey::Hash(hash.clone())).await? {
        Some(record) if record.is_success() => {
            tracing::info!(
                job = %job.name,
                hash = %hash,
                store_id = ?record.store_id,
                "Found completed job in store"
            );
            Ok(CacheLookup::Hit(record))
        }
        Some(record) => {
            tracing::debug!(job = %job.name, status = %record.status, "Stored job did not succeed");
            Ok(CacheLookup::Miss)
        }
        None => Ok(CacheLookup::Miss),
    }
}

/// Persist the job under its hash and record the store id on it.
pub async fn record(job: &mut Job, store: &dyn JobStore) -> Result<u64> {
    job.ensure_hash()?;
    let id = store.upsert_by_hash(job).await?;
    job.store_id = Some(id);
    Ok(id)
}
