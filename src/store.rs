//! Persisted job records.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::error::{Result, RunError};
use crate::job::Job;

const DEFAULT_MAX_JOBS: usize = 100_000;

/// Identity of the process-wide in-memory store.
pub const MEMORY_STORE: &str = ":memory:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKey {
    Id(u64),
    Hash(String),
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKey::Id(id) => write!(f, "id {id}"),
            StoreKey::Hash(hash) => write!(f, "hash {hash}"),
        }
    }
}

/// Storage of job records. A missing record is `Ok(None)`, never an error.
#[async_trait]
pub trait JobStore: Send + Sync {
    fn identity(&self) -> &str;

    /// Insert a new record and return its id.
    async fn add(&self, job: &Job) -> Result<u64>;

    /// Replace the record named by `job.store_id`.
    async fn update(&self, job: &Job) -> Result<()>;

    async fn get(&self, key: &StoreKey) -> Result<Option<Job>>;

    /// Update the record with the same hash, or insert one. Atomic with
    /// respect to other callers of the same store.
    async fn upsert_by_hash(&self, job: &Job) -> Result<u64>;
}

/// Record table shared by the store implementations.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    next_id: u64,
    jobs: BTreeMap<u64, Job>,
    #[serde(skip)]
    by_hash: HashMap<String, u64>,
}

impl StoreState {
    fn reindex(&mut self) {
        self.by_hash = self
            .jobs
            .iter()
            .filter_map(|(id, job)| job.hash.clone().map(|h| (h, *id)))
            .collect();
    }

    fn add(&mut self, job: &Job, max_jobs: usize) -> Result<u64> {
        if self.jobs.len() >= max_jobs {
            return Err(RunError::Store(format!(
                "store is full ({max_jobs} records)"
            )));
        }
        self.next_id += 1;
        let id = self.next_id;
        let mut record = job.clone();
        record.store_id = Some(id);
        if let Some(hash) = &record.hash {
            self.by_hash.insert(hash.clone(), id);
        }
        self.jobs.insert(id, record);
        Ok(id)
    }

    fn update(&mut self, job: &Job) -> Result<()> {
        let Some(id) = job.store_id else {
            return Err(RunError::Store(format!(
                "job {} has no store id",
                job.name
            )));
        };
        let Some(slot) = self.jobs.get_mut(&id) else {
            return Err(RunError::JobNotFound(StoreKey::Id(id).to_string()));
        };
        *slot = job.clone();
        if let Some(hash) = &job.hash {
            self.by_hash.insert(hash.clone(), id);
        }
        Ok(())
    }

    fn get(&self, key: &StoreKey) -> Option<Job> {
        let id = match key {
            StoreKey::Id(id) => *id,
            StoreKey::Hash(hash) => *self.by_hash.get(hash)?,
        };
        self.jobs.get(&id).cloned()
    }

    fn upsert(&mut self, job: &Job, max_jobs: usize) -> Result<u64> {
        let Some(hash) = &job.hash else {
            return Err(RunError::Store(format!(
                "job {} has no hash to upsert by",
                job.name
            )));
        };
        match self.by_hash.get(hash).copied() {
            Some(id) => {
                let mut record = job.clone();
                record.store_id = Some(id);
                self.jobs.insert(id, record);
                Ok(id)
            }
            None => self.add(job, max_jobs),
        }
    }
}

/// Store held in memory for the lifetime of the process.
#[derive(Debug)]
pub struct MemoryJobStore {
    identity: String,
    state: RwLock<StoreState>,
    max_jobs: usize,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            identity: MEMORY_STORE.to_string(),
            state: RwLock::new(StoreState::default()),
            max_jobs,
        }
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn add(&self, job: &Job) -> Result<u64> {
        self.state.write().await.add(job, self.max_jobs)
    }

    async fn update(&self, job: &Job) -> Result<()> {
        self.state.write().await.update(job)
    }

    async fn get(&self, key: &StoreKey) -> Result<Option<Job>> {
        Ok(self.state.read().await.get(key))
    }

    async fn upsert_by_hash(&self, job: &Job) -> Result<u64> {
        self.state.write().await.upsert(job, self.max_jobs)
    }
}

/// Store kept in one JSON document. Every write replaces the document
/// through a temporary file and a rename.
#[derive(Debug)]
pub struct FileJobStore {
    identity: String,
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl FileJobStore {
    /// Open the document at `path`, starting empty when it does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut state = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => StoreState::default(),
            Ok(bytes) => serde_json::from_slice::<StoreState>(&bytes).map_err(|e| {
                RunError::Store(format!("cannot read {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => return Err(e.into()),
        };
        state.reindex();
        tracing::debug!(path = %path.display(), records = state.jobs.len(), "Opened job store");
        Ok(Self {
            identity: path.display().to_string(),
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, state: &StoreState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let bytes = serde_json::to_vec_pretty(state)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn add(&self, job: &Job) -> Result<u64> {
        let mut state = self.state.lock().await;
        let id = state.add(job, DEFAULT_MAX_JOBS)?;
        self.persist(&state).await?;
        Ok(id)
    }

    async fn update(&self, job: &Job) -> Result<()> {
        let mut state = self.state.lock().await;
        state.update(job)?;
        self.persist(&state).await
    }

    async fn get(&self, key: &StoreKey) -> Result<Option<Job>> {
        Ok(self.state.lock().await.get(key))
    }

    async fn upsert_by_hash(&self, job: &Job) -> Result<u64> {
        let mut state = self.state.lock().await;
        let id = state.upsert(job, DEFAULT_MAX_JOBS)?;
        self.persist(&state).await?;
        Ok(id)
    }
}

/// Stores opened by identity, shared by every caller in the process.
#[derive(Default)]
pub struct StoreRegistry {
    stores: Mutex<HashMap<String, Arc<dyn JobStore>>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `store` the one returned for `identity`.
    pub async fn register(&self, identity: impl Into<String>, store: Arc<dyn JobStore>) {
        self.stores.lock().await.insert(identity.into(), store);
    }

    /// Return the store named `identity`, opening it on first use.
    /// `None` and `:memory:` name the in-memory store.
    pub async fn open(&self, identity: Option<&str>) -> Result<Arc<dyn JobStore>> {
        let key = identity.unwrap_or(MEMORY_STORE).to_string();
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(&key) {
            return Ok(store.clone());
        }
        let store: Arc<dyn JobStore> = if key == MEMORY_STORE {
            Arc::new(MemoryJobStore::new())
        } else {
            Arc::new(FileJobStore::open(&key).await?)
        };
        stores.insert(key, store.clone());
        Ok(store)
    }
}
