//! Canonical period persistence + HTTP fetch utilities.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use adspend_core::{CanonicalAdPeriod, DateWindow, PeriodKey};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

mod http;
mod pg;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchedResponse, HttpClientConfig,
    HttpError, HttpFetcher, RetryDisposition,
};
pub use pg::PgPeriodStore;

pub const CRATE_NAME: &str = "adspend-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt stored row {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
    Stale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub stale: usize,
}

impl UpsertSummary {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
            UpsertOutcome::Stale => self.stale += 1,
        }
    }

    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeriodQuery {
    pub ad_id: Option<String>,
    pub window: Option<DateWindow>,
}

impl PeriodQuery {
    pub fn for_ad(ad_id: impl Into<String>) -> Self {
        Self {
            ad_id: Some(ad_id.into()),
            window: None,
        }
    }

    pub fn matches(&self, period: &CanonicalAdPeriod) -> bool {
        if let Some(ad_id) = &self.ad_id {
            if period.ad_id() != ad_id {
                return false;
            }
        }
        if let Some(window) = &self.window {
            if period.reporting_ends() < window.start || period.reporting_starts() > window.end {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self {
            offset: 0,
            limit: limit.max(1),
        }
    }

    pub fn next(self) -> Self {
        Self {
            offset: self.offset + self.limit,
            limit: self.limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetScope {
    All,
    Ad(String),
}

/// Keyed store of canonical periods with full-row upsert semantics.
///
/// Implementations guarantee at most one row per `PeriodKey`. An incoming row
/// replaces the stored one only when it was fetched at the same time or later.
/// `list` returns rows ordered by key; callers must page until a short page.
#[async_trait]
pub trait PeriodStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn upsert_many(&self, periods: &[CanonicalAdPeriod]) -> Result<UpsertSummary, StoreError>;

    async fn list(
        &self,
        query: &PeriodQuery,
        page: PageRequest,
    ) -> Result<Vec<CanonicalAdPeriod>, StoreError>;

    async fn reset(&self, scope: &ResetScope) -> Result<usize, StoreError>;
}

pub async fn load_all_periods(
    store: &dyn PeriodStore,
    query: &PeriodQuery,
    page_size: usize,
) -> Result<Vec<CanonicalAdPeriod>, StoreError> {
    let mut page = PageRequest::first(page_size);
    let mut out = Vec::new();
    loop {
        let rows = store.list(query, page).await?;
        let short = rows.len() < page.limit;
        out.extend(rows);
        if short {
            break;
        }
        page = page.next();
    }
    Ok(out)
}

fn apply_upsert(
    rows: &mut BTreeMap<PeriodKey, CanonicalAdPeriod>,
    period: &CanonicalAdPeriod,
) -> UpsertOutcome {
    match rows.get_mut(&period.key) {
        None => {
            rows.insert(period.key.clone(), period.clone());
            UpsertOutcome::Inserted
        }
        Some(existing) if existing == period => UpsertOutcome::Unchanged,
        Some(existing) if existing.provenance.fetched_at > period.provenance.fetched_at => {
            UpsertOutcome::Stale
        }
        Some(existing) => {
            *existing = period.clone();
            UpsertOutcome::Updated
        }
    }
}

fn page_of(
    rows: &BTreeMap<PeriodKey, CanonicalAdPeriod>,
    query: &PeriodQuery,
    page: PageRequest,
) -> Vec<CanonicalAdPeriod> {
    rows.values()
        .filter(|p| query.matches(p))
        .skip(page.offset)
        .take(page.limit)
        .cloned()
        .collect()
}

fn reset_rows(rows: &mut BTreeMap<PeriodKey, CanonicalAdPeriod>, scope: &ResetScope) -> usize {
    let before = rows.len();
    match scope {
        ResetScope::All => rows.clear(),
        ResetScope::Ad(ad_id) => rows.retain(|key, _| &key.ad_id != ad_id),
    }
    before - rows.len()
}

#[derive(Debug, Default)]
pub struct MemoryPeriodStore {
    rows: Mutex<BTreeMap<PeriodKey, CanonicalAdPeriod>>,
}

impl MemoryPeriodStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl PeriodStore for MemoryPeriodStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn upsert_many(&self, periods: &[CanonicalAdPeriod]) -> Result<UpsertSummary, StoreError> {
        let mut rows = self.rows.lock().await;
        let mut summary = UpsertSummary::default();
        for period in periods {
            summary.record(apply_upsert(&mut rows, period));
        }
        Ok(summary)
    }

    async fn list(
        &self,
        query: &PeriodQuery,
        page: PageRequest,
    ) -> Result<Vec<CanonicalAdPeriod>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(page_of(&rows, query, page))
    }

    async fn reset(&self, scope: &ResetScope) -> Result<usize, StoreError> {
        let mut rows = self.rows.lock().await;
        Ok(reset_rows(&mut rows, scope))
    }
}

/// JSON snapshot store under a state directory, rewritten atomically via
/// temp-file rename after every mutation.
#[derive(Debug)]
pub struct FilePeriodStore {
    path: PathBuf,
    rows: Mutex<BTreeMap<PeriodKey, CanonicalAdPeriod>>,
}

impl FilePeriodStore {
    pub const FILE_NAME: &'static str = "ad_periods.json";

    pub async fn open(state_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let state_dir = state_dir.into();
        fs::create_dir_all(&state_dir)
            .await
            .map_err(|e| StoreError::io(&state_dir, e))?;
        let path = state_dir.join(Self::FILE_NAME);

        let mut rows = BTreeMap::new();
        let exists = fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        if exists {
            let text = fs::read_to_string(&path)
                .await
                .map_err(|e| StoreError::io(&path, e))?;
            let periods: Vec<CanonicalAdPeriod> = serde_json::from_str(&text)?;
            for period in periods {
                rows.insert(period.key.clone(), period);
            }
        }
        debug!(path = %path.display(), rows = rows.len(), "opened file period store");

        Ok(Self {
            path,
            rows: Mutex::new(rows),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub async fn content_hash(&self) -> Result<String, StoreError> {
        let rows = self.rows.lock().await;
        let bytes = Self::snapshot_bytes(&rows)?;
        Ok(Self::sha256_hex(&bytes))
    }

    fn snapshot_bytes(rows: &BTreeMap<PeriodKey, CanonicalAdPeriod>) -> Result<Vec<u8>, StoreError> {
        let periods: Vec<&CanonicalAdPeriod> = rows.values().collect();
        Ok(serde_json::to_vec_pretty(&periods)?)
    }

    async fn persist(&self, rows: &BTreeMap<PeriodKey, CanonicalAdPeriod>) -> Result<(), StoreError> {
        let bytes = Self::snapshot_bytes(rows)?;
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;
        file.flush()
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io(&self.path, err));
        }
        Ok(())
    }
}

#[async_trait]
impl PeriodStore for FilePeriodStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn upsert_many(&self, periods: &[CanonicalAdPeriod]) -> Result<UpsertSummary, StoreError> {
        let mut rows = self.rows.lock().await;
        let mut staged = rows.clone();
        let mut summary = UpsertSummary::default();
        for period in periods {
            summary.record(apply_upsert(&mut staged, period));
        }
        if summary.written() > 0 {
            self.persist(&staged).await?;
            *rows = staged;
        }
        Ok(summary)
    }

    async fn list(
        &self,
        query: &PeriodQuery,
        page: PageRequest,
    ) -> Result<Vec<CanonicalAdPeriod>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(page_of(&rows, query, page))
    }

    async fn reset(&self, scope: &ResetScope) -> Result<usize, StoreError> {
        let mut rows = self.rows.lock().await;
        let mut staged = rows.clone();
        let removed = reset_rows(&mut staged, scope);
        self.persist(&staged).await?;
        *rows = staged;
        Ok(removed)
    }
}
