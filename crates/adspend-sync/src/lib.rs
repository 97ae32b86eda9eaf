//! Sync orchestration: platform registry, reporting windows, the
//! fetch → reconcile → upsert pipeline, run reports and the scheduler.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use adspend_adapters::{
    FetchError, FetchRequest, FixturePerformanceSource, HttpPerformanceSource, IncomingRow,
    PageCursor, PaginationError, PaginationIncompleteError, PerformanceSource,
};
use adspend_core::{CanonicalAdPeriod, CoverageGap, DateWindow, WeeklyPeriodSet};
use adspend_storage::{
    load_all_periods, BackoffPolicy, FilePeriodStore, HttpClientConfig, HttpFetcher, PeriodQuery,
    PeriodStore, PgPeriodStore,
};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod category;
pub mod dashboard;
pub mod momentum;
pub mod reconcile;
pub mod report;
pub mod window;

pub use category::CategoryNormalizer;
pub use dashboard::{dashboard_records, report_momentum_markdown, AdDashboardRecord, DashboardFilter};
pub use momentum::{compute_momentum, momentum_all, MOMENTUM_PCT_CAP};
pub use reconcile::{OverlapConflict, ReconcileStats, Reconciliation, ReconciliationEngine, RejectedRow};
pub use window::{reporting_window, DEFAULT_REPORTING_TZ};

pub const CRATE_NAME: &str = "adspend-sync";

pub const STORE_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Fixture,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformRegistry {
    pub platforms: Vec<PlatformConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    pub platform_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub mode: SourceMode,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_page_size() -> usize {
    500
}

fn default_lookback_days() -> u32 {
    14
}

impl PlatformRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn get(&self, platform_id: &str) -> Option<&PlatformConfig> {
        self.platforms.iter().find(|p| p.platform_id == platform_id)
    }

    pub fn select(&self, only: &[String]) -> Result<Vec<PlatformConfig>> {
        for wanted in only {
            if self.get(wanted).is_none() {
                bail!("unknown platform {wanted:?}");
            }
        }
        Ok(self
            .platforms
            .iter()
            .filter(|p| p.enabled)
            .filter(|p| only.is_empty() || only.contains(&p.platform_id))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub state_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub reporting_tz: Tz,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub resume_attempts: usize,
    pub backoff: BackoffPolicy,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let workspace_root = root.into();
        Self {
            database_url: None,
            state_dir: workspace_root.join("state"),
            reports_dir: workspace_root.join("reports"),
            reporting_tz: DEFAULT_REPORTING_TZ,
            scheduler_enabled: false,
            sync_cron: "0 0 7 * * *".to_string(),
            user_agent: "adspend-sync/0.1".to_string(),
            http_timeout_secs: 20,
            resume_attempts: 2,
            backoff: BackoffPolicy::default(),
            workspace_root,
        }
    }

    pub fn from_env() -> Result<Self> {
        let root = std::env::var("ADSPEND_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let mut config = Self::for_workspace(root);
        config.database_url = std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());
        if let Ok(dir) = std::env::var("ADSPEND_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("ADSPEND_REPORTS_DIR") {
            config.reports_dir = PathBuf::from(dir);
        }
        if let Ok(name) = std::env::var("ADSPEND_REPORTING_TZ") {
            config.reporting_tz = window::parse_timezone(&name)?;
        }
        config.scheduler_enabled = std::env::var("ADSPEND_SCHEDULER_ENABLED")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false);
        if let Ok(cron) = std::env::var("SYNC_CRON") {
            config.sync_cron = cron;
        }
        if let Ok(agent) = std::env::var("ADSPEND_USER_AGENT") {
            config.user_agent = agent;
        }
        if let Some(secs) = std::env::var("ADSPEND_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.http_timeout_secs = secs;
        }
        if let Some(attempts) = std::env::var("ADSPEND_RESUME_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.resume_attempts = attempts;
        }
        Ok(config)
    }
}

pub async fn open_store(config: &SyncConfig) -> Result<Arc<dyn PeriodStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgPeriodStore::connect(url)
                .await
                .context("connecting to postgres")?;
            Ok(Arc::new(store))
        }
        None => {
            let store = FilePeriodStore::open(config.state_dir.clone())
                .await
                .with_context(|| format!("opening state dir {}", config.state_dir.display()))?;
            Ok(Arc::new(store))
        }
    }
}

/// Per-key async mutexes. Holding the guard serializes read-reconcile-write
/// for one ad across concurrent platform tasks.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let lock = {
            let mut locks = self.entries();
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        KeyGuard {
            locks: self,
            key: key.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases the key on drop and forgets it once nobody else holds or awaits it.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.entries();
        let idle = locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(&self.key);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRange {
    pub platform_id: String,
    pub window: DateWindow,
    pub offset: usize,
    pub page_size: usize,
    pub attempts: usize,
    pub error: String,
}

impl From<&FetchError> for FailedRange {
    fn from(err: &FetchError) -> Self {
        Self {
            platform_id: err.platform_id.clone(),
            window: err.window,
            offset: err.offset,
            page_size: err.page_size,
            attempts: err.attempts,
            error: err.source.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedAd {
    pub platform_id: String,
    pub ad_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformOutcome {
    pub platform_id: String,
    pub window: DateWindow,
    pub start_offset: usize,
    pub rows_fetched: usize,
    pub page_requests: usize,
    pub stats: ReconcileStats,
    pub changed: Vec<CanonicalAdPeriod>,
    pub gaps: Vec<CoverageGap>,
    pub conflicts: Vec<OverlapConflict>,
    pub rejected: Vec<RejectedRow>,
    pub failed_ads: Vec<FailedAd>,
    pub failed_range: Option<FailedRange>,
    pub incomplete: Option<PaginationIncompleteError>,
}

impl PlatformOutcome {
    fn new(request: &FetchRequest, start_offset: usize) -> Self {
        Self {
            platform_id: request.platform_id.clone(),
            window: request.window,
            start_offset,
            rows_fetched: 0,
            page_requests: 0,
            stats: ReconcileStats::default(),
            changed: Vec::new(),
            gaps: Vec::new(),
            conflicts: Vec::new(),
            rejected: Vec::new(),
            failed_ads: Vec::new(),
            failed_range: None,
            incomplete: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed_range.is_none() && self.incomplete.is_none() && self.failed_ads.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub window: Option<DateWindow>,
    pub platforms: Vec<String>,
    pub page_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub resumed_from: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub platforms: Vec<PlatformOutcome>,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

impl SyncRunSummary {
    pub fn totals(&self) -> ReconcileStats {
        let mut totals = ReconcileStats::default();
        for platform in &self.platforms {
            totals.absorb(&platform.stats);
        }
        totals
    }

    pub fn rows_fetched(&self) -> usize {
        self.platforms.iter().map(|p| p.rows_fetched).sum()
    }

    pub fn gaps(&self) -> Vec<CoverageGap> {
        let unique: BTreeSet<(String, chrono::NaiveDate, chrono::NaiveDate)> = self
            .platforms
            .iter()
            .flat_map(|p| p.gaps.iter())
            .map(|g| (g.ad_id.clone(), g.previous_end, g.next_start))
            .collect();
        unique
            .into_iter()
            .map(|(ad_id, previous_end, next_start)| CoverageGap {
                ad_id,
                previous_end,
                next_start,
            })
            .collect()
    }

    pub fn failed_ranges(&self) -> Vec<FailedRange> {
        self.platforms
            .iter()
            .filter_map(|p| p.failed_range.clone())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.platforms.iter().all(PlatformOutcome::is_complete)
    }
}

struct PlatformJob {
    source: Arc<dyn PerformanceSource>,
    request: FetchRequest,
    start_offset: usize,
}

#[derive(Clone)]
struct PlatformWorker {
    store: Arc<dyn PeriodStore>,
    engine: Arc<ReconciliationEngine>,
    locks: Arc<KeyedLocks>,
    backoff: BackoffPolicy,
    resume_attempts: usize,
    run_id: Uuid,
}

impl PlatformWorker {
    async fn run(self, job: PlatformJob) -> PlatformOutcome {
        let span = info_span!(
            "platform_sync",
            run_id = %self.run_id,
            platform_id = %job.request.platform_id,
            window = %job.request.window
        );
        self.drive(job).instrument(span).await
    }

    async fn drive(&self, job: PlatformJob) -> PlatformOutcome {
        let mut outcome = PlatformOutcome::new(&job.request, job.start_offset);
        let mut cursor = PageCursor::new(job.source, job.request, self.run_id)
            .with_backoff(self.backoff)
            .starting_at(job.start_offset);
        let mut touched = BTreeSet::new();
        let mut resumes = 0usize;

        loop {
            match cursor.next_page().await {
                Ok(Some(page)) => {
                    outcome.rows_fetched += page.rows.len();
                    self.apply_page(page.rows, &mut outcome, &mut touched).await;
                }
                Ok(None) => break,
                Err(PaginationError::Fetch(err)) if resumes < self.resume_attempts => {
                    resumes += 1;
                    warn!(offset = err.offset, resume = resumes, error = %err, "resuming failed page range");
                }
                Err(PaginationError::Fetch(err)) => {
                    warn!(offset = err.offset, error = %err, "page range failed; recorded for resume");
                    outcome.failed_range = Some(FailedRange::from(&err));
                    break;
                }
                Err(PaginationError::Incomplete(err)) => {
                    warn!(expected = err.expected, received = err.received, "pagination incomplete");
                    outcome.incomplete = Some(err);
                    break;
                }
            }
        }
        outcome.page_requests = cursor.page_requests();

        self.collect_gaps(&touched, &mut outcome).await;
        info!(
            rows = outcome.rows_fetched,
            pages = outcome.page_requests,
            inserted = outcome.stats.inserted,
            updated = outcome.stats.updated,
            duplicates = outcome.stats.duplicates_dropped,
            gaps = outcome.gaps.len(),
            complete = outcome.is_complete(),
            "platform sync finished"
        );
        outcome
    }

    async fn apply_page(
        &self,
        rows: Vec<IncomingRow>,
        outcome: &mut PlatformOutcome,
        touched: &mut BTreeSet<String>,
    ) {
        let mut by_ad: BTreeMap<String, Vec<IncomingRow>> = BTreeMap::new();
        for row in rows {
            by_ad.entry(row.row.ad_id.clone()).or_default().push(row);
        }
        for (ad_id, rows) in by_ad {
            touched.insert(ad_id.clone());
            if let Err(err) = self.apply_ad(&ad_id, rows, outcome).await {
                warn!(ad_id = %ad_id, error = %format!("{err:#}"), "ad reconciliation failed");
                outcome.failed_ads.push(FailedAd {
                    platform_id: outcome.platform_id.clone(),
                    ad_id,
                    error: format!("{err:#}"),
                });
            }
        }
    }

    async fn apply_ad(
        &self,
        ad_id: &str,
        rows: Vec<IncomingRow>,
        outcome: &mut PlatformOutcome,
    ) -> Result<()> {
        let _guard = self.locks.lock(ad_id).await;
        let stored = load_all_periods(self.store.as_ref(), &PeriodQuery::for_ad(ad_id), STORE_PAGE_SIZE)
            .await
            .with_context(|| format!("loading periods of {ad_id}"))?;
        let result = self
            .engine
            .reconcile(WeeklyPeriodSet::from_periods(ad_id, stored), rows);

        if !result.changed.is_empty() {
            let written = self
                .store
                .upsert_many(&result.changed)
                .await
                .with_context(|| format!("upserting periods of {ad_id}"))?;
            outcome.stats.stale += written.stale;
        }
        for conflict in &result.conflicts {
            warn!(incoming = %conflict.incoming, existing = %conflict.existing, "overlap conflict");
        }
        for rejected in &result.rejected {
            warn!(key = %rejected.key, reason = %rejected.reason, "row rejected");
        }
        outcome.stats.absorb(&result.stats);
        outcome.changed.extend(result.changed);
        outcome.conflicts.extend(result.conflicts);
        outcome.rejected.extend(result.rejected);
        Ok(())
    }

    async fn collect_gaps(&self, touched: &BTreeSet<String>, outcome: &mut PlatformOutcome) {
        for ad_id in touched {
            match load_all_periods(self.store.as_ref(), &PeriodQuery::for_ad(ad_id.as_str()), STORE_PAGE_SIZE).await {
                Ok(periods) => {
                    let gaps = WeeklyPeriodSet::from_periods(ad_id.as_str(), periods).coverage_gaps();
                    for gap in &gaps {
                        warn!(%gap, "coverage gap");
                    }
                    outcome.gaps.extend(gaps);
                }
                Err(err) => outcome.failed_ads.push(FailedAd {
                    platform_id: outcome.platform_id.clone(),
                    ad_id: ad_id.clone(),
                    error: format!("reading periods for gap detection: {err}"),
                }),
            }
        }
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn PeriodStore>,
    http: Arc<HttpFetcher>,
    engine: Arc<ReconciliationEngine>,
    locks: Arc<KeyedLocks>,
    sources: BTreeMap<String, Arc<dyn PerformanceSource>>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn PeriodStore>) -> Result<Self> {
        let normalizer = CategoryNormalizer::from_workspace_root(&config.workspace_root)?;
        info!(version = normalizer.version(), "category table loaded");
        // The page cursor owns retries, so the HTTP layer makes a single attempt.
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            backoff: BackoffPolicy::none(),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            store,
            http: Arc::new(http),
            engine: Arc::new(ReconciliationEngine::new(Arc::new(normalizer))),
            locks: Arc::new(KeyedLocks::new()),
            sources: BTreeMap::new(),
        })
    }

    pub fn with_source(mut self, source: Arc<dyn PerformanceSource>) -> Self {
        self.sources.insert(source.platform_id().to_string(), source);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn PeriodStore> {
        &self.store
    }

    pub async fn run_once(&self, options: SyncOptions) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = self.load_registry().await?;
        let platforms = registry.select(&options.platforms)?;

        let mut jobs = Vec::with_capacity(platforms.len());
        for platform in &platforms {
            let window = options.window.unwrap_or_else(|| {
                reporting_window(started_at, self.config.reporting_tz, platform.lookback_days)
            });
            jobs.push(PlatformJob {
                source: self.source_for(platform, run_id)?,
                request: FetchRequest {
                    platform_id: platform.platform_id.clone(),
                    ad_ids: None,
                    window,
                    page_size: options.page_size.unwrap_or(platform.page_size),
                },
                start_offset: 0,
            });
        }
        info!(%run_id, platforms = jobs.len(), "sync run started");

        let outcomes = self.run_jobs(run_id, jobs).await?;
        self.finish_run(run_id, None, started_at, outcomes).await
    }

    /// Re-fetches only the ranges a previous run recorded as failed, each
    /// starting at its failed offset.
    pub async fn resume_failed_ranges(&self, previous_run: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let ranges = report::read_failed_ranges(&self.config.reports_dir, previous_run).await?;
        let registry = self.load_registry().await?;

        let mut jobs = Vec::with_capacity(ranges.len());
        for range in ranges {
            let platform = registry
                .get(&range.platform_id)
                .with_context(|| format!("failed range names unknown platform {}", range.platform_id))?;
            jobs.push(PlatformJob {
                source: self.source_for(platform, run_id)?,
                request: FetchRequest {
                    platform_id: range.platform_id.clone(),
                    ad_ids: None,
                    window: range.window,
                    page_size: range.page_size,
                },
                start_offset: range.offset,
            });
        }
        info!(%run_id, %previous_run, ranges = jobs.len(), "resume run started");

        let outcomes = self.run_jobs(run_id, jobs).await?;
        self.finish_run(run_id, Some(previous_run), started_at, outcomes).await
    }

    async fn load_registry(&self) -> Result<PlatformRegistry> {
        PlatformRegistry::load(&self.config.workspace_root.join("platforms.yaml")).await
    }

    fn source_for(&self, platform: &PlatformConfig, run_id: Uuid) -> Result<Arc<dyn PerformanceSource>> {
        if let Some(source) = self.sources.get(&platform.platform_id) {
            return Ok(Arc::clone(source));
        }
        match platform.mode {
            SourceMode::Fixture => {
                let path = self
                    .config
                    .workspace_root
                    .join("fixtures")
                    .join(&platform.platform_id)
                    .join("sample")
                    .join("bundle.json");
                Ok(Arc::new(FixturePerformanceSource::load(&path)?))
            }
            SourceMode::Http => {
                let base_url = platform.base_url.as_deref().with_context(|| {
                    format!("platform {} uses http mode without a base_url", platform.platform_id)
                })?;
                Ok(Arc::new(HttpPerformanceSource::new(
                    platform.platform_id.clone(),
                    base_url,
                    Arc::clone(&self.http),
                    run_id,
                )))
            }
        }
    }

    async fn run_jobs(&self, run_id: Uuid, jobs: Vec<PlatformJob>) -> Result<Vec<PlatformOutcome>> {
        let worker = PlatformWorker {
            store: Arc::clone(&self.store),
            engine: Arc::clone(&self.engine),
            locks: Arc::clone(&self.locks),
            backoff: self.config.backoff,
            resume_attempts: self.config.resume_attempts,
            run_id,
        };
        let mut tasks = JoinSet::new();
        for job in jobs {
            tasks.spawn(worker.clone().run(job));
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            outcomes.push(joined.context("platform sync task failed")?);
        }
        outcomes.sort_by(|a, b| {
            (&a.platform_id, a.window.start, a.start_offset).cmp(&(&b.platform_id, b.window.start, b.start_offset))
        });
        Ok(outcomes)
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        resumed_from: Option<Uuid>,
        started_at: DateTime<Utc>,
        outcomes: Vec<PlatformOutcome>,
    ) -> Result<SyncRunSummary> {
        let reports_dir = report::run_dir(&self.config.reports_dir, run_id);
        let snapshot = load_all_periods(self.store.as_ref(), &PeriodQuery::default(), STORE_PAGE_SIZE)
            .await
            .context("loading periods for snapshot")?;
        let mut snapshot_gaps = Vec::new();
        let mut by_ad: BTreeMap<&str, Vec<CanonicalAdPeriod>> = BTreeMap::new();
        for period in &snapshot {
            by_ad.entry(period.ad_id()).or_default().push(period.clone());
        }
        for (ad_id, periods) in by_ad {
            snapshot_gaps.extend(WeeklyPeriodSet::from_periods(ad_id, periods).coverage_gaps());
        }
        let manifest = report::export_parquet_snapshots(&reports_dir, &snapshot, &snapshot_gaps).await?;

        let summary = SyncRunSummary {
            run_id,
            resumed_from,
            started_at,
            finished_at: Utc::now(),
            platforms: outcomes,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest.display().to_string(),
        };
        report::write_run_reports(&reports_dir, &summary).await?;

        let totals = summary.totals();
        info!(
            %run_id,
            rows = summary.rows_fetched(),
            inserted = totals.inserted,
            updated = totals.updated,
            failed_ranges = summary.failed_ranges().len(),
            complete = summary.is_complete(),
            "sync run finished"
        );
        Ok(summary)
    }
}

pub async fn run_sync_once_from_env(options: SyncOptions) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let store = open_store(&config).await?;
    SyncPipeline::new(config, store)?.run_once(options).await
}

pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config.sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once(SyncOptions::default()).await {
                Ok(summary) => info!(run_id = %summary.run_id, complete = summary.is_complete(), "scheduled sync finished"),
                Err(err) => warn!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use adspend_adapters::{load_fixture_bundle, FixtureBundle, SourceError};
    use adspend_core::{CanonicalCategory, Metric, PeriodKey, RawPerformanceRow};
    use adspend_storage::MemoryPeriodStore;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn august() -> SyncOptions {
        SyncOptions {
            window: Some(DateWindow::new(date(2025, 8, 1), date(2025, 8, 31))),
            ..Default::default()
        }
    }

    fn test_config(reports: &TempDir) -> SyncConfig {
        let mut config = SyncConfig::for_workspace(workspace_root());
        config.reports_dir = reports.path().to_path_buf();
        config.state_dir = reports.path().join("state");
        config.backoff = BackoffPolicy::none();
        config.resume_attempts = 1;
        config
    }

    fn pipeline(reports: &TempDir) -> SyncPipeline {
        SyncPipeline::new(test_config(reports), Arc::new(MemoryPeriodStore::new())).unwrap()
    }

    fn meta_bundle() -> FixtureBundle {
        load_fixture_bundle(workspace_root().join("fixtures/meta-ads/sample/bundle.json")).unwrap()
    }

    async fn all_periods(pipeline: &SyncPipeline) -> Vec<CanonicalAdPeriod> {
        load_all_periods(pipeline.store().as_ref(), &PeriodQuery::default(), 7)
            .await
            .unwrap()
    }

    fn key(ad_id: &str, starts: NaiveDate) -> PeriodKey {
        PeriodKey::new(ad_id, starts, starts + chrono::Duration::days(6))
    }

    struct FlakySource {
        inner: FixturePerformanceSource,
        fail_offset: usize,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl PerformanceSource for FlakySource {
        fn platform_id(&self) -> &str {
            self.inner.platform_id()
        }

        async fn fetch_page(
            &self,
            request: &FetchRequest,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<RawPerformanceRow>, SourceError> {
            if offset == self.fail_offset
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(SourceError::Permanent("upstream 400".into()));
            }
            self.inner.fetch_page(request, offset, limit).await
        }

        async fn total_count(&self, request: &FetchRequest) -> Result<Option<usize>, SourceError> {
            self.inner.total_count(request).await
        }
    }

    #[test]
    fn registry_parses_workspace_platforms() {
        let text = std::fs::read_to_string(workspace_root().join("platforms.yaml")).unwrap();
        let registry: PlatformRegistry = serde_yaml::from_str(&text).unwrap();
        let ids: Vec<_> = registry.platforms.iter().map(|p| p.platform_id.as_str()).collect();
        assert_eq!(ids, vec!["meta-ads", "google-ads", "tiktok-ads"]);
        assert!(registry.platforms.iter().all(|p| p.mode == SourceMode::Fixture));
        assert_eq!(registry.select(&["google-ads".to_string()]).unwrap().len(), 1);
        assert!(registry.select(&["bing-ads".to_string()]).is_err());
    }

    #[tokio::test]
    async fn fixture_sync_dedupes_and_reports_gaps() {
        let reports = TempDir::new().unwrap();
        let pipeline = pipeline(&reports);
        let summary = pipeline.run_once(august()).await.unwrap();

        assert!(summary.is_complete());
        assert_eq!(summary.platforms.len(), 3);
        let meta = summary.platforms.iter().find(|p| p.platform_id == "meta-ads").unwrap();
        assert_eq!(meta.rows_fetched, 10);
        assert_eq!(meta.page_requests, 1);
        assert_eq!(meta.stats.duplicates_dropped, 1);

        let periods = all_periods(&pipeline).await;
        assert_eq!(periods.len(), 9 + 5 + 4);
        let doubled = periods
            .iter()
            .find(|p| p.key == key("m-101", date(2025, 8, 18)))
            .unwrap();
        assert_eq!(doubled.metrics.spend, 395.0);

        let gaps = summary.gaps();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].ad_id, "m-102");
        assert_eq!(gaps[0].missing_from(), date(2025, 8, 18));
        assert_eq!(gaps[0].missing_to(), date(2025, 8, 24));

        let category_of = |ad_id: &str| periods.iter().find(|p| p.ad_id() == ad_id).unwrap().category;
        assert_eq!(category_of("m-101"), CanonicalCategory::PlayMats);
        assert_eq!(category_of("m-102"), CanonicalCategory::BathMats);
        assert_eq!(category_of("m-103"), CanonicalCategory::MultiCategory);
        assert_eq!(category_of("m-104"), CanonicalCategory::Blankets);
        assert_eq!(category_of("g-202"), CanonicalCategory::HighChairs);
        assert_eq!(category_of("t-301"), CanonicalCategory::Teethers);
        assert_eq!(category_of("t-302"), CanonicalCategory::Blankets);
    }

    #[tokio::test]
    async fn rerunning_converges_to_the_same_metrics() {
        let reports = TempDir::new().unwrap();
        let pipeline = pipeline(&reports);
        pipeline.run_once(august()).await.unwrap();
        let first: Vec<_> = all_periods(&pipeline)
            .await
            .into_iter()
            .map(|p| (p.key, p.metrics, p.category))
            .collect();

        let second_run = pipeline.run_once(august()).await.unwrap();
        let totals = second_run.totals();
        assert_eq!(totals.inserted, 0);
        assert_eq!(totals.updated, 0);
        assert_eq!(totals.unchanged, first.len());
        assert!(second_run.platforms.iter().all(|p| p.changed.is_empty()));
        let second: Vec<_> = all_periods(&pipeline)
            .await
            .into_iter()
            .map(|p| (p.key, p.metrics, p.category))
            .collect();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn truncated_platform_is_reported_without_aborting_others() {
        let reports = TempDir::new().unwrap();
        let mut bundle = meta_bundle();
        bundle.page_cap = Some(2);
        let pipeline = pipeline(&reports).with_source(Arc::new(FixturePerformanceSource::new(bundle)));

        let summary = pipeline.run_once(august()).await.unwrap();
        assert!(!summary.is_complete());
        let meta = summary.platforms.iter().find(|p| p.platform_id == "meta-ads").unwrap();
        let incomplete = meta.incomplete.as_ref().unwrap();
        assert_eq!(incomplete.expected, 10);
        assert_eq!(incomplete.received, 2);
        assert_eq!(meta.changed.len(), 2);

        let google = summary.platforms.iter().find(|p| p.platform_id == "google-ads").unwrap();
        assert!(google.is_complete());
        assert_eq!(google.stats.inserted, 5);
    }

    #[tokio::test]
    async fn failed_range_is_recorded_and_resumed_from_its_offset() {
        let reports = TempDir::new().unwrap();
        let source = FlakySource {
            inner: FixturePerformanceSource::new(meta_bundle()),
            fail_offset: 4,
            failures: AtomicUsize::new(2),
        };
        let pipeline = pipeline(&reports).with_source(Arc::new(source));
        let options = SyncOptions {
            platforms: vec!["meta-ads".to_string()],
            page_size: Some(4),
            ..august()
        };

        let first = pipeline.run_once(options).await.unwrap();
        let failed = first.failed_ranges();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].offset, 4);
        assert_eq!(failed[0].page_size, 4);
        assert_eq!(first.platforms[0].rows_fetched, 4);
        assert_eq!(all_periods(&pipeline).await.len(), 4);

        let on_disk = report::read_failed_ranges(&pipeline.config().reports_dir, first.run_id)
            .await
            .unwrap();
        assert_eq!(on_disk, failed);

        let resumed = pipeline.resume_failed_ranges(first.run_id).await.unwrap();
        assert_eq!(resumed.resumed_from, Some(first.run_id));
        assert!(resumed.is_complete());
        assert_eq!(resumed.platforms[0].start_offset, 4);
        assert_eq!(resumed.platforms[0].rows_fetched, 6);
        assert_eq!(all_periods(&pipeline).await.len(), 9);
    }

    #[tokio::test]
    async fn run_writes_reports_and_parquet_manifest() {
        let reports = TempDir::new().unwrap();
        let pipeline = pipeline(&reports);
        let summary = pipeline.run_once(august()).await.unwrap();

        let dir = PathBuf::from(&summary.reports_dir);
        for file in [
            report::BRIEF_FILE,
            report::DELTA_FILE,
            report::GAPS_FILE,
            report::FAILED_RANGES_FILE,
            report::ISSUES_FILE,
        ] {
            assert!(dir.join(file).exists(), "{file}");
        }
        let brief = std::fs::read_to_string(dir.join(report::BRIEF_FILE)).unwrap();
        assert!(brief.contains("m-102: missing 2025-08-18..2025-08-24 (7 days)"));

        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&summary.parquet_manifest).unwrap()).unwrap();
        let files = manifest["files"].as_array().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0]["rows"], 18);
        assert!(dir.join("snapshots/ad_periods.parquet").exists());

        let listing = report::report_runs_markdown(5, reports.path()).unwrap();
        assert!(listing.contains(&summary.run_id.to_string()));
    }

    #[tokio::test]
    async fn dashboard_recomputes_momentum_on_read() {
        let reports = TempDir::new().unwrap();
        let pipeline = pipeline(&reports);
        pipeline.run_once(august()).await.unwrap();

        let records = dashboard_records(
            pipeline.store().as_ref(),
            &DashboardFilter::default(),
            date(2025, 9, 1),
        )
        .await
        .unwrap();
        let by_ad = |ad_id: &str| records.iter().find(|r| r.ad_id == ad_id).unwrap();

        let zero_baseline = by_ad("m-103").momentum_for(Metric::Spend).unwrap();
        assert_eq!(zero_baseline.older_value, Some(0.0));
        assert_eq!(zero_baseline.pct_change, None);

        let spend = by_ad("m-101").momentum_for(Metric::Spend).unwrap();
        assert_eq!(spend.older_value, Some(395.0));
        assert_eq!(spend.newer_value, Some(420.0));
        assert!(spend.contiguous);

        let gapped = by_ad("m-102").momentum_for(Metric::Spend).unwrap();
        assert!(!gapped.contiguous);
        assert_eq!(by_ad("m-101").days_live, Some(389));
        assert!(by_ad("m-104").momentum.is_empty());

        let bath_only = dashboard_records(
            pipeline.store().as_ref(),
            &DashboardFilter {
                category: Some(CanonicalCategory::BathMats),
                ..Default::default()
            },
            date(2025, 9, 1),
        )
        .await
        .unwrap();
        assert_eq!(bath_only.len(), 1);

        let markdown = report_momentum_markdown(&records);
        assert!(markdown.contains("| m-103 | Multi Category |"));
        assert!(markdown.contains("n/a"));
    }

    #[tokio::test]
    async fn keyed_locks_serialize_same_key() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock("m-101").await;
        let other = locks.lock("m-102").await;
        drop(other);

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock("m-101").await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn keyed_locks_forget_released_keys() {
        let locks = KeyedLocks::new();
        for n in 0..50 {
            let _guard = locks.lock(&format!("ad-{n}")).await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());

        let outer = locks.lock("m-101").await;
        let inner = locks.lock("m-102").await;
        drop(outer);
        assert_eq!(locks.len(), 1);
        drop(inner);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn pipeline_leaves_no_key_locks_behind() {
        let reports = TempDir::new().unwrap();
        let pipeline = pipeline(&reports);
        pipeline.run_once(august()).await.unwrap();
        assert!(pipeline.locks.is_empty());
    }
}
