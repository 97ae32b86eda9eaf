//! Fetcher adapter contracts, fixture-first sources, pagination-safe fetch loop
//! and the ad-name parser.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use adspend_core::{DateWindow, RawPerformanceRow};
use adspend_storage::{HttpError, HttpFetcher, RetryDisposition};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod naming;
pub mod paginate;

pub use naming::parse_ad_name;
pub use paginate::{
    FetchError, FetchedPage, PageCursor, PaginationError, PaginationIncompleteError,
};

pub const CRATE_NAME: &str = "adspend-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub platform_id: String,
    pub ad_ids: Option<Vec<String>>,
    pub window: DateWindow,
    pub page_size: usize,
}

impl FetchRequest {
    pub fn matches(&self, row: &RawPerformanceRow) -> bool {
        let ad_ok = match &self.ad_ids {
            Some(ids) => ids.iter().any(|id| id == &row.ad_id),
            None => true,
        };
        ad_ok && self.window.contains(row.reporting_starts, row.reporting_ends)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRow {
    pub row: RawPerformanceRow,
    pub platform_id: String,
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub sequence: u64,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transient upstream failure: {0}")]
    Transient(String),
    #[error("upstream rejected request: {0}")]
    Permanent(String),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("malformed upstream payload: {0}")]
    Decode(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Transient(_) => true,
            SourceError::Http(err) => err.disposition() == RetryDisposition::Retryable,
            SourceError::Permanent(_) | SourceError::Decode(_) => false,
        }
    }
}

/// Yields raw performance rows for a date range, one bounded page at a time.
///
/// A single call is never assumed to return everything; callers drive
/// [`PageCursor`] until a short page comes back.
#[async_trait]
pub trait PerformanceSource: Send + Sync {
    fn platform_id(&self) -> &str;

    async fn fetch_page(
        &self,
        request: &FetchRequest,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RawPerformanceRow>, SourceError>;

    async fn total_count(&self, _request: &FetchRequest) -> Result<Option<usize>, SourceError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub platform_id: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub page_cap: Option<usize>,
    #[serde(default = "default_true")]
    pub report_total: bool,
    pub rows: Vec<RawPerformanceRow>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_true() -> bool {
    true
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct FixturePerformanceSource {
    bundle: FixtureBundle,
}

impl FixturePerformanceSource {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self { bundle }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_bundle(path)?))
    }

    fn matching_rows<'a>(
        &'a self,
        request: &'a FetchRequest,
    ) -> impl Iterator<Item = &'a RawPerformanceRow> + 'a {
        self.bundle.rows.iter().filter(move |row| request.matches(row))
    }
}

#[async_trait]
impl PerformanceSource for FixturePerformanceSource {
    fn platform_id(&self) -> &str {
        &self.bundle.platform_id
    }

    async fn fetch_page(
        &self,
        request: &FetchRequest,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RawPerformanceRow>, SourceError> {
        let served = match self.bundle.page_cap {
            Some(cap) => limit.min(cap),
            None => limit,
        };
        Ok(self
            .matching_rows(request)
            .skip(offset)
            .take(served)
            .cloned()
            .collect())
    }

    async fn total_count(&self, request: &FetchRequest) -> Result<Option<usize>, SourceError> {
        if !self.bundle.report_total {
            return Ok(None);
        }
        Ok(Some(self.matching_rows(request).count()))
    }
}

#[derive(Debug, Deserialize)]
struct PageEnvelope {
    data: Vec<RawPerformanceRow>,
    #[serde(default)]
    total: Option<usize>,
}

/// Generic JSON reporting endpoint:
/// `GET {base_url}?since=..&until=..&offset=..&limit=..[&ad_ids=a,b]` returning
/// `{"data": [...], "total": n}`.
#[derive(Debug, Clone)]
pub struct HttpPerformanceSource {
    platform_id: String,
    base_url: String,
    http: Arc<HttpFetcher>,
    run_id: Uuid,
}

impl HttpPerformanceSource {
    pub fn new(
        platform_id: impl Into<String>,
        base_url: impl Into<String>,
        http: Arc<HttpFetcher>,
        run_id: Uuid,
    ) -> Self {
        Self {
            platform_id: platform_id.into(),
            base_url: base_url.into(),
            http,
            run_id,
        }
    }

    pub fn page_url(&self, request: &FetchRequest, offset: usize, limit: usize) -> String {
        let sep = if self.base_url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{sep}since={}&until={}&offset={offset}&limit={limit}",
            self.base_url, request.window.start, request.window.end
        );
        if let Some(ids) = &request.ad_ids {
            url.push_str("&ad_ids=");
            url.push_str(&ids.join(","));
        }
        url
    }

    async fn fetch_envelope(&self, url: &str) -> Result<PageEnvelope, SourceError> {
        let resp = self.http.fetch_bytes(self.run_id, &self.platform_id, url).await?;
        serde_json::from_slice(&resp.body).map_err(|e| SourceError::Decode(format!("{url}: {e}")))
    }
}

#[async_trait]
impl PerformanceSource for HttpPerformanceSource {
    fn platform_id(&self) -> &str {
        &self.platform_id
    }

    async fn fetch_page(
        &self,
        request: &FetchRequest,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RawPerformanceRow>, SourceError> {
        let url = self.page_url(request, offset, limit);
        Ok(self.fetch_envelope(&url).await?.data)
    }

    async fn total_count(&self, request: &FetchRequest) -> Result<Option<usize>, SourceError> {
        let url = self.page_url(request, 0, 1);
        Ok(self.fetch_envelope(&url).await?.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture_bundle_path(platform_id: &str) -> PathBuf {
        workspace_root()
            .join("fixtures")
            .join(platform_id)
            .join("sample")
            .join("bundle.json")
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn august_request(platform_id: &str) -> FetchRequest {
        FetchRequest {
            platform_id: platform_id.to_string(),
            ad_ids: None,
            window: DateWindow::new(date(2025, 8, 1), date(2025, 8, 31)),
            page_size: 500,
        }
    }

    #[tokio::test]
    async fn fixture_source_filters_by_window_and_ad() {
        let source = FixturePerformanceSource::load(fixture_bundle_path("meta-ads")).unwrap();
        let mut request = august_request("meta-ads");
        let all = source.fetch_page(&request, 0, 100).await.unwrap();
        assert_eq!(Some(all.len()), source.total_count(&request).await.unwrap());

        request.ad_ids = Some(vec!["m-102".to_string()]);
        let one_ad = source.fetch_page(&request, 0, 100).await.unwrap();
        assert_eq!(one_ad.len(), 2);
        assert!(one_ad.iter().all(|r| r.ad_id == "m-102"));

        request.ad_ids = None;
        request.window = DateWindow::new(date(2025, 8, 4), date(2025, 8, 10));
        let first_week = source.fetch_page(&request, 0, 100).await.unwrap();
        assert!(first_week
            .iter()
            .all(|r| r.reporting_starts == date(2025, 8, 4)));
    }

    #[tokio::test]
    async fn fixture_page_cap_truncates_silently() {
        let mut bundle = load_fixture_bundle(fixture_bundle_path("meta-ads")).unwrap();
        bundle.page_cap = Some(2);
        let source = FixturePerformanceSource::new(bundle);
        let request = august_request("meta-ads");
        let page = source.fetch_page(&request, 0, 100).await.unwrap();
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn http_page_url_carries_range_and_ads() {
        let http = Arc::new(HttpFetcher::new(Default::default()).unwrap());
        let source = HttpPerformanceSource::new(
            "google-ads",
            "https://reports.example/v1/ad_weekly",
            http,
            Uuid::nil(),
        );
        let mut request = august_request("google-ads");
        request.ad_ids = Some(vec!["g-1".to_string(), "g-2".to_string()]);
        assert_eq!(
            source.page_url(&request, 500, 500),
            "https://reports.example/v1/ad_weekly?since=2025-08-01&until=2025-08-31&offset=500&limit=500&ad_ids=g-1,g-2"
        );
    }

    #[test]
    fn transient_classification() {
        assert!(SourceError::Transient("503".into()).is_transient());
        assert!(!SourceError::Permanent("401".into()).is_transient());
        assert!(!SourceError::Decode("bad json".into()).is_transient());
        assert!(SourceError::Http(HttpError::HttpStatus {
            status: 429,
            url: "u".into()
        })
        .is_transient());
    }
}
