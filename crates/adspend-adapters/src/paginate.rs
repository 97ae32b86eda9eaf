//! Pagination-safe fetch loop.
//!
//! Upstream reporting APIs silently cap pages, so a single bounded call is
//! never trusted. [`PageCursor`] issues range requests advancing by
//! `page_size` until a short page signals exhaustion, and cross-checks the
//! received row count against the platform's own total when one is reported.

use std::sync::Arc;

use adspend_core::DateWindow;
use adspend_storage::BackoffPolicy;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{FetchRequest, IncomingRow, PerformanceSource, SourceError};

/// Retries exhausted (or a permanent failure) for one page range. The cursor
/// stays at `offset`, so the caller can resume there instead of restarting.
#[derive(Debug, Error)]
#[error("fetch failed for {platform_id} {window} at offset {offset} (page size {page_size}) after {attempts} attempt(s): {source}")]
pub struct FetchError {
    pub platform_id: String,
    pub window: DateWindow,
    pub offset: usize,
    pub page_size: usize,
    pub attempts: usize,
    #[source]
    pub source: SourceError,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("pagination incomplete for {platform_id} {window}: expected {expected} rows, received {received}")]
pub struct PaginationIncompleteError {
    pub platform_id: String,
    pub window: DateWindow,
    pub expected: usize,
    pub received: usize,
}

#[derive(Debug, Error)]
pub enum PaginationError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Incomplete(#[from] PaginationIncompleteError),
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub offset: usize,
    pub fetched_at: DateTime<Utc>,
    pub rows: Vec<IncomingRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Paging,
    /// Short page seen; totals are verified on the next call.
    Drained,
    Done,
}

pub struct PageCursor {
    source: Arc<dyn PerformanceSource>,
    request: FetchRequest,
    run_id: Uuid,
    backoff: BackoffPolicy,
    offset: usize,
    received: usize,
    requests: usize,
    expected_total: Option<usize>,
    total_checked: bool,
    state: CursorState,
}

impl PageCursor {
    pub fn new(source: Arc<dyn PerformanceSource>, request: FetchRequest, run_id: Uuid) -> Self {
        Self {
            source,
            request,
            run_id,
            backoff: BackoffPolicy::default(),
            offset: 0,
            received: 0,
            requests: 0,
            expected_total: None,
            total_checked: false,
            state: CursorState::Paging,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn starting_at(mut self, offset: usize) -> Self {
        self.offset = offset;
        self.received = offset;
        self
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rows_received(&self) -> usize {
        self.received
    }

    pub fn page_requests(&self) -> usize {
        self.requests
    }

    pub fn request(&self) -> &FetchRequest {
        &self.request
    }

    /// Fetches the next page, or `Ok(None)` once the range is exhausted and verified.
    ///
    /// After a [`FetchError`] the cursor is left at the failed offset; calling
    /// `next_page` again resumes from there.
    pub async fn next_page(&mut self) -> Result<Option<FetchedPage>, PaginationError> {
        match self.state {
            CursorState::Done => return Ok(None),
            CursorState::Drained => {
                self.state = CursorState::Done;
                self.verify_total()?;
                return Ok(None);
            }
            CursorState::Paging => {}
        }

        if !self.total_checked {
            let request = self.request.clone();
            self.expected_total = self
                .with_retries(|source| {
                    let request = request.clone();
                    async move { source.total_count(&request).await }
                })
                .await?;
            self.total_checked = true;
        }

        let page_size = self.request.page_size.max(1);
        let offset = self.offset;
        let request = self.request.clone();
        let rows = self
            .with_retries(|source| {
                let request = request.clone();
                async move { source.fetch_page(&request, offset, page_size).await }
            })
            .await?;
        self.requests += 1;

        let fetched_at = Utc::now();
        let count = rows.len();
        debug!(
            platform_id = %self.request.platform_id,
            offset,
            count,
            "fetched page"
        );

        let incoming = rows
            .into_iter()
            .enumerate()
            .map(|(idx, row)| IncomingRow {
                row,
                platform_id: self.request.platform_id.clone(),
                run_id: self.run_id,
                fetched_at,
                sequence: (offset + idx) as u64,
            })
            .collect();

        self.received += count;
        self.offset += page_size;
        // A reported total never ends the loop early; only a short page does.
        if count < page_size {
            self.state = CursorState::Drained;
        }

        Ok(Some(FetchedPage {
            offset,
            fetched_at,
            rows: incoming,
        }))
    }

    pub async fn collect_all(mut self) -> Result<Vec<IncomingRow>, PaginationError> {
        let mut out = Vec::new();
        while let Some(page) = self.next_page().await? {
            out.extend(page.rows);
        }
        Ok(out)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<IncomingRow, PaginationError>> {
        stream::try_unfold(self, |mut cursor| async move {
            let page = cursor.next_page().await?;
            Ok::<_, PaginationError>(page.map(|page| (page, cursor)))
        })
        .map_ok(|page| stream::iter(page.rows.into_iter().map(Ok::<IncomingRow, PaginationError>)))
        .try_flatten()
        .boxed()
    }

    fn verify_total(&self) -> Result<(), PaginationIncompleteError> {
        match self.expected_total {
            Some(expected) if expected != self.received => Err(PaginationIncompleteError {
                platform_id: self.request.platform_id.clone(),
                window: self.request.window,
                expected,
                received: self.received,
            }),
            _ => Ok(()),
        }
    }

    async fn with_retries<T, F, Fut>(&self, mut call: F) -> Result<T, FetchError>
    where
        F: FnMut(Arc<dyn PerformanceSource>) -> Fut,
        Fut: std::future::Future<Output = Result<T, SourceError>>,
    {
        let mut attempt = 0usize;
        loop {
            match call(self.source.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.backoff.max_retries => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(
                        platform_id = %self.request.platform_id,
                        offset = self.offset,
                        attempt,
                        ?delay,
                        error = %err,
                        "transient upstream failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(FetchError {
                        platform_id: self.request.platform_id.clone(),
                        window: self.request.window,
                        offset: self.offset,
                        page_size: self.request.page_size,
                        attempts: attempt + 1,
                        source: err,
                    })
                }
            }
        }
    }
}
