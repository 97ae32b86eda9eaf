//! Wall-clock to reporting-date resolution.
//!
//! This is the only place a timezone is applied. Everything downstream works
//! on `NaiveDate`s resolved here.

use adspend_core::DateWindow;
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;

pub const DEFAULT_REPORTING_TZ: Tz = chrono_tz::America::New_York;

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|e| anyhow!("unknown reporting timezone {name:?}: {e}"))
}

pub fn local_date(now_utc: DateTime<Utc>, tz: Tz) -> NaiveDate {
    now_utc.with_timezone(&tz).date_naive()
}

/// "Yesterday" in the reference timezone: the last fully reported day.
pub fn reporting_yesterday(now_utc: DateTime<Utc>, tz: Tz) -> NaiveDate {
    local_date(now_utc, tz) - Duration::days(1)
}

pub fn reporting_window(now_utc: DateTime<Utc>, tz: Tz, lookback_days: u32) -> DateWindow {
    let end = reporting_yesterday(now_utc, tz);
    let start = end - Duration::days(i64::from(lookback_days.max(1)) - 1);
    DateWindow::new(start, end)
}

pub fn explicit_window(since: NaiveDate, until: NaiveDate) -> Result<DateWindow> {
    if until < since {
        bail!("window end {until} is before its start {since}");
    }
    Ok(DateWindow::new(since, until))
}
