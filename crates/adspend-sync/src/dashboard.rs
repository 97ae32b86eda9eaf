//! Read model for dashboard consumers: periods, gaps and momentum per ad.

use std::collections::BTreeMap;

use adspend_core::{
    CanonicalAdPeriod, CanonicalCategory, CoverageGap, DateWindow, Metric, MomentumSignal,
    ParsedAdAttributes, WeeklyPeriodSet,
};
use adspend_storage::{load_all_periods, PeriodQuery, PeriodStore, StoreError};
use chrono::NaiveDate;
use serde::Serialize;

use crate::momentum::momentum_all;
use crate::STORE_PAGE_SIZE;

#[derive(Debug, Clone, Default)]
pub struct DashboardFilter {
    pub ad_id: Option<String>,
    pub window: Option<DateWindow>,
    pub category: Option<CanonicalCategory>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdDashboardRecord {
    pub ad_id: String,
    pub ad_name: String,
    pub campaign_name: String,
    pub category: CanonicalCategory,
    pub attributes: ParsedAdAttributes,
    pub days_live: Option<i64>,
    pub periods: Vec<CanonicalAdPeriod>,
    pub gaps: Vec<CoverageGap>,
    pub momentum: Vec<MomentumSignal>,
}

impl AdDashboardRecord {
    pub fn momentum_for(&self, metric: Metric) -> Option<&MomentumSignal> {
        self.momentum.iter().find(|signal| signal.metric == metric)
    }

    pub fn latest(&self) -> Option<&CanonicalAdPeriod> {
        self.periods.last()
    }
}

pub async fn dashboard_records(
    store: &dyn PeriodStore,
    filter: &DashboardFilter,
    today: NaiveDate,
) -> Result<Vec<AdDashboardRecord>, StoreError> {
    let query = PeriodQuery {
        ad_id: filter.ad_id.clone(),
        window: filter.window,
    };
    let mut by_ad: BTreeMap<String, Vec<CanonicalAdPeriod>> = BTreeMap::new();
    for period in load_all_periods(store, &query, STORE_PAGE_SIZE).await? {
        by_ad.entry(period.key.ad_id.clone()).or_default().push(period);
    }

    let mut records = Vec::with_capacity(by_ad.len());
    for (ad_id, periods) in by_ad {
        let set = WeeklyPeriodSet::from_periods(ad_id.clone(), periods);
        let Some(latest) = set.latest().cloned() else {
            continue;
        };
        if filter.category.is_some_and(|category| category != latest.category) {
            continue;
        }
        records.push(AdDashboardRecord {
            ad_id,
            ad_name: latest.ad_name.clone(),
            campaign_name: latest.campaign_name.clone(),
            category: latest.category,
            days_live: latest.attributes.days_live(today),
            attributes: latest.attributes,
            gaps: set.coverage_gaps(),
            momentum: momentum_all(&set),
            periods: set.into_periods(),
        });
    }
    Ok(records)
}

fn pct_cell(signal: Option<&MomentumSignal>) -> String {
    match signal.and_then(|s| s.pct_change.map(|pct| (pct, s.contiguous))) {
        Some((pct, true)) => format!("{pct:+.1}%"),
        Some((pct, false)) => format!("{pct:+.1}% (gap)"),
        None => "n/a".to_string(),
    }
}

pub fn report_momentum_markdown(records: &[AdDashboardRecord]) -> String {
    let mut lines = vec![
        "# Ad Momentum".to_string(),
        String::new(),
        "| ad | category | latest week | spend | roas | cpa | spend Δ | roas Δ | days live | gaps |".to_string(),
        "|---|---|---|---|---|---|---|---|---|---|".to_string(),
    ];
    for record in records {
        let Some(latest) = record.latest() else {
            continue;
        };
        lines.push(format!(
            "| {} | {} | {} | {:.2} | {} | {} | {} | {} | {} | {} |",
            record.ad_id,
            record.category,
            latest.reporting_starts(),
            latest.metrics.spend,
            latest.derived.roas,
            latest.derived.cpa,
            pct_cell(record.momentum_for(Metric::Spend)),
            pct_cell(record.momentum_for(Metric::Roas)),
            record
                .days_live
                .map(|d| d.to_string())
                .unwrap_or_else(|| "n/a".to_string()),
            record.gaps.len()
        ));
    }

    let gaps: Vec<&CoverageGap> = records.iter().flat_map(|r| r.gaps.iter()).collect();
    if !gaps.is_empty() {
        lines.push(String::new());
        lines.push("## Coverage Gaps".to_string());
        lines.extend(gaps.iter().map(|gap| format!("- {gap}")));
    }
    lines.push(String::new());
    lines.join("\n")
}
