//! Merges fetched rows into an ad's canonical weekly periods.
//!
//! Rows are grouped by [`PeriodKey`]; duplicate deliveries of one key are
//! deduplicated (most recently fetched wins) and never summed. Each surviving
//! key is upserted with full-row replace semantics, derived metrics are
//! recomputed from the raw metrics, and the resulting set is re-sorted and
//! walked for coverage gaps. The result depends only on the contents of the
//! batch, never on arrival order, and applying the same batch twice is a
//! no-op the second time.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use adspend_adapters::{parse_ad_name, IncomingRow};
use adspend_core::{
    CanonicalAdPeriod, CanonicalCategory, CoverageGap, IngestProvenance, ParsedAdAttributes,
    PeriodKey, RawPerformanceRow, WeeklyPeriodSet,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::category::CategoryNormalizer;

/// A distinct incoming key whose window overlaps a period already in the set.
/// The stored period is kept; the incoming row is reported, not merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlapConflict {
    pub incoming: PeriodKey,
    pub existing: PeriodKey,
    pub platform_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedRow {
    pub key: PeriodKey,
    pub platform_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileStats {
    pub received: usize,
    pub duplicates_dropped: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub stale: usize,
}

impl ReconcileStats {
    pub fn absorb(&mut self, other: &ReconcileStats) {
        self.received += other.received;
        self.duplicates_dropped += other.duplicates_dropped;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.stale += other.stale;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub periods: WeeklyPeriodSet,
    pub changed: Vec<CanonicalAdPeriod>,
    pub gaps: Vec<CoverageGap>,
    pub stats: ReconcileStats,
    pub conflicts: Vec<OverlapConflict>,
    pub rejected: Vec<RejectedRow>,
}

pub struct ReconciliationEngine {
    normalizer: Arc<CategoryNormalizer>,
}

impl ReconciliationEngine {
    pub fn new(normalizer: Arc<CategoryNormalizer>) -> Self {
        Self { normalizer }
    }

    pub fn classify(&self, row: &RawPerformanceRow) -> (CanonicalCategory, ParsedAdAttributes) {
        let attributes = parse_ad_name(&row.ad_name, &row.campaign_name);
        let label = attributes
            .category_hint
            .as_deref()
            .unwrap_or(row.campaign_name.as_str());
        let mut category = self.normalizer.normalize(label);
        if !category.is_specific() && attributes.product.is_some() {
            let from_campaign = self.normalizer.normalize(&row.campaign_name);
            if from_campaign.is_specific() {
                category = from_campaign;
            }
        }
        (category, attributes)
    }

    pub fn reconcile<I>(&self, existing: WeeklyPeriodSet, incoming: I) -> Reconciliation
    where
        I: IntoIterator<Item = IncomingRow>,
    {
        let ad_id = existing.ad_id().to_string();
        let mut stats = ReconcileStats::default();
        let mut rejected = Vec::new();
        let mut winners: BTreeMap<PeriodKey, IncomingRow> = BTreeMap::new();

        for row in incoming {
            stats.received += 1;
            if let Some(reason) = rejection_reason(&ad_id, &row.row) {
                rejected.push(RejectedRow {
                    key: row.row.key(),
                    platform_id: row.platform_id.clone(),
                    reason,
                });
                continue;
            }
            let key = row.row.key();
            match winners.get_mut(&key) {
                None => {
                    winners.insert(key, row);
                }
                Some(current) => {
                    stats.duplicates_dropped += 1;
                    if recency_cmp(&row, current) == Ordering::Greater {
                        *current = row;
                    }
                }
            }
        }
        rejected.sort_by(|a, b| (&a.key, &a.reason).cmp(&(&b.key, &b.reason)));

        let mut periods: BTreeMap<PeriodKey, CanonicalAdPeriod> = existing
            .into_periods()
            .into_iter()
            .map(|p| (p.key.clone(), p))
            .collect();
        let mut classified: HashMap<(String, String), (CanonicalCategory, ParsedAdAttributes)> =
            HashMap::new();
        let mut changed = Vec::new();
        let mut conflicts = Vec::new();

        for (key, row) in winners {
            let provenance = IngestProvenance {
                platform_id: row.platform_id.clone(),
                run_id: row.run_id,
                fetched_at: row.fetched_at,
            };

            if let Some(stored) = periods.get(&key) {
                if stored.provenance.fetched_at > row.fetched_at {
                    stats.stale += 1;
                    continue;
                }
                let (category, attributes) = if stored.ad_name == row.row.ad_name {
                    (stored.category, stored.attributes.clone())
                } else {
                    self.classify_cached(&mut classified, &row.row, &periods)
                };
                let candidate = CanonicalAdPeriod::from_row(&row.row, category, attributes, provenance);
                if same_content(&candidate, stored) {
                    stats.unchanged += 1;
                } else {
                    stats.updated += 1;
                    changed.push(candidate.clone());
                    periods.insert(key, candidate);
                }
                continue;
            }

            if let Some(other) = periods.keys().find(|other| other.overlaps(&key)) {
                warn!(incoming = %key, existing = %other, "overlapping period rejected");
                conflicts.push(OverlapConflict {
                    incoming: key.clone(),
                    existing: other.clone(),
                    platform_id: row.platform_id.clone(),
                });
                continue;
            }

            let (category, attributes) = self.classify_cached(&mut classified, &row.row, &periods);
            let period = CanonicalAdPeriod::from_row(&row.row, category, attributes, provenance);
            stats.inserted += 1;
            changed.push(period.clone());
            periods.insert(key, period);
        }

        let mut set = WeeklyPeriodSet::new(ad_id);
        set.replace_periods(periods.into_values().collect());
        let gaps = set.coverage_gaps();
        debug!(
            ad_id = set.ad_id(),
            periods = set.len(),
            inserted = stats.inserted,
            updated = stats.updated,
            duplicates = stats.duplicates_dropped,
            gaps = gaps.len(),
            "reconciled ad"
        );

        Reconciliation {
            periods: set,
            changed,
            gaps,
            stats,
            conflicts,
            rejected,
        }
    }

    pub fn reconcile_batch<I>(
        &self,
        mut existing_by_ad: BTreeMap<String, WeeklyPeriodSet>,
        incoming: I,
    ) -> BTreeMap<String, Reconciliation>
    where
        I: IntoIterator<Item = IncomingRow>,
    {
        let mut by_ad: BTreeMap<String, Vec<IncomingRow>> = BTreeMap::new();
        for row in incoming {
            by_ad.entry(row.row.ad_id.clone()).or_default().push(row);
        }
        for ad_id in existing_by_ad.keys() {
            by_ad.entry(ad_id.clone()).or_default();
        }

        by_ad
            .into_iter()
            .map(|(ad_id, rows)| {
                let existing = existing_by_ad
                    .remove(&ad_id)
                    .unwrap_or_else(|| WeeklyPeriodSet::new(ad_id.clone()));
                let result = self.reconcile(existing, rows);
                (ad_id, result)
            })
            .collect()
    }

    /// Reuses the attributes of any stored period carrying the same ad name,
    /// so they stay fixed across weekly updates until the name changes.
    fn classify_cached(
        &self,
        cache: &mut HashMap<(String, String), (CanonicalCategory, ParsedAdAttributes)>,
        row: &RawPerformanceRow,
        periods: &BTreeMap<PeriodKey, CanonicalAdPeriod>,
    ) -> (CanonicalCategory, ParsedAdAttributes) {
        if let Some(known) = periods.values().rev().find(|p| p.ad_name == row.ad_name) {
            return (known.category, known.attributes.clone());
        }
        cache
            .entry((row.ad_name.clone(), row.campaign_name.clone()))
            .or_insert_with(|| self.classify(row))
            .clone()
    }
}

/// Equality ignoring provenance: a re-fetch of identical numbers is not a change.
fn same_content(a: &CanonicalAdPeriod, b: &CanonicalAdPeriod) -> bool {
    a.key == b.key
        && a.ad_name == b.ad_name
        && a.campaign_id == b.campaign_id
        && a.campaign_name == b.campaign_name
        && a.metrics == b.metrics
        && a.category == b.category
        && a.attributes == b.attributes
}

fn rejection_reason(ad_id: &str, row: &RawPerformanceRow) -> Option<String> {
    if row.ad_id != ad_id {
        return Some(format!("row belongs to ad {} not {ad_id}", row.ad_id));
    }
    if row.reporting_ends < row.reporting_starts {
        return Some("reporting window ends before it starts".to_string());
    }
    for (name, value) in [("spend", row.spend), ("purchase_value", row.purchase_value)] {
        if !value.is_finite() {
            return Some(format!("{name} is not a finite number"));
        }
        if value < 0.0 {
            return Some(format!("{name} is negative"));
        }
    }
    None
}

/// Total order over delivered rows: fetch time, then position in the fetch,
/// then row content. Picking the maximum is independent of arrival order.
fn recency_cmp(a: &IncomingRow, b: &IncomingRow) -> Ordering {
    a.fetched_at
        .cmp(&b.fetched_at)
        .then(a.sequence.cmp(&b.sequence))
        .then(a.row.spend.total_cmp(&b.row.spend))
        .then(a.row.impressions.cmp(&b.row.impressions))
        .then(a.row.clicks.cmp(&b.row.clicks))
        .then(a.row.purchases.cmp(&b.row.purchases))
        .then(a.row.purchase_value.total_cmp(&b.row.purchase_value))
        .then_with(|| a.row.ad_name.cmp(&b.row.ad_name))
        .then_with(|| a.row.campaign_id.cmp(&b.row.campaign_id))
        .then_with(|| a.row.campaign_name.cmp(&b.row.campaign_name))
        .then_with(|| a.platform_id.cmp(&b.platform_id))
        .then_with(|| a.run_id.cmp(&b.run_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use adspend_core::Ratio;
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
    use uuid::Uuid;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, hour, 0, 0).single().unwrap()
    }

    fn engine() -> ReconciliationEngine {
        ReconciliationEngine::new(Arc::new(CategoryNormalizer::builtin()))
    }

    fn incoming(ad_id: &str, starts: NaiveDate, spend: f64, hour: u32, sequence: u64) -> IncomingRow {
        IncomingRow {
            row: RawPerformanceRow {
                ad_id: ad_id.to_string(),
                ad_name: "8/8/24 - Playmat - Rainbow - Blue - Tiny Land - Influencer - Video - Crawl demo"
                    .to_string(),
                campaign_id: "mc-10".to_string(),
                campaign_name: "Playmats | Prospecting".to_string(),
                reporting_starts: starts,
                reporting_ends: starts + Duration::days(6),
                spend,
                impressions: 10_000,
                clicks: 100,
                purchases: 4,
                purchase_value: spend * 3.0,
            },
            platform_id: "meta-ads".to_string(),
            run_id: Uuid::nil(),
            fetched_at: at(hour),
            sequence,
        }
    }

    fn batch() -> Vec<IncomingRow> {
        vec![
            incoming("m-101", date(2025, 8, 11), 500.0, 9, 0),
            incoming("m-101", date(2025, 8, 18), 380.0, 9, 1),
            incoming("m-101", date(2025, 8, 18), 395.0, 9, 7),
            incoming("m-101", date(2025, 8, 25), 420.0, 9, 2),
        ]
    }

    #[test]
    fn applying_the_same_batch_twice_changes_nothing() {
        let engine = engine();
        let once = engine.reconcile(WeeklyPeriodSet::new("m-101"), batch());
        let twice = engine.reconcile(once.periods.clone(), batch());
        assert_eq!(twice.periods, once.periods);
        assert!(twice.changed.is_empty());
        assert_eq!(twice.stats.unchanged, 3);
        assert_eq!(twice.gaps, once.gaps);
    }

    #[test]
    fn later_fetch_of_identical_numbers_is_unchanged() {
        let engine = engine();
        let first = engine.reconcile(WeeklyPeriodSet::new("m-101"), batch());
        let refetched: Vec<_> = batch()
            .into_iter()
            .map(|mut row| {
                row.fetched_at = at(15);
                row.run_id = Uuid::new_v4();
                row
            })
            .collect();
        let second = engine.reconcile(first.periods.clone(), refetched);
        assert_eq!(second.stats.updated, 0);
        assert_eq!(second.stats.unchanged, 3);
        assert!(second.changed.is_empty());
        assert_eq!(second.periods, first.periods);
    }

    #[test]
    fn duplicate_keys_are_deduplicated_not_summed() {
        let result = engine().reconcile(WeeklyPeriodSet::new("m-101"), batch());
        assert_eq!(result.periods.len(), 3);
        assert_eq!(result.stats.duplicates_dropped, 1);
        let key = PeriodKey::new("m-101", date(2025, 8, 18), date(2025, 8, 24));
        let period = result.periods.get(&key).unwrap();
        assert_eq!(period.metrics.spend, 395.0);
        assert_ne!(period.metrics.spend, 380.0 + 395.0);
    }

    #[test]
    fn most_recently_fetched_duplicate_wins() {
        let rows = vec![
            incoming("m-101", date(2025, 8, 18), 380.0, 11, 0),
            incoming("m-101", date(2025, 8, 18), 395.0, 9, 5),
        ];
        let result = engine().reconcile(WeeklyPeriodSet::new("m-101"), rows);
        assert_eq!(result.periods.periods()[0].metrics.spend, 380.0);
    }

    #[test]
    fn arrival_order_does_not_matter() {
        let engine = engine();
        let forward = engine.reconcile(WeeklyPeriodSet::new("m-101"), batch());
        let mut reversed_rows = batch();
        reversed_rows.reverse();
        let reversed = engine.reconcile(WeeklyPeriodSet::new("m-101"), reversed_rows);
        assert_eq!(forward.periods, reversed.periods);

        let tied = vec![
            incoming("m-101", date(2025, 8, 18), 380.0, 9, 3),
            incoming("m-101", date(2025, 8, 18), 395.0, 9, 3),
        ];
        let mut tied_reversed = tied.clone();
        tied_reversed.reverse();
        assert_eq!(
            engine.reconcile(WeeklyPeriodSet::new("m-101"), tied).periods,
            engine.reconcile(WeeklyPeriodSet::new("m-101"), tied_reversed).periods
        );
    }

    #[test]
    fn existing_key_is_replaced_whole() {
        let engine = engine();
        let first = engine.reconcile(WeeklyPeriodSet::new("m-101"), batch());
        let mut update = incoming("m-101", date(2025, 8, 25), 450.0, 12, 0);
        update.row.purchases = 0;
        let second = engine.reconcile(first.periods, vec![update]);
        assert_eq!(second.stats.updated, 1);
        assert_eq!(second.changed.len(), 1);
        let latest = second.periods.latest().unwrap();
        assert_eq!(latest.metrics.spend, 450.0);
        assert_eq!(latest.metrics.purchases, 0);
        assert_eq!(latest.derived.cpa, Ratio::Undefined);
        assert_eq!(latest.derived.roas, Ratio::Value(3.0));
        assert_eq!(latest.provenance.fetched_at, at(12));
    }

    #[test]
    fn older_fetch_does_not_replace_stored_period() {
        let engine = engine();
        let first = engine.reconcile(WeeklyPeriodSet::new("m-101"), batch());
        let late = incoming("m-101", date(2025, 8, 25), 1.0, 3, 0);
        let second = engine.reconcile(first.periods.clone(), vec![late]);
        assert_eq!(second.stats.stale, 1);
        assert_eq!(second.periods, first.periods);
    }

    #[test]
    fn reports_gap_between_non_contiguous_weeks() {
        let rows = vec![
            incoming("m-102", date(2025, 8, 25), 260.0, 9, 1),
            incoming("m-102", date(2025, 8, 11), 200.0, 9, 0),
        ];
        let result = engine().reconcile(WeeklyPeriodSet::new("m-102"), rows);
        assert_eq!(result.gaps.len(), 1);
        assert_eq!(result.gaps[0].missing_from(), date(2025, 8, 18));
        assert_eq!(result.gaps[0].missing_to(), date(2025, 8, 24));
        let starts: Vec<_> = result.periods.periods().iter().map(|p| p.reporting_starts()).collect();
        assert_eq!(starts, vec![date(2025, 8, 11), date(2025, 8, 25)]);
    }

    #[test]
    fn overlapping_window_is_reported_not_merged() {
        let engine = engine();
        let first = engine.reconcile(WeeklyPeriodSet::new("m-101"), batch());
        let shifted = incoming("m-101", date(2025, 8, 14), 999.0, 12, 0);
        let second = engine.reconcile(first.periods.clone(), vec![shifted.clone()]);
        assert_eq!(second.periods, first.periods);
        assert_eq!(second.conflicts.len(), 1);
        assert_eq!(second.conflicts[0].incoming, shifted.row.key());
        assert_eq!(
            second.conflicts[0].existing,
            PeriodKey::new("m-101", date(2025, 8, 11), date(2025, 8, 17))
        );

        let again = engine.reconcile(second.periods.clone(), vec![shifted]);
        assert_eq!(again.periods, second.periods);
        assert_eq!(again.conflicts, second.conflicts);
    }

    #[test]
    fn invalid_rows_are_rejected_with_reason() {
        let mut negative = incoming("m-101", date(2025, 8, 11), -5.0, 9, 0);
        negative.row.purchase_value = 0.0;
        let mut inverted = incoming("m-101", date(2025, 8, 18), 10.0, 9, 1);
        inverted.row.reporting_ends = date(2025, 8, 1);
        let foreign = incoming("m-999", date(2025, 8, 25), 10.0, 9, 2);

        let result = engine().reconcile(WeeklyPeriodSet::new("m-101"), vec![negative, inverted, foreign]);
        assert!(result.periods.is_empty());
        assert_eq!(result.rejected.len(), 3);
        assert!(result.rejected.iter().any(|r| r.reason == "spend is negative"));
        assert!(result.rejected.iter().any(|r| r.reason.contains("ends before")));
        assert!(result.rejected.iter().any(|r| r.reason.contains("m-999")));
    }

    #[test]
    fn attributes_carry_forward_until_the_name_changes() {
        let engine = engine();
        let first = engine.reconcile(WeeklyPeriodSet::new("m-101"), batch());
        let stored = first.periods.latest().unwrap().clone();
        assert_eq!(stored.category, CanonicalCategory::PlayMats);
        assert_eq!(stored.attributes.launch_date, Some(date(2024, 8, 8)));

        let next_week = incoming("m-101", date(2025, 9, 1), 300.0, 12, 0);
        let second = engine.reconcile(first.periods.clone(), vec![next_week]);
        let added = second.periods.latest().unwrap();
        assert_eq!(added.attributes, stored.attributes);
        assert_eq!(added.category, stored.category);

        let mut renamed = incoming("m-101", date(2025, 9, 1), 300.0, 13, 0);
        renamed.row.ad_name = "9/1/25 - Bath Mat - Whale".to_string();
        let third = engine.reconcile(second.periods, vec![renamed]);
        let replaced = third.periods.latest().unwrap();
        assert_eq!(replaced.category, CanonicalCategory::BathMats);
        assert_eq!(replaced.attributes.launch_date, Some(date(2025, 9, 1)));
    }

    #[test]
    fn batch_reconciles_each_ad_independently() {
        let mut rows = batch();
        rows.push(incoming("m-102", date(2025, 8, 11), 200.0, 9, 9));
        let results = engine().reconcile_batch(BTreeMap::new(), rows);
        assert_eq!(results.len(), 2);
        assert_eq!(results["m-101"].periods.len(), 3);
        assert_eq!(results["m-102"].periods.len(), 1);
        assert!(results.values().all(|r| r.rejected.is_empty()));
    }
}
