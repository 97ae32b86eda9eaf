//! Core domain model for ad-level performance reconciliation.

use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "adspend-core";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPerformanceRow {
    pub ad_id: String,
    pub ad_name: String,
    pub campaign_id: String,
    pub campaign_name: String,
    pub reporting_starts: NaiveDate,
    pub reporting_ends: NaiveDate,
    pub spend: f64,
    pub impressions: u64,
    pub clicks: u64,
    pub purchases: u64,
    pub purchase_value: f64,
}

impl RawPerformanceRow {
    pub fn key(&self) -> PeriodKey {
        PeriodKey {
            ad_id: self.ad_id.clone(),
            reporting_starts: self.reporting_starts,
            reporting_ends: self.reporting_ends,
        }
    }

    pub fn metrics(&self) -> RawMetrics {
        RawMetrics {
            spend: self.spend,
            impressions: self.impressions,
            clicks: self.clicks,
            purchases: self.purchases,
            purchase_value: self.purchase_value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeriodKey {
    pub ad_id: String,
    pub reporting_starts: NaiveDate,
    pub reporting_ends: NaiveDate,
}

impl PeriodKey {
    pub fn new(ad_id: impl Into<String>, reporting_starts: NaiveDate, reporting_ends: NaiveDate) -> Self {
        Self {
            ad_id: ad_id.into(),
            reporting_starts,
            reporting_ends,
        }
    }

    pub fn overlaps(&self, other: &PeriodKey) -> bool {
        self.ad_id == other.ad_id
            && self.reporting_starts <= other.reporting_ends
            && other.reporting_starts <= self.reporting_ends
    }

    pub fn days(&self) -> i64 {
        (self.reporting_ends - self.reporting_starts).num_days() + 1
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}..{}]",
            self.ad_id, self.reporting_starts, self.reporting_ends
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, starts: NaiveDate, ends: NaiveDate) -> bool {
        starts >= self.start && ends <= self.end
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// A derived ratio. A zero denominator is `Undefined`, never zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "Option<f64>", into = "Option<f64>")]
pub enum Ratio {
    Value(f64),
    Undefined,
}

impl Ratio {
    pub fn of(numerator: f64, denominator: f64) -> Self {
        if denominator == 0.0 || !denominator.is_finite() || !numerator.is_finite() {
            return Ratio::Undefined;
        }
        Ratio::Value(numerator / denominator)
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Ratio::Value(v) => Some(*v),
            Ratio::Undefined => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Ratio::Undefined)
    }
}

impl From<Option<f64>> for Ratio {
    fn from(value: Option<f64>) -> Self {
        match value {
            Some(v) if v.is_finite() => Ratio::Value(v),
            _ => Ratio::Undefined,
        }
    }
}

impl From<Ratio> for Option<f64> {
    fn from(value: Ratio) -> Self {
        value.value()
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ratio::Value(v) => write!(f, "{v:.2}"),
            Ratio::Undefined => f.write_str("n/a"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RawMetrics {
    pub spend: f64,
    pub impressions: u64,
    pub clicks: u64,
    pub purchases: u64,
    pub purchase_value: f64,
}

impl RawMetrics {
    pub fn derive(&self) -> DerivedMetrics {
        DerivedMetrics {
            cpa: Ratio::of(self.spend, self.purchases as f64),
            roas: Ratio::of(self.purchase_value, self.spend),
            cpc: Ratio::of(self.spend, self.clicks as f64),
            cpm: match Ratio::of(self.spend, self.impressions as f64) {
                Ratio::Value(v) => Ratio::Value(v * 1000.0),
                Ratio::Undefined => Ratio::Undefined,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetrics {
    pub cpa: Ratio,
    pub roas: Ratio,
    pub cpc: Ratio,
    pub cpm: Ratio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CanonicalCategory {
    #[serde(rename = "Play Mats")]
    PlayMats,
    #[serde(rename = "Bath Mats")]
    BathMats,
    #[serde(rename = "High Chairs")]
    HighChairs,
    #[serde(rename = "Bibs")]
    Bibs,
    #[serde(rename = "Teethers")]
    Teethers,
    #[serde(rename = "Blankets")]
    Blankets,
    #[serde(rename = "Multi Category")]
    MultiCategory,
    #[serde(rename = "Uncategorized")]
    Uncategorized,
}

impl CanonicalCategory {
    pub const ALL: [CanonicalCategory; 8] = [
        CanonicalCategory::PlayMats,
        CanonicalCategory::BathMats,
        CanonicalCategory::HighChairs,
        CanonicalCategory::Bibs,
        CanonicalCategory::Teethers,
        CanonicalCategory::Blankets,
        CanonicalCategory::MultiCategory,
        CanonicalCategory::Uncategorized,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalCategory::PlayMats => "Play Mats",
            CanonicalCategory::BathMats => "Bath Mats",
            CanonicalCategory::HighChairs => "High Chairs",
            CanonicalCategory::Bibs => "Bibs",
            CanonicalCategory::Teethers => "Teethers",
            CanonicalCategory::Blankets => "Blankets",
            CanonicalCategory::MultiCategory => "Multi Category",
            CanonicalCategory::Uncategorized => "Uncategorized",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }

    pub fn is_specific(&self) -> bool {
        !matches!(
            self,
            CanonicalCategory::MultiCategory | CanonicalCategory::Uncategorized
        )
    }
}

impl fmt::Display for CanonicalCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdFormat {
    Video,
    Static,
    Carousel,
    Ugc,
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameSegment {
    LaunchDate,
    Product,
    Variant,
    Color,
    Brand,
    Source,
    Format,
    Description,
}

/// A name segment that could not be interpreted. Recorded as data, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseDegradation {
    pub segment: NameSegment,
    pub raw: String,
    pub reason: String,
}

/// Structured attributes extracted from an ad name. Fields that failed to
/// parse are `None` and listed in `degradations`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParsedAdAttributes {
    pub launch_date: Option<NaiveDate>,
    pub product: Option<String>,
    pub variant: Option<String>,
    pub color: Option<String>,
    pub brand: Option<String>,
    pub source: Option<String>,
    pub format: Option<AdFormat>,
    pub description: Option<String>,
    /// Label used for category normalization: the product segment, else the campaign name.
    pub category_hint: Option<String>,
    #[serde(default)]
    pub degradations: Vec<ParseDegradation>,
}

impl ParsedAdAttributes {
    pub fn is_partial(&self) -> bool {
        !self.degradations.is_empty()
    }

    pub fn days_live(&self, today: NaiveDate) -> Option<i64> {
        self.launch_date.map(|launch| (today - launch).num_days())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestProvenance {
    pub platform_id: String,
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalAdPeriod {
    #[serde(flatten)]
    pub key: PeriodKey,
    pub ad_name: String,
    pub campaign_id: String,
    pub campaign_name: String,
    pub metrics: RawMetrics,
    pub derived: DerivedMetrics,
    pub category: CanonicalCategory,
    pub attributes: ParsedAdAttributes,
    pub provenance: IngestProvenance,
}

impl CanonicalAdPeriod {
    pub fn from_row(
        row: &RawPerformanceRow,
        category: CanonicalCategory,
        attributes: ParsedAdAttributes,
        provenance: IngestProvenance,
    ) -> Self {
        let metrics = row.metrics();
        Self {
            key: row.key(),
            ad_name: row.ad_name.clone(),
            campaign_id: row.campaign_id.clone(),
            campaign_name: row.campaign_name.clone(),
            derived: metrics.derive(),
            metrics,
            category,
            attributes,
            provenance,
        }
    }

    pub fn ad_id(&self) -> &str {
        &self.key.ad_id
    }

    pub fn reporting_starts(&self) -> NaiveDate {
        self.key.reporting_starts
    }

    pub fn reporting_ends(&self) -> NaiveDate {
        self.key.reporting_ends
    }

    pub fn metric(&self, metric: Metric) -> Ratio {
        match metric {
            Metric::Spend => Ratio::Value(self.metrics.spend),
            Metric::Impressions => Ratio::Value(self.metrics.impressions as f64),
            Metric::Clicks => Ratio::Value(self.metrics.clicks as f64),
            Metric::Purchases => Ratio::Value(self.metrics.purchases as f64),
            Metric::PurchaseValue => Ratio::Value(self.metrics.purchase_value),
            Metric::Roas => self.derived.roas,
            Metric::Cpa => self.derived.cpa,
            Metric::Cpc => self.derived.cpc,
            Metric::Cpm => self.derived.cpm,
        }
    }
}

/// Periods of one ad ordered by `reporting_starts`. No two periods overlap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyPeriodSet {
    ad_id: String,
    periods: Vec<CanonicalAdPeriod>,
}

impl WeeklyPeriodSet {
    pub fn new(ad_id: impl Into<String>) -> Self {
        Self {
            ad_id: ad_id.into(),
            periods: Vec::new(),
        }
    }

    pub fn from_periods(ad_id: impl Into<String>, periods: Vec<CanonicalAdPeriod>) -> Self {
        let ad_id = ad_id.into();
        let mut periods: Vec<_> = periods.into_iter().filter(|p| p.key.ad_id == ad_id).collect();
        periods.sort_by(|a, b| a.key.cmp(&b.key));
        Self { ad_id, periods }
    }

    pub fn ad_id(&self) -> &str {
        &self.ad_id
    }

    pub fn periods(&self) -> &[CanonicalAdPeriod] {
        &self.periods
    }

    pub fn into_periods(self) -> Vec<CanonicalAdPeriod> {
        self.periods
    }

    pub fn len(&self) -> usize {
        self.periods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.periods.is_empty()
    }

    pub fn get(&self, key: &PeriodKey) -> Option<&CanonicalAdPeriod> {
        self.periods.iter().find(|p| &p.key == key)
    }

    pub fn latest(&self) -> Option<&CanonicalAdPeriod> {
        self.periods.last()
    }

    pub fn latest_pair(&self) -> Option<(&CanonicalAdPeriod, &CanonicalAdPeriod)> {
        match self.periods.as_slice() {
            [.., older, newer] => Some((older, newer)),
            _ => None,
        }
    }

    pub fn coverage_gaps(&self) -> Vec<CoverageGap> {
        self.periods
            .windows(2)
            .filter_map(|pair| {
                let (current, next) = (&pair[0], &pair[1]);
                if next.reporting_starts() != current.reporting_ends() + Duration::days(1) {
                    Some(CoverageGap {
                        ad_id: self.ad_id.clone(),
                        previous_end: current.reporting_ends(),
                        next_start: next.reporting_starts(),
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    /// Replaces the stored periods. Callers guarantee the no-overlap invariant.
    pub fn replace_periods(&mut self, mut periods: Vec<CanonicalAdPeriod>) {
        periods.sort_by(|a, b| a.key.cmp(&b.key));
        self.periods = periods;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoverageGap {
    pub ad_id: String,
    pub previous_end: NaiveDate,
    pub next_start: NaiveDate,
}

impl CoverageGap {
    pub fn missing_from(&self) -> NaiveDate {
        self.previous_end + Duration::days(1)
    }

    pub fn missing_to(&self) -> NaiveDate {
        self.next_start - Duration::days(1)
    }

    pub fn missing_days(&self) -> i64 {
        (self.next_start - self.previous_end).num_days() - 1
    }
}

impl fmt::Display for CoverageGap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: missing {}..{} ({} days)",
            self.ad_id,
            self.missing_from(),
            self.missing_to(),
            self.missing_days()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Spend,
    Impressions,
    Clicks,
    Purchases,
    PurchaseValue,
    Roas,
    Cpa,
    Cpc,
    Cpm,
}

impl Metric {
    pub const ALL: [Metric; 9] = [
        Metric::Spend,
        Metric::Impressions,
        Metric::Clicks,
        Metric::Purchases,
        Metric::PurchaseValue,
        Metric::Roas,
        Metric::Cpa,
        Metric::Cpc,
        Metric::Cpm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Spend => "spend",
            Metric::Impressions => "impressions",
            Metric::Clicks => "clicks",
            Metric::Purchases => "purchases",
            Metric::PurchaseValue => "purchase_value",
            Metric::Roas => "roas",
            Metric::Cpa => "cpa",
            Metric::Cpc => "cpc",
            Metric::Cpm => "cpm",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Week-over-week change of one metric. `pct_change` is `None` when it is not
/// computable, which must never be read as 0%.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentumSignal {
    pub ad_id: String,
    pub metric: Metric,
    pub older_value: Option<f64>,
    pub newer_value: Option<f64>,
    pub pct_change: Option<f64>,
    pub contiguous: bool,
}
