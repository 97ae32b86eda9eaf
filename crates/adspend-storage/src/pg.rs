//! Postgres-backed period store. The unique key on
//! `(ad_id, reporting_starts, reporting_ends)` makes every upsert atomic at the
//! storage boundary, so concurrent writers converge to one row per key.

use adspend_core::{
    CanonicalAdPeriod, CanonicalCategory, DerivedMetrics, IngestProvenance, ParsedAdAttributes,
    PeriodKey, RawMetrics, Ratio,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::{PageRequest, PeriodQuery, PeriodStore, ResetScope, StoreError, UpsertOutcome, UpsertSummary};

const UPSERT_SQL: &str = r#"
INSERT INTO ad_periods (
    ad_id, reporting_starts, reporting_ends,
    ad_name, campaign_id, campaign_name,
    spend, impressions, clicks, purchases, purchase_value,
    cpa, roas, cpc, cpm,
    category, attributes,
    platform_id, run_id, fetched_at
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
ON CONFLICT (ad_id, reporting_starts, reporting_ends) DO UPDATE SET
    ad_name = EXCLUDED.ad_name,
    campaign_id = EXCLUDED.campaign_id,
    campaign_name = EXCLUDED.campaign_name,
    spend = EXCLUDED.spend,
    impressions = EXCLUDED.impressions,
    clicks = EXCLUDED.clicks,
    purchases = EXCLUDED.purchases,
    purchase_value = EXCLUDED.purchase_value,
    cpa = EXCLUDED.cpa,
    roas = EXCLUDED.roas,
    cpc = EXCLUDED.cpc,
    cpm = EXCLUDED.cpm,
    category = EXCLUDED.category,
    attributes = EXCLUDED.attributes,
    platform_id = EXCLUDED.platform_id,
    run_id = EXCLUDED.run_id,
    fetched_at = EXCLUDED.fetched_at,
    updated_at = now()
WHERE ad_periods.fetched_at <= EXCLUDED.fetched_at
RETURNING (xmax = 0) AS inserted
"#;

const LIST_SQL: &str = r#"
SELECT ad_id, reporting_starts, reporting_ends,
       ad_name, campaign_id, campaign_name,
       spend, impressions, clicks, purchases, purchase_value,
       cpa, roas, cpc, cpm,
       category, attributes,
       platform_id, run_id, fetched_at
FROM ad_periods
WHERE ($1::text IS NULL OR ad_id = $1)
  AND ($2::date IS NULL OR reporting_ends >= $2)
  AND ($3::date IS NULL OR reporting_starts <= $3)
ORDER BY ad_id, reporting_starts, reporting_ends
LIMIT $4 OFFSET $5
"#;

#[derive(Debug, Clone)]
pub struct PgPeriodStore {
    pool: PgPool,
}

impl PgPeriodStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("ad_periods migrations applied");
        Ok(())
    }
}

// Counters are BIGINT; anything outside its range is refused rather than wrapped.
fn to_db_count(key: &PeriodKey, column: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("{column} {value} exceeds BIGINT"),
    })
}

fn from_db_count(key: &PeriodKey, column: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("negative {column} {value}"),
    })
}

fn row_to_period(row: &PgRow) -> Result<CanonicalAdPeriod, StoreError> {
    let key = PeriodKey {
        ad_id: row.try_get("ad_id")?,
        reporting_starts: row.try_get::<NaiveDate, _>("reporting_starts")?,
        reporting_ends: row.try_get::<NaiveDate, _>("reporting_ends")?,
    };
    let category_name: String = row.try_get("category")?;
    let category = CanonicalCategory::from_name(&category_name).ok_or_else(|| StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("unknown category {category_name:?}"),
    })?;
    let attributes: ParsedAdAttributes =
        serde_json::from_value(row.try_get::<serde_json::Value, _>("attributes")?)?;
    let metrics = RawMetrics {
        spend: row.try_get("spend")?,
        impressions: from_db_count(&key, "impressions", row.try_get("impressions")?)?,
        clicks: from_db_count(&key, "clicks", row.try_get("clicks")?)?,
        purchases: from_db_count(&key, "purchases", row.try_get("purchases")?)?,
        purchase_value: row.try_get("purchase_value")?,
    };
    let derived = DerivedMetrics {
        cpa: Ratio::from(row.try_get::<Option<f64>, _>("cpa")?),
        roas: Ratio::from(row.try_get::<Option<f64>, _>("roas")?),
        cpc: Ratio::from(row.try_get::<Option<f64>, _>("cpc")?),
        cpm: Ratio::from(row.try_get::<Option<f64>, _>("cpm")?),
    };

    Ok(CanonicalAdPeriod {
        key,
        ad_name: row.try_get("ad_name")?,
        campaign_id: row.try_get("campaign_id")?,
        campaign_name: row.try_get("campaign_name")?,
        metrics,
        derived,
        category,
        attributes,
        provenance: IngestProvenance {
            platform_id: row.try_get("platform_id")?,
            run_id: row.try_get::<Uuid, _>("run_id")?,
            fetched_at: row.try_get::<DateTime<Utc>, _>("fetched_at")?,
        },
    })
}

#[async_trait]
impl PeriodStore for PgPeriodStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn upsert_many(&self, periods: &[CanonicalAdPeriod]) -> Result<UpsertSummary, StoreError> {
        let mut summary = UpsertSummary::default();
        let mut tx = self.pool.begin().await?;
        for period in periods {
            let attributes = serde_json::to_value(&period.attributes)?;
            let metrics = &period.metrics;
            let returned = sqlx::query(UPSERT_SQL)
                .bind(&period.key.ad_id)
                .bind(period.key.reporting_starts)
                .bind(period.key.reporting_ends)
                .bind(&period.ad_name)
                .bind(&period.campaign_id)
                .bind(&period.campaign_name)
                .bind(period.metrics.spend)
                .bind(to_db_count(&period.key, "impressions", metrics.impressions)?)
                .bind(to_db_count(&period.key, "clicks", metrics.clicks)?)
                .bind(to_db_count(&period.key, "purchases", metrics.purchases)?)
                .bind(period.metrics.purchase_value)
                .bind(period.derived.cpa.value())
                .bind(period.derived.roas.value())
                .bind(period.derived.cpc.value())
                .bind(period.derived.cpm.value())
                .bind(period.category.as_str())
                .bind(attributes)
                .bind(&period.provenance.platform_id)
                .bind(period.provenance.run_id)
                .bind(period.provenance.fetched_at)
                .fetch_optional(&mut *tx)
                .await?;
            let outcome = match returned {
                Some(row) if row.try_get::<bool, _>("inserted")? => UpsertOutcome::Inserted,
                Some(_) => UpsertOutcome::Updated,
                None => UpsertOutcome::Stale,
            };
            summary.record(outcome);
        }
        tx.commit().await?;
        Ok(summary)
    }

    async fn list(
        &self,
        query: &PeriodQuery,
        page: PageRequest,
    ) -> Result<Vec<CanonicalAdPeriod>, StoreError> {
        let rows = sqlx::query(LIST_SQL)
            .bind(query.ad_id.as_deref())
            .bind(query.window.map(|w| w.start))
            .bind(query.window.map(|w| w.end))
            .bind(i64::try_from(page.limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(page.offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_period).collect()
    }

    async fn reset(&self, scope: &ResetScope) -> Result<usize, StoreError> {
        let result = match scope {
            ResetScope::All => sqlx::query("DELETE FROM ad_periods").execute(&self.pool).await?,
            ResetScope::Ad(ad_id) => {
                sqlx::query("DELETE FROM ad_periods WHERE ad_id = $1")
                    .bind(ad_id)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> PeriodKey {
        PeriodKey::new(
            "m-101",
            NaiveDate::from_ymd_opt(2025, 8, 4).unwrap(),
            NaiveDate::from_ymd_opt(2025, 8, 10).unwrap(),
        )
    }

    #[test]
    fn counters_beyond_bigint_are_refused() {
        assert_eq!(to_db_count(&key(), "clicks", 42).unwrap(), 42);
        assert_eq!(to_db_count(&key(), "clicks", i64::MAX as u64).unwrap(), i64::MAX);
        let err = to_db_count(&key(), "impressions", u64::MAX).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(err.to_string().contains("impressions"));
    }

    #[test]
    fn negative_stored_counters_are_corrupt() {
        assert_eq!(from_db_count(&key(), "purchases", 7).unwrap(), 7);
        let err = from_db_count(&key(), "purchases", -1).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}
