use adspend_core::{Metric, MomentumSignal, Ratio, WeeklyPeriodSet};
use chrono::Duration;

pub const MOMENTUM_PCT_CAP: f64 = 1000.0;

/// Week-over-week change of `metric` between the two most recent periods.
///
/// `None` with fewer than two periods. The signal's `pct_change` is `None`
/// when the older value is zero or either value is undefined.
pub fn compute_momentum(periods: &WeeklyPeriodSet, metric: Metric) -> Option<MomentumSignal> {
    let (older, newer) = periods.latest_pair()?;
    let older_value = older.metric(metric).value();
    let newer_value = newer.metric(metric).value();
    let pct_change = match (older_value, newer_value) {
        (Some(old), Some(new)) => match Ratio::of(new - old, old) {
            Ratio::Value(ratio) => Some((ratio * 100.0).clamp(-MOMENTUM_PCT_CAP, MOMENTUM_PCT_CAP)),
            Ratio::Undefined => None,
        },
        _ => None,
    };

    Some(MomentumSignal {
        ad_id: periods.ad_id().to_string(),
        metric,
        older_value,
        newer_value,
        pct_change,
        contiguous: newer.reporting_starts() == older.reporting_ends() + Duration::days(1),
    })
}

pub fn momentum_all(periods: &WeeklyPeriodSet) -> Vec<MomentumSignal> {
    Metric::ALL
        .into_iter()
        .filter_map(|metric| compute_momentum(periods, metric))
        .collect()
}
