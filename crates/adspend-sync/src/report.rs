//! Run reports and parquet snapshots under `reports/<run_id>/`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use adspend_core::{CanonicalAdPeriod, CoverageGap};
use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::{FailedRange, SyncRunSummary};

pub const BRIEF_FILE: &str = "sync_brief.md";
pub const DELTA_FILE: &str = "ad_periods_delta.json";
pub const GAPS_FILE: &str = "coverage_gaps.json";
pub const FAILED_RANGES_FILE: &str = "failed_ranges.json";
pub const ISSUES_FILE: &str = "run_issues.json";

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

pub fn run_dir(reports_root: &Path, run_id: Uuid) -> PathBuf {
    reports_root.join(run_id.to_string())
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

pub async fn write_run_reports(reports_dir: &Path, summary: &SyncRunSummary) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join(BRIEF_FILE), sync_brief_markdown(summary))
        .await
        .context("writing sync_brief.md")?;

    let changed: Vec<&CanonicalAdPeriod> = summary
        .platforms
        .iter()
        .flat_map(|p| p.changed.iter())
        .collect();
    write_json(
        &reports_dir.join(DELTA_FILE),
        &serde_json::json!({
            "run": {
                "run_id": summary.run_id,
                "resumed_from": summary.resumed_from,
                "started_at": summary.started_at,
                "finished_at": summary.finished_at,
            },
            "periods": changed,
        }),
    )
    .await?;

    write_json(&reports_dir.join(GAPS_FILE), &summary.gaps()).await?;
    write_json(&reports_dir.join(FAILED_RANGES_FILE), &summary.failed_ranges()).await?;

    let issues: Vec<_> = summary
        .platforms
        .iter()
        .map(|p| {
            serde_json::json!({
                "platform_id": p.platform_id,
                "window": p.window,
                "incomplete": p.incomplete,
                "conflicts": p.conflicts,
                "rejected": p.rejected,
                "failed_ads": p.failed_ads,
            })
        })
        .collect();
    write_json(&reports_dir.join(ISSUES_FILE), &issues).await
}

pub fn sync_brief_markdown(summary: &SyncRunSummary) -> String {
    let totals = summary.totals();
    let mut lines = vec![
        "# Ad-Spend Sync Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
    ];
    if let Some(previous) = summary.resumed_from {
        lines.push(format!("- Resumed failed ranges of run `{previous}`"));
    }
    lines.push(format!("- Started: {}", summary.started_at));
    lines.push(format!("- Finished: {}", summary.finished_at));
    lines.push(format!(
        "- Periods: {} inserted, {} updated, {} unchanged, {} stale",
        totals.inserted, totals.updated, totals.unchanged, totals.stale
    ));
    lines.push(format!("- Duplicate rows dropped: {}", totals.duplicates_dropped));
    lines.push(String::new());
    lines.push("## Platforms".to_string());
    for platform in &summary.platforms {
        let status = if let Some(range) = &platform.failed_range {
            format!("fetch failed at offset {} ({})", range.offset, range.error)
        } else if let Some(incomplete) = &platform.incomplete {
            format!(
                "incomplete: expected {} rows, received {}",
                incomplete.expected, incomplete.received
            )
        } else if !platform.failed_ads.is_empty() {
            format!("{} ad(s) failed", platform.failed_ads.len())
        } else {
            "ok".to_string()
        };
        lines.push(format!(
            "- {} [{}]: {} rows in {} page(s), {} changed, {} gap(s), {} conflict(s), {} rejected; {}",
            platform.platform_id,
            platform.window,
            platform.rows_fetched,
            platform.page_requests,
            platform.changed.len(),
            platform.gaps.len(),
            platform.conflicts.len(),
            platform.rejected.len(),
            status
        ));
    }

    let gaps = summary.gaps();
    if !gaps.is_empty() {
        lines.push(String::new());
        lines.push("## Coverage Gaps".to_string());
        lines.extend(gaps.iter().map(|gap| format!("- {gap}")));
    }
    lines.push(String::new());
    lines.join("\n")
}

pub async fn read_failed_ranges(reports_root: &Path, run_id: Uuid) -> Result<Vec<FailedRange>> {
    let path = run_dir(reports_root, run_id).join(FAILED_RANGES_FILE);
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn report_runs_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# Ad-Spend Sync Runs".to_string(), String::new()];
    for dir in dirs {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let delta_path = dir.path().join(DELTA_FILE);
        let gaps_path = dir.path().join(GAPS_FILE);
        let failed_path = dir.path().join(FAILED_RANGES_FILE);
        let manifest_path = dir.path().join("snapshots").join("manifest.json");

        let delta: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&delta_path)
                .with_context(|| format!("reading {}", delta_path.display()))?,
        )
        .with_context(|| format!("parsing {}", delta_path.display()))?;
        let changed = delta
            .get("periods")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        let gaps = json_array_len(&gaps_path)?;
        let failed = json_array_len(&failed_path)?;

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- changed periods: {changed}"));
        lines.push(format!("- coverage gaps: {gaps}"));
        lines.push(format!("- failed ranges: {failed}"));
        if failed > 0 {
            lines.push(format!("- resume with: `adspend-cli resume {run_id}`"));
        }
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

fn json_array_len(path: &Path) -> Result<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let value: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?,
    )
    .with_context(|| format!("parsing {}", path.display()))?;
    Ok(value.as_array().map(|a| a.len()).unwrap_or(0))
}

pub async fn export_parquet_snapshots(
    reports_dir: &Path,
    periods: &[CanonicalAdPeriod],
    gaps: &[CoverageGap],
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let periods_path = snapshot_dir.join("ad_periods.parquet");
    let gaps_path = snapshot_dir.join("coverage_gaps.parquet");
    write_periods_parquet(&periods_path, periods)?;
    write_gaps_parquet(&gaps_path, gaps)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("ad_periods", reports_dir, &periods_path, periods.len())?,
            manifest_entry("coverage_gaps", reports_dir, &gaps_path, gaps.len())?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    write_json(&manifest_path, &manifest).await?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_periods_parquet(path: &Path, periods: &[CanonicalAdPeriod]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("ad_id", DataType::Utf8, false),
        ArrowField::new("reporting_starts", DataType::Utf8, false),
        ArrowField::new("reporting_ends", DataType::Utf8, false),
        ArrowField::new("ad_name", DataType::Utf8, false),
        ArrowField::new("campaign_id", DataType::Utf8, false),
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("launch_date", DataType::Utf8, true),
        ArrowField::new("spend", DataType::Float64, false),
        ArrowField::new("impressions", DataType::UInt64, false),
        ArrowField::new("clicks", DataType::UInt64, false),
        ArrowField::new("purchases", DataType::UInt64, false),
        ArrowField::new("purchase_value", DataType::Float64, false),
        ArrowField::new("cpa", DataType::Float64, true),
        ArrowField::new("roas", DataType::Float64, true),
        ArrowField::new("cpc", DataType::Float64, true),
        ArrowField::new("cpm", DataType::Float64, true),
        ArrowField::new("platform_id", DataType::Utf8, false),
        ArrowField::new("fetched_at", DataType::Utf8, false),
    ]));

    let strings = |f: &dyn Fn(&CanonicalAdPeriod) -> String| {
        StringArray::from(periods.iter().map(|p| Some(f(p))).collect::<Vec<_>>())
    };
    let ratios = |f: &dyn Fn(&CanonicalAdPeriod) -> Option<f64>| {
        Float64Array::from(periods.iter().map(f).collect::<Vec<_>>())
    };

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(strings(&|p| p.key.ad_id.clone())),
            Arc::new(strings(&|p| p.reporting_starts().to_string())),
            Arc::new(strings(&|p| p.reporting_ends().to_string())),
            Arc::new(strings(&|p| p.ad_name.clone())),
            Arc::new(strings(&|p| p.campaign_id.clone())),
            Arc::new(strings(&|p| p.category.as_str().to_string())),
            Arc::new(StringArray::from(
                periods
                    .iter()
                    .map(|p| p.attributes.launch_date.map(|d| d.to_string()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                periods.iter().map(|p| p.metrics.spend).collect::<Vec<_>>(),
            )),
            Arc::new(UInt64Array::from(
                periods.iter().map(|p| p.metrics.impressions).collect::<Vec<_>>(),
            )),
            Arc::new(UInt64Array::from(
                periods.iter().map(|p| p.metrics.clicks).collect::<Vec<_>>(),
            )),
            Arc::new(UInt64Array::from(
                periods.iter().map(|p| p.metrics.purchases).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                periods.iter().map(|p| p.metrics.purchase_value).collect::<Vec<_>>(),
            )),
            Arc::new(ratios(&|p| p.derived.cpa.value())),
            Arc::new(ratios(&|p| p.derived.roas.value())),
            Arc::new(ratios(&|p| p.derived.cpc.value())),
            Arc::new(ratios(&|p| p.derived.cpm.value())),
            Arc::new(strings(&|p| p.provenance.platform_id.clone())),
            Arc::new(strings(&|p| p.provenance.fetched_at.to_rfc3339())),
        ],
    )
    .context("building ad_periods record batch")?;
    write_parquet(path, batch)
}

fn write_gaps_parquet(path: &Path, gaps: &[CoverageGap]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("ad_id", DataType::Utf8, false),
        ArrowField::new("missing_from", DataType::Utf8, false),
        ArrowField::new("missing_to", DataType::Utf8, false),
        ArrowField::new("missing_days", DataType::Int64, false),
    ]));
    let ad_ids = StringArray::from(gaps.iter().map(|g| Some(g.ad_id.as_str())).collect::<Vec<_>>());
    let from = StringArray::from(
        gaps.iter()
            .map(|g| Some(g.missing_from().to_string()))
            .collect::<Vec<_>>(),
    );
    let to = StringArray::from(
        gaps.iter()
            .map(|g| Some(g.missing_to().to_string()))
            .collect::<Vec<_>>(),
    );
    let days = Int64Array::from(gaps.iter().map(|g| g.missing_days()).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(
        schema,
        vec![Arc::new(ad_ids), Arc::new(from), Arc::new(to), Arc::new(days)],
    )
    .context("building coverage_gaps record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}
