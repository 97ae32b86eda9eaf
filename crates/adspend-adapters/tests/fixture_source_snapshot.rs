use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use adspend_adapters::{load_fixture_bundle, parse_ad_name};
use serde_json::{json, Value};

const PLATFORMS: [&str; 3] = ["meta-ads", "google-ads", "tiktok-ads"];

fn sample_dir(platform_id: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(platform_id)
        .join("sample")
}

#[test]
fn parsed_names_match_golden_snapshots() {
    for platform_id in PLATFORMS {
        let dir = sample_dir(platform_id);
        let bundle = load_fixture_bundle(dir.join("bundle.json")).expect("bundle");
        assert_eq!(bundle.platform_id, platform_id);

        let mut by_ad = BTreeMap::new();
        for row in &bundle.rows {
            by_ad
                .entry(row.ad_id.clone())
                .or_insert_with(|| parse_ad_name(&row.ad_name, &row.campaign_name));
        }
        let ads: Vec<Value> = by_ad
            .into_iter()
            .map(|(ad_id, attributes)| json!({ "ad_id": ad_id, "attributes": attributes }))
            .collect();
        let actual = json!({ "fixture_id": bundle.fixture_id, "ads": ads });

        let text = std::fs::read_to_string(dir.join("snapshot.json")).expect("snapshot");
        let expected: Value = serde_json::from_str(&text).expect("snapshot json");
        assert_eq!(actual, expected, "snapshot drift for {platform_id}");
    }
}

#[test]
fn bundles_only_carry_weekly_windows() {
    for platform_id in PLATFORMS {
        let bundle = load_fixture_bundle(sample_dir(platform_id).join("bundle.json")).expect("bundle");
        assert!(!bundle.rows.is_empty());
        for row in &bundle.rows {
            assert!(row.reporting_starts <= row.reporting_ends, "{platform_id} {}", row.ad_id);
            assert_eq!((row.reporting_ends - row.reporting_starts).num_days(), 6);
        }
    }
}
