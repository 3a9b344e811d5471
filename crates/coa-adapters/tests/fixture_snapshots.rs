use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use coa_adapters::{
    AdapterContext, FixtureSearchSource, SearchPerformanceSource, WindowRequest,
};
use uuid::Uuid;

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn ctx() -> AdapterContext {
    AdapterContext {
        run_id: Uuid::new_v4(),
        fetched_at: Utc::now(),
    }
}

#[test]
fn fixture_files_exist() {
    assert!(fixtures().join("search-console/sample.json").exists());
    assert!(fixtures().join("catalog/sample.json").exists());
    assert!(fixtures().join("../coa.yaml").exists());
}

#[tokio::test]
async fn search_fixture_respects_window_and_country() {
    let source = FixtureSearchSource::new(fixtures().join("search-console/sample.json"));
    let window = WindowRequest {
        days: 30,
        end: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        country: Some("NLD".into()),
    };
    let batch = source.fetch_window(&ctx(), &window).await.unwrap();
    assert_eq!(batch.items.len(), 6);
    assert!(batch.items.iter().all(|r| r.country == "nld"));
    assert_eq!(batch.raw_pages.len(), 1);
}
