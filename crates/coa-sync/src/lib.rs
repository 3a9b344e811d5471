//! Analysis run orchestration: fetch, archive, analyze, persist, report.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, NaiveDate, Utc};
use coa_adapters::{
    catalog_source_for, search_source_for, AdapterContext, CatalogSource, CatalogSourceConfig,
    SearchPerformanceSource, SearchSourceConfig, WindowRequest,
};
use coa_analysis::{AnalysisEngine, AnalysisOutcome, ScoredCluster};
use coa_core::QueryThresholds;
use coa_storage::{
    HttpClientConfig, HttpFetcher, MemoryOpportunityStore, OpportunityStore, PgOpportunityStore,
    SnapshotArchive, StatusPolicy, TokenBucketConfig,
};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "coa-sync";

pub const SETTINGS_FILE: &str = "coa.yaml";

/// Process-level settings read from the environment.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub reports_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Request budget shared by all source calls; `None` means unthrottled.
    pub http_requests_per_sec: Option<u32>,
}

impl AnalysisConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("COA_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            reports_dir: std::env::var("COA_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("reports")),
            archive_dir: std::env::var("COA_ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("archive")),
            scheduler_enabled: std::env::var("COA_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            refresh_cron: std::env::var("COA_REFRESH_CRON")
                .unwrap_or_else(|_| "0 0 5 * * *".to_string()),
            user_agent: std::env::var("COA_USER_AGENT")
                .unwrap_or_else(|_| "coa-analysis/0.1".to_string()),
            http_timeout_secs: std::env::var("COA_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            http_requests_per_sec: std::env::var("COA_HTTP_RPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|rps| *rps > 0),
            workspace_root,
        }
    }

    /// Everything rooted in one directory; used by tests and dry runs.
    pub fn rooted_at(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        Self {
            database_url: None,
            reports_dir: workspace_root.join("reports"),
            archive_dir: workspace_root.join("archive"),
            scheduler_enabled: false,
            refresh_cron: "0 0 5 * * *".to_string(),
            user_agent: "coa-analysis/0.1".to_string(),
            http_timeout_secs: 30,
            http_requests_per_sec: None,
            workspace_root,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            token_bucket: self.http_requests_per_sec.map(|rps| TokenBucketConfig {
                capacity: rps,
                refill_every: Duration::from_secs(1) / rps,
            }),
            ..Default::default()
        }
    }
}

fn default_window_days() -> u32 {
    30
}

fn default_min_impressions() -> u64 {
    QueryThresholds::default().min_impressions
}

fn default_max_position() -> f64 {
    QueryThresholds::default().max_position
}

/// Per-run parameters and source selection from `coa.yaml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunSettings {
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default = "default_min_impressions")]
    pub min_impressions: u64,
    #[serde(default = "default_max_position")]
    pub max_position: f64,
    #[serde(default)]
    pub status_policy: StatusPolicy,
    pub search_source: SearchSourceConfig,
    pub catalog_source: CatalogSourceConfig,
}

impl RunSettings {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing run settings")
    }

    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(SETTINGS_FILE);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }
}

/// Command-line overrides for a single run.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub window_days: Option<u32>,
    pub country: Option<String>,
    pub min_impressions: Option<u64>,
    pub max_position: Option<f64>,
    pub end_date: Option<NaiveDate>,
}

impl RunOverrides {
    pub fn resolve(&self, settings: &RunSettings, today: NaiveDate) -> (WindowRequest, QueryThresholds) {
        let window = WindowRequest {
            days: self.window_days.unwrap_or(settings.window_days),
            end: self.end_date.unwrap_or(today),
            country: self.country.clone().or_else(|| settings.country.clone()),
        };
        let thresholds = QueryThresholds {
            min_impressions: self.min_impressions.unwrap_or(settings.min_impressions),
            max_position: self.max_position.unwrap_or(settings.max_position),
        };
        (window, thresholds)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub country: Option<String>,
    pub raw_records: usize,
    pub catalog_items: usize,
    pub aggregated_queries: usize,
    pub clusters_found: usize,
    pub opportunities_written: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failed_writes: Vec<String>,
    pub reports_dir: String,
    pub parquet_manifest: String,
    /// Report or snapshot writes that failed after the opportunities were
    /// persisted. The run still counts as written.
    pub report_errors: Vec<String>,
}

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
}

pub struct AnalysisPipeline {
    config: AnalysisConfig,
    settings: RunSettings,
    search: Box<dyn SearchPerformanceSource>,
    catalog: Box<dyn CatalogSource>,
    store: Arc<dyn OpportunityStore>,
    archive: SnapshotArchive,
}

impl AnalysisPipeline {
    pub fn new(
        config: AnalysisConfig,
        settings: RunSettings,
        store: Arc<dyn OpportunityStore>,
    ) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let search = search_source_for(&settings.search_source, &config.workspace_root, http.clone())
            .context("configuring search performance source")?;
        let catalog = catalog_source_for(&settings.catalog_source, &config.workspace_root, http)
            .context("configuring catalog source")?;
        Ok(Self::with_sources(config, settings, store, search, catalog))
    }

    pub fn with_sources(
        config: AnalysisConfig,
        settings: RunSettings,
        store: Arc<dyn OpportunityStore>,
        search: Box<dyn SearchPerformanceSource>,
        catalog: Box<dyn CatalogSource>,
    ) -> Self {
        let archive = SnapshotArchive::new(config.archive_dir.clone());
        Self {
            config,
            settings,
            search,
            catalog,
            store,
            archive,
        }
    }

    pub async fn run_once(&self, overrides: &RunOverrides) -> Result<AnalysisSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("analysis_run", %run_id);
        self.run_inner(run_id, overrides).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, overrides: &RunOverrides) -> Result<AnalysisSummary> {
        let started_at = Utc::now();
        let (window, thresholds) = overrides.resolve(&self.settings, started_at.date_naive());
        let ctx = AdapterContext {
            run_id,
            fetched_at: started_at,
        };

        let search = self
            .search
            .fetch_window(&ctx, &window)
            .await
            .with_context(|| format!("fetching search performance from {}", self.search.source_id()))?;
        let catalog = self
            .catalog
            .fetch_catalog(&ctx)
            .await
            .with_context(|| format!("fetching catalog from {}", self.catalog.source_id()))?;
        info!(
            raw_records = search.items.len(),
            catalog_items = catalog.items.len(),
            window_start = %window.start(),
            window_end = %window.end,
            "fetched sources"
        );

        for page in &search.raw_pages {
            self.archive
                .store_payload(started_at, self.search.source_id(), page)
                .await?;
        }
        for page in &catalog.raw_pages {
            self.archive
                .store_payload(started_at, self.catalog.source_id(), page)
                .await?;
        }

        let outcome = AnalysisEngine::new(thresholds).analyze(&search.items, &catalog.items);
        let report = self.store.upsert_batch(&outcome.candidates()).await;
        info!(
            clusters_found = outcome.clusters_found,
            written = report.written(),
            failed = report.failed.len(),
            "persisted opportunities"
        );

        let finished_at = Utc::now();
        let reports_dir = self.config.reports_dir.join(run_id.to_string());
        let mut summary = AnalysisSummary {
            run_id,
            started_at,
            finished_at,
            window_start: window.start(),
            window_end: window.end,
            country: window.country.clone(),
            raw_records: outcome.raw_records,
            catalog_items: catalog.items.len(),
            aggregated_queries: outcome.aggregated.len(),
            clusters_found: outcome.clusters_found,
            opportunities_written: report.written(),
            inserted: report.inserted,
            updated: report.updated,
            failed_writes: report.failed,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: String::new(),
            report_errors: Vec::new(),
        };

        match export_parquet_snapshots(&reports_dir, &outcome.scored).await {
            Ok(manifest) => summary.parquet_manifest = manifest.display().to_string(),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "parquet snapshot export failed");
                summary.report_errors.push(format!("parquet snapshots: {err:#}"));
            }
        }
        if let Err(err) = write_reports(&reports_dir, &summary, &outcome).await {
            warn!(error = %format!("{err:#}"), "run report write failed");
            summary.report_errors.push(format!("reports: {err:#}"));
        }
        Ok(summary)
    }

    /// Cron-driven refresh, only when enabled in the environment.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.refresh_cron.clone();
        let pipeline = self.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.run_once(&RunOverrides::default()).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        clusters_found = summary.clusters_found,
                        opportunities_written = summary.opportunities_written,
                        "scheduled refresh complete"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled refresh failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Store for one run: in-memory for dry runs, Postgres otherwise. A real run
/// without `DATABASE_URL` is an error rather than a run that persists nothing.
pub async fn store_for_run(
    config: &AnalysisConfig,
    status_policy: StatusPolicy,
    dry_run: bool,
) -> Result<Arc<dyn OpportunityStore>> {
    if dry_run {
        info!("dry run; using in-memory opportunity store");
        return Ok(Arc::new(MemoryOpportunityStore::new(status_policy)));
    }
    let Some(url) = &config.database_url else {
        bail!("DATABASE_URL must be set to persist opportunities; pass --dry-run to analyze without it");
    };
    let store = PgOpportunityStore::connect(url, status_policy)
        .await
        .context("connecting to opportunity store")?;
    Ok(Arc::new(store))
}

pub async fn pipeline_from_env(dry_run: bool) -> Result<AnalysisPipeline> {
    let config = AnalysisConfig::from_env();
    let settings = RunSettings::load(&config.workspace_root)?;
    let store = store_for_run(&config, settings.status_policy, dry_run).await?;
    AnalysisPipeline::new(config, settings, store)
}

async fn write_reports(
    reports_dir: &Path,
    summary: &AnalysisSummary,
    outcome: &AnalysisOutcome,
) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join("brief.md"), render_brief(summary, &outcome.scored))
        .await
        .context("writing brief.md")?;

    let json = serde_json::to_vec_pretty(&serde_json::json!({
        "run": summary,
        "opportunities": outcome.scored,
    }))
    .context("serializing opportunities report")?;
    fs::write(reports_dir.join("opportunities.json"), json)
        .await
        .context("writing opportunities.json")?;
    Ok(())
}

pub fn render_brief(summary: &AnalysisSummary, scored: &[ScoredCluster]) -> String {
    let mut lines = vec![
        "# Content Opportunity Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Window: {} .. {}", summary.window_start, summary.window_end),
        format!(
            "- Country: {}",
            summary.country.as_deref().unwrap_or("all")
        ),
        format!("- Raw rows: {}", summary.raw_records),
        format!("- Queries after thresholds: {}", summary.aggregated_queries),
        format!("- Clusters found: {}", summary.clusters_found),
        format!("- Opportunities written: {}", summary.opportunities_written),
    ];
    if !summary.failed_writes.is_empty() {
        lines.push(format!("- Failed writes: {}", summary.failed_writes.join(", ")));
    }
    lines.push(String::new());
    lines.push("## Top Opportunities".to_string());
    lines.push(String::new());
    lines.push("| Score | Keyword | Impressions | Position | Product | Related queries |".to_string());
    lines.push("|---:|---|---:|---:|---|---:|".to_string());
    for item in scored.iter().take(25) {
        let c = &item.candidate;
        lines.push(format!(
            "| {:.1} | {} | {} | {:.1} | {} | {} |",
            c.opportunity_score,
            c.keyword,
            c.impressions_30d,
            c.current_position,
            c.related_product_id.as_deref().unwrap_or("-"),
            item.cluster.len().saturating_sub(1)
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

async fn export_parquet_snapshots(reports_dir: &Path, scored: &[ScoredCluster]) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let opportunities_path = snapshot_dir.join("opportunities.parquet");
    let members_path = snapshot_dir.join("cluster_members.parquet");
    write_opportunities_parquet(&opportunities_path, scored)?;
    write_cluster_members_parquet(&members_path, scored)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("opportunities", reports_dir, &opportunities_path)?,
            manifest_entry("cluster_members", reports_dir, &members_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
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

fn write_opportunities_parquet(path: &Path, scored: &[ScoredCluster]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("keyword", DataType::Utf8, false),
        ArrowField::new("impressions_30d", DataType::UInt64, false),
        ArrowField::new("clicks_30d", DataType::UInt64, false),
        ArrowField::new("current_position", DataType::Float64, false),
        ArrowField::new("related_product_id", DataType::Utf8, true),
        ArrowField::new("opportunity_score", DataType::Float64, false),
        ArrowField::new("impression_score", DataType::Float64, false),
        ArrowField::new("position_score", DataType::Float64, false),
    ]));

    let keywords = StringArray::from(
        scored
            .iter()
            .map(|s| Some(s.candidate.keyword.as_str()))
            .collect::<Vec<_>>(),
    );
    let impressions = UInt64Array::from(
        scored
            .iter()
            .map(|s| s.candidate.impressions_30d)
            .collect::<Vec<_>>(),
    );
    let clicks = UInt64Array::from(scored.iter().map(|s| s.candidate.clicks_30d).collect::<Vec<_>>());
    let positions = Float64Array::from(
        scored
            .iter()
            .map(|s| s.candidate.current_position)
            .collect::<Vec<_>>(),
    );
    let products = StringArray::from(
        scored
            .iter()
            .map(|s| s.candidate.related_product_id.as_deref())
            .collect::<Vec<_>>(),
    );
    let scores = Float64Array::from(
        scored
            .iter()
            .map(|s| s.candidate.opportunity_score)
            .collect::<Vec<_>>(),
    );
    let impression_scores = Float64Array::from(
        scored
            .iter()
            .map(|s| s.breakdown.impression)
            .collect::<Vec<_>>(),
    );
    let position_scores =
        Float64Array::from(scored.iter().map(|s| s.breakdown.position).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(keywords),
            Arc::new(impressions),
            Arc::new(clicks),
            Arc::new(positions),
            Arc::new(products),
            Arc::new(scores),
            Arc::new(impression_scores),
            Arc::new(position_scores),
        ],
    )
    .context("building opportunities record batch")?;
    write_parquet(path, batch)
}

fn write_cluster_members_parquet(path: &Path, scored: &[ScoredCluster]) -> Result<()> {
    let rows = scored
        .iter()
        .flat_map(|s| {
            s.cluster
                .queries
                .iter()
                .map(move |q| (s.candidate.keyword.as_str(), q.as_str()))
        })
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("keyword", DataType::Utf8, false),
        ArrowField::new("member_query", DataType::Utf8, false),
    ]));
    let keywords = StringArray::from(rows.iter().map(|(k, _)| Some(*k)).collect::<Vec<_>>());
    let members = StringArray::from(rows.iter().map(|(_, q)| Some(*q)).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(schema, vec![Arc::new(keywords), Arc::new(members)])
        .context("building cluster_members record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
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
    })
}

/// Markdown digest of the most recent runs under `reports_root`.
pub fn report_recent_runs(runs: usize, reports_root: &Path) -> Result<String> {
    let mut lines = vec!["# Recent Analysis Runs".to_string(), String::new()];
    if !reports_root.exists() {
        lines.push("_no runs recorded yet_".to_string());
        return Ok(lines.join("\n"));
    }

    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    for dir in dirs.into_iter().take(runs.max(1)) {
        let report_path = dir.path().join("opportunities.json");
        if !report_path.exists() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&report_path)
                .with_context(|| format!("reading {}", report_path.display()))?,
        )
        .with_context(|| format!("parsing {}", report_path.display()))?;
        let run = value.get("run");
        let field = |name: &str| {
            run.and_then(|r| r.get(name))
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "?".to_string())
        };
        let top = value
            .get("opportunities")
            .and_then(|v| v.as_array())
            .and_then(|a| a.first())
            .and_then(|o| o.pointer("/candidate/keyword"))
            .and_then(|k| k.as_str())
            .unwrap_or("-");

        lines.push(format!("## Run `{}`", dir.file_name().to_string_lossy()));
        lines.push(format!("- finished: {}", field("finished_at")));
        lines.push(format!("- clusters found: {}", field("clusters_found")));
        lines.push(format!("- opportunities written: {}", field("opportunities_written")));
        lines.push(format!("- top keyword: {top}"));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use coa_adapters::{FixtureCatalogSource, FixtureSearchSource};
    use coa_core::OpportunityStatus;
    use tempfile::tempdir;

    fn fixtures_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
    }

    fn settings() -> RunSettings {
        RunSettings::from_yaml(
            r#"
window_days: 30
min_impressions: 10
max_position: 50
search_source:
  kind: fixture
  path: search.json
catalog_source:
  kind: fixture
  path: catalog.json
"#,
        )
        .unwrap()
    }

    fn january() -> RunOverrides {
        RunOverrides {
            end_date: NaiveDate::from_ymd_opt(2024, 1, 31),
            ..Default::default()
        }
    }

    fn pipeline(root: &Path, store: Arc<dyn OpportunityStore>) -> AnalysisPipeline {
        AnalysisPipeline::with_sources(
            AnalysisConfig::rooted_at(root),
            settings(),
            store,
            Box::new(FixtureSearchSource::new(fixtures_root().join("search-console/sample.json"))),
            Box::new(FixtureCatalogSource::new(fixtures_root().join("catalog/sample.json"))),
        )
    }

    #[test]
    fn settings_defaults_and_policy() {
        let s = settings();
        assert_eq!(s.status_policy, StatusPolicy::Preserve);
        assert!(s.country.is_none());

        let legacy = RunSettings::from_yaml(
            "status_policy: reset_to_identified\nsearch_source: {kind: fixture, path: a}\ncatalog_source: {kind: fixture, path: b}\n",
        )
        .unwrap();
        assert_eq!(legacy.status_policy, StatusPolicy::ResetToIdentified);
        assert_eq!(legacy.window_days, 30);
    }

    #[test]
    fn overrides_win_over_settings() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 15).unwrap();
        let (window, thresholds) = RunOverrides {
            window_days: Some(7),
            country: Some("nld".into()),
            min_impressions: Some(100),
            ..Default::default()
        }
        .resolve(&settings(), today);
        assert_eq!(window.days, 7);
        assert_eq!(window.end, today);
        assert_eq!(window.country.as_deref(), Some("nld"));
        assert_eq!(thresholds.min_impressions, 100);
        assert_eq!(thresholds.max_position, 50.0);
    }

    #[tokio::test]
    async fn fixture_run_scores_and_persists_every_cluster() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryOpportunityStore::default());
        let summary = pipeline(dir.path(), store.clone())
            .run_once(&january())
            .await
            .unwrap();

        assert_eq!(summary.raw_records, 7);
        assert_eq!(summary.aggregated_queries, 5);
        assert_eq!(summary.clusters_found, 4);
        assert_eq!(summary.opportunities_written, 4);
        assert!(summary.failed_writes.is_empty());
        assert!(summary.report_errors.is_empty());

        let deodorant = store.get("natural deodorant").await.unwrap().unwrap();
        assert_eq!(deodorant.impressions_30d, 800);
        assert_eq!(
            deodorant.related_product_id.as_deref(),
            Some("gid://shopify/Product/1001")
        );
        assert!(store.get("natural deodorant nl").await.unwrap().is_none());

        let skincare = store.get("zero waste skincare").await.unwrap().unwrap();
        assert_eq!(
            skincare.related_product_id.as_deref(),
            Some("gid://shopify/Product/1004")
        );

        let reports = PathBuf::from(&summary.reports_dir);
        assert!(reports.join("brief.md").exists());
        assert!(reports.join("opportunities.json").exists());
        assert!(reports.join("snapshots/opportunities.parquet").exists());
        assert!(PathBuf::from(&summary.parquet_manifest).exists());
        assert!(dir.path().join("archive").exists());
    }

    #[tokio::test]
    async fn rerun_updates_numbers_but_keeps_workflow_status() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryOpportunityStore::default());
        let pipeline = pipeline(dir.path(), store.clone());

        pipeline.run_once(&january()).await.unwrap();
        store
            .set_status("natural deodorant", OpportunityStatus::Completed)
            .await
            .unwrap();

        let second = pipeline.run_once(&january()).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 4);

        let row = store.get("natural deodorant").await.unwrap().unwrap();
        assert_eq!(row.status, OpportunityStatus::Completed);
    }

    #[tokio::test]
    async fn missing_source_file_fails_the_run_before_persisting() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryOpportunityStore::default());
        let pipeline = AnalysisPipeline::with_sources(
            AnalysisConfig::rooted_at(dir.path()),
            settings(),
            store.clone(),
            Box::new(FixtureSearchSource::new(fixtures_root().join("search-console/sample.json"))),
            Box::new(FixtureCatalogSource::new(dir.path().join("missing.json"))),
        );
        let err = pipeline.run_once(&january()).await.unwrap_err();
        assert!(format!("{err:#}").contains("fetching catalog"));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn real_run_requires_a_database() {
        let config = AnalysisConfig::rooted_at("/nonexistent");
        let err = match store_for_run(&config, StatusPolicy::Preserve, false).await {
            Ok(_) => panic!("expected an error without DATABASE_URL"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("DATABASE_URL"));

        let store = store_for_run(&config, StatusPolicy::Preserve, true).await.unwrap();
        assert!(store.get("anything").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn report_failure_after_persisting_keeps_the_written_count() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("reports-is-a-file");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let mut config = AnalysisConfig::rooted_at(dir.path());
        config.reports_dir = blocker;
        let store = Arc::new(MemoryOpportunityStore::default());
        let pipeline = AnalysisPipeline::with_sources(
            config,
            settings(),
            store.clone(),
            Box::new(FixtureSearchSource::new(fixtures_root().join("search-console/sample.json"))),
            Box::new(FixtureCatalogSource::new(fixtures_root().join("catalog/sample.json"))),
        );

        let summary = pipeline.run_once(&january()).await.unwrap();
        assert_eq!(summary.opportunities_written, 4);
        assert_eq!(store.len().await, 4);
        assert_eq!(summary.report_errors.len(), 2);
        assert!(summary.parquet_manifest.is_empty());
    }

    #[test]
    fn request_rate_becomes_a_token_bucket() {
        let mut config = AnalysisConfig::rooted_at(".");
        assert!(config.http_client_config().token_bucket.is_none());

        config.http_requests_per_sec = Some(4);
        let bucket = config.http_client_config().token_bucket.unwrap();
        assert_eq!(bucket.capacity, 4);
        assert_eq!(bucket.refill_every, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn digest_lists_recent_runs() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryOpportunityStore::default());
        let summary = pipeline(dir.path(), store).run_once(&january()).await.unwrap();

        let digest = report_recent_runs(5, &dir.path().join("reports")).unwrap();
        assert!(digest.contains(&summary.run_id.to_string()));
        assert!(digest.contains("top keyword: zero waste skincare"));
        assert!(digest.contains("clusters found: 4"));
    }

    #[test]
    fn digest_without_runs_is_not_an_error() {
        let dir = tempdir().unwrap();
        let digest = report_recent_runs(3, &dir.path().join("reports")).unwrap();
        assert!(digest.contains("no runs recorded"));
    }
}
